mod chat_commands;
mod emit_commands;
mod tools;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(
    name = "toolstream",
    version,
    about = "Streaming tool-calling chat against OpenAI-compatible local models"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: ./toolstream.toml, then the user config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, env = "TOOLSTREAM_LOG", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Model id (overrides config value).
    #[arg(long, global = true)]
    model: Option<String>,

    /// Base URL of the OpenAI-compatible API (overrides config value).
    #[arg(long, global = true)]
    base_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat with tool calling (default).
    Chat,
    /// Send one message and print the response as SSE frames.
    Emit {
        #[arg(short, long)]
        message: String,
        /// Print a single JSON response instead of SSE frames.
        #[arg(long)]
        no_stream: bool,
    },
    /// Print the declared tool schemas.
    Tools,
}

/// Logs go to stderr; stdout carries the conversation or the SSE frames.
fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<toolstream_config::ToolstreamConfig> {
    let mut config = match &cli.config {
        Some(path) => toolstream_config::load_config(path)?,
        None => toolstream_config::discover_and_load(),
    };
    if let Some(model) = &cli.model {
        config.provider.model = model.clone();
    }
    if let Some(base_url) = &cli.base_url {
        config.provider.base_url = base_url.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "toolstream starting");
    let config = load_config(&cli)?;

    match cli.command {
        None | Some(Commands::Chat) => chat_commands::run(config).await,
        Some(Commands::Emit { message, no_stream }) => {
            emit_commands::run(config, message, no_stream).await
        },
        Some(Commands::Tools) => {
            let registry = tools::demo_registry()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&registry.list_schemas())?
            );
            Ok(())
        },
    }
}
