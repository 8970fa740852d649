use std::{io::Write, sync::Arc};

use {
    anyhow::Result,
    tokio::io::{AsyncBufReadExt, BufReader},
    toolstream_agents::{
        ConversationLoop, LlmProvider, LoopSettings, ModelCache, ModelKey, RunnerEvent,
        providers::OpenAiCompatProvider,
        runner::{OnEvent, is_exit_command},
    },
    toolstream_config::{ProviderConfig, ToolstreamConfig},
    tracing::info,
};

use crate::tools::demo_registry;

const DIM: &str = "\x1b[2m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Interactive REPL: one [`ConversationLoop`] for the whole session.
pub async fn run(config: ToolstreamConfig) -> Result<()> {
    let tools = Arc::new(demo_registry()?);
    let cache = ModelCache::<OpenAiCompatProvider>::new();
    let provider = connect(&cache, &config.provider, &config.provider.model).await?;

    let settings = LoopSettings::from_config(&config);
    let mut conversation =
        ConversationLoop::new(provider, tools, &config.chat.system_prompt, settings);
    let on_event: OnEvent = Box::new(print_event);

    eprintln!(
        "Chatting with {} at {}. Type 'exit' to quit, '/model <id>' to switch models.",
        config.provider.model, config.provider.base_url
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("You: ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if is_exit_command(input) {
            break;
        }
        if let Some(rest) = input.strip_prefix("/model") {
            let model_id = rest.trim();
            if model_id.is_empty() {
                eprintln!("current model: {}", conversation.provider().id());
                continue;
            }
            match connect(&cache, &config.provider, model_id).await {
                Ok(provider) => conversation.set_provider(provider),
                Err(e) => eprintln!("{RED}could not switch model: {e:#}{RESET}"),
            }
            continue;
        }

        match conversation.submit(input, Some(&on_event)).await {
            Ok(summary) if !summary.text.is_empty() => {
                println!("Assistant: {}", summary.text);
                info!(
                    iterations = summary.iterations,
                    tool_calls = summary.tool_calls_made,
                    input_tokens = summary.usage.input_tokens,
                    output_tokens = summary.usage.output_tokens,
                    "turn complete"
                );
            },
            Ok(_) => {},
            Err(e) => eprintln!("{RED}error: {e}{RESET}"),
        }
    }

    eprintln!("Bye.");
    Ok(())
}

/// Provider for `model_id`, reusing the cached one when the key matches.
async fn connect(
    cache: &ModelCache<OpenAiCompatProvider>,
    provider_config: &ProviderConfig,
    model_id: &str,
) -> Result<Arc<OpenAiCompatProvider>> {
    let key = ModelKey::new(model_id, provider_config.adapter_path.clone());
    let base = provider_config.clone();
    cache
        .get_or_load(key, |key| async move {
            let config = ProviderConfig {
                model: key.model_id,
                adapter_path: key.adapter_path,
                ..base
            };
            Ok::<_, anyhow::Error>(Arc::new(OpenAiCompatProvider::from_config(&config)))
        })
        .await
}

fn print_event(event: RunnerEvent) {
    match event {
        RunnerEvent::ThinkingText(text) => eprintln!("{DIM}{text}{RESET}"),
        RunnerEvent::ToolCallStart {
            name, arguments, ..
        } => eprintln!("{CYAN}-> {name}({arguments}){RESET}"),
        RunnerEvent::ToolCallEnd {
            name,
            success,
            content,
            ..
        } => {
            let color = if success { DIM } else { RED };
            eprintln!("{color}<- {name}: {content}{RESET}");
        },
        RunnerEvent::FallbackUsed { count } => {
            eprintln!("{DIM}({count} tool call(s) recovered from text){RESET}");
        },
        RunnerEvent::Thinking
        | RunnerEvent::ThinkingDone
        | RunnerEvent::TextDelta(_)
        | RunnerEvent::Iteration(_) => {},
    }
}
