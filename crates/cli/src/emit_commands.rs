use std::io::Write;

use {
    anyhow::Result,
    futures::StreamExt,
    tokio_util::sync::CancellationToken,
    toolstream_agents::{
        ChatMessage, LlmProvider, LoopSettings, StreamingResponseEmitter,
        emitter::{DONE_FRAME, error_frame},
        providers::OpenAiCompatProvider,
    },
    toolstream_config::ToolstreamConfig,
    tracing::warn,
};

use crate::tools::demo_registry;

/// Send one message and print the response as a server would serve it.
pub async fn run(config: ToolstreamConfig, message: String, no_stream: bool) -> Result<()> {
    let tools = demo_registry()?;
    let provider = OpenAiCompatProvider::from_config(&config.provider);
    let settings = LoopSettings::from_config(&config);
    let emitter = StreamingResponseEmitter::from_settings(provider.id(), &settings);

    let messages = vec![
        ChatMessage::system(config.chat.system_prompt.as_str()),
        ChatMessage::user(message),
    ];
    let events = provider.stream_with_tools(messages, tools.list_schemas());

    if no_stream {
        let collect = emitter.collect_completion(events);
        let response = tokio::time::timeout(settings.turn_timeout, collect)
            .await
            .map_err(|_| anyhow::anyhow!("model call timed out"))??;
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut frames = emitter.stream(events, cancel);
    let mut stdout = std::io::stdout();
    let forward = async {
        while let Some(frame) = frames.next().await {
            stdout.write_all(frame.as_bytes())?;
            stdout.flush()?;
        }
        Ok::<_, std::io::Error>(())
    };
    match tokio::time::timeout(settings.turn_timeout, forward).await {
        Ok(written) => written?,
        Err(_) => {
            warn!(
                timeout_secs = settings.turn_timeout.as_secs(),
                "model call timed out"
            );
            let mut stdout = std::io::stdout();
            stdout.write_all(error_frame("model call timed out").as_bytes())?;
            stdout.write_all(DONE_FRAME.as_bytes())?;
        },
    }
    Ok(())
}
