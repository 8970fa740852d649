use std::pin::Pin;

use {
    futures::StreamExt,
    secrecy::ExposeSecret,
    tokio_stream::Stream,
    tracing::{debug, trace},
};

use {
    super::openai_compat::{SseLineResult, process_openai_sse_line, sse_data, to_openai_tools},
    crate::model::{ChatMessage, LlmProvider, StreamEvent},
};

/// Streaming client for any OpenAI-compatible `/chat/completions` endpoint
/// (mlx, vLLM, llama.cpp server, OpenAI itself).
pub struct OpenAiCompatProvider {
    api_key: secrecy::Secret<String>,
    model: String,
    base_url: String,
    temperature: Option<f32>,
    adapter_path: Option<String>,
    client: &'static reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(api_key: secrecy::Secret<String>, model: String, base_url: String) -> Self {
        Self {
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            temperature: None,
            adapter_path: None,
            client: crate::shared_http_client(),
        }
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// LoRA adapter for servers that load one per request (mlx).
    #[must_use]
    pub fn with_adapter_path(mut self, adapter_path: Option<String>) -> Self {
        self.adapter_path = adapter_path;
        self
    }

    pub fn from_config(config: &toolstream_config::ProviderConfig) -> Self {
        Self::new(
            config.api_key.clone(),
            config.model.clone(),
            config.base_url.clone(),
        )
        .with_temperature(config.temperature)
        .with_adapter_path(config.adapter_path.clone())
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
    ) -> serde_json::Value {
        let openai_messages: Vec<serde_json::Value> =
            messages.iter().map(ChatMessage::to_openai_value).collect();
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": openai_messages,
            "stream": true,
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(adapter_path) = &self.adapter_path {
            body["adapter_path"] = serde_json::json!(adapter_path);
        }
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(to_openai_tools(tools));
            body["tool_choice"] = serde_json::Value::String("auto".into());
        }
        body
    }
}

impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compat"
    }

    fn id(&self) -> &str {
        &self.model
    }

    fn stream_with_tools(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<serde_json::Value>,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
        Box::pin(async_stream::stream! {
            let body = self.request_body(&messages, &tools);
            debug!(
                model = %self.model,
                messages_count = messages.len(),
                tools_count = tools.len(),
                "openai-compat stream_with_tools request"
            );
            trace!(body = %body, "openai-compat stream request body");

            let resp = match self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(self.api_key.expose_secret())
                .json(&body)
                .send()
                .await
            {
                Ok(r) => {
                    if let Err(e) = r.error_for_status_ref() {
                        let status = e.status().map(|s| s.as_u16()).unwrap_or(0);
                        let body_text = r.text().await.unwrap_or_default();
                        yield StreamEvent::Error(format!("HTTP {status}: {body_text}"));
                        return;
                    }
                    r
                },
                Err(e) => {
                    yield StreamEvent::Error(e.to_string());
                    return;
                },
            };

            let mut byte_stream = resp.bytes_stream();
            // Raw bytes: a read may end inside a multibyte character.
            let mut buf: Vec<u8> = Vec::new();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield StreamEvent::Error(e.to_string());
                        return;
                    },
                };
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw);

                    let Some(data) = sse_data(line.trim()) else {
                        continue;
                    };
                    match process_openai_sse_line(data) {
                        SseLineResult::Done => return,
                        SseLineResult::Events(events) => {
                            for event in events {
                                yield event;
                            }
                        },
                        SseLineResult::Skip => {},
                    }
                }
            }

            // Some servers close without [DONE] or a trailing newline.
            let rest = String::from_utf8_lossy(&buf);
            if let Some(data) = sse_data(rest.trim())
                && let SseLineResult::Events(events) = process_openai_sse_line(data)
            {
                for event in events {
                    yield event;
                }
            }
        })
    }
}
