//! Helpers for OpenAI-compatible Chat Completions streams.
//!
//! Each SSE `data:` payload is mapped to [`DeltaFragment`]s: one for the
//! choice's text/role, one per `tool_calls` delta, and the finish reason on
//! the last fragment of the payload. Merging happens downstream in
//! [`crate::accumulator::ToolCallAccumulator`].

use {serde::Serialize, tracing::trace};

use crate::model::{DeltaFragment, StreamEvent, Usage};

/// Chat Completions API tool format (nested under "function").
///
/// ```json
/// { "type": "function", "function": { "name": "...", ... } }
/// ```
#[derive(Debug, Serialize)]
pub struct ChatCompletionsTool {
    #[serde(rename = "type")]
    pub tool_type: &'static str,
    pub function: ChatCompletionsFunction,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionsFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Wrap registry schemas (`{name, description, parameters}`) for the wire.
pub fn to_openai_tools(tools: &[serde_json::Value]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            let tool = ChatCompletionsTool {
                tool_type: "function",
                function: ChatCompletionsFunction {
                    name: t["name"].as_str().unwrap_or("").to_string(),
                    description: t["description"].as_str().unwrap_or("").to_string(),
                    parameters: t
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({"type": "object"})),
                },
            };
            serde_json::to_value(tool).unwrap_or_default()
        })
        .collect()
}

/// Result of processing a single SSE line.
#[derive(Debug, PartialEq)]
pub enum SseLineResult {
    /// No actionable event (keep-alive, unparsable payload).
    Skip,
    /// The `[DONE]` sentinel.
    Done,
    /// Events to yield.
    Events(Vec<StreamEvent>),
}

/// Process the payload of a single `data:` line.
pub fn process_openai_sse_line(data: &str) -> SseLineResult {
    let data = data.trim();
    if data == "[DONE]" {
        return SseLineResult::Done;
    }

    let Ok(evt) = serde_json::from_str::<serde_json::Value>(data) else {
        trace!(data, "skipping unparsable SSE payload");
        return SseLineResult::Skip;
    };

    if let Some(message) = evt["error"]["message"].as_str() {
        return SseLineResult::Events(vec![StreamEvent::Error(message.to_string())]);
    }

    let mut events = Vec::new();

    if let Some(choice) = evt["choices"].get(0) {
        let delta = &choice["delta"];
        let mut fragments = Vec::new();

        let role = delta["role"].as_str().map(str::to_string);
        let content = delta["content"]
            .as_str()
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        if role.is_some() || content.is_some() {
            fragments.push(DeltaFragment {
                role,
                content_piece: content,
                ..Default::default()
            });
        }

        if let Some(tcs) = delta["tool_calls"].as_array() {
            for (position, tc) in tcs.iter().enumerate() {
                let slot_index = tc["index"]
                    .as_u64()
                    .map_or(position, |i| i as usize);
                fragments.push(DeltaFragment::tool_call(
                    slot_index,
                    tc["id"].as_str(),
                    tc["function"]["name"].as_str(),
                    tc["function"]["arguments"].as_str(),
                ));
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            match fragments.last_mut() {
                Some(last) => last.finish_reason = Some(reason.to_string()),
                None => fragments.push(DeltaFragment::finish(reason)),
            }
        }

        events.extend(fragments.into_iter().map(StreamEvent::Fragment));
    }

    if let Some(u) = evt.get("usage").filter(|u| !u.is_null()) {
        events.push(StreamEvent::Usage(Usage {
            input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
        }));
    }

    if events.is_empty() {
        SseLineResult::Skip
    } else {
        SseLineResult::Events(events)
    }
}

/// Strip the `data:` field name from an SSE line, if present.
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))
}
