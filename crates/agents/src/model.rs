use std::pin::Pin;

use {
    serde::{Deserialize, Serialize},
    tokio_stream::Stream,
};

// ── Typed chat messages ─────────────────────────────────────────────────────

/// Typed chat message for the LLM provider interface.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        name: String,
        content: String,
    },
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    /// Create an assistant message with text only (no tool calls).
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            tool_calls: vec![],
        }
    }

    /// Create an assistant message with tool calls (and optional text).
    pub fn assistant_with_tools(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant {
            content,
            tool_calls,
        }
    }

    /// Create a tool result message.
    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    /// A message with nothing to say: no text and no tool calls.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            ChatMessage::System { content } | ChatMessage::User { content } => {
                content.trim().is_empty()
            },
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => tool_calls.is_empty() && content.as_deref().is_none_or(|c| c.trim().is_empty()),
            ChatMessage::Tool { content, .. } => content.is_empty(),
        }
    }

    /// Convert to OpenAI-compatible JSON format.
    #[must_use]
    pub fn to_openai_value(&self) -> serde_json::Value {
        match self {
            ChatMessage::System { content } => {
                serde_json::json!({ "role": "system", "content": content })
            },
            ChatMessage::User { content } => {
                serde_json::json!({ "role": "user", "content": content })
            },
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                if tool_calls.is_empty() {
                    serde_json::json!({
                        "role": "assistant",
                        "content": content.as_deref().unwrap_or(""),
                    })
                } else {
                    let tc_json: Vec<serde_json::Value> =
                        tool_calls.iter().map(ToolCall::to_openai_value).collect();
                    serde_json::json!({
                        "role": "assistant",
                        "content": content,
                        "tool_calls": tc_json,
                    })
                }
            },
            ChatMessage::Tool {
                tool_call_id,
                name,
                content,
            } => {
                serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "name": name,
                    "content": content,
                })
            },
        }
    }
}

// ── Tool calls and results ──────────────────────────────────────────────────

/// A tool invocation requested by the model.
///
/// `arguments` is either a raw JSON string (structured streaming path) or an
/// already-parsed object (text fallback path).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Arguments as the JSON string the Chat Completions wire format expects.
    #[must_use]
    pub fn arguments_string(&self) -> String {
        match &self.arguments {
            serde_json::Value::String(raw) => raw.clone(),
            other => other.to_string(),
        }
    }

    #[must_use]
    pub fn to_openai_value(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "type": "function",
            "function": {
                "name": self.name,
                "arguments": self.arguments_string(),
            }
        })
    }
}

/// Outcome of one tool call. `content` is always JSON: the tool's return value
/// or an `{"error": "..."}` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
}

impl ToolResult {
    #[must_use]
    pub fn is_error(&self) -> bool {
        serde_json::from_str::<serde_json::Value>(&self.content)
            .ok()
            .and_then(|v| v.get("error").map(|e| e.is_string()))
            .unwrap_or(false)
    }

    #[must_use]
    pub fn into_message(self) -> ChatMessage {
        ChatMessage::Tool {
            tool_call_id: self.tool_call_id,
            name: self.name,
            content: self.content,
        }
    }
}

// ── Stream events ───────────────────────────────────────────────────────────

/// One incremental unit of a streamed model turn.
///
/// Tool-call pieces are keyed by `slot_index`; text arrives in
/// `content_piece`. The final fragment of a turn carries `finish_reason`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaFragment {
    pub slot_index: usize,
    pub id: Option<String>,
    pub function_name_piece: Option<String>,
    pub function_args_piece: Option<String>,
    pub content_piece: Option<String>,
    pub role: Option<String>,
    pub finish_reason: Option<String>,
}

impl DeltaFragment {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content_piece: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn tool_call(
        slot_index: usize,
        id: Option<&str>,
        name_piece: Option<&str>,
        args_piece: Option<&str>,
    ) -> Self {
        Self {
            slot_index,
            id: id.map(str::to_string),
            function_name_piece: name_piece.map(str::to_string),
            function_args_piece: args_piece.map(str::to_string),
            ..Default::default()
        }
    }

    /// Whether this fragment contributes to a tool-call slot.
    #[must_use]
    pub fn carries_tool_call(&self) -> bool {
        self.id.is_some() || self.function_name_piece.is_some() || self.function_args_piece.is_some()
    }
}

/// Events emitted during a streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Fragment(DeltaFragment),
    /// Token accounting, when the backend reports it.
    Usage(Usage),
    /// Transport or protocol failure. Nothing follows it.
    Error(String),
}

/// Model-streaming interface.
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Model identifier (e.g. "mlx-community/Qwen2.5-7B-Instruct-1M-4bit").
    fn id(&self) -> &str;

    /// Stream a completion for `messages`, declaring `tools` (schemas as
    /// produced by [`crate::tool_registry::ToolRegistry::list_schemas`]).
    fn stream_with_tools(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<serde_json::Value>,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}
