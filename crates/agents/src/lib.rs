//! Streaming tool-call engine: fragment accumulation, text fallback parsing,
//! thought splitting, tool execution and the conversation loop around them.

pub mod accumulator;
pub mod emitter;
pub mod error;
pub mod executor;
pub mod fallback;
pub mod history;
pub mod model;
pub mod model_cache;
pub mod providers;
pub mod runner;
pub mod splitter;
pub mod tool_registry;

pub use {
    accumulator::ToolCallAccumulator,
    emitter::StreamingResponseEmitter,
    error::{Error, Result},
    executor::ToolExecutor,
    fallback::FormatFallbackParser,
    model::{ChatMessage, DeltaFragment, LlmProvider, StreamEvent, ToolCall, ToolResult},
    model_cache::{ModelCache, ModelKey},
    runner::{AgentRunError, ConversationLoop, LoopSettings, RunnerEvent},
    splitter::ThoughtContentSplitter,
    tool_registry::{AgentTool, ToolError, ToolRegistry, TypedTool},
};

/// Shared HTTP client for model backends.
///
/// Reusing one `reqwest::Client` keeps a single connection pool for every
/// provider instance, including the ones created on a model switch.
pub fn shared_http_client() -> &'static reqwest::Client {
    static CLIENT: std::sync::LazyLock<reqwest::Client> =
        std::sync::LazyLock::new(reqwest::Client::new);
    &CLIENT
}
