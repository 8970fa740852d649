use std::{sync::Arc, time::Duration};

use {
    futures::StreamExt,
    tracing::{debug, info, warn},
};

use crate::{
    accumulator::{ToolCallAccumulator, TurnOutput},
    executor::ToolExecutor,
    fallback::FormatFallbackParser,
    history::MessageHistory,
    model::{ChatMessage, LlmProvider, StreamEvent, Usage},
    splitter::{
        DEFAULT_THOUGHT_END, DEFAULT_THOUGHT_START, Segment, SegmentKind, ThoughtContentSplitter,
        split_all,
    },
    tool_registry::ToolRegistry,
};

/// Fallback loop limit when config is missing or invalid.
pub const DEFAULT_AGENT_MAX_ITERATIONS: usize = 25;

/// Counter of tool calls recovered from model text.
#[cfg(feature = "metrics")]
pub const FALLBACK_CALLS_TOTAL: &str = "toolstream_fallback_tool_calls_total";

/// Default overall deadline for one model call.
pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(60);

fn resolve_agent_max_iterations(configured: usize) -> usize {
    if configured == 0 {
        warn!(
            default = DEFAULT_AGENT_MAX_ITERATIONS,
            "tools.max_iterations was 0; falling back to default"
        );
        return DEFAULT_AGENT_MAX_ITERATIONS;
    }
    configured
}

/// Typed error for a user turn that could not be completed.
#[derive(Debug, thiserror::Error)]
pub enum AgentRunError {
    /// The model stream reported a failure.
    #[error("model stream failed: {0}")]
    Transport(String),
    /// The model call did not finish within the deadline.
    #[error("model call timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    /// The model kept requesting tools past the iteration limit.
    #[error("no final answer after {0} model turns")]
    MaxIterations(usize),
}

impl AgentRunError {
    /// Transport-class failures (stream error or deadline).
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// Events emitted during a user turn.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    /// Model call in flight (show a "thinking" indicator).
    Thinking,
    /// Model call finished (hide the indicator).
    ThinkingDone,
    /// Text the model marked as reasoning.
    ThinkingText(String),
    /// User-facing text.
    TextDelta(String),
    ToolCallStart {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolCallEnd {
        id: String,
        name: String,
        success: bool,
        content: String,
    },
    /// Tool calls were recovered from model text.
    FallbackUsed { count: usize },
    Iteration(usize),
}

/// Callback for streaming events out of the runner.
pub type OnEvent = Box<dyn Fn(RunnerEvent) + Send + Sync>;

fn emit(on_event: Option<&OnEvent>, event: RunnerEvent) {
    if let Some(cb) = on_event {
        cb(event);
    }
}

/// Knobs for a [`ConversationLoop`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_iterations: usize,
    pub turn_timeout: Duration,
    /// Keep narration text on assistant messages that also carry tool calls.
    pub keep_content_with_tool_calls: bool,
    /// Scan text for embedded tool calls when none arrived structurally.
    pub fallback_parsing: bool,
    pub thought_start_tag: String,
    pub thought_end_tag: String,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_AGENT_MAX_ITERATIONS,
            turn_timeout: DEFAULT_TURN_TIMEOUT,
            keep_content_with_tool_calls: true,
            fallback_parsing: true,
            thought_start_tag: DEFAULT_THOUGHT_START.into(),
            thought_end_tag: DEFAULT_THOUGHT_END.into(),
        }
    }
}

impl LoopSettings {
    pub fn from_config(config: &toolstream_config::ToolstreamConfig) -> Self {
        Self {
            max_iterations: resolve_agent_max_iterations(config.tools.max_iterations),
            turn_timeout: Duration::from_secs(config.provider.timeout_secs.max(1)),
            keep_content_with_tool_calls: config.chat.keep_content_with_tool_calls,
            fallback_parsing: config.chat.fallback_parsing,
            thought_start_tag: config.chat.thought_start_tag.clone(),
            thought_end_tag: config.chat.thought_end_tag.clone(),
        }
    }
}

/// Where the loop is in handling a user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingUserInput,
    ModelTurn,
    ToolExecution,
}

/// Outcome of one user turn.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TurnSummary {
    /// Final user-facing text, reasoning removed.
    pub text: String,
    pub iterations: usize,
    pub tool_calls_made: usize,
    /// Sum of usage across all model calls of the turn.
    pub usage: Usage,
}

/// Whether `input` asks to leave the conversation.
#[must_use]
pub fn is_exit_command(input: &str) -> bool {
    matches!(input.trim().to_ascii_lowercase().as_str(), "exit" | "quit")
}

/// Drives model turns and tool execution for one conversation.
pub struct ConversationLoop {
    provider: Arc<dyn LlmProvider>,
    executor: ToolExecutor,
    fallback: FormatFallbackParser,
    settings: LoopSettings,
    history: MessageHistory,
    state: LoopState,
}

impl ConversationLoop {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        system_prompt: &str,
        settings: LoopSettings,
    ) -> Self {
        Self {
            provider,
            executor: ToolExecutor::new(tools),
            fallback: FormatFallbackParser::new(),
            settings,
            history: MessageHistory::with_system_prompt(system_prompt),
            state: LoopState::AwaitingUserInput,
        }
    }

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    /// Swap the model for subsequent turns. History is kept.
    pub fn set_provider(&mut self, provider: Arc<dyn LlmProvider>) {
        info!(model = provider.id(), "switching model");
        self.provider = provider;
    }

    /// Handle one line of user input through to a final answer.
    ///
    /// Tool calls are executed and fed back until a model turn produces none.
    /// A transport failure ends the turn early; the loop is back to awaiting
    /// input either way.
    pub async fn submit(
        &mut self,
        input: &str,
        on_event: Option<&OnEvent>,
    ) -> Result<TurnSummary, AgentRunError> {
        let message = ChatMessage::user(input);
        if message.is_empty() {
            debug!("nothing to send for this input");
            return Ok(TurnSummary::default());
        }
        // A repeat of the last input (e.g. after a failed turn) is not
        // recorded twice but still gets a fresh model turn.
        self.history.append(message);
        self.state = LoopState::ModelTurn;
        let result = self.run_until_answer(on_event).await;
        self.state = LoopState::AwaitingUserInput;
        if let Err(e) = &result {
            warn!(error = %e, "turn aborted");
        }
        result
    }

    async fn run_until_answer(
        &mut self,
        on_event: Option<&OnEvent>,
    ) -> Result<TurnSummary, AgentRunError> {
        let mut summary = TurnSummary::default();

        loop {
            summary.iterations += 1;
            if summary.iterations > self.settings.max_iterations {
                return Err(AgentRunError::MaxIterations(self.settings.max_iterations));
            }
            emit(on_event, RunnerEvent::Iteration(summary.iterations));

            self.state = LoopState::ModelTurn;
            emit(on_event, RunnerEvent::Thinking);
            let turn = self.model_turn(on_event).await;
            emit(on_event, RunnerEvent::ThinkingDone);
            let (turn, usage) = turn?;
            summary.usage.input_tokens =
                summary.usage.input_tokens.saturating_add(usage.input_tokens);
            summary.usage.output_tokens =
                summary.usage.output_tokens.saturating_add(usage.output_tokens);

            let TurnOutput {
                content,
                mut tool_calls,
                finish_reason,
                ..
            } = turn;
            info!(
                iteration = summary.iterations,
                has_text = !content.is_empty(),
                tool_calls_count = tool_calls.len(),
                finish_reason = finish_reason.as_deref().unwrap_or("none"),
                "model turn complete"
            );

            if tool_calls.is_empty()
                && self.settings.fallback_parsing
                && !content.trim().is_empty()
                && let Some(found) = self.fallback.extract(&content)
            {
                if !found.is_empty() {
                    info!(count = found.len(), "parsed tool calls from text fallback");
                    #[cfg(feature = "metrics")]
                    metrics::counter!(FALLBACK_CALLS_TOTAL).increment(found.len() as u64);
                    emit(on_event, RunnerEvent::FallbackUsed { count: found.len() });
                }
                tool_calls = found;
            }

            let keep_content = tool_calls.is_empty() || self.settings.keep_content_with_tool_calls;
            let message_content = (keep_content && !content.is_empty()).then(|| content.clone());
            self.history.append(ChatMessage::assistant_with_tools(
                message_content,
                tool_calls.clone(),
            ));

            if tool_calls.is_empty() {
                summary.text = visible_text(
                    &content,
                    &self.settings.thought_start_tag,
                    &self.settings.thought_end_tag,
                );
                return Ok(summary);
            }

            self.state = LoopState::ToolExecution;
            for tc in &tool_calls {
                emit(on_event, RunnerEvent::ToolCallStart {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                });
            }
            let results = self.executor.execute(&tool_calls).await;
            summary.tool_calls_made += results.len();
            for result in results {
                emit(on_event, RunnerEvent::ToolCallEnd {
                    id: result.tool_call_id.clone(),
                    name: result.name.clone(),
                    success: !result.is_error(),
                    content: result.content.clone(),
                });
                self.history.append(result.into_message());
            }
        }
    }

    /// One model call, consumed to completion under the turn deadline.
    async fn model_turn(
        &self,
        on_event: Option<&OnEvent>,
    ) -> Result<(TurnOutput, Usage), AgentRunError> {
        let deadline = self.settings.turn_timeout;
        let messages = self.history.to_vec();
        let schemas = self.executor.registry().list_schemas();

        let consume = async {
            let mut stream = self.provider.stream_with_tools(messages, schemas);
            let mut accumulator = ToolCallAccumulator::new();
            let mut splitter = ThoughtContentSplitter::new(
                self.settings.thought_start_tag.as_str(),
                self.settings.thought_end_tag.as_str(),
            );
            let mut usage = Usage::default();

            while let Some(event) = stream.next().await {
                match event {
                    StreamEvent::Fragment(fragment) => {
                        if let Some(text) = &fragment.content_piece {
                            for segment in splitter.feed(text) {
                                emit_segment(on_event, segment);
                            }
                        }
                        accumulator.ingest(&fragment);
                    },
                    StreamEvent::Usage(u) => usage = u,
                    StreamEvent::Error(msg) => return Err(AgentRunError::Transport(msg)),
                }
            }
            if let Some(segment) = splitter.flush() {
                emit_segment(on_event, segment);
            }
            if accumulator.finish_reason().is_none() {
                warn!(model = self.provider.id(), "model stream ended without a finish reason");
            }
            Ok((accumulator.into_turn(), usage))
        };

        match tokio::time::timeout(deadline, consume).await {
            Ok(result) => result,
            Err(_) => Err(AgentRunError::Timeout(deadline)),
        }
    }
}

fn emit_segment(on_event: Option<&OnEvent>, segment: Segment) {
    let event = match segment.kind {
        SegmentKind::Thought => RunnerEvent::ThinkingText(segment.text),
        SegmentKind::Content => RunnerEvent::TextDelta(segment.text),
    };
    emit(on_event, event);
}

fn visible_text(content: &str, start_tag: &str, end_tag: &str) -> String {
    split_all(content, start_tag, end_tag)
        .into_iter()
        .filter(|s| s.kind == SegmentKind::Content)
        .map(|s| s.text)
        .collect::<String>()
        .trim()
        .to_string()
}
