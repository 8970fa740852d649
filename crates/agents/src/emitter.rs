//! Chat Completions output for serving a model stream downstream.
//!
//! [`StreamingResponseEmitter`] consumes one model stream and renders it as
//! SSE frames (`data: <chunk>\n\n`, closed by `data: [DONE]\n\n`), with
//! reasoning split out into `reasoning_content` and tool calls aggregated
//! into a single chunk at the end. Nothing is executed and no second model
//! turn happens here.
//!
//! Content is forwarded as it settles, except from the first tool-call
//! marker onward: that tail is held until the stream ends, then either
//! replaced by the recovered `tool_calls` chunk or released as text.

use std::{
    pin::Pin,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    futures::StreamExt,
    serde::{Deserialize, Serialize},
    tokio_stream::Stream,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    accumulator::{FINISH_TOOL_CALLS, ToolCallAccumulator},
    fallback::FormatFallbackParser,
    model::{StreamEvent, ToolCall, Usage},
    runner::{AgentRunError, LoopSettings},
    splitter::{
        DEFAULT_THOUGHT_END, DEFAULT_THOUGHT_START, Segment, SegmentKind, ThoughtContentSplitter,
        partial_prefix_len, split_all,
    },
};

/// Terminates every SSE response.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

const CHUNK_OBJECT: &str = "chat.completion.chunk";
const COMPLETION_OBJECT: &str = "chat.completion";

/// Streaming chunk envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Exactly one of the optional fields is populated per chunk, except for
/// the closing chunk which carries none.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

impl ChunkDelta {
    fn from_segment(segment: Segment) -> Self {
        match segment.kind {
            SegmentKind::Thought => Self {
                reasoning_content: Some(segment.text),
                ..Default::default()
            },
            SegmentKind::Content => Self {
                content: Some(segment.text),
                ..Default::default()
            },
        }
    }
}

/// Tool call as it appears in a chunk or response message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    pub index: usize,
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: WireFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

fn wire_tool_calls(calls: &[ToolCall]) -> Vec<WireToolCall> {
    calls
        .iter()
        .enumerate()
        .map(|(index, call)| WireToolCall {
            index,
            id: call.id.clone(),
            call_type: "function".into(),
            function: WireFunction {
                name: call.name.clone(),
                arguments: call.arguments_string(),
            },
        })
        .collect()
}

/// Non-streaming response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ResponseChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<CompletionUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseChoice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl From<Usage> for CompletionUsage {
    fn from(u: Usage) -> Self {
        Self {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: u.input_tokens.saturating_add(u.output_tokens),
        }
    }
}

/// Render a payload as one SSE frame.
pub fn sse_frame<T: Serialize>(payload: &T) -> String {
    match serde_json::to_string(payload) {
        Ok(json) => format!("data: {json}\n\n"),
        Err(e) => error_frame(&format!("failed to encode chunk: {e}")),
    }
}

/// `data: {"error":{"message":...}}` frame.
pub fn error_frame(message: &str) -> String {
    let payload = serde_json::json!({ "error": { "message": message } });
    format!("data: {payload}\n\n")
}

/// Holds content from the first tool-call marker onward.
#[derive(Debug, Default)]
struct MarkupGate {
    openings: Vec<&'static str>,
    /// Tail that may still grow into a marker.
    partial: String,
    held: Option<String>,
}

impl MarkupGate {
    fn new(parser: Option<&FormatFallbackParser>) -> Self {
        Self {
            openings: parser.map(|p| p.openings().collect()).unwrap_or_default(),
            ..Default::default()
        }
    }

    /// Accept content and return the part that can be sent now.
    fn pass(&mut self, text: &str) -> String {
        if let Some(held) = &mut self.held {
            held.push_str(text);
            return String::new();
        }
        let mut buf = std::mem::take(&mut self.partial);
        buf.push_str(text);
        if let Some(at) = self.openings.iter().filter_map(|o| buf.find(o)).min() {
            self.held = Some(buf.split_off(at));
            return buf;
        }
        let keep = self
            .openings
            .iter()
            .map(|o| partial_prefix_len(&buf, o))
            .max()
            .unwrap_or(0);
        self.partial = buf.split_off(buf.len() - keep);
        buf
    }

    /// Give up on the pending marker prefix.
    fn release_partial(&mut self) -> String {
        std::mem::take(&mut self.partial)
    }

    fn take_held(&mut self) -> Option<String> {
        self.held.take()
    }

    /// Deltas for one splitter segment, in order.
    fn deltas(&mut self, segment: Segment) -> Vec<ChunkDelta> {
        let mut out = Vec::new();
        match segment.kind {
            SegmentKind::Thought => {
                let partial = self.release_partial();
                if !partial.is_empty() {
                    out.push(ChunkDelta::from_segment(Segment::content(partial)));
                }
                out.push(ChunkDelta::from_segment(segment));
            },
            SegmentKind::Content => {
                let ready = self.pass(&segment.text);
                if !ready.is_empty() {
                    out.push(ChunkDelta::from_segment(Segment::content(ready)));
                }
            },
        }
        out
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Turns one model stream into Chat Completions output.
///
/// One emitter corresponds to one response: every chunk it produces shares
/// the same `id` and `created` timestamp.
pub struct StreamingResponseEmitter {
    completion_id: String,
    created: u64,
    model: String,
    thought_start_tag: String,
    thought_end_tag: String,
    fallback: Option<FormatFallbackParser>,
    keep_content_with_tool_calls: bool,
}

impl StreamingResponseEmitter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            completion_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: unix_now(),
            model: model.into(),
            thought_start_tag: DEFAULT_THOUGHT_START.into(),
            thought_end_tag: DEFAULT_THOUGHT_END.into(),
            fallback: Some(FormatFallbackParser::new()),
            keep_content_with_tool_calls: true,
        }
    }

    /// Same thought tags, fallback switch and content policy as a
    /// [`crate::runner::ConversationLoop`].
    pub fn from_settings(model: impl Into<String>, settings: &LoopSettings) -> Self {
        Self::new(model)
            .with_thought_tags(&settings.thought_start_tag, &settings.thought_end_tag)
            .with_fallback_parsing(settings.fallback_parsing)
            .with_content_alongside_tool_calls(settings.keep_content_with_tool_calls)
    }

    #[must_use]
    pub fn with_thought_tags(mut self, start: &str, end: &str) -> Self {
        self.thought_start_tag = start.to_string();
        self.thought_end_tag = end.to_string();
        self
    }

    #[must_use]
    pub fn with_fallback_parsing(mut self, enabled: bool) -> Self {
        self.fallback = enabled.then(FormatFallbackParser::new);
        self
    }

    /// Whether text is sent next to tool calls. Text already streamed
    /// before the calls were known cannot be withdrawn; this governs the
    /// held tail and the non-streaming message.
    #[must_use]
    pub fn with_content_alongside_tool_calls(mut self, keep: bool) -> Self {
        self.keep_content_with_tool_calls = keep;
        self
    }

    pub fn completion_id(&self) -> &str {
        &self.completion_id
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.completion_id.clone(),
            object: CHUNK_OBJECT.into(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    fn frame(&self, delta: ChunkDelta, finish_reason: Option<String>) -> String {
        sse_frame(&self.chunk(delta, finish_reason))
    }

    /// Structured calls, or calls recovered from `content` when none came.
    fn resolve_tool_calls(&self, structured: Vec<ToolCall>, content: &str) -> Vec<ToolCall> {
        if !structured.is_empty() || content.trim().is_empty() {
            return structured;
        }
        match self.fallback.as_ref().and_then(|p| p.extract(content)) {
            Some(found) => {
                if !found.is_empty() {
                    debug!(count = found.len(), "emitter recovered tool calls from text");
                }
                found
            },
            None => structured,
        }
    }

    /// Held markup goes out as text unless it became tool calls, or text is
    /// suppressed next to calls.
    fn release_held(&self, had_structured: bool, tool_calls: &[ToolCall]) -> bool {
        tool_calls.is_empty() || (had_structured && self.keep_content_with_tool_calls)
    }

    /// Stream SSE frames for `events`.
    ///
    /// Thought and content segments are emitted as soon as the splitter
    /// resolves them. Once the model stream ends, any tool calls go out in
    /// one chunk, then the closing chunk and [`DONE_FRAME`]. A model error
    /// becomes an error frame followed by [`DONE_FRAME`]. Cancelling `cancel`
    /// stops consumption and ends the stream without further frames.
    pub fn stream<'a>(
        &'a self,
        events: Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'a>>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Stream<Item = String> + Send + 'a>> {
        Box::pin(async_stream::stream! {
            let mut events = events;
            let mut accumulator = ToolCallAccumulator::new();
            let mut splitter = ThoughtContentSplitter::new(
                self.thought_start_tag.as_str(),
                self.thought_end_tag.as_str(),
            );
            let mut gate = MarkupGate::new(self.fallback.as_ref());

            yield self.frame(
                ChunkDelta {
                    role: Some("assistant".into()),
                    ..Default::default()
                },
                None,
            );

            loop {
                let next = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    event = events.next() => Some(event),
                };
                let Some(next) = next else {
                    debug!(id = %self.completion_id, "response stream cancelled");
                    return;
                };
                let Some(event) = next else {
                    break;
                };
                match event {
                    StreamEvent::Fragment(fragment) => {
                        if let Some(text) = &fragment.content_piece {
                            for segment in splitter.feed(text) {
                                for delta in gate.deltas(segment) {
                                    yield self.frame(delta, None);
                                }
                            }
                        }
                        accumulator.ingest(&fragment);
                    },
                    StreamEvent::Usage(_) => {},
                    StreamEvent::Error(message) => {
                        warn!(id = %self.completion_id, error = %message, "model stream failed");
                        yield error_frame(&message);
                        yield DONE_FRAME.to_string();
                        return;
                    },
                }
            }

            if let Some(segment) = splitter.flush() {
                for delta in gate.deltas(segment) {
                    yield self.frame(delta, None);
                }
            }
            let partial = gate.release_partial();
            if !partial.is_empty() {
                yield self.frame(ChunkDelta::from_segment(Segment::content(partial)), None);
            }

            let turn = accumulator.into_turn();
            let had_structured = !turn.tool_calls.is_empty();
            let tool_calls = self.resolve_tool_calls(turn.tool_calls, &turn.content);
            if let Some(held) = gate.take_held() {
                if self.release_held(had_structured, &tool_calls) {
                    yield self.frame(ChunkDelta::from_segment(Segment::content(held)), None);
                } else {
                    debug!(id = %self.completion_id, "dropping tool-call markup from content");
                }
            }
            let finish_reason = if tool_calls.is_empty() {
                turn.finish_reason.unwrap_or_else(|| "stop".into())
            } else {
                yield self.frame(
                    ChunkDelta {
                        tool_calls: Some(wire_tool_calls(&tool_calls)),
                        ..Default::default()
                    },
                    None,
                );
                FINISH_TOOL_CALLS.into()
            };
            yield self.frame(ChunkDelta::default(), Some(finish_reason));
            yield DONE_FRAME.to_string();
        })
    }

    /// Consume `events` into one non-streaming response.
    pub async fn collect_completion(
        &self,
        mut events: Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>>,
    ) -> Result<ChatCompletionResponse, AgentRunError> {
        let mut accumulator = ToolCallAccumulator::new();
        let mut usage = None;
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Fragment(fragment) => accumulator.ingest(&fragment),
                StreamEvent::Usage(u) => usage = Some(CompletionUsage::from(u)),
                StreamEvent::Error(message) => return Err(AgentRunError::Transport(message)),
            }
        }

        let turn = accumulator.into_turn();
        let had_structured = !turn.tool_calls.is_empty();
        let tool_calls = self.resolve_tool_calls(turn.tool_calls, &turn.content);

        let mut gate = MarkupGate::new(self.fallback.as_ref());
        let mut content = String::new();
        let mut reasoning = String::new();
        for segment in split_all(&turn.content, &self.thought_start_tag, &self.thought_end_tag) {
            match segment.kind {
                SegmentKind::Thought => reasoning.push_str(&segment.text),
                SegmentKind::Content => content.push_str(&gate.pass(&segment.text)),
            }
        }
        content.push_str(&gate.release_partial());
        if let Some(held) = gate.take_held()
            && self.release_held(had_structured, &tool_calls)
        {
            content.push_str(&held);
        }
        if !tool_calls.is_empty() && !self.keep_content_with_tool_calls {
            content.clear();
        }

        let finish_reason = if tool_calls.is_empty() {
            turn.finish_reason.unwrap_or_else(|| "stop".into())
        } else {
            FINISH_TOOL_CALLS.into()
        };

        Ok(ChatCompletionResponse {
            id: self.completion_id.clone(),
            object: COMPLETION_OBJECT.into(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ResponseChoice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".into(),
                    content: (!content.is_empty()).then_some(content),
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                    tool_calls: (!tool_calls.is_empty()).then(|| wire_tool_calls(&tool_calls)),
                },
                finish_reason,
            }],
            usage,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, crate::model::DeltaFragment};

    fn boxed(events: Vec<StreamEvent>) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'static>> {
        Box::pin(tokio_stream::iter(events))
    }

    fn content(pieces: &[&str], finish: &str) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> = pieces
            .iter()
            .map(|p| StreamEvent::Fragment(DeltaFragment::content(*p)))
            .collect();
        events.push(StreamEvent::Fragment(DeltaFragment::finish(finish)));
        events
    }

    fn parse(frame: &str) -> ChatCompletionChunk {
        let json = frame
            .strip_prefix("data: ")
            .and_then(|f| f.strip_suffix("\n\n"))
            .expect("well-formed frame");
        serde_json::from_str(json).expect("chunk json")
    }

    async fn frames(emitter: &StreamingResponseEmitter, events: Vec<StreamEvent>) -> Vec<String> {
        emitter
            .stream(boxed(events), CancellationToken::new())
            .collect()
            .await
    }

    fn deltas(frames: &[String]) -> Vec<ChunkDelta> {
        frames[..frames.len() - 1]
            .iter()
            .map(|f| parse(f).choices[0].delta.clone())
            .collect()
    }

    #[tokio::test]
    async fn plain_text_frame_sequence() {
        let emitter = StreamingResponseEmitter::new("test-model");
        let frames = frames(&emitter, content(&["Hello", " world"], "stop")).await;

        // role, two content chunks, closing chunk, [DONE]
        assert_eq!(frames.len(), 5);
        assert_eq!(frames.last().unwrap(), DONE_FRAME);
        let first = parse(&frames[0]);
        assert_eq!(first.object, "chat.completion.chunk");
        assert_eq!(first.model, "test-model");
        assert_eq!(first.id, emitter.completion_id());
        assert_eq!(first.choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(parse(&frames[1]).choices[0].delta.content.as_deref(), Some("Hello"));
        assert_eq!(parse(&frames[2]).choices[0].delta.content.as_deref(), Some(" world"));
        let last = parse(&frames[3]);
        assert_eq!(last.id, first.id);
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(last.choices[0].delta, ChunkDelta::default());
    }

    #[tokio::test]
    async fn untagged_content_is_sent_while_the_stream_is_open() {
        let emitter = StreamingResponseEmitter::new("m");
        let events = tokio_stream::iter(vec![StreamEvent::Fragment(DeltaFragment::content(
            "Hello, here is a long answer without any reasoning tags",
        ))])
        .chain(futures::stream::pending());
        let mut stream = emitter.stream(Box::pin(events), CancellationToken::new());

        stream.next().await.unwrap();
        let next = tokio::time::timeout(std::time::Duration::from_millis(300), stream.next())
            .await
            .expect("content frame before the model stream closes")
            .unwrap();
        assert_eq!(
            parse(&next).choices[0].delta.content.as_deref(),
            Some("Hello, here is a long answer without any reasoning tags")
        );
    }

    #[tokio::test]
    async fn content_before_a_thought_is_emitted_early() {
        let emitter = StreamingResponseEmitter::new("m");
        let events = tokio_stream::iter(vec![StreamEvent::Fragment(DeltaFragment::content(
            "Let me see <think>lookup",
        ))])
        .chain(futures::stream::pending());
        let mut stream = emitter.stream(Box::pin(events), CancellationToken::new());

        stream.next().await.unwrap();
        let early = parse(&stream.next().await.unwrap());
        assert_eq!(early.choices[0].delta.content.as_deref(), Some("Let me see "));
    }

    #[tokio::test]
    async fn absent_fields_are_omitted() {
        let emitter = StreamingResponseEmitter::new("m");
        let frames = frames(&emitter, content(&["hi"], "stop")).await;
        assert!(!frames[1].contains("reasoning_content"));
        assert!(!frames[1].contains("tool_calls"));
        assert!(!frames[1].contains("finish_reason"));
    }

    #[tokio::test]
    async fn thoughts_become_reasoning_content() {
        let emitter = StreamingResponseEmitter::new("m");
        let frames = frames(
            &emitter,
            content(&["<thi", "nk>weigh options</th", "ink>", "Final"], "stop"),
        )
        .await;
        let deltas = deltas(&frames);
        let text: Vec<(Option<&str>, Option<&str>)> = deltas
            .iter()
            .filter(|d| d.content.is_some() || d.reasoning_content.is_some())
            .map(|d| (d.reasoning_content.as_deref(), d.content.as_deref()))
            .collect();
        assert_eq!(text, vec![(Some("weigh options"), None), (None, Some("Final"))]);
    }

    #[tokio::test]
    async fn structured_tool_calls_are_aggregated() {
        let events = vec![
            StreamEvent::Fragment(DeltaFragment::tool_call(
                0,
                Some("call_1"),
                Some("get_delivery_date"),
                Some("{\"order_"),
            )),
            StreamEvent::Fragment(DeltaFragment::tool_call(0, None, None, Some("id\":\"ORD-1\"}"))),
            StreamEvent::Fragment(DeltaFragment::finish("tool_calls")),
        ];
        let emitter = StreamingResponseEmitter::new("m");
        let frames = frames(&emitter, events).await;

        // role, tool calls, closing chunk, [DONE]
        assert_eq!(frames.len(), 4);
        let calls = parse(&frames[1]).choices[0].delta.tool_calls.clone().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].call_type, "function");
        assert_eq!(calls[0].function.name, "get_delivery_date");
        assert_eq!(calls[0].function.arguments, "{\"order_id\":\"ORD-1\"}");
        assert_eq!(
            parse(&frames[2]).choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
    }

    #[tokio::test]
    async fn text_embedded_calls_use_fallback() {
        let emitter = StreamingResponseEmitter::new("m");
        let frames = frames(
            &emitter,
            content(
                &["<tool_call>{\"name\": \"find_order_by_name\", \"arguments\": {\"customer_name\": \"Jane Doe\"}}</tool_call>"],
                "stop",
            ),
        )
        .await;
        let deltas = deltas(&frames);
        let calls = deltas
            .iter()
            .find_map(|d| d.tool_calls.clone())
            .expect("tool call chunk");
        assert_eq!(calls[0].function.name, "find_order_by_name");
        let args: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["customer_name"], "Jane Doe");
        let closing = parse(&frames[frames.len() - 2]);
        assert_eq!(closing.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        // The markup itself is not repeated as text.
        assert!(deltas.iter().all(|d| d.content.is_none()));
    }

    #[tokio::test]
    async fn narration_streams_but_recovered_markup_is_held() {
        let emitter = StreamingResponseEmitter::new("m");
        let frames = frames(
            &emitter,
            content(
                &["Checking now. <tool", "_call>{\"name\": \"f\", \"arguments\": {}}</tool_call>"],
                "stop",
            ),
        )
        .await;
        let deltas = deltas(&frames);
        assert_eq!(deltas[1].content.as_deref(), Some("Checking now. "));
        assert_eq!(deltas[2].tool_calls.as_ref().unwrap()[0].function.name, "f");
        assert!(deltas[3].content.is_none());
    }

    #[tokio::test]
    async fn unparsable_markup_is_released_as_text() {
        let emitter = StreamingResponseEmitter::new("m");
        let frames = frames(&emitter, content(&["a <tool_call>not json"], "stop")).await;
        let text: String = deltas(&frames)
            .iter()
            .filter_map(|d| d.content.clone())
            .collect();
        assert_eq!(text, "a <tool_call>not json");
        assert!(deltas(&frames).iter().all(|d| d.tool_calls.is_none()));
    }

    #[tokio::test]
    async fn marker_prefix_is_released_before_a_thought() {
        let emitter = StreamingResponseEmitter::new("m");
        let frames = frames(&emitter, content(&["x [TOOL<think>t</think>"], "stop")).await;
        let deltas = deltas(&frames);
        assert_eq!(deltas[1].content.as_deref(), Some("x "));
        assert_eq!(deltas[2].content.as_deref(), Some("[TOOL"));
        assert_eq!(deltas[3].reasoning_content.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn collect_completion_honors_content_policy() {
        let events = || {
            let mut events = vec![StreamEvent::Fragment(DeltaFragment::content("Let me check."))];
            events.push(StreamEvent::Fragment(DeltaFragment::tool_call(
                0,
                Some("a"),
                Some("f"),
                Some("{}"),
            )));
            events.push(StreamEvent::Fragment(DeltaFragment::finish("tool_calls")));
            events
        };

        let keep = StreamingResponseEmitter::new("m");
        let response = keep.collect_completion(boxed(events())).await.unwrap();
        assert_eq!(response.choices[0].message.content.as_deref(), Some("Let me check."));

        let drop = StreamingResponseEmitter::new("m").with_content_alongside_tool_calls(false);
        let response = drop.collect_completion(boxed(events())).await.unwrap();
        assert!(response.choices[0].message.content.is_none());
        assert_eq!(response.choices[0].message.tool_calls.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn collect_completion_strips_recovered_markup() {
        let emitter = StreamingResponseEmitter::new("m");
        let response = emitter
            .collect_completion(boxed(content(
                &["Sure. <tool_call>{\"name\": \"f\"}</tool_call>"],
                "stop",
            )))
            .await
            .unwrap();
        let message = &response.choices[0].message;
        assert_eq!(message.content.as_deref(), Some("Sure. "));
        assert_eq!(message.tool_calls.as_ref().unwrap()[0].function.name, "f");
    }

    #[tokio::test]
    async fn fallback_disabled_leaves_text_alone() {
        let emitter = StreamingResponseEmitter::new("m").with_fallback_parsing(false);
        let frames = frames(
            &emitter,
            content(&["<tool_call>{\"name\": \"f\"}</tool_call>"], "stop"),
        )
        .await;
        assert!(deltas(&frames).iter().all(|d| d.tool_calls.is_none()));
    }

    #[tokio::test]
    async fn error_mid_stream_emits_error_frame_then_done() {
        let emitter = StreamingResponseEmitter::new("m");
        let frames = frames(&emitter, vec![
            StreamEvent::Fragment(DeltaFragment::content("par")),
            StreamEvent::Error("HTTP 500: boom".into()),
            StreamEvent::Fragment(DeltaFragment::content("never")),
        ])
        .await;
        // role, "par", error, [DONE]
        assert_eq!(frames.len(), 4);
        assert!(frames[1].contains("\"content\":\"par\""));
        assert_eq!(frames[2], "data: {\"error\":{\"message\":\"HTTP 500: boom\"}}\n\n");
        assert_eq!(frames[3], DONE_FRAME);
    }

    #[tokio::test]
    async fn cancellation_stops_without_further_frames() {
        let emitter = StreamingResponseEmitter::new("m");
        let cancel = CancellationToken::new();
        let events = tokio_stream::iter(vec![StreamEvent::Fragment(DeltaFragment::content(
            "<think>hello</think>",
        ))])
        .chain(futures::stream::pending());
        let mut stream = emitter.stream(Box::pin(events), cancel.clone());

        let role = stream.next().await.unwrap();
        assert!(role.contains("\"role\":\"assistant\""));
        let hello = stream.next().await.unwrap();
        assert!(hello.contains("\"reasoning_content\":\"hello\""));

        cancel.cancel();
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn custom_thought_tags_from_settings() {
        let settings = LoopSettings {
            thought_start_tag: "<reasoning>".into(),
            thought_end_tag: "</reasoning>".into(),
            ..Default::default()
        };
        let emitter = StreamingResponseEmitter::from_settings("m", &settings);
        let frames = frames(&emitter, content(&["<reasoning>x</reasoning>y"], "stop")).await;
        let deltas = deltas(&frames);
        assert_eq!(deltas[1].reasoning_content.as_deref(), Some("x"));
        assert_eq!(deltas[2].content.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn collect_completion_builds_single_response() {
        let mut events = content(&["<think>hmm</think>", "The answer."], "stop");
        events.push(StreamEvent::Usage(Usage {
            input_tokens: 7,
            output_tokens: 3,
        }));
        let emitter = StreamingResponseEmitter::new("m");
        let response = emitter.collect_completion(boxed(events)).await.unwrap();

        assert_eq!(response.object, "chat.completion");
        let choice = &response.choices[0];
        assert_eq!(choice.message.role, "assistant");
        assert_eq!(choice.message.content.as_deref(), Some("The answer."));
        assert_eq!(choice.message.reasoning_content.as_deref(), Some("hmm"));
        assert!(choice.message.tool_calls.is_none());
        assert_eq!(choice.finish_reason, "stop");
        assert_eq!(response.usage.unwrap().total_tokens, 10);
    }

    #[tokio::test]
    async fn collect_completion_with_tool_calls() {
        let events = vec![
            StreamEvent::Fragment(DeltaFragment::tool_call(0, Some("a"), Some("f"), Some("{}"))),
            StreamEvent::Fragment(DeltaFragment::tool_call(1, Some("b"), Some("g"), Some("{}"))),
            StreamEvent::Fragment(DeltaFragment::finish("tool_calls")),
        ];
        let emitter = StreamingResponseEmitter::new("m");
        let response = emitter.collect_completion(boxed(events)).await.unwrap();
        let calls = response.choices[0].message.tool_calls.clone().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].index, 1);
        assert_eq!(response.choices[0].finish_reason, "tool_calls");
        assert!(response.choices[0].message.content.is_none());
    }

    #[tokio::test]
    async fn collect_completion_surfaces_transport_error() {
        let emitter = StreamingResponseEmitter::new("m");
        let err = emitter
            .collect_completion(boxed(vec![StreamEvent::Error("reset".into())]))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentRunError::Transport(msg) if msg == "reset"));
    }
}
