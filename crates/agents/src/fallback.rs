//! Recover tool calls that a model wrote into its text output instead of the
//! structured `tool_calls` channel.
//!
//! Recognized conventions, tried in this order:
//!
//! 1. [`Convention::ToolCallTag`]: `<tool_call>{"name": ..., "arguments": {...}}</tool_call>`
//!    (Hermes / Qwen chat templates)
//! 2. [`Convention::PythonTag`]: `<|python_tag|>{"name": ..., "parameters": {...}}`
//!    (Llama 3.x)
//! 3. [`Convention::ToolCallsArray`]: `[TOOL_CALLS] [{"name": ...}, ...]` (Mistral)
//!
//! Conventions are independent. A text containing more than one yields the
//! calls of each, in convention order.

use std::fmt::Write;

use {
    serde_json::Value,
    tracing::{debug, warn},
};

use crate::model::ToolCall;

/// Keep synthetic tool-call IDs OpenAI-compatible (`maxLength: 40`).
const SYNTHETIC_TOOL_CALL_ID_MAX_LEN: usize = 40;

pub(crate) fn new_synthetic_tool_call_id(prefix: &str) -> String {
    let mut id = String::new();
    let _ = write!(&mut id, "{prefix}_{}", uuid::Uuid::new_v4().simple());
    if id.len() <= SYNTHETIC_TOOL_CALL_ID_MAX_LEN {
        return id;
    }
    id.truncate(SYNTHETIC_TOOL_CALL_ID_MAX_LEN);
    id
}

/// A textual tool-call convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// A single JSON object between `<tool_call>` and `</tool_call>`.
    ToolCallTag,
    /// `<|python_tag|>` followed by a single JSON object.
    PythonTag,
    /// `[TOOL_CALLS]` followed by a JSON array of call objects.
    ToolCallsArray,
}

/// Default trial order.
pub const CONVENTIONS: [Convention; 3] = [
    Convention::ToolCallTag,
    Convention::PythonTag,
    Convention::ToolCallsArray,
];

impl Convention {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ToolCallTag => "tool_call_tag",
            Self::PythonTag => "python_tag",
            Self::ToolCallsArray => "tool_calls_array",
        }
    }

    /// Marker that starts a payload of this convention.
    #[must_use]
    pub fn opening(self) -> &'static str {
        match self {
            Self::ToolCallTag => "<tool_call>",
            Self::PythonTag => "<|python_tag|>",
            Self::ToolCallsArray => "[TOOL_CALLS]",
        }
    }

    /// Every non-overlapping payload of this convention in `text`, in order.
    ///
    /// Each entry is the decoded JSON, or the decode error for a payload that
    /// was delimited but is not valid JSON.
    pub fn find_payloads(self, text: &str) -> Vec<Result<Value, serde_json::Error>> {
        match self {
            Self::ToolCallTag => find_wrapped(text, self.opening(), "</tool_call>"),
            Self::PythonTag | Self::ToolCallsArray => find_prefixed(text, self.opening()),
        }
    }

    /// Turn one decoded payload into call objects.
    fn call_objects(self, payload: Value) -> Vec<Value> {
        match (self, payload) {
            (Self::ToolCallsArray, Value::Array(items)) => items,
            (Self::ToolCallsArray, other) => {
                debug!(
                    convention = self.name(),
                    kind = json_kind(&other),
                    "expected a JSON array payload"
                );
                Vec::new()
            },
            (_, payload) => vec![payload],
        }
    }
}

fn find_wrapped(text: &str, open: &str, close: &str) -> Vec<Result<Value, serde_json::Error>> {
    let mut payloads = Vec::new();
    let mut pos = 0;
    while let Some(start_rel) = text[pos..].find(open) {
        let body_start = pos + start_rel + open.len();
        let Some(end_rel) = text[body_start..].find(close) else {
            break;
        };
        let body = text[body_start..body_start + end_rel].trim();
        payloads.push(serde_json::from_str(body));
        pos = body_start + end_rel + close.len();
    }
    payloads
}

fn find_prefixed(text: &str, sentinel: &str) -> Vec<Result<Value, serde_json::Error>> {
    let mut payloads = Vec::new();
    let mut pos = 0;
    while let Some(start_rel) = text[pos..].find(sentinel) {
        let body_start = pos + start_rel + sentinel.len();
        // Read exactly one JSON value; whatever follows it is not ours.
        let mut values = serde_json::Deserializer::from_str(&text[body_start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => {
                pos = body_start + values.byte_offset();
                payloads.push(Ok(value));
            },
            Some(Err(e)) => {
                pos = body_start;
                payloads.push(Err(e));
            },
            None => break,
        }
    }
    payloads
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Ordered set of conventions applied to finished model text.
#[derive(Debug, Clone)]
pub struct FormatFallbackParser {
    conventions: Vec<Convention>,
}

impl Default for FormatFallbackParser {
    fn default() -> Self {
        Self {
            conventions: CONVENTIONS.to_vec(),
        }
    }
}

impl FormatFallbackParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conventions(conventions: Vec<Convention>) -> Self {
        Self { conventions }
    }

    /// Opening markers of the enabled conventions.
    pub fn openings(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.conventions.iter().map(|c| c.opening())
    }

    /// Extract tool calls from `raw_text`.
    ///
    /// Returns `None` when no convention matched at all and `Some` (possibly
    /// empty, if every match was malformed) otherwise.
    pub fn extract(&self, raw_text: &str) -> Option<Vec<ToolCall>> {
        let mut matched = false;
        let mut calls = Vec::new();

        for &convention in &self.conventions {
            for payload in convention.find_payloads(raw_text) {
                matched = true;
                let value = match payload {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(
                            convention = convention.name(),
                            error = %e,
                            "skipping fallback tool call with invalid JSON"
                        );
                        continue;
                    },
                };
                for object in convention.call_objects(value) {
                    if let Some(call) = call_from_object(object, convention) {
                        calls.push(call);
                    }
                }
            }
        }

        if !matched {
            return None;
        }
        debug!(count = calls.len(), "fallback tool-call extraction");
        Some(calls)
    }
}

fn call_from_object(object: Value, convention: Convention) -> Option<ToolCall> {
    let Value::Object(mut map) = object else {
        warn!(
            convention = convention.name(),
            kind = json_kind(&object),
            "skipping fallback tool call that is not an object"
        );
        return None;
    };
    let name = match map.remove("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => name,
        _ => {
            warn!(
                convention = convention.name(),
                "skipping fallback tool call without a name"
            );
            return None;
        },
    };
    let arguments = map
        .remove("arguments")
        .or_else(|| map.remove("parameters"))
        .unwrap_or_else(|| serde_json::json!({}));

    Some(ToolCall {
        id: new_synthetic_tool_call_id("call"),
        name,
        arguments,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn extract(text: &str) -> Option<Vec<ToolCall>> {
        FormatFallbackParser::new().extract(text)
    }

    #[test]
    fn tool_call_tag_single_object() {
        let text = "<tool_call>\n{\"name\": \"get_current_weather\", \"arguments\": {\"location\": \"Boston, MA\"}}\n</tool_call>";
        let calls = extract(text).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_current_weather");
        assert_eq!(
            calls[0].arguments,
            serde_json::json!({"location": "Boston, MA"})
        );
        assert!(calls[0].id.starts_with("call_"));
        assert!(calls[0].id.len() <= SYNTHETIC_TOOL_CALL_ID_MAX_LEN);
    }

    #[test]
    fn tool_call_tag_multiple_with_surrounding_text() {
        let text = "Let me check.\n<tool_call>{\"name\": \"a\", \"arguments\": {}}</tool_call>\nand\n<tool_call>{\"name\": \"b\", \"arguments\": {\"x\": 1}}</tool_call> done";
        let calls = extract(text).unwrap();
        let names: Vec<_> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_ne!(calls[0].id, calls[1].id);
    }

    #[test]
    fn python_tag_nested_parameters() {
        let text = "<|python_tag|>{\"name\": \"get_current_weather\", \"parameters\": {\"location\": \"Boston, MA\", \"unit\": {\"kind\": \"celsius\"}}}<|eom_id|>";
        let calls = extract(text).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["unit"]["kind"], "celsius");
    }

    #[test]
    fn tool_calls_array_yields_one_call_per_element() {
        let text = "[TOOL_CALLS] [{\"name\": \"find_order_by_name\", \"arguments\": {\"customer_name\": \"Jane Doe\"}}, {\"name\": \"get_delivery_date\", \"arguments\": {\"order_id\": \"ORD-JAN08\"}}]";
        let calls = extract(text).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "find_order_by_name");
        assert_eq!(calls[1].arguments["order_id"], "ORD-JAN08");
    }

    #[test]
    fn invalid_json_is_skipped_without_aborting() {
        let text = "<tool_call>{bad json</tool_call><tool_call>{\"name\": \"ok\"}</tool_call>";
        let calls = extract(text).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "ok");
        assert_eq!(calls[0].arguments, serde_json::json!({}));
    }

    #[test]
    fn missing_name_is_skipped() {
        let text = "<tool_call>{\"arguments\": {\"x\": 1}}</tool_call>";
        // Matched, but nothing valid.
        assert_eq!(extract(text), Some(vec![]));
    }

    #[test]
    fn array_elements_without_name_are_dropped_individually() {
        let text = "[TOOL_CALLS] [{\"arguments\": {}}, 42, {\"name\": \"keep\"}]";
        let calls = extract(text).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "keep");
    }

    #[test]
    fn plain_text_returns_none() {
        assert!(extract("The weather in Boston is sunny.").is_none());
        assert!(extract("").is_none());
    }

    #[test]
    fn unclosed_tag_is_not_a_match() {
        assert!(extract("<tool_call>{\"name\": \"a\"}").is_none());
    }

    #[test]
    fn plain_json_is_not_rematched() {
        // A tool result fed back as text must not look like a call.
        let content = serde_json::json!({"name": "get_delivery_date", "order_id": "ORD-JAN08"}).to_string();
        assert!(extract(&content).is_none());
    }

    #[test]
    fn mixed_conventions_in_one_text() {
        let text = "<tool_call>{\"name\": \"first\"}</tool_call> then [TOOL_CALLS] [{\"name\": \"second\"}]";
        let names: Vec<_> = extract(text).unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn string_arguments_are_preserved() {
        let text = "<tool_call>{\"name\": \"f\", \"arguments\": \"{\\\"a\\\": 1}\"}</tool_call>";
        let calls = extract(text).unwrap();
        assert_eq!(calls[0].arguments, Value::String("{\"a\": 1}".into()));
    }

    #[test]
    fn restricted_conventions() {
        let parser = FormatFallbackParser::with_conventions(vec![Convention::ToolCallsArray]);
        assert!(
            parser
                .extract("<tool_call>{\"name\": \"a\"}</tool_call>")
                .is_none()
        );
    }

    #[test]
    fn python_tag_invalid_then_valid() {
        let text = "<|python_tag|>{oops <|python_tag|>{\"name\": \"b\"}";
        let calls = extract(text).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "b");
    }
}
