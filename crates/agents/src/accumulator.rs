//! Merge streamed tool-call fragments into complete [`ToolCall`]s.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::model::{DeltaFragment, ToolCall};

/// Finish reason that makes accumulated tool-call slots meaningful.
pub const FINISH_TOOL_CALLS: &str = "tool_calls";

#[derive(Debug, Default, Clone)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Per-turn accumulation state.
///
/// Slots are keyed by the fragment's `slot_index` and read back in ascending
/// index order regardless of arrival order.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    slots: BTreeMap<usize, PartialCall>,
    role: Option<String>,
    content: String,
    finish_reason: Option<String>,
}

/// Everything one model turn produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutput {
    pub role: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, fragment: &DeltaFragment) {
        if self.role.is_none()
            && let Some(role) = fragment.role.as_deref().filter(|r| !r.is_empty())
        {
            self.role = Some(role.to_string());
        }
        if let Some(text) = &fragment.content_piece {
            self.content.push_str(text);
        }
        if let Some(reason) = &fragment.finish_reason {
            self.finish_reason = Some(reason.clone());
        }

        if !fragment.carries_tool_call() {
            return;
        }
        let slot = self.slots.entry(fragment.slot_index).or_default();
        if slot.id.is_empty()
            && let Some(id) = fragment.id.as_deref().filter(|id| !id.is_empty())
        {
            slot.id = id.to_string();
        }
        if let Some(piece) = &fragment.function_name_piece {
            slot.name.push_str(piece);
        }
        if let Some(piece) = &fragment.function_args_piece {
            slot.arguments.push_str(piece);
        }
    }

    /// Text accumulated so far.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Last finish reason seen, if any.
    #[must_use]
    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// Complete tool calls in ascending slot order.
    ///
    /// Returns nothing unless `finish_reason` is `"tool_calls"`. Slots that
    /// never received both an id and a name are dropped with a warning.
    pub fn finalize(&self, finish_reason: Option<&str>) -> Vec<ToolCall> {
        if finish_reason != Some(FINISH_TOOL_CALLS) {
            if !self.slots.is_empty() {
                debug!(
                    slots = self.slots.len(),
                    finish_reason = finish_reason.unwrap_or("none"),
                    "ignoring tool-call fragments for non tool_calls finish"
                );
            }
            return Vec::new();
        }

        let mut calls = Vec::with_capacity(self.slots.len());
        for (slot, partial) in &self.slots {
            if partial.id.is_empty() || partial.name.is_empty() {
                warn!(
                    slot,
                    id = %partial.id,
                    name = %partial.name,
                    "dropping incomplete tool call"
                );
                continue;
            }
            calls.push(ToolCall {
                id: partial.id.clone(),
                name: partial.name.clone(),
                arguments: serde_json::Value::String(partial.arguments.clone()),
            });
        }
        calls
    }

    /// Consume the accumulator into the turn's aggregate output.
    pub fn into_turn(self) -> TurnOutput {
        let tool_calls = self.finalize(self.finish_reason.as_deref());
        TurnOutput {
            role: self.role.unwrap_or_else(|| "assistant".into()),
            content: self.content,
            tool_calls,
            finish_reason: self.finish_reason,
        }
    }
}
