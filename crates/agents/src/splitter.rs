//! Split streamed model text into thought and content segments.
//!
//! Reasoning models (Qwen3, DeepSeek R1, QwQ) wrap chain-of-thought in
//! `<think>...</think>` inside the regular content stream. Tags can be cut
//! anywhere by the transport, so text that might still turn into part of a
//! delimited span is held back until it is resolved. Everything else is
//! released as soon as it arrives.

use {serde::Serialize, tracing::warn};

pub const DEFAULT_THOUGHT_START: &str = "<think>";
pub const DEFAULT_THOUGHT_END: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Thought,
    Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub text: String,
}

impl Segment {
    pub fn thought(text: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Thought,
            text: text.into(),
        }
    }

    pub fn content(text: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Content,
            text: text.into(),
        }
    }
}

/// Incremental splitter. One instance per response stream.
#[derive(Debug, Clone)]
pub struct ThoughtContentSplitter {
    start_tag: String,
    end_tag: String,
    pending: String,
}

impl Default for ThoughtContentSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_THOUGHT_START, DEFAULT_THOUGHT_END)
    }
}

impl ThoughtContentSplitter {
    /// Empty tags cannot delimit anything; either one being empty falls back
    /// to the `<think>` pair.
    pub fn new(start_tag: impl Into<String>, end_tag: impl Into<String>) -> Self {
        let (mut start_tag, mut end_tag) = (start_tag.into(), end_tag.into());
        if start_tag.is_empty() || end_tag.is_empty() {
            warn!(
                start_tag = %start_tag,
                end_tag = %end_tag,
                "empty thought tag; using {DEFAULT_THOUGHT_START}...{DEFAULT_THOUGHT_END}"
            );
            start_tag = DEFAULT_THOUGHT_START.into();
            end_tag = DEFAULT_THOUGHT_END.into();
        }
        Self {
            start_tag,
            end_tag,
            pending: String::new(),
        }
    }

    pub fn start_tag(&self) -> &str {
        &self.start_tag
    }

    pub fn end_tag(&self) -> &str {
        &self.end_tag
    }

    /// Unconsumed tail carried to the next `feed`.
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Append `piece` and return every segment that is now settled.
    pub fn feed(&mut self, piece: &str) -> Vec<Segment> {
        self.pending.push_str(piece);

        let mut segments = Vec::new();
        let mut consumed = 0;
        let buf = self.pending.as_str();

        while let Some(span) = find_span(buf, consumed, &self.start_tag, &self.end_tag) {
            push_segment(&mut segments, SegmentKind::Content, &buf[consumed..span.start]);
            push_segment(
                &mut segments,
                SegmentKind::Thought,
                &buf[span.inner_start..span.inner_end],
            );
            consumed = span.end;
        }

        // Outside a span only a possible start-tag prefix is kept back.
        let tail = &buf[consumed..];
        let settled = match tail.find(self.start_tag.as_str()) {
            Some(rel) => rel,
            None => tail.len() - partial_prefix_len(tail, &self.start_tag),
        };
        push_segment(&mut segments, SegmentKind::Content, &tail[..settled]);
        consumed += settled;

        self.pending.drain(..consumed);
        segments
    }

    /// Emit whatever is left at the end of the stream.
    pub fn flush(&mut self) -> Option<Segment> {
        let rest = std::mem::take(&mut self.pending);
        if rest.is_empty() {
            return None;
        }
        let whole_span = rest
            .strip_prefix(self.start_tag.as_str())
            .and_then(|r| r.strip_suffix(self.end_tag.as_str()))
            .filter(|inner| !inner.contains(self.end_tag.as_str()));
        match whole_span {
            Some(inner) if inner.is_empty() => None,
            Some(inner) => Some(Segment::thought(inner)),
            None => Some(Segment::content(rest)),
        }
    }
}

struct Span {
    start: usize,
    inner_start: usize,
    inner_end: usize,
    end: usize,
}

fn find_span(buf: &str, from: usize, start_tag: &str, end_tag: &str) -> Option<Span> {
    let start = from + buf[from..].find(start_tag)?;
    let inner_start = start + start_tag.len();
    let inner_end = inner_start + buf[inner_start..].find(end_tag)?;
    Some(Span {
        start,
        inner_start,
        inner_end,
        end: inner_end + end_tag.len(),
    })
}

/// Length of the longest suffix of `text` that is a proper prefix of `marker`.
pub(crate) fn partial_prefix_len(text: &str, marker: &str) -> usize {
    let longest = marker.len().saturating_sub(1).min(text.len());
    (1..=longest)
        .rev()
        .find(|&n| marker.is_char_boundary(n) && text.ends_with(&marker[..n]))
        .unwrap_or(0)
}

fn push_segment(segments: &mut Vec<Segment>, kind: SegmentKind, text: &str) {
    if !text.is_empty() {
        segments.push(Segment {
            kind,
            text: text.to_string(),
        });
    }
}

/// Split a complete text in one go.
pub fn split_all(text: &str, start_tag: &str, end_tag: &str) -> Vec<Segment> {
    let mut splitter = ThoughtContentSplitter::new(start_tag, end_tag);
    let mut segments = splitter.feed(text);
    segments.extend(splitter.flush());
    segments
}
