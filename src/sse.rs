//! SSE stream parsing for the two upstream dialects.
//!
//! The scanner is a pure function from `(dialect, buffer, cursor)` to
//! `(events, new cursor)`: it extracts complete SSE events (terminated by a
//! blank line) and leaves partial data in place. `StreamContext` owns the
//! buffer, runs the scanner on every chunk, and folds the normalized events
//! into callbacks, token counters, and accumulated tool calls.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

use crate::config::Provider;

/// Normalized event stream produced by both dialect parsers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text(String),
    ToolUseStart { index: usize, id: String, name: String },
    ToolUseInput { index: usize, partial_json: String },
    ToolUseStop { index: usize },
    Usage { input_tokens: Option<u32>, output_tokens: Option<u32> },
    StopReason(String),
    Done,
    Error(String),
}

/// A completed tool invocation extracted from the stream.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

// ── Anthropic wire shapes ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStart },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { index: usize, content_block: ContentBlock },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: ContentDelta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: MessageDeltaData,
        usage: Option<UsageData>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    Error { error: ErrorData },
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    usage: Option<UsageData>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Deserialize)]
struct MessageDeltaData {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageData {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    message: String,
}

// ── Scanner ──────────────────────────────────────────────────────────────────

/// Locate the next event terminator (`\n\n` or `\r\n\r\n`) at or after
/// `from`. Returns (event end, terminator length).
fn find_event_end(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let haystack = &buf[from..];
    let lf = haystack.windows(2).position(|w| w == b"\n\n");
    let crlf = haystack.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) if b < a => Some((from + b, 4)),
        (Some(a), _) => Some((from + a, 2)),
        (None, Some(b)) => Some((from + b, 4)),
        (None, None) => None,
    }
}

/// Pure scan: extract events from complete SSE blocks in `buf[cursor..]`.
/// Returns the normalized events and the new cursor position.
pub fn scan_events(dialect: Provider, buf: &[u8], cursor: usize) -> (Vec<StreamEvent>, usize) {
    let mut events = Vec::new();
    let mut pos = cursor;

    while let Some((end, term_len)) = find_event_end(buf, pos) {
        let block = String::from_utf8_lossy(&buf[pos..end]);
        match dialect {
            Provider::Anthropic => parse_anthropic_block(&block, &mut events),
            Provider::OpenAi => parse_openai_block(&block, &mut events),
        }
        pos = end + term_len;
    }

    (events, pos)
}

fn data_line(block: &str) -> Option<&str> {
    block
        .lines()
        .find_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
        .map(str::trim)
}

fn parse_anthropic_block(block: &str, events: &mut Vec<StreamEvent>) {
    let Some(data) = data_line(block) else {
        return;
    };

    let event: AnthropicEvent = match serde_json::from_str(data) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "unrecognized anthropic stream event");
            return;
        }
    };

    match event {
        AnthropicEvent::MessageStart { message } => {
            if let Some(usage) = message.usage {
                events.push(StreamEvent::Usage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                });
            }
        }
        AnthropicEvent::ContentBlockStart { index, content_block } => match content_block {
            ContentBlock::Text { text } => {
                if !text.is_empty() {
                    events.push(StreamEvent::Text(text));
                }
            }
            ContentBlock::ToolUse { id, name } => {
                events.push(StreamEvent::ToolUseStart { index, id, name });
            }
        },
        AnthropicEvent::ContentBlockDelta { index, delta } => match delta {
            ContentDelta::TextDelta { text } => events.push(StreamEvent::Text(text)),
            ContentDelta::InputJsonDelta { partial_json } => {
                events.push(StreamEvent::ToolUseInput { index, partial_json });
            }
        },
        AnthropicEvent::ContentBlockStop { index } => {
            events.push(StreamEvent::ToolUseStop { index });
        }
        AnthropicEvent::MessageDelta { delta, usage } => {
            if let Some(reason) = delta.stop_reason {
                events.push(StreamEvent::StopReason(reason));
            }
            if let Some(usage) = usage {
                events.push(StreamEvent::Usage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                });
            }
        }
        AnthropicEvent::MessageStop => events.push(StreamEvent::Done),
        AnthropicEvent::Ping => trace!("anthropic stream ping"),
        AnthropicEvent::Error { error } => events.push(StreamEvent::Error(error.message)),
    }
}

fn parse_openai_block(block: &str, events: &mut Vec<StreamEvent>) {
    for line in block.lines() {
        let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
            continue;
        };
        let data = data.trim();

        if data == "[DONE]" {
            events.push(StreamEvent::Done);
            continue;
        }

        let payload: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unrecognized openai stream chunk");
                continue;
            }
        };

        if let Some(content) = payload
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        {
            if !content.is_empty() {
                events.push(StreamEvent::Text(content.to_string()));
            }
        }

        if let Some(reason) = payload
            .pointer("/choices/0/finish_reason")
            .and_then(Value::as_str)
        {
            events.push(StreamEvent::StopReason(reason.to_string()));
        }

        if let Some(usage) = payload.get("usage").filter(|u| !u.is_null()) {
            events.push(StreamEvent::Usage {
                input_tokens: usage
                    .get("prompt_tokens")
                    .and_then(Value::as_u64)
                    .map(|v| v as u32),
                output_tokens: usage
                    .get("completion_tokens")
                    .and_then(Value::as_u64)
                    .map(|v| v as u32),
            });
        }
    }
}

// ── Stream context ───────────────────────────────────────────────────────────

#[derive(Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    input_json: String,
}

/// Per-upstream-request parsing state plus the caller's callbacks.
pub struct StreamContext<'a> {
    dialect: Provider,
    pub on_text: Option<Box<dyn FnMut(&str) + Send + 'a>>,
    pub on_done: Option<Box<dyn FnMut(u32, u32) + Send + 'a>>,
    pub on_error: Option<Box<dyn FnMut(&str) + Send + 'a>>,

    buf: Vec<u8>,
    cursor: usize,
    builders: HashMap<usize, ToolCallBuilder>,

    pub input_tokens: u32,
    pub output_tokens: u32,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: Option<String>,
    done: bool,
    error: Option<String>,
}

impl<'a> StreamContext<'a> {
    pub fn new(dialect: Provider) -> Self {
        Self {
            dialect,
            on_text: None,
            on_done: None,
            on_error: None,
            buf: Vec::new(),
            cursor: 0,
            builders: HashMap::new(),
            input_tokens: 0,
            output_tokens: 0,
            tool_calls: Vec::new(),
            stop_reason: None,
            done: false,
            error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Append a raw chunk and process every complete event it exposes.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        let (events, cursor) = scan_events(self.dialect, &self.buf, self.cursor);
        self.cursor = cursor;

        for event in events {
            self.apply(event);
        }

        // Compact the consumed prefix so long streams stay bounded.
        if self.cursor > 64 * 1024 {
            self.buf.drain(..self.cursor);
            self.cursor = 0;
        }
    }

    /// Signal end-of-stream. OpenAI streams end with `[DONE]`; Anthropic
    /// with `message_stop`. A stream that ends without either is still
    /// completed so collected text is not lost.
    pub fn finish(&mut self) {
        if !self.done && self.error.is_none() {
            self.apply(StreamEvent::Done);
        }
    }

    /// Record a transport-level failure (bad status, broken stream) through
    /// the same error path as an in-band `error` event.
    pub fn fail(&mut self, message: &str) {
        self.apply(StreamEvent::Error(message.to_string()));
    }

    fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Text(text) => {
                if let Some(cb) = self.on_text.as_mut() {
                    cb(&text);
                }
            }
            StreamEvent::ToolUseStart { index, id, name } => {
                debug!(index, name = %name, "tool use started");
                self.builders.insert(
                    index,
                    ToolCallBuilder {
                        id,
                        name,
                        input_json: String::new(),
                    },
                );
            }
            StreamEvent::ToolUseInput { index, partial_json } => {
                if let Some(builder) = self.builders.get_mut(&index) {
                    builder.input_json.push_str(&partial_json);
                }
            }
            StreamEvent::ToolUseStop { index } => {
                if let Some(builder) = self.builders.remove(&index) {
                    let input = if builder.input_json.is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&builder.input_json).unwrap_or_else(|e| {
                            warn!(name = %builder.name, error = %e, "bad tool input JSON");
                            Value::Object(Default::default())
                        })
                    };
                    self.tool_calls.push(ToolCall {
                        id: builder.id,
                        name: builder.name,
                        input,
                    });
                }
            }
            StreamEvent::Usage { input_tokens, output_tokens } => {
                if let Some(n) = input_tokens {
                    self.input_tokens = n;
                }
                if let Some(n) = output_tokens {
                    self.output_tokens = n;
                }
            }
            StreamEvent::StopReason(reason) => self.stop_reason = Some(reason),
            StreamEvent::Done => {
                self.done = true;
                if let Some(cb) = self.on_done.as_mut() {
                    cb(self.input_tokens, self.output_tokens);
                }
            }
            StreamEvent::Error(message) => {
                if let Some(cb) = self.on_error.as_mut() {
                    cb(&message);
                }
                self.error = Some(message);
            }
        }
    }
}
