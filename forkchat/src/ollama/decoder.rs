//! Incremental NDJSON decoding of `/api/chat` streams.
//!
//! Chunks arrive with arbitrary boundaries. The decoder buffers raw bytes,
//! cuts complete lines at `\n`, and turns each record into zero or more
//! [`StreamEvent`]s. A line that fails to parse is logged and skipped.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::GenerationStats;

/// Something went wrong with the stream itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamFault {
    /// The server sent a record carrying an `error` field.
    #[error("{0}")]
    Server(String),
    /// The connection failed after the response started.
    #[error("response stream interrupted: {0}")]
    Transport(String),
}

/// One decoded step of a chat stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text to append to the in-progress assistant message.
    Content(String),
    /// Final throughput figures. Always the last event of a stream.
    Stats(GenerationStats),
    /// The stream failed. Nothing follows.
    Error(StreamFault),
}

/// One parsed NDJSON record.
#[derive(Debug, Default, PartialEq)]
struct ChatRecord {
    content: Option<String>,
    done: bool,
    error: Option<String>,
    eval_count: u64,
    eval_duration: u64,
    total_duration: u64,
}

impl ChatRecord {
    fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;

        let error = value.get("error").and_then(|e| match e {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        });

        let content = value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(String::from);

        let done = value.get("done").and_then(Value::as_bool).unwrap_or(false);
        let counter = |key: &str| value.get(key).and_then(Value::as_u64).unwrap_or(0);

        Ok(Self {
            content,
            done,
            error,
            eval_count: counter("eval_count"),
            eval_duration: counter("eval_duration"),
            total_duration: counter("total_duration"),
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    #[default]
    Open,
    /// The completion record has been seen.
    Done,
    /// An error record has been seen.
    Halted,
}

/// Stateful decoder for one chat stream.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    state: DecoderState,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the stream has ended, by completion or by error. A terminated
    /// decoder ignores further input.
    pub fn is_terminated(&self) -> bool {
        self.state != DecoderState::Open
    }

    /// Feed one chunk and return the events completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.is_terminated() {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(&line[..pos], &mut events);
            if self.is_terminated() {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// Signal end of stream; decodes whatever is left in the buffer.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.is_terminated() && !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.decode_line(&rest, &mut events);
        }
        self.buffer.clear();
        events
    }

    fn decode_line(&mut self, line: &[u8], events: &mut Vec<StreamEvent>) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let record = match ChatRecord::parse(text) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, line = text, "skipping malformed stream line");
                return;
            }
        };
        debug!(?record, "decoded stream record");

        if let Some(message) = record.error {
            self.state = DecoderState::Halted;
            events.push(StreamEvent::Error(StreamFault::Server(message)));
            return;
        }

        if let Some(content) = record.content {
            events.push(StreamEvent::Content(content));
        }

        if record.done {
            self.state = DecoderState::Done;
            if let Some(stats) = GenerationStats::from_counts(
                record.eval_count,
                record.eval_duration,
                record.total_duration,
            ) {
                events.push(StreamEvent::Stats(stats));
            }
        }
    }
}
