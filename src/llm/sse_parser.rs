// ABOUTME: SSE line-buffering parser for provider streaming responses
// ABOUTME: Handles partial lines across TCP boundaries and multiple events per chunk
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! # SSE Stream Parser
//!
//! Server-Sent Events framing for provider adapters. TCP chunk boundaries do
//! not align with SSE event boundaries, so two cases need handling: several
//! events batched into one chunk, and one JSON payload split across chunks.
//! The buffer emits complete events only when a full `\n`-terminated line has
//! arrived; anything else waits for the next `feed`.

use std::mem;

/// A parsed SSE event from a provider byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload with the prefix stripped
    Data(String),
    /// The `data: [DONE]` termination signal (OpenAI convention)
    Done,
}

/// Line-buffering SSE parser
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    /// Create a new empty line buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from a TCP chunk, returning any complete SSE events.
    ///
    /// Trailing partial lines stay buffered for the next call. Non-data SSE
    /// fields (`event:`, `id:`, `retry:`, comments) are ignored.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(event) = Self::parse_line(line.trim_end_matches(['\n', '\r']).trim()) {
                events.push(event);
            }
        }
        events
    }

    /// Flush any remaining buffered content as a final event.
    ///
    /// Called when the byte stream ends without a trailing newline.
    pub fn flush(&mut self) -> Vec<SseEvent> {
        let remaining = mem::take(&mut self.buffer);
        Self::parse_line(remaining.trim()).into_iter().collect()
    }

    fn parse_line(line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return None;
        }
        if line == "data: [DONE]" {
            return Some(SseEvent::Done);
        }
        let data = line.strip_prefix("data: ")?;
        if data.trim().is_empty() {
            None
        } else {
            Some(SseEvent::Data(data.to_owned()))
        }
    }
}
