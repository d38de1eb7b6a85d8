// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Re-framing of backend server-sent events into Ollama NDJSON.
//!
//! The backend streams `data: {json}` events (terminated by `data: [DONE]`
//! on the openai-style route, or by a chunk with `stop: true` on
//! `/completion`). Ollama clients expect one JSON object per line with
//! `done: false`, followed by exactly one `done: true` object. An upstream
//! failure mid-stream ends the output with a single `{"error": ..}` line.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::native::{ChatCompletionResponse, CompletionResponse};
use crate::ollama::ErrorResponse;
use crate::translate;
use crate::RuntimeError;

/// Incremental decoder for `text/event-stream` bodies.
///
/// Yields the payload of every `data:` field. Comments, other fields and
/// blank separators are skipped. Bare json lines are accepted as payloads
/// too, since some backend builds stream ndjson instead of sse.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw body bytes, returning every complete payload.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(payload) = Self::payload(&line) {
                out.push(payload);
            }
        }
        out
    }

    /// Flush a trailing line that had no newline.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buf);
        Self::payload(&line)
    }

    fn payload(line: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches(['\r', '\n']);
        if let Some(rest) = text.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            return (!rest.is_empty()).then(|| rest.to_string());
        }
        let trimmed = text.trim();
        if trimmed.starts_with('{') {
            return Some(trimmed.to_string());
        }
        None
    }
}

/// Serialise one NDJSON line.
pub fn ndjson_line<T: Serialize>(value: &T) -> Bytes {
    match serde_json::to_vec(value) {
        Ok(mut line) => {
            line.push(b'\n');
            Bytes::from(line)
        }
        Err(e) => error_line(&format!("failed to encode response chunk: {e}")),
    }
}

pub fn error_line(message: &str) -> Bytes {
    let body = ErrorResponse {
        error: message.to_string(),
    };
    let mut line = serde_json::to_vec(&body).unwrap_or_else(|_| b"{\"error\":\"stream failed\"}".to_vec());
    line.push(b'\n');
    Bytes::from(line)
}

/// Per-protocol translation of decoded events into output lines.
pub trait Reframe: Send + 'static {
    /// Handle one event payload. Returns lines to emit.
    fn event(&mut self, payload: &str) -> Result<Vec<Bytes>, RuntimeError>;

    /// Terminal line, if it has not been emitted yet.
    fn terminal(&mut self) -> Option<Bytes>;

    fn is_done(&self) -> bool;
}

/// `/completion` chunks -> `/api/generate` lines.
pub struct GenerateReframer {
    model: String,
    done: bool,
}

impl GenerateReframer {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            done: false,
        }
    }
}

impl Reframe for GenerateReframer {
    fn event(&mut self, payload: &str) -> Result<Vec<Bytes>, RuntimeError> {
        if self.done {
            return Ok(Vec::new());
        }
        if payload.trim() == "[DONE]" {
            return Ok(self.terminal().into_iter().collect());
        }
        let chunk: CompletionResponse = serde_json::from_str(payload)?;
        let mut lines = Vec::new();
        if !chunk.content.is_empty() {
            lines.push(ndjson_line(&translate::completion_chunk(
                &self.model,
                &chunk.content,
            )));
        }
        if chunk.stop {
            self.done = true;
            lines.push(ndjson_line(&translate::generate_terminal(
                &self.model,
                Some(&chunk),
            )));
        }
        Ok(lines)
    }

    fn terminal(&mut self) -> Option<Bytes> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(ndjson_line(&translate::generate_terminal(&self.model, None)))
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

/// `/v1/chat/completions` chunks -> `/api/chat` lines.
///
/// The chunk carrying `finish_reason` is remembered and only turned into the
/// terminal line at `[DONE]`, because llama-server sends usage and timings in
/// a trailing chunk after the finish reason.
pub struct ChatReframer {
    model: String,
    last: Option<ChatCompletionResponse>,
    done: bool,
}

impl ChatReframer {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            last: None,
            done: false,
        }
    }
}

impl Reframe for ChatReframer {
    fn event(&mut self, payload: &str) -> Result<Vec<Bytes>, RuntimeError> {
        if self.done {
            return Ok(Vec::new());
        }
        if payload.trim() == "[DONE]" {
            return Ok(self.terminal().into_iter().collect());
        }
        let chunk: ChatCompletionResponse = serde_json::from_str(payload)?;
        let mut lines = Vec::new();
        let content = chunk.first_content();
        if !content.is_empty() {
            lines.push(ndjson_line(&translate::chat_chunk(&self.model, &content)));
        }

        let merged = match self.last.take() {
            Some(mut prev) => {
                if chunk.finish_reason().is_some() {
                    prev.choices = chunk.choices.clone();
                }
                prev.usage = chunk.usage.clone().or(prev.usage);
                prev.timings = chunk.timings.clone().or(prev.timings);
                prev
            }
            None => chunk,
        };
        self.last = Some(merged);
        Ok(lines)
    }

    fn terminal(&mut self) -> Option<Bytes> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(ndjson_line(&translate::chat_terminal(
            &self.model,
            self.last.as_ref(),
        )))
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

struct ReframeState<R> {
    upstream: BoxStream<'static, Result<Bytes, RuntimeError>>,
    decoder: SseDecoder,
    reframer: R,
    pending: VecDeque<Bytes>,
    finished: bool,
}

impl<R: Reframe> ReframeState<R> {
    fn handle(&mut self, payload: &str) {
        if self.finished {
            return;
        }
        match self.reframer.event(payload) {
            Ok(lines) => self.pending.extend(lines),
            Err(e) => self.fail(&e.to_string()),
        }
        if self.reframer.is_done() {
            self.finished = true;
        }
    }

    fn fail(&mut self, message: &str) {
        warn!("upstream stream failed: {}", message);
        self.pending.push_back(error_line(message));
        self.finished = true;
    }
}

/// Turn a backend sse body into an ndjson body.
///
/// Lines are relayed as soon as each upstream chunk is decoded. The returned
/// stream ends after the terminal (or error) line; dropping it drops the
/// upstream connection.
pub fn reframe<R: Reframe>(
    upstream: BoxStream<'static, Result<Bytes, RuntimeError>>,
    reframer: R,
) -> BoxStream<'static, Bytes> {
    let state = ReframeState {
        upstream,
        decoder: SseDecoder::new(),
        reframer,
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(line) = st.pending.pop_front() {
                return Some((line, st));
            }
            if st.finished {
                return None;
            }
            match st.upstream.next().await {
                Some(Ok(bytes)) => {
                    for payload in st.decoder.push(&bytes) {
                        st.handle(&payload);
                    }
                }
                Some(Err(e)) => st.fail(&e.to_string()),
                None => {
                    if let Some(payload) = st.decoder.finish() {
                        st.handle(&payload);
                    }
                    if !st.finished {
                        debug!("upstream closed without terminal event");
                        if let Some(line) = st.reframer.terminal() {
                            st.pending.push_back(line);
                        }
                        st.finished = true;
                    }
                }
            }
        }
    })
    .boxed()
}
