//! Backend dispatch and streaming response decoding.
//!
//! [`ChatBackend::send`] resolves once response headers arrive and hands back
//! a [`StreamHandle`]. The handle turns the server-sent event body into
//! [`StreamEvent`]s, one delta at a time, and races every read against its
//! cancellation token. [`ChatStreamService`] runs a handle to completion on a
//! spawned task and forwards what it reads, tagged with a stream id, to the
//! session controller.

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ChatMessage, ChatRequest, ChatResponse};
use crate::utils::auth::{add_auth_headers, AuthMode};
use crate::utils::url::construct_api_url;

/// What the stream task reports back to the session controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamMessage {
    /// The backend accepted the request and the body is being read.
    Opened,
    Chunk(String),
    /// The body failed mid-stream; no further messages follow.
    Error(String),
    /// The request never reached the streaming stage.
    DispatchFailed(ConnectionError),
    End,
}

/// Failure to establish a streaming response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionError {
    /// HTTP status when the service answered with a non-success code.
    pub status: Option<u16>,
    pub message: String,
}

impl ConnectionError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "Request failed with status {status}: {}", self.message),
            None => write!(f, "Could not reach service: {}", self.message),
        }
    }
}

impl Error for ConnectionError {}

/// Result of decoding a single line of a server-sent event body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseLine {
    Delta(String),
    /// Comments, keepalives, non-data fields and empty deltas.
    Skip,
    Done,
    Error(String),
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

pub fn decode_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    let Some(payload) = extract_data_payload(line) else {
        return SseLine::Skip;
    };

    if payload == "[DONE]" {
        return SseLine::Done;
    }
    if payload.is_empty() {
        return SseLine::Skip;
    }

    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) if response.error.is_some() => SseLine::Error(format_api_error(payload)),
        Ok(response) => response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .map(SseLine::Delta)
            .unwrap_or(SseLine::Skip),
        Err(_) => SseLine::Error(format_api_error(payload)),
    }
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Render a service error body for display, fencing it by detected format.
pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API Error:\n```\n<empty>\n```".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Ok(pretty_json) = serde_json::to_string_pretty(&json_value) {
            return match extract_error_summary(&json_value) {
                Some(summary) if !summary.is_empty() => {
                    format!("API Error: {summary}\n```json\n{pretty_json}\n```")
                }
                _ => format!("API Error:\n```json\n{pretty_json}\n```"),
            };
        }
    }

    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        format!("API Error:\n```xml\n{trimmed}\n```")
    } else {
        format!("API Error:\n```\n{trimmed}\n```")
    }
}

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, String>>;

/// Lifecycle of a [`StreamHandle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    Open,
    Closed,
    Cancelled,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Closed,
    Cancelled,
    Failed(String),
}

impl StreamEvent {
    fn terminal_state(&self) -> Option<HandleState> {
        match self {
            StreamEvent::Delta(_) => None,
            StreamEvent::Closed => Some(HandleState::Closed),
            StreamEvent::Cancelled => Some(HandleState::Cancelled),
            StreamEvent::Failed(_) => Some(HandleState::Failed),
        }
    }
}

/// One in-flight backend response.
pub struct StreamHandle {
    body: ByteStream,
    cancel_token: CancellationToken,
    buffer: Vec<u8>,
    pending: VecDeque<StreamEvent>,
    terminal_queued: bool,
    finished: Option<StreamEvent>,
}

impl StreamHandle {
    pub fn new(body: ByteStream, cancel_token: CancellationToken) -> Self {
        Self {
            body,
            cancel_token,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            terminal_queued: false,
            finished: None,
        }
    }

    pub fn from_response(response: reqwest::Response, cancel_token: CancellationToken) -> Self {
        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|err| err.to_string())
            })
            .boxed();
        Self::new(body, cancel_token)
    }

    pub fn state(&self) -> HandleState {
        self.finished
            .as_ref()
            .and_then(StreamEvent::terminal_state)
            .unwrap_or(HandleState::Open)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&mut self) {
        self.cancel_token.cancel();
        if self.finished.is_none() {
            self.finish(StreamEvent::Cancelled);
        }
    }

    /// Wait for the next delta or the terminal event.
    ///
    /// Once terminal, every further call returns the same terminal event.
    pub async fn next_event(&mut self) -> StreamEvent {
        loop {
            if let Some(event) = &self.finished {
                return event.clone();
            }
            if self.cancel_token.is_cancelled() {
                return self.finish(StreamEvent::Cancelled);
            }
            if let Some(event) = self.pending.pop_front() {
                return match event {
                    StreamEvent::Delta(_) => event,
                    terminal => self.finish(terminal),
                };
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => None,
                chunk = self.body.next() => Some(chunk),
            };

            match next {
                None => return self.finish(StreamEvent::Cancelled),
                Some(Some(Ok(bytes))) => self.decode_chunk(&bytes),
                Some(Some(Err(err))) => {
                    return self.finish(StreamEvent::Failed(format!("Stream interrupted: {err}")))
                }
                Some(None) => {
                    self.decode_tail();
                    self.queue(StreamEvent::Closed);
                }
            }
        }
    }

    fn finish(&mut self, event: StreamEvent) -> StreamEvent {
        // Dropping the body releases the underlying connection.
        self.body = stream::empty().boxed();
        self.buffer.clear();
        self.pending.clear();
        self.finished = Some(event.clone());
        event
    }

    fn queue(&mut self, event: StreamEvent) {
        if self.terminal_queued {
            return;
        }
        self.terminal_queued = event.terminal_state().is_some();
        self.pending.push_back(event);
    }

    fn decode_chunk(&mut self, bytes: &[u8]) {
        if self.terminal_queued {
            return;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            self.decode_line(&line[..newline_pos]);
            if self.terminal_queued {
                self.buffer.clear();
                break;
            }
        }
    }

    fn decode_tail(&mut self) {
        if self.terminal_queued || self.buffer.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.buffer);
        self.decode_line(&line);
    }

    fn decode_line(&mut self, line: &[u8]) {
        let line = match std::str::from_utf8(line) {
            Ok(line) => line,
            Err(err) => {
                warn!("Skipping invalid UTF-8 in stream: {err}");
                return;
            }
        };

        match decode_sse_line(line) {
            SseLine::Delta(delta) => self.queue(StreamEvent::Delta(delta)),
            SseLine::Skip => {}
            SseLine::Done => self.queue(StreamEvent::Closed),
            SseLine::Error(message) => self.queue(StreamEvent::Failed(message)),
        }
    }
}

/// Everything needed to open one streaming completion.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub base_url: String,
    pub api_key: String,
    pub auth_mode: AuthMode,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub cancel_token: CancellationToken,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Open a streaming completion, resolving once the service has accepted
    /// the request and before any content has been read.
    async fn send(&self, request: StreamRequest) -> Result<StreamHandle, ConnectionError>;
}

/// OpenAI-compatible `chat/completions` backend over reqwest.
#[derive(Clone, Default)]
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn send(&self, request: StreamRequest) -> Result<StreamHandle, ConnectionError> {
        let StreamRequest {
            base_url,
            api_key,
            auth_mode,
            model,
            messages,
            cancel_token,
        } = request;

        let body = ChatRequest {
            model,
            messages,
            stream: true,
        };

        let chat_url = construct_api_url(&base_url, "chat/completions");
        debug!(url = %chat_url, model = %body.model, "Dispatching chat request");

        let http_request = self
            .client
            .post(chat_url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        let http_request = add_auth_headers(http_request, auth_mode, &api_key);

        let response = http_request
            .json(&body)
            .send()
            .await
            .map_err(|err| ConnectionError::unreachable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(ConnectionError::status(
                status.as_u16(),
                format_api_error(&error_text),
            ));
        }

        Ok(StreamHandle::from_response(response, cancel_token))
    }
}

/// Runs dispatch plus consumption for each stream on its own task.
#[derive(Clone)]
pub struct ChatStreamService {
    tx: mpsc::UnboundedSender<(StreamMessage, u64)>,
    backend: Arc<dyn ChatBackend>,
}

impl ChatStreamService {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<(StreamMessage, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, backend }, rx)
    }

    pub fn spawn_stream(&self, request: StreamRequest, stream_id: u64) {
        let tx = self.tx.clone();
        let backend = Arc::clone(&self.backend);

        tokio::spawn(async move {
            let cancel_token = request.cancel_token.clone();

            let sent = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => None,
                result = backend.send(request) => Some(result),
            };

            let mut handle = match sent {
                None => {
                    debug!(stream_id, "Dispatch cancelled before the stream opened");
                    return;
                }
                Some(Err(err)) => {
                    debug!(stream_id, error = %err, "Dispatch failed");
                    let _ = tx.send((StreamMessage::DispatchFailed(err), stream_id));
                    return;
                }
                Some(Ok(handle)) => handle,
            };

            if tx.send((StreamMessage::Opened, stream_id)).is_err() {
                handle.cancel();
                return;
            }

            loop {
                let message = match handle.next_event().await {
                    StreamEvent::Delta(delta) => StreamMessage::Chunk(delta),
                    StreamEvent::Closed => StreamMessage::End,
                    StreamEvent::Failed(err) => StreamMessage::Error(err),
                    StreamEvent::Cancelled => {
                        debug!(stream_id, "Stream cancelled");
                        return;
                    }
                };

                let terminal = !matches!(message, StreamMessage::Chunk(_));
                if tx.send((message, stream_id)).is_err() {
                    handle.cancel();
                    return;
                }
                if terminal {
                    debug!(stream_id, state = ?handle.state(), "Stream finished");
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests;
