//! Conversation state for one chat session.
//!
//! [`Session`] is synchronous: it decides what to dispatch and applies what
//! the stream task reports, but performs no I/O. The controller task in
//! [`crate::core::controller`] owns it and feeds it commands and stream
//! messages, which keeps every transcript mutation on a single task.

use std::error::Error;
use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::chat_stream::{ConnectionError, StreamMessage, StreamRequest};
use crate::core::message::Message;
use crate::core::transcript::{Transcript, TranscriptError};
use crate::utils::auth::AuthMode;

/// A service the session can dispatch to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub id: String,
    pub display_name: String,
    pub base_url: String,
    /// `None` until a key is known; keyless services carry an empty key.
    pub api_key: Option<String>,
    pub auth_mode: AuthMode,
}

/// The externally chosen model and service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub service: Option<ServiceEndpoint>,
    pub model: Option<String>,
}

struct DispatchTarget<'a> {
    service: &'a ServiceEndpoint,
    api_key: &'a str,
    model: &'a str,
}

impl Selection {
    fn dispatch_target(&self) -> Result<DispatchTarget<'_>, SessionError> {
        let service = self
            .service
            .as_ref()
            .ok_or(SessionError::NotReady("no service selected"))?;
        let api_key = service
            .api_key
            .as_deref()
            .ok_or(SessionError::NotReady("no API key for the selected service"))?;
        let model = self
            .model
            .as_deref()
            .ok_or(SessionError::NotReady("no model selected"))?;
        Ok(DispatchTarget {
            service,
            api_key,
            model,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.dispatch_target().is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Submit attempted without a complete model/service selection.
    NotReady(&'static str),
    /// The request failed before any content streamed.
    Connection(ConnectionError),
    /// The response failed mid-stream; partial content was kept.
    Stream(String),
    /// Internal misuse of the transcript.
    InvalidState(TranscriptError),
    /// The controller task is no longer running.
    Closed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotReady(reason) => write!(f, "Not ready to send: {reason}"),
            SessionError::Connection(err) => write!(f, "{err}"),
            SessionError::Stream(message) => write!(f, "{message}"),
            SessionError::InvalidState(err) => write!(f, "Invalid session state: {err}"),
            SessionError::Closed => write!(f, "Chat session has shut down"),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SessionError::Connection(err) => Some(err),
            SessionError::InvalidState(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionStatus {
    #[default]
    Idle,
    /// Request sent, waiting for the service to accept it.
    Dispatching,
    /// Response body is being consumed.
    Streaming,
}

/// How a dispatched stream ended. Exactly one notice is produced per stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    Completed { stream_id: u64 },
    Cancelled { stream_id: u64 },
    Failed { stream_id: u64, error: SessionError },
}

impl SessionNotice {
    pub fn stream_id(&self) -> u64 {
        match self {
            SessionNotice::Completed { stream_id }
            | SessionNotice::Cancelled { stream_id }
            | SessionNotice::Failed { stream_id, .. } => *stream_id,
        }
    }
}

/// Read-only view handed to the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub messages: Vec<Message>,
    pub status: SessionStatus,
    pub model: Option<String>,
    pub service: Option<String>,
}

impl SessionSnapshot {
    pub fn is_dispatching(&self) -> bool {
        self.status == SessionStatus::Dispatching
    }

    pub fn is_streaming(&self) -> bool {
        self.status == SessionStatus::Streaming
    }

    pub fn is_busy(&self) -> bool {
        self.status != SessionStatus::Idle
    }
}

/// A request the controller should hand to the stream service.
#[derive(Debug)]
pub struct PendingDispatch {
    pub stream_id: u64,
    /// Transcript slot the assistant reply will occupy.
    pub reply_index: usize,
    pub request: StreamRequest,
}

struct ActiveStream {
    id: u64,
    cancel_token: CancellationToken,
}

pub struct Session {
    transcript: Transcript,
    selection: Selection,
    system_prompt: String,
    status: SessionStatus,
    current_stream_id: u64,
    active_stream: Option<ActiveStream>,
}

impl Session {
    pub fn new(selection: Selection, system_prompt: impl Into<String>) -> Self {
        let mut session = Self {
            transcript: Transcript::new(),
            selection,
            system_prompt: system_prompt.into(),
            status: SessionStatus::Idle,
            current_stream_id: 0,
            active_stream: None,
        };
        if session.selection.model.is_some() {
            session.transcript.set_system_prompt(&session.system_prompt);
        }
        session
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_dispatching(&self) -> bool {
        self.status == SessionStatus::Dispatching
    }

    pub fn is_streaming(&self) -> bool {
        self.status == SessionStatus::Streaming
    }

    pub fn active_stream_id(&self) -> Option<u64> {
        self.active_stream.as_ref().map(|stream| stream.id)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            messages: self.transcript.messages().to_vec(),
            status: self.status,
            model: self.selection.model.clone(),
            service: self
                .selection
                .service
                .as_ref()
                .map(|service| service.id.clone()),
        }
    }

    /// Append the user's message and prepare a dispatch for it.
    ///
    /// Blank text is ignored and an incomplete selection is refused, both
    /// without touching the transcript. A stream that is still active is
    /// cancelled first; its notice is returned alongside the new dispatch.
    pub fn submit(
        &mut self,
        text: &str,
    ) -> Result<(Option<PendingDispatch>, Option<SessionNotice>), SessionError> {
        // Whitespace-only input is treated as empty on purpose.
        if text.trim().is_empty() {
            return Ok((None, None));
        }
        self.selection.dispatch_target()?;

        let superseded = self.cancel();
        self.transcript.append(Message::user(text));
        let reply_index = self.transcript.len();

        let (cancel_token, stream_id) = self.start_new_stream();
        let target = self.selection.dispatch_target()?;
        let request = StreamRequest {
            base_url: target.service.base_url.clone(),
            api_key: target.api_key.to_string(),
            auth_mode: target.service.auth_mode,
            model: target.model.to_string(),
            messages: self.transcript.api_messages(),
            cancel_token,
        };
        debug!(stream_id, model = %request.model, "Submitting message");

        Ok((
            Some(PendingDispatch {
                stream_id,
                reply_index,
                request,
            }),
            superseded,
        ))
    }

    fn start_new_stream(&mut self) -> (CancellationToken, u64) {
        self.current_stream_id += 1;
        let token = CancellationToken::new();
        self.active_stream = Some(ActiveStream {
            id: self.current_stream_id,
            cancel_token: token.clone(),
        });
        self.status = SessionStatus::Dispatching;
        (token, self.current_stream_id)
    }

    fn end_stream(&mut self) -> Option<u64> {
        let stream = self.active_stream.take()?;
        self.transcript.finalize_last();
        self.status = SessionStatus::Idle;
        Some(stream.id)
    }

    /// Cancel the active dispatch or stream. No-op when idle.
    pub fn cancel(&mut self) -> Option<SessionNotice> {
        let token = self
            .active_stream
            .as_ref()
            .map(|stream| stream.cancel_token.clone())?;
        token.cancel();
        let stream_id = self.end_stream()?;
        debug!(stream_id, "Stream cancelled");
        Some(SessionNotice::Cancelled { stream_id })
    }

    /// Apply a message from the stream task. Messages from any stream other
    /// than the active one are discarded.
    pub fn apply_stream_message(
        &mut self,
        stream_id: u64,
        message: StreamMessage,
    ) -> Option<SessionNotice> {
        if self.active_stream_id() != Some(stream_id) {
            debug!(stream_id, "Discarding message from inactive stream");
            return None;
        }

        match message {
            StreamMessage::Opened => {
                if self.status == SessionStatus::Dispatching {
                    self.transcript.begin_assistant();
                    self.status = SessionStatus::Streaming;
                }
                None
            }
            StreamMessage::Chunk(delta) => {
                if delta.is_empty() {
                    return None;
                }
                match self.transcript.update_last(&delta) {
                    Ok(()) => None,
                    Err(err) => {
                        warn!(stream_id, error = %err, "Dropping delta with no open target");
                        self.abort_active(stream_id);
                        Some(SessionNotice::Failed {
                            stream_id,
                            error: SessionError::InvalidState(err),
                        })
                    }
                }
            }
            StreamMessage::End => {
                self.end_stream();
                Some(SessionNotice::Completed { stream_id })
            }
            StreamMessage::Error(message) => {
                self.end_stream();
                Some(SessionNotice::Failed {
                    stream_id,
                    error: SessionError::Stream(message),
                })
            }
            StreamMessage::DispatchFailed(err) => {
                self.end_stream();
                Some(SessionNotice::Failed {
                    stream_id,
                    error: SessionError::Connection(err),
                })
            }
        }
    }

    fn abort_active(&mut self, stream_id: u64) {
        if let Some(stream) = &self.active_stream {
            stream.cancel_token.cancel();
        }
        self.end_stream();
        debug!(stream_id, "Stream aborted");
    }

    /// Switch models: cancels, clears the conversation, and inserts the
    /// system prompt for the new selection.
    pub fn select_model(&mut self, model: impl Into<String>) -> Option<SessionNotice> {
        let notice = self.cancel();
        self.selection.model = Some(model.into());
        self.transcript.reset();
        self.transcript.set_system_prompt(&self.system_prompt);
        notice
    }

    /// Switch services. A model belongs to its service, so it is cleared too.
    pub fn select_service(&mut self, service: Option<ServiceEndpoint>) -> Option<SessionNotice> {
        let notice = self.cancel();
        self.selection.service = service;
        self.selection.model = None;
        self.transcript.reset();
        notice
    }

    /// Change the system prompt. The leading system message is rewritten
    /// only while idle; otherwise the new prompt applies from the next
    /// conversation.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
        if self.selection.model.is_some() && self.active_stream.is_none() {
            self.transcript.set_system_prompt(&self.system_prompt);
        }
    }

    /// Start a fresh conversation with the current selection.
    pub fn new_conversation(&mut self) -> Option<SessionNotice> {
        let notice = self.cancel();
        self.transcript.reset();
        if self.selection.model.is_some() {
            self.transcript.set_system_prompt(&self.system_prompt);
        }
        notice
    }

    /// Return to the initial state: no stream, no selection, no messages.
    pub fn reset(&mut self) -> Option<SessionNotice> {
        let notice = self.cancel();
        self.transcript.reset();
        self.selection = Selection::default();
        notice
    }
}
