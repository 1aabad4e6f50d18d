//! The task that owns a [`Session`].
//!
//! UI code talks to it through a cloneable [`SessionHandle`]; the stream
//! service reports back over its own channel. Commands are polled before
//! stream messages so a cancel overtakes chunks that are already queued.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::chat_stream::{ChatBackend, ChatStreamService, StreamMessage};
use crate::core::session::{
    ServiceEndpoint, Session, SessionError, SessionNotice, SessionSnapshot,
};

/// A stream started by a submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub stream_id: u64,
    /// Index of the assistant reply in the snapshot's messages.
    pub reply_index: usize,
}

/// Outcome of a submit: the stream it started, or `None` when the text was
/// empty.
pub type SubmitResult = Result<Option<Submitted>, SessionError>;

enum SessionCommand {
    Submit {
        text: String,
        reply: oneshot::Sender<SubmitResult>,
    },
    Cancel,
    NewConversation,
    Reset,
    SelectModel(String),
    SelectService(Option<ServiceEndpoint>),
    SetSystemPrompt(String),
}

#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Closed)
    }

    /// Submit user text. An incomplete selection is reported here as
    /// [`SessionError::NotReady`] and never as a notice.
    pub async fn submit(&self, text: impl Into<String>) -> SubmitResult {
        let (reply, response) = oneshot::channel();
        self.send(SessionCommand::Submit {
            text: text.into(),
            reply,
        })?;
        response.await.map_err(|_| SessionError::Closed)?
    }

    pub fn cancel(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Cancel)
    }

    pub fn new_conversation(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::NewConversation)
    }

    pub fn reset(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Reset)
    }

    pub fn select_model(&self, model: impl Into<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::SelectModel(model.into()))
    }

    pub fn select_service(&self, service: Option<ServiceEndpoint>) -> Result<(), SessionError> {
        self.send(SessionCommand::SelectService(service))
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::SetSystemPrompt(prompt.into()))
    }

    /// The latest published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver that is notified after every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }
}

pub struct SessionController {
    session: Session,
    stream_service: ChatStreamService,
    stream_rx: mpsc::UnboundedReceiver<(StreamMessage, u64)>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    notice_tx: mpsc::UnboundedSender<SessionNotice>,
}

/// Start a controller task for `session`.
///
/// The task ends, cancelling any active stream, once every handle is dropped.
pub fn spawn_session(
    session: Session,
    backend: Arc<dyn ChatBackend>,
) -> (
    SessionHandle,
    mpsc::UnboundedReceiver<SessionNotice>,
    JoinHandle<()>,
) {
    let (controller, handle, notices) = SessionController::new(session, backend);
    let task = tokio::spawn(controller.run());
    (handle, notices, task)
}

impl SessionController {
    pub fn new(
        session: Session,
        backend: Arc<dyn ChatBackend>,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionNotice>) {
        let (stream_service, stream_rx) = ChatStreamService::new(backend);
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
        let (notice_tx, notices) = mpsc::unbounded_channel();

        let controller = Self {
            session,
            stream_service,
            stream_rx,
            commands,
            snapshot_tx,
            notice_tx,
        };
        let handle = SessionHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
        };
        (controller, handle, notices)
    }

    pub async fn run(mut self) {
        loop {
            let notices = tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some((message, stream_id)) = self.stream_rx.recv() => {
                    self.session.apply_stream_message(stream_id, message).into_iter().collect()
                }
            };
            self.publish(notices);
        }

        let notice = self.session.cancel();
        self.publish(notice.into_iter().collect());
        debug!("Session controller stopped");
    }

    fn handle_command(&mut self, command: SessionCommand) -> Vec<SessionNotice> {
        match command {
            SessionCommand::Submit { text, reply } => match self.session.submit(&text) {
                Ok((dispatch, superseded)) => {
                    let submitted = dispatch.map(|dispatch| {
                        self.stream_service
                            .spawn_stream(dispatch.request, dispatch.stream_id);
                        Submitted {
                            stream_id: dispatch.stream_id,
                            reply_index: dispatch.reply_index,
                        }
                    });
                    self.publish(superseded.into_iter().collect());
                    let _ = reply.send(Ok(submitted));
                    Vec::new()
                }
                Err(err) => {
                    debug!(error = %err, "Submit refused");
                    let _ = reply.send(Err(err));
                    Vec::new()
                }
            },
            SessionCommand::Cancel => self.session.cancel().into_iter().collect(),
            SessionCommand::NewConversation => {
                self.session.new_conversation().into_iter().collect()
            }
            SessionCommand::Reset => self.session.reset().into_iter().collect(),
            SessionCommand::SelectModel(model) => {
                self.session.select_model(model).into_iter().collect()
            }
            SessionCommand::SelectService(service) => {
                self.session.select_service(service).into_iter().collect()
            }
            SessionCommand::SetSystemPrompt(prompt) => {
                self.session.set_system_prompt(prompt);
                Vec::new()
            }
        }
    }

    /// Publish the new snapshot before the notices, so a notice observer
    /// always sees the state that produced it.
    fn publish(&self, notices: Vec<SessionNotice>) {
        let snapshot = self.session.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
        for notice in notices {
            let _ = self.notice_tx.send(notice);
        }
    }
}
