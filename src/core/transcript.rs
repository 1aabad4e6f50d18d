//! Ordered conversation history.
//!
//! The transcript only grows at the end, with one exception: the trailing
//! assistant message may have text appended while it is the open streaming
//! target. Once finalized it is as immutable as every other entry.

use std::error::Error;
use std::fmt;

use crate::api::ChatMessage;
use crate::core::message::{Message, Role};

/// Misuse of the transcript's mutation contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptError {
    /// `update_last` was called on an empty transcript.
    Empty,
    /// The last message is not an assistant message.
    NotAssistant(Role),
    /// The last assistant message has already been finalized.
    Finalized,
}

impl fmt::Display for TranscriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptError::Empty => write!(f, "transcript has no messages to update"),
            TranscriptError::NotAssistant(role) => {
                write!(f, "last message has role '{role}', expected 'assistant'")
            }
            TranscriptError::Finalized => {
                write!(f, "last assistant message is already finalized")
            }
        }
    }
}

impl Error for TranscriptError {}

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    open_target: bool,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// True while the trailing assistant message still accepts deltas.
    pub fn has_open_target(&self) -> bool {
        self.open_target
    }

    /// Push a finished message. Any open assistant target is finalized first.
    pub fn append(&mut self, message: Message) {
        self.open_target = false;
        self.messages.push(message);
    }

    /// Push an empty assistant message and make it the streaming target.
    pub fn begin_assistant(&mut self) {
        self.append(Message::assistant(String::new()));
        self.open_target = true;
    }

    pub fn update_last(&mut self, delta: &str) -> Result<(), TranscriptError> {
        let last = self.messages.last_mut().ok_or(TranscriptError::Empty)?;
        if !last.is_assistant() {
            return Err(TranscriptError::NotAssistant(last.role));
        }
        if !self.open_target {
            return Err(TranscriptError::Finalized);
        }
        last.content.push_str(delta);
        Ok(())
    }

    /// Close the streaming target. Returns whether one was open.
    pub fn finalize_last(&mut self) -> bool {
        std::mem::take(&mut self.open_target)
    }

    pub fn reset(&mut self) {
        self.messages.clear();
        self.open_target = false;
    }

    /// Install `prompt` as the leading system message, replacing an existing one.
    pub fn set_system_prompt(&mut self, prompt: &str) {
        match self.messages.first_mut() {
            Some(first) if first.is_system() => first.content = prompt.to_string(),
            _ => self.messages.insert(0, Message::system(prompt)),
        }
    }

    /// Wire representation of the whole conversation, in order.
    pub fn api_messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(Message::to_api_message).collect()
    }
}
