//! One-shot "say" command, plus the reply follower shared with `chat`

use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::core::chat_stream::HttpBackend;
use crate::core::controller::{spawn_session, SessionHandle};
use crate::core::session::{Session, SessionError, SessionNotice, SessionSnapshot};

/// Writes an assistant message incrementally as snapshots grow it.
pub(crate) struct ReplyPrinter<W: Write> {
    out: W,
    index: usize,
    printed: usize,
}

impl<W: Write> ReplyPrinter<W> {
    /// Follow the message that will appear at `index` in the transcript.
    pub(crate) fn new(out: W, index: usize) -> Self {
        Self {
            out,
            index,
            printed: 0,
        }
    }

    pub(crate) fn update(&mut self, snapshot: &SessionSnapshot) -> io::Result<()> {
        let Some(message) = snapshot.messages.get(self.index) else {
            return Ok(());
        };
        if !message.is_assistant() {
            return Ok(());
        }
        let Some(appended) = message.content.get(self.printed..) else {
            return Ok(());
        };
        if appended.is_empty() {
            return Ok(());
        }
        self.out.write_all(appended.as_bytes())?;
        self.out.flush()?;
        self.printed = message.content.len();
        Ok(())
    }

    pub(crate) fn printed_any(&self) -> bool {
        self.printed > 0
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}

/// Print the reply for `stream_id` until its terminal notice arrives.
/// Ctrl+C cancels the stream instead of killing the process.
pub(crate) async fn follow_reply<W: Write>(
    handle: &SessionHandle,
    notices: &mut mpsc::UnboundedReceiver<SessionNotice>,
    stream_id: u64,
    printer: &mut ReplyPrinter<W>,
) -> Result<SessionNotice, Box<dyn Error>> {
    let mut snapshots = handle.subscribe();
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Err(SessionError::Closed.into());
                }
                let snapshot = snapshots.borrow_and_update().clone();
                printer.update(&snapshot)?;
            }
            notice = notices.recv() => {
                let Some(notice) = notice else {
                    return Err(SessionError::Closed.into());
                };
                if notice.stream_id() == stream_id {
                    printer.update(&handle.snapshot())?;
                    return Ok(notice);
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                handle.cancel()?;
            }
        }
    }
}

pub async fn run_say(session: Session, prompt: String) -> Result<(), Box<dyn Error>> {
    let (handle, mut notices, _task) = spawn_session(session, Arc::new(HttpBackend::default()));

    let submitted = match handle.submit(prompt).await {
        Ok(Some(submitted)) => submitted,
        Ok(None) => return Ok(()),
        Err(SessionError::NotReady(reason)) => {
            eprintln!("❌ Cannot send: {reason}");
            eprintln!("Pass -m <model> or run 'murmur set default-model <service> <model>'.");
            std::process::exit(2);
        }
        Err(err) => return Err(err.into()),
    };

    let mut printer = ReplyPrinter::new(io::stdout(), submitted.reply_index);
    let notice = follow_reply(&handle, &mut notices, submitted.stream_id, &mut printer).await?;

    match notice {
        SessionNotice::Completed { .. } => {
            println!();
            Ok(())
        }
        SessionNotice::Cancelled { .. } => {
            if printer.printed_any() {
                println!();
            }
            eprintln!("⏹️  Cancelled");
            Ok(())
        }
        SessionNotice::Failed { error, .. } => {
            if printer.printed_any() {
                println!();
            }
            eprintln!("❌ Error: {error}");
            std::process::exit(1);
        }
    }
}
