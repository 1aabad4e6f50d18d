//! Line-oriented interactive chat

use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::cli::say::{follow_reply, ReplyPrinter};
use crate::core::chat_stream::HttpBackend;
use crate::core::controller::spawn_session;
use crate::core::session::{Session, SessionError, SessionNotice};

#[derive(Debug, PartialEq, Eq)]
enum ReplInput {
    Empty,
    Quit,
    Reset,
    Model(String),
    System(String),
    Message(String),
    Unknown(String),
}

fn parse_input(line: &str) -> ReplInput {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ReplInput::Empty;
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return ReplInput::Message(trimmed.to_string());
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    match name {
        "quit" | "exit" => ReplInput::Quit,
        "reset" | "new" => ReplInput::Reset,
        "model" if !rest.is_empty() => ReplInput::Model(rest.to_string()),
        "system" => ReplInput::System(rest.to_string()),
        _ => ReplInput::Unknown(trimmed.to_string()),
    }
}

fn print_prompt() -> io::Result<()> {
    let mut stdout = io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()
}

pub async fn run_chat(session: Session) -> Result<(), Box<dyn Error>> {
    let (handle, mut notices, task) = spawn_session(session, Arc::new(HttpBackend::default()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let snapshot = handle.snapshot();
    match (&snapshot.service, &snapshot.model) {
        (Some(service), Some(model)) => eprintln!("💬 Chatting with {model} via {service}"),
        (Some(service), None) => {
            eprintln!("💬 Connected to {service}. Choose a model with /model <id>")
        }
        _ => {}
    }
    eprintln!("💡 Ctrl+C cancels a reply, /quit leaves");

    loop {
        print_prompt()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            signal = tokio::signal::ctrl_c() => {
                signal?;
                println!();
                None
            }
        };
        let Some(line) = line else {
            break;
        };

        let text = match parse_input(&line) {
            ReplInput::Empty => continue,
            ReplInput::Quit => break,
            ReplInput::Reset => {
                handle.new_conversation()?;
                eprintln!("🧹 Started a new conversation");
                continue;
            }
            ReplInput::Model(model) => {
                eprintln!("🤖 Switched to {model}; started a new conversation");
                handle.select_model(model)?;
                continue;
            }
            ReplInput::System(prompt) => {
                handle.set_system_prompt(prompt)?;
                eprintln!("📝 Updated the system prompt");
                continue;
            }
            ReplInput::Unknown(command) => {
                eprintln!("⚠️  Unknown command: {command}");
                continue;
            }
            ReplInput::Message(text) => text,
        };

        let submitted = match handle.submit(text).await {
            Ok(Some(submitted)) => submitted,
            Ok(None) => continue,
            Err(SessionError::NotReady(reason)) => {
                eprintln!("⚠️  Cannot send: {reason}");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let mut printer = ReplyPrinter::new(io::stdout(), submitted.reply_index);
        match follow_reply(&handle, &mut notices, submitted.stream_id, &mut printer).await? {
            SessionNotice::Completed { .. } => println!(),
            SessionNotice::Cancelled { .. } => {
                if printer.printed_any() {
                    println!();
                }
                eprintln!("⏹️  Cancelled");
            }
            SessionNotice::Failed { error, .. } => {
                if printer.printed_any() {
                    println!();
                }
                eprintln!("❌ Error: {error}");
            }
        }
    }

    drop(handle);
    task.await?;
    debug!("Chat ended");
    Ok(())
}
