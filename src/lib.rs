//! Murmur is a line-oriented chat client for OpenAI-compatible language-model
//! services.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the conversation transcript, the session state machine and
//!   the task that drives it, streaming dispatch, and service/config
//!   resolution.
//! - [`api`] defines chat and model-listing payloads.
//! - [`cli`] parses arguments and renders published session state to the
//!   terminal.
//!
//! The binary (`src/main.rs`) routes through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod utils;
