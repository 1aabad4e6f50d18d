pub mod builtin_services;
pub mod chat_stream;
pub mod config;
pub mod controller;
pub mod keyring;
pub mod message;
pub mod services;
pub mod session;
pub mod transcript;
