//! Command-line interface parsing and handling
//!
//! The CLI is a thin collaborator of the session controller: it resolves a
//! service and model from flags and config, spawns a session, and prints
//! what the session publishes.

pub mod chat;
pub mod model_list;
pub mod say;

use std::error::Error;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cli::chat::run_chat;
use crate::cli::model_list::list_models;
use crate::cli::say::run_say;
use crate::core::config::Config;
use crate::core::keyring::{delete_api_key, store_api_key};
use crate::core::services::{resolve_service, ServiceResolutionError, SystemKeySource};
use crate::core::session::{Selection, ServiceEndpoint, Session};

const LOG_ENV_VAR: &str = "MURMUR_LOG";

#[derive(Parser)]
#[command(name = "murmur")]
#[command(about = "Stream chat completions from OpenAI-compatible services")]
#[command(
    long_about = "Murmur is a line-oriented chat client for OpenAI-compatible services. \
Replies stream to the terminal as they arrive.\n\n\
Services:\n\
  Built in: openai, openrouter, anthropic, ollama. Add keys with\n\
  'murmur set api-key <service> <key>' or <SERVICE>_API_KEY.\n\n\
Environment Variables (used when no service is selected):\n\
  OPENAI_API_KEY    Your OpenAI API key\n\
  OPENAI_BASE_URL   Custom API base URL (optional, defaults to https://api.openai.com/v1)\n\
  MURMUR_LOG        Log filter for diagnostics on stderr (default: warn)\n\n\
Chat commands:\n\
  /reset            Start a new conversation\n\
  /model <id>       Switch model (starts a new conversation)\n\
  /system <text>    Replace the system prompt\n\
  /quit             Leave the chat\n\
  Ctrl+C            Cancel the reply in progress, or quit when idle"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Model to use
    #[arg(short = 'm', long, global = true, value_name = "MODEL")]
    pub model: Option<String>,

    /// Service to use (a built-in or configured service id)
    #[arg(short = 's', long, global = true, value_name = "SERVICE")]
    pub service: Option<String>,

    /// System prompt for this run, overriding the configured one
    #[arg(long, global = true, value_name = "PROMPT")]
    pub system: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive chat (default)
    Chat,
    /// Send a single prompt and stream the reply to stdout
    Say {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        prompt: Vec<String>,
    },
    /// List the models offered by the selected service
    Models,
    /// Set configuration values
    Set {
        /// One of: default-service, default-model, system-prompt, api-key
        key: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        value: Vec<String>,
    },
    /// Unset configuration values
    Unset {
        /// One of: default-service, default-model, system-prompt, api-key
        key: String,
        /// Service the key applies to, where relevant
        value: Option<String>,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main())
}

/// Diagnostics go to stderr so they never interleave with streamed replies.
fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    match args.command {
        None | Some(Commands::Chat) => {
            let config = Config::load()?;
            let session = prepare_session(&config, &args.service, &args.model, &args.system);
            run_chat(session).await
        }
        Some(Commands::Say { ref prompt }) => {
            let prompt = prompt.join(" ");
            if prompt.trim().is_empty() {
                eprintln!("Usage: murmur say <prompt>");
                std::process::exit(1);
            }
            let config = Config::load()?;
            let session = prepare_session(&config, &args.service, &args.model, &args.system);
            run_say(session, prompt).await
        }
        Some(Commands::Models) => {
            let config = Config::load()?;
            let endpoint = resolve_or_exit(&config, args.service.as_deref());
            list_models(&config, &endpoint).await
        }
        Some(Commands::Set { key, value }) => set_value(&key, &value),
        Some(Commands::Unset { key, value }) => unset_value(&key, value.as_deref()),
    }
}

/// Resolve the service, printing quick fixes and exiting on failure.
fn resolve_or_exit(config: &Config, service: Option<&str>) -> ServiceEndpoint {
    match resolve_service(&SystemKeySource, config, service) {
        Ok(endpoint) => endpoint,
        Err(err) => exit_with_resolution_error(err),
    }
}

fn exit_with_resolution_error(err: ServiceResolutionError) -> ! {
    eprintln!("{err}");
    let fixes = err.quick_fixes();
    if !fixes.is_empty() {
        eprintln!();
        eprintln!("💡 Quick fixes:");
        for fix in fixes {
            eprintln!("  • {fix}");
        }
    }
    std::process::exit(err.exit_code());
}

fn prepare_session(
    config: &Config,
    service: &Option<String>,
    model: &Option<String>,
    system: &Option<String>,
) -> Session {
    let endpoint = resolve_or_exit(config, service.as_deref());
    let model = model
        .clone()
        .filter(|model| !model.is_empty())
        .or_else(|| config.get_default_model(&endpoint.id).cloned());
    let system_prompt = system.as_deref().unwrap_or(config.system_prompt());

    Session::new(
        Selection {
            service: Some(endpoint),
            model,
        },
        system_prompt,
    )
}

fn set_value(key: &str, value: &[String]) -> Result<(), Box<dyn Error>> {
    let mut config = Config::load()?;
    if value.is_empty() {
        config.print_all();
        return Ok(());
    }

    match key {
        "default-service" => {
            let service = value.join(" ");
            config.default_service = Some(service.clone());
            config.save()?;
            println!("✅ Set default-service to: {service}");
        }
        "default-model" => match value {
            [service, model @ ..] if !model.is_empty() => {
                let model = model.join(" ");
                config.set_default_model(service.clone(), model.clone());
                config.save()?;
                println!("✅ Set default-model for service '{service}' to: {model}");
            }
            _ => {
                eprintln!("⚠️  To set a default model, specify the service and model:");
                eprintln!("Example: murmur set default-model openai gpt-4o");
            }
        },
        "system-prompt" => {
            let prompt = value.join(" ");
            config.set_system_prompt(prompt);
            config.save()?;
            println!("✅ Set system-prompt");
        }
        "api-key" => match value {
            [service, key] => {
                store_api_key(service, key)?;
                println!("✅ Stored API key for service '{service}' in the system keyring");
            }
            _ => {
                eprintln!("⚠️  To store an API key, specify the service and key:");
                eprintln!("Example: murmur set api-key openrouter sk-or-...");
            }
        },
        _ => {
            eprintln!("❌ Unknown config key: {key}");
            std::process::exit(1);
        }
    }
    Ok(())
}

fn unset_value(key: &str, value: Option<&str>) -> Result<(), Box<dyn Error>> {
    let mut config = Config::load()?;
    match (key, value) {
        ("default-service", _) => {
            config.default_service = None;
            config.save()?;
            println!("✅ Unset default-service");
        }
        ("system-prompt", _) => {
            config.unset_system_prompt();
            config.save()?;
            println!("✅ Unset system-prompt");
        }
        ("default-model", Some(service)) => {
            config.unset_default_model(service);
            config.save()?;
            println!("✅ Unset default-model for service: {service}");
        }
        ("api-key", Some(service)) => {
            if delete_api_key(service)? {
                println!("✅ Removed API key for service: {service}");
            } else {
                println!("No stored API key for service: {service}");
            }
        }
        ("default-model" | "api-key", None) => {
            eprintln!("⚠️  Specify the service, for example: murmur unset {key} openai");
        }
        _ => {
            eprintln!("❌ Unknown config key: {key}");
            std::process::exit(1);
        }
    }
    Ok(())
}
