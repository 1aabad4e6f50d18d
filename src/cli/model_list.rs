//! Model listing for the selected service

use std::error::Error;

use chrono::{DateTime, Utc};

use crate::api::models::{fetch_models, sort_models};
use crate::api::ModelInfo;
use crate::core::config::Config;
use crate::core::session::ServiceEndpoint;

pub async fn list_models(
    config: &Config,
    endpoint: &ServiceEndpoint,
) -> Result<(), Box<dyn Error>> {
    println!("🤖 Available Models for {}", endpoint.display_name);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();

    if let Some(default_model) = config.get_default_model(&endpoint.id) {
        println!("🎯 Default model for this service: {default_model} (from config)");
        println!();
    }

    let client = reqwest::Client::new();
    let mut models = fetch_models(&client, endpoint).await?.data;

    if models.is_empty() {
        println!("No models found for this service.");
        return Ok(());
    }

    println!("Found {} models (sorted newest first):", models.len());
    println!();
    sort_models(&mut models);
    for model in &models {
        for line in describe_model(model) {
            println!("{line}");
        }
        println!();
    }

    Ok(())
}

fn describe_model(model: &ModelInfo) -> Vec<String> {
    let mut lines = vec![format!("  • {}", model.id)];
    if let Some(display_name) = model
        .display_name
        .as_deref()
        .filter(|name| !name.is_empty() && *name != model.id)
    {
        lines.push(format!("    Name: {display_name}"));
    }
    if let Some(owned_by) = model
        .owned_by
        .as_deref()
        .filter(|owner| !owner.is_empty() && *owner != "system")
    {
        lines.push(format!("    Owner: {owned_by}"));
    }
    if let Some(created) = created_label(model) {
        lines.push(format!("    Created: {created}"));
    }
    lines
}

fn created_label(model: &ModelInfo) -> Option<String> {
    match model.created {
        Some(created) if created > 0 => {
            // Some services report milliseconds.
            let secs = if created > 10_000_000_000 {
                created / 1000
            } else {
                created
            };
            let datetime = DateTime::<Utc>::from_timestamp(i64::try_from(secs).ok()?, 0)?;
            Some(datetime.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        }
        Some(_) => None,
        None => model.created_at.clone().filter(|at| !at.is_empty()),
    }
}
