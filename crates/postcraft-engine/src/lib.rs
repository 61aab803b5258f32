pub mod capabilities;
pub mod composer;
pub mod config;
pub mod error;
pub mod grid;
pub mod hub;
pub mod orchestrator;
pub mod planner;
pub mod providers;
pub mod research;
pub mod slides;
pub mod store;
pub mod strategist;

#[cfg(test)]
mod testkit;

use std::env;

use serde_json::{Map, Value};

pub use config::StudioConfig;
pub use error::{StudioError, StudioResult};
pub use hub::{EventHub, HubMessage, Subscription};
pub use orchestrator::{Capabilities, Orchestrator, RetryOutcome, StartRequest};

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing: &String| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

/// Strips a surrounding markdown code fence (```json ... ```) if present.
pub(crate) fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest.trim_start_matches(|ch: char| ch.is_ascii_alphabetic()),
    };
    body.trim_end().trim_end_matches("```").trim()
}
