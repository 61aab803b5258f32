use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::session::{OrchestratorSession, Phase};

/// Final snapshot written next to the event journal when a CLI session ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub influencer_id: String,
    pub query: String,
    pub phase: Phase,
    pub started_at: String,
    pub finished_at: String,
    pub total_sub_tasks: u64,
    pub failed_sub_tasks: u64,
    pub total_web_items: u64,
    pub total_images: u64,
    pub slide_urls: Vec<String>,
    pub grid_url: Option<String>,
    pub error: Option<String>,
}

impl SessionSummary {
    pub fn from_session(session: &OrchestratorSession) -> Self {
        let failed_sub_tasks = session
            .research_plan
            .iter()
            .filter(|task| task.error.is_some())
            .count() as u64;
        let (total_web_items, total_images) = session
            .research_results
            .values()
            .fold((0u64, 0u64), |(web, images), results| {
                (
                    web + results.web_items.len() as u64,
                    images + results.images.len() as u64,
                )
            });
        Self {
            session_id: session.session_id.clone(),
            influencer_id: session.influencer_id.clone(),
            query: session.query.clone(),
            phase: session.phase,
            started_at: session.created_at.clone(),
            finished_at: session.updated_at.clone(),
            total_sub_tasks: session.research_plan.len() as u64,
            failed_sub_tasks,
            total_web_items,
            total_images,
            slide_urls: session
                .generated_post
                .as_ref()
                .map(|post| post.slide_urls.clone())
                .unwrap_or_default(),
            grid_url: session
                .generated_post
                .as_ref()
                .map(|post| post.grid_url.clone()),
            error: session.error.clone(),
        }
    }
}

pub fn write_summary(
    path: &Path,
    summary: &SessionSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
