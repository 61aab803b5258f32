use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

pub const ORCH_PLANNING: &str = "orch_planning";
pub const ORCH_PLAN_READY: &str = "orch_plan_ready";
pub const ORCH_RESEARCHING: &str = "orch_researching";
pub const ORCH_QUESTION: &str = "orch_question";
pub const ORCH_RESEARCH_READY: &str = "orch_research_ready";
pub const ORCH_GENERATING: &str = "orch_generating";
pub const ORCH_POST_READY: &str = "orch_post_ready";
pub const ORCH_ERROR: &str = "orch_error";
pub const POST_UPDATE: &str = "post_update";
pub const STATUS_UPDATE: &str = "status_update";

pub fn session_topic(session_id: &str) -> String {
    format!("orchestrator:{session_id}")
}

pub fn influencer_topic(influencer_id: &str) -> String {
    format!("influencer:{influencer_id}")
}

pub fn post_topic(posting_id: &str) -> String {
    format!("post:{posting_id}")
}

/// One published event. Serialized flat by [`Event::to_json`]: `type`,
/// `topic` and `ts` first, payload merged last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub ts: String,
    #[serde(default)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(topic: impl Into<String>, event_type: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            topic: topic.into(),
            event_type: event_type.into(),
            ts: now_utc_iso(),
            payload,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(self.event_type.clone()));
        event.insert("topic".to_string(), Value::String(self.topic.clone()));
        event.insert("ts".to_string(), Value::String(self.ts.clone()));
        for (key, value) in &self.payload {
            event.insert(key.clone(), value.clone());
        }
        Value::Object(event)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Append-only `events.jsonl` journal, one compact object per line.
#[derive(Debug, Clone)]
pub struct EventJournal {
    inner: Arc<EventJournalInner>,
}

#[derive(Debug)]
struct EventJournalInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EventJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(EventJournalInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn append(&self, event: &Event) -> anyhow::Result<Value> {
        let record = event.to_json();
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&record)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event journal lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(record)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn append_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let journal = EventJournal::new(&path);

        let mut payload = EventPayload::new();
        payload.insert("message".to_string(), Value::String("Planning".to_string()));
        let event = Event::new(session_topic("s-1"), ORCH_PLANNING, payload);
        let written = journal.append(&event)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, written);
        assert_eq!(parsed["type"], Value::String(ORCH_PLANNING.to_string()));
        assert_eq!(parsed["topic"], Value::String("orchestrator:s-1".to_string()));
        assert_eq!(parsed["message"], Value::String("Planning".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() {
        let mut payload = EventPayload::new();
        payload.insert("type".to_string(), Value::String("override".to_string()));
        let event = Event::new("t", ORCH_ERROR, payload);
        let flat = event.to_json();
        assert_eq!(flat["type"], Value::String("override".to_string()));
        assert_eq!(event.event_type, ORCH_ERROR);
    }

    #[test]
    fn append_adds_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let journal = EventJournal::new(&path);

        journal.append(&Event::new("t", "one", EventPayload::new()))?;
        journal.append(&Event::new("t", "two", EventPayload::new()))?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0])?;
        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(first["type"], Value::String("one".to_string()));
        assert_eq!(second["type"], Value::String("two".to_string()));
        Ok(())
    }

    #[test]
    fn topics_are_namespaced() {
        assert_eq!(session_topic("abc"), "orchestrator:abc");
        assert_eq!(influencer_topic("inf"), "influencer:inf");
        assert_eq!(post_topic("p"), "post:p");
    }
}
