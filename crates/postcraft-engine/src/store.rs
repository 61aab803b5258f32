//! Session, posting and persona stores: in-memory maps and JSON files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use postcraft_contracts::session::{OrchestratorSession, Persona, Posting};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::capabilities::{PersonaStore, PostingStore, SessionStore};

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, OrchestratorSession>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<OrchestratorSession>> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone()))
    }

    async fn put(&self, session: OrchestratorSession) -> Result<()> {
        self.sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.remove(session_id).is_some())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// One pretty-printed JSON document per key under `dir`.
#[derive(Debug, Clone)]
struct JsonDir {
    dir: PathBuf,
}

impl JsonDir {
    fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.path_for(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let value = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    /// Writes through a temp file so readers never see a partial document.
    async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.path_for(key);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", file_stem(key), Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    async fn stems(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to list {}", self.dir.display()))
            }
        };
        let mut stems = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if !stem.starts_with('.') {
                    stems.push(stem.to_string());
                }
            }
        }
        stems.sort();
        Ok(stems)
    }
}

/// Ids that are not plain file names are hashed.
fn file_stem(key: &str) -> String {
    let plain = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if plain {
        key.to_string()
    } else {
        hex::encode(Sha256::digest(key.as_bytes()))
    }
}

pub struct JsonFileSessionStore {
    files: JsonDir,
}

impl JsonFileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            files: JsonDir::new(dir),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.files.dir
    }
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<OrchestratorSession>> {
        self.files.read(session_id).await
    }

    async fn put(&self, session: OrchestratorSession) -> Result<()> {
        self.files.write(&session.session_id, &session).await
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        self.files.remove(session_id).await
    }

    /// File stems; hashed for ids that are not plain file names.
    async fn list(&self) -> Result<Vec<String>> {
        self.files.stems().await
    }
}

fn ensure_posting_id(posting: &mut Posting) {
    if posting.id.trim().is_empty() {
        posting.id = Uuid::new_v4().to_string();
    }
}

#[derive(Default)]
pub struct InMemoryPostingStore {
    postings: DashMap<String, Posting>,
}

impl InMemoryPostingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }
}

#[async_trait]
impl PostingStore for InMemoryPostingStore {
    async fn insert(&self, mut posting: Posting) -> Result<String> {
        ensure_posting_id(&mut posting);
        let id = posting.id.clone();
        self.postings.insert(id.clone(), posting);
        Ok(id)
    }

    async fn get(&self, posting_id: &str) -> Result<Option<Posting>> {
        Ok(self
            .postings
            .get(posting_id)
            .map(|entry| entry.value().clone()))
    }

    async fn update(&self, posting: Posting) -> Result<()> {
        self.postings.insert(posting.id.clone(), posting);
        Ok(())
    }
}

pub struct JsonFilePostingStore {
    files: JsonDir,
}

impl JsonFilePostingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            files: JsonDir::new(dir),
        }
    }
}

#[async_trait]
impl PostingStore for JsonFilePostingStore {
    async fn insert(&self, mut posting: Posting) -> Result<String> {
        ensure_posting_id(&mut posting);
        self.files.write(&posting.id, &posting).await?;
        Ok(posting.id)
    }

    async fn get(&self, posting_id: &str) -> Result<Option<Posting>> {
        self.files.read(posting_id).await
    }

    async fn update(&self, posting: Posting) -> Result<()> {
        self.files.write(&posting.id, &posting).await
    }
}

#[derive(Default)]
pub struct InMemoryPersonaStore {
    personas: DashMap<String, Persona>,
}

impl InMemoryPersonaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_personas(personas: impl IntoIterator<Item = Persona>) -> Self {
        let store = Self::new();
        for persona in personas {
            store.insert(persona);
        }
        store
    }

    /// Loads a JSON array of personas, or a single persona object.
    pub async fn from_json_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read personas from {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let personas: Vec<Persona> = if value.is_array() {
            serde_json::from_value(value)
        } else {
            serde_json::from_value(value).map(|persona| vec![persona])
        }
        .with_context(|| format!("invalid persona data in {}", path.display()))?;
        Ok(Self::with_personas(personas))
    }

    pub fn insert(&self, persona: Persona) {
        self.personas.insert(persona.id.clone(), persona);
    }
}

#[async_trait]
impl PersonaStore for InMemoryPersonaStore {
    async fn get(&self, influencer_id: &str) -> Result<Option<Persona>> {
        Ok(self
            .personas
            .get(influencer_id)
            .map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use postcraft_contracts::session::{GeneratedPost, GridLayout, OrchestratorSession, Phase, Posting};

    use super::{
        file_stem, InMemoryPersonaStore, InMemoryPostingStore, JsonFilePostingStore,
        JsonFileSessionStore,
    };
    use crate::capabilities::{PersonaStore, PostingStore, SessionStore};
    use crate::testkit::persona;

    fn post() -> GeneratedPost {
        GeneratedPost {
            slide_count: 2,
            grid_layout: GridLayout::OneByTwo,
            slide_urls: vec!["a".to_string(), "b".to_string()],
            grid_url: "g".to_string(),
            caption: "hi".to_string(),
            image_usage_plan: Vec::new(),
            posting_id: None,
        }
    }

    #[tokio::test]
    async fn json_session_store_round_trips_and_deletes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = JsonFileSessionStore::new(temp.path().join("sessions"));
        assert!(store.get("missing").await?.is_none());
        assert!(store.list().await?.is_empty());

        let mut session = OrchestratorSession::new("s-1", "inf-1", "espresso", None, None);
        session.advance(Phase::PlanReview)?;
        store.put(session.clone()).await?;
        let loaded = store.get("s-1").await?;
        assert_eq!(loaded.map(|s| s.phase), Some(Phase::PlanReview));
        assert_eq!(store.list().await?, vec!["s-1"]);

        assert!(store.delete("s-1").await?);
        assert!(!store.delete("s-1").await?);
        assert!(store.get("s-1").await?.is_none());
        Ok(())
    }

    #[test]
    fn unsafe_ids_are_hashed() {
        assert_eq!(file_stem("abc-123_x"), "abc-123_x");
        let hashed = file_stem("../etc/passwd");
        assert_eq!(hashed.len(), 64);
        assert!(!hashed.contains('/'));
    }

    #[tokio::test]
    async fn posting_stores_assign_ids_and_update() -> anyhow::Result<()> {
        let memory = InMemoryPostingStore::new();
        let id = memory
            .insert(Posting::from_generated("", "inf-1", None, "q", &post()))
            .await?;
        assert!(!id.is_empty());
        assert_eq!(memory.len(), 1);

        let temp = tempfile::tempdir()?;
        let files = JsonFilePostingStore::new(temp.path());
        let id = files
            .insert(Posting::from_generated("p-1", "inf-1", None, "q", &post()))
            .await?;
        let mut posting = files.get(&id).await?.ok_or_else(|| anyhow::anyhow!("missing"))?;
        posting.video_url = Some("https://video".to_string());
        files.update(posting).await?;
        let reloaded = files.get("p-1").await?;
        assert_eq!(
            reloaded.and_then(|posting| posting.video_url),
            Some("https://video".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn personas_load_from_json_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("personas.json");
        std::fs::write(&path, serde_json::to_vec(&vec![persona()])?)?;
        let store = InMemoryPersonaStore::from_json_file(&path).await?;
        let loaded = store.get("inf-1").await?;
        assert_eq!(loaded.map(|p| p.name), Some("Mara".to_string()));

        std::fs::write(&path, serde_json::to_vec(&persona())?)?;
        let single = InMemoryPersonaStore::from_json_file(&path).await?;
        assert!(single.get("inf-1").await?.is_some());
        Ok(())
    }
}
