//! Environment-driven wiring of capabilities.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use postcraft_contracts::models::{
    ModelSelector, CAPABILITY_IMAGE, CAPABILITY_TEXT, CAPABILITY_VIDEO,
};
use postcraft_contracts::providers::{NamedProvider, ProviderRegistry};
use tracing::{info, warn};

use crate::capabilities::{
    BlobStore, ImageGenerator, ImageSearch, PersonaStore, PostingStore, SessionStore,
    TextGenerator, VideoGenerator, WebSearch,
};
use crate::composer::DEFAULT_COMPOSITE_TIMEOUT;
use crate::hub::{EventHub, DEFAULT_CHANNEL_CAPACITY, DEFAULT_KEEPALIVE, DEFAULT_REPLAY};
use crate::non_empty_env;
use crate::orchestrator::{Capabilities, OrchestratorSettings};
use crate::providers::gemini::DEFAULT_GEMINI_API_BASE;
use crate::providers::{
    DryrunImage, DryrunSearch, DryrunText, DryrunVideo, GeminiClient, GeminiImage, GeminiText,
    GeminiVideo, HttpImageFetcher, HttpSearch, LocalBlobStore,
};
use crate::store::{
    InMemoryPersonaStore, InMemoryPostingStore, InMemorySessionStore, JsonFilePostingStore,
    JsonFileSessionStore,
};

pub const PROVIDER_GEMINI: &str = "gemini";
pub const PROVIDER_DRYRUN: &str = "dryrun";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudioConfig {
    /// `gemini`, `dryrun`, or `None` to pick gemini when a key is present.
    pub text_provider: Option<String>,
    pub image_provider: Option<String>,
    pub video_provider: Option<String>,
    pub text_model: Option<String>,
    pub image_model: Option<String>,
    pub video_model: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_api_base: String,
    pub search_api_base: Option<String>,
    pub blob_dir: Option<PathBuf>,
    pub blob_public_base: String,
    pub session_dir: Option<PathBuf>,
    pub posting_dir: Option<PathBuf>,
    pub personas_file: Option<PathBuf>,
    pub http_timeout: Duration,
    pub research_concurrency: usize,
    pub event_replay: usize,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl StudioConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| {
            non_empty_env(key).or_else(|| match key {
                "GEMINI_API_KEY" => non_empty_env("GOOGLE_API_KEY"),
                _ => None,
            })
        })
    }

    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str, default: u64| {
            get(key)
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        Self {
            text_provider: get("AI_TEXT_PROVIDER").map(|value| value.to_ascii_lowercase()),
            image_provider: get("AI_IMAGE_PROVIDER").map(|value| value.to_ascii_lowercase()),
            video_provider: get("AI_VIDEO_PROVIDER").map(|value| value.to_ascii_lowercase()),
            text_model: get("POSTCRAFT_TEXT_MODEL"),
            image_model: get("POSTCRAFT_IMAGE_MODEL"),
            video_model: get("POSTCRAFT_VIDEO_MODEL"),
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_api_base: get("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
            search_api_base: get("SEARCH_API_BASE"),
            blob_dir: get("BLOB_DIR").map(PathBuf::from),
            blob_public_base: get("BLOB_PUBLIC_BASE").unwrap_or_default(),
            session_dir: get("SESSION_DIR").map(PathBuf::from),
            posting_dir: get("POSTING_DIR").map(PathBuf::from),
            personas_file: get("PERSONAS_FILE").map(PathBuf::from),
            http_timeout: Duration::from_secs(number("POSTCRAFT_HTTP_TIMEOUT", 30).max(1)),
            research_concurrency: number("POSTCRAFT_RESEARCH_CONCURRENCY", 1).clamp(1, 5) as usize,
            event_replay: number("POSTCRAFT_EVENT_REPLAY", DEFAULT_REPLAY as u64) as usize,
        }
    }

    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            research_concurrency: self.research_concurrency,
            fetch_timeout: self.http_timeout,
            composite_timeout: self.http_timeout.max(DEFAULT_COMPOSITE_TIMEOUT),
            ..OrchestratorSettings::default()
        }
    }

    pub fn hub(&self) -> EventHub {
        EventHub::new(DEFAULT_CHANNEL_CAPACITY, self.event_replay, DEFAULT_KEEPALIVE)
    }

    pub async fn load_personas(&self) -> Result<InMemoryPersonaStore> {
        match self.personas_file.as_deref() {
            Some(path) => InMemoryPersonaStore::from_json_file(path).await,
            None => Ok(InMemoryPersonaStore::new()),
        }
    }

    /// Provider actually used for `capability`: the requested one, or gemini
    /// when a key is configured. Gemini without a key degrades to dry-run.
    pub fn resolve_provider(&self, requested: Option<&str>, capability: &str) -> String {
        let has_key = self.gemini_api_key.is_some();
        match requested {
            Some(PROVIDER_GEMINI) if !has_key => {
                warn!(capability, "gemini requested without GEMINI_API_KEY, using dryrun");
                PROVIDER_DRYRUN.to_string()
            }
            Some(name) => name.to_string(),
            None if has_key => PROVIDER_GEMINI.to_string(),
            None => PROVIDER_DRYRUN.to_string(),
        }
    }

    pub fn resolve_model(
        &self,
        requested: Option<&str>,
        capability: &str,
        provider: &str,
    ) -> Result<String> {
        let selection = ModelSelector::new(None)
            .select_for_provider(requested, capability, provider)
            .map_err(|reason| anyhow!(reason))?;
        if let (Some(_), Some(reason)) = (requested, selection.fallback_reason.as_deref()) {
            warn!(capability, provider, reason, model = %selection.model.name, "model fallback");
        }
        Ok(selection.model.name)
    }

    fn gemini_client(&self) -> Option<GeminiClient> {
        self.gemini_api_key
            .as_deref()
            .map(|key| GeminiClient::new(key, self.gemini_api_base.as_str()))
    }

    pub fn text_generator(&self) -> Result<Arc<dyn TextGenerator>> {
        let provider = self.resolve_provider(self.text_provider.as_deref(), CAPABILITY_TEXT);
        let model = self.resolve_model(self.text_model.as_deref(), CAPABILITY_TEXT, &provider)?;
        let mut candidates: Vec<Arc<dyn TextGenerator>> = vec![Arc::new(DryrunText)];
        if let Some(client) = self.gemini_client() {
            candidates.push(Arc::new(GeminiText::new(client, model.as_str())));
        }
        pick(ProviderRegistry::new(candidates), &provider, CAPABILITY_TEXT, &model)
    }

    pub fn image_generator(&self) -> Result<Arc<dyn ImageGenerator>> {
        let provider = self.resolve_provider(self.image_provider.as_deref(), CAPABILITY_IMAGE);
        let model = self.resolve_model(self.image_model.as_deref(), CAPABILITY_IMAGE, &provider)?;
        let mut candidates: Vec<Arc<dyn ImageGenerator>> = vec![Arc::new(DryrunImage::default())];
        if let Some(client) = self.gemini_client() {
            let client = client.with_request_timeout(self.http_timeout.max(Duration::from_secs(90)));
            candidates.push(Arc::new(GeminiImage::new(client, model.as_str())));
        }
        pick(ProviderRegistry::new(candidates), &provider, CAPABILITY_IMAGE, &model)
    }

    pub fn video_generator(&self) -> Result<Arc<dyn VideoGenerator>> {
        let provider = self.resolve_provider(self.video_provider.as_deref(), CAPABILITY_VIDEO);
        let model = self.resolve_model(self.video_model.as_deref(), CAPABILITY_VIDEO, &provider)?;
        let mut candidates: Vec<Arc<dyn VideoGenerator>> = vec![Arc::new(DryrunVideo)];
        if let Some(client) = self.gemini_client() {
            candidates.push(Arc::new(GeminiVideo::new(client, model.as_str())));
        }
        pick(ProviderRegistry::new(candidates), &provider, CAPABILITY_VIDEO, &model)
    }

    fn search(&self) -> (Arc<dyn WebSearch>, Arc<dyn ImageSearch>) {
        match self.search_api_base.as_deref() {
            Some(base) => {
                let search = Arc::new(HttpSearch::new(base, self.http_timeout));
                (search.clone(), search)
            }
            None => {
                warn!("SEARCH_API_BASE not set, using dry-run search results");
                (Arc::new(DryrunSearch), Arc::new(DryrunSearch))
            }
        }
    }

    pub fn capabilities(&self, personas: Arc<dyn PersonaStore>) -> Result<Capabilities> {
        let (web_search, image_search) = self.search();
        let blobs = self.blob_dir.as_ref().map(|dir| {
            Arc::new(LocalBlobStore::new(dir.clone(), self.blob_public_base.as_str()))
                as Arc<dyn BlobStore>
        });
        if blobs.is_none() {
            warn!("BLOB_DIR not set, slides will reuse the composite URL");
        }
        let sessions: Arc<dyn SessionStore> = match self.session_dir.as_ref() {
            Some(dir) => Arc::new(JsonFileSessionStore::new(dir.clone())),
            None => Arc::new(InMemorySessionStore::new()),
        };
        let postings: Arc<dyn PostingStore> = match self.posting_dir.as_ref() {
            Some(dir) => Arc::new(JsonFilePostingStore::new(dir.clone())),
            None => Arc::new(InMemoryPostingStore::new()),
        };
        Ok(Capabilities {
            text: self.text_generator()?,
            images: self.image_generator()?,
            video: Some(self.video_generator()?),
            web_search,
            image_search,
            fetcher: Arc::new(HttpImageFetcher::new()),
            blobs,
            personas,
            postings,
            sessions,
        })
    }

    /// Non-secret view for logs and run summaries.
    pub fn describe(&self) -> HashMap<&'static str, String> {
        let mut out = HashMap::new();
        let text = self.resolve_provider(self.text_provider.as_deref(), CAPABILITY_TEXT);
        let image = self.resolve_provider(self.image_provider.as_deref(), CAPABILITY_IMAGE);
        out.insert("text_provider", text);
        out.insert("image_provider", image);
        out.insert(
            "search",
            self.search_api_base
                .clone()
                .unwrap_or_else(|| PROVIDER_DRYRUN.to_string()),
        );
        out.insert(
            "research_concurrency",
            self.research_concurrency.to_string(),
        );
        out
    }
}

fn pick<T>(
    registry: ProviderRegistry<Arc<T>>,
    provider: &str,
    capability: &str,
    model: &str,
) -> Result<Arc<T>>
where
    T: NamedProvider + ?Sized,
{
    let found = registry
        .take(provider)
        .with_context(|| format!("no {capability} backend"))?;
    info!(capability, provider, model, "provider selected");
    Ok(found)
}
