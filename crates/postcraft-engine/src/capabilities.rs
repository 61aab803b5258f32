//! Capability seams the core depends on. Every backend (Gemini, HTTP search,
//! local blobs, dry-run) implements one of these traits.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use indexmap::IndexMap;
use postcraft_contracts::providers::NamedProvider;
use postcraft_contracts::session::{ImageRole, OrchestratorSession, Persona, Posting};
use serde::Deserialize;
use serde_json::Value;

use crate::strip_code_fences;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextTool {
    GoogleSearch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextRequest {
    pub prompt: String,
    pub schema: Option<Value>,
    pub tools: Vec<TextTool>,
    /// Return the provider's text untouched instead of parsed JSON.
    pub raw: bool,
}

impl TextRequest {
    pub fn structured(prompt: impl Into<String>, schema: Value) -> Self {
        Self {
            prompt: prompt.into(),
            schema: Some(schema),
            tools: Vec::new(),
            raw: false,
        }
    }

    pub fn plain(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            schema: None,
            tools: Vec::new(),
            raw: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TextOutput {
    Structured(Value),
    Raw(String),
}

impl TextOutput {
    /// Parses raw output as JSON after stripping code fences.
    pub fn into_json(self) -> Result<Value> {
        match self {
            Self::Structured(value) => Ok(value),
            Self::Raw(text) => serde_json::from_str(strip_code_fences(&text))
                .context("text generator returned non-JSON output"),
        }
    }
}

#[async_trait]
pub trait TextGenerator: NamedProvider + Send + Sync {
    async fn generate(&self, request: TextRequest) -> Result<TextOutput>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    /// `data:{mime};base64,{payload}`
    pub data_uri: String,
    pub label: String,
    pub role: ImageRole,
    pub description: String,
}

impl ReferenceImage {
    pub fn from_bytes(
        bytes: &[u8],
        mime_type: &str,
        label: impl Into<String>,
        role: ImageRole,
        description: impl Into<String>,
    ) -> Self {
        Self {
            data_uri: data_uri(mime_type, bytes),
            label: label.into(),
            role,
            description: description.into(),
        }
    }

    pub fn decode(&self) -> Result<(String, Vec<u8>)> {
        decode_data_uri(&self.data_uri)
            .with_context(|| format!("reference image {} is not a valid data URI", self.label))
    }
}

pub fn data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", BASE64.encode(bytes))
}

pub fn decode_data_uri(uri: &str) -> Result<(String, Vec<u8>)> {
    let Some(rest) = uri.strip_prefix("data:") else {
        bail!("missing data: prefix");
    };
    let Some((header, payload)) = rest.split_once(',') else {
        bail!("missing payload separator");
    };
    let mime_type = header
        .split(';')
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string();
    if !header.contains(";base64") {
        return Ok((mime_type, payload.as_bytes().to_vec()));
    }
    let bytes = BASE64
        .decode(payload.trim().as_bytes())
        .context("data URI base64 decode failed")?;
    Ok((mime_type, bytes))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub url: String,
    pub bytes: Option<Vec<u8>>,
    pub mime_type: String,
}

#[async_trait]
pub trait ImageGenerator: NamedProvider + Send + Sync {
    async fn generate(&self, prompt: &str, references: &[ReferenceImage]) -> Result<GeneratedImage>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRequest {
    pub prompt: String,
    /// http(s) URL or data URI of the still to animate.
    pub source_image: String,
    pub duration_seconds: u32,
    pub aspect_ratio: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedVideo {
    pub url: String,
    pub bytes: Option<Vec<u8>>,
}

#[async_trait]
pub trait VideoGenerator: NamedProvider + Send + Sync {
    async fn generate(&self, request: &VideoRequest) -> Result<GeneratedVideo>;
}

/// Video backends accept 4, 6 or 8 second clips.
pub fn snap_video_duration(seconds: u32) -> u32 {
    match seconds {
        0..=4 => 4,
        5..=6 => 6,
        _ => 8,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

impl WebHit {
    fn from_value(value: &Value) -> Self {
        let field = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            title: field("title"),
            snippet: field("snippet"),
            url: field("url"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebResultGroup {
    pub query: String,
    pub results: Vec<WebHit>,
}

/// Web search payloads arrive in more than one shape; they are decoded once
/// here and consumed through [`WebSearchResponse::into_groups`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSearchResponse {
    /// `[{query, results: [...]}, ...]`
    Grouped(Vec<WebResultGroup>),
    /// `{query: [...], ...}`
    Keyed(IndexMap<String, Vec<WebHit>>),
    Unrecognised,
}

impl WebSearchResponse {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Array(entries) => Self::Grouped(
                entries
                    .iter()
                    .filter_map(Value::as_object)
                    .map(|entry| WebResultGroup {
                        query: entry
                            .get("query")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        results: entry
                            .get("results")
                            .and_then(Value::as_array)
                            .map(|rows| rows.iter().map(WebHit::from_value).collect())
                            .unwrap_or_default(),
                    })
                    .collect(),
            ),
            Value::Object(map) if !map.contains_key("error") => Self::Keyed(
                map.iter()
                    .filter_map(|(query, results)| {
                        results.as_array().map(|rows| {
                            (
                                query.clone(),
                                rows.iter().map(WebHit::from_value).collect(),
                            )
                        })
                    })
                    .collect(),
            ),
            _ => Self::Unrecognised,
        }
    }

    pub fn into_groups(self) -> Vec<WebResultGroup> {
        match self {
            Self::Grouped(groups) => groups,
            Self::Keyed(map) => map
                .into_iter()
                .map(|(query, results)| WebResultGroup { query, results })
                .collect(),
            Self::Unrecognised => Vec::new(),
        }
    }
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, queries: &[String]) -> Result<WebSearchResponse>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageHit {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[async_trait]
pub trait ImageSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<ImageHit>>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `key` and returns a public URL.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedImage>;
}

#[async_trait]
pub trait PersonaStore: Send + Sync {
    async fn get(&self, influencer_id: &str) -> Result<Option<Persona>>;
}

#[async_trait]
pub trait PostingStore: Send + Sync {
    async fn insert(&self, posting: Posting) -> Result<String>;
    async fn get(&self, posting_id: &str) -> Result<Option<Posting>>;
    async fn update(&self, posting: Posting) -> Result<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<OrchestratorSession>>;
    async fn put(&self, session: OrchestratorSession) -> Result<()>;
    async fn delete(&self, session_id: &str) -> Result<bool>;
    async fn list(&self) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use postcraft_contracts::session::ImageRole;
    use serde_json::json;

    use super::{
        decode_data_uri, snap_video_duration, ReferenceImage, TextOutput, WebSearchResponse,
    };

    #[test]
    fn grouped_web_payload_decodes() {
        let payload = json!([
            {"query": "espresso", "results": [
                {"title": "A", "snippet": "a", "url": "https://a"},
                {"title": "B"}
            ]},
            "junk"
        ]);
        let groups = WebSearchResponse::from_value(&payload).into_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].query, "espresso");
        assert_eq!(groups[0].results.len(), 2);
        assert_eq!(groups[0].results[1].url, "");
    }

    #[test]
    fn keyed_web_payload_decodes_and_skips_non_lists() {
        let payload = json!({
            "espresso": [{"title": "A", "snippet": "a", "url": "https://a"}],
            "meta": 3
        });
        let decoded = WebSearchResponse::from_value(&payload);
        assert!(matches!(decoded, WebSearchResponse::Keyed(_)));
        let groups = decoded.into_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].results[0].title, "A");
    }

    #[test]
    fn error_and_scalar_payloads_are_unrecognised() {
        let error = WebSearchResponse::from_value(&json!({"error": "rate limited"}));
        assert_eq!(error, WebSearchResponse::Unrecognised);
        assert!(WebSearchResponse::from_value(&json!("text"))
            .into_groups()
            .is_empty());
    }

    #[test]
    fn raw_text_output_is_unfenced_before_parsing() -> anyhow::Result<()> {
        let parsed = TextOutput::Raw("```json\n{\"sub_tasks\": []}\n```".to_string()).into_json()?;
        assert_eq!(parsed, json!({"sub_tasks": []}));
        assert!(TextOutput::Raw("not json".to_string()).into_json().is_err());
        Ok(())
    }

    #[test]
    fn reference_images_round_trip_through_data_uris() -> anyhow::Result<()> {
        let reference =
            ReferenceImage::from_bytes(b"abc", "image/png", "[1]", ImageRole::Character, "avatar");
        assert!(reference.data_uri.starts_with("data:image/png;base64,"));
        let (mime, bytes) = reference.decode()?;
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, b"abc");
        assert!(decode_data_uri("https://example.com/a.png").is_err());
        Ok(())
    }

    #[test]
    fn video_durations_snap_to_supported_lengths() {
        assert_eq!(snap_video_duration(1), 4);
        assert_eq!(snap_video_duration(5), 6);
        assert_eq!(snap_video_duration(6), 6);
        assert_eq!(snap_video_duration(30), 8);
    }
}
