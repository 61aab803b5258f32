//! Offline backends: deterministic text, solid-colour images and synthetic
//! search results. Used when no API key is configured.

use std::io::Cursor;

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use postcraft_contracts::providers::NamedProvider;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::capabilities::{
    data_uri, GeneratedImage, GeneratedVideo, ImageGenerator, ImageHit, ImageSearch,
    ReferenceImage, TextGenerator, TextOutput, TextRequest, VideoGenerator, VideoRequest, WebHit,
    WebResultGroup, WebSearch, WebSearchResponse,
};

const WEB_HITS_PER_QUERY: usize = 3;
const IMAGE_HITS_PER_QUERY: usize = 3;
const SEARCH_IMAGE_SIZE: u32 = 32;

fn color_from_text(text: &str) -> [u8; 3] {
    let digest = Sha256::digest(text.as_bytes());
    [digest[0], digest[1], digest[2]]
}

fn solid_png(width: u32, height: u32, color: [u8; 3]) -> Result<Vec<u8>> {
    let image = RgbImage::from_pixel(width, height, Rgb(color));
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut bytes, ImageFormat::Png)
        .context("dry-run image encode failed")?;
    Ok(bytes.into_inner())
}

fn slug(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

/// The value after the first `USER REQUEST:` / `USER QUERY:` marker.
fn prompt_query(prompt: &str) -> String {
    prompt
        .lines()
        .find_map(|line| {
            line.strip_prefix("USER REQUEST:")
                .or_else(|| line.strip_prefix("USER QUERY:"))
        })
        .map(str::trim)
        .filter(|query| !query.is_empty())
        .unwrap_or("your topic")
        .to_string()
}

/// Image URLs listed as `N. title - url` in a strategy prompt.
fn listed_image_urls(prompt: &str) -> Vec<String> {
    prompt
        .lines()
        .filter(|line| {
            line.split_once(". ")
                .is_some_and(|(index, _)| index.chars().all(|ch| ch.is_ascii_digit()))
        })
        .filter_map(|line| line.rsplit_once(" - ").map(|(_, url)| url.trim()))
        .filter(|url| url.starts_with("http") || url.starts_with("data:"))
        .map(str::to_string)
        .collect()
}

fn schema_has(schema: &Value, property: &str) -> bool {
    schema
        .get("properties")
        .and_then(|properties| properties.get(property))
        .is_some()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunText;

impl DryrunText {
    fn reply(request: &TextRequest) -> Value {
        let query = prompt_query(&request.prompt);
        let Some(schema) = request.schema.as_ref() else {
            return Value::Null;
        };
        if schema_has(schema, "sub_tasks") {
            return json!({"sub_tasks": [
                {"name": format!("Research {query}"), "queries": [query, format!("{query} facts")]},
                {"name": "Visual references", "queries": [format!("{query} photos")]},
            ]});
        }
        if schema_has(schema, "image_usage_plan") {
            let plan: Vec<Value> = listed_image_urls(&request.prompt)
                .into_iter()
                .enumerate()
                .map(|(idx, url)| {
                    if idx < 2 {
                        json!({
                            "selected_image_url": url,
                            "usage_type": "reference",
                            "reference_label": format!("[{}]", idx + 2),
                            "role": "object",
                            "description": format!("Reference {}", idx + 1),
                            "reasoning": "dry-run reference",
                        })
                    } else {
                        json!({
                            "selected_image_url": url,
                            "usage_type": "prompt_only",
                            "role": "object",
                            "description": "Mood reference",
                            "reasoning": "dry-run inspiration",
                        })
                    }
                })
                .collect();
            return json!({ "image_usage_plan": plan });
        }
        if schema_has(schema, "slide_count") {
            let beats = ["Hook", "Context", "Detail", "Takeaway"];
            let slides: Vec<Value> = beats
                .iter()
                .enumerate()
                .map(|(idx, beat)| {
                    json!({
                        "panel_number": idx + 1,
                        "panel_description": format!("{beat}: the influencer on {query}"),
                        "uses_images": ["[1]"],
                    })
                })
                .collect();
            return json!({
                "slide_count": 4,
                "grid_layout": "2x2",
                "caption": format!("Everything about {query} #{}", slug(&query).replace('-', "")),
                "slides": slides,
            });
        }
        Value::Object(Default::default())
    }
}

impl NamedProvider for DryrunText {
    fn name(&self) -> &str {
        "dryrun"
    }
}

#[async_trait]
impl TextGenerator for DryrunText {
    async fn generate(&self, request: TextRequest) -> Result<TextOutput> {
        if request.raw || request.schema.is_none() {
            let preview: String = request.prompt.chars().take(80).collect();
            return Ok(TextOutput::Raw(format!("dry-run reply to: {preview}")));
        }
        Ok(TextOutput::Structured(Self::reply(&request)))
    }
}

/// Renders a solid composite whose colour is derived from the prompt.
#[derive(Debug, Clone, Copy)]
pub struct DryrunImage {
    width: u32,
    height: u32,
}

impl Default for DryrunImage {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
        }
    }
}

impl DryrunImage {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl NamedProvider for DryrunImage {
    fn name(&self) -> &str {
        "dryrun"
    }
}

#[async_trait]
impl ImageGenerator for DryrunImage {
    async fn generate(&self, prompt: &str, _references: &[ReferenceImage]) -> Result<GeneratedImage> {
        let bytes = solid_png(self.width, self.height, color_from_text(prompt))?;
        Ok(GeneratedImage {
            url: data_uri("image/png", &bytes),
            bytes: Some(bytes),
            mime_type: "image/png".to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunVideo;

impl NamedProvider for DryrunVideo {
    fn name(&self) -> &str {
        "dryrun"
    }
}

#[async_trait]
impl VideoGenerator for DryrunVideo {
    async fn generate(&self, request: &VideoRequest) -> Result<GeneratedVideo> {
        let digest = hex::encode(Sha256::digest(request.prompt.as_bytes()));
        Ok(GeneratedVideo {
            url: format!(
                "dryrun://video/{}-{}s.mp4",
                &digest[..12],
                request.duration_seconds
            ),
            bytes: None,
        })
    }
}

/// Synthetic web and image search. Image hits are inline data URIs so they
/// can be fetched without network access.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunSearch;

#[async_trait]
impl WebSearch for DryrunSearch {
    async fn search(&self, queries: &[String]) -> Result<WebSearchResponse> {
        let groups = queries
            .iter()
            .map(|query| WebResultGroup {
                query: query.clone(),
                results: (0..WEB_HITS_PER_QUERY)
                    .map(|idx| WebHit {
                        title: format!("{query}: note {}", idx + 1),
                        snippet: format!("Dry-run finding {} about {query}.", idx + 1),
                        url: format!("https://example.com/dryrun/{}/{idx}", slug(query)),
                    })
                    .collect(),
            })
            .collect();
        Ok(WebSearchResponse::Grouped(groups))
    }
}

#[async_trait]
impl ImageSearch for DryrunSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<ImageHit>> {
        (0..IMAGE_HITS_PER_QUERY.min(max_results))
            .map(|idx| {
                let bytes = solid_png(
                    SEARCH_IMAGE_SIZE,
                    SEARCH_IMAGE_SIZE,
                    color_from_text(&format!("{query}#{idx}")),
                )?;
                let url = data_uri("image/png", &bytes);
                Ok(ImageHit {
                    title: Some(format!("{query} photo {}", idx + 1)),
                    thumbnail_url: Some(url.clone()),
                    image_url: url,
                    source: Some("dryrun".to_string()),
                    width: Some(SEARCH_IMAGE_SIZE),
                    height: Some(SEARCH_IMAGE_SIZE),
                })
            })
            .collect()
    }
}
