//! Gemini REST backends for text, composite images and Veo video.

use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use postcraft_contracts::providers::NamedProvider;
use postcraft_contracts::session::ImageRole;
use reqwest::Client as HttpClient;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::{is_retryable_transport_error, response_json_or_error, sniff_image_mime};
use crate::capabilities::{
    data_uri, decode_data_uri, GeneratedImage, GeneratedVideo, ImageGenerator, ReferenceImage,
    TextGenerator, TextOutput, TextRequest, TextTool, VideoGenerator, VideoRequest,
};
use crate::strip_code_fences;

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const STYLE_SUFFIX: &str =
    ", photorealistic, 8k, highly detailed, raw photo, shot on fujifilm, grainy texture";
const DEFAULT_IMAGE_ASPECT_RATIO: &str = "16:9";
const SOURCE_IMAGE_TIMEOUT: Duration = Duration::from_secs(30);
const VIDEO_POLL_INTERVAL: Duration = Duration::from_secs(10);
const VIDEO_MAX_WAIT: Duration = Duration::from_secs(600);

/// Shared transport for the Gemini backends.
#[derive(Clone)]
pub struct GeminiClient {
    api_base: String,
    api_key: String,
    http: HttpClient,
    request_timeout: Duration,
    transport_retries: usize,
    retry_backoff: Duration,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http: HttpClient::new(),
            request_timeout: Duration::from_secs(90),
            transport_retries: 2,
            retry_backoff: Duration::from_millis(1200),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn endpoint_for_model(&self, model: &str, method: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:{}", self.api_base, model_path, method)
    }

    async fn post_json(&self, endpoint: &str, payload: &Value) -> Result<Value> {
        let mut attempt = 0;
        loop {
            let sent = self
                .http
                .post(endpoint)
                .query(&[("key", self.api_key.as_str())])
                .timeout(self.request_timeout)
                .json(payload)
                .send()
                .await;
            match sent {
                Ok(response) => return response_json_or_error("Gemini", response).await,
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= self.transport_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    warn!(
                        attempt,
                        max = self.transport_retries,
                        "Gemini transport retry after transient request failure"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt as u32).await;
                }
            }
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self
            .http
            .get(url)
            .query(&[("key", self.api_key.as_str())])
            .timeout(self.request_timeout)
            .send()
            .await
            .with_context(|| format!("Gemini request failed ({url})"))?;
        response_json_or_error("Gemini", response).await
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .query(&[("key", self.api_key.as_str())])
            .timeout(self.request_timeout)
            .send()
            .await
            .with_context(|| format!("download failed ({url})"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("download failed: HTTP {}", status.as_u16());
        }
        Ok(response
            .bytes()
            .await
            .context("download body read failed")?
            .to_vec())
    }
}

fn candidate_parts(payload: &Value) -> Vec<Value> {
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|candidate| {
            candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
        })
        .flatten()
        .cloned()
        .collect()
}

fn extract_text(payload: &Value) -> Result<String> {
    let text: String = candidate_parts(payload)
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.trim().is_empty() {
        let reason = payload
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
            .unwrap_or("empty response");
        bail!("Gemini returned no text ({reason})");
    }
    Ok(text)
}

fn extract_image(payload: &Value) -> Result<Option<(String, Vec<u8>)>> {
    for part in candidate_parts(payload) {
        let Some(inline) = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let data = inline
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if data.is_empty() {
            continue;
        }
        let bytes = BASE64
            .decode(data.as_bytes())
            .context("Gemini image base64 decode failed")?;
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/jpeg")
            .to_string();
        return Ok(Some((mime_type, bytes)));
    }
    Ok(None)
}

fn usage_instruction(reference: &ReferenceImage) -> String {
    let ReferenceImage {
        label, description, ..
    } = reference;
    match reference.role {
        ImageRole::Character => format!(
            "- Image {label} ({description}): Use EXACT facial features, hair style, hair color, eye color, skin tone, and body build from this image. For outfit, background, and pose: follow the scene description exactly - if the scene says same outfit, keep it; if it describes a new outfit, apply it.\n"
        ),
        ImageRole::Product => format!(
            "- Image {label} ({description}): Include this exact product in the scene. Maintain brand details, colors, and design. Place it as described in the scene.\n"
        ),
        ImageRole::Person => format!(
            "- Image {label} ({description}): Use this person's EXACT facial features, hair, and build. For outfit/context: follow the scene description exactly.\n"
        ),
        ImageRole::Location => format!(
            "- Image {label} ({description}): Use this location/background as the setting. Match the architectural style and atmosphere. Apply any scene-specific variations as described.\n"
        ),
        ImageRole::Object => format!(
            "- Image {label} ({description}): Include this object/element in the scene as described.\n"
        ),
    }
}

/// Reference parts first, then one text part carrying the reference context,
/// per-role usage rules and the scene.
fn build_image_parts(prompt: &str, references: &[ReferenceImage]) -> Vec<Value> {
    let mut parts = Vec::new();
    let mut attached = Vec::new();
    for reference in references {
        match reference.decode() {
            Ok((mime_type, bytes)) => {
                parts.push(json!({
                    "inlineData": {"mimeType": mime_type, "data": BASE64.encode(bytes)}
                }));
                attached.push(reference);
            }
            Err(err) => {
                warn!(label = %reference.label, error = %format!("{err:#}"), "dropping reference image");
            }
        }
    }
    let full_prompt = if attached.is_empty() {
        format!("{prompt}{STYLE_SUFFIX}")
    } else {
        let mut context = String::from("REFERENCE IMAGES PROVIDED:\n");
        for reference in &attached {
            context.push_str(&format!(
                "Image {}: {} (Role: {})\n",
                reference.label,
                reference.description,
                reference.role.as_str()
            ));
        }
        let mut usage = String::from("HOW TO USE REFERENCE IMAGES:\n");
        for reference in &attached {
            usage.push_str(&usage_instruction(reference));
        }
        format!("{context}{usage}\nSCENE TO CREATE:\n{prompt}{STYLE_SUFFIX}")
    };
    parts.push(json!({ "text": full_prompt }));
    parts
}

fn operation_video_uri(operation: &Value) -> Option<String> {
    operation
        .pointer("/response/generateVideoResponse/generatedSamples/0/video/uri")
        .or_else(|| operation.pointer("/response/generatedVideos/0/video/uri"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[derive(Clone)]
pub struct GeminiText {
    client: GeminiClient,
    model: String,
}

impl GeminiText {
    pub fn new(client: GeminiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    fn build_payload(request: &TextRequest) -> Value {
        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            json!([{ "role": "user", "parts": [{ "text": request.prompt }] }]),
        );
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|tool| match tool {
                    TextTool::GoogleSearch => json!({ "google_search": {} }),
                })
                .collect();
            payload.insert("tools".to_string(), Value::Array(tools));
        } else if let Some(schema) = request.schema.as_ref() {
            payload.insert(
                "generationConfig".to_string(),
                json!({
                    "responseMimeType": "application/json",
                    "responseJsonSchema": schema,
                }),
            );
        }
        Value::Object(payload)
    }
}

impl NamedProvider for GeminiText {
    fn name(&self) -> &str {
        "gemini"
    }
}

#[async_trait]
impl TextGenerator for GeminiText {
    async fn generate(&self, request: TextRequest) -> Result<TextOutput> {
        let endpoint = self.client.endpoint_for_model(&self.model, "generateContent");
        let response = self
            .client
            .post_json(&endpoint, &Self::build_payload(&request))
            .await?;
        let text = extract_text(&response)?;
        debug!(model = %self.model, chars = text.chars().count(), "Gemini text received");
        if request.raw {
            return Ok(TextOutput::Raw(text));
        }
        match serde_json::from_str(strip_code_fences(&text)) {
            Ok(value) => Ok(TextOutput::Structured(value)),
            Err(_) => Ok(TextOutput::Raw(text)),
        }
    }
}

#[derive(Clone)]
pub struct GeminiImage {
    client: GeminiClient,
    model: String,
    aspect_ratio: String,
}

impl GeminiImage {
    pub fn new(client: GeminiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            aspect_ratio: DEFAULT_IMAGE_ASPECT_RATIO.to_string(),
        }
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: impl Into<String>) -> Self {
        self.aspect_ratio = aspect_ratio.into();
        self
    }

    async fn generate_once(
        &self,
        prompt: &str,
        references: &[ReferenceImage],
    ) -> Result<GeneratedImage> {
        let payload = json!({
            "contents": [{ "role": "user", "parts": build_image_parts(prompt, references) }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
                "imageConfig": { "aspectRatio": self.aspect_ratio },
            },
        });
        let endpoint = self.client.endpoint_for_model(&self.model, "generateContent");
        let response = self.client.post_json(&endpoint, &payload).await?;
        let Some((mime_type, bytes)) = extract_image(&response)? else {
            bail!("Gemini returned no image data");
        };
        info!(
            model = %self.model,
            references = references.len(),
            bytes = bytes.len(),
            "Gemini image generated"
        );
        Ok(GeneratedImage {
            url: data_uri(&mime_type, &bytes),
            bytes: Some(bytes),
            mime_type,
        })
    }
}

impl NamedProvider for GeminiImage {
    fn name(&self) -> &str {
        "gemini"
    }
}

#[async_trait]
impl ImageGenerator for GeminiImage {
    async fn generate(&self, prompt: &str, references: &[ReferenceImage]) -> Result<GeneratedImage> {
        match self.generate_once(prompt, references).await {
            Ok(image) => Ok(image),
            Err(err) if !references.is_empty() => {
                warn!(
                    error = %format!("{err:#}"),
                    "Gemini image with references failed, retrying without references"
                );
                self.generate_once(prompt, &[]).await
            }
            Err(err) => Err(err),
        }
    }
}

#[derive(Clone)]
pub struct GeminiVideo {
    client: GeminiClient,
    model: String,
    poll_interval: Duration,
    max_wait: Duration,
}

impl GeminiVideo {
    pub fn new(client: GeminiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            poll_interval: VIDEO_POLL_INTERVAL,
            max_wait: VIDEO_MAX_WAIT,
        }
    }

    pub fn with_polling(mut self, interval: Duration, max_wait: Duration) -> Self {
        self.poll_interval = interval;
        self.max_wait = max_wait;
        self
    }

    async fn source_bytes(&self, source: &str) -> Result<(String, Vec<u8>)> {
        if source.starts_with("data:") {
            return decode_data_uri(source).context("Failed to decode data URI");
        }
        let bytes = self
            .client
            .http
            .get(source)
            .timeout(SOURCE_IMAGE_TIMEOUT)
            .send()
            .await
            .context("source image download failed")?
            .error_for_status()
            .context("source image download failed")?
            .bytes()
            .await
            .context("source image body read failed")?
            .to_vec();
        Ok((sniff_image_mime(&bytes).to_string(), bytes))
    }

    async fn wait_for(&self, operation_name: &str) -> Result<Value> {
        let url = format!("{}/{}", self.client.api_base, operation_name);
        let started = Instant::now();
        loop {
            let operation = self.client.get_json(&url).await?;
            if operation.get("done").and_then(Value::as_bool).unwrap_or(false) {
                if let Some(error) = operation.get("error") {
                    let message = error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error");
                    bail!("Veo operation failed: {message}");
                }
                return Ok(operation);
            }
            if started.elapsed() >= self.max_wait {
                bail!("Video generation timed out");
            }
            debug!(
                operation = operation_name,
                elapsed_s = started.elapsed().as_secs(),
                "video still generating"
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl NamedProvider for GeminiVideo {
    fn name(&self) -> &str {
        "gemini"
    }
}

#[async_trait]
impl VideoGenerator for GeminiVideo {
    async fn generate(&self, request: &VideoRequest) -> Result<GeneratedVideo> {
        let (mime_type, bytes) = self.source_bytes(&request.source_image).await?;
        let payload = json!({
            "instances": [{
                "prompt": request.prompt,
                "image": {"bytesBase64Encoded": BASE64.encode(&bytes), "mimeType": mime_type},
            }],
            "parameters": {
                "aspectRatio": request.aspect_ratio,
                "durationSeconds": request.duration_seconds,
            },
        });
        let endpoint = self
            .client
            .endpoint_for_model(&self.model, "predictLongRunning");
        let started = self.client.post_json(&endpoint, &payload).await?;
        let operation_name = started
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Veo response carried no operation name"))?
            .to_string();
        info!(model = %self.model, operation = %operation_name, "video operation started");

        let finished = self.wait_for(&operation_name).await?;
        let uri = operation_video_uri(&finished)
            .ok_or_else(|| anyhow!("No video generated in response"))?;
        let video = self
            .client
            .get_bytes(&uri)
            .await
            .context("video download failed")?;
        Ok(GeneratedVideo {
            url: uri,
            bytes: Some(video),
        })
    }
}
