//! Fakes shared by the engine's unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use postcraft_contracts::providers::NamedProvider;
use postcraft_contracts::session::Persona;
use tokio::sync::Notify;

use crate::capabilities::{
    BlobStore, FetchedImage, GeneratedImage, GeneratedVideo, ImageFetcher, ImageGenerator,
    ImageHit, ImageSearch, ReferenceImage, TextGenerator, TextOutput, TextRequest, VideoGenerator,
    VideoRequest, WebHit, WebResultGroup, WebSearch, WebSearchResponse,
};

pub fn persona() -> Persona {
    Persona {
        id: "inf-1".to_string(),
        name: "Mara".to_string(),
        niches: vec!["coffee".to_string(), "travel".to_string()],
        tone: Some("warm".to_string()),
        bio: None,
        avatar_url: Some("https://cdn.test/mara.png".to_string()),
        owner_id: Some("owner-1".to_string()),
    }
}

pub fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb(color));
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut bytes, ImageFormat::Png)
        .expect("encode test png");
    bytes.into_inner()
}

fn locked<T: Clone>(value: &Mutex<T>) -> T {
    value.lock().expect("test mutex poisoned").clone()
}

pub struct ScriptedText {
    replies: Mutex<VecDeque<Result<TextOutput, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedText {
    pub fn new(replies: Vec<Result<TextOutput, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        locked(&self.prompts)
    }
}

impl NamedProvider for ScriptedText {
    fn name(&self) -> &str {
        "scripted"
    }
}

#[async_trait]
impl TextGenerator for ScriptedText {
    async fn generate(&self, request: TextRequest) -> Result<TextOutput> {
        self.prompts
            .lock()
            .expect("test mutex poisoned")
            .push(request.prompt);
        let next = self
            .replies
            .lock()
            .expect("test mutex poisoned")
            .pop_front();
        match next {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(anyhow!(message)),
            None => bail!("no scripted reply left"),
        }
    }
}

/// Parks a search until the test lets it go.
#[derive(Default)]
pub struct SearchGate {
    reached: Notify,
    release: Notify,
}

impl SearchGate {
    /// Resolves once a held search has started.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Default)]
pub struct FakeWebSearch {
    default_hits: usize,
    per_query: HashMap<String, usize>,
    held: Option<(String, Arc<SearchGate>)>,
    fail: bool,
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeWebSearch {
    pub fn with_hits(default_hits: usize) -> Self {
        Self {
            default_hits,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn hits_for(mut self, query: &str, hits: usize) -> Self {
        self.per_query.insert(query.to_string(), hits);
        self
    }

    /// Searches that include `query` wait on `gate`.
    pub fn held_on(mut self, query: &str, gate: Arc<SearchGate>) -> Self {
        self.held = Some((query.to_string(), gate));
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        locked(&self.calls)
    }
}

#[async_trait]
impl WebSearch for FakeWebSearch {
    async fn search(&self, queries: &[String]) -> Result<WebSearchResponse> {
        self.calls
            .lock()
            .expect("test mutex poisoned")
            .push(queries.to_vec());
        if let Some((query, gate)) = &self.held {
            if queries.contains(query) {
                gate.reached.notify_one();
                gate.release.notified().await;
            }
        }
        if self.fail {
            bail!("web search backend unavailable");
        }
        let groups = queries
            .iter()
            .map(|query| {
                let hits = self
                    .per_query
                    .get(query)
                    .copied()
                    .unwrap_or(self.default_hits);
                WebResultGroup {
                    query: query.clone(),
                    results: (0..hits)
                        .map(|idx| WebHit {
                            title: format!("{query} result {}", idx + 1),
                            snippet: format!("snippet about {query}"),
                            url: format!("https://web.test/{idx}"),
                        })
                        .collect(),
                }
            })
            .collect();
        Ok(WebSearchResponse::Grouped(groups))
    }
}

#[derive(Default)]
pub struct FakeImageSearch {
    default_hits: usize,
    per_query: HashMap<String, usize>,
    failing: HashSet<String>,
    calls: Mutex<Vec<(String, usize)>>,
}

impl FakeImageSearch {
    pub fn with_hits(default_hits: usize) -> Self {
        Self {
            default_hits,
            ..Self::default()
        }
    }

    pub fn hits_for(mut self, query: &str, hits: usize) -> Self {
        self.per_query.insert(query.to_string(), hits);
        self
    }

    pub fn failing_for(mut self, query: &str) -> Self {
        self.failing.insert(query.to_string());
        self
    }

    pub fn calls(&self) -> Vec<(String, usize)> {
        locked(&self.calls)
    }
}

#[async_trait]
impl ImageSearch for FakeImageSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<ImageHit>> {
        self.calls
            .lock()
            .expect("test mutex poisoned")
            .push((query.to_string(), max_results));
        if self.failing.contains(query) {
            bail!("image search rejected {query}");
        }
        let hits = self
            .per_query
            .get(query)
            .copied()
            .unwrap_or(self.default_hits)
            .min(max_results);
        Ok((0..hits)
            .map(|idx| ImageHit {
                title: Some(format!("{query} image {}", idx + 1)),
                image_url: format!("https://img.test/{}/{idx}.png", query.replace(' ', "-")),
                thumbnail_url: Some(format!("https://img.test/thumb/{idx}.png")),
                ..ImageHit::default()
            })
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, Vec<u8>>,
    fail: bool,
}

impl MemoryBlobStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String> {
        if self.fail {
            bail!("bucket unavailable");
        }
        self.objects.insert(key.to_string(), bytes);
        Ok(format!("https://blobs.test/{key}"))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow!("missing blob {key}"))
    }
}

/// Serves the same small PNG for every URL except the ones marked missing.
pub struct StaticFetcher {
    image: Vec<u8>,
    missing: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self {
            image: png_bytes(8, 8, [200, 120, 40]),
            missing: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn missing(mut self, url: &str) -> Self {
        self.missing.insert(url.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls)
    }
}

#[async_trait]
impl ImageFetcher for StaticFetcher {
    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<FetchedImage> {
        self.calls
            .lock()
            .expect("test mutex poisoned")
            .push(url.to_string());
        if self.missing.contains(url) {
            bail!("404 for {url}");
        }
        Ok(FetchedImage {
            bytes: self.image.clone(),
            mime_type: "image/png".to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMode {
    /// Returns a composite of the given size with raw bytes attached.
    Composite { width: u32, height: u32 },
    Fail,
    Panic,
    EmptyUrl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCall {
    pub prompt: String,
    pub labels: Vec<String>,
}

pub struct FakeImageGenerator {
    mode: ImageMode,
    calls: Mutex<Vec<ImageCall>>,
}

impl FakeImageGenerator {
    pub fn new(mode: ImageMode) -> Self {
        Self {
            mode,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn composite() -> Self {
        Self::new(ImageMode::Composite {
            width: 64,
            height: 64,
        })
    }

    pub fn calls(&self) -> Vec<ImageCall> {
        locked(&self.calls)
    }
}

impl NamedProvider for FakeImageGenerator {
    fn name(&self) -> &str {
        "fake-image"
    }
}

#[async_trait]
impl ImageGenerator for FakeImageGenerator {
    async fn generate(&self, prompt: &str, references: &[ReferenceImage]) -> Result<GeneratedImage> {
        self.calls
            .lock()
            .expect("test mutex poisoned")
            .push(ImageCall {
                prompt: prompt.to_string(),
                labels: references.iter().map(|item| item.label.clone()).collect(),
            });
        match self.mode {
            ImageMode::Composite { width, height } => Ok(GeneratedImage {
                url: "https://gen.test/composite.png".to_string(),
                bytes: Some(png_bytes(width, height, [30, 90, 160])),
                mime_type: "image/png".to_string(),
            }),
            ImageMode::Fail => bail!("image model overloaded"),
            ImageMode::Panic => panic!("image backend crashed"),
            ImageMode::EmptyUrl => Ok(GeneratedImage {
                url: String::new(),
                bytes: None,
                mime_type: "image/png".to_string(),
            }),
        }
    }
}

pub struct FakeVideo {
    fail: bool,
    requests: Mutex<Vec<VideoRequest>>,
}

impl FakeVideo {
    pub fn new(fail: bool) -> Self {
        Self {
            fail,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<VideoRequest> {
        locked(&self.requests)
    }
}

impl NamedProvider for FakeVideo {
    fn name(&self) -> &str {
        "fake-video"
    }
}

#[async_trait]
impl VideoGenerator for FakeVideo {
    async fn generate(&self, request: &VideoRequest) -> Result<GeneratedVideo> {
        self.requests
            .lock()
            .expect("test mutex poisoned")
            .push(request.clone());
        if self.fail {
            bail!("video quota exhausted");
        }
        Ok(GeneratedVideo {
            url: "https://video.test/clip.mp4".to_string(),
            bytes: Some(b"mp4".to_vec()),
        })
    }
}
