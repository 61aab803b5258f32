use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use postcraft_contracts::providers::NamedProvider;
use postcraft_contracts::session::{
    GeneratedPost, GridLayout, ImageItem, ImageRole, Persona, SlidePlan, UsageDecision, UsageType,
    WebItem, AVATAR_REFERENCE_LABEL,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::capabilities::{BlobStore, FetchedImage, ImageFetcher, ImageGenerator, ReferenceImage};
use crate::grid::split_layout;
use crate::slides::SlidePlanner;
use crate::strategist::ImageStrategist;

/// Avatar included.
pub const MAX_REFERENCES: usize = 4;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COMPOSITE_TIMEOUT: Duration = Duration::from_secs(60);

const PANEL_CONTENT_TYPE: &str = "image/jpeg";
const STYLE_LINE: &str =
    "Style: Professional, high-quality, Instagram-ready, photorealistic, natural lighting.";

/// Reading-order position names for each panel of `layout`.
pub fn position_labels(layout: GridLayout) -> Vec<String> {
    let (rows, cols) = (layout.rows(), layout.cols());
    let named: Option<&[&str]> = match (rows, cols) {
        (1, 2) => Some(&["LEFT", "RIGHT"]),
        (2, 1) => Some(&["TOP", "BOTTOM"]),
        (2, 2) => Some(&["TOP-LEFT", "TOP-RIGHT", "BOTTOM-LEFT", "BOTTOM-RIGHT"]),
        (2, 3) => Some(&[
            "TOP-LEFT",
            "TOP-CENTER",
            "TOP-RIGHT",
            "BOTTOM-LEFT",
            "BOTTOM-CENTER",
            "BOTTOM-RIGHT",
        ]),
        (3, 2) => Some(&[
            "TOP-LEFT",
            "TOP-RIGHT",
            "MIDDLE-LEFT",
            "MIDDLE-RIGHT",
            "BOTTOM-LEFT",
            "BOTTOM-RIGHT",
        ]),
        _ => None,
    };
    match named {
        Some(labels) => labels.iter().map(|label| label.to_string()).collect(),
        None => (1..=rows)
            .flat_map(|row| (1..=cols).map(move |col| format!("R{row}C{col}")))
            .collect(),
    }
}

pub fn grid_prompt(plan: &SlidePlan, usage: &[UsageDecision]) -> String {
    let positions = position_labels(plan.grid_layout);
    let mut prompt = format!(
        "Create a {layout} grid of {count} ultra-realistic smartphone photos for a social media post.\n\n\
GRID LAYOUT: {grid}\n\n\
INFLUENCER: Use character from image {avatar} (influencer avatar) in all panels.\n\n",
        layout = plan.grid_layout,
        count = plan.slide_count,
        grid = positions.join(" → "),
        avatar = AVATAR_REFERENCE_LABEL,
    );
    for (idx, slide) in plan
        .slides
        .iter()
        .take(plan.slide_count as usize)
        .enumerate()
    {
        let position = positions.get(idx).map(String::as_str).unwrap_or("PANEL");
        prompt.push_str(&format!(
            "Panel {} ({position}): Character from {AVATAR_REFERENCE_LABEL}, {}\n",
            idx + 1,
            slide.panel_description
        ));
    }
    let inspirations: Vec<&str> = usage
        .iter()
        .filter(|decision| decision.usage_type == UsageType::PromptOnly)
        .map(|decision| decision.description.trim())
        .filter(|description| !description.is_empty())
        .collect();
    if !inspirations.is_empty() {
        prompt.push_str(&format!("\nMood inspiration: {}\n", inspirations.join("; ")));
    }
    prompt.push('\n');
    prompt.push_str(STYLE_LINE);
    prompt
}

pub struct ComposeInput<'a> {
    pub persona: &'a Persona,
    pub avatar: &'a FetchedImage,
    pub web_items: &'a [WebItem],
    pub images: &'a [ImageItem],
    pub query: &'a str,
}

#[derive(Clone)]
pub struct PostComposer {
    strategist: ImageStrategist,
    slides: SlidePlanner,
    images: Arc<dyn ImageGenerator>,
    fetcher: Arc<dyn ImageFetcher>,
    blobs: Option<Arc<dyn BlobStore>>,
    fetch_timeout: Duration,
    composite_timeout: Duration,
}

impl PostComposer {
    pub fn new(
        strategist: ImageStrategist,
        slides: SlidePlanner,
        images: Arc<dyn ImageGenerator>,
        fetcher: Arc<dyn ImageFetcher>,
        blobs: Option<Arc<dyn BlobStore>>,
    ) -> Self {
        Self {
            strategist,
            slides,
            images,
            fetcher,
            blobs,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            composite_timeout: DEFAULT_COMPOSITE_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, fetch: Duration, composite: Duration) -> Self {
        self.fetch_timeout = fetch;
        self.composite_timeout = composite;
        self
    }

    pub async fn compose(&self, input: ComposeInput<'_>) -> Result<GeneratedPost> {
        info!(
            images = input.images.len(),
            web_items = input.web_items.len(),
            "composing post"
        );
        let usage = self
            .strategist
            .decide(input.persona, input.images, input.query)
            .await;
        let plan = self
            .slides
            .plan(input.persona, input.web_items, &usage, input.query)
            .await;

        let references = self
            .build_references(input.persona, input.avatar, &usage)
            .await;
        let prompt = grid_prompt(&plan, &usage);
        info!(
            layout = %plan.grid_layout,
            references = references.len(),
            prompt_chars = prompt.chars().count(),
            "generating composite grid"
        );

        let generated = self
            .images
            .generate(&prompt, &references)
            .await
            .with_context(|| format!("{} composite generation failed", self.images.name()))?;
        if generated.url.trim().is_empty() {
            bail!("Image generation failed - no URL returned");
        }
        let composite = match generated.bytes.filter(|bytes| !bytes.is_empty()) {
            Some(bytes) => bytes,
            None => {
                self.fetcher
                    .fetch(&generated.url, self.composite_timeout)
                    .await
                    .context("composite download failed")?
                    .bytes
            }
        };

        let panels = split_layout(&composite, plan.grid_layout)?;
        if panels.len() != plan.slide_count as usize {
            warn!(
                expected = plan.slide_count,
                actual = panels.len(),
                "panel count differs from slide count"
            );
        }

        let (slide_urls, grid_url) = self
            .persist(&generated.url, &composite, panels, plan.slide_count)
            .await;

        Ok(GeneratedPost {
            slide_count: plan.slide_count,
            grid_layout: plan.grid_layout,
            slide_urls,
            grid_url,
            caption: plan.caption,
            image_usage_plan: usage,
            posting_id: None,
        })
    }

    async fn build_references(
        &self,
        persona: &Persona,
        avatar: &FetchedImage,
        usage: &[UsageDecision],
    ) -> Vec<ReferenceImage> {
        let mut references = vec![ReferenceImage::from_bytes(
            &avatar.bytes,
            &avatar.mime_type,
            AVATAR_REFERENCE_LABEL,
            ImageRole::Character,
            format!("{} avatar", persona.name),
        )];
        for decision in usage
            .iter()
            .filter(|decision| decision.usage_type == UsageType::Reference)
        {
            if references.len() >= MAX_REFERENCES {
                break;
            }
            let url = decision.selected_image_url.trim();
            if url.is_empty() {
                continue;
            }
            let image = match self.fetcher.fetch(url, self.fetch_timeout).await {
                Ok(image) => image,
                Err(err) => {
                    warn!(url = %url, error = %format!("{err:#}"), "skipping reference image");
                    continue;
                }
            };
            let label = decision
                .reference_label
                .clone()
                .unwrap_or_else(|| format!("[{}]", references.len() + 1));
            let description = if decision.description.trim().is_empty() {
                "Reference image".to_string()
            } else {
                decision.description.clone()
            };
            references.push(ReferenceImage::from_bytes(
                &image.bytes,
                &image.mime_type,
                label,
                decision.role,
                description,
            ));
        }
        references
    }

    /// Uploads panels and the composite. Without a blob store, or on any
    /// upload failure, every slide points at the composite URL.
    async fn persist(
        &self,
        composite_url: &str,
        composite: &[u8],
        panels: Vec<Vec<u8>>,
        slide_count: u32,
    ) -> (Vec<String>, String) {
        let degraded = || {
            (
                vec![composite_url.to_string(); slide_count as usize],
                composite_url.to_string(),
            )
        };
        let Some(blobs) = self.blobs.as_ref() else {
            warn!("no blob store configured, slides reuse the composite URL");
            return degraded();
        };
        match upload_all(blobs.as_ref(), composite, panels).await {
            Ok(urls) => urls,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "panel upload failed, slides reuse the composite URL");
                degraded()
            }
        }
    }
}

async fn upload_all(
    blobs: &dyn BlobStore,
    composite: &[u8],
    panels: Vec<Vec<u8>>,
) -> Result<(Vec<String>, String)> {
    let total = panels.len();
    let mut slide_urls = Vec::with_capacity(total);
    for (idx, panel) in panels.into_iter().enumerate() {
        let key = format!("orchestrator/slides/{}_panel_{}.jpg", Uuid::new_v4(), idx + 1);
        let url = blobs
            .put(&key, panel, PANEL_CONTENT_TYPE)
            .await
            .with_context(|| format!("upload of panel {}/{total} failed", idx + 1))?;
        slide_urls.push(url);
    }
    let key = format!("orchestrator/grids/{}_grid.jpg", Uuid::new_v4());
    let grid_url = blobs
        .put(&key, composite.to_vec(), PANEL_CONTENT_TYPE)
        .await
        .context("composite upload failed")?;
    Ok((slide_urls, grid_url))
}
