use std::sync::Arc;

use anyhow::{bail, Context, Result};
use postcraft_contracts::providers::NamedProvider;
use postcraft_contracts::session::{
    layout_matches_count, GridLayout, Persona, SlidePanel, SlidePlan, UsageDecision, WebItem,
    AVATAR_REFERENCE_LABEL,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::capabilities::{TextGenerator, TextRequest};

const WEB_CONTEXT_ITEMS: usize = 10;
const FALLBACK_SLIDES: u32 = 4;

pub fn slide_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "slide_count": {"type": "integer", "enum": [2, 4, 6]},
            "grid_layout": {"type": "string", "enum": ["1x2", "2x1", "2x2", "2x3", "3x2"]},
            "caption": {"type": "string", "description": "Instagram caption with hashtags"},
            "slides": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "panel_number": {"type": "integer"},
                        "panel_description": {"type": "string"},
                        "uses_images": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["panel_number", "panel_description"]
                }
            }
        },
        "required": ["slide_count", "grid_layout", "caption", "slides"]
    })
}

pub fn slide_prompt(
    persona: &Persona,
    web_items: &[WebItem],
    usage: &[UsageDecision],
    query: &str,
) -> String {
    let web_context = web_items
        .iter()
        .take(WEB_CONTEXT_ITEMS)
        .map(|item| format!("- {}: {}", item.title, item.snippet))
        .collect::<Vec<_>>()
        .join("\n");
    let image_context = usage
        .iter()
        .map(|decision| {
            format!(
                "- {}: {}",
                decision.reference_label.as_deref().unwrap_or("Image"),
                decision.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Create a slide structure for a social media post.\n\n\
USER QUERY: {query}\n\n\
INFLUENCER: {name} - {niches}\n\n\
SELECTED WEB FACTS:\n\
{web_context}\n\n\
AVAILABLE IMAGES:\n\
{image_context}\n\n\
Decide:\n\
1. slide_count: How many slides? Choose 2 (brief), 4 (standard), or 6 (detailed)\n\
2. grid_layout: Choose based on slide_count:\n   \
- 2 slides: \"1x2\" (vertical stack) or \"2x1\" (horizontal)\n   \
- 4 slides: \"2x2\" (square grid)\n   \
- 6 slides: \"2x3\" (landscape) or \"3x2\" (portrait)\n\
3. caption: Instagram-style caption with key facts and hashtags\n\
4. slides: Array of slide descriptions\n\n\
Each slide should have:\n\
- panel_number: 1, 2, 3, etc.\n\
- panel_description: What should be in this panel (1-2 sentences)\n\
- uses_images: Which image labels are used (e.g., [\"[1]\", \"[2]\"])\n\n\
Return JSON object.",
        name = persona.name,
        niches = persona.niches_text(),
    )
}

pub fn fallback_caption(query: &str) -> String {
    format!("Check out this amazing content! {}", query.trim())
}

fn generic_panel(index: usize) -> SlidePanel {
    SlidePanel {
        panel_number: index as u32 + 1,
        panel_description: format!("Panel {} content", index + 1),
        uses_images: vec![AVATAR_REFERENCE_LABEL.to_string()],
    }
}

pub fn fallback_slide_plan(query: &str) -> SlidePlan {
    SlidePlan {
        slide_count: FALLBACK_SLIDES,
        grid_layout: GridLayout::TwoByTwo,
        caption: fallback_caption(query),
        slides: (0..FALLBACK_SLIDES as usize).map(generic_panel).collect(),
    }
}

pub(crate) fn parse_slide_plan(value: &Value, query: &str) -> Result<SlidePlan> {
    let Some(slide_count) = value
        .get("slide_count")
        .and_then(Value::as_u64)
        .and_then(|count| u32::try_from(count).ok())
    else {
        bail!("slide plan has no integer slide_count");
    };
    let raw_layout = value
        .get("grid_layout")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let Some(grid_layout) = GridLayout::parse(raw_layout) else {
        bail!("unknown grid layout '{raw_layout}'");
    };
    if !layout_matches_count(slide_count, grid_layout) {
        bail!("grid layout {grid_layout} cannot hold {slide_count} slides");
    }

    let caption = value
        .get("caption")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|caption| !caption.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| fallback_caption(query));

    let mut slides: Vec<SlidePanel> = value
        .get("slides")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .take(slide_count as usize)
        .enumerate()
        .map(|(idx, entry)| SlidePanel {
            panel_number: idx as u32 + 1,
            panel_description: entry
                .get("panel_description")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Panel {} content", idx + 1)),
            uses_images: entry
                .get("uses_images")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        })
        .collect();
    while slides.len() < slide_count as usize {
        slides.push(generic_panel(slides.len()));
    }

    Ok(SlidePlan {
        slide_count,
        grid_layout,
        caption,
        slides,
    })
}

#[derive(Clone)]
pub struct SlidePlanner {
    text: Arc<dyn TextGenerator>,
}

impl SlidePlanner {
    pub fn new(text: Arc<dyn TextGenerator>) -> Self {
        Self { text }
    }

    /// Always returns a plan whose layout holds exactly `slide_count` panels.
    pub async fn plan(
        &self,
        persona: &Persona,
        web_items: &[WebItem],
        usage: &[UsageDecision],
        query: &str,
    ) -> SlidePlan {
        match self.request_plan(persona, web_items, usage, query).await {
            Ok(plan) => {
                info!(
                    slides = plan.slide_count,
                    layout = %plan.grid_layout,
                    "slide structure decided"
                );
                plan
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "slide structure failed, using defaults");
                fallback_slide_plan(query)
            }
        }
    }

    async fn request_plan(
        &self,
        persona: &Persona,
        web_items: &[WebItem],
        usage: &[UsageDecision],
        query: &str,
    ) -> Result<SlidePlan> {
        let output = self
            .text
            .generate(TextRequest::structured(
                slide_prompt(persona, web_items, usage, query),
                slide_schema(),
            ))
            .await
            .with_context(|| format!("{} slide request failed", self.text.name()))?;
        parse_slide_plan(&output.into_json()?, query)
    }
}
