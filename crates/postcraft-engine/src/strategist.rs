use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use postcraft_contracts::providers::NamedProvider;
use postcraft_contracts::session::{ImageItem, ImageRole, Persona, UsageDecision, UsageType};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::capabilities::{TextGenerator, TextRequest};

const FALLBACK_REFERENCES: usize = 2;

pub fn strategy_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "image_usage_plan": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "selected_image_url": {"type": "string"},
                        "usage_type": {"type": "string", "enum": ["reference", "prompt_only"]},
                        "reference_label": {"type": "string", "description": "e.g. [2], [3]"},
                        "role": {"type": "string", "description": "product, location, object"},
                        "description": {"type": "string"},
                        "reasoning": {"type": "string"}
                    },
                    "required": ["selected_image_url", "usage_type", "reasoning"]
                }
            }
        },
        "required": ["image_usage_plan"]
    })
}

pub fn strategy_prompt(persona: &Persona, images: &[ImageItem], query: &str) -> String {
    let listing = images
        .iter()
        .enumerate()
        .map(|(idx, image)| format!("{}. {} - {}", idx + 1, image.title, image.image_url))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Analyze the selected images and decide how to use each one for creating a social media post.\n\n\
USER QUERY: {query}\n\n\
INFLUENCER PROFILE:\n\
- Name: {name}\n\
- Niches: {niches}\n\
- Style: {tone}\n\n\
SELECTED IMAGES ({count}):\n\
{listing}\n\n\
For each image, decide:\n\
1. usage_type: \"reference\" (use as reference image with label) or \"prompt_only\" (just mention in prompt)\n\
2. If \"reference\": assign label like \"[2]\", \"[3]\" (note: [1] is reserved for influencer avatar)\n\
3. role: \"product\", \"location\", \"object\", or \"character\"\n\
4. description: Brief description for the LLM to understand\n\
5. reasoning: Why this usage type?\n\n\
Guidelines:\n\
- Use \"reference\" for images that should be replicated consistently (products, specific locations, objects)\n\
- Use \"prompt_only\" for images that just inspire the style/mood\n\
- Limit references to max 3 images (including influencer avatar)\n\
- Choose the most important/relevant images as references\n\n\
Return a JSON object with \"image_usage_plan\" array.",
        name = persona.name,
        niches = persona.niches_text(),
        tone = persona.tone_text(),
        count = images.len(),
    )
}

/// First two selected images as generic object references.
pub fn fallback_strategy(images: &[ImageItem]) -> Vec<UsageDecision> {
    images
        .iter()
        .take(FALLBACK_REFERENCES)
        .enumerate()
        .map(|(idx, image)| UsageDecision {
            image_id: image.id.clone(),
            selected_image_url: image.image_url.clone(),
            usage_type: UsageType::Reference,
            role: ImageRole::Object,
            reference_label: Some(format!("[{}]", idx + 2)),
            description: if image.title.trim().is_empty() {
                "Selected image".to_string()
            } else {
                image.title.clone()
            },
            reasoning: "Auto-assigned as reference".to_string(),
        })
        .collect()
}

fn label_number(label: &str) -> Option<u32> {
    let digits: String = label.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Gives every reference a unique `[n]` label, never `[1]`; prompt-only
/// decisions carry no label.
pub fn normalize_labels(decisions: &mut [UsageDecision]) {
    let mut used: HashSet<u32> = HashSet::from([1]);
    let mut pending = Vec::new();
    for (idx, decision) in decisions.iter_mut().enumerate() {
        if decision.usage_type != UsageType::Reference {
            decision.reference_label = None;
            continue;
        }
        match decision.reference_label.as_deref().and_then(label_number) {
            Some(number) if used.insert(number) => {
                decision.reference_label = Some(format!("[{number}]"));
            }
            _ => pending.push(idx),
        }
    }
    let mut next = 2;
    for idx in pending {
        while used.contains(&next) {
            next += 1;
        }
        used.insert(next);
        decisions[idx].reference_label = Some(format!("[{next}]"));
    }
}

fn text_field(entry: &Map<String, Value>, key: &str) -> String {
    entry
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn parse_strategy(value: &Value, images: &[ImageItem]) -> Result<Vec<UsageDecision>> {
    let Some(entries) = value.get("image_usage_plan").and_then(Value::as_array) else {
        bail!("strategy response has no image_usage_plan array");
    };
    let mut decisions = Vec::new();
    for entry in entries.iter().filter_map(Value::as_object) {
        let url = text_field(entry, "selected_image_url");
        let Some(image) = images.iter().find(|image| image.image_url == url) else {
            warn!(url = %url, "strategy referenced an image that was not selected");
            continue;
        };
        let usage_type = match text_field(entry, "usage_type").as_str() {
            "reference" => UsageType::Reference,
            _ => UsageType::PromptOnly,
        };
        let label = text_field(entry, "reference_label");
        decisions.push(UsageDecision {
            image_id: image.id.clone(),
            selected_image_url: url,
            usage_type,
            role: ImageRole::parse_lenient(&text_field(entry, "role")),
            reference_label: (!label.is_empty()).then_some(label),
            description: text_field(entry, "description"),
            reasoning: text_field(entry, "reasoning"),
        });
    }
    if decisions.is_empty() {
        bail!("strategy response matched none of the selected images");
    }
    normalize_labels(&mut decisions);
    Ok(decisions)
}

#[derive(Clone)]
pub struct ImageStrategist {
    text: Arc<dyn TextGenerator>,
}

impl ImageStrategist {
    pub fn new(text: Arc<dyn TextGenerator>) -> Self {
        Self { text }
    }

    pub async fn decide(
        &self,
        persona: &Persona,
        images: &[ImageItem],
        query: &str,
    ) -> Vec<UsageDecision> {
        if images.is_empty() {
            return Vec::new();
        }
        match self.request_strategy(persona, images, query).await {
            Ok(decisions) => {
                info!(decisions = decisions.len(), "image usage strategy decided");
                decisions
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "image strategy failed, using default strategy");
                fallback_strategy(images)
            }
        }
    }

    async fn request_strategy(
        &self,
        persona: &Persona,
        images: &[ImageItem],
        query: &str,
    ) -> Result<Vec<UsageDecision>> {
        let output = self
            .text
            .generate(TextRequest::structured(
                strategy_prompt(persona, images, query),
                strategy_schema(),
            ))
            .await
            .with_context(|| format!("{} strategy request failed", self.text.name()))?;
        parse_strategy(&output.into_json()?, images)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use postcraft_contracts::session::{ImageItem, ImageRole, UsageDecision, UsageType};
    use serde_json::json;

    use super::{fallback_strategy, normalize_labels, parse_strategy, ImageStrategist};
    use crate::capabilities::TextOutput;
    use crate::testkit::{persona, ScriptedText};

    fn images() -> Vec<ImageItem> {
        vec![
            ImageItem::new("t1", "https://img/1.jpg", "Kettle"),
            ImageItem::new("t2", "https://img/2.jpg", ""),
            ImageItem::new("t3", "https://img/3.jpg", "Cafe"),
        ]
    }

    fn reference(label: Option<&str>) -> UsageDecision {
        UsageDecision {
            image_id: String::new(),
            selected_image_url: String::new(),
            usage_type: UsageType::Reference,
            role: ImageRole::Object,
            reference_label: label.map(str::to_string),
            description: String::new(),
            reasoning: String::new(),
        }
    }

    #[test]
    fn fallback_uses_first_two_images() {
        let plan = fallback_strategy(&images());
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].reference_label.as_deref(), Some("[2]"));
        assert_eq!(plan[1].reference_label.as_deref(), Some("[3]"));
        assert_eq!(plan[0].description, "Kettle");
        assert_eq!(plan[1].description, "Selected image");
        assert!(plan.iter().all(|decision| decision.role == ImageRole::Object));
        assert_eq!(plan[0].reasoning, "Auto-assigned as reference");
    }

    #[test]
    fn labels_are_unique_and_never_the_avatar_slot() {
        let mut plan = vec![
            reference(Some("[1]")),
            reference(Some("image 3")),
            reference(Some("[3]")),
            reference(None),
        ];
        plan.push(UsageDecision {
            usage_type: UsageType::PromptOnly,
            ..reference(Some("[9]"))
        });
        normalize_labels(&mut plan);
        let labels: Vec<Option<&str>> = plan
            .iter()
            .map(|decision| decision.reference_label.as_deref())
            .collect();
        assert_eq!(
            labels,
            vec![Some("[2]"), Some("[3]"), Some("[4]"), Some("[5]"), None]
        );
    }

    #[test]
    fn parse_keeps_only_selected_images() -> anyhow::Result<()> {
        let selected = images();
        let plan = parse_strategy(
            &json!({"image_usage_plan": [
                {"selected_image_url": "https://img/3.jpg", "usage_type": "reference",
                 "reference_label": "[2]", "role": "Place", "description": "the cafe",
                 "reasoning": "recurring location"},
                {"selected_image_url": "https://elsewhere/9.jpg", "usage_type": "reference",
                 "reasoning": "?"},
                {"selected_image_url": "https://img/1.jpg", "usage_type": "prompt_only",
                 "reasoning": "mood"}
            ]}),
            &selected,
        )?;
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].image_id, selected[2].id);
        assert_eq!(plan[0].role, ImageRole::Location);
        assert_eq!(plan[1].usage_type, UsageType::PromptOnly);
        assert_eq!(plan[1].reference_label, None);
        Ok(())
    }

    #[tokio::test]
    async fn no_images_means_no_model_call() {
        let text = Arc::new(ScriptedText::new(Vec::new()));
        let plan = ImageStrategist::new(text.clone())
            .decide(&persona(), &[], "espresso")
            .await;
        assert!(plan.is_empty());
        assert!(text.prompts().is_empty());
    }

    #[tokio::test]
    async fn malformed_output_falls_back() {
        let text = Arc::new(ScriptedText::new(vec![Ok(TextOutput::Structured(
            json!({"image_usage_plan": "soon"}),
        ))]));
        let plan = ImageStrategist::new(text.clone())
            .decide(&persona(), &images(), "espresso")
            .await;
        assert_eq!(plan.len(), 2);
        let prompt = &text.prompts()[0];
        assert!(prompt.contains("SELECTED IMAGES (3):"));
        assert!(prompt.contains("1. Kettle - https://img/1.jpg"));
    }
}
