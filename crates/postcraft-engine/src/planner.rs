use std::sync::Arc;

use anyhow::{bail, Context, Result};
use postcraft_contracts::providers::NamedProvider;
use postcraft_contracts::session::{clean_queries, Persona, SubTask, MAX_SUB_TASKS};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::capabilities::{TextGenerator, TextRequest};

const POST_TYPE_EXAMPLES: [(&str, &str); 6] = [
    (
        "Tutorial",
        "step-by-step instructions, key tips, common mistakes",
    ),
    (
        "Review",
        "product features, pros and cons, user testimonials",
    ),
    (
        "Comparison",
        "option A details, option B details, comparison points",
    ),
    (
        "News",
        "latest updates, background context, expert opinions",
    ),
    ("Guide", "overview, detailed steps, recommendations"),
    ("How-to", "preparation, execution steps, final results"),
];

const BROADEN_WORDS: usize = 3;

pub fn plan_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "sub_tasks": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {
                            "type": "string",
                            "description": "Clear description of the research task"
                        },
                        "queries": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "2-4 search queries"
                        }
                    },
                    "required": ["name", "queries"]
                }
            }
        },
        "required": ["sub_tasks"]
    })
}

fn post_type_example(hint: Option<&str>) -> Option<&'static str> {
    let hint = hint?.trim();
    POST_TYPE_EXAMPLES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(hint))
        .map(|(_, example)| *example)
}

pub fn planning_prompt(query: &str, post_type_hint: Option<&str>, persona: &Persona) -> String {
    let example_text = match (post_type_hint, post_type_example(post_type_hint)) {
        (Some(hint), Some(example)) => {
            format!("\nExample sub-tasks for {}: {example}", hint.trim())
        }
        _ => String::new(),
    };
    format!(
        "Break down this content request into 3-5 research sub-tasks.\n\n\
USER REQUEST: {query}\n\n\
INFLUENCER: {name} - {niches}\n\
{example_text}\n\n\
For each sub-task:\n\
1. name: Clear description (e.g., \"Find latest statistics\", \"Research product features\")\n\
2. queries: 2-4 search queries to find this information\n\n\
Guidelines:\n\
- Each sub-task should find specific information needed for the post\n\
- Queries should be 3-8 words, optimized for web search\n\
- Cover different aspects of the request\n\
- Include both fact-finding and visual research\n\n\
Return a JSON object with \"sub_tasks\" array.",
        name = persona.name,
        niches = persona.niches_text(),
    )
}

/// Three-step plan used whenever the model output is unusable.
pub fn fallback_plan(query: &str) -> Vec<SubTask> {
    let query = query.trim();
    vec![
        SubTask::new(
            "Research main topic",
            vec![query.to_string(), format!("{query} facts")],
        ),
        SubTask::new(
            "Find visual examples",
            vec![format!("{query} images"), format!("{query} examples")],
        ),
        SubTask::new(
            "Get expert insights",
            vec![format!("{query} tips"), format!("{query} guide")],
        ),
    ]
}

/// Keeps the first three words of a longer query.
pub fn broaden_query(query: &str) -> String {
    let words: Vec<&str> = query.split_whitespace().collect();
    if words.len() > BROADEN_WORDS {
        words[..BROADEN_WORDS].join(" ")
    } else {
        query.trim().to_string()
    }
}

pub(crate) fn parse_plan(value: &Value) -> Result<Vec<SubTask>> {
    let Some(entries) = value.get("sub_tasks").and_then(Value::as_array) else {
        bail!("plan response has no sub_tasks array");
    };
    let plan: Vec<SubTask> = entries
        .iter()
        .filter_map(Value::as_object)
        .enumerate()
        .filter_map(|(idx, entry)| {
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Sub-task {}", idx + 1));
            let queries = clean_queries(
                entry
                    .get("queries")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                    .map(str::to_string),
            );
            if queries.is_empty() {
                return None;
            }
            Some(SubTask::new(name, queries))
        })
        .take(MAX_SUB_TASKS)
        .collect();
    if plan.is_empty() {
        bail!("plan response contained no usable sub-tasks");
    }
    Ok(plan)
}

#[derive(Clone)]
pub struct PlanGenerator {
    text: Arc<dyn TextGenerator>,
}

impl PlanGenerator {
    pub fn new(text: Arc<dyn TextGenerator>) -> Self {
        Self { text }
    }

    /// Never fails: malformed or failed generations fall back to
    /// [`fallback_plan`].
    pub async fn create_plan(
        &self,
        query: &str,
        post_type_hint: Option<&str>,
        persona: &Persona,
    ) -> Vec<SubTask> {
        match self.request_plan(query, post_type_hint, persona).await {
            Ok(plan) => {
                info!(sub_tasks = plan.len(), "research plan created");
                plan
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "planning failed, using fallback plan");
                fallback_plan(query)
            }
        }
    }

    async fn request_plan(
        &self,
        query: &str,
        post_type_hint: Option<&str>,
        persona: &Persona,
    ) -> Result<Vec<SubTask>> {
        let prompt = planning_prompt(query, post_type_hint, persona);
        let output = self
            .text
            .generate(TextRequest::structured(prompt, plan_schema()))
            .await
            .with_context(|| format!("{} plan request failed", self.text.name()))?;
        parse_plan(&output.into_json()?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use postcraft_contracts::session::SubTaskStatus;
    use serde_json::json;

    use super::{broaden_query, fallback_plan, parse_plan, planning_prompt, PlanGenerator};
    use crate::capabilities::TextOutput;
    use crate::testkit::{persona, ScriptedText};

    #[test]
    fn fallback_plan_matches_template() {
        let plan = fallback_plan("cold brew");
        let names: Vec<&str> = plan.iter().map(|task| task.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Research main topic",
                "Find visual examples",
                "Get expert insights"
            ]
        );
        assert_eq!(plan[0].queries, vec!["cold brew", "cold brew facts"]);
        assert_eq!(plan[1].queries, vec!["cold brew images", "cold brew examples"]);
        assert_eq!(plan[2].queries, vec!["cold brew tips", "cold brew guide"]);
        assert!(plan.iter().all(|task| task.status == SubTaskStatus::Pending));
    }

    #[test]
    fn broaden_query_keeps_first_three_words() {
        assert_eq!(broaden_query("best pour over kettles 2025"), "best pour over");
        assert_eq!(broaden_query("  cold   brew  "), "cold   brew");
        assert_eq!(broaden_query("one two three"), "one two three");
    }

    #[test]
    fn parse_plan_bounds_sub_tasks_and_queries() -> anyhow::Result<()> {
        let tasks: Vec<_> = (0..7)
            .map(|idx| json!({"name": format!("task {idx}"), "queries": ["a", "b", "c", "d", "e"]}))
            .collect();
        let plan = parse_plan(&json!({ "sub_tasks": tasks }))?;
        assert_eq!(plan.len(), 5);
        assert!(plan.iter().all(|task| task.queries.len() == 4));
        let ids: std::collections::HashSet<&str> = plan.iter().map(|task| task.id.as_str()).collect();
        assert_eq!(ids.len(), 5);
        Ok(())
    }

    #[test]
    fn parse_plan_drops_empty_sub_tasks_and_names_unnamed_ones() -> anyhow::Result<()> {
        let plan = parse_plan(&json!({"sub_tasks": [
            {"name": "empty", "queries": ["  ", ""]},
            {"queries": ["latte art"]},
        ]}))?;
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name, "Sub-task 2");
        assert!(parse_plan(&json!({"sub_tasks": [{"name": "x", "queries": []}]})).is_err());
        assert!(parse_plan(&json!({"plan": []})).is_err());
        Ok(())
    }

    #[test]
    fn prompt_embeds_post_type_example() {
        let prompt = planning_prompt("espresso", Some("review"), &persona());
        assert!(prompt.contains("USER REQUEST: espresso"));
        assert!(prompt.contains("Example sub-tasks for review: product features"));
        let plain = planning_prompt("espresso", Some("Rant"), &persona());
        assert!(!plain.contains("Example sub-tasks"));
    }

    #[tokio::test]
    async fn create_plan_uses_model_output() {
        let text = Arc::new(ScriptedText::new(vec![Ok(TextOutput::Structured(json!({
            "sub_tasks": [{"name": "Find beans", "queries": ["single origin beans"]}]
        })))]));
        let plan = PlanGenerator::new(text.clone())
            .create_plan("espresso", None, &persona())
            .await;
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name, "Find beans");
        assert_eq!(text.prompts().len(), 1);
    }

    #[tokio::test]
    async fn create_plan_falls_back_on_failure_and_garbage() {
        let text = Arc::new(ScriptedText::new(vec![
            Err("quota exceeded".to_string()),
            Ok(TextOutput::Raw("definitely not json".to_string())),
        ]));
        let planner = PlanGenerator::new(text);
        let first = planner.create_plan("matcha", None, &persona()).await;
        let second = planner.create_plan("matcha", None, &persona()).await;
        assert_eq!(first.len(), 3);
        assert_eq!(second[0].queries, vec!["matcha", "matcha facts"]);
    }
}
