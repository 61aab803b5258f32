use std::collections::BTreeSet;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::post::{GeneratedPost, UsageDecision};
use super::research::{ImageItem, SubTask, SubTaskResults, WebItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    PlanReview,
    Research,
    Selection,
    Generation,
    Complete,
    Error,
}

impl Phase {
    fn rank(&self) -> u8 {
        match self {
            Self::Planning => 0,
            Self::PlanReview => 1,
            Self::Research => 2,
            Self::Selection => 3,
            Self::Generation => 4,
            Self::Complete => 5,
            Self::Error => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::PlanReview => "plan_review",
            Self::Research => "research",
            Self::Selection => "selection",
            Self::Generation => "generation",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    /// Phases only move forward. `Error` is reachable from every other phase
    /// and is never left.
    pub fn can_advance_to(&self, next: Phase) -> bool {
        if *self == Phase::Error {
            return false;
        }
        next == Phase::Error || next.rank() > self.rank()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseError {
    pub from: Phase,
    pub to: Phase,
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot move session from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for PhaseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidPhase,
    InvalidInput,
    Planning,
    Research,
    Generation,
    Capability,
    Storage,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidPhase => "invalid_phase",
            Self::InvalidInput => "invalid_input",
            Self::Planning => "planning",
            Self::Research => "research",
            Self::Generation => "generation",
            Self::Capability => "capability",
            Self::Storage => "storage",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSelections {
    #[serde(default)]
    pub web_item_ids: BTreeSet<String>,
    #[serde(default)]
    pub image_ids: BTreeSet<String>,
}

impl UserSelections {
    pub fn is_empty(&self) -> bool {
        self.web_item_ids.is_empty() && self.image_ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCounts {
    pub web_count: usize,
    pub image_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSession {
    pub session_id: String,
    pub influencer_id: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_type_hint: Option<String>,
    pub phase: Phase,
    #[serde(default)]
    pub research_plan: Vec<SubTask>,
    #[serde(default)]
    pub research_results: IndexMap<String, SubTaskResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_selections: Option<UserSelections>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_usage_plan: Option<Vec<UsageDecision>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_post: Option<GeneratedPost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub epoch: String,
    pub created_at: String,
    pub updated_at: String,
}

impl OrchestratorSession {
    pub fn new(
        session_id: impl Into<String>,
        influencer_id: impl Into<String>,
        query: impl Into<String>,
        post_type_hint: Option<String>,
        owner_id: Option<String>,
    ) -> Self {
        let now = super::now_utc_iso();
        Self {
            session_id: session_id.into(),
            influencer_id: influencer_id.into(),
            query: query.into(),
            post_type_hint,
            phase: Phase::Planning,
            research_plan: Vec::new(),
            research_results: IndexMap::new(),
            user_selections: None,
            image_usage_plan: None,
            generated_post: None,
            error: None,
            error_kind: None,
            owner_id,
            epoch: Uuid::new_v4().to_string(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = super::now_utc_iso();
    }

    pub fn advance(&mut self, next: Phase) -> Result<(), PhaseError> {
        if !self.phase.can_advance_to(next) {
            return Err(PhaseError {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        self.touch();
        Ok(())
    }

    /// Moves to `Error` unconditionally and records the failure.
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.phase = Phase::Error;
        self.error = Some(message.into());
        self.error_kind = Some(kind);
        self.touch();
    }

    pub fn sub_task(&self, sub_task_id: &str) -> Option<&SubTask> {
        self.research_plan.iter().find(|task| task.id == sub_task_id)
    }

    pub fn sub_task_mut(&mut self, sub_task_id: &str) -> Option<&mut SubTask> {
        self.research_plan
            .iter_mut()
            .find(|task| task.id == sub_task_id)
    }

    /// Stores results for a sub-task, replacing anything stored before.
    /// Entries stay in plan order whatever order the searches finish in.
    pub fn set_results(&mut self, sub_task_id: impl Into<String>, results: SubTaskResults) {
        self.research_results.insert(sub_task_id.into(), results);
        let plan = &self.research_plan;
        let rank = |id: &String| {
            plan.iter()
                .position(|task| &task.id == id)
                .unwrap_or(usize::MAX)
        };
        self.research_results
            .sort_by(|left, _, right, _| rank(left).cmp(&rank(right)));
        self.touch();
    }

    /// Counts per sub-task in plan order; sub-tasks without results report zero.
    pub fn results_summary(&self) -> IndexMap<String, ResultCounts> {
        self.research_plan
            .iter()
            .map(|task| {
                let counts = self
                    .research_results
                    .get(&task.id)
                    .map(|results| ResultCounts {
                        web_count: results.web_items.len(),
                        image_count: results.images.len(),
                    })
                    .unwrap_or_default();
                (task.id.clone(), counts)
            })
            .collect()
    }

    /// Resolves selected ids against stored results, in plan then result order.
    pub fn selected_items(&self, selections: &UserSelections) -> (Vec<WebItem>, Vec<ImageItem>) {
        let mut web_items = Vec::new();
        let mut images = Vec::new();
        for results in self.research_results.values() {
            web_items.extend(
                results
                    .web_items
                    .iter()
                    .filter(|item| selections.web_item_ids.contains(&item.id))
                    .cloned(),
            );
            images.extend(
                results
                    .images
                    .iter()
                    .filter(|item| selections.image_ids.contains(&item.id))
                    .cloned(),
            );
        }
        (web_items, images)
    }
}
