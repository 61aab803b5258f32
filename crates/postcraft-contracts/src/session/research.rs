use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_SUB_TASKS: usize = 5;
pub const MAX_QUERIES_PER_SUB_TASK: usize = 4;

/// A sub-task whose results have fewer than this many web items *and* fewer
/// than this many images counts as sparse.
pub const SPARSE_RESULT_THRESHOLD: usize = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl SubTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub name: String,
    pub queries: Vec<String>,
    #[serde(default)]
    pub status: SubTaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Bumped each time a search run starts. A run only stores its results
    /// while it is still the latest one.
    #[serde(default)]
    pub attempts: u32,
}

impl SubTask {
    pub fn new(name: impl Into<String>, queries: Vec<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), name, queries)
    }

    pub fn with_id(id: impl Into<String>, name: impl Into<String>, queries: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            queries: clean_queries(queries),
            status: SubTaskStatus::Pending,
            error: None,
            attempts: 0,
        }
    }

    pub fn mark_in_progress(&mut self) {
        self.status = SubTaskStatus::InProgress;
        self.attempts += 1;
    }

    pub fn mark_complete(&mut self) {
        self.status = SubTaskStatus::Complete;
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = SubTaskStatus::Failed;
        self.error = Some(error.into());
    }
}

/// Trims queries, drops blank ones and keeps at most
/// [`MAX_QUERIES_PER_SUB_TASK`] in their original order.
pub fn clean_queries<I>(queries: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    queries
        .into_iter()
        .map(|query| query.trim().to_string())
        .filter(|query| !query.is_empty())
        .take(MAX_QUERIES_PER_SUB_TASK)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebItem {
    pub id: String,
    pub title: String,
    pub snippet: String,
    pub url: String,
}

impl WebItem {
    pub fn new(title: impl Into<String>, snippet: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            snippet: snippet.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageItem {
    pub id: String,
    pub thumbnail: String,
    pub image_url: String,
    pub title: String,
}

impl ImageItem {
    pub fn new(
        thumbnail: impl Into<String>,
        image_url: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thumbnail: thumbnail.into(),
            image_url: image_url.into(),
            title: title.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskResults {
    #[serde(default)]
    pub web_items: Vec<WebItem>,
    #[serde(default)]
    pub images: Vec<ImageItem>,
}

impl SubTaskResults {
    pub fn total(&self) -> usize {
        self.web_items.len() + self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn is_sparse(&self) -> bool {
        self.web_items.len() < SPARSE_RESULT_THRESHOLD
            && self.images.len() < SPARSE_RESULT_THRESHOLD
    }
}
