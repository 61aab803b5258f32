use std::sync::Arc;

use futures::future::join_all;
use postcraft_contracts::session::{
    ImageItem, SubTask, SubTaskResults, WebItem, MAX_QUERIES_PER_SUB_TASK,
};
use tracing::{debug, info, warn};

use crate::capabilities::{ImageHit, ImageSearch, WebSearch};
use crate::planner::broaden_query;

pub const WEB_RESULTS_PER_GROUP: usize = 5;
pub const IMAGE_RESULTS_PER_QUERY: usize = 5;
pub const MAX_IMAGE_RESULTS: usize = 15;

/// Runs the web and image searches for one sub-task.
#[derive(Clone)]
pub struct ResearchExecutor {
    web: Arc<dyn WebSearch>,
    images: Arc<dyn ImageSearch>,
}

impl ResearchExecutor {
    pub fn new(web: Arc<dyn WebSearch>, images: Arc<dyn ImageSearch>) -> Self {
        Self { web, images }
    }

    /// Never fails. Search failures are logged and contribute no items.
    pub async fn execute(&self, sub_task: &SubTask) -> SubTaskResults {
        let queries: Vec<String> = sub_task
            .queries
            .iter()
            .take(MAX_QUERIES_PER_SUB_TASK)
            .cloned()
            .collect();
        if queries.is_empty() {
            warn!(sub_task = %sub_task.id, "sub-task has no queries");
            return SubTaskResults::default();
        }

        let (web_items, images) =
            tokio::join!(self.search_web(&queries), self.search_images(&queries));
        let mut results = SubTaskResults {
            web_items,
            images: images.into_iter().take(MAX_IMAGE_RESULTS).collect(),
        };

        if results.is_sparse() {
            let broader = broaden_query(&queries[0]);
            info!(
                sub_task = %sub_task.id,
                web = results.web_items.len(),
                images = results.images.len(),
                query = %broader,
                "sparse results, retrying with a broader query"
            );
            let retry = vec![broader];
            let (more_web, more_images) =
                tokio::join!(self.search_web(&retry), self.search_images(&retry));
            results.web_items.extend(more_web);
            results.images.extend(more_images);
        }

        debug!(
            sub_task = %sub_task.id,
            web = results.web_items.len(),
            images = results.images.len(),
            "research finished"
        );
        results
    }

    async fn search_web(&self, queries: &[String]) -> Vec<WebItem> {
        let response = match self.web.search(queries).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "web search failed");
                return Vec::new();
            }
        };
        response
            .into_groups()
            .into_iter()
            .flat_map(|group| group.results.into_iter().take(WEB_RESULTS_PER_GROUP))
            .map(|hit| WebItem::new(hit.title, hit.snippet, hit.url))
            .collect()
    }

    async fn search_images(&self, queries: &[String]) -> Vec<ImageItem> {
        let searches = queries.iter().map(|query| async move {
            match self.images.search(query, IMAGE_RESULTS_PER_QUERY).await {
                Ok(hits) => hits,
                Err(err) => {
                    warn!(query = %query, error = %format!("{err:#}"), "image search failed");
                    Vec::new()
                }
            }
        });
        join_all(searches)
            .await
            .into_iter()
            .flatten()
            .map(image_item)
            .collect()
    }
}

fn image_item(hit: ImageHit) -> ImageItem {
    let thumbnail = hit
        .thumbnail_url
        .filter(|url| !url.trim().is_empty())
        .unwrap_or_else(|| hit.image_url.clone());
    let title = hit
        .title
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| "Image".to_string());
    ImageItem::new(thumbnail, hit.image_url, title)
}
