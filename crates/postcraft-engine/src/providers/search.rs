use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use tracing::debug;

use super::response_json_or_error;
use crate::capabilities::{ImageHit, ImageSearch, WebSearch, WebSearchResponse};

/// JSON search backend: `POST {base}/web {"queries": [...]}` and
/// `GET {base}/images?q=&max_results=`.
#[derive(Clone)]
pub struct HttpSearch {
    api_base: String,
    http: HttpClient,
    timeout: Duration,
}

impl HttpSearch {
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
            timeout,
        }
    }
}

/// Image results come back either as a bare list or under `results`/`images`.
fn decode_image_hits(payload: Value) -> Vec<ImageHit> {
    let rows = match payload {
        Value::Array(rows) => rows,
        Value::Object(mut map) => match map.remove("results").or_else(|| map.remove("images")) {
            Some(Value::Array(rows)) => rows,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    rows.into_iter()
        .filter_map(|row| serde_json::from_value::<ImageHit>(row).ok())
        .filter(|hit| !hit.image_url.trim().is_empty())
        .collect()
}

#[async_trait]
impl WebSearch for HttpSearch {
    async fn search(&self, queries: &[String]) -> Result<WebSearchResponse> {
        let endpoint = format!("{}/web", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .timeout(self.timeout)
            .json(&json!({ "queries": queries }))
            .send()
            .await
            .with_context(|| format!("web search request failed ({endpoint})"))?;
        let payload = response_json_or_error("web search", response).await?;
        let decoded = WebSearchResponse::from_value(&payload);
        debug!(
            queries = queries.len(),
            recognised = !matches!(decoded, WebSearchResponse::Unrecognised),
            "web search decoded"
        );
        Ok(decoded)
    }
}

#[async_trait]
impl ImageSearch for HttpSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<ImageHit>> {
        let endpoint = format!("{}/images", self.api_base);
        let max_results = max_results.to_string();
        let response = self
            .http
            .get(&endpoint)
            .timeout(self.timeout)
            .query(&[("q", query), ("max_results", max_results.as_str())])
            .send()
            .await
            .with_context(|| format!("image search request failed ({endpoint})"))?;
        let payload = response_json_or_error("image search", response).await?;
        Ok(decode_image_hits(payload))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::decode_image_hits;

    #[test]
    fn image_payload_shapes_decode() {
        let bare = decode_image_hits(json!([
            {"image_url": "https://a/1.png", "title": "one"},
            {"title": "missing url"},
            "junk"
        ]));
        assert_eq!(bare.len(), 1);
        assert_eq!(bare[0].title.as_deref(), Some("one"));

        let wrapped = decode_image_hits(json!({"results": [{"image_url": "https://a/2.png"}]}));
        assert_eq!(wrapped[0].image_url, "https://a/2.png");
        assert!(decode_image_hits(json!({"error": "quota"})).is_empty());
    }
}
