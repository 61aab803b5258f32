use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client as HttpClient;
use tracing::debug;

use super::sniff_image_mime;
use crate::capabilities::{decode_data_uri, FetchedImage, ImageFetcher};
use crate::truncate_text;

/// Downloads images over http(s) and decodes `data:` URIs in place.
#[derive(Clone, Default)]
pub struct HttpImageFetcher {
    http: HttpClient,
}

impl HttpImageFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedImage> {
        let url = url.trim();
        if url.starts_with("data:") {
            let (mime_type, bytes) = decode_data_uri(url)?;
            return Ok(FetchedImage { bytes, mime_type });
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("unsupported image URL '{}'", truncate_text(url, 80));
        }

        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("image download failed ({})", truncate_text(url, 120)))?;
        let status = response.status();
        if !status.is_success() {
            bail!("image download failed: HTTP {}", status.as_u16());
        }
        let header_mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .filter(|value| value.starts_with("image/"));
        let bytes = response
            .bytes()
            .await
            .context("image body read failed")?
            .to_vec();
        if bytes.is_empty() {
            bail!("image download returned an empty body");
        }
        let mime_type = header_mime.unwrap_or_else(|| sniff_image_mime(&bytes).to_string());
        debug!(url, bytes = bytes.len(), mime = %mime_type, "image fetched");
        Ok(FetchedImage { bytes, mime_type })
    }
}
