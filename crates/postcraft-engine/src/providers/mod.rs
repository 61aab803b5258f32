//! Concrete capability backends.

pub mod blob;
pub mod dryrun;
pub mod fetch;
pub mod gemini;
pub mod search;

use anyhow::{bail, Context, Result};
use reqwest::Response as HttpResponse;
use serde_json::Value;

use crate::truncate_text;

pub use blob::LocalBlobStore;
pub use dryrun::{DryrunImage, DryrunSearch, DryrunText, DryrunVideo};
pub use fetch::HttpImageFetcher;
pub use gemini::{GeminiClient, GeminiImage, GeminiText, GeminiVideo};
pub use search::HttpSearch;

pub(crate) async fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .await
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

pub(crate) fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| reqwest_err.is_timeout() || reqwest_err.is_connect())
            .unwrap_or(false)
    })
}

/// Guesses an image MIME type from magic bytes, defaulting to JPEG.
pub(crate) fn sniff_image_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG") {
        return "image/png";
    }
    if bytes.len() > 12 && &bytes[8..12] == b"WEBP" {
        return "image/webp";
    }
    if bytes.starts_with(b"GIF8") {
        return "image/gif";
    }
    "image/jpeg"
}
