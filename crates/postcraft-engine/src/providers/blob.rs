use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::capabilities::BlobStore;

/// Blob store backed by a local directory. URLs are `{public_base}/{key}`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_base: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        let root = root.into();
        let public_base = public_base.into().trim_end_matches('/').to_string();
        let public_base = if public_base.is_empty() {
            format!("file://{}", root.display())
        } else {
            public_base
        };
        Self { root, public_base }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|part| !matches!(part, Component::Normal(_)));
        if key.trim().is_empty() || escapes {
            bail!("invalid blob key '{key}'");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("failed writing {}", path.display()))?;
        debug!(key, bytes = bytes.len(), content_type, "blob stored");
        Ok(format!("{}/{}", self.public_base, key.trim_start_matches('/')))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed reading {}", path.display()))
    }
}
