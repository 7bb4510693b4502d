//! Public object storage backed by a local directory.
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use tracing::debug;

/// Objects are written under `root` and served from `<site>/storage/<key>`.
#[derive(Clone, Debug)]
pub struct ObjectStore {
    root: PathBuf,
    public_base: String,
}

impl ObjectStore {
    /// Open (and create if needed) the storage directory.
    pub async fn open(root: impl AsRef<Path>, site_url: &str) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create storage directory {}", root.display()))?;

        Ok(Self {
            root,
            public_base: format!("{}/storage", site_url.trim_end_matches('/')),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path, refusing anything that escapes the root.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            bail!("invalid object key `{key}`");
        }
        Ok(self.root.join(rel))
    }

    /// Write `bytes` at `key`, replacing any existing object, and return its public URL.
    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create object directory")?;
        }

        tokio::fs::write(&path, bytes)
            .await
            .context("failed to write object")?;

        debug!("stored object at {}", path.display());
        Ok(self.public_url(key))
    }

    #[cfg(test)]
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read object `{key}`"))
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, key)
    }
}
