//! Filesystem [`ByteStore`]: one file per media id under a root directory.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::ByteStore;

#[derive(Debug, Clone)]
pub struct FsByteStore {
    root: PathBuf,
}

impl FsByteStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            bail!("invalid media id for byte store: {id:?}");
        }
        Ok(self.root.join(id))
    }

    /// Store bytes for a media id. Uses atomic write (tmp + rename).
    pub async fn put_bytes(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let dest = self.path_for(id)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create media dir: {}", self.root.display()))?;

        let tmp_path = dest.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
        file.write_all(bytes).await.context("error writing media bytes")?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &dest)
            .await
            .context("failed to rename temp file")?;
        Ok(())
    }

    /// Remove the bytes for a media id. Missing files are not an error.
    pub async fn remove_bytes(&self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to remove media bytes"),
        }
    }
}

#[async_trait]
impl ByteStore for FsByteStore {
    async fn get_bytes(&self, id: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(id)?).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read bytes for media {id}")),
        }
    }
}
