//! Local model asset resolution.

use crate::error::{EngineError, Result};
use crate::model::ModelCategory;
use std::path::PathBuf;

/// Resolves a model category to a file on the local filesystem.
pub trait ModelProvider: Send + Sync {
    fn resolve_local_path(&self, category: ModelCategory) -> Result<PathBuf>;
}

/// Looks for a previously downloaded asset first, then for a bundled one.
#[derive(Debug, Clone)]
pub struct LocalModelProvider {
    download_dir: PathBuf,
    bundle_dir: PathBuf,
}

impl LocalModelProvider {
    pub fn new(download_dir: impl Into<PathBuf>, bundle_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            bundle_dir: bundle_dir.into(),
        }
    }

    /// Where an external downloader should place the asset.
    pub fn download_destination(&self, category: ModelCategory) -> PathBuf {
        self.download_dir.join(category.file_name())
    }
}

impl ModelProvider for LocalModelProvider {
    fn resolve_local_path(&self, category: ModelCategory) -> Result<PathBuf> {
        let downloaded = self.download_destination(category);
        if downloaded.is_file() {
            return Ok(downloaded);
        }

        let bundled = self.bundle_dir.join(category.file_name());
        if bundled.is_file() {
            return Ok(bundled);
        }

        Err(EngineError::ModelFileNotFound(category.file_name()))
    }
}
