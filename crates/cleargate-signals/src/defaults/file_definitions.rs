//! File-system backed definition provider.
//!
//! Layout: a single JSON document
//! ```text
//! { "signals": [...], "doors": [...], "triggers": [...] }
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::DefinitionError;
use crate::traits::DefinitionProvider;
use crate::types::DefinitionBundle;

/// Loads a [`DefinitionBundle`] from a JSON file on every [`load()`](DefinitionProvider::load).
///
/// Writes use a temp-file-then-rename pattern so a reader never sees a
/// partially written bundle.
pub struct FileDefinitionProvider {
    path: PathBuf,
}

impl FileDefinitionProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the bundle on disk.
    pub fn write(&self, bundle: &DefinitionBundle) -> Result<(), DefinitionError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DefinitionError::Provider {
                message: format!("failed to create {}: {e}", parent.display()),
            })?;
        }
        let data = serde_json::to_vec_pretty(bundle).map_err(|e| DefinitionError::Provider {
            message: format!("failed to serialize definitions: {e}"),
        })?;
        atomic_write(&self.path, &data)
    }
}

/// Atomic write: serialize to temp file, then rename over the target.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), DefinitionError> {
    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, data).map_err(|e| DefinitionError::Provider {
        message: format!("failed to write temp file: {e}"),
    })?;
    std::fs::rename(&temp_path, path).map_err(|e| DefinitionError::Provider {
        message: format!("failed to rename temp file: {e}"),
    })
}

#[async_trait]
impl DefinitionProvider for FileDefinitionProvider {
    async fn load(&self) -> Result<DefinitionBundle, DefinitionError> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|e| DefinitionError::Provider {
                message: format!("failed to read {}: {e}", self.path.display()),
            })?;
        serde_json::from_slice(&data).map_err(|e| DefinitionError::Provider {
            message: format!("invalid definitions in {}: {e}", self.path.display()),
        })
    }
}
