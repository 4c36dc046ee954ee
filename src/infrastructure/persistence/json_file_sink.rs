//! JSON catalog file: `{ "stats": {...}, "products": [...] }`.
//!
//! Each flush rewrites the whole file through a sibling temp file and a
//! rename, so readers never observe a half-written catalog.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::{PersistenceSink, SinkError};
use crate::domain::{CatalogSnapshot, CatalogStats, CatalogView, ProductRecord};

#[derive(Serialize)]
struct SnapshotFile<'a> {
    stats: &'a CatalogStats,
    products: &'a [ProductRecord],
}

#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.as_os_str().to_owned();
        temp.push(".tmp");
        PathBuf::from(temp)
    }

    /// Reads a previously written catalog. A missing file is `Ok(None)`.
    pub async fn load(&self) -> Result<Option<CatalogSnapshot>, SinkError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SinkError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SinkError + '_ {
        move |source| SinkError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl PersistenceSink for JsonFileSink {
    fn name(&self) -> &str {
        "json"
    }

    async fn persist(&self, view: &CatalogView) -> Result<(), SinkError> {
        let bytes = serde_json::to_vec_pretty(&SnapshotFile {
            stats: &view.stats,
            products: &view.products,
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(Self::io_error(parent))?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, &bytes).await.map_err(Self::io_error(&temp))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(Self::io_error(&self.path))?;

        debug!(
            path = %self.path.display(),
            products = view.products.len(),
            bytes = bytes.len(),
            "💾 Catalog file written"
        );
        Ok(())
    }
}
