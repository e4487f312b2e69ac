//! `manifest.json` persistence.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use super::{Manifest, ManifestEntry, ManifestStats};

/// File name inside the case directory.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Current on-disk format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Errors reading or writing a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// File could not be read or written.
    #[error("manifest I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File is not a valid manifest.
    #[error("invalid manifest at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Serialization failed.
    #[error("manifest serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Written by a newer version of this tool.
    #[error("manifest at {path} has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
}

impl ManifestError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Serialized form. `missing` and `stats` are written for readers but
/// recomputed on load.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestDocument {
    version: u32,
    case_id: String,
    source_url: String,
    required_categories: BTreeSet<String>,
    entries: Vec<ManifestEntry>,
    #[serde(default)]
    missing: Vec<String>,
    #[serde(default)]
    stats: ManifestStats,
    created_at: u64,
    updated_at: u64,
}

impl Manifest {
    /// Path of the manifest inside `case_dir`.
    #[must_use]
    pub fn path_in(case_dir: &Path) -> PathBuf {
        case_dir.join(MANIFEST_FILE_NAME)
    }

    /// Writes `manifest.json` into `case_dir` via a temp file and rename.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] on serialization or I/O failure.
    #[instrument(skip(self), fields(case_id = %self.case_id, dir = %case_dir.display()))]
    pub async fn persist(&self, case_dir: &Path) -> Result<PathBuf, ManifestError> {
        let document = ManifestDocument {
            version: MANIFEST_VERSION,
            case_id: self.case_id.clone(),
            source_url: self.source_url.clone(),
            required_categories: self.required_categories.clone(),
            entries: self.entries.clone(),
            missing: self.missing(),
            stats: self.stats.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        };
        let json = serde_json::to_vec_pretty(&document)?;

        tokio::fs::create_dir_all(case_dir)
            .await
            .map_err(|e| ManifestError::io(case_dir, e))?;

        let path = Self::path_in(case_dir);
        let tmp = case_dir.join(format!("{MANIFEST_FILE_NAME}.tmp"));
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| ManifestError::io(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ManifestError::io(&path, e));
        }

        debug!(path = %path.display(), entries = self.entries.len(), "manifest saved");
        Ok(path)
    }

    /// Loads `manifest.json` from `case_dir`, or `None` if there is none.
    ///
    /// Stats and the missing set are recomputed from the entries.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if the file exists but cannot be read or
    /// parsed.
    pub async fn load(case_dir: &Path) -> Result<Option<Manifest>, ManifestError> {
        let path = Self::path_in(case_dir);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ManifestError::io(path, e)),
        };
        let document: ManifestDocument =
            serde_json::from_slice(&bytes).map_err(|source| ManifestError::Parse {
                path: path.clone(),
                source,
            })?;
        if document.version > MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion {
                path,
                version: document.version,
            });
        }

        let mut manifest = Manifest {
            case_id: document.case_id,
            source_url: document.source_url,
            required_categories: document.required_categories,
            created_at: document.created_at,
            updated_at: document.updated_at,
            entries: document.entries,
            stats: ManifestStats::default(),
        };
        let updated_at = manifest.updated_at;
        manifest.recompute_stats();
        manifest.updated_at = updated_at;
        Ok(Some(manifest))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        assert!(Manifest::load(dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_then_load_recomputes_stats() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::new("c1", "https://a.example/c1", ["AP"]);
        let path = manifest.persist(dir.path()).await.unwrap();
        assert!(path.ends_with(MANIFEST_FILE_NAME));
        assert!(!dir.path().join("manifest.json.tmp").exists());

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["missing"], serde_json::json!(["AP"]));

        let loaded = Manifest::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.case_id, "c1");
        assert_eq!(loaded.missing(), vec!["AP".to_string()]);
    }

    #[tokio::test]
    async fn test_load_ignores_stored_stats() {
        let dir = TempDir::new().unwrap();
        let json = serde_json::json!({
            "version": 1,
            "case_id": "c1",
            "source_url": "u",
            "required_categories": ["AP"],
            "entries": [],
            "missing": [],
            "stats": {"succeeded": 9, "failed": 0, "link_only": 0, "total_bytes": 1,
                      "categories_present": ["AP"]},
            "created_at": 1,
            "updated_at": 2
        });
        std::fs::write(dir.path().join(MANIFEST_FILE_NAME), json.to_string()).unwrap();

        let loaded = Manifest::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.stats().succeeded, 0);
        assert_eq!(loaded.missing(), vec!["AP".to_string()]);
        assert_eq!(loaded.updated_at, 2);
    }

    #[tokio::test]
    async fn test_load_rejects_garbage_and_future_versions() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE_NAME), b"{not json").unwrap();
        assert!(matches!(
            Manifest::load(dir.path()).await,
            Err(ManifestError::Parse { .. })
        ));

        let future = serde_json::json!({
            "version": 99, "case_id": "c", "source_url": "u",
            "required_categories": [], "entries": [],
            "created_at": 0, "updated_at": 0
        });
        std::fs::write(dir.path().join(MANIFEST_FILE_NAME), future.to_string()).unwrap();
        assert!(matches!(
            Manifest::load(dir.path()).await,
            Err(ManifestError::UnsupportedVersion { version: 99, .. })
        ));
    }
}
