//! Snapshot file storage for Casa: defensive loading, atomic writes and CI counters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use casa_core::{Listing, RawListing};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "casa-storage";

pub fn snapshot_file_name(platform: &str) -> String {
    format!("{platform}Results.json")
}

/// Rows decoded from one snapshot file.
#[derive(Debug, Clone, Default)]
pub struct LoadedSnapshot {
    pub rows: Vec<RawListing>,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub path: PathBuf,
    pub listings: usize,
    pub byte_size: usize,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("creating snapshot directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing snapshot for {platform}: {source}")]
    Serialize {
        platform: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing temp snapshot {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("atomically renaming {} -> {}: {source}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One directory of `<platform>Results.json` files.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, platform: &str) -> PathBuf {
        self.root.join(snapshot_file_name(platform))
    }

    pub async fn load(&self, platform: &str) -> LoadedSnapshot {
        let path = self.path_for(platform);
        decode_rows(&path, load_json_array(&path).await)
    }

    /// Serialize and replace the platform's snapshot via temp file + rename.
    /// A failed write leaves the previous snapshot in place.
    pub async fn write_snapshot(
        &self,
        platform: &str,
        listings: &[Listing],
    ) -> Result<StoredSnapshot, StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StoreError::CreateDir {
                path: self.root.clone(),
                source,
            })?;

        let bytes = serde_json::to_vec_pretty(listings).map_err(|source| StoreError::Serialize {
            platform: platform.to_string(),
            source,
        })?;

        let final_path = self.path_for(platform);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", snapshot_file_name(platform), Uuid::new_v4()));

        if let Err(source) = write_new_file(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Write {
                path: temp_path,
                source,
            });
        }

        if let Err(source) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Rename {
                from: temp_path,
                to: final_path,
                source,
            });
        }

        Ok(StoredSnapshot {
            path: final_path,
            listings: listings.len(),
            byte_size: bytes.len(),
        })
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Reads a JSON array file. Every failure degrades to an empty vector.
pub async fn load_json_array(path: &Path) -> Vec<JsonValue> {
    match fs::try_exists(path).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(path = %path.display(), "snapshot file not found");
            return Vec::new();
        }
        Err(err) => {
            error!(path = %path.display(), error = %err, "checking snapshot file failed");
            return Vec::new();
        }
    }

    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) => {
            error!(path = %path.display(), error = %err, "reading snapshot file failed");
            return Vec::new();
        }
    };

    if text.trim().is_empty() {
        warn!(path = %path.display(), "snapshot file is empty");
        return Vec::new();
    }

    match serde_json::from_str::<JsonValue>(&text) {
        Ok(JsonValue::Array(rows)) => rows,
        Ok(_) => {
            warn!(path = %path.display(), "snapshot content is not an array");
            Vec::new()
        }
        Err(err) => {
            error!(path = %path.display(), error = %err, "parsing snapshot file failed");
            Vec::new()
        }
    }
}

/// Typed decode per row. Only a row that is not a JSON object is logged and skipped;
/// a badly shaped field inside an object reads as absent.
pub fn decode_rows(path: &Path, rows: Vec<JsonValue>) -> LoadedSnapshot {
    let mut loaded = LoadedSnapshot::default();
    for (index, row) in rows.into_iter().enumerate() {
        match serde_json::from_value::<RawListing>(row) {
            Ok(raw) => loaded.rows.push(raw),
            Err(err) => {
                warn!(path = %path.display(), index, error = %err, "skipping malformed listing row");
                loaded.skipped += 1;
            }
        }
    }
    loaded
}

/// Collapses duplicate ids: the last record wins, keeping the first one's position.
pub fn dedup_by_id(listings: Vec<Listing>) -> Vec<Listing> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Listing> = Vec::with_capacity(listings.len());
    for listing in listings {
        match positions.get(&listing.id) {
            Some(&at) => out[at] = listing,
            None => {
                positions.insert(listing.id.clone(), out.len());
                out.push(listing);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformCounters {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub total: usize,
}

impl PlatformCounters {
    pub fn env_lines(&self, platform: &str) -> String {
        let prefix = platform.to_ascii_uppercase();
        format!(
            "{prefix}_ADDED={}\n{prefix}_UPDATED={}\n{prefix}_REMOVED={}\n{prefix}_TOTAL={}\n",
            self.added, self.updated, self.removed, self.total
        )
    }
}

/// Append-only `KEY=value` export consumed by the CI pipeline.
#[derive(Debug, Clone)]
pub struct CiEnvExporter {
    path: PathBuf,
}

impl CiEnvExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, platform: &str, counters: PlatformCounters) -> anyhow::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening CI env file {}", self.path.display()))?;
        file.write_all(counters.env_lines(platform).as_bytes())
            .await
            .with_context(|| format!("appending to CI env file {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing CI env file {}", self.path.display()))?;
        Ok(())
    }
}
