//! Versioned JSON storage
//!
//! Catalogs persist as JSON files in a `.storage/` directory under the
//! host-provided data directory. Each file wraps its payload in a versioned
//! envelope so future layout changes can be detected, and writes go through
//! a temp file plus rename so a crash never leaves a half-written catalog.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// Write attempts before a storage error is surfaced to the caller.
const MAX_WRITE_ATTEMPTS: u32 = 4;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("catalog {key} has major version {found}, expected {expected}")]
    VersionMismatch {
        key: String,
        expected: u32,
        found: u32,
    },
}

/// On-disk envelope around a catalog payload.
///
/// JSON format:
/// ```json
/// {
///   "version": 1,
///   "minor_version": 1,
///   "key": "automation.schedules",
///   "data": { ... }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    /// Major version - breaking changes
    pub version: u32,
    /// Minor version - additive changes within a major version
    pub minor_version: u32,
    /// Storage key (file identifier)
    pub key: String,
    /// The actual data
    pub data: T,
}

/// Types persisted as a whole file.
pub trait Storable: Serialize + DeserializeOwned {
    /// Storage key for this type
    const KEY: &'static str;
    /// Current major version
    const VERSION: u32;
    /// Current minor version
    const MINOR_VERSION: u32;
}

/// Exponential backoff for failed writes: 100ms, 200ms, 400ms, capped at
/// 800ms.
fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(2_u64.pow(attempt.min(3)) * 100)
}

/// Manager for the `.storage/` directory.
#[derive(Debug, Clone)]
pub struct Storage {
    storage_dir: PathBuf,
}

impl Storage {
    /// # Arguments
    /// * `data_dir` - Host-provided data directory
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: data_dir.as_ref().join(".storage"),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }

    async fn ensure_dir(&self) -> StorageResult<()> {
        if !self.storage_dir.exists() {
            fs::create_dir_all(&self.storage_dir).await?;
            debug!("created storage directory {:?}", self.storage_dir);
        }
        Ok(())
    }

    /// Loads a catalog, or `None` if it was never written.
    pub async fn load<T>(&self) -> StorageResult<Option<T>>
    where
        T: Storable,
    {
        let path = self.file_path(T::KEY);

        if !path.exists() {
            debug!("Storage file not found: {}", T::KEY);
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;

        // check the envelope version before touching the payload, since a
        // different major version may not even parse
        #[derive(Deserialize)]
        struct VersionProbe {
            version: u32,
            minor_version: u32,
        }
        let probe: VersionProbe = serde_json::from_str(&content)?;

        if probe.version != T::VERSION {
            return Err(StorageError::VersionMismatch {
                key: T::KEY.to_string(),
                expected: T::VERSION,
                found: probe.version,
            });
        }
        if probe.minor_version < T::MINOR_VERSION {
            warn!(
                "Storage {} has older minor version ({} < {})",
                T::KEY,
                probe.minor_version,
                T::MINOR_VERSION
            );
        }

        let storage_file: StorageFile<T> = serde_json::from_str(&content)?;

        debug!(
            "loaded catalog {} (v{}.{})",
            T::KEY,
            probe.version,
            probe.minor_version
        );

        Ok(Some(storage_file.data))
    }

    /// Saves a catalog, retrying transient IO failures with bounded backoff.
    ///
    /// The write goes to a temp file first and is renamed into place, so a
    /// crash mid-write never leaves a truncated catalog behind.
    pub async fn save<T>(&self, data: &T) -> StorageResult<()>
    where
        T: Storable,
    {
        // serialization failures are not transient, fail them up front
        let storage_file = StorageFile {
            version: T::VERSION,
            minor_version: T::MINOR_VERSION,
            key: T::KEY.to_string(),
            data,
        };
        let content = serde_json::to_string_pretty(&storage_file)?;

        let mut attempt = 0;
        loop {
            match self.write_atomic(T::KEY, &content).await {
                Ok(()) => {
                    debug!(
                        "saved catalog {} (v{}.{})",
                        T::KEY,
                        T::VERSION,
                        T::MINOR_VERSION
                    );
                    return Ok(());
                }
                Err(err) if attempt + 1 < MAX_WRITE_ATTEMPTS => {
                    warn!(
                        key = T::KEY,
                        attempt,
                        error = %err,
                        "Storage write failed, retrying"
                    );
                    tokio::time::sleep(retry_delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn write_atomic(&self, key: &str, content: &str) -> std::io::Result<()> {
        if !self.storage_dir.exists() {
            fs::create_dir_all(&self.storage_dir).await?;
        }
        let path = self.file_path(key);
        let temp_path = self.file_path(&format!("{key}.tmp"));

        fs::write(&temp_path, content).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    /// Deletes a catalog file if present.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.file_path(key);
        if path.exists() {
            fs::remove_file(&path).await?;
            debug!("deleted catalog {}", key);
        }
        Ok(())
    }
}
