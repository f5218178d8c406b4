//! Durable local storage for the results transfer: the row spool that anchors
//! crash recovery, the quarantine for rejected entries, and HTTP retry policy.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use swipe_core::{decode_rows, encode_rows, CodecError, Rejected, StagingRow};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod retry;

pub use retry::{
    build_client, classify_reqwest_error, classify_status, BackoffPolicy, HttpClientConfig,
    RetryDisposition,
};

pub const CRATE_NAME: &str = "swipe-storage";

/// Well-known spool file name; its presence at startup means a batch is pending.
pub const SPOOL_FILE_NAME: &str = "results.tsv";

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("{action} {}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("spool {} is corrupt: expected sha256 {expected}, found {actual}", path.display())]
    Corrupt {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("spool {} is not valid UTF-8", path.display())]
    NotUtf8 { path: PathBuf },
    #[error("decoding spool {}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: CodecError,
    },
    #[error("serializing quarantined entry")]
    Serialize(#[from] serde_json::Error),
}

impl SpoolError {
    /// A spool that cannot be trusted needs an operator, not another retry.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupt { .. } | Self::NotUtf8 { .. } | Self::Decode { .. }
        )
    }
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> SpoolError {
    let path = path.to_path_buf();
    move |source| SpoolError::Io { action, path, source }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write bytes through a synced temp file and an atomic rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SpoolError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(io_err("creating directory", parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err("opening temp file", &temp_path))?;
    file.write_all(bytes)
        .await
        .map_err(io_err("writing temp file", &temp_path))?;
    file.flush()
        .await
        .map_err(io_err("flushing temp file", &temp_path))?;
    file.sync_all()
        .await
        .map_err(io_err("syncing temp file", &temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(SpoolError::Io {
            action: "renaming temp file onto",
            path: path.to_path_buf(),
            source: err,
        });
    }
    Ok(())
}

async fn remove_if_present(path: &Path) -> Result<bool, SpoolError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(SpoolError::Io {
            action: "removing",
            path: path.to_path_buf(),
            source: err,
        }),
    }
}

/// Location and digest of a spooled batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolHandle {
    pub path: PathBuf,
    pub rows: usize,
    /// `None` when the digest sidecar is missing; the spool is then read unverified.
    pub sha256: Option<String>,
}

/// Local checkpoint of normalized rows, written before any database work.
///
/// The digest sidecar is written first and removed last, so a data file
/// without a sidecar only appears if someone removed it by hand.
#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self) -> PathBuf {
        self.dir.join(SPOOL_FILE_NAME)
    }

    fn digest_path(&self) -> PathBuf {
        self.dir.join(format!("{SPOOL_FILE_NAME}.sha256"))
    }

    pub async fn write(&self, rows: &[StagingRow]) -> Result<SpoolHandle, SpoolError> {
        let text = encode_rows(rows);
        let digest = sha256_hex(text.as_bytes());
        let path = self.file_path();

        write_atomic(&self.digest_path(), digest.as_bytes()).await?;
        write_atomic(&path, text.as_bytes()).await?;
        debug!(path = %path.display(), rows = rows.len(), sha256 = %digest, "spooled results batch");

        Ok(SpoolHandle {
            path,
            rows: rows.len(),
            sha256: Some(digest),
        })
    }

    /// Find a batch left behind by an interrupted run.
    pub async fn detect(&self) -> Result<Option<SpoolHandle>, SpoolError> {
        let path = self.file_path();
        let digest_path = self.digest_path();

        let exists = fs::try_exists(&path)
            .await
            .map_err(io_err("checking spool", &path))?;
        if !exists {
            if remove_if_present(&digest_path).await? {
                debug!(path = %digest_path.display(), "removed stale spool digest");
            }
            return Ok(None);
        }

        let text = fs::read_to_string(&path)
            .await
            .map_err(io_err("reading spool", &path))?;
        let rows = text.lines().filter(|line| !line.is_empty()).count();

        let sha256 = match fs::read_to_string(&digest_path).await {
            Ok(digest) => Some(digest.trim().to_string()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "spool digest missing; replaying unverified");
                None
            }
            Err(err) => return Err(io_err("reading spool digest", &digest_path)(err)),
        };

        Ok(Some(SpoolHandle { path, rows, sha256 }))
    }

    pub async fn read(&self, handle: &SpoolHandle) -> Result<Vec<StagingRow>, SpoolError> {
        let bytes = fs::read(&handle.path)
            .await
            .map_err(io_err("reading spool", &handle.path))?;

        if let Some(expected) = &handle.sha256 {
            let actual = sha256_hex(&bytes);
            if &actual != expected {
                return Err(SpoolError::Corrupt {
                    path: handle.path.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let text = std::str::from_utf8(&bytes).map_err(|_| SpoolError::NotUtf8 {
            path: handle.path.clone(),
        })?;
        decode_rows(text).map_err(|source| SpoolError::Decode {
            path: handle.path.clone(),
            source,
        })
    }

    pub async fn clear(&self, handle: &SpoolHandle) -> Result<(), SpoolError> {
        remove_if_present(&handle.path).await?;
        remove_if_present(&self.digest_path()).await?;
        debug!(path = %handle.path.display(), "cleared spool");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct QuarantinedEntry {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed store for entries the normalizer could not use.
/// The same rejected entry seen again maps to the same file.
#[derive(Debug, Clone)]
pub struct QuarantineStore {
    root: PathBuf,
}

impl QuarantineStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_relative_path(content_hash: &str) -> PathBuf {
        let shard = content_hash.get(..2).unwrap_or("00");
        PathBuf::from(shard).join(format!("{content_hash}.json"))
    }

    pub async fn store(&self, rejected: &Rejected) -> Result<QuarantinedEntry, SpoolError> {
        let bytes = serde_json::to_vec_pretty(rejected)?;
        let content_hash = sha256_hex(&bytes);
        let relative_path = Self::entry_relative_path(&content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .map_err(io_err("checking quarantine entry", &absolute_path))?;
        if !deduplicated {
            write_atomic(&absolute_path, &bytes).await?;
            warn!(
                path = %rejected.path,
                file = %absolute_path.display(),
                reason = %rejected.reason,
                "quarantined rejected results entry"
            );
        }

        Ok(QuarantinedEntry {
            content_hash,
            relative_path,
            absolute_path,
            deduplicated,
        })
    }
}
