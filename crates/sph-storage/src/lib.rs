mod artifact;
mod checkpoint;
mod fetch;

pub use artifact::{ArtifactStore, StoredArtifact};
pub use checkpoint::Checkpoint;
pub use fetch::{BackoffPolicy, FetchError, FetchedBody, FetcherConfig, HttpFetcher};

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sph-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state document is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write `bytes` to a hidden sibling of `path`, then rename it into place.
///
/// Parent directories are created as needed. On a failed rename the sibling
/// is removed and `path` keeps its previous contents.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir).await.map_err(|e| StorageError::io(dir, e))?;

    let stem = path.file_name().and_then(|n| n.to_str()).unwrap_or("state");
    let staging = dir.join(format!(".{stem}.{}.tmp", Uuid::new_v4().simple()));

    let staged = async {
        let mut file = fs::File::create(&staging).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;
    if let Err(err) = staged {
        fs::remove_file(&staging).await.ok();
        return Err(StorageError::io(&staging, err));
    }

    fs::rename(&staging, path).await.map_err(|err| {
        std::fs::remove_file(&staging).ok();
        StorageError::io(path, err)
    })
}

pub async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    write_atomic(path, &serde_json::to_vec_pretty(value)?).await
}
