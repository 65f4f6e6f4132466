use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::{write_atomic, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub path: PathBuf,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw payloads, laid out as
/// `<root>/<yyyymmdd>/<kind>/<sha256>.<ext>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, day: DateTime<Utc>, kind: &str, content_hash: &str, ext: &str) -> PathBuf {
        let ext = match ext.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        self.root
            .join(day.format("%Y%m%d").to_string())
            .join(kind)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        kind: &str,
        ext: &str,
        bytes: &[u8],
    ) -> Result<StoredArtifact, StorageError> {
        let content_hash = hex::encode(Sha256::digest(bytes));
        let path = self.path_for(fetched_at, kind, &content_hash, ext);
        let deduplicated = fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        if !deduplicated {
            write_atomic(&path, bytes).await?;
        }
        Ok(StoredArtifact {
            content_hash,
            path,
            deduplicated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[tokio::test]
    async fn repeated_detail_payloads_are_written_once_per_day() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let morning = Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2026, 10, 1, 21, 30, 0).unwrap();
        let payload = br#"{"data":{"threaded_conversation_with_injections_v2":{"instructions":[]}}}"#;

        let first = store
            .store_bytes(morning, "tweet-detail", "json", payload)
            .await
            .expect("first");
        let again = store
            .store_bytes(evening, "tweet-detail", ".json", payload)
            .await
            .expect("again");

        assert!(!first.deduplicated);
        assert!(again.deduplicated);
        assert_eq!(first.path, again.path);
        assert_eq!(
            first.path,
            dir.path()
                .join("20261001")
                .join("tweet-detail")
                .join(format!("{}.json", hex::encode(Sha256::digest(payload))))
        );
        assert_eq!(std::fs::read(&first.path).expect("read"), payload);
    }

    #[tokio::test]
    async fn a_new_day_starts_a_new_directory() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let day_one = Utc.with_ymd_and_hms(2026, 10, 1, 23, 59, 0).unwrap();
        let day_two = Utc.with_ymd_and_hms(2026, 10, 2, 0, 1, 0).unwrap();

        let a = store.store_bytes(day_one, "tweet-detail", "", b"{}").await.expect("a");
        let b = store.store_bytes(day_two, "tweet-detail", "", b"{}").await.expect("b");

        assert!(!b.deduplicated);
        assert_eq!(a.content_hash, b.content_hash);
        assert!(a.path.starts_with(dir.path().join("20261001")));
        assert!(b.path.to_string_lossy().ends_with(".bin"));
    }
}
