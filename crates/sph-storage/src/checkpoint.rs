use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::{write_json_atomic, StorageError};

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointDocument {
    #[serde(default)]
    seen_ids: Vec<String>,
}

/// Durable set of post ids already harvested, used to dedupe resumed runs.
///
/// The whole set is rewritten on every [`Checkpoint::add_seen`]; ids are never
/// removed once added.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
    seen: BTreeSet<String>,
}

impl Checkpoint {
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let seen = match fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<CheckpointDocument>(&text) {
                Ok(doc) => doc.seen_ids.into_iter().filter(|id| !id.is_empty()).collect(),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "checkpoint corrupt; starting from an empty set");
                    BTreeSet::new()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no checkpoint yet");
                BTreeSet::new()
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "checkpoint unreadable; starting from an empty set");
                BTreeSet::new()
            }
        };
        Self { path, seen }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn seen(&self) -> &BTreeSet<String> {
        &self.seen
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub async fn add_seen<I, S>(&mut self, ids: I) -> Result<usize, StorageError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0usize;
        for id in ids {
            let id = id.into();
            if !id.is_empty() && self.seen.insert(id) {
                added += 1;
            }
        }

        let doc = CheckpointDocument {
            seen_ids: self.seen.iter().cloned().collect(),
        };
        write_json_atomic(&self.path, &doc).await?;
        Ok(added)
    }
}
