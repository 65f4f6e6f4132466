use std::collections::VecDeque;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sph_storage::{write_json_atomic, StorageError};
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryItem {
    pub post_id: String,
    pub attempts: u32,
}

impl RetryItem {
    pub fn first_failure(post_id: impl Into<String>) -> Self {
        Self {
            post_id: post_id.into(),
            attempts: 1,
        }
    }

    pub fn deferred(post_id: impl Into<String>) -> Self {
        Self {
            post_id: post_id.into(),
            attempts: 0,
        }
    }

    pub fn bumped(&self) -> Self {
        Self {
            post_id: self.post_id.clone(),
            attempts: self.attempts.saturating_add(1),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RetryQueueDocument {
    #[serde(default)]
    items: Vec<RetryItem>,
}

/// FIFO of retry items. Items with more attempts than `max_retry` are refused
/// at admission, so everything held satisfies `attempts <= max_retry`.
#[derive(Debug, Clone)]
pub struct RetryQueue {
    items: VecDeque<RetryItem>,
    max_retry: u32,
}

impl RetryQueue {
    pub fn new(max_retry: u32) -> Self {
        Self {
            items: VecDeque::new(),
            max_retry,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, post_id: &str) -> bool {
        self.items.iter().any(|i| i.post_id == post_id)
    }

    pub fn items(&self) -> impl Iterator<Item = &RetryItem> {
        self.items.iter()
    }

    pub fn push(&mut self, item: RetryItem) -> bool {
        if item.attempts > self.max_retry {
            return false;
        }
        if self.contains(&item.post_id) {
            return false;
        }
        self.items.push_back(item);
        true
    }

    pub fn push_front(&mut self, item: RetryItem) {
        if item.attempts <= self.max_retry && !self.contains(&item.post_id) {
            self.items.push_front(item);
        }
    }

    pub fn pop(&mut self) -> Option<RetryItem> {
        self.items.pop_front()
    }

    pub async fn load(path: &Path, max_retry: u32) -> Self {
        let mut queue = Self::new(max_retry);
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return queue,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "retry queue unreadable; starting empty");
                return queue;
            }
        };
        match serde_json::from_str::<RetryQueueDocument>(&text) {
            Ok(doc) => {
                let stored = doc.items.len();
                for item in doc.items {
                    queue.push(item);
                }
                if queue.len() < stored {
                    debug!(dropped = stored - queue.len(), "retry items over the current bound discarded");
                }
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "retry queue corrupt; starting empty");
            }
        }
        queue
    }

    pub async fn save(&self, path: &Path) -> Result<(), StorageError> {
        let doc = RetryQueueDocument {
            items: self.items.iter().cloned().collect(),
        };
        write_json_atomic(path, &doc).await
    }
}
