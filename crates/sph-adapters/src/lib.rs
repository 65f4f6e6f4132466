pub mod cards;
pub mod detail;
pub mod enrichment;
pub mod fixture;
pub mod rendered;

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sph_core::{RawPost, Target};
use sph_storage::FetchError;
use thiserror::Error;

pub use enrichment::{EnrichError, EnrichmentClient, FailureKind, GraphqlEnrichmentClient, TweetDetail};
pub use fixture::FixtureSource;
pub use rendered::RenderedPageSource;

pub const CRATE_NAME: &str = "sph-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub scrolls: u32,
}

impl PageCursor {
    pub fn next(self) -> Self {
        Self {
            scrolls: self.scrolls.saturating_add(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestPage {
    pub records: Vec<RawPost>,
    pub cursor: PageCursor,
    pub done: bool,
}

#[async_trait]
pub trait HarvestSource: Send + Sync {
    fn name(&self) -> &str;

    async fn produce(
        &self,
        target: &Target,
        cursor: PageCursor,
        seen: &HashSet<String>,
    ) -> Result<HarvestPage, AdapterError>;
}

pub fn dedupe_against(records: Vec<RawPost>, seen: &HashSet<String>) -> Vec<RawPost> {
    let mut batch_ids = BTreeSet::new();
    records
        .into_iter()
        .filter(|r| !r.post_id.is_empty())
        .filter(|r| !seen.contains(&r.post_id))
        .filter(|r| batch_ids.insert(r.post_id.clone()))
        .collect()
}

pub fn attach_target_context(records: &mut [RawPost], target: &Target, site_base: &str) {
    let Target::User { username } = target else {
        return;
    };
    let base = site_base.trim_end_matches('/');
    for record in records {
        record.username = Some(username.clone());
        if record.link.is_none() {
            record.link = Some(format!("{base}/{username}/status/{}", record.post_id));
        }
    }
}
