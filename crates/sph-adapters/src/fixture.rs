use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use sph_core::Target;
use tokio::fs;

use crate::cards::parse_cards;
use crate::{attach_target_context, dedupe_against, AdapterError, HarvestPage, HarvestSource, PageCursor};

pub struct FixtureSource {
    dir: PathBuf,
    site_base: String,
}

impl FixtureSource {
    pub fn new(dir: impl Into<PathBuf>, site_base: &str) -> Self {
        Self {
            dir: dir.into(),
            site_base: site_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn snapshot_paths(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("reading {}", self.dir.display()))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.dir.display()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "html") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

#[async_trait]
impl HarvestSource for FixtureSource {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn produce(
        &self,
        target: &Target,
        cursor: PageCursor,
        seen: &HashSet<String>,
    ) -> Result<HarvestPage, AdapterError> {
        let paths = self.snapshot_paths().await?;
        let Some(last) = paths.len().checked_sub(1) else {
            return Ok(HarvestPage {
                records: Vec::new(),
                cursor,
                done: true,
            });
        };
        let path = &paths[(cursor.scrolls as usize).min(last)];
        let html = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))?;

        let mut cards = parse_cards(&html, target.language(), &self.site_base)?;
        attach_target_context(&mut cards, target, &self.site_base);
        Ok(HarvestPage {
            records: dedupe_against(cards, seen),
            cursor: cursor.next(),
            done: false,
        })
    }
}
