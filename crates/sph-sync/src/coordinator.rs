use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sph_adapters::{EnrichError, EnrichmentClient, FailureKind, HarvestSource, PageCursor, TweetDetail};
use sph_core::{PostRecord, RawPost, ReplyRecord, Target};
use sph_storage::{ArtifactStore, Checkpoint};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::HarvestConfig;
use crate::pool::{AccountHandle, AccountSnapshot, CredentialPool};
use crate::retry::{RetryItem, RetryQueue};
use crate::sink::{RecordSink, UpsertBatch};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub batch_size: usize,
    pub limit: usize,
    pub stagnation_limit: u32,
    pub backoff_secs: u64,
    pub cooldown: Duration,
    pub rotation_settle: Duration,
    pub auto_rotate: bool,
    pub max_retry: u32,
    pub checkpoint_path: PathBuf,
    pub retry_queue_path: PathBuf,
}

impl CoordinatorSettings {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            limit: config.limit,
            stagnation_limit: config.stagnation_limit,
            backoff_secs: config.backoff_secs,
            cooldown: Duration::from_secs(config.cooldown_secs),
            rotation_settle: Duration::from_secs(config.rotation_settle_secs),
            auto_rotate: config.auto_rotate,
            max_retry: config.max_retry,
            checkpoint_path: config.checkpoint_path(),
            retry_queue_path: config.retry_queue_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Active,
    Rotating,
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    Rotated,
    Unavailable,
    CooledDown,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CooldownCause {
    FullCycle,
    NoCredential,
}

/// Enriched rows not yet confirmed written to the sink.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    posts: Vec<PostRecord>,
    replies: Vec<ReplyRecord>,
}

impl PendingBuffer {
    pub fn posts(&self) -> &[PostRecord] {
        &self.posts
    }

    pub fn replies(&self) -> &[ReplyRecord] {
        &self.replies
    }

    pub fn len(&self) -> usize {
        self.posts.len() + self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty() && self.replies.is_empty()
    }

    fn holds_post(&self, post_id: &str) -> bool {
        self.posts.iter().any(|p| p.post_id == post_id)
    }

    fn holds_reply(&self, reply_id: &str) -> bool {
        self.replies.iter().any(|r| r.reply_id == reply_id)
    }

    fn settle_posts(&mut self, written: &[PostRecord]) {
        let ids: HashSet<&str> = written.iter().map(|p| p.post_id.as_str()).collect();
        self.posts.retain(|p| !ids.contains(p.post_id.as_str()));
    }

    fn settle_replies(&mut self, written: &[ReplyRecord]) {
        let ids: HashSet<&str> = written.iter().map(|r| r.reply_id.as_str()).collect();
        self.replies.retain(|r| !ids.contains(r.reply_id.as_str()));
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RunStats {
    pub collected: usize,
    pub batches: usize,
    pub raw_upserted: usize,
    pub enriched: usize,
    pub enriched_upserted: usize,
    pub replies_upserted: usize,
    pub transient_failures: usize,
    pub credential_failures: usize,
    pub rotations: usize,
    pub cooldowns: usize,
    pub retried_ok: usize,
    pub retry_dropped: usize,
    pub deferred: usize,
    pub sink_failures: usize,
    pub archived: usize,
    pub stagnated: bool,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub target: Option<String>,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: RunStats,
    pub retry_queue_len: usize,
    pub pending_len: usize,
    pub accounts: Vec<AccountSnapshot>,
}

enum EnrichAttempt {
    Enriched(TweetDetail),
    Failed(EnrichError),
    Halted,
}

pub struct Coordinator {
    settings: CoordinatorSettings,
    pool: CredentialPool,
    source: Arc<dyn HarvestSource>,
    client: Arc<dyn EnrichmentClient>,
    sink: Arc<dyn RecordSink>,
    archive: Option<ArtifactStore>,
    cancel: CancellationToken,
    state: CoordinatorState,
    current: Option<usize>,
    rotation_failures: usize,
    pending: PendingBuffer,
    retry: RetryQueue,
    // halted batch remainders, queued for a later run once this one finishes
    abandoned: Vec<String>,
    stats: RunStats,
}

impl Coordinator {
    pub fn new(
        settings: CoordinatorSettings,
        pool: CredentialPool,
        source: Arc<dyn HarvestSource>,
        client: Arc<dyn EnrichmentClient>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let retry = RetryQueue::new(settings.max_retry);
        Self {
            settings,
            pool,
            source,
            client,
            sink,
            archive: None,
            cancel: CancellationToken::new(),
            state: CoordinatorState::Active,
            current: None,
            rotation_failures: 0,
            pending: PendingBuffer::default(),
            retry,
            abandoned: Vec::new(),
            stats: RunStats::default(),
        }
    }

    pub fn with_archive(mut self, store: ArtifactStore) -> Self {
        self.archive = Some(store);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn rotation_failures(&self) -> usize {
        self.rotation_failures
    }

    pub fn pending(&self) -> &PendingBuffer {
        &self.pending
    }

    pub fn into_pool(self) -> CredentialPool {
        self.pool
    }

    pub async fn run(&mut self, target: &Target) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("harvest_run", %run_id, harvest_target = %target.label());
        async {
            info!(source = self.source.name(), accounts = self.pool.len(), "run started");
            self.load_retry_queue().await;
            let mut checkpoint = Checkpoint::load(&self.settings.checkpoint_path).await;
            self.harvest(target, &mut checkpoint).await;
            if !self.cancel.is_cancelled() {
                self.drain_retry_queue().await;
            }
            self.finish().await;
        }
        .instrument(span)
        .await;
        self.summary(run_id, Some(target.label()), started_at)
    }

    pub async fn run_retry_queue(&mut self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("retry_run", %run_id);
        async {
            self.load_retry_queue().await;
            self.drain_retry_queue().await;
            self.finish().await;
        }
        .instrument(span)
        .await;
        self.summary(run_id, None, started_at)
    }

    fn summary(&self, run_id: Uuid, target: Option<String>, started_at: DateTime<Utc>) -> RunSummary {
        RunSummary {
            run_id,
            target,
            source: self.source.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            stats: self.stats.clone(),
            retry_queue_len: self.retry.len(),
            pending_len: self.pending.len(),
            accounts: self.pool.snapshot(),
        }
    }

    async fn load_retry_queue(&mut self) {
        let stored = RetryQueue::load(&self.settings.retry_queue_path, self.settings.max_retry).await;
        if !stored.is_empty() {
            info!(items = stored.len(), "loaded persisted retry queue");
        }
        for item in stored.items() {
            self.retry.push(item.clone());
        }
    }

    async fn finish(&mut self) {
        self.stats.cancelled = self.cancel.is_cancelled();
        self.flush_pending().await;
        let abandoned = std::mem::take(&mut self.abandoned);
        self.defer(&abandoned);
        if let Err(err) = self.retry.save(&self.settings.retry_queue_path).await {
            error!(error = %err, items = self.retry.len(), "failed to persist retry queue");
        }
        info!(
            collected = self.stats.collected,
            enriched = self.stats.enriched,
            retry_queue = self.retry.len(),
            cancelled = self.stats.cancelled,
            "run finished"
        );
    }

    pub async fn harvest(&mut self, target: &Target, checkpoint: &mut Checkpoint) {
        let mut seen: HashSet<String> = checkpoint.seen().iter().cloned().collect();
        let mut buffer: Vec<RawPost> = Vec::new();
        let mut cursor = PageCursor::default();
        let mut stagnant = 0u32;

        while self.stats.collected < self.settings.limit {
            let produced = tokio::select! {
                _ = self.cancel.cancelled() => break,
                produced = self.source.produce(target, cursor, &seen) => produced,
            };
            let page = match produced {
                Ok(page) => page,
                Err(err) => {
                    stagnant += 1;
                    warn!(error = %err, stagnant, "harvest source failed");
                    if stagnant >= self.settings.stagnation_limit {
                        self.stats.stagnated = true;
                        break;
                    }
                    continue;
                }
            };
            cursor = page.cursor;

            let mut fresh = 0usize;
            for record in page.records {
                if self.stats.collected >= self.settings.limit {
                    break;
                }
                if !seen.insert(record.post_id.clone()) {
                    continue;
                }
                fresh += 1;
                self.stats.collected += 1;
                buffer.push(record);
                if buffer.len() >= self.settings.batch_size {
                    let batch = std::mem::take(&mut buffer);
                    self.process_batch(batch, checkpoint).await;
                }
            }

            if page.done {
                info!(total = self.stats.collected, "source exhausted");
                break;
            }
            if fresh == 0 {
                stagnant += 1;
                debug!(stagnant, scrolls = cursor.scrolls, "no new records");
                if stagnant >= self.settings.stagnation_limit {
                    warn!(stagnant, total = self.stats.collected, "harvest stagnated; stopping");
                    self.stats.stagnated = true;
                    break;
                }
            } else {
                stagnant = 0;
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }

        if !buffer.is_empty() {
            self.process_batch(buffer, checkpoint).await;
        }
    }

    pub async fn process_batch(&mut self, batch: Vec<RawPost>, checkpoint: &mut Checkpoint) {
        self.stats.batches += 1;
        info!(count = batch.len(), total = self.stats.collected, "batch collected");

        let rows: Vec<PostRecord> = batch.iter().map(PostRecord::from).collect();
        match self.sink.upsert(UpsertBatch::Posts(&rows)).await {
            Ok(written) => self.stats.raw_upserted += written,
            Err(err) => {
                self.stats.sink_failures += 1;
                error!(error = %err, rows = rows.len(), "failed to persist raw batch");
            }
        }

        let ids: Vec<String> = batch.into_iter().map(|r| r.post_id).collect();
        if let Err(err) = checkpoint.add_seen(ids.iter().cloned()).await {
            warn!(error = %err, "failed to persist checkpoint");
        }
        self.enrich_batch(&ids).await;
    }

    pub async fn enrich_batch(&mut self, ids: &[String]) {
        let mut posts = Vec::new();
        let mut replies = Vec::new();

        for (position, post_id) in ids.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.defer(&ids[position..]);
                break;
            }
            match self.enrich_one(post_id).await {
                EnrichAttempt::Enriched(detail) => self.accept(post_id, detail, &mut posts, &mut replies).await,
                EnrichAttempt::Failed(err) => {
                    self.stats.transient_failures += 1;
                    warn!(post_id = %post_id, error = %err, "enrichment failed; queued for retry");
                    self.requeue(RetryItem::first_failure(post_id.as_str()), &err);
                }
                EnrichAttempt::Halted if self.cancel.is_cancelled() => {
                    self.defer(&ids[position..]);
                    break;
                }
                EnrichAttempt::Halted => {
                    let rest = &ids[position..];
                    warn!(skipped = rest.len(), "enrichment paused; rest of batch held for a later run");
                    self.abandoned.extend(rest.iter().cloned());
                    break;
                }
            }
        }

        self.flush_rows(posts, replies).await;
    }

    fn requeue(&mut self, item: RetryItem, err: &EnrichError) {
        let post_id = item.post_id.clone();
        let attempts = item.attempts;
        if !self.retry.push(item) && !self.retry.contains(&post_id) {
            self.stats.retry_dropped += 1;
            error!(post_id = %post_id, attempts, error = %err, "retry limit reached; dropping");
        }
    }

    fn defer(&mut self, ids: &[String]) {
        let queued = ids
            .iter()
            .filter(|id| self.retry.push(RetryItem::deferred(id.as_str())))
            .count();
        self.stats.deferred += queued;
        if queued > 0 {
            info!(deferred = queued, "unenriched records queued for later");
        }
    }

    async fn accept(
        &mut self,
        post_id: &str,
        detail: TweetDetail,
        posts: &mut Vec<PostRecord>,
        replies: &mut Vec<ReplyRecord>,
    ) {
        self.stats.enriched += 1;
        info!(post_id, replies = detail.replies.len(), "enriched");
        self.archive_payload(post_id, &detail).await;

        if let Some(post) = detail.post {
            self.pending.posts.push(post.clone());
            posts.push(post);
        }
        self.pending.replies.extend(detail.replies.iter().cloned());
        replies.extend(detail.replies);
    }

    async fn archive_payload(&mut self, post_id: &str, detail: &TweetDetail) {
        let Some(store) = &self.archive else {
            return;
        };
        let bytes = match serde_json::to_vec(&detail.payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(post_id, error = %err, "payload not archivable");
                return;
            }
        };
        match store.store_bytes(Utc::now(), "tweet-detail", "json", &bytes).await {
            Ok(artifact) if !artifact.deduplicated => self.stats.archived += 1,
            Ok(_) => {}
            Err(err) => warn!(post_id, error = %err, "failed to archive payload"),
        }
    }

    fn active_account(&mut self) -> Option<AccountHandle> {
        if let Some(handle) = self.current.and_then(|index| self.pool.checkout(index)) {
            return Some(handle);
        }
        let handle = self.pool.next()?;
        if self.current != Some(handle.index) {
            info!(account = %handle.name, "using account");
        }
        self.current = Some(handle.index);
        Some(handle)
    }

    async fn enrich_one(&mut self, post_id: &str) -> EnrichAttempt {
        loop {
            if self.cancel.is_cancelled() {
                return EnrichAttempt::Halted;
            }
            let Some(account) = self.active_account() else {
                warn!(post_id, "no credential available");
                self.cooldown(CooldownCause::NoCredential).await;
                return EnrichAttempt::Halted;
            };

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return EnrichAttempt::Halted,
                result = self.client.fetch_detail(post_id, &account.credential) => result,
            };
            match result {
                Ok(detail) => {
                    self.pool.increment(account.index, 1);
                    self.rotation_failures = 0;
                    self.state = CoordinatorState::Active;
                    return EnrichAttempt::Enriched(detail);
                }
                Err(err) if err.kind() == FailureKind::Transient => return EnrichAttempt::Failed(err),
                Err(err) => {
                    self.stats.credential_failures += 1;
                    error!(account = %account.name, post_id, reason = %err, "credential rejected");
                    self.pool
                        .mark_backoff(account.index, self.settings.backoff_secs, &err.to_string());
                    match self.rotate().await {
                        RotationOutcome::Rotated => continue,
                        RotationOutcome::Unavailable => {
                            warn!(account = %account.name, "no account to rotate to; pausing enrichment");
                            return EnrichAttempt::Halted;
                        }
                        RotationOutcome::CooledDown | RotationOutcome::Cancelled => return EnrichAttempt::Halted,
                    }
                }
            }
        }
    }

    /// Count a credential failure and move to the next usable account.
    ///
    /// Once consecutive failures reach the number of accounts the whole cycle
    /// is spent and the coordinator cools down. Short of that, an empty pool
    /// (the rest over quota or backed off) only pauses enrichment.
    pub async fn rotate(&mut self) -> RotationOutcome {
        if !self.settings.auto_rotate || self.pool.len() <= 1 {
            return RotationOutcome::Unavailable;
        }
        self.rotation_failures += 1;
        if self.rotation_failures >= self.pool.len() {
            return self.cooldown(CooldownCause::FullCycle).await;
        }
        let Some(next) = self.pool.next() else {
            debug!(failures = self.rotation_failures, "no other usable account");
            return RotationOutcome::Unavailable;
        };

        self.state = CoordinatorState::Rotating;
        let from = self.current.and_then(|index| self.pool.name(index));
        self.current = Some(next.index);
        self.stats.rotations += 1;
        warn!(from = from.as_deref().unwrap_or("-"), to = %next.name, "rotating account");

        let settled = self.pause(self.settings.rotation_settle).await;
        self.state = CoordinatorState::Active;
        if settled {
            RotationOutcome::Rotated
        } else {
            RotationOutcome::Cancelled
        }
    }

    async fn cooldown(&mut self, cause: CooldownCause) -> RotationOutcome {
        self.state = CoordinatorState::Cooldown;
        self.stats.cooldowns += 1;
        let cooldown_secs = self.settings.cooldown.as_secs();
        match cause {
            CooldownCause::FullCycle => error!(
                accounts = self.pool.len(),
                cooldown_secs, "all accounts exhausted; entering cooldown"
            ),
            CooldownCause::NoCredential => warn!(
                accounts = self.pool.len(),
                cooldown_secs, "no usable account; entering cooldown"
            ),
        }
        self.flush_pending().await;
        self.rotation_failures = 0;

        let completed = self.pause(self.settings.cooldown).await;
        self.state = CoordinatorState::Active;
        if completed {
            info!("cooldown finished");
            RotationOutcome::CooledDown
        } else {
            warn!("cooldown interrupted by cancellation");
            RotationOutcome::Cancelled
        }
    }

    // false when cancelled before `duration` elapsed
    async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    pub async fn drain_retry_queue(&mut self) {
        if self.retry.is_empty() {
            return;
        }
        warn!(queued = self.retry.len(), "retrying failed enrichments");
        let mut posts = Vec::new();
        let mut replies = Vec::new();

        while let Some(item) = self.retry.pop() {
            if self.cancel.is_cancelled() {
                self.retry.push_front(item);
                break;
            }
            match self.enrich_one(&item.post_id).await {
                EnrichAttempt::Enriched(detail) => {
                    self.stats.retried_ok += 1;
                    self.accept(&item.post_id, detail, &mut posts, &mut replies).await;
                }
                EnrichAttempt::Failed(err) => self.requeue(item.bumped(), &err),
                EnrichAttempt::Halted => {
                    self.retry.push_front(item);
                    warn!(remaining = self.retry.len(), "retry drain paused; remaining items kept");
                    break;
                }
            }
        }

        self.flush_rows(posts, replies).await;
    }

    async fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let posts = self.pending.posts.clone();
        let replies = self.pending.replies.clone();
        info!(posts = posts.len(), replies = replies.len(), "flushing pending rows");
        self.flush_rows(posts, replies).await;
    }

    // Rows whose write fails stay pending for the next flush.
    async fn flush_rows(&mut self, posts: Vec<PostRecord>, replies: Vec<ReplyRecord>) {
        let posts: Vec<PostRecord> = posts
            .into_iter()
            .filter(|p| self.pending.holds_post(&p.post_id))
            .collect();
        let replies: Vec<ReplyRecord> = dedupe_replies(replies)
            .into_iter()
            .filter(|r| self.pending.holds_reply(&r.reply_id))
            .collect();

        if !posts.is_empty() {
            match self.sink.upsert(UpsertBatch::Posts(&posts)).await {
                Ok(written) => {
                    self.stats.enriched_upserted += written;
                    self.pending.settle_posts(&posts);
                    info!(rows = written, "saved enriched posts");
                }
                Err(err) => {
                    self.stats.sink_failures += 1;
                    error!(error = %err, rows = posts.len(), "failed to persist enriched posts");
                }
            }
        }
        if !replies.is_empty() {
            match self.sink.upsert(UpsertBatch::Replies(&replies)).await {
                Ok(written) => {
                    self.stats.replies_upserted += written;
                    self.pending.settle_replies(&replies);
                    info!(rows = written, "saved replies");
                }
                Err(err) => {
                    self.stats.sink_failures += 1;
                    error!(error = %err, rows = replies.len(), "failed to persist replies");
                }
            }
        }
    }
}

// The same reply can hang under several enriched posts of one batch.
fn dedupe_replies(replies: Vec<ReplyRecord>) -> Vec<ReplyRecord> {
    let mut ids = BTreeSet::new();
    replies
        .into_iter()
        .filter(|r| ids.insert(r.reply_id.clone()))
        .collect()
}
