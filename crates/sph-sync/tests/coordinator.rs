use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sph_adapters::{
    dedupe_against, AdapterError, EnrichError, EnrichmentClient, HarvestPage, HarvestSource, PageCursor, TweetDetail,
};
use sph_core::{CookiePair, Credential, PostRecord, RawPost, ReplyRecord, TableKind, Target};
use sph_storage::Checkpoint;
use sph_sync::{
    Coordinator, CoordinatorSettings, CoordinatorState, CredentialPool, ManualClock, MemorySink, PoolSettings,
    RetryQueue,
};
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

struct ScriptedSource {
    pages: Vec<Vec<String>>,
    repeat_last: bool,
    produced: AtomicUsize,
}

impl ScriptedSource {
    fn new(pages: Vec<Vec<String>>) -> Self {
        Self {
            pages,
            repeat_last: false,
            produced: AtomicUsize::new(0),
        }
    }

    fn repeating(pages: Vec<Vec<String>>) -> Self {
        Self {
            repeat_last: true,
            ..Self::new(pages)
        }
    }

    fn produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HarvestSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn produce(
        &self,
        _target: &Target,
        cursor: PageCursor,
        seen: &HashSet<String>,
    ) -> Result<HarvestPage, AdapterError> {
        self.produced.fetch_add(1, Ordering::SeqCst);
        let index = cursor.scrolls as usize;
        let page = match self.pages.get(index) {
            Some(page) => page,
            None if self.repeat_last && !self.pages.is_empty() => &self.pages[self.pages.len() - 1],
            None => {
                return Ok(HarvestPage {
                    records: Vec::new(),
                    cursor,
                    done: true,
                })
            }
        };
        let records = page.iter().map(|id| RawPost::new(id.as_str())).collect();
        Ok(HarvestPage {
            records: dedupe_against(records, seen),
            cursor: cursor.next(),
            done: false,
        })
    }
}

type Rule = Box<dyn Fn(&Call, usize) -> Option<EnrichError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Call {
    post_id: String,
    bearer: String,
}

struct ScriptedClient {
    calls: Mutex<Vec<Call>>,
    rule: Rule,
    cancel_after: Option<(String, CancellationToken)>,
}

impl ScriptedClient {
    fn new(rule: impl Fn(&Call, usize) -> Option<EnrichError> + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            rule: Box::new(rule),
            cancel_after: None,
        }
    }

    fn always_ok() -> Self {
        Self::new(|_, _| None)
    }

    fn cancelling_after(mut self, post_id: &str, token: CancellationToken) -> Self {
        self.cancel_after = Some((post_id.to_string(), token));
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn bearers(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.bearer).collect()
    }

    fn calls_for(&self, post_id: &str) -> usize {
        self.calls().iter().filter(|c| c.post_id == post_id).count()
    }
}

#[async_trait]
impl EnrichmentClient for ScriptedClient {
    async fn fetch_detail(&self, post_id: &str, credential: &Credential) -> Result<TweetDetail, EnrichError> {
        let call = Call {
            post_id: post_id.to_string(),
            bearer: credential.bearer.clone(),
        };
        let nth_for_bearer = {
            let mut calls = self.calls.lock().expect("calls lock");
            calls.push(call.clone());
            calls.iter().filter(|c| c.bearer == call.bearer).count()
        };
        if let Some(err) = (self.rule)(&call, nth_for_bearer) {
            return Err(err);
        }
        if let Some((trigger, token)) = &self.cancel_after {
            if trigger == post_id {
                token.cancel();
            }
        }
        Ok(detail(post_id))
    }
}

fn detail(post_id: &str) -> TweetDetail {
    TweetDetail {
        post: Some(PostRecord {
            post_id: post_id.to_string(),
            text: Some(format!("detail {post_id}")),
            ..PostRecord::default()
        }),
        replies: vec![ReplyRecord {
            reply_id: format!("r{post_id}"),
            post_id: Some(post_id.to_string()),
            ..ReplyRecord::default()
        }],
        payload: json!({ "id": post_id }),
    }
}

struct StallingClient {
    stall_on: String,
}

#[async_trait]
impl EnrichmentClient for StallingClient {
    async fn fetch_detail(&self, post_id: &str, _credential: &Credential) -> Result<TweetDetail, EnrichError> {
        if post_id == self.stall_on {
            std::future::pending::<()>().await;
        }
        Ok(detail(post_id))
    }
}

fn credential(bearer: &str) -> Credential {
    Credential::new(
        vec![CookiePair {
            name: "ct0".into(),
            value: format!("csrf-{bearer}"),
        }],
        bearer,
    )
}

fn pool(bearers: &[&str], quota: u64) -> CredentialPool {
    let accounts = bearers
        .iter()
        .map(|b| (format!("acct-{b}"), credential(b)))
        .collect();
    CredentialPool::from_credentials(
        accounts,
        PoolSettings {
            max_requests_per_window: quota,
            window: None,
        },
        Arc::new(ManualClock::new(Utc::now())),
    )
}

fn settings(dir: &Path) -> CoordinatorSettings {
    CoordinatorSettings {
        batch_size: 50,
        limit: 100,
        stagnation_limit: 3,
        backoff_secs: 300,
        cooldown: Duration::from_secs(3600),
        rotation_settle: Duration::ZERO,
        auto_rotate: true,
        max_retry: 3,
        checkpoint_path: dir.join("state").join("checkpoint.json"),
        retry_queue_path: dir.join("state").join("retry_queue.json"),
    }
}

struct Harness {
    _dir: TempDir,
    settings: CoordinatorSettings,
    source: Arc<ScriptedSource>,
    client: Arc<ScriptedClient>,
    sink: Arc<MemorySink>,
}

impl Harness {
    fn new(source: ScriptedSource, client: ScriptedClient) -> Self {
        let dir = tempdir().expect("tempdir");
        let settings = settings(dir.path());
        Self {
            _dir: dir,
            settings,
            source: Arc::new(source),
            client: Arc::new(client),
            sink: Arc::new(MemorySink::new()),
        }
    }

    fn coordinator(&self, pool: CredentialPool) -> Coordinator {
        Coordinator::new(
            self.settings.clone(),
            pool,
            self.source.clone(),
            self.client.clone(),
            self.sink.clone(),
        )
    }

    fn enriched(&self, post_id: &str) -> bool {
        self.sink
            .post(post_id)
            .and_then(|p| p.text)
            .is_some_and(|text| text == format!("detail {post_id}"))
    }
}

fn ids(range: std::ops::RangeInclusive<u32>) -> Vec<String> {
    range.map(|n| n.to_string()).collect()
}

fn page(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

fn target() -> Target {
    Target::search("rust", Some("en"))
}

#[tokio::test]
async fn rate_limit_rotates_to_the_second_account_without_cooldown() {
    let client = ScriptedClient::new(|call, nth| {
        (call.bearer == "a1" && nth == 6).then_some(EnrichError::RateLimited { status: 429 })
    });
    let harness = Harness::new(ScriptedSource::new(vec![ids(1..=12)]), client);
    let mut coordinator = harness.coordinator(pool(&["a1", "a2"], 100));

    let summary = coordinator.run(&target()).await;

    let expected: Vec<String> = std::iter::repeat("a1")
        .take(6)
        .chain(std::iter::repeat("a2").take(7))
        .map(String::from)
        .collect();
    assert_eq!(harness.client.bearers(), expected);
    // the rate-limited record is retried on the new account
    assert_eq!(harness.client.calls_for("6"), 2);
    assert_eq!(summary.stats.rotations, 1);
    assert_eq!(summary.stats.cooldowns, 0);
    assert_eq!(summary.stats.enriched, 12);
    assert_eq!(coordinator.rotation_failures(), 0);
    assert_eq!(coordinator.state(), CoordinatorState::Active);
    for n in 1..=12 {
        assert!(harness.enriched(&n.to_string()), "post {n} not enriched");
    }
    assert_eq!(harness.sink.reply_count(), 12);
    assert!(summary.accounts[0].available_at.is_some());
    assert_eq!(summary.accounts[1].usage, 7);
}

#[tokio::test]
async fn quota_moves_work_to_the_next_account_silently() {
    let harness = Harness::new(ScriptedSource::new(vec![ids(1..=8)]), ScriptedClient::always_ok());
    let mut coordinator = harness.coordinator(pool(&["a1", "a2"], 5));

    let summary = coordinator.run(&target()).await;

    let bearers = harness.client.bearers();
    assert_eq!(bearers.iter().filter(|b| *b == "a1").count(), 5);
    assert_eq!(&bearers[5..], ["a2", "a2", "a2"]);
    assert_eq!(summary.stats.rotations, 0);
    assert_eq!(summary.stats.credential_failures, 0);
    assert_eq!(harness.sink.post_count(), 8);
}

#[tokio::test(start_paused = true)]
async fn cooldown_flushes_pending_rows_before_sleeping() {
    let client = ScriptedClient::new(|call, _| {
        (call.post_id == "3").then_some(EnrichError::RateLimited { status: 429 })
    });
    let harness = Harness::new(ScriptedSource::new(vec![ids(1..=4)]), client);
    let mut coordinator = harness.coordinator(pool(&["a1", "a2"], 100));
    let started = tokio::time::Instant::now();

    let summary = coordinator.run(&target()).await;

    assert_eq!(summary.stats.cooldowns, 1);
    assert!(started.elapsed() >= Duration::from_secs(3600));

    let calls = harness.sink.calls();
    let flushed = calls
        .iter()
        .find(|c| c.kind == TableKind::Posts && c.ids == ["1", "2"])
        .expect("pending posts flushed");
    assert!(flushed.at < started + Duration::from_secs(3600));
    let replies = calls
        .iter()
        .find(|c| c.kind == TableKind::Replies)
        .expect("pending replies flushed");
    assert_eq!(replies.ids, ["r1", "r2"]);
    assert!(replies.at < started + Duration::from_secs(3600));

    // the halted batch is not resumed in this run, only queued for the next
    assert!(!harness.enriched("3"));
    assert!(!harness.enriched("4"));
    assert_eq!(harness.client.calls_for("4"), 0);
    assert!(coordinator.pending().is_empty());
    let persisted = RetryQueue::load(&harness.settings.retry_queue_path, 3).await;
    let queued: Vec<_> = persisted.items().map(|i| (i.post_id.clone(), i.attempts)).collect();
    assert_eq!(queued, vec![("3".to_string(), 0), ("4".to_string(), 0)]);
}

#[tokio::test]
async fn single_account_rejection_pauses_without_cooldown() {
    let client = ScriptedClient::new(|call, _| {
        (call.post_id == "2").then_some(EnrichError::AuthFailed { status: 401 })
    });
    let harness = Harness::new(ScriptedSource::new(vec![ids(1..=3)]), client);
    let mut coordinator = harness.coordinator(pool(&["a1"], 100));

    let summary = coordinator.run(&target()).await;

    assert_eq!(summary.stats.cooldowns, 0);
    assert_eq!(summary.stats.credential_failures, 1);
    assert!(harness.enriched("1"));
    assert_eq!(harness.client.calls_for("3"), 0);
    assert_eq!(summary.accounts[0].last_failure.as_deref(), Some("credential rejected (status 401)"));
}

#[tokio::test]
async fn transient_failures_are_retried_after_the_harvest() {
    let client = ScriptedClient::new(|call, _| {
        (call.post_id == "2" && call.bearer == "a1").then_some(EnrichError::Transient("timeout".into()))
    });
    // the first attempt fails on a1; quota 2 puts the retry on a2
    let harness = Harness::new(ScriptedSource::new(vec![ids(1..=3)]), client);
    let mut coordinator = harness.coordinator(pool(&["a1", "a2"], 2));

    let summary = coordinator.run(&target()).await;

    assert_eq!(summary.stats.transient_failures, 1);
    assert_eq!(summary.stats.retried_ok, 1);
    assert_eq!(summary.stats.rotations, 0);
    assert_eq!(summary.retry_queue_len, 0);
    for id in ["1", "2", "3"] {
        assert!(harness.enriched(id));
    }
    let persisted = RetryQueue::load(&harness.settings.retry_queue_path, 3).await;
    assert!(persisted.is_empty());
}

#[tokio::test]
async fn retries_stop_at_the_attempt_bound() {
    let client = ScriptedClient::new(|call, _| {
        (call.post_id == "x").then_some(EnrichError::Transient("bad payload".into()))
    });
    let harness = Harness::new(ScriptedSource::new(vec![page(&["x", "y"])]), client);
    let mut settings = harness.settings.clone();
    settings.max_retry = 2;
    let mut coordinator = Coordinator::new(
        settings,
        pool(&["a1"], 100),
        harness.source.clone(),
        harness.client.clone(),
        harness.sink.clone(),
    );

    let summary = coordinator.run(&target()).await;

    // the initial attempt plus max_retry retries
    assert_eq!(harness.client.calls_for("x"), 3);
    assert_eq!(summary.stats.retry_dropped, 1);
    assert_eq!(summary.retry_queue_len, 0);
    assert!(harness.enriched("y"));
    assert!(!harness.enriched("x"));
}

#[tokio::test]
async fn zero_retry_budget_drops_on_the_first_failure() {
    let client = ScriptedClient::new(|call, _| {
        (call.post_id == "x").then_some(EnrichError::Transient("connection reset".into()))
    });
    let mut harness = Harness::new(ScriptedSource::new(vec![page(&["x", "y"])]), client);
    harness.settings.max_retry = 0;
    let mut coordinator = harness.coordinator(pool(&["a1"], 100));

    let summary = coordinator.run(&target()).await;

    assert_eq!(harness.client.calls_for("x"), 1);
    assert_eq!(summary.stats.transient_failures, 1);
    assert_eq!(summary.stats.retry_dropped, 1);
    assert_eq!(summary.retry_queue_len, 0);
    assert!(harness.enriched("y"));
}

#[tokio::test(start_paused = true)]
async fn two_rate_limits_across_a_quota_bound_pool() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let client = ScriptedClient::new(move |_, _| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        matches!(n, 6 | 7).then_some(EnrichError::RateLimited { status: 429 })
    });
    let harness = Harness::new(ScriptedSource::new(vec![ids(1..=12)]), client);

    // a1 spends its quota, the sixth record moves to a2 and is rejected there
    let mut first = harness.coordinator(pool(&["a1", "a2"], 5));
    let summary = first.run(&target()).await;

    assert_eq!(harness.client.bearers(), ["a1", "a1", "a1", "a1", "a1", "a2"]);
    assert_eq!(summary.stats.credential_failures, 1);
    assert_eq!(summary.stats.rotations, 0);
    assert_eq!(summary.stats.cooldowns, 0);
    assert_eq!(first.rotation_failures(), 1);
    assert_eq!(first.state(), CoordinatorState::Active);
    assert_eq!(summary.stats.enriched, 5);
    // every collected record is stored raw; the unenriched ones wait in the queue
    assert_eq!(harness.sink.post_count(), 12);
    assert_eq!(summary.stats.deferred, 7);
    let queued: Vec<_> = RetryQueue::load(&harness.settings.retry_queue_path, 3)
        .await
        .items()
        .map(|i| i.post_id.clone())
        .collect();
    assert_eq!(queued, ids(6..=12));

    // a fresh window: call 7 fails on a1, a2 takes calls 8 to 12
    let mut second = harness.coordinator(pool(&["a1", "a2"], 5));
    let summary = second.run_retry_queue().await;

    assert_eq!(&harness.client.bearers()[6..], ["a1", "a2", "a2", "a2", "a2", "a2"]);
    assert_eq!(summary.stats.rotations, 1);
    assert_eq!(summary.stats.retried_ok, 5);
    for n in 6..=10 {
        assert!(harness.enriched(&n.to_string()), "post {n} not enriched");
    }
    // with a1 backed off and a2 at quota the pool is empty, which is not a full cycle
    assert_eq!(summary.stats.cooldowns, 1);
    assert_eq!(second.rotation_failures(), 0);
    assert_eq!(summary.retry_queue_len, 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_a_stalled_enrichment_call() {
    let token = CancellationToken::new();
    let harness = Harness::new(ScriptedSource::new(vec![ids(1..=3)]), ScriptedClient::always_ok());
    let mut coordinator = Coordinator::new(
        harness.settings.clone(),
        pool(&["a1"], 100),
        harness.source.clone(),
        Arc::new(StallingClient { stall_on: "2".into() }),
        harness.sink.clone(),
    )
    .with_cancellation(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        token.cancel();
    });

    let summary = coordinator.run(&target()).await;
    canceller.await.expect("canceller");

    assert!(summary.stats.cancelled);
    assert!(harness.enriched("1"));
    assert!(!harness.enriched("2"));
    let persisted = RetryQueue::load(&harness.settings.retry_queue_path, 3).await;
    let queued: Vec<_> = persisted.items().map(|i| i.post_id.clone()).collect();
    assert_eq!(queued, ["2", "3"]);
}

#[tokio::test]
async fn account_state_carries_into_the_next_run() {
    let client = ScriptedClient::new(|call, _| {
        (call.bearer == "a1").then_some(EnrichError::AuthFailed { status: 401 })
    });
    let harness = Harness::new(ScriptedSource::new(vec![ids(1..=2)]), client);
    let mut first = harness.coordinator(pool(&["a1", "a2"], 100));
    assert_eq!(first.run(&target()).await.stats.rotations, 1);

    let mut second = Coordinator::new(
        harness.settings.clone(),
        first.into_pool(),
        Arc::new(ScriptedSource::new(vec![page(&["3", "4"])])),
        harness.client.clone(),
        harness.sink.clone(),
    );
    let summary = second.run(&target()).await;

    // a1 is still backed off, so the second run never touches it
    assert_eq!(harness.client.bearers(), ["a1", "a2", "a2", "a2", "a2"]);
    assert_eq!(summary.stats.credential_failures, 0);
    assert!(summary.accounts[0].available_at.is_some());
    assert_eq!(summary.accounts[1].usage, 4);
}

#[tokio::test]
async fn checkpoint_skips_records_from_earlier_runs() {
    let dir = tempdir().expect("tempdir");
    let settings = settings(dir.path());
    let sink = Arc::new(MemorySink::new());

    let first_client = Arc::new(ScriptedClient::always_ok());
    let mut first = Coordinator::new(
        settings.clone(),
        pool(&["a1"], 100),
        Arc::new(ScriptedSource::new(vec![page(&["1", "2", "3"])])),
        first_client.clone(),
        sink.clone(),
    );
    assert_eq!(first.run(&target()).await.stats.collected, 3);

    let second_client = Arc::new(ScriptedClient::always_ok());
    let mut second = Coordinator::new(
        settings.clone(),
        pool(&["a1"], 100),
        Arc::new(ScriptedSource::new(vec![page(&["2", "3", "4"])])),
        second_client.clone(),
        sink.clone(),
    );
    let summary = second.run(&target()).await;

    assert_eq!(summary.stats.collected, 1);
    assert_eq!(
        second_client.calls(),
        vec![Call {
            post_id: "4".into(),
            bearer: "a1".into()
        }]
    );
    let checkpoint = Checkpoint::load(&settings.checkpoint_path).await;
    let seen: Vec<_> = checkpoint.seen().iter().cloned().collect();
    assert_eq!(seen, ["1", "2", "3", "4"]);
    assert_eq!(sink.post_count(), 4);
}

#[tokio::test]
async fn cancellation_defers_unenriched_records() {
    let token = CancellationToken::new();
    let client = ScriptedClient::always_ok().cancelling_after("2", token.clone());
    let mut harness = Harness::new(ScriptedSource::new(vec![ids(1..=4), ids(5..=6)]), client);
    harness.settings.batch_size = 4;
    let mut coordinator = harness
        .coordinator(pool(&["a1"], 100))
        .with_cancellation(token);

    let summary = coordinator.run(&target()).await;

    assert!(summary.stats.cancelled);
    assert_eq!(summary.stats.deferred, 2);
    assert!(harness.enriched("1"));
    assert!(harness.enriched("2"));
    // raw rows are still written for the deferred records
    assert!(harness.sink.post("3").is_some());
    assert!(!harness.enriched("3"));
    // the harvest stops after the cancelled batch
    assert_eq!(harness.source.produced(), 1);

    let persisted = RetryQueue::load(&harness.settings.retry_queue_path, 3).await;
    let queued: Vec<_> = persisted.items().map(|i| (i.post_id.clone(), i.attempts)).collect();
    assert_eq!(queued, vec![("3".to_string(), 0), ("4".to_string(), 0)]);
}

#[tokio::test]
async fn retry_command_drains_the_persisted_queue() {
    let harness = Harness::new(ScriptedSource::new(Vec::new()), ScriptedClient::always_ok());
    let mut queue = RetryQueue::new(3);
    queue.push(sph_sync::RetryItem::deferred("7"));
    queue.push(sph_sync::RetryItem::first_failure("8"));
    queue
        .save(&harness.settings.retry_queue_path)
        .await
        .expect("save queue");

    let mut coordinator = harness.coordinator(pool(&["a1"], 100));
    let summary = coordinator.run_retry_queue().await;

    assert_eq!(summary.target, None);
    assert_eq!(summary.stats.retried_ok, 2);
    assert_eq!(harness.source.produced(), 0);
    assert!(harness.enriched("7"));
    assert!(harness.enriched("8"));
    assert!(RetryQueue::load(&harness.settings.retry_queue_path, 3).await.is_empty());
}

#[tokio::test]
async fn stagnant_source_stops_the_harvest() {
    let harness = Harness::new(
        ScriptedSource::repeating(vec![page(&["1", "2"])]),
        ScriptedClient::always_ok(),
    );
    let mut coordinator = harness.coordinator(pool(&["a1"], 100));

    let summary = coordinator.run(&target()).await;

    assert!(summary.stats.stagnated);
    assert_eq!(summary.stats.collected, 2);
    // one productive page, then three without anything new
    assert_eq!(harness.source.produced(), 4);
}

#[tokio::test]
async fn raw_upsert_failure_does_not_stop_enrichment() {
    let harness = Harness::new(ScriptedSource::new(vec![ids(1..=2)]), ScriptedClient::always_ok());
    harness.sink.fail_next(1);
    let mut coordinator = harness.coordinator(pool(&["a1"], 100));

    let summary = coordinator.run(&target()).await;

    assert_eq!(summary.stats.sink_failures, 1);
    assert_eq!(summary.stats.raw_upserted, 0);
    assert!(harness.enriched("1"));
    assert!(harness.enriched("2"));
    assert_eq!(summary.pending_len, 0);
}

#[tokio::test]
async fn limit_caps_collection() {
    let harness = Harness::new(ScriptedSource::new(vec![ids(1..=10)]), ScriptedClient::always_ok());
    let mut settings = harness.settings.clone();
    settings.limit = 4;
    settings.batch_size = 3;
    let mut coordinator = Coordinator::new(
        settings,
        pool(&["a1"], 100),
        harness.source.clone(),
        harness.client.clone(),
        harness.sink.clone(),
    );

    let summary = coordinator.run(&target()).await;

    assert_eq!(summary.stats.collected, 4);
    assert_eq!(summary.stats.batches, 2);
    assert_eq!(harness.sink.post_ids(), ["1", "2", "3", "4"]);
}
