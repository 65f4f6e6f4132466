use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use sph_core::{PostRecord, ReplyRecord, TableKind};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("sink rejected batch: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy)]
pub enum UpsertBatch<'a> {
    Posts(&'a [PostRecord]),
    Replies(&'a [ReplyRecord]),
}

impl UpsertBatch<'_> {
    pub fn kind(&self) -> TableKind {
        match self {
            UpsertBatch::Posts(_) => TableKind::Posts,
            UpsertBatch::Replies(_) => TableKind::Replies,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            UpsertBatch::Posts(rows) => rows.len(),
            UpsertBatch::Replies(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        match self {
            UpsertBatch::Posts(rows) => rows.iter().map(|r| r.post_id.clone()).collect(),
            UpsertBatch::Replies(rows) => rows.iter().map(|r| r.reply_id.clone()).collect(),
        }
    }
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &str;

    async fn upsert(&self, batch: UpsertBatch<'_>) -> Result<usize, SinkError>;
}

const POST_COLUMNS: &[&str] = &[
    "created_at",
    "text",
    "lang",
    "link",
    "user_id",
    "username",
    "displayname",
    "verified",
    "followers_count",
    "friends_count",
    "favourites_count",
    "listed_count",
    "media_count",
    "like_count",
    "reply_count",
    "retweet_count",
    "quote_count",
    "view_count",
];

const REPLY_COLUMNS: &[&str] = &[
    "post_id",
    "created_at",
    "text",
    "lang",
    "user_id",
    "username",
    "displayname",
    "verified",
    "followers_count",
    "friends_count",
    "favourites_count",
    "media_count",
    "like_count",
    "reply_count",
    "retweet_count",
    "quote_count",
    "view_count",
];

fn upsert_sql(table: &str, key: &str, columns: &[&str]) -> String {
    let names = std::iter::once(key)
        .chain(columns.iter().copied())
        .collect::<Vec<_>>()
        .join(", ");
    let params = (1..=columns.len() + 1)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = columns
        .iter()
        .map(|c| format!("{c} = COALESCE(EXCLUDED.{c}, {table}.{c})"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} ({names}) VALUES ({params}) ON CONFLICT ({key}) DO UPDATE SET {updates}, updated_at = NOW()"
    )
}

pub struct PgRecordSink {
    pool: PgPool,
    posts_sql: String,
    replies_sql: String,
}

impl PgRecordSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            posts_sql: upsert_sql(TableKind::Posts.table_name(), "post_id", POST_COLUMNS),
            replies_sql: upsert_sql(TableKind::Replies.table_name(), "reply_id", REPLY_COLUMNS),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), SinkError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn upsert_posts(&self, rows: &[PostRecord]) -> Result<usize, SinkError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(&self.posts_sql)
                .bind(&row.post_id)
                .bind(row.created_at)
                .bind(&row.text)
                .bind(&row.lang)
                .bind(&row.link)
                .bind(&row.user_id)
                .bind(&row.username)
                .bind(&row.displayname)
                .bind(row.verified)
                .bind(row.followers_count)
                .bind(row.friends_count)
                .bind(row.favourites_count)
                .bind(row.listed_count)
                .bind(row.media_count)
                .bind(row.like_count)
                .bind(row.reply_count)
                .bind(row.retweet_count)
                .bind(row.quote_count)
                .bind(row.view_count)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    async fn upsert_replies(&self, rows: &[ReplyRecord]) -> Result<usize, SinkError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(&self.replies_sql)
                .bind(&row.reply_id)
                .bind(&row.post_id)
                .bind(row.created_at)
                .bind(&row.text)
                .bind(&row.lang)
                .bind(&row.user_id)
                .bind(&row.username)
                .bind(&row.displayname)
                .bind(row.verified)
                .bind(row.followers_count)
                .bind(row.friends_count)
                .bind(row.favourites_count)
                .bind(row.media_count)
                .bind(row.like_count)
                .bind(row.reply_count)
                .bind(row.retweet_count)
                .bind(row.quote_count)
                .bind(row.view_count)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }
}

#[async_trait]
impl RecordSink for PgRecordSink {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn upsert(&self, batch: UpsertBatch<'_>) -> Result<usize, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let written = match batch {
            UpsertBatch::Posts(rows) => self.upsert_posts(rows).await?,
            UpsertBatch::Replies(rows) => self.upsert_replies(rows).await?,
        };
        debug!(table = %batch.kind(), rows = written, "upserted");
        Ok(written)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertCall {
    pub kind: TableKind,
    pub ids: Vec<String>,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct MemoryState {
    posts: BTreeMap<String, PostRecord>,
    replies: BTreeMap<String, ReplyRecord>,
    calls: Vec<UpsertCall>,
    fail_next: usize,
}

#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

macro_rules! coalesce_fields {
    ($stored:expr, $incoming:expr; $($field:ident),+ $(,)?) => {
        $(
            if $incoming.$field.is_some() {
                $stored.$field = $incoming.$field.clone();
            }
        )+
    };
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    pub fn calls(&self) -> Vec<UpsertCall> {
        self.lock().calls.clone()
    }

    pub fn post(&self, post_id: &str) -> Option<PostRecord> {
        self.lock().posts.get(post_id).cloned()
    }

    pub fn post_ids(&self) -> Vec<String> {
        self.lock().posts.keys().cloned().collect()
    }

    pub fn reply_ids(&self) -> Vec<String> {
        self.lock().replies.keys().cloned().collect()
    }

    pub fn post_count(&self) -> usize {
        self.lock().posts.len()
    }

    pub fn reply_count(&self) -> usize {
        self.lock().replies.len()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, batch: UpsertBatch<'_>) -> Result<usize, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut state = self.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SinkError::Rejected(format!("{} rows for {}", batch.len(), batch.kind())));
        }
        match batch {
            UpsertBatch::Posts(rows) => {
                for row in rows {
                    let stored = state
                        .posts
                        .entry(row.post_id.clone())
                        .or_insert_with(|| PostRecord {
                            post_id: row.post_id.clone(),
                            ..PostRecord::default()
                        });
                    coalesce_fields!(stored, row;
                        created_at, text, lang, link, user_id, username, displayname, verified,
                        followers_count, friends_count, favourites_count, listed_count, media_count,
                        like_count, reply_count, retweet_count, quote_count, view_count);
                }
            }
            UpsertBatch::Replies(rows) => {
                for row in rows {
                    let stored = state
                        .replies
                        .entry(row.reply_id.clone())
                        .or_insert_with(|| ReplyRecord {
                            reply_id: row.reply_id.clone(),
                            ..ReplyRecord::default()
                        });
                    coalesce_fields!(stored, row;
                        post_id, created_at, text, lang, user_id, username, displayname, verified,
                        followers_count, friends_count, favourites_count, media_count,
                        like_count, reply_count, retweet_count, quote_count, view_count);
                }
            }
        }
        state.calls.push(UpsertCall {
            kind: batch.kind(),
            ids: batch.ids(),
            at: Instant::now(),
        });
        Ok(batch.len())
    }
}
