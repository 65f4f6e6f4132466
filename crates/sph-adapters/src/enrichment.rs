use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, COOKIE};
use reqwest::Url;
use serde_json::{json, Value as JsonValue};
use sph_core::{Credential, PostRecord, ReplyRecord};
use sph_storage::{FetchError, HttpFetcher};
use thiserror::Error;

use crate::detail::parse_tweet_detail;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Credential,
    Transient,
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("rate limited (status {status})")]
    RateLimited { status: u16 },
    #[error("credential rejected (status {status})")]
    AuthFailed { status: u16 },
    #[error("transient failure: {0}")]
    Transient(String),
}

impl EnrichError {
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        match status {
            429 => EnrichError::RateLimited { status },
            401 | 403 => EnrichError::AuthFailed { status },
            _ => EnrichError::Transient(format!("http status {status}: {}", detail.into())),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            EnrichError::RateLimited { .. } | EnrichError::AuthFailed { .. } => FailureKind::Credential,
            EnrichError::Transient(_) => FailureKind::Transient,
        }
    }
}

impl From<FetchError> for EnrichError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, url, .. } => EnrichError::from_status(status, url),
            FetchError::Request(err) => EnrichError::Transient(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TweetDetail {
    pub post: Option<PostRecord>,
    pub replies: Vec<ReplyRecord>,
    pub payload: JsonValue,
}

#[async_trait]
pub trait EnrichmentClient: Send + Sync {
    async fn fetch_detail(&self, post_id: &str, credential: &Credential) -> Result<TweetDetail, EnrichError>;
}

pub struct GraphqlEnrichmentClient {
    fetcher: HttpFetcher,
    api_base: String,
    detail_key: String,
}

impl GraphqlEnrichmentClient {
    pub fn new(fetcher: HttpFetcher, api_base: &str, detail_key: &str) -> Self {
        Self {
            fetcher,
            api_base: api_base.trim_end_matches('/').to_string(),
            detail_key: detail_key.to_string(),
        }
    }

    pub fn detail_url(&self, post_id: &str) -> Result<Url, EnrichError> {
        let variables = json!({
            "focalTweetId": post_id,
            "includePromotedContent": true,
            "withVoice": true,
        })
        .to_string();
        let endpoint = format!("{}/i/api/graphql/{}/TweetDetail", self.api_base, self.detail_key);
        Url::parse_with_params(&endpoint, &[("variables", variables)])
            .map_err(|e| EnrichError::Transient(format!("building detail url: {e}")))
    }
}

#[async_trait]
impl EnrichmentClient for GraphqlEnrichmentClient {
    async fn fetch_detail(&self, post_id: &str, credential: &Credential) -> Result<TweetDetail, EnrichError> {
        let url = self.detail_url(post_id)?;
        let authorization = credential.authorization();
        let cookie = credential.cookie_header();
        let csrf = credential.csrf_token().to_string();

        let resp = self
            .fetcher
            .send("tweet_detail", |client| {
                client
                    .get(url.clone())
                    .header(AUTHORIZATION, authorization.as_str())
                    .header(COOKIE, cookie.as_str())
                    .header("x-csrf-token", csrf.as_str())
            })
            .await?;

        let payload: JsonValue = serde_json::from_slice(&resp.body)
            .map_err(|e| EnrichError::Transient(format!("decoding detail payload: {e}")))?;
        if payload.get("data").is_none() {
            let message = payload
                .pointer("/errors/0/message")
                .and_then(JsonValue::as_str)
                .unwrap_or("payload carried no data");
            return Err(EnrichError::Transient(message.to_string()));
        }

        let (post, replies) = parse_tweet_detail(&payload, post_id);
        Ok(TweetDetail {
            post,
            replies,
            payload,
        })
    }
}
