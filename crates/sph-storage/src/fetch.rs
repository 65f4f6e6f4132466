use std::time::Duration;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .map_or(self.max_delay, |factor| self.base_delay.saturating_mul(factor))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: u16,
    pub url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{url} answered {status}")]
    HttpStatus { status: u16, url: String, body: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }

    /// Server faults and dropped connections are worth repeating as-is.
    /// 429, 401 and 403 speak about the credential and go back to the caller.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => (500..600).contains(status),
            FetchError::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, FetchError> {
        let builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        let builder = match config.user_agent {
            Some(agent) => builder.user_agent(agent),
            None => builder,
        };
        Ok(Self {
            client: builder.build()?,
            backoff: config.backoff,
        })
    }

    pub async fn send<F>(&self, label: &str, build: F) -> Result<FetchedBody, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut retry = 0;
        loop {
            match Self::attempt(build(&self.client)).await {
                Err(err) if err.is_transient() && retry < self.backoff.max_retries => {
                    let wait = self.backoff.delay(retry);
                    debug!(label, retry, wait_ms = wait.as_millis() as u64, error = %err, "transient fetch failure");
                    tokio::time::sleep(wait).await;
                    retry += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn attempt(request: reqwest::RequestBuilder) -> Result<FetchedBody, FetchError> {
        let resp = request.send().await?;
        let status = resp.status().as_u16();
        let url = resp.url().to_string();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::HttpStatus { status, url, body });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedBody { status, url, body })
    }
}
