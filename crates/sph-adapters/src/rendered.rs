use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::json;
use sph_core::{Credential, Target};
use sph_storage::HttpFetcher;
use tracing::debug;

use crate::cards::parse_cards;
use crate::{attach_target_context, dedupe_against, AdapterError, HarvestPage, HarvestSource, PageCursor};

pub struct RenderedPageSource {
    fetcher: HttpFetcher,
    render_endpoint: String,
    render_token: Option<String>,
    site_base: String,
    session: Credential,
}

impl RenderedPageSource {
    pub fn new(fetcher: HttpFetcher, render_endpoint: &str, render_token: Option<&str>, site_base: &str) -> Self {
        Self {
            fetcher,
            render_endpoint: render_endpoint.trim_end_matches('/').to_string(),
            render_token: render_token.map(ToString::to_string),
            site_base: site_base.trim_end_matches('/').to_string(),
            session: Credential::default(),
        }
    }

    pub fn with_session(mut self, credential: Credential) -> Self {
        self.session = credential;
        self
    }

    pub fn target_url(&self, target: &Target) -> Result<Url, AdapterError> {
        let parsed = match target {
            Target::Search { .. } => {
                let query = target.search_query().unwrap_or_default();
                Url::parse_with_params(
                    &format!("{}/search", self.site_base),
                    &[("q", query.as_str()), ("f", "live")],
                )
            }
            Target::User { username } => Url::parse(&format!("{}/{username}", self.site_base)),
        };
        parsed.map_err(|e| AdapterError::Message(format!("building target url: {e}")))
    }

    fn render_url(&self) -> String {
        match &self.render_token {
            Some(token) => format!("{}/content?token={token}", self.render_endpoint),
            None => format!("{}/content", self.render_endpoint),
        }
    }

    fn cookie_domain(&self) -> String {
        let host = Url::parse(&self.site_base)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .unwrap_or_default();
        format!(".{host}")
    }
}

#[async_trait]
impl HarvestSource for RenderedPageSource {
    fn name(&self) -> &str {
        "rendered"
    }

    async fn produce(
        &self,
        target: &Target,
        cursor: PageCursor,
        seen: &HashSet<String>,
    ) -> Result<HarvestPage, AdapterError> {
        let url = self.target_url(target)?;
        let domain = self.cookie_domain();
        let cookies: Vec<_> = self
            .session
            .cookies
            .iter()
            .map(|c| json!({ "name": c.name, "value": c.value, "domain": domain, "sameSite": "Lax" }))
            .collect();
        let body = json!({
            "url": url.as_str(),
            "cookies": cookies,
            "scrolls": cursor.scrolls,
            "gotoOptions": { "waitUntil": "domcontentloaded", "timeout": 60_000 },
        });
        let endpoint = self.render_url();

        let resp = self
            .fetcher
            .send("render_listing", |client| client.post(&endpoint).json(&body))
            .await?;
        let html = String::from_utf8_lossy(&resp.body);

        let mut cards = parse_cards(&html, target.language(), &self.site_base)?;
        debug!(harvest_target = %target.label(), scrolls = cursor.scrolls, cards = cards.len(), "rendered listing");
        // An empty search surface has nothing further to scroll into; an empty
        // timeline render may just be slow, so only count it as stagnation.
        let done = cards.is_empty() && matches!(target, Target::Search { .. });
        attach_target_context(&mut cards, target, &self.site_base);

        Ok(HarvestPage {
            records: dedupe_against(cards, seen),
            cursor: cursor.next(),
            done,
        })
    }
}
