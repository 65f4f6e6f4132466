use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "sph-core";

pub const PLATFORM: &str = "twitter";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPost {
    pub platform: String,
    pub post_id: String,
    pub text: Option<String>,
    pub language: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub username: Option<String>,
    pub like_count: Option<i64>,
    pub retweet_count: Option<i64>,
    pub reply_count: Option<i64>,
    pub view_count: Option<i64>,
    #[serde(default)]
    pub urls: Vec<String>,
    pub link: Option<String>,
}

impl RawPost {
    pub fn new(post_id: impl Into<String>) -> Self {
        Self {
            platform: PLATFORM.to_string(),
            post_id: post_id.into(),
            text: None,
            language: None,
            created_at: None,
            username: None,
            like_count: None,
            retweet_count: None,
            reply_count: None,
            view_count: None,
            urls: Vec::new(),
            link: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PostRecord {
    pub post_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub lang: Option<String>,
    pub link: Option<String>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub displayname: Option<String>,
    pub verified: Option<bool>,
    pub followers_count: Option<i64>,
    pub friends_count: Option<i64>,
    pub favourites_count: Option<i64>,
    pub listed_count: Option<i64>,
    pub media_count: Option<i64>,
    pub like_count: Option<i64>,
    pub reply_count: Option<i64>,
    pub retweet_count: Option<i64>,
    pub quote_count: Option<i64>,
    pub view_count: Option<i64>,
}

impl From<&RawPost> for PostRecord {
    fn from(raw: &RawPost) -> Self {
        Self {
            post_id: raw.post_id.clone(),
            created_at: raw.created_at,
            text: raw.text.clone(),
            lang: raw.language.clone(),
            link: raw.link.clone(),
            username: raw.username.clone(),
            like_count: raw.like_count,
            reply_count: raw.reply_count,
            retweet_count: raw.retweet_count,
            view_count: raw.view_count,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReplyRecord {
    pub reply_id: String,
    pub post_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub lang: Option<String>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub displayname: Option<String>,
    pub verified: Option<bool>,
    pub followers_count: Option<i64>,
    pub friends_count: Option<i64>,
    pub favourites_count: Option<i64>,
    pub media_count: Option<i64>,
    pub like_count: Option<i64>,
    pub reply_count: Option<i64>,
    pub retweet_count: Option<i64>,
    pub quote_count: Option<i64>,
    pub view_count: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Posts,
    Replies,
}

impl TableKind {
    pub fn table_name(self) -> &'static str {
        match self {
            TableKind::Posts => "posts",
            TableKind::Replies => "post_replies",
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Search {
        query: String,
        #[serde(default)]
        lang: Option<String>,
    },
    User {
        username: String,
    },
}

impl Target {
    pub fn search(query: impl Into<String>, lang: Option<&str>) -> Self {
        Target::Search {
            query: query.into(),
            lang: lang.map(ToString::to_string),
        }
    }

    pub fn user(username: impl Into<String>) -> Self {
        Target::User {
            username: username.into().trim_start_matches('@').to_string(),
        }
    }

    pub fn with_default_lang(self, default: &str) -> Self {
        match self {
            Target::Search { query, lang: None } if !default.trim().is_empty() => Target::Search {
                query,
                lang: Some(default.trim().to_string()),
            },
            other => other,
        }
    }

    pub fn search_query(&self) -> Option<String> {
        match self {
            Target::Search { query, lang } => {
                let query = query.trim();
                match lang.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
                    Some(lang) if !query.contains(&format!("lang:{lang}")) => {
                        Some(format!("{query} lang:{lang}"))
                    }
                    _ => Some(query.to_string()),
                }
            }
            Target::User { .. } => None,
        }
    }

    pub fn language(&self) -> Option<&str> {
        match self {
            Target::Search { lang, .. } => lang.as_deref(),
            Target::User { .. } => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Target::Search { .. } => format!("search:{}", self.search_query().unwrap_or_default()),
            Target::User { username } => format!("user:@{username}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookiePair {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credential {
    pub cookies: Vec<CookiePair>,
    pub bearer: String,
}

impl Credential {
    pub fn new(cookies: Vec<CookiePair>, bearer: impl Into<String>) -> Self {
        Self {
            cookies,
            bearer: bearer.into(),
        }
    }

    pub fn from_cookie_json(text: &str, bearer: impl Into<String>) -> serde_json::Result<Self> {
        let cookies: Vec<CookiePair> = serde_json::from_str(text)?;
        Ok(Self::new(cookies, bearer))
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn cookie_value(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value.as_str())
    }

    pub fn csrf_token(&self) -> &str {
        self.cookie_value("ct0").unwrap_or_default()
    }

    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn authorization(&self) -> String {
        let bearer = self.bearer.trim();
        if bearer.is_empty() || bearer.starts_with("Bearer ") {
            bearer.to_string()
        } else {
            format!("Bearer {bearer}")
        }
    }
}

pub fn parse_platform_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%a %b %d %H:%M:%S %z %Y"))
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
