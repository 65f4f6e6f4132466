use scraper::{ElementRef, Html, Selector};
use sph_core::{parse_platform_timestamp, RawPost};

use crate::AdapterError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CardMetrics {
    pub reply_count: Option<i64>,
    pub like_count: Option<i64>,
    pub view_count: Option<i64>,
    pub repost_count: Option<i64>,
}

const REPLY_WORDS: &[&str] = &["reply", "replies", "trả lời"];
const LIKE_WORDS: &[&str] = &["like", "likes", "thích"];
const VIEW_WORDS: &[&str] = &["view", "views", "lượt xem", "xem"];
const REPOST_WORDS: &[&str] = &["repost", "reposts", "retweet", "retweets", "chia sẻ"];

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub fn post_id_from_href(href: &str) -> Option<String> {
    let (_, rest) = href.split_once("/status/")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

pub fn parse_metrics_from_aria(aria: Option<&str>) -> CardMetrics {
    let mut out = CardMetrics::default();
    let Some(aria) = aria else {
        return out;
    };
    let lower = aria.to_lowercase();
    for part in lower.split(',').map(str::trim) {
        let Some(n) = leading_count(part) else {
            continue;
        };
        let has = |words: &[&str]| words.iter().any(|w| part.contains(w));
        if has(REPLY_WORDS) {
            out.reply_count = Some(n);
        } else if has(LIKE_WORDS) {
            out.like_count = Some(n);
        } else if has(VIEW_WORDS) {
            out.view_count = Some(n);
        } else if has(REPOST_WORDS) {
            out.repost_count = Some(n);
        }
    }
    out
}

// First run of digits in `part`, with `.` and space group separators folded away.
fn leading_count(part: &str) -> Option<i64> {
    let start = part.find(|c: char| c.is_ascii_digit())?;
    let digits: String = part[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ' ')
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

pub fn parse_cards(html: &str, lang: Option<&str>, site_base: &str) -> Result<Vec<RawPost>, AdapterError> {
    let document = Html::parse_document(html);
    let article = selector("article[role='article']")?;
    let fallback = selector("div[data-testid='tweet']")?;

    let mut cards: Vec<ElementRef<'_>> = document.select(&article).collect();
    if cards.is_empty() {
        cards = document.select(&fallback).collect();
    }

    let status_link = selector("a[href*='/status/']")?;
    let time = selector("time[datetime]")?;
    let body_text = selector("div[data-testid='tweetText']")?;
    let profile_link = selector("a[href^='/']")?;
    let metrics_group = selector("div[role='group'][aria-label]")?;
    let base = site_base.trim_end_matches('/');

    let mut rows = Vec::with_capacity(cards.len());
    for card in cards {
        let Some(href) = card
            .select(&status_link)
            .next()
            .and_then(|a| a.value().attr("href"))
        else {
            continue;
        };
        let Some(post_id) = post_id_from_href(href) else {
            continue;
        };

        let created_at = card
            .select(&time)
            .next()
            .and_then(|t| t.value().attr("datetime"))
            .and_then(parse_platform_timestamp);
        let text = card
            .select(&body_text)
            .next()
            .and_then(|n| text_or_none(n.text().collect::<String>()))
            .or_else(|| text_or_none(card.text().collect::<Vec<_>>().join(" ")));
        let username = card
            .select(&profile_link)
            .filter_map(|a| a.value().attr("href"))
            .map(|h| h.trim_matches('/'))
            .find(|h| !h.is_empty() && !h.contains('/') && !h.contains('?'))
            .map(ToString::to_string);
        let metrics = parse_metrics_from_aria(
            card.select(&metrics_group)
                .next()
                .and_then(|g| g.value().attr("aria-label")),
        );

        let link = if href.starts_with("http") {
            href.to_string()
        } else {
            format!("{base}{href}")
        };

        let mut row = RawPost::new(post_id);
        row.text = text;
        row.language = lang.map(ToString::to_string);
        row.created_at = created_at;
        row.username = username;
        row.like_count = metrics.like_count;
        row.retweet_count = metrics.repost_count;
        row.reply_count = metrics.reply_count;
        row.view_count = metrics.view_count;
        row.urls = vec![href.to_string()];
        row.link = Some(link);
        rows.push(row);
    }
    Ok(rows)
}
