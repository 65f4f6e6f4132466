use serde_json::Value as JsonValue;
use sph_core::{parse_platform_timestamp, PostRecord, ReplyRecord};

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_at(value, path)?.as_str().map(ToString::to_string)
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => s.parse().ok(),
        _ => None,
    }
}

fn json_bool(value: &JsonValue, path: &[&str]) -> Option<bool> {
    json_at(value, path)?.as_bool()
}

const VIEW_COUNT_PATHS: [&[&str]; 4] = [
    &["views", "count"],
    &["legacy", "views", "count"],
    &["ext_views", "count"],
    &["legacy", "ext_views", "count"],
];

#[derive(Debug, Clone, Default)]
struct TweetItem {
    rest_id: String,
    conversation_id: Option<String>,
    created_at: Option<String>,
    text: Option<String>,
    lang: Option<String>,
    user_id: Option<String>,
    username: Option<String>,
    displayname: Option<String>,
    verified: Option<bool>,
    like_count: Option<i64>,
    reply_count: Option<i64>,
    retweet_count: Option<i64>,
    quote_count: Option<i64>,
    view_count: Option<i64>,
    followers_count: Option<i64>,
    friends_count: Option<i64>,
    favourites_count: Option<i64>,
    listed_count: Option<i64>,
    media_count: Option<i64>,
}

fn extract_tweet_item(item_content: &JsonValue) -> Option<TweetItem> {
    let mut result = json_at(item_content, &["tweet_results", "result"])?;
    match result.get("__typename").and_then(JsonValue::as_str) {
        Some("TweetTombstone") | Some("TweetUnavailable") => return None,
        Some("TweetWithVisibilityResults") => result = result.get("tweet")?,
        _ => {}
    }

    let rest_id = json_str(result, &["rest_id"]).filter(|id| !id.is_empty())?;
    let legacy = result.get("legacy").unwrap_or(&JsonValue::Null);
    let user = json_at(result, &["core", "user_results", "result"]).unwrap_or(&JsonValue::Null);
    let user_legacy = user.get("legacy").unwrap_or(&JsonValue::Null);

    Some(TweetItem {
        rest_id,
        conversation_id: json_str(legacy, &["conversation_id_str"]),
        created_at: json_str(legacy, &["created_at"]),
        text: json_str(legacy, &["full_text"]),
        lang: json_str(legacy, &["lang"]),
        user_id: json_str(user, &["rest_id"]),
        username: json_str(user, &["core", "screen_name"])
            .or_else(|| json_str(user_legacy, &["screen_name"])),
        displayname: json_str(user, &["core", "name"]).or_else(|| json_str(user_legacy, &["name"])),
        verified: json_bool(user, &["is_blue_verified"])
            .or_else(|| json_bool(user_legacy, &["verified"])),
        like_count: json_i64(legacy, &["favorite_count"]),
        reply_count: json_i64(legacy, &["reply_count"]),
        retweet_count: json_i64(legacy, &["retweet_count"]),
        quote_count: json_i64(legacy, &["quote_count"]),
        view_count: VIEW_COUNT_PATHS.iter().find_map(|p| json_i64(result, p)),
        followers_count: json_i64(user_legacy, &["followers_count"]),
        friends_count: json_i64(user_legacy, &["friends_count"]),
        favourites_count: json_i64(user_legacy, &["favourites_count"]),
        listed_count: json_i64(user_legacy, &["listed_count"]),
        media_count: json_i64(user_legacy, &["media_count"]),
    })
}

impl TweetItem {
    fn into_post(self) -> PostRecord {
        PostRecord {
            post_id: self.rest_id,
            created_at: self.created_at.as_deref().and_then(parse_platform_timestamp),
            text: self.text,
            lang: self.lang,
            link: None,
            user_id: self.user_id,
            username: self.username,
            displayname: self.displayname,
            verified: self.verified,
            followers_count: self.followers_count,
            friends_count: self.friends_count,
            favourites_count: self.favourites_count,
            listed_count: self.listed_count,
            media_count: self.media_count,
            like_count: self.like_count,
            reply_count: self.reply_count,
            retweet_count: self.retweet_count,
            quote_count: self.quote_count,
            view_count: self.view_count,
        }
    }

    fn into_reply(self, root_id: Option<&str>) -> ReplyRecord {
        ReplyRecord {
            post_id: self.conversation_id.or_else(|| root_id.map(ToString::to_string)),
            reply_id: self.rest_id,
            created_at: self.created_at.as_deref().and_then(parse_platform_timestamp),
            text: self.text,
            lang: self.lang,
            user_id: self.user_id,
            username: self.username,
            displayname: self.displayname,
            verified: self.verified,
            followers_count: self.followers_count,
            friends_count: self.friends_count,
            favourites_count: self.favourites_count,
            media_count: self.media_count,
            like_count: self.like_count,
            reply_count: self.reply_count,
            retweet_count: self.retweet_count,
            quote_count: self.quote_count,
            view_count: self.view_count,
        }
    }
}

fn instructions(payload: &JsonValue) -> &[JsonValue] {
    ["threaded_conversation_with_injections_v2", "threaded_conversation_with_injections"]
        .iter()
        .find_map(|key| json_at(payload, &["data", *key, "instructions"]))
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

pub fn parse_tweet_detail(payload: &JsonValue, focal_id: &str) -> (Option<PostRecord>, Vec<ReplyRecord>) {
    let mut main: Option<TweetItem> = None;
    let mut reply_items = Vec::new();

    for inst in instructions(payload) {
        let Some(entries) = inst.get("entries").and_then(JsonValue::as_array) else {
            continue;
        };
        for entry in entries {
            let entry_id = entry.get("entryId").and_then(JsonValue::as_str).unwrap_or_default();
            if entry_id.starts_with("tweet-") {
                let Some(item) = json_at(entry, &["content", "itemContent"]).and_then(extract_tweet_item) else {
                    continue;
                };
                let is_focal = item.rest_id == focal_id;
                let main_is_focal = main.as_ref().is_some_and(|m| m.rest_id == focal_id);
                if is_focal || !main_is_focal {
                    main = Some(item);
                }
            } else if entry_id.starts_with("conversationthread-") {
                let items = json_at(entry, &["content", "items"])
                    .and_then(JsonValue::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                reply_items.extend(
                    items
                        .iter()
                        .filter_map(|it| json_at(it, &["item", "itemContent"]))
                        .filter_map(extract_tweet_item),
                );
            }
        }
    }

    let root_id = main.as_ref().map(|m| m.rest_id.clone());
    let replies = reply_items
        .into_iter()
        .map(|item| item.into_reply(root_id.as_deref()))
        .collect();
    (main.map(TweetItem::into_post), replies)
}
