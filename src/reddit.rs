//! Reddit fetch source
//!
//! `RedditSource` is the seam between the collector and the platform: the
//! pipeline only sees raw subreddit/post/comment items. `RedditClient` is the
//! production implementation over the OAuth JSON API; tests substitute fakes.

use async_trait::async_trait;
use governor::{Quota, RateLimiter as GovRateLimiter};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const AUTH_URL: &str = "https://www.reddit.com/api/v1/access_token";
const API_BASE: &str = "https://oauth.reddit.com";

/// Refresh the bearer token this long before it actually expires
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

static SUBREDDIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_]{1,20}$").expect("valid subreddit regex"));

/// Subreddit names as the platform allows them
pub fn is_valid_subreddit_name(name: &str) -> bool {
    SUBREDDIT_RE.is_match(name)
}

/// Errors from the fetch source
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("reddit returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("missing credentials: {0}")]
    Credentials(String),
}

/// Which listing a post was collected from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostType {
    Top,
    Rising,
}

impl PostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostType::Top => "top",
            PostType::Rising => "rising",
        }
    }
}

impl fmt::Display for PostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "top" => Ok(PostType::Top),
            "rising" => Ok(PostType::Rising),
            other => Err(format!("unknown post type '{}'", other)),
        }
    }
}

/// Time window for the top listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFilter {
    Hour,
    Day,
    Week,
    Month,
    Year,
    All,
}

impl TimeFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFilter::Hour => "hour",
            TimeFilter::Day => "day",
            TimeFilter::Week => "week",
            TimeFilter::Month => "month",
            TimeFilter::Year => "year",
            TimeFilter::All => "all",
        }
    }
}

impl FromStr for TimeFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hour" => Ok(TimeFilter::Hour),
            "day" => Ok(TimeFilter::Day),
            "week" => Ok(TimeFilter::Week),
            "month" => Ok(TimeFilter::Month),
            "year" => Ok(TimeFilter::Year),
            "all" => Ok(TimeFilter::All),
            other => Err(format!("unknown time filter '{}'", other)),
        }
    }
}

/// `edited` is `false` or the edit timestamp
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Edited {
    Flag(bool),
    At(f64),
}

impl Edited {
    pub fn is_edited(&self) -> bool {
        match self {
            Edited::Flag(flag) => *flag,
            Edited::At(_) => true,
        }
    }
}

impl Default for Edited {
    fn default() -> Self {
        Edited::Flag(false)
    }
}

// === Raw platform items ===

#[derive(Debug, Clone, Deserialize)]
pub struct RawSubreddit {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub subscribers: Option<i64>,
    pub created_utc: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPost {
    pub id: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub upvote_ratio: f64,
    pub created_utc: f64,
    #[serde(default)]
    pub num_comments: i64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub all_awardings: Vec<serde_json::Value>,
    #[serde(default)]
    pub edited: Edited,
    #[serde(default)]
    pub link_flair_text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawComment {
    pub id: String,
    /// Tagged reference: `t3_<post>` or `t1_<comment>`
    pub parent_id: String,
    #[serde(default)]
    pub depth: i64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub edited: Edited,
    pub created_utc: f64,
}

/// Source of subreddit metadata, listings and comment trees
#[async_trait]
pub trait RedditSource: Send + Sync {
    async fn subreddit_about(&self, name: &str) -> Result<RawSubreddit, FetchError>;

    /// Up to `limit` posts from the top or rising listing
    async fn listing(
        &self,
        name: &str,
        kind: PostType,
        limit: usize,
        time_filter: Option<TimeFilter>,
    ) -> Result<Vec<RawPost>, FetchError>;

    /// Up to `limit` top-level comments, expanding at most `reply_depth`
    /// "load more comments" placeholders first
    async fn comments(
        &self,
        post_id: &str,
        reply_depth: usize,
        limit: usize,
    ) -> Result<Vec<RawComment>, FetchError>;
}

/// Script-app credentials for the password grant
#[derive(Debug, Clone)]
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub user_agent: Option<String>,
}

impl RedditCredentials {
    /// Read CLIENT_ID, SECRET_KEY, REDDIT_USERNAME, REDDIT_PW (and optional USER_AGENT)
    pub fn from_env() -> Result<Self, FetchError> {
        let mut missing = Vec::new();
        let mut var = |key: &str| match std::env::var(key) {
            Ok(value) if !value.is_empty() => value,
            _ => {
                missing.push(key.to_string());
                String::new()
            }
        };

        let client_id = var("CLIENT_ID");
        let client_secret = var("SECRET_KEY");
        let username = var("REDDIT_USERNAME");
        let password = var("REDDIT_PW");

        if !missing.is_empty() {
            return Err(FetchError::Credentials(missing.join(", ")));
        }

        Ok(Self {
            client_id,
            client_secret,
            username,
            password,
            user_agent: std::env::var("USER_AGENT").ok().filter(|v| !v.is_empty()),
        })
    }
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct Thing<T> {
    kind: String,
    data: T,
}

#[derive(Deserialize)]
struct Listing<T> {
    children: Vec<Thing<T>>,
}

#[derive(Deserialize)]
struct MoreChildren {
    #[serde(default)]
    parent_id: String,
    #[serde(default)]
    children: Vec<String>,
}

#[derive(Deserialize)]
struct MoreChildrenResponse {
    json: MoreChildrenJson,
}

#[derive(Deserialize)]
struct MoreChildrenJson {
    #[serde(default)]
    data: Option<MoreChildrenData>,
}

#[derive(Deserialize)]
struct MoreChildrenData {
    #[serde(default)]
    things: Vec<Thing<serde_json::Value>>,
}

/// OAuth client for the Reddit JSON API
pub struct RedditClient {
    client: Client,
    rate_limiter: GovRateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>,
    credentials: RedditCredentials,
    token: Mutex<Option<AccessToken>>,
}

impl RedditClient {
    /// Create a client; `user_agent` is used unless the credentials override it
    pub fn new(credentials: RedditCredentials, user_agent: &str, rate_limit_per_second: u32) -> Result<Self, FetchError> {
        let agent = credentials.user_agent.clone().unwrap_or_else(|| user_agent.to_string());
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .gzip(true)
            .user_agent(agent)
            .build()?;

        let per_second = NonZeroU32::new(rate_limit_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = GovRateLimiter::direct(Quota::per_second(per_second));

        Ok(Self {
            client,
            rate_limiter,
            credentials,
            token: Mutex::new(None),
        })
    }

    /// Return a valid bearer token, requesting a new one when needed
    async fn bearer_token(&self) -> Result<String, FetchError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(token.value.clone());
            }
        }

        self.rate_limiter.until_ready().await;
        debug!("Requesting reddit access token");

        let response = self
            .client
            .post(AUTH_URL)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&[
                ("grant_type", "password"),
                ("username", self.credentials.username.as_str()),
                ("password", self.credentials.password.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Auth(format!("token endpoint returned {}", response.status())));
        }

        let body: TokenResponse = serde_json::from_str(&response.text().await?)?;
        let value = match (body.access_token, body.error) {
            (Some(value), None) => value,
            (_, Some(error)) => return Err(FetchError::Auth(error)),
            (None, None) => return Err(FetchError::Auth("no access token in response".to_string())),
        };

        info!("Reddit access token acquired (expires in {}s)", body.expires_in);
        *guard = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        });

        Ok(value)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, FetchError> {
        let token = self.bearer_token().await?;
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", API_BASE, path);
        debug!("Fetching {} {:?}", url, query);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[("raw_json", "1")])
            .query(query)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => return Err(FetchError::NotFound(path.to_string())),
            status => {
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    url,
                })
            }
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Expand one "load more comments" placeholder
    async fn more_children(&self, post_id: &str, children: &[String]) -> Result<Vec<Thing<serde_json::Value>>, FetchError> {
        let response: MoreChildrenResponse = self
            .get_json(
                "/api/morechildren",
                &[
                    ("api_type", "json".to_string()),
                    ("link_id", format!("t3_{}", post_id)),
                    ("children", children.join(",")),
                    ("limit_children", "false".to_string()),
                ],
            )
            .await?;

        Ok(response.json.data.map(|d| d.things).unwrap_or_default())
    }
}

#[async_trait]
impl RedditSource for RedditClient {
    async fn subreddit_about(&self, name: &str) -> Result<RawSubreddit, FetchError> {
        let thing: Thing<serde_json::Value> = self.get_json(&format!("/r/{}/about", name), &[]).await?;

        // Unknown names come back as an empty search listing instead of a 404
        if thing.kind != "t5" {
            return Err(FetchError::NotFound(format!("r/{}", name)));
        }

        Ok(serde_json::from_value(thing.data)?)
    }

    async fn listing(
        &self,
        name: &str,
        kind: PostType,
        limit: usize,
        time_filter: Option<TimeFilter>,
    ) -> Result<Vec<RawPost>, FetchError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(filter) = time_filter {
            query.push(("t", filter.as_str().to_string()));
        }

        let thing: Thing<Listing<serde_json::Value>> =
            self.get_json(&format!("/r/{}/{}", name, kind.as_str()), &query).await?;

        let mut posts = Vec::new();
        for child in thing.data.children.into_iter().filter(|c| c.kind == "t3") {
            match serde_json::from_value::<RawPost>(child.data) {
                Ok(post) => posts.push(post),
                Err(e) => warn!("Skipping undecodable post in r/{} {}: {}", name, kind, e),
            }
        }
        posts.truncate(limit);

        Ok(posts)
    }

    async fn comments(
        &self,
        post_id: &str,
        reply_depth: usize,
        limit: usize,
    ) -> Result<Vec<RawComment>, FetchError> {
        let top_level_parent = format!("t3_{}", post_id);

        // Response is [post listing, comment listing]
        let (_, tree): (Thing<serde_json::Value>, Thing<Listing<serde_json::Value>>) = self
            .get_json(&format!("/comments/{}", post_id), &[("limit", limit.to_string())])
            .await?;

        let mut comments = Vec::new();
        let mut placeholders = VecDeque::new();
        collect_top_level(tree.data.children, &top_level_parent, &mut comments, &mut placeholders);

        let expanded = expand_placeholders(
            reply_depth,
            &top_level_parent,
            &mut comments,
            &mut placeholders,
            move |children| async move { self.more_children(post_id, &children).await },
        )
        .await;
        debug!("Post {}: expanded {} \"more\" placeholders", post_id, expanded);

        comments.truncate(limit);
        Ok(comments)
    }
}

/// Expand at most `reply_depth` queued placeholders in order, adding the
/// top-level comments (and further placeholders) they return. A placeholder
/// that fails to expand is logged and still counts. Returns the number tried.
async fn expand_placeholders<F, Fut>(
    reply_depth: usize,
    top_level_parent: &str,
    comments: &mut Vec<RawComment>,
    placeholders: &mut VecDeque<MoreChildren>,
    mut fetch_more: F,
) -> usize
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = Result<Vec<Thing<serde_json::Value>>, FetchError>>,
{
    let mut expanded = 0;
    while expanded < reply_depth {
        let Some(more) = placeholders.pop_front() else {
            break;
        };
        expanded += 1;

        match fetch_more(more.children).await {
            Ok(things) => collect_top_level(things, top_level_parent, comments, placeholders),
            Err(e) => warn!("Failed to expand more comments under {}: {}", top_level_parent, e),
        }
    }
    expanded
}

/// Keep top-level comments and top-level "more" placeholders
fn collect_top_level(
    things: Vec<Thing<serde_json::Value>>,
    top_level_parent: &str,
    comments: &mut Vec<RawComment>,
    placeholders: &mut VecDeque<MoreChildren>,
) {
    for thing in things {
        match thing.kind.as_str() {
            "t1" => match serde_json::from_value::<RawComment>(thing.data) {
                Ok(comment) if comment.parent_id == top_level_parent => comments.push(comment),
                Ok(_) => {}
                Err(e) => warn!("Skipping undecodable comment: {}", e),
            },
            "more" => {
                if let Ok(more) = serde_json::from_value::<MoreChildren>(thing.data) {
                    // Empty "continue this thread" stubs cannot be expanded
                    if more.parent_id == top_level_parent && !more.children.is_empty() {
                        placeholders.push_back(more);
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subreddit_names() {
        assert!(is_valid_subreddit_name("wien"));
        assert!(is_valid_subreddit_name("Austria_Memes"));
        assert!(!is_valid_subreddit_name("w"));
        assert!(!is_valid_subreddit_name("../etc"));
        assert!(!is_valid_subreddit_name("wien/about?x=1"));
        assert!(!is_valid_subreddit_name(&"a".repeat(30)));
    }

    #[test]
    fn test_edited_flag_or_timestamp() {
        let flag: Edited = serde_json::from_value(json!(false)).unwrap();
        let at: Edited = serde_json::from_value(json!(1729519900.0)).unwrap();
        assert!(!flag.is_edited());
        assert!(at.is_edited());
    }

    #[test]
    fn test_raw_post_defaults() {
        let post: RawPost = serde_json::from_value(json!({
            "id": "abc",
            "author": null,
            "title": "foodora mal wieder",
            "created_utc": 1729519800.0,
            "link_flair_text": null
        }))
        .unwrap();

        assert_eq!(post.id, "abc");
        assert!(post.author.is_none());
        assert_eq!(post.num_comments, 0);
        assert!(!post.edited.is_edited());
        assert!(post.all_awardings.is_empty());
    }

    fn top_level_comment(id: &str) -> Thing<serde_json::Value> {
        serde_json::from_value(json!({
            "kind": "t1",
            "data": {"id": id, "parent_id": "t3_p", "body": "text", "created_utc": 1.0}
        }))
        .unwrap()
    }

    fn more(children: &[&str]) -> MoreChildren {
        MoreChildren {
            parent_id: "t3_p".to_string(),
            children: children.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Each placeholder child id expands to one comment with the same id;
    /// "bad" fails and "nested" also yields another placeholder
    async fn expand(reply_depth: usize, queue: Vec<MoreChildren>) -> (usize, Vec<String>, Vec<Vec<String>>, usize) {
        let mut comments = Vec::new();
        let mut placeholders: VecDeque<MoreChildren> = queue.into();
        let mut requested = Vec::new();

        let expanded = expand_placeholders(reply_depth, "t3_p", &mut comments, &mut placeholders, |children| {
            requested.push(children.clone());
            let result = if children.iter().any(|c| c == "bad") {
                Err(FetchError::Status {
                    status: 500,
                    url: "/api/morechildren".to_string(),
                })
            } else {
                let mut things: Vec<_> = children.iter().map(|c| top_level_comment(c)).collect();
                if children.iter().any(|c| c == "nested") {
                    things.push(
                        serde_json::from_value(json!({
                            "kind": "more",
                            "data": {"parent_id": "t3_p", "children": ["deep"]}
                        }))
                        .unwrap(),
                    );
                }
                Ok(things)
            };
            std::future::ready(result)
        })
        .await;

        let ids = comments.into_iter().map(|c| c.id).collect();
        (expanded, ids, requested, placeholders.len())
    }

    #[tokio::test]
    async fn test_reply_depth_zero_expands_nothing() {
        let (expanded, ids, requested, left) = expand(0, vec![more(&["a"]), more(&["b"])]).await;
        assert_eq!(expanded, 0);
        assert!(ids.is_empty());
        assert!(requested.is_empty());
        assert_eq!(left, 2);
    }

    #[tokio::test]
    async fn test_reply_depth_one_expands_first_placeholder() {
        let (expanded, ids, requested, left) = expand(1, vec![more(&["a", "b"]), more(&["c"])]).await;
        assert_eq!(expanded, 1);
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(requested, vec![vec!["a".to_string(), "b".to_string()]]);
        assert_eq!(left, 1);
    }

    #[tokio::test]
    async fn test_reply_depth_caps_expansions_including_new_placeholders() {
        let (expanded, ids, requested, left) = expand(3, vec![more(&["nested"]), more(&["b"]), more(&["c"])]).await;
        assert_eq!(expanded, 3);
        assert_eq!(ids, vec!["nested", "b", "c"]);
        assert_eq!(requested.len(), 3);
        // The placeholder returned by "nested" is queued behind the others
        assert_eq!(left, 1);

        let (expanded, ids, _, left) = expand(10, vec![more(&["nested"])]).await;
        assert_eq!(expanded, 2);
        assert_eq!(ids, vec!["nested", "deep"]);
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn test_failed_placeholder_counts_and_next_is_expanded() {
        let (expanded, ids, requested, left) = expand(2, vec![more(&["bad"]), more(&["b"])]).await;
        assert_eq!(expanded, 2);
        assert_eq!(ids, vec!["b"]);
        assert_eq!(requested.len(), 2);
        assert_eq!(left, 0);
    }

    #[test]
    fn test_collect_top_level_filters_replies_and_queues_more() {
        let things: Vec<Thing<serde_json::Value>> = serde_json::from_value(json!([
            {"kind": "t1", "data": {"id": "c1", "parent_id": "t3_p", "body": "hi", "created_utc": 1.0}},
            {"kind": "t1", "data": {"id": "c2", "parent_id": "t1_c1", "body": "reply", "depth": 1, "created_utc": 2.0}},
            {"kind": "more", "data": {"parent_id": "t3_p", "children": ["c3", "c4"], "count": 2}},
            {"kind": "more", "data": {"parent_id": "t3_p", "children": [], "count": 0}}
        ]))
        .unwrap();

        let mut comments = Vec::new();
        let mut placeholders = VecDeque::new();
        collect_top_level(things, "t3_p", &mut comments, &mut placeholders);

        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].id, "c1");
        assert_eq!(placeholders.len(), 1);
        assert_eq!(placeholders[0].children, vec!["c3", "c4"]);
    }

    #[test]
    fn test_time_filter_parse() {
        assert_eq!("ALL".parse::<TimeFilter>().unwrap(), TimeFilter::All);
        assert_eq!("week".parse::<TimeFilter>().unwrap(), TimeFilter::Week);
        assert!("fortnight".parse::<TimeFilter>().is_err());
        assert_eq!("rising".parse::<PostType>().unwrap(), PostType::Rising);
    }
}
