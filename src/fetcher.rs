//! Fetch and normalize subreddit metadata, posts and comments
//!
//! Each fetcher calls the `RedditSource`, turns raw items into plain records,
//! and attaches sentiment scores. A listing-level failure is returned as a
//! `FetchError`; a single bad item is logged, counted and skipped so the rest
//! of the batch is still collected.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::display_time::{epoch_to_utc, to_display_time, TimeError};
use crate::reddit::{FetchError, PostType, RawComment, RawPost, RawSubreddit, RedditSource, TimeFilter};
use crate::sentiment::{SentimentAnalyzer, SentimentScores};

/// Hard cap on items requested from any listing
pub const MAX_FETCH_LIMIT: usize = 100;

const DELETED_POST_AUTHOR: &str = "N/A";
const DELETED_COMMENT_AUTHOR: &str = "[deleted]";

/// Failure to normalize one raw item
#[derive(Debug, Error, PartialEq)]
pub enum ItemError {
    #[error("item has no id")]
    MissingId,

    #[error("invalid upvote ratio {0}")]
    InvalidUpvoteRatio(f64),

    #[error("invalid creation time: {0}")]
    InvalidTime(#[from] TimeError),

    #[error("unrecognized parent reference '{0}'")]
    UnknownParent(String),
}

/// Items that normalized cleanly plus how many were dropped
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub skipped: usize,
}

impl<T> Batch<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self { items: Vec::new(), skipped: 0 }
    }
}

/// Subreddit metadata ready for storage
#[derive(Debug, Clone, PartialEq)]
pub struct SubredditMeta {
    pub id: String,
    pub name: String,
    pub description: String,
    pub subscriber_count: i64,
    pub created_utc: DateTime<Utc>,
}

/// Normalized post with sentiment
#[derive(Debug, Clone, PartialEq)]
pub struct PostRecord {
    pub id: String,
    pub author: String,
    pub created_utc: DateTime<Utc>,
    /// Vienna-local rendering; `None` if conversion failed
    pub created_local: Option<String>,
    pub num_comments: i64,
    pub url: String,
    pub awards: i64,
    pub edited: bool,
    pub flair: Option<String>,
    pub title: String,
    pub title_sentiment: SentimentScores,
    pub selftext: String,
    pub body_sentiment: SentimentScores,
    pub score: i64,
    pub upvote_ratio: f64,
    pub controversiality: f64,
}

/// Where a comment hangs in the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentRef {
    /// Top-level: the parent is the post itself
    Post(String),
    /// Reply to another comment
    Comment(String),
}

impl ParentRef {
    /// Split a tagged reference (`t3_…` post, `t1_…` comment)
    pub fn parse(raw: &str) -> Result<Self, ItemError> {
        if let Some(post_id) = raw.strip_prefix("t3_") {
            Ok(ParentRef::Post(post_id.to_string()))
        } else if let Some(comment_id) = raw.strip_prefix("t1_") {
            Ok(ParentRef::Comment(comment_id.to_string()))
        } else {
            Err(ItemError::UnknownParent(raw.to_string()))
        }
    }

    /// Foreign key into the comments table (`None` for top-level comments)
    pub fn parent_comment_id(&self) -> Option<&str> {
        match self {
            ParentRef::Post(_) => None,
            ParentRef::Comment(id) => Some(id),
        }
    }
}

/// Normalized comment with sentiment
#[derive(Debug, Clone, PartialEq)]
pub struct CommentRecord {
    pub id: String,
    pub parent: ParentRef,
    pub depth: i64,
    pub text: String,
    pub author: String,
    pub score: i64,
    pub edited: bool,
    pub created_utc: DateTime<Utc>,
    pub sentiment: SentimentScores,
}

/// (1 - upvote_ratio) * num_comments: engagement with low consensus
pub fn controversiality(upvote_ratio: f64, num_comments: i64) -> f64 {
    (1.0 - upvote_ratio) * num_comments as f64
}

fn author_or(author: Option<&str>, deleted: &str) -> String {
    match author {
        Some(name) if !name.is_empty() && name != "[deleted]" => name.to_string(),
        _ => deleted.to_string(),
    }
}

/// Normalize one raw post and score its title and body
pub fn process_post(post: &RawPost, analyzer: &dyn SentimentAnalyzer) -> Result<PostRecord, ItemError> {
    if post.id.is_empty() {
        return Err(ItemError::MissingId);
    }
    if !(0.0..=1.0).contains(&post.upvote_ratio) {
        return Err(ItemError::InvalidUpvoteRatio(post.upvote_ratio));
    }

    let created_utc = epoch_to_utc(post.created_utc)?;
    let created_local = match to_display_time(post.created_utc) {
        Ok(local) => Some(local),
        Err(e) => {
            warn!("Post {}: {}", post.id, e);
            None
        }
    };

    debug!("Processing post {} '{}'", post.id, post.title);

    Ok(PostRecord {
        id: post.id.clone(),
        author: author_or(post.author.as_deref(), DELETED_POST_AUTHOR),
        created_utc,
        created_local,
        num_comments: post.num_comments,
        url: post.url.clone().unwrap_or_default(),
        awards: post.all_awardings.len() as i64,
        edited: post.edited.is_edited(),
        flair: post.link_flair_text.clone().filter(|f| !f.is_empty()),
        title: post.title.clone(),
        title_sentiment: analyzer.analyze(&post.title),
        selftext: post.selftext.clone(),
        body_sentiment: analyzer.analyze(&post.selftext),
        score: post.score,
        upvote_ratio: post.upvote_ratio,
        controversiality: controversiality(post.upvote_ratio, post.num_comments),
    })
}

/// Normalize one raw comment and score its text
pub fn process_comment(comment: &RawComment, analyzer: &dyn SentimentAnalyzer) -> Result<CommentRecord, ItemError> {
    if comment.id.is_empty() {
        return Err(ItemError::MissingId);
    }

    Ok(CommentRecord {
        id: comment.id.clone(),
        parent: ParentRef::parse(&comment.parent_id)?,
        depth: comment.depth,
        text: comment.body.clone(),
        author: author_or(comment.author.as_deref(), DELETED_COMMENT_AUTHOR),
        score: comment.score,
        edited: comment.edited.is_edited(),
        created_utc: epoch_to_utc(comment.created_utc)?,
        sentiment: analyzer.analyze(&comment.body),
    })
}

fn into_batch<R, T>(raw: &[R], label: &str, mut process: impl FnMut(&R) -> Result<T, ItemError>) -> Batch<T> {
    let mut batch = Batch::default();
    for (index, item) in raw.iter().enumerate() {
        match process(item) {
            Ok(record) => batch.items.push(record),
            Err(e) => {
                warn!("Skipping {} #{}: {}", label, index, e);
                batch.skipped += 1;
            }
        }
    }
    batch
}

/// Fetch metadata for one subreddit
pub async fn fetch_subreddit_metadata(source: &dyn RedditSource, name: &str) -> Result<SubredditMeta, FetchError> {
    let raw: RawSubreddit = source.subreddit_about(name).await?;
    let created_utc = epoch_to_utc(raw.created_utc)
        .map_err(|e| FetchError::NotFound(format!("r/{} has unusable metadata: {}", name, e)))?;

    info!("Subreddit metadata of 'r/{}' fetched", raw.display_name);

    Ok(SubredditMeta {
        id: raw.id,
        name: raw.display_name,
        description: raw.description.unwrap_or_default(),
        subscriber_count: raw.subscribers.unwrap_or(0),
        created_utc,
    })
}

/// Fetch up to `limit` posts from the top listing within `time_filter`
pub async fn fetch_top_posts(
    source: &dyn RedditSource,
    analyzer: &dyn SentimentAnalyzer,
    name: &str,
    limit: usize,
    time_filter: TimeFilter,
) -> Result<Batch<PostRecord>, FetchError> {
    fetch_posts(source, analyzer, name, PostType::Top, limit, Some(time_filter)).await
}

/// Fetch up to `limit` posts from the rising listing
pub async fn fetch_rising_posts(
    source: &dyn RedditSource,
    analyzer: &dyn SentimentAnalyzer,
    name: &str,
    limit: usize,
) -> Result<Batch<PostRecord>, FetchError> {
    fetch_posts(source, analyzer, name, PostType::Rising, limit, None).await
}

async fn fetch_posts(
    source: &dyn RedditSource,
    analyzer: &dyn SentimentAnalyzer,
    name: &str,
    kind: PostType,
    limit: usize,
    time_filter: Option<TimeFilter>,
) -> Result<Batch<PostRecord>, FetchError> {
    let limit = limit.min(MAX_FETCH_LIMIT);
    let mut raw = source.listing(name, kind, limit, time_filter).await?;
    raw.truncate(limit);

    let batch = into_batch(&raw, "post", |post| process_post(post, analyzer));
    info!(
        "{} posts of 'r/{}': {} collected, {} skipped",
        kind,
        name,
        batch.items.len(),
        batch.skipped
    );

    Ok(batch)
}

/// Fetch up to `limit` top-level comments of a post
pub async fn fetch_comments(
    source: &dyn RedditSource,
    analyzer: &dyn SentimentAnalyzer,
    post_id: &str,
    reply_depth: usize,
    limit: usize,
) -> Result<Batch<CommentRecord>, FetchError> {
    let limit = limit.min(MAX_FETCH_LIMIT);
    let mut raw = source.comments(post_id, reply_depth, limit).await?;
    raw.truncate(limit);

    let batch = into_batch(&raw, "comment", |comment| process_comment(comment, analyzer));
    debug!("Fetched {} comments of post {}", batch.items.len(), post_id);

    Ok(batch)
}
