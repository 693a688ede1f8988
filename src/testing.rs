//! Test doubles for the fetch source and the sentiment scorer

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::reddit::{Edited, FetchError, PostType, RawComment, RawPost, RawSubreddit, RedditSource, TimeFilter};
use crate::sentiment::{SentimentAnalyzer, SentimentScores};

/// Scores every text the same way: positive when it contains "good"
pub struct FakeAnalyzer;

impl SentimentAnalyzer for FakeAnalyzer {
    fn analyze(&self, text: &str) -> SentimentScores {
        let compound = if text.contains("good") { 0.5 } else { 0.0 };
        [
            ("neg".to_string(), 0.0),
            ("neu".to_string(), 1.0 - compound),
            ("pos".to_string(), compound),
            ("compound".to_string(), compound),
        ]
        .into_iter()
        .collect()
    }
}

pub fn raw_post(id: &str, title: &str) -> RawPost {
    RawPost {
        id: id.to_string(),
        author: Some("karl".to_string()),
        title: title.to_string(),
        selftext: format!("body of {}", id),
        score: 10,
        upvote_ratio: 0.75,
        created_utc: 1729519800.0,
        num_comments: 4,
        url: Some(format!("https://reddit.com/r/wien/comments/{}", id)),
        all_awardings: Vec::new(),
        edited: Edited::Flag(false),
        link_flair_text: None,
    }
}

pub fn raw_comment(id: &str, parent_id: &str, body: &str) -> RawComment {
    RawComment {
        id: id.to_string(),
        parent_id: parent_id.to_string(),
        depth: if parent_id.starts_with("t1_") { 1 } else { 0 },
        body: body.to_string(),
        author: Some("anna".to_string()),
        score: 3,
        edited: Edited::Flag(false),
        created_utc: 1729520000.0,
    }
}

/// In-memory subreddit with scripted listings and failures
pub struct FakeSource {
    subreddit: RawSubreddit,
    top: Vec<RawPost>,
    rising: Vec<RawPost>,
    comments: HashMap<String, Vec<RawComment>>,
    failing_listings: HashSet<PostType>,
    failing_comments: HashSet<String>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn new(name: &str) -> Self {
        Self {
            subreddit: RawSubreddit {
                id: format!("id_{}", name),
                display_name: name.to_string(),
                description: Some(format!("r/{} description", name)),
                subscribers: Some(1234),
                created_utc: 1200000000.0,
            },
            top: Vec::new(),
            rising: Vec::new(),
            comments: HashMap::new(),
            failing_listings: HashSet::new(),
            failing_comments: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_top(mut self, posts: Vec<RawPost>) -> Self {
        self.top = posts;
        self
    }

    pub fn with_rising(mut self, posts: Vec<RawPost>) -> Self {
        self.rising = posts;
        self
    }

    pub fn with_comments(mut self, post_id: &str, comments: Vec<RawComment>) -> Self {
        self.comments.insert(post_id.to_string(), comments);
        self
    }

    pub fn failing_listing(mut self, kind: PostType) -> Self {
        self.failing_listings.insert(kind);
        self
    }

    pub fn failing_comments(mut self, post_id: &str) -> Self {
        self.failing_comments.insert(post_id.to_string());
        self
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl RedditSource for FakeSource {
    async fn subreddit_about(&self, name: &str) -> Result<RawSubreddit, FetchError> {
        self.record(format!("about:{}", name));
        if name.eq_ignore_ascii_case(&self.subreddit.display_name) {
            Ok(self.subreddit.clone())
        } else {
            Err(FetchError::NotFound(format!("r/{}", name)))
        }
    }

    async fn listing(
        &self,
        name: &str,
        kind: PostType,
        limit: usize,
        time_filter: Option<TimeFilter>,
    ) -> Result<Vec<RawPost>, FetchError> {
        self.record(format!(
            "{}:{}:{}:{}",
            kind,
            name,
            limit,
            time_filter.map(|t| t.as_str()).unwrap_or("-")
        ));

        if self.failing_listings.contains(&kind) {
            return Err(FetchError::Status {
                status: 503,
                url: format!("/r/{}/{}", name, kind),
            });
        }

        let posts = match kind {
            PostType::Top => &self.top,
            PostType::Rising => &self.rising,
        };
        Ok(posts.iter().take(limit).cloned().collect())
    }

    async fn comments(
        &self,
        post_id: &str,
        reply_depth: usize,
        limit: usize,
    ) -> Result<Vec<RawComment>, FetchError> {
        self.record(format!("comments:{}:{}:{}", post_id, reply_depth, limit));

        if self.failing_comments.contains(post_id) {
            return Err(FetchError::Status {
                status: 500,
                url: format!("/comments/{}", post_id),
            });
        }

        Ok(self
            .comments
            .get(post_id)
            .map(|c| c.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
