//! One collection run for one subreddit
//!
//! Order: metadata, then top posts with their comments, then rising posts
//! with their comments. Metadata is the only fatal step. A failed listing ends
//! its own stage and the other stage still runs; a failed comment fetch for
//! one post is counted and the next post is processed.

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::CollectorConfig;
use crate::db::{Database, SharedDatabase};
use crate::fetcher::{fetch_comments, fetch_rising_posts, fetch_subreddit_metadata, fetch_top_posts, PostRecord};
use crate::reddit::{is_valid_subreddit_name, FetchError, PostType, RedditSource, TimeFilter};
use crate::sentiment::SentimentAnalyzer;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid subreddit name '{0}'")]
    InvalidName(String),

    #[error("could not fetch subreddit metadata: {0}")]
    Metadata(#[from] FetchError),

    #[error("storage failure: {0}")]
    Storage(anyhow::Error),
}

/// Overall outcome reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    #[serde(rename = "failure")]
    Failed,
}

/// Counters for the top or rising stage
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StageReport {
    pub post_type: PostType,
    pub posts_fetched: usize,
    pub posts_skipped: usize,
    pub posts_inserted: usize,
    pub posts_already_present: usize,
    pub post_snapshots: usize,
    pub comments_fetched: usize,
    pub comments_skipped: usize,
    pub comments_inserted: usize,
    pub comments_already_present: usize,
    pub comment_snapshots: usize,
    /// Posts whose comments could not be collected
    pub comment_failures: usize,
    /// Set when the stage ended early
    pub error: Option<String>,
}

impl StageReport {
    fn new(post_type: PostType) -> Self {
        Self {
            post_type,
            posts_fetched: 0,
            posts_skipped: 0,
            posts_inserted: 0,
            posts_already_present: 0,
            post_snapshots: 0,
            comments_fetched: 0,
            comments_skipped: 0,
            comments_inserted: 0,
            comments_already_present: 0,
            comment_snapshots: 0,
            comment_failures: 0,
            error: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// Whether this stage wrote any row
    pub fn persisted_anything(&self) -> bool {
        self.posts_inserted + self.post_snapshots + self.comments_inserted + self.comment_snapshots > 0
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunReport {
    pub subreddit: String,
    pub subreddit_id: String,
    pub top: StageReport,
    pub rising: StageReport,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        match (self.top.failed(), self.rising.failed()) {
            (true, true) => RunStatus::Failed,
            (false, false) if self.top.comment_failures + self.rising.comment_failures == 0 => RunStatus::Success,
            _ => RunStatus::Partial,
        }
    }

    pub fn persisted_anything(&self) -> bool {
        self.top.persisted_anything() || self.rising.persisted_anything()
    }
}

/// Anything that can run a collection for a subreddit name
#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(&self, subreddit: &str) -> Result<RunReport, PipelineError>;
}

pub struct Pipeline<S, A> {
    source: S,
    analyzer: A,
    db: SharedDatabase,
    config: CollectorConfig,
    time_filter: TimeFilter,
}

impl<S: RedditSource, A: SentimentAnalyzer> Pipeline<S, A> {
    pub fn new(source: S, analyzer: A, db: SharedDatabase, config: CollectorConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let time_filter = config.time_filter()?;
        Ok(Self {
            source,
            analyzer,
            db,
            config,
            time_filter,
        })
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Run every stage for `name` and report what was stored
    pub async fn run(&self, name: &str) -> Result<RunReport, PipelineError> {
        if !is_valid_subreddit_name(name) {
            error!("Refusing to collect invalid subreddit name '{}'", name);
            return Err(PipelineError::InvalidName(name.to_string()));
        }
        info!("Starting collection run for r/{}", name);

        let meta = fetch_subreddit_metadata(&self.source, name).await.map_err(|e| {
            error!("Aborting run for r/{}: {}", name, e);
            PipelineError::Metadata(e)
        })?;
        self.with_db(|db| db.insert_subreddit(&meta))
            .map_err(PipelineError::Storage)?;

        let top = self.run_stage(&meta.name, &meta.id, PostType::Top).await;
        let rising = self.run_stage(&meta.name, &meta.id, PostType::Rising).await;

        let report = RunReport {
            subreddit: meta.name,
            subreddit_id: meta.id,
            top,
            rising,
        };

        info!(
            "Run for r/{} finished ({:?}): {} top / {} rising posts stored",
            report.subreddit,
            report.status(),
            report.top.posts_inserted + report.top.posts_already_present,
            report.rising.posts_inserted + report.rising.posts_already_present
        );
        Ok(report)
    }

    async fn run_stage(&self, name: &str, subreddit_id: &str, post_type: PostType) -> StageReport {
        let mut report = StageReport::new(post_type);

        let fetched = match post_type {
            PostType::Top => {
                fetch_top_posts(&self.source, &self.analyzer, name, self.config.top_limit, self.time_filter).await
            }
            PostType::Rising => fetch_rising_posts(&self.source, &self.analyzer, name, self.config.rising_limit).await,
        };
        let batch = match fetched {
            Ok(batch) => batch,
            Err(e) => {
                error!("{} stage for r/{} failed: {}", post_type, name, e);
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.posts_fetched = batch.items.len();
        report.posts_skipped = batch.skipped;

        let stored = match self.with_db(|db| db.insert_posts(&batch.items, subreddit_id, post_type)) {
            Ok(stored) => stored,
            Err(e) => {
                error!("Storing {} posts for r/{} failed: {}", post_type, name, e);
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.posts_inserted = stored.inserted.len();
        report.posts_already_present = stored.already_present.len();

        // Snapshots only for posts with a base row
        let posts: Vec<PostRecord> = batch.items.into_iter().filter(|p| stored.is_stored(&p.id)).collect();

        match self.with_db(|db| db.insert_post_sentiment_snapshots(&posts)) {
            Ok(count) => report.post_snapshots = count,
            Err(e) => {
                error!("Storing {} post snapshots for r/{} failed: {}", post_type, name, e);
                report.error = Some(e.to_string());
                return report;
            }
        }

        for post in &posts {
            if let Err(e) = self.collect_comments(&post.id, &mut report).await {
                warn!("Comments of post {} not collected: {}", post.id, e);
                report.comment_failures += 1;
            }
        }

        report
    }

    async fn collect_comments(&self, post_id: &str, report: &mut StageReport) -> anyhow::Result<()> {
        let batch = fetch_comments(
            &self.source,
            &self.analyzer,
            post_id,
            self.config.reply_depth,
            self.config.comment_limit,
        )
        .await?;
        report.comments_fetched += batch.items.len();
        report.comments_skipped += batch.skipped;

        let stored = self.with_db(|db| db.insert_comments(&batch.items, post_id))?;
        report.comments_inserted += stored.inserted.len();
        report.comments_already_present += stored.already_present.len();
        report.comments_skipped += stored.rejected.len();

        let comments: Vec<_> = batch.items.into_iter().filter(|c| stored.is_stored(&c.id)).collect();
        report.comment_snapshots += self.with_db(|db| db.insert_comment_sentiment_snapshots(&comments))?;

        Ok(())
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let db = self.db.lock().map_err(|_| anyhow!("database lock poisoned"))?;
        f(&db)
    }
}

#[async_trait]
impl<S: RedditSource, A: SentimentAnalyzer> Collector for Pipeline<S, A> {
    async fn collect(&self, subreddit: &str) -> Result<RunReport, PipelineError> {
        self.run(subreddit).await
    }
}
