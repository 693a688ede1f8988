//! Database operations for SQLite storage
//!
//! Base rows (subreddits, posts, comments) are insert-if-absent: the first
//! write wins and later runs only log the duplicate. Sentiment snapshots are
//! append-only so repeated runs build a time series per post and comment.
//! Every write method runs in its own transaction; an error rolls back the
//! whole call.

use anyhow::{bail, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::fetcher::{CommentRecord, PostRecord, SubredditMeta};
use crate::reddit::PostType;
use crate::sentiment::SentimentScores;

/// Tables that `count_rows` may be asked about
const TABLES: &[&str] = &[
    "subreddits",
    "posts",
    "post_sentiment_snapshots",
    "comments",
    "comment_sentiment_snapshots",
    "users",
];

/// Database handle shared between the collector and the HTTP surface
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Database handle for SQLite operations
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Create new database connection
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        Ok(Self { conn })
    }

    /// Private in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Wrap for sharing across tasks
    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run database migrations
    pub fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS subreddits (
                id TEXT PRIMARY KEY,             -- platform id, immutable
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                subscriber_count INTEGER,
                created_utc INTEGER,             -- platform creation time (Unix)
                fetched_at INTEGER NOT NULL      -- collection time (Unix)
            );

            CREATE TABLE IF NOT EXISTS posts (
                id TEXT PRIMARY KEY,
                subreddit_id TEXT NOT NULL REFERENCES subreddits(id),
                author TEXT NOT NULL,
                post_type TEXT NOT NULL CHECK(post_type IN ('top', 'rising')),
                title TEXT,
                selftext TEXT,
                url TEXT,
                flair TEXT,
                awards INTEGER DEFAULT 0,
                edited BOOLEAN DEFAULT FALSE,
                created_utc INTEGER NOT NULL,
                created_local TEXT,              -- Vienna display time, NULL if conversion failed
                fetched_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_posts_subreddit ON posts(subreddit_id);
            CREATE INDEX IF NOT EXISTS idx_posts_created ON posts(created_utc);

            -- Append-only, one row per post per collection run
            CREATE TABLE IF NOT EXISTS post_sentiment_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                post_id TEXT NOT NULL REFERENCES posts(id),
                title_sentiment TEXT NOT NULL,   -- JSON object
                body_sentiment TEXT NOT NULL,    -- JSON object
                score INTEGER,
                upvote_ratio REAL,
                controversiality REAL,
                num_comments INTEGER,
                measured_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_post_snapshots_post ON post_sentiment_snapshots(post_id, measured_at);

            CREATE TABLE IF NOT EXISTS comments (
                id TEXT PRIMARY KEY,
                post_id TEXT NOT NULL REFERENCES posts(id),
                parent_comment_id TEXT REFERENCES comments(id),  -- NULL for top-level
                depth INTEGER NOT NULL DEFAULT 0,
                author TEXT NOT NULL,
                text TEXT,
                score INTEGER,
                edited BOOLEAN DEFAULT FALSE,
                created_utc INTEGER NOT NULL,
                fetched_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_comments_post ON comments(post_id);
            CREATE INDEX IF NOT EXISTS idx_comments_parent ON comments(parent_comment_id);

            -- Append-only, one row per comment per collection run
            CREATE TABLE IF NOT EXISTS comment_sentiment_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                comment_id TEXT NOT NULL REFERENCES comments(id),
                comment_sentiment TEXT NOT NULL, -- JSON object
                score INTEGER,
                measured_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_comment_snapshots_comment ON comment_sentiment_snapshots(comment_id, measured_at);

            -- API accounts
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    // === Collection writes ===

    /// Insert subreddit metadata unless the id is already stored
    pub fn insert_subreddit(&self, meta: &SubredditMeta) -> Result<InsertOutcome> {
        let tx = self.conn.unchecked_transaction()?;

        if row_exists(&tx, "subreddits", &meta.id)? {
            info!("Subreddit r/{} ({}) already stored, skipping", meta.name, meta.id);
            return Ok(InsertOutcome::AlreadyPresent);
        }

        tx.execute(
            "INSERT INTO subreddits (id, name, description, subscriber_count, created_utc, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                meta.id,
                meta.name,
                meta.description,
                meta.subscriber_count,
                meta.created_utc.timestamp(),
                now(),
            ],
        )?;
        tx.commit()?;

        info!("Inserted subreddit r/{}", meta.name);
        Ok(InsertOutcome::Inserted)
    }

    /// Insert posts, skipping ids that are already stored (first write wins)
    pub fn insert_posts(&self, posts: &[PostRecord], subreddit_id: &str, post_type: PostType) -> Result<InsertReport> {
        let mut report = InsertReport::default();
        if posts.is_empty() {
            debug!("No posts to insert");
            return Ok(report);
        }

        let tx = self.conn.unchecked_transaction()?;
        let fetched_at = now();

        for post in posts {
            if row_exists(&tx, "posts", &post.id)? {
                info!("Post {} already stored, skipping", post.id);
                report.already_present.push(post.id.clone());
                continue;
            }

            tx.execute(
                r#"
                INSERT INTO posts (
                    id, subreddit_id, author, post_type, title, selftext, url, flair,
                    awards, edited, created_utc, created_local, fetched_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    post.id,
                    subreddit_id,
                    post.author,
                    post_type.as_str(),
                    post.title,
                    post.selftext,
                    post.url,
                    post.flair,
                    post.awards,
                    post.edited,
                    post.created_utc.timestamp(),
                    post.created_local,
                    fetched_at,
                ],
            )?;
            report.inserted.push(post.id.clone());
        }

        tx.commit()?;
        info!(
            "{} posts: {} inserted, {} already stored",
            post_type,
            report.inserted.len(),
            report.already_present.len()
        );
        Ok(report)
    }

    /// Insert comments of one post, skipping stored ids
    ///
    /// Replies are stored with their parent comment id; a reply whose parent
    /// is not stored is rejected so the self-reference stays valid.
    pub fn insert_comments(&self, comments: &[CommentRecord], post_id: &str) -> Result<InsertReport> {
        let mut report = InsertReport::default();
        if comments.is_empty() {
            debug!("No comments to insert for post {}", post_id);
            return Ok(report);
        }

        // Parents before replies
        let mut ordered: Vec<&CommentRecord> = comments.iter().collect();
        ordered.sort_by_key(|c| c.depth);

        let tx = self.conn.unchecked_transaction()?;
        let fetched_at = now();

        for comment in ordered {
            if row_exists(&tx, "comments", &comment.id)? {
                info!("Comment {} already stored, skipping", comment.id);
                report.already_present.push(comment.id.clone());
                continue;
            }

            let parent_comment_id = comment.parent.parent_comment_id();
            if let Some(parent) = parent_comment_id {
                if !row_exists(&tx, "comments", parent)? {
                    warn!("Comment {}: parent comment {} not stored, skipping", comment.id, parent);
                    report.rejected.push(comment.id.clone());
                    continue;
                }
            }

            tx.execute(
                r#"
                INSERT INTO comments (
                    id, post_id, parent_comment_id, depth, author, text, score, edited, created_utc, fetched_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    comment.id,
                    post_id,
                    parent_comment_id,
                    comment.depth,
                    comment.author,
                    comment.text,
                    comment.score,
                    comment.edited,
                    comment.created_utc.timestamp(),
                    fetched_at,
                ],
            )?;
            report.inserted.push(comment.id.clone());
        }

        tx.commit()?;
        debug!(
            "Post {}: {} comments inserted, {} already stored, {} rejected",
            post_id,
            report.inserted.len(),
            report.already_present.len(),
            report.rejected.len()
        );
        Ok(report)
    }

    /// Append one sentiment snapshot per post
    pub fn insert_post_sentiment_snapshots(&self, posts: &[PostRecord]) -> Result<usize> {
        if posts.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let measured_at = now();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO post_sentiment_snapshots
                 (post_id, title_sentiment, body_sentiment, score, upvote_ratio, controversiality, num_comments, measured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;

            for post in posts {
                stmt.execute(params![
                    post.id,
                    post.title_sentiment.to_json(),
                    post.body_sentiment.to_json(),
                    post.score,
                    post.upvote_ratio,
                    post.controversiality,
                    post.num_comments,
                    measured_at,
                ])?;
            }
        }
        tx.commit()?;

        debug!("Appended {} post sentiment snapshots", posts.len());
        Ok(posts.len())
    }

    /// Append one sentiment snapshot per comment
    pub fn insert_comment_sentiment_snapshots(&self, comments: &[CommentRecord]) -> Result<usize> {
        if comments.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let measured_at = now();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO comment_sentiment_snapshots (comment_id, comment_sentiment, score, measured_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;

            for comment in comments {
                stmt.execute(params![comment.id, comment.sentiment.to_json(), comment.score, measured_at])?;
            }
        }
        tx.commit()?;

        debug!("Appended {} comment sentiment snapshots", comments.len());
        Ok(comments.len())
    }

    // === Queries ===

    /// Stored metadata for a subreddit; `None` if it was never collected
    pub fn get_metadata(&self, name: &str) -> Result<Option<StoredSubreddit>> {
        let result = self
            .conn
            .query_row(
                r#"
                SELECT s.id, s.name, s.description, s.subscriber_count, s.created_utc, s.fetched_at,
                       (SELECT COUNT(*) FROM posts p WHERE p.subreddit_id = s.id),
                       (SELECT COUNT(*) FROM comments c JOIN posts p ON p.id = c.post_id
                        WHERE p.subreddit_id = s.id)
                FROM subreddits s
                WHERE s.name = ?1 COLLATE NOCASE
                "#,
                params![name],
                |row| {
                    Ok(StoredSubreddit {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        subscriber_count: row.get(3)?,
                        created_utc: row.get(4)?,
                        fetched_at: row.get(5)?,
                        post_count: row.get(6)?,
                        comment_count: row.get(7)?,
                    })
                },
            )
            .optional()?;

        Ok(result)
    }

    /// Newest posts of a subreddit with their latest sentiment snapshot
    pub fn get_posts(&self, name: &str, limit: usize) -> Result<Vec<PostWithSentiment>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT p.id, p.author, p.post_type, p.title, p.selftext, p.url, p.flair, p.awards, p.edited,
                   p.created_utc, p.created_local, p.fetched_at,
                   ps.title_sentiment, ps.body_sentiment, ps.score, ps.upvote_ratio,
                   ps.controversiality, ps.num_comments, ps.measured_at
            FROM posts p
            JOIN subreddits s ON s.id = p.subreddit_id
            LEFT JOIN post_sentiment_snapshots ps ON ps.id = (
                SELECT id FROM post_sentiment_snapshots
                WHERE post_id = p.id
                ORDER BY measured_at DESC, id DESC
                LIMIT 1
            )
            WHERE s.name = ?1 COLLATE NOCASE
            ORDER BY p.created_utc DESC, p.id
            LIMIT ?2
            "#,
        )?;

        let results = stmt.query_map(params![name, limit as i64], |row| {
            let measured_at: Option<i64> = row.get(18)?;
            let sentiment = match measured_at {
                Some(measured_at) => Some(PostSnapshot {
                    title_sentiment: SentimentScores::from_json(&row.get::<_, String>(12)?),
                    body_sentiment: SentimentScores::from_json(&row.get::<_, String>(13)?),
                    score: row.get(14)?,
                    upvote_ratio: row.get(15)?,
                    controversiality: row.get(16)?,
                    num_comments: row.get(17)?,
                    measured_at,
                }),
                None => None,
            };

            Ok(PostWithSentiment {
                id: row.get(0)?,
                author: row.get(1)?,
                post_type: row.get(2)?,
                title: row.get(3)?,
                selftext: row.get(4)?,
                url: row.get(5)?,
                flair: row.get(6)?,
                awards: row.get(7)?,
                edited: row.get(8)?,
                created_utc: row.get(9)?,
                created_local: row.get(10)?,
                fetched_at: row.get(11)?,
                sentiment,
            })
        })?;

        results.collect::<std::result::Result<Vec<_>, _>>().map_err(|e| e.into())
    }

    /// Newest comments of a subreddit with their latest sentiment snapshot
    pub fn get_comments(&self, name: &str, limit: usize) -> Result<Vec<CommentWithSentiment>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT c.id, c.post_id, c.parent_comment_id, c.depth, c.author, c.text, c.score, c.edited,
                   c.created_utc, c.fetched_at,
                   cs.comment_sentiment, cs.score, cs.measured_at
            FROM comments c
            JOIN posts p ON p.id = c.post_id
            JOIN subreddits s ON s.id = p.subreddit_id
            LEFT JOIN comment_sentiment_snapshots cs ON cs.id = (
                SELECT id FROM comment_sentiment_snapshots
                WHERE comment_id = c.id
                ORDER BY measured_at DESC, id DESC
                LIMIT 1
            )
            WHERE s.name = ?1 COLLATE NOCASE
            ORDER BY c.created_utc DESC, c.id
            LIMIT ?2
            "#,
        )?;

        let results = stmt.query_map(params![name, limit as i64], |row| {
            let measured_at: Option<i64> = row.get(12)?;
            let sentiment = match measured_at {
                Some(measured_at) => Some(CommentSnapshot {
                    sentiment: SentimentScores::from_json(&row.get::<_, String>(10)?),
                    score: row.get(11)?,
                    measured_at,
                }),
                None => None,
            };

            Ok(CommentWithSentiment {
                id: row.get(0)?,
                post_id: row.get(1)?,
                parent_comment_id: row.get(2)?,
                depth: row.get(3)?,
                author: row.get(4)?,
                text: row.get(5)?,
                score: row.get(6)?,
                edited: row.get(7)?,
                created_utc: row.get(8)?,
                fetched_at: row.get(9)?,
                sentiment,
            })
        })?;

        results.collect::<std::result::Result<Vec<_>, _>>().map_err(|e| e.into())
    }

    /// Row count of one of the tracker's tables
    pub fn count_rows(&self, table: &str) -> Result<i64> {
        if !TABLES.contains(&table) {
            bail!("unknown table '{}'", table);
        }

        let count = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(count)
    }

    // === Users ===

    /// Create an API user; `None` if the username or email is taken
    pub fn insert_user(&self, username: &str, email: &str, password_hash: &str) -> Result<Option<i64>> {
        let tx = self.conn.unchecked_transaction()?;

        let taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1 OR email = ?2)",
            params![username, email],
            |row| row.get(0),
        )?;
        if taken {
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO users (username, email, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![username, email, password_hash, now()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Some(id))
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        let user = self
            .conn
            .query_row(
                "SELECT id, username, email, password_hash FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        email: row.get(2)?,
                        password_hash: row.get(3)?,
                    })
                },
            )
            .optional()?;

        Ok(user)
    }
}

fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", table),
        params![id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// === Write results ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// Per-id result of a batch insert
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertReport {
    pub inserted: Vec<String>,
    pub already_present: Vec<String>,
    /// Items that could not be stored (e.g. reply without stored parent)
    pub rejected: Vec<String>,
}

impl InsertReport {
    /// True if a base row for `id` exists after this call
    pub fn is_stored(&self, id: &str) -> bool {
        self.inserted.iter().chain(&self.already_present).any(|stored| stored == id)
    }
}

// === Query results ===

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoredSubreddit {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub subscriber_count: Option<i64>,
    pub created_utc: Option<i64>,
    pub fetched_at: i64,
    pub post_count: i64,
    pub comment_count: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PostSnapshot {
    pub title_sentiment: SentimentScores,
    pub body_sentiment: SentimentScores,
    pub score: Option<i64>,
    pub upvote_ratio: Option<f64>,
    pub controversiality: Option<f64>,
    pub num_comments: Option<i64>,
    pub measured_at: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PostWithSentiment {
    pub id: String,
    pub author: String,
    pub post_type: String,
    pub title: Option<String>,
    pub selftext: Option<String>,
    pub url: Option<String>,
    pub flair: Option<String>,
    pub awards: Option<i64>,
    pub edited: Option<bool>,
    pub created_utc: i64,
    pub created_local: Option<String>,
    pub fetched_at: i64,
    pub sentiment: Option<PostSnapshot>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommentSnapshot {
    pub sentiment: SentimentScores,
    pub score: Option<i64>,
    pub measured_at: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommentWithSentiment {
    pub id: String,
    pub post_id: String,
    pub parent_comment_id: Option<String>,
    pub depth: i64,
    pub author: String,
    pub text: Option<String>,
    pub score: Option<i64>,
    pub edited: Option<bool>,
    pub created_utc: i64,
    pub fetched_at: i64,
    pub sentiment: Option<CommentSnapshot>,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
}
