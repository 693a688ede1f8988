//! Subreddit Sentiment Tracker Library
//!
//! Collects posts and comments from a subreddit, scores their sentiment,
//! stores append-only snapshots in SQLite and serves them over HTTP.

pub mod auth;
pub mod config;
pub mod db;
pub mod display_time;
pub mod fetcher;
pub mod pipeline;
pub mod reddit;
pub mod sentiment;
pub mod server;

#[cfg(test)]
pub mod testing;

pub use config::Config;
pub use db::Database;
pub use pipeline::{Pipeline, RunReport, RunStatus};
pub use reddit::RedditClient;
pub use sentiment::VaderAnalyzer;
