//! Configuration loading and management
//!
//! Tunables live in `config/settings.toml`; credentials come from the
//! environment (see `RedditCredentials::from_env` and `TokenService::from_env`).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::fetcher::MAX_FETCH_LIMIT;
use crate::reddit::TimeFilter;

pub const DEFAULT_CONFIG_PATH: &str = "config/settings.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Subreddit collected when none is named
    pub subreddit: String,
    pub top_limit: usize,
    pub rising_limit: usize,
    /// Top-level comments kept per post
    pub comment_limit: usize,
    /// "Load more" expansions per comment tree
    pub reply_depth: usize,
    /// hour, day, week, month, year or all
    pub top_time_filter: String,
    pub rate_limit_per_second: u32,
    pub user_agent: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            subreddit: "wien".to_string(),
            top_limit: 10,
            rising_limit: 10,
            comment_limit: 3,
            reply_depth: 1,
            top_time_filter: "all".to_string(),
            rate_limit_per_second: 1,
            user_agent: "sentiment-tracker/0.1".to_string(),
        }
    }
}

impl CollectorConfig {
    pub fn time_filter(&self) -> Result<TimeFilter> {
        self.top_time_filter
            .parse()
            .map_err(|e| anyhow::anyhow!("collector.top_time_filter: {}", e))
    }

    /// Reject limits outside what a listing can return
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("top_limit", self.top_limit),
            ("rising_limit", self.rising_limit),
            ("comment_limit", self.comment_limit),
        ] {
            if value > MAX_FETCH_LIMIT {
                anyhow::bail!("collector.{} = {} exceeds the maximum of {}", name, value, MAX_FETCH_LIMIT);
            }
        }
        if self.rate_limit_per_second == 0 {
            anyhow::bail!("collector.rate_limit_per_second must be at least 1");
        }
        self.time_filter()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "data/sentiment.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub token_ttl_minutes: i64,
    /// Per-user quota on the data endpoints
    pub requests_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8000".to_string(),
            token_ttl_minutes: 30,
            requests_per_minute: 60,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.collector.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.collector.subreddit, "wien");
        assert_eq!(config.collector.comment_limit, 3);
        assert_eq!(config.collector.time_filter().unwrap(), TimeFilter::All);
        assert_eq!(config.server.token_ttl_minutes, 30);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = Config::parse(
            r#"
            [collector]
            subreddit = "austria"
            top_limit = 5
            top_time_filter = "Week"
            "#,
        )
        .unwrap();
        assert_eq!(config.collector.subreddit, "austria");
        assert_eq!(config.collector.top_limit, 5);
        assert_eq!(config.collector.rising_limit, 10);
        assert_eq!(config.collector.time_filter().unwrap(), TimeFilter::Week);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::parse("[collector]\ntop_limit = 500\n").is_err());
        assert!(Config::parse("[collector]\ntop_time_filter = \"decade\"\n").is_err());
        assert!(Config::parse("[collector]\nrate_limit_per_second = 0\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[database]\nsqlite_path = \"/tmp/x.db\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.database.sqlite_path, "/tmp/x.db");
        assert!(Config::load("/nonexistent/settings.toml").is_err());
    }
}
