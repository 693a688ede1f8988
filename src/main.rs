//! Subreddit Sentiment Tracker
//!
//! Collects a subreddit's top and rising posts with their comments, scores
//! sentiment, and stores snapshots. Optionally serves the data over HTTP.
//!
//! Usage:
//!   sentiment-tracker                    # Collect the configured subreddit once
//!   sentiment-tracker --collect austria  # Collect a named subreddit once
//!   sentiment-tracker --serve            # Run the HTTP API

use anyhow::{bail, Result};
use std::env;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use reddit_sentiment::auth::{TokenService, UserRateLimiter};
use reddit_sentiment::config::{Config, DEFAULT_CONFIG_PATH};
use reddit_sentiment::db::SharedDatabase;
use reddit_sentiment::pipeline::{Collector, Pipeline, RunStatus};
use reddit_sentiment::reddit::{is_valid_subreddit_name, RedditClient, RedditCredentials};
use reddit_sentiment::server::{self, AppState};
use reddit_sentiment::{Database, VaderAnalyzer};

/// Command-line arguments
struct Args {
    /// Subreddit to collect instead of the configured one
    subreddit: Option<String>,
    /// Run the HTTP API instead of a one-shot collection
    serve: bool,
    config_path: String,
    help: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut result = Args {
            subreddit: None,
            serve: false,
            config_path: DEFAULT_CONFIG_PATH.to_string(),
            help: false,
        };

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--collect" | "-c" => {
                    // Name is optional
                    if i + 1 < args.len() && !args[i + 1].starts_with('-') {
                        i += 1;
                        result.subreddit = Some(args[i].clone());
                    }
                }
                "--serve" | "-s" => result.serve = true,
                "--config" => {
                    i += 1;
                    if i < args.len() {
                        result.config_path = args[i].clone();
                    }
                }
                "--help" | "-h" => result.help = true,
                _ => {}
            }
            i += 1;
        }

        result
    }

    fn print_help() {
        println!("Subreddit Sentiment Tracker - sentiment snapshots of reddit posts and comments\n");
        println!("USAGE:");
        println!("  sentiment-tracker [OPTIONS]\n");
        println!("MODES:");
        println!("  (default)             Collect the configured subreddit once");
        println!("  --collect, -c [NAME]  Collect NAME (or the configured subreddit) once");
        println!("  --serve, -s           Run the HTTP API\n");
        println!("OTHER:");
        println!("  --config PATH         Settings file (default: {})", DEFAULT_CONFIG_PATH);
        println!("  --help, -h            Show this help message\n");
        println!("ENVIRONMENT (.env is read if present):");
        println!("  CLIENT_ID, SECRET_KEY, REDDIT_USERNAME, REDDIT_PW   reddit API credentials");
        println!("  USER_AGENT                                          overrides collector.user_agent");
        println!("  JWT_KEY                                             token signing key (--serve)");
        println!("  RUST_LOG                                            log filter (default: info)");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.help {
        Args::print_help();
        return Ok(());
    }

    // A missing .env is fine, the variables may come from the environment
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting sentiment tracker...");

    // Load configuration
    let config = Config::load(&args.config_path)?;
    info!("Loaded configuration from {}", args.config_path);

    // Initialize database
    let db = Database::new(&config.database.sqlite_path)?;
    db.run_migrations()?;
    info!("Database initialized");
    let db = db.into_shared();

    if args.serve {
        run_server(db, &config).await
    } else {
        let name = args.subreddit.unwrap_or_else(|| config.collector.subreddit.clone());
        run_collection(db, &config, &name).await
    }
}

fn build_pipeline(db: SharedDatabase, config: &Config) -> Result<Pipeline<RedditClient, VaderAnalyzer>> {
    let credentials = RedditCredentials::from_env()?;
    let client = RedditClient::new(
        credentials,
        &config.collector.user_agent,
        config.collector.rate_limit_per_second,
    )?;
    Pipeline::new(client, VaderAnalyzer::new(), db, config.collector.clone())
}

/// Run one collection and print what was stored
async fn run_collection(db: SharedDatabase, config: &Config, name: &str) -> Result<()> {
    if !is_valid_subreddit_name(name) {
        bail!("invalid subreddit name '{}'", name);
    }
    let pipeline = build_pipeline(db, config)?;
    let report = pipeline.run(name).await?;

    info!("Collection of r/{} complete: {:?}", report.subreddit, report.status());
    for stage in [&report.top, &report.rising] {
        info!("  {} posts:", stage.post_type);
        info!("    Fetched:            {} ({} skipped)", stage.posts_fetched, stage.posts_skipped);
        info!("    New posts:          {}", stage.posts_inserted);
        info!("    Already stored:     {}", stage.posts_already_present);
        info!("    Post snapshots:     {}", stage.post_snapshots);
        info!("    New comments:       {}", stage.comments_inserted);
        info!("    Comment snapshots:  {}", stage.comment_snapshots);
        if let Some(error) = &stage.error {
            warn!("    Stage failed:       {}", error);
        }
    }

    if report.status() == RunStatus::Failed {
        bail!("both listings of r/{} failed", report.subreddit);
    }
    Ok(())
}

/// Run the HTTP API
async fn run_server(db: SharedDatabase, config: &Config) -> Result<()> {
    let tokens = TokenService::from_env(config.server.token_ttl_minutes)?;
    let limiter = UserRateLimiter::per_minute(config.server.requests_per_minute);

    let collector: Option<Arc<dyn Collector>> = match build_pipeline(db.clone(), config) {
        Ok(pipeline) => Some(Arc::new(pipeline)),
        Err(e) => {
            warn!("Collection endpoint disabled: {}", e);
            None
        }
    };

    let state = AppState::new(db, tokens, limiter, collector);
    server::serve(state, &config.server.bind_address).await
}
