//! HTTP query surface
//!
//! Read endpoints for collected data, a trigger that runs one collection
//! synchronously, and register/login for bearer tokens. Everything under
//! `/subreddits` needs a valid token and counts against the caller's quota.

use anyhow::anyhow;
use axum::{
    extract::{rejection::QueryRejection, FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{hash_password, verify_password, RegisterRequest, TokenService, UserRateLimiter};
use crate::db::{Database, SharedDatabase};
use crate::pipeline::{Collector, PipelineError, RunReport, RunStatus};
use crate::reddit::{is_valid_subreddit_name, FetchError};

pub const DEFAULT_LIMIT: i64 = 10;
pub const MAX_LIMIT: i64 = 100;

/// Errors returned to API clients as `{"error", "status"}`
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    TooManyRequests(String),
    ServiceUnavailable(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(err) => {
                error!("Internal error: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = Json(json!({
            "error": message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub db: SharedDatabase,
    pub tokens: Arc<TokenService>,
    pub limiter: Arc<UserRateLimiter>,
    /// `None` when reddit credentials are not configured
    pub collector: Option<Arc<dyn Collector>>,
    /// One collection at a time through the API
    pub run_lock: Arc<AsyncMutex<()>>,
}

impl AppState {
    pub fn new(
        db: SharedDatabase,
        tokens: TokenService,
        limiter: UserRateLimiter,
        collector: Option<Arc<dyn Collector>>,
    ) -> Self {
        Self {
            db,
            tokens: Arc::new(tokens),
            limiter: Arc::new(limiter),
            collector,
            run_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> anyhow::Result<T>) -> ApiResult<T> {
        let db = self.db.lock().map_err(|_| anyhow!("database lock poisoned"))?;
        Ok(f(&db)?)
    }
}

/// Caller identified by a valid bearer token, within quota
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub username: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;

        let claims = state
            .tokens
            .verify(token)
            .map_err(|e| ApiError::Unauthorized(e.to_string()))?;

        if !state.limiter.check(&claims.sub) {
            warn!("Rate limit exceeded for {}", claims.username);
            return Err(ApiError::TooManyRequests("rate limit exceeded".to_string()));
        }

        Ok(AuthUser {
            id: claims.sub,
            username: claims.username,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

impl LimitQuery {
    fn clamped(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT) as usize
    }
}

/// Unparseable query strings get the JSON error body, not axum's plain text
fn limit_from(query: Result<Query<LimitQuery>, QueryRejection>) -> ApiResult<usize> {
    query
        .map(|Query(query)| query.clamped())
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub status: &'static str,
    pub access_token: String,
    pub token_type: &'static str,
}

#[derive(Debug, Serialize)]
pub struct CollectResponse {
    pub status: RunStatus,
    pub subreddit: String,
    /// Whether any row was written by this run
    pub persisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RunReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn checked_name(name: &str) -> ApiResult<()> {
    if is_valid_subreddit_name(name) {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("invalid subreddit name '{}'", name)))
    }
}

fn never_collected(name: &str) -> ApiError {
    ApiError::NotFound(format!("subreddit '{}' was never collected", name))
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "Subreddit sentiment tracker" }))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn register(State(state): State<AppState>, Json(req): Json<RegisterRequest>) -> ApiResult<impl IntoResponse> {
    req.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let password_hash = hash_password(&req.password).map_err(|e| ApiError::Internal(e.into()))?;
    let created = state.with_db(|db| db.insert_user(&req.username, &req.email, &password_hash))?;

    match created {
        Some(id) => {
            info!("Registered user {} ({})", req.username, id);
            Ok((StatusCode::CREATED, Json(json!({ "status": "registered" }))))
        }
        None => Err(ApiError::Conflict("username or email already registered".to_string())),
    }
}

async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> ApiResult<Json<TokenResponse>> {
    let invalid = || ApiError::Unauthorized("invalid username or password".to_string());

    let user = state
        .with_db(|db| db.find_user_by_username(&req.username))?
        .ok_or_else(invalid)?;

    let matches = verify_password(&req.password, &user.password_hash).map_err(|e| ApiError::Internal(e.into()))?;
    if !matches {
        return Err(invalid());
    }

    let access_token = state
        .tokens
        .issue(user.id, &user.username)
        .map_err(|e| ApiError::Internal(e.into()))?;

    Ok(Json(TokenResponse {
        status: "ok",
        access_token,
        token_type: "bearer",
    }))
}

async fn subreddit_metadata(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    checked_name(&name)?;
    let meta = state
        .with_db(|db| db.get_metadata(&name))?
        .ok_or_else(|| never_collected(&name))?;
    Ok(Json(json!(meta)))
}

async fn subreddit_posts(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(name): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    checked_name(&name)?;
    let limit = limit_from(query)?;

    let posts = state.with_db(|db| match db.get_metadata(&name)? {
        Some(_) => Ok(Some(db.get_posts(&name, limit)?)),
        None => Ok(None),
    })?;
    let posts = posts.ok_or_else(|| never_collected(&name))?;

    Ok(Json(json!({
        "subreddit": name,
        "count": posts.len(),
        "posts": posts
    })))
}

async fn subreddit_comments(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(name): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    checked_name(&name)?;
    let limit = limit_from(query)?;

    let comments = state.with_db(|db| match db.get_metadata(&name)? {
        Some(_) => Ok(Some(db.get_comments(&name, limit)?)),
        None => Ok(None),
    })?;
    let comments = comments.ok_or_else(|| never_collected(&name))?;

    Ok(Json(json!({
        "subreddit": name,
        "count": comments.len(),
        "comments": comments
    })))
}

async fn collect(
    State(state): State<AppState>,
    user: AuthUser,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<CollectResponse>)> {
    checked_name(&name)?;
    let collector = state
        .collector
        .clone()
        .ok_or_else(|| ApiError::ServiceUnavailable("collection is not configured".to_string()))?;

    let _running = state.run_lock.lock().await;
    info!("Collection of r/{} requested by {}", name, user.username);

    let failure = |status: StatusCode, error: String| {
        (
            status,
            Json(CollectResponse {
                status: RunStatus::Failed,
                subreddit: name.clone(),
                persisted: false,
                report: None,
                error: Some(error),
            }),
        )
    };

    let response = match collector.collect(&name).await {
        Ok(report) => {
            let status = report.status();
            let code = match status {
                RunStatus::Failed => StatusCode::BAD_GATEWAY,
                _ => StatusCode::OK,
            };
            (
                code,
                Json(CollectResponse {
                    status,
                    subreddit: report.subreddit.clone(),
                    persisted: report.persisted_anything(),
                    report: Some(report),
                    error: None,
                }),
            )
        }
        Err(PipelineError::Metadata(FetchError::NotFound(msg))) => failure(StatusCode::NOT_FOUND, msg),
        Err(e @ PipelineError::Metadata(_)) => failure(StatusCode::BAD_GATEWAY, e.to_string()),
        Err(e @ PipelineError::InvalidName(_)) => return Err(ApiError::BadRequest(e.to_string())),
        Err(PipelineError::Storage(e)) => return Err(ApiError::Internal(e)),
    };

    Ok(response)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/subreddits/{name}", get(subreddit_metadata))
        .route("/subreddits/{name}/posts", get(subreddit_posts))
        .route("/subreddits/{name}/comments", get(subreddit_comments))
        .route("/subreddits/{name}/collect", post(collect))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the process is stopped
pub async fn serve(state: AppState, bind_address: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_address).await?;
    info!("Listening on http://{}", bind_address);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectorConfig;
    use crate::pipeline::Pipeline;
    use crate::testing::{raw_comment, raw_post, FakeAnalyzer, FakeSource};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state_with(collector: Option<Arc<dyn Collector>>, db: SharedDatabase, per_minute: u32) -> AppState {
        AppState::new(db, TokenService::new("test-key", 30), UserRateLimiter::per_minute(per_minute), collector)
    }

    fn shared_db() -> SharedDatabase {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        db.into_shared()
    }

    fn wien_collector(db: SharedDatabase) -> Arc<dyn Collector> {
        let source = FakeSource::new("wien")
            .with_top(vec![raw_post("p1", "good times"), raw_post("p2", "traffic")])
            .with_comments("p1", vec![raw_comment("c1", "t3_p1", "good")]);
        let config = CollectorConfig {
            top_limit: 5,
            ..CollectorConfig::default()
        };
        Arc::new(Pipeline::new(source, FakeAnalyzer, db, config).unwrap())
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn json_post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn authed(method: &str, uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    }

    async fn token_for(app: &Router) -> String {
        let (status, _) = send(
            app,
            json_post(
                "/register",
                json!({"username": "karl", "email": "karl@example.com", "password": "secret"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(app, json_post("/login", json!({"username": "karl", "password": "secret"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["token_type"], "bearer");
        body["access_token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_and_root() {
        let app = router(state_with(None, shared_db(), 60));
        let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, _) = send(&app, Request::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_register_rules() {
        let app = router(state_with(None, shared_db(), 60));
        token_for(&app).await;

        let (status, body) = send(
            &app,
            json_post(
                "/register",
                json!({"username": "karl", "email": "other@example.com", "password": "secret"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], 409);

        let (status, _) = send(
            &app,
            json_post("/register", json!({"username": "x", "email": "x@example.com", "password": "secret"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_login_rejects_wrong_password() {
        let app = router(state_with(None, shared_db(), 60));
        token_for(&app).await;

        let (status, _) = send(&app, json_post("/login", json!({"username": "karl", "password": "wrong"}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, json_post("/login", json!({"username": "nobody", "password": "secret"}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_data_endpoints_need_token() {
        let app = router(state_with(None, shared_db(), 60));

        let (status, _) = send(&app, Request::get("/subreddits/wien").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, authed("GET", "/subreddits/wien/posts", "garbage")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_never_collected_is_404() {
        let app = router(state_with(None, shared_db(), 60));
        let token = token_for(&app).await;

        for uri in ["/subreddits/wien", "/subreddits/wien/posts", "/subreddits/wien/comments"] {
            let (status, body) = send(&app, authed("GET", uri, &token)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
            assert!(body["error"].as_str().unwrap().contains("never collected"));
        }

        let (status, _) = send(&app, authed("GET", "/subreddits/bad%20name", &token)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_limit_is_json_400() {
        let app = router(state_with(None, shared_db(), 60));
        let token = token_for(&app).await;

        for uri in ["/subreddits/wien/posts?limit=abc", "/subreddits/wien/comments?limit=1.5"] {
            let (status, body) = send(&app, authed("GET", uri, &token)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(body["status"], 400);
            assert!(body["error"].is_string(), "{}", body);
        }
    }

    #[tokio::test]
    async fn test_collect_then_read() {
        let db = shared_db();
        let app = router(state_with(Some(wien_collector(db.clone())), db, 60));
        let token = token_for(&app).await;

        let (status, body) = send(&app, authed("POST", "/subreddits/wien/collect", &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["persisted"], true);
        assert_eq!(body["report"]["top"]["posts_inserted"], 2);

        let (status, body) = send(&app, authed("GET", "/subreddits/wien", &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["post_count"], 2);

        let (status, body) = send(&app, authed("GET", "/subreddits/wien/posts?limit=1", &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert!(body["posts"][0]["sentiment"]["title_sentiment"]["compound"].is_number());

        let (status, body) = send(&app, authed("GET", "/subreddits/wien/comments?limit=500", &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["comments"][0]["parent_comment_id"], Value::Null);
    }

    #[tokio::test]
    async fn test_collect_unknown_subreddit_reports_failure() {
        let db = shared_db();
        let app = router(state_with(Some(wien_collector(db.clone())), db, 60));
        let token = token_for(&app).await;

        let (status, body) = send(&app, authed("POST", "/subreddits/doesnotexist/collect", &token)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "failure");
        assert_eq!(body["persisted"], false);
    }

    #[tokio::test]
    async fn test_collect_without_collector() {
        let app = router(state_with(None, shared_db(), 60));
        let token = token_for(&app).await;

        let (status, _) = send(&app, authed("POST", "/subreddits/wien/collect", &token)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_rate_limit_returns_429() {
        let app = router(state_with(None, shared_db(), 2));
        let token = token_for(&app).await;

        for _ in 0..2 {
            let (status, _) = send(&app, authed("GET", "/subreddits/wien", &token)).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
        }
        let (status, body) = send(&app, authed("GET", "/subreddits/wien", &token)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["status"], 429);
    }
}
