//! JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Auth | Description |
//! |--------|------|------|-------------|
//! | `GET`  | `/health` | | Health check (returns version) |
//! | `POST` | `/auth/register` | | Create an account |
//! | `POST` | `/auth/login` | | Exchange credentials for a bearer token |
//! | `POST` | `/auth/reset_password_request` | | Mail a reset token (always 202) |
//! | `POST` | `/auth/reset_password/{token}` | | Set a new password |
//! | `GET`  | `/posts` | ✓ | Followed and own posts |
//! | `POST` | `/posts` | ✓ | Publish a post |
//! | `GET`  | `/explore` | ✓ | All posts |
//! | `GET`  | `/users/{username}` | ✓ | Profile |
//! | `GET`  | `/users/{username}/posts` | ✓ | A user's posts |
//! | `POST` | `/profile` | ✓ | Edit own profile |
//! | `POST` | `/follow/{username}` | ✓ | Follow |
//! | `POST` | `/unfollow/{username}` | ✓ | Unfollow |
//! | `GET`  | `/search?q=` | ✓ | Full-text post search |
//! | `POST` | `/messages/{recipient}` | ✓ | Send a private message |
//! | `GET`  | `/messages` | ✓ | Inbox (marks it read) |
//! | `GET`  | `/notifications?since=` | ✓ | Notification feed poll |
//! | `POST` | `/export_posts` | ✓ | Launch the post export task |
//! | `GET`  | `/tasks` | ✓ | In-progress tasks |
//! | `POST` | `/translate` | ✓ | Translate text |
//!
//! Listing endpoints take `?page=` (1-based) and return
//! `{items, page, per_page, total, next_page, prev_page}`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "post body is required" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `conflict` (409), `internal` (500).

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::app::AppContext;
use crate::auth::{issue_token, verify_token, PURPOSE_RESET_PASSWORD, PURPOSE_SESSION};
use crate::config::Config;
use crate::email::reset_password_email;
use crate::export::EXPORT_POSTS;
use crate::messages::{new_messages, received_messages, send_message, MessageView};
use crate::models::{Page, Post, User, ValidationError};
use crate::notifications::{poll, NotificationView};
use crate::posts::{create_post, explore, followed_posts, user_posts, views_of, PostView};
use crate::tasks::{launch_task, task_views, tasks_in_progress, TaskView};
use crate::translate::Translator;
use crate::users;

#[derive(Clone)]
struct AppState {
    app: AppContext,
    translator: Arc<Translator>,
}

/// Starts the HTTP server on `[server].bind` and runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = AppContext::build(config.clone()).await?;

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(app)).await?;
    Ok(())
}

/// All routes, bound to `app`.
pub fn router(app: AppContext) -> Router {
    let translator = Arc::new(Translator::new(app.config.translator.clone()));
    let state = AppState { app, translator };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/auth/register", post(handle_register))
        .route("/auth/login", post(handle_login))
        .route(
            "/auth/reset_password_request",
            post(handle_reset_password_request),
        )
        .route("/auth/reset_password/{token}", post(handle_reset_password))
        .route("/posts", get(handle_timeline).post(handle_create_post))
        .route("/explore", get(handle_explore))
        .route("/users/{username}", get(handle_profile))
        .route("/users/{username}/posts", get(handle_user_posts))
        .route("/profile", post(handle_edit_profile))
        .route("/follow/{username}", post(handle_follow))
        .route("/unfollow/{username}", post(handle_unfollow))
        .route("/search", get(handle_search))
        .route("/messages/{recipient}", post(handle_send_message))
        .route("/messages", get(handle_messages))
        .route("/notifications", get(handle_notifications))
        .route("/export_posts", post(handle_export_posts))
        .route("/tasks", get(handle_tasks))
        .route("/translate", post(handle_translate))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn error(status: StatusCode, code: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code,
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn unauthorized(message: impl Into<String>) -> AppError {
    error(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    error(StatusCode::NOT_FOUND, "not_found", message)
}

fn conflict(message: impl Into<String>) -> AppError {
    error(StatusCode::CONFLICT, "conflict", message)
}

/// Validation failures keep their meaning; anything else is logged and
/// reported as `internal` without detail.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<ValidationError>() {
            Some(ValidationError::Invalid(m)) => bad_request(m),
            Some(ValidationError::Conflict(m)) => conflict(m),
            Some(ValidationError::NotFound(m)) => not_found(m),
            None => {
                tracing::error!(error = ?err, "request failed");
                error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal server error",
                )
            }
        }
    }
}

type ApiResult<T> = Result<T, AppError>;

// ============ Authentication ============

/// The user named by a valid `Authorization: Bearer` session token.
/// Extracting it refreshes the user's `last_seen`.
struct CurrentUser(User);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> ApiResult<Self> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| unauthorized("missing bearer token"))?;

        let secret = &state.app.config.app.secret_key;
        let user_id = verify_token(secret, token.trim(), PURPOSE_SESSION)
            .ok_or_else(|| unauthorized("invalid or expired token"))?;
        let user = users::get_user(state.app.pool(), user_id)
            .await?
            .ok_or_else(|| unauthorized("invalid or expired token"))?;

        users::touch_last_seen(state.app.pool(), user.id).await?;
        Ok(CurrentUser(user))
    }
}

async fn user_by_name(state: &AppState, username: &str) -> ApiResult<User> {
    users::find_by_username(state.app.pool(), username)
        .await?
        .ok_or_else(|| not_found(format!("user {} not found", username)))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ /auth ============

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
}

async fn handle_register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let user = users::create_user(&state.app.store, &req.username, &req.email, &req.password)
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
}

async fn handle_login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let user = users::authenticate(state.app.pool(), &req.username, &req.password)
        .await?
        .ok_or_else(|| unauthorized("invalid username or password"))?;
    let cfg = &state.app.config.app;
    let token = issue_token(&cfg.secret_key, user.id, PURPOSE_SESSION, cfg.session_ttl_secs)?;
    Ok(Json(LoginResponse { token }))
}

#[derive(Deserialize)]
struct ResetRequest {
    email: String,
}

/// Always 202 so the response does not reveal which emails are registered.
async fn handle_reset_password_request(
    State(state): State<AppState>,
    Json(req): Json<ResetRequest>,
) -> ApiResult<StatusCode> {
    if let Some(user) = users::find_by_email(state.app.pool(), &req.email).await? {
        let cfg = &state.app.config.app;
        let token = issue_token(
            &cfg.secret_key,
            user.id,
            PURPOSE_RESET_PASSWORD,
            cfg.reset_token_ttl_secs,
        )?;
        let email = reset_password_email(state.app.mailer.sender(), &user, &token);
        state.app.mailer.send_detached(email);
    }
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct NewPassword {
    password: String,
}

async fn handle_reset_password(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<NewPassword>,
) -> ApiResult<Json<serde_json::Value>> {
    let secret = &state.app.config.app.secret_key;
    let user_id = verify_token(secret, &token, PURPOSE_RESET_PASSWORD)
        .ok_or_else(|| not_found("invalid or expired token"))?;
    users::set_password(&state.app.store, user_id, &req.password).await?;
    Ok(Json(json!({ "status": "ok" })))
}

// ============ Posts ============

#[derive(Deserialize)]
struct PageParams {
    page: Option<i64>,
}

impl PageParams {
    fn page(&self) -> i64 {
        self.page.unwrap_or(1)
    }
}

async fn handle_timeline(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<Page<PostView>>> {
    let per_page = state.app.config.app.posts_per_page;
    Ok(Json(
        followed_posts(state.app.pool(), user.id, params.page(), per_page).await?,
    ))
}

#[derive(Deserialize)]
struct NewPost {
    body: String,
    language: Option<String>,
}

async fn handle_create_post(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<NewPost>,
) -> ApiResult<(StatusCode, Json<Post>)> {
    let post = create_post(&state.app.store, user.id, &req.body, req.language.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(post)))
}

async fn handle_explore(
    State(state): State<AppState>,
    CurrentUser(_): CurrentUser,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<Page<PostView>>> {
    let per_page = state.app.config.app.posts_per_page;
    Ok(Json(explore(state.app.pool(), params.page(), per_page).await?))
}

// ============ Users ============

#[derive(Serialize)]
struct ProfileResponse {
    #[serde(flatten)]
    profile: users::Profile,
    is_following: bool,
    /// Only present on your own profile.
    #[serde(skip_serializing_if = "Option::is_none")]
    unread_messages: Option<i64>,
}

async fn handle_profile(
    State(state): State<AppState>,
    CurrentUser(me): CurrentUser,
    Path(username): Path<String>,
) -> ApiResult<Json<ProfileResponse>> {
    let user = user_by_name(&state, &username).await?;
    let profile = users::profile(state.app.pool(), &user).await?;
    let is_following = users::is_following(state.app.pool(), me.id, user.id).await?;
    let unread_messages = if me.id == user.id {
        Some(new_messages(state.app.pool(), me.id).await?)
    } else {
        None
    };
    Ok(Json(ProfileResponse {
        profile,
        is_following,
        unread_messages,
    }))
}

async fn handle_user_posts(
    State(state): State<AppState>,
    CurrentUser(_): CurrentUser,
    Path(username): Path<String>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<Page<PostView>>> {
    let user = user_by_name(&state, &username).await?;
    let per_page = state.app.config.app.posts_per_page;
    Ok(Json(
        user_posts(state.app.pool(), user.id, params.page(), per_page).await?,
    ))
}

#[derive(Deserialize)]
struct EditProfile {
    username: String,
    about_me: Option<String>,
}

async fn handle_edit_profile(
    State(state): State<AppState>,
    CurrentUser(me): CurrentUser,
    Json(req): Json<EditProfile>,
) -> ApiResult<Json<User>> {
    let user =
        users::update_profile(&state.app.store, me.id, &req.username, req.about_me.as_deref())
            .await?;
    Ok(Json(user))
}

async fn handle_follow(
    State(state): State<AppState>,
    CurrentUser(me): CurrentUser,
    Path(username): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = user_by_name(&state, &username).await?;
    users::follow(state.app.pool(), me.id, user.id).await?;
    Ok(Json(json!({ "following": user.username })))
}

async fn handle_unfollow(
    State(state): State<AppState>,
    CurrentUser(me): CurrentUser,
    Path(username): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = user_by_name(&state, &username).await?;
    users::unfollow(state.app.pool(), me.id, user.id).await?;
    Ok(Json(json!({ "unfollowed": user.username })))
}

// ============ GET /search ============

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
    page: Option<i64>,
}

#[derive(Serialize)]
struct SearchResponse {
    posts: Vec<PostView>,
    total: i64,
    next_page: Option<i64>,
    prev_page: Option<i64>,
}

async fn handle_search(
    State(state): State<AppState>,
    CurrentUser(_): CurrentUser,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResponse>> {
    let q = params.q.unwrap_or_default();
    if q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    let page = params.page.unwrap_or(1).max(1);
    let per_page = state.app.config.app.posts_per_page;

    let (posts, total) = state
        .app
        .search
        .search::<Post>(state.app.pool(), &q, page, per_page)
        .await?;
    let posts = views_of(state.app.pool(), posts).await?;
    let links = Page::<PostView>::new(Vec::new(), page, per_page, total);

    Ok(Json(SearchResponse {
        posts,
        total,
        next_page: links.next_page,
        prev_page: links.prev_page,
    }))
}

// ============ Messages ============

#[derive(Deserialize)]
struct NewMessage {
    body: String,
}

async fn handle_send_message(
    State(state): State<AppState>,
    CurrentUser(me): CurrentUser,
    Path(recipient): Path<String>,
    Json(req): Json<NewMessage>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let recipient = user_by_name(&state, &recipient).await?;
    let message = send_message(&state.app.store, me.id, &recipient, &req.body).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": message.id }))))
}

async fn handle_messages(
    State(state): State<AppState>,
    CurrentUser(me): CurrentUser,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<Page<MessageView>>> {
    let per_page = state.app.config.app.posts_per_page;
    Ok(Json(
        received_messages(&state.app.store, &me, params.page(), per_page).await?,
    ))
}

// ============ GET /notifications ============

#[derive(Deserialize)]
struct NotificationParams {
    since: Option<f64>,
}

async fn handle_notifications(
    State(state): State<AppState>,
    CurrentUser(me): CurrentUser,
    Query(params): Query<NotificationParams>,
) -> ApiResult<Json<Vec<NotificationView>>> {
    let since = params.since.unwrap_or(0.0);
    let items = poll(state.app.pool(), me.id, since).await?;
    Ok(Json(items.iter().map(NotificationView::from).collect()))
}

// ============ Tasks ============

async fn handle_export_posts(
    State(state): State<AppState>,
    CurrentUser(me): CurrentUser,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let running = tasks_in_progress(state.app.pool(), me.id, Some(EXPORT_POSTS)).await?;
    if !running.is_empty() {
        return Err(conflict("an export task is currently in progress"));
    }
    let task = launch_task(
        &state.app,
        me.id,
        EXPORT_POSTS,
        "Exporting posts...",
        json!({}),
    )
    .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task.id, "name": task.name })),
    ))
}

async fn handle_tasks(
    State(state): State<AppState>,
    CurrentUser(me): CurrentUser,
) -> ApiResult<Json<Vec<TaskView>>> {
    Ok(Json(task_views(&state.app, me.id).await?))
}

// ============ POST /translate ============

#[derive(Deserialize)]
struct TranslateRequest {
    text: String,
    source_language: String,
    dest_language: String,
}

async fn handle_translate(
    State(state): State<AppState>,
    CurrentUser(_): CurrentUser,
    Json(req): Json<TranslateRequest>,
) -> Json<serde_json::Value> {
    let text = state
        .translator
        .translate(&req.text, &req.source_language, &req.dest_language)
        .await;
    Json(json!({ "text": text }))
}
