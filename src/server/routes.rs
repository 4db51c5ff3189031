//! Axum route handlers.
//!
//! # Routes
//!
//! - `GET  /health`                    — liveness + readiness probe
//! - `GET  /g/{alias}`                 — redirect to a go link
//! - `GET  /g/all`                     — every go link, as `{alias: url}`
//! - `POST /g`                         — create a go link
//! - `GET  /q/{query}`, `GET /q/`     — query tells (minimal views)
//! - `GET  /l/{query}`, `GET /l/`     — query tells (go URLs only)
//! - `GET  /e/{search}`                — fuzzy search
//! - `GET  /t/{alias}`                 — one tell's JSON
//! - `POST /t/update`                  — update (and possibly rename) a tell
//! - `POST /t/toggle-tag`              — flip one tag on a tell
//! - `DELETE /t/{alias}`               — delete a tell
//! - `GET  /sources`                   — source run status
//! - `POST /sources/load-all`          — run every source
//! - `POST /sources/{source_id}/load`  — run one source
//! - `GET  /u/`, `GET /u/{username}`  — user info
//! - `GET  /m/whoami`                  — the requesting user
//! - `GET  /m/status`                  — process status
//! - `GET  /m/save-file`               — raw save file, for debugging
//! - `GET  /{alias}`                   — master route: bare aliases redirect

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{self, Category, APP_USERNAME, UI_SUPPRESSED_CATEGORIES};
use crate::error::TellusError;
use crate::sources::Sourcer;
use crate::tell::{DataBlock, Tell};
use crate::teller::{TellRepr, Teller};
use crate::users::{is_user_tell, User, UserManager};

/// Header carrying the authenticated user's email, set by the fronting
/// proxy.
pub const AUTH_EMAIL_HEADER: &str = "x-auth-email";

/// Explicit application readiness, read by the health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    Loading,
    Ready,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub teller: Arc<RwLock<Teller>>,
    pub users: Arc<RwLock<UserManager>>,
    pub sourcer: Arc<Mutex<Sourcer>>,
    pub readiness: Arc<RwLock<Readiness>>,
}

impl AppState {
    pub fn new(
        teller: Arc<RwLock<Teller>>,
        users: Arc<RwLock<UserManager>>,
        sourcer: Arc<Mutex<Sourcer>>,
    ) -> AppState {
        AppState {
            teller,
            users,
            sourcer,
            readiness: Arc::new(RwLock::new(Readiness::Loading)),
        }
    }

    pub async fn set_ready(&self) {
        *self.readiness.write().await = Readiness::Ready;
    }
}

/// Wraps registry errors for translation into HTTP responses.
struct ApiError(TellusError);

impl From<TellusError> for ApiError {
    fn from(error: TellusError) -> ApiError {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TellusError::InvalidAlias { .. }
            | TellusError::InvalidTag { .. }
            | TellusError::InvalidCategory(_)
            | TellusError::InvalidUpdate(_)
            | TellusError::InvalidQuery(_)
            | TellusError::InvalidUser(_) => StatusCode::BAD_REQUEST,
            TellusError::NoSuchTell(_)
            | TellusError::NoSuchSource(_)
            | TellusError::NoSuchUser(_)
            | TellusError::NotAUser { .. } => StatusCode::NOT_FOUND,
            TellusError::DuplicateTell { .. } | TellusError::DuplicateSource(_) => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/g/all", get(all_go_links_handler))
        .route("/g/{alias}", get(goto_handler))
        .route("/g", post(create_go_handler))
        .route("/q/", get(query_tells_handler_all))
        .route("/q/{query}", get(query_tells_handler))
        .route("/l/", get(query_links_handler_all))
        .route("/l/{query}", get(query_links_handler))
        .route("/e/{search}", get(search_handler))
        .route("/t/update", post(update_tell_handler))
        .route("/t/toggle-tag", post(toggle_tag_handler))
        .route("/t/{alias}", get(get_tell_handler).delete(delete_tell_handler))
        .route("/sources", get(sources_handler))
        .route("/sources/load-all", post(load_all_sources_handler))
        .route("/sources/{source_id}/load", post(load_one_source_handler))
        .route("/u/", get(all_users_handler))
        .route("/u/{username}", get(user_info_handler))
        .route("/m/whoami", get(whoami_handler))
        .route("/m/status", get(status_handler))
        .route("/m/save-file", get(save_file_handler))
        // The master route: bare aliases redirect like go links.
        .route("/{alias}", get(goto_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve the requesting user from the proxy's identity header, falling
/// back to the app's own username.
async fn request_user(state: &AppState, headers: &HeaderMap) -> String {
    let Some(email) = headers
        .get(AUTH_EMAIL_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return APP_USERNAME.to_string();
    };
    let teller = state.teller.read().await;
    let users = state.users.read().await;
    match users.get_by_email(&teller, email) {
        Ok(user) => user.username().to_string(),
        Err(error) => {
            log::warn!("An attempt was made to resolve '{email}', but: {error}");
            APP_USERNAME.to_string()
        }
    }
}

/// Users get their JSON a little differently.
fn tell_view(tell: &Tell) -> Value {
    if is_user_tell(tell) {
        match User::new(tell) {
            Ok(user) => user.to_json(),
            Err(_) => tell.tell_json(false, None),
        }
    } else {
        tell.tell_json(false, None)
    }
}

fn redirect_to(url: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let readiness = *state.readiness.read().await;
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "tellus",
        "readiness": readiness,
    }))
}

async fn goto_handler(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> Response {
    log::info!("goto {alias}");
    let teller = state.teller.read().await;
    match teller.get(&alias).ok().and_then(|tell| tell.go_url()) {
        Some(url) => {
            log::debug!("Redirecting to: {url}");
            redirect_to(&url)
        }
        // No tell (or no URL): land on the creation form, pre-seeded.
        None => redirect_to(&config::ui_route_go(&alias)),
    }
}

async fn all_go_links_handler(State(state): State<AppState>) -> impl IntoResponse {
    let teller = state.teller.read().await;
    Json(Value::Object(teller.query_tells(
        Some("go"),
        &[],
        TellRepr::GoUrl,
    )))
}

async fn create_go_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<DataBlock>,
) -> Result<Json<Value>, ApiError> {
    let username = request_user(&state, &headers).await;
    log::info!("Attempt by {username} to create tell with parameters: {params:?}");

    let mut teller = state.teller.write().await;
    let go_json = {
        let tell =
            teller.create_tell_with_parameters(Category::UserModified, &params, &username)?;
        tell.add_category(Category::Go);
        tell.go_json()
    };
    teller.persist()?;
    log::info!("Go link created by {username}.");
    Ok(Json(go_json))
}

async fn query_tells_handler_all(state: State<AppState>) -> Json<Value> {
    query_with(state, None, TellRepr::Minimal).await
}

async fn query_tells_handler(
    state: State<AppState>,
    Path(query): Path<String>,
) -> Json<Value> {
    query_with(state, Some(query), TellRepr::Minimal).await
}

async fn query_links_handler_all(state: State<AppState>) -> Json<Value> {
    query_with(state, None, TellRepr::GoUrl).await
}

async fn query_links_handler(
    state: State<AppState>,
    Path(query): Path<String>,
) -> Json<Value> {
    query_with(state, Some(query), TellRepr::GoUrl).await
}

async fn query_with(
    State(state): State<AppState>,
    query: Option<String>,
    repr: TellRepr,
) -> Json<Value> {
    let teller = state.teller.read().await;
    // An empty-ish query means "everything displayable".
    let all = matches!(query.as_deref(), None | Some(".") | Some("all-tells"));
    let results = if all {
        teller.query_tells(None, UI_SUPPRESSED_CATEGORIES, repr)
    } else {
        teller.query_tells(query.as_deref(), &[], repr)
    };
    Json(Value::Object(results))
}

async fn search_handler(
    State(state): State<AppState>,
    Path(search): Path<String>,
) -> Json<Value> {
    let teller = state.teller.read().await;
    let mut results = serde_json::Map::new();
    for tell in teller.search(&search) {
        results.insert(tell.alias().to_string(), tell.minimal_tell_json());
    }
    Json(Value::Object(results))
}

async fn get_tell_handler(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let teller = state.teller.read().await;
    let tell = teller.get(&alias)?;
    Ok(Json(tell_view(tell)))
}

async fn update_tell_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<DataBlock>,
) -> Result<Json<Value>, ApiError> {
    let username = request_user(&state, &headers).await;
    log::info!("Request to update tell by '{username}', with parameters: {params:?}");

    let mut teller = state.teller.write().await;
    let view = {
        let tell = teller.update_tell_from_ui(&params, &username, true)?;
        tell_view(tell)
    };
    teller.persist()?;
    Ok(Json(view))
}

async fn toggle_tag_handler(
    State(state): State<AppState>,
    Json(params): Json<DataBlock>,
) -> Result<Json<Value>, ApiError> {
    let alias = params
        .get("alias")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tag = params
        .get("tag")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut teller = state.teller.write().await;
    let toggled = teller.toggle_tag(&alias, &tag)?;
    teller.persist()?;
    Ok(Json(json!({
        "alias": alias,
        "tag": tag,
        "active": toggled.is_some(),
    })))
}

async fn delete_tell_handler(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> Result<String, ApiError> {
    let mut teller = state.teller.write().await;
    let tell = teller.delete_tell(&alias)?;
    teller.persist()?;
    Ok(format!("DELETED TELL '{}'", tell.alias()))
}

async fn sources_handler(State(state): State<AppState>) -> Json<Value> {
    let sourcer = state.sourcer.lock().await;
    Json(sourcer.active_source_info())
}

async fn load_all_sources_handler(State(state): State<AppState>) -> String {
    state.sourcer.lock().await.run_all().await;
    "Load complete for all sources.".to_string()
}

async fn load_one_source_handler(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
) -> Result<String, ApiError> {
    let message = state.sourcer.lock().await.run_one(&source_id).await?;
    Ok(format!("Load complete for source {source_id}: {message}"))
}

async fn all_users_handler(State(state): State<AppState>) -> Json<Value> {
    let teller = state.teller.read().await;
    let users = state.users.read().await;
    let mut results = serde_json::Map::new();
    for user in users.active_users(&teller) {
        results.insert(user.username().to_string(), user.to_json());
    }
    Json(Value::Object(results))
}

async fn user_info_handler(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let teller = state.teller.read().await;
    let users = state.users.read().await;
    let user = users.get(&teller, &username)?;
    Ok(Json(user.to_json()))
}

async fn whoami_handler(State(state): State<AppState>, headers: HeaderMap) -> String {
    match headers.get(AUTH_EMAIL_HEADER) {
        Some(_) => request_user(&state, &headers).await,
        None => String::new(),
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    let teller = state.teller.read().await;
    let users = state.users.read().await;
    let readiness = *state.readiness.read().await;
    Json(json!({
        "tellusVersion": crate::VERSION,
        "localPersistence": teller.is_local_persistence(),
        "readiness": readiness,
        "validUsers": users.valid_usernames().len(),
        "activeUsers": users.count_active_users(&teller),
        "tells": teller.tells_count(None),
    }))
}

async fn save_file_handler(State(state): State<AppState>) -> String {
    state.teller.read().await.read_file()
}
