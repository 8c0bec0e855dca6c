use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use tenant_gate::{
    CleanupAction, Credential, CredentialPage, CredentialPool, ImportEntry, ImportReport, Limits,
    PageRequest, PoolError, PoolSummary, Resolution, Selection, SweepReport,
};
use tracing::{error, info};

type ApiResult<T> = Result<T, (StatusCode, String)>;

#[derive(Clone)]
struct AppState {
    pool: CredentialPool,
    auth: AdminAuth,
}

/// Bearer token guarding the admin API. Without one every admin call is refused.
#[derive(Clone, Debug, Default)]
pub struct AdminAuth {
    token: Option<String>,
}

impl AdminAuth {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|token| !token.trim().is_empty()),
        }
    }

    fn is_request_admin(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.token.as_deref() else {
            return false;
        };
        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|provided| provided.trim() == expected)
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    if state.auth.is_request_admin(headers) {
        Ok(())
    } else {
        Err((StatusCode::FORBIDDEN, "admin token required".to_owned()))
    }
}

fn pool_error(context: &str, err: PoolError) -> (StatusCode, String) {
    let status = match &err {
        PoolError::PoolEmpty | PoolError::AllBusy => StatusCode::TOO_MANY_REQUESTS,
        PoolError::CredentialNotFound(_) => StatusCode::NOT_FOUND,
        PoolError::InvalidToken
        | PoolError::InvalidEndpoint { .. }
        | PoolError::InvalidLimits(_) => StatusCode::BAD_REQUEST,
        PoolError::Persistence(_) | PoolError::Malformed { .. } | PoolError::HttpClient(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        error!("{context} error: {err}");
    }
    (status, err.to_string())
}

async fn health_check() -> &'static str {
    "ok"
}

async fn fetch_summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<PoolSummary>> {
    require_admin(&state, &headers)?;
    state
        .pool
        .summary()
        .await
        .map(Json)
        .map_err(|err| pool_error("summary", err))
}

/// Picks a credential the way a request would, without reserving it.
async fn select_credential(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Selection>> {
    require_admin(&state, &headers)?;
    state
        .pool
        .select_credential()
        .await
        .map(Json)
        .map_err(|err| pool_error("select credential", err))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    page: Option<usize>,
    page_size: Option<usize>,
}

async fn list_credentials(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<CredentialPage>> {
    require_admin(&state, &headers)?;
    let page = match (query.page, query.page_size) {
        (None, None) => None,
        (page, page_size) => Some(PageRequest {
            page: page.unwrap_or(1),
            page_size: page_size.unwrap_or(20),
        }),
    };
    state
        .pool
        .list_credentials(page)
        .await
        .map(Json)
        .map_err(|err| pool_error("list credentials", err))
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    entries: Vec<ImportEntry>,
}

async fn import_credentials(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ImportRequest>,
) -> ApiResult<(StatusCode, Json<ImportReport>)> {
    require_admin(&state, &headers)?;
    if payload.entries.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "no entries provided".to_owned()));
    }
    state
        .pool
        .import_credentials(&payload.entries)
        .await
        .map(|report| (StatusCode::CREATED, Json(report)))
        .map_err(|err| pool_error("import credentials", err))
}

async fn get_credential(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Credential>> {
    require_admin(&state, &headers)?;
    state
        .pool
        .credential(&token)
        .await
        .map(Json)
        .map_err(|err| pool_error("get credential", err))
}

async fn delete_credential(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    require_admin(&state, &headers)?;
    match state.pool.delete_credential(&token).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(pool_error(
            "delete credential",
            PoolError::CredentialNotFound(token),
        )),
        Err(err) => Err(pool_error("delete credential", err)),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateEnabled {
    enabled: bool,
}

async fn update_enabled(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<UpdateEnabled>,
) -> ApiResult<StatusCode> {
    require_admin(&state, &headers)?;
    state
        .pool
        .set_enabled(&token, payload.enabled)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|err| pool_error("update enabled", err))
}

/// Omitted fields keep their current value.
#[derive(Debug, Deserialize)]
struct UpdateLimits {
    request_interval_secs: Option<i64>,
    chat_limit: Option<i64>,
    agent_limit: Option<i64>,
    daily_limit: Option<i64>,
}

async fn update_limits(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<UpdateLimits>,
) -> ApiResult<Json<Limits>> {
    require_admin(&state, &headers)?;
    let current = state
        .pool
        .credential(&token)
        .await
        .map_err(|err| pool_error("update limits", err))?
        .record
        .limits;
    let limits = Limits {
        request_interval_secs: payload
            .request_interval_secs
            .unwrap_or(current.request_interval_secs),
        chat_limit: payload.chat_limit.unwrap_or(current.chat_limit),
        agent_limit: payload.agent_limit.unwrap_or(current.agent_limit),
        daily_limit: payload.daily_limit.unwrap_or(current.daily_limit),
    };
    state
        .pool
        .update_limits(&token, limits)
        .await
        .map(|_| Json(limits))
        .map_err(|err| pool_error("update limits", err))
}

#[derive(Debug, Deserialize)]
struct UpdateRemark {
    remark: String,
}

async fn update_remark(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<UpdateRemark>,
) -> ApiResult<StatusCode> {
    require_admin(&state, &headers)?;
    state
        .pool
        .update_remark(&token, payload.remark.trim())
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|err| pool_error("update remark", err))
}

#[derive(Debug, Deserialize)]
struct CooldownRequest {
    seconds: u64,
}

async fn set_cooldown(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<CooldownRequest>,
) -> ApiResult<StatusCode> {
    require_admin(&state, &headers)?;
    state
        .pool
        .set_cooldown(&token, Duration::from_secs(payload.seconds))
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|err| pool_error("set cooldown", err))
}

async fn reset_usage(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    require_admin(&state, &headers)?;
    state
        .pool
        .reset_usage(&token)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|err| pool_error("reset usage", err))
}

async fn check_credential(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Resolution>> {
    require_admin(&state, &headers)?;
    state
        .pool
        .resolve_endpoint(&token)
        .await
        .map(Json)
        .map_err(|err| pool_error("check credential", err))
}

async fn check_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<SweepReport>> {
    require_admin(&state, &headers)?;
    state
        .pool
        .resolve_all()
        .await
        .map(Json)
        .map_err(|err| pool_error("check all", err))
}

#[derive(Debug, Deserialize)]
struct CleanupRequest {
    action: CleanupAction,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    action: CleanupAction,
    cleaned: usize,
}

async fn cleanup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CleanupRequest>,
) -> ApiResult<Json<CleanupResponse>> {
    require_admin(&state, &headers)?;
    state
        .pool
        .cleanup(payload.action)
        .await
        .map(|cleaned| {
            Json(CleanupResponse {
                action: payload.action,
                cleaned,
            })
        })
        .map_err(|err| pool_error("cleanup", err))
}

#[derive(Debug, Serialize)]
struct BackfillResponse {
    updated: usize,
}

async fn backfill_defaults(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<BackfillResponse>> {
    require_admin(&state, &headers)?;
    state
        .pool
        .backfill_defaults()
        .await
        .map(|updated| Json(BackfillResponse { updated }))
        .map_err(|err| pool_error("backfill defaults", err))
}

fn router(pool: CredentialPool, auth: AdminAuth) -> Router {
    let state = Arc::new(AppState { pool, auth });
    Router::new()
        .route("/health", get(health_check))
        .route("/api/summary", get(fetch_summary))
        .route("/api/select", get(select_credential))
        .route("/api/tokens", get(list_credentials).post(import_credentials))
        .route(
            "/api/tokens/:token",
            get(get_credential).delete(delete_credential),
        )
        .route("/api/tokens/:token/enabled", patch(update_enabled))
        .route("/api/tokens/:token/limits", patch(update_limits))
        .route("/api/tokens/:token/remark", patch(update_remark))
        .route("/api/tokens/:token/cooldown", post(set_cooldown))
        .route("/api/tokens/:token/reset-usage", post(reset_usage))
        .route("/api/tokens/:token/check", post(check_credential))
        .route("/api/check-all", post(check_all))
        .route("/api/cleanup", post(cleanup))
        .route("/api/backfill", post(backfill_defaults))
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    pool: CredentialPool,
    auth: AdminAuth,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin server listening");
    axum::serve(listener, router(pool, auth))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
