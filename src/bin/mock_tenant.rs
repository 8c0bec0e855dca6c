//! Stand-in for a fleet of tenant upstreams, for exercising endpoint discovery locally.
//!
//! Every tenant lives under its own path prefix, so `http://127.0.0.1:58090/d3/` is
//! the base URL of tenant `d3`. Point the pool at it with
//! `--candidate http://127.0.0.1:58090/d1/,http://127.0.0.1:58090/d3/`.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;

#[derive(Parser, Debug)]
struct Cli {
    /// Address to bind the mock tenant server
    #[arg(long, default_value = "127.0.0.1:58090")]
    bind: SocketAddr,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
struct ForcedResponse {
    #[serde(default)]
    http_status: Option<u16>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    once: bool,
    #[serde(default)]
    delay_ms: Option<u64>,
}

#[derive(Default, Clone, Serialize)]
struct SnapshotState {
    /// token -> tenant name
    tokens: HashMap<String, String>,
    forced: Option<ForcedResponse>,
    hits: u64,
}

#[derive(Default)]
struct AppState {
    inner: RwLock<SnapshotState>,
}

#[derive(Deserialize)]
struct AddTokenRequest {
    token: String,
    tenant: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let state = Arc::new(AppState::default());
    let app = Router::new()
        .route("/:tenant/chat-stream", post(handle_chat_stream))
        .route("/admin/tokens", post(add_token))
        .route("/admin/tokens/:token", delete(remove_token))
        .route(
            "/admin/force-response",
            post(set_forced_response).delete(clear_forced_response),
        )
        .route("/admin/state", get(read_state))
        .with_state(state);

    println!("Mock tenant upstream listening on http://{}", cli.bind);
    axum::serve(tokio::net::TcpListener::bind(cli.bind).await?, app).await?;
    Ok(())
}

async fn add_token(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AddTokenRequest>,
) -> (StatusCode, Json<Value>) {
    let token = payload.token.trim().to_owned();
    let tenant = payload.tenant.trim().trim_matches('/').to_owned();
    if token.is_empty() || tenant.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "token and tenant are required" })),
        );
    }
    let mut guard = state.inner.write().await;
    guard.tokens.insert(token.clone(), tenant.clone());
    (
        StatusCode::CREATED,
        Json(json!({ "token": token, "tenant": tenant })),
    )
}

async fn remove_token(State(state): State<Arc<AppState>>, Path(token): Path<String>) -> StatusCode {
    let mut guard = state.inner.write().await;
    if guard.tokens.remove(&token).is_some() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn set_forced_response(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ForcedResponse>,
) -> (StatusCode, Json<Value>) {
    if payload.http_status.is_none() && payload.body.is_none() && payload.delay_ms.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "One of http_status, body, or delay_ms is required" })),
        );
    }
    let mut guard = state.inner.write().await;
    guard.forced = Some(payload);
    (StatusCode::OK, Json(json!({ "forced": guard.forced })))
}

async fn clear_forced_response(State(state): State<Arc<AppState>>) -> StatusCode {
    let mut guard = state.inner.write().await;
    guard.forced = None;
    StatusCode::NO_CONTENT
}

async fn read_state(State(state): State<Arc<AppState>>) -> Json<Value> {
    let guard = state.inner.read().await;
    Json(json!({ "tokens": guard.tokens, "forced": guard.forced, "hits": guard.hits }))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

async fn handle_chat_stream(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    Json(_body): Json<Value>,
) -> Response {
    let forced = {
        let mut guard = state.inner.write().await;
        guard.hits += 1;
        let forced = guard.forced.clone();
        if guard.forced.as_ref().is_some_and(|force| force.once) {
            guard.forced = None;
        }
        forced
    };

    if let Some(force) = forced {
        if let Some(delay) = force.delay_ms {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        if force.http_status.is_some() || force.body.is_some() {
            let status = force
                .http_status
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::OK);
            return (status, force.body.unwrap_or_default()).into_response();
        }
    }

    let Some(token) = bearer(&headers) else {
        return (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
    };

    let guard = state.inner.read().await;
    match guard.tokens.get(token) {
        None => (StatusCode::UNAUTHORIZED, "Invalid token").into_response(),
        Some(home) if *home != tenant => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "token belongs to another tenant" })),
        )
            .into_response(),
        Some(_) => (
            StatusCode::OK,
            [("content-type", "text/event-stream")],
            "data: {\"text\":\"I am a mock tenant.\"}\n\n",
        )
            .into_response(),
    }
}
