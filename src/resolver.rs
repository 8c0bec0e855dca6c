//! Tenant endpoint discovery.
//!
//! A credential is bound to one upstream tenant. The resolver finds it by sending a
//! minimal chat request to each candidate base URL in priority order and persisting
//! whatever the upstream tells us: a working endpoint, or that the token is dead.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use reqwest::{
    Client, Proxy, Response, StatusCode,
    header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT},
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credential::{CredentialStatus, CredentialStore, normalize_endpoint};
use crate::{PoolError, preview_token};

pub const DEFAULT_USER_AGENT: &str =
    "augment.intellij/0.160.0 (Mac OS X; aarch64; 15.2) WebStorm/2024.3.5";
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SWEEP_CONCURRENCY: usize = 10;

const PROBE_PATH: &str = "chat-stream";
const INVALID_TOKEN_MARKER: &[u8] = b"Invalid token";
const REJECTION_SCAN_BYTES: usize = 1024;

/// Built-in candidate list: `d20` down to `d0`, then `i5` down to `i0`.
pub fn default_candidates() -> Vec<String> {
    let shared = (0..=20)
        .rev()
        .map(|n| format!("https://d{n}.api.augmentcode.com/"));
    let isolated = (0..=5)
        .rev()
        .map(|n| format!("https://i{n}.api.augmentcode.com/"));
    shared.chain(isolated).collect()
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Base URLs tried after the stored endpoint, in order.
    pub candidates: Vec<String>,
    pub probe_timeout: Duration,
    pub user_agent: String,
    pub sweep_concurrency: usize,
    pub proxy_url: Option<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            candidates: default_candidates(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            sweep_concurrency: DEFAULT_SWEEP_CONCURRENCY,
            proxy_url: None,
        }
    }
}

/// Stored endpoint first (when set), then the templates, without repeats.
pub fn candidate_list(stored: &str, templates: &[String]) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::with_capacity(templates.len() + 1);
    let stored = stored.trim();
    if !stored.is_empty() {
        candidates.push(stored.to_owned());
    }
    for template in templates {
        if !candidates.iter().any(|existing| existing == template) {
            candidates.push(template.clone());
        }
    }
    candidates
}

/// What one probe against one candidate says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// 200 with a non-empty body: the token belongs here.
    Valid,
    /// 401 carrying the invalid-token marker: the token is dead everywhere.
    InvalidToken,
    Inconclusive(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "endpoint", rename_all = "snake_case")]
pub enum Resolution {
    Resolved(String),
    Invalidated,
    EndpointNotFound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub updated: usize,
    pub disabled: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct EndpointResolver {
    client: Client,
    store: CredentialStore,
    config: Arc<ResolverConfig>,
}

impl EndpointResolver {
    pub fn new(store: CredentialStore, config: ResolverConfig) -> Result<Self, PoolError> {
        let mut builder = Client::builder().timeout(config.probe_timeout);
        if let Some(proxy_url) = config.proxy_url.as_deref().filter(|url| !url.is_empty()) {
            builder = builder.proxy(Proxy::all(proxy_url).map_err(PoolError::HttpClient)?);
        }
        let client = builder.build().map_err(PoolError::HttpClient)?;

        let mut config = config;
        config.candidates = config
            .candidates
            .iter()
            .filter_map(|candidate| match normalize_endpoint(candidate) {
                Ok(normalized) => Some(normalized),
                Err(err) => {
                    warn!("dropping candidate endpoint: {err}");
                    None
                }
            })
            .collect();
        config.sweep_concurrency = config.sweep_concurrency.max(1);

        Ok(Self {
            client,
            store,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Probes candidates until one answers definitively, then persists the result.
    pub async fn resolve(&self, token: &str) -> Result<Resolution, PoolError> {
        let record = self
            .store
            .get(token)
            .await?
            .ok_or_else(|| PoolError::CredentialNotFound(token.to_owned()))?;
        self.resolve_from(token, &record.tenant_endpoint).await
    }

    async fn resolve_from(&self, token: &str, stored: &str) -> Result<Resolution, PoolError> {
        let preview = preview_token(token);
        for candidate in candidate_list(stored, &self.config.candidates) {
            match self.probe(token, &candidate).await {
                ProbeOutcome::Valid => {
                    self.store.set_endpoint(token, &candidate).await?;
                    self.store
                        .set_status(token, CredentialStatus::Active)
                        .await?;
                    info!(token = %preview, endpoint = %candidate, "tenant endpoint resolved");
                    return Ok(Resolution::Resolved(candidate));
                }
                ProbeOutcome::InvalidToken => {
                    self.store
                        .set_status(token, CredentialStatus::Disabled)
                        .await?;
                    info!(token = %preview, endpoint = %candidate, "upstream rejected token, disabled");
                    return Ok(Resolution::Invalidated);
                }
                ProbeOutcome::Inconclusive(reason) => {
                    debug!(token = %preview, endpoint = %candidate, %reason, "probe inconclusive");
                }
            }
        }
        warn!(token = %preview, "no candidate endpoint accepted the token");
        Ok(Resolution::EndpointNotFound)
    }

    /// Sends one synthetic chat request. Never fails; transport trouble is inconclusive.
    pub async fn probe(&self, token: &str, base: &str) -> ProbeOutcome {
        let url = format!("{base}{PROBE_PATH}");
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(USER_AGENT, self.config.user_agent.as_str())
            .header("x-api-version", "2")
            .header("x-request-id", Uuid::new_v4().to_string())
            .header("x-request-session-id", Uuid::new_v4().to_string())
            .json(&probe_body())
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => return ProbeOutcome::Inconclusive(err.to_string()),
        };

        match response.status() {
            StatusCode::UNAUTHORIZED => match read_prefix(response, REJECTION_SCAN_BYTES).await {
                Ok(prefix) if contains(&prefix, INVALID_TOKEN_MARKER) => ProbeOutcome::InvalidToken,
                Ok(_) => ProbeOutcome::Inconclusive("401 without invalid-token marker".to_owned()),
                Err(err) => ProbeOutcome::Inconclusive(err.to_string()),
            },
            StatusCode::OK => match read_prefix(response, 1).await {
                Ok(first) if !first.is_empty() => ProbeOutcome::Valid,
                Ok(_) => ProbeOutcome::Inconclusive("empty 200 response".to_owned()),
                Err(err) => ProbeOutcome::Inconclusive(err.to_string()),
            },
            other => ProbeOutcome::Inconclusive(format!("unexpected status {other}")),
        }
    }

    /// Re-resolves every credential not already disabled, a bounded number at a time.
    pub async fn resolve_all(&self) -> Result<SweepReport, PoolError> {
        let report = Arc::new(Mutex::new(SweepReport::default()));
        let semaphore = Arc::new(Semaphore::new(self.config.sweep_concurrency));
        let mut tasks = JoinSet::new();

        for token in self.store.list_tokens().await? {
            let Some(record) = self.store.get(&token).await? else {
                continue;
            };
            if record.status == CredentialStatus::Disabled {
                continue;
            }

            let resolver = self.clone();
            let semaphore = semaphore.clone();
            let report = report.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let outcome = resolver.resolve_from(&token, &record.tenant_endpoint).await;

                let mut report = report.lock();
                report.checked += 1;
                match outcome {
                    Ok(Resolution::Resolved(endpoint)) if endpoint != record.tenant_endpoint => {
                        report.updated += 1;
                    }
                    Ok(Resolution::Invalidated) => report.disabled += 1,
                    Ok(_) => {}
                    Err(err) => {
                        report.failed += 1;
                        warn!(token = %preview_token(&token), "endpoint check failed: {err}");
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!("endpoint check task aborted: {err}");
            }
        }

        let report = *report.lock();
        info!(
            checked = report.checked,
            updated = report.updated,
            disabled = report.disabled,
            failed = report.failed,
            "endpoint sweep finished"
        );
        Ok(report)
    }
}

fn probe_body() -> Value {
    json!({
        "message": "hello，what is your name",
        "mode": "CHAT",
        "prefix": "You are AI assistant,help me to solve problems!",
        "suffix": " ",
        "lang": "HTML",
        "user_guidelines": "You are a helpful assistant, you can help me to solve problems and always answer in Chinese.",
        "workspace_guidelines": "",
        "feature_detection_flags": { "support_raw_output": true },
        "tool_definitions": [],
        "blobs": {
            "checkpoint_id": null,
            "added_blobs": [],
            "deleted_blobs": [],
        },
    })
}

/// Reads at most `limit` bytes of the body, stopping early at end of stream.
async fn read_prefix(mut response: Response, limit: usize) -> Result<Vec<u8>, reqwest::Error> {
    let mut buf = Vec::new();
    while buf.len() < limit {
        match response.chunk().await? {
            Some(chunk) => buf.extend_from_slice(&chunk),
            None => break,
        }
    }
    buf.truncate(limit);
    Ok(buf)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::kv::{KvStore, SqliteKv};
    use axum::{
        Router,
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::post,
    };
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn spawn(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn store() -> CredentialStore {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::in_memory(Arc::new(SystemClock)).await.unwrap());
        CredentialStore::new(kv)
    }

    fn config(candidates: Vec<String>) -> ResolverConfig {
        ResolverConfig {
            candidates,
            probe_timeout: Duration::from_millis(300),
            ..ResolverConfig::default()
        }
    }

    #[test]
    fn default_candidates_are_ordered() {
        let candidates = default_candidates();
        assert_eq!(candidates.len(), 27);
        assert_eq!(candidates[0], "https://d20.api.augmentcode.com/");
        assert_eq!(candidates[20], "https://d0.api.augmentcode.com/");
        assert_eq!(candidates[21], "https://i5.api.augmentcode.com/");
        assert_eq!(candidates[26], "https://i0.api.augmentcode.com/");
    }

    #[test]
    fn stored_endpoint_goes_first_without_duplicates() {
        let templates = vec!["https://a/".to_owned(), "https://b/".to_owned()];
        assert_eq!(
            candidate_list("https://b/", &templates),
            vec!["https://b/".to_owned(), "https://a/".to_owned()]
        );
        assert_eq!(candidate_list("", &templates), templates);
    }

    #[tokio::test]
    async fn invalid_token_disables_and_stops() {
        let later_hits = Arc::new(AtomicUsize::new(0));
        let counter = later_hits.clone();
        let app = Router::new()
            .route(
                "/reject/chat-stream",
                post(|| async { (AxumStatus::UNAUTHORIZED, "Invalid token") }),
            )
            .route(
                "/later/chat-stream",
                post(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        (AxumStatus::OK, "data: hi")
                    }
                }),
            );
        let addr = spawn(app).await;

        let store = store().await;
        store.save("tok", "").await.unwrap();
        let resolver = EndpointResolver::new(
            store.clone(),
            config(vec![
                format!("http://{addr}/reject/"),
                format!("http://{addr}/later/"),
            ]),
        )
        .unwrap();

        assert_eq!(resolver.resolve("tok").await.unwrap(), Resolution::Invalidated);
        assert_eq!(later_hits.load(Ordering::SeqCst), 0);
        let record = store.get("tok").await.unwrap().unwrap();
        assert_eq!(record.status, CredentialStatus::Disabled);
    }

    #[tokio::test]
    async fn stalled_endpoint_is_replaced_by_next_working_one() {
        let app = Router::new()
            .route(
                "/slow/chat-stream",
                post(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "too late"
                }),
            )
            .route("/ok/chat-stream", post(|| async { "data: hello" }));
        let addr = spawn(app).await;

        let store = store().await;
        store.save("tok", &format!("http://{addr}/slow/")).await.unwrap();
        store
            .set_status("tok", CredentialStatus::Disabled)
            .await
            .unwrap();
        let resolver =
            EndpointResolver::new(store.clone(), config(vec![format!("http://{addr}/ok/")]))
                .unwrap();

        let expected = format!("http://{addr}/ok/");
        assert_eq!(
            resolver.resolve("tok").await.unwrap(),
            Resolution::Resolved(expected.clone())
        );
        let record = store.get("tok").await.unwrap().unwrap();
        assert_eq!(record.tenant_endpoint, expected);
        assert_eq!(record.status, CredentialStatus::Active);
    }

    #[tokio::test]
    async fn exhausted_candidates_leave_record_untouched() {
        let app = Router::new()
            .route(
                "/plain401/chat-stream",
                post(|| async { (AxumStatus::UNAUTHORIZED, "nope") }),
            )
            .route("/empty/chat-stream", post(|| async { "" }))
            .route(
                "/boom/chat-stream",
                post(|| async { AxumStatus::INTERNAL_SERVER_ERROR }),
            );
        let addr = spawn(app).await;

        let store = store().await;
        store.save("tok", &format!("http://{addr}/boom/")).await.unwrap();
        let resolver = EndpointResolver::new(
            store.clone(),
            config(vec![
                format!("http://{addr}/plain401/"),
                format!("http://{addr}/empty/"),
            ]),
        )
        .unwrap();

        assert_eq!(
            resolver.resolve("tok").await.unwrap(),
            Resolution::EndpointNotFound
        );
        let record = store.get("tok").await.unwrap().unwrap();
        assert_eq!(record.tenant_endpoint, format!("http://{addr}/boom/"));
        assert_eq!(record.status, CredentialStatus::Active);
    }

    #[tokio::test]
    async fn credential_deleted_mid_check_stays_deleted() {
        let store = store().await;
        let accepting = store.clone();
        let rejecting = store.clone();
        let app = Router::new()
            .route(
                "/accept/chat-stream",
                post(move || {
                    let store = accepting.clone();
                    async move {
                        store.delete("kept").await.unwrap();
                        (AxumStatus::OK, "data: hello")
                    }
                }),
            )
            .route(
                "/reject/chat-stream",
                post(move || {
                    let store = rejecting.clone();
                    async move {
                        store.delete("retired").await.unwrap();
                        (AxumStatus::UNAUTHORIZED, "Invalid token")
                    }
                }),
            );
        let addr = spawn(app).await;

        store.save("kept", "").await.unwrap();
        store.save("retired", "").await.unwrap();

        let accept = EndpointResolver::new(
            store.clone(),
            config(vec![format!("http://{addr}/accept/")]),
        )
        .unwrap();
        assert!(matches!(
            accept.resolve("kept").await,
            Err(PoolError::CredentialNotFound(_))
        ));

        let reject = EndpointResolver::new(
            store.clone(),
            config(vec![format!("http://{addr}/reject/")]),
        )
        .unwrap();
        assert!(matches!(
            reject.resolve("retired").await,
            Err(PoolError::CredentialNotFound(_))
        ));

        assert!(store.get("kept").await.unwrap().is_none());
        assert!(store.get("retired").await.unwrap().is_none());
        assert!(store.list_tokens().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let resolver = EndpointResolver::new(store().await, config(Vec::new())).unwrap();
        assert!(matches!(
            resolver.resolve("ghost").await,
            Err(PoolError::CredentialNotFound(_))
        ));
    }

    #[tokio::test]
    async fn probe_sends_expected_headers() {
        let app = Router::new().route(
            "/chat-stream",
            post(|headers: HeaderMap| async move {
                let ok = headers.get("authorization").and_then(|v| v.to_str().ok())
                    == Some("Bearer tok")
                    && headers.get("x-api-version").and_then(|v| v.to_str().ok()) == Some("2")
                    && headers.contains_key("x-request-id")
                    && headers.contains_key("x-request-session-id")
                    && headers
                        .get("user-agent")
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|ua| ua.starts_with("augment.intellij/"));
                if ok {
                    (AxumStatus::OK, "data: hi")
                } else {
                    (AxumStatus::BAD_REQUEST, "")
                }
            }),
        );
        let addr = spawn(app).await;
        let resolver = EndpointResolver::new(store().await, config(Vec::new())).unwrap();
        assert_eq!(
            resolver.probe("tok", &format!("http://{addr}/")).await,
            ProbeOutcome::Valid
        );
    }

    #[tokio::test]
    async fn sweep_counts_outcomes_and_skips_disabled() {
        let app = Router::new().route(
            "/t/chat-stream",
            post(|headers: HeaderMap| async move {
                match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                    Some("Bearer dead") => (AxumStatus::UNAUTHORIZED, "Invalid token"),
                    _ => (AxumStatus::OK, "data: hi"),
                }
            }),
        );
        let addr = spawn(app).await;
        let good = format!("http://{addr}/t/");

        let store = store().await;
        store.save("fresh", "").await.unwrap();
        store.save("settled", &good).await.unwrap();
        store.save("dead", &good).await.unwrap();
        store.save("retired", "").await.unwrap();
        store
            .set_status("retired", CredentialStatus::Disabled)
            .await
            .unwrap();

        let resolver = EndpointResolver::new(store.clone(), config(vec![good.clone()])).unwrap();
        let report = resolver.resolve_all().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                checked: 3,
                updated: 1,
                disabled: 1,
                failed: 0,
            }
        );
        assert_eq!(
            store.get("fresh").await.unwrap().unwrap().tenant_endpoint,
            good
        );
        assert_eq!(
            store.get("retired").await.unwrap().unwrap().tenant_endpoint,
            ""
        );
    }
}
