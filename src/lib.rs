use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use futures_util::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{info, warn};

pub mod clock;
pub mod credential;
pub mod gate;
pub mod kv;
pub mod resolver;
pub mod selector;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::{
    Credential, CredentialRecord, CredentialStatus, CredentialStore, Limits, Usage, UsageMode,
};
pub use gate::{ConcurrencyGate, GateGuard};
pub use kv::{KvStore, SqliteKv};
pub use resolver::{EndpointResolver, ProbeOutcome, Resolution, ResolverConfig, SweepReport};
pub use selector::{Selection, Selector};
pub use tracker::{CooldownState, QuotaTracker, RequestStatus};

use credential::{normalize_endpoint, normalize_token};
use selector::is_eligible;

/// How many times admission re-selects after losing a race for a credential.
const ADMISSION_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no credentials configured")]
    PoolEmpty,
    #[error("too many requests, retry later")]
    AllBusy,
    #[error("credential {} not found", preview_token(.0))]
    CredentialNotFound(String),
    #[error("token must not be empty")]
    InvalidToken,
    #[error("invalid tenant endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("invalid limits: {0}")]
    InvalidLimits(String),
    #[error("database error: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("malformed value at '{key}': {reason}")]
    Malformed { key: String, reason: String },
    #[error("http client error: {0}")]
    HttpClient(reqwest::Error),
}

/// First few characters of a token, safe to put in logs.
pub fn preview_token(token: &str) -> String {
    let shown: String = token.chars().take(6).collect();
    format!("{shown}…")
}

/// One line of a bulk import.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImportEntry {
    pub token: String,
    #[serde(default)]
    pub tenant_endpoint: String,
}

impl ImportEntry {
    /// Parses `token` or `token endpoint` (comma or whitespace separated) per line.
    /// Blank lines and `#` comments are skipped.
    pub fn parse_lines(text: &str) -> Vec<ImportEntry> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let mut parts = line
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|part| !part.is_empty());
                let token = parts.next()?;
                Some(ImportEntry {
                    token: token.to_owned(),
                    tenant_endpoint: parts.next().unwrap_or_default().to_owned(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub created: usize,
    pub skipped: usize,
}

/// Bulk maintenance actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupAction {
    /// Chat, agent and total counters of every credential.
    UsageStats,
    /// Every daily bucket.
    DailyUsage,
    /// Every credential and everything it owns.
    AllTokens,
    /// Old daily buckets and finished request markers.
    ExpiredData,
}

impl CleanupAction {
    pub fn as_str(self) -> &'static str {
        match self {
            CleanupAction::UsageStats => "usage_stats",
            CleanupAction::DailyUsage => "daily_usage",
            CleanupAction::AllTokens => "all_tokens",
            CleanupAction::ExpiredData => "expired_data",
        }
    }
}

impl fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CleanupAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().replace('-', "_").as_str() {
            "usage_stats" => Ok(CleanupAction::UsageStats),
            "daily_usage" => Ok(CleanupAction::DailyUsage),
            "all_tokens" => Ok(CleanupAction::AllTokens),
            "expired_data" => Ok(CleanupAction::ExpiredData),
            other => Err(format!("unknown cleanup action '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialPage {
    pub total: usize,
    pub items: Vec<Credential>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub total: usize,
    pub active: usize,
    pub disabled: usize,
    pub enabled: usize,
    pub in_progress: usize,
    pub cooling: usize,
    pub eligible: usize,
}

/// Credential pool with admission control, usage accounting and endpoint repair.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    store: CredentialStore,
    tracker: QuotaTracker,
    selector: Selector,
    resolver: EndpointResolver,
    gate: Arc<ConcurrencyGate>,
}

impl CredentialPool {
    /// Opens (or creates) the SQLite database and uses the system clock.
    pub async fn open(database: &str, resolver: ResolverConfig) -> Result<Self, PoolError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let kv = SqliteKv::open(database, clock.clone()).await?;
        Self::with_store(Arc::new(kv), clock, resolver)
    }

    pub fn with_store(
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        resolver: ResolverConfig,
    ) -> Result<Self, PoolError> {
        let store = CredentialStore::new(kv.clone());
        let tracker = QuotaTracker::new(kv, clock);
        Ok(Self {
            selector: Selector::new(store.clone(), tracker.clone()),
            resolver: EndpointResolver::new(store.clone(), resolver)?,
            gate: Arc::new(ConcurrencyGate::new()),
            store,
            tracker,
        })
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn tracker(&self) -> &QuotaTracker {
        &self.tracker
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Picks an eligible credential without reserving it.
    pub async fn select_credential(&self) -> Result<Selection, PoolError> {
        self.selector.select().await
    }

    pub async fn mark_request_start(&self, token: &str) -> Result<(), PoolError> {
        let status = RequestStatus {
            in_progress: true,
            last_request_at: Some(self.tracker.now()),
        };
        self.tracker.set_request_status(token, status).await
    }

    /// Charges the daily quota and clears the in-progress flag.
    pub async fn mark_request_complete(&self, token: &str) -> Result<(), PoolError> {
        self.tracker.increment_daily_usage(token).await?;
        let status = RequestStatus {
            in_progress: false,
            last_request_at: Some(self.tracker.now()),
        };
        self.tracker.set_request_status(token, status).await
    }

    pub async fn record_usage(&self, token: &str, mode: UsageMode) -> Result<(), PoolError> {
        self.tracker.increment_mode_usage(token, mode).await?;
        Ok(())
    }

    /// Selects a credential and holds it for one request.
    ///
    /// The pick is re-checked once its gate is held, since another request may have
    /// taken it in between. Losing that race retries selection a few times before
    /// giving up with [`PoolError::AllBusy`].
    pub async fn admit(&self) -> Result<CredentialLease, PoolError> {
        for _ in 0..ADMISSION_ATTEMPTS {
            let selection = self.selector.select().await?;
            let guard = self.gate.acquire(&selection.token).await;

            let still_eligible = self
                .selector
                .snapshot(&selection.token)
                .await?
                .is_some_and(|credential| is_eligible(&credential, self.tracker.now()));
            if !still_eligible {
                continue;
            }

            self.mark_request_start(&selection.token).await?;
            return Ok(CredentialLease {
                pool: self.clone(),
                selection,
                guard: Some(guard),
                completed: false,
            });
        }
        Err(PoolError::AllBusy)
    }

    pub async fn resolve_endpoint(&self, token: &str) -> Result<Resolution, PoolError> {
        self.resolver.resolve(token).await
    }

    pub async fn resolve_all(&self) -> Result<SweepReport, PoolError> {
        self.resolver.resolve_all().await
    }

    /// Validates every entry up front, then creates the new ones.
    pub async fn import_credentials(
        &self,
        entries: &[ImportEntry],
    ) -> Result<ImportReport, PoolError> {
        let mut normalized = Vec::with_capacity(entries.len());
        for entry in entries {
            let token = normalize_token(&entry.token)?;
            let endpoint = if entry.tenant_endpoint.trim().is_empty() {
                String::new()
            } else {
                normalize_endpoint(&entry.tenant_endpoint)?
            };
            normalized.push((token, endpoint));
        }

        let mut report = ImportReport::default();
        for (token, endpoint) in normalized {
            if self.store.save(&token, &endpoint).await? {
                report.created += 1;
            } else {
                report.skipped += 1;
            }
        }
        info!(
            created = report.created,
            skipped = report.skipped,
            "credentials imported"
        );
        Ok(report)
    }

    pub async fn delete_credential(&self, token: &str) -> Result<bool, PoolError> {
        let existed = self.store.delete(token).await?;
        self.gate.forget(token);
        if existed {
            info!(token = %preview_token(token), "credential deleted");
        }
        Ok(existed)
    }

    pub async fn credential(&self, token: &str) -> Result<Credential, PoolError> {
        self.selector
            .snapshot(token)
            .await?
            .ok_or_else(|| PoolError::CredentialNotFound(token.to_owned()))
    }

    /// Credentials ordered by token, descending. `None` returns everything.
    pub async fn list_credentials(
        &self,
        page: Option<PageRequest>,
    ) -> Result<CredentialPage, PoolError> {
        let mut tokens = self.store.list_tokens().await?;
        tokens.sort_unstable_by(|a, b| b.cmp(a));
        let total = tokens.len();

        let selected: Vec<String> = match page {
            Some(PageRequest { page, page_size }) => {
                let page_size = page_size.max(1);
                let start = page.max(1).saturating_sub(1).saturating_mul(page_size);
                tokens.into_iter().skip(start).take(page_size).collect()
            }
            None => tokens,
        };

        let items: Vec<Option<Credential>> = stream::iter(selected)
            .map(|token| async move { self.selector.snapshot(&token).await })
            .buffered(8)
            .try_collect()
            .await?;
        Ok(CredentialPage {
            total,
            items: items.into_iter().flatten().collect(),
        })
    }

    pub async fn summary(&self) -> Result<PoolSummary, PoolError> {
        let now = self.tracker.now();
        let credentials = self.selector.snapshot_all().await?;
        let mut summary = PoolSummary {
            total: credentials.len(),
            ..PoolSummary::default()
        };
        for credential in &credentials {
            match credential.record.status {
                CredentialStatus::Active => summary.active += 1,
                CredentialStatus::Disabled => summary.disabled += 1,
            }
            if credential.record.enabled {
                summary.enabled += 1;
            }
            if credential.in_progress {
                summary.in_progress += 1;
            }
            if credential.in_cooldown(now) {
                summary.cooling += 1;
            }
            if is_eligible(credential, now) {
                summary.eligible += 1;
            }
        }
        Ok(summary)
    }

    pub async fn set_enabled(&self, token: &str, enabled: bool) -> Result<(), PoolError> {
        self.store.set_enabled(token, enabled).await
    }

    pub async fn update_limits(&self, token: &str, limits: Limits) -> Result<(), PoolError> {
        self.store.set_limits(token, limits).await
    }

    pub async fn update_remark(&self, token: &str, remark: &str) -> Result<(), PoolError> {
        self.store.set_remark(token, remark).await
    }

    pub async fn set_cooldown(&self, token: &str, duration: Duration) -> Result<(), PoolError> {
        self.require(token).await?;
        self.tracker.set_cooldown(token, duration).await
    }

    pub async fn reset_usage(&self, token: &str) -> Result<(), PoolError> {
        self.require(token).await?;
        self.tracker.reset_usage(token).await
    }

    /// Runs a maintenance action and returns how many entries it removed.
    pub async fn cleanup(&self, action: CleanupAction) -> Result<usize, PoolError> {
        let cleaned = match action {
            CleanupAction::UsageStats => self.tracker.clear_usage_stats().await?,
            CleanupAction::DailyUsage => self.tracker.clear_daily_usage().await?,
            CleanupAction::ExpiredData => self.tracker.purge_stale().await?,
            CleanupAction::AllTokens => {
                let mut removed = 0;
                for token in self.store.list_tokens().await? {
                    if self.store.delete(&token).await? {
                        removed += 1;
                    }
                    self.gate.forget(&token);
                }
                removed
            }
        };
        info!(action = %action, cleaned, "cleanup finished");
        Ok(cleaned)
    }

    pub async fn backfill_defaults(&self) -> Result<usize, PoolError> {
        self.store.backfill_defaults().await
    }

    async fn require(&self, token: &str) -> Result<(), PoolError> {
        if self.store.exists(token).await? {
            Ok(())
        } else {
            Err(PoolError::CredentialNotFound(token.to_owned()))
        }
    }
}

/// One credential held for one request.
///
/// Call [`CredentialLease::complete`] when the upstream call finishes. A lease
/// dropped without completing still releases the gate and clears the in-progress
/// flag in the background, but charges no usage.
#[derive(Debug)]
pub struct CredentialLease {
    pool: CredentialPool,
    selection: Selection,
    guard: Option<GateGuard>,
    completed: bool,
}

impl CredentialLease {
    pub fn token(&self) -> &str {
        &self.selection.token
    }

    pub fn tenant_endpoint(&self) -> &str {
        &self.selection.tenant_endpoint
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub async fn complete(mut self, mode: UsageMode) -> Result<(), PoolError> {
        self.pool.record_usage(&self.selection.token, mode).await?;
        self.pool.mark_request_complete(&self.selection.token).await?;
        self.completed = true;
        Ok(())
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        let guard = self.guard.take();
        let tracker = self.pool.tracker.clone();
        let token = std::mem::take(&mut self.selection.token);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let status = RequestStatus {
                        in_progress: false,
                        last_request_at: Some(tracker.now()),
                    };
                    if let Err(err) = tracker.set_request_status(&token, status).await {
                        warn!(token = %preview_token(&token), "failed to release abandoned lease: {err}");
                    }
                    drop(guard);
                });
            }
            Err(_) => {
                warn!(
                    token = %preview_token(&token),
                    "lease dropped outside a runtime, in-progress marker left to expire"
                );
            }
        }
    }
}
