//! Admission control: which credential, if any, may serve the next request.

use chrono::{DateTime, Duration, Local};
use futures_util::{StreamExt, TryStreamExt, stream};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::PoolError;
use crate::credential::{Credential, CredentialStatus, CredentialStore, Usage, UsageMode};
use crate::tracker::QuotaTracker;

const SNAPSHOT_CONCURRENCY: usize = 8;

/// The credential handed to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub token: String,
    pub tenant_endpoint: String,
}

impl From<&Credential> for Selection {
    fn from(credential: &Credential) -> Self {
        Self {
            token: credential.token().to_owned(),
            tenant_endpoint: credential.tenant_endpoint().to_owned(),
        }
    }
}

pub fn is_eligible(credential: &Credential, now: DateTime<Local>) -> bool {
    let record = &credential.record;
    let limits = &record.limits;
    // An interval chrono cannot represent never elapses.
    let paced = credential.last_request_at.is_none_or(|at| {
        Duration::try_seconds(limits.request_interval_secs)
            .is_some_and(|interval| now - at >= interval)
    });

    record.status == CredentialStatus::Active
        && record.enabled
        && !record.tenant_endpoint.is_empty()
        && !credential.in_progress
        && paced
        && credential.usage.chat < limits.chat_limit
        && credential.usage.agent < limits.agent_limit
        && credential.usage.daily < limits.daily_limit
}

/// Drops ineligible credentials and splits the rest into `(ready, cooling)`.
pub fn partition(
    credentials: Vec<Credential>,
    now: DateTime<Local>,
) -> (Vec<Credential>, Vec<Credential>) {
    credentials
        .into_iter()
        .filter(|credential| is_eligible(credential, now))
        .partition(|credential| !credential.in_cooldown(now))
}

/// Uniform pick from `ready`, falling back to `cooling` only when `ready` is empty.
pub fn pick<'a, R: Rng + ?Sized>(
    ready: &'a [Credential],
    cooling: &'a [Credential],
    rng: &mut R,
) -> Option<&'a Credential> {
    if ready.is_empty() {
        cooling.choose(rng)
    } else {
        ready.choose(rng)
    }
}

#[derive(Debug, Clone)]
pub struct Selector {
    store: CredentialStore,
    tracker: QuotaTracker,
}

impl Selector {
    pub fn new(store: CredentialStore, tracker: QuotaTracker) -> Self {
        Self { store, tracker }
    }

    /// Reads everything known about one credential. `None` when it does not exist.
    pub async fn snapshot(&self, token: &str) -> Result<Option<Credential>, PoolError> {
        let Some(record) = self.store.get(token).await? else {
            return Ok(None);
        };

        let usage = Usage {
            chat: self.tracker.mode_usage(token, UsageMode::Chat).await?,
            agent: self.tracker.mode_usage(token, UsageMode::Agent).await?,
            total: self.tracker.total_usage(token).await?,
            daily: self.tracker.daily_usage(token).await?,
        };
        let cooldown = self.tracker.cooldown(token).await?;
        let status = self.tracker.request_status(token).await?;

        Ok(Some(Credential {
            record,
            usage,
            in_progress: status.in_progress,
            last_request_at: status.last_request_at,
            cool_end: if cooldown.in_cool {
                cooldown.cool_end
            } else {
                None
            },
        }))
    }

    pub async fn snapshot_all(&self) -> Result<Vec<Credential>, PoolError> {
        let tokens = self.store.list_tokens().await?;
        self.snapshot_tokens(tokens).await
    }

    async fn snapshot_tokens(&self, tokens: Vec<String>) -> Result<Vec<Credential>, PoolError> {
        let snapshots: Vec<Option<Credential>> = stream::iter(tokens)
            .map(|token| async move { self.snapshot(&token).await })
            .buffered(SNAPSHOT_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(snapshots.into_iter().flatten().collect())
    }

    /// Picks a credential without reserving it.
    pub async fn select(&self) -> Result<Selection, PoolError> {
        let tokens = self.store.list_tokens().await?;
        if tokens.is_empty() {
            return Err(PoolError::PoolEmpty);
        }

        let credentials = self.snapshot_tokens(tokens).await?;
        let (ready, cooling) = partition(credentials, self.tracker.now());
        let mut rng = rand::thread_rng();
        pick(&ready, &cooling, &mut rng)
            .map(Selection::from)
            .ok_or(PoolError::AllBusy)
    }
}
