//! Usage counters, cooldown windows and in-flight request markers.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::PoolError;
use crate::clock::{Clock, next_local_midnight};
use crate::credential::{
    DAILY_USAGE_PREFIX, REQUEST_STATUS_PREFIX, UsageMode, cooldown_key, daily_usage_key,
    mode_usage_key, request_status_key, usage_key,
};
use crate::kv::KvStore;

/// Safety net for holders that crash while marked in-progress.
pub const REQUEST_STATUS_TTL: Duration = Duration::from_secs(60 * 60);

const DAILY_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStatus {
    pub in_progress: bool,
    #[serde(default)]
    pub last_request_at: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownState {
    pub in_cool: bool,
    #[serde(default)]
    pub cool_end: Option<DateTime<Local>>,
}

#[derive(Debug, Clone)]
pub struct QuotaTracker {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl QuotaTracker {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    /// Bumps today's bucket and pins its expiry to the next local midnight.
    pub async fn increment_daily_usage(&self, token: &str) -> Result<i64, PoolError> {
        let now = self.clock.now();
        let key = daily_usage_key(token, now.date_naive());
        let value = self.kv.incr(&key).await?;
        let ttl = (next_local_midnight(now) - now)
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        self.kv.expire(&key, ttl).await?;
        Ok(value)
    }

    pub async fn daily_usage(&self, token: &str) -> Result<i64, PoolError> {
        let today = self.clock.now().date_naive();
        self.read_counter(&daily_usage_key(token, today)).await
    }

    pub async fn mode_usage(&self, token: &str, mode: UsageMode) -> Result<i64, PoolError> {
        self.read_counter(&mode_usage_key(token, mode)).await
    }

    pub async fn total_usage(&self, token: &str) -> Result<i64, PoolError> {
        self.read_counter(&usage_key(token)).await
    }

    /// Charges one request against the mode counter and the running total.
    pub async fn increment_mode_usage(&self, token: &str, mode: UsageMode) -> Result<i64, PoolError> {
        let value = self.kv.incr(&mode_usage_key(token, mode)).await?;
        self.kv.incr(&usage_key(token)).await?;
        Ok(value)
    }

    /// Zeroes the chat, agent and total counters of one credential.
    pub async fn reset_usage(&self, token: &str) -> Result<(), PoolError> {
        self.kv.delete(&usage_key(token)).await?;
        self.kv.delete(&mode_usage_key(token, UsageMode::Chat)).await?;
        self.kv.delete(&mode_usage_key(token, UsageMode::Agent)).await?;
        Ok(())
    }

    /// Puts the credential in cooldown for `duration`. A zero duration clears it.
    pub async fn set_cooldown(&self, token: &str, duration: Duration) -> Result<(), PoolError> {
        let key = cooldown_key(token);
        if duration.is_zero() {
            self.kv.delete(&key).await?;
            return Ok(());
        }

        let span = chrono::Duration::from_std(duration).map_err(|err| {
            PoolError::InvalidLimits(format!("cooldown duration out of range: {err}"))
        })?;
        let cool_end = self.clock.now().checked_add_signed(span).ok_or_else(|| {
            PoolError::InvalidLimits("cooldown duration out of range".to_owned())
        })?;
        let state = CooldownState {
            in_cool: true,
            cool_end: Some(cool_end),
        };
        let encoded = encode(&key, &state)?;
        self.kv.set(&key, &encoded, Some(duration)).await
    }

    /// Current cooldown state. A lapsed window reads as not cooling even if the
    /// stored record still says otherwise.
    pub async fn cooldown(&self, token: &str) -> Result<CooldownState, PoolError> {
        let key = cooldown_key(token);
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(CooldownState::default());
        };
        let mut state: CooldownState = decode(&key, &raw)?;
        let now = self.clock.now();
        if state.cool_end.is_none_or(|end| now >= end) {
            state.in_cool = false;
        }
        Ok(state)
    }

    pub async fn set_request_status(
        &self,
        token: &str,
        status: RequestStatus,
    ) -> Result<(), PoolError> {
        let key = request_status_key(token);
        let encoded = encode(&key, &status)?;
        self.kv.set(&key, &encoded, Some(REQUEST_STATUS_TTL)).await
    }

    pub async fn request_status(&self, token: &str) -> Result<RequestStatus, PoolError> {
        let key = request_status_key(token);
        match self.kv.get(&key).await? {
            Some(raw) => decode(&key, &raw),
            None => Ok(RequestStatus::default()),
        }
    }

    /// Drops every chat, agent and total counter. Returns how many keys went away.
    pub async fn clear_usage_stats(&self) -> Result<usize, PoolError> {
        let mut cleaned = 0;
        for pattern in ["token_usage:*", "token_usage_chat:*", "token_usage_agent:*"] {
            cleaned += self.delete_matching(pattern).await?;
        }
        Ok(cleaned)
    }

    /// Drops every daily bucket, including today's.
    pub async fn clear_daily_usage(&self) -> Result<usize, PoolError> {
        self.delete_matching(&format!("{DAILY_USAGE_PREFIX}*")).await
    }

    /// Removes daily buckets older than a week and finished request markers older
    /// than an hour, then purges rows already past their expiry.
    pub async fn purge_stale(&self) -> Result<usize, PoolError> {
        let now = self.clock.now();
        let cutoff = now.date_naive() - chrono::Duration::days(DAILY_RETENTION_DAYS);
        let mut cleaned = 0;

        for key in self.kv.keys(&format!("{DAILY_USAGE_PREFIX}*")).await? {
            let day = key
                .rsplit(':')
                .next()
                .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok());
            if day.is_some_and(|day| day < cutoff) && self.kv.delete(&key).await? {
                cleaned += 1;
            }
        }

        let stale_after = chrono::Duration::hours(1);
        for key in self.kv.keys(&format!("{REQUEST_STATUS_PREFIX}*")).await? {
            let Some(raw) = self.kv.get(&key).await? else {
                continue;
            };
            // Unreadable markers are left for the TTL to collect.
            let Ok(status) = serde_json::from_str::<RequestStatus>(&raw) else {
                continue;
            };
            let finished_long_ago = !status.in_progress
                && status
                    .last_request_at
                    .is_none_or(|at| now - at > stale_after);
            if finished_long_ago && self.kv.delete(&key).await? {
                cleaned += 1;
            }
        }

        let expired = self.kv.purge_expired().await?;
        Ok(cleaned + usize::try_from(expired).unwrap_or(usize::MAX))
    }

    pub(crate) fn now(&self) -> DateTime<Local> {
        self.clock.now()
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize, PoolError> {
        let mut cleaned = 0;
        for key in self.kv.keys(pattern).await? {
            if self.kv.delete(&key).await? {
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }

    async fn read_counter(&self, key: &str) -> Result<i64, PoolError> {
        match self.kv.get(key).await? {
            None => Ok(0),
            Some(raw) => raw.trim().parse::<i64>().map_err(|err| PoolError::Malformed {
                key: key.to_owned(),
                reason: err.to_string(),
            }),
        }
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, PoolError> {
    serde_json::to_string(value).map_err(|err| PoolError::Malformed {
        key: key.to_owned(),
        reason: err.to_string(),
    })
}

fn decode<T: for<'de> Deserialize<'de>>(key: &str, raw: &str) -> Result<T, PoolError> {
    serde_json::from_str(raw).map_err(|err| PoolError::Malformed {
        key: key.to_owned(),
        reason: err.to_string(),
    })
}
