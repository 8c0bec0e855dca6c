//! Persisted credential records and the key layout shared by the tracker.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::PoolError;
use crate::kv::{KvStore, glob_escape};

pub const DEFAULT_REQUEST_INTERVAL_SECS: i64 = 3;
pub const DEFAULT_CHAT_LIMIT: i64 = 3000;
pub const DEFAULT_AGENT_LIMIT: i64 = 50;
pub const DEFAULT_DAILY_LIMIT: i64 = 1000;

const MAX_REQUEST_INTERVAL_SECS: i64 = 3600;

const TOKEN_PREFIX: &str = "token:";
const USAGE_PREFIX: &str = "token_usage:";
const CHAT_USAGE_PREFIX: &str = "token_usage_chat:";
const AGENT_USAGE_PREFIX: &str = "token_usage_agent:";
pub(crate) const DAILY_USAGE_PREFIX: &str = "token_daily_usage:";
pub(crate) const REQUEST_STATUS_PREFIX: &str = "token_status:";
const COOLDOWN_PREFIX: &str = "token_cool_status:";

const FIELD_TENANT_URL: &str = "tenant_url";
const FIELD_STATUS: &str = "status";
const FIELD_REMARK: &str = "remark";
const FIELD_ENABLED: &str = "enabled";
const FIELD_REQUEST_INTERVAL: &str = "request_interval";
const FIELD_CHAT_LIMIT: &str = "chat_limit";
const FIELD_AGENT_LIMIT: &str = "agent_limit";
const FIELD_DAILY_LIMIT: &str = "daily_limit";

pub(crate) fn token_key(token: &str) -> String {
    format!("{TOKEN_PREFIX}{token}")
}

pub(crate) fn usage_key(token: &str) -> String {
    format!("{USAGE_PREFIX}{token}")
}

pub(crate) fn mode_usage_key(token: &str, mode: UsageMode) -> String {
    match mode {
        UsageMode::Chat => format!("{CHAT_USAGE_PREFIX}{token}"),
        UsageMode::Agent => format!("{AGENT_USAGE_PREFIX}{token}"),
    }
}

pub(crate) fn daily_usage_key(token: &str, day: NaiveDate) -> String {
    format!("{DAILY_USAGE_PREFIX}{token}:{}", day.format("%Y-%m-%d"))
}

pub(crate) fn request_status_key(token: &str) -> String {
    format!("{REQUEST_STATUS_PREFIX}{token}")
}

pub(crate) fn cooldown_key(token: &str) -> String {
    format!("{COOLDOWN_PREFIX}{token}")
}

/// Resolver-controlled state. Only a probe flips it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    Disabled,
}

impl CredentialStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Disabled => "disabled",
        }
    }

    // Anything but an explicit "disabled" counts as active.
    fn from_stored(raw: Option<&str>) -> Self {
        match raw {
            Some("disabled") => CredentialStatus::Disabled,
            _ => CredentialStatus::Active,
        }
    }
}

/// Which per-mode quota a completed request is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageMode {
    Chat,
    Agent,
}

impl UsageMode {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageMode::Chat => "chat",
            UsageMode::Agent => "agent",
        }
    }
}

impl fmt::Display for UsageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(UsageMode::Chat),
            "agent" => Ok(UsageMode::Agent),
            other => Err(format!("unknown usage mode '{other}'")),
        }
    }
}

/// Pacing and quota ceilings of one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub request_interval_secs: i64,
    pub chat_limit: i64,
    pub agent_limit: i64,
    pub daily_limit: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            request_interval_secs: DEFAULT_REQUEST_INTERVAL_SECS,
            chat_limit: DEFAULT_CHAT_LIMIT,
            agent_limit: DEFAULT_AGENT_LIMIT,
            daily_limit: DEFAULT_DAILY_LIMIT,
        }
    }
}

impl Limits {
    pub fn validate(&self) -> Result<(), PoolError> {
        if !(1..=MAX_REQUEST_INTERVAL_SECS).contains(&self.request_interval_secs) {
            return Err(PoolError::InvalidLimits(format!(
                "request interval must be between 1 and {MAX_REQUEST_INTERVAL_SECS} seconds"
            )));
        }
        if self.chat_limit < 0 || self.agent_limit < 0 || self.daily_limit < 0 {
            return Err(PoolError::InvalidLimits(
                "limits must not be negative".to_owned(),
            ));
        }
        Ok(())
    }
}

/// The identity hash of a credential, without any counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialRecord {
    pub token: String,
    /// Normalized base URL, empty when none is known yet.
    pub tenant_endpoint: String,
    pub status: CredentialStatus,
    pub enabled: bool,
    pub remark: String,
    pub limits: Limits,
}

impl CredentialRecord {
    fn from_fields(token: &str, fields: &HashMap<String, String>) -> Result<Self, PoolError> {
        let key = token_key(token);
        let number = |field: &str, default: i64| -> Result<i64, PoolError> {
            match fields.get(field) {
                None => Ok(default),
                Some(raw) => raw.trim().parse::<i64>().map_err(|err| PoolError::Malformed {
                    key: format!("{key}#{field}"),
                    reason: err.to_string(),
                }),
            }
        };

        let limits = Limits {
            request_interval_secs: number(FIELD_REQUEST_INTERVAL, DEFAULT_REQUEST_INTERVAL_SECS)?,
            chat_limit: number(FIELD_CHAT_LIMIT, DEFAULT_CHAT_LIMIT)?,
            agent_limit: number(FIELD_AGENT_LIMIT, DEFAULT_AGENT_LIMIT)?,
            daily_limit: number(FIELD_DAILY_LIMIT, DEFAULT_DAILY_LIMIT)?,
        };
        // Stored limits bypass the admin write path, so hold them to the same bounds.
        limits.validate().map_err(|err| PoolError::Malformed {
            key: key.clone(),
            reason: err.to_string(),
        })?;

        Ok(Self {
            token: token.to_owned(),
            tenant_endpoint: fields.get(FIELD_TENANT_URL).cloned().unwrap_or_default(),
            status: CredentialStatus::from_stored(fields.get(FIELD_STATUS).map(String::as_str)),
            enabled: fields
                .get(FIELD_ENABLED)
                .map(|raw| raw == "true")
                .unwrap_or(true),
            remark: fields.get(FIELD_REMARK).cloned().unwrap_or_default(),
            limits,
        })
    }
}

/// Usage counters of one credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub chat: i64,
    pub agent: i64,
    pub total: i64,
    pub daily: i64,
}

/// Everything selection needs to know about one credential at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Credential {
    pub record: CredentialRecord,
    pub usage: Usage,
    pub in_progress: bool,
    pub last_request_at: Option<DateTime<Local>>,
    /// End of the current cooldown window, if one is stored and has not lapsed.
    pub cool_end: Option<DateTime<Local>>,
}

impl Credential {
    pub fn token(&self) -> &str {
        &self.record.token
    }

    pub fn tenant_endpoint(&self) -> &str {
        &self.record.tenant_endpoint
    }

    pub fn in_cooldown(&self, now: DateTime<Local>) -> bool {
        self.cool_end.is_some_and(|end| now < end)
    }
}

/// Trims and validates a token.
pub fn normalize_token(raw: &str) -> Result<String, PoolError> {
    let token = raw.trim();
    if token.is_empty() {
        return Err(PoolError::InvalidToken);
    }
    Ok(token.to_owned())
}

/// Parses an http(s) base URL and guarantees a trailing `/` so paths can be appended.
pub fn normalize_endpoint(raw: &str) -> Result<String, PoolError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|err| PoolError::InvalidEndpoint {
        endpoint: trimmed.to_owned(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(PoolError::InvalidEndpoint {
            endpoint: trimmed.to_owned(),
            reason: "expected an http(s) URL with a host".to_owned(),
        });
    }
    let mut normalized = url.to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Accessors over the credential identity hashes.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    kv: Arc<dyn KvStore>,
}

impl CredentialStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn list_tokens(&self) -> Result<Vec<String>, PoolError> {
        let keys = self.kv.keys(&format!("{TOKEN_PREFIX}*")).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(TOKEN_PREFIX).map(str::to_owned))
            .filter(|token| !token.is_empty())
            .collect())
    }

    pub async fn exists(&self, token: &str) -> Result<bool, PoolError> {
        self.kv.exists(&token_key(token)).await
    }

    pub async fn get(&self, token: &str) -> Result<Option<CredentialRecord>, PoolError> {
        let fields = self.kv.hgetall(&token_key(token)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        CredentialRecord::from_fields(token, &fields).map(Some)
    }

    /// Creates a credential with default fields. Returns `false` when it already exists.
    ///
    /// An empty endpoint is stored as-is; the credential stays unselectable until a
    /// probe resolves one.
    pub async fn save(&self, token: &str, endpoint: &str) -> Result<bool, PoolError> {
        let token = normalize_token(token)?;
        let endpoint = if endpoint.trim().is_empty() {
            String::new()
        } else {
            normalize_endpoint(endpoint)?
        };
        let key = token_key(&token);

        if self.kv.exists(&key).await? {
            return Ok(false);
        }

        let limits = Limits::default();
        let fields = [
            (FIELD_TENANT_URL, endpoint),
            (FIELD_STATUS, CredentialStatus::Active.as_str().to_owned()),
            (FIELD_REMARK, String::new()),
            (FIELD_ENABLED, "true".to_owned()),
            (
                FIELD_REQUEST_INTERVAL,
                limits.request_interval_secs.to_string(),
            ),
            (FIELD_CHAT_LIMIT, limits.chat_limit.to_string()),
            (FIELD_AGENT_LIMIT, limits.agent_limit.to_string()),
            (FIELD_DAILY_LIMIT, limits.daily_limit.to_string()),
        ];
        for (field, value) in fields {
            self.kv.hset(&key, field, &value).await?;
        }
        Ok(true)
    }

    /// Deletes the credential and every counter, status and cooldown key it owns.
    pub async fn delete(&self, token: &str) -> Result<bool, PoolError> {
        let key = token_key(token);
        if !self.kv.exists(&key).await? {
            return Ok(false);
        }

        self.kv.delete(&key).await?;
        self.kv.delete(&usage_key(token)).await?;
        self.kv.delete(&mode_usage_key(token, UsageMode::Chat)).await?;
        self.kv.delete(&mode_usage_key(token, UsageMode::Agent)).await?;
        self.kv.delete(&request_status_key(token)).await?;
        self.kv.delete(&cooldown_key(token)).await?;

        let daily_pattern = format!("{DAILY_USAGE_PREFIX}{}:*", glob_escape(token));
        for daily in self.kv.keys(&daily_pattern).await? {
            self.kv.delete(&daily).await?;
        }
        Ok(true)
    }

    /// Updates the endpoint of an existing credential. Never creates one.
    pub async fn set_endpoint(&self, token: &str, endpoint: &str) -> Result<(), PoolError> {
        let endpoint = normalize_endpoint(endpoint)?;
        self.require(token).await?;
        self.kv
            .hset(&token_key(token), FIELD_TENANT_URL, &endpoint)
            .await
    }

    pub async fn set_status(&self, token: &str, status: CredentialStatus) -> Result<(), PoolError> {
        self.require(token).await?;
        self.kv
            .hset(&token_key(token), FIELD_STATUS, status.as_str())
            .await
    }

    pub async fn set_enabled(&self, token: &str, enabled: bool) -> Result<(), PoolError> {
        self.require(token).await?;
        let value = if enabled { "true" } else { "false" };
        self.kv.hset(&token_key(token), FIELD_ENABLED, value).await
    }

    pub async fn set_limits(&self, token: &str, limits: Limits) -> Result<(), PoolError> {
        limits.validate()?;
        self.require(token).await?;
        let key = token_key(token);
        self.kv
            .hset(
                &key,
                FIELD_REQUEST_INTERVAL,
                &limits.request_interval_secs.to_string(),
            )
            .await?;
        self.kv
            .hset(&key, FIELD_CHAT_LIMIT, &limits.chat_limit.to_string())
            .await?;
        self.kv
            .hset(&key, FIELD_AGENT_LIMIT, &limits.agent_limit.to_string())
            .await?;
        self.kv
            .hset(&key, FIELD_DAILY_LIMIT, &limits.daily_limit.to_string())
            .await
    }

    pub async fn set_remark(&self, token: &str, remark: &str) -> Result<(), PoolError> {
        self.require(token).await?;
        self.kv.hset(&token_key(token), FIELD_REMARK, remark).await
    }

    /// Writes default values for fields missing from older credential hashes.
    ///
    /// Returns how many credentials were touched.
    pub async fn backfill_defaults(&self) -> Result<usize, PoolError> {
        let limits = Limits::default();
        let defaults = [
            (FIELD_STATUS, CredentialStatus::Active.as_str().to_owned()),
            (FIELD_REMARK, String::new()),
            (FIELD_ENABLED, "true".to_owned()),
            (
                FIELD_REQUEST_INTERVAL,
                limits.request_interval_secs.to_string(),
            ),
            (FIELD_CHAT_LIMIT, limits.chat_limit.to_string()),
            (FIELD_AGENT_LIMIT, limits.agent_limit.to_string()),
            (FIELD_DAILY_LIMIT, limits.daily_limit.to_string()),
        ];

        let mut touched = 0;
        for token in self.list_tokens().await? {
            let key = token_key(&token);
            let mut changed = false;
            for (field, value) in &defaults {
                if !self.kv.hexists(&key, field).await? {
                    self.kv.hset(&key, field, value).await?;
                    changed = true;
                }
            }
            if changed {
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn require(&self, token: &str) -> Result<(), PoolError> {
        if self.exists(token).await? {
            Ok(())
        } else {
            Err(PoolError::CredentialNotFound(token.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::kv::SqliteKv;

    async fn store() -> (CredentialStore, Arc<dyn KvStore>) {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::in_memory(Arc::new(SystemClock)).await.unwrap());
        (CredentialStore::new(kv.clone()), kv)
    }

    #[tokio::test]
    async fn save_writes_defaults_and_skips_existing() {
        let (store, _) = store().await;
        assert!(store.save(" tok-1 ", "https://d1.example.com").await.unwrap());
        assert!(!store.save("tok-1", "https://d9.example.com/").await.unwrap());

        let record = store.get("tok-1").await.unwrap().unwrap();
        assert_eq!(record.tenant_endpoint, "https://d1.example.com/");
        assert_eq!(record.status, CredentialStatus::Active);
        assert!(record.enabled);
        assert_eq!(record.remark, "");
        assert_eq!(record.limits, Limits::default());
    }

    #[tokio::test]
    async fn save_rejects_empty_token_and_bad_endpoint() {
        let (store, _) = store().await;
        assert!(matches!(
            store.save("  ", "https://d1.example.com/").await,
            Err(PoolError::InvalidToken)
        ));
        assert!(matches!(
            store.save("tok", "ftp://d1.example.com/").await,
            Err(PoolError::InvalidEndpoint { .. })
        ));
        assert!(store.list_tokens().await.unwrap().is_empty());

        assert!(store.save("pending", "").await.unwrap());
        let record = store.get("pending").await.unwrap().unwrap();
        assert_eq!(record.tenant_endpoint, "");
    }

    #[tokio::test]
    async fn missing_fields_fall_back_to_defaults() {
        let (store, kv) = store().await;
        kv.hset("token:legacy", "tenant_url", "https://d3.example.com/")
            .await
            .unwrap();

        let record = store.get("legacy").await.unwrap().unwrap();
        assert!(record.enabled);
        assert_eq!(record.status, CredentialStatus::Active);
        assert_eq!(record.limits.request_interval_secs, 3);

        assert_eq!(store.backfill_defaults().await.unwrap(), 1);
        assert_eq!(store.backfill_defaults().await.unwrap(), 0);
        assert_eq!(
            kv.hget("token:legacy", "daily_limit").await.unwrap().as_deref(),
            Some("1000")
        );
    }

    #[tokio::test]
    async fn malformed_limit_is_reported() {
        let (store, kv) = store().await;
        kv.hset("token:bad", "chat_limit", "lots").await.unwrap();
        assert!(matches!(
            store.get("bad").await,
            Err(PoolError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn out_of_range_stored_limits_are_reported() {
        let (store, kv) = store().await;
        store.save("tok", "https://d1.example.com/").await.unwrap();
        kv.hset("token:tok", "request_interval", &i64::MAX.to_string())
            .await
            .unwrap();
        assert!(matches!(
            store.get("tok").await,
            Err(PoolError::Malformed { key, .. }) if key == "token:tok"
        ));

        kv.hset("token:tok", "request_interval", "0").await.unwrap();
        assert!(matches!(store.get("tok").await, Err(PoolError::Malformed { .. })));

        kv.hset("token:tok", "request_interval", "3").await.unwrap();
        kv.hset("token:tok", "daily_limit", "-5").await.unwrap();
        assert!(matches!(store.get("tok").await, Err(PoolError::Malformed { .. })));
    }

    #[tokio::test]
    async fn status_and_endpoint_writes_never_recreate_deleted_credentials() {
        let (store, kv) = store().await;
        assert!(matches!(
            store.set_status("ghost", CredentialStatus::Active).await,
            Err(PoolError::CredentialNotFound(_))
        ));
        assert!(matches!(
            store.set_endpoint("ghost", "https://d1.example.com/").await,
            Err(PoolError::CredentialNotFound(_))
        ));
        assert!(!kv.exists("token:ghost").await.unwrap());
        assert!(store.get("ghost").await.unwrap().is_none());

        store.save("tok", "").await.unwrap();
        store.set_endpoint("tok", "https://d2.example.com").await.unwrap();
        store.set_status("tok", CredentialStatus::Disabled).await.unwrap();
        let record = store.get("tok").await.unwrap().unwrap();
        assert_eq!(record.tenant_endpoint, "https://d2.example.com/");
        assert_eq!(record.status, CredentialStatus::Disabled);
    }

    #[tokio::test]
    async fn delete_cascades_to_counters() {
        let (store, kv) = store().await;
        store.save("tok", "https://d1.example.com/").await.unwrap();
        store.save("tok2", "https://d1.example.com/").await.unwrap();
        kv.set("token_usage:tok", "4", None).await.unwrap();
        kv.set("token_usage_chat:tok", "3", None).await.unwrap();
        kv.set("token_usage_agent:tok", "1", None).await.unwrap();
        kv.set("token_daily_usage:tok:2024-05-01", "2", None).await.unwrap();
        kv.set("token_daily_usage:tok2:2024-05-01", "7", None).await.unwrap();
        kv.set("token_status:tok", "{}", None).await.unwrap();

        assert!(store.delete("tok").await.unwrap());
        assert!(!store.delete("tok").await.unwrap());

        assert!(kv.keys("*tok:*").await.unwrap().is_empty());
        assert!(kv.get("token_usage:tok").await.unwrap().is_none());
        assert!(kv.get("token_usage_agent:tok").await.unwrap().is_none());
        assert!(kv.get("token_status:tok").await.unwrap().is_none());
        assert_eq!(
            kv.get("token_daily_usage:tok2:2024-05-01").await.unwrap().as_deref(),
            Some("7")
        );
        assert_eq!(store.list_tokens().await.unwrap(), vec!["tok2".to_string()]);
    }

    #[tokio::test]
    async fn admin_mutators_require_existing_credential() {
        let (store, _) = store().await;
        assert!(matches!(
            store.set_enabled("ghost", false).await,
            Err(PoolError::CredentialNotFound(_))
        ));

        store.save("tok", "https://d1.example.com/").await.unwrap();
        store.set_enabled("tok", false).await.unwrap();
        store.set_remark("tok", "team b").await.unwrap();
        let limits = Limits {
            request_interval_secs: 10,
            chat_limit: 5,
            agent_limit: 0,
            daily_limit: 100,
        };
        store.set_limits("tok", limits).await.unwrap();

        let record = store.get("tok").await.unwrap().unwrap();
        assert!(!record.enabled);
        assert_eq!(record.remark, "team b");
        assert_eq!(record.limits, limits);
    }

    #[test]
    fn limits_validation_bounds() {
        let mut limits = Limits::default();
        assert!(limits.validate().is_ok());
        limits.request_interval_secs = 0;
        assert!(limits.validate().is_err());
        limits.request_interval_secs = 3601;
        assert!(limits.validate().is_err());
        limits.request_interval_secs = 3600;
        limits.agent_limit = -1;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn endpoint_normalization_appends_slash() {
        assert_eq!(
            normalize_endpoint("https://d7.api.example.com").unwrap(),
            "https://d7.api.example.com/"
        );
        assert_eq!(
            normalize_endpoint("http://127.0.0.1:9000/tenant").unwrap(),
            "http://127.0.0.1:9000/tenant/"
        );
        assert!(normalize_endpoint("not a url").is_err());
    }
}
