//! Key/value persistence used by every other component.
//!
//! [`KvStore`] mirrors the small Redis-like surface the pool relies on: plain string
//! values with optional expiry, string hashes and glob enumeration. [`SqliteKv`] is the
//! shipped backend; other stores only need to honour the same read-your-writes and
//! expiry semantics.

use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::PoolError;
use crate::clock::Clock;

#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>, PoolError>;

    /// Stores `value`, replacing any previous value and expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), PoolError>;

    /// Removes the key (string or hash). Returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool, PoolError>;

    async fn exists(&self, key: &str) -> Result<bool, PoolError>;

    /// Increments an integer string, creating it at 1. An existing expiry is kept.
    /// A live value that is not an integer is left untouched and reported as malformed.
    async fn incr(&self, key: &str) -> Result<i64, PoolError>;

    /// Sets a new expiry on a live string key. Returns `false` when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, PoolError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, PoolError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), PoolError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, PoolError>;

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, PoolError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, PoolError>;

    /// Lists live keys matching a glob pattern (`*`, `?`, `[...]`), sorted.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, PoolError>;

    /// Physically drops expired entries. Returns how many went away.
    async fn purge_expired(&self) -> Result<u64, PoolError>;
}

/// Escapes glob metacharacters so `value` matches literally inside a pattern.
pub fn glob_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '*' | '?' | '[' => {
                escaped.push('[');
                escaped.push(ch);
                escaped.push(']');
            }
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// SQLite-backed [`KvStore`].
#[derive(Debug, Clone)]
pub struct SqliteKv {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteKv {
    /// Opens (creating if needed) the database at `database`.
    ///
    /// Accepts either a `sqlite:` URL or a plain file path. In-memory databases are
    /// pinned to a single connection so every query sees the same data.
    pub async fn open(database: &str, clock: Arc<dyn Clock>) -> Result<Self, PoolError> {
        let in_memory = database.contains(":memory:") || database.contains("mode=memory");
        let options = match database.strip_prefix("sqlite:") {
            Some(_) => SqliteConnectOptions::from_str(database)?,
            None => SqliteConnectOptions::new().filename(database),
        };
        let options = options.create_if_missing(true);

        let pool = if in_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        let store = Self { pool, clock };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// Fresh private in-memory store.
    pub async fn in_memory(clock: Arc<dyn Clock>) -> Result<Self, PoolError> {
        Self::open("sqlite::memory:", clock).await
    }

    async fn initialize_schema(&self) -> Result<(), PoolError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_strings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_hashes (
                key TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (key, field)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_kv_strings_expires_at ON kv_strings (expires_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn expiry_ms(&self, ttl: Duration) -> i64 {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.now_ms().saturating_add(ttl_ms)
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>, PoolError> {
        let value = sqlx::query_scalar::<_, String>(
            r#"
            SELECT value
            FROM kv_strings
            WHERE key = ?
              AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(key)
        .bind(self.now_ms())
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), PoolError> {
        let expires_at = ttl.map(|ttl| self.expiry_ms(ttl));
        sqlx::query(
            r#"
            INSERT INTO kv_strings (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, PoolError> {
        let mut tx = self.pool.begin().await?;
        let strings = sqlx::query("DELETE FROM kv_strings WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let fields = sqlx::query("DELETE FROM kv_hashes WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(strings + fields > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, PoolError> {
        if self.get(key).await?.is_some() {
            return Ok(true);
        }
        let hash = sqlx::query_scalar::<_, i64>("SELECT 1 FROM kv_hashes WHERE key = ? LIMIT 1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(hash.is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, PoolError> {
        let now = self.now_ms();
        // An expired row counts as missing: restart at 1 without expiry.
        // A live value that is not an integer is left alone and no row comes back.
        let value = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO kv_strings (key, value, expires_at)
            VALUES (?, '1', NULL)
            ON CONFLICT(key) DO UPDATE SET
                value = CASE
                    WHEN kv_strings.expires_at IS NOT NULL AND kv_strings.expires_at <= ?
                        THEN '1'
                    ELSE CAST(CAST(kv_strings.value AS INTEGER) + 1 AS TEXT)
                END,
                expires_at = CASE
                    WHEN kv_strings.expires_at IS NOT NULL AND kv_strings.expires_at <= ?
                        THEN NULL
                    ELSE kv_strings.expires_at
                END
            WHERE (kv_strings.expires_at IS NOT NULL AND kv_strings.expires_at <= ?)
                OR CAST(CAST(kv_strings.value AS INTEGER) AS TEXT) = kv_strings.value
            RETURNING value
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(value) = value else {
            return Err(PoolError::Malformed {
                key: key.to_owned(),
                reason: "value is not an integer".to_owned(),
            });
        };
        value.parse::<i64>().map_err(|err| PoolError::Malformed {
            key: key.to_owned(),
            reason: err.to_string(),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, PoolError> {
        let result = sqlx::query(
            r#"
            UPDATE kv_strings
            SET expires_at = ?
            WHERE key = ?
              AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(self.expiry_ms(ttl))
        .bind(key)
        .bind(self.now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, PoolError> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv_hashes WHERE key = ? AND field = ?",
        )
        .bind(key)
        .bind(field)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), PoolError> {
        sqlx::query(
            r#"
            INSERT INTO kv_hashes (key, field, value)
            VALUES (?, ?, ?)
            ON CONFLICT(key, field) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(field)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, PoolError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT field, value FROM kv_hashes WHERE key = ?",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, PoolError> {
        Ok(self.hget(key, field).await?.is_some())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, PoolError> {
        let result = sqlx::query("DELETE FROM kv_hashes WHERE key = ? AND field = ?")
            .bind(key)
            .bind(field)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, PoolError> {
        let keys = sqlx::query_scalar::<_, String>(
            r#"
            SELECT key FROM kv_strings
            WHERE key GLOB ?
              AND (expires_at IS NULL OR expires_at > ?)
            UNION
            SELECT DISTINCT key FROM kv_hashes
            WHERE key GLOB ?
            ORDER BY key
            "#,
        )
        .bind(pattern)
        .bind(self.now_ms())
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn purge_expired(&self) -> Result<u64, PoolError> {
        let result = sqlx::query(
            "DELETE FROM kv_strings WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(self.now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Local, TimeZone};

    async fn store_with_clock() -> (SqliteKv, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let kv = SqliteKv::in_memory(clock.clone()).await.unwrap();
        (kv, clock)
    }

    #[tokio::test]
    async fn missing_keys_read_as_none() {
        let (kv, _) = store_with_clock().await;
        assert_eq!(kv.get("nope").await.unwrap(), None);
        assert_eq!(kv.hget("nope", "field").await.unwrap(), None);
        assert!(kv.hgetall("nope").await.unwrap().is_empty());
        assert!(!kv.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn ttl_hides_value_after_expiry() {
        let (kv, clock) = store_with_clock().await;
        kv.set("k", "v", Some(Duration::from_secs(10))).await.unwrap();
        clock.advance(chrono::Duration::seconds(9));
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(kv.keys("k*").await.unwrap().is_empty());
        assert_eq!(kv.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn incr_keeps_ttl_and_restarts_after_expiry() {
        let (kv, clock) = store_with_clock().await;
        assert_eq!(kv.incr("counter").await.unwrap(), 1);
        assert!(kv.expire("counter", Duration::from_secs(60)).await.unwrap());
        assert_eq!(kv.incr("counter").await.unwrap(), 2);

        clock.advance(chrono::Duration::seconds(59));
        assert_eq!(kv.get("counter").await.unwrap().as_deref(), Some("2"));

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(kv.get("counter").await.unwrap(), None);
        assert_eq!(kv.incr("counter").await.unwrap(), 1);
        // restarted without expiry
        clock.advance(chrono::Duration::days(30));
        assert_eq!(kv.get("counter").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn incr_refuses_non_integer_values() {
        let (kv, _) = store_with_clock().await;
        kv.set("words", "many", None).await.unwrap();
        kv.set("suffixed", "12abc", None).await.unwrap();

        for (key, stored) in [("words", "many"), ("suffixed", "12abc")] {
            let err = kv.incr(key).await.unwrap_err();
            assert!(
                matches!(&err, PoolError::Malformed { key: bad, .. } if bad == key),
                "unexpected error for {key}: {err:?}"
            );
            assert_eq!(kv.get(key).await.unwrap().as_deref(), Some(stored));
        }

        kv.set("negative", "-3", None).await.unwrap();
        assert_eq!(kv.incr("negative").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn incr_restarts_expired_non_integer_value() {
        let (kv, clock) = store_with_clock().await;
        kv.set("words", "many", Some(Duration::from_secs(5))).await.unwrap();
        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(kv.incr("words").await.unwrap(), 1);
        assert_eq!(kv.get("words").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn expire_on_missing_key_is_false() {
        let (kv, _) = store_with_clock().await;
        assert!(!kv.expire("ghost", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn hashes_round_trip_and_delete_cascades() {
        let (kv, _) = store_with_clock().await;
        kv.hset("token:a", "status", "active").await.unwrap();
        kv.hset("token:a", "remark", "").await.unwrap();
        kv.hset("token:a", "status", "disabled").await.unwrap();

        let all = kv.hgetall("token:a").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("status").map(String::as_str), Some("disabled"));
        assert!(kv.hexists("token:a", "remark").await.unwrap());
        assert!(kv.exists("token:a").await.unwrap());

        assert!(kv.hdel("token:a", "remark").await.unwrap());
        assert!(!kv.hexists("token:a", "remark").await.unwrap());

        assert!(kv.delete("token:a").await.unwrap());
        assert!(!kv.exists("token:a").await.unwrap());
        assert!(!kv.delete("token:a").await.unwrap());
    }

    #[tokio::test]
    async fn keys_match_glob_case_sensitively() {
        let (kv, _) = store_with_clock().await;
        kv.hset("token:abc", "status", "active").await.unwrap();
        kv.hset("token:ABC", "status", "active").await.unwrap();
        kv.set("token_usage:abc", "3", None).await.unwrap();

        let keys = kv.keys("token:*").await.unwrap();
        assert_eq!(keys, vec!["token:ABC".to_string(), "token:abc".to_string()]);

        let pattern = format!("token_usage:{}*", glob_escape("abc"));
        assert_eq!(kv.keys(&pattern).await.unwrap(), vec!["token_usage:abc"]);
        assert!(kv.keys("token_usage:ABC*").await.unwrap().is_empty());
    }

    #[test]
    fn glob_escape_brackets_metacharacters() {
        assert_eq!(glob_escape("a*b?c[d"), "a[*]b[?]c[[]d");
        assert_eq!(glob_escape("plain"), "plain");
    }
}
