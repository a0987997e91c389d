use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool};

use crate::{GeneratedKey, RelayError, generate_api_key};

pub const STATUS_ENABLED: i64 = 1;
pub const STATUS_DISABLED: i64 = 2;

/// 配额无上限的哨兵值。
pub const QUOTA_UNLIMITED: i64 = -1;

pub const DEFAULT_ACCOUNT_QUOTA: i64 = 1000;
pub const DEFAULT_TOKEN_LIMIT: i64 = 5;
pub const DEFAULT_RPM: i64 = 60;

/// 持有一个或多个 token 的账号，配额在 token 之上再设一道闸。
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub status: i64,
    pub quota_total: i64,
    pub quota_used: i64,
    pub token_limit: i64,
    pub created_at: i64,
}

/// 一把 API key：只存哈希，明文生成后即丢弃。
#[derive(Debug, Clone, Serialize)]
pub struct Token {
    pub id: i64,
    pub account_id: i64,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub key_prefix: String,
    pub name: String,
    pub status: i64,
    pub expires_at: Option<i64>,
    pub quota_total: i64,
    pub quota_used: i64,
    pub rate_limit_rpm: i64,
    pub allowed_models: String,
    pub allowed_ips: String,
    pub total_requests: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IpBanEntry {
    pub id: i64,
    pub ip: String,
    pub reason: String,
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

/// 一次完整代理请求的计费/审计记录，只追加不修改。
#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub id: i64,
    pub account_id: i64,
    pub token_id: i64,
    pub request_ip: String,
    pub method: String,
    pub path: String,
    pub model: String,
    pub status_code: i64,
    pub duration_ms: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub error_message: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LogStats {
    pub total_requests: i64,
    pub total_tokens: i64,
    pub today_requests: i64,
    pub today_tokens: i64,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub account_id: Option<i64>,
    pub token_id: Option<i64>,
    pub model: Option<String>,
    pub request_ip: Option<String>,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct NewToken {
    pub account_id: i64,
    pub name: String,
    pub expires_at: Option<i64>,
    pub quota_total: i64,
    pub rate_limit_rpm: i64,
    pub allowed_models: String,
    pub allowed_ips: String,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(database_path: &str) -> Result<Self, RelayError> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), RelayError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 1,
                quota_total INTEGER NOT NULL DEFAULT 1000,
                quota_used INTEGER NOT NULL DEFAULT 0,
                token_limit INTEGER NOT NULL DEFAULT 5,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                key_prefix TEXT NOT NULL,
                name TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 1,
                expires_at INTEGER,
                quota_total INTEGER NOT NULL DEFAULT -1,
                quota_used INTEGER NOT NULL DEFAULT 0,
                rate_limit_rpm INTEGER NOT NULL DEFAULT 60,
                allowed_models TEXT NOT NULL DEFAULT '',
                allowed_ips TEXT NOT NULL DEFAULT '',
                total_requests INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ip_bans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ip TEXT NOT NULL UNIQUE,
                reason TEXT NOT NULL DEFAULT '',
                expires_at INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                token_id INTEGER NOT NULL,
                request_ip TEXT NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                model TEXT NOT NULL DEFAULT '',
                status_code INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_request_logs_created ON request_logs(created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_request_logs_token ON request_logs(token_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ----- accounts -----

    pub async fn create_account(&self, name: &str) -> Result<Account, RelayError> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO accounts (name, status, quota_total, quota_used, token_limit, created_at)
            VALUES (?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(name)
        .bind(STATUS_ENABLED)
        .bind(DEFAULT_ACCOUNT_QUOTA)
        .bind(DEFAULT_TOKEN_LIMIT)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_account(id)
            .await?
            .ok_or(RelayError::AccountNotFound)
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>, RelayError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ? LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| account_from_row(&r)).transpose().map_err(Into::into)
    }

    pub async fn list_accounts(&self, page: usize, page_size: usize) -> Result<(Vec<Account>, i64), RelayError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 200);
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM accounts")
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY id DESC LIMIT ? OFFSET ?")
            .bind(page_size as i64)
            .bind(((page - 1) * page_size) as i64)
            .fetch_all(&self.pool)
            .await?;
        let accounts = rows
            .iter()
            .map(account_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((accounts, total))
    }

    pub async fn update_account(
        &self,
        id: i64,
        status: Option<i64>,
        quota_total: Option<i64>,
        token_limit: Option<i64>,
    ) -> Result<Account, RelayError> {
        let mut account = self.get_account(id).await?.ok_or(RelayError::AccountNotFound)?;
        if let Some(status) = status {
            account.status = status;
        }
        if let Some(quota_total) = quota_total {
            account.quota_total = quota_total;
        }
        if let Some(token_limit) = token_limit {
            account.token_limit = token_limit;
        }

        sqlx::query("UPDATE accounts SET status = ?, quota_total = ?, token_limit = ? WHERE id = ?")
            .bind(account.status)
            .bind(account.quota_total)
            .bind(account.token_limit)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(account)
    }

    // ----- tokens -----

    /// Create a token for an account, enforcing its token limit. Returns the
    /// stored row together with the plaintext key (shown exactly once).
    pub async fn create_token(&self, new: NewToken) -> Result<(Token, GeneratedKey), RelayError> {
        let account = self
            .get_account(new.account_id)
            .await?
            .ok_or(RelayError::AccountNotFound)?;

        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tokens WHERE account_id = ?")
            .bind(account.id)
            .fetch_one(&self.pool)
            .await?;
        if count >= account.token_limit {
            return Err(RelayError::TokenLimitReached(account.token_limit));
        }

        let key = generate_api_key();
        let rpm = if new.rate_limit_rpm <= 0 { DEFAULT_RPM } else { new.rate_limit_rpm };
        // 0 means "follow the account quota": the token itself is unlimited.
        let quota_total = if new.quota_total == 0 { QUOTA_UNLIMITED } else { new.quota_total };
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO tokens (
                account_id, key_hash, key_prefix, name, status, expires_at,
                quota_total, quota_used, rate_limit_rpm, allowed_models,
                allowed_ips, total_requests, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(account.id)
        .bind(&key.hash)
        .bind(&key.prefix)
        .bind(&new.name)
        .bind(STATUS_ENABLED)
        .bind(new.expires_at)
        .bind(quota_total)
        .bind(rpm)
        .bind(&new.allowed_models)
        .bind(&new.allowed_ips)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let token = self
            .get_token(result.last_insert_rowid())
            .await?
            .ok_or(RelayError::Database(sqlx::Error::RowNotFound))?;
        Ok((token, key))
    }

    pub async fn get_token(&self, id: i64) -> Result<Option<Token>, RelayError> {
        let row = sqlx::query("SELECT * FROM tokens WHERE id = ? LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| token_from_row(&r)).transpose().map_err(Into::into)
    }

    pub async fn find_token_by_hash(&self, key_hash: &str) -> Result<Option<Token>, RelayError> {
        let row = sqlx::query("SELECT * FROM tokens WHERE key_hash = ? LIMIT 1")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| token_from_row(&r)).transpose().map_err(Into::into)
    }

    pub async fn list_tokens(&self, account_id: Option<i64>) -> Result<Vec<Token>, RelayError> {
        let rows = match account_id {
            Some(account_id) => {
                sqlx::query("SELECT * FROM tokens WHERE account_id = ? ORDER BY id DESC")
                    .bind(account_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM tokens ORDER BY id DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(token_from_row).collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn update_token(&self, token: &Token) -> Result<(), RelayError> {
        sqlx::query(
            r#"
            UPDATE tokens SET
                name = ?, status = ?, expires_at = ?, quota_total = ?,
                rate_limit_rpm = ?, allowed_models = ?, allowed_ips = ?
            WHERE id = ?
            "#,
        )
        .bind(&token.name)
        .bind(token.status)
        .bind(token.expires_at)
        .bind(token.quota_total)
        .bind(token.rate_limit_rpm)
        .bind(&token.allowed_models)
        .bind(&token.allowed_ips)
        .bind(token.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_token(&self, id: i64) -> Result<(), RelayError> {
        sqlx::query("DELETE FROM tokens WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Re-issue the secret for an existing token, invalidating the old key.
    pub async fn reset_token_secret(&self, id: i64) -> Result<GeneratedKey, RelayError> {
        let key = generate_api_key();
        sqlx::query("UPDATE tokens SET key_hash = ?, key_prefix = ? WHERE id = ?")
            .bind(&key.hash)
            .bind(&key.prefix)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(key)
    }

    /// Fire-and-forget billing increment. Read-modify-write happens inside
    /// the UPDATE so concurrent requests never lose counts; a request racing
    /// past the ceiling between pre-check and increment is accepted slack.
    pub async fn increment_usage(&self, token_id: i64, account_id: i64) -> Result<(), RelayError> {
        sqlx::query(
            "UPDATE tokens SET quota_used = quota_used + 1, total_requests = total_requests + 1 WHERE id = ?",
        )
        .bind(token_id)
        .execute(&self.pool)
        .await?;
        sqlx::query("UPDATE accounts SET quota_used = quota_used + 1 WHERE id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----- IP bans -----

    pub async fn list_ip_bans(&self) -> Result<Vec<IpBanEntry>, RelayError> {
        let rows = sqlx::query("SELECT * FROM ip_bans ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(ban_from_row).collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn insert_ip_ban(
        &self,
        ip: &str,
        reason: &str,
        expires_at: Option<i64>,
    ) -> Result<IpBanEntry, RelayError> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO ip_bans (ip, reason, expires_at, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(ip)
        .bind(reason)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM ip_bans WHERE id = ? LIMIT 1")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await?;
        ban_from_row(&row).map_err(Into::into)
    }

    pub async fn delete_ip_ban(&self, id: i64) -> Result<(), RelayError> {
        sqlx::query("DELETE FROM ip_bans WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----- usage logs -----

    pub async fn insert_usage_batch(&self, logs: &[RequestLog]) -> Result<(), RelayError> {
        if logs.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::new(
            "INSERT INTO request_logs (
                account_id, token_id, request_ip, method, path, model,
                status_code, duration_ms, prompt_tokens, completion_tokens,
                total_tokens, error_message, created_at
            ) ",
        );
        builder.push_values(logs, |mut row, log| {
            row.push_bind(log.account_id)
                .push_bind(log.token_id)
                .push_bind(&log.request_ip)
                .push_bind(&log.method)
                .push_bind(&log.path)
                .push_bind(&log.model)
                .push_bind(log.status_code)
                .push_bind(log.duration_ms)
                .push_bind(log.prompt_tokens)
                .push_bind(log.completion_tokens)
                .push_bind(log.total_tokens)
                .push_bind(&log.error_message)
                .push_bind(log.created_at);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    pub async fn list_logs(&self, filter: &LogFilter) -> Result<(Vec<RequestLog>, i64), RelayError> {
        let page = filter.page.max(1);
        let page_size = filter.page_size.clamp(1, 500);

        let mut count = QueryBuilder::new("SELECT COUNT(*) FROM request_logs WHERE 1 = 1");
        push_log_filters(&mut count, filter);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut query = QueryBuilder::new("SELECT * FROM request_logs WHERE 1 = 1");
        push_log_filters(&mut query, filter);
        query.push(" ORDER BY id DESC LIMIT ");
        query.push_bind(page_size as i64);
        query.push(" OFFSET ");
        query.push_bind(((page - 1) * page_size) as i64);

        let rows = query.build().fetch_all(&self.pool).await?;
        let logs = rows.iter().map(log_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((logs, total))
    }

    pub async fn log_stats(&self, account_id: Option<i64>) -> Result<LogStats, RelayError> {
        let today = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or_default();

        let (totals, todays) = match account_id {
            Some(account_id) => {
                let totals = sqlx::query(
                    "SELECT COUNT(*) AS requests, COALESCE(SUM(total_tokens), 0) AS tokens
                     FROM request_logs WHERE account_id = ?",
                )
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;
                let todays = sqlx::query(
                    "SELECT COUNT(*) AS requests, COALESCE(SUM(total_tokens), 0) AS tokens
                     FROM request_logs WHERE account_id = ? AND created_at >= ?",
                )
                .bind(account_id)
                .bind(today)
                .fetch_one(&self.pool)
                .await?;
                (totals, todays)
            }
            None => {
                let totals = sqlx::query(
                    "SELECT COUNT(*) AS requests, COALESCE(SUM(total_tokens), 0) AS tokens
                     FROM request_logs",
                )
                .fetch_one(&self.pool)
                .await?;
                let todays = sqlx::query(
                    "SELECT COUNT(*) AS requests, COALESCE(SUM(total_tokens), 0) AS tokens
                     FROM request_logs WHERE created_at >= ?",
                )
                .bind(today)
                .fetch_one(&self.pool)
                .await?;
                (totals, todays)
            }
        };

        Ok(LogStats {
            total_requests: totals.try_get("requests")?,
            total_tokens: totals.try_get("tokens")?,
            today_requests: todays.try_get("requests")?,
            today_tokens: todays.try_get("tokens")?,
        })
    }

    pub async fn delete_logs_before_days(&self, days: i64) -> Result<u64, RelayError> {
        let cutoff = Utc::now().timestamp() - days * 86_400;
        let result = sqlx::query("DELETE FROM request_logs WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ----- settings -----

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, RelayError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ? LIMIT 1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn all_settings(&self) -> Result<Vec<(String, String)>, RelayError> {
        let rows = sqlx::query("SELECT key, value FROM settings ORDER BY key ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("key")?, row.try_get("value")?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(Into::into)
    }
}

fn push_log_filters(builder: &mut QueryBuilder<'_, sqlx::Sqlite>, filter: &LogFilter) {
    if let Some(account_id) = filter.account_id {
        builder.push(" AND account_id = ");
        builder.push_bind(account_id);
    }
    if let Some(token_id) = filter.token_id {
        builder.push(" AND token_id = ");
        builder.push_bind(token_id);
    }
    if let Some(model) = filter.model.clone().filter(|m| !m.is_empty()) {
        builder.push(" AND model = ");
        builder.push_bind(model);
    }
    if let Some(ip) = filter.request_ip.clone().filter(|ip| !ip.is_empty()) {
        builder.push(" AND request_ip = ");
        builder.push_bind(ip);
    }
}

fn account_from_row(row: &SqliteRow) -> Result<Account, sqlx::Error> {
    Ok(Account {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: row.try_get("status")?,
        quota_total: row.try_get("quota_total")?,
        quota_used: row.try_get("quota_used")?,
        token_limit: row.try_get("token_limit")?,
        created_at: row.try_get("created_at")?,
    })
}

fn token_from_row(row: &SqliteRow) -> Result<Token, sqlx::Error> {
    Ok(Token {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        key_hash: row.try_get("key_hash")?,
        key_prefix: row.try_get("key_prefix")?,
        name: row.try_get("name")?,
        status: row.try_get("status")?,
        expires_at: row.try_get("expires_at")?,
        quota_total: row.try_get("quota_total")?,
        quota_used: row.try_get("quota_used")?,
        rate_limit_rpm: row.try_get("rate_limit_rpm")?,
        allowed_models: row.try_get("allowed_models")?,
        allowed_ips: row.try_get("allowed_ips")?,
        total_requests: row.try_get("total_requests")?,
        created_at: row.try_get("created_at")?,
    })
}

fn ban_from_row(row: &SqliteRow) -> Result<IpBanEntry, sqlx::Error> {
    Ok(IpBanEntry {
        id: row.try_get("id")?,
        ip: row.try_get("ip")?,
        reason: row.try_get("reason")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<RequestLog, sqlx::Error> {
    Ok(RequestLog {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        token_id: row.try_get("token_id")?,
        request_ip: row.try_get("request_ip")?,
        method: row.try_get("method")?,
        path: row.try_get("path")?,
        model: row.try_get("model")?,
        status_code: row.try_get("status_code")?,
        duration_ms: row.try_get("duration_ms")?,
        prompt_tokens: row.try_get("prompt_tokens")?,
        completion_tokens: row.try_get("completion_tokens")?,
        total_tokens: row.try_get("total_tokens")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::Store;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    /// Open a store backed by a fresh temp file, unique per call.
    pub async fn temp_store(tag: &str) -> Store {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "llm-relay-{tag}-{}-{n}.db",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        Store::new(path.to_string_lossy().as_ref())
            .await
            .expect("open temp store")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::temp_store;
    use super::*;
    use crate::hash_key;

    #[tokio::test]
    async fn token_roundtrip_and_hash_lookup() {
        let store = temp_store("store-token").await;
        let account = store.create_account("alice").await.unwrap();

        let (token, key) = store
            .create_token(NewToken {
                account_id: account.id,
                name: "ci".into(),
                quota_total: 100,
                rate_limit_rpm: 10,
                allowed_models: "gpt-a,gpt-b".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(token.status, STATUS_ENABLED);
        assert_eq!(token.quota_total, 100);
        assert_eq!(token.key_hash, hash_key(&key.plain));

        let found = store.find_token_by_hash(&hash_key(&key.plain)).await.unwrap();
        assert_eq!(found.map(|t| t.id), Some(token.id));

        let missing = store.find_token_by_hash(&hash_key("sk-relay-nope")).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn zero_quota_request_follows_account() {
        let store = temp_store("store-quota").await;
        let account = store.create_account("bob").await.unwrap();
        let (token, _) = store
            .create_token(NewToken {
                account_id: account.id,
                name: "default".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(token.quota_total, QUOTA_UNLIMITED);
        assert_eq!(token.rate_limit_rpm, DEFAULT_RPM);
    }

    #[tokio::test]
    async fn token_limit_is_enforced() {
        let store = temp_store("store-limit").await;
        let account = store.create_account("carol").await.unwrap();
        store
            .update_account(account.id, None, None, Some(1))
            .await
            .unwrap();

        store
            .create_token(NewToken {
                account_id: account.id,
                name: "first".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = store
            .create_token(NewToken {
                account_id: account.id,
                name: "second".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::TokenLimitReached(1)));
    }

    #[tokio::test]
    async fn increment_usage_bumps_both_counters() {
        let store = temp_store("store-incr").await;
        let account = store.create_account("dave").await.unwrap();
        let (token, _) = store
            .create_token(NewToken {
                account_id: account.id,
                name: "meter".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        store.increment_usage(token.id, account.id).await.unwrap();
        store.increment_usage(token.id, account.id).await.unwrap();

        let token = store.get_token(token.id).await.unwrap().unwrap();
        assert_eq!(token.quota_used, 2);
        assert_eq!(token.total_requests, 2);
        let account = store.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(account.quota_used, 2);
    }

    #[tokio::test]
    async fn reset_invalidates_previous_secret() {
        let store = temp_store("store-reset").await;
        let account = store.create_account("erin").await.unwrap();
        let (token, old_key) = store
            .create_token(NewToken {
                account_id: account.id,
                name: "rotate".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let new_key = store.reset_token_secret(token.id).await.unwrap();
        assert_ne!(new_key.hash, old_key.hash);

        assert!(store.find_token_by_hash(&old_key.hash).await.unwrap().is_none());
        let found = store.find_token_by_hash(&new_key.hash).await.unwrap();
        assert_eq!(found.map(|t| t.id), Some(token.id));
    }

    #[tokio::test]
    async fn usage_batch_insert_lists_and_counts() {
        let store = temp_store("store-logs").await;
        let now = Utc::now().timestamp();
        let template = RequestLog {
            id: 0,
            account_id: 1,
            token_id: 2,
            request_ip: "10.0.0.1".into(),
            method: "POST".into(),
            path: "/v1/chat/completions".into(),
            model: "gpt-a".into(),
            status_code: 200,
            duration_ms: 12,
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            error_message: None,
            created_at: now,
        };
        let batch = vec![
            template.clone(),
            RequestLog {
                model: "gpt-b".into(),
                status_code: 502,
                error_message: Some("connection refused".into()),
                ..template.clone()
            },
        ];
        store.insert_usage_batch(&batch).await.unwrap();
        store.insert_usage_batch(&[]).await.unwrap();

        let (logs, total) = store
            .list_logs(&LogFilter {
                page: 1,
                page_size: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(logs.len(), 2);

        let (filtered, total) = store
            .list_logs(&LogFilter {
                model: Some("gpt-b".into()),
                page: 1,
                page_size: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(filtered[0].error_message.as_deref(), Some("connection refused"));

        let stats = store.log_stats(None).await.unwrap();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_tokens, 30);
        assert_eq!(stats.today_requests, 2);

        let none = store.log_stats(Some(99)).await.unwrap();
        assert_eq!(none.total_requests, 0);
    }

    #[tokio::test]
    async fn old_logs_can_be_pruned() {
        let store = temp_store("store-prune").await;
        let now = Utc::now().timestamp();
        let old = RequestLog {
            id: 0,
            account_id: 1,
            token_id: 1,
            request_ip: "10.0.0.1".into(),
            method: "POST".into(),
            path: "/v1/chat/completions".into(),
            model: String::new(),
            status_code: 200,
            duration_ms: 1,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            error_message: None,
            created_at: now - 40 * 86_400,
        };
        let fresh = RequestLog { created_at: now, ..old.clone() };
        store.insert_usage_batch(&[old, fresh]).await.unwrap();

        let removed = store.delete_logs_before_days(30).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn settings_upsert_and_blank_filtering() {
        let store = temp_store("store-settings").await;
        assert!(store.get_setting("upstream_url").await.unwrap().is_none());

        store.set_setting("upstream_url", "http://localhost:9000").await.unwrap();
        assert_eq!(
            store.get_setting("upstream_url").await.unwrap().as_deref(),
            Some("http://localhost:9000")
        );

        store.set_setting("upstream_url", "").await.unwrap();
        assert!(store.get_setting("upstream_url").await.unwrap().is_none());

        store.set_setting("upstream_key", "sk-up").await.unwrap();
        let all = store.all_settings().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn ip_ban_crud() {
        let store = temp_store("store-bans").await;
        let ban = store.insert_ip_ban("203.0.113.7", "abuse", None).await.unwrap();
        store.insert_ip_ban("10.0.0.0/8", "", Some(0)).await.unwrap();

        let bans = store.list_ip_bans().await.unwrap();
        assert_eq!(bans.len(), 2);

        store.delete_ip_ban(ban.id).await.unwrap();
        let bans = store.list_ip_bans().await.unwrap();
        assert_eq!(bans.len(), 1);
        assert_eq!(bans[0].ip, "10.0.0.0/8");
    }
}
