use axum::Json;
use axum::body::Body;
use axum::http::{HeaderMap, Response, StatusCode, header};
use axum::response::IntoResponse;
use chrono::Utc;
use serde_json::json;
use tracing::error;

use crate::ban::BanCache;
use crate::rate_limit::RateLimiter;
use crate::store::{Account, STATUS_ENABLED, Store, Token};
use crate::{KEY_PREFIX, hash_key, ip_matches};

/// 准入失败的稳定错误类别，客户端依赖这些标识做分支。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    IpBanned,
    InvalidApiKey,
    TokenDisabled,
    TokenExpired,
    QuotaExceeded,
    AccountDisabled,
    AccountQuotaExceeded,
    IpNotAllowed,
    RateLimitExceeded,
    ModelNotAllowed,
    InvalidRequest,
    ServerError,
}

impl RejectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IpBanned => "ip_banned",
            Self::InvalidApiKey => "invalid_api_key",
            Self::TokenDisabled => "token_disabled",
            Self::TokenExpired => "token_expired",
            Self::QuotaExceeded => "quota_exceeded",
            Self::AccountDisabled => "account_disabled",
            Self::AccountQuotaExceeded => "account_quota_exceeded",
            Self::IpNotAllowed => "ip_not_allowed",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ModelNotAllowed => "model_not_allowed",
            Self::InvalidRequest => "invalid_request_error",
            Self::ServerError => "server_error",
        }
    }

    fn default_status(&self) -> StatusCode {
        match self {
            Self::IpBanned => StatusCode::FORBIDDEN,
            Self::InvalidApiKey => StatusCode::UNAUTHORIZED,
            Self::TokenDisabled => StatusCode::FORBIDDEN,
            Self::TokenExpired => StatusCode::UNAUTHORIZED,
            Self::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::AccountDisabled => StatusCode::FORBIDDEN,
            Self::AccountQuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::IpNotAllowed => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::ModelNotAllowed => StatusCode::FORBIDDEN,
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A rejected request: kind, HTTP status, and a human-readable message,
/// rendered as the JSON error envelope.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub kind: RejectKind,
    pub status: StatusCode,
    pub message: String,
}

impl Rejection {
    pub fn new(kind: RejectKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: kind.default_status(),
            message: message.into(),
        }
    }

    /// For `server_error` responses that are not plain 500s (502 upstream
    /// failure, 503 unconfigured upstream).
    pub fn with_status(kind: RejectKind, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
        }
    }

    fn database(err: crate::RelayError) -> Self {
        error!("admission lookup failed: {err}");
        Self::new(RejectKind::ServerError, "Internal server error")
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response<Body> {
        let body = json!({
            "error": {
                "message": self.message,
                "type": self.kind.as_str(),
                "code": self.status.as_u16(),
            }
        });
        (self.status, Json(body)).into_response()
    }
}

/// 通过准入链的请求上下文，供代理核心使用。
#[derive(Debug, Clone)]
pub struct Admitted {
    pub token: Token,
    pub account: Account,
    pub client_ip: String,
}

/// Run the ordered admission chain. The first failing check wins; the model
/// allow-list is deferred to the proxy core, which sees the request body.
pub async fn admit(
    store: &Store,
    bans: &BanCache,
    limiter: &RateLimiter,
    client_ip: &str,
    headers: &HeaderMap,
) -> Result<Admitted, Rejection> {
    if bans.is_banned(client_ip) {
        return Err(Rejection::new(RejectKind::IpBanned, "Your IP has been banned"));
    }

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(key) = auth.strip_prefix("Bearer ") else {
        return Err(Rejection::new(
            RejectKind::InvalidApiKey,
            "Missing or invalid API key",
        ));
    };
    let key = key.trim();
    if !key.starts_with(KEY_PREFIX) {
        return Err(Rejection::new(
            RejectKind::InvalidApiKey,
            "Invalid API key format",
        ));
    }

    let token = store
        .find_token_by_hash(&hash_key(key))
        .await
        .map_err(Rejection::database)?
        .ok_or_else(|| Rejection::new(RejectKind::InvalidApiKey, "Invalid API key"))?;

    if token.status != STATUS_ENABLED {
        return Err(Rejection::new(RejectKind::TokenDisabled, "API key is disabled"));
    }

    if let Some(expires_at) = token.expires_at
        && expires_at > 0
        && expires_at < Utc::now().timestamp()
    {
        return Err(Rejection::new(RejectKind::TokenExpired, "API key has expired"));
    }

    if token.quota_total >= 0 && token.quota_used >= token.quota_total {
        return Err(Rejection::new(
            RejectKind::QuotaExceeded,
            "API key quota exceeded",
        ));
    }

    let account = store
        .get_account(token.account_id)
        .await
        .map_err(Rejection::database)?
        .filter(|account| account.status == STATUS_ENABLED)
        .ok_or_else(|| Rejection::new(RejectKind::AccountDisabled, "Account is disabled"))?;

    if account.quota_total >= 0 && account.quota_used >= account.quota_total {
        return Err(Rejection::new(
            RejectKind::AccountQuotaExceeded,
            "Account quota exceeded",
        ));
    }

    if !token.allowed_ips.trim().is_empty() {
        let allowed = token
            .allowed_ips
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .any(|entry| ip_matches(client_ip, entry));
        if !allowed {
            return Err(Rejection::new(RejectKind::IpNotAllowed, "IP not in allowlist"));
        }
    }

    if !limiter.check(token.id, token.rate_limit_rpm) {
        return Err(Rejection::new(
            RejectKind::RateLimitExceeded,
            "Rate limit exceeded. Please try again later.",
        ));
    }

    Ok(Admitted {
        token,
        account,
        client_ip: client_ip.to_string(),
    })
}
