use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get, post, put};
use axum::{Json, Router, body, body::Body};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use llm_relay::admission::{self, RejectKind, Rejection};
use llm_relay::proxy::ForwardRequest;
use llm_relay::store::{
    Account, IpBanEntry, LogFilter, LogStats, NewToken, RequestLog, Token,
};
use llm_relay::{BanCache, RateLimiter, RelayError, RelayProxy, Store, resolve_client_ip};

const BODY_LIMIT: usize = 16 * 1024 * 1024; // 16 MiB 默认限制
const DEFAULT_PAGE_SIZE: usize = 50;

pub struct AppState {
    pub store: Store,
    pub proxy: RelayProxy,
    pub bans: Arc<BanCache>,
    pub limiter: Arc<RateLimiter>,
    pub admin_key: Option<String>,
    pub trusted_proxies: Vec<IpNet>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        // Admin surface, gated on the X-Admin-Key header.
        .route("/api/admin/accounts", get(list_accounts).post(create_account))
        .route("/api/admin/accounts/:id", put(update_account))
        .route("/api/admin/tokens", get(list_tokens).post(create_token))
        .route("/api/admin/tokens/:id", put(update_token).delete(delete_token))
        .route("/api/admin/tokens/:id/reset", post(reset_token))
        .route("/api/admin/ip-bans", get(list_ip_bans).post(create_ip_ban))
        .route("/api/admin/ip-bans/:id", axum::routing::delete(delete_ip_ban))
        .route("/api/admin/logs", get(list_logs).delete(clean_logs))
        .route("/api/admin/logs/stats", get(log_stats))
        .route("/api/admin/settings", get(get_settings).put(update_settings))
        // Proxy mount: any method, any path under /v1.
        .route("/v1/*path", any(proxy_handler))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    info!("llm-relay listening on http://{bound}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ----- proxy -----

async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response<Body> {
    let (parts, req_body) = req.into_parts();
    let client_ip = resolve_client_ip(peer, &parts.headers, &state.trusted_proxies);

    let admitted = match admission::admit(
        &state.store,
        &state.bans,
        &state.limiter,
        &client_ip,
        &parts.headers,
    )
    .await
    {
        Ok(admitted) => admitted,
        Err(rejection) => return rejection.into_response(),
    };

    let body_bytes = match body::to_bytes(req_body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return Rejection::new(RejectKind::InvalidRequest, "Failed to read request body")
                .into_response();
        }
    };

    state
        .proxy
        .forward(ForwardRequest {
            method: parts.method,
            path: parts.uri.path().to_owned(),
            query: parts.uri.query().map(str::to_owned),
            headers: parts.headers,
            body: body_bytes,
            allowed_models: admitted.token.allowed_models.clone(),
            token_id: admitted.token.id,
            account_id: admitted.account.id,
            client_ip: admitted.client_ip,
        })
        .await
}

// ----- admin: shared bits -----

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = state.admin_key.as_deref() else {
        // No admin key configured: the surface stays closed.
        return Err(StatusCode::FORBIDDEN);
    };
    match headers.get("x-admin-key").and_then(|v| v.to_str().ok()) {
        Some(given) if given == expected => Ok(()),
        _ => Err(StatusCode::FORBIDDEN),
    }
}

fn admin_error(err: RelayError) -> StatusCode {
    match err {
        RelayError::AccountNotFound => StatusCode::NOT_FOUND,
        RelayError::TokenLimitReached(_) => StatusCode::BAD_REQUEST,
        RelayError::Database(_) => {
            error!("admin operation failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Debug, Serialize)]
struct Paged<T> {
    items: Vec<T>,
    total: i64,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<usize>,
    page_size: Option<usize>,
}

// ----- admin: accounts -----

async fn list_accounts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<Json<Paged<Account>>, StatusCode> {
    require_admin(&state, &headers)?;
    let (items, total) = state
        .store
        .list_accounts(
            page.page.unwrap_or(1),
            page.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await
        .map_err(admin_error)?;
    Ok(Json(Paged { items, total }))
}

#[derive(Debug, Deserialize)]
struct CreateAccountRequest {
    name: String,
}

async fn create_account(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<Account>), StatusCode> {
    require_admin(&state, &headers)?;
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let account = state.store.create_account(name).await.map_err(admin_error)?;
    Ok((StatusCode::CREATED, Json(account)))
}

#[derive(Debug, Deserialize)]
struct UpdateAccountRequest {
    status: Option<i64>,
    quota_total: Option<i64>,
    token_limit: Option<i64>,
}

async fn update_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(payload): Json<UpdateAccountRequest>,
) -> Result<Json<Account>, StatusCode> {
    require_admin(&state, &headers)?;
    let account = state
        .store
        .update_account(id, payload.status, payload.quota_total, payload.token_limit)
        .await
        .map_err(admin_error)?;
    Ok(Json(account))
}

// ----- admin: tokens -----

#[derive(Debug, Deserialize)]
struct TokensQuery {
    account_id: Option<i64>,
}

async fn list_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokensQuery>,
) -> Result<Json<Vec<Token>>, StatusCode> {
    require_admin(&state, &headers)?;
    let tokens = state
        .store
        .list_tokens(query.account_id)
        .await
        .map_err(admin_error)?;
    Ok(Json(tokens))
}

#[derive(Debug, Deserialize)]
struct CreateTokenRequest {
    account_id: i64,
    name: String,
    expires_at: Option<i64>,
    #[serde(default)]
    quota_total: i64,
    #[serde(default)]
    rate_limit_rpm: i64,
    #[serde(default)]
    allowed_models: String,
    #[serde(default)]
    allowed_ips: String,
}

#[derive(Debug, Serialize)]
struct CreateTokenResponse {
    token: Token,
    /// The plaintext key, returned exactly once.
    key: String,
}

async fn create_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<CreateTokenResponse>), StatusCode> {
    require_admin(&state, &headers)?;
    if payload.name.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let (token, key) = state
        .store
        .create_token(NewToken {
            account_id: payload.account_id,
            name: payload.name.trim().to_owned(),
            expires_at: payload.expires_at,
            quota_total: payload.quota_total,
            rate_limit_rpm: payload.rate_limit_rpm,
            allowed_models: payload.allowed_models,
            allowed_ips: payload.allowed_ips,
        })
        .await
        .map_err(admin_error)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse { token, key: key.plain }),
    ))
}

#[derive(Debug, Deserialize)]
struct UpdateTokenRequest {
    name: Option<String>,
    status: Option<i64>,
    expires_at: Option<i64>,
    quota_total: Option<i64>,
    rate_limit_rpm: Option<i64>,
    allowed_models: Option<String>,
    allowed_ips: Option<String>,
}

async fn update_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(payload): Json<UpdateTokenRequest>,
) -> Result<Json<Token>, StatusCode> {
    require_admin(&state, &headers)?;
    let mut token = state
        .store
        .get_token(id)
        .await
        .map_err(admin_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    if let Some(name) = payload.name {
        token.name = name;
    }
    if let Some(status) = payload.status {
        token.status = status;
    }
    if let Some(expires_at) = payload.expires_at {
        token.expires_at = Some(expires_at).filter(|ts| *ts > 0);
    }
    if let Some(quota_total) = payload.quota_total {
        token.quota_total = quota_total;
    }
    if let Some(rate_limit_rpm) = payload.rate_limit_rpm {
        token.rate_limit_rpm = rate_limit_rpm;
    }
    if let Some(allowed_models) = payload.allowed_models {
        token.allowed_models = allowed_models;
    }
    if let Some(allowed_ips) = payload.allowed_ips {
        token.allowed_ips = allowed_ips;
    }

    state.store.update_token(&token).await.map_err(admin_error)?;
    Ok(Json(token))
}

async fn delete_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    require_admin(&state, &headers)?;
    state.store.delete_token(id).await.map_err(admin_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct TokenSecretResponse {
    key: String,
}

async fn reset_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<TokenSecretResponse>, StatusCode> {
    require_admin(&state, &headers)?;
    state
        .store
        .get_token(id)
        .await
        .map_err(admin_error)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let key = state.store.reset_token_secret(id).await.map_err(admin_error)?;
    Ok(Json(TokenSecretResponse { key: key.plain }))
}

// ----- admin: IP bans -----

async fn list_ip_bans(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<IpBanEntry>>, StatusCode> {
    require_admin(&state, &headers)?;
    let bans = state.store.list_ip_bans().await.map_err(admin_error)?;
    Ok(Json(bans))
}

#[derive(Debug, Deserialize)]
struct CreateIpBanRequest {
    ip: String,
    #[serde(default)]
    reason: String,
    expires_at: Option<i64>,
}

async fn create_ip_ban(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateIpBanRequest>,
) -> Result<(StatusCode, Json<IpBanEntry>), StatusCode> {
    require_admin(&state, &headers)?;
    let ip = payload.ip.trim();
    if ip.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let ban = state
        .store
        .insert_ip_ban(ip, payload.reason.trim(), payload.expires_at)
        .await
        .map_err(admin_error)?;
    refresh_ban_cache(&state).await;
    Ok((StatusCode::CREATED, Json(ban)))
}

async fn delete_ip_ban(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    require_admin(&state, &headers)?;
    state.store.delete_ip_ban(id).await.map_err(admin_error)?;
    refresh_ban_cache(&state).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Ban edits must take effect immediately, not on the next timer tick.
async fn refresh_ban_cache(state: &AppState) {
    if let Err(err) = state.bans.refresh(&state.store).await {
        warn!("failed to refresh IP ban cache after edit: {err}");
    }
}

// ----- admin: logs -----

#[derive(Debug, Deserialize)]
struct LogsQuery {
    page: Option<usize>,
    page_size: Option<usize>,
    account_id: Option<i64>,
    token_id: Option<i64>,
    model: Option<String>,
    ip: Option<String>,
}

async fn list_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Paged<RequestLog>>, StatusCode> {
    require_admin(&state, &headers)?;
    let (items, total) = state
        .store
        .list_logs(&LogFilter {
            account_id: query.account_id,
            token_id: query.token_id,
            model: query.model,
            request_ip: query.ip,
            page: query.page.unwrap_or(1),
            page_size: query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        })
        .await
        .map_err(admin_error)?;
    Ok(Json(Paged { items, total }))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    account_id: Option<i64>,
}

async fn log_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StatsQuery>,
) -> Result<Json<LogStats>, StatusCode> {
    require_admin(&state, &headers)?;
    let stats = state
        .store
        .log_stats(query.account_id)
        .await
        .map_err(admin_error)?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
struct CleanQuery {
    days: Option<i64>,
}

async fn clean_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CleanQuery>,
) -> Result<Json<Value>, StatusCode> {
    require_admin(&state, &headers)?;
    let days = query.days.unwrap_or(30).max(1);
    let removed = state
        .store
        .delete_logs_before_days(days)
        .await
        .map_err(admin_error)?;
    Ok(Json(json!({ "removed": removed })))
}

// ----- admin: settings -----

async fn get_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    require_admin(&state, &headers)?;
    let settings = state.store.all_settings().await.map_err(admin_error)?;
    let mut map = serde_json::Map::new();
    for (key, value) in settings {
        map.insert(key, Value::String(value));
    }
    Ok(Json(Value::Object(map)))
}

#[derive(Debug, Deserialize)]
struct UpdateSettingsRequest {
    upstream_url: Option<String>,
    upstream_key: Option<String>,
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<UpdateSettingsRequest>,
) -> Result<StatusCode, StatusCode> {
    require_admin(&state, &headers)?;
    if let Some(url) = payload.upstream_url {
        state
            .store
            .set_setting("upstream_url", url.trim())
            .await
            .map_err(admin_error)?;
    }
    if let Some(key) = payload.upstream_key {
        state
            .store
            .set_setting("upstream_key", key.trim())
            .await
            .map_err(admin_error)?;
    }
    Ok(StatusCode::NO_CONTENT)
}
