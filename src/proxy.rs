use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Response, StatusCode, header};
use axum::response::IntoResponse;
use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use tracing::warn;
use url::Url;

use crate::admission::{RejectKind, Rejection};
use crate::logging::LogPipeline;
use crate::store::{RequestLog, Store};
use crate::usage::{self, UsageInfo};

/// 进程启动时给定的 upstream 地址与凭证，可被 settings 覆盖。
#[derive(Debug, Clone, Default)]
pub struct UpstreamConfig {
    pub url: Option<String>,
    pub key: Option<String>,
}

/// An admitted request ready to be forwarded upstream.
#[derive(Debug)]
pub struct ForwardRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub allowed_models: String,
    pub token_id: i64,
    pub account_id: i64,
    pub client_ip: String,
}

#[derive(Debug, Clone)]
struct RecordMeta {
    account_id: i64,
    token_id: i64,
    request_ip: String,
    method: String,
    path: String,
}

/// 面向单一 upstream 的转发核心：注入服务端凭证，拦截响应提取用量。
#[derive(Clone)]
pub struct RelayProxy {
    client: reqwest::Client,
    store: Store,
    pipeline: LogPipeline,
    config: UpstreamConfig,
}

impl RelayProxy {
    pub fn new(store: Store, pipeline: LogPipeline, config: UpstreamConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            store,
            pipeline,
            config,
        }
    }

    /// Forward one admitted request and relay the response. The body has
    /// already been read by the caller; it is re-attached unmodified.
    pub async fn forward(&self, request: ForwardRequest) -> Response<Body> {
        let (model, wants_stream) = sniff_request_body(&request.body);

        // Model gate runs before any upstream traffic. Empty or unparsed
        // model names pass through; the upstream validates those itself.
        if !request.allowed_models.trim().is_empty() && !model.is_empty() {
            let allowed = request
                .allowed_models
                .split(',')
                .map(str::trim)
                .any(|m| m == model);
            if !allowed {
                return Rejection::new(
                    RejectKind::ModelNotAllowed,
                    format!("Model not allowed: {model}"),
                )
                .into_response();
            }
        }

        let (upstream, upstream_key) = match self.resolve_upstream().await {
            Ok(pair) => pair,
            Err(rejection) => return rejection.into_response(),
        };

        let meta = RecordMeta {
            account_id: request.account_id,
            token_id: request.token_id,
            request_ip: request.client_ip,
            method: request.method.to_string(),
            path: request.path.clone(),
        };

        let mut url = upstream;
        url.set_path(&request.path);
        url.set_query(request.query.as_deref());

        let mut headers = request.headers;
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::COOKIE);
        let Ok(credential) = HeaderValue::from_str(&format!("Bearer {upstream_key}")) else {
            return Rejection::new(RejectKind::ServerError, "Invalid upstream credential")
                .into_response();
        };
        headers.insert(header::AUTHORIZATION, credential);

        let started = Instant::now();
        let result = self
            .client
            .request(request.method, url)
            .headers(headers)
            .body(request.body)
            .send()
            .await;

        match result {
            Ok(response) if wants_stream => self.relay_streaming(meta, model, response, started),
            Ok(response) => self.relay_buffered(meta, model, response, started).await,
            Err(err) => self.upstream_failure(meta, model, started, &err.to_string()),
        }
    }

    /// Buffer the whole response, account for it, then replay the bytes to
    /// the client unchanged.
    async fn relay_buffered(
        &self,
        meta: RecordMeta,
        model: String,
        response: reqwest::Response,
        started: Instant,
    ) -> Response<Body> {
        let status = response.status();
        let resp_headers = response.headers().clone();

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => return self.upstream_failure(meta, model, started, &err.to_string()),
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        let usage = usage::extract_usage(&body);
        self.record(&meta, model, status.as_u16() as i64, duration_ms, usage, None);

        let mut builder = Response::builder().status(status);
        if let Some(dst) = builder.headers_mut() {
            copy_response_headers(dst, &resp_headers);
            dst.insert(header::CONTENT_LENGTH, content_length_value(body.len()));
        }
        builder
            .body(Body::from(body))
            .unwrap_or_else(|_| internal_error_response())
    }

    /// Wrap the upstream body in the pass-through observer; the recording
    /// path runs exactly once whichever way the stream ends.
    fn relay_streaming(
        &self,
        meta: RecordMeta,
        model: String,
        response: reqwest::Response,
        started: Instant,
    ) -> Response<Body> {
        let status = response.status();
        let resp_headers = response.headers().clone();
        // For streams the duration is time to response headers; the tail is
        // paced by the client.
        let duration_ms = started.elapsed().as_millis() as i64;
        let status_code = status.as_u16() as i64;

        let proxy = self.clone();
        let observed = usage::observe_stream(response.bytes_stream(), model, move |outcome| {
            proxy.record(&meta, outcome.model, status_code, duration_ms, outcome.usage, None);
        });

        let mut builder = Response::builder().status(status);
        if let Some(dst) = builder.headers_mut() {
            copy_response_headers(dst, &resp_headers);
        }
        builder
            .body(Body::from_stream(observed))
            .unwrap_or_else(|_| internal_error_response())
    }

    fn upstream_failure(
        &self,
        meta: RecordMeta,
        model: String,
        started: Instant,
        error: &str,
    ) -> Response<Body> {
        warn!("upstream request failed: {error}");
        let duration_ms = started.elapsed().as_millis() as i64;
        self.record(
            &meta,
            model,
            StatusCode::BAD_GATEWAY.as_u16() as i64,
            duration_ms,
            UsageInfo::default(),
            Some(error.to_string()),
        );
        Rejection::with_status(
            RejectKind::ServerError,
            StatusCode::BAD_GATEWAY,
            "Upstream service unavailable",
        )
        .into_response()
    }

    /// Enqueue the usage record and, for 2xx responses, fire the billing
    /// increments. Neither may delay or fail the client-visible response.
    fn record(
        &self,
        meta: &RecordMeta,
        model: String,
        status_code: i64,
        duration_ms: i64,
        usage: UsageInfo,
        error_message: Option<String>,
    ) {
        self.pipeline.record(RequestLog {
            id: 0,
            account_id: meta.account_id,
            token_id: meta.token_id,
            request_ip: meta.request_ip.clone(),
            method: meta.method.clone(),
            path: meta.path.clone(),
            model,
            status_code,
            duration_ms,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            error_message,
            created_at: Utc::now().timestamp(),
        });

        if (200..300).contains(&status_code) {
            let store = self.store.clone();
            let token_id = meta.token_id;
            let account_id = meta.account_id;
            tokio::spawn(async move {
                if let Err(err) = store.increment_usage(token_id, account_id).await {
                    warn!("failed to increment usage counters: {err}");
                }
            });
        }
    }

    async fn resolve_upstream(&self) -> Result<(Url, String), Rejection> {
        let url = self
            .store
            .get_setting("upstream_url")
            .await
            .ok()
            .flatten()
            .or_else(|| self.config.url.clone());
        let key = self
            .store
            .get_setting("upstream_key")
            .await
            .ok()
            .flatten()
            .or_else(|| self.config.key.clone());

        let (Some(url), Some(key)) = (url, key) else {
            return Err(Rejection::with_status(
                RejectKind::ServerError,
                StatusCode::SERVICE_UNAVAILABLE,
                "Upstream not configured",
            ));
        };

        let url = Url::parse(&url).map_err(|_| {
            Rejection::new(RejectKind::ServerError, "Invalid upstream URL")
        })?;
        Ok((url, key))
    }
}

/// Speculatively pull `model` and `stream` out of a JSON request body.
/// Anything unparseable forwards as-is with defaults.
pub(crate) fn sniff_request_body(body: &[u8]) -> (String, bool) {
    match serde_json::from_slice::<Value>(body) {
        Ok(payload) => (
            payload
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            payload
                .get("stream")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        ),
        Err(_) => (String::new(), false),
    }
}

fn copy_response_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src.iter() {
        if name == header::TRANSFER_ENCODING
            || name == header::CONNECTION
            || name == header::CONTENT_LENGTH
        {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

fn content_length_value(len: usize) -> HeaderValue {
    HeaderValue::from_str(&len.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn internal_error_response() -> Response<Body> {
    Response::builder()
        .status(500)
        .body(Body::empty())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;

    #[test]
    fn sniff_reads_model_and_stream() {
        let (model, stream) = sniff_request_body(br#"{"model":"gpt-a","stream":true}"#);
        assert_eq!(model, "gpt-a");
        assert!(stream);

        let (model, stream) = sniff_request_body(br#"{"messages":[]}"#);
        assert!(model.is_empty());
        assert!(!stream);

        let (model, stream) = sniff_request_body(b"\x00binary");
        assert!(model.is_empty());
        assert!(!stream);
    }

    fn forward_request(body: &str, allowed_models: &str) -> ForwardRequest {
        ForwardRequest {
            method: Method::POST,
            path: "/v1/chat/completions".into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::copy_from_slice(body.as_bytes()),
            allowed_models: allowed_models.into(),
            token_id: 1,
            account_id: 1,
            client_ip: "10.0.0.1".into(),
        }
    }

    async fn envelope(response: Response<Body>) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn disallowed_model_is_rejected_before_forwarding() {
        let store = temp_store("proxy-model").await;
        let pipeline = LogPipeline::spawn(store.clone());
        // No upstream configured: reaching the upstream would 503, so a 403
        // here proves the gate fired first.
        let proxy = RelayProxy::new(store, pipeline, UpstreamConfig::default());

        let response = proxy
            .forward(forward_request(r#"{"model":"gpt-c"}"#, "gpt-a,gpt-b"))
            .await;
        let (status, body) = envelope(response).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["type"], "model_not_allowed");
        assert_eq!(body["error"]["code"], 403);
    }

    #[tokio::test]
    async fn allowed_and_unparsed_models_reach_upstream_resolution() {
        let store = temp_store("proxy-model-pass").await;
        let pipeline = LogPipeline::spawn(store.clone());
        let proxy = RelayProxy::new(store, pipeline, UpstreamConfig::default());

        for body in [r#"{"model":"gpt-a"}"#, "not json", r#"{"messages":[]}"#] {
            let response = proxy.forward(forward_request(body, "gpt-a,gpt-b")).await;
            let (status, body) = envelope(response).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(body["error"]["type"], "server_error");
            assert_eq!(body["error"]["message"], "Upstream not configured");
        }
    }

    #[tokio::test]
    async fn settings_override_process_config() {
        let store = temp_store("proxy-settings").await;
        let pipeline = LogPipeline::spawn(store.clone());
        let proxy = RelayProxy::new(
            store.clone(),
            pipeline,
            UpstreamConfig { url: Some("http://config.example".into()), key: None },
        );

        // URL alone is not enough.
        let rejection = proxy.resolve_upstream().await.unwrap_err();
        assert_eq!(rejection.status, StatusCode::SERVICE_UNAVAILABLE);

        store.set_setting("upstream_key", "sk-up").await.unwrap();
        store
            .set_setting("upstream_url", "http://settings.example")
            .await
            .unwrap();
        let (url, key) = proxy.resolve_upstream().await.unwrap();
        assert_eq!(url.as_str(), "http://settings.example/");
        assert_eq!(key, "sk-up");
    }
}
