//! A stand-in LLM upstream for local runs: answers chat completions with
//! either a buffered JSON body or an SSE stream, both carrying a usage
//! object shaped like the real API's.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Query;
use axum::http::{Response, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::{Json, Router};
use bytes::Bytes;
use clap::Parser;
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Parser, Debug)]
struct Cli {
    /// Address to bind the mock upstream to.
    #[arg(long, default_value = "127.0.0.1:58089")]
    bind: SocketAddr,

    /// Milliseconds to sleep between SSE frames.
    #[arg(long, default_value_t = 200)]
    frame_delay_ms: u64,
}

#[derive(Debug, Deserialize)]
struct MockQuery {
    /// Force a specific HTTP status instead of 200.
    status: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let frame_delay = Duration::from_millis(cli.frame_delay_ms);

    let app = Router::new().route(
        "/v1/*path",
        any(move |Query(query): Query<MockQuery>, body: Bytes| handle(query, body, frame_delay)),
    );

    println!("Mock LLM upstream listening on http://{}", cli.bind);
    axum::serve(tokio::net::TcpListener::bind(cli.bind).await?, app).await?;
    Ok(())
}

async fn handle(query: MockQuery, body: Bytes, frame_delay: Duration) -> Response<Body> {
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("mock-model")
        .to_owned();
    let stream = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if let Some(code) = query.status
        && code >= 400
    {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (
            status,
            Json(json!({
                "error": {"message": "forced failure", "type": "server_error", "code": code}
            })),
        )
            .into_response();
    }

    if stream {
        return sse_response(model, frame_delay);
    }

    Json(json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello from the mock upstream."},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
    }))
    .into_response()
}

fn sse_response(model: String, frame_delay: Duration) -> Response<Body> {
    let chunks = vec![
        json!({"model": model, "choices": [{"delta": {"role": "assistant"}}]}),
        json!({"model": model, "choices": [{"delta": {"content": "Hello "}}]}),
        json!({"model": model, "choices": [{"delta": {"content": "from the mock."}}]}),
        json!({
            "model": model,
            "choices": [{"delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
        }),
    ];

    let stream = async_stream::stream! {
        for chunk in chunks {
            yield Ok::<_, std::convert::Infallible>(Bytes::from(format!("data: {chunk}\n\n")));
            tokio::time::sleep(frame_delay).await;
        }
        yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
