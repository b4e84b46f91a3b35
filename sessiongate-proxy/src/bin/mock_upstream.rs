//! Mock chat-completion upstream for exercising the SessionGate proxy.
//!
//! Completions stream as server-sent events with a configurable delay between
//! chunks, which makes relay latency visible. Any other path echoes what the
//! upstream received.
//!
//! # Environment Variables
//!
//! - `MOCK_UPSTREAM_PORT`: Listen port (default: 9999)
//! - `MOCK_UPSTREAM_CHUNKS`: Events per completion (default: 5)
//! - `MOCK_UPSTREAM_CHUNK_DELAY_MS`: Delay between events (default: 200)
//! - `MOCK_UPSTREAM_RATE_LIMIT`: When `1`, completions answer 429 (default: 0)
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin mock_upstream
//! SESSIONGATE_UPSTREAM_URL=http://127.0.0.1:9999 cargo run --bin sessiongate
//!
//! curl -N -X POST --cookie username=alice \
//!   http://localhost:8787/api/organizations/o/chat_conversations/c/completion
//! ```

use axum::{
    Json, Router,
    body::Body,
    extract::Path,
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::post,
};
use bytes::Bytes;
use futures_util::stream;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

async fn completion(Path((org, conv)): Path<(String, String)>) -> Response {
    if env_or("MOCK_UPSTREAM_RATE_LIMIT", 0u8) == 1 {
        return rate_limited();
    }

    let chunks: u32 = env_or("MOCK_UPSTREAM_CHUNKS", 5);
    let delay = Duration::from_millis(env_or("MOCK_UPSTREAM_CHUNK_DELAY_MS", 200));

    let events = stream::unfold(0u32, move |i| {
        let org = org.clone();
        let conv = conv.clone();
        async move {
            if i >= chunks {
                return None;
            }
            if i > 0 {
                tokio::time::sleep(delay).await;
            }
            let event = serde_json::json!({
                "type": "completion",
                "completion": format!("chunk {i} "),
                "organization": org,
                "conversation": conv,
            });
            let frame = Bytes::from(format!("event: completion\ndata: {event}\n\n"));
            Some((Ok::<_, std::convert::Infallible>(frame), i + 1))
        }
    });

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(events),
    )
        .into_response()
}

fn rate_limited() -> Response {
    let resets_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() + 3600)
        .unwrap_or(0);
    let inner = serde_json::json!({ "resetsAt": resets_at, "remaining": 0 }).to_string();
    let body = serde_json::json!({
        "type": "error",
        "error": { "type": "rate_limit_error", "message": inner },
    });
    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}

async fn echo(method: Method, uri: Uri, headers: HeaderMap) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "method": method.as_str(),
        "path": uri.path(),
        "query": uri.query(),
        "host": headers.get(header::HOST).and_then(|v| v.to_str().ok()),
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let port: u16 = env_or("MOCK_UPSTREAM_PORT", 9999);

    let app = Router::new()
        .route(
            "/api/organizations/{org}/chat_conversations/{conv}/completion",
            post(completion),
        )
        .fallback(echo);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    println!("Mock upstream listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
