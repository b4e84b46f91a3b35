//! Upstream that streams a completion slowly.
//!
//! Every completion sends `chunks` server-sent events, `delay` apart. The
//! server reports whether a stream ran to completion or was dropped early,
//! which is how tests observe a client disconnect propagating upstream.

use axum::{Router, body::Body, http::header, response::IntoResponse, routing::post};
use bytes::Bytes;
use futures_util::stream;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

/// Counters shared with the upstream's streams.
#[derive(Debug, Default)]
pub struct StreamCounters {
    pub completed: AtomicUsize,
    pub dropped_early: AtomicUsize,
}

/// Marks a stream as dropped unless it reached its end.
struct StreamState {
    next: u32,
    chunks: u32,
    counters: Arc<StreamCounters>,
    finished: bool,
}

impl Drop for StreamState {
    fn drop(&mut self) {
        if self.finished {
            self.counters.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.counters.dropped_early.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct SlowUpstream {
    pub addr: SocketAddr,
    pub counters: Arc<StreamCounters>,
    task: tokio::task::JoinHandle<()>,
}

impl SlowUpstream {
    pub async fn start(chunks: u32, delay: Duration) -> Self {
        let counters = Arc::new(StreamCounters::default());
        let handler_counters = counters.clone();

        let app = Router::new().route(
            "/api/organizations/{org}/chat_conversations/{conv}/completion",
            post(move || {
                let counters = handler_counters.clone();
                async move { slow_stream(chunks, delay, counters) }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            counters,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for SlowUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn slow_stream(chunks: u32, delay: Duration, counters: Arc<StreamCounters>) -> impl IntoResponse {
    let state = StreamState {
        next: 0,
        chunks,
        counters,
        finished: false,
    };

    let events = stream::unfold(state, move |mut state| async move {
        if state.next >= state.chunks {
            state.finished = true;
            return None;
        }
        if state.next > 0 {
            tokio::time::sleep(delay).await;
        }
        let frame = Bytes::from(format!("data: chunk-{}\n\n", state.next));
        state.next += 1;
        Some((Ok::<_, std::convert::Infallible>(frame), state))
    });

    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(events),
    )
}
