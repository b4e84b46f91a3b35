//! Upstream 429 interception.
//!
//! A rate-limited completion is the only response the gateway reads before
//! relaying. The body is collected up to a configured limit, handed to
//! [`QuotaBookkeeper`], and then returned byte-for-byte with the original
//! status and headers. Nothing bookkeeping does can change what the caller
//! receives.
//!
//! Bodies larger than the limit skip bookkeeping: the bytes already read are
//! replayed ahead of the rest of the stream. So do bodies with a
//! `Content-Encoding`; the dispatcher strips `Accept-Encoding` on the
//! completion route, so upstream only compresses if it ignores that.

use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream};
use http_body::{Body, Frame};
use http_body_util::{BodyExt, BodyStream, Full, StreamBody};
use hyper::Response;
use sessiongate_core::identity::ClientIdentity;
use sessiongate_core::quota::QuotaBookkeeper;
use sessiongate_core::route::RouteClass;
use sessiongate_core::telemetry::GatewayMetrics;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::forwarder::{UnifiedBody, compressed_encoding};
use crate::relay_body::RelayBody;

/// What collecting a bounded body produced.
enum Collected<B> {
    /// Whole body, within the limit.
    Complete(Bytes),
    /// Limit exceeded: the frames read so far plus the unread remainder.
    Overflow { prefix: Vec<Bytes>, rest: B },
}

/// Records quota state from 429 responses and relays them unchanged.
#[derive(Clone)]
pub struct RateLimitTracker {
    bookkeeper: QuotaBookkeeper,
    body_max: usize,
    metrics: Arc<GatewayMetrics>,
}

impl RateLimitTracker {
    pub fn new(bookkeeper: QuotaBookkeeper, body_max: usize, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            bookkeeper,
            body_max,
            metrics,
        }
    }

    /// Inspect a 429 response and return it unchanged.
    ///
    /// # Errors
    ///
    /// Only a failure reading the upstream body is returned. Bookkeeping
    /// failures are logged and counted.
    pub async fn handle<B>(
        &self,
        response: Response<B>,
        identity: Option<&ClientIdentity>,
        route: RouteClass,
    ) -> ProxyResult<Response<UnifiedBody>>
    where
        B: Body<Data = Bytes> + Send + Sync + Unpin + 'static,
        B::Error: std::fmt::Display,
    {
        if let Some(encoding) = compressed_encoding(&response).map(str::to_owned) {
            warn!(
                route = %route,
                encoding = %encoding,
                "Rate-limit body is compressed, relaying without quota update"
            );
            self.metrics.record_quota_outcome("compressed");
            let (parts, body) = response.into_parts();
            let relay = RelayBody::new(body, route).with_metrics(self.metrics.clone());
            return Ok(Response::from_parts(parts, BodyExt::boxed(relay)));
        }

        let (parts, body) = response.into_parts();

        match collect_bounded(body, self.body_max).await? {
            Collected::Complete(bytes) => {
                let outcome = self.bookkeeper.observe(identity, &bytes).await;
                self.metrics.record_quota_outcome(outcome.label());
                debug!(
                    route = %route,
                    outcome = outcome.label(),
                    body_len = bytes.len(),
                    "Rate-limited response inspected"
                );
                self.metrics.relayed_bytes_total.inc_by(bytes.len() as u64);

                let body = Full::new(bytes)
                    .map_err(|never| -> ProxyError { match never {} })
                    .boxed();
                Ok(Response::from_parts(parts, body))
            }
            Collected::Overflow { prefix, rest } => {
                warn!(
                    route = %route,
                    limit = self.body_max,
                    "Rate-limit body exceeds inspection limit, relaying without quota update"
                );
                self.metrics.record_quota_outcome("oversized");

                let replay =
                    stream::iter(prefix.into_iter().map(|b| Ok::<_, ProxyError>(Frame::data(b))));
                let rest = BodyStream::new(
                    RelayBody::new(rest, route).with_metrics(self.metrics.clone()),
                );
                let body = BodyExt::boxed(StreamBody::new(replay.chain(rest)));
                Ok(Response::from_parts(parts, body))
            }
        }
    }
}

/// Read data frames until the body ends or more than `limit` bytes arrive.
///
/// Trailers are dropped; upstream 429s do not send them.
async fn collect_bounded<B>(mut body: B, limit: usize) -> ProxyResult<Collected<B>>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let mut frames = Vec::new();
    let mut total = 0usize;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ProxyError::UpstreamBody(e.to_string()))?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        total += data.len();
        frames.push(data);
        if total > limit {
            return Ok(Collected::Overflow { prefix: frames, rest: body });
        }
    }

    let bytes = match frames.len() {
        0 => Bytes::new(),
        1 => frames.swap_remove(0),
        _ => {
            let mut buf = BytesMut::with_capacity(total);
            for chunk in frames {
                buf.extend_from_slice(&chunk);
            }
            buf.freeze()
        }
    };
    Ok(Collected::Complete(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use prometheus_client::registry::Registry;
    use sessiongate_core::storage::{MemoryStore, SessionStore};
    use sessiongate_core::telemetry::prom_metrics::QuotaLabels;

    const RATE_LIMITED: &str =
        r#"{"error":{"message":"{\"resetsAt\":1700000000,\"remaining\":0}"}}"#;

    fn tracker(store: Arc<MemoryStore>, body_max: usize) -> RateLimitTracker {
        let metrics = Arc::new(GatewayMetrics::new(&mut Registry::default()));
        let store: Arc<dyn SessionStore> = store;
        RateLimitTracker::new(QuotaBookkeeper::new(store), body_max, metrics)
    }

    type TestFrame = Result<Frame<Bytes>, std::io::Error>;
    type TestBody = StreamBody<stream::Iter<std::vec::IntoIter<TestFrame>>>;

    fn chunked(parts: &[&'static str]) -> TestBody {
        let frames: Vec<TestFrame> = parts
            .iter()
            .map(|p| Ok(Frame::data(Bytes::from_static(p.as_bytes()))))
            .collect();
        StreamBody::new(stream::iter(frames))
    }

    fn too_many<B>(body: B) -> Response<B> {
        Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header("content-type", "application/json")
            .header("retry-after", "3600")
            .body(body)
            .unwrap()
    }

    #[tokio::test]
    async fn test_records_quota_and_relays_body() {
        let store = Arc::new(MemoryStore::new());
        store.insert_binding(&ClientIdentity::new("203.0.113.7"), "user@example.com");
        let tracker = tracker(store.clone(), 64 * 1024);

        let (head, tail) = RATE_LIMITED.split_at(20);
        let identity = ClientIdentity::new("203.0.113.7");
        let resp = tracker
            .handle(too_many(chunked(&[head, tail])), Some(&identity), RouteClass::Completion)
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["retry-after"], "3600");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, RATE_LIMITED.as_bytes());

        let record = store.quota_for("user@example.com").unwrap();
        assert_eq!(record.resets_at, 1_700_000_000);
        assert_eq!(record.remaining, Some(serde_json::json!(0)));
    }

    #[tokio::test]
    async fn test_unknown_identity_relays_without_write() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(store.clone(), 64 * 1024);

        let identity = ClientIdentity::new("198.51.100.1");
        let resp = tracker
            .handle(too_many(chunked(&[RATE_LIMITED])), Some(&identity), RouteClass::Completion)
            .await
            .unwrap();

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, RATE_LIMITED.as_bytes());
        assert_eq!(store.quota_count(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_is_absorbed() {
        let store = Arc::new(MemoryStore::new());
        store.insert_binding(&ClientIdentity::new("203.0.113.7"), "user@example.com");
        store.fail_writes(true);
        let tracker = tracker(store.clone(), 64 * 1024);

        let identity = ClientIdentity::new("203.0.113.7");
        let resp = tracker
            .handle(too_many(chunked(&[RATE_LIMITED])), Some(&identity), RouteClass::Completion)
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, RATE_LIMITED.as_bytes());
        assert_eq!(store.quota_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_body_skips_bookkeeping() {
        let store = Arc::new(MemoryStore::new());
        store.insert_binding(&ClientIdentity::new("203.0.113.7"), "user@example.com");
        let tracker = tracker(store.clone(), 16);

        let (a, rest) = RATE_LIMITED.split_at(10);
        let (b, c) = rest.split_at(10);
        let identity = ClientIdentity::new("203.0.113.7");
        let resp = tracker
            .handle(too_many(chunked(&[a, b, c])), Some(&identity), RouteClass::Completion)
            .await
            .unwrap();

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, RATE_LIMITED.as_bytes());
        assert_eq!(store.quota_count(), 0);
    }

    #[tokio::test]
    async fn test_upstream_body_error_is_a_fault() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(store, 64 * 1024);

        let frames: Vec<Result<Frame<Bytes>, std::io::Error>> = vec![
            Ok(Frame::data(Bytes::from_static(b"{\"error\":"))),
            Err(std::io::Error::other("reset by peer")),
        ];
        let body = StreamBody::new(stream::iter(frames));
        let result = tracker.handle(too_many(body), None, RouteClass::Completion).await;

        assert!(matches!(result, Err(ProxyError::UpstreamBody(_))));
    }

    #[tokio::test]
    async fn test_compressed_body_relayed_without_bookkeeping() {
        let store = Arc::new(MemoryStore::new());
        store.insert_binding(&ClientIdentity::new("203.0.113.7"), "user@example.com");
        let metrics = Arc::new(GatewayMetrics::new(&mut Registry::default()));
        let dyn_store: Arc<dyn SessionStore> = store.clone();
        let tracker =
            RateLimitTracker::new(QuotaBookkeeper::new(dyn_store), 64 * 1024, metrics.clone());

        // gzip magic followed by junk; never decoded.
        const GZIPPED: &str = "\u{1f}\u{8b}\u{8}\u{0}compressed";
        let mut resp = too_many(chunked(&[GZIPPED]));
        resp.headers_mut()
            .insert("content-encoding", http::HeaderValue::from_static("gzip"));

        let identity = ClientIdentity::new("203.0.113.7");
        let resp = tracker
            .handle(resp, Some(&identity), RouteClass::Completion)
            .await
            .unwrap();

        assert_eq!(resp.headers()["content-encoding"], "gzip");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, GZIPPED.as_bytes());
        assert_eq!(store.quota_count(), 0);
        assert_eq!(
            metrics
                .quota_updates_total
                .get_or_create(&QuotaLabels {
                    outcome: "compressed".to_string(),
                })
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_empty_body() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(store.clone(), 64 * 1024);

        let resp = tracker
            .handle(too_many(chunked(&[])), None, RouteClass::Completion)
            .await
            .unwrap();

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
        assert_eq!(store.quota_count(), 0);
    }
}
