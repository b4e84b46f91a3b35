//! Streaming body wrapper for upstream responses.
//!
//! [`RelayBody`] forwards frames from the upstream body as they arrive,
//! without buffering or copying, and keeps per-stream counters. It imposes
//! no timeout of its own.
//!
//! Client disconnect needs no explicit signal: hyper drops the response body
//! when the caller goes away, which drops the wrapped upstream body and
//! releases the upstream connection. `Drop` notices that the stream never
//! reached its end and logs it.

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use sessiongate_core::route::RouteClass;
use sessiongate_core::telemetry::GatewayMetrics;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{debug, info};

use crate::error::ProxyError;

/// Counters for a single relayed stream.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    bytes_transferred: u64,
    chunks_count: u64,
    has_trailers: bool,
}

impl StreamStats {
    pub fn record_bytes(&mut self, count: usize) {
        self.bytes_transferred += count as u64;
        self.chunks_count += 1;
    }

    pub fn record_trailers(&mut self) {
        self.has_trailers = true;
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn chunks_count(&self) -> u64 {
        self.chunks_count
    }
}

/// Pass-through body that tracks what it relayed.
pub struct RelayBody<B> {
    inner: B,
    route: RouteClass,
    stats: StreamStats,
    started: Instant,
    finished: bool,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl<B> RelayBody<B> {
    pub fn new(inner: B, route: RouteClass) -> Self {
        Self {
            inner,
            route,
            stats: StreamStats::default(),
            started: Instant::now(),
            finished: false,
            metrics: None,
        }
    }

    /// Attach gateway metrics; the stream counts as active until dropped.
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        metrics.streams_active.inc();
        self.metrics = Some(metrics);
        self
    }
}

impl<B> Body for RelayBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match Pin::new(&mut self.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    let len = data.len();
                    self.stats.record_bytes(len);
                    if let Some(metrics) = &self.metrics {
                        metrics.relayed_bytes_total.inc_by(len as u64);
                    }
                } else if frame.is_trailers() {
                    self.stats.record_trailers();
                }
                // hyper stops polling once the body reports its end, so the
                // trailing `None` may never be observed.
                if self.inner.is_end_stream() {
                    self.finished = true;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                Poll::Ready(Some(Err(ProxyError::UpstreamBody(e.to_string()))))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for RelayBody<B> {
    fn drop(&mut self) {
        if let Some(metrics) = &self.metrics {
            metrics.streams_active.dec();
        }

        let elapsed_ms = self.started.elapsed().as_millis();
        if self.finished {
            debug!(
                route = %self.route,
                bytes = self.stats.bytes_transferred(),
                chunks = self.stats.chunks_count(),
                trailers = self.stats.has_trailers,
                elapsed_ms,
                "Relay stream complete"
            );
        } else {
            if let Some(metrics) = &self.metrics {
                metrics.client_disconnects_total.inc();
            }
            info!(
                route = %self.route,
                bytes = self.stats.bytes_transferred(),
                chunks = self.stats.chunks_count(),
                elapsed_ms,
                "Client disconnected before upstream finished, upstream body released"
            );
        }
    }
}
