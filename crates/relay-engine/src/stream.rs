//! SSE relaying with usage metering.
//!
//! Upstream chunks are re-framed as `data: {json}\n\n`. A clean finish ends
//! with `data: [DONE]`; an error after the first byte is reported as an
//! error event and the stream ends without `[DONE]`. The reservation is
//! settled for whatever was delivered, or refunded when nothing was.

use bytes::Bytes;
use futures::stream::BoxStream;
use relay_billing::QuotaReservation;
use relay_core::{ChannelId, EventStream, RelayError, RelayResult, StreamChunk, TokenCounter, Usage};
use relay_resilience::{CachedResponse, ResponseCache};
use relay_telemetry::RelayMetrics;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::usage::reconcile_usage;

/// Framed SSE output
pub type SseStream = BoxStream<'static, Bytes>;

/// Terminal frame of a clean stream
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Upstream stream whose first event has already been read.
///
/// Reading the first event before committing lets an upstream that fails
/// immediately be retried on another channel.
pub(crate) struct PrimedStream<T> {
    first: Option<T>,
    events: EventStream<T>,
}

impl<T: Send + 'static> PrimedStream<T> {
    /// Read the first event; an immediate error fails the attempt
    pub async fn prime(mut events: EventStream<T>) -> RelayResult<Self> {
        let first = match events.recv().await {
            Some(Ok(event)) => Some(event),
            Some(Err(e)) => return Err(e),
            None => None,
        };
        Ok(Self { first, events })
    }

    async fn next(&mut self) -> Option<Result<T, RelayError>> {
        if let Some(first) = self.first.take() {
            return Some(Ok(first));
        }
        self.events.recv().await
    }
}

/// Where a finished stream is cached
pub(crate) struct CacheSlot {
    pub cache: ResponseCache,
    pub key: String,
    pub user_id: i64,
    pub token_id: i64,
}

/// Tracks what a stream delivered and settles it exactly once
pub(crate) struct StreamMeter {
    reservation: Option<QuotaReservation>,
    request_id: String,
    channel_id: ChannelId,
    model: String,
    prompt_tokens: u32,
    reported: Option<Usage>,
    text: String,
    delivered: usize,
    counter: Arc<dyn TokenCounter>,
    metrics: Arc<RelayMetrics>,
}

impl StreamMeter {
    pub fn new(
        reservation: QuotaReservation,
        request_id: String,
        channel_id: ChannelId,
        model: String,
        counter: Arc<dyn TokenCounter>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            prompt_tokens: reservation.prompt_tokens(),
            reservation: Some(reservation),
            request_id,
            channel_id,
            model,
            reported: None,
            text: String::new(),
            delivered: 0,
            counter,
            metrics,
        }
    }

    fn observe<C: StreamChunk>(&mut self, chunk: &C) {
        if let Some(usage) = chunk.usage() {
            self.reported = Some(usage);
        }
        self.text.push_str(&chunk.delta_text());
    }

    fn mark_delivered(&mut self) {
        self.delivered += 1;
    }

    /// Usage so far, estimated where the upstream reported none
    pub fn usage(&self) -> Usage {
        reconcile_usage(self.reported, self.prompt_tokens, || {
            self.counter.count_text(&self.text, &self.model)
        })
    }

    /// Settle or refund; returns the settled usage
    async fn finish(&mut self) -> Option<Usage> {
        let reservation = self.reservation.take()?;
        if self.delivered == 0 {
            if let Err(e) = reservation.refund().await {
                error!(request_id = %self.request_id, error = %e, "Quota refund failed");
            }
            return None;
        }
        let usage = self.usage();
        match reservation.settle(self.channel_id, usage, true).await {
            Ok(settlement) => {
                self.metrics.record_quota(settlement.quota);
                debug!(request_id = %self.request_id, quota = settlement.quota, "Stream settled");
                Some(usage)
            }
            Err(e) => {
                error!(request_id = %self.request_id, error = %e, "Stream settlement failed");
                None
            }
        }
    }
}

impl Drop for StreamMeter {
    // The caller went away mid-stream.
    fn drop(&mut self) {
        let Some(reservation) = self.reservation.take() else {
            return;
        };
        if self.delivered == 0 {
            return;
        }
        let usage = self.usage();
        let channel_id = self.channel_id;
        let request_id = std::mem::take(&mut self.request_id);
        let metrics = Arc::clone(&self.metrics);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match reservation.settle(channel_id, usage, true).await {
                        Ok(settlement) => metrics.record_quota(settlement.quota),
                        Err(e) => error!(request_id = %request_id, error = %e, "Abandoned stream settlement failed"),
                    }
                });
            }
            Err(_) => warn!(request_id = %request_id, "No runtime to settle abandoned stream"),
        }
    }
}

fn frame<C: StreamChunk>(chunk: &C) -> Option<Bytes> {
    match serde_json::to_vec(chunk) {
        Ok(json) => {
            let mut out = Vec::with_capacity(json.len() + 8);
            out.extend_from_slice(b"data: ");
            out.extend_from_slice(&json);
            out.extend_from_slice(b"\n\n");
            Some(Bytes::from(out))
        }
        Err(e) => {
            warn!(error = %e, "Dropping unserializable stream chunk");
            None
        }
    }
}

/// SSE error event carrying the OpenAI envelope
#[must_use]
pub fn error_frame(error: &RelayError, request_id: &str) -> Bytes {
    let mut envelope = error.to_envelope();
    envelope.error.message = format!("{} (request id: {request_id})", envelope.error.message);
    let json = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {json}\n\n"))
}

/// Relay a primed upstream stream as SSE frames, metering as it goes
pub(crate) fn metered_sse<C: StreamChunk>(
    mut upstream: PrimedStream<C>,
    mut meter: StreamMeter,
    include_usage: bool,
    cache: Option<CacheSlot>,
) -> SseStream {
    Box::pin(async_stream::stream! {
        let mut last: Option<C> = None;
        let mut usage_forwarded = false;
        let mut transcript: Vec<u8> = Vec::new();
        let mut failed = false;

        while let Some(item) = upstream.next().await {
            let mut chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(request_id = %meter.request_id, error = %e, "Upstream stream failed");
                    failed = true;
                    yield error_frame(&e, &meter.request_id);
                    break;
                }
            };
            chunk.set_model(&meter.model);
            meter.observe(&chunk);
            let usage_only = !chunk.has_choices() && chunk.usage().is_some();
            if usage_only && !include_usage {
                continue;
            }
            if let Some(bytes) = frame(&chunk) {
                usage_forwarded |= chunk.usage().is_some();
                meter.mark_delivered();
                transcript.extend_from_slice(&bytes);
                yield bytes;
            }
            last = Some(chunk);
        }

        if failed {
            meter.finish().await;
        } else {
            if include_usage && !usage_forwarded {
                if let Some(last) = &last {
                    if let Some(bytes) = frame(&last.usage_chunk(meter.usage())) {
                        transcript.extend_from_slice(&bytes);
                        yield bytes;
                    }
                }
            }
            transcript.extend_from_slice(DONE_FRAME);
            yield Bytes::from_static(DONE_FRAME);

            let settled = meter.finish().await;
            if let (Some(usage), Some(slot)) = (settled, cache) {
                let entry = CachedResponse {
                    user_id: slot.user_id,
                    token_id: slot.token_id,
                    channel_id: meter.channel_id,
                    model: meter.model.clone(),
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    is_stream: true,
                    response: String::from_utf8_lossy(&transcript).into_owned(),
                };
                slot.cache.put(&slot.key, &entry).await;
            }
        }
    })
}
