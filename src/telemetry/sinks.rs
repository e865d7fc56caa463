use super::events::LimitEvent;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

/// Boxed future returned by every sink.
pub type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// A telemetry sink that consumes limit events.
///
/// Sinks are injected into the registry and the pipeline at construction.
/// They are shared across tasks, hence `Sync`.
pub trait TelemetrySink:
    tower::Service<LimitEvent, Response = (), Error = Self::SinkError, Future = SinkFuture<Self::SinkError>>
    + Clone
    + Send
    + Sync
    + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// Telemetry never fails a request: if a sink is not ready or returns an
/// error, the event is dropped.
pub async fn emit_best_effort<S: TelemetrySink>(sink: S, event: LimitEvent) {
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<LimitEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: LimitEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
///
/// Refusals are expected traffic and go out at `debug`; everything else at
/// `info`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<LimitEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimitEvent) -> Self::Future {
        match &event {
            LimitEvent::Blocked { .. } => {
                tracing::debug!(target: "quotaguard::telemetry", event = %event, "limit_event")
            }
            _ => tracing::info!(target: "quotaguard::telemetry", event = %event, "limit_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LimitEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<LimitEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LimitEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimitEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

#[derive(Debug, thiserror::Error)]
#[error("telemetry sink error: {0}")]
pub struct ComposedSinkError(#[source] Box<dyn std::error::Error + Send + Sync>);

/// Fans every event out to two sinks.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<LimitEvent> for MulticastSink<A, B>
where
    A: TelemetrySink,
    B: TelemetrySink,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = SinkFuture<ComposedSinkError>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimitEvent) -> Self::Future {
        let mut sink_a = self.sink_a.clone();
        let mut sink_b = self.sink_b.clone();
        let event_clone = event.clone();

        Box::pin(async move {
            let (res_a, res_b) = tokio::join!(sink_a.call(event), sink_b.call(event_clone));
            res_a.map_err(|e| ComposedSinkError(Box::new(e)))?;
            res_b.map_err(|e| ComposedSinkError(Box::new(e)))?;
            Ok(())
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: TelemetrySink,
    B: TelemetrySink,
{
    type SinkError = ComposedSinkError;
}
