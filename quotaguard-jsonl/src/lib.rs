//! JSONL sink for `quotaguard`. Writes one limit event per line.
//!
//! Retired buckets produce the usage records (`count/max`, dead time, space
//! time, over-requests) used to tune the safety margins. Always writes; bring
//! your own path.

use quotaguard::telemetry::{event_to_json, LimitEvent, SinkFuture, TelemetrySink};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
    /// Keeps concurrent appends from interleaving within one process.
    write_lock: Arc<Mutex<()>>,
    /// When set, only `bucket_retired` records are written.
    retirements_only: bool,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into(), write_lock: Arc::new(Mutex::new(())), retirements_only: false }
    }

    /// Sink that writes only the bucket usage log.
    pub fn retirements_only<P: Into<PathBuf>>(path: P) -> Self {
        Self { retirements_only: true, ..Self::new(path) }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl tower_service::Service<LimitEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = SinkFuture<io::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimitEvent) -> Self::Future {
        if self.retirements_only && !matches!(event, LimitEvent::BucketRetired(_)) {
            return Box::pin(async { Ok(()) });
        }
        let path = self.path.clone();
        let lock = self.write_lock.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let _guard = lock.lock().await;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            tracing::trace!(target: "quotaguard::telemetry", path = %path.display(), "appended limit event");
            Ok(())
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}
