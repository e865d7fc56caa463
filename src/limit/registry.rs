//! Registry of limit handlers keyed by scope.
//!
//! Handlers are discovered from upstream responses: the registry knows nothing
//! about a scope until its first response declares the window spans.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::limit::{BucketSnapshot, LimitHandler, LimitSettings, ScopeKey};
use crate::telemetry::{NullSink, TelemetrySink};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct ScopeEntry<S> {
    handlers: RwLock<BTreeMap<u32, Arc<LimitHandler<S>>>>,
    /// Spans declared by the most recent response for this scope.
    observed: RwLock<Vec<u32>>,
    /// Serializes first-sight handler creation.
    creation: Mutex<()>,
}

impl<S> Default for ScopeEntry<S> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(BTreeMap::new()),
            observed: RwLock::new(Vec::new()),
            creation: Mutex::new(()),
        }
    }
}

/// Maps each [`ScopeKey`] to one [`LimitHandler`] per declared window span.
///
/// Entries and handlers live as long as the registry. The space of regions,
/// routes and spans is small and fixed by the upstream, so growth is bounded
/// in practice.
#[derive(Debug)]
pub struct LimitRegistry<S = NullSink> {
    settings: LimitSettings,
    sink: S,
    scopes: RwLock<HashMap<ScopeKey, Arc<ScopeEntry<S>>>>,
}

impl LimitRegistry<NullSink> {
    pub fn new(settings: LimitSettings) -> Self {
        Self::with_sink(settings, NullSink)
    }
}

impl Default for LimitRegistry<NullSink> {
    fn default() -> Self {
        Self::new(LimitSettings::default())
    }
}

impl<S: TelemetrySink> LimitRegistry<S> {
    /// Registry whose handlers report to `sink`.
    pub fn with_sink(settings: LimitSettings, sink: S) -> Self {
        Self { settings, sink, scopes: RwLock::new(HashMap::new()) }
    }

    pub fn settings(&self) -> &LimitSettings {
        &self.settings
    }

    fn entry(&self, key: &ScopeKey) -> Option<Arc<ScopeEntry<S>>> {
        self.scopes.read().expect("limit registry poisoned").get(key).cloned()
    }

    fn entry_or_insert(&self, key: &ScopeKey) -> Arc<ScopeEntry<S>> {
        if let Some(entry) = self.entry(key) {
            return entry;
        }
        let mut scopes = self.scopes.write().expect("limit registry poisoned");
        scopes.entry(key.clone()).or_default().clone()
    }

    /// Handlers to consult before forwarding a request for `key`.
    ///
    /// Only spans declared by the most recent response count, and only
    /// handlers holding a live bucket are returned: a scope with no quota
    /// knowledge yet is not limited locally.
    pub fn handlers(&self, key: &ScopeKey) -> Vec<Arc<LimitHandler<S>>> {
        let Some(entry) = self.entry(key) else {
            return Vec::new();
        };
        let observed = entry.observed.read().expect("limit registry poisoned");
        let handlers = entry.handlers.read().expect("limit registry poisoned");
        observed
            .iter()
            .filter_map(|span| handlers.get(span))
            .filter(|handler| handler.has_bucket())
            .cloned()
            .collect()
    }

    /// Handler for one `(key, span)`, if it has been created.
    pub fn get(&self, key: &ScopeKey, span: u32) -> Option<Arc<LimitHandler<S>>> {
        let entry = self.entry(key)?;
        let handlers = entry.handlers.read().expect("limit registry poisoned");
        handlers.get(&span).cloned()
    }

    /// Handlers for every `(span, limit)` pair a response declared for `key`,
    /// in declaration order, creating the missing ones.
    ///
    /// Also records these spans as the scope's current set and applies the
    /// declared limits to the handlers' next buckets. Concurrent first sight
    /// of the same span yields a single handler.
    pub async fn resolve(&self, key: &ScopeKey, declared: &[(u32, u32)]) -> Vec<Arc<LimitHandler<S>>> {
        let entry = self.entry_or_insert(key);
        let _guard = entry.creation.lock().await;

        let mut resolved = Vec::with_capacity(declared.len());
        {
            let mut handlers = entry.handlers.write().expect("limit registry poisoned");
            for &(span, limit) in declared {
                let max = self.settings.effective_max(limit);
                let handler = handlers.entry(span).or_insert_with(|| {
                    debug!(
                        target: "quotaguard::registry",
                        scope = %key,
                        span,
                        limit,
                        max,
                        "created limit handler"
                    );
                    Arc::new(LimitHandler::with_sink(
                        key.clone(),
                        span,
                        limit,
                        &self.settings,
                        self.sink.clone(),
                    ))
                });
                if handler.max() != max {
                    debug!(
                        target: "quotaguard::registry",
                        scope = %key,
                        span,
                        previous = handler.max(),
                        max,
                        "declared limit changed"
                    );
                    handler.set_max(max);
                }
                resolved.push(handler.clone());
            }
        }

        let mut observed = entry.observed.write().expect("limit registry poisoned");
        *observed = declared.iter().map(|&(span, _)| span).collect();
        resolved
    }

    /// Number of scopes seen so far.
    pub fn len(&self) -> usize {
        self.scopes.read().expect("limit registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live buckets sorted by scope, then span.
    pub fn snapshot(&self) -> Vec<(ScopeKey, u32, BucketSnapshot)> {
        let scopes = self.scopes.read().expect("limit registry poisoned");
        let mut entries = Vec::new();
        for (key, entry) in scopes.iter() {
            let handlers = entry.handlers.read().expect("limit registry poisoned");
            for (span, handler) in handlers.iter() {
                if let Some(snapshot) = handler.snapshot() {
                    entries.push((key.clone(), *span, snapshot));
                }
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex as StdMutex;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[derive(Clone)]
    struct SharedWriter(Arc<StdMutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<StdMutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn unknown_scope_has_no_handlers() {
        let registry = LimitRegistry::default();
        assert!(registry.handlers(&ScopeKey::app("euw1")).is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn resolve_creates_once_per_span() {
        let registry = LimitRegistry::default();
        let key = ScopeKey::app("euw1");
        let first = registry.resolve(&key, &[(1, 20), (120, 100)]).await;
        let second = registry.resolve(&key, &[(1, 20), (120, 100)]).await;
        assert_eq!(first.len(), 2);
        assert!(Arc::ptr_eq(&first[0], &second[0]));
        assert!(Arc::ptr_eq(&first[1], &second[1]));
        assert_eq!(first[0].max(), 15);
        assert_eq!(first[1].max(), 95);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn preflight_skips_handlers_without_bucket() {
        let registry = LimitRegistry::default();
        let key = ScopeKey::app("euw1");
        let handlers = registry.resolve(&key, &[(1, 20), (120, 100)]).await;
        assert!(registry.handlers(&key).is_empty());

        handlers[1].update(t0(), t0(), 1).await;
        let live = registry.handlers(&key);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].span(), 120);
    }

    #[tokio::test]
    async fn preflight_follows_latest_declared_spans() {
        let registry = LimitRegistry::default();
        let key = ScopeKey::method("kr", "match/v4/matches");
        for handler in registry.resolve(&key, &[(10, 500), (600, 30_000)]).await {
            handler.update(t0(), t0(), 1).await;
        }
        assert_eq!(registry.handlers(&key).len(), 2);

        registry.resolve(&key, &[(10, 500)]).await;
        let live = registry.handlers(&key);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].span(), 10);
        assert!(registry.get(&key, 600).is_some());
    }

    #[tokio::test]
    async fn declared_limit_change_updates_max() {
        let registry = LimitRegistry::default();
        let key = ScopeKey::app("na1");
        let handler = registry.resolve(&key, &[(10, 100)]).await.remove(0);
        assert_eq!(handler.max(), 95);
        registry.resolve(&key, &[(10, 50)]).await;
        assert_eq!(handler.max(), 45);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_sight_yields_one_handler() {
        let registry = Arc::new(LimitRegistry::default());
        let key = ScopeKey::app("euw1");
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                let key = key.clone();
                tokio::spawn(async move { registry.resolve(&key, &[(10, 25)]).await.remove(0) })
            })
            .collect();
        let handlers: Vec<_> =
            futures::future::join_all(tasks).await.into_iter().map(|h| h.unwrap()).collect();
        assert!(handlers.iter().all(|h| Arc::ptr_eq(h, &handlers[0])));
    }

    #[tokio::test]
    async fn snapshot_is_sorted() {
        let registry = LimitRegistry::default();
        for region in ["na1", "euw1"] {
            let key = ScopeKey::app(region);
            for handler in registry.resolve(&key, &[(120, 100), (1, 20)]).await {
                handler.update(t0(), t0(), 2).await;
            }
        }
        let snapshot = registry.snapshot();
        let order: Vec<_> = snapshot.iter().map(|(k, span, _)| (k.to_string(), *span)).collect();
        assert_eq!(
            order,
            vec![
                ("euw1:app".to_string(), 1),
                ("euw1:app".to_string(), 120),
                ("na1:app".to_string(), 1),
                ("na1:app".to_string(), 120),
            ]
        );
        assert!(snapshot.iter().all(|(_, _, b)| b.count == 2));
    }

    #[tokio::test]
    async fn creation_is_logged() {
        let buffer = Arc::new(StdMutex::new(Vec::new()));
        let writer = SharedWriter(buffer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(writer))
            .with_max_level(tracing::Level::DEBUG)
            .with_target(true)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let registry = LimitRegistry::default();
        registry.resolve(&ScopeKey::app("euw1"), &[(10, 25)]).await;

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("created limit handler"));
        assert!(logs.contains("quotaguard::registry"));
    }
}
