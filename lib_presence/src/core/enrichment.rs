//! # Enrichment Cache
//!
//! Session-wide memo of secondary attributes (display name, avatar, level)
//! keyed by the same id family as the tracked entities. One cache is shared
//! by every scope of a session; each scope's store registers as a listener.
//! Lookups never block: the caller gets `Pending` straight away, and the
//! record is backfilled by a background fetch that is announced on every
//! listening store's notifier.
//!
//! - One fetch per id for the lifetime of the cache, even when several scopes
//!   or events reference the id while the first fetch is still in flight.
//! - Failures and not-found both resolve to a permanent `Unknown`, so a broken
//!   id is never retried within the session.
//! - A listener whose token is cancelled is dropped and hears nothing more.
//!   Once the cache's own token is cancelled, a completing fetch is discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::entity::EntityId;
use crate::core::store::StoreNotification;
use crate::error::SyncError;

/// Resolution state of one enrichment record.
#[derive(Debug, Clone, PartialEq)]
pub enum Enrichment<R> {
    /// Fetch in flight; present the entity with a default placeholder.
    Pending,
    /// Fetched successfully.
    Resolved(R),
    /// Fetch failed or found nothing. Never retried.
    Unknown,
}

impl<R: Clone + Default> Enrichment<R> {
    /// The resolved record, or the empty default placeholder.
    pub fn value_or_default(&self) -> R {
        match self {
            Self::Resolved(record) => record.clone(),
            Self::Pending | Self::Unknown => R::default(),
        }
    }
}

/// Where enrichment records come from.
#[async_trait]
pub trait EnrichmentSource<R>: Send + Sync {
    /// Fetches the record for `entity_id`; `Ok(None)` means not found.
    async fn fetch(&self, entity_id: &str) -> Result<Option<R>, SyncError>;
}

/// A store that wants to hear about backfills, for as long as its scope lives.
struct Listener {
    notifier: broadcast::Sender<StoreNotification>,
    scope: CancellationToken,
}

type Entries<R> = Mutex<HashMap<EntityId, Enrichment<R>>>;

/// Memoized, lazily filled enrichment records.
pub struct EnrichmentCache<R> {
    entries: Arc<Entries<R>>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    source: Arc<dyn EnrichmentSource<R>>,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn announce(listeners: &Mutex<Vec<Listener>>, entity_id: &str) {
    let mut listeners = lock(listeners);
    listeners.retain(|l| !l.scope.is_cancelled());
    for listener in listeners.iter() {
        let _ = listener
            .notifier
            .send(StoreNotification::EnrichmentResolved(entity_id.to_string()));
    }
}

impl<R: Clone + Send + Sync + 'static> EnrichmentCache<R> {
    /// Builds an empty cache over `source`. Results arriving after `cancel`
    /// fires are discarded.
    pub fn new(source: Arc<dyn EnrichmentSource<R>>, cancel: CancellationToken) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            listeners: Arc::new(Mutex::new(Vec::new())),
            source,
            cancel,
        }
    }

    /// Announces future backfills on `notifier` until `scope` is cancelled.
    pub fn listen(&self, notifier: broadcast::Sender<StoreNotification>, scope: CancellationToken) {
        let mut listeners = lock(&self.listeners);
        listeners.retain(|l| !l.scope.is_cancelled());
        listeners.push(Listener { notifier, scope });
    }

    /// Current state without triggering a fetch. `None` if never referenced.
    pub fn get(&self, entity_id: &str) -> Option<Enrichment<R>> {
        lock(&self.entries).get(entity_id).cloned()
    }

    /// Current state, starting the one-and-only fetch on first reference.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn ensure(&self, entity_id: &str) -> Enrichment<R> {
        {
            let mut entries = lock(&self.entries);
            if let Some(existing) = entries.get(entity_id) {
                return existing.clone();
            }
            entries.insert(entity_id.to_string(), Enrichment::Pending);
        }

        if self.cancel.is_cancelled() {
            return Enrichment::Pending;
        }

        let id = entity_id.to_string();
        let entries = Arc::clone(&self.entries);
        let listeners = Arc::clone(&self.listeners);
        let source = Arc::clone(&self.source);
        let cancel = self.cancel.clone();

        tracing::debug!(entity_id = %id, "fetching enrichment");
        tokio::spawn(async move {
            let result = source.fetch(&id).await;
            if cancel.is_cancelled() {
                tracing::debug!(entity_id = %id, "session torn down, discarding enrichment");
                return;
            }
            let resolved = match result {
                Ok(Some(record)) => Enrichment::Resolved(record),
                Ok(None) => {
                    tracing::debug!(entity_id = %id, "no enrichment record, caching unknown");
                    Enrichment::Unknown
                }
                Err(e) => {
                    tracing::warn!(entity_id = %id, error = %e, "enrichment fetch failed, caching unknown");
                    Enrichment::Unknown
                }
            };
            lock(&entries).insert(id.clone(), resolved);
            announce(&listeners, &id);
        });

        Enrichment::Pending
    }

    /// Number of ids referenced so far.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// True when no id has been referenced yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct GatedSource {
        calls: AtomicUsize,
        gate: Notify,
        answer: Result<Option<String>, SyncError>,
    }

    #[async_trait]
    impl EnrichmentSource<String> for GatedSource {
        async fn fetch(&self, _entity_id: &str) -> Result<Option<String>, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            self.answer.clone()
        }
    }

    fn gated(answer: Result<Option<String>, SyncError>) -> Arc<GatedSource> {
        Arc::new(GatedSource {
            calls: AtomicUsize::new(0),
            gate: Notify::new(),
            answer,
        })
    }

    fn listening(cache: &EnrichmentCache<String>, scope: CancellationToken) -> broadcast::Receiver<StoreNotification> {
        let (tx, rx) = broadcast::channel(16);
        cache.listen(tx, scope);
        rx
    }

    async fn wait_resolved(rx: &mut broadcast::Receiver<StoreNotification>, id: &str) {
        loop {
            match rx.recv().await {
                Ok(StoreNotification::EnrichmentResolved(got)) if got == id => return,
                Ok(_) => continue,
                Err(e) => panic!("notifier closed: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_lookups_issue_one_fetch() {
        let source = gated(Ok(Some("Valentina".to_string())));
        let cache = EnrichmentCache::new(source.clone(), CancellationToken::new());
        let mut rx = listening(&cache, CancellationToken::new());

        assert_eq!(cache.ensure("u"), Enrichment::Pending);
        assert_eq!(cache.ensure("u"), Enrichment::Pending);
        tokio::task::yield_now().await;
        source.gate.notify_one();

        wait_resolved(&mut rx, "u").await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.ensure("u"), Enrichment::Resolved("Valentina".to_string()));
    }

    #[tokio::test]
    async fn test_not_found_and_failure_cache_unknown() {
        for answer in [Ok(None), Err(SyncError::NotFound("u".into()))] {
            let source = gated(answer);
            let cache = EnrichmentCache::new(source.clone(), CancellationToken::new());
            let mut rx = listening(&cache, CancellationToken::new());

            cache.ensure("u");
            source.gate.notify_one();
            wait_resolved(&mut rx, "u").await;

            assert_eq!(cache.get("u"), Some(Enrichment::Unknown));
            cache.ensure("u");
            assert_eq!(source.calls.load(Ordering::SeqCst), 1);
            assert_eq!(cache.get("u").map(|e| e.value_or_default()), Some(String::new()));
        }
    }

    #[tokio::test]
    async fn test_every_listening_scope_hears_the_backfill() {
        let source = gated(Ok(Some("Valentina".to_string())));
        let cache = EnrichmentCache::new(source.clone(), CancellationToken::new());
        let closed_scope = CancellationToken::new();
        let mut first = listening(&cache, CancellationToken::new());
        let mut second = listening(&cache, CancellationToken::new());
        let mut closed = listening(&cache, closed_scope.clone());

        cache.ensure("u");
        closed_scope.cancel();
        tokio::task::yield_now().await;
        source.gate.notify_one();

        wait_resolved(&mut first, "u").await;
        wait_resolved(&mut second, "u").await;
        assert!(closed.try_recv().is_err());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_result_discarded_after_teardown() {
        let source = gated(Ok(Some("late".to_string())));
        let cancel = CancellationToken::new();
        let cache = EnrichmentCache::new(source.clone(), cancel.clone());
        let mut rx = listening(&cache, cancel.child_token());

        cache.ensure("u");
        tokio::task::yield_now().await;
        cancel.cancel();
        source.gate.notify_one();

        let outcome = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(outcome.is_err(), "no backfill expected after teardown");
        assert_eq!(cache.get("u"), Some(Enrichment::Pending));
    }
}
