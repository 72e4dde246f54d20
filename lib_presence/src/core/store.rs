//! # Entity Snapshot Store
//!
//! A keyed, in-memory cache of the latest known state of each tracked entity
//! within one scope (one screen, one channel). It is single-writer,
//! many-reader: the owning merger or reporter mutates it, and any number of
//! observers read snapshots and listen for notifications.
//!
//! ## Semantics:
//!
//! - **Arrival order wins**: `upsert` applies even when `updated_at` is older
//!   than the current value. The transport is ordered per channel; callers
//!   that need timestamp-based conflict resolution must wrap this store.
//! - **Retired records**: a payload whose live flag is `false` is moved out of
//!   the presentation map but retained, so a later update can reactivate it.
//! - **Notifications**: every mutation is announced on a `broadcast` channel
//!   after the internal guard is released. Observers receive the event on
//!   their own task and cannot re-enter the mutation in progress.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::core::entity::{EntityId, EntityPayload, TrackedEntity};
use crate::core::staleness;

const NOTIFICATION_CAPACITY: usize = 1024;

/// Mutation announced to local observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreNotification {
    /// The entity was inserted or replaced.
    Upserted(EntityId),
    /// The entity was deleted.
    Removed(EntityId),
    /// The entity went offline and left the presentation map.
    Retired(EntityId),
    /// The whole contents were swapped for a fresh snapshot.
    Replaced {
        /// Entities visible after the swap.
        count: usize,
    },
    /// The store was emptied at teardown.
    Cleared,
    /// An enrichment record for this id was backfilled.
    EnrichmentResolved(EntityId),
}

struct StoreInner<P> {
    visible: HashMap<EntityId, TrackedEntity<P>>,
    retired: HashMap<EntityId, TrackedEntity<P>>,
}

/// Keyed cache holding exactly one `TrackedEntity` per id.
pub struct EntitySnapshotStore<P> {
    name: String,
    inner: Mutex<StoreInner<P>>,
    notifier: broadcast::Sender<StoreNotification>,
}

impl<P: EntityPayload> EntitySnapshotStore<P> {
    /// Creates an empty store. `name` only shows up in logs.
    pub fn new(name: impl Into<String>) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            name: name.into(),
            inner: Mutex::new(StoreInner {
                visible: HashMap::new(),
                retired: HashMap::new(),
            }),
            notifier,
        }
    }

    /// Store name, as given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, notification: StoreNotification) {
        // No receivers is fine: nobody is looking at this scope right now.
        let _ = self.notifier.send(notification);
    }

    /// Inserts or replaces the entity, keeping it in the presentation map.
    pub fn upsert(&self, entity_id: &str, payload: P, updated_at: i64) {
        let entity = TrackedEntity::new(entity_id, payload, updated_at);
        {
            let mut inner = self.lock();
            inner.retired.remove(entity_id);
            inner.visible.insert(entity_id.to_string(), entity);
        }
        tracing::trace!(store = %self.name, entity_id, updated_at, "upsert");
        self.notify(StoreNotification::Upserted(entity_id.to_string()));
    }

    /// Moves the entity out of the presentation map, retaining the record.
    pub fn retire(&self, entity_id: &str, payload: P, updated_at: i64) {
        let entity = TrackedEntity::new(entity_id, payload, updated_at);
        {
            let mut inner = self.lock();
            inner.visible.remove(entity_id);
            inner.retired.insert(entity_id.to_string(), entity);
        }
        tracing::trace!(store = %self.name, entity_id, updated_at, "retire");
        self.notify(StoreNotification::Retired(entity_id.to_string()));
    }

    /// `retire` when the payload's live flag is `false`, `upsert` otherwise.
    pub fn apply(&self, entity_id: &str, payload: P, updated_at: i64) {
        if payload.live_flag() == Some(false) {
            self.retire(entity_id, payload, updated_at);
        } else {
            self.upsert(entity_id, payload, updated_at);
        }
    }

    /// Deletes the entity, retained copy included.
    pub fn remove(&self, entity_id: &str) {
        let existed = {
            let mut inner = self.lock();
            let visible = inner.visible.remove(entity_id).is_some();
            let retired = inner.retired.remove(entity_id).is_some();
            visible || retired
        };
        if existed {
            tracing::trace!(store = %self.name, entity_id, "remove");
            self.notify(StoreNotification::Removed(entity_id.to_string()));
        }
    }

    /// Swaps the whole contents for `entities` (authoritative snapshot).
    pub fn replace_all(&self, entities: Vec<TrackedEntity<P>>) {
        let count = {
            let mut inner = self.lock();
            inner.visible.clear();
            inner.retired.clear();
            for entity in entities {
                let target = if entity.is_retired() {
                    &mut inner.retired
                } else {
                    &mut inner.visible
                };
                target.insert(entity.entity_id.clone(), entity);
            }
            inner.visible.len()
        };
        tracing::debug!(store = %self.name, count, "replaced contents with snapshot");
        self.notify(StoreNotification::Replaced { count });
    }

    /// Empties the store. Used at teardown.
    pub fn clear(&self) {
        {
            let mut inner = self.lock();
            inner.visible.clear();
            inner.retired.clear();
        }
        self.notify(StoreNotification::Cleared);
    }

    /// Presentable entity by id (retired records excluded).
    pub fn get(&self, entity_id: &str) -> Option<TrackedEntity<P>> {
        self.lock().visible.get(entity_id).cloned()
    }

    /// Retained record of an entity that went offline.
    pub fn retained(&self, entity_id: &str) -> Option<TrackedEntity<P>> {
        self.lock().retired.get(entity_id).cloned()
    }

    /// Copy of every presentable entity. Later mutations are not reflected.
    pub fn get_all(&self) -> HashMap<EntityId, TrackedEntity<P>> {
        self.lock().visible.clone()
    }

    /// Presentable entities that are live at `now_millis`, oldest id first.
    pub fn live_view(&self, now_millis: i64, window_millis: i64) -> Vec<TrackedEntity<P>> {
        let inner = self.lock();
        let mut live: Vec<TrackedEntity<P>> =
            staleness::live_entities(inner.visible.values(), now_millis, window_millis)
                .cloned()
                .collect();
        live.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        live
    }

    /// Number of presentable entities.
    pub fn len(&self) -> usize {
        self.lock().visible.len()
    }

    /// True when nothing is presentable.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// New receiver for mutation notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreNotification> {
        self.notifier.subscribe()
    }

    /// Sender half, shared with the enrichment cache of the same scope.
    pub fn notifier(&self) -> broadcast::Sender<StoreNotification> {
        self.notifier.clone()
    }
}
