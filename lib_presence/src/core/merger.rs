//! # Change Stream Merger
//!
//! Keeps one `EntitySnapshotStore` in step with one logical channel.
//!
//! ## Lifecycle:
//!
//! 1.  **Subscribe** to the channel. Events delivered from now on queue up in
//!     the subscription's receiver.
//! 2.  **Snapshot**: query the channel's rows and replace the entire store
//!     contents with them. No incremental event is applied before this.
//! 3.  **Merge**: apply each queued and subsequent event in arrival order.
//!     Insert/update upsert (or retire, when the payload says offline); delete
//!     removes. Nothing is buffered or reordered by timestamp.
//! 4.  **Disconnect**: on `Disconnected` (or a closed receiver) unsubscribe,
//!     back off, and start again at step 1. Backoff doubles from the base delay
//!     up to the max delay and resets after a successful resync.
//!
//! Teardown cancels the merger's token and empties the store. The run loop
//! stops picking up events immediately, and any enrichment fetch still in
//! flight discards its result.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::core::collab::{ChannelSpec, Persistence, PubSub, Subscription, TransportMessage};
use crate::core::enrichment::{Enrichment, EnrichmentCache};
use crate::core::entity::{ChangeEvent, EntityPayload, Operation, TrackedEntity};
use crate::core::store::{EntitySnapshotStore, StoreNotification};
use crate::error::SyncError;

/// Reconnect pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergerOptions {
    /// First delay after a disconnect.
    pub reconnect_base_delay: Duration,
    /// Upper bound for the doubling delay.
    pub reconnect_max_delay: Duration,
}

impl Default for MergerOptions {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_millis(1_000),
            reconnect_max_delay: Duration::from_millis(60_000),
        }
    }
}

impl MergerOptions {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.reconnect_base_delay
            .saturating_mul(factor)
            .min(self.reconnect_max_delay)
    }
}

/// Observable state of the merger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergerState {
    /// Not started yet, or waiting out a reconnect delay.
    Connecting,
    /// Subscribed, loading the authoritative snapshot.
    Resyncing,
    /// Snapshot applied, merging incremental events.
    Live,
    /// Torn down.
    Stopped,
}

/// An entity together with its enrichment state.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedEntry<P, R> {
    /// The raw tracked entity.
    pub entity: TrackedEntity<P>,
    /// Enrichment for the payload's enrichment key.
    pub enrichment: Enrichment<R>,
}

/// Snapshot + change-stream merger for one channel.
pub struct ChangeStreamMerger<P, R> {
    channel: ChannelSpec,
    store: Arc<EntitySnapshotStore<P>>,
    enrichment: Option<Arc<EnrichmentCache<R>>>,
    persistence: Arc<dyn Persistence>,
    pubsub: Arc<dyn PubSub>,
    options: MergerOptions,
    cancel: CancellationToken,
    state: watch::Sender<MergerState>,
}

impl<P, R> ChangeStreamMerger<P, R>
where
    P: EntityPayload + DeserializeOwned,
    R: Clone + Send + Sync + 'static,
{
    /// Builds a merger for `channel` writing into `store`.
    pub fn new(
        channel: ChannelSpec,
        store: Arc<EntitySnapshotStore<P>>,
        persistence: Arc<dyn Persistence>,
        pubsub: Arc<dyn PubSub>,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(MergerState::Connecting);
        Self {
            channel,
            store,
            enrichment: None,
            persistence,
            pubsub,
            options: MergerOptions::default(),
            cancel,
            state,
        }
    }

    /// Attaches an enrichment cache consulted for every applied payload. The
    /// cache announces backfills on this merger's store until teardown.
    pub fn with_enrichment(mut self, enrichment: Arc<EnrichmentCache<R>>) -> Self {
        enrichment.listen(self.store.notifier(), self.cancel.clone());
        self.enrichment = Some(enrichment);
        self
    }

    /// Overrides the reconnect pacing.
    pub fn with_options(mut self, options: MergerOptions) -> Self {
        self.options = options;
        self
    }

    /// The channel this merger follows.
    pub fn channel(&self) -> &ChannelSpec {
        &self.channel
    }

    /// The store this merger writes into.
    pub fn store(&self) -> &Arc<EntitySnapshotStore<P>> {
        &self.store
    }

    /// Watch on the merger state.
    pub fn state(&self) -> watch::Receiver<MergerState> {
        self.state.subscribe()
    }

    /// Store notifications, enrichment backfills included.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreNotification> {
        self.store.subscribe()
    }

    /// Stops the merger, discards in-flight results and empties the store.
    pub fn teardown(&self) {
        self.cancel.cancel();
        self.store.clear();
    }

    /// Runs the merger on its own task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Main loop: subscribe, resnapshot, merge, repeat on disconnect.
    pub async fn run(&self) {
        tracing::info!(channel = %self.channel, "change stream merger started");
        let mut attempt: u32 = 0;

        while !self.cancel.is_cancelled() {
            self.set_state(MergerState::Resyncing);
            match self.resync().await {
                Ok(mut subscription) => {
                    attempt = 0;
                    self.set_state(MergerState::Live);
                    let pumped = self.pump(&mut subscription).await;
                    self.pubsub.unsubscribe(subscription.id);
                    match pumped {
                        Ok(()) => break,
                        Err(e) => {
                            tracing::warn!(channel = %self.channel, error = %e, "channel disconnected, resnapshotting");
                        }
                    }
                }
                Err(SyncError::TornDown) => break,
                Err(e) => {
                    tracing::warn!(channel = %self.channel, error = %e, "resync failed");
                }
            }

            self.set_state(MergerState::Connecting);
            let delay = self.options.backoff(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.store.clear();
        self.set_state(MergerState::Stopped);
        tracing::info!(channel = %self.channel, "change stream merger stopped");
    }

    fn set_state(&self, state: MergerState) {
        self.state.send_replace(state);
    }

    /// Subscribes first, then replaces the store with a fresh snapshot.
    /// Events arriving meanwhile wait in the subscription until `pump`.
    async fn resync(&self) -> Result<Subscription, SyncError> {
        let subscription = self.pubsub.subscribe(&self.channel).await?;
        let snapshot = match self.load_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.pubsub.unsubscribe(subscription.id);
                return Err(e);
            }
        };
        if self.cancel.is_cancelled() {
            self.pubsub.unsubscribe(subscription.id);
            return Err(SyncError::TornDown);
        }

        for entity in &snapshot {
            self.enrich(&entity.entity_id, &entity.payload);
        }
        tracing::info!(channel = %self.channel, rows = snapshot.len(), "snapshot loaded");
        self.store.replace_all(snapshot);
        Ok(subscription)
    }

    async fn load_snapshot(&self) -> Result<Vec<TrackedEntity<P>>, SyncError> {
        let rows = self
            .persistence
            .query(&self.channel.table, &self.channel.filter)
            .await?;

        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<P>(row.payload) {
                Ok(payload) => entities.push(TrackedEntity::new(row.key, payload, row.updated_at)),
                Err(e) => {
                    tracing::warn!(channel = %self.channel, key = %row.key, error = %e, "skipping undecodable row");
                }
            }
        }
        Ok(entities)
    }

    /// Applies events until cancelled (`Ok`) or the transport drops (`Err`).
    async fn pump(&self, subscription: &mut Subscription) -> Result<(), SyncError> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                message = subscription.next() => match message {
                    Some(TransportMessage::Change(event)) => self.apply_raw(event),
                    Some(TransportMessage::Disconnected { reason }) => {
                        return Err(SyncError::TransportDisconnected(reason));
                    }
                    None => return Err(SyncError::TransportDisconnected("subscription closed".to_string())),
                },
            }
        }
    }

    fn apply_raw(&self, raw: ChangeEvent<Value>) {
        let entity_id = raw.entity_id.clone();
        match raw.decode::<P>() {
            Ok(event) => self.apply_event(event),
            Err(e) => {
                tracing::warn!(channel = %self.channel, %entity_id, error = %e, "skipping undecodable event");
            }
        }
    }

    /// Applies one decoded event. Ignored once the merger is torn down.
    pub fn apply_event(&self, event: ChangeEvent<P>) {
        if self.cancel.is_cancelled() {
            return;
        }
        match event.operation {
            Operation::Delete => self.store.remove(&event.entity_id),
            Operation::Insert | Operation::Update => match event.payload {
                Some(payload) => {
                    self.enrich(&event.entity_id, &payload);
                    self.store.apply(&event.entity_id, payload, event.timestamp);
                }
                None => {
                    tracing::warn!(channel = %self.channel, entity_id = %event.entity_id, "upsert event without payload");
                }
            },
        }
    }

    fn enrich(&self, entity_id: &str, payload: &P) {
        if let (Some(cache), Some(key)) = (&self.enrichment, payload.enrichment_key(entity_id)) {
            cache.ensure(key);
        }
    }

    fn merged(&self, entity: TrackedEntity<P>) -> MergedEntry<P, R> {
        let enrichment = self
            .enrichment
            .as_ref()
            .zip(entity.payload.enrichment_key(&entity.entity_id))
            .and_then(|(cache, key)| cache.get(key))
            .unwrap_or(Enrichment::Pending);
        MergedEntry { entity, enrichment }
    }

    /// Every presentable entity with its enrichment, ordered by update time.
    pub fn view(&self) -> Vec<MergedEntry<P, R>> {
        let mut entities: Vec<TrackedEntity<P>> = self.store.get_all().into_values().collect();
        entities.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        entities.into_iter().map(|e| self.merged(e)).collect()
    }

    /// Entities live at `now_millis` with their enrichment.
    pub fn live_view(&self, now_millis: i64, window_millis: i64) -> Vec<MergedEntry<P, R>> {
        self.store
            .live_view(now_millis, window_millis)
            .into_iter()
            .map(|e| self.merged(e))
            .collect()
    }
}
