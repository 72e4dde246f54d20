//! # In-Memory Backend
//!
//! A single-process stand-in for the remote persistence service and the
//! change-event bus, plus a scriptable device sensor.
//!
//! - **Tables** are ordered maps of `Row`s. Every committed write stamps
//!   `updated_at` (wall clock, or the pinned clock set by `set_clock`).
//! - **Fan-out**: each write is turned into a `ChangeEvent` and pushed to every
//!   subscription whose channel matches, while the table lock is held, so each
//!   subscriber sees changes in commit order. An update that moves a row out
//!   of a filtered channel reaches that channel as a `Delete`.
//! - **Fault injection**: `fail_next_writes` rejects upcoming writes and
//!   `disconnect_all` drops every subscription with a `Disconnected` message.
//! - **Inspection**: the write log, query counters and subscriber count.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::collab::{
    ChannelSpec, DeviceSensor, Filter, Persistence, PubSub, Row, SensorWatch, Subscription,
    TransportMessage,
};
use crate::core::entity::{ChangeEvent, Operation};
use crate::core::now_millis;
use crate::error::{SourceError, SyncError};

/// One accepted write, as recorded in the write log.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    /// Runtime instant of the write (pausable in tests).
    pub at: Instant,
    /// Target table.
    pub table: String,
    /// Row key.
    pub key: String,
    /// Upsert or delete.
    pub operation: Operation,
    /// Written body; `Null` for deletes.
    pub payload: Value,
}

struct Subscriber {
    channel: ChannelSpec,
    sender: mpsc::UnboundedSender<TransportMessage>,
}

#[derive(Default)]
struct BackendInner {
    tables: HashMap<String, BTreeMap<String, Row>>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscription: u64,
    pinned_clock: Option<i64>,
    failing_writes: usize,
    writes: Vec<WriteRecord>,
    query_calls: HashMap<String, usize>,
}

impl BackendInner {
    fn clock(&self) -> i64 {
        self.pinned_clock.unwrap_or_else(now_millis)
    }

    fn check_write(&mut self, table: &str, key: &str) -> Result<(), SyncError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(SyncError::WriteFailed(format!("injected failure on {}/{}", table, key)));
        }
        Ok(())
    }

    /// Delivers `event` to channels matching its payload. Channels that only
    /// matched `previous` see the row leave as a `Delete`.
    fn fan_out(&mut self, table: &str, previous: Option<&Value>, event: ChangeEvent<Value>) {
        let current = event.payload.clone().unwrap_or(Value::Null);
        self.subscribers.retain(|_, sub| {
            let message = if sub.channel.matches(table, &current) {
                event.clone()
            } else if previous.is_some_and(|old| sub.channel.matches(table, old)) {
                ChangeEvent {
                    entity_id: event.entity_id.clone(),
                    operation: Operation::Delete,
                    payload: previous.cloned(),
                    timestamp: event.timestamp,
                }
            } else {
                return true;
            };
            sub.sender.send(TransportMessage::Change(message)).is_ok()
        });
    }
}

/// In-memory `Persistence` + `PubSub`.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<BackendInner>,
}

impl MemoryBackend {
    /// Empty backend using the wall clock.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BackendInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pins the clock used to stamp writes.
    pub fn set_clock(&self, millis: i64) {
        self.lock().pinned_clock = Some(millis);
    }

    /// Makes the next `count` writes fail with `WriteFailed`.
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failing_writes = count;
    }

    /// Puts a row in place without emitting a change event, as if it had been
    /// written while nobody was listening.
    pub fn seed(&self, table: &str, key: &str, payload: Value, updated_at: i64) {
        self.lock().tables.entry(table.to_string()).or_default().insert(
            key.to_string(),
            Row {
                key: key.to_string(),
                payload,
                updated_at,
            },
        );
    }

    /// Removes a row without emitting a change event.
    pub fn seed_remove(&self, table: &str, key: &str) {
        if let Some(rows) = self.lock().tables.get_mut(table) {
            rows.remove(key);
        }
    }

    /// Drops every subscription, telling each one why.
    pub fn disconnect_all(&self, reason: &str) {
        let dropped: Vec<Subscriber> = self.lock().subscribers.drain().map(|(_, s)| s).collect();
        tracing::debug!(count = dropped.len(), reason, "dropping all subscriptions");
        for sub in dropped {
            let _ = sub.sender.send(TransportMessage::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    /// Open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// How many times `table` was queried.
    pub fn query_calls(&self, table: &str) -> usize {
        self.lock().query_calls.get(table).copied().unwrap_or(0)
    }

    /// Accepted writes to `table`, oldest first.
    pub fn writes(&self, table: &str) -> Vec<WriteRecord> {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.table == table)
            .cloned()
            .collect()
    }

    /// Current row at `key`.
    pub fn row(&self, table: &str, key: &str) -> Option<Row> {
        self.lock().tables.get(table).and_then(|rows| rows.get(key)).cloned()
    }
}

#[async_trait]
impl Persistence for MemoryBackend {
    async fn upsert(&self, table: &str, key: &str, payload: Value) -> Result<(), SyncError> {
        let mut inner = self.lock();
        inner.check_write(table, key)?;

        let updated_at = inner.clock();
        let rows = inner.tables.entry(table.to_string()).or_default();
        let previous = rows
            .insert(
                key.to_string(),
                Row {
                    key: key.to_string(),
                    payload: payload.clone(),
                    updated_at,
                },
            )
            .map(|row| row.payload);
        let operation = if previous.is_some() {
            Operation::Update
        } else {
            Operation::Insert
        };
        inner.writes.push(WriteRecord {
            at: Instant::now(),
            table: table.to_string(),
            key: key.to_string(),
            operation,
            payload: payload.clone(),
        });

        let event = ChangeEvent {
            entity_id: key.to_string(),
            operation,
            payload: Some(payload),
            timestamp: updated_at,
        };
        inner.fan_out(table, previous.as_ref(), event);
        Ok(())
    }

    async fn delete(&self, table: &str, key: &str) -> Result<(), SyncError> {
        let mut inner = self.lock();
        inner.check_write(table, key)?;

        let removed = inner
            .tables
            .get_mut(table)
            .and_then(|rows| rows.remove(key));
        let Some(removed) = removed else {
            return Ok(());
        };
        let timestamp = inner.clock();
        inner.writes.push(WriteRecord {
            at: Instant::now(),
            table: table.to_string(),
            key: key.to_string(),
            operation: Operation::Delete,
            payload: Value::Null,
        });

        let event = ChangeEvent {
            entity_id: key.to_string(),
            operation: Operation::Delete,
            payload: Some(removed.payload.clone()),
            timestamp,
        };
        inner.fan_out(table, None, event);
        Ok(())
    }

    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, SyncError> {
        let mut inner = self.lock();
        *inner.query_calls.entry(table.to_string()).or_default() += 1;
        Ok(inner
            .tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| filter.matches(&row.payload))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count(&self, table: &str, filter: &Filter) -> Result<u64, SyncError> {
        let inner = self.lock();
        let count = inner
            .tables
            .get(table)
            .map_or(0, |rows| rows.values().filter(|row| filter.matches(&row.payload)).count());
        Ok(count as u64)
    }
}

#[async_trait]
impl PubSub for MemoryBackend {
    async fn subscribe(&self, channel: &ChannelSpec) -> Result<Subscription, SyncError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.next_subscription += 1;
        let id = inner.next_subscription;
        inner.subscribers.insert(
            id,
            Subscriber {
                channel: channel.clone(),
                sender,
            },
        );
        tracing::debug!(id, %channel, "subscribed");
        Ok(Subscription::new(id, channel.clone(), receiver))
    }

    fn unsubscribe(&self, subscription_id: u64) {
        if self.lock().subscribers.remove(&subscription_id).is_some() {
            tracing::debug!(id = subscription_id, "unsubscribed");
        }
    }
}

struct SensorInner<P> {
    watchers: HashMap<u64, mpsc::UnboundedSender<Result<P, SourceError>>>,
    next_watch: u64,
    current: Result<P, SourceError>,
    cancelled: usize,
}

/// A `DeviceSensor` driven by the caller.
pub struct ScriptedSensor<P> {
    inner: Mutex<SensorInner<P>>,
}

impl<P: Clone + Send + 'static> Default for ScriptedSensor<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Clone + Send + 'static> ScriptedSensor<P> {
    /// Sensor with no watchers whose one-shot read reports `SourceUnavailable`.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SensorInner {
                watchers: HashMap::new(),
                next_watch: 0,
                current: Err(SourceError::SourceUnavailable),
                cancelled: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SensorInner<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers a sample or an error to every active watch.
    pub fn push(&self, sample: Result<P, SourceError>) {
        self.lock()
            .watchers
            .retain(|_, tx| tx.send(sample.clone()).is_ok());
    }

    /// Sets what `current_sample` returns from now on.
    pub fn set_current(&self, sample: Result<P, SourceError>) {
        self.lock().current = sample;
    }

    /// Number of `cancel_watch` calls that hit an active watch.
    pub fn cancelled_watches(&self) -> usize {
        self.lock().cancelled
    }

    /// Active watches.
    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }
}

#[async_trait]
impl<P: Clone + Send + Sync + 'static> DeviceSensor<P> for ScriptedSensor<P> {
    fn watch(&self) -> SensorWatch<P> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.next_watch += 1;
        let id = inner.next_watch;
        inner.watchers.insert(id, tx);
        SensorWatch::new(id, rx)
    }

    fn cancel_watch(&self, watch_id: u64) {
        let mut inner = self.lock();
        if inner.watchers.remove(&watch_id).is_some() {
            inner.cancelled += 1;
        }
    }

    async fn current_sample(&self) -> Result<P, SourceError> {
        self.lock().current.clone()
    }
}
