//! # External Collaborators
//!
//! The sync core never talks to a concrete backend. It talks to these traits:
//!
//! - **`Persistence`**: row-level upsert/delete/query/count over named tables.
//! - **`PubSub`**: per-channel, ordered, at-least-once change notifications.
//! - **`DeviceSensor`**: a continuous sample watch plus a one-shot read used by
//!   the fallback poll.
//!
//! Subscriptions and sensor watches are channel receivers, the same way the
//! dispatcher hands each client an `UnboundedReceiver`: dropping the receiver
//! or calling the matching `unsubscribe`/`cancel_watch` ends the stream.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::entity::ChangeEvent;
use crate::error::{SourceError, SyncError};

/// Equality filter over top-level payload fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Field name -> required value. Empty means "every row".
    pub equals: BTreeMap<String, Value>,
}

impl Filter {
    /// A filter matching every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Adds a `field == value` condition.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.insert(field.into(), value.into());
        self
    }

    /// True if every condition holds on the payload.
    pub fn matches(&self, payload: &Value) -> bool {
        self.equals
            .iter()
            .all(|(field, expected)| payload.get(field) == Some(expected))
    }
}

/// A logical subscription scope: one table, optionally narrowed by a filter
/// ("all location changes", "messages in conversation X").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Backing table.
    pub table: String,
    /// Row filter applied to snapshots and events.
    pub filter: Filter,
}

impl ChannelSpec {
    /// Every change on `table`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Filter::all(),
        }
    }

    /// Narrows the channel with a filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// True if a change on `table` with `payload` belongs to this channel.
    pub fn matches(&self, table: &str, payload: &Value) -> bool {
        self.table == table && self.filter.matches(payload)
    }
}

impl fmt::Display for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filter.equals.is_empty() {
            return write!(f, "{}", self.table);
        }
        let conditions: Vec<String> = self
            .filter
            .equals
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}[{}]", self.table, conditions.join(","))
    }
}

/// One stored row as returned by `Persistence::query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Primary key.
    pub key: String,
    /// Row body.
    pub payload: Value,
    /// Unix milliseconds of the last write.
    pub updated_at: i64,
}

/// Row-oriented persistence service. No transactions are required.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Inserts or replaces the row at `key`.
    async fn upsert(&self, table: &str, key: &str, payload: Value) -> Result<(), SyncError>;
    /// Deletes the row at `key`. Deleting a missing row is not an error.
    async fn delete(&self, table: &str, key: &str) -> Result<(), SyncError>;
    /// Returns every row matching `filter`.
    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, SyncError>;
    /// Counts the rows matching `filter`.
    async fn count(&self, table: &str, filter: &Filter) -> Result<u64, SyncError>;
}

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    /// A committed change, in channel order.
    Change(ChangeEvent<Value>),
    /// The transport lost the channel; no further changes will follow.
    Disconnected {
        /// Human-readable cause, for logs.
        reason: String,
    },
}

/// Live handle on one channel subscription.
#[derive(Debug)]
pub struct Subscription {
    /// Id used to `unsubscribe`.
    pub id: u64,
    /// The channel this subscription covers.
    pub channel: ChannelSpec,
    receiver: mpsc::UnboundedReceiver<TransportMessage>,
}

impl Subscription {
    /// Wraps the receiving half handed out by a transport.
    pub fn new(
        id: u64,
        channel: ChannelSpec,
        receiver: mpsc::UnboundedReceiver<TransportMessage>,
    ) -> Self {
        Self {
            id,
            channel,
            receiver,
        }
    }

    /// Next message, or `None` once the transport dropped its sender.
    pub async fn next(&mut self) -> Option<TransportMessage> {
        self.receiver.recv().await
    }
}

/// Change-event bus.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Opens a subscription on `channel`.
    async fn subscribe(&self, channel: &ChannelSpec) -> Result<Subscription, SyncError>;
    /// Stops delivery for `subscription_id`. Takes effect immediately.
    fn unsubscribe(&self, subscription_id: u64);
}

/// Live handle on a sensor watch. Samples and errors arrive in order.
#[derive(Debug)]
pub struct SensorWatch<P> {
    /// Id used to `cancel_watch`.
    pub id: u64,
    receiver: mpsc::UnboundedReceiver<Result<P, SourceError>>,
}

impl<P> SensorWatch<P> {
    /// Wraps the receiving half handed out by a sensor.
    pub fn new(id: u64, receiver: mpsc::UnboundedReceiver<Result<P, SourceError>>) -> Self {
        Self { id, receiver }
    }

    /// Next sample or error, `None` when the sensor stopped the watch.
    pub async fn next(&mut self) -> Option<Result<P, SourceError>> {
        self.receiver.recv().await
    }
}

/// A device sensor (geolocation) producing samples of type `P`.
#[async_trait]
pub trait DeviceSensor<P>: Send + Sync {
    /// Starts a continuous watch.
    fn watch(&self) -> SensorWatch<P>;
    /// Stops the watch with the given id.
    fn cancel_watch(&self, watch_id: u64);
    /// One-shot read, used by the fallback poll.
    async fn current_sample(&self) -> Result<P, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_all_conditions() {
        let filter = Filter::all().eq("conversation_id", "c1").eq("is_read", false);
        assert!(filter.matches(&json!({ "conversation_id": "c1", "is_read": false, "x": 1 })));
        assert!(!filter.matches(&json!({ "conversation_id": "c2", "is_read": false })));
        assert!(!filter.matches(&json!({ "conversation_id": "c1" })));
        assert!(Filter::all().matches(&json!({})));
    }

    #[test]
    fn test_channel_spec_display_and_matching() {
        let channel = ChannelSpec::table("messages").with_filter(Filter::all().eq("conversation_id", "c1"));
        assert_eq!(channel.to_string(), "messages[conversation_id=\"c1\"]");
        assert!(channel.matches("messages", &json!({ "conversation_id": "c1" })));
        assert!(!channel.matches("typing_status", &json!({ "conversation_id": "c1" })));
        assert_eq!(ChannelSpec::table("rider_locations").to_string(), "rider_locations");
    }
}
