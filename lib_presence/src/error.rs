//! Error taxonomy shared by every component of the sync core.
//!
//! Nothing here is fatal to the process: each variant maps to a degraded view
//! (stale or partial) or to a user-visible notice, never to a crash.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a device sensor (the push or poll producer of an
/// `OutboundReporter`). Each one is surfaced to the caller as its own status.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceError {
    /// The user refused access to the sensor.
    #[error("sensor permission denied")]
    PermissionDenied,

    /// The sensor exists but cannot produce a sample right now.
    #[error("sensor unavailable")]
    SourceUnavailable,

    /// The sensor did not answer within its deadline.
    #[error("sensor timed out")]
    Timeout,

    /// Anything the sensor could not classify.
    #[error("unknown sensor failure")]
    Unknown,
}

/// Errors of the presence and synchronization core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The change-event transport dropped the subscription. Recoverable by
    /// resnapshotting the channel and resuming.
    #[error("transport disconnected: {0}")]
    TransportDisconnected(String),

    /// A device sensor reported a failure.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// A remote write (upsert or delete) was rejected or never acknowledged.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A lookup returned nothing. Cached as permanent "unknown" by enrichment.
    #[error("not found: {0}")]
    NotFound(String),

    /// A row or event payload did not match the expected shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// The owning scope was torn down before the operation finished.
    #[error("scope torn down")]
    TornDown,
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
