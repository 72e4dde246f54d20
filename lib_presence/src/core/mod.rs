//! # Core Sync Module
//!
//! This module forms the heart of the presence and synchronization engine. It
//! aggregates the components that keep a local, authoritative view of shared
//! state in step with the remote backend.
//!
//! ## Core Components:
//!
//! - **`store`**: The `EntitySnapshotStore`, a keyed cache holding exactly one
//!   `TrackedEntity` per id and notifying local observers on every mutation.
//!
//! - **`staleness`**: The pure liveness rule. An entity is live only while its
//!   explicit flag is set and its last update is inside the staleness window.
//!
//! - **`enrichment`**: A session-scoped memo of slower-changing attributes
//!   (display name, avatar, level) that is filled lazily and never blocks the
//!   display of the entity it decorates.
//!
//! - **`merger`**: The `ChangeStreamMerger`. It owns one channel subscription,
//!   loads the authoritative snapshot, and overlays insert/update/delete events
//!   in arrival order, resnapshotting after every disconnect.
//!
//! - **`reporter`**: The `OutboundReporter`. It publishes the local actor's own
//!   state from a push producer and a fallback poll through one coalescing,
//!   rate-limited publisher.
//!
//! - **`optimistic`**: The `OptimisticMutationCoordinator` state machine for
//!   toggle-style actions with rollback and supersede semantics.
//!
//! - **`session`**: The `SyncSession` scope object that owns collaborators and
//!   a root cancellation token, and builds every store, merger and reporter.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Traits for the external persistence, pub/sub and sensor collaborators.
pub mod collab;
/// Entity, payload and change-event types.
pub mod entity;
/// Lazily filled, memoized enrichment records.
pub mod enrichment;
/// Snapshot + change-stream merging for one channel.
pub mod merger;
/// Optimistic toggle state machine.
pub mod optimistic;
/// Coalescing, rate-limited publisher for the local actor's state.
pub mod reporter;
/// Scope object owning collaborators and teardown.
pub mod session;
/// Pure liveness evaluation.
pub mod staleness;
/// Keyed in-memory cache of tracked entities.
pub mod store;

// --- Public API Re-exports ---
pub use collab::{
    ChannelSpec, DeviceSensor, Filter, Persistence, PubSub, Row, SensorWatch, Subscription,
    TransportMessage,
};
pub use enrichment::{Enrichment, EnrichmentCache, EnrichmentSource};
pub use entity::{ChangeEvent, EntityId, EntityPayload, Operation, TrackedEntity};
pub use merger::{ChangeStreamMerger, MergedEntry, MergerOptions, MergerState};
pub use optimistic::{MutationNotice, MutationOutcome, MutationPhase, OptimisticMutationCoordinator};
pub use reporter::{OutboundReporter, ReporterOptions, ReporterStatus};
pub use session::SyncSession;
pub use staleness::is_live;
pub use store::{EntitySnapshotStore, StoreNotification};

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
