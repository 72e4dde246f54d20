//! # lib_presence
//!
//! Realtime presence and synchronization core for the riders feed. The crate
//! keeps an authoritative, in-memory view of shared mutable state (rider
//! locations, typing indicators, conversation messages), overlays an ordered
//! change stream on top of it, decides which remote riders are still live,
//! and throttles the local rider's own updates before publishing them.
//!
//! The persistence service, the change-event bus and the device sensors are
//! external collaborators expressed as traits in [`core::collab`]. The
//! [`backends`] folder ships in-memory implementations used by the tests and
//! by the `server_presence` simulation.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod backends;
pub mod configs;
pub mod core;
pub mod domain;
pub mod error;
#[cfg(feature = "loggers")]
pub mod loggers;

pub use crate::core::{
    ChangeStreamMerger, EntitySnapshotStore, OptimisticMutationCoordinator, OutboundReporter,
    SyncSession,
};
pub use configs::PresenceConfig;
pub use error::{SourceError, SyncError};
