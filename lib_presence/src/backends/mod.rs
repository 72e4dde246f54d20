//! # Backends
//!
//! Concrete implementations of the collaborator traits in `core::collab`.
//! Only the in-memory backend ships with the crate; it backs the unit tests,
//! the scenario runner and the `server_presence` simulation.

/// In-memory persistence, pub/sub and scripted sensor.
pub mod memory;

pub use memory::{MemoryBackend, ScriptedSensor, WriteRecord};
