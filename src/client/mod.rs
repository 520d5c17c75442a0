//! Client-side reconciliation engine.
//!
//! Runs on each connected client: maintains a local mirror of one
//! workspace's entities, applies or discards incoming change events by
//! identity and version, tracks optimistic local writes explicitly, and
//! performs wholesale resync after reconnection. Nothing here touches
//! server state; it is an independent consumer of the wire protocol.

pub mod mirror;
pub mod pending;

pub use mirror::{Applied, MirrorDiff, WorkspaceMirror};
pub use pending::{PendingState, PendingTracker};
