//! prodsync - real-time synchronization core for shared production
//! workspaces.
//!
//! Many clients concurrently view and edit a shared set of records
//! (equipment, devices, checklist items) scoped to one production
//! workspace. This crate provides:
//! - A versioned entity store with per-record monotonic versions and
//!   soft-delete tombstones
//! - Optimistic concurrency control: stale writers are told about the
//!   winner, never silently merged
//! - Workspace-scoped broadcast of change events over WebSockets
//! - Presence tracking and session lifecycle management
//! - A client-side reconciliation engine that converges under duplicate,
//!   reordered, and missed deliveries

pub mod client;
pub mod occ;
pub mod store;
pub mod sync;
