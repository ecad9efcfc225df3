//! Shared types for the dockate workspace.
//!
//! Keep orchestrator wire formats and the published topology snapshot here so
//! configuration consumers can depend on them without pulling in the agent.

#![warn(missing_docs)]

/// Orchestrator wire DTOs and the reconciled topology snapshot.
pub mod api;
