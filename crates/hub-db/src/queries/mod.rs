//! Hand-written query modules, one per table family.
//!
//! Queries use `sqlx::query_as`/`query` rather than the compile-time
//! `query!`/`query_as!` macros so this crate builds without a live database.

pub mod agents;
pub mod approvals;
pub mod events;
pub mod federation;
pub mod idempotency;
pub mod node_runs;
pub mod projects;
pub mod workflow_runs;
pub mod workflows;
