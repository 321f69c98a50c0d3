//! Event Service: persist-then-publish, historical query, live subscription.

pub mod republisher;
pub mod service;

pub use service::{pattern_to_like, EventService};
