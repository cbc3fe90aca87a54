//! RateWatch Core: rate history, percentile banding and notification rules.
//!
//! This crate has no network or clock access of its own:
//! - Domain types (tenors, samples, bands)
//! - Append-only, deduplicating per-tenor history logs
//! - Rolling percentile snapshots and band classification
//! - The per-subscriber notification state machine

pub mod bands;
pub mod domain;
pub mod history;
pub mod notify;
