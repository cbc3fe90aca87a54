//! RateWatch Runner: one scheduled run from fetch to delivery.
//!
//! This crate builds on `ratewatch-core` to provide:
//! - TOML configuration with per-subscriber rule overrides
//! - Rate sources (BYMA open data, JSON fixtures, in-memory)
//! - Atomic persistence of subscriber notification state
//! - The run coordinator and its dashboard payload
//! - Outbound transports behind a single delivery boundary

pub mod config;
pub mod coordinator;
pub mod dashboard;
pub mod source;
pub mod state_store;
pub mod transport;

pub use config::{ConfigError, ResolvedSubscriber, SubscriberConfig, WatchConfig};
pub use coordinator::{
    RunCoordinator, RunError, RunOutcome, RunReport, SubscriberReport, TenorReport, TenorStatus,
};
pub use dashboard::{DashboardPayload, DataQuality, LatestSummary, TenorPanel};
pub use source::{FetchError, Quotes, RateSource, StaticSource};
pub use state_store::{LoadStatus, StateError, StateSnapshot, StateStore};
pub use transport::{
    DeliveryBoundary, DeliveryReport, OutboundMessage, Transport, TransportError,
};
