//! Notification rules and the state they persist between runs.

pub mod calendar;
pub mod machine;
pub mod notification;
pub mod rules;
pub mod state;

pub use machine::{NotificationStateMachine, Observation, TenorObservation};
pub use notification::{Notification, NotificationKind};
pub use rules::{AlertRules, MomentumRules, RulesError};
pub use state::{PaydayMarkers, SubscriberBook, SubscriberState};
