use serde::{Deserialize, Serialize};

use crate::domain::{Band, Rate, Tenor};

/// Which rule produced a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationKind {
    BandTransition { from: Option<Band>, to: Band },
    MomentumAdvisory,
    ExceptionalOpportunity,
    DailyDigest,
    PaydayReminder,
    Payday,
    DataUnavailable,
}

/// One decision of the state machine, before it is merged into a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub subscriber_id: String,
    /// `None` for subscriber-wide rules (digest, payday).
    pub tenor: Option<Tenor>,
    pub kind: NotificationKind,
    pub value: Option<Rate>,
    pub text: String,
}
