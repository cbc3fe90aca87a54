//! Persisted per-subscriber state.
//!
//! Every field has a default so state written by older versions (missing
//! fields) loads cleanly; unknown fields are ignored by serde.

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{Band, Rate, Tenor};

/// State of one (subscriber, tenor) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberState {
    /// `None` until the first successful observation.
    pub last_band: Option<Band>,
    pub band_entered_at: Option<DateTime<FixedOffset>>,
    pub last_digest_date: Option<NaiveDate>,
    pub intraday_open_value: Option<Rate>,
    pub intraday_open_date: Option<NaiveDate>,
    /// Set while the source keeps failing for this tenor.
    pub last_error_flag: bool,
    pub premium_flag: bool,
    /// Cleared only by an explicit reset.
    pub super_alert_sent: bool,
    pub last_advisory_date: Option<NaiveDate>,
}

/// "Already notified for date X" markers of the payday rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaydayMarkers {
    /// Payday date whose reminder was sent.
    pub reminder_sent_for: Option<NaiveDate>,
    /// Payday date whose notification was sent.
    pub payday_sent_for: Option<NaiveDate>,
}

/// Everything persisted for one subscriber.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberBook {
    pub tenors: BTreeMap<Tenor, SubscriberState>,
    pub payday: PaydayMarkers,
    /// Subscriber-level copy of the digest marker; holds even with no tenor records.
    pub last_digest_date: Option<NaiveDate>,
}

impl SubscriberBook {
    pub fn tenor_mut(&mut self, tenor: Tenor) -> &mut SubscriberState {
        self.tenors.entry(tenor).or_default()
    }

    pub fn digest_sent_on(&self, date: NaiveDate) -> bool {
        self.last_digest_date == Some(date)
            || self
                .tenors
                .values()
                .any(|s| s.last_digest_date == Some(date))
    }

    pub fn stamp_digest(&mut self, date: NaiveDate) {
        self.last_digest_date = Some(date);
        for state in self.tenors.values_mut() {
            state.last_digest_date = Some(date);
        }
    }

    pub fn super_alert_sent(&self) -> bool {
        self.tenors.values().any(|s| s.super_alert_sent)
    }

    pub fn stamp_super_alert(&mut self) {
        for state in self.tenors.values_mut() {
            state.super_alert_sent = true;
        }
    }

    /// Re-arm the one-shot exceptional alert. Returns whether anything changed.
    pub fn reset_super_alert(&mut self) -> bool {
        let mut changed = false;
        for state in self.tenors.values_mut() {
            changed |= state.super_alert_sent;
            state.super_alert_sent = false;
        }
        changed
    }
}
