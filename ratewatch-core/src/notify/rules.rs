//! Resolved alert rules: the immutable parameter set one subscriber runs with.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bands::{FallbackThresholds, ThresholdError};
use crate::domain::Band;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RulesError {
    #[error("fallback thresholds: {0}")]
    Thresholds(#[from] ThresholdError),

    #[error("window_days must be at least 1")]
    EmptyWindow,

    #[error("digest_hour must be 0..=23, got {0}")]
    DigestHour(u32),

    #[error("payday_business_day must be at least 1")]
    PaydayDay,

    #[error("momentum margins must be finite and non-negative")]
    MomentumMargin,

    #[error("super_threshold must be finite, got {0}")]
    SuperThreshold(f64),
}

/// Momentum (advisory) parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumRules {
    /// Required margin above the rolling average of recent daily closes.
    pub avg_margin: f64,
    /// Required rise above the first observation of the local day.
    pub intraday_margin: f64,
    /// Number of daily closes in the rolling average.
    pub lookback_days: usize,
}

impl Default for MomentumRules {
    fn default() -> Self {
        Self {
            avg_margin: 0.8,
            intraday_margin: 0.8,
            lookback_days: 5,
        }
    }
}

/// Every parameter the banding and notification rules read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertRules {
    pub window_days: u32,
    pub min_points: usize,
    pub fallback: FallbackThresholds,
    /// Bands worth a transition alert. Bands at or below `LOW` only fire
    /// when the move is downward.
    pub alert_bands: Vec<Band>,
    pub momentum: MomentumRules,
    /// One-shot "exceptional opportunity" level; disabled when `None`.
    pub super_threshold: Option<f64>,
    /// Local hour at which the daily digest goes out.
    pub digest_hour: u32,
    /// Payday is the Nth business day of the month.
    pub payday_business_day: u32,
    /// Reminder goes out this many business days before payday.
    pub payday_reminder_lead: u32,
}

impl Default for AlertRules {
    fn default() -> Self {
        Self {
            window_days: 60,
            min_points: 20,
            fallback: FallbackThresholds::default(),
            alert_bands: vec![Band::BelowFloor, Band::Low, Band::High, Band::Exceptional],
            momentum: MomentumRules::default(),
            super_threshold: None,
            digest_hour: 18,
            payday_business_day: 5,
            payday_reminder_lead: 2,
        }
    }
}

impl AlertRules {
    pub fn validate(&self) -> Result<(), RulesError> {
        self.fallback.validate()?;
        if self.window_days == 0 {
            return Err(RulesError::EmptyWindow);
        }
        if self.digest_hour > 23 {
            return Err(RulesError::DigestHour(self.digest_hour));
        }
        if self.payday_business_day == 0 {
            return Err(RulesError::PaydayDay);
        }
        let m = &self.momentum;
        if !(m.avg_margin.is_finite() && m.avg_margin >= 0.0)
            || !(m.intraday_margin.is_finite() && m.intraday_margin >= 0.0)
        {
            return Err(RulesError::MomentumMargin);
        }
        if let Some(t) = self.super_threshold {
            if !t.is_finite() {
                return Err(RulesError::SuperThreshold(t));
            }
        }
        Ok(())
    }

    /// Whether moving from `previous` into `band` deserves a transition alert.
    pub fn is_alert_worthy(&self, band: Band, previous: Band) -> bool {
        if band == previous || !self.alert_bands.contains(&band) {
            return false;
        }
        if band <= Band::Low {
            band < previous
        } else {
            true
        }
    }
}
