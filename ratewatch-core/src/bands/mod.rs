//! Percentile banding: rolling p40/p60/p75 thresholds and classification.
//!
//! Snapshots are recomputed from the history log on every run and never
//! persisted. With fewer than `min_points` samples in the window the snapshot
//! carries no percentiles (`insufficient history`) and classification falls
//! back to static thresholds, still producing a [`Band`].

pub mod quantile;

use chrono::{DateTime, Duration, FixedOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Band, HistoryRecord, Rate, Tenor};
use crate::history::{HistoryError, HistoryStore};
use quantile::{quantile_sorted, sorted_copy};

/// The three breakpoints, always ordered `p40 <= p60 <= p75`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p40: f64,
    pub p60: f64,
    pub p75: f64,
}

impl Percentiles {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let sorted = sorted_copy(values);
        Some(Self {
            p40: quantile_sorted(&sorted, 0.40)?,
            p60: quantile_sorted(&sorted, 0.60)?,
            p75: quantile_sorted(&sorted, 0.75)?,
        })
    }
}

/// Percentile state of one tenor over a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileSnapshot {
    pub tenor: Tenor,
    pub window_start: DateTime<FixedOffset>,
    pub window_end: DateTime<FixedOffset>,
    pub sample_count: usize,
    /// `None` when `sample_count < min_points`.
    pub percentiles: Option<Percentiles>,
}

impl PercentileSnapshot {
    pub fn insufficient_history(&self) -> bool {
        self.percentiles.is_none()
    }

    pub fn p40(&self) -> Option<f64> {
        self.percentiles.map(|p| p.p40)
    }

    pub fn p60(&self) -> Option<f64> {
        self.percentiles.map(|p| p.p60)
    }

    pub fn p75(&self) -> Option<f64> {
        self.percentiles.map(|p| p.p75)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThresholdError {
    #[error("threshold '{name}' must be finite, got {value}")]
    NonFinite { name: &'static str, value: f64 },

    #[error("thresholds out of order: {lower} ({lower_value}) > {upper} ({upper_value})")]
    OutOfOrder {
        lower: &'static str,
        lower_value: f64,
        upper: &'static str,
        upper_value: f64,
    },
}

/// Static breakpoints used when history is too thin for percentiles.
///
/// `floor` applies in both modes: anything strictly below it is
/// [`Band::BelowFloor`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackThresholds {
    pub floor: Option<f64>,
    pub mid_from: f64,
    pub high_from: f64,
    pub exceptional_from: Option<f64>,
}

impl Default for FallbackThresholds {
    fn default() -> Self {
        Self {
            floor: None,
            mid_from: 35.5,
            high_from: 38.0,
            exceptional_from: None,
        }
    }
}

impl FallbackThresholds {
    /// Check that every breakpoint is finite and `floor <= mid <= high <= exceptional`.
    pub fn validate(&self) -> Result<(), ThresholdError> {
        let mut chain: Vec<(&'static str, f64)> = Vec::with_capacity(4);
        if let Some(floor) = self.floor {
            chain.push(("floor", floor));
        }
        chain.push(("mid_from", self.mid_from));
        chain.push(("high_from", self.high_from));
        if let Some(exceptional) = self.exceptional_from {
            chain.push(("exceptional_from", exceptional));
        }

        for &(name, value) in &chain {
            if !value.is_finite() {
                return Err(ThresholdError::NonFinite { name, value });
            }
        }
        for pair in chain.windows(2) {
            let (lower, lower_value) = pair[0];
            let (upper, upper_value) = pair[1];
            if lower_value > upper_value {
                return Err(ThresholdError::OutOfOrder {
                    lower,
                    lower_value,
                    upper,
                    upper_value,
                });
            }
        }
        Ok(())
    }
}

/// Classify `value` against a snapshot, or against `fallback` when the
/// snapshot has no percentiles.
///
/// Breakpoints are inclusive: a value equal to a breakpoint lands in the
/// higher band.
pub fn classify(value: Rate, snapshot: &PercentileSnapshot, fallback: &FallbackThresholds) -> Band {
    if let Some(floor) = fallback.floor {
        if value < floor {
            return Band::BelowFloor;
        }
    }

    match snapshot.percentiles {
        Some(p) => {
            if value >= p.p75 {
                Band::Exceptional
            } else if value >= p.p60 {
                Band::High
            } else if value >= p.p40 {
                Band::Mid
            } else {
                Band::Low
            }
        }
        None => {
            if fallback.exceptional_from.is_some_and(|t| value >= t) {
                Band::Exceptional
            } else if value >= fallback.high_from {
                Band::High
            } else if value >= fallback.mid_from {
                Band::Mid
            } else {
                Band::Low
            }
        }
    }
}

/// Build a snapshot from records already in memory.
///
/// Only records with `observed_at` in `[as_of - window_days, as_of]` count.
pub fn snapshot_from_records<'a, I>(
    tenor: Tenor,
    records: I,
    as_of: DateTime<FixedOffset>,
    window_days: u32,
    min_points: usize,
) -> PercentileSnapshot
where
    I: IntoIterator<Item = &'a HistoryRecord>,
{
    let window_start = as_of - Duration::days(i64::from(window_days));
    let values: Vec<f64> = records
        .into_iter()
        .filter(|r| r.tenor == tenor && r.observed_at >= window_start && r.observed_at <= as_of)
        .map(|r| r.value)
        .collect();

    let percentiles = if values.len() >= min_points.max(1) {
        Percentiles::from_values(&values)
    } else {
        None
    };

    PercentileSnapshot {
        tenor,
        window_start,
        window_end: as_of,
        sample_count: values.len(),
        percentiles,
    }
}

/// Computes percentile snapshots straight from the history log.
pub struct PercentileBander<'a> {
    store: &'a HistoryStore,
}

impl<'a> PercentileBander<'a> {
    pub fn new(store: &'a HistoryStore) -> Self {
        Self { store }
    }

    pub fn snapshot(
        &self,
        tenor: Tenor,
        as_of: DateTime<FixedOffset>,
        window_days: u32,
        min_points: usize,
    ) -> Result<PercentileSnapshot, HistoryError> {
        let since = as_of - Duration::days(i64::from(window_days));
        let window = self.store.window(tenor, since)?;
        Ok(snapshot_from_records(
            tenor,
            window.records(),
            as_of,
            window_days,
            min_points,
        ))
    }
}
