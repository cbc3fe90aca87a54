//! RateSample: the immutable unit of observation.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use super::{SampleError, Tenor};

/// Annualized rate, in percent (e.g. `38.5` means 38.5% TNA).
pub type Rate = f64;

/// Where a sample came from (`"BYMA"`, `"fixture"`, ...).
pub type SourceId = String;

/// One observation of a tenor's rate.
///
/// Constructed only through [`RateSample::new`], which rejects non-finite and
/// negative values. Fields are private so a sample cannot be mutated after
/// validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateSample {
    tenor: Tenor,
    value: Rate,
    observed_at: DateTime<FixedOffset>,
    provenance: SourceId,
}

impl RateSample {
    pub fn new(
        tenor: Tenor,
        value: Rate,
        observed_at: DateTime<FixedOffset>,
        provenance: impl Into<SourceId>,
    ) -> Result<Self, SampleError> {
        validate_rate(value)?;
        Ok(Self {
            tenor,
            value,
            observed_at,
            provenance: provenance.into(),
        })
    }

    pub fn tenor(&self) -> Tenor {
        self.tenor
    }

    pub fn value(&self) -> Rate {
        self.value
    }

    pub fn observed_at(&self) -> DateTime<FixedOffset> {
        self.observed_at
    }

    pub fn provenance(&self) -> &str {
        &self.provenance
    }
}

/// A sample that the history log has durably accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub tenor: Tenor,
    pub value: Rate,
    pub observed_at: DateTime<FixedOffset>,
    pub source: SourceId,
}

impl From<&RateSample> for HistoryRecord {
    fn from(sample: &RateSample) -> Self {
        Self {
            tenor: sample.tenor,
            value: sample.value,
            observed_at: sample.observed_at,
            source: sample.provenance.clone(),
        }
    }
}

pub(crate) fn validate_rate(value: Rate) -> Result<(), SampleError> {
    if !value.is_finite() {
        return Err(SampleError::NonFinite(value));
    }
    if value < 0.0 {
        return Err(SampleError::Negative(value));
    }
    Ok(())
}
