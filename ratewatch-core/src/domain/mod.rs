//! Domain types for RateWatch

pub mod band;
pub mod sample;
pub mod tenor;

pub use band::Band;
pub use sample::{HistoryRecord, Rate, RateSample, SourceId};
pub use tenor::Tenor;

use thiserror::Error;

/// Rejections raised while constructing domain values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleError {
    #[error("rate must be finite, got {0}")]
    NonFinite(f64),

    #[error("rate must be non-negative, got {0}")]
    Negative(f64),

    #[error("tenor must be at least one day")]
    ZeroTenor,

    #[error("unrecognized tenor label '{0}'")]
    BadTenorLabel(String),
}
