//! Rate sources: where each run's quotes come from.
//!
//! A source maps every requested tenor to a rate or to "absent". Absent is
//! not an error: a tenor the upstream does not quote this run is simply
//! missing. `Err` is reserved for failures of the whole fetch (network,
//! unreadable response), which the coordinator treats as every tenor absent.

pub mod byma;
pub mod fixture;

pub use byma::BymaSource;
pub use fixture::FixtureSource;

use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use ratewatch_core::domain::{Rate, Tenor};

use crate::config::{SourceConfig, SourceKind};

/// One optional value per requested tenor.
pub type Quotes = BTreeMap<Tenor, Option<Rate>>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source error: {0}")]
    Other(String),
}

/// Trait for rate sources (BYMA, fixture file, in-memory).
pub trait RateSource {
    /// Provenance recorded on every sample from this source.
    fn name(&self) -> &str;

    fn fetch(&self, tenors: &[Tenor]) -> Result<Quotes, FetchError>;
}

/// Build the source named by configuration.
pub fn from_config(config: &SourceConfig) -> Result<Box<dyn RateSource>, FetchError> {
    match config.kind {
        SourceKind::Byma => Ok(Box::new(BymaSource::new(
            &config.url,
            config.timeout_secs,
            config.max_retries,
        )?)),
        SourceKind::Fixture => {
            let path = config.fixture_path.clone().ok_or_else(|| {
                FetchError::Other("fixture source configured without fixture_path".into())
            })?;
            Ok(Box::new(FixtureSource::new(path)))
        }
    }
}

/// In-memory source: fixed quotes, or a failure on every fetch.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    quotes: BTreeMap<Tenor, Rate>,
    failing: bool,
}

impl StaticSource {
    pub fn new(quotes: impl IntoIterator<Item = (Tenor, Rate)>) -> Self {
        Self {
            quotes: quotes.into_iter().collect(),
            failing: false,
        }
    }

    /// A source whose every fetch fails as if the network were down.
    pub fn failing() -> Self {
        Self {
            quotes: BTreeMap::new(),
            failing: true,
        }
    }
}

impl RateSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    fn fetch(&self, tenors: &[Tenor]) -> Result<Quotes, FetchError> {
        if self.failing {
            return Err(FetchError::NetworkUnreachable("static source set to fail".into()));
        }
        Ok(tenors
            .iter()
            .map(|t| (*t, self.quotes.get(t).copied()))
            .collect())
    }
}
