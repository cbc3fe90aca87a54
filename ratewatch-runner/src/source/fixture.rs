//! File-backed source for offline runs and tests.
//!
//! The file is a JSON object of tenor label to rate, e.g.
//! `{"1D": 38.5, "7D": null}`. A missing or `null` entry is an absent quote.
//! The file is re-read on every fetch so it can be edited between runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use ratewatch_core::domain::{Rate, Tenor};

use super::{FetchError, Quotes, RateSource};

pub struct FixtureSource {
    path: PathBuf,
}

impl FixtureSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RateSource for FixtureSource {
    fn name(&self) -> &str {
        "fixture"
    }

    fn fetch(&self, tenors: &[Tenor]) -> Result<Quotes, FetchError> {
        let content = fs::read_to_string(&self.path).map_err(|source| FetchError::Io {
            path: self.path.clone(),
            source,
        })?;
        let quotes: BTreeMap<Tenor, Option<Rate>> = serde_json::from_str(&content)
            .map_err(|e| FetchError::ResponseFormatChanged(format!("{}: {e}", self.path.display())))?;
        Ok(tenors
            .iter()
            .map(|t| (*t, quotes.get(t).copied().flatten()))
            .collect())
    }
}
