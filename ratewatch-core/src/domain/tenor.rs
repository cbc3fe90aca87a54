//! Tenor: a monitored maturity bucket, identified by its length in days.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::SampleError;

/// A monitored maturity (1-day, 7-day, ...).
///
/// Serialized as its label (`"7D"`) so it can key JSON maps. Deserializes from
/// either the label or a bare day count, which keeps TOML configs terse
/// (`tenors = [1, 7]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "TenorRepr", into = "String")]
pub struct Tenor(u16);

impl Tenor {
    pub fn from_days(days: u16) -> Result<Self, SampleError> {
        if days == 0 {
            return Err(SampleError::ZeroTenor);
        }
        Ok(Self(days))
    }

    pub fn days(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Tenor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}D", self.0)
    }
}

impl FromStr for Tenor {
    type Err = SampleError;

    /// Accepts `"7D"`, `"7d"` and `"7"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_suffix('D')
            .or_else(|| trimmed.strip_suffix('d'))
            .unwrap_or(trimmed);
        let days: u16 = digits
            .parse()
            .map_err(|_| SampleError::BadTenorLabel(s.to_string()))?;
        Self::from_days(days)
    }
}

impl From<Tenor> for String {
    fn from(tenor: Tenor) -> Self {
        tenor.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TenorRepr {
    Days(u16),
    Label(String),
}

impl TryFrom<TenorRepr> for Tenor {
    type Error = SampleError;

    fn try_from(repr: TenorRepr) -> Result<Self, Self::Error> {
        match repr {
            TenorRepr::Days(days) => Tenor::from_days(days),
            TenorRepr::Label(label) => label.parse(),
        }
    }
}
