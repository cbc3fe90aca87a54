//! Band: ordered qualitative classification of a rate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered from worst to best. `Ord` follows declaration order, so
/// `Band::Low < Band::High` and comparisons express "moved down/up".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Band {
    BelowFloor,
    Low,
    Mid,
    High,
    Exceptional,
}

impl Band {
    pub const ALL: [Band; 5] = [
        Band::BelowFloor,
        Band::Low,
        Band::Mid,
        Band::High,
        Band::Exceptional,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Band::BelowFloor => "BELOW_FLOOR",
            Band::Low => "LOW",
            Band::Mid => "MID",
            Band::High => "HIGH",
            Band::Exceptional => "EXCEPTIONAL",
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
