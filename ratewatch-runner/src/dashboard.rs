//! Dashboard payload: a read-only projection of one run for an external
//! renderer.
//!
//! Nothing here decides anything. Panels are built from history windows and
//! snapshots the coordinator already computed; the same payload is written
//! to `dashboard.json`, and a compact summary to `latest.json`.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

use ratewatch_core::bands::{classify, FallbackThresholds, PercentileSnapshot};
use ratewatch_core::domain::{Band, HistoryRecord, Rate, Tenor};

use crate::config::DashboardConfig;
use crate::state_store::write_atomic;

/// Schema version of `dashboard.json`.
pub const DASHBOARD_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataQuality {
    /// Every monitored tenor was fetched and recorded.
    Ok,
    /// Some tenors were absent or could not be recorded.
    Partial,
    /// The fetch failed as a whole.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub t: DateTime<FixedOffset>,
    pub v: Rate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
}

impl From<&HistoryRecord> for SeriesPoint {
    fn from(r: &HistoryRecord) -> Self {
        Self {
            t: r.observed_at,
            v: r.value,
            src: Some(r.source.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandChange {
    pub t: DateTime<FixedOffset>,
    pub from: Band,
    pub to: Band,
    pub v: Rate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenorPanel {
    pub tenor: Tenor,
    /// This run's quote, if the source returned one.
    pub fetched: Option<Rate>,
    pub latest_value: Option<Rate>,
    pub latest_at: Option<DateTime<FixedOffset>>,
    pub latest_band: Option<Band>,
    /// Global (base rules) snapshot. `None` when history could not be read.
    pub snapshot: Option<PercentileSnapshot>,
    pub series: Vec<SeriesPoint>,
    pub band_changes: Vec<BandChange>,
    /// History read/write problem for this tenor this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Longest minus shortest monitored tenor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpreadPanel {
    pub long: Tenor,
    pub short: Tenor,
    pub latest: Option<Rate>,
    pub series: Vec<SeriesPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardPayload {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub source: String,
    pub quality: DataQuality,
    pub config_hash: String,
    pub rows_appended: usize,
    pub tenors: Vec<TenorPanel>,
    pub spread: Option<SpreadPanel>,
    /// Distinct sources seen in the plotted series.
    pub sources: Vec<String>,
}

/// Compact form written to `latest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestSummary {
    pub generated_at: DateTime<Utc>,
    pub quality: DataQuality,
    pub tenors: Vec<LatestTenor>,
    pub spread: Option<Rate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestTenor {
    pub tenor: Tenor,
    pub value: Option<Rate>,
    pub band: Option<Band>,
    pub at: Option<DateTime<FixedOffset>>,
}

impl DashboardPayload {
    pub fn latest(&self) -> LatestSummary {
        LatestSummary {
            generated_at: self.generated_at,
            quality: self.quality,
            tenors: self
                .tenors
                .iter()
                .map(|p| LatestTenor {
                    tenor: p.tenor,
                    value: p.latest_value,
                    band: p.latest_band,
                    at: p.latest_at,
                })
                .collect(),
            spread: self.spread.as_ref().and_then(|s| s.latest),
        }
    }

    /// Atomically write `dashboard.json` and `latest.json`.
    pub fn publish(&self, dashboard_path: &Path, latest_path: &Path) -> io::Result<()> {
        let full = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(dashboard_path, &full)?;
        let latest = serde_json::to_vec_pretty(&self.latest())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(latest_path, &latest)
    }
}

/// Build one tenor's panel from its full history.
///
/// `records` must be sorted oldest first; only those at or after `cutoff`
/// are plotted.
pub fn tenor_panel(
    tenor: Tenor,
    fetched: Option<Rate>,
    records: &[HistoryRecord],
    snapshot: PercentileSnapshot,
    fallback: &FallbackThresholds,
    cutoff: DateTime<FixedOffset>,
    config: &DashboardConfig,
) -> TenorPanel {
    let latest = records.last();
    let plotted: Vec<SeriesPoint> = records
        .iter()
        .filter(|r| r.observed_at >= cutoff)
        .map(SeriesPoint::from)
        .collect();
    let series = downsample(&plotted, config.max_points);
    let band_changes = band_changes(&series, &snapshot, fallback, config.max_events);

    TenorPanel {
        tenor,
        fetched,
        latest_value: latest.map(|r| r.value),
        latest_at: latest.map(|r| r.observed_at),
        latest_band: latest.map(|r| classify(r.value, &snapshot, fallback)),
        snapshot: Some(snapshot),
        series,
        band_changes,
        error: None,
    }
}

/// Panel for a tenor whose history could not be read this run.
pub fn failed_panel(tenor: Tenor, fetched: Option<Rate>, error: String) -> TenorPanel {
    TenorPanel {
        tenor,
        fetched,
        latest_value: None,
        latest_at: None,
        latest_band: None,
        snapshot: None,
        series: Vec::new(),
        band_changes: Vec::new(),
        error: Some(error),
    }
}

/// Keep every `len / max_points`-th item once there are more than `max_points`.
pub fn downsample<T: Clone>(items: &[T], max_points: usize) -> Vec<T> {
    if items.len() <= max_points || max_points == 0 {
        return items.to_vec();
    }
    let step = (items.len() / max_points).max(1);
    items.iter().step_by(step).cloned().collect()
}

/// `long - short` at every timestamp where both tenors have a known value,
/// carrying the last known value of each forward.
pub fn spread_series(short: &[HistoryRecord], long: &[HistoryRecord]) -> Vec<SeriesPoint> {
    let mut merged: Vec<(&HistoryRecord, bool)> = short
        .iter()
        .map(|r| (r, false))
        .chain(long.iter().map(|r| (r, true)))
        .collect();
    merged.sort_by_key(|(r, _)| r.observed_at);

    let mut last_short = None;
    let mut last_long = None;
    let mut out = Vec::new();
    for (record, is_long) in merged {
        if is_long {
            last_long = Some(record.value);
        } else {
            last_short = Some(record.value);
        }
        if let (Some(s), Some(l)) = (last_short, last_long) {
            out.push(SeriesPoint {
                t: record.observed_at,
                v: l - s,
                src: None,
            });
        }
    }
    out
}

/// Replay `series` against the current snapshot. The first point seeds the
/// band; every later change is an event. Keeps the last `max_events`.
pub fn band_changes(
    series: &[SeriesPoint],
    snapshot: &PercentileSnapshot,
    fallback: &FallbackThresholds,
    max_events: usize,
) -> Vec<BandChange> {
    let mut events = Vec::new();
    let mut previous: Option<Band> = None;
    for point in series {
        let band = classify(point.v, snapshot, fallback);
        match previous {
            Some(prev) if prev != band => events.push(BandChange {
                t: point.t,
                from: prev,
                to: band,
                v: point.v,
            }),
            _ => {}
        }
        previous = Some(band);
    }
    let skip = events.len().saturating_sub(max_events);
    events.split_off(skip)
}

/// Distinct non-empty sources across the plotted series, sorted.
pub fn distinct_sources(panels: &[TenorPanel]) -> Vec<String> {
    let mut sources: Vec<String> = panels
        .iter()
        .flat_map(|p| p.series.iter())
        .filter_map(|p| p.src.clone())
        .filter(|s| !s.is_empty())
        .collect();
    sources.sort();
    sources.dedup();
    sources
}
