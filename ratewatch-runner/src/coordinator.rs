//! Run coordinator: one invocation, start to finish.
//!
//! Order within a run is fixed:
//! 1. validate configuration (nothing is written if this fails)
//! 2. load subscriber state
//! 3. fetch quotes
//! 4. append every present quote to history
//! 5. read each tenor's history once, after all appends
//! 6. band and advance every subscriber's state machine
//! 7. build the dashboard payload
//! 8. persist subscriber state atomically
//!
//! Messages are returned, not sent: delivery happens after state is durable,
//! so a crash between the two can only lose a message, never repeat one on
//! the next run. If state cannot be persisted the run fails without messages,
//! and the next run re-derives the same notifications from the unchanged state.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use ratewatch_core::bands::{classify, snapshot_from_records};
use ratewatch_core::domain::{Rate, RateSample, Tenor};
use ratewatch_core::history::{AppendResult, HistoryStore, HistoryWindow};
use ratewatch_core::notify::{
    AlertRules, Notification, NotificationStateMachine, Observation, TenorObservation,
};

use crate::config::{ConfigError, WatchConfig};
use crate::dashboard::{
    distinct_sources, downsample, failed_panel, spread_series, tenor_panel, DashboardPayload,
    DataQuality, SpreadPanel, TenorPanel, DASHBOARD_SCHEMA_VERSION,
};
use crate::source::{Quotes, RateSource};
use crate::state_store::{LoadStatus, StateError, StateStore};
use crate::transport::{DeliveryBoundary, DeliveryReport, OutboundMessage};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("cannot load subscriber state: {0}")]
    StateLoad(#[source] StateError),

    /// The dashboard is still valid and may be published.
    #[error("cannot persist subscriber state: {source}")]
    StatePersistence {
        #[source]
        source: StateError,
        dashboard: Box<DashboardPayload>,
    },
}

/// What happened to one tenor's quote this run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TenorStatus {
    Absent,
    /// The source returned a value no sample can hold (negative, NaN).
    Invalid { reason: String },
    Recorded { append: AppendResult },
    /// Dry run: the quote was banded but not written.
    NotRecorded,
    HistoryFailed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenorReport {
    pub tenor: Tenor,
    pub fetched: Option<Rate>,
    #[serde(flatten)]
    pub status: TenorStatus,
}

impl TenorReport {
    /// The value to band, if the quote is usable this run.
    fn bandable(&self) -> Option<Rate> {
        match self.status {
            TenorStatus::Recorded { .. } | TenorStatus::NotRecorded => self.fetched,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberReport {
    pub id: String,
    pub notifications: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub local_time: DateTime<FixedOffset>,
    pub dry_run: bool,
    pub fetch_error: Option<String>,
    pub state_quarantined: Option<PathBuf>,
    pub tenors: Vec<TenorReport>,
    pub rows_appended: usize,
    pub subscribers: Vec<SubscriberReport>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub notifications: Vec<Notification>,
    /// At most one per subscriber.
    pub messages: Vec<OutboundMessage>,
    pub dashboard: DashboardPayload,
    pub report: RunReport,
}

pub struct RunCoordinator<'a> {
    config: &'a WatchConfig,
    source: &'a dyn RateSource,
    dry_run: bool,
}

impl<'a> RunCoordinator<'a> {
    pub fn new(config: &'a WatchConfig, source: &'a dyn RateSource) -> Self {
        Self {
            config,
            source,
            dry_run: false,
        }
    }

    /// Compute everything but write nothing (no history, no state).
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn run(&self, now: DateTime<Utc>) -> Result<RunOutcome, RunError> {
        let config = self.config;
        config.validate()?;
        let offset = config.clock.offset()?;
        let subscribers = config.resolve_all()?;
        let config_hash = config.config_hash()?;
        let local_now = now.with_timezone(&offset);

        let state_store = StateStore::new(config.storage.state_path());
        let (mut state, load_status) = state_store.load().map_err(RunError::StateLoad)?;
        let state_quarantined = match load_status {
            LoadStatus::Quarantined { moved_to, .. } => Some(moved_to),
            _ => None,
        };
        let history = self.open_history();

        // ── Fetch ────────────────────────────────────────────────────
        let (quotes, fetch_error) = match self.source.fetch(&config.tenors) {
            Ok(quotes) => (quotes, None),
            Err(e) => {
                log::warn!("fetch from {} failed, all tenors absent: {e}", self.source.name());
                let absent: Quotes = config.tenors.iter().map(|t| (*t, None)).collect();
                (absent, Some(e.to_string()))
            }
        };

        // ── Append ───────────────────────────────────────────────────
        let tenor_reports: Vec<TenorReport> = config
            .tenors
            .iter()
            .map(|&tenor| {
                let fetched = quotes.get(&tenor).copied().flatten();
                let status = self.record(&history, tenor, fetched, local_now);
                TenorReport {
                    tenor,
                    fetched,
                    status,
                }
            })
            .collect();
        let rows_appended = tenor_reports
            .iter()
            .filter(|r| matches!(&r.status, TenorStatus::Recorded { append } if append.accepted))
            .count();

        // Every later step sees the same, post-append history.
        let windows: BTreeMap<Tenor, Result<HistoryWindow, String>> = config
            .tenors
            .iter()
            .map(|&tenor| {
                let window = match &history {
                    Ok(store) => store.records(tenor).map_err(|e| {
                        log::error!("{tenor}: cannot read history: {e}");
                        e.to_string()
                    }),
                    Err(e) => Err(e.clone()),
                };
                (tenor, window)
            })
            .collect();

        // ── Subscribers ──────────────────────────────────────────────
        let mut notifications = Vec::new();
        let mut messages = Vec::new();
        let mut subscriber_reports = Vec::new();
        for sub in &subscribers {
            let observations: Vec<TenorObservation> = sub
                .tenors
                .iter()
                .filter_map(|t| tenor_reports.iter().find(|r| r.tenor == *t))
                .map(|report| observe(report, windows.get(&report.tenor), &sub.rules, local_now))
                .collect();

            let machine = NotificationStateMachine::new(&sub.id, &sub.rules, sub.premium);
            let book = state.book_mut(&sub.id);
            let notes = machine.advance(book, &observations, local_now);

            if let Some(message) = OutboundMessage::merge(&sub.id, &notes, now) {
                messages.push(message);
            }
            subscriber_reports.push(SubscriberReport {
                id: sub.id.clone(),
                notifications: notes.len(),
            });
            notifications.extend(notes);
        }

        // ── Dashboard ────────────────────────────────────────────────
        let dashboard = self.dashboard(
            &tenor_reports,
            &windows,
            fetch_error.is_some(),
            rows_appended,
            config_hash,
            now,
            local_now,
        );

        let report = RunReport {
            started_at: now,
            local_time: local_now,
            dry_run: self.dry_run,
            fetch_error,
            state_quarantined,
            tenors: tenor_reports,
            rows_appended,
            subscribers: subscriber_reports,
        };

        // ── Persist ──────────────────────────────────────────────────
        if !self.dry_run {
            if let Err(source) = state_store.save(&mut state, now) {
                log::error!("state persistence failed, no messages will be sent: {source}");
                return Err(RunError::StatePersistence {
                    source,
                    dashboard: Box::new(dashboard),
                });
            }
        }

        log::info!(
            "run complete: {} rows appended, {} notifications, {} messages, quality {:?}",
            rows_appended,
            notifications.len(),
            messages.len(),
            dashboard.quality
        );

        Ok(RunOutcome {
            notifications,
            messages,
            dashboard,
            report,
        })
    }

    /// [`run`](Self::run), then hand the messages to `boundary`.
    ///
    /// Dry runs deliver nothing.
    pub fn run_and_deliver(
        &self,
        now: DateTime<Utc>,
        boundary: &DeliveryBoundary,
    ) -> Result<(RunOutcome, DeliveryReport), RunError> {
        let outcome = self.run(now)?;
        let delivery = if self.dry_run {
            DeliveryReport::default()
        } else {
            boundary.deliver(&outcome.messages)
        };
        Ok((outcome, delivery))
    }

    /// The history store, or why it cannot be used this run. Dry runs never
    /// create the directory.
    fn open_history(&self) -> Result<HistoryStore, String> {
        let storage = &self.config.storage;
        if self.dry_run {
            return Ok(HistoryStore::open_read_only(
                storage.history_dir(),
                storage.dedup_window(),
            ));
        }
        HistoryStore::open(storage.history_dir(), storage.dedup_window()).map_err(|e| {
            log::error!("history store unavailable, no tenor will be banded: {e}");
            e.to_string()
        })
    }

    fn record(
        &self,
        history: &Result<HistoryStore, String>,
        tenor: Tenor,
        fetched: Option<Rate>,
        local_now: DateTime<FixedOffset>,
    ) -> TenorStatus {
        let Some(value) = fetched else {
            log::info!("{tenor}: no quote this run");
            return TenorStatus::Absent;
        };
        let sample = match RateSample::new(tenor, value, local_now, self.source.name()) {
            Ok(sample) => sample,
            Err(e) => {
                log::warn!("{tenor}: discarding quote {value}: {e}");
                return TenorStatus::Invalid {
                    reason: e.to_string(),
                };
            }
        };
        if self.dry_run {
            return TenorStatus::NotRecorded;
        }
        let store = match history {
            Ok(store) => store,
            Err(error) => {
                return TenorStatus::HistoryFailed {
                    error: error.clone(),
                }
            }
        };
        match store.append(&sample) {
            Ok(append) => {
                log::info!("{tenor}: {value} {:?}", append.reason);
                TenorStatus::Recorded { append }
            }
            Err(e) => {
                log::error!("{tenor}: history append failed: {e}");
                TenorStatus::HistoryFailed {
                    error: e.to_string(),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dashboard(
        &self,
        reports: &[TenorReport],
        windows: &BTreeMap<Tenor, Result<HistoryWindow, String>>,
        fetch_failed: bool,
        rows_appended: usize,
        config_hash: String,
        now: DateTime<Utc>,
        local_now: DateTime<FixedOffset>,
    ) -> DashboardPayload {
        let config = self.config;
        let rules = &config.rules;
        let lookback = Duration::days(i64::from(config.dashboard.series_lookback_days));

        // Series are anchored on the newest record, so a stale source still
        // shows its last stretch of data.
        let newest = windows
            .values()
            .filter_map(|w| w.as_ref().ok())
            .filter_map(|w| w.latest().map(|r| r.observed_at))
            .max()
            .unwrap_or(local_now);
        let cutoff = newest - lookback;

        let panels: Vec<TenorPanel> = reports
            .iter()
            .map(|report| match windows.get(&report.tenor) {
                Some(Ok(window)) => tenor_panel(
                    report.tenor,
                    report.fetched,
                    window.records(),
                    snapshot_from_records(
                        report.tenor,
                        window.records(),
                        local_now,
                        rules.window_days,
                        rules.min_points,
                    ),
                    &rules.fallback,
                    cutoff,
                    &config.dashboard,
                ),
                Some(Err(e)) => failed_panel(report.tenor, report.fetched, e.clone()),
                None => failed_panel(report.tenor, report.fetched, "not read".to_string()),
            })
            .collect();

        let spread = spread_panel(&config.tenors, windows, &panels, cutoff, config.dashboard.max_points);

        let degraded = reports
            .iter()
            .any(|r| !matches!(r.status, TenorStatus::Recorded { .. } | TenorStatus::NotRecorded))
            || panels.iter().any(|p| p.error.is_some());
        let quality = if fetch_failed {
            DataQuality::Error
        } else if degraded {
            DataQuality::Partial
        } else {
            DataQuality::Ok
        };

        DashboardPayload {
            schema_version: DASHBOARD_SCHEMA_VERSION,
            generated_at: now,
            source: self.source.name().to_string(),
            quality,
            config_hash,
            rows_appended,
            sources: distinct_sources(&panels),
            tenors: panels,
            spread,
        }
    }
}

/// Build the observation one subscriber's machine sees for one tenor.
fn observe(
    report: &TenorReport,
    window: Option<&Result<HistoryWindow, String>>,
    rules: &AlertRules,
    local_now: DateTime<FixedOffset>,
) -> TenorObservation {
    let tenor = report.tenor;
    let unbanded = |value| TenorObservation {
        tenor,
        observation: Observation::Unbanded { value },
    };

    if let TenorStatus::HistoryFailed { .. } = report.status {
        return match report.fetched {
            Some(value) => unbanded(value),
            None => TenorObservation::absent(tenor),
        };
    }
    let Some(value) = report.bandable() else {
        return TenorObservation::absent(tenor);
    };
    let Some(Ok(window)) = window else {
        return unbanded(value);
    };

    let snapshot = snapshot_from_records(
        tenor,
        window.records(),
        local_now,
        rules.window_days,
        rules.min_points,
    );
    let band = classify(value, &snapshot, &rules.fallback);
    let today: NaiveDate = local_now.date_naive();
    let closes = window
        .daily_closes(*local_now.offset(), today, rules.momentum.lookback_days)
        .into_iter()
        .map(|(_, v)| v)
        .collect();
    TenorObservation::present(tenor, value, band, closes)
}

fn spread_panel(
    tenors: &[Tenor],
    windows: &BTreeMap<Tenor, Result<HistoryWindow, String>>,
    panels: &[TenorPanel],
    cutoff: DateTime<FixedOffset>,
    max_points: usize,
) -> Option<SpreadPanel> {
    let short = *tenors.iter().min()?;
    let long = *tenors.iter().max()?;
    if short == long {
        return None;
    }
    let (Some(Ok(short_w)), Some(Ok(long_w))) = (windows.get(&short), windows.get(&long)) else {
        return None;
    };

    let latest_of = |tenor: Tenor| {
        panels
            .iter()
            .find(|p| p.tenor == tenor)
            .and_then(|p| p.latest_value)
    };
    let latest = match (latest_of(short), latest_of(long)) {
        (Some(s), Some(l)) => Some(l - s),
        _ => None,
    };

    let series: Vec<_> = spread_series(short_w.records(), long_w.records())
        .into_iter()
        .filter(|p| p.t >= cutoff)
        .collect();

    Some(SpreadPanel {
        long,
        short,
        latest,
        series: downsample(&series, max_points),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriberConfig;
    use crate::source::StaticSource;
    use ratewatch_core::domain::Band;
    use ratewatch_core::notify::NotificationKind;
    use tempfile::TempDir;

    fn tenor(days: u16) -> Tenor {
        Tenor::from_days(days).unwrap()
    }

    fn config(tmp: &TempDir) -> WatchConfig {
        let mut cfg = WatchConfig::default();
        cfg.storage.data_dir = tmp.path().to_path_buf();
        cfg.subscribers.push(SubscriberConfig {
            id: "ana".into(),
            premium: false,
            tenors: None,
            overrides: Default::default(),
        });
        cfg
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn invalid_quote_counts_as_absent() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let source = StaticSource::new([(tenor(1), -1.0), (tenor(7), 39.0)]);
        let outcome = RunCoordinator::new(&cfg, &source)
            .run(utc("2026-01-21T14:00:00Z"))
            .unwrap();

        assert!(matches!(
            outcome.report.tenors[0].status,
            TenorStatus::Invalid { .. }
        ));
        assert!(outcome
            .notifications
            .iter()
            .any(|n| n.kind == NotificationKind::DataUnavailable && n.tenor == Some(tenor(1))));
        assert_eq!(outcome.dashboard.quality, DataQuality::Partial);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let source = StaticSource::new([(tenor(1), 39.0), (tenor(7), 39.5)]);
        let outcome = RunCoordinator::new(&cfg, &source)
            .dry_run(true)
            .run(utc("2026-01-21T14:00:00Z"))
            .unwrap();

        assert_eq!(outcome.report.rows_appended, 0);
        assert_eq!(outcome.messages.len(), 1);
        assert!(!cfg.storage.state_path().exists());
        assert!(!cfg.storage.history_dir().exists());
    }

    #[test]
    fn spread_is_long_minus_short() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let source = StaticSource::new([(tenor(1), 36.0), (tenor(7), 38.5)]);
        let outcome = RunCoordinator::new(&cfg, &source)
            .run(utc("2026-01-21T14:00:00Z"))
            .unwrap();

        let spread = outcome.dashboard.spread.unwrap();
        assert_eq!((spread.short, spread.long), (tenor(1), tenor(7)));
        assert_eq!(spread.latest, Some(2.5));
        assert_eq!(outcome.dashboard.tenors[1].latest_band, Some(Band::High));
        assert_eq!(outcome.dashboard.sources, vec!["static".to_string()]);
    }
}
