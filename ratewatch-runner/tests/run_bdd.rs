//! BDD tests for full runs: fetch, record, band, notify, persist, deliver.
//!
//! Every scenario runs the coordinator against a temporary data directory
//! and an in-memory source, at fixed instants:
//! - First-run alerts fire once and are not repeated
//! - Failure streaks produce one notice
//! - The digest goes out once per local day
//! - Configuration errors write nothing
//! - Transport failures never fail the run
//! - History failures leave tenors unbanded without stopping the run
//! - A state save failure sends nothing and keeps the dashboard

use std::cell::RefCell;
use std::fs;

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use tempfile::TempDir;

use ratewatch_core::domain::{Band, Tenor};
use ratewatch_core::notify::NotificationKind;
use ratewatch_runner::config::SubscriberConfig;
use ratewatch_runner::dashboard::downsample;
use ratewatch_runner::{
    DataQuality, DeliveryBoundary, OutboundMessage, RunCoordinator, RunError, StateStore,
    StaticSource, TenorStatus, Transport, TransportError, WatchConfig,
};

// ─── Shared helpers ──────────────────────────────────────────────────

fn tenor(days: u16) -> Tenor {
    Tenor::from_days(days).unwrap()
}

fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn subscriber(id: &str, premium: bool) -> SubscriberConfig {
    SubscriberConfig {
        id: id.to_string(),
        premium,
        tenors: None,
        overrides: Default::default(),
    }
}

fn config_in(tmp: &TempDir) -> WatchConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut cfg = WatchConfig::default();
    cfg.storage.data_dir = tmp.path().to_path_buf();
    cfg.subscribers.push(subscriber("ana", false));
    cfg
}

fn quotes(one: f64, seven: f64) -> StaticSource {
    StaticSource::new([(tenor(1), one), (tenor(7), seven)])
}

fn transitions(kinds: &[NotificationKind]) -> usize {
    kinds
        .iter()
        .filter(|k| matches!(k, NotificationKind::BandTransition { .. }))
        .count()
}

struct RecordingTransport {
    fail: bool,
    sent: RefCell<Vec<OutboundMessage>>,
}

impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::Http("503 from gateway".into()));
        }
        self.sent.borrow_mut().push(message.clone());
        Ok(())
    }
}

// ─── Scenarios ───────────────────────────────────────────────────────

#[test]
fn bdd_scenario_first_run_high_fires_once() {
    // GIVEN an empty data directory and one subscriber watching 1D and 7D
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);

    // WHEN the first run sees 1D at 39.0 (fallback HIGH) and 7D at 37.0 (MID)
    let source = quotes(39.0, 37.0);
    let first = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T14:00:00Z"))
        .unwrap();

    // THEN both samples are recorded and exactly one HIGH transition fires
    assert_eq!(first.report.rows_appended, 2);
    assert_eq!(first.messages.len(), 1);
    let message = &first.messages[0];
    assert_eq!(message.subscriber_id, "ana");
    assert_eq!(
        message.kinds,
        vec![NotificationKind::BandTransition {
            from: None,
            to: Band::High
        }]
    );
    assert!(message.text.contains("1D"));

    // WHEN the next run, 5 minutes later, sees 39.2 on the HIGH plateau
    let source = quotes(39.2, 37.0);
    let second = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T14:05:00Z"))
        .unwrap();

    // THEN the new 1D value is recorded, the unchanged 7D value is deduplicated
    assert_eq!(second.report.rows_appended, 1);
    assert!(matches!(
        &second.report.tenors[1].status,
        TenorStatus::Recorded { append } if !append.accepted
    ));
    // AND nothing is sent
    assert!(second.messages.is_empty());
    assert!(second.notifications.is_empty());
}

#[test]
fn bdd_scenario_state_survives_between_runs() {
    // GIVEN a completed first run
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    let source = quotes(39.0, 37.0);
    RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T14:00:00Z"))
        .unwrap();

    // WHEN the state file is loaded back
    let (snapshot, _) = StateStore::new(cfg.storage.state_path()).load().unwrap();

    // THEN it holds the bands the subscriber was last told about
    let book = &snapshot.subscribers["ana"];
    assert_eq!(book.tenors[&tenor(1)].last_band, Some(Band::High));
    assert_eq!(book.tenors[&tenor(7)].last_band, Some(Band::Mid));
    assert_eq!(snapshot.updated_at, Some(utc("2026-01-21T14:00:00Z")));
}

#[test]
fn bdd_scenario_failure_streak_notifies_once() {
    // GIVEN a subscriber and a source that fails every fetch
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    let source = StaticSource::failing();

    // WHEN two consecutive runs fail
    let first = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T14:00:00Z"))
        .unwrap();
    let second = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T14:20:00Z"))
        .unwrap();

    // THEN the first run reports both tenors unavailable in one message
    assert_eq!(first.dashboard.quality, DataQuality::Error);
    assert!(first.report.fetch_error.is_some());
    assert_eq!(first.messages.len(), 1);
    assert_eq!(
        first.messages[0]
            .kinds
            .iter()
            .filter(|k| **k == NotificationKind::DataUnavailable)
            .count(),
        2
    );
    // AND the second run stays silent
    assert!(second.messages.is_empty());

    // WHEN the source recovers
    let source = quotes(37.0, 37.0);
    let third = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T14:40:00Z"))
        .unwrap();

    // THEN quality is ok again and a MID first observation is silent
    assert_eq!(third.dashboard.quality, DataQuality::Ok);
    assert!(third.messages.is_empty());
}

#[test]
fn bdd_scenario_digest_goes_out_once_per_local_day() {
    // GIVEN a subscriber with the default 18:00 digest (UTC-3)
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    let source = quotes(37.0, 36.0);

    // WHEN two runs land inside the 18:00 local hour
    let first = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T21:00:00Z"))
        .unwrap();
    let second = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T21:30:00Z"))
        .unwrap();

    // THEN only the first sends a digest
    assert!(first.messages[0]
        .kinds
        .contains(&NotificationKind::DailyDigest));
    assert!(first.messages[0].text.contains("Daily summary 2026-01-21"));
    assert!(second.messages.is_empty());

    // AND the next local day gets its own digest
    let next_day = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-22T21:00:00Z"))
        .unwrap();
    assert!(next_day.messages[0]
        .kinds
        .contains(&NotificationKind::DailyDigest));
}

#[test]
fn bdd_scenario_invalid_configuration_writes_nothing() {
    // GIVEN a configuration where a subscriber watches an unmonitored tenor
    let tmp = TempDir::new().unwrap();
    let mut cfg = config_in(&tmp);
    cfg.subscribers[0].tenors = Some(vec![tenor(30)]);

    // WHEN a run is attempted
    let source = quotes(39.0, 37.0);
    let err = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T14:00:00Z"))
        .unwrap_err();

    // THEN it fails as a configuration error
    assert!(matches!(err, RunError::Configuration(_)));
    // AND neither history nor state was touched
    assert!(!cfg.storage.state_path().exists());
    assert!(!cfg.storage.history_dir().exists());
}

#[test]
fn bdd_scenario_newer_state_schema_refuses_to_run() {
    // GIVEN a state file written by a newer version
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    let state_path = cfg.storage.state_path();
    fs::write(&state_path, r#"{"schema_version": 42, "subscribers": {}}"#).unwrap();

    // WHEN a run is attempted
    let source = quotes(39.0, 37.0);
    let err = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T14:00:00Z"))
        .unwrap_err();

    // THEN the run fails before recording anything and the file is untouched
    assert!(matches!(err, RunError::StateLoad(_)));
    assert!(!cfg.storage.history_dir().join("1D.csv").exists());
    assert!(fs::read_to_string(&state_path).unwrap().contains("42"));
}

#[test]
fn bdd_scenario_corrupt_state_is_quarantined_and_run_continues() {
    // GIVEN a truncated state file
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    fs::write(cfg.storage.state_path(), "{\"subscribers\":").unwrap();

    // WHEN a run happens
    let source = quotes(39.0, 37.0);
    let outcome = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T14:00:00Z"))
        .unwrap();

    // THEN the bad file was moved aside and a fresh state written
    assert!(outcome.report.state_quarantined.is_some());
    let (_, status) = StateStore::new(cfg.storage.state_path()).load().unwrap();
    assert_eq!(status, ratewatch_runner::LoadStatus::Loaded);
    // AND the subscriber is treated as new
    assert_eq!(transitions(&outcome.messages[0].kinds), 1);
}

#[test]
fn bdd_scenario_transport_failure_does_not_fail_the_run() {
    // GIVEN two subscribers and a transport that rejects everything
    let tmp = TempDir::new().unwrap();
    let mut cfg = config_in(&tmp);
    cfg.subscribers.push(subscriber("beto", true));
    let boundary = DeliveryBoundary::new(Box::new(RecordingTransport {
        fail: true,
        sent: RefCell::new(Vec::new()),
    }));

    // WHEN a run produces alerts for both
    let source = quotes(39.0, 37.0);
    let (outcome, delivery) = RunCoordinator::new(&cfg, &source)
        .run_and_deliver(utc("2026-01-21T14:00:00Z"), &boundary)
        .unwrap();

    // THEN every send failed but the run succeeded and state was saved
    assert_eq!(outcome.messages.len(), 2);
    assert_eq!(delivery.attempted, 2);
    assert_eq!(delivery.delivered, 0);
    assert_eq!(delivery.failed.len(), 2);
    assert!(cfg.storage.state_path().exists());

    // AND the failed alert is not repeated on the next run
    let again = RunCoordinator::new(&cfg, &source)
        .run_and_deliver(utc("2026-01-21T14:20:00Z"), &boundary)
        .unwrap();
    assert!(again.0.messages.is_empty());
}

#[test]
fn bdd_scenario_one_message_per_subscriber() {
    // GIVEN a subscriber with an exceptional threshold
    let tmp = TempDir::new().unwrap();
    let mut cfg = config_in(&tmp);
    cfg.subscribers[0].overrides.super_threshold = Some(40.0);
    let transport = RecordingTransport {
        fail: false,
        sent: RefCell::new(Vec::new()),
    };
    let boundary = DeliveryBoundary::new(Box::new(transport));

    // WHEN one run triggers a transition on both tenors and the exceptional alert
    let source = quotes(41.0, 40.5);
    let (outcome, delivery) = RunCoordinator::new(&cfg, &source)
        .run_and_deliver(utc("2026-01-21T14:00:00Z"), &boundary)
        .unwrap();

    // THEN everything is merged into a single delivered message
    assert_eq!(outcome.notifications.len(), 3);
    assert_eq!(outcome.messages.len(), 1);
    assert_eq!(delivery.delivered, 1);
    let kinds = &outcome.messages[0].kinds;
    assert_eq!(transitions(kinds), 2);
    assert!(kinds.contains(&NotificationKind::ExceptionalOpportunity));
}

#[test]
fn bdd_scenario_dashboard_publishes_both_files() {
    // GIVEN a completed run
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    let source = quotes(36.0, 38.5);
    let outcome = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T14:00:00Z"))
        .unwrap();

    // WHEN the dashboard is published
    outcome
        .dashboard
        .publish(&cfg.storage.dashboard_path(), &cfg.storage.latest_path())
        .unwrap();

    // THEN both files parse and agree on the latest values
    let dashboard: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(cfg.storage.dashboard_path()).unwrap()).unwrap();
    let latest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(cfg.storage.latest_path()).unwrap()).unwrap();
    assert_eq!(dashboard["quality"], "ok");
    assert_eq!(dashboard["rows_appended"], 2);
    assert_eq!(latest["tenors"].as_array().unwrap().len(), 2);
    assert_eq!(latest["spread"], 2.5);
}

#[test]
fn bdd_scenario_tenor_missing_upstream_is_partial() {
    // GIVEN a source that quotes 1D only
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    let source = StaticSource::new([(tenor(1), 37.0)]);

    // WHEN a run happens
    let outcome = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T14:00:00Z"))
        .unwrap();

    // THEN 7D is absent, quality is partial and the subscriber hears about 7D only
    assert_eq!(outcome.report.tenors[1].status, TenorStatus::Absent);
    assert_eq!(outcome.dashboard.quality, DataQuality::Partial);
    assert_eq!(outcome.notifications.len(), 1);
    assert_eq!(outcome.notifications[0].tenor, Some(tenor(7)));
    assert_eq!(outcome.notifications[0].kind, NotificationKind::DataUnavailable);
}

#[test]
fn bdd_scenario_unwritable_tenor_log_leaves_that_tenor_unbanded() {
    // GIVEN a 1D log path that cannot be written (a directory sits there)
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    fs::create_dir_all(cfg.storage.history_dir().join("1D.csv")).unwrap();

    // WHEN a run sees both tenors at a fallback-HIGH level
    let source = quotes(39.0, 39.0);
    let outcome = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T14:00:00Z"))
        .unwrap();

    // THEN 1D failed to record and 7D was recorded
    assert!(matches!(
        outcome.report.tenors[0].status,
        TenorStatus::HistoryFailed { .. }
    ));
    assert!(matches!(
        outcome.report.tenors[1].status,
        TenorStatus::Recorded { .. }
    ));
    assert_eq!(outcome.report.rows_appended, 1);
    // AND only the 7D transition fires
    assert_eq!(outcome.notifications.len(), 1);
    assert_eq!(outcome.notifications[0].tenor, Some(tenor(7)));
    assert_eq!(transitions(&outcome.messages[0].kinds), 1);
    // AND the dashboard flags 1D and degrades to partial
    assert!(outcome.dashboard.tenors[0].error.is_some());
    assert!(outcome.dashboard.tenors[1].error.is_none());
    assert_eq!(outcome.dashboard.quality, DataQuality::Partial);
    // AND the subscriber's 1D state was never touched
    let (snapshot, _) = StateStore::new(cfg.storage.state_path()).load().unwrap();
    let book = &snapshot.subscribers["ana"];
    assert!(!book.tenors.contains_key(&tenor(1)));
    assert_eq!(book.tenors[&tenor(7)].last_band, Some(Band::High));
}

#[test]
fn bdd_scenario_unopenable_history_still_runs_the_digest() {
    // GIVEN a regular file where the history directory should be
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    fs::write(cfg.storage.history_dir(), "not a directory").unwrap();

    // WHEN a run lands in the 18:00 local digest hour
    let source = quotes(39.0, 37.0);
    let outcome = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T21:05:00Z"))
        .unwrap();

    // THEN every tenor reports the history failure and none is banded
    assert!(outcome
        .report
        .tenors
        .iter()
        .all(|r| matches!(r.status, TenorStatus::HistoryFailed { .. })));
    assert_eq!(outcome.report.rows_appended, 0);
    assert_eq!(outcome.dashboard.quality, DataQuality::Partial);
    // AND the digest still goes out with the unbanded values
    let message = &outcome.messages[0];
    assert!(message.kinds.contains(&NotificationKind::DailyDigest));
    assert_eq!(transitions(&message.kinds), 0);
    assert!(message.text.contains("1D 39.00%, 7D 37.00%"));

    // AND the digest marker was saved, so a later run the same hour is quiet
    assert!(cfg.storage.state_path().exists());
    let later = RunCoordinator::new(&cfg, &source)
        .run(utc("2026-01-21T21:35:00Z"))
        .unwrap();
    assert!(later.messages.is_empty());
}

#[test]
fn bdd_scenario_state_save_failure_sends_nothing_and_keeps_the_dashboard() {
    // GIVEN a directory squatting on the state file's temporary path
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    let mut tmp_name = cfg.storage.state_path().into_os_string();
    tmp_name.push(".tmp");
    let blocker = std::path::PathBuf::from(tmp_name);
    fs::create_dir_all(&blocker).unwrap();
    let boundary = DeliveryBoundary::new(Box::new(RecordingTransport {
        fail: false,
        sent: RefCell::new(Vec::new()),
    }));

    // WHEN a run produces a HIGH alert
    let source = quotes(39.0, 37.0);
    let err = RunCoordinator::new(&cfg, &source)
        .run_and_deliver(utc("2026-01-21T14:00:00Z"), &boundary)
        .unwrap_err();

    // THEN the run fails as a persistence error carrying the dashboard
    let dashboard = match err {
        RunError::StatePersistence { dashboard, .. } => dashboard,
        other => panic!("expected a state persistence error, got {other:?}"),
    };
    assert_eq!(dashboard.rows_appended, 2);
    assert_eq!(dashboard.tenors[0].latest_band, Some(Band::High));
    // AND no state file was written
    assert!(!cfg.storage.state_path().exists());

    // WHEN the obstruction is cleared and the next run sees the same quotes
    fs::remove_dir(&blocker).unwrap();
    let (retry, delivery) = RunCoordinator::new(&cfg, &source)
        .run_and_deliver(utc("2026-01-21T14:05:00Z"), &boundary)
        .unwrap();

    // THEN the alert that was never sent is derived again and delivered
    assert_eq!(transitions(&retry.messages[0].kinds), 1);
    assert_eq!(delivery.delivered, 1);
}

// ─── Properties ──────────────────────────────────────────────────────

proptest! {
    #[test]
    fn downsample_strides_from_the_first_point(
        len in 0usize..5_000,
        max in 1usize..500,
    ) {
        let items: Vec<usize> = (0..len).collect();
        let out = downsample(&items, max);
        if len <= max {
            prop_assert_eq!(&out, &items);
        } else {
            let step = len / max;
            prop_assert_eq!(out.len(), len.div_ceil(step));
            prop_assert!(out.len() < 2 * max);
        }
        prop_assert_eq!(out.first(), items.first());
        prop_assert!(out.windows(2).all(|w| w[0] < w[1]));
    }
}
