//! Watcher configuration: one TOML file, resolved once per run.
//!
//! Every section has defaults, so the smallest valid file is a single
//! `[[subscribers]]` entry. Per-subscriber overrides are applied field by
//! field on top of `[rules]` by [`WatchConfig::resolve`]; business logic only
//! ever sees the resulting [`AlertRules`].

use chrono::{Duration, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use ratewatch_core::bands::FallbackThresholds;
use ratewatch_core::domain::{Band, Tenor};
use ratewatch_core::notify::{AlertRules, MomentumRules, RulesError};

/// Upper bound on `[source].max_retries`; backoff doubles per attempt.
pub const MAX_FETCH_RETRIES: u32 = 6;

pub const DEFAULT_BYMA_URL: &str =
    "https://open.bymadata.com.ar/vanoms-be-core/rest/api/bymadata/free/cauciones";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("no subscribers configured")]
    NoSubscribers,

    #[error("subscriber id must not be empty")]
    EmptySubscriberId,

    #[error("duplicate subscriber id '{0}'")]
    DuplicateSubscriber(String),

    #[error("no tenors monitored")]
    NoTenors,

    #[error("tenor {0} listed twice")]
    DuplicateTenor(Tenor),

    #[error("subscriber '{0}' follows no tenors")]
    NoSubscriberTenors(String),

    #[error("subscriber '{subscriber}' follows {tenor}, which is not monitored")]
    UnmonitoredTenor { subscriber: String, tenor: Tenor },

    #[error("rules for {scope}: {source}")]
    Rules {
        scope: String,
        #[source]
        source: RulesError,
    },

    #[error("dedup_window_minutes must be non-negative, got {0}")]
    DedupWindow(i64),

    #[error("utc_offset_minutes out of range: {0}")]
    UtcOffset(i32),

    #[error("max_retries {0} exceeds the limit of {max}", max = MAX_FETCH_RETRIES)]
    MaxRetries(u32),

    #[error("source kind 'fixture' needs fixture_path")]
    MissingFixturePath,

    #[error("transport kind 'webhook' needs url")]
    MissingWebhookUrl,

    #[error("dashboard max_points must be at least 1")]
    DashboardPoints,
}

// ── Sections ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Byma,
    Fixture,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// JSON file of `{tenor: rate|null}` read by the fixture source.
    pub fixture_path: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Byma,
            url: DEFAULT_BYMA_URL.to_string(),
            timeout_secs: 15,
            max_retries: 2,
            fixture_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub dedup_window_minutes: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            dedup_window_minutes: ratewatch_core::history::DEFAULT_DEDUP_WINDOW_MINUTES,
        }
    }
}

impl StorageConfig {
    pub fn history_dir(&self) -> PathBuf {
        self.data_dir.join("history")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn dashboard_path(&self) -> PathBuf {
        self.data_dir.join("dashboard.json")
    }

    pub fn latest_path(&self) -> PathBuf {
        self.data_dir.join("latest.json")
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.data_dir.join("outbox.jsonl")
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::minutes(self.dedup_window_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Offset of the subscribers' local calendar. Buenos Aires is -180.
    pub utc_offset_minutes: i32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: -180,
        }
    }
}

impl ClockConfig {
    pub fn offset(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .ok_or(ConfigError::UtcOffset(self.utc_offset_minutes))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub series_lookback_days: u32,
    pub max_points: usize,
    pub max_events: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            series_lookback_days: 180,
            max_points: 3000,
            max_events: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdout,
    Outbox,
    Webhook,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Outbox,
            url: None,
            timeout_secs: 10,
        }
    }
}

// ── Subscribers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackOverrides {
    pub floor: Option<f64>,
    pub mid_from: Option<f64>,
    pub high_from: Option<f64>,
    pub exceptional_from: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumOverrides {
    pub avg_margin: Option<f64>,
    pub intraday_margin: Option<f64>,
    pub lookback_days: Option<usize>,
}

/// Every rule parameter, all optional. `None` keeps the base value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleOverrides {
    pub window_days: Option<u32>,
    pub min_points: Option<usize>,
    pub fallback: FallbackOverrides,
    pub alert_bands: Option<Vec<Band>>,
    pub momentum: MomentumOverrides,
    pub super_threshold: Option<f64>,
    pub digest_hour: Option<u32>,
    pub payday_business_day: Option<u32>,
    pub payday_reminder_lead: Option<u32>,
}

impl RuleOverrides {
    pub fn apply(&self, base: &AlertRules) -> AlertRules {
        let f = &self.fallback;
        let m = &self.momentum;
        AlertRules {
            window_days: self.window_days.unwrap_or(base.window_days),
            min_points: self.min_points.unwrap_or(base.min_points),
            fallback: FallbackThresholds {
                floor: f.floor.or(base.fallback.floor),
                mid_from: f.mid_from.unwrap_or(base.fallback.mid_from),
                high_from: f.high_from.unwrap_or(base.fallback.high_from),
                exceptional_from: f.exceptional_from.or(base.fallback.exceptional_from),
            },
            alert_bands: self
                .alert_bands
                .clone()
                .unwrap_or_else(|| base.alert_bands.clone()),
            momentum: MomentumRules {
                avg_margin: m.avg_margin.unwrap_or(base.momentum.avg_margin),
                intraday_margin: m.intraday_margin.unwrap_or(base.momentum.intraday_margin),
                lookback_days: m.lookback_days.unwrap_or(base.momentum.lookback_days),
            },
            super_threshold: self.super_threshold.or(base.super_threshold),
            digest_hour: self.digest_hour.unwrap_or(base.digest_hour),
            payday_business_day: self
                .payday_business_day
                .unwrap_or(base.payday_business_day),
            payday_reminder_lead: self
                .payday_reminder_lead
                .unwrap_or(base.payday_reminder_lead),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    pub id: String,
    /// Premium subscribers also get momentum advisories.
    #[serde(default)]
    pub premium: bool,
    /// Subset of the monitored tenors; all of them when absent.
    #[serde(default)]
    pub tenors: Option<Vec<Tenor>>,
    #[serde(default)]
    pub overrides: RuleOverrides,
}

/// A subscriber with every rule parameter resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSubscriber {
    pub id: String,
    pub premium: bool,
    pub tenors: Vec<Tenor>,
    pub rules: AlertRules,
}

// ── Root ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub tenors: Vec<Tenor>,
    pub source: SourceConfig,
    pub storage: StorageConfig,
    pub clock: ClockConfig,
    pub rules: AlertRules,
    pub dashboard: DashboardConfig,
    pub transport: TransportConfig,
    pub subscribers: Vec<SubscriberConfig>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            tenors: default_tenors(),
            source: SourceConfig::default(),
            storage: StorageConfig::default(),
            clock: ClockConfig::default(),
            rules: AlertRules::default(),
            dashboard: DashboardConfig::default(),
            transport: TransportConfig::default(),
            subscribers: Vec::new(),
        }
    }
}

fn default_tenors() -> Vec<Tenor> {
    [1, 7]
        .into_iter()
        .filter_map(|d| Tenor::from_days(d).ok())
        .collect()
}

impl WatchConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reject configurations the run cannot execute safely.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tenors.is_empty() {
            return Err(ConfigError::NoTenors);
        }
        let mut seen = BTreeSet::new();
        for tenor in &self.tenors {
            if !seen.insert(*tenor) {
                return Err(ConfigError::DuplicateTenor(*tenor));
            }
        }
        if self.storage.dedup_window_minutes < 0 {
            return Err(ConfigError::DedupWindow(self.storage.dedup_window_minutes));
        }
        self.clock.offset()?;
        if self.source.max_retries > MAX_FETCH_RETRIES {
            return Err(ConfigError::MaxRetries(self.source.max_retries));
        }
        if self.source.kind == SourceKind::Fixture && self.source.fixture_path.is_none() {
            return Err(ConfigError::MissingFixturePath);
        }
        if self.transport.kind == TransportKind::Webhook && self.transport.url.is_none() {
            return Err(ConfigError::MissingWebhookUrl);
        }
        if self.dashboard.max_points == 0 {
            return Err(ConfigError::DashboardPoints);
        }
        self.rules.validate().map_err(|source| ConfigError::Rules {
            scope: "[rules]".to_string(),
            source,
        })?;

        if self.subscribers.is_empty() {
            return Err(ConfigError::NoSubscribers);
        }
        let mut ids = BTreeSet::new();
        for sub in &self.subscribers {
            if sub.id.trim().is_empty() {
                return Err(ConfigError::EmptySubscriberId);
            }
            if !ids.insert(sub.id.as_str()) {
                return Err(ConfigError::DuplicateSubscriber(sub.id.clone()));
            }
            self.resolve(sub)?;
        }
        Ok(())
    }

    /// Base rules overridden by the subscriber's values, validated.
    pub fn resolve(&self, sub: &SubscriberConfig) -> Result<ResolvedSubscriber, ConfigError> {
        let rules = sub.overrides.apply(&self.rules);
        rules.validate().map_err(|source| ConfigError::Rules {
            scope: format!("subscriber '{}'", sub.id),
            source,
        })?;

        let tenors = match &sub.tenors {
            None => self.tenors.clone(),
            Some(list) if list.is_empty() => {
                return Err(ConfigError::NoSubscriberTenors(sub.id.clone()));
            }
            Some(list) => {
                for tenor in list {
                    if !self.tenors.contains(tenor) {
                        return Err(ConfigError::UnmonitoredTenor {
                            subscriber: sub.id.clone(),
                            tenor: *tenor,
                        });
                    }
                }
                // Keep the monitored order so digests read the same for everyone.
                self.tenors
                    .iter()
                    .filter(|t| list.contains(t))
                    .copied()
                    .collect()
            }
        };

        Ok(ResolvedSubscriber {
            id: sub.id.clone(),
            premium: sub.premium,
            tenors,
            rules,
        })
    }

    pub fn resolve_all(&self) -> Result<Vec<ResolvedSubscriber>, ConfigError> {
        self.subscribers.iter().map(|s| self.resolve(s)).collect()
    }

    /// BLAKE3 of the canonical JSON form. Changes whenever any value changes.
    pub fn config_hash(&self) -> Result<String, ConfigError> {
        let json = serde_json::to_vec(self)?;
        Ok(blake3::hash(&json).to_hex().to_string())
    }
}

/// Starter file written by `ratewatch init-config`.
pub const SAMPLE_CONFIG: &str = r#"# Monitored tenors, in days.
tenors = [1, 7]

[source]
kind = "byma"
timeout_secs = 15
# At most 6; the wait doubles after each failed attempt.
max_retries = 2

[storage]
data_dir = "data"
dedup_window_minutes = 10

[clock]
# Local calendar used for digests, intraday open and payday (UTC-3).
utc_offset_minutes = -180

[rules]
window_days = 60
min_points = 20
alert_bands = ["BELOW_FLOOR", "LOW", "HIGH", "EXCEPTIONAL"]
digest_hour = 18
payday_business_day = 5
payday_reminder_lead = 2
# super_threshold = 45.0

[rules.fallback]
mid_from = 35.5
high_from = 38.0

[rules.momentum]
avg_margin = 0.8
intraday_margin = 0.8
lookback_days = 5

[dashboard]
series_lookback_days = 180
max_points = 3000
max_events = 200

[transport]
kind = "outbox"

[[subscribers]]
id = "me"
premium = false

# [[subscribers]]
# id = "premium-user"
# premium = true
# tenors = [1]
# [subscribers.overrides]
# digest_hour = 9
# super_threshold = 42.0
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> WatchConfig {
        WatchConfig::from_toml("[[subscribers]]\nid = \"ana\"\n").unwrap()
    }

    #[test]
    fn minimal_file_is_valid() {
        let cfg = minimal();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.tenors.len(), 2);
        assert_eq!(cfg.source.kind, SourceKind::Byma);
        assert_eq!(cfg.clock.offset().unwrap().local_minus_utc(), -3 * 3600);
    }

    #[test]
    fn sample_config_parses_and_validates() {
        let cfg = WatchConfig::from_toml(SAMPLE_CONFIG).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.subscribers[0].id, "me");
        assert_eq!(cfg.rules, AlertRules::default());
    }

    #[test]
    fn tenors_accept_labels_and_numbers() {
        let cfg = WatchConfig::from_toml(
            "tenors = [\"1D\", 7, \"30d\"]\n[[subscribers]]\nid = \"ana\"\n",
        )
        .unwrap();
        let days: Vec<u16> = cfg.tenors.iter().map(|t| t.days()).collect();
        assert_eq!(days, vec![1, 7, 30]);
    }

    #[test]
    fn no_subscribers_is_an_error() {
        let cfg = WatchConfig::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoSubscribers)));
    }

    #[test]
    fn duplicate_subscribers_are_rejected() {
        let cfg = WatchConfig::from_toml(
            "[[subscribers]]\nid = \"ana\"\n[[subscribers]]\nid = \"ana\"\n",
        )
        .unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateSubscriber(id)) if id == "ana"
        ));
    }

    #[test]
    fn subscriber_tenor_must_be_monitored() {
        let cfg = WatchConfig::from_toml(
            "tenors = [1]\n[[subscribers]]\nid = \"ana\"\ntenors = [7]\n",
        )
        .unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnmonitoredTenor { .. })
        ));
    }

    #[test]
    fn subscriber_must_follow_some_tenor() {
        let cfg = WatchConfig::from_toml("[[subscribers]]\nid = \"ana\"\ntenors = []\n").unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NoSubscriberTenors(id)) if id == "ana"
        ));
    }

    #[test]
    fn retries_are_capped() {
        let at_cap = format!(
            "[source]\nmax_retries = {MAX_FETCH_RETRIES}\n[[subscribers]]\nid = \"ana\"\n"
        );
        assert!(WatchConfig::from_toml(&at_cap).unwrap().validate().is_ok());

        let cfg = WatchConfig::from_toml("[source]\nmax_retries = 40\n[[subscribers]]\nid = \"ana\"\n")
            .unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::MaxRetries(40))));
    }

    #[test]
    fn overrides_apply_field_by_field() {
        let cfg = WatchConfig::from_toml(
            r#"
            [rules]
            digest_hour = 17
            [rules.fallback]
            high_from = 39.0

            [[subscribers]]
            id = "ana"
            premium = true
            [subscribers.overrides]
            digest_hour = 9
            [subscribers.overrides.momentum]
            avg_margin = 0.5
            "#,
        )
        .unwrap();
        let resolved = cfg.resolve(&cfg.subscribers[0]).unwrap();
        assert!(resolved.premium);
        assert_eq!(resolved.rules.digest_hour, 9);
        assert_eq!(resolved.rules.fallback.high_from, 39.0);
        assert_eq!(resolved.rules.momentum.avg_margin, 0.5);
        assert_eq!(resolved.rules.momentum.intraday_margin, 0.8);
        assert_eq!(resolved.tenors, cfg.tenors);
    }

    #[test]
    fn invalid_override_names_the_subscriber() {
        let cfg = WatchConfig::from_toml(
            "[[subscribers]]\nid = \"ana\"\n[subscribers.overrides]\ndigest_hour = 25\n",
        )
        .unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("subscriber 'ana'"));
    }

    #[test]
    fn fixture_source_needs_a_path() {
        let cfg = WatchConfig::from_toml(
            "[source]\nkind = \"fixture\"\n[[subscribers]]\nid = \"ana\"\n",
        )
        .unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingFixturePath)));
    }

    #[test]
    fn config_hash_tracks_changes() {
        let a = minimal();
        let mut b = minimal();
        assert_eq!(a.config_hash().unwrap(), b.config_hash().unwrap());
        b.rules.digest_hour = 9;
        assert_ne!(a.config_hash().unwrap(), b.config_hash().unwrap());
    }
}
