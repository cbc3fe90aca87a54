//! RateWatch CLI: run, inspect, and maintain a caución rate watcher.
//!
//! Commands:
//! - `run`: fetch, record, notify, publish the dashboard
//! - `status`: latest value and band per monitored tenor
//! - `history`: dump a tenor's recent history as CSV
//! - `reset-super`: re-arm a subscriber's one-shot exceptional alert
//! - `init-config`: write a commented starter configuration

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::io;
use std::path::{Path, PathBuf};

use ratewatch_core::bands::{classify, PercentileBander};
use ratewatch_core::domain::Tenor;
use ratewatch_core::history::HistoryStore;
use ratewatch_runner::config::SAMPLE_CONFIG;
use ratewatch_runner::{
    source, transport, DeliveryBoundary, RunCoordinator, RunError, RunOutcome, StateStore,
    WatchConfig,
};

#[derive(Parser)]
#[command(
    name = "ratewatch",
    about = "RateWatch: caución repo-rate history, banding and alerts"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch current rates, record them, notify subscribers and publish the dashboard.
    Run {
        /// Path to the TOML config file.
        #[arg(long, default_value = "ratewatch.toml")]
        config: PathBuf,

        /// Compute and print everything, write nothing, send nothing.
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Print the full run report as JSON.
        #[arg(long, default_value_t = false)]
        report: bool,
    },
    /// Show the latest recorded value and band for every monitored tenor.
    Status {
        /// Path to the TOML config file.
        #[arg(long, default_value = "ratewatch.toml")]
        config: PathBuf,
    },
    /// Write a tenor's recent history to stdout as CSV.
    History {
        /// Path to the TOML config file.
        #[arg(long, default_value = "ratewatch.toml")]
        config: PathBuf,

        /// Tenor, e.g. 1D or 7.
        #[arg(long)]
        tenor: Tenor,

        /// How many days back to include.
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// Re-arm the exceptional-opportunity alert for one subscriber.
    ResetSuper {
        /// Path to the TOML config file.
        #[arg(long, default_value = "ratewatch.toml")]
        config: PathBuf,

        /// Subscriber id as written in the config.
        #[arg(long)]
        subscriber: String,
    },
    /// Write a starter configuration file.
    InitConfig {
        /// Destination path.
        #[arg(long, default_value = "ratewatch.toml")]
        path: PathBuf,

        /// Overwrite an existing file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            dry_run,
            report,
        } => run_cmd(&config, dry_run, report),
        Commands::Status { config } => run_status(&config),
        Commands::History {
            config,
            tenor,
            days,
        } => run_history(&config, tenor, days),
        Commands::ResetSuper { config, subscriber } => run_reset_super(&config, &subscriber),
        Commands::InitConfig { path, force } => run_init_config(&path, force),
    }
}

fn load_config(path: &Path) -> Result<WatchConfig> {
    let config = WatchConfig::from_file(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn run_cmd(config_path: &Path, dry_run: bool, report: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let rate_source = source::from_config(&config.source)?;
    let transport = transport::from_config(&config.transport, &config.storage.outbox_path())?;
    let boundary = DeliveryBoundary::new(transport);

    let coordinator = RunCoordinator::new(&config, rate_source.as_ref()).dry_run(dry_run);
    let (outcome, delivery) = match coordinator.run_and_deliver(Utc::now(), &boundary) {
        Ok(done) => done,
        Err(RunError::StatePersistence { source: err, dashboard }) => {
            // The dashboard reflects recorded history even though no alerts went out.
            dashboard.publish(&config.storage.dashboard_path(), &config.storage.latest_path())?;
            return Err(RunError::StatePersistence { source: err, dashboard }.into());
        }
        Err(e) => return Err(e.into()),
    };

    if dry_run {
        print_messages(&outcome);
    } else {
        outcome
            .dashboard
            .publish(&config.storage.dashboard_path(), &config.storage.latest_path())
            .context("failed to publish dashboard")?;
    }

    print_summary(&outcome);
    if !dry_run {
        println!(
            "Delivered:      {}/{} via {}",
            delivery.delivered,
            delivery.attempted,
            boundary.transport_name()
        );
        for failure in &delivery.failed {
            println!("WARNING: delivery to {} failed: {}", failure.subscriber_id, failure.error);
        }
    }
    if report {
        println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    }
    Ok(())
}

fn run_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let offset = config.clock.offset()?;
    let now = Utc::now().with_timezone(&offset);
    let store = HistoryStore::open(config.storage.history_dir(), config.storage.dedup_window())?;
    let bander = PercentileBander::new(&store);
    let rules = &config.rules;

    println!("{:<6} {:>10} {:<14} {:>6}  {}", "Tenor", "Value", "Band", "n", "Observed");
    println!("{}", "-".repeat(62));
    for &tenor in &config.tenors {
        let Some(latest) = store.latest(tenor)? else {
            println!("{:<6} {:>10} {:<14} {:>6}  -", tenor.to_string(), "-", "-", 0);
            continue;
        };
        let snapshot = bander.snapshot(tenor, now, rules.window_days, rules.min_points)?;
        let band = classify(latest.value, &snapshot, &rules.fallback);
        let basis = if snapshot.insufficient_history() {
            "fallback"
        } else {
            "window"
        };
        println!(
            "{:<6} {:>9.2}% {:<14} {:>6}  {} ({basis})",
            tenor.to_string(),
            latest.value,
            band.to_string(),
            snapshot.sample_count,
            latest.observed_at.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}

fn run_history(config_path: &Path, tenor: Tenor, days: u32) -> Result<()> {
    let config = load_config(config_path)?;
    let offset = config.clock.offset()?;
    let since = Utc::now().with_timezone(&offset) - Duration::days(i64::from(days));
    let store = HistoryStore::open(config.storage.history_dir(), config.storage.dedup_window())?;
    let window = store.window(tenor, since)?;

    let mut writer = csv::Writer::from_writer(io::stdout().lock());
    writer.write_record(["timestamp", "tenor", "value", "source"])?;
    for record in &window {
        writer.write_record([
            record.observed_at.to_rfc3339(),
            record.tenor.to_string(),
            record.value.to_string(),
            record.source.clone(),
        ])?;
    }
    writer.flush()?;
    log::info!("{} records for {tenor} since {}", window.len(), since.date_naive());
    Ok(())
}

fn run_reset_super(config_path: &Path, subscriber: &str) -> Result<()> {
    let config = load_config(config_path)?;
    if !config.subscribers.iter().any(|s| s.id == subscriber) {
        bail!("unknown subscriber '{subscriber}'");
    }

    let store = StateStore::new(config.storage.state_path());
    let (mut snapshot, _) = store.load()?;
    let Some(book) = snapshot.subscribers.get_mut(subscriber) else {
        println!("No state recorded for '{subscriber}'; nothing to reset.");
        return Ok(());
    };
    if !book.reset_super_alert() {
        println!("Exceptional alert for '{subscriber}' is already armed.");
        return Ok(());
    }
    store.save(&mut snapshot, Utc::now())?;
    println!("Exceptional alert re-armed for '{subscriber}'.");
    Ok(())
}

fn run_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    std::fs::write(path, SAMPLE_CONFIG)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote starter config to {}", path.display());
    Ok(())
}

fn print_messages(outcome: &RunOutcome) {
    if outcome.messages.is_empty() {
        println!("(no messages this run)");
        return;
    }
    for message in &outcome.messages {
        println!("--- {} ---", message.subscriber_id);
        println!("{}", message.text);
        println!();
    }
}

fn print_summary(outcome: &RunOutcome) {
    let report = &outcome.report;
    println!();
    println!("=== Run {} ===", report.local_time.format("%Y-%m-%d %H:%M"));
    if report.dry_run {
        println!("(dry run: nothing written)");
    }
    for tenor in &outcome.dashboard.tenors {
        let value = tenor
            .fetched
            .map(|v| format!("{v:.2}%"))
            .unwrap_or_else(|| "n/a".into());
        let band = tenor
            .latest_band
            .map(|b| b.to_string())
            .unwrap_or_else(|| "-".into());
        println!("{:<6} {:>9} {}", tenor.tenor.to_string(), value, band);
    }
    println!("Quality:        {:?}", outcome.dashboard.quality);
    println!("Rows appended:  {}", report.rows_appended);
    println!("Notifications:  {}", outcome.notifications.len());
    println!("Messages:       {}", outcome.messages.len());
    if let Some(err) = &report.fetch_error {
        println!("WARNING: fetch failed: {err}");
    }
    if let Some(path) = &report.state_quarantined {
        println!("WARNING: unreadable state moved to {}", path.display());
    }
}
