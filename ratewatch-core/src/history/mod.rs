//! Rate history: one append-only CSV log per tenor.
//!
//! Layout: `{history_dir}/{TENOR}.csv`, columns `timestamp,tenor,value,source`.
//! The log is the system of record for banding and is read by external
//! reporting tools, so the column set is fixed.
//!
//! Guarantees:
//! - Append-only: records are never rewritten, only appended or rejected
//! - Deduplicated: an equal value for the same tenor inside the dedup window
//!   is rejected
//! - Monotonic: a sample older than the newest record is rejected
//! - Tolerant reads: malformed rows (older formats, torn writes) are skipped

mod window;

pub use window::HistoryWindow;

use chrono::{DateTime, Duration, FixedOffset};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::{HistoryRecord, RateSample, Tenor};

/// Column order of every history log.
pub const HISTORY_HEADER: [&str; 4] = ["timestamp", "tenor", "value", "source"];

/// Two values closer than this are the same quote.
pub const VALUE_EPSILON: f64 = 1e-6;

/// Appended after a torn row: the extra empty columns make it unparseable.
const TORN_ROW_TERMINATOR: &[u8] = b",,\n";

/// Default dedup window (the upstream source is polled every few minutes).
pub const DEFAULT_DEDUP_WINDOW_MINUTES: i64 = 10;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("history CSV error at {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl HistoryError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Why an append was accepted or rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppendReason {
    Appended,
    /// Same value already recorded within the dedup window.
    Duplicate { existing_at: DateTime<FixedOffset> },
    /// The sample predates the newest record for its tenor.
    OutOfOrder { newest_at: DateTime<FixedOffset> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendResult {
    pub accepted: bool,
    pub reason: AppendReason,
}

impl AppendResult {
    fn appended() -> Self {
        Self {
            accepted: true,
            reason: AppendReason::Appended,
        }
    }

    fn rejected(reason: AppendReason) -> Self {
        Self {
            accepted: false,
            reason,
        }
    }
}

/// Append-only, deduplicating history of rate samples.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
    dedup_window: Duration,
}

impl HistoryStore {
    /// Open (creating if needed) the history directory.
    pub fn open(dir: impl Into<PathBuf>, dedup_window: Duration) -> Result<Self, HistoryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| HistoryError::io(&dir, e))?;
        Ok(Self { dir, dedup_window })
    }

    /// Open without creating anything on disk. Logs that do not exist read
    /// as empty; appends fail if the directory is missing.
    pub fn open_read_only(dir: impl Into<PathBuf>, dedup_window: Duration) -> Self {
        Self {
            dir: dir.into(),
            dedup_window,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn dedup_window(&self) -> Duration {
        self.dedup_window
    }

    /// Path of the log for one tenor: `{dir}/{TENOR}.csv`.
    pub fn log_path(&self, tenor: Tenor) -> PathBuf {
        self.dir.join(format!("{tenor}.csv"))
    }

    /// Append a sample unless it duplicates a recent record or is out of order.
    ///
    /// The row is fsynced before returning `accepted = true`.
    pub fn append(&self, sample: &RateSample) -> Result<AppendResult, HistoryError> {
        let existing = self.read_all(sample.tenor())?;
        let ts = sample.observed_at();
        let window_start = ts - self.dedup_window;
        let window_end = ts + self.dedup_window;

        if let Some(dup) = existing.iter().rev().find(|r| {
            r.observed_at >= window_start
                && r.observed_at <= window_end
                && (r.value - sample.value()).abs() <= VALUE_EPSILON
        }) {
            return Ok(AppendResult::rejected(AppendReason::Duplicate {
                existing_at: dup.observed_at,
            }));
        }

        if let Some(newest) = existing.last() {
            if ts < newest.observed_at {
                return Ok(AppendResult::rejected(AppendReason::OutOfOrder {
                    newest_at: newest.observed_at,
                }));
            }
        }

        self.write_row(sample)?;
        Ok(AppendResult::appended())
    }

    /// Records for `tenor` observed at or after `since`, oldest first.
    pub fn window(
        &self,
        tenor: Tenor,
        since: DateTime<FixedOffset>,
    ) -> Result<HistoryWindow, HistoryError> {
        let records = self
            .read_all(tenor)?
            .into_iter()
            .filter(|r| r.observed_at >= since)
            .collect();
        Ok(HistoryWindow::new(tenor, records))
    }

    /// Every readable record for `tenor`, oldest first.
    pub fn records(&self, tenor: Tenor) -> Result<HistoryWindow, HistoryError> {
        Ok(HistoryWindow::new(tenor, self.read_all(tenor)?))
    }

    /// Most recent record for `tenor`, if any.
    pub fn latest(&self, tenor: Tenor) -> Result<Option<HistoryRecord>, HistoryError> {
        Ok(self.read_all(tenor)?.pop())
    }

    fn read_all(&self, tenor: Tenor) -> Result<Vec<HistoryRecord>, HistoryError> {
        let path = self.log_path(tenor);
        let mut content = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(HistoryError::io(&path, e)),
        };

        // An unterminated last line is a torn append, never a record.
        if !content.ends_with(b"\n") {
            let keep = content
                .iter()
                .rposition(|b| *b == b'\n')
                .map_or(0, |i| i + 1);
            if keep < content.len() {
                log::debug!("ignoring torn last row in {}", path.display());
                content.truncate(keep);
            }
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content.as_slice());

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for row in reader.records() {
            match row {
                Ok(row) => match parse_row(&row, tenor) {
                    Some(record) => records.push(record),
                    None => skipped += 1,
                },
                Err(e) if e.is_io_error() => return Err(HistoryError::csv(&path, e)),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            log::debug!("skipped {skipped} malformed rows in {}", path.display());
        }

        // Legacy logs may predate the monotonic-append rule.
        records.sort_by_key(|r| r.observed_at);
        Ok(records)
    }

    fn write_row(&self, sample: &RateSample) -> Result<(), HistoryError> {
        let path = self.log_path(sample.tenor());
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| HistoryError::io(&path, e))?;

        let len = file
            .metadata()
            .map_err(|e| HistoryError::io(&path, e))?
            .len();
        let needs_header = len == 0;
        if !needs_header && !ends_with_newline(&mut file, len).map_err(|e| HistoryError::io(&path, e))? {
            // A previous append was torn mid-row. Pad it with extra columns so
            // it can never parse as a record, then start the new row on its own line.
            file.write_all(TORN_ROW_TERMINATOR).map_err(|e| HistoryError::io(&path, e))?;
        }

        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(&mut file);
            if needs_header {
                writer
                    .write_record(HISTORY_HEADER)
                    .map_err(|e| HistoryError::csv(&path, e))?;
            }
            writer
                .write_record([
                    sample.observed_at().to_rfc3339(),
                    sample.tenor().to_string(),
                    sample.value().to_string(),
                    sample.provenance().to_string(),
                ])
                .map_err(|e| HistoryError::csv(&path, e))?;
            writer.flush().map_err(|e| HistoryError::io(&path, e))?;
        }

        file.sync_data().map_err(|e| HistoryError::io(&path, e))?;
        Ok(())
    }
}

fn ends_with_newline(file: &mut File, len: u64) -> io::Result<bool> {
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Parse one CSV row. Returns `None` for anything malformed.
///
/// Rows with only three columns (no `source`) are accepted with an empty
/// source. Rows with more than four columns (repaired torn rows) and rows
/// whose tenor column disagrees with the file are dropped.
fn parse_row(row: &StringRecord, tenor: Tenor) -> Option<HistoryRecord> {
    if row.len() > HISTORY_HEADER.len() {
        return None;
    }
    let observed_at = DateTime::parse_from_rfc3339(row.get(0)?).ok()?;
    let row_tenor: Tenor = row.get(1)?.parse().ok()?;
    if row_tenor != tenor {
        return None;
    }
    let value: f64 = row.get(2)?.parse().ok()?;
    crate::domain::sample::validate_rate(value).ok()?;
    let source = row.get(3).unwrap_or("").to_string();
    Some(HistoryRecord {
        tenor,
        value,
        observed_at,
        source,
    })
}
