//! Shift-scoped attendance sheet, persisted to a local JSON file.
//!
//! One sheet covers one (date, shift mode) pair. The first admission under a
//! new pair clears the sheet before it is stored. Every stored record
//! rewrites the whole file and, when configured, appends a row to the
//! day's [`DailyExport`].

use crate::alert::AlertNotifier;
use crate::export::{DailyExport, ExportError};
use crate::shift::ShiftMode;
use chrono::{Local, NaiveDate, NaiveDateTime};
use muster_core::is_unknown_label;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("failed to write attendance file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode attendance file: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Export(#[from] ExportError),
}

/// Result of submitting one recognition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    RejectedUnknown,
    AlreadyRecorded,
    Stored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub id: String,
    pub name: String,
    pub timestamp: NaiveDateTime,
    pub mode: ShiftMode,
}

#[derive(Serialize, Deserialize)]
struct FileEntry {
    id: String,
    name: String,
}

#[derive(Serialize, Deserialize)]
struct LedgerFile {
    date_time: String,
    mode: ShiftMode,
    attendance: Vec<FileEntry>,
}

/// The current shift's sheet: which ids have been marked present.
pub struct AttendanceLedger {
    path: PathBuf,
    /// Start of the shift window the sheet belongs to; `None` until the
    /// first admission.
    window_start: Option<NaiveDateTime>,
    mode: Option<ShiftMode>,
    records: Vec<AttendanceRecord>,
    alerts: Option<AlertNotifier>,
    export: Option<DailyExport>,
}

impl AttendanceLedger {
    /// Resume from the local file, or start empty if it is missing or unreadable.
    ///
    /// The file keeps only ids and names, so resumed records carry the
    /// sheet's window start as their timestamp rather than the time they
    /// were stored.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut ledger = Self {
            path,
            window_start: None,
            mode: None,
            records: Vec::new(),
            alerts: None,
            export: None,
        };

        match std::fs::read_to_string(&ledger.path) {
            Ok(raw) => match parse_file(&raw) {
                Some((window_start, file)) => {
                    ledger.window_start = Some(window_start);
                    ledger.mode = Some(file.mode);
                    ledger.records = file
                        .attendance
                        .into_iter()
                        .map(|e| AttendanceRecord {
                            id: e.id,
                            name: e.name,
                            timestamp: window_start,
                            mode: file.mode,
                        })
                        .collect();
                    tracing::info!(
                        path = %ledger.path.display(),
                        mode = %file.mode,
                        records = ledger.records.len(),
                        "resumed attendance sheet"
                    );
                }
                None => {
                    tracing::warn!(path = %ledger.path.display(), "attendance file unreadable, starting empty");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %ledger.path.display(), "no attendance file yet");
            }
            Err(e) => {
                tracing::warn!(path = %ledger.path.display(), error = %e, "could not read attendance file, starting empty");
            }
        }

        ledger
    }

    /// Route unknown-face rejections to `alerts`.
    pub fn with_alerts(mut self, alerts: AlertNotifier) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Append every stored record to `export`.
    pub fn with_export(mut self, export: DailyExport) -> Self {
        self.export = Some(export);
        self
    }

    /// Submit a recognition using the local wall clock.
    pub fn record_if_new(&mut self, label: &str, name: &str) -> Result<Outcome, LedgerError> {
        self.record_if_new_at(label, name, Local::now().naive_local())
    }

    /// Submit a recognition observed at `now`.
    ///
    /// On a write or export failure the record stays admitted in memory and
    /// the error is returned.
    pub fn record_if_new_at(&mut self, label: &str, name: &str, now: NaiveDateTime) -> Result<Outcome, LedgerError> {
        if is_unknown_label(label) {
            if let Some(alerts) = &self.alerts {
                alerts.notify();
            }
            return Ok(Outcome::RejectedUnknown);
        }

        let mode = ShiftMode::at(now.time());
        let same_sheet = self.mode == Some(mode) && self.date() == Some(now.date());
        if !same_sheet {
            if !self.records.is_empty() {
                tracing::info!(
                    previous = ?self.mode,
                    current = %mode,
                    cleared = self.records.len(),
                    "shift changed, starting new sheet"
                );
            }
            self.records.clear();
            self.mode = Some(mode);
            self.window_start = Some(ShiftMode::window_start(now));
        }

        if self.contains(label) {
            return Ok(Outcome::AlreadyRecorded);
        }

        self.records.push(AttendanceRecord {
            id: label.to_string(),
            name: name.to_string(),
            timestamp: now,
            mode,
        });
        tracing::info!(id = label, name, mode = %mode, "attendance stored");

        let persisted = self.persist();
        let exported = self.export_latest();
        persisted?;
        exported?;
        Ok(Outcome::Stored)
    }

    /// Overwrite the local file with the current sheet.
    ///
    /// Not crash-atomic: a crash mid-write can leave a truncated file, which
    /// `open` treats as an empty sheet.
    fn persist(&self) -> Result<(), LedgerError> {
        let (Some(mode), Some(window_start)) = (self.mode, self.window_start) else {
            return Ok(());
        };
        let file = LedgerFile {
            date_time: window_start.format(TIMESTAMP_FORMAT).to_string(),
            mode,
            attendance: self
                .records
                .iter()
                .map(|r| FileEntry {
                    id: r.id.clone(),
                    name: r.name.clone(),
                })
                .collect(),
        };
        let body = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| self.write_error(source))?;
        }
        std::fs::write(&self.path, body).map_err(|source| self.write_error(source))
    }

    fn export_latest(&self) -> Result<(), LedgerError> {
        if let (Some(export), Some(record)) = (&self.export, self.records.last()) {
            export.append(record)?;
        }
        Ok(())
    }

    fn write_error(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Write {
            path: self.path.display().to_string(),
            source,
        }
    }

    /// Records on the sheet if it belongs to `date`; empty otherwise.
    pub fn records_for(&self, date: NaiveDate) -> &[AttendanceRecord] {
        match self.date() {
            Some(d) if d == date => &self.records,
            _ => &[],
        }
    }

    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }

    pub fn mode(&self) -> Option<ShiftMode> {
        self.mode
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.window_start.map(|t| t.date())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.iter().any(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_file(raw: &str) -> Option<(NaiveDateTime, LedgerFile)> {
    let file: LedgerFile = serde_json::from_str(raw).ok()?;
    let window_start = NaiveDateTime::parse_from_str(&file.date_time, TIMESTAMP_FORMAT).ok()?;
    Some((window_start, file))
}
