//! Per-day attendance export: `<dir>/<YYYY-MM-DD>_Attendance.csv`.
//!
//! A row is appended for every stored record, so one day's file collects
//! every shift of that day. The header is written when the file is created.

use crate::ledger::{AttendanceRecord, TIMESTAMP_FORMAT};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("failed to open daily export {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write daily export row: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRow {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "DateTime")]
    pub date_time: String,
}

impl From<&AttendanceRecord> for ExportRow {
    fn from(record: &AttendanceRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            date_time: record.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DailyExport {
    dir: PathBuf,
}

impl DailyExport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}_Attendance.csv", date.format("%Y-%m-%d")))
    }

    /// Append `record` to its day's file, returning that file's path.
    pub fn append(&self, record: &AttendanceRecord) -> Result<PathBuf, ExportError> {
        let path = self.path_for(record.timestamp.date());
        let io_error = |source| ExportError::Io {
            path: path.display().to_string(),
            source,
        };

        std::fs::create_dir_all(&self.dir).map_err(io_error)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error)?;
        let is_new = file.metadata().map_err(io_error)?.len() == 0;

        let mut writer = csv::WriterBuilder::new().has_headers(is_new).from_writer(file);
        writer.serialize(ExportRow::from(record))?;
        writer.flush().map_err(io_error)?;

        tracing::debug!(path = %path.display(), id = %record.id, "daily export row written");
        Ok(path)
    }

    /// Rows exported for `date`; empty if nothing was exported that day.
    pub fn read(&self, date: NaiveDate) -> Result<Vec<ExportRow>, ExportError> {
        let path = self.path_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path)?;
        let rows = reader.deserialize().collect::<Result<Vec<ExportRow>, _>>()?;
        Ok(rows)
    }
}
