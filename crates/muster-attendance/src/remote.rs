//! Day-keyed remote attendance collection and the operator-triggered push.
//!
//! Each day has one document accumulating every record pushed that day.
//! Appends are additive: ids already present remotely are never rewritten.

use crate::ledger::{AttendanceLedger, TIMESTAMP_FORMAT};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("remote store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt day document for {date}: {source}")]
    Corrupt {
        date: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode day document: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Mode")]
    pub mode: String,
    #[serde(rename = "DateTime")]
    pub date_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayDocument {
    pub date: String,
    pub students: Vec<RemoteEntry>,
}

impl DayDocument {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date: date.format(DATE_FORMAT).to_string(),
            students: Vec::new(),
        }
    }

    pub fn ids(&self) -> HashSet<&str> {
        self.students.iter().map(|s| s.id.as_str()).collect()
    }
}

/// Collection of day documents.
pub trait RemoteStore {
    /// The document for `date`, created empty if it does not exist yet.
    fn fetch_or_create_day(&self, date: NaiveDate) -> Result<DayDocument, RemoteError>;

    /// Add `entries` whose ids are not yet in the day's document.
    /// Returns how many were added.
    fn append(&self, date: NaiveDate, entries: &[RemoteEntry]) -> Result<usize, RemoteError>;
}

/// Remote collection backed by a SQLite database, one row per day.
pub struct SqliteRemoteStore {
    conn: Connection,
}

impl SqliteRemoteStore {
    pub fn open(path: &Path) -> Result<Self, RemoteError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, RemoteError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, RemoteError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS attendance_days (
                date TEXT PRIMARY KEY,
                document TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    fn load_day(conn: &Connection, key: &str) -> Result<Option<DayDocument>, RemoteError> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT document FROM attendance_days WHERE date = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|source| RemoteError::Corrupt {
                date: key.to_string(),
                source,
            })
        })
        .transpose()
    }

    fn store_day(conn: &Connection, doc: &DayDocument) -> Result<(), RemoteError> {
        let body = serde_json::to_string(doc)?;
        conn.execute(
            "INSERT INTO attendance_days (date, document) VALUES (?1, ?2)
             ON CONFLICT(date) DO UPDATE SET document = excluded.document",
            params![doc.date, body],
        )?;
        Ok(())
    }
}

impl RemoteStore for SqliteRemoteStore {
    fn fetch_or_create_day(&self, date: NaiveDate) -> Result<DayDocument, RemoteError> {
        let key = date.format(DATE_FORMAT).to_string();
        if let Some(doc) = Self::load_day(&self.conn, &key)? {
            return Ok(doc);
        }
        let doc = DayDocument::empty(date);
        Self::store_day(&self.conn, &doc)?;
        tracing::debug!(date = %key, "created remote day document");
        Ok(doc)
    }

    fn append(&self, date: NaiveDate, entries: &[RemoteEntry]) -> Result<usize, RemoteError> {
        let key = date.format(DATE_FORMAT).to_string();
        let tx = self.conn.unchecked_transaction()?;
        let mut doc = Self::load_day(&tx, &key)?.unwrap_or_else(|| DayDocument::empty(date));

        let mut seen: HashSet<String> = doc.students.iter().map(|s| s.id.clone()).collect();
        let mut added = 0;
        for entry in entries {
            if seen.insert(entry.id.clone()) {
                doc.students.push(entry.clone());
                added += 1;
            }
        }

        if added > 0 {
            Self::store_day(&tx, &doc)?;
        }
        tx.commit()?;
        Ok(added)
    }
}

/// Mirror today's local records into the remote day document.
///
/// Returns the number of newly inserted entries; nothing recorded today and
/// nothing new are both `Ok(0)`.
pub fn push_today(ledger: &AttendanceLedger, store: &dyn RemoteStore, today: NaiveDate) -> Result<usize, RemoteError> {
    let records = ledger.records_for(today);
    if records.is_empty() {
        tracing::info!(date = %today, "no attendance recorded today, nothing to push");
        return Ok(0);
    }

    let doc = store.fetch_or_create_day(today)?;
    let remote_ids = doc.ids();
    let fresh: Vec<RemoteEntry> = records
        .iter()
        .filter(|r| !remote_ids.contains(r.id.as_str()))
        .map(|r| RemoteEntry {
            id: r.id.clone(),
            name: r.name.clone(),
            mode: r.mode.to_string(),
            date_time: r.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        })
        .collect();

    if fresh.is_empty() {
        tracing::info!(date = %today, "remote already up to date");
        return Ok(0);
    }

    let inserted = store.append(today, &fresh)?;
    tracing::info!(date = %today, inserted, "pushed attendance to remote");
    Ok(inserted)
}
