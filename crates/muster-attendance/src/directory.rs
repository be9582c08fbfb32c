//! Enrolled-person directory stored as a TinyDB-style JSON document.
//!
//! Layout: `{"student": {"<doc id>": {"<person id>": ["<name>", "<status>"]}}}`.
//! Tables other than `student` are preserved on write.

use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

const STUDENT_TABLE: &str = "student";
const ENROLLED: &str = "enrolled";

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("failed to access directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed directory {path}: {message}")]
    Malformed { path: String, message: String },
    #[error("person id '{0}' is already enrolled")]
    AlreadyEnrolled(String),
}

/// Maps a classifier label to a display name.
pub trait DirectoryLookup {
    fn display_name(&self, label: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub id: String,
    pub name: String,
    pub status: String,
}

pub struct Directory {
    path: PathBuf,
    document: Map<String, Value>,
}

impl Directory {
    /// Load the directory; a missing file is an empty directory.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DirectoryError> {
        let path = path.into();
        let document = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => Map::new(),
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) => return Err(malformed(&path, "top level is not an object")),
                Err(e) => return Err(malformed(&path, &e.to_string())),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(source) => {
                return Err(DirectoryError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        let directory = Self { path, document };
        tracing::debug!(path = %directory.path.display(), entries = directory.entries().len(), "directory loaded");
        Ok(directory)
    }

    fn table(&self) -> Option<&Map<String, Value>> {
        self.document.get(STUDENT_TABLE)?.as_object()
    }

    /// All entries in document order.
    pub fn entries(&self) -> Vec<DirectoryEntry> {
        let Some(table) = self.table() else {
            return Vec::new();
        };
        let mut docs: Vec<(&String, &Value)> = table.iter().collect();
        docs.sort_by_key(|(doc_id, _)| doc_id.parse::<u64>().unwrap_or(u64::MAX));

        docs.into_iter()
            .filter_map(|(_, doc)| doc.as_object())
            .flat_map(|doc| doc.iter())
            .filter_map(|(id, value)| {
                let pair = value.as_array()?;
                Some(DirectoryEntry {
                    id: id.clone(),
                    name: pair.first()?.as_str()?.to_string(),
                    status: pair.get(1).and_then(Value::as_str).unwrap_or_default().to_string(),
                })
            })
            .collect()
    }

    pub fn lookup(&self, id: &str) -> Option<DirectoryEntry> {
        self.entries().into_iter().find(|e| e.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lookup(id).is_some()
    }

    /// Add an enrolled person and write the directory back to disk.
    pub fn enroll(&mut self, id: &str, name: &str) -> Result<(), DirectoryError> {
        if self.contains(id) {
            return Err(DirectoryError::AlreadyEnrolled(id.to_string()));
        }

        let table = self
            .document
            .entry(STUDENT_TABLE)
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(table) = table else {
            return Err(malformed(&self.path, "student table is not an object"));
        };
        let next_id = table.keys().filter_map(|k| k.parse::<u64>().ok()).max().unwrap_or(0) + 1;
        table.insert(next_id.to_string(), json!({ id: [name, ENROLLED] }));

        self.save()?;
        tracing::info!(id, name, doc_id = next_id, "person enrolled");
        Ok(())
    }

    fn save(&self) -> Result<(), DirectoryError> {
        let io = |source| DirectoryError::Io {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let body = serde_json::to_string(&self.document).map_err(|e| malformed(&self.path, &e.to_string()))?;
        std::fs::write(&self.path, body).map_err(io)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DirectoryLookup for Directory {
    fn display_name(&self, label: &str) -> Option<String> {
        self.lookup(label).map(|e| e.name)
    }
}

fn malformed(path: &Path, message: &str) -> DirectoryError {
    DirectoryError::Malformed {
        path: path.display().to_string(),
        message: message.to_string(),
    }
}
