//! Append-only JSONL files: one JSON object per line, UTF-8.
//!
//! Readers skip blank and malformed lines so a single corrupt record never
//! fails the surrounding operation. `rewrite` is the one non-append mutation
//! (used by the signal store's mark-handled) and goes through a `.tmp`
//! sibling plus rename: a crash before the rename leaves the original file
//! untouched, a crash after leaves a consistent new file.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::StoreError;

#[derive(Debug, Clone)]
pub struct JsonlLog {
    path: PathBuf,
}

impl JsonlLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line, creating parent directories and
    /// the file itself on first use.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }

    /// Read every line as a raw JSON value, skipping blank and malformed
    /// lines. A missing file reads as empty.
    pub fn read_values(&self) -> Vec<serde_json::Value> {
        self.read_with(|line| serde_json::from_str(line).ok())
    }

    /// Read every line as `T`, skipping lines that fail to deserialize.
    pub fn read_all<T: DeserializeOwned>(&self) -> Vec<T> {
        self.read_with(|line| serde_json::from_str(line).ok())
    }

    /// Atomically replace the log with a new record set.
    pub fn rewrite<T: Serialize>(&self, records: &[T]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "log.jsonl".to_string());
        let tmp_path = self.path.with_file_name(format!("{file_name}.tmp"));

        let write_result: Result<(), StoreError> = (|| {
            let mut file = fs::File::create(&tmp_path)?;
            for record in records {
                let line = serde_json::to_string(record)?;
                writeln!(file, "{line}")?;
            }
            file.flush()?;
            file.sync_all()?;
            Ok(())
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }

    fn read_with<T>(&self, parse: impl Fn(&str) -> Option<T>) -> Vec<T> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(_) => return Vec::new(),
        };

        BufReader::new(file)
            .lines()
            .filter_map(|line| {
                let line = line.ok()?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return None;
                }
                let parsed = parse(trimmed);
                if parsed.is_none() {
                    warn!(path = %self.path.display(), "skipping malformed JSONL line");
                }
                parsed
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    use super::JsonlLog;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u32,
        note: String,
    }

    fn record(id: u32, note: &str) -> Record {
        Record {
            id,
            note: note.to_string(),
        }
    }

    #[test]
    fn append_then_read_last_returns_the_written_record() {
        let dir = tempdir().unwrap();
        let log = JsonlLog::new(dir.path().join("nested/events.jsonl"));

        log.append(&record(1, "first")).unwrap();
        log.append(&record(2, "second")).unwrap();

        let rows: Vec<Record> = log.read_all();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.last(), Some(&record(2, "second")));
    }

    #[test]
    fn malformed_and_blank_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(
            &path,
            "{\"id\":1,\"note\":\"ok\"}\n\nnot json at all\n{\"id\":2,\"note\":\"also ok\"}\n",
        )
        .unwrap();

        let rows: Vec<Record> = JsonlLog::new(&path).read_all();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, 1);
        assert_eq!(rows[1].id, 2);
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let log = JsonlLog::new(dir.path().join("absent.jsonl"));
        assert!(log.read_values().is_empty());
    }

    #[test]
    fn rewrite_replaces_contents_atomically() {
        let dir = tempdir().unwrap();
        let log = JsonlLog::new(dir.path().join("events.jsonl"));
        log.append(&record(1, "old")).unwrap();
        log.append(&record(2, "old")).unwrap();

        log.rewrite(&[record(3, "new")]).unwrap();

        let rows: Vec<Record> = log.read_all();
        assert_eq!(rows, vec![record(3, "new")]);
        assert!(!dir.path().join("events.jsonl.tmp").exists());
    }
}
