//! Durable `{queued, uploaded}` progress record.
//!
//! The record survives restarts as a small JSON document. A missing or
//! unreadable file reads as `{0, 0}`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub queued: u64,
    pub uploaded: u64,
}

impl CounterRecord {
    pub fn new(queued: u64, uploaded: u64) -> Self {
        Self { queued, uploaded }
    }

    pub fn has_queued_uploads(&self) -> bool {
        self.queued > 0
    }

    pub fn is_complete(&self) -> bool {
        self.queued == self.uploaded
    }

    pub fn outstanding(&self) -> u64 {
        self.queued.saturating_sub(self.uploaded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterField {
    Queued,
    Uploaded,
}

#[derive(Debug, Clone)]
pub struct CounterStore {
    path: PathBuf,
}

impl CounterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> CounterRecord {
        if !self.path.is_file() {
            return CounterRecord::default();
        }
        let parsed = fs::read_to_string(&self.path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<CounterRecord>(&raw).map_err(|e| e.to_string()));
        match parsed {
            Ok(rec) => rec,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "counter record unreadable, treating as empty");
                CounterRecord::default()
            }
        }
    }

    /// Bumps one field and persists before returning the new record.
    pub fn increment(&self, field: CounterField) -> CounterRecord {
        let mut rec = self.load();
        match field {
            CounterField::Queued => rec.queued = rec.queued.saturating_add(1),
            CounterField::Uploaded => rec.uploaded = rec.uploaded.saturating_add(1),
        }
        self.store(rec);
        rec
    }

    pub fn store(&self, rec: CounterRecord) {
        if let Err(e) = self.try_store(rec) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to save counter record");
        }
    }

    fn try_store(&self, rec: CounterRecord) -> Result<()> {
        let body = serde_json::to_string(&rec)
            .map_err(|e| Error::msg(format!("failed to encode counter record: {e}")))?;
        atomic_write_text(&self.path, &body)
    }

    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to clear counter record");
            }
        }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

pub(crate) fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::msg(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::msg(format!("failed to write temp file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        Error::msg(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_file_loads_as_zero() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = CounterStore::new(tmp.path().join("upload_tracker.json"));
        assert_eq!(store.load(), CounterRecord::default());
        assert!(!store.exists());
    }

    #[test]
    fn increment_persists_each_field() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("upload_tracker.json");
        let store = CounterStore::new(&path);
        store.increment(CounterField::Queued);
        store.increment(CounterField::Queued);
        let rec = store.increment(CounterField::Uploaded);
        assert_eq!(rec, CounterRecord::new(2, 1));

        let reopened = CounterStore::new(&path);
        assert_eq!(reopened.load(), CounterRecord::new(2, 1));

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw["queued"], 2);
        assert_eq!(raw["uploaded"], 1);
    }

    #[test]
    fn corrupt_file_is_swallowed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("upload_tracker.json");
        fs::write(&path, "{not json").expect("write");
        let store = CounterStore::new(&path);
        assert_eq!(store.load(), CounterRecord::default());
        assert_eq!(
            store.increment(CounterField::Queued),
            CounterRecord::new(1, 0)
        );
    }

    #[test]
    fn clear_removes_record() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = CounterStore::new(tmp.path().join("nested").join("upload_tracker.json"));
        store.increment(CounterField::Queued);
        assert!(store.exists());
        store.clear();
        assert!(!store.exists());
        store.clear();
        assert_eq!(store.load(), CounterRecord::default());
    }
}
