//! Per-group history files.
//!
//! One append-only JSON-lines file per group under `group_history/`, named
//! by group id. Ids are validated against `[A-Za-z0-9_-]+` and the resolved
//! path is checked for containment in the history root — on writes as well
//! as reads.

use std::path::PathBuf;

use pulse_store::atomic::{self, FileMode};
use pulse_store::paths::DataDir;
use pulse_types::message::{GroupHistoryRecord, StoredMessage};

use crate::{GroupError, Result};

/// Append/read access to the history root.
#[derive(Clone, Debug)]
pub struct GroupHistory {
    data: DataDir,
}

impl GroupHistory {
    pub fn new(data: DataDir) -> Self {
        Self { data }
    }

    /// Validate a group id and resolve its history file path.
    fn file_for(&self, group_id: &str) -> Result<PathBuf> {
        if group_id.is_empty()
            || !group_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(GroupError::InvalidId(group_id.to_string()));
        }
        let root = self.data.history_dir();
        let path = root.join(format!("{group_id}.jsonl"));
        atomic::ensure_within_root(&root, &path)?;
        Ok(path)
    }

    /// Append one message to a group's history.
    pub fn append(&self, group_id: &str, message: &StoredMessage, now_ms: i64) -> Result<()> {
        let path = self.file_for(group_id)?;
        let record = GroupHistoryRecord {
            message: message.clone(),
            saved_at: now_ms,
        };
        let line = serde_json::to_string(&record)
            .map_err(|e| pulse_store::StoreError::Serialization(e.to_string()))?;
        atomic::append_line(&path, &line, FileMode::Private)?;
        Ok(())
    }

    /// Read a group's history in append order, newest-last, optionally
    /// limited to the trailing `limit` records.
    pub fn read(&self, group_id: &str, limit: Option<usize>) -> Result<Vec<GroupHistoryRecord>> {
        let path = self.file_for(group_id)?;
        let mut records: Vec<GroupHistoryRecord> = atomic::read_jsonl(&path)?;
        if let Some(limit) = limit {
            let skip = records.len().saturating_sub(limit);
            records.drain(..skip);
        }
        Ok(records)
    }

    /// Remove a group's history file, if present.
    pub fn remove(&self, group_id: &str) -> Result<()> {
        let path = self.file_for(group_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GroupError::Store(e.into())),
        }
    }
}
