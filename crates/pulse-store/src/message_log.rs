//! The encrypted message log.
//!
//! One [`StoredMessage`] per line, sealed with the storage key. Reads
//! tolerate lines that fail to decode or decrypt — a truncated tail or a
//! line written under a rotated key is skipped, not fatal.

use std::path::PathBuf;

use pulse_crypto::envelope::StorageKey;
use pulse_types::message::StoredMessage;

use crate::atomic::{self, FileMode};
use crate::Result;

/// Read-side filters shared by the CLI surface.
#[derive(Clone, Debug, Default)]
pub struct MessageFilter {
    /// Only messages from this sender (hex pubkey).
    pub from: Option<String>,
    /// Only messages with `timestamp >= since` (ms).
    pub since: Option<i64>,
    /// Only messages with `timestamp <= until` (ms).
    pub until: Option<i64>,
    /// Case-insensitive substring over the rendered content.
    pub search: Option<String>,
    /// Only messages for this group id; `Some(None)` is not representable —
    /// use [`MessageFilter::direct_only`].
    pub group: Option<String>,
    /// Drop group messages entirely.
    pub direct_only: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl MessageFilter {
    fn matches(&self, msg: &StoredMessage) -> bool {
        if let Some(from) = &self.from {
            if &msg.from != from {
                return false;
            }
        }
        if let Some(since) = self.since {
            if msg.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if msg.timestamp > until {
                return false;
            }
        }
        if let Some(group) = &self.group {
            if msg.group_id.as_deref() != Some(group.as_str()) {
                return false;
            }
        }
        if self.direct_only && msg.is_group {
            return false;
        }
        if let Some(needle) = &self.search {
            let rendered = match &msg.content {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if !rendered.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Append/read access to one encrypted log file.
#[derive(Debug)]
pub struct MessageLog {
    path: PathBuf,
    key: StorageKey,
}

impl MessageLog {
    pub fn new(path: impl Into<PathBuf>, key: StorageKey) -> Self {
        Self {
            path: path.into(),
            key,
        }
    }

    /// Seal and append one message.
    pub fn append(&self, message: &StoredMessage) -> Result<()> {
        let json = serde_json::to_vec(message)
            .map_err(|e| crate::StoreError::Serialization(e.to_string()))?;
        let line = self.key.seal_line(&json)?;
        atomic::append_line(&self.path, &line, FileMode::Private)
    }

    /// Decrypt and return messages matching `filter`, in append order.
    pub fn read(&self, filter: &MessageFilter) -> Result<Vec<StoredMessage>> {
        let lines = atomic::read_lines(&self.path)?;
        let mut messages = Vec::new();
        for line in &lines {
            let Ok(plain) = self.key.open_line(line) else {
                tracing::debug!("skipping undecryptable log line");
                continue;
            };
            match serde_json::from_slice::<StoredMessage>(&plain) {
                Ok(msg) => {
                    if filter.matches(&msg) {
                        messages.push(msg);
                    }
                }
                Err(e) => tracing::debug!(error = %e, "skipping unparsable log line"),
            }
        }

        let offset = filter.offset.min(messages.len());
        let mut messages = messages.split_off(offset);
        if let Some(limit) = filter.limit {
            messages.truncate(limit);
        }
        Ok(messages)
    }

    /// Number of readable messages.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read(&MessageFilter::default())?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop all messages (the consuming `recv` path).
    pub fn truncate(&self) -> Result<()> {
        atomic::truncate(&self.path)
    }
}
