//! The per-install data directory layout.

use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "AGENT_PULSE_DATA_DIR";

/// Resolved locations of every file the agent persists.
#[derive(Clone, Debug)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Use an explicit root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the default root: `$AGENT_PULSE_DATA_DIR`, else
    /// `~/.agent-pulse`, else a temp fallback.
    pub fn resolve_default() -> Self {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            return Self::new(dir);
        }
        let root = std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".agent-pulse"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/agent-pulse"));
        Self { root }
    }

    /// Create the root and the group-history subdirectory.
    pub fn ensure_created(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.history_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{secretKey: hex}`, 0600.
    pub fn identity_file(&self) -> PathBuf {
        self.root.join("identity.json")
    }

    /// Decimal PID of the running worker.
    pub fn pid_file(&self) -> PathBuf {
        self.root.join("server.pid")
    }

    /// Heartbeat snapshot, overwritten every few seconds.
    pub fn health_file(&self) -> PathBuf {
        self.root.join("health.json")
    }

    /// Envelope-encrypted message log.
    pub fn messages_file(&self) -> PathBuf {
        self.root.join("messages.jsonl")
    }

    /// Command inbox; truncated on drain.
    pub fn commands_file(&self) -> PathBuf {
        self.root.join("commands.jsonl")
    }

    /// Command results.
    pub fn results_file(&self) -> PathBuf {
        self.root.join("results.jsonl")
    }

    /// Offline retry queue snapshot.
    pub fn queue_file(&self) -> PathBuf {
        self.root.join("offline_queue.jsonl")
    }

    /// Group state.
    pub fn groups_file(&self) -> PathBuf {
        self.root.join("groups.json")
    }

    /// Per-group history files live here, named `<group id>.jsonl`.
    pub fn history_dir(&self) -> PathBuf {
        self.root.join("group_history")
    }

    pub fn relay_stats_file(&self) -> PathBuf {
        self.root.join("relay_stats.json")
    }

    pub fn relay_blacklist_file(&self) -> PathBuf {
        self.root.join("relay_blacklist.json")
    }

    pub fn relay_health_history_file(&self) -> PathBuf {
        self.root.join("relay_health_history.json")
    }

    /// Cross-process lock directory.
    pub fn lock_dir(&self) -> PathBuf {
        self.root.join(".lock.d")
    }

    /// 32 random bytes hex, 0600.
    pub fn storage_key_file(&self) -> PathBuf {
        self.root.join(".storage_key")
    }

    /// Optional TOML configuration.
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }
}
