use std::{path::PathBuf, time::Duration};

/// Store connection settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file shared by every cooperating process.
    pub path: PathBuf,
    /// How long a locker waits for the write lock before giving up.
    pub busy_timeout: Duration,
    /// Switch the database to WAL journaling on connect.
    pub wal: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("coord.db"),
            busy_timeout: Duration::from_secs(5),
            wal: true,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
}
