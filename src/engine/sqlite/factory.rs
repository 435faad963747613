use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::engine::{ConnectionFactory, QueryEngine, TableUpdate};
use crate::error::Result;

use super::worker::{OpenSettings, SqliteEngine};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Opens worker-backed SQLite engines against one database file.
///
/// Every engine opened by the same factory publishes change notifications
/// into one shared broadcast channel, so a subscriber on any handle observes
/// updates made through any other.
#[derive(Debug, Clone)]
pub struct SqliteFactory {
    path: String,
    busy_timeout: Duration,
    updates: broadcast::Sender<TableUpdate>,
}

impl SqliteFactory {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            updates,
        }
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// Subscribe to the shared change-notification feed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TableUpdate> {
        self.updates.subscribe()
    }
}

#[async_trait]
impl ConnectionFactory for SqliteFactory {
    async fn open(&self, read_only: bool, label: &str) -> Result<Arc<dyn QueryEngine>> {
        let settings = OpenSettings {
            path: self.path.clone(),
            read_only,
            busy_timeout: self.busy_timeout,
            label: label.to_owned(),
        };
        let engine = SqliteEngine::open(settings, self.updates.clone()).await?;
        Ok(Arc::new(engine))
    }
}
