//! Conversation memory implementations for Esquire.
//!
//! - [`SqliteStore`]: the shared on-disk store used in production
//! - [`InMemoryStore`]: process-local, for tests
//! - [`DisabledMemory`]: memory turned off by configuration
//!
//! [`MaintenanceScheduler`] runs storage compaction after appends.

pub mod in_memory;
pub mod maintenance;
pub mod noop;
pub mod retry;
pub mod sqlite;

use esquire_config::MemoryConfig;
use esquire_core::error::MemoryError;
use esquire_core::memory::{ConversationStore, RetentionStore};
use std::sync::Arc;
use tracing::info;

pub use in_memory::InMemoryStore;
pub use maintenance::{CompactionOutcome, MaintenanceScheduler};
pub use noop::DisabledMemory;
pub use retry::RetryPolicy;
pub use sqlite::{SqliteStore, SqliteStoreOptions};

/// The two views of one backend that the turn pipeline needs.
#[derive(Clone)]
pub struct MemoryHandles {
    pub conversations: Arc<dyn ConversationStore>,
    pub retention: Arc<dyn RetentionStore>,
}

impl MemoryHandles {
    pub fn disabled() -> Self {
        let store = Arc::new(DisabledMemory);
        Self {
            conversations: store.clone(),
            retention: store,
        }
    }

    pub fn in_memory(max_rows: usize) -> Self {
        let store = Arc::new(InMemoryStore::new(max_rows));
        Self {
            conversations: store.clone(),
            retention: store,
        }
    }

    /// A scheduler bound to this backend's retention state.
    pub fn scheduler(&self, interval_hours: u64) -> MaintenanceScheduler {
        MaintenanceScheduler::new(self.retention.clone(), interval_hours)
    }
}

/// Open the backend selected by configuration.
pub async fn open_from_config(config: &MemoryConfig) -> Result<MemoryHandles, MemoryError> {
    if !config.enabled {
        info!("Server-side conversation memory disabled");
        return Ok(MemoryHandles::disabled());
    }

    let store = Arc::new(SqliteStore::from_config(config).await?);
    Ok(MemoryHandles {
        conversations: store.clone(),
        retention: store,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use esquire_core::memory::TurnRole;
    use esquire_core::message::ConversationId;

    #[tokio::test]
    async fn disabled_config_opens_noop_store() {
        let config = MemoryConfig {
            enabled: false,
            path: "/nonexistent/dir/never-created.sqlite3".into(),
            ..MemoryConfig::default()
        };
        let handles = open_from_config(&config).await.unwrap();
        let id = ConversationId::from("uid");
        handles
            .conversations
            .append(&id, TurnRole::User, "Platí ešte tento zákon?")
            .await
            .unwrap();
        assert!(handles.conversations.recent_context(&id, 10).await.unwrap().is_empty());
        assert_eq!(handles.conversations.name(), "disabled");
    }

    #[tokio::test]
    async fn enabled_config_opens_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig {
            path: dir.path().join("nested").join("memory.sqlite3"),
            max_rows: 3,
            ..MemoryConfig::default()
        };
        let handles = open_from_config(&config).await.unwrap();
        assert_eq!(handles.conversations.name(), "sqlite");

        let id = ConversationId::from("uid");
        for i in 0..5 {
            handles
                .conversations
                .append(&id, TurnRole::User, &format!("q{i}"))
                .await
                .unwrap();
        }
        assert_eq!(handles.conversations.row_count(&id).await.unwrap(), 3);
        assert!(config.path.exists());
    }
}
