//! SQLite conversation store shared by every worker process.
//!
//! One database file holds two tables:
//! - `conversation_memory`: one row per user/assistant turn
//! - `retention_state`: a single row with the last compaction time
//!
//! The file is opened in WAL mode so readers are not blocked by a writer.
//! Writers wait `busy_timeout` on the lock, then retry a bounded number of
//! times before reporting contention.

use crate::retry::{RetryPolicy, with_retry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use esquire_config::MemoryConfig;
use esquire_core::error::MemoryError;
use esquire_core::memory::{
    ConversationStore, MemoryRecord, RetentionStore, TurnRole, exchange_turns,
};
use esquire_core::message::ConversationId;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const LEGACY_TABLES: [(&str, &str); 2] =
    [("user_memory", "user"), ("assistant_memory", "assistant")];

/// Tuning knobs for [`SqliteStore`].
#[derive(Debug, Clone)]
pub struct SqliteStoreOptions {
    /// Per-conversation row cap enforced after every append
    pub max_rows: usize,
    /// How long a statement waits on another connection's lock
    pub busy_timeout: Duration,
    pub retry: RetryPolicy,
    pub max_connections: u32,
}

impl Default for SqliteStoreOptions {
    fn default() -> Self {
        Self {
            max_rows: 200,
            busy_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            max_connections: 4,
        }
    }
}

impl From<&MemoryConfig> for SqliteStoreOptions {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            max_rows: config.max_rows,
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            retry: RetryPolicy {
                attempts: config.write_retries,
                backoff: Duration::from_millis(config.retry_backoff_ms),
            },
            ..Self::default()
        }
    }
}

/// The production conversation store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    max_rows: usize,
    retry: RetryPolicy,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &Path, options: SqliteStoreOptions) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                MemoryError::Storage(format!("Cannot create {}: {e}", parent.display()))
            })?;
        }

        let connect = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .acquire_timeout(options.busy_timeout)
            .connect_with(connect)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self {
            pool,
            max_rows: options.max_rows,
            retry: options.retry,
        };
        store.run_migrations().await?;
        store.import_legacy_tables().await;
        info!(path = %path.display(), max_rows = store.max_rows, "SQLite conversation store ready");
        Ok(store)
    }

    /// Open the store described by the memory configuration.
    pub async fn from_config(config: &MemoryConfig) -> Result<Self, MemoryError> {
        Self::open(&config.path, SqliteStoreOptions::from(config)).await
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// Create tables, the ordering index and the retention row.
    async fn run_migrations(&self) -> Result<(), MemoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_memory (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                uid         TEXT NOT NULL,
                role        TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content     TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::MigrationFailed(format!("conversation_memory table: {e}")))?;

        // Serves both the recent-context read and the retention trim.
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversation_memory_uid_created \
             ON conversation_memory(uid, created_at, id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::MigrationFailed(format!("uid/created_at index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS retention_state (
                id                  INTEGER PRIMARY KEY CHECK (id = 1),
                last_compaction_at  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::MigrationFailed(format!("retention_state table: {e}")))?;

        sqlx::query("INSERT OR IGNORE INTO retention_state (id, last_compaction_at) VALUES (1, 0)")
            .execute(&self.pool)
            .await
            .map_err(|e| MemoryError::MigrationFailed(format!("retention_state row: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// Copy turns from the old per-role tables into an empty store.
    ///
    /// Runs as a single statement guarded by `NOT EXISTS`, so concurrent
    /// workers opening the same file import at most once. Failures are
    /// logged and otherwise ignored.
    async fn import_legacy_tables(&self) {
        let present = match sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name IN ('user_memory', 'assistant_memory')",
        )
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows
                .iter()
                .filter_map(|r| r.try_get::<String, _>("name").ok())
                .collect::<Vec<_>>(),
            Err(e) => {
                warn!("Legacy memory import skipped: {e}");
                return;
            }
        };

        let selects: Vec<String> = LEGACY_TABLES
            .iter()
            .enumerate()
            .filter(|(_, (table, _))| present.iter().any(|p| p == table))
            .map(|(ord, (table, role))| {
                format!(
                    "SELECT uid, '{role}' AS role, content, \
                     COALESCE(CAST(strftime('%s', created_at) AS INTEGER) * 1000, 0) AS ts, \
                     {ord} AS ord, rowid AS seq FROM {table}"
                )
            })
            .collect();

        if selects.is_empty() {
            return;
        }

        let sql = format!(
            "INSERT INTO conversation_memory (uid, role, content, created_at) \
             SELECT uid, role, content, ts FROM ({}) \
             WHERE NOT EXISTS (SELECT 1 FROM conversation_memory) \
             ORDER BY ts, ord, seq",
            selects.join(" UNION ALL ")
        );

        match sqlx::query(&sql).execute(&self.pool).await {
            Ok(done) if done.rows_affected() > 0 => {
                info!(rows = done.rows_affected(), "Imported legacy conversation memory")
            }
            Ok(_) => {}
            Err(e) => warn!("Legacy memory import skipped: {e}"),
        }
    }

    /// Force the persisted compaction marker to `at`.
    pub async fn mark_compacted(&self, at: DateTime<Utc>) -> Result<(), MemoryError> {
        let pool = &self.pool;
        with_retry(self.retry, "mark compacted", || async move {
            sqlx::query("UPDATE retention_state SET last_compaction_at = ?1 WHERE id = 1")
                .bind(at.timestamp_millis())
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<MemoryRecord, MemoryError> {
        let uid: String = row
            .try_get("uid")
            .map_err(|e| MemoryError::QueryFailed(format!("uid column: {e}")))?;
        let role: String = row
            .try_get("role")
            .map_err(|e| MemoryError::QueryFailed(format!("role column: {e}")))?;
        let content: String = row
            .try_get("content")
            .map_err(|e| MemoryError::QueryFailed(format!("content column: {e}")))?;
        let created_at: i64 = row
            .try_get("created_at")
            .map_err(|e| MemoryError::QueryFailed(format!("created_at column: {e}")))?;

        Ok(MemoryRecord {
            conversation_id: ConversationId(uid),
            role: role.parse()?,
            content,
            created_at: millis_to_datetime(created_at),
        })
    }

    /// Insert `turns` in order and trim the conversation, in one transaction.
    async fn write_turns(
        pool: &SqlitePool,
        uid: &str,
        turns: &[(TurnRole, String)],
        max_rows: usize,
    ) -> Result<u64, sqlx::Error> {
        let mut tx = pool.begin().await?;

        // The write comes first so the lock is taken before any snapshot is read.
        for (role, content) in turns {
            sqlx::query(
                r#"
                INSERT INTO conversation_memory (uid, role, content, created_at)
                VALUES (?1, ?2, ?3, MAX(?4, COALESCE(
                    (SELECT MAX(created_at) FROM conversation_memory WHERE uid = ?1), 0)))
                "#,
            )
            .bind(uid)
            .bind(role.as_str())
            .bind(content.as_str())
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        let count = count_rows(&mut tx, uid).await?;
        let removed = if count > max_rows as i64 {
            trim_rows(&mut tx, uid, max_rows).await?
        } else {
            0
        };

        tx.commit().await?;
        Ok(removed)
    }

    /// Run [`Self::write_turns`] on its own task so that dropping the
    /// caller's future cannot leave the write half-applied.
    async fn spawn_write(
        &self,
        conversation_id: &ConversationId,
        turns: Vec<(TurnRole, String)>,
    ) -> Result<(), MemoryError> {
        if turns.is_empty() {
            debug!(conversation = %conversation_id, "Skipping empty turn");
            return Ok(());
        }

        let pool = self.pool.clone();
        let retry = self.retry;
        let max_rows = self.max_rows;
        let uid = conversation_id.0.clone();

        let task = tokio::spawn(async move {
            with_retry(retry, "append", || {
                Self::write_turns(&pool, &uid, &turns, max_rows)
            })
            .await
        });

        let removed = task
            .await
            .map_err(|e| MemoryError::Storage(format!("append task failed: {e}")))??;

        if removed > 0 {
            debug!(conversation = %conversation_id, removed, "Trimmed oldest turns");
        }
        Ok(())
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

async fn count_rows(conn: &mut SqliteConnection, uid: &str) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS cnt FROM conversation_memory WHERE uid = ?1")
        .bind(uid)
        .fetch_one(&mut *conn)
        .await?;
    row.try_get("cnt")
}

async fn trim_rows(
    conn: &mut SqliteConnection,
    uid: &str,
    keep: usize,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        r#"
        DELETE FROM conversation_memory
        WHERE uid = ?1 AND id NOT IN (
            SELECT id FROM conversation_memory
            WHERE uid = ?1
            ORDER BY created_at DESC, id DESC
            LIMIT ?2
        )
        "#,
    )
    .bind(uid)
    .bind(keep as i64)
    .execute(&mut *conn)
    .await?;
    Ok(done.rows_affected())
}

#[async_trait]
impl ConversationStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn recent_context(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let pool = &self.pool;
        let uid = conversation_id.as_str();
        let rows = with_retry(self.retry, "recent context", || async move {
            sqlx::query(
                "SELECT uid, role, content, created_at FROM conversation_memory \
                 WHERE uid = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )
            .bind(uid)
            .bind(limit as i64)
            .fetch_all(pool)
            .await
        })
        .await?;

        let mut records = rows
            .iter()
            .map(Self::row_to_record)
            .collect::<Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }

    async fn append(
        &self,
        conversation_id: &ConversationId,
        role: TurnRole,
        content: &str,
    ) -> Result<(), MemoryError> {
        let turns = if content.trim().is_empty() {
            Vec::new()
        } else {
            vec![(role, content.to_string())]
        };
        self.spawn_write(conversation_id, turns).await
    }

    async fn append_exchange(
        &self,
        conversation_id: &ConversationId,
        question: &str,
        answer: &str,
    ) -> Result<(), MemoryError> {
        let turns = exchange_turns(question, answer)
            .into_iter()
            .map(|(role, content)| (role, content.to_string()))
            .collect();
        self.spawn_write(conversation_id, turns).await
    }

    async fn row_count(&self, conversation_id: &ConversationId) -> Result<usize, MemoryError> {
        let pool = &self.pool;
        let uid = conversation_id.as_str();
        let count = with_retry(self.retry, "row count", || async move {
            let mut conn = pool.acquire().await?;
            count_rows(&mut conn, uid).await
        })
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn trim_oldest(
        &self,
        conversation_id: &ConversationId,
        keep: usize,
    ) -> Result<usize, MemoryError> {
        let pool = &self.pool;
        let uid = conversation_id.as_str();
        let removed = with_retry(self.retry, "trim", || async move {
            let mut conn = pool.acquire().await?;
            trim_rows(&mut conn, uid, keep).await
        })
        .await?;
        Ok(removed as usize)
    }
}

#[async_trait]
impl RetentionStore for SqliteStore {
    async fn last_compaction_at(&self) -> Result<Option<DateTime<Utc>>, MemoryError> {
        let pool = &self.pool;
        let ms: i64 = with_retry(self.retry, "read retention state", || async move {
            sqlx::query("SELECT last_compaction_at FROM retention_state WHERE id = 1")
                .fetch_optional(pool)
                .await?
                .map(|row| row.try_get::<i64, _>("last_compaction_at"))
                .transpose()
                .map(|v| v.unwrap_or(0))
        })
        .await?;

        Ok((ms > 0).then(|| millis_to_datetime(ms)))
    }

    async fn try_claim_compaction(
        &self,
        now: DateTime<Utc>,
        due_before: DateTime<Utc>,
    ) -> Result<bool, MemoryError> {
        let pool = &self.pool;
        let done = with_retry(self.retry, "claim compaction", || async move {
            sqlx::query(
                "UPDATE retention_state SET last_compaction_at = ?1 \
                 WHERE id = 1 AND last_compaction_at <= ?2",
            )
            .bind(now.timestamp_millis())
            .bind(due_before.timestamp_millis())
            .execute(pool)
            .await
        })
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn release_compaction_claim(
        &self,
        claimed: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> Result<(), MemoryError> {
        let pool = &self.pool;
        let previous_ms = previous.map(|p| p.timestamp_millis()).unwrap_or(0);
        with_retry(self.retry, "release compaction claim", || async move {
            sqlx::query(
                "UPDATE retention_state SET last_compaction_at = ?1 \
                 WHERE id = 1 AND last_compaction_at = ?2",
            )
            .bind(previous_ms)
            .bind(claimed.timestamp_millis())
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    async fn compact(&self) -> Result<(), MemoryError> {
        let pool = &self.pool;
        with_retry(self.retry, "vacuum", || async move {
            sqlx::query("VACUUM").execute(pool).await
        })
        .await?;
        Ok(())
    }
}
