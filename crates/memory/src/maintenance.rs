//! Periodic storage compaction.
//!
//! After each committed append the scheduler checks the persisted
//! compaction marker. When the interval has elapsed, exactly one caller
//! (across all processes sharing the file) wins the marker and runs
//! `VACUUM`. Everything here is best-effort: failures are logged and never
//! reach the request path.

use chrono::{DateTime, Duration, Utc};
use esquire_config::MIN_VACUUM_INTERVAL_HOURS;
use esquire_core::memory::RetentionStore;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a call to [`MaintenanceScheduler::maybe_compact`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// The interval has not elapsed, or another caller already claimed it.
    NotDue,
    Compacted,
    /// Compaction was attempted and failed; the error was logged.
    Failed,
}

pub struct MaintenanceScheduler {
    retention: Arc<dyn RetentionStore>,
    interval: Duration,
}

impl MaintenanceScheduler {
    /// `interval_hours` below the one-hour floor is raised to it.
    pub fn new(retention: Arc<dyn RetentionStore>, interval_hours: u64) -> Self {
        // Upper clamp keeps chrono's hour conversion in range.
        let hours = interval_hours.clamp(MIN_VACUUM_INTERVAL_HOURS, 1_000_000);
        Self {
            retention,
            interval: Duration::hours(hours as i64),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn maybe_compact(&self) -> CompactionOutcome {
        self.maybe_compact_at(Utc::now()).await
    }

    /// Compact if the last compaction is at least one interval before `now`.
    pub async fn maybe_compact_at(&self, now: DateTime<Utc>) -> CompactionOutcome {
        let previous = match self.retention.last_compaction_at().await {
            Ok(previous) => previous,
            Err(e) => {
                warn!("Compaction check failed: {e}");
                return CompactionOutcome::Failed;
            }
        };

        if let Some(last) = previous {
            if now - last < self.interval {
                return CompactionOutcome::NotDue;
            }
        }

        self.claim_and_compact(now, now - self.interval, previous).await
    }

    /// Compact now regardless of the interval. The marker is still claimed,
    /// so a forced run and a scheduled one cannot both win the same instant.
    pub async fn force_compact(&self) -> CompactionOutcome {
        let now = Utc::now();
        match self.retention.last_compaction_at().await {
            Ok(previous) => self.claim_and_compact(now, now, previous).await,
            Err(e) => {
                warn!("Compaction check failed: {e}");
                CompactionOutcome::Failed
            }
        }
    }

    async fn claim_and_compact(
        &self,
        now: DateTime<Utc>,
        due_before: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> CompactionOutcome {
        match self.retention.try_claim_compaction(now, due_before).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Compaction already claimed by another worker");
                return CompactionOutcome::NotDue;
            }
            Err(e) => {
                warn!("Compaction claim failed: {e}");
                return CompactionOutcome::Failed;
            }
        }

        match self.retention.compact().await {
            Ok(()) => {
                info!("Conversation store compacted");
                CompactionOutcome::Compacted
            }
            Err(e) => {
                warn!("Compaction failed: {e}");
                // Let the next append try again instead of waiting a full interval.
                if let Err(e) = self.retention.release_compaction_claim(now, previous).await {
                    warn!("Could not release compaction claim: {e}");
                }
                CompactionOutcome::Failed
            }
        }
    }

    /// Run [`maybe_compact`](Self::maybe_compact) on a detached task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<CompactionOutcome> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.maybe_compact().await })
    }
}
