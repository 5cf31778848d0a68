//! Disabled memory: server-side history turned off.
//!
//! Reads always come back empty and writes are dropped; the caller is
//! expected to supply the conversation history itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use esquire_core::error::MemoryError;
use esquire_core::memory::{ConversationStore, MemoryRecord, RetentionStore, TurnRole};
use esquire_core::message::ConversationId;

/// A conversation store that stores nothing.
pub struct DisabledMemory;

#[async_trait]
impl ConversationStore for DisabledMemory {
    fn name(&self) -> &str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn recent_context(
        &self,
        _id: &ConversationId,
        _limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        Ok(Vec::new())
    }

    async fn append(
        &self,
        _id: &ConversationId,
        _role: TurnRole,
        _content: &str,
    ) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn append_exchange(
        &self,
        _id: &ConversationId,
        _question: &str,
        _answer: &str,
    ) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn row_count(&self, _id: &ConversationId) -> Result<usize, MemoryError> {
        Ok(0)
    }

    async fn trim_oldest(&self, _id: &ConversationId, _keep: usize) -> Result<usize, MemoryError> {
        Ok(0)
    }
}

#[async_trait]
impl RetentionStore for DisabledMemory {
    async fn last_compaction_at(&self) -> Result<Option<DateTime<Utc>>, MemoryError> {
        Ok(None)
    }

    async fn try_claim_compaction(
        &self,
        _now: DateTime<Utc>,
        _due_before: DateTime<Utc>,
    ) -> Result<bool, MemoryError> {
        Ok(false)
    }

    async fn release_compaction_claim(
        &self,
        _claimed: DateTime<Utc>,
        _previous: Option<DateTime<Utc>>,
    ) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn compact(&self) -> Result<(), MemoryError> {
        Ok(())
    }
}
