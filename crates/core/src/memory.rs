//! Memory traits: the bounded, per-conversation log of turns.
//!
//! The conversation store keeps the most recent user and assistant turns of
//! every conversation so they can be replayed to the model as dialogue
//! history. Each conversation is capped at a configured number of rows;
//! the oldest rows are trimmed after every append.
//!
//! Storage-level compaction (reclaiming pages freed by trimming) is a
//! separate concern exposed through [`RetentionStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use crate::error::MemoryError;
use crate::message::{ConversationId, Role};

/// Who produced a persisted turn. Only user and assistant turns are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TurnRole {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "user" => Ok(TurnRole::User),
            "assistant" => Ok(TurnRole::Assistant),
            other => Err(MemoryError::InvalidRole(other.to_string())),
        }
    }
}

impl From<TurnRole> for Role {
    fn from(role: TurnRole) -> Self {
        match role {
            TurnRole::User => Role::User,
            TurnRole::Assistant => Role::Assistant,
        }
    }
}

/// The non-blank sides of a question/answer exchange, in write order.
pub fn exchange_turns<'a>(question: &'a str, answer: &'a str) -> Vec<(TurnRole, &'a str)> {
    [(TurnRole::User, question), (TurnRole::Assistant, answer)]
        .into_iter()
        .filter(|(_, content)| !content.trim().is_empty())
        .collect()
}

/// One conversational turn. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub conversation_id: ConversationId,
    pub role: TurnRole,
    pub content: String,
    /// Non-decreasing within a conversation; ties keep insertion order.
    pub created_at: DateTime<Utc>,
}

/// The per-conversation turn log.
///
/// Implementations: SQLite (shared by worker processes), in-memory (tests),
/// disabled (memory turned off, context supplied by the caller).
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory", "disabled").
    fn name(&self) -> &str;

    /// Whether reads and writes reach storage at all.
    fn is_enabled(&self) -> bool {
        true
    }

    /// The `limit` most recent turns, oldest first.
    async fn recent_context(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> std::result::Result<Vec<MemoryRecord>, MemoryError>;

    /// Persist a turn, then trim the conversation back to the row cap.
    ///
    /// Blank content is ignored.
    async fn append(
        &self,
        conversation_id: &ConversationId,
        role: TurnRole,
        content: &str,
    ) -> std::result::Result<(), MemoryError>;

    /// Persist a question and its answer as one write, then trim to the row cap.
    ///
    /// Either both turns are stored or neither is. A blank side is skipped.
    async fn append_exchange(
        &self,
        conversation_id: &ConversationId,
        question: &str,
        answer: &str,
    ) -> std::result::Result<(), MemoryError>;

    /// Number of turns currently kept for a conversation.
    async fn row_count(
        &self,
        conversation_id: &ConversationId,
    ) -> std::result::Result<usize, MemoryError>;

    /// Delete the oldest turns until at most `keep` remain. Returns how many were removed.
    async fn trim_oldest(
        &self,
        conversation_id: &ConversationId,
        keep: usize,
    ) -> std::result::Result<usize, MemoryError>;
}

/// Persisted compaction bookkeeping, shared by every process using the store.
#[async_trait]
pub trait RetentionStore: Send + Sync {
    /// When the last compaction was claimed, or `None` if never.
    async fn last_compaction_at(&self) -> std::result::Result<Option<DateTime<Utc>>, MemoryError>;

    /// Atomically move the compaction marker to `now` if it is at or before
    /// `due_before`. Returns `true` only for the caller that moved it.
    async fn try_claim_compaction(
        &self,
        now: DateTime<Utc>,
        due_before: DateTime<Utc>,
    ) -> std::result::Result<bool, MemoryError>;

    /// Put the marker back to `previous` if it still holds `claimed`.
    async fn release_compaction_claim(
        &self,
        claimed: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> std::result::Result<(), MemoryError>;

    /// Reclaim space freed by deleted rows.
    async fn compact(&self) -> std::result::Result<(), MemoryError>;
}
