//! In-memory conversation store: useful for testing and single-process runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use esquire_core::error::MemoryError;
use esquire_core::memory::{
    ConversationStore, MemoryRecord, RetentionStore, TurnRole, exchange_turns,
};
use esquire_core::message::ConversationId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};

/// Keeps every conversation in a `Vec`, oldest first, capped at `max_rows`.
pub struct InMemoryStore {
    conversations: RwLock<HashMap<ConversationId, Vec<MemoryRecord>>>,
    max_rows: usize,
    last_compaction: Mutex<Option<DateTime<Utc>>>,
    compactions: AtomicUsize,
}

impl InMemoryStore {
    pub fn new(max_rows: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            max_rows,
            last_compaction: Mutex::new(None),
            compactions: AtomicUsize::new(0),
        }
    }

    /// How many times `compact` has run.
    pub fn compactions(&self) -> usize {
        self.compactions.load(Ordering::SeqCst)
    }

    /// Append `turns` and trim, all under one write lock.
    async fn push_turns(&self, id: &ConversationId, turns: &[(TurnRole, &str)]) {
        if turns.is_empty() {
            return;
        }

        let mut conversations = self.conversations.write().await;
        let records = conversations.entry(id.clone()).or_default();
        for (role, content) in turns {
            let now = Utc::now();
            let created_at = records.last().map_or(now, |last| last.created_at.max(now));
            records.push(MemoryRecord {
                conversation_id: id.clone(),
                role: *role,
                content: content.to_string(),
                created_at,
            });
        }
        Self::trim(records, self.max_rows);
    }

    fn trim(records: &mut Vec<MemoryRecord>, keep: usize) -> usize {
        let excess = records.len().saturating_sub(keep);
        records.drain(..excess);
        excess
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(200)
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn recent_context(
        &self,
        id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(id)
            .map(|records| {
                let start = records.len().saturating_sub(limit);
                records[start..].to_vec()
            })
            .unwrap_or_default())
    }

    async fn append(
        &self,
        id: &ConversationId,
        role: TurnRole,
        content: &str,
    ) -> Result<(), MemoryError> {
        if content.trim().is_empty() {
            return Ok(());
        }
        self.push_turns(id, &[(role, content)]).await;
        Ok(())
    }

    async fn append_exchange(
        &self,
        id: &ConversationId,
        question: &str,
        answer: &str,
    ) -> Result<(), MemoryError> {
        self.push_turns(id, &exchange_turns(question, answer)).await;
        Ok(())
    }

    async fn row_count(&self, id: &ConversationId) -> Result<usize, MemoryError> {
        Ok(self.conversations.read().await.get(id).map_or(0, Vec::len))
    }

    async fn trim_oldest(&self, id: &ConversationId, keep: usize) -> Result<usize, MemoryError> {
        let mut conversations = self.conversations.write().await;
        Ok(conversations
            .get_mut(id)
            .map_or(0, |records| Self::trim(records, keep)))
    }
}

#[async_trait]
impl RetentionStore for InMemoryStore {
    async fn last_compaction_at(&self) -> Result<Option<DateTime<Utc>>, MemoryError> {
        Ok(*self.last_compaction.lock().await)
    }

    async fn try_claim_compaction(
        &self,
        now: DateTime<Utc>,
        due_before: DateTime<Utc>,
    ) -> Result<bool, MemoryError> {
        let mut last = self.last_compaction.lock().await;
        match *last {
            Some(at) if at > due_before => Ok(false),
            _ => {
                *last = Some(now);
                Ok(true)
            }
        }
    }

    async fn release_compaction_claim(
        &self,
        claimed: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> Result<(), MemoryError> {
        let mut last = self.last_compaction.lock().await;
        if *last == Some(claimed) {
            *last = previous;
        }
        Ok(())
    }

    async fn compact(&self) -> Result<(), MemoryError> {
        self.compactions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keeps_last_turns_in_order() {
        let store = InMemoryStore::new(3);
        let id = ConversationId::from("uid");
        for i in 0..5 {
            store.append(&id, TurnRole::User, &format!("turn {i}")).await.unwrap();
        }
        let records = store.recent_context(&id, 2).await.unwrap();
        assert_eq!(records[0].content, "turn 3");
        assert_eq!(records[1].content, "turn 4");
        assert_eq!(store.row_count(&id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn trim_is_idempotent() {
        let store = InMemoryStore::new(10);
        let id = ConversationId::from("uid");
        for i in 0..4 {
            store.append(&id, TurnRole::Assistant, &format!("a{i}")).await.unwrap();
        }
        assert_eq!(store.trim_oldest(&id, 1).await.unwrap(), 3);
        assert_eq!(store.trim_oldest(&id, 1).await.unwrap(), 0);
        assert_eq!(store.trim_oldest(&ConversationId::from("other"), 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exchange_is_trimmed_as_one_write() {
        let store = InMemoryStore::new(3);
        let id = ConversationId::from("uid");
        store.append_exchange(&id, "q0", "a0").await.unwrap();
        store.append_exchange(&id, "q1", "a1").await.unwrap();

        let records = store.recent_context(&id, 10).await.unwrap();
        let contents: Vec<&str> = records.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["a0", "q1", "a1"]);
        assert_eq!(records[1].role, TurnRole::User);
    }

    #[tokio::test]
    async fn claim_respects_due_time() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        let due_before = now - chrono::Duration::hours(1);
        assert!(store.try_claim_compaction(now, due_before).await.unwrap());
        assert!(!store.try_claim_compaction(now, due_before).await.unwrap());
        assert_eq!(store.last_compaction_at().await.unwrap(), Some(now));
    }
}
