//! Persistence ports: the lead table and conversation state

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::state::ConversationState;

/// Placeholder stored when the fan's name is unknown
pub const DEFAULT_LEAD_NAME: &str = "interested fan";
/// Placeholder stored when no plan has been chosen
pub const DEFAULT_LEAD_PLAN: &str = "undecided";

/// A persisted lead row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadRecord {
    pub conversation_id: String,
    pub name: String,
    pub plan: String,
    pub converted: bool,
}

impl LeadRecord {
    /// Build a record, falling back to placeholders for unknown fields
    pub fn new(conversation_id: &str, name: Option<&str>, plan: Option<&str>) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            name: name.unwrap_or(DEFAULT_LEAD_NAME).to_string(),
            plan: plan.unwrap_or(DEFAULT_LEAD_PLAN).to_string(),
            converted: false,
        }
    }
}

/// Lead table keyed by conversation id
#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Insert or replace the row for `record.conversation_id`
    async fn upsert(&self, record: &LeadRecord) -> Result<()>;
}

/// Conversation state persistence keyed by conversation id
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>>;
    async fn save(&self, state: &ConversationState) -> Result<()>;
}

/// Lead store held in memory
#[derive(Debug, Default)]
pub struct InMemoryLeadStore {
    rows: Mutex<HashMap<String, LeadRecord>>,
    upserts: Mutex<usize>,
}

impl InMemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation_id: &str) -> Option<LeadRecord> {
        self.rows.lock().get(conversation_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Number of upsert calls received
    pub fn upsert_count(&self) -> usize {
        *self.upserts.lock()
    }
}

#[async_trait]
impl LeadStore for InMemoryLeadStore {
    async fn upsert(&self, record: &LeadRecord) -> Result<()> {
        *self.upserts.lock() += 1;
        self.rows
            .lock()
            .insert(record.conversation_id.clone(), record.clone());
        Ok(())
    }
}

/// State store held in memory
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: Mutex<HashMap<String, ConversationState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>> {
        Ok(self.states.lock().get(conversation_id).cloned())
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        self.states
            .lock()
            .insert(state.conversation_id.clone(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_placeholders() {
        let record = LeadRecord::new("A", None, Some("Gold"));
        assert_eq!(record.name, DEFAULT_LEAD_NAME);
        assert_eq!(record.plan, "Gold");
        assert!(!record.converted);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_per_key() {
        let store = InMemoryLeadStore::new();
        let record = LeadRecord::new("A", Some("Marcos"), Some("Gold"));
        store.upsert(&record).await.unwrap();
        store.upsert(&record).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.upsert_count(), 2);
        assert_eq!(store.get("A"), Some(record));
    }

    #[tokio::test]
    async fn test_state_store_round_trip() {
        let store = InMemoryStateStore::new();
        assert!(store.load("A").await.unwrap().is_none());
        let state = ConversationState::new("A");
        store.save(&state).await.unwrap();
        assert_eq!(store.load("A").await.unwrap(), Some(state));
    }
}
