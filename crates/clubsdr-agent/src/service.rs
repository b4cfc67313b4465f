//! Turn service: load state, run one turn under a deadline, save state

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::error::{Error, Result};
use crate::state::ConversationState;
use crate::store::StateStore;

/// Default per-turn deadline
pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(60);

/// An inbound fan message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub message: String,
}

impl TurnRequest {
    pub fn new(conversation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message: message.into(),
        }
    }
}

/// The agent's answer plus the lead facts known after the turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnReply {
    pub reply: String,
    pub name: Option<String>,
    pub plan: Option<String>,
}

/// Runs turns for many conversations, one at a time per conversation
pub struct TurnService {
    agent: Arc<Agent>,
    states: Arc<dyn StateStore>,
    turn_timeout: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TurnService {
    pub fn new(agent: Arc<Agent>, states: Arc<dyn StateStore>) -> Self {
        Self {
            agent,
            states,
            turn_timeout: DEFAULT_TURN_TIMEOUT,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Set the per-turn deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Load the saved state for a conversation
    pub async fn load_state(&self, conversation_id: &str) -> Result<Option<ConversationState>> {
        self.states.load(conversation_id).await
    }

    fn lock_for(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the lock entry once no other turn holds or waits on it
    fn release_lock(&self, conversation_id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        let is_current = locks
            .get(conversation_id)
            .is_some_and(|current| Arc::ptr_eq(current, lock));
        // One reference in the map, one in the caller's guard
        if is_current && Arc::strong_count(lock) <= 2 {
            locks.remove(conversation_id);
        }
    }

    /// Run one turn
    pub async fn submit_turn(&self, request: TurnRequest) -> Result<TurnReply> {
        self.submit_turn_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Run one turn, aborting when `cancel` fires or the deadline passes.
    ///
    /// State is saved only after a successful turn.
    pub async fn submit_turn_with_cancel(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnReply> {
        let conversation_id = request.conversation_id.trim().to_string();
        if conversation_id.is_empty() {
            return Err(Error::InvalidRequest("conversation_id must not be empty".into()));
        }

        // Declared first so the turn's mutex guard drops before it, even when
        // this future is dropped mid-turn
        let entry = LockEntry {
            service: self,
            lock: self.lock_for(&conversation_id),
            conversation_id: &conversation_id,
        };
        let _guard = entry.lock.lock().await;
        self.run_locked(&conversation_id, request.message, cancel)
            .await
    }

    async fn run_locked(
        &self,
        conversation_id: &str,
        message: String,
        cancel: CancellationToken,
    ) -> Result<TurnReply> {
        let state = self
            .states
            .load(conversation_id)
            .await?
            .unwrap_or_else(|| ConversationState::new(conversation_id));

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(conversation_id, "Turn cancelled");
                return Err(Error::Cancelled);
            }
            result = tokio::time::timeout(
                self.turn_timeout,
                self.agent.run_turn(state, message),
            ) => {
                match result {
                    Ok(outcome) => outcome?,
                    Err(_) => {
                        tracing::warn!(
                            conversation_id,
                            timeout = ?self.turn_timeout,
                            "Turn timed out"
                        );
                        return Err(Error::Timeout(self.turn_timeout));
                    }
                }
            }
        };

        if let Err(e) = self.states.save(&outcome.state).await {
            tracing::warn!(conversation_id, "Failed to save conversation state: {}", e);
        }

        Ok(TurnReply {
            reply: outcome.reply,
            name: outcome.state.lead.name,
            plan: outcome.state.lead.plan_interest,
        })
    }
}

/// A conversation's lock entry, released from the map on drop
struct LockEntry<'a> {
    service: &'a TurnService,
    conversation_id: &'a str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for LockEntry<'_> {
    fn drop(&mut self) {
        self.service.release_lock(self.conversation_id, &self.lock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::agent::tests::{MockModel, ScriptedRetriever, harness};
    use crate::knowledge::StaticCatalog;
    use crate::store::{InMemoryLeadStore, InMemoryStateStore};
    use crate::transport::{InferenceRequest, LanguageModel};
    use async_trait::async_trait;
    use clubsdr_ai::{Message, OutputSchema};

    fn no_lead() -> serde_json::Value {
        serde_json::json!({"intent_is_sale": false, "name": null, "plan": null})
    }

    struct SlowModel;

    #[async_trait]
    impl LanguageModel for SlowModel {
        async fn complete(&self, _request: &InferenceRequest) -> Result<Message> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(Message::assistant_text("too late"))
        }

        async fn structured(
            &self,
            _request: &InferenceRequest,
            _schema: &OutputSchema,
        ) -> Result<serde_json::Value> {
            Ok(no_lead())
        }
    }

    fn service_with(model: MockModel) -> (TurnService, Arc<InMemoryStateStore>) {
        let h = harness(model, ScriptedRetriever::default());
        let states = Arc::new(InMemoryStateStore::new());
        (TurnService::new(Arc::new(h.agent), states.clone()), states)
    }

    #[tokio::test]
    async fn test_turn_saves_state() {
        let (service, states) =
            service_with(MockModel::new().reply("Olá, Marcos!").json(serde_json::json!({
                "intent_is_sale": true, "name": "Marcos", "plan": null
            })));

        let reply = service
            .submit_turn(TurnRequest::new("A", "Oi, sou o Marcos"))
            .await
            .unwrap();
        assert_eq!(
            reply,
            TurnReply {
                reply: "Olá, Marcos!".into(),
                name: Some("Marcos".into()),
                plan: None,
            }
        );

        let saved = states.load("A").await.unwrap().unwrap();
        assert_eq!(saved.history.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_turn_saves_nothing() {
        let (service, states) = service_with(MockModel::new().fail());
        let result = service.submit_turn(TurnRequest::new("A", "oi")).await;
        assert!(result.is_err());
        assert!(states.load("A").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_closed() {
        let agent = Agent::with_search(
            AgentConfig::default(),
            Arc::new(SlowModel),
            Arc::new(ScriptedRetriever::default()),
            Arc::new(StaticCatalog::default()),
            Arc::new(InMemoryLeadStore::new()),
        );
        let states = Arc::new(InMemoryStateStore::new());
        let service = TurnService::new(Arc::new(agent), states.clone())
            .with_timeout(Duration::from_secs(5));

        let result = service.submit_turn(TurnRequest::new("A", "oi")).await;
        assert!(matches!(result, Err(Error::Timeout(d)) if d == Duration::from_secs(5)));
        assert!(states.load("A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_turn_saves_nothing() {
        let (service, states) = service_with(MockModel::new().reply("Olá!").json(no_lead()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = service
            .submit_turn_with_cancel(TurnRequest::new("A", "oi"), cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(states.load("A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_conversation_turns_do_not_interleave() {
        let (service, states) = service_with(
            MockModel::new()
                .reply("primeira")
                .json(no_lead())
                .reply("segunda")
                .json(no_lead()),
        );

        let (a, b) = tokio::join!(
            service.submit_turn(TurnRequest::new("A", "um")),
            service.submit_turn(TurnRequest::new("A", "dois")),
        );
        a.unwrap();
        b.unwrap();

        let saved = states.load("A").await.unwrap().unwrap();
        assert_eq!(saved.history.len(), 4);
        assert!(service.locks.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_turn_releases_its_lock() {
        let agent = Agent::with_search(
            AgentConfig::default(),
            Arc::new(SlowModel),
            Arc::new(ScriptedRetriever::default()),
            Arc::new(StaticCatalog::default()),
            Arc::new(InMemoryLeadStore::new()),
        );
        let service = TurnService::new(Arc::new(agent), Arc::new(InMemoryStateStore::new()));

        // The caller gives up long before the turn deadline
        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            service.submit_turn(TurnRequest::new("A", "oi")),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(service.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_blank_conversation_id_is_rejected() {
        let (service, _) = service_with(MockModel::new());
        let result = service.submit_turn(TurnRequest::new("  ", "oi")).await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }
}
