//! Turn orchestration: runs the graph once per inbound message

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use clubsdr_ai::Message;

use crate::{
    compaction::{self, CompactionConfig},
    error::{Error, Result},
    events::AgentEvent,
    graph::{ENTRY, Node, Signal},
    grounding, lead,
    knowledge::{KnowledgeSearchTool, ProductCatalog, ProductSearchTool, Retriever},
    prompt::Persona,
    responder,
    state::{ConversationState, StateUpdate},
    store::LeadStore,
    synthesis,
    tool::{BoxedTool, ToolRegistry},
    transport::SharedModel,
};

/// Upper bound on graph steps in one turn. The longest valid path
/// (compact, respond, tools, grade, rewrite, respond, tools, grade,
/// synthesize, extract) is 10 steps.
pub const MAX_STEPS: usize = 16;

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub persona: Persona,
    /// History compaction configuration
    pub compaction: CompactionConfig,
    /// Messages shown to the lead extractor
    pub lead_window: usize,
    /// Maximum tokens per response
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            persona: Persona::default(),
            compaction: CompactionConfig::default(),
            lead_window: 12,
            max_tokens: Some(1024),
            temperature: Some(0.7),
        }
    }
}

/// Result of one turn
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// State after the turn, to be saved by the caller
    pub state: ConversationState,
    /// Text of the reply sent to the fan
    pub reply: String,
    /// Graph steps taken
    pub steps: usize,
}

/// The sales agent: one graph, shared by every conversation
pub struct Agent {
    config: AgentConfig,
    model: SharedModel,
    tools: ToolRegistry,
    lead_store: Arc<dyn LeadStore>,
    event_tx: broadcast::Sender<AgentEvent>,
}

impl Agent {
    /// Create a new agent
    pub fn new(
        config: AgentConfig,
        model: SharedModel,
        tools: Vec<BoxedTool>,
        lead_store: Arc<dyn LeadStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            model,
            tools: ToolRegistry::new(tools),
            lead_store,
            event_tx,
        }
    }

    /// Create an agent offering `search_knowledge` and `search_products`
    pub fn with_search(
        config: AgentConfig,
        model: SharedModel,
        retriever: Arc<dyn Retriever>,
        catalog: Arc<dyn ProductCatalog>,
        lead_store: Arc<dyn LeadStore>,
    ) -> Self {
        let tools: Vec<BoxedTool> = vec![
            Arc::new(KnowledgeSearchTool::new(retriever)),
            Arc::new(ProductSearchTool::new(catalog)),
        ];
        Self::new(config, model, tools, lead_store)
    }

    /// Subscribe to agent events
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.event_tx.subscribe()
    }

    /// Get the agent config
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Run one turn for `message` on `state`.
    ///
    /// The state is consumed and returned updated; on error the caller still
    /// holds whatever copy it loaded, so nothing partial is kept.
    pub async fn run_turn(
        &self,
        mut state: ConversationState,
        message: impl Into<String>,
    ) -> Result<TurnOutcome> {
        let message = message.into();
        if message.trim().is_empty() {
            return Err(Error::InvalidRequest("message must not be empty".into()));
        }

        self.emit(AgentEvent::TurnStart {
            conversation_id: state.conversation_id.clone(),
        });
        state.apply(StateUpdate {
            retry_counter: Some(0),
            append: vec![Message::user(message)],
            ..Default::default()
        });

        let mut node = ENTRY;
        let mut steps = 0usize;
        while node != Node::End {
            if steps >= MAX_STEPS {
                let err = Error::StepLimit(MAX_STEPS);
                self.emit(AgentEvent::Error {
                    message: err.to_string(),
                });
                return Err(err);
            }
            steps += 1;
            self.emit(AgentEvent::NodeEnter { node, step: steps });
            tracing::debug!(%node, step = steps, "Entering node");

            let signal = match self.step(node, &mut state).await {
                Ok(signal) => signal,
                Err(e) => {
                    self.emit(AgentEvent::Error {
                        message: e.to_string(),
                    });
                    return Err(e);
                }
            };
            node = node
                .next(signal)
                .ok_or_else(|| Error::Other(format!("no edge from {} on {:?}", node, signal)))?;
        }

        let reply = state
            .last_reply()
            .ok_or_else(|| Error::Other("turn ended without a reply".into()))?;
        self.emit(AgentEvent::TurnEnd { steps });

        Ok(TurnOutcome {
            state,
            reply,
            steps,
        })
    }

    /// Execute one node and apply its update
    async fn step(&self, node: Node, state: &mut ConversationState) -> Result<Signal> {
        let model = self.model.as_ref();
        match node {
            Node::Compact => {
                self.compact(state).await;
                Ok(Signal::Always)
            }
            Node::Respond => {
                let (signal, update) =
                    responder::respond(state, &self.config, &self.tools, model).await?;
                state.apply(update);
                Ok(signal)
            }
            Node::ExecuteTools => {
                let results = self.execute_tool_calls(state).await;
                state.apply(StateUpdate {
                    append: results,
                    ..Default::default()
                });
                Ok(Signal::Always)
            }
            Node::Grade => {
                let (phase, update) = grounding::grade(state, model).await;
                state.apply(update);
                self.emit(AgentEvent::Grounding {
                    phase,
                    retry_counter: state.retry_counter,
                });
                Ok(phase.signal())
            }
            Node::Rewrite => {
                let (query, update) = grounding::rewrite_query(state, model).await;
                state.apply(update);
                self.emit(AgentEvent::QueryRewritten { query });
                Ok(Signal::Always)
            }
            Node::Synthesize => {
                let update = synthesis::synthesize(state, &self.config, model).await?;
                state.apply(update);
                Ok(Signal::Always)
            }
            Node::ExtractLead => {
                let outcome = lead::extract_lead(
                    state,
                    self.config.lead_window,
                    model,
                    self.lead_store.as_ref(),
                )
                .await;
                state.apply(outcome.update);
                self.emit(AgentEvent::LeadUpdated {
                    name: state.lead.name.clone(),
                    plan: state.lead.plan_interest.clone(),
                    intent_is_sale: state.lead.intent_is_sale,
                    persisted: outcome.persisted,
                });
                Ok(Signal::Always)
            }
            Node::End => Err(Error::Other("the end node has no step".into())),
        }
    }

    /// Compact the history if it is over the threshold. Failures leave it untouched.
    async fn compact(&self, state: &mut ConversationState) {
        let delta = compaction::compact(
            &state.history,
            &self.config.compaction,
            self.model.as_ref(),
            &self.config.persona.agent_name,
        )
        .await;
        match delta {
            Ok(Some(delta)) => {
                let removed = delta.removed.len();
                state.apply(StateUpdate {
                    remove: delta.removed,
                    prepend: vec![delta.summary],
                    ..Default::default()
                });
                self.emit(AgentEvent::Compacted {
                    removed,
                    retained: state.history.len() - 1,
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Compaction failed, keeping full history this turn: {}", e);
            }
        }
    }

    /// Run every tool call of the latest assistant message, in order
    async fn execute_tool_calls(&self, state: &ConversationState) -> Vec<Message> {
        let Some(request) = state.history.last() else {
            return Vec::new();
        };

        let mut results = Vec::new();
        for (tool_call_id, tool_name, arguments) in request.tool_calls() {
            self.emit(AgentEvent::ToolExecutionStart {
                tool_call_id: tool_call_id.to_string(),
                tool_name: tool_name.to_string(),
                arguments: arguments.clone(),
            });

            let output = self.tools.execute(tool_name, arguments).await;
            tracing::debug!(tool = tool_name, status = ?output.status, "Tool finished");

            self.emit(AgentEvent::ToolExecutionEnd {
                tool_call_id: tool_call_id.to_string(),
                tool_name: tool_name.to_string(),
                status: output.status,
            });
            results.push(output.into_message(tool_call_id, tool_name));
        }
        results
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::knowledge::{Passage, StaticCatalog};
    use crate::store::InMemoryLeadStore;
    use crate::transport::{InferenceRequest, LanguageModel};
    use async_trait::async_trait;
    use clubsdr_ai::{Content, NoteKind, OutputSchema, UserOrigin};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Language model replaying scripted replies in call order
    #[derive(Default)]
    pub(crate) struct MockModel {
        completions: Mutex<VecDeque<Result<Message>>>,
        structured: Mutex<VecDeque<serde_json::Value>>,
        pub(crate) requests: Mutex<Vec<InferenceRequest>>,
    }

    impl MockModel {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn reply(self, text: &str) -> Self {
            self.completions
                .lock()
                .push_back(Ok(Message::assistant_text(text)));
            self
        }

        pub(crate) fn search(self, tool: &str, query: &str) -> Self {
            let call_id = format!("call_{}", self.completions.lock().len());
            self.completions
                .lock()
                .push_back(Ok(Message::assistant(vec![Content::tool_call(
                    call_id,
                    tool,
                    serde_json::json!({ "query": query }),
                )])));
            self
        }

        pub(crate) fn fail(self) -> Self {
            self.completions
                .lock()
                .push_back(Err(Error::Capability("model offline".into())));
            self
        }

        pub(crate) fn json(self, value: serde_json::Value) -> Self {
            self.structured.lock().push_back(value);
            self
        }

        pub(crate) fn is_drained(&self) -> bool {
            self.completions.lock().is_empty() && self.structured.lock().is_empty()
        }
    }

    #[async_trait]
    impl LanguageModel for MockModel {
        async fn complete(&self, request: &InferenceRequest) -> Result<Message> {
            self.requests.lock().push(request.clone());
            self.completions
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Capability("no scripted completion".into())))
        }

        async fn structured(
            &self,
            request: &InferenceRequest,
            _schema: &OutputSchema,
        ) -> Result<serde_json::Value> {
            self.requests.lock().push(request.clone());
            self.structured
                .lock()
                .pop_front()
                .ok_or_else(|| Error::Capability("no scripted structured reply".into()))
        }
    }

    /// Retriever returning scripted passages per call and counting calls
    #[derive(Default)]
    pub(crate) struct ScriptedRetriever {
        results: Mutex<VecDeque<Vec<Passage>>>,
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl ScriptedRetriever {
        pub(crate) fn returning(results: Vec<Vec<&str>>) -> Self {
            Self {
                results: Mutex::new(
                    results
                        .into_iter()
                        .map(|r| r.into_iter().map(Passage::new).collect())
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Retriever for ScriptedRetriever {
        async fn search(&self, query: &str) -> Result<Vec<Passage>> {
            self.calls.lock().push(query.to_string());
            Ok(self.results.lock().pop_front().unwrap_or_default())
        }
    }

    pub(crate) struct Harness {
        pub(crate) agent: Agent,
        pub(crate) model: Arc<MockModel>,
        pub(crate) retriever: Arc<ScriptedRetriever>,
        pub(crate) leads: Arc<InMemoryLeadStore>,
    }

    pub(crate) fn harness(model: MockModel, retriever: ScriptedRetriever) -> Harness {
        let model = Arc::new(model);
        let retriever = Arc::new(retriever);
        let leads = Arc::new(InMemoryLeadStore::new());
        let agent = Agent::with_search(
            AgentConfig::default(),
            model.clone(),
            retriever.clone(),
            Arc::new(StaticCatalog::default()),
            leads.clone(),
        );
        Harness {
            agent,
            model,
            retriever,
            leads,
        }
    }

    fn rewrites(state: &ConversationState) -> usize {
        state
            .history
            .iter()
            .filter(|m| {
                matches!(
                    m,
                    Message::User {
                        origin: UserOrigin::QueryRewrite,
                        ..
                    }
                )
            })
            .count()
    }

    fn text_replies(state: &ConversationState) -> usize {
        state
            .history
            .iter()
            .filter(|m| matches!(m, Message::Assistant { .. }) && !m.has_tool_calls())
            .count()
    }

    #[tokio::test]
    async fn test_relevant_retrieval_synthesizes_once() {
        let model = MockModel::new()
            .search("search_knowledge", "membership price")
            .json(serde_json::json!({"relevant": true}))
            .reply("O plano Ouro custa R$ 89,90 por mês!")
            .json(serde_json::json!({"intent_is_sale": true, "name": null, "plan": "Ouro"}));
        let h = harness(
            model,
            ScriptedRetriever::returning(vec![vec!["Plano Ouro: R$ 89,90/mês"]]),
        );

        let outcome = h
            .agent
            .run_turn(ConversationState::new("A"), "How much is the membership?")
            .await
            .unwrap();

        assert_eq!(outcome.reply, "O plano Ouro custa R$ 89,90 por mês!");
        assert_eq!(h.retriever.calls.lock().len(), 1);
        assert_eq!(rewrites(&outcome.state), 0);
        assert_eq!(text_replies(&outcome.state), 1);
        assert_eq!(outcome.state.grounding_context, "Plano Ouro: R$ 89,90/mês");
        assert_eq!(outcome.state.retry_counter, 0);
        assert!(outcome.state.lead.intent_is_sale);
        assert_eq!(outcome.state.lead.plan_interest.as_deref(), Some("Ouro"));
        assert_eq!(h.leads.get("A").map(|r| r.plan), Some("Ouro".to_string()));
        assert!(h.model.is_drained());
    }

    #[tokio::test]
    async fn test_nothing_found_twice_degrades_gracefully() {
        let model = MockModel::new()
            .search("search_knowledge", "stadium tour")
            .reply("stadium tour schedule and price")
            .search("search_knowledge", "stadium tour schedule and price")
            .reply("Não encontrei essa informação. Posso te passar para um atendente?")
            .json(serde_json::json!({"intent_is_sale": false, "name": null, "plan": null}));
        let h = harness(model, ScriptedRetriever::returning(vec![vec![], vec![]]));

        let outcome = h
            .agent
            .run_turn(ConversationState::new("A"), "Is there a stadium tour?")
            .await
            .unwrap();

        assert_eq!(outcome.state.retry_counter, 2);
        assert_eq!(rewrites(&outcome.state), 1);
        assert_eq!(text_replies(&outcome.state), 1);
        assert_eq!(h.retriever.calls.lock().len(), 2);
        assert_eq!(h.retriever.calls.lock()[1], "stadium tour schedule and price");
        assert!(outcome.state.grounding_context.is_empty());
        assert!(outcome.reply.contains("atendente"));
        assert!(h.model.is_drained());
    }

    #[tokio::test]
    async fn test_rewrite_then_accept() {
        let model = MockModel::new()
            .search("search_knowledge", "price")
            .reply("Gold membership plan price")
            .search("search_knowledge", "Gold membership plan price")
            .json(serde_json::json!({"relevant": true}))
            .reply("R$ 89,90!")
            .json(serde_json::json!({"intent_is_sale": true, "name": null, "plan": "Gold"}));
        let h = harness(
            model,
            ScriptedRetriever::returning(vec![vec![], vec!["Gold: R$ 89,90"]]),
        );

        let outcome = h
            .agent
            .run_turn(ConversationState::new("A"), "and how much is it?")
            .await
            .unwrap();

        assert_eq!(outcome.state.retry_counter, 1);
        assert_eq!(outcome.state.grounding_context, "Gold: R$ 89,90");
        assert_eq!(outcome.reply, "R$ 89,90!");
    }

    #[tokio::test]
    async fn test_name_survives_turn_without_mention() {
        let model = MockModel::new()
            .reply("Fala, Marcos! Bem-vindo!")
            .json(serde_json::json!({"intent_is_sale": false, "name": "Marcos", "plan": null}))
            .reply("Jogo no domingo às 16h.")
            .json(serde_json::json!({"intent_is_sale": false, "name": null, "plan": null}));
        let h = harness(model, ScriptedRetriever::default());

        let first = h
            .agent
            .run_turn(ConversationState::new("A"), "Oi, sou o Marcos")
            .await
            .unwrap();
        assert_eq!(first.state.lead.name.as_deref(), Some("Marcos"));

        let second = h
            .agent
            .run_turn(first.state, "Quando é o próximo jogo?")
            .await
            .unwrap();
        assert_eq!(second.state.lead.name.as_deref(), Some("Marcos"));
        assert_eq!(h.leads.get("A").map(|r| r.name), Some("Marcos".to_string()));
    }

    #[tokio::test]
    async fn test_intent_is_recomputed_each_turn() {
        let model = MockModel::new()
            .reply("Temos o plano Ouro!")
            .json(serde_json::json!({"intent_is_sale": true, "name": null, "plan": null}))
            .reply("De nada!")
            .json(serde_json::json!({"intent_is_sale": false, "name": null, "plan": null}));
        let h = harness(model, ScriptedRetriever::default());

        let first = h
            .agent
            .run_turn(ConversationState::new("A"), "Quero ser sócio")
            .await
            .unwrap();
        assert!(first.state.lead.intent_is_sale);

        let second = h.agent.run_turn(first.state, "Valeu").await.unwrap();
        assert!(!second.state.lead.intent_is_sale);
    }

    #[tokio::test]
    async fn test_crossing_threshold_compacts_to_five() {
        let mut state = ConversationState::new("A");
        for i in 0..7 {
            state.history.push(if i % 2 == 0 {
                Message::user(format!("fan {}", i))
            } else {
                Message::assistant_text(format!("agent {}", i))
            });
        }
        let old_ids: Vec<String> = state.history[..4].iter().map(|m| m.id().to_string()).collect();

        let model = MockModel::new()
            .reply("Fan asked about plans; no name given.")
            .reply("Claro!")
            .json(serde_json::json!({"intent_is_sale": false, "name": null, "plan": null}));
        let h = harness(model, ScriptedRetriever::default());
        let mut events = h.agent.subscribe();

        let outcome = h.agent.run_turn(state, "fan 7").await.unwrap();

        // 4 retained + 1 summary, then the reply
        assert_eq!(outcome.state.history.len(), 6);
        assert!(outcome.state.history[0].is_note(NoteKind::PriorSummary));
        assert!(
            outcome
                .state
                .history
                .iter()
                .all(|m| !old_ids.iter().any(|id| id == m.id()))
        );
        assert!(outcome.state.has_unique_ids());

        let responder_request = &h.model.requests.lock()[1];
        assert_eq!(responder_request.messages.len(), 4);
        assert!(
            responder_request
                .system_prompt
                .as_deref()
                .is_some_and(|p| p.contains("Fan asked about plans"))
        );

        let mut compacted = None;
        while let Ok(event) = events.try_recv() {
            if let AgentEvent::Compacted { removed, retained } = event {
                compacted = Some((removed, retained));
            }
        }
        assert_eq!(compacted, Some((4, 4)));
    }

    #[tokio::test]
    async fn test_compaction_failure_keeps_history() {
        let mut state = ConversationState::new("A");
        for i in 0..7 {
            state.history.push(Message::user(format!("fan {}", i)));
        }
        let model = MockModel::new()
            .fail()
            .reply("Oi!")
            .json(serde_json::json!({"intent_is_sale": false, "name": null, "plan": null}));
        let h = harness(model, ScriptedRetriever::default());

        let outcome = h.agent.run_turn(state, "oi").await.unwrap();
        assert_eq!(outcome.state.history.len(), 9);
        assert!(outcome.state.prior_summaries().is_empty());
    }

    #[tokio::test]
    async fn test_responder_failure_fails_turn() {
        let model = MockModel::new().fail();
        let h = harness(model, ScriptedRetriever::default());
        let result = h.agent.run_turn(ConversationState::new("A"), "oi").await;
        assert!(matches!(result, Err(Error::Capability(_))));
        assert!(h.leads.is_empty());
    }

    #[tokio::test]
    async fn test_extraction_failure_keeps_reply() {
        let model = MockModel::new()
            .reply("Olá!")
            .json(serde_json::json!({"intent": "maybe"}));
        let h = harness(model, ScriptedRetriever::default());
        let mut state = ConversationState::new("A");
        state.lead.name = Some("Marcos".into());
        state.lead.intent_is_sale = true;

        let outcome = h.agent.run_turn(state, "oi").await.unwrap();
        assert_eq!(outcome.reply, "Olá!");
        assert!(!outcome.state.lead.intent_is_sale);
        assert_eq!(outcome.state.lead.name.as_deref(), Some("Marcos"));
        assert_eq!(h.leads.upsert_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_counter_resets_each_turn() {
        let model = MockModel::new()
            .reply("Olá!")
            .json(serde_json::json!({"intent_is_sale": false, "name": null, "plan": null}));
        let h = harness(model, ScriptedRetriever::default());
        let mut state = ConversationState::new("A");
        state.retry_counter = 2;
        let outcome = h.agent.run_turn(state, "oi").await.unwrap();
        assert_eq!(outcome.state.retry_counter, 0);
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let h = harness(MockModel::new(), ScriptedRetriever::default());
        let result = h.agent.run_turn(ConversationState::new("A"), "   ").await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_unknown_tool_goes_through_grounding() {
        let model = MockModel::new()
            .search("search_tickets", "final")
            .reply("final tickets")
            .search("search_tickets", "final tickets")
            .reply("Vou te passar para um atendente.")
            .json(serde_json::json!({"intent_is_sale": true, "name": null, "plan": null}));
        let h = harness(model, ScriptedRetriever::default());

        let outcome = h
            .agent
            .run_turn(ConversationState::new("A"), "ingresso pra final?")
            .await
            .unwrap();
        assert_eq!(outcome.state.retry_counter, 2);
        assert!(h.retriever.calls.lock().is_empty());
        assert_eq!(
            h.leads.get("A").map(|r| (r.name, r.plan)),
            Some(("interested fan".to_string(), "undecided".to_string()))
        );
    }
}
