//! Conversation state: history, grounding context, retry counter and lead profile.

use clubsdr_ai::{Message, NoteKind, ToolStatus};
use serde::{Deserialize, Serialize};

/// Lead facts known about the fan.
///
/// `name` and `plan_interest` are sticky across turns; `intent_is_sale` is
/// recomputed on every turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadProfile {
    pub name: Option<String>,
    pub plan_interest: Option<String>,
    #[serde(default)]
    pub intent_is_sale: bool,
}

/// State of one conversation thread, loaded and saved by the caller around each turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    /// External correlation key (e.g. the fan's messaging id)
    pub conversation_id: String,
    /// Chronological message history
    #[serde(default)]
    pub history: Vec<Message>,
    /// Most recently validated retrieved text
    #[serde(default)]
    pub grounding_context: String,
    /// Grounding validation failures within the current turn
    #[serde(default)]
    pub retry_counter: u8,
    #[serde(default)]
    pub lead: LeadProfile,
}

/// Partial update returned by a graph node and merged into the state.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    /// Ids of messages to delete
    pub remove: Vec<String>,
    /// Messages inserted at the front of the history
    pub prepend: Vec<Message>,
    /// Messages appended to the history
    pub append: Vec<Message>,
    pub grounding_context: Option<String>,
    pub retry_counter: Option<u8>,
    pub name: Option<String>,
    pub plan_interest: Option<String>,
    pub intent_is_sale: Option<bool>,
}

impl StateUpdate {
    /// An update that changes nothing
    pub fn none() -> Self {
        Self::default()
    }

    /// An update appending a single message
    pub fn append(message: Message) -> Self {
        Self {
            append: vec![message],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remove.is_empty()
            && self.prepend.is_empty()
            && self.append.is_empty()
            && self.grounding_context.is_none()
            && self.retry_counter.is_none()
            && self.name.is_none()
            && self.plan_interest.is_none()
            && self.intent_is_sale.is_none()
    }
}

impl ConversationState {
    /// Create an empty state for a new thread
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            history: Vec::new(),
            grounding_context: String::new(),
            retry_counter: 0,
            lead: LeadProfile::default(),
        }
    }

    /// Merge a node's partial update into the state.
    ///
    /// Deletions apply first, then front insertions, then appends.
    pub fn apply(&mut self, update: StateUpdate) {
        if !update.remove.is_empty() {
            self.history
                .retain(|m| !update.remove.iter().any(|id| id == m.id()));
        }
        if !update.prepend.is_empty() {
            let mut history = update.prepend;
            history.append(&mut self.history);
            self.history = history;
        }
        self.history.extend(update.append);

        if let Some(context) = update.grounding_context {
            self.grounding_context = context;
        }
        if let Some(counter) = update.retry_counter {
            self.retry_counter = counter;
        }
        if let Some(name) = update.name {
            self.lead.name = Some(name);
        }
        if let Some(plan) = update.plan_interest {
            self.lead.plan_interest = Some(plan);
        }
        if let Some(intent) = update.intent_is_sale {
            self.lead.intent_is_sale = intent;
        }
    }

    /// Text of the last assistant message that is a reply rather than a tool request
    pub fn last_reply(&self) -> Option<String> {
        self.history
            .iter()
            .rev()
            .find(|m| matches!(m, Message::Assistant { .. }) && !m.has_tool_calls())
            .map(Message::text)
    }

    /// Text of the last message typed by the fan
    pub fn last_fan_question(&self) -> Option<String> {
        self.history
            .iter()
            .rev()
            .find(|m| m.is_fan_message())
            .map(Message::text)
    }

    /// Trailing tool results produced by the most recent tool execution
    pub fn latest_tool_batch(&self) -> &[Message] {
        let start = self
            .history
            .iter()
            .rposition(|m| !matches!(m, Message::ToolResult { .. }))
            .map(|i| i + 1)
            .unwrap_or(0);
        &self.history[start..]
    }

    /// Text of the found results in the latest tool batch, joined by blank lines
    pub fn latest_found_material(&self) -> String {
        self.latest_tool_batch()
            .iter()
            .filter(|m| {
                matches!(
                    m,
                    Message::ToolResult {
                        status: ToolStatus::Found,
                        ..
                    }
                )
            })
            .map(Message::text)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Texts of the prior-summary notes, oldest first
    pub fn prior_summaries(&self) -> Vec<&str> {
        self.history
            .iter()
            .filter_map(|m| match m {
                Message::SystemNote {
                    kind: NoteKind::PriorSummary,
                    text,
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Whether every message id in the history is distinct
    pub fn has_unique_ids(&self) -> bool {
        let mut ids: Vec<&str> = self.history.iter().map(Message::id).collect();
        ids.sort_unstable();
        ids.windows(2).all(|w| w[0] != w[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clubsdr_ai::Content;

    #[test]
    fn test_apply_removes_then_prepends_then_appends() {
        let mut state = ConversationState::new("A");
        let old = Message::user("old");
        let kept = Message::assistant_text("kept");
        state.history = vec![old.clone(), kept.clone()];

        let summary = Message::system_note(NoteKind::PriorSummary, "summary");
        let reply = Message::assistant_text("new");
        state.apply(StateUpdate {
            remove: vec![old.id().to_string()],
            prepend: vec![summary.clone()],
            append: vec![reply.clone()],
            ..Default::default()
        });

        let ids: Vec<&str> = state.history.iter().map(Message::id).collect();
        assert_eq!(ids, vec![summary.id(), kept.id(), reply.id()]);
    }

    #[test]
    fn test_apply_keeps_lead_fields_when_absent() {
        let mut state = ConversationState::new("A");
        state.lead.name = Some("Marcos".into());
        state.apply(StateUpdate {
            intent_is_sale: Some(true),
            ..Default::default()
        });
        assert_eq!(state.lead.name.as_deref(), Some("Marcos"));
        assert!(state.lead.intent_is_sale);
    }

    #[test]
    fn test_last_reply_skips_tool_requests() {
        let mut state = ConversationState::new("A");
        state.history = vec![
            Message::user("price?"),
            Message::assistant_text("earlier answer"),
            Message::assistant(vec![Content::tool_call(
                "call_1",
                "search_knowledge",
                serde_json::json!({"query": "price"}),
            )]),
        ];
        assert_eq!(state.last_reply().as_deref(), Some("earlier answer"));
    }

    #[test]
    fn test_latest_tool_batch_and_material() {
        let mut state = ConversationState::new("A");
        state.history = vec![
            Message::user("q"),
            Message::assistant(vec![
                Content::tool_call("c1", "search_knowledge", serde_json::json!({})),
                Content::tool_call("c2", "search_products", serde_json::json!({})),
            ]),
            Message::tool_result(
                "c1",
                "search_knowledge",
                vec![Content::text("Gold plan")],
                ToolStatus::Found,
            ),
            Message::tool_result(
                "c2",
                "search_products",
                vec![Content::text("none")],
                ToolStatus::NothingFound,
            ),
        ];
        assert_eq!(state.latest_tool_batch().len(), 2);
        assert_eq!(state.latest_found_material(), "Gold plan");
    }

    #[test]
    fn test_last_fan_question_ignores_rewrites() {
        let mut state = ConversationState::new("A");
        state.history = vec![
            Message::user("how much?"),
            Message::query_rewrite("membership plan prices"),
        ];
        assert_eq!(state.last_fan_question().as_deref(), Some("how much?"));
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut state = ConversationState::new("5544999887766");
        state.history.push(Message::user("hi"));
        state.lead.name = Some("Marcos".into());
        let json = serde_json::to_string(&state).unwrap();
        let back: ConversationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
