//! Lead extraction: intent, name and plan interest from the dialogue

use clubsdr_ai::{Message, NoteKind, OutputSchema};
use serde::{Deserialize, Serialize};

use crate::prompt::format_transcript;
use crate::state::{ConversationState, StateUpdate};
use crate::store::{LeadRecord, LeadStore};
use crate::transport::{InferenceRequest, LanguageModel, request_structured};

/// Values the model uses to say "I don't know"; never stored
pub const PLACEHOLDERS: &[&str] = &[
    "undetermined",
    "interested fan",
    "undecided",
    "unknown",
    "not informed",
    "n/a",
    "none",
    "torcedor interessado",
    "a definir",
    "não informado",
];

/// What the model understood from the transcript at this instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadUpdate {
    pub intent_is_sale: bool,
    pub name: Option<String>,
    pub plan: Option<String>,
}

/// Strict schema for [`LeadUpdate`]
pub fn lead_schema() -> OutputSchema {
    OutputSchema::new(
        "lead_update",
        serde_json::json!({
            "type": "object",
            "properties": {
                "intent_is_sale": {
                    "type": "boolean",
                    "description": "true if the fan shows clear interest in buying \
                                    or in learning about plans"
                },
                "name": {
                    "type": ["string", "null"],
                    "description": "The fan's name, if they gave it"
                },
                "plan": {
                    "type": ["string", "null"],
                    "description": "Membership plan or product of interest, if mentioned"
                }
            },
            "required": ["intent_is_sale", "name", "plan"],
            "additionalProperties": false
        }),
    )
}

/// Whether `value` carries no information
pub fn is_placeholder(value: &str) -> bool {
    let value = value.trim().to_lowercase();
    value.is_empty() || PLACEHOLDERS.contains(&value.as_str())
}

/// New value for a sticky field, if the returned one should replace `current`
pub fn merge_field(current: Option<&str>, returned: Option<&str>) -> Option<String> {
    let candidate = returned.map(str::trim).filter(|v| !is_placeholder(v))?;
    (current != Some(candidate)).then(|| candidate.to_string())
}

/// Outcome of the extraction node
#[derive(Debug, Default)]
pub struct LeadOutcome {
    pub update: StateUpdate,
    /// Whether a lead record was upserted
    pub persisted: bool,
}

impl LeadOutcome {
    fn no_intent() -> Self {
        Self {
            update: StateUpdate {
                intent_is_sale: Some(false),
                ..Default::default()
            },
            persisted: false,
        }
    }
}

const EXTRACTION_PROMPT: &str = "\
You analyse a conversation between a sports club's sales representative and a fan \
and extract sales signals.

Rules:
1. intent_is_sale is true only if the fan shows clear interest in buying something \
or in learning about membership plans.
2. If a known name is filled in, return a different name ONLY when the fan explicitly \
corrects it (e.g. \"It's not João, it's Pedro\"). Otherwise return the known name or null.
3. Update the plan when the fan changes their mind; otherwise return the known plan or null.
4. Use null, never a placeholder, for anything not stated.";

fn extraction_request(state: &ConversationState, lead_window: usize) -> InferenceRequest {
    let dialogue: Vec<Message> = state
        .history
        .iter()
        .filter(|m| !matches!(m, Message::SystemNote { .. }))
        .cloned()
        .collect();
    let window = &dialogue[dialogue.len().saturating_sub(lead_window)..];

    let summaries = state.prior_summaries();
    let summary_section = if summaries.is_empty() {
        String::new()
    } else {
        format!("Summary of the earlier conversation:\n{}\n\n", summaries.join("\n\n"))
    };

    let known = |v: &Option<String>| v.clone().unwrap_or_else(|| "not informed".to_string());
    let body = format!(
        "Known data:\n- Name: {}\n- Plan: {}\n\n{}Conversation:\n{}",
        known(&state.lead.name),
        known(&state.lead.plan_interest),
        summary_section,
        format_transcript(window, 500)
    );

    InferenceRequest {
        system_prompt: Some(EXTRACTION_PROMPT.to_string()),
        messages: vec![Message::user(body)],
        temperature: Some(0.0),
        ..Default::default()
    }
}

/// Extract, merge and persist lead facts. Never fails the turn.
pub async fn extract_lead(
    state: &ConversationState,
    lead_window: usize,
    model: &dyn LanguageModel,
    store: &dyn LeadStore,
) -> LeadOutcome {
    let transcript_len = state
        .history
        .iter()
        .filter(|m| !m.is_note(NoteKind::Notice))
        .count();
    if transcript_len < 2 {
        return LeadOutcome::no_intent();
    }

    let request = extraction_request(state, lead_window);
    let extracted: LeadUpdate =
        match request_structured(model, &request, &lead_schema()).await {
            Ok(extracted) => extracted,
            Err(e) => {
                tracing::warn!("Lead extraction failed: {}", e);
                return LeadOutcome::no_intent();
            }
        };

    let name = merge_field(state.lead.name.as_deref(), extracted.name.as_deref());
    let plan = merge_field(state.lead.plan_interest.as_deref(), extracted.plan.as_deref());
    if let (Some(old), Some(new)) = (&state.lead.name, &name) {
        tracing::info!(old = %old, new = %new, "Lead name corrected");
    }

    let mut persisted = false;
    if extracted.intent_is_sale || name.is_some() || plan.is_some() {
        let record = LeadRecord::new(
            &state.conversation_id,
            name.as_deref().or(state.lead.name.as_deref()),
            plan.as_deref().or(state.lead.plan_interest.as_deref()),
        );
        match store.upsert(&record).await {
            Ok(()) => {
                tracing::info!(
                    conversation_id = %record.conversation_id,
                    name = %record.name,
                    plan = %record.plan,
                    "Lead recorded"
                );
                persisted = true;
            }
            Err(e) => tracing::warn!("Lead upsert failed: {}", e),
        }
    }

    LeadOutcome {
        update: StateUpdate {
            intent_is_sale: Some(extracted.intent_is_sale),
            name,
            plan_interest: plan,
            ..Default::default()
        },
        persisted,
    }
}
