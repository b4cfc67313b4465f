//! Grounding validation: judge retrieved material, rewrite the query once, then give up.
//!
//! The validator is a small state machine. A turn enters `Validating` after
//! every tool execution; a failed verdict increments the retry counter, which
//! saturates at [`RETRY_CEILING`]. The first failure rewrites the question,
//! the second exhausts the loop.

use clubsdr_ai::{Message, OutputSchema};
use serde::{Deserialize, Serialize};

use crate::graph::Signal;
use crate::prompt::{conversation_transcript, format_transcript};
use crate::state::{ConversationState, StateUpdate};
use crate::transport::{InferenceRequest, LanguageModel, request_structured};

/// Upper bound of `retry_counter`
pub const RETRY_CEILING: u8 = 2;

/// Conversation messages shown to the rewriter
const REWRITE_WINDOW: usize = 4;

/// Phase of the grounding loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroundingPhase {
    Validating,
    Rewriting,
    Accepted,
    Exhausted,
}

impl GroundingPhase {
    /// Transition function.
    ///
    /// Returns the next phase and the new retry counter. Only `Validating`
    /// consumes a verdict; `Rewriting` returns to `Validating` and the
    /// terminal phases stay put.
    pub fn next(self, verdict: bool, retry_counter: u8) -> (GroundingPhase, u8) {
        match self {
            GroundingPhase::Validating if verdict => (GroundingPhase::Accepted, retry_counter),
            GroundingPhase::Validating => {
                let counter = retry_counter.saturating_add(1).min(RETRY_CEILING);
                if counter > 1 {
                    (GroundingPhase::Exhausted, counter)
                } else {
                    (GroundingPhase::Rewriting, counter)
                }
            }
            GroundingPhase::Rewriting => (GroundingPhase::Validating, retry_counter),
            terminal => (terminal, retry_counter),
        }
    }

    /// Graph edge taken out of the grade node
    pub fn signal(self) -> Signal {
        match self {
            GroundingPhase::Accepted => Signal::Accepted,
            GroundingPhase::Exhausted => Signal::Exhausted,
            GroundingPhase::Validating | GroundingPhase::Rewriting => Signal::Retry,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Relevance {
    relevant: bool,
}

fn relevance_schema() -> OutputSchema {
    OutputSchema::new(
        "relevance_verdict",
        serde_json::json!({
            "type": "object",
            "properties": {
                "relevant": {
                    "type": "boolean",
                    "description": "true if the material answers the question"
                }
            },
            "required": ["relevant"],
            "additionalProperties": false
        }),
    )
}

const GRADER_PROMPT: &str = "\
You check whether retrieved material can answer a fan's question to a sports club. \
Answer relevant=true only if the material contains the facts needed to answer it; \
related but insufficient material is not relevant.";

/// Ask the model whether `material` answers `question`.
///
/// Any failure of the judge counts as a negative verdict.
async fn judge(model: &dyn LanguageModel, question: &str, material: &str) -> bool {
    let request = InferenceRequest {
        system_prompt: Some(GRADER_PROMPT.to_string()),
        messages: vec![Message::user(format!(
            "Question: {}\n\n<material>\n{}\n</material>",
            question, material
        ))],
        temperature: Some(0.0),
        ..Default::default()
    };
    match request_structured::<Relevance>(model, &request, &relevance_schema()).await {
        Ok(verdict) => verdict.relevant,
        Err(e) => {
            tracing::warn!(
                malformed = e.is_malformed(),
                "Relevance judge failed, treating as not relevant: {}",
                e
            );
            false
        }
    }
}

/// Grade the latest tool batch against the last fan question.
///
/// Returns the phase reached and the state update to apply.
pub async fn grade(
    state: &ConversationState,
    model: &dyn LanguageModel,
) -> (GroundingPhase, StateUpdate) {
    let material = state.latest_found_material();
    let verdict = if material.trim().is_empty() {
        tracing::debug!("No material found, skipping relevance judge");
        false
    } else {
        let question = state.last_fan_question().unwrap_or_default();
        judge(model, &question, &material).await
    };

    let (phase, retry_counter) = GroundingPhase::Validating.next(verdict, state.retry_counter);
    tracing::debug!(?phase, retry_counter, "Grounding verdict");

    let mut update = StateUpdate::none();
    if retry_counter != state.retry_counter {
        update.retry_counter = Some(retry_counter);
    }
    if matches!(phase, GroundingPhase::Accepted | GroundingPhase::Exhausted) {
        update.grounding_context = Some(material);
    }
    (phase, update)
}

const REWRITE_PROMPT: &str = "\
Rewrite the fan's last question as a standalone, complete search query for the club's \
knowledge base, using the recent conversation to resolve vague references \
(e.g. \"how much is it?\" becomes \"monthly price of the Gold membership plan\"). \
Reply with the rewritten query only.";

/// Reformulate the last fan question into a search query.
///
/// Falls back to the original question when the model fails or replies
/// with nothing. Returns the query and the update appending it.
pub async fn rewrite_query(
    state: &ConversationState,
    model: &dyn LanguageModel,
) -> (String, StateUpdate) {
    let question = state.last_fan_question().unwrap_or_default();
    let dialogue = conversation_transcript(&state.history);
    let recent = &dialogue[dialogue.len().saturating_sub(REWRITE_WINDOW)..];

    let request = InferenceRequest {
        system_prompt: Some(REWRITE_PROMPT.to_string()),
        messages: vec![Message::user(format!(
            "Recent conversation:\n{}\n\nLast question: {}",
            format_transcript(recent, 500),
            question
        ))],
        temperature: Some(0.0),
        ..Default::default()
    };

    let query = match model.complete(&request).await {
        Ok(reply) => {
            let text = reply.text().trim().to_string();
            if text.is_empty() { question } else { text }
        }
        Err(e) => {
            tracing::warn!("Query rewrite failed, reusing the original question: {}", e);
            question
        }
    };

    tracing::debug!(%query, "Rewrote search query");
    (query.clone(), StateUpdate::append(Message::query_rewrite(query)))
}
