//! Answer synthesis from validated grounding context

use crate::agent::AgentConfig;
use crate::error::{Error, Result};
use crate::prompt::{conversation_transcript, persona_prompt};
use crate::state::{ConversationState, StateUpdate};
use crate::transport::{InferenceRequest, LanguageModel};

const GROUNDED_ANSWER_RULES: &str = "\
Answer the fan's last message using ONLY the facts in CONTEXT below. \
Do not invent prices, dates, benefits or rules. If CONTEXT does not contain the \
answer, say so kindly, do not guess, and offer to connect the fan with a human \
attendant. Keep your usual tone and end with an invitation to join the club when it fits.";

/// System prompt for the synthesizer
pub fn synthesis_prompt(config: &AgentConfig, grounding_context: &str) -> String {
    let context = if grounding_context.trim().is_empty() {
        "(no information available)"
    } else {
        grounding_context
    };
    format!(
        "{}\n\n{}\n\nCONTEXT:\n{}",
        persona_prompt(&config.persona),
        GROUNDED_ANSWER_RULES,
        context
    )
}

/// Produce exactly one assistant reply grounded on `state.grounding_context`
pub async fn synthesize(
    state: &ConversationState,
    config: &AgentConfig,
    model: &dyn LanguageModel,
) -> Result<StateUpdate> {
    let request = InferenceRequest {
        system_prompt: Some(synthesis_prompt(config, &state.grounding_context)),
        messages: conversation_transcript(&state.history),
        tools: Vec::new(),
        max_tokens: config.max_tokens,
        temperature: config.temperature,
    };
    let reply = model.complete(&request).await?;
    if reply.has_tool_calls() || reply.text().trim().is_empty() {
        return Err(Error::Capability(
            "synthesizer returned no answer text".into(),
        ));
    }
    Ok(StateUpdate::append(reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_embeds_context() {
        let prompt = synthesis_prompt(&AgentConfig::default(), "Gold costs R$ 89,90");
        assert!(prompt.ends_with("CONTEXT:\nGold costs R$ 89,90"));
        assert!(prompt.contains("human attendant"));
    }

    #[test]
    fn test_prompt_marks_empty_context() {
        let prompt = synthesis_prompt(&AgentConfig::default(), "");
        assert!(prompt.ends_with("(no information available)"));
    }
}
