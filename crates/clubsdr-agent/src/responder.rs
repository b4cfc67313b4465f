//! Router/responder node: answer directly or request a capability

use clubsdr_ai::Message;

use crate::agent::AgentConfig;
use crate::error::{Error, Result};
use crate::graph::Signal;
use crate::prompt::{model_transcript, responder_system_prompt};
use crate::state::{ConversationState, StateUpdate};
use crate::tool::ToolRegistry;
use crate::transport::{InferenceRequest, LanguageModel};

/// Build the responder request from the current state
pub fn responder_request(
    state: &ConversationState,
    config: &AgentConfig,
    tools: &ToolRegistry,
) -> InferenceRequest {
    InferenceRequest {
        system_prompt: Some(responder_system_prompt(
            &config.persona,
            &state.prior_summaries(),
        )),
        messages: model_transcript(&state.history),
        tools: tools.api_tools(),
        max_tokens: config.max_tokens,
        temperature: config.temperature,
    }
}

fn is_empty_reply(message: &Message) -> bool {
    !message.has_tool_calls() && message.text().trim().is_empty()
}

/// Invoke the model with the two search tools and route on its reply
pub async fn respond(
    state: &ConversationState,
    config: &AgentConfig,
    tools: &ToolRegistry,
    model: &dyn LanguageModel,
) -> Result<(Signal, StateUpdate)> {
    let request = responder_request(state, config, tools);
    let reply = model.complete(&request).await?;
    if is_empty_reply(&reply) {
        return Err(Error::Capability("model returned an empty reply".into()));
    }

    let signal = if reply.has_tool_calls() {
        Signal::ToolsRequested
    } else {
        Signal::Answered
    };
    tracing::debug!(?signal, "Responder routed");
    Ok((signal, StateUpdate::append(reply)))
}
