//! Persona instruction and transcript builders.
//!
//! Every node rebuilds its prompt from the typed history with these pure
//! functions; nothing here inspects message text to decide a message's role.

use std::collections::HashSet;

use clubsdr_ai::{Content, Message, NoteKind, UserOrigin};
use serde::{Deserialize, Serialize};

/// Who the agent is and whom it sells for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Persona {
    pub agent_name: String,
    pub club_name: String,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            agent_name: "Dogão".to_string(),
            club_name: "Maringá FC".to_string(),
        }
    }
}

/// The fixed persona and business priorities
pub fn persona_prompt(persona: &Persona) -> String {
    format!(
        "You are \"{agent}\", the official sales development representative of {club}. \
Be outgoing, passionate about the club and persuasive, but always honest.

Your priorities, in order:
1. Sell membership plans (sócio torcedor): explain prices, benefits and how to join.
2. Help with match tickets and official merchandise.
3. Qualify the lead: learn the fan's name and which plan interests them.

Reply in the fan's language (Brazilian Portuguese unless the fan writes otherwise). \
Keep answers short, as in a chat app. Never invent prices, dates or benefits: use \
search_knowledge for club facts and plans, and search_products for tickets and merchandise.",
        agent = persona.agent_name,
        club = persona.club_name,
    )
}

/// Persona prompt plus the earlier-conversation summaries, if any
pub fn responder_system_prompt(persona: &Persona, summaries: &[&str]) -> String {
    let mut prompt = persona_prompt(persona);
    if !summaries.is_empty() {
        prompt.push_str("\n\n## Summary of the earlier conversation\n");
        prompt.push_str(&summaries.join("\n\n"));
    }
    prompt
}

/// Messages sent verbatim to the responder.
///
/// System notes are excluded. Tool calls and tool results are kept only in
/// matched pairs so the provider accepts the sequence after compaction.
pub fn model_transcript(history: &[Message]) -> Vec<Message> {
    let answered: HashSet<&str> = history
        .iter()
        .filter_map(|m| match m {
            Message::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect();

    let mut requested: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(history.len());

    for message in history {
        match message {
            Message::SystemNote { .. } => {}
            Message::User { .. } => out.push(message.clone()),
            Message::Assistant {
                id,
                content,
                metadata,
            } => {
                let calls = message.tool_calls();
                if calls.iter().all(|(call_id, _, _)| answered.contains(call_id)) {
                    requested.extend(calls.iter().map(|(call_id, _, _)| call_id.to_string()));
                    out.push(message.clone());
                    continue;
                }
                let text: Vec<Content> = content
                    .iter()
                    .filter(|c| c.as_text().is_some_and(|t| !t.trim().is_empty()))
                    .cloned()
                    .collect();
                if !text.is_empty() {
                    out.push(Message::Assistant {
                        id: id.clone(),
                        content: text,
                        metadata: metadata.clone(),
                    });
                }
            }
            Message::ToolResult { tool_call_id, .. } => {
                if requested.contains(tool_call_id) {
                    out.push(message.clone());
                }
            }
        }
    }
    out
}

/// The dialogue as the fan saw it: fan messages and assistant replies
pub fn conversation_transcript(history: &[Message]) -> Vec<Message> {
    history
        .iter()
        .filter(|m| {
            m.is_fan_message() || (matches!(m, Message::Assistant { .. }) && !m.has_tool_calls())
        })
        .cloned()
        .collect()
}

/// Truncate to at most `max_chars` characters, marking the cut
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// Render messages as a plain-text transcript, one line per message.
///
/// `Notice` notes are skipped; tool results are cut to `tool_result_limit` characters.
pub fn format_transcript(messages: &[Message], tool_result_limit: usize) -> String {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::User {
                origin: UserOrigin::Fan,
                ..
            } => Some(format!("Fan: {}", m.text())),
            Message::User {
                origin: UserOrigin::QueryRewrite,
                ..
            } => Some(format!("Search query: {}", m.text())),
            Message::Assistant { .. } if m.has_tool_calls() => {
                let names: Vec<&str> = m.tool_calls().iter().map(|(_, name, _)| *name).collect();
                Some(format!("Agent (consulting {})", names.join(", ")))
            }
            Message::Assistant { .. } => Some(format!("Agent: {}", m.text())),
            Message::ToolResult { tool_name, .. } => Some(format!(
                "Tool {}: {}",
                tool_name,
                truncate_chars(&m.text(), tool_result_limit)
            )),
            Message::SystemNote {
                kind: NoteKind::PriorSummary,
                text,
                ..
            } => Some(format!("Summary: {}", text)),
            Message::SystemNote {
                kind: NoteKind::Notice,
                ..
            } => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
