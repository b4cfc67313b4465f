//! History compaction for long conversations
//!
//! When a thread grows past `max_messages`, everything except the most recent
//! `keep_recent` messages is summarized into a single prior-summary note that
//! is placed at the front of the history.

use clubsdr_ai::{Message, NoteKind};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::prompt::format_transcript;
use crate::transport::{InferenceRequest, LanguageModel};

/// Tool-result text longer than this is cut in the summary transcript
const TOOL_RESULT_LIMIT: usize = 2000;

/// Configuration for history compaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Whether compaction is enabled
    pub enabled: bool,
    /// Compact once the history holds more than this many messages
    pub max_messages: usize,
    /// Messages kept verbatim at the end of the history
    pub keep_recent: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_messages: 6,
            keep_recent: 4,
        }
    }
}

/// Messages to delete and the summary replacing them
#[derive(Debug, Clone)]
pub struct HistoryDelta {
    /// Id of every summarized message, each exactly once
    pub removed: Vec<String>,
    /// Fresh prior-summary note
    pub summary: Message,
}

// --- Summarization Prompts ---

const SUMMARIZATION_SYSTEM_PROMPT: &str = "\
You summarize conversations between a sports club's sales representative and a fan. \
The summary replaces the original messages, so it must keep every fact needed to \
continue the sale.";

const SUMMARIZATION_PROMPT: &str = "\
Summarize the conversation below between a fan and {agent}. Always keep, when mentioned:

- the fan's name,
- the membership plan (or ticket/product) the fan is interested in,
- open questions and objections,
- prices or benefits already quoted.

Write a short paragraph in the conversation's language. Do not continue the conversation.

<conversation>
{conversation}
</conversation>";

const UPDATE_SUMMARIZATION_PROMPT: &str = "\
Below is an existing summary of an earlier part of a conversation between a fan and \
{agent}, followed by messages that came after it. Write one updated summary that \
integrates both. Always keep the fan's name and plan interest, even when only the \
previous summary mentions them; replace a fact only when the new messages correct it.

<previous-summary>
{previous_summary}
</previous-summary>

<conversation>
{conversation}
</conversation>";

/// Build the summarization prompt for `older`, folding in any prior summaries it contains
fn summary_prompt(older: &[Message], agent_name: &str) -> String {
    let previous: Vec<String> = older
        .iter()
        .filter(|m| m.is_note(NoteKind::PriorSummary))
        .map(Message::text)
        .collect();
    let dialogue: Vec<Message> = older
        .iter()
        .filter(|m| !matches!(m, Message::SystemNote { .. }))
        .cloned()
        .collect();
    let conversation = format_transcript(&dialogue, TOOL_RESULT_LIMIT);

    if previous.is_empty() {
        SUMMARIZATION_PROMPT
            .replace("{agent}", agent_name)
            .replace("{conversation}", &conversation)
    } else {
        UPDATE_SUMMARIZATION_PROMPT
            .replace("{agent}", agent_name)
            .replace("{previous_summary}", &previous.join("\n\n"))
            .replace("{conversation}", &conversation)
    }
}

/// Split point: index of the first retained message, or `None` when no compaction is due
pub fn cut_point(history_len: usize, config: &CompactionConfig) -> Option<usize> {
    if !config.enabled || history_len <= config.max_messages {
        return None;
    }
    let cut = history_len.saturating_sub(config.keep_recent);
    (cut > 0).then_some(cut)
}

/// Summarize everything but the last `keep_recent` messages.
///
/// Returns `Ok(None)` when the history is at or below the threshold.
pub async fn compact(
    history: &[Message],
    config: &CompactionConfig,
    model: &dyn LanguageModel,
    agent_name: &str,
) -> Result<Option<HistoryDelta>> {
    let Some(cut) = cut_point(history.len(), config) else {
        return Ok(None);
    };
    let older = &history[..cut];

    let request = InferenceRequest {
        system_prompt: Some(SUMMARIZATION_SYSTEM_PROMPT.to_string()),
        messages: vec![Message::user(summary_prompt(older, agent_name))],
        ..Default::default()
    };
    let response = model.complete(&request).await?;
    let summary = response.text().trim().to_string();

    tracing::info!(
        removed = older.len(),
        retained = history.len() - cut,
        "Compacted conversation history"
    );

    Ok(Some(HistoryDelta {
        removed: older.iter().map(|m| m.id().to_string()).collect(),
        summary: Message::system_note(NoteKind::PriorSummary, summary),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use async_trait::async_trait;
    use clubsdr_ai::OutputSchema;
    use parking_lot::Mutex;

    /// Model that echoes a fixed summary and records the prompts it saw
    struct SummaryModel {
        reply: Option<String>,
        prompts: Mutex<Vec<String>>,
    }

    impl SummaryModel {
        fn new(reply: Option<&str>) -> Self {
            Self {
                reply: reply.map(str::to_string),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for SummaryModel {
        async fn complete(&self, request: &InferenceRequest) -> Result<Message> {
            self.prompts
                .lock()
                .extend(request.messages.iter().map(Message::text));
            match &self.reply {
                Some(text) => Ok(Message::assistant_text(text.clone())),
                None => Err(Error::Capability("model offline".into())),
            }
        }

        async fn structured(
            &self,
            _request: &InferenceRequest,
            _schema: &OutputSchema,
        ) -> Result<serde_json::Value> {
            Err(Error::Capability("unused".into()))
        }
    }

    fn history(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("fan {}", i))
                } else {
                    Message::assistant_text(format!("agent {}", i))
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_noop_at_or_below_threshold() {
        let model = SummaryModel::new(Some("summary"));
        let config = CompactionConfig::default();
        for n in 0..=6 {
            let delta = compact(&history(n), &config, &model, "Dogão").await.unwrap();
            assert!(delta.is_none(), "history of {} should not compact", n);
        }
        assert!(model.prompts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_removes_all_but_last_four() {
        let model = SummaryModel::new(Some("Fan is Marcos, wants Gold"));
        let messages = history(9);
        let delta = compact(&messages, &CompactionConfig::default(), &model, "Dogão")
            .await
            .unwrap()
            .unwrap();

        let expected: Vec<String> = messages[..5].iter().map(|m| m.id().to_string()).collect();
        assert_eq!(delta.removed, expected);
        assert!(delta.summary.is_note(NoteKind::PriorSummary));
        assert_eq!(delta.summary.text(), "Fan is Marcos, wants Gold");
        assert!(messages.iter().all(|m| m.id() != delta.summary.id()));
    }

    #[tokio::test]
    async fn test_prompt_asks_for_name_and_plan() {
        let model = SummaryModel::new(Some("s"));
        compact(&history(7), &CompactionConfig::default(), &model, "Dogão")
            .await
            .unwrap();
        let prompts = model.prompts.lock();
        assert!(prompts[0].contains("the fan's name"));
        assert!(prompts[0].contains("Fan: fan 0"));
    }

    #[tokio::test]
    async fn test_prior_summary_is_folded_in() {
        let model = SummaryModel::new(Some("updated"));
        let mut messages = vec![Message::system_note(NoteKind::PriorSummary, "Fan is Marcos")];
        messages.extend(history(6));
        let delta = compact(&messages, &CompactionConfig::default(), &model, "Dogão")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(delta.removed[0], messages[0].id());
        let prompts = model.prompts.lock();
        assert!(prompts[0].contains("<previous-summary>\nFan is Marcos\n</previous-summary>"));
    }

    #[tokio::test]
    async fn test_model_failure_is_an_error() {
        let model = SummaryModel::new(None);
        let result = compact(&history(8), &CompactionConfig::default(), &model, "Dogão").await;
        assert!(matches!(result, Err(Error::Capability(_))));
    }

    #[test]
    fn test_cut_point_respects_disabled() {
        let config = CompactionConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(cut_point(20, &config), None);
        assert_eq!(cut_point(8, &CompactionConfig::default()), Some(4));
    }
}
