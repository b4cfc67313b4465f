//! Conversation state saved as one JSON file per conversation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clubsdr_agent::{ConversationState, Error, Result, StateStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk envelope around the state
#[derive(Debug, Serialize, Deserialize)]
struct SavedConversation {
    saved_at: DateTime<Utc>,
    state: ConversationState,
}

/// File name for a conversation id.
///
/// ASCII letters, digits and `-` are kept; every other byte is written as
/// `_xx` so distinct ids never share a file.
pub fn file_name(conversation_id: &str) -> String {
    let mut name = String::with_capacity(conversation_id.len() + 5);
    for byte in conversation_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("_{:02x}", byte));
        }
    }
    name.push_str(".json");
    name
}

/// State store writing `<dir>/<conversation>.json`
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, conversation_id: &str) -> PathBuf {
        self.dir.join(file_name(conversation_id))
    }
}

fn store_error(action: &str, path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Store(format!("failed to {} {}: {}", action, path.display(), e))
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>> {
        let path = self.path_for(conversation_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_error("read", &path, e)),
        };
        let saved: SavedConversation =
            serde_json::from_str(&content).map_err(|e| store_error("parse", &path, e))?;
        Ok(Some(saved.state))
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| store_error("create", &self.dir, e))?;

        let path = self.path_for(&state.conversation_id);
        let saved = SavedConversation {
            saved_at: Utc::now(),
            state: state.clone(),
        };
        let content =
            serde_json::to_string_pretty(&saved).map_err(|e| store_error("encode", &path, e))?;

        // Write then rename so a crash never leaves a half-written file
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| store_error("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| store_error("replace", &path, e))?;

        tracing::debug!(
            path = %path.display(),
            messages = state.history.len(),
            "Saved conversation"
        );
        Ok(())
    }
}
