//! LLM Provider implementations

pub mod openai;

use crate::{Context, MessageEventStream, Model, OutputSchema, Result, StreamOptions};
use async_trait::async_trait;

/// Trait for LLM providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stream a response from the LLM
    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<MessageEventStream>;

    /// Request a JSON object conforming to `schema`.
    ///
    /// Providers enforce the schema on their side where supported; callers
    /// must still validate the returned value.
    async fn structured(
        &self,
        model: &Model,
        context: &Context,
        schema: &OutputSchema,
        options: &StreamOptions,
    ) -> Result<serde_json::Value>;
}
