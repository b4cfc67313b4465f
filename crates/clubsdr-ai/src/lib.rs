//! clubsdr-ai: LLM provider layer
//!
//! Message and content types shared by the agent, streaming events, and the
//! OpenAI-compatible chat-completions provider (streaming replies, structured
//! JSON-schema output and embeddings).

pub mod error;
pub mod providers;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use stream::MessageEventStream;
pub use types::*;
