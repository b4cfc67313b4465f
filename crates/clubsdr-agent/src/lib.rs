//! clubsdr-agent: turn orchestrator for the club sales agent
//!
//! Each inbound fan message runs once through a small directed graph:
//! compact old history, let the model answer or search, validate what the
//! search returned (rewriting the query at most once), synthesize a grounded
//! reply, then extract and persist lead facts. External services are reached
//! through injected ports so the whole graph runs against mocks in tests.

pub mod agent;
pub mod compaction;
pub mod error;
pub mod events;
pub mod graph;
pub mod grounding;
pub mod knowledge;
pub mod lead;
pub mod prompt;
pub mod responder;
pub mod service;
pub mod state;
pub mod store;
pub mod synthesis;
pub mod tool;
pub mod transport;

pub use agent::{Agent, AgentConfig, TurnOutcome};
pub use compaction::{CompactionConfig, HistoryDelta};
pub use error::{Error, Result};
pub use events::AgentEvent;
pub use graph::{Node, Signal};
pub use grounding::GroundingPhase;
pub use knowledge::{Passage, Product, ProductCatalog, Retriever, StaticCatalog};
pub use lead::LeadUpdate;
pub use prompt::Persona;
pub use service::{TurnReply, TurnRequest, TurnService};
pub use state::{ConversationState, LeadProfile, StateUpdate};
pub use store::{LeadRecord, LeadStore, StateStore};
pub use tool::{Tool, ToolOutput};
pub use transport::{InferenceRequest, LanguageModel, ProviderModel, RetryConfig, SharedModel};
