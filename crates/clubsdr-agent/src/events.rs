//! Agent event types

use clubsdr_ai::ToolStatus;
use serde::{Deserialize, Serialize};

use crate::graph::Node;
use crate::grounding::GroundingPhase;

/// Events emitted while a turn runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A turn started
    TurnStart { conversation_id: String },

    /// The orchestrator entered a node
    NodeEnter { node: Node, step: usize },

    /// Old history was replaced by a summary
    Compacted { removed: usize, retained: usize },

    /// Tool execution started
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// Tool execution completed
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        status: ToolStatus,
    },

    /// The grounding validator made a decision
    Grounding {
        phase: GroundingPhase,
        retry_counter: u8,
    },

    /// The question was reformulated for another retrieval attempt
    QueryRewritten { query: String },

    /// Lead extraction finished
    LeadUpdated {
        name: Option<String>,
        plan: Option<String>,
        intent_is_sale: bool,
        persisted: bool,
    },

    /// A turn completed
    TurnEnd { steps: usize },

    /// Error occurred
    Error { message: String },
}
