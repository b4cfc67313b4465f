//! The turn graph: nodes, routing signals and the static edge table.

use serde::{Deserialize, Serialize};

/// A step of the turn state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    /// Summarize old history when it grows past the threshold
    Compact,
    /// Ask the model to answer or request a capability
    Respond,
    /// Run the requested capabilities
    ExecuteTools,
    /// Judge whether the tool output answers the question
    Grade,
    /// Reformulate the question for another retrieval attempt
    Rewrite,
    /// Produce the reply from grounding context
    Synthesize,
    /// Extract and persist lead facts
    ExtractLead,
    /// Terminal state
    End,
}

/// Routing decision produced by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// Unconditional edge
    Always,
    /// The model requested one or more capability invocations
    ToolsRequested,
    /// The model answered directly
    Answered,
    /// Grounding material was accepted
    Accepted,
    /// Grounding failed for the first time; retry with a rewritten query
    Retry,
    /// Grounding failed at the retry ceiling
    Exhausted,
}

/// Entry point of every turn
pub const ENTRY: Node = Node::Compact;

/// Directed edges `(from, signal, to)`.
pub const EDGES: &[(Node, Signal, Node)] = &[
    (Node::Compact, Signal::Always, Node::Respond),
    (Node::Respond, Signal::ToolsRequested, Node::ExecuteTools),
    (Node::Respond, Signal::Answered, Node::ExtractLead),
    (Node::ExecuteTools, Signal::Always, Node::Grade),
    (Node::Grade, Signal::Accepted, Node::Synthesize),
    (Node::Grade, Signal::Retry, Node::Rewrite),
    (Node::Grade, Signal::Exhausted, Node::Synthesize),
    (Node::Rewrite, Signal::Always, Node::Respond),
    (Node::Synthesize, Signal::Always, Node::ExtractLead),
    (Node::ExtractLead, Signal::Always, Node::End),
];

impl Node {
    /// Follow the edge leaving this node for `signal`, if one exists
    pub fn next(self, signal: Signal) -> Option<Node> {
        EDGES
            .iter()
            .find(|(from, s, _)| *from == self && *s == signal)
            .map(|(_, _, to)| *to)
    }

    pub fn name(self) -> &'static str {
        match self {
            Node::Compact => "compact",
            Node::Respond => "respond",
            Node::ExecuteTools => "execute_tools",
            Node::Grade => "grade",
            Node::Rewrite => "rewrite",
            Node::Synthesize => "synthesize",
            Node::ExtractLead => "extract_lead",
            Node::End => "end",
        }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn signal_label(signal: Signal) -> Option<&'static str> {
    match signal {
        Signal::Always => None,
        Signal::ToolsRequested => Some("tools"),
        Signal::Answered => Some("answered"),
        Signal::Accepted => Some("accepted"),
        Signal::Retry => Some("retry"),
        Signal::Exhausted => Some("exhausted"),
    }
}

/// Mermaid node reference; `end` is a Mermaid keyword
fn mermaid_node(node: Node) -> &'static str {
    match node {
        Node::End => "finish([end])",
        other => other.name(),
    }
}

/// Render the graph as a Mermaid flowchart
pub fn mermaid() -> String {
    let mut out = String::from("flowchart TD\n");
    out.push_str(&format!("    start([start]) --> {}\n", mermaid_node(ENTRY)));
    for (from, signal, to) in EDGES {
        let (from, to) = (mermaid_node(*from), mermaid_node(*to));
        match signal_label(*signal) {
            Some(label) => out.push_str(&format!("    {} -->|{}| {}\n", from, label, to)),
            None => out.push_str(&format!("    {} --> {}\n", from, to)),
        }
    }
    out
}
