//! Explicit role-to-role transition table.
//!
//! Every role may route to any terminal tag. Role-to-role edges must appear in
//! [`EDGES`]; loop-eligible edges carry a repeat ceiling enforced by the engine.

use crate::core::types::{Next, Role};

/// Repeat ceiling for a loop-eligible edge. Taking an edge a sixth time is fatal.
pub const LOOP_THRESHOLD: u32 = 5;

/// Step ceiling for a whole run.
pub const MAX_STEPS: u32 = 50;

/// One allowed role-to-role transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: Role,
    pub to: Role,
    pub loop_eligible: bool,
}

const fn edge(from: Role, to: Role, loop_eligible: bool) -> Edge {
    Edge {
        from,
        to,
        loop_eligible,
    }
}

pub const EDGES: &[Edge] = &[
    edge(Role::Planner, Role::Planner, true),
    edge(Role::Planner, Role::Researcher, true),
    edge(Role::Planner, Role::Coder, true),
    edge(Role::Planner, Role::Verifier, true),
    edge(Role::Planner, Role::Janitor, false),
    edge(Role::Planner, Role::Retrospective, false),
    edge(Role::Planner, Role::TicketCloser, false),
    edge(Role::Researcher, Role::Planner, false),
    edge(Role::Researcher, Role::Coder, false),
    edge(Role::Coder, Role::Planner, false),
    edge(Role::Coder, Role::Verifier, false),
    edge(Role::Verifier, Role::Planner, false),
    edge(Role::Verifier, Role::Coder, true),
    edge(Role::Verifier, Role::Janitor, false),
    edge(Role::Verifier, Role::Retrospective, false),
    edge(Role::Janitor, Role::Planner, false),
    edge(Role::Janitor, Role::Verifier, false),
    edge(Role::Janitor, Role::Retrospective, false),
    edge(Role::Retrospective, Role::Planner, false),
    edge(Role::Retrospective, Role::TicketCloser, false),
    edge(Role::TicketCloser, Role::Planner, false),
];

/// Look up a role-to-role edge.
pub fn find_edge(from: Role, to: Role) -> Option<&'static Edge> {
    EDGES.iter().find(|e| e.from == from && e.to == to)
}

/// Whether `from` may hand off to `next`.
pub fn is_allowed(from: Role, next: Next) -> bool {
    match next {
        Next::Terminal(_) => true,
        Next::Role(to) => find_edge(from, to).is_some(),
    }
}

/// Whether the edge is subject to the loop ceiling.
pub fn is_loop_eligible(from: Role, to: Role) -> bool {
    find_edge(from, to).is_some_and(|e| e.loop_eligible)
}

/// Counter key for an edge, e.g. `planner→coder`.
pub fn edge_name(from: Role, to: Role) -> String {
    format!("{}→{}", from.as_str(), to.as_str())
}
