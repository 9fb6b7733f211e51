//! Formations: declarative DAGs of agent, fleet and join nodes.
//!
//! A definition is parsed from JSON or YAML, validated up front, then
//! executed by [`FormationRuntime`]. Edges carry mapped payloads from a
//! node's output into its successors' inputs, optionally behind a guard.

pub mod definition;
pub mod expr;
mod node;
pub mod runtime;
pub mod validate;

pub use definition::{
    AgentSpec, EdgeSpec, FleetSpec, FormationDefaults, FormationDefinition, NodeKind, NodeSpec, DEFAULT_ARTIFACT,
};
pub use expr::NodeOutputs;
pub use runtime::{FormationRuntime, RunOutcome, RunStats};
pub use validate::validate;
