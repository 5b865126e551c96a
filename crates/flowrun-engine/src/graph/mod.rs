//! Flow graphs: compilation into a layered plan and router conditions.
//!
//! A flow is a directed graph of nodes connected by control-flow edges.
//! `GraphCompiler` validates the stored node/edge list, adds the implicit
//! `listenTo` dependencies, rejects cycles that are not allowed loops and
//! assigns each node a topological layer. Router outgoing edges stay
//! unresolved until the coordinator evaluates the router's condition.

pub mod compiler;
pub mod condition;

pub use compiler::{EdgeOrigin, ExecutionPlan, GraphCompiler, KindRegistry, NodeKind, PlanEdge, PlanNode};
pub use condition::{Condition, ConditionScope};
