use std::collections::HashMap;

use crate::graph::{EdgeOrigin, ExecutionPlan};

/// Resolution state of a scheduling edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    /// Source has not finished.
    Pending,
    /// Source completed and this edge carries control.
    Live,
    /// Source was skipped or a router did not select this edge.
    Dead,
    /// Source failed, was blocked or was cancelled.
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Waiting,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Blocked,
    Cancelled,
}

impl NodeState {
    pub fn is_done(self) -> bool {
        !matches!(self, NodeState::Waiting | NodeState::Ready | NodeState::Running)
    }
}

/// Outcome of promoting a waiting node whose inputs are all resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Run(String),
    Skip { node_id: String, reason: String },
    Block { node_id: String, reason: String },
}

/// Ready-set bookkeeping for one execution.
///
/// A node is resolved once none of its incoming edges is pending. It runs
/// when it has no inputs or at least one live input and no blocked input.
/// `listenTo` dependencies are strict: a dead edge from a listened node
/// skips the listener. Nodes with only dead inputs are skipped, and their
/// outgoing edges die with them so whole unselected branches fall away.
pub struct Schedule<'p> {
    plan: &'p ExecutionPlan,
    edges: Vec<EdgeState>,
    nodes: HashMap<&'p str, NodeState>,
    order: Vec<&'p str>,
}

impl<'p> Schedule<'p> {
    pub fn new(plan: &'p ExecutionPlan) -> Self {
        let order: Vec<&'p str> = plan
            .layers()
            .iter()
            .flat_map(|layer| layer.iter().map(String::as_str))
            .collect();
        let nodes = order.iter().map(|&id| (id, NodeState::Waiting)).collect();
        Self {
            plan,
            edges: vec![EdgeState::Pending; plan.edges().len()],
            nodes,
            order,
        }
    }

    pub fn state(&self, node_id: &str) -> Option<NodeState> {
        self.nodes.get(node_id).copied()
    }

    /// Resolve every node whose inputs are settled, propagating skips and
    /// blocks until nothing changes. Runnable nodes move to `Ready`.
    pub fn promote(&mut self) -> Vec<Resolution> {
        let mut resolved = Vec::new();
        loop {
            let mut changed = false;
            for i in 0..self.order.len() {
                let id = self.order[i];
                if self.nodes.get(id) != Some(&NodeState::Waiting) {
                    continue;
                }
                let Some(resolution) = self.resolve(id) else {
                    continue;
                };
                match &resolution {
                    Resolution::Run(_) => self.set(id, NodeState::Ready),
                    Resolution::Skip { .. } => {
                        self.set(id, NodeState::Skipped);
                        self.mark_outgoing(id, EdgeState::Dead);
                    }
                    Resolution::Block { .. } => {
                        self.set(id, NodeState::Blocked);
                        self.mark_outgoing(id, EdgeState::Blocked);
                    }
                }
                resolved.push(resolution);
                changed = true;
            }
            if !changed {
                return resolved;
            }
        }
    }

    fn resolve(&self, id: &str) -> Option<Resolution> {
        let incoming = self.plan.incoming_ids(id);
        if incoming.iter().any(|&e| self.edges[e] == EdgeState::Pending) {
            return None;
        }
        if incoming.is_empty() {
            return Some(Resolution::Run(id.to_string()));
        }

        let listen_to: &[String] = self
            .plan
            .node(id)
            .map(|n| n.node.data.listen_to.as_slice())
            .unwrap_or(&[]);
        let edges = self.plan.edges();

        if let Some(&e) = incoming.iter().find(|&&e| self.edges[e] == EdgeState::Blocked) {
            return Some(Resolution::Block {
                node_id: id.to_string(),
                reason: format!("upstream node '{}' did not complete", edges[e].source),
            });
        }
        if let Some(&e) = incoming
            .iter()
            .find(|&&e| self.edges[e] == EdgeState::Dead && listen_to.contains(&edges[e].source))
        {
            return Some(Resolution::Skip {
                node_id: id.to_string(),
                reason: format!("listened node '{}' was skipped", edges[e].source),
            });
        }
        if incoming.iter().any(|&e| self.edges[e] == EdgeState::Live) {
            return Some(Resolution::Run(id.to_string()));
        }
        Some(Resolution::Skip {
            node_id: id.to_string(),
            reason: "no selected branch leads here".to_string(),
        })
    }

    pub fn start(&mut self, node_id: &str) {
        self.set(node_id, NodeState::Running);
    }

    /// Mark a node completed. For routers, `selected` names the chosen
    /// handle: matching branch edges go live and the other branches die.
    /// Implicit `listenTo` edges only track completion and always go live.
    pub fn complete(&mut self, node_id: &str, selected: Option<&str>) {
        self.set(node_id, NodeState::Completed);
        for e in self.plan.outgoing_ids(node_id) {
            let edge = &self.plan.edges()[e];
            self.edges[e] = match selected {
                _ if edge.origin == EdgeOrigin::ListenTo => EdgeState::Live,
                None => EdgeState::Live,
                Some(handle) if edge.handle.as_deref() == Some(handle) => EdgeState::Live,
                Some(_) => EdgeState::Dead,
            };
        }
    }

    pub fn fail(&mut self, node_id: &str) {
        self.set(node_id, NodeState::Failed);
        self.mark_outgoing(node_id, EdgeState::Blocked);
    }

    pub fn cancel(&mut self, node_id: &str) {
        self.set(node_id, NodeState::Cancelled);
        self.mark_outgoing(node_id, EdgeState::Blocked);
    }

    /// Nodes that never reached a terminal state.
    pub fn unfinished(&self) -> Vec<&'p str> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.nodes.get(id).is_some_and(|s| !s.is_done()))
            .collect()
    }

    fn set(&mut self, node_id: &str, state: NodeState) {
        if let Some(s) = self.nodes.get_mut(node_id) {
            *s = state;
        }
    }

    fn mark_outgoing(&mut self, node_id: &str, state: EdgeState) {
        for e in self.plan.outgoing_ids(node_id) {
            self.edges[e] = state;
        }
    }
}
