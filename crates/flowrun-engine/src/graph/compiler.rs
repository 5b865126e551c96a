use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::debug;

use flowrun_core::error::{FlowError, Result};
use flowrun_core::types::{Edge, FlowConfig, Node};

use super::condition::Condition;

/// Executable node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Agent,
    Task,
    Router,
    Listener,
    State,
}

impl NodeKind {
    /// Routers and state nodes are evaluated by the coordinator itself.
    pub fn is_in_process(self) -> bool {
        matches!(self, NodeKind::Router | NodeKind::State)
    }
}

/// Maps node type tags from the wire format to executable kinds.
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    tags: HashMap<String, NodeKind>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the editor's tag names.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (tag, kind) in [
            ("agent", NodeKind::Agent),
            ("agentnode", NodeKind::Agent),
            ("crew", NodeKind::Agent),
            ("crewnode", NodeKind::Agent),
            ("task", NodeKind::Task),
            ("tasknode", NodeKind::Task),
            ("router", NodeKind::Router),
            ("routernode", NodeKind::Router),
            ("listener", NodeKind::Listener),
            ("listenernode", NodeKind::Listener),
            ("state", NodeKind::State),
            ("statenode", NodeKind::State),
        ] {
            registry.register(tag, kind);
        }
        registry
    }

    /// Register a tag. Matching is case-insensitive.
    pub fn register(&mut self, tag: &str, kind: NodeKind) {
        self.tags.insert(tag.to_ascii_lowercase(), kind);
    }

    pub fn resolve(&self, tag: &str) -> Result<NodeKind> {
        self.tags
            .get(&tag.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| FlowError::Configuration(format!("unknown node kind: {}", tag)))
    }
}

/// Where a plan edge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeOrigin {
    Declared,
    /// Added for a `listenTo` reference with no matching declared edge.
    ListenTo,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanEdge {
    pub source: String,
    pub target: String,
    pub handle: Option<String>,
    pub origin: EdgeOrigin,
    /// Closes an allowed loop; never used for scheduling.
    pub loop_back: bool,
}

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub node: Node,
    pub kind: NodeKind,
    pub layer: usize,
    pub condition: Option<Condition>,
}

impl PlanNode {
    pub fn id(&self) -> &str {
        &self.node.id
    }
}

/// Validated, layered graph ready for execution.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    nodes: Vec<PlanNode>,
    index: HashMap<String, usize>,
    edges: Vec<PlanEdge>,
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
    layers: Vec<Vec<String>>,
    flow_config: FlowConfig,
}

impl ExecutionPlan {
    /// Nodes in declared order.
    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn edges(&self) -> &[PlanEdge] {
        &self.edges
    }

    /// Scheduling edges into a node (loop-back edges excluded).
    pub fn incoming(&self, id: &str) -> impl Iterator<Item = &PlanEdge> {
        self.edge_list(&self.incoming, id)
    }

    /// Scheduling edges out of a node (loop-back edges excluded).
    pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &PlanEdge> {
        self.edge_list(&self.outgoing, id)
    }

    /// Indices into [`edges`](Self::edges) of the scheduling edges into a node.
    pub fn incoming_ids(&self, id: &str) -> Vec<usize> {
        self.edge_ids(&self.incoming, id)
    }

    /// Indices into [`edges`](Self::edges) of the scheduling edges out of a node.
    pub fn outgoing_ids(&self, id: &str) -> Vec<usize> {
        self.edge_ids(&self.outgoing, id)
    }

    fn edge_ids(&self, table: &[Vec<usize>], id: &str) -> Vec<usize> {
        self.index
            .get(id)
            .map(|&i| table[i].as_slice())
            .unwrap_or(&[])
            .iter()
            .copied()
            .filter(|&e| !self.edges[e].loop_back)
            .collect()
    }

    fn edge_list<'a>(&'a self, table: &'a [Vec<usize>], id: &str) -> impl Iterator<Item = &'a PlanEdge> {
        self.index
            .get(id)
            .map(|&i| table[i].as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|&e| &self.edges[e])
            .filter(|e| !e.loop_back)
    }

    /// Topological layers; nodes in one layer have no ordering dependency.
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    pub fn flow_config(&self) -> &FlowConfig {
        &self.flow_config
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Turns a stored node/edge list into an [`ExecutionPlan`].
#[derive(Debug, Clone)]
pub struct GraphCompiler {
    kinds: KindRegistry,
    allow_tagged_loops: bool,
}

impl Default for GraphCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphCompiler {
    pub fn new() -> Self {
        Self {
            kinds: KindRegistry::with_builtins(),
            allow_tagged_loops: false,
        }
    }

    pub fn with_kinds(mut self, kinds: KindRegistry) -> Self {
        self.kinds = kinds;
        self
    }

    /// Accept cycles made only of nodes tagged `loop`.
    pub fn allow_tagged_loops(mut self, allow: bool) -> Self {
        self.allow_tagged_loops = allow;
        self
    }

    pub fn compile(&self, nodes: &[Node], edges: &[Edge], flow_config: &FlowConfig) -> Result<ExecutionPlan> {
        if nodes.is_empty() {
            return Err(FlowError::graph("flow has no nodes", vec![]));
        }

        // Nodes
        let mut index = HashMap::new();
        let mut plan_nodes = Vec::with_capacity(nodes.len());
        for node in nodes {
            if node.id.trim().is_empty() {
                return Err(FlowError::graph("node with empty id", vec![]));
            }
            if index.insert(node.id.clone(), plan_nodes.len()).is_some() {
                return Err(FlowError::graph("duplicate node id", vec![node.id.clone()]));
            }
            let kind = self.kinds.resolve(&node.kind)?;
            let condition = match kind {
                NodeKind::Router => {
                    let expr = node
                        .data
                        .router_condition
                        .as_deref()
                        .filter(|c| !c.trim().is_empty())
                        .ok_or_else(|| {
                            FlowError::Configuration(format!(
                                "router node {} has no routerCondition",
                                node.id
                            ))
                        })?;
                    Some(Condition::parse(expr)?)
                }
                _ => None,
            };
            plan_nodes.push(PlanNode {
                node: node.clone(),
                kind,
                layer: 0,
                condition,
            });
        }

        // Declared edges
        let mut plan_edges: Vec<PlanEdge> = Vec::with_capacity(edges.len());
        let mut missing: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for edge in edges {
            for endpoint in [&edge.source, &edge.target] {
                if !index.contains_key(endpoint) && !missing.contains(endpoint) {
                    missing.push(endpoint.clone());
                }
            }
            let handle = edge.source_handle.clone().filter(|h| !h.is_empty());
            if seen.insert((edge.source.clone(), edge.target.clone(), handle.clone())) {
                plan_edges.push(PlanEdge {
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                    handle,
                    origin: EdgeOrigin::Declared,
                    loop_back: false,
                });
            }
        }
        if !missing.is_empty() {
            return Err(FlowError::graph("edge references unknown node", missing));
        }

        // Implicit listenTo dependencies
        for node in nodes {
            for source in &node.data.listen_to {
                if !index.contains_key(source) {
                    return Err(FlowError::graph(
                        format!("listenTo of {} references unknown node", node.id),
                        vec![source.clone()],
                    ));
                }
                let present = plan_edges
                    .iter()
                    .any(|e| e.source == *source && e.target == node.id);
                if !present {
                    plan_edges.push(PlanEdge {
                        source: source.clone(),
                        target: node.id.clone(),
                        handle: None,
                        origin: EdgeOrigin::ListenTo,
                        loop_back: false,
                    });
                }
            }
        }

        // Router branches
        for pn in plan_nodes.iter().filter(|n| n.kind == NodeKind::Router) {
            let handles: Vec<Option<&String>> = plan_edges
                .iter()
                .filter(|e| e.source == pn.node.id && e.origin == EdgeOrigin::Declared)
                .map(|e| e.handle.as_ref())
                .collect();
            let distinct: HashSet<&String> = handles.iter().flatten().copied().collect();
            if handles.len() < 2 || handles.iter().any(|h| h.is_none()) || distinct.len() != handles.len() {
                return Err(FlowError::graph(
                    "router needs at least 2 outgoing edges with distinct handles",
                    vec![pn.node.id.clone()],
                ));
            }
        }

        let mut incoming = vec![Vec::new(); plan_nodes.len()];
        let mut outgoing = vec![Vec::new(); plan_nodes.len()];
        for (i, edge) in plan_edges.iter().enumerate() {
            outgoing[index[&edge.source]].push(i);
            incoming[index[&edge.target]].push(i);
        }

        let back_edges = find_back_edges(plan_nodes.len(), &plan_edges, &outgoing, &index);
        if let Some((_, cycle)) = back_edges.first() {
            if !self.allow_tagged_loops {
                return Err(FlowError::graph("cycle detected", ids(&plan_nodes, cycle)));
            }
            for component in cyclic_components(plan_nodes.len(), &plan_edges, &outgoing, &index) {
                if component.iter().any(|&n| !plan_nodes[n].node.data.loop_construct) {
                    return Err(FlowError::graph("cycle detected", ids(&plan_nodes, &component)));
                }
            }
            for &(edge, _) in &back_edges {
                plan_edges[edge].loop_back = true;
            }
        }

        let layers = assign_layers(&mut plan_nodes, &plan_edges, &outgoing, &incoming, &index);
        debug!(
            nodes = plan_nodes.len(),
            edges = plan_edges.len(),
            layers = layers.len(),
            "Flow compiled"
        );

        Ok(ExecutionPlan {
            nodes: plan_nodes,
            index,
            edges: plan_edges,
            incoming,
            outgoing,
            layers,
            flow_config: flow_config.clone(),
        })
    }
}

fn ids(nodes: &[PlanNode], members: &[usize]) -> Vec<String> {
    members.iter().map(|&i| nodes[i].node.id.clone()).collect()
}

/// DFS colouring in declared order. Returns each back edge with the cycle it closes.
fn find_back_edges(
    n: usize,
    edges: &[PlanEdge],
    outgoing: &[Vec<usize>],
    index: &HashMap<String, usize>,
) -> Vec<(usize, Vec<usize>)> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color = vec![Color::White; n];
    let mut found = Vec::new();

    for root in 0..n {
        if color[root] != Color::White {
            continue;
        }
        // (node, next outgoing position)
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        color[root] = Color::Gray;
        while let Some(top) = stack.len().checked_sub(1) {
            let (node, pos) = stack[top];
            if let Some(&edge) = outgoing[node].get(pos) {
                stack[top].1 += 1;
                let next = index[&edges[edge].target];
                match color[next] {
                    Color::White => {
                        color[next] = Color::Gray;
                        stack.push((next, 0));
                    }
                    Color::Gray => {
                        let start = stack.iter().position(|&(s, _)| s == next).unwrap_or(0);
                        let cycle = stack[start..].iter().map(|&(s, _)| s).collect();
                        found.push((edge, cycle));
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                stack.pop();
            }
        }
    }
    found
}

/// Strongly connected components that contain a cycle, members in declared order.
fn cyclic_components(
    n: usize,
    edges: &[PlanEdge],
    outgoing: &[Vec<usize>],
    index: &HashMap<String, usize>,
) -> Vec<Vec<usize>> {
    struct Tarjan<'a> {
        edges: &'a [PlanEdge],
        outgoing: &'a [Vec<usize>],
        index: &'a HashMap<String, usize>,
        counter: usize,
        order: Vec<Option<usize>>,
        low: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        components: Vec<Vec<usize>>,
    }

    impl Tarjan<'_> {
        fn visit(&mut self, v: usize) {
            self.order[v] = Some(self.counter);
            self.low[v] = self.counter;
            self.counter += 1;
            self.stack.push(v);
            self.on_stack[v] = true;

            let (edges, outgoing, index) = (self.edges, self.outgoing, self.index);
            for &e in &outgoing[v] {
                let w = index[&edges[e].target];
                match self.order[w] {
                    None => {
                        self.visit(w);
                        self.low[v] = self.low[v].min(self.low[w]);
                    }
                    Some(ow) if self.on_stack[w] => {
                        self.low[v] = self.low[v].min(ow);
                    }
                    Some(_) => {}
                }
            }

            if Some(self.low[v]) == self.order[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                let self_loop = outgoing[v].iter().any(|&e| index[&edges[e].target] == v);
                if component.len() > 1 || self_loop {
                    component.sort_unstable();
                    self.components.push(component);
                }
            }
        }
    }

    let mut t = Tarjan {
        edges,
        outgoing,
        index,
        counter: 0,
        order: vec![None; n],
        low: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        components: Vec::new(),
    };
    for v in 0..n {
        if t.order[v].is_none() {
            t.visit(v);
        }
    }
    t.components.sort_by_key(|c| c[0]);
    t.components
}

/// Longest-path layering over scheduling edges (Kahn's algorithm).
fn assign_layers(
    nodes: &mut [PlanNode],
    edges: &[PlanEdge],
    outgoing: &[Vec<usize>],
    incoming: &[Vec<usize>],
    index: &HashMap<String, usize>,
) -> Vec<Vec<String>> {
    let mut in_degree: Vec<usize> = incoming
        .iter()
        .map(|list| list.iter().filter(|&&e| !edges[e].loop_back).count())
        .collect();
    let mut layer = vec![0usize; nodes.len()];
    let mut ready: std::collections::VecDeque<usize> =
        (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();

    while let Some(v) = ready.pop_front() {
        for &e in &outgoing[v] {
            if edges[e].loop_back {
                continue;
            }
            let w = index[&edges[e].target];
            layer[w] = layer[w].max(layer[v] + 1);
            in_degree[w] -= 1;
            if in_degree[w] == 0 {
                ready.push_back(w);
            }
        }
    }

    let depth = layer.iter().copied().max().map_or(0, |m| m + 1);
    let mut layers = vec![Vec::new(); depth];
    for (i, pn) in nodes.iter_mut().enumerate() {
        pn.layer = layer[i];
        layers[layer[i]].push(pn.node.id.clone());
    }
    layers
}
