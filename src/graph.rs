//! Dependency graph of named nodes.
//!
//! A [`Graph`] holds uniquely named [`GraphNode`]s and precedence edges
//! `from -> to`, meaning `from` has to be finished before `to` may run. The
//! graph is drained by removing nodes as they complete; a node with no
//! remaining predecessor is *available*.
//!
//! Every mutation is validated before it touches the underlying petgraph, so
//! a rejected call leaves the graph exactly as it was.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;

use petgraph::Direction;
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use serde_json::Value;

use crate::error::GraphError;
use crate::signal::Observable;

/// Signals emitted by every [`Graph`], each with a `name` payload field
/// (`from` and `to` for `link_added`).
pub const GRAPH_SIGNALS: [&str; 4] = ["node_added", "node_removed", "link_added", "available"];

/// A named vertex of the graph wrapping an optional unit of work.
#[derive(Debug, Clone)]
pub struct GraphNode<T> {
    name: String,
    payload: Option<T>,
}

impl<T> GraphNode<T> {
    pub fn new(name: impl Into<String>, payload: T) -> Self {
        Self {
            name: name.into(),
            payload: Some(payload),
        }
    }

    /// A structural node without any work attached.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    pub fn payload_mut(&mut self) -> Option<&mut T> {
        self.payload.as_mut()
    }

    pub fn take_payload(&mut self) -> Option<T> {
        self.payload.take()
    }

    pub fn into_payload(self) -> Option<T> {
        self.payload
    }
}

/// Display position of a node: `layer` is the length of the longest path
/// from any root, `rank` the position of the node inside its layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    pub layer: usize,
    pub rank: usize,
}

pub struct Graph<T> {
    graph: StableDiGraph<GraphNode<T>, ()>,
    index: HashMap<String, NodeIndex>,
    observable: Observable,
}

impl<T> Graph<T> {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
            observable: Observable::new(GRAPH_SIGNALS),
        }
    }

    /// Signal bus of this graph, see [`GRAPH_SIGNALS`].
    pub fn observable(&self) -> &Observable {
        &self.observable
    }

    pub fn observable_mut(&mut self) -> &mut Observable {
        &mut self.observable
    }

    fn emit<'a>(&self, signal: &str, payload: impl IntoIterator<Item = (&'a str, &'a str)>) {
        let payload = payload.into_iter().map(|(k, v)| (k, Value::from(v)));

        // Only ever called with one of GRAPH_SIGNALS.
        if let Err(err) = self.observable.notify_observers(signal, payload) {
            tracing::error!("{err}");
        }
    }

    fn lookup(&self, name: &str) -> Result<NodeIndex, GraphError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&GraphNode<T>> {
        self.index.get(name).map(|&i| &self.graph[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut GraphNode<T>> {
        self.index.get(name).map(|&i| &mut self.graph[i])
    }

    /// Registered nodes in a stable order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode<T>> {
        self.graph.node_indices().map(|i| &self.graph[i])
    }

    /// Registers `node`. A name that is already taken is rejected and the
    /// graph stays untouched.
    pub fn add_node(&mut self, node: GraphNode<T>) -> Result<(), GraphError> {
        if self.index.contains_key(&node.name) {
            return Err(GraphError::DuplicateNode(node.name));
        }

        let name = node.name.clone();
        let index = self.graph.add_node(node);
        self.index.insert(name.clone(), index);

        tracing::trace!(node = %name, "added node");
        self.emit("node_added", [("name", name.as_str())]);
        Ok(())
    }

    /// Records that `from` has to complete before `to`.
    ///
    /// Both nodes have to be registered already. Self-loops and links that
    /// would close a cycle are rejected; adding an existing link again is a
    /// no-op.
    pub fn add_link(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        let source = self.lookup(from)?;
        let target = self.lookup(to)?;

        if source == target {
            return Err(GraphError::SelfLoop(from.to_string()));
        }

        if self.graph.find_edge(source, target).is_some() {
            return Ok(());
        }

        if has_path_connecting(&self.graph, target, source, None) {
            return Err(GraphError::Cycle {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        self.graph.add_edge(source, target, ());

        tracing::trace!(from, to, "added link");
        self.emit("link_added", [("from", from), ("to", to)]);
        Ok(())
    }

    /// Deletes the node with all its incident links and hands it back.
    ///
    /// Emits `available` for every successor left without predecessors.
    pub fn remove_node(&mut self, name: &str) -> Result<GraphNode<T>, GraphError> {
        let index = self.lookup(name)?;

        let successors: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();

        let node = self
            .graph
            .remove_node(index)
            .ok_or_else(|| GraphError::UnknownNode(name.to_string()))?;
        self.index.remove(name);

        tracing::trace!(node = %name, "removed node");
        self.emit("node_removed", [("name", name)]);

        for successor in successors {
            if self.is_ready(successor) {
                self.emit("available", [("name", self.graph[successor].name())]);
            }
        }

        Ok(node)
    }

    fn is_ready(&self, index: NodeIndex) -> bool {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .next()
            .is_none()
    }

    /// Every node without a predecessor still registered in the graph. No
    /// particular order is promised.
    pub fn available_nodes(&self) -> Vec<&GraphNode<T>> {
        self.graph
            .node_indices()
            .filter(|&i| self.is_ready(i))
            .map(|i| &self.graph[i])
            .collect()
    }

    /// Names of the nodes `name` directly depends on.
    pub fn predecessors(&self, name: &str) -> Result<Vec<&str>, GraphError> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Names of the nodes directly depending on `name`.
    pub fn successors(&self, name: &str) -> Result<Vec<&str>, GraphError> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Result<Vec<&str>, GraphError> {
        let index = self.lookup(name)?;
        let mut names: Vec<&str> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|i| self.graph[i].name())
            .collect();
        names.sort_unstable();
        Ok(names)
    }

    /// Total order of the nodes in which every link `a -> b` puts `a`
    /// before `b`.
    ///
    /// The order only depends on the sequence of calls that built the graph.
    pub fn topological_sort(&self) -> Result<Vec<(&str, &GraphNode<T>)>, GraphError> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            let name = self.graph[cycle.node_id()].name().to_string();
            GraphError::Cycle {
                from: name.clone(),
                to: name,
            }
        })?;

        Ok(order
            .into_iter()
            .map(|i| {
                let node = &self.graph[i];
                (node.name(), node)
            })
            .collect())
    }

    /// One [`Position`] for every registered node, for visualization.
    pub fn layout(&self) -> Result<BTreeMap<String, Position>, GraphError> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            let name = self.graph[cycle.node_id()].name().to_string();
            GraphError::Cycle {
                from: name.clone(),
                to: name,
            }
        })?;

        let mut layers: HashMap<NodeIndex, usize> = HashMap::with_capacity(order.len());
        for &index in &order {
            let layer = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .map(|p| layers[&p] + 1)
                .max()
                .unwrap_or(0);
            layers.insert(index, layer);
        }

        let mut filled: HashMap<usize, usize> = HashMap::new();
        let mut layout = BTreeMap::new();

        for index in order {
            let layer = layers[&index];
            let rank = filled.entry(layer).or_insert(0);
            layout.insert(
                self.graph[index].name().to_string(),
                Position { layer, rank: *rank },
            );
            *rank += 1;
        }

        Ok(layout)
    }
}

impl<T> Default for Graph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Graph<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let links: Vec<_> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(a, b)| (self.graph[a].name(), self.graph[b].name()))
            .collect();

        f.debug_struct("Graph")
            .field("nodes", &self.nodes().map(GraphNode::name).collect::<Vec<_>>())
            .field("links", &links)
            .finish()
    }
}

/// Renders the graph as a Mermaid flowchart.
impl<T> Display for Graph<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].name().replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_indices() {
            if let Some((source, target)) = self.graph.edge_endpoints(edge) {
                writeln!(f, "    {} --> {}", source.index(), target.index())?;
            }
        }

        Ok(())
    }
}
