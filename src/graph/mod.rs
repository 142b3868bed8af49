//! Typed in-memory topology graph with atomic mutation and listener fan-out
//!
//! The graph is the only shared mutable state of the agent. Probes acquire
//! the write guard, reconcile one external event against the graph, and
//! release; the publisher takes the same lock to snapshot. Every mutation is
//! dispatched to registered listeners before the mutating call returns, in
//! application order.

pub mod backend;

use backend::GraphBackend;
use log::debug;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Stable opaque identifier for nodes and edges, unique within a graph.
pub type Identifier = String;

/// Generate a fresh identifier.
pub fn gen_id() -> Identifier {
    Uuid::new_v4().to_string()
}

/// A single metadata attribute value.
///
/// Metadata is open-keyed; values are restricted to this tagged set so the
/// graph serializes to JSON without reflection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<String>),
    Map(BTreeMap<String, MetadataValue>),
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Int(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::String(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::String(v)
    }
}

impl From<Vec<String>> for MetadataValue {
    fn from(v: Vec<String>) -> Self {
        MetadataValue::List(v)
    }
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Open attribute mapping attached to every node and edge.
///
/// Reserved keys (`Name`, `Type`, `IfIndex`, `RelationType`, ...) carry the
/// semantics described in the module documentation; everything else is free
/// for probes to use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(pub BTreeMap<String, MetadataValue>);

impl Metadata {
    pub fn new() -> Self {
        Metadata(BTreeMap::new())
    }

    /// Builder-style insertion, used by probes to assemble attribute sets.
    pub fn with(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<MetadataValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(|v| v.as_int())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A candidate matches when every filter entry equals the candidate's
    /// attribute. An empty filter matches every candidate.
    pub fn matches(&self, filter: &Metadata) -> bool {
        filter
            .0
            .iter()
            .all(|(k, v)| self.0.get(k).map(|own| own == v).unwrap_or(false))
    }

    /// Merge `other` over self at attribute granularity; unmentioned keys
    /// are kept. Returns true when at least one value changed.
    pub fn merge(&mut self, other: &Metadata) -> bool {
        let mut changed = false;
        for (k, v) in &other.0 {
            if self.0.get(k) != Some(v) {
                self.0.insert(k.clone(), v.clone());
                changed = true;
            }
        }
        changed
    }
}

/// A graph node. `host` is unset inside the agent and stamped by the
/// publisher when the node leaves the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "ID")]
    pub id: Identifier,
    #[serde(rename = "Metadata")]
    pub metadata: Metadata,
    #[serde(rename = "Host", default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Node {
    pub fn new(id: Identifier, metadata: Metadata) -> Self {
        Node {
            id,
            metadata,
            host: None,
        }
    }
}

/// A directed edge between two nodes. The `RelationType` metadata key
/// distinguishes `ownership` (containment) from `layer2` (adjacency).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(rename = "ID")]
    pub id: Identifier,
    #[serde(rename = "Parent")]
    pub parent: Identifier,
    #[serde(rename = "Child")]
    pub child: Identifier,
    #[serde(rename = "Metadata")]
    pub metadata: Metadata,
    #[serde(rename = "Host", default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Edge {
    pub fn new(id: Identifier, parent: &Node, child: &Node, metadata: Metadata) -> Self {
        Edge {
            id,
            parent: parent.id.clone(),
            child: child.id.clone(),
            metadata,
            host: None,
        }
    }

    pub fn relation_type(&self) -> Option<&str> {
        self.metadata.get_str("RelationType")
    }
}

/// Mutation event, dispatched to listeners in application order.
#[derive(Debug, Clone)]
pub enum GraphEvent {
    NodeAdded(Node),
    NodeUpdated(Node),
    NodeDeleted(Node),
    EdgeAdded(Edge),
    EdgeUpdated(Edge),
    EdgeDeleted(Edge),
}

impl GraphEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            GraphEvent::NodeAdded(_) => "NodeAdded",
            GraphEvent::NodeUpdated(_) => "NodeUpdated",
            GraphEvent::NodeDeleted(_) => "NodeDeleted",
            GraphEvent::EdgeAdded(_) => "EdgeAdded",
            GraphEvent::EdgeUpdated(_) => "EdgeUpdated",
            GraphEvent::EdgeDeleted(_) => "EdgeDeleted",
        }
    }
}

/// Listeners are invoked synchronously under the graph write lock and must
/// not block or call back into the graph.
pub trait GraphEventListener: Send + Sync {
    fn on_event(&self, event: &GraphEvent);
}

/// Handle returned by `add_listener`, used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Graph state guarded by the process-wide reader/writer lock. All mutating
/// methods take `&mut self` and are therefore only reachable through the
/// write guard; lookups take `&self`.
pub struct GraphState {
    backend: Box<dyn GraphBackend>,
    listeners: Vec<(ListenerId, Arc<dyn GraphEventListener>)>,
    next_listener_id: u64,
}

impl GraphState {
    fn dispatch(&self, event: GraphEvent) {
        for (_, listener) in &self.listeners {
            listener.on_event(&event);
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn GraphEventListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) {
        self.listeners.retain(|(lid, _)| *lid != id);
    }

    /// Create a node with a fresh identifier and add it to the graph.
    pub fn new_node(&mut self, metadata: Metadata) -> Node {
        self.add_node(Node::new(gen_id(), metadata))
    }

    /// Add a node; re-adding an existing identifier is a no-op returning the
    /// existing node and dispatching no event.
    pub fn add_node(&mut self, node: Node) -> Node {
        if let Some(existing) = self.backend.get_node(&node.id) {
            return existing;
        }
        self.backend.add_node(&node);
        self.dispatch(GraphEvent::NodeAdded(node.clone()));
        node
    }

    /// Delete a node and, by cascade, all incident edges. No-op when absent.
    pub fn del_node(&mut self, node: &Node) {
        let Some(existing) = self.backend.get_node(&node.id) else {
            return;
        };
        for edge in self.backend.incident_edges(&node.id) {
            if let Some(deleted) = self.backend.del_edge(&edge.id) {
                self.dispatch(GraphEvent::EdgeDeleted(deleted));
            }
        }
        self.backend.del_node(&existing.id);
        self.dispatch(GraphEvent::NodeDeleted(existing));
    }

    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.backend.get_node(id)
    }

    /// Create an edge with a caller-supplied identifier.
    pub fn new_edge(
        &mut self,
        id: Identifier,
        parent: &Node,
        child: &Node,
        metadata: Metadata,
    ) -> Option<Edge> {
        self.add_edge(Edge::new(id, parent, child, metadata))
    }

    /// Add an edge; both endpoints must exist and re-adding an identifier is
    /// a no-op returning the existing edge.
    pub fn add_edge(&mut self, edge: Edge) -> Option<Edge> {
        if let Some(existing) = self.backend.get_edge(&edge.id) {
            return Some(existing);
        }
        if self.backend.get_node(&edge.parent).is_none()
            || self.backend.get_node(&edge.child).is_none()
        {
            debug!("Skipping edge {}: missing endpoint", edge.id);
            return None;
        }
        self.backend.add_edge(&edge);
        self.dispatch(GraphEvent::EdgeAdded(edge.clone()));
        Some(edge)
    }

    pub fn del_edge(&mut self, edge: &Edge) {
        if let Some(deleted) = self.backend.del_edge(&edge.id) {
            self.dispatch(GraphEvent::EdgeDeleted(deleted));
        }
    }

    pub fn get_edge(&self, id: &str) -> Option<Edge> {
        self.backend.get_edge(id)
    }

    /// Create an edge between the two nodes unless an equivalent edge
    /// (same parent, child and `RelationType`) already exists.
    pub fn link(&mut self, parent: &Node, child: &Node, metadata: Metadata) -> Option<Edge> {
        let relation = metadata.get_str("RelationType").map(str::to_string);
        let equivalent = self.backend.outgoing_edges(&parent.id).into_iter().find(|e| {
            e.child == child.id && e.relation_type() == relation.as_deref()
        });
        if let Some(existing) = equivalent {
            return Some(existing);
        }
        self.new_edge(gen_id(), parent, child, metadata)
    }

    /// Remove every edge between the two nodes, in either direction.
    pub fn unlink(&mut self, a: &Node, b: &Node) {
        for edge in self.edges_between(a, b) {
            self.del_edge(&edge);
        }
    }

    pub fn are_linked(&self, a: &Node, b: &Node) -> bool {
        !self.edges_between(a, b).is_empty()
    }

    fn edges_between(&self, a: &Node, b: &Node) -> Vec<Edge> {
        self.backend
            .incident_edges(&a.id)
            .into_iter()
            .filter(|e| {
                (e.parent == a.id && e.child == b.id) || (e.parent == b.id && e.child == a.id)
            })
            .collect()
    }

    pub fn lookup_nodes(&self, filter: &Metadata) -> Vec<Node> {
        self.backend
            .nodes()
            .into_iter()
            .filter(|n| n.metadata.matches(filter))
            .collect()
    }

    pub fn lookup_first_node(&self, filter: &Metadata) -> Option<Node> {
        self.lookup_nodes(filter).into_iter().next()
    }

    /// Children reachable from `node` through any outgoing edge.
    pub fn lookup_children(&self, node: &Node, filter: &Metadata) -> Vec<Node> {
        self.backend
            .outgoing_edges(&node.id)
            .into_iter()
            .filter_map(|e| self.backend.get_node(&e.child))
            .filter(|n| n.metadata.matches(filter))
            .collect()
    }

    pub fn lookup_first_child(&self, node: &Node, filter: &Metadata) -> Option<Node> {
        self.lookup_children(node, filter).into_iter().next()
    }

    /// Parents reachable from `node` through any incoming edge.
    pub fn lookup_parent_nodes(&self, node: &Node, filter: &Metadata) -> Vec<Node> {
        self.backend
            .incoming_edges(&node.id)
            .into_iter()
            .filter_map(|e| self.backend.get_node(&e.parent))
            .filter(|n| n.metadata.matches(filter))
            .collect()
    }

    /// Parents linked by an `ownership` edge.
    pub fn lookup_owners(&self, node: &Node) -> Vec<Node> {
        self.backend
            .incoming_edges(&node.id)
            .into_iter()
            .filter(|e| e.relation_type() == Some("ownership"))
            .filter_map(|e| self.backend.get_node(&e.parent))
            .collect()
    }

    /// Replace a node's metadata wholesale and dispatch `NodeUpdated`.
    /// Callers merging partial updates assemble the merged map first.
    pub fn set_metadata(&mut self, node: &Node, metadata: Metadata) -> Option<Node> {
        let mut current = self.backend.get_node(&node.id)?;
        if current.metadata == metadata {
            return Some(current);
        }
        current.metadata = metadata;
        self.backend.set_node_metadata(&current.id, &current.metadata);
        self.dispatch(GraphEvent::NodeUpdated(current.clone()));
        Some(current)
    }

    /// Merge a single attribute into a node's metadata.
    pub fn add_metadata(
        &mut self,
        node: &Node,
        key: &str,
        value: impl Into<MetadataValue>,
    ) -> Option<Node> {
        let current = self.backend.get_node(&node.id)?;
        let mut metadata = current.metadata.clone();
        metadata.set(key, value);
        self.set_metadata(&current, metadata)
    }

    /// Merge a single attribute into an edge's metadata.
    pub fn add_edge_metadata(
        &mut self,
        edge: &Edge,
        key: &str,
        value: impl Into<MetadataValue>,
    ) -> Option<Edge> {
        let mut current = self.backend.get_edge(&edge.id)?;
        let mut metadata = current.metadata.clone();
        metadata.set(key, value);
        if current.metadata == metadata {
            return Some(current);
        }
        current.metadata = metadata;
        self.backend.set_edge_metadata(&current.id, &current.metadata);
        self.dispatch(GraphEvent::EdgeUpdated(current.clone()));
        Some(current)
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.backend.nodes()
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.backend.edges()
    }
}

/// The process-wide topology graph: backend state behind a single
/// reader/writer lock, plus the root node representing the local host.
pub struct Graph {
    state: RwLock<GraphState>,
    root: Node,
}

impl Graph {
    /// Construct the graph over the given backend and establish the root
    /// host node (`Type=host`, `Name=<hostname>`).
    pub fn new(backend: Box<dyn GraphBackend>, host: &str) -> Self {
        let mut state = GraphState {
            backend,
            listeners: Vec::new(),
            next_listener_id: 0,
        };
        let root = state.new_node(
            Metadata::new()
                .with("Name", host)
                .with("Type", "host"),
        );
        Graph {
            state: RwLock::new(state),
            root,
        }
    }

    /// The root host node, created at construction and never deleted.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Acquire the write lock. Probes hold this guard for the entire
    /// reconciliation of one external event so composite lookup+mutate
    /// sequences are atomic with respect to other probes and snapshots.
    pub fn write(&self) -> RwLockWriteGuard<'_, GraphState> {
        self.state.write()
    }

    /// Acquire the read lock for lookups.
    pub fn read(&self) -> RwLockReadGuard<'_, GraphState> {
        self.state.read()
    }
}

#[cfg(test)]
mod tests {
    use super::backend::MemoryBackend;
    use super::*;
    use parking_lot::Mutex;

    fn test_graph() -> Graph {
        Graph::new(Box::new(MemoryBackend::new()), "test-host")
    }

    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                events: Mutex::new(Vec::new()),
            })
        }

        fn kinds(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl GraphEventListener for Recorder {
        fn on_event(&self, event: &GraphEvent) {
            self.events.lock().push(event.kind().to_string());
        }
    }

    #[test]
    fn test_root_node() {
        let graph = test_graph();
        let root = graph.root();
        assert_eq!(root.metadata.get_str("Type"), Some("host"));
        assert_eq!(root.metadata.get_str("Name"), Some("test-host"));
        assert!(graph.read().get_node(&root.id).is_some());
    }

    #[test]
    fn test_add_node_idempotent() {
        let graph = test_graph();
        let recorder = Recorder::new();
        let node = {
            let mut g = graph.write();
            g.add_listener(recorder.clone());
            g.new_node(Metadata::new().with("Name", "eth0"))
        };

        let re_added = graph.write().add_node(Node::new(
            node.id.clone(),
            Metadata::new().with("Name", "other"),
        ));

        // The original node survives and no second event fires.
        assert_eq!(re_added.metadata.get_str("Name"), Some("eth0"));
        assert_eq!(recorder.kinds(), vec!["NodeAdded"]);
    }

    #[test]
    fn test_link_no_duplicate() {
        let graph = test_graph();
        let mut g = graph.write();
        let a = g.new_node(Metadata::new().with("Name", "a"));
        let b = g.new_node(Metadata::new().with("Name", "b"));

        let first = g
            .link(&a, &b, Metadata::new().with("RelationType", "ownership"))
            .expect("link");
        let second = g
            .link(&a, &b, Metadata::new().with("RelationType", "ownership"))
            .expect("link");
        assert_eq!(first.id, second.id);
        assert_eq!(g.edges().len(), 1);

        // A different relation between the same endpoints is a new edge.
        g.link(&a, &b, Metadata::new().with("RelationType", "layer2"));
        assert_eq!(g.edges().len(), 2);
    }

    #[test]
    fn test_unlink_and_are_linked() {
        let graph = test_graph();
        let mut g = graph.write();
        let a = g.new_node(Metadata::new().with("Name", "a"));
        let b = g.new_node(Metadata::new().with("Name", "b"));

        g.link(&a, &b, Metadata::new().with("RelationType", "layer2"));
        assert!(g.are_linked(&a, &b));
        assert!(g.are_linked(&b, &a));

        g.unlink(&b, &a);
        assert!(!g.are_linked(&a, &b));
    }

    #[test]
    fn test_del_node_cascades_edges() {
        let graph = test_graph();
        let recorder = Recorder::new();
        let mut g = graph.write();
        let a = g.new_node(Metadata::new().with("Name", "br0"));
        let b = g.new_node(Metadata::new().with("Name", "eth0"));
        g.link(&a, &b, Metadata::new().with("RelationType", "ownership"));
        g.link(&a, &b, Metadata::new().with("RelationType", "layer2"));

        g.add_listener(recorder.clone());
        g.del_node(&b);

        assert!(g.get_node(&b.id).is_none());
        assert!(g.edges().is_empty());
        assert_eq!(
            recorder.kinds(),
            vec!["EdgeDeleted", "EdgeDeleted", "NodeDeleted"]
        );

        // Deleting again is a no-op.
        g.del_node(&b);
        assert_eq!(recorder.kinds().len(), 3);
    }

    #[test]
    fn test_lookup_filters() {
        let graph = test_graph();
        let mut g = graph.write();
        let root = graph.root().clone();
        let veth0 = g.new_node(
            Metadata::new()
                .with("Name", "veth0")
                .with("Type", "veth")
                .with("IfIndex", 4i64),
        );
        let veth1 = g.new_node(
            Metadata::new()
                .with("Name", "veth1")
                .with("Type", "veth")
                .with("IfIndex", 5i64),
        );
        g.link(&root, &veth0, Metadata::new().with("RelationType", "ownership"));
        g.link(&root, &veth1, Metadata::new().with("RelationType", "ownership"));

        assert_eq!(g.lookup_nodes(&Metadata::new().with("Type", "veth")).len(), 2);
        let found = g
            .lookup_first_node(&Metadata::new().with("IfIndex", 5i64).with("Type", "veth"))
            .expect("lookup");
        assert_eq!(found.id, veth1.id);

        // Empty filter matches everything, root included.
        assert_eq!(g.lookup_nodes(&Metadata::new()).len(), 3);

        assert_eq!(g.lookup_children(&root, &Metadata::new()).len(), 2);
        let child = g
            .lookup_first_child(&root, &Metadata::new().with("Name", "veth0"))
            .expect("child");
        assert_eq!(child.id, veth0.id);

        let parents = g.lookup_parent_nodes(&veth0, &Metadata::new());
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].id, root.id);
    }

    #[test]
    fn test_set_metadata_replaces_and_dispatches() {
        let graph = test_graph();
        let recorder = Recorder::new();
        let mut g = graph.write();
        let node = g.new_node(Metadata::new().with("Name", "eth0").with("MTU", 1500i64));
        g.add_listener(recorder.clone());

        let updated = g
            .set_metadata(
                &node,
                Metadata::new().with("Name", "eth0").with("MTU", 9000i64),
            )
            .expect("update");
        assert_eq!(updated.metadata.get_int("MTU"), Some(9000));
        assert_eq!(recorder.kinds(), vec!["NodeUpdated"]);

        // Identical metadata dispatches nothing.
        g.set_metadata(&node, updated.metadata.clone());
        assert_eq!(recorder.kinds().len(), 1);
    }

    #[test]
    fn test_add_metadata_merges_single_key() {
        let graph = test_graph();
        let mut g = graph.write();
        let node = g.new_node(Metadata::new().with("Name", "bond0"));

        let updated = g
            .add_metadata(&node, "BondMode", "active-backup")
            .expect("update");
        assert_eq!(updated.metadata.get_str("Name"), Some("bond0"));
        assert_eq!(updated.metadata.get_str("BondMode"), Some("active-backup"));
    }

    #[test]
    fn test_edge_operations() {
        let graph = test_graph();
        let recorder = Recorder::new();
        let mut g = graph.write();
        let a = g.new_node(Metadata::new().with("Name", "a"));
        let b = g.new_node(Metadata::new().with("Name", "b"));
        let edge = g
            .new_edge(
                "edge-1".to_string(),
                &a,
                &b,
                Metadata::new().with("RelationType", "layer2"),
            )
            .expect("edge");
        g.add_listener(recorder.clone());

        assert_eq!(g.get_edge("edge-1").expect("get").child, b.id);

        let updated = g
            .add_edge_metadata(&edge, "Type", "veth")
            .expect("update");
        assert_eq!(updated.metadata.get_str("Type"), Some("veth"));
        assert_eq!(recorder.kinds(), vec!["EdgeUpdated"]);

        g.del_edge(&edge);
        assert!(g.get_edge("edge-1").is_none());
        // Deleting a gone edge dispatches nothing.
        g.del_edge(&edge);
        assert_eq!(recorder.kinds(), vec!["EdgeUpdated", "EdgeDeleted"]);
    }

    #[test]
    fn test_edge_requires_endpoints() {
        let graph = test_graph();
        let mut g = graph.write();
        let a = g.new_node(Metadata::new().with("Name", "a"));
        let ghost = Node::new("ghost".to_string(), Metadata::new());
        assert!(g
            .new_edge("edge-1".to_string(), &a, &ghost, Metadata::new())
            .is_none());
        assert!(g.edges().is_empty());
    }

    #[test]
    fn test_metadata_merge_semantics() {
        let mut m = Metadata::new().with("Name", "eth0").with("State", "UP");
        let changed = m.merge(&Metadata::new().with("State", "DOWN").with("MTU", 1500i64));
        assert!(changed);
        assert_eq!(m.get_str("Name"), Some("eth0"));
        assert_eq!(m.get_str("State"), Some("DOWN"));
        assert_eq!(m.get_int("MTU"), Some(1500));

        assert!(!m.merge(&Metadata::new().with("State", "DOWN")));
    }

    #[test]
    fn test_event_order_matches_application_order() {
        let graph = test_graph();
        let recorder = Recorder::new();
        let mut g = graph.write();
        g.add_listener(recorder.clone());

        let a = g.new_node(Metadata::new().with("Name", "a"));
        let b = g.new_node(Metadata::new().with("Name", "b"));
        g.link(&a, &b, Metadata::new().with("RelationType", "ownership"));
        g.add_metadata(&a, "State", "UP");
        g.del_node(&a);

        assert_eq!(
            recorder.kinds(),
            vec![
                "NodeAdded",
                "NodeAdded",
                "EdgeAdded",
                "NodeUpdated",
                "EdgeDeleted",
                "NodeDeleted"
            ]
        );
    }

    #[test]
    fn test_listener_deregistration() {
        let graph = test_graph();
        let recorder = Recorder::new();
        let mut g = graph.write();
        let id = g.add_listener(recorder.clone());
        g.new_node(Metadata::new().with("Name", "a"));
        g.remove_listener(id);
        g.new_node(Metadata::new().with("Name", "b"));

        assert_eq!(recorder.kinds(), vec!["NodeAdded"]);
    }

    #[test]
    fn test_node_json_round_trip() {
        let node = Node {
            id: "node-1".to_string(),
            metadata: Metadata::new()
                .with("Name", "eth0")
                .with("IfIndex", 2i64)
                .with("State", "UP")
                .with("IPV4", "10.0.0.1/24"),
            host: Some("test-host".to_string()),
        };
        let json = serde_json::to_string(&node).expect("serialize");
        let back: Node = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(node, back);
    }

    #[test]
    fn test_edge_json_shape() {
        let parent = Node::new("p".to_string(), Metadata::new());
        let child = Node::new("c".to_string(), Metadata::new());
        let edge = Edge::new(
            "e".to_string(),
            &parent,
            &child,
            Metadata::new().with("RelationType", "ownership"),
        );
        let value = serde_json::to_value(&edge).expect("serialize");
        assert_eq!(value["ID"], "e");
        assert_eq!(value["Parent"], "p");
        assert_eq!(value["Child"], "c");
        assert_eq!(value["Metadata"]["RelationType"], "ownership");
    }
}
