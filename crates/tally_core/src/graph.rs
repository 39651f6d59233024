//! Dataflow graph: variables and operator nodes held in an arena.
//!
//! Every node gets the next sequence tag when it is created. Parties build
//! the same graph in the same order, so the Nth node carries the same tag
//! everywhere and the tag alone correlates values across the network.
//!
//! Building the graph does no I/O. A node is resolved either by the runtime
//! (local feed or network delivery, for variables) or by awaiting it (for
//! operators, which await their operands and combine them).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Mul, MulAssign};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::error::Result;
use crate::slot::Slot;
use crate::value::{Operator, Value};

/// Index of a node in its graph; equal to its sequence tag.
pub type NodeId = u32;

/// Right-hand side of a binary operator.
#[derive(Debug, Clone)]
pub enum Operand {
    Node(Node),
    Constant(f64),
}

impl From<&Node> for Operand {
    fn from(node: &Node) -> Self {
        Self::Node(node.clone())
    }
}

impl From<Node> for Operand {
    fn from(node: Node) -> Self {
        Self::Node(node)
    }
}

impl From<f64> for Operand {
    fn from(c: f64) -> Self {
        Self::Constant(c)
    }
}

#[derive(Debug, Clone, Copy)]
enum Rhs {
    Node(NodeId),
    Constant(f64),
}

#[derive(Debug, Clone, Copy)]
enum NodeKind {
    Variable,
    Op { op: Operator, lhs: NodeId, rhs: Rhs },
}

struct NodeEntry {
    label: String,
    kind: NodeKind,
    slot: Arc<Slot<Value>>,
}

/// Arena of nodes for one runtime.
#[derive(Default)]
pub struct Graph {
    nodes: RwLock<Vec<NodeEntry>>,
    variables: RwLock<Vec<NodeId>>,
}

impl Graph {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of nodes created so far (the next tag to be allocated).
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every variable, in creation order.
    pub fn variables(&self) -> Vec<NodeId> {
        self.variables.read().clone()
    }

    fn push(&self, label: String, kind: NodeKind) -> NodeId {
        let mut nodes = self.nodes.write();
        let id = nodes.len() as NodeId;
        nodes.push(NodeEntry {
            label,
            kind,
            slot: Arc::new(Slot::new()),
        });
        id
    }

    /// Create a new pending variable. Without a label it is named `var_{n}`.
    pub fn variable(self: &Arc<Self>, label: Option<&str>) -> Node {
        let mut variables = self.variables.write();
        let label = match label {
            Some(label) => label.to_string(),
            None => format!("var_{}", variables.len()),
        };
        let id = self.push(label, NodeKind::Variable);
        variables.push(id);
        Node {
            id,
            graph: Arc::clone(self),
        }
    }

    /// Create an operator node `lhs op rhs`.
    ///
    /// # Panics
    ///
    /// Panics if either operand belongs to a different graph.
    pub fn op(self: &Arc<Self>, op: Operator, lhs: &Node, rhs: Operand) -> Node {
        assert!(lhs.belongs_to(self), "operand {lhs} belongs to another graph");
        let (rhs, rhs_label) = match rhs {
            Operand::Node(node) => {
                assert!(node.belongs_to(self), "operand {node} belongs to another graph");
                (Rhs::Node(node.id), node.label())
            }
            Operand::Constant(c) => (Rhs::Constant(c), c.to_string()),
        };
        let label = format!("{}({},{})", op.name(), lhs.label(), rhs_label);
        let id = self.push(
            label,
            NodeKind::Op {
                op,
                lhs: lhs.id,
                rhs,
            },
        );
        Node {
            id,
            graph: Arc::clone(self),
        }
    }

    fn entry<R>(&self, id: NodeId, f: impl FnOnce(&NodeEntry) -> R) -> R {
        let nodes = self.nodes.read();
        f(&nodes[id as usize])
    }

    pub fn label(&self, id: NodeId) -> String {
        self.entry(id, |e| e.label.clone())
    }

    pub fn is_variable(&self, id: NodeId) -> bool {
        self.entry(id, |e| matches!(e.kind, NodeKind::Variable))
    }

    pub(crate) fn slot(&self, id: NodeId) -> Arc<Slot<Value>> {
        self.entry(id, |e| Arc::clone(&e.slot))
    }

    /// Handle for an existing node.
    pub(crate) fn node(self: &Arc<Self>, id: NodeId) -> Node {
        Node {
            id,
            graph: Arc::clone(self),
        }
    }

    /// Unresolved variables that node `id` depends on, in tag order.
    pub fn unresolved_inputs(&self, id: NodeId) -> Vec<NodeId> {
        let nodes = self.nodes.read();
        let mut found = Vec::new();
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let entry = &nodes[id as usize];
            if entry.slot.is_resolved() {
                continue;
            }
            match entry.kind {
                NodeKind::Variable => found.push(id),
                NodeKind::Op { lhs, rhs, .. } => {
                    stack.push(lhs);
                    if let Rhs::Node(rhs) = rhs {
                        stack.push(rhs);
                    }
                }
            }
        }
        found.sort_unstable();
        found.dedup();
        found
    }

    /// Await the value of node `id`, resolving operator nodes on the way.
    pub fn resolve(self: &Arc<Self>, id: NodeId) -> BoxFuture<'static, Result<Value>> {
        let graph = Arc::clone(self);
        async move {
            let (slot, kind) = graph.entry(id, |e| (Arc::clone(&e.slot), e.kind));
            if let Some(value) = slot.get() {
                return Ok(value);
            }
            match kind {
                NodeKind::Variable => Ok(slot.wait().await),
                NodeKind::Op { op, lhs, rhs } => {
                    let a = graph.resolve(lhs).await?;
                    let b = match rhs {
                        Rhs::Node(rhs) => graph.resolve(rhs).await?,
                        Rhs::Constant(c) => Value::scalar(c),
                    };
                    let value = a.zip_with(&b, op)?;
                    // Another awaiter may have finished first; keep its result.
                    slot.resolve(value.clone());
                    Ok(slot.get().unwrap_or(value))
                }
            }
        }
        .boxed()
    }
}

/// Handle to a node: its graph plus its id. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    id: NodeId,
    graph: Arc<Graph>,
}

impl Node {
    /// The node's sequence tag.
    pub fn tag(&self) -> NodeId {
        self.id
    }

    pub fn label(&self) -> String {
        self.graph.label(self.id)
    }

    pub fn is_variable(&self) -> bool {
        self.graph.is_variable(self.id)
    }

    pub fn is_resolved(&self) -> bool {
        self.graph.slot(self.id).is_resolved()
    }

    /// The value if already resolved, without waiting.
    pub fn value(&self) -> Option<Value> {
        self.graph.slot(self.id).get()
    }

    /// Wait for the node's value. Blocks indefinitely if an input never
    /// arrives; see `Runtime::evaluate` for a bounded wait.
    pub fn resolve(&self) -> BoxFuture<'static, Result<Value>> {
        self.graph.resolve(self.id)
    }

    /// `self ** exponent` as a new node.
    pub fn pow(&self, exponent: f64) -> Node {
        self.graph
            .op(Operator::Pow, self, Operand::Constant(exponent))
    }

    /// Rebind `self` to `self ** exponent`.
    pub fn pow_assign(&mut self, exponent: f64) {
        *self = self.pow(exponent);
    }

    pub(crate) fn belongs_to(&self, graph: &Arc<Graph>) -> bool {
        Arc::ptr_eq(&self.graph, graph)
    }

    pub(crate) fn slot(&self) -> Arc<Slot<Value>> {
        self.graph.slot(self.id)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.graph, &other.graph)
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        Arc::as_ptr(&self.graph).hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("tag", &self.id)
            .field("label", &self.label())
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

// ── Operator sugar ──────────────────────────────────────────────────────

impl Add<&Node> for &Node {
    type Output = Node;

    fn add(self, rhs: &Node) -> Node {
        self.graph.op(Operator::Add, self, rhs.into())
    }
}

impl Add<f64> for &Node {
    type Output = Node;

    fn add(self, rhs: f64) -> Node {
        self.graph.op(Operator::Add, self, rhs.into())
    }
}

impl Mul<&Node> for &Node {
    type Output = Node;

    fn mul(self, rhs: &Node) -> Node {
        self.graph.op(Operator::Mul, self, rhs.into())
    }
}

impl Mul<f64> for &Node {
    type Output = Node;

    fn mul(self, rhs: f64) -> Node {
        self.graph.op(Operator::Mul, self, rhs.into())
    }
}

impl MulAssign<f64> for Node {
    fn mul_assign(&mut self, rhs: f64) {
        *self = &*self * rhs;
    }
}

impl MulAssign<&Node> for Node {
    fn mul_assign(&mut self, rhs: &Node) {
        *self = &*self * rhs;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn build(graph: &Arc<Graph>) -> Vec<Node> {
        let a = graph.variable(None);
        let b = graph.variable(Some("b"));
        let c = graph.variable(None);
        let sum = &a + &b;
        let mut out = &sum * &c;
        out *= 2.0;
        out.pow_assign(3.0);
        vec![a, b, c, sum, out]
    }

    #[test]
    fn test_tags_are_sequential() {
        let graph = Graph::new();
        let nodes = build(&graph);
        let tags: Vec<NodeId> = nodes.iter().map(Node::tag).collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 6]);
        assert_eq!(graph.len(), 7);
    }

    #[test]
    fn test_tags_match_across_graphs() {
        let first = build(&Graph::new());
        let second = build(&Graph::new());
        for (x, y) in first.iter().zip(&second) {
            assert_eq!(x.tag(), y.tag());
            assert_eq!(x.label(), y.label());
            assert_ne!(x, y);
        }
    }

    #[test]
    fn test_labels() {
        let graph = Graph::new();
        let nodes = build(&graph);
        assert_eq!(nodes[0].label(), "var_0");
        assert_eq!(nodes[1].label(), "b");
        assert_eq!(nodes[2].label(), "var_2");
        assert_eq!(nodes[3].label(), "add(var_0,b)");
        assert_eq!(nodes[4].label(), "pow(mul(mul(add(var_0,b),var_2),2),3)");
        assert!(nodes[0].is_variable());
        assert!(!nodes[3].is_variable());
        assert_eq!(graph.variables(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_op_resolves_from_operands() {
        let graph = Graph::new();
        let nodes = build(&graph);
        nodes[0].slot().resolve(Value::scalar(1.0));
        nodes[1].slot().resolve(Value::scalar(2.0));
        nodes[2].slot().resolve(Value::scalar(0.5));

        let out = nodes[4].resolve().await.unwrap();
        // ((1 + 2) * 0.5 * 2) ** 3
        assert_eq!(out, Value::scalar(27.0));
        assert_eq!(nodes[3].value(), Some(Value::scalar(3.0)));
        assert!(nodes[4].is_resolved());
    }

    #[tokio::test]
    async fn test_op_waits_for_late_operand() {
        let graph = Graph::new();
        let a = graph.variable(None);
        let b = graph.variable(None);
        let sum = &a + &b;

        let pending = tokio::spawn(sum.resolve());
        a.slot().resolve(Value::scalar(4.0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        b.slot().resolve(Value::scalar(5.0));
        let value = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(value, Value::scalar(9.0));
    }

    #[tokio::test]
    async fn test_shape_error_propagates() {
        let graph = Graph::new();
        let a = graph.variable(None);
        let b = graph.variable(None);
        let sum = &a + &b;
        a.slot().resolve(Value::ones(&[2, 3]).unwrap());
        b.slot().resolve(Value::ones(&[3, 2]).unwrap());
        assert!(sum.resolve().await.is_err());
        assert!(!sum.is_resolved());
    }

    #[test]
    #[should_panic(expected = "belongs to another graph")]
    fn test_mixing_graphs_panics() {
        let a = Graph::new().variable(None);
        let b = Graph::new().variable(None);
        let _ = &a + &b;
    }
}
