//! Decision-diagram node model
//!
//! A diagram is a rooted DAG of Call, Branch, and Return nodes distilled
//! from symbolic-execution traces of the reference network function. Nodes
//! are kept in an id-keyed table; ids are allocated monotonically and never
//! reused, so clones made by surgery always get fresh identities.

use crate::{DiagramError, Result};
use chimera_expr::Expr;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Diagram node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of one stateful object instance in the reference behavior.
///
/// Used only as a key; the object itself is never materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call argument: a plain value, or a before/after pair for in-out state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallArg {
    /// Read-only argument
    Value(Expr),
    /// In-out argument modeling a value's state before and after the call
    InOut { before: Expr, after: Expr },
}

impl CallArg {
    /// The incoming value of the argument
    pub fn input(&self) -> &Expr {
        match self {
            CallArg::Value(e) => e,
            CallArg::InOut { before, .. } => before,
        }
    }

    /// The outgoing value, when the call rewrites the argument
    pub fn output(&self) -> Option<&Expr> {
        match self {
            CallArg::Value(_) => None,
            CallArg::InOut { after, .. } => Some(after),
        }
    }
}

/// Side-effecting operation on an abstract stateful object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallNode {
    /// Operation name (see [`crate::functions`])
    pub function: String,
    /// The stateful object the call addresses, if any
    pub object: Option<ObjectId>,
    /// Named arguments, in call order
    pub args: IndexMap<String, CallArg>,
    /// Expression the call returns
    pub ret: Option<Expr>,
    /// Symbol names bound by this call (hit flags, read values, timestamps)
    pub symbols: Vec<String>,
    /// Successor node
    pub next: Option<NodeId>,
}

impl CallNode {
    /// Incoming value of a named argument
    pub fn arg(&self, name: &str) -> Option<&Expr> {
        self.args.get(name).map(CallArg::input)
    }

    /// Outgoing value of a named in-out argument
    pub fn arg_out(&self, name: &str) -> Option<&Expr> {
        self.args.get(name).and_then(CallArg::output)
    }
}

/// Two-way branch on a computed predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchNode {
    /// Branch predicate
    pub condition: Expr,
    /// Successor when the predicate holds
    pub on_true: NodeId,
    /// Successor when it does not
    pub on_false: NodeId,
}

/// Terminal routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteOp {
    /// Discard the packet
    Drop,
    /// Send out one port
    Forward,
    /// Flood to all ports
    Broadcast,
}

/// Terminal node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnNode {
    /// Routing decision
    pub operation: RouteOp,
    /// Destination port for [`RouteOp::Forward`]
    pub port: Option<Expr>,
}

/// Node kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Call(CallNode),
    Branch(BranchNode),
    Return(ReturnNode),
}

/// One diagram node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramNode {
    /// Node identifier
    pub id: NodeId,
    /// Node payload
    pub kind: NodeKind,
}

impl DiagramNode {
    /// The Call payload, if this is a Call node
    pub fn as_call(&self) -> Option<&CallNode> {
        match &self.kind {
            NodeKind::Call(c) => Some(c),
            _ => None,
        }
    }

    /// The Branch payload, if this is a Branch node
    pub fn as_branch(&self) -> Option<&BranchNode> {
        match &self.kind {
            NodeKind::Branch(b) => Some(b),
            _ => None,
        }
    }

    /// The Return payload, if this is a Return node
    pub fn as_return(&self) -> Option<&ReturnNode> {
        match &self.kind {
            NodeKind::Return(r) => Some(r),
            _ => None,
        }
    }

    /// Successor node ids, in on-true/on-false order for branches
    pub fn successors(&self) -> Vec<NodeId> {
        match &self.kind {
            NodeKind::Call(c) => c.next.into_iter().collect(),
            NodeKind::Branch(b) => vec![b.on_true, b.on_false],
            NodeKind::Return(_) => Vec::new(),
        }
    }
}

/// A decision diagram: id-keyed node table plus a monotonic id allocator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagram {
    /// Diagram name (the network function it models)
    pub name: String,
    /// Entry node
    pub root: Option<NodeId>,
    /// Node table; serialized as a flat node list since ids live in the nodes
    #[serde(
        serialize_with = "serialize_nodes",
        deserialize_with = "deserialize_nodes"
    )]
    nodes: IndexMap<NodeId, DiagramNode>,
    /// Next id to hand out; never decremented
    next_id: u64,
}

fn serialize_nodes<S>(
    nodes: &IndexMap<NodeId, DiagramNode>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_seq(nodes.values())
}

fn deserialize_nodes<'de, D>(
    deserializer: D,
) -> std::result::Result<IndexMap<NodeId, DiagramNode>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let nodes = Vec::<DiagramNode>::deserialize(deserializer)?;
    Ok(nodes.into_iter().map(|n| (n.id, n)).collect())
}

impl Diagram {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: None,
            nodes: IndexMap::new(),
            next_id: 0,
        }
    }

    /// Entry node id
    pub fn root(&self) -> Result<NodeId> {
        self.root.ok_or(DiagramError::MissingRoot)
    }

    pub fn set_root(&mut self, id: NodeId) {
        self.root = Some(id);
    }

    /// Number of nodes in the table
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn alloc_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn insert(&mut self, node: DiagramNode) {
        self.nodes.insert(node.id, node);
    }

    /// Add a Call node
    pub fn add_call(&mut self, call: CallNode) -> NodeId {
        let id = self.alloc_id();
        self.insert(DiagramNode {
            id,
            kind: NodeKind::Call(call),
        });
        id
    }

    /// Add a Branch node
    pub fn add_branch(&mut self, branch: BranchNode) -> NodeId {
        let id = self.alloc_id();
        self.insert(DiagramNode {
            id,
            kind: NodeKind::Branch(branch),
        });
        id
    }

    /// Add a Return node
    pub fn add_return(&mut self, ret: ReturnNode) -> NodeId {
        let id = self.alloc_id();
        self.insert(DiagramNode {
            id,
            kind: NodeKind::Return(ret),
        });
        id
    }

    /// Look a node up
    pub fn node(&self, id: NodeId) -> Result<&DiagramNode> {
        self.nodes.get(&id).ok_or(DiagramError::UnknownNode(id.0))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut DiagramNode> {
        self.nodes
            .get_mut(&id)
            .ok_or(DiagramError::UnknownNode(id.0))
    }

    /// The Call payload of a node
    pub fn call(&self, id: NodeId) -> Result<&CallNode> {
        self.node(id)?
            .as_call()
            .ok_or(DiagramError::WrongKind(id.0, "Call"))
    }

    /// All nodes, in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &DiagramNode> {
        self.nodes.values()
    }

    /// Successor ids of a node
    pub fn successors(&self, id: NodeId) -> Result<Vec<NodeId>> {
        Ok(self.node(id)?.successors())
    }

    /// Predecessor ids of a node (whole-table scan)
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.successors().contains(&id))
            .map(|n| n.id)
            .collect()
    }

    /// Every node reachable from `from`, including `from` itself
    pub fn reachable_from(&self, from: NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Ok(node) = self.node(id) {
                stack.extend(node.successors());
            }
        }
        seen
    }

    /// All calls to `function` reachable from `from`
    pub fn find_calls_to(&self, function: &str, from: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .reachable_from(from)
            .into_iter()
            .filter(|id| {
                self.node(*id)
                    .ok()
                    .and_then(DiagramNode::as_call)
                    .is_some_and(|c| c.function == function)
            })
            .collect();
        out.sort();
        out
    }

    /// Every call node addressing `obj`, across the whole diagram
    pub fn calls_on_object(&self, obj: ObjectId) -> Vec<&DiagramNode> {
        self.nodes
            .values()
            .filter(|n| n.as_call().is_some_and(|c| c.object == Some(obj)))
            .collect()
    }

    /// Branch conditions accumulated along the path from the root to `to`.
    ///
    /// Returns the constraints of the first root-to-node path found, or None
    /// when `to` is unreachable.
    pub fn path_constraints(&self, to: NodeId) -> Option<Vec<Expr>> {
        let root = self.root?;
        let mut seen = BTreeSet::new();
        self.constraints_dfs(root, to, &mut seen, &mut Vec::new())
    }

    fn constraints_dfs(
        &self,
        at: NodeId,
        to: NodeId,
        seen: &mut BTreeSet<NodeId>,
        acc: &mut Vec<Expr>,
    ) -> Option<Vec<Expr>> {
        if at == to {
            return Some(acc.clone());
        }
        if !seen.insert(at) {
            return None;
        }
        match &self.node(at).ok()?.kind {
            NodeKind::Call(c) => {
                let next = c.next?;
                self.constraints_dfs(next, to, seen, acc)
            }
            NodeKind::Branch(b) => {
                acc.push(b.condition.clone());
                if let Some(found) = self.constraints_dfs(b.on_true, to, seen, acc) {
                    return Some(found);
                }
                acc.pop();
                acc.push(Expr::not(b.condition.clone()));
                let found = self.constraints_dfs(b.on_false, to, seen, acc);
                acc.pop();
                found
            }
            NodeKind::Return(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions;

    fn sample() -> (Diagram, NodeId, NodeId, NodeId) {
        let mut d = Diagram::new("fw");
        let fwd = d.add_return(ReturnNode {
            operation: RouteOp::Forward,
            port: Some(Expr::int(1)),
        });
        let drop = d.add_return(ReturnNode {
            operation: RouteOp::Drop,
            port: None,
        });
        let branch = d.add_branch(BranchNode {
            condition: Expr::eq(Expr::symbol("hit"), Expr::int(1)),
            on_true: fwd,
            on_false: drop,
        });
        let get = d.add_call(CallNode {
            function: functions::MAP_GET.into(),
            object: Some(ObjectId(7)),
            args: IndexMap::from([(
                "key".to_string(),
                CallArg::Value(Expr::field("ipv4", "src_addr")),
            )]),
            ret: Some(Expr::symbol("flow_idx")),
            symbols: vec!["flow_idx".into(), "hit".into()],
            next: Some(branch),
        });
        d.set_root(get);
        (d, get, branch, drop)
    }

    #[test]
    fn reachability_and_predecessors() {
        let (d, get, branch, drop) = sample();
        assert_eq!(d.reachable_from(get).len(), 4);
        assert_eq!(d.predecessors(branch), vec![get]);
        assert_eq!(d.predecessors(drop), vec![branch]);
    }

    #[test]
    fn find_calls_is_scoped_to_reachable_region() {
        let (d, get, branch, _) = sample();
        assert_eq!(d.find_calls_to(functions::MAP_GET, get), vec![get]);
        assert!(d.find_calls_to(functions::MAP_GET, branch).is_empty());
    }

    #[test]
    fn diagram_round_trips_through_json() {
        let (d, _, _, _) = sample();
        let text = serde_json::to_string(&d).unwrap();
        let back: Diagram = serde_json::from_str(&text).unwrap();
        assert_eq!(back.len(), d.len());
        assert_eq!(back.root, d.root);
        let root = back.root().unwrap();
        assert_eq!(
            back.node(root).unwrap().as_call().unwrap().function,
            functions::MAP_GET
        );
    }

    #[test]
    fn path_constraints_negate_the_false_edge() {
        let (d, _, _, drop) = sample();
        let constraints = d.path_constraints(drop).unwrap();
        assert_eq!(constraints.len(), 1);
        assert_eq!(
            constraints[0],
            Expr::not(Expr::eq(Expr::symbol("hit"), Expr::int(1)))
        );
    }
}
