//! Diagram surgery
//!
//! The one place diagrams are mutated after construction. Speculative
//! controller rewriting clones the residual sub-diagram and splices replayed
//! operations in front of it; everything else in the engine treats node
//! identity as stable. Cloned nodes always receive fresh ids from the
//! diagram's monotonic allocator, and ids are never reused.

use crate::diagram::{CallNode, Diagram, DiagramNode, NodeId, NodeKind};
use crate::Result;
use indexmap::IndexMap;

/// Mutating handle over a diagram
pub struct DiagramSurgeon<'a> {
    diagram: &'a mut Diagram,
}

impl<'a> DiagramSurgeon<'a> {
    pub fn new(diagram: &'a mut Diagram) -> Self {
        Self { diagram }
    }

    /// Clone a single node. The clone keeps the original's successor links.
    pub fn clone_node(&mut self, id: NodeId) -> Result<NodeId> {
        let kind = self.diagram.node(id)?.kind.clone();
        let new_id = self.diagram.alloc_id();
        self.diagram.insert(DiagramNode { id: new_id, kind });
        Ok(new_id)
    }

    /// Deep-clone everything reachable from `root`.
    ///
    /// Returns the old-to-new id mapping; internal successor links are
    /// rewritten through it, links leaving the region are left alone.
    pub fn clone_subtree(&mut self, root: NodeId) -> Result<IndexMap<NodeId, NodeId>> {
        let region = self.diagram.reachable_from(root);
        let mut mapping = IndexMap::new();
        for &old in &region {
            self.diagram.node(old)?;
            let new_id = self.diagram.alloc_id();
            mapping.insert(old, new_id);
        }
        for (&old, &new_id) in &mapping {
            let mut kind = self.diagram.node(old)?.kind.clone();
            remap_links(&mut kind, &mapping);
            self.diagram.insert(DiagramNode { id: new_id, kind });
        }
        Ok(mapping)
    }

    /// Relink one outgoing edge of `node` from `old` to `new`.
    pub fn replace_next(&mut self, node: NodeId, old: NodeId, new: NodeId) -> Result<()> {
        let n = self.diagram.node_mut(node)?;
        match &mut n.kind {
            NodeKind::Call(c) => {
                if c.next == Some(old) {
                    c.next = Some(new);
                }
            }
            NodeKind::Branch(b) => {
                if b.on_true == old {
                    b.on_true = new;
                }
                if b.on_false == old {
                    b.on_false = new;
                }
            }
            NodeKind::Return(_) => {}
        }
        Ok(())
    }

    /// Redirect every edge into `old` to point at `new` instead.
    pub fn replace_prev(&mut self, old: NodeId, new: NodeId) -> Result<()> {
        for pred in self.diagram.predecessors(old) {
            self.replace_next(pred, old, new)?;
        }
        Ok(())
    }

    /// Insert a fresh Call node whose successor is `before`.
    ///
    /// Used to splice replayed operations in front of a continuation; the
    /// caller wires the new node into whatever should precede it.
    pub fn prepend_call(&mut self, mut call: CallNode, before: NodeId) -> NodeId {
        call.next = Some(before);
        self.diagram.add_call(call)
    }
}

fn remap_links(kind: &mut NodeKind, mapping: &IndexMap<NodeId, NodeId>) {
    match kind {
        NodeKind::Call(c) => {
            if let Some(next) = c.next {
                if let Some(&mapped) = mapping.get(&next) {
                    c.next = Some(mapped);
                }
            }
        }
        NodeKind::Branch(b) => {
            if let Some(&mapped) = mapping.get(&b.on_true) {
                b.on_true = mapped;
            }
            if let Some(&mapped) = mapping.get(&b.on_false) {
                b.on_false = mapped;
            }
        }
        NodeKind::Return(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{BranchNode, ReturnNode, RouteOp};
    use chimera_expr::Expr;

    #[test]
    fn clone_subtree_gets_fresh_ids_and_remapped_links() {
        let mut d = Diagram::new("t");
        let ret = d.add_return(ReturnNode {
            operation: RouteOp::Drop,
            port: None,
        });
        let branch = d.add_branch(BranchNode {
            condition: Expr::symbol("c"),
            on_true: ret,
            on_false: ret,
        });
        d.set_root(branch);
        let before = d.len();

        let mapping = DiagramSurgeon::new(&mut d).clone_subtree(branch).unwrap();
        assert_eq!(d.len(), before + 2);

        let new_branch = mapping[&branch];
        let cloned = d.node(new_branch).unwrap().as_branch().unwrap();
        assert_eq!(cloned.on_true, mapping[&ret]);
        assert_ne!(new_branch, branch);
        // original untouched
        assert_eq!(d.node(branch).unwrap().as_branch().unwrap().on_true, ret);
    }

    #[test]
    fn replace_prev_redirects_all_incoming_edges() {
        let mut d = Diagram::new("t");
        let old = d.add_return(ReturnNode {
            operation: RouteOp::Drop,
            port: None,
        });
        let new = d.add_return(ReturnNode {
            operation: RouteOp::Broadcast,
            port: None,
        });
        let branch = d.add_branch(BranchNode {
            condition: Expr::symbol("c"),
            on_true: old,
            on_false: old,
        });
        d.set_root(branch);

        DiagramSurgeon::new(&mut d).replace_prev(old, new).unwrap();
        let b = d.node(branch).unwrap().as_branch().unwrap();
        assert_eq!((b.on_true, b.on_false), (new, new));
    }
}
