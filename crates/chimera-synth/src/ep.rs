//! Execution plans: persistent trees of placed modules
//!
//! A plan is a forest of per-target module trees plus the frontier of
//! diagram nodes still awaiting processing. The search fans out many
//! divergent continuations from one prefix, so plans branch by copy-on-write:
//! tree nodes live in an append-only arena of frozen segments shared by Arc
//! between sibling plans, while the frontier and all memory banks are cloned
//! per branch. Nodes hold parent links only; child maps are derived when a
//! finished plan is reported.

use crate::bank::{GlobalBank, MemoryBank};
use crate::error::{Result, SynthError};
use crate::module::{Module, TargetKind};
use chimera_diagram::{Diagram, NodeId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Index of a node in the plan arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EpNodeId(pub u32);

impl std::fmt::Display for EpNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which edge of its parent a node hangs from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchSlot {
    /// Sequential successor
    Seq,
    /// True side of a control-flow split
    Then,
    /// False side of a control-flow split
    Else,
}

/// One placed module in a plan tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpNode {
    /// The placed module
    pub module: Module,
    /// Diagram node that triggered the placement
    pub node: NodeId,
    /// Parent in the target's tree; None for roots
    pub parent: Option<EpNodeId>,
    /// Edge of the parent this node hangs from
    pub slot: BranchSlot,
}

/// A frozen run of arena nodes, chained toward older segments
#[derive(Debug)]
struct Segment {
    /// Arena index of the first node in this segment
    base: usize,
    nodes: Vec<EpNode>,
    prev: Option<Arc<Segment>>,
}

/// Append-only node arena with structure-sharing forks.
///
/// Mutation happens only in the private tail; sealing moves the tail into a
/// frozen segment, so forking shares every sealed segment and copies nothing
/// but per-plan bookkeeping.
#[derive(Debug, Default)]
struct EpArena {
    frozen: Option<Arc<Segment>>,
    frozen_len: usize,
    tail: Vec<EpNode>,
}

impl Clone for EpArena {
    fn clone(&self) -> Self {
        Self {
            frozen: self.frozen.clone(),
            frozen_len: self.frozen_len,
            tail: self.tail.clone(),
        }
    }
}

impl EpArena {
    fn len(&self) -> usize {
        self.frozen_len + self.tail.len()
    }

    fn push(&mut self, node: EpNode) -> EpNodeId {
        let id = EpNodeId(self.len() as u32);
        self.tail.push(node);
        id
    }

    fn get(&self, id: EpNodeId) -> &EpNode {
        let idx = id.0 as usize;
        if idx >= self.frozen_len {
            return &self.tail[idx - self.frozen_len];
        }
        let mut seg = self.frozen.as_ref().expect("arena segment chain broken");
        loop {
            if idx >= seg.base {
                return &seg.nodes[idx - seg.base];
            }
            seg = seg.prev.as_ref().expect("arena segment chain broken");
        }
    }

    /// Move the private tail into a frozen, shareable segment
    fn seal(&mut self) {
        if self.tail.is_empty() {
            return;
        }
        let nodes = std::mem::take(&mut self.tail);
        let base = self.frozen_len;
        self.frozen_len += nodes.len();
        self.frozen = Some(Arc::new(Segment {
            base,
            nodes,
            prev: self.frozen.take(),
        }));
    }
}

/// One pending attachment point for a frontier node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attachment {
    /// Leaf the next module will hang under; None starts a new root
    pub parent: Option<EpNodeId>,
    /// Edge of the parent to occupy
    pub slot: BranchSlot,
}

/// Frontier record for one diagram node awaiting processing
#[derive(Debug, Clone, PartialEq)]
pub struct FrontierEntry {
    /// Target whose tree continues here; None until a first module claims
    /// the node, at which point the plan is committed to that technology
    pub target: Option<TargetKind>,
    /// Attachment point(s); more than one after a postponement replay
    pub attachments: Vec<Attachment>,
}

/// Where the frontier advances after a module placement
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Continuation {
    /// Terminal module; the path ends here
    Stop,
    /// Single successor
    Next(NodeId),
    /// Control-flow split
    Branch { on_true: NodeId, on_false: NodeId },
}

/// Per-target portion of a plan
#[derive(Debug, Clone, Default)]
pub struct TargetPlanState {
    /// Tree roots, in placement order (hand-offs can create several)
    pub roots: Vec<EpNodeId>,
    /// The target's resource ledger
    pub bank: MemoryBank,
}

/// A candidate implementation under construction
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Lineage counter, bumped on every fork
    pub generation: u64,
    arena: EpArena,
    frontier: IndexMap<NodeId, FrontierEntry>,
    states: IndexMap<TargetKind, TargetPlanState>,
    global: GlobalBank,
}

impl ExecutionPlan {
    /// Empty plan positioned at the diagram root, claimable by any entry target
    pub fn new(root: NodeId) -> Self {
        let mut frontier = IndexMap::new();
        frontier.insert(
            root,
            FrontierEntry {
                target: None,
                attachments: vec![Attachment {
                    parent: None,
                    slot: BranchSlot::Seq,
                }],
            },
        );
        Self {
            generation: 0,
            arena: EpArena::default(),
            frontier,
            states: IndexMap::new(),
            global: GlobalBank::default(),
        }
    }

    /// Copy-on-write clone: the arena's sealed segments are shared, the
    /// frontier and every memory bank are duplicated for the new branch.
    pub fn fork(&self) -> Self {
        let mut clone = self.clone();
        clone.generation += 1;
        clone
    }

    /// No frontier work remains
    pub fn finished(&self) -> bool {
        self.frontier.is_empty()
    }

    pub fn frontier(&self) -> &IndexMap<NodeId, FrontierEntry> {
        &self.frontier
    }

    pub fn entry(&self, node: NodeId) -> Option<&FrontierEntry> {
        self.frontier.get(&node)
    }

    pub fn global(&self) -> &GlobalBank {
        &self.global
    }

    pub fn global_mut(&mut self) -> &mut GlobalBank {
        &mut self.global
    }

    /// The target's bank, if the target has been used by this plan
    pub fn bank(&self, target: TargetKind) -> Option<&MemoryBank> {
        self.states.get(&target).map(|s| &s.bank)
    }

    /// The target's bank, created on first use
    pub fn bank_mut(&mut self, target: TargetKind) -> &mut MemoryBank {
        &mut self.states.entry(target).or_default().bank
    }

    /// Targets used so far, with their tree roots and banks
    pub fn states(&self) -> impl Iterator<Item = (TargetKind, &TargetPlanState)> {
        self.states.iter().map(|(&t, s)| (t, s))
    }

    /// Number of placed modules
    pub fn node_count(&self) -> usize {
        self.arena.len()
    }

    pub fn ep_node(&self, id: EpNodeId) -> &EpNode {
        self.arena.get(id)
    }

    /// All placed nodes, in placement order
    pub fn iter_nodes(&self) -> impl Iterator<Item = (EpNodeId, &EpNode)> {
        (0..self.arena.len() as u32).map(move |i| (EpNodeId(i), self.arena.get(EpNodeId(i))))
    }

    /// Diagram nodes along the tree path ending at `leaf`, root first
    pub fn path_nodes(&self, leaf: Option<EpNodeId>) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cursor = leaf;
        while let Some(id) = cursor {
            let n = self.arena.get(id);
            out.push(n.node);
            cursor = n.parent;
        }
        out.reverse();
        out
    }

    /// The single mutation primitive: attach `module` beneath every pending
    /// attachment of `node` and advance the frontier per `next`.
    pub fn add_leaves(
        &mut self,
        node: NodeId,
        module: Module,
        next: Continuation,
    ) -> Result<Vec<EpNodeId>> {
        let entry = self
            .frontier
            .shift_remove(&node)
            .ok_or(SynthError::NotOnFrontier(node))?;
        if let Some(owner) = entry.target {
            if owner != module.target {
                return Err(SynthError::WrongOwner {
                    node,
                    owner: owner.to_string(),
                    module_target: module.target.to_string(),
                });
            }
        }
        if matches!(next, Continuation::Branch { .. }) && !module.op.is_control_flow() {
            return Err(SynthError::Invariant(format!(
                "non-control-flow module cannot split the frontier at node {}",
                node
            )));
        }

        let target = module.target;
        let mut new_ids = Vec::with_capacity(entry.attachments.len());
        for attachment in &entry.attachments {
            let id = self.arena.push(EpNode {
                module: module.clone(),
                node,
                parent: attachment.parent,
                slot: attachment.slot,
            });
            if attachment.parent.is_none() {
                self.states.entry(target).or_default().roots.push(id);
            }
            new_ids.push(id);
        }

        match next {
            Continuation::Stop => {}
            Continuation::Next(succ) => {
                for &id in &new_ids {
                    self.push_attachment(succ, target, Attachment {
                        parent: Some(id),
                        slot: BranchSlot::Seq,
                    })?;
                }
            }
            Continuation::Branch { on_true, on_false } => {
                for &id in &new_ids {
                    self.push_attachment(on_true, target, Attachment {
                        parent: Some(id),
                        slot: BranchSlot::Then,
                    })?;
                    self.push_attachment(on_false, target, Attachment {
                        parent: Some(id),
                        slot: BranchSlot::Else,
                    })?;
                }
            }
        }

        self.arena.seal();
        Ok(new_ids)
    }

    /// Advance the frontier past `node` with no emitted module, used when a
    /// module class determines the node has no target-visible effect.
    pub fn ignore_node(
        &mut self,
        target: TargetKind,
        node: NodeId,
        successors: &[NodeId],
    ) -> Result<()> {
        let entry = self
            .frontier
            .shift_remove(&node)
            .ok_or(SynthError::NotOnFrontier(node))?;
        if let Some(owner) = entry.target {
            if owner != target {
                return Err(SynthError::WrongOwner {
                    node,
                    owner: owner.to_string(),
                    module_target: target.to_string(),
                });
            }
        }
        for &succ in successors {
            for attachment in &entry.attachments {
                self.push_attachment(succ, target, *attachment)?;
            }
        }
        Ok(())
    }

    /// Drop `node` from the frontier: no further work is scheduled there.
    pub fn force_termination(&mut self, node: NodeId) -> Result<()> {
        self.frontier
            .shift_remove(&node)
            .map(|_| ())
            .ok_or(SynthError::NotOnFrontier(node))
    }

    /// Open a new frontier entry with a fresh root attachment, used by the
    /// hand-off to start the controller's tree at the continuation node.
    pub fn seed_frontier(&mut self, node: NodeId, target: TargetKind) -> Result<()> {
        self.push_attachment(
            node,
            target,
            Attachment {
                parent: None,
                slot: BranchSlot::Seq,
            },
        )
    }

    /// Record a postponed operation and advance past its node.
    pub fn postpone(
        &mut self,
        target: TargetKind,
        node: NodeId,
        module: Module,
        successors: &[NodeId],
    ) -> Result<()> {
        self.bank_mut(target).postpone(node, module);
        self.ignore_node(target, node, successors)
    }

    /// Replay recorded postponements whose trigger node leads to `at`.
    ///
    /// Each ready module is spliced, payload untouched, as a chain of new
    /// leaves below every pending attachment of `at`; the attachments then
    /// continue beneath the spliced chain. Replayed records are discarded;
    /// the rest stay queued for this branch.
    pub fn replay_postponed(
        &mut self,
        diagram: &Diagram,
        target: TargetKind,
        at: NodeId,
    ) -> Result<usize> {
        let Some(state) = self.states.get_mut(&target) else {
            return Ok(0);
        };
        let pending = std::mem::take(&mut state.bank.postponed);
        let (ready, kept): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|op| diagram.reachable_from(op.node).contains(&at));
        self.states
            .get_mut(&target)
            .expect("state vanished during replay")
            .bank
            .postponed = kept;
        if ready.is_empty() {
            return Ok(0);
        }

        let Some(entry) = self.frontier.get_mut(&at) else {
            return Err(SynthError::NotOnFrontier(at));
        };
        let mut attachments = std::mem::take(&mut entry.attachments);
        let count = ready.len();
        for attachment in &mut attachments {
            let mut parent = attachment.parent;
            let mut slot = attachment.slot;
            for op in &ready {
                let id = self.arena.push(EpNode {
                    module: op.module.clone(),
                    node: op.node,
                    parent,
                    slot,
                });
                if parent.is_none() {
                    self.states.entry(target).or_default().roots.push(id);
                }
                parent = Some(id);
                slot = BranchSlot::Seq;
            }
            attachment.parent = parent;
            attachment.slot = slot;
        }
        let entry = self
            .frontier
            .get_mut(&at)
            .expect("frontier entry vanished during replay");
        entry.attachments = attachments;

        self.arena.seal();
        Ok(count)
    }

    /// Derived child map, oldest-first per parent
    pub fn children(&self) -> IndexMap<EpNodeId, Vec<EpNodeId>> {
        let mut map: IndexMap<EpNodeId, Vec<EpNodeId>> = IndexMap::new();
        for (id, node) in self.iter_nodes() {
            if let Some(parent) = node.parent {
                map.entry(parent).or_default().push(id);
            }
        }
        map
    }

    fn push_attachment(
        &mut self,
        node: NodeId,
        target: TargetKind,
        attachment: Attachment,
    ) -> Result<()> {
        let entry = self.frontier.entry(node).or_insert_with(|| FrontierEntry {
            target: Some(target),
            attachments: Vec::new(),
        });
        match entry.target {
            Some(owner) if owner != target => Err(SynthError::WrongOwner {
                node,
                owner: owner.to_string(),
                module_target: target.to_string(),
            }),
            _ => {
                entry.target = Some(target);
                entry.attachments.push(attachment);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleOp;
    use chimera_expr::Expr;

    fn module(target: TargetKind, op: ModuleOp, node: NodeId) -> Module {
        Module::new(target, op, node)
    }

    #[test]
    fn forked_plans_share_sealed_segments() {
        let n0 = NodeId(0);
        let n1 = NodeId(1);
        let mut ep = ExecutionPlan::new(n0);
        ep.add_leaves(
            n0,
            module(TargetKind::SwitchAsic, ModuleOp::Broadcast, n0),
            Continuation::Stop,
        )
        .unwrap();

        let fork = ep.fork();
        assert_eq!(fork.node_count(), 1);
        assert_eq!(fork.generation, ep.generation + 1);
        // both plans read the same sealed node
        assert_eq!(ep.ep_node(EpNodeId(0)).node, n0);
        assert_eq!(fork.ep_node(EpNodeId(0)).node, n0);
        assert!(ep.finished());
        let _ = n1;
    }

    #[test]
    fn control_flow_split_yields_two_attachments() {
        let root = NodeId(0);
        let t = NodeId(1);
        let f = NodeId(2);
        let mut ep = ExecutionPlan::new(root);
        let ids = ep
            .add_leaves(
                root,
                module(
                    TargetKind::SwitchAsic,
                    ModuleOp::If {
                        condition: Expr::symbol("c"),
                    },
                    root,
                ),
                Continuation::Branch {
                    on_true: t,
                    on_false: f,
                },
            )
            .unwrap();
        assert_eq!(ids.len(), 1);
        let then_entry = ep.entry(t).unwrap();
        let else_entry = ep.entry(f).unwrap();
        assert_eq!(then_entry.attachments[0].slot, BranchSlot::Then);
        assert_eq!(else_entry.attachments[0].slot, BranchSlot::Else);
        assert_eq!(then_entry.target, Some(TargetKind::SwitchAsic));
    }

    #[test]
    fn non_control_flow_module_cannot_split() {
        let root = NodeId(0);
        let mut ep = ExecutionPlan::new(root);
        let err = ep.add_leaves(
            root,
            module(TargetKind::SwitchAsic, ModuleOp::Drop, root),
            Continuation::Branch {
                on_true: NodeId(1),
                on_false: NodeId(2),
            },
        );
        assert!(matches!(err, Err(SynthError::Invariant(_))));
    }

    #[test]
    fn force_termination_unschedules_a_path() {
        let root = NodeId(0);
        let mut ep = ExecutionPlan::new(root);
        ep.force_termination(root).unwrap();
        assert!(ep.finished());
        assert!(matches!(
            ep.force_termination(root),
            Err(SynthError::NotOnFrontier(_))
        ));
    }

    #[test]
    fn wrong_target_cannot_continue_a_claimed_path() {
        let root = NodeId(0);
        let next = NodeId(1);
        let mut ep = ExecutionPlan::new(root);
        ep.add_leaves(
            root,
            module(
                TargetKind::SwitchAsic,
                ModuleOp::ParseHeader {
                    header: "ethernet".into(),
                },
                root,
            ),
            Continuation::Next(next),
        )
        .unwrap();

        let err = ep.add_leaves(
            next,
            module(TargetKind::PacketCore, ModuleOp::Drop, next),
            Continuation::Stop,
        );
        assert!(matches!(err, Err(SynthError::WrongOwner { .. })));
    }
}
