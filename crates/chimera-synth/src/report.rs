//! Finished-plan reporting
//!
//! Code generators walk a finished plan's per-target module trees and
//! resource ledgers; the performance oracle attributes traffic weights to
//! the diagram path each leaf terminates. Both views are derived here so a
//! consumer never re-derives a synthesis decision.

use crate::ep::{BranchSlot, EpNodeId, ExecutionPlan};
use crate::module::{Module, TargetKind};
use crate::resource::{Resource, ResourceKind};
use chimera_diagram::{NodeId, ObjectId};
use indexmap::IndexMap;
use serde::Serialize;

/// One node of a reported module tree
#[derive(Debug, Clone, Serialize)]
pub struct ReportNode {
    /// The placed module
    pub module: Module,
    /// Diagram node it covers
    pub node: NodeId,
    /// Edge of the parent this node hangs from
    pub slot: BranchSlot,
    /// Children, oldest first
    pub children: Vec<ReportNode>,
}

/// Per-target view of a finished plan
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: TargetKind,
    /// Module tree roots, in placement order
    pub roots: Vec<ReportNode>,
    /// Final resource set
    pub resources: Vec<Resource>,
    /// Objects whose state the controller mirrors
    pub mirrored: Vec<ObjectId>,
}

/// One terminated path, for traffic-weight attribution
#[derive(Debug, Clone, Serialize)]
pub struct LeafReport {
    pub target: TargetKind,
    /// Diagram node the path terminates on
    pub terminal: NodeId,
    /// Diagram nodes along the path, root first
    pub path: Vec<NodeId>,
}

/// Everything a code generator or ranking oracle needs from one plan
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    /// Lineage counter of the reported plan
    pub generation: u64,
    /// Global placement decisions, in commit order
    pub placements: Vec<(ObjectId, ResourceKind)>,
    pub targets: Vec<TargetReport>,
    pub leaves: Vec<LeafReport>,
}

impl PlanReport {
    pub fn from_plan(ep: &ExecutionPlan) -> Self {
        let children = ep.children();

        let targets = ep
            .states()
            .map(|(target, state)| TargetReport {
                target,
                roots: state
                    .roots
                    .iter()
                    .map(|&root| build_tree(ep, &children, root))
                    .collect(),
                resources: state.bank.resources.iter().cloned().collect(),
                mirrored: state.bank.mirrored.iter().copied().collect(),
            })
            .collect();

        let mut leaves = Vec::new();
        for (id, node) in ep.iter_nodes() {
            if children.get(&id).is_none() {
                leaves.push(LeafReport {
                    target: node.module.target,
                    terminal: node.node,
                    path: ep.path_nodes(Some(id)),
                });
            }
        }

        Self {
            generation: ep.generation,
            placements: ep.global().iter().collect(),
            targets,
            leaves,
        }
    }

    /// Total number of placed modules across all targets
    pub fn module_count(&self) -> usize {
        fn count(node: &ReportNode) -> usize {
            1 + node.children.iter().map(count).sum::<usize>()
        }
        self.targets
            .iter()
            .flat_map(|t| &t.roots)
            .map(count)
            .sum()
    }
}

fn build_tree(
    ep: &ExecutionPlan,
    children: &IndexMap<EpNodeId, Vec<EpNodeId>>,
    id: EpNodeId,
) -> ReportNode {
    let node = ep.ep_node(id);
    ReportNode {
        module: node.module.clone(),
        node: node.node,
        slot: node.slot,
        children: children
            .get(&id)
            .map(|kids| kids.iter().map(|&k| build_tree(ep, children, k)).collect())
            .unwrap_or_default(),
    }
}
