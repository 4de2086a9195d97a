//! Controller target and the speculative switch-to-controller hand-off
//!
//! The hand-off is the one module that rewrites the diagram: it clones the
//! residual sub-diagram, re-derives which upstream parse and state-read
//! operations the controller must replay (their results are not carried in
//! the punt payload), splices clones of exactly those in front of the
//! continuation, and terminates the switch path with a punt. The controller
//! target itself is a plain software dataplane that can only be entered
//! through a hand-off.

use crate::software::dataplane_modules;
use chimera_diagram::{functions, CallNode, Diagram, DiagramSurgeon, NodeId, ObjectId};
use chimera_synth::{
    Continuation, ExecutionPlan, Module, ModuleMatcher, ModuleOp, ProcessOutcome, Resource,
    Result, SynthContext, Target, TargetKind,
};
use std::collections::BTreeSet;
use tracing::debug;

/// Operations the controller can re-execute from the punted packet alone
const REPLAYABLE: &[&str] = &[
    functions::PACKET_EXTRACT,
    functions::TIME_NOW,
    functions::MAP_GET,
    functions::VECTOR_BORROW,
    functions::INDEX_LIVE,
];

/// Replayed operations whose backing state must be mirrored off-switch
const MIRRORED: &[&str] = &[
    functions::MAP_GET,
    functions::VECTOR_BORROW,
    functions::INDEX_LIVE,
];

/// Punt the rest of the diagram to the controller
pub struct HandOff;

impl ModuleMatcher for HandOff {
    fn name(&self) -> &'static str {
        "send-to-controller"
    }

    fn target(&self) -> TargetKind {
        TargetKind::SwitchAsic
    }

    fn process(
        &self,
        cx: &SynthContext<'_>,
        ep: &ExecutionPlan,
        node: NodeId,
    ) -> Result<ProcessOutcome> {
        let Some(entry) = ep.entry(node) else {
            return Ok(ProcessOutcome::no_match());
        };
        // only mid-path on the switch; full-software plans are the packet
        // core's job, and the controller never punts to itself
        if entry.target != Some(TargetKind::SwitchAsic) {
            return Ok(ProcessOutcome::no_match());
        }
        let Some(parent) = entry.attachments.first().and_then(|a| a.parent) else {
            return Ok(ProcessOutcome::no_match());
        };

        {
            let diagram = cx.diagram();
            let Some(call) = diagram.node(node)?.as_call() else {
                return Ok(ProcessOutcome::no_match());
            };
            // cross-target pruning: punting a refresh is statically redundant
            // once an on-switch allocator owns the object's liveness
            if call.function == functions::INDEX_REFRESH {
                if let Some(obj) = call.object {
                    for (_, state) in ep.states() {
                        let delegated = state.bank.delegations.contains_key(&obj)
                            || matches!(
                                state.bank.resources.for_object(obj),
                                Some(Resource::IntegerAllocator(_))
                            );
                        if delegated {
                            debug!(
                                object = obj.0,
                                "hand-off pruned, rejuvenation already delegated on-switch"
                            );
                            return Ok(ProcessOutcome::no_match());
                        }
                    }
                }
            }
        }

        let upstream = ep.path_nodes(Some(parent));

        // rewrite phase: clone the continuation, splice replayed operations
        let (cont, mirrored) = {
            let mut d = cx.diagram_mut();
            let mapping = DiagramSurgeon::new(&mut d).clone_subtree(node)?;
            let mut cont = mapping[&node];

            let needed = region_unbound_symbols(&d, cont);
            let mut mirrored: Vec<ObjectId> = Vec::new();
            let mut replay: Vec<CallNode> = Vec::new();
            for &up in &upstream {
                let Some(call) = d.node(up)?.as_call() else {
                    continue;
                };
                if !REPLAYABLE.contains(&call.function.as_str()) {
                    continue;
                }
                if !call.symbols.iter().any(|s| needed.contains(s)) {
                    continue;
                }
                if MIRRORED.contains(&call.function.as_str()) {
                    if let Some(obj) = call.object {
                        if !mirrored.contains(&obj) {
                            mirrored.push(obj);
                        }
                    }
                }
                replay.push(call.clone());
            }
            // splice back to front so replays keep their original order
            for call in replay.into_iter().rev() {
                cont = DiagramSurgeon::new(&mut d).prepend_call(call, cont);
            }
            (cont, mirrored)
        };

        let module = Module::new(
            TargetKind::SwitchAsic,
            ModuleOp::SendToController {
                continuation: cont,
                mirrored: mirrored.clone(),
            },
            node,
        );
        let mut fork = ep.fork();
        {
            let diagram = cx.diagram();
            fork.replay_postponed(&diagram, TargetKind::SwitchAsic, node)?;
        }
        fork.add_leaves(node, module.clone(), Continuation::Stop)?;
        fork.seed_frontier(cont, TargetKind::Controller)?;
        fork.bank_mut(TargetKind::Controller)
            .mirrored
            .extend(mirrored.iter().copied());
        Ok(ProcessOutcome::one(module, fork))
    }
}

/// Symbols a region reads but does not bind itself
fn region_unbound_symbols(diagram: &Diagram, root: NodeId) -> BTreeSet<String> {
    let mut used = BTreeSet::new();
    let mut bound = BTreeSet::new();
    for id in diagram.reachable_from(root) {
        let Ok(node) = diagram.node(id) else { continue };
        match &node.kind {
            chimera_diagram::NodeKind::Call(call) => {
                for arg in call.args.values() {
                    used.extend(arg.input().symbols());
                }
                bound.extend(call.symbols.iter().cloned());
            }
            chimera_diagram::NodeKind::Branch(branch) => {
                used.extend(branch.condition.symbols());
            }
            chimera_diagram::NodeKind::Return(ret) => {
                if let Some(port) = &ret.port {
                    used.extend(port.symbols());
                }
            }
        }
    }
    used.difference(&bound).cloned().collect()
}

/// The controller target; never an entry point
pub fn controller_target() -> Target {
    Target::new(
        TargetKind::Controller,
        false,
        dataplane_modules(TargetKind::Controller),
    )
}
