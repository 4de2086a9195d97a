//! Programmable switch ASIC target
//!
//! Shares the generic dataplane vocabulary but adds the ASIC's constraints:
//! branch predicates must fit the match unit, and liveness refreshes cannot
//! be placed until the path reveals how the index space is realized, so they
//! go through the postponement queue and replay at path end.

use crate::software::{
    ExpireSweep, IndexAlloc, IndexFree, IndexLiveQuery, IndexLiveTable, MapLookup, MapUpdate,
    ParseExtract, RouteEnd, TimeNow, VectorBorrow, VectorCommit,
};
use chimera_diagram::{functions, NodeId};
use chimera_synth::{
    Continuation, ExecutionPlan, Module, ModuleMatcher, ModuleOp, ProcessOutcome, Resource,
    Result, SynthContext, Target, TargetKind,
};
use tracing::warn;

/// Match-unit limits of the modeled ASIC
#[derive(Debug, Clone)]
pub struct AsicConfig {
    /// Most header fields one branch predicate may combine
    pub max_condition_fields: usize,
}

impl Default for AsicConfig {
    fn default() -> Self {
        Self {
            max_condition_fields: 4,
        }
    }
}

/// Conditional constrained by the match-unit width
pub struct AsicIfElse {
    pub config: AsicConfig,
}

impl ModuleMatcher for AsicIfElse {
    fn name(&self) -> &'static str {
        "asic-if-else"
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
        let diagram = cx.diagram();
        let Some(branch) = diagram.node(node)?.as_branch() else {
            return Ok(ProcessOutcome::no_match());
        };
        let condition = cx.oracle.simplify(&branch.condition);
        let fields = condition.fields();
        if fields.len() > self.config.max_condition_fields {
            warn!(
                node = node.0,
                fields = fields.len(),
                limit = self.config.max_condition_fields,
                "branch predicate too wide for the match unit, deferring to other targets"
            );
            return Ok(ProcessOutcome::no_match());
        }
        let module = Module::new(TargetKind::SwitchAsic, ModuleOp::If { condition }, node);
        let mut fork = ep.fork();
        fork.add_leaves(
            node,
            module.clone(),
            Continuation::Branch {
                on_true: branch.on_true,
                on_false: branch.on_false,
            },
        )?;
        Ok(ProcessOutcome::one(module, fork))
    }
}

/// Liveness refresh on the ASIC: placed immediately when an allocator
/// already owns the object, postponed otherwise.
pub struct AsicIndexRefresh;

impl ModuleMatcher for AsicIndexRefresh {
    fn name(&self) -> &'static str {
        "asic-index-refresh"
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
        let diagram = cx.diagram();
        let Some(call) = diagram.node(node)?.as_call() else {
            return Ok(ProcessOutcome::no_match());
        };
        if call.function != functions::INDEX_REFRESH {
            return Ok(ProcessOutcome::no_match());
        }
        let (Some(obj), Some(index)) = (call.object, call.arg(functions::args::INDEX)) else {
            return Ok(ProcessOutcome::no_match());
        };
        let module = Module::new(
            TargetKind::SwitchAsic,
            ModuleOp::Refresh {
                object: obj,
                index: index.clone(),
            },
            node,
        );
        let mut fork = ep.fork();

        let has_allocator = matches!(
            fork.bank_mut(TargetKind::SwitchAsic).resources.for_object(obj),
            Some(Resource::IntegerAllocator(_))
        );
        if has_allocator {
            if let Some(resource) = fork
                .bank_mut(TargetKind::SwitchAsic)
                .resources
                .for_object_mut(obj)
            {
                resource.nodes_mut().insert(node);
            }
            fork.add_leaves(node, module.clone(), match call.next {
                Some(n) => Continuation::Next(n),
                None => Continuation::Stop,
            })?;
            return Ok(ProcessOutcome::one(module, fork));
        }

        // realization undecided: queue the module and advance
        let successors: Vec<NodeId> = call.next.into_iter().collect();
        fork.postpone(TargetKind::SwitchAsic, node, module, &successors)?;
        Ok(ProcessOutcome::silent(fork))
    }
}

/// Deliberate "not yet supported" marker: declines every node it is asked
/// about, so the operation stays visible in the target's module list without
/// pretending to cover anything.
pub struct Unimplemented {
    pub operation: &'static str,
    pub target: TargetKind,
}

impl ModuleMatcher for Unimplemented {
    fn name(&self) -> &'static str {
        self.operation
    }

    fn target(&self) -> TargetKind {
        self.target
    }

    fn process(
        &self,
        _cx: &SynthContext<'_>,
        _ep: &ExecutionPlan,
        _node: NodeId,
    ) -> Result<ProcessOutcome> {
        Ok(ProcessOutcome::no_match())
    }
}

/// The switch ASIC target: generic dataplane modules swapped for their
/// constrained variants, plus the controller hand-off.
pub fn switch_asic_target(config: AsicConfig) -> Target {
    let t = TargetKind::SwitchAsic;
    let modules: Vec<Box<dyn ModuleMatcher>> = vec![
        Box::new(ParseExtract { target: t }),
        Box::new(AsicIfElse { config }),
        Box::new(MapLookup { target: t }),
        Box::new(MapUpdate { target: t }),
        Box::new(VectorBorrow { target: t }),
        Box::new(VectorCommit { target: t }),
        Box::new(IndexAlloc { target: t }),
        Box::new(AsicIndexRefresh),
        Box::new(IndexLiveQuery { target: t }),
        Box::new(IndexLiveTable { target: t }),
        Box::new(IndexFree { target: t }),
        Box::new(ExpireSweep { target: t }),
        Box::new(TimeNow { target: t }),
        Box::new(RouteEnd { target: t }),
        Box::new(Unimplemented {
            operation: functions::CHECKSUM_UPDATE,
            target: t,
        }),
        Box::new(crate::controller::HandOff),
    ];
    Target::new(t, true, modules)
}
