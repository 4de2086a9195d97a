//! Generic dataplane matchers
//!
//! Software dataplanes (software switch, packet core, controller programs)
//! share one module vocabulary: no match-unit width limits, tables are hash
//! maps, and rejuvenation can happen in place. Each matcher is instantiated
//! per target so the produced modules carry the right technology tag.

use crate::common;
use chimera_diagram::{functions, NodeId};
use chimera_expr::Expr;
use chimera_synth::{
    Continuation, ExecutionPlan, ExpirationPolicy, Module, ModuleMatcher, ModuleOp,
    ProcessOutcome, Resource, ResourceKind, Result, SynthContext, Table, TableKey, Target,
    TargetKind,
};
use tracing::warn;

fn continuation(next: Option<NodeId>) -> Continuation {
    match next {
        Some(n) => Continuation::Next(n),
        None => Continuation::Stop,
    }
}

fn successors(next: Option<NodeId>) -> Vec<NodeId> {
    next.into_iter().collect()
}

/// Parser-stage header extraction
pub struct ParseExtract {
    pub target: TargetKind,
}

impl ModuleMatcher for ParseExtract {
    fn name(&self) -> &'static str {
        "parse-extract"
    }

    fn target(&self) -> TargetKind {
        self.target
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
        if call.function != functions::PACKET_EXTRACT {
            return Ok(ProcessOutcome::no_match());
        }
        let Some(Expr::Symbol(header)) = call.arg(functions::args::HEADER) else {
            return Ok(ProcessOutcome::no_match());
        };
        let module = Module::new(
            self.target,
            ModuleOp::ParseHeader {
                header: header.clone(),
            },
            node,
        );
        let mut fork = ep.fork();
        fork.add_leaves(node, module.clone(), continuation(call.next))?;
        Ok(ProcessOutcome::one(module, fork))
    }
}

/// Two-way conditional
pub struct IfElse {
    pub target: TargetKind,
}

impl ModuleMatcher for IfElse {
    fn name(&self) -> &'static str {
        "if-else"
    }

    fn target(&self) -> TargetKind {
        self.target
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
        let module = Module::new(
            self.target,
            ModuleOp::If {
                condition: cx.oracle.simplify(&branch.condition),
            },
            node,
        );
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

/// Key-value map lookup as a table
pub struct MapLookup {
    pub target: TargetKind,
}

impl ModuleMatcher for MapLookup {
    fn name(&self) -> &'static str {
        "map-lookup"
    }

    fn target(&self) -> TargetKind {
        self.target
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
        if call.function != functions::MAP_GET {
            return Ok(ProcessOutcome::no_match());
        }
        let Some(obj) = call.object else {
            return Ok(ProcessOutcome::no_match());
        };
        let mut fork = ep.fork();
        let Some(table) = common::map_table(&mut fork, self.target, node, obj, call)? else {
            return Ok(ProcessOutcome::no_match());
        };
        let module = Module::new(self.target, ModuleOp::TableLookup { table }, node);
        fork.add_leaves(node, module.clone(), continuation(call.next))?;
        Ok(ProcessOutcome::one(module, fork))
    }
}

/// Key-value map write or removal as a table update
pub struct MapUpdate {
    pub target: TargetKind,
}

impl ModuleMatcher for MapUpdate {
    fn name(&self) -> &'static str {
        "map-update"
    }

    fn target(&self) -> TargetKind {
        self.target
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
        let remove = match call.function.as_str() {
            functions::MAP_PUT => false,
            functions::MAP_ERASE => true,
            _ => return Ok(ProcessOutcome::no_match()),
        };
        let Some(obj) = call.object else {
            return Ok(ProcessOutcome::no_match());
        };
        let mut fork = ep.fork();
        let Some(table) = common::map_table(&mut fork, self.target, node, obj, call)? else {
            return Ok(ProcessOutcome::no_match());
        };
        let module = Module::new(self.target, ModuleOp::TableUpdate { table, remove }, node);
        fork.add_leaves(node, module.clone(), continuation(call.next))?;
        Ok(ProcessOutcome::one(module, fork))
    }
}

/// Indexed read: coalesced fold, counter read, or standalone vector table
pub struct VectorBorrow {
    pub target: TargetKind,
}

impl ModuleMatcher for VectorBorrow {
    fn name(&self) -> &'static str {
        "vector-borrow"
    }

    fn target(&self) -> TargetKind {
        self.target
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
        if call.function != functions::VECTOR_BORROW {
            return Ok(ProcessOutcome::no_match());
        }
        let (Some(obj), Some(index)) = (call.object, call.arg(functions::args::INDEX)) else {
            return Ok(ProcessOutcome::no_match());
        };

        // value read through the carrying map's table: fold as a column
        if let Some(carrier) = cx.coalescing.carrier(obj) {
            let mut fork = ep.fork();
            if !fork
                .global()
                .compatible(obj, ResourceKind::Table)
            {
                return Ok(ProcessOutcome::no_match());
            }
            let bank = fork.bank_mut(self.target);
            let Some(table) = bank
                .resources
                .for_object_mut(carrier)
                .and_then(Resource::as_table_mut)
            else {
                // the carrying lookup has not been placed on this path yet
                return Ok(ProcessOutcome::no_match());
            };
            if let Some(value) = &call.ret {
                table.add_param(value.clone(), obj, node);
            } else {
                table.objs.insert(obj);
                table.nodes.insert(node);
            }
            fork.global_mut()
                .decide(obj, ResourceKind::Table)?;
            fork.ignore_node(self.target, node, &successors(call.next))?;
            return Ok(ProcessOutcome::silent(fork));
        }

        // read half of a read-increment-write burst: the increment covers it
        if common::counter_burst(&diagram, cx.oracle, obj) {
            let mut fork = ep.fork();
            if common::counter_resource(cx, &mut fork, self.target, node, obj, call)?.is_none() {
                return Ok(ProcessOutcome::no_match());
            }
            fork.ignore_node(self.target, node, &successors(call.next))?;
            return Ok(ProcessOutcome::silent(fork));
        }

        let mut fork = ep.fork();
        let Some(table) = common::vector_table(
            &mut fork,
            self.target,
            node,
            obj,
            index.clone(),
            call.ret.clone(),
        )?
        else {
            return Ok(ProcessOutcome::no_match());
        };
        let module = Module::new(self.target, ModuleOp::TableLookup { table }, node);
        fork.add_leaves(node, module.clone(), continuation(call.next))?;
        Ok(ProcessOutcome::one(module, fork))
    }
}

/// Indexed write-back: counter increment or table update
pub struct VectorCommit {
    pub target: TargetKind,
}

impl ModuleMatcher for VectorCommit {
    fn name(&self) -> &'static str {
        "vector-commit"
    }

    fn target(&self) -> TargetKind {
        self.target
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
        if call.function != functions::VECTOR_COMMIT {
            return Ok(ProcessOutcome::no_match());
        }
        let (Some(obj), Some(index)) = (call.object, call.arg(functions::args::INDEX)) else {
            return Ok(ProcessOutcome::no_match());
        };

        if common::counter_burst(&diagram, cx.oracle, obj) {
            let Some((amount, borrowed)) =
                common::increment_amount(&diagram, cx.oracle, obj, call)
            else {
                return Ok(ProcessOutcome::no_match());
            };
            let mut fork = ep.fork();
            let Some(mut counter) =
                common::counter_resource(cx, &mut fork, self.target, node, obj, call)?
            else {
                return Ok(ProcessOutcome::no_match());
            };
            if let Some(max) = common::saturation_bound(&diagram, cx.oracle, node, &borrowed) {
                counter.saturation_max = Some(max);
                if let Some(Resource::Counter(c)) =
                    fork.bank_mut(self.target).resources.for_object_mut(obj)
                {
                    c.saturation_max = Some(max);
                }
            }
            let module = Module::new(
                self.target,
                ModuleOp::CounterIncrement {
                    counter,
                    index: index.clone(),
                    amount,
                },
                node,
            );
            fork.add_leaves(node, module.clone(), continuation(call.next))?;
            return Ok(ProcessOutcome::one(module, fork));
        }

        // write-back of a coalesced column goes through the carrier's table
        if let Some(carrier) = cx.coalescing.carrier(obj) {
            let mut fork = ep.fork();
            let bank = fork.bank_mut(self.target);
            let Some(table) = bank
                .resources
                .for_object_mut(carrier)
                .and_then(Resource::as_table_mut)
            else {
                return Ok(ProcessOutcome::no_match());
            };
            if let Some(value) = call.arg(functions::args::VALUE) {
                table.add_param(value.clone(), obj, node);
            }
            let table = table.clone();
            let module = Module::new(
                self.target,
                ModuleOp::TableUpdate {
                    table,
                    remove: false,
                },
                node,
            );
            fork.add_leaves(node, module.clone(), continuation(call.next))?;
            return Ok(ProcessOutcome::one(module, fork));
        }

        let mut fork = ep.fork();
        let Some(table) = common::vector_table(
            &mut fork,
            self.target,
            node,
            obj,
            index.clone(),
            call.arg(functions::args::VALUE).cloned(),
        )?
        else {
            return Ok(ProcessOutcome::no_match());
        };
        let module = Module::new(
            self.target,
            ModuleOp::TableUpdate {
                table,
                remove: false,
            },
            node,
        );
        fork.add_leaves(node, module.clone(), continuation(call.next))?;
        Ok(ProcessOutcome::one(module, fork))
    }
}

/// Claim a fresh index from an allocator
pub struct IndexAlloc {
    pub target: TargetKind,
}

impl ModuleMatcher for IndexAlloc {
    fn name(&self) -> &'static str {
        "index-alloc"
    }

    fn target(&self) -> TargetKind {
        self.target
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
        if call.function != functions::INDEX_ALLOC {
            return Ok(ProcessOutcome::no_match());
        }
        let Some(obj) = call.object else {
            return Ok(ProcessOutcome::no_match());
        };
        let index_expr = call
            .ret
            .clone()
            .unwrap_or_else(|| Expr::symbol(format!("idx_{}", obj)));
        let next = call.next;
        drop(diagram);

        let mut fork = ep.fork();
        let Some(allocator) =
            common::index_allocator(cx, &mut fork, self.target, node, obj, index_expr)?
        else {
            return Ok(ProcessOutcome::no_match());
        };
        let module = Module::new(self.target, ModuleOp::AllocatorReserve { allocator }, node);
        fork.add_leaves(node, module.clone(), continuation(next))?;
        Ok(ProcessOutcome::one(module, fork))
    }
}

/// In-place liveness refresh (software targets can always do this directly)
pub struct IndexRefresh {
    pub target: TargetKind,
}

impl ModuleMatcher for IndexRefresh {
    fn name(&self) -> &'static str {
        "index-refresh"
    }

    fn target(&self) -> TargetKind {
        self.target
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
            self.target,
            ModuleOp::Refresh {
                object: obj,
                index: index.clone(),
            },
            node,
        );
        let mut fork = ep.fork();
        if let Some(resource) = fork.bank_mut(self.target).resources.for_object_mut(obj) {
            resource.nodes_mut().insert(node);
        }
        fork.add_leaves(node, module.clone(), continuation(call.next))?;
        Ok(ProcessOutcome::one(module, fork))
    }
}

/// Liveness check against an allocator's query table
pub struct IndexLiveQuery {
    pub target: TargetKind,
}

impl ModuleMatcher for IndexLiveQuery {
    fn name(&self) -> &'static str {
        "index-live-query"
    }

    fn target(&self) -> TargetKind {
        self.target
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
        if call.function != functions::INDEX_LIVE {
            return Ok(ProcessOutcome::no_match());
        }
        let (Some(obj), Some(index)) = (call.object, call.arg(functions::args::INDEX)) else {
            return Ok(ProcessOutcome::no_match());
        };
        if cx.coalescing.carrier(obj).is_some() {
            // coalesced liveness rides on the carrier table's hit bit
            return Ok(ProcessOutcome::no_match());
        }
        let index = index.clone();
        let next = call.next;
        drop(diagram);

        let mut fork = ep.fork();
        let Some(allocator) =
            common::index_allocator(cx, &mut fork, self.target, node, obj, index.clone())?
        else {
            return Ok(ProcessOutcome::no_match());
        };
        let module = Module::new(
            self.target,
            ModuleOp::AllocatorQuery { allocator, index },
            node,
        );
        fork.add_leaves(node, module.clone(), continuation(next))?;
        Ok(ProcessOutcome::one(module, fork))
    }
}

/// Liveness check as a plain table (or a fold into the carrier's table)
pub struct IndexLiveTable {
    pub target: TargetKind,
}

impl ModuleMatcher for IndexLiveTable {
    fn name(&self) -> &'static str {
        "index-live-table"
    }

    fn target(&self) -> TargetKind {
        self.target
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
        if call.function != functions::INDEX_LIVE {
            return Ok(ProcessOutcome::no_match());
        }
        let (Some(obj), Some(index)) = (call.object, call.arg(functions::args::INDEX)) else {
            return Ok(ProcessOutcome::no_match());
        };

        if let Some(carrier) = cx.coalescing.carrier(obj) {
            let mut fork = ep.fork();
            if !fork
                .global()
                .compatible(obj, ResourceKind::Table)
            {
                return Ok(ProcessOutcome::no_match());
            }
            let symbols = call.symbols.clone();
            let bank = fork.bank_mut(self.target);
            let Some(table) = bank
                .resources
                .for_object_mut(carrier)
                .and_then(Resource::as_table_mut)
            else {
                return Ok(ProcessOutcome::no_match());
            };
            table.objs.insert(obj);
            table.nodes.insert(node);
            for s in symbols {
                if !table.hit_symbols.contains(&s) {
                    table.hit_symbols.push(s);
                }
            }
            fork.global_mut()
                .decide(obj, ResourceKind::Table)?;
            fork.ignore_node(self.target, node, &successors(call.next))?;
            return Ok(ProcessOutcome::silent(fork));
        }

        let mut fork = ep.fork();
        if !fork
            .global()
            .compatible(obj, ResourceKind::Table)
        {
            return Ok(ProcessOutcome::no_match());
        }
        let bank = fork.bank_mut(self.target);
        let table = match bank
            .resources
            .for_object_mut(obj)
            .and_then(Resource::as_table_mut)
        {
            Some(t) => {
                t.nodes.insert(node);
                t.add_key(TableKey::new(index.clone()));
                t.clone()
            }
            None => {
                if bank.resources.for_object(obj).is_some() {
                    return Ok(ProcessOutcome::no_match());
                }
                let mut t = Table::new(format!("live_{}", obj), obj, node);
                t.add_key(TableKey::new(index.clone()));
                t.hit_symbols = call.symbols.clone();
                bank.resources
                    .insert(Resource::Table(t.clone()))?;
                fork.global_mut()
                    .decide(obj, ResourceKind::Table)?;
                t
            }
        };
        let module = Module::new(self.target, ModuleOp::TableLookup { table }, node);
        fork.add_leaves(node, module.clone(), continuation(call.next))?;
        Ok(ProcessOutcome::one(module, fork))
    }
}

/// Release an index: a removal against whatever realizes the object
pub struct IndexFree {
    pub target: TargetKind,
}

impl ModuleMatcher for IndexFree {
    fn name(&self) -> &'static str {
        "index-free"
    }

    fn target(&self) -> TargetKind {
        self.target
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
        if call.function != functions::INDEX_FREE {
            return Ok(ProcessOutcome::no_match());
        }
        let Some(obj) = call.object else {
            return Ok(ProcessOutcome::no_match());
        };
        let mut fork = ep.fork();
        let table = match fork.bank_mut(self.target).resources.for_object_mut(obj) {
            Some(Resource::IntegerAllocator(a)) => {
                a.nodes.insert(node);
                a.query.clone()
            }
            Some(Resource::Table(t)) => {
                t.nodes.insert(node);
                t.clone()
            }
            _ => return Ok(ProcessOutcome::no_match()),
        };
        let module = Module::new(
            self.target,
            ModuleOp::TableUpdate {
                table,
                remove: true,
            },
            node,
        );
        fork.add_leaves(node, module.clone(), continuation(call.next))?;
        Ok(ProcessOutcome::one(module, fork))
    }
}

/// Expiry sweep: harvested into the bank, no dataplane module emitted
pub struct ExpireSweep {
    pub target: TargetKind,
}

impl ModuleMatcher for ExpireSweep {
    fn name(&self) -> &'static str {
        "expire-sweep"
    }

    fn target(&self) -> TargetKind {
        self.target
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
        if call.function != functions::EXPIRE_ENTRIES {
            return Ok(ProcessOutcome::no_match());
        }
        let Some(obj) = call.object else {
            return Ok(ProcessOutcome::no_match());
        };
        let timeout = call
            .arg(functions::args::TIMEOUT)
            .and_then(|a| cx.oracle.constant_value(a))
            .and_then(|v| v.as_int());
        let Some(timeout) = timeout.filter(|t| *t > 0) else {
            return Ok(ProcessOutcome::no_match());
        };
        let mut fork = ep.fork();
        let policy = ExpirationPolicy {
            timeout: timeout as u64,
        };
        if !fork.bank_mut(self.target).harvest_expiration(obj, policy) {
            warn!(
                object = obj.0,
                timeout, "conflicting expiration policy, refusing node"
            );
            return Ok(ProcessOutcome::no_match());
        }
        fork.ignore_node(self.target, node, &successors(call.next))?;
        Ok(ProcessOutcome::silent(fork))
    }
}

/// Timestamp read: ambient on every dataplane, nothing to place
pub struct TimeNow {
    pub target: TargetKind,
}

impl ModuleMatcher for TimeNow {
    fn name(&self) -> &'static str {
        "time-now"
    }

    fn target(&self) -> TargetKind {
        self.target
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
        if call.function != functions::TIME_NOW {
            return Ok(ProcessOutcome::no_match());
        }
        let mut fork = ep.fork();
        fork.ignore_node(self.target, node, &successors(call.next))?;
        Ok(ProcessOutcome::silent(fork))
    }
}

/// Terminal routing decision; replays pending postponements first
pub struct RouteEnd {
    pub target: TargetKind,
}

impl ModuleMatcher for RouteEnd {
    fn name(&self) -> &'static str {
        "route-end"
    }

    fn target(&self) -> TargetKind {
        self.target
    }

    fn process(
        &self,
        cx: &SynthContext<'_>,
        ep: &ExecutionPlan,
        node: NodeId,
    ) -> Result<ProcessOutcome> {
        let diagram = cx.diagram();
        let Some(ret) = diagram.node(node)?.as_return() else {
            return Ok(ProcessOutcome::no_match());
        };
        let op = match ret.operation {
            chimera_diagram::RouteOp::Drop => ModuleOp::Drop,
            chimera_diagram::RouteOp::Forward => ModuleOp::Forward {
                port: ret.port.clone().unwrap_or_else(|| Expr::int(0)),
            },
            chimera_diagram::RouteOp::Broadcast => ModuleOp::Broadcast,
        };
        let module = Module::new(self.target, op, node);
        let mut fork = ep.fork();
        fork.replay_postponed(&diagram, self.target, node)?;
        fork.add_leaves(node, module.clone(), Continuation::Stop)?;
        Ok(ProcessOutcome::one(module, fork))
    }
}

/// A software dataplane target built from the generic module set
pub fn software_target(kind: TargetKind) -> chimera_synth::Target {
    Target::new(kind, true, dataplane_modules(kind))
}

/// The full generic module set for one software target
pub fn dataplane_modules(target: TargetKind) -> Vec<Box<dyn ModuleMatcher>> {
    vec![
        Box::new(ParseExtract { target }),
        Box::new(IfElse { target }),
        Box::new(MapLookup { target }),
        Box::new(MapUpdate { target }),
        Box::new(VectorBorrow { target }),
        Box::new(VectorCommit { target }),
        Box::new(IndexAlloc { target }),
        Box::new(IndexRefresh { target }),
        Box::new(IndexLiveQuery { target }),
        Box::new(IndexLiveTable { target }),
        Box::new(IndexFree { target }),
        Box::new(ExpireSweep { target }),
        Box::new(TimeNow { target }),
        Box::new(RouteEnd { target }),
    ]
}
