//! Shared building blocks for dataplane targets
//!
//! Every dataplane expresses maps as match-action tables, counters as
//! indexed registers, and index spaces as allocators; targets differ in
//! constraints and in what they refuse, not in how resources are assembled.
//! The helpers here do the resource bookkeeping against a forked plan so the
//! matchers stay small.

use chimera_diagram::{functions, CallNode, Diagram, NodeId, ObjectId};
use chimera_expr::{BinaryOp, Expr, ExprOracle, Value};
use chimera_synth::{
    CounterResource, ExecutionPlan, IntegerAllocator, Resource, ResourceKind, SynthContext, Table,
    TableKey, TargetKind,
};
use std::collections::BTreeSet;

/// Symbols a call binds that its return expression does not mention;
/// for lookups these are the hit flags.
pub(crate) fn hit_symbols(call: &CallNode) -> Vec<String> {
    let ret_syms: Vec<String> = call
        .ret
        .as_ref()
        .map(|r| r.symbols())
        .unwrap_or_default();
    call.symbols
        .iter()
        .filter(|s| !ret_syms.contains(s))
        .cloned()
        .collect()
}

/// Build or extend the table realizing a key-value map.
///
/// Returns None — a non-match, not an error — when the object is already
/// placed as something other than a table.
pub(crate) fn map_table(
    ep: &mut ExecutionPlan,
    target: TargetKind,
    node: NodeId,
    obj: ObjectId,
    call: &CallNode,
) -> chimera_synth::Result<Option<Table>> {
    if !ep.global().compatible(obj, ResourceKind::Table) {
        return Ok(None);
    }
    let key = match call.arg(functions::args::KEY) {
        Some(k) => k.clone(),
        None => return Ok(None),
    };
    let hits = hit_symbols(call);
    let expiration = ep.bank_mut(target).expirations.get(&obj).copied();

    let bank = ep.bank_mut(target);
    let table = match bank.resources.for_object_mut(obj) {
        Some(resource) => {
            let Some(t) = resource.as_table_mut() else {
                return Ok(None);
            };
            t.nodes.insert(node);
            t.add_key(TableKey::new(key));
            for h in hits {
                if !t.hit_symbols.contains(&h) {
                    t.hit_symbols.push(h);
                }
            }
            t.clone()
        }
        None => {
            let mut t = Table::new(format!("map_{}", obj), obj, node);
            t.add_key(TableKey::new(key));
            if let Some(value) = &call.ret {
                t.add_param(value.clone(), obj, node);
            }
            t.hit_symbols = hits;
            if let Some(policy) = expiration {
                t.set_expiration(policy);
            }
            bank.resources.insert(Resource::Table(t.clone()))?;
            ep.global_mut().decide(obj, ResourceKind::Table)?;
            t
        }
    };
    Ok(Some(table))
}

/// Build or extend the table realizing a standalone (un-coalesced) vector.
pub(crate) fn vector_table(
    ep: &mut ExecutionPlan,
    target: TargetKind,
    node: NodeId,
    obj: ObjectId,
    index: Expr,
    value: Option<Expr>,
) -> chimera_synth::Result<Option<Table>> {
    if !ep.global().compatible(obj, ResourceKind::Table) {
        return Ok(None);
    }
    let bank = ep.bank_mut(target);
    let table = match bank.resources.for_object_mut(obj) {
        Some(resource) => {
            let Some(t) = resource.as_table_mut() else {
                return Ok(None);
            };
            t.nodes.insert(node);
            t.add_key(TableKey::new(index));
            t.clone()
        }
        None => {
            let mut t = Table::new(format!("vec_{}", obj), obj, node);
            t.add_key(TableKey::new(index));
            if let Some(value) = value {
                t.add_param(value, obj, node);
            }
            bank.resources.insert(Resource::Table(t.clone()))?;
            ep.global_mut().decide(obj, ResourceKind::Table)?;
            t
        }
    };
    Ok(Some(table))
}

/// Build or extend the allocator realizing an index space.
///
/// `index_expr` keys the derived query/rejuvenation tables; capacity comes
/// from the allocation call's argument, looked up diagram-wide when the
/// current node does not carry it.
pub(crate) fn index_allocator(
    cx: &SynthContext<'_>,
    ep: &mut ExecutionPlan,
    target: TargetKind,
    node: NodeId,
    obj: ObjectId,
    index_expr: Expr,
) -> chimera_synth::Result<Option<IntegerAllocator>> {
    if !ep.global().compatible(obj, ResourceKind::IntegerAllocator) {
        return Ok(None);
    }
    let bank = ep.bank_mut(target);
    if let Some(resource) = bank.resources.for_object_mut(obj) {
        let allocator = match resource {
            Resource::IntegerAllocator(a) => {
                a.nodes.insert(node);
                a.clone()
            }
            _ => return Ok(None),
        };
        return Ok(Some(allocator));
    }

    let Some(capacity) = declared_capacity(cx, obj) else {
        return Ok(None);
    };
    let allocator = IntegerAllocator::new(obj, node, capacity, index_expr);
    let bank = ep.bank_mut(target);
    bank.resources
        .insert(Resource::IntegerAllocator(allocator.clone()))?;
    bank.delegations
        .insert(obj, chimera_synth::Delegation::AllocatorRejuvenation);
    ep.global_mut()
        .decide(obj, ResourceKind::IntegerAllocator)?;
    Ok(Some(allocator))
}

/// Capacity declared by any allocation call on `obj`, anywhere in the diagram.
pub(crate) fn declared_capacity(cx: &SynthContext<'_>, obj: ObjectId) -> Option<u64> {
    let diagram = cx.diagram();
    for node in diagram.calls_on_object(obj) {
        let Some(call) = node.as_call() else { continue };
        if call.function != functions::INDEX_ALLOC {
            continue;
        }
        if let Some(arg) = call.arg(functions::args::CAPACITY) {
            if let Some(v) = cx.oracle.constant_value(arg).and_then(|v| v.as_int()) {
                if v > 0 {
                    return Some(v as u64);
                }
            }
        }
    }
    None
}

/// Does every write-back on `obj` follow the read-increment-write pattern?
///
/// True only when each commit stores a previously borrowed value plus a
/// constant, proven by the oracle across the whole diagram.
pub(crate) fn counter_burst(diagram: &Diagram, oracle: &dyn ExprOracle, obj: ObjectId) -> bool {
    let mut commits = 0usize;
    for node in diagram.calls_on_object(obj) {
        let Some(call) = node.as_call() else { continue };
        if call.function != functions::VECTOR_COMMIT {
            continue;
        }
        commits += 1;
        if increment_amount(diagram, oracle, obj, call).is_none() {
            return false;
        }
    }
    commits > 0
}

/// The `(amount, borrowed)` pair of a commit that stores a previously
/// borrowed value of `obj` plus a constant.
pub(crate) fn increment_amount(
    diagram: &Diagram,
    oracle: &dyn ExprOracle,
    obj: ObjectId,
    commit: &CallNode,
) -> Option<(Expr, Expr)> {
    let stored = commit.arg(functions::args::VALUE)?;
    for node in diagram.calls_on_object(obj) {
        let Some(call) = node.as_call() else { continue };
        if call.function != functions::VECTOR_BORROW {
            continue;
        }
        let Some(borrowed) = &call.ret else { continue };
        if let Expr::Binary {
            op: BinaryOp::Add,
            left,
            right,
        } = stored
        {
            if oracle.equivalent(left, borrowed) && right.is_concrete() {
                return Some(((**right).clone(), borrowed.clone()));
            }
            if oracle.equivalent(right, borrowed) && left.is_concrete() {
                return Some(((**left).clone(), borrowed.clone()));
            }
        }
    }
    None
}

/// Proven upper bound on a counter value: a `value < N` constraint guarding
/// the path to the commit node.
pub(crate) fn saturation_bound(
    diagram: &Diagram,
    oracle: &dyn ExprOracle,
    commit_node: NodeId,
    borrowed: &Expr,
) -> Option<u64> {
    let constraints = diagram.path_constraints(commit_node)?;
    for c in constraints.iter().flat_map(|c| oracle.split_on_and(c)) {
        if let Expr::Binary {
            op: BinaryOp::Less,
            left,
            right,
        } = &c
        {
            if oracle.equivalent(left, borrowed) {
                if let Some(Value::Integer(max)) = oracle.constant_value(right) {
                    if max > 0 {
                        return Some(max as u64);
                    }
                }
            }
        }
    }
    None
}

/// Build or extend the counter realizing a read-increment-write object.
pub(crate) fn counter_resource(
    cx: &SynthContext<'_>,
    ep: &mut ExecutionPlan,
    target: TargetKind,
    node: NodeId,
    obj: ObjectId,
    call: &CallNode,
) -> chimera_synth::Result<Option<CounterResource>> {
    if !ep.global().compatible(obj, ResourceKind::Counter) {
        return Ok(None);
    }
    let bank = ep.bank_mut(target);
    if let Some(resource) = bank.resources.for_object_mut(obj) {
        let counter = match resource {
            Resource::Counter(c) => {
                c.nodes.insert(node);
                c.clone()
            }
            _ => return Ok(None),
        };
        return Ok(Some(counter));
    }

    let capacity = call
        .arg(functions::args::CAPACITY)
        .and_then(|a| cx.oracle.constant_value(a))
        .and_then(|v| v.as_int())
        .filter(|v| *v > 0)
        .map(|v| v as u64)
        .unwrap_or(1);
    let width = call
        .arg(functions::args::WIDTH)
        .and_then(|a| cx.oracle.constant_value(a))
        .and_then(|v| v.as_int())
        .filter(|v| *v > 0)
        .map(|v| v as usize)
        .unwrap_or(64);

    let counter = CounterResource {
        capacity,
        width,
        saturation_max: None,
        objs: BTreeSet::from([obj]),
        nodes: BTreeSet::from([node]),
    };
    let bank = ep.bank_mut(target);
    bank.resources.insert(Resource::Counter(counter.clone()))?;
    ep.global_mut().decide(obj, ResourceKind::Counter)?;
    Ok(Some(counter))
}
