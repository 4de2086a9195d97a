//! Module protocol: the atomic match/rewrite rule
//!
//! A placed module is a `(target, operation)` pair with a target-specific
//! payload. Matchers are the dispatch side of the protocol: one prototype
//! per operation per target, each pattern-matching frontier nodes and
//! producing successor plans. A mismatch is an empty outcome with no side
//! effects; many matchers attempt every node, at most a handful match.

use crate::coalesce::CoalescingMap;
use crate::ep::ExecutionPlan;
use crate::error::Result;
use crate::resource::{CounterResource, IntegerAllocator, Table};
use chimera_diagram::{Diagram, NodeId, ObjectId};
use chimera_expr::{Expr, ExprOracle};
use serde::{Deserialize, Serialize};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One implementation technology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    /// Programmable switch ASIC
    SwitchAsic,
    /// Software switch dataplane
    SoftwareSwitch,
    /// General-purpose packet core
    PacketCore,
    /// Controller half of a hybrid deployment
    Controller,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TargetKind::SwitchAsic => "switch-asic",
            TargetKind::SoftwareSwitch => "software-switch",
            TargetKind::PacketCore => "packet-core",
            TargetKind::Controller => "controller",
        };
        write!(f, "{}", name)
    }
}

/// Target-specific operation payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModuleOp {
    /// Two-way conditional; the only operation with Then/Else children
    If { condition: Expr },
    /// Parser-stage header extraction
    ParseHeader { header: String },
    /// Match-action table lookup
    TableLookup { table: Table },
    /// Table insert/update or removal
    TableUpdate { table: Table, remove: bool },
    /// Saturating counter bump
    CounterIncrement {
        counter: CounterResource,
        index: Expr,
        amount: Expr,
    },
    /// Claim a fresh index from an allocator
    AllocatorReserve { allocator: IntegerAllocator },
    /// Liveness query against an allocator's query table
    AllocatorQuery {
        allocator: IntegerAllocator,
        index: Expr,
    },
    /// Liveness refresh for an index of `object`; physical realization is
    /// resolved against the owning bank (allocator or versioned table)
    Refresh { object: ObjectId, index: Expr },
    /// Terminal: discard the packet
    Drop,
    /// Terminal: emit on one port
    Forward { port: Expr },
    /// Terminal: flood
    Broadcast,
    /// Terminal for the switch path: punt to the controller, which resumes
    /// at `continuation` with `mirrored` state available
    SendToController {
        continuation: NodeId,
        mirrored: Vec<ObjectId>,
    },
}

impl ModuleOp {
    /// Terminal operations end their path; no frontier successor follows
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ModuleOp::Drop
                | ModuleOp::Forward { .. }
                | ModuleOp::Broadcast
                | ModuleOp::SendToController { .. }
        )
    }

    /// Only control-flow operations have two children
    pub fn is_control_flow(&self) -> bool {
        matches!(self, ModuleOp::If { .. })
    }
}

/// One placed (or prototype) module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Owning target
    pub target: TargetKind,
    /// Operation payload
    pub op: ModuleOp,
    /// Diagram node that produced this instance; None for prototypes
    pub node: Option<NodeId>,
}

impl Module {
    pub fn new(target: TargetKind, op: ModuleOp, node: NodeId) -> Self {
        Self {
            target,
            op,
            node: Some(node),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.op.is_terminal()
    }

    /// Structural equality: payload expressions are compared through the
    /// oracle, not syntactically. The owning node is not part of identity.
    pub fn equals(&self, other: &Module, oracle: &dyn ExprOracle) -> bool {
        if self.target != other.target {
            return false;
        }
        match (&self.op, &other.op) {
            (ModuleOp::If { condition: a }, ModuleOp::If { condition: b }) => {
                oracle.equivalent(a, b)
            }
            (ModuleOp::ParseHeader { header: a }, ModuleOp::ParseHeader { header: b }) => a == b,
            (ModuleOp::TableLookup { table: a }, ModuleOp::TableLookup { table: b }) => {
                table_equals(a, b, oracle)
            }
            (
                ModuleOp::TableUpdate {
                    table: a,
                    remove: ra,
                },
                ModuleOp::TableUpdate {
                    table: b,
                    remove: rb,
                },
            ) => ra == rb && table_equals(a, b, oracle),
            (
                ModuleOp::CounterIncrement {
                    counter: ca,
                    index: ia,
                    amount: aa,
                },
                ModuleOp::CounterIncrement {
                    counter: cb,
                    index: ib,
                    amount: ab,
                },
            ) => ca.objs == cb.objs && oracle.equivalent(ia, ib) && oracle.equivalent(aa, ab),
            (
                ModuleOp::AllocatorReserve { allocator: a },
                ModuleOp::AllocatorReserve { allocator: b },
            ) => a.objs == b.objs && a.capacity == b.capacity,
            (
                ModuleOp::AllocatorQuery {
                    allocator: a,
                    index: ia,
                },
                ModuleOp::AllocatorQuery {
                    allocator: b,
                    index: ib,
                },
            ) => a.objs == b.objs && oracle.equivalent(ia, ib),
            (
                ModuleOp::Refresh {
                    object: oa,
                    index: ia,
                },
                ModuleOp::Refresh {
                    object: ob,
                    index: ib,
                },
            ) => oa == ob && oracle.equivalent(ia, ib),
            (ModuleOp::Drop, ModuleOp::Drop) => true,
            (ModuleOp::Forward { port: a }, ModuleOp::Forward { port: b }) => {
                oracle.equivalent(a, b)
            }
            (ModuleOp::Broadcast, ModuleOp::Broadcast) => true,
            (
                ModuleOp::SendToController {
                    continuation: ca,
                    mirrored: ma,
                },
                ModuleOp::SendToController {
                    continuation: cb,
                    mirrored: mb,
                },
            ) => ca == cb && ma == mb,
            _ => false,
        }
    }
}

fn table_equals(a: &Table, b: &Table, oracle: &dyn ExprOracle) -> bool {
    a.objs == b.objs
        && a.keys.len() == b.keys.len()
        && a.params.len() == b.params.len()
        && a.keys
            .iter()
            .zip(&b.keys)
            .all(|(x, y)| oracle.equivalent(&x.expr, &y.expr))
        && a.params
            .iter()
            .zip(&b.params)
            .all(|(x, y)| x.object == y.object && oracle.equivalent(&x.expr, &y.expr))
}

/// Result of offering a frontier node to one matcher.
///
/// Empty means "does not apply here" — a pattern mismatch or a placement
/// conflict, neither of which is an error.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    /// The module the matcher produced, for introspection
    pub module: Option<Module>,
    /// Successor plans; one normally, two for a control-flow split
    pub next_eps: Vec<ExecutionPlan>,
}

impl ProcessOutcome {
    /// The pervasive "this module does not apply here" result
    pub fn no_match() -> Self {
        Self::default()
    }

    pub fn one(module: Module, ep: ExecutionPlan) -> Self {
        Self {
            module: Some(module),
            next_eps: vec![ep],
        }
    }

    /// Frontier advanced with no emitted module (ignored node)
    pub fn silent(ep: ExecutionPlan) -> Self {
        Self {
            module: None,
            next_eps: vec![ep],
        }
    }

    pub fn matched(&self) -> bool {
        !self.next_eps.is_empty()
    }
}

/// Shared, read-mostly context threaded through every `process` call.
///
/// The diagram sits behind a lock only for the benefit of speculative
/// rewriting, which appends fresh-id nodes; established nodes are never
/// mutated, so readers stay consistent across plans.
pub struct SynthContext<'a> {
    diagram: &'a RwLock<Diagram>,
    /// Expression decision procedure
    pub oracle: &'a dyn ExprOracle,
    /// Whole-diagram coalescing relations, established once before search
    pub coalescing: &'a CoalescingMap,
}

impl<'a> SynthContext<'a> {
    pub fn new(
        diagram: &'a RwLock<Diagram>,
        oracle: &'a dyn ExprOracle,
        coalescing: &'a CoalescingMap,
    ) -> Self {
        Self {
            diagram,
            oracle,
            coalescing,
        }
    }

    /// Read access to the diagram
    pub fn diagram(&self) -> RwLockReadGuard<'_, Diagram> {
        self.diagram.read().expect("diagram lock poisoned")
    }

    /// Write access, reserved for diagram surgery
    pub fn diagram_mut(&self) -> RwLockWriteGuard<'_, Diagram> {
        self.diagram.write().expect("diagram lock poisoned")
    }
}

/// The dispatch side of the module protocol: one prototype per operation.
pub trait ModuleMatcher: Send + Sync {
    /// Matcher name, for diagnostics
    fn name(&self) -> &'static str;

    /// The target this matcher produces modules for
    fn target(&self) -> TargetKind;

    /// Offer a frontier node. Returns the empty outcome on a mismatch; on a
    /// match, all side effects are confined to the returned plans.
    fn process(
        &self,
        cx: &SynthContext<'_>,
        ep: &ExecutionPlan,
        node: NodeId,
    ) -> Result<ProcessOutcome>;
}

/// A named, ordered set of module prototypes
pub struct Target {
    /// Technology tag
    pub kind: TargetKind,
    /// Whether plans may start on this target (the controller cannot be
    /// entered except through a hand-off)
    pub entry: bool,
    /// Module prototypes, tried in order
    pub modules: Vec<Box<dyn ModuleMatcher>>,
}

impl Target {
    pub fn new(kind: TargetKind, entry: bool, modules: Vec<Box<dyn ModuleMatcher>>) -> Self {
        Self {
            kind,
            entry,
            modules,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chimera_expr::StructuralOracle;

    #[test]
    fn equals_sees_through_syntax() {
        let oracle = StructuralOracle::new();
        let a = Module::new(
            TargetKind::SwitchAsic,
            ModuleOp::If {
                condition: Expr::eq(Expr::field("ipv4", "proto"), Expr::int(6)),
            },
            NodeId(1),
        );
        // operand order flipped, different owning node
        let b = Module::new(
            TargetKind::SwitchAsic,
            ModuleOp::If {
                condition: Expr::eq(Expr::int(6), Expr::field("ipv4", "proto")),
            },
            NodeId(2),
        );
        assert!(a.equals(&b, &oracle));
        assert_ne!(a, b);
    }

    #[test]
    fn equals_distinguishes_targets_and_payloads() {
        let oracle = StructuralOracle::new();
        let cond = Expr::eq(Expr::symbol("hit"), Expr::int(1));
        let asic = Module::new(
            TargetKind::SwitchAsic,
            ModuleOp::If {
                condition: cond.clone(),
            },
            NodeId(1),
        );
        let soft = Module::new(
            TargetKind::SoftwareSwitch,
            ModuleOp::If {
                condition: cond.clone(),
            },
            NodeId(1),
        );
        let other = Module::new(
            TargetKind::SwitchAsic,
            ModuleOp::If {
                condition: Expr::eq(Expr::symbol("hit"), Expr::int(0)),
            },
            NodeId(1),
        );
        assert!(!asic.equals(&soft, &oracle));
        assert!(!asic.equals(&other, &oracle));
    }
}
