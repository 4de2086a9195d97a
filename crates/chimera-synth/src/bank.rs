//! Memory banks: per-target resource ledgers plus the global placement table
//!
//! Every execution plan owns one bank per target it uses and a single global
//! bank. The global bank records, write-once, which resource kind realizes
//! each logical object; per-target banks own the resource set, the postponed
//! operation queue, and harvested auxiliary facts (state to mirror on the
//! controller, expiration timing).

use crate::error::{Result, SynthError};
use crate::module::Module;
use crate::resource::{ExpirationPolicy, ResourceKind, ResourceSet};
use chimera_diagram::{NodeId, ObjectId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A module whose tree position could not be decided at its natural node.
///
/// Replayed by [`crate::ep::ExecutionPlan::replay_postponed`] once the
/// triggering node leads to the splice point, then discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostponedOp {
    /// The diagram node that produced the module
    pub node: NodeId,
    /// The module, exactly as recorded
    pub module: Module,
}

/// Cross-target delegation facts, used to prune redundant rewrites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delegation {
    /// Index liveness management is owned by an on-switch allocator
    AllocatorRejuvenation,
}

/// Per-target resource ledger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryBank {
    /// Committed resources, at most one per object
    pub resources: ResourceSet,
    /// Operations awaiting a decidable tree position
    pub postponed: Vec<PostponedOp>,
    /// Objects whose state must be mirrored on the controller
    pub mirrored: BTreeSet<ObjectId>,
    /// Expiration policy per object, harvested from expiry sweep calls
    pub expirations: IndexMap<ObjectId, ExpirationPolicy>,
    /// Liveness-management delegations visible to other targets
    pub delegations: IndexMap<ObjectId, Delegation>,
}

impl MemoryBank {
    /// Record an expiration policy for `obj`.
    ///
    /// Returns false (leaving the bank untouched) when a different policy
    /// was already harvested — the module should treat that as a non-match.
    pub fn harvest_expiration(&mut self, obj: ObjectId, policy: ExpirationPolicy) -> bool {
        match self.expirations.get(&obj) {
            Some(existing) if *existing != policy => false,
            _ => {
                self.expirations.insert(obj, policy);
                // an already-built table for this object becomes versioned
                if let Some(table) = self
                    .resources
                    .for_object_mut(obj)
                    .and_then(|r| r.as_table_mut())
                {
                    table.set_expiration(policy);
                }
                true
            }
        }
    }

    /// Queue a postponed operation
    pub fn postpone(&mut self, node: NodeId, module: Module) {
        self.postponed.push(PostponedOp { node, module });
    }
}

/// Global placement table shared by all targets of one execution plan.
///
/// A decision, once committed, is immutable for the rest of the plan's
/// lineage; later clones may only add decisions for new objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalBank {
    placements: IndexMap<ObjectId, ResourceKind>,
}

impl GlobalBank {
    /// Is realizing `obj` as `kind` consistent with prior decisions?
    pub fn compatible(&self, obj: ObjectId, kind: ResourceKind) -> bool {
        self.placements.get(&obj).is_none_or(|&k| k == kind)
    }

    /// The recorded decision for `obj`, if any
    pub fn decision(&self, obj: ObjectId) -> Option<ResourceKind> {
        self.placements.get(&obj).copied()
    }

    /// Commit a placement decision. Conflicting commits are invariant
    /// violations: modules must check [`GlobalBank::compatible`] first.
    pub fn decide(&mut self, obj: ObjectId, kind: ResourceKind) -> Result<()> {
        match self.placements.get(&obj) {
            Some(&existing) if existing != kind => Err(SynthError::PlacementConflict {
                object: obj,
                existing,
                requested: kind,
            }),
            _ => {
                self.placements.insert(obj, kind);
                Ok(())
            }
        }
    }

    /// All decisions, in commit order
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, ResourceKind)> + '_ {
        self.placements.iter().map(|(&o, &k)| (o, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_decisions_are_write_once() {
        let mut bank = GlobalBank::default();
        let obj = ObjectId(9);
        assert!(bank.compatible(obj, ResourceKind::Table));
        bank.decide(obj, ResourceKind::Table).unwrap();

        assert!(bank.compatible(obj, ResourceKind::Table));
        assert!(!bank.compatible(obj, ResourceKind::Counter));
        assert!(bank.decide(obj, ResourceKind::Counter).is_err());
        assert_eq!(bank.decision(obj), Some(ResourceKind::Table));
    }

    #[test]
    fn conflicting_expiration_policies_are_refused() {
        let mut bank = MemoryBank::default();
        let obj = ObjectId(3);
        assert!(bank.harvest_expiration(obj, ExpirationPolicy { timeout: 100 }));
        assert!(bank.harvest_expiration(obj, ExpirationPolicy { timeout: 100 }));
        assert!(!bank.harvest_expiration(obj, ExpirationPolicy { timeout: 250 }));
        assert_eq!(
            bank.expirations.get(&obj),
            Some(&ExpirationPolicy { timeout: 100 })
        );
    }
}
