//! Cross-node coalescing analysis
//!
//! Several logical objects may compile into one match-action table: a value
//! read from a carrying map can serve as the index into a vector or index
//! space that is reachable only through that map. The relation is
//! established once, over the whole diagram, before search starts: an object
//! is carried only if every one of its index-addressed accesses — liveness
//! checks included — uses an index proven equivalent to a value produced by
//! an upstream lookup on the same carrier. One independent query anywhere
//! refuses the relation.

use chimera_diagram::{functions, Diagram, NodeId, ObjectId};
use chimera_expr::{Expr, ExprOracle};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Established carrier relations: carried object → carrying map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoalescingMap {
    carrier_of: IndexMap<ObjectId, ObjectId>,
}

impl CoalescingMap {
    /// The map that exclusively addresses `obj`, if one was proven
    pub fn carrier(&self, obj: ObjectId) -> Option<ObjectId> {
        self.carrier_of.get(&obj).copied()
    }

    /// Objects folded into `carrier`'s table
    pub fn carried_by(&self, carrier: ObjectId) -> Vec<ObjectId> {
        self.carrier_of
            .iter()
            .filter(|(_, &c)| c == carrier)
            .map(|(&o, _)| o)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.carrier_of.is_empty()
    }
}

/// One upstream lookup that can carry an index
struct LookupSite {
    node: NodeId,
    object: ObjectId,
    ret: Expr,
}

/// One index-addressed access to a candidate carried object
struct AccessSite {
    node: NodeId,
    object: ObjectId,
    index: Expr,
}

/// Prove carrier relations over the whole diagram.
pub fn analyze(diagram: &Diagram, oracle: &dyn ExprOracle) -> CoalescingMap {
    let mut lookups = Vec::new();
    let mut accesses = Vec::new();
    let mut map_objects = BTreeSet::new();

    for dnode in diagram.iter() {
        let Some(call) = dnode.as_call() else { continue };
        let Some(obj) = call.object else { continue };
        match call.function.as_str() {
            functions::MAP_GET => {
                map_objects.insert(obj);
                if let Some(ret) = &call.ret {
                    lookups.push(LookupSite {
                        node: dnode.id,
                        object: obj,
                        ret: ret.clone(),
                    });
                }
            }
            functions::MAP_PUT | functions::MAP_ERASE => {
                map_objects.insert(obj);
            }
            functions::INDEX_LIVE | functions::VECTOR_BORROW => {
                if let Some(index) = call.arg(functions::args::INDEX) {
                    accesses.push(AccessSite {
                        node: dnode.id,
                        object: obj,
                        index: index.clone(),
                    });
                }
            }
            _ => {}
        }
    }

    let mut relations = CoalescingMap::default();
    let carried_candidates: BTreeSet<ObjectId> = accesses
        .iter()
        .map(|a| a.object)
        .filter(|o| !map_objects.contains(o))
        .collect();

    for carried in carried_candidates {
        let sites: Vec<&AccessSite> = accesses.iter().filter(|a| a.object == carried).collect();
        // intersect, across every access, the carriers that can explain it
        let mut carriers: Option<BTreeSet<ObjectId>> = None;
        for site in &sites {
            let explained = explaining_carriers(diagram, oracle, &lookups, site);
            carriers = Some(match carriers {
                None => explained,
                Some(prev) => prev.intersection(&explained).copied().collect(),
            });
            if carriers.as_ref().is_some_and(BTreeSet::is_empty) {
                break;
            }
        }
        if let Some(carriers) = carriers {
            if let Some(&carrier) = carriers.first() {
                tracing::debug!(
                    carried = carried.0,
                    carrier = carrier.0,
                    accesses = sites.len(),
                    "coalescing relation established"
                );
                relations.carrier_of.insert(carried, carrier);
            }
        }
    }
    relations
}

/// Maps whose lookup value provably feeds this access's index
fn explaining_carriers(
    diagram: &Diagram,
    oracle: &dyn ExprOracle,
    lookups: &[LookupSite],
    site: &AccessSite,
) -> BTreeSet<ObjectId> {
    lookups
        .iter()
        .filter(|l| l.object != site.object)
        .filter(|l| diagram.reachable_from(l.node).contains(&site.node))
        .filter(|l| oracle.equivalent(&l.ret, &site.index))
        .map(|l| l.object)
        .collect()
}
