//! Physical resource model
//!
//! A Resource is the target-side realization of one or more logical objects:
//! a match-action table, a saturating counter, or an integer allocator. Each
//! resource remembers the objects it realizes and the diagram nodes that
//! created or extended it. Resources are never deleted within a branch and
//! are duplicated by value when an execution plan branches.

use crate::error::{Result, SynthError};
use chimera_expr::{Expr, FieldRef};
use chimera_diagram::{NodeId, ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The kind of physical resource an object compiles to.
///
/// Recorded once per object in the global memory bank; two resources of
/// different kinds never share an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Table,
    Counter,
    IntegerAllocator,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::Table => "table",
            ResourceKind::Counter => "counter",
            ResourceKind::IntegerAllocator => "integer-allocator",
        };
        write!(f, "{}", name)
    }
}

/// Expiration timing policy harvested from an expiry sweep call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationPolicy {
    /// Entry lifetime in the reference behavior's time units
    pub timeout: u64,
}

/// One key column of a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableKey {
    /// Expression matched against
    pub expr: Expr,
    /// Header field the expression reads, when it reads exactly one
    pub provenance: Option<FieldRef>,
}

impl TableKey {
    pub fn new(expr: Expr) -> Self {
        let provenance = expr.sole_field();
        Self { expr, provenance }
    }
}

/// One parameter (value) column of a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableParam {
    /// Value expression read out on a hit
    pub expr: Expr,
    /// Logical object the column's state belongs to
    pub object: ObjectId,
}

/// Match-action table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Table name, unique within a target
    pub name: String,
    /// Ordered key columns
    pub keys: Vec<TableKey>,
    /// Ordered parameter columns
    pub params: Vec<TableParam>,
    /// Boolean symbols bound to "entry present"
    pub hit_symbols: Vec<String>,
    /// Expiration policy, when the realized map expires entries
    pub expiration: Option<ExpirationPolicy>,
    /// Entries carry a versioning tag (needed to emulate expiry in-dataplane)
    pub versioned: bool,
    /// Objects this table realizes
    pub objs: BTreeSet<ObjectId>,
    /// Diagram nodes that created or extended this table
    pub nodes: BTreeSet<NodeId>,
}

impl Table {
    pub fn new(name: impl Into<String>, obj: ObjectId, node: NodeId) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            params: Vec::new(),
            hit_symbols: Vec::new(),
            expiration: None,
            versioned: false,
            objs: BTreeSet::from([obj]),
            nodes: BTreeSet::from([node]),
        }
    }

    /// Append a key column unless an identical one is already present
    pub fn add_key(&mut self, key: TableKey) {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    /// Fold a value column of `object` into this table (coalescing)
    pub fn add_param(&mut self, expr: Expr, object: ObjectId, node: NodeId) {
        let param = TableParam { expr, object };
        if !self.params.contains(&param) {
            self.params.push(param);
        }
        self.objs.insert(object);
        self.nodes.insert(node);
    }

    /// Attach an expiration policy; entries become versioned
    pub fn set_expiration(&mut self, policy: ExpirationPolicy) {
        self.expiration = Some(policy);
        self.versioned = true;
    }
}

/// Saturating packet/byte counter over an indexed object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterResource {
    /// Number of cells
    pub capacity: u64,
    /// Value bit-width
    pub width: usize,
    /// Largest value the counter can reach, when statically proven
    pub saturation_max: Option<u64>,
    /// Objects this counter realizes
    pub objs: BTreeSet<ObjectId>,
    /// Diagram nodes that created or extended this counter
    pub nodes: BTreeSet<NodeId>,
}

/// Index allocator managing a growable index space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegerAllocator {
    /// Number of allocatable indices
    pub capacity: u64,
    /// Minimum bits needed to address `capacity` indices
    pub index_width: usize,
    /// Derived liveness-query table
    pub query: Table,
    /// Derived rejuvenation table
    pub rejuvenation: Table,
    /// Objects this allocator realizes
    pub objs: BTreeSet<ObjectId>,
    /// Diagram nodes that created or extended this allocator
    pub nodes: BTreeSet<NodeId>,
}

impl IntegerAllocator {
    pub fn new(obj: ObjectId, node: NodeId, capacity: u64, index_expr: Expr) -> Self {
        let mut query = Table::new(format!("alloc_{}_query", obj), obj, node);
        query.add_key(TableKey::new(index_expr.clone()));
        let mut rejuvenation = Table::new(format!("alloc_{}_rejuvenate", obj), obj, node);
        rejuvenation.add_key(TableKey::new(index_expr));
        Self {
            capacity,
            index_width: index_width(capacity),
            query,
            rejuvenation,
            objs: BTreeSet::from([obj]),
            nodes: BTreeSet::from([node]),
        }
    }
}

/// Minimum index width for a capacity, by doubling-range search.
///
/// Widens one bit at a time until the representable range covers the
/// capacity, so `2^(width-1) < capacity <= 2^width` for capacity > 1.
pub fn index_width(capacity: u64) -> usize {
    let mut width = 0usize;
    let mut range = 1u64;
    while range < capacity {
        width += 1;
        range = range.saturating_mul(2);
    }
    width
}

/// A physical resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Resource {
    Table(Table),
    Counter(CounterResource),
    IntegerAllocator(IntegerAllocator),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Table(_) => ResourceKind::Table,
            Resource::Counter(_) => ResourceKind::Counter,
            Resource::IntegerAllocator(_) => ResourceKind::IntegerAllocator,
        }
    }

    /// Objects this resource realizes
    pub fn objs(&self) -> &BTreeSet<ObjectId> {
        match self {
            Resource::Table(t) => &t.objs,
            Resource::Counter(c) => &c.objs,
            Resource::IntegerAllocator(a) => &a.objs,
        }
    }

    /// Diagram nodes that created or extended this resource
    pub fn nodes(&self) -> &BTreeSet<NodeId> {
        match self {
            Resource::Table(t) => &t.nodes,
            Resource::Counter(c) => &c.nodes,
            Resource::IntegerAllocator(a) => &a.nodes,
        }
    }

    pub fn nodes_mut(&mut self) -> &mut BTreeSet<NodeId> {
        match self {
            Resource::Table(t) => &mut t.nodes,
            Resource::Counter(c) => &mut c.nodes,
            Resource::IntegerAllocator(a) => &mut a.nodes,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Resource::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_table_mut(&mut self) -> Option<&mut Table> {
        match self {
            Resource::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_allocator(&self) -> Option<&IntegerAllocator> {
        match self {
            Resource::IntegerAllocator(a) => Some(a),
            _ => None,
        }
    }
}

/// De-duplicating collection of one target's resources.
///
/// At most one resource realizes any given object; reuse goes through
/// [`ResourceSet::for_object_mut`], never through a second insert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSet {
    items: Vec<Resource>,
}

impl ResourceSet {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.items.iter()
    }

    /// The resource realizing `obj`, if one exists
    pub fn for_object(&self, obj: ObjectId) -> Option<&Resource> {
        self.items.iter().find(|r| r.objs().contains(&obj))
    }

    pub fn for_object_mut(&mut self, obj: ObjectId) -> Option<&mut Resource> {
        self.items.iter_mut().find(|r| r.objs().contains(&obj))
    }

    /// All resources of one kind
    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &Resource> {
        self.items.iter().filter(move |r| r.kind() == kind)
    }

    /// Insert a new resource. Erroring here means a module committed without
    /// first checking [`ResourceSet::for_object`].
    pub fn insert(&mut self, resource: Resource) -> Result<()> {
        for existing in &self.items {
            if let Some(shared) = existing.objs().intersection(resource.objs()).next() {
                return Err(SynthError::ResourceConflict(*shared, existing.kind()));
            }
        }
        self.items.push(resource);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_width_brackets_capacity() {
        assert_eq!(index_width(1), 0);
        assert_eq!(index_width(2), 1);
        assert_eq!(index_width(3), 2);
        assert_eq!(index_width(65536), 16);
        assert_eq!(index_width(65537), 17);
    }

    #[test]
    fn resource_set_rejects_second_claim_on_object() {
        let obj = ObjectId(1);
        let node = NodeId(0);
        let mut set = ResourceSet::default();
        set.insert(Resource::Table(Table::new("t", obj, node))).unwrap();

        let counter = Resource::Counter(CounterResource {
            capacity: 16,
            width: 32,
            saturation_max: None,
            objs: BTreeSet::from([obj]),
            nodes: BTreeSet::from([node]),
        });
        assert!(matches!(
            set.insert(counter),
            Err(SynthError::ResourceConflict(o, ResourceKind::Table)) if o == obj
        ));
    }

    #[test]
    fn coalesced_param_extends_object_coverage() {
        let mut table = Table::new("flows", ObjectId(1), NodeId(0));
        table.add_param(Expr::symbol("backend"), ObjectId(2), NodeId(3));
        table.add_param(Expr::symbol("backend"), ObjectId(2), NodeId(4));
        assert_eq!(table.params.len(), 1);
        assert!(table.objs.contains(&ObjectId(2)));
        assert!(table.nodes.contains(&NodeId(4)));
    }
}
