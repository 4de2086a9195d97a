//! Chimera decision diagrams
//!
//! This crate handles:
//! - The Call/Branch/Return node model produced by the trace frontend
//! - Read-only traversal queries (successors, reachability, path constraints)
//! - The surgery API used by speculative controller rewriting
//!
//! Everything downstream of the frontend treats node ids as opaque and
//! stable; only [`surgery::DiagramSurgeon`] may add or relink nodes.

pub mod diagram;
pub mod functions;
pub mod surgery;

pub use diagram::{
    BranchNode, CallArg, CallNode, Diagram, DiagramNode, NodeId, NodeKind, ObjectId, ReturnNode,
    RouteOp,
};
pub use surgery::DiagramSurgeon;

use thiserror::Error;

/// Diagram-layer errors
#[derive(Debug, Error)]
pub enum DiagramError {
    #[error("unknown node id {0}")]
    UnknownNode(u64),
    #[error("node {0} is not a {1} node")]
    WrongKind(u64, &'static str),
    #[error("diagram has no root")]
    MissingRoot,
    #[error("malformed diagram: {0}")]
    Malformed(String),
}

/// Result type for diagram operations
pub type Result<T> = std::result::Result<T, DiagramError>;
