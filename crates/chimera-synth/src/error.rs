//! Error types for the synthesis engine
//!
//! Non-matches are not errors and never appear here; a module that does not
//! apply simply returns an empty outcome. These variants are invariant
//! violations: they indicate a bug in a module's matching logic or in the
//! driver, not a recoverable runtime condition.

use crate::resource::ResourceKind;
use chimera_diagram::{DiagramError, NodeId, ObjectId};
use thiserror::Error;

/// Errors that can occur during synthesis
#[derive(Debug, Error)]
pub enum SynthError {
    /// A second resource kind was committed for an already-placed object
    #[error("placement conflict: object {object} already placed as {existing}, requested {requested}")]
    PlacementConflict {
        object: ObjectId,
        existing: ResourceKind,
        requested: ResourceKind,
    },

    /// Two resources claim to realize the same object
    #[error("object {0} is already realized by a {1} resource")]
    ResourceConflict(ObjectId, ResourceKind),

    /// A module committed against a node that is not awaiting processing
    #[error("node {0} is not on the frontier")]
    NotOnFrontier(NodeId),

    /// A module of one target committed onto another target's path
    #[error("frontier node {node} belongs to {owner}, module belongs to {module_target}")]
    WrongOwner {
        node: NodeId,
        owner: String,
        module_target: String,
    },

    /// A module was invoked on a node shape it cannot handle after matching
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Underlying diagram error
    #[error(transparent)]
    Diagram(#[from] DiagramError),
}

/// Result type for synthesis operations
pub type Result<T> = std::result::Result<T, SynthError>;
