//! Chimera symbolic expressions
//!
//! This crate handles:
//! - The expression tree shared by the diagram and the synthesis engine
//! - The oracle interface for equivalence/entailment/constant queries
//! - A memoizing structural reference oracle
//!
//! The engine treats the oracle as an opaque, pure decision procedure; the
//! structural oracle here is sound but deliberately incomplete.

pub mod expr;
pub mod oracle;

pub use expr::{BinaryOp, Expr, FieldRef, UnaryOp, Value};
pub use oracle::{ExprOracle, StructuralOracle};

use thiserror::Error;

/// Expression-layer errors
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("expression is not a constant: {0}")]
    NotConstant(String),
    #[error("malformed expression: {0}")]
    Malformed(String),
}

/// Result type for expression operations
pub type Result<T> = std::result::Result<T, ExprError>;
