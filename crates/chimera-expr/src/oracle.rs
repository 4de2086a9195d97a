//! Oracle interface over symbolic expressions
//!
//! The synthesis engine only ever asks the oracle five questions, all pure
//! and memoizable. A production deployment plugs a solver-backed oracle in
//! here; the [`StructuralOracle`] below answers from syntactic normalization
//! and constant folding alone.

use crate::expr::{BinaryOp, Expr, UnaryOp, Value};
use std::collections::HashMap;
use std::sync::Mutex;

/// Decision procedure over expressions.
///
/// All methods must be deterministic and side-effect free so results can be
/// cached and calls can run from parallel synthesis workers.
pub trait ExprOracle: Send + Sync {
    /// Are the two expressions equal for every assignment of their symbols?
    fn equivalent(&self, a: &Expr, b: &Expr) -> bool;

    /// Does `expr` hold under every assignment satisfying `constraints`?
    fn always_true(&self, expr: &Expr, constraints: &[Expr]) -> bool;

    /// The constant this expression evaluates to, if it is one
    fn constant_value(&self, expr: &Expr) -> Option<Value>;

    /// A (possibly) smaller expression with the same meaning
    fn simplify(&self, expr: &Expr) -> Expr;

    /// Split a conjunction into its conjuncts (a non-conjunction is returned whole)
    fn split_on_and(&self, expr: &Expr) -> Vec<Expr>;
}

/// Reference oracle: canonical ordering of commutative operands, constant
/// folding, and identity rewrites. Sound but incomplete — a `false` answer
/// from `equivalent`/`always_true` means "not provable here".
#[derive(Default)]
pub struct StructuralOracle {
    equiv_cache: Mutex<HashMap<(Expr, Expr), bool>>,
}

impl StructuralOracle {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(&self, expr: &Expr) -> Expr {
        match expr {
            Expr::Literal(_) | Expr::Symbol(_) | Expr::Field(_) => expr.clone(),
            Expr::Binary { op, left, right } => {
                let mut left = self.normalize(left);
                let mut right = self.normalize(right);
                if op.is_commutative() && right < left {
                    std::mem::swap(&mut left, &mut right);
                }
                self.fold_binary(*op, left, right)
            }
            Expr::Unary { op, operand } => {
                let operand = self.normalize(operand);
                self.fold_unary(*op, operand)
            }
            Expr::Conditional {
                cond,
                then_expr,
                else_expr,
            } => {
                let cond = self.normalize(cond);
                if cond.is_true() {
                    return self.normalize(then_expr);
                }
                if cond.is_false() {
                    return self.normalize(else_expr);
                }
                Expr::Conditional {
                    cond: Box::new(cond),
                    then_expr: Box::new(self.normalize(then_expr)),
                    else_expr: Box::new(self.normalize(else_expr)),
                }
            }
            Expr::Slice { base, high, low } => Expr::Slice {
                base: Box::new(self.normalize(base)),
                high: *high,
                low: *low,
            },
        }
    }

    fn fold_binary(&self, op: BinaryOp, left: Expr, right: Expr) -> Expr {
        // identical operands collapse for a few operators
        if left == right {
            match op {
                BinaryOp::Equal | BinaryOp::LessEqual | BinaryOp::GreaterEqual => {
                    return Expr::bool(true)
                }
                BinaryOp::NotEqual | BinaryOp::Less | BinaryOp::Greater => {
                    return Expr::bool(false)
                }
                BinaryOp::LogicalAnd | BinaryOp::LogicalOr => return left,
                BinaryOp::Sub => return Expr::int(0),
                _ => {}
            }
        }

        match op {
            BinaryOp::LogicalAnd => {
                if left.is_true() {
                    return right;
                }
                if right.is_true() {
                    return left;
                }
                if left.is_false() || right.is_false() {
                    return Expr::bool(false);
                }
            }
            BinaryOp::LogicalOr => {
                if left.is_false() {
                    return right;
                }
                if right.is_false() {
                    return left;
                }
                if left.is_true() || right.is_true() {
                    return Expr::bool(true);
                }
            }
            _ => {}
        }

        if let (Expr::Literal(lv), Expr::Literal(rv)) = (&left, &right) {
            if let Some(folded) = eval_binary(op, lv, rv) {
                return Expr::Literal(folded);
            }
        }

        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn fold_unary(&self, op: UnaryOp, operand: Expr) -> Expr {
        if op == UnaryOp::Not {
            // double negation
            if let Expr::Unary {
                op: UnaryOp::Not,
                operand: inner,
            } = &operand
            {
                return (**inner).clone();
            }
            if let Expr::Literal(v) = &operand {
                if let Some(b) = v.as_bool() {
                    return Expr::bool(!b);
                }
            }
        }
        if op == UnaryOp::Negate {
            if let Expr::Literal(Value::Integer(v)) = &operand {
                return Expr::int(-v);
            }
        }
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }
}

fn eval_binary(op: BinaryOp, left: &Value, right: &Value) -> Option<Value> {
    let (l, r) = (left.as_int()?, right.as_int()?);
    let value = match op {
        BinaryOp::Add => Value::Integer(l.wrapping_add(r)),
        BinaryOp::Sub => Value::Integer(l.wrapping_sub(r)),
        BinaryOp::Mul => Value::Integer(l.wrapping_mul(r)),
        BinaryOp::Div => {
            if r == 0 {
                return None;
            }
            Value::Integer(l / r)
        }
        BinaryOp::Mod => {
            if r == 0 {
                return None;
            }
            Value::Integer(l % r)
        }
        BinaryOp::Equal => Value::Bool(l == r),
        BinaryOp::NotEqual => Value::Bool(l != r),
        BinaryOp::Less => Value::Bool(l < r),
        BinaryOp::LessEqual => Value::Bool(l <= r),
        BinaryOp::Greater => Value::Bool(l > r),
        BinaryOp::GreaterEqual => Value::Bool(l >= r),
        BinaryOp::BitwiseAnd => Value::Integer(l & r),
        BinaryOp::BitwiseOr => Value::Integer(l | r),
        BinaryOp::BitwiseXor => Value::Integer(l ^ r),
        BinaryOp::LeftShift => Value::Integer(l.wrapping_shl(r as u32)),
        BinaryOp::RightShift => Value::Integer(l.wrapping_shr(r as u32)),
        BinaryOp::LogicalAnd => Value::Bool(l != 0 && r != 0),
        BinaryOp::LogicalOr => Value::Bool(l != 0 || r != 0),
    };
    Some(value)
}

impl ExprOracle for StructuralOracle {
    fn equivalent(&self, a: &Expr, b: &Expr) -> bool {
        if a == b {
            return true;
        }
        let key = (a.clone(), b.clone());
        if let Some(&hit) = self.equiv_cache.lock().unwrap().get(&key) {
            return hit;
        }
        let result = self.normalize(a) == self.normalize(b);
        self.equiv_cache.lock().unwrap().insert(key, result);
        result
    }

    fn always_true(&self, expr: &Expr, constraints: &[Expr]) -> bool {
        let goal = self.normalize(expr);
        if goal.is_true() {
            return true;
        }
        constraints
            .iter()
            .flat_map(|c| self.split_on_and(c))
            .any(|c| self.normalize(&c) == goal)
    }

    fn constant_value(&self, expr: &Expr) -> Option<Value> {
        match self.normalize(expr) {
            Expr::Literal(v) => Some(v),
            _ => None,
        }
    }

    fn simplify(&self, expr: &Expr) -> Expr {
        self.normalize(expr)
    }

    fn split_on_and(&self, expr: &Expr) -> Vec<Expr> {
        fn split(e: &Expr, out: &mut Vec<Expr>) {
            match e {
                Expr::Binary {
                    op: BinaryOp::LogicalAnd,
                    left,
                    right,
                } => {
                    split(left, out);
                    split(right, out);
                }
                other => out.push(other.clone()),
            }
        }
        let mut out = Vec::new();
        split(&self.normalize(expr), &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commutative_operands_are_equivalent() {
        let oracle = StructuralOracle::new();
        let a = Expr::eq(Expr::symbol("x"), Expr::field("ipv4", "ttl"));
        let b = Expr::eq(Expr::field("ipv4", "ttl"), Expr::symbol("x"));
        assert!(oracle.equivalent(&a, &b));
    }

    #[test]
    fn constant_folding_reaches_fixpoint() {
        let oracle = StructuralOracle::new();
        let e = Expr::and(
            Expr::eq(Expr::int(2), Expr::int(2)),
            Expr::binary(BinaryOp::Less, Expr::int(1), Expr::int(3)),
        );
        assert_eq!(oracle.constant_value(&e), Some(Value::Bool(true)));
    }

    #[test]
    fn always_true_uses_path_constraints() {
        let oracle = StructuralOracle::new();
        let goal = Expr::eq(Expr::symbol("alloc_ok"), Expr::int(1));
        let constraints = vec![Expr::and(
            Expr::eq(Expr::symbol("alloc_ok"), Expr::int(1)),
            Expr::not(Expr::eq(Expr::symbol("port"), Expr::int(0))),
        )];
        assert!(oracle.always_true(&goal, &constraints));
        assert!(!oracle.always_true(&Expr::eq(Expr::symbol("other"), Expr::int(1)), &constraints));
    }

    #[test]
    fn split_on_and_flattens_nested_conjunctions() {
        let oracle = StructuralOracle::new();
        let e = Expr::and(
            Expr::and(Expr::symbol("a"), Expr::symbol("b")),
            Expr::symbol("c"),
        );
        assert_eq!(oracle.split_on_and(&e).len(), 3);
    }
}
