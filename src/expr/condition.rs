//! Branch conditions, `&&`/`||` chains and `?:`.

use super::Builder;
use super::node::Tail;
use crate::ast::{Arena, BinOp, ExprId, ExprKind, LogicalOp, UnaryOp, simplify::negate};
use crate::instruction::{CompareKind, CompareOp, Constant, JumpOperands};
use crate::types::{SimpleType, Type};

fn boolean() -> Type {
    Type::simple(SimpleType::Boolean)
}

fn compare(arena: &mut Arena, op: CompareOp, lhs: ExprId, rhs: ExprId) -> ExprId {
    arena.add(
        ExprKind::Binary {
            op: BinOp::Cond(op),
            lhs,
            rhs,
        },
        boolean(),
    )
}

/// Whether `a op b` has the same truth value as `cmp(a, b) op 0`, NaN included.
fn is_direct(kind: CompareKind, op: CompareOp) -> bool {
    match kind {
        CompareKind::Long => true,
        // NaN yields -1, so `<` and `<=` would hold.
        CompareKind::FloatL | CompareKind::DoubleL => !matches!(op, CompareOp::Lt | CompareOp::Le),
        // NaN yields 1, so `>` and `>=` would hold.
        CompareKind::FloatG | CompareKind::DoubleG => !matches!(op, CompareOp::Gt | CompareOp::Ge),
    }
}

/// The condition under which a conditional jump is taken.
pub fn jump_condition(
    arena: &mut Arena,
    op: CompareOp,
    kind: JumpOperands,
    operands: &[ExprId],
) -> ExprId {
    match (kind, operands) {
        (JumpOperands::IntZero, &[value]) => {
            if let ExprKind::Binary {
                op: BinOp::Compare(compare_kind),
                lhs,
                rhs,
            } = arena[value].kind
            {
                return if is_direct(compare_kind, op) {
                    arena[value].kind = ExprKind::Binary {
                        op: BinOp::Cond(op),
                        lhs,
                        rhs,
                    };
                    arena[value].ty = boolean();
                    value
                } else {
                    let inverse = compare(arena, op.negate(), lhs, rhs);
                    arena.add(
                        ExprKind::Unary {
                            op: UnaryOp::Not,
                            operand: inverse,
                        },
                        boolean(),
                    )
                };
            }
            let zero = arena.int(0);
            compare(arena, op, value, zero)
        }
        (JumpOperands::Null, &[value]) => {
            let null = arena.add(ExprKind::Const(Constant::Null), Type::null());
            compare(arena, op, value, null)
        }
        (JumpOperands::IntPair | JumpOperands::ReferencePair, &[lhs, rhs]) => {
            compare(arena, op, lhs, rhs)
        }
        _ => panic!("{kind:?} jump with {} operands", operands.len()),
    }
}

impl Builder<'_> {
    /// Fuses `if (a) goto X; if (b) goto X` into `if (a || b) goto X`, and
    /// `if (a) goto Y; if (b) goto X; Y:` into `if (!a && b) goto X`.
    pub(super) fn fuse_short_circuit(&mut self, address: u32) -> Option<u32> {
        let first = &self.nodes[&address];
        let Tail::If(first_condition) = first.tail else {
            return None;
        };
        let [first_false, first_true] = first.successors[..] else {
            return None;
        };
        if first_false != first.end || !self.is_simple_entry(first_false) {
            return None;
        }

        let second = &self.nodes[&first_false];
        let Tail::If(second_condition) = second.tail else {
            return None;
        };
        if !second.stmts.is_empty() {
            return None;
        }
        let [second_false, second_true] = second.successors[..] else {
            return None;
        };

        let (op, lhs, merged) = if first_true == second_true {
            (LogicalOp::Or, first_condition, first_true)
        } else if first_true == second_false {
            (LogicalOp::And, negate(self.arena, first_condition), second_false)
        } else {
            return None;
        };
        *self.refs.entry(merged).or_default() -= 1;

        let condition = self.arena.add(
            ExprKind::Logical {
                op,
                lhs,
                rhs: second_condition,
            },
            boolean(),
        );
        let stmts = self.nodes[&address].stmts.clone();
        Some(self.collapse(address, first_false, stmts, Tail::If(condition)))
    }

    /// Fuses `if (c) goto B; push x; goto E; B: push y; E:` into `push c ? y : x`.
    pub(super) fn fuse_ternary(&mut self, address: u32) -> Option<u32> {
        let head = &self.nodes[&address];
        let Tail::If(condition) = head.tail else {
            return None;
        };
        let [false_branch, true_branch] = head.successors[..] else {
            return None;
        };
        if false_branch != head.end || !self.is_simple_entry(false_branch) {
            return None;
        }

        let if_false = &self.nodes[&false_branch];
        let false_value = if_false.pure_value()?;
        let [merge] = if_false.successors[..] else {
            return None;
        };
        if if_false.end != true_branch || !self.is_simple_entry(true_branch) {
            return None;
        }

        let if_true = self.nodes.get(&true_branch)?;
        let true_value = if_true.pure_value()?;
        if if_true.successors != [merge] {
            return None;
        }
        *self.refs.entry(merge).or_default() -= 1;

        let ty = self.arena[false_value].ty.intersect_or_widen(
            &self.arena[true_value].ty,
            self.ctx.hierarchy,
        );
        let condition = negate(self.arena, condition);
        let ternary = self.arena.add(
            ExprKind::Ternary {
                condition,
                branches: [false_value, true_value],
            },
            ty,
        );
        let stmts = self.nodes[&address].stmts.clone();
        Some(self.collapse(address, true_branch, stmts, Tail::Value(ternary)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_comparisons_respect_nan() {
        let mut arena = Arena::new();
        let lhs = arena.add(
            ExprKind::Slot(crate::locals::SlotKey::Slot(0)),
            Type::simple(SimpleType::Float),
        );
        let rhs = arena.add(
            ExprKind::Slot(crate::locals::SlotKey::Slot(1)),
            Type::simple(SimpleType::Float),
        );
        let mut condition = |kind, op| {
            let lhs = arena.deep_clone(lhs);
            let rhs = arena.deep_clone(rhs);
            let cmp = arena.add(
                ExprKind::Binary {
                    op: BinOp::Compare(kind),
                    lhs,
                    rhs,
                },
                Type::simple(SimpleType::Int),
            );
            let id = jump_condition(&mut arena, op, JumpOperands::IntZero, &[cmp]);
            arena.debug(&id).to_string()
        };

        assert_eq!(condition(CompareKind::FloatL, CompareOp::Ge), "(slot0 >= slot1)");
        assert_eq!(condition(CompareKind::FloatL, CompareOp::Lt), "!(slot0 >= slot1)");
        assert_eq!(condition(CompareKind::FloatG, CompareOp::Lt), "(slot0 < slot1)");
        assert_eq!(condition(CompareKind::FloatG, CompareOp::Gt), "!(slot0 <= slot1)");
        assert_eq!(condition(CompareKind::DoubleG, CompareOp::Ne), "(slot0 != slot1)");
        assert_eq!(condition(CompareKind::Long, CompareOp::Le), "(slot0 <= slot1)");
    }

    #[test]
    fn null_checks() {
        let mut arena = Arena::new();
        let value = arena.add(
            ExprKind::Slot(crate::locals::SlotKey::Slot(2)),
            Type::any_reference(),
        );
        let id = jump_condition(&mut arena, CompareOp::Ne, JumpOperands::Null, &[value]);
        assert_eq!(arena.debug(&id).to_string(), "(slot2 != null)");
    }
}
