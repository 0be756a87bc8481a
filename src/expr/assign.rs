//! Assignments whose value is used, increments and compound assignments.

use super::Builder;
use super::node::Tail;
use super::operator::{Outcome, build_operation};
use crate::ast::{BinOp, ExprId, ExprKind, isomorphism};
use crate::graph::Shuffle;
use crate::instruction::{ArithOp, Constant, Opcode};
use crate::locals::SlotKey;
use crate::types::DescriptorError;

/// The number of values a store pops besides the stored value.
fn store_components(opcode: &Opcode) -> Option<usize> {
    match opcode {
        Opcode::Store { .. } | Opcode::PutField { is_static: true, .. } => Some(0),
        Opcode::PutField { is_static: false, .. } => Some(1),
        Opcode::ArrayStore(_) => Some(2),
        _ => None,
    }
}

fn is_one(kind: &ExprKind) -> bool {
    matches!(
        kind,
        ExprKind::Const(Constant::Int(1) | Constant::Long(1))
    ) || matches!(kind, ExprKind::Const(Constant::Float(x)) if *x == 1.0)
        || matches!(kind, ExprKind::Const(Constant::Double(x)) if *x == 1.0)
}

impl Builder<'_> {
    pub(super) fn dup_at(&self, address: u32, count: usize, skip: usize) -> bool {
        let node = &self.nodes[&address];
        node.stmts.is_empty()
            && matches!(
                node.tail,
                Tail::Shuffle(Shuffle::Dup { count: c, skip: s }) if c == count && s == skip
            )
    }

    /// Whether `store` writes the location `target` reads.
    fn stores_to(&self, store: &Opcode, target: ExprId) -> bool {
        match (store, &self.arena[target].kind) {
            (Opcode::Store { slot, .. }, ExprKind::Slot(SlotKey::Slot(read))) => slot == read,
            (Opcode::ArrayStore(_), ExprKind::ArrayElement { .. }) => true,
            (Opcode::PutField { field, is_static }, ExprKind::Field { object, field: read }) => {
                field == read && *is_static == object.is_none()
            }
            _ => false,
        }
    }

    /// `iinc` right after loading the same variable is a postfix increment, right before loading
    /// it a prefix one.
    pub(super) fn fuse_increment(&mut self, address: u32) -> Result<Option<u32>, DescriptorError> {
        let node = &self.nodes[&address];
        let Tail::Op(Opcode::Increment { slot, delta }) = node.tail else {
            return Ok(None);
        };
        if delta != 1 && delta != -1 {
            return Ok(None);
        }
        let is_load = |builder: &Self, address: u32| match builder.nodes[&address].tail {
            Tail::Value(value) => {
                (builder.arena[value].kind == ExprKind::Slot(SlotKey::Slot(slot))).then_some(value)
            }
            _ => None,
        };
        let increment = delta == 1;

        if node.stmts.is_empty()
            && let Some(previous) = self.fusable_predecessor(address)
            && let Some(target) = is_load(&*self, previous)
        {
            let stmts = self.nodes[&previous].stmts.clone();
            let ty = self.arena[target].ty.clone();
            let value = self.arena.add(
                ExprKind::IncDec {
                    target,
                    increment,
                    prefix: false,
                },
                ty,
            );
            return Ok(Some(self.collapse(previous, address, stmts, Tail::Value(value))));
        }

        let next = node.end;
        if self.fusable_predecessor(next) == Some(address)
            && self.nodes[&next].stmts.is_empty()
            && let Some(target) = is_load(&*self, next)
        {
            let stmts = self.nodes[&address].stmts.clone();
            let ty = self.arena[target].ty.clone();
            let value = self.arena.add(
                ExprKind::IncDec {
                    target,
                    increment,
                    prefix: true,
                },
                ty,
            );
            return Ok(Some(self.collapse(address, next, stmts, Tail::Value(value))));
        }

        Ok(None)
    }

    /// `x = y = v` and friends: a store whose value was duplicated beforehand.
    pub(super) fn fuse_dup_assignment(
        &mut self,
        address: u32,
    ) -> Result<Option<u32>, DescriptorError> {
        let node = &self.nodes[&address];
        let Tail::Op(store) = &node.tail else {
            return Ok(None);
        };
        let Some(components) = store_components(store) else {
            return Ok(None);
        };
        if !node.stmts.is_empty() {
            return Ok(None);
        }
        let store = store.clone();

        let Some(dup) = self.fusable_predecessor(address) else {
            return Ok(None);
        };
        if !self.dup_at(dup, 1, components) {
            return Ok(None);
        }
        let Some(operands) = self.operands(dup, components + 1) else {
            return Ok(None);
        };
        if operands.lvalue.is_some() {
            return Ok(None);
        }

        let Outcome::Stmt(assignment) =
            build_operation(self.ctx, self.arena, &store, &operands.values)?
        else {
            unreachable!("stores produce statements");
        };
        let ExprKind::Assign { target, .. } = self.arena[assignment].kind else {
            unreachable!("stores produce assignments");
        };
        let ty = self.arena[target].ty.clone();
        let expr = &mut self.arena[assignment];
        expr.void = false;
        expr.ty = ty;

        Ok(Some(self.collapse(
            operands.first,
            address,
            operands.stmts,
            Tail::Value(assignment),
        )))
    }

    /// `dup; getfield` and `dup2; xaload`: a location that is about to be read and written.
    pub(super) fn fuse_dup_load(&mut self, address: u32) -> Result<Option<u32>, DescriptorError> {
        let node = &self.nodes[&address];
        let components = match &node.tail {
            Tail::Op(Opcode::GetField {
                is_static: false, ..
            }) => 1,
            Tail::Op(Opcode::ArrayLoad(_)) => 2,
            _ => return Ok(None),
        };
        let Tail::Op(load) = node.tail.clone() else {
            unreachable!();
        };
        if !node.stmts.is_empty() {
            return Ok(None);
        }

        let Some(dup) = self.fusable_predecessor(address) else {
            return Ok(None);
        };
        if !self.dup_at(dup, components, 0) {
            return Ok(None);
        }
        let Some(operands) = self.operands(dup, components) else {
            return Ok(None);
        };
        if operands.lvalue.is_some()
            || !operands.values.iter().all(|&value| self.arena.is_pure(value))
        {
            return Ok(None);
        }

        let copies: Vec<ExprId> = operands
            .values
            .iter()
            .map(|&value| self.arena.deep_clone(value))
            .collect();
        let (Outcome::Value(target), Outcome::Value(top)) = (
            build_operation(self.ctx, self.arena, &load, &operands.values)?,
            build_operation(self.ctx, self.arena, &load, &copies)?,
        ) else {
            unreachable!("loads produce values");
        };

        Ok(Some(self.collapse(
            operands.first,
            address,
            operands.stmts,
            Tail::Lvalue { target, top },
        )))
    }

    /// `x++` on anything but an `int` variable: the old value is duplicated below the location,
    /// then incremented and stored.
    pub(super) fn fuse_post_increment(
        &mut self,
        address: u32,
    ) -> Result<Option<u32>, DescriptorError> {
        let node = &self.nodes[&address];
        let Tail::Op(store) = &node.tail else {
            return Ok(None);
        };
        let Some(components) = store_components(store) else {
            return Ok(None);
        };
        if !node.stmts.is_empty() {
            return Ok(None);
        }
        let store = store.clone();

        let Some(arith) = self.fusable_predecessor(address) else {
            return Ok(None);
        };
        let arith_node = &self.nodes[&arith];
        let Tail::Op(Opcode::Arith {
            op: op @ (ArithOp::Add | ArithOp::Sub),
            ..
        }) = arith_node.tail
        else {
            return Ok(None);
        };
        if !arith_node.stmts.is_empty() {
            return Ok(None);
        }

        let Some(one) = self.fusable_predecessor(arith) else {
            return Ok(None);
        };
        if !self.nodes[&one]
            .pure_value()
            .is_some_and(|value| is_one(&self.arena[value].kind))
        {
            return Ok(None);
        }

        let Some(dup) = self.fusable_predecessor(one) else {
            return Ok(None);
        };
        if !self.dup_at(dup, 1, components) {
            return Ok(None);
        }

        let Some(origin) = self.fusable_predecessor(dup) else {
            return Ok(None);
        };
        let target = match self.nodes[&origin].tail {
            Tail::Lvalue { target, .. }
                if self.arena[target].subexprs().count() == components =>
            {
                target
            }
            Tail::Value(value) if components == 0 => value,
            _ => return Ok(None),
        };
        if !self.stores_to(&store, target) {
            return Ok(None);
        }

        let ty = self.arena[target].ty.clone();
        let value = self.arena.add(
            ExprKind::IncDec {
                target,
                increment: op == ArithOp::Add,
                prefix: false,
            },
            ty,
        );
        let stmts = self.nodes[&origin].stmts.clone();
        Ok(Some(self.collapse(origin, address, stmts, Tail::Value(value))))
    }

    /// Rewrites `x = x op y` into `x op= y` and `x = x + 1` into `++x`.
    pub(super) fn fuse_compound(&mut self, address: u32) -> Option<u32> {
        let node = &self.nodes[&address];
        let mut roots = node.stmts.clone();
        if let Tail::Value(value) = node.tail {
            roots.push(value);
        }
        let mut changed = false;
        for root in roots {
            changed |= self.make_compound(root);
        }
        changed.then_some(address)
    }

    fn make_compound(&mut self, id: ExprId) -> bool {
        let ExprKind::Assign { target, value } = self.arena[id].kind else {
            return false;
        };
        let ExprKind::Binary {
            op: BinOp::Arith(op),
            lhs,
            rhs,
        } = self.arena[value].kind
        else {
            return false;
        };
        if !self.arena.is_pure(target) || !isomorphism::compare(self.arena, &target, &lhs) {
            return false;
        }

        self.arena[id].kind =
            if matches!(op, ArithOp::Add | ArithOp::Sub) && is_one(&self.arena[rhs].kind) {
                ExprKind::IncDec {
                    target,
                    increment: op == ArithOp::Add,
                    prefix: true,
                }
            } else {
                ExprKind::OpAssign {
                    op,
                    target,
                    value: rhs,
                }
            };
        true
    }
}
