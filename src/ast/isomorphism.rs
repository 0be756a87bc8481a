//! Structural equality of IR trees up to consistent renaming of variables and labels.
//!
//! Compilers duplicate code, most notably `finally` bodies, which get inlined at every exit of the
//! `try` block. The copies are equal instruction by instruction, but each one writes its own
//! variables and declares its own labels, so plain equality is too strict.

use super::{Arena, ExprId, ExprKind, Expression, Label};
use crate::locals::LocalId;
use rustc_hash::FxHashMap;

pub fn compare<T: ?Sized + Isomorphic>(arena: &Arena, x: &T, y: &T) -> bool {
    Checker::new(arena).compare(x, y)
}

pub struct Checker<'a> {
    arena: &'a Arena,
    locals: FxHashMap<LocalId, LocalId>, // x -> y
    locals_rev: FxHashMap<LocalId, LocalId>,
    labels: FxHashMap<Label, Label>,
}

impl<'a> Checker<'a> {
    pub fn new(arena: &'a Arena) -> Self {
        Self {
            arena,
            locals: FxHashMap::default(),
            locals_rev: FxHashMap::default(),
            labels: FxHashMap::default(),
        }
    }

    pub fn compare<T: ?Sized + Isomorphic>(&mut self, x: &T, y: &T) -> bool {
        x.compare(y, self)
    }

    /// Records that label `x` in the first tree corresponds to `y` in the second.
    pub fn define_label(&mut self, x: Label, y: Label) {
        self.labels.insert(x, y);
    }

    pub fn compare_labels(&self, x: Label, y: Label) -> bool {
        self.labels.get(&x).copied().unwrap_or(x) == y
    }

    // Locals map bijectively: the first occurrence fixes the correspondence.
    pub fn compare_locals(&mut self, x: LocalId, y: LocalId) -> bool {
        match (self.locals.get(&x), self.locals_rev.get(&y)) {
            (Some(&mapped), _) => mapped == y,
            (None, Some(_)) => false,
            (None, None) => {
                self.locals.insert(x, y);
                self.locals_rev.insert(y, x);
                true
            }
        }
    }
}

pub trait Isomorphic {
    fn compare(&self, other: &Self, checker: &mut Checker<'_>) -> bool;
}

impl<T: Isomorphic> Isomorphic for [T] {
    fn compare(&self, other: &Self, checker: &mut Checker<'_>) -> bool {
        self.len() == other.len() && self.iter().zip(other).all(|(x, y)| checker.compare(x, y))
    }
}

impl<T: Isomorphic> Isomorphic for Vec<T> {
    fn compare(&self, other: &Self, checker: &mut Checker<'_>) -> bool {
        checker.compare::<[T]>(self.as_ref(), other.as_ref())
    }
}

impl<T: Isomorphic + ?Sized> Isomorphic for Box<T> {
    fn compare(&self, other: &Self, checker: &mut Checker<'_>) -> bool {
        checker.compare::<T>(self, other)
    }
}

impl<T: Isomorphic> Isomorphic for Option<T> {
    fn compare(&self, other: &Self, checker: &mut Checker<'_>) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(x), Some(y)) => checker.compare(x, y),
            _ => false,
        }
    }
}

impl Isomorphic for ExprId {
    fn compare(&self, other: &Self, checker: &mut Checker<'_>) -> bool {
        let arena = checker.arena;
        checker.compare(&arena[*self], &arena[*other])
    }
}

impl Isomorphic for Expression {
    fn compare(&self, other: &Self, checker: &mut Checker<'_>) -> bool {
        if self.void != other.void {
            return false;
        }

        // Children are compared separately, so only the node's own payload is matched here.
        let same_node = match (&self.kind, &other.kind) {
            (ExprKind::Local(x), ExprKind::Local(y)) => checker.compare_locals(*x, *y),
            (ExprKind::Slot(x), ExprKind::Slot(y)) => x == y,
            (ExprKind::Const(x), ExprKind::Const(y)) => x == y,
            (
                ExprKind::Field { field: x, object: ox },
                ExprKind::Field { field: y, object: oy },
            ) => {
                x == y && ox.is_some() == oy.is_some()
            }
            (ExprKind::ArrayElement { .. }, ExprKind::ArrayElement { .. })
            | (ExprKind::ArrayLength { .. }, ExprKind::ArrayLength { .. })
            | (ExprKind::Assign { .. }, ExprKind::Assign { .. })
            | (ExprKind::Ternary { .. }, ExprKind::Ternary { .. })
            | (ExprKind::StringConcat { .. }, ExprKind::StringConcat { .. })
            | (ExprKind::MonitorEnter { .. }, ExprKind::MonitorEnter { .. })
            | (ExprKind::MonitorExit { .. }, ExprKind::MonitorExit { .. }) => true,
            (
                ExprKind::NewArray { element: x, .. },
                ExprKind::NewArray { element: y, .. },
            ) => x == y,
            (
                ExprKind::ArrayInitializer {
                    element: x,
                    length: lx,
                    ..
                },
                ExprKind::ArrayInitializer {
                    element: y,
                    length: ly,
                    ..
                },
            ) => x == y && lx == ly,
            (ExprKind::New { class: x }, ExprKind::New { class: y })
            | (ExprKind::InstanceOf { class: x, .. }, ExprKind::InstanceOf { class: y, .. })
            | (ExprKind::CheckCast { class: x, .. }, ExprKind::CheckCast { class: y, .. }) => {
                x == y
            }
            (
                ExprKind::Construct {
                    class: x,
                    descriptor: dx,
                    ..
                },
                ExprKind::Construct {
                    class: y,
                    descriptor: dy,
                    ..
                },
            ) => x == y && dx == dy,
            (ExprKind::Convert { to: x, .. }, ExprKind::Convert { to: y, .. }) => x == y,
            (ExprKind::Binary { op: x, .. }, ExprKind::Binary { op: y, .. }) => x == y,
            (ExprKind::Unary { op: x, .. }, ExprKind::Unary { op: y, .. }) => x == y,
            (ExprKind::Logical { op: x, .. }, ExprKind::Logical { op: y, .. }) => x == y,
            (ExprKind::OpAssign { op: x, .. }, ExprKind::OpAssign { op: y, .. }) => x == y,
            (
                ExprKind::IncDec {
                    increment: ix,
                    prefix: px,
                    ..
                },
                ExprKind::IncDec {
                    increment: iy,
                    prefix: py,
                    ..
                },
            ) => ix == iy && px == py,
            (
                ExprKind::Call {
                    kind: kx,
                    method: mx,
                    object: ox,
                    ..
                },
                ExprKind::Call {
                    kind: ky,
                    method: my,
                    object: oy,
                    ..
                },
            ) => kx == ky && mx == my && ox.is_some() == oy.is_some(),
            (
                ExprKind::Dynamic {
                    name: nx,
                    descriptor: dx,
                    bootstrap: bx,
                    ..
                },
                ExprKind::Dynamic {
                    name: ny,
                    descriptor: dy,
                    bootstrap: by,
                    ..
                },
            ) => nx == ny && dx == dy && bx == by,
            _ => false,
        };
        if !same_node {
            return false;
        }

        let x_children: Vec<ExprId> = self.subexprs().collect();
        let y_children: Vec<ExprId> = other.subexprs().collect();
        checker.compare(&x_children, &y_children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BinOp;
    use crate::instruction::{ArithOp, Constant};
    use crate::types::Type;

    fn assign_sum(arena: &mut Arena, target: u32, source: u32, addend: i32) -> ExprId {
        let read = arena.add(ExprKind::Local(LocalId(source)), Type::int_slot());
        let constant = arena.int(addend);
        let sum = arena.add(
            ExprKind::Binary {
                op: BinOp::Arith(ArithOp::Add),
                lhs: read,
                rhs: constant,
            },
            Type::int_slot(),
        );
        let target = arena.add(ExprKind::Local(LocalId(target)), Type::int_slot());
        arena.add(
            ExprKind::Assign {
                target,
                value: sum,
            },
            Type::int_slot(),
        )
    }

    #[test]
    fn locals_are_renamed_consistently() {
        let mut arena = Arena::new();
        let x = vec![assign_sum(&mut arena, 1, 0, 5), assign_sum(&mut arena, 0, 1, 5)];
        let y = vec![assign_sum(&mut arena, 3, 2, 5), assign_sum(&mut arena, 2, 3, 5)];
        let z = vec![assign_sum(&mut arena, 3, 2, 5), assign_sum(&mut arena, 2, 2, 5)];
        let w = vec![assign_sum(&mut arena, 3, 2, 5), assign_sum(&mut arena, 2, 3, 6)];
        assert!(compare(&arena, &x, &y));
        assert!(!compare(&arena, &x, &z));
        assert!(!compare(&arena, &x, &w));
    }

    #[test]
    fn constants_and_slots() {
        let mut arena = Arena::new();
        let a = arena.add(ExprKind::Const(Constant::Long(1)), Type::UNKNOWN);
        let b = arena.add(ExprKind::Const(Constant::Long(1)), Type::int_slot());
        let c = arena.add(ExprKind::Const(Constant::Int(1)), Type::UNKNOWN);
        // Types are inferred later and don't participate.
        assert!(compare(&arena, &a, &b));
        assert!(!compare(&arena, &a, &c));
    }
}
