use super::{DebugIr, ExprKind, Expression};
use crate::instruction::Constant;
use crate::types::Type;
use core::fmt::{self, Display};
use core::ops::{Index, IndexMut};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

/// Storage for all expressions of one method.
///
/// Expressions form trees: each node is referenced by at most one parent. Nodes are never freed,
/// so rewrites that drop a subtree simply leave it unreachable.
#[derive(Clone, Debug, Default)]
pub struct Arena {
    exprs: Vec<Expression>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    pub fn alloc(&mut self, expr: Expression) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(expr);
        id
    }

    /// Allocates a value-producing expression.
    pub fn add(&mut self, kind: ExprKind, ty: Type) -> ExprId {
        self.alloc(Expression::new(kind, ty))
    }

    pub fn int(&mut self, value: i32) -> ExprId {
        self.add(ExprKind::Const(Constant::Int(value)), Type::int_constant(value))
    }

    /// Moves the contents of `source` into `target`, leaving `source` unreachable.
    pub fn replace(&mut self, target: ExprId, source: ExprId) {
        if target != source {
            self[target] = self[source].clone();
        }
    }

    /// Copies a whole subtree, so that the copy can be owned by another parent.
    pub fn deep_clone(&mut self, id: ExprId) -> ExprId {
        let mut expr = self[id].clone();
        let children: Vec<ExprId> = expr.subexprs().collect();
        let copies: Vec<ExprId> = children.iter().map(|&child| self.deep_clone(child)).collect();
        let mut copies = copies.into_iter();
        for child in expr.subexprs_mut() {
            *child = copies.next().expect("subexpression count changed while cloning");
        }
        self.alloc(expr)
    }

    /// Whether evaluating the expression has no side effects and cannot throw, so that it can be
    /// evaluated any number of times.
    pub fn is_trivial(&self, id: ExprId) -> bool {
        matches!(
            self[id].kind,
            ExprKind::Slot(_) | ExprKind::Local(_) | ExprKind::Const(_)
        )
    }

    /// Whether the expression only reads state, so that evaluating it twice in a row yields the
    /// same value.
    pub fn is_pure(&self, id: ExprId) -> bool {
        match &self[id].kind {
            ExprKind::Slot(_) | ExprKind::Local(_) | ExprKind::Const(_) => true,
            ExprKind::Field { object, .. } => object.is_none_or(|object| self.is_pure(object)),
            ExprKind::ArrayElement { .. }
            | ExprKind::ArrayLength { .. }
            | ExprKind::Binary { .. }
            | ExprKind::Unary { .. }
            | ExprKind::Convert { .. }
            | ExprKind::InstanceOf { .. } => {
                self[id].subexprs().all(|child| self.is_pure(child))
            }
            _ => false,
        }
    }

    pub fn debug<'a, T: DebugIr + ?Sized>(&'a self, value: &'a T) -> impl Display + 'a {
        struct IrDisplay<'a, T: ?Sized> {
            value: &'a T,
            arena: &'a Arena,
        }

        impl<T: DebugIr + ?Sized> Display for IrDisplay<'_, T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                T::fmt(self.value, f, self.arena)
            }
        }

        IrDisplay { value, arena: self }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Expression> {
        self.exprs.iter_mut()
    }
}

impl Index<ExprId> for Arena {
    type Output = Expression;

    fn index(&self, id: ExprId) -> &Self::Output {
        &self.exprs[id.0 as usize]
    }
}

impl IndexMut<ExprId> for Arena {
    fn index_mut(&mut self, id: ExprId) -> &mut Self::Output {
        &mut self.exprs[id.0 as usize]
    }
}
