use super::{ExprId, ExprKind, Expression};

// This iterates only over direct subexpressions, not recursively. The subexpressions are yielded in
// evaluation order, so that dataflow passes can walk them front to back.
//
// Every node has at most one lone child followed by a list of children, which lets both iterators
// share a single concrete return type regardless of the node kind.

impl Expression {
    pub fn subexprs(&self) -> impl DoubleEndedIterator<Item = ExprId> + '_ {
        let (a, b): (Option<ExprId>, &[ExprId]) = match &self.kind {
            ExprKind::ArrayLength { array: expr }
            | ExprKind::InstanceOf { object: expr, .. }
            | ExprKind::CheckCast { object: expr, .. }
            | ExprKind::Convert { value: expr, .. }
            | ExprKind::Unary { operand: expr, .. }
            | ExprKind::IncDec { target: expr, .. }
            | ExprKind::MonitorEnter { object: expr }
            | ExprKind::MonitorExit { object: expr } => (Some(*expr), &[]),

            ExprKind::ArrayElement { array: a, index: b }
            | ExprKind::Binary { lhs: a, rhs: b, .. }
            | ExprKind::Logical { lhs: a, rhs: b, .. }
            | ExprKind::Assign {
                target: a,
                value: b,
            }
            | ExprKind::OpAssign {
                target: a,
                value: b,
                ..
            } => (Some(*a), core::slice::from_ref(b)),

            ExprKind::Ternary {
                condition,
                branches,
            } => (Some(*condition), branches),

            ExprKind::Field { object, .. } => (*object, &[]),

            ExprKind::Call {
                object, arguments, ..
            } => (*object, arguments),

            ExprKind::NewArray { lengths: list, .. }
            | ExprKind::ArrayInitializer { elements: list, .. }
            | ExprKind::Construct {
                arguments: list, ..
            }
            | ExprKind::Dynamic {
                arguments: list, ..
            }
            | ExprKind::StringConcat { parts: list } => (None, list),

            ExprKind::Slot(_) | ExprKind::Local(_) | ExprKind::Const(_) | ExprKind::New { .. } => {
                (None, &[])
            }
        };

        a.into_iter().chain(b.iter().copied())
    }

    pub fn subexprs_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut ExprId> {
        let (a, b): (Option<&mut ExprId>, &mut [ExprId]) = match &mut self.kind {
            ExprKind::ArrayLength { array: expr }
            | ExprKind::InstanceOf { object: expr, .. }
            | ExprKind::CheckCast { object: expr, .. }
            | ExprKind::Convert { value: expr, .. }
            | ExprKind::Unary { operand: expr, .. }
            | ExprKind::IncDec { target: expr, .. }
            | ExprKind::MonitorEnter { object: expr }
            | ExprKind::MonitorExit { object: expr } => (Some(expr), &mut []),

            ExprKind::ArrayElement { array: a, index: b }
            | ExprKind::Binary { lhs: a, rhs: b, .. }
            | ExprKind::Logical { lhs: a, rhs: b, .. }
            | ExprKind::Assign {
                target: a,
                value: b,
            }
            | ExprKind::OpAssign {
                target: a,
                value: b,
                ..
            } => (Some(a), core::slice::from_mut(b)),

            ExprKind::Ternary {
                condition,
                branches,
            } => (Some(condition), branches),

            ExprKind::Field { object, .. } => (object.as_mut(), &mut []),

            ExprKind::Call {
                object, arguments, ..
            } => (object.as_mut(), arguments),

            ExprKind::NewArray { lengths: list, .. }
            | ExprKind::ArrayInitializer { elements: list, .. }
            | ExprKind::Construct {
                arguments: list, ..
            }
            | ExprKind::Dynamic {
                arguments: list, ..
            }
            | ExprKind::StringConcat { parts: list } => (None, list),

            ExprKind::Slot(_) | ExprKind::Local(_) | ExprKind::Const(_) | ExprKind::New { .. } => {
                (None, &mut [])
            }
        };

        a.into_iter().chain(b.iter_mut())
    }
}
