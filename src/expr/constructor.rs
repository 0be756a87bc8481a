//! `new Foo(...)` and `new T[] {...}`.

use super::Builder;
use super::node::Tail;
use super::operator::{Outcome, build_operation};
use crate::ast::ExprKind;
use crate::instruction::{Constant, InvokeKind, Opcode};
use crate::types::{DescriptorError, SimpleType, Type, parse_method_descriptor};

impl Builder<'_> {
    /// Fuses `new C; dup; <args>; invokespecial C.<init>` into a constructor call.
    pub(super) fn fuse_constructor(
        &mut self,
        address: u32,
    ) -> Result<Option<u32>, DescriptorError> {
        let node = &self.nodes[&address];
        let Tail::Op(invoke) = &node.tail else {
            return Ok(None);
        };
        let Opcode::Invoke {
            kind: InvokeKind::Special,
            method,
        } = invoke
        else {
            return Ok(None);
        };
        if !method.is_constructor() || !node.stmts.is_empty() {
            return Ok(None);
        }
        let invoke = invoke.clone();
        let arity = parse_method_descriptor(&method.descriptor, self.ctx.hierarchy)?
            .parameters
            .len();

        let Some(arguments) = self.operands(address, arity) else {
            return Ok(None);
        };
        if arguments.lvalue.is_some() || (arity > 0 && !arguments.stmts.is_empty()) {
            return Ok(None);
        }
        let Some(dup) = self.fusable_predecessor(arguments.first) else {
            return Ok(None);
        };
        if !self.dup_at(dup, 1, 0) {
            return Ok(None);
        }
        let Some(allocation) = self.fusable_predecessor(dup) else {
            return Ok(None);
        };
        let Tail::Value(object) = self.nodes[&allocation].tail else {
            return Ok(None);
        };
        let ExprKind::New { class } = &self.arena[object].kind else {
            return Ok(None);
        };
        let ty = Type::simple(SimpleType::class(class, self.ctx.hierarchy));

        let mut operands = vec![object];
        operands.extend(arguments.values);
        let Outcome::Stmt(construct) = build_operation(self.ctx, self.arena, &invoke, &operands)?
        else {
            unreachable!("constructor calls on fresh objects are statements");
        };
        let expr = &mut self.arena[construct];
        expr.void = false;
        expr.ty = ty;

        let stmts = self.nodes[&allocation].stmts.clone();
        Ok(Some(self.collapse(
            allocation,
            address,
            stmts,
            Tail::Value(construct),
        )))
    }

    /// Fuses `<array>; dup; <index>; <value>; xastore` into an array initializer, as long as the
    /// indices go up one by one from zero.
    pub(super) fn fuse_array_initializer(&mut self, address: u32) -> Option<u32> {
        let node = &self.nodes[&address];
        if !matches!(node.tail, Tail::Op(Opcode::ArrayStore(_))) || !node.stmts.is_empty() {
            return None;
        }

        let value_at = self.fusable_predecessor(address)?;
        let value = self.nodes[&value_at].pure_value()?;
        let index_at = self.fusable_predecessor(value_at)?;
        let index = self.nodes[&index_at].pure_value()?;
        let ExprKind::Const(Constant::Int(index)) = self.arena[index].kind else {
            return None;
        };
        let dup = self.fusable_predecessor(index_at)?;
        if !self.dup_at(dup, 1, 0) {
            return None;
        }
        let array_at = self.fusable_predecessor(dup)?;
        let Tail::Value(array) = self.nodes[&array_at].tail else {
            return None;
        };

        let (element_type, fresh_length) = match &self.arena[array].kind {
            ExprKind::NewArray { element, lengths } if index == 0 => {
                let [length] = lengths[..] else {
                    return None;
                };
                let ExprKind::Const(Constant::Int(length @ 1..)) = self.arena[length].kind else {
                    return None;
                };
                (element.clone(), Some(length as usize))
            }
            ExprKind::ArrayInitializer {
                element,
                length,
                elements,
            } if usize::try_from(index)
                .is_ok_and(|index| index == elements.len() && index < *length) =>
            {
                (element.clone(), None)
            }
            _ => return None,
        };
        if let Some(length) = fresh_length {
            self.arena[array].kind = ExprKind::ArrayInitializer {
                element: element_type.clone(),
                length,
                elements: Vec::new(),
            };
        }

        let narrowed = self.arena[value]
            .ty
            .intersect(&Type::subtypes_of(element_type), self.ctx.hierarchy);
        if !narrowed.is_error() && self.arena.is_trivial(value) {
            self.arena[value].ty = narrowed;
        }
        if let ExprKind::ArrayInitializer { elements, .. } = &mut self.arena[array].kind {
            elements.push(value);
        }

        let stmts = self.nodes[&array_at].stmts.clone();
        Some(self.collapse(array_at, address, stmts, Tail::Value(array)))
    }
}
