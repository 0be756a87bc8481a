//! Expressions for single instructions whose operands are known.
//!
//! This is shared between fusion, where operands are the expressions computed by previous
//! instructions, and stack promotion, where they are reads of synthetic stack variables.

use super::condition::jump_condition;
use super::node::Tail;
use crate::MethodContext;
use crate::ast::{Arena, BinOp, ExprId, ExprKind, Expression, UnaryOp};
use crate::instruction::{ArithOp, ArrayKind, Constant, InvokeKind, NumKind, Opcode};
use crate::locals::SlotKey;
use crate::types::{
    DescriptorError, STRING, SimpleType, THROWABLE, Type, parse_class_operand,
    parse_field_descriptor, parse_method_descriptor,
};

/// What an instruction turned into.
#[derive(Debug)]
pub enum Outcome {
    /// No effect besides passing control on.
    Nothing,
    Value(ExprId),
    Stmt(ExprId),
    /// Side effects of discarded values.
    Stmts(Vec<ExprId>),
    Tail(Tail),
}

/// The type of a value read from a location declared as `ty`.
pub fn declared(ty: SimpleType) -> Type {
    if ty.is_reference() {
        Type::supertypes_of(ty)
    } else {
        Type::simple(ty)
    }
}

/// Narrows the type of a leaf operand to what its consumer accepts.
///
/// Only leaves are narrowed: the type of a compound expression is determined by its operator.
pub fn expect(ctx: &MethodContext<'_>, arena: &mut Arena, id: ExprId, ty: &Type) {
    if !matches!(
        arena[id].kind,
        ExprKind::Slot(_) | ExprKind::Local(_) | ExprKind::Const(_)
    ) {
        return;
    }
    let narrowed = arena[id].ty.intersect(ty, ctx.hierarchy);
    if !narrowed.is_error() {
        arena[id].ty = narrowed;
    }
}

pub fn statement(arena: &mut Arena, kind: ExprKind) -> ExprId {
    let mut expr = Expression::new(kind, Type::VOID);
    expr.void = true;
    arena.alloc(expr)
}

pub fn assign(arena: &mut Arena, target: ExprId, value: ExprId) -> ExprId {
    statement(arena, ExprKind::Assign { target, value })
}

/// Collects the parts of a discarded value that have to be evaluated anyway.
pub fn side_effects(arena: &mut Arena, id: ExprId, out: &mut Vec<ExprId>) {
    if arena.is_pure(id) {
        return;
    }
    match arena[id].kind {
        ExprKind::Call { .. }
        | ExprKind::Dynamic { .. }
        | ExprKind::Construct { .. }
        | ExprKind::Assign { .. }
        | ExprKind::OpAssign { .. }
        | ExprKind::IncDec { .. }
        | ExprKind::Ternary { .. }
        | ExprKind::Logical { .. }
        | ExprKind::MonitorEnter { .. }
        | ExprKind::MonitorExit { .. } => {
            arena[id].void = true;
            out.push(id);
        }
        _ => {
            let children: Vec<ExprId> = arena[id].subexprs().collect();
            for child in children {
                side_effects(arena, child, out);
            }
        }
    }
}

pub fn constant_type(
    ctx: &MethodContext<'_>,
    constant: &Constant,
) -> Result<Type, DescriptorError> {
    let class = |name: &str| Type::simple(SimpleType::class(name, ctx.hierarchy));
    Ok(match constant {
        Constant::Null => Type::null(),
        Constant::Int(value) => Type::int_constant(*value),
        Constant::Long(_) => Type::simple(SimpleType::Long),
        Constant::Float(_) => Type::simple(SimpleType::Float),
        Constant::Double(_) => Type::simple(SimpleType::Double),
        Constant::String(_) => class(STRING),
        Constant::Class(_) => class("java/lang/Class"),
        Constant::MethodType(_) => class("java/lang/invoke/MethodType"),
        Constant::MethodHandle(_) => class("java/lang/invoke/MethodHandle"),
        Constant::Dynamic { descriptor, .. } => {
            declared(parse_field_descriptor(descriptor, ctx.hierarchy)?)
        }
    })
}

fn element_type(kind: ArrayKind, arena: &Arena, array: ExprId) -> Type {
    match kind.element() {
        Some(SimpleType::BoolByte) => Type::subtypes_of(SimpleType::BoolByte),
        Some(element) => Type::simple(element),
        None => match arena[array].ty.hint() {
            SimpleType::Array(element) => declared(*element),
            _ => Type::any_reference(),
        },
    }
}

fn array_operands(
    ctx: &MethodContext<'_>,
    arena: &mut Arena,
    kind: ArrayKind,
    array: ExprId,
    index: ExprId,
) -> ExprId {
    expect(ctx, arena, index, &Type::subtypes_of(SimpleType::Int));
    if let Some(element) = kind.element()
        && element != SimpleType::BoolByte
    {
        expect(ctx, arena, array, &Type::subtypes_of(SimpleType::array(element)));
    }
    let ty = element_type(kind, arena, array);
    arena.add(ExprKind::ArrayElement { array, index }, ty)
}

fn num_operand(op: ArithOp, kind: NumKind) -> Type {
    match (kind, op) {
        (NumKind::Int, ArithOp::And | ArithOp::Or | ArithOp::Xor) => Type::int_slot(),
        _ => Type::subtypes_of(kind.simple()),
    }
}

/// Builds the expression for `opcode` applied to `operands`, bottom of the stack first.
///
/// The caller provides exactly as many operands as the instruction pops. Shuffles are not
/// handled here.
pub fn build_operation(
    ctx: &MethodContext<'_>,
    arena: &mut Arena,
    opcode: &Opcode,
    operands: &[ExprId],
) -> Result<Outcome, DescriptorError> {
    let h = ctx.hierarchy;
    let value = |arena: &mut Arena, kind, ty| Outcome::Value(arena.add(kind, ty));

    Ok(match opcode {
        Opcode::Nop => Outcome::Nothing,
        Opcode::Goto { .. } => Outcome::Tail(Tail::Jump),

        Opcode::Const(constant) => {
            let ty = constant_type(ctx, constant)?;
            value(arena, ExprKind::Const(constant.clone()), ty)
        }

        Opcode::Load { kind, slot } => {
            value(arena, ExprKind::Slot(SlotKey::Slot(*slot)), kind.ty())
        }

        Opcode::Store { kind, slot } => {
            let [stored] = operands[..] else {
                panic!("store takes one operand");
            };
            let ty = kind.ty().intersect_or_widen(&arena[stored].ty, h);
            let target = arena.add(ExprKind::Slot(SlotKey::Slot(*slot)), ty);
            Outcome::Stmt(assign(arena, target, stored))
        }

        Opcode::Increment { slot, delta } => {
            let target = arena.add(ExprKind::Slot(SlotKey::Slot(*slot)), Type::int_slot());
            let kind = match *delta {
                1 | -1 => ExprKind::IncDec {
                    target,
                    increment: *delta == 1,
                    prefix: false,
                },
                delta if delta < 0 && delta != i32::MIN => ExprKind::OpAssign {
                    op: ArithOp::Sub,
                    target,
                    value: arena.int(-delta),
                },
                delta => ExprKind::OpAssign {
                    op: ArithOp::Add,
                    target,
                    value: arena.int(delta),
                },
            };
            Outcome::Stmt(statement(arena, kind))
        }

        Opcode::ArrayLoad(kind) => {
            let [array, index] = operands[..] else {
                panic!("array load takes two operands");
            };
            Outcome::Value(array_operands(ctx, arena, *kind, array, index))
        }

        Opcode::ArrayStore(kind) => {
            let [array, index, stored] = operands[..] else {
                panic!("array store takes three operands");
            };
            let target = array_operands(ctx, arena, *kind, array, index);
            if let Some(element) = kind.element() {
                expect(ctx, arena, stored, &Type::subtypes_of(element));
            }
            Outcome::Stmt(assign(arena, target, stored))
        }

        Opcode::Arith { op, kind } => {
            let [lhs, rhs] = operands[..] else {
                panic!("arithmetic takes two operands");
            };
            let operand = num_operand(*op, *kind);
            expect(ctx, arena, lhs, &operand);
            if matches!(op, ArithOp::Shl | ArithOp::Shr | ArithOp::Ushr) {
                expect(ctx, arena, rhs, &Type::subtypes_of(SimpleType::Int));
            } else {
                expect(ctx, arena, rhs, &operand);
            }
            let ty = match operand.bottom() {
                SimpleType::BoolInt => Type::int_slot(),
                _ => Type::simple(kind.simple()),
            };
            let kind = ExprKind::Binary {
                op: BinOp::Arith(*op),
                lhs,
                rhs,
            };
            value(arena, kind, ty)
        }

        Opcode::Neg(kind) => {
            let [operand] = operands[..] else {
                panic!("negation takes one operand");
            };
            expect(ctx, arena, operand, &Type::subtypes_of(kind.simple()));
            let expr = ExprKind::Unary {
                op: UnaryOp::Neg,
                operand,
            };
            value(arena, expr, Type::simple(kind.simple()))
        }

        Opcode::Convert { from, to } => {
            let [converted] = operands[..] else {
                panic!("conversion takes one operand");
            };
            expect(ctx, arena, converted, &Type::subtypes_of(from.simple()));
            let expr = ExprKind::Convert {
                value: converted,
                to: *to,
            };
            value(arena, expr, Type::simple(to.simple()))
        }

        Opcode::Compare(kind) => {
            let [lhs, rhs] = operands[..] else {
                panic!("comparison takes two operands");
            };
            for operand in [lhs, rhs] {
                expect(ctx, arena, operand, &Type::simple(kind.operand()));
            }
            let expr = ExprKind::Binary {
                op: BinOp::Compare(*kind),
                lhs,
                rhs,
            };
            value(arena, expr, Type::simple(SimpleType::Int))
        }

        Opcode::If { op, operands: kind, .. } => {
            Outcome::Tail(Tail::If(jump_condition(arena, *op, *kind, operands)))
        }

        Opcode::Switch { cases, default } => {
            let [selector] = operands[..] else {
                panic!("switch takes one operand");
            };
            expect(ctx, arena, selector, &Type::subtypes_of(SimpleType::Int));
            Outcome::Tail(Tail::Switch {
                selector,
                cases: cases.clone(),
                default: *default,
            })
        }

        Opcode::Return(_) => {
            let returned = operands.first().copied();
            if let Some(returned) = returned {
                expect(ctx, arena, returned, &Type::subtypes_of(ctx.return_type.clone()));
            }
            Outcome::Tail(Tail::Return(returned))
        }

        Opcode::Throw => {
            let [thrown] = operands[..] else {
                panic!("athrow takes one operand");
            };
            let throwable = SimpleType::class(THROWABLE, h);
            expect(ctx, arena, thrown, &Type::subtypes_of(throwable));
            Outcome::Tail(Tail::Throw(thrown))
        }

        Opcode::GetField { field, is_static } => {
            let ty = parse_field_descriptor(&field.descriptor, h)?;
            let object = (!is_static).then(|| operands[0]);
            if let Some(object) = object {
                let class = parse_class_operand(&field.class, h)?;
                expect(ctx, arena, object, &Type::subtypes_of(class));
            }
            let expr = ExprKind::Field {
                object,
                field: field.clone(),
            };
            value(arena, expr, declared(ty))
        }

        Opcode::PutField { field, is_static } => {
            let ty = parse_field_descriptor(&field.descriptor, h)?;
            let (object, stored) = match operands {
                [stored] if *is_static => (None, *stored),
                [object, stored] => (Some(*object), *stored),
                _ => panic!("putfield takes one or two operands"),
            };
            if let Some(object) = object {
                let class = parse_class_operand(&field.class, h)?;
                expect(ctx, arena, object, &Type::subtypes_of(class));
            }
            expect(ctx, arena, stored, &Type::subtypes_of(ty.clone()));
            let target = arena.add(
                ExprKind::Field {
                    object,
                    field: field.clone(),
                },
                Type::simple(ty),
            );
            Outcome::Stmt(assign(arena, target, stored))
        }

        Opcode::Invoke { kind, method } => {
            let types = parse_method_descriptor(&method.descriptor, h)?;
            let (object, arguments) = match kind {
                InvokeKind::Static => (None, operands),
                _ => (Some(operands[0]), &operands[1..]),
            };
            for (&argument, ty) in arguments.iter().zip(&types.parameters) {
                expect(ctx, arena, argument, &Type::subtypes_of(ty.clone()));
            }

            // `new Foo()` whose result is never used
            if let Some(object) = object
                && method.is_constructor()
                && let ExprKind::New { class } = &arena[object].kind
            {
                let class = class.clone();
                let expr = ExprKind::Construct {
                    class,
                    descriptor: method.descriptor.clone(),
                    arguments: arguments.to_vec(),
                };
                return Ok(Outcome::Stmt(statement(arena, expr)));
            }

            if let Some(object) = object {
                let class = parse_class_operand(&method.class, h)?;
                expect(ctx, arena, object, &Type::subtypes_of(class));
            }
            let expr = ExprKind::Call {
                kind: *kind,
                method: method.clone(),
                object,
                arguments: arguments.to_vec(),
            };
            if types.return_type == SimpleType::Void {
                Outcome::Stmt(statement(arena, expr))
            } else {
                value(arena, expr, declared(types.return_type))
            }
        }

        Opcode::InvokeDynamic {
            name,
            descriptor,
            bootstrap,
        } => {
            let types = parse_method_descriptor(descriptor, h)?;
            for (&argument, ty) in operands.iter().zip(&types.parameters) {
                expect(ctx, arena, argument, &Type::subtypes_of(ty.clone()));
            }
            let expr = ExprKind::Dynamic {
                name: name.clone(),
                descriptor: descriptor.clone(),
                bootstrap: *bootstrap,
                arguments: operands.to_vec(),
            };
            if types.return_type == SimpleType::Void {
                Outcome::Stmt(statement(arena, expr))
            } else {
                value(arena, expr, declared(types.return_type))
            }
        }

        Opcode::New { class } => {
            let ty = Type::simple(SimpleType::class(class, h));
            value(arena, ExprKind::New { class: class.clone() }, ty)
        }

        Opcode::NewArray { element } => {
            let [length] = operands[..] else {
                panic!("newarray takes one operand");
            };
            let element = parse_field_descriptor(element, h)?;
            expect(ctx, arena, length, &Type::subtypes_of(SimpleType::Int));
            let ty = Type::simple(SimpleType::array(element.clone()));
            let expr = ExprKind::NewArray {
                element,
                lengths: vec![length],
            };
            value(arena, expr, ty)
        }

        Opcode::MultiNewArray { descriptor, .. } => {
            let array = parse_field_descriptor(descriptor, h)?;
            let mut element = array.clone();
            for _ in 0..operands.len() {
                element = match element {
                    SimpleType::Array(inner) => *inner,
                    _ => return Err(DescriptorError::UnexpectedEnd(descriptor.clone())),
                };
            }
            for &length in operands {
                expect(ctx, arena, length, &Type::subtypes_of(SimpleType::Int));
            }
            let expr = ExprKind::NewArray {
                element,
                lengths: operands.to_vec(),
            };
            value(arena, expr, Type::simple(array))
        }

        Opcode::ArrayLength => {
            let [array] = operands[..] else {
                panic!("arraylength takes one operand");
            };
            value(
                arena,
                ExprKind::ArrayLength { array },
                Type::simple(SimpleType::Int),
            )
        }

        Opcode::CheckCast { class } => {
            let [object] = operands[..] else {
                panic!("checkcast takes one operand");
            };
            let ty = parse_class_operand(class, h)?;
            let expr = ExprKind::CheckCast {
                object,
                class: class.clone(),
            };
            value(arena, expr, Type::supertypes_of(ty))
        }

        Opcode::InstanceOf { class } => {
            let [object] = operands[..] else {
                panic!("instanceof takes one operand");
            };
            parse_class_operand(class, h)?;
            let expr = ExprKind::InstanceOf {
                object,
                class: class.clone(),
            };
            value(arena, expr, Type::simple(SimpleType::Boolean))
        }

        Opcode::MonitorEnter | Opcode::MonitorExit => {
            let [object] = operands[..] else {
                panic!("monitor instructions take one operand");
            };
            let expr = if *opcode == Opcode::MonitorEnter {
                ExprKind::MonitorEnter { object }
            } else {
                ExprKind::MonitorExit { object }
            };
            Outcome::Stmt(statement(arena, expr))
        }

        Opcode::Pop
        | Opcode::Pop2
        | Opcode::Dup
        | Opcode::DupX1
        | Opcode::DupX2
        | Opcode::Dup2
        | Opcode::Dup2X1
        | Opcode::Dup2X2
        | Opcode::Swap => unreachable!("shuffles are resolved by the caller"),

        Opcode::Jsr { .. } | Opcode::Ret { .. } => {
            unreachable!("subroutines are rejected by the instruction graph")
        }
    })
}
