//! Local algebraic rewrites that make expressions read like source code.
//!
//! None of these change semantics. They run after types have been inferred, since several of them
//! depend on whether a value is a `boolean`.

use super::{Arena, BinOp, ExprId, ExprKind, UnaryOp};
use crate::instruction::{CompareOp, Constant, InvokeKind};
use crate::types::{ClassHierarchy, STRING, SimpleType, Type};

const STRING_BUILDERS: [&str; 2] = ["java/lang/StringBuilder", "java/lang/StringBuffer"];

// Missing elements of an array initializer are spelled out only up to this many.
const MAX_PADDING: usize = 16;

/// Returns the logical negation of a condition.
///
/// The condition is rewritten in place where possible, so `cond` must not be used afterwards.
pub fn negate(arena: &mut Arena, cond: ExprId) -> ExprId {
    match arena[cond].kind {
        ExprKind::Unary {
            op: UnaryOp::Not,
            operand,
        } => operand,
        ExprKind::Logical { op, lhs, rhs } => {
            let lhs = negate(arena, lhs);
            let rhs = negate(arena, rhs);
            arena[cond].kind = ExprKind::Logical {
                op: op.flip(),
                lhs,
                rhs,
            };
            cond
        }
        // `!(a < b)` is not `a >= b` if either side may be NaN.
        ExprKind::Binary {
            op: BinOp::Cond(op),
            lhs,
            rhs,
        } if matches!(op, CompareOp::Eq | CompareOp::Ne) || !is_floating(arena, lhs) => {
            arena[cond].kind = ExprKind::Binary {
                op: BinOp::Cond(op.negate()),
                lhs,
                rhs,
            };
            cond
        }
        ExprKind::Const(Constant::Int(value @ (0 | 1))) => {
            arena[cond].kind = ExprKind::Const(Constant::Int(1 - value));
            cond
        }
        _ => not(arena, cond),
    }
}

fn not(arena: &mut Arena, operand: ExprId) -> ExprId {
    arena.add(
        ExprKind::Unary {
            op: UnaryOp::Not,
            operand,
        },
        Type::simple(SimpleType::Boolean),
    )
}

fn is_floating(arena: &Arena, id: ExprId) -> bool {
    matches!(
        arena[id].ty.hint(),
        SimpleType::Float | SimpleType::Double
    )
}

fn bool_constant(arena: &Arena, id: ExprId) -> Option<bool> {
    match arena[id].kind {
        ExprKind::Const(Constant::Int(value @ (0 | 1))) => Some(value == 1),
        _ => None,
    }
}

/// Simplifies the tree rooted at `id` bottom-up, keeping `id` as the root.
pub fn simplify(arena: &mut Arena, id: ExprId, hierarchy: &dyn ClassHierarchy) {
    let children: Vec<ExprId> = arena[id].subexprs().collect();
    for child in children {
        simplify(arena, child, hierarchy);
    }

    if arena[id].void
        && let ExprKind::IncDec { prefix, .. } = &mut arena[id].kind
    {
        *prefix = false;
    }

    let rewritten = match arena[id].kind {
        // `flag == false` and the like
        ExprKind::Binary {
            op: BinOp::Cond(op @ (CompareOp::Eq | CompareOp::Ne)),
            lhs,
            rhs,
        } => {
            let (value, constant) = if bool_constant(arena, rhs).is_some() {
                (lhs, rhs)
            } else {
                (rhs, lhs)
            };
            match bool_constant(arena, constant) {
                Some(constant) if arena[value].ty.hint() == SimpleType::Boolean => {
                    if constant == (op == CompareOp::Eq) {
                        Some(value)
                    } else {
                        Some(negate(arena, value))
                    }
                }
                _ => None,
            }
        }
        ExprKind::Unary {
            op: UnaryOp::Not,
            operand,
        } => match arena[operand].kind {
            ExprKind::Unary {
                op: UnaryOp::Not, ..
            }
            | ExprKind::Logical { .. }
            | ExprKind::Const(_) => Some(negate(arena, operand)),
            ExprKind::Binary {
                op: BinOp::Cond(op),
                lhs,
                ..
            } if matches!(op, CompareOp::Eq | CompareOp::Ne) || !is_floating(arena, lhs) => {
                Some(negate(arena, operand))
            }
            _ => None,
        },
        // `c ? 1 : 0` where the result is a boolean
        ExprKind::Ternary {
            condition,
            branches: [if_true, if_false],
        } if arena[id].ty.admits_boolean(hierarchy) => {
            match (bool_constant(arena, if_true), bool_constant(arena, if_false)) {
                (Some(true), Some(false)) => Some(condition),
                (Some(false), Some(true)) => Some(negate(arena, condition)),
                _ => None,
            }
        }
        ExprKind::Call { .. } => string_concatenation(arena, id, hierarchy),
        _ => None,
    };

    if let Some(rewritten) = rewritten {
        let void = arena[id].void;
        let ty = arena[id].ty.clone();
        arena.replace(id, rewritten);
        arena[id].void = void;
        if arena[id].ty.is_unknown() {
            arena[id].ty = ty;
        }
    }

    pad_array_initializer(arena, id);
}

// `new StringBuilder().append(a).append(b).toString()` to `a + b`.
fn string_concatenation(
    arena: &mut Arena,
    id: ExprId,
    hierarchy: &dyn ClassHierarchy,
) -> Option<ExprId> {
    let ExprKind::Call {
        kind: InvokeKind::Virtual,
        method,
        object: Some(object),
        arguments,
    } = &arena[id].kind
    else {
        return None;
    };
    let mut object = *object;
    if method.name != "toString"
        || !arguments.is_empty()
        || !STRING_BUILDERS.contains(&method.class.as_str())
    {
        return None;
    }

    let mut parts = Vec::new();
    loop {
        match &arena[object].kind {
            ExprKind::Call {
                kind: InvokeKind::Virtual,
                method,
                object: Some(inner),
                arguments,
            } if method.name == "append"
                && STRING_BUILDERS.contains(&method.class.as_str())
                && arguments.len() == 1 =>
            {
                parts.push(arguments[0]);
                object = *inner;
            }
            ExprKind::Construct {
                class,
                descriptor,
                arguments,
            } if STRING_BUILDERS.contains(&class.as_str()) => {
                match (descriptor.as_str(), &arguments[..]) {
                    ("()V", []) => {}
                    ("(Ljava/lang/String;)V" | "(Ljava/lang/CharSequence;)V", [initial]) => {
                        // `new StringBuilder(String.valueOf(x))` is how `x + ...` starts when `x`
                        // is not a string.
                        let initial = match &arena[*initial].kind {
                            ExprKind::Call {
                                kind: InvokeKind::Static,
                                method,
                                object: None,
                                arguments,
                            } if method.class == STRING
                                && method.name == "valueOf"
                                && arguments.len() == 1 =>
                            {
                                arguments[0]
                            }
                            _ => *initial,
                        };
                        parts.push(initial);
                    }
                    _ => return None,
                }
                break;
            }
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    parts.reverse();

    let string = SimpleType::class(STRING, hierarchy);
    let is_string = |arena: &Arena, part: &ExprId| arena[*part].ty.hint() == string;
    if !parts.iter().take(2).any(|part| is_string(arena, part)) {
        let empty = arena.add(
            ExprKind::Const(Constant::String(String::new())),
            Type::simple(string.clone()),
        );
        parts.insert(0, empty);
    }
    Some(arena.add(ExprKind::StringConcat { parts }, Type::simple(string)))
}

fn default_constant(element: &SimpleType) -> Option<Constant> {
    Some(match element {
        SimpleType::Long => Constant::Long(0),
        SimpleType::Float => Constant::Float(0.0),
        SimpleType::Double => Constant::Double(0.0),
        element if element.is_integral() => Constant::Int(0),
        element if element.is_reference() => Constant::Null,
        _ => return None,
    })
}

// `new int[3] {1}` is not valid source, `new int[] {1, 0, 0}` is.
fn pad_array_initializer(arena: &mut Arena, id: ExprId) {
    let ExprKind::ArrayInitializer {
        element,
        length,
        elements,
    } = &arena[id].kind
    else {
        return;
    };
    let missing = length.saturating_sub(elements.len());
    if missing == 0 || missing > MAX_PADDING {
        return;
    }
    let Some(constant) = default_constant(element) else {
        return;
    };
    let ty = Type::simple(element.clone());

    let padding: Vec<ExprId> = (0..missing)
        .map(|_| arena.add(ExprKind::Const(constant.clone()), ty.clone()))
        .collect();
    if let ExprKind::ArrayInitializer { elements, .. } = &mut arena[id].kind {
        elements.extend(padding);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::LogicalOp;
    use crate::instruction::MemberRef;
    use crate::locals::LocalId;
    use crate::types::BasicHierarchy;

    fn local(arena: &mut Arena, id: u32, ty: SimpleType) -> ExprId {
        arena.add(ExprKind::Local(LocalId(id)), Type::simple(ty))
    }

    fn compare(arena: &mut Arena, op: CompareOp, lhs: ExprId, rhs: ExprId) -> ExprId {
        arena.add(
            ExprKind::Binary {
                op: BinOp::Cond(op),
                lhs,
                rhs,
            },
            Type::simple(SimpleType::Boolean),
        )
    }

    #[test]
    fn negation_follows_de_morgan() {
        let mut arena = Arena::new();
        let a = local(&mut arena, 0, SimpleType::Int);
        let b = local(&mut arena, 1, SimpleType::Int);
        let lt = compare(&mut arena, CompareOp::Lt, a, b);
        let flag = local(&mut arena, 2, SimpleType::Boolean);
        let both = arena.add(
            ExprKind::Logical {
                op: LogicalOp::And,
                lhs: lt,
                rhs: flag,
            },
            Type::simple(SimpleType::Boolean),
        );
        let negated = negate(&mut arena, both);
        assert_eq!(arena.debug(&negated).to_string(), "((v0 >= v1) || !v2)");
        let again = negate(&mut arena, negated);
        assert_eq!(arena.debug(&again).to_string(), "((v0 < v1) && v2)");
    }

    #[test]
    fn float_ordering_is_not_flipped() {
        let mut arena = Arena::new();
        let a = local(&mut arena, 0, SimpleType::Double);
        let b = local(&mut arena, 1, SimpleType::Double);
        let gt = compare(&mut arena, CompareOp::Gt, a, b);
        let negated = negate(&mut arena, gt);
        assert_eq!(arena.debug(&negated).to_string(), "!(v0 > v1)");

        let c = local(&mut arena, 2, SimpleType::Float);
        let d = local(&mut arena, 3, SimpleType::Float);
        let eq = compare(&mut arena, CompareOp::Eq, c, d);
        let negated = negate(&mut arena, eq);
        assert_eq!(arena.debug(&negated).to_string(), "(v2 != v3)");
    }

    #[test]
    fn boolean_ternaries_and_comparisons() {
        let h = BasicHierarchy::new();
        let mut arena = Arena::new();
        let a = local(&mut arena, 0, SimpleType::Int);
        let b = local(&mut arena, 1, SimpleType::Int);
        let cond = compare(&mut arena, CompareOp::Le, a, b);
        let zero = arena.int(0);
        let one = arena.int(1);
        let ternary = arena.add(
            ExprKind::Ternary {
                condition: cond,
                branches: [zero, one],
            },
            Type::simple(SimpleType::Boolean),
        );
        simplify(&mut arena, ternary, &h);
        assert_eq!(arena.debug(&ternary).to_string(), "(v0 > v1)");

        let flag = local(&mut arena, 2, SimpleType::Boolean);
        let zero = arena.int(0);
        let is_false = compare(&mut arena, CompareOp::Eq, flag, zero);
        simplify(&mut arena, is_false, &h);
        assert_eq!(arena.debug(&is_false).to_string(), "!v2");

        // Ints stay comparisons.
        let zero = arena.int(0);
        let c = local(&mut arena, 3, SimpleType::Int);
        let is_zero = compare(&mut arena, CompareOp::Eq, c, zero);
        simplify(&mut arena, is_zero, &h);
        assert_eq!(arena.debug(&is_zero).to_string(), "(v3 == 0)");
    }

    #[test]
    fn string_builder_chains() {
        let h = BasicHierarchy::new();
        let mut arena = Arena::new();
        let builder = "java/lang/StringBuilder";
        let mut chain = arena.add(
            ExprKind::Construct {
                class: builder.to_string(),
                descriptor: "()V".to_string(),
                arguments: Vec::new(),
            },
            Type::simple(SimpleType::class(builder, &h)),
        );
        let count = local(&mut arena, 0, SimpleType::Int);
        let letter = local(&mut arena, 1, SimpleType::Char);
        for (part, descriptor) in [
            (count, "(I)Ljava/lang/StringBuilder;"),
            (letter, "(C)Ljava/lang/StringBuilder;"),
        ] {
            chain = arena.add(
                ExprKind::Call {
                    kind: InvokeKind::Virtual,
                    method: MemberRef::new(builder, "append", descriptor),
                    object: Some(chain),
                    arguments: vec![part],
                },
                Type::simple(SimpleType::class(builder, &h)),
            );
        }
        let result = arena.add(
            ExprKind::Call {
                kind: InvokeKind::Virtual,
                method: MemberRef::new(builder, "toString", "()Ljava/lang/String;"),
                object: Some(chain),
                arguments: Vec::new(),
            },
            Type::supertypes_of(SimpleType::class(STRING, &h)),
        );
        simplify(&mut arena, result, &h);
        // Without the leading empty string, `count + letter` would be an addition.
        assert_eq!(arena.debug(&result).to_string(), "(\"\" + v0 + v1)");
    }

    #[test]
    fn initializers_are_padded() {
        let h = BasicHierarchy::new();
        let mut arena = Arena::new();
        let seven = arena.int(7);
        let array = arena.add(
            ExprKind::ArrayInitializer {
                element: SimpleType::Int,
                length: 3,
                elements: vec![seven],
            },
            Type::simple(SimpleType::array(SimpleType::Int)),
        );
        simplify(&mut arena, array, &h);
        assert_eq!(arena.debug(&array).to_string(), "new int[] {7, 0, 0}");

        let lhs = local(&mut arena, 0, SimpleType::Int);
        let increment = arena.add(
            ExprKind::IncDec {
                target: lhs,
                increment: true,
                prefix: true,
            },
            Type::simple(SimpleType::Int),
        );
        arena[increment].void = true;
        simplify(&mut arena, increment, &h);
        assert_eq!(arena.debug(&increment).to_string(), "v0++");
    }
}
