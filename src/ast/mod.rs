mod arena;
mod debug;
pub mod isomorphism;
mod iterate;
pub mod simplify;

pub use self::arena::{Arena, ExprId};
pub use self::debug::DebugIr;
use crate::instruction::{
    ArithOp, CompareKind, CompareOp, Constant, InvokeKind, MemberRef, PrimitiveKind,
};
use crate::locals::{LocalId, SlotKey};
use crate::types::{SimpleType, Type};
use core::fmt::{self, Display};
use displaydoc::Display;

/// An expression node together with its inferred type.
#[derive(Clone, Debug, PartialEq)]
pub struct Expression {
    pub kind: ExprKind,
    pub ty: Type,
    /// Whether the value is discarded, i.e. the expression is a statement.
    pub void: bool,
}

impl Expression {
    pub fn new(kind: ExprKind, ty: Type) -> Self {
        Self {
            kind,
            ty,
            void: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    /// A slot that hasn't been resolved to a logical variable yet.
    Slot(SlotKey),
    Local(LocalId),
    Const(Constant),
    Field {
        // `None` for static fields
        object: Option<ExprId>,
        field: MemberRef,
    },
    ArrayElement {
        array: ExprId,
        index: ExprId,
    },
    ArrayLength {
        array: ExprId,
    },
    NewArray {
        // The type of the innermost allocated dimension's elements.
        element: SimpleType,
        lengths: Vec<ExprId>,
    },
    ArrayInitializer {
        element: SimpleType,
        length: usize,
        elements: Vec<ExprId>,
    },
    /// An object that hasn't been initialized yet.
    New {
        class: String,
    },
    Construct {
        class: String,
        descriptor: String,
        arguments: Vec<ExprId>,
    },
    InstanceOf {
        object: ExprId,
        class: String,
    },
    CheckCast {
        object: ExprId,
        class: String,
    },
    Convert {
        value: ExprId,
        to: PrimitiveKind,
    },
    Binary {
        op: BinOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    Unary {
        op: UnaryOp,
        operand: ExprId,
    },
    Call {
        kind: InvokeKind,
        method: MemberRef,
        // `None` for static calls
        object: Option<ExprId>,
        arguments: Vec<ExprId>,
    },
    Dynamic {
        name: String,
        descriptor: String,
        bootstrap: u16,
        arguments: Vec<ExprId>,
    },
    Assign {
        target: ExprId,
        value: ExprId,
    },
    OpAssign {
        op: ArithOp,
        target: ExprId,
        value: ExprId,
    },
    IncDec {
        target: ExprId,
        increment: bool,
        prefix: bool,
    },
    Ternary {
        condition: ExprId,
        // Two elements rather than two fields, so that iteration can yield them as a slice.
        branches: [ExprId; 2], // [if_true, if_false]
    },
    Logical {
        op: LogicalOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    StringConcat {
        parts: Vec<ExprId>,
    },
    MonitorEnter {
        object: ExprId,
    },
    MonitorExit {
        object: ExprId,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Arith(ArithOp),
    /// Three-way comparison, as produced by `lcmp` and friends.
    Compare(CompareKind),
    Cond(CompareOp),
}

impl Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arith(op) => write!(f, "{op}"),
            Self::Compare(kind) => write!(f, "<=>{kind}"),
            Self::Cond(op) => write!(f, "{op}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// -
    Neg,
    /// !
    Not,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    /// &&
    And,
    /// ||
    Or,
}

impl LogicalOp {
    #[must_use]
    pub fn flip(self) -> Self {
        match self {
            Self::And => Self::Or,
            Self::Or => Self::And,
        }
    }
}

/// A label of a breakable construct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

fn class_name(name: &str) -> String {
    name.replace('/', ".")
}

fn write_list(f: &mut fmt::Formatter<'_>, arena: &Arena, items: &[ExprId]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", arena.debug(item))?;
    }
    Ok(())
}

impl DebugIr for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>, arena: &Arena) -> fmt::Result {
        match &self.kind {
            ExprKind::Slot(key) => write!(f, "{key}"),
            ExprKind::Local(id) => write!(f, "{id}"),
            ExprKind::Const(constant) => match constant {
                Constant::Int(value @ (0 | 1)) if self.ty.hint() == SimpleType::Boolean => {
                    write!(f, "{}", *value == 1)
                }
                Constant::Int(value)
                    if self.ty.hint() == SimpleType::Char && (32..127).contains(value) =>
                {
                    write!(f, "{:?}", char::from(*value as u8))
                }
                Constant::Null => write!(f, "null"),
                Constant::Int(value) => write!(f, "{value}"),
                Constant::Long(value) => write!(f, "{value}L"),
                Constant::Float(value) => write!(f, "{value:?}f"),
                Constant::Double(value) => write!(f, "{value:?}"),
                Constant::String(value) => write!(f, "{value:?}"),
                Constant::Class(name) => write!(f, "{}.class", class_name(name)),
                Constant::MethodType(descriptor) => write!(f, "MethodType({descriptor:?})"),
                Constant::MethodHandle(handle) => write!(f, "{handle}"),
                Constant::Dynamic { name, descriptor } => {
                    write!(f, "dynamic {name}:{descriptor}")
                }
            },
            ExprKind::Field { object, field } => {
                match object {
                    Some(object) => write!(f, "{}", arena.debug(object))?,
                    None => write!(f, "{}", class_name(&field.class))?,
                }
                write!(f, ".{}", field.name)
            }
            ExprKind::ArrayElement { array, index } => {
                write!(f, "{}[{}]", arena.debug(array), arena.debug(index))
            }
            ExprKind::ArrayLength { array } => write!(f, "{}.length", arena.debug(array)),
            ExprKind::NewArray { element, lengths } => {
                let mut base = element;
                let mut extra = 0;
                while let SimpleType::Array(inner) = base {
                    base = inner;
                    extra += 1;
                }
                write!(f, "new {base}")?;
                for length in lengths {
                    write!(f, "[{}]", arena.debug(length))?;
                }
                for _ in 0..extra {
                    write!(f, "[]")?;
                }
                Ok(())
            }
            ExprKind::ArrayInitializer {
                element,
                length,
                elements,
            } => {
                if *length == elements.len() {
                    write!(f, "new {element}[] {{")?;
                } else {
                    write!(f, "new {element}[{length}] {{")?;
                }
                write_list(f, arena, elements)?;
                write!(f, "}}")
            }
            ExprKind::New { class } => write!(f, "new uninitialized {}", class_name(class)),
            ExprKind::Construct {
                class, arguments, ..
            } => {
                write!(f, "new {}(", class_name(class))?;
                write_list(f, arena, arguments)?;
                write!(f, ")")
            }
            ExprKind::InstanceOf { object, class } => {
                write!(f, "({} instanceof {})", arena.debug(object), class_name(class))
            }
            ExprKind::CheckCast { object, class } => {
                write!(f, "(({}) {})", class_name(class), arena.debug(object))
            }
            ExprKind::Convert { value, to } => write!(f, "(({to}) {})", arena.debug(value)),
            ExprKind::Binary { op, lhs, rhs } => {
                write!(f, "({} {op} {})", arena.debug(lhs), arena.debug(rhs))
            }
            ExprKind::Unary { op, operand } => write!(f, "{op}{}", arena.debug(operand)),
            ExprKind::Call {
                kind,
                method,
                object,
                arguments,
            } => {
                match object {
                    Some(object) => write!(f, "{}.", arena.debug(object))?,
                    None => write!(f, "{}.", class_name(&method.class))?,
                }
                if *kind == InvokeKind::Special {
                    write!(f, "<special {}>", class_name(&method.class))?;
                }
                write!(f, "{}(", method.name)?;
                write_list(f, arena, arguments)?;
                write!(f, ")")
            }
            ExprKind::Dynamic {
                name,
                bootstrap,
                arguments,
                ..
            } => {
                write!(f, "<indy #{bootstrap}>{name}(")?;
                write_list(f, arena, arguments)?;
                write!(f, ")")
            }
            ExprKind::Assign { target, value } => {
                write!(f, "{} = {}", arena.debug(target), arena.debug(value))
            }
            ExprKind::OpAssign { op, target, value } => {
                write!(f, "{} {op}= {}", arena.debug(target), arena.debug(value))
            }
            ExprKind::IncDec {
                target,
                increment,
                prefix,
            } => {
                let op = if *increment { "++" } else { "--" };
                if *prefix {
                    write!(f, "{op}{}", arena.debug(target))
                } else {
                    write!(f, "{}{op}", arena.debug(target))
                }
            }
            ExprKind::Ternary {
                condition,
                branches: [if_true, if_false],
            } => write!(
                f,
                "({} ? {} : {})",
                arena.debug(condition),
                arena.debug(if_true),
                arena.debug(if_false),
            ),
            ExprKind::Logical { op, lhs, rhs } => {
                write!(f, "({} {op} {})", arena.debug(lhs), arena.debug(rhs))
            }
            ExprKind::StringConcat { parts } => {
                write!(f, "(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " + ")?;
                    }
                    write!(f, "{}", arena.debug(part))?;
                }
                write!(f, ")")
            }
            ExprKind::MonitorEnter { object } => write!(f, "monitorenter({})", arena.debug(object)),
            ExprKind::MonitorExit { object } => write!(f, "monitorexit({})", arena.debug(object)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output() {
        let mut arena = Arena::new();
        let array = arena.add(ExprKind::Slot(SlotKey::Slot(1)), Type::any_reference());
        let index = arena.add(ExprKind::Local(LocalId(3)), Type::int_slot());
        let element = arena.add(
            ExprKind::ArrayElement { array, index },
            Type::simple(SimpleType::Int),
        );
        let one = arena.int(1);
        let sum = arena.add(
            ExprKind::Binary {
                op: BinOp::Arith(ArithOp::Add),
                lhs: element,
                rhs: one,
            },
            Type::simple(SimpleType::Int),
        );
        assert_eq!(arena.debug(&sum).to_string(), "(slot1[v3] + 1)");

        let flag = arena.add(
            ExprKind::Const(Constant::Int(1)),
            Type::simple(SimpleType::Boolean),
        );
        assert_eq!(arena.debug(&flag).to_string(), "true");

        let length = arena.int(3);
        let matrix = arena.add(
            ExprKind::NewArray {
                element: SimpleType::array(SimpleType::Long),
                lengths: vec![length],
            },
            Type::UNKNOWN,
        );
        assert_eq!(arena.debug(&matrix).to_string(), "new long[3][]");
    }
}
