use crate::ast::ExprId;
use crate::graph::Shuffle;
use crate::instruction::Opcode;

/// A run of consecutive instructions, collapsed as far as fusion allows.
#[derive(Clone, Debug)]
pub struct Node {
    pub address: u32,
    /// The address right after the last instruction of the run.
    pub end: u32,
    /// Operand stack depth on entry, counted in values.
    pub depth: usize,
    /// Complete statements, executed before the tail.
    pub stmts: Vec<ExprId>,
    pub tail: Tail,
    /// The fallthrough successor, if any, comes first.
    pub successors: Vec<u32>,
}

impl Node {
    /// Whether the node does nothing but push a value.
    pub fn pure_value(&self) -> Option<ExprId> {
        match self.tail {
            Tail::Value(value) if self.stmts.is_empty() => Some(value),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Tail {
    /// An instruction whose operands have not been found yet.
    Op(Opcode),
    Shuffle(Shuffle),
    /// Pushes one value.
    Value(ExprId),
    /// Pushes the subexpressions of `target`, then `top`.
    ///
    /// This is the shape `dup; getfield` and `dup2; xaload` leave behind: the location is about
    /// to be both read and written. `top` starts out reading the location through copies of the
    /// same subexpressions.
    Lvalue { target: ExprId, top: ExprId },
    /// Control passes on to the only successor.
    FallThrough,
    Jump,
    /// Jumps to the second successor if the condition holds, falls through otherwise.
    If(ExprId),
    Switch {
        selector: ExprId,
        cases: Vec<(i32, u32)>,
        default: u32,
    },
    Return(Option<ExprId>),
    Throw(ExprId),
}

impl Tail {
    /// Whether control may leave the node other than by falling through.
    pub fn is_control(&self) -> bool {
        match self {
            Self::Jump | Self::If(_) | Self::Switch { .. } | Self::Return(_) | Self::Throw(_) => {
                true
            }
            Self::Op(opcode) => opcode.is_divergent() || matches!(opcode, Opcode::If { .. }),
            _ => false,
        }
    }
}
