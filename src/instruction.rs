//! Decoded method bodies, as handed over by a class file reader.
//!
//! The instruction set is normalized a little compared to raw bytecode: `iload_1` and `iload 1`
//! are both `Load { kind: Int, slot: 1 }`, `ldc`, `bipush` and friends are all `Const`, and jump
//! offsets are resolved to absolute addresses. Everything else maps one-to-one.

use crate::types::{
    ClassHierarchy, DescriptorError, FlatHierarchy, SimpleType, Type, parse_field_descriptor,
    parse_method_descriptor,
};
use displaydoc::Display;

/// The kind of value a load, store or return operates on.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// int
    Int,
    /// long
    Long,
    /// float
    Float,
    /// double
    Double,
    /// reference
    Reference,
}

impl ValueKind {
    pub fn category(self) -> Category {
        match self {
            Self::Long | Self::Double => Category::Double,
            _ => Category::Single,
        }
    }

    /// Everything a value of this kind can be.
    pub fn ty(self) -> Type {
        match self {
            Self::Int => Type::int_slot(),
            Self::Long => Type::simple(SimpleType::Long),
            Self::Float => Type::simple(SimpleType::Float),
            Self::Double => Type::simple(SimpleType::Double),
            Self::Reference => Type::any_reference(),
        }
    }
}

/// Element kinds of `xaload` and `xastore`.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    /// int
    Int,
    /// long
    Long,
    /// float
    Float,
    /// double
    Double,
    /// reference
    Reference,
    /// byte or boolean
    ByteOrBoolean,
    /// char
    Char,
    /// short
    Short,
}

impl ArrayKind {
    pub fn category(self) -> Category {
        match self {
            Self::Long | Self::Double => Category::Double,
            _ => Category::Single,
        }
    }

    /// The element type, `None` for references, whose element type is not known from the opcode.
    pub fn element(self) -> Option<SimpleType> {
        Some(match self {
            Self::Int => SimpleType::Int,
            Self::Long => SimpleType::Long,
            Self::Float => SimpleType::Float,
            Self::Double => SimpleType::Double,
            Self::Reference => return None,
            Self::ByteOrBoolean => SimpleType::BoolByte,
            Self::Char => SimpleType::Char,
            Self::Short => SimpleType::Short,
        })
    }
}

/// Operand kinds of arithmetic instructions.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum NumKind {
    /// int
    Int,
    /// long
    Long,
    /// float
    Float,
    /// double
    Double,
}

impl NumKind {
    pub fn category(self) -> Category {
        match self {
            Self::Long | Self::Double => Category::Double,
            _ => Category::Single,
        }
    }

    pub fn simple(self) -> SimpleType {
        match self {
            Self::Int => SimpleType::Int,
            Self::Long => SimpleType::Long,
            Self::Float => SimpleType::Float,
            Self::Double => SimpleType::Double,
        }
    }
}

/// Targets of primitive conversions.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    /// byte
    Byte,
    /// char
    Char,
    /// short
    Short,
    /// int
    Int,
    /// long
    Long,
    /// float
    Float,
    /// double
    Double,
}

impl PrimitiveKind {
    pub fn simple(self) -> SimpleType {
        match self {
            Self::Byte => SimpleType::Byte,
            Self::Char => SimpleType::Char,
            Self::Short => SimpleType::Short,
            Self::Int => SimpleType::Int,
            Self::Long => SimpleType::Long,
            Self::Float => SimpleType::Float,
            Self::Double => SimpleType::Double,
        }
    }

    pub fn category(self) -> Category {
        match self {
            Self::Long | Self::Double => Category::Double,
            _ => Category::Single,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Ushr,
    And,
    Or,
    Xor,
}

impl core::fmt::Display for ArithOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Shl => "<<",
            Self::Shr => ">>",
            Self::Ushr => ">>>",
            Self::And => "&",
            Self::Or => "|",
            Self::Xor => "^",
        })
    }
}

/// `lcmp`, `fcmpl`, `fcmpg`, `dcmpl` and `dcmpg`.
///
/// The `l` and `g` variants differ in what they return when either operand is NaN: `-1` for `l`,
/// `1` for `g`.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum CompareKind {
    /// lcmp
    Long,
    /// fcmpl
    FloatL,
    /// fcmpg
    FloatG,
    /// dcmpl
    DoubleL,
    /// dcmpg
    DoubleG,
}

impl CompareKind {
    pub fn operand(self) -> SimpleType {
        match self {
            Self::Long => SimpleType::Long,
            Self::FloatL | Self::FloatG => SimpleType::Float,
            Self::DoubleL | Self::DoubleG => SimpleType::Double,
        }
    }

    /// The result on NaN operands, `None` for integers.
    pub fn nan_result(self) -> Option<i32> {
        match self {
            Self::Long => None,
            Self::FloatL | Self::DoubleL => Some(-1),
            Self::FloatG | Self::DoubleG => Some(1),
        }
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// ==
    Eq,
    /// !=
    Ne,
    /// <
    Lt,
    /// >=
    Ge,
    /// >
    Gt,
    /// <=
    Le,
}

impl CompareOp {
    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Lt => Self::Ge,
            Self::Ge => Self::Lt,
            Self::Gt => Self::Le,
            Self::Le => Self::Gt,
        }
    }

    pub fn evaluate(self, ordering: core::cmp::Ordering) -> bool {
        use core::cmp::Ordering::*;
        match self {
            Self::Eq => ordering == Equal,
            Self::Ne => ordering != Equal,
            Self::Lt => ordering == Less,
            Self::Ge => ordering != Less,
            Self::Gt => ordering == Greater,
            Self::Le => ordering != Greater,
        }
    }
}

/// What a conditional jump compares.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JumpOperands {
    /// `ifeq` and friends: one int against zero.
    IntZero,
    /// `if_icmpeq` and friends.
    IntPair,
    /// `ifnull` and `ifnonnull`.
    Null,
    /// `if_acmpeq` and `if_acmpne`.
    ReferencePair,
}

impl JumpOperands {
    pub fn count(self) -> usize {
        match self {
            Self::IntZero | Self::Null => 1,
            Self::IntPair | Self::ReferencePair => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum InvokeKind {
    /// invokevirtual
    Virtual,
    /// invokespecial
    Special,
    /// invokestatic
    Static,
    /// invokeinterface
    Interface,
}

/// A field or method reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemberRef {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

impl MemberRef {
    pub fn new(class: &str, name: &str, descriptor: &str) -> Self {
        Self {
            class: class.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }
}

/// Loadable constants.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    /// A class literal, given by internal name or array descriptor.
    Class(String),
    MethodType(String),
    /// Method handles and dynamic constants are kept in a human-readable form only.
    MethodHandle(String),
    Dynamic { name: String, descriptor: String },
}

impl Constant {
    pub fn category(&self) -> Category {
        match self {
            Self::Long(_) | Self::Double(_) => Category::Double,
            Self::Dynamic { descriptor, .. } if matches!(descriptor.as_str(), "J" | "D") => {
                Category::Double
            }
            _ => Category::Single,
        }
    }
}

/// The number of operand stack slots a value occupies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Single,
    Double,
}

impl Category {
    pub fn of(ty: &SimpleType) -> Category {
        if ty.stack_size() == 2 {
            Category::Double
        } else {
            Category::Single
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Opcode {
    Nop,
    Const(Constant),
    Load { kind: ValueKind, slot: u16 },
    Store { kind: ValueKind, slot: u16 },
    /// `iinc`
    Increment { slot: u16, delta: i32 },
    ArrayLoad(ArrayKind),
    ArrayStore(ArrayKind),
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
    Arith { op: ArithOp, kind: NumKind },
    Neg(NumKind),
    Convert { from: NumKind, to: PrimitiveKind },
    Compare(CompareKind),
    /// Jumps to `target` if the comparison holds.
    If {
        op: CompareOp,
        operands: JumpOperands,
        target: u32,
    },
    Goto { target: u32 },
    /// Both `tableswitch` and `lookupswitch`.
    Switch { cases: Vec<(i32, u32)>, default: u32 },
    Return(Option<ValueKind>),
    Throw,
    GetField { field: MemberRef, is_static: bool },
    PutField { field: MemberRef, is_static: bool },
    Invoke { kind: InvokeKind, method: MemberRef },
    InvokeDynamic {
        name: String,
        descriptor: String,
        bootstrap: u16,
    },
    New { class: String },
    /// `newarray` and `anewarray`, with the element type as a field descriptor.
    NewArray { element: String },
    MultiNewArray { descriptor: String, dimensions: u8 },
    ArrayLength,
    /// The operand is an internal class name or an array descriptor.
    CheckCast { class: String },
    InstanceOf { class: String },
    MonitorEnter,
    MonitorExit,
    Jsr { target: u32 },
    Ret { slot: u16 },
}

/// How many values an instruction pops and what it pushes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackEffect {
    pub pops: usize,
    pub push: Option<Category>,
}

impl Opcode {
    /// The addresses control may reach after this instruction, given the address of the next one.
    /// The fallthrough address, if any, comes first.
    pub fn successors(&self, next: u32) -> Vec<u32> {
        match self {
            Self::If { target, .. } => {
                if *target == next {
                    vec![next]
                } else {
                    vec![next, *target]
                }
            }
            Self::Goto { target } | Self::Jsr { target } => vec![*target],
            Self::Switch { cases, default } => {
                let mut targets = vec![*default];
                for (_, target) in cases {
                    if !targets.contains(target) {
                        targets.push(*target);
                    }
                }
                targets
            }
            Self::Return(_) | Self::Throw | Self::Ret { .. } => Vec::new(),
            _ => vec![next],
        }
    }

    /// Whether control never continues with the next instruction.
    pub fn is_divergent(&self) -> bool {
        matches!(
            self,
            Self::Goto { .. }
                | Self::Switch { .. }
                | Self::Return(_)
                | Self::Throw
                | Self::Jsr { .. }
                | Self::Ret { .. }
        )
    }

    /// Whether this is a pure operand stack permutation: `pop`, `dup` and friends.
    pub fn is_shuffle(&self) -> bool {
        matches!(
            self,
            Self::Pop
                | Self::Pop2
                | Self::Dup
                | Self::DupX1
                | Self::DupX2
                | Self::Dup2
                | Self::Dup2X1
                | Self::Dup2X2
                | Self::Swap
        )
    }

    /// The stack effect of everything but shuffles, counting values rather than slots.
    pub fn stack_effect(&self) -> Result<Option<StackEffect>, DescriptorError> {
        let effect = |pops, push| Ok(Some(StackEffect { pops, push }));
        let single = Some(Category::Single);
        match self {
            Self::Nop | Self::Goto { .. } | Self::Increment { .. } => effect(0, None),
            Self::Const(constant) => effect(0, Some(constant.category())),
            Self::Load { kind, .. } => effect(0, Some(kind.category())),
            Self::Store { .. } => effect(1, None),
            Self::ArrayLoad(kind) => effect(2, Some(kind.category())),
            Self::ArrayStore(_) => effect(3, None),
            Self::Arith { kind, .. } => effect(2, Some(kind.category())),
            Self::Neg(kind) => effect(1, Some(kind.category())),
            Self::Convert { to, .. } => effect(1, Some(to.category())),
            Self::Compare(_) => effect(2, single),
            Self::If { operands, .. } => effect(operands.count(), None),
            Self::Switch { .. } => effect(1, None),
            Self::Return(kind) => effect(usize::from(kind.is_some()), None),
            Self::Throw | Self::MonitorEnter | Self::MonitorExit => effect(1, None),
            Self::GetField { field, is_static } => {
                let ty = parse_field_descriptor(&field.descriptor, &FlatHierarchy)?;
                effect(usize::from(!is_static), Some(Category::of(&ty)))
            }
            Self::PutField { field, is_static } => {
                parse_field_descriptor(&field.descriptor, &FlatHierarchy)?;
                effect(1 + usize::from(!is_static), None)
            }
            Self::Invoke { kind, method } => {
                let types = parse_method_descriptor(&method.descriptor, &FlatHierarchy)?;
                let receiver = usize::from(*kind != InvokeKind::Static);
                let push = (types.return_type != SimpleType::Void)
                    .then(|| Category::of(&types.return_type));
                effect(types.parameters.len() + receiver, push)
            }
            Self::InvokeDynamic { descriptor, .. } => {
                let types = parse_method_descriptor(descriptor, &FlatHierarchy)?;
                let push = (types.return_type != SimpleType::Void)
                    .then(|| Category::of(&types.return_type));
                effect(types.parameters.len(), push)
            }
            Self::New { .. } => effect(0, single),
            Self::NewArray { .. } => effect(1, single),
            Self::MultiNewArray { dimensions, .. } => effect(usize::from(*dimensions), single),
            Self::ArrayLength | Self::CheckCast { .. } | Self::InstanceOf { .. } => {
                effect(1, single)
            }
            Self::Jsr { .. } => effect(0, single),
            Self::Ret { .. } => effect(0, None),
            Self::Pop
            | Self::Pop2
            | Self::Dup
            | Self::DupX1
            | Self::DupX2
            | Self::Dup2
            | Self::Dup2X1
            | Self::Dup2X2
            | Self::Swap => Ok(None),
        }
    }

    pub fn can_throw(&self) -> bool {
        // Any instruction may throw `VirtualMachineError` in theory. We follow HotSpot instead,
        // which only raises `StackOverflowError` in method prologues and treats `OutOfMemoryError`
        // as recoverable only for allocating instructions. Without this, every `try` would
        // swallow the non-throwing instructions around it.
        match self {
            // Out-of-bounds indexes, NPE or array store checks.
            Self::ArrayLoad(_) | Self::ArrayStore(_) => true,
            // Negative sizes, invalid types or OOM.
            Self::NewArray { .. } | Self::MultiNewArray { .. } | Self::New { .. } => true,
            // Mismatched monitors.
            Self::Return(_) => true,
            Self::ArrayLength | Self::MonitorEnter | Self::MonitorExit => true,
            // NPE, class initialization or linkage errors.
            Self::GetField { .. } | Self::PutField { .. } => true,
            Self::Throw => true,
            Self::CheckCast { .. } | Self::InstanceOf { .. } => true,
            // Division by zero.
            Self::Arith {
                op: ArithOp::Div | ArithOp::Rem,
                kind: NumKind::Int | NumKind::Long,
            } => true,
            Self::Invoke { .. } | Self::InvokeDynamic { .. } => true,
            // Class literals and dynamic constants can fail to resolve.
            Self::Const(
                Constant::Class(_)
                | Constant::MethodType(_)
                | Constant::MethodHandle(_)
                | Constant::Dynamic { .. },
            ) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub address: u32,
    pub length: u32,
    pub opcode: Opcode,
    /// Empty only for instructions that leave the method, the fallthrough successor comes first.
    pub successors: Vec<u32>,
}

impl Instruction {
    pub fn new(address: u32, length: u32, opcode: Opcode) -> Self {
        let successors = opcode.successors(address + length);
        Self {
            address,
            length,
            opcode,
            successors,
        }
    }

    pub fn next_address(&self) -> u32 {
        self.address + self.length
    }
}

/// An exception table entry. `class` is `None` for catch-all entries, as used by `finally`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handler {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub class: Option<String>,
}

/// A local variable table entry, used to name variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalVariable {
    pub slot: u16,
    pub start: u32,
    pub length: u32,
    pub name: String,
}

impl LocalVariable {
    pub fn covers(&self, address: u32) -> bool {
        self.start <= address && address - self.start < self.length
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodSignature {
    /// Internal name of the declaring class.
    pub class: String,
    pub name: String,
    pub descriptor: String,
    pub is_static: bool,
    pub exceptions: Vec<String>,
}

impl MethodSignature {
    pub fn new(class: &str, name: &str, descriptor: &str, is_static: bool) -> Self {
        Self {
            class: class.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            is_static,
            exceptions: Vec::new(),
        }
    }

    /// Types of the values in the local slots on entry, one entry per parameter, including the
    /// receiver, paired with the slot it occupies.
    pub fn parameter_slots(
        &self,
        hierarchy: &dyn ClassHierarchy,
    ) -> Result<Vec<(u16, SimpleType)>, DescriptorError> {
        let types = parse_method_descriptor(&self.descriptor, hierarchy)?;
        let mut slots = Vec::with_capacity(types.parameters.len() + 1);
        let mut slot = 0u16;
        if !self.is_static {
            slots.push((0, SimpleType::class(&self.class, hierarchy)));
            slot = 1;
        }
        for ty in types.parameters {
            let size = ty.stack_size() as u16;
            slots.push((slot, ty));
            slot += size;
        }
        Ok(slots)
    }
}

/// Everything known about one method body.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodBody {
    pub signature: MethodSignature,
    pub instructions: Vec<Instruction>,
    pub handlers: Vec<Handler>,
    pub local_variables: Vec<LocalVariable>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    enum Pending {
        Ready(Opcode),
        If(CompareOp, JumpOperands, &'static str),
        Goto(&'static str),
        Switch(Vec<(i32, &'static str)>, &'static str),
    }

    /// A tiny label-based assembler for building method bodies in tests.
    ///
    /// Instruction lengths are roughly what a real class file would use, but only their
    /// consistency matters.
    pub(crate) struct Asm {
        signature: MethodSignature,
        code: Vec<(u32, Pending)>,
        labels: FxHashMap<&'static str, u32>,
        handlers: Vec<(&'static str, &'static str, &'static str, Option<&'static str>)>,
        local_variables: Vec<LocalVariable>,
        address: u32,
    }

    fn length(pending: &Pending) -> u32 {
        match pending {
            Pending::Ready(
                Opcode::Const(Constant::Int(-1..=5) | Constant::Null)
                | Opcode::Load { slot: 0..=3, .. }
                | Opcode::Store { slot: 0..=3, .. },
            ) => 1,
            Pending::Ready(Opcode::Const(_) | Opcode::Load { .. } | Opcode::Store { .. }) => 2,
            Pending::Ready(
                Opcode::GetField { .. }
                | Opcode::PutField { .. }
                | Opcode::Invoke { .. }
                | Opcode::New { .. }
                | Opcode::CheckCast { .. }
                | Opcode::InstanceOf { .. }
                | Opcode::Increment { .. },
            ) => 3,
            Pending::Ready(Opcode::InvokeDynamic { .. }) => 5,
            Pending::Ready(Opcode::NewArray { .. }) => 2,
            Pending::Ready(_) => 1,
            Pending::If(..) | Pending::Goto(_) => 3,
            Pending::Switch(cases, _) => 12 + 8 * cases.len() as u32,
        }
    }

    impl Asm {
        pub(crate) fn new() -> Self {
            Self::with_signature(MethodSignature::new("test/Test", "test", "()V", true))
        }

        pub(crate) fn with_signature(signature: MethodSignature) -> Self {
            Self {
                signature,
                code: Vec::new(),
                labels: FxHashMap::default(),
                handlers: Vec::new(),
                local_variables: Vec::new(),
                address: 0,
            }
        }

        fn push(&mut self, pending: Pending) -> &mut Self {
            let length = length(&pending);
            self.code.push((self.address, pending));
            self.address += length;
            self
        }

        pub(crate) fn op(&mut self, opcode: Opcode) -> &mut Self {
            self.push(Pending::Ready(opcode))
        }

        pub(crate) fn label(&mut self, name: &'static str) -> &mut Self {
            assert!(
                self.labels.insert(name, self.address).is_none(),
                "duplicate label {name}"
            );
            self
        }

        pub(crate) fn branch(
            &mut self,
            op: CompareOp,
            operands: JumpOperands,
            target: &'static str,
        ) -> &mut Self {
            self.push(Pending::If(op, operands, target))
        }

        pub(crate) fn goto(&mut self, target: &'static str) -> &mut Self {
            self.push(Pending::Goto(target))
        }

        pub(crate) fn switch(
            &mut self,
            cases: &[(i32, &'static str)],
            default: &'static str,
        ) -> &mut Self {
            self.push(Pending::Switch(cases.to_vec(), default))
        }

        pub(crate) fn handler(
            &mut self,
            start: &'static str,
            end: &'static str,
            target: &'static str,
            class: Option<&'static str>,
        ) -> &mut Self {
            self.handlers.push((start, end, target, class));
            self
        }

        pub(crate) fn local_variable(
            &mut self,
            slot: u16,
            start: &'static str,
            end: &'static str,
            name: &str,
        ) -> &mut Self {
            // Resolved eagerly, so labels must already be defined.
            let start = self.labels[start];
            let end = self.labels[end];
            self.local_variables.push(LocalVariable {
                slot,
                start,
                length: end - start,
                name: name.to_string(),
            });
            self
        }

        // Shorthands for the most common instructions.

        pub(crate) fn iconst(&mut self, value: i32) -> &mut Self {
            self.op(Opcode::Const(Constant::Int(value)))
        }

        pub(crate) fn iload(&mut self, slot: u16) -> &mut Self {
            self.op(Opcode::Load {
                kind: ValueKind::Int,
                slot,
            })
        }

        pub(crate) fn istore(&mut self, slot: u16) -> &mut Self {
            self.op(Opcode::Store {
                kind: ValueKind::Int,
                slot,
            })
        }

        pub(crate) fn aload(&mut self, slot: u16) -> &mut Self {
            self.op(Opcode::Load {
                kind: ValueKind::Reference,
                slot,
            })
        }

        pub(crate) fn astore(&mut self, slot: u16) -> &mut Self {
            self.op(Opcode::Store {
                kind: ValueKind::Reference,
                slot,
            })
        }

        pub(crate) fn arith(&mut self, op: ArithOp) -> &mut Self {
            self.op(Opcode::Arith {
                op,
                kind: NumKind::Int,
            })
        }

        pub(crate) fn invoke_static(&mut self, name: &str, descriptor: &str) -> &mut Self {
            self.op(Opcode::Invoke {
                kind: InvokeKind::Static,
                method: MemberRef::new("test/Test", name, descriptor),
            })
        }

        pub(crate) fn ret(&mut self, kind: Option<ValueKind>) -> &mut Self {
            self.op(Opcode::Return(kind))
        }

        pub(crate) fn finish(&self) -> MethodBody {
            let resolve = |label: &str| -> u32 {
                *self
                    .labels
                    .get(label)
                    .unwrap_or_else(|| panic!("undefined label {label}"))
            };
            let instructions = self
                .code
                .iter()
                .enumerate()
                .map(|(i, (address, pending))| {
                    let next = self
                        .code
                        .get(i + 1)
                        .map(|(address, _)| *address)
                        .unwrap_or(self.address);
                    let opcode = match pending {
                        Pending::Ready(opcode) => opcode.clone(),
                        Pending::If(op, operands, target) => Opcode::If {
                            op: *op,
                            operands: *operands,
                            target: resolve(target),
                        },
                        Pending::Goto(target) => Opcode::Goto {
                            target: resolve(target),
                        },
                        Pending::Switch(cases, default) => Opcode::Switch {
                            cases: cases
                                .iter()
                                .map(|(value, target)| (*value, resolve(target)))
                                .collect(),
                            default: resolve(default),
                        },
                    };
                    Instruction::new(*address, next - address, opcode)
                })
                .collect();
            let handlers = self
                .handlers
                .iter()
                .map(|(start, end, target, class)| Handler {
                    start: resolve(start),
                    end: resolve(end),
                    handler: resolve(target),
                    class: class.map(str::to_string),
                })
                .collect();
            MethodBody {
                signature: self.signature.clone(),
                instructions,
                handlers,
                local_variables: self.local_variables.clone(),
            }
        }
    }

    #[test]
    fn assembler_layout() {
        let body = Asm::new()
            .iload(0)
            .branch(CompareOp::Eq, JumpOperands::IntZero, "else")
            .iconst(1)
            .ret(Some(ValueKind::Int))
            .label("else")
            .iconst(2)
            .ret(Some(ValueKind::Int))
            .finish();

        let addresses: Vec<u32> = body.instructions.iter().map(|insn| insn.address).collect();
        assert_eq!(addresses, [0, 1, 4, 5, 6, 7]);
        assert_eq!(body.instructions[1].successors, [4, 6]);
        assert!(body.instructions[3].successors.is_empty());
        for pair in body.instructions.windows(2) {
            assert_eq!(pair[0].next_address(), pair[1].address);
        }
    }

    #[test]
    fn operator_symbols() {
        let symbols: Vec<String> = [ArithOp::Sub, ArithOp::Ushr, ArithOp::Xor]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(symbols, ["-", ">>>", "^"]);
    }

    #[test]
    fn stack_effects() {
        let invoke = Opcode::Invoke {
            kind: InvokeKind::Virtual,
            method: MemberRef::new("java/lang/String", "charAt", "(I)C"),
        };
        assert_eq!(
            invoke.stack_effect(),
            Ok(Some(StackEffect {
                pops: 2,
                push: Some(Category::Single)
            }))
        );
        let get = Opcode::GetField {
            field: MemberRef::new("test/Test", "x", "J"),
            is_static: true,
        };
        assert_eq!(
            get.stack_effect(),
            Ok(Some(StackEffect {
                pops: 0,
                push: Some(Category::Double)
            }))
        );
        assert_eq!(Opcode::Dup2X1.stack_effect(), Ok(None));
        assert!(
            Opcode::Invoke {
                kind: InvokeKind::Static,
                method: MemberRef::new("test/Test", "f", "(Q)V"),
            }
            .stack_effect()
            .is_err()
        );
    }

    #[test]
    fn parameter_slots() {
        let h = crate::types::BasicHierarchy::new();
        let signature = MethodSignature::new("test/Test", "f", "(JI[Ljava/lang/String;)V", false);
        let slots = signature.parameter_slots(&h).unwrap();
        let indices: Vec<u16> = slots.iter().map(|(slot, _)| *slot).collect();
        assert_eq!(indices, [0, 1, 3, 4]);
        assert_eq!(slots[0].1, SimpleType::class("test/Test", &h));
    }
}
