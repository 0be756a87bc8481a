//! Conversion of `noak`-parsed `Code` attributes into [`MethodBody`] records.

use crate::instruction::{
    ArithOp, ArrayKind, CompareKind, CompareOp, Constant, Handler, Instruction, InvokeKind,
    JumpOperands, MemberRef, MethodBody, MethodSignature, NumKind, Opcode, PrimitiveKind,
    ValueKind,
};
use noak::{
    MStr,
    error::DecodeError,
    reader::{
        attributes::{
            ArrayType, Code,
            RawInstruction::{self, *},
        },
        cpool::{
            self, ConstantPool, Dynamic, Index, InterfaceMethodRef, Item, MethodHandle, MethodRef,
        },
    },
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Failed to parse class file: {0}")]
    Noak(#[from] DecodeError),

    #[error("ldc at {0} refers to a constant of an invalid type")]
    InvalidLdc(u32),

    #[error("ldc2_w at {0} refers to a constant of an invalid type")]
    InvalidLdc2(u32),

    #[error("Invocation at {0} does not refer to a method")]
    InvalidMethodRef(u32),

    #[error("Jump at {0} leaves the code")]
    JumpOutOfCode(u32),
}

fn text(string: &MStr) -> String {
    string.display().to_string()
}

fn member<'code>(
    pool: &ConstantPool<'code>,
    address: u32,
    index: Index<Item<'code>>,
) -> Result<MemberRef, ImportError> {
    let (class, name_and_type) = match pool.get(index)? {
        Item::MethodRef(MethodRef {
            class,
            name_and_type,
        }) => (class, name_and_type),
        Item::InterfaceMethodRef(InterfaceMethodRef {
            class,
            name_and_type,
        }) => (class, name_and_type),
        _ => return Err(ImportError::InvalidMethodRef(address)),
    };
    let name_and_type = pool.retrieve(*name_and_type)?;
    Ok(MemberRef {
        class: text(pool.retrieve(*class)?.name),
        name: text(name_and_type.name),
        descriptor: text(name_and_type.descriptor),
    })
}

fn relative(address: u32, offset: i32) -> Result<u32, ImportError> {
    address
        .checked_add_signed(offset)
        .ok_or(ImportError::JumpOutOfCode(address))
}

fn branch(
    address: u32,
    op: CompareOp,
    operands: JumpOperands,
    offset: i32,
) -> Result<Opcode, ImportError> {
    Ok(Opcode::If {
        op,
        operands,
        target: relative(address, offset)?,
    })
}

fn load(kind: ValueKind, slot: u16) -> Opcode {
    Opcode::Load { kind, slot }
}

fn store(kind: ValueKind, slot: u16) -> Opcode {
    Opcode::Store { kind, slot }
}

fn arith(op: ArithOp, kind: NumKind) -> Opcode {
    Opcode::Arith { op, kind }
}

fn convert(from: NumKind, to: PrimitiveKind) -> Opcode {
    Opcode::Convert { from, to }
}

/// Class names as used by `anewarray`: array descriptors stay as they are.
fn element_descriptor(class: &str) -> String {
    if class.starts_with('[') {
        class.to_string()
    } else {
        format!("L{class};")
    }
}

fn import_instruction<'code>(
    pool: &ConstantPool<'code>,
    address: u32,
    insn: &RawInstruction<'code>,
) -> Result<Opcode, ImportError> {
    use JumpOperands::{IntPair, IntZero, Null, ReferencePair};
    use ValueKind as V;

    Ok(match insn {
        // Array accesses
        AALoad => Opcode::ArrayLoad(ArrayKind::Reference),
        BALoad => Opcode::ArrayLoad(ArrayKind::ByteOrBoolean),
        CALoad => Opcode::ArrayLoad(ArrayKind::Char),
        DALoad => Opcode::ArrayLoad(ArrayKind::Double),
        FALoad => Opcode::ArrayLoad(ArrayKind::Float),
        IALoad => Opcode::ArrayLoad(ArrayKind::Int),
        LALoad => Opcode::ArrayLoad(ArrayKind::Long),
        SALoad => Opcode::ArrayLoad(ArrayKind::Short),
        AAStore => Opcode::ArrayStore(ArrayKind::Reference),
        BAStore => Opcode::ArrayStore(ArrayKind::ByteOrBoolean),
        CAStore => Opcode::ArrayStore(ArrayKind::Char),
        DAStore => Opcode::ArrayStore(ArrayKind::Double),
        FAStore => Opcode::ArrayStore(ArrayKind::Float),
        IAStore => Opcode::ArrayStore(ArrayKind::Int),
        LAStore => Opcode::ArrayStore(ArrayKind::Long),
        SAStore => Opcode::ArrayStore(ArrayKind::Short),

        // Locals
        ALoad { index } => load(V::Reference, *index as u16),
        DLoad { index } => load(V::Double, *index as u16),
        FLoad { index } => load(V::Float, *index as u16),
        ILoad { index } => load(V::Int, *index as u16),
        LLoad { index } => load(V::Long, *index as u16),
        ALoadW { index } => load(V::Reference, *index as u16),
        DLoadW { index } => load(V::Double, *index as u16),
        FLoadW { index } => load(V::Float, *index as u16),
        ILoadW { index } => load(V::Int, *index as u16),
        LLoadW { index } => load(V::Long, *index as u16),
        ALoad0 => load(V::Reference, 0),
        ALoad1 => load(V::Reference, 1),
        ALoad2 => load(V::Reference, 2),
        ALoad3 => load(V::Reference, 3),
        DLoad0 => load(V::Double, 0),
        DLoad1 => load(V::Double, 1),
        DLoad2 => load(V::Double, 2),
        DLoad3 => load(V::Double, 3),
        FLoad0 => load(V::Float, 0),
        FLoad1 => load(V::Float, 1),
        FLoad2 => load(V::Float, 2),
        FLoad3 => load(V::Float, 3),
        ILoad0 => load(V::Int, 0),
        ILoad1 => load(V::Int, 1),
        ILoad2 => load(V::Int, 2),
        ILoad3 => load(V::Int, 3),
        LLoad0 => load(V::Long, 0),
        LLoad1 => load(V::Long, 1),
        LLoad2 => load(V::Long, 2),
        LLoad3 => load(V::Long, 3),
        AStore { index } => store(V::Reference, *index as u16),
        DStore { index } => store(V::Double, *index as u16),
        FStore { index } => store(V::Float, *index as u16),
        IStore { index } => store(V::Int, *index as u16),
        LStore { index } => store(V::Long, *index as u16),
        AStoreW { index } => store(V::Reference, *index as u16),
        DStoreW { index } => store(V::Double, *index as u16),
        FStoreW { index } => store(V::Float, *index as u16),
        IStoreW { index } => store(V::Int, *index as u16),
        LStoreW { index } => store(V::Long, *index as u16),
        AStore0 => store(V::Reference, 0),
        AStore1 => store(V::Reference, 1),
        AStore2 => store(V::Reference, 2),
        AStore3 => store(V::Reference, 3),
        DStore0 => store(V::Double, 0),
        DStore1 => store(V::Double, 1),
        DStore2 => store(V::Double, 2),
        DStore3 => store(V::Double, 3),
        FStore0 => store(V::Float, 0),
        FStore1 => store(V::Float, 1),
        FStore2 => store(V::Float, 2),
        FStore3 => store(V::Float, 3),
        IStore0 => store(V::Int, 0),
        IStore1 => store(V::Int, 1),
        IStore2 => store(V::Int, 2),
        IStore3 => store(V::Int, 3),
        LStore0 => store(V::Long, 0),
        LStore1 => store(V::Long, 1),
        LStore2 => store(V::Long, 2),
        LStore3 => store(V::Long, 3),
        IInc { index, value } => Opcode::Increment {
            slot: *index as u16,
            delta: *value as i32,
        },
        IIncW { index, value } => Opcode::Increment {
            slot: *index as u16,
            delta: *value as i32,
        },

        // Constants
        AConstNull => Opcode::Const(Constant::Null),
        BIPush { value } => Opcode::Const(Constant::Int(*value as i32)),
        SIPush { value } => Opcode::Const(Constant::Int(*value as i32)),
        IConstM1 => Opcode::Const(Constant::Int(-1)),
        IConst0 => Opcode::Const(Constant::Int(0)),
        IConst1 => Opcode::Const(Constant::Int(1)),
        IConst2 => Opcode::Const(Constant::Int(2)),
        IConst3 => Opcode::Const(Constant::Int(3)),
        IConst4 => Opcode::Const(Constant::Int(4)),
        IConst5 => Opcode::Const(Constant::Int(5)),
        LConst0 => Opcode::Const(Constant::Long(0)),
        LConst1 => Opcode::Const(Constant::Long(1)),
        FConst0 => Opcode::Const(Constant::Float(0.0)),
        FConst1 => Opcode::Const(Constant::Float(1.0)),
        FConst2 => Opcode::Const(Constant::Float(2.0)),
        DConst0 => Opcode::Const(Constant::Double(0.0)),
        DConst1 => Opcode::Const(Constant::Double(1.0)),
        LdC { index } | LdCW { index } => Opcode::Const(match pool.get(*index)? {
            Item::Integer(cpool::Integer { value }) => Constant::Int(*value),
            Item::Float(cpool::Float { value }) => Constant::Float(*value),
            Item::Class(cpool::Class { name }) => Constant::Class(text(pool.retrieve(*name)?)),
            Item::String(cpool::String { string }) => {
                Constant::String(text(pool.retrieve(*string)?))
            }
            Item::MethodType(cpool::MethodType { descriptor }) => {
                Constant::MethodType(text(pool.retrieve(*descriptor)?))
            }
            Item::MethodHandle(_) => {
                let handle = Index::<MethodHandle>::new(index.as_u16())
                    .expect("indexes of parsed instructions are nonzero");
                Constant::MethodHandle(format!("{:?}", pool.retrieve(handle)?))
            }
            Item::Dynamic(_) => {
                let dynamic = Index::<Dynamic>::new(index.as_u16())
                    .expect("indexes of parsed instructions are nonzero");
                let dynamic = pool.retrieve(dynamic)?;
                Constant::Dynamic {
                    name: text(dynamic.name_and_type.name),
                    descriptor: text(dynamic.name_and_type.descriptor),
                }
            }
            _ => return Err(ImportError::InvalidLdc(address)),
        }),
        LdC2W { index } => Opcode::Const(match pool.get(*index)? {
            Item::Long(cpool::Long { value }) => Constant::Long(*value),
            Item::Double(cpool::Double { value }) => Constant::Double(*value),
            _ => return Err(ImportError::InvalidLdc2(address)),
        }),

        // Arithmetic
        DAdd => arith(ArithOp::Add, NumKind::Double),
        DSub => arith(ArithOp::Sub, NumKind::Double),
        DMul => arith(ArithOp::Mul, NumKind::Double),
        DDiv => arith(ArithOp::Div, NumKind::Double),
        DRem => arith(ArithOp::Rem, NumKind::Double),
        FAdd => arith(ArithOp::Add, NumKind::Float),
        FSub => arith(ArithOp::Sub, NumKind::Float),
        FMul => arith(ArithOp::Mul, NumKind::Float),
        FDiv => arith(ArithOp::Div, NumKind::Float),
        FRem => arith(ArithOp::Rem, NumKind::Float),
        IAdd => arith(ArithOp::Add, NumKind::Int),
        ISub => arith(ArithOp::Sub, NumKind::Int),
        IMul => arith(ArithOp::Mul, NumKind::Int),
        IDiv => arith(ArithOp::Div, NumKind::Int),
        IRem => arith(ArithOp::Rem, NumKind::Int),
        IAnd => arith(ArithOp::And, NumKind::Int),
        IOr => arith(ArithOp::Or, NumKind::Int),
        IXor => arith(ArithOp::Xor, NumKind::Int),
        IShL => arith(ArithOp::Shl, NumKind::Int),
        IShR => arith(ArithOp::Shr, NumKind::Int),
        IUShR => arith(ArithOp::Ushr, NumKind::Int),
        LAdd => arith(ArithOp::Add, NumKind::Long),
        LSub => arith(ArithOp::Sub, NumKind::Long),
        LMul => arith(ArithOp::Mul, NumKind::Long),
        LDiv => arith(ArithOp::Div, NumKind::Long),
        LRem => arith(ArithOp::Rem, NumKind::Long),
        LAnd => arith(ArithOp::And, NumKind::Long),
        LOr => arith(ArithOp::Or, NumKind::Long),
        LXor => arith(ArithOp::Xor, NumKind::Long),
        LShL => arith(ArithOp::Shl, NumKind::Long),
        LShR => arith(ArithOp::Shr, NumKind::Long),
        LUShR => arith(ArithOp::Ushr, NumKind::Long),
        DNeg => Opcode::Neg(NumKind::Double),
        FNeg => Opcode::Neg(NumKind::Float),
        INeg => Opcode::Neg(NumKind::Int),
        LNeg => Opcode::Neg(NumKind::Long),
        DCmpG => Opcode::Compare(CompareKind::DoubleG),
        DCmpL => Opcode::Compare(CompareKind::DoubleL),
        FCmpG => Opcode::Compare(CompareKind::FloatG),
        FCmpL => Opcode::Compare(CompareKind::FloatL),
        LCmp => Opcode::Compare(CompareKind::Long),

        // Conversions
        D2F => convert(NumKind::Double, PrimitiveKind::Float),
        D2I => convert(NumKind::Double, PrimitiveKind::Int),
        D2L => convert(NumKind::Double, PrimitiveKind::Long),
        F2D => convert(NumKind::Float, PrimitiveKind::Double),
        F2I => convert(NumKind::Float, PrimitiveKind::Int),
        F2L => convert(NumKind::Float, PrimitiveKind::Long),
        I2B => convert(NumKind::Int, PrimitiveKind::Byte),
        I2C => convert(NumKind::Int, PrimitiveKind::Char),
        I2D => convert(NumKind::Int, PrimitiveKind::Double),
        I2F => convert(NumKind::Int, PrimitiveKind::Float),
        I2L => convert(NumKind::Int, PrimitiveKind::Long),
        I2S => convert(NumKind::Int, PrimitiveKind::Short),
        L2D => convert(NumKind::Long, PrimitiveKind::Double),
        L2F => convert(NumKind::Long, PrimitiveKind::Float),
        L2I => convert(NumKind::Long, PrimitiveKind::Int),

        // Stack
        Dup => Opcode::Dup,
        DupX1 => Opcode::DupX1,
        DupX2 => Opcode::DupX2,
        Dup2 => Opcode::Dup2,
        Dup2X1 => Opcode::Dup2X1,
        Dup2X2 => Opcode::Dup2X2,
        Pop => Opcode::Pop,
        Pop2 => Opcode::Pop2,
        Swap => Opcode::Swap,

        // Control flow
        AThrow => Opcode::Throw,
        AReturn => Opcode::Return(Some(V::Reference)),
        DReturn => Opcode::Return(Some(V::Double)),
        FReturn => Opcode::Return(Some(V::Float)),
        IReturn => Opcode::Return(Some(V::Int)),
        LReturn => Opcode::Return(Some(V::Long)),
        Return => Opcode::Return(None),
        Goto { offset } => Opcode::Goto {
            target: relative(address, *offset as i32)?,
        },
        GotoW { offset } => Opcode::Goto {
            target: relative(address, *offset as i32)?,
        },
        IfACmpEq { offset } => branch(address, CompareOp::Eq, ReferencePair, *offset as i32)?,
        IfACmpNe { offset } => branch(address, CompareOp::Ne, ReferencePair, *offset as i32)?,
        IfICmpEq { offset } => branch(address, CompareOp::Eq, IntPair, *offset as i32)?,
        IfICmpNe { offset } => branch(address, CompareOp::Ne, IntPair, *offset as i32)?,
        IfICmpLt { offset } => branch(address, CompareOp::Lt, IntPair, *offset as i32)?,
        IfICmpGe { offset } => branch(address, CompareOp::Ge, IntPair, *offset as i32)?,
        IfICmpGt { offset } => branch(address, CompareOp::Gt, IntPair, *offset as i32)?,
        IfICmpLe { offset } => branch(address, CompareOp::Le, IntPair, *offset as i32)?,
        IfEq { offset } => branch(address, CompareOp::Eq, IntZero, *offset as i32)?,
        IfNe { offset } => branch(address, CompareOp::Ne, IntZero, *offset as i32)?,
        IfLt { offset } => branch(address, CompareOp::Lt, IntZero, *offset as i32)?,
        IfGe { offset } => branch(address, CompareOp::Ge, IntZero, *offset as i32)?,
        IfGt { offset } => branch(address, CompareOp::Gt, IntZero, *offset as i32)?,
        IfLe { offset } => branch(address, CompareOp::Le, IntZero, *offset as i32)?,
        IfNull { offset } => branch(address, CompareOp::Eq, Null, *offset as i32)?,
        IfNonNull { offset } => branch(address, CompareOp::Ne, Null, *offset as i32)?,
        LookupSwitch(switch) => Opcode::Switch {
            cases: switch
                .pairs()
                .map(|pair| Ok((pair.key(), relative(address, pair.offset())?)))
                .collect::<Result<_, ImportError>>()?,
            default: relative(address, switch.default_offset())?,
        },
        TableSwitch(switch) => Opcode::Switch {
            cases: switch
                .pairs()
                .map(|pair| Ok((pair.key(), relative(address, pair.offset())?)))
                .collect::<Result<_, ImportError>>()?,
            default: relative(address, switch.default_offset())?,
        },
        JSr { offset } => Opcode::Jsr {
            target: relative(address, *offset as i32)?,
        },
        JSrW { offset } => Opcode::Jsr {
            target: relative(address, *offset as i32)?,
        },
        Ret { index } => Opcode::Ret {
            slot: *index as u16,
        },
        RetW { index } => Opcode::Ret {
            slot: *index as u16,
        },

        // Calls
        InvokeDynamic { index } => {
            let indy = pool.retrieve(*index)?;
            Opcode::InvokeDynamic {
                name: text(indy.name_and_type.name),
                descriptor: text(indy.name_and_type.descriptor),
                bootstrap: indy.bootstrap_method_attr,
            }
        }
        InvokeSpecial { index } => Opcode::Invoke {
            kind: InvokeKind::Special,
            method: member(pool, address, Index::new(index.as_u16()).expect("nonzero index"))?,
        },
        InvokeStatic { index } => Opcode::Invoke {
            kind: InvokeKind::Static,
            method: member(pool, address, *index)?,
        },
        InvokeInterface { index, .. } => Opcode::Invoke {
            kind: InvokeKind::Interface,
            method: member(pool, address, Index::new(index.as_u16()).expect("nonzero index"))?,
        },
        InvokeVirtual { index } => Opcode::Invoke {
            kind: InvokeKind::Virtual,
            method: member(pool, address, Index::new(index.as_u16()).expect("nonzero index"))?,
        },

        // Fields
        GetField { index } | GetStatic { index } | PutField { index } | PutStatic { index } => {
            let field = pool.retrieve(*index)?;
            let field = MemberRef {
                class: text(field.class.name),
                name: text(field.name_and_type.name),
                descriptor: text(field.name_and_type.descriptor),
            };
            let is_static = matches!(insn, GetStatic { .. } | PutStatic { .. });
            if matches!(insn, GetField { .. } | GetStatic { .. }) {
                Opcode::GetField { field, is_static }
            } else {
                Opcode::PutField { field, is_static }
            }
        }

        // Objects
        New { index } => Opcode::New {
            class: text(pool.retrieve(*index)?.name),
        },
        NewArray { atype } => Opcode::NewArray {
            element: match atype {
                ArrayType::Boolean => "Z",
                ArrayType::Byte => "B",
                ArrayType::Char => "C",
                ArrayType::Float => "F",
                ArrayType::Double => "D",
                ArrayType::Short => "S",
                ArrayType::Int => "I",
                ArrayType::Long => "J",
            }
            .to_string(),
        },
        ANewArray { index } => Opcode::NewArray {
            element: element_descriptor(&text(pool.retrieve(*index)?.name)),
        },
        MultiANewArray { index, dimensions } => Opcode::MultiNewArray {
            descriptor: text(pool.retrieve(*index)?.name),
            dimensions: *dimensions,
        },
        ArrayLength => Opcode::ArrayLength,
        CheckCast { index } => Opcode::CheckCast {
            class: text(pool.retrieve(*index)?.name),
        },
        InstanceOf { index } => Opcode::InstanceOf {
            class: text(pool.retrieve(*index)?.name),
        },
        MonitorEnter => Opcode::MonitorEnter,
        MonitorExit => Opcode::MonitorExit,
        Nop => Opcode::Nop,
    })
}

/// Decodes the body of a method with code. Jump targets are resolved to absolute addresses, the
/// exception table is copied as is.
pub fn import_code<'code>(
    pool: &ConstantPool<'code>,
    signature: MethodSignature,
    code: &Code<'code>,
) -> Result<MethodBody, ImportError> {
    let code_end = code.byte_len() as u32;

    let mut instructions = Vec::new();
    let mut raw_instructions = code.raw_instructions().peekable();
    while let Some(row) = raw_instructions.next() {
        let (address, insn) = row?;
        let address = address.as_u32();
        let next_address = match raw_instructions.peek() {
            Some(next_row) => next_row.as_ref().map_err(|e| e.clone())?.0.as_u32(),
            None => code_end,
        };
        let opcode = import_instruction(pool, address, &insn)?;
        instructions.push(Instruction::new(address, next_address - address, opcode));
    }

    let mut handlers = Vec::new();
    for handler in code.exception_handlers() {
        let class = match handler.catch_type() {
            Some(catch_type) => Some(text(pool.retrieve(catch_type)?.name)),
            None => None,
        };
        handlers.push(Handler {
            start: handler.start().as_u32(),
            end: handler.end().as_u32(),
            handler: handler.handler().as_u32(),
            class,
        });
    }

    log::trace!(
        "imported {}: {} instructions, {} handlers",
        signature.name,
        instructions.len(),
        handlers.len()
    );
    Ok(MethodBody {
        signature,
        instructions,
        handlers,
        local_variables: Vec::new(),
    })
}
