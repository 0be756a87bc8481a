//! Control flow and expression recovery for JVM method bodies.
//!
//! A method goes through these stages:
//!
//! 1. [`graph::InstructionGraph`] validates the instruction stream and computes stack shapes.
//! 2. [`expr::build_expressions`] folds the stack machine into expression trees, one node per run
//!    of instructions without joins.
//! 3. [`structured::promote`] turns values that survive across nodes into synthetic locals,
//!    producing a graph of statement blocks.
//! 4. [`locals::unify`] splits and merges slots into logical variables.
//! 5. [`structured::structure`] replaces the gotos with loops, conditionals, switches and
//!    exception handling, and [`structured::cleanup`] polishes the result.
//!
//! Types are tracked throughout as ranges, see [`types`].

extern crate alloc;

pub mod ast;
pub mod expr;
pub mod graph;
pub mod import;
pub mod instruction;
pub mod locals;
pub mod structured;
pub mod types;
mod union_find;
mod utils;

use crate::ast::Arena;
use crate::graph::{GraphError, InstructionGraph};
use crate::import::ImportError;
use crate::instruction::{MethodBody, MethodSignature};
use crate::locals::LocalTable;
use crate::structured::{StructureError, StructuredBlock};
use crate::types::{ClassHierarchy, DescriptorError, SimpleType, parse_method_descriptor};
use core::fmt::{self, Display};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MethodDecompileError {
    #[error("While analyzing control flow: {0}")]
    Graph(#[from] GraphError),

    #[error("While importing bytecode: {0}")]
    Import(#[from] ImportError),

    #[error("While parsing descriptors: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("While structuring control flow: {0}")]
    Structure(#[from] StructureError),
}

/// Switches for the optional parts of structuring. Everything is on by default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecompilerOptions {
    /// Recognize the copies of `finally` blocks compilers inline into every exit of a `try`.
    pub merge_finally: bool,
    /// Rebuild `synchronized` blocks from monitor instructions.
    pub detect_synchronized: bool,
    /// Remove redundant labels, invert conditions and give loops their conditions.
    pub simplify: bool,
}

impl Default for DecompilerOptions {
    fn default() -> Self {
        Self {
            merge_finally: true,
            detect_synchronized: true,
            simplify: true,
        }
    }
}

/// Per-method facts shared by all stages.
pub struct MethodContext<'a> {
    pub signature: &'a MethodSignature,
    pub hierarchy: &'a dyn ClassHierarchy,
    pub return_type: SimpleType,
    /// Local slots initialized on entry, with their types. The receiver comes first.
    pub parameters: Vec<(u16, SimpleType)>,
}

impl<'a> MethodContext<'a> {
    pub fn new(
        signature: &'a MethodSignature,
        hierarchy: &'a dyn ClassHierarchy,
    ) -> Result<Self, DescriptorError> {
        let types = parse_method_descriptor(&signature.descriptor, hierarchy)?;
        Ok(Self {
            signature,
            hierarchy,
            return_type: types.return_type,
            parameters: signature.parameter_slots(hierarchy)?,
        })
    }
}

/// A structured method body, along with the expressions and variables it refers to.
#[derive(Debug)]
pub struct DecompiledMethod {
    pub body: StructuredBlock,
    pub arena: Arena,
    pub locals: LocalTable,
}

impl Display for DecompiledMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, info) in self.locals.variables() {
            write!(f, "// {id}: {}", info.ty)?;
            if let Some(name) = &info.name {
                write!(f, " {name}")?;
            }
            if info.is_parameter {
                write!(f, " (parameter)")?;
            }
            writeln!(f)?;
        }
        write!(f, "{}", self.arena.debug(&self.body))
    }
}

/// Decompiles one method body.
///
/// Only malformed input fails. Control flow that no construct matches still produces a body, with
/// the offending region behind a `switch` dispatcher.
pub fn decompile_method(
    body: &MethodBody,
    hierarchy: &dyn ClassHierarchy,
    options: &DecompilerOptions,
) -> Result<DecompiledMethod, MethodDecompileError> {
    let ctx = MethodContext::new(&body.signature, hierarchy)?;
    let graph = InstructionGraph::new(body)?;

    let mut arena = Arena::new();
    let mut locals = LocalTable::new();
    let nodes = expr::build_expressions(&ctx, &graph, &mut arena)?;
    log::trace!("{}: {} expression nodes", body.signature.name, nodes.len());
    let mut flow = structured::promote(&ctx, &graph, nodes, &mut arena, &mut locals)?;
    locals::unify(&ctx, &mut flow, &mut arena, &mut locals, &body.local_variables);

    let mut tree = structured::structure(&ctx, flow, &mut arena, &mut locals, options)?;
    structured::cleanup(&ctx, &mut tree, &mut arena, options);

    Ok(DecompiledMethod {
        body: tree,
        arena,
        locals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::tests::Asm;
    use crate::instruction::{ArithOp, CompareOp, JumpOperands, Opcode, ValueKind};
    use crate::types::BasicHierarchy;

    fn decompile(body: &MethodBody) -> String {
        let h = BasicHierarchy::new();
        let method = decompile_method(body, &h, &DecompilerOptions::default()).unwrap();
        method.arena.debug(&method.body).to_string()
    }

    #[test]
    fn arithmetic_return() {
        let body = Asm::with_signature(MethodSignature::new("test/Test", "add", "(II)I", true))
            .iload(0)
            .iload(1)
            .arith(ArithOp::Add)
            .ret(Some(ValueKind::Int))
            .finish();
        let text = decompile(&body);
        assert!(text.starts_with("return (v"), "{text}");
        assert!(text.ends_with(");\n"), "{text}");
        assert!(text.contains(" + v"), "{text}");
    }

    #[test]
    fn conditions_combine() {
        // if (a && b) work();
        let body = Asm::with_signature(MethodSignature::new("test/Test", "test", "(ZZ)V", true))
            .iload(0)
            .branch(CompareOp::Eq, JumpOperands::IntZero, "exit")
            .iload(1)
            .branch(CompareOp::Eq, JumpOperands::IntZero, "exit")
            .invoke_static("work", "()V")
            .label("exit")
            .ret(None)
            .finish();
        let text = decompile(&body);
        assert!(text.starts_with("if ("), "{text}");
        assert!(text.contains("&&"), "{text}");
        assert!(text.contains("    test.Test.work();\n}"), "{text}");
        assert!(!text.contains("goto"), "{text}");
        assert!(!text.contains("return"), "{text}");
    }

    #[test]
    fn receiver_is_named() {
        let body = Asm::with_signature(MethodSignature::new("test/Test", "get", "()I", false))
            .iconst(3)
            .ret(Some(ValueKind::Int))
            .finish();
        let h = BasicHierarchy::new();
        let method = decompile_method(&body, &h, &DecompilerOptions::default()).unwrap();
        let text = method.to_string();
        assert!(text.contains(" this (parameter)\n"), "{text}");
        assert!(text.ends_with("return 3;\n"), "{text}");
    }

    fn synchronized_body(detect_synchronized: bool) -> String {
        // synchronized (o) { a(); }
        let signature = MethodSignature::new("test/Test", "test", "(Ljava/lang/Object;)V", true);
        let body = Asm::with_signature(signature)
            .aload(0)
            .op(Opcode::Dup)
            .astore(1)
            .op(Opcode::MonitorEnter)
            .label("start")
            .invoke_static("a", "()V")
            .aload(1)
            .op(Opcode::MonitorExit)
            .label("end")
            .goto("done")
            .label("handler")
            .astore(2)
            .aload(1)
            .op(Opcode::MonitorExit)
            .label("handler_end")
            .aload(2)
            .op(Opcode::Throw)
            .label("done")
            .ret(None)
            .handler("start", "end", "handler", None)
            .handler("handler", "handler_end", "handler", None)
            .finish();
        let h = BasicHierarchy::new();
        let options = DecompilerOptions {
            detect_synchronized,
            ..DecompilerOptions::default()
        };
        let method = decompile_method(&body, &h, &options).unwrap();
        method.arena.debug(&method.body).to_string()
    }

    #[test]
    fn monitors_become_synchronized() {
        let text = synchronized_body(true);
        assert!(text.starts_with("synchronized (v"), "{text}");
        assert!(text.ends_with(") {\n    test.Test.a();\n}\n"), "{text}");
        assert!(!text.contains("monitor"), "{text}");

        let text = synchronized_body(false);
        assert_eq!(text.matches("monitorexit(").count(), 1, "{text}");
        assert!(text.contains("} finally {"), "{text}");
    }

    #[test]
    fn malformed_input_is_reported() {
        let h = BasicHierarchy::new();
        let options = DecompilerOptions::default();

        let jsr = Asm::new().op(Opcode::Jsr { target: 0 }).finish();
        assert!(matches!(
            decompile_method(&jsr, &h, &options).unwrap_err(),
            MethodDecompileError::Graph(GraphError::Subroutine(0))
        ));

        let bad_descriptor =
            Asm::with_signature(MethodSignature::new("test/Test", "test", "(Q)V", true))
                .ret(None)
                .finish();
        assert!(matches!(
            decompile_method(&bad_descriptor, &h, &options).unwrap_err(),
            MethodDecompileError::Descriptor(_)
        ));
    }
}
