//! Turns a flow graph of expression-level blocks into a tree of structured statements.

mod block;
mod cleanup;
mod dispatch;
mod exceptions;
mod flow;
mod promote;
mod structurer;
mod switch;

pub use self::block::{Case, Catch, Jump, LoopKind, StructuredBlock};
pub use self::cleanup::cleanup;
pub use self::flow::{BlockId, Clause, FlowBlock, FlowGraph};
pub use self::promote::promote;
use self::structurer::Structurer;
use crate::ast::Arena;
use crate::locals::LocalTable;
use crate::{DecompilerOptions, MethodContext};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StructureError {
    #[error("Control flow could not be structured, {blocks} blocks left")]
    Stuck { blocks: usize },

    #[error("Structuring did not finish within {0} steps")]
    Limit(usize),
}

/// Reduces `flow` to a single statement tree.
///
/// Gotos, exception clauses and blocks are consumed as they are turned into constructs. The result
/// contains no `Goto`.
pub fn structure(
    ctx: &MethodContext<'_>,
    flow: FlowGraph,
    arena: &mut Arena,
    locals: &mut LocalTable,
    options: &DecompilerOptions,
) -> Result<StructuredBlock, StructureError> {
    Structurer {
        ctx,
        flow,
        arena,
        locals,
        options,
        refs: Default::default(),
    }
    .run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::build_expressions;
    use crate::graph::InstructionGraph;
    use crate::instruction::tests::Asm;
    use crate::instruction::{
        CompareOp, JumpOperands, MethodBody, MethodSignature, Opcode, ValueKind,
    };
    use crate::locals::unify;
    use crate::types::BasicHierarchy;
    use core::mem;
    use rand::{RngCore, SeedableRng, rngs::SmallRng};

    fn structured(
        body: &MethodBody,
        options: &DecompilerOptions,
    ) -> Result<String, StructureError> {
        let h = BasicHierarchy::new();
        let ctx = MethodContext::new(&body.signature, &h).unwrap();
        let graph = InstructionGraph::new(body).unwrap();
        let mut arena = Arena::new();
        let mut locals = LocalTable::new();
        let nodes = build_expressions(&ctx, &graph, &mut arena).unwrap();
        let mut flow = promote(&ctx, &graph, nodes, &mut arena, &mut locals).unwrap();
        unify(&ctx, &mut flow, &mut arena, &mut locals, &body.local_variables);
        let mut tree = structure(&ctx, flow, &mut arena, &mut locals, options)?;
        cleanup(&ctx, &mut tree, &mut arena, options);
        Ok(arena.debug(&tree).to_string())
    }

    fn gotos(text: &str) -> bool {
        text.contains("goto")
    }

    #[test]
    fn diamond() {
        // if (x == 0) a(); else b(); c();
        let body = Asm::with_signature(MethodSignature::new("test/Test", "test", "(I)V", true))
            .iload(0)
            .branch(CompareOp::Ne, JumpOperands::IntZero, "else")
            .invoke_static("a", "()V")
            .goto("join")
            .label("else")
            .invoke_static("b", "()V")
            .label("join")
            .invoke_static("c", "()V")
            .ret(None)
            .finish();
        let text = structured(&body, &DecompilerOptions::default()).unwrap();
        assert!(!gotos(&text), "{text}");
        assert!(text.starts_with("if ("), "{text}");
        assert!(text.contains("} else {"), "{text}");
        assert!(text.ends_with("test.Test.c();\n"), "{text}");
    }

    #[test]
    fn counting_loop() {
        // for (int i = 0; i < 10; i++) use(i);
        let body = Asm::new()
            .iconst(0)
            .istore(0)
            .label("head")
            .iload(0)
            .iconst(10)
            .branch(CompareOp::Ge, JumpOperands::IntPair, "exit")
            .iload(0)
            .invoke_static("use", "(I)V")
            .op(Opcode::Increment { slot: 0, delta: 1 })
            .goto("head")
            .label("exit")
            .ret(None)
            .finish();
        let text = structured(&body, &DecompilerOptions::default()).unwrap();
        assert!(!gotos(&text), "{text}");
        assert!(text.starts_with("v"), "{text}");
        assert!(text.contains("\nwhile ((v"), "{text}");
        assert!(text.contains(" < 10)) {\n"), "{text}");
        assert!(!text.contains("while (true)"), "{text}");
        assert!(!text.contains("break"), "{text}");
        assert!(!text.contains("continue"), "{text}");
    }

    #[test]
    fn loop_exit_follows_the_loop() {
        // int i = 0; while (i < 10) i++; return i;
        let body = Asm::with_signature(MethodSignature::new("test/Test", "test", "()I", true))
            .iconst(0)
            .istore(0)
            .label("head")
            .iload(0)
            .iconst(10)
            .branch(CompareOp::Ge, JumpOperands::IntPair, "exit")
            .op(Opcode::Increment { slot: 0, delta: 1 })
            .goto("head")
            .label("exit")
            .iload(0)
            .ret(Some(ValueKind::Int))
            .finish();
        let text = structured(&body, &DecompilerOptions::default()).unwrap();
        assert!(!gotos(&text), "{text}");
        assert!(text.contains("\nwhile ((v"), "{text}");
        assert!(text.contains("++;\n}\nreturn v"), "{text}");
        assert!(!text.contains("while (true)"), "{text}");
        assert!(!text.contains("continue"), "{text}");
    }

    #[test]
    fn switch_with_fallthrough() {
        let body = Asm::with_signature(MethodSignature::new("test/Test", "test", "(I)V", true))
            .iload(0)
            .switch(&[(1, "one"), (2, "two")], "done")
            .label("one")
            .invoke_static("a", "()V")
            .label("two")
            .invoke_static("b", "()V")
            .goto("done")
            .label("done")
            .ret(None)
            .finish();
        let text = structured(&body, &DecompilerOptions::default()).unwrap();
        assert!(!gotos(&text), "{text}");
        assert!(text.contains("switch ("), "{text}");
        assert!(text.contains("case 1: "), "{text}");
        assert!(!text.contains("default"), "{text}");
    }

    #[test]
    fn loops_with_two_entries_use_a_dispatcher() {
        // if (x != 0) goto second; first: a(); second: b(); if (y != 0) goto first;
        let body = Asm::with_signature(MethodSignature::new("test/Test", "test", "(II)V", true))
            .iload(0)
            .branch(CompareOp::Ne, JumpOperands::IntZero, "second")
            .label("first")
            .invoke_static("a", "()V")
            .label("second")
            .invoke_static("b", "()V")
            .iload(1)
            .branch(CompareOp::Ne, JumpOperands::IntZero, "first")
            .ret(None)
            .finish();
        let text = structured(&body, &DecompilerOptions::default()).unwrap();
        assert!(!gotos(&text), "{text}");
        assert!(text.contains("switch ("), "{text}");
        assert!(text.contains("test.Test.a();"), "{text}");
        assert!(text.contains("test.Test.b();"), "{text}");
    }

    #[test]
    fn try_catch() {
        let body = Asm::new()
            .label("start")
            .invoke_static("a", "()V")
            .label("end")
            .goto("done")
            .label("handler")
            .astore(0)
            .invoke_static("b", "()V")
            .label("done")
            .ret(None)
            .handler("start", "end", "handler", Some("java/lang/Exception"))
            .finish();
        let text = structured(&body, &DecompilerOptions::default()).unwrap();
        assert!(!gotos(&text), "{text}");
        assert!(
            text.starts_with("try {\n    test.Test.a();\n} catch (java.lang.Exception "),
            "{text}"
        );
        assert!(text.contains("    test.Test.b();\n}"), "{text}");
    }

    #[test]
    fn try_finally_keeps_one_copy() {
        // try { a(); } finally { f(); }
        let body = Asm::new()
            .label("start")
            .invoke_static("a", "()V")
            .label("end")
            .invoke_static("f", "()V")
            .goto("done")
            .label("handler")
            .astore(0)
            .invoke_static("f", "()V")
            .aload(0)
            .op(Opcode::Throw)
            .label("done")
            .ret(None)
            .handler("start", "end", "handler", None)
            .finish();
        let text = structured(&body, &DecompilerOptions::default()).unwrap();
        assert_eq!(text.matches("test.Test.f()").count(), 1, "{text}");
        assert!(text.contains("} finally {"), "{text}");

        let options = DecompilerOptions {
            merge_finally: false,
            ..DecompilerOptions::default()
        };
        let text = structured(&body, &options).unwrap();
        assert_eq!(text.matches("test.Test.f()").count(), 2, "{text}");
        assert!(text.contains("catch (* "), "{text}");
    }

    #[derive(Clone, Copy, Debug)]
    enum Exit {
        Fall,
        Return,
        Goto(usize),
        Branch(usize),
    }

    const BLOCKS: [&str; 6] = ["b0", "b1", "b2", "b3", "b4", "b5"];

    fn random_exits(rng: &mut SmallRng) -> Vec<Exit> {
        let len = 2 + rng.next_u32() as usize % (BLOCKS.len() - 1);
        (0..len)
            .map(|i| {
                let target = rng.next_u32() as usize % len;
                let last = i + 1 == len;
                match rng.next_u32() % 4 {
                    0 if !last => Exit::Fall,
                    1 if !last => Exit::Branch(target),
                    2 => Exit::Goto(target),
                    _ => Exit::Return,
                }
            })
            .collect()
    }

    /// Block `i` calls `m{i}()` and then leaves through `exits[i]`.
    fn method_with_exits(exits: &[Exit]) -> MethodBody {
        let mut asm = Asm::with_signature(MethodSignature::new("test/Test", "test", "(I)V", true));
        for (i, &exit) in exits.iter().enumerate() {
            asm.label(BLOCKS[i]).invoke_static(&format!("m{i}"), "()V");
            match exit {
                Exit::Fall => {}
                Exit::Return => {
                    asm.ret(None);
                }
                Exit::Goto(j) => {
                    asm.goto(BLOCKS[j]);
                }
                Exit::Branch(j) => {
                    asm.iload(0)
                        .branch(CompareOp::Eq, JumpOperands::IntZero, BLOCKS[j]);
                }
            }
        }
        asm.finish()
    }

    fn reachable(exits: &[Exit]) -> Vec<bool> {
        let mut seen = vec![false; exits.len()];
        let mut stack = vec![0];
        while let Some(i) = stack.pop() {
            if mem::replace(&mut seen[i], true) {
                continue;
            }
            match exits[i] {
                Exit::Fall => stack.push(i + 1),
                Exit::Return => {}
                Exit::Goto(j) => stack.push(j),
                Exit::Branch(j) => stack.extend([i + 1, j]),
            }
        }
        seen
    }

    /// Labels named by `break` and `continue` statements.
    fn jump_labels(text: &str) -> Vec<&str> {
        let mut labels = Vec::new();
        for keyword in ["break ", "continue "] {
            for (at, _) in text.match_indices(keyword) {
                let rest = &text[at + keyword.len()..];
                let end = rest.find(';').unwrap_or(rest.len());
                labels.push(&rest[..end]);
            }
        }
        labels
    }

    #[test]
    fn random_flow_keeps_every_block() {
        let mut rng = SmallRng::seed_from_u64(0xb10c);
        for _ in 0..500 {
            let exits = random_exits(&mut rng);
            let body = method_with_exits(&exits);
            let text = structured(&body, &DecompilerOptions::default())
                .unwrap_or_else(|err| panic!("{exits:?}: {err}"));
            assert!(!gotos(&text), "{exits:?}\n{text}");
            for (i, live) in reachable(&exits).into_iter().enumerate() {
                let calls = text.matches(&format!("test.Test.m{i}();")).count();
                assert_eq!(calls, usize::from(live), "block {i} of {exits:?}\n{text}");
            }
            for label in jump_labels(&text) {
                assert!(
                    text.contains(&format!("{label}: ")),
                    "{label} is not defined in {exits:?}\n{text}"
                );
            }
        }
    }
}
