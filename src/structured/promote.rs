//! Turning fused nodes into flow blocks.
//!
//! Values that fusion couldn't attach to their consumers still travel through the operand stack.
//! Here every such stack position becomes a pseudo-variable: producers assign to `stackN`,
//! consumers read from it, and shuffles become copies. Local unification later turns these into
//! ordinary variables, exactly like bytecode slots.

use super::block::{Case, Jump, StructuredBlock};
use super::flow::{BlockId, Clause, FlowBlock, FlowGraph};
use crate::MethodContext;
use crate::ast::simplify::negate;
use crate::ast::{Arena, ExprId, ExprKind};
use crate::expr::operator::{Outcome, assign, build_operation, declared, side_effects};
use crate::expr::{Node, Tail};
use crate::graph::{InstructionGraph, Shuffle};
use crate::locals::{LocalTable, SlotKey};
use crate::types::{DescriptorError, SimpleType, THROWABLE, Type};
use crate::utils::merge_overlapping_ranges;
use alloc::collections::{BTreeMap, BTreeSet};
use rustc_hash::FxHashMap;

/// Builds the flow graph of a method from its fused nodes, one block per node.
pub fn promote(
    ctx: &MethodContext<'_>,
    graph: &InstructionGraph<'_>,
    nodes: BTreeMap<u32, Node>,
    arena: &mut Arena,
    locals: &mut LocalTable,
) -> Result<FlowGraph, DescriptorError> {
    let ids: FxHashMap<u32, BlockId> = nodes
        .keys()
        .enumerate()
        .map(|(index, &address)| (address, BlockId(index as u32)))
        .collect();

    let mut flow = FlowGraph::new();
    flow.entry = ids[&0];
    add_clauses(ctx, graph, &ids, &mut flow, locals);

    let throwing: BTreeSet<u32> = graph
        .instructions()
        .filter(|insn| insn.opcode.can_throw())
        .map(|insn| insn.address)
        .collect();

    let mut promoter = Promoter {
        ctx,
        arena,
        flow: &mut flow,
        ids: &ids,
    };
    for node in nodes.into_values() {
        let (address, end) = (node.address, node.end);
        let content = promoter.node(node)?;
        let region: Vec<usize> = promoter
            .flow
            .clauses
            .iter()
            .enumerate()
            .filter(|(_, clause)| clause.contains(address))
            .map(|(index, _)| index)
            .collect();
        let can_throw = throwing.range(address..end).next().is_some();
        promoter.flow.push(FlowBlock {
            address,
            end,
            content,
            coverage: if can_throw { region.clone() } else { Vec::new() },
            region,
            can_throw,
        });
    }

    log::debug!(
        "{} flow blocks, {} catch clauses",
        flow.len(),
        flow.clauses.len()
    );
    Ok(flow)
}

/// Groups exception table entries into clauses.
///
/// Consecutive entries with the same handler and caught type are assumed to stem from a single
/// `catch`, since that's what javac emits for a `try` block split by nested constructs.
fn add_clauses(
    ctx: &MethodContext<'_>,
    graph: &InstructionGraph<'_>,
    ids: &FxHashMap<u32, BlockId>,
    flow: &mut FlowGraph,
    locals: &mut LocalTable,
) {
    for chunk in graph
        .handlers()
        .chunk_by(|a, b| (a.handler, &a.class) == (b.handler, &b.class))
    {
        let first = &chunk[0];
        let Some(&handler) = ids.get(&first.handler) else {
            continue;
        };
        let mut ranges: Vec<_> = chunk.iter().map(|entry| entry.start..entry.end).collect();
        merge_overlapping_ranges(&mut ranges);

        let caught = SimpleType::class(first.class.as_deref().unwrap_or(THROWABLE), ctx.hierarchy);
        let binder = locals.fresh(SlotKey::Stack(0), declared(caught));
        flow.clauses.push(Clause {
            ranges,
            handler,
            class: first.class.clone(),
            binder,
            formed: false,
        });
    }
}

struct Promoter<'a, 'b> {
    ctx: &'a MethodContext<'a>,
    arena: &'b mut Arena,
    flow: &'b mut FlowGraph,
    ids: &'b FxHashMap<u32, BlockId>,
}

impl Promoter<'_, '_> {
    fn node(&mut self, node: Node) -> Result<StructuredBlock, DescriptorError> {
        let Node {
            depth,
            stmts,
            tail,
            successors,
            ..
        } = node;
        let targets: Vec<BlockId> = successors.iter().map(|address| self.ids[address]).collect();
        let mut items: Vec<StructuredBlock> =
            stmts.into_iter().map(StructuredBlock::Statement).collect();

        match tail {
            Tail::Op(opcode) => {
                let effect = opcode
                    .stack_effect()?
                    .expect("shuffles and subroutines never reach promotion");
                let base = depth - effect.pops;
                let operands: Vec<ExprId> = (base..depth).map(|i| self.read(i)).collect();
                match build_operation(self.ctx, self.arena, &opcode, &operands)? {
                    Outcome::Nothing => {}
                    Outcome::Value(value) => items.push(self.write(base, value)),
                    Outcome::Stmt(stmt) => items.push(StructuredBlock::Statement(stmt)),
                    Outcome::Stmts(stmts) => {
                        items.extend(stmts.into_iter().map(StructuredBlock::Statement));
                    }
                    Outcome::Tail(tail) => {
                        self.exit(tail, &targets, &mut items);
                        return Ok(StructuredBlock::sequence(items));
                    }
                }
                items.push(StructuredBlock::Goto(targets[0]));
            }
            Tail::Shuffle(shuffle) => {
                self.shuffle(shuffle, depth, &mut items);
                items.push(StructuredBlock::Goto(targets[0]));
            }
            Tail::Value(value) => {
                items.push(self.write(depth, value));
                items.push(StructuredBlock::Goto(targets[0]));
            }
            Tail::Lvalue { target, top } => {
                let components: Vec<ExprId> = self.arena[target].subexprs().collect();
                for (i, &component) in components.iter().enumerate() {
                    items.push(self.write(depth + i, component));
                }
                items.push(self.write(depth + components.len(), top));
                items.push(StructuredBlock::Goto(targets[0]));
            }
            tail => self.exit(tail, &targets, &mut items),
        }
        Ok(StructuredBlock::sequence(items))
    }

    /// Emits the way out of a block that ends with a control transfer.
    fn exit(&mut self, tail: Tail, targets: &[BlockId], items: &mut Vec<StructuredBlock>) {
        match tail {
            Tail::FallThrough | Tail::Jump => items.push(StructuredBlock::Goto(targets[0])),
            Tail::If(condition) => match *targets {
                [fallthrough, jump] => {
                    // The jump usually skips the code written first in the source.
                    let condition = negate(self.arena, condition);
                    items.push(StructuredBlock::If {
                        condition,
                        then: Box::new(StructuredBlock::Goto(fallthrough)),
                        otherwise: Some(Box::new(StructuredBlock::Goto(jump))),
                    });
                }
                _ => {
                    let mut effects = Vec::new();
                    side_effects(self.arena, condition, &mut effects);
                    items.extend(effects.into_iter().map(StructuredBlock::Statement));
                    items.push(StructuredBlock::Goto(targets[0]));
                }
            },
            Tail::Switch {
                selector,
                cases,
                default,
            } => {
                let label = self.flow.fresh_label();
                items.push(StructuredBlock::Switch {
                    label: Some(label),
                    selector,
                    cases: self.switch_cases(&cases, default),
                });
            }
            Tail::Return(value) => items.push(StructuredBlock::Jump(Jump::Return(value))),
            Tail::Throw(value) => items.push(StructuredBlock::Jump(Jump::Throw(value))),
            Tail::Op(_) | Tail::Shuffle(_) | Tail::Value(_) | Tail::Lvalue { .. } => {
                unreachable!("not a control transfer")
            }
        }
    }

    /// One case per distinct target, in code order.
    fn switch_cases(&self, cases: &[(i32, u32)], default: u32) -> Vec<Case> {
        let mut grouped: Vec<(u32, Case)> = Vec::new();
        let entries = cases
            .iter()
            .map(|&(value, target)| (Some(value), target))
            .chain([(None, default)]);
        for (value, target) in entries {
            let index = match grouped.iter().position(|(address, _)| *address == target) {
                Some(index) => index,
                None => {
                    grouped.push((
                        target,
                        Case {
                            values: Vec::new(),
                            is_default: false,
                            body: StructuredBlock::Goto(self.ids[&target]),
                        },
                    ));
                    grouped.len() - 1
                }
            };
            let case = &mut grouped[index].1;
            match value {
                Some(value) => case.values.push(value),
                None => case.is_default = true,
            }
        }
        grouped.sort_by_key(|(address, _)| *address);
        grouped.into_iter().map(|(_, case)| case).collect()
    }

    /// Copies between stack positions. Targets that are still read as sources go through
    /// temporaries first.
    fn shuffle(&mut self, shuffle: Shuffle, depth: usize, items: &mut Vec<StructuredBlock>) {
        let mut layout: Vec<usize> = (0..depth).collect();
        shuffle.apply(&mut layout);
        let moves: Vec<(usize, usize)> = layout
            .iter()
            .enumerate()
            .filter(|&(target, &source)| target != source)
            .map(|(target, &source)| (target, source))
            .collect();

        if moves.iter().all(|&(target, _)| target >= depth) {
            for (target, source) in moves {
                let value = self.read(source);
                items.push(self.write(target, value));
            }
            return;
        }

        let mut temporaries: Vec<(usize, SlotKey)> = Vec::new();
        for &(_, source) in &moves {
            if temporaries.iter().all(|&(saved, _)| saved != source) {
                let key = self.flow.fresh_synthetic();
                let value = self.read(source);
                let target = self.arena.add(ExprKind::Slot(key), Type::UNKNOWN);
                items.push(StructuredBlock::Statement(assign(self.arena, target, value)));
                temporaries.push((source, key));
            }
        }
        for (target, source) in moves {
            let (_, key) = temporaries
                .iter()
                .find(|&&(saved, _)| saved == source)
                .expect("every source was saved");
            let value = self.arena.add(ExprKind::Slot(*key), Type::UNKNOWN);
            items.push(self.write(target, value));
        }
    }

    fn read(&mut self, position: usize) -> ExprId {
        self.arena.add(
            ExprKind::Slot(SlotKey::Stack(position as u16)),
            Type::UNKNOWN,
        )
    }

    fn write(&mut self, position: usize, value: ExprId) -> StructuredBlock {
        let ty = self.arena[value].ty.clone();
        let target = self
            .arena
            .add(ExprKind::Slot(SlotKey::Stack(position as u16)), ty);
        StructuredBlock::Statement(assign(self.arena, target, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::build_expressions;
    use crate::instruction::tests::Asm;
    use crate::instruction::{CompareOp, JumpOperands, MethodSignature};
    use crate::types::BasicHierarchy;

    fn statements(arena: &Arena, flow: &FlowGraph) -> Vec<String> {
        let mut out = Vec::new();
        for (_, block) in flow.blocks() {
            block.content.visit(&mut |block| {
                if let StructuredBlock::Statement(expr) = block {
                    out.push(arena.debug(expr).to_string());
                }
            });
        }
        out
    }

    #[test]
    fn values_live_across_joins_use_the_stack() {
        let h = BasicHierarchy::new();
        let signature = MethodSignature::new("test/Test", "f", "(I)V", true);
        let body = Asm::with_signature(signature)
            .iload(0)
            .branch(CompareOp::Eq, JumpOperands::IntZero, "else")
            .invoke_static("tick", "()V")
            .iconst(1)
            .goto("join")
            .label("else")
            .iconst(2)
            .label("join")
            .invoke_static("use", "(I)V")
            .ret(None)
            .finish();

        let ctx = MethodContext::new(&body.signature, &h).unwrap();
        let graph = InstructionGraph::new(&body).unwrap();
        let mut arena = Arena::new();
        let mut locals = LocalTable::new();
        let nodes = build_expressions(&ctx, &graph, &mut arena).unwrap();
        let flow = promote(&ctx, &graph, nodes, &mut arena, &mut locals).unwrap();

        let statements = statements(&arena, &flow);
        for expected in ["stack0 = 1", "stack0 = 2", "test.Test.use(stack0)"] {
            assert!(
                statements.iter().any(|s| s == expected),
                "missing {expected} in {statements:?}"
            );
        }
        assert_eq!(flow.entry, BlockId(0));
        assert!(flow.clauses.is_empty());
        assert!(flow.blocks().all(|(_, block)| block.content.diverges()));
    }

    #[test]
    fn adjacent_handler_entries_form_one_clause() {
        let h = BasicHierarchy::new();
        let body = Asm::new()
            .label("a")
            .invoke_static("a", "()V")
            .label("b")
            .invoke_static("b", "()V")
            .label("c")
            .ret(None)
            .label("catch")
            .astore(0)
            .ret(None)
            .handler("a", "b", "catch", Some("java/lang/Exception"))
            .handler("b", "c", "catch", Some("java/lang/Exception"))
            .finish();

        let ctx = MethodContext::new(&body.signature, &h).unwrap();
        let graph = InstructionGraph::new(&body).unwrap();
        let mut arena = Arena::new();
        let mut locals = LocalTable::new();
        let nodes = build_expressions(&ctx, &graph, &mut arena).unwrap();
        let flow = promote(&ctx, &graph, nodes, &mut arena, &mut locals).unwrap();

        assert_eq!(flow.clauses.len(), 1);
        assert_eq!(flow.clauses[0].ranges, [0..6]);
        let handler = flow.get(flow.clauses[0].handler).unwrap();
        assert!(
            arena
                .debug(&handler.content)
                .to_string()
                .starts_with("slot0 = stack0;\n")
        );
        // The calls are covered, the return after the range is not.
        for (_, block) in flow.blocks() {
            let covered = block.address < 6;
            assert_eq!(block.coverage == [0], covered, "{}", block.address);
        }
    }
}
