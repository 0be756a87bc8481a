//! Expression building: fusing stack instructions into expression trees.
//!
//! Every reachable instruction starts out as a node of its own. Adjacent nodes are then fused
//! whenever the consumer of a value can be proven to be the only instruction that observes it,
//! which is the case when control can only flow from the producer to the consumer. Nodes that
//! can't be fused keep communicating through the operand stack, which is made explicit later on.

mod assign;
mod condition;
mod constructor;
mod node;
pub mod operator;

pub use self::condition::jump_condition;
pub use self::node::{Node, Tail};
use self::operator::{Outcome, build_operation, side_effects};
use crate::MethodContext;
use crate::ast::{Arena, ExprId};
use crate::graph::{InstructionGraph, Shuffle};
use crate::instruction::Opcode;
use crate::types::DescriptorError;
use alloc::collections::BTreeMap;
use rustc_hash::FxHashMap;

type Rule<'a> = fn(&mut Builder<'a>, u32) -> Result<Option<u32>, DescriptorError>;

struct Builder<'a> {
    ctx: &'a MethodContext<'a>,
    graph: &'a InstructionGraph<'a>,
    arena: &'a mut Arena,
    nodes: BTreeMap<u32, Node>,
    /// Incoming edges per node, kept up to date as edges are merged.
    refs: FxHashMap<u32, usize>,
}

/// Values consumed by an instruction, found in the nodes right before it.
struct Operands {
    first: u32,
    /// Bottom of the stack first.
    values: Vec<ExprId>,
    /// Statements of the earliest node, which run before any of the values are computed.
    stmts: Vec<ExprId>,
    /// Set if only the top value of an lvalue node was consumed, leaving the location in place.
    lvalue: Option<ExprId>,
}

/// Fuses the instructions of a method into as few nodes as possible.
pub fn build_expressions(
    ctx: &MethodContext<'_>,
    graph: &InstructionGraph<'_>,
    arena: &mut Arena,
) -> Result<BTreeMap<u32, Node>, DescriptorError> {
    let mut builder = Builder {
        ctx,
        graph,
        arena,
        nodes: BTreeMap::new(),
        refs: FxHashMap::default(),
    };
    builder.populate()?;
    builder.run()?;
    log::debug!(
        "{} instructions fused into {} nodes",
        graph.instructions().count(),
        builder.nodes.len()
    );
    Ok(builder.nodes)
}

impl<'a> Builder<'a> {
    fn populate(&mut self) -> Result<(), DescriptorError> {
        let graph = self.graph;
        for insn in graph.instructions() {
            let address = insn.address;
            self.refs.insert(address, graph.predecessor_count(address));

            let mut stmts = Vec::new();
            let tail = if let Some(shuffle) = graph.shuffle(address) {
                Tail::Shuffle(shuffle)
            } else if matches!(insn.opcode, Opcode::Increment { .. })
                || insn.opcode.stack_effect()?.is_none_or(|effect| effect.pops > 0)
            {
                Tail::Op(insn.opcode.clone())
            } else {
                let outcome = build_operation(self.ctx, self.arena, &insn.opcode, &[])?;
                self.outcome_tail(outcome, &mut stmts, insn.successors.len())
            };

            self.nodes.insert(
                address,
                Node {
                    address,
                    end: insn.next_address(),
                    depth: graph.stack_depth(address).unwrap_or(0),
                    stmts,
                    tail,
                    successors: insn.successors.clone(),
                },
            );
        }
        Ok(())
    }

    fn run(&mut self) -> Result<(), DescriptorError> {
        // In the order they are tried at each node.
        let rules: [Rule<'a>; 11] = [
            Self::fuse_increment,
            Self::fuse_operator,
            Self::fuse_dup_assignment,
            Self::fuse_dup_load,
            Self::fuse_post_increment,
            |builder, address| Ok(builder.fuse_compound(address)),
            Self::fuse_constructor,
            |builder, address| Ok(builder.fuse_array_initializer(address)),
            |builder, address| Ok(builder.fuse_short_circuit(address)),
            |builder, address| Ok(builder.fuse_ternary(address)),
            |builder, address| Ok(builder.fuse_sequence(address)),
        ];

        let mut cursor = self.nodes.keys().next().copied();
        'nodes: while let Some(address) = cursor {
            for rule in rules {
                if let Some(result) = rule(self, address)? {
                    // The result may enable fusion with the node before it.
                    cursor = Some(self.previous(result).unwrap_or(result));
                    continue 'nodes;
                }
            }
            cursor = self
                .nodes
                .range(address + 1..)
                .next()
                .map(|(&address, _)| address);
        }
        Ok(())
    }

    fn previous(&self, address: u32) -> Option<u32> {
        self.nodes
            .range(..address)
            .next_back()
            .map(|(&address, _)| address)
    }

    fn refs(&self, address: u32) -> usize {
        self.refs.get(&address).copied().unwrap_or(0)
    }

    /// Whether control can only reach `address` through a single explicit edge.
    fn is_simple_entry(&self, address: u32) -> bool {
        address != 0
            && self.nodes.contains_key(&address)
            && !self.graph.is_handler_target(address)
            && self.refs(address) == 1
    }

    /// The node right before `address` if it is the only way to reach `address` and simply
    /// passes control on.
    fn fusable_predecessor(&self, address: u32) -> Option<u32> {
        if !self.is_simple_entry(address) {
            return None;
        }
        let previous = self.previous(address)?;
        let node = &self.nodes[&previous];
        (node.end == address && node.successors == [address] && !node.tail.is_control())
            .then_some(previous)
    }

    /// Collects the top `count` values on entry to `address`.
    fn operands(&self, address: u32, count: usize) -> Option<Operands> {
        let mut operands = Operands {
            first: address,
            values: Vec::with_capacity(count),
            stmts: Vec::new(),
            lvalue: None,
        };
        let mut remaining = count;
        while remaining > 0 {
            let previous = self.fusable_predecessor(operands.first)?;
            let node = &self.nodes[&previous];
            match node.tail {
                Tail::Value(value) => {
                    operands.values.push(value);
                    remaining -= 1;
                }
                Tail::Lvalue { target, top } => {
                    operands.values.push(top);
                    let components: Vec<ExprId> = self.arena[target].subexprs().collect();
                    if remaining == 1 {
                        operands.lvalue = Some(target);
                    } else if remaining == components.len() + 1 {
                        operands.values.extend(components.into_iter().rev());
                    } else {
                        return None;
                    }
                    remaining = 0;
                }
                _ => return None,
            }
            if remaining > 0 && !node.stmts.is_empty() {
                return None;
            }
            operands.first = previous;
        }
        operands.values.reverse();
        operands.stmts = self.nodes[&operands.first].stmts.clone();
        Some(operands)
    }

    /// Replaces the nodes from `first` to `last`, inclusive, with a single node.
    fn collapse(&mut self, first: u32, last: u32, stmts: Vec<ExprId>, tail: Tail) -> u32 {
        let depth = self.nodes[&first].depth;
        let Node { end, successors, .. } = self.nodes[&last].clone();
        let addresses: Vec<u32> = self.nodes.range(first..=last).map(|(&a, _)| a).collect();
        for address in addresses {
            self.nodes.remove(&address);
        }
        self.nodes.insert(
            first,
            Node {
                address: first,
                end,
                depth,
                stmts,
                tail,
                successors,
            },
        );
        first
    }

    fn outcome_tail(
        &mut self,
        outcome: Outcome,
        stmts: &mut Vec<ExprId>,
        successors: usize,
    ) -> Tail {
        match outcome {
            Outcome::Nothing => Tail::FallThrough,
            Outcome::Value(value) => Tail::Value(value),
            Outcome::Stmt(stmt) => {
                stmts.push(stmt);
                Tail::FallThrough
            }
            Outcome::Stmts(effects) => {
                stmts.extend(effects);
                Tail::FallThrough
            }
            // A conditional jump to the next instruction.
            Outcome::Tail(Tail::If(condition)) if successors == 1 => {
                side_effects(self.arena, condition, stmts);
                Tail::FallThrough
            }
            Outcome::Tail(tail) => tail,
        }
    }

    /// Applies an instruction to the values computed right before it.
    fn fuse_operator(&mut self, address: u32) -> Result<Option<u32>, DescriptorError> {
        let node = &self.nodes[&address];
        let opcode = match &node.tail {
            Tail::Op(opcode) => opcode.clone(),
            &Tail::Shuffle(Shuffle::Pop { count }) => return Ok(self.fuse_pop(address, count)),
            _ => return Ok(None),
        };
        let Some(effect) = opcode.stack_effect()? else {
            return Ok(None);
        };
        if effect.pops > 0 && !node.stmts.is_empty() {
            return Ok(None);
        }
        let successors = node.successors.len();
        let Some(operands) = self.operands(address, effect.pops) else {
            return Ok(None);
        };
        if operands.lvalue.is_some() && effect.push.is_none() {
            return Ok(None);
        }

        let mut stmts = if effect.pops > 0 {
            operands.stmts
        } else {
            self.nodes[&address].stmts.clone()
        };
        let outcome = build_operation(self.ctx, self.arena, &opcode, &operands.values)?;
        let tail = match (outcome, operands.lvalue) {
            (Outcome::Value(top), Some(target)) => Tail::Lvalue { target, top },
            (_, Some(_)) => return Ok(None),
            (outcome, None) => self.outcome_tail(outcome, &mut stmts, successors),
        };
        Ok(Some(self.collapse(operands.first, address, stmts, tail)))
    }

    /// Evaluates discarded values for their side effects only.
    fn fuse_pop(&mut self, address: u32, count: usize) -> Option<u32> {
        if !self.nodes[&address].stmts.is_empty() {
            return None;
        }
        let operands = self.operands(address, count)?;
        if operands.lvalue.is_some() {
            return None;
        }
        let mut stmts = operands.stmts;
        for value in operands.values {
            side_effects(self.arena, value, &mut stmts);
        }
        Some(self.collapse(operands.first, address, stmts, Tail::FallThrough))
    }

    /// Merges straight-line code: statements followed by whatever comes next, and nodes followed
    /// by an unconditional jump nobody else targets.
    fn fuse_sequence(&mut self, address: u32) -> Option<u32> {
        let node = &self.nodes[&address];
        if node.tail.is_control() || node.successors != [node.end] {
            return None;
        }
        let next_address = node.end;
        let falls_through = matches!(node.tail, Tail::FallThrough);
        let next = self.nodes.get(&next_address)?;

        if falls_through && self.fusable_predecessor(next_address) == Some(address) {
            let mut stmts = node.stmts.clone();
            stmts.extend_from_slice(&next.stmts);
            let tail = next.tail.clone();
            return Some(self.collapse(address, next_address, stmts, tail));
        }

        if matches!(next.tail, Tail::Jump)
            && next.stmts.is_empty()
            && self.is_simple_entry(next_address)
        {
            let Node { end, successors, .. } = next.clone();
            self.nodes.remove(&next_address);
            let node = self
                .nodes
                .get_mut(&address)
                .expect("node disappeared while absorbing a jump");
            node.end = end;
            node.successors = successors;
            return Some(address);
        }

        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ast::ExprKind;
    use crate::instruction::tests::Asm;
    use crate::instruction::{
        ArithOp, ArrayKind, CompareOp, InvokeKind, JumpOperands, MemberRef, MethodSignature,
        ValueKind,
    };
    use crate::types::{BasicHierarchy, ClassHierarchy};
    use proptest::prelude::*;

    pub(crate) fn fuse(
        body: &crate::instruction::MethodBody,
        hierarchy: &dyn ClassHierarchy,
    ) -> (Arena, BTreeMap<u32, Node>) {
        let ctx = MethodContext::new(&body.signature, hierarchy).unwrap();
        let graph = InstructionGraph::new(body).unwrap();
        let mut arena = Arena::new();
        let nodes = build_expressions(&ctx, &graph, &mut arena).unwrap();
        (arena, nodes)
    }

    fn render(arena: &Arena, ids: &[ExprId]) -> Vec<String> {
        ids.iter().map(|id| arena.debug(id).to_string()).collect()
    }

    fn count_field() -> MemberRef {
        MemberRef::new("test/Test", "count", "I")
    }

    #[test]
    fn straight_line_code_collapses() {
        let h = BasicHierarchy::new();
        let body = Asm::new()
            .iload(0)
            .iconst(3)
            .arith(ArithOp::Mul)
            .istore(1)
            .invoke_static("tick", "()V")
            .iload(1)
            .invoke_static("use", "(I)V")
            .ret(None)
            .finish();
        let (arena, nodes) = fuse(&body, &h);
        assert_eq!(nodes.len(), 1);
        let node = &nodes[&0];
        assert_eq!(
            render(&arena, &node.stmts),
            ["slot1 = (slot0 * 3)", "test.Test.tick()", "test.Test.use(slot1)"]
        );
        assert!(matches!(node.tail, Tail::Return(None)));
    }

    #[test]
    fn array_compound_assignment() {
        let h = BasicHierarchy::new();
        let signature = MethodSignature::new("test/Test", "f", "([III)V", true);
        // a[i] += x, through dup2
        let body = Asm::with_signature(signature.clone())
            .aload(0)
            .iload(1)
            .op(Opcode::Dup2)
            .op(Opcode::ArrayLoad(ArrayKind::Int))
            .iload(2)
            .arith(ArithOp::Add)
            .op(Opcode::ArrayStore(ArrayKind::Int))
            .ret(None)
            .finish();
        let (arena, nodes) = fuse(&body, &h);
        assert_eq!(nodes.len(), 1);
        assert_eq!(render(&arena, &nodes[&0].stmts), ["slot0[slot1] += slot2"]);

        // The same without dup2, as some compilers emit it.
        let body = Asm::with_signature(signature)
            .aload(0)
            .iload(1)
            .aload(0)
            .iload(1)
            .op(Opcode::ArrayLoad(ArrayKind::Int))
            .iload(2)
            .arith(ArithOp::Add)
            .op(Opcode::ArrayStore(ArrayKind::Int))
            .ret(None)
            .finish();
        let (arena, nodes) = fuse(&body, &h);
        assert_eq!(nodes.len(), 1);
        assert_eq!(render(&arena, &nodes[&0].stmts), ["slot0[slot1] += slot2"]);
    }

    #[test]
    fn field_prefix_increment() {
        let h = BasicHierarchy::new();
        let signature = MethodSignature::new("test/Test", "f", "()I", false);
        // return ++this.count;
        let body = Asm::with_signature(signature)
            .aload(0)
            .op(Opcode::Dup)
            .op(Opcode::GetField {
                field: count_field(),
                is_static: false,
            })
            .iconst(1)
            .arith(ArithOp::Add)
            .op(Opcode::DupX1)
            .op(Opcode::PutField {
                field: count_field(),
                is_static: false,
            })
            .ret(Some(ValueKind::Int))
            .finish();
        let (arena, nodes) = fuse(&body, &h);
        assert_eq!(nodes.len(), 1);
        let Tail::Return(Some(value)) = nodes[&0].tail else {
            panic!("expected a return, got {:?}", nodes[&0].tail);
        };
        assert_eq!(arena.debug(&value).to_string(), "++slot0.count");
    }

    #[test]
    fn field_postfix_increment() {
        let h = BasicHierarchy::new();
        let signature = MethodSignature::new("test/Test", "f", "()I", false);
        // return this.count++;
        let body = Asm::with_signature(signature)
            .aload(0)
            .op(Opcode::Dup)
            .op(Opcode::GetField {
                field: count_field(),
                is_static: false,
            })
            .op(Opcode::DupX1)
            .iconst(1)
            .arith(ArithOp::Add)
            .op(Opcode::PutField {
                field: count_field(),
                is_static: false,
            })
            .ret(Some(ValueKind::Int))
            .finish();
        let (arena, nodes) = fuse(&body, &h);
        assert_eq!(nodes.len(), 1);
        let Tail::Return(Some(value)) = nodes[&0].tail else {
            panic!("expected a return, got {:?}", nodes[&0].tail);
        };
        assert_eq!(arena.debug(&value).to_string(), "slot0.count++");
    }

    #[test]
    fn iinc_next_to_loads() {
        let h = BasicHierarchy::new();
        // use(i++); use(++i); i += 5;
        let body = Asm::new()
            .iload(0)
            .op(Opcode::Increment { slot: 0, delta: 1 })
            .invoke_static("use", "(I)V")
            .op(Opcode::Increment { slot: 0, delta: 1 })
            .iload(0)
            .invoke_static("use", "(I)V")
            .op(Opcode::Increment { slot: 0, delta: 5 })
            .ret(None)
            .finish();
        let (arena, nodes) = fuse(&body, &h);
        assert_eq!(nodes.len(), 1);
        assert_eq!(
            render(&arena, &nodes[&0].stmts),
            ["test.Test.use(slot0++)", "test.Test.use(++slot0)", "slot0 += 5"]
        );
    }

    #[test]
    fn chained_assignment() {
        let h = BasicHierarchy::new();
        // a = b = 5
        let body = Asm::new()
            .iconst(5)
            .op(Opcode::Dup)
            .istore(1)
            .istore(2)
            .ret(None)
            .finish();
        let (arena, nodes) = fuse(&body, &h);
        assert_eq!(nodes.len(), 1);
        assert_eq!(render(&arena, &nodes[&0].stmts), ["slot2 = slot1 = 5"]);
    }

    #[test]
    fn constructors_and_array_initializers() {
        let h = BasicHierarchy::new();
        let init = MemberRef::new("java/lang/StringBuilder", "<init>", "(I)V");
        let body = Asm::new()
            .op(Opcode::New {
                class: "java/lang/StringBuilder".to_string(),
            })
            .op(Opcode::Dup)
            .iconst(16)
            .op(Opcode::Invoke {
                kind: InvokeKind::Special,
                method: init,
            })
            .astore(1)
            .iconst(2)
            .op(Opcode::NewArray {
                element: "I".to_string(),
            })
            .op(Opcode::Dup)
            .iconst(0)
            .iconst(7)
            .op(Opcode::ArrayStore(ArrayKind::Int))
            .op(Opcode::Dup)
            .iconst(1)
            .iconst(8)
            .op(Opcode::ArrayStore(ArrayKind::Int))
            .astore(2)
            .ret(None)
            .finish();
        let (arena, nodes) = fuse(&body, &h);
        assert_eq!(nodes.len(), 1);
        assert_eq!(
            render(&arena, &nodes[&0].stmts),
            [
                "slot1 = new java.lang.StringBuilder(16)",
                "slot2 = new int[] {7, 8}"
            ]
        );
    }

    #[test]
    fn short_circuit_or() {
        let h = BasicHierarchy::new();
        let body = Asm::new()
            .iload(0)
            .branch(CompareOp::Eq, JumpOperands::IntZero, "exit")
            .iload(1)
            .branch(CompareOp::Eq, JumpOperands::IntZero, "exit")
            .invoke_static("work", "()V")
            .label("exit")
            .ret(None)
            .finish();
        let (arena, nodes) = fuse(&body, &h);
        let Tail::If(condition) = nodes[&0].tail else {
            panic!("expected a branch, got {:?}", nodes[&0].tail);
        };
        assert_eq!(
            arena.debug(&condition).to_string(),
            "((slot0 == 0) || (slot1 == 0))"
        );
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn ternary_value() {
        let h = BasicHierarchy::new();
        let signature = MethodSignature::new("test/Test", "f", "(I)I", true);
        let body = Asm::with_signature(signature)
            .iload(0)
            .branch(CompareOp::Eq, JumpOperands::IntZero, "else")
            .iconst(5)
            .goto("end")
            .label("else")
            .iconst(7)
            .label("end")
            .ret(Some(ValueKind::Int))
            .finish();
        let (arena, nodes) = fuse(&body, &h);
        assert_eq!(nodes.len(), 1);
        let Tail::Return(Some(value)) = nodes[&0].tail else {
            panic!("expected a return, got {:?}", nodes[&0].tail);
        };
        assert_eq!(arena.debug(&value).to_string(), "((slot0 != 0) ? 5 : 7)");
    }

    #[test]
    fn fusion_without_joins() {
        let h = BasicHierarchy::new();
        let body = Asm::new().iconst(5).istore(1).ret(None).finish();
        let (arena, nodes) = fuse(&body, &h);
        assert_eq!(nodes.len(), 1);
        assert_eq!(render(&arena, &nodes[&0].stmts), ["slot1 = 5"]);
    }

    proptest! {
        #[test]
        fn joins_prevent_fusion(branches in 1usize..6) {
            let h = BasicHierarchy::new();
            let mut asm = Asm::new();
            asm.iconst(5);
            for _ in 0..branches {
                asm.iload(0)
                    .branch(CompareOp::Ne, JumpOperands::IntZero, "join")
                    .op(Opcode::Nop);
            }
            let body = asm.label("join").istore(1).ret(None).finish();
            let (_, nodes) = fuse(&body, &h);

            // The value reaches the store along several paths, so it has to stay on the stack.
            let store = nodes
                .values()
                .find(|node| matches!(node.tail, Tail::Op(Opcode::Store { .. })));
            prop_assert!(store.is_some());
            prop_assert!(matches!(nodes[&0].tail, Tail::Value(_)));
        }
    }

    #[test]
    fn pops_keep_side_effects() {
        let h = BasicHierarchy::new();
        let body = Asm::new()
            .invoke_static("next", "()I")
            .op(Opcode::Pop)
            .iload(0)
            .op(Opcode::Pop)
            .ret(None)
            .finish();
        let (arena, nodes) = fuse(&body, &h);
        assert_eq!(nodes.len(), 1);
        assert_eq!(render(&arena, &nodes[&0].stmts), ["test.Test.next()"]);
        assert!(matches!(arena[nodes[&0].stmts[0]].kind, ExprKind::Call { .. }));
    }
}
