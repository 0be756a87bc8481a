//! Instruction-level control flow graph.
//!
//! Besides indexing instructions and counting references, this computes the operand stack shape
//! at each reachable instruction. The shape is needed twice later on: to resolve the
//! category-dependent forms of `pop2` and `dup2*`, and to name the synthetic locals values live
//! across blocks are promoted to.

use crate::instruction::{Category, Handler, Instruction, MethodBody, Opcode};
use crate::types::DescriptorError;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Method has no code")]
    Empty,

    #[error("Instruction at {0} does not start where the previous one ends")]
    Gap(u32),

    #[error("Instruction at {from} jumps to {to}, which is not an instruction boundary")]
    BadTarget { from: u32, to: u32 },

    #[error("Successors listed for the instruction at {0} do not match its opcode")]
    BadSuccessors(u32),

    #[error("Exception handler {start}..{end} -> {handler} refers to a nonexistent address")]
    BadHandler { start: u32, end: u32, handler: u32 },

    #[error("Execution falls off the end of code after {0}")]
    FallsOffEnd(u32),

    #[error("Stack underflow at {0}")]
    StackUnderflow(u32),

    #[error("Paths reach {0} with different stack shapes")]
    InconsistentStack(u32),

    #[error("Stack operation at {0} splits a long or double value")]
    WrongCategory(u32),

    #[error("Subroutines (jsr/ret) are not supported, found at {0}")]
    Subroutine(u32),

    #[error("Invalid descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
}

/// A stack permutation instruction with its category-dependent form resolved.
///
/// All counts are in values, not slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shuffle {
    /// Drops `count` values.
    Pop { count: usize },
    /// Copies the top `count` values below the `skip` values under them.
    Dup { count: usize, skip: usize },
    Swap,
}

impl Shuffle {
    pub fn pops(self) -> usize {
        match self {
            Self::Pop { count } => count,
            Self::Dup { count, skip } => count + skip,
            Self::Swap => 2,
        }
    }

    pub fn pushes(self) -> usize {
        match self {
            Self::Pop { .. } => 0,
            Self::Dup { count, skip } => 2 * count + skip,
            Self::Swap => 2,
        }
    }

    /// Applies the shuffle to a stack, top last.
    pub fn apply<T: Clone>(self, stack: &mut Vec<T>) {
        match self {
            Self::Pop { count } => stack.truncate(stack.len() - count),
            Self::Dup { count, skip } => {
                let top = stack[stack.len() - count..].to_vec();
                let at = stack.len() - count - skip;
                stack.splice(at..at, top);
            }
            Self::Swap => {
                let len = stack.len();
                stack.swap(len - 1, len - 2);
            }
        }
    }
}

fn resolve_shuffle(
    opcode: &Opcode,
    stack: &[Category],
    address: u32,
) -> Result<Shuffle, GraphError> {
    use Category::{Double as D, Single as S};

    // Categories from the top of the stack downwards.
    let mut top = stack.iter().rev().copied();
    let mut next = || top.next().ok_or(GraphError::StackUnderflow(address));
    let wrong = Err(GraphError::WrongCategory(address));

    // Java's "form" terminology counts slots, we count values: `dup2` on a long copies one value.
    Ok(match opcode {
        Opcode::Pop => match next()? {
            S => Shuffle::Pop { count: 1 },
            D => return wrong,
        },
        Opcode::Pop2 => match next()? {
            D => Shuffle::Pop { count: 1 },
            S => match next()? {
                S => Shuffle::Pop { count: 2 },
                D => return wrong,
            },
        },
        Opcode::Dup => match next()? {
            S => Shuffle::Dup { count: 1, skip: 0 },
            D => return wrong,
        },
        Opcode::DupX1 => match (next()?, next()?) {
            (S, S) => Shuffle::Dup { count: 1, skip: 1 },
            _ => return wrong,
        },
        Opcode::DupX2 => match (next()?, next()?) {
            (S, D) => Shuffle::Dup { count: 1, skip: 1 },
            (S, S) => match next()? {
                S => Shuffle::Dup { count: 1, skip: 2 },
                D => return wrong,
            },
            _ => return wrong,
        },
        Opcode::Dup2 => match next()? {
            D => Shuffle::Dup { count: 1, skip: 0 },
            S => match next()? {
                S => Shuffle::Dup { count: 2, skip: 0 },
                D => return wrong,
            },
        },
        Opcode::Dup2X1 => match (next()?, next()?) {
            (D, S) => Shuffle::Dup { count: 1, skip: 1 },
            (S, S) => match next()? {
                S => Shuffle::Dup { count: 2, skip: 1 },
                D => return wrong,
            },
            _ => return wrong,
        },
        Opcode::Dup2X2 => match (next()?, next()?) {
            (D, D) => Shuffle::Dup { count: 1, skip: 1 },
            (D, S) => match next()? {
                S => Shuffle::Dup { count: 1, skip: 2 },
                D => return wrong,
            },
            (S, S) => match next()? {
                D => Shuffle::Dup { count: 2, skip: 1 },
                S => match next()? {
                    S => Shuffle::Dup { count: 2, skip: 2 },
                    D => return wrong,
                },
            },
            (S, D) => return wrong,
        },
        Opcode::Swap => match (next()?, next()?) {
            (S, S) => Shuffle::Swap,
            _ => return wrong,
        },
        _ => unreachable!("not a shuffle: {opcode:?}"),
    })
}

/// Reachable instructions of one method body together with reference counts and stack shapes.
#[derive(Debug)]
pub struct InstructionGraph<'a> {
    body: &'a MethodBody,
    positions: FxHashMap<u32, usize>,
    code_end: u32,
    /// Operand stack at the start of each instruction, `None` for unreachable ones.
    entry_stacks: Vec<Option<Vec<Category>>>,
    shuffles: Vec<Option<Shuffle>>,
    refs: FxHashMap<u32, usize>,
    predecessors: FxHashMap<u32, Vec<u32>>,
    handlers: Vec<Handler>,
    handler_targets: FxHashSet<u32>,
}

impl<'a> InstructionGraph<'a> {
    pub fn new(body: &'a MethodBody) -> Result<Self, GraphError> {
        let instructions = &body.instructions;
        if instructions.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut positions = FxHashMap::default();
        let mut expected = 0;
        for (index, insn) in instructions.iter().enumerate() {
            if insn.address != expected {
                return Err(GraphError::Gap(insn.address));
            }
            if insn.successors != insn.opcode.successors(insn.next_address()) {
                return Err(GraphError::BadSuccessors(insn.address));
            }
            expected = insn.next_address();
            positions.insert(insn.address, index);
        }
        let code_end = expected;

        let is_boundary = |address: u32| positions.contains_key(&address) || address == code_end;
        for handler in &body.handlers {
            let valid = positions.contains_key(&handler.start)
                && is_boundary(handler.end)
                && handler.start < handler.end
                && positions.contains_key(&handler.handler);
            if !valid {
                return Err(GraphError::BadHandler {
                    start: handler.start,
                    end: handler.end,
                    handler: handler.handler,
                });
            }
        }

        // Compilers guard the `monitorexit` of `synchronized` blocks with a handler that covers
        // itself, so that an asynchronous exception retries the unlock. Nothing in the source
        // language corresponds to that loop, so such entries are dropped.
        let candidates: Vec<Handler> = body
            .handlers
            .iter()
            .filter(|handler| {
                let covers_itself =
                    handler.start <= handler.handler && handler.handler < handler.end;
                if covers_itself {
                    log::trace!(
                        "dropping self-covering handler {}..{} -> {}",
                        handler.start,
                        handler.end,
                        handler.handler,
                    );
                }
                !covers_itself
            })
            .cloned()
            .collect();

        let mut graph = Self {
            body,
            positions,
            code_end,
            entry_stacks: vec![None; instructions.len()],
            shuffles: vec![None; instructions.len()],
            refs: FxHashMap::default(),
            predecessors: FxHashMap::default(),
            handlers: Vec::new(),
            handler_targets: FxHashSet::default(),
        };

        // Handlers only become live once something they cover is reachable, and their code can in
        // turn make more handlers live, so alternate between DFS and handler activation until
        // nothing changes.
        let mut active = vec![false; candidates.len()];
        let mut dfs_stack = vec![(0, Vec::new())];
        loop {
            graph.propagate_stacks(&mut dfs_stack)?;

            for (i, handler) in candidates.iter().enumerate() {
                if active[i] {
                    continue;
                }
                let live = instructions.iter().any(|insn| {
                    (handler.start..handler.end).contains(&insn.address)
                        && graph.is_reachable(insn.address)
                });
                if live {
                    active[i] = true;
                    dfs_stack.push((handler.handler, vec![Category::Single]));
                }
            }

            if dfs_stack.is_empty() {
                break;
            }
        }

        graph.handlers = candidates
            .into_iter()
            .zip(active)
            .filter_map(|(handler, active)| active.then_some(handler))
            .collect();
        graph.count_references();
        Ok(graph)
    }

    /// Runs DFS from the given roots, recording the stack shape at each newly reached instruction.
    fn propagate_stacks(
        &mut self,
        dfs_stack: &mut Vec<(u32, Vec<Category>)>,
    ) -> Result<(), GraphError> {
        while let Some((address, stack)) = dfs_stack.pop() {
            let index = self.positions[&address];
            if let Some(existing) = &self.entry_stacks[index] {
                if *existing != stack {
                    return Err(GraphError::InconsistentStack(address));
                }
                continue;
            }

            let insn = &self.body.instructions[index];
            if matches!(insn.opcode, Opcode::Jsr { .. } | Opcode::Ret { .. }) {
                return Err(GraphError::Subroutine(address));
            }

            let mut after = stack.clone();
            match insn.opcode.stack_effect()? {
                Some(effect) => {
                    if after.len() < effect.pops {
                        return Err(GraphError::StackUnderflow(address));
                    }
                    after.truncate(after.len() - effect.pops);
                    after.extend(effect.push);
                }
                None => {
                    let shuffle = resolve_shuffle(&insn.opcode, &after, address)?;
                    shuffle.apply(&mut after);
                    self.shuffles[index] = Some(shuffle);
                }
            }
            self.entry_stacks[index] = Some(stack);

            for &successor in &insn.successors {
                if successor == self.code_end {
                    return Err(GraphError::FallsOffEnd(address));
                }
                if !self.positions.contains_key(&successor) {
                    return Err(GraphError::BadTarget {
                        from: address,
                        to: successor,
                    });
                }
                dfs_stack.push((successor, after.clone()));
            }
        }
        Ok(())
    }

    fn count_references(&mut self) {
        let body = self.body;
        *self.refs.entry(0).or_default() += 1;
        for insn in &body.instructions {
            if !self.is_reachable(insn.address) {
                continue;
            }
            for &successor in &insn.successors {
                *self.refs.entry(successor).or_default() += 1;
                self.predecessors
                    .entry(successor)
                    .or_default()
                    .push(insn.address);
            }
        }

        // Handler boundaries count as references: no fusion crosses the edge of a `try` region.
        for handler in &self.handlers {
            *self.refs.entry(handler.start).or_default() += 1;
            *self.refs.entry(handler.handler).or_default() += 1;
            if handler.end != self.code_end {
                *self.refs.entry(handler.end).or_default() += 1;
            }
            self.handler_targets.insert(handler.handler);
        }
    }

    pub fn body(&self) -> &'a MethodBody {
        self.body
    }

    /// The address right after the last instruction.
    pub fn code_end(&self) -> u32 {
        self.code_end
    }

    pub fn instruction(&self, address: u32) -> Option<&'a Instruction> {
        let index = *self.positions.get(&address)?;
        Some(&self.body.instructions[index])
    }

    /// Reachable instructions in address order.
    pub fn instructions(&self) -> impl Iterator<Item = &'a Instruction> + '_ {
        self.body
            .instructions
            .iter()
            .zip(&self.entry_stacks)
            .filter_map(|(insn, stack)| stack.is_some().then_some(insn))
    }

    pub fn is_reachable(&self, address: u32) -> bool {
        self.positions
            .get(&address)
            .is_some_and(|&index| self.entry_stacks[index].is_some())
    }

    pub fn predecessor_count(&self, address: u32) -> usize {
        self.refs.get(&address).copied().unwrap_or(0)
    }

    pub fn predecessors(&self, address: u32) -> &[u32] {
        self.predecessors.get(&address).map_or(&[][..], Vec::as_slice)
    }

    /// The only way control can reach `address`, if fusing across that edge is legal.
    pub fn unique_predecessor(&self, address: u32) -> Option<u32> {
        if address == 0 || self.is_handler_target(address) || self.predecessor_count(address) != 1
        {
            return None;
        }
        match self.predecessors(address) {
            [predecessor] => Some(*predecessor),
            _ => None,
        }
    }

    pub fn successors(&self, address: u32) -> &'a [u32] {
        self.instruction(address)
            .map_or(&[][..], |insn| insn.successors.as_slice())
    }

    pub fn is_handler_target(&self, address: u32) -> bool {
        self.handler_targets.contains(&address)
    }

    /// Live handler table entries, in table order.
    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    /// The operand stack on entry to a reachable instruction, top last.
    pub fn entry_stack(&self, address: u32) -> Option<&[Category]> {
        let index = *self.positions.get(&address)?;
        self.entry_stacks[index].as_deref()
    }

    /// The number of values on the operand stack on entry to a reachable instruction.
    pub fn stack_depth(&self, address: u32) -> Option<usize> {
        self.entry_stack(address).map(<[Category]>::len)
    }

    pub fn shuffle(&self, address: u32) -> Option<Shuffle> {
        let index = *self.positions.get(&address)?;
        self.shuffles[index]
    }

    pub fn can_throw(&self, address: u32) -> bool {
        self.instruction(address)
            .is_some_and(|insn| insn.opcode.can_throw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::tests::Asm;
    use crate::instruction::{CompareOp, Constant, JumpOperands, ValueKind};
    use proptest::prelude::*;

    #[test]
    fn references_and_predecessors() {
        let body = Asm::new()
            .iload(0)
            .branch(CompareOp::Eq, JumpOperands::IntZero, "else")
            .iconst(1)
            .istore(1)
            .goto("end")
            .label("else")
            .iconst(2)
            .istore(1)
            .label("end")
            .ret(None)
            .finish();
        let graph = InstructionGraph::new(&body).unwrap();

        let end = body.instructions.last().unwrap().address;
        assert_eq!(graph.predecessor_count(0), 1);
        assert_eq!(graph.unique_predecessor(0), None);
        assert_eq!(graph.predecessor_count(end), 2);
        assert_eq!(graph.unique_predecessor(end), None);
        assert_eq!(graph.unique_predecessor(1), Some(0));
        assert_eq!(graph.stack_depth(1), Some(1));
        assert_eq!(graph.stack_depth(end), Some(0));
    }

    #[test]
    fn handlers_block_fusion() {
        let body = Asm::new()
            .label("start")
            .iconst(1)
            .label("try")
            .istore(0)
            .label("try_end")
            .ret(None)
            .label("catch")
            .astore(1)
            .ret(None)
            .handler("try", "try_end", "catch", Some("java/lang/Exception"))
            .finish();
        let graph = InstructionGraph::new(&body).unwrap();

        // The store is preceded only by the constant, but it starts a `try` region.
        assert_eq!(graph.predecessor_count(1), 2);
        assert_eq!(graph.unique_predecessor(1), None);
        // The handler's code is reached by the handler only.
        let catch = body.instructions[3].address;
        assert!(graph.is_handler_target(catch));
        assert_eq!(graph.entry_stack(catch), Some(&[Category::Single][..]));
        assert_eq!(graph.handlers().len(), 1);
    }

    #[test]
    fn dead_code_and_dead_handlers() {
        let body = Asm::new()
            .ret(None)
            .label("dead")
            .iconst(1)
            .label("dead_end")
            .ret(None)
            .label("catch")
            .op(Opcode::Throw)
            .handler("dead", "dead_end", "catch", None)
            .finish();
        let graph = InstructionGraph::new(&body).unwrap();
        assert_eq!(graph.instructions().count(), 1);
        assert!(graph.handlers().is_empty());
        assert!(!graph.is_reachable(1));
    }

    #[test]
    fn self_covering_handlers_are_dropped() {
        let body = Asm::new()
            .label("start")
            .aload(0)
            .op(Opcode::MonitorExit)
            .label("end")
            .ret(None)
            .handler("start", "end", "start", None)
            .finish();
        let graph = InstructionGraph::new(&body).unwrap();
        assert!(graph.handlers().is_empty());
        assert!(!graph.is_handler_target(0));
    }

    #[test]
    fn malformed() {
        let falls_off = Asm::new().iconst(1).finish();
        assert_eq!(
            InstructionGraph::new(&falls_off).unwrap_err(),
            GraphError::FallsOffEnd(0)
        );

        let underflow = Asm::new().istore(0).ret(None).finish();
        assert_eq!(
            InstructionGraph::new(&underflow).unwrap_err(),
            GraphError::StackUnderflow(0)
        );

        let inconsistent = Asm::new()
            .iload(0)
            .branch(CompareOp::Eq, JumpOperands::IntZero, "join")
            .iconst(1)
            .label("join")
            .ret(None)
            .finish();
        assert!(matches!(
            InstructionGraph::new(&inconsistent).unwrap_err(),
            GraphError::InconsistentStack(_)
        ));

        let jsr = Asm::new().op(Opcode::Jsr { target: 0 }).finish();
        assert_eq!(
            InstructionGraph::new(&jsr).unwrap_err(),
            GraphError::Subroutine(0)
        );

        let bad_target = Asm::new().op(Opcode::Goto { target: 5 }).ret(None).finish();
        assert_eq!(
            InstructionGraph::new(&bad_target).unwrap_err(),
            GraphError::BadTarget { from: 0, to: 5 }
        );
    }

    #[test]
    fn successors_must_match_opcodes() {
        let mut dangling = Asm::new().goto("end").label("end").ret(None).finish();
        dangling.instructions[0].successors.clear();
        assert_eq!(
            InstructionGraph::new(&dangling).unwrap_err(),
            GraphError::BadSuccessors(0)
        );

        let mut extra = Asm::new()
            .iload(0)
            .branch(CompareOp::Eq, JumpOperands::IntZero, "end")
            .label("end")
            .ret(None)
            .finish();
        extra.instructions[1].successors.push(0);
        assert_eq!(
            InstructionGraph::new(&extra).unwrap_err(),
            GraphError::BadSuccessors(1)
        );
    }

    #[test]
    fn shuffles() {
        let long = |value| Opcode::Const(Constant::Long(value));
        let body = Asm::new()
            .iconst(1)
            .op(long(2))
            .op(Opcode::Dup2X1)
            .op(Opcode::Pop2)
            .op(Opcode::Pop)
            .op(Opcode::Pop2)
            .iconst(3)
            .iconst(4)
            .op(Opcode::Dup2)
            .op(Opcode::Swap)
            .op(Opcode::Pop2)
            .op(Opcode::Pop2)
            .ret(None)
            .finish();
        let graph = InstructionGraph::new(&body).unwrap();
        let shuffles: Vec<Shuffle> = body
            .instructions
            .iter()
            .filter_map(|insn| graph.shuffle(insn.address))
            .collect();
        assert_eq!(
            shuffles,
            [
                Shuffle::Dup { count: 1, skip: 1 },
                Shuffle::Pop { count: 1 },
                Shuffle::Pop { count: 1 },
                Shuffle::Pop { count: 1 },
                Shuffle::Dup { count: 2, skip: 0 },
                Shuffle::Swap,
                Shuffle::Pop { count: 2 },
                Shuffle::Pop { count: 2 },
            ]
        );

        let split_long = Asm::new().op(long(1)).op(Opcode::Pop).ret(None).finish();
        assert_eq!(
            InstructionGraph::new(&split_long).unwrap_err(),
            GraphError::WrongCategory(2)
        );
    }

    #[test]
    fn shuffle_application() {
        let mut stack = vec!['a', 'b', 'c', 'd'];
        Shuffle::Dup { count: 2, skip: 1 }.apply(&mut stack);
        assert_eq!(stack, ['a', 'c', 'd', 'b', 'c', 'd']);
        Shuffle::Swap.apply(&mut stack);
        assert_eq!(stack, ['a', 'c', 'd', 'b', 'd', 'c']);
        Shuffle::Pop { count: 3 }.apply(&mut stack);
        assert_eq!(stack, ['a', 'c', 'd']);
    }

    proptest! {
        // Joining `n` branches right before a consumer must never leave it with a unique
        // predecessor, wherever the join sits.
        #[test]
        fn joins_have_no_unique_predecessor(branches in 1usize..6) {
            let mut asm = Asm::new();
            let labels = ["a", "b", "c", "d", "e"];
            for &label in &labels[..branches] {
                asm.iload(0).branch(CompareOp::Ne, JumpOperands::IntZero, label);
            }
            asm.iconst(0).goto("join");
            for &label in &labels[..branches] {
                asm.label(label).iconst(1).goto("join");
            }
            asm.label("join").op(Opcode::Return(Some(ValueKind::Int)));
            let body = asm.finish();
            let graph = InstructionGraph::new(&body).unwrap();
            let join = body.instructions.last().unwrap().address;
            prop_assert_eq!(graph.predecessor_count(join), branches + 1);
            prop_assert_eq!(graph.unique_predecessor(join), None);
            prop_assert_eq!(graph.stack_depth(join), Some(1));
        }
    }
}
