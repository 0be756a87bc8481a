//! The fallback for control flow no rule can structure, such as loops with several entries.
//!
//! A group of blocks with the same exception coverage is replaced by a loop around a `switch` on a
//! fresh integer variable. Every jump into the group stores the index of the target block in the
//! variable and jumps to the loop, and every jump inside the group stores the index and continues
//! the loop.

use super::block::{Case, Jump, LoopKind, StructuredBlock};
use super::flow::{BlockId, FlowBlock, FlowGraph};
use super::structurer::Structurer;
use crate::ast::{Arena, ExprKind};
use crate::expr::operator::assign;
use crate::locals::LocalId;
use crate::types::{SimpleType, Type};
use rustc_hash::{FxHashMap, FxHashSet};

impl Structurer<'_> {
    pub(super) fn dispatch(&mut self) -> bool {
        let Some(members) = self.dispatch_group() else {
            return false;
        };
        log::debug!("dispatching between {members:?}");

        let variable = self.flow.fresh_synthetic();
        let selector_local = self.locals.fresh(variable, Type::simple(SimpleType::Int));
        let label = self.flow.fresh_label();
        let switch_label = self.flow.fresh_label();
        let head = members[0];
        let index: FxHashMap<BlockId, i32> = members
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i as i32))
            .collect();

        let mut merged: Option<FlowBlock> = None;
        let mut cases = Vec::with_capacity(members.len());
        for &member in &members {
            let mut block = self.flow.remove(member);
            let arena = &mut *self.arena;
            block.content.visit_mut(&mut |block| {
                if let StructuredBlock::Goto(target) = *block
                    && let Some(&j) = index.get(&target)
                {
                    *block = StructuredBlock::sequence(vec![
                        select(arena, selector_local, j),
                        StructuredBlock::Jump(Jump::Continue(label)),
                    ]);
                }
            });
            cases.push(Case {
                values: vec![index[&member]],
                is_default: false,
                body: core::mem::take(&mut block.content),
            });
            match &mut merged {
                Some(merged) => FlowGraph::combine_coverage(merged, &block),
                None => merged = Some(block),
            }
        }

        let mut head_block = merged.expect("groups have at least two blocks");
        let selector = self
            .arena
            .add(ExprKind::Local(selector_local), Type::simple(SimpleType::Int));
        head_block.content = StructuredBlock::Loop {
            label: Some(label),
            kind: LoopKind::Infinite,
            condition: None,
            body: Box::new(StructuredBlock::Switch {
                label: Some(switch_label),
                selector,
                cases,
            }),
        };
        self.flow.put_back(head, head_block);

        for (id, block) in self.flow.blocks_mut() {
            if id == head {
                continue;
            }
            let arena = &mut *self.arena;
            block.content.visit_mut(&mut |block| {
                if let StructuredBlock::Goto(target) = *block
                    && let Some(&j) = index.get(&target)
                {
                    *block = StructuredBlock::sequence(vec![
                        select(arena, selector_local, j),
                        StructuredBlock::Goto(head),
                    ]);
                }
            });
        }

        // Entries the graph knows about by id get a block of their own that selects the target.
        let coverage = self
            .flow
            .get(head)
            .map(|block| block.coverage.clone())
            .unwrap_or_default();
        let mut trampolines: FxHashMap<BlockId, BlockId> = FxHashMap::default();
        let mut entries = vec![self.flow.entry];
        entries.extend(self.flow.live_clauses().map(|(_, clause)| clause.handler));
        for target in entries {
            let Some(&j) = index.get(&target) else {
                continue;
            };
            if trampolines.contains_key(&target) {
                continue;
            }
            let address = self.flow.get(head).map_or(0, |block| block.address);
            let content = StructuredBlock::sequence(vec![
                select(self.arena, selector_local, j),
                StructuredBlock::Goto(head),
            ]);
            let trampoline = self.flow.push(FlowBlock {
                address,
                end: address,
                content,
                coverage: Vec::new(),
                region: coverage.clone(),
                can_throw: false,
            });
            trampolines.insert(target, trampoline);
        }
        if let Some(&trampoline) = trampolines.get(&self.flow.entry) {
            self.flow.entry = trampoline;
        }
        for clause in &mut self.flow.clauses {
            if !clause.formed
                && let Some(&trampoline) = trampolines.get(&clause.handler)
            {
                clause.handler = trampoline;
            }
        }
        true
    }

    /// Blocks to put behind a dispatcher: a cycle if there is one, all blocks that share their
    /// coverage otherwise.
    fn dispatch_group(&self) -> Option<Vec<BlockId>> {
        let mut classes: Vec<(Vec<usize>, Vec<BlockId>)> = Vec::new();
        for (id, block) in self.flow.blocks() {
            let mut coverage = block.coverage.clone();
            coverage.sort_unstable();
            match classes.iter_mut().find(|(key, _)| *key == coverage) {
                Some((_, ids)) => ids.push(id),
                None => classes.push((coverage, vec![id])),
            }
        }
        classes.sort_by_key(|(key, _)| core::cmp::Reverse(key.len()));

        for (_, class) in &classes {
            if let Some(cycle) = self.cycle_in(class) {
                return Some(cycle);
            }
        }
        for (_, class) in &classes {
            let plain: Vec<BlockId> = class
                .iter()
                .copied()
                .filter(|&id| id != self.flow.entry && !self.flow.is_handler(id))
                .collect();
            if plain.len() >= 2 {
                return Some(plain);
            }
        }
        None
    }

    /// The strongly connected component of the first block of `class` that lies on a cycle.
    fn cycle_in(&self, class: &[BlockId]) -> Option<Vec<BlockId>> {
        let reach = |from: BlockId| {
            let mut seen: FxHashSet<BlockId> = FxHashSet::default();
            let mut stack = self.flow.successors(from);
            while let Some(id) = stack.pop() {
                if class.contains(&id) && seen.insert(id) {
                    stack.extend(self.flow.successors(id));
                }
            }
            seen
        };
        let reachable: Vec<FxHashSet<BlockId>> = class.iter().map(|&id| reach(id)).collect();
        for (i, &id) in class.iter().enumerate() {
            if !reachable[i].contains(&id) {
                continue;
            }
            let component: Vec<BlockId> = class
                .iter()
                .enumerate()
                .filter(|&(j, other)| reachable[i].contains(other) && reachable[j].contains(&id))
                .map(|(_, &other)| other)
                .collect();
            if component.len() >= 2 {
                return Some(component);
            }
        }
        None
    }
}

/// `variable = index;`
fn select(arena: &mut Arena, variable: LocalId, index: i32) -> StructuredBlock {
    let target = arena.add(ExprKind::Local(variable), Type::simple(SimpleType::Int));
    let value = arena.int(index);
    StructuredBlock::Statement(assign(arena, target, value))
}
