//! The graph of flow blocks the structurer reduces.
//!
//! Blocks are stored in address order and never move, so that `BlockId` order matches code order
//! and a jump to a block with a smaller or equal id is a back edge. A removed block leaves a hole.
//! Edges are not stored: they are the `Goto`s in block contents, together with exception edges
//! from throwing blocks to the handlers of the clauses that cover them.

use super::block::StructuredBlock;
use crate::ast::{Arena, DebugIr, Label};
use crate::locals::{LocalId, SlotKey};
use core::fmt;
use core::ops::Range;
use rustc_hash::FxHashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct FlowBlock {
    pub address: u32,
    pub end: u32,
    /// Never completes normally: every way out is a `Goto` or a `Jump`.
    pub content: StructuredBlock,
    /// Unformed clauses whose handlers catch exceptions thrown here. Empty for blocks that can't
    /// throw.
    pub coverage: Vec<usize>,
    /// Unformed clauses whose ranges contain the block, whether it throws or not.
    pub region: Vec<usize>,
    pub can_throw: bool,
}

/// A catch clause: one or more exception table entries sharing a handler and a caught type.
#[derive(Clone, Debug)]
pub struct Clause {
    pub ranges: Vec<Range<u32>>,
    pub handler: BlockId,
    // `None` for catch-all entries
    pub class: Option<String>,
    /// The variable holding the caught exception on entry to the handler.
    pub binder: LocalId,
    /// Set once the clause has been turned into a `catch`, or dropped as dead.
    pub formed: bool,
}

impl Clause {
    pub fn contains(&self, address: u32) -> bool {
        self.ranges.iter().any(|range| range.contains(&address))
    }

    /// Total number of bytes covered, which orders nested clauses.
    pub fn span(&self) -> u32 {
        self.ranges.iter().map(|range| range.end - range.start).sum()
    }
}

#[derive(Clone, Debug)]
pub struct FlowGraph {
    blocks: Vec<Option<FlowBlock>>,
    pub clauses: Vec<Clause>,
    pub entry: BlockId,
    next_label: u32,
    next_synthetic: u16,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            clauses: Vec::new(),
            entry: BlockId(0),
            next_label: 0,
            next_synthetic: 0,
        }
    }

    pub fn push(&mut self, block: FlowBlock) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Some(block));
        id
    }

    pub fn get(&self, id: BlockId) -> Option<&FlowBlock> {
        self.blocks.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut FlowBlock> {
        self.blocks.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn remove(&mut self, id: BlockId) -> FlowBlock {
        self.blocks[id.0 as usize]
            .take()
            .expect("removed a block twice")
    }

    pub fn put_back(&mut self, id: BlockId, block: FlowBlock) {
        let slot = &mut self.blocks[id.0 as usize];
        assert!(slot.is_none(), "block {id} is still live");
        *slot = Some(block);
    }

    /// Live blocks in address order.
    pub fn ids(&self) -> Vec<BlockId> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, block)| block.is_some())
            .map(|(i, _)| BlockId(i as u32))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &FlowBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, block)| Some((BlockId(i as u32), block.as_ref()?)))
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = (BlockId, &mut FlowBlock)> {
        self.blocks
            .iter_mut()
            .enumerate()
            .filter_map(|(i, block)| Some((BlockId(i as u32), block.as_mut()?)))
    }

    pub fn fresh_label(&mut self) -> Label {
        self.next_label += 1;
        Label(self.next_label)
    }

    pub fn fresh_synthetic(&mut self) -> SlotKey {
        self.next_synthetic += 1;
        SlotKey::Synthetic(self.next_synthetic - 1)
    }

    /// Number of ways control can enter each live block: gotos, the method entry and handlers of
    /// unformed clauses.
    pub fn references(&self) -> FxHashMap<BlockId, usize> {
        let mut refs: FxHashMap<BlockId, usize> = FxHashMap::default();
        *refs.entry(self.entry).or_default() += 1;
        for (_, block) in self.blocks() {
            for target in block.content.gotos() {
                *refs.entry(target).or_default() += 1;
            }
        }
        for (_, clause) in self.live_clauses() {
            *refs.entry(clause.handler).or_default() += 1;
        }
        refs
    }

    pub fn live_clauses(&self) -> impl Iterator<Item = (usize, &Clause)> {
        self.clauses
            .iter()
            .enumerate()
            .filter(|(_, clause)| !clause.formed)
    }

    /// Whether `id` is where some unformed clause's handler starts.
    pub fn is_handler(&self, id: BlockId) -> bool {
        self.live_clauses().any(|(_, clause)| clause.handler == id)
    }

    /// Distinct goto targets of a block, in order of first occurrence.
    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        let mut targets = Vec::new();
        if let Some(block) = self.get(id) {
            for target in block.content.gotos() {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
        targets
    }

    /// Whether the code of `b` may be placed inside `a` without changing which handlers catch
    /// what either of them throws.
    pub fn compatible(&self, a: BlockId, b: BlockId) -> bool {
        let (Some(a), Some(b)) = (self.get(a), self.get(b)) else {
            return false;
        };
        let contains = |outer: &[usize], inner: &[usize]| inner.iter().all(|c| outer.contains(c));
        a.coverage == b.coverage
            || (!a.can_throw && contains(&a.region, &b.coverage))
            || (!b.can_throw && contains(&b.region, &a.coverage))
    }

    /// Updates `into` to describe its own code followed by the code of `from`.
    pub fn combine_coverage(into: &mut FlowBlock, from: &FlowBlock) {
        if from.can_throw && !into.can_throw {
            into.coverage = from.coverage.clone();
        }
        into.region.retain(|c| from.region.contains(c));
        for &c in &into.coverage {
            if !into.region.contains(&c) {
                into.region.push(c);
            }
        }
        into.can_throw |= from.can_throw;
        into.address = into.address.min(from.address);
        into.end = into.end.max(from.end);
    }

    /// Marks a clause as handled and forgets about it everywhere.
    pub fn retire_clause(&mut self, index: usize) {
        self.clauses[index].formed = true;
        for (_, block) in self.blocks_mut() {
            block.coverage.retain(|&c| c != index);
            block.region.retain(|&c| c != index);
        }
    }
}

impl Default for FlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugIr for FlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>, arena: &Arena) -> fmt::Result {
        for (id, block) in self.blocks() {
            write!(f, "{id} @ {}..{}", block.address, block.end)?;
            if !block.coverage.is_empty() {
                write!(f, " covered by {:?}", block.coverage)?;
            }
            writeln!(f, ":")?;
            write!(f, "{}", arena.debug(&block.content))?;
        }
        for (index, clause) in self.live_clauses() {
            writeln!(
                f,
                "clause {index}: {:?} -> {} ({})",
                clause.ranges,
                clause.handler,
                clause.class.as_deref().unwrap_or("any"),
            )?;
        }
        Ok(())
    }
}
