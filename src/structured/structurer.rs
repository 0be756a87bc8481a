//! The reduction loop.
//!
//! Each rule looks for one local shape in the flow graph and replaces it with a structured
//! construct, removing blocks or edges on the way. Rules are tried in a fixed order and the loop
//! starts over from the first rule after every change, so that cheap merges always get to run
//! before the shapes they create are matched.

use super::StructureError;
use super::block::{Jump, LoopKind, StructuredBlock};
use super::flow::{BlockId, FlowGraph};
use crate::ast::simplify::negate;
use crate::ast::Arena;
use crate::expr::operator::side_effects;
use crate::locals::LocalTable;
use crate::{DecompilerOptions, MethodContext};
use core::mem;
use rustc_hash::FxHashMap;

type Rule<'a> = fn(&mut Structurer<'a>) -> bool;
type BlockRule<'a> = fn(&mut Structurer<'a>, BlockId) -> bool;

pub(super) struct Structurer<'a> {
    pub ctx: &'a MethodContext<'a>,
    pub flow: FlowGraph,
    pub arena: &'a mut Arena,
    pub locals: &'a mut LocalTable,
    pub options: &'a DecompilerOptions,
    /// Reference counts as of the start of the current step.
    pub refs: FxHashMap<BlockId, usize>,
}

impl<'a> Structurer<'a> {
    pub fn run(mut self) -> Result<StructuredBlock, StructureError> {
        // In priority order.
        let rules: [Rule<'a>; 12] = [
            |s| s.each_block(Self::merge),
            |s| s.each_block(Self::thread),
            |s| s.each_block(Self::hoist),
            |s| s.each_block(Self::conditional),
            |s| s.each_block(Self::switch),
            |s| s.each_block(Self::make_loop),
            |s| s.each_block(Self::duplicate_return),
            Self::try_catch,
            |s| s.each_block(Self::finally),
            |s| s.each_block(Self::inline),
            |s| s.each_block(Self::escape),
            Self::dispatch,
        ];

        let limit = 64 * (self.flow.len() + self.flow.clauses.len()) + 256;
        for _ in 0..limit {
            if self.is_done() {
                let entry = self.flow.entry;
                // The last merges can finish the method before `finally` gets a turn. Every
                // successful call removes a catch-all.
                loop {
                    self.refs = self.flow.references();
                    if !self.finally(entry) {
                        return Ok(self.flow.remove(entry).content);
                    }
                }
            }
            self.refs = self.flow.references();
            if !rules.iter().any(|rule| rule(&mut self)) {
                log::debug!(
                    "{}: stuck on:\n{}",
                    self.ctx.signature.name,
                    self.arena.debug(&self.flow)
                );
                return Err(StructureError::Stuck {
                    blocks: self.flow.len(),
                });
            }
        }
        Err(StructureError::Limit(limit))
    }

    fn is_done(&self) -> bool {
        self.flow.len() == 1
            && self.flow.live_clauses().next().is_none()
            && self
                .flow
                .get(self.flow.entry)
                .is_some_and(|block| block.content.gotos().is_empty())
    }

    fn each_block(&mut self, rule: BlockRule<'a>) -> bool {
        for id in self.flow.ids() {
            if self.flow.get(id).is_some() && rule(self, id) {
                return true;
            }
        }
        false
    }

    pub fn content(&self, id: BlockId) -> &StructuredBlock {
        &self
            .flow
            .get(id)
            .expect("rules only look at live blocks")
            .content
    }

    pub fn content_mut(&mut self, id: BlockId) -> &mut StructuredBlock {
        &mut self
            .flow
            .get_mut(id)
            .expect("rules only look at live blocks")
            .content
    }

    pub fn refs(&self, id: BlockId) -> usize {
        self.refs.get(&id).copied().unwrap_or(0)
    }

    /// Whether the only way into `x` is a goto in `at`, so that `x` may be moved there.
    pub fn inlinable(&self, at: BlockId, x: BlockId) -> bool {
        x != at
            && x != self.flow.entry
            && self.flow.get(x).is_some()
            && self.refs(x) == 1
            && self.flow.compatible(at, x)
    }

    /// Removes `from` from the graph, accounting for its code in `into`, and returns its content.
    pub fn absorb(&mut self, into: BlockId, from: BlockId) -> StructuredBlock {
        let from = self.flow.remove(from);
        let block = self
            .flow
            .get_mut(into)
            .expect("absorbing into a live block");
        FlowGraph::combine_coverage(block, &from);
        from.content
    }

    /// Replaces the last statement of a block with `items`.
    pub fn replace_last(&mut self, id: BlockId, items: Vec<StructuredBlock>) {
        let content = self.content_mut(id);
        content.pop_last();
        let mut all = vec![mem::take(content)];
        all.extend(items);
        *content = StructuredBlock::sequence(all);
    }

    fn goto_targets(&self, id: BlockId) -> Vec<BlockId> {
        self.flow.successors(id)
    }

    /// Concatenates a block with the only block jumping to it.
    fn merge(&mut self, a: BlockId) -> bool {
        let Some(&StructuredBlock::Goto(b)) = self.content(a).last() else {
            return false;
        };
        if !self.inlinable(a, b) {
            return false;
        }
        let content = self.absorb(a, b);
        self.replace_last(a, vec![content]);
        log::trace!("merged {b} into {a}");
        true
    }

    /// Drops unreachable blocks and blocks that do nothing but jump elsewhere.
    fn thread(&mut self, a: BlockId) -> bool {
        if self.refs(a) == 0 {
            self.flow.remove(a);
            log::trace!("dropped unreachable {a}");
            return true;
        }
        let &StructuredBlock::Goto(x) = self.content(a) else {
            return false;
        };
        if x == a || self.flow.is_handler(a) {
            return false;
        }
        if a == self.flow.entry {
            if self.flow.is_handler(x) {
                return false;
            }
            self.flow.entry = x;
        }
        self.redirect(a, &StructuredBlock::Goto(x));
        log::trace!("threaded {a} through to {x}");
        true
    }

    /// Copies a bare `return` into the blocks jumping to it.
    fn duplicate_return(&mut self, a: BlockId) -> bool {
        if a == self.flow.entry
            || self.flow.is_handler(a)
            || *self.content(a) != StructuredBlock::Jump(Jump::Return(None))
            || self.flow.get(a).is_some_and(|block| !block.coverage.is_empty())
        {
            return false;
        }
        self.redirect(a, &StructuredBlock::Jump(Jump::Return(None)));
        log::trace!("duplicated return {a}");
        true
    }

    /// Removes `a` and replaces every goto to it with `with`.
    fn redirect(&mut self, a: BlockId, with: &StructuredBlock) {
        self.flow.remove(a);
        for (_, block) in self.flow.blocks_mut() {
            block.content.replace_gotos(a, with);
        }
    }

    /// Moves a goto shared by all branches of a trailing construct out of it.
    fn hoist(&mut self, a: BlockId) -> bool {
        let Some(last) = self.content(a).last() else {
            return false;
        };
        let branches = branches(last);
        let Some(target) = branches.iter().find_map(|branch| match branch.last() {
            Some(&StructuredBlock::Goto(target)) => Some(target),
            _ => None,
        }) else {
            return false;
        };
        let goto = StructuredBlock::Goto(target);
        // Branches that go elsewhere are left to `conditional`.
        let fits = |branch: &&StructuredBlock| {
            branch.last() == Some(&goto)
                || (branch.diverges() && !matches!(branch.last(), Some(StructuredBlock::Goto(_))))
        };
        if !branches.iter().all(fits) {
            return false;
        }

        let content = self.content_mut(a);
        let mut last = content.pop_last().expect("checked above");
        for branch in branches_mut(&mut last) {
            if branch.last() == Some(&goto) {
                branch.pop_last();
            }
        }
        *content = StructuredBlock::sequence(vec![mem::take(content), last, goto]);
        true
    }

    /// Two-way branches whose targets can be placed inside the branch.
    fn conditional(&mut self, a: BlockId) -> bool {
        let Some(StructuredBlock::If {
            condition,
            then,
            otherwise: Some(otherwise),
        }) = self.content(a).last()
        else {
            return false;
        };
        let (&StructuredBlock::Goto(t), &StructuredBlock::Goto(f)) = (&**then, &**otherwise) else {
            return false;
        };
        let condition = *condition;

        if t == f {
            let mut effects = Vec::new();
            side_effects(self.arena, condition, &mut effects);
            let mut items: Vec<StructuredBlock> =
                effects.into_iter().map(StructuredBlock::Statement).collect();
            items.push(StructuredBlock::Goto(t));
            self.replace_last(a, items);
            return true;
        }
        if t == a || f == a {
            return false;
        }

        let leads_only_to = |s: &Self, x: BlockId, m: BlockId| {
            s.goto_targets(x).iter().all(|&target| target == m || target == a)
        };
        let loops_back = |s: &Self, x: BlockId| s.goto_targets(x).contains(&a);

        // A branch that jumps back to `a` is a loop body and goes inside the `if`, whatever
        // comes after it.
        let mut order = [(t, f, false), (f, t, true)];
        if loops_back(self, f) && !loops_back(self, t) {
            order.swap(0, 1);
        }
        for (x, m, negated) in order {
            if self.inlinable(a, x) && leads_only_to(self, x, m) {
                let mut body = self.absorb(a, x);
                if body.last() == Some(&StructuredBlock::Goto(m)) {
                    body.pop_last();
                }
                let condition = if negated {
                    negate(self.arena, condition)
                } else {
                    condition
                };
                self.replace_last(
                    a,
                    vec![
                        StructuredBlock::If {
                            condition,
                            then: Box::new(body),
                            otherwise: None,
                        },
                        StructuredBlock::Goto(m),
                    ],
                );
                log::trace!("{a}: if without else, body {x}");
                return true;
            }
        }

        if !self.inlinable(a, t) || !self.inlinable(a, f) || !self.flow.compatible(t, f) {
            return false;
        }
        let mut exits: Vec<BlockId> = self.goto_targets(t);
        exits.extend(self.goto_targets(f));
        exits.retain(|&target| target != a);
        exits.sort();
        exits.dedup();
        let merge = match exits[..] {
            [] => None,
            [merge] => Some(merge),
            _ => return false,
        };

        let mut branches = [t, f].map(|x| self.absorb(a, x));
        if let Some(merge) = merge {
            for branch in &mut branches {
                if branch.last() == Some(&StructuredBlock::Goto(merge)) {
                    branch.pop_last();
                }
            }
        }
        let [then, otherwise] = branches;
        let mut items = vec![StructuredBlock::If {
            condition,
            then: Box::new(then),
            otherwise: Some(Box::new(otherwise)),
        }];
        items.extend(merge.map(StructuredBlock::Goto));
        self.replace_last(a, items);
        log::trace!("{a}: if {t} else {f}");
        true
    }

    /// A block that jumps to itself becomes an infinite loop, left through the nearest block
    /// after it.
    fn make_loop(&mut self, a: BlockId) -> bool {
        let targets = self.goto_targets(a);
        if !targets.contains(&a) {
            return false;
        }
        let address = self.flow.get(a).map_or(0, |block| block.address);
        let exit = targets
            .iter()
            .filter_map(|&target| Some((self.flow.get(target)?.address, target)))
            .filter(|&(target_address, _)| target_address > address)
            .min()
            .map(|(_, target)| target);

        let label = self.flow.fresh_label();
        let content = self.content_mut(a);
        let mut body = mem::take(content);
        body.replace_gotos(a, &StructuredBlock::Jump(Jump::Continue(label)));
        if let Some(exit) = exit {
            body.replace_gotos(exit, &StructuredBlock::Jump(Jump::Break(label)));
        }
        let mut items = vec![StructuredBlock::Loop {
            label: Some(label),
            kind: LoopKind::Infinite,
            condition: None,
            body: Box::new(body),
        }];
        items.extend(exit.map(StructuredBlock::Goto));
        *content = StructuredBlock::sequence(items);
        log::trace!("{a}: loop {label}");
        true
    }

    /// Moves a block reached by a single nested goto to where the goto is.
    fn inline(&mut self, a: BlockId) -> bool {
        let mut targets = Vec::new();
        open_gotos(self.content(a), &mut targets);
        for x in targets {
            if self.inlinable(a, x) {
                let content = self.absorb(a, x);
                self.content_mut(a).replace_gotos(x, &content);
                log::trace!("inlined {x} into {a}");
                return true;
            }
        }
        false
    }

    /// A block whose every predecessor goto is inside `a` is reached by breaking out of a labeled
    /// block around `a`.
    fn escape(&mut self, a: BlockId) -> bool {
        let mut targets = self.goto_targets(a);
        targets.sort_by_key(|&target| self.flow.get(target).map(|block| block.address));
        for f in targets {
            if f == a || f == self.flow.entry || !self.flow.compatible(a, f) {
                continue;
            }
            let content = self.content(a);
            let count = content.gotos().iter().filter(|&&target| target == f).count();
            if count != self.refs(f) || content.last() == Some(&StructuredBlock::Goto(f)) {
                continue;
            }

            let label = self.flow.fresh_label();
            let content = self.content_mut(a);
            let mut body = mem::take(content);
            body.replace_gotos(f, &StructuredBlock::Jump(Jump::Break(label)));
            *content = StructuredBlock::sequence(vec![
                StructuredBlock::Labeled {
                    label,
                    body: Box::new(body),
                },
                StructuredBlock::Goto(f),
            ]);
            log::trace!("{a}: labeled escape {label} to {f}");
            return true;
        }
        false
    }
}

/// Goto targets whose blocks may be put in place of the goto without ending up protected by a
/// `try` they weren't protected by before.
fn open_gotos(block: &StructuredBlock, out: &mut Vec<BlockId>) {
    match block {
        StructuredBlock::Goto(target) => out.push(*target),
        StructuredBlock::Try {
            catches,
            finally: None,
            ..
        } => {
            for catch in catches {
                open_gotos(&catch.body, out);
            }
        }
        StructuredBlock::Try { .. } => {}
        _ => block.for_each_child(|child| open_gotos(child, out)),
    }
}

/// Branches of a construct that end where the construct ends.
fn branches(block: &StructuredBlock) -> Vec<&StructuredBlock> {
    match block {
        StructuredBlock::If {
            then,
            otherwise: Some(otherwise),
            ..
        } => vec![then, otherwise],
        StructuredBlock::Try { body, catches, .. } => core::iter::once(&**body)
            .chain(catches.iter().map(|catch| &catch.body))
            .collect(),
        _ => Vec::new(),
    }
}

fn branches_mut(block: &mut StructuredBlock) -> Vec<&mut StructuredBlock> {
    match block {
        StructuredBlock::If {
            then,
            otherwise: Some(otherwise),
            ..
        } => vec![then, otherwise],
        StructuredBlock::Try { body, catches, .. } => core::iter::once(&mut **body)
            .chain(catches.iter_mut().map(|catch| &mut catch.body))
            .collect(),
        _ => Vec::new(),
    }
}
