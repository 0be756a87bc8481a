//! `try`..`catch` and `try`..`finally`.
//!
//! A clause is turned into a `try` once everything it covers has been reduced to a single block.
//! Handlers entered from nowhere else are then moved into their `catch`. A catch-all handler that
//! stores the exception, runs some code and rethrows is then recognized as a `finally` if every
//! other way out of the `try` runs a copy of the same code.

use super::block::{Catch, Jump, StructuredBlock};
use super::flow::{BlockId, FlowGraph};
use super::structurer::Structurer;
use crate::ast::isomorphism::compare;
use crate::ast::{Arena, ExprId, ExprKind, Label};
use crate::locals::LocalId;
use core::mem;
use rustc_hash::FxHashMap;

impl Structurer<'_> {
    /// Forms the innermost clause whose covered code has collapsed into one block.
    pub(super) fn try_catch(&mut self) -> bool {
        let mut live: Vec<(u32, usize)> = self
            .flow
            .live_clauses()
            .map(|(index, clause)| (clause.span(), index))
            .collect();
        live.sort_unstable();

        for (_, index) in live {
            let covered: Vec<BlockId> = self
                .flow
                .blocks()
                .filter(|(_, block)| block.coverage.contains(&index))
                .map(|(id, _)| id)
                .collect();
            match covered[..] {
                [] => {
                    log::trace!("clause {index} covers no throwing code");
                    self.flow.retire_clause(index);
                    return true;
                }
                [b] => {
                    if self.form_try(index, b) {
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }

    fn form_try(&mut self, index: usize, b: BlockId) -> bool {
        let ranges = self.flow.clauses[index].ranges.clone();
        let group: Vec<usize> = self
            .flow
            .live_clauses()
            .filter(|(_, clause)| clause.ranges == ranges)
            .map(|(index, _)| index)
            .collect();
        if group
            .iter()
            .any(|&index| self.flow.clauses[index].handler == b)
        {
            return false;
        }
        for &index in &group {
            let only_b = self
                .flow
                .blocks()
                .all(|(id, block)| id == b || !block.coverage.contains(&index));
            if !only_b {
                return false;
            }
        }

        let catches: Vec<Catch> = group
            .iter()
            .map(|&index| {
                let clause = &self.flow.clauses[index];
                Catch {
                    class: clause.class.clone(),
                    binder: clause.binder,
                    body: StructuredBlock::Goto(clause.handler),
                }
            })
            .collect();
        let handlers: Vec<BlockId> = group
            .iter()
            .map(|&index| self.flow.clauses[index].handler)
            .collect();
        for &index in &group {
            self.flow.retire_clause(index);
        }

        let content = self.content_mut(b);
        *content = StructuredBlock::Try {
            body: Box::new(mem::take(content)),
            catches,
            finally: None,
        };
        log::debug!("{b}: try with {} catches", handlers.len());

        self.refs = self.flow.references();
        for handler in handlers {
            if self.inlinable(b, handler) {
                let code = self.absorb(b, handler);
                if let StructuredBlock::Try { catches, .. } = self.content_mut(b) {
                    for catch in catches {
                        catch.body.replace_gotos(handler, &code);
                    }
                }
            }
        }
        true
    }

    /// Turns a catch-all handler that rethrows into a `finally`, removing the copies of its code
    /// from the other exits of the `try`.
    pub(super) fn finally(&mut self, a: BlockId) -> bool {
        if !self.options.merge_finally {
            return false;
        }
        let mut content = mem::take(self.content_mut(a));
        let mut merger = Merger {
            arena: self.arena,
            flow: &self.flow,
            refs: &self.refs,
            prefixed: Vec::new(),
        };
        let merged = merger.merge_in(&mut content);
        let prefixed = mem::take(&mut merger.prefixed);
        *self.content_mut(a) = content;

        if merged {
            for (target, length) in prefixed {
                let content = self.content_mut(target);
                let mut items = mem::take(content).into_items();
                items.drain(..length);
                *content = StructuredBlock::sequence(items);
            }
            log::debug!("{a}: merged finally");
        }
        merged
    }
}

struct Merger<'a> {
    arena: &'a Arena,
    flow: &'a FlowGraph,
    refs: &'a FxHashMap<BlockId, usize>,
    /// Blocks starting with a copy of the `finally` code, with its length.
    prefixed: Vec<(BlockId, usize)>,
}

impl Merger<'_> {
    fn merge_in(&mut self, block: &mut StructuredBlock) -> bool {
        let mut items = mem::take(block).into_items();
        let mut merged = (0..items.len()).any(|i| self.merge_at(&mut items, i));
        if !merged {
            for item in &mut items {
                item.for_each_child_mut(|child| merged = merged || self.merge_in(child));
                if merged {
                    break;
                }
            }
        }
        *block = StructuredBlock::sequence(items);
        merged
    }

    fn merge_at(&mut self, items: &mut Vec<StructuredBlock>, i: usize) -> bool {
        let StructuredBlock::Try {
            catches,
            finally: None,
            ..
        } = &items[i]
        else {
            return false;
        };
        let Some(handler) = catches.last().filter(|catch| catch.class.is_none()) else {
            return false;
        };
        let Some(code) = finally_code(self.arena, handler) else {
            return false;
        };

        let mut candidate = items[i].clone();
        if self.strip_exits(&mut candidate, &code, true) {
            items[i] = candidate;
            return true;
        }

        // The copy for normal completion may have been left after the `try`.
        let following = i + 1..i + 1 + code.len();
        if following.end <= items.len() && compare(self.arena, &code[..], &items[following.clone()])
        {
            let mut candidate = items[i].clone();
            if self.strip_exits(&mut candidate, &code, false) {
                items[i] = candidate;
                items.drain(following);
                return true;
            }
        }
        false
    }

    /// Removes the catch-all and the copies of `code` on the way out of the `try`, and installs
    /// `code` as its `finally`.
    fn strip_exits(
        &mut self,
        block: &mut StructuredBlock,
        code: &[StructuredBlock],
        tail: bool,
    ) -> bool {
        let StructuredBlock::Try {
            body,
            catches,
            finally,
        } = block
        else {
            unreachable!("called on a try");
        };
        catches.pop();
        let mut stripper = Stripper {
            arena: self.arena,
            flow: self.flow,
            refs: self.refs,
            code,
            inner: Vec::new(),
            prefixed: Vec::new(),
        };
        if !stripper.strip(body, tail)
            || !catches
                .iter_mut()
                .all(|catch| stripper.strip(&mut catch.body, tail))
        {
            return false;
        }
        if stripper
            .prefixed
            .iter()
            .any(|target| self.prefixed.iter().any(|(seen, _)| seen == target))
        {
            return false;
        }
        self.prefixed
            .extend(stripper.prefixed.into_iter().map(|target| (target, code.len())));
        *finally = Some(Box::new(StructuredBlock::sequence(code.to_vec())));

        // `try { try { .. } catch .. } finally { .. }` reads better as a single statement.
        if catches.is_empty()
            && let StructuredBlock::Try {
                finally: None,
                ..
            } = **body
        {
            let StructuredBlock::Try {
                body: inner_body,
                catches: inner_catches,
                ..
            } = mem::take(&mut **body)
            else {
                unreachable!("matched above");
            };
            *body = inner_body;
            *catches = inner_catches;
        }
        true
    }
}

/// The code of a `finally` handler: `[t = binder;] code; throw t;`.
fn finally_code(arena: &Arena, handler: &Catch) -> Option<Vec<StructuredBlock>> {
    let (StructuredBlock::Jump(Jump::Throw(thrown)), rest) = handler.body.items().split_last()?
    else {
        return None;
    };
    let thrown = local_of(arena, *thrown)?;

    let mut stored = handler.binder;
    let mut rest = rest;
    if let Some((StructuredBlock::Statement(first), tail)) = rest.split_first()
        && let ExprKind::Assign { target, value } = arena[*first].kind
        && local_of(arena, value) == Some(handler.binder)
        && let Some(target) = local_of(arena, target)
    {
        stored = target;
        rest = tail;
    }

    let code = StructuredBlock::sequence(rest.to_vec());
    if thrown != stored || rest.is_empty() || !code.gotos().is_empty() {
        return None;
    }
    Some(rest.to_vec())
}

fn local_of(arena: &Arena, id: ExprId) -> Option<LocalId> {
    match arena[id].kind {
        ExprKind::Local(local) => Some(local),
        _ => None,
    }
}

/// Removes copies of `code` before every exit of a region.
struct Stripper<'a> {
    arena: &'a Arena,
    flow: &'a FlowGraph,
    refs: &'a FxHashMap<BlockId, usize>,
    code: &'a [StructuredBlock],
    /// Labels defined inside the region.
    inner: Vec<Label>,
    prefixed: Vec<BlockId>,
}

impl Stripper<'_> {
    fn is_copy(&self, items: &[StructuredBlock]) -> bool {
        compare(self.arena, self.code, items)
    }

    fn escapes(&self, item: &StructuredBlock) -> bool {
        match item {
            StructuredBlock::Goto(_) | StructuredBlock::Jump(Jump::Return(_)) => true,
            StructuredBlock::Jump(Jump::Break(label) | Jump::Continue(label)) => {
                !self.inner.contains(label)
            }
            _ => false,
        }
    }

    /// `tail` is set when completing `block` normally leaves the region.
    fn strip(&mut self, block: &mut StructuredBlock, tail: bool) -> bool {
        let mut items = mem::take(block).into_items();
        let ok = self.strip_items(&mut items, tail);
        *block = StructuredBlock::sequence(items);
        ok
    }

    fn strip_items(&mut self, items: &mut Vec<StructuredBlock>, tail: bool) -> bool {
        let n = self.code.len();
        let mut tail = tail && !items.last().is_some_and(StructuredBlock::diverges);
        if tail && items.len() >= n && self.is_copy(&items[items.len() - n..]) {
            items.truncate(items.len() - n);
            tail = false;
        }

        let mut i = 0;
        while i < items.len() {
            if self.escapes(&items[i]) {
                if i >= n && self.is_copy(&items[i - n..i]) {
                    items.drain(i - n..i);
                    i -= n;
                } else if let StructuredBlock::Goto(target) = items[i]
                    && self.starts_with_copy(target)
                {
                    self.prefixed.push(target);
                } else {
                    return false;
                }
            } else {
                let last = tail && i + 1 == items.len();
                if !self.strip_nested(&mut items[i], last) {
                    return false;
                }
            }
            i += 1;
        }
        true
    }

    fn starts_with_copy(&self, target: BlockId) -> bool {
        if self.refs.get(&target) != Some(&1) || self.prefixed.contains(&target) {
            return false;
        }
        let Some(block) = self.flow.get(target) else {
            return false;
        };
        let items = block.content.items();
        items.len() >= self.code.len() && self.is_copy(&items[..self.code.len()])
    }

    fn strip_nested(&mut self, item: &mut StructuredBlock, tail: bool) -> bool {
        match item {
            StructuredBlock::Statement(_) | StructuredBlock::Jump(_) | StructuredBlock::Goto(_) => {
                !tail
            }
            StructuredBlock::Sequence(_) => self.strip(item, tail),
            StructuredBlock::If {
                then, otherwise, ..
            } => {
                if tail && otherwise.is_none() {
                    return false;
                }
                self.strip(then, tail)
                    && otherwise
                        .as_deref_mut()
                        .is_none_or(|otherwise| self.strip(otherwise, tail))
            }
            StructuredBlock::Loop { label, body, .. } => {
                if tail {
                    return false;
                }
                self.inner.extend(*label);
                self.strip(body, false)
            }
            StructuredBlock::Switch { label, cases, .. } => {
                if tail {
                    return false;
                }
                self.inner.extend(*label);
                cases.iter_mut().all(|case| self.strip(&mut case.body, false))
            }
            StructuredBlock::Labeled { label, body } => {
                if tail && body.breaks_to(*label) {
                    return false;
                }
                self.inner.push(*label);
                self.strip(body, tail)
            }
            StructuredBlock::Try { body, catches, .. } => {
                self.strip(body, tail)
                    && catches.iter_mut().all(|catch| self.strip(&mut catch.body, tail))
            }
            StructuredBlock::Synchronized { body, .. } => self.strip(body, tail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ExprKind;
    use crate::locals::LocalId;
    use crate::types::Type;

    fn statement(arena: &mut Arena, local: u32) -> StructuredBlock {
        StructuredBlock::Statement(arena.add(ExprKind::Local(LocalId(local)), Type::int_slot()))
    }

    fn handler(arena: &mut Arena) -> Catch {
        let binder = LocalId(100);
        let stored = LocalId(101);
        let target = arena.add(ExprKind::Local(stored), Type::UNKNOWN);
        let value = arena.add(ExprKind::Local(binder), Type::UNKNOWN);
        let store = arena.add(ExprKind::Assign { target, value }, Type::UNKNOWN);
        let thrown = arena.add(ExprKind::Local(stored), Type::UNKNOWN);
        let code = statement(arena, 7);
        Catch {
            class: None,
            binder,
            body: StructuredBlock::sequence(vec![
                StructuredBlock::Statement(store),
                code,
                StructuredBlock::Jump(Jump::Throw(thrown)),
            ]),
        }
    }

    fn merge(arena: &Arena, flow: &FlowGraph, block: &mut StructuredBlock) -> bool {
        let refs = flow.references();
        let mut merger = Merger {
            arena,
            flow,
            refs: &refs,
            prefixed: Vec::new(),
        };
        merger.merge_in(block)
    }

    #[test]
    fn rethrowing_handler_is_finally_code() {
        let mut arena = Arena::new();
        let catch = handler(&mut arena);
        let code = finally_code(&arena, &catch).expect("handler rethrows");
        assert_eq!(code.len(), 1);
        assert_eq!(arena.debug(&code[0]).to_string(), "v7;\n");

        let mut swallowing = catch.clone();
        swallowing.body.pop_last();
        assert!(finally_code(&arena, &swallowing).is_none());
    }

    #[test]
    fn copies_before_exits_are_removed() {
        let mut arena = Arena::new();
        let catch = handler(&mut arena);
        let work = StructuredBlock::Statement(arena.int(1));
        let copy = statement(&mut arena, 7);
        let early = statement(&mut arena, 7);
        let condition = arena.add(ExprKind::Local(LocalId(2)), Type::int_slot());
        let mut block = StructuredBlock::Try {
            body: Box::new(StructuredBlock::sequence(vec![
                StructuredBlock::If {
                    condition,
                    then: Box::new(StructuredBlock::sequence(vec![
                        early,
                        StructuredBlock::Jump(Jump::Return(None)),
                    ])),
                    otherwise: None,
                },
                work,
                copy,
            ])),
            catches: vec![catch],
            finally: None,
        };

        assert!(merge(&arena, &FlowGraph::new(), &mut block));
        assert_eq!(
            arena.debug(&block).to_string(),
            "try {\n    if (v2) {\n        return;\n    }\n    1;\n} finally {\n    v7;\n}\n"
        );
    }

    #[test]
    fn missing_copy_keeps_the_catch() {
        let mut arena = Arena::new();
        let catch = handler(&mut arena);
        let work = StructuredBlock::Statement(arena.int(1));
        let mut block = StructuredBlock::Try {
            body: Box::new(StructuredBlock::sequence(vec![
                work,
                StructuredBlock::Jump(Jump::Return(None)),
            ])),
            catches: vec![catch],
            finally: None,
        };
        let before = block.clone();
        assert!(!merge(&arena, &FlowGraph::new(), &mut block));
        assert_eq!(block, before);
    }

    #[test]
    fn copy_after_the_try_counts_as_normal_completion() {
        let mut arena = Arena::new();
        let catch = handler(&mut arena);
        let work = StructuredBlock::Statement(arena.int(1));
        let copy = statement(&mut arena, 7);
        let mut block = StructuredBlock::sequence(vec![
            StructuredBlock::Try {
                body: Box::new(work),
                catches: vec![catch],
                finally: None,
            },
            copy,
            StructuredBlock::Jump(Jump::Return(None)),
        ]);
        assert!(merge(&arena, &FlowGraph::new(), &mut block));
        assert_eq!(
            arena.debug(&block).to_string(),
            "try {\n    1;\n} finally {\n    v7;\n}\nreturn;\n"
        );
    }
}
