//! Rewrites of the structured tree that make it read like source code without changing what it
//! does: loop conditions, `synchronized`, catch variables, and removal of redundant jumps.

use super::block::{Jump, LoopKind, StructuredBlock};
use crate::ast::simplify::{negate, simplify};
use crate::ast::{Arena, ExprId, ExprKind, Label};
use crate::expr::operator::side_effects;
use crate::locals::LocalId;
use crate::types::SimpleType;
use crate::{DecompilerOptions, MethodContext};
use core::mem;
use rustc_hash::FxHashMap;

const MAX_PASSES: usize = 16;

pub fn cleanup(
    ctx: &MethodContext<'_>,
    body: &mut StructuredBlock,
    arena: &mut Arena,
    options: &DecompilerOptions,
) {
    rename_binders(arena, body);

    let mut cleaner = Cleaner {
        arena: &mut *arena,
        options,
        changed: false,
    };
    for _ in 0..MAX_PASSES {
        cleaner.changed = false;
        cleaner.block(body);
        if options.simplify && ctx.return_type == SimpleType::Void {
            cleaner.changed |= strip_tail(body, Jump::Return(None));
        }
        if !cleaner.changed {
            break;
        }
    }
    *body = StructuredBlock::sequence(mem::take(body).into_items());

    if options.simplify {
        let mut roots = Vec::new();
        body.visit(&mut |block| roots.extend(block.own_exprs()));
        for root in roots {
            simplify(arena, root, ctx.hierarchy);
        }
    }
}

struct Cleaner<'a> {
    arena: &'a mut Arena,
    options: &'a DecompilerOptions,
    changed: bool,
}

impl Cleaner<'_> {
    fn block(&mut self, block: &mut StructuredBlock) {
        block.for_each_child_mut(|child| self.block(child));
        if let StructuredBlock::Sequence(items) = block {
            let old = mem::take(items);
            *block = StructuredBlock::sequence(old);
        }

        if self.options.detect_synchronized
            && let StructuredBlock::Sequence(items) = block
            && self.synchronized(items)
        {
            self.changed = true;
        }
        if self.options.simplify && self.simplify(block) {
            self.changed = true;
        }
    }

    /// `monitorenter(lock = x); try { .. } finally { monitorexit(lock); }`
    fn synchronized(&mut self, items: &mut Vec<StructuredBlock>) -> bool {
        for i in 0..items.len() {
            let StructuredBlock::Statement(enter) = items[i] else {
                continue;
            };
            let ExprKind::MonitorEnter { object } = self.arena[enter].kind else {
                continue;
            };

            let (lock, value, start) = if let Some((lock, value)) = store(self.arena, object) {
                (lock, value, i)
            } else if let Some(lock) = local_of(self.arena, object)
                && let Some(StructuredBlock::Statement(previous)) =
                    i.checked_sub(1).map(|j| &items[j])
                && let Some((stored, value)) = store(self.arena, *previous)
                && stored == lock
            {
                (lock, value, i - 1)
            } else {
                continue;
            };

            let Some(StructuredBlock::Try {
                catches,
                finally: Some(finally),
                ..
            }) = items.get(i + 1)
            else {
                continue;
            };
            if !catches.is_empty() {
                continue;
            }
            let [StructuredBlock::Statement(exit)] = finally.items() else {
                continue;
            };
            let ExprKind::MonitorExit { object: released } = self.arena[*exit].kind else {
                continue;
            };
            if local_of(self.arena, released) != Some(lock) {
                continue;
            }

            let StructuredBlock::Try { body, .. } = items.remove(i + 1) else {
                unreachable!("matched above");
            };
            items.drain(start..=i);
            items.insert(
                start,
                StructuredBlock::Synchronized {
                    object: value,
                    body,
                },
            );
            return true;
        }
        false
    }

    fn simplify(&mut self, block: &mut StructuredBlock) -> bool {
        if drop_unused_label(block) {
            return true;
        }
        match block {
            StructuredBlock::Labeled { label, body } => {
                let label = *label;
                let mut changed = strip_tail(body, Jump::Break(label));
                if !body.references_label(label) {
                    *block = mem::take(&mut **body);
                    return true;
                }
                if let Some(inverted) = self.invert_labeled(label, body) {
                    *block = inverted;
                    changed = true;
                }
                changed
            }

            StructuredBlock::Loop {
                label: Some(label),
                kind: LoopKind::Infinite,
                body,
                ..
            } => {
                let label = *label;
                let changed = strip_tail(body, Jump::Continue(label));
                if let Some((condition, mut rest, after)) = self.pre_test(label, body) {
                    strip_tail(&mut rest, Jump::Continue(label));
                    let head = StructuredBlock::Loop {
                        label: Some(label),
                        kind: LoopKind::PreTest,
                        condition: Some(condition),
                        body: Box::new(rest),
                    };
                    *block = StructuredBlock::sequence(vec![head, after]);
                    return true;
                }
                if let Some((condition, rest)) = self.post_test(label, body) {
                    *block = StructuredBlock::Loop {
                        label: Some(label),
                        kind: LoopKind::PostTest,
                        condition: Some(condition),
                        body: Box::new(rest),
                    };
                    return true;
                }
                changed
            }

            StructuredBlock::If {
                condition,
                then,
                otherwise,
            } => {
                if otherwise.as_ref().is_some_and(|otherwise| otherwise.is_empty()) {
                    *otherwise = None;
                    return true;
                }
                if then.is_empty() {
                    if let Some(otherwise) = otherwise.take() {
                        *condition = negate(self.arena, *condition);
                        *then = otherwise;
                    } else {
                        let mut effects = Vec::new();
                        side_effects(self.arena, *condition, &mut effects);
                        *block = StructuredBlock::sequence(
                            effects.into_iter().map(StructuredBlock::Statement).collect(),
                        );
                    }
                    return true;
                }
                if then.diverges()
                    && let Some(otherwise) = otherwise.take()
                {
                    let head = StructuredBlock::If {
                        condition: *condition,
                        then: mem::take(then),
                        otherwise: None,
                    };
                    *block = StructuredBlock::sequence(vec![head, *otherwise]);
                    return true;
                }
                false
            }

            StructuredBlock::Switch {
                label: Some(label),
                cases,
                ..
            } => {
                let label = *label;
                cases
                    .last_mut()
                    .is_some_and(|case| strip_tail(&mut case.body, Jump::Break(label)))
            }

            _ => false,
        }
    }

    /// `L: { if (c) { a; break L; } b; }` is `if (c) { a; } else { b; }`.
    fn invert_labeled(&self, label: Label, body: &StructuredBlock) -> Option<StructuredBlock> {
        let items = body.items();
        let Some((
            StructuredBlock::If {
                condition,
                then,
                otherwise: None,
            },
            rest,
        )) = items.split_first()
        else {
            return None;
        };
        if then.last() != Some(&StructuredBlock::Jump(Jump::Break(label))) {
            return None;
        }
        let mut then = (**then).clone();
        then.pop_last();
        let rest = StructuredBlock::sequence(rest.to_vec());
        if then.references_label(label) || rest.references_label(label) {
            return None;
        }
        Some(StructuredBlock::If {
            condition: *condition,
            then: Box::new(then),
            otherwise: (!rest.is_empty()).then(|| Box::new(rest)),
        })
    }

    /// `while (true) { if (c) break; .. }` is `while (!c) { .. }`.
    ///
    /// Returns the condition, the new body and the code to put after the loop.
    fn pre_test(
        &mut self,
        label: Label,
        body: &StructuredBlock,
    ) -> Option<(ExprId, StructuredBlock, StructuredBlock)> {
        let items = body.items();
        let exit = StructuredBlock::Jump(Jump::Break(label));
        let repeat = StructuredBlock::Jump(Jump::Continue(label));
        let (condition, body) = match items {
            [
                StructuredBlock::If {
                    condition,
                    then,
                    otherwise: None,
                },
                rest @ ..,
            ] if **then == exit => (
                negate(self.arena, *condition),
                StructuredBlock::sequence(rest.to_vec()),
            ),
            // `while (true) { if (c) { ..; continue; } break; }`
            [
                StructuredBlock::If {
                    condition,
                    then,
                    otherwise: None,
                },
                last,
            ] if *last == exit && then.diverges() => (*condition, (**then).clone()),
            // `while (true) { if (c) { ..; continue; } ..; return; }` is
            // `while (c) { .. } ..; return;`
            [
                StructuredBlock::If {
                    condition,
                    then,
                    otherwise: None,
                },
                rest @ ..,
            ] if then.last() == Some(&repeat) => {
                let mut after = StructuredBlock::sequence(rest.to_vec());
                if !after.diverges() {
                    return None;
                }
                strip_tail(&mut after, Jump::Break(label));
                if after.references_label(label) {
                    return None;
                }
                return Some((*condition, (**then).clone(), after));
            }
            _ => return None,
        };
        Some((condition, body, StructuredBlock::EMPTY))
    }

    /// `while (true) { ..; if (c) break; }` is `do { .. } while (!c);` as long as nothing
    /// continues the loop from the middle.
    fn post_test(
        &mut self,
        label: Label,
        body: &StructuredBlock,
    ) -> Option<(ExprId, StructuredBlock)> {
        let items = body.items();
        let exit = StructuredBlock::Jump(Jump::Break(label));
        let repeat = StructuredBlock::Jump(Jump::Continue(label));
        let (condition, rest) = match items {
            [
                rest @ ..,
                StructuredBlock::If {
                    condition,
                    then,
                    otherwise: None,
                },
            ] if **then == exit => (negate(self.arena, *condition), rest),
            [
                rest @ ..,
                StructuredBlock::If {
                    condition,
                    then,
                    otherwise: None,
                },
                last,
            ] if **then == repeat && *last == exit => (*condition, rest),
            _ => return None,
        };
        let rest = StructuredBlock::sequence(rest.to_vec());
        let continues = {
            let mut found = false;
            rest.visit(&mut |block| found |= *block == repeat);
            found
        };
        (!continues).then_some((condition, rest))
    }
}

/// Forgets the label of a loop or switch that no jump refers to.
fn drop_unused_label(block: &mut StructuredBlock) -> bool {
    let (StructuredBlock::Loop {
        label: Some(name), ..
    }
    | StructuredBlock::Switch {
        label: Some(name), ..
    }) = *block
    else {
        return false;
    };
    let mut used = false;
    block.for_each_child(|child| used |= child.references_label(name));
    if used {
        return false;
    }
    if let StructuredBlock::Loop { label, .. } | StructuredBlock::Switch { label, .. } = block {
        *label = None;
    }
    true
}

/// Removes `jump` wherever it is the last thing executed before `block` completes normally.
fn strip_tail(block: &mut StructuredBlock, jump: Jump) -> bool {
    match block {
        StructuredBlock::Jump(found) if *found == jump => {
            *block = StructuredBlock::EMPTY;
            true
        }
        StructuredBlock::Sequence(items) => items
            .iter_mut()
            .rev()
            .find(|item| !item.is_empty())
            .is_some_and(|last| strip_tail(last, jump)),
        StructuredBlock::If {
            then, otherwise, ..
        } => {
            let a = strip_tail(then, jump);
            let b = otherwise
                .as_deref_mut()
                .is_some_and(|otherwise| strip_tail(otherwise, jump));
            a || b
        }
        StructuredBlock::Try { body, catches, .. } => {
            let mut changed = strip_tail(body, jump);
            for catch in catches {
                changed |= strip_tail(&mut catch.body, jump);
            }
            changed
        }
        StructuredBlock::Labeled { body, .. } | StructuredBlock::Synchronized { body, .. } => {
            strip_tail(body, jump)
        }
        _ => false,
    }
}

fn local_of(arena: &Arena, id: ExprId) -> Option<LocalId> {
    match arena[id].kind {
        ExprKind::Local(local) => Some(local),
        _ => None,
    }
}

/// `local = value`
fn store(arena: &Arena, id: ExprId) -> Option<(LocalId, ExprId)> {
    match arena[id].kind {
        ExprKind::Assign { target, value } => Some((local_of(arena, target)?, value)),
        _ => None,
    }
}

fn count_locals(arena: &Arena, id: ExprId, counts: &mut FxHashMap<LocalId, usize>) {
    if let ExprKind::Local(local) = arena[id].kind {
        *counts.entry(local).or_default() += 1;
    }
    for child in arena[id].subexprs() {
        count_locals(arena, child, counts);
    }
}

fn mentions(arena: &Arena, block: &StructuredBlock) -> FxHashMap<LocalId, usize> {
    let mut counts = FxHashMap::default();
    block.visit(&mut |block| {
        for root in block.own_exprs() {
            count_locals(arena, root, &mut counts);
        }
    });
    counts
}

/// `catch (E tmp) { e = tmp; .. }` is `catch (E e) { .. }` when neither variable is used
/// elsewhere.
fn rename_binders(arena: &Arena, body: &mut StructuredBlock) {
    let total = mentions(arena, body);
    body.visit_mut(&mut |block| {
        let StructuredBlock::Try { catches, .. } = block else {
            return;
        };
        for catch in catches {
            let Some(StructuredBlock::Statement(first)) = catch.body.items().first() else {
                continue;
            };
            let Some((variable, value)) = store(arena, *first) else {
                continue;
            };
            if local_of(arena, value) != Some(catch.binder)
                || total.get(&catch.binder) != Some(&1)
                || mentions(arena, &catch.body).get(&variable) != total.get(&variable)
            {
                continue;
            }
            let mut items = mem::take(&mut catch.body).into_items();
            items.remove(0);
            catch.body = StructuredBlock::sequence(items);
            catch.binder = variable;
        }
    });
}
