//! `switch` statements.
//!
//! A fresh switch has a goto in every case. The case blocks are pulled into the switch in code
//! order, a goto to the following case block becomes fallthrough, and a goto to the block after
//! the switch becomes `break`.

use super::block::{Jump, StructuredBlock};
use super::flow::BlockId;
use super::structurer::Structurer;
use core::mem;

impl Structurer<'_> {
    pub(super) fn switch(&mut self, a: BlockId) -> bool {
        let Some(StructuredBlock::Switch { cases, .. }) = self.content(a).last() else {
            return false;
        };
        let mut targets = Vec::new();
        let mut default = None;
        for case in cases {
            let StructuredBlock::Goto(target) = case.body else {
                return false;
            };
            targets.push(target);
            if case.is_default {
                default = Some(target);
            }
        }
        if targets.contains(&a) {
            return false;
        }

        // A default target placed after all cases and entered from elsewhere is where the switch
        // ends, not a case.
        let merge_is_default = default.is_some_and(|default| {
            targets.last() == Some(&default) && targets.len() > 1 && self.refs(default) > 1
        });
        let mut blocks: Vec<BlockId> = targets.clone();
        if merge_is_default {
            blocks.pop();
        }
        let merge = if merge_is_default {
            default
        } else {
            let last = blocks.last().copied();
            blocks
                .iter()
                .flat_map(|&block| self.flow.successors(block))
                .filter(|target| !blocks.contains(target) && *target != a)
                .filter(|&target| last.is_none_or(|last| target > last))
                .min()
        };

        for (i, &block) in blocks.iter().enumerate() {
            let fallthrough = i
                .checked_sub(1)
                .is_some_and(|i| {
                    self.content(blocks[i]).last() == Some(&StructuredBlock::Goto(block))
                });
            if block == self.flow.entry
                || self.refs(block) != 1 + usize::from(fallthrough)
                || !self.flow.compatible(a, block)
            {
                return false;
            }
            let next = blocks.get(i + 1).copied();
            let content = self.content(block);
            for target in content.gotos() {
                if blocks.contains(&target) && Some(target) != next {
                    return false;
                }
            }
            if let Some(next) = next {
                let to_next = content.gotos().iter().filter(|&&target| target == next).count();
                if to_next > 1
                    || (to_next == 1 && content.last() != Some(&StructuredBlock::Goto(next)))
                {
                    return false;
                }
            }
        }

        let label = self.flow.fresh_label();
        let mut bodies = Vec::with_capacity(blocks.len());
        for (i, &block) in blocks.iter().enumerate() {
            let mut body = self.absorb(a, block);
            if let Some(&next) = blocks.get(i + 1)
                && body.last() == Some(&StructuredBlock::Goto(next))
            {
                body.pop_last();
            }
            if let Some(merge) = merge {
                body.replace_gotos(merge, &StructuredBlock::Jump(Jump::Break(label)));
            }
            bodies.push((block, body));
        }

        let content = self.content_mut(a);
        let Some(StructuredBlock::Switch {
            selector,
            mut cases,
            ..
        }) = content.pop_last()
        else {
            unreachable!("checked above");
        };
        cases.retain(|case| !(case.is_default && merge_is_default));
        for case in &mut cases {
            let StructuredBlock::Goto(target) = case.body else {
                unreachable!("checked above");
            };
            case.body = match bodies.iter().position(|(block, _)| *block == target) {
                Some(index) => mem::take(&mut bodies[index].1),
                None => StructuredBlock::Jump(Jump::Break(label)),
            };
        }

        let mut items = vec![
            mem::take(content),
            StructuredBlock::Switch {
                label: Some(label),
                selector,
                cases,
            },
        ];
        items.extend(merge.map(StructuredBlock::Goto));
        *content = StructuredBlock::sequence(items);
        log::trace!("{a}: switch {label}");
        true
    }
}
