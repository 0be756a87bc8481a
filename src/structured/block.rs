use super::flow::BlockId;
use crate::ast::isomorphism::{Checker, Isomorphic};
use crate::ast::{Arena, DebugIr, ExprId, Label};
use crate::locals::LocalId;
use core::fmt;

/// A node of the structured control flow tree.
#[derive(Clone, Debug, PartialEq)]
pub enum StructuredBlock {
    Statement(ExprId),
    Sequence(Vec<StructuredBlock>),
    If {
        condition: ExprId,
        then: Box<StructuredBlock>,
        otherwise: Option<Box<StructuredBlock>>,
    },
    Loop {
        /// `None` once nothing breaks out of or continues the loop by name.
        label: Option<Label>,
        kind: LoopKind,
        // `None` for infinite loops
        condition: Option<ExprId>,
        body: Box<StructuredBlock>,
    },
    Switch {
        label: Option<Label>,
        selector: ExprId,
        cases: Vec<Case>,
    },
    Try {
        body: Box<StructuredBlock>,
        catches: Vec<Catch>,
        finally: Option<Box<StructuredBlock>>,
    },
    Synchronized {
        object: ExprId,
        body: Box<StructuredBlock>,
    },
    Jump(Jump),
    Labeled {
        label: Label,
        body: Box<StructuredBlock>,
    },
    /// An edge to another flow block that hasn't been absorbed into a construct yet.
    Goto(BlockId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopKind {
    /// `while (condition)`
    PreTest,
    /// `do ... while (condition)`
    PostTest,
    /// `while (true)`
    Infinite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Jump {
    Break(Label),
    Continue(Label),
    Return(Option<ExprId>),
    Throw(ExprId),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Case {
    pub values: Vec<i32>,
    pub is_default: bool,
    pub body: StructuredBlock,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Catch {
    // `None` for catch-all handlers
    pub class: Option<String>,
    pub binder: LocalId,
    pub body: StructuredBlock,
}

impl StructuredBlock {
    pub const EMPTY: Self = Self::Sequence(Vec::new());

    pub fn sequence(items: Vec<Self>) -> Self {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            item.flatten_into(&mut out);
        }
        if out.len() == 1 {
            out.pop().expect("length checked above")
        } else {
            Self::Sequence(out)
        }
    }

    fn flatten_into(self, out: &mut Vec<Self>) {
        match self {
            Self::Sequence(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
            item => out.push(item),
        }
    }

    /// The block with its top-level sequence split into items.
    pub fn into_items(self) -> Vec<Self> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    pub fn items(&self) -> &[Self] {
        match self {
            Self::Sequence(items) => items,
            item => core::slice::from_ref(item),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Sequence(items) => items.iter().all(Self::is_empty),
            _ => false,
        }
    }

    /// The last statement executed when the block completes, looking through sequences.
    pub fn last(&self) -> Option<&Self> {
        match self {
            Self::Sequence(items) => items.iter().rev().find(|item| !item.is_empty())?.last(),
            item => Some(item),
        }
    }

    /// Removes the last statement, which must be a leaf.
    pub fn pop_last(&mut self) -> Option<Self> {
        match self {
            Self::Sequence(items) => {
                while let Some(item) = items.last_mut() {
                    if item.is_empty() {
                        items.pop();
                        continue;
                    }
                    return match item {
                        Self::Sequence(_) => item.pop_last(),
                        _ => items.pop(),
                    };
                }
                None
            }
            _ => Some(core::mem::replace(self, Self::EMPTY)),
        }
    }

    /// Whether control never completes normally, i.e. never falls out of the block's end.
    pub fn diverges(&self) -> bool {
        match self.last() {
            Some(Self::Jump(_) | Self::Goto(_)) => true,
            Some(Self::If {
                then,
                otherwise: Some(otherwise),
                ..
            }) => then.diverges() && otherwise.diverges(),
            Some(Self::Loop {
                label,
                kind: LoopKind::Infinite,
                body,
                ..
            }) => label.is_none_or(|label| !body.breaks_to(label)),
            Some(Self::Try {
                body,
                catches,
                finally,
            }) => {
                finally.as_ref().is_some_and(|finally| finally.diverges())
                    || (body.diverges() && catches.iter().all(|catch| catch.body.diverges()))
            }
            Some(Self::Synchronized { body, .. }) => body.diverges(),
            Some(Self::Labeled { label, body }) => body.diverges() && !body.breaks_to(*label),
            _ => false,
        }
    }

    /// Whether a `break label` occurs anywhere inside.
    pub fn breaks_to(&self, label: Label) -> bool {
        let mut found = false;
        self.visit(&mut |block| found |= *block == Self::Jump(Jump::Break(label)));
        found
    }

    /// Whether a `break label` or `continue label` occurs anywhere inside.
    pub fn references_label(&self, label: Label) -> bool {
        let mut found = false;
        self.visit(&mut |block| {
            found |= matches!(
                block,
                Self::Jump(Jump::Break(target) | Jump::Continue(target)) if *target == label
            );
        });
        found
    }

    /// Calls `f` on every block in preorder.
    pub fn visit(&self, f: &mut impl FnMut(&Self)) {
        f(self);
        self.for_each_child(|child| child.visit(f));
    }

    /// Calls `f` on every block in postorder, so that children are rewritten before parents.
    pub fn visit_mut(&mut self, f: &mut impl FnMut(&mut Self)) {
        self.for_each_child_mut(|child| child.visit_mut(f));
        f(self);
    }

    pub fn for_each_child(&self, mut f: impl FnMut(&Self)) {
        match self {
            Self::Sequence(items) => items.iter().for_each(f),
            Self::If {
                then, otherwise, ..
            } => {
                f(then);
                if let Some(otherwise) = otherwise {
                    f(otherwise);
                }
            }
            Self::Loop { body, .. }
            | Self::Synchronized { body, .. }
            | Self::Labeled { body, .. } => f(body),
            Self::Switch { cases, .. } => cases.iter().for_each(|case| f(&case.body)),
            Self::Try {
                body,
                catches,
                finally,
            } => {
                f(body);
                catches.iter().for_each(|catch| f(&catch.body));
                if let Some(finally) = finally {
                    f(finally);
                }
            }
            Self::Statement(_) | Self::Jump(_) | Self::Goto(_) => {}
        }
    }

    pub fn for_each_child_mut(&mut self, mut f: impl FnMut(&mut Self)) {
        match self {
            Self::Sequence(items) => items.iter_mut().for_each(f),
            Self::If {
                then, otherwise, ..
            } => {
                f(then);
                if let Some(otherwise) = otherwise {
                    f(otherwise);
                }
            }
            Self::Loop { body, .. }
            | Self::Synchronized { body, .. }
            | Self::Labeled { body, .. } => f(body),
            Self::Switch { cases, .. } => cases.iter_mut().for_each(|case| f(&mut case.body)),
            Self::Try {
                body,
                catches,
                finally,
            } => {
                f(body);
                catches.iter_mut().for_each(|catch| f(&mut catch.body));
                if let Some(finally) = finally {
                    f(finally);
                }
            }
            Self::Statement(_) | Self::Jump(_) | Self::Goto(_) => {}
        }
    }

    /// Expression roots directly owned by this block, not by its children, in evaluation order.
    pub fn own_exprs(&self) -> Vec<ExprId> {
        match self {
            Self::Statement(expr)
            | Self::If {
                condition: expr, ..
            }
            | Self::Switch { selector: expr, .. }
            | Self::Synchronized { object: expr, .. }
            | Self::Jump(Jump::Return(Some(expr)) | Jump::Throw(expr)) => vec![*expr],
            Self::Loop {
                condition: Some(expr),
                ..
            } => vec![*expr],
            _ => Vec::new(),
        }
    }

    pub fn own_exprs_mut(&mut self) -> Vec<&mut ExprId> {
        match self {
            Self::Statement(expr)
            | Self::If {
                condition: expr, ..
            }
            | Self::Switch { selector: expr, .. }
            | Self::Synchronized { object: expr, .. }
            | Self::Jump(Jump::Return(Some(expr)) | Jump::Throw(expr)) => vec![expr],
            Self::Loop {
                condition: Some(expr),
                ..
            } => vec![expr],
            _ => Vec::new(),
        }
    }

    /// Goto targets anywhere inside, with multiplicity.
    pub fn gotos(&self) -> Vec<BlockId> {
        let mut out = Vec::new();
        self.visit(&mut |block| {
            if let Self::Goto(target) = block {
                out.push(*target);
            }
        });
        out
    }

    /// Replaces every `goto from` with `to`.
    pub fn replace_gotos(&mut self, from: BlockId, to: &Self) {
        self.visit_mut(&mut |block| {
            if *block == Self::Goto(from) {
                *block = to.clone();
            }
        });
    }
}

impl Default for StructuredBlock {
    fn default() -> Self {
        Self::EMPTY
    }
}

struct Indented<'a> {
    block: &'a StructuredBlock,
    depth: usize,
}

impl Indented<'_> {
    fn nested<'b>(&self, block: &'b StructuredBlock) -> Indented<'b> {
        Indented {
            block,
            depth: self.depth + 1,
        }
    }

    fn pad(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:1$}", "", self.depth * 4)
    }

    fn fmt(&self, f: &mut fmt::Formatter<'_>, arena: &Arena) -> fmt::Result {
        let block = self.block;
        if let StructuredBlock::Sequence(items) = block {
            for item in items {
                Indented {
                    block: item,
                    depth: self.depth,
                }
                .fmt(f, arena)?;
            }
            return Ok(());
        }

        self.pad(f)?;
        match block {
            StructuredBlock::Sequence(_) => unreachable!(),
            StructuredBlock::Statement(expr) => writeln!(f, "{};", arena.debug(expr)),
            StructuredBlock::If {
                condition,
                then,
                otherwise,
            } => {
                writeln!(f, "if ({}) {{", arena.debug(condition))?;
                self.nested(then).fmt(f, arena)?;
                if let Some(otherwise) = otherwise {
                    self.pad(f)?;
                    writeln!(f, "}} else {{")?;
                    self.nested(otherwise).fmt(f, arena)?;
                }
                self.pad(f)?;
                writeln!(f, "}}")
            }
            StructuredBlock::Loop {
                label,
                kind,
                condition,
                body,
            } => {
                let condition = condition.map(|condition| arena.debug(&condition).to_string());
                if let Some(label) = label {
                    write!(f, "{label}: ")?;
                }
                match kind {
                    LoopKind::PostTest => writeln!(f, "do {{")?,
                    LoopKind::PreTest => writeln!(
                        f,
                        "while ({}) {{",
                        condition.as_deref().unwrap_or("true")
                    )?,
                    LoopKind::Infinite => writeln!(f, "while (true) {{")?,
                }
                self.nested(body).fmt(f, arena)?;
                self.pad(f)?;
                match kind {
                    LoopKind::PostTest => {
                        writeln!(f, "}} while ({});", condition.as_deref().unwrap_or("true"))
                    }
                    _ => writeln!(f, "}}"),
                }
            }
            StructuredBlock::Switch {
                label,
                selector,
                cases,
            } => {
                if let Some(label) = label {
                    write!(f, "{label}: ")?;
                }
                writeln!(f, "switch ({}) {{", arena.debug(selector))?;
                for case in cases {
                    self.pad(f)?;
                    for value in &case.values {
                        write!(f, "case {value}: ")?;
                    }
                    if case.is_default {
                        write!(f, "default:")?;
                    }
                    writeln!(f)?;
                    self.nested(&case.body).fmt(f, arena)?;
                }
                self.pad(f)?;
                writeln!(f, "}}")
            }
            StructuredBlock::Try {
                body,
                catches,
                finally,
            } => {
                writeln!(f, "try {{")?;
                self.nested(body).fmt(f, arena)?;
                for catch in catches {
                    self.pad(f)?;
                    let class = catch.class.as_deref().unwrap_or("*").replace('/', ".");
                    writeln!(f, "}} catch ({class} {}) {{", catch.binder)?;
                    self.nested(&catch.body).fmt(f, arena)?;
                }
                if let Some(finally) = finally {
                    self.pad(f)?;
                    writeln!(f, "}} finally {{")?;
                    self.nested(finally).fmt(f, arena)?;
                }
                self.pad(f)?;
                writeln!(f, "}}")
            }
            StructuredBlock::Synchronized { object, body } => {
                writeln!(f, "synchronized ({}) {{", arena.debug(object))?;
                self.nested(body).fmt(f, arena)?;
                self.pad(f)?;
                writeln!(f, "}}")
            }
            StructuredBlock::Jump(jump) => match jump {
                Jump::Break(label) => writeln!(f, "break {label};"),
                Jump::Continue(label) => writeln!(f, "continue {label};"),
                Jump::Return(None) => writeln!(f, "return;"),
                Jump::Return(Some(value)) => writeln!(f, "return {};", arena.debug(value)),
                Jump::Throw(value) => writeln!(f, "throw {};", arena.debug(value)),
            },
            StructuredBlock::Labeled { label, body } => {
                writeln!(f, "{label}: {{")?;
                self.nested(body).fmt(f, arena)?;
                self.pad(f)?;
                writeln!(f, "}}")
            }
            StructuredBlock::Goto(target) => writeln!(f, "goto {target};"),
        }
    }
}

impl DebugIr for StructuredBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>, arena: &Arena) -> fmt::Result {
        Indented {
            block: self,
            depth: 0,
        }
        .fmt(f, arena)
    }
}

impl Isomorphic for StructuredBlock {
    fn compare(&self, other: &Self, checker: &mut Checker<'_>) -> bool {
        match (self, other) {
            (Self::Statement(x), Self::Statement(y)) => checker.compare(x, y),
            (Self::Sequence(x), Self::Sequence(y)) => checker.compare(x, y),
            (
                Self::If {
                    condition: cx,
                    then: tx,
                    otherwise: ox,
                },
                Self::If {
                    condition: cy,
                    then: ty,
                    otherwise: oy,
                },
            ) => checker.compare(cx, cy) && checker.compare(tx, ty) && checker.compare(ox, oy),
            (
                Self::Loop {
                    label: lx,
                    kind: kx,
                    condition: cx,
                    body: bx,
                },
                Self::Loop {
                    label: ly,
                    kind: ky,
                    condition: cy,
                    body: by,
                },
            ) => {
                define_labels(checker, *lx, *ly)
                    && kx == ky
                    && checker.compare(cx, cy)
                    && checker.compare(bx, by)
            }
            (
                Self::Switch {
                    label: lx,
                    selector: sx,
                    cases: cx,
                },
                Self::Switch {
                    label: ly,
                    selector: sy,
                    cases: cy,
                },
            ) => {
                define_labels(checker, *lx, *ly)
                    && checker.compare(sx, sy)
                    && cx.len() == cy.len()
                    && cx.iter().zip(cy).all(|(x, y)| {
                        x.values == y.values
                            && x.is_default == y.is_default
                            && checker.compare(&x.body, &y.body)
                    })
            }
            (
                Self::Try {
                    body: bx,
                    catches: cx,
                    finally: fx,
                },
                Self::Try {
                    body: by,
                    catches: cy,
                    finally: fy,
                },
            ) => {
                checker.compare(bx, by)
                    && cx.len() == cy.len()
                    && cx.iter().zip(cy).all(|(x, y)| {
                        x.class == y.class
                            && checker.compare_locals(x.binder, y.binder)
                            && checker.compare(&x.body, &y.body)
                    })
                    && checker.compare(fx, fy)
            }
            (
                Self::Synchronized {
                    object: ox,
                    body: bx,
                },
                Self::Synchronized {
                    object: oy,
                    body: by,
                },
            ) => checker.compare(ox, oy) && checker.compare(bx, by),
            (Self::Jump(x), Self::Jump(y)) => match (x, y) {
                (Jump::Break(x), Jump::Break(y)) | (Jump::Continue(x), Jump::Continue(y)) => {
                    checker.compare_labels(*x, *y)
                }
                (Jump::Return(x), Jump::Return(y)) => checker.compare(x, y),
                (Jump::Throw(x), Jump::Throw(y)) => checker.compare(x, y),
                _ => false,
            },
            (Self::Labeled { label: lx, body: bx }, Self::Labeled { label: ly, body: by }) => {
                checker.define_label(*lx, *ly);
                checker.compare(bx, by)
            }
            (Self::Goto(x), Self::Goto(y)) => x == y,
            _ => false,
        }
    }
}

fn define_labels(checker: &mut Checker<'_>, x: Option<Label>, y: Option<Label>) -> bool {
    match (x, y) {
        (Some(x), Some(y)) => {
            checker.define_label(x, y);
            true
        }
        (None, None) => true,
        _ => false,
    }
}
