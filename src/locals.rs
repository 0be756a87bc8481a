//! Logical local variables.
//!
//! Every write to a bytecode slot creates a fresh logical variable, and every read resolves to the
//! variables whose writes can reach it. When a read can see several writes, they necessarily denote
//! one source-level variable, so they are merged in a union-find structure: the later variable
//! becomes a shadow of the earlier one and its type is intersected into the representative's.

use crate::MethodContext;
use crate::ast::{Arena, ExprId, ExprKind};
use crate::instruction::LocalVariable;
use crate::structured::{BlockId, FlowGraph, StructuredBlock};
use crate::types::{ClassHierarchy, Type};
use crate::union_find::UnionFind;
use alloc::collections::BTreeSet;
use core::fmt::{self, Display};
use rustc_hash::FxHashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

impl Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Where a value lives in the abstract machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlotKey {
    /// A local variable slot.
    Slot(u16),
    /// An operand stack position, counted in values from the bottom.
    Stack(u16),
    /// A temporary introduced by the decompiler itself.
    Synthetic(u16),
}

impl Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slot(n) => write!(f, "slot{n}"),
            Self::Stack(n) => write!(f, "stack{n}"),
            Self::Synthetic(n) => write!(f, "tmp{n}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LocalInfo {
    pub key: SlotKey,
    pub ty: Type,
    pub name: Option<String>,
    pub is_parameter: bool,
    // Set once the type becomes contradictory, after which constraints are ignored.
    conflicted: bool,
}

#[derive(Clone, Debug, Default)]
pub struct LocalTable {
    infos: Vec<LocalInfo>,
    sets: UnionFind,
}

impl LocalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self, key: SlotKey, ty: Type) -> LocalId {
        let id = self.sets.push();
        self.infos.push(LocalInfo {
            key,
            ty,
            name: None,
            is_parameter: false,
            conflicted: false,
        });
        LocalId(id)
    }

    pub fn parameter(&mut self, slot: u16, ty: Type, name: Option<&str>) -> LocalId {
        let id = self.fresh(SlotKey::Slot(slot), ty);
        let info = &mut self.infos[id.0 as usize];
        info.is_parameter = true;
        info.name = name.map(str::to_string);
        id
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// The representative of `id`, compressing the path to it.
    pub fn find(&mut self, id: LocalId) -> LocalId {
        LocalId(self.sets.resolve(id.0))
    }

    /// The representative of `id` without touching the structure.
    pub fn canonical(&self, id: LocalId) -> LocalId {
        LocalId(self.sets.find(id.0))
    }

    /// Information about the variable `id` belongs to.
    pub fn get(&self, id: LocalId) -> &LocalInfo {
        &self.infos[self.canonical(id).0 as usize]
    }

    /// Declares that `a` and `b` are the same variable.
    pub fn combine(&mut self, a: LocalId, b: LocalId, hierarchy: &dyn ClassHierarchy) -> LocalId {
        let a = self.find(a);
        let b = self.find(b);
        if a == b {
            return a;
        }
        let root = LocalId(self.sets.merge(a.0, b.0));
        let shadow = if root == a { b } else { a };

        let shadow_info = self.infos[shadow.0 as usize].clone();
        let info = &mut self.infos[root.0 as usize];
        if info.name.is_none() {
            info.name = shadow_info.name;
        }
        info.is_parameter |= shadow_info.is_parameter;
        if shadow_info.conflicted {
            info.conflicted = true;
            info.ty = Type::UNKNOWN;
        } else {
            Self::narrow(info, root, &shadow_info.ty, hierarchy);
        }
        root
    }

    /// Narrows the type of the variable `id` belongs to.
    pub fn constrain(&mut self, id: LocalId, ty: &Type, hierarchy: &dyn ClassHierarchy) {
        let root = self.find(id);
        Self::narrow(&mut self.infos[root.0 as usize], root, ty, hierarchy);
    }

    fn narrow(info: &mut LocalInfo, id: LocalId, ty: &Type, hierarchy: &dyn ClassHierarchy) {
        if info.conflicted {
            return;
        }
        let narrowed = info.ty.intersect(ty, hierarchy);
        if narrowed.is_error() {
            log::debug!(
                "local {id} ({}) has contradictory types {} and {ty}, leaving it unconstrained",
                info.key,
                info.ty,
            );
            info.ty = Type::UNKNOWN;
            info.conflicted = true;
        } else {
            info.ty = narrowed;
        }
    }

    /// Attaches a name hint, unless the variable already has one.
    pub fn suggest_name(&mut self, id: LocalId, name: &str) {
        let root = self.find(id);
        let info = &mut self.infos[root.0 as usize];
        if info.name.is_none() {
            info.name = Some(name.to_string());
        }
    }

    /// Representatives in creation order.
    pub fn variables(&self) -> impl Iterator<Item = (LocalId, &LocalInfo)> {
        self.infos
            .iter()
            .enumerate()
            .map(|(i, info)| (LocalId(i as u32), info))
            .filter(|(id, _)| self.sets.is_representative(id.0))
    }
}

/// The variables whose writes may reach a point, per location. Lists are sorted.
type State = FxHashMap<SlotKey, Vec<LocalId>>;

/// Adds `from` to `into` and tells whether anything changed.
fn join(into: &mut State, from: &State) -> bool {
    let mut changed = false;
    for (key, ids) in from {
        let known = into.entry(*key).or_default();
        for id in ids {
            if let Err(at) = known.binary_search(id) {
                known.insert(at, *id);
                changed = true;
            }
        }
    }
    changed
}

struct Unifier<'a> {
    ctx: &'a MethodContext<'a>,
    arena: &'a Arena,
    table: &'a mut LocalTable,
    /// The variable created by each write, so that revisiting a block reuses it.
    writes: FxHashMap<ExprId, LocalId>,
    /// Every variable seen by each read, accumulated over all visits.
    reads: FxHashMap<ExprId, Vec<LocalId>>,
    /// Locations occurring in each block, for name hints.
    sites: Vec<(ExprId, u32, u32)>,
}

/// What a walk through one block found.
#[derive(Default)]
struct Exits {
    edges: Vec<(BlockId, State)>,
    /// Everything live at any point of the block, for exception handlers.
    thrown: State,
}

impl<'a> Unifier<'a> {
    fn location(&self, id: ExprId) -> Option<SlotKey> {
        match self.arena[id].kind {
            ExprKind::Slot(key) => Some(key),
            _ => None,
        }
    }

    fn write(&mut self, target: ExprId, state: &mut State) {
        let key = self.location(target).expect("writes target locations");
        let ty = self.arena[target].ty.clone();
        let table = &mut *self.table;
        let id = *self
            .writes
            .entry(target)
            .or_insert_with(|| table.fresh(key, ty));
        state.insert(key, vec![id]);
    }

    fn read(&mut self, id: ExprId, key: SlotKey, state: &State) {
        let seen = self.reads.entry(id).or_default();
        for variable in state.get(&key).into_iter().flatten() {
            if let Err(at) = seen.binary_search(variable) {
                seen.insert(at, *variable);
            }
        }
    }

    fn expr(&mut self, id: ExprId, state: &mut State) {
        let arena = self.arena;
        let is_location = |id: ExprId| matches!(arena[id].kind, ExprKind::Slot(_));
        match arena[id].kind {
            ExprKind::Slot(key) => self.read(id, key, state),
            ExprKind::Assign { target, value } if is_location(target) => {
                self.expr(value, state);
                self.write(target, state);
            }
            // Updates read the variable and write it back, so both sides are the same variable:
            // the write is linked to the read when reads are resolved.
            ExprKind::IncDec { target, .. } if is_location(target) => {
                self.expr(target, state);
                self.write(target, state);
            }
            ExprKind::OpAssign { target, value, .. } if is_location(target) => {
                self.expr(target, state);
                self.expr(value, state);
                self.write(target, state);
            }
            ExprKind::Logical { lhs, rhs, .. } => {
                self.expr(lhs, state);
                let mut taken = state.clone();
                self.expr(rhs, &mut taken);
                join(state, &taken);
            }
            ExprKind::Ternary {
                condition,
                branches: [if_true, if_false],
            } => {
                self.expr(condition, state);
                let mut other = state.clone();
                self.expr(if_true, state);
                self.expr(if_false, &mut other);
                join(state, &other);
            }
            _ => {
                let children: Vec<ExprId> = self.arena[id].subexprs().collect();
                for child in children {
                    self.expr(child, state);
                }
            }
        }
    }

    fn block(&mut self, block: &StructuredBlock, state: &mut State, exits: &mut Exits) {
        match block {
            StructuredBlock::Goto(target) => exits.edges.push((*target, state.clone())),
            StructuredBlock::If {
                condition,
                then,
                otherwise,
            } => {
                self.expr(*condition, state);
                let mut other = state.clone();
                self.block(then, state, exits);
                if let Some(otherwise) = otherwise {
                    self.block(otherwise, &mut other, exits);
                }
                join(state, &other);
            }
            StructuredBlock::Switch {
                selector, cases, ..
            } => {
                self.expr(*selector, state);
                let entry = state.clone();
                for case in cases {
                    let mut branch = entry.clone();
                    self.block(&case.body, &mut branch, exits);
                    join(state, &branch);
                }
            }
            StructuredBlock::Sequence(items) => {
                for item in items {
                    self.block(item, state, exits);
                }
            }
            block => {
                for expr in block.own_exprs() {
                    self.expr(expr, state);
                }
                block.for_each_child(|child| self.block(child, state, exits));
            }
        }
        join(&mut exits.thrown, state);
    }

    /// Merges everything a read may see and narrows the result to what the read expects.
    fn resolve(&mut self, read: ExprId) -> LocalId {
        let ty = self.arena[read].ty.clone();
        let hierarchy = self.ctx.hierarchy;
        let seen = self.reads.get(&read).cloned().unwrap_or_default();
        let variable = match seen.split_first() {
            Some((&first, rest)) => rest
                .iter()
                .fold(first, |a, &b| self.table.combine(a, b, hierarchy)),
            None => {
                // Never written on any path, e.g. code that only runs after a verifier error.
                let key = self.location(read).expect("reads are locations");
                let id = self.table.fresh(key, ty.clone());
                self.writes.insert(read, id);
                id
            }
        };
        self.table.constrain(variable, &ty, hierarchy);
        if let Some(&written) = self.writes.get(&read) {
            self.table.combine(variable, written, hierarchy)
        } else {
            variable
        }
    }
}

/// Replaces every slot, stack position and temporary in the flow graph with a logical variable.
///
/// Variables are assigned by a forward dataflow fixpoint: a write starts a new variable, and the
/// variables reaching a read are merged. Exception handlers see everything live anywhere in the
/// blocks they cover, plus the caught exception on the stack.
pub fn unify(
    ctx: &MethodContext<'_>,
    flow: &mut FlowGraph,
    arena: &mut Arena,
    table: &mut LocalTable,
    names: &[LocalVariable],
) {
    let mut entry = State::default();
    for (slot, ty) in &ctx.parameters {
        let name = if *slot == 0 && !ctx.signature.is_static {
            Some("this")
        } else {
            names
                .iter()
                .find(|local| local.slot == *slot && local.covers(0))
                .map(|local| local.name.as_str())
        };
        let id = table.parameter(*slot, Type::simple(ty.clone()), name);
        entry.insert(SlotKey::Slot(*slot), vec![id]);
    }

    let mut states: FxHashMap<BlockId, State> = FxHashMap::default();
    states.insert(flow.entry, entry);
    for (_, clause) in flow.live_clauses() {
        let caught = State::from_iter([(SlotKey::Stack(0), vec![clause.binder])]);
        join(states.entry(clause.handler).or_default(), &caught);
    }

    let mut unifier = Unifier {
        ctx,
        arena: &*arena,
        table: &mut *table,
        writes: FxHashMap::default(),
        reads: FxHashMap::default(),
        sites: Vec::new(),
    };

    let mut worklist: BTreeSet<BlockId> = flow.ids().into_iter().collect();
    let mut visits = 0usize;
    while let Some(id) = worklist.pop_first() {
        visits += 1;
        let Some(block) = flow.get(id) else {
            continue;
        };
        let mut state = states.get(&id).cloned().unwrap_or_default();
        let mut exits = Exits::default();
        unifier.block(&block.content, &mut state, &mut exits);

        for (target, state) in exits.edges {
            if join(states.entry(target).or_default(), &state) {
                worklist.insert(target);
            }
        }
        if block.can_throw {
            let mut thrown = exits.thrown;
            thrown.retain(|key, _| !matches!(key, SlotKey::Stack(_)));
            for &index in &block.coverage {
                let clause = &flow.clauses[index];
                let mut caught = thrown.clone();
                caught.insert(SlotKey::Stack(0), vec![clause.binder]);
                if join(states.entry(clause.handler).or_default(), &caught) {
                    worklist.insert(clause.handler);
                }
            }
        }
    }
    log::trace!("local dataflow converged after {visits} block visits");

    for (_, block) in flow.blocks() {
        let (address, end) = (block.address, block.end);
        let mut found = Vec::new();
        block.content.visit(&mut |block| {
            for root in block.own_exprs() {
                collect_locations(unifier.arena, root, &mut found);
            }
        });
        unifier
            .sites
            .extend(found.into_iter().map(|expr| (expr, address, end)));
    }

    let mut resolved: Vec<(ExprId, LocalId)> = Vec::new();
    let sites = core::mem::take(&mut unifier.sites);
    for &(expr, address, end) in &sites {
        let variable = if unifier.reads.contains_key(&expr) {
            unifier.resolve(expr)
        } else if let Some(&written) = unifier.writes.get(&expr) {
            written
        } else {
            // Writes in blocks the fixpoint never reached.
            unifier.resolve(expr)
        };
        if let Some(SlotKey::Slot(slot)) = unifier.location(expr)
            && let Some(local) = names.iter().find(|local| {
                local.slot == slot && local.start <= end && address < local.start + local.length
            })
        {
            unifier.table.suggest_name(variable, &local.name);
        }
        resolved.push((expr, variable));
    }

    for (expr, variable) in resolved {
        let variable = table.find(variable);
        let ty = table.get(variable).ty.clone();
        let node = &mut arena[expr];
        node.kind = ExprKind::Local(variable);
        if !ty.is_error() && !ty.is_unknown() {
            node.ty = ty;
        }
    }
    for clause in &mut flow.clauses {
        clause.binder = table.find(clause.binder);
    }
}

/// Every location expression inside `root`, reads and write targets alike.
fn collect_locations(arena: &Arena, root: ExprId, out: &mut Vec<ExprId>) {
    if matches!(arena[root].kind, ExprKind::Slot(_)) {
        out.push(root);
    }
    for child in arena[root].subexprs() {
        collect_locations(arena, child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::build_expressions;
    use crate::graph::InstructionGraph;
    use crate::instruction::tests::Asm;
    use crate::instruction::{CompareOp, JumpOperands, MethodBody, MethodSignature, Opcode};
    use crate::structured::promote;
    use crate::types::{BasicHierarchy, STRING, SimpleType};
    use proptest::collection::vec;
    use proptest::prelude::*;

    fn unified(
        body: &MethodBody,
        hierarchy: &dyn ClassHierarchy,
    ) -> (Arena, FlowGraph, LocalTable) {
        let ctx = MethodContext::new(&body.signature, hierarchy).unwrap();
        let graph = InstructionGraph::new(body).unwrap();
        let mut arena = Arena::new();
        let mut table = LocalTable::new();
        let nodes = build_expressions(&ctx, &graph, &mut arena).unwrap();
        let mut flow = promote(&ctx, &graph, nodes, &mut arena, &mut table).unwrap();
        unify(&ctx, &mut flow, &mut arena, &mut table, &body.local_variables);
        (arena, flow, table)
    }

    fn mentioned(arena: &Arena, flow: &FlowGraph, table: &LocalTable) -> BTreeSet<LocalId> {
        let mut out = BTreeSet::new();
        let mut locations = Vec::new();
        for (_, block) in flow.blocks() {
            block.content.visit(&mut |block| {
                for root in block.own_exprs() {
                    collect_all(arena, root, &mut locations);
                }
            });
        }
        for expr in locations {
            match arena[expr].kind {
                ExprKind::Local(id) => {
                    out.insert(table.canonical(id));
                }
                ExprKind::Slot(key) => panic!("{key} survived unification"),
                _ => {}
            }
        }
        out
    }

    fn collect_all(arena: &Arena, root: ExprId, out: &mut Vec<ExprId>) {
        out.push(root);
        for child in arena[root].subexprs() {
            collect_all(arena, child, out);
        }
    }

    #[test]
    fn loop_counter_is_one_variable() {
        let h = BasicHierarchy::new();
        let body = Asm::new()
            .iconst(0)
            .istore(1)
            .label("loop")
            .iload(1)
            .iconst(10)
            .branch(CompareOp::Ge, JumpOperands::IntPair, "end")
            .op(Opcode::Increment { slot: 1, delta: 1 })
            .goto("loop")
            .label("end")
            .ret(None)
            .finish();
        let (arena, flow, table) = unified(&body, &h);
        let variables = mentioned(&arena, &flow, &table);
        assert_eq!(variables.len(), 1, "{}", arena.debug(&flow));
        let variable = *variables.first().unwrap();
        assert_eq!(table.get(variable).key, SlotKey::Slot(1));
        assert!(!table.get(variable).ty.is_error());
    }

    #[test]
    fn reused_slots_split() {
        let h = BasicHierarchy::new();
        let body = Asm::new()
            .iconst(7)
            .istore(0)
            .iload(0)
            .invoke_static("use", "(I)V")
            .op(Opcode::Const(crate::instruction::Constant::String("s".into())))
            .astore(0)
            .aload(0)
            .invoke_static("print", "(Ljava/lang/String;)V")
            .ret(None)
            .finish();
        let (arena, flow, table) = unified(&body, &h);
        let variables = mentioned(&arena, &flow, &table);
        assert_eq!(variables.len(), 2);
        for variable in variables {
            assert!(!table.get(variable).ty.is_unknown());
        }
    }

    #[test]
    fn names_and_receiver() {
        let h = BasicHierarchy::new();
        let signature = MethodSignature::new("test/Test", "f", "(I)V", false);
        let body = Asm::with_signature(signature)
            .label("start")
            .iload(1)
            .istore(2)
            .label("stored")
            .iload(2)
            .invoke_static("use", "(I)V")
            .ret(None)
            .label("end")
            .local_variable(1, "start", "end", "count")
            .local_variable(2, "stored", "end", "copy")
            .finish();
        let (_, _, table) = unified(&body, &h);
        let named = |name: &str| {
            table
                .variables()
                .find(|(_, info)| info.name.as_deref() == Some(name))
                .map(|(_, info)| info.clone())
                .unwrap_or_else(|| panic!("no variable named {name}"))
        };
        let this = named("this");
        assert!(this.is_parameter);
        assert_eq!(this.key, SlotKey::Slot(0));
        assert!(named("count").is_parameter);
        assert_eq!(named("copy").key, SlotKey::Slot(2));
    }

    #[test]
    fn handlers_receive_the_binder() {
        let h = BasicHierarchy::new();
        let body = Asm::new()
            .label("try")
            .invoke_static("risky", "()V")
            .label("try_end")
            .ret(None)
            .label("catch")
            .astore(0)
            .aload(0)
            .op(Opcode::Throw)
            .handler("try", "try_end", "catch", Some("java/io/IOException"))
            .finish();
        let (arena, flow, table) = unified(&body, &h);
        let clause = &flow.clauses[0];
        assert_eq!(table.get(clause.binder).key, SlotKey::Stack(0));
        let handler = flow.get(clause.handler).unwrap();
        let text = arena.debug(&handler.content).to_string();
        assert!(text.contains(&format!(" = {};", clause.binder)), "{text}");
    }

    #[test]
    fn combine_intersects_types() {
        let h = BasicHierarchy::new();
        let mut table = LocalTable::new();
        let a = table.fresh(SlotKey::Slot(1), Type::int_slot());
        let b = table.fresh(SlotKey::Slot(1), Type::simple(SimpleType::Char));
        table.suggest_name(b, "c");
        assert_eq!(table.combine(b, a, &h), a);
        assert_eq!(table.get(b).ty, Type::simple(SimpleType::Char));
        assert_eq!(table.get(a).name.as_deref(), Some("c"));
        assert_eq!(table.variables().count(), 1);
    }

    #[test]
    fn contradictions_degrade() {
        let h = BasicHierarchy::new();
        let mut table = LocalTable::new();
        let a = table.fresh(SlotKey::Slot(0), Type::simple(SimpleType::Int));
        let b = table.fresh(
            SlotKey::Slot(0),
            Type::supertypes_of(SimpleType::class(STRING, &h)),
        );
        let root = table.combine(a, b, &h);
        assert_eq!(table.get(root).ty, Type::UNKNOWN);
        // Later constraints don't resurrect a contradictory variable.
        table.constrain(a, &Type::simple(SimpleType::Int), &h);
        assert_eq!(table.get(root).ty, Type::UNKNOWN);
    }

    proptest! {
        #[test]
        fn combines_converge(
            len in 1u32..40,
            merges in vec((0u32..40, 0u32..40), 0..80),
        ) {
            let h = BasicHierarchy::new();
            let mut table = LocalTable::new();
            for _ in 0..len {
                table.fresh(SlotKey::Slot(0), Type::int_slot());
            }
            for (a, b) in &merges {
                table.combine(LocalId(a % len), LocalId(b % len), &h);
            }
            for (a, b) in &merges {
                let a = table.find(LocalId(a % len));
                let b = table.find(LocalId(b % len));
                prop_assert_eq!(a, b);
            }
            for i in 0..len {
                let root = table.find(LocalId(i));
                prop_assert_eq!(table.canonical(LocalId(i)), root);
                prop_assert!(root <= LocalId(i));
            }
        }
    }
}
