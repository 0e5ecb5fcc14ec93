// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{CheckerError, CheckerResult};
use crate::ir::{
    Bit, BlockCfg, BlockId, Exp, ExpKind, PEdgeKind, PPoint, Type, VarKind, Variable,
};
use crate::serialize::{tags, Buffer, Reader, Serial};

use super::BlockModset;

/// Strategy tag for expression simplification while building the tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimplifyKind {
    Default,
    /// Fold scalar constants while recording assignments.
    Scalar,
}

/// Strategy tag for the alias predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AliasKind {
    Default,
    /// Lvalues alias when their base buffers agree and the stride types
    /// are compatible. Only Terminate accesses consult the predicate.
    Buffer,
}

/// Strategy tag for call clobbering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClobberKind {
    Default,
    /// Translate callee modsets into the caller's lvalue space.
    Modset,
}

/// Which frame an expression or bit is being translated into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslateKind {
    /// Rewrite in terms of values reaching the given point.
    Point,
    /// Rewrite a callee-frame value into the caller's frame across the
    /// call edge at the given point.
    Callee,
}

/// One recorded write: the location, the value and the path condition
/// under which the write happens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardAssign {
    pub lval: Exp,
    pub rval: Exp,
    pub guard: Bit,
}

/// An expression qualified by the condition under which it is the value.
#[derive(Clone, Debug)]
pub struct GuardExp {
    pub exp: Exp,
    pub guard: Bit,
}

/// Symbolic memory tables for one loop-free block.
#[derive(Clone)]
pub struct BlockMemory {
    id: BlockId,
    simplify: SimplifyKind,
    alias: AliasKind,
    clobber: ClobberKind,
    cfg: Option<Arc<BlockCfg>>,
    /// Reachability guard of each point, indexed by point - 1.
    guards: Vec<Bit>,
    /// Explicit assignments keyed by their source point.
    assigns: BTreeMap<PPoint, Vec<GuardAssign>>,
    /// Call-induced writes (clobbers) keyed by the call's source point.
    clobbers: BTreeMap<PPoint, Vec<GuardAssign>>,
    /// Return-value lvalues keyed by call point.
    returns: BTreeMap<PPoint, Exp>,
    /// Actual argument lists keyed by call point.
    arguments: BTreeMap<PPoint, Vec<Exp>>,
}

impl BlockMemory {
    pub fn new(
        id: BlockId,
        simplify: SimplifyKind,
        alias: AliasKind,
        clobber: ClobberKind,
    ) -> BlockMemory {
        BlockMemory {
            id,
            simplify,
            alias,
            clobber,
            cfg: None,
            guards: Vec::new(),
            assigns: BTreeMap::new(),
            clobbers: BTreeMap::new(),
            returns: BTreeMap::new(),
            arguments: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &BlockId {
        &self.id
    }

    pub fn set_cfg(&mut self, cfg: Arc<BlockCfg>) {
        self.cfg = Some(cfg);
    }

    pub fn cfg(&self) -> Option<&Arc<BlockCfg>> {
        self.cfg.as_ref()
    }

    /// Build the guard and assignment tables from the attached CFG. The
    /// CFG's points are in topological order, so one forward pass reaches
    /// every point after all its predecessors. Callee modsets are read
    /// through `modset_lookup` to compute call clobbers.
    pub fn compute_tables(
        &mut self,
        modset_lookup: &mut dyn FnMut(&BlockId) -> Option<Arc<BlockModset>>,
    ) -> CheckerResult<()> {
        let cfg = self
            .cfg
            .clone()
            .ok_or_else(|| CheckerError::TransactionFailed("memory without a CFG".to_string()))?;

        let count = cfg.point_count();
        self.guards = vec![Bit::make_false(); count];
        if count == 0 {
            return Ok(());
        }
        let entry = cfg.entry_point();
        self.guards[(entry - 1) as usize] = Bit::make_true();

        for point in 1..=count as PPoint {
            // guards of every predecessor are final by topological order.
            if point != entry {
                let mut incoming = Vec::new();
                for edge in cfg.incoming(point) {
                    let source_guard = self.guards[(edge.source - 1) as usize].clone();
                    let cond = match edge.if_assume() {
                        Some((cond, sense)) => {
                            let bit = Bit::make_exp(cond.clone());
                            if sense {
                                bit
                            } else {
                                Bit::make_not(bit)
                            }
                        }
                        None => Bit::make_true(),
                    };
                    incoming.push(Bit::make_and(vec![source_guard, cond]));
                }
                self.guards[(point - 1) as usize] = Bit::make_or(incoming);
            }

            for edge in cfg.outgoing(point) {
                let guard = self.guards[(point - 1) as usize].clone();
                match &edge.kind {
                    PEdgeKind::Assign { ty, lhs, rhs } => {
                        self.record_assign(&cfg, point, ty, lhs, rhs, guard);
                    }
                    PEdgeKind::Call {
                        ret,
                        instance,
                        args,
                        ..
                    } => {
                        self.arguments.insert(point, args.clone());
                        if let Some(ret) = ret {
                            self.returns.insert(point, ret.clone());
                            self.clobbers.entry(point).or_default().push(GuardAssign {
                                lval: ret.clone(),
                                rval: Exp::make_drf(ret.clone()),
                                guard: guard.clone(),
                            });
                        }
                        if self.clobber == ClobberKind::Modset {
                            if let Some(callee) = edge.direct_function() {
                                self.record_call_clobber(
                                    point,
                                    &callee,
                                    instance.as_ref(),
                                    args,
                                    &guard,
                                    modset_lookup,
                                );
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn record_assign(
        &mut self,
        cfg: &BlockCfg,
        point: PPoint,
        ty: &Type,
        lhs: &Exp,
        rhs: &Exp,
        guard: Bit,
    ) {
        let rhs = self.simplify_exp(rhs);
        if let Some(csu_name) = ty.csu_name() {
            // CSU-typed writes are expanded field by field.
            if let ExpKind::Drf(rhs_loc) = &*rhs {
                let mut expanded = false;
                for field in fields_in_cfg(cfg, csu_name) {
                    let lval = Exp::make_fld(lhs.clone(), field.clone());
                    let rval = Exp::make_drf(Exp::make_fld(rhs_loc.clone(), field));
                    self.assigns.entry(point).or_default().push(GuardAssign {
                        lval,
                        rval,
                        guard: guard.clone(),
                    });
                    expanded = true;
                }
                if expanded {
                    return;
                }
            }
        }
        self.assigns.entry(point).or_default().push(GuardAssign {
            lval: lhs.clone(),
            rval: rhs,
            guard,
        });
    }

    /// Clobber: translate the callee's modset entries into this block's
    /// lvalue space and record them at the call point.
    fn record_call_clobber(
        &mut self,
        point: PPoint,
        callee: &Variable,
        instance: Option<&Exp>,
        args: &[Exp],
        guard: &Bit,
        modset_lookup: &mut dyn FnMut(&BlockId) -> Option<Arc<BlockModset>>,
    ) {
        let callee_id = BlockId::make(crate::ir::BlockKind::Function, callee.clone(), None);
        let Some(modset) = modset_lookup(&callee_id) else {
            return;
        };
        for entry in modset.entries() {
            let translated = translate_callee_exp(&entry.lval, instance, args);
            let Some(lval) = translated else {
                continue;
            };
            self.clobbers.entry(point).or_default().push(GuardAssign {
                rval: Exp::make_drf(lval.clone()),
                lval,
                guard: guard.clone(),
            });
        }
    }

    fn simplify_exp(&self, exp: &Exp) -> Exp {
        match self.simplify {
            SimplifyKind::Default => exp.clone(),
            SimplifyKind::Scalar => exp.map(&mut |exp| {
                let ExpKind::Binop {
                    op, left, right, ..
                } = &**exp
                else {
                    return None;
                };
                let (left, right) = (left.if_int()?, right.if_int()?);
                let value = match op {
                    crate::ir::BinopKind::Plus => left.checked_add(right)?,
                    crate::ir::BinopKind::Minus => left.checked_sub(right)?,
                    crate::ir::BinopKind::Mult => left.checked_mul(right)?,
                    _ => return None,
                };
                Some(Exp::make_int(value))
            }),
        }
    }

    /// Reachability guard of a point.
    pub fn guard(&self, point: PPoint) -> Bit {
        self.guards
            .get((point.max(1) - 1) as usize)
            .cloned()
            .unwrap_or_else(Bit::make_true)
    }

    pub fn assigns_at(&self, point: PPoint) -> &[GuardAssign] {
        self.assigns
            .get(&point)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn clobbers_at(&self, point: PPoint) -> &[GuardAssign] {
        self.clobbers
            .get(&point)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn return_lval(&self, point: PPoint) -> Option<&Exp> {
        self.returns.get(&point)
    }

    pub fn arguments_at(&self, point: PPoint) -> &[Exp] {
        self.arguments
            .get(&point)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every recorded write of the block, explicit or call-induced.
    pub fn all_writes(&self) -> impl Iterator<Item = (PPoint, &GuardAssign)> {
        self.assigns
            .iter()
            .chain(self.clobbers.iter())
            .flat_map(|(point, list)| list.iter().map(move |assign| (*point, assign)))
    }

    /// Alias predicate between a recorded update and an accessed lvalue.
    /// Under the buffer strategy only Terminate accesses consult the
    /// predicate; everything else is treated as may-alias.
    pub fn check_alias(&self, update: &GuardAssign, lval: &Exp) -> bool {
        match self.alias {
            AliasKind::Default => true,
            AliasKind::Buffer => {
                let ExpKind::Terminate { target, stride } = &**lval else {
                    return true;
                };
                let Some(update_base) = get_base_buffer(&update.lval) else {
                    return true;
                };
                let Some(access_base) = get_base_buffer(target) else {
                    return true;
                };
                update_base == access_base && stride_compatible(&update.lval, stride)
            }
        }
    }

    /// Lift a bit to another frame. `Point` rewrites leaf values through
    /// the unique reaching assignment when there is one; `Callee` renames
    /// callee locals to the caller's actual argument expressions.
    pub fn translate_bit(&self, kind: TranslateKind, point: PPoint, bit: &Bit) -> Bit {
        match kind {
            TranslateKind::Point => bit.map_exps(&mut |exp| self.reaching_value(point, exp)),
            TranslateKind::Callee => {
                let instance = None;
                let args = self.arguments_at(point).to_vec();
                bit.map_exps(&mut |exp| translate_callee_exp_value(exp, instance, &args))
            }
        }
    }

    /// Lift an expression to another frame, qualified by guards. The
    /// current strategies produce a single guarded value.
    pub fn translate_exp(&self, kind: TranslateKind, point: PPoint, exp: &Exp) -> Vec<GuardExp> {
        let translated = match kind {
            TranslateKind::Point => exp.map(&mut |exp| self.reaching_value(point, exp)),
            TranslateKind::Callee => {
                let args = self.arguments_at(point).to_vec();
                exp.map(&mut |exp| translate_callee_exp_value(exp, None, &args))
            }
        };
        vec![GuardExp {
            exp: translated,
            guard: self.guard(point),
        }]
    }

    /// The value reaching `point` for the loaded location `exp`, when the
    /// block contains exactly one assignment to that location at an
    /// earlier point. More than one candidate write keeps the load opaque.
    fn reaching_value(&self, point: PPoint, exp: &Exp) -> Option<Exp> {
        let ExpKind::Drf(location) = &**exp else {
            return None;
        };
        let mut found: Option<&GuardAssign> = None;
        for (source, assign) in self.all_writes() {
            if source >= point || assign.lval != *location {
                continue;
            }
            if found.is_some() {
                return None;
            }
            found = Some(assign);
        }
        let assign = found?;
        (assign.rval != *exp).then(|| assign.rval.clone())
    }
}

/// Peel indexes and fields off an lvalue down to the buffer being indexed.
pub fn get_base_buffer(exp: &Exp) -> Option<Exp> {
    match &**exp {
        ExpKind::Index { target, .. } => get_base_buffer(target).or_else(|| Some(target.clone())),
        ExpKind::Fld { target, .. } => get_base_buffer(target),
        ExpKind::Drf(_) | ExpKind::Var(_) => Some(exp.clone()),
        _ => None,
    }
}

fn stride_compatible(update_lval: &Exp, stride: &Type) -> bool {
    match &**update_lval {
        ExpKind::Index { element_type, .. } => element_type == stride,
        _ => true,
    }
}

/// Rename a callee-frame location into the caller frame: formal arguments
/// become the caller's actual argument expressions, `this` becomes the
/// instance object. Locations rooted in callee locals do not translate.
fn translate_callee_exp(lval: &Exp, instance: Option<&Exp>, args: &[Exp]) -> Option<Exp> {
    let root = lval.root_var()?.clone();
    match root.kind() {
        VarKind::Glob | VarKind::Func => Some(lval.clone()),
        VarKind::Arg | VarKind::This => {
            let substitute = |exp: &Exp| -> Option<Exp> {
                let ExpKind::Drf(inner) = &**exp else {
                    return None;
                };
                let var = inner.if_var()?;
                match var.kind() {
                    // the formal argument's value is the actual argument.
                    VarKind::Arg => args.get(var.index() as usize).cloned(),
                    VarKind::This => instance.cloned(),
                    _ => None,
                }
            };
            let translated = lval.map(&mut |exp| substitute(exp));
            // the translation succeeded only if no callee-frame variable
            // survived.
            let root = translated.root_var();
            match root {
                Some(var) if !var.is_global() => None,
                _ => Some(translated),
            }
        }
        _ => None,
    }
}

/// Value-position variant of [`translate_callee_exp`] used when mapping
/// bits: leaves that do not translate stay in place.
fn translate_callee_exp_value(exp: &Exp, instance: Option<&Exp>, args: &[Exp]) -> Option<Exp> {
    let ExpKind::Drf(inner) = &**exp else {
        return None;
    };
    let var = inner.if_var()?;
    match var.kind() {
        VarKind::Arg => args.get(var.index() as usize).cloned(),
        VarKind::This => instance.cloned(),
        _ => None,
    }
}

impl Serial for BlockMemory {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::BLOCK_MEMORY, |buf| {
            self.id.write(buf);
            buf.put_uint(tags::KIND, self.simplify as u64);
            buf.put_uint(tags::KIND, self.alias as u64);
            buf.put_uint(tags::KIND, self.clobber as u64);
            for (index, guard) in self.guards.iter().enumerate() {
                buf.open(tags::MEMORY_GUARD, |buf| {
                    buf.put_uint(tags::INDEX, index as u64 + 1);
                    guard.write(buf);
                });
            }
            for (point, assigns) in self.assigns.iter().chain(self.clobbers.iter()) {
                for assign in assigns {
                    buf.open(tags::MEMORY_ASSIGN, |buf| {
                        buf.put_uint(tags::INDEX, *point as u64);
                        assign.lval.write(buf);
                        assign.rval.write(buf);
                        assign.guard.write(buf);
                    });
                }
            }
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::BLOCK_MEMORY)?;
        let id = BlockId::read(reader)?;
        let simplify = match reader.get_uint(tags::KIND)? {
            1 => SimplifyKind::Scalar,
            _ => SimplifyKind::Default,
        };
        let alias = match reader.get_uint(tags::KIND)? {
            1 => AliasKind::Buffer,
            _ => AliasKind::Default,
        };
        let clobber = match reader.get_uint(tags::KIND)? {
            1 => ClobberKind::Modset,
            _ => ClobberKind::Default,
        };
        let mut memory = BlockMemory::new(id, simplify, alias, clobber);

        while !reader.at_end() {
            match reader.peek() {
                Some(tags::MEMORY_GUARD) => {
                    let inner = reader.enter(tags::MEMORY_GUARD)?;
                    let index = reader.get_uint(tags::INDEX)? as usize;
                    let guard = Bit::read(reader)?;
                    reader.leave(inner);
                    if memory.guards.len() < index {
                        memory.guards.resize(index, Bit::make_false());
                    }
                    memory.guards[index - 1] = guard;
                }
                Some(tags::MEMORY_ASSIGN) => {
                    let inner = reader.enter(tags::MEMORY_ASSIGN)?;
                    let point = reader.get_uint(tags::INDEX)? as PPoint;
                    let lval = Exp::read(reader)?;
                    let rval = Exp::read(reader)?;
                    let guard = Bit::read(reader)?;
                    reader.leave(inner);
                    memory
                        .assigns
                        .entry(point)
                        .or_default()
                        .push(GuardAssign { lval, rval, guard });
                }
                Some(tag) => return Err(CheckerError::Corrupt(tag)),
                None => break,
            }
        }
        reader.leave(outer);
        Ok(memory)
    }
}

/// Fields of the named CSU appearing in the CFG's expressions.
fn fields_in_cfg(cfg: &BlockCfg, csu_name: &str) -> Vec<crate::ir::Field> {
    let mut fields: Vec<crate::ir::Field> = Vec::new();
    let mut consider = |exp: &Exp| {
        if let ExpKind::Fld { field, .. } = &**exp {
            if field.csu_name() == csu_name && !fields.contains(field) {
                fields.push(field.clone());
            }
        }
    };
    for edge in cfg.edges() {
        match &edge.kind {
            PEdgeKind::Assign { lhs, rhs, .. } => {
                lhs.visit_all(&mut consider);
                rhs.visit_all(&mut consider);
            }
            PEdgeKind::Assume { cond, .. } => cond.visit_all(&mut consider),
            PEdgeKind::Call {
                callee,
                args,
                ret,
                instance,
                ..
            } => {
                callee.visit_all(&mut consider);
                for arg in args {
                    arg.visit_all(&mut consider);
                }
                if let Some(ret) = ret {
                    ret.visit_all(&mut consider);
                }
                if let Some(instance) = instance {
                    instance.visit_all(&mut consider);
                }
            }
            _ => {}
        }
    }
    fields.sort();
    fields
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{BinopKind, BlockKind, Location, PEdge};

    fn local(id: &BlockId, name: &str) -> Exp {
        Exp::make_var(Variable::make(
            Some(id.clone()),
            VarKind::Local,
            name,
            None,
        ))
    }

    /// `if (p) *p = 0;` in value form.
    fn guarded_store_cfg() -> (BlockCfg, Exp) {
        let id = BlockId::make(BlockKind::Function, Variable::make_func("f"), None);
        let mut cfg = BlockCfg::new(
            id.clone(),
            Location::make("test.c", 1),
            Location::make("test.c", 4),
        );
        let p = Exp::make_var(Variable::make_arg(id.clone(), 0, "p"));
        let p_value = Exp::make_drf(p);

        let entry = cfg.add_point(Location::make("test.c", 1));
        let then = cfg.add_point(Location::make("test.c", 2));
        let exit = cfg.add_point(Location::make("test.c", 4));
        cfg.set_entry_point(entry);
        cfg.set_exit_point(exit);

        cfg.add_edge(PEdge::assume(entry, then, p_value.clone(), true));
        cfg.add_edge(PEdge::assign(
            then,
            exit,
            Type::make_int(32, true),
            Exp::make_drf(p_value.clone()),
            Exp::make_int(0),
        ));
        cfg.add_edge(PEdge::assume(entry, exit, p_value.clone(), false));
        (cfg, p_value)
    }

    #[test]
    fn test_guards_accumulate_assumes() {
        let (cfg, p_value) = guarded_store_cfg();
        let mut memory = BlockMemory::new(
            cfg.id().clone(),
            SimplifyKind::Scalar,
            AliasKind::Buffer,
            ClobberKind::Modset,
        );
        memory.set_cfg(Arc::new(cfg));
        memory.compute_tables(&mut |_| None).unwrap();

        assert!(memory.guard(1).is_true());
        // the store point is guarded by p's value being non-zero.
        assert_eq!(memory.guard(2), Bit::make_exp(p_value));
        // the exit joins both paths; the disjunction simplifies to true
        // only with a richer simplifier, so just check it is not false.
        assert!(!memory.guard(3).is_false());
    }

    #[test]
    fn test_assign_table_and_reaching_value() {
        let id = BlockId::make(BlockKind::Function, Variable::make_func("g"), None);
        let mut cfg = BlockCfg::new(
            id.clone(),
            Location::make("test.c", 1),
            Location::make("test.c", 3),
        );
        let x = local(&id, "x");
        let p1 = cfg.add_point(Location::make("test.c", 1));
        let p2 = cfg.add_point(Location::make("test.c", 2));
        let p3 = cfg.add_point(Location::make("test.c", 3));
        cfg.set_entry_point(p1);
        cfg.set_exit_point(p3);
        cfg.add_edge(PEdge::assign(
            p1,
            p2,
            Type::make_int(32, true),
            x.clone(),
            Exp::make_binop(BinopKind::Plus, Exp::make_int(2), Exp::make_int(3), 32, true),
        ));
        cfg.add_edge(PEdge::assume(p2, p3, Exp::make_int(1), true));

        let mut memory = BlockMemory::new(
            id,
            SimplifyKind::Scalar,
            AliasKind::Buffer,
            ClobberKind::Modset,
        );
        memory.set_cfg(Arc::new(cfg));
        memory.compute_tables(&mut |_| None).unwrap();

        // the scalar simplifier folded the constant.
        let assigns = memory.assigns_at(1);
        assert_eq!(assigns.len(), 1);
        assert_eq!(assigns[0].rval, Exp::make_int(5));

        // translating a load of x at a later point sees the assignment.
        let loaded = Bit::make_compare(
            BinopKind::Equal,
            Exp::make_drf(x),
            Exp::make_int(5),
        );
        let translated = memory.translate_bit(TranslateKind::Point, 3, &loaded);
        assert!(translated.is_true());
    }

    #[test]
    fn test_buffer_alias_strategy() {
        let id = BlockId::make(BlockKind::Function, Variable::make_func("h"), None);
        let buf = Exp::make_drf(Exp::make_var(Variable::make_arg(id.clone(), 0, "buf")));
        let index = Exp::make_int(3);
        let int_type = Type::make_int(32, true);
        let byte_type = Type::make_int(8, false);

        let update = GuardAssign {
            lval: Exp::make_index(buf.clone(), int_type.clone(), index.clone()),
            rval: Exp::make_int(0),
            guard: Bit::make_true(),
        };
        let memory = BlockMemory::new(
            id,
            SimplifyKind::Scalar,
            AliasKind::Buffer,
            ClobberKind::Modset,
        );

        // same buffer, same stride: aliases.
        let terminate = Exp::make_terminate(buf.clone(), int_type.clone());
        assert!(memory.check_alias(&update, &terminate));

        // same buffer, incompatible stride: no alias.
        let terminate = Exp::make_terminate(buf.clone(), byte_type);
        assert!(!memory.check_alias(&update, &terminate));

        // non-terminate accesses do not consult the predicate.
        assert!(memory.check_alias(&update, &buf));
    }

    #[test]
    fn test_callee_translation() {
        let id = BlockId::make(BlockKind::Function, Variable::make_func("callee"), None);
        let arg0 = Exp::make_drf(Exp::make_var(Variable::make_arg(id, 0, "q")));
        // the callee writes *q; with actual argument &g the caller sees a
        // write through that expression.
        let callee_lval = Exp::make_drf(arg0);
        let actual = Exp::make_var(Variable::make_glob("g"));
        let translated = translate_callee_exp(&callee_lval, None, &[actual.clone()]).unwrap();
        assert_eq!(translated, Exp::make_drf(actual));
    }

    #[test]
    fn test_memory_roundtrip() {
        let (cfg, _) = guarded_store_cfg();
        let mut memory = BlockMemory::new(
            cfg.id().clone(),
            SimplifyKind::Scalar,
            AliasKind::Buffer,
            ClobberKind::Modset,
        );
        memory.set_cfg(Arc::new(cfg));
        memory.compute_tables(&mut |_| None).unwrap();

        let mut buf = Buffer::new();
        memory.write(&mut buf);
        let bytes = buf.into_bytes();
        let mut reader = Reader::new(&bytes);
        let back = BlockMemory::read(&mut reader).unwrap();

        assert_eq!(back.id(), memory.id());
        assert_eq!(back.guard(2), memory.guard(2));
        assert_eq!(back.assigns_at(2), memory.assigns_at(2));
    }
}
