// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! Escape information: where values may flow between traces. Edge and
//! access sets are append-only and merge commutatively, which is what lets
//! concurrent workers flush them in any order.

use checker_config::FUNPTR_ESCAPE_LIMIT;

use crate::error::CheckerResult;
use crate::ir::{BlockCfg, BlockPPoint, Exp, ExpKind, Field, PEdgeKind, Trace};
use crate::serialize::{tags, Buffer, Reader, Serial};

/// One escape edge: a value at the set's source trace may flow to (or
/// from) `target`, observed at `where_`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct EscapeEdge {
    pub target: Trace,
    pub where_: BlockPPoint,
}

/// The escape edges of one trace in one direction. Duplicate edges
/// collapse; merge is set union.
#[derive(Clone, Debug)]
pub struct EscapeEdgeSet {
    pub source: Trace,
    pub forward: bool,
    pub edges: Vec<EscapeEdge>,
}

impl EscapeEdgeSet {
    pub fn new(source: Trace, forward: bool) -> EscapeEdgeSet {
        EscapeEdgeSet {
            source,
            forward,
            edges: Vec::new(),
        }
    }

    pub fn add_edge(&mut self, edge: EscapeEdge) {
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    pub fn merge(&mut self, other: &EscapeEdgeSet) {
        debug_assert!(self.source == other.source && self.forward == other.forward);
        for edge in &other.edges {
            self.add_edge(edge.clone());
        }
    }

    pub fn matches(&self, source: &Trace, forward: bool) -> bool {
        self.source == *source && self.forward == forward
    }
}

impl Serial for EscapeEdgeSet {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::ESCAPE_EDGE_SET, |buf| {
            self.source.write(buf);
            buf.put_bool(self.forward);
            for edge in &self.edges {
                buf.open(tags::ESCAPE_EDGE, |buf| {
                    edge.target.write(buf);
                    edge.where_.write(buf);
                });
            }
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::ESCAPE_EDGE_SET)?;
        let source = Trace::read(reader)?;
        let forward = reader.get_bool()?;
        let mut set = EscapeEdgeSet::new(source, forward);
        while !reader.at_end() {
            let inner = reader.enter(tags::ESCAPE_EDGE)?;
            let target = Trace::read(reader)?;
            let where_ = BlockPPoint::read(reader)?;
            reader.leave(inner);
            set.add_edge(EscapeEdge { target, where_ });
        }
        reader.leave(outer);
        Ok(set)
    }
}

/// One observed access to a trace: a read, write or field projection at a
/// particular point.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct EscapeAccess {
    pub where_: BlockPPoint,
    pub target: Trace,
    pub field: Option<Field>,
}

/// The accesses observed for one trace. Append-only set like the edges.
#[derive(Clone, Debug)]
pub struct EscapeAccessSet {
    pub value: Trace,
    pub accesses: Vec<EscapeAccess>,
}

impl EscapeAccessSet {
    pub fn new(value: Trace) -> EscapeAccessSet {
        EscapeAccessSet {
            value,
            accesses: Vec::new(),
        }
    }

    pub fn add_access(&mut self, access: EscapeAccess) {
        if !self.accesses.contains(&access) {
            self.accesses.push(access);
        }
    }

    pub fn merge(&mut self, other: &EscapeAccessSet) {
        debug_assert!(self.value == other.value);
        for access in &other.accesses {
            self.add_access(access.clone());
        }
    }
}

impl Serial for EscapeAccessSet {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::ESCAPE_ACCESS_SET, |buf| {
            self.value.write(buf);
            for access in &self.accesses {
                buf.open(tags::ESCAPE_ACCESS, |buf| {
                    access.where_.write(buf);
                    access.target.write(buf);
                    if let Some(field) = &access.field {
                        field.write(buf);
                    }
                });
            }
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::ESCAPE_ACCESS_SET)?;
        let value = Trace::read(reader)?;
        let mut set = EscapeAccessSet::new(value);
        while !reader.at_end() {
            let inner = reader.enter(tags::ESCAPE_ACCESS)?;
            let where_ = BlockPPoint::read(reader)?;
            let target = Trace::read(reader)?;
            let field = if reader.at_end() {
                None
            } else {
                Some(Field::read(reader)?)
            };
            reader.leave(inner);
            set.add_access(EscapeAccess {
                where_,
                target,
                field,
            });
        }
        reader.leave(outer);
        Ok(set)
    }
}

/// Merge a freshly produced set list into a persisted list; sets with the
/// same identity union their elements. Used both by the backend when
/// ingesting writes and by the merge caches when flushing.
pub fn merge_edge_set_lists(
    persisted: &mut Vec<EscapeEdgeSet>,
    fresh: impl IntoIterator<Item = EscapeEdgeSet>,
) {
    for set in fresh {
        match persisted
            .iter_mut()
            .find(|have| have.matches(&set.source, set.forward))
        {
            Some(have) => have.merge(&set),
            None => persisted.push(set),
        }
    }
    // canonical order so concurrent deltas flush to identical bytes no
    // matter which lands first.
    for set in persisted.iter_mut() {
        set.edges.sort();
    }
    persisted.sort_by(|a, b| {
        a.source
            .cmp(&b.source)
            .then_with(|| a.forward.cmp(&b.forward))
    });
}

pub fn merge_access_set_lists(
    persisted: &mut Vec<EscapeAccessSet>,
    fresh: impl IntoIterator<Item = EscapeAccessSet>,
) {
    for set in fresh {
        match persisted.iter_mut().find(|have| have.value == set.value) {
            Some(have) => have.merge(&set),
            None => persisted.push(set),
        }
    }
    for set in persisted.iter_mut() {
        set.accesses.sort();
    }
    persisted.sort_by(|a, b| a.value.cmp(&b.value));
}

/// Bounded propagation over the escape graph. Each visited trace is mapped
/// through [`EscapeVisitor::visit`]; hops through function-valued traces
/// are free, every other hop consumes the budget.
pub trait EscapeVisitor {
    /// Inspect a reached trace and pick the trace to continue from, or
    /// `None` to stop along this path. `skip_cutoff` exempts the hop from
    /// the budget.
    fn visit(&mut self, trace: &Trace, skip_cutoff: &mut bool) -> Option<Trace>;
}

/// Propagation driver with a visit budget. `forward` selects the edge
/// direction followed.
pub struct EscapeStatus<'a> {
    forward: bool,
    limit: usize,
    visited: Vec<Trace>,
    lookup: &'a mut dyn FnMut(&Trace, bool) -> Vec<EscapeEdge>,
}

impl<'a> EscapeStatus<'a> {
    pub fn new(
        forward: bool,
        limit: usize,
        lookup: &'a mut dyn FnMut(&Trace, bool) -> Vec<EscapeEdge>,
    ) -> EscapeStatus<'a> {
        EscapeStatus {
            forward,
            limit,
            visited: Vec::new(),
            lookup,
        }
    }

    /// Propagate from `source`, returning false when the budget ran out
    /// before the frontier was exhausted.
    pub fn follow_escape(
        &mut self,
        source: &Trace,
        visitor: &mut dyn EscapeVisitor,
    ) -> bool {
        let mut frontier = vec![source.clone()];
        let mut budget = self.limit;

        while let Some(trace) = frontier.pop() {
            if self.visited.contains(&trace) {
                continue;
            }
            self.visited.push(trace.clone());

            let mut skip_cutoff = false;
            let Some(cursor) = visitor.visit(&trace, &mut skip_cutoff) else {
                continue;
            };

            if !skip_cutoff {
                if budget == 0 {
                    return false;
                }
                budget -= 1;
            }

            for edge in (self.lookup)(&cursor, self.forward) {
                if !self.visited.contains(&edge.target) {
                    frontier.push(edge.target);
                }
            }
        }
        true
    }
}

/// Convenience constructor for the indirect-call propagation budget.
pub fn funptr_escape<'a>(
    lookup: &'a mut dyn FnMut(&Trace, bool) -> Vec<EscapeEdge>,
) -> EscapeStatus<'a> {
    EscapeStatus::new(false, FUNPTR_ESCAPE_LIMIT, lookup)
}

/// Escape edges and accesses produced by walking one CFG.
#[derive(Default)]
pub struct EscapeChanges {
    pub forward: Vec<EscapeEdgeSet>,
    pub backward: Vec<EscapeEdgeSet>,
    pub accesses: Vec<EscapeAccessSet>,
}

impl EscapeChanges {
    fn add_edge(&mut self, source: Trace, forward: bool, edge: EscapeEdge) {
        let list = if forward {
            &mut self.forward
        } else {
            &mut self.backward
        };
        match list
            .iter_mut()
            .find(|set| set.matches(&source, forward))
        {
            Some(set) => set.add_edge(edge),
            None => {
                let mut set = EscapeEdgeSet::new(source, forward);
                set.add_edge(edge);
                list.push(set);
            }
        }
    }

    fn add_access(&mut self, value: Trace, access: EscapeAccess) {
        match self.accesses.iter_mut().find(|set| set.value == value) {
            Some(set) => set.add_access(access),
            None => {
                let mut set = EscapeAccessSet::new(value);
                set.add_access(access);
                self.accesses.push(set);
            }
        }
    }

    /// Record that the value `rhs` may flow into the location `lhs` at
    /// `where_`. Assignments propagate both ways: forward edges from the
    /// right side, backward edges from the left.
    ///
    /// Expressions follow the frontend's value form: reading a location is
    /// an explicit dereference, so a bare lvalue on the right is an
    /// address-of (and a bare function variable is the function itself).
    /// The flow therefore relates trace(rhs) to trace(*lhs) as written.
    fn process_flow(&mut self, where_: &BlockPPoint, lhs: &Exp, rhs: &Exp) {
        let lhs_flow = Exp::make_drf(lhs.clone());

        let Some(lhs_trace) = Trace::from_exp(&where_.id, &lhs_flow) else {
            return;
        };
        let Some(rhs_trace) = Trace::from_exp(&where_.id, rhs) else {
            return;
        };

        self.add_edge(
            rhs_trace.clone(),
            true,
            EscapeEdge {
                target: lhs_trace.clone(),
                where_: where_.clone(),
            },
        );
        self.add_edge(
            lhs_trace,
            false,
            EscapeEdge {
                target: rhs_trace,
                where_: where_.clone(),
            },
        );
    }

    fn process_access(&mut self, where_: &BlockPPoint, lval: &Exp) {
        let Some(trace) = Trace::from_exp(&where_.id, lval) else {
            return;
        };
        let field = lval.base_field().cloned();
        for broader in trace.matches() {
            self.add_access(
                broader,
                EscapeAccess {
                    where_: where_.clone(),
                    target: trace.clone(),
                    field: field.clone(),
                },
            );
        }
    }
}

/// Walk one CFG and collect its escape edges and accesses: assignments
/// propagate both directions, address-of and dereference are
/// distinguished, and structural copies distribute over the copied CSU's
/// fields.
pub fn escape_process_cfg(cfg: &BlockCfg) -> EscapeChanges {
    let mut changes = EscapeChanges::default();

    for edge in cfg.edges() {
        let where_ = BlockPPoint::new(cfg.id().clone(), edge.source);
        match &edge.kind {
            PEdgeKind::Assign { ty, lhs, rhs } => {
                let distributed = match (ty.csu_name(), &**rhs) {
                    (Some(csu_name), ExpKind::Drf(rhs_loc)) => {
                        // structural copy: distribute the flow over the
                        // fields referenced anywhere in this CFG for the
                        // copied CSU.
                        let fields = csu_fields_in_cfg(cfg, csu_name);
                        for field in &fields {
                            let lhs_field = Exp::make_fld(lhs.clone(), field.clone());
                            let rhs_field = Exp::make_drf(Exp::make_fld(
                                rhs_loc.clone(),
                                field.clone(),
                            ));
                            changes.process_flow(&where_, &lhs_field, &rhs_field);
                        }
                        !fields.is_empty()
                    }
                    _ => false,
                };
                if !distributed {
                    changes.process_flow(&where_, lhs, rhs);
                }
                lhs.visit_lvalues(true, &mut |lval, write| {
                    if write {
                        changes.process_access(&where_, lval);
                    }
                });
                rhs.visit_lvalues(false, &mut |lval, _| {
                    changes.process_access(&where_, lval);
                });
            }
            PEdgeKind::Call {
                ret,
                instance: _,
                callee,
                args,
                ..
            } => {
                // parameter passing flows each actual into the callee's
                // formal argument trace.
                if let Some(function) = edge.direct_function() {
                    let callee_id = crate::ir::BlockId::make(
                        crate::ir::BlockKind::Function,
                        function.clone(),
                        None,
                    );
                    for (index, arg) in args.iter().enumerate() {
                        let formal = Exp::make_var(crate::ir::Variable::make_arg(
                            callee_id.clone(),
                            index as u32,
                            "",
                        ));
                        changes.process_flow(&where_, &formal, arg);
                    }
                    if let Some(ret) = ret {
                        let retval = Exp::make_drf(Exp::make_var(crate::ir::Variable::make(
                            Some(callee_id),
                            crate::ir::VarKind::Return,
                            "return",
                            None,
                        )));
                        changes.process_flow(&where_, ret, &retval);
                    }
                }
                for arg in args {
                    arg.visit_lvalues(false, &mut |lval, _| {
                        changes.process_access(&where_, lval);
                    });
                }
                callee.visit_lvalues(false, &mut |lval, _| {
                    changes.process_access(&where_, lval);
                });
            }
            _ => {}
        }
    }

    changes
}

/// Fields of the named CSU appearing anywhere in the CFG's expressions.
fn csu_fields_in_cfg(cfg: &BlockCfg, csu_name: &str) -> Vec<Field> {
    let mut fields: Vec<Field> = Vec::new();
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
            PEdgeKind::Call { callee, args, ret, instance, .. } => {
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
            PEdgeKind::Assume { cond, .. } => cond.visit_all(&mut consider),
            _ => {}
        }
    }
    fields.sort();
    fields
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{BlockId, BlockKind, Location, PEdge, Type, VarKind, Variable};

    fn test_cfg() -> BlockCfg {
        let id = BlockId::make(BlockKind::Function, Variable::make_func("f"), None);
        let mut cfg = BlockCfg::new(
            id.clone(),
            Location::make("test.c", 1),
            Location::make("test.c", 5),
        );
        let p1 = cfg.add_point(Location::make("test.c", 1));
        let p2 = cfg.add_point(Location::make("test.c", 2));
        cfg.set_entry_point(p1);
        cfg.set_exit_point(p2);

        // fp = g; (function pointer stored in a global)
        let fp = Exp::make_var(Variable::make_glob("fp"));
        let g = Exp::make_var(Variable::make_func("g"));
        cfg.add_edge(PEdge::assign(
            p1,
            p2,
            Type::make_pointer(Type::make_void(), 8),
            fp,
            g,
        ));
        cfg
    }

    #[test]
    fn test_assignment_propagates_both_ways() {
        let changes = escape_process_cfg(&test_cfg());
        assert_eq!(changes.forward.len(), 1);
        assert_eq!(changes.backward.len(), 1);

        let forward = &changes.forward[0];
        assert!(forward.source.trace_function().is_some());
        assert_eq!(forward.edges.len(), 1);

        let backward = &changes.backward[0];
        assert_eq!(backward.edges[0].target, forward.source);
    }

    #[test]
    fn test_merge_is_commutative() {
        let changes = escape_process_cfg(&test_cfg());
        let set = changes.forward[0].clone();
        let mut other = EscapeEdgeSet::new(set.source.clone(), true);
        other.add_edge(EscapeEdge {
            target: set.source.clone(),
            where_: set.edges[0].where_.clone(),
        });

        let mut ab: Vec<EscapeEdgeSet> = Vec::new();
        merge_edge_set_lists(&mut ab, [set.clone(), other.clone()]);
        let mut ba: Vec<EscapeEdgeSet> = Vec::new();
        merge_edge_set_lists(&mut ba, [other, set]);

        assert_eq!(ab.len(), ba.len());
        for (a, b) in ab.iter().zip(&ba) {
            assert_eq!(a.source, b.source);
            let mut ae = a.edges.clone();
            let mut be = b.edges.clone();
            ae.sort_by(|x, y| x.target.cmp(&y.target).then(x.where_.cmp(&y.where_)));
            be.sort_by(|x, y| x.target.cmp(&y.target).then(x.where_.cmp(&y.where_)));
            assert_eq!(ae, be);
        }
    }

    #[test]
    fn test_escape_budget() {
        // a chain of traces long enough to exhaust a small budget.
        let glob = |name: &str| Trace::make_glob(Exp::make_var(Variable::make_glob(name)));
        let chain: Vec<Trace> = (0..10).map(|i| glob(&format!("v{i}"))).collect();
        let edges: Vec<(Trace, Trace)> = chain
            .windows(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();

        struct Walker;
        impl EscapeVisitor for Walker {
            fn visit(&mut self, trace: &Trace, _skip: &mut bool) -> Option<Trace> {
                Some(trace.clone())
            }
        }

        let mut lookup = |trace: &Trace, _forward: bool| -> Vec<EscapeEdge> {
            let id = BlockId::make(BlockKind::Function, Variable::make_func("f"), None);
            edges
                .iter()
                .filter(|(source, _)| source == trace)
                .map(|(_, target)| EscapeEdge {
                    target: target.clone(),
                    where_: BlockPPoint::new(id.clone(), 1),
                })
                .collect()
        };

        let mut status = EscapeStatus::new(false, 3, &mut lookup);
        assert!(!status.follow_escape(&chain[0], &mut Walker));

        let mut lookup_all = |trace: &Trace, _forward: bool| -> Vec<EscapeEdge> {
            let id = BlockId::make(BlockKind::Function, Variable::make_func("f"), None);
            edges
                .iter()
                .filter(|(source, _)| source == trace)
                .map(|(_, target)| EscapeEdge {
                    target: target.clone(),
                    where_: BlockPPoint::new(id.clone(), 1),
                })
                .collect()
        };
        let mut status = EscapeStatus::new(false, 100, &mut lookup_all);
        assert!(status.follow_escape(&chain[0], &mut Walker));
    }

    #[test]
    fn test_local_variable_does_not_leak_trace() {
        let id = BlockId::make(BlockKind::Function, Variable::make_func("f"), None);
        let local = Exp::make_var(Variable::make(Some(id.clone()), VarKind::Local, "x", None));
        let trace = Trace::from_exp(&id, &local).unwrap();
        assert_eq!(trace.database_key(), "func:f");
    }
}
