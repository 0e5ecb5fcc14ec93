// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! Callgraph construction. Direct edges come straight off the Call edges
//! of each CFG; indirect edges are resolved by propagating backwards
//! through the escape graph from the called expression, or from the class
//! hierarchy for virtual calls.

use std::sync::Arc;

use crate::error::CheckerResult;
use crate::ir::{
    BlockCfg, BlockId, BlockKind, BlockPPoint, PEdge, PEdgeKind, Trace, VarKind, Variable,
};
use crate::escape::{funptr_escape, EscapeEdge, EscapeVisitor};
use crate::serialize::{tags, Buffer, Reader, Serial};

/// One call edge: the callsite and the counterparty function.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CallEdge {
    pub where_: BlockPPoint,
    pub callee: Variable,
}

/// The callers or callees of one function. Append-only set; duplicates
/// collapse and merge is union.
#[derive(Clone, Debug)]
pub struct CallEdgeSet {
    pub function: Variable,
    pub callers: bool,
    pub edges: Vec<CallEdge>,
}

impl CallEdgeSet {
    pub fn new(function: Variable, callers: bool) -> CallEdgeSet {
        CallEdgeSet {
            function,
            callers,
            edges: Vec::new(),
        }
    }

    pub fn add_edge(&mut self, edge: CallEdge) {
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    pub fn merge(&mut self, other: &CallEdgeSet) {
        debug_assert!(self.function == other.function && self.callers == other.callers);
        for edge in &other.edges {
            self.add_edge(edge.clone());
        }
    }
}

impl Serial for CallEdgeSet {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::CALL_EDGE_SET, |buf| {
            self.function.write(buf);
            buf.put_bool(self.callers);
            for edge in &self.edges {
                buf.open(tags::CALL_EDGE, |buf| {
                    edge.where_.write(buf);
                    edge.callee.write(buf);
                });
            }
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::CALL_EDGE_SET)?;
        let function = Variable::read(reader)?;
        let callers = reader.get_bool()?;
        let mut set = CallEdgeSet::new(function, callers);
        while !reader.at_end() {
            let inner = reader.enter(tags::CALL_EDGE)?;
            let where_ = BlockPPoint::read(reader)?;
            let callee = Variable::read(reader)?;
            reader.leave(inner);
            set.add_edge(CallEdge { where_, callee });
        }
        reader.leave(outer);
        Ok(set)
    }
}

/// Caller and callee edge sets produced while visiting CFGs, keyed the way
/// the merge caches key them: callers by the callee function, callees by
/// the caller function.
#[derive(Default)]
pub struct CallgraphChanges {
    pub callers: Vec<CallEdgeSet>,
    pub callees: Vec<CallEdgeSet>,
}

impl CallgraphChanges {
    /// Record `where_` invoking `callee`, directly or indirectly.
    pub fn process_call(&mut self, where_: BlockPPoint, callee: Variable) {
        let caller = where_.id.base_var().clone();

        let caller_set = match self
            .callers
            .iter_mut()
            .find(|set| set.function == callee)
        {
            Some(set) => set,
            None => {
                self.callers.push(CallEdgeSet::new(callee.clone(), true));
                self.callers.last_mut().unwrap()
            }
        };
        caller_set.add_edge(CallEdge {
            where_: where_.clone(),
            callee: callee.clone(),
        });

        let callee_set = match self
            .callees
            .iter_mut()
            .find(|set| set.function == caller)
        {
            Some(set) => set,
            None => {
                self.callees.push(CallEdgeSet::new(caller, false));
                self.callees.last_mut().unwrap()
            }
        };
        callee_set.add_edge(CallEdge { where_, callee });
    }
}

/// Merge fresh call edge sets into a persisted list, unioning sets with
/// the same function and direction.
pub fn merge_call_set_lists(
    persisted: &mut Vec<CallEdgeSet>,
    fresh: impl IntoIterator<Item = CallEdgeSet>,
) {
    for set in fresh {
        match persisted
            .iter_mut()
            .find(|have| have.function == set.function && have.callers == set.callers)
        {
            Some(have) => have.merge(&set),
            None => persisted.push(set),
        }
    }
    for set in persisted.iter_mut() {
        set.edges.sort();
    }
    persisted.sort_by(|a, b| {
        a.function
            .cmp(&b.function)
            .then_with(|| a.callers.cmp(&b.callers))
    });
}

/// Record the direct call edges of one CFG. Distinct direct callees land
/// in `callees`; `indirect` is set when any call lacks a resolved callee.
pub fn callgraph_process_cfg(
    cfg: &BlockCfg,
    changes: &mut CallgraphChanges,
    callees: &mut Vec<Variable>,
    indirect: &mut bool,
) {
    for edge in cfg.edges() {
        let PEdgeKind::Call { .. } = edge.kind else {
            continue;
        };
        // watch for 'direct' calls to local variables, where the frontend
        // could not resolve the function referred to.
        match edge.direct_function() {
            Some(callee) => {
                let where_ = BlockPPoint::new(cfg.id().clone(), edge.source);
                changes.process_call(where_, callee.clone());
                if !callees.contains(&callee) {
                    callees.push(callee);
                }
            }
            None => *indirect = true,
        }
    }
}

/// Resolution context for indirect calls: how to read escape edges and how
/// to hydrate a callee's CFG for the argument-count check.
pub struct IndirectResolver<'a> {
    pub edge_lookup: &'a mut dyn FnMut(&Trace, bool) -> Vec<EscapeEdge>,
    pub cfg_lookup: &'a mut dyn FnMut(&BlockId) -> Option<Arc<BlockCfg>>,
}

struct FunctionPointerVisitor<'a> {
    cfg: &'a BlockCfg,
    edge: &'a PEdge,
    changes: &'a mut CallgraphChanges,
    callees: &'a mut Vec<Variable>,
    cfg_lookup: &'a mut dyn FnMut(&BlockId) -> Option<Arc<BlockCfg>>,
    found: bool,
}

impl EscapeVisitor for FunctionPointerVisitor<'_> {
    fn visit(&mut self, trace: &Trace, skip_cutoff: &mut bool) -> Option<Trace> {
        if let Some(function) = trace.trace_function().cloned() {
            // check for a mismatch in the number of arguments between the
            // call edge and the target. a more aggressive notion of
            // mismatch runs into trouble with casts.
            let callee_id = BlockId::make(BlockKind::Function, function.clone(), None);
            let mut mismatch = false;
            if let Some(callee_cfg) = (self.cfg_lookup)(&callee_id) {
                let arg_count = callee_cfg
                    .variables()
                    .iter()
                    .filter(|define| define.var.kind() == VarKind::Arg)
                    .map(|define| define.var.index() + 1)
                    .max()
                    .unwrap_or(0) as usize;
                if arg_count != self.edge.call_args().len() {
                    mismatch = true;
                }
            }

            if mismatch {
                tracing::warn!(
                    "discarded mismatched indirect call: {}: {}: {}",
                    self.cfg.id(),
                    self.edge.source,
                    function.name()
                );
            } else {
                if !self.callees.contains(&function) {
                    self.callees.push(function.clone());
                }
                let where_ = BlockPPoint::new(self.cfg.id().clone(), self.edge.source);
                self.changes.process_call(where_, function);
                self.found = true;
            }
        }

        // continue from the least specific matching trace; hops through
        // function-valued traces are free so any number of targets can be
        // found along short paths.
        let matches = trace.matches();
        let cursor = matches.first().cloned();
        if let Some(cursor) = &cursor {
            if cursor.trace_function().is_some() {
                *skip_cutoff = true;
            }
        }
        cursor
    }
}

/// Resolve the indirect calls of one CFG by bounded backward escape
/// propagation. Virtual calls through a receiver seed from the CSU of the
/// callsite signature; plain function pointers seed from the called
/// expression's trace.
pub fn callgraph_process_cfg_indirect(
    cfg: &BlockCfg,
    changes: &mut CallgraphChanges,
    callees: &mut Vec<Variable>,
    resolver: &mut IndirectResolver<'_>,
) {
    for edge in cfg.edges() {
        let PEdgeKind::Call {
            fn_type,
            instance,
            callee,
            ..
        } = &edge.kind
        else {
            continue;
        };
        if edge.direct_function().is_some() {
            // the direct pass generated this edge already.
            continue;
        }

        let source = if instance.is_some() {
            // virtual call through an object; the class hierarchy is
            // encoded in the escape edges, so walk it from the supertype
            // of the callsite's signature.
            fn_type
                .call_csu()
                .map(|csu_name| Trace::make_comp(csu_name, None))
        } else {
            Trace::from_exp(cfg.id(), callee)
        };

        let mut visitor = FunctionPointerVisitor {
            cfg,
            edge,
            changes,
            callees,
            cfg_lookup: resolver.cfg_lookup,
            found: false,
        };

        let success = match &source {
            Some(source) => {
                let mut status = funptr_escape(resolver.edge_lookup);
                status.follow_escape(source, &mut visitor)
            }
            None => false,
        };

        if !success {
            tracing::warn!("incomplete function pointer propagation: {edge}");
        }
        if !visitor.found {
            tracing::warn!("no indirect targets found: {}: {edge}", cfg.id());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::escape::escape_process_cfg;
    use crate::ir::{Exp, Location, Type};

    /// `void (*fp)(void); void g(void) {} void f(void) { fp = g; fp(); }`
    fn indirect_cfg() -> BlockCfg {
        let id = BlockId::make(BlockKind::Function, Variable::make_func("f"), None);
        let mut cfg = BlockCfg::new(
            id.clone(),
            Location::make("test.c", 1),
            Location::make("test.c", 5),
        );
        let p1 = cfg.add_point(Location::make("test.c", 2));
        let p2 = cfg.add_point(Location::make("test.c", 3));
        let p3 = cfg.add_point(Location::make("test.c", 4));
        cfg.set_entry_point(p1);
        cfg.set_exit_point(p3);

        let fp = Exp::make_var(Variable::make_glob("fp"));
        let g = Exp::make_var(Variable::make_func("g"));
        let fn_type = Type::make_function(Type::make_void(), None, false, vec![]);
        cfg.add_edge(PEdge::assign(
            p1,
            p2,
            Type::make_pointer(fn_type.clone(), 8),
            fp.clone(),
            g,
        ));
        cfg.add_edge(PEdge::call(
            p2,
            p3,
            fn_type,
            None,
            None,
            Exp::make_drf(fp),
            vec![],
        ));
        cfg
    }

    #[test]
    fn test_direct_pass_flags_indirect() {
        let cfg = indirect_cfg();
        let mut changes = CallgraphChanges::default();
        let mut callees = Vec::new();
        let mut indirect = false;
        callgraph_process_cfg(&cfg, &mut changes, &mut callees, &mut indirect);
        assert!(indirect);
        assert!(callees.is_empty());
        assert!(changes.callers.is_empty());
    }

    #[test]
    fn test_indirect_resolves_through_escape() {
        let cfg = indirect_cfg();
        let escape = escape_process_cfg(&cfg);

        let mut edge_lookup = move |trace: &Trace, forward: bool| -> Vec<EscapeEdge> {
            let list = if forward {
                &escape.forward
            } else {
                &escape.backward
            };
            list.iter()
                .filter(|set| set.source == *trace)
                .flat_map(|set| set.edges.clone())
                .collect()
        };
        let mut cfg_lookup = |_: &BlockId| -> Option<Arc<BlockCfg>> { None };

        let mut resolver = IndirectResolver {
            edge_lookup: &mut edge_lookup,
            cfg_lookup: &mut cfg_lookup,
        };
        let mut changes = CallgraphChanges::default();
        let mut callees = Vec::new();
        callgraph_process_cfg_indirect(&cfg, &mut changes, &mut callees, &mut resolver);

        assert_eq!(callees.len(), 1);
        assert_eq!(callees[0].name(), "g");
        assert_eq!(changes.callers.len(), 1);
        assert_eq!(changes.callers[0].function.name(), "g");
        assert_eq!(changes.callees.len(), 1);
        assert_eq!(changes.callees[0].function.name(), "f");
    }

    #[test]
    fn test_mismatched_arity_dropped() {
        let cfg = indirect_cfg();
        let escape = escape_process_cfg(&cfg);

        let mut edge_lookup = move |trace: &Trace, forward: bool| -> Vec<EscapeEdge> {
            let list = if forward {
                &escape.forward
            } else {
                &escape.backward
            };
            list.iter()
                .filter(|set| set.source == *trace)
                .flat_map(|set| set.edges.clone())
                .collect()
        };
        // g takes two arguments according to its CFG; the call passes none.
        let mut cfg_lookup = |id: &BlockId| -> Option<Arc<BlockCfg>> {
            let mut callee = BlockCfg::new(
                id.clone(),
                Location::make("test.c", 10),
                Location::make("test.c", 12),
            );
            callee.add_variable(
                Variable::make_arg(id.clone(), 1, "b"),
                Type::make_int(32, true),
            );
            Some(Arc::new(callee))
        };

        let mut resolver = IndirectResolver {
            edge_lookup: &mut edge_lookup,
            cfg_lookup: &mut cfg_lookup,
        };
        let mut changes = CallgraphChanges::default();
        let mut callees = Vec::new();
        callgraph_process_cfg_indirect(&cfg, &mut changes, &mut callees, &mut resolver);

        assert!(callees.is_empty());
        assert!(changes.callers.is_empty());
    }
}
