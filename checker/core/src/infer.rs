// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! Summary inference: generate the assertion obligations of each block
//! (buffer accesses, pointer dereferences, integer overflow, annotations)
//! and mark the trivial and redundant ones using the solver.

use std::sync::Arc;

use checker_config::ARITHMETIC_ESCAPE_LIMIT;

use crate::error::CheckerResult;
use crate::ir::{
    AnnotationKind, BinopKind, Bit, BlockCfg, BlockKind, BoundKind, Exp, ExpKind, PEdgeKind,
    PPoint, Trace, TraceKind, Type, Variable,
};
use crate::escape::{EscapeStatus, EscapeVisitor};
use crate::memory::{BlockMemory, TranslateKind};
use crate::solve::{MinSatSolver, Solver};
use crate::storage::{Storage, BODY_ANNOT_DATABASE};
use crate::summary::{AssertClass, AssertKind, BlockSummary};

struct AssertInfo {
    kind: AssertKind,
    cls: AssertClass,
    point: PPoint,
    bit: Bit,
}

/// Escape walker collecting the lvalues within one function that may hold
/// the result of pointer arithmetic. Propagation stays within the
/// function; two known holes remain (arithmetic escaping through return
/// values, and arithmetic on buffers of structures).
struct ArithmeticEscape<'a> {
    function: &'a Variable,
    arithmetic_lvals: Vec<Exp>,
}

impl EscapeVisitor for ArithmeticEscape<'_> {
    fn visit(&mut self, trace: &Trace, _skip_cutoff: &mut bool) -> Option<Trace> {
        let TraceKind::Func { block, value } = &**trace else {
            return None;
        };
        if block.base_var() != self.function {
            return None;
        }
        if !self.arithmetic_lvals.contains(value) {
            self.arithmetic_lvals.push(value.clone());
        }
        Some(trace.clone())
    }
}

/// Collect the traces within the function holding pointer-arithmetic
/// results, by walking assignments whose right side is an index
/// expression and propagating forward from the assigned location.
fn collect_arithmetic_lvals(
    storage: &mut Storage,
    function: &Variable,
    cfgs: &[Arc<BlockCfg>],
) -> Vec<Exp> {
    let mut escape = ArithmeticEscape {
        function,
        arithmetic_lvals: Vec::new(),
    };

    for cfg in cfgs {
        for edge in cfg.edges() {
            let Some((_, lhs, rhs)) = edge.if_assign() else {
                continue;
            };
            if !rhs.is_index() {
                continue;
            }
            // the deref of the left side is what holds the arithmetic
            // result from here on.
            let left_drf = Exp::make_drf(lhs.clone());
            let Some(source) = Trace::from_exp(cfg.id(), &left_drf) else {
                continue;
            };

            let mut lookup = |trace: &Trace, forward: bool| -> Vec<crate::escape::EscapeEdge> {
                storage.lookup_escape_edges(trace, forward)
            };
            let mut status = EscapeStatus::new(true, ARITHMETIC_ESCAPE_LIMIT, &mut lookup);
            if !status.follow_escape(&source, &mut escape) {
                tracing::warn!("arithmetic escape propagation ran out of budget");
            }
        }
    }
    escape.arithmetic_lvals
}

/// Scan one lvalue for buffer and dereference checks, appending to the
/// assert list. Writes are added before reads; a shared duplicate check
/// keeps one copy of each (point, bit) pair.
fn scan_buffer_access(
    asserts: &mut Vec<AssertInfo>,
    arithmetic_lvals: &[Exp],
    point: PPoint,
    lval: &Exp,
    write: bool,
) {
    if !lval.is_lvalue() {
        return;
    }

    // peel leading fields; the buffer is underneath.
    let mut base_lval = lval.clone();
    while let ExpKind::Fld { target, .. } = &*base_lval {
        base_lval = target.clone();
    }

    let mut emit =
        |asserts: &mut Vec<AssertInfo>, base: &Exp, elem: &Type, index: &Exp| {
            let (lower_kind, upper_kind) = if write {
                (AssertKind::WriteUnderflow, AssertKind::WriteOverflow)
            } else {
                (AssertKind::ReadUnderflow, AssertKind::ReadOverflow)
            };

            let lbound = Exp::make_bound(BoundKind::Lower, base.clone(), elem.clone());
            let lower_bit = Bit::make_compare(BinopKind::GreaterEqual, index.clone(), lbound);
            let ubound = Exp::make_bound(BoundKind::Upper, base.clone(), elem.clone());
            let upper_bit = Bit::make_compare(BinopKind::LessThan, index.clone(), ubound);

            for (kind, bit) in [(lower_kind, lower_bit), (upper_kind, upper_bit)] {
                let duplicate = asserts
                    .iter()
                    .any(|info| info.point == point && info.bit == bit);
                if !duplicate {
                    asserts.push(AssertInfo {
                        kind,
                        cls: AssertClass::Check,
                        point,
                        bit,
                    });
                }
            }
        };

    match &*base_lval {
        ExpKind::Index {
            target,
            element_type,
            index,
        } => {
            emit(asserts, target, element_type, index);
            if target.is_index() && !write {
                // multidimensional access: the base is itself read.
                scan_buffer_access(asserts, arithmetic_lvals, point, target, false);
            }
        }
        ExpKind::Drf(target) => {
            // dereferences whose address has been observed as pointer
            // arithmetic get the bounds pair with index zero.
            let arithmetic = Trace::sanitize_exp(&base_lval)
                .is_some_and(|sanitized| arithmetic_lvals.contains(&sanitized));
            if arithmetic {
                let elem = Type::make_void();
                emit(asserts, &base_lval, &elem, &Exp::make_int(0));
            }
            // every dereference carries the null check.
            let bit = Bit::make_compare(BinopKind::NotEqual, target.clone(), Exp::make_int(0));
            let kind = if write {
                AssertKind::WriteDeref
            } else {
                AssertKind::ReadDeref
            };
            let duplicate = asserts
                .iter()
                .any(|info| info.point == point && info.bit == bit);
            if !duplicate {
                asserts.push(AssertInfo {
                    kind,
                    cls: AssertClass::Check,
                    point,
                    bit,
                });
            }
        }
        _ => {}
    }
}

/// Integer overflow checks for one expression tree. Present but disabled
/// by default.
fn scan_integer_overflow(asserts: &mut Vec<AssertInfo>, point: PPoint, exp: &Exp) {
    exp.visit_all(&mut |exp| {
        let Some((bits, signed)) = exp.int_width() else {
            return;
        };
        if bits == 0 || bits > 126 {
            return;
        }
        let (min, max) = if signed {
            (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
        } else {
            (0, (1i128 << bits) - 1)
        };

        asserts.push(AssertInfo {
            kind: AssertKind::IntegerUnderflow,
            cls: AssertClass::Check,
            point,
            bit: Bit::make_compare(BinopKind::GreaterEqual, exp.clone(), Exp::make_int(min)),
        });
        asserts.push(AssertInfo {
            kind: AssertKind::IntegerOverflow,
            cls: AssertClass::Check,
            point,
            bit: Bit::make_compare(BinopKind::LessEqual, exp.clone(), Exp::make_int(max)),
        });
    });
}

/// Mark trivial and redundant assertions. Two passes: first each assertion
/// is checked against its own path guard, then against the other
/// assertions of the same kind; finally, assertions at loop-isomorphic
/// points defer to the copy inside the loop body.
fn mark_redundant_asserts(memory: &BlockMemory, cfg: &BlockCfg, asserts: &mut [AssertInfo]) {
    let mut solver = Solver::new("redundant", Box::new(MinSatSolver::new()));

    for index in 0..asserts.len() {
        solver.push_context();

        // assert the guard at the point, and the negation of the bit
        // translated to that point.
        let guard = memory.guard(asserts[index].point);
        solver.add_assert(0, &guard);

        let not_bit = Bit::make_not(asserts[index].bit.clone());
        let translated = memory.translate_bit(TranslateKind::Point, asserts[index].point, &not_bit);
        solver.add_assert(0, &translated);

        match solver.is_satisfiable() {
            Ok(false) => {
                // tautological or proved by the guard alone.
                asserts[index].cls = AssertClass::Trivial;
                solver.pop_context();
                continue;
            }
            Ok(true) => {}
            Err(_) => {
                solver.pop_context();
                continue;
            }
        }

        // assert that the other checked assertions of the same kind hold.
        for other in 0..asserts.len() {
            if other == index
                || asserts[other].cls != AssertClass::Check
                || asserts[other].kind != asserts[index].kind
            {
                continue;
            }
            let other_guard = memory.guard(asserts[other].point);
            let other_bit =
                memory.translate_bit(TranslateKind::Point, asserts[other].point, &asserts[other].bit);
            solver.add_assert(0, &Bit::make_imply(other_guard, other_bit));
        }

        if let Ok(false) = solver.is_satisfiable() {
            // implied by the remaining assertions.
            asserts[index].cls = AssertClass::Redundant;
        }
        solver.pop_context();
    }

    // assertions isomorphic to a point inside a loop body defer to the
    // equivalent assertion of the loop block.
    let has_loop_edge = cfg.edges().iter().any(|edge| edge.if_loop().is_some());
    if has_loop_edge {
        for info in asserts.iter_mut() {
            if info.cls == AssertClass::Check && cfg.is_loop_isomorphic(info.point) {
                info.cls = AssertClass::Redundant;
            }
        }
    }
}

/// Produce the summaries for one function's blocks from their memory
/// tables: assertion generation followed by redundancy marking.
pub fn infer_summaries(
    storage: &mut Storage,
    function: &Variable,
    memories: &[Arc<BlockMemory>],
) -> CheckerResult<Vec<BlockSummary>> {
    let infer_integer = storage.context().parameters.infer_integer_overflow;
    let cfgs: Vec<Arc<BlockCfg>> = memories
        .iter()
        .filter_map(|memory| memory.cfg().cloned())
        .collect();

    let annot_list = storage.get_annotations(BODY_ANNOT_DATABASE, function.name());
    let arithmetic_lvals = collect_arithmetic_lvals(storage, function, &cfgs);

    let mut summaries = Vec::new();

    for memory in memories {
        let Some(cfg) = memory.cfg().cloned() else {
            continue;
        };
        let mut asserts: Vec<AssertInfo> = Vec::new();

        // postconditions apply at the exit of the function body.
        if cfg.id().kind() == BlockKind::Function {
            for annot_cfg in annot_list.iter() {
                if annot_cfg.annotation_kind() != AnnotationKind::Postcondition {
                    continue;
                }
                if let Some(bit) = annot_cfg.annotation_bit() {
                    asserts.push(AssertInfo {
                        kind: AssertKind::Annotation,
                        cls: AssertClass::Check,
                        point: cfg.exit_point(),
                        bit: bit.clone(),
                    });
                }
            }
        }

        // intermediate assert annotations attached to points.
        for (point, annot_id) in cfg.point_annotations() {
            let annot_cfg = annot_list.iter().find(|cfg| cfg.id() == annot_id);
            let Some(annot_cfg) = annot_cfg else {
                continue;
            };
            let kind = match annot_cfg.annotation_kind() {
                AnnotationKind::Assert => AssertKind::Annotation,
                AnnotationKind::AssertRuntime => AssertKind::AnnotationRuntime,
                _ => continue,
            };
            if let Some(bit) = annot_cfg.annotation_bit() {
                asserts.push(AssertInfo {
                    kind,
                    cls: AssertClass::Check,
                    point: *point,
                    bit: bit.clone(),
                });
            }
        }

        for edge in cfg.edges() {
            let point = edge.source;

            if let PEdgeKind::Call { .. } = &edge.kind {
                // callee preconditions, from direct and indirect callees.
                let mut callee_names: Vec<Variable> = Vec::new();
                match edge.direct_function() {
                    Some(callee) => callee_names.push(callee),
                    None => {
                        if let Some(callees) = storage.get_call_edges(function, false) {
                            for call_edge in &callees.edges {
                                if call_edge.where_.id == *cfg.id()
                                    && call_edge.where_.point == point
                                {
                                    callee_names.push(call_edge.callee.clone());
                                }
                            }
                        }
                    }
                }

                for callee in callee_names {
                    let callee_annots =
                        storage.get_annotations(BODY_ANNOT_DATABASE, callee.name());
                    for annot_cfg in callee_annots.iter() {
                        if annot_cfg.annotation_kind() != AnnotationKind::Precondition {
                            continue;
                        }
                        let Some(bit) = annot_cfg.annotation_bit() else {
                            continue;
                        };
                        // translate the precondition into the caller frame
                        // across this callsite.
                        let caller_bit = memory.translate_bit(TranslateKind::Callee, point, bit);
                        asserts.push(AssertInfo {
                            kind: AssertKind::Annotation,
                            cls: AssertClass::Check,
                            point,
                            bit: caller_bit,
                        });
                    }
                }
            }

            // writes are scanned before reads so the shared duplicate
            // check suppresses the read copy of compound accesses.
            if let Some((_, lhs, _)) = edge.if_assign() {
                scan_buffer_access(&mut asserts, &arithmetic_lvals, point, lhs, true);
            }
            if let PEdgeKind::Call { ret: Some(ret), .. } = &edge.kind {
                scan_buffer_access(&mut asserts, &arithmetic_lvals, point, ret, true);
            }

            match &edge.kind {
                PEdgeKind::Assign { lhs, rhs, .. } => {
                    lhs.visit_lvalues(true, &mut |lval, write| {
                        if !write {
                            scan_buffer_access(&mut asserts, &arithmetic_lvals, point, lval, false);
                        }
                    });
                    rhs.visit_lvalues(false, &mut |lval, _| {
                        scan_buffer_access(&mut asserts, &arithmetic_lvals, point, lval, false);
                    });
                    if infer_integer {
                        scan_integer_overflow(&mut asserts, point, rhs);
                    }
                }
                PEdgeKind::Assume { cond, .. } => {
                    cond.visit_lvalues(false, &mut |lval, _| {
                        scan_buffer_access(&mut asserts, &arithmetic_lvals, point, lval, false);
                    });
                    if infer_integer {
                        scan_integer_overflow(&mut asserts, point, cond);
                    }
                }
                PEdgeKind::Call { callee, args, .. } => {
                    callee.visit_lvalues(false, &mut |lval, _| {
                        scan_buffer_access(&mut asserts, &arithmetic_lvals, point, lval, false);
                    });
                    for arg in args {
                        arg.visit_lvalues(false, &mut |lval, _| {
                            scan_buffer_access(&mut asserts, &arithmetic_lvals, point, lval, false);
                        });
                        if infer_integer {
                            scan_integer_overflow(&mut asserts, point, arg);
                        }
                    }
                }
                _ => {}
            }
        }

        mark_redundant_asserts(memory, &cfg, &mut asserts);

        let mut summary = BlockSummary::new(cfg.id().clone());
        for info in asserts {
            storage
                .context()
                .metrics
                .asserts_generated
                .with_label_values(&[info.kind.name()])
                .inc();
            summary.add_assert(info.kind, info.cls, info.point, info.bit);
        }
        summaries.push(summary);
    }

    Ok(summaries)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Context;
    use crate::ir::{BlockId, Location, PEdge};
    use crate::memory::{AliasKind, ClobberKind, SimplifyKind};
    use crate::store::Backend;
    use crate::summary::AssertClass;

    fn storage() -> (Storage, tempfile::TempDir) {
        let (context, dir) = Context::new_for_test();
        let backend = Backend::new(dir.path()).unwrap();
        (Storage::new(backend, context), dir)
    }

    fn memory_for(cfg: BlockCfg) -> Arc<BlockMemory> {
        let mut memory = BlockMemory::new(
            cfg.id().clone(),
            SimplifyKind::Scalar,
            AliasKind::Buffer,
            ClobberKind::Modset,
        );
        memory.set_cfg(Arc::new(cfg));
        memory.compute_tables(&mut |_| None).unwrap();
        Arc::new(memory)
    }

    /// `void f(int *p, int n) { p[n] = 0; }` in value form.
    fn buffer_write_cfg() -> (Variable, BlockCfg) {
        let function = Variable::make_func("f");
        let id = BlockId::make(BlockKind::Function, function.clone(), None);
        let mut cfg = BlockCfg::new(
            id.clone(),
            Location::make("test.c", 1),
            Location::make("test.c", 2),
        );
        let p = Exp::make_drf(Exp::make_var(Variable::make_arg(id.clone(), 0, "p")));
        let n = Exp::make_drf(Exp::make_var(Variable::make_arg(id, 1, "n")));

        let p1 = cfg.add_point(Location::make("test.c", 1));
        let p2 = cfg.add_point(Location::make("test.c", 2));
        cfg.set_entry_point(p1);
        cfg.set_exit_point(p2);

        let int_type = Type::make_int(32, true);
        cfg.add_edge(PEdge::assign(
            p1,
            p2,
            int_type.clone(),
            Exp::make_index(p, int_type, n),
            Exp::make_int(0),
        ));
        (function, cfg)
    }

    #[test]
    fn test_buffer_write_generates_bound_checks() {
        let (mut storage, _dir) = storage();
        let (function, cfg) = buffer_write_cfg();
        let memory = memory_for(cfg);

        let summaries = infer_summaries(&mut storage, &function, &[memory]).unwrap();
        assert_eq!(summaries.len(), 1);

        let checks: Vec<_> = summaries[0]
            .asserts()
            .iter()
            .filter(|a| {
                matches!(
                    a.kind,
                    AssertKind::WriteUnderflow | AssertKind::WriteOverflow
                )
            })
            .collect();
        assert_eq!(checks.len(), 2);
        assert!(checks.iter().all(|a| a.cls == AssertClass::Check));
        assert!(checks.iter().all(|a| a.point == 1));
    }

    /// `void f(int *p) { if (p) *p = 0; }`: the dereference check is
    /// proved by the branch guard, so it classifies as trivial.
    #[test]
    fn test_guarded_deref_is_trivial() {
        let (mut storage, _dir) = storage();
        let function = Variable::make_func("g");
        let id = BlockId::make(BlockKind::Function, function.clone(), None);
        let mut cfg = BlockCfg::new(
            id.clone(),
            Location::make("test.c", 1),
            Location::make("test.c", 3),
        );
        let p_value = Exp::make_drf(Exp::make_var(Variable::make_arg(id, 0, "p")));

        let entry = cfg.add_point(Location::make("test.c", 1));
        let then = cfg.add_point(Location::make("test.c", 2));
        let exit = cfg.add_point(Location::make("test.c", 3));
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
        cfg.add_edge(PEdge::assume(entry, exit, p_value, false));

        let memory = memory_for(cfg);
        let summaries = infer_summaries(&mut storage, &function, &[memory]).unwrap();

        let deref: Vec<_> = summaries[0]
            .asserts()
            .iter()
            .filter(|a| a.kind == AssertKind::WriteDeref)
            .collect();
        assert_eq!(deref.len(), 1);
        assert_eq!(deref[0].cls, AssertClass::Trivial);
    }

    #[test]
    fn test_integer_overflow_disabled_by_default() {
        let (mut storage, _dir) = storage();
        let (function, cfg) = buffer_write_cfg();
        let memory = memory_for(cfg);
        let summaries = infer_summaries(&mut storage, &function, &[memory]).unwrap();
        assert!(summaries[0]
            .asserts()
            .iter()
            .all(|a| a.kind != AssertKind::IntegerOverflow));
    }

    #[test]
    fn test_duplicate_bounds_suppressed() {
        // reading and writing the same access point yields one pair.
        let (mut storage, _dir) = storage();
        let (function, mut cfg) = buffer_write_cfg();
        let edge = cfg.edges()[0].clone();
        let (_, lhs, _) = edge.if_assign().unwrap();
        let lhs = lhs.clone();
        cfg.add_edge(PEdge::assign(
            1,
            2,
            Type::make_int(32, true),
            lhs.clone(),
            Exp::make_drf(lhs),
        ));

        let memory = memory_for(cfg);
        let summaries = infer_summaries(&mut storage, &function, &[memory]).unwrap();
        let bounds = summaries[0]
            .asserts()
            .iter()
            .filter(|a| {
                matches!(
                    a.kind,
                    AssertKind::WriteOverflow
                        | AssertKind::WriteUnderflow
                        | AssertKind::ReadOverflow
                        | AssertKind::ReadUnderflow
                )
            })
            .count();
        assert_eq!(bounds, 2);
    }
}
