// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios driving the pass drivers over a real store.

use crate::context::Context;
use crate::ir::{
    BinopKind, BlockCfg, BlockId, BlockKind, Exp, Location, PEdge, Type, Variable,
};
use crate::memory::TranslateKind;
use crate::solve::{testing::FixedVerdict, Solver, SolverMux};
use crate::storage::{BODY_DATABASE, SUMMARY_DATABASE};
use crate::store::do_replace_transaction;
use crate::summary::{AssertClass, AssertKind};
use crate::{
    analysis_cleanup, analysis_prepare, run_check_pass, run_infer_pass, run_memory_pass,
    split_loops, CheckOptions, CheckerError,
};
use crate::serialize::{Buffer, Serial};

fn arg_value(id: &BlockId, index: u32, name: &str) -> Exp {
    Exp::make_drf(Exp::make_var(Variable::make_arg(id.clone(), index, name)))
}

fn persist_bodies(context: &Context, bodies: &[(&str, Vec<BlockCfg>)]) {
    let session = analysis_prepare(context.clone()).unwrap();
    for (function, cfgs) in bodies {
        let mut buf = Buffer::new();
        for cfg in cfgs {
            cfg.write(&mut buf);
        }
        do_replace_transaction(&*session.backend, BODY_DATABASE, function, buf.as_bytes())
            .unwrap();
    }
    analysis_cleanup(session).unwrap();
}

fn run_passes(context: &Context) {
    let mut session = analysis_prepare(context.clone()).unwrap();
    run_memory_pass(&mut session, &[]).unwrap();
    analysis_cleanup(session).unwrap();

    let mut session = analysis_prepare(context.clone()).unwrap();
    run_infer_pass(&mut session, &[]).unwrap();
    analysis_cleanup(session).unwrap();
}

/// `void f(int *p, int n) { p[n] = 0; }`
fn buffer_write_body() -> (BlockId, BlockCfg) {
    let id = BlockId::make(BlockKind::Function, Variable::make_func("f"), None);
    let mut cfg = BlockCfg::new(
        id.clone(),
        Location::make("file.c", 1),
        Location::make("file.c", 2),
    );
    let p = arg_value(&id, 0, "p");
    let n = arg_value(&id, 1, "n");

    let p1 = cfg.add_point(Location::make("file.c", 1));
    let p2 = cfg.add_point(Location::make("file.c", 2));
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
    (id, cfg)
}

#[test]
fn test_buffer_write_produces_two_checks() {
    let (context, dir) = Context::new_for_test();
    let (id, cfg) = buffer_write_body();
    persist_bodies(&context, &[("f", vec![cfg])]);
    run_passes(&context);

    // the summary carries both bound checks at the write point.
    let mut session = analysis_prepare(context.clone()).unwrap();
    let summary = session.storage.get_block_summary(&id);
    let bounds: Vec<_> = summary
        .asserts()
        .iter()
        .filter(|a| {
            matches!(
                a.kind,
                AssertKind::WriteUnderflow | AssertKind::WriteOverflow
            )
        })
        .collect();
    assert_eq!(bounds.len(), 2);
    assert!(bounds.iter().all(|a| a.cls == AssertClass::Check));
    assert!(bounds.iter().all(|a| a.point == 1));

    // checking write_overflow reports the unprovable access and produces
    // a non-empty XML file.
    let xml_path = dir.path().join("reports.xml");
    let options = CheckOptions {
        check_kind: AssertKind::WriteOverflow,
        check_file: None,
        xml_out: Some(xml_path.clone()),
        append: false,
    };
    let stats = run_check_pass(&mut session, &["f"], &options).unwrap();
    analysis_cleanup(session).unwrap();

    assert_eq!(stats.checked, 1);
    assert_eq!(stats.reported, 1);
    let xml = std::fs::read_to_string(xml_path).unwrap();
    assert!(!xml.is_empty());
    assert!(xml.contains("write_overflow"));
}

/// `void f(int *p) { if (p) *p = 0; }`
#[test]
fn test_guarded_deref_classifies_trivial() {
    let (context, _dir) = Context::new_for_test();
    let id = BlockId::make(BlockKind::Function, Variable::make_func("f"), None);
    let mut cfg = BlockCfg::new(
        id.clone(),
        Location::make("file.c", 1),
        Location::make("file.c", 3),
    );
    let p = arg_value(&id, 0, "p");

    let entry = cfg.add_point(Location::make("file.c", 1));
    let then = cfg.add_point(Location::make("file.c", 2));
    let exit = cfg.add_point(Location::make("file.c", 3));
    cfg.set_entry_point(entry);
    cfg.set_exit_point(exit);
    cfg.add_edge(PEdge::assume(entry, then, p.clone(), true));
    cfg.add_edge(PEdge::assign(
        then,
        exit,
        Type::make_int(32, true),
        Exp::make_drf(p.clone()),
        Exp::make_int(0),
    ));
    cfg.add_edge(PEdge::assume(entry, exit, p, false));

    persist_bodies(&context, &[("f", vec![cfg])]);
    run_passes(&context);

    let mut session = analysis_prepare(context.clone()).unwrap();
    let summary = session.storage.get_block_summary(&id);
    let deref: Vec<_> = summary
        .asserts()
        .iter()
        .filter(|a| a.kind == AssertKind::WriteDeref)
        .collect();
    assert_eq!(deref.len(), 1);
    assert_eq!(deref[0].cls, AssertClass::Trivial);

    // nothing to check, nothing to report.
    let options = CheckOptions {
        check_kind: AssertKind::WriteDeref,
        ..Default::default()
    };
    let stats = run_check_pass(&mut session, &["f"], &options).unwrap();
    analysis_cleanup(session).unwrap();
    assert_eq!(stats.checked, 0);
    assert_eq!(stats.reported, 0);
}

/// `void (*fp)(void); void g(void) {} void f(void) { fp = g; fp(); }`
#[test]
fn test_indirect_call_produces_call_edges() {
    let (context, _dir) = Context::new_for_test();

    let f_id = BlockId::make(BlockKind::Function, Variable::make_func("f"), None);
    let mut f_cfg = BlockCfg::new(
        f_id.clone(),
        Location::make("file.c", 3),
        Location::make("file.c", 6),
    );
    let p1 = f_cfg.add_point(Location::make("file.c", 4));
    let p2 = f_cfg.add_point(Location::make("file.c", 5));
    let p3 = f_cfg.add_point(Location::make("file.c", 6));
    f_cfg.set_entry_point(p1);
    f_cfg.set_exit_point(p3);

    let fp = Exp::make_var(Variable::make_glob("fp"));
    let fn_type = Type::make_function(Type::make_void(), None, false, vec![]);
    f_cfg.add_edge(PEdge::assign(
        p1,
        p2,
        Type::make_pointer(fn_type.clone(), 8),
        fp.clone(),
        Exp::make_var(Variable::make_func("g")),
    ));
    f_cfg.add_edge(PEdge::call(
        p2,
        p3,
        fn_type,
        None,
        None,
        Exp::make_drf(fp),
        vec![],
    ));

    let g_id = BlockId::make(BlockKind::Function, Variable::make_func("g"), None);
    let mut g_cfg = BlockCfg::new(
        g_id,
        Location::make("file.c", 1),
        Location::make("file.c", 2),
    );
    let q1 = g_cfg.add_point(Location::make("file.c", 1));
    let q2 = g_cfg.add_point(Location::make("file.c", 2));
    g_cfg.set_entry_point(q1);
    g_cfg.set_exit_point(q2);
    g_cfg.add_edge(PEdge::assume(q1, q2, Exp::make_int(1), true));

    persist_bodies(&context, &[("f", vec![f_cfg]), ("g", vec![g_cfg])]);

    let mut session = analysis_prepare(context.clone()).unwrap();
    run_memory_pass(&mut session, &[]).unwrap();
    analysis_cleanup(session).unwrap();

    // the flushed callgraph has a caller edge from f onto g.
    let mut session = analysis_prepare(context.clone()).unwrap();
    let g = Variable::make_func("g");
    let callers = session.storage.get_call_edges(&g, true).unwrap();
    assert_eq!(callers.edges.len(), 1);
    assert_eq!(callers.edges[0].where_.id, f_id);
    assert_eq!(callers.edges[0].callee.name(), "g");

    let f = Variable::make_func("f");
    let callees = session.storage.get_call_edges(&f, false).unwrap();
    assert_eq!(callees.edges.len(), 1);
    assert_eq!(callees.edges[0].callee.name(), "g");
    analysis_cleanup(session).unwrap();
}

/// `while (i < n) i++;` with the loop head on line 10.
#[test]
fn test_loop_split_names_and_loop_edge() {
    let id = BlockId::make(BlockKind::FunctionWhole, Variable::make_func("f"), None);
    let mut cfg = BlockCfg::new(
        id.clone(),
        Location::make("file.c", 9),
        Location::make("file.c", 12),
    );
    let i = Exp::make_drf(Exp::make_var(Variable::make(
        Some(id.clone()),
        crate::ir::VarKind::Local,
        "i",
        None,
    )));
    let n = Exp::make_drf(Exp::make_var(Variable::make(
        Some(id),
        crate::ir::VarKind::Local,
        "n",
        None,
    )));
    let cond = Exp::make_compare(BinopKind::LessThan, i.clone(), n);

    let head = cfg.add_point(Location::make("file.c", 10));
    let body = cfg.add_point(Location::make("file.c", 10));
    let exit = cfg.add_point(Location::make("file.c", 12));
    cfg.set_entry_point(head);
    cfg.set_exit_point(exit);

    let int_type = Type::make_int(32, true);
    cfg.add_edge(PEdge::assume(head, body, cond.clone(), true));
    cfg.add_edge(PEdge::assign(
        body,
        head,
        int_type.clone(),
        Exp::make_var(Variable::make_glob("i_cell")),
        Exp::make_binop(BinopKind::Plus, i, Exp::make_int(1), 32, true),
    ));
    cfg.add_edge(PEdge::assume(head, exit, cond, false));

    let cfgs = split_loops(&cfg).unwrap();
    assert_eq!(cfgs.len(), 2);

    // the loop CFG is named after its head point and source line.
    let loop_cfg = &cfgs[0];
    assert_eq!(loop_cfg.id().kind(), BlockKind::Loop);
    assert_eq!(loop_cfg.id().loop_name().unwrap(), "loop:1:10");

    // the outer CFG's former loop body is a single Loop edge.
    let outer = &cfgs[1];
    let loop_edges: Vec<_> = outer
        .edges()
        .iter()
        .filter(|edge| edge.if_loop().is_some())
        .collect();
    assert_eq!(loop_edges.len(), 1);
    assert_eq!(loop_edges[0].if_loop().unwrap(), loop_cfg.id());
}

/// Two stub backends disagreeing on satisfiability: the MUX dumps the
/// failing backend, the check errors naming it, and the solver remains
/// usable for subsequent assertions after a clear.
#[test]
fn test_mux_disagreement_aborts_check() {
    let mux = SolverMux::new(vec![
        Box::new(FixedVerdict::new("backend_a", true)),
        Box::new(FixedVerdict::new("backend_b", false)),
    ]);
    let mut solver = Solver::new("cross_check", Box::new(mux));

    let p = Exp::make_drf(Exp::make_var(Variable::make_glob("p")));
    solver.add_assert(0, &crate::ir::Bit::make_exp(p));

    let err = solver.is_satisfiable().unwrap_err();
    match err {
        CheckerError::SolverDisagreement { backend } => assert_eq!(backend, "backend_b"),
        other => panic!("unexpected error {other:?}"),
    }

    // the worker would exit non-zero here; a fresh solver state keeps
    // subsequent assertions unaffected.
    let mut solver = crate::make_check_solver();
    solver.add_assert(0, &crate::ir::Bit::make_true());
    assert!(solver.is_satisfiable().unwrap());
}

/// Summaries survive the store and reload pointer-identical bits.
#[test]
fn test_summary_storage_roundtrip() {
    let (context, _dir) = Context::new_for_test();
    let (id, cfg) = buffer_write_body();
    persist_bodies(&context, &[("f", vec![cfg])]);
    run_passes(&context);

    let mut session = analysis_prepare(context.clone()).unwrap();
    let first = session.storage.get_block_summary(&id);

    // reload through a fresh session; interning makes the bits equal.
    analysis_cleanup(session).unwrap();
    let mut session = analysis_prepare(context.clone()).unwrap();
    let second = session.storage.get_block_summary(&id);
    assert_eq!(first.asserts().len(), second.asserts().len());
    for (a, b) in first.asserts().iter().zip(second.asserts()) {
        assert_eq!(a.bit, b.bit);
        assert_eq!(a.name, b.name);
    }
    analysis_cleanup(session).unwrap();

    // raw database bytes exist for the summary as well.
    let session = analysis_prepare(context.clone()).unwrap();
    let bytes = crate::do_lookup_transaction(&*session.backend, SUMMARY_DATABASE, "f")
        .unwrap()
        .unwrap();
    assert!(!bytes.is_empty());
    analysis_cleanup(session).unwrap();
}

/// A memory table translated across its own points agrees with the
/// summary's guard: sanity of the data flow the checker depends on.
#[test]
fn test_memory_guard_reaches_checker() {
    let (context, _dir) = Context::new_for_test();
    let (id, cfg) = buffer_write_body();
    persist_bodies(&context, &[("f", vec![cfg.clone()])]);
    run_passes(&context);

    let mut session = analysis_prepare(context.clone()).unwrap();
    let memory = session.storage.get_block_memory(&id).unwrap();
    assert!(memory.guard(1).is_true());

    let translated = memory.translate_bit(
        TranslateKind::Point,
        1,
        &crate::ir::Bit::make_true(),
    );
    assert!(translated.is_true());
    analysis_cleanup(session).unwrap();
}
