// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! The assertion checker: discharge each `Check`-classified assertion with
//! the solver under soft and hard timeouts, and emit XML reports for the
//! assertions that could not be proved.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{CheckerError, CheckerResult};
use crate::ir::Bit;
use crate::memory::{BlockMemory, TranslateKind};
use crate::solve::{MinSatSolver, Solver};
use crate::storage::{report_database, Storage};
use crate::store::do_replace_transaction;
use crate::summary::{AssertClass, AssertKind, SummaryAssert};

/// Outcome of checking one assertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportKind {
    /// The assertion holds on every path.
    Proved,
    /// A path violating the assertion could not be ruled out.
    Report,
    /// The check hit its time limit and was abandoned.
    ReportTimeout,
}

impl ReportKind {
    pub fn name(self) -> &'static str {
        match self {
            ReportKind::Proved => "proved",
            ReportKind::Report => "report",
            ReportKind::ReportTimeout => "timeout",
        }
    }
}

/// Options shaping one checker run.
#[derive(Clone, Debug)]
pub struct CheckOptions {
    /// Assertion kind being checked.
    pub check_kind: AssertKind,
    /// Restrict checking to functions defined in this file.
    pub check_file: Option<String>,
    /// File receiving the XML report of the run.
    pub xml_out: Option<PathBuf>,
    /// Append to the XML file rather than truncating it.
    pub append: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        CheckOptions {
            check_kind: AssertKind::WriteOverflow,
            check_file: None,
            xml_out: None,
            append: false,
        }
    }
}

/// Totals of one checker run.
#[derive(Clone, Copy, Debug, Default)]
pub struct CheckStats {
    pub checked: usize,
    pub proved: usize,
    pub reported: usize,
    pub timeouts: usize,
}

/// Check one assertion: satisfiability of `guard(point) && !bit` lifted to
/// the assertion's point. The solver runs under the soft budget; the hard
/// limit is enforced around the whole assertion.
pub fn check_assert(
    solver: &mut Solver,
    memory: &BlockMemory,
    assert: &SummaryAssert,
    hard_limit: Option<std::time::Duration>,
) -> CheckerResult<ReportKind> {
    let started = Instant::now();
    solver.push_context();

    let guard = memory.guard(assert.point);
    solver.add_assert(0, &guard);

    let not_bit = Bit::make_not(assert.bit.clone());
    let translated = memory.translate_bit(TranslateKind::Point, assert.point, &not_bit);
    solver.add_assert(0, &translated);

    let verdict = solver.is_satisfiable();
    solver.pop_context();

    if let Some(limit) = hard_limit {
        if started.elapsed() > limit {
            // the wall clock is reset at each assertion; this one is
            // killed and the run continues.
            return Ok(ReportKind::ReportTimeout);
        }
    }

    match verdict {
        Ok(true) => Ok(ReportKind::Report),
        Ok(false) => Ok(ReportKind::Proved),
        Err(CheckerError::SoftTimeout) => Ok(ReportKind::ReportTimeout),
        Err(err) => Err(err),
    }
}

/// Byte-stable XML for one reported assertion: fixed element order, no
/// whitespace variance. Downstream tooling treats the bytes as canonical.
pub fn report_xml(
    function: &str,
    assert: &SummaryAssert,
    report: ReportKind,
) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "<report><name>{}</name><kind>{}</kind><function>{}</function><point>{}</point>\
         <bit>{}</bit><result>{}</result></report>\n",
        xml_escape(&assert.name),
        assert.kind.name(),
        xml_escape(function),
        assert.point,
        xml_escape(&assert.bit.to_string()),
        report.name(),
    );
    out
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Run the checker over the summaries of one function. Assertions of other
/// kinds, or already classified trivial or redundant, are skipped. Reports
/// are written into `report_<kind>.xdb` keyed by assertion name, and
/// appended to the XML output when configured.
pub fn check_function(
    storage: &mut Storage,
    solver: &mut Solver,
    function: &str,
    memories: &[Arc<BlockMemory>],
    options: &CheckOptions,
) -> CheckerResult<CheckStats> {
    let mut stats = CheckStats::default();
    let hard_limit = Some(storage.context().parameters.hard_timeout);
    solver.set_soft_timeout(Some(storage.context().parameters.soft_timeout));

    let mut xml = String::new();

    for memory in memories {
        let summary = storage.get_block_summary(memory.id());

        if let Some(check_file) = &options.check_file {
            let matches_file = memory
                .cfg()
                .is_some_and(|cfg| cfg.begin_location().file() == check_file.as_str());
            if !matches_file {
                continue;
            }
        }

        for assert in summary.asserts() {
            if assert.kind != options.check_kind || assert.cls != AssertClass::Check {
                continue;
            }

            stats.checked += 1;
            let report = check_assert(solver, memory, assert, hard_limit)?;
            storage
                .context()
                .metrics
                .checks_resolved
                .with_label_values(&[report.name()])
                .inc();

            match report {
                ReportKind::Proved => stats.proved += 1,
                ReportKind::Report | ReportKind::ReportTimeout => {
                    if report == ReportKind::ReportTimeout {
                        stats.timeouts += 1;
                    } else {
                        stats.reported += 1;
                    }
                    let payload = report_xml(function, assert, report);
                    xml.push_str(&payload);
                    do_replace_transaction(
                        &**storage.host(),
                        &report_database(assert.kind),
                        &assert.name,
                        payload.as_bytes(),
                    )?;
                }
            }
        }
    }

    if let Some(path) = &options.xml_out {
        if !xml.is_empty() {
            let mut file = OpenOptions::new()
                .create(true)
                .append(options.append)
                .truncate(!options.append)
                .write(true)
                .open(path)?;
            file.write_all(xml.as_bytes())?;
        }
    }

    Ok(stats)
}

/// A fresh solver for checking: the single in-tree backend.
pub fn make_check_solver() -> Solver {
    Solver::new("check", Box::new(MinSatSolver::new()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Context;
    use crate::ir::{
        BinopKind, BlockCfg, BlockId, BlockKind, BoundKind, Exp, Location, PEdge, Type, Variable,
    };
    use crate::memory::{AliasKind, ClobberKind, SimplifyKind};
    use crate::store::Backend;
    use crate::summary::BlockSummary;

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

    #[test]
    fn test_unprovable_write_is_reported() {
        let id = BlockId::make(BlockKind::Function, Variable::make_func("f"), None);
        let mut cfg = BlockCfg::new(
            id.clone(),
            Location::make("test.c", 1),
            Location::make("test.c", 2),
        );
        let p1 = cfg.add_point(Location::make("test.c", 1));
        let p2 = cfg.add_point(Location::make("test.c", 2));
        cfg.set_entry_point(p1);
        cfg.set_exit_point(p2);
        cfg.add_edge(PEdge::assume(p1, p2, Exp::make_int(1), true));
        let memory = memory_for(cfg);

        let p = Exp::make_drf(Exp::make_var(Variable::make_arg(id.clone(), 0, "p")));
        let n = Exp::make_drf(Exp::make_var(Variable::make_arg(id.clone(), 1, "n")));
        let mut summary = BlockSummary::new(id);
        summary.add_assert(
            AssertKind::WriteOverflow,
            AssertClass::Check,
            1,
            Bit::make_compare(
                BinopKind::LessThan,
                n,
                Exp::make_bound(BoundKind::Upper, p, Type::make_int(32, true)),
            ),
        );

        let mut solver = make_check_solver();
        let report = check_assert(&mut solver, &memory, &summary.asserts()[0], None).unwrap();
        assert_eq!(report, ReportKind::Report);
    }

    #[test]
    fn test_tautology_is_proved() {
        let id = BlockId::make(BlockKind::Function, Variable::make_func("f"), None);
        let mut cfg = BlockCfg::new(
            id.clone(),
            Location::make("test.c", 1),
            Location::make("test.c", 2),
        );
        let p1 = cfg.add_point(Location::make("test.c", 1));
        cfg.set_entry_point(p1);
        cfg.set_exit_point(p1);
        let memory = memory_for(cfg);

        let mut summary = BlockSummary::new(id);
        summary.add_assert(AssertKind::WriteDeref, AssertClass::Check, 1, Bit::make_true());

        let mut solver = make_check_solver();
        let report = check_assert(&mut solver, &memory, &summary.asserts()[0], None).unwrap();
        assert_eq!(report, ReportKind::Proved);
    }

    #[test]
    fn test_report_xml_is_stable() {
        let id = BlockId::make(BlockKind::Function, Variable::make_func("f"), None);
        let mut summary = BlockSummary::new(id);
        summary.add_assert(
            AssertKind::WriteOverflow,
            AssertClass::Check,
            2,
            Bit::make_true(),
        );

        let a = report_xml("f", &summary.asserts()[0], ReportKind::Report);
        let b = report_xml("f", &summary.asserts()[0], ReportKind::Report);
        assert_eq!(a, b);
        assert!(a.starts_with("<report><name>write_overflow$f$2$0</name>"));
        assert!(a.ends_with("</report>\n"));
    }

    #[test]
    fn test_check_function_writes_reports() {
        let (context, dir) = Context::new_for_test();
        let backend = Backend::new(dir.path()).unwrap();
        let mut storage = Storage::new(backend.clone(), context);

        let id = BlockId::make(BlockKind::Function, Variable::make_func("f"), None);
        let mut cfg = BlockCfg::new(
            id.clone(),
            Location::make("file.c", 1),
            Location::make("file.c", 2),
        );
        let p1 = cfg.add_point(Location::make("file.c", 1));
        cfg.set_entry_point(p1);
        cfg.set_exit_point(p1);
        let memory = memory_for(cfg);

        // persist a summary with one failing check.
        let p = Exp::make_drf(Exp::make_var(Variable::make_arg(id.clone(), 0, "p")));
        let n = Exp::make_drf(Exp::make_var(Variable::make_arg(id.clone(), 1, "n")));
        let mut summary = BlockSummary::new(id);
        summary.add_assert(
            AssertKind::WriteOverflow,
            AssertClass::Check,
            1,
            Bit::make_compare(
                BinopKind::LessThan,
                n,
                Exp::make_bound(BoundKind::Upper, p, Type::make_int(32, true)),
            ),
        );
        let mut buf = crate::serialize::Buffer::new();
        crate::serialize::Serial::write(&summary, &mut buf);
        do_replace_transaction(&*backend, crate::storage::SUMMARY_DATABASE, "f", buf.as_bytes())
            .unwrap();

        let xml_path = dir.path().join("out.xml");
        let options = CheckOptions {
            check_kind: AssertKind::WriteOverflow,
            check_file: None,
            xml_out: Some(xml_path.clone()),
            append: false,
        };
        let mut solver = make_check_solver();
        let stats =
            check_function(&mut storage, &mut solver, "f", &[memory], &options).unwrap();

        assert_eq!(stats.checked, 1);
        assert_eq!(stats.reported, 1);

        // the report landed in the kind database and the XML file.
        let report = do_lookup_report(&*backend);
        assert!(report.contains("<result>report</result>"));
        let xml = std::fs::read_to_string(xml_path).unwrap();
        assert!(!xml.is_empty());
    }

    fn do_lookup_report(backend: &Backend) -> String {
        let name = "write_overflow$f$1$0";
        let bytes = crate::store::do_lookup_transaction(
            backend,
            &report_database(AssertKind::WriteOverflow),
            name,
        )
        .unwrap()
        .unwrap();
        String::from_utf8(bytes).unwrap()
    }
}
