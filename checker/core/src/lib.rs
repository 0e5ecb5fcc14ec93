// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! Whole-program static assertion checker core.
//!
//! Source code arrives as a language-independent IR produced by a compiler
//! frontend, persisted in content-addressed databases. Analysis proceeds
//! in passes over a deterministic staged worklist: escape and callgraph
//! construction, per-block symbolic memory and modsets, summary inference,
//! and finally discharging the generated assertions through an SMT
//! backend.

mod cache;
mod callgraph;
mod cfg;
mod check;
mod context;
mod driver;
mod error;
mod escape;
mod filename;
mod hashcons;
mod infer;
mod ir;
mod memory;
mod metrics;
mod serialize;
mod solve;
mod storage;
mod store;
mod summary;
mod worklist;

pub use cache::{ExternalLookup, LookupCache, MergeCache};
pub use callgraph::{
    callgraph_process_cfg, callgraph_process_cfg_indirect, merge_call_set_lists, CallEdge,
    CallEdgeSet, CallgraphChanges, IndirectResolver,
};
pub use cfg::split_loops;
pub use check::{
    check_assert, check_function, make_check_solver, report_xml, CheckOptions, CheckStats,
    ReportKind,
};
pub use context::Context;
pub use driver::{
    analysis_cleanup, analysis_prepare, run_check_pass, run_infer_pass, run_memory_pass,
    AnalysisSession,
};
pub use error::{CheckerError, CheckerResult};
pub use escape::{
    escape_process_cfg, merge_access_set_lists, merge_edge_set_lists, EscapeAccess,
    EscapeAccessSet, EscapeChanges, EscapeEdge, EscapeEdgeSet, EscapeStatus, EscapeVisitor,
};
pub use filename::normalize_file;
pub use hashcons::{hash_bytes, hash_combine, refs, InternKey, Interned, Interner, LeakReport};
pub use infer::infer_summaries;
pub use ir::*;
pub use memory::{
    compute_block_modset, get_base_buffer, AliasKind, BlockMemory, BlockModset, ClobberKind,
    GuardAssign, GuardExp, ModsetEntry, ModsetKind, SimplifyKind, TranslateKind,
};
pub use serialize::{compress, decompress, tags, Buffer, Reader, Serial, Tag};
pub use solve::{
    eval_bit, eval_exp, BaseSolver, FrameId, MinSatSolver, SlvDecl, SlvExpr, Solver,
    SolverAssignment, SolverHashTable, SolverMux,
};
pub use storage::*;
pub use store::{
    compound, do_lookup_transaction, do_replace_transaction, time_seconds_to_stamp,
    time_stamp_delta_before, time_stamp_to_seconds, Backend, Primitive, TAction, TOperand, TValue,
    TVar, TimeStamp, TimeStampGenerator, Transaction, TransactionHost, Xdb,
};
pub use summary::{AssertClass, AssertKind, BlockSummary, SummaryAssert};
