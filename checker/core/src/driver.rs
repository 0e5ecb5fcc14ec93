// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! Pass drivers: the analysis lifecycle and the worklist-driven loops the
//! CLI wrappers call for the memory, inference and checking passes.

use std::sync::Arc;
use std::time::Instant;

use crate::callgraph::{
    callgraph_process_cfg, callgraph_process_cfg_indirect, CallgraphChanges, IndirectResolver,
};
use crate::check::{check_function, make_check_solver, CheckOptions, CheckStats};
use crate::context::Context;
use crate::error::CheckerResult;
use crate::escape::escape_process_cfg;
use crate::hashcons::refs;
use crate::infer::infer_summaries;
use crate::ir::{BlockCfg, BlockId, BlockKind, Variable};
use crate::memory::{
    compute_block_modset, AliasKind, BlockMemory, ClobberKind, SimplifyKind,
};
use crate::serialize::{compress, decompress, Buffer, Reader, Serial};
use crate::storage::{
    Storage, BODY_DATABASE, INIT_DATABASE, MEMORY_DATABASE, MODSET_DATABASE,
    MODSET_DEPENDENCY_HASH, SUMMARY_DATABASE, WORKLIST_FUNC_HASH, WORKLIST_GLOB_HASH,
};
use crate::store::{
    compound, Backend, Primitive, TAction, TOperand, Transaction, TransactionHost,
};
use crate::summary::BlockSummary;

/// One worker's analysis session: the backend, storage layer and
/// configuration, with an explicit prepare/cleanup lifecycle.
pub struct AnalysisSession {
    pub context: Context,
    pub backend: Arc<Backend>,
    pub storage: Storage,
}

/// Start an analysis worker: open the backend under the configured
/// database path and arm the reference-stamp breakpoint.
pub fn analysis_prepare(context: Context) -> CheckerResult<AnalysisSession> {
    let path = context
        .parameters
        .db_path
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    let backend = Backend::new(&path)?;
    refs::set_breakpoint(context.parameters.reference_breakpoint());
    let storage = Storage::new(backend.clone(), context.clone());
    Ok(AnalysisSession {
        context,
        backend,
        storage,
    })
}

/// Finish an analysis worker: drain the merge caches, submit the final
/// backend flush, drop the caches and scan the interning tables for
/// leaked nodes. Eviction is disabled during the scan so it iterates a
/// stable table.
pub fn analysis_cleanup(mut session: AnalysisSession) -> CheckerResult<()> {
    while !session.storage.merge_caches_empty() {
        session.storage.flush_merge_caches()?;
    }
    session.backend.finish()?;
    session.storage.clear_caches();

    let live = crate::ir::scan_ir_leaks();
    if live != 0 {
        tracing::warn!("{live} IR nodes still live after cache teardown");
    }
    Ok(())
}

fn make_init_transaction(transaction: &mut Transaction, functions: &[&str]) {
    if functions.is_empty() {
        // clear the output databases when processing everything.
        let action =
            compound::xdb_clear_if_not_hash(transaction, MEMORY_DATABASE, WORKLIST_FUNC_HASH);
        transaction.push_action(action);
        let action =
            compound::xdb_clear_if_not_hash(transaction, MODSET_DATABASE, WORKLIST_FUNC_HASH);
        transaction.push_action(action);

        let action = compound::hash_create_xdb_keys(transaction, WORKLIST_FUNC_HASH, BODY_DATABASE);
        transaction.push_action(action);
        let action = compound::hash_create_xdb_keys(transaction, WORKLIST_GLOB_HASH, INIT_DATABASE);
        transaction.push_action(action);
    } else {
        for function in functions {
            transaction.push_action(TAction::call(
                Primitive::HashInsertKey,
                vec![TOperand::str(WORKLIST_FUNC_HASH), TOperand::str(function)],
            ));
        }
    }
}

struct FetchResult {
    key: String,
    cfgs: Vec<Arc<BlockCfg>>,
    is_function: bool,
    old_modset_data: Vec<u8>,
}

/// Pop the next function (or, once functions are exhausted, initializer)
/// from the worklist hashes and fetch its CFGs and previous modset data.
fn fetch_next(session: &mut AnalysisSession) -> CheckerResult<Option<FetchResult>> {
    let mut transaction = Transaction::new();
    let body_key = transaction.make_variable();
    let body_data = transaction.make_variable();
    let glob_key = transaction.make_variable();
    let glob_data = transaction.make_variable();
    let modset_data = transaction.make_variable();

    let pop_glob = compound::hash_pop_xdb_key(
        &mut transaction,
        WORKLIST_GLOB_HASH,
        INIT_DATABASE,
        glob_key,
        glob_data,
    );
    let action = compound::hash_run_if_empty(&mut transaction, WORKLIST_FUNC_HASH, pop_glob);
    transaction.push_action(action);

    let action = compound::hash_pop_xdb_key(
        &mut transaction,
        WORKLIST_FUNC_HASH,
        BODY_DATABASE,
        body_key,
        body_data,
    );
    transaction.push_action(action);

    transaction.push_action(TAction::call_result(
        Primitive::XdbLookup,
        vec![TOperand::str(MODSET_DATABASE), TOperand::Variable(body_key)],
        modset_data,
    ));

    session.backend.submit(&mut transaction)?;

    let (key, data, is_function) = {
        let body_key_value = transaction.lookup_str(body_key)?;
        if !body_key_value.is_empty() {
            (
                body_key_value.to_string(),
                transaction.lookup_bytes(body_data)?.to_vec(),
                true,
            )
        } else {
            let glob_key_value = transaction.lookup_str(glob_key).unwrap_or_default();
            if glob_key_value.is_empty() {
                return Ok(None);
            }
            (
                glob_key_value.to_string(),
                transaction.lookup_bytes(glob_data)?.to_vec(),
                false,
            )
        }
    };
    let old_modset_data = transaction.lookup_bytes(modset_data)?.to_vec();

    if data.is_empty() {
        return Ok(Some(FetchResult {
            key,
            cfgs: Vec::new(),
            is_function,
            old_modset_data,
        }));
    }

    let bytes = decompress(&data)?;
    let mut reader = Reader::new(&bytes);
    let cfgs = BlockCfg::read_list(&mut reader)?
        .into_iter()
        .map(Arc::new)
        .collect();
    Ok(Some(FetchResult {
        key,
        cfgs,
        is_function,
        old_modset_data,
    }))
}

/// Run the memory/modset pass: for each function on the worklist, build
/// escape and callgraph information, compute the memory tables and modset
/// of every block, and write the results back. With fixpointing enabled,
/// callers of functions whose modset changed are requeued through the
/// modset dependency hash.
pub fn run_memory_pass(session: &mut AnalysisSession, functions: &[&str]) -> CheckerResult<()> {
    let mut transaction = Transaction::new();
    make_init_transaction(&mut transaction, functions);
    session.backend.submit(&mut transaction)?;

    let do_fixpoint = session.context.parameters.do_fixpoint;
    let skip_indirect = session.context.parameters.skip_indirect;
    let dependency_hash = do_fixpoint.then_some(MODSET_DEPENDENCY_HASH);

    // the scheduler manages modset cache entries itself in fixpoint mode.
    session.storage.set_modset_lru_eviction(!do_fixpoint);

    while let Some(fetch) = fetch_next(session)? {
        if fetch.cfgs.is_empty() {
            continue;
        }
        tracing::info!("generating memory for '{}'", fetch.key);
        session.storage.add_block_cfgs(&fetch.cfgs);

        let soft_timeout = session.context.parameters.soft_timeout;
        let started = Instant::now();

        if fetch.is_function {
            let function = fetch.cfgs[0].id().base_var().clone();

            // escape and direct callgraph information for all blocks.
            let mut changes = CallgraphChanges::default();
            let mut callees: Vec<Variable> = Vec::new();
            let mut indirect = false;
            for cfg in &fetch.cfgs {
                session
                    .storage
                    .record_escape_changes(escape_process_cfg(cfg));
                callgraph_process_cfg(cfg, &mut changes, &mut callees, &mut indirect);
            }

            if indirect && !skip_indirect {
                // resolve indirect calls through the escape graph; this
                // fills the merge cache so callee modsets include the
                // indirect targets. callee CFGs for the argument-count
                // check hydrate straight from the store, keeping the
                // storage borrow on the edge lookup alone.
                let host = session.storage.host().clone();
                let mut cfg_lookup = move |id: &BlockId| -> Option<Arc<BlockCfg>> {
                    let bytes =
                        crate::store::do_lookup_transaction(&*host, BODY_DATABASE, id.function())
                            .ok()??;
                    let mut reader = Reader::new(&bytes);
                    let cfgs = BlockCfg::read_list(&mut reader).ok()?;
                    cfgs.into_iter().find(|cfg| cfg.id() == id).map(Arc::new)
                };

                let storage = &mut session.storage;
                let mut edge_lookup = |trace: &crate::ir::Trace, forward: bool| {
                    storage.lookup_escape_edges(trace, forward)
                };
                for cfg in &fetch.cfgs {
                    let mut resolver = IndirectResolver {
                        edge_lookup: &mut edge_lookup,
                        cfg_lookup: &mut cfg_lookup,
                    };
                    callgraph_process_cfg_indirect(cfg, &mut changes, &mut callees, &mut resolver);
                }
            }
            session.storage.record_callgraph_changes(changes);

            if dependency_hash.is_some() {
                // modsets must be re-read so dependencies are recorded.
                session.storage.clear_modset_cache();
            }
            session
                .storage
                .get_callee_modsets(&function, &fetch.cfgs, dependency_hash)?;
        }

        let mut block_memories: Vec<Arc<BlockMemory>> = Vec::new();
        let mut block_modsets = Vec::new();
        let mut had_timeout = false;

        // innermost loops come first in the CFG list; their modsets land
        // in the cache before the outer blocks consult them.
        for cfg in &fetch.cfgs {
            let mut memory = BlockMemory::new(
                cfg.id().clone(),
                SimplifyKind::Scalar,
                AliasKind::Buffer,
                ClobberKind::Modset,
            );
            memory.set_cfg(cfg.clone());
            {
                let storage = &mut session.storage;
                memory.compute_tables(&mut |id: &BlockId| Some(storage.get_block_modset(id)))?;
            }

            if fetch.is_function {
                let modset = compute_block_modset(cfg.id(), &memory)?;
                session
                    .storage
                    .add_block_modset(cfg.id().clone(), modset.clone());
                block_modsets.push(modset);
            }

            session
                .context
                .metrics
                .blocks_analyzed
                .with_label_values(&[match cfg.id().kind() {
                    BlockKind::Loop => "loop",
                    BlockKind::Initializer => "initializer",
                    _ => "function",
                }])
                .inc();
            block_memories.push(Arc::new(memory));

            if started.elapsed() > soft_timeout {
                tracing::error!("timeout while generating memory for '{}'", fetch.key);
                had_timeout = true;
                break;
            }
        }

        // skip the write when a timeout left the data incomplete.
        if had_timeout {
            continue;
        }

        let mut update = Transaction::new();
        let mut buf = Buffer::new();
        for memory in &block_memories {
            memory.write(&mut buf);
        }
        update.push_action(TAction::call(
            Primitive::XdbReplace,
            vec![
                TOperand::str(MEMORY_DATABASE),
                TOperand::str(&fetch.key),
                TOperand::Bytes(compress(buf.as_bytes())),
            ],
        ));

        if !block_modsets.is_empty() {
            let mut buf = Buffer::new();
            for modset in &block_modsets {
                modset.as_ref().write(&mut buf);
            }
            let new_modset_data = compress(buf.as_bytes());

            let modset_changed = fetch.old_modset_data != new_modset_data;
            if modset_changed && do_fixpoint {
                let action = compound::update_dependency(
                    &mut update,
                    MODSET_DEPENDENCY_HASH,
                    TOperand::str(&fetch.key),
                    WORKLIST_FUNC_HASH,
                );
                update.push_action(action);
            }
            update.push_action(TAction::call(
                Primitive::XdbReplace,
                vec![
                    TOperand::str(MODSET_DATABASE),
                    TOperand::str(&fetch.key),
                    TOperand::Bytes(new_modset_data),
                ],
            ));
        }
        session.backend.submit(&mut update)?;
    }

    // flush the escape and callgraph caches.
    while !session.storage.merge_caches_empty() {
        session.storage.flush_merge_caches()?;
    }
    Ok(())
}

/// Hydrate the memory tables of the given blocks and attach their CFGs.
fn load_function_memories(
    storage: &mut Storage,
    cfgs: &[Arc<BlockCfg>],
) -> Vec<Arc<BlockMemory>> {
    let mut memories = Vec::new();
    for cfg in cfgs {
        let Some(memory) = storage.get_block_memory(cfg.id()) else {
            tracing::warn!("no memory found for {}", cfg.id());
            continue;
        };
        let mut memory = memory.as_ref().clone();
        memory.set_cfg(cfg.clone());
        memories.push(Arc::new(memory));
    }
    memories
}

/// Run summary inference over the worklist: generate and persist the
/// assertion summaries of each function from its stored memory tables.
pub fn run_infer_pass(session: &mut AnalysisSession, functions: &[&str]) -> CheckerResult<()> {
    let mut transaction = Transaction::new();
    if functions.is_empty() {
        let action = compound::hash_create_xdb_keys(&mut transaction, WORKLIST_FUNC_HASH, BODY_DATABASE);
        transaction.push_action(action);
    } else {
        make_init_transaction(&mut transaction, functions);
    }
    session.backend.submit(&mut transaction)?;

    while let Some(fetch) = fetch_next(session)? {
        if fetch.cfgs.is_empty() {
            continue;
        }
        tracing::info!("inferring summaries for '{}'", fetch.key);
        session.storage.add_block_cfgs(&fetch.cfgs);

        let function = fetch.cfgs[0].id().base_var().clone();
        let memories = load_function_memories(&mut session.storage, &fetch.cfgs);
        let summaries = infer_summaries(&mut session.storage, &function, &memories)?;

        let mut buf = Buffer::new();
        BlockSummary::write_list(&summaries, &mut buf);
        let mut update = Transaction::new();
        update.push_action(TAction::call(
            Primitive::XdbReplace,
            vec![
                TOperand::str(SUMMARY_DATABASE),
                TOperand::str(&fetch.key),
                TOperand::Bytes(compress(buf.as_bytes())),
            ],
        ));
        session.backend.submit(&mut update)?;
    }
    Ok(())
}

/// Run the checker over the worklist, returning accumulated statistics.
pub fn run_check_pass(
    session: &mut AnalysisSession,
    functions: &[&str],
    options: &CheckOptions,
) -> CheckerResult<CheckStats> {
    let mut transaction = Transaction::new();
    if functions.is_empty() {
        let action = compound::hash_create_xdb_keys(&mut transaction, WORKLIST_FUNC_HASH, BODY_DATABASE);
        transaction.push_action(action);
    } else {
        make_init_transaction(&mut transaction, functions);
    }
    session.backend.submit(&mut transaction)?;

    let mut solver = make_check_solver();
    let mut totals = CheckStats::default();

    while let Some(fetch) = fetch_next(session)? {
        if fetch.cfgs.is_empty() {
            continue;
        }
        session.storage.add_block_cfgs(&fetch.cfgs);
        let memories = load_function_memories(&mut session.storage, &fetch.cfgs);

        let stats = check_function(
            &mut session.storage,
            &mut solver,
            &fetch.key,
            &memories,
            options,
        )?;
        totals.checked += stats.checked;
        totals.proved += stats.proved;
        totals.reported += stats.reported;
        totals.timeouts += stats.timeouts;

        solver.clear();
    }

    tracing::info!(
        "checked {} asserts: {} proved, {} reported, {} timeouts",
        totals.checked,
        totals.proved,
        totals.reported,
        totals.timeouts
    );
    Ok(totals)
}
