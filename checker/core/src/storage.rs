// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! Storing and retrieving analysis data: the stable database names, the
//! hydration caches over the store, and the merge caches accumulating
//! escape and callgraph sets between flushes.

use std::sync::Arc;

use checker_config::MERGE_TRANSACTION_LIMIT;

use crate::cache::{ExternalLookup, LookupCache, MergeCache};
use crate::callgraph::{merge_call_set_lists, CallEdgeSet};
use crate::context::Context;
use crate::error::CheckerResult;
use crate::escape::{
    merge_access_set_lists, merge_edge_set_lists, EscapeAccessSet, EscapeChanges, EscapeEdge,
    EscapeEdgeSet,
};
use crate::callgraph::CallgraphChanges;
use crate::ir::{BlockCfg, BlockId, BlockKind, Trace, Variable};
use crate::memory::{BlockMemory, BlockModset};
use crate::serialize::{compress, decompress, Buffer, Reader, Serial};
use crate::store::{
    compound, do_lookup_transaction, Primitive, TAction, TOperand, Transaction, TransactionHost,
};
use crate::summary::{AssertKind, BlockSummary};

// names of the databases holding IR bodies, initializers and CSU types.
pub const BODY_DATABASE: &str = "src_body.xdb";
pub const INIT_DATABASE: &str = "src_init.xdb";
pub const COMP_DATABASE: &str = "src_comp.xdb";

// names of the databases holding annotation CFGs.
pub const BODY_ANNOT_DATABASE: &str = "annot_body.xdb";
pub const INIT_ANNOT_DATABASE: &str = "annot_init.xdb";
pub const COMP_ANNOT_DATABASE: &str = "annot_comp.xdb";

// names of the databases holding escape information, keyed by trace keys.
pub const ESCAPE_EDGE_FORWARD_DATABASE: &str = "escape_edge_forward.xdb";
pub const ESCAPE_EDGE_BACKWARD_DATABASE: &str = "escape_edge_backward.xdb";
pub const ESCAPE_ACCESS_DATABASE: &str = "escape_access.xdb";

// names of the databases holding the callers and callees of functions.
pub const CALLER_DATABASE: &str = "body_caller.xdb";
pub const CALLEE_DATABASE: &str = "body_callee.xdb";

// names of the databases holding per-function analysis artifacts. loops
// share the key of their outer function.
pub const MEMORY_DATABASE: &str = "body_memory.xdb";
pub const MODSET_DATABASE: &str = "body_modset.xdb";
pub const SUMMARY_DATABASE: &str = "body_summary.xdb";

// names of the databases holding textual sources.
pub const SOURCE_DATABASE: &str = "file_source.xdb";
pub const PREPROC_DATABASE: &str = "file_preprocess.xdb";

/// Worklist file shared between the backend and workers.
pub const WORKLIST_FILE: &str = "worklist.sort";

// hash and sort names used by the worklist protocol.
pub const WORKLIST_FUNC_HASH: &str = "worklist_func_hash";
pub const WORKLIST_GLOB_HASH: &str = "worklist_glob_hash";
pub const WORKLIST_FUNC_NEXT_HASH: &str = "worklist_func_next";
pub const CALLGRAPH_EDGES_HASH: &str = "callgraph_edges";
pub const CALLGRAPH_INDIRECT_HASH: &str = "callgraph_indirect";
pub const CALLGRAPH_SORT: &str = "callgraph_sort";
pub const MODSET_DEPENDENCY_HASH: &str = "dependency_modset";

/// Database receiving checker reports for one assertion kind.
pub fn report_database(kind: AssertKind) -> String {
    format!("report_{}.xdb", kind.name())
}

const CACHE_CAPACITY: usize = 1024;

/// The per-worker storage layer: caches hydrating IR and analysis
/// artifacts from the store, and merge caches accumulating append-only
/// sets until they flush.
pub struct Storage {
    host: Arc<dyn TransactionHost>,
    context: Context,

    cfg_cache: LookupCache<BlockId, Option<Arc<BlockCfg>>>,
    memory_cache: LookupCache<BlockId, Option<Arc<BlockMemory>>>,
    modset_cache: LookupCache<BlockId, Arc<BlockModset>>,
    summary_cache: LookupCache<BlockId, Arc<BlockSummary>>,
    annot_cache: LookupCache<(String, String), Arc<Vec<BlockCfg>>>,
    escape_forward_cache: LookupCache<String, Arc<Vec<EscapeEdgeSet>>>,
    escape_backward_cache: LookupCache<String, Arc<Vec<EscapeEdgeSet>>>,
    callee_cache: LookupCache<Variable, Option<Arc<CallEdgeSet>>>,
    caller_cache: LookupCache<Variable, Option<Arc<CallEdgeSet>>>,

    merge_escape_forward: MergeCache<String, Vec<EscapeEdgeSet>>,
    merge_escape_backward: MergeCache<String, Vec<EscapeEdgeSet>>,
    merge_escape_access: MergeCache<String, Vec<EscapeAccessSet>>,
    merge_caller: MergeCache<String, Vec<CallEdgeSet>>,
    merge_callee: MergeCache<String, Vec<CallEdgeSet>>,
}

impl Storage {
    pub fn new(host: Arc<dyn TransactionHost>, context: Context) -> Storage {
        Storage {
            host,
            context,
            cfg_cache: LookupCache::new(CACHE_CAPACITY),
            memory_cache: LookupCache::new(CACHE_CAPACITY),
            modset_cache: LookupCache::new(CACHE_CAPACITY),
            summary_cache: LookupCache::new(CACHE_CAPACITY),
            annot_cache: LookupCache::new(CACHE_CAPACITY),
            escape_forward_cache: LookupCache::new(CACHE_CAPACITY),
            escape_backward_cache: LookupCache::new(CACHE_CAPACITY),
            callee_cache: LookupCache::new(CACHE_CAPACITY),
            caller_cache: LookupCache::new(CACHE_CAPACITY),
            merge_escape_forward: MergeCache::new(),
            merge_escape_backward: MergeCache::new(),
            merge_escape_access: MergeCache::new(),
            merge_caller: MergeCache::new(),
            merge_callee: MergeCache::new(),
        }
    }

    pub fn host(&self) -> &Arc<dyn TransactionHost> {
        &self.host
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The memory cache's entries are managed explicitly by the scheduler
    /// in fixpoint mode.
    pub fn set_modset_lru_eviction(&mut self, enabled: bool) {
        self.modset_cache.set_lru_eviction(enabled);
    }

    pub fn clear_modset_cache(&mut self) {
        self.modset_cache.clear();
    }

    /// Gets the CFG for `id`, hydrating the whole function's CFG list from
    /// the store on a miss. `None` when the body is unknown.
    pub fn get_block_cfg(&mut self, id: &BlockId) -> Option<Arc<BlockCfg>> {
        let mut external = CfgLookup { host: &*self.host };
        self.cfg_cache
            .lookup(id, &mut external)
            .cloned()
            .flatten()
    }

    /// Insert hydrated CFGs directly, e.g. after the worklist fetch
    /// already returned the serialized bodies.
    pub fn add_block_cfgs(&mut self, cfgs: &[Arc<BlockCfg>]) {
        for cfg in cfgs {
            self.cfg_cache
                .insert(cfg.id().clone(), Some(cfg.clone()));
        }
    }

    pub fn get_block_memory(&mut self, id: &BlockId) -> Option<Arc<BlockMemory>> {
        let mut external = MemoryLookup { host: &*self.host };
        let memory = self.memory_cache.lookup(id, &mut external).cloned().flatten();
        memory
    }

    /// Gets the modset for `id`. Unknown and failed ids resolve to an
    /// empty modset rather than a miss.
    pub fn get_block_modset(&mut self, id: &BlockId) -> Arc<BlockModset> {
        let mut external = ModsetLookup { host: &*self.host };
        self.modset_cache
            .lookup(id, &mut external)
            .cloned()
            .unwrap_or_else(|| Arc::new(BlockModset::new(id.clone())))
    }

    pub fn add_block_modset(&mut self, id: BlockId, modset: Arc<BlockModset>) {
        self.modset_cache.insert(id, modset);
    }

    pub fn get_block_summary(&mut self, id: &BlockId) -> Arc<BlockSummary> {
        let mut external = SummaryLookup { host: &*self.host };
        self.summary_cache
            .lookup(id, &mut external)
            .cloned()
            .unwrap_or_else(|| Arc::new(BlockSummary::new(id.clone())))
    }

    /// Annotation CFGs stored for `name` in one of the annotation
    /// databases. Missing entries hydrate as an empty list.
    pub fn get_annotations(&mut self, db_name: &str, name: &str) -> Arc<Vec<BlockCfg>> {
        let key = (db_name.to_string(), name.to_string());
        let mut external = AnnotLookup { host: &*self.host };
        self.annot_cache
            .lookup(&key, &mut external)
            .cloned()
            .unwrap_or_default()
    }

    /// Record the escape output of one CFG into the merge caches.
    pub fn record_escape_changes(&mut self, changes: EscapeChanges) {
        for set in changes.forward {
            let key = set.source.database_key();
            self.merge_escape_forward
                .insert_with(key, vec![set], |pending, fresh| {
                    merge_edge_set_lists(pending, fresh)
                });
        }
        for set in changes.backward {
            let key = set.source.database_key();
            self.merge_escape_backward
                .insert_with(key, vec![set], |pending, fresh| {
                    merge_edge_set_lists(pending, fresh)
                });
        }
        for set in changes.accesses {
            let key = set.value.database_key();
            self.merge_escape_access
                .insert_with(key, vec![set], |pending, fresh| {
                    merge_access_set_lists(pending, fresh)
                });
        }
    }

    /// Record direct or indirect call edges into the merge caches.
    pub fn record_callgraph_changes(&mut self, changes: CallgraphChanges) {
        for set in changes.callers {
            let key = set.function.name().to_string();
            self.merge_caller
                .insert_with(key, vec![set], |pending, fresh| {
                    merge_call_set_lists(pending, fresh)
                });
        }
        for set in changes.callees {
            let key = set.function.name().to_string();
            self.merge_callee
                .insert_with(key, vec![set], |pending, fresh| {
                    merge_call_set_lists(pending, fresh)
                });
        }
    }

    /// The indirect call edges generated for `function` by the current
    /// worklist item, still sitting in the merge cache. Only meaningful
    /// right after the indirect callgraph pass for the function.
    pub fn get_indirect_call_edges(&mut self, function: &Variable) -> Option<CallEdgeSet> {
        let pending = self.merge_callee.get_mut(&function.name().to_string())?;
        pending
            .iter()
            .find(|set| !set.callers && set.function == *function)
            .cloned()
    }

    /// Escape edges of `trace` in one direction: the union of the
    /// persisted set and any in-memory delta, deduplicated.
    pub fn lookup_escape_edges(&mut self, trace: &Trace, forward: bool) -> Vec<EscapeEdge> {
        let key = trace.database_key();
        let db_name = if forward {
            ESCAPE_EDGE_FORWARD_DATABASE
        } else {
            ESCAPE_EDGE_BACKWARD_DATABASE
        };
        let cache = if forward {
            &mut self.escape_forward_cache
        } else {
            &mut self.escape_backward_cache
        };
        let mut external = EscapeLookup {
            host: &*self.host,
            db_name,
        };
        let persisted = cache.lookup(&key, &mut external).cloned();

        let mut merged: Vec<EscapeEdgeSet> = persisted
            .map(|sets| sets.as_ref().clone())
            .unwrap_or_default();
        let delta = if forward {
            self.merge_escape_forward.get_mut(&key)
        } else {
            self.merge_escape_backward.get_mut(&key)
        };
        if let Some(delta) = delta {
            merge_edge_set_lists(&mut merged, delta.iter().cloned());
        }

        merged
            .into_iter()
            .filter(|set| set.source == *trace && set.forward == forward)
            .flat_map(|set| set.edges)
            .collect()
    }

    /// The persisted call edge set of `function` in one direction.
    pub fn get_call_edges(&mut self, function: &Variable, callers: bool) -> Option<Arc<CallEdgeSet>> {
        let cache = if callers {
            &mut self.caller_cache
        } else {
            &mut self.callee_cache
        };
        let mut external = CallEdgeLookup {
            host: &*self.host,
            callers,
        };
        cache.lookup(function, &mut external).cloned().flatten()
    }

    /// Load the modsets of every callee of `function` into the modset
    /// cache, optionally recording a dependency so modset changes requeue
    /// this function.
    pub fn get_callee_modsets(
        &mut self,
        function: &Variable,
        cfgs: &[Arc<BlockCfg>],
        dependency_hash: Option<&str>,
    ) -> CheckerResult<()> {
        let mut callees: Vec<Variable> = Vec::new();
        for cfg in cfgs {
            for edge in cfg.edges() {
                if let Some(callee) = edge.direct_function() {
                    if !callees.contains(&callee) {
                        callees.push(callee);
                    }
                }
            }
        }
        if let Some(indirect) = self.get_indirect_call_edges(function) {
            for edge in indirect.edges {
                if !callees.contains(&edge.callee) {
                    callees.push(edge.callee);
                }
            }
        }

        for callee in callees {
            let id = BlockId::make(BlockKind::Function, callee.clone(), None);
            if self.modset_cache.is_member(&id) {
                // the modset cache is kept flushed between functions when
                // dependencies are being recorded.
                debug_assert!(dependency_hash.is_none());
                continue;
            }

            let mut transaction = Transaction::new();
            let value_var = transaction.make_variable();
            let action = match dependency_hash {
                Some(dep_name) => compound::xdb_lookup_dependency(
                    MODSET_DATABASE,
                    TOperand::str(callee.name()),
                    dep_name,
                    TOperand::str(function.name()),
                    value_var,
                ),
                None => TAction::call_result(
                    Primitive::XdbLookup,
                    vec![TOperand::str(MODSET_DATABASE), TOperand::str(callee.name())],
                    value_var,
                ),
            };
            transaction.push_action(action);
            self.host.submit(&mut transaction)?;

            let bytes = transaction.lookup_bytes(value_var)?;
            if bytes.is_empty() {
                self.modset_cache
                    .insert(id.clone(), Arc::new(BlockModset::new(id)));
                continue;
            }
            let bytes = decompress(bytes)?;
            let mut reader = Reader::new(&bytes);
            let modsets = BlockModset::read_list(&mut reader)?;
            for modset in modsets {
                self.modset_cache
                    .insert(modset.id().clone(), Arc::new(modset));
            }
            if !self.modset_cache.is_member(&id) {
                self.modset_cache
                    .insert(id.clone(), Arc::new(BlockModset::new(id)));
            }
        }
        Ok(())
    }

    /// Whether the merge caches have nothing left to flush.
    pub fn merge_caches_empty(&self) -> bool {
        self.merge_escape_forward.is_empty()
            && self.merge_escape_backward.is_empty()
            && self.merge_escape_access.is_empty()
            && self.merge_caller.is_empty()
            && self.merge_callee.is_empty()
    }

    /// Flush one bounded batch from each merge cache with the two-phase
    /// protocol: read the persisted values with timestamps enabled, merge
    /// the deltas in memory, then commit each key conditionally on its
    /// read stamp. Keys another worker raced have their deltas re-inserted
    /// for the next flush. Call repeatedly until [`Storage::merge_caches_empty`].
    pub fn flush_merge_caches(&mut self) -> CheckerResult<()> {
        let forward = self.merge_escape_forward.take_batch(MERGE_TRANSACTION_LIMIT);
        let conflicts = flush_set_batch(
            &*self.host,
            ESCAPE_EDGE_FORWARD_DATABASE,
            forward,
            merge_edge_set_lists,
        )?;
        for (key, delta) in conflicts {
            self.context.metrics.merge_flush_conflicts.inc();
            self.merge_escape_forward
                .insert_with(key, delta, |pending, fresh| {
                    merge_edge_set_lists(pending, fresh)
                });
        }

        let backward = self
            .merge_escape_backward
            .take_batch(MERGE_TRANSACTION_LIMIT);
        let conflicts = flush_set_batch(
            &*self.host,
            ESCAPE_EDGE_BACKWARD_DATABASE,
            backward,
            merge_edge_set_lists,
        )?;
        for (key, delta) in conflicts {
            self.context.metrics.merge_flush_conflicts.inc();
            self.merge_escape_backward
                .insert_with(key, delta, |pending, fresh| {
                    merge_edge_set_lists(pending, fresh)
                });
        }

        let access = self.merge_escape_access.take_batch(MERGE_TRANSACTION_LIMIT);
        let conflicts = flush_set_batch(
            &*self.host,
            ESCAPE_ACCESS_DATABASE,
            access,
            merge_access_set_lists,
        )?;
        for (key, delta) in conflicts {
            self.context.metrics.merge_flush_conflicts.inc();
            self.merge_escape_access
                .insert_with(key, delta, |pending, fresh| {
                    merge_access_set_lists(pending, fresh)
                });
        }

        let callers = self.merge_caller.take_batch(MERGE_TRANSACTION_LIMIT);
        let conflicts =
            flush_set_batch(&*self.host, CALLER_DATABASE, callers, merge_call_set_lists)?;
        for (key, delta) in conflicts {
            self.context.metrics.merge_flush_conflicts.inc();
            self.merge_caller.insert_with(key, delta, |pending, fresh| {
                merge_call_set_lists(pending, fresh)
            });
        }

        let callees = self.merge_callee.take_batch(MERGE_TRANSACTION_LIMIT);
        let conflicts =
            flush_set_batch(&*self.host, CALLEE_DATABASE, callees, merge_call_set_lists)?;
        for (key, delta) in conflicts {
            self.context.metrics.merge_flush_conflicts.inc();
            self.merge_callee.insert_with(key, delta, |pending, fresh| {
                merge_call_set_lists(pending, fresh)
            });
        }

        // flushed keys may now differ on disk; drop the stale entries.
        self.escape_forward_cache.clear();
        self.escape_backward_cache.clear();
        self.caller_cache.clear();
        self.callee_cache.clear();
        Ok(())
    }

    /// Drop every hydration cache. Run before the teardown leak scan.
    pub fn clear_caches(&mut self) {
        self.cfg_cache.clear();
        self.memory_cache.clear();
        self.modset_cache.clear();
        self.summary_cache.clear();
        self.annot_cache.clear();
        self.escape_forward_cache.clear();
        self.escape_backward_cache.clear();
        self.callee_cache.clear();
        self.caller_cache.clear();
    }
}

/// Two-phase flush of one batch keyed by database key. Returns the deltas
/// whose conditional commit was raced by another worker.
fn flush_set_batch<V: Serial + Clone>(
    host: &dyn TransactionHost,
    db_name: &str,
    batch: Vec<(String, Vec<V>)>,
    merge: impl Fn(&mut Vec<V>, Vec<V>),
) -> CheckerResult<Vec<(String, Vec<V>)>> {
    if batch.is_empty() {
        return Ok(Vec::new());
    }

    // phase 1: read the current persisted bytes with timestamps enabled.
    let mut read = Transaction::new();
    read.push_action(TAction::call(
        Primitive::XdbEnableTimeStamps,
        vec![TOperand::str(db_name)],
    ));
    let mut read_vars = Vec::new();
    for (key, _) in &batch {
        let value_var = read.make_variable();
        read.push_action(TAction::call_result(
            Primitive::XdbLookup,
            vec![TOperand::str(db_name), TOperand::str(key)],
            value_var,
        ));
        read_vars.push(value_var);
    }
    host.submit(&mut read)?;
    let read_stamp = read.time_stamp();

    // phase 2: merge the deltas into the read values and commit each key
    // conditionally on the read stamp.
    let mut write = Transaction::new();
    let mut cmp_vars = Vec::new();
    let mut merged_values = Vec::new();
    for ((key, delta), value_var) in batch.iter().zip(&read_vars) {
        let bytes = read.lookup_bytes(*value_var)?;
        let mut persisted: Vec<V> = if bytes.is_empty() {
            Vec::new()
        } else {
            let bytes = decompress(bytes)?;
            let mut reader = Reader::new(&bytes);
            V::read_list(&mut reader)?
        };
        merge(&mut persisted, delta.clone());

        let mut buf = Buffer::new();
        V::write_list(&persisted, &mut buf);
        merged_values.push(compress(buf.as_bytes()));

        let cmp_var = write.make_variable();
        let action = compound::xdb_replace_try(
            &mut write,
            db_name,
            TOperand::str(key),
            TOperand::Bytes(merged_values.last().unwrap().clone()),
            read_stamp,
            None,
            cmp_var,
        );
        write.push_action(action);
        cmp_vars.push(cmp_var);
    }
    host.submit(&mut write)?;

    let mut conflicts = Vec::new();
    for ((key, delta), cmp_var) in batch.into_iter().zip(cmp_vars) {
        if !write.lookup_boolean(cmp_var)? {
            // another worker wrote between our read and write; re-merge
            // and try again later.
            conflicts.push((key, delta));
        }
    }
    Ok(conflicts)
}

struct CfgLookup<'a> {
    host: &'a dyn TransactionHost,
}

impl ExternalLookup<BlockId, Option<Arc<BlockCfg>>> for CfgLookup<'_> {
    fn lookup_insert(
        &mut self,
        cache: &mut LookupCache<BlockId, Option<Arc<BlockCfg>>>,
        id: &BlockId,
    ) {
        let db_name = match id.kind() {
            BlockKind::Function | BlockKind::Loop => BODY_DATABASE,
            BlockKind::Initializer => INIT_DATABASE,
            _ => {
                cache.insert(id.clone(), None);
                return;
            }
        };
        let bytes = match do_lookup_transaction(self.host, db_name, id.function()) {
            Ok(Some(bytes)) => bytes,
            _ => {
                tracing::warn!("no CFG found for {id}");
                cache.insert(id.clone(), None);
                return;
            }
        };
        let mut reader = Reader::new(&bytes);
        let Ok(cfgs) = BlockCfg::read_list(&mut reader) else {
            cache.insert(id.clone(), None);
            return;
        };
        for cfg in cfgs {
            cache.insert(cfg.id().clone(), Some(Arc::new(cfg)));
        }
        if !cache.is_member(id) {
            cache.insert(id.clone(), None);
        }
    }
}

struct MemoryLookup<'a> {
    host: &'a dyn TransactionHost,
}

impl ExternalLookup<BlockId, Option<Arc<BlockMemory>>> for MemoryLookup<'_> {
    fn lookup_insert(
        &mut self,
        cache: &mut LookupCache<BlockId, Option<Arc<BlockMemory>>>,
        id: &BlockId,
    ) {
        let bytes = match do_lookup_transaction(self.host, MEMORY_DATABASE, id.function()) {
            Ok(Some(bytes)) => bytes,
            _ => {
                cache.insert(id.clone(), None);
                return;
            }
        };
        let mut reader = Reader::new(&bytes);
        let Ok(memories) = BlockMemory::read_list(&mut reader) else {
            cache.insert(id.clone(), None);
            return;
        };
        for memory in memories {
            cache.insert(memory.id().clone(), Some(Arc::new(memory)));
        }
        if !cache.is_member(id) {
            cache.insert(id.clone(), None);
        }
    }
}

struct ModsetLookup<'a> {
    host: &'a dyn TransactionHost,
}

impl ExternalLookup<BlockId, Arc<BlockModset>> for ModsetLookup<'_> {
    fn lookup_insert(&mut self, cache: &mut LookupCache<BlockId, Arc<BlockModset>>, id: &BlockId) {
        let bytes = match do_lookup_transaction(self.host, MODSET_DATABASE, id.function()) {
            Ok(Some(bytes)) => bytes,
            _ => {
                // ensure there is always a modset, even if empty.
                cache.insert(id.clone(), Arc::new(BlockModset::new(id.clone())));
                return;
            }
        };
        let mut reader = Reader::new(&bytes);
        let Ok(modsets) = BlockModset::read_list(&mut reader) else {
            cache.insert(id.clone(), Arc::new(BlockModset::new(id.clone())));
            return;
        };
        for modset in modsets {
            cache.insert(modset.id().clone(), Arc::new(modset));
        }
        if !cache.is_member(id) {
            cache.insert(id.clone(), Arc::new(BlockModset::new(id.clone())));
        }
    }
}

struct SummaryLookup<'a> {
    host: &'a dyn TransactionHost,
}

impl ExternalLookup<BlockId, Arc<BlockSummary>> for SummaryLookup<'_> {
    fn lookup_insert(
        &mut self,
        cache: &mut LookupCache<BlockId, Arc<BlockSummary>>,
        id: &BlockId,
    ) {
        let bytes = match do_lookup_transaction(self.host, SUMMARY_DATABASE, id.function()) {
            Ok(Some(bytes)) => bytes,
            _ => {
                cache.insert(id.clone(), Arc::new(BlockSummary::new(id.clone())));
                return;
            }
        };
        let mut reader = Reader::new(&bytes);
        let Ok(summaries) = BlockSummary::read_list(&mut reader) else {
            cache.insert(id.clone(), Arc::new(BlockSummary::new(id.clone())));
            return;
        };
        for summary in summaries {
            cache.insert(summary.id().clone(), Arc::new(summary));
        }
        if !cache.is_member(id) {
            cache.insert(id.clone(), Arc::new(BlockSummary::new(id.clone())));
        }
    }
}

struct AnnotLookup<'a> {
    host: &'a dyn TransactionHost,
}

impl ExternalLookup<(String, String), Arc<Vec<BlockCfg>>> for AnnotLookup<'_> {
    fn lookup_insert(
        &mut self,
        cache: &mut LookupCache<(String, String), Arc<Vec<BlockCfg>>>,
        key: &(String, String),
    ) {
        let (db_name, name) = key;
        let cfgs = match do_lookup_transaction(self.host, db_name, name) {
            Ok(Some(bytes)) => {
                let mut reader = Reader::new(&bytes);
                BlockCfg::read_list(&mut reader).unwrap_or_default()
            }
            _ => Vec::new(),
        };
        cache.insert(key.clone(), Arc::new(cfgs));
    }
}

struct EscapeLookup<'a> {
    host: &'a dyn TransactionHost,
    db_name: &'static str,
}

impl ExternalLookup<String, Arc<Vec<EscapeEdgeSet>>> for EscapeLookup<'_> {
    fn lookup_insert(
        &mut self,
        cache: &mut LookupCache<String, Arc<Vec<EscapeEdgeSet>>>,
        key: &String,
    ) {
        let sets = match do_lookup_transaction(self.host, self.db_name, key) {
            Ok(Some(bytes)) => {
                let mut reader = Reader::new(&bytes);
                EscapeEdgeSet::read_list(&mut reader).unwrap_or_default()
            }
            _ => Vec::new(),
        };
        cache.insert(key.clone(), Arc::new(sets));
    }
}

struct CallEdgeLookup<'a> {
    host: &'a dyn TransactionHost,
    callers: bool,
}

impl ExternalLookup<Variable, Option<Arc<CallEdgeSet>>> for CallEdgeLookup<'_> {
    fn lookup_insert(
        &mut self,
        cache: &mut LookupCache<Variable, Option<Arc<CallEdgeSet>>>,
        function: &Variable,
    ) {
        let db_name = if self.callers {
            CALLER_DATABASE
        } else {
            CALLEE_DATABASE
        };
        let entry = match do_lookup_transaction(self.host, db_name, function.name()) {
            Ok(Some(bytes)) => {
                let mut reader = Reader::new(&bytes);
                CallEdgeSet::read_list(&mut reader)
                    .unwrap_or_default()
                    .into_iter()
                    .find(|set| set.function == *function && set.callers == self.callers)
                    .map(Arc::new)
            }
            _ => None,
        };
        cache.insert(function.clone(), entry);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Context;
    use crate::escape::escape_process_cfg;
    use crate::ir::{Exp, Location, PEdge, Type, Variable};
    use crate::store::Backend;
    use tempfile::TempDir;

    fn storage() -> (Storage, TempDir) {
        let (context, dir) = Context::new_for_test();
        let backend = Backend::new(dir.path()).unwrap();
        (Storage::new(backend, context), dir)
    }

    fn assign_cfg(function: &str) -> BlockCfg {
        let id = BlockId::make(BlockKind::Function, Variable::make_func(function), None);
        let mut cfg = BlockCfg::new(
            id,
            Location::make("test.c", 1),
            Location::make("test.c", 3),
        );
        let p1 = cfg.add_point(Location::make("test.c", 1));
        let p2 = cfg.add_point(Location::make("test.c", 2));
        cfg.set_entry_point(p1);
        cfg.set_exit_point(p2);
        cfg.add_edge(PEdge::assign(
            p1,
            p2,
            Type::make_pointer(Type::make_void(), 8),
            Exp::make_var(Variable::make_glob("fp")),
            Exp::make_var(Variable::make_func("g")),
        ));
        cfg
    }

    #[test]
    fn test_merge_read_sees_pending_delta() {
        let (mut storage, _dir) = storage();
        let cfg = assign_cfg("f");
        let changes = escape_process_cfg(&cfg);
        let source = changes.backward[0].source.clone();

        storage.record_escape_changes(changes);
        // before any flush the merge-read union already sees the edge.
        let edges = storage.lookup_escape_edges(&source, false);
        assert_eq!(edges.len(), 1);

        // after flushing, the same edges come from the store.
        while !storage.merge_caches_empty() {
            storage.flush_merge_caches().unwrap();
        }
        let edges = storage.lookup_escape_edges(&source, false);
        assert_eq!(edges.len(), 1);
    }

    #[test]
    fn test_flush_order_is_immaterial() {
        // two disjoint deltas flushed in either order produce the same
        // on-disk set.
        let run = |first: &str, second: &str| -> Vec<u8> {
            let (mut storage, dir) = storage();
            for function in [first, second] {
                let changes = escape_process_cfg(&assign_cfg(function));
                storage.record_escape_changes(changes);
                storage.flush_merge_caches().unwrap();
            }
            let bytes =
                do_lookup_transaction(&**storage.host(), ESCAPE_EDGE_FORWARD_DATABASE, "glob:g")
                    .unwrap()
                    .unwrap_or_default();
            drop(dir);
            bytes
        };
        assert_eq!(run("f", "h"), run("h", "f"));
    }

    #[test]
    fn test_modset_default_is_empty() {
        let (mut storage, _dir) = storage();
        let id = BlockId::make(BlockKind::Function, Variable::make_func("nobody"), None);
        let modset = storage.get_block_modset(&id);
        assert!(modset.is_empty());
        assert_eq!(modset.id(), &id);
    }
}
