// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! The block backend: ingestion of frontend writes, annotation storage,
//! and the staged worklist protocol with its process/write barrier pair.
//!
//! Whether a build is initial or incremental, the worklist file lists all
//! functions with bodies as `file$function` lines. The initial layout has
//! `#stage0` .. `#stage<N-1>` sections followed by `#final`; an incremental
//! build writes `#new` (new or changed functions) followed by `#old` (all
//! that survive).

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use crate::callgraph::{
    callgraph_process_cfg, merge_call_set_lists, CallEdgeSet, CallgraphChanges,
};
use crate::error::{CheckerError, CheckerResult};
use crate::escape::{
    merge_access_set_lists, merge_edge_set_lists, EscapeAccessSet, EscapeEdgeSet,
};
use crate::ir::{BlockCfg, BlockId, BlockKind, CompositeCsu};
use crate::serialize::{compress, decompress, tags, Buffer, Reader, Serial};
use crate::storage::{
    BODY_ANNOT_DATABASE, BODY_DATABASE, CALLEE_DATABASE, CALLER_DATABASE, CALLGRAPH_EDGES_HASH,
    CALLGRAPH_INDIRECT_HASH, COMP_ANNOT_DATABASE, COMP_DATABASE, ESCAPE_ACCESS_DATABASE,
    ESCAPE_EDGE_BACKWARD_DATABASE, ESCAPE_EDGE_FORWARD_DATABASE, INIT_ANNOT_DATABASE,
    INIT_DATABASE, PREPROC_DATABASE, SOURCE_DATABASE, WORKLIST_FILE, WORKLIST_FUNC_NEXT_HASH,
};
use crate::store::{BackendState, TimeStamp};

/// State of the block backend between transactions.
pub(crate) struct BlockState {
    /// Current stage of the worklist.
    stage: usize,
    /// Remaining functions for each loaded stage.
    stage_worklists: Vec<Vec<String>>,
    /// Active worklist for stages past the loaded ones; refilled from the
    /// `worklist_func_next` hash when a stage boundary is crossed.
    overflow: Vec<String>,
    barrier_process: usize,
    barrier_write: usize,

    /// Whether this run is incremental: decided on the first query by the
    /// presence of an existing worklist file. `None` until then.
    incremental: Option<bool>,
    /// Whether any function body has been written.
    have_body: bool,

    write_csu: BTreeSet<String>,
    write_body: BTreeSet<String>,
    write_init: BTreeSet<String>,
    write_files: BTreeSet<String>,
    /// Functions that are new or changed from a previous run. Subset of
    /// `write_body`, incremental builds only.
    body_new: BTreeSet<String>,
    /// Map from function names to the files containing them.
    body_file: BTreeMap<String, String>,
    /// Files whose preprocessed source changed since a previous run.
    file_changed: BTreeSet<String>,

    annot_func: BTreeMap<String, Vec<BlockCfg>>,
    annot_init: BTreeMap<String, Vec<BlockCfg>>,
    annot_comp: BTreeMap<String, Vec<BlockCfg>>,
}

impl BlockState {
    pub(crate) fn new() -> BlockState {
        BlockState {
            stage: 0,
            stage_worklists: Vec::new(),
            overflow: Vec::new(),
            barrier_process: 0,
            barrier_write: 0,
            incremental: None,
            have_body: false,
            write_csu: BTreeSet::new(),
            write_body: BTreeSet::new(),
            write_init: BTreeSet::new(),
            write_files: BTreeSet::new(),
            body_new: BTreeSet::new(),
            body_file: BTreeMap::new(),
            file_changed: BTreeSet::new(),
            annot_func: BTreeMap::new(),
            annot_init: BTreeMap::new(),
            annot_comp: BTreeMap::new(),
        }
    }

    pub(crate) fn seed_worklist(&mut self, functions: Vec<String>) {
        if !self.stage_worklists.is_empty() {
            // ignore duplicate loads and seeds.
            return;
        }
        self.stage_worklists.push(functions);
    }

    pub(crate) fn current_stage(&self) -> usize {
        self.stage
    }

    pub(crate) fn barrier_process(&self) -> usize {
        self.barrier_process
    }

    pub(crate) fn barrier_write(&self) -> usize {
        self.barrier_write
    }

    /// Worker finished analysis, moving its barrier from process to write.
    pub(crate) fn shift_barrier_process(&mut self) -> CheckerResult<()> {
        if self.barrier_process == 0 {
            return Err(CheckerError::TransactionFailed(
                "shift without a process barrier".to_string(),
            ));
        }
        self.barrier_process -= 1;
        self.barrier_write += 1;
        Ok(())
    }

    /// Worker's results are durable, releasing its write barrier.
    pub(crate) fn drop_barrier_write(&mut self) -> CheckerResult<()> {
        if self.barrier_write == 0 {
            return Err(CheckerError::TransactionFailed(
                "drop without a write barrier".to_string(),
            ));
        }
        self.barrier_write -= 1;
        Ok(())
    }
}

impl BackendState {
    /// Load the worklist file, returning the final stage index. Incremental
    /// worklists load only the `#new` section; `#old` functions are not
    /// reanalyzed directly.
    pub(crate) fn block_load_worklist(&mut self) -> CheckerResult<usize> {
        if !self.block.stage_worklists.is_empty() {
            // ignore duplicate loads.
            return Ok(self.block.stage_worklists.len() - 1);
        }

        let text = fs::read_to_string(self.path.join(WORKLIST_FILE)).unwrap_or_default();
        let mut incremental = false;

        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix('#') {
                if incremental {
                    debug_assert_eq!(header, "old");
                    break;
                }
                if header == "new" {
                    incremental = true;
                }
                self.block.stage_worklists.push(Vec::new());
                continue;
            }
            let function = line.split_once('$').map(|(_, f)| f).unwrap_or(line);
            match self.block.stage_worklists.last_mut() {
                Some(stage) => stage.push(function.to_string()),
                None => {
                    return Err(CheckerError::TransactionFailed(
                        "worklist entry before any stage header".to_string(),
                    ))
                }
            }
        }

        if self.block.stage_worklists.is_empty() {
            // no functions at all; make an empty stage.
            self.block.stage_worklists.push(Vec::new());
        }
        Ok(self.block.stage_worklists.len() - 1)
    }

    /// Pop the next function of the current stage, or advance the stage
    /// when it is exhausted and both barriers are clear. An empty string
    /// tells the worker to wait and retry.
    pub(crate) fn block_pop_worklist(&mut self, have_barrier_process: bool) -> String {
        let popped = {
            let block = &mut self.block;
            let worklist = if block.stage < block.stage_worklists.len() {
                &mut block.stage_worklists[block.stage]
            } else {
                &mut block.overflow
            };
            worklist.pop()
        };

        if let Some(function) = popped {
            if !have_barrier_process {
                self.block.barrier_process += 1;
            }
            return function;
        }

        if self.block.barrier_process != 0 || self.block.barrier_write != 0 {
            return String::new();
        }

        self.block.stage += 1;
        if self.block.stage >= self.block.stage_worklists.len() {
            // fixpointing after the initial pass over the callgraph: load
            // the overflow worklist from the hash of functions scheduled
            // for reanalysis.
            let functions: Vec<String> = {
                let next = self.hash(WORKLIST_FUNC_NEXT_HASH);
                let functions = next
                    .keys()
                    .filter_map(|key| std::str::from_utf8(key).ok().map(str::to_string))
                    .collect();
                next.clear();
                functions
            };
            self.block.overflow.extend(functions);
        }
        String::new()
    }

    /// Filter a list of CSU names and block ids down to the ones no worker
    /// has written yet, registering them as now pending.
    pub(crate) fn block_query_list(&mut self, data: &[u8]) -> CheckerResult<Vec<u8>> {
        if self.block.incremental.is_none() {
            // first query decides whether this build is incremental.
            let exists = self.path.join(WORKLIST_FILE).exists();
            self.block.incremental = Some(exists);
        }

        let data = decompress(data)?;
        let mut reader = Reader::new(&data);
        let mut result = Buffer::new();

        while !reader.at_end() {
            match reader.peek() {
                Some(tags::NAME) | Some(tags::CACHE_STRING) => {
                    let name = reader.get_str(tags::NAME)?;
                    if self.block.write_csu.insert(name.clone()) {
                        result.put_str(tags::NAME, &name);
                    }
                }
                Some(tags::BLOCK_ID) => {
                    let id = BlockId::read(&mut reader)?;
                    let name = id.function().to_string();
                    let fresh = match id.kind() {
                        BlockKind::FunctionWhole => self.block.write_body.insert(name),
                        BlockKind::Initializer => self.block.write_init.insert(name),
                        _ => {
                            return Err(CheckerError::TransactionFailed(format!(
                                "unexpected block id in query list: {id}"
                            )))
                        }
                    };
                    if fresh {
                        id.write(&mut result);
                    }
                }
                Some(tag) => return Err(CheckerError::Corrupt(tag)),
                None => break,
            }
        }

        if result.is_empty() {
            return Ok(Vec::new());
        }
        Ok(compress(result.as_bytes()))
    }

    /// Ingest a write list from the frontend: CSU definitions, function and
    /// initializer CFG lists, and escape/callgraph sets, all merged into
    /// their databases.
    pub(crate) fn block_write_list(&mut self, data: &[u8], stamp: TimeStamp) -> CheckerResult<()> {
        let data = decompress(data)?;
        let mut reader = Reader::new(&data);

        while !reader.at_end() {
            match reader.peek() {
                Some(tags::COMPOSITE_CSU) => {
                    let csu = CompositeCsu::read(&mut reader)?;
                    let mut buf = Buffer::new();
                    csu.write(&mut buf);
                    let value = compress(buf.as_bytes());
                    self.database(COMP_DATABASE)?
                        .replace(csu.name().as_bytes(), value, stamp);
                }
                Some(tags::UINT) => {
                    let count = reader.get_uint(tags::UINT)?;
                    let mut cfgs = Vec::new();
                    for _ in 0..count {
                        cfgs.push(BlockCfg::read(&mut reader)?);
                    }
                    self.write_function_cfgs(cfgs, stamp)?;
                }
                Some(tags::ESCAPE_EDGE_SET) => {
                    let set = EscapeEdgeSet::read(&mut reader)?;
                    self.merge_escape_edges(vec![set], stamp)?;
                }
                Some(tags::ESCAPE_ACCESS_SET) => {
                    let set = EscapeAccessSet::read(&mut reader)?;
                    self.merge_escape_accesses(vec![set], stamp)?;
                }
                Some(tags::CALL_EDGE_SET) => {
                    let set = CallEdgeSet::read(&mut reader)?;
                    self.merge_call_edges(vec![set], stamp)?;
                }
                Some(tag) => return Err(CheckerError::Corrupt(tag)),
                None => break,
            }
        }
        Ok(())
    }

    /// Write the CFG list of one function or initializer, maintaining the
    /// worklist bookkeeping and, for incremental builds, the new/changed
    /// function set.
    fn write_function_cfgs(&mut self, cfgs: Vec<BlockCfg>, stamp: TimeStamp) -> CheckerResult<()> {
        let Some(first) = cfgs.first() else {
            return Ok(());
        };
        let id = first.id().clone();
        let name = id.function().to_string();
        self.block.have_body = true;

        let db_name = match id.kind() {
            BlockKind::Function | BlockKind::Loop => BODY_DATABASE,
            BlockKind::Initializer => INIT_DATABASE,
            _ => {
                return Err(CheckerError::TransactionFailed(format!(
                    "unexpected block id in write list: {id}"
                )))
            }
        };

        if db_name == BODY_DATABASE {
            // remember the file this function was defined in.
            let filename = first.begin_location().file().to_string();
            self.block.body_file.insert(name.clone(), filename);

            if self.block.incremental == Some(true) {
                // look for an old function and check the new one for
                // isomorphism; a different number of loops is a change.
                let old = self
                    .database(BODY_DATABASE)?
                    .lookup(name.as_bytes())
                    .map(<[u8]>::to_vec);
                let changed = match old {
                    Some(bytes) => {
                        let bytes = decompress(&bytes)?;
                        let mut reader = Reader::new(&bytes);
                        let old_cfgs = BlockCfg::read_list(&mut reader)?;
                        old_cfgs.len() != cfgs.len()
                            || old_cfgs
                                .iter()
                                .zip(&cfgs)
                                .any(|(old, new)| !old.is_equivalent(new))
                    }
                    None => true,
                };
                if changed {
                    self.block.body_new.insert(name.clone());
                }
            }

            // feed the callgraph hashes used for the initial stage sort.
            let mut changes = CallgraphChanges::default();
            let mut callees = Vec::new();
            let mut indirect = false;
            for cfg in &cfgs {
                callgraph_process_cfg(cfg, &mut changes, &mut callees, &mut indirect);
            }
            let edges = self.hash(CALLGRAPH_EDGES_HASH);
            let values = edges.entry(name.clone().into_bytes()).or_default();
            for callee in callees {
                let value = callee.name().as_bytes().to_vec();
                if !values.contains(&value) {
                    values.push(value);
                }
            }
            if indirect {
                self.hash(CALLGRAPH_INDIRECT_HASH)
                    .entry(name.clone().into_bytes())
                    .or_default();
            }
        }

        let mut buf = Buffer::new();
        BlockCfg::write_list(&cfgs, &mut buf);
        let value = compress(buf.as_bytes());
        self.database(db_name)?
            .replace(name.as_bytes(), value, stamp);
        Ok(())
    }

    pub(crate) fn merge_escape_edges(
        &mut self,
        sets: Vec<EscapeEdgeSet>,
        stamp: TimeStamp,
    ) -> CheckerResult<()> {
        for set in sets {
            let db_name = if set.forward {
                ESCAPE_EDGE_FORWARD_DATABASE
            } else {
                ESCAPE_EDGE_BACKWARD_DATABASE
            };
            let key = set.source.database_key();
            let xdb = self.database(db_name)?;
            let mut persisted = match xdb.lookup(key.as_bytes()) {
                Some(bytes) => {
                    let bytes = decompress(bytes)?;
                    let mut reader = Reader::new(&bytes);
                    EscapeEdgeSet::read_list(&mut reader)?
                }
                None => Vec::new(),
            };
            merge_edge_set_lists(&mut persisted, [set]);
            let mut buf = Buffer::new();
            EscapeEdgeSet::write_list(&persisted, &mut buf);
            let value = compress(buf.as_bytes());
            self.database(db_name)?
                .replace(key.as_bytes(), value, stamp);
        }
        Ok(())
    }

    pub(crate) fn merge_escape_accesses(
        &mut self,
        sets: Vec<EscapeAccessSet>,
        stamp: TimeStamp,
    ) -> CheckerResult<()> {
        for set in sets {
            let key = set.value.database_key();
            let xdb = self.database(ESCAPE_ACCESS_DATABASE)?;
            let mut persisted = match xdb.lookup(key.as_bytes()) {
                Some(bytes) => {
                    let bytes = decompress(bytes)?;
                    let mut reader = Reader::new(&bytes);
                    EscapeAccessSet::read_list(&mut reader)?
                }
                None => Vec::new(),
            };
            merge_access_set_lists(&mut persisted, [set]);
            let mut buf = Buffer::new();
            EscapeAccessSet::write_list(&persisted, &mut buf);
            let value = compress(buf.as_bytes());
            self.database(ESCAPE_ACCESS_DATABASE)?
                .replace(key.as_bytes(), value, stamp);
        }
        Ok(())
    }

    pub(crate) fn merge_call_edges(
        &mut self,
        sets: Vec<CallEdgeSet>,
        stamp: TimeStamp,
    ) -> CheckerResult<()> {
        for set in sets {
            let db_name = if set.callers {
                CALLER_DATABASE
            } else {
                CALLEE_DATABASE
            };
            let key = set.function.name().to_string();
            let xdb = self.database(db_name)?;
            let mut persisted = match xdb.lookup(key.as_bytes()) {
                Some(bytes) => {
                    let bytes = decompress(bytes)?;
                    let mut reader = Reader::new(&bytes);
                    CallEdgeSet::read_list(&mut reader)?
                }
                None => Vec::new(),
            };
            merge_call_set_lists(&mut persisted, [set]);
            let mut buf = Buffer::new();
            CallEdgeSet::write_list(&persisted, &mut buf);
            let value = compress(buf.as_bytes());
            self.database(db_name)?
                .replace(key.as_bytes(), value, stamp);
        }
        Ok(())
    }

    pub(crate) fn block_query_annot(
        &mut self,
        db_name: &str,
        var_name: &str,
        annot_name: &str,
    ) -> CheckerResult<bool> {
        let map = match db_name {
            BODY_ANNOT_DATABASE => &self.block.annot_func,
            INIT_ANNOT_DATABASE => &self.block.annot_init,
            COMP_ANNOT_DATABASE => &self.block.annot_comp,
            _ => {
                return Err(CheckerError::TransactionFailed(format!(
                    "unknown annotation database {db_name}"
                )))
            }
        };
        Ok(map.get(var_name).is_some_and(|cfgs| {
            cfgs.iter()
                .any(|cfg| cfg.id().loop_name() == Some(annot_name))
        }))
    }

    pub(crate) fn block_write_annot(&mut self, data: &[u8]) -> CheckerResult<()> {
        let data = decompress(data)?;
        let mut reader = Reader::new(&data);
        let cfg = BlockCfg::read(&mut reader)?;
        let name = cfg.id().function().to_string();

        let map = match cfg.id().kind() {
            BlockKind::AnnotationFunc => &mut self.block.annot_func,
            BlockKind::AnnotationInit => &mut self.block.annot_init,
            BlockKind::AnnotationComp => &mut self.block.annot_comp,
            other => {
                return Err(CheckerError::TransactionFailed(format!(
                    "unexpected annotation block kind {other:?}"
                )))
            }
        };
        map.entry(name).or_default().push(cfg);
        Ok(())
    }

    /// Whether the file was already received; marks it received either way.
    pub(crate) fn block_query_file(&mut self, file: &str) -> bool {
        !self.block.write_files.insert(file.to_string())
    }

    pub(crate) fn block_write_file(
        &mut self,
        file: &str,
        source: &[u8],
        preproc: &[u8],
        stamp: TimeStamp,
    ) -> CheckerResult<()> {
        if self.block.incremental == Some(true) {
            // compare the preprocessed contents with the old data to find
            // changed files.
            let old = self
                .database(PREPROC_DATABASE)?
                .lookup(file.as_bytes())
                .map(<[u8]>::to_vec);
            let changed = match old {
                Some(bytes) => decompress(&bytes)? != preproc,
                None => true,
            };
            if changed {
                self.block.file_changed.insert(file.to_string());
            }
        }

        let source = compress(source);
        self.database(SOURCE_DATABASE)?
            .replace(file.as_bytes(), source, stamp);
        let preproc = compress(preproc);
        self.database(PREPROC_DATABASE)?
            .replace(file.as_bytes(), preproc, stamp);
        Ok(())
    }

    /// Explicit flush request. Escape and callgraph writes are merged into
    /// their databases as they arrive, so only annotations remain pending
    /// here; they flush at finish.
    pub(crate) fn block_flush(&mut self) -> CheckerResult<()> {
        Ok(())
    }

    /// Flush annotations and write the worklist file. Called once when the
    /// backend shuts down.
    pub(crate) fn finish_block(&mut self) -> CheckerResult<()> {
        let pending = [
            (
                BODY_ANNOT_DATABASE,
                std::mem::take(&mut self.block.annot_func),
            ),
            (
                INIT_ANNOT_DATABASE,
                std::mem::take(&mut self.block.annot_init),
            ),
            (
                COMP_ANNOT_DATABASE,
                std::mem::take(&mut self.block.annot_comp),
            ),
        ];
        for (db_name, map) in pending {
            for (key, cfgs) in map {
                self.write_annotations(db_name, &key, cfgs)?;
            }
        }

        if self.block.have_body {
            if self.block.incremental == Some(true) {
                self.write_worklist_incremental()?;
            } else {
                self.write_worklist_initial()?;
            }
        }
        Ok(())
    }

    fn write_annotations(
        &mut self,
        db_name: &str,
        key: &str,
        cfgs: Vec<BlockCfg>,
    ) -> CheckerResult<()> {
        if cfgs.is_empty() {
            return Ok(());
        }
        let xdb = self.database(db_name)?;
        let mut merged = match xdb.lookup(key.as_bytes()) {
            Some(bytes) => {
                let bytes = decompress(bytes)?;
                let mut reader = Reader::new(&bytes);
                BlockCfg::read_list(&mut reader)?
            }
            None => Vec::new(),
        };
        for cfg in cfgs {
            // watch for duplicate annotation CFGs.
            let duplicate = merged
                .iter()
                .any(|old| old.id() == cfg.id() && old.is_equivalent(&cfg));
            if !duplicate {
                merged.push(cfg);
            }
        }
        let mut buf = Buffer::new();
        BlockCfg::write_list(&merged, &mut buf);
        let value = compress(buf.as_bytes());
        let stamp = self.stamps.advance();
        self.database(db_name)?
            .replace(key.as_bytes(), value, stamp);
        Ok(())
    }

    /// Sort and format a function list as `file$function` lines ordered
    /// lexicographically by (file, function).
    fn worklist_lines(&self, functions: &BTreeSet<String>) -> String {
        let mut pairs: Vec<(String, &String)> = functions
            .iter()
            .map(|function| {
                let file = self
                    .block
                    .body_file
                    .get(function)
                    .cloned()
                    .unwrap_or_default();
                (file, function)
            })
            .collect();
        pairs.sort();
        pairs
            .into_iter()
            .map(|(file, function)| format!("{file}${function}\n"))
            .collect()
    }

    /// Initial build: partition the functions into stages by the callgraph,
    /// everything with indirect calls or unresolved callees landing in the
    /// final stage.
    fn write_worklist_initial(&mut self) -> CheckerResult<()> {
        let callgraph = self.hashes.get(CALLGRAPH_EDGES_HASH).cloned().unwrap_or_default();
        let indirect = self
            .hashes
            .get(CALLGRAPH_INDIRECT_HASH)
            .cloned()
            .unwrap_or_default();

        let mut remaining: Vec<String> = self.block.write_body.iter().cloned().collect();
        let mut members: BTreeSet<String> = BTreeSet::new();
        let mut out = String::new();

        for stage in 0..checker_config::CALLGRAPH_STAGES {
            let mut stage_functions: BTreeSet<String> = BTreeSet::new();
            let mut index = 0;
            while index < remaining.len() {
                let function = &remaining[index];
                // functions go in this stage if all their callees are in a
                // previously handled stage and they have no indirect
                // calls. callees we have no body for are treated as
                // handled.
                let mut missed = false;
                if let Some(callees) = callgraph.get(function.as_bytes()) {
                    for callee in callees {
                        let callee = String::from_utf8_lossy(callee).to_string();
                        if self.block.write_body.contains(&callee) && !members.contains(&callee) {
                            missed = true;
                        }
                    }
                }
                if indirect.contains_key(function.as_bytes()) {
                    // this function and anything transitively calling it
                    // ends up in the final stage.
                    missed = true;
                }

                if missed {
                    index += 1;
                } else {
                    stage_functions.insert(remaining.swap_remove(index));
                }
            }

            out.push_str(&format!("#stage{stage}\n"));
            out.push_str(&self.worklist_lines(&stage_functions));
            out.push('\n');
            members.extend(stage_functions);
        }

        out.push_str("#final\n");
        let rest: BTreeSet<String> = remaining.into_iter().collect();
        out.push_str(&self.worklist_lines(&rest));

        fs::write(self.path.join(WORKLIST_FILE), out)?;
        Ok(())
    }

    /// Incremental build: `#new` lists new/changed functions, `#old` all
    /// surviving ones. Functions in a changed file that were not seen again
    /// are treated as deleted. A function whose file was not rebuilt is
    /// assumed to still exist; this can leave ghost entries when the file
    /// itself was deleted, or when a header change altered a signature
    /// without changing the file that defines the function.
    fn write_worklist_incremental(&mut self) -> CheckerResult<()> {
        let old_text =
            fs::read_to_string(self.path.join(WORKLIST_FILE)).unwrap_or_default();

        let mut out = String::new();
        out.push_str("#new\n");
        out.push_str(&self.worklist_lines(&self.block.body_new.clone()));
        out.push('\n');

        let mut old_functions: BTreeSet<String> = BTreeSet::new();
        for line in old_text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((file, function)) = line.split_once('$') else {
                continue;
            };

            if self.block.body_new.contains(function) {
                // new/changed and already written out above.
                continue;
            }
            if self.block.write_body.contains(function) {
                // we saw the unchanged body, the function exists.
                old_functions.insert(function.to_string());
                continue;
            }
            if self.block.file_changed.contains(file) {
                // the file changed but the function was not seen again:
                // treat as deleted.
                continue;
            }
            // the body was not seen but its file was not modified either;
            // assume it still exists (the common case of a file that did
            // not need rebuilding).
            self.block
                .body_file
                .insert(function.to_string(), file.to_string());
            old_functions.insert(function.to_string());
        }

        out.push_str("#old\n");
        out.push_str(&self.worklist_lines(&old_functions));

        fs::write(self.path.join(WORKLIST_FILE), out)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::{Backend, Primitive, TAction, TOperand, Transaction, TransactionHost};
    use crate::ir::{BlockCfg, Location, Variable};
    use tempfile::TempDir;

    fn backend() -> (std::sync::Arc<Backend>, TempDir) {
        let dir = TempDir::new().unwrap();
        (Backend::new(dir.path()).unwrap(), dir)
    }

    fn write_body(backend: &Backend, function: &str, file: &str, cfgs: Vec<BlockCfg>) {
        let mut buf = Buffer::new();
        buf.put_uint(tags::UINT, cfgs.len() as u64);
        for cfg in &cfgs {
            cfg.write(&mut buf);
        }
        let data = compress(buf.as_bytes());

        let mut transaction = Transaction::new();
        transaction.push_action(TAction::call(
            Primitive::BlockWriteFile,
            vec![
                TOperand::str(file),
                TOperand::Bytes(b"source".to_vec()),
                TOperand::Bytes(format!("preproc of {function}").into_bytes()),
            ],
        ));
        transaction.push_action(TAction::call(
            Primitive::BlockWriteList,
            vec![TOperand::Bytes(data)],
        ));
        backend.submit(&mut transaction).unwrap();
    }

    fn simple_cfg(function: &str, line: u32) -> BlockCfg {
        let id = crate::ir::BlockId::make(
            crate::ir::BlockKind::Function,
            Variable::make_func(function),
            None,
        );
        let mut cfg = BlockCfg::new(
            id,
            Location::make("file.c", line),
            Location::make("file.c", line + 1),
        );
        let p1 = cfg.add_point(Location::make("file.c", line));
        let p2 = cfg.add_point(Location::make("file.c", line + 1));
        cfg.set_entry_point(p1);
        cfg.set_exit_point(p2);
        cfg.add_edge(crate::ir::PEdge::assume(
            p1,
            p2,
            crate::ir::Exp::make_int(1),
            true,
        ));
        cfg
    }

    fn query_first(backend: &Backend) {
        // register the function bodies as pending, which also decides
        // whether the build is incremental.
        let mut list = Buffer::new();
        let id = crate::ir::BlockId::make(
            crate::ir::BlockKind::FunctionWhole,
            Variable::make_func("foo"),
            None,
        );
        id.write(&mut list);
        let id = crate::ir::BlockId::make(
            crate::ir::BlockKind::FunctionWhole,
            Variable::make_func("bar"),
            None,
        );
        id.write(&mut list);

        let mut transaction = Transaction::new();
        let result = transaction.make_variable();
        transaction.push_action(TAction::call_result(
            Primitive::BlockQueryList,
            vec![TOperand::Bytes(compress(list.as_bytes()))],
            result,
        ));
        backend.submit(&mut transaction).unwrap();
    }

    #[test]
    fn test_initial_worklist_layout() {
        let (backend, dir) = backend();
        query_first(&backend);
        write_body(&backend, "foo", "file.c", vec![simple_cfg("foo", 3)]);
        write_body(&backend, "bar", "file.c", vec![simple_cfg("bar", 8)]);
        backend.finish().unwrap();

        let text = fs::read_to_string(dir.path().join(WORKLIST_FILE)).unwrap();
        assert!(text.starts_with("#stage0\n"));
        assert!(text.contains("file.c$bar\n"));
        assert!(text.contains("file.c$foo\n"));
        assert!(text.contains("#final\n"));
    }

    #[test]
    fn test_incremental_unchanged_is_empty_new() {
        let (backend, dir) = backend();
        query_first(&backend);
        write_body(&backend, "foo", "file.c", vec![simple_cfg("foo", 3)]);
        write_body(&backend, "bar", "file.c", vec![simple_cfg("bar", 8)]);
        backend.finish().unwrap();

        // rebuild with identical bodies: the #new section is empty.
        let backend = Backend::new(dir.path()).unwrap();
        query_first(&backend);
        write_body(&backend, "foo", "file.c", vec![simple_cfg("foo", 3)]);
        write_body(&backend, "bar", "file.c", vec![simple_cfg("bar", 8)]);
        backend.finish().unwrap();

        let text = fs::read_to_string(dir.path().join(WORKLIST_FILE)).unwrap();
        let new_section: Vec<&str> = text
            .lines()
            .skip(1)
            .take_while(|line| !line.is_empty())
            .collect();
        assert!(text.starts_with("#new\n"));
        assert!(new_section.is_empty());
        assert!(text.contains("#old\nfile.c$bar\nfile.c$foo\n"));
    }

    #[test]
    fn test_incremental_changed_function_is_new() {
        let (backend, dir) = backend();
        query_first(&backend);
        write_body(&backend, "foo", "file.c", vec![simple_cfg("foo", 3)]);
        write_body(&backend, "bar", "file.c", vec![simple_cfg("bar", 8)]);
        backend.finish().unwrap();

        // rebuild with foo's body changed: foo is #new, bar stays #old.
        let backend = Backend::new(dir.path()).unwrap();
        query_first(&backend);
        write_body(&backend, "foo", "file.c", vec![simple_cfg("foo", 4)]);
        write_body(&backend, "bar", "file.c", vec![simple_cfg("bar", 8)]);
        backend.finish().unwrap();

        let text = fs::read_to_string(dir.path().join(WORKLIST_FILE)).unwrap();
        assert!(text.contains("#new\nfile.c$foo\n"));
        assert!(text.contains("#old\nfile.c$bar\n"));
        assert!(!text.contains("#old\nfile.c$bar\nfile.c$foo"));
    }

    #[test]
    fn test_pop_worklist_barriers() {
        let (backend, dir) = backend();
        fs::write(
            dir.path().join(WORKLIST_FILE),
            "#stage0\nfile.c$a\nfile.c$b\n\n#stage1\nfile.c$c\n\n#final\n",
        )
        .unwrap();

        backend.with_state(|state| {
            assert_eq!(state.block_load_worklist().unwrap(), 2);

            // stage 0 pops in reverse order, taking a process barrier once.
            assert_eq!(state.block_pop_worklist(false), "b");
            assert_eq!(state.block_pop_worklist(true), "a");
            assert_eq!(state.block.barrier_process(), 1);

            // the stage cannot advance while a barrier is held.
            assert_eq!(state.block_pop_worklist(true), "");
            assert_eq!(state.block.current_stage(), 0);

            // finish processing, write out, then the stage advances.
            state.block.shift_barrier_process().unwrap();
            assert_eq!(state.block_pop_worklist(false), "");
            assert_eq!(state.block.current_stage(), 0);
            state.block.drop_barrier_write().unwrap();

            assert_eq!(state.block_pop_worklist(false), "");
            assert_eq!(state.block.current_stage(), 1);
            assert_eq!(state.block_pop_worklist(false), "c");
            state.block.shift_barrier_process().unwrap();
            state.block.drop_barrier_write().unwrap();
        });
    }

    #[test]
    fn test_overflow_stage_from_next_hash() {
        let (backend, dir) = backend();
        fs::write(dir.path().join(WORKLIST_FILE), "#stage0\nfile.c$a\n\n#final\n").unwrap();

        backend.with_state(|state| {
            state.block_load_worklist().unwrap();
            state
                .hash(WORKLIST_FUNC_NEXT_HASH)
                .insert(b"requeued".to_vec(), Vec::new());

            assert_eq!(state.block_pop_worklist(false), "a");
            state.block.shift_barrier_process().unwrap();
            state.block.drop_barrier_write().unwrap();

            // advance through the empty #final stage into the overflow.
            assert_eq!(state.block_pop_worklist(false), "");
            assert_eq!(state.block_pop_worklist(false), "");
            assert_eq!(state.block_pop_worklist(false), "requeued");
        });
    }
}
