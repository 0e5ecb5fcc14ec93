// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CheckerError, CheckerResult};
use crate::serialize::{compress, decompress};
use crate::worklist::BlockState;

use super::{
    time_stamp_delta_before, Primitive, TAction, TOperand, TValue, TVar, TimeStamp,
    TimeStampGenerator, Transaction, Xdb,
};

/// Anything a worker can submit transactions to: the in-process backend
/// here, or a remote manager arbitrating several workers.
pub trait TransactionHost {
    fn submit(&self, transaction: &mut Transaction) -> CheckerResult<()>;
}

/// Hash object held by the backend between transactions: an ordered map
/// from byte keys to value lists.
pub(crate) type BackendHash = BTreeMap<Vec<u8>, Vec<Vec<u8>>>;

pub(crate) struct BackendState {
    pub(crate) path: PathBuf,
    pub(crate) databases: HashMap<String, Xdb>,
    pub(crate) hashes: HashMap<String, BackendHash>,
    /// Per-name graph sorts, one entry list per stage.
    pub(crate) sorts: HashMap<String, Vec<Vec<Vec<u8>>>>,
    pub(crate) stamps: TimeStampGenerator,
    pub(crate) block: BlockState,
}

/// The in-process backend: named databases, named hashes, graph sorts and
/// the block worklist, all mutated only under submitted transactions.
pub struct Backend {
    state: Mutex<BackendState>,
}

impl Backend {
    pub fn new(path: &Path) -> CheckerResult<Arc<Backend>> {
        fs::create_dir_all(path)?;
        Ok(Arc::new(Backend {
            state: Mutex::new(BackendState {
                path: path.to_path_buf(),
                databases: HashMap::new(),
                hashes: HashMap::new(),
                sorts: HashMap::new(),
                stamps: TimeStampGenerator::new(),
                block: BlockState::new(),
            }),
        }))
    }

    /// Flush block backend state (annotations, the worklist file) and
    /// persist every open database.
    pub fn finish(&self) -> CheckerResult<()> {
        let mut state = self.state.lock();
        state.finish_block()?;
        for xdb in state.databases.values_mut() {
            xdb.save()?;
        }
        Ok(())
    }

    /// Run a closure under the backend lock. Test and driver support for
    /// inspection that does not go through a transaction.
    pub(crate) fn with_state<R>(&self, body: impl FnOnce(&mut BackendState) -> R) -> R {
        body(&mut self.state.lock())
    }
}

impl TransactionHost for Backend {
    fn submit(&self, transaction: &mut Transaction) -> CheckerResult<()> {
        let mut state = self.state.lock();
        let stamp = state.stamps.advance();
        transaction.set_stamp(stamp);
        let actions = transaction.take_actions();
        let result = state.exec_actions(&actions, transaction);
        if let Err(err) = &result {
            tracing::error!("transaction failed: {err}");
        }
        result
    }
}

impl BackendState {
    pub(crate) fn database(&mut self, name: &str) -> CheckerResult<&mut Xdb> {
        if !self.databases.contains_key(name) {
            let xdb = Xdb::open(&self.path, name)?;
            self.databases.insert(name.to_string(), xdb);
        }
        Ok(self.databases.get_mut(name).expect("just inserted"))
    }

    pub(crate) fn hash(&mut self, name: &str) -> &mut BackendHash {
        self.hashes.entry(name.to_string()).or_default()
    }

    fn resolve(&self, operand: &TOperand, transaction: &Transaction) -> CheckerResult<TValue> {
        Ok(match operand {
            TOperand::Variable(var) => transaction
                .lookup(*var)
                .cloned()
                .ok_or_else(|| {
                    CheckerError::TransactionFailed(format!("unbound variable ${var}"))
                })?,
            TOperand::Bytes(bytes) => TValue::Bytes(bytes.clone()),
            TOperand::Integer(value) => TValue::Integer(*value),
            TOperand::Boolean(value) => TValue::Boolean(*value),
            TOperand::TimeStamp(stamp) => TValue::TimeStamp(*stamp),
            TOperand::List(items) => TValue::List(
                items
                    .iter()
                    .map(|item| self.resolve(item, transaction))
                    .collect::<CheckerResult<Vec<_>>>()?,
            ),
        })
    }

    fn exec_actions(
        &mut self,
        actions: &[TAction],
        transaction: &mut Transaction,
    ) -> CheckerResult<()> {
        for action in actions {
            self.exec_action(action, transaction)?;
        }
        Ok(())
    }

    fn exec_action(
        &mut self,
        action: &TAction,
        transaction: &mut Transaction,
    ) -> CheckerResult<()> {
        match action {
            TAction::Call {
                primitive,
                args,
                result,
            } => {
                let values = args
                    .iter()
                    .map(|arg| self.resolve(arg, transaction))
                    .collect::<CheckerResult<Vec<_>>>()?;
                let value = self.exec_call(*primitive, &values, transaction.time_stamp())?;
                if let Some(result) = result {
                    let value = value.ok_or_else(|| {
                        CheckerError::TransactionFailed(format!(
                            "{primitive:?} produced no result"
                        ))
                    })?;
                    transaction.bind(*result, value);
                }
                Ok(())
            }
            TAction::Sequence(body) => self.exec_actions(body, transaction),
            TAction::Test {
                operand,
                expect,
                body,
            } => {
                let value = self.resolve(operand, transaction)?.as_boolean()?;
                if value == *expect {
                    self.exec_actions(body, transaction)?;
                }
                Ok(())
            }
            TAction::Iterate { var, list, body } => {
                let values = self.resolve(list, transaction)?;
                for item in values.as_list()? {
                    transaction.bind(*var, item.clone());
                    self.exec_actions(body, transaction)?;
                }
                Ok(())
            }
        }
    }

    fn exec_call(
        &mut self,
        primitive: Primitive,
        args: &[TValue],
        stamp: TimeStamp,
    ) -> CheckerResult<Option<TValue>> {
        let arg = |index: usize| -> CheckerResult<&TValue> {
            args.get(index).ok_or_else(|| {
                CheckerError::TransactionFailed(format!("{primitive:?}: missing argument {index}"))
            })
        };

        match primitive {
            Primitive::XdbLookup => {
                let name = arg(0)?.as_str()?.to_string();
                let key = arg(1)?.as_bytes()?.to_vec();
                let xdb = self.database(&name)?;
                let value = xdb.lookup(&key).map(<[u8]>::to_vec).unwrap_or_default();
                Ok(Some(TValue::Bytes(value)))
            }
            Primitive::XdbReplace => {
                let name = arg(0)?.as_str()?.to_string();
                let key = arg(1)?.as_bytes()?.to_vec();
                let value = arg(2)?.as_bytes()?.to_vec();
                let xdb = self.database(&name)?;
                xdb.replace(&key, value, stamp);
                Ok(None)
            }
            Primitive::XdbClear => {
                let name = arg(0)?.as_str()?.to_string();
                self.database(&name)?.clear();
                Ok(None)
            }
            Primitive::XdbAllKeys => {
                let name = arg(0)?.as_str()?.to_string();
                let xdb = self.database(&name)?;
                let keys = xdb
                    .all_keys()
                    .map(|key| TValue::Bytes(key.to_vec()))
                    .collect();
                Ok(Some(TValue::List(keys)))
            }
            Primitive::XdbEnableTimeStamps => {
                let name = arg(0)?.as_str()?.to_string();
                self.database(&name)?.enable_timestamps();
                Ok(None)
            }
            Primitive::XdbTimeStamp => {
                let name = arg(0)?.as_str()?.to_string();
                let key = arg(1)?.as_bytes()?.to_vec();
                let stamp = self.database(&name)?.key_stamp(&key);
                Ok(Some(TValue::TimeStamp(stamp)))
            }
            Primitive::HashExists => {
                let name = arg(0)?.as_str()?;
                Ok(Some(TValue::Boolean(self.hashes.contains_key(name))))
            }
            Primitive::HashClear => {
                let name = arg(0)?.as_str()?;
                self.hash(name).clear();
                Ok(None)
            }
            Primitive::HashInsertKey => {
                let name = arg(0)?.as_str()?.to_string();
                let key = arg(1)?.as_bytes()?.to_vec();
                self.hash(&name).entry(key).or_default();
                Ok(None)
            }
            Primitive::HashInsertValue => {
                let name = arg(0)?.as_str()?.to_string();
                let key = arg(1)?.as_bytes()?.to_vec();
                let value = arg(2)?.as_bytes()?.to_vec();
                let values = self.hash(&name).entry(key).or_default();
                if !values.contains(&value) {
                    values.push(value);
                }
                Ok(None)
            }
            Primitive::HashInsertCheck => {
                let name = arg(0)?.as_str()?.to_string();
                let key = arg(1)?.as_bytes()?.to_vec();
                let value = arg(2)?.as_bytes()?.to_vec();
                let values = self.hash(&name).entry(key).or_default();
                let existed = !values.is_empty();
                if !values.contains(&value) {
                    values.push(value);
                }
                Ok(Some(TValue::Boolean(existed)))
            }
            Primitive::HashChooseKey => {
                let name = arg(0)?.as_str()?.to_string();
                let key = self
                    .hash(&name)
                    .keys()
                    .next_back()
                    .cloned()
                    .unwrap_or_default();
                Ok(Some(TValue::Bytes(key)))
            }
            Primitive::HashRemove => {
                let name = arg(0)?.as_str()?.to_string();
                let key = arg(1)?.as_bytes()?.to_vec();
                self.hash(&name).remove(&key);
                Ok(None)
            }
            Primitive::HashAllKeys => {
                let name = arg(0)?.as_str()?.to_string();
                let keys = self
                    .hash(&name)
                    .keys()
                    .map(|key| TValue::Bytes(key.clone()))
                    .collect();
                Ok(Some(TValue::List(keys)))
            }
            Primitive::HashLookup => {
                let name = arg(0)?.as_str()?.to_string();
                let key = arg(1)?.as_bytes()?.to_vec();
                let values = self
                    .hash(&name)
                    .get(&key)
                    .map(|values| {
                        values
                            .iter()
                            .map(|value| TValue::Bytes(value.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Some(TValue::List(values)))
            }
            Primitive::HashLookupSingle => {
                let name = arg(0)?.as_str()?.to_string();
                let key = arg(1)?.as_bytes()?.to_vec();
                let values = self.hash(&name).get(&key).cloned().unwrap_or_default();
                if values.len() != 1 {
                    return Err(CheckerError::TransactionFailed(format!(
                        "hash {name} has {} values for key",
                        values.len()
                    )));
                }
                Ok(Some(TValue::Bytes(values.into_iter().next().unwrap())))
            }
            Primitive::HashIsMember => {
                let name = arg(0)?.as_str()?.to_string();
                let key = arg(1)?.as_bytes()?.to_vec();
                let member = self.hash(&name).contains_key(&key);
                Ok(Some(TValue::Boolean(member)))
            }
            Primitive::HashIsEmpty => {
                let name = arg(0)?.as_str()?.to_string();
                let empty = self.hash(&name).is_empty();
                Ok(Some(TValue::Boolean(empty)))
            }
            Primitive::ListCreate => Ok(Some(TValue::List(args.to_vec()))),
            Primitive::ListPush => {
                let mut list = arg(0)?.as_list()?.to_vec();
                list.push(arg(1)?.clone());
                Ok(Some(TValue::List(list)))
            }
            Primitive::StringIsEmpty => {
                let bytes = arg(0)?.as_bytes()?;
                Ok(Some(TValue::Boolean(bytes.is_empty())))
            }
            Primitive::TimeStampLessEqual => {
                let left = arg(0)?.as_integer()?;
                let right = arg(1)?.as_integer()?;
                Ok(Some(TValue::Boolean(left <= right)))
            }
            Primitive::GraphSortHash => {
                let graph = arg(0)?.as_str()?.to_string();
                let unknown = arg(1)?.as_str()?.to_string();
                let db_name = arg(2)?.as_str()?.to_string();
                let sort = arg(3)?.as_str()?.to_string();
                let stages = arg(4)?.as_integer()? as usize;
                self.graph_sort_hash(&graph, &unknown, &db_name, &sort, stages)?;
                Ok(None)
            }
            Primitive::GraphLoadSort => {
                let sort = arg(0)?.as_str()?.to_string();
                let stages = self.graph_load_sort(&sort)?;
                Ok(Some(TValue::Integer(stages as u64)))
            }
            Primitive::GraphPopSort => {
                let sort = arg(0)?.as_str()?.to_string();
                let node = self.graph_pop_sort(&sort);
                Ok(Some(TValue::Bytes(node)))
            }
            Primitive::BlockQueryList => {
                let data = arg(0)?.as_bytes()?.to_vec();
                let result = self.block_query_list(&data)?;
                Ok(Some(TValue::Bytes(result)))
            }
            Primitive::BlockWriteList => {
                let data = arg(0)?.as_bytes()?.to_vec();
                self.block_write_list(&data, stamp)?;
                Ok(None)
            }
            Primitive::BlockQueryAnnot => {
                let db_name = arg(0)?.as_str()?.to_string();
                let var_name = arg(1)?.as_str()?.to_string();
                let annot_name = arg(2)?.as_str()?.to_string();
                let found = self.block_query_annot(&db_name, &var_name, &annot_name)?;
                Ok(Some(TValue::Boolean(found)))
            }
            Primitive::BlockWriteAnnot => {
                let data = arg(0)?.as_bytes()?.to_vec();
                self.block_write_annot(&data)?;
                Ok(None)
            }
            Primitive::BlockQueryFile => {
                let file = arg(0)?.as_str()?.to_string();
                let known = self.block_query_file(&file);
                Ok(Some(TValue::Boolean(known)))
            }
            Primitive::BlockWriteFile => {
                let file = arg(0)?.as_str()?.to_string();
                let source = arg(1)?.as_bytes()?.to_vec();
                let preproc = arg(2)?.as_bytes()?.to_vec();
                self.block_write_file(&file, &source, &preproc, stamp)?;
                Ok(None)
            }
            Primitive::BlockFlush => {
                self.block_flush()?;
                Ok(None)
            }
            Primitive::BlockLoadWorklist => {
                let stages = self.block_load_worklist()?;
                Ok(Some(TValue::Integer(stages as u64)))
            }
            Primitive::BlockSeedWorklist => {
                let functions = arg(0)?.as_list()?.to_vec();
                let names = functions
                    .iter()
                    .map(|value| value.as_str().map(str::to_string))
                    .collect::<CheckerResult<Vec<_>>>()?;
                self.block.seed_worklist(names);
                Ok(None)
            }
            Primitive::BlockCurrentStage => {
                Ok(Some(TValue::Integer(self.block.current_stage() as u64)))
            }
            Primitive::BlockPopWorklist => {
                let have_barrier = arg(0)?.as_boolean()?;
                let name = self.block_pop_worklist(have_barrier);
                Ok(Some(TValue::Bytes(name.into_bytes())))
            }
            Primitive::BlockHaveBarrierProcess => {
                Ok(Some(TValue::Boolean(self.block.barrier_process() != 0)))
            }
            Primitive::BlockHaveBarrierWrite => {
                Ok(Some(TValue::Boolean(self.block.barrier_write() != 0)))
            }
            Primitive::BlockShiftBarrierProcess => {
                self.block.shift_barrier_process()?;
                Ok(None)
            }
            Primitive::BlockDropBarrierWrite => {
                self.block.drop_barrier_write()?;
                Ok(None)
            }
        }
    }

    /// Partition the keys of `db_name` into `stage_count` stages using the
    /// edges recorded in the `graph` hash. Stage 0 holds keys with no
    /// outgoing edges; stage k holds keys whose edges all land in earlier
    /// stages; the final stage receives everything else plus the keys
    /// flagged in the `unknown` hash. Keys sort bytewise within a stage and
    /// the result is serialized to `<sort>.sort`, one node per line with a
    /// blank line between stages.
    fn graph_sort_hash(
        &mut self,
        graph: &str,
        unknown: &str,
        db_name: &str,
        sort: &str,
        stage_count: usize,
    ) -> CheckerResult<()> {
        let mut remaining: Vec<Vec<u8>> = {
            let xdb = self.database(db_name)?;
            xdb.all_keys().map(<[u8]>::to_vec).collect()
        };
        let graph_hash = self.hashes.get(graph).cloned().unwrap_or_default();
        let unknown_hash = self.hashes.get(unknown).cloned().unwrap_or_default();

        let mut stages: Vec<Vec<Vec<u8>>> = Vec::new();
        let mut members: std::collections::BTreeSet<Vec<u8>> = Default::default();

        for _ in 0..stage_count {
            let mut stage: Vec<Vec<u8>> = Vec::new();
            let mut index = 0;
            while index < remaining.len() {
                let key = &remaining[index];
                let mut missed = false;
                if let Some(edges) = graph_hash.get(key) {
                    for target in edges {
                        if !members.contains(target) {
                            missed = true;
                        }
                    }
                }
                if unknown_hash.contains_key(key) {
                    // this key and everything reaching it lands in the
                    // final stage.
                    missed = true;
                }
                if missed {
                    index += 1;
                } else {
                    stage.push(remaining.swap_remove(index));
                }
            }
            stage.sort();
            for key in &stage {
                members.insert(key.clone());
            }
            stages.push(stage);
        }

        remaining.sort();
        stages.push(remaining);

        let mut text = String::new();
        for (index, stage) in stages.iter().enumerate() {
            for key in stage {
                if let Ok(name) = std::str::from_utf8(key) {
                    text.push_str(name);
                    text.push('\n');
                } else {
                    tracing::error!("expected valid string in sort values");
                }
            }
            if index + 1 != stages.len() {
                text.push('\n');
            }
        }
        fs::write(self.path.join(format!("{sort}.sort")), text)?;

        self.sorts.insert(sort.to_string(), stages);
        Ok(())
    }

    /// Load a sort file back into memory, returning the final stage index.
    /// A missing file leaves the sort empty.
    fn graph_load_sort(&mut self, sort: &str) -> CheckerResult<usize> {
        let path = self.path.join(format!("{sort}.sort"));
        let Ok(text) = fs::read_to_string(&path) else {
            return Ok(0);
        };

        let mut stages: Vec<Vec<Vec<u8>>> = vec![Vec::new()];
        for line in text.lines() {
            if line.is_empty() {
                stages.push(Vec::new());
            } else {
                stages.last_mut().unwrap().push(line.as_bytes().to_vec());
            }
        }
        let stage_count = stages.len() - 1;
        self.sorts.insert(sort.to_string(), stages);
        Ok(stage_count)
    }

    /// Pop the maximum entry of the sort: the last entry of the last
    /// non-empty stage. Empty bytes when the sort is exhausted.
    fn graph_pop_sort(&mut self, sort: &str) -> Vec<u8> {
        let Some(stages) = self.sorts.get_mut(sort) else {
            return Vec::new();
        };
        for stage in stages.iter_mut().rev() {
            if let Some(node) = stage.pop() {
                return node;
            }
        }
        Vec::new()
    }
}

/// Compound actions composed from the transaction primitives. Each returns
/// one action that executes atomically with the rest of its transaction.
pub mod compound {
    use super::*;

    /// If the hash `hash_name` does not exist, fill it with all keys of the
    /// database `db_name`.
    pub fn hash_create_xdb_keys(
        transaction: &mut Transaction,
        hash_name: &str,
        db_name: &str,
    ) -> TAction {
        let exist_var = transaction.make_variable();
        let keys_var = transaction.make_variable();
        let key_var = transaction.make_variable();

        TAction::Sequence(vec![
            TAction::call_result(
                Primitive::HashExists,
                vec![TOperand::str(hash_name)],
                exist_var,
            ),
            TAction::Test {
                operand: TOperand::Variable(exist_var),
                expect: false,
                body: vec![
                    TAction::call(Primitive::HashClear, vec![TOperand::str(hash_name)]),
                    TAction::call_result(
                        Primitive::XdbAllKeys,
                        vec![TOperand::str(db_name)],
                        keys_var,
                    ),
                    TAction::Iterate {
                        var: key_var,
                        list: TOperand::Variable(keys_var),
                        body: vec![TAction::call(
                            Primitive::HashInsertKey,
                            vec![TOperand::str(hash_name), TOperand::Variable(key_var)],
                        )],
                    },
                ],
            },
        ])
    }

    /// Remove one key from the hash and look its value up in the database.
    pub fn hash_pop_xdb_key(
        transaction: &mut Transaction,
        hash_name: &str,
        db_name: &str,
        key_result: TVar,
        value_result: TVar,
    ) -> TAction {
        TAction::Sequence(vec![
            TAction::call_result(
                Primitive::HashChooseKey,
                vec![TOperand::str(hash_name)],
                key_result,
            ),
            TAction::call(
                Primitive::HashRemove,
                vec![TOperand::str(hash_name), TOperand::Variable(key_result)],
            ),
            TAction::call_result(
                Primitive::XdbLookup,
                vec![TOperand::str(db_name), TOperand::Variable(key_result)],
                value_result,
            ),
        ])
    }

    /// Like [`hash_pop_xdb_key`] but preferring the maximum entry of a
    /// graph sort, falling back to an arbitrary hash key when the sort is
    /// exhausted.
    pub fn hash_pop_xdb_key_with_sort(
        transaction: &mut Transaction,
        sort_name: &str,
        hash_name: &str,
        db_name: &str,
        key_result: TVar,
        value_result: TVar,
    ) -> TAction {
        let empty_var = transaction.make_variable();

        TAction::Sequence(vec![
            TAction::call_result(
                Primitive::GraphPopSort,
                vec![TOperand::str(sort_name)],
                key_result,
            ),
            TAction::call(
                Primitive::HashRemove,
                vec![TOperand::str(hash_name), TOperand::Variable(key_result)],
            ),
            TAction::call_result(
                Primitive::StringIsEmpty,
                vec![TOperand::Variable(key_result)],
                empty_var,
            ),
            TAction::Test {
                operand: TOperand::Variable(empty_var),
                expect: true,
                body: vec![
                    TAction::call_result(
                        Primitive::HashChooseKey,
                        vec![TOperand::str(hash_name)],
                        key_result,
                    ),
                    TAction::call(
                        Primitive::HashRemove,
                        vec![TOperand::str(hash_name), TOperand::Variable(key_result)],
                    ),
                ],
            },
            TAction::call_result(
                Primitive::XdbLookup,
                vec![TOperand::str(db_name), TOperand::Variable(key_result)],
                value_result,
            ),
        ])
    }

    /// Write `value` only if the key is unchanged since `rstamp`; otherwise
    /// return the current value in `new_value_result` so the caller can
    /// re-merge and retry.
    pub fn xdb_replace_conditional(
        transaction: &mut Transaction,
        db_name: &str,
        key: TOperand,
        value: TOperand,
        rstamp: TimeStamp,
        succeed: Option<TAction>,
        new_value_result: TVar,
    ) -> TAction {
        let time_var = transaction.make_variable();
        let cmp_var = transaction.make_variable();

        let mut success_body = vec![TAction::call(
            Primitive::XdbReplace,
            vec![TOperand::str(db_name), key.clone(), value],
        )];
        if let Some(action) = succeed {
            success_body.push(action);
        }

        TAction::Sequence(vec![
            TAction::call_result(
                Primitive::XdbTimeStamp,
                vec![TOperand::str(db_name), key.clone()],
                time_var,
            ),
            TAction::call_result(
                Primitive::TimeStampLessEqual,
                vec![TOperand::Variable(time_var), TOperand::TimeStamp(rstamp)],
                cmp_var,
            ),
            TAction::Test {
                operand: TOperand::Variable(cmp_var),
                expect: true,
                body: success_body,
            },
            TAction::Test {
                operand: TOperand::Variable(cmp_var),
                expect: false,
                body: vec![TAction::call_result(
                    Primitive::XdbLookup,
                    vec![TOperand::str(db_name), key],
                    new_value_result,
                )],
            },
        ])
    }

    /// Like [`xdb_replace_conditional`] but silently dropping the write on
    /// conflict. The comparison result lands in `cmp_result` so a caller
    /// can still observe whether the write happened.
    pub fn xdb_replace_try(
        transaction: &mut Transaction,
        db_name: &str,
        key: TOperand,
        value: TOperand,
        rstamp: TimeStamp,
        succeed: Option<TAction>,
        cmp_result: TVar,
    ) -> TAction {
        let time_var = transaction.make_variable();

        let mut success_body = vec![TAction::call(
            Primitive::XdbReplace,
            vec![TOperand::str(db_name), key.clone(), value],
        )];
        if let Some(action) = succeed {
            success_body.push(action);
        }

        TAction::Sequence(vec![
            TAction::call_result(
                Primitive::XdbTimeStamp,
                vec![TOperand::str(db_name), key],
                time_var,
            ),
            TAction::call_result(
                Primitive::TimeStampLessEqual,
                vec![TOperand::Variable(time_var), TOperand::TimeStamp(rstamp)],
                cmp_result,
            ),
            TAction::Test {
                operand: TOperand::Variable(cmp_result),
                expect: true,
                body: success_body,
            },
        ])
    }

    /// Look up a key while recording the reader in a dependency hash, so a
    /// later writer can reschedule everyone who read the old value.
    pub fn xdb_lookup_dependency(
        db_name: &str,
        key: TOperand,
        dep_name: &str,
        work_value: TOperand,
        value_result: TVar,
    ) -> TAction {
        TAction::Sequence(vec![
            TAction::call(
                Primitive::HashInsertValue,
                vec![TOperand::str(dep_name), key.clone(), work_value],
            ),
            TAction::call_result(
                Primitive::XdbLookup,
                vec![TOperand::str(db_name), key],
                value_result,
            ),
        ])
    }

    /// Push everyone who read `key` through the dependency hash back onto
    /// the work hash.
    pub fn update_dependency(
        transaction: &mut Transaction,
        dep_name: &str,
        key: TOperand,
        work_name: &str,
    ) -> TAction {
        let deps_var = transaction.make_variable();
        let dep_var = transaction.make_variable();

        TAction::Sequence(vec![
            TAction::call_result(
                Primitive::HashLookup,
                vec![TOperand::str(dep_name), key],
                deps_var,
            ),
            TAction::Iterate {
                var: dep_var,
                list: TOperand::Variable(deps_var),
                body: vec![TAction::call(
                    Primitive::HashInsertKey,
                    vec![TOperand::str(work_name), TOperand::Variable(dep_var)],
                )],
            },
        ])
    }

    /// Run `action` only when the hash is empty.
    pub fn hash_run_if_empty(
        transaction: &mut Transaction,
        hash_name: &str,
        action: TAction,
    ) -> TAction {
        let empty_var = transaction.make_variable();
        TAction::Sequence(vec![
            TAction::call_result(
                Primitive::HashIsEmpty,
                vec![TOperand::str(hash_name)],
                empty_var,
            ),
            TAction::Test {
                operand: TOperand::Variable(empty_var),
                expect: true,
                body: vec![action],
            },
        ])
    }

    /// Clear the database unless the named hash exists (i.e. unless a
    /// previous run already populated the worklist from it).
    pub fn xdb_clear_if_not_hash(
        transaction: &mut Transaction,
        db_name: &str,
        hash_name: &str,
    ) -> TAction {
        let exist_var = transaction.make_variable();
        TAction::Sequence(vec![
            TAction::call_result(
                Primitive::HashExists,
                vec![TOperand::str(hash_name)],
                exist_var,
            ),
            TAction::Test {
                operand: TOperand::Variable(exist_var),
                expect: false,
                body: vec![TAction::call(Primitive::XdbClear, vec![TOperand::str(db_name)])],
            },
        ])
    }

    /// The stamp `delta` seconds before `stamp`, for conditional replaces
    /// that tolerate slightly stale reads.
    pub fn stamp_before(stamp: TimeStamp, delta: u64) -> TimeStamp {
        time_stamp_delta_before(stamp, delta)
    }
}

/// Submit a one-shot lookup of `key` in `db_name`, returning the
/// decompressed value or `None` when the entry is absent.
pub fn do_lookup_transaction(
    host: &dyn TransactionHost,
    db_name: &str,
    key: &str,
) -> CheckerResult<Option<Vec<u8>>> {
    let mut transaction = Transaction::new();
    let data_var = transaction.make_variable();
    transaction.push_action(TAction::call_result(
        Primitive::XdbLookup,
        vec![TOperand::str(db_name), TOperand::str(key)],
        data_var,
    ));
    host.submit(&mut transaction)?;

    let bytes = transaction.lookup_bytes(data_var)?;
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(decompress(bytes)?))
}

/// Submit a one-shot compressed replace of `key` in `db_name`.
pub fn do_replace_transaction(
    host: &dyn TransactionHost,
    db_name: &str,
    key: &str,
    value: &[u8],
) -> CheckerResult<()> {
    let mut transaction = Transaction::new();
    transaction.push_action(TAction::call(
        Primitive::XdbReplace,
        vec![
            TOperand::str(db_name),
            TOperand::str(key),
            TOperand::Bytes(compress(value)),
        ],
    ));
    host.submit(&mut transaction)
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn test_backend() -> (Arc<Backend>, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = Backend::new(dir.path()).unwrap();
        (backend, dir)
    }

    #[test]
    fn test_lookup_replace_roundtrip() {
        let (backend, _dir) = test_backend();
        do_replace_transaction(&*backend, "test.xdb", "key", b"value").unwrap();
        let value = do_lookup_transaction(&*backend, "test.xdb", "key")
            .unwrap()
            .unwrap();
        assert_eq!(value, b"value");
        assert!(do_lookup_transaction(&*backend, "test.xdb", "missing")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_hash_create_and_pop() {
        let (backend, _dir) = test_backend();
        for key in ["a", "b", "c"] {
            do_replace_transaction(&*backend, "db.xdb", key, key.as_bytes()).unwrap();
        }

        let mut transaction = Transaction::new();
        let action = compound::hash_create_xdb_keys(&mut transaction, "work", "db.xdb");
        transaction.push_action(action);
        backend.submit(&mut transaction).unwrap();

        let mut popped = Vec::new();
        loop {
            let mut transaction = Transaction::new();
            let key_var = transaction.make_variable();
            let value_var = transaction.make_variable();
            let action = compound::hash_pop_xdb_key(
                &mut transaction,
                "work",
                "db.xdb",
                key_var,
                value_var,
            );
            transaction.push_action(action);
            backend.submit(&mut transaction).unwrap();
            let key = transaction.lookup_str(key_var).unwrap().to_string();
            if key.is_empty() {
                break;
            }
            popped.push(key);
        }
        popped.sort();
        assert_eq!(popped, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_replace_conditional_conflict() {
        let (backend, _dir) = test_backend();

        // enable stamps and write an initial value.
        let mut transaction = Transaction::new();
        transaction.push_action(TAction::call(
            Primitive::XdbEnableTimeStamps,
            vec![TOperand::str("db.xdb")],
        ));
        transaction.push_action(TAction::call(
            Primitive::XdbReplace,
            vec![
                TOperand::str("db.xdb"),
                TOperand::str("key"),
                TOperand::Bytes(b"first".to_vec()),
            ],
        ));
        backend.submit(&mut transaction).unwrap();
        let read_stamp = transaction.time_stamp();

        // a conditional replace against the read stamp succeeds.
        let mut transaction = Transaction::new();
        let new_var = transaction.make_variable();
        let action = compound::xdb_replace_conditional(
            &mut transaction,
            "db.xdb",
            TOperand::str("key"),
            TOperand::Bytes(b"second".to_vec()),
            read_stamp,
            None,
            new_var,
        );
        transaction.push_action(action);
        backend.submit(&mut transaction).unwrap();
        assert!(transaction.lookup(new_var).is_none());

        // racing with the stale stamp returns the current value instead.
        let mut transaction = Transaction::new();
        let new_var = transaction.make_variable();
        let action = compound::xdb_replace_conditional(
            &mut transaction,
            "db.xdb",
            TOperand::str("key"),
            TOperand::Bytes(b"third".to_vec()),
            read_stamp,
            None,
            new_var,
        );
        transaction.push_action(action);
        backend.submit(&mut transaction).unwrap();
        assert_eq!(transaction.lookup_bytes(new_var).unwrap(), b"second");
    }

    #[test]
    fn test_graph_sort_is_deterministic() {
        let (backend, dir) = test_backend();
        for key in ["a", "b", "c", "d"] {
            do_replace_transaction(&*backend, "graph.xdb", key, b"x").unwrap();
        }
        // edges: b -> a, c -> b; d flagged unknown.
        backend.with_state(|state| {
            state
                .hash("edges")
                .insert(b"b".to_vec(), vec![b"a".to_vec()]);
            state
                .hash("edges")
                .insert(b"c".to_vec(), vec![b"b".to_vec()]);
            state.hash("unk").insert(b"d".to_vec(), vec![]);
        });

        let run = |backend: &Backend| {
            let mut transaction = Transaction::new();
            transaction.push_action(TAction::call(
                Primitive::GraphSortHash,
                vec![
                    TOperand::str("edges"),
                    TOperand::str("unk"),
                    TOperand::str("graph.xdb"),
                    TOperand::str("topo"),
                    TOperand::Integer(3),
                ],
            ));
            backend.submit(&mut transaction).unwrap();
            std::fs::read_to_string(dir.path().join("topo.sort")).unwrap()
        };

        let first = run(&backend);
        let second = run(&backend);
        assert_eq!(first, second);
        assert_eq!(first, "a\n\nb\n\nc\n\nd\n");
    }
}
