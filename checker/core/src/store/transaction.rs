// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! The transaction IR: a small program with variables, conditionals,
//! iteration and primitive calls, submitted as one atomic unit against a
//! backend. Workers never mutate the store directly; everything goes
//! through a transaction so the protocol survives concurrent workers and
//! restarts.

use std::collections::HashMap;

use crate::error::{CheckerError, CheckerResult};

use super::TimeStamp;

pub type TVar = usize;

/// Primitive operations the backend dispatches by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Primitive {
    XdbLookup,
    XdbReplace,
    XdbClear,
    XdbAllKeys,
    XdbEnableTimeStamps,
    XdbTimeStamp,
    HashExists,
    HashClear,
    HashInsertKey,
    HashInsertValue,
    HashInsertCheck,
    HashChooseKey,
    HashRemove,
    HashAllKeys,
    HashLookup,
    HashLookupSingle,
    HashIsMember,
    HashIsEmpty,
    ListCreate,
    ListPush,
    StringIsEmpty,
    TimeStampLessEqual,
    GraphSortHash,
    GraphLoadSort,
    GraphPopSort,
    BlockQueryList,
    BlockWriteList,
    BlockQueryAnnot,
    BlockWriteAnnot,
    BlockQueryFile,
    BlockWriteFile,
    BlockFlush,
    BlockLoadWorklist,
    BlockSeedWorklist,
    BlockCurrentStage,
    BlockPopWorklist,
    BlockHaveBarrierProcess,
    BlockHaveBarrierWrite,
    BlockShiftBarrierProcess,
    BlockDropBarrierWrite,
}

/// Operand of a transaction action: either a constant or a variable
/// resolved while the transaction executes.
#[derive(Clone, Debug)]
pub enum TOperand {
    Variable(TVar),
    Bytes(Vec<u8>),
    Integer(u64),
    Boolean(bool),
    TimeStamp(TimeStamp),
    List(Vec<TOperand>),
}

impl TOperand {
    pub fn str(value: &str) -> TOperand {
        TOperand::Bytes(value.as_bytes().to_vec())
    }
}

/// Runtime value of an executed operand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TValue {
    Bytes(Vec<u8>),
    Integer(u64),
    Boolean(bool),
    TimeStamp(TimeStamp),
    List(Vec<TValue>),
}

impl TValue {
    pub fn as_bytes(&self) -> CheckerResult<&[u8]> {
        match self {
            TValue::Bytes(bytes) => Ok(bytes),
            _ => Err(CheckerError::TransactionFailed(
                "expected byte operand".to_string(),
            )),
        }
    }

    pub fn as_str(&self) -> CheckerResult<&str> {
        std::str::from_utf8(self.as_bytes()?)
            .map_err(|_| CheckerError::TransactionFailed("expected utf8 operand".to_string()))
    }

    pub fn as_integer(&self) -> CheckerResult<u64> {
        match self {
            TValue::Integer(value) => Ok(*value),
            TValue::TimeStamp(value) => Ok(*value),
            _ => Err(CheckerError::TransactionFailed(
                "expected integer operand".to_string(),
            )),
        }
    }

    pub fn as_boolean(&self) -> CheckerResult<bool> {
        match self {
            TValue::Boolean(value) => Ok(*value),
            _ => Err(CheckerError::TransactionFailed(
                "expected boolean operand".to_string(),
            )),
        }
    }

    pub fn as_list(&self) -> CheckerResult<&[TValue]> {
        match self {
            TValue::List(values) => Ok(values),
            _ => Err(CheckerError::TransactionFailed(
                "expected list operand".to_string(),
            )),
        }
    }
}

/// One step of a transaction program.
#[derive(Clone, Debug)]
pub enum TAction {
    Call {
        primitive: Primitive,
        args: Vec<TOperand>,
        result: Option<TVar>,
    },
    Sequence(Vec<TAction>),
    /// Run the body when the operand's boolean value matches `expect`.
    Test {
        operand: TOperand,
        expect: bool,
        body: Vec<TAction>,
    },
    /// Bind each element of the list to `var` and run the body.
    Iterate {
        var: TVar,
        list: TOperand,
        body: Vec<TAction>,
    },
}

impl TAction {
    pub fn call(primitive: Primitive, args: Vec<TOperand>) -> TAction {
        TAction::Call {
            primitive,
            args,
            result: None,
        }
    }

    pub fn call_result(primitive: Primitive, args: Vec<TOperand>, result: TVar) -> TAction {
        TAction::Call {
            primitive,
            args,
            result: Some(result),
        }
    }
}

/// A program of actions plus the variable environment filled in as the
/// backend executes it. A transaction is the unit of atomicity: the backend
/// runs it while holding the store, and any primitive failure aborts the
/// remainder.
pub struct Transaction {
    counter: TVar,
    actions: Vec<TAction>,
    values: HashMap<TVar, TValue>,
    stamp: TimeStamp,
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction {
            counter: 0,
            actions: Vec::new(),
            values: HashMap::new(),
            stamp: 0,
        }
    }

    pub fn make_variable(&mut self) -> TVar {
        self.counter += 1;
        self.counter
    }

    pub fn push_action(&mut self, action: TAction) {
        self.actions.push(action);
    }

    pub(crate) fn take_actions(&mut self) -> Vec<TAction> {
        std::mem::take(&mut self.actions)
    }

    pub(crate) fn bind(&mut self, var: TVar, value: TValue) {
        self.values.insert(var, value);
    }

    pub(crate) fn set_stamp(&mut self, stamp: TimeStamp) {
        self.stamp = stamp;
    }

    /// Stamp the backend assigned when this transaction was submitted.
    pub fn time_stamp(&self) -> TimeStamp {
        self.stamp
    }

    pub fn lookup(&self, var: TVar) -> Option<&TValue> {
        self.values.get(&var)
    }

    pub fn lookup_bytes(&self, var: TVar) -> CheckerResult<&[u8]> {
        self.require(var)?.as_bytes()
    }

    pub fn lookup_str(&self, var: TVar) -> CheckerResult<&str> {
        self.require(var)?.as_str()
    }

    pub fn lookup_integer(&self, var: TVar) -> CheckerResult<u64> {
        self.require(var)?.as_integer()
    }

    pub fn lookup_boolean(&self, var: TVar) -> CheckerResult<bool> {
        self.require(var)?.as_boolean()
    }

    pub fn lookup_list(&self, var: TVar) -> CheckerResult<&[TValue]> {
        self.require(var)?.as_list()
    }

    fn require(&self, var: TVar) -> CheckerResult<&TValue> {
        self.values.get(&var).ok_or_else(|| {
            CheckerError::TransactionFailed(format!("transaction variable ${var} is unbound"))
        })
    }

    /// Drop the program and results, keeping the variable counter so the
    /// transaction object can be reused for the next submission.
    pub fn clear(&mut self) {
        self.actions.clear();
        self.values.clear();
        self.stamp = 0;
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction::new()
    }
}
