// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::fmt;

use checker_config::INTERN_MIN_BUCKETS;

use crate::error::{CheckerError, CheckerResult};
use crate::hashcons::{hash_bytes, hash_combine, InternKey, Interned, Interner};
use crate::serialize::{tags, Buffer, Reader, Serial};

use super::BlockId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum VarKind {
    /// Global variable.
    Glob,
    /// Global function.
    Func,
    /// Formal argument, with its index.
    Arg,
    Local,
    /// The return lvalue of a function.
    Return,
    /// The receiver of an instance method.
    This,
    /// Frontend-introduced temporary.
    Temp,
    /// Identity-distinguished scratch variable, for analysis internals.
    Scratch,
}

/// A named storage location, interned. Non-global variables carry the block
/// that owns them.
#[derive(Debug)]
pub struct VariableData {
    owner: Option<BlockId>,
    kind: VarKind,
    /// Argument index for `VarKind::Arg`.
    index: u32,
    name: String,
    source_name: Option<String>,
}

pub type Variable = Interned<VariableData>;

static VARIABLE_TABLE: Interner<VariableData> = Interner::new(INTERN_MIN_BUCKETS);

impl Variable {
    pub fn make(
        owner: Option<BlockId>,
        kind: VarKind,
        name: &str,
        source_name: Option<&str>,
    ) -> Variable {
        Variable::make_arg_index(owner, kind, 0, name, source_name)
    }

    pub fn make_arg(owner: BlockId, index: u32, name: &str) -> Variable {
        Variable::make_arg_index(Some(owner), VarKind::Arg, index, name, None)
    }

    fn make_arg_index(
        owner: Option<BlockId>,
        kind: VarKind,
        index: u32,
        name: &str,
        source_name: Option<&str>,
    ) -> Variable {
        debug_assert!(
            !matches!(kind, VarKind::Glob | VarKind::Func) || owner.is_none(),
            "global variables have no owning block"
        );
        VARIABLE_TABLE.intern(VariableData {
            owner,
            kind,
            index,
            name: name.to_string(),
            source_name: source_name.map(str::to_string),
        })
    }

    pub fn make_func(name: &str) -> Variable {
        Variable::make(None, VarKind::Func, name, None)
    }

    pub fn make_glob(name: &str) -> Variable {
        Variable::make(None, VarKind::Glob, name, None)
    }

    pub fn owner(&self) -> Option<&BlockId> {
        self.owner.as_ref()
    }

    pub fn kind(&self) -> VarKind {
        self.kind
    }

    /// Argument index; meaningful only for `VarKind::Arg`.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_name(&self) -> Option<&str> {
        self.source_name.as_deref()
    }

    pub fn is_global(&self) -> bool {
        matches!(self.kind, VarKind::Glob | VarKind::Func)
    }

    /// Whether two variables name the same location, ignoring which block
    /// hydrated them.
    pub fn matches(&self, other: &Variable) -> bool {
        self.kind == other.kind && self.index == other.index && self.name == other.name
    }
}

impl InternKey for VariableData {
    fn content_hash(&self) -> u32 {
        let mut hash = hash_combine(0x9e21, self.kind as u32);
        hash = hash_combine(hash, self.index);
        hash = hash_bytes(hash, self.name.as_bytes());
        if let Some(owner) = &self.owner {
            hash = hash_combine(hash, owner.hash());
        }
        hash
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| self.index.cmp(&other.index))
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.owner.cmp(&other.owner))
            .then_with(|| self.source_name.cmp(&other.source_name))
    }
}

impl fmt::Display for VariableData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            VarKind::Arg => write!(f, "arg{}:{}", self.index, self.name),
            VarKind::Return => write!(f, "return"),
            VarKind::This => write!(f, "this"),
            _ => write!(f, "{}", self.name),
        }
    }
}

impl Serial for Variable {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::VARIABLE, |buf| {
            buf.put_uint(tags::KIND, self.kind() as u64);
            buf.put_uint(tags::INDEX, self.index() as u64);
            buf.put_str(tags::NAME, self.name());
            if let Some(source) = self.source_name() {
                buf.put_str(tags::STRING, source);
            }
            if let Some(owner) = self.owner() {
                owner.write(buf);
            }
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::VARIABLE)?;
        let kind = match reader.get_uint(tags::KIND)? {
            0 => VarKind::Glob,
            1 => VarKind::Func,
            2 => VarKind::Arg,
            3 => VarKind::Local,
            4 => VarKind::Return,
            5 => VarKind::This,
            6 => VarKind::Temp,
            7 => VarKind::Scratch,
            _ => return Err(CheckerError::Corrupt(tags::VARIABLE)),
        };
        let index = reader.get_uint(tags::INDEX)? as u32;
        let name = reader.get_str(tags::NAME)?;
        let source_name = if reader.peek() == Some(tags::STRING) {
            Some(reader.get_str(tags::STRING)?)
        } else {
            None
        };
        let owner = if reader.at_end() {
            None
        } else {
            Some(BlockId::read(reader)?)
        };
        reader.leave(outer);
        Ok(Variable::make_arg_index(
            owner,
            kind,
            index,
            &name,
            source_name.as_deref(),
        ))
    }
}

pub(super) fn scan_variable_leaks() -> usize {
    crate::hashcons::scan_leaks("variable", &VARIABLE_TABLE).live
}

#[cfg(test)]
mod test {
    use super::super::BlockKind;
    use super::*;

    #[test]
    fn test_variable_interning() {
        let f = Variable::make_func("main");
        assert_eq!(f, Variable::make_func("main"));
        assert_ne!(f, Variable::make_glob("main"));

        let id = BlockId::make(BlockKind::Function, f.clone(), None);
        let a0 = Variable::make_arg(id.clone(), 0, "argc");
        let a1 = Variable::make_arg(id.clone(), 1, "argv");
        assert_ne!(a0, a1);
        assert_eq!(a0, Variable::make_arg(id, 0, "argc"));
    }

    #[test]
    fn test_variable_roundtrip() {
        let f = Variable::make_func("f");
        let id = BlockId::make(BlockKind::Function, f, None);
        let local = Variable::make(Some(id), VarKind::Local, "x", Some("x"));

        let mut buf = Buffer::new();
        local.write(&mut buf);
        let bytes = buf.into_bytes();
        let mut reader = Reader::new(&bytes);
        assert_eq!(local, Variable::read(&mut reader).unwrap());
    }
}
