// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! The hash-consed intermediate representation: types, variables,
//! expressions, propositional bits, blocks and control-flow graphs, and the
//! traces used as escape/callgraph keys.

mod bit;
mod block;
mod exp;
mod trace;
mod types;
mod variable;

pub use bit::*;
pub use block::*;
pub use exp::*;
pub use trace::*;
pub use types::*;
pub use variable::*;

use std::cmp::Ordering;
use std::fmt;

use checker_config::INTERN_MIN_BUCKETS;

use crate::error::CheckerResult;
use crate::hashcons::{hash_bytes, hash_combine, InternKey, Interned, Interner};
use crate::serialize::{tags, Buffer, Reader, Serial};

/// A source location `(file, line)`.
#[derive(Debug)]
pub struct LocationData {
    file: String,
    line: u32,
}

pub type Location = Interned<LocationData>;

static LOCATION_TABLE: Interner<LocationData> = Interner::new(INTERN_MIN_BUCKETS);

impl Location {
    pub fn make(file: &str, line: u32) -> Location {
        LOCATION_TABLE.intern(LocationData {
            file: file.to_string(),
            line,
        })
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }
}

impl InternKey for LocationData {
    fn content_hash(&self) -> u32 {
        hash_combine(hash_bytes(0, self.file.as_bytes()), self.line)
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.file
            .cmp(&other.file)
            .then_with(|| self.line.cmp(&other.line))
    }
}

impl fmt::Display for LocationData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

impl Serial for Location {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::LOCATION, |buf| {
            buf.put_str(tags::NAME, self.file());
            buf.put_uint(tags::INDEX, self.line() as u64);
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::LOCATION)?;
        let file = reader.get_str(tags::NAME)?;
        let line = reader.get_uint(tags::INDEX)? as u32;
        reader.leave(outer);
        Ok(Location::make(&file, line))
    }
}

/// Teardown support: leak-scan every IR interning table and report the
/// number of surviving nodes. Called by `analysis_cleanup` after the caches
/// have been dropped.
pub(crate) fn scan_ir_leaks() -> usize {
    let mut live = 0;
    live += crate::hashcons::scan_leaks("location", &LOCATION_TABLE).live;
    live += types::scan_type_leaks();
    live += variable::scan_variable_leaks();
    live += exp::scan_exp_leaks();
    live += bit::scan_bit_leaks();
    live += block::scan_block_leaks();
    live += trace::scan_trace_leaks();
    live
}

