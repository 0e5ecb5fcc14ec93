// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-block analysis summaries: the assertion obligations discharged by
//! the checker, with their classification from redundancy marking.

use crate::error::{CheckerError, CheckerResult};
use crate::ir::{Bit, BlockId, PPoint};
use crate::serialize::{tags, Buffer, Reader, Serial};

/// What an assertion protects against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AssertKind {
    ReadUnderflow,
    ReadOverflow,
    WriteUnderflow,
    WriteOverflow,
    /// Dereference of a possibly null or invalid pointer on a read.
    ReadDeref,
    /// Dereference of a possibly null or invalid pointer on a write.
    WriteDeref,
    IntegerUnderflow,
    IntegerOverflow,
    /// User-written precondition, postcondition or assert annotation.
    Annotation,
    /// Annotation checked at runtime in the original source.
    AnnotationRuntime,
}

impl AssertKind {
    /// Stable name used in check-kind filters and report database names.
    pub fn name(self) -> &'static str {
        match self {
            AssertKind::ReadUnderflow => "read_underflow",
            AssertKind::ReadOverflow => "read_overflow",
            AssertKind::WriteUnderflow => "write_underflow",
            AssertKind::WriteOverflow => "write_overflow",
            AssertKind::ReadDeref => "read_deref",
            AssertKind::WriteDeref => "write_deref",
            AssertKind::IntegerUnderflow => "integer_underflow",
            AssertKind::IntegerOverflow => "integer_overflow",
            AssertKind::Annotation => "annotation",
            AssertKind::AnnotationRuntime => "annotation_runtime",
        }
    }

    fn from_index(value: u64) -> CheckerResult<AssertKind> {
        Ok(match value {
            0 => AssertKind::ReadUnderflow,
            1 => AssertKind::ReadOverflow,
            2 => AssertKind::WriteUnderflow,
            3 => AssertKind::WriteOverflow,
            4 => AssertKind::ReadDeref,
            5 => AssertKind::WriteDeref,
            6 => AssertKind::IntegerUnderflow,
            7 => AssertKind::IntegerOverflow,
            8 => AssertKind::Annotation,
            9 => AssertKind::AnnotationRuntime,
            _ => return Err(CheckerError::Corrupt(tags::SUMMARY_ASSERT)),
        })
    }
}

/// Classification assigned by redundancy marking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssertClass {
    /// Needs to be discharged by the checker.
    Check,
    /// Holds on every path reaching it; no check required.
    Trivial,
    /// Implied by the other assertions of the summary, or isomorphic to an
    /// assertion inside a loop body.
    Redundant,
}

/// One assertion obligation at a point of the block.
#[derive(Clone, Debug)]
pub struct SummaryAssert {
    pub kind: AssertKind,
    pub cls: AssertClass,
    pub point: PPoint,
    pub bit: Bit,
    /// Stable name keying the report database entry for this assertion.
    pub name: String,
}

/// The assertion list of one block.
#[derive(Clone, Debug)]
pub struct BlockSummary {
    id: BlockId,
    asserts: Vec<SummaryAssert>,
}

impl BlockSummary {
    pub fn new(id: BlockId) -> BlockSummary {
        BlockSummary {
            id,
            asserts: Vec::new(),
        }
    }

    pub fn id(&self) -> &BlockId {
        &self.id
    }

    pub fn asserts(&self) -> &[SummaryAssert] {
        &self.asserts
    }

    pub fn add_assert(&mut self, kind: AssertKind, cls: AssertClass, point: PPoint, bit: Bit) {
        let name = format!(
            "{}${}${}${}",
            kind.name(),
            self.id,
            point,
            self.asserts.len()
        );
        self.asserts.push(SummaryAssert {
            kind,
            cls,
            point,
            bit,
            name,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.asserts.is_empty()
    }
}

impl Serial for BlockSummary {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::BLOCK_SUMMARY, |buf| {
            self.id.write(buf);
            for assert in &self.asserts {
                buf.open(tags::SUMMARY_ASSERT, |buf| {
                    buf.put_uint(tags::KIND, assert.kind as u64);
                    buf.put_uint(
                        tags::INDEX,
                        match assert.cls {
                            AssertClass::Check => 0,
                            AssertClass::Trivial => 1,
                            AssertClass::Redundant => 2,
                        },
                    );
                    buf.put_uint(tags::INDEX, assert.point as u64);
                    assert.bit.write(buf);
                    buf.put_str(tags::NAME, &assert.name);
                });
            }
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::BLOCK_SUMMARY)?;
        let id = BlockId::read(reader)?;
        let mut summary = BlockSummary::new(id);
        while !reader.at_end() {
            let inner = reader.enter(tags::SUMMARY_ASSERT)?;
            let kind = AssertKind::from_index(reader.get_uint(tags::KIND)?)?;
            let cls = match reader.get_uint(tags::INDEX)? {
                0 => AssertClass::Check,
                1 => AssertClass::Trivial,
                2 => AssertClass::Redundant,
                _ => return Err(CheckerError::Corrupt(tags::SUMMARY_ASSERT)),
            };
            let point = reader.get_uint(tags::INDEX)? as PPoint;
            let bit = Bit::read(reader)?;
            let name = reader.get_str(tags::NAME)?;
            reader.leave(inner);
            summary.asserts.push(SummaryAssert {
                kind,
                cls,
                point,
                bit,
                name,
            });
        }
        reader.leave(outer);
        Ok(summary)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{BlockKind, Exp, Variable};

    #[test]
    fn test_summary_roundtrip() {
        let id = BlockId::make(BlockKind::Function, Variable::make_func("f"), None);
        let mut summary = BlockSummary::new(id);
        summary.add_assert(
            AssertKind::WriteOverflow,
            AssertClass::Check,
            2,
            Bit::make_exp(Exp::make_var(Variable::make_glob("ok"))),
        );
        summary.add_assert(AssertKind::WriteDeref, AssertClass::Trivial, 3, Bit::make_true());

        let mut buf = Buffer::new();
        summary.write(&mut buf);
        let bytes = buf.into_bytes();
        let mut reader = Reader::new(&bytes);
        let back = BlockSummary::read(&mut reader).unwrap();

        assert_eq!(back.asserts().len(), 2);
        assert_eq!(back.asserts()[0].kind, AssertKind::WriteOverflow);
        assert_eq!(back.asserts()[0].name, summary.asserts()[0].name);
        assert_eq!(back.asserts()[1].cls, AssertClass::Trivial);
    }
}
