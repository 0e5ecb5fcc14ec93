// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::error::{CheckerError, CheckerResult};
use crate::ir::{Bit, BlockId, Exp, ExpKind, PPoint, VarKind};
use crate::serialize::{tags, Buffer, Reader, Serial};

use super::{BlockMemory, GuardAssign};

/// How a modset entry writes its lvalue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModsetKind {
    /// Plain assignment through a name or field path.
    Assign,
    /// Write through pointer arithmetic; buffer checks care about these.
    PointerWrite,
    /// Write performed by a callee, translated across the call edge.
    Clobber,
}

/// One lvalue a block may modify, with the condition under which it does.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModsetEntry {
    pub lval: Exp,
    pub kind: ModsetKind,
    pub guard: Bit,
}

/// The set of externally visible lvalues one block may write, directly or
/// through calls. Exactly one worker writes the modset for a given id.
#[derive(Clone, Debug)]
pub struct BlockModset {
    id: BlockId,
    entries: Vec<ModsetEntry>,
    /// Writes performed for the caller at specific call points, kept so
    /// transparent call effects can be replayed.
    call_assigns: Vec<(PPoint, GuardAssign)>,
}

impl BlockModset {
    pub fn new(id: BlockId) -> BlockModset {
        BlockModset {
            id,
            entries: Vec::new(),
            call_assigns: Vec::new(),
        }
    }

    pub fn id(&self) -> &BlockId {
        &self.id
    }

    pub fn entries(&self) -> &[ModsetEntry] {
        &self.entries
    }

    pub fn call_assigns(&self) -> &[(PPoint, GuardAssign)] {
        &self.call_assigns
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.call_assigns.is_empty()
    }

    pub fn add_entry(&mut self, entry: ModsetEntry) {
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
    }

    /// Fill this modset from the memory tables of one block: every write
    /// whose location is visible outside the block joins the set. Locals
    /// and temporaries stay private.
    pub fn compute_modset(&mut self, memory: &BlockMemory) {
        for (point, assign) in memory.all_writes() {
            let Some(root) = assign.lval.root_var() else {
                continue;
            };
            let visible = match root.kind() {
                VarKind::Glob => true,
                // writes through an argument or receiver pointer land in
                // caller-visible memory.
                VarKind::Arg | VarKind::This => {
                    matches!(&*assign.lval, ExpKind::Drf(_) | ExpKind::Index { .. })
                        || assign.lval.base_field().is_some()
                }
                VarKind::Return => true,
                _ => false,
            };
            if !visible {
                continue;
            }

            let kind = if contains_index(&assign.lval) {
                ModsetKind::PointerWrite
            } else {
                ModsetKind::Assign
            };
            self.add_entry(ModsetEntry {
                lval: assign.lval.clone(),
                kind,
                guard: assign.guard.clone(),
            });

            if memory.clobbers_at(point).contains(assign) {
                self.call_assigns.push((point, assign.clone()));
            }
        }

        // deterministic order regardless of table iteration.
        self.entries.sort_by(|a, b| {
            a.lval
                .cmp(&b.lval)
                .then_with(|| a.kind.cmp(&b.kind))
                .then_with(|| a.guard.cmp(&b.guard))
        });
    }

    /// Copy another modset's contents under this modset's id. Used when
    /// computing through a scratch id (direct recursion may consult the
    /// real id's previous modset while the new one is being built).
    pub fn copy_modset(&mut self, other: &BlockModset) {
        self.entries = other.entries.clone();
        self.call_assigns = other.call_assigns.clone();
    }

    /// Byte comparison proxy: serialized form equality, used to detect
    /// modset changes that require rescheduling dependent callers.
    pub fn same_contents(&self, other: &BlockModset) -> bool {
        let mut a = Buffer::new();
        self.write(&mut a);
        let mut b = Buffer::new();
        other.write(&mut b);
        a.as_bytes() == b.as_bytes()
    }
}

fn contains_index(exp: &Exp) -> bool {
    let mut found = false;
    exp.visit_all(&mut |exp| {
        if exp.is_index() {
            found = true;
        }
    });
    found
}

impl Serial for BlockModset {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::BLOCK_MODSET, |buf| {
            self.id.write(buf);
            for entry in &self.entries {
                buf.open(tags::MODSET_ENTRY, |buf| {
                    entry.lval.write(buf);
                    buf.put_uint(tags::KIND, entry.kind as u64);
                    entry.guard.write(buf);
                });
            }
            for (point, assign) in &self.call_assigns {
                buf.open(tags::MODSET_CALL_ASSIGN, |buf| {
                    buf.put_uint(tags::INDEX, *point as u64);
                    assign.lval.write(buf);
                    assign.rval.write(buf);
                    assign.guard.write(buf);
                });
            }
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::BLOCK_MODSET)?;
        let id = BlockId::read(reader)?;
        let mut modset = BlockModset::new(id);
        while !reader.at_end() {
            match reader.peek() {
                Some(tags::MODSET_ENTRY) => {
                    let inner = reader.enter(tags::MODSET_ENTRY)?;
                    let lval = Exp::read(reader)?;
                    let kind = match reader.get_uint(tags::KIND)? {
                        0 => ModsetKind::Assign,
                        1 => ModsetKind::PointerWrite,
                        2 => ModsetKind::Clobber,
                        _ => return Err(CheckerError::Corrupt(tags::MODSET_ENTRY)),
                    };
                    let guard = Bit::read(reader)?;
                    reader.leave(inner);
                    modset.add_entry(ModsetEntry { lval, kind, guard });
                }
                Some(tags::MODSET_CALL_ASSIGN) => {
                    let inner = reader.enter(tags::MODSET_CALL_ASSIGN)?;
                    let point = reader.get_uint(tags::INDEX)? as PPoint;
                    let lval = Exp::read(reader)?;
                    let rval = Exp::read(reader)?;
                    let guard = Bit::read(reader)?;
                    reader.leave(inner);
                    modset
                        .call_assigns
                        .push((point, GuardAssign { lval, rval, guard }));
                }
                Some(tag) => return Err(CheckerError::Corrupt(tag)),
                None => break,
            }
        }
        reader.leave(outer);
        Ok(modset)
    }
}

/// Compute the modset for one block through a scratch id, then copy into
/// the real id. The scratch step keeps direct recursion able to read the
/// previous modset for the real id while this one is being built.
pub fn compute_block_modset(
    id: &BlockId,
    memory: &BlockMemory,
) -> CheckerResult<Arc<BlockModset>> {
    let scratch_id = BlockId::make(
        crate::ir::BlockKind::Scratch,
        id.base_var().clone(),
        id.loop_name(),
    );
    let mut scratch = BlockModset::new(scratch_id);
    scratch.compute_modset(memory);

    let mut modset = BlockModset::new(id.clone());
    modset.copy_modset(&scratch);
    Ok(Arc::new(modset))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{BlockCfg, BlockKind, Location, PEdge, Type, Variable};
    use crate::memory::{AliasKind, ClobberKind, SimplifyKind};

    /// `void f(int *p, int n) { p[n] = 0; local = 1; }` in value form.
    fn memory_for_store() -> (BlockId, BlockMemory) {
        let id = BlockId::make(BlockKind::Function, Variable::make_func("f"), None);
        let mut cfg = BlockCfg::new(
            id.clone(),
            Location::make("test.c", 1),
            Location::make("test.c", 3),
        );
        let p = Exp::make_drf(Exp::make_var(Variable::make_arg(id.clone(), 0, "p")));
        let n = Exp::make_drf(Exp::make_var(Variable::make_arg(id.clone(), 1, "n")));
        let local = Exp::make_var(Variable::make(
            Some(id.clone()),
            VarKind::Local,
            "local",
            None,
        ));

        let p1 = cfg.add_point(Location::make("test.c", 1));
        let p2 = cfg.add_point(Location::make("test.c", 2));
        let p3 = cfg.add_point(Location::make("test.c", 3));
        cfg.set_entry_point(p1);
        cfg.set_exit_point(p3);

        let int_type = Type::make_int(32, true);
        cfg.add_edge(PEdge::assign(
            p1,
            p2,
            int_type.clone(),
            Exp::make_index(p, int_type.clone(), n),
            Exp::make_int(0),
        ));
        cfg.add_edge(PEdge::assign(p2, p3, int_type, local, Exp::make_int(1)));

        let mut memory = BlockMemory::new(
            id.clone(),
            SimplifyKind::Scalar,
            AliasKind::Buffer,
            ClobberKind::Modset,
        );
        memory.set_cfg(std::sync::Arc::new(cfg));
        memory.compute_tables(&mut |_| None).unwrap();
        (id, memory)
    }

    #[test]
    fn test_modset_keeps_visible_writes_only() {
        let (id, memory) = memory_for_store();
        let modset = compute_block_modset(&id, &memory).unwrap();

        // the buffer store is visible to the caller and is a pointer
        // arithmetic write; the local assignment is private.
        assert_eq!(modset.entries().len(), 1);
        assert_eq!(modset.entries()[0].kind, ModsetKind::PointerWrite);
        assert_eq!(modset.id(), &id);
    }

    #[test]
    fn test_modset_roundtrip_and_change_detection() {
        let (id, memory) = memory_for_store();
        let modset = compute_block_modset(&id, &memory).unwrap();

        let mut buf = Buffer::new();
        modset.write(&mut buf);
        let bytes = buf.into_bytes();
        let mut reader = Reader::new(&bytes);
        let back = BlockModset::read(&mut reader).unwrap();
        assert!(modset.same_contents(&back));

        let mut changed = BlockModset::new(id);
        changed.copy_modset(&back);
        changed.add_entry(ModsetEntry {
            lval: Exp::make_var(Variable::make_glob("g")),
            kind: ModsetKind::Assign,
            guard: Bit::make_true(),
        });
        assert!(!modset.same_contents(&changed));
    }
}
