// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::fmt;

use checker_config::INTERN_MIN_BUCKETS;

use crate::error::{CheckerError, CheckerResult};
use crate::hashcons::{hash_bytes, hash_combine, InternKey, Interned, Interner};
use crate::serialize::{tags, Buffer, Reader, Serial};

use super::{Field, Type, Variable};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnopKind {
    Neg,
    BitNot,
    LogNot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BinopKind {
    Plus,
    Minus,
    Mult,
    Div,
    Mod,
    ShiftLeft,
    ShiftRight,
    BitAnd,
    BitOr,
    BitXor,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
    Equal,
    NotEqual,
}

impl BinopKind {
    pub fn is_compare(self) -> bool {
        matches!(
            self,
            BinopKind::LessThan
                | BinopKind::LessEqual
                | BinopKind::GreaterThan
                | BinopKind::GreaterEqual
                | BinopKind::Equal
                | BinopKind::NotEqual
        )
    }

    /// The comparison holding exactly when `self` does not.
    pub fn negate_compare(self) -> Option<BinopKind> {
        Some(match self {
            BinopKind::LessThan => BinopKind::GreaterEqual,
            BinopKind::LessEqual => BinopKind::GreaterThan,
            BinopKind::GreaterThan => BinopKind::LessEqual,
            BinopKind::GreaterEqual => BinopKind::LessThan,
            BinopKind::Equal => BinopKind::NotEqual,
            BinopKind::NotEqual => BinopKind::Equal,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BoundKind {
    Lower,
    Upper,
}

/// Expression trees over variables, interned.
#[derive(Debug)]
pub enum ExpKind {
    Var(Variable),
    /// Dereference of a pointer-valued expression.
    Drf(Exp),
    Fld {
        target: Exp,
        field: Field,
    },
    Index {
        target: Exp,
        element_type: Type,
        index: Exp,
    },
    Int(i128),
    Unop {
        op: UnopKind,
        operand: Exp,
        bits: u32,
        signed: bool,
    },
    Binop {
        op: BinopKind,
        left: Exp,
        right: Exp,
        bits: u32,
        signed: bool,
    },
    /// Lower or upper bound of the buffer `target` in `stride` units.
    Bound {
        kind: BoundKind,
        target: Exp,
        stride: Type,
    },
    /// Termination predicate over the buffer `target`.
    Terminate {
        target: Exp,
        stride: Type,
    },
    /// Slot of the vtable reachable from `target`.
    VTableSlot {
        target: Exp,
        index: u32,
    },
    /// Value of `target` on entry to the enclosing loop.
    LoopEntry(Exp),
}

pub type Exp = Interned<ExpKind>;

static EXP_TABLE: Interner<ExpKind> = Interner::new(INTERN_MIN_BUCKETS);

fn kind_rank(kind: &ExpKind) -> u32 {
    match kind {
        ExpKind::Var(_) => 0,
        ExpKind::Drf(_) => 1,
        ExpKind::Fld { .. } => 2,
        ExpKind::Index { .. } => 3,
        ExpKind::Int(_) => 4,
        ExpKind::Unop { .. } => 5,
        ExpKind::Binop { .. } => 6,
        ExpKind::Bound { .. } => 7,
        ExpKind::Terminate { .. } => 8,
        ExpKind::VTableSlot { .. } => 9,
        ExpKind::LoopEntry(_) => 10,
    }
}

impl Exp {
    pub fn make_var(var: Variable) -> Exp {
        EXP_TABLE.intern(ExpKind::Var(var))
    }

    pub fn make_drf(target: Exp) -> Exp {
        EXP_TABLE.intern(ExpKind::Drf(target))
    }

    pub fn make_fld(target: Exp, field: Field) -> Exp {
        EXP_TABLE.intern(ExpKind::Fld { target, field })
    }

    pub fn make_index(target: Exp, element_type: Type, index: Exp) -> Exp {
        EXP_TABLE.intern(ExpKind::Index {
            target,
            element_type,
            index,
        })
    }

    pub fn make_int(value: i128) -> Exp {
        EXP_TABLE.intern(ExpKind::Int(value))
    }

    pub fn make_unop(op: UnopKind, operand: Exp, bits: u32, signed: bool) -> Exp {
        EXP_TABLE.intern(ExpKind::Unop {
            op,
            operand,
            bits,
            signed,
        })
    }

    pub fn make_binop(op: BinopKind, left: Exp, right: Exp, bits: u32, signed: bool) -> Exp {
        EXP_TABLE.intern(ExpKind::Binop {
            op,
            left,
            right,
            bits,
            signed,
        })
    }

    /// Comparison binop; carries no result width.
    pub fn make_compare(op: BinopKind, left: Exp, right: Exp) -> Exp {
        debug_assert!(op.is_compare());
        Exp::make_binop(op, left, right, 0, false)
    }

    pub fn make_bound(kind: BoundKind, target: Exp, stride: Type) -> Exp {
        EXP_TABLE.intern(ExpKind::Bound {
            kind,
            target,
            stride,
        })
    }

    pub fn make_terminate(target: Exp, stride: Type) -> Exp {
        EXP_TABLE.intern(ExpKind::Terminate { target, stride })
    }

    pub fn make_vtable_slot(target: Exp, index: u32) -> Exp {
        EXP_TABLE.intern(ExpKind::VTableSlot { target, index })
    }

    pub fn make_loop_entry(target: Exp) -> Exp {
        EXP_TABLE.intern(ExpKind::LoopEntry(target))
    }

    /// Whether this expression denotes a storage location.
    pub fn is_lvalue(&self) -> bool {
        matches!(
            &**self,
            ExpKind::Var(_)
                | ExpKind::Drf(_)
                | ExpKind::Fld { .. }
                | ExpKind::Index { .. }
                | ExpKind::VTableSlot { .. }
        )
    }

    pub fn if_var(&self) -> Option<&Variable> {
        match &**self {
            ExpKind::Var(var) => Some(var),
            _ => None,
        }
    }

    pub fn if_int(&self) -> Option<i128> {
        match &**self {
            ExpKind::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(&**self, ExpKind::Index { .. })
    }

    /// The variable at the root of an lvalue path, if any.
    pub fn root_var(&self) -> Option<&Variable> {
        match &**self {
            ExpKind::Var(var) => Some(var),
            ExpKind::Drf(target)
            | ExpKind::Fld { target, .. }
            | ExpKind::Index { target, .. }
            | ExpKind::VTableSlot { target, .. }
            | ExpKind::LoopEntry(target) => target.root_var(),
            _ => None,
        }
    }

    /// The outermost field along an lvalue path, if any.
    pub fn base_field(&self) -> Option<&Field> {
        match &**self {
            ExpKind::Fld { field, .. } => Some(field),
            ExpKind::Drf(target)
            | ExpKind::Index { target, .. }
            | ExpKind::VTableSlot { target, .. } => target.base_field(),
            _ => None,
        }
    }

    /// Result width of an integer operation, when known. Used by the
    /// overflow assertion scan.
    pub fn int_width(&self) -> Option<(u32, bool)> {
        match &**self {
            ExpKind::Unop { bits, signed, .. } | ExpKind::Binop { bits, signed, .. }
                if *bits != 0 =>
            {
                Some((*bits, *signed))
            }
            _ => None,
        }
    }

    /// Visit `self` and nested subexpressions, reporting each lvalue along
    /// with whether it is reached in a write context. The write flag holds
    /// only for the outermost lvalue of an assignment's left side; nested
    /// expressions (indices, pointers being dereferenced) are reads.
    pub fn visit_lvalues(&self, write: bool, visit: &mut impl FnMut(&Exp, bool)) {
        if self.is_lvalue() {
            visit(self, write);
        }
        match &**self {
            ExpKind::Var(_) | ExpKind::Int(_) => {}
            ExpKind::Drf(target) | ExpKind::LoopEntry(target) => {
                target.visit_lvalues(false, visit)
            }
            ExpKind::Fld { target, .. } | ExpKind::VTableSlot { target, .. } => {
                target.visit_lvalues(false, visit)
            }
            ExpKind::Index { target, index, .. } => {
                target.visit_lvalues(false, visit);
                index.visit_lvalues(false, visit);
            }
            ExpKind::Unop { operand, .. } => operand.visit_lvalues(false, visit),
            ExpKind::Binop { left, right, .. } => {
                left.visit_lvalues(false, visit);
                right.visit_lvalues(false, visit);
            }
            ExpKind::Bound { target, .. } | ExpKind::Terminate { target, .. } => {
                target.visit_lvalues(false, visit)
            }
        }
    }

    /// Visit every node of the tree, parents after children.
    pub fn visit_all(&self, visit: &mut impl FnMut(&Exp)) {
        match &**self {
            ExpKind::Var(_) | ExpKind::Int(_) => {}
            ExpKind::Drf(target) | ExpKind::LoopEntry(target) => target.visit_all(visit),
            ExpKind::Fld { target, .. } | ExpKind::VTableSlot { target, .. } => {
                target.visit_all(visit)
            }
            ExpKind::Index { target, index, .. } => {
                target.visit_all(visit);
                index.visit_all(visit);
            }
            ExpKind::Unop { operand, .. } => operand.visit_all(visit),
            ExpKind::Binop { left, right, .. } => {
                left.visit_all(visit);
                right.visit_all(visit);
            }
            ExpKind::Bound { target, .. } | ExpKind::Terminate { target, .. } => {
                target.visit_all(visit)
            }
        }
        visit(self);
    }

    /// Rebuild the tree bottom-up, replacing each node the mapper returns a
    /// substitute for. Returning `None` keeps the (child-mapped) node.
    pub fn map(&self, mapper: &mut impl FnMut(&Exp) -> Option<Exp>) -> Exp {
        let mapped = match &**self {
            ExpKind::Var(_) | ExpKind::Int(_) => self.clone(),
            ExpKind::Drf(target) => Exp::make_drf(target.map(mapper)),
            ExpKind::Fld { target, field } => Exp::make_fld(target.map(mapper), field.clone()),
            ExpKind::Index {
                target,
                element_type,
                index,
            } => Exp::make_index(target.map(mapper), element_type.clone(), index.map(mapper)),
            ExpKind::Unop {
                op,
                operand,
                bits,
                signed,
            } => Exp::make_unop(*op, operand.map(mapper), *bits, *signed),
            ExpKind::Binop {
                op,
                left,
                right,
                bits,
                signed,
            } => Exp::make_binop(*op, left.map(mapper), right.map(mapper), *bits, *signed),
            ExpKind::Bound {
                kind,
                target,
                stride,
            } => Exp::make_bound(*kind, target.map(mapper), stride.clone()),
            ExpKind::Terminate { target, stride } => {
                Exp::make_terminate(target.map(mapper), stride.clone())
            }
            ExpKind::VTableSlot { target, index } => {
                Exp::make_vtable_slot(target.map(mapper), *index)
            }
            ExpKind::LoopEntry(target) => Exp::make_loop_entry(target.map(mapper)),
        };
        mapper(&mapped).unwrap_or(mapped)
    }
}

impl InternKey for ExpKind {
    fn content_hash(&self) -> u32 {
        let hash = hash_combine(0x2d8f, kind_rank(self));
        match self {
            ExpKind::Var(var) => hash_combine(hash, var.hash()),
            ExpKind::Drf(target) | ExpKind::LoopEntry(target) => {
                hash_combine(hash, target.hash())
            }
            ExpKind::Fld { target, field } => {
                hash_combine(hash_combine(hash, target.hash()), field.hash())
            }
            ExpKind::Index {
                target,
                element_type,
                index,
            } => hash_combine(
                hash_combine(hash_combine(hash, target.hash()), element_type.hash()),
                index.hash(),
            ),
            ExpKind::Int(value) => hash_bytes(hash, &value.to_le_bytes()),
            ExpKind::Unop {
                op,
                operand,
                bits,
                signed,
            } => {
                let hash = hash_combine(hash, *op as u32);
                let hash = hash_combine(hash, operand.hash());
                hash_combine(hash_combine(hash, *bits), *signed as u32)
            }
            ExpKind::Binop {
                op,
                left,
                right,
                bits,
                signed,
            } => {
                let hash = hash_combine(hash, *op as u32);
                let hash = hash_combine(hash_combine(hash, left.hash()), right.hash());
                hash_combine(hash_combine(hash, *bits), *signed as u32)
            }
            ExpKind::Bound {
                kind,
                target,
                stride,
            } => hash_combine(
                hash_combine(hash_combine(hash, *kind as u32), target.hash()),
                stride.hash(),
            ),
            ExpKind::Terminate { target, stride } => {
                hash_combine(hash_combine(hash, target.hash()), stride.hash())
            }
            ExpKind::VTableSlot { target, index } => {
                hash_combine(hash_combine(hash, target.hash()), *index)
            }
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        kind_rank(self)
            .cmp(&kind_rank(other))
            .then_with(|| match (self, other) {
                (ExpKind::Var(a), ExpKind::Var(b)) => a.cmp(b),
                (ExpKind::Drf(a), ExpKind::Drf(b))
                | (ExpKind::LoopEntry(a), ExpKind::LoopEntry(b)) => a.cmp(b),
                (
                    ExpKind::Fld { target, field },
                    ExpKind::Fld {
                        target: otarget,
                        field: ofield,
                    },
                ) => target.cmp(otarget).then_with(|| field.cmp(ofield)),
                (
                    ExpKind::Index {
                        target,
                        element_type,
                        index,
                    },
                    ExpKind::Index {
                        target: otarget,
                        element_type: otype,
                        index: oindex,
                    },
                ) => target
                    .cmp(otarget)
                    .then_with(|| element_type.cmp(otype))
                    .then_with(|| index.cmp(oindex)),
                (ExpKind::Int(a), ExpKind::Int(b)) => a.cmp(b),
                (
                    ExpKind::Unop {
                        op,
                        operand,
                        bits,
                        signed,
                    },
                    ExpKind::Unop {
                        op: oop,
                        operand: ooperand,
                        bits: obits,
                        signed: osigned,
                    },
                ) => op
                    .cmp(oop)
                    .then_with(|| operand.cmp(ooperand))
                    .then_with(|| bits.cmp(obits))
                    .then_with(|| signed.cmp(osigned)),
                (
                    ExpKind::Binop {
                        op,
                        left,
                        right,
                        bits,
                        signed,
                    },
                    ExpKind::Binop {
                        op: oop,
                        left: oleft,
                        right: oright,
                        bits: obits,
                        signed: osigned,
                    },
                ) => op
                    .cmp(oop)
                    .then_with(|| left.cmp(oleft))
                    .then_with(|| right.cmp(oright))
                    .then_with(|| bits.cmp(obits))
                    .then_with(|| signed.cmp(osigned)),
                (
                    ExpKind::Bound {
                        kind,
                        target,
                        stride,
                    },
                    ExpKind::Bound {
                        kind: okind,
                        target: otarget,
                        stride: ostride,
                    },
                ) => kind
                    .cmp(okind)
                    .then_with(|| target.cmp(otarget))
                    .then_with(|| stride.cmp(ostride)),
                (
                    ExpKind::Terminate { target, stride },
                    ExpKind::Terminate {
                        target: otarget,
                        stride: ostride,
                    },
                ) => target.cmp(otarget).then_with(|| stride.cmp(ostride)),
                (
                    ExpKind::VTableSlot { target, index },
                    ExpKind::VTableSlot {
                        target: otarget,
                        index: oindex,
                    },
                ) => target.cmp(otarget).then_with(|| index.cmp(oindex)),
                _ => unreachable!("kind ranks already compared"),
            })
    }
}

impl fmt::Display for ExpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpKind::Var(var) => write!(f, "{var}"),
            ExpKind::Drf(target) => write!(f, "*{target}"),
            ExpKind::Fld { target, field } => write!(f, "{target}.{}", field.name()),
            ExpKind::Index { target, index, .. } => write!(f, "{target}[{index}]"),
            ExpKind::Int(value) => write!(f, "{value}"),
            ExpKind::Unop { op, operand, .. } => {
                let sym = match op {
                    UnopKind::Neg => "-",
                    UnopKind::BitNot => "~",
                    UnopKind::LogNot => "!",
                };
                write!(f, "{sym}({operand})")
            }
            ExpKind::Binop { op, left, right, .. } => {
                let sym = match op {
                    BinopKind::Plus => "+",
                    BinopKind::Minus => "-",
                    BinopKind::Mult => "*",
                    BinopKind::Div => "/",
                    BinopKind::Mod => "%",
                    BinopKind::ShiftLeft => "<<",
                    BinopKind::ShiftRight => ">>",
                    BinopKind::BitAnd => "&",
                    BinopKind::BitOr => "|",
                    BinopKind::BitXor => "^",
                    BinopKind::LessThan => "<",
                    BinopKind::LessEqual => "<=",
                    BinopKind::GreaterThan => ">",
                    BinopKind::GreaterEqual => ">=",
                    BinopKind::Equal => "==",
                    BinopKind::NotEqual => "!=",
                };
                write!(f, "({left} {sym} {right})")
            }
            ExpKind::Bound {
                kind: BoundKind::Lower,
                target,
                stride,
            } => write!(f, "lbound({target},{stride})"),
            ExpKind::Bound {
                kind: BoundKind::Upper,
                target,
                stride,
            } => write!(f, "ubound({target},{stride})"),
            ExpKind::Terminate { target, stride } => write!(f, "terminate({target},{stride})"),
            ExpKind::VTableSlot { target, index } => write!(f, "vtable({target},{index})"),
            ExpKind::LoopEntry(target) => write!(f, "entry({target})"),
        }
    }
}

impl Serial for Exp {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::EXP, |buf| {
            buf.put_uint(tags::KIND, kind_rank(self) as u64);
            match &**self {
                ExpKind::Var(var) => var.write(buf),
                ExpKind::Drf(target) | ExpKind::LoopEntry(target) => target.write(buf),
                ExpKind::Fld { target, field } => {
                    target.write(buf);
                    field.write(buf);
                }
                ExpKind::Index {
                    target,
                    element_type,
                    index,
                } => {
                    target.write(buf);
                    element_type.write(buf);
                    index.write(buf);
                }
                ExpKind::Int(value) => buf.put_str(tags::INT_STR, &value.to_string()),
                ExpKind::Unop {
                    op,
                    operand,
                    bits,
                    signed,
                } => {
                    buf.put_uint(tags::INDEX, *op as u64);
                    operand.write(buf);
                    buf.put_uint(tags::WIDTH, *bits as u64);
                    buf.put_bool(*signed);
                }
                ExpKind::Binop {
                    op,
                    left,
                    right,
                    bits,
                    signed,
                } => {
                    buf.put_uint(tags::INDEX, *op as u64);
                    left.write(buf);
                    right.write(buf);
                    buf.put_uint(tags::WIDTH, *bits as u64);
                    buf.put_bool(*signed);
                }
                ExpKind::Bound {
                    kind,
                    target,
                    stride,
                } => {
                    buf.put_uint(tags::INDEX, *kind as u64);
                    target.write(buf);
                    stride.write(buf);
                }
                ExpKind::Terminate { target, stride } => {
                    target.write(buf);
                    stride.write(buf);
                }
                ExpKind::VTableSlot { target, index } => {
                    target.write(buf);
                    buf.put_uint(tags::INDEX, *index as u64);
                }
            }
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::EXP)?;
        let rank = reader.get_uint(tags::KIND)?;
        let exp = match rank {
            0 => Exp::make_var(Variable::read(reader)?),
            1 => Exp::make_drf(Exp::read(reader)?),
            2 => {
                let target = Exp::read(reader)?;
                let field = Field::read(reader)?;
                Exp::make_fld(target, field)
            }
            3 => {
                let target = Exp::read(reader)?;
                let element_type = Type::read(reader)?;
                let index = Exp::read(reader)?;
                Exp::make_index(target, element_type, index)
            }
            4 => {
                let text = reader.get_str(tags::INT_STR)?;
                let value = text
                    .parse::<i128>()
                    .map_err(|_| CheckerError::Truncated("integer constant"))?;
                Exp::make_int(value)
            }
            5 => {
                let op = unop_from(reader.get_uint(tags::INDEX)?)?;
                let operand = Exp::read(reader)?;
                let bits = reader.get_uint(tags::WIDTH)? as u32;
                let signed = reader.get_bool()?;
                Exp::make_unop(op, operand, bits, signed)
            }
            6 => {
                let op = binop_from(reader.get_uint(tags::INDEX)?)?;
                let left = Exp::read(reader)?;
                let right = Exp::read(reader)?;
                let bits = reader.get_uint(tags::WIDTH)? as u32;
                let signed = reader.get_bool()?;
                Exp::make_binop(op, left, right, bits, signed)
            }
            7 => {
                let kind = match reader.get_uint(tags::INDEX)? {
                    0 => BoundKind::Lower,
                    1 => BoundKind::Upper,
                    _ => return Err(CheckerError::Corrupt(tags::EXP)),
                };
                let target = Exp::read(reader)?;
                let stride = Type::read(reader)?;
                Exp::make_bound(kind, target, stride)
            }
            8 => {
                let target = Exp::read(reader)?;
                let stride = Type::read(reader)?;
                Exp::make_terminate(target, stride)
            }
            9 => {
                let target = Exp::read(reader)?;
                let index = reader.get_uint(tags::INDEX)? as u32;
                Exp::make_vtable_slot(target, index)
            }
            10 => Exp::make_loop_entry(Exp::read(reader)?),
            _ => return Err(CheckerError::Corrupt(tags::EXP)),
        };
        reader.leave(outer);
        Ok(exp)
    }
}

fn unop_from(value: u64) -> CheckerResult<UnopKind> {
    Ok(match value {
        0 => UnopKind::Neg,
        1 => UnopKind::BitNot,
        2 => UnopKind::LogNot,
        _ => return Err(CheckerError::Corrupt(tags::EXP)),
    })
}

fn binop_from(value: u64) -> CheckerResult<BinopKind> {
    Ok(match value {
        0 => BinopKind::Plus,
        1 => BinopKind::Minus,
        2 => BinopKind::Mult,
        3 => BinopKind::Div,
        4 => BinopKind::Mod,
        5 => BinopKind::ShiftLeft,
        6 => BinopKind::ShiftRight,
        7 => BinopKind::BitAnd,
        8 => BinopKind::BitOr,
        9 => BinopKind::BitXor,
        10 => BinopKind::LessThan,
        11 => BinopKind::LessEqual,
        12 => BinopKind::GreaterThan,
        13 => BinopKind::GreaterEqual,
        14 => BinopKind::Equal,
        15 => BinopKind::NotEqual,
        _ => return Err(CheckerError::Corrupt(tags::EXP)),
    })
}

pub(super) fn scan_exp_leaks() -> usize {
    crate::hashcons::scan_leaks("exp", &EXP_TABLE).live
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Exp {
        let p = Exp::make_var(Variable::make_glob("p"));
        let n = Exp::make_var(Variable::make_glob("n"));
        Exp::make_index(p, Type::make_int(32, true), n)
    }

    #[test]
    fn test_exp_interning() {
        assert_eq!(sample(), sample());
        let other = Exp::make_drf(sample());
        assert_ne!(sample(), other);
    }

    #[test]
    fn test_exp_roundtrip() {
        let exp = Exp::make_compare(
            BinopKind::LessThan,
            sample(),
            Exp::make_bound(BoundKind::Upper, sample(), Type::make_int(32, true)),
        );
        let mut buf = Buffer::new();
        exp.write(&mut buf);
        let bytes = buf.into_bytes();
        let mut reader = Reader::new(&bytes);
        assert_eq!(exp, Exp::read(&mut reader).unwrap());
    }

    #[test]
    fn test_int_constant_roundtrip() {
        for value in [0i128, -1, i128::from(u64::MAX), i128::from(i64::MIN)] {
            let exp = Exp::make_int(value);
            let mut buf = Buffer::new();
            exp.write(&mut buf);
            let bytes = buf.into_bytes();
            let mut reader = Reader::new(&bytes);
            assert_eq!(exp, Exp::read(&mut reader).unwrap());
        }
    }

    #[test]
    fn test_visit_lvalues_write_context() {
        // in x[i] = y, the write lands on x[i]; x and i are reads.
        let x = Exp::make_var(Variable::make_glob("x"));
        let i = Exp::make_var(Variable::make_glob("i"));
        let access = Exp::make_index(x.clone(), Type::make_int(32, true), i.clone());

        let mut seen = Vec::new();
        access.visit_lvalues(true, &mut |exp, write| seen.push((exp.clone(), write)));

        assert!(seen.contains(&(access.clone(), true)));
        assert!(seen.contains(&(x, false)));
        assert!(seen.contains(&(i, false)));
    }

    #[test]
    fn test_map_substitutes() {
        let x = Exp::make_var(Variable::make_glob("x"));
        let y = Exp::make_var(Variable::make_glob("y"));
        let drf = Exp::make_drf(x.clone());
        let mapped = drf.map(&mut |exp| (*exp == x).then(|| y.clone()));
        assert_eq!(mapped, Exp::make_drf(y));
    }
}
