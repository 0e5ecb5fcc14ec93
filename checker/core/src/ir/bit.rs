// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::fmt;

use checker_config::INTERN_MIN_BUCKETS;
use itertools::Itertools;

use crate::error::{CheckerError, CheckerResult};
use crate::hashcons::{hash_combine, InternKey, Interned, Interner};
use crate::serialize::{tags, Buffer, Reader, Serial};

use super::{BinopKind, Exp};

/// Propositional formulas over expressions, interned. Constructors perform
/// constant folding, flattening and operand canonicalization; full BDD-style
/// canonicalization is out of scope.
#[derive(Debug)]
pub enum BitKind {
    False,
    True,
    /// The expression is non-zero.
    Exp(Exp),
    Not(Bit),
    And(Vec<Bit>),
    Or(Vec<Bit>),
}

pub type Bit = Interned<BitKind>;

static BIT_TABLE: Interner<BitKind> = Interner::new(INTERN_MIN_BUCKETS);

fn kind_rank(kind: &BitKind) -> u32 {
    match kind {
        BitKind::False => 0,
        BitKind::True => 1,
        BitKind::Exp(_) => 2,
        BitKind::Not(_) => 3,
        BitKind::And(_) => 4,
        BitKind::Or(_) => 5,
    }
}

impl Bit {
    pub fn make_false() -> Bit {
        BIT_TABLE.intern(BitKind::False)
    }

    pub fn make_true() -> Bit {
        BIT_TABLE.intern(BitKind::True)
    }

    pub fn make_exp(exp: Exp) -> Bit {
        if let Some(value) = exp.if_int() {
            return if value != 0 {
                Bit::make_true()
            } else {
                Bit::make_false()
            };
        }
        // comparisons of two constants fold immediately.
        if let super::ExpKind::Binop {
            op, left, right, ..
        } = &*exp
        {
            if let (Some(left), Some(right)) = (left.if_int(), right.if_int()) {
                let value = match op {
                    BinopKind::LessThan => Some(left < right),
                    BinopKind::LessEqual => Some(left <= right),
                    BinopKind::GreaterThan => Some(left > right),
                    BinopKind::GreaterEqual => Some(left >= right),
                    BinopKind::Equal => Some(left == right),
                    BinopKind::NotEqual => Some(left != right),
                    _ => None,
                };
                match value {
                    Some(true) => return Bit::make_true(),
                    Some(false) => return Bit::make_false(),
                    None => {}
                }
            }
        }
        BIT_TABLE.intern(BitKind::Exp(exp))
    }

    /// Comparison bit `left op right`.
    pub fn make_compare(op: BinopKind, left: Exp, right: Exp) -> Bit {
        Bit::make_exp(Exp::make_compare(op, left, right))
    }

    pub fn make_not(bit: Bit) -> Bit {
        match &*bit {
            BitKind::False => Bit::make_true(),
            BitKind::True => Bit::make_false(),
            BitKind::Not(inner) => inner.clone(),
            _ => BIT_TABLE.intern(BitKind::Not(bit)),
        }
    }

    pub fn make_and(operands: Vec<Bit>) -> Bit {
        let mut flat = Vec::new();
        for bit in operands {
            match &*bit {
                BitKind::True => {}
                BitKind::False => return Bit::make_false(),
                BitKind::And(inner) => flat.extend(inner.iter().cloned()),
                _ => flat.push(bit),
            }
        }
        flat.sort();
        flat.dedup();
        match flat.len() {
            0 => Bit::make_true(),
            1 => flat.pop().unwrap(),
            _ => BIT_TABLE.intern(BitKind::And(flat)),
        }
    }

    pub fn make_or(operands: Vec<Bit>) -> Bit {
        let mut flat = Vec::new();
        for bit in operands {
            match &*bit {
                BitKind::False => {}
                BitKind::True => return Bit::make_true(),
                BitKind::Or(inner) => flat.extend(inner.iter().cloned()),
                _ => flat.push(bit),
            }
        }
        flat.sort();
        flat.dedup();
        match flat.len() {
            0 => Bit::make_false(),
            1 => flat.pop().unwrap(),
            _ => BIT_TABLE.intern(BitKind::Or(flat)),
        }
    }

    pub fn make_imply(antecedent: Bit, consequent: Bit) -> Bit {
        Bit::make_or(vec![Bit::make_not(antecedent), consequent])
    }

    pub fn is_true(&self) -> bool {
        matches!(&**self, BitKind::True)
    }

    pub fn is_false(&self) -> bool {
        matches!(&**self, BitKind::False)
    }

    /// Rebuild the formula with every leaf expression passed through the
    /// mapper. A mapper returning `None` for a leaf keeps it.
    pub fn map_exps(&self, mapper: &mut impl FnMut(&Exp) -> Option<Exp>) -> Bit {
        match &**self {
            BitKind::False | BitKind::True => self.clone(),
            BitKind::Exp(exp) => Bit::make_exp(exp.map(mapper)),
            BitKind::Not(inner) => Bit::make_not(inner.map_exps(mapper)),
            BitKind::And(operands) => {
                Bit::make_and(operands.iter().map(|bit| bit.map_exps(mapper)).collect_vec())
            }
            BitKind::Or(operands) => {
                Bit::make_or(operands.iter().map(|bit| bit.map_exps(mapper)).collect_vec())
            }
        }
    }

    /// Visit every leaf expression of the formula.
    pub fn visit_exps(&self, visit: &mut impl FnMut(&Exp)) {
        match &**self {
            BitKind::False | BitKind::True => {}
            BitKind::Exp(exp) => visit(exp),
            BitKind::Not(inner) => inner.visit_exps(visit),
            BitKind::And(operands) | BitKind::Or(operands) => {
                for bit in operands {
                    bit.visit_exps(visit);
                }
            }
        }
    }
}

impl InternKey for BitKind {
    fn content_hash(&self) -> u32 {
        let hash = hash_combine(0x61b7, kind_rank(self));
        match self {
            BitKind::False | BitKind::True => hash,
            BitKind::Exp(exp) => hash_combine(hash, exp.hash()),
            BitKind::Not(inner) => hash_combine(hash, inner.hash()),
            BitKind::And(operands) | BitKind::Or(operands) => operands
                .iter()
                .fold(hash, |hash, bit| hash_combine(hash, bit.hash())),
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        kind_rank(self)
            .cmp(&kind_rank(other))
            .then_with(|| match (self, other) {
                (BitKind::False, BitKind::False) | (BitKind::True, BitKind::True) => {
                    Ordering::Equal
                }
                (BitKind::Exp(a), BitKind::Exp(b)) => a.cmp(b),
                (BitKind::Not(a), BitKind::Not(b)) => a.cmp(b),
                (BitKind::And(a), BitKind::And(b)) | (BitKind::Or(a), BitKind::Or(b)) => a.cmp(b),
                _ => unreachable!("kind ranks already compared"),
            })
    }
}

impl fmt::Display for BitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitKind::False => write!(f, "false"),
            BitKind::True => write!(f, "true"),
            BitKind::Exp(exp) => write!(f, "{exp}"),
            BitKind::Not(inner) => write!(f, "!({inner})"),
            BitKind::And(operands) => {
                write!(f, "(")?;
                for (ind, bit) in operands.iter().enumerate() {
                    if ind != 0 {
                        write!(f, " && ")?;
                    }
                    write!(f, "{bit}")?;
                }
                write!(f, ")")
            }
            BitKind::Or(operands) => {
                write!(f, "(")?;
                for (ind, bit) in operands.iter().enumerate() {
                    if ind != 0 {
                        write!(f, " || ")?;
                    }
                    write!(f, "{bit}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl Serial for Bit {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::BIT, |buf| {
            buf.put_uint(tags::KIND, kind_rank(self) as u64);
            match &**self {
                BitKind::False | BitKind::True => {}
                BitKind::Exp(exp) => exp.write(buf),
                BitKind::Not(inner) => inner.write(buf),
                BitKind::And(operands) | BitKind::Or(operands) => {
                    for bit in operands {
                        bit.write(buf);
                    }
                }
            }
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::BIT)?;
        let rank = reader.get_uint(tags::KIND)?;
        let bit = match rank {
            0 => Bit::make_false(),
            1 => Bit::make_true(),
            2 => Bit::make_exp(Exp::read(reader)?),
            3 => Bit::make_not(Bit::read(reader)?),
            4 | 5 => {
                let mut operands = Vec::new();
                while !reader.at_end() {
                    operands.push(Bit::read(reader)?);
                }
                if rank == 4 {
                    Bit::make_and(operands)
                } else {
                    Bit::make_or(operands)
                }
            }
            _ => return Err(CheckerError::Corrupt(tags::BIT)),
        };
        reader.leave(outer);
        Ok(bit)
    }
}

pub(super) fn scan_bit_leaks() -> usize {
    crate::hashcons::scan_leaks("bit", &BIT_TABLE).live
}

#[cfg(test)]
mod test {
    use super::super::Variable;
    use super::*;

    fn atom(name: &str) -> Bit {
        Bit::make_exp(Exp::make_var(Variable::make_glob(name)))
    }

    #[test]
    fn test_simplifications() {
        let a = atom("a");
        let b = atom("b");

        assert!(Bit::make_and(vec![a.clone(), Bit::make_false()]).is_false());
        assert!(Bit::make_or(vec![a.clone(), Bit::make_true()]).is_true());
        assert_eq!(Bit::make_and(vec![a.clone(), a.clone()]), a);
        assert_eq!(Bit::make_not(Bit::make_not(a.clone())), a);

        // operand order is canonicalized.
        assert_eq!(
            Bit::make_and(vec![a.clone(), b.clone()]),
            Bit::make_and(vec![b, a])
        );
    }

    #[test]
    fn test_bit_roundtrip() {
        let bit = Bit::make_imply(
            Bit::make_and(vec![atom("a"), atom("b")]),
            Bit::make_or(vec![atom("c"), Bit::make_not(atom("a"))]),
        );
        let mut buf = Buffer::new();
        bit.write(&mut buf);
        let bytes = buf.into_bytes();
        let mut reader = Reader::new(&bytes);
        assert_eq!(bit, Bit::read(&mut reader).unwrap());
    }
}
