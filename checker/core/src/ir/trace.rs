// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::fmt;

use checker_config::INTERN_MIN_BUCKETS;

use crate::error::{CheckerError, CheckerResult};
use crate::hashcons::{hash_bytes, hash_combine, InternKey, Interned, Interner};
use crate::serialize::{tags, Buffer, Reader, Serial};

use super::{BlockId, Exp, ExpKind, VarKind, Variable};

/// Canonical location identifiers keyed in the escape and callgraph
/// databases, interned. A trace abstracts an lvalue to the point where
/// aliasing information can be merged across blocks.
#[derive(Debug)]
pub enum TraceKind {
    /// An lvalue rooted in a local of a particular block.
    Func { block: BlockId, value: Exp },
    /// An lvalue rooted in a global variable.
    Glob { value: Exp },
    /// A field (or the virtual/base portion) of a CSU, independent of any
    /// particular object.
    Comp { csu: String, value: Option<Exp> },
}

pub type Trace = Interned<TraceKind>;

static TRACE_TABLE: Interner<TraceKind> = Interner::new(INTERN_MIN_BUCKETS);

fn kind_rank(kind: &TraceKind) -> u32 {
    match kind {
        TraceKind::Func { .. } => 0,
        TraceKind::Glob { .. } => 1,
        TraceKind::Comp { .. } => 2,
    }
}

impl Trace {
    pub fn make_func(block: BlockId, value: Exp) -> Trace {
        TRACE_TABLE.intern(TraceKind::Func { block, value })
    }

    pub fn make_glob(value: Exp) -> Trace {
        TRACE_TABLE.intern(TraceKind::Glob { value })
    }

    pub fn make_comp(csu: &str, value: Option<Exp>) -> Trace {
        TRACE_TABLE.intern(TraceKind::Comp {
            csu: csu.to_string(),
            value,
        })
    }

    /// Abstract an lvalue within `block` to a trace. Index offsets are
    /// stripped so that all elements of a buffer share one trace. Returns
    /// `None` for expressions with no storage root.
    pub fn from_exp(block: &BlockId, exp: &Exp) -> Option<Trace> {
        let sanitized = Trace::sanitize_exp(exp)?;
        let root = sanitized.root_var()?.clone();
        if root.is_global() {
            Some(Trace::make_glob(sanitized))
        } else {
            Some(Trace::make_func(block.clone(), sanitized))
        }
    }

    /// Strip index offsets from an lvalue path, collapsing `a[i]` to the
    /// dereference of `a`. Non-lvalues sanitize to `None`.
    pub fn sanitize_exp(exp: &Exp) -> Option<Exp> {
        match &**exp {
            ExpKind::Var(_) => Some(exp.clone()),
            ExpKind::Drf(target) => Some(Exp::make_drf(Trace::sanitize_exp(target)?)),
            ExpKind::Fld { target, field } => {
                Some(Exp::make_fld(Trace::sanitize_exp(target)?, field.clone()))
            }
            ExpKind::Index { target, .. } => Some(Exp::make_drf(Trace::sanitize_exp(target)?)),
            ExpKind::VTableSlot { target, index } => {
                Some(Exp::make_vtable_slot(Trace::sanitize_exp(target)?, *index))
            }
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&Exp> {
        match &**self {
            TraceKind::Func { value, .. } | TraceKind::Glob { value } => Some(value),
            TraceKind::Comp { value, .. } => value.as_ref(),
        }
    }

    pub fn block(&self) -> Option<&BlockId> {
        match &**self {
            TraceKind::Func { block, .. } => Some(block),
            _ => None,
        }
    }

    pub fn csu_name(&self) -> Option<&str> {
        match &**self {
            TraceKind::Comp { csu, .. } => Some(csu),
            _ => None,
        }
    }

    /// If this trace names a global function, that function.
    pub fn trace_function(&self) -> Option<&Variable> {
        match &**self {
            TraceKind::Glob { value } => {
                let var = value.if_var()?;
                (var.kind() == VarKind::Func).then_some(var)
            }
            _ => None,
        }
    }

    /// Broader traces subsuming this one, least specific first and ending
    /// with the trace itself. A field access in some block also matches the
    /// field's CSU trace, which is where cross-block escape edges join.
    pub fn matches(&self) -> Vec<Trace> {
        let mut result = Vec::new();
        if let Some(value) = self.value() {
            if let Some(field) = value.base_field() {
                if self.csu_name() != Some(field.csu_name()) {
                    result.push(Trace::make_comp(
                        field.csu_name(),
                        Some(Exp::make_fld(
                            Exp::make_drf(Exp::make_var(Variable::make_glob("this"))),
                            field.clone(),
                        )),
                    ));
                }
            }
        }
        result.push(self.clone());
        result
    }

    /// Key of this trace in the escape databases.
    pub fn database_key(&self) -> String {
        match &**self {
            TraceKind::Func { block, .. } => format!("func:{}", block.function()),
            TraceKind::Glob { value } => {
                let name = value
                    .root_var()
                    .map(|var| var.name().to_string())
                    .unwrap_or_default();
                format!("glob:{name}")
            }
            TraceKind::Comp { csu, value } => {
                // regular fields key by name; virtual function or base
                // class information keys on the bare CSU.
                let field = value
                    .as_ref()
                    .and_then(|value| value.base_field())
                    .filter(|field| !field.is_function());
                match field {
                    Some(field) => format!("comp:{csu}:{}", field.name()),
                    None => format!("comp:{csu}"),
                }
            }
        }
    }
}

impl InternKey for TraceKind {
    fn content_hash(&self) -> u32 {
        let hash = hash_combine(0x8d3b, kind_rank(self));
        match self {
            TraceKind::Func { block, value } => {
                hash_combine(hash_combine(hash, block.hash()), value.hash())
            }
            TraceKind::Glob { value } => hash_combine(hash, value.hash()),
            TraceKind::Comp { csu, value } => {
                let hash = hash_bytes(hash, csu.as_bytes());
                match value {
                    Some(value) => hash_combine(hash, value.hash()),
                    None => hash,
                }
            }
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        kind_rank(self)
            .cmp(&kind_rank(other))
            .then_with(|| match (self, other) {
                (
                    TraceKind::Func { block, value },
                    TraceKind::Func {
                        block: oblock,
                        value: ovalue,
                    },
                ) => block.cmp(oblock).then_with(|| value.cmp(ovalue)),
                (TraceKind::Glob { value }, TraceKind::Glob { value: ovalue }) => {
                    value.cmp(ovalue)
                }
                (
                    TraceKind::Comp { csu, value },
                    TraceKind::Comp {
                        csu: ocsu,
                        value: ovalue,
                    },
                ) => csu.cmp(ocsu).then_with(|| value.cmp(ovalue)),
                _ => unreachable!("kind ranks already compared"),
            })
    }
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceKind::Func { block, value } => write!(f, "func({block}, {value})"),
            TraceKind::Glob { value } => write!(f, "glob({value})"),
            TraceKind::Comp { csu, value: Some(value) } => write!(f, "comp({csu}, {value})"),
            TraceKind::Comp { csu, value: None } => write!(f, "comp({csu})"),
        }
    }
}

impl Serial for Trace {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::TRACE, |buf| {
            buf.put_uint(tags::KIND, kind_rank(self) as u64);
            match &**self {
                TraceKind::Func { block, value } => {
                    block.write(buf);
                    value.write(buf);
                }
                TraceKind::Glob { value } => value.write(buf),
                TraceKind::Comp { csu, value } => {
                    buf.put_str(tags::NAME, csu);
                    if let Some(value) = value {
                        value.write(buf);
                    }
                }
            }
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::TRACE)?;
        let trace = match reader.get_uint(tags::KIND)? {
            0 => {
                let block = BlockId::read(reader)?;
                let value = Exp::read(reader)?;
                Trace::make_func(block, value)
            }
            1 => Trace::make_glob(Exp::read(reader)?),
            2 => {
                let csu = reader.get_str(tags::NAME)?;
                let value = if reader.at_end() {
                    None
                } else {
                    Some(Exp::read(reader)?)
                };
                Trace::make_comp(&csu, value)
            }
            _ => return Err(CheckerError::Corrupt(tags::TRACE)),
        };
        reader.leave(outer);
        Ok(trace)
    }
}

pub(super) fn scan_trace_leaks() -> usize {
    crate::hashcons::scan_leaks("trace", &TRACE_TABLE).live
}

#[cfg(test)]
mod test {
    use super::super::{BlockKind, Type};
    use super::*;

    fn block() -> BlockId {
        BlockId::make(BlockKind::Function, Variable::make_func("f"), None)
    }

    #[test]
    fn test_from_exp_strips_indexes() {
        let id = block();
        let p = Exp::make_var(Variable::make(Some(id.clone()), VarKind::Local, "p", None));
        let i = Exp::make_var(Variable::make(Some(id.clone()), VarKind::Local, "i", None));
        let access = Exp::make_index(p.clone(), Type::make_int(32, true), i);

        let indexed = Trace::from_exp(&id, &access).unwrap();
        let deref = Trace::from_exp(&id, &Exp::make_drf(p)).unwrap();
        assert_eq!(indexed, deref);
    }

    #[test]
    fn test_database_keys() {
        let id = block();
        let local = Exp::make_var(Variable::make(Some(id.clone()), VarKind::Local, "x", None));
        assert_eq!(Trace::from_exp(&id, &local).unwrap().database_key(), "func:f");

        let global = Exp::make_var(Variable::make_glob("g"));
        assert_eq!(
            Trace::from_exp(&id, &global).unwrap().database_key(),
            "glob:g"
        );

        let field = super::super::Field::make("next", None, "list", Type::make_void(), false);
        let comp = Trace::make_comp(
            "list",
            Some(Exp::make_fld(
                Exp::make_drf(Exp::make_var(Variable::make_glob("this"))),
                field,
            )),
        );
        assert_eq!(comp.database_key(), "comp:list:next");
        assert_eq!(Trace::make_comp("list", None).database_key(), "comp:list");
    }

    #[test]
    fn test_trace_function() {
        let glob = Trace::make_glob(Exp::make_var(Variable::make_func("g")));
        assert_eq!(glob.trace_function().unwrap().name(), "g");

        let data = Trace::make_glob(Exp::make_var(Variable::make_glob("g")));
        assert!(data.trace_function().is_none());
    }

    #[test]
    fn test_trace_roundtrip() {
        let id = block();
        let local = Exp::make_var(Variable::make(Some(id.clone()), VarKind::Local, "x", None));
        for trace in [
            Trace::from_exp(&id, &local).unwrap(),
            Trace::make_glob(Exp::make_var(Variable::make_glob("g"))),
            Trace::make_comp("list", None),
        ] {
            let mut buf = Buffer::new();
            trace.write(&mut buf);
            let bytes = buf.into_bytes();
            let mut reader = Reader::new(&bytes);
            assert_eq!(trace, Trace::read(&mut reader).unwrap());
        }
    }
}
