// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::fmt;

use checker_config::INTERN_MIN_BUCKETS;

use crate::error::{CheckerError, CheckerResult};
use crate::hashcons::{hash_bytes, hash_combine, InternKey, Interned, Interner};
use crate::serialize::{tags, Buffer, Reader, Serial};

use super::{Location, Variable};

/// Source-level types, interned.
#[derive(Debug)]
pub enum TypeKind {
    Void,
    /// Placeholder for types the frontend could not resolve.
    Error,
    Int {
        bits: u32,
        signed: bool,
    },
    Float {
        bits: u32,
    },
    Pointer {
        target: Type,
        width: u32,
    },
    Array {
        element: Type,
        count: u64,
    },
    /// Class/struct/union, referenced by name; the definition lives in a
    /// [`CompositeCsu`].
    Csu {
        name: String,
    },
    Function {
        ret: Type,
        /// Name of the CSU for the receiver of an instance method.
        this_csu: Option<String>,
        varargs: bool,
        args: Vec<Type>,
    },
}

pub type Type = Interned<TypeKind>;

static TYPE_TABLE: Interner<TypeKind> = Interner::new(INTERN_MIN_BUCKETS);

fn kind_rank(kind: &TypeKind) -> u32 {
    match kind {
        TypeKind::Void => 0,
        TypeKind::Error => 1,
        TypeKind::Int { .. } => 2,
        TypeKind::Float { .. } => 3,
        TypeKind::Pointer { .. } => 4,
        TypeKind::Array { .. } => 5,
        TypeKind::Csu { .. } => 6,
        TypeKind::Function { .. } => 7,
    }
}

impl Type {
    pub fn make_void() -> Type {
        TYPE_TABLE.intern(TypeKind::Void)
    }

    pub fn make_error() -> Type {
        TYPE_TABLE.intern(TypeKind::Error)
    }

    pub fn make_int(bits: u32, signed: bool) -> Type {
        TYPE_TABLE.intern(TypeKind::Int { bits, signed })
    }

    pub fn make_float(bits: u32) -> Type {
        TYPE_TABLE.intern(TypeKind::Float { bits })
    }

    pub fn make_pointer(target: Type, width: u32) -> Type {
        TYPE_TABLE.intern(TypeKind::Pointer { target, width })
    }

    pub fn make_array(element: Type, count: u64) -> Type {
        TYPE_TABLE.intern(TypeKind::Array { element, count })
    }

    pub fn make_csu(name: &str) -> Type {
        TYPE_TABLE.intern(TypeKind::Csu {
            name: name.to_string(),
        })
    }

    pub fn make_function(
        ret: Type,
        this_csu: Option<&str>,
        varargs: bool,
        args: Vec<Type>,
    ) -> Type {
        TYPE_TABLE.intern(TypeKind::Function {
            ret,
            this_csu: this_csu.map(str::to_string),
            varargs,
            args,
        })
    }

    /// Bit width of integer types, `None` otherwise.
    pub fn int_bits(&self) -> Option<(u32, bool)> {
        match &**self {
            TypeKind::Int { bits, signed } => Some((*bits, *signed)),
            _ => None,
        }
    }

    pub fn csu_name(&self) -> Option<&str> {
        match &**self {
            TypeKind::Csu { name } => Some(name),
            _ => None,
        }
    }

    /// For a function type, the CSU receiving an indirect virtual call.
    pub fn call_csu(&self) -> Option<&str> {
        match &**self {
            TypeKind::Function { this_csu, .. } => this_csu.as_deref(),
            _ => None,
        }
    }

    pub fn argument_count(&self) -> Option<usize> {
        match &**self {
            TypeKind::Function { args, .. } => Some(args.len()),
            _ => None,
        }
    }
}

impl InternKey for TypeKind {
    fn content_hash(&self) -> u32 {
        let hash = hash_combine(0x7f1a, kind_rank(self));
        match self {
            TypeKind::Void | TypeKind::Error => hash,
            TypeKind::Int { bits, signed } => {
                hash_combine(hash_combine(hash, *bits), *signed as u32)
            }
            TypeKind::Float { bits } => hash_combine(hash, *bits),
            TypeKind::Pointer { target, width } => {
                hash_combine(hash_combine(hash, target.hash()), *width)
            }
            TypeKind::Array { element, count } => {
                hash_combine(hash_combine(hash, element.hash()), *count as u32)
            }
            TypeKind::Csu { name } => hash_bytes(hash, name.as_bytes()),
            TypeKind::Function {
                ret,
                this_csu,
                varargs,
                args,
            } => {
                let mut hash = hash_combine(hash, ret.hash());
                if let Some(name) = this_csu {
                    hash = hash_bytes(hash, name.as_bytes());
                }
                hash = hash_combine(hash, *varargs as u32);
                for arg in args {
                    hash = hash_combine(hash, arg.hash());
                }
                hash
            }
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        kind_rank(self)
            .cmp(&kind_rank(other))
            .then_with(|| match (self, other) {
                (TypeKind::Void, TypeKind::Void) | (TypeKind::Error, TypeKind::Error) => {
                    Ordering::Equal
                }
                (
                    TypeKind::Int { bits, signed },
                    TypeKind::Int {
                        bits: obits,
                        signed: osigned,
                    },
                ) => bits.cmp(obits).then(signed.cmp(osigned)),
                (TypeKind::Float { bits }, TypeKind::Float { bits: obits }) => bits.cmp(obits),
                (
                    TypeKind::Pointer { target, width },
                    TypeKind::Pointer {
                        target: otarget,
                        width: owidth,
                    },
                ) => target.cmp(otarget).then(width.cmp(owidth)),
                (
                    TypeKind::Array { element, count },
                    TypeKind::Array {
                        element: oelement,
                        count: ocount,
                    },
                ) => element.cmp(oelement).then(count.cmp(ocount)),
                (TypeKind::Csu { name }, TypeKind::Csu { name: oname }) => name.cmp(oname),
                (
                    TypeKind::Function {
                        ret,
                        this_csu,
                        varargs,
                        args,
                    },
                    TypeKind::Function {
                        ret: oret,
                        this_csu: othis,
                        varargs: ovarargs,
                        args: oargs,
                    },
                ) => ret
                    .cmp(oret)
                    .then_with(|| this_csu.cmp(othis))
                    .then_with(|| varargs.cmp(ovarargs))
                    .then_with(|| args.cmp(oargs)),
                _ => unreachable!("kind ranks already compared"),
            })
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKind::Void => write!(f, "void"),
            TypeKind::Error => write!(f, "<error>"),
            TypeKind::Int { bits, signed } => {
                write!(f, "{}int{}", if *signed { "" } else { "u" }, bits)
            }
            TypeKind::Float { bits } => write!(f, "float{bits}"),
            TypeKind::Pointer { target, .. } => write!(f, "{target}*"),
            TypeKind::Array { element, count } => write!(f, "{element}[{count}]"),
            TypeKind::Csu { name } => write!(f, "{name}"),
            TypeKind::Function { ret, args, .. } => {
                write!(f, "{ret}(")?;
                for (ind, arg) in args.iter().enumerate() {
                    if ind != 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl Serial for Type {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::TYPE, |buf| {
            buf.put_uint(tags::KIND, kind_rank(self) as u64);
            match &**self {
                TypeKind::Void | TypeKind::Error => {}
                TypeKind::Int { bits, signed } => {
                    buf.put_uint(tags::WIDTH, *bits as u64);
                    buf.put_bool(*signed);
                }
                TypeKind::Float { bits } => buf.put_uint(tags::WIDTH, *bits as u64),
                TypeKind::Pointer { target, width } => {
                    target.write(buf);
                    buf.put_uint(tags::WIDTH, *width as u64);
                }
                TypeKind::Array { element, count } => {
                    element.write(buf);
                    buf.put_uint(tags::COUNT, *count);
                }
                TypeKind::Csu { name } => buf.put_str(tags::NAME, name),
                TypeKind::Function {
                    ret,
                    this_csu,
                    varargs,
                    args,
                } => {
                    ret.write(buf);
                    if let Some(name) = this_csu {
                        buf.put_str(tags::NAME, name);
                    }
                    buf.put_bool(*varargs);
                    for arg in args {
                        arg.write(buf);
                    }
                }
            }
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::TYPE)?;
        let rank = reader.get_uint(tags::KIND)?;
        let ty = match rank {
            0 => Type::make_void(),
            1 => Type::make_error(),
            2 => {
                let bits = reader.get_uint(tags::WIDTH)? as u32;
                let signed = reader.get_bool()?;
                Type::make_int(bits, signed)
            }
            3 => Type::make_float(reader.get_uint(tags::WIDTH)? as u32),
            4 => {
                let target = Type::read(reader)?;
                let width = reader.get_uint(tags::WIDTH)? as u32;
                Type::make_pointer(target, width)
            }
            5 => {
                let element = Type::read(reader)?;
                let count = reader.get_uint(tags::COUNT)?;
                Type::make_array(element, count)
            }
            6 => Type::make_csu(&reader.get_str(tags::NAME)?),
            7 => {
                let ret = Type::read(reader)?;
                let this_csu = if reader.peek() == Some(tags::NAME)
                    || reader.peek() == Some(tags::CACHE_STRING)
                {
                    Some(reader.get_str(tags::NAME)?)
                } else {
                    None
                };
                let varargs = reader.get_bool()?;
                let mut args = Vec::new();
                while !reader.at_end() {
                    args.push(Type::read(reader)?);
                }
                Type::make_function(ret, this_csu.as_deref(), varargs, args)
            }
            _ => return Err(CheckerError::Corrupt(tags::TYPE)),
        };
        reader.leave(outer);
        Ok(ty)
    }
}

/// A named member of a CSU, interned.
#[derive(Debug)]
pub struct FieldData {
    name: String,
    source_name: Option<String>,
    /// Name of the CSU this field belongs to.
    csu_name: String,
    field_type: Type,
    /// Instance methods are modelled as function fields.
    is_function: bool,
}

pub type Field = Interned<FieldData>;

static FIELD_TABLE: Interner<FieldData> = Interner::new(INTERN_MIN_BUCKETS);

impl Field {
    pub fn make(
        name: &str,
        source_name: Option<&str>,
        csu_name: &str,
        field_type: Type,
        is_function: bool,
    ) -> Field {
        FIELD_TABLE.intern(FieldData {
            name: name.to_string(),
            source_name: source_name.map(str::to_string),
            csu_name: csu_name.to_string(),
            field_type,
            is_function,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_name(&self) -> Option<&str> {
        self.source_name.as_deref()
    }

    pub fn csu_name(&self) -> &str {
        &self.csu_name
    }

    pub fn field_type(&self) -> &Type {
        &self.field_type
    }

    pub fn is_function(&self) -> bool {
        self.is_function
    }
}

impl InternKey for FieldData {
    fn content_hash(&self) -> u32 {
        let mut hash = hash_bytes(0x31c2, self.name.as_bytes());
        hash = hash_bytes(hash, self.csu_name.as_bytes());
        hash = hash_combine(hash, self.field_type.hash());
        hash_combine(hash, self.is_function as u32)
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.csu_name.cmp(&other.csu_name))
            .then_with(|| self.field_type.cmp(&other.field_type))
            .then_with(|| self.is_function.cmp(&other.is_function))
            .then_with(|| self.source_name.cmp(&other.source_name))
    }
}

impl fmt::Display for FieldData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.csu_name, self.name)
    }
}

impl Serial for Field {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::FIELD, |buf| {
            buf.put_str(tags::NAME, self.name());
            if let Some(source) = self.source_name() {
                buf.put_str(tags::STRING, source);
            }
            buf.put_str(tags::COMPOSITE_CSU, self.csu_name());
            self.field_type().clone().write(buf);
            buf.put_bool(self.is_function());
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::FIELD)?;
        let name = reader.get_str(tags::NAME)?;
        let source_name = if reader.peek() == Some(tags::STRING) {
            Some(reader.get_str(tags::STRING)?)
        } else {
            None
        };
        let csu_name = reader.get_str(tags::COMPOSITE_CSU)?;
        let field_type = Type::read(reader)?;
        let is_function = reader.get_bool()?;
        reader.leave(outer);
        Ok(Field::make(
            &name,
            source_name.as_deref(),
            &csu_name,
            field_type,
            is_function,
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CsuKind {
    Class,
    Struct,
    Union,
}

/// A data field of a CSU together with its byte offset.
#[derive(Debug, Clone)]
pub struct DataField {
    pub field: Field,
    pub offset: u64,
}

/// A virtual function slot: the function field plus the resolved function
/// variable, when the frontend resolved it.
#[derive(Debug, Clone)]
pub struct FunctionField {
    pub field: Field,
    pub base: Option<String>,
    pub function: Option<Variable>,
}

/// Definition of a class/struct/union, interned by name and shape.
#[derive(Debug)]
pub struct CompositeCsuData {
    kind: CsuKind,
    name: String,
    width: u64,
    begin_location: Location,
    end_location: Location,
    base_classes: Vec<String>,
    data_fields: Vec<DataField>,
    function_fields: Vec<FunctionField>,
}

pub type CompositeCsu = Interned<CompositeCsuData>;

static CSU_TABLE: Interner<CompositeCsuData> = Interner::new(INTERN_MIN_BUCKETS);

impl CompositeCsu {
    #[allow(clippy::too_many_arguments)]
    pub fn make(
        kind: CsuKind,
        name: &str,
        width: u64,
        begin_location: Location,
        end_location: Location,
        base_classes: Vec<String>,
        data_fields: Vec<DataField>,
        function_fields: Vec<FunctionField>,
    ) -> CompositeCsu {
        CSU_TABLE.intern(CompositeCsuData {
            kind,
            name: name.to_string(),
            width,
            begin_location,
            end_location,
            base_classes,
            data_fields,
            function_fields,
        })
    }

    pub fn kind(&self) -> CsuKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> u64 {
        self.width
    }

    pub fn begin_location(&self) -> &Location {
        &self.begin_location
    }

    pub fn end_location(&self) -> &Location {
        &self.end_location
    }

    pub fn base_classes(&self) -> &[String] {
        &self.base_classes
    }

    pub fn data_fields(&self) -> &[DataField] {
        &self.data_fields
    }

    pub fn function_fields(&self) -> &[FunctionField] {
        &self.function_fields
    }
}

impl InternKey for CompositeCsuData {
    fn content_hash(&self) -> u32 {
        let mut hash = hash_bytes(0x5ac3, self.name.as_bytes());
        hash = hash_combine(hash, self.kind as u32);
        hash = hash_combine(hash, self.width as u32);
        for base in &self.base_classes {
            hash = hash_bytes(hash, base.as_bytes());
        }
        for DataField { field, offset } in &self.data_fields {
            hash = hash_combine(hash_combine(hash, field.hash()), *offset as u32);
        }
        for entry in &self.function_fields {
            hash = hash_combine(hash, entry.field.hash());
        }
        hash
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.width.cmp(&other.width))
            .then_with(|| self.base_classes.cmp(&other.base_classes))
            .then_with(|| {
                self.data_fields
                    .len()
                    .cmp(&other.data_fields.len())
                    .then_with(|| {
                        for (a, b) in self.data_fields.iter().zip(&other.data_fields) {
                            let ord = a.field.cmp(&b.field).then(a.offset.cmp(&b.offset));
                            if ord != Ordering::Equal {
                                return ord;
                            }
                        }
                        Ordering::Equal
                    })
            })
            .then_with(|| {
                self.function_fields
                    .len()
                    .cmp(&other.function_fields.len())
                    .then_with(|| {
                        for (a, b) in self.function_fields.iter().zip(&other.function_fields) {
                            let ord = a
                                .field
                                .cmp(&b.field)
                                .then_with(|| a.base.cmp(&b.base))
                                .then_with(|| a.function.cmp(&b.function));
                            if ord != Ordering::Equal {
                                return ord;
                            }
                        }
                        Ordering::Equal
                    })
            })
            .then_with(|| self.begin_location.cmp(&other.begin_location))
            .then_with(|| self.end_location.cmp(&other.end_location))
    }
}

impl fmt::Display for CompositeCsuData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            CsuKind::Class => "class",
            CsuKind::Struct => "struct",
            CsuKind::Union => "union",
        };
        write!(f, "{kind} {}", self.name)
    }
}

impl Serial for CompositeCsu {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::COMPOSITE_CSU, |buf| {
            buf.put_uint(tags::KIND, self.kind() as u64);
            buf.put_str(tags::NAME, self.name());
            buf.put_uint(tags::WIDTH, self.width());
            self.begin_location().clone().write(buf);
            self.end_location().clone().write(buf);
            for base in self.base_classes() {
                buf.put_str(tags::BASE_CLASS, base);
            }
            for DataField { field, offset } in self.data_fields() {
                buf.open(tags::DATA_FIELD, |buf| {
                    field.write(buf);
                    buf.put_uint(tags::OFFSET, *offset);
                });
            }
            for entry in self.function_fields() {
                buf.open(tags::FUNCTION_FIELD, |buf| {
                    entry.field.write(buf);
                    if let Some(base) = &entry.base {
                        buf.put_str(tags::BASE_CLASS, base);
                    }
                    if let Some(function) = &entry.function {
                        function.write(buf);
                    }
                });
            }
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::COMPOSITE_CSU)?;
        let kind = match reader.get_uint(tags::KIND)? {
            0 => CsuKind::Class,
            1 => CsuKind::Struct,
            2 => CsuKind::Union,
            _ => return Err(CheckerError::Corrupt(tags::COMPOSITE_CSU)),
        };
        let name = reader.get_str(tags::NAME)?;
        let width = reader.get_uint(tags::WIDTH)?;
        let begin_location = Location::read(reader)?;
        let end_location = Location::read(reader)?;

        let mut base_classes = Vec::new();
        let mut data_fields = Vec::new();
        let mut function_fields = Vec::new();
        while !reader.at_end() {
            match reader.peek() {
                Some(tags::BASE_CLASS) | Some(tags::CACHE_STRING) => {
                    base_classes.push(reader.get_str(tags::BASE_CLASS)?);
                }
                Some(tags::DATA_FIELD) => {
                    let inner = reader.enter(tags::DATA_FIELD)?;
                    let field = Field::read(reader)?;
                    let offset = reader.get_uint(tags::OFFSET)?;
                    reader.leave(inner);
                    data_fields.push(DataField { field, offset });
                }
                Some(tags::FUNCTION_FIELD) => {
                    let inner = reader.enter(tags::FUNCTION_FIELD)?;
                    let field = Field::read(reader)?;
                    let base = if reader.peek() == Some(tags::BASE_CLASS)
                        || reader.peek() == Some(tags::CACHE_STRING)
                    {
                        Some(reader.get_str(tags::BASE_CLASS)?)
                    } else {
                        None
                    };
                    let function = if reader.at_end() {
                        None
                    } else {
                        Some(Variable::read(reader)?)
                    };
                    reader.leave(inner);
                    function_fields.push(FunctionField {
                        field,
                        base,
                        function,
                    });
                }
                Some(tag) => return Err(CheckerError::Corrupt(tag)),
                None => break,
            }
        }
        reader.leave(outer);

        Ok(CompositeCsu::make(
            kind,
            &name,
            width,
            begin_location,
            end_location,
            base_classes,
            data_fields,
            function_fields,
        ))
    }
}

pub(super) fn scan_type_leaks() -> usize {
    crate::hashcons::scan_leaks("type", &TYPE_TABLE).live
        + crate::hashcons::scan_leaks("field", &FIELD_TABLE).live
        + crate::hashcons::scan_leaks("csu", &CSU_TABLE).live
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_type_interning_injective() {
        let a = Type::make_int(32, true);
        let b = Type::make_int(32, true);
        assert_eq!(a, b);
        assert_ne!(a, Type::make_int(32, false));

        let pa = Type::make_pointer(a.clone(), 8);
        let pb = Type::make_pointer(b, 8);
        assert_eq!(pa, pb);
        assert_ne!(pa, Type::make_pointer(Type::make_void(), 8));
    }

    #[test]
    fn test_type_roundtrip() {
        let fun = Type::make_function(
            Type::make_void(),
            Some("list"),
            false,
            vec![
                Type::make_pointer(Type::make_int(8, true), 8),
                Type::make_array(Type::make_int(64, false), 16),
            ],
        );
        let mut buf = Buffer::new();
        fun.write(&mut buf);
        let bytes = buf.into_bytes();
        let mut reader = Reader::new(&bytes);
        let back = Type::read(&mut reader).unwrap();
        assert_eq!(fun, back);
    }

    #[test]
    fn test_csu_roundtrip() {
        let begin = Location::make("list.h", 10);
        let end = Location::make("list.h", 20);
        let next = Field::make(
            "next",
            None,
            "list",
            Type::make_pointer(Type::make_csu("list"), 8),
            false,
        );
        let csu = CompositeCsu::make(
            CsuKind::Struct,
            "list",
            16,
            begin,
            end,
            vec![],
            vec![DataField {
                field: next,
                offset: 0,
            }],
            vec![],
        );

        let mut buf = Buffer::new();
        csu.write(&mut buf);
        let bytes = buf.into_bytes();
        let mut reader = Reader::new(&bytes);
        assert_eq!(csu, CompositeCsu::read(&mut reader).unwrap());
    }
}
