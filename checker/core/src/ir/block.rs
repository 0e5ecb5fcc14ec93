// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::fmt;

use checker_config::INTERN_MIN_BUCKETS;

use crate::error::{CheckerError, CheckerResult};
use crate::hashcons::{hash_bytes, hash_combine, InternKey, Interned, Interner};
use crate::serialize::{tags, Buffer, Reader, Serial};

use super::{Bit, Exp, Location, Type, Variable};

/// Index of a program point within one CFG. Points are 1-based; an edge
/// target of 0 denotes the abnormal exit.
pub type PPoint = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockKind {
    /// A function before loop splitting.
    FunctionWhole,
    /// The loop-free outer body of a function.
    Function,
    /// One loop carved out of a function.
    Loop,
    /// A global variable initializer.
    Initializer,
    AnnotationFunc,
    AnnotationInit,
    AnnotationComp,
    /// Identity-distinguished scratch block for analysis internals.
    Scratch,
}

/// Identifier of a CFG-bearing block, interned. Loop and annotation blocks
/// carry an extra name; loop names embed the source line
/// (`loop:<point>:<line>`) so reordering code inserts does not rename
/// stable loops.
#[derive(Debug)]
pub struct BlockIdData {
    kind: BlockKind,
    var: Variable,
    loop_name: Option<String>,
}

pub type BlockId = Interned<BlockIdData>;

static BLOCK_ID_TABLE: Interner<BlockIdData> = Interner::new(INTERN_MIN_BUCKETS);

impl BlockId {
    pub fn make(kind: BlockKind, var: Variable, loop_name: Option<&str>) -> BlockId {
        debug_assert!(
            match kind {
                BlockKind::FunctionWhole | BlockKind::Function | BlockKind::Initializer =>
                    loop_name.is_none(),
                BlockKind::Loop
                | BlockKind::AnnotationFunc
                | BlockKind::AnnotationInit
                | BlockKind::AnnotationComp => loop_name.is_some(),
                BlockKind::Scratch => true,
            },
            "loop name presence must match the block kind"
        );
        BLOCK_ID_TABLE.intern(BlockIdData {
            kind,
            var,
            loop_name: loop_name.map(str::to_string),
        })
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn base_var(&self) -> &Variable {
        &self.var
    }

    /// Name of the function or global this block belongs to.
    pub fn function(&self) -> &str {
        self.var.name()
    }

    pub fn loop_name(&self) -> Option<&str> {
        self.loop_name.as_deref()
    }

    /// Printable loop name carrying only the line, from the
    /// `loop:<point>:<line>` format.
    pub fn display_loop_name(&self) -> Option<String> {
        let name = self.loop_name.as_deref()?;
        let line = name.splitn(3, ':').nth(2)?;
        Some(format!("loop:{line}"))
    }
}

impl InternKey for BlockIdData {
    fn content_hash(&self) -> u32 {
        let mut hash = hash_combine(0x44d1, self.kind as u32);
        hash = hash_combine(hash, self.var.hash());
        if let Some(name) = &self.loop_name {
            hash = hash_bytes(hash, name.as_bytes());
        }
        hash
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| self.var.cmp(&other.var))
            .then_with(|| self.loop_name.cmp(&other.loop_name))
    }
}

impl fmt::Display for BlockIdData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.var.name())?;
        match self.kind {
            BlockKind::FunctionWhole => write!(f, ":whole"),
            BlockKind::Function => Ok(()),
            BlockKind::Loop => write!(f, ":{}", self.loop_name.as_deref().unwrap_or("")),
            BlockKind::Initializer => write!(f, ":init"),
            BlockKind::AnnotationFunc => {
                write!(f, ":annot_func:{}", self.loop_name.as_deref().unwrap_or(""))
            }
            BlockKind::AnnotationInit => {
                write!(f, ":annot_init:{}", self.loop_name.as_deref().unwrap_or(""))
            }
            BlockKind::AnnotationComp => {
                write!(f, ":annot_comp:{}", self.loop_name.as_deref().unwrap_or(""))
            }
            BlockKind::Scratch => write!(f, ":scratch"),
        }
    }
}

impl Serial for BlockId {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::BLOCK_ID, |buf| {
            buf.put_uint(tags::KIND, self.kind() as u64);
            self.base_var().write(buf);
            if let Some(name) = self.loop_name() {
                buf.put_str(tags::NAME, name);
            }
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::BLOCK_ID)?;
        let kind = match reader.get_uint(tags::KIND)? {
            0 => BlockKind::FunctionWhole,
            1 => BlockKind::Function,
            2 => BlockKind::Loop,
            3 => BlockKind::Initializer,
            4 => BlockKind::AnnotationFunc,
            5 => BlockKind::AnnotationInit,
            6 => BlockKind::AnnotationComp,
            7 => BlockKind::Scratch,
            _ => return Err(CheckerError::Corrupt(tags::BLOCK_ID)),
        };
        let var = Variable::read(reader)?;
        let loop_name = if reader.at_end() {
            None
        } else {
            Some(reader.get_str(tags::NAME)?)
        };
        reader.leave(outer);
        Ok(BlockId::make(kind, var, loop_name.as_deref()))
    }
}

/// A versioned program point: a block plus a point index within it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockPPoint {
    pub id: BlockId,
    pub point: PPoint,
}

impl BlockPPoint {
    pub fn new(id: BlockId, point: PPoint) -> BlockPPoint {
        BlockPPoint { id, point }
    }
}

impl fmt::Display for BlockPPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.point)
    }
}

impl Serial for BlockPPoint {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::BLOCK_PPOINT, |buf| {
            self.id.write(buf);
            buf.put_uint(tags::INDEX, self.point as u64);
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::BLOCK_PPOINT)?;
        let id = BlockId::read(reader)?;
        let point = reader.get_uint(tags::INDEX)? as u32;
        reader.leave(outer);
        Ok(BlockPPoint { id, point })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PEdgeKind {
    Skip,
    Assume {
        cond: Exp,
        sense: bool,
    },
    Assign {
        ty: Type,
        lhs: Exp,
        rhs: Exp,
    },
    Call {
        fn_type: Type,
        /// Lvalue receiving the return value, if the result is used.
        ret: Option<Exp>,
        /// Receiver object for instance calls.
        instance: Option<Exp>,
        callee: Exp,
        args: Vec<Exp>,
    },
    /// Summary edge for one iteration-free loop block.
    Loop {
        target: BlockId,
    },
    Assembly,
    Annotation {
        target: BlockId,
    },
}

/// An edge between two points of one CFG.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PEdge {
    pub source: PPoint,
    pub target: PPoint,
    pub kind: PEdgeKind,
}

impl PEdge {
    pub fn skip(source: PPoint, target: PPoint) -> PEdge {
        PEdge {
            source,
            target,
            kind: PEdgeKind::Skip,
        }
    }

    pub fn assume(source: PPoint, target: PPoint, cond: Exp, sense: bool) -> PEdge {
        PEdge {
            source,
            target,
            kind: PEdgeKind::Assume { cond, sense },
        }
    }

    pub fn assign(source: PPoint, target: PPoint, ty: Type, lhs: Exp, rhs: Exp) -> PEdge {
        PEdge {
            source,
            target,
            kind: PEdgeKind::Assign { ty, lhs, rhs },
        }
    }

    pub fn call(
        source: PPoint,
        target: PPoint,
        fn_type: Type,
        ret: Option<Exp>,
        instance: Option<Exp>,
        callee: Exp,
        args: Vec<Exp>,
    ) -> PEdge {
        PEdge {
            source,
            target,
            kind: PEdgeKind::Call {
                fn_type,
                ret,
                instance,
                callee,
                args,
            },
        }
    }

    pub fn loop_edge(source: PPoint, target: PPoint, loop_id: BlockId) -> PEdge {
        PEdge {
            source,
            target,
            kind: PEdgeKind::Loop { target: loop_id },
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self.kind, PEdgeKind::Skip)
    }

    pub fn if_assume(&self) -> Option<(&Exp, bool)> {
        match &self.kind {
            PEdgeKind::Assume { cond, sense } => Some((cond, *sense)),
            _ => None,
        }
    }

    pub fn if_assign(&self) -> Option<(&Type, &Exp, &Exp)> {
        match &self.kind {
            PEdgeKind::Assign { ty, lhs, rhs } => Some((ty, lhs, rhs)),
            _ => None,
        }
    }

    pub fn if_call(&self) -> Option<&PEdgeKind> {
        match &self.kind {
            kind @ PEdgeKind::Call { .. } => Some(kind),
            _ => None,
        }
    }

    pub fn if_loop(&self) -> Option<&BlockId> {
        match &self.kind {
            PEdgeKind::Loop { target } => Some(target),
            _ => None,
        }
    }

    pub fn if_annotation(&self) -> Option<&BlockId> {
        match &self.kind {
            PEdgeKind::Annotation { target } => Some(target),
            _ => None,
        }
    }

    /// For call edges, the statically-known callee function.
    /// 'Direct' calls to local variables from an unresolved frontend
    /// reference do not count.
    pub fn direct_function(&self) -> Option<Variable> {
        match &self.kind {
            PEdgeKind::Call { callee, .. } => {
                let var = callee.if_var()?;
                var.is_global().then(|| var.clone())
            }
            _ => None,
        }
    }

    pub fn call_args(&self) -> &[Exp] {
        match &self.kind {
            PEdgeKind::Call { args, .. } => args,
            _ => &[],
        }
    }

    fn kind_rank(&self) -> u32 {
        match self.kind {
            PEdgeKind::Skip => 0,
            PEdgeKind::Assume { .. } => 1,
            PEdgeKind::Assign { .. } => 2,
            PEdgeKind::Call { .. } => 3,
            PEdgeKind::Loop { .. } => 4,
            PEdgeKind::Assembly => 5,
            PEdgeKind::Annotation { .. } => 6,
        }
    }
}

impl fmt::Display for PEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}: ", self.source, self.target)?;
        match &self.kind {
            PEdgeKind::Skip => write!(f, "skip"),
            PEdgeKind::Assume { cond, sense } => {
                write!(f, "assume({}{cond})", if *sense { "" } else { "!" })
            }
            PEdgeKind::Assign { lhs, rhs, .. } => write!(f, "{lhs} := {rhs}"),
            PEdgeKind::Call { callee, args, .. } => {
                write!(f, "call {callee}(")?;
                for (ind, arg) in args.iter().enumerate() {
                    if ind != 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            PEdgeKind::Loop { target } => write!(f, "loop({target})"),
            PEdgeKind::Assembly => write!(f, "assembly"),
            PEdgeKind::Annotation { target } => write!(f, "annotation({target})"),
        }
    }
}

impl Serial for PEdge {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::PEDGE, |buf| {
            buf.put_uint(tags::KIND, self.kind_rank() as u64);
            buf.put_uint(tags::INDEX, self.source as u64);
            buf.put_uint(tags::INDEX, self.target as u64);
            match &self.kind {
                PEdgeKind::Skip | PEdgeKind::Assembly => {}
                PEdgeKind::Assume { cond, sense } => {
                    cond.write(buf);
                    buf.put_bool(*sense);
                }
                PEdgeKind::Assign { ty, lhs, rhs } => {
                    ty.write(buf);
                    lhs.write(buf);
                    rhs.write(buf);
                }
                PEdgeKind::Call {
                    fn_type,
                    ret,
                    instance,
                    callee,
                    args,
                } => {
                    fn_type.write(buf);
                    buf.put_bool(ret.is_some());
                    if let Some(ret) = ret {
                        ret.write(buf);
                    }
                    buf.put_bool(instance.is_some());
                    if let Some(instance) = instance {
                        instance.write(buf);
                    }
                    callee.write(buf);
                    for arg in args {
                        arg.write(buf);
                    }
                }
                PEdgeKind::Loop { target } | PEdgeKind::Annotation { target } => {
                    target.write(buf);
                }
            }
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::PEDGE)?;
        let rank = reader.get_uint(tags::KIND)?;
        let source = reader.get_uint(tags::INDEX)? as u32;
        let target = reader.get_uint(tags::INDEX)? as u32;
        let kind = match rank {
            0 => PEdgeKind::Skip,
            1 => {
                let cond = Exp::read(reader)?;
                let sense = reader.get_bool()?;
                PEdgeKind::Assume { cond, sense }
            }
            2 => {
                let ty = Type::read(reader)?;
                let lhs = Exp::read(reader)?;
                let rhs = Exp::read(reader)?;
                PEdgeKind::Assign { ty, lhs, rhs }
            }
            3 => {
                let fn_type = Type::read(reader)?;
                let ret = if reader.get_bool()? {
                    Some(Exp::read(reader)?)
                } else {
                    None
                };
                let instance = if reader.get_bool()? {
                    Some(Exp::read(reader)?)
                } else {
                    None
                };
                let callee = Exp::read(reader)?;
                let mut args = Vec::new();
                while !reader.at_end() {
                    args.push(Exp::read(reader)?);
                }
                PEdgeKind::Call {
                    fn_type,
                    ret,
                    instance,
                    callee,
                    args,
                }
            }
            4 => PEdgeKind::Loop {
                target: BlockId::read(reader)?,
            },
            5 => PEdgeKind::Assembly,
            6 => PEdgeKind::Annotation {
                target: BlockId::read(reader)?,
            },
            _ => return Err(CheckerError::Corrupt(tags::PEDGE)),
        };
        reader.leave(outer);
        Ok(PEdge {
            source,
            target,
            kind,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AnnotationKind {
    Invalid,
    Precondition,
    Postcondition,
    Invariant,
    Assert,
    AssertRuntime,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DefineVariable {
    pub var: Variable,
    pub ty: Type,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopHead {
    pub point: PPoint,
    pub end_location: Option<Location>,
}

/// Control-flow graph of one block.
///
/// CFGs are mutable while being constructed or post-processed; once stored
/// in a cache they are shared and no longer written. Scratch CFGs keep
/// their allocation identity and never reach the caches.
#[derive(Clone, Debug)]
pub struct BlockCfg {
    id: BlockId,
    begin_location: Location,
    end_location: Location,
    variables: Vec<DefineVariable>,
    /// For loop-split child CFGs, the points in ancestor blocks whose loop
    /// edge invokes this block.
    loop_parents: Vec<BlockPPoint>,
    /// Source location of each point; index 0 holds point 1.
    points: Vec<Location>,
    /// Points of the outer CFG isomorphic to a point in some loop body.
    loop_isomorphic: Vec<PPoint>,
    entry_point: PPoint,
    exit_point: PPoint,
    edges: Vec<PEdge>,
    loop_heads: Vec<LoopHead>,
    /// Intermediate assert annotations attached to points.
    point_annotations: Vec<(PPoint, BlockId)>,
    annotation_kind: AnnotationKind,
    annotation_bit: Option<Bit>,
}

impl BlockCfg {
    pub fn new(id: BlockId, begin_location: Location, end_location: Location) -> BlockCfg {
        BlockCfg {
            id,
            begin_location,
            end_location,
            variables: Vec::new(),
            loop_parents: Vec::new(),
            points: Vec::new(),
            loop_isomorphic: Vec::new(),
            entry_point: 0,
            exit_point: 0,
            edges: Vec::new(),
            loop_heads: Vec::new(),
            point_annotations: Vec::new(),
            annotation_kind: AnnotationKind::Invalid,
            annotation_bit: None,
        }
    }

    pub fn id(&self) -> &BlockId {
        &self.id
    }

    pub fn set_id(&mut self, id: BlockId) {
        self.id = id;
    }

    pub fn begin_location(&self) -> &Location {
        &self.begin_location
    }

    pub fn end_location(&self) -> &Location {
        &self.end_location
    }

    pub fn variables(&self) -> &[DefineVariable] {
        &self.variables
    }

    pub fn add_variable(&mut self, var: Variable, ty: Type) {
        if !self.variables.iter().any(|define| define.var == var) {
            self.variables.push(DefineVariable { var, ty });
        }
    }

    /// Find the local matching a variable hydrated from another block.
    pub fn find_matching_variable(&self, var: &Variable) -> Option<&Variable> {
        if var.is_global() {
            return None;
        }
        self.variables
            .iter()
            .map(|define| &define.var)
            .find(|local| local.matches(var))
    }

    pub fn loop_parents(&self) -> &[BlockPPoint] {
        &self.loop_parents
    }

    pub fn add_loop_parent(&mut self, parent: BlockPPoint) {
        self.loop_parents.push(parent);
    }

    /// Add a point with its source location; returns the 1-based index.
    pub fn add_point(&mut self, location: Location) -> PPoint {
        self.points.push(location);
        self.points.len() as PPoint
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn point_location(&self, point: PPoint) -> &Location {
        &self.points[(point - 1) as usize]
    }

    pub fn entry_point(&self) -> PPoint {
        self.entry_point
    }

    pub fn set_entry_point(&mut self, point: PPoint) {
        self.entry_point = point;
    }

    pub fn exit_point(&self) -> PPoint {
        self.exit_point
    }

    pub fn set_exit_point(&mut self, point: PPoint) {
        self.exit_point = point;
    }

    pub fn edges(&self) -> &[PEdge] {
        &self.edges
    }

    pub fn add_edge(&mut self, edge: PEdge) {
        self.edges.push(edge);
    }

    pub fn set_edges(&mut self, edges: Vec<PEdge>) {
        self.edges = edges;
    }

    pub fn outgoing(&self, point: PPoint) -> impl Iterator<Item = &PEdge> {
        self.edges.iter().filter(move |edge| edge.source == point)
    }

    pub fn incoming(&self, point: PPoint) -> impl Iterator<Item = &PEdge> {
        self.edges.iter().filter(move |edge| edge.target == point)
    }

    pub fn loop_heads(&self) -> &[LoopHead] {
        &self.loop_heads
    }

    pub fn add_loop_head(&mut self, point: PPoint, end_location: Option<Location>) {
        if !self.loop_heads.iter().any(|head| head.point == point) {
            self.loop_heads.push(LoopHead {
                point,
                end_location,
            });
        }
    }

    pub fn clear_loop_heads(&mut self) {
        self.loop_heads.clear();
    }

    pub fn is_loop_isomorphic(&self, point: PPoint) -> bool {
        self.loop_isomorphic.contains(&point)
    }

    pub fn add_loop_isomorphic(&mut self, point: PPoint) {
        if !self.loop_isomorphic.contains(&point) {
            self.loop_isomorphic.push(point);
        }
    }

    pub fn point_annotations(&self) -> &[(PPoint, BlockId)] {
        &self.point_annotations
    }

    pub fn add_point_annotation(&mut self, point: PPoint, annot: BlockId) {
        self.point_annotations.push((point, annot));
    }

    pub fn annotation_kind(&self) -> AnnotationKind {
        self.annotation_kind
    }

    pub fn set_annotation_kind(&mut self, kind: AnnotationKind) {
        self.annotation_kind = kind;
    }

    pub fn annotation_bit(&self) -> Option<&Bit> {
        self.annotation_bit.as_ref()
    }

    pub fn set_annotation_bit(&mut self, bit: Bit) {
        self.annotation_bit = Some(bit);
    }

    /// Check the structural invariants every hydrated or post-processed CFG
    /// must satisfy.
    pub fn validate(&self) -> CheckerResult<()> {
        let count = self.points.len() as PPoint;
        let in_range = |point: PPoint| point >= 1 && point <= count;

        if !in_range(self.entry_point) {
            return Err(CheckerError::TransactionFailed(format!(
                "{}: entry point {} out of range",
                self.id, self.entry_point
            )));
        }
        if self.exit_point != 0 && !in_range(self.exit_point) {
            return Err(CheckerError::TransactionFailed(format!(
                "{}: exit point {} out of range",
                self.id, self.exit_point
            )));
        }
        for edge in &self.edges {
            if !in_range(edge.source) || (edge.target != 0 && !in_range(edge.target)) {
                return Err(CheckerError::TransactionFailed(format!(
                    "{}: edge endpoints out of range: {edge}",
                    self.id
                )));
            }
        }
        for head in &self.loop_heads {
            if !in_range(head.point) {
                return Err(CheckerError::TransactionFailed(format!(
                    "{}: loop head {} out of range",
                    self.id, head.point
                )));
            }
        }
        for point in &self.loop_isomorphic {
            let mut outgoing = self.outgoing(*point);
            match (outgoing.next(), outgoing.next()) {
                (Some(edge), None) if edge.if_loop().is_some() => {}
                _ => {
                    return Err(CheckerError::TransactionFailed(format!(
                        "{}: isomorphic point {point} must have a single loop edge",
                        self.id
                    )))
                }
            }
        }

        if matches!(
            self.id.kind(),
            BlockKind::AnnotationFunc | BlockKind::AnnotationInit | BlockKind::AnnotationComp
        ) {
            // a single edge from entry to exit carrying the annotation:
            // either an assignment into __error__ or an assume on the
            // computed bit.
            if self.edges.len() != 1 {
                return Err(CheckerError::TransactionFailed(format!(
                    "{}: annotation CFG must have exactly one edge",
                    self.id
                )));
            }
            let edge = &self.edges[0];
            if edge.source != self.entry_point || edge.target != self.exit_point {
                return Err(CheckerError::TransactionFailed(format!(
                    "{}: annotation edge must span entry to exit",
                    self.id
                )));
            }
            let ok = match &edge.kind {
                PEdgeKind::Assign { lhs, .. } => lhs
                    .root_var()
                    .is_some_and(|var| var.name() == "__error__"),
                PEdgeKind::Assume { .. } => self.annotation_bit.is_some(),
                _ => false,
            };
            if !ok {
                return Err(CheckerError::TransactionFailed(format!(
                    "{}: malformed annotation edge",
                    self.id
                )));
            }
        }

        Ok(())
    }

    /// Structural equivalence used for incremental-build change detection:
    /// compares shape and primitive payloads, not identities of the blocks
    /// themselves.
    pub fn is_equivalent(&self, other: &BlockCfg) -> bool {
        self.id.kind() == other.id.kind()
            && self.id.loop_name() == other.id.loop_name()
            && self.annotation_kind == other.annotation_kind
            && self.entry_point == other.entry_point
            && self.exit_point == other.exit_point
            && self.points == other.points
            && self.edges == other.edges
            && self.loop_heads == other.loop_heads
            && self.loop_isomorphic == other.loop_isomorphic
            && self.variables == other.variables
    }
}

impl fmt::Display for BlockCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block: {}", self.id)?;
        writeln!(f, "pentry: {}", self.entry_point)?;
        writeln!(f, "pexit:  {}", self.exit_point)?;
        for (ind, location) in self.points.iter().enumerate() {
            write!(f, "point {}: {location}", ind + 1)?;
            if self.is_loop_isomorphic(ind as PPoint + 1) {
                write!(f, " [isomorphic]")?;
            }
            writeln!(f)?;
        }
        for head in &self.loop_heads {
            writeln!(f, "loophead: {}", head.point)?;
        }
        for edge in &self.edges {
            writeln!(f, "{edge}")?;
        }
        Ok(())
    }
}

impl Serial for BlockCfg {
    fn write(&self, buf: &mut Buffer) {
        buf.open(tags::BLOCK_CFG, |buf| {
            self.id.write(buf);
            self.begin_location.write(buf);
            self.end_location.write(buf);
            if self.annotation_kind != AnnotationKind::Invalid {
                buf.put_uint(tags::KIND, self.annotation_kind as u64);
            }
            for DefineVariable { var, ty } in &self.variables {
                buf.open(tags::DEFINE_VARIABLE, |buf| {
                    var.write(buf);
                    ty.write(buf);
                });
            }
            for parent in &self.loop_parents {
                parent.write(buf);
            }
            for location in &self.points {
                buf.open(tags::PPOINT, |buf| location.write(buf));
            }
            buf.put_uint(tags::INDEX, self.entry_point as u64);
            buf.put_uint(tags::INDEX, self.exit_point as u64);
            for edge in &self.edges {
                edge.write(buf);
            }
            for head in &self.loop_heads {
                buf.open(tags::LOOP_HEAD, |buf| {
                    buf.put_uint(tags::INDEX, head.point as u64);
                    if let Some(location) = &head.end_location {
                        location.write(buf);
                    }
                });
            }
            for point in &self.loop_isomorphic {
                buf.put_uint(tags::LOOP_ISOMORPHIC, *point as u64);
            }
            for (point, annot) in &self.point_annotations {
                buf.open(tags::BLOCK_PPOINT, |buf| {
                    buf.put_uint(tags::INDEX, *point as u64);
                    annot.write(buf);
                });
            }
            if let Some(bit) = &self.annotation_bit {
                bit.write(buf);
            }
        });
    }

    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self> {
        let outer = reader.enter(tags::BLOCK_CFG)?;
        let id = BlockId::read(reader)?;
        let begin_location = Location::read(reader)?;
        let end_location = Location::read(reader)?;
        let mut cfg = BlockCfg::new(id, begin_location, end_location);

        if reader.peek() == Some(tags::KIND) {
            cfg.annotation_kind = match reader.get_uint(tags::KIND)? {
                1 => AnnotationKind::Precondition,
                2 => AnnotationKind::Postcondition,
                3 => AnnotationKind::Invariant,
                4 => AnnotationKind::Assert,
                5 => AnnotationKind::AssertRuntime,
                _ => return Err(CheckerError::Corrupt(tags::BLOCK_CFG)),
            };
        }

        while reader.peek() == Some(tags::DEFINE_VARIABLE) {
            let inner = reader.enter(tags::DEFINE_VARIABLE)?;
            let var = Variable::read(reader)?;
            let ty = Type::read(reader)?;
            reader.leave(inner);
            cfg.variables.push(DefineVariable { var, ty });
        }

        while reader.peek() == Some(tags::BLOCK_PPOINT) {
            cfg.loop_parents.push(BlockPPoint::read(reader)?);
        }

        while reader.peek() == Some(tags::PPOINT) {
            let inner = reader.enter(tags::PPOINT)?;
            let location = Location::read(reader)?;
            reader.leave(inner);
            cfg.points.push(location);
        }

        cfg.entry_point = reader.get_uint(tags::INDEX)? as u32;
        cfg.exit_point = reader.get_uint(tags::INDEX)? as u32;

        while reader.peek() == Some(tags::PEDGE) {
            cfg.edges.push(PEdge::read(reader)?);
        }

        while reader.peek() == Some(tags::LOOP_HEAD) {
            let inner = reader.enter(tags::LOOP_HEAD)?;
            let point = reader.get_uint(tags::INDEX)? as u32;
            let end_location = if reader.at_end() {
                None
            } else {
                Some(Location::read(reader)?)
            };
            reader.leave(inner);
            cfg.loop_heads.push(LoopHead {
                point,
                end_location,
            });
        }

        while reader.peek() == Some(tags::LOOP_ISOMORPHIC) {
            cfg.loop_isomorphic
                .push(reader.get_uint(tags::LOOP_ISOMORPHIC)? as u32);
        }

        while reader.peek() == Some(tags::BLOCK_PPOINT) {
            let inner = reader.enter(tags::BLOCK_PPOINT)?;
            let point = reader.get_uint(tags::INDEX)? as u32;
            let annot = BlockId::read(reader)?;
            reader.leave(inner);
            cfg.point_annotations.push((point, annot));
        }

        if reader.peek() == Some(tags::BIT) {
            cfg.annotation_bit = Some(Bit::read(reader)?);
        }

        reader.leave(outer);
        Ok(cfg)
    }
}

pub(super) fn scan_block_leaks() -> usize {
    crate::hashcons::scan_leaks("block_id", &BLOCK_ID_TABLE).live
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Two-point CFG `entry --edge--> exit` for one function.
    pub(crate) fn linear_cfg(function: &str, edges: usize) -> BlockCfg {
        let id = BlockId::make(
            BlockKind::Function,
            Variable::make_func(function),
            None,
        );
        let mut cfg = BlockCfg::new(
            id,
            Location::make("test.c", 1),
            Location::make("test.c", 10),
        );
        let mut prev = cfg.add_point(Location::make("test.c", 1));
        cfg.set_entry_point(prev);
        for ind in 0..edges {
            let next = cfg.add_point(Location::make("test.c", ind as u32 + 2));
            cfg.add_edge(PEdge::skip(prev, next));
            prev = next;
        }
        cfg.set_exit_point(prev);
        cfg
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_block_id_interning() {
        let f = Variable::make_func("f");
        let a = BlockId::make(BlockKind::Function, f.clone(), None);
        let b = BlockId::make(BlockKind::Function, f.clone(), None);
        assert_eq!(a, b);
        assert_ne!(a, BlockId::make(BlockKind::FunctionWhole, f.clone(), None));

        let lp = BlockId::make(BlockKind::Loop, f, Some("loop:4:10"));
        assert_eq!(lp.display_loop_name().unwrap(), "loop:10");
    }

    #[test]
    fn test_cfg_roundtrip() {
        let cfg = testing::linear_cfg("f", 3);
        let mut buf = Buffer::new();
        cfg.write(&mut buf);
        let bytes = buf.into_bytes();
        let mut reader = Reader::new(&bytes);
        let back = BlockCfg::read(&mut reader).unwrap();
        assert!(cfg.is_equivalent(&back));
        assert_eq!(cfg.id(), back.id());
        back.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_edge() {
        let mut cfg = testing::linear_cfg("f", 1);
        cfg.add_edge(PEdge::skip(9, 1));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_equivalence_detects_change() {
        let a = testing::linear_cfg("f", 2);
        let mut b = testing::linear_cfg("f", 2);
        assert!(a.is_equivalent(&b));

        let x = Exp::make_var(Variable::make_glob("x"));
        b.set_edges(vec![
            PEdge::assign(
                1,
                2,
                Type::make_int(32, true),
                x.clone(),
                Exp::make_int(0),
            ),
            PEdge::skip(2, 3),
        ]);
        assert!(!a.is_equivalent(&b));
    }
}
