// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{CheckerError, CheckerResult};
use crate::ir::{BinopKind, Bit, BitKind, Exp, ExpKind, UnopKind};

use super::{FrameId, SolverHashTable};

/// Handle to a backend expression. Zero is never a valid handle.
pub type SlvExpr = usize;
/// Handle to a backend declaration. Zero is never a valid handle.
pub type SlvDecl = usize;

/// A satisfying assignment: concrete values for the declared leaves,
/// keyed by frame and expression.
pub type SolverAssignment = BTreeMap<(FrameId, Exp), i128>;

/// Contract between the core and one SMT backend. The core only holds
/// opaque handles; every structural operation goes through this trait.
pub trait BaseSolver {
    fn name(&self) -> &'static str;

    fn clear(&mut self);
    fn push_context(&mut self);
    fn pop_context(&mut self);

    fn make_integral_constant(&mut self, value: i128) -> SlvExpr;
    fn make_boolean_constant(&mut self, value: bool) -> SlvExpr;
    /// Declare an opaque integer leaf for `exp` in `frame`.
    fn make_declaration(&mut self, frame: FrameId, exp: &Exp) -> SlvDecl;
    fn get_declaration_expr(&mut self, decl: SlvDecl) -> SlvExpr;
    fn get_unop(&mut self, op: UnopKind, operand: SlvExpr) -> SlvExpr;
    fn get_binop(&mut self, op: BinopKind, left: SlvExpr, right: SlvExpr) -> SlvExpr;
    fn coerce_int_to_bool(&mut self, operand: SlvExpr, ne_zero: bool) -> SlvExpr;
    fn coerce_bool_to_int(&mut self, operand: SlvExpr) -> SlvExpr;
    fn get_not(&mut self, operand: SlvExpr) -> SlvExpr;
    fn get_and(&mut self, operands: &[SlvExpr]) -> SlvExpr;
    fn get_or(&mut self, operands: &[SlvExpr]) -> SlvExpr;

    fn base_assert(&mut self, expr: SlvExpr);
    /// Whether the asserted constraints are satisfiable within the given
    /// soft time budget.
    fn base_check(&mut self, budget: Option<Duration>) -> CheckerResult<bool>;

    /// Model values for the given declarations after a satisfiable check.
    fn get_assignment(&mut self, decls: &[(FrameId, Exp, SlvDecl)]) -> SolverAssignment;

    /// Diagnosis hooks used when dumping a failing backend's state.
    fn debug_print_decl(&self, decl: SlvDecl);
    fn debug_print_assert(&self, expr: SlvExpr);
}

/// Translates interned bits into backend terms, tracking declarations and
/// asserted bits per push/pop context so the incremental state of the
/// backend always mirrors the tables.
pub struct Solver {
    name: String,
    backend: Box<dyn BaseSolver>,
    decl_table: SolverHashTable<ExpKind, SlvDecl>,
    bit_table: SolverHashTable<BitKind, SlvExpr>,
    /// Asserted bits per context depth, for assignment verification.
    asserted: Vec<Vec<(FrameId, Bit)>>,
    assign: SolverAssignment,
    soft_timeout: Option<Duration>,
}

impl Solver {
    pub fn new(name: &str, backend: Box<dyn BaseSolver>) -> Solver {
        Solver {
            name: name.to_string(),
            backend,
            decl_table: SolverHashTable::new(),
            bit_table: SolverHashTable::new(),
            asserted: vec![Vec::new()],
            assign: SolverAssignment::new(),
            soft_timeout: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Soft time budget handed to the backend on every check.
    pub fn set_soft_timeout(&mut self, budget: Option<Duration>) {
        self.soft_timeout = budget;
    }

    pub fn push_context(&mut self) {
        self.backend.push_context();
        self.decl_table.push_context();
        self.bit_table.push_context();
        self.asserted.push(Vec::new());
    }

    pub fn pop_context(&mut self) {
        self.backend.pop_context();
        self.decl_table.pop_context();
        self.bit_table.pop_context();
        if self.asserted.len() > 1 {
            self.asserted.pop();
        }
    }

    pub fn clear(&mut self) {
        self.backend.clear();
        self.decl_table.clear();
        self.bit_table.clear();
        self.asserted = vec![Vec::new()];
        self.assign.clear();
    }

    /// Assert `bit` within `frame`.
    pub fn add_assert(&mut self, frame: FrameId, bit: &Bit) {
        let expr = self.convert_bit(frame, bit);
        self.backend.base_assert(expr);
        self.asserted
            .last_mut()
            .expect("base context always present")
            .push((frame, bit.clone()));
    }

    pub fn is_satisfiable(&mut self) -> CheckerResult<bool> {
        match self.backend.base_check(self.soft_timeout) {
            Ok(result) => Ok(result),
            Err(CheckerError::SolverDisagreement { backend }) => {
                // cross-check failure: pin the assignment of the backend
                // that reported SAT and verify it satisfies every asserted
                // bit; a failure here blames the SAT backend instead.
                tracing::error!(
                    "conflict between solvers on satisfiability [{}]",
                    self.name
                );
                self.pin_assign();
                self.check_assignment_bits()?;
                Err(CheckerError::SolverDisagreement { backend })
            }
            Err(err) => Err(err),
        }
    }

    /// Record the current model for the declared leaves.
    pub fn pin_assign(&mut self) {
        let mut decls = Vec::new();
        self.decl_table.visit_each(|frame, exp, decl| {
            decls.push((frame, exp.clone(), decl));
        });
        self.assign = self.backend.get_assignment(&decls);
    }

    pub fn assignment(&self) -> &SolverAssignment {
        &self.assign
    }

    /// Verify the pinned assignment satisfies every asserted bit. This
    /// check runs in the solver layer, independent of any backend.
    pub fn check_assignment_bits(&self) -> CheckerResult<()> {
        for (frame, bit) in self.asserted.iter().flatten() {
            if !eval_bit(*frame, bit, &self.assign).unwrap_or(false) {
                return Err(CheckerError::SolverDisagreement {
                    backend: format!("{} (assignment does not satisfy {bit})", self.name),
                });
            }
        }
        Ok(())
    }

    fn convert_bit(&mut self, frame: FrameId, bit: &Bit) -> SlvExpr {
        if let Some(expr) = self.bit_table.lookup(frame, bit) {
            return expr;
        }
        let expr = match &**bit {
            BitKind::False => self.backend.make_boolean_constant(false),
            BitKind::True => self.backend.make_boolean_constant(true),
            BitKind::Exp(exp) => {
                let operand = self.convert_exp(frame, exp);
                if is_boolean_exp(exp) {
                    operand
                } else {
                    self.backend.coerce_int_to_bool(operand, true)
                }
            }
            BitKind::Not(inner) => {
                let operand = self.convert_bit(frame, inner);
                self.backend.get_not(operand)
            }
            BitKind::And(operands) => {
                let operands: Vec<SlvExpr> = operands
                    .iter()
                    .map(|bit| self.convert_bit(frame, bit))
                    .collect();
                self.backend.get_and(&operands)
            }
            BitKind::Or(operands) => {
                let operands: Vec<SlvExpr> = operands
                    .iter()
                    .map(|bit| self.convert_bit(frame, bit))
                    .collect();
                self.backend.get_or(&operands)
            }
        };
        self.bit_table.insert(frame, bit.clone(), expr);
        expr
    }

    fn convert_exp(&mut self, frame: FrameId, exp: &Exp) -> SlvExpr {
        match &**exp {
            ExpKind::Int(value) => self.backend.make_integral_constant(*value),
            ExpKind::Unop { op, operand, .. } => {
                let operand = self.convert_exp(frame, operand);
                self.backend.get_unop(*op, operand)
            }
            ExpKind::Binop {
                op, left, right, ..
            } => {
                let left = self.convert_exp(frame, left);
                let right = self.convert_exp(frame, right);
                self.backend.get_binop(*op, left, right)
            }
            // everything else is an opaque integer leaf.
            _ => {
                let decl = match self.decl_table.lookup(frame, exp) {
                    Some(decl) => decl,
                    None => {
                        let decl = self.backend.make_declaration(frame, exp);
                        self.decl_table.insert(frame, exp.clone(), decl);
                        decl
                    }
                };
                self.backend.get_declaration_expr(decl)
            }
        }
    }
}

fn is_boolean_exp(exp: &Exp) -> bool {
    matches!(&**exp, ExpKind::Binop { op, .. } if op.is_compare())
}

/// Evaluate a bit under a concrete assignment. `None` when a leaf has no
/// value in the assignment.
pub fn eval_bit(frame: FrameId, bit: &Bit, assign: &SolverAssignment) -> Option<bool> {
    match &**bit {
        BitKind::False => Some(false),
        BitKind::True => Some(true),
        BitKind::Exp(exp) => Some(eval_exp(frame, exp, assign)? != 0),
        BitKind::Not(inner) => Some(!eval_bit(frame, inner, assign)?),
        BitKind::And(operands) => {
            for bit in operands {
                if !eval_bit(frame, bit, assign)? {
                    return Some(false);
                }
            }
            Some(true)
        }
        BitKind::Or(operands) => {
            for bit in operands {
                if eval_bit(frame, bit, assign)? {
                    return Some(true);
                }
            }
            Some(false)
        }
    }
}

/// Evaluate an expression under a concrete assignment.
pub fn eval_exp(frame: FrameId, exp: &Exp, assign: &SolverAssignment) -> Option<i128> {
    match &**exp {
        ExpKind::Int(value) => Some(*value),
        ExpKind::Unop { op, operand, .. } => {
            let value = eval_exp(frame, operand, assign)?;
            Some(match op {
                UnopKind::Neg => value.wrapping_neg(),
                UnopKind::BitNot => !value,
                UnopKind::LogNot => i128::from(value == 0),
            })
        }
        ExpKind::Binop {
            op, left, right, ..
        } => {
            let left = eval_exp(frame, left, assign)?;
            let right = eval_exp(frame, right, assign)?;
            Some(match op {
                BinopKind::Plus => left.wrapping_add(right),
                BinopKind::Minus => left.wrapping_sub(right),
                BinopKind::Mult => left.wrapping_mul(right),
                BinopKind::Div => left.checked_div(right)?,
                BinopKind::Mod => left.checked_rem(right)?,
                BinopKind::ShiftLeft => left.checked_shl(u32::try_from(right).ok()?)?,
                BinopKind::ShiftRight => left.checked_shr(u32::try_from(right).ok()?)?,
                BinopKind::BitAnd => left & right,
                BinopKind::BitOr => left | right,
                BinopKind::BitXor => left ^ right,
                BinopKind::LessThan => i128::from(left < right),
                BinopKind::LessEqual => i128::from(left <= right),
                BinopKind::GreaterThan => i128::from(left > right),
                BinopKind::GreaterEqual => i128::from(left >= right),
                BinopKind::Equal => i128::from(left == right),
                BinopKind::NotEqual => i128::from(left != right),
            })
        }
        _ => assign.get(&(frame, exp.clone())).copied(),
    }
}
