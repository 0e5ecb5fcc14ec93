// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::CheckerResult;
use crate::ir::{BinopKind, Exp, UnopKind};

use super::{BaseSolver, FrameId, SlvDecl, SlvExpr, SolverAssignment};

/// Search budget: number of candidate models tried per check.
const MODEL_BUDGET: usize = 200_000;

#[derive(Clone, Debug)]
enum Term {
    IntConst(i128),
    BoolConst(bool),
    Decl(usize),
    Unop(UnopKind, usize),
    Binop(BinopKind, usize, usize),
    Not(usize),
    And(Vec<usize>),
    Or(Vec<usize>),
    IntToBool(usize, bool),
    BoolToInt(usize),
}

struct DeclInfo {
    frame: FrameId,
    exp: Exp,
}

/// The in-tree backend: a naive model finder over the declared leaves.
/// Leaves take candidate values derived from the constants appearing in
/// the asserted terms, so the search is finite. A model found means SAT;
/// exhausting the candidates means UNSAT; exhausting only the search
/// budget conservatively reports SAT, which keeps downstream redundancy
/// marking sound. Propositional structure over interned atoms is decided
/// exactly; general integer arithmetic is approximated.
pub struct MinSatSolver {
    terms: Vec<Term>,
    decls: Vec<DeclInfo>,
    /// Asserted term indexes per context depth.
    asserted: Vec<Vec<usize>>,
    /// Term and declaration counts per pushed context, for pop.
    marks: Vec<(usize, usize)>,
    model: BTreeMap<usize, i128>,
}

impl MinSatSolver {
    pub fn new() -> MinSatSolver {
        MinSatSolver {
            // index zero is reserved; handles are term indexes.
            terms: vec![Term::BoolConst(true)],
            decls: Vec::new(),
            asserted: vec![Vec::new()],
            marks: Vec::new(),
            model: BTreeMap::new(),
        }
    }

    fn push_term(&mut self, term: Term) -> usize {
        self.terms.push(term);
        self.terms.len() - 1
    }

    /// Candidate values for the declared leaves: the constants mentioned
    /// anywhere in the asserted terms, their neighbors, and {0, 1}.
    fn candidates(&self) -> Vec<i128> {
        let mut values = vec![0, 1];
        for term in &self.terms {
            if let Term::IntConst(value) = term {
                for candidate in [*value, value.wrapping_sub(1), value.wrapping_add(1)] {
                    if !values.contains(&candidate) {
                        values.push(candidate);
                    }
                }
            }
        }
        values.sort();
        values
    }

    fn eval_int(&self, term: usize, model: &BTreeMap<usize, i128>) -> Option<i128> {
        match &self.terms[term] {
            Term::IntConst(value) => Some(*value),
            Term::BoolConst(value) => Some(i128::from(*value)),
            Term::Decl(decl) => model.get(decl).copied(),
            Term::Unop(op, operand) => {
                let value = self.eval_int(*operand, model)?;
                Some(match op {
                    UnopKind::Neg => value.wrapping_neg(),
                    UnopKind::BitNot => !value,
                    UnopKind::LogNot => i128::from(value == 0),
                })
            }
            Term::Binop(op, left, right) => {
                let left = self.eval_int(*left, model)?;
                let right = self.eval_int(*right, model)?;
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
            Term::Not(operand) => Some(i128::from(self.eval_int(*operand, model)? == 0)),
            Term::And(operands) => {
                for operand in operands {
                    if self.eval_int(*operand, model)? == 0 {
                        return Some(0);
                    }
                }
                Some(1)
            }
            Term::Or(operands) => {
                for operand in operands {
                    if self.eval_int(*operand, model)? != 0 {
                        return Some(1);
                    }
                }
                Some(0)
            }
            Term::IntToBool(operand, ne_zero) => {
                let value = self.eval_int(*operand, model)?;
                Some(i128::from((value != 0) == *ne_zero))
            }
            Term::BoolToInt(operand) => self.eval_int(*operand, model),
        }
    }

    fn model_satisfies(&self, model: &BTreeMap<usize, i128>) -> bool {
        self.asserted
            .iter()
            .flatten()
            .all(|term| matches!(self.eval_int(*term, model), Some(value) if value != 0))
    }
}

impl Default for MinSatSolver {
    fn default() -> Self {
        MinSatSolver::new()
    }
}

impl BaseSolver for MinSatSolver {
    fn name(&self) -> &'static str {
        "minsat"
    }

    fn clear(&mut self) {
        self.terms = vec![Term::BoolConst(true)];
        self.decls.clear();
        self.asserted = vec![Vec::new()];
        self.marks.clear();
        self.model.clear();
    }

    fn push_context(&mut self) {
        self.marks.push((self.terms.len(), self.decls.len()));
        self.asserted.push(Vec::new());
    }

    fn pop_context(&mut self) {
        let Some((terms, decls)) = self.marks.pop() else {
            return;
        };
        self.terms.truncate(terms);
        self.decls.truncate(decls);
        if self.asserted.len() > 1 {
            self.asserted.pop();
        }
    }

    fn make_integral_constant(&mut self, value: i128) -> SlvExpr {
        self.push_term(Term::IntConst(value))
    }

    fn make_boolean_constant(&mut self, value: bool) -> SlvExpr {
        self.push_term(Term::BoolConst(value))
    }

    fn make_declaration(&mut self, frame: FrameId, exp: &Exp) -> SlvDecl {
        self.decls.push(DeclInfo {
            frame,
            exp: exp.clone(),
        });
        self.decls.len() - 1
    }

    fn get_declaration_expr(&mut self, decl: SlvDecl) -> SlvExpr {
        self.push_term(Term::Decl(decl))
    }

    fn get_unop(&mut self, op: UnopKind, operand: SlvExpr) -> SlvExpr {
        self.push_term(Term::Unop(op, operand))
    }

    fn get_binop(&mut self, op: BinopKind, left: SlvExpr, right: SlvExpr) -> SlvExpr {
        self.push_term(Term::Binop(op, left, right))
    }

    fn coerce_int_to_bool(&mut self, operand: SlvExpr, ne_zero: bool) -> SlvExpr {
        self.push_term(Term::IntToBool(operand, ne_zero))
    }

    fn coerce_bool_to_int(&mut self, operand: SlvExpr) -> SlvExpr {
        self.push_term(Term::BoolToInt(operand))
    }

    fn get_not(&mut self, operand: SlvExpr) -> SlvExpr {
        self.push_term(Term::Not(operand))
    }

    fn get_and(&mut self, operands: &[SlvExpr]) -> SlvExpr {
        self.push_term(Term::And(operands.to_vec()))
    }

    fn get_or(&mut self, operands: &[SlvExpr]) -> SlvExpr {
        self.push_term(Term::Or(operands.to_vec()))
    }

    fn base_assert(&mut self, expr: SlvExpr) {
        self.asserted
            .last_mut()
            .expect("base context always present")
            .push(expr);
    }

    fn base_check(&mut self, _budget: Option<Duration>) -> CheckerResult<bool> {
        let candidates = self.candidates();
        let decl_count = self.decls.len();

        if decl_count == 0 {
            let empty = BTreeMap::new();
            return Ok(self.model_satisfies(&empty));
        }

        // odometer enumeration over the candidate values.
        let mut cursor = vec![0usize; decl_count];
        let mut tried = 0usize;
        loop {
            let model: BTreeMap<usize, i128> = cursor
                .iter()
                .enumerate()
                .map(|(decl, index)| (decl, candidates[*index]))
                .collect();
            if self.model_satisfies(&model) {
                self.model = model;
                return Ok(true);
            }

            tried += 1;
            if tried >= MODEL_BUDGET {
                // out of budget; the safe answer for this backend's users
                // is satisfiable.
                return Ok(true);
            }

            let mut position = 0;
            loop {
                if position == decl_count {
                    return Ok(false);
                }
                cursor[position] += 1;
                if cursor[position] < candidates.len() {
                    break;
                }
                cursor[position] = 0;
                position += 1;
            }
        }
    }

    fn get_assignment(&mut self, decls: &[(FrameId, Exp, SlvDecl)]) -> SolverAssignment {
        let mut assign = SolverAssignment::new();
        for (frame, exp, decl) in decls {
            let value = self.model.get(decl).copied().unwrap_or(0);
            assign.insert((*frame, exp.clone()), value);
        }
        assign
    }

    fn debug_print_decl(&self, decl: SlvDecl) {
        if let Some(info) = self.decls.get(decl) {
            tracing::error!("decl #{decl}: frame {} exp {}", info.frame, info.exp);
        }
    }

    fn debug_print_assert(&self, expr: SlvExpr) {
        if let Some(term) = self.terms.get(expr) {
            tracing::error!("assert #{expr}: {term:?}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::Variable;

    fn decl_expr(solver: &mut MinSatSolver, name: &str) -> SlvExpr {
        let exp = Exp::make_var(Variable::make_glob(name));
        let decl = solver.make_declaration(0, &exp);
        solver.get_declaration_expr(decl)
    }

    #[test]
    fn test_simple_sat_unsat() {
        let mut solver = MinSatSolver::new();
        let x = decl_expr(&mut solver, "x");
        let three = solver.make_integral_constant(3);
        let gt = solver.get_binop(BinopKind::GreaterThan, x, three);
        let cond = solver.coerce_int_to_bool(gt, true);
        solver.base_assert(cond);
        assert!(solver.base_check(None).unwrap());

        let le = solver.get_binop(BinopKind::LessEqual, x, three);
        let cond = solver.coerce_int_to_bool(le, true);
        solver.base_assert(cond);
        assert!(!solver.base_check(None).unwrap());
    }

    #[test]
    fn test_pop_restores_sat() {
        let mut solver = MinSatSolver::new();
        let x = decl_expr(&mut solver, "x");
        let zero = solver.make_integral_constant(0);
        let eq = solver.get_binop(BinopKind::Equal, x, zero);
        let cond = solver.coerce_int_to_bool(eq, true);
        solver.base_assert(cond);

        solver.push_context();
        let ne = solver.get_binop(BinopKind::NotEqual, x, zero);
        let cond = solver.coerce_int_to_bool(ne, true);
        solver.base_assert(cond);
        assert!(!solver.base_check(None).unwrap());
        solver.pop_context();

        assert!(solver.base_check(None).unwrap());
    }
}
