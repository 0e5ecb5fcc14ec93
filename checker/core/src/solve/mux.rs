// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use crate::error::{CheckerError, CheckerResult};
use crate::ir::{BinopKind, Exp, UnopKind};

use super::{BaseSolver, FrameId, SlvDecl, SlvExpr, SolverAssignment};

/// Multiplexer over several backends, mirroring every operation across all
/// of them and cross-checking satisfiability results. A handle returned by
/// the MUX indexes per-backend handle arrays.
///
/// When backends disagree on a check, the MUX takes the satisfying side as
/// the assignment source, dumps the failing backend's declarations and
/// asserts for reproduction, and fails the check with a
/// [`CheckerError::SolverDisagreement`]; the caller verifies the pinned
/// assignment and aborts the worker. This is the testing backbone for
/// solver correctness.
pub struct SolverMux {
    solvers: Vec<Box<dyn BaseSolver>>,
    /// Per-backend declaration handles, indexed by the shared handle.
    decl_list: Vec<Vec<SlvDecl>>,
    /// Per-backend expression handles, indexed by the shared handle.
    expr_list: Vec<Vec<SlvExpr>>,
    /// Backend whose model is used for assignments. Zero except after a
    /// disagreement, where it switches to the backend that reported SAT.
    assign_solver: usize,
}

impl SolverMux {
    pub fn new(solvers: Vec<Box<dyn BaseSolver>>) -> SolverMux {
        assert!(!solvers.is_empty());
        let count = solvers.len();
        let mut mux = SolverMux {
            solvers,
            decl_list: vec![Vec::new(); count],
            expr_list: vec![Vec::new(); count],
            assign_solver: 0,
        };
        // zero is not a valid shared handle.
        mux.new_decl();
        mux.new_expr();
        mux
    }

    fn new_decl(&mut self) -> usize {
        let next = self.decl_list[0].len();
        for list in &mut self.decl_list {
            debug_assert_eq!(list.len(), next);
            list.push(0);
        }
        next
    }

    fn new_expr(&mut self) -> usize {
        let next = self.expr_list[0].len();
        for list in &mut self.expr_list {
            debug_assert_eq!(list.len(), next);
            list.push(0);
        }
        next
    }

    fn mirror_expr(&mut self, make: impl Fn(&mut dyn BaseSolver, &[SlvExpr]) -> SlvExpr) -> SlvExpr {
        let result = self.new_expr();
        for index in 0..self.solvers.len() {
            let exprs = self.expr_list[index].clone();
            let expr = make(self.solvers[index].as_mut(), &exprs);
            self.expr_list[index][result] = expr;
        }
        result
    }
}

impl BaseSolver for SolverMux {
    fn name(&self) -> &'static str {
        "mux"
    }

    fn clear(&mut self) {
        for solver in &mut self.solvers {
            solver.clear();
        }
        for list in &mut self.decl_list {
            list.clear();
        }
        for list in &mut self.expr_list {
            list.clear();
        }
        self.assign_solver = 0;
        self.new_decl();
        self.new_expr();
    }

    fn push_context(&mut self) {
        for solver in &mut self.solvers {
            solver.push_context();
        }
    }

    fn pop_context(&mut self) {
        for solver in &mut self.solvers {
            solver.pop_context();
        }
    }

    fn make_integral_constant(&mut self, value: i128) -> SlvExpr {
        self.mirror_expr(|solver, _| solver.make_integral_constant(value))
    }

    fn make_boolean_constant(&mut self, value: bool) -> SlvExpr {
        self.mirror_expr(|solver, _| solver.make_boolean_constant(value))
    }

    fn make_declaration(&mut self, frame: FrameId, exp: &Exp) -> SlvDecl {
        let result = self.new_decl();
        for index in 0..self.solvers.len() {
            let decl = self.solvers[index].make_declaration(frame, exp);
            self.decl_list[index][result] = decl;
        }
        result
    }

    fn get_declaration_expr(&mut self, decl: SlvDecl) -> SlvExpr {
        let result = self.new_expr();
        for index in 0..self.solvers.len() {
            let backend_decl = self.decl_list[index][decl];
            let expr = self.solvers[index].get_declaration_expr(backend_decl);
            self.expr_list[index][result] = expr;
        }
        result
    }

    fn get_unop(&mut self, op: UnopKind, operand: SlvExpr) -> SlvExpr {
        self.mirror_expr(|solver, exprs| solver.get_unop(op, exprs[operand]))
    }

    fn get_binop(&mut self, op: BinopKind, left: SlvExpr, right: SlvExpr) -> SlvExpr {
        self.mirror_expr(|solver, exprs| solver.get_binop(op, exprs[left], exprs[right]))
    }

    fn coerce_int_to_bool(&mut self, operand: SlvExpr, ne_zero: bool) -> SlvExpr {
        self.mirror_expr(|solver, exprs| solver.coerce_int_to_bool(exprs[operand], ne_zero))
    }

    fn coerce_bool_to_int(&mut self, operand: SlvExpr) -> SlvExpr {
        self.mirror_expr(|solver, exprs| solver.coerce_bool_to_int(exprs[operand]))
    }

    fn get_not(&mut self, operand: SlvExpr) -> SlvExpr {
        self.mirror_expr(|solver, exprs| solver.get_not(exprs[operand]))
    }

    fn get_and(&mut self, operands: &[SlvExpr]) -> SlvExpr {
        self.mirror_expr(|solver, exprs| {
            let mapped: Vec<SlvExpr> = operands.iter().map(|operand| exprs[*operand]).collect();
            solver.get_and(&mapped)
        })
    }

    fn get_or(&mut self, operands: &[SlvExpr]) -> SlvExpr {
        self.mirror_expr(|solver, exprs| {
            let mapped: Vec<SlvExpr> = operands.iter().map(|operand| exprs[*operand]).collect();
            solver.get_or(&mapped)
        })
    }

    fn base_assert(&mut self, expr: SlvExpr) {
        for index in 0..self.solvers.len() {
            let backend_expr = self.expr_list[index][expr];
            self.solvers[index].base_assert(backend_expr);
        }
    }

    fn base_check(&mut self, budget: Option<Duration>) -> CheckerResult<bool> {
        let mut sat_solver: Option<usize> = None;
        let mut unsat_solver: Option<usize> = None;

        for index in 0..self.solvers.len() {
            if self.solvers[index].base_check(budget)? {
                sat_solver = Some(index);
            } else {
                unsat_solver = Some(index);
            }
        }

        // all backends must agree on satisfiability; this is the core of
        // the cross-checking between them.
        if let (Some(sat), Some(unsat)) = (sat_solver, unsat_solver) {
            let failing = self.solvers[unsat].name().to_string();
            tracing::error!("failed solver: {failing}");

            // future assignments come from the backend that found a model.
            self.assign_solver = sat;

            // dump the failing backend's declarations and asserts so the
            // disagreement can be reproduced offline.
            for decl in &self.decl_list[unsat] {
                if *decl != 0 {
                    self.solvers[unsat].debug_print_decl(*decl);
                }
            }
            for expr in &self.expr_list[unsat] {
                if *expr != 0 {
                    self.solvers[unsat].debug_print_assert(*expr);
                }
            }

            return Err(CheckerError::SolverDisagreement { backend: failing });
        }

        Ok(sat_solver.is_some())
    }

    fn get_assignment(&mut self, decls: &[(FrameId, Exp, SlvDecl)]) -> SolverAssignment {
        // rewrite the shared handles into the assignment backend's own.
        let backend = self.assign_solver;
        let mapped: Vec<(FrameId, Exp, SlvDecl)> = decls
            .iter()
            .map(|(frame, exp, decl)| (*frame, exp.clone(), self.decl_list[backend][*decl]))
            .collect();
        self.solvers[backend].get_assignment(&mapped)
    }

    fn debug_print_decl(&self, decl: SlvDecl) {
        for (index, solver) in self.solvers.iter().enumerate() {
            solver.debug_print_decl(self.decl_list[index][decl]);
        }
    }

    fn debug_print_assert(&self, expr: SlvExpr) {
        for (index, solver) in self.solvers.iter().enumerate() {
            solver.debug_print_assert(self.expr_list[index][expr]);
        }
    }
}


#[cfg(test)]
mod test {
    use super::testing::FixedVerdict;
    use super::*;
    use crate::solve::MinSatSolver;

    #[test]
    fn test_agreement_passes_through() {
        let mut mux = SolverMux::new(vec![
            Box::new(FixedVerdict::new("a", true)),
            Box::new(FixedVerdict::new("b", true)),
        ]);
        assert!(mux.base_check(None).unwrap());

        let mut mux = SolverMux::new(vec![
            Box::new(FixedVerdict::new("a", false)),
            Box::new(FixedVerdict::new("b", false)),
        ]);
        assert!(!mux.base_check(None).unwrap());
    }

    #[test]
    fn test_disagreement_names_failing_backend() {
        let mut mux = SolverMux::new(vec![
            Box::new(FixedVerdict::new("sat_backend", true)),
            Box::new(FixedVerdict::new("unsat_backend", false)),
        ]);
        let err = mux.base_check(None).unwrap_err();
        match err {
            CheckerError::SolverDisagreement { backend } => {
                assert_eq!(backend, "unsat_backend");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_mux_mirrors_real_backend() {
        // a mux over two independent minsat instances behaves like one.
        let mut mux = SolverMux::new(vec![
            Box::new(MinSatSolver::new()),
            Box::new(MinSatSolver::new()),
        ]);
        let x = {
            let exp = Exp::make_var(crate::ir::Variable::make_glob("x"));
            let decl = mux.make_declaration(0, &exp);
            mux.get_declaration_expr(decl)
        };
        let five = mux.make_integral_constant(5);
        let eq = mux.get_binop(BinopKind::Equal, x, five);
        let cond = mux.coerce_int_to_bool(eq, true);
        mux.base_assert(cond);
        assert!(mux.base_check(None).unwrap());

        let ne = mux.get_binop(BinopKind::NotEqual, x, five);
        let cond = mux.coerce_int_to_bool(ne, true);
        mux.base_assert(cond);
        assert!(!mux.base_check(None).unwrap());
    }
}
