// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! The solver seam: the `BaseSolver` contract concrete backends implement,
//! the `Solver` wrapper translating bits into backend terms, the
//! incremental hash tables tracking declarations across push/pop contexts,
//! and the multiplexing cross-checker over several backends.

mod minsat;
mod mux;
mod solver;
mod solver_hash;

pub use minsat::*;
pub use mux::*;
pub use solver::*;
pub use solver_hash::*;
