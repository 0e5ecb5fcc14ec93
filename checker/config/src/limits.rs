// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! Empirical analysis cutoffs. These have been tuned against large C/C++
//! codebases; changing them trades analysis precision against runtime.

/// Maximum number of non-function locations visited when propagating
/// backwards through the escape graph to resolve an indirect call.
/// Function-valued locations are free and do not count against the limit.
pub const FUNPTR_ESCAPE_LIMIT: usize = 100;

/// Maximum number of locations visited when propagating pointer-arithmetic
/// results forward to the lvalues they may flow into.
pub const ARITHMETIC_ESCAPE_LIMIT: usize = 50;

/// Number of callgraph stages used when partitioning functions for the
/// analysis worklist. The final stage additionally receives every function
/// reachable from an indirect call.
pub const CALLGRAPH_STAGES: usize = 5;

/// Maximum number of dirty keys flushed from a merge cache in one
/// read/merge/commit transaction pair, to bound transaction size.
pub const MERGE_TRANSACTION_LIMIT: usize = 32;

/// Buffers at or above this size are stored in their compressed variant.
pub const COMPRESS_THRESHOLD: usize = 128;

/// Minimum bucket count for the IR interning tables.
pub const INTERN_MIN_BUCKETS: usize = 719;

/// Minimum bucket count for the solver declaration/expression tables.
pub const SOLVER_MIN_BUCKETS: usize = 89;
