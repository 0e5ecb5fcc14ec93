// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-block symbolic memory: guards, assignment tables, alias and clobber
//! reasoning, and the modsets summarizing what a block may write.

mod block_memory;
mod modset;

pub use block_memory::*;
pub use modset::*;
