// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! The transactional key-value store: append-once databases, the
//! transaction IR interpreted against the backend, and the backend runtime
//! with its named hashes, graph sorts and worklist protocol.

mod backend;
mod timestamp;
mod transaction;
mod xdb;

pub use backend::*;
pub use timestamp::*;
pub use transaction::*;
pub use xdb::*;
