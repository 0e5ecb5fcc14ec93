// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

mod limits;
mod parameters;

pub use limits::*;
pub use parameters::*;
