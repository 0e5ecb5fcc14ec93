// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Operational configuration of an analysis worker.
///
/// Every field has a default that makes sense for a single-worker run over a
/// local store, so most deployments only need to set `db_path`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Parameters {
    /// Directory holding the analysis databases and worklist/sort files.
    /// The directory is created on demand.
    pub db_path: Option<PathBuf>,

    /// Soft time budget handed to the solver for each assertion check.
    #[serde(default = "Parameters::default_soft_timeout")]
    pub soft_timeout: Duration,

    /// Hard wall-clock limit per assertion, reset at each new assertion.
    /// Disabled while the indirect callgraph is being generated, since an
    /// interrupted escape propagation would corrupt the callgraph.
    #[serde(default = "Parameters::default_hard_timeout")]
    pub hard_timeout: Duration,

    /// Skip generation of indirect call edges.
    #[serde(default)]
    pub skip_indirect: bool,

    /// Run the modset computation to a fixpoint across callees, requeueing
    /// callers whose callee modsets changed.
    #[serde(default)]
    pub do_fixpoint: bool,

    /// Generate integer overflow/underflow assertions. Supported but off by
    /// default.
    #[serde(default)]
    pub infer_integer_overflow: bool,

    /// Reference-ledger stamp to break on, for chasing leaked IR nodes in
    /// debug builds. Overridden by the `XGILL_REFERENCE` environment
    /// variable when set.
    #[serde(default)]
    pub reference_breakpoint: Option<u64>,
}

impl Parameters {
    pub fn default_soft_timeout() -> Duration {
        Duration::from_secs(20)
    }

    pub fn default_hard_timeout() -> Duration {
        Duration::from_secs(120)
    }

    /// The breakpoint stamp, with the environment taking precedence over the
    /// configured value.
    pub fn reference_breakpoint(&self) -> Option<u64> {
        if let Ok(value) = std::env::var("XGILL_REFERENCE") {
            if let Ok(stamp) = value.parse() {
                return Some(stamp);
            }
        }
        self.reference_breakpoint
    }

    pub fn db_path_str_unsafe(&self) -> String {
        self.db_path
            .clone()
            .expect("DB path is not set")
            .as_path()
            .to_str()
            .unwrap()
            .to_string()
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            db_path: None,
            soft_timeout: Parameters::default_soft_timeout(),
            hard_timeout: Parameters::default_hard_timeout(),
            skip_indirect: false,
            do_fixpoint: false,
            infer_integer_overflow: false,
            reference_breakpoint: None,
        }
    }
}
