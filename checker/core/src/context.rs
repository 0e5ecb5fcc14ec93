// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use checker_config::Parameters;
#[cfg(test)]
use tempfile::TempDir;

#[cfg(test)]
use crate::metrics::test_metrics;
use crate::metrics::Metrics;

/// Context contains the configuration and metrics shared by all components
/// of one analysis worker.
#[derive(Clone)]
pub struct Context {
    /// Parameters of this worker.
    pub parameters: Parameters,
    /// Metrics of this worker.
    pub(crate) metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(parameters: Parameters, registry: &prometheus::Registry) -> Self {
        Self {
            metrics: Metrics::new(registry),
            parameters,
        }
    }

    /// Create a test context with its databases under a fresh temp dir.
    #[cfg(test)]
    pub(crate) fn new_for_test() -> (Self, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let context = Self {
            parameters: Parameters {
                db_path: Some(temp_dir.path().to_path_buf()),
                ..Default::default()
            },
            metrics: test_metrics(),
        };
        (context, temp_dir)
    }
}
