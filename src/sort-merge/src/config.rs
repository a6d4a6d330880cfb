// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configurations.

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use tracing::warn;

use crate::error::{InvalidConfigSnafu, ParseConfigSnafu, Result};

/// Default fan-in of a merge job.
pub const DEFAULT_MERGE_FACTOR: usize = 16;
/// Default number of tuples a block can hold.
pub const DEFAULT_BLOCK_CAPACITY: usize = 1024;
/// Default channel size of the merge scheduler.
const DEFAULT_WORKER_CHANNEL_SIZE: usize = 128;

/// Configuration for a sort merge.
/// Before using the config, make sure to call `SortMergeConfig::sanitize()`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SortMergeConfig {
    /// Max number of runs merged by one job (default 16). Must be at least 2.
    pub merge_factor: usize,
    /// Number of tuples each block holds (default 1024).
    pub block_capacity: usize,
    /// Number of merge workers (default: 1/2 of cpu cores).
    /// Sets to 0 to use the default value.
    pub num_workers: usize,
    /// Channel size of the merge scheduler (default 128).
    pub worker_channel_size: usize,
    /// Keeps only the first `top_k` tuples of the sorted output.
    pub top_k: Option<usize>,
}

impl Default for SortMergeConfig {
    fn default() -> Self {
        SortMergeConfig {
            merge_factor: DEFAULT_MERGE_FACTOR,
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            num_workers: divide_num_cpus(2),
            worker_channel_size: DEFAULT_WORKER_CHANNEL_SIZE,
            top_k: None,
        }
    }
}

impl SortMergeConfig {
    /// Parses the config from a toml string and sanitizes it.
    pub fn from_toml_str(s: &str) -> Result<SortMergeConfig> {
        let mut config: SortMergeConfig = toml::from_str(s).context(ParseConfigSnafu)?;
        config.sanitize()?;
        Ok(config)
    }

    /// Sanitize incorrect configurations.
    ///
    /// Returns an error if there is a configuration that unable to sanitize.
    pub fn sanitize(&mut self) -> Result<()> {
        ensure!(
            self.merge_factor >= 2,
            InvalidConfigSnafu {
                reason: format!("merge_factor {} is less than 2", self.merge_factor),
            }
        );
        ensure!(
            self.block_capacity > 0,
            InvalidConfigSnafu {
                reason: "block_capacity must be positive",
            }
        );

        // Use default value if `num_workers` is 0.
        if self.num_workers == 0 {
            self.num_workers = divide_num_cpus(2);
        }

        if self.worker_channel_size == 0 {
            warn!("Sanitize channel size 0 to 1");
            self.worker_channel_size = 1;
        }

        Ok(())
    }
}

/// Divide cpu num by a non-zero `divisor` and returns at least 1.
fn divide_num_cpus(divisor: usize) -> usize {
    debug_assert!(divisor > 0);
    let cores = num_cpus::get();
    debug_assert!(cores > 0);

    cores.div_ceil(divisor)
}
