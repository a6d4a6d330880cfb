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

//! # External sort merge
//!
//! Sorts a relation larger than memory by merging sorted runs through a
//! multi-level merge tree. Level-0 runs are single sorted blocks. Each merge job
//! combines up to `merge_factor` runs of one level into a run of the next level
//! until the final level yields the sorted output.

pub mod config;
pub mod error;
pub mod merge_tree;
pub mod merger;
pub mod metrics;
pub mod operator;
pub mod run;
pub mod run_generation;
pub mod schedule;
pub mod sort_key;
pub mod storage;
#[cfg(test)]
mod test_util;

pub use crate::config::SortMergeConfig;
pub use crate::error::{Error, Result};
pub use crate::operator::{
    InputMode, MergeFeedback, MergeWorkOrder, RelationId, SortMergeOptions, SortMergeRunOperator,
    SortMergeStats,
};
pub use crate::run::{Run, RunBuilder, RunIterator};
pub use crate::sort_key::{SortKey, SortKeyConfig};
