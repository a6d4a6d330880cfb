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

//! Scheduler that groups sorted runs into merge jobs level by level.

use std::collections::VecDeque;
use std::sync::Mutex;

use snafu::ensure;
use tracing::debug;

use crate::error::{FinalLevelOutputSnafu, LevelOverflowSnafu, Result};
use crate::run::Run;
use crate::storage::BlockId;

/// A group of runs of the same level to merge into one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeJob {
    pub level: usize,
    /// Whether the output of this job is the sorted output.
    pub is_final_level: bool,
    pub inputs: Vec<Run>,
}

/// Counters of a level, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelStats {
    /// Total number of runs the level receives, `None` if not known yet.
    pub expected: Option<usize>,
    /// Number of runs already grouped into jobs.
    pub scheduled: usize,
    /// Number of buffered runs.
    pub pending: usize,
}

#[derive(Debug, Default)]
struct Level {
    expected: Option<usize>,
    scheduled: usize,
    pending: VecDeque<Run>,
}

impl Level {
    fn with_expected(expected: usize) -> Level {
        Level {
            expected: Some(expected),
            ..Default::default()
        }
    }

    fn is_fully_scheduled(&self) -> bool {
        self.expected == Some(self.scheduled)
    }

    /// Ensures the level doesn't receive more runs than expected.
    fn check_overflow(&self, level: usize, incoming: usize) -> Result<()> {
        if let Some(expected) = self.expected {
            ensure!(
                self.scheduled + self.pending.len() + incoming <= expected,
                LevelOverflowSnafu {
                    level,
                    expected,
                    scheduled: self.scheduled,
                    pending: self.pending.len() + incoming,
                }
            );
        }
        Ok(())
    }

    fn stats(&self) -> LevelStats {
        LevelStats {
            expected: self.expected,
            scheduled: self.scheduled,
            pending: self.pending.len(),
        }
    }
}

#[derive(Debug, Default)]
struct TreeState {
    levels: Vec<Level>,
    /// The last level, `None` until the number of input runs is known.
    final_level: Option<usize>,
    /// Lowest level that is not fully scheduled.
    current_level: usize,
}

impl TreeState {
    fn level_mut(&mut self, level: usize) -> &mut Level {
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Level::default);
        }
        &mut self.levels[level]
    }
}

/// Tracks the runs of each merge level and emits merge jobs once enough runs
/// are ready.
///
/// All methods take the same lock and only touch counters and buffers under it.
#[derive(Debug)]
pub struct MergeTree {
    merge_factor: usize,
    state: Mutex<TreeState>,
}

impl MergeTree {
    /// Creates an uninitialized tree.
    ///
    /// # Panics
    /// Panics if `merge_factor` is less than 2.
    pub fn new(merge_factor: usize) -> MergeTree {
        assert!(merge_factor >= 2, "merge factor must be at least 2");
        MergeTree {
            merge_factor,
            state: Mutex::new(TreeState::default()),
        }
    }

    pub fn merge_factor(&self) -> usize {
        self.merge_factor
    }

    /// Initializes the tree for `num_runs` input runs known up front.
    pub fn initialize_known(&self, num_runs: usize) {
        let expected = expected_runs_per_level(num_runs, self.merge_factor);
        let mut state = self.state.lock().unwrap();
        *state = TreeState {
            final_level: Some(expected.len() - 1),
            levels: expected.into_iter().map(Level::with_expected).collect(),
            current_level: 0,
        };
        debug!(
            "Initialize merge tree for {} runs, final level: {:?}",
            num_runs, state.final_level
        );
    }

    /// Initializes the tree for input runs discovered incrementally.
    pub fn initialize_pipelined(&self) {
        let mut state = self.state.lock().unwrap();
        *state = TreeState {
            levels: vec![Level::default()],
            final_level: None,
            current_level: 0,
        };
    }

    /// Resolves the level counts once no more input runs arrive.
    ///
    /// If the only merge of level 0 was already scheduled as an ordinary job, its
    /// output goes through an extra level so there is still exactly one final job.
    pub fn check_and_fix_final_merge(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.final_level.is_some() {
            return Ok(());
        }

        let num_runs = state.level_mut(0).scheduled + state.levels[0].pending.len();
        let expected = expected_runs_per_level(num_runs, self.merge_factor);
        let mut final_level = expected.len() - 1;
        for (level, expected) in expected.into_iter().enumerate() {
            state.level_mut(level).expected = Some(expected);
        }

        let first = &state.levels[0];
        if first.expected == Some(self.merge_factor) && first.scheduled == self.merge_factor {
            final_level = 1;
            state.level_mut(1).expected = Some(1);
        }
        state.final_level = Some(final_level);

        for (idx, level) in state.levels.iter().enumerate() {
            level.check_overflow(idx, 0)?;
        }
        debug!(
            "Resolve merge tree with {} input runs, final level: {}",
            num_runs, final_level
        );

        Ok(())
    }

    /// Adds each block as a singleton run of level 0.
    pub fn add_input_blocks(&self, blocks: &[BlockId]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let level = state.level_mut(0);
        level.check_overflow(0, blocks.len())?;
        level
            .pending
            .extend(blocks.iter().map(|block_id| Run::singleton(*block_id)));

        Ok(())
    }

    /// Adds the output `run` of a job of `level` to the next level.
    pub fn write_output_run(&self, level: usize, run: Run) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        ensure!(
            state.final_level != Some(level),
            FinalLevelOutputSnafu { level }
        );

        let next = state.level_mut(level + 1);
        next.check_overflow(level + 1, 1)?;
        next.pending.push_back(run);

        Ok(())
    }

    /// Groups pending runs into merge jobs.
    ///
    /// Returns the jobs and whether the final level is fully scheduled. The latter is
    /// the only signal that no more jobs will be produced.
    pub fn get_merge_jobs(&self) -> (Vec<MergeJob>, bool) {
        let mut jobs = Vec::new();
        let mut state = self.state.lock().unwrap();
        let TreeState {
            levels,
            final_level,
            current_level,
        } = &mut *state;

        for (idx, level) in levels.iter_mut().enumerate().skip(*current_level) {
            if idx > 0 && level.expected.is_none() {
                // Which level is final is unknown, only level 0 can merge eagerly.
                // Holding back full groups above level 0 keeps level 0 the only
                // place where a non-final job can turn out to be the last merge,
                // which is the case `check_and_fix_final_merge` repairs.
                break;
            }

            loop {
                let num_pending = level.pending.len();
                let is_last_group = level.expected.is_some_and(|expected| {
                    num_pending > 0 && num_pending + level.scheduled == expected
                });
                if num_pending < self.merge_factor && !is_last_group {
                    break;
                }

                let group_size = num_pending.min(self.merge_factor);
                let inputs: Vec<_> = level.pending.drain(..group_size).collect();
                level.scheduled += group_size;
                jobs.push(MergeJob {
                    level: idx,
                    is_final_level: *final_level == Some(idx),
                    inputs,
                });
            }

            if idx == *current_level && level.is_fully_scheduled() {
                *current_level += 1;
            }
        }

        let done = final_level.is_some_and(|final_level| levels[final_level].is_fully_scheduled());
        if !jobs.is_empty() {
            debug!(
                "Merge tree scheduled {} jobs, current level: {}, done: {}",
                jobs.len(),
                current_level,
                done
            );
        }

        (jobs, done)
    }

    /// Returns the final level if it is resolved.
    pub fn final_level(&self) -> Option<usize> {
        self.state.lock().unwrap().final_level
    }

    /// Returns counters of all levels.
    pub fn level_stats(&self) -> Vec<LevelStats> {
        let state = self.state.lock().unwrap();
        state.levels.iter().map(Level::stats).collect()
    }
}

/// Returns the expected number of runs of each level, the last level is the final one.
fn expected_runs_per_level(num_runs: usize, merge_factor: usize) -> Vec<usize> {
    let mut expected = vec![num_runs];
    let mut runs = num_runs;
    while runs > merge_factor {
        runs = runs.div_ceil(merge_factor);
        expected.push(runs);
    }
    expected
}
