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

//! Operator that sorts a relation by merging sorted runs level by level.
//!
//! The operator doesn't run merges itself. The executor polls
//! [SortMergeRunOperator::get_all_work_orders], runs each [MergeWorkOrder]
//! somewhere and reports the result back through
//! [SortMergeRunOperator::receive_feedback].

use std::collections::HashMap;
use std::sync::Mutex;

use snafu::{ensure, OptionExt};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::SortMergeConfig;
use crate::error::{
    InputAfterDoneSnafu, InvalidConfigSnafu, OperatorNotDoneSnafu, RelationMismatchSnafu,
    Result, UnknownMergeJobSnafu,
};
use crate::merge_tree::{MergeJob, MergeTree};
use crate::merger::RunMerger;
use crate::metrics::MERGE_JOBS_TOTAL;
use crate::run::Run;
use crate::run_generation::sort_block_into_run;
use crate::sort_key::SortKeyConfigRef;
use crate::storage::{BlockId, BlockProviderRef};

/// Id of a relation in the catalog.
pub type RelationId = u32;

/// Options of a [SortMergeRunOperator].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortMergeOptions {
    /// Max number of runs merged by one job.
    pub merge_factor: usize,
    /// Keeps only the first `top_k` tuples of each merge.
    pub top_k: Option<usize>,
    /// Sorts each input block before it enters the merge tree. If false, every
    /// input block must already be sorted.
    pub sort_input: bool,
}

impl SortMergeOptions {
    /// Returns `InvalidConfig` if the options can't drive a merge tree.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.merge_factor >= 2,
            InvalidConfigSnafu {
                reason: format!("merge_factor {} is less than 2", self.merge_factor),
            }
        );
        Ok(())
    }
}

impl From<&SortMergeConfig> for SortMergeOptions {
    fn from(config: &SortMergeConfig) -> Self {
        SortMergeOptions {
            merge_factor: config.merge_factor,
            top_k: config.top_k,
            sort_input: false,
        }
    }
}

/// How the operator receives its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// All input blocks are known when the operator is created.
    Stored,
    /// Input blocks are fed while merges are running.
    Pipelined,
}

/// Statistics of a sort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortMergeStats {
    /// Number of level-0 input blocks.
    pub num_input_blocks: usize,
    /// Number of merge jobs dispatched, indexed by level.
    pub jobs_per_level: Vec<usize>,
    /// Number of tuples written by completed merges.
    pub merged_tuples: usize,
}

impl SortMergeStats {
    /// Total number of dispatched jobs.
    pub fn num_jobs(&self) -> usize {
        self.jobs_per_level.iter().sum()
    }
}

/// A merge job handed to the executor.
pub struct MergeWorkOrder {
    job_id: u64,
    level: usize,
    is_final_level: bool,
    inputs: Vec<Run>,
    sort_keys: SortKeyConfigRef,
    top_k: Option<usize>,
    provider: BlockProviderRef,
}

impl MergeWorkOrder {
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn is_final_level(&self) -> bool {
        self.is_final_level
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Merges the input runs. Input runs are left untouched.
    pub fn execute(self) -> Result<MergeFeedback> {
        let job_id = self.job_id;
        let level = self.level;
        let merger = RunMerger::new(self.inputs, self.sort_keys, self.top_k, self.provider);
        match merger.do_merge() {
            Ok(output) => Ok(MergeFeedback {
                job_id,
                output: output.run,
                num_tuples: output.num_tuples,
            }),
            Err(e) => {
                error!(
                    "Failed to execute merge job {}, level: {}, error: {}",
                    job_id, level, e
                );
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for MergeWorkOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeWorkOrder")
            .field("job_id", &self.job_id)
            .field("level", &self.level)
            .field("is_final_level", &self.is_final_level)
            .field("inputs", &self.inputs)
            .finish()
    }
}

/// Completion message of a [MergeWorkOrder].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeFeedback {
    pub job_id: u64,
    /// Run written by the job.
    pub output: Run,
    pub num_tuples: usize,
}

/// A dispatched job waiting for its feedback.
#[derive(Debug)]
struct RunningJob {
    level: usize,
    is_final_level: bool,
    /// Released after the job completes.
    inputs: Vec<Run>,
}

#[derive(Debug, Default)]
struct OperatorState {
    /// Whether the pipelined tree is initialized.
    initialized: bool,
    /// No more input will be fed.
    input_done: bool,
    /// The merge tree scheduled its final job.
    tree_done: bool,
    final_job_dispatched: bool,
    next_job_id: u64,
    running: HashMap<u64, RunningJob>,
    /// Sorted output. `Some` once the sort is complete.
    output: Option<Run>,
    output_taken: bool,
    stats: SortMergeStats,
}

impl OperatorState {
    fn is_done(&self) -> bool {
        self.output.is_some() || self.output_taken
    }
}

/// Sorts the blocks of one relation by merging them through a [MergeTree].
pub struct SortMergeRunOperator {
    input_relation: RelationId,
    mode: InputMode,
    sort_keys: SortKeyConfigRef,
    options: SortMergeOptions,
    provider: BlockProviderRef,
    tree: MergeTree,
    /// Lock order: `state` before the lock inside `tree`.
    state: Mutex<OperatorState>,
    /// Notified when new input arrives or the input is done.
    input_notify: Notify,
}

impl SortMergeRunOperator {
    /// Creates an operator whose input blocks are all known.
    pub fn new_stored(
        input_relation: RelationId,
        blocks: Vec<BlockId>,
        sort_keys: SortKeyConfigRef,
        options: SortMergeOptions,
        provider: BlockProviderRef,
    ) -> Result<SortMergeRunOperator> {
        let operator = SortMergeRunOperator::new(
            input_relation,
            InputMode::Stored,
            sort_keys,
            options,
            provider,
        )?;
        let blocks = operator.prepare_input_blocks(blocks)?;

        operator.tree.initialize_known(blocks.len());
        operator.tree.add_input_blocks(&blocks)?;
        {
            let mut state = operator.state.lock().unwrap();
            state.initialized = true;
            state.input_done = true;
            state.stats.num_input_blocks = blocks.len();
        }
        info!(
            "Sort merge operator of relation {} created with {} input blocks, merge factor: {}",
            input_relation,
            blocks.len(),
            options.merge_factor
        );

        Ok(operator)
    }

    /// Creates an operator that receives its input by
    /// [SortMergeRunOperator::feed_input_blocks].
    pub fn new_pipelined(
        input_relation: RelationId,
        sort_keys: SortKeyConfigRef,
        options: SortMergeOptions,
        provider: BlockProviderRef,
    ) -> Result<SortMergeRunOperator> {
        let operator = SortMergeRunOperator::new(
            input_relation,
            InputMode::Pipelined,
            sort_keys,
            options,
            provider,
        )?;
        info!(
            "Pipelined sort merge operator of relation {} created, merge factor: {}",
            input_relation, options.merge_factor
        );

        Ok(operator)
    }

    fn new(
        input_relation: RelationId,
        mode: InputMode,
        sort_keys: SortKeyConfigRef,
        options: SortMergeOptions,
        provider: BlockProviderRef,
    ) -> Result<SortMergeRunOperator> {
        options.validate()?;

        Ok(SortMergeRunOperator {
            input_relation,
            mode,
            sort_keys,
            options,
            provider,
            tree: MergeTree::new(options.merge_factor),
            state: Mutex::new(OperatorState::default()),
            input_notify: Notify::new(),
        })
    }

    pub fn input_relation(&self) -> RelationId {
        self.input_relation
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn merge_tree(&self) -> &MergeTree {
        &self.tree
    }

    /// Adds more input blocks of the relation.
    pub fn feed_input_blocks(&self, relation: RelationId, blocks: Vec<BlockId>) -> Result<()> {
        self.check_relation(relation)?;
        ensure!(
            !self.state.lock().unwrap().input_done,
            InputAfterDoneSnafu
        );
        let blocks = self.prepare_input_blocks(blocks)?;
        self.add_prepared_blocks(blocks)
    }

    /// Publishes prepared input blocks to the merge tree.
    ///
    /// The input may be marked done while the blocks are prepared. Blocks sorted
    /// by the operator are released then.
    fn add_prepared_blocks(&self, blocks: Vec<BlockId>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.input_done {
                drop(state);
                self.release_prepared_blocks(&blocks);
                return InputAfterDoneSnafu.fail();
            }
            if !state.initialized {
                self.tree.initialize_pipelined();
                state.initialized = true;
            }
            self.tree.add_input_blocks(&blocks)?;
            state.stats.num_input_blocks += blocks.len();
        }
        debug!(
            "Fed {} blocks to sort merge operator of relation {}",
            blocks.len(),
            self.input_relation
        );
        self.input_notify.notify_one();

        Ok(())
    }

    /// Marks the input of the relation as complete.
    pub fn done_feeding_input_blocks(&self, relation: RelationId) -> Result<()> {
        self.check_relation(relation)?;
        {
            let mut state = self.state.lock().unwrap();
            if state.input_done {
                return Ok(());
            }
            if !state.initialized {
                self.tree.initialize_pipelined();
                state.initialized = true;
            }
            self.tree.check_and_fix_final_merge()?;
            state.input_done = true;
            info!(
                "Input of relation {} is done, {} blocks, final level: {:?}",
                relation,
                state.stats.num_input_blocks,
                self.tree.final_level()
            );
        }
        self.input_notify.notify_one();

        Ok(())
    }

    /// Returns work orders of all merge jobs that are ready.
    pub fn get_all_work_orders(&self) -> Vec<MergeWorkOrder> {
        let mut state = self.state.lock().unwrap();
        if !state.initialized || state.tree_done {
            return Vec::new();
        }

        let (jobs, done) = self.tree.get_merge_jobs();
        let mut orders = Vec::with_capacity(jobs.len());
        for MergeJob {
            level,
            is_final_level,
            inputs,
        } in jobs
        {
            let job_id = state.next_job_id;
            state.next_job_id += 1;
            if state.stats.jobs_per_level.len() <= level {
                state.stats.jobs_per_level.resize(level + 1, 0);
            }
            state.stats.jobs_per_level[level] += 1;
            state.final_job_dispatched |= is_final_level;
            let label = if is_final_level {
                "final"
            } else {
                "intermediate"
            };
            MERGE_JOBS_TOTAL.with_label_values(&[label]).inc();

            state.running.insert(
                job_id,
                RunningJob {
                    level,
                    is_final_level,
                    inputs: inputs.clone(),
                },
            );
            orders.push(MergeWorkOrder {
                job_id,
                level,
                is_final_level,
                inputs,
                sort_keys: self.sort_keys.clone(),
                top_k: self.options.top_k,
                provider: self.provider.clone(),
            });
        }

        if done {
            state.tree_done = true;
            if !state.final_job_dispatched {
                // Nothing to merge, the sorted output is empty.
                state.output = Some(Run::new());
                info!(
                    "Sort merge operator of relation {} is done without input",
                    self.input_relation
                );
            }
        }
        if !orders.is_empty() {
            debug!(
                "Dispatch {} merge jobs of relation {}, running: {}",
                orders.len(),
                self.input_relation,
                state.running.len()
            );
        }

        orders
    }

    /// Runs a work order on the current thread.
    pub fn execute(&self, order: MergeWorkOrder) -> Result<MergeFeedback> {
        order.execute()
    }

    /// Handles the completion of a merge job.
    ///
    /// Releases the inputs of the job and publishes its output to the next level,
    /// or keeps it as the sorted output if the job merged the final level.
    pub fn receive_feedback(&self, feedback: MergeFeedback) -> Result<()> {
        let MergeFeedback {
            job_id,
            output,
            num_tuples,
        } = feedback;
        let job = {
            let mut state = self.state.lock().unwrap();
            let job = state
                .running
                .remove(&job_id)
                .context(UnknownMergeJobSnafu { job_id })?;
            state.stats.merged_tuples += num_tuples;
            job
        };

        for run in job.inputs {
            run.release(self.provider.as_ref())?;
        }

        if job.is_final_level {
            let mut state = self.state.lock().unwrap();
            state.output = Some(output);
            info!(
                "Sort merge of relation {} finished, output tuples: {}, jobs: {}",
                self.input_relation,
                num_tuples,
                state.stats.num_jobs()
            );
        } else {
            self.tree.write_output_run(job.level, output)?;
        }

        Ok(())
    }

    /// Drops the result of a job after the sort is aborted.
    ///
    /// Releases the output and the inputs of the job.
    pub fn discard_feedback(&self, feedback: MergeFeedback) -> Result<()> {
        let job = self
            .state
            .lock()
            .unwrap()
            .running
            .remove(&feedback.job_id)
            .context(UnknownMergeJobSnafu {
                job_id: feedback.job_id,
            })?;
        debug!(
            "Discard output of merge job {}, level: {}, tuples: {}",
            feedback.job_id, job.level, feedback.num_tuples
        );

        feedback.output.release(self.provider.as_ref())?;
        for run in job.inputs {
            run.release(self.provider.as_ref())?;
        }
        Ok(())
    }

    /// Returns true once the final merge completed and its feedback is received.
    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().is_done()
    }

    /// Returns true if input may still arrive.
    pub fn is_input_done(&self) -> bool {
        self.state.lock().unwrap().input_done
    }

    /// Returns the number of dispatched jobs without feedback.
    pub fn num_running_jobs(&self) -> usize {
        self.state.lock().unwrap().running.len()
    }

    /// Takes the sorted output. The caller owns the returned run.
    pub fn take_output_run(&self) -> Result<Run> {
        let mut state = self.state.lock().unwrap();
        let output = state.output.take().context(OperatorNotDoneSnafu)?;
        state.output_taken = true;
        Ok(output)
    }

    pub fn stats(&self) -> SortMergeStats {
        self.state.lock().unwrap().stats.clone()
    }

    /// Returns a future that completes once new input is fed or the input is done.
    pub fn input_notified(&self) -> Notified<'_> {
        self.input_notify.notified()
    }

    fn check_relation(&self, relation: RelationId) -> Result<()> {
        ensure!(
            relation == self.input_relation,
            RelationMismatchSnafu {
                expect: self.input_relation,
                given: relation,
            }
        );
        Ok(())
    }

    /// Returns blocks that form sorted single-block runs.
    fn prepare_input_blocks(&self, blocks: Vec<BlockId>) -> Result<Vec<BlockId>> {
        if !self.options.sort_input {
            return Ok(blocks);
        }

        let mut sorted = Vec::with_capacity(blocks.len());
        for block_id in blocks {
            match sort_block_into_run(self.provider.as_ref(), block_id, &self.sort_keys) {
                Ok(run) => sorted.extend_from_slice(run.blocks()),
                Err(e) => {
                    self.release_prepared_blocks(&sorted);
                    return Err(e);
                }
            }
        }
        Ok(sorted)
    }

    /// Releases blocks the operator sorted but never published to the tree.
    fn release_prepared_blocks(&self, blocks: &[BlockId]) {
        if !self.options.sort_input {
            // The caller still owns unsorted input.
            return;
        }
        for block_id in blocks {
            if let Err(e) = self.provider.release_block(*block_id) {
                warn!("Failed to release sorted input block {}, error: {}", block_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::error::{Error, ErrorKind};
    use crate::sort_key::{SortKey, SortKeyConfig};
    use crate::storage::{BlockProvider, MemoryBlockStore, Tuple, Value};
    use crate::test_util::{
        collect_run, init_default_ut_logging, int_tuples, int_values, new_sorted_blocks,
        new_store, random_tuples, sort_tuples,
    };

    const RELATION: RelationId = 7;

    fn options(merge_factor: usize, top_k: Option<usize>) -> SortMergeOptions {
        SortMergeOptions {
            merge_factor,
            top_k,
            sort_input: false,
        }
    }

    fn asc_keys() -> SortKeyConfigRef {
        Arc::new(SortKeyConfig::try_new(vec![SortKey::asc(0)]).unwrap())
    }

    /// Executes work orders until the operator is done, in dispatch order.
    fn drive(operator: &SortMergeRunOperator) {
        loop {
            let orders = operator.get_all_work_orders();
            if orders.is_empty() {
                break;
            }
            for order in orders {
                let feedback = operator.execute(order).unwrap();
                operator.receive_feedback(feedback).unwrap();
            }
        }
    }

    fn run_stored(
        store: &Arc<MemoryBlockStore>,
        blocks: Vec<BlockId>,
        sort_keys: SortKeyConfigRef,
        options: SortMergeOptions,
    ) -> Vec<Tuple> {
        let operator =
            SortMergeRunOperator::new_stored(RELATION, blocks, sort_keys, options, store.clone())
                .unwrap();
        drive(&operator);
        assert!(operator.is_done());
        let output = operator.take_output_run().unwrap();
        collect_run(&output, store)
    }

    /// Feeds `batches` one by one and drives ready jobs after each batch.
    fn run_pipelined(
        store: &Arc<MemoryBlockStore>,
        batches: Vec<Vec<BlockId>>,
        sort_keys: SortKeyConfigRef,
        options: SortMergeOptions,
    ) -> Vec<Tuple> {
        let operator =
            SortMergeRunOperator::new_pipelined(RELATION, sort_keys, options, store.clone())
                .unwrap();
        for batch in batches {
            operator.feed_input_blocks(RELATION, batch).unwrap();
            for order in operator.get_all_work_orders() {
                let feedback = order.execute().unwrap();
                operator.receive_feedback(feedback).unwrap();
            }
            assert!(!operator.is_done());
        }
        operator.done_feeding_input_blocks(RELATION).unwrap();
        drive(&operator);
        assert!(operator.is_done());
        let output = operator.take_output_run().unwrap();
        collect_run(&output, store)
    }

    #[test]
    fn test_stored_sort() {
        init_default_ut_logging();
        let store = new_store(2);
        let keys = asc_keys();
        let values = [
            Some(5),
            None,
            Some(3),
            Some(8),
            Some(1),
            Some(1),
            None,
            Some(9),
            Some(0),
        ];
        let blocks = new_sorted_blocks(&store, int_tuples(&values), &keys);
        assert_eq!(5, blocks.len());

        let output = run_stored(&store, blocks, keys, options(2, None));
        assert_eq!(
            vec![
                Some(0),
                Some(1),
                Some(1),
                Some(3),
                Some(5),
                Some(8),
                Some(9),
                None,
                None
            ],
            int_values(&output, 0)
        );
        // Only the output run is alive.
        let output_blocks = 9usize.div_ceil(2);
        assert_eq!(output_blocks, store.num_live_blocks());
    }

    #[test]
    fn test_nine_runs_two_levels() {
        let store = new_store(1);
        let keys = asc_keys();
        let values: Vec<_> = (0..9).rev().map(Some).collect();
        let blocks = new_sorted_blocks(&store, int_tuples(&values), &keys);
        let operator = SortMergeRunOperator::new_stored(
            RELATION,
            blocks,
            keys,
            options(3, None),
            store.clone(),
        )
        .unwrap();

        let orders = operator.get_all_work_orders();
        assert_eq!(3, orders.len());
        assert!(orders
            .iter()
            .all(|o| o.level() == 0 && o.num_inputs() == 3 && !o.is_final_level()));
        let feedbacks: Vec<_> = orders.into_iter().map(|o| o.execute().unwrap()).collect();
        // Feedback in reverse order.
        for feedback in feedbacks.into_iter().rev() {
            operator.receive_feedback(feedback).unwrap();
        }

        let orders = operator.get_all_work_orders();
        assert_eq!(1, orders.len());
        assert!(orders[0].is_final_level());
        assert_eq!(1, orders[0].level());
        assert!(!operator.is_done());
        assert!(operator.get_all_work_orders().is_empty());

        let feedback = orders.into_iter().next().unwrap().execute().unwrap();
        assert!(!operator.is_done());
        operator.receive_feedback(feedback).unwrap();
        assert!(operator.is_done());
        assert_eq!(
            SortMergeStats {
                num_input_blocks: 9,
                jobs_per_level: vec![3, 1],
                merged_tuples: 18,
            },
            operator.stats()
        );
        let output = operator.take_output_run().unwrap();
        let expected: Vec<_> = (0..9).map(Some).collect();
        assert_eq!(expected, int_values(&collect_run(&output, &store), 0));
    }

    #[test]
    fn test_pipelined_matches_stored() {
        init_default_ut_logging();
        let mut rng = StdRng::seed_from_u64(7);
        let keys = Arc::new(
            SortKeyConfig::try_new(vec![
                SortKey::desc(1),
                SortKey::asc(0).with_nulls_first(true),
            ])
            .unwrap(),
        );
        for merge_factor in [2, 3, 4] {
            for num_tuples in [0, 1, 3, 4, 12, 37] {
                let tuples = random_tuples(&mut rng, num_tuples, 2);
                let expected = sort_tuples(tuples.clone(), &keys);

                let store = new_store(3);
                let blocks = new_sorted_blocks(&store, tuples.clone(), &keys);
                let stored =
                    run_stored(&store, blocks, keys.clone(), options(merge_factor, None));

                let blocks = new_sorted_blocks(&store, tuples.clone(), &keys);
                let one_by_one = blocks.iter().map(|b| vec![*b]).collect();
                let pipelined_single =
                    run_pipelined(&store, one_by_one, keys.clone(), options(merge_factor, None));

                let blocks = new_sorted_blocks(&store, tuples.clone(), &keys);
                let mut batches = Vec::new();
                let mut rest = blocks.as_slice();
                while !rest.is_empty() {
                    let len = rng.gen_range(1..=rest.len());
                    batches.push(rest[..len].to_vec());
                    rest = &rest[len..];
                }
                let pipelined_random =
                    run_pipelined(&store, batches, keys.clone(), options(merge_factor, None));

                let blocks = new_sorted_blocks(&store, tuples, &keys);
                let all_at_once = run_pipelined(
                    &store,
                    vec![blocks],
                    keys.clone(),
                    options(merge_factor, None),
                );

                for output in [&stored, &pipelined_single, &pipelined_random, &all_at_once] {
                    assert_eq!(expected.len(), output.len());
                    for (left, right) in expected.iter().zip(output.iter()) {
                        assert_eq!(std::cmp::Ordering::Equal, keys.compare(left, right));
                    }
                }
            }
        }
    }

    #[test]
    fn test_pipelined_fix_final_merge() {
        let store = new_store(1);
        let keys = asc_keys();
        let operator = SortMergeRunOperator::new_pipelined(
            RELATION,
            keys.clone(),
            options(3, None),
            store.clone(),
        )
        .unwrap();
        let blocks = new_sorted_blocks(&store, int_tuples(&[Some(3), Some(1), Some(2)]), &keys);
        operator.feed_input_blocks(RELATION, blocks).unwrap();

        // The only merge runs before the input count is known.
        let orders = operator.get_all_work_orders();
        assert_eq!(1, orders.len());
        assert!(!orders[0].is_final_level());
        let feedback = orders.into_iter().next().unwrap().execute().unwrap();
        operator.receive_feedback(feedback).unwrap();
        assert!(!operator.is_done());

        operator.done_feeding_input_blocks(RELATION).unwrap();
        let orders = operator.get_all_work_orders();
        assert_eq!(1, orders.len());
        assert!(orders[0].is_final_level());
        assert_eq!(1, orders[0].num_inputs());
        drive_orders(&operator, orders);
        assert!(operator.is_done());
        let output = operator.take_output_run().unwrap();
        assert_eq!(
            int_tuples(&[Some(1), Some(2), Some(3)]),
            collect_run(&output, &store)
        );
    }

    fn drive_orders(operator: &SortMergeRunOperator, orders: Vec<MergeWorkOrder>) {
        for order in orders {
            let feedback = operator.execute(order).unwrap();
            operator.receive_feedback(feedback).unwrap();
        }
    }

    #[test]
    fn test_top_k() {
        let store = new_store(2);
        let keys = Arc::new(SortKeyConfig::try_new(vec![SortKey::desc(0)]).unwrap());
        let values: Vec<_> = (0..20).map(|v| Some(v * 7 % 20)).collect();
        let blocks = new_sorted_blocks(&store, int_tuples(&values), &keys);
        let output = run_stored(&store, blocks, keys.clone(), options(3, Some(4)));
        assert_eq!(
            vec![Some(19), Some(18), Some(17), Some(16)],
            int_values(&output, 0)
        );

        let blocks = new_sorted_blocks(&store, int_tuples(&values), &keys);
        let output = run_pipelined(&store, vec![blocks], keys, options(3, Some(4)));
        assert_eq!(
            vec![Some(19), Some(18), Some(17), Some(16)],
            int_values(&output, 0)
        );
    }

    #[test]
    fn test_sort_input_blocks() {
        let store = new_store(3);
        let keys = asc_keys();
        let blocks = store
            .load_blocks(int_tuples(&[Some(4), Some(2), None, Some(3), Some(1)]))
            .unwrap();
        let options = SortMergeOptions {
            sort_input: true,
            ..options(2, None)
        };
        let output = run_stored(&store, blocks, keys, options);
        assert_eq!(
            vec![Some(1), Some(2), Some(3), Some(4), None],
            int_values(&output, 0)
        );
    }

    #[test]
    fn test_empty_input() {
        let store = new_store(2);
        let output = run_stored(&store, Vec::new(), asc_keys(), options(2, None));
        assert!(output.is_empty());

        let output = run_pipelined(&store, Vec::new(), asc_keys(), options(2, None));
        assert!(output.is_empty());
        assert_eq!(0, store.num_live_blocks());
    }

    #[test]
    fn test_feedback_errors() {
        let store = new_store(1);
        let keys = asc_keys();
        let blocks = new_sorted_blocks(&store, int_tuples(&[Some(2), Some(1)]), &keys);
        let operator = SortMergeRunOperator::new_stored(
            RELATION,
            blocks,
            keys,
            options(2, None),
            store.clone(),
        )
        .unwrap();
        assert!(matches!(
            operator.take_output_run().unwrap_err(),
            Error::OperatorNotDone { .. }
        ));

        let order = operator.get_all_work_orders().pop().unwrap();
        let feedback = order.execute().unwrap();
        let unknown = MergeFeedback {
            job_id: feedback.job_id + 100,
            ..feedback.clone()
        };
        assert!(matches!(
            operator.receive_feedback(unknown).unwrap_err(),
            Error::UnknownMergeJob { .. }
        ));
        operator.receive_feedback(feedback.clone()).unwrap();
        // Duplicate completion.
        assert!(matches!(
            operator.receive_feedback(feedback).unwrap_err(),
            Error::UnknownMergeJob { .. }
        ));
        assert!(operator.is_done());
    }

    #[test]
    fn test_feed_errors() {
        let store = new_store(1);
        let keys = asc_keys();
        let operator = SortMergeRunOperator::new_pipelined(
            RELATION,
            keys.clone(),
            options(2, None),
            store.clone(),
        )
        .unwrap();
        let blocks = new_sorted_blocks(&store, int_tuples(&[Some(1)]), &keys);
        let err = operator
            .feed_input_blocks(RELATION + 1, blocks.clone())
            .unwrap_err();
        assert!(matches!(err, Error::RelationMismatch { .. }));

        operator.feed_input_blocks(RELATION, blocks).unwrap();
        operator.done_feeding_input_blocks(RELATION).unwrap();
        // Done twice is fine.
        operator.done_feeding_input_blocks(RELATION).unwrap();
        let blocks = new_sorted_blocks(&store, int_tuples(&[Some(2)]), &keys);
        let err = operator.feed_input_blocks(RELATION, blocks).unwrap_err();
        assert!(matches!(err, Error::InputAfterDone { .. }));
        assert_eq!(ErrorKind::SchedulerInvariant, err.kind());

        let stored = SortMergeRunOperator::new_stored(
            RELATION,
            Vec::new(),
            keys,
            options(2, None),
            store.clone(),
        )
        .unwrap();
        let blocks = new_sorted_blocks(&store, int_tuples(&[Some(3)]), &asc_keys());
        assert!(matches!(
            stored.feed_input_blocks(RELATION, blocks).unwrap_err(),
            Error::InputAfterDone { .. }
        ));
    }

    #[test]
    fn test_invalid_merge_factor() {
        let store = new_store(2);
        let blocks = new_sorted_blocks(&store, int_tuples(&[Some(1), Some(2)]), &asc_keys());
        for merge_factor in [0, 1] {
            let err = SortMergeRunOperator::new_stored(
                RELATION,
                blocks.clone(),
                asc_keys(),
                options(merge_factor, None),
                store.clone(),
            )
            .err()
            .unwrap();
            assert!(matches!(err, Error::InvalidConfig { .. }), "{err:?}");
            assert_eq!(ErrorKind::Configuration, err.kind());

            let err = SortMergeRunOperator::new_pipelined(
                RELATION,
                asc_keys(),
                options(merge_factor, None),
                store.clone(),
            )
            .err()
            .unwrap();
            assert!(matches!(err, Error::InvalidConfig { .. }), "{err:?}");
        }
        assert!(options(2, None).validate().is_ok());
    }

    #[test]
    fn test_invalid_sort_key_attribute() {
        let store = new_store(1);
        let keys = Arc::new(SortKeyConfig::try_new(vec![SortKey::asc(1)]).unwrap());
        let blocks = store
            .load_blocks(int_tuples(&[Some(2), Some(1), Some(3)]))
            .unwrap();
        let operator = SortMergeRunOperator::new_stored(
            RELATION,
            blocks.clone(),
            keys.clone(),
            options(3, None),
            store.clone(),
        )
        .unwrap();
        let order = operator.get_all_work_orders().pop().unwrap();
        let err = operator.execute(order).unwrap_err();
        assert!(matches!(err, Error::InvalidSortKey { .. }), "{err:?}");
        assert!(!operator.is_done());
        // The inputs are the only live blocks.
        assert_eq!(3, store.num_live_blocks());

        let sort_input = SortMergeOptions {
            sort_input: true,
            ..options(3, None)
        };
        let err = SortMergeRunOperator::new_stored(RELATION, blocks, keys, sort_input, store)
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidSortKey { .. }), "{err:?}");
    }

    #[test]
    fn test_sorted_input_released_after_done() {
        let store = new_store(2);
        let keys = asc_keys();
        let sort_input = SortMergeOptions {
            sort_input: true,
            ..options(2, None)
        };
        let operator =
            SortMergeRunOperator::new_pipelined(RELATION, keys, sort_input, store.clone())
                .unwrap();
        let blocks = store
            .load_blocks(int_tuples(&[Some(4), Some(2), Some(3)]))
            .unwrap();
        assert_eq!(2, store.num_live_blocks());

        // The input is marked done while the blocks are being sorted.
        let sorted = operator.prepare_input_blocks(blocks).unwrap();
        assert_eq!(2, sorted.len());
        operator.done_feeding_input_blocks(RELATION).unwrap();
        let err = operator.add_prepared_blocks(sorted).unwrap_err();
        assert!(matches!(err, Error::InputAfterDone { .. }));
        assert_eq!(0, store.num_live_blocks());
        assert_eq!(0, operator.stats().num_input_blocks);
    }

    #[test]
    fn test_failed_input_sort_releases_sorted_blocks() {
        let store = new_store(2);
        // The second block starts with a tuple the sort key can't read.
        let tuples = vec![
            vec![Value::from(2)],
            vec![Value::from(1)],
            Vec::new(),
            vec![Value::from(3)],
        ];
        let blocks = store.load_blocks(tuples).unwrap();
        assert_eq!(2, store.num_live_blocks());
        let sort_input = SortMergeOptions {
            sort_input: true,
            ..options(2, None)
        };
        let err = SortMergeRunOperator::new_stored(
            RELATION,
            blocks.clone(),
            asc_keys(),
            sort_input,
            store.clone(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::InvalidSortKey { .. }), "{err:?}");
        // The first block is consumed by its sort and the sorted copy is released.
        assert_eq!(1, store.num_live_blocks());
        assert!(store.get_block(blocks[1]).is_ok());
    }

    #[test]
    fn test_discard_feedback() {
        let store = new_store(1);
        let keys = asc_keys();
        let blocks = new_sorted_blocks(&store, int_tuples(&[Some(3), Some(1), Some(2)]), &keys);
        let operator = SortMergeRunOperator::new_stored(
            RELATION,
            blocks,
            keys,
            options(2, None),
            store.clone(),
        )
        .unwrap();
        let orders = operator.get_all_work_orders();
        assert_eq!(2, orders.len());
        assert_eq!(2, orders[0].num_inputs());
        let feedback = orders.into_iter().next().unwrap().execute().unwrap();
        // Three inputs and the output of the first job.
        assert_eq!(5, store.num_live_blocks());

        operator.discard_feedback(feedback.clone()).unwrap();
        assert_eq!(1, operator.num_running_jobs());
        assert_eq!(1, store.num_live_blocks());
        assert!(matches!(
            operator.discard_feedback(feedback).unwrap_err(),
            Error::UnknownMergeJob { .. }
        ));
    }
}
