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

//! Runner that drives a [SortMergeRunOperator] to completion.

use std::sync::Arc;
use std::time::Instant;

use snafu::ResultExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{JoinWorkerSnafu, Result};
use crate::operator::{MergeFeedback, MergeWorkOrder, SortMergeRunOperator};
use crate::run::Run;
use crate::schedule::scheduler::SchedulerRef;

/// Dispatches work orders of an operator to a scheduler and routes their
/// completions back to the operator.
pub struct SortMergeRunner {
    operator: Arc<SortMergeRunOperator>,
    scheduler: SchedulerRef,
}

impl SortMergeRunner {
    pub fn new(operator: Arc<SortMergeRunOperator>, scheduler: SchedulerRef) -> SortMergeRunner {
        SortMergeRunner {
            operator,
            scheduler,
        }
    }

    pub fn operator(&self) -> &Arc<SortMergeRunOperator> {
        &self.operator
    }

    /// Runs merges until the sort is done and returns the sorted run.
    ///
    /// In pipelined mode the runner waits for input fed by other tasks. The first
    /// failed merge aborts the sort. Jobs still running then are awaited and their
    /// outputs released.
    pub async fn run(&self) -> Result<Run> {
        let start = Instant::now();
        let (feedback_tx, mut feedback_rx) = mpsc::unbounded_channel();
        let mut num_running = 0;

        if let Err(e) = self
            .merge_until_done(&feedback_tx, &mut feedback_rx, &mut num_running)
            .await
        {
            drop(feedback_tx);
            self.discard_running(&mut feedback_rx, num_running).await;
            return Err(e);
        }

        let stats = self.operator.stats();
        info!(
            "Sort merge of relation {} done, input blocks: {}, jobs per level: {:?}, cost: {:?}",
            self.operator.input_relation(),
            stats.num_input_blocks,
            stats.jobs_per_level,
            start.elapsed()
        );

        self.operator.take_output_run()
    }

    async fn merge_until_done(
        &self,
        feedback_tx: &mpsc::UnboundedSender<Result<MergeFeedback>>,
        feedback_rx: &mut mpsc::UnboundedReceiver<Result<MergeFeedback>>,
        num_running: &mut usize,
    ) -> Result<()> {
        loop {
            for order in self.operator.get_all_work_orders() {
                self.dispatch(order, feedback_tx.clone()).await?;
                *num_running += 1;
            }
            if self.operator.is_done() {
                return Ok(());
            }

            let input_done = self.operator.is_input_done();
            tokio::select! {
                Some(result) = feedback_rx.recv(), if *num_running > 0 => {
                    *num_running -= 1;
                    let feedback = result?;
                    self.operator.receive_feedback(feedback)?;
                }
                _ = self.operator.input_notified(), if !input_done => {}
                // Nothing runs and no input arrives, the take in `run` reports it.
                else => return Ok(()),
            }
        }
    }

    /// Waits for `num_running` jobs of an aborted sort and drops their results.
    async fn discard_running(
        &self,
        feedback_rx: &mut mpsc::UnboundedReceiver<Result<MergeFeedback>>,
        mut num_running: usize,
    ) {
        while num_running > 0 {
            let Some(result) = feedback_rx.recv().await else {
                // Jobs dropped by a stopped scheduler never report.
                break;
            };
            num_running -= 1;
            let Ok(feedback) = result else {
                continue;
            };
            let job_id = feedback.job_id;
            if let Err(e) = self.operator.discard_feedback(feedback) {
                warn!(
                    "Failed to discard output of merge job {}, error: {}",
                    job_id, e
                );
            }
        }
    }

    async fn dispatch(
        &self,
        order: MergeWorkOrder,
        feedback_tx: mpsc::UnboundedSender<Result<MergeFeedback>>,
    ) -> Result<()> {
        debug!(
            "Schedule merge job {}, level: {}, inputs: {}",
            order.job_id(),
            order.level(),
            order.num_inputs()
        );
        self.scheduler
            .schedule(Box::pin(async move {
                // Merges block on the storage layer.
                let result = tokio::task::spawn_blocking(move || order.execute())
                    .await
                    .context(JoinWorkerSnafu)
                    .and_then(|result| result);
                // The runner is gone if the sort is aborted.
                let _ = feedback_tx.send(result);
            }))
            .await
    }
}
