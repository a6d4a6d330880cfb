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

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use snafu::{ensure, OptionExt, ResultExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SortMergeConfig;
use crate::error::{JoinWorkerSnafu, Result, SchedulerStoppedSnafu};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The scheduler accepts jobs.
const STATE_RUNNING: u8 = 0;
/// The scheduler is stopped and pending jobs are dropped.
const STATE_STOP: u8 = 1;
/// The scheduler stops accepting jobs and finishes pending jobs.
const STATE_AWAIT_TERMINATION: u8 = 2;

/// [Scheduler] defines a set of API to schedule Jobs
#[async_trait::async_trait]
pub trait Scheduler: Send + Sync {
    /// Schedules a Job
    async fn schedule(&self, job: Job) -> Result<()>;

    /// Stops scheduler. If `await_termination` is true, the scheduler runs all
    /// pending jobs before stopping.
    async fn stop(&self, await_termination: bool) -> Result<()>;
}

pub type SchedulerRef = Arc<dyn Scheduler>;

/// Request scheduler based on local state.
pub struct LocalScheduler {
    /// Sends jobs to workers. `None` once the scheduler is stopped.
    sender: RwLock<Option<async_channel::Sender<Job>>>,
    /// Handles of workers.
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Token used to halt the scheduler
    cancel_token: CancellationToken,
    /// State of scheduler.
    state: Arc<AtomicU8>,
}

impl LocalScheduler {
    /// Starts a new scheduler with `concurrency` workers.
    ///
    /// `cap` is the capacity of the job channel, scheduling waits once it is full.
    pub fn new(cap: usize, concurrency: usize) -> Self {
        let (tx, rx) = async_channel::bounded(cap);
        let token = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(STATE_RUNNING));

        let mut handles = Vec::with_capacity(concurrency);
        for id in 0..concurrency {
            let child = token.child_token();
            let receiver = rx.clone();
            let state_clone = state.clone();
            let handle = tokio::spawn(async move {
                while state_clone.load(Ordering::Relaxed) != STATE_STOP {
                    tokio::select! {
                        _ = child.cancelled() => {
                            break;
                        }
                        req_opt = receiver.recv() => {
                            let Ok(job) = req_opt else {
                                // The channel is closed and drained.
                                break;
                            };
                            job.await;
                        }
                    }
                }
                debug!("Merge worker {} exits", id);
            });
            handles.push(handle);
        }

        Self {
            sender: RwLock::new(Some(tx)),
            handles: Mutex::new(handles),
            cancel_token: token,
            state,
        }
    }

    /// Starts a scheduler sized by the worker options of `config`.
    pub fn with_config(config: &SortMergeConfig) -> Self {
        Self::new(config.worker_channel_size, config.num_workers)
    }

    #[inline]
    fn is_running(&self) -> bool {
        self.state.load(Ordering::Relaxed) == STATE_RUNNING
    }
}

#[async_trait::async_trait]
impl Scheduler for LocalScheduler {
    async fn schedule(&self, job: Job) -> Result<()> {
        ensure!(self.is_running(), SchedulerStoppedSnafu);

        let sender = self
            .sender
            .read()
            .unwrap()
            .clone()
            .context(SchedulerStoppedSnafu)?;
        sender
            .send(job)
            .await
            .ok()
            .context(SchedulerStoppedSnafu)
    }

    async fn stop(&self, await_termination: bool) -> Result<()> {
        ensure!(self.is_running(), SchedulerStoppedSnafu);
        let state = if await_termination {
            STATE_AWAIT_TERMINATION
        } else {
            STATE_STOP
        };
        self.sender.write().unwrap().take();
        self.state.store(state, Ordering::Relaxed);
        if !await_termination {
            self.cancel_token.cancel();
        }

        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            handle.await.context(JoinWorkerSnafu)?;
        }
        info!(
            "Merge scheduler stopped, await termination: {}",
            await_termination
        );

        Ok(())
    }
}

impl Drop for LocalScheduler {
    fn drop(&mut self) {
        self.state.store(STATE_STOP, Ordering::Relaxed);
        self.cancel_token.cancel();
    }
}
