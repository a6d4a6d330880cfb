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

use snafu::{Location, Snafu};

use crate::storage::BlockId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Block provider exhausted, {} blocks already allocated", allocated))]
    BlockExhausted {
        allocated: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Block {} not found", block_id))]
    BlockNotFound {
        block_id: BlockId,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Fresh block {} rejected a tuple of {} values", block_id, num_values))]
    TupleTooLarge {
        block_id: BlockId,
        num_values: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Sort key config is empty"))]
    EmptySortKeys {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Invalid sort key, reason: {}", reason))]
    InvalidSortKey {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Invalid config, reason: {}", reason))]
    InvalidConfig {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to parse config"))]
    ParseConfig {
        #[snafu(source)]
        error: toml::de::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to parse sort key config"))]
    ParseSortKeys {
        #[snafu(source)]
        error: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Received completion of unknown merge job {}", job_id))]
    UnknownMergeJob {
        job_id: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Output run of final level {} can't be written back to the merge tree",
        level
    ))]
    FinalLevelOutput {
        level: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Level {} overflow, expected: {}, scheduled: {}, pending: {}",
        level,
        expected,
        scheduled,
        pending
    ))]
    LevelOverflow {
        level: usize,
        expected: usize,
        scheduled: usize,
        pending: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Input blocks fed after the input was marked as done"))]
    InputAfterDone {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Relation mismatch, expect: {}, given: {}",
        expect,
        given
    ))]
    RelationMismatch {
        expect: u32,
        given: u32,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Sort merge operator is not done yet"))]
    OperatorNotDone {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to join merge worker"))]
    JoinWorker {
        #[snafu(source)]
        error: tokio::task::JoinError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Scheduler is stopped"))]
    SchedulerStopped {
        #[snafu(implicit)]
        location: Location,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classes of failures a sort can run into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The storage layer can't supply blocks.
    ResourceExhausted,
    /// The sort was configured wrongly by the caller.
    Configuration,
    /// The caller broke a scheduler invariant.
    SchedulerInvariant,
    /// The executor driving the sort failed.
    Execution,
    /// The result was requested too early.
    NotReady,
}

impl Error {
    /// Returns the class of this error.
    pub fn kind(&self) -> ErrorKind {
        use Error::*;

        match self {
            BlockExhausted { .. } | BlockNotFound { .. } | TupleTooLarge { .. } => {
                ErrorKind::ResourceExhausted
            }
            EmptySortKeys { .. }
            | InvalidSortKey { .. }
            | InvalidConfig { .. }
            | ParseConfig { .. }
            | ParseSortKeys { .. } => ErrorKind::Configuration,
            UnknownMergeJob { .. }
            | FinalLevelOutput { .. }
            | LevelOverflow { .. }
            | InputAfterDone { .. }
            | RelationMismatch { .. } => ErrorKind::SchedulerInvariant,
            JoinWorker { .. } | SchedulerStopped { .. } => ErrorKind::Execution,
            OperatorNotDone { .. } => ErrorKind::NotReady,
        }
    }

    /// Returns true if the error aborts the whole sort.
    ///
    /// There is no retry inside the sort, callers may only re-run the query.
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::NotReady
    }
}
