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

use lazy_static::lazy_static;
use prometheus::*;

/// Type label.
pub const TYPE_LABEL: &str = "type";
/// Level label, either `intermediate` or `final`.
pub const LEVEL_LABEL: &str = "level";

lazy_static! {
    /// Number of blocks allocated by the in-memory block store.
    pub static ref LIVE_BLOCKS: IntGauge =
        register_int_gauge!("greptime_sort_merge_live_blocks", "sort merge live blocks").unwrap();

    // ------ Merge related metrics
    /// Counter of scheduled merge jobs.
    pub static ref MERGE_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
            "greptime_sort_merge_jobs_total",
            "sort merge jobs total",
            &[LEVEL_LABEL]
        )
        .unwrap();
    /// Elapsed time of a merge job, labeled by the merge algorithm.
    pub static ref MERGE_ELAPSED: HistogramVec = register_histogram_vec!(
            "greptime_sort_merge_elapsed",
            "sort merge elapsed",
            &[TYPE_LABEL],
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
        )
        .unwrap();
    /// Counter of tuples written by merge jobs.
    pub static ref MERGED_TUPLES_TOTAL: IntCounter = register_int_counter!(
            "greptime_sort_merge_merged_tuples_total",
            "sort merge merged tuples total"
        )
        .unwrap();
    /// Counter of failed merge jobs.
    pub static ref MERGE_ERRORS_TOTAL: IntCounter = register_int_counter!(
            "greptime_sort_merge_errors_total",
            "sort merge errors total"
        )
        .unwrap();
    // ------ End of merge related metrics
}
