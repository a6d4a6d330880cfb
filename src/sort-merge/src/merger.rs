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

//! Merger that merges sorted runs into one sorted run.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics::{MERGED_TUPLES_TOTAL, MERGE_ELAPSED, MERGE_ERRORS_TOTAL};
use crate::run::{Run, RunBuilder, RunIterator};
use crate::sort_key::{SortKey, SortKeyConfig, SortKeyConfigRef};
use crate::storage::{BlockProviderRef, Tuple};

/// Algorithm a [RunMerger] uses, chosen by the shape of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAlgorithm {
    /// Only one input run, copies it.
    Copy,
    /// One ascending or descending sort column with nulls last.
    SingleColumnNullsLast,
    /// One ascending or descending sort column with nulls first.
    SingleColumnNullsFirst,
    /// Lexicographic merge over all sort columns.
    MultiColumn,
}

impl MergeAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeAlgorithm::Copy => "copy",
            MergeAlgorithm::SingleColumnNullsLast => "single_column_nulls_last",
            MergeAlgorithm::SingleColumnNullsFirst => "single_column_nulls_first",
            MergeAlgorithm::MultiColumn => "multi_column",
        }
    }
}

/// Output of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutput {
    pub run: Run,
    /// Number of tuples in `run`.
    pub num_tuples: usize,
}

/// Merges sorted input runs into one sorted run, keeping at most `top_k` tuples.
pub struct RunMerger {
    inputs: Vec<Run>,
    sort_keys: SortKeyConfigRef,
    top_k: Option<usize>,
    provider: BlockProviderRef,
}

impl RunMerger {
    /// Creates a merger. Each input run must be sorted by `sort_keys`.
    ///
    /// # Panics
    /// Panics if `sort_keys` is empty.
    pub fn new(
        inputs: Vec<Run>,
        sort_keys: SortKeyConfigRef,
        top_k: Option<usize>,
        provider: BlockProviderRef,
    ) -> RunMerger {
        assert!(!sort_keys.is_empty(), "sort keys must not be empty");
        RunMerger {
            inputs,
            sort_keys,
            top_k,
            provider,
        }
    }

    /// Returns the algorithm this merger uses.
    pub fn algorithm(&self) -> MergeAlgorithm {
        if self.inputs.len() == 1 {
            return MergeAlgorithm::Copy;
        }
        match self.sort_keys.single_key() {
            Some(key) if key.nulls_first => MergeAlgorithm::SingleColumnNullsFirst,
            Some(_) => MergeAlgorithm::SingleColumnNullsLast,
            None => MergeAlgorithm::MultiColumn,
        }
    }

    /// Merges the inputs into a new run.
    ///
    /// Input runs are only read. On failure, blocks already written for the output
    /// are released so no partial output remains. Fails with `InvalidSortKey` if a
    /// sort key refers to an attribute the input tuples don't have.
    pub fn do_merge(self) -> Result<MergeOutput> {
        if let Err(e) = self.validate_sort_keys() {
            MERGE_ERRORS_TOTAL.inc();
            return Err(e);
        }

        let algorithm = self.algorithm();
        let _timer = MERGE_ELAPSED
            .with_label_values(&[algorithm.as_str()])
            .start_timer();

        let builder = RunBuilder::new(Run::new(), self.provider.clone())?;
        let mut writer = OutputWriter {
            builder,
            limit: self.top_k,
            written: 0,
        };
        let mut cursors: Vec<_> = self
            .inputs
            .iter()
            .map(|run| RunIterator::new(run, self.provider.clone()))
            .collect();

        let result = match (algorithm, self.sort_keys.single_key()) {
            (MergeAlgorithm::Copy, _) => copy_run(&mut cursors[0], &mut writer),
            (MergeAlgorithm::SingleColumnNullsLast, Some(key)) => {
                merge_single_column_nulls_last(*key, &mut cursors, &mut writer)
            }
            (MergeAlgorithm::SingleColumnNullsFirst, Some(key)) => {
                merge_single_column_nulls_first(*key, &mut cursors, &mut writer)
            }
            _ => merge_multi_column(&self.sort_keys, &mut cursors, &mut writer),
        };

        if let Err(e) = result {
            MERGE_ERRORS_TOTAL.inc();
            if let Err(abort_err) = writer.builder.abort() {
                warn!(
                    "Failed to release output of a failed merge, error: {}",
                    abort_err
                );
            }
            return Err(e);
        }

        let num_tuples = writer.written;
        let run = writer.builder.finish()?;
        MERGED_TUPLES_TOTAL.inc_by(num_tuples as u64);
        debug!(
            "Merged {} runs into {} tuples by {}",
            self.inputs.len(),
            num_tuples,
            algorithm.as_str()
        );

        Ok(MergeOutput { run, num_tuples })
    }

    /// Checks the sort keys against the first tuple of each input run.
    fn validate_sort_keys(&self) -> Result<()> {
        for run in &self.inputs {
            let Some(block_id) = run.blocks().first() else {
                continue;
            };
            let block = self.provider.get_block(*block_id)?;
            let accessor = block.accessor();
            if accessor.num_tuples() > 0 {
                self.sort_keys.validate_arity(accessor.tuple(0).len())?;
            }
        }
        Ok(())
    }
}

/// Writes merged tuples and enforces the top-k limit.
struct OutputWriter {
    builder: RunBuilder,
    limit: Option<usize>,
    written: usize,
}

impl OutputWriter {
    /// Returns true if the writer doesn't accept more tuples.
    fn is_full(&self) -> bool {
        self.limit.is_some_and(|limit| self.written >= limit)
    }

    fn write(&mut self, tuple: Tuple) -> Result<()> {
        debug_assert!(!self.is_full());
        self.builder.append(tuple)?;
        self.written += 1;
        Ok(())
    }

    /// Copies remaining tuples of `cursor` until it is exhausted or the writer is full.
    fn write_remaining(&mut self, cursor: &mut RunIterator) -> Result<()> {
        while !self.is_full() {
            let Some(tuple) = cursor.next_tuple()? else {
                break;
            };
            self.write(tuple)?;
        }
        Ok(())
    }
}

/// The head tuple of an input run inside the merge heap.
///
/// The std binary heap is a max heap, entries compare in reverse so the smallest
/// tuple pops first.
trait HeadEntry: Ord {
    /// Index of the run the tuple comes from.
    fn run_index(&self) -> usize;

    fn into_tuple(self) -> Tuple;
}

/// Head of a run keyed on a single non-null column.
struct SingleKeyEntry {
    tuple: Tuple,
    run_index: usize,
    key: SortKey,
}

impl SingleKeyEntry {
    fn value_cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp_non_null(&self.tuple[self.key.attr], &other.tuple[other.key.attr])
            .then_with(|| self.run_index.cmp(&other.run_index))
    }
}

impl PartialEq for SingleKeyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.value_cmp(other) == Ordering::Equal
    }
}

impl Eq for SingleKeyEntry {}

impl PartialOrd for SingleKeyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SingleKeyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value_cmp(other).reverse()
    }
}

impl HeadEntry for SingleKeyEntry {
    fn run_index(&self) -> usize {
        self.run_index
    }

    fn into_tuple(self) -> Tuple {
        self.tuple
    }
}

/// Head of a run keyed on all sort columns.
struct MultiKeyEntry<'a> {
    tuple: Tuple,
    run_index: usize,
    sort_keys: &'a SortKeyConfig,
}

impl MultiKeyEntry<'_> {
    fn value_cmp(&self, other: &Self) -> Ordering {
        self.sort_keys
            .compare(&self.tuple, &other.tuple)
            .then_with(|| self.run_index.cmp(&other.run_index))
    }
}

impl PartialEq for MultiKeyEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.value_cmp(other) == Ordering::Equal
    }
}

impl Eq for MultiKeyEntry<'_> {}

impl PartialOrd for MultiKeyEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MultiKeyEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value_cmp(other).reverse()
    }
}

impl HeadEntry for MultiKeyEntry<'_> {
    fn run_index(&self) -> usize {
        self.run_index
    }

    fn into_tuple(self) -> Tuple {
        self.tuple
    }
}

fn copy_run(cursor: &mut RunIterator, writer: &mut OutputWriter) -> Result<()> {
    writer.write_remaining(cursor)
}

/// Pops the smallest head until the heap is empty or the writer is full.
///
/// `admit` decides what to do with the next tuple of the popped run.
fn drain_heap<E, F>(
    heap: &mut BinaryHeap<E>,
    cursors: &mut [RunIterator],
    writer: &mut OutputWriter,
    mut admit: F,
) -> Result<()>
where
    E: HeadEntry,
    F: FnMut(&mut BinaryHeap<E>, usize, Tuple),
{
    while !writer.is_full() {
        let Some(top) = heap.pop() else {
            break;
        };
        let run_index = top.run_index();
        writer.write(top.into_tuple())?;
        if writer.is_full() {
            // Don't read more input than the output needs.
            break;
        }
        if let Some(tuple) = cursors[run_index].next_tuple()? {
            admit(heap, run_index, tuple);
        }
    }
    Ok(())
}

/// Merges runs sorted by one column with nulls last.
///
/// Only non-null values enter the heap. Once a run reaches its null tail, the run
/// is put aside and its nulls are written after the heap is drained.
fn merge_single_column_nulls_last(
    key: SortKey,
    cursors: &mut [RunIterator],
    writer: &mut OutputWriter,
) -> Result<()> {
    let mut heap = BinaryHeap::with_capacity(cursors.len());
    // First null tuple of each run that reached its null tail.
    let mut null_tails = Vec::new();
    let mut admit = |heap: &mut BinaryHeap<SingleKeyEntry>, run_index: usize, tuple: Tuple| {
        if tuple[key.attr].is_null() {
            null_tails.push((run_index, tuple));
        } else {
            heap.push(SingleKeyEntry {
                tuple,
                run_index,
                key,
            });
        }
    };

    for (run_index, cursor) in cursors.iter_mut().enumerate() {
        if let Some(tuple) = cursor.next_tuple()? {
            admit(&mut heap, run_index, tuple);
        }
    }
    drain_heap(&mut heap, cursors, writer, &mut admit)?;

    for (run_index, first_null) in null_tails {
        if writer.is_full() {
            break;
        }
        writer.write(first_null)?;
        writer.write_remaining(&mut cursors[run_index])?;
    }

    Ok(())
}

/// Merges runs sorted by one column with nulls first.
///
/// Leading nulls of each run are written before the run enters the heap.
fn merge_single_column_nulls_first(
    key: SortKey,
    cursors: &mut [RunIterator],
    writer: &mut OutputWriter,
) -> Result<()> {
    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (run_index, cursor) in cursors.iter_mut().enumerate() {
        while !writer.is_full() {
            let Some(tuple) = cursor.next_tuple()? else {
                break;
            };
            if tuple[key.attr].is_null() {
                writer.write(tuple)?;
            } else {
                heap.push(SingleKeyEntry {
                    tuple,
                    run_index,
                    key,
                });
                break;
            }
        }
    }

    drain_heap(&mut heap, cursors, writer, |heap, run_index, tuple| {
        debug_assert!(!tuple[key.attr].is_null());
        heap.push(SingleKeyEntry {
            tuple,
            run_index,
            key,
        });
    })
}

/// Merges runs by comparing all sort columns.
fn merge_multi_column(
    sort_keys: &SortKeyConfig,
    cursors: &mut [RunIterator],
    writer: &mut OutputWriter,
) -> Result<()> {
    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (run_index, cursor) in cursors.iter_mut().enumerate() {
        if let Some(tuple) = cursor.next_tuple()? {
            heap.push(MultiKeyEntry {
                tuple,
                run_index,
                sort_keys,
            });
        }
    }

    drain_heap(&mut heap, cursors, writer, |heap, run_index, tuple| {
        heap.push(MultiKeyEntry {
            tuple,
            run_index,
            sort_keys,
        });
    })
}
