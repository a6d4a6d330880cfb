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

//! Utilities for testing.

use std::sync::{Arc, Once};

use rand::Rng;
use tracing_subscriber::EnvFilter;

use crate::run::{Run, RunIterator};
use crate::run_generation::sort_block_into_run;
use crate::sort_key::SortKeyConfig;
use crate::storage::{BlockId, MemoryBlockStore, MemoryBlockStoreOptions, Tuple, Value};

static START: Once = Once::new();

/// Init tracing for unittest.
/// Write logs to the test output, the level is read from `UNITTEST_LOG_LEVEL`.
pub fn init_default_ut_logging() {
    START.call_once(|| {
        let level = std::env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(level))
            .with_test_writer()
            .try_init();
    });
}

/// Returns an unbounded row store whose blocks hold `block_capacity` tuples.
pub fn new_store(block_capacity: usize) -> Arc<MemoryBlockStore> {
    Arc::new(MemoryBlockStore::new(MemoryBlockStoreOptions {
        block_capacity,
        ..Default::default()
    }))
}

/// Builds single column tuples, `None` is null.
pub fn int_tuples(values: &[Option<i64>]) -> Vec<Tuple> {
    values.iter().map(|v| vec![Value::from(*v)]).collect()
}

/// Reads the integer column `attr` of `tuples`.
pub fn int_values(tuples: &[Tuple], attr: usize) -> Vec<Option<i64>> {
    tuples
        .iter()
        .map(|tuple| match &tuple[attr] {
            Value::Null => None,
            Value::Int64(v) => Some(*v),
            other => panic!("unexpected value {:?}", other),
        })
        .collect()
}

/// Writes already sorted `tuples` into a run.
pub fn new_run(store: &Arc<MemoryBlockStore>, tuples: Vec<Tuple>) -> Run {
    Run::from_blocks(store.load_blocks(tuples).unwrap())
}

/// Reads all tuples of `run`.
pub fn collect_run(run: &Run, store: &Arc<MemoryBlockStore>) -> Vec<Tuple> {
    RunIterator::new(run, store.clone())
        .collect::<crate::error::Result<_>>()
        .unwrap()
}

/// Stable sorts `tuples` by `sort_keys`.
pub fn sort_tuples(mut tuples: Vec<Tuple>, sort_keys: &SortKeyConfig) -> Vec<Tuple> {
    tuples.sort_by(|left, right| sort_keys.compare(left, right));
    tuples
}

/// Loads `tuples` and sorts each block, returns the sorted blocks.
pub fn new_sorted_blocks(
    store: &Arc<MemoryBlockStore>,
    tuples: Vec<Tuple>,
    sort_keys: &SortKeyConfig,
) -> Vec<BlockId> {
    store
        .load_blocks(tuples)
        .unwrap()
        .into_iter()
        .flat_map(|block_id| {
            sort_block_into_run(store.as_ref(), block_id, sort_keys)
                .unwrap()
                .blocks()
                .to_vec()
        })
        .collect()
}

/// Generates `len` random integer tuples with `arity` columns and about 10% nulls.
pub fn random_tuples<R: Rng>(rng: &mut R, len: usize, arity: usize) -> Vec<Tuple> {
    (0..len)
        .map(|_| {
            (0..arity)
                .map(|_| {
                    if rng.gen_bool(0.1) {
                        Value::Null
                    } else {
                        Value::Int64(rng.gen_range(0..20))
                    }
                })
                .collect()
        })
        .collect()
}
