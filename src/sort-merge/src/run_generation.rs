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

//! Initial sort of input blocks into level-0 runs.

use tracing::debug;

use crate::error::{Result, TupleTooLargeSnafu};
use crate::run::Run;
use crate::sort_key::SortKeyConfig;
use crate::storage::{BlockId, BlockProvider, Tuple};

/// Sorts the tuples of one published block into a new single-block run.
///
/// The sort is stable. The source block is released once the sorted copy is
/// published. An empty block yields an empty run.
pub fn sort_block_into_run(
    provider: &dyn BlockProvider,
    block_id: BlockId,
    sort_keys: &SortKeyConfig,
) -> Result<Run> {
    let source = provider.get_block(block_id)?;
    let mut tuples: Vec<Tuple> = source.accessor().iter().collect();
    drop(source);
    if let Some(first) = tuples.first() {
        sort_keys.validate_arity(first.len())?;
    }
    tuples.sort_by(|left, right| sort_keys.compare(left, right));

    let mut block = provider.get_block_for_write()?;
    let num_tuples = tuples.len();
    for tuple in tuples {
        if let Err(tuple) = block.try_append(tuple) {
            let sorted_id = block.id();
            provider.return_block(block, false)?;
            return TupleTooLargeSnafu {
                block_id: sorted_id,
                num_values: tuple.len(),
            }
            .fail();
        }
    }

    let run = if block.is_empty() {
        provider.return_block(block, false)?;
        Run::new()
    } else {
        let sorted_id = block.id();
        provider.return_block(block, true)?;
        Run::singleton(sorted_id)
    };
    provider.release_block(block_id)?;
    debug!("Sorted block {} into run {:?}, tuples: {}", block_id, run, num_tuples);

    Ok(run)
}
