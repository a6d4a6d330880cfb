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

//! Sorted runs and helpers to write and read them.

use std::mem;

use tracing::warn;

use crate::error::{Result, TupleTooLargeSnafu};
use crate::storage::{Block, BlockId, BlockProvider, BlockProviderRef, BlockRef, Tuple};

/// A sequence of blocks holding one contiguous sorted stream of tuples.
///
/// A block belongs to at most one run. A run is consumed exactly once, then
/// its blocks are released to the storage layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Run {
    blocks: Vec<BlockId>,
}

impl Run {
    /// Returns an empty run.
    pub fn new() -> Run {
        Run::default()
    }

    /// Returns a run that consists of a single sorted block.
    pub fn singleton(block_id: BlockId) -> Run {
        Run {
            blocks: vec![block_id],
        }
    }

    pub fn from_blocks(blocks: Vec<BlockId>) -> Run {
        Run { blocks }
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Counts tuples in the run.
    pub fn num_tuples(&self, provider: &dyn BlockProvider) -> Result<usize> {
        let mut num_tuples = 0;
        for block_id in &self.blocks {
            num_tuples += provider.get_block(*block_id)?.num_tuples();
        }
        Ok(num_tuples)
    }

    /// Releases all blocks of a consumed run.
    pub fn release(self, provider: &dyn BlockProvider) -> Result<()> {
        for block_id in self.blocks {
            provider.release_block(block_id)?;
        }
        Ok(())
    }
}

/// Appends tuples to a growing [Run].
///
/// The builder returns its current block to the provider on [RunBuilder::finish]
/// or on drop.
pub struct RunBuilder {
    run: Run,
    provider: BlockProviderRef,
    /// Block being written. `None` once the builder is finished.
    current: Option<Block>,
    /// Number of blocks the run had before this builder.
    num_existing_blocks: usize,
    num_tuples: usize,
}

impl RunBuilder {
    /// Creates a builder that appends to `run` and acquires the first writable block.
    pub fn new(mut run: Run, provider: BlockProviderRef) -> Result<RunBuilder> {
        let num_existing_blocks = run.num_blocks();
        let block = provider.get_block_for_write()?;
        run.blocks.push(block.id());

        Ok(RunBuilder {
            run,
            provider,
            current: Some(block),
            num_existing_blocks,
            num_tuples: 0,
        })
    }

    /// Returns the number of tuples appended by this builder.
    pub fn num_tuples(&self) -> usize {
        self.num_tuples
    }

    /// Appends a tuple to the run.
    ///
    /// If the current block is full, it is returned to the provider and the write is
    /// retried once against a fresh block.
    pub fn append(&mut self, tuple: Tuple) -> Result<()> {
        // The current block is `None` if acquiring a block failed before.
        let tuple = match self.current.as_mut() {
            Some(block) => match block.try_append(tuple) {
                Ok(()) => {
                    self.num_tuples += 1;
                    return Ok(());
                }
                Err(tuple) => tuple,
            },
            None => tuple,
        };

        if let Some(full) = self.current.take() {
            self.provider.return_block(full, true)?;
        }
        let mut block = self.provider.get_block_for_write()?;
        self.run.blocks.push(block.id());
        let result = block.try_append(tuple);
        let block_id = block.id();
        self.current = Some(block);
        if let Err(tuple) = result {
            return TupleTooLargeSnafu {
                block_id,
                num_values: tuple.len(),
            }
            .fail();
        }
        self.num_tuples += 1;

        Ok(())
    }

    /// Returns the current block to the provider and returns the built run.
    pub fn finish(mut self) -> Result<Run> {
        self.return_current()?;
        Ok(mem::take(&mut self.run))
    }

    /// Gives up the run and releases every block this builder wrote.
    pub fn abort(mut self) -> Result<()> {
        if let Some(block) = self.current.take() {
            self.run.blocks.pop();
            self.provider.return_block(block, false)?;
        }
        let written = self.run.blocks.split_off(self.num_existing_blocks);
        Run::from_blocks(written).release(self.provider.as_ref())
    }

    fn return_current(&mut self) -> Result<()> {
        let Some(block) = self.current.take() else {
            return Ok(());
        };

        if block.is_empty() {
            // Don't leave an empty trailing block in the run.
            let last = self.run.blocks.pop();
            debug_assert_eq!(Some(block.id()), last);
            self.provider.return_block(block, false)
        } else {
            self.provider.return_block(block, true)
        }
    }
}

impl Drop for RunBuilder {
    fn drop(&mut self) {
        if let Err(e) = self.return_current() {
            warn!("Failed to return block on dropping run builder, error: {}", e);
        }
    }
}

/// Lazily reads tuples of a [Run] in append order.
///
/// Creating another iterator on the same run reads the same tuples again.
pub struct RunIterator {
    blocks: Vec<BlockId>,
    provider: BlockProviderRef,
    /// Index of the next block to load.
    next_block: usize,
    current: Option<BlockRef>,
    /// Position of the next tuple in the current block.
    pos: usize,
}

impl RunIterator {
    pub fn new(run: &Run, provider: BlockProviderRef) -> RunIterator {
        RunIterator {
            blocks: run.blocks.clone(),
            provider,
            next_block: 0,
            current: None,
            pos: 0,
        }
    }

    /// Returns the next tuple or `None` once every block is exhausted.
    pub fn next_tuple(&mut self) -> Result<Option<Tuple>> {
        loop {
            if let Some(block) = &self.current {
                let accessor = block.accessor();
                if self.pos < accessor.num_tuples() {
                    let tuple = accessor.tuple(self.pos);
                    self.pos += 1;
                    return Ok(Some(tuple));
                }
            }

            let Some(block_id) = self.blocks.get(self.next_block) else {
                self.current = None;
                return Ok(None);
            };
            self.current = Some(self.provider.get_block(*block_id)?);
            self.next_block += 1;
            self.pos = 0;
        }
    }
}

impl Iterator for RunIterator {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_tuple().transpose()
    }
}
