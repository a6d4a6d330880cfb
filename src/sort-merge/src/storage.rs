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

//! Blocks, values and the block provider the sort reads and writes through.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt};
use tracing::debug;

use crate::config::{SortMergeConfig, DEFAULT_BLOCK_CAPACITY};
use crate::error::{BlockExhaustedSnafu, BlockNotFoundSnafu, Result, TupleTooLargeSnafu};
use crate::metrics::LIVE_BLOCKS;

/// Id of an attribute (column) inside a tuple.
pub type AttributeId = usize;

/// Id of a block in the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single value of a tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    String(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Rank of the value type, used to order values of different types.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Int64(_) => 2,
            Value::Float64(_) => 3,
            Value::String(_) => 4,
        }
    }

    /// Compares two non-null values in ascending order.
    ///
    /// Floats are totally ordered. Values of different types are ordered
    /// by their type.
    pub fn cmp_non_null(&self, other: &Value) -> Ordering {
        debug_assert!(!self.is_null() && !other.is_null());

        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<Option<i64>> for Value {
    fn from(v: Option<i64>) -> Self {
        v.map(Value::Int64).unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

/// A row of values.
pub type Tuple = Vec<Value>;

/// Physical layout of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockLayout {
    #[default]
    Row,
    Column,
}

/// Tuples stored in a block.
#[derive(Debug, Clone)]
enum BlockData {
    Row(Vec<Tuple>),
    Column {
        columns: Vec<Vec<Value>>,
        num_tuples: usize,
    },
}

/// A fixed capacity container of tuples.
#[derive(Debug, Clone)]
pub struct Block {
    id: BlockId,
    capacity: usize,
    data: BlockData,
}

pub type BlockRef = Arc<Block>;

impl Block {
    /// Creates an empty block that holds at most `capacity` tuples.
    pub fn new(id: BlockId, layout: BlockLayout, capacity: usize) -> Block {
        let data = match layout {
            BlockLayout::Row => BlockData::Row(Vec::with_capacity(capacity)),
            BlockLayout::Column => BlockData::Column {
                columns: Vec::new(),
                num_tuples: 0,
            },
        };
        Block { id, capacity, data }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn layout(&self) -> BlockLayout {
        match self.data {
            BlockData::Row(_) => BlockLayout::Row,
            BlockData::Column { .. } => BlockLayout::Column,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_tuples(&self) -> usize {
        match &self.data {
            BlockData::Row(rows) => rows.len(),
            BlockData::Column { num_tuples, .. } => *num_tuples,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_tuples() == 0
    }

    pub fn is_full(&self) -> bool {
        self.num_tuples() >= self.capacity
    }

    /// Appends a tuple and returns the tuple back if the block rejects it.
    ///
    /// A column block only accepts tuples with the arity of its first tuple.
    pub fn try_append(&mut self, tuple: Tuple) -> std::result::Result<(), Tuple> {
        if self.is_full() {
            return Err(tuple);
        }

        match &mut self.data {
            BlockData::Row(rows) => rows.push(tuple),
            BlockData::Column {
                columns,
                num_tuples,
            } => {
                if *num_tuples == 0 {
                    *columns = (0..tuple.len())
                        .map(|_| Vec::with_capacity(self.capacity))
                        .collect();
                } else if columns.len() != tuple.len() {
                    return Err(tuple);
                }
                for (column, value) in columns.iter_mut().zip(tuple) {
                    column.push(value);
                }
                *num_tuples += 1;
            }
        }

        Ok(())
    }

    /// Returns an accessor to read values of this block.
    pub fn accessor(&self) -> ValueAccessor<'_> {
        match &self.data {
            BlockData::Row(rows) => ValueAccessor::Row(rows),
            BlockData::Column {
                columns,
                num_tuples,
            } => ValueAccessor::Column {
                columns,
                num_tuples: *num_tuples,
            },
        }
    }
}

/// Reads values of a block by position.
///
/// The layout is resolved once when the accessor is created.
#[derive(Debug, Clone, Copy)]
pub enum ValueAccessor<'a> {
    Row(&'a [Tuple]),
    Column {
        columns: &'a [Vec<Value>],
        num_tuples: usize,
    },
}

impl<'a> ValueAccessor<'a> {
    pub fn num_tuples(&self) -> usize {
        match self {
            ValueAccessor::Row(rows) => rows.len(),
            ValueAccessor::Column { num_tuples, .. } => *num_tuples,
        }
    }

    /// Returns the value of `attr` at tuple position `pos`.
    ///
    /// # Panics
    /// Panics if `pos` or `attr` is out of bound.
    pub fn value(&self, pos: usize, attr: AttributeId) -> &'a Value {
        match self {
            ValueAccessor::Row(rows) => &rows[pos][attr],
            ValueAccessor::Column { columns, .. } => &columns[attr][pos],
        }
    }

    /// Copies the whole tuple at position `pos`.
    pub fn tuple(&self, pos: usize) -> Tuple {
        match self {
            ValueAccessor::Row(rows) => rows[pos].clone(),
            ValueAccessor::Column { columns, .. } => {
                columns.iter().map(|column| column[pos].clone()).collect()
            }
        }
    }

    /// Iterates all tuples in order.
    pub fn iter(&self) -> impl Iterator<Item = Tuple> + 'a {
        let accessor = *self;
        (0..accessor.num_tuples()).map(move |pos| accessor.tuple(pos))
    }
}

/// The storage layer that hands out blocks to the sort.
///
/// Any error returned by the provider is fatal to the sort.
pub trait BlockProvider: Send + Sync {
    /// Returns an empty writable block.
    fn get_block_for_write(&self) -> Result<Block>;

    /// Gives a writable block back. A `dirty` block is published and becomes
    /// readable, a clean block is discarded.
    fn return_block(&self, block: Block, dirty: bool) -> Result<()>;

    /// Returns a published block.
    fn get_block(&self, block_id: BlockId) -> Result<BlockRef>;

    /// Releases a published block once nothing references it.
    fn release_block(&self, block_id: BlockId) -> Result<()>;
}

pub type BlockProviderRef = Arc<dyn BlockProvider>;

/// Options of the [MemoryBlockStore].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBlockStoreOptions {
    pub layout: BlockLayout,
    /// Number of tuples in each block.
    pub block_capacity: usize,
    /// Max number of blocks allocated at the same time, `None` means unlimited.
    pub max_blocks: Option<usize>,
}

impl Default for MemoryBlockStoreOptions {
    fn default() -> Self {
        MemoryBlockStoreOptions {
            layout: BlockLayout::Row,
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            max_blocks: None,
        }
    }
}

impl From<&SortMergeConfig> for MemoryBlockStoreOptions {
    fn from(config: &SortMergeConfig) -> Self {
        MemoryBlockStoreOptions {
            block_capacity: config.block_capacity,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    next_block_id: u64,
    /// Blocks handed out for write but not returned yet.
    writing: usize,
    published: HashMap<BlockId, BlockRef>,
}

impl StoreInner {
    fn allocated(&self) -> usize {
        self.writing + self.published.len()
    }
}

/// A [BlockProvider] that keeps all blocks in memory.
#[derive(Debug)]
pub struct MemoryBlockStore {
    options: MemoryBlockStoreOptions,
    inner: Mutex<StoreInner>,
}

impl MemoryBlockStore {
    pub fn new(options: MemoryBlockStoreOptions) -> MemoryBlockStore {
        debug_assert!(options.block_capacity > 0);
        MemoryBlockStore {
            options,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Returns the options of the store.
    pub fn options(&self) -> &MemoryBlockStoreOptions {
        &self.options
    }

    /// Returns the number of blocks allocated and not released yet.
    pub fn num_live_blocks(&self) -> usize {
        self.inner.lock().unwrap().allocated()
    }

    /// Writes `tuples` into new published blocks, splitting by block capacity.
    pub fn load_blocks(&self, tuples: Vec<Tuple>) -> Result<Vec<BlockId>> {
        let mut block_ids = Vec::new();
        let mut block = self.get_block_for_write()?;
        for tuple in tuples {
            if let Err(tuple) = block.try_append(tuple) {
                block_ids.push(block.id());
                self.return_block(block, true)?;
                block = self.get_block_for_write()?;
                if let Err(tuple) = block.try_append(tuple) {
                    let block_id = block.id();
                    self.return_block(block, false)?;
                    return TupleTooLargeSnafu {
                        block_id,
                        num_values: tuple.len(),
                    }
                    .fail();
                }
            }
        }
        if block.is_empty() {
            self.return_block(block, false)?;
        } else {
            block_ids.push(block.id());
            self.return_block(block, true)?;
        }

        Ok(block_ids)
    }
}

impl BlockProvider for MemoryBlockStore {
    fn get_block_for_write(&self) -> Result<Block> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(max_blocks) = self.options.max_blocks {
            let allocated = inner.allocated();
            ensure!(allocated < max_blocks, BlockExhaustedSnafu { allocated });
        }

        let block_id = BlockId(inner.next_block_id);
        inner.next_block_id += 1;
        inner.writing += 1;
        LIVE_BLOCKS.inc();

        Ok(Block::new(
            block_id,
            self.options.layout,
            self.options.block_capacity,
        ))
    }

    fn return_block(&self, block: Block, dirty: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.writing > 0);
        inner.writing -= 1;
        if dirty {
            inner.published.insert(block.id(), Arc::new(block));
        } else {
            debug!("Discard unused block {}", block.id());
            LIVE_BLOCKS.dec();
        }

        Ok(())
    }

    fn get_block(&self, block_id: BlockId) -> Result<BlockRef> {
        let inner = self.inner.lock().unwrap();
        inner
            .published
            .get(&block_id)
            .cloned()
            .context(BlockNotFoundSnafu { block_id })
    }

    fn release_block(&self, block_id: BlockId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .published
            .remove(&block_id)
            .context(BlockNotFoundSnafu { block_id })?;
        LIVE_BLOCKS.dec();

        Ok(())
    }
}
