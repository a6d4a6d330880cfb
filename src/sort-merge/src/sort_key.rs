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

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};

use crate::error::{EmptySortKeysSnafu, Error, InvalidSortKeySnafu, ParseSortKeysSnafu, Result};
use crate::storage::{AttributeId, Tuple, Value};

/// One column of the sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Attribute the key reads.
    #[serde(rename = "expression")]
    pub attr: AttributeId,
    #[serde(rename = "is_ascending")]
    pub ascending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    /// Ascending key with nulls last.
    pub fn asc(attr: AttributeId) -> SortKey {
        SortKey {
            attr,
            ascending: true,
            nulls_first: false,
        }
    }

    /// Descending key with nulls first.
    pub fn desc(attr: AttributeId) -> SortKey {
        SortKey {
            attr,
            ascending: false,
            nulls_first: true,
        }
    }

    pub fn with_nulls_first(mut self, nulls_first: bool) -> SortKey {
        self.nulls_first = nulls_first;
        self
    }

    /// Compares two non-null values by the direction of this key.
    pub fn cmp_non_null(&self, left: &Value, right: &Value) -> Ordering {
        let ordering = left.cmp_non_null(right);
        if self.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }

    /// Compares two values by the direction and null ordering of this key.
    pub fn cmp_values(&self, left: &Value, right: &Value) -> Ordering {
        match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if self.nulls_first => Ordering::Less,
            (true, false) => Ordering::Greater,
            (false, true) if self.nulls_first => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.cmp_non_null(left, right),
        }
    }
}

/// Ordered list of sort keys shared by all merges of one sort.
///
/// The config is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<SortKey>", into = "Vec<SortKey>")]
pub struct SortKeyConfig {
    keys: Vec<SortKey>,
}

pub type SortKeyConfigRef = Arc<SortKeyConfig>;

impl SortKeyConfig {
    pub fn try_new(keys: Vec<SortKey>) -> Result<SortKeyConfig> {
        ensure!(!keys.is_empty(), EmptySortKeysSnafu);
        Ok(SortKeyConfig { keys })
    }

    /// Parses the config from its json form, e.g.
    /// `[{"expression": 0, "is_ascending": true, "nulls_first": false}]`.
    pub fn from_json(s: &str) -> Result<SortKeyConfig> {
        serde_json::from_str(s).context(ParseSortKeysSnafu)
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns the key if the config sorts by exactly one column.
    pub fn single_key(&self) -> Option<&SortKey> {
        match self.keys.as_slice() {
            [key] => Some(key),
            _ => None,
        }
    }

    /// Checks every key reads an attribute of tuples with `arity` values.
    pub fn validate_arity(&self, arity: usize) -> Result<()> {
        for key in &self.keys {
            ensure!(
                key.attr < arity,
                InvalidSortKeySnafu {
                    reason: format!(
                        "attribute {} is out of bound, tuple arity: {}",
                        key.attr, arity
                    ),
                }
            );
        }
        Ok(())
    }

    /// Compares two tuples lexicographically. Ties fall through to the next key.
    pub fn compare(&self, left: &Tuple, right: &Tuple) -> Ordering {
        for key in &self.keys {
            match key.cmp_values(&left[key.attr], &right[key.attr]) {
                Ordering::Equal => {}
                ordering => return ordering,
            }
        }
        Ordering::Equal
    }
}

impl TryFrom<Vec<SortKey>> for SortKeyConfig {
    type Error = Error;

    fn try_from(keys: Vec<SortKey>) -> Result<Self> {
        SortKeyConfig::try_new(keys)
    }
}

impl From<SortKeyConfig> for Vec<SortKey> {
    fn from(config: SortKeyConfig) -> Self {
        config.keys
    }
}
