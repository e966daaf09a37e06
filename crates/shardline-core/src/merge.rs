//! Cross-table merge of per-key fragments
//!
//! A lookup fans out to several tables. Each table that has the key yields
//! one fragment; a [`MergeOperator`] folds them into a single payload.
//! Merges must not depend on the order tables answered in.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::value::{json_fragment, FeatureValue};

/// Strategy for combining per-table fragments of one key
pub trait MergeOperator: Send + Sync {
    type Output: Send;

    /// Builds the fragment for one table's row
    fn fragment(&self, table: &str, values: &BTreeMap<String, FeatureValue>)
        -> Result<Self::Output>;

    /// Combines two fragments; an empty side returns the other unchanged
    fn merge(&self, left: Self::Output, right: Self::Output) -> Self::Output;

    /// Folds fragments left to right, `None` only when there are none
    ///
    /// A hit whose row carries no feature columns still yields `Some` of an
    /// empty output.
    fn merge_all<I>(&self, fragments: I) -> Option<Self::Output>
    where
        I: IntoIterator<Item = Self::Output>,
    {
        fragments
            .into_iter()
            .reduce(|left, right| self.merge(left, right))
    }
}

/// Joins JSON object bodies (no outer braces) with a single comma
///
/// The caller wraps the final result with [`JsonMergeOperator::wrap`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMergeOperator;

impl JsonMergeOperator {
    pub fn wrap(body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len() + 2);
        out.push(b'{');
        out.extend_from_slice(body);
        out.push(b'}');
        out
    }
}

impl MergeOperator for JsonMergeOperator {
    type Output = Vec<u8>;

    fn fragment(&self, _table: &str, values: &BTreeMap<String, FeatureValue>) -> Result<Vec<u8>> {
        json_fragment(values)
    }

    fn merge(&self, mut left: Vec<u8>, right: Vec<u8>) -> Vec<u8> {
        if left.is_empty() {
            return right;
        }
        if right.is_empty() {
            return left;
        }
        left.reserve(right.len() + 1);
        left.push(b',');
        left.extend_from_slice(&right);
        left
    }
}

/// Unions typed values keyed by `"table/column"`
#[derive(Debug, Clone, Copy, Default)]
pub struct MapMergeOperator;

impl MergeOperator for MapMergeOperator {
    type Output = BTreeMap<String, FeatureValue>;

    fn fragment(
        &self,
        table: &str,
        values: &BTreeMap<String, FeatureValue>,
    ) -> Result<Self::Output> {
        Ok(values
            .iter()
            .map(|(column, value)| (format!("{}/{}", table, column), value.clone()))
            .collect())
    }

    fn merge(&self, mut left: Self::Output, mut right: Self::Output) -> Self::Output {
        if left.len() < right.len() {
            std::mem::swap(&mut left, &mut right);
        }
        left.extend(right);
        left
    }
}
