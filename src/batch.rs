//! Batching helper for bounded `IN (...)` queries.

use crate::error::{LoaderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batcher {
    size: usize,
}

impl Batcher {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(LoaderError::Configuration("batch size must be positive".into()));
        }
        Ok(Self { size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Consecutive batches in input order; only the last may be short.
    pub fn iter<'a, T>(&self, items: &'a [T]) -> std::slice::Chunks<'a, T> {
        items.chunks(self.size)
    }

    pub fn split<T: Clone>(&self, items: &[T]) -> Vec<Vec<T>> {
        self.iter(items).map(<[T]>::to_vec).collect()
    }
}

/// Comma-separated list for substitution into an `IN (...)` template.
pub fn in_list(ids: &[i64]) -> String {
    ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",")
}
