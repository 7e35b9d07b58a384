//! Row Aggregator
//!
//! Folds the flat rows of one query into one object per aggregation key.
//! The first row for a key constructs the object; every later row with that
//! key is merged into it, in row order.

use std::collections::{BTreeSet, HashSet};
use std::hash::Hash;
use std::marker::PhantomData;

use indexmap::map::Entry;
use indexmap::IndexMap;

use crate::error::Result;

pub trait RowAggregator<R> {
    type Key: Eq + Hash;
    type Output;

    fn key(&self, row: &R) -> Result<Self::Key>;

    /// Build the object from the first row seen for its key.
    fn first(&self, row: &R) -> Result<Self::Output>;

    /// Fold a later row into an existing object. `position` is the row's
    /// ordinal in the whole result.
    fn merge(&self, existing: &mut Self::Output, row: &R, position: usize) -> Result<()>;

    /// Output keys appear in first-seen order.
    fn aggregate<I>(&self, rows: I) -> Result<IndexMap<Self::Key, Self::Output>>
    where
        I: IntoIterator<Item = R>,
    {
        let mut out = IndexMap::new();
        for (position, row) in rows.into_iter().enumerate() {
            match out.entry(self.key(&row)?) {
                Entry::Occupied(mut slot) => self.merge(slot.get_mut(), &row, position)?,
                Entry::Vacant(slot) => {
                    slot.insert(self.first(&row)?);
                }
            }
        }
        Ok(out)
    }
}

/// Aggregator assembled from three closures.
pub struct FnAggregator<KF, FF, MF> {
    key: KF,
    first: FF,
    merge: MF,
}

impl<KF, FF, MF> FnAggregator<KF, FF, MF> {
    pub fn new(key: KF, first: FF, merge: MF) -> Self {
        Self { key, first, merge }
    }
}

impl<R, K, T, KF, FF, MF> RowAggregator<R> for FnAggregator<KF, FF, MF>
where
    K: Eq + Hash,
    KF: Fn(&R) -> Result<K>,
    FF: Fn(&R) -> Result<T>,
    MF: Fn(&mut T, &R, usize) -> Result<()>,
{
    type Key = K;
    type Output = T;

    fn key(&self, row: &R) -> Result<K> {
        (self.key)(row)
    }

    fn first(&self, row: &R) -> Result<T> {
        (self.first)(row)
    }

    fn merge(&self, existing: &mut T, row: &R, position: usize) -> Result<()> {
        (self.merge)(existing, row, position)
    }
}

/// Collects one value per row into a multi-valued collection per key.
/// The collection decides what "grouping" means: `Vec` keeps row order,
/// `HashSet` drops duplicates, `BTreeSet` sorts.
pub struct Grouping<KF, VF, C> {
    key: KF,
    value: VF,
    _collection: PhantomData<fn() -> C>,
}

pub type ListGrouping<KF, VF, V> = Grouping<KF, VF, Vec<V>>;
pub type SetGrouping<KF, VF, V> = Grouping<KF, VF, HashSet<V>>;
pub type SortedSetGrouping<KF, VF, V> = Grouping<KF, VF, BTreeSet<V>>;

impl<KF, VF, C> Grouping<KF, VF, C> {
    pub fn new(key: KF, value: VF) -> Self {
        Self {
            key,
            value,
            _collection: PhantomData,
        }
    }
}

impl<R, K, V, C, KF, VF> RowAggregator<R> for Grouping<KF, VF, C>
where
    K: Eq + Hash,
    KF: Fn(&R) -> Result<K>,
    VF: Fn(&R) -> Result<V>,
    C: Default + Extend<V>,
{
    type Key = K;
    type Output = C;

    fn key(&self, row: &R) -> Result<K> {
        (self.key)(row)
    }

    fn first(&self, row: &R) -> Result<C> {
        let mut collection = C::default();
        collection.extend(std::iter::once((self.value)(row)?));
        Ok(collection)
    }

    fn merge(&self, existing: &mut C, row: &R, _position: usize) -> Result<()> {
        existing.extend(std::iter::once((self.value)(row)?));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoaderError;

    type Row = (i64, &'static str);

    fn rows() -> Vec<Row> {
        vec![(1, "a"), (2, "b"), (1, "c")]
    }

    fn key(row: &Row) -> Result<i64> {
        Ok(row.0)
    }

    fn value(row: &Row) -> Result<String> {
        Ok(row.1.to_string())
    }

    #[test]
    fn test_rows_sharing_key_fold_in_order() {
        let aggregator = FnAggregator::new(
            key,
            |row: &Row| Ok(vec![row.1.to_string()]),
            |acc: &mut Vec<String>, row: &Row, _pos: usize| {
                acc.push(row.1.to_string());
                Ok(())
            },
        );

        let out = aggregator.aggregate(rows()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[&1], vec!["a", "c"]);
        assert_eq!(out[&2], vec!["b"]);
        assert_eq!(out.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_merge_receives_row_position() {
        let aggregator = FnAggregator::new(
            key,
            |_row: &Row| Ok(Vec::<usize>::new()),
            |acc: &mut Vec<usize>, _row: &Row, pos: usize| {
                acc.push(pos);
                Ok(())
            },
        );
        let out = aggregator.aggregate(rows()).unwrap();
        assert_eq!(out[&1], vec![2]);
    }

    #[test]
    fn test_groupings_by_collection() {
        let data = vec![(1, "z"), (1, "a"), (1, "z")];

        let list: ListGrouping<_, _, String> = Grouping::new(key, value);
        assert_eq!(list.aggregate(data.clone()).unwrap()[&1], vec!["z", "a", "z"]);

        let set: SetGrouping<_, _, String> = Grouping::new(key, value);
        assert_eq!(set.aggregate(data.clone()).unwrap()[&1].len(), 2);

        let sorted: SortedSetGrouping<_, _, String> = Grouping::new(key, value);
        let out = sorted.aggregate(data).unwrap();
        assert_eq!(out[&1].iter().collect::<Vec<_>>(), vec!["a", "z"]);
    }

    #[test]
    fn test_key_error_aborts() {
        let aggregator: ListGrouping<_, _, String> = Grouping::new(
            |row: &Row| {
                if row.0 == 2 {
                    Err(LoaderError::Integrity("bad row".into()))
                } else {
                    Ok(row.0)
                }
            },
            value,
        );
        assert!(aggregator.aggregate(rows()).is_err());
    }
}
