//! Redundancy Interner
//!
//! Wraps a grouped materializer and collapses entries that share an
//! identity key across every group onto one shared `Arc`, the one seen
//! first in group-then-entry order. Group placement and positions are
//! left as the upstream produced them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use tracing::debug;

use crate::error::{LoaderError, Result};

/// `group key -> [(identity key, object)]`, groups in upstream order.
pub type GroupedCollections<G, K, T> = IndexMap<G, Vec<(K, Arc<T>)>>;

/// Produces a keyed collection of collections for a request.
pub trait GroupedMaterializer<Req: ?Sized> {
    type Group: Eq + Hash;
    type Key: Eq + Hash + Clone;
    type Item;

    fn materialize(&self, request: &Req) -> Result<GroupedCollections<Self::Group, Self::Key, Self::Item>>;
}

/// Identity key to first-seen instance for one materialization pass.
pub struct CanonicalTable<K, T> {
    canonical: HashMap<K, Arc<T>>,
}

impl<K: Eq + Hash, T> CanonicalTable<K, T> {
    pub fn new() -> Self {
        Self { canonical: HashMap::new() }
    }

    /// Returns the canonical instance for `key`, recording `candidate` if
    /// the key is new.
    pub fn intern(&mut self, key: K, candidate: Arc<T>) -> Arc<T> {
        self.canonical.entry(key).or_insert(candidate).clone()
    }

    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }
}

impl<K: Eq + Hash, T> Default for CanonicalTable<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Check-and-insert under a mutex, for passes whose entries are produced
/// on several threads. Whichever thread interns a key first wins.
pub struct SharedCanonicalTable<K, T> {
    inner: Mutex<CanonicalTable<K, T>>,
}

impl<K: Eq + Hash, T> SharedCanonicalTable<K, T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CanonicalTable::new()),
        }
    }

    pub fn intern(&self, key: K, candidate: Arc<T>) -> Result<Arc<T>> {
        let mut table = self
            .inner
            .lock()
            .map_err(|_| LoaderError::Configuration("canonical table poisoned".into()))?;
        Ok(table.intern(key, candidate))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash, T> Default for SharedCanonicalTable<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonicalize already-materialized groups. Empty groups are kept.
pub fn intern_groups<G, K, T>(groups: GroupedCollections<G, K, T>) -> GroupedCollections<G, K, T>
where
    G: Eq + Hash,
    K: Eq + Hash + Clone,
{
    let mut table = CanonicalTable::new();
    let mut collapsed = 0usize;

    let out: GroupedCollections<G, K, T> = groups
        .into_iter()
        .map(|(group, entries)| {
            let entries = entries
                .into_iter()
                .map(|(key, item)| {
                    let canonical = table.intern(key.clone(), item.clone());
                    if !Arc::ptr_eq(&canonical, &item) {
                        collapsed += 1;
                    }
                    (key, canonical)
                })
                .collect();
            (group, entries)
        })
        .collect();

    debug!("Interned {} distinct objects, {} duplicates collapsed", table.len(), collapsed);
    out
}

/// Materializer decorator applying `intern_groups` to every result. Each
/// call gets a fresh canonical table.
pub struct RedundancyInterner<M> {
    inner: M,
}

impl<M> RedundancyInterner<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }
}

impl<Req: ?Sized, M: GroupedMaterializer<Req>> GroupedMaterializer<Req> for RedundancyInterner<M> {
    type Group = M::Group;
    type Key = M::Key;
    type Item = M::Item;

    fn materialize(&self, request: &Req) -> Result<GroupedCollections<Self::Group, Self::Key, Self::Item>> {
        Ok(intern_groups(self.inner.materialize(request)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Returns fixed groups regardless of request.
    struct Fixed(Vec<(&'static str, Vec<(u32, &'static str)>)>);

    impl GroupedMaterializer<()> for Fixed {
        type Group = &'static str;
        type Key = u32;
        type Item = String;

        fn materialize(&self, _request: &()) -> Result<GroupedCollections<&'static str, u32, String>> {
            Ok(self
                .0
                .iter()
                .map(|(group, entries)| {
                    let entries = entries.iter().map(|(id, v)| (*id, Arc::new(v.to_string()))).collect();
                    (*group, entries)
                })
                .collect())
        }
    }

    fn values(groups: &GroupedCollections<&'static str, u32, String>, group: &str) -> Vec<(u32, String)> {
        groups[group].iter().map(|(k, v)| (*k, v.as_ref().clone())).collect()
    }

    #[test]
    fn test_first_seen_instance_wins_across_groups() {
        let upstream = Fixed(vec![
            ("A", vec![(1, "A"), (2, "B")]),
            ("B", vec![(1, "C"), (3, "D")]),
            ("C", vec![(3, "E"), (4, "F")]),
        ]);
        let out = RedundancyInterner::new(upstream).materialize(&()).unwrap();

        assert_eq!(values(&out, "A"), vec![(1, "A".to_string()), (2, "B".to_string())]);
        assert_eq!(values(&out, "B"), vec![(1, "A".to_string()), (3, "D".to_string())]);
        assert_eq!(values(&out, "C"), vec![(3, "D".to_string()), (4, "F".to_string())]);

        assert!(Arc::ptr_eq(&out["A"][0].1, &out["B"][0].1));
        assert!(Arc::ptr_eq(&out["B"][1].1, &out["C"][0].1));
        assert!(!Arc::ptr_eq(&out["A"][1].1, &out["C"][1].1));
    }

    #[test]
    fn test_empty_groups_preserved_in_place() {
        let upstream = Fixed(vec![("A", vec![(1, "x")]), ("B", vec![]), ("C", vec![(1, "y")])]);
        let out = RedundancyInterner::new(upstream).materialize(&()).unwrap();

        assert_eq!(out.keys().copied().collect::<Vec<_>>(), vec!["A", "B", "C"]);
        assert!(out["B"].is_empty());
        assert_eq!(out["C"][0].1.as_str(), "x");
    }

    #[test]
    fn test_duplicate_within_one_group() {
        let upstream = Fixed(vec![("A", vec![(7, "first"), (7, "second")])]);
        let out = RedundancyInterner::new(upstream).materialize(&()).unwrap();
        assert_eq!(out["A"].len(), 2);
        assert!(Arc::ptr_eq(&out["A"][0].1, &out["A"][1].1));
    }

    #[test]
    fn test_each_call_gets_fresh_table() {
        let interner = RedundancyInterner::new(Fixed(vec![("A", vec![(1, "x")])]));
        let first = interner.materialize(&()).unwrap();
        let second = interner.materialize(&()).unwrap();
        assert!(!Arc::ptr_eq(&first["A"][0].1, &second["A"][0].1));
    }

    #[test]
    fn test_shared_table_across_threads() {
        let table = Arc::new(SharedCanonicalTable::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = table.clone();
                std::thread::spawn(move || table.intern(i % 2, Arc::new(i)).unwrap())
            })
            .collect();
        let results: Vec<Arc<i32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(table.len(), 2);
        for r in &results {
            let same_key: Vec<_> = results.iter().filter(|o| ***o % 2 == **r % 2).collect();
            assert!(same_key.iter().all(|o| Arc::ptr_eq(o, r)));
        }
    }

    #[test]
    fn test_len_survives_poisoned_table() {
        let table = Arc::new(SharedCanonicalTable::new());
        table.intern("a", Arc::new(1)).unwrap();

        let holder = table.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.inner.lock().unwrap();
            panic!("holder died");
        })
        .join();

        assert_eq!(table.len(), 1);
        assert!(!table.is_empty());
    }
}
