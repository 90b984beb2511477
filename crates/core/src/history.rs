#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::hash::Hash;

/// Scans items newest to oldest, keeps the first (most recent) occurrence of each key and
/// stops once `limit` survivors are collected. Output stays newest-first.
pub fn dedup_newest_first<T, K, I, F>(newest_first: I, limit: usize, mut key: F) -> Vec<T>
where
    I: IntoIterator<Item = T>,
    K: Eq + Hash,
    F: FnMut(&T) -> K,
{
    let mut seen = HashSet::<K>::new();
    let mut out = Vec::new();
    for item in newest_first {
        if out.len() >= limit {
            break;
        }
        if seen.insert(key(&item)) {
            out.push(item);
        }
    }
    out
}

/// Oldest-first in, oldest-first out. A revisited key moves to the position of its latest
/// occurrence; survivors never reorder relative to each other.
///
/// `V1, V2, V1, V3` becomes `V2, V1, V3`.
pub fn dedup_keep_latest<T, K, F>(chronological: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: FnMut(&T) -> K,
{
    let mut out = dedup_newest_first(chronological.into_iter().rev(), usize::MAX, key);
    out.reverse();
    out
}
