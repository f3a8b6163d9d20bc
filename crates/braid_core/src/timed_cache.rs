//! Time-bounded caches for in-flight multi-part state.
//!
//! The transaction log keeps partially assembled split transactions (and
//! the reply promises of their parts) for a bounded window; anything older
//! is swept on the next access so an abandoned split cannot leak.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

/// A key/value map whose entries expire `expiry` after insertion. Expired
/// entries are removed lazily on every access.
#[derive(Debug)]
pub struct TimedCache<K, V> {
    expiry: Duration,
    inserted: VecDeque<(Instant, K)>,
    entries: HashMap<K, V>,
}

impl<K: Clone + Eq + Hash, V> TimedCache<K, V> {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            inserted: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        while let Some((at, _)) = self.inserted.front() {
            if now.duration_since(*at) <= self.expiry {
                break;
            }
            let (_, key) = self.inserted.pop_front().expect("front checked above");
            self.entries.remove(&key);
        }
    }

    pub fn add(&mut self, key: K, value: V) {
        self.sweep();
        self.inserted.push_back((Instant::now(), key.clone()));
        self.entries.insert(key, value);
    }

    pub fn exists(&mut self, key: &K) -> bool {
        self.sweep();
        self.entries.contains_key(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.sweep();
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.sweep();
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How two parts of a split value are combined.
pub trait MergeParts {
    /// Fold `incoming` into `self`. Errors abort the merge and are surfaced
    /// to the caller that delivered the part.
    fn merge(&mut self, incoming: &Self) -> anyhow::Result<()>;
}

/// Assembles values that arrive in `total_parts` pieces, keyed by a shared
/// id, dropping incomplete assemblies after the cache expiry.
#[derive(Debug)]
pub struct PartMerger<K, V> {
    parts: TimedCache<K, (Vec<bool>, V)>,
}

impl<K: Clone + Eq + Hash, V: MergeParts> PartMerger<K, V> {
    pub fn new(expiry: Duration) -> Self {
        Self {
            parts: TimedCache::new(expiry),
        }
    }

    /// Record one part. Returns `true` iff all parts have now arrived.
    /// A duplicate part index is ignored.
    pub fn insert(
        &mut self,
        key: K,
        part_index: usize,
        total_parts: usize,
        value: &V,
    ) -> anyhow::Result<bool>
    where
        V: Clone,
    {
        anyhow::ensure!(part_index < total_parts, "part index out of range");
        match self.parts.get_mut(&key) {
            None => {
                let mut seen = vec![false; total_parts];
                seen[part_index] = true;
                self.parts.add(key.clone(), (seen, value.clone()));
            }
            Some((seen, existing)) => {
                anyhow::ensure!(
                    seen.len() == total_parts,
                    "split part count mismatch: {} vs {total_parts}",
                    seen.len()
                );
                if !seen[part_index] {
                    existing.merge(value)?;
                    seen[part_index] = true;
                }
            }
        }
        Ok(self.is_complete(&key))
    }

    pub fn is_complete(&mut self, key: &K) -> bool {
        match self.parts.get_mut(key) {
            Some((seen, _)) => seen.iter().all(|s| *s),
            None => false,
        }
    }

    pub fn exists(&mut self, key: &K) -> bool {
        self.parts.exists(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.parts.remove(key).map(|(_, v)| v)
    }
}
