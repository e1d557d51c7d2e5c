use std::collections::HashMap;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Instant;

use lru::LruCache;
use serde::Serialize;

use crate::core::RiskLevel;

pub const DEFAULT_MEMO_CAPACITY: usize = 500;

/// A memoised impact computation for one file.
///
/// Holds file identifiers by value, so entries stay meaningful even while
/// the graph they were computed from is being rebuilt.
#[derive(Debug, Clone)]
pub struct MemoEntry {
    pub impact_set: Vec<PathBuf>,
    pub direct_count: usize,
    pub transitive_count: usize,
    pub risk: RiskLevel,
    pub cascade_levels: HashMap<PathBuf, usize>,
    pub computed_at: Instant,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

/// LRU cache of impact results with a reverse index for O(affected)
/// invalidation.
///
/// The reverse index maps a file to every cached key whose impact set
/// contains it (each key also indexes itself), so invalidating a changed
/// file touches exactly the entries that could be stale.
pub struct ImpactMemo {
    entries: LruCache<PathBuf, MemoEntry>,
    reverse_index: HashMap<PathBuf, HashSet<PathBuf>>,
    hits: u64,
    misses: u64,
}

impl ImpactMemo {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_MEMO_CAPACITY).expect("nonzero"));

        Self { entries: LruCache::new(capacity), reverse_index: HashMap::new(), hits: 0, misses: 0 }
    }

    /// Look up an entry, bumping its recency and the hit/miss counters.
    pub fn get(&mut self, key: &Path) -> Option<&MemoEntry> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits += 1;
                Some(entry)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Store an entry, replacing any previous one for `key` and evicting
    /// the least-recently-used entry past capacity.
    pub fn set(&mut self, key: PathBuf, entry: MemoEntry) {
        if let Some(previous) = self.entries.pop(&key) {
            self.unindex(&key, &previous);
        }

        self.index(&key, &entry);

        if let Some((evicted_key, evicted)) = self.entries.push(key, entry) {
            self.unindex(&evicted_key, &evicted);
        }
    }

    /// Drop every entry whose impact set intersects `files` (or whose key
    /// is one of them). Returns how many entries were removed.
    pub fn invalidate<'a, I>(&mut self, files: I) -> usize
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        let stale: HashSet<PathBuf> = files
            .into_iter()
            .filter_map(|f| self.reverse_index.get(f))
            .flatten()
            .cloned()
            .collect();

        for key in &stale {
            if let Some(entry) = self.entries.pop(key) {
                self.unindex(key, &entry);
            }
        }

        stale.len()
    }

    /// Clear entries and the reverse index; the hit/miss counters survive
    /// as diagnostics.
    pub fn invalidate_all(&mut self) {
        self.entries.clear();
        self.reverse_index.clear();
    }

    pub fn stats(&self) -> MemoStats {
        MemoStats { size: self.entries.len(), hits: self.hits, misses: self.misses }
    }

    fn index(&mut self, key: &PathBuf, entry: &MemoEntry) {
        self.reverse_index.entry(key.clone()).or_default().insert(key.clone());

        for file in &entry.impact_set {
            self.reverse_index.entry(file.clone()).or_default().insert(key.clone());
        }
    }

    fn unindex(&mut self, key: &PathBuf, entry: &MemoEntry) {
        let mut remove_from = |file: &PathBuf| {
            if let Some(keys) = self.reverse_index.get_mut(file) {
                keys.remove(key);

                if keys.is_empty() {
                    self.reverse_index.remove(file);
                }
            }
        };

        remove_from(key);

        for file in &entry.impact_set {
            remove_from(file);
        }
    }
}

impl Default for ImpactMemo {
    fn default() -> Self {
        Self::new(DEFAULT_MEMO_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(name: &str) -> PathBuf {
        PathBuf::from(format!("/proj/{}", name))
    }

    fn entry(impact: &[&str]) -> MemoEntry {
        MemoEntry {
            impact_set: impact.iter().map(|f| p(f)).collect(),
            direct_count: impact.len().min(1),
            transitive_count: impact.len().saturating_sub(1),
            risk: RiskLevel::of_impacted(impact.len()),
            cascade_levels: impact.iter().enumerate().map(|(i, f)| (p(f), i + 1)).collect(),
            computed_at: Instant::now(),
        }
    }

    #[test]
    fn get_tracks_hits_and_misses() {
        let mut memo = ImpactMemo::new(10);
        memo.set(p("a"), entry(&["b"]));

        assert!(memo.get(&p("a")).is_some());
        assert!(memo.get(&p("zz")).is_none());

        let stats = memo.stats();
        assert_eq!((stats.size, stats.hits, stats.misses), (1, 1, 1));
    }

    #[test]
    fn invalidate_removes_exactly_the_affected_keys() {
        let mut memo = ImpactMemo::new(10);
        memo.set(p("a"), entry(&["b", "c"]));
        memo.set(p("x"), entry(&["y"]));
        memo.set(p("c"), entry(&[]));

        // `c` is in a's impact set and is itself a key.
        let removed = memo.invalidate([p("c")].iter());
        assert_eq!(removed, 2);
        assert!(memo.entries.peek(&p("a")).is_none());
        assert!(memo.entries.peek(&p("c")).is_none());
        assert!(memo.entries.peek(&p("x")).is_some());
    }

    #[test]
    fn invalidating_an_unknown_file_is_a_no_op() {
        let mut memo = ImpactMemo::new(10);
        memo.set(p("a"), entry(&["b"]));

        assert_eq!(memo.invalidate([p("unrelated")].iter()), 0);
        assert_eq!(memo.stats().size, 1);
    }

    #[test]
    fn set_replaces_previous_index_contributions() {
        let mut memo = ImpactMemo::new(10);
        memo.set(p("a"), entry(&["b"]));
        memo.set(p("a"), entry(&["c"]));

        // `b` no longer points at `a`.
        assert_eq!(memo.invalidate([p("b")].iter()), 0);
        assert_eq!(memo.invalidate([p("c")].iter()), 1);
    }

    #[test]
    fn lru_eviction_at_capacity_cleans_the_index() {
        let mut memo = ImpactMemo::new(2);
        memo.set(p("a"), entry(&["shared"]));
        memo.set(p("b"), entry(&["shared"]));

        // Touch `a` so `b` is the eviction victim.
        assert!(memo.get(&p("a")).is_some());
        memo.set(p("c"), entry(&["shared"]));

        assert_eq!(memo.stats().size, 2);
        assert!(memo.entries.peek(&p("a")).is_some());
        assert!(memo.entries.peek(&p("b")).is_none());

        // The shared bucket only names the resident keys.
        let keys = memo.reverse_index.get(&p("shared")).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(!keys.contains(&p("b")));
    }

    #[test]
    fn invalidate_all_preserves_counters() {
        let mut memo = ImpactMemo::new(10);
        memo.set(p("a"), entry(&["b"]));
        memo.get(&p("a"));
        memo.get(&p("miss"));

        memo.invalidate_all();

        let stats = memo.stats();
        assert_eq!((stats.size, stats.hits, stats.misses), (0, 1, 1));
        assert!(memo.reverse_index.is_empty());
    }

    #[test]
    fn empty_index_buckets_are_dropped() {
        let mut memo = ImpactMemo::new(10);
        memo.set(p("a"), entry(&["b"]));
        memo.invalidate([p("a")].iter());

        assert!(memo.reverse_index.is_empty());
    }
}
