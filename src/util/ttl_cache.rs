use rustc_hash::FxHashMap;

/// A key-to-value mapping bounded by entry age, not by access recency.
///
/// Entries live in a small number of generational sectors: insertions go to sector 0 and
/// a periodic [TtlCache::rotate] shifts every sector one step towards the end, dropping
/// the oldest. An entry therefore survives at most `num_sectors` rotation periods; the
/// owner picks the rotation period as `forget_timeout / num_sectors` to get the contract
/// "no entry older than `forget_timeout` is visible".
///
/// There is no per-entry timestamp and no bookkeeping on reads - `get` does not refresh
/// an entry's age, only `insert` does (by moving the key back to sector 0). Capacity is
/// a soft bound: when the total entry count reaches it, an insertion drops the oldest
/// sector early.
pub struct TtlCache<V> {
    /// newest first
    sectors: Vec<FxHashMap<String, V>>,
    max_entries: usize,
}

pub const DEFAULT_NUM_SECTORS: usize = 4;

impl<V> TtlCache<V> {
    pub fn new(num_sectors: usize, max_entries: usize) -> TtlCache<V> {
        assert!(num_sectors > 0, "a cache needs at least one sector");
        TtlCache {
            sectors: (0..num_sectors).map(|_| FxHashMap::default()).collect(),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.sectors.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.iter().all(|s| s.is_empty())
    }

    /// Insert or refresh: the key ends up in sector 0, displacing any older occurrence.
    ///  Returns the previously stored value, if any.
    pub fn insert(&mut self, key: String, value: V) -> Option<V> {
        let prev = self.remove(&key);
        if prev.is_none() && self.len() >= self.max_entries {
            let _ = self.rotate();
        }
        self.sectors[0].insert(key, value);
        prev
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.sectors.iter().find_map(|s| s.get(key))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.sectors.iter_mut().find_map(|s| s.get_mut(key))
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.sectors.iter_mut().find_map(|s| s.remove(key))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.sectors.iter().any(|s| s.contains_key(key))
    }

    /// Which generation a key currently lives in: 0 is the newest. Callers can use this
    ///  as a coarse age indicator, e.g. to refresh an entry only once it has left the
    ///  newest sector.
    pub fn sector_of(&self, key: &str) -> Option<usize> {
        self.sectors.iter().position(|s| s.contains_key(key))
    }

    /// Age every entry by one generation and return the evicted oldest sector. Disposal
    ///  of the evicted values is the caller's business - they may hold resources that
    ///  need explicit cleanup.
    pub fn rotate(&mut self) -> FxHashMap<String, V> {
        self.sectors.insert(0, FxHashMap::default());
        self.sectors
            .pop()
            .expect("the cache always has at least one sector")
    }
}
