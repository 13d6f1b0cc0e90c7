//! The object index and its LRU bookkeeping.
//!
//! Every known object lives in `tree`, keyed by handle. Objects whose content is cached also
//! have an entry in `recency`, keyed by a monotonically increasing tick so that the first entry
//! is the least recently used. `ticks` maps back from handle to tick.
//!
//! All mutation happens under the store's index mutex. Payloads removed here are handed back
//! to the caller so the last reference is dropped after the mutex is released.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use super::object::ObjectRef;

pub(crate) struct ObjectIndex {
    tree: BTreeMap<u32, ObjectRef>,
    recency: BTreeMap<u64, u32>,
    ticks: HashMap<u32, u64>,
    next_tick: u64,
    cached_bytes: u64,
    budget: u64,
}

impl ObjectIndex {
    pub(crate) fn new(budget: u64) -> Self {
        Self {
            tree: BTreeMap::new(),
            recency: BTreeMap::new(),
            ticks: HashMap::new(),
            next_tick: 0,
            cached_bytes: 0,
            budget,
        }
    }

    pub(crate) fn get(&self, handle: u32) -> Option<&ObjectRef> {
        self.tree.get(&handle)
    }

    pub(crate) fn insert(&mut self, object: ObjectRef) {
        self.tree.insert(object.handle(), object);
    }

    /// Removes an object and its cached payload.
    pub(crate) fn remove(&mut self, handle: u32) -> (Option<ObjectRef>, Option<Bytes>) {
        let payload = self.uncache(handle);
        (self.tree.remove(&handle), payload)
    }

    pub(crate) fn objects(&self) -> impl Iterator<Item = &ObjectRef> {
        self.tree.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.tree.len()
    }

    pub(crate) fn cached_count(&self) -> usize {
        self.recency.len()
    }

    pub(crate) fn cached_bytes(&self) -> u64 {
        self.cached_bytes
    }

    pub(crate) fn budget(&self) -> u64 {
        self.budget
    }

    /// Changes the budget and evicts down to it.
    pub(crate) fn set_budget(&mut self, budget: u64) -> Vec<Bytes> {
        self.budget = budget;
        self.evict_to_budget(None)
    }

    /// Moves a cached object to the most recently used end. No-op for uncached objects.
    pub(crate) fn touch(&mut self, handle: u32) {
        let Some(old) = self.ticks.get(&handle).copied() else {
            return;
        };
        self.recency.remove(&old);
        let tick = self.take_tick();
        self.recency.insert(tick, handle);
        self.ticks.insert(handle, tick);
    }

    /// Attaches `payload` to a known object as most recently used, then evicts older entries
    /// until the total fits the budget. Returns false (and stores nothing) when the object is no
    /// longer in the index.
    pub(crate) fn insert_cached(&mut self, handle: u32, payload: Bytes, released: &mut Vec<Bytes>) -> bool {
        let Some(object) = self.tree.get(&handle) else {
            return false;
        };
        let len = payload.len() as u64;
        if let Some(previous) = object.set_payload(Some(payload)) {
            self.cached_bytes -= previous.len() as u64;
            released.push(previous);
        }
        self.cached_bytes += len;

        if let Some(old) = self.ticks.get(&handle).copied() {
            self.recency.remove(&old);
        }
        let tick = self.take_tick();
        self.recency.insert(tick, handle);
        self.ticks.insert(handle, tick);

        released.extend(self.evict_to_budget(Some(handle)));
        true
    }

    /// Drops the cached payload of one object, keeping its metadata.
    pub(crate) fn uncache(&mut self, handle: u32) -> Option<Bytes> {
        let tick = self.ticks.remove(&handle)?;
        self.recency.remove(&tick);
        let payload = self.tree.get(&handle).and_then(|object| object.set_payload(None))?;
        self.cached_bytes -= payload.len() as u64;
        Some(payload)
    }

    /// Cached handles from least to most recently used.
    pub(crate) fn cached_handles(&self) -> Vec<u32> {
        self.recency.values().copied().collect()
    }

    /// Evicts least recently used payloads until the total fits the budget. `keep` is never
    /// evicted.
    fn evict_to_budget(&mut self, keep: Option<u32>) -> Vec<Bytes> {
        let mut released = Vec::new();
        while self.cached_bytes > self.budget {
            let victim = self.recency.values().copied().find(|&handle| Some(handle) != keep);
            let Some(victim) = victim else {
                break;
            };
            if let Some(payload) = self.uncache(victim) {
                released.push(payload);
            }
        }
        released
    }

    /// Drops every entry, returning the payloads that were cached.
    pub(crate) fn clear(&mut self) -> Vec<Bytes> {
        let released = self
            .cached_handles()
            .into_iter()
            .filter_map(|handle| self.uncache(handle))
            .collect();
        self.tree.clear();
        released
    }

    fn take_tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Verifies that the recency list, the tick map, the payloads and the byte total agree.
    pub(crate) fn check_consistency(&self) -> Result<(), String> {
        if self.recency.len() != self.ticks.len() {
            return Err(format!(
                "recency has {} entries, tick map has {}",
                self.recency.len(),
                self.ticks.len()
            ));
        }
        let mut total = 0u64;
        for (tick, handle) in &self.recency {
            if self.ticks.get(handle) != Some(tick) {
                return Err(format!("handle 0x{handle:08X} has a stale tick"));
            }
            let Some(object) = self.tree.get(handle) else {
                return Err(format!("cached handle 0x{handle:08X} is not in the tree"));
            };
            let Some(payload) = object.cached_payload() else {
                return Err(format!("handle 0x{handle:08X} is on the recency list without a payload"));
            };
            total += payload.len() as u64;
        }
        for object in self.tree.values() {
            if object.is_cached() && !self.ticks.contains_key(&object.handle()) {
                return Err(format!("handle 0x{:08X} has a payload but no tick", object.handle()));
            }
        }
        if total != self.cached_bytes {
            return Err(format!("cached bytes {} but payloads sum to {total}", self.cached_bytes));
        }
        if total > self.budget && self.recency.len() > 1 {
            return Err(format!("cached bytes {total} exceed the budget {}", self.budget));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptp::{ObjectFormat, ObjectInfo};
    use crate::store::object::{ObjectMetadata, RemoteObject};
    use std::sync::Arc;

    fn object(handle: u32) -> ObjectRef {
        let info = ObjectInfo::for_upload(1, 0, &format!("IMG_{handle:04}.JPG"), ObjectFormat::ExifJpeg, 0);
        Arc::new(RemoteObject::new(handle, ObjectMetadata::from_info(&info, Some(0), None)))
    }

    fn index_with(budget: u64, handles: &[u32]) -> ObjectIndex {
        let mut index = ObjectIndex::new(budget);
        for &handle in handles {
            index.insert(object(handle));
        }
        index
    }

    fn cache(index: &mut ObjectIndex, handle: u32, len: usize) -> Vec<Bytes> {
        let mut released = Vec::new();
        assert!(index.insert_cached(handle, Bytes::from(vec![0u8; len]), &mut released));
        released
    }

    // ============================================================================
    // Recency order
    // ============================================================================

    #[test]
    fn test_recency_order_follows_inserts() {
        let mut index = index_with(1000, &[1, 2, 3]);
        cache(&mut index, 1, 10);
        cache(&mut index, 2, 10);
        cache(&mut index, 3, 10);
        assert_eq!(index.cached_handles(), vec![1, 2, 3]);
        index.check_consistency().unwrap();
    }

    #[test]
    fn test_touch_moves_to_most_recent() {
        let mut index = index_with(1000, &[1, 2, 3]);
        for handle in [1, 2, 3] {
            cache(&mut index, handle, 10);
        }
        index.touch(1);
        assert_eq!(index.cached_handles(), vec![2, 3, 1]);
        index.touch(99);
        assert_eq!(index.cached_handles(), vec![2, 3, 1]);
        index.check_consistency().unwrap();
    }

    // ============================================================================
    // Eviction
    // ============================================================================

    #[test]
    fn test_eviction_drops_least_recent_first() {
        let mut index = index_with(25, &[1, 2, 3]);
        cache(&mut index, 1, 10);
        cache(&mut index, 2, 10);
        let released = cache(&mut index, 3, 10);

        assert_eq!(released.len(), 1);
        assert_eq!(index.cached_handles(), vec![2, 3]);
        assert_eq!(index.cached_bytes(), 20);
        assert!(!index.get(1).unwrap().is_cached());
        index.check_consistency().unwrap();
    }

    #[test]
    fn test_lowering_budget_evicts() {
        let mut index = index_with(100, &[1, 2, 3]);
        for handle in [1, 2, 3] {
            cache(&mut index, handle, 10);
        }
        let released = index.set_budget(10);
        assert_eq!(released.len(), 2);
        assert_eq!(index.cached_handles(), vec![3]);
        index.check_consistency().unwrap();
    }

    #[test]
    fn test_recaching_replaces_payload() {
        let mut index = index_with(100, &[1]);
        cache(&mut index, 1, 10);
        let released = cache(&mut index, 1, 30);
        assert_eq!(released.len(), 1);
        assert_eq!(index.cached_bytes(), 30);
        assert_eq!(index.cached_count(), 1);
        index.check_consistency().unwrap();
    }

    #[test]
    fn test_unknown_handle_is_not_cached() {
        let mut index = index_with(100, &[]);
        let mut released = Vec::new();
        assert!(!index.insert_cached(5, Bytes::from_static(b"abc"), &mut released));
        assert_eq!(index.cached_bytes(), 0);
    }

    // ============================================================================
    // Removal
    // ============================================================================

    #[test]
    fn test_remove_releases_payload() {
        let mut index = index_with(100, &[1, 2]);
        cache(&mut index, 1, 10);
        let (object, payload) = index.remove(1);
        assert!(object.is_some());
        assert_eq!(payload.map(|p| p.len()), Some(10));
        assert_eq!(index.len(), 1);
        assert_eq!(index.cached_bytes(), 0);
        index.check_consistency().unwrap();
    }

    #[test]
    fn test_clear() {
        let mut index = index_with(100, &[1, 2, 3]);
        cache(&mut index, 2, 10);
        cache(&mut index, 3, 5);
        let released = index.clear();
        assert_eq!(released.len(), 2);
        assert_eq!(index.len(), 0);
        assert_eq!(index.cached_bytes(), 0);
        index.check_consistency().unwrap();
    }
}
