// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Byte-budgeted result store with LRU eviction
//!
//! All state (entries, recency index, running byte total) lives behind one
//! mutex so the byte total always matches the entry set. Callers only ever
//! receive clones of entries.
//!
//! Every invalidation advances the store's epoch and is remembered for a
//! while, so that a result computed before the invalidation can be refused
//! by [`CacheStore::put_if_epoch`].

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{CacheError, CacheResult, CacheValue, Clock, InvalidationTarget, SystemClock};
use crate::query::{Fingerprint, QueryRequest};

/// What an entry belongs to, for scoped invalidation
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EntryScope {
    pub datasource_uid: String,
    pub dashboard_uid: Option<String>,
    pub query_type: Option<String>,
}

impl EntryScope {
    pub fn datasource(datasource_uid: impl Into<String>) -> Self {
        Self {
            datasource_uid: datasource_uid.into(),
            ..Self::default()
        }
    }

    pub fn with_dashboard(mut self, dashboard_uid: impl Into<String>) -> Self {
        self.dashboard_uid = Some(dashboard_uid.into());
        self
    }

    pub fn from_request<Q>(request: &QueryRequest<Q>) -> Self {
        Self {
            datasource_uid: request.datasource_uid.clone(),
            dashboard_uid: request.dashboard_uid.clone(),
            query_type: request.query_type.clone(),
        }
    }
}

/// Cached query result
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub fingerprint: Fingerprint,
    pub payload: V,
    pub created_at: Instant,
    pub ttl: Option<Duration>,
    /// Recorded at construction; used for budget accounting
    pub size_bytes: usize,
    /// Assigned by the store on `put`; 0 until stored
    pub generation: u64,
    pub scope: EntryScope,
}

impl<V: CacheValue> CacheEntry<V> {
    pub fn new(
        fingerprint: Fingerprint,
        payload: V,
        created_at: Instant,
        ttl: Option<Duration>,
        scope: EntryScope,
    ) -> Self {
        let size_bytes = payload.size_bytes();
        Self {
            fingerprint,
            payload,
            created_at,
            ttl,
            size_bytes,
            generation: 0,
            scope,
        }
    }
}

impl<V> CacheEntry<V> {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// Entries and bytes removed by one operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalSummary {
    pub entries: usize,
    pub bytes: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub capacity_bytes: usize,
    pub insertions: u64,
    pub overwrites: u64,
    pub evictions: u64,
    pub invalidated: u64,
    pub expired: u64,
    pub rejected_oversize: u64,
    /// Writes refused because a matching invalidation happened first
    pub rejected_invalidated: u64,
}

impl StoreStats {
    pub fn utilization(&self) -> f64 {
        if self.capacity_bytes == 0 {
            0.0
        } else {
            self.total_bytes as f64 / self.capacity_bytes as f64
        }
    }
}

/// Invalidations kept for checking in-flight writes
const INVALIDATION_LOG_SIZE: usize = 256;

/// Position in the LRU order: oldest access first, then oldest insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Recency {
    last_accessed: Instant,
    insertion: u64,
}

#[derive(Debug)]
struct StoredEntry<V> {
    entry: CacheEntry<V>,
    recency: Recency,
}

#[derive(Debug)]
struct StoreState<V> {
    entries: HashMap<Fingerprint, StoredEntry<V>>,
    recency: BTreeMap<Recency, Fingerprint>,
    total_bytes: usize,
    capacity_bytes: usize,
    next_generation: u64,
    next_insertion: u64,
    epoch: u64,
    /// (epoch, target) of recent invalidations, oldest first
    invalidation_log: VecDeque<(u64, InvalidationTarget)>,
    stats: StoreStats,
}

impl<V> StoreState<V> {
    fn new(capacity_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            total_bytes: 0,
            capacity_bytes,
            next_generation: 0,
            next_insertion: 0,
            epoch: 0,
            invalidation_log: VecDeque::with_capacity(INVALIDATION_LOG_SIZE),
            stats: StoreStats::default(),
        }
    }

    fn remove(&mut self, key: &Fingerprint) -> Option<CacheEntry<V>> {
        let stored = self.entries.remove(key)?;
        self.recency.remove(&stored.recency);
        self.total_bytes = self.total_bytes.saturating_sub(stored.entry.size_bytes);
        Some(stored.entry)
    }

    fn remove_where<P>(&mut self, mut predicate: P) -> RemovalSummary
    where
        P: FnMut(&CacheEntry<V>) -> bool,
    {
        let doomed: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|(_, stored)| predicate(&stored.entry))
            .map(|(key, _)| *key)
            .collect();

        let mut summary = RemovalSummary::default();
        for key in &doomed {
            if let Some(entry) = self.remove(key) {
                summary.entries += 1;
                summary.bytes += entry.size_bytes;
            }
        }
        summary
    }

    fn record_invalidation(&mut self, target: InvalidationTarget) {
        self.epoch += 1;
        if self.invalidation_log.len() == INVALIDATION_LOG_SIZE {
            self.invalidation_log.pop_front();
        }
        self.invalidation_log.push_back((self.epoch, target));
    }

    /// The invalidation since `epoch` that covers `entry`, if any
    ///
    /// Once the log no longer reaches back to `epoch` every entry counts as
    /// covered.
    fn invalidated_since(&self, epoch: u64, entry: &CacheEntry<V>) -> Option<InvalidationTarget> {
        if self.epoch <= epoch {
            return None;
        }
        match self.invalidation_log.front() {
            Some((oldest, _)) if *oldest <= epoch + 1 => self
                .invalidation_log
                .iter()
                .filter(|(at, _)| *at > epoch)
                .find(|(_, target)| target.matches(entry))
                .map(|(_, target)| target.clone()),
            _ => Some(InvalidationTarget::All),
        }
    }

    fn evict_over_capacity(&mut self) -> usize {
        let mut evicted = 0;
        while self.total_bytes > self.capacity_bytes {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            if let Some(stored) = self.entries.remove(&key) {
                self.total_bytes = self.total_bytes.saturating_sub(stored.entry.size_bytes);
                evicted += 1;
                log::debug!(
                    "Evicted cache entry {} ({} bytes, datasource {})",
                    key.short(),
                    stored.entry.size_bytes,
                    stored.entry.scope.datasource_uid
                );
            }
        }
        self.stats.evictions += evicted as u64;
        evicted
    }

    fn snapshot(&self) -> StoreStats {
        StoreStats {
            entries: self.entries.len(),
            total_bytes: self.total_bytes,
            capacity_bytes: self.capacity_bytes,
            ..self.stats.clone()
        }
    }
}

/// Concurrent key -> entry store bounded by a byte budget
pub struct CacheStore<V> {
    state: Mutex<StoreState<V>>,
    clock: Arc<dyn Clock>,
}

impl<V: CacheValue> CacheStore<V> {
    pub fn new(capacity_bytes: usize) -> Self {
        Self::with_clock(capacity_bytes, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity_bytes: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::new(capacity_bytes)),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Look up an entry and mark it as most recently used
    pub fn get(&self, key: &Fingerprint) -> Option<CacheEntry<V>> {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let stored = state.entries.get_mut(key)?;
        state.recency.remove(&stored.recency);
        stored.recency.last_accessed = now;
        state.recency.insert(stored.recency, *key);

        Some(stored.entry.clone())
    }

    /// Look up an entry without touching its recency
    pub fn peek(&self, key: &Fingerprint) -> Option<CacheEntry<V>> {
        self.state
            .lock()
            .entries
            .get(key)
            .map(|stored| stored.entry.clone())
    }

    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Insert or overwrite an entry, then evict down to the byte budget
    ///
    /// Returns the generation assigned to the stored entry. An entry larger
    /// than the whole budget is rejected with `CapacityExceeded`; any older
    /// entry under the same key is dropped in that case.
    pub fn put(&self, entry: CacheEntry<V>) -> CacheResult<u64> {
        let mut state = self.state.lock();
        self.insert_locked(&mut state, entry)
    }

    /// Current invalidation epoch
    ///
    /// Read it before computing a value and hand it to
    /// [`put_if_epoch`](Self::put_if_epoch) when storing the result.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Like [`put`](Self::put), but refuses the entry with
    /// `InvalidatedInFlight` if an invalidation covering it happened after
    /// `epoch` was read
    pub fn put_if_epoch(&self, entry: CacheEntry<V>, epoch: u64) -> CacheResult<u64> {
        let mut state = self.state.lock();
        if let Some(target) = state.invalidated_since(epoch, &entry) {
            state.stats.rejected_invalidated += 1;
            return Err(CacheError::InvalidatedInFlight(target.to_string()));
        }
        self.insert_locked(&mut state, entry)
    }

    fn insert_locked(&self, state: &mut StoreState<V>, mut entry: CacheEntry<V>) -> CacheResult<u64> {
        let now = self.clock.now();
        let key = entry.fingerprint;

        if entry.size_bytes > state.capacity_bytes {
            state.remove(&key);
            state.stats.rejected_oversize += 1;
            return Err(CacheError::CapacityExceeded {
                size: entry.size_bytes,
                limit: state.capacity_bytes,
            });
        }

        if state.remove(&key).is_some() {
            state.stats.overwrites += 1;
        }

        state.next_generation += 1;
        state.next_insertion += 1;
        entry.generation = state.next_generation;
        let recency = Recency {
            last_accessed: now,
            insertion: state.next_insertion,
        };

        state.total_bytes += entry.size_bytes;
        state.recency.insert(recency, key);
        state.entries.insert(key, StoredEntry { entry, recency });
        state.stats.insertions += 1;

        let generation = state.next_generation;
        state.evict_over_capacity();
        Ok(generation)
    }

    /// Remove least-recently-used entries until the byte total fits the budget
    pub fn evict_if_over_capacity(&self) -> usize {
        self.state.lock().evict_over_capacity()
    }

    pub fn remove(&self, key: &Fingerprint) -> Option<CacheEntry<V>> {
        self.state.lock().remove(key)
    }

    /// Remove an entry only if it has not been overwritten since it was read
    pub fn remove_if_generation(&self, key: &Fingerprint, generation: u64) -> bool {
        let mut state = self.state.lock();
        let current = state.entries.get(key).map(|stored| stored.entry.generation);
        if current == Some(generation) {
            state.remove(key);
            true
        } else {
            false
        }
    }

    pub fn invalidate(&self, target: &InvalidationTarget) -> RemovalSummary {
        let mut state = self.state.lock();
        let summary = match target {
            InvalidationTarget::Key(key) => state
                .remove(key)
                .map(|entry| RemovalSummary {
                    entries: 1,
                    bytes: entry.size_bytes,
                })
                .unwrap_or_default(),
            other => state.remove_where(|entry| other.matches(entry)),
        };
        state.record_invalidation(target.clone());
        state.stats.invalidated += summary.entries as u64;
        summary
    }

    pub fn invalidate_where<P>(&self, predicate: P) -> RemovalSummary
    where
        P: FnMut(&CacheEntry<V>) -> bool,
    {
        let mut state = self.state.lock();
        let summary = state.remove_where(predicate);
        // The predicate cannot be replayed against later writes
        state.record_invalidation(InvalidationTarget::All);
        state.stats.invalidated += summary.entries as u64;
        summary
    }

    /// Remove entries judged expired by `is_expired`
    pub fn purge_where<P>(&self, is_expired: P) -> RemovalSummary
    where
        P: FnMut(&CacheEntry<V>) -> bool,
    {
        let mut state = self.state.lock();
        let summary = state.remove_where(is_expired);
        state.stats.expired += summary.entries as u64;
        summary
    }

    pub fn clear(&self) -> RemovalSummary {
        let mut state = self.state.lock();
        let summary = RemovalSummary {
            entries: state.entries.len(),
            bytes: state.total_bytes,
        };
        state.entries.clear();
        state.recency.clear();
        state.total_bytes = 0;
        state.record_invalidation(InvalidationTarget::All);
        summary
    }

    /// Change the byte budget, evicting immediately if it shrank
    pub fn set_capacity(&self, capacity_bytes: usize) -> usize {
        let mut state = self.state.lock();
        state.capacity_bytes = capacity_bytes;
        state.evict_over_capacity()
    }

    pub fn capacity_bytes(&self) -> usize {
        self.state.lock().capacity_bytes
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Keys from least to most recently used
    pub fn keys_by_recency(&self) -> Vec<Fingerprint> {
        self.state.lock().recency.values().copied().collect()
    }

    pub fn stats(&self) -> StoreStats {
        self.state.lock().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;

    fn key(seed: u8) -> Fingerprint {
        Fingerprint::from_bytes([seed; 32])
    }

    fn entry(clock: &ManualClock, seed: u8, size: usize, datasource: &str) -> CacheEntry<Vec<u8>> {
        CacheEntry::new(
            key(seed),
            vec![seed; size],
            clock.now(),
            Some(Duration::from_secs(60)),
            EntryScope::datasource(datasource),
        )
    }

    fn store(capacity: usize) -> (Arc<ManualClock>, CacheStore<Vec<u8>>) {
        let clock = Arc::new(ManualClock::new());
        let store = CacheStore::with_clock(capacity, clock.clone());
        (clock, store)
    }

    #[test]
    fn test_put_get_returns_copy() {
        let (clock, store) = store(1024);
        store.put(entry(&clock, 1, 100, "ds1")).unwrap();

        let mut copy = store.get(&key(1)).unwrap();
        copy.payload.clear();

        assert_eq!(store.peek(&key(1)).unwrap().payload.len(), 100);
        assert!(store.get(&key(2)).is_none());
    }

    #[test]
    fn test_generation_increases_on_every_put() {
        let (clock, store) = store(1024);
        let first = store.put(entry(&clock, 1, 10, "ds1")).unwrap();
        let second = store.put(entry(&clock, 2, 10, "ds1")).unwrap();
        let overwrite = store.put(entry(&clock, 1, 20, "ds1")).unwrap();

        assert!(first < second && second < overwrite);
        assert_eq!(store.peek(&key(1)).unwrap().generation, overwrite);
        assert_eq!(store.total_bytes(), 30);
        assert_eq!(store.stats().overwrites, 1);
    }

    #[test]
    fn test_lru_eviction_order() {
        let (clock, store) = store(300);
        store.put(entry(&clock, 1, 100, "ds1")).unwrap();
        clock.advance(Duration::from_secs(1));
        store.put(entry(&clock, 2, 100, "ds1")).unwrap();
        clock.advance(Duration::from_secs(1));
        store.put(entry(&clock, 3, 100, "ds1")).unwrap();
        clock.advance(Duration::from_secs(1));

        // Touch the oldest so that 2 becomes least recently used
        store.get(&key(1)).unwrap();
        clock.advance(Duration::from_secs(1));
        store.put(entry(&clock, 4, 100, "ds1")).unwrap();

        assert!(!store.contains(&key(2)));
        assert!(store.contains(&key(1)));
        assert!(store.contains(&key(3)));
        assert!(store.contains(&key(4)));
        assert_eq!(store.total_bytes(), 300);
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let (clock, store) = store(200);
        store.put(entry(&clock, 1, 100, "ds1")).unwrap();
        store.put(entry(&clock, 2, 100, "ds1")).unwrap();
        store.put(entry(&clock, 3, 100, "ds1")).unwrap();

        assert_eq!(store.keys_by_recency(), vec![key(2), key(3)]);
    }

    #[test]
    fn test_newest_entry_survives_large_eviction() {
        let (clock, store) = store(1000);
        for seed in 1..=5 {
            store.put(entry(&clock, seed, 200, "ds1")).unwrap();
            clock.advance(Duration::from_millis(10));
        }
        store.put(entry(&clock, 9, 900, "ds1")).unwrap();

        assert_eq!(store.keys_by_recency(), vec![key(9)]);
        assert_eq!(store.total_bytes(), 900);
    }

    #[test]
    fn test_oversize_entry_rejected() {
        let (clock, store) = store(100);
        store.put(entry(&clock, 1, 50, "ds1")).unwrap();

        let result = store.put(entry(&clock, 1, 101, "ds1"));
        assert_eq!(
            result,
            Err(CacheError::CapacityExceeded {
                size: 101,
                limit: 100
            })
        );
        assert!(store.is_empty());
        assert_eq!(store.total_bytes(), 0);
        assert_eq!(store.stats().rejected_oversize, 1);
    }

    #[test]
    fn test_remove_if_generation() {
        let (clock, store) = store(1024);
        let stale = store.put(entry(&clock, 1, 10, "ds1")).unwrap();
        let fresh = store.put(entry(&clock, 1, 10, "ds1")).unwrap();

        assert!(!store.remove_if_generation(&key(1), stale));
        assert!(store.contains(&key(1)));
        assert!(store.remove_if_generation(&key(1), fresh));
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalidate_targets() {
        let (clock, store) = store(10_000);
        store.put(entry(&clock, 1, 10, "prom-a")).unwrap();
        store.put(entry(&clock, 2, 20, "prom-b")).unwrap();
        store.put(entry(&clock, 3, 30, "loki")).unwrap();
        let mut dashboard_entry = entry(&clock, 4, 40, "loki");
        dashboard_entry.scope = dashboard_entry.scope.with_dashboard("dash-1");
        store.put(dashboard_entry).unwrap();

        let by_dashboard = store.invalidate(&InvalidationTarget::Dashboard("dash-1".into()));
        assert_eq!(by_dashboard, RemovalSummary { entries: 1, bytes: 40 });

        let by_prefix = store.invalidate(&InvalidationTarget::DatasourcePrefix("prom-".into()));
        assert_eq!(by_prefix, RemovalSummary { entries: 2, bytes: 30 });

        let by_key = store.invalidate(&InvalidationTarget::Key(key(3)));
        assert_eq!(by_key.entries, 1);

        assert!(store.is_empty());
        assert_eq!(store.total_bytes(), 0);
        assert_eq!(store.stats().invalidated, 4);
    }

    #[test]
    fn test_invalidate_where_predicate() {
        let (clock, store) = store(10_000);
        store.put(entry(&clock, 1, 10, "ds1")).unwrap();
        store.put(entry(&clock, 2, 500, "ds1")).unwrap();

        let removed = store.invalidate_where(|entry| entry.size_bytes > 100);
        assert_eq!(removed.entries, 1);
        assert!(store.contains(&key(1)));
        assert_eq!(store.total_bytes(), 10);
    }

    #[test]
    fn test_shrinking_capacity_evicts() {
        let (clock, store) = store(1000);
        for seed in 1..=4 {
            store.put(entry(&clock, seed, 200, "ds1")).unwrap();
            clock.advance(Duration::from_millis(1));
        }

        assert_eq!(store.set_capacity(450), 2);
        assert_eq!(store.keys_by_recency(), vec![key(3), key(4)]);
        assert_eq!(store.capacity_bytes(), 450);
    }

    #[test]
    fn test_clear_and_stats() {
        let (clock, store) = store(1000);
        store.put(entry(&clock, 1, 100, "ds1")).unwrap();
        store.put(entry(&clock, 2, 150, "ds1")).unwrap();

        let stats = store.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_bytes, 250);
        assert!((stats.utilization() - 0.25).abs() < f64::EPSILON);

        assert_eq!(store.clear(), RemovalSummary { entries: 2, bytes: 250 });
        assert!(store.keys_by_recency().is_empty());
        assert_eq!(store.evict_if_over_capacity(), 0);
    }

    #[test]
    fn test_put_if_epoch_refuses_write_after_matching_invalidation() {
        let (clock, store) = store(1000);
        let epoch = store.epoch();

        store.invalidate(&InvalidationTarget::Datasource("ds1".into()));
        assert!(store.epoch() > epoch);

        let refused = store.put_if_epoch(entry(&clock, 1, 10, "ds1"), epoch);
        assert_eq!(
            refused,
            Err(CacheError::InvalidatedInFlight("datasource:ds1".to_string()))
        );
        assert!(store.is_empty());
        assert_eq!(store.stats().rejected_invalidated, 1);

        // Other datasources are unaffected, as are writes that started later
        assert!(store.put_if_epoch(entry(&clock, 2, 10, "ds2"), epoch).is_ok());
        assert!(store.put_if_epoch(entry(&clock, 3, 10, "ds1"), store.epoch()).is_ok());
    }

    #[test]
    fn test_clear_refuses_every_earlier_write() {
        let (clock, store) = store(1000);
        let epoch = store.epoch();
        store.clear();

        assert!(store.put_if_epoch(entry(&clock, 1, 10, "ds1"), epoch).is_err());
        assert!(store.put_if_epoch(entry(&clock, 2, 10, "ds2"), epoch).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_if_epoch_is_conservative_past_the_log() {
        let (clock, store) = store(1000);
        let epoch = store.epoch();
        for _ in 0..=INVALIDATION_LOG_SIZE {
            store.invalidate(&InvalidationTarget::Datasource("other".into()));
        }

        assert!(store.put_if_epoch(entry(&clock, 1, 10, "ds1"), epoch).is_err());
        assert!(store.put_if_epoch(entry(&clock, 1, 10, "ds1"), store.epoch()).is_ok());
    }
}
