// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Cache invalidation targets and event handling

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use super::{CacheEntry, CacheStore, CacheValue};
use crate::query::Fingerprint;

/// Which entries an invalidation removes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InvalidationTarget {
    Key(Fingerprint),
    Datasource(String),
    /// Every datasource whose UID starts with the prefix
    DatasourcePrefix(String),
    Dashboard(String),
    All,
}

impl InvalidationTarget {
    pub fn matches<V>(&self, entry: &CacheEntry<V>) -> bool {
        match self {
            InvalidationTarget::Key(key) => entry.fingerprint == *key,
            InvalidationTarget::Datasource(uid) => entry.scope.datasource_uid == *uid,
            InvalidationTarget::DatasourcePrefix(prefix) => {
                entry.scope.datasource_uid.starts_with(prefix.as_str())
            }
            InvalidationTarget::Dashboard(uid) => {
                entry.scope.dashboard_uid.as_deref() == Some(uid.as_str())
            }
            InvalidationTarget::All => true,
        }
    }
}

impl fmt::Display for InvalidationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationTarget::Key(key) => write!(f, "key:{}", key.short()),
            InvalidationTarget::Datasource(uid) => write!(f, "datasource:{}", uid),
            InvalidationTarget::DatasourcePrefix(prefix) => write!(f, "datasource:{}*", prefix),
            InvalidationTarget::Dashboard(uid) => write!(f, "dashboard:{}", uid),
            InvalidationTarget::All => write!(f, "all"),
        }
    }
}

/// Events that can trigger cache invalidation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationEvent {
    DatasourceUpdated { uid: String },
    DatasourceDeleted { uid: String },
    DashboardSaved { uid: String },
    DashboardDeleted { uid: String },
    Manual {
        target: InvalidationTarget,
        reason: String,
    },
}

impl InvalidationEvent {
    pub fn target(&self) -> InvalidationTarget {
        match self {
            InvalidationEvent::DatasourceUpdated { uid }
            | InvalidationEvent::DatasourceDeleted { uid } => {
                InvalidationTarget::Datasource(uid.clone())
            }
            InvalidationEvent::DashboardSaved { uid }
            | InvalidationEvent::DashboardDeleted { uid } => {
                InvalidationTarget::Dashboard(uid.clone())
            }
            InvalidationEvent::Manual { target, .. } => target.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InvalidationEvent::DatasourceUpdated { .. } => "datasource_updated",
            InvalidationEvent::DatasourceDeleted { .. } => "datasource_deleted",
            InvalidationEvent::DashboardSaved { .. } => "dashboard_saved",
            InvalidationEvent::DashboardDeleted { .. } => "dashboard_deleted",
            InvalidationEvent::Manual { .. } => "manual",
        }
    }
}

/// Result of invalidation operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationResult {
    pub entries_invalidated: usize,
    pub memory_freed: usize,
    pub duration: Duration,
    pub target: InvalidationTarget,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvalidationStats {
    pub total_events: u64,
    pub total_invalidations: u64,
    pub total_memory_freed: usize,
    pub datasource_events: u64,
    pub dashboard_events: u64,
    pub manual_events: u64,
}

type HistoryRecord = (InvalidationEvent, InvalidationResult, Instant);

/// Applies invalidation events to a store and keeps an audit trail
#[derive(Debug)]
pub struct InvalidationManager {
    event_history: RwLock<VecDeque<HistoryRecord>>,
    max_history_size: usize,
    stats: RwLock<InvalidationStats>,
}

impl Default for InvalidationManager {
    fn default() -> Self {
        Self::new(100)
    }
}

impl InvalidationManager {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            event_history: RwLock::new(VecDeque::with_capacity(max_history_size.min(1024))),
            max_history_size,
            stats: RwLock::new(InvalidationStats::default()),
        }
    }

    /// Handle invalidation event
    pub fn handle_event<V: CacheValue>(
        &self,
        store: &CacheStore<V>,
        event: InvalidationEvent,
    ) -> InvalidationResult {
        let start_time = Instant::now();
        let target = event.target();
        let removed = store.invalidate(&target);

        let result = InvalidationResult {
            entries_invalidated: removed.entries,
            memory_freed: removed.bytes,
            duration: start_time.elapsed(),
            target,
        };

        log::info!(
            "Cache invalidation ({}) on {}: {} entries, {} bytes freed",
            event.kind(),
            result.target,
            result.entries_invalidated,
            result.memory_freed
        );

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            stats.total_invalidations += result.entries_invalidated as u64;
            stats.total_memory_freed += result.memory_freed;
            match &event {
                InvalidationEvent::DatasourceUpdated { .. }
                | InvalidationEvent::DatasourceDeleted { .. } => stats.datasource_events += 1,
                InvalidationEvent::DashboardSaved { .. }
                | InvalidationEvent::DashboardDeleted { .. } => stats.dashboard_events += 1,
                InvalidationEvent::Manual { .. } => stats.manual_events += 1,
            }
        }

        self.record_event_result(event, result.clone());
        result
    }

    pub fn stats(&self) -> InvalidationStats {
        self.stats.read().clone()
    }

    /// Most recent events first
    pub fn recent_events(&self, limit: usize) -> Vec<HistoryRecord> {
        self.event_history
            .read()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    fn record_event_result(&self, event: InvalidationEvent, result: InvalidationResult) {
        if self.max_history_size == 0 {
            return;
        }
        let mut history = self.event_history.write();
        history.push_back((event, result, Instant::now()));
        while history.len() > self.max_history_size {
            history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntryScope;

    fn populated_store() -> CacheStore<String> {
        let store = CacheStore::new(10_000);
        let now = Instant::now();
        let scopes = [
            EntryScope::datasource("prom-a").with_dashboard("ops"),
            EntryScope::datasource("prom-a"),
            EntryScope::datasource("prom-b").with_dashboard("ops"),
            EntryScope::datasource("loki"),
        ];
        for (seed, scope) in scopes.into_iter().enumerate() {
            let entry = CacheEntry::new(
                Fingerprint::from_bytes([seed as u8; 32]),
                format!("result-{}", seed),
                now,
                None,
                scope,
            );
            store.put(entry).unwrap();
        }
        store
    }

    #[test]
    fn test_event_targets() {
        let updated = InvalidationEvent::DatasourceUpdated { uid: "ds1".into() };
        assert_eq!(updated.target(), InvalidationTarget::Datasource("ds1".into()));

        let saved = InvalidationEvent::DashboardSaved { uid: "ops".into() };
        assert_eq!(saved.target(), InvalidationTarget::Dashboard("ops".into()));
        assert_eq!(saved.kind(), "dashboard_saved");
    }

    #[test]
    fn test_datasource_event_removes_only_that_datasource() {
        let store = populated_store();
        let manager = InvalidationManager::new(10);

        let result = manager.handle_event(
            &store,
            InvalidationEvent::DatasourceUpdated {
                uid: "prom-a".into(),
            },
        );

        assert_eq!(result.entries_invalidated, 2);
        assert_eq!(result.memory_freed, "result-0".len() + "result-1".len());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_dashboard_event_spans_datasources() {
        let store = populated_store();
        let manager = InvalidationManager::new(10);

        let result =
            manager.handle_event(&store, InvalidationEvent::DashboardDeleted { uid: "ops".into() });

        assert_eq!(result.entries_invalidated, 2);
        assert!(store.contains(&Fingerprint::from_bytes([1; 32])));
        assert!(store.contains(&Fingerprint::from_bytes([3; 32])));
    }

    #[test]
    fn test_history_is_bounded_and_newest_first() {
        let store = populated_store();
        let manager = InvalidationManager::new(2);

        for uid in ["a", "b", "c"] {
            manager.handle_event(
                &store,
                InvalidationEvent::Manual {
                    target: InvalidationTarget::Datasource(uid.into()),
                    reason: "test".into(),
                },
            );
        }

        let recent = manager.recent_events(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].1.target, InvalidationTarget::Datasource("c".into()));
        assert_eq!(recent[1].1.target, InvalidationTarget::Datasource("b".into()));
    }

    #[test]
    fn test_stats_accumulate() {
        let store = populated_store();
        let manager = InvalidationManager::default();

        manager.handle_event(&store, InvalidationEvent::DatasourceDeleted { uid: "loki".into() });
        manager.handle_event(&store, InvalidationEvent::DashboardSaved { uid: "ops".into() });
        manager.handle_event(
            &store,
            InvalidationEvent::Manual {
                target: InvalidationTarget::All,
                reason: "flush".into(),
            },
        );

        let stats = manager.stats();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.total_invalidations, 4);
        assert_eq!(stats.datasource_events, 1);
        assert_eq!(stats.dashboard_events, 1);
        assert_eq!(stats.manual_events, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_target_display() {
        assert_eq!(InvalidationTarget::DatasourcePrefix("prom".into()).to_string(), "datasource:prom*");
        assert_eq!(InvalidationTarget::All.to_string(), "all");
    }
}
