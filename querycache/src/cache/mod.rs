// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Result caching core
//!
//! This module provides the in-memory side of query caching:
//! - Byte-budgeted result storage with LRU eviction
//! - TTL-based staleness decisions
//! - Datasource/dashboard scoped invalidation
//! - Configuration and time sources

pub mod cache_config;
pub mod cache_store;
pub mod clock;
pub mod error;
pub mod invalidation;
pub mod staleness;

pub use cache_config::{CacheConfig, DatasourceCacheConfig, DatasourceSettings};
pub use cache_store::{CacheEntry, CacheStore, EntryScope, RemovalSummary, StoreStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CacheError, CacheResult, FetchError, UpstreamError};
pub use invalidation::{
    InvalidationEvent, InvalidationManager, InvalidationResult, InvalidationStats,
    InvalidationTarget,
};
pub use staleness::StalenessPolicy;

use serde_json::Value;
use std::sync::Arc;

/// Generic cached value trait
///
/// `size_bytes` is recorded once when an entry is stored and drives the
/// store's byte budget.
pub trait CacheValue: std::fmt::Debug + Clone + Send + Sync + 'static {
    fn size_bytes(&self) -> usize;
}

impl CacheValue for Vec<u8> {
    fn size_bytes(&self) -> usize {
        self.len()
    }
}

impl CacheValue for String {
    fn size_bytes(&self) -> usize {
        self.len()
    }
}

impl CacheValue for Value {
    fn size_bytes(&self) -> usize {
        json_size(self)
    }
}

impl<T: CacheValue> CacheValue for Arc<T> {
    fn size_bytes(&self) -> usize {
        self.as_ref().size_bytes()
    }
}

/// Length of the compact JSON rendering, without rendering it
fn json_size(value: &Value) -> usize {
    match value {
        Value::Null => 4,
        Value::Bool(true) => 4,
        Value::Bool(false) => 5,
        Value::Number(number) => number.to_string().len(),
        // Quotes only; escapes are not counted
        Value::String(text) => text.len() + 2,
        Value::Array(items) => {
            2 + items.iter().map(json_size).sum::<usize>() + items.len().saturating_sub(1)
        }
        Value::Object(map) => {
            2 + map
                .iter()
                .map(|(key, item)| key.len() + 3 + json_size(item))
                .sum::<usize>()
                + map.len().saturating_sub(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_size_matches_compact_rendering() {
        let frames = json!({
            "frames": [{"name": "up", "values": [1, 2.5, null, true]}],
            "status": "ok",
            "empty": {}
        });
        let rendered = serde_json::to_vec(&frames).unwrap();
        assert_eq!(frames.size_bytes(), rendered.len());
    }

    #[test]
    fn test_byte_payload_sizes() {
        assert_eq!(vec![0u8; 512].size_bytes(), 512);
        assert_eq!("result-A".to_string().size_bytes(), 8);
        assert_eq!(Arc::new(vec![0u8; 64]).size_bytes(), 64);
    }
}
