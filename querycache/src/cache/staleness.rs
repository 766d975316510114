// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! TTL-based validity of cached entries

use std::time::{Duration, Instant};

use super::CacheEntry;

/// Decides whether a stored entry may still be served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    default_ttl: Duration,
}

impl StalenessPolicy {
    pub fn new(default_ttl: Duration) -> Self {
        Self { default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// `ttl_override`, else the entry's own TTL, else the policy default
    pub fn effective_ttl(&self, entry_ttl: Option<Duration>, ttl_override: Option<Duration>) -> Duration {
        ttl_override.or(entry_ttl).unwrap_or(self.default_ttl)
    }

    /// An entry is valid while its age is strictly below the effective TTL
    pub fn is_valid<V>(&self, entry: &CacheEntry<V>, now: Instant, ttl_override: Option<Duration>) -> bool {
        let ttl = self.effective_ttl(entry.ttl, ttl_override);
        entry.age(now) < ttl
    }

    pub fn expires_at<V>(&self, entry: &CacheEntry<V>, ttl_override: Option<Duration>) -> Instant {
        entry.created_at + self.effective_ttl(entry.ttl, ttl_override)
    }

    /// A zero TTL means the request must not touch the store at all
    pub fn is_never_cache(ttl: Option<Duration>) -> bool {
        matches!(ttl, Some(ttl) if ttl.is_zero())
    }
}
