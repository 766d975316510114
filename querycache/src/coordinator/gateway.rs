// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Cache gateway in front of the upstream query executor
//!
//! Per request: resolve settings, fingerprint, look up, and on a miss run the
//! upstream call through the single-flight coordinator, storing a successful
//! result. Anything that goes wrong inside the cache falls back to running
//! the query uncached; upstream errors are never cached.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::single_flight::{FlightError, FlightRole, SingleFlight};
use crate::cache::{
    CacheConfig, CacheEntry, CacheError, CacheResult, CacheStore, CacheValue, Clock, EntryScope, FetchError,
    InvalidationEvent, InvalidationManager, InvalidationResult, InvalidationStats,
    InvalidationTarget, RemovalSummary, StalenessPolicy, SystemClock, UpstreamError,
};
use crate::query::{Fingerprint, FingerprintBuilder, QueryRequest};

const INVALIDATION_HISTORY: usize = 100;

/// How a fetch was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum CacheOutcome {
    /// Served from the store
    Hit,
    /// This caller's upstream call produced the value
    Miss,
    /// Shared another caller's in-flight upstream call
    Coalesced,
    /// The store was not consulted
    Bypass(BypassReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassReason {
    /// Caching is off globally or for the datasource
    Disabled,
    /// The effective TTL is zero
    ZeroTtl,
    /// The query model could not be fingerprinted
    Unfingerprintable,
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheOutcome::Hit => write!(f, "hit"),
            CacheOutcome::Miss => write!(f, "miss"),
            CacheOutcome::Coalesced => write!(f, "coalesced"),
            CacheOutcome::Bypass(BypassReason::Disabled) => write!(f, "bypass (disabled)"),
            CacheOutcome::Bypass(BypassReason::ZeroTtl) => write!(f, "bypass (zero ttl)"),
            CacheOutcome::Bypass(BypassReason::Unfingerprintable) => {
                write!(f, "bypass (unfingerprintable)")
            }
        }
    }
}

/// A fetched value and how it was obtained
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fetched<V> {
    pub value: V,
    pub outcome: CacheOutcome,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    /// Lookups that found an expired entry
    pub stale: u64,
    pub bypasses: u64,
    pub coalesced: u64,
    pub upstream_calls: u64,
    pub upstream_failures: u64,
    pub serialization_fallbacks: u64,
    pub oversize_skips: u64,
    /// Results not stored because a matching invalidation landed while
    /// their upstream call was running
    pub invalidated_in_flight: u64,
    pub wait_timeouts: u64,
    pub abandoned: u64,
}

impl GatewayStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Executes queries against a datasource
#[async_trait]
pub trait QueryExecutor<V, E = UpstreamError>: Send + Sync {
    async fn execute(&self, request: QueryRequest) -> Result<V, E>;
}

type FlightOutcome<V, E> = Result<(V, CacheOutcome), FetchError<E>>;

/// Fronts an upstream executor with the result cache
pub struct CacheGateway<V, E = UpstreamError> {
    config: RwLock<CacheConfig>,
    store: Arc<CacheStore<V>>,
    flights: SingleFlight<Fingerprint, FlightOutcome<V, E>>,
    invalidation: InvalidationManager,
    stats: Arc<Mutex<GatewayStats>>,
}

impl<V, E> CacheGateway<V, E>
where
    V: CacheValue,
    E: fmt::Display + Clone + Send + Sync + 'static,
{
    /// Build a gateway over an existing store
    ///
    /// The store keeps the capacity it was created with.
    pub fn new(config: CacheConfig, store: Arc<CacheStore<V>>) -> CacheResult<Self> {
        config.validate()?;
        log::debug!(
            "Query cache gateway created (enabled: {}, ttl: {}s, budget: {} bytes)",
            config.enabled,
            config.ttl_seconds,
            store.capacity_bytes()
        );
        Ok(Self {
            config: RwLock::new(config),
            store,
            flights: SingleFlight::new(),
            invalidation: InvalidationManager::new(INVALIDATION_HISTORY),
            stats: Arc::new(Mutex::new(GatewayStats::default())),
        })
    }

    pub fn from_config(config: CacheConfig) -> CacheResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> CacheResult<Self> {
        let store = Arc::new(CacheStore::with_clock(config.max_cache_bytes(), clock));
        Self::new(config, store)
    }

    /// Fetch a query result, from the cache when possible
    pub async fn fetch<Q, F, Fut>(&self, request: &QueryRequest<Q>, upstream: F) -> Result<V, FetchError<E>>
    where
        Q: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.fetch_traced(request, upstream)
            .await
            .map(|fetched| fetched.value)
    }

    /// Fetch through a [`QueryExecutor`]
    pub async fn fetch_with<X>(&self, request: &QueryRequest, executor: Arc<X>) -> Result<V, FetchError<E>>
    where
        X: QueryExecutor<V, E> + 'static,
    {
        let owned = request.clone();
        self.fetch(request, move || async move { executor.execute(owned).await })
            .await
    }

    /// Like [`fetch`](Self::fetch) but also reports how the value was obtained
    pub async fn fetch_traced<Q, F, Fut>(
        &self,
        request: &QueryRequest<Q>,
        upstream: F,
    ) -> Result<Fetched<V>, FetchError<E>>
    where
        Q: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.stats.lock().requests += 1;
        // Read before the settings so that a later invalidation or disable
        // is seen by the write at the end of the flight
        let epoch = self.store.epoch();

        let (settings, wait_timeout) = {
            let config = self.config.read();
            (
                config.settings_for(&request.datasource_uid, request.query_type.as_deref()),
                config.wait_timeout(),
            )
        };

        if !settings.enabled {
            return self.bypass(upstream, BypassReason::Disabled).await;
        }

        let ttl = request.ttl_override.unwrap_or(settings.ttl);
        if ttl.is_zero() {
            return self.bypass(upstream, BypassReason::ZeroTtl).await;
        }

        let key = match FingerprintBuilder::new(settings.time_granularity).fingerprint(request) {
            Ok(key) => key,
            Err(err) => {
                log::warn!(
                    "Query for datasource {} cannot be fingerprinted, running uncached: {}",
                    request.datasource_uid,
                    err
                );
                self.stats.lock().serialization_fallbacks += 1;
                return self
                    .bypass(upstream, BypassReason::Unfingerprintable)
                    .await;
            }
        };

        let policy = StalenessPolicy::new(ttl);
        if let Some(entry) = self.store.get(&key) {
            if policy.is_valid(&entry, self.store.clock().now(), request.ttl_override) {
                log::debug!("Cache hit for {:?}", key);
                self.stats.lock().hits += 1;
                return Ok(Fetched {
                    value: entry.payload,
                    outcome: CacheOutcome::Hit,
                });
            }

            log::debug!("Cache entry {:?} expired, refetching", key);
            self.stats.lock().stale += 1;
            self.store.remove_if_generation(&key, entry.generation);
        }

        log::debug!("Cache miss for {:?}", key);
        let work = {
            let store = Arc::clone(&self.store);
            let stats = Arc::clone(&self.stats);
            let scope = EntryScope::from_request(request);
            let ttl_override = request.ttl_override;
            move || {
                let call = upstream();
                async move {
                    // Another flight may have stored a fresh value since our lookup
                    if let Some(entry) = store.peek(&key) {
                        if policy.is_valid(&entry, store.clock().now(), ttl_override) {
                            return Ok((entry.payload, CacheOutcome::Hit));
                        }
                    }

                    stats.lock().upstream_calls += 1;
                    match call.await {
                        Ok(value) => {
                            let entry =
                                CacheEntry::new(key, value.clone(), store.clock().now(), Some(ttl), scope);
                            match store.put_if_epoch(entry, epoch) {
                                Ok(_) => {}
                                Err(err @ CacheError::InvalidatedInFlight(_)) => {
                                    log::debug!("Result for {:?} not cached: {}", key, err);
                                    stats.lock().invalidated_in_flight += 1;
                                }
                                Err(err) => {
                                    log::warn!("Result for {:?} not cached: {}", key, err);
                                    stats.lock().oversize_skips += 1;
                                }
                            }
                            Ok((value, CacheOutcome::Miss))
                        }
                        Err(err) => {
                            log::debug!("Upstream query for {:?} failed: {}", key, err);
                            stats.lock().upstream_failures += 1;
                            Err(FetchError::Upstream(err))
                        }
                    }
                }
            }
        };

        match self.flights.execute(key, work, wait_timeout).await {
            Ok((result, role)) => {
                let (value, outcome) = result?;
                let outcome = match role {
                    FlightRole::Follower => {
                        log::debug!("Coalesced onto in-flight query {:?}", key);
                        CacheOutcome::Coalesced
                    }
                    FlightRole::Leader => outcome,
                };
                {
                    let mut stats = self.stats.lock();
                    match outcome {
                        CacheOutcome::Hit => stats.hits += 1,
                        CacheOutcome::Miss => stats.misses += 1,
                        CacheOutcome::Coalesced => stats.coalesced += 1,
                        CacheOutcome::Bypass(_) => stats.bypasses += 1,
                    }
                }
                Ok(Fetched { value, outcome })
            }
            Err(FlightError::TimedOut(limit)) => {
                log::warn!("Gave up waiting {:?} for in-flight query {:?}", limit, key);
                self.stats.lock().wait_timeouts += 1;
                Err(FetchError::WaitTimeout(limit))
            }
            Err(FlightError::Abandoned) => {
                log::warn!("In-flight query {:?} was abandoned", key);
                self.stats.lock().abandoned += 1;
                Err(FetchError::Abandoned)
            }
        }
    }

    async fn bypass<F, Fut>(&self, upstream: F, reason: BypassReason) -> Result<Fetched<V>, FetchError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        {
            let mut stats = self.stats.lock();
            stats.bypasses += 1;
            stats.upstream_calls += 1;
        }

        match upstream().await {
            Ok(value) => Ok(Fetched {
                value,
                outcome: CacheOutcome::Bypass(reason),
            }),
            Err(err) => {
                self.stats.lock().upstream_failures += 1;
                Err(FetchError::Upstream(err))
            }
        }
    }

    /// Fingerprint a request with the granularity configured for its datasource
    pub fn fingerprint<Q: Serialize>(&self, request: &QueryRequest<Q>) -> CacheResult<Fingerprint> {
        let granularity = self
            .config
            .read()
            .settings_for(&request.datasource_uid, request.query_type.as_deref())
            .time_granularity;
        FingerprintBuilder::new(granularity).fingerprint(request)
    }

    pub fn handle_invalidation(&self, event: InvalidationEvent) -> InvalidationResult {
        self.invalidation.handle_event(&self.store, event)
    }

    pub fn invalidate_datasource(&self, datasource_uid: &str) -> InvalidationResult {
        self.handle_invalidation(InvalidationEvent::Manual {
            target: InvalidationTarget::Datasource(datasource_uid.to_string()),
            reason: "datasource invalidation requested".to_string(),
        })
    }

    pub fn invalidate_dashboard(&self, dashboard_uid: &str) -> InvalidationResult {
        self.handle_invalidation(InvalidationEvent::Manual {
            target: InvalidationTarget::Dashboard(dashboard_uid.to_string()),
            reason: "dashboard invalidation requested".to_string(),
        })
    }

    /// Drop every entry whose own TTL has run out
    pub fn purge_expired(&self) -> RemovalSummary {
        let policy = StalenessPolicy::new(self.config.read().default_ttl());
        let now = self.store.clock().now();
        let purged = self.store.purge_where(|entry| !policy.is_valid(entry, now, None));
        if purged.entries > 0 {
            log::info!(
                "Purged {} expired cache entries ({} bytes)",
                purged.entries,
                purged.bytes
            );
        }
        purged
    }

    /// Start a background task that purges expired entries every
    /// `sweepIntervalSeconds`
    ///
    /// Returns `None` when no sweep interval is configured. The task stops on
    /// its own once the gateway is dropped.
    pub fn spawn_janitor(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.read().sweep_interval()?;
        let gateway = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(gateway) = gateway.upgrade() else {
                    break;
                };
                gateway.purge_expired();
            }
            log::debug!("Cache janitor stopped");
        }))
    }

    /// Replace the configuration, resizing the store to the new budget
    pub fn update_config(&self, new_config: CacheConfig) -> CacheResult<()> {
        new_config.validate()?;

        let evicted = self.store.set_capacity(new_config.max_cache_bytes());
        let enabled = new_config.enabled;
        log::info!(
            "Query cache configuration updated (enabled: {}, ttl: {}s, budget: {}MB, evicted: {})",
            new_config.enabled,
            new_config.ttl_seconds,
            new_config.max_cache_size_mb,
            evicted
        );
        *self.config.write() = new_config;

        // After the swap, so flights that saw the old config cannot store
        if !enabled {
            self.store.clear();
        }
        Ok(())
    }

    pub fn config(&self) -> CacheConfig {
        self.config.read().clone()
    }

    pub fn store(&self) -> &Arc<CacheStore<V>> {
        &self.store
    }

    pub fn in_flight_count(&self) -> usize {
        self.flights.in_flight_count()
    }

    /// Callers currently waiting on the in-flight fetch for `key`
    pub fn waiters(&self, key: &Fingerprint) -> usize {
        self.flights.waiters(key)
    }

    pub fn stats(&self) -> GatewayStats {
        self.stats.lock().clone()
    }

    pub fn invalidation_stats(&self) -> InvalidationStats {
        self.invalidation.stats()
    }

    pub fn clear(&self) -> RemovalSummary {
        self.store.clear()
    }
}
