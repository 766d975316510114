// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! QueryCache - A single-flight query result cache for data-source proxies
//!
//! QueryCache sits between a dashboard query pipeline and the data sources it
//! talks to. Identical queries (same datasource, query model, resolved time
//! range and variables) are answered from memory until their TTL runs out, and
//! concurrent identical misses share a single upstream call.
//!
//! # Features
//!
//! - **Stable Fingerprints**: SHA-256 over a canonical encoding of the request
//! - **Byte-Budgeted Store**: LRU eviction against a configured memory budget
//! - **Single-Flight Fetches**: at most one upstream call per key at a time
//! - **Scoped Invalidation**: drop entries by datasource, dashboard or key
//! - **Fail-Open**: caching problems never prevent a query from running
//!
//! # Usage
//!
//! ```ignore
//! use querycache::{CacheConfig, CacheGateway, QueryRequest, TimeRange, UpstreamError};
//!
//! let gateway: CacheGateway<String> = CacheGateway::from_config(CacheConfig::default())?;
//! let request = QueryRequest::new("prom-main", serde_json::json!({"expr": "up"}),
//!     TimeRange::from_millis(1000, 2000));
//!
//! let value = gateway
//!     .fetch(&request, || async { Ok::<_, UpstreamError>("result".to_string()) })
//!     .await?;
//! ```

// Public modules - exposed to external users
pub mod cache;
pub mod coordinator;
pub mod query;

// Re-export the public API - CacheGateway is the main entry point
pub use cache::{
    CacheConfig, CacheEntry, CacheError, CacheResult, CacheStore, CacheValue, Clock,
    DatasourceCacheConfig, DatasourceSettings, EntryScope, FetchError, InvalidationEvent,
    InvalidationManager, InvalidationTarget, ManualClock, StalenessPolicy, StoreStats,
    SystemClock, UpstreamError,
};
pub use coordinator::{
    BypassReason, CacheGateway, CacheOutcome, Fetched, FlightError, FlightRole, GatewayStats,
    QueryExecutor, SingleFlight,
};
pub use query::{
    Fingerprint, FingerprintBuilder, PanelQueryOptions, QueryRequest, TimeRange, VariableValue,
};

/// QueryCache version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// QueryCache crate name
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
