// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Cache configuration and per-datasource settings
//!
//! The top-level keys mirror the query caching config schema
//! (`enabled`, `ttlSeconds`, `maxCacheSizeMB`). Datasources can override
//! enablement, TTL and time granularity, and individual query types can carry
//! their own TTL.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::{CacheError, CacheResult};

const MEGABYTE: usize = 1024 * 1024;

/// Global cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Enable/disable caching entirely
    pub enabled: bool,

    /// Default TTL for cached results
    pub ttl_seconds: u64,

    /// Byte budget of the result store
    #[serde(rename = "maxCacheSizeMB")]
    pub max_cache_size_mb: u64,

    /// Time range alignment for datasources that declare none
    pub default_time_granularity_ms: u64,

    /// How long a caller waits on another caller's in-flight query
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_timeout_ms: Option<u64>,

    /// Period of the background expiry sweep
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_interval_seconds: Option<u64>,

    /// Per-datasource overrides keyed by datasource UID
    pub datasources: BTreeMap<String, DatasourceCacheConfig>,
}

/// Overrides for a single datasource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatasourceCacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_granularity_ms: Option<u64>,

    /// Query type -> TTL in seconds
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub query_types: BTreeMap<String, u64>,
}

/// Effective settings for one datasource and query type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasourceSettings {
    pub enabled: bool,
    pub ttl: Duration,
    pub time_granularity: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 300,       // 5 minutes
            max_cache_size_mb: 100, // 100MB
            default_time_granularity_ms: 1000,
            wait_timeout_ms: None,
            sweep_interval_seconds: None,
            datasources: BTreeMap::new(),
        }
    }
}

impl DatasourceCacheConfig {
    pub fn with_ttl_seconds(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn with_time_granularity_ms(mut self, granularity_ms: u64) -> Self {
        self.time_granularity_ms = Some(granularity_ms);
        self
    }

    pub fn with_query_type_ttl(mut self, query_type: impl Into<String>, ttl_seconds: u64) -> Self {
        self.query_types.insert(query_type.into(), ttl_seconds);
        self
    }
}

impl CacheConfig {
    /// Configuration with caching switched off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Create configuration for memory-constrained environments
    pub fn memory_constrained() -> Self {
        Self {
            ttl_seconds: 60,
            max_cache_size_mb: 16,
            sweep_interval_seconds: Some(30),
            ..Self::default()
        }
    }

    pub fn with_datasource(
        mut self,
        datasource_uid: impl Into<String>,
        overrides: DatasourceCacheConfig,
    ) -> Self {
        self.datasources.insert(datasource_uid.into(), overrides);
        self
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> CacheResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| CacheError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        log::debug!("Loaded cache configuration from {}", path.display());
        Self::from_json_str(&contents)
    }

    /// Validate the configuration
    pub fn validate(&self) -> CacheResult<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.max_cache_size_mb == 0 {
            return Err(CacheError::InvalidConfig(
                "maxCacheSizeMB must be greater than 0 when caching is enabled".to_string(),
            ));
        }

        if self.sweep_interval_seconds == Some(0) {
            return Err(CacheError::InvalidConfig(
                "sweepIntervalSeconds must be greater than 0".to_string(),
            ));
        }

        if self.datasources.keys().any(|uid| uid.trim().is_empty()) {
            return Err(CacheError::InvalidConfig(
                "Datasource overrides must be keyed by a non-empty UID".to_string(),
            ));
        }

        Ok(())
    }

    pub fn max_cache_bytes(&self) -> usize {
        (self.max_cache_size_mb as usize).saturating_mul(MEGABYTE)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_seconds
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs)
    }

    /// Resolve the settings that apply to a request
    ///
    /// TTL resolution order is query type, then datasource, then the global
    /// default. A datasource is cached only if caching is enabled globally and
    /// not disabled for it.
    pub fn settings_for(&self, datasource_uid: &str, query_type: Option<&str>) -> DatasourceSettings {
        let overrides = self.datasources.get(datasource_uid);

        let enabled = self.enabled
            && overrides
                .and_then(|datasource| datasource.enabled)
                .unwrap_or(true);

        let ttl_seconds = overrides
            .and_then(|datasource| {
                query_type
                    .and_then(|kind| datasource.query_types.get(kind).copied())
                    .or(datasource.ttl_seconds)
            })
            .unwrap_or(self.ttl_seconds);

        let granularity_ms = overrides
            .and_then(|datasource| datasource.time_granularity_ms)
            .unwrap_or(self.default_time_granularity_ms);

        DatasourceSettings {
            enabled,
            ttl: Duration::from_secs(ttl_seconds),
            time_granularity: Duration::from_millis(granularity_ms),
        }
    }
}
