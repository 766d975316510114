//! Test fixture for QueryCache integration tests

#![allow(dead_code)]

use querycache::{
    CacheConfig, CacheGateway, ManualClock, QueryRequest, TimeRange, UpstreamError,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Upstream stand-in that counts its calls
///
/// When gated, every call blocks until `release` is called, which lets tests
/// pile callers onto one in-flight fetch.
#[derive(Debug, Default)]
pub struct CountingUpstream {
    calls: AtomicUsize,
    gate: Option<Notify>,
}

impl CountingUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            gate: Some(Notify::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Let the blocked call through
    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub async fn respond(self: Arc<Self>, value: String) -> Result<String, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(value)
    }

    pub async fn fail(self: Arc<Self>, message: &'static str) -> Result<String, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Err(UpstreamError::new(message))
    }
}

/// Gateway over a manual clock
pub struct TestFixture {
    pub clock: Arc<ManualClock>,
    pub gateway: Arc<CacheGateway<String>>,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_ttl_seconds(ttl_seconds: u64) -> Self {
        Self::with_config(CacheConfig {
            ttl_seconds,
            ..CacheConfig::default()
        })
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let clock = Arc::new(ManualClock::new());
        let gateway = CacheGateway::with_clock(config, clock.clone())
            .expect("Failed to create cache gateway");
        Self {
            clock,
            gateway: Arc::new(gateway),
        }
    }

    pub fn advance_secs(&self, seconds: u64) {
        self.clock.advance(Duration::from_secs(seconds));
    }

    /// Fetch through the gateway, answering misses with `value`
    pub async fn fetch(
        &self,
        request: &QueryRequest,
        upstream: &Arc<CountingUpstream>,
        value: &str,
    ) -> String {
        let upstream = Arc::clone(upstream);
        let value = value.to_string();
        self.gateway
            .fetch(request, move || upstream.respond(value))
            .await
            .expect("fetch should succeed")
    }
}

/// The `up` query against ds1 over [1000, 2000]
pub fn up_request() -> QueryRequest {
    QueryRequest::new("ds1", json!({"expr": "up"}), TimeRange::from_millis(1000, 2000))
}

pub fn request_for(datasource: &str, expr: &str) -> QueryRequest {
    QueryRequest::new(datasource, json!({ "expr": expr }), TimeRange::from_millis(1000, 2000))
}
