// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Timeline replay through a gateway on a manual clock
//!
//! A timeline is a JSON array of steps:
//!
//! ```json
//! [
//!   {"atMs": 0, "request": {...}, "result": {"frames": []}},
//!   {"atMs": 35000, "request": {...}, "fail": "datasource unreachable"}
//! ]
//! ```
//!
//! Each step moves the clock to `atMs` and fetches `request`. On a miss the
//! synthetic upstream answers with `result` (or fails with `fail`).

use async_trait::async_trait;
use querycache::{
    CacheConfig, CacheError, CacheGateway, CacheOutcome, GatewayStats, ManualClock, QueryExecutor,
    QueryRequest, UpstreamError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid timeline: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid timeline: {0}")]
    Timeline(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineStep {
    /// Offset from the start of the replay
    pub at_ms: u64,
    pub request: QueryRequest,
    #[serde(default)]
    pub result: Option<Value>,
    /// Makes the upstream fail with this message
    #[serde(default)]
    pub fail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub step: usize,
    pub at_ms: u64,
    pub datasource_uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CacheOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub steps: Vec<StepReport>,
    pub stats: GatewayStats,
    pub cached_entries: usize,
    pub cached_bytes: usize,
}

/// Upstream that answers with whatever the current step scripts
struct ScriptedUpstream {
    step: usize,
    result: Option<Value>,
    fail: Option<String>,
}

#[async_trait]
impl QueryExecutor<Value> for ScriptedUpstream {
    async fn execute(&self, request: QueryRequest) -> Result<Value, UpstreamError> {
        if let Some(message) = &self.fail {
            return Err(UpstreamError::new(message.clone()));
        }
        Ok(self.result.clone().unwrap_or_else(|| {
            json!({"datasource": request.datasource_uid, "step": self.step})
        }))
    }
}

pub fn load_timeline(path: impl AsRef<Path>) -> Result<Vec<TimelineStep>, ReplayError> {
    let contents = std::fs::read_to_string(path)?;
    parse_timeline(&contents)
}

pub fn parse_timeline(json: &str) -> Result<Vec<TimelineStep>, ReplayError> {
    let steps: Vec<TimelineStep> = serde_json::from_str(json)?;

    if let Some(pair) = steps.windows(2).find(|pair| pair[1].at_ms < pair[0].at_ms) {
        return Err(ReplayError::Timeline(format!(
            "steps must be ordered by atMs ({} follows {})",
            pair[1].at_ms, pair[0].at_ms
        )));
    }

    Ok(steps)
}

/// Replay `steps` against a fresh gateway built from `config`
pub fn replay(config: CacheConfig, steps: Vec<TimelineStep>) -> Result<ReplayReport, ReplayError> {
    let clock = Arc::new(ManualClock::new());
    let gateway: CacheGateway<Value> = CacheGateway::with_clock(config, clock.clone())?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let mut reports = Vec::with_capacity(steps.len());
    for (index, step) in steps.into_iter().enumerate() {
        clock.set_elapsed(Duration::from_millis(step.at_ms));
        log::debug!("Replaying step {} at {}ms", index, step.at_ms);

        let fingerprint = gateway.fingerprint(&step.request).ok().map(|key| key.short());
        let upstream = Arc::new(ScriptedUpstream {
            step: index,
            result: step.result,
            fail: step.fail,
        });
        let request = step.request;
        let owned = request.clone();

        let fetched = runtime.block_on(
            gateway.fetch_traced(&request, move || async move { upstream.execute(owned).await }),
        );

        let mut report = StepReport {
            step: index,
            at_ms: step.at_ms,
            datasource_uid: request.datasource_uid,
            fingerprint,
            outcome: None,
            value: None,
            error: None,
        };
        match fetched {
            Ok(fetched) => {
                report.outcome = Some(fetched.outcome);
                report.value = Some(fetched.value);
            }
            Err(err) => report.error = Some(err.to_string()),
        }
        reports.push(report);
    }

    let store = gateway.store().stats();
    Ok(ReplayReport {
        steps: reports,
        stats: gateway.stats(),
        cached_entries: store.entries,
        cached_bytes: store.total_bytes,
    })
}
