// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Resolved query requests as they arrive from the query pipeline

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Absolute time range of a query
///
/// Relative expressions such as `now-1h` are resolved by the caller before a
/// request reaches the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// Build a range from epoch milliseconds
    ///
    /// Values outside chrono's range saturate to its earliest or latest
    /// representable instant.
    pub fn from_millis(from_ms: i64, to_ms: i64) -> Self {
        Self {
            from: instant_from_millis(from_ms),
            to: instant_from_millis(to_ms),
        }
    }

    pub fn from_millis_epoch(&self) -> i64 {
        self.from.timestamp_millis()
    }

    pub fn to_millis_epoch(&self) -> i64 {
        self.to.timestamp_millis()
    }

    /// Round both ends down to a multiple of `granularity`
    ///
    /// A zero granularity leaves the range untouched.
    pub fn aligned(&self, granularity: Duration) -> Self {
        let step = granularity.as_millis().min(i64::MAX as u128) as i64;
        if step == 0 {
            return *self;
        }

        let floor = |ms: i64| ms - ms.rem_euclid(step);
        Self::from_millis(
            floor(self.from_millis_epoch()),
            floor(self.to_millis_epoch()),
        )
    }
}

fn instant_from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(if ms < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// Interpolated value of a template variable
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    Single(String),
    /// Multi-select variables keep their selection order
    Multi(Vec<String>),
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::Single(value.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        VariableValue::Single(value)
    }
}

impl From<Vec<String>> for VariableValue {
    fn from(values: Vec<String>) -> Self {
        VariableValue::Multi(values)
    }
}

/// A query ready to be executed against a datasource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest<Q = Value> {
    pub datasource_uid: String,

    /// Datasource-specific query model
    pub query: Q,

    pub time_range: TimeRange,

    #[serde(default)]
    pub variables: BTreeMap<String, VariableValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,

    /// Dashboard the query belongs to, used for scoped invalidation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_uid: Option<String>,

    /// Overrides the configured TTL; zero disables caching for this request
    #[serde(
        default,
        rename = "ttlOverrideMs",
        with = "optional_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub ttl_override: Option<Duration>,
}

impl<Q> QueryRequest<Q> {
    pub fn new(datasource_uid: impl Into<String>, query: Q, time_range: TimeRange) -> Self {
        Self {
            datasource_uid: datasource_uid.into(),
            query,
            time_range,
            variables: BTreeMap::new(),
            query_type: None,
            dashboard_uid: None,
            ttl_override: None,
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<VariableValue>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_query_type(mut self, query_type: impl Into<String>) -> Self {
        self.query_type = Some(query_type.into());
        self
    }

    pub fn with_dashboard(mut self, dashboard_uid: impl Into<String>) -> Self {
        self.dashboard_uid = Some(dashboard_uid.into());
        self
    }

    pub fn with_ttl_override(mut self, ttl: Duration) -> Self {
        self.ttl_override = Some(ttl);
        self
    }

    /// Apply cache-related options read from the owning dashboard panel
    pub fn with_panel_options(mut self, options: &PanelQueryOptions) -> Self {
        if let Some(ttl) = options.query_caching_ttl {
            self.ttl_override = Some(ttl);
        }
        self
    }
}

/// Cache-related options carried by a dashboard panel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PanelQueryOptions {
    /// Panel-level `queryCachingTTL`, stored in milliseconds
    pub query_caching_ttl: Option<Duration>,
}

impl PanelQueryOptions {
    /// Read options from a panel's JSON model
    ///
    /// `queryCachingTTL` may be a number or a numeric string; empty strings,
    /// unparsable and negative values are ignored.
    pub fn from_panel_json(panel: &Value) -> Self {
        let query_caching_ttl = panel
            .get("queryCachingTTL")
            .and_then(parse_millis)
            .map(Duration::from_millis);

        Self { query_caching_ttl }
    }
}

fn parse_millis(value: &Value) -> Option<u64> {
    let millis = match value {
        Value::String(text) if !text.is_empty() => text.parse::<i64>().ok(),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        _ => None,
    }?;

    u64::try_from(millis).ok()
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_time_range_from_millis() {
        let range = TimeRange::from_millis(1000, 2000);
        assert_eq!(range.from_millis_epoch(), 1000);
        assert_eq!(range.to_millis_epoch(), 2000);
    }

    #[test]
    fn test_time_range_alignment() {
        let range = TimeRange::from_millis(1_675_262_550_123, 1_675_284_150_987);
        let aligned = range.aligned(Duration::from_secs(1));
        assert_eq!(aligned.from_millis_epoch(), 1_675_262_550_000);
        assert_eq!(aligned.to_millis_epoch(), 1_675_284_150_000);

        let minute = range.aligned(Duration::from_secs(60));
        assert_eq!(minute.from_millis_epoch() % 60_000, 0);
        assert!(minute.from_millis_epoch() <= range.from_millis_epoch());

        assert_eq!(range.aligned(Duration::ZERO), range);
    }

    #[test]
    fn test_alignment_before_epoch_rounds_down() {
        let range = TimeRange::from_millis(-1500, -500);
        let aligned = range.aligned(Duration::from_secs(1));
        assert_eq!(aligned.from_millis_epoch(), -2000);
        assert_eq!(aligned.to_millis_epoch(), -1000);
    }

    #[test]
    fn test_out_of_range_millis_saturate() {
        let range = TimeRange::from_millis(i64::MIN, i64::MAX);
        assert_eq!(range.from, DateTime::<Utc>::MIN_UTC);
        assert_eq!(range.to, DateTime::<Utc>::MAX_UTC);

        // Flooring the earliest instant must not wrap around to the epoch
        let earliest = TimeRange::new(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MIN_UTC);
        let aligned = earliest.aligned(Duration::from_secs(3600));
        assert_eq!(aligned.from, DateTime::<Utc>::MIN_UTC);
        assert_ne!(aligned.from_millis_epoch(), 0);
    }

    #[test]
    fn test_panel_options_number_and_string() {
        let numeric = PanelQueryOptions::from_panel_json(&json!({"queryCachingTTL": 60000}));
        assert_eq!(numeric.query_caching_ttl, Some(Duration::from_secs(60)));

        let float = PanelQueryOptions::from_panel_json(&json!({"queryCachingTTL": 1500.7}));
        assert_eq!(float.query_caching_ttl, Some(Duration::from_millis(1500)));

        let text = PanelQueryOptions::from_panel_json(&json!({"queryCachingTTL": "30000"}));
        assert_eq!(text.query_caching_ttl, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_panel_options_ignores_bad_values() {
        for panel in [
            json!({}),
            json!({"queryCachingTTL": ""}),
            json!({"queryCachingTTL": "soon"}),
            json!({"queryCachingTTL": " 30000 "}),
            json!({"queryCachingTTL": -5}),
            json!({"queryCachingTTL": null}),
        ] {
            assert_eq!(
                PanelQueryOptions::from_panel_json(&panel).query_caching_ttl,
                None,
                "panel {} should not yield a TTL",
                panel
            );
        }
    }

    #[test]
    fn test_panel_options_applied_to_request() {
        let options = PanelQueryOptions::from_panel_json(&json!({"queryCachingTTL": 0}));
        let request = QueryRequest::new("ds1", json!({"expr": "up"}), TimeRange::from_millis(0, 1))
            .with_panel_options(&options);
        assert_eq!(request.ttl_override, Some(Duration::ZERO));
    }

    #[test]
    fn test_request_json_shape() {
        let request: QueryRequest = serde_json::from_value(json!({
            "datasourceUid": "prom-main",
            "query": {"expr": "rate(http_requests_total[5m])"},
            "timeRange": {"from": "2023-01-30T19:33:01Z", "to": "2023-01-30T20:33:01Z"},
            "variables": {"job": "api", "instance": ["a", "b"]},
            "ttlOverrideMs": 15000
        }))
        .unwrap();

        assert_eq!(request.datasource_uid, "prom-main");
        assert_eq!(request.ttl_override, Some(Duration::from_secs(15)));
        assert_eq!(
            request.variables.get("instance"),
            Some(&VariableValue::Multi(vec!["a".into(), "b".into()]))
        );
        assert_eq!(request.variables.get("job"), Some(&VariableValue::from("api")));
        assert!(request.dashboard_uid.is_none());
    }
}
