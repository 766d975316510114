// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Stable cache keys for query requests
//!
//! The fingerprint is a SHA-256 digest over a canonical, length-prefixed
//! encoding of the request. Canonicalization sorts object keys at every depth
//! of the query model, aligns the time range to the datasource granularity and
//! walks variables in name order, so two requests that only differ in map
//! ordering or sub-granularity time drift share a key.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

use super::{QueryRequest, VariableValue};
use crate::cache::CacheResult;

/// Opaque 256-bit cache key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    /// First 12 hex characters, for logs
    pub fn short(&self) -> String {
        self.0[..6].iter().map(|byte| format!("{:02x}", byte)).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Derives fingerprints for one datasource's time granularity
///
/// Pure and cheap to construct; safe to use from any number of tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintBuilder {
    time_granularity: Duration,
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl FingerprintBuilder {
    pub fn new(time_granularity: Duration) -> Self {
        Self { time_granularity }
    }

    /// Builder that hashes time ranges at millisecond precision
    pub fn exact() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn time_granularity(&self) -> Duration {
        self.time_granularity
    }

    /// Compute the fingerprint of a request
    ///
    /// Fails with [`CacheError::Serialization`](crate::cache::CacheError::Serialization)
    /// when the query model cannot be turned into JSON.
    pub fn fingerprint<Q: Serialize>(&self, request: &QueryRequest<Q>) -> CacheResult<Fingerprint> {
        let model = serde_json::to_value(&request.query)?;
        let mut canonical_model = Vec::new();
        write_canonical(&model, &mut canonical_model)?;

        let range = request.time_range.aligned(self.time_granularity);

        let mut hasher = Sha256::new();
        write_field(&mut hasher, b"datasource", request.datasource_uid.as_bytes());
        write_optional(&mut hasher, b"query_type", request.query_type.as_deref());
        write_optional(&mut hasher, b"dashboard", request.dashboard_uid.as_deref());
        write_field(&mut hasher, b"from", &range.from_millis_epoch().to_be_bytes());
        write_field(&mut hasher, b"to", &range.to_millis_epoch().to_be_bytes());

        write_field(
            &mut hasher,
            b"variables",
            &(request.variables.len() as u64).to_be_bytes(),
        );
        // BTreeMap iteration is already sorted by name
        for (name, value) in &request.variables {
            write_field(&mut hasher, b"var", name.as_bytes());
            match value {
                VariableValue::Single(single) => {
                    write_field(&mut hasher, b"single", single.as_bytes());
                }
                VariableValue::Multi(values) => {
                    write_field(&mut hasher, b"multi", &(values.len() as u64).to_be_bytes());
                    for item in values {
                        write_field(&mut hasher, b"item", item.as_bytes());
                    }
                }
            }
        }

        write_field(&mut hasher, b"query", &canonical_model);

        let digest: [u8; 32] = hasher.finalize().into();
        Ok(Fingerprint(digest))
    }
}

fn write_field(hasher: &mut Sha256, tag: &[u8], bytes: &[u8]) {
    hasher.update(tag);
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn write_optional(hasher: &mut Sha256, tag: &[u8], value: Option<&str>) {
    match value {
        Some(text) => {
            hasher.update([1u8]);
            write_field(hasher, tag, text.as_bytes());
        }
        None => hasher.update([0u8]),
    }
}

/// JSON with object keys sorted at every depth
fn write_canonical(value: &Value, out: &mut Vec<u8>) -> CacheResult<()> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(number) => out.extend_from_slice(number.to_string().as_bytes()),
        Value::String(text) => serde_json::to_writer(&mut *out, text)?,
        Value::Array(items) => {
            out.push(b'[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));

            out.push(b'{');
            for (index, (key, item)) in fields.into_iter().enumerate() {
                if index > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(item, out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}
