// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Error types for the query cache

use std::time::Duration;
use thiserror::Error;

/// Cache-internal failures
///
/// None of these reach a caller of the gateway: they are recovered by running
/// the query without the cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Capacity exceeded: entry of {size} bytes exceeds cache budget of {limit} bytes")]
    CapacityExceeded { size: usize, limit: usize },

    #[error("Entry invalidated while its query was in flight: {0}")]
    InvalidatedInFlight(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Failure returned by a gateway fetch
///
/// `Clone` so that one outcome can be handed to every caller sharing an
/// in-flight fetch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError<E> {
    /// The upstream query failed; carries the executor's error unchanged
    #[error("Upstream query failed: {0}")]
    Upstream(E),

    #[error("In-flight query was abandoned before it produced a result")]
    Abandoned,

    #[error("Timed out after {0:?} waiting for an in-flight query")]
    WaitTimeout(Duration),
}

impl<E> FetchError<E> {
    pub fn is_upstream(&self) -> bool {
        matches!(self, FetchError::Upstream(_))
    }

    pub fn upstream(&self) -> Option<&E> {
        match self {
            FetchError::Upstream(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_upstream(self) -> Option<E> {
        match self {
            FetchError::Upstream(err) => Some(err),
            _ => None,
        }
    }
}

/// Ready-made upstream error for executors without their own error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct UpstreamError {
    pub message: String,
}

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
