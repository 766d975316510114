// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Query requests and their cache fingerprints
//!
//! A [`QueryRequest`] is the fully resolved form of a panel query: the
//! datasource it targets, its query model, an absolute time range and the
//! interpolated template variables. [`FingerprintBuilder`] turns one into a
//! [`Fingerprint`], the key under which its result is cached.

pub mod fingerprint;
pub mod request;

pub use fingerprint::{Fingerprint, FingerprintBuilder};
pub use request::{PanelQueryOptions, QueryRequest, TimeRange, VariableValue};
