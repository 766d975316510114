// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Request coordination in front of upstream datasources
//!
//! [`CacheGateway`] is the entry point: it combines the result store, the
//! staleness policy and [`SingleFlight`] so that concurrent identical misses
//! produce one upstream call.

pub mod gateway;
pub mod single_flight;

pub use gateway::{BypassReason, CacheGateway, CacheOutcome, Fetched, GatewayStats, QueryExecutor};
pub use single_flight::{FlightError, FlightRole, SingleFlight};
