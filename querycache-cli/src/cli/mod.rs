// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! CLI module for QueryCache
//!
//! Validates cache configuration files and replays request timelines through
//! a gateway driven by a manual clock.

pub mod commands;
pub mod handlers;
pub mod output;
pub mod replay;

pub use commands::{Cli, Commands};
pub use handlers::{handle_check_config, handle_replay};
