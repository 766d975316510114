// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! CLI command handlers for QueryCache

use colored::Colorize;
use querycache::CacheConfig;
use std::path::PathBuf;

use super::commands::OutputFormat;
use super::output::ReportFormatter;
use super::replay;

/// Handle the check-config command
pub fn handle_check_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = match CacheConfig::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            println!("{}", format!("Configuration {:?} is invalid", path).red());
            return Err(e.into());
        }
    };

    println!("{}", format!("Configuration {:?} is valid\n", path).green());
    print!("{}", ReportFormatter::format_settings(&config));
    Ok(())
}

/// Handle the replay command
pub fn handle_replay(
    config_path: PathBuf,
    timeline_path: PathBuf,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = CacheConfig::from_file(&config_path)?;
    let steps = replay::load_timeline(&timeline_path)?;
    log::info!(
        "Replaying {} steps from {:?} with {:?}",
        steps.len(),
        timeline_path,
        config_path
    );

    let report = replay::replay(config, steps)?;
    print!("{}", ReportFormatter::format_replay(&report, format));
    Ok(())
}
