// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Report formatting for CLI output

use colored::*;
use comfy_table::{presets::UTF8_FULL, Cell, Color, Table};
use querycache::{CacheConfig, CacheOutcome};
use serde_json::Value;

use super::commands::OutputFormat;
use super::replay::ReplayReport;

/// Value column width before truncation
const VALUE_PREVIEW_CHARS: usize = 48;

pub struct ReportFormatter;

impl ReportFormatter {
    /// Effective settings of the default datasource and every override
    pub fn format_settings(config: &CacheConfig) -> String {
        let mut output = String::new();

        let status = if config.enabled {
            "enabled".green()
        } else {
            "disabled".red()
        };
        output.push_str(&format!("{} {}\n", "Query caching".bold(), status));
        output.push_str(&format!(
            "Default TTL: {}s, budget: {}MB\n\n",
            config.ttl_seconds, config.max_cache_size_mb
        ));

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(
            ["Datasource", "Cached", "TTL", "Granularity", "Query type TTLs"]
                .into_iter()
                .map(|header| Cell::new(header).fg(Color::Green))
                .collect::<Vec<_>>(),
        );

        let mut rows = vec![("(default)".to_string(), config.settings_for("", None), String::new())];
        for (uid, overrides) in &config.datasources {
            let query_types = overrides
                .query_types
                .iter()
                .map(|(kind, ttl)| format!("{}={}s", kind, ttl))
                .collect::<Vec<_>>()
                .join(", ");
            rows.push((uid.clone(), config.settings_for(uid, None), query_types));
        }

        for (uid, settings, query_types) in rows {
            let cached = if settings.enabled {
                Cell::new("yes").fg(Color::Green)
            } else {
                Cell::new("no").fg(Color::Red)
            };
            table.add_row(vec![
                Cell::new(uid),
                cached,
                Cell::new(format!("{}s", settings.ttl.as_secs())),
                Cell::new(format!("{}ms", settings.time_granularity.as_millis())),
                Cell::new(query_types),
            ]);
        }

        output.push_str(&table.to_string());
        output.push('\n');
        output
    }

    pub fn format_replay(report: &ReplayReport, format: OutputFormat) -> String {
        match format {
            OutputFormat::Table => Self::format_replay_table(report),
            OutputFormat::Json => Self::format_replay_json(report),
        }
    }

    fn format_replay_table(report: &ReplayReport) -> String {
        if report.steps.is_empty() {
            return format!("{}\n", "Timeline has no steps".yellow());
        }

        let mut output = String::new();
        output.push_str(&format!("{}\n", "Replay Results".bold().green()));

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(
            ["Step", "At", "Datasource", "Fingerprint", "Outcome", "Value"]
                .into_iter()
                .map(|header| Cell::new(header).fg(Color::Green))
                .collect::<Vec<_>>(),
        );

        for step in &report.steps {
            let (outcome, value) = match (&step.outcome, &step.error) {
                (Some(outcome), _) => (
                    Self::outcome_cell(outcome),
                    step.value.as_ref().map(Self::preview).unwrap_or_default(),
                ),
                (None, Some(error)) => (Cell::new("error").fg(Color::Red), error.clone()),
                (None, None) => (Cell::new("-"), String::new()),
            };
            table.add_row(vec![
                Cell::new(step.step),
                Cell::new(format!("{}ms", step.at_ms)),
                Cell::new(&step.datasource_uid),
                Cell::new(step.fingerprint.as_deref().unwrap_or("-")),
                outcome,
                Cell::new(value),
            ]);
        }
        output.push_str(&table.to_string());
        output.push('\n');

        let stats = &report.stats;
        output.push_str(&format!("\n{}\n", "Statistics".bold()));
        output.push_str(&format!(
            "  Requests: {}  Hits: {}  Misses: {}  Coalesced: {}  Bypasses: {}\n",
            stats.requests, stats.hits, stats.misses, stats.coalesced, stats.bypasses
        ));
        output.push_str(&format!(
            "  Upstream calls: {} ({} failed)  Hit rate: {:.1}%\n",
            stats.upstream_calls,
            stats.upstream_failures,
            stats.hit_rate() * 100.0
        ));
        output.push_str(&format!(
            "  Cached: {} entries, {} bytes\n",
            report.cached_entries, report.cached_bytes
        ));
        output
    }

    fn format_replay_json(report: &ReplayReport) -> String {
        serde_json::to_string_pretty(report).unwrap_or_else(|_| {
            "{\"status\": \"error\", \"error\": \"Could not serialize report to JSON\"}".to_string()
        })
    }

    fn outcome_cell(outcome: &CacheOutcome) -> Cell {
        let color = match outcome {
            CacheOutcome::Hit => Color::Green,
            CacheOutcome::Miss => Color::Yellow,
            CacheOutcome::Coalesced => Color::Cyan,
            CacheOutcome::Bypass(_) => Color::DarkGrey,
        };
        Cell::new(outcome.to_string()).fg(color)
    }

    /// Compact rendering of a value, truncated for table cells
    fn preview(value: &Value) -> String {
        let rendered = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        if rendered.chars().count() > VALUE_PREVIEW_CHARS {
            let truncated: String = rendered.chars().take(VALUE_PREVIEW_CHARS).collect();
            format!("{}…", truncated)
        } else {
            rendered
        }
    }
}
