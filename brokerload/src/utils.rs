//! Utility functions for brokerload
//!
//! Helpers for parsing and formatting human-readable durations and byte
//! counts, and for generating random filler text.

use anyhow::{anyhow, Result};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::time::Duration;

/// Formats a byte count into a human-readable string (KB, MB, GB, etc.)
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Parses a duration string such as "2m", "5s", "1m30s", "250ms" or "1.5h"
///
/// The string is a sequence of decimal numbers, each followed by a unit
/// (`ns`, `us`, `ms`, `s`, `m`, `h`). A bare "0" is accepted.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow!("Empty duration"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_secs = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        // Find where the numeric part ends
        let numeric_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let (num_str, after) = rest.split_at(numeric_end);
        let num: f64 = num_str
            .parse()
            .map_err(|_| anyhow!("Invalid number in duration: {}", s))?;

        let unit_end = after
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after.len());
        let (unit, next) = after.split_at(unit_end);

        let scale = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(anyhow!("Missing unit in duration: {}", s)),
            _ => return Err(anyhow!("Unknown unit in duration: {}", unit)),
        };
        total_secs += num * scale;
        rest = next;
    }

    Duration::try_from_secs_f64(total_secs).map_err(|_| anyhow!("Duration out of range: {}", s))
}

/// Random alphanumeric string of exactly `len` characters
pub fn random_alphanumeric(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
