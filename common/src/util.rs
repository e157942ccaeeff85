use log::LevelFilter;
use serde::{Deserialize, Serialize};

/// Splits a comma-separated list, trimming entries and dropping empty ones.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Accepts the usual spellings of a boolean flag in an environment variable.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" | "t" => Some(true),
        "0" | "false" | "no" | "off" | "n" | "f" | "" => Some(false),
        _ => None,
    }
}

#[derive(Serialize, Deserialize)]
#[serde(remote = "LevelFilter")]
pub enum SerdeLevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}
