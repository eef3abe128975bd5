//! Typed environment readers
//!
//! Unset and empty variables fall back to the supplied default; present but
//! unparseable values are errors rather than silent defaults.

use crate::error::{Result, UpdaterError};
use std::str::FromStr;

/// Read `key`, returning `None` when it is unset or blank.
pub fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Read a required variable.
pub fn required(key: &str) -> Result<String> {
    var(key).ok_or_else(|| UpdaterError::MissingSetting(key.to_string()))
}

/// Read a string variable with a default.
pub fn string_or(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|| default.to_string())
}

/// Parse a variable with a default.
pub fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| UpdaterError::invalid(key, e)),
        None => Ok(default),
    }
}

/// Parse a boolean flag, accepting `true/false`, `1/0`, `yes/no` and `on/off`.
pub fn flag_or(key: &str, default: bool) -> Result<bool> {
    match var(key) {
        Some(raw) => parse_flag(&raw).ok_or_else(|| UpdaterError::invalid(key, raw)),
        None => Ok(default),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
