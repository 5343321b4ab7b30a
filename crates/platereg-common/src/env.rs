//! Typed access to environment variables
//!
//! Unset variables fall back to the supplied default. Set-but-unparseable
//! variables are reported as errors instead of being silently ignored, so a
//! typo in a deployment manifest fails the process at startup.

use anyhow::{anyhow, Result};
use std::str::FromStr;

/// Read `key`, returning `None` when unset or empty.
pub fn var_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read and parse `key`, or return `default` when unset.
pub fn var_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var_opt(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow!("Invalid value for {}: {:?} ({})", key, raw, e)),
        None => Ok(default),
    }
}

/// Read a boolean flag. Accepts `true/false`, `1/0`, `yes/no`, `on/off`.
pub fn flag_or(key: &str, default: bool) -> Result<bool> {
    match var_opt(key) {
        Some(raw) => parse_flag(&raw).ok_or_else(|| anyhow!("Invalid boolean for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("YES"), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    #[serial]
    fn test_var_or_falls_back_when_unset() {
        std::env::remove_var("PLATEREG_TEST_NUMBER");
        assert_eq!(var_or("PLATEREG_TEST_NUMBER", 42u32).unwrap(), 42);
    }

    #[test]
    #[serial]
    fn test_var_or_rejects_garbage() {
        std::env::set_var("PLATEREG_TEST_NUMBER", "forty-two");
        let err = var_or("PLATEREG_TEST_NUMBER", 42u32).unwrap_err();
        assert!(err.to_string().contains("PLATEREG_TEST_NUMBER"));
        std::env::remove_var("PLATEREG_TEST_NUMBER");
    }

    #[test]
    #[serial]
    fn test_blank_value_counts_as_unset() {
        std::env::set_var("PLATEREG_TEST_FLAG", "   ");
        assert!(var_opt("PLATEREG_TEST_FLAG").is_none());
        assert!(flag_or("PLATEREG_TEST_FLAG", true).unwrap());
        std::env::remove_var("PLATEREG_TEST_FLAG");
    }
}
