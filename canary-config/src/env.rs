//! Environment variable overrides
//!
//! `CANARY_*` variables override file and default values; unknown
//! variables are ignored.

use crate::schema::{CanaryConfig, ConfigError};

/// Apply `CANARY_*` overrides to a loaded configuration
pub fn apply_env_overrides(config: &mut CanaryConfig) -> Result<(), ConfigError> {
    if let Some(value) = read("CANARY_DEBUG") {
        config.debug = truthy(&value);
    }
    if let Some(value) = read("CANARY_WORKERS") {
        config.session.workers = Some(parse(&value, "CANARY_WORKERS")?);
    }
    if let Some(value) = read("CANARY_SESSION_TIMEOUT") {
        config.session.timeout = parse(&value, "CANARY_SESSION_TIMEOUT")?;
    }
    if let Some(value) = read("CANARY_TEST_TIMEOUT") {
        config.test.timeout = parse(&value, "CANARY_TEST_TIMEOUT")?;
    }
    if let Some(value) = read("CANARY_TIMEOUT_MULTIPLIER") {
        config.test.timeout_multiplier = parse(&value, "CANARY_TIMEOUT_MULTIPLIER")?;
    }
    if let Some(value) = read("CANARY_BATCH_SCHEDULER") {
        config.batch.scheduler = Some(value);
    }
    if let Some(value) = read("CANARY_BATCH_DURATION") {
        config.batch.duration = parse(&value, "CANARY_BATCH_DURATION")?;
        config.batch.scheme = Some("duration".to_string());
    }
    if let Some(value) = read("CANARY_BATCH_COUNT") {
        config.batch.count = Some(parse(&value, "CANARY_BATCH_COUNT")?);
        config.batch.scheme = Some("count".to_string());
    }
    Ok(())
}

fn read(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn truthy(value: &str) -> bool {
    !matches!(value.to_lowercase().as_str(), "0" | "off" | "false" | "no")
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        reason: format!("cannot parse {:?}", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthy_values() {
        assert!(truthy("1"));
        assert!(truthy("on"));
        assert!(!truthy("0"));
        assert!(!truthy("off"));
        assert!(!truthy("False"));
    }
}
