//! Engine configuration. Each tunable has a documented default and can be
//! overridden from the environment: one `std::env::var` per field with a
//! parsed fallback, not a config-file framework.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Requests per minute per upstream credential.
    pub rpm_per_key: u32,
    /// Global in-flight cap.
    pub max_concurrent: usize,
    /// Credential rotations attempted per request after the initial one.
    pub max_rotations: u32,
    /// Delay between same-credential transient retries.
    pub retry_backoff: Duration,
    /// Terminal-record retention before GC.
    pub result_ttl: Duration,
    /// Synchronous wait timeout for unary operations.
    pub wait_timeout_unary: Duration,
    /// Synchronous wait timeout for streaming operations.
    pub wait_timeout_stream: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rpm_per_key: 15,
            max_concurrent: 25,
            max_rotations: 2,
            retry_backoff: Duration::from_secs(3),
            result_ttl: Duration::from_secs(3600),
            wait_timeout_unary: Duration::from_secs(120),
            wait_timeout_stream: Duration::from_secs(180),
        }
    }
}

impl EngineConfig {
    /// Load from the environment, falling back to the documented default
    /// for any variable that is unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            rpm_per_key: env_parse("ENGINE_RPM_PER_KEY", defaults.rpm_per_key),
            max_concurrent: env_parse("ENGINE_MAX_CONCURRENT", defaults.max_concurrent),
            max_rotations: env_parse("ENGINE_MAX_ROTATIONS", defaults.max_rotations),
            retry_backoff: env_parse_secs("ENGINE_RETRY_BACKOFF_S", defaults.retry_backoff),
            result_ttl: env_parse_secs("ENGINE_RESULT_TTL_S", defaults.result_ttl),
            wait_timeout_unary: env_parse_secs(
                "ENGINE_WAIT_TIMEOUT_UNARY_S",
                defaults.wait_timeout_unary,
            ),
            wait_timeout_stream: env_parse_secs(
                "ENGINE_WAIT_TIMEOUT_STREAM_S",
                defaults.wait_timeout_stream,
            ),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_parse_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.rpm_per_key, 15);
        assert_eq!(cfg.max_concurrent, 25);
        assert_eq!(cfg.max_rotations, 2);
        assert_eq!(cfg.retry_backoff, Duration::from_secs(3));
        assert_eq!(cfg.result_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.wait_timeout_unary, Duration::from_secs(120));
        assert_eq!(cfg.wait_timeout_stream, Duration::from_secs(180));
    }
}
