//! Configuration loaded from the environment.
//!
//! Call `dotenvy::dotenv()` first if a `.env` file should be honoured.

use std::str::FromStr;

use crate::error::ConfigError;
use crate::pairing::RetryConfig;

/// Default SCAN page-size hint, matching the store's own default.
const DEFAULT_SCAN_COUNT: usize = 10;

/// Port assumed when `REDIS_URL` is a bare host name.
const DEFAULT_REDIS_PORT: u16 = 6379;

/// Which store implementation backs the session cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Redis,
}

impl FromStr for CacheBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::InvalidValue {
                key: "PAIRING_CACHE_BACKEND".to_string(),
                message: format!("unknown backend '{other}', expected 'memory' or 'redis'"),
            }),
        }
    }
}

impl Default for CacheBackend {
    fn default() -> Self {
        if cfg!(feature = "redis") {
            Self::Redis
        } else {
            Self::Memory
        }
    }
}

/// Store connection settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    /// Normalised `redis://` URL, required for [`CacheBackend::Redis`].
    pub redis_url: Option<String>,
    /// Page-size hint for cursor scans.
    pub scan_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            redis_url: None,
            scan_count: DEFAULT_SCAN_COUNT,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub cache: CacheConfig,
    pub retry: RetryConfig,
}

impl Config {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match lookup("PAIRING_CACHE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => CacheBackend::default(),
        };

        let redis_url = lookup("REDIS_URL").map(|raw| normalize_redis_url(&raw));
        if backend == CacheBackend::Redis && redis_url.is_none() {
            return Err(ConfigError::MissingEnvVar("REDIS_URL".to_string()));
        }

        let scan_count = parse_or(&lookup, "PAIRING_SCAN_COUNT", DEFAULT_SCAN_COUNT)?;
        if scan_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PAIRING_SCAN_COUNT".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_retries: parse_or(&lookup, "PAIRING_RETRY_MAX", defaults.max_retries)?,
            base_delay_ms: parse_or(&lookup, "PAIRING_RETRY_BASE_MS", defaults.base_delay_ms)?,
            max_delay_ms: parse_or(&lookup, "PAIRING_RETRY_MAX_MS", defaults.max_delay_ms)?,
            ..defaults
        };
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "PAIRING_RETRY_BASE_MS".to_string(),
                message: format!(
                    "base delay {}ms exceeds max delay {}ms",
                    retry.base_delay_ms, retry.max_delay_ms
                ),
            });
        }

        Ok(Self {
            cache: CacheConfig {
                backend,
                redis_url,
                scan_count,
            },
            retry,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(default),
    }
}

/// Accept either a full URL or a bare host name.
fn normalize_redis_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.contains("://") {
        raw.to_string()
    } else if raw.contains(':') {
        format!("redis://{raw}/")
    } else {
        format!("redis://{raw}:{DEFAULT_REDIS_PORT}/")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_memory_backend_needs_nothing_else() {
        let config = Config::from_lookup(lookup(&[("PAIRING_CACHE_BACKEND", "memory")])).unwrap();
        assert_eq!(config.cache.backend, CacheBackend::Memory);
        assert_eq!(config.cache.scan_count, DEFAULT_SCAN_COUNT);
        assert_eq!(config.retry.max_retries, RetryConfig::default().max_retries);
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let err = Config::from_lookup(lookup(&[("PAIRING_CACHE_BACKEND", "redis")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "REDIS_URL"));
    }

    #[test]
    fn test_bare_redis_host_is_normalised() {
        let config = Config::from_lookup(lookup(&[
            ("PAIRING_CACHE_BACKEND", "Redis"),
            ("REDIS_URL", "cache.internal"),
        ]))
        .unwrap();
        assert_eq!(
            config.cache.redis_url.as_deref(),
            Some("redis://cache.internal:6379/")
        );
    }

    #[test]
    fn test_full_redis_url_kept() {
        assert_eq!(
            normalize_redis_url("rediss://user:pw@host:6380/2"),
            "rediss://user:pw@host:6380/2"
        );
        assert_eq!(normalize_redis_url("host:7000"), "redis://host:7000/");
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let err = Config::from_lookup(lookup(&[("PAIRING_CACHE_BACKEND", "dynamo")])).unwrap_err();
        assert!(err.to_string().contains("dynamo"));
    }

    #[test]
    fn test_zero_scan_count_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("PAIRING_CACHE_BACKEND", "memory"),
            ("PAIRING_SCAN_COUNT", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "PAIRING_SCAN_COUNT"));
    }

    #[test]
    fn test_retry_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("PAIRING_CACHE_BACKEND", "memory"),
            ("PAIRING_RETRY_MAX", "7"),
            ("PAIRING_RETRY_BASE_MS", "5"),
            ("PAIRING_RETRY_MAX_MS", "50"),
        ]))
        .unwrap();
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.base_delay_ms, 5);
        assert_eq!(config.retry.max_delay_ms, 50);
    }

    #[test]
    fn test_non_numeric_retry_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("PAIRING_CACHE_BACKEND", "memory"),
            ("PAIRING_RETRY_MAX", "lots"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("PAIRING_RETRY_MAX"));
    }

    #[test]
    fn test_base_above_max_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("PAIRING_CACHE_BACKEND", "memory"),
            ("PAIRING_RETRY_BASE_MS", "900"),
            ("PAIRING_RETRY_MAX_MS", "100"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
