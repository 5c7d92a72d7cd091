//! Configuration - environment-driven settings with free-tier defaults

use std::fmt::Display;
use std::str::FromStr;

use serde::Serialize;

use crate::error::Error;
use crate::Result;

/// Runtime configuration, read from the environment.
///
/// Defaults match the Gemini free-tier budget (60 requests/minute,
/// 1500/day) and keep research bundles well under the model's input size.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Gemini API key. Empty is tolerated at startup; completion calls
    /// will then come back as backend rejections.
    #[serde(skip_serializing)]
    pub gemini_api_key: String,

    /// Model identifier sent to the completion backend.
    pub model: String,

    /// Per-minute request budget.
    pub rpm_limit: u32,

    /// Per-day request budget.
    pub daily_limit: u32,

    /// Upper bound on deduplicated search results per research step.
    pub max_search_results: usize,

    /// Byte budget for one research bundle.
    pub max_context_bytes: usize,

    /// Byte budget for the assembled completion payload.
    pub max_input_bytes: usize,

    /// Longest a caller will wait on an exhausted quota window.
    pub max_quota_wait_ms: u64,
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            model: default_model(),
            rpm_limit: 60,
            daily_limit: 1500,
            max_search_results: 10,
            max_context_bytes: 16_384,
            max_input_bytes: 49_152,
            max_quota_wait_ms: 300_000,
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        Ok(Self {
            gemini_api_key: std::env::var("GEMINI_API_KEY").unwrap_or_default(),
            model: std::env::var("UVZ_MODEL").unwrap_or(defaults.model),
            rpm_limit: env_parse("UVZ_RPM_LIMIT", defaults.rpm_limit)?,
            daily_limit: env_parse("UVZ_DAILY_LIMIT", defaults.daily_limit)?,
            max_search_results: env_parse("UVZ_MAX_SEARCH_RESULTS", defaults.max_search_results)?,
            max_context_bytes: env_parse("UVZ_MAX_CONTEXT_BYTES", defaults.max_context_bytes)?,
            max_input_bytes: env_parse("UVZ_MAX_INPUT_BYTES", defaults.max_input_bytes)?,
            max_quota_wait_ms: env_parse("UVZ_MAX_QUOTA_WAIT_MS", defaults.max_quota_wait_ms)?,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {key}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.model, "gemini-2.0-flash");
        assert_eq!(config.rpm_limit, 60);
        assert_eq!(config.daily_limit, 1500);
        assert_eq!(config.max_search_results, 10);
    }

    #[test]
    fn test_env_parse_falls_back_to_default() {
        let value: u32 = env_parse("UVZ_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        std::env::set_var("UVZ_TEST_GARBAGE_LIMIT", "not-a-number");
        let result: Result<u32> = env_parse("UVZ_TEST_GARBAGE_LIMIT", 1);
        assert!(matches!(result, Err(Error::Config(_))));
        std::env::remove_var("UVZ_TEST_GARBAGE_LIMIT");
    }

    #[test]
    fn test_config_serialization_masks_key() {
        let config = Config {
            gemini_api_key: "secret".to_string(),
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("gemini-2.0-flash"));
    }
}
