//! Configuration management for plan-race
//!
//! Configuration is loaded from environment variables with conservative
//! defaults; the binary lets command-line flags override individual values.
//! Unparsable numbers fall back to their defaults, an unknown slot mode is a
//! hard error (silently running the wrong cache would invert the verdict).

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::{BoundParameter, CacheKey, SlotMode};

/// Reference parameters: the offset-20 caller is released first.
pub const DEFAULT_PARAM_A: u64 = 20;
pub const DEFAULT_PARAM_B: u64 = 0;
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_BARRIER_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 10_000;

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Default,
    ProcessEnv,
    CliArg,
}

/// Harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Which cache implementation to run against.
    pub mode: SlotMode,
    /// One parameter per workload, in worker-id order.
    pub params: Vec<BoundParameter>,
    /// The single key every workload shares.
    pub key: CacheKey,
    /// Upper bound for any single barrier wait.
    pub barrier_timeout: Duration,
    /// Upper bound for collecting every outcome once the run started.
    pub run_timeout: Duration,
    /// When set, the build-lock holder waits until the next workload is
    /// observed blocking on the lock before it builds.
    pub contention_handshake: bool,
    /// Provenance per field, for `plan-race config`.
    pub sources: HashMap<&'static str, ConfigSource>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mode: SlotMode::Defective,
            params: vec![
                BoundParameter(DEFAULT_PARAM_A),
                BoundParameter(DEFAULT_PARAM_B),
            ],
            key: CacheKey::select_by_predicate(DEFAULT_PAGE_SIZE),
            barrier_timeout: Duration::from_millis(DEFAULT_BARRIER_TIMEOUT_MS),
            run_timeout: Duration::from_millis(DEFAULT_RUN_TIMEOUT_MS),
            contention_handshake: true,
            sources: HashMap::new(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from the process environment.
    ///
    /// Recognised variables:
    /// - `PLAN_RACE_MODE` (`defective` | `corrected`)
    /// - `PLAN_RACE_PARAMS` (comma separated offsets, overrides A/B)
    /// - `PLAN_RACE_PARAM_A`, `PLAN_RACE_PARAM_B`
    /// - `PLAN_RACE_KEY`, `PLAN_RACE_PAGE_SIZE`
    /// - `PLAN_RACE_BARRIER_TIMEOUT_MS`, `PLAN_RACE_RUN_TIMEOUT_MS`
    /// - `PLAN_RACE_CONTENTION_HANDSHAKE` (bool)
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = env_value("PLAN_RACE_MODE") {
            config.mode = raw.parse()?;
            config.sources.insert("mode", ConfigSource::ProcessEnv);
        }

        if let Some(raw) = env_value("PLAN_RACE_PARAMS") {
            config.params = parse_params(&raw)?;
            config.sources.insert("params", ConfigSource::ProcessEnv);
        } else {
            let a = env_u64("PLAN_RACE_PARAM_A", DEFAULT_PARAM_A);
            let b = env_u64("PLAN_RACE_PARAM_B", DEFAULT_PARAM_B);
            config.params = vec![BoundParameter(a), BoundParameter(b)];
            if env_value("PLAN_RACE_PARAM_A").is_some() || env_value("PLAN_RACE_PARAM_B").is_some()
            {
                config.sources.insert("params", ConfigSource::ProcessEnv);
            }
        }

        let page_size = env_u32("PLAN_RACE_PAGE_SIZE", DEFAULT_PAGE_SIZE);
        config.key = CacheKey::select_by_predicate(page_size);
        if let Some(name) = env_value("PLAN_RACE_KEY").filter(|v| !v.trim().is_empty()) {
            config.key = config.key.renamed(name.trim());
            config.sources.insert("key", ConfigSource::ProcessEnv);
        }

        config.barrier_timeout = Duration::from_millis(env_u64(
            "PLAN_RACE_BARRIER_TIMEOUT_MS",
            DEFAULT_BARRIER_TIMEOUT_MS,
        ));
        config.run_timeout = Duration::from_millis(env_u64(
            "PLAN_RACE_RUN_TIMEOUT_MS",
            DEFAULT_RUN_TIMEOUT_MS,
        ));
        config.contention_handshake = env_bool("PLAN_RACE_CONTENTION_HANDSHAKE", true);

        for (field, key) in [
            ("barrier_timeout", "PLAN_RACE_BARRIER_TIMEOUT_MS"),
            ("run_timeout", "PLAN_RACE_RUN_TIMEOUT_MS"),
            ("contention_handshake", "PLAN_RACE_CONTENTION_HANDSHAKE"),
            ("page_size", "PLAN_RACE_PAGE_SIZE"),
        ] {
            if env_value(key).is_some() {
                config.sources.insert(field, ConfigSource::ProcessEnv);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<()> {
        if self.params.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one workload parameter is required".to_string(),
            ));
        }
        if u32::try_from(self.params.len()).is_err() {
            return Err(Error::InvalidArgument(format!(
                "too many workloads: {}",
                self.params.len()
            )));
        }
        if self.barrier_timeout.is_zero() || self.run_timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.key.page_size == 0 {
            return Err(Error::InvalidArgument(
                "page size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Provenance of a field (defaults when never overridden).
    #[must_use]
    pub fn source(&self, field: &str) -> ConfigSource {
        self.sources
            .get(field)
            .copied()
            .unwrap_or(ConfigSource::Default)
    }

    /// Record a command-line override.
    pub fn set_cli_source(&mut self, field: &'static str) {
        self.sources.insert(field, ConfigSource::CliArg);
    }

    /// Human-readable `name = value (source)` lines.
    #[must_use]
    pub fn summary_lines(&self) -> Vec<String> {
        let params = self
            .params
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let rows: [(&str, String); 7] = [
            ("mode", self.mode.to_string()),
            ("params", params),
            ("key", self.key.to_string()),
            ("page_size", self.key.page_size.to_string()),
            (
                "barrier_timeout",
                format!("{}ms", self.barrier_timeout.as_millis()),
            ),
            ("run_timeout", format!("{}ms", self.run_timeout.as_millis())),
            (
                "contention_handshake",
                self.contention_handshake.to_string(),
            ),
        ];
        rows.iter()
            .map(|(name, value)| format!("{name:<22} = {value} ({:?})", self.source(name)))
            .collect()
    }
}

/// Parse a comma separated offset list such as `20,0`.
pub fn parse_params(raw: &str) -> Result<Vec<BoundParameter>> {
    let params = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<BoundParameter>>>()?;
    if params.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "no offsets in parameter list {raw:?}"
        )));
    }
    Ok(params)
}

// Helper functions for environment variable parsing

#[cfg(test)]
thread_local! {
    static TEST_ENV_OVERRIDES: std::cell::RefCell<HashMap<String, String>> =
        std::cell::RefCell::new(HashMap::new());
}

#[cfg(test)]
fn test_env_override_value(key: &str) -> Option<String> {
    TEST_ENV_OVERRIDES.with(|cell| cell.borrow().get(key).cloned())
}

/// Read a value from the environment.
#[must_use]
pub fn env_value(key: &str) -> Option<String> {
    #[cfg(test)]
    if let Some(v) = test_env_override_value(key) {
        return Some(v);
    }
    env::var(key).ok()
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" => true,
        "0" | "false" | "f" | "no" | "n" => false,
        _ => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env_value(key).map_or(default, |v| parse_bool(&v, default))
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_value(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_value(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_env<R>(pairs: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        TEST_ENV_OVERRIDES.with(|cell| {
            let mut map = cell.borrow_mut();
            map.clear();
            for (k, v) in pairs {
                map.insert((*k).to_string(), (*v).to_string());
            }
        });
        let out = f();
        TEST_ENV_OVERRIDES.with(|cell| cell.borrow_mut().clear());
        out
    }

    #[test]
    fn defaults_match_reference_reproduction() {
        let config = with_env(&[], HarnessConfig::from_env).unwrap();
        assert_eq!(config.mode, SlotMode::Defective);
        assert_eq!(config.params, vec![BoundParameter(20), BoundParameter(0)]);
        assert_eq!(config.key.name, CacheKey::SELECT_BY_PREDICATE);
        assert_eq!(config.key.page_size, 20);
        assert!(config.contention_handshake);
        assert_eq!(config.source("mode"), ConfigSource::Default);
    }

    #[test]
    fn env_overrides_are_applied_and_attributed() {
        let config = with_env(
            &[
                ("PLAN_RACE_MODE", "corrected"),
                ("PLAN_RACE_PARAM_A", "40"),
                ("PLAN_RACE_BARRIER_TIMEOUT_MS", "150"),
                ("PLAN_RACE_CONTENTION_HANDSHAKE", "no"),
                ("PLAN_RACE_KEY", "select-by-name"),
            ],
            HarnessConfig::from_env,
        )
        .unwrap();
        assert_eq!(config.mode, SlotMode::Corrected);
        assert_eq!(config.params, vec![BoundParameter(40), BoundParameter(0)]);
        assert_eq!(config.barrier_timeout, Duration::from_millis(150));
        assert!(!config.contention_handshake);
        assert_eq!(config.key.name, "select-by-name");
        assert_eq!(config.source("mode"), ConfigSource::ProcessEnv);
        assert_eq!(config.source("params"), ConfigSource::ProcessEnv);
        assert_eq!(config.source("run_timeout"), ConfigSource::Default);
    }

    #[test]
    fn params_list_overrides_pair() {
        let config = with_env(
            &[
                ("PLAN_RACE_PARAMS", "30, 20 ,0"),
                ("PLAN_RACE_PARAM_A", "99"),
            ],
            HarnessConfig::from_env,
        )
        .unwrap();
        assert_eq!(
            config.params,
            vec![BoundParameter(30), BoundParameter(20), BoundParameter(0)]
        );
    }

    #[test]
    fn bad_numbers_fall_back_to_defaults() {
        let config = with_env(
            &[
                ("PLAN_RACE_PARAM_B", "zero"),
                ("PLAN_RACE_RUN_TIMEOUT_MS", "soon"),
            ],
            HarnessConfig::from_env,
        )
        .unwrap();
        assert_eq!(config.params[1], BoundParameter(DEFAULT_PARAM_B));
        assert_eq!(
            config.run_timeout,
            Duration::from_millis(DEFAULT_RUN_TIMEOUT_MS)
        );
    }

    #[test]
    fn bad_mode_is_rejected() {
        let err = with_env(&[("PLAN_RACE_MODE", "lucky")], HarnessConfig::from_env).unwrap_err();
        assert_eq!(err.error_type(), "INVALID_ARGUMENT");
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let err = with_env(
            &[("PLAN_RACE_BARRIER_TIMEOUT_MS", "0")],
            HarnessConfig::from_env,
        )
        .unwrap_err();
        assert!(err.to_string().contains("timeouts"));
    }

    #[test]
    fn parse_params_rejects_garbage() {
        assert!(parse_params("").is_err());
        assert!(parse_params("20,x").is_err());
        assert_eq!(parse_params("5").unwrap(), vec![BoundParameter(5)]);
    }

    #[test]
    fn parse_bool_variants() {
        assert!(parse_bool("YES", false));
        assert!(!parse_bool("f", true));
        assert!(parse_bool("maybe", true));
    }

    #[test]
    fn summary_lines_cover_every_field() {
        let mut config = HarnessConfig::default();
        config.set_cli_source("mode");
        let lines = config.summary_lines();
        assert_eq!(lines.len(), 7);
        assert!(lines[0].starts_with("mode"));
        assert!(lines[0].contains("CliArg"));
        assert!(lines[1].contains("20,0"));
    }
}
