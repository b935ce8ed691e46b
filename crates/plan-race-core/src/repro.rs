//! Reproduction context capture.
//!
//! Every harness run records a [`ReproContext`] that can be serialized to
//! JSON and embedded in reports, so a failing verdict can be replayed with
//! the exact mode, parameters and timeouts that produced it:
//!
//! ```bash
//! PLAN_RACE_MODE=defective PLAN_RACE_PARAMS=20,0 cargo run -p plan-race -- reproduce
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::HarnessConfig;
use crate::models::{BoundParameter, CacheKey, SlotMode, WorkerId};

/// Captures all parameters needed to reproduce a harness run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReproContext {
    pub mode: SlotMode,
    pub params: Vec<BoundParameter>,
    pub key: CacheKey,
    pub barrier_timeout_ms: u64,
    pub run_timeout_ms: u64,
    pub contention_handshake: bool,
    /// Workers in the order the sequencer lets them at the build lock.
    pub release_order: Vec<WorkerId>,
    /// ISO-8601 wall-clock time when the run started.
    pub created_at: String,
    /// Extra key-value pairs for suite-specific parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<(String, String)>,
}

impl ReproContext {
    #[must_use]
    pub fn from_config(config: &HarnessConfig, release_order: Vec<WorkerId>) -> Self {
        Self {
            mode: config.mode,
            params: config.params.clone(),
            key: config.key.clone(),
            barrier_timeout_ms: u64::try_from(config.barrier_timeout.as_millis())
                .unwrap_or(u64::MAX),
            run_timeout_ms: u64::try_from(config.run_timeout.as_millis()).unwrap_or(u64::MAX),
            contention_handshake: config.contention_handshake,
            release_order,
            created_at: chrono::Utc::now().to_rfc3339(),
            extra: Vec::new(),
        }
    }

    /// Add an extra key-value pair.
    pub fn add_extra(&mut self, key: &str, value: &str) {
        self.extra.push((key.to_owned(), value.to_owned()));
    }

    /// Format a single-line reproduction command.
    #[must_use]
    pub fn repro_command(&self) -> String {
        let params = self
            .params
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut parts = vec![
            format!("PLAN_RACE_MODE={}", self.mode),
            format!("PLAN_RACE_PARAMS={params}"),
            format!("PLAN_RACE_KEY={}", shell_quote(&self.key.name)),
            format!("PLAN_RACE_PAGE_SIZE={}", self.key.page_size),
            format!("PLAN_RACE_BARRIER_TIMEOUT_MS={}", self.barrier_timeout_ms),
            format!("PLAN_RACE_RUN_TIMEOUT_MS={}", self.run_timeout_ms),
        ];
        if !self.contention_handshake {
            parts.push("PLAN_RACE_CONTENTION_HANDSHAKE=0".to_string());
        }
        for (k, v) in &self.extra {
            parts.push(format!("{k}={}", shell_quote(v)));
        }
        parts.push("cargo run -p plan-race -- reproduce".to_string());
        parts.join(" ")
    }
}

fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ',' | '=' | ':'));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

/// Write a JSON artifact file and log its path.
///
/// # Errors
/// Returns `Err` on serialization or I/O failure.
pub fn write_artifact(
    dir: &Path,
    filename: &str,
    value: &impl Serialize,
) -> crate::Result<std::path::PathBuf> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::create_dir_all(dir)?;
    let path = dir.join(filename);
    std::fs::write(&path, json)?;
    tracing::info!(path = %path.display(), "wrote artifact");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repro_command_carries_every_knob() {
        let mut config = HarnessConfig::default();
        config.contention_handshake = false;
        let mut ctx = ReproContext::from_config(&config, vec![WorkerId(0), WorkerId(1)]);
        ctx.add_extra("RUST_LOG", "debug");
        let cmd = ctx.repro_command();
        assert!(cmd.contains("PLAN_RACE_MODE=defective"));
        assert!(cmd.contains("PLAN_RACE_PARAMS=20,0"));
        assert!(cmd.contains("PLAN_RACE_CONTENTION_HANDSHAKE=0"));
        assert!(cmd.contains("PLAN_RACE_KEY=select-by-predicate"));
        assert!(cmd.contains("PLAN_RACE_BARRIER_TIMEOUT_MS=2000"));
        assert!(cmd.contains("PLAN_RACE_RUN_TIMEOUT_MS=10000"));
        assert!(cmd.contains("RUST_LOG=debug"));
        assert!(cmd.ends_with("cargo run -p plan-race -- reproduce"));
    }

    #[test]
    fn repro_command_quotes_values_with_spaces() {
        let mut config = HarnessConfig::default();
        config.key = CacheKey::select_by_predicate(20).renamed("by name");
        let mut ctx = ReproContext::from_config(&config, vec![WorkerId(0)]);
        ctx.add_extra("RUST_LOG", "plan_race=debug,info");
        let cmd = ctx.repro_command();
        assert!(cmd.contains("PLAN_RACE_KEY='by name'"), "{cmd}");
        assert!(cmd.contains("RUST_LOG=plan_race=debug,info"), "{cmd}");
    }

    #[test]
    fn write_and_read_repro_artifact() {
        let ctx = ReproContext::from_config(&HarnessConfig::default(), vec![WorkerId(0)]);
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(&dir.path().join("nested"), "repro.json", &ctx).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let back: ReproContext = serde_json::from_str(&content).unwrap();
        assert_eq!(back.params, ctx.params);
        assert_eq!(back.release_order, vec![WorkerId(0)]);
        assert_eq!(back.mode, SlotMode::Defective);
    }
}
