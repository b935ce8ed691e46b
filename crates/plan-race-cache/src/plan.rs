//! Plans, plan builders, and finalized commands.
//!
//! A [`CachedPlan`] holds a command template whose offset position is a `?`
//! placeholder. Finalizing substitutes the caller's offset. A plan that has
//! been *baked* carries an offset literal instead of the placeholder; only
//! the defective recheck path produces those.

use std::fmt;
use std::sync::Arc;

use plan_race_core::{BoundParameter, CacheKey, WorkerId};
use serde::Serialize;
use thiserror::Error;

/// Text substituted for a placeholder that has no binding.
const UNBOUND: &str = "null";

// =============================================================================
// CachedPlan
// =============================================================================

/// The shared, lazily built artifact for one [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPlan {
    key: CacheKey,
    template: String,
    baked_offset: Option<BoundParameter>,
}

impl CachedPlan {
    #[must_use]
    pub fn new(key: CacheKey, template: impl Into<String>) -> Self {
        Self {
            key,
            template: template.into(),
            baked_offset: None,
        }
    }

    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    /// The offset literal this plan carries, if any. A correct cache never
    /// hands out a plan where this is `Some`.
    #[must_use]
    pub const fn baked_offset(&self) -> Option<BoundParameter> {
        self.baked_offset
    }

    #[must_use]
    pub fn placeholder_count(&self) -> usize {
        self.template.matches('?').count()
    }

    /// Substitute `offset` for the first placeholder. Any further
    /// placeholders have nothing to bind and render as `null`, the way a
    /// driver renders a missing binding.
    #[must_use]
    pub fn finalize(&self, offset: BoundParameter) -> String {
        let mut out = String::with_capacity(self.template.len() + 8);
        let mut bound = false;
        for ch in self.template.chars() {
            if ch == '?' {
                if bound {
                    out.push_str(UNBOUND);
                } else {
                    out.push_str(&offset.to_string());
                    bound = true;
                }
            } else {
                out.push(ch);
            }
        }
        out
    }

    /// Copy of this plan with `offset` written into the template as a
    /// literal.
    #[must_use]
    pub fn bake(&self, offset: BoundParameter) -> Self {
        Self {
            key: self.key.clone(),
            template: self.template.replacen('?', &offset.to_string(), 1),
            baked_offset: Some(offset),
        }
    }
}

// =============================================================================
// Builders
// =============================================================================

/// Error raised by a [`PlanBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("plan builder rejected {key}: {reason}")]
    Rejected { key: String, reason: String },

    #[error("{0}")]
    Panicked(String),
}

/// Opaque collaborator that turns a key into a plan.
///
/// The parameter is passed because real builders receive the full
/// execution context; a well-behaved builder must not let it leak into the
/// template.
pub trait PlanBuilder: Send + Sync {
    fn build(&self, key: &CacheKey, param: BoundParameter) -> Result<CachedPlan, BuildError>;
}

impl<F> PlanBuilder for F
where
    F: Fn(&CacheKey, BoundParameter) -> Result<CachedPlan, BuildError> + Send + Sync,
{
    fn build(&self, key: &CacheKey, param: BoundParameter) -> Result<CachedPlan, BuildError> {
        self(key, param)
    }
}

/// Builds `select .. from person p where .. order by .. limit ?, <page>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplatePlanBuilder;

impl PlanBuilder for TemplatePlanBuilder {
    fn build(&self, key: &CacheKey, param: BoundParameter) -> Result<CachedPlan, BuildError> {
        if key.projection.trim().is_empty() {
            return Err(BuildError::Rejected {
                key: key.to_string(),
                reason: "empty projection".to_string(),
            });
        }
        tracing::debug!(key = %key, offset = %param, "building plan");
        let template = format!(
            "select {} from person p where {} order by {} limit ?, {}",
            key.projection, key.predicate, key.order_by, key.page_size
        );
        Ok(CachedPlan::new(key.clone(), template))
    }
}

// =============================================================================
// Slot results
// =============================================================================

/// Which branch of the slot produced a [`BoundPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPath {
    /// Unlocked existence check found the plan.
    FastHit,
    /// This caller built and published the plan under the lock.
    Built,
    /// The plan was already present when the caller rechecked under the lock.
    RecheckHit,
}

impl SlotPath {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FastHit => "fast_hit",
            Self::Built => "built",
            Self::RecheckHit => "recheck_hit",
        }
    }
}

impl fmt::Display for SlotPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a slot hands back to a caller.
#[derive(Debug, Clone)]
pub struct BoundPlan {
    /// The plan the command was finalized from.
    pub plan: Arc<CachedPlan>,
    /// The finalized command text.
    pub command: String,
    pub path: SlotPath,
    /// Whether the caller found the build lock held and had to block.
    pub contended: bool,
    /// Worker whose call built the cache entry.
    pub built_by: WorkerId,
}

// =============================================================================
// Command inspection
// =============================================================================

/// Why a finalized command could not be executed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("generated command has no limit clause")]
    MissingLimit,

    #[error("unbound placeholder in generated command near '{0}'")]
    UnboundPlaceholder(String),

    #[error("syntax error in generated command near '{0}'")]
    Syntax(String),
}

/// Read the offset a finalized command actually carries.
///
/// Accepts `limit <offset>, <count>` and `limit <count>` (offset 0).
pub fn parse_limit_offset(command: &str) -> Result<BoundParameter, CommandError> {
    let idx = command.rfind(" limit ").ok_or(CommandError::MissingLimit)?;
    let clause = command[idx + " limit ".len()..].trim();
    if clause.contains('?') {
        return Err(CommandError::UnboundPlaceholder(clause.to_string()));
    }
    let syntax = || CommandError::Syntax(clause.to_string());

    let mut parts = clause.split(',').map(str::trim);
    let first = parts.next().filter(|s| !s.is_empty()).ok_or_else(syntax)?;
    let second = parts.next();
    if parts.next().is_some() {
        return Err(syntax());
    }

    match second {
        Some(count) => {
            count.parse::<u64>().map_err(|_| syntax())?;
            first.parse::<u64>().map(BoundParameter).map_err(|_| syntax())
        }
        None => {
            first.parse::<u64>().map_err(|_| syntax())?;
            Ok(BoundParameter(0))
        }
    }
}
