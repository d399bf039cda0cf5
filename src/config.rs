//! Engine configuration.
//!
//! Built directly or loaded from defaults overlaid with `DFN_`-prefixed
//! environment variables (e.g. `DFN_STRICT_REPLAY=true`).
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Application identifier, attached to log records.
    pub app_id: String,
    /// Attempt budget used when the invocation does not carry one.
    pub default_max_attempts: u32,
    /// Fail the pass instead of warning when memoized steps go unreached.
    pub strict_replay: bool,
    /// Cooperative yields granted after the first discovery so steps reached
    /// from other tasks can join the same tick.
    pub tick_drain_rounds: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_id: "rust-dfn".to_string(),
            default_max_attempts: 4,
            strict_replay: false,
            tick_drain_rounds: 3,
        }
    }
}

impl EngineConfig {
    pub const ENV_PREFIX: &'static str = "DFN";

    /// Load from defaults and the process environment.
    pub fn load() -> Result<Self, EngineError> {
        Self::load_with(config::Environment::with_prefix(Self::ENV_PREFIX).try_parsing(true))
    }

    /// Load from defaults overlaid with an explicit environment source.
    pub fn load_with(env: config::Environment) -> Result<Self, EngineError> {
        let defaults = EngineConfig::default();
        let cfg = config::Config::builder()
            .set_default("app_id", defaults.app_id)?
            .set_default("default_max_attempts", i64::from(defaults.default_max_attempts))?
            .set_default("strict_replay", defaults.strict_replay)?
            .set_default("tick_drain_rounds", i64::from(defaults.tick_drain_rounds))?
            .add_source(env)
            .build()?;
        let loaded: EngineConfig = cfg.try_deserialize()?;
        tracing::debug!(?loaded, "engine configuration loaded");
        Ok(loaded)
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn with_strict_replay(mut self, strict: bool) -> Self {
        self.strict_replay = strict;
        self
    }

    pub fn with_default_max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = attempts.max(1);
        self
    }

    pub fn with_tick_drain_rounds(mut self, rounds: u32) -> Self {
        self.tick_drain_rounds = rounds;
        self
    }
}
