//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - symbolica.toml (base configuration)
//! - symbolica.local.toml (git-ignored local overrides)
//! - Environment variables (SYMBOLICA_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # symbolica.toml
//! [reason]
//! error_strategy = "permissive"
//! deadline_ms = 250
//!
//! [temporal]
//! retention_ms = 3600000
//! max_samples_per_key = 5000
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! SYMBOLICA_REASON__DEADLINE_MS=100
//! SYMBOLICA_TEMPORAL__MAX_SAMPLES_PER_KEY=1000
//! ```

use crate::chaining::DEFAULT_CHAIN_DEPTH;
use crate::engine::ErrorStrategy;
use crate::temporal::TemporalConfig;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub reason: ReasonConfig,

    #[serde(default)]
    pub temporal: TemporalConfig,
}

/// Per-`reason`-call defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonConfig {
    /// How non-demotable evaluation failures are handled.
    #[serde(default)]
    pub error_strategy: ErrorStrategy,

    /// Per-call deadline in milliseconds (absent = unbounded).
    #[serde(default)]
    pub deadline_ms: Option<u64>,

    /// Record and render non-firing rules in traces.
    #[serde(default)]
    pub verbose_trace: bool,

    /// Depth bound for the backward-chaining writer search.
    #[serde(default = "default_chain_depth")]
    pub max_chain_depth: usize,
}

fn default_chain_depth() -> usize {
    DEFAULT_CHAIN_DEPTH
}

impl Default for ReasonConfig {
    fn default() -> Self {
        ReasonConfig {
            error_strategy: ErrorStrategy::Strict,
            deadline_ms: None,
            verbose_trace: false,
            max_chain_depth: DEFAULT_CHAIN_DEPTH,
        }
    }
}

impl ReasonConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

impl EngineConfig {
    /// Load configuration from default locations.
    ///
    /// Merges in order:
    /// 1. symbolica.toml (base configuration)
    /// 2. symbolica.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (SYMBOLICA_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("symbolica.toml"))
            .merge(Toml::file("symbolica.local.toml"))
            .merge(Env::prefixed("SYMBOLICA_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SYMBOLICA_").split("__"))
            .extract()
    }
}
