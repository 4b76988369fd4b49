//! Configuration for the artifact store and the context compressor.
//!
//! Every field has a default, so an empty JSON object is a valid config
//! file. Override specific values through struct fields or the builder
//! methods.
//!
//! ```
//! use stowage::config::{CompressorConfig, StowageConfig};
//!
//! let config = StowageConfig {
//!     compressor: CompressorConfig::default()
//!         .with_hard_limit(1_000)
//!         .with_safety_buffer(100)
//!         .protect_tool("plan_update"),
//!     ..Default::default()
//! };
//! assert_eq!(config.compressor.threshold(), 900);
//! assert_eq!(config.store.selector_cache_capacity, 1_000);
//! ```

use crate::artifact::selector::DEFAULT_SELECTOR_CACHE_CAPACITY;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fixed characters-per-token ratio used for every estimate.
pub const CHARS_PER_TOKEN: usize = 4;

// ── Top-level ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StowageConfig {
    pub store: StoreConfig,
    pub compressor: CompressorConfig,
}

impl StowageConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }
}

// ── Artifact store ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Sanitized selectors memoized before caching stops. Default: 1000.
    pub selector_cache_capacity: usize,
    /// Spawn the enrichment collaborator after each creation, when one is
    /// attached. Default: `true`.
    pub enrich: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            selector_cache_capacity: DEFAULT_SELECTOR_CACHE_CAPACITY,
            enrich: true,
        }
    }
}

impl StoreConfig {
    pub fn with_selector_cache_capacity(mut self, capacity: usize) -> Self {
        self.selector_cache_capacity = capacity;
        self
    }

    pub fn with_enrich(mut self, enrich: bool) -> Self {
        self.enrich = enrich;
        self
    }
}

// ── Context compressor ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorConfig {
    /// Token ceiling for the in-flight message list. Default: 120,000.
    pub hard_limit: usize,
    /// Compression triggers once at most this many tokens remain below
    /// `hard_limit`. Default: 20,000.
    pub safety_buffer: usize,
    /// Tools whose results are never archived.
    pub non_archivable_tools: Vec<String>,
    /// Characters of an archived result kept in its summary view.
    /// Default: 500.
    pub preview_chars: usize,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            hard_limit: 120_000,
            safety_buffer: 20_000,
            non_archivable_tools: vec!["thinking_complete".to_string()],
            preview_chars: 500,
        }
    }
}

impl CompressorConfig {
    pub fn with_hard_limit(mut self, tokens: usize) -> Self {
        self.hard_limit = tokens;
        self
    }

    pub fn with_safety_buffer(mut self, tokens: usize) -> Self {
        self.safety_buffer = tokens;
        self
    }

    pub fn with_preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }

    /// Exclude another tool from archiving.
    pub fn protect_tool(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.non_archivable_tools.contains(&name) {
            self.non_archivable_tools.push(name);
        }
        self
    }

    /// Token estimate at which compression becomes necessary.
    pub fn threshold(&self) -> usize {
        self.hard_limit.saturating_sub(self.safety_buffer)
    }

    pub fn is_archivable(&self, tool_name: &str) -> bool {
        !self.non_archivable_tools.iter().any(|t| t == tool_name)
    }
}
