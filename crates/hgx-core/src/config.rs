//! Engine configuration
//!
//! Loaded from TOML, overridden by `HGX_<SECTION>_<KEY>` environment
//! variables, then validated. Every section has working defaults so an empty
//! file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{HgxError, Result};

/// Ratchet defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatchetConfig {
    /// Lookahead used when NEW carries no legroom hint
    pub default_legroom: u32,
    /// Width of the derivation counter in bits
    pub counter_width: u8,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            default_legroom: 3,
            counter_width: 32,
        }
    }
}

/// Gap healing policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    /// Retransmission requests issued before a gap is declared fatal
    pub retry_budget: u32,
    /// Interval between retransmission requests
    pub retry_interval_ms: u64,
    /// Out-of-order frames buffered per object
    pub max_buffered_frames: usize,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            retry_interval_ms: 250,
            max_buffered_frames: 64,
        }
    }
}

/// Connection core and dispatch queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Capacity of the command channel into the connection core
    pub command_queue_depth: usize,
    /// Recent states retained per object beyond the head, capped by legroom
    pub history_depth: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command_queue_depth: 256,
            history_depth: 8,
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HgxConfig {
    /// Ratchet defaults
    pub ratchet: RatchetConfig,
    /// Gap healing policy
    pub healing: HealingConfig,
    /// Connection core and dispatch queues
    pub dispatch: DispatchConfig,
}

impl HgxConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| HgxError::invalid(format!("Invalid TOML: {e}")))
    }

    /// Load a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::load_from_file(path)?,
            _ => Self::default(),
        };
        config.merge_with_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `HGX_*` environment overrides
    pub fn merge_with_env(&mut self) -> Result<()> {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("HGX_") {
                let config_key = config_key.to_lowercase();
                if let Some((section, field)) = config_key.split_once('_') {
                    self.set_from_string(&format!("{section}.{field}"), &value)?;
                }
            }
        }
        Ok(())
    }

    /// Set one value addressed as `section.key`
    pub fn set_from_string(&mut self, key: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .parse()
                .map_err(|_| HgxError::invalid(format!("{key}: cannot parse '{value}'")))
        }

        match key {
            "ratchet.default_legroom" => self.ratchet.default_legroom = parse(key, value)?,
            "ratchet.counter_width" => self.ratchet.counter_width = parse(key, value)?,
            "healing.retry_budget" => self.healing.retry_budget = parse(key, value)?,
            "healing.retry_interval_ms" => self.healing.retry_interval_ms = parse(key, value)?,
            "healing.max_buffered_frames" => self.healing.max_buffered_frames = parse(key, value)?,
            "dispatch.command_queue_depth" => self.dispatch.command_queue_depth = parse(key, value)?,
            "dispatch.history_depth" => self.dispatch.history_depth = parse(key, value)?,
            _ => {
                tracing::debug!(key, "ignoring unknown configuration key");
            }
        }
        Ok(())
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(1..=64).contains(&self.ratchet.counter_width) {
            return Err(HgxError::invalid(format!(
                "ratchet.counter_width must be within 1..=64, got {}",
                self.ratchet.counter_width
            )));
        }
        if self.healing.retry_budget == 0 {
            return Err(HgxError::invalid("healing.retry_budget must be non-zero"));
        }
        if self.healing.retry_interval_ms == 0 {
            return Err(HgxError::invalid("healing.retry_interval_ms must be non-zero"));
        }
        if self.healing.max_buffered_frames == 0 {
            return Err(HgxError::invalid("healing.max_buffered_frames must be non-zero"));
        }
        if self.dispatch.command_queue_depth == 0 {
            return Err(HgxError::invalid("dispatch.command_queue_depth must be non-zero"));
        }
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| HgxError::serialization(e.to_string()))
    }
}
