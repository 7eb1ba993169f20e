//! Configuration surface for the wiring collaborator.
//!
//! Keyed by method name for stages and by channel name for link policy;
//! anything absent falls back to the shape defaults.

use crate::ack::AckPolicy;
use crate::descriptor::Concurrency;
use crate::error::MediatorError;
use serde::Deserialize;
use std::collections::HashMap;

/// Default credit granted to a stage's inbound endpoint
pub const DEFAULT_CREDIT: usize = 16;

/// Per-stage overrides supplied by the configuration collaborator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Acknowledgment policy override (wins over the descriptor)
    pub ack_policy: Option<AckPolicy>,
    /// Inbound credit: the bound on outstanding elements
    pub credit: usize,
    /// Concurrency-tolerance override
    pub concurrency: Option<Concurrency>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            ack_policy: None,
            credit: DEFAULT_CREDIT,
            concurrency: None,
        }
    }
}

/// How many stages may claim one side of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// One producer, one consumer (the default)
    Exclusive,
    /// Multiple producers may publish; the consuming side stays exclusive
    Open,
}

impl Default for Cardinality {
    fn default() -> Self {
        Cardinality::Exclusive
    }
}

/// Per-channel link policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub cardinality: Cardinality,
}

/// Full configuration for one pipeline assembly.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stage overrides keyed by method name
    pub stages: HashMap<String, StageConfig>,
    /// Channel policies keyed by channel name
    pub channels: HashMap<String, ChannelConfig>,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from the TOML the configuration collaborator hands over
    pub fn from_toml_str(input: &str) -> Result<Self, MediatorError> {
        toml::from_str(input).map_err(|e| MediatorError::invalid_config(e.to_string()))
    }

    /// Builder-style stage override
    pub fn with_stage(mut self, method: impl Into<String>, config: StageConfig) -> Self {
        self.stages.insert(method.into(), config);
        self
    }

    /// Builder-style channel policy
    pub fn with_channel(mut self, channel: impl Into<String>, config: ChannelConfig) -> Self {
        self.channels.insert(channel.into(), config);
        self
    }

    /// Effective stage config for a method (default when absent)
    pub fn stage(&self, method: &str) -> StageConfig {
        self.stages.get(method).cloned().unwrap_or_default()
    }

    /// Effective cardinality for a channel (exclusive when absent)
    pub fn cardinality(&self, channel: &str) -> Cardinality {
        self.channels
            .get(channel)
            .map(|c| c.cardinality)
            .unwrap_or_default()
    }
}
