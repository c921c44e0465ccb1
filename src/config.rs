//! Coordinator configuration: exactly the option table in `SPEC_FULL.md`
//! §6, loaded from TOML (`CoordinatorConfig::from_file`) or built
//! programmatically. Unknown keys are a configuration error, replacing the
//! source's duck-typed overrides (Design Notes), the way `daa-cli`'s own
//! config loader rejects unrecognized sections.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategyKind {
    Simple,
    Weighted,
    Federated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategyKind {
    All,
    Threshold,
    TopN,
    Adaptive,
    Contribution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategyKind {
    Fixed,
    Latency,
    Throughput,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationPolicyKind {
    Conservative,
    Aggressive,
    Reactive,
    Proactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardStrategyKind {
    Proportional,
    Tiered,
    Performance,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CoordinatorConfig {
    pub aggregation_strategy: AggregationStrategyKind,
    pub timeout_seconds: f64,
    pub min_nodes_percentage: f64,
    pub gradient_clip_value: Option<f32>,

    pub selection_strategy: SelectionStrategyKind,
    pub min_quality_score: u32,
    pub max_selected_nodes: Option<usize>,

    pub enable_quarantine: bool,
    pub quarantine_threshold: u32,
    pub quarantine_duration_seconds: u64,
    pub probation_steps: u32,

    pub batch_strategy: BatchStrategyKind,
    pub baseline_batch_size: u32,
    pub min_batch_size: u32,
    pub max_batch_size: u32,
    pub use_power_of_two: bool,

    pub adaptation_policy: AdaptationPolicyKind,
    pub adaptation_interval: u64,
    pub warmup_rounds: u64,
    pub enable_rollback: bool,

    pub reward_strategy: RewardStrategyKind,

    /// Number of completed rounds (steps) per epoch; the step counter
    /// advances once per round and the epoch counter advances whenever it
    /// crosses a multiple of this value (`original_source/src/core/
    /// coordinator.py`'s `current_step % steps_per_epoch == 0` check).
    pub steps_per_epoch: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            aggregation_strategy: AggregationStrategyKind::Simple,
            timeout_seconds: 30.0,
            min_nodes_percentage: 0.8,
            gradient_clip_value: None,

            selection_strategy: SelectionStrategyKind::Adaptive,
            min_quality_score: 30,
            max_selected_nodes: None,

            enable_quarantine: true,
            quarantine_threshold: 5,
            quarantine_duration_seconds: 300,
            probation_steps: 3,

            batch_strategy: BatchStrategyKind::Hybrid,
            baseline_batch_size: 64,
            min_batch_size: 16,
            max_batch_size: 256,
            use_power_of_two: true,

            adaptation_policy: AdaptationPolicyKind::Reactive,
            adaptation_interval: 5,
            warmup_rounds: 10,
            enable_rollback: true,

            reward_strategy: RewardStrategyKind::Proportional,

            steps_per_epoch: 10,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CoordinatorError::Configuration(format!(
                "reading {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field consistency checks. A configuration error here is fatal
    /// (spec.md §7): the process should not start with inconsistent options.
    pub fn validate(&self) -> Result<()> {
        if !(self.min_batch_size <= self.baseline_batch_size
            && self.baseline_batch_size <= self.max_batch_size)
        {
            return Err(CoordinatorError::Configuration(format!(
                "batch size bounds out of order: min={} baseline={} max={}",
                self.min_batch_size, self.baseline_batch_size, self.max_batch_size
            )));
        }
        if !(0.0 < self.min_nodes_percentage && self.min_nodes_percentage <= 1.0) {
            return Err(CoordinatorError::Configuration(format!(
                "min_nodes_percentage must be in (0, 1], got {}",
                self.min_nodes_percentage
            )));
        }
        if self.timeout_seconds <= 0.0 {
            return Err(CoordinatorError::Configuration(
                "timeout_seconds must be positive".into(),
            ));
        }
        if let Some(clip) = self.gradient_clip_value {
            if clip <= 0.0 {
                return Err(CoordinatorError::Configuration(
                    "gradient_clip_value must be positive when set".into(),
                ));
            }
        }
        if self.steps_per_epoch == 0 {
            return Err(CoordinatorError::Configuration(
                "steps_per_epoch must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        CoordinatorConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_order_batch_bounds() {
        let mut cfg = CoordinatorConfig::default();
        cfg.min_batch_size = 300;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_steps_per_epoch() {
        let mut cfg = CoordinatorConfig::default();
        cfg.steps_per_epoch = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        let toml_text = "unknown_field = true\n";
        let result: std::result::Result<CoordinatorConfig, _> = toml::from_str(toml_text);
        assert!(result.is_err());
    }
}
