//! Configuration parsing and validation.
//!
//! A training run is described by a single YAML file. Every field has a
//! default matching the reference Leela Zero trainer, so an empty mapping is
//! a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LeelazError, LeelazResult};

/// Network topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Input feature planes per position
    pub input_planes: usize,
    /// Filters in the stem and in every residual block
    pub channels: usize,
    /// Number of residual blocks in the tower
    pub residual_blocks: usize,
    /// Board side length
    pub board_size: usize,
    /// Hidden units in the value head
    pub value_hidden: usize,
    /// Normalization epsilon
    pub bn_epsilon: f64,
    /// Decay of the normalization running statistics
    pub bn_decay: f64,
    /// Standard deviation of the truncated normal weight init
    pub init_stddev: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::leela_zero()
    }
}

impl NetworkConfig {
    /// The 6x128 network read by the version 1 weights parser.
    pub fn leela_zero() -> Self {
        Self {
            input_planes: 18,
            channels: 128,
            residual_blocks: 6,
            board_size: 19,
            value_hidden: 256,
            bn_epsilon: 1e-5,
            bn_decay: 0.99,
            init_stddev: 0.1,
        }
    }

    /// Test configuration (minimal for unit tests)
    pub fn test() -> Self {
        Self {
            input_planes: 18,
            channels: 8,
            residual_blocks: 2,
            board_size: 5,
            value_hidden: 16,
            bn_epsilon: 1e-5,
            bn_decay: 0.99,
            init_stddev: 0.1,
        }
    }

    /// Intersections on the board
    pub fn board_points(&self) -> usize {
        self.board_size * self.board_size
    }

    /// Policy classes: every intersection plus pass
    pub fn policy_outputs(&self) -> usize {
        self.board_points() + 1
    }

    /// Normalization stages the topology allocates keys for
    pub fn normalization_stages(&self) -> usize {
        1 + 2 * self.residual_blocks + 2
    }

    /// Entries in the exported weights file, excluding the version line
    pub fn registry_len(&self) -> usize {
        4 * self.normalization_stages() + 2 + 2 + 2
    }

    /// Count of trainable scalars (weights and fully connected biases)
    pub fn parameter_count(&self) -> usize {
        let points = self.board_points();
        let stem = 9 * self.input_planes * self.channels;
        let tower = self.residual_blocks * 2 * 9 * self.channels * self.channels;
        let policy = self.channels * 2 + 2 * points * self.policy_outputs() + self.policy_outputs();
        let value = self.channels
            + points * self.value_hidden
            + self.value_hidden
            + self.value_hidden
            + 1;
        stem + tower + policy + value
    }

    /// Whether `other` describes the same tensor shapes.
    pub fn same_topology(&self, other: &Self) -> bool {
        self.input_planes == other.input_planes
            && self.channels == other.channels
            && self.residual_blocks == other.residual_blocks
            && self.board_size == other.board_size
            && self.value_hidden == other.value_hidden
    }

    /// Validate the topology.
    ///
    /// # Errors
    ///
    /// Returns an error if any dimension is zero or a rate is out of range.
    pub fn validate(&self) -> LeelazResult<()> {
        for (name, value) in [
            ("input_planes", self.input_planes),
            ("channels", self.channels),
            ("board_size", self.board_size),
            ("value_hidden", self.value_hidden),
        ] {
            if value == 0 {
                return Err(LeelazError::invalid_config(format!("{name} must be > 0")));
            }
        }
        if !(self.bn_decay > 0.0 && self.bn_decay < 1.0) {
            return Err(LeelazError::invalid_config("bn_decay must be in (0, 1)"));
        }
        if self.bn_epsilon <= 0.0 {
            return Err(LeelazError::invalid_config("bn_epsilon must be > 0"));
        }
        if self.init_stddev <= 0.0 {
            return Err(LeelazError::invalid_config("init_stddev must be > 0"));
        }
        Ok(())
    }
}

/// Step cadence and batch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// Positions per batch
    pub batch_size: usize,
    /// Report running averages every N steps
    pub report_every: u64,
    /// Evaluate, checkpoint and export every N steps
    pub evaluate_every: u64,
    /// Batches averaged per evaluation
    pub eval_batches: usize,
    /// Stop after this many steps (`None` = run until interrupted)
    pub max_steps: Option<u64>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            batch_size: 256,
            report_every: 100,
            evaluate_every: 2000,
            eval_batches: 10,
            max_steps: None,
        }
    }
}

/// Momentum optimizer hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    /// Learning rate
    pub learning_rate: f64,
    /// Momentum coefficient
    pub momentum: f64,
    /// Use the Nesterov update
    pub nesterov: bool,
    /// L2 regularization scale over trainable variables
    pub l2_scale: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            momentum: 0.9,
            nesterov: true,
            l2_scale: 1e-4,
        }
    }
}

/// Compute device selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Force the CPU even when CUDA is available
    pub force_cpu: bool,
    /// CUDA ordinal
    pub cuda_device: usize,
}

/// Main configuration for a training run.
///
/// # Example
///
/// ```rust
/// use leelaz_train_rs::TrainConfig;
///
/// let config: TrainConfig = serde_yaml::from_str("seed: 7").unwrap();
/// assert_eq!(config.network.channels, 128);
/// assert_eq!(config.training.evaluate_every, 2000);
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Network topology.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Cadence and batch settings.
    #[serde(default)]
    pub training: TrainingSettings,

    /// Optimizer hyperparameters.
    #[serde(default)]
    pub optimizer: OptimizerSettings,

    /// Device selection.
    #[serde(default)]
    pub device: DeviceSettings,

    /// Directory receiving checkpoints and weights files.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// File name prefix for checkpoints and weights files.
    #[serde(default = "default_model_prefix")]
    pub model_prefix: String,

    /// Seed for weight init and the synthetic producer.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./outputs".into()
}

fn default_model_prefix() -> String {
    "leelaz-model".into()
}

fn default_seed() -> u64 {
    42
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            training: TrainingSettings::default(),
            optimizer: OptimizerSettings::default(),
            device: DeviceSettings::default(),
            output_dir: default_output_dir(),
            model_prefix: default_model_prefix(),
            seed: default_seed(),
        }
    }
}

impl TrainConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> LeelazResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> LeelazResult<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> LeelazResult<()> {
        self.network.validate()?;

        if self.training.batch_size == 0 {
            return Err(LeelazError::invalid_config("batch_size must be > 0"));
        }
        if self.training.report_every == 0 || self.training.evaluate_every == 0 {
            return Err(LeelazError::invalid_config(
                "report_every and evaluate_every must be > 0",
            ));
        }
        if self.training.eval_batches == 0 {
            return Err(LeelazError::invalid_config("eval_batches must be > 0"));
        }
        if self.optimizer.learning_rate <= 0.0 {
            return Err(LeelazError::invalid_config("learning_rate must be > 0"));
        }
        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            return Err(LeelazError::invalid_config("momentum must be in [0, 1)"));
        }
        if self.optimizer.l2_scale < 0.0 {
            return Err(LeelazError::invalid_config("l2_scale must be >= 0"));
        }
        if self.output_dir.is_empty() {
            return Err(LeelazError::invalid_config("output_dir cannot be empty"));
        }
        if self.model_prefix.is_empty() {
            return Err(LeelazError::invalid_config("model_prefix cannot be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leela_zero_counts() {
        let config = NetworkConfig::leela_zero();
        assert_eq!(config.normalization_stages(), 15);
        assert_eq!(config.registry_len(), 66);
        assert_eq!(config.policy_outputs(), 362);
    }

    #[test]
    fn test_same_topology_ignores_rates() {
        let mut other = NetworkConfig::leela_zero();
        other.bn_decay = 0.9;
        assert!(NetworkConfig::leela_zero().same_topology(&other));
        other.channels = 64;
        assert!(!NetworkConfig::leela_zero().same_topology(&other));
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: TrainConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, TrainConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_training_section() {
        let yaml = "training:\n  batch_size: 32\n  evaluate_every: 10\n";
        let config: TrainConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.training.evaluate_every, 10);
        assert_eq!(config.training.report_every, 100);
        assert_eq!(config.training.eval_batches, 10);
    }

    #[test]
    fn test_validate_rejects_zero_channels() {
        let mut config = TrainConfig::default();
        config.network.channels = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("channels"));
    }

    #[test]
    fn test_validate_rejects_bad_decay() {
        let mut config = TrainConfig::default();
        config.network.bn_decay = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_cadence() {
        let mut config = TrainConfig::default();
        config.training.evaluate_every = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.yaml");

        let mut config = TrainConfig::default();
        config.network = NetworkConfig::test();
        config.seed = 9;
        config.to_file(&path).unwrap();

        let loaded = TrainConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
