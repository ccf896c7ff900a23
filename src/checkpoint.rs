//! Checkpoint save and restore.
//!
//! A checkpoint is a safetensors file holding every parameter and buffer of
//! the network plus a JSON sidecar with the step and topology:
//!
//! ```text
//! <output_dir>/<prefix>-<step>.safetensors
//! <output_dir>/<prefix>-<step>.json
//! ```
//!
//! Optimizer momentum is not saved; a resumed run restarts it from zero.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::config::NetworkConfig;
use crate::error::{LeelazError, LeelazResult};
use crate::model::LeelazNet;

const PARAM_PREFIX: &str = "params.";
const BUFFER_PREFIX: &str = "buffers.";

/// Sidecar metadata of one checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Optimization steps completed when the checkpoint was taken
    pub step: u64,
    /// Topology the tensors belong to
    pub network: NetworkConfig,
}

/// Names and locates checkpoints and weights files of one run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    prefix: String,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Tensor file of the checkpoint taken at `step`
    pub fn checkpoint_path(&self, step: u64) -> PathBuf {
        self.dir.join(format!("{}-{step}.safetensors", self.prefix))
    }

    /// Weights file exported at `step`
    pub fn weights_path(&self, step: u64) -> PathBuf {
        self.dir.join(format!("{}-{step}.txt", self.prefix))
    }

    /// Save `net` as the checkpoint of `step`, returning the tensor file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or a write fails.
    pub fn save(&self, net: &LeelazNet, step: u64) -> LeelazResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;

        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for (name, var) in net.named_params()? {
            tensors.insert(format!("{PARAM_PREFIX}{name}"), var.as_tensor().clone());
        }
        for (name, var) in net.named_buffers()? {
            tensors.insert(format!("{BUFFER_PREFIX}{name}"), var.as_tensor().clone());
        }

        let path = self.checkpoint_path(step);
        candle_core::safetensors::save(&tensors, &path)?;

        let meta = CheckpointMeta {
            step,
            network: net.config().clone(),
        };
        std::fs::write(sidecar_path(&path), serde_json::to_string_pretty(&meta)?)?;

        tracing::info!("Model saved in file: {}", path.display());
        Ok(path)
    }
}

/// Path of the JSON sidecar belonging to a tensor file.
pub fn sidecar_path(checkpoint: &Path) -> PathBuf {
    checkpoint.with_extension("json")
}

/// Read only the sidecar of a checkpoint.
///
/// # Errors
///
/// Returns a checkpoint error if the sidecar is missing or malformed.
pub fn read_meta(checkpoint: &Path) -> LeelazResult<CheckpointMeta> {
    let meta_path = sidecar_path(checkpoint);
    let json = std::fs::read_to_string(&meta_path).map_err(|e| {
        LeelazError::checkpoint(format!("Failed to read {}: {e}", meta_path.display()))
    })?;
    serde_json::from_str(&json).map_err(|e| {
        LeelazError::checkpoint(format!("Failed to parse {}: {e}", meta_path.display()))
    })
}

/// Load a checkpoint into `net`, returning the step it was taken at.
///
/// # Errors
///
/// Returns a checkpoint error if either file is missing or corrupt, the
/// topology differs from `net`, or a tensor is missing or misshapen.
pub fn restore(checkpoint: &Path, net: &LeelazNet) -> LeelazResult<u64> {
    tracing::info!("Restoring from {}", checkpoint.display());

    let meta = read_meta(checkpoint)?;
    if !meta.network.same_topology(net.config()) {
        return Err(LeelazError::checkpoint(format!(
            "{} was saved for a different network topology",
            checkpoint.display()
        )));
    }

    let device = net
        .trainable_vars()
        .first()
        .map(|v| v.device().clone())
        .ok_or_else(|| LeelazError::checkpoint("network has no variables"))?;
    let tensors = candle_core::safetensors::load(checkpoint, &device).map_err(|e| {
        LeelazError::checkpoint(format!("Failed to load {}: {e}", checkpoint.display()))
    })?;

    for (name, var) in net.named_params()? {
        assign(&tensors, &format!("{PARAM_PREFIX}{name}"), &var)?;
    }
    for (name, var) in net.named_buffers()? {
        assign(&tensors, &format!("{BUFFER_PREFIX}{name}"), &var)?;
    }

    Ok(meta.step)
}

fn assign(tensors: &HashMap<String, Tensor>, key: &str, var: &Var) -> LeelazResult<()> {
    let value = tensors
        .get(key)
        .ok_or_else(|| LeelazError::checkpoint(format!("missing tensor {key}")))?;
    if value.dims() != var.dims() {
        return Err(LeelazError::checkpoint(format!(
            "tensor {key} has shape {:?}, expected {:?}",
            value.dims(),
            var.dims()
        )));
    }
    var.set(&value.to_dtype(var.dtype())?)?;
    Ok(())
}
