//! # leelaz-train-rs
//!
//! Trainer for the Leela Zero policy/value network.
//!
//! This crate provides:
//! - Deterministic construction of the residual tower and of the ordered
//!   registry of exportable tensors
//! - Export into the version 1 text weights format read by the engine
//! - The training loop: momentum SGD, running loss averages, periodic
//!   evaluation, checkpoints and weights exports
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a default configuration
//! leelaz-train init train.yaml
//!
//! # Smoke-train on synthetic positions
//! leelaz-train train train.yaml --steps 4000
//!
//! # Export a checkpoint into a weights file
//! leelaz-train export train.yaml \
//!     --checkpoint outputs/leelaz-model-4000.safetensors \
//!     --output weights.txt
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use leelaz_train_rs::{ExecutionContext, LeelazNet, NetworkConfig, WeightExporter};
//!
//! # fn main() -> leelaz_train_rs::LeelazResult<()> {
//! let ctx = ExecutionContext::cpu();
//! let net = LeelazNet::new(&NetworkConfig::leela_zero(), &ctx, 42)?;
//! WeightExporter::new(net.registry(), &net).save("weights.txt")?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod export;
pub mod layer;
pub mod loss;
pub mod model;
pub mod norm;
pub mod optimizer;
pub mod params;
pub mod registry;
pub mod stats;
pub mod trainer;

pub use checkpoint::CheckpointStore;
pub use config::{NetworkConfig, TrainConfig};
pub use context::ExecutionContext;
pub use data::{BatchSource, SyntheticBatchSource, TrainingBatch};
pub use error::{LeelazError, LeelazResult};
pub use export::WeightExporter;
pub use model::LeelazNet;
pub use registry::{BnKey, BnKeyAllocator, ParameterRegistry};
pub use stats::RunningAverage;
pub use trainer::TrainingLoop;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{NetworkConfig, TrainConfig};
    pub use crate::context::ExecutionContext;
    pub use crate::data::{BatchSource, SyntheticBatchSource, TrainingBatch};
    pub use crate::error::{LeelazError, LeelazResult};
    pub use crate::export::WeightExporter;
    pub use crate::model::LeelazNet;
    pub use crate::registry::{ExportTensors, ParameterRegistry, StatisticsLookup};
    pub use crate::trainer::{StepOutcome, TrainingLoop};
}
