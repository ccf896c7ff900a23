//! Training batches and the producer contract.
//!
//! The production batch producer lives outside this crate; the trainer only
//! sees the [`BatchSource`] trait. [`SyntheticBatchSource`] generates seeded
//! random positions for smoke runs and tests.

use candle_core::Tensor;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::NetworkConfig;
use crate::context::ExecutionContext;
use crate::error::{LeelazError, LeelazResult};

/// One non-empty batch in the shapes the network consumes.
///
/// Only [`TrainingBatch::new`] builds one, so every batch the trainer sees
/// has passed its checks.
#[derive(Debug, Clone)]
pub struct TrainingBatch {
    planes: Tensor,
    policy: Tensor,
    value: Tensor,
}

impl TrainingBatch {
    /// Validate and normalize a batch.
    ///
    /// `planes` may be `(B, planes, size, size)` or `(B, planes, size * size)`;
    /// `value` may be `(B, 1)` or `(B,)`.
    ///
    /// # Errors
    ///
    /// Returns a shape mismatch error if any tensor disagrees with `config`
    /// or the batch sizes differ, and a data error for an empty batch.
    pub fn new(
        planes: Tensor,
        policy: Tensor,
        value: Tensor,
        config: &NetworkConfig,
    ) -> LeelazResult<Self> {
        let size = config.board_size;
        let points = config.board_points();

        let batch = match planes.dims() {
            &[b, p, s] if p == config.input_planes && s == points => b,
            &[b, p, h, w] if p == config.input_planes && h == size && w == size => b,
            other => {
                return Err(LeelazError::shape_mismatch(
                    format!("[B, {}, {size}, {size}]", config.input_planes),
                    format!("{other:?}"),
                ))
            }
        };
        if batch == 0 {
            return Err(LeelazError::data("batch holds no positions"));
        }
        let planes = planes.reshape((batch, config.input_planes, size, size))?;

        if policy.dims() != [batch, config.policy_outputs()] {
            return Err(LeelazError::shape_mismatch(
                format!("[{batch}, {}]", config.policy_outputs()),
                format!("{:?}", policy.dims()),
            ));
        }

        let value = match value.dims() {
            &[b] if b == batch => value.reshape((batch, 1))?,
            &[b, 1] if b == batch => value,
            other => {
                return Err(LeelazError::shape_mismatch(
                    format!("[{batch}, 1]"),
                    format!("{other:?}"),
                ))
            }
        };

        Ok(Self {
            planes,
            policy,
            value,
        })
    }

    /// (B, planes, size, size)
    pub fn planes(&self) -> &Tensor {
        &self.planes
    }

    /// Target move distribution, (B, points + 1)
    pub fn policy(&self) -> &Tensor {
        &self.policy
    }

    /// Game outcome in [-1, 1], (B, 1)
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Positions in the batch
    pub fn len(&self) -> usize {
        self.planes.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Endless stream of training batches.
pub trait BatchSource {
    /// Produce the next batch on the context's device.
    fn next_batch(&mut self, ctx: &ExecutionContext) -> LeelazResult<TrainingBatch>;
}

/// Seeded random positions with one-hot move targets and ±1 outcomes.
///
/// Stone planes are random; the last two planes encode the side to move
/// (all ones in one of them), matching the input encoding layout.
pub struct SyntheticBatchSource {
    config: NetworkConfig,
    batch_size: usize,
    rng: ChaCha8Rng,
}

impl SyntheticBatchSource {
    pub fn new(config: &NetworkConfig, batch_size: usize, seed: u64) -> Self {
        Self {
            config: config.clone(),
            batch_size,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl BatchSource for SyntheticBatchSource {
    fn next_batch(&mut self, ctx: &ExecutionContext) -> LeelazResult<TrainingBatch> {
        let b = self.batch_size;
        let p = self.config.input_planes;
        let points = self.config.board_points();
        let moves = self.config.policy_outputs();

        let mut planes = vec![0.0f32; b * p * points];
        let mut policy = vec![0.0f32; b * moves];
        let mut value = Vec::with_capacity(b);

        for i in 0..b {
            let position = &mut planes[i * p * points..(i + 1) * p * points];
            let stone_planes = p.saturating_sub(2);
            for x in &mut position[..stone_planes * points] {
                if self.rng.gen_bool(0.25) {
                    *x = 1.0;
                }
            }
            if p >= 2 {
                let to_move = stone_planes + usize::from(self.rng.gen_bool(0.5));
                position[to_move * points..(to_move + 1) * points].fill(1.0);
            }

            policy[i * moves + self.rng.gen_range(0..moves)] = 1.0;
            value.push(if self.rng.gen_bool(0.5) { 1.0f32 } else { -1.0 });
        }

        let device = ctx.device();
        let dtype = ctx.dtype();
        TrainingBatch::new(
            Tensor::from_vec(planes, (b, p, points), device)?.to_dtype(dtype)?,
            Tensor::from_vec(policy, (b, moves), device)?.to_dtype(dtype)?,
            Tensor::from_vec(value, (b, 1), device)?.to_dtype(dtype)?,
            &self.config,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn zeros(dims: &[usize]) -> Tensor {
        Tensor::zeros(dims, DType::F32, &candle_core::Device::Cpu).unwrap()
    }

    #[test]
    fn test_flat_planes_are_reshaped() {
        let config = NetworkConfig::leela_zero();
        let batch =
            TrainingBatch::new(zeros(&[4, 18, 361]), zeros(&[4, 362]), zeros(&[4]), &config)
                .unwrap();
        assert_eq!(batch.planes().dims(), &[4, 18, 19, 19]);
        assert_eq!(batch.value().dims(), &[4, 1]);
        assert_eq!(batch.len(), 4);
    }

    #[test]
    fn test_wrong_plane_count_rejected() {
        let config = NetworkConfig::leela_zero();
        let err = TrainingBatch::new(
            zeros(&[4, 17, 19, 19]),
            zeros(&[4, 362]),
            zeros(&[4, 1]),
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, LeelazError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_mismatched_batch_sizes_rejected() {
        let config = NetworkConfig::leela_zero();
        assert!(TrainingBatch::new(
            zeros(&[4, 18, 19, 19]),
            zeros(&[3, 362]),
            zeros(&[4, 1]),
            &config
        )
        .is_err());
        assert!(TrainingBatch::new(
            zeros(&[4, 18, 19, 19]),
            zeros(&[4, 362]),
            zeros(&[4, 2]),
            &config
        )
        .is_err());
    }

    #[test]
    fn test_empty_batch_rejected() {
        let config = NetworkConfig::test();
        let err = TrainingBatch::new(
            zeros(&[0, 18, 5, 5]),
            zeros(&[0, 26]),
            zeros(&[0, 1]),
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, LeelazError::Data(_)));
    }

    #[test]
    fn test_synthetic_batches_are_seeded() {
        let config = NetworkConfig::test();
        let ctx = ExecutionContext::cpu();
        let mut a = SyntheticBatchSource::new(&config, 3, 7);
        let mut b = SyntheticBatchSource::new(&config, 3, 7);

        let x = a.next_batch(&ctx).unwrap();
        let y = b.next_batch(&ctx).unwrap();
        assert_eq!(x.planes().dims(), &[3, 18, 5, 5]);

        let px: Vec<f32> = x.planes().flatten_all().unwrap().to_vec1().unwrap();
        let py: Vec<f32> = y.planes().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(px, py);

        // one-hot targets, outcomes in {-1, 1}
        let sums: Vec<f32> = x.policy().sum(1).unwrap().to_vec1().unwrap();
        assert!(sums.iter().all(|s| *s == 1.0));
        let values: Vec<f32> = x.value().flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.abs() == 1.0));
    }
}
