//! Batch normalization over NCHW feature maps using basic tensor ops.
//!
//! The stage has no learned gain or shift: it only centers and rescales,
//! per channel, by the batch statistics while training and by its running
//! statistics at inference. Running-statistic updates computed during a
//! training forward pass are returned to the caller as
//! [`StatisticsUpdate`]s instead of being written immediately, so the
//! trainer decides when in the step they land.

use candle_core::{Tensor, Var};

use crate::error::LeelazResult;
use crate::params::ParamBuilder;
use crate::registry::{BnKey, Statistic, TensorDescriptor};

/// Running mean and variance of one normalization stage.
#[derive(Debug, Clone)]
pub struct RunningStats {
    pub mean: Var,
    pub variance: Var,
}

impl RunningStats {
    pub fn get(&self, stat: Statistic) -> &Tensor {
        match stat {
            Statistic::Mean => self.mean.as_tensor(),
            Statistic::Variance => self.variance.as_tensor(),
        }
    }
}

/// Pending write of new running statistics.
#[derive(Debug)]
pub struct StatisticsUpdate {
    scope: BnKey,
    stats: RunningStats,
    mean: Tensor,
    variance: Tensor,
}

impl StatisticsUpdate {
    pub fn scope(&self) -> BnKey {
        self.scope
    }

    /// Write the new values into the stage's buffers.
    pub fn apply(self) -> LeelazResult<()> {
        self.stats.mean.set(&self.mean)?;
        self.stats.variance.set(&self.variance)?;
        Ok(())
    }
}

/// Per-channel normalization with running statistics.
#[derive(Debug, Clone)]
pub struct RunningBatchNorm {
    key: BnKey,
    channels: usize,
    stats: RunningStats,
    eps: f64,
    decay: f64,
}

impl RunningBatchNorm {
    /// Create the stage; its buffers are scoped under `key`.
    pub fn new(
        builder: &mut ParamBuilder<'_>,
        key: BnKey,
        channels: usize,
        eps: f64,
        decay: f64,
    ) -> LeelazResult<Self> {
        let mean = builder.buffer(&format!("{key}.{}", Statistic::Mean), channels, 0.0)?;
        let variance = builder.buffer(&format!("{key}.{}", Statistic::Variance), channels, 1.0)?;
        Ok(Self {
            key,
            channels,
            stats: RunningStats { mean, variance },
            eps,
            decay,
        })
    }

    pub fn key(&self) -> BnKey {
        self.key
    }

    pub fn stats(&self) -> &RunningStats {
        &self.stats
    }

    /// Normalize `x` of shape (N, C, H, W).
    ///
    /// In training mode the batch statistics are used and the new running
    /// statistics are pushed onto `updates`; otherwise the running
    /// statistics are used and nothing is pushed.
    pub fn forward_t(
        &self,
        x: &Tensor,
        train: bool,
        updates: &mut Vec<StatisticsUpdate>,
    ) -> LeelazResult<Tensor> {
        let (n, _, h, w) = x.dims4()?;
        let shape = (1, self.channels, 1, 1);

        if !train {
            let mean = self.stats.mean.as_tensor().reshape(shape)?;
            let std = (self.stats.variance.as_tensor().reshape(shape)? + self.eps)?.sqrt()?;
            return Ok(x.broadcast_sub(&mean)?.broadcast_div(&std)?);
        }

        let mean = x.mean_keepdim(0)?.mean_keepdim(2)?.mean_keepdim(3)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered
            .sqr()?
            .mean_keepdim(0)?
            .mean_keepdim(2)?
            .mean_keepdim(3)?;
        let normalized = centered.broadcast_div(&(&var + self.eps)?.sqrt()?)?;

        // Running variance is the unbiased estimate.
        let count = n * h * w;
        let correction = if count > 1 {
            count as f64 / (count - 1) as f64
        } else {
            1.0
        };
        let keep = self.decay;
        let take = 1.0 - self.decay;
        let new_mean = ((self.stats.mean.as_tensor() * keep)? + (mean.flatten_all()? * take)?)?;
        let new_variance = ((self.stats.variance.as_tensor() * keep)?
            + (var.flatten_all()? * (take * correction))?)?;

        updates.push(StatisticsUpdate {
            scope: self.key,
            stats: self.stats.clone(),
            mean: new_mean,
            variance: new_variance,
        });

        Ok(normalized)
    }

    /// The two statistic references, mean first.
    pub fn descriptors(&self) -> [TensorDescriptor; 2] {
        [
            TensorDescriptor::statistic(self.key, Statistic::Mean),
            TensorDescriptor::statistic(self.key, Statistic::Variance),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::registry::BnKeyAllocator;
    use candle_nn::VarMap;

    fn stage(ctx: &ExecutionContext, params: &VarMap, buffers: &VarMap) -> RunningBatchNorm {
        let mut builder = ParamBuilder::new(ctx, params, buffers, 0, 0.1).unwrap();
        let key = BnKeyAllocator::new().allocate();
        RunningBatchNorm::new(&mut builder, key, 2, 1e-5, 0.99).unwrap()
    }

    #[test]
    fn test_train_normalizes_per_channel() {
        let ctx = ExecutionContext::cpu();
        let (params, buffers) = (VarMap::new(), VarMap::new());
        let norm = stage(&ctx, &params, &buffers);

        let x = Tensor::randn(3.0f32, 2.0, (4, 2, 3, 3), ctx.device()).unwrap();
        let mut updates = Vec::new();
        let out = norm.forward_t(&x, true, &mut updates).unwrap();

        assert_eq!(out.dims(), &[4, 2, 3, 3]);
        assert_eq!(updates.len(), 1);
        let channel_means: Vec<f32> = out
            .mean_keepdim(0)
            .unwrap()
            .mean_keepdim(2)
            .unwrap()
            .mean_keepdim(3)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(channel_means.iter().all(|m| m.abs() < 1e-4));
    }

    #[test]
    fn test_statistics_not_written_until_applied() {
        let ctx = ExecutionContext::cpu();
        let (params, buffers) = (VarMap::new(), VarMap::new());
        let norm = stage(&ctx, &params, &buffers);

        // Channel 0 is constant 2.0, channel 1 constant -4.0.
        let data: Vec<f32> = [vec![2.0f32; 4], vec![-4.0f32; 4]].concat();
        let x = Tensor::from_vec(data, (1, 2, 2, 2), ctx.device()).unwrap();

        let mut updates = Vec::new();
        norm.forward_t(&x, true, &mut updates).unwrap();
        let mean_before: Vec<f32> = norm.stats().mean.as_tensor().to_vec1().unwrap();
        assert_eq!(mean_before, vec![0.0, 0.0]);

        for update in updates {
            update.apply().unwrap();
        }
        let mean_after: Vec<f32> = norm.stats().mean.as_tensor().to_vec1().unwrap();
        assert!((mean_after[0] - 0.02).abs() < 1e-6);
        assert!((mean_after[1] + 0.04).abs() < 1e-6);

        // Zero batch variance decays the running variance toward 0.
        let var_after: Vec<f32> = norm.stats().variance.as_tensor().to_vec1().unwrap();
        assert!((var_after[0] - 0.99).abs() < 1e-6);
    }

    #[test]
    fn test_eval_uses_running_statistics() {
        let ctx = ExecutionContext::cpu();
        let (params, buffers) = (VarMap::new(), VarMap::new());
        let norm = stage(&ctx, &params, &buffers);

        let x = Tensor::ones((1, 2, 2, 2), candle_core::DType::F32, ctx.device()).unwrap();
        let mut updates = Vec::new();
        let out = norm.forward_t(&x, false, &mut updates).unwrap();

        assert!(updates.is_empty());
        // mean 0, variance 1: output is x / sqrt(1 + eps)
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (v - 1.0).abs() < 1e-4));
    }
}
