//! Convolution-normalization stage, residual block and dense layer.
//!
//! Weights keep the layouts the weights format converts from: convolution
//! kernels are stored `[kh, kw, in, out]` and dense weights `[in, out]`.
//! The convolution kernel is permuted to candle's `[out, in, kh, kw]` at
//! forward time.

use candle_core::{Tensor, Var};

use crate::error::{LeelazError, LeelazResult};
use crate::norm::{RunningBatchNorm, StatisticsUpdate};
use crate::params::ParamBuilder;
use crate::registry::{BnKeyAllocator, ExportTensors, TensorDescriptor, TensorRole};

/// Same-padded convolution, constant zero bias, normalization, ReLU.
#[derive(Debug, Clone)]
pub struct ConvBlock {
    weight: Tensor,
    bias: Var,
    norm: RunningBatchNorm,
    padding: usize,
    out_channels: usize,
}

/// Construction parameters shared by every normalization stage.
#[derive(Debug, Clone, Copy)]
pub struct NormSettings {
    pub eps: f64,
    pub decay: f64,
}

impl ConvBlock {
    /// Create the stage, allocating its normalization key.
    ///
    /// # Errors
    ///
    /// Returns an error for an even kernel (same padding is undefined) or a
    /// zero channel count.
    pub fn new(
        builder: &mut ParamBuilder<'_>,
        keys: &mut BnKeyAllocator,
        name: &str,
        filter_size: usize,
        in_channels: usize,
        out_channels: usize,
        norm: NormSettings,
    ) -> LeelazResult<Self> {
        if filter_size % 2 == 0 {
            return Err(LeelazError::invalid_config(format!(
                "{name}: filter size {filter_size} must be odd"
            )));
        }
        if in_channels == 0 || out_channels == 0 {
            return Err(LeelazError::invalid_config(format!(
                "{name}: channel counts must be > 0"
            )));
        }

        let weight = builder.weight(
            &format!("{name}.weight"),
            &[filter_size, filter_size, in_channels, out_channels],
        )?;
        // Any learned bias would be cancelled by the mean subtraction.
        let bias = builder.buffer(&format!("{name}.bias"), out_channels, 0.0)?;
        let key = keys.allocate();
        let norm = RunningBatchNorm::new(builder, key, out_channels, norm.eps, norm.decay)?;

        tracing::debug!(
            "{}: {}x{} conv {} -> {} ({})",
            name,
            filter_size,
            filter_size,
            in_channels,
            out_channels,
            key
        );

        Ok(Self {
            weight,
            bias,
            norm,
            padding: filter_size / 2,
            out_channels,
        })
    }

    pub fn norm(&self) -> &RunningBatchNorm {
        &self.norm
    }

    /// Convolution + bias + normalization, without the activation.
    pub fn forward_normalized(
        &self,
        x: &Tensor,
        train: bool,
        updates: &mut Vec<StatisticsUpdate>,
    ) -> LeelazResult<Tensor> {
        let kernel = self.weight.permute((3, 2, 0, 1))?.contiguous()?;
        let conv = x.conv2d(&kernel, self.padding, 1, 1, 1)?;
        let bias = self.bias.as_tensor().reshape((1, self.out_channels, 1, 1))?;
        let conv = conv.broadcast_add(&bias)?;
        self.norm.forward_t(&conv, train, updates)
    }

    /// Full stage output.
    pub fn forward_t(
        &self,
        x: &Tensor,
        train: bool,
        updates: &mut Vec<StatisticsUpdate>,
    ) -> LeelazResult<Tensor> {
        Ok(self.forward_normalized(x, train, updates)?.relu()?)
    }
}

impl ExportTensors for ConvBlock {
    fn descriptors(&self) -> Vec<TensorDescriptor> {
        let [mean, variance] = self.norm.descriptors();
        vec![
            TensorDescriptor::direct(TensorRole::ConvWeight, &self.weight),
            TensorDescriptor::direct(TensorRole::ConvBias, self.bias.as_tensor()),
            mean,
            variance,
        ]
    }
}

/// Two 3x3 stages with an identity skip added before the final ReLU.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    first: ConvBlock,
    second: ConvBlock,
}

impl ResidualBlock {
    pub fn new(
        builder: &mut ParamBuilder<'_>,
        keys: &mut BnKeyAllocator,
        name: &str,
        channels: usize,
        norm: NormSettings,
    ) -> LeelazResult<Self> {
        let first = ConvBlock::new(
            builder,
            keys,
            &format!("{name}.conv1"),
            3,
            channels,
            channels,
            norm,
        )?;
        let second = ConvBlock::new(
            builder,
            keys,
            &format!("{name}.conv2"),
            3,
            channels,
            channels,
            norm,
        )?;
        Ok(Self { first, second })
    }

    /// Input and output are both (N, C, H, W).
    pub fn forward_t(
        &self,
        x: &Tensor,
        train: bool,
        updates: &mut Vec<StatisticsUpdate>,
    ) -> LeelazResult<Tensor> {
        let h = self.first.forward_t(x, train, updates)?;
        let h = self.second.forward_normalized(&h, train, updates)?;
        Ok((h + x)?.relu()?)
    }

    pub fn stages(&self) -> [&ConvBlock; 2] {
        [&self.first, &self.second]
    }
}

impl ExportTensors for ResidualBlock {
    fn descriptors(&self) -> Vec<TensorDescriptor> {
        let mut descriptors = self.first.descriptors();
        descriptors.extend(self.second.descriptors());
        descriptors
    }
}

/// Fully connected layer, weight stored `[in, out]`.
#[derive(Debug, Clone)]
pub struct Dense {
    weight: Tensor,
    bias: Tensor,
}

impl Dense {
    pub fn new(
        builder: &mut ParamBuilder<'_>,
        name: &str,
        in_features: usize,
        out_features: usize,
    ) -> LeelazResult<Self> {
        let weight = builder.weight(&format!("{name}.weight"), &[in_features, out_features])?;
        let bias = builder.bias(&format!("{name}.bias"), out_features)?;
        Ok(Self { weight, bias })
    }

    /// (N, in) -> (N, out), no activation.
    pub fn forward(&self, x: &Tensor) -> LeelazResult<Tensor> {
        Ok(x.matmul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

impl ExportTensors for Dense {
    fn descriptors(&self) -> Vec<TensorDescriptor> {
        vec![
            TensorDescriptor::direct(TensorRole::FcWeight, &self.weight),
            TensorDescriptor::direct(TensorRole::FcBias, &self.bias),
        ]
    }
}
