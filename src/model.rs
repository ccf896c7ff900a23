//! The policy/value residual network.
//!
//! Implements the full model with:
//! - Stem convolution-normalization stage
//! - Residual tower
//! - Policy head producing raw move logits (board points + pass)
//! - Value head producing a tanh-bounded evaluation

use std::collections::BTreeMap;

use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use crate::config::NetworkConfig;
use crate::context::ExecutionContext;
use crate::error::{LeelazError, LeelazResult};
use crate::layer::{ConvBlock, Dense, NormSettings, ResidualBlock};
use crate::norm::{RunningStats, StatisticsUpdate};
use crate::params::{named_vars, ParamBuilder};
use crate::registry::{
    BnKey, BnKeyAllocator, ExportTensors, ParameterRegistry, Statistic, StatisticsLookup,
};

/// Head outputs of one forward pass.
#[derive(Debug)]
pub struct NetOutput {
    /// Raw logits, (N, board_points + 1)
    pub policy_logits: Tensor,
    /// Evaluation in [-1, 1], (N, 1)
    pub value: Tensor,
    /// Running-statistic writes produced by a training pass, in stage order
    pub statistics: Vec<StatisticsUpdate>,
}

/// The network plus the registry its construction produced.
pub struct LeelazNet {
    stem: ConvBlock,
    tower: Vec<ResidualBlock>,
    policy_conv: ConvBlock,
    policy_fc: Dense,
    value_conv: ConvBlock,
    value_fc1: Dense,
    value_fc2: Dense,
    registry: ParameterRegistry,
    stages: BTreeMap<BnKey, RunningStats>,
    keys: Vec<BnKey>,
    params: VarMap,
    buffers: VarMap,
    config: NetworkConfig,
}

impl LeelazNet {
    /// Build the network with seeded initialization.
    ///
    /// Construction order (stem, tower, policy head, value head) fixes both
    /// the normalization keys and the registry order.
    pub fn new(config: &NetworkConfig, ctx: &ExecutionContext, seed: u64) -> LeelazResult<Self> {
        config.validate()?;

        let params = VarMap::new();
        let buffers = VarMap::new();
        let mut builder = ParamBuilder::new(ctx, &params, &buffers, seed, config.init_stddev)?;
        let mut keys = BnKeyAllocator::new();
        let norm = NormSettings {
            eps: config.bn_epsilon,
            decay: config.bn_decay,
        };
        let channels = config.channels;
        let points = config.board_points();

        let stem = ConvBlock::new(
            &mut builder,
            &mut keys,
            "stem",
            3,
            config.input_planes,
            channels,
            norm,
        )?;

        let mut tower = Vec::with_capacity(config.residual_blocks);
        for i in 0..config.residual_blocks {
            tower.push(ResidualBlock::new(
                &mut builder,
                &mut keys,
                &format!("tower.{i}"),
                channels,
                norm,
            )?);
        }

        let policy_conv =
            ConvBlock::new(&mut builder, &mut keys, "policy.conv", 1, channels, 2, norm)?;
        let policy_fc = Dense::new(&mut builder, "policy.fc", 2 * points, config.policy_outputs())?;

        let value_conv =
            ConvBlock::new(&mut builder, &mut keys, "value.conv", 1, channels, 1, norm)?;
        let value_fc1 = Dense::new(&mut builder, "value.fc1", points, config.value_hidden)?;
        let value_fc2 = Dense::new(&mut builder, "value.fc2", config.value_hidden, 1)?;

        let mut layers: Vec<&dyn ExportTensors> = vec![&stem];
        layers.extend(tower.iter().map(|b| b as &dyn ExportTensors));
        layers.extend([
            &policy_conv as &dyn ExportTensors,
            &policy_fc,
            &value_conv,
            &value_fc1,
            &value_fc2,
        ]);
        let registry = ParameterRegistry::from_layers(&layers);

        let mut conv_blocks: Vec<&ConvBlock> = vec![&stem];
        conv_blocks.extend(tower.iter().flat_map(|b| b.stages()));
        conv_blocks.extend([&policy_conv, &value_conv]);
        let stages: BTreeMap<BnKey, RunningStats> = conv_blocks
            .iter()
            .map(|c| (c.norm().key(), c.norm().stats().clone()))
            .collect();
        let keys: Vec<BnKey> = conv_blocks.iter().map(|c| c.norm().key()).collect();

        tracing::info!(
            "Built {}x{} network: {} registry entries, {} normalization stages, \
             ~{} trainable params",
            config.residual_blocks,
            channels,
            registry.len(),
            keys.len(),
            config.parameter_count()
        );

        Ok(Self {
            stem,
            tower,
            policy_conv,
            policy_fc,
            value_conv,
            value_fc1,
            value_fc2,
            registry,
            stages,
            keys,
            params,
            buffers,
            config: config.clone(),
        })
    }

    /// Forward pass over planes shaped (N, planes, size, size) or
    /// (N, planes, size * size).
    pub fn forward_t(&self, planes: &Tensor, train: bool) -> LeelazResult<NetOutput> {
        let points = self.config.board_points();
        let size = self.config.board_size;
        let mut statistics = Vec::new();

        let planes = match planes.rank() {
            3 => planes.reshape(((), self.config.input_planes, size, size))?,
            4 => planes.clone(),
            _ => {
                return Err(LeelazError::shape_mismatch(
                    format!("[N, {}, {size}, {size}]", self.config.input_planes),
                    format!("{:?}", planes.dims()),
                ))
            }
        };

        let mut h = self.stem.forward_t(&planes, train, &mut statistics)?;
        for block in &self.tower {
            h = block.forward_t(&h, train, &mut statistics)?;
        }

        let policy = self.policy_conv.forward_t(&h, train, &mut statistics)?;
        let policy = policy.reshape(((), 2 * points))?;
        let policy_logits = self.policy_fc.forward(&policy)?;

        let value = self.value_conv.forward_t(&h, train, &mut statistics)?;
        let value = value.reshape(((), points))?;
        let value = self.value_fc1.forward(&value)?.relu()?;
        let value = self.value_fc2.forward(&value)?.tanh()?;

        Ok(NetOutput {
            policy_logits,
            value,
            statistics,
        })
    }

    /// Half the summed squares of every trainable variable.
    pub fn l2_term(&self) -> LeelazResult<Tensor> {
        let vars = self.params.all_vars();
        let mut total: Option<Tensor> = None;
        for var in &vars {
            let sq = (var.as_tensor().sqr()?.sum_all()? * 0.5)?;
            total = Some(match total {
                Some(t) => (t + sq)?,
                None => sq,
            });
        }
        total.ok_or_else(|| LeelazError::training("network has no trainable variables"))
    }

    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    /// Normalization keys in construction order
    pub fn bn_keys(&self) -> &[BnKey] {
        &self.keys
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Trainable variables
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.params.all_vars()
    }

    /// Trainable variables keyed by name, sorted
    pub fn named_params(&self) -> LeelazResult<Vec<(String, Var)>> {
        named_vars(&self.params)
    }

    /// Non-trainable buffers keyed by name, sorted
    pub fn named_buffers(&self) -> LeelazResult<Vec<(String, Var)>> {
        named_vars(&self.buffers)
    }
}

impl StatisticsLookup for LeelazNet {
    fn statistic(&self, scope: BnKey, stat: Statistic) -> Option<Tensor> {
        self.stages.get(&scope).map(|s| s.get(stat).clone())
    }
}
