//! Seeded creation of trainable parameters and non-trainable buffers.
//!
//! Trainable tensors go into one `VarMap`, which is what the optimizer and
//! the L2 term walk. Buffers (the zero convolution bias and the running
//! statistics) go into a second `VarMap` so they are checkpointed alongside
//! the parameters but never receive an update from the optimizer.

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::context::ExecutionContext;
use crate::error::{LeelazError, LeelazResult};

/// Creates named variables with deterministic initial values.
pub struct ParamBuilder<'a> {
    ctx: &'a ExecutionContext,
    params: &'a VarMap,
    buffers: &'a VarMap,
    rng: ChaCha8Rng,
    init: Normal<f32>,
    stddev: f32,
}

impl<'a> ParamBuilder<'a> {
    /// Create a builder drawing weights from N(0, `stddev`) truncated at two
    /// standard deviations.
    ///
    /// # Errors
    ///
    /// Returns an error if `stddev` is not a valid standard deviation.
    pub fn new(
        ctx: &'a ExecutionContext,
        params: &'a VarMap,
        buffers: &'a VarMap,
        seed: u64,
        stddev: f64,
    ) -> LeelazResult<Self> {
        let stddev = stddev as f32;
        let init = Normal::new(0.0, stddev)
            .map_err(|e| LeelazError::invalid_config(format!("init_stddev: {e}")))?;
        Ok(Self {
            ctx,
            params,
            buffers,
            rng: ChaCha8Rng::seed_from_u64(seed),
            init,
            stddev,
        })
    }

    pub fn ctx(&self) -> &ExecutionContext {
        self.ctx
    }

    /// Trainable weight with truncated normal init.
    pub fn weight(&mut self, name: &str, dims: &[usize]) -> LeelazResult<Tensor> {
        let count: usize = dims.iter().product();
        let limit = 2.0 * self.stddev;
        let mut values = Vec::with_capacity(count);
        while values.len() < count {
            let v = self.init.sample(&mut self.rng);
            if v.abs() <= limit {
                values.push(v);
            }
        }
        let tensor = Tensor::from_vec(values, dims, self.ctx.device())?.to_dtype(self.ctx.dtype())?;
        Ok(insert(self.params, name, &tensor)?.as_tensor().clone())
    }

    /// Trainable bias initialized to zero.
    pub fn bias(&mut self, name: &str, len: usize) -> LeelazResult<Tensor> {
        let tensor = Tensor::zeros(len, self.ctx.dtype(), self.ctx.device())?;
        Ok(insert(self.params, name, &tensor)?.as_tensor().clone())
    }

    /// Non-trainable buffer filled with `value`.
    pub fn buffer(&mut self, name: &str, len: usize, value: f64) -> LeelazResult<Var> {
        let tensor = (Tensor::ones(len, self.ctx.dtype(), self.ctx.device())? * value)?;
        insert(self.buffers, name, &tensor)
    }
}

fn insert(map: &VarMap, name: &str, init: &Tensor) -> LeelazResult<Var> {
    let mut data = map
        .data()
        .lock()
        .map_err(|_| LeelazError::training("variable map lock poisoned"))?;
    if data.contains_key(name) {
        return Err(LeelazError::invalid_config(format!(
            "variable {name} registered twice"
        )));
    }
    let var = Var::from_tensor(init)?;
    data.insert(name.to_string(), var.clone());
    Ok(var)
}

/// Snapshot of the variables in `map` keyed by name.
pub fn named_vars(map: &VarMap) -> LeelazResult<Vec<(String, Var)>> {
    let data = map
        .data()
        .lock()
        .map_err(|_| LeelazError::training("variable map lock poisoned"))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}
