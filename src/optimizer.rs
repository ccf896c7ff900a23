//! Momentum SGD with optional Nesterov update.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::Optimizer;

use crate::config::OptimizerSettings;
use crate::error::{LeelazError, LeelazResult};

/// Hyperparameters of [`NesterovSgd`].
#[derive(Debug, Clone, Copy)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
    pub nesterov: bool,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 0.05,
            momentum: 0.9,
            nesterov: true,
        }
    }
}

impl From<&OptimizerSettings> for ParamsSgd {
    fn from(settings: &OptimizerSettings) -> Self {
        Self {
            lr: settings.learning_rate,
            momentum: settings.momentum,
            nesterov: settings.nesterov,
        }
    }
}

#[derive(Debug)]
struct VarAccum {
    var: Var,
    accum: Tensor,
}

/// Momentum SGD.
///
/// Per variable, with gradient `g`:
///
/// ```text
/// accum = momentum * accum + g
/// var  -= lr * (g + momentum * accum)   // nesterov
/// var  -= lr * accum                    // classic
/// ```
#[derive(Debug)]
pub struct NesterovSgd {
    vars: Vec<VarAccum>,
    params: ParamsSgd,
}

impl Optimizer for NesterovSgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let accum = var.zeros_like()?;
                Ok(VarAccum { var, accum })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let ParamsSgd {
            lr,
            momentum,
            nesterov,
        } = self.params;
        for slot in self.vars.iter_mut() {
            let Some(grad) = grads.get(&slot.var) else {
                continue;
            };
            let accum = ((&slot.accum * momentum)? + grad)?;
            let update = if nesterov {
                (grad + (&accum * momentum)?)?
            } else {
                accum.clone()
            };
            slot.var.set(&slot.var.sub(&(update * lr)?)?)?;
            slot.accum = accum;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

impl NesterovSgd {
    /// Build the optimizer over `vars` from the run configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the momentum buffers cannot be allocated.
    pub fn from_settings(vars: Vec<Var>, settings: &OptimizerSettings) -> LeelazResult<Self> {
        let opt = <Self as Optimizer>::new(vars, ParamsSgd::from(settings))
            .map_err(|e| LeelazError::training(format!("Failed to create optimizer: {e}")))?;
        Ok(opt)
    }

    /// Compute gradients of `loss` and apply one update.
    pub fn minimize(&mut self, loss: &Tensor) -> LeelazResult<()> {
        self.backward_step(loss)
            .map_err(|e| LeelazError::training(format!("Optimizer step failed: {e}")))
    }

    /// Number of variables the optimizer updates
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
