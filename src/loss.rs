//! Training objectives and the evaluation metric.

use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::error::LeelazResult;

/// Mean softmax cross-entropy of `logits` against the target distribution.
pub fn policy_loss(logits: &Tensor, target: &Tensor) -> LeelazResult<Tensor> {
    let log_probs = log_softmax(logits, D::Minus1)?;
    let per_position = (target * log_probs)?.sum(D::Minus1)?.neg()?;
    Ok(per_position.mean_all()?)
}

/// Mean squared error between the outcome and the predicted value.
pub fn value_loss(prediction: &Tensor, target: &Tensor) -> LeelazResult<Tensor> {
    Ok((target - prediction)?.sqr()?.mean_all()?)
}

/// Fraction of positions whose most likely move is the target's most likely move.
pub fn accuracy(logits: &Tensor, target: &Tensor) -> LeelazResult<f32> {
    let predicted = logits.argmax(D::Minus1)?;
    let expected = target.argmax(D::Minus1)?;
    let correct = predicted.eq(&expected)?.to_dtype(DType::F32)?;
    Ok(correct.mean_all()?.to_scalar::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t(data: &[f32], shape: (usize, usize)) -> Tensor {
        Tensor::from_slice(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_uniform_logits_cost_log_n() {
        let logits = t(&[0.0; 8], (2, 4));
        let target = t(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.5, 0.5], (2, 4));
        let loss: f32 = policy_loss(&logits, &target).unwrap().to_scalar().unwrap();
        assert!((loss - 4.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_confident_correct_policy_is_cheap() {
        let logits = t(&[20.0, 0.0, 0.0], (1, 3));
        let target = t(&[1.0, 0.0, 0.0], (1, 3));
        let loss: f32 = policy_loss(&logits, &target).unwrap().to_scalar().unwrap();
        assert!(loss < 1e-6);
    }

    #[test]
    fn test_value_loss_range() {
        let prediction = t(&[1.0, -1.0], (2, 1));
        let target = t(&[-1.0, -1.0], (2, 1));
        let loss: f32 = value_loss(&prediction, &target).unwrap().to_scalar().unwrap();
        // (4 + 0) / 2
        assert_eq!(loss, 2.0);
    }

    #[test]
    fn test_accuracy_counts_argmax_matches() {
        let logits = t(&[0.9, 0.1, 0.2, 0.8, 0.7, 0.3, 0.1, 0.9], (4, 2));
        let target = t(&[1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0], (4, 2));
        assert_eq!(accuracy(&logits, &target).unwrap(), 0.75);
    }
}
