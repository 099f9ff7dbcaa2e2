use crate::{
    error::ArgumentError,
    learn::neural_network::activation::Activation,
    tensor::{Tensor, TensorBase},
};
use anyhow::Result;
use derive_more::Display;
use ndarray::{Data, Zip};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Evaluates `input` (the network output) against `target`.
pub trait Criterion<X, T> {
    /// The result of the evaluation.
    type Output;
    /// Evaluates the criterion.
    ///
    /// **Errors**
    ///
    /// Returns an error if the shapes of `input` and `target` do not match.
    fn eval(&self, input: X, target: T) -> Result<Self::Output>;
}

/// Classification accuracy.
///
/// Counts the rows where the index of the largest output matches the index of the largest
/// target value.
#[derive(Default, Debug, Clone, Copy)]
pub struct Accuracy;

impl<S1: Data<Elem = f32>, S2: Data<Elem = f32>> Criterion<&TensorBase<S1>, &TensorBase<S2>>
    for Accuracy
{
    type Output = usize;
    fn eval(&self, input: &TensorBase<S1>, target: &TensorBase<S2>) -> Result<usize> {
        target.check_dim("accuracy", input.dim())?;
        Ok(input
            .argmax()
            .into_iter()
            .zip(target.argmax())
            .filter(|(x, t)| x == t)
            .count())
    }
}

/// Cost functions.
///
/// The cost of a batch is averaged over its rows.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Cost {
    /// `½ Σ (ŷ - y)²`
    Quadratic,
    /// `-Σ y ln ŷ + (1 - y) ln(1 - ŷ)`, paired with [`Activation::Sigmoid`].
    CrossEntropy,
    /// `-Σ y ln ŷ`, paired with [`Activation::Softmax`].
    LogLikelihood,
}

// keeps ln finite when an output saturates
const LOG_EPSILON: f32 = 1e-7;

impl Cost {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Quadratic => 0,
            Self::CrossEntropy => 1,
            Self::LogLikelihood => 2,
        }
    }
    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Quadratic,
            1 => Self::CrossEntropy,
            2 => Self::LogLikelihood,
            _ => return None,
        })
    }
    /// Checks that `activation` can be used with `self`.
    ///
    /// Softmax and log-likelihood require each other, and cross entropy requires a sigmoid. These
    /// pairings are what allows [`.delta()`](Self::delta) to reduce to `ŷ - y`.
    ///
    /// **Errors**
    ///
    /// [`ArgumentError::CostActivationMismatch`] if the pairing is not allowed.
    pub fn check_activation(self, activation: Activation) -> Result<()> {
        let valid = match self {
            Self::LogLikelihood => activation == Activation::Softmax,
            Self::CrossEntropy => activation == Activation::Sigmoid,
            Self::Quadratic => activation != Activation::Softmax,
        };
        if !valid {
            return Err(ArgumentError::CostActivationMismatch {
                activation: activation.to_string(),
                cost: self.to_string(),
            }
            .into());
        }
        Ok(())
    }
    /// The gradient of the cost with respect to the pre-activation `z` of the output layer.
    ///
    /// - Quadratic: `(ŷ - y) ⊙ f'(z)`
    /// - CrossEntropy / LogLikelihood: `ŷ - y`
    ///
    /// **Errors**
    ///
    /// Returns an error if the shapes do not match.
    pub fn delta<S1, S2, S3>(
        self,
        activation: Activation,
        z: &TensorBase<S1>,
        yhat: &TensorBase<S2>,
        y: &TensorBase<S3>,
    ) -> Result<Tensor>
    where
        S1: Data<Elem = f32>,
        S2: Data<Elem = f32>,
        S3: Data<Elem = f32>,
    {
        y.check_dim("cost", yhat.dim())?;
        z.check_dim("cost", yhat.dim())?;
        let mut delta = yhat.to_owned();
        Zip::from(delta.as_array_mut())
            .and(y.as_array())
            .par_for_each(|d, y| *d -= *y);
        if self == Self::Quadratic {
            activation.backward_inplace(z, &mut delta);
        }
        Ok(delta)
    }
}

impl<S1: Data<Elem = f32>, S2: Data<Elem = f32>> Criterion<&TensorBase<S1>, &TensorBase<S2>>
    for Cost
{
    type Output = f32;
    fn eval(&self, yhat: &TensorBase<S1>, y: &TensorBase<S2>) -> Result<f32> {
        y.check_dim("cost", yhat.dim())?;
        let yhat = yhat.as_array();
        let y = y.as_array();
        let total: f32 = match self {
            Self::Quadratic => Zip::from(&yhat).and(&y).fold(0., |acc, yhat, y| {
                let d = yhat - y;
                acc + 0.5 * d * d
            }),
            Self::CrossEntropy => Zip::from(&yhat).and(&y).fold(0., |acc, yhat, y| {
                let yhat = yhat.clamp(LOG_EPSILON, 1. - LOG_EPSILON);
                acc - (y * yhat.ln() + (1. - y) * (1. - yhat).ln())
            }),
            Self::LogLikelihood => Zip::from(&yhat).and(&y).fold(0., |acc, yhat, y| {
                acc - y * yhat.max(LOG_EPSILON).ln()
            }),
        };
        Ok(total / yhat.nrows() as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn accuracy_counts_matching_argmax() {
        let yhat = Tensor::from_shape_vec(3, 2, vec![0.9, 0.1, 0.2, 0.8, 0.6, 0.4]).unwrap();
        let y = Tensor::from_shape_vec(3, 2, vec![1., 0., 1., 0., 1., 0.]).unwrap();
        assert_eq!(Accuracy.eval(&yhat, &y).unwrap(), 2);
    }

    #[test]
    fn cost_activation_pairing() {
        assert!(Cost::LogLikelihood
            .check_activation(Activation::Softmax)
            .is_ok());
        assert!(Cost::LogLikelihood
            .check_activation(Activation::Sigmoid)
            .is_err());
        assert!(Cost::Quadratic.check_activation(Activation::Softmax).is_err());
        assert!(Cost::CrossEntropy
            .check_activation(Activation::Sigmoid)
            .is_ok());
        let error = Cost::CrossEntropy
            .check_activation(Activation::ReLU)
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<ArgumentError>(),
            Some(ArgumentError::CostActivationMismatch { .. })
        ));
    }

    #[test]
    fn quadratic_cost_and_delta() {
        let z = Tensor::from_shape_vec(2, 1, vec![0., 0.]).unwrap();
        let yhat = Tensor::from_shape_vec(2, 1, vec![1., 3.]).unwrap();
        let y = Tensor::from_shape_vec(2, 1, vec![0., 1.]).unwrap();
        let cost = Cost::Quadratic.eval(&yhat, &y).unwrap();
        assert_relative_eq!(cost, (0.5 + 2.) / 2.);
        let delta = Cost::Quadratic
            .delta(Activation::Identity, &z, &yhat, &y)
            .unwrap();
        assert_eq!(delta.as_slice(), &[1., 2.]);
    }

    #[test]
    fn log_likelihood_cost() {
        let yhat = Tensor::from_shape_vec(1, 2, vec![0.25, 0.75]).unwrap();
        let y = Tensor::from_shape_vec(1, 2, vec![0., 1.]).unwrap();
        let cost = Cost::LogLikelihood.eval(&yhat, &y).unwrap();
        assert_relative_eq!(cost, -(0.75f32).ln(), epsilon = 1e-6);
    }
}
