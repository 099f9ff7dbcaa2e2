use crate::tensor::{Tensor, TensorBase};
use derive_more::Display;
use ndarray::{Data, DataMut, Zip};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Activation functions.
///
/// Each layer applies its activation to the pre-activation `z`, producing `a = f(z)`.
/// [`Softmax`](Activation::Softmax) normalizes each row and may only be used by output layers
/// paired with the log-likelihood cost.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Activation {
    /// `f(z) = z`
    Identity,
    /// `f(z) = 1 / (1 + e^-z)`
    Sigmoid,
    /// `f(z) = tanh(z)`
    Tanh,
    /// `f(z) = 1.7159 tanh(2z / 3)`
    LeCunTanh,
    /// `f(z) = max(0, z)`
    ReLU,
    /// `f(z) = z` if `z > 0`, else `0.01 z`
    LeakyReLU,
    /// `f(z) = |z|`
    AbsoluteReLU,
    /// `f(z) = ln(1 + e^z)`
    Softplus,
    /// `f(z) = z` if `z >= 0`, else `e^z - 1`
    ELU,
    /// Row wise `e^z / Σ e^z`.
    Softmax,
}

impl Activation {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Identity => 0,
            Self::Sigmoid => 1,
            Self::Tanh => 2,
            Self::LeCunTanh => 3,
            Self::ReLU => 4,
            Self::LeakyReLU => 5,
            Self::AbsoluteReLU => 6,
            Self::Softplus => 7,
            Self::ELU => 8,
            Self::Softmax => 9,
        }
    }
    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Identity,
            1 => Self::Sigmoid,
            2 => Self::Tanh,
            3 => Self::LeCunTanh,
            4 => Self::ReLU,
            5 => Self::LeakyReLU,
            6 => Self::AbsoluteReLU,
            7 => Self::Softplus,
            8 => Self::ELU,
            9 => Self::Softmax,
            _ => return None,
        })
    }
    /// `f(z)` for a single value.
    ///
    /// [`Softmax`](Activation::Softmax) is not elementwise, see [`.forward()`](Self::forward).
    pub fn activate(self, z: f32) -> f32 {
        match self {
            Self::Identity | Self::Softmax => z,
            Self::Sigmoid => kernels::sigmoid(z),
            Self::Tanh => z.tanh(),
            Self::LeCunTanh => kernels::LECUN_A * (kernels::LECUN_B * z).tanh(),
            Self::ReLU => z.max(0.),
            Self::LeakyReLU => {
                if z > 0. {
                    z
                } else {
                    kernels::LEAKY_SLOPE * z
                }
            }
            Self::AbsoluteReLU => z.abs(),
            Self::Softplus => kernels::softplus(z),
            Self::ELU => {
                if z >= 0. {
                    z
                } else {
                    z.exp() - 1.
                }
            }
        }
    }
    /// `f'(z)` for a single value.
    ///
    /// The softmax jacobian is never materialized, its derivative is reported as 1.
    pub fn derivative(self, z: f32) -> f32 {
        match self {
            Self::Identity | Self::Softmax => 1.,
            Self::Sigmoid => {
                let s = kernels::sigmoid(z);
                s * (1. - s)
            }
            Self::Tanh => {
                let t = z.tanh();
                1. - t * t
            }
            Self::LeCunTanh => {
                let t = (kernels::LECUN_B * z).tanh();
                kernels::LECUN_A * kernels::LECUN_B * (1. - t * t)
            }
            Self::ReLU => {
                if z > 0. {
                    1.
                } else {
                    0.
                }
            }
            Self::LeakyReLU => {
                if z > 0. {
                    1.
                } else {
                    kernels::LEAKY_SLOPE
                }
            }
            Self::AbsoluteReLU => {
                if z >= 0. {
                    1.
                } else {
                    -1.
                }
            }
            Self::Softplus => kernels::sigmoid(z),
            Self::ELU => {
                if z >= 0. {
                    1.
                } else {
                    z.exp()
                }
            }
        }
    }
    /// Computes `a = f(z)`.
    pub fn forward<S: Data<Elem = f32>>(self, z: &TensorBase<S>) -> Tensor {
        if self == Self::Softmax {
            let mut a = z.to_owned();
            Zip::from(a.as_array_mut().rows_mut()).par_for_each(|row| kernels::softmax(row));
            a
        } else {
            z.map(move |z| self.activate(z))
        }
    }
    /// Computes `dy ⊙ f'(z)` inplace into `dy`.
    pub(crate) fn backward_inplace<S1, S2>(self, z: &TensorBase<S1>, dy: &mut TensorBase<S2>)
    where
        S1: Data<Elem = f32>,
        S2: DataMut<Elem = f32>,
    {
        if matches!(self, Self::Identity | Self::Softmax) {
            return;
        }
        Zip::from(dy.as_array_mut())
            .and(z.as_array())
            .par_for_each(|dy, z| *dy *= self.derivative(*z));
    }
}

mod kernels {
    use ndarray::ArrayViewMut1;

    pub const LECUN_A: f32 = 1.7159;
    pub const LECUN_B: f32 = 2. / 3.;
    pub const LEAKY_SLOPE: f32 = 0.01;

    pub fn sigmoid(z: f32) -> f32 {
        1. / (1. + (-z).exp())
    }

    pub fn softplus(z: f32) -> f32 {
        // ln(1 + e^z) without overflowing for large z
        if z > 20. {
            z
        } else {
            z.exp().ln_1p()
        }
    }

    pub fn softmax(mut row: ArrayViewMut1<f32>) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn activation_derivatives_match_finite_differences() {
        let activations = [
            Activation::Identity,
            Activation::Sigmoid,
            Activation::Tanh,
            Activation::LeCunTanh,
            Activation::ReLU,
            Activation::LeakyReLU,
            Activation::AbsoluteReLU,
            Activation::Softplus,
            Activation::ELU,
        ];
        let h = 1e-3f32;
        for activation in activations {
            for z in [-1.7f32, -0.4, 0.3, 1.2] {
                let numeric = (activation.activate(z + h) - activation.activate(z - h)) / (2. * h);
                assert_relative_eq!(
                    activation.derivative(z),
                    numeric,
                    epsilon = 1e-2,
                    max_relative = 1e-2
                );
            }
        }
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let z = Tensor::from_shape_vec(2, 3, vec![1., 2., 3., 1000., 1000., 1000.]).unwrap();
        let a = Activation::Softmax.forward(&z);
        for i in 0..2 {
            assert_relative_eq!(a.row(i).iter().sum::<f32>(), 1., epsilon = 1e-6);
        }
        assert_relative_eq!(a.row(1)[0], 1. / 3., epsilon = 1e-6);
    }

    #[test]
    fn activation_tags_round_trip() {
        for tag in 0..10 {
            assert_eq!(Activation::from_tag(tag).unwrap().tag(), tag);
        }
        assert!(Activation::from_tag(10).is_none());
    }
}
