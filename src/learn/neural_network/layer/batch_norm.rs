use super::{Activity, Gradient, Mode};
use crate::{
    error::{ArgumentError, ShapeError},
    learn::neural_network::activation::Activation,
    tensor::{Shape, Tensor, TensorView},
};
use anyhow::{bail, Result};
use derive_more::Display;
use ndarray::Array1;
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const EPSILON: f32 = 1e-5;

/// How values are grouped for normalization.
#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NormalizationMode {
    /// One mean / variance per channel, over the batch and all spatial positions.
    #[default]
    Spatial,
    /// One mean / variance per value of the sample, over the batch.
    PerActivation,
}

impl NormalizationMode {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Spatial => 0,
            Self::PerActivation => 1,
        }
    }
    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Spatial),
            1 => Some(Self::PerActivation),
            _ => None,
        }
    }
}

// batch statistics of the last training forward pass
#[derive(Debug, Clone)]
struct Cache {
    inv_std: Vec<f32>,
    normalized: Tensor,
}

/// Batch normalization.
///
/// Normalizes each group with the batch mean and variance during training, or with the running
/// statistics during inference, then applies the learned scale `γ` (the weights) and shift `β`
/// (the biases). The running statistics are a cumulative moving average over the training
/// iterations.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    shape: Shape,
    mode: NormalizationMode,
    activation: Activation,
    gamma: Array1<f32>,
    beta: Array1<f32>,
    running_mean: Array1<f32>,
    running_variance: Array1<f32>,
    iteration: usize,
    cache: Option<Cache>,
}

impl BatchNorm {
    /// Creates a new [`BatchNorm`] with `γ = 1` and `β = 0`.
    ///
    /// **Errors**
    ///
    /// Softmax is reserved for output layers.
    pub fn new(input: Shape, mode: NormalizationMode, activation: Activation) -> Result<Self> {
        if activation == Activation::Softmax {
            return Err(ArgumentError::InvalidInput {
                layer: "batch normalization",
                shape: input.to_string(),
                reason: "softmax is only available for output layers",
            }
            .into());
        }
        let groups = Self::groups_of(input, mode);
        Ok(Self {
            shape: input,
            mode,
            activation,
            gamma: Array1::ones(groups),
            beta: Array1::zeros(groups),
            running_mean: Array1::zeros(groups),
            running_variance: Array1::ones(groups),
            iteration: 0,
            cache: None,
        })
    }
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        input: Shape,
        mode: NormalizationMode,
        activation: Activation,
        gamma: Vec<f32>,
        beta: Vec<f32>,
        running_mean: Vec<f32>,
        running_variance: Vec<f32>,
        iteration: usize,
    ) -> Result<Self> {
        let groups = Self::groups_of(input, mode);
        let found = [
            gamma.len(),
            beta.len(),
            running_mean.len(),
            running_variance.len(),
        ];
        if found.iter().any(|len| *len != groups) {
            return Err(
                ShapeError::new("batch normalization parameters", &[groups; 4], &found).into(),
            );
        }
        Ok(Self {
            shape: input,
            mode,
            activation,
            gamma: gamma.into(),
            beta: beta.into(),
            running_mean: running_mean.into(),
            running_variance: running_variance.into(),
            iteration,
            cache: None,
        })
    }
    fn groups_of(shape: Shape, mode: NormalizationMode) -> usize {
        match mode {
            NormalizationMode::Spatial => shape.channels(),
            NormalizationMode::PerActivation => shape.size(),
        }
    }
    // the number of consecutive values of a sample that share a group
    fn span(&self) -> usize {
        match self.mode {
            NormalizationMode::Spatial => self.shape.slice_size(),
            NormalizationMode::PerActivation => 1,
        }
    }
    /// The shape of the input.
    pub fn input_shape(&self) -> Shape {
        self.shape
    }
    /// The shape of the output, equal to the input.
    pub fn output_shape(&self) -> Shape {
        self.shape
    }
    /// The activation applied after the affine transform.
    pub fn activation(&self) -> Activation {
        self.activation
    }
    /// How values are grouped into normalization statistics.
    pub fn mode(&self) -> NormalizationMode {
        self.mode
    }
    /// The number of training forward passes folded into the running statistics.
    pub fn iteration(&self) -> usize {
        self.iteration
    }
    /// The running mean of each group, used in [`Mode::Inference`].
    pub fn running_mean(&self) -> &Array1<f32> {
        &self.running_mean
    }
    /// The running variance of each group.
    pub fn running_variance(&self) -> &Array1<f32> {
        &self.running_variance
    }
    /// The scale `gamma` and the shift `beta`.
    pub fn parameters(&self) -> (&Array1<f32>, &Array1<f32>) {
        (&self.gamma, &self.beta)
    }
    /// The mutable scale `gamma` and shift `beta`.
    pub fn parameters_mut(&mut self) -> (&mut Array1<f32>, &mut Array1<f32>) {
        (&mut self.gamma, &mut self.beta)
    }
    // per group sums of f(value, group) over the batch
    fn group_sums<F>(&self, data: &[f32], f: F) -> Vec<f32>
    where
        F: Fn(usize, f32) -> f32 + Sync,
    {
        let (size, span) = (self.shape.size(), self.span());
        (0..self.gamma.len())
            .into_par_iter()
            .map(|group| {
                data.chunks(size)
                    .flat_map(|sample| sample[group * span..(group + 1) * span].iter())
                    .map(|x| f(group, *x))
                    .sum::<f32>()
            })
            .collect()
    }
    // per group sums of f(a, b, group) over two tensors of the same shape
    fn group_sums2<F>(&self, a: &[f32], b: &[f32], f: F) -> Vec<f32>
    where
        F: Fn(usize, f32, f32) -> f32 + Sync,
    {
        let (size, span) = (self.shape.size(), self.span());
        (0..self.gamma.len())
            .into_par_iter()
            .map(|group| {
                let range = group * span..(group + 1) * span;
                a.chunks(size)
                    .zip(b.chunks(size))
                    .flat_map(|(a, b)| a[range.clone()].iter().zip(&b[range.clone()]))
                    .map(|(a, b)| f(group, *a, *b))
                    .sum::<f32>()
            })
            .collect()
    }
    pub(super) fn forward(&mut self, x: TensorView, mode: Mode) -> Result<Activity> {
        let (mean, inv_std) = match mode {
            Mode::Training => {
                let m = (x.entities() * self.span()) as f32;
                let mean: Vec<f32> = self
                    .group_sums(x.as_slice(), |_, x| x)
                    .into_iter()
                    .map(|sum| sum / m)
                    .collect();
                let variance: Vec<f32> = self
                    .group_sums(x.as_slice(), |g, x| (x - mean[g]).powi(2))
                    .into_iter()
                    .map(|sum| sum / m)
                    .collect();
                self.update_running_statistics(&mean, &variance, m);
                let inv_std: Vec<f32> = variance
                    .iter()
                    .map(|v| (v + EPSILON).sqrt().recip())
                    .collect();
                (mean, inv_std)
            }
            Mode::Inference => {
                self.cache = None;
                let inv_std: Vec<f32> = self
                    .running_variance
                    .iter()
                    .map(|v| (v + EPSILON).sqrt().recip())
                    .collect();
                (self.running_mean.to_vec(), inv_std)
            }
        };
        let (size, span) = (self.shape.size(), self.span());
        let mut normalized = x.to_owned();
        normalized
            .as_slice_mut()
            .par_chunks_mut(size)
            .for_each(|sample| {
                for (i, x) in sample.iter_mut().enumerate() {
                    let g = i / span;
                    *x = (*x - mean[g]) * inv_std[g];
                }
            });
        let gamma = self.gamma.as_slice().unwrap_or_default();
        let beta = self.beta.as_slice().unwrap_or_default();
        let mut z = normalized.clone();
        z.as_slice_mut().par_chunks_mut(size).for_each(|sample| {
            for (i, x) in sample.iter_mut().enumerate() {
                let g = i / span;
                *x = gamma[g] * *x + beta[g];
            }
        });
        if mode == Mode::Training {
            self.cache.replace(Cache {
                inv_std,
                normalized,
            });
        }
        let a = self.activation.forward(&z);
        Ok(Activity { z, a })
    }
    fn update_running_statistics(&mut self, mean: &[f32], variance: &[f32], m: f32) {
        let factor = 1. / (1. + self.iteration as f32);
        // the running variance is unbiased
        let correction = if m > 1. { m / (m - 1.) } else { 1. };
        self.running_mean
            .iter_mut()
            .zip(mean)
            .for_each(|(r, x)| *r = *r * (1. - factor) + x * factor);
        self.running_variance
            .iter_mut()
            .zip(variance)
            .for_each(|(r, x)| *r = *r * (1. - factor) + x * correction * factor);
        self.iteration += 1;
    }
    fn cache(&self, entities: usize) -> Result<&Cache> {
        match self.cache.as_ref() {
            Some(cache) if cache.normalized.entities() == entities => Ok(cache),
            Some(cache) => Err(ShapeError::new(
                "batch normalization backward",
                &[cache.normalized.entities()],
                &[entities],
            )
            .into()),
            None => bail!("batch normalization backward requires a training forward pass"),
        }
    }
    /// `dx = inv_std / m (m dx̂ - Σ dx̂ - x̂ Σ dx̂ x̂)` where `dx̂ = γ δ`
    pub(super) fn backward(&self, delta: TensorView) -> Result<Tensor> {
        let cache = self.cache(delta.entities())?;
        let m = (delta.entities() * self.span()) as f32;
        let gamma = self.gamma.as_slice().unwrap_or_default();
        let x_hat = cache.normalized.as_slice();
        let sum_dx_hat = self.group_sums(delta.as_slice(), |g, dy| dy * gamma[g]);
        let sum_dx_hat_x_hat =
            self.group_sums2(delta.as_slice(), x_hat, |g, dy, x_hat| dy * gamma[g] * x_hat);
        let (size, span) = (self.shape.size(), self.span());
        let inv_std = &cache.inv_std;
        let mut dx = delta.to_owned();
        dx.as_slice_mut()
            .par_chunks_mut(size)
            .zip(x_hat.par_chunks(size))
            .for_each(|(dx, x_hat)| {
                for (i, (dx, x_hat)) in dx.iter_mut().zip(x_hat).enumerate() {
                    let g = i / span;
                    let dx_hat = *dx * gamma[g];
                    *dx = inv_std[g] / m
                        * (m * dx_hat - sum_dx_hat[g] - x_hat * sum_dx_hat_x_hat[g]);
                }
            });
        Ok(dx)
    }
    /// `dγ = Σ δ x̂`, `dβ = Σ δ`
    pub(super) fn compute_gradient(&self, delta: TensorView) -> Result<Gradient> {
        let cache = self.cache(delta.entities())?;
        let weights = self.group_sums2(delta.as_slice(), cache.normalized.as_slice(), |_, dy, x| {
            dy * x
        });
        let biases = self.group_sums(delta.as_slice(), |_, dy| dy);
        Ok(Gradient {
            weights: weights.into(),
            biases: biases.into(),
        })
    }
    pub(super) fn reset(&mut self) {
        self.gamma.fill(1.);
        self.beta.fill(0.);
        self.running_mean.fill(0.);
        self.running_variance.fill(1.);
        self.iteration = 0;
        self.cache = None;
    }
}

impl PartialEq for BatchNorm {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape
            && self.mode == other.mode
            && self.activation == other.activation
            && self.gamma == other.gamma
            && self.beta == other.beta
            && self.running_mean == other.running_mean
            && self.running_variance == other.running_variance
            && self.iteration == other.iteration
    }
}
