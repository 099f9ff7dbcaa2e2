use super::{layer::Gradient, Network};
use crate::error::{ArgumentError, ShapeError};
use anyhow::Result;
use derive_more::Display;
use ndarray::{Array1, ArrayView1, ArrayViewMut1, Zip};
use rand::RngCore;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

fn check_learning_rate(learning_rate: f32) -> Result<f32> {
    if !(learning_rate.is_finite() && learning_rate > 0.) {
        return Err(ArgumentError::out_of_range("learning_rate", learning_rate, "(0, ∞)").into());
    }
    Ok(learning_rate)
}

fn check_decay(name: &'static str, value: f32) -> Result<f32> {
    if !(0. ..1.).contains(&value) {
        return Err(ArgumentError::out_of_range(name, value, "[0, 1)").into());
    }
    Ok(value)
}

fn check_epsilon(epsilon: f32) -> Result<f32> {
    if !(epsilon.is_finite() && epsilon > 0.) {
        return Err(ArgumentError::out_of_range("epsilon", epsilon, "(0, ∞)").into());
    }
    Ok(epsilon)
}

fn check_l2(l2: f32) -> Result<f32> {
    if !(l2.is_finite() && l2 >= 0.) {
        return Err(ArgumentError::out_of_range("l2", l2, "[0, ∞)").into());
    }
    Ok(l2)
}

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`SGD`].
    pub struct SGDBuilder {
        learning_rate: f32,
        l2: f32,
    }

    impl SGDBuilder {
        pub(super) fn new() -> Self {
            Self {
                learning_rate: 0.1,
                l2: 0.,
            }
        }
        /// The learning rate. Default is 0.1.
        pub fn learning_rate(self, learning_rate: f32) -> Self {
            Self {
                learning_rate,
                ..self
            }
        }
        /// L2 regularization strength, applied to the weights. Default is 0.
        pub fn l2(self, l2: f32) -> Self {
            Self { l2, ..self }
        }
        /// Builds the optimizer.
        ///
        /// **Errors**
        ///
        /// The learning rate must be positive and `l2` must not be negative.
        pub fn build(self) -> Result<SGD> {
            let Self { learning_rate, l2 } = self;
            Ok(SGD {
                learning_rate: check_learning_rate(learning_rate)?,
                l2: check_l2(l2)?,
            })
        }
    }

    /// Builder for creating a [`Momentum`].
    pub struct MomentumBuilder {
        learning_rate: f32,
        momentum: f32,
        l2: f32,
    }

    impl MomentumBuilder {
        pub(super) fn new() -> Self {
            Self {
                learning_rate: 0.1,
                momentum: 0.9,
                l2: 0.,
            }
        }
        /// The learning rate. Default is 0.1.
        pub fn learning_rate(self, learning_rate: f32) -> Self {
            Self {
                learning_rate,
                ..self
            }
        }
        /// The momentum. Default is 0.9.
        pub fn momentum(self, momentum: f32) -> Self {
            Self { momentum, ..self }
        }
        /// L2 regularization strength, applied to the weights. Default is 0.
        pub fn l2(self, l2: f32) -> Self {
            Self { l2, ..self }
        }
        /// Builds the optimizer.
        ///
        /// **Errors**
        ///
        /// The learning rate must be positive, the momentum in `[0, 1)` and `l2` must not be
        /// negative.
        pub fn build(self) -> Result<Momentum> {
            let Self {
                learning_rate,
                momentum,
                l2,
            } = self;
            Ok(Momentum {
                learning_rate: check_learning_rate(learning_rate)?,
                momentum: check_decay("momentum", momentum)?,
                l2: check_l2(l2)?,
            })
        }
    }

    /// Builder for creating an [`AdaGrad`].
    pub struct AdaGradBuilder {
        learning_rate: f32,
        epsilon: f32,
    }

    impl AdaGradBuilder {
        pub(super) fn new() -> Self {
            Self {
                learning_rate: 0.1,
                epsilon: 1e-8,
            }
        }
        /// The learning rate. Default is 0.1.
        pub fn learning_rate(self, learning_rate: f32) -> Self {
            Self {
                learning_rate,
                ..self
            }
        }
        /// Added to the accumulated squared gradient. Default is 1e-8.
        pub fn epsilon(self, epsilon: f32) -> Self {
            Self { epsilon, ..self }
        }
        /// Builds the optimizer.
        ///
        /// **Errors**
        ///
        /// The learning rate and epsilon must be positive.
        pub fn build(self) -> Result<AdaGrad> {
            let Self {
                learning_rate,
                epsilon,
            } = self;
            Ok(AdaGrad {
                learning_rate: check_learning_rate(learning_rate)?,
                epsilon: check_epsilon(epsilon)?,
            })
        }
    }

    /// Builder for creating a [`RMSProp`].
    pub struct RMSPropBuilder {
        learning_rate: f32,
        rho: f32,
        epsilon: f32,
    }

    impl RMSPropBuilder {
        pub(super) fn new() -> Self {
            Self {
                learning_rate: 0.01,
                rho: 0.9,
                epsilon: 1e-8,
            }
        }
        /// The learning rate. Default is 0.01.
        pub fn learning_rate(self, learning_rate: f32) -> Self {
            Self {
                learning_rate,
                ..self
            }
        }
        /// Decay of the squared gradient average. Default is 0.9.
        pub fn rho(self, rho: f32) -> Self {
            Self { rho, ..self }
        }
        /// Default is 1e-8.
        pub fn epsilon(self, epsilon: f32) -> Self {
            Self { epsilon, ..self }
        }
        /// Builds the optimizer.
        ///
        /// **Errors**
        ///
        /// The learning rate and epsilon must be positive and rho in `[0, 1)`.
        pub fn build(self) -> Result<RMSProp> {
            let Self {
                learning_rate,
                rho,
                epsilon,
            } = self;
            Ok(RMSProp {
                learning_rate: check_learning_rate(learning_rate)?,
                rho: check_decay("rho", rho)?,
                epsilon: check_epsilon(epsilon)?,
            })
        }
    }

    /// Builder for creating an [`AdaDelta`].
    pub struct AdaDeltaBuilder {
        rho: f32,
        epsilon: f32,
    }

    impl AdaDeltaBuilder {
        pub(super) fn new() -> Self {
            Self {
                rho: 0.95,
                epsilon: 1e-6,
            }
        }
        /// Decay of both running averages. Default is 0.95.
        pub fn rho(self, rho: f32) -> Self {
            Self { rho, ..self }
        }
        /// Default is 1e-6.
        pub fn epsilon(self, epsilon: f32) -> Self {
            Self { epsilon, ..self }
        }
        /// Builds the optimizer.
        ///
        /// **Errors**
        ///
        /// Epsilon must be positive and rho in `[0, 1)`.
        pub fn build(self) -> Result<AdaDelta> {
            let Self { rho, epsilon } = self;
            Ok(AdaDelta {
                rho: check_decay("rho", rho)?,
                epsilon: check_epsilon(epsilon)?,
            })
        }
    }

    /// Builder for creating an [`Adam`] or an [`AdaMax`].
    pub struct AdamBuilder {
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    }

    impl AdamBuilder {
        pub(super) fn new(learning_rate: f32) -> Self {
            Self {
                learning_rate,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
            }
        }
        /// The learning rate. Default is 0.001 for Adam and 0.002 for AdaMax.
        pub fn learning_rate(self, learning_rate: f32) -> Self {
            Self {
                learning_rate,
                ..self
            }
        }
        /// Decay of the first moment. Default is 0.9.
        pub fn beta1(self, beta1: f32) -> Self {
            Self { beta1, ..self }
        }
        /// Decay of the second moment. Default is 0.999.
        pub fn beta2(self, beta2: f32) -> Self {
            Self { beta2, ..self }
        }
        /// Default is 1e-8. Not used by AdaMax.
        pub fn epsilon(self, epsilon: f32) -> Self {
            Self { epsilon, ..self }
        }
        /// Builds an Adam optimizer.
        ///
        /// **Errors**
        ///
        /// The learning rate and epsilon must be positive and both betas in `[0, 1)`.
        pub fn build(self) -> Result<Adam> {
            let Self {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } = self;
            Ok(Adam {
                learning_rate: check_learning_rate(learning_rate)?,
                beta1: check_decay("beta1", beta1)?,
                beta2: check_decay("beta2", beta2)?,
                epsilon: check_epsilon(epsilon)?,
            })
        }
        /// Builds an AdaMax optimizer.
        ///
        /// **Errors**
        ///
        /// The learning rate must be positive and both betas in `[0, 1)`.
        pub fn build_ada_max(self) -> Result<AdaMax> {
            let Self {
                learning_rate,
                beta1,
                beta2,
                ..
            } = self;
            Ok(AdaMax {
                learning_rate: check_learning_rate(learning_rate)?,
                beta1: check_decay("beta1", beta1)?,
                beta2: check_decay("beta2", beta2)?,
            })
        }
    }
}
use builder::*;

/// Per parameter array state.
///
/// `first` and `second` are only allocated for the algorithms that use them.
#[derive(Debug, Clone, PartialEq)]
struct State {
    step: i32,
    first: Array1<f32>,
    second: Array1<f32>,
}

impl State {
    fn new(len: usize, buffers: usize) -> Self {
        let buffer = |i| Array1::zeros(if buffers > i { len } else { 0 });
        Self {
            step: 0,
            first: buffer(0),
            second: buffer(1),
        }
    }
}

trait UpdateRule {
    /// The number of state arrays per parameter array.
    fn buffers(&self) -> usize;
    /// Updates `w` with the gradient `g`. L2 regularization is only applied when `decay` is true.
    fn update(&self, w: ArrayViewMut1<f32>, g: ArrayView1<f32>, state: &mut State, decay: bool);
}

/// Stochastic Gradient Descent.
///
/// `w -= η (g + λ w)`
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SGD {
    learning_rate: f32,
    l2: f32,
}

impl Default for SGD {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            l2: 0.,
        }
    }
}

impl SGD {
    /// An SGD builder.
    pub fn builder() -> SGDBuilder {
        SGDBuilder::new()
    }
    /// The learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
    /// The L2 regularization strength.
    pub fn l2(&self) -> f32 {
        self.l2
    }
}

impl UpdateRule for SGD {
    fn buffers(&self) -> usize {
        0
    }
    fn update(&self, w: ArrayViewMut1<f32>, g: ArrayView1<f32>, _: &mut State, decay: bool) {
        let (lr, l2) = (self.learning_rate, if decay { self.l2 } else { 0. });
        Zip::from(w).and(g).par_for_each(|w, g| {
            *w -= lr * (g + l2 * *w);
        });
    }
}

/// SGD with momentum.
///
/// `v = μ v - η (g + λ w)`, `w += v`
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Momentum {
    learning_rate: f32,
    momentum: f32,
    l2: f32,
}

impl Momentum {
    /// A Momentum builder.
    pub fn builder() -> MomentumBuilder {
        MomentumBuilder::new()
    }
    /// The learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
    /// The momentum.
    pub fn momentum(&self) -> f32 {
        self.momentum
    }
    /// The L2 regularization strength.
    pub fn l2(&self) -> f32 {
        self.l2
    }
}

impl UpdateRule for Momentum {
    fn buffers(&self) -> usize {
        1
    }
    fn update(&self, w: ArrayViewMut1<f32>, g: ArrayView1<f32>, state: &mut State, decay: bool) {
        let (lr, mu, l2) = (
            self.learning_rate,
            self.momentum,
            if decay { self.l2 } else { 0. },
        );
        Zip::from(w)
            .and(g)
            .and(&mut state.first)
            .par_for_each(|w, g, v| {
                *v = mu * *v - lr * (g + l2 * *w);
                *w += *v;
            });
    }
}

/// AdaGrad.
///
/// `s += g²`, `w -= η g / √(s + ε)`
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdaGrad {
    learning_rate: f32,
    epsilon: f32,
}

impl AdaGrad {
    /// An AdaGrad builder.
    pub fn builder() -> AdaGradBuilder {
        AdaGradBuilder::new()
    }
    /// The learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
    /// Epsilon.
    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }
}

impl UpdateRule for AdaGrad {
    fn buffers(&self) -> usize {
        1
    }
    fn update(&self, w: ArrayViewMut1<f32>, g: ArrayView1<f32>, state: &mut State, _: bool) {
        let (lr, eps) = (self.learning_rate, self.epsilon);
        Zip::from(w)
            .and(g)
            .and(&mut state.first)
            .par_for_each(|w, g, s| {
                *s += g * g;
                *w -= lr * g / (*s + eps).sqrt();
            });
    }
}

/// RMSProp.
///
/// `s = ρ s + (1 - ρ) g²`, `w -= η g / √(s + ε)`
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RMSProp {
    learning_rate: f32,
    rho: f32,
    epsilon: f32,
}

impl RMSProp {
    /// A RMSProp builder.
    pub fn builder() -> RMSPropBuilder {
        RMSPropBuilder::new()
    }
    /// The learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
    /// Rho.
    pub fn rho(&self) -> f32 {
        self.rho
    }
    /// Epsilon.
    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }
}

impl UpdateRule for RMSProp {
    fn buffers(&self) -> usize {
        1
    }
    fn update(&self, w: ArrayViewMut1<f32>, g: ArrayView1<f32>, state: &mut State, _: bool) {
        let (lr, rho, eps) = (self.learning_rate, self.rho, self.epsilon);
        Zip::from(w)
            .and(g)
            .and(&mut state.first)
            .par_for_each(|w, g, s| {
                *s = rho * *s + (1. - rho) * g * g;
                *w -= lr * g / (*s + eps).sqrt();
            });
    }
}

/// AdaDelta.
///
/// `s = ρ s + (1 - ρ) g²`, `Δ = -√(u + ε) / √(s + ε) g`, `u = ρ u + (1 - ρ) Δ²`, `w += Δ`
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdaDelta {
    rho: f32,
    epsilon: f32,
}

impl AdaDelta {
    /// An AdaDelta builder.
    pub fn builder() -> AdaDeltaBuilder {
        AdaDeltaBuilder::new()
    }
    /// Rho.
    pub fn rho(&self) -> f32 {
        self.rho
    }
    /// Epsilon.
    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }
}

impl UpdateRule for AdaDelta {
    fn buffers(&self) -> usize {
        2
    }
    fn update(&self, w: ArrayViewMut1<f32>, g: ArrayView1<f32>, state: &mut State, _: bool) {
        let (rho, eps) = (self.rho, self.epsilon);
        Zip::from(w)
            .and(g)
            .and(&mut state.first)
            .and(&mut state.second)
            .par_for_each(|w, g, s, u| {
                *s = rho * *s + (1. - rho) * g * g;
                let delta = -(*u + eps).sqrt() / (*s + eps).sqrt() * g;
                *u = rho * *u + (1. - rho) * delta * delta;
                *w += delta;
            });
    }
}

/// Adam.
///
/// `m = β₁ m + (1 - β₁) g`, `v = β₂ v + (1 - β₂) g²`, `w -= η m̂ / (√v̂ + ε)` where the hat
/// denotes bias correction by the step count.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
}

impl Adam {
    /// An Adam builder.
    pub fn builder() -> AdamBuilder {
        AdamBuilder::new(0.001)
    }
    /// The learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
    /// Beta 1.
    pub fn beta1(&self) -> f32 {
        self.beta1
    }
    /// Beta 2.
    pub fn beta2(&self) -> f32 {
        self.beta2
    }
    /// Epsilon.
    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }
}

impl UpdateRule for Adam {
    fn buffers(&self) -> usize {
        2
    }
    fn update(&self, w: ArrayViewMut1<f32>, g: ArrayView1<f32>, state: &mut State, _: bool) {
        state.step += 1;
        let (lr, b1, b2, eps) = (self.learning_rate, self.beta1, self.beta2, self.epsilon);
        let c1 = 1. - b1.powi(state.step);
        let c2 = 1. - b2.powi(state.step);
        Zip::from(w)
            .and(g)
            .and(&mut state.first)
            .and(&mut state.second)
            .par_for_each(|w, g, m, v| {
                *m = b1 * *m + (1. - b1) * g;
                *v = b2 * *v + (1. - b2) * g * g;
                *w -= lr * (*m / c1) / ((*v / c2).sqrt() + eps);
            });
    }
}

/// AdaMax, the infinity norm variant of [`Adam`].
///
/// `m = β₁ m + (1 - β₁) g`, `u = max(β₂ u, |g|)`, `w -= η / (1 - β₁ᵗ) m / u`
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdaMax {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
}

impl AdaMax {
    /// An AdaMax builder.
    pub fn builder() -> AdamBuilder {
        AdamBuilder::new(0.002)
    }
    /// The learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
    /// Beta 1.
    pub fn beta1(&self) -> f32 {
        self.beta1
    }
    /// Beta 2.
    pub fn beta2(&self) -> f32 {
        self.beta2
    }
}

impl UpdateRule for AdaMax {
    fn buffers(&self) -> usize {
        2
    }
    fn update(&self, w: ArrayViewMut1<f32>, g: ArrayView1<f32>, state: &mut State, _: bool) {
        state.step += 1;
        let (b1, b2) = (self.beta1, self.beta2);
        let lr = self.learning_rate / (1. - b1.powi(state.step));
        Zip::from(w)
            .and(g)
            .and(&mut state.first)
            .and(&mut state.second)
            .par_for_each(|w, g, m, u| {
                *m = b1 * *m + (1. - b1) * g;
                *u = (b2 * *u).max(g.abs());
                // u is only 0 while every gradient seen so far was 0
                if *u > 0. {
                    *w -= lr * *m / *u;
                }
            });
    }
}

/// A training algorithm and its hyperparameters.
#[derive(Debug, Display, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TrainingAlgorithm {
    /// [`SGD`]
    #[display(fmt = "SGD")]
    SGD(SGD),
    /// [`Momentum`]
    #[display(fmt = "Momentum")]
    Momentum(Momentum),
    /// [`AdaGrad`]
    #[display(fmt = "AdaGrad")]
    AdaGrad(AdaGrad),
    /// [`RMSProp`]
    #[display(fmt = "RMSProp")]
    RMSProp(RMSProp),
    /// [`AdaDelta`]
    #[display(fmt = "AdaDelta")]
    AdaDelta(AdaDelta),
    /// [`Adam`]
    #[display(fmt = "Adam")]
    Adam(Adam),
    /// [`AdaMax`]
    #[display(fmt = "AdaMax")]
    AdaMax(AdaMax),
}

impl Default for TrainingAlgorithm {
    fn default() -> Self {
        Self::SGD(SGD::default())
    }
}

macro_rules! impl_from_algorithm {
    ($($x:ident),*) => {
        $(
            impl From<$x> for TrainingAlgorithm {
                fn from(algorithm: $x) -> Self {
                    Self::$x(algorithm)
                }
            }
        )*
    };
}

impl_from_algorithm!(SGD, Momentum, AdaGrad, RMSProp, AdaDelta, Adam, AdaMax);

impl TrainingAlgorithm {
    fn rule(&self) -> &dyn UpdateRule {
        match self {
            Self::SGD(x) => x,
            Self::Momentum(x) => x,
            Self::AdaGrad(x) => x,
            Self::RMSProp(x) => x,
            Self::AdaDelta(x) => x,
            Self::Adam(x) => x,
            Self::AdaMax(x) => x,
        }
    }
}

/// A stateful optimizer.
///
/// Keeps the state of the [`TrainingAlgorithm`] for each parameter array of a network, keyed by
/// the index of the layer in [`Network::layers()`]. State is allocated on the first update of
/// each layer and lives until [`.reset()`](Self::reset).
#[derive(Debug, Clone)]
pub struct Optimizer {
    algorithm: TrainingAlgorithm,
    states: Vec<Option<[State; 2]>>,
}

impl Optimizer {
    /// Creates an optimizer for `algorithm`.
    pub fn new(algorithm: impl Into<TrainingAlgorithm>) -> Self {
        Self {
            algorithm: algorithm.into(),
            states: Vec::new(),
        }
    }
    /// The algorithm.
    pub fn algorithm(&self) -> &TrainingAlgorithm {
        &self.algorithm
    }
    /// Updates the parameters of `network` with `gradients`.
    ///
    /// `gradients` should already be averaged over the batch, see [`Gradient::scale()`].
    ///
    /// **Errors**
    ///
    /// There must be one gradient per layer, matching the lengths of its parameters.
    pub fn update(&mut self, network: &mut Network, gradients: &[Option<Gradient>]) -> Result<()> {
        let mut layers = network.layers_mut();
        if gradients.len() != layers.len() {
            return Err(ShapeError::new("optimizer", &[layers.len()], &[gradients.len()]).into());
        }
        if self.states.len() != layers.len() {
            self.states = vec![None; layers.len()];
        }
        let rule = self.algorithm.rule();
        for ((layer, gradient), state) in layers
            .iter_mut()
            .zip(gradients)
            .zip(self.states.iter_mut())
        {
            let (Some(gradient), Some((weights, biases))) = (gradient, layer.parameters_mut())
            else {
                continue;
            };
            if gradient.weights.len() != weights.len() || gradient.biases.len() != biases.len() {
                return Err(ShapeError::new(
                    "optimizer",
                    &[weights.len(), biases.len()],
                    &[gradient.weights.len(), gradient.biases.len()],
                )
                .into());
            }
            let [weight_state, bias_state] = state.get_or_insert_with(|| {
                [
                    State::new(weights.len(), rule.buffers()),
                    State::new(biases.len(), rule.buffers()),
                ]
            });
            rule.update(weights.view_mut(), gradient.weights.view(), weight_state, true);
            rule.update(biases.view_mut(), gradient.biases.view(), bias_state, false);
        }
        Ok(())
    }
    /// Clears the state.
    pub fn reset(&mut self) {
        self.states.clear();
    }
    /// Reinitializes the parameters of `network` and clears the state.
    pub fn reset_weights(&mut self, network: &mut Network, rng: &mut dyn RngCore) {
        network.reset_weights(rng);
        self.reset();
    }
}
