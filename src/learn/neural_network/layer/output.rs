use super::{Activity, Dense, Initialization};
use crate::{
    learn::{criterion::Cost, neural_network::activation::Activation},
    tensor::{Shape, TensorView},
};
use anyhow::Result;
use rand::RngCore;

/// Output layer, a fully connected layer with a cost function.
///
/// The gradient with respect to the pre-activation is computed by the cost
/// ([`Cost::delta()`]), which reduces to `ŷ - y` for the softmax / log-likelihood and
/// sigmoid / cross entropy pairings.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    dense: Dense,
    cost: Cost,
}

impl Output {
    /// Creates a new [`Output`].
    ///
    /// **Errors**
    ///
    /// See [`Cost::check_activation()`].
    pub fn new(
        input: Shape,
        neurons: usize,
        activation: Activation,
        cost: Cost,
        init: Initialization,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        cost.check_activation(activation)?;
        let dense = Dense::with_any_activation(input, neurons, activation, init, rng)?;
        Ok(Self { dense, cost })
    }
    pub(crate) fn from_parts(dense: Dense, cost: Cost) -> Result<Self> {
        cost.check_activation(dense.activation())?;
        Ok(Self { dense, cost })
    }
    /// The shape of the input.
    pub fn input_shape(&self) -> Shape {
        self.dense.input_shape()
    }
    /// The shape of the output, one value per neuron.
    pub fn output_shape(&self) -> Shape {
        self.dense.output_shape()
    }
    /// The activation of the output neurons.
    pub fn activation(&self) -> Activation {
        self.dense.activation()
    }
    /// The cost the output is trained against.
    pub fn cost(&self) -> Cost {
        self.cost
    }
    /// The underlying fully connected layer.
    pub fn dense(&self) -> &Dense {
        &self.dense
    }
    pub(super) fn dense_mut(&mut self) -> &mut Dense {
        &mut self.dense
    }
    pub(super) fn forward(&self, x: TensorView) -> Result<Activity> {
        self.dense.forward(x)
    }
}
