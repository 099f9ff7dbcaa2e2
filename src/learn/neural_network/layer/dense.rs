use super::{Activity, Gradient, Initialization};
use crate::{
    error::ArgumentError,
    learn::neural_network::activation::Activation,
    tensor::{checked_product, Shape, Tensor, TensorView},
};
use anyhow::Result;
use ndarray::Array1;
use rand::RngCore;

/// Dense / fully connected layer.
///
/// `z = x · W + b`, where `W` is an `inputs` x `outputs` matrix stored row major and `b` is
/// broadcasted to each row. The input is flattened, so a dense layer accepts any input shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Dense {
    input: Shape,
    output: Shape,
    activation: Activation,
    init: Initialization,
    weights: Array1<f32>,
    biases: Array1<f32>,
}

impl Dense {
    /// Creates a new [`Dense`] with `neurons` outputs.
    ///
    /// The weights are sampled with `init`, the biases are zero.
    ///
    /// **Errors**
    ///
    /// - `neurons` must be positive.
    /// - Softmax is reserved for output layers.
    pub fn new(
        input: Shape,
        neurons: usize,
        activation: Activation,
        init: Initialization,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        if activation == Activation::Softmax {
            return Err(ArgumentError::InvalidInput {
                layer: "fully connected",
                shape: input.to_string(),
                reason: "softmax is only available for output layers",
            }
            .into());
        }
        Self::with_any_activation(input, neurons, activation, init, rng)
    }
    pub(super) fn with_any_activation(
        input: Shape,
        neurons: usize,
        activation: Activation,
        init: Initialization,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        let output = Shape::linear(neurons)?;
        let inputs = input.size();
        let len = checked_product("fully connected weights", &[inputs, neurons])?;
        let weights = init.sample(len, inputs, neurons, rng);
        Ok(Self {
            input,
            output,
            activation,
            init,
            weights,
            biases: Array1::zeros(neurons),
        })
    }
    /// Restores a layer from its parameters.
    ///
    /// **Errors**
    ///
    /// The lengths of `weights` and `biases` must agree with the shapes, and the number of weights
    /// must fit in `usize`.
    pub(crate) fn from_parts(
        input: Shape,
        output: Shape,
        activation: Activation,
        init: Initialization,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> Result<Self> {
        let expected = [
            checked_product("fully connected weights", &[input.size(), output.size()])?,
            output.size(),
        ];
        if !output.is_linear() || [weights.len(), biases.len()] != expected {
            return Err(crate::error::ShapeError::new(
                "fully connected parameters",
                &expected,
                &[weights.len(), biases.len()],
            )
            .into());
        }
        Ok(Self {
            input,
            output,
            activation,
            init,
            weights: weights.into(),
            biases: biases.into(),
        })
    }
    /// The shape of the input.
    pub fn input_shape(&self) -> Shape {
        self.input
    }
    /// The linear shape of the output.
    pub fn output_shape(&self) -> Shape {
        self.output
    }
    /// The activation applied to the output.
    pub fn activation(&self) -> Activation {
        self.activation
    }
    /// The initialization used by [`.reset()`](Self::reset).
    pub fn initialization(&self) -> Initialization {
        self.init
    }
    /// The `inputs x outputs` weights and the biases.
    pub fn parameters(&self) -> (&Array1<f32>, &Array1<f32>) {
        (&self.weights, &self.biases)
    }
    /// The mutable weights and biases.
    pub fn parameters_mut(&mut self) -> (&mut Array1<f32>, &mut Array1<f32>) {
        (&mut self.weights, &mut self.biases)
    }
    // reinterprets the flat weights as the inputs x outputs matrix
    fn matrix(&self) -> Result<TensorView> {
        TensorView::from_slice(
            self.weights.as_slice().unwrap_or_default(),
            self.input.size(),
            self.output.size(),
        )
    }
    pub(super) fn forward(&self, x: TensorView) -> Result<Activity> {
        let z = x.dot_bias(&self.matrix()?, self.biases.as_slice().unwrap_or_default())?;
        let a = self.activation.forward(&z);
        Ok(Activity { z, a })
    }
    /// `dx = δ · Wᵀ`
    pub(super) fn backward(&self, delta: TensorView) -> Result<Tensor> {
        delta.dot_t(&self.matrix()?)
    }
    /// `dW = xᵀ · δ`, `db = Σ δ`
    pub(super) fn compute_gradient(&self, x: TensorView, delta: TensorView) -> Result<Gradient> {
        let weights = x.t_dot(&delta)?.into_vec().into();
        let biases = delta.compress();
        Ok(Gradient { weights, biases })
    }
    pub(super) fn reset(&mut self, rng: &mut dyn RngCore) {
        let (inputs, outputs) = (self.input.size(), self.output.size());
        self.weights = self.init.sample(inputs * outputs, inputs, outputs, rng);
        self.biases.fill(0.);
    }
}
