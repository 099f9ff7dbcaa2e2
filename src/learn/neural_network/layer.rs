//! Layers.
//!
//! The catalog of layers is closed: [`Layer`] is an enum over every kind, matched exhaustively by
//! the graph resolver and the model serializer. Every layer follows the same contract:
//!
//! - [`.forward()`](Layer::forward) computes the pre-activation `z` and the activation
//!   `a = f(z)` for a batch `x`.
//! - [`.delta()`](Layer::delta) turns the gradient with respect to `a` into the gradient with
//!   respect to `z`, `δ = dy ⊙ f'(z)`.
//! - [`.backward()`](Layer::backward) propagates `δ` to the gradient with respect to `x`.
//! - [`.compute_gradient()`](Layer::compute_gradient) computes the gradient of the parameters,
//!   summed over the batch.
//!
//! Layers are constructed from the shape of their input by a [`LayerFactory`], so that the same
//! catalog serves sequential networks and computation graphs.
use super::activation::Activation;
use crate::{
    learn::criterion::Cost,
    tensor::{Shape, Tensor, TensorView},
};
use anyhow::Result;
use derive_more::Display;
use ndarray::Array1;
use rand::RngCore;
use rand_distr::{Distribution, Normal, Uniform};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

mod batch_norm;
mod conv;
mod dense;
mod merge;
mod output;
mod pool;

pub use batch_norm::{BatchNorm, NormalizationMode};
pub use conv::{Conv, Conv2Options};
pub use dense::Dense;
pub use merge::{DepthConcatenation, Sum};
pub use output::Output;
pub use pool::{Pool, PoolingMode};

/// Whether a forward pass is part of training.
///
/// Batch normalization uses batch statistics and caches them for the backward pass during
/// training, and uses its running statistics for inference. Computation graphs only evaluate
/// training branches during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Training forward pass, followed by a backward pass.
    Training,
    /// Inference only.
    Inference,
}

/// The output of a forward pass.
#[derive(Debug, Clone)]
pub struct Activity {
    /// The pre-activation.
    pub z: Tensor,
    /// The activation, `f(z)`.
    pub a: Tensor,
}

/// Gradient of the parameters of a layer, summed over a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradient {
    /// Gradient of the weights.
    pub weights: Array1<f32>,
    /// Gradient of the biases.
    pub biases: Array1<f32>,
}

impl Gradient {
    /// Multiplies both gradients by `alpha`.
    pub fn scale(&mut self, alpha: f32) {
        self.weights.mapv_inplace(|x| x * alpha);
        self.biases.mapv_inplace(|x| x * alpha);
    }
}

/// The kind of a [`Layer`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LayerKind {
    /// [`Dense`]
    FullyConnected,
    /// [`Conv`]
    Convolutional,
    /// [`Pool`]
    Pooling,
    /// [`BatchNorm`]
    BatchNormalization,
    /// [`Output`] with any activation but softmax.
    Output,
    /// [`Output`] with softmax and log-likelihood.
    Softmax,
}

impl LayerKind {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::FullyConnected => 0,
            Self::Convolutional => 1,
            Self::Pooling => 2,
            Self::BatchNormalization => 3,
            Self::Output => 4,
            Self::Softmax => 5,
        }
    }
    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::FullyConnected,
            1 => Self::Convolutional,
            2 => Self::Pooling,
            3 => Self::BatchNormalization,
            4 => Self::Output,
            5 => Self::Softmax,
            _ => return None,
        })
    }
}

/// Weight initialization.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Initialization {
    /// Uniform in `±sqrt(6 / (inputs + outputs))`.
    #[default]
    GlorotUniform,
    /// Normal with `std_dev = sqrt(2 / (inputs + outputs))`.
    GlorotNormal,
    /// Normal with `std_dev = sqrt(2 / inputs)`.
    HeNormal,
    /// Uniform in `±sqrt(6 / inputs)`.
    HeUniform,
    /// Uniform in `±sqrt(3 / inputs)`.
    LeCunUniform,
}

impl Initialization {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::GlorotUniform => 0,
            Self::GlorotNormal => 1,
            Self::HeNormal => 2,
            Self::HeUniform => 3,
            Self::LeCunUniform => 4,
        }
    }
    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::GlorotUniform,
            1 => Self::GlorotNormal,
            2 => Self::HeNormal,
            3 => Self::HeUniform,
            4 => Self::LeCunUniform,
            _ => return None,
        })
    }
    /// Samples `len` weights for a layer with `inputs` fan in and `outputs` fan out.
    pub fn sample(
        self,
        len: usize,
        inputs: usize,
        outputs: usize,
        rng: &mut dyn RngCore,
    ) -> Array1<f32> {
        let inputs = inputs.max(1) as f32;
        let outputs = outputs.max(1) as f32;
        match self {
            Self::GlorotUniform => uniform((6. / (inputs + outputs)).sqrt(), len, rng),
            Self::GlorotNormal => normal((2. / (inputs + outputs)).sqrt(), len, rng),
            Self::HeNormal => normal((2. / inputs).sqrt(), len, rng),
            Self::HeUniform => uniform((6. / inputs).sqrt(), len, rng),
            Self::LeCunUniform => uniform((3. / inputs).sqrt(), len, rng),
        }
    }
}

fn uniform(a: f32, len: usize, rng: &mut dyn RngCore) -> Array1<f32> {
    Uniform::new_inclusive(-a, a)
        .sample_iter(rng)
        .take(len)
        .collect()
}

fn normal(std_dev: f32, len: usize, rng: &mut dyn RngCore) -> Array1<f32> {
    match Normal::new(0., std_dev) {
        Ok(normal) => normal.sample_iter(rng).take(len).collect(),
        // std_dev is always finite and positive
        Err(_) => Array1::zeros(len),
    }
}

/// A layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    /// Fully connected.
    FullyConnected(Dense),
    /// Convolutional.
    Convolutional(Conv),
    /// 2x2 pooling.
    Pooling(Pool),
    /// Batch normalization.
    BatchNormalization(BatchNorm),
    /// Output (fully connected with a cost function).
    Output(Output),
}

macro_rules! dispatch {
    ($layer:expr, $x:ident => $e:expr) => {
        match $layer {
            Layer::FullyConnected($x) => $e,
            Layer::Convolutional($x) => $e,
            Layer::Pooling($x) => $e,
            Layer::BatchNormalization($x) => $e,
            Layer::Output($x) => $e,
        }
    };
}

impl Layer {
    /// The kind of the layer.
    pub fn kind(&self) -> LayerKind {
        match self {
            Self::FullyConnected(_) => LayerKind::FullyConnected,
            Self::Convolutional(_) => LayerKind::Convolutional,
            Self::Pooling(_) => LayerKind::Pooling,
            Self::BatchNormalization(_) => LayerKind::BatchNormalization,
            Self::Output(output) => {
                if output.activation() == Activation::Softmax {
                    LayerKind::Softmax
                } else {
                    LayerKind::Output
                }
            }
        }
    }
    /// The shape of one input sample.
    pub fn input_shape(&self) -> Shape {
        dispatch!(self, x => x.input_shape())
    }
    /// The shape of one output sample.
    pub fn output_shape(&self) -> Shape {
        dispatch!(self, x => x.output_shape())
    }
    /// The activation applied to the output.
    pub fn activation(&self) -> Activation {
        dispatch!(self, x => x.activation())
    }
    /// The cost function, for output layers.
    pub fn cost(&self) -> Option<Cost> {
        if let Self::Output(output) = self {
            Some(output.cost())
        } else {
            None
        }
    }
    /// The weights, empty if the layer has no parameters.
    pub fn weights(&self) -> &[f32] {
        self.parameters().map_or(&[][..], |(w, _)| w)
    }
    /// The biases, empty if the layer has no parameters.
    pub fn biases(&self) -> &[f32] {
        self.parameters().map_or(&[][..], |(_, b)| b)
    }
    fn parameters(&self) -> Option<(&[f32], &[f32])> {
        let (weights, biases) = match self {
            Self::FullyConnected(dense) => dense.parameters(),
            Self::Convolutional(conv) => conv.parameters(),
            Self::Pooling(_) => return None,
            Self::BatchNormalization(norm) => norm.parameters(),
            Self::Output(output) => output.dense().parameters(),
        };
        Some((weights.as_slice()?, biases.as_slice()?))
    }
    /// Mutable weights and biases, `None` if the layer has no parameters.
    pub fn parameters_mut(&mut self) -> Option<(&mut Array1<f32>, &mut Array1<f32>)> {
        match self {
            Self::FullyConnected(dense) => Some(dense.parameters_mut()),
            Self::Convolutional(conv) => Some(conv.parameters_mut()),
            Self::Pooling(_) => None,
            Self::BatchNormalization(norm) => Some(norm.parameters_mut()),
            Self::Output(output) => Some(output.dense_mut().parameters_mut()),
        }
    }
    /// The number of trainable values.
    pub fn parameters_len(&self) -> usize {
        self.weights().len() + self.biases().len()
    }
    /// Whether any parameter is NaN or infinite.
    pub fn is_in_numeric_overflow(&self) -> bool {
        self.weights()
            .iter()
            .chain(self.biases())
            .any(|x| !x.is_finite())
    }
    /// Computes `(z, a)` for the batch `x`.
    ///
    /// **Errors**
    ///
    /// `x.length()` must equal the size of the input shape.
    pub fn forward(&mut self, x: TensorView, mode: Mode) -> Result<Activity> {
        x.check_dim("forward", [x.entities(), self.input_shape().size()])?;
        match self {
            Self::FullyConnected(dense) => dense.forward(x),
            Self::Convolutional(conv) => conv.forward(x),
            Self::Pooling(pool) => pool.forward(x),
            Self::BatchNormalization(norm) => norm.forward(x, mode),
            Self::Output(output) => output.forward(x),
        }
    }
    /// Computes `δ = dy ⊙ f'(z)`, where `dy` is the gradient with respect to the activation.
    ///
    /// **Errors**
    ///
    /// The shapes of `z` and `dy` must match.
    pub fn delta(&self, z: TensorView, dy: TensorView) -> Result<Tensor> {
        dy.check_dim("delta", z.dim())?;
        let mut delta = dy.to_owned();
        self.activation().backward_inplace(&z, &mut delta);
        Ok(delta)
    }
    /// Computes the gradient with respect to the input `x` from `delta`.
    ///
    /// **Errors**
    ///
    /// `x` must match the input shape and `delta` the output shape, with the same number of
    /// entities. Batch normalization requires a preceding training forward pass.
    pub fn backward(&self, x: TensorView, delta: TensorView) -> Result<Tensor> {
        self.check_backward(&x, &delta)?;
        match self {
            Self::FullyConnected(dense) => dense.backward(delta),
            Self::Convolutional(conv) => conv.backward(delta),
            Self::Pooling(pool) => pool.backward(x, delta),
            Self::BatchNormalization(norm) => norm.backward(delta),
            Self::Output(output) => output.dense().backward(delta),
        }
    }
    /// Computes the gradient of the parameters, summed over the batch.
    ///
    /// Returns `None` for layers without parameters.
    ///
    /// **Errors**
    ///
    /// See [`.backward()`](Self::backward).
    pub fn compute_gradient(&self, x: TensorView, delta: TensorView) -> Result<Option<Gradient>> {
        self.check_backward(&x, &delta)?;
        match self {
            Self::FullyConnected(dense) => dense.compute_gradient(x, delta).map(Some),
            Self::Convolutional(conv) => conv.compute_gradient(x, delta).map(Some),
            Self::Pooling(_) => Ok(None),
            Self::BatchNormalization(norm) => norm.compute_gradient(delta).map(Some),
            Self::Output(output) => output.dense().compute_gradient(x, delta).map(Some),
        }
    }
    fn check_backward(&self, x: &TensorView, delta: &TensorView) -> Result<()> {
        let entities = x.entities();
        x.check_dim("backward", [entities, self.input_shape().size()])?;
        delta.check_dim("backward", [entities, self.output_shape().size()])
    }
    /// Reinitializes the parameters.
    pub fn reset(&mut self, rng: &mut dyn RngCore) {
        match self {
            Self::FullyConnected(dense) => dense.reset(rng),
            Self::Convolutional(conv) => conv.reset(rng),
            Self::Pooling(_) => (),
            Self::BatchNormalization(norm) => norm.reset(),
            Self::Output(output) => output.dense_mut().reset(rng),
        }
    }
}

impl From<Dense> for Layer {
    fn from(dense: Dense) -> Self {
        Self::FullyConnected(dense)
    }
}

impl From<Conv> for Layer {
    fn from(conv: Conv) -> Self {
        Self::Convolutional(conv)
    }
}

impl From<Pool> for Layer {
    fn from(pool: Pool) -> Self {
        Self::Pooling(pool)
    }
}

impl From<BatchNorm> for Layer {
    fn from(norm: BatchNorm) -> Self {
        Self::BatchNormalization(norm)
    }
}

impl From<Output> for Layer {
    fn from(output: Output) -> Self {
        Self::Output(output)
    }
}

/// Constructs a [`Layer`] for an input shape.
///
/// See the functions of this module ([`fully_connected()`], [`convolutional()`], ..) for the
/// catalog.
pub type LayerFactory = Box<dyn FnOnce(Shape, &mut dyn RngCore) -> Result<Layer> + Send>;

/// A fully connected layer with `neurons` outputs.
pub fn fully_connected(neurons: usize, activation: Activation) -> LayerFactory {
    Box::new(move |input, rng| {
        Ok(Dense::new(input, neurons, activation, Initialization::default(), rng)?.into())
    })
}

/// A convolutional layer.
pub fn convolutional(options: Conv2Options, activation: Activation) -> LayerFactory {
    Box::new(move |input, rng| {
        Ok(Conv::new(input, options, activation, Initialization::default(), rng)?.into())
    })
}

/// A 2x2, stride 2 max pooling layer.
pub fn pooling(activation: Activation) -> LayerFactory {
    pooling_with_mode(PoolingMode::Max, activation)
}

/// A 2x2, stride 2 pooling layer with `mode`.
pub fn pooling_with_mode(mode: PoolingMode, activation: Activation) -> LayerFactory {
    Box::new(move |input, _| Ok(Pool::new(input, mode, activation)?.into()))
}

/// A batch normalization layer.
pub fn batch_normalization(mode: NormalizationMode, activation: Activation) -> LayerFactory {
    Box::new(move |input, _| Ok(BatchNorm::new(input, mode, activation)?.into()))
}

/// An output layer with `neurons` outputs.
///
/// **Errors**
///
/// Building fails if `activation` and `cost` cannot be paired, see [`Cost::check_activation()`].
pub fn output(neurons: usize, activation: Activation, cost: Cost) -> LayerFactory {
    Box::new(move |input, rng| {
        Ok(Output::new(input, neurons, activation, cost, Initialization::default(), rng)?.into())
    })
}

/// A softmax output layer with `neurons` outputs, using the log-likelihood cost.
pub fn softmax(neurons: usize) -> LayerFactory {
    output(neurons, Activation::Softmax, Cost::LogLikelihood)
}

/// A factory returning `layer` as is.
///
/// **Errors**
///
/// Building fails if the input shape does not match the input shape of `layer`.
pub fn prebuilt(layer: Layer) -> LayerFactory {
    Box::new(move |input, _| {
        let expected = layer.input_shape();
        if input != expected {
            return Err(crate::error::ShapeError::new(
                "prebuilt layer",
                &expected.dims(),
                &input.dims(),
            )
            .into());
        }
        Ok(layer)
    })
}
