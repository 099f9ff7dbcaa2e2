//! Neural networks.
//!
//! A [`Network`] is either a [`SequentialNetwork`], a chain of layers, or a [`ComputationGraph`].
//! Both are built from the same layer catalog ([`layer`]) and expose the same forward,
//! backpropagation and evaluation operations, so that the optimizers and the training loop do
//! not depend on the topology.
//!
//! # Example
/*!
```
# use neurograph::{learn::neural_network::{activation::Activation, layer::{self, Conv2Options}, Network, SequentialNetwork}, tensor::{Shape, Tensor}};
# use rand::{rngs::StdRng, SeedableRng};
# fn main() -> anyhow::Result<()> {
let mut rng = StdRng::seed_from_u64(0);
let mut network = Network::from(SequentialNetwork::new(
    Shape::image(28, 28)?,
    [
        layer::convolutional(Conv2Options::new(6, [5, 5])?, Activation::ReLU),
        layer::pooling(Activation::Identity),
        layer::fully_connected(84, Activation::ReLU),
        layer::softmax(10),
    ],
    &mut rng,
)?);
let y = network.predict(Tensor::zeros(2, 28 * 28)?.view())?;
assert_eq!(y.dim(), [2, 10]);
# Ok(())
# }
```
*/
use crate::{
    dataset::Dataset,
    error::{ArgumentError, ShapeError},
    learn::{
        criterion::{Accuracy, Cost, Criterion},
        Stats,
    },
    settings,
    tensor::{Shape, Tensor, TensorView},
};
use anyhow::Result;
use derive_more::Display;
use rand::RngCore;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Activation functions.
pub mod activation;
pub mod graph;
pub mod layer;
/// Optimizers.
pub mod optimizer;
pub mod saved;
/// The training loop.
pub mod trainer;

use graph::ComputationGraph;
use layer::{Activity, Gradient, Layer, LayerFactory, Mode};

// the last layer, and only the last layer, must be an output layer
fn check_output_layers<'a>(layers: impl IntoIterator<Item = &'a Layer>) -> Result<()> {
    let mut last_is_output = false;
    for layer in layers {
        if last_is_output {
            return Err(
                ArgumentError::InvalidTopology("only the last layer may be an output layer").into(),
            );
        }
        last_is_output = layer.cost().is_some();
    }
    if !last_is_output {
        return Err(ArgumentError::InvalidTopology("the last layer must be an output layer").into());
    }
    Ok(())
}

/// A chain of layers, ending in an output layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SequentialNetwork {
    layers: Vec<Layer>,
}

impl SequentialNetwork {
    /// Constructs each layer with `factories` for the output shape of the previous layer,
    /// starting with `input`.
    ///
    /// **Errors**
    ///
    /// - Each factory must succeed.
    /// - The last layer, and only the last layer, must be an output layer.
    pub fn new(
        input: Shape,
        factories: impl IntoIterator<Item = LayerFactory>,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        let mut shape = input;
        let mut layers = Vec::new();
        for factory in factories {
            let layer = factory(shape, &mut *rng)?;
            shape = layer.output_shape();
            layers.push(layer);
        }
        Self::from_layers(layers)
    }
    /// Chains `layers`.
    ///
    /// **Errors**
    ///
    /// - The input shape of each layer must be the output shape of the previous layer.
    /// - The last layer, and only the last layer, must be an output layer.
    pub fn from_layers(layers: Vec<Layer>) -> Result<Self> {
        for pair in layers.windows(2) {
            let (output, input) = (pair[0].output_shape(), pair[1].input_shape());
            if output != input {
                return Err(
                    ShapeError::new("sequential network", &output.dims(), &input.dims()).into(),
                );
            }
        }
        check_output_layers(&layers)?;
        Ok(Self { layers })
    }
    /// The layers.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }
    fn forward(&mut self, x: TensorView, mode: Mode) -> Result<Tensor> {
        let mut layers = self.layers.iter_mut();
        let Some(first) = layers.next() else {
            return Ok(x.to_owned());
        };
        let mut a = first.forward(x, mode)?.a;
        for layer in layers {
            a = layer.forward(a.view(), mode)?.a;
        }
        Ok(a)
    }
    fn backpropagate(
        &mut self,
        x: TensorView,
        y: TensorView,
    ) -> Result<(Tensor, Vec<Option<Gradient>>)> {
        let mut activities: Vec<Activity> = Vec::with_capacity(self.layers.len());
        for layer in self.layers.iter_mut() {
            let input = activities.last().map_or_else(|| x.view(), |a| a.a.view());
            let activity = layer.forward(input, Mode::Training)?;
            activities.push(activity);
        }
        let (Some(output_layer), Some(output)) = (self.layers.last(), activities.last()) else {
            return Err(ArgumentError::InvalidTopology("the network has no layers").into());
        };
        let cost = output_layer
            .cost()
            .ok_or(ArgumentError::InvalidTopology("the last layer must be an output layer"))?;
        let mut delta = cost.delta(output_layer.activation(), &output.z, &output.a, &y)?;
        let mut gradients = Vec::with_capacity(self.layers.len());
        for (index, layer) in self.layers.iter().enumerate().rev() {
            let input = if index == 0 {
                x.view()
            } else {
                activities[index - 1].a.view()
            };
            gradients.push(layer.compute_gradient(input.view(), delta.view())?);
            if index > 0 {
                let dy = layer.backward(input, delta.view())?;
                let previous = &self.layers[index - 1];
                delta = previous.delta(activities[index - 1].z.view(), dy.view())?;
            }
        }
        gradients.reverse();
        let output = activities.pop().map_or_else(|| x.to_owned(), |activity| activity.a);
        Ok((output, gradients))
    }
}

/// The topology of a [`Network`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NetworkKind {
    /// [`SequentialNetwork`]
    Sequential,
    /// [`ComputationGraph`]
    Graph,
}

/// The result of [`Network::backpropagate()`].
#[derive(Debug, Clone)]
pub struct Backpropagation {
    /// The output of the network.
    pub output: Tensor,
    /// The gradient of each layer, summed over the batch, in the order of
    /// [`Network::layers()`]. `None` for layers without parameters.
    pub gradients: Vec<Option<Gradient>>,
}

/// A neural network.
#[derive(Debug, Clone, PartialEq)]
pub enum Network {
    /// A chain of layers.
    Sequential(SequentialNetwork),
    /// A computation graph.
    Graph(ComputationGraph),
}

impl From<SequentialNetwork> for Network {
    fn from(network: SequentialNetwork) -> Self {
        Self::Sequential(network)
    }
}

impl From<ComputationGraph> for Network {
    fn from(graph: ComputationGraph) -> Self {
        Self::Graph(graph)
    }
}

impl Network {
    /// The topology.
    pub fn kind(&self) -> NetworkKind {
        match self {
            Self::Sequential(_) => NetworkKind::Sequential,
            Self::Graph(_) => NetworkKind::Graph,
        }
    }
    /// The layers, in forward order.
    pub fn layers(&self) -> Vec<&Layer> {
        match self {
            Self::Sequential(network) => network.layers.iter().collect(),
            Self::Graph(graph) => graph.layers().collect(),
        }
    }
    /// The mutable layers, in forward order.
    pub fn layers_mut(&mut self) -> Vec<&mut Layer> {
        match self {
            Self::Sequential(network) => network.layers.iter_mut().collect(),
            Self::Graph(graph) => graph.layers_mut().collect(),
        }
    }
    fn output_layer(&self) -> Option<&Layer> {
        match self {
            Self::Sequential(network) => network.layers.last(),
            Self::Graph(graph) => Some(graph.output_layer()),
        }
    }
    /// The shape of one input sample.
    pub fn input_shape(&self) -> Shape {
        match self {
            Self::Sequential(network) => network
                .layers
                .first()
                .map_or(Shape::new_unchecked(1, 1, 1), Layer::input_shape),
            Self::Graph(graph) => graph.input_shape(),
        }
    }
    /// The shape of one output sample.
    pub fn output_shape(&self) -> Shape {
        self.output_layer()
            .map_or(Shape::new_unchecked(1, 1, 1), Layer::output_shape)
    }
    /// The cost function of the output layer.
    pub fn cost(&self) -> Option<Cost> {
        self.output_layer().and_then(Layer::cost)
    }
    /// The number of trainable values.
    pub fn parameters_len(&self) -> usize {
        self.layers().iter().map(|layer| layer.parameters_len()).sum()
    }
    /// Whether any parameter is NaN or infinite.
    pub fn is_in_numeric_overflow(&self) -> bool {
        self.layers()
            .iter()
            .any(|layer| layer.is_in_numeric_overflow())
    }
    /// Reinitializes the parameters of every layer.
    ///
    /// See [`Optimizer::reset_weights()`](optimizer::Optimizer::reset_weights) to also reset the
    /// state of an optimizer.
    pub fn reset_weights(&mut self, rng: &mut dyn RngCore) {
        for layer in self.layers_mut() {
            layer.reset(&mut *rng);
        }
    }
    /// Computes the output for `x`.
    ///
    /// **Errors**
    ///
    /// `x` must match the input shape.
    pub fn forward(&mut self, x: TensorView, mode: Mode) -> Result<Tensor> {
        match self {
            Self::Sequential(network) => network.forward(x, mode),
            Self::Graph(graph) => graph.forward(x, mode),
        }
    }
    /// Computes the output for `x` in inference mode.
    ///
    /// **Errors**
    ///
    /// `x` must match the input shape.
    pub fn predict(&mut self, x: TensorView) -> Result<Tensor> {
        self.forward(x, Mode::Inference)
    }
    /// Computes the output and the gradients of the layers for `x` against the targets `y`.
    ///
    /// **Errors**
    ///
    /// `x` must match the input shape and `y` the output shape, with the same number of entities.
    pub fn backpropagate(&mut self, x: TensorView, y: TensorView) -> Result<Backpropagation> {
        y.check_dim("backpropagate", [x.entities(), self.output_shape().size()])?;
        let (output, gradients) = match self {
            Self::Sequential(network) => network.backpropagate(x, y)?,
            Self::Graph(graph) => graph.backpropagate(x, y)?,
        };
        Ok(Backpropagation { output, gradients })
    }
    /// Evaluates the cost and the classification accuracy on `dataset`.
    ///
    /// The samples are processed in chunks of at most [`settings::maximum_batch_size()`].
    ///
    /// **Errors**
    ///
    /// The dataset must match the input and output shapes.
    pub fn evaluate(&mut self, dataset: &Dataset) -> Result<Stats> {
        let cost = self
            .cost()
            .ok_or(ArgumentError::InvalidTopology("the network has no output layer"))?;
        let (x, y) = (dataset.x(), dataset.y());
        let count = dataset.len();
        let chunk = settings::maximum_batch_size();
        let (mut total_cost, mut correct) = (0f32, 0usize);
        for start in (0..count).step_by(chunk) {
            let end = (start + chunk).min(count);
            let entities = end - start;
            let x = TensorView::from_slice(
                &x.as_slice()[start * x.length()..end * x.length()],
                entities,
                x.length(),
            )?;
            let y = TensorView::from_slice(
                &y.as_slice()[start * y.length()..end * y.length()],
                entities,
                y.length(),
            )?;
            let output = self.predict(x)?;
            total_cost += cost.eval(&output, &y)? * entities as f32;
            correct += Accuracy.eval(&output, &y)?;
        }
        Ok(Stats::new(count, total_cost / count as f32, correct))
    }
}
