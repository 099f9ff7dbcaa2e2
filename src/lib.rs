/*!
# **neurograph**
A neural network engine for the CPU.

- [`tensor`]: batches of samples as row major matrices, owned or borrowed.
- [`learn::neural_network::layer`]: fully connected, convolutional, pooling, batch normalization
  and output layers, with forward, backward and gradient kernels parallelized with rayon.
- [`learn::neural_network::graph`]: computation graphs with sums, depth concatenations and
  training branches, validated when built.
- [`learn::neural_network::optimizer`]: SGD, Momentum, AdaGrad, RMSProp, AdaDelta, Adam and AdaMax.
- [`learn::neural_network::trainer`]: mini-batch training with validation, cancellation and
  numeric overflow detection.
- [`learn::neural_network::saved`]: a compressed binary format for trained networks.

# Example
```
# use neurograph::{
#     dataset::BatchCollection,
#     learn::neural_network::{
#         activation::Activation, layer, optimizer::Adam, trainer::{self, TrainingOptions},
#         Network, SequentialNetwork,
#     },
#     tensor::{Shape, Tensor},
# };
# use rand::{rngs::StdRng, SeedableRng};
# fn main() -> anyhow::Result<()> {
let mut network: Network = SequentialNetwork::new(
    Shape::linear(2)?,
    [
        layer::fully_connected(8, Activation::ReLU),
        layer::softmax(2),
    ],
    &mut StdRng::seed_from_u64(0),
)?
.into();
let x = Tensor::from_shape_vec(4, 2, vec![0., 0., 0., 1., 1., 0., 1., 1.])?;
let y = Tensor::from_shape_vec(4, 2, vec![1., 0., 0., 1., 0., 1., 1., 0.])?;
let mut batches = BatchCollection::from_tensors(x, y, 2)?;
let options = TrainingOptions::builder()
    .epochs(10)
    .algorithm(Adam::builder().build()?)
    .seed(0)
    .build()?;
let result = trainer::train(&mut network, &mut batches, options)?;
assert_eq!(result.epochs(), 10);
# Ok(())
# }
```
*/
#![warn(missing_docs)]

pub mod dataset;
pub mod error;
pub mod learn;
pub mod settings;
pub mod tensor;
