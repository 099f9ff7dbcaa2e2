//! Merge operations of computation graphs.
use super::Activity;
use crate::{
    error::{ArgumentError, ShapeError},
    learn::neural_network::activation::Activation,
    tensor::{Shape, Tensor, TensorView},
};
use anyhow::Result;
use rayon::prelude::*;

fn check_inputs(inputs: usize) -> Result<()> {
    if inputs < 2 {
        return Err(ArgumentError::OutOfRange {
            name: "merge inputs",
            value: inputs.to_string(),
            range: "[2, ∞)",
        }
        .into());
    }
    Ok(())
}

fn check_batch(xs: &[TensorView], shapes: &[Shape]) -> Result<usize> {
    if xs.len() != shapes.len() {
        return Err(ShapeError::new("merge", &[shapes.len()], &[xs.len()]).into());
    }
    let entities = xs.first().map_or(0, |x| x.entities());
    for (x, shape) in xs.iter().zip(shapes) {
        x.check_dim("merge", [entities, shape.size()])?;
    }
    Ok(entities)
}

/// Elementwise sum of two or more inputs of the same shape, followed by an activation.
///
/// The gradient with respect to each input is the gradient with respect to the sum.
#[derive(Debug, Clone, PartialEq)]
pub struct Sum {
    shape: Shape,
    inputs: usize,
    activation: Activation,
}

impl Sum {
    /// Creates a new [`Sum`] of inputs with `shapes`.
    ///
    /// **Errors**
    ///
    /// - There must be at least two inputs.
    /// - All the shapes must be equal.
    /// - Softmax is not supported.
    pub fn new(shapes: &[Shape], activation: Activation) -> Result<Self> {
        check_inputs(shapes.len())?;
        let shape = shapes[0];
        if let Some(other) = shapes.iter().find(|s| **s != shape) {
            return Err(ShapeError::new("sum", &shape.dims(), &other.dims()).into());
        }
        if activation == Activation::Softmax {
            return Err(ArgumentError::InvalidInput {
                layer: "sum",
                shape: shape.to_string(),
                reason: "softmax is only available for output layers",
            }
            .into());
        }
        Ok(Self {
            shape,
            inputs: shapes.len(),
            activation,
        })
    }
    /// The shape of the inputs and of the output.
    pub fn output_shape(&self) -> Shape {
        self.shape
    }
    /// The activation applied to the sum.
    pub fn activation(&self) -> Activation {
        self.activation
    }
    /// `z = Σ x`, `a = f(z)`
    pub fn forward(&self, xs: &[TensorView]) -> Result<Activity> {
        let entities = check_batch(xs, &vec![self.shape; self.inputs])?;
        let mut z = Tensor::zeros(entities, self.shape.size())?;
        for x in xs {
            z.add_assign(x)?;
        }
        let a = self.activation.forward(&z);
        Ok(Activity { z, a })
    }
    /// `δ = dy ⊙ f'(z)`, copied to every input.
    pub fn backward(&self, z: TensorView, dy: TensorView) -> Result<Vec<Tensor>> {
        dy.check_dim("sum backward", z.dim())?;
        let mut delta = dy.to_owned();
        self.activation.backward_inplace(&z, &mut delta);
        Ok(vec![delta; self.inputs])
    }
}

/// Stacks the channels of two or more inputs with the same height and width.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthConcatenation {
    inputs: Vec<Shape>,
    output: Shape,
}

impl DepthConcatenation {
    /// Creates a new [`DepthConcatenation`] of inputs with `shapes`.
    ///
    /// **Errors**
    ///
    /// - There must be at least two inputs.
    /// - All the shapes must have the same height and width.
    /// - The concatenated size must fit in `usize`.
    pub fn new(shapes: &[Shape]) -> Result<Self> {
        check_inputs(shapes.len())?;
        let first = shapes[0];
        if let Some(other) = shapes
            .iter()
            .find(|s| [s.height(), s.width()] != [first.height(), first.width()])
        {
            return Err(ShapeError::new(
                "depth concatenation",
                &[first.height(), first.width()],
                &[other.height(), other.width()],
            )
            .into());
        }
        let channels = shapes
            .iter()
            .try_fold(0usize, |acc, s| acc.checked_add(s.channels()))
            .ok_or(ArgumentError::TooLarge("concatenated channels"))?;
        Ok(Self {
            inputs: shapes.to_vec(),
            output: Shape::volume(channels, first.height(), first.width())?,
        })
    }
    /// The shapes of the inputs, in concatenation order.
    pub fn input_shapes(&self) -> &[Shape] {
        &self.inputs
    }
    /// The shape of the concatenated output.
    pub fn output_shape(&self) -> Shape {
        self.output
    }
    /// Concatenates the samples of `xs`, channel blocks in input order.
    pub fn forward(&self, xs: &[TensorView]) -> Result<Activity> {
        let entities = check_batch(xs, &self.inputs)?;
        let mut z = Tensor::zeros(entities, self.output.size())?;
        z.as_slice_mut()
            .par_chunks_mut(self.output.size())
            .enumerate()
            .for_each(|(n, z)| {
                let mut offset = 0;
                for x in xs {
                    let x = x.row(n);
                    z[offset..offset + x.len()].copy_from_slice(x);
                    offset += x.len();
                }
            });
        Ok(Activity { a: z.clone(), z })
    }
    /// Slices `dy` into the channel block of each input.
    pub fn backward(&self, dy: TensorView) -> Result<Vec<Tensor>> {
        let entities = dy.entities();
        dy.check_dim("depth concatenation backward", [entities, self.output.size()])?;
        let mut offset = 0;
        self.inputs
            .iter()
            .map(|shape| {
                let len = shape.size();
                let data = (0..entities)
                    .flat_map(|n| dy.row(n)[offset..offset + len].iter().copied())
                    .collect();
                offset += len;
                Tensor::from_shape_vec(entities, len, data)
            })
            .collect()
    }
}
