//! Datasets.
//!
//! A [`Dataset`] is an in memory pair of inputs `x` and targets `y`, one sample per row. Training
//! consumes a [`BatchCollection`], which partitions a dataset into mini-batches.
use crate::{error::ArgumentError, tensor::Tensor};
use anyhow::Result;

mod batches;
pub use batches::{Batch, BatchCollection};

/// Inputs and targets, one sample per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    x: Tensor,
    y: Tensor,
}

impl Dataset {
    /// Pairs the rows of `x` and `y`.
    ///
    /// **Errors**
    ///
    /// `x` and `y` must have the same number of entities.
    pub fn new(x: Tensor, y: Tensor) -> Result<Self> {
        if x.entities() != y.entities() {
            return Err(ArgumentError::Dataset(format!(
                "{} inputs for {} targets",
                x.entities(),
                y.entities()
            ))
            .into());
        }
        Ok(Self { x, y })
    }
    /// Collects `(x, y)` samples.
    ///
    /// **Errors**
    ///
    /// There must be at least one sample, and all inputs and all targets must have the same,
    /// non zero, length.
    pub fn from_samples<I>(samples: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Vec<f32>, Vec<f32>)>,
    {
        let mut samples = samples.into_iter();
        let Some((x0, y0)) = samples.next() else {
            return Err(ArgumentError::Dataset("no samples".to_string()).into());
        };
        let (x_length, y_length) = (x0.len(), y0.len());
        let (mut x, mut y) = (x0, y0);
        let mut entities = 1;
        for (index, (xi, yi)) in samples.enumerate() {
            if xi.len() != x_length || yi.len() != y_length {
                return Err(ArgumentError::Dataset(format!(
                    "sample {} has shape ({}, {}), expected ({x_length}, {y_length})",
                    index + 1,
                    xi.len(),
                    yi.len(),
                ))
                .into());
            }
            x.extend_from_slice(&xi);
            y.extend_from_slice(&yi);
            entities += 1;
        }
        Self::new(
            Tensor::from_shape_vec(entities, x_length, x)?,
            Tensor::from_shape_vec(entities, y_length, y)?,
        )
    }
    /// The inputs.
    pub fn x(&self) -> &Tensor {
        &self.x
    }
    /// The targets.
    pub fn y(&self) -> &Tensor {
        &self.y
    }
    /// The number of samples.
    pub fn len(&self) -> usize {
        self.x.entities()
    }
    /// Datasets hold at least one sample.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Converts into `(x, y)`.
    pub fn into_tensors(self) -> (Tensor, Tensor) {
        (self.x, self.y)
    }
}
