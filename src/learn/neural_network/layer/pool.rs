use super::Activity;
use crate::{
    learn::neural_network::activation::Activation,
    tensor::{Shape, Tensor, TensorView},
};
use anyhow::Result;
use derive_more::Display;
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The reduction applied to each pooling window.
#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PoolingMode {
    /// The largest value, the first one on ties.
    #[default]
    Max,
    /// The mean of the four window cells.
    Average,
}

impl PoolingMode {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Max => 0,
            Self::Average => 1,
        }
    }
    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Max),
            1 => Some(Self::Average),
            _ => None,
        }
    }
}

/// 2x2 pooling with stride 2.
///
/// Odd heights and widths are rounded up: the last row (column) is pooled against itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Pool {
    input: Shape,
    output: Shape,
    mode: PoolingMode,
    activation: Activation,
}

impl Pool {
    /// Creates a new [`Pool`].
    ///
    /// **Errors**
    ///
    /// Softmax is reserved for output layers.
    pub fn new(input: Shape, mode: PoolingMode, activation: Activation) -> Result<Self> {
        if activation == Activation::Softmax {
            return Err(crate::error::ArgumentError::InvalidInput {
                layer: "pooling",
                shape: input.to_string(),
                reason: "softmax is only available for output layers",
            }
            .into());
        }
        let output = Shape::volume(
            input.channels(),
            (input.height() + 1) / 2,
            (input.width() + 1) / 2,
        )?;
        Ok(Self {
            input,
            output,
            mode,
            activation,
        })
    }
    /// The shape of the input.
    pub fn input_shape(&self) -> Shape {
        self.input
    }
    /// The shape of the output, height and width halved and rounded up.
    pub fn output_shape(&self) -> Shape {
        self.output
    }
    /// The activation applied to the pooled values.
    pub fn activation(&self) -> Activation {
        self.activation
    }
    /// Max or average pooling.
    pub fn mode(&self) -> PoolingMode {
        self.mode
    }
    // the (clipped) input offsets of the window of output (oy, ox), row major
    fn window(&self, oy: usize, ox: usize) -> [usize; 4] {
        let (h, w) = (self.input.height(), self.input.width());
        let y0 = 2 * oy;
        let y1 = (y0 + 1).min(h - 1);
        let x0 = 2 * ox;
        let x1 = (x0 + 1).min(w - 1);
        [y0 * w + x0, y0 * w + x1, y1 * w + x0, y1 * w + x1]
    }
    fn argmax(x: &[f32], window: [usize; 4]) -> usize {
        let mut max = window[0];
        for i in window.into_iter().skip(1) {
            if x[i] > x[max] {
                max = i;
            }
        }
        max
    }
    pub(super) fn forward(&self, x: TensorView) -> Result<Activity> {
        let (input_slice, output_slice) = (self.input.slice_size(), self.output.slice_size());
        let (oh, ow) = (self.output.height(), self.output.width());
        let mut z = Tensor::zeros(x.entities(), self.output.size())?;
        z.as_slice_mut()
            .par_chunks_mut(output_slice)
            .zip(x.as_slice().par_chunks(input_slice))
            .for_each(|(z, x)| {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let window = self.window(oy, ox);
                        z[oy * ow + ox] = match self.mode {
                            PoolingMode::Max => x[Self::argmax(x, window)],
                            PoolingMode::Average => window.iter().map(|i| x[*i]).sum::<f32>() / 4.,
                        };
                    }
                }
            });
        let a = self.activation.forward(&z);
        Ok(Activity { z, a })
    }
    /// Upsamples `δ` to the input shape.
    ///
    /// Max pooling routes each value to the cell that produced the maximum, average pooling
    /// spreads it evenly over the window.
    pub(super) fn backward(&self, x: TensorView, delta: TensorView) -> Result<Tensor> {
        let (input_slice, output_slice) = (self.input.slice_size(), self.output.slice_size());
        let (oh, ow) = (self.output.height(), self.output.width());
        let mut dx = Tensor::zeros(x.entities(), self.input.size())?;
        // channel slices are independent
        dx.as_slice_mut()
            .par_chunks_mut(input_slice)
            .zip(x.as_slice().par_chunks(input_slice))
            .zip(delta.as_slice().par_chunks(output_slice))
            .for_each(|((dx, x), delta)| {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let window = self.window(oy, ox);
                        let dy = delta[oy * ow + ox];
                        match self.mode {
                            PoolingMode::Max => dx[Self::argmax(x, window)] += dy,
                            PoolingMode::Average => {
                                for i in window {
                                    dx[i] += dy / 4.;
                                }
                            }
                        }
                    }
                }
            });
        Ok(dx)
    }
}
