use super::{Activity, Gradient, Initialization};
use crate::{
    error::{ArgumentError, ShapeError},
    learn::neural_network::activation::Activation,
    tensor::{checked_product, Shape, Tensor, TensorView},
};
use anyhow::Result;
use ndarray::Array1;
use rand::RngCore;
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Options for [`Conv`].
///
/// Defaults:
/// - strides: 1
/// - padding: 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Conv2Options {
    kernels: usize,
    kernel: [usize; 2],
    strides: [usize; 2],
    padding: [usize; 2],
}

impl Conv2Options {
    /// `kernels` output channels, each with a `kernel` (height, width) filter per input channel.
    ///
    /// **Errors**
    ///
    /// `kernels` and the kernel size must be positive.
    pub fn new(kernels: usize, kernel: [usize; 2]) -> Result<Self> {
        if kernels == 0 {
            return Err(ArgumentError::NotPositive("kernels").into());
        }
        if kernel.contains(&0) {
            return Err(ArgumentError::NotPositive("kernel size").into());
        }
        Ok(Self {
            kernels,
            kernel,
            strides: [1, 1],
            padding: [0, 0],
        })
    }
    /// Adds vertical / horizontal `strides`.
    ///
    /// **Errors**
    ///
    /// The strides must be positive.
    pub fn with_strides(mut self, strides: [usize; 2]) -> Result<Self> {
        if strides.contains(&0) {
            return Err(ArgumentError::NotPositive("strides").into());
        }
        self.strides = strides;
        Ok(self)
    }
    /// Adds vertical / horizontal zero `padding`.
    ///
    /// **Errors**
    ///
    /// The padding must be smaller than the kernel.
    pub fn with_padding(mut self, padding: [usize; 2]) -> Result<Self> {
        if padding[0] >= self.kernel[0] || padding[1] >= self.kernel[1] {
            return Err(ArgumentError::OutOfRange {
                name: "padding",
                value: format!("{padding:?}"),
                range: "[0, kernel size)",
            }
            .into());
        }
        self.padding = padding;
        Ok(self)
    }
    /// The number of output channels.
    pub fn kernels(&self) -> usize {
        self.kernels
    }
    /// The (height, width) of each filter.
    pub fn kernel(&self) -> [usize; 2] {
        self.kernel
    }
    /// The vertical / horizontal strides.
    pub fn strides(&self) -> [usize; 2] {
        self.strides
    }
    /// The vertical / horizontal zero padding.
    pub fn padding(&self) -> [usize; 2] {
        self.padding
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Geometry {
    ic: usize,
    ih: usize,
    iw: usize,
    oc: usize,
    oh: usize,
    ow: usize,
    fh: usize,
    fw: usize,
    sh: usize,
    sw: usize,
    ph: usize,
    pw: usize,
}

impl Geometry {
    fn new(input: Shape, options: &Conv2Options) -> Result<Self> {
        let [fh, fw] = options.kernel;
        let [sh, sw] = options.strides;
        let [ph, pw] = options.padding;
        let (ih, iw) = (input.height(), input.width());
        let padded = |len: usize, pad: usize| {
            pad.checked_mul(2)
                .and_then(|pad| pad.checked_add(len))
                .ok_or(ArgumentError::TooLarge("padded input"))
        };
        let (padded_h, padded_w) = (padded(ih, ph)?, padded(iw, pw)?);
        if padded_h < fh || padded_w < fw {
            return Err(ArgumentError::InvalidInput {
                layer: "convolutional",
                shape: input.to_string(),
                reason: "the padded input is smaller than the kernel",
            }
            .into());
        }
        // bounds filter_len() and the weight count
        checked_product(
            "convolution weights",
            &[options.kernels, input.channels(), fh, fw],
        )?;
        Ok(Self {
            ic: input.channels(),
            ih,
            iw,
            oc: options.kernels,
            oh: (padded_h - fh) / sh + 1,
            ow: (padded_w - fw) / sw + 1,
            fh,
            fw,
            sh,
            sw,
            ph,
            pw,
        })
    }
    fn input_len(&self) -> usize {
        self.ic * self.ih * self.iw
    }
    fn output_len(&self) -> usize {
        self.oc * self.oh * self.ow
    }
    fn filter_len(&self) -> usize {
        self.ic * self.fh * self.fw
    }
    // input row touched by output row `oy` and filter row `ky`, None when in the padding
    fn input_y(&self, oy: usize, ky: usize) -> Option<usize> {
        (oy * self.sh + ky)
            .checked_sub(self.ph)
            .filter(|y| *y < self.ih)
    }
    fn input_x(&self, ox: usize, kx: usize) -> Option<usize> {
        (ox * self.sw + kx)
            .checked_sub(self.pw)
            .filter(|x| *x < self.iw)
    }
    // output row that reads input row `iy` through filter row `ky`
    fn output_y(&self, iy: usize, ky: usize) -> Option<usize> {
        let t = (iy + self.ph).checked_sub(ky)?;
        (t % self.sh == 0 && t / self.sh < self.oh).then_some(t / self.sh)
    }
    fn output_x(&self, ix: usize, kx: usize) -> Option<usize> {
        let t = (ix + self.pw).checked_sub(kx)?;
        (t % self.sw == 0 && t / self.sw < self.ow).then_some(t / self.sw)
    }
}

/// Convolutional layer.
///
/// Cross correlation of a `C x H x W` input with `K` filters of `C x kh x kw`, plus a bias per
/// output channel. Weights are stored `[K, C, kh, kw]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv {
    input: Shape,
    output: Shape,
    options: Conv2Options,
    geometry: Geometry,
    activation: Activation,
    init: Initialization,
    weights: Array1<f32>,
    biases: Array1<f32>,
}

impl Conv {
    /// Creates a new [`Conv`].
    ///
    /// **Errors**
    ///
    /// - The padded input must be at least as large as the kernel.
    /// - Softmax is reserved for output layers.
    pub fn new(
        input: Shape,
        options: Conv2Options,
        activation: Activation,
        init: Initialization,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        if activation == Activation::Softmax {
            return Err(ArgumentError::InvalidInput {
                layer: "convolutional",
                shape: input.to_string(),
                reason: "softmax is only available for output layers",
            }
            .into());
        }
        let geometry = Geometry::new(input, &options)?;
        let output = Shape::volume(geometry.oc, geometry.oh, geometry.ow)?;
        let weights = init.sample(
            geometry.oc * geometry.filter_len(),
            geometry.filter_len(),
            geometry.oc * geometry.fh * geometry.fw,
            rng,
        );
        Ok(Self {
            input,
            output,
            options,
            geometry,
            activation,
            init,
            weights,
            biases: Array1::zeros(geometry.oc),
        })
    }
    pub(crate) fn from_parts(
        input: Shape,
        options: Conv2Options,
        activation: Activation,
        init: Initialization,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> Result<Self> {
        let geometry = Geometry::new(input, &options)?;
        let expected = [geometry.oc * geometry.filter_len(), geometry.oc];
        if [weights.len(), biases.len()] != expected {
            return Err(ShapeError::new(
                "convolutional parameters",
                &expected,
                &[weights.len(), biases.len()],
            )
            .into());
        }
        Ok(Self {
            input,
            output: Shape::volume(geometry.oc, geometry.oh, geometry.ow)?,
            options,
            geometry,
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
    /// The shape of the output, one channel per kernel.
    pub fn output_shape(&self) -> Shape {
        self.output
    }
    /// The activation applied to the output.
    pub fn activation(&self) -> Activation {
        self.activation
    }
    /// The options the layer was created with.
    pub fn options(&self) -> &Conv2Options {
        &self.options
    }
    /// The initialization used by [`.reset()`](Self::reset).
    pub fn initialization(&self) -> Initialization {
        self.init
    }
    /// The weights `[K, C, kh, kw]` and the biases.
    pub fn parameters(&self) -> (&Array1<f32>, &Array1<f32>) {
        (&self.weights, &self.biases)
    }
    /// The mutable weights and biases.
    pub fn parameters_mut(&mut self) -> (&mut Array1<f32>, &mut Array1<f32>) {
        (&mut self.weights, &mut self.biases)
    }
    pub(super) fn forward(&self, x: TensorView) -> Result<Activity> {
        let g = self.geometry;
        let weights = self.weights.as_slice().unwrap_or_default();
        let biases = self.biases.as_slice().unwrap_or_default();
        let mut z = Tensor::zeros(x.entities(), g.output_len())?;
        z.as_slice_mut()
            .par_chunks_mut(g.output_len())
            .zip(x.as_slice().par_chunks(g.input_len()))
            .for_each(|(z, x)| {
                for (k, (z, filter)) in z
                    .chunks_mut(g.oh * g.ow)
                    .zip(weights.chunks(g.filter_len()))
                    .enumerate()
                {
                    for oy in 0..g.oh {
                        for ox in 0..g.ow {
                            let mut acc = biases[k];
                            for (x, filter) in
                                x.chunks(g.ih * g.iw).zip(filter.chunks(g.fh * g.fw))
                            {
                                for ky in 0..g.fh {
                                    let Some(iy) = g.input_y(oy, ky) else {
                                        continue;
                                    };
                                    for kx in 0..g.fw {
                                        if let Some(ix) = g.input_x(ox, kx) {
                                            acc += x[iy * g.iw + ix] * filter[ky * g.fw + kx];
                                        }
                                    }
                                }
                            }
                            z[oy * g.ow + ox] = acc;
                        }
                    }
                }
            });
        let a = self.activation.forward(&z);
        Ok(Activity { z, a })
    }
    /// Full convolution of `δ` with the flipped filters, gathered per input position.
    pub(super) fn backward(&self, delta: TensorView) -> Result<Tensor> {
        let g = self.geometry;
        let weights = self.weights.as_slice().unwrap_or_default();
        let mut dx = Tensor::zeros(delta.entities(), g.input_len())?;
        dx.as_slice_mut()
            .par_chunks_mut(g.input_len())
            .zip(delta.as_slice().par_chunks(g.output_len()))
            .for_each(|(dx, delta)| {
                for (c, dx) in dx.chunks_mut(g.ih * g.iw).enumerate() {
                    for iy in 0..g.ih {
                        for ix in 0..g.iw {
                            let mut acc = 0.;
                            for (filter, delta) in weights
                                .chunks(g.filter_len())
                                .zip(delta.chunks(g.oh * g.ow))
                            {
                                let filter = &filter[c * g.fh * g.fw..(c + 1) * g.fh * g.fw];
                                for ky in 0..g.fh {
                                    let Some(oy) = g.output_y(iy, ky) else {
                                        continue;
                                    };
                                    for kx in 0..g.fw {
                                        if let Some(ox) = g.output_x(ix, kx) {
                                            acc += delta[oy * g.ow + ox] * filter[ky * g.fw + kx];
                                        }
                                    }
                                }
                            }
                            dx[iy * g.iw + ix] = acc;
                        }
                    }
                }
            });
        Ok(dx)
    }
    /// Correlates the input with `δ` for the filters, and sums `δ` per output channel for the
    /// biases.
    pub(super) fn compute_gradient(&self, x: TensorView, delta: TensorView) -> Result<Gradient> {
        let g = self.geometry;
        let x = x.as_slice();
        let delta = delta.as_slice();
        let mut weights = vec![0f32; g.oc * g.filter_len()];
        let mut biases = vec![0f32; g.oc];
        weights
            .par_chunks_mut(g.filter_len())
            .zip(biases.par_iter_mut())
            .enumerate()
            .for_each(|(k, (dw, db))| {
                for (x, delta) in x.chunks(g.input_len()).zip(delta.chunks(g.output_len())) {
                    let delta = &delta[k * g.oh * g.ow..(k + 1) * g.oh * g.ow];
                    *db += delta.iter().sum::<f32>();
                    for (x, dw) in x.chunks(g.ih * g.iw).zip(dw.chunks_mut(g.fh * g.fw)) {
                        for ky in 0..g.fh {
                            for kx in 0..g.fw {
                                let mut acc = 0.;
                                for oy in 0..g.oh {
                                    let Some(iy) = g.input_y(oy, ky) else {
                                        continue;
                                    };
                                    for ox in 0..g.ow {
                                        if let Some(ix) = g.input_x(ox, kx) {
                                            acc += x[iy * g.iw + ix] * delta[oy * g.ow + ox];
                                        }
                                    }
                                }
                                dw[ky * g.fw + kx] += acc;
                            }
                        }
                    }
                }
            });
        Ok(Gradient {
            weights: weights.into(),
            biases: biases.into(),
        })
    }
    pub(super) fn reset(&mut self, rng: &mut dyn RngCore) {
        let g = self.geometry;
        self.weights = self.init.sample(
            g.oc * g.filter_len(),
            g.filter_len(),
            g.oc * g.fh * g.fw,
            rng,
        );
        self.biases.fill(0.);
    }
}
