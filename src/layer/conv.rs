//! Convolution and transposed convolution over channel-major images.
//!
//! A sample column holds `channels * height * width` values, channel after
//! channel, each channel row-major. The kernel bank of `out * in` kernels is
//! stored kernel after kernel (`((o * in + i) * kh + ky) * kw + kx`), followed
//! by one bias per output channel.

use faer::{Mat, MatRef};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::{
    Context, Initialization, LayerConfig, Module, NnError, Result,
    utils::{check_len, check_shape},
};

fn one() -> usize {
    1
}

/// Shape, stride, zero padding and dilation of a convolution.
///
/// Dilation above 1 spreads the kernel taps apart (atrous convolution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvGeometry {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_width: usize,
    pub kernel_height: usize,
    #[serde(default = "one")]
    pub stride_width: usize,
    #[serde(default = "one")]
    pub stride_height: usize,
    #[serde(default)]
    pub pad_width: usize,
    #[serde(default)]
    pub pad_height: usize,
    pub input_width: usize,
    pub input_height: usize,
    #[serde(default = "one")]
    pub dilation_width: usize,
    #[serde(default = "one")]
    pub dilation_height: usize,
}

/// One multiply-add of a convolution: `output += weight * input`.
#[derive(Debug, Clone, Copy)]
struct Tap {
    weight: usize,
    input: usize,
    output: usize,
}

impl ConvGeometry {
    /// Stride 1, no padding, no dilation.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_width: usize,
        kernel_height: usize,
        input_width: usize,
        input_height: usize,
    ) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_width,
            kernel_height,
            stride_width: 1,
            stride_height: 1,
            pad_width: 0,
            pad_height: 0,
            input_width,
            input_height,
            dilation_width: 1,
            dilation_height: 1,
        }
    }

    pub fn stride(mut self, width: usize, height: usize) -> Self {
        self.stride_width = width;
        self.stride_height = height;
        self
    }

    pub fn padding(mut self, width: usize, height: usize) -> Self {
        self.pad_width = width;
        self.pad_height = height;
        self
    }

    pub fn dilation(mut self, width: usize, height: usize) -> Self {
        self.dilation_width = width;
        self.dilation_height = height;
        self
    }

    fn validate(&self) -> Result<()> {
        let positive = [
            ("in_channels", self.in_channels),
            ("out_channels", self.out_channels),
            ("kernel_width", self.kernel_width),
            ("kernel_height", self.kernel_height),
            ("stride_width", self.stride_width),
            ("stride_height", self.stride_height),
            ("input_width", self.input_width),
            ("input_height", self.input_height),
            ("dilation_width", self.dilation_width),
            ("dilation_height", self.dilation_height),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(NnError::invalid(format!(
                    "convolution {field} must be positive"
                )));
            }
        }
        Ok(())
    }

    fn kernel_span(kernel: usize, dilation: usize) -> usize {
        dilation * (kernel - 1) + 1
    }

    fn convolved(input: usize, kernel: usize, stride: usize, pad: usize, dilation: usize) -> usize {
        (input + 2 * pad - Self::kernel_span(kernel, dilation)) / stride + 1
    }

    /// Width of the convolution output.
    pub fn output_width(&self) -> usize {
        Self::convolved(
            self.input_width,
            self.kernel_width,
            self.stride_width,
            self.pad_width,
            self.dilation_width,
        )
    }

    /// Height of the convolution output.
    pub fn output_height(&self) -> usize {
        Self::convolved(
            self.input_height,
            self.kernel_height,
            self.stride_height,
            self.pad_height,
            self.dilation_height,
        )
    }

    fn check_fits(&self) -> Result<()> {
        let fits = |input: usize, pad: usize, kernel: usize, dilation: usize| {
            input + 2 * pad >= Self::kernel_span(kernel, dilation)
        };
        if !fits(self.input_width, self.pad_width, self.kernel_width, self.dilation_width)
            || !fits(self.input_height, self.pad_height, self.kernel_height, self.dilation_height)
        {
            return Err(NnError::invalid(format!(
                "{}x{} kernel does not fit a padded {}x{} input",
                self.kernel_width, self.kernel_height, self.input_width, self.input_height
            )));
        }
        Ok(())
    }

    fn input_len(&self) -> usize {
        self.in_channels * self.input_width * self.input_height
    }

    fn output_len(&self) -> usize {
        self.out_channels * self.output_width() * self.output_height()
    }

    fn n_weights(&self) -> usize {
        self.out_channels * self.in_channels * self.kernel_width * self.kernel_height
    }

    fn n_params(&self) -> usize {
        self.n_weights() + self.out_channels
    }

    fn for_each_tap(&self, mut f: impl FnMut(Tap)) {
        let (w_in, h_in) = (self.input_width, self.input_height);
        let (w_out, h_out) = (self.output_width(), self.output_height());
        let (kw, kh) = (self.kernel_width, self.kernel_height);
        for o in 0..self.out_channels {
            for oy in 0..h_out {
                for ox in 0..w_out {
                    let output = (o * h_out + oy) * w_out + ox;
                    for i in 0..self.in_channels {
                        for ky in 0..kh {
                            let iy = (oy * self.stride_height + ky * self.dilation_height)
                                .checked_sub(self.pad_height);
                            let Some(iy) = iy.filter(|&iy| iy < h_in) else {
                                continue;
                            };
                            for kx in 0..kw {
                                let ix = (ox * self.stride_width + kx * self.dilation_width)
                                    .checked_sub(self.pad_width);
                                let Some(ix) = ix.filter(|&ix| ix < w_in) else {
                                    continue;
                                };
                                f(Tap {
                                    weight: ((o * self.in_channels + i) * kh + ky) * kw + kx,
                                    input: (i * h_in + iy) * w_in + ix,
                                    output,
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    fn reset(&self, params: &mut [f64], init: &Initialization, rng: &mut StdRng) -> Result<()> {
        let taps = self.kernel_width * self.kernel_height;
        let (weights, biases) = params.split_at_mut(self.n_weights());
        init.fill(
            weights,
            self.in_channels * taps,
            self.out_channels * taps,
            rng,
        )?;
        biases.fill(0.0);
        Ok(())
    }
}

/// 2-D cross-correlation with `out_channels` learnable kernels and biases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Convolution {
    geometry: ConvGeometry,
}

impl Convolution {
    pub fn new(geometry: ConvGeometry) -> Result<Self> {
        geometry.validate()?;
        geometry.check_fits()?;
        Ok(Self { geometry })
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }
}

impl Module for Convolution {
    fn name(&self) -> &'static str {
        "convolution"
    }

    fn n_params(&self) -> usize {
        self.geometry.n_params()
    }

    fn reset(
        &mut self,
        params: &mut [f64],
        init: &Initialization,
        rng: &mut StdRng,
    ) -> Result<()> {
        check_len(self.name(), params, self.n_params())?;
        self.geometry.reset(params, init, rng)
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        let g = &self.geometry;
        check_len(self.name(), params, g.n_params())?;
        check_shape(self.name(), input, (g.input_len(), input.ncols()))?;
        let (weights, biases) = params.split_at(g.n_weights());
        let plane = g.output_width() * g.output_height();
        let mut output = Mat::from_fn(g.output_len(), input.ncols(), |r, _| biases[r / plane]);
        for j in 0..input.ncols() {
            g.for_each_tap(|tap| {
                output[(tap.output, j)] += weights[tap.weight] * input[(tap.input, j)];
            });
        }
        Ok(output)
    }

    fn backward(
        &mut self,
        params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        let g = &self.geometry;
        check_len(self.name(), params, g.n_params())?;
        check_shape(self.name(), output_grad, (g.output_len(), input.ncols()))?;
        let weights = &params[..g.n_weights()];
        let mut delta = Mat::zeros(g.input_len(), output_grad.ncols());
        for j in 0..output_grad.ncols() {
            g.for_each_tap(|tap| {
                delta[(tap.input, j)] += weights[tap.weight] * output_grad[(tap.output, j)];
            });
        }
        Ok(delta)
    }

    fn gradient(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
        grad: &mut [f64],
    ) -> Result<()> {
        let g = &self.geometry;
        check_len(self.name(), grad, g.n_params())?;
        check_shape(self.name(), input, (g.input_len(), input.ncols()))?;
        check_shape(self.name(), output_grad, (g.output_len(), input.ncols()))?;
        let plane = g.output_width() * g.output_height();
        let (d_weights, d_biases) = grad.split_at_mut(g.n_weights());
        for j in 0..input.ncols() {
            g.for_each_tap(|tap| {
                d_weights[tap.weight] += input[(tap.input, j)] * output_grad[(tap.output, j)];
            });
            for r in 0..output_grad.nrows() {
                d_biases[r / plane] += output_grad[(r, j)];
            }
        }
        Ok(())
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::Convolution(self.geometry)
    }
}

/// Adjoint of `Convolution`: maps an image of the convolution's output shape
/// back onto an image of its input shape.
///
/// `geometry.input_*` describes the (small) input of this layer. The output
/// is `stride * (input - 1) + dilation * (kernel - 1) + 1 - 2 * pad` wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransposedConvolution {
    geometry: ConvGeometry,
    /// The convolution this layer is the adjoint of.
    adjoint: ConvGeometry,
}

impl TransposedConvolution {
    pub fn new(geometry: ConvGeometry) -> Result<Self> {
        geometry.validate()?;
        let expanded = |input: usize, kernel: usize, stride: usize, pad: usize, dilation: usize| {
            let full = stride * (input - 1) + ConvGeometry::kernel_span(kernel, dilation);
            full.checked_sub(2 * pad).filter(|&n| n > 0).ok_or_else(|| {
                NnError::invalid(format!(
                    "padding {pad} crops the whole transposed convolution output"
                ))
            })
        };
        let output_width = expanded(
            geometry.input_width,
            geometry.kernel_width,
            geometry.stride_width,
            geometry.pad_width,
            geometry.dilation_width,
        )?;
        let output_height = expanded(
            geometry.input_height,
            geometry.kernel_height,
            geometry.stride_height,
            geometry.pad_height,
            geometry.dilation_height,
        )?;
        let adjoint = ConvGeometry {
            in_channels: geometry.out_channels,
            out_channels: geometry.in_channels,
            input_width: output_width,
            input_height: output_height,
            ..geometry
        };
        debug_assert_eq!(adjoint.output_width(), geometry.input_width);
        debug_assert_eq!(adjoint.output_height(), geometry.input_height);
        Ok(Self { geometry, adjoint })
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }

    pub fn output_width(&self) -> usize {
        self.adjoint.input_width
    }

    pub fn output_height(&self) -> usize {
        self.adjoint.input_height
    }
}

impl Module for TransposedConvolution {
    fn name(&self) -> &'static str {
        "transposed_convolution"
    }

    fn n_params(&self) -> usize {
        // Same kernel count as the adjoint, but one bias per output channel.
        self.adjoint.n_weights() + self.geometry.out_channels
    }

    fn reset(
        &mut self,
        params: &mut [f64],
        init: &Initialization,
        rng: &mut StdRng,
    ) -> Result<()> {
        check_len(self.name(), params, self.n_params())?;
        let taps = self.geometry.kernel_width * self.geometry.kernel_height;
        let (weights, biases) = params.split_at_mut(self.adjoint.n_weights());
        init.fill(
            weights,
            self.geometry.in_channels * taps,
            self.geometry.out_channels * taps,
            rng,
        )?;
        biases.fill(0.0);
        Ok(())
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        let a = &self.adjoint;
        check_len(self.name(), params, self.n_params())?;
        check_shape(self.name(), input, (a.output_len(), input.ncols()))?;
        let (weights, biases) = params.split_at(a.n_weights());
        let plane = a.input_width * a.input_height;
        let mut output = Mat::from_fn(a.input_len(), input.ncols(), |r, _| biases[r / plane]);
        for j in 0..input.ncols() {
            a.for_each_tap(|tap| {
                output[(tap.input, j)] += weights[tap.weight] * input[(tap.output, j)];
            });
        }
        Ok(output)
    }

    fn backward(
        &mut self,
        params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        let a = &self.adjoint;
        check_len(self.name(), params, self.n_params())?;
        check_shape(self.name(), output_grad, (a.input_len(), input.ncols()))?;
        let weights = &params[..a.n_weights()];
        let mut delta = Mat::zeros(a.output_len(), output_grad.ncols());
        for j in 0..output_grad.ncols() {
            a.for_each_tap(|tap| {
                delta[(tap.output, j)] += weights[tap.weight] * output_grad[(tap.input, j)];
            });
        }
        Ok(delta)
    }

    fn gradient(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
        grad: &mut [f64],
    ) -> Result<()> {
        let a = &self.adjoint;
        check_len(self.name(), grad, self.n_params())?;
        check_shape(self.name(), input, (a.output_len(), input.ncols()))?;
        check_shape(self.name(), output_grad, (a.input_len(), input.ncols()))?;
        let plane = a.input_width * a.input_height;
        let (d_weights, d_biases) = grad.split_at_mut(a.n_weights());
        for j in 0..input.ncols() {
            a.for_each_tap(|tap| {
                d_weights[tap.weight] += input[(tap.output, j)] * output_grad[(tap.input, j)];
            });
            for r in 0..output_grad.nrows() {
                d_biases[r / plane] += output_grad[(r, j)];
            }
        }
        Ok(())
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::TransposedConvolution(self.geometry)
    }
}
