//! Parameter-free (or nearly so) elementwise layers.

use faer::{Mat, MatRef};
use rand::rngs::StdRng;

use crate::{
    Context, DynActivationFunction, Initialization, LayerConfig, Module, NnError, Result,
    utils::{check_len, check_shape, map, shape, zip_map},
};

/// Applies a scalar activation function to every element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Activation {
    phi: DynActivationFunction,
}

impl Activation {
    pub fn new(phi: DynActivationFunction) -> Self {
        Self { phi }
    }

    pub fn phi(&self) -> DynActivationFunction {
        self.phi
    }
}

impl Module for Activation {
    fn name(&self) -> &'static str {
        self.phi.name()
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        _params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        Ok(self.phi.apply_mat(input))
    }

    fn backward(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_shape(self.name(), output_grad, shape(input))?;
        Ok(self.phi.backward_mat(input, output_grad))
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::Activation {
            function: self.phi.name().to_owned(),
        }
    }
}

/// `max(x, alpha * x)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakyRelu {
    alpha: f64,
}

impl Default for LeakyRelu {
    fn default() -> Self {
        Self { alpha: 0.03 }
    }
}

impl LeakyRelu {
    pub fn new(alpha: f64) -> Self {
        Self { alpha }
    }
}

impl Module for LeakyRelu {
    fn name(&self) -> &'static str {
        "leaky_relu"
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        _params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        let alpha = self.alpha;
        Ok(map(input, |x| if x > 0.0 { x } else { alpha * x }))
    }

    fn backward(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_shape(self.name(), output_grad, shape(input))?;
        let alpha = self.alpha;
        Ok(zip_map(input, output_grad, |x, dy| {
            if x > 0.0 { dy } else { alpha * dy }
        }))
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::LeakyRelu { alpha: self.alpha }
    }
}

/// Clamps every element into `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HardTanh {
    min: f64,
    max: f64,
}

impl Default for HardTanh {
    fn default() -> Self {
        Self {
            min: -1.0,
            max: 1.0,
        }
    }
}

impl HardTanh {
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !(min < max) {
            return Err(NnError::invalid(format!(
                "hard tanh needs min < max, got [{min}, {max}]"
            )));
        }
        Ok(Self { min, max })
    }
}

impl Module for HardTanh {
    fn name(&self) -> &'static str {
        "hard_tanh"
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        _params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        Ok(map(input, |x| x.clamp(self.min, self.max)))
    }

    fn backward(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_shape(self.name(), output_grad, shape(input))?;
        Ok(zip_map(input, output_grad, |x, dy| {
            if x > self.min && x < self.max { dy } else { 0.0 }
        }))
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::HardTanh {
            min: self.min,
            max: self.max,
        }
    }
}

/// `max(0, x) + alpha` with a single learnable `alpha`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlexibleRelu {
    /// Value `alpha` takes on reset.
    alpha: f64,
}

impl FlexibleRelu {
    pub fn new(alpha: f64) -> Self {
        Self { alpha }
    }
}

impl Module for FlexibleRelu {
    fn name(&self) -> &'static str {
        "flexible_relu"
    }

    fn n_params(&self) -> usize {
        1
    }

    fn reset(
        &mut self,
        params: &mut [f64],
        _init: &Initialization,
        _rng: &mut StdRng,
    ) -> Result<()> {
        check_len(self.name(), params, 1)?;
        params[0] = self.alpha;
        Ok(())
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_len(self.name(), params, 1)?;
        let alpha = params[0];
        Ok(map(input, |x| x.max(0.0) + alpha))
    }

    fn backward(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_shape(self.name(), output_grad, shape(input))?;
        Ok(zip_map(input, output_grad, |x, dy| {
            if x > 0.0 { dy } else { 0.0 }
        }))
    }

    fn gradient(
        &mut self,
        _params: &[f64],
        _input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
        grad: &mut [f64],
    ) -> Result<()> {
        check_len(self.name(), grad, 1)?;
        grad[0] += output_grad.sum();
        Ok(())
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::FlexibleRelu { alpha: self.alpha }
    }
}

/// Column-wise `x - log(sum(exp(x)))`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LogSoftMax;

impl LogSoftMax {
    fn log_softmax(input: MatRef<'_, f64>) -> Mat<f64> {
        let mut output = Mat::zeros(input.nrows(), input.ncols());
        for j in 0..input.ncols() {
            let max = (0..input.nrows())
                .map(|i| input[(i, j)])
                .fold(f64::NEG_INFINITY, f64::max);
            let log_sum = (0..input.nrows())
                .map(|i| f64::exp(input[(i, j)] - max))
                .sum::<f64>()
                .ln();
            for i in 0..input.nrows() {
                output[(i, j)] = input[(i, j)] - max - log_sum;
            }
        }
        output
    }
}

impl Module for LogSoftMax {
    fn name(&self) -> &'static str {
        "log_soft_max"
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        _params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        Ok(Self::log_softmax(input))
    }

    fn backward(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_shape(self.name(), output_grad, shape(input))?;
        let output = Self::log_softmax(input);
        let mut delta = Mat::zeros(input.nrows(), input.ncols());
        for j in 0..input.ncols() {
            let dy_sum: f64 = (0..input.nrows()).map(|i| output_grad[(i, j)]).sum();
            for i in 0..input.nrows() {
                delta[(i, j)] = output_grad[(i, j)] - f64::exp(output[(i, j)]) * dy_sum;
            }
        }
        Ok(delta)
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::LogSoftMax
    }
}

/// Ignores its input and outputs `value` in every one of `size` rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Constant {
    size: usize,
    value: f64,
}

impl Constant {
    pub fn new(size: usize, value: f64) -> Self {
        Self { size, value }
    }
}

impl Module for Constant {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        _params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        Ok(Mat::from_fn(self.size, input.ncols(), |_, _| self.value))
    }

    fn backward(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_shape(self.name(), output_grad, (self.size, input.ncols()))?;
        Ok(Mat::zeros(input.nrows(), input.ncols()))
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::Constant {
            size: self.size,
            value: self.value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultiplyConstant {
    scalar: f64,
}

impl MultiplyConstant {
    pub fn new(scalar: f64) -> Self {
        Self { scalar }
    }
}

impl Module for MultiplyConstant {
    fn name(&self) -> &'static str {
        "multiply_constant"
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        _params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        Ok(map(input, |x| self.scalar * x))
    }

    fn backward(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_shape(self.name(), output_grad, shape(input))?;
        Ok(map(output_grad, |dy| self.scalar * dy))
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::MultiplyConstant {
            scalar: self.scalar,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use faer::mat;

    use super::*;

    #[test]
    fn log_softmax_of_equal_inputs() {
        let mut layer = LogSoftMax;
        let mut ctx = Context::deterministic(0);
        let input = mat![[0.5], [0.5]];
        let output = layer.forward(&mut ctx, &[], input.as_ref()).unwrap();
        assert_abs_diff_eq!(output[(0, 0)], -0.6931, epsilon = 1e-3);
        assert_abs_diff_eq!(output[(1, 0)], -0.6931, epsilon = 1e-3);

        // Seed as produced by the negative log likelihood for class 1.
        let seed = mat![[0.0], [-1.0]];
        let delta = layer.backward(&[], input.as_ref(), seed.as_ref()).unwrap();
        assert_abs_diff_eq!(delta[(0, 0)], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(delta[(1, 0)], -0.5, epsilon = 1e-12);
    }

    #[test]
    fn constant_ignores_input() {
        let mut layer = Constant::new(10, 3.0);
        let mut ctx = Context::deterministic(0);
        for fill in [0.0, 1.0] {
            let input = Mat::from_fn(10, 1, |_, _| fill);
            let output = layer.forward(&mut ctx, &[], input.as_ref()).unwrap();
            assert_eq!(output.sum(), 30.0);
            let delta = layer.backward(&[], input.as_ref(), output.as_ref()).unwrap();
            assert_eq!(delta.sum(), 0.0);
        }
    }

    #[test]
    fn flexible_relu_accumulates_alpha_gradient() {
        let mut layer = FlexibleRelu::new(0.05);
        let mut params = [0.0];
        let mut rng = rand::SeedableRng::seed_from_u64(0);
        layer
            .reset(&mut params, &Initialization::default(), &mut rng)
            .unwrap();
        assert_eq!(params[0], 0.05);

        let input = mat![[-1.0, 2.0]];
        let mut ctx = Context::deterministic(0);
        let output = layer.forward(&mut ctx, &params, input.as_ref()).unwrap();
        assert_abs_diff_eq!(output[(0, 0)], 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(output[(0, 1)], 2.05, epsilon = 1e-12);

        let dy = mat![[1.0, 2.0]];
        let mut grad = [0.0];
        layer
            .gradient(&params, input.as_ref(), dy.as_ref(), &mut grad)
            .unwrap();
        layer
            .gradient(&params, input.as_ref(), dy.as_ref(), &mut grad)
            .unwrap();
        assert_eq!(grad[0], 6.0);
    }

    #[test]
    fn hard_tanh_rejects_empty_range() {
        assert!(HardTanh::new(1.0, 1.0).is_err());
    }
}
