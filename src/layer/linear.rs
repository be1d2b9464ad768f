//! Affine layers.
//!
//! Weights are stored column-major as an `output x input` matrix at the start
//! of the layer's slot, followed by the bias (if any).

use faer::{Mat, MatRef};
use rand::rngs::StdRng;

use crate::{
    Context, Initialization, LayerConfig, Module, Result,
    utils::{
        add_row_sums, check_len, check_rows, check_shape, mat_view, mat_view_mut, mul, mul_add,
    },
};

/// `W * x + b`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    n_inputs: usize,
    n_outputs: usize,
}

impl Linear {
    pub fn new(n_inputs: usize, n_outputs: usize) -> Self {
        Self {
            n_inputs,
            n_outputs,
        }
    }

    fn n_weights(&self) -> usize {
        self.n_inputs * self.n_outputs
    }
}

impl Module for Linear {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn n_params(&self) -> usize {
        self.n_weights() + self.n_outputs
    }

    fn reset(
        &mut self,
        params: &mut [f64],
        init: &Initialization,
        rng: &mut StdRng,
    ) -> Result<()> {
        check_len(self.name(), params, self.n_params())?;
        init.fill(params, self.n_inputs, self.n_outputs, rng)
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_len(self.name(), params, self.n_params())?;
        check_rows(self.name(), input, self.n_inputs)?;
        let (w, b) = params.split_at(self.n_weights());
        let mut z = mul(mat_view(w, self.n_outputs, self.n_inputs), input);
        for j in 0..z.ncols() {
            for (k, b_k) in b.iter().enumerate() {
                z[(k, j)] += b_k;
            }
        }
        Ok(z)
    }

    fn backward(
        &mut self,
        params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_len(self.name(), params, self.n_params())?;
        check_shape(self.name(), output_grad, (self.n_outputs, input.ncols()))?;
        let w = mat_view(&params[..self.n_weights()], self.n_outputs, self.n_inputs);
        Ok(mul(w.transpose(), output_grad))
    }

    fn gradient(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
        grad: &mut [f64],
    ) -> Result<()> {
        check_len(self.name(), grad, self.n_params())?;
        check_rows(self.name(), input, self.n_inputs)?;
        check_shape(self.name(), output_grad, (self.n_outputs, input.ncols()))?;
        let (dw, db) = grad.split_at_mut(self.n_weights());
        mul_add(
            mat_view_mut(dw, self.n_outputs, self.n_inputs),
            output_grad,
            input.transpose(),
        );
        add_row_sums(db, output_grad);
        Ok(())
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::Linear {
            input: self.n_inputs,
            output: self.n_outputs,
        }
    }
}

/// `W * x`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearNoBias {
    n_inputs: usize,
    n_outputs: usize,
}

impl LinearNoBias {
    pub fn new(n_inputs: usize, n_outputs: usize) -> Self {
        Self {
            n_inputs,
            n_outputs,
        }
    }
}

impl Module for LinearNoBias {
    fn name(&self) -> &'static str {
        "linear_no_bias"
    }

    fn n_params(&self) -> usize {
        self.n_inputs * self.n_outputs
    }

    fn reset(
        &mut self,
        params: &mut [f64],
        init: &Initialization,
        rng: &mut StdRng,
    ) -> Result<()> {
        check_len(self.name(), params, self.n_params())?;
        init.fill(params, self.n_inputs, self.n_outputs, rng)
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_len(self.name(), params, self.n_params())?;
        check_rows(self.name(), input, self.n_inputs)?;
        Ok(mul(mat_view(params, self.n_outputs, self.n_inputs), input))
    }

    fn backward(
        &mut self,
        params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_len(self.name(), params, self.n_params())?;
        check_shape(self.name(), output_grad, (self.n_outputs, input.ncols()))?;
        let w = mat_view(params, self.n_outputs, self.n_inputs);
        Ok(mul(w.transpose(), output_grad))
    }

    fn gradient(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
        grad: &mut [f64],
    ) -> Result<()> {
        check_len(self.name(), grad, self.n_params())?;
        check_rows(self.name(), input, self.n_inputs)?;
        check_shape(self.name(), output_grad, (self.n_outputs, input.ncols()))?;
        mul_add(
            mat_view_mut(grad, self.n_outputs, self.n_inputs),
            output_grad,
            input.transpose(),
        );
        Ok(())
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::LinearNoBias {
            input: self.n_inputs,
            output: self.n_outputs,
        }
    }
}

/// `x + b` with a learnable bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddBias {
    size: usize,
}

impl AddBias {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl Module for AddBias {
    fn name(&self) -> &'static str {
        "add"
    }

    fn n_params(&self) -> usize {
        self.size
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_len(self.name(), params, self.size)?;
        check_rows(self.name(), input, self.size)?;
        Ok(Mat::from_fn(input.nrows(), input.ncols(), |i, j| {
            input[(i, j)] + params[i]
        }))
    }

    fn backward(
        &mut self,
        _params: &[f64],
        _input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_rows(self.name(), output_grad, self.size)?;
        Ok(output_grad.to_owned())
    }

    fn gradient(
        &mut self,
        _params: &[f64],
        _input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
        grad: &mut [f64],
    ) -> Result<()> {
        check_len(self.name(), grad, self.size)?;
        check_rows(self.name(), output_grad, self.size)?;
        add_row_sums(grad, output_grad);
        Ok(())
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::Add { size: self.size }
    }
}
