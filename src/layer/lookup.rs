use faer::{Mat, MatRef};
use rand::rngs::StdRng;

use crate::{
    Context, Initialization, LayerConfig, Module, NnError, Result,
    utils::{check_len, check_shape, mat_view, shape},
};

/// Embedding table: maps token indices to learned vectors.
///
/// The parameters are a column-major `dim x vocabulary` table, one column per
/// token. Every input entry is a 0-based token index (rounded to the nearest
/// integer); an input of `k x n` indices becomes `k * dim x n`, the embedding
/// of row `r` filling output rows `r * dim..(r + 1) * dim`.
///
/// Indices are not differentiable, so `backward` returns zeros. `gradient`
/// only touches the columns of the tokens that were looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    vocabulary: usize,
    dim: usize,
}

impl Lookup {
    pub fn new(vocabulary: usize, dim: usize) -> Self {
        Self { vocabulary, dim }
    }

    pub fn vocabulary(&self) -> usize {
        self.vocabulary
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn token(&self, value: f64) -> Result<usize> {
        let index = value.round();
        if !(index >= 0.0 && index < self.vocabulary as f64) {
            return Err(NnError::invalid(format!(
                "lookup: index {value} outside the vocabulary of {}",
                self.vocabulary
            )));
        }
        Ok(index as usize)
    }
}

impl Module for Lookup {
    fn name(&self) -> &'static str {
        "lookup"
    }

    fn n_params(&self) -> usize {
        self.vocabulary * self.dim
    }

    fn reset(
        &mut self,
        params: &mut [f64],
        init: &Initialization,
        rng: &mut StdRng,
    ) -> Result<()> {
        check_len(self.name(), params, self.n_params())?;
        init.fill(params, self.vocabulary, self.dim, rng)
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_len(self.name(), params, self.n_params())?;
        let table = mat_view(params, self.dim, self.vocabulary);
        let dim = self.dim;
        let mut output = Mat::zeros(input.nrows() * dim, input.ncols());
        for j in 0..input.ncols() {
            for r in 0..input.nrows() {
                let token = self.token(input[(r, j)])?;
                for c in 0..dim {
                    output[(r * dim + c, j)] = table[(c, token)];
                }
            }
        }
        Ok(output)
    }

    fn backward(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_shape(
            self.name(),
            output_grad,
            (input.nrows() * self.dim, input.ncols()),
        )?;
        Ok(Mat::zeros(input.nrows(), input.ncols()))
    }

    fn gradient(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
        grad: &mut [f64],
    ) -> Result<()> {
        check_len(self.name(), grad, self.n_params())?;
        check_shape(
            self.name(),
            output_grad,
            (input.nrows() * self.dim, input.ncols()),
        )?;
        let dim = self.dim;
        for j in 0..input.ncols() {
            for r in 0..input.nrows() {
                let token = self.token(input[(r, j)])?;
                let column = &mut grad[token * dim..(token + 1) * dim];
                for (c, g) in column.iter_mut().enumerate() {
                    *g += output_grad[(r * dim + c, j)];
                }
            }
        }
        Ok(())
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::Lookup {
            vocabulary: self.vocabulary,
            dim: self.dim,
        }
    }
}
