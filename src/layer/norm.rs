//! Normalization layers.
//!
//! Both layers own `2 * size` parameters: the per-feature scale `gamma`
//! followed by the per-feature shift `beta`. The variance used for
//! normalization is always `var + epsilon`, so constant features produce a
//! zero output instead of NaN.

use faer::{Mat, MatRef};
use rand::rngs::StdRng;

use super::StepHistory;
use crate::{
    Context, Initialization, LayerConfig, Module, NnError, Result,
    config::default_epsilon,
    utils::{check_len, check_rows, check_shape, shape},
};

fn check_epsilon(epsilon: f64) -> Result<()> {
    if !(epsilon >= 0.0 && epsilon.is_finite()) {
        return Err(NnError::invalid(format!(
            "normalization epsilon must be finite and non-negative, got {epsilon}"
        )));
    }
    Ok(())
}

fn reset_scale_and_shift(params: &mut [f64], size: usize) {
    let (gamma, beta) = params.split_at_mut(size);
    gamma.fill(1.0);
    beta.fill(0.0);
}

/// Shared backward through `x_hat = (x - mean) * inv_std` where the
/// statistics were computed from the `n` values of one group, given the
/// gradient with respect to `x_hat` for those values.
fn normalized_backward(d_x_hat: &[f64], x_hat: &[f64], inv_std: f64) -> impl Iterator<Item = f64> {
    let n = d_x_hat.len() as f64;
    let sum: f64 = d_x_hat.iter().sum();
    let dot: f64 = d_x_hat.iter().zip(x_hat).map(|(d, x)| d * x).sum();
    d_x_hat
        .iter()
        .zip(x_hat)
        .map(move |(d, x)| inv_std / n * (n * d - sum - x * dot))
}

#[derive(Debug, Clone)]
struct BatchRecord {
    x_hat: Mat<f64>,
    inv_std: Vec<f64>,
    /// `false` when the running statistics were used, which makes the
    /// statistics constants for back propagation.
    batch_statistics: bool,
}

/// Normalizes every feature over the batch.
///
/// In training mode the batch mean and (population) variance are used and
/// folded into the running statistics; in deterministic mode the running
/// statistics are used instead. Without a momentum the running statistics
/// are the cumulative average over all training batches seen so far.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    size: usize,
    epsilon: f64,
    momentum: Option<f64>,
    running_mean: Vec<f64>,
    running_variance: Vec<f64>,
    n_batches: usize,
    history: StepHistory<BatchRecord>,
}

impl BatchNorm {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            epsilon: default_epsilon(),
            momentum: None,
            running_mean: vec![0.0; size],
            running_variance: vec![1.0; size],
            n_batches: 0,
            history: StepHistory::default(),
        }
    }

    pub fn with_options(size: usize, epsilon: f64, momentum: Option<f64>) -> Result<Self> {
        check_epsilon(epsilon)?;
        if let Some(momentum) = momentum.filter(|m| !(*m > 0.0 && *m <= 1.0)) {
            return Err(NnError::invalid(format!(
                "batch norm momentum must lie in (0, 1], got {momentum}"
            )));
        }
        Ok(Self {
            epsilon,
            momentum,
            ..Self::new(size)
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn running_mean(&self) -> &[f64] {
        &self.running_mean
    }

    pub fn running_variance(&self) -> &[f64] {
        &self.running_variance
    }

    /// Restores running statistics, e.g. when loading a trained network.
    pub fn set_running_statistics(&mut self, mean: &[f64], variance: &[f64]) -> Result<()> {
        check_len(self.name(), mean, self.size)?;
        check_len(self.name(), variance, self.size)?;
        self.running_mean.copy_from_slice(mean);
        self.running_variance.copy_from_slice(variance);
        Ok(())
    }

    fn update_running(&mut self, mean: &[f64], variance: &[f64]) {
        self.n_batches += 1;
        let rate = match self.momentum {
            Some(momentum) => momentum,
            None => 1.0 / self.n_batches as f64,
        };
        for i in 0..self.size {
            self.running_mean[i] += rate * (mean[i] - self.running_mean[i]);
            self.running_variance[i] += rate * (variance[i] - self.running_variance[i]);
        }
    }
}

impl Module for BatchNorm {
    fn name(&self) -> &'static str {
        "batch_norm"
    }

    fn n_params(&self) -> usize {
        2 * self.size
    }

    fn reset(
        &mut self,
        params: &mut [f64],
        _init: &Initialization,
        _rng: &mut StdRng,
    ) -> Result<()> {
        check_len(self.name(), params, self.n_params())?;
        reset_scale_and_shift(params, self.size);
        Ok(())
    }

    fn forward(
        &mut self,
        ctx: &mut Context,
        params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_len(self.name(), params, self.n_params())?;
        check_rows(self.name(), input, self.size)?;
        let (gamma, beta) = params.split_at(self.size);
        let batch = input.ncols();
        let batch_statistics = !ctx.is_deterministic();

        let (mean, variance) = if batch_statistics {
            let mean: Vec<f64> = (0..self.size)
                .map(|i| (0..batch).map(|j| input[(i, j)]).sum::<f64>() / batch as f64)
                .collect();
            let variance: Vec<f64> = (0..self.size)
                .map(|i| {
                    (0..batch)
                        .map(|j| (input[(i, j)] - mean[i]).powi(2))
                        .sum::<f64>()
                        / batch as f64
                })
                .collect();
            self.update_running(&mean, &variance);
            (mean, variance)
        } else {
            (self.running_mean.clone(), self.running_variance.clone())
        };

        let inv_std: Vec<f64> = variance
            .iter()
            .map(|v| 1.0 / (v + self.epsilon).sqrt())
            .collect();
        let x_hat = Mat::from_fn(self.size, batch, |i, j| {
            (input[(i, j)] - mean[i]) * inv_std[i]
        });
        let output = Mat::from_fn(self.size, batch, |i, j| gamma[i] * x_hat[(i, j)] + beta[i]);
        self.history.push(BatchRecord {
            x_hat,
            inv_std,
            batch_statistics,
        });
        Ok(output)
    }

    fn backward(
        &mut self,
        params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_len(self.name(), params, self.n_params())?;
        check_shape(self.name(), output_grad, shape(input))?;
        let gamma = &params[..self.size];
        let Some(record) = self.history.activate_latest() else {
            return Err(NnError::invalid("batch_norm: backward without a matching forward"));
        };
        let batch = output_grad.ncols();
        let mut delta = Mat::zeros(self.size, batch);
        for i in 0..self.size {
            if !record.batch_statistics {
                for j in 0..batch {
                    delta[(i, j)] = output_grad[(i, j)] * gamma[i] * record.inv_std[i];
                }
                continue;
            }
            let d_x_hat: Vec<f64> = (0..batch).map(|j| output_grad[(i, j)] * gamma[i]).collect();
            let x_hat: Vec<f64> = (0..batch).map(|j| record.x_hat[(i, j)]).collect();
            for (j, d) in normalized_backward(&d_x_hat, &x_hat, record.inv_std[i]).enumerate() {
                delta[(i, j)] = d;
            }
        }
        Ok(delta)
    }

    fn gradient(
        &mut self,
        _params: &[f64],
        _input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
        grad: &mut [f64],
    ) -> Result<()> {
        check_len(self.name(), grad, self.n_params())?;
        let Some(record) = self.history.active() else {
            return Err(NnError::invalid("batch_norm: gradient without a matching backward"));
        };
        check_shape(self.name(), output_grad, shape(record.x_hat.as_ref()))?;
        let (d_gamma, d_beta) = grad.split_at_mut(self.size);
        for j in 0..output_grad.ncols() {
            for i in 0..self.size {
                d_gamma[i] += output_grad[(i, j)] * record.x_hat[(i, j)];
                d_beta[i] += output_grad[(i, j)];
            }
        }
        Ok(())
    }

    fn begin_sequence(&mut self) {
        self.history.clear();
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::BatchNorm {
            size: self.size,
            epsilon: self.epsilon,
            momentum: self.momentum,
        }
    }
}

#[derive(Debug, Clone)]
struct SampleRecord {
    x_hat: Mat<f64>,
    mean: Vec<f64>,
    variance: Vec<f64>,
}

/// Normalizes every sample over its features. Behaves the same in both
/// modes.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    size: usize,
    epsilon: f64,
    history: StepHistory<SampleRecord>,
}

impl LayerNorm {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            epsilon: default_epsilon(),
            history: StepHistory::default(),
        }
    }

    pub fn with_epsilon(size: usize, epsilon: f64) -> Result<Self> {
        check_epsilon(epsilon)?;
        Ok(Self {
            epsilon,
            ..Self::new(size)
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Per-sample means of the latest forward call.
    pub fn mean(&self) -> Option<&[f64]> {
        self.history.latest().map(|r| r.mean.as_slice())
    }

    /// Per-sample variances of the latest forward call.
    pub fn variance(&self) -> Option<&[f64]> {
        self.history.latest().map(|r| r.variance.as_slice())
    }
}

impl Module for LayerNorm {
    fn name(&self) -> &'static str {
        "layer_norm"
    }

    fn n_params(&self) -> usize {
        2 * self.size
    }

    fn reset(
        &mut self,
        params: &mut [f64],
        _init: &Initialization,
        _rng: &mut StdRng,
    ) -> Result<()> {
        check_len(self.name(), params, self.n_params())?;
        reset_scale_and_shift(params, self.size);
        Ok(())
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_len(self.name(), params, self.n_params())?;
        check_rows(self.name(), input, self.size)?;
        let (gamma, beta) = params.split_at(self.size);
        let n = self.size as f64;
        let batch = input.ncols();

        let mean: Vec<f64> = (0..batch)
            .map(|j| (0..self.size).map(|i| input[(i, j)]).sum::<f64>() / n)
            .collect();
        let variance: Vec<f64> = (0..batch)
            .map(|j| {
                (0..self.size)
                    .map(|i| (input[(i, j)] - mean[j]).powi(2))
                    .sum::<f64>()
                    / n
            })
            .collect();
        let x_hat = Mat::from_fn(self.size, batch, |i, j| {
            (input[(i, j)] - mean[j]) / (variance[j] + self.epsilon).sqrt()
        });
        let output = Mat::from_fn(self.size, batch, |i, j| gamma[i] * x_hat[(i, j)] + beta[i]);
        self.history.push(SampleRecord {
            x_hat,
            mean,
            variance,
        });
        Ok(output)
    }

    fn backward(
        &mut self,
        params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_len(self.name(), params, self.n_params())?;
        check_shape(self.name(), output_grad, shape(input))?;
        let gamma = &params[..self.size];
        let epsilon = self.epsilon;
        let Some(record) = self.history.activate_latest() else {
            return Err(NnError::invalid("layer_norm: backward without a matching forward"));
        };
        let mut delta = Mat::zeros(self.size, output_grad.ncols());
        for j in 0..output_grad.ncols() {
            let inv_std = 1.0 / (record.variance[j] + epsilon).sqrt();
            let d_x_hat: Vec<f64> = (0..self.size).map(|i| output_grad[(i, j)] * gamma[i]).collect();
            let x_hat: Vec<f64> = (0..self.size).map(|i| record.x_hat[(i, j)]).collect();
            for (i, d) in normalized_backward(&d_x_hat, &x_hat, inv_std).enumerate() {
                delta[(i, j)] = d;
            }
        }
        Ok(delta)
    }

    fn gradient(
        &mut self,
        _params: &[f64],
        _input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
        grad: &mut [f64],
    ) -> Result<()> {
        check_len(self.name(), grad, self.n_params())?;
        let Some(record) = self.history.active() else {
            return Err(NnError::invalid("layer_norm: gradient without a matching backward"));
        };
        check_shape(self.name(), output_grad, shape(record.x_hat.as_ref()))?;
        let (d_gamma, d_beta) = grad.split_at_mut(self.size);
        for j in 0..output_grad.ncols() {
            for i in 0..self.size {
                d_gamma[i] += output_grad[(i, j)] * record.x_hat[(i, j)];
                d_beta[i] += output_grad[(i, j)];
            }
        }
        Ok(())
    }

    fn begin_sequence(&mut self) {
        self.history.clear();
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::LayerNorm {
            size: self.size,
            epsilon: self.epsilon,
        }
    }
}
