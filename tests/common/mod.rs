//! Finite-difference checks against the layer contract.
//!
//! The checked loss of a sequence is `sum_t <forward(x_t), w_t>`, so the
//! seed gradient of step `t` is simply `w_t`.

#![allow(dead_code)]

use layerwise::{Context, Layer, Module, faer::Mat};
use rand::{Rng, SeedableRng, rngs::StdRng};

pub const STEP: f64 = 1e-6;

pub fn random_mat(nrows: usize, ncols: usize, rng: &mut StdRng) -> Mat<f64> {
    Mat::from_fn(nrows, ncols, |_, _| rng.random_range(-1.0..1.0))
}

pub fn random_vec(len: usize, scale: f64, rng: &mut StdRng) -> Vec<f64> {
    (0..len).map(|_| scale * rng.random_range(-1.0..1.0)).collect()
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

fn dot(a: &Mat<f64>, b: &Mat<f64>) -> f64 {
    assert_eq!((a.nrows(), a.ncols()), (b.nrows(), b.ncols()));
    let mut total = 0.0;
    for j in 0..a.ncols() {
        for i in 0..a.nrows() {
            total += a[(i, j)] * b[(i, j)];
        }
    }
    total
}

/// Inputs of every step and the weights on every step's output.
pub struct SequenceCheck {
    pub inputs: Vec<Mat<f64>>,
    pub weights: Vec<Mat<f64>>,
}

impl SequenceCheck {
    /// Draws random inputs, runs them once to learn the output shape and
    /// draws matching weights.
    pub fn new(
        layer: &mut Layer,
        params: &[f64],
        input_shape: (usize, usize),
        steps: usize,
        seed: u64,
    ) -> Self {
        let mut rng = rng(seed);
        let inputs: Vec<_> = (0..steps)
            .map(|_| random_mat(input_shape.0, input_shape.1, &mut rng))
            .collect();
        Self::with_inputs(layer, params, inputs, &mut rng)
    }

    /// Fixed inputs, random weights on the outputs.
    pub fn with_inputs(
        layer: &mut Layer,
        params: &[f64],
        inputs: Vec<Mat<f64>>,
        rng: &mut StdRng,
    ) -> Self {
        layer.begin_sequence();
        let mut ctx = Context::training(0);
        let weights = inputs
            .iter()
            .map(|x| {
                let y = layer.forward(&mut ctx, params, x.as_ref()).unwrap();
                random_mat(y.nrows(), y.ncols(), rng)
            })
            .collect();
        Self { inputs, weights }
    }

    pub fn loss(&self, layer: &mut Layer, params: &[f64]) -> f64 {
        layer.begin_sequence();
        let mut ctx = Context::training(0);
        self.inputs
            .iter()
            .zip(&self.weights)
            .map(|(x, w)| dot(&layer.forward(&mut ctx, params, x.as_ref()).unwrap(), w))
            .sum()
    }

    /// Parameter gradient and per-step input gradients by back propagation.
    pub fn analytic(&self, layer: &mut Layer, params: &[f64]) -> (Vec<f64>, Vec<Mat<f64>>) {
        layer.begin_sequence();
        let mut ctx = Context::training(0);
        for x in &self.inputs {
            layer.forward(&mut ctx, params, x.as_ref()).unwrap();
        }
        let mut grad = vec![0.0; params.len()];
        let mut deltas = vec![Mat::zeros(0, 0); self.inputs.len()];
        for t in (0..self.inputs.len()).rev() {
            let (x, w) = (self.inputs[t].as_ref(), self.weights[t].as_ref());
            deltas[t] = layer.backward(params, x, w).unwrap();
            layer.gradient(params, x, w, &mut grad).unwrap();
        }
        (grad, deltas)
    }

    pub fn numeric_param_grad(&self, layer: &mut Layer, params: &[f64]) -> Vec<f64> {
        let mut shifted = params.to_vec();
        (0..params.len())
            .map(|i| {
                shifted[i] = params[i] + STEP;
                let up = self.loss(layer, &shifted);
                shifted[i] = params[i] - STEP;
                let down = self.loss(layer, &shifted);
                shifted[i] = params[i];
                (up - down) / (2.0 * STEP)
            })
            .collect()
    }

    /// Loss gradient with respect to the input of step `t`.
    pub fn numeric_input_grad(&self, layer: &mut Layer, params: &[f64], t: usize) -> Mat<f64> {
        let mut shifted = SequenceCheck {
            inputs: self.inputs.clone(),
            weights: self.weights.clone(),
        };
        let x = self.inputs[t].clone();
        Mat::from_fn(x.nrows(), x.ncols(), |i, j| {
            shifted.inputs[t][(i, j)] = x[(i, j)] + STEP;
            let up = shifted.loss(layer, params);
            shifted.inputs[t][(i, j)] = x[(i, j)] - STEP;
            let down = shifted.loss(layer, params);
            shifted.inputs[t][(i, j)] = x[(i, j)];
            (up - down) / (2.0 * STEP)
        })
    }
}

pub fn flatten(m: &Mat<f64>) -> Vec<f64> {
    let mut out = Vec::with_capacity(m.nrows() * m.ncols());
    for j in 0..m.ncols() {
        for i in 0..m.nrows() {
            out.push(m[(i, j)]);
        }
    }
    out
}

/// `|a - b| / (|a| + |b|)`, zero when both vanish.
pub fn relative_error(a: &[f64], b: &[f64]) -> f64 {
    assert_eq!(a.len(), b.len());
    fn norm(v: impl Iterator<Item = f64>) -> f64 {
        v.map(|x| x * x).sum::<f64>().sqrt()
    }
    let diff = norm(a.iter().zip(b).map(|(x, y)| x - y));
    let scale = norm(a.iter().copied()) + norm(b.iter().copied());
    if scale == 0.0 { 0.0 } else { diff / scale }
}

/// Checks the parameter gradient and the input gradient of every step.
pub fn check_layer(
    mut layer: Layer,
    params: &[f64],
    input_shape: (usize, usize),
    steps: usize,
    tolerance: f64,
) {
    let check = SequenceCheck::new(&mut layer, params, input_shape, steps, 17);
    check_sequence(layer, params, &check, tolerance);
}

/// `check_layer` on the given inputs.
pub fn check_layer_on(mut layer: Layer, params: &[f64], inputs: Vec<Mat<f64>>, tolerance: f64) {
    let check = SequenceCheck::with_inputs(&mut layer, params, inputs, &mut rng(17));
    check_sequence(layer, params, &check, tolerance);
}

fn check_sequence(mut layer: Layer, params: &[f64], check: &SequenceCheck, tolerance: f64) {
    let (grad, deltas) = check.analytic(&mut layer, params);
    if !params.is_empty() {
        let numeric = check.numeric_param_grad(&mut layer, params);
        let error = relative_error(&grad, &numeric);
        assert!(
            error < tolerance,
            "{}: parameter gradient error {error}",
            layer.name()
        );
    }
    for (t, delta) in deltas.iter().enumerate() {
        let numeric = check.numeric_input_grad(&mut layer, params, t);
        let error = relative_error(&flatten(delta), &flatten(&numeric));
        assert!(
            error < tolerance,
            "{}: input gradient error {error} at step {t}",
            layer.name()
        );
    }
}
