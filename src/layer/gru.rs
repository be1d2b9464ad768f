use faer::{Mat, MatRef, prelude::ReborrowMut};
use log::trace;
use rand::rngs::StdRng;

use super::StepHistory;
use crate::{
    ActivationFunction, Context, Initialization, LayerConfig, Module, NnError, RecurrentConfig,
    Result,
    activation_functions::{Sigmoid, Tanh},
    utils::{add_row_sums, check_len, check_rows, mat_view, mat_view_mut, mul, mul_add, shape},
};

#[derive(Debug, Clone)]
struct GruStep {
    x: Mat<f64>,
    h_prev: Mat<f64>,
    /// Pre-activations, rows `[update; reset; candidate]`.
    a: Mat<f64>,
}

/// Gated recurrent unit, one call per time step.
///
/// ```text
/// z = sigmoid(W_z x + U_z h + b_z)
/// r = sigmoid(W_r x + U_r h + b_r)
/// o = tanh(W_o x + U_o (r * h) + b_o)
/// h' = z * h + (1 - z) * o
/// ```
///
/// Parameters: `W` (`3n x in`), `U` (`3n x n`), then the bias (`3n`).
#[derive(Debug, Clone)]
pub struct Gru {
    n_inputs: usize,
    n_outputs: usize,
    stateful: bool,
    history: StepHistory<GruStep>,
    hidden: Mat<f64>,
    hidden_grad: Mat<f64>,
    /// Pre-activation gradients of the active step, split by which recurrent
    /// input they multiply: `h` for the update and reset rows (`2n`), `r * h`
    /// for the candidate rows (`n`).
    gate_grads: Option<(Mat<f64>, Mat<f64>)>,
}

impl Gru {
    pub fn new(n_inputs: usize, n_outputs: usize) -> Self {
        Self {
            n_inputs,
            n_outputs,
            stateful: false,
            history: StepHistory::default(),
            hidden: Mat::zeros(0, 0),
            hidden_grad: Mat::zeros(0, 0),
            gate_grads: None,
        }
    }

    pub fn from_config(config: RecurrentConfig) -> Self {
        Self::new(config.input, config.output)
            .with_rho(config.rho)
            .with_stateful(config.stateful)
    }

    /// Bounds the number of retained steps. Drops every retained step.
    pub fn with_rho(mut self, rho: Option<usize>) -> Self {
        self.history = StepHistory::new(rho);
        self
    }

    pub fn with_stateful(mut self, stateful: bool) -> Self {
        self.stateful = stateful;
        self
    }

    pub fn rho(&self) -> Option<usize> {
        self.history.capacity()
    }

    pub fn is_stateful(&self) -> bool {
        self.stateful
    }

    pub fn hidden(&self) -> MatRef<'_, f64> {
        self.hidden.as_ref()
    }

    fn gate_rows(&self) -> usize {
        3 * self.n_outputs
    }

    fn split<'a>(&self, params: &'a [f64]) -> (MatRef<'a, f64>, MatRef<'a, f64>, &'a [f64]) {
        let rows = self.gate_rows();
        let (w, rest) = params.split_at(rows * self.n_inputs);
        let (u, b) = rest.split_at(rows * self.n_outputs);
        (
            mat_view(w, rows, self.n_inputs),
            mat_view(u, rows, self.n_outputs),
            b,
        )
    }

    fn initial_state(&self, batch: usize) -> Mat<f64> {
        if shape(self.hidden.as_ref()) == (self.n_outputs, batch) {
            return self.hidden.clone();
        }
        if self.stateful && self.hidden.ncols() != 0 {
            trace!("gru: batch size changed to {batch}, carried state dropped");
        }
        Mat::zeros(self.n_outputs, batch)
    }
}

/// `r * h` of a step.
fn gated_hidden(step: &GruStep, n: usize) -> Mat<f64> {
    Mat::from_fn(n, step.h_prev.ncols(), |k, j| {
        Sigmoid::apply(step.a[(n + k, j)]) * step.h_prev[(k, j)]
    })
}

/// `[top; bottom]`
fn stack_rows(top: MatRef<'_, f64>, bottom: MatRef<'_, f64>) -> Mat<f64> {
    let split = top.nrows();
    Mat::from_fn(split + bottom.nrows(), top.ncols(), |i, j| {
        if i < split { top[(i, j)] } else { bottom[(i - split, j)] }
    })
}

impl Module for Gru {
    fn name(&self) -> &'static str {
        "gru"
    }

    fn n_params(&self) -> usize {
        self.gate_rows() * (self.n_inputs + self.n_outputs + 1)
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
        let n = self.n_outputs;
        let batch = input.ncols();
        let h_prev = self.initial_state(batch);
        let (w, u, b) = self.split(params);

        let mut a = mul(w, input);
        for j in 0..batch {
            for (k, b_k) in b.iter().enumerate() {
                a[(k, j)] += b_k;
            }
        }
        // U h feeds the update and reset rows, U (r * h) the candidate rows.
        mul_add(a.as_mut().subrows_mut(0, 2 * n), u.subrows(0, 2 * n), h_prev.as_ref());
        let r_h = Mat::from_fn(n, batch, |k, j| {
            Sigmoid::apply(a[(n + k, j)]) * h_prev[(k, j)]
        });
        mul_add(a.as_mut().subrows_mut(2 * n, n), u.subrows(2 * n, n), r_h.as_ref());

        let h = Mat::from_fn(n, batch, |k, j| {
            let z = Sigmoid::apply(a[(k, j)]);
            z * h_prev[(k, j)] + (1.0 - z) * Tanh::apply(a[(2 * n + k, j)])
        });
        self.hidden = h.clone();
        let evicted = self.history.push(GruStep {
            x: input.to_owned(),
            h_prev,
            a,
        });
        if evicted {
            trace!("gru: oldest step left the BPTT window");
        }
        Ok(h)
    }

    fn backward(
        &mut self,
        params: &[f64],
        _input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_len(self.name(), params, self.n_params())?;
        check_rows(self.name(), output_grad, self.n_outputs)?;
        let n = self.n_outputs;
        let batch = output_grad.ncols();
        let (w, u, _) = self.split(params);
        let hidden_next = std::mem::replace(&mut self.hidden_grad, Mat::zeros(0, 0));

        let Some(step) = self.history.activate_latest() else {
            self.gate_grads = None;
            return Ok(Mat::zeros(self.n_inputs, batch));
        };
        if step.x.ncols() != batch {
            return Err(NnError::ShapeMismatch {
                layer: "gru",
                expected: (n, step.x.ncols()),
                found: shape(output_grad),
            });
        }

        let dh = Mat::from_fn(n, batch, |k, j| {
            let carried = if shape(hidden_next.as_ref()) == (n, batch) {
                hidden_next[(k, j)]
            } else {
                0.0
            };
            output_grad[(k, j)] + carried
        });

        // Candidate rows first: the reset gate needs U_o^T d_a_o.
        let d_candidate = Mat::from_fn(n, batch, |k, j| {
            let z = Sigmoid::apply(step.a[(k, j)]);
            dh[(k, j)] * (1.0 - z) * Tanh::deriv(step.a[(2 * n + k, j)])
        });
        let d_rh = mul(u.subrows(2 * n, n).transpose(), d_candidate.as_ref());

        let mut d_gates = Mat::zeros(2 * n, batch);
        for j in 0..batch {
            for k in 0..n {
                let o = Tanh::apply(step.a[(2 * n + k, j)]);
                let h_prev = step.h_prev[(k, j)];
                d_gates[(k, j)] = dh[(k, j)] * (h_prev - o) * Sigmoid::deriv(step.a[(k, j)]);
                d_gates[(n + k, j)] = d_rh[(k, j)] * h_prev * Sigmoid::deriv(step.a[(n + k, j)]);
            }
        }

        let mut hidden_grad = mul(u.subrows(0, 2 * n).transpose(), d_gates.as_ref());
        for j in 0..batch {
            for k in 0..n {
                let z = Sigmoid::apply(step.a[(k, j)]);
                let r = Sigmoid::apply(step.a[(n + k, j)]);
                hidden_grad[(k, j)] += dh[(k, j)] * z + d_rh[(k, j)] * r;
            }
        }

        let d_a = stack_rows(d_gates.as_ref(), d_candidate.as_ref());
        let delta = mul(w.transpose(), d_a.as_ref());
        self.hidden_grad = hidden_grad;
        self.gate_grads = Some((d_gates, d_candidate));
        Ok(delta)
    }

    fn gradient(
        &mut self,
        _params: &[f64],
        _input: MatRef<'_, f64>,
        _output_grad: MatRef<'_, f64>,
        grad: &mut [f64],
    ) -> Result<()> {
        check_len(self.name(), grad, self.n_params())?;
        let (Some((d_gates, d_candidate)), Some(step)) = (&self.gate_grads, self.history.active())
        else {
            return Ok(());
        };
        let n = self.n_outputs;
        let rows = self.gate_rows();
        let (d_w, rest) = grad.split_at_mut(rows * self.n_inputs);
        let (d_u, d_b) = rest.split_at_mut(rows * n);

        let d_a = stack_rows(d_gates.as_ref(), d_candidate.as_ref());
        mul_add(
            mat_view_mut(d_w, rows, self.n_inputs),
            d_a.as_ref(),
            step.x.transpose(),
        );
        add_row_sums(d_b, d_a.as_ref());

        let mut d_u = mat_view_mut(d_u, rows, n);
        mul_add(
            d_u.rb_mut().subrows_mut(0, 2 * n),
            d_gates.as_ref(),
            step.h_prev.transpose(),
        );
        let r_h = gated_hidden(step, n);
        mul_add(d_u.subrows_mut(2 * n, n), d_candidate.as_ref(), r_h.transpose());
        Ok(())
    }

    fn begin_sequence(&mut self) {
        self.history.clear();
        self.hidden_grad = Mat::zeros(0, 0);
        self.gate_grads = None;
        if self.stateful {
            trace!("gru: carrying state into the next sequence");
        } else {
            self.hidden = Mat::zeros(0, 0);
        }
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::Gru(RecurrentConfig {
            input: self.n_inputs,
            output: self.n_outputs,
            rho: self.rho(),
            stateful: self.stateful,
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn sigmoid(x: f64) -> f64 {
        1.0 / (1.0 + (-x).exp())
    }

    #[test]
    fn unit_weights_over_two_steps() {
        let mut gru = Gru::new(3, 1);
        let params = vec![1.0; gru.n_params()];
        let mut ctx = Context::training(0);
        let x = Mat::from_fn(3, 1, |_, _| 1.0);

        let h1 = gru.forward(&mut ctx, &params, x.as_ref()).unwrap()[(0, 0)];
        assert_relative_eq!(h1, (1.0 - sigmoid(4.0)) * 4.0f64.tanh(), max_relative = 1e-12);

        let h2 = gru.forward(&mut ctx, &params, x.as_ref()).unwrap()[(0, 0)];
        let z = sigmoid(4.0 + h1);
        let r = sigmoid(4.0 + h1);
        let expected = z * h1 + (1.0 - z) * (4.0 + r * h1).tanh();
        assert_relative_eq!(h2, expected, max_relative = 1e-12);
    }

    /// The cell equations with every product written out over the full
    /// `3n`-row `U`.
    fn dense_step(params: &[f64], n_in: usize, n: usize, x: &[f64], h: &[f64]) -> Vec<f64> {
        let rows = 3 * n;
        let w = |k: usize, i: usize| params[i * rows + k];
        let u = |k: usize, m: usize| params[rows * n_in + m * rows + k];
        let b = |k: usize| params[rows * (n_in + n) + k];
        let affine = |k: usize| (0..n_in).map(|i| w(k, i) * x[i]).sum::<f64>() + b(k);
        let recur = |k: usize, v: &[f64]| (0..n).map(|m| u(k, m) * v[m]).sum::<f64>();
        let z: Vec<f64> = (0..n).map(|k| sigmoid(affine(k) + recur(k, h))).collect();
        let r: Vec<f64> = (0..n).map(|k| sigmoid(affine(n + k) + recur(n + k, h))).collect();
        let r_h: Vec<f64> = (0..n).map(|k| r[k] * h[k]).collect();
        (0..n)
            .map(|k| {
                let o = (affine(2 * n + k) + recur(2 * n + k, &r_h)).tanh();
                z[k] * h[k] + (1.0 - z[k]) * o
            })
            .collect()
    }

    #[test]
    fn matches_the_dense_equations() {
        let mut gru = Gru::new(2, 3);
        let params: Vec<f64> = (0..gru.n_params())
            .map(|i| ((i * 7 % 11) as f64 - 5.0) / 10.0)
            .collect();
        let mut ctx = Context::training(0);
        let xs = [[0.5, -1.0], [1.5, 0.25]];
        let mut h = vec![0.0; 3];
        for x in xs {
            let input = Mat::from_fn(2, 1, |i, _| x[i]);
            let output = gru.forward(&mut ctx, &params, input.as_ref()).unwrap();
            h = dense_step(&params, 2, 3, &x, &h);
            for k in 0..3 {
                assert_relative_eq!(output[(k, 0)], h[k], max_relative = 1e-12);
            }
        }
    }

    #[test]
    fn gradient_without_backward_adds_nothing() {
        let mut gru = Gru::new(2, 2);
        let params = vec![0.3; gru.n_params()];
        let mut grad = vec![0.0; gru.n_params()];
        let x = Mat::<f64>::zeros(2, 1);
        gru.gradient(&params, x.as_ref(), x.as_ref(), &mut grad).unwrap();
        assert!(grad.iter().all(|g| *g == 0.0));
    }
}
