use faer::{Mat, MatRef};
use log::trace;
use rand::rngs::StdRng;

use super::StepHistory;
use crate::{
    ActivationFunction, Context, Initialization, LayerConfig, Module, NnError, RecurrentConfig,
    Result,
    activation_functions::{FastSigmoid, FastTanh, Sigmoid, Tanh},
    utils::{add_row_sums, check_len, check_rows, mat_view, mat_view_mut, mul, mul_add, shape},
};

/// Nonlinearities used by the gates of an `Lstm`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Gating {
    #[default]
    Exact,
    /// Piecewise approximations of `sigmoid` and `tanh`. Back propagation is
    /// exact for the approximation, so it drifts from the true LSTM gradient.
    Fast,
}

impl Gating {
    fn sigmoid(self, x: f64) -> f64 {
        match self {
            Gating::Exact => Sigmoid::apply(x),
            Gating::Fast => FastSigmoid::apply(x),
        }
    }

    fn sigmoid_deriv(self, x: f64) -> f64 {
        match self {
            Gating::Exact => Sigmoid::deriv(x),
            Gating::Fast => FastSigmoid::deriv(x),
        }
    }

    fn tanh(self, x: f64) -> f64 {
        match self {
            Gating::Exact => Tanh::apply(x),
            Gating::Fast => FastTanh::apply(x),
        }
    }

    fn tanh_deriv(self, x: f64) -> f64 {
        match self {
            Gating::Exact => Tanh::deriv(x),
            Gating::Fast => FastTanh::deriv(x),
        }
    }
}

#[derive(Debug, Clone)]
struct LstmStep {
    x: Mat<f64>,
    h_prev: Mat<f64>,
    c_prev: Mat<f64>,
    /// Gate pre-activations, rows `[i; f; o; g]`.
    z: Mat<f64>,
    c: Mat<f64>,
}

/// Value of a carried state matrix, or zero when nothing is carried for this
/// batch shape.
fn carried(m: &Mat<f64>, k: usize, j: usize, batch: usize) -> f64 {
    if m.ncols() == batch && k < m.nrows() {
        m[(k, j)]
    } else {
        0.0
    }
}

/// Long short-term memory cell, one call per time step.
///
/// Parameters: input weights `W_x` (`4n x in`), recurrent weights `W_h`
/// (`4n x n`), then the bias (`4n`). Gate rows are ordered input, forget,
/// output, candidate.
///
/// Every forward call retains the step for back propagation through time.
/// With a window `rho`, steps older than `rho` are dropped and backward calls
/// beyond the window return a zero input gradient.
#[derive(Debug, Clone)]
pub struct Lstm {
    n_inputs: usize,
    n_outputs: usize,
    gating: Gating,
    stateful: bool,
    history: StepHistory<LstmStep>,
    hidden: Mat<f64>,
    cell: Mat<f64>,
    /// Gradients flowing into the previous step's hidden and cell state.
    hidden_grad: Mat<f64>,
    cell_grad: Mat<f64>,
    /// Gate pre-activation gradients of the active step.
    gate_grads: Option<Mat<f64>>,
}

impl Lstm {
    pub fn new(n_inputs: usize, n_outputs: usize) -> Self {
        Self {
            n_inputs,
            n_outputs,
            gating: Gating::Exact,
            stateful: false,
            history: StepHistory::default(),
            hidden: Mat::zeros(0, 0),
            cell: Mat::zeros(0, 0),
            hidden_grad: Mat::zeros(0, 0),
            cell_grad: Mat::zeros(0, 0),
            gate_grads: None,
        }
    }

    pub fn fast(n_inputs: usize, n_outputs: usize) -> Self {
        Self::new(n_inputs, n_outputs).with_gating(Gating::Fast)
    }

    pub fn from_config(config: RecurrentConfig, gating: Gating) -> Self {
        Self::new(config.input, config.output)
            .with_gating(gating)
            .with_rho(config.rho)
            .with_stateful(config.stateful)
    }

    pub fn with_gating(mut self, gating: Gating) -> Self {
        self.gating = gating;
        self
    }

    /// Bounds the number of retained steps. Drops every retained step.
    pub fn with_rho(mut self, rho: Option<usize>) -> Self {
        self.history = StepHistory::new(rho);
        self
    }

    /// Carry hidden and cell state from one sequence into the next.
    pub fn with_stateful(mut self, stateful: bool) -> Self {
        self.stateful = stateful;
        self
    }

    pub fn gating(&self) -> Gating {
        self.gating
    }

    pub fn rho(&self) -> Option<usize> {
        self.history.capacity()
    }

    pub fn is_stateful(&self) -> bool {
        self.stateful
    }

    /// Hidden state after the latest forward call.
    pub fn hidden(&self) -> MatRef<'_, f64> {
        self.hidden.as_ref()
    }

    /// Cell state after the latest forward call.
    pub fn cell(&self) -> MatRef<'_, f64> {
        self.cell.as_ref()
    }

    fn gate_rows(&self) -> usize {
        4 * self.n_outputs
    }

    fn split<'a>(&self, params: &'a [f64]) -> (MatRef<'a, f64>, MatRef<'a, f64>, &'a [f64]) {
        let rows = self.gate_rows();
        let (w_x, rest) = params.split_at(rows * self.n_inputs);
        let (w_h, b) = rest.split_at(rows * self.n_outputs);
        (
            mat_view(w_x, rows, self.n_inputs),
            mat_view(w_h, rows, self.n_outputs),
            b,
        )
    }

    fn initial_state(&self, batch: usize) -> (Mat<f64>, Mat<f64>) {
        let expected = (self.n_outputs, batch);
        if shape(self.hidden.as_ref()) == expected && shape(self.cell.as_ref()) == expected {
            return (self.hidden.clone(), self.cell.clone());
        }
        if self.stateful && self.hidden.ncols() != 0 {
            trace!(
                "{}: batch size changed to {batch}, carried state dropped",
                self.name()
            );
        }
        (
            Mat::zeros(self.n_outputs, batch),
            Mat::zeros(self.n_outputs, batch),
        )
    }
}

impl Module for Lstm {
    fn name(&self) -> &'static str {
        match self.gating {
            Gating::Exact => "lstm",
            Gating::Fast => "fast_lstm",
        }
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
        let (h_prev, c_prev) = self.initial_state(batch);
        let (w_x, w_h, b) = self.split(params);

        let mut z = mul(w_x, input);
        mul_add(z.as_mut(), w_h, h_prev.as_ref());
        for j in 0..batch {
            for (k, b_k) in b.iter().enumerate() {
                z[(k, j)] += b_k;
            }
        }

        let g = self.gating;
        let c = Mat::from_fn(n, batch, |k, j| {
            let input_gate = g.sigmoid(z[(k, j)]);
            let forget_gate = g.sigmoid(z[(n + k, j)]);
            let candidate = g.tanh(z[(3 * n + k, j)]);
            forget_gate * c_prev[(k, j)] + input_gate * candidate
        });
        let h = Mat::from_fn(n, batch, |k, j| {
            g.sigmoid(z[(2 * n + k, j)]) * g.tanh(c[(k, j)])
        });

        self.hidden = h.clone();
        self.cell = c.clone();
        let evicted = self.history.push(LstmStep {
            x: input.to_owned(),
            h_prev,
            c_prev,
            z,
            c,
        });
        if evicted {
            trace!("{}: oldest step left the BPTT window", self.name());
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
        let name = self.name();
        let n = self.n_outputs;
        let batch = output_grad.ncols();
        let g = self.gating;
        let (w_x, w_h, _) = self.split(params);
        let hidden_next = std::mem::replace(&mut self.hidden_grad, Mat::zeros(0, 0));
        let cell_next = std::mem::replace(&mut self.cell_grad, Mat::zeros(0, 0));

        let Some(step) = self.history.activate_latest() else {
            // Past the window: the gradient is truncated here.
            self.gate_grads = None;
            return Ok(Mat::zeros(self.n_inputs, batch));
        };
        if step.x.ncols() != batch {
            return Err(NnError::ShapeMismatch {
                layer: name,
                expected: (n, step.x.ncols()),
                found: shape(output_grad),
            });
        }

        let mut dz = Mat::zeros(4 * n, batch);
        let mut cell_grad = Mat::zeros(n, batch);
        for j in 0..batch {
            for k in 0..n {
                let z_i = step.z[(k, j)];
                let z_f = step.z[(n + k, j)];
                let z_o = step.z[(2 * n + k, j)];
                let z_g = step.z[(3 * n + k, j)];
                let c = step.c[(k, j)];

                let dh = output_grad[(k, j)] + carried(&hidden_next, k, j, batch);
                let dc = dh * g.sigmoid(z_o) * g.tanh_deriv(c) + carried(&cell_next, k, j, batch);

                dz[(k, j)] = dc * g.tanh(z_g) * g.sigmoid_deriv(z_i);
                dz[(n + k, j)] = dc * step.c_prev[(k, j)] * g.sigmoid_deriv(z_f);
                dz[(2 * n + k, j)] = dh * g.tanh(c) * g.sigmoid_deriv(z_o);
                dz[(3 * n + k, j)] = dc * g.sigmoid(z_i) * g.tanh_deriv(z_g);
                cell_grad[(k, j)] = dc * g.sigmoid(z_f);
            }
        }

        let delta = mul(w_x.transpose(), dz.as_ref());
        self.hidden_grad = mul(w_h.transpose(), dz.as_ref());
        self.cell_grad = cell_grad;
        self.gate_grads = Some(dz);
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
        let (Some(dz), Some(step)) = (&self.gate_grads, self.history.active()) else {
            return Ok(());
        };
        let rows = self.gate_rows();
        let (d_w_x, rest) = grad.split_at_mut(rows * self.n_inputs);
        let (d_w_h, d_b) = rest.split_at_mut(rows * self.n_outputs);
        mul_add(
            mat_view_mut(d_w_x, rows, self.n_inputs),
            dz.as_ref(),
            step.x.transpose(),
        );
        mul_add(
            mat_view_mut(d_w_h, rows, self.n_outputs),
            dz.as_ref(),
            step.h_prev.transpose(),
        );
        add_row_sums(d_b, dz.as_ref());
        Ok(())
    }

    fn begin_sequence(&mut self) {
        self.history.clear();
        self.hidden_grad = Mat::zeros(0, 0);
        self.cell_grad = Mat::zeros(0, 0);
        self.gate_grads = None;
        if self.stateful {
            trace!("{}: carrying state into the next sequence", self.name());
        } else {
            self.hidden = Mat::zeros(0, 0);
            self.cell = Mat::zeros(0, 0);
        }
    }

    fn config(&self) -> LayerConfig {
        let cell = RecurrentConfig {
            input: self.n_inputs,
            output: self.n_outputs,
            rho: self.rho(),
            stateful: self.stateful,
        };
        match self.gating {
            Gating::Exact => LayerConfig::Lstm(cell),
            Gating::Fast => LayerConfig::FastLstm(cell),
        }
    }
}
