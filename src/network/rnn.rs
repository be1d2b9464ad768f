use std::collections::VecDeque;

use faer::{Mat, MatRef};
use log::{trace, warn};

use super::{DifferentiableFunction, Pipeline, batch_range};
use crate::{
    Initialization, Layer, Loss, Mode, NetworkConfig, NetworkKind, NnError, Result,
    core::{self, DerivBuffer, ResultBuffer},
    utils::cols_of,
};

/// Forward results of one time step, kept for back propagation through
/// time.
#[derive(Debug, Clone)]
struct StepRecord {
    result_buffer: ResultBuffer,
    /// Loss gradient at the pipeline output for this step.
    seed: Mat<f64>,
}

/// Recurrent network: runs its pipeline once per time step and trains it
/// with (truncated) back propagation through time.
///
/// Sequences are time-major: `predictors[t]` holds step `t` of every
/// sequence, one column per sequence. A data point is a sequence.
///
/// Only the last `rho` steps of a sequence are retained for the backward
/// pass. Earlier steps still contribute to the loss and to the state seen by
/// later steps, but no gradient flows back into them.
#[derive(Debug, Clone)]
pub struct Rnn {
    pipeline: Pipeline,
    loss: Loss,
    rho: Option<usize>,
    single: bool,
    predictors: Vec<Mat<f64>>,
    responses: Vec<Mat<f64>>,
    records: VecDeque<StepRecord>,
    deriv_buffer: DerivBuffer,
}

impl Default for Rnn {
    fn default() -> Self {
        Self::new(Loss::default(), Initialization::default(), 0)
    }
}

/// Response of step `t`, if that step contributes to the loss.
fn target_of(
    responses: &[Mat<f64>],
    single: bool,
    steps: usize,
    t: usize,
) -> Option<MatRef<'_, f64>> {
    match single {
        true if t + 1 == steps => responses.last().map(|m| m.as_ref()),
        true => None,
        false => responses.get(t).map(|m| m.as_ref()),
    }
}

impl Rnn {
    pub fn new(loss: Loss, init: Initialization, seed: u64) -> Self {
        Self {
            pipeline: Pipeline::new("rnn", init, seed),
            loss,
            rho: None,
            single: false,
            predictors: Vec::new(),
            responses: Vec::new(),
            records: VecDeque::new(),
            deriv_buffer: DerivBuffer::default(),
        }
    }

    /// Bounds the number of time steps retained for back propagation.
    pub fn with_rho(mut self, rho: Option<usize>) -> Self {
        if rho == Some(0) {
            warn!("rnn: rho of 0 retains no time steps, every gradient will be zero");
        }
        self.rho = rho;
        self
    }

    /// Only the last time step contributes to the loss.
    pub fn with_single(mut self, single: bool) -> Self {
        self.single = single;
        self
    }

    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        if config.kind != NetworkKind::Rnn {
            return Err(NnError::invalid("configuration describes a feed-forward network"));
        }
        let mut rnn = Self::new(config.loss, config.init, config.seed)
            .with_rho(config.rho)
            .with_single(config.single);
        for layer in config.build_layers()? {
            rnn.add(layer);
        }
        Ok(rnn)
    }

    pub fn config(&self) -> NetworkConfig {
        NetworkConfig {
            kind: NetworkKind::Rnn,
            loss: self.loss,
            init: self.pipeline.init,
            seed: self.pipeline.seed,
            rho: self.rho,
            single: self.single,
            layers: self.pipeline.layer_configs(),
        }
    }

    pub fn add(&mut self, layer: impl Into<Layer>) {
        self.pipeline.add(layer.into());
    }

    pub fn reset(&mut self) -> Result<()> {
        self.pipeline.reset()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.pipeline.layers
    }

    pub fn rho(&self) -> Option<usize> {
        self.rho
    }

    pub fn is_single(&self) -> bool {
        self.single
    }

    /// `responses` holds one matrix per time step, or just one (the last
    /// step's) for a `single` network.
    pub fn set_data(&mut self, predictors: Vec<Mat<f64>>, responses: Vec<Mat<f64>>) -> Result<()> {
        let n = predictors.first().map_or(0, |m| m.ncols());
        let expected_steps = if self.single { 1 } else { predictors.len() };
        if responses.len() != expected_steps {
            return Err(NnError::invalid(format!(
                "expected responses for {expected_steps} time steps, got {}",
                responses.len()
            )));
        }
        for m in predictors.iter().chain(&responses) {
            if m.ncols() != n {
                return Err(NnError::ShapeMismatch {
                    layer: "rnn",
                    expected: (m.nrows(), n),
                    found: (m.nrows(), m.ncols()),
                });
            }
        }
        self.predictors = predictors;
        self.responses = responses;
        Ok(())
    }

    pub fn parameters(&self) -> &[f64] {
        self.pipeline.params.as_slice()
    }

    pub fn parameters_mut(&mut self) -> &mut [f64] {
        self.pipeline.params.as_mut_slice()
    }

    pub fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        self.pipeline.set_parameters(params)
    }

    /// Deterministic forward pass over one sequence with the network's own
    /// parameters. Returns the output of every step.
    pub fn predict(&mut self, sequence: &[Mat<f64>]) -> Result<Vec<Mat<f64>>> {
        self.pipeline.ensure_ready()?;
        let pipeline = &mut self.pipeline;
        pipeline.begin_sequence();
        pipeline.ctx.mode = Mode::Deterministic;
        let mut result_buffer = ResultBuffer::default();
        let mut outputs = Vec::with_capacity(sequence.len());
        for step in sequence {
            core::forward(
                &mut pipeline.layers,
                pipeline.params.slots(),
                pipeline.params.as_slice(),
                &mut pipeline.ctx,
                step.as_ref(),
                &mut result_buffer,
            )?;
            outputs.push(result_buffer.output().to_owned());
        }
        Ok(outputs)
    }

    /// Runs every time step of a batch of sequences, calling `on_step` with
    /// each step's results and response. Returns the summed loss.
    fn unroll(
        &mut self,
        params: &[f64],
        begin: usize,
        batch_size: usize,
        mode: Mode,
        mut on_step: impl FnMut(ResultBuffer, Option<Mat<f64>>) -> Result<()>,
    ) -> Result<f64> {
        self.pipeline.ensure_ready()?;
        self.pipeline.check_params(params)?;
        let range = batch_range(self.num_functions(), begin, batch_size)?;
        let steps = self.predictors.len();

        let pipeline = &mut self.pipeline;
        pipeline.begin_sequence();
        pipeline.ctx.mode = mode;
        let mut loss = 0.0;
        for t in 0..steps {
            let input = cols_of(self.predictors[t].as_ref(), range.start, range.len());
            let mut result_buffer = ResultBuffer::default();
            core::forward(
                &mut pipeline.layers,
                pipeline.params.slots(),
                params,
                &mut pipeline.ctx,
                input.as_ref(),
                &mut result_buffer,
            )?;
            let seed = match target_of(&self.responses, self.single, steps, t) {
                Some(target) => {
                    let target = cols_of(target, range.start, range.len());
                    let output = result_buffer.output();
                    loss += self.loss.forward(output, target.as_ref())?;
                    Some(self.loss.backward(output, target.as_ref())?)
                }
                None => None,
            };
            on_step(result_buffer, seed)?;
        }
        Ok(loss)
    }
}

impl DifferentiableFunction for Rnn {
    fn num_functions(&self) -> usize {
        self.predictors.first().map_or(0, |m| m.ncols())
    }

    /// Summed over every contributing time step.
    fn evaluate_with_mode(
        &mut self,
        params: &[f64],
        begin: usize,
        batch_size: usize,
        mode: Mode,
    ) -> Result<f64> {
        self.unroll(params, begin, batch_size, mode, |_, _| Ok(()))
    }

    /// Back propagation through the last `rho` time steps, in training mode.
    /// Every step's gradient lands in the same shared parameter slots.
    fn gradient(
        &mut self,
        params: &[f64],
        begin: usize,
        grad: &mut [f64],
        batch_size: usize,
    ) -> Result<f64> {
        self.pipeline.ensure_ready()?;
        self.pipeline.check_params(grad)?;
        let rho = self.rho;
        let mut records = std::mem::take(&mut self.records);
        records.clear();
        let loss = self.unroll(params, begin, batch_size, Mode::Training, |result_buffer, seed| {
            let seed = seed.unwrap_or_else(|| {
                let output = result_buffer.output();
                Mat::zeros(output.nrows(), output.ncols())
            });
            records.push_back(StepRecord {
                result_buffer,
                seed,
            });
            if rho.is_some_and(|rho| records.len() > rho) {
                records.pop_front();
                trace!("rnn: time step left the BPTT window");
            }
            Ok(())
        })?;

        grad.fill(0.0);
        let pipeline = &mut self.pipeline;
        for record in records.iter().rev() {
            core::backward(
                &mut pipeline.layers,
                pipeline.params.slots(),
                params,
                &record.result_buffer,
                record.seed.as_ref(),
                &mut self.deriv_buffer,
            )?;
            core::accumulate_gradient(
                &mut pipeline.layers,
                pipeline.params.slots(),
                params,
                &record.result_buffer,
                &self.deriv_buffer,
                grad,
            )?;
        }
        self.records = records;
        Ok(loss)
    }

    fn parameters(&self) -> &[f64] {
        Rnn::parameters(self)
    }

    fn parameters_mut(&mut self) -> &mut [f64] {
        Rnn::parameters_mut(self)
    }
}
