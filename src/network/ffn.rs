use faer::{Mat, MatRef};

use super::{DifferentiableFunction, Pipeline, batch_range};
use crate::{
    Initialization, Layer, Loss, Mode, NetworkConfig, NetworkKind, NnError, Result,
    core::{self, DerivBuffer, ResultBuffer},
    utils::cols_of,
};

/// Feed-forward network: a pipeline of layers followed by a loss.
///
/// Parameters are laid out and initialized lazily, on the first call that
/// needs them or on an explicit `reset`. Adding a layer afterwards lays the
/// buffer out again from scratch.
#[derive(Debug, Clone)]
pub struct Ffn {
    pipeline: Pipeline,
    loss: Loss,
    predictors: Mat<f64>,
    responses: Mat<f64>,
    result_buffer: ResultBuffer,
    deriv_buffer: DerivBuffer,
}

impl Default for Ffn {
    fn default() -> Self {
        Self::new(Loss::default(), Initialization::default(), 0)
    }
}

impl Ffn {
    pub fn new(loss: Loss, init: Initialization, seed: u64) -> Self {
        Self {
            pipeline: Pipeline::new("ffn", init, seed),
            loss,
            predictors: Mat::zeros(0, 0),
            responses: Mat::zeros(0, 0),
            result_buffer: ResultBuffer::default(),
            deriv_buffer: DerivBuffer::default(),
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        if config.kind != NetworkKind::Ffn {
            return Err(NnError::invalid("configuration describes a recurrent network"));
        }
        let mut ffn = Self::new(config.loss, config.init, config.seed);
        for layer in config.build_layers()? {
            ffn.add(layer);
        }
        Ok(ffn)
    }

    pub fn config(&self) -> NetworkConfig {
        NetworkConfig {
            kind: NetworkKind::Ffn,
            loss: self.loss,
            init: self.pipeline.init,
            seed: self.pipeline.seed,
            rho: None,
            single: false,
            layers: self.pipeline.layer_configs(),
        }
    }

    pub fn add(&mut self, layer: impl Into<Layer>) {
        self.pipeline.add(layer.into());
    }

    /// Lays out the parameter buffer and initializes every layer.
    pub fn reset(&mut self) -> Result<()> {
        self.pipeline.reset()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.pipeline.layers
    }

    pub fn loss(&self) -> Loss {
        self.loss
    }

    /// One column per data point in both matrices.
    pub fn set_data(&mut self, predictors: Mat<f64>, responses: Mat<f64>) -> Result<()> {
        if predictors.ncols() != responses.ncols() {
            return Err(NnError::ShapeMismatch {
                layer: "ffn",
                expected: (responses.nrows(), predictors.ncols()),
                found: (responses.nrows(), responses.ncols()),
            });
        }
        self.predictors = predictors;
        self.responses = responses;
        Ok(())
    }

    /// Parameters after `reset`; empty before.
    pub fn parameters(&self) -> &[f64] {
        self.pipeline.params.as_slice()
    }

    pub fn parameters_mut(&mut self) -> &mut [f64] {
        self.pipeline.params.as_mut_slice()
    }

    /// Replaces the whole parameter buffer, resetting first if needed.
    pub fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        self.pipeline.set_parameters(params)
    }

    /// Deterministic forward pass with the network's own parameters.
    pub fn predict(&mut self, input: MatRef<'_, f64>) -> Result<Mat<f64>> {
        self.pipeline.ensure_ready()?;
        let pipeline = &mut self.pipeline;
        pipeline.begin_sequence();
        pipeline.ctx.mode = Mode::Deterministic;
        core::forward(
            &mut pipeline.layers,
            pipeline.params.slots(),
            pipeline.params.as_slice(),
            &mut pipeline.ctx,
            input,
            &mut self.result_buffer,
        )?;
        Ok(self.result_buffer.output().to_owned())
    }

    /// Forward pass over a batch of the training data, returning the loss.
    fn forward_batch(
        &mut self,
        params: &[f64],
        begin: usize,
        batch_size: usize,
        mode: Mode,
    ) -> Result<(f64, Mat<f64>)> {
        self.pipeline.ensure_ready()?;
        self.pipeline.check_params(params)?;
        let range = batch_range(self.num_functions(), begin, batch_size)?;
        let input = cols_of(self.predictors.as_ref(), range.start, range.len());
        let target = cols_of(self.responses.as_ref(), range.start, range.len());

        let pipeline = &mut self.pipeline;
        pipeline.begin_sequence();
        pipeline.ctx.mode = mode;
        core::forward(
            &mut pipeline.layers,
            pipeline.params.slots(),
            params,
            &mut pipeline.ctx,
            input.as_ref(),
            &mut self.result_buffer,
        )?;
        let loss = self.loss.forward(self.result_buffer.output(), target.as_ref())?;
        Ok((loss, target))
    }
}

impl DifferentiableFunction for Ffn {
    fn num_functions(&self) -> usize {
        self.predictors.ncols()
    }

    fn evaluate_with_mode(
        &mut self,
        params: &[f64],
        begin: usize,
        batch_size: usize,
        mode: Mode,
    ) -> Result<f64> {
        let (loss, _) = self.forward_batch(params, begin, batch_size, mode)?;
        Ok(loss)
    }

    /// Evaluated in training mode.
    fn gradient(
        &mut self,
        params: &[f64],
        begin: usize,
        grad: &mut [f64],
        batch_size: usize,
    ) -> Result<f64> {
        let (loss, target) = self.forward_batch(params, begin, batch_size, Mode::Training)?;
        self.pipeline.check_params(grad)?;
        let seed = self.loss.backward(self.result_buffer.output(), target.as_ref())?;

        let pipeline = &mut self.pipeline;
        core::backward(
            &mut pipeline.layers,
            pipeline.params.slots(),
            params,
            &self.result_buffer,
            seed.as_ref(),
            &mut self.deriv_buffer,
        )?;
        grad.fill(0.0);
        core::accumulate_gradient(
            &mut pipeline.layers,
            pipeline.params.slots(),
            params,
            &self.result_buffer,
            &self.deriv_buffer,
            grad,
        )?;
        Ok(loss)
    }

    fn parameters(&self) -> &[f64] {
        Ffn::parameters(self)
    }

    fn parameters_mut(&mut self) -> &mut [f64] {
        Ffn::parameters_mut(self)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use faer::mat;

    use super::*;
    use crate::{BatchNorm, Linear, LogSoftMax};

    fn classifier() -> Ffn {
        let mut ffn = Ffn::new(Loss::NegativeLogLikelihood, Initialization::default(), 3);
        ffn.add(Linear::new(2, 2));
        ffn.add(LogSoftMax);
        ffn.set_data(
            mat![[1.0, -1.0, 0.5], [0.0, 2.0, -0.5]],
            mat![[0.0, 1.0, 0.0]],
        )
        .unwrap();
        ffn
    }

    #[test]
    fn reset_is_lazy_and_seeded() {
        let mut a = classifier();
        assert!(a.parameters().is_empty());
        a.predict(mat![[0.0], [0.0]].as_ref()).unwrap();
        assert_eq!(a.parameters().len(), 6);

        let mut b = classifier();
        b.reset().unwrap();
        assert_eq!(a.parameters(), b.parameters());
    }

    #[test]
    fn gradient_overwrites_and_returns_the_loss() {
        let mut ffn = classifier();
        ffn.reset().unwrap();
        let params = ffn.parameters().to_vec();
        let mut grad = vec![100.0; params.len()];
        let loss = ffn.gradient(&params, 0, &mut grad, 3).unwrap();
        assert_relative_eq!(loss, ffn.evaluate(&params, 0, 3).unwrap(), max_relative = 1e-12);

        let mut again = vec![0.0; params.len()];
        ffn.gradient(&params, 0, &mut again, 3).unwrap();
        assert_eq!(grad, again);
    }

    #[test]
    fn batch_outside_the_data_is_rejected() {
        let mut ffn = classifier();
        let params = {
            ffn.reset().unwrap();
            ffn.parameters().to_vec()
        };
        assert!(matches!(
            ffn.evaluate(&params, 2, 2),
            Err(NnError::InvalidConfiguration { .. })
        ));
        assert!(matches!(
            ffn.evaluate(&params[1..], 0, 1),
            Err(NnError::ShapeMismatch { layer: "ffn", .. })
        ));
    }

    #[test]
    fn training_mode_evaluation_is_the_differentiated_objective() {
        let mut ffn = Ffn::new(Loss::NegativeLogLikelihood, Initialization::default(), 3);
        ffn.add(Linear::new(2, 2));
        ffn.add(BatchNorm::new(2));
        ffn.add(LogSoftMax);
        ffn.set_data(
            mat![[1.0, -1.0, 0.5], [0.0, 2.0, -0.5]],
            mat![[0.0, 1.0, 0.0]],
        )
        .unwrap();
        ffn.reset().unwrap();
        let params = ffn.parameters().to_vec();
        let mut grad = vec![0.0; params.len()];
        let loss = ffn.gradient(&params, 0, &mut grad, 3).unwrap();
        let training = ffn
            .evaluate_with_mode(&params, 0, 3, Mode::Training)
            .unwrap();
        assert_relative_eq!(loss, training, max_relative = 1e-12);
        // Batch statistics make the first layer's bias irrelevant.
        for g in &grad[4..6] {
            assert!(g.abs() < 1e-12, "{g}");
        }
    }
}
