//! Network drivers: own a layer pipeline, its parameter buffer and the
//! training data, and expose them to an external optimizer.

use std::ops::Range;

use log::debug;
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    Context, Initialization, Layer, LayerConfig, Mode, Module, NnError, Result,
    core::ParamBuffer, utils::check_len,
};

mod ffn;
mod rnn;

pub use ffn::*;
pub use rnn::*;

/// Objective separable over `num_functions()` data points, as seen by an
/// optimizer.
///
/// `params` is the optimizer's current iterate. It must have the length of
/// `parameters()`; the network's own buffer is left untouched.
pub trait DifferentiableFunction {
    fn num_functions(&self) -> usize;

    /// Loss over data points `begin..begin + batch_size`, with dropout off
    /// and normalization layers on their running statistics.
    fn evaluate(&mut self, params: &[f64], begin: usize, batch_size: usize) -> Result<f64> {
        self.evaluate_with_mode(params, begin, batch_size, Mode::Deterministic)
    }

    /// Loss over data points `begin..begin + batch_size` in the given mode.
    ///
    /// In `Mode::Training` this is the objective `gradient` differentiates:
    /// normalization uses batch statistics (and updates the running ones)
    /// and dropout samples fresh masks.
    fn evaluate_with_mode(
        &mut self,
        params: &[f64],
        begin: usize,
        batch_size: usize,
        mode: Mode,
    ) -> Result<f64>;

    /// Overwrites `grad` with the loss gradient over data points
    /// `begin..begin + batch_size` and returns the loss.
    fn gradient(
        &mut self,
        params: &[f64],
        begin: usize,
        grad: &mut [f64],
        batch_size: usize,
    ) -> Result<f64>;

    fn parameters(&self) -> &[f64];

    fn parameters_mut(&mut self) -> &mut [f64];
}

/// Layers plus the parameter buffer they index into. Shared by both drivers.
#[derive(Debug, Clone)]
struct Pipeline {
    name: &'static str,
    layers: Vec<Layer>,
    init: Initialization,
    seed: u64,
    ctx: Context,
    params: ParamBuffer,
    ready: bool,
}

impl Pipeline {
    fn new(name: &'static str, init: Initialization, seed: u64) -> Self {
        Self {
            name,
            layers: Vec::new(),
            init,
            seed,
            ctx: Context::training(seed),
            params: ParamBuffer::default(),
            ready: false,
        }
    }

    fn add(&mut self, layer: Layer) {
        self.layers.push(layer);
        self.ready = false;
    }

    /// Lays out the parameter buffer and initializes every layer's slot.
    fn reset(&mut self) -> Result<()> {
        self.init.validate()?;
        let mut params = ParamBuffer::create(self.layers.iter().map(Module::n_params));
        let mut rng = StdRng::seed_from_u64(self.seed);
        for (u, layer) in self.layers.iter_mut().enumerate() {
            let slot = params.slots()[u];
            layer.reset(slot.of_mut(params.as_mut_slice()), &self.init, &mut rng)?;
        }
        debug!(
            "{}: reset {} layers, {} parameters",
            self.name,
            self.layers.len(),
            params.len()
        );
        self.params = params;
        self.ctx = Context::training(self.seed);
        self.ready = true;
        Ok(())
    }

    fn ensure_ready(&mut self) -> Result<()> {
        if !self.ready {
            self.reset()?;
        }
        Ok(())
    }

    fn check_params(&self, params: &[f64]) -> Result<()> {
        check_len(self.name, params, self.params.len())
    }

    fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        self.ensure_ready()?;
        self.check_params(params)?;
        self.params.as_mut_slice().copy_from_slice(params);
        Ok(())
    }

    fn begin_sequence(&mut self) {
        for layer in &mut self.layers {
            layer.begin_sequence();
        }
    }

    fn layer_configs(&self) -> Vec<LayerConfig> {
        self.layers.iter().map(Module::config).collect()
    }
}

/// Data points `begin..begin + batch_size` of `n`.
fn batch_range(n: usize, begin: usize, batch_size: usize) -> Result<Range<usize>> {
    let end = begin.saturating_add(batch_size);
    if batch_size == 0 || end > n {
        return Err(NnError::invalid(format!(
            "batch {begin}..{end} is outside the {n} data points"
        )));
    }
    Ok(begin..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_must_lie_inside_the_data() {
        assert_eq!(batch_range(10, 2, 3).unwrap(), 2..5);
        assert!(batch_range(10, 8, 3).is_err());
        assert!(batch_range(10, 0, 0).is_err());
    }
}
