use faer::{Mat, MatRef};
use rand::rngs::StdRng;

use super::StepHistory;
use crate::{
    Context, Initialization, Layer, LayerConfig, Module, NnError, Result,
    core::{self, DerivBuffer, ParamSlot, ResultBuffer, param_buffer::layout},
};

/// A pipeline of layers usable as a single layer.
///
/// Every forward call retains its intermediate outputs until the matching
/// backward call, so a `Sequential` can be unrolled through time like any
/// other layer.
#[derive(Debug, Clone, Default)]
pub struct Sequential {
    layers: Vec<Layer>,
    history: StepHistory<ResultBuffer>,
    deriv_buffer: DerivBuffer,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_layers(layers: Vec<Layer>) -> Self {
        Self {
            layers,
            ..Self::default()
        }
    }

    /// Appends a layer. Must happen before the owning network is reset.
    pub fn push(&mut self, layer: impl Into<Layer>) {
        self.layers.push(layer.into());
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    fn slots(&self) -> Box<[ParamSlot]> {
        layout(self.layers.iter().map(Module::n_params)).0
    }
}

impl Module for Sequential {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn n_params(&self) -> usize {
        self.layers.iter().map(Module::n_params).sum()
    }

    fn reset(
        &mut self,
        params: &mut [f64],
        init: &Initialization,
        rng: &mut StdRng,
    ) -> Result<()> {
        let slots = self.slots();
        for (layer, slot) in self.layers.iter_mut().zip(&slots) {
            layer.reset(slot.of_mut(params), init, rng)?;
        }
        Ok(())
    }

    fn forward(
        &mut self,
        ctx: &mut Context,
        params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        let slots = self.slots();
        let mut result_buffer = ResultBuffer::default();
        core::forward(
            &mut self.layers,
            &slots,
            params,
            ctx,
            input,
            &mut result_buffer,
        )?;
        let output = result_buffer.output().to_owned();
        self.history.push(result_buffer);
        Ok(output)
    }

    fn backward(
        &mut self,
        params: &[f64],
        _input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        let slots = self.slots();
        let Some(result_buffer) = self.history.activate_latest() else {
            return Err(NnError::invalid(
                "sequential: backward without a matching forward",
            ));
        };
        core::backward(
            &mut self.layers,
            &slots,
            params,
            result_buffer,
            output_grad,
            &mut self.deriv_buffer,
        )?;
        Ok(self.deriv_buffer.delta().to_owned())
    }

    fn gradient(
        &mut self,
        params: &[f64],
        _input: MatRef<'_, f64>,
        _output_grad: MatRef<'_, f64>,
        grad: &mut [f64],
    ) -> Result<()> {
        let slots = self.slots();
        let Some(result_buffer) = self.history.active() else {
            return Err(NnError::invalid(
                "sequential: gradient without a matching backward",
            ));
        };
        core::accumulate_gradient(
            &mut self.layers,
            &slots,
            params,
            result_buffer,
            &self.deriv_buffer,
            grad,
        )
    }

    fn begin_sequence(&mut self) {
        self.history.clear();
        for layer in &mut self.layers {
            layer.begin_sequence();
        }
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::Sequential {
            layers: self.layers.iter().map(Module::config).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use faer::mat;

    use super::*;
    use crate::{AddBias, MultiplyConstant};

    #[test]
    fn chains_layers_in_order() {
        let mut sequential = Sequential::new();
        sequential.push(AddBias::new(2));
        sequential.push(MultiplyConstant::new(2.0));
        let params = [1.0, -1.0];
        let mut ctx = Context::training(0);
        let x = mat![[1.0], [1.0]];
        let output = sequential.forward(&mut ctx, &params, x.as_ref()).unwrap();
        assert_eq!((output[(0, 0)], output[(1, 0)]), (4.0, 0.0));

        let dy = mat![[1.0], [0.5]];
        let delta = sequential.backward(&params, x.as_ref(), dy.as_ref()).unwrap();
        assert_eq!((delta[(0, 0)], delta[(1, 0)]), (2.0, 1.0));
        let mut grad = [0.0; 2];
        sequential
            .gradient(&params, x.as_ref(), dy.as_ref(), &mut grad)
            .unwrap();
        assert_eq!(grad, [2.0, 1.0]);
    }

    #[test]
    fn unrolled_calls_pair_up_in_reverse() {
        let mut sequential = Sequential::from_layers(vec![crate::Linear::new(1, 1).into()]);
        let params = [3.0, 0.0];
        let mut ctx = Context::training(0);
        for x in [1.0, 2.0] {
            sequential.forward(&mut ctx, &params, mat![[x]].as_ref()).unwrap();
        }
        let mut grad = [0.0; 2];
        for x in [2.0, 1.0] {
            let input = mat![[x]];
            let dy = mat![[1.0]];
            sequential.backward(&params, input.as_ref(), dy.as_ref()).unwrap();
            sequential
                .gradient(&params, input.as_ref(), dy.as_ref(), &mut grad)
                .unwrap();
        }
        // dW = 1 * 2 + 1 * 1
        assert_eq!(grad, [3.0, 2.0]);
    }
}
