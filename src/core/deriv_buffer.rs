use faer::{Mat, MatRef};

/// Buffer needed for performing back propagation on a pipeline.
///
/// `deltas[u]` is the loss gradient with respect to the input of layer `u`,
/// and `deltas[n_layers]` is the seed gradient at the pipeline output, so the
/// output gradient of layer `u` is always `deltas[u + 1]`.
#[derive(Debug, Clone, Default)]
pub struct DerivBuffer {
    deltas: Vec<Mat<f64>>,
}

impl DerivBuffer {
    pub(crate) fn begin(&mut self, n_layers: usize, seed: MatRef<'_, f64>) {
        self.deltas.clear();
        self.deltas.resize_with(n_layers + 1, || Mat::zeros(0, 0));
        self.deltas[n_layers] = seed.to_owned();
    }

    pub(crate) fn set_input_grad(&mut self, u: usize, delta: Mat<f64>) {
        self.deltas[u] = delta;
    }

    /// Number of layers in the pipeline.
    pub fn n_layers(&self) -> usize {
        self.deltas.len().saturating_sub(1)
    }

    /// Gradient with respect to the input of layer `u`.
    pub fn input_grad(&self, u: usize) -> MatRef<'_, f64> {
        self.deltas[u].as_ref()
    }

    /// Gradient with respect to the output of layer `u`.
    pub fn output_grad(&self, u: usize) -> MatRef<'_, f64> {
        self.deltas[u + 1].as_ref()
    }

    /// Gradient with respect to the pipeline input.
    pub fn delta(&self) -> MatRef<'_, f64> {
        self.deltas[0].as_ref()
    }
}
