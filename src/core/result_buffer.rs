use faer::{Mat, MatRef};

/// Buffer for storing the retained forward results of a pipeline.
///
/// Keeps a copy of the pipeline input so that every layer's input stays
/// addressable during the backward pass.
#[derive(Debug, Clone)]
pub struct ResultBuffer {
    input: Mat<f64>,
    outputs: Vec<Mat<f64>>,
}

impl Default for ResultBuffer {
    fn default() -> Self {
        Self {
            input: Mat::zeros(0, 0),
            outputs: Vec::new(),
        }
    }
}

impl ResultBuffer {
    pub(crate) fn begin(&mut self, input: MatRef<'_, f64>) {
        self.input = input.to_owned();
        self.outputs.clear();
    }

    pub(crate) fn push(&mut self, output: Mat<f64>) {
        self.outputs.push(output);
    }

    /// Number of layers that have produced an output.
    pub fn n_layers(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&self) -> MatRef<'_, f64> {
        self.input.as_ref()
    }

    /// Input that was fed into layer `u`.
    pub fn input_of(&self, u: usize) -> MatRef<'_, f64> {
        match u.checked_sub(1) {
            None => self.input.as_ref(),
            Some(u_prev) => self.outputs[u_prev].as_ref(),
        }
    }

    /// Output of layer `u`.
    /// Returns `None` if `u` is out of range.
    pub fn layer(&self, u: usize) -> Option<MatRef<'_, f64>> {
        self.outputs.get(u).map(|m| m.as_ref())
    }

    /// Output of the pipeline, or its input if it has no layers.
    pub fn output(&self) -> MatRef<'_, f64> {
        match self.outputs.last() {
            Some(output) => output.as_ref(),
            None => self.input.as_ref(),
        }
    }
}
