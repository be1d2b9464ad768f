//! The layer contract and the closed set of layer kinds.

use derive_more::From;
use faer::{Mat, MatRef};
use rand::{SeedableRng, rngs::StdRng};

use crate::{Initialization, LayerConfig, Result};

mod conv;
mod dropout;
mod elementwise;
mod gru;
mod history;
mod linear;
mod lookup;
mod lstm;
mod merge;
mod norm;
mod rearrange;
mod sequential;

pub use conv::*;
pub use dropout::*;
pub use elementwise::*;
pub use gru::*;
pub use linear::*;
pub use lookup::*;
pub use lstm::*;
pub use merge::*;
pub use norm::*;
pub use rearrange::*;
pub use sequential::*;

pub(crate) use history::StepHistory;

/// Selects between training behavior and inference behavior of the
/// stochastic and normalization layers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Sample dropout masks, normalize with batch statistics.
    #[default]
    Training,
    /// Pass through / use running statistics.
    Deterministic,
}

/// Execution context threaded through every forward call.
#[derive(Debug, Clone)]
pub struct Context {
    pub mode: Mode,
    pub rng: StdRng,
}

impl Context {
    pub fn new(mode: Mode, seed: u64) -> Self {
        Self {
            mode,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn training(seed: u64) -> Self {
        Self::new(Mode::Training, seed)
    }

    pub fn deterministic(seed: u64) -> Self {
        Self::new(Mode::Deterministic, seed)
    }

    pub fn is_deterministic(&self) -> bool {
        self.mode == Mode::Deterministic
    }
}

/// The Forward/Backward/Gradient contract every layer kind implements.
///
/// A layer never owns its parameters. Every call receives the layer's slice
/// of the network's parameter buffer; the slice is `n_params()` long.
///
/// Inputs and outputs are batches, one column per sample.
pub trait Module {
    fn name(&self) -> &'static str;

    /// Length of this layer's slice of the parameter buffer.
    fn n_params(&self) -> usize {
        0
    }

    /// Initializes this layer's parameters.
    fn reset(
        &mut self,
        params: &mut [f64],
        init: &Initialization,
        rng: &mut StdRng,
    ) -> Result<()> {
        let n = params.len();
        init.fill(params, n, n, rng)
    }

    fn forward(
        &mut self,
        ctx: &mut Context,
        params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>>;

    /// Returns `J(input)^T * output_grad`, evaluated at the input and
    /// parameters of the matching `forward` call.
    fn backward(
        &mut self,
        params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>>;

    /// Adds the loss gradient with respect to this layer's parameters into
    /// `grad`. Never overwrites: repeated calls across time steps sum up.
    fn gradient(
        &mut self,
        _params: &[f64],
        _input: MatRef<'_, f64>,
        _output_grad: MatRef<'_, f64>,
        _grad: &mut [f64],
    ) -> Result<()> {
        Ok(())
    }

    /// Drops every per-step record retained for back propagation.
    fn begin_sequence(&mut self) {}

    /// Configuration scalars of this layer.
    fn config(&self) -> LayerConfig;
}

#[derive(Debug, Clone, From)]
pub enum Layer {
    Activation(Activation),
    LeakyRelu(LeakyRelu),
    HardTanh(HardTanh),
    FlexibleRelu(FlexibleRelu),
    LogSoftMax(LogSoftMax),
    Constant(Constant),
    MultiplyConstant(MultiplyConstant),
    Add(AddBias),
    Linear(Linear),
    LinearNoBias(LinearNoBias),
    Lookup(Lookup),
    Select(Select),
    Join(Join),
    Convolution(Convolution),
    TransposedConvolution(TransposedConvolution),
    Sequential(Sequential),
    Merge(Merge),
    Dropout(Dropout),
    AlphaDropout(AlphaDropout),
    BatchNorm(BatchNorm),
    LayerNorm(LayerNorm),
    Lstm(Lstm),
    Gru(Gru),
}

macro_rules! dispatch {
    ($self:expr, $layer:ident => $body:expr) => {
        match $self {
            Layer::Activation($layer) => $body,
            Layer::LeakyRelu($layer) => $body,
            Layer::HardTanh($layer) => $body,
            Layer::FlexibleRelu($layer) => $body,
            Layer::LogSoftMax($layer) => $body,
            Layer::Constant($layer) => $body,
            Layer::MultiplyConstant($layer) => $body,
            Layer::Add($layer) => $body,
            Layer::Linear($layer) => $body,
            Layer::LinearNoBias($layer) => $body,
            Layer::Lookup($layer) => $body,
            Layer::Select($layer) => $body,
            Layer::Join($layer) => $body,
            Layer::Convolution($layer) => $body,
            Layer::TransposedConvolution($layer) => $body,
            Layer::Sequential($layer) => $body,
            Layer::Merge($layer) => $body,
            Layer::Dropout($layer) => $body,
            Layer::AlphaDropout($layer) => $body,
            Layer::BatchNorm($layer) => $body,
            Layer::LayerNorm($layer) => $body,
            Layer::Lstm($layer) => $body,
            Layer::Gru($layer) => $body,
        }
    };
}

impl Module for Layer {
    fn name(&self) -> &'static str {
        dispatch!(self, layer => layer.name())
    }

    fn n_params(&self) -> usize {
        dispatch!(self, layer => layer.n_params())
    }

    fn reset(
        &mut self,
        params: &mut [f64],
        init: &Initialization,
        rng: &mut StdRng,
    ) -> Result<()> {
        dispatch!(self, layer => layer.reset(params, init, rng))
    }

    fn forward(
        &mut self,
        ctx: &mut Context,
        params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        dispatch!(self, layer => layer.forward(ctx, params, input))
    }

    fn backward(
        &mut self,
        params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        dispatch!(self, layer => layer.backward(params, input, output_grad))
    }

    fn gradient(
        &mut self,
        params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
        grad: &mut [f64],
    ) -> Result<()> {
        dispatch!(self, layer => layer.gradient(params, input, output_grad, grad))
    }

    fn begin_sequence(&mut self) {
        dispatch!(self, layer => layer.begin_sequence())
    }

    fn config(&self) -> LayerConfig {
        dispatch!(self, layer => layer.config())
    }
}

impl Layer {
    /// Borrowed view of the sub-layers owned by a composite layer.
    /// Empty for every other kind.
    pub fn children(&self) -> &[Layer] {
        match self {
            Layer::Sequential(sequential) => sequential.layers(),
            Layer::Merge(merge) => merge.branches(),
            _ => &[],
        }
    }
}
