//! Configuration scalars of layers and networks.
//!
//! Together with the flat parameter buffer (`parameters()` on a network)
//! this is everything needed to persist and restore a model.
//!
//! ```json
//! {
//!   "kind": "rnn",
//!   "loss": "negative_log_likelihood",
//!   "rho": 5,
//!   "layers": [
//!     { "type": "linear", "input": 1, "output": 10 },
//!     { "type": "lstm", "input": 10, "output": 3 },
//!     { "type": "log_soft_max" }
//!   ]
//! }
//! ```

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    Activation, AddBias, AlphaDropout, BatchNorm, Constant, ConvGeometry, Convolution, Dropout,
    DynActivationFunction, FlexibleRelu, Gating, Gru, HardTanh, Initialization, Join, Layer,
    LayerNorm, LeakyRelu, Linear, LinearNoBias, LogSoftMax, Lookup, Loss, Lstm, Merge, MergeKind,
    MultiplyConstant, Result, Select, Sequential, TransposedConvolution,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerConfig {
    Activation {
        function: String,
    },
    LeakyRelu {
        #[serde(default = "default_leaky_alpha")]
        alpha: f64,
    },
    HardTanh {
        #[serde(default = "default_hard_min")]
        min: f64,
        #[serde(default = "default_hard_max")]
        max: f64,
    },
    FlexibleRelu {
        #[serde(default)]
        alpha: f64,
    },
    LogSoftMax,
    Constant {
        size: usize,
        value: f64,
    },
    MultiplyConstant {
        scalar: f64,
    },
    Add {
        size: usize,
    },
    Linear {
        input: usize,
        output: usize,
    },
    LinearNoBias {
        input: usize,
        output: usize,
    },
    Lookup {
        vocabulary: usize,
        dim: usize,
    },
    Select {
        index: usize,
        #[serde(default)]
        elements: Option<usize>,
    },
    Join,
    Convolution(ConvGeometry),
    TransposedConvolution(ConvGeometry),
    Sequential {
        layers: Vec<LayerConfig>,
    },
    Concat {
        branches: Vec<LayerConfig>,
    },
    AddMerge {
        branches: Vec<LayerConfig>,
    },
    MultiplyMerge {
        branches: Vec<LayerConfig>,
    },
    Dropout {
        ratio: f64,
    },
    AlphaDropout {
        ratio: f64,
    },
    BatchNorm {
        size: usize,
        #[serde(default = "default_epsilon")]
        epsilon: f64,
        #[serde(default)]
        momentum: Option<f64>,
    },
    LayerNorm {
        size: usize,
        #[serde(default = "default_epsilon")]
        epsilon: f64,
    },
    Lstm(RecurrentConfig),
    FastLstm(RecurrentConfig),
    Gru(RecurrentConfig),
}

/// Shape of a recurrent cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrentConfig {
    pub input: usize,
    pub output: usize,
    /// BPTT window of the cell; `None` keeps every step.
    #[serde(default)]
    pub rho: Option<usize>,
    /// Carry hidden state across sequences.
    #[serde(default)]
    pub stateful: bool,
}

fn default_leaky_alpha() -> f64 {
    0.03
}

fn default_hard_min() -> f64 {
    -1.0
}

fn default_hard_max() -> f64 {
    1.0
}

pub(crate) fn default_epsilon() -> f64 {
    1e-8
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    #[default]
    Ffn,
    Rnn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub kind: NetworkKind,
    #[serde(default)]
    pub loss: Loss,
    #[serde(default)]
    pub init: Initialization,
    /// Seeds initialization and dropout masks.
    #[serde(default)]
    pub seed: u64,
    /// Number of retained time steps (RNN only); `None` keeps all.
    #[serde(default)]
    pub rho: Option<usize>,
    /// Only the last time step contributes to the loss (RNN only).
    #[serde(default)]
    pub single: bool,
    pub layers: Vec<LayerConfig>,
}

impl NetworkConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.init.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Builds every configured layer.
    pub fn build_layers(&self) -> Result<Vec<Layer>> {
        build_all(&self.layers)
    }
}

/// Loads a network configuration from a JSON file.
pub fn load_config(path: impl AsRef<Path>) -> Result<NetworkConfig> {
    let contents = fs::read_to_string(path)?;
    NetworkConfig::from_json(&contents)
}

fn build_all(configs: &[LayerConfig]) -> Result<Vec<Layer>> {
    configs.iter().map(Layer::from_config).collect()
}

impl Layer {
    /// Rebuilds a layer from its configuration scalars.
    pub fn from_config(config: &LayerConfig) -> Result<Self> {
        Ok(match config {
            LayerConfig::Activation { function } => {
                Activation::new(DynActivationFunction::from_name(function)?).into()
            }
            LayerConfig::LeakyRelu { alpha } => LeakyRelu::new(*alpha).into(),
            LayerConfig::HardTanh { min, max } => HardTanh::new(*min, *max)?.into(),
            LayerConfig::FlexibleRelu { alpha } => FlexibleRelu::new(*alpha).into(),
            LayerConfig::LogSoftMax => LogSoftMax.into(),
            LayerConfig::Constant { size, value } => Constant::new(*size, *value).into(),
            LayerConfig::MultiplyConstant { scalar } => MultiplyConstant::new(*scalar).into(),
            LayerConfig::Add { size } => AddBias::new(*size).into(),
            LayerConfig::Linear { input, output } => Linear::new(*input, *output).into(),
            LayerConfig::LinearNoBias { input, output } => {
                LinearNoBias::new(*input, *output).into()
            }
            LayerConfig::Lookup { vocabulary, dim } => Lookup::new(*vocabulary, *dim).into(),
            LayerConfig::Select { index, elements } => match elements {
                Some(elements) => Select::with_elements(*index, *elements).into(),
                None => Select::new(*index).into(),
            },
            LayerConfig::Join => Join.into(),
            LayerConfig::Convolution(geometry) => Convolution::new(*geometry)?.into(),
            LayerConfig::TransposedConvolution(geometry) => {
                TransposedConvolution::new(*geometry)?.into()
            }
            LayerConfig::Sequential { layers } => Sequential::from_layers(build_all(layers)?).into(),
            LayerConfig::Concat { branches } => {
                Merge::with_branches(MergeKind::Concat, build_all(branches)?)?.into()
            }
            LayerConfig::AddMerge { branches } => {
                Merge::with_branches(MergeKind::Add, build_all(branches)?)?.into()
            }
            LayerConfig::MultiplyMerge { branches } => {
                Merge::with_branches(MergeKind::Multiply, build_all(branches)?)?.into()
            }
            LayerConfig::Dropout { ratio } => Dropout::new(*ratio)?.into(),
            LayerConfig::AlphaDropout { ratio } => AlphaDropout::new(*ratio)?.into(),
            LayerConfig::BatchNorm {
                size,
                epsilon,
                momentum,
            } => BatchNorm::with_options(*size, *epsilon, *momentum)?.into(),
            LayerConfig::LayerNorm { size, epsilon } => {
                LayerNorm::with_epsilon(*size, *epsilon)?.into()
            }
            LayerConfig::Lstm(cell) => Lstm::from_config(*cell, Gating::Exact).into(),
            LayerConfig::FastLstm(cell) => Lstm::from_config(*cell, Gating::Fast).into(),
            LayerConfig::Gru(cell) => Gru::from_config(*cell).into(),
        })
    }
}
