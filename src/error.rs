use derive_more::{Display, Error, From};

/// Errors raised while building or running a network.
#[derive(Debug, Display, Error, From)]
pub enum NnError {
    /// Input, output or parameter dimensions disagree. Aborts the pass.
    #[display("{layer}: shape mismatch, expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        layer: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },
    /// Detected at construction or reset time.
    #[display("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
    #[display("numerically degenerate: {reason}")]
    NumericDegenerate { reason: String },
    #[display("io error: {_0}")]
    #[from]
    Io(std::io::Error),
    #[display("malformed config: {_0}")]
    #[from]
    Json(serde_json::Error),
}

pub type Result<T, E = NnError> = std::result::Result<T, E>;

impl NnError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub(crate) fn degenerate(reason: impl Into<String>) -> Self {
        Self::NumericDegenerate {
            reason: reason.into(),
        }
    }
}
