use faer::{Mat, MatRef};
use serde::{Deserialize, Serialize};

use crate::{
    NnError, Result,
    utils::{check_rows, check_shape, shape},
};

/// Terminal loss of a network. Produces the scalar loss and the seed
/// gradient of the backward pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Loss {
    /// Expects log-probabilities (see `LogSoftMax`). The target is a single
    /// row of 0-based class indices. Summed over the batch.
    #[default]
    NegativeLogLikelihood,
    /// Mean over every element.
    MeanSquaredError,
}

impl Loss {
    pub fn forward(&self, prediction: MatRef<'_, f64>, target: MatRef<'_, f64>) -> Result<f64> {
        match self {
            Self::NegativeLogLikelihood => {
                let mut loss = 0.0;
                for j in 0..prediction.ncols() {
                    let class = class_index(prediction, target, j)?;
                    loss -= prediction[(class, j)];
                }
                Ok(loss)
            }
            Self::MeanSquaredError => {
                check_shape("mean_squared_error", target, shape(prediction))?;
                let n = (prediction.nrows() * prediction.ncols()).max(1) as f64;
                let mut loss = 0.0;
                for j in 0..prediction.ncols() {
                    for i in 0..prediction.nrows() {
                        loss += (prediction[(i, j)] - target[(i, j)]).powi(2);
                    }
                }
                Ok(loss / n)
            }
        }
    }

    /// Loss gradient with respect to `prediction`.
    pub fn backward(
        &self,
        prediction: MatRef<'_, f64>,
        target: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        let mut delta = Mat::zeros(prediction.nrows(), prediction.ncols());
        match self {
            Self::NegativeLogLikelihood => {
                for j in 0..prediction.ncols() {
                    let class = class_index(prediction, target, j)?;
                    delta[(class, j)] = -1.0;
                }
            }
            Self::MeanSquaredError => {
                check_shape("mean_squared_error", target, shape(prediction))?;
                let n = (prediction.nrows() * prediction.ncols()).max(1) as f64;
                for j in 0..prediction.ncols() {
                    for i in 0..prediction.nrows() {
                        delta[(i, j)] = 2.0 * (prediction[(i, j)] - target[(i, j)]) / n;
                    }
                }
            }
        }
        Ok(delta)
    }
}

fn class_index(prediction: MatRef<'_, f64>, target: MatRef<'_, f64>, j: usize) -> Result<usize> {
    check_rows("negative_log_likelihood", target, 1)?;
    if target.ncols() != prediction.ncols() {
        return Err(NnError::ShapeMismatch {
            layer: "negative_log_likelihood",
            expected: (1, prediction.ncols()),
            found: shape(target),
        });
    }
    let t = target[(0, j)];
    if t < 0.0 || t.fract() != 0.0 || t as usize >= prediction.nrows() {
        return Err(NnError::invalid(format!(
            "class index {t} is not one of the {} classes",
            prediction.nrows()
        )));
    }
    Ok(t as usize)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use faer::mat;

    use super::*;

    #[test]
    fn nll_picks_target_rows() {
        let prediction = mat![[-0.1, -2.0], [-2.5, -0.3]];
        let target = mat![[0.0, 1.0]];
        let loss = Loss::NegativeLogLikelihood
            .forward(prediction.as_ref(), target.as_ref())
            .unwrap();
        assert_abs_diff_eq!(loss, 0.4, epsilon = 1e-12);
        let delta = Loss::NegativeLogLikelihood
            .backward(prediction.as_ref(), target.as_ref())
            .unwrap();
        assert_eq!(delta[(0, 0)], -1.0);
        assert_eq!(delta[(1, 1)], -1.0);
        assert_eq!(delta[(1, 0)], 0.0);
    }

    #[test]
    fn nll_rejects_out_of_range_class() {
        let prediction = mat![[-0.1], [-2.5]];
        let target = mat![[2.0]];
        assert!(
            Loss::NegativeLogLikelihood
                .forward(prediction.as_ref(), target.as_ref())
                .is_err()
        );
    }

    #[test]
    fn mse_is_a_mean() {
        let prediction = mat![[1.0, 2.0]];
        let target = mat![[0.0, 0.0]];
        let loss = Loss::MeanSquaredError
            .forward(prediction.as_ref(), target.as_ref())
            .unwrap();
        assert_abs_diff_eq!(loss, 2.5, epsilon = 1e-12);
        let delta = Loss::MeanSquaredError
            .backward(prediction.as_ref(), target.as_ref())
            .unwrap();
        assert_abs_diff_eq!(delta[(0, 1)], 2.0, epsilon = 1e-12);
    }
}
