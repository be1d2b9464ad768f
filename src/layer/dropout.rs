//! Stochastic regularization layers.
//!
//! Both layers are the identity in `Mode::Deterministic`.

use faer::{Mat, MatRef};
use rand::Rng;

use super::StepHistory;
use crate::{
    Context, LayerConfig, Module, NnError, Result,
    utils::{check_shape, shape, zip_map},
};

fn check_ratio(layer: &str, ratio: f64) -> Result<()> {
    if !(0.0..1.0).contains(&ratio) {
        return Err(NnError::degenerate(format!(
            "{layer} probability must lie in [0, 1), got {ratio}"
        )));
    }
    Ok(())
}

/// Draws a keep mask: `1` with probability `1 - ratio`, else `0`.
fn keep_mask(ctx: &mut Context, ratio: f64, nrows: usize, ncols: usize) -> Mat<f64> {
    Mat::from_fn(nrows, ncols, |_, _| {
        if ctx.rng.random::<f64>() >= ratio { 1.0 } else { 0.0 }
    })
}

/// Zeroes each element with probability `ratio` and rescales survivors by
/// `1 / (1 - ratio)` so the expected output equals the input.
#[derive(Debug, Clone)]
pub struct Dropout {
    ratio: f64,
    /// Scaled mask of each pending forward call; `None` for a pass-through.
    history: StepHistory<Option<Mat<f64>>>,
}

impl Dropout {
    pub fn new(ratio: f64) -> Result<Self> {
        check_ratio("dropout", ratio)?;
        Ok(Self {
            ratio,
            history: StepHistory::default(),
        })
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Scaled mask drawn by the latest stochastic forward call.
    pub fn mask(&self) -> Option<MatRef<'_, f64>> {
        self.history.latest()?.as_ref().map(|m| m.as_ref())
    }
}

impl Module for Dropout {
    fn name(&self) -> &'static str {
        "dropout"
    }

    fn forward(
        &mut self,
        ctx: &mut Context,
        _params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        if ctx.is_deterministic() {
            self.history.push(None);
            return Ok(input.to_owned());
        }
        let scale = 1.0 / (1.0 - self.ratio);
        let mut mask = keep_mask(ctx, self.ratio, input.nrows(), input.ncols());
        for j in 0..mask.ncols() {
            for i in 0..mask.nrows() {
                mask[(i, j)] *= scale;
            }
        }
        let output = zip_map(input, mask.as_ref(), |x, m| x * m);
        self.history.push(Some(mask));
        Ok(output)
    }

    fn backward(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_shape(self.name(), output_grad, shape(input))?;
        match self.history.activate_latest() {
            Some(Some(mask)) => Ok(zip_map(output_grad, mask.as_ref(), |dy, m| dy * m)),
            Some(None) => Ok(output_grad.to_owned()),
            None => Err(NnError::invalid("dropout: backward without a matching forward")),
        }
    }

    fn begin_sequence(&mut self) {
        self.history.clear();
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::Dropout { ratio: self.ratio }
    }
}

/// `-lambda * alpha` of the SELU activation: the value SELU saturates to.
const ALPHA_DASH: f64 = -1.7580993408473766;

/// Self-normalizing dropout: dropped elements are set to the SELU
/// saturation value and the result is affinely corrected so that zero mean
/// and unit variance inputs keep their mean and variance.
#[derive(Debug, Clone)]
pub struct AlphaDropout {
    ratio: f64,
    a: f64,
    b: f64,
    /// Unscaled keep mask of each pending forward call.
    history: StepHistory<Option<Mat<f64>>>,
}

impl AlphaDropout {
    pub fn new(ratio: f64) -> Result<Self> {
        check_ratio("alpha dropout", ratio)?;
        let a = ((1.0 - ratio) * (1.0 + ratio * ALPHA_DASH.powi(2))).powf(-0.5);
        let b = -a * ALPHA_DASH * ratio;
        Ok(Self {
            ratio,
            a,
            b,
            history: StepHistory::default(),
        })
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Keep mask (`1` kept, `0` dropped) of the latest stochastic forward call.
    pub fn mask(&self) -> Option<MatRef<'_, f64>> {
        self.history.latest()?.as_ref().map(|m| m.as_ref())
    }
}

impl Module for AlphaDropout {
    fn name(&self) -> &'static str {
        "alpha_dropout"
    }

    fn forward(
        &mut self,
        ctx: &mut Context,
        _params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        if ctx.is_deterministic() {
            self.history.push(None);
            return Ok(input.to_owned());
        }
        let mask = keep_mask(ctx, self.ratio, input.nrows(), input.ncols());
        let (a, b) = (self.a, self.b);
        let output = zip_map(input, mask.as_ref(), |x, m| {
            a * (x * m + ALPHA_DASH * (1.0 - m)) + b
        });
        self.history.push(Some(mask));
        Ok(output)
    }

    fn backward(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        check_shape(self.name(), output_grad, shape(input))?;
        let a = self.a;
        match self.history.activate_latest() {
            Some(Some(mask)) => Ok(zip_map(output_grad, mask.as_ref(), |dy, m| dy * m * a)),
            Some(None) => Ok(output_grad.to_owned()),
            None => Err(NnError::invalid(
                "alpha dropout: backward without a matching forward",
            )),
        }
    }

    fn begin_sequence(&mut self) {
        self.history.clear();
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::AlphaDropout { ratio: self.ratio }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn filled(n: usize, value: f64) -> Mat<f64> {
        Mat::from_fn(n, 1, |_, _| value)
    }

    #[test]
    fn expected_value_is_preserved() {
        let p = 0.2;
        let input = filled(1000, 1.0 - p);
        let mut layer = Dropout::new(p).unwrap();
        let mut ctx = Context::training(42);
        let output = layer.forward(&mut ctx, &[], input.as_ref()).unwrap();
        assert_abs_diff_eq!(output.sum() / 1000.0, 1.0 - p, epsilon = 0.05);
        let delta = layer.backward(&[], input.as_ref(), input.as_ref()).unwrap();
        assert_abs_diff_eq!(delta.sum() / 1000.0, 1.0 - p, epsilon = 0.05);

        ctx.mode = crate::Mode::Deterministic;
        let output = layer.forward(&mut ctx, &[], input.as_ref()).unwrap();
        assert_eq!(output.sum(), input.sum());
    }

    #[test]
    fn drop_rate_matches_probability() {
        let input = filled(1500, 1.0);
        let mut ctx = Context::training(7);
        for p in [0.1, 0.3, 0.4, 0.7, 0.8] {
            let mut kept = 0usize;
            for _ in 0..10 {
                let mut layer = Dropout::new(p).unwrap();
                let output = layer.forward(&mut ctx, &[], input.as_ref()).unwrap();
                kept += (0..1500).filter(|&i| output[(i, 0)] != 0.0).count();
            }
            let expected = 1500.0 * (1.0 - p) * 10.0;
            assert!((kept as f64 - expected).abs() / expected <= 0.15);
        }
    }

    #[test]
    fn alpha_dropout_keeps_mean_and_variance() {
        use rand::SeedableRng;
        use rand_distr::{Distribution, StandardNormal};

        let mut rng = rand::rngs::StdRng::seed_from_u64(5);
        let input = Mat::from_fn(1000, 1, |_, _| {
            let x: f64 = StandardNormal.sample(&mut rng);
            x
        });
        let mean = |m: &Mat<f64>| m.sum() / m.nrows() as f64;
        let var = |m: &Mat<f64>| {
            let mu = mean(m);
            (0..m.nrows()).map(|i| (m[(i, 0)] - mu).powi(2)).sum::<f64>() / (m.nrows() - 1) as f64
        };

        let mut layer = AlphaDropout::new(0.2).unwrap();
        let mut ctx = Context::training(5);
        let output = layer.forward(&mut ctx, &[], input.as_ref()).unwrap();
        assert_abs_diff_eq!(mean(&input), mean(&output), epsilon = 0.1);
        assert_abs_diff_eq!(var(&input), var(&output), epsilon = 0.1);

        let kept = layer.mask().unwrap().sum();
        assert!((kept / 1000.0 - 0.8).abs() < 0.05);

        ctx.mode = crate::Mode::Deterministic;
        let output = layer.forward(&mut ctx, &[], input.as_ref()).unwrap();
        assert_eq!(output.sum(), input.sum());
    }

    #[test]
    fn rejects_out_of_range_probability() {
        assert!(matches!(
            Dropout::new(1.0),
            Err(NnError::NumericDegenerate { .. })
        ));
        assert!(AlphaDropout::new(-0.1).is_err());
    }
}
