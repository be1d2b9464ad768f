use std::fmt::{self, Debug};

use faer::{Mat, MatRef};

use crate::{NnError, Result};

#[derive(Clone, Copy)]
pub struct DynActivationFunction {
    name: &'static str,
    apply: fn(f64) -> f64,
    deriv: fn(f64) -> f64,
}

impl Debug for DynActivationFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(self.name, f)
    }
}

impl PartialEq for DynActivationFunction {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl DynActivationFunction {
    pub fn new<Phi: ActivationFunction>(_: Phi) -> Self {
        Self {
            name: Phi::NAME,
            apply: Phi::apply,
            deriv: Phi::deriv,
        }
    }

    /// Looks an activation function up by its `NAME`.
    pub fn from_name(name: &str) -> Result<Self> {
        use activation_functions::*;
        Ok(match name {
            Identity::NAME => Self::new(Identity),
            Sigmoid::NAME => Self::new(Sigmoid),
            Tanh::NAME => Self::new(Tanh),
            Relu::NAME => Self::new(Relu),
            Softplus::NAME => Self::new(Softplus),
            FastSigmoid::NAME => Self::new(FastSigmoid),
            FastTanh::NAME => Self::new(FastTanh),
            _ => return Err(NnError::invalid(format!("unknown activation `{name}`"))),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply(&self, x: f64) -> f64 {
        (self.apply)(x)
    }

    pub fn deriv(&self, x: f64) -> f64 {
        (self.deriv)(x)
    }

    /// Elementwise `phi(x)`.
    pub fn apply_mat(&self, x: MatRef<'_, f64>) -> Mat<f64> {
        Mat::from_fn(x.nrows(), x.ncols(), |i, j| self.apply(x[(i, j)]))
    }

    /// Elementwise `phi'(x) * dy`.
    pub fn backward_mat(&self, x: MatRef<'_, f64>, dy: MatRef<'_, f64>) -> Mat<f64> {
        Mat::from_fn(x.nrows(), x.ncols(), |i, j| {
            self.deriv(x[(i, j)]) * dy[(i, j)]
        })
    }
}

pub trait ActivationFunction: Send + Sync + 'static {
    const NAME: &'static str;

    fn apply(x: f64) -> f64;

    /// Derivative with respect to the pre-activation `x`.
    fn deriv(x: f64) -> f64;
}

pub mod activation_functions {
    use super::ActivationFunction;

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Identity;
    impl ActivationFunction for Identity {
        const NAME: &'static str = "identity";

        fn apply(x: f64) -> f64 {
            x
        }

        fn deriv(_: f64) -> f64 {
            1.0
        }
    }

    fn sigmoid(x: f64) -> f64 {
        1.0 / (1.0 + f64::exp(-x))
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Sigmoid;
    impl ActivationFunction for Sigmoid {
        const NAME: &'static str = "sigmoid";

        fn apply(x: f64) -> f64 {
            sigmoid(x)
        }

        fn deriv(x: f64) -> f64 {
            sigmoid(x) * (1.0 - sigmoid(x))
        }
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Tanh;
    impl ActivationFunction for Tanh {
        const NAME: &'static str = "tanh";

        fn apply(x: f64) -> f64 {
            f64::tanh(x)
        }

        fn deriv(x: f64) -> f64 {
            1.0 - f64::tanh(x).powi(2)
        }
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Relu;
    impl ActivationFunction for Relu {
        const NAME: &'static str = "relu";

        fn apply(x: f64) -> f64 {
            x.max(0.0)
        }

        fn deriv(x: f64) -> f64 {
            if x > 0.0 { 1.0 } else { 0.0 }
        }
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Softplus;
    impl ActivationFunction for Softplus {
        const NAME: &'static str = "softplus";

        fn apply(x: f64) -> f64 {
            // log(1 + e^x) without overflowing for large x.
            x.max(0.0) + f64::ln_1p(f64::exp(-x.abs()))
        }

        fn deriv(x: f64) -> f64 {
            sigmoid(x)
        }
    }

    const FAST_KNEE: f64 = 1.7;
    const FAST_SATURATION: f64 = 3.0;
    const FAST_OFFSET: f64 = 0.935409070603099;
    const FAST_SLOPE: f64 = 0.0458812946797165;
    const FAST_CEILING: f64 = 0.99505475368673;

    /// Piecewise rational approximation of `tanh`.
    pub(crate) fn fast_tanh(x: f64) -> f64 {
        let a = x.abs();
        let z = if a < FAST_KNEE {
            1.5 * a / (1.0 + a)
        } else if a < FAST_SATURATION {
            FAST_OFFSET + FAST_SLOPE * (a - FAST_KNEE)
        } else {
            FAST_CEILING
        };
        z.copysign(x)
    }

    pub(crate) fn fast_tanh_deriv(x: f64) -> f64 {
        let a = x.abs();
        if a < FAST_KNEE {
            1.5 / (1.0 + a).powi(2)
        } else if a < FAST_SATURATION {
            FAST_SLOPE
        } else {
            0.0
        }
    }

    /// `sigmoid(x) = (tanh(x / 2) + 1) / 2` with the fast `tanh`.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FastSigmoid;
    impl ActivationFunction for FastSigmoid {
        const NAME: &'static str = "fast_sigmoid";

        fn apply(x: f64) -> f64 {
            0.5 * (fast_tanh(0.5 * x) + 1.0)
        }

        fn deriv(x: f64) -> f64 {
            0.25 * fast_tanh_deriv(0.5 * x)
        }
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FastTanh;
    impl ActivationFunction for FastTanh {
        const NAME: &'static str = "fast_tanh";

        fn apply(x: f64) -> f64 {
            fast_tanh(x)
        }

        fn deriv(x: f64) -> f64 {
            fast_tanh_deriv(x)
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::{activation_functions::*, *};

    #[test]
    fn lookup_by_name() {
        for name in ["identity", "sigmoid", "tanh", "relu", "softplus", "fast_tanh"] {
            assert_eq!(DynActivationFunction::from_name(name).unwrap().name(), name);
        }
        assert!(DynActivationFunction::from_name("swish").is_err());
    }

    #[test]
    fn fast_approximations_stay_close() {
        for i in -60..=60 {
            let x = i as f64 * 0.1;
            assert_abs_diff_eq!(FastTanh::apply(x), x.tanh(), epsilon = 0.06);
            assert_abs_diff_eq!(FastSigmoid::apply(x), Sigmoid::apply(x), epsilon = 0.03);
        }
    }

    #[test]
    fn softplus_is_stable() {
        assert_abs_diff_eq!(Softplus::apply(0.0), 2f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(Softplus::apply(1000.0), 1000.0, epsilon = 1e-9);
        assert_abs_diff_eq!(Softplus::apply(-1000.0), 0.0, epsilon = 1e-9);
    }
}
