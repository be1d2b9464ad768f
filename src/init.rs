use rand::{
    distr::{Distribution, Uniform},
    rngs::StdRng,
};
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

use crate::{NnError, Result};

/// Parameter initialization rule, applied to every layer slot on reset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Initialization {
    Uniform { low: f64, high: f64 },
    Constant { value: f64 },
    Gaussian { mean: f64, std: f64 },
    /// Uniform in `±sqrt(6 / (fan_in + fan_out))`.
    Glorot,
}

impl Default for Initialization {
    fn default() -> Self {
        Self::Uniform {
            low: -1.0,
            high: 1.0,
        }
    }
}

impl Initialization {
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Uniform { low, high }
                if !(low.is_finite() && high.is_finite() && low <= high) =>
            {
                Err(NnError::invalid(format!(
                    "uniform initialization needs finite low <= high, got [{low}, {high}]"
                )))
            }
            Self::Gaussian { mean, std } if !(mean.is_finite() && std.is_finite() && std >= 0.0) => {
                Err(NnError::invalid(format!(
                    "gaussian initialization needs a finite mean and a non-negative std, \
                     got N({mean}, {std})"
                )))
            }
            Self::Constant { value } if !value.is_finite() => Err(NnError::invalid(format!(
                "constant initialization needs a finite value, got {value}"
            ))),
            _ => Ok(()),
        }
    }

    pub fn fill(
        &self,
        params: &mut [f64],
        fan_in: usize,
        fan_out: usize,
        rng: &mut StdRng,
    ) -> Result<()> {
        self.validate()?;
        match *self {
            Self::Uniform { low, high } => fill_uniform(params, low, high, rng)?,
            Self::Constant { value } => params.fill(value),
            Self::Gaussian { mean, std } => {
                let normal = Normal::new(mean, std)
                    .map_err(|e| NnError::invalid(format!("gaussian initialization: {e}")))?;
                for p in params {
                    *p = normal.sample(rng);
                }
            }
            Self::Glorot => {
                let fans = (fan_in + fan_out).max(1) as f64;
                let bound = f64::sqrt(6.0 / fans);
                fill_uniform(params, -bound, bound, rng)?;
            }
        }
        Ok(())
    }
}

fn fill_uniform(params: &mut [f64], low: f64, high: f64, rng: &mut StdRng) -> Result<()> {
    if low == high {
        params.fill(low);
        return Ok(());
    }
    let uniform = Uniform::new_inclusive(low, high)
        .map_err(|e| NnError::invalid(format!("uniform initialization: {e}")))?;
    for p in params {
        *p = uniform.sample(rng);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn uniform_respects_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut params = vec![0.0; 500];
        Initialization::Uniform { low: 0.1, high: 0.5 }
            .fill(&mut params, 1, 1, &mut rng)
            .unwrap();
        assert!(params.iter().all(|&p| (0.1..=0.5).contains(&p)));
    }

    #[test]
    fn degenerate_uniform_is_constant() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut params = vec![0.0; 4];
        Initialization::Uniform { low: 0.5, high: 0.5 }
            .fill(&mut params, 1, 1, &mut rng)
            .unwrap();
        assert_eq!(params, vec![0.5; 4]);
    }

    #[test]
    fn glorot_bound_shrinks_with_fan() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut params = vec![0.0; 1000];
        Initialization::Glorot.fill(&mut params, 300, 300, &mut rng).unwrap();
        assert!(params.iter().all(|p| p.abs() <= 0.1));
    }

    #[test]
    fn rejects_inverted_range() {
        let rule = Initialization::Uniform { low: 1.0, high: 0.0 };
        assert!(matches!(
            rule.validate(),
            Err(NnError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn rejects_non_finite_scalars() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut params = vec![0.0; 3];
        for rule in [
            Initialization::Uniform {
                low: f64::NEG_INFINITY,
                high: f64::INFINITY,
            },
            Initialization::Uniform {
                low: 0.0,
                high: f64::NAN,
            },
            Initialization::Gaussian {
                mean: f64::INFINITY,
                std: 1.0,
            },
            Initialization::Constant { value: f64::NAN },
        ] {
            assert!(matches!(
                rule.fill(&mut params, 1, 1, &mut rng),
                Err(NnError::InvalidConfiguration { .. })
            ));
        }
        assert_eq!(params, [0.0; 3]);
    }
}
