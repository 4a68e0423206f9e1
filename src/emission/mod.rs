use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::dataframe::DataFrame;
use crate::errs::{SpanError, SpanResult};
use crate::util::WeightedMoments;

pub mod negbin;
pub mod regression;

pub use negbin::{failures_by_moments, NegBinEmission, NB_VAR_MEAN_MULTIPLIER};
pub use regression::{
    GlmObservations, NegBinRegressionEmission, PoissonRegressionEmission,
    WlsRegression,
};

/// Degenerate emission that always produces `value`; `Constant(0)` is the
/// zero-inflation component of every state set containing `Z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantEmission {
    value: i32,
}

impl ConstantEmission {
    pub fn new(value: i32) -> Self {
        Self { value }
    }

    pub fn zero() -> Self {
        Self::new(0)
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn ln_pmf(&self, y: i32) -> f64 {
        if y == self.value {
            0f64
        } else {
            f64::NEG_INFINITY
        }
    }
}

/// Posterior-weighted observations of one scheme: a dataframe, the name of
/// its observed column, and one weight per row. Emission updates aggregate
/// over every `(state, dimension)` pair mapped to the scheme, across all
/// chromosomes.
pub struct SchemeObservations<'a> {
    pub df: &'a DataFrame,
    pub observed: &'a str,
    pub weights: &'a [f64],
}

/// The emission family as a tagged enum; five variants with inline numeric
/// loops beat a trait object here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EmissionScheme {
    Constant(ConstantEmission),
    NegBin(NegBinEmission),
    PoissonRegression(PoissonRegressionEmission),
    NegBinRegression(NegBinRegressionEmission),
}

impl EmissionScheme {
    pub fn constant_zero() -> Self {
        Self::Constant(ConstantEmission::zero())
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self, Self::Constant(_))
    }

    pub fn as_neg_bin(&self) -> Option<&NegBinEmission> {
        match self {
            Self::NegBin(emission) => Some(emission),
            _ => None,
        }
    }

    pub(crate) fn as_neg_bin_mut(&mut self) -> Option<&mut NegBinEmission> {
        match self {
            Self::NegBin(emission) => Some(emission),
            _ => None,
        }
    }

    /// Per-row log-probabilities of the observed column into `out`.
    pub fn ln_probs(
        &self,
        df: &DataFrame,
        observed: &str,
        out: &mut [f64],
    ) -> SpanResult<()> {
        let ys = df.int_column(observed)?;
        if out.len() != ys.len() {
            return Err(SpanError::DimensionMismatch(format!(
                "{} output slots for {} observations",
                out.len(),
                ys.len()
            )));
        }
        match self {
            Self::Constant(emission) => {
                for (y, slot) in ys.iter().zip(out.iter_mut()) {
                    *slot = emission.ln_pmf(*y);
                }
                Ok(())
            }
            Self::NegBin(emission) => {
                emission.ln_probs(ys, out);
                Ok(())
            }
            Self::PoissonRegression(emission) => {
                emission.ln_probs(df, observed, out)
            }
            Self::NegBinRegression(emission) => {
                emission.ln_probs(df, observed, out)
            }
        }
    }

    /// EM update from posterior-weighted observations. Constant schemes are
    /// frozen by construction.
    pub fn update(
        &mut self,
        observations: &[SchemeObservations],
    ) -> SpanResult<()> {
        match self {
            Self::Constant(_) => Ok(()),
            Self::NegBin(emission) => {
                let mut moments = WeightedMoments::default();
                for obs in observations {
                    let ys = obs.df.int_column(obs.observed)?;
                    if obs.weights.len() != ys.len() {
                        return Err(SpanError::DimensionMismatch(format!(
                            "{} weights for {} observations",
                            obs.weights.len(),
                            ys.len()
                        )));
                    }
                    for (y, w) in ys.iter().zip(obs.weights.iter()) {
                        moments.observe(*y as f64, *w);
                    }
                }
                emission.update_from_moments(&moments);
                Ok(())
            }
            Self::PoissonRegression(emission) => {
                emission.update(&to_glm_observations(observations))
            }
            Self::NegBinRegression(emission) => {
                emission.update(&to_glm_observations(observations))
            }
        }
    }

    /// Draw an observation. Regression schemes sample at the covariates of
    /// `row`; the others ignore the dataframe.
    pub fn sample<R: Rng>(
        &self,
        df: &DataFrame,
        row: usize,
        rng: &mut R,
    ) -> SpanResult<i32> {
        match self {
            Self::Constant(emission) => Ok(emission.value()),
            Self::NegBin(emission) => emission.sample(rng),
            Self::PoissonRegression(emission) => emission.sample(df, row, rng),
            Self::NegBinRegression(emission) => {
                // NB regression sampling goes through a plain NB at the
                // row's fitted mean
                let etas = emission.model().linear_predictors(df)?;
                let nb = NegBinEmission::new(
                    etas[row].exp().max(1e-10),
                    emission.failures(),
                )?;
                nb.sample(rng)
            }
        }
    }

    /// Human-readable parameter tag for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Constant(emission) => {
                format!("const({})", emission.value())
            }
            Self::NegBin(emission) => format!(
                "nb(mean={:.4}, failures={:.4})",
                emission.mean(),
                emission.failures()
            ),
            Self::PoissonRegression(emission) => format!(
                "poisson_glm(beta={:?})",
                emission.model().beta()
            ),
            Self::NegBinRegression(emission) => format!(
                "nb_glm(beta={:?}, failures={:.4})",
                emission.model().beta(),
                emission.failures()
            ),
        }
    }
}

fn to_glm_observations<'a>(
    observations: &'a [SchemeObservations<'a>],
) -> Vec<GlmObservations<'a>> {
    observations
        .iter()
        .map(|obs| GlmObservations {
            df: obs.df,
            observed: obs.observed,
            weights: obs.weights,
        })
        .collect()
}

#[cfg(test)]
mod emission_tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::dataframe::TREATMENT_COLUMN;

    fn frame(ys: Vec<i32>) -> DataFrame {
        let mut df = DataFrame::with_rows(ys.len());
        df.add_int_column(TREATMENT_COLUMN, ys).unwrap();
        df
    }

    #[test]
    fn test_constant_emission_is_degenerate() {
        let df = frame(vec![0, 1, 0]);
        let scheme = EmissionScheme::constant_zero();
        let mut out = [0f64; 3];
        scheme.ln_probs(&df, TREATMENT_COLUMN, &mut out).unwrap();
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], f64::NEG_INFINITY);
        assert_eq!(out[2], 0.0);
    }

    #[test]
    fn test_constant_update_is_frozen() {
        let df = frame(vec![5, 5, 5]);
        let mut scheme = EmissionScheme::constant_zero();
        let weights = vec![1.0; 3];
        scheme
            .update(&[SchemeObservations {
                df: &df,
                observed: TREATMENT_COLUMN,
                weights: &weights,
            }])
            .unwrap();
        assert_eq!(scheme, EmissionScheme::constant_zero());
    }

    #[test]
    fn test_negbin_update_pools_across_observations() {
        let df_a = frame(vec![1, 2, 3]);
        let df_b = frame(vec![7, 8, 9]);
        let weights = vec![1.0; 3];
        let mut scheme = EmissionScheme::NegBin(
            NegBinEmission::new(1.0, 1.0).unwrap(),
        );
        scheme
            .update(&[
                SchemeObservations {
                    df: &df_a,
                    observed: TREATMENT_COLUMN,
                    weights: &weights,
                },
                SchemeObservations {
                    df: &df_b,
                    observed: TREATMENT_COLUMN,
                    weights: &weights,
                },
            ])
            .unwrap();
        let nb = scheme.as_neg_bin().unwrap();
        assert_relative_eq!(nb.mean(), 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_mismatched_weights_rejected() {
        let df = frame(vec![1, 2, 3]);
        let mut scheme = EmissionScheme::NegBin(
            NegBinEmission::new(1.0, 1.0).unwrap(),
        );
        let err = scheme
            .update(&[SchemeObservations {
                df: &df,
                observed: TREATMENT_COLUMN,
                weights: &[1.0],
            }])
            .unwrap_err();
        assert!(matches!(err, SpanError::DimensionMismatch(_)));
    }
}
