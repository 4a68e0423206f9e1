use log::debug;
use log_once::warn_once;
use rand::Rng;
use rv::dist::{Gamma, Poisson};
use rv::traits::Rv;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

use crate::errs::{SpanError, SpanResult};
use crate::util::WeightedMoments;

/// Floor on the variance-to-mean ratio of a fitted negative binomial.
/// Below it the NB degenerates towards a Poisson and the failures estimate
/// diverges; 1.1 is the floor, kept as a named constant.
pub const NB_VAR_MEAN_MULTIPLIER: f64 = 1.1;

const EPS: f64 = 1e-10;

/// Negative binomial over bin counts with mean `mu` and failures `r`,
/// `p = mu / (mu + r)`, `variance = mu + mu^2 / r`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegBinEmission {
    mean: f64,
    failures: f64,
}

impl NegBinEmission {
    pub fn new(mean: f64, failures: f64) -> SpanResult<Self> {
        if !(mean > 0f64) || !(failures > 0f64) {
            return Err(SpanError::invalid_input(format!(
                "negative binomial requires positive mean and failures, \
                 got mean {mean}, failures {failures}"
            )));
        }
        Ok(Self { mean, failures })
    }

    /// Moment-matched construction; the variance is floored at
    /// [`NB_VAR_MEAN_MULTIPLIER`] times the mean.
    pub fn from_moments(mean: f64, variance: f64) -> SpanResult<Self> {
        let mean = mean.max(EPS);
        Self::new(mean, failures_by_moments(mean, variance))
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn failures(&self) -> f64 {
        self.failures
    }

    pub fn success_probability(&self) -> f64 {
        self.mean / (self.mean + self.failures)
    }

    pub fn variance(&self) -> f64 {
        self.mean + self.mean * self.mean / self.failures
    }

    pub(crate) fn set_mean_keeping_fano(&mut self, mean: f64) {
        let fano = self.variance() / self.mean;
        self.mean = mean.max(EPS);
        self.failures = failures_by_moments(self.mean, self.mean * fano);
    }

    pub(crate) fn set_moments(&mut self, mean: f64, variance: f64) {
        self.mean = mean.max(EPS);
        self.failures = failures_by_moments(self.mean, variance);
    }

    fn terms(&self) -> NbTerms {
        let p = self.success_probability();
        let ln_p = self.mean.ln() - (self.mean + self.failures).ln();
        let ln_one_minus_p =
            self.failures.ln() - (self.mean + self.failures).ln();
        NbTerms {
            failures: self.failures,
            ln_p,
            constant: self.failures * ln_one_minus_p
                - ln_gamma(self.failures),
            p,
        }
    }

    pub fn ln_pmf(&self, k: u64) -> f64 {
        self.terms().ln_pmf(k)
    }

    /// Fill `out` with per-bin log-probabilities; the log-Gamma terms of
    /// the pmf are computed once per call.
    pub fn ln_probs(&self, ys: &[i32], out: &mut [f64]) {
        let terms = self.terms();
        for (y, slot) in ys.iter().zip(out.iter_mut()) {
            *slot = terms.ln_pmf((*y).max(0) as u64);
        }
    }

    /// EM update from posterior weights: weighted mean, then failures by
    /// matching the weighted second moment, with the variance floored at
    /// [`NB_VAR_MEAN_MULTIPLIER`] times the mean.
    pub(crate) fn update_from_moments(&mut self, moments: &WeightedMoments) {
        if moments.total_weight() <= 0f64 {
            warn_once!(
                "negative binomial update received zero total weight, \
                 keeping parameters"
            );
            return;
        }
        let mean = moments.mean();
        if mean <= 0f64 {
            warn_once!(
                "negative binomial update collapsed to zero mean, \
                 keeping parameters"
            );
            return;
        }
        self.set_moments(mean, moments.variance());
    }

    /// Draw a count through the Gamma-Poisson representation, which pins
    /// the mean/failures parameterization independent of pmf conventions.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> SpanResult<i32> {
        let gamma = Gamma::new(self.failures, self.failures / self.mean)
            .map_err(|e| {
                SpanError::invalid_input(format!(
                    "negative binomial sampling failed, {e}"
                ))
            })?;
        let rate: f64 = gamma.draw(rng);
        let poisson = Poisson::new(rate.max(EPS)).map_err(|e| {
            SpanError::invalid_input(format!(
                "negative binomial sampling failed, {e}"
            ))
        })?;
        let draw: u32 = poisson.draw(rng);
        Ok(draw as i32)
    }
}

struct NbTerms {
    failures: f64,
    ln_p: f64,
    constant: f64,
    p: f64,
}

impl NbTerms {
    #[inline]
    fn ln_pmf(&self, k: u64) -> f64 {
        if self.p <= 0f64 {
            return if k == 0 { 0f64 } else { f64::NEG_INFINITY };
        }
        let k = k as f64;
        ln_gamma(k + self.failures) - ln_gamma(k + 1.0)
            + self.constant
            + k * self.ln_p
    }
}

/// Failures solving `variance = mean + mean^2 / r` with the variance
/// floored at [`NB_VAR_MEAN_MULTIPLIER`] times the mean.
pub fn failures_by_moments(mean: f64, variance: f64) -> f64 {
    let floor = NB_VAR_MEAN_MULTIPLIER * mean;
    let variance = if variance < floor {
        debug!(
            "variance {variance} below {NB_VAR_MEAN_MULTIPLIER} * mean \
             {mean}, flooring"
        );
        floor
    } else {
        variance
    };
    mean * mean / (variance - mean)
}

#[cfg(test)]
mod negbin_tests {
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use statrs::distribution::{Discrete, NegativeBinomial};

    use super::*;

    #[test]
    fn test_ln_pmf_matches_reference() {
        let emission = NegBinEmission::new(4.0, 2.0).unwrap();
        // statrs parameterizes by (r, P[failure component]); its p is our
        // 1 - success probability
        let reference =
            NegativeBinomial::new(2.0, 1.0 - emission.success_probability())
                .unwrap();
        for k in [0u64, 1, 2, 5, 17, 100] {
            assert_relative_eq!(
                emission.ln_pmf(k),
                reference.ln_pmf(k),
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn test_ln_probs_fills_buffer() {
        let emission = NegBinEmission::new(2.0, 1.0).unwrap();
        let ys = [0, 1, 2, 3];
        let mut out = [0f64; 4];
        emission.ln_probs(&ys, &mut out);
        for (y, lp) in ys.iter().zip(out.iter()) {
            assert_relative_eq!(*lp, emission.ln_pmf(*y as u64));
        }
    }

    #[test]
    fn test_failures_by_moments_floor() {
        // variance below the floor degenerates to the floored estimate
        let r = failures_by_moments(10.0, 10.0);
        assert_relative_eq!(r, 100.0, epsilon = 1e-9);
        // well-dispersed case is the exact moment match
        let r = failures_by_moments(10.0, 30.0);
        assert_relative_eq!(r, 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_update_from_moments() {
        let mut emission = NegBinEmission::new(1.0, 1.0).unwrap();
        let mut moments = WeightedMoments::default();
        for y in [2.0, 4.0, 6.0, 8.0, 30.0] {
            moments.observe(y, 1.0);
        }
        emission.update_from_moments(&moments);
        assert_relative_eq!(emission.mean(), 10.0, epsilon = 1e-9);
        assert!(emission.variance() > emission.mean());
    }

    #[test]
    fn test_zero_weight_update_keeps_parameters() {
        let mut emission = NegBinEmission::new(3.0, 2.0).unwrap();
        emission.update_from_moments(&WeightedMoments::default());
        assert_relative_eq!(emission.mean(), 3.0);
        assert_relative_eq!(emission.failures(), 2.0);
    }

    #[test]
    fn test_sampling_recovers_moments() {
        let emission = NegBinEmission::new(5.0, 2.0).unwrap();
        let mut rng = StdRng::seed_from_u64(17);
        let n = 200_000;
        let mut moments = WeightedMoments::default();
        for _ in 0..n {
            moments
                .observe(emission.sample(&mut rng).unwrap() as f64, 1.0);
        }
        assert_relative_eq!(moments.mean(), 5.0, max_relative = 0.02);
        assert_relative_eq!(
            moments.variance(),
            emission.variance(),
            max_relative = 0.05
        );
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(NegBinEmission::new(0.0, 1.0).is_err());
        assert!(NegBinEmission::new(1.0, -2.0).is_err());
    }
}
