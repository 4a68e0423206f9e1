use log::{debug, warn};
use ndarray::Array2;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dataframe::DataFrame;
use crate::emission::{EmissionScheme, SchemeObservations};
use crate::errs::{SpanError, SpanResult};
use crate::hmm::fit::{FitOptions, FitResult};
use crate::util::ln_sum_exp;

/// Mixture of emission schemes over independent bins: the same EM machinery
/// as the HMM with responsibilities instead of state sequences. A
/// `Constant(0)` component plays the zero-inflation role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureModel {
    dimension_label: String,
    ln_weights: Vec<f64>,
    schemes: Vec<EmissionScheme>,
}

impl MixtureModel {
    pub fn new(
        dimension_label: &str,
        schemes: Vec<EmissionScheme>,
        weights: Vec<f64>,
    ) -> SpanResult<Self> {
        if schemes.is_empty() || schemes.len() != weights.len() {
            return Err(SpanError::DimensionMismatch(format!(
                "{} weights for {} mixture components",
                weights.len(),
                schemes.len()
            )));
        }
        let total: f64 = weights.iter().sum();
        if total <= 0f64 {
            return Err(SpanError::invalid_input(
                "mixture weights must have positive total".to_owned(),
            ));
        }
        Ok(Self {
            dimension_label: dimension_label.to_owned(),
            ln_weights: weights.iter().map(|w| (w / total).ln()).collect(),
            schemes,
        })
    }

    pub fn n_components(&self) -> usize {
        self.schemes.len()
    }

    pub fn dimension_label(&self) -> &str {
        &self.dimension_label
    }

    pub fn ln_weights(&self) -> &[f64] {
        &self.ln_weights
    }

    pub fn weights(&self) -> Vec<f64> {
        self.ln_weights.iter().map(|lw| lw.exp()).collect()
    }

    pub fn schemes(&self) -> &[EmissionScheme] {
        &self.schemes
    }

    pub(crate) fn swap_components(&mut self, i: usize, j: usize) {
        self.ln_weights.swap(i, j);
        self.schemes.swap(i, j);
    }

    /// Per-row component responsibilities (log space) and the data
    /// log-likelihood.
    pub fn posteriors(
        &self,
        df: &DataFrame,
    ) -> SpanResult<(Array2<f64>, f64)> {
        if df.is_empty() {
            return Err(SpanError::empty_coverage(
                "mixture responsibilities over an empty dataframe"
                    .to_owned(),
            ));
        }
        let rows = df.rows();
        let k = self.n_components();
        let mut ln_joint = Array2::<f64>::zeros((rows, k));
        let mut buffer = vec![0f64; rows];
        for (component, scheme) in self.schemes.iter().enumerate() {
            scheme.ln_probs(df, &self.dimension_label, &mut buffer)?;
            for row in 0..rows {
                ln_joint[[row, component]] =
                    self.ln_weights[component] + buffer[row];
            }
        }
        let mut ll = 0f64;
        let mut scratch = vec![0f64; k];
        for row in 0..rows {
            for (component, slot) in scratch.iter_mut().enumerate() {
                *slot = ln_joint[[row, component]];
            }
            let norm = ln_sum_exp(&scratch);
            ll += norm;
            for component in 0..k {
                ln_joint[[row, component]] -= norm;
            }
        }
        Ok((ln_joint, ll))
    }

    /// EM fit with the same convergence and monotonicity discipline as the
    /// HMM driver.
    pub fn fit(
        &mut self,
        data: &[&DataFrame],
        options: &FitOptions,
    ) -> SpanResult<FitResult> {
        if data.is_empty() || data.iter().all(|df| df.is_empty()) {
            return Err(SpanError::empty_coverage(
                "no data to fit the mixture on".to_owned(),
            ));
        }
        let mut previous_ll = f64::NEG_INFINITY;
        let mut best_ll = None::<f64>;
        let mut consecutive_drops = 0usize;
        let mut iterations = 0usize;
        let mut converged = false;
        let mut last_ll = f64::NEG_INFINITY;

        for iteration in 0..options.max_iterations {
            options.cancel.check()?;
            let posteriors = data
                .par_iter()
                .map(|df| {
                    options.cancel.check()?;
                    self.posteriors(df)
                })
                .collect::<SpanResult<Vec<(Array2<f64>, f64)>>>()?;
            let total_ll =
                posteriors.iter().map(|(_, ll)| *ll).sum::<f64>();
            if !total_ll.is_finite() {
                return Err(SpanError::NumericalFailure {
                    iteration,
                    best_log_likelihood: best_ll,
                });
            }
            debug!(
                "mixture iteration {iteration}: log-likelihood \
                 {total_ll:.4}"
            );
            if total_ll < previous_ll {
                consecutive_drops += 1;
                warn!(
                    "mixture log-likelihood decreased from \
                     {previous_ll:.4} to {total_ll:.4}"
                );
                if consecutive_drops >= 2 {
                    return Err(SpanError::NumericalFailure {
                        iteration,
                        best_log_likelihood: best_ll,
                    });
                }
            } else {
                consecutive_drops = 0;
            }
            best_ll =
                Some(best_ll.map_or(total_ll, |b: f64| b.max(total_ll)));
            last_ll = total_ll;
            iterations = iteration + 1;

            if iteration > 0 {
                let relative = (total_ll - previous_ll).abs()
                    / previous_ll.abs().max(1.0);
                if relative < options.threshold {
                    converged = true;
                    break;
                }
            }
            previous_ll = total_ll;

            self.m_step(data, &posteriors)?;
        }
        Ok(FitResult { log_likelihood: last_ll, iterations, converged })
    }

    fn m_step(
        &mut self,
        data: &[&DataFrame],
        posteriors: &[(Array2<f64>, f64)],
    ) -> SpanResult<()> {
        let k = self.n_components();
        let total_rows: usize =
            posteriors.iter().map(|(gamma, _)| gamma.dim().0).sum();

        let mut component_weights = vec![0f64; k];
        let mut responsibilities: Vec<Vec<Vec<f64>>> =
            Vec::with_capacity(posteriors.len());
        for (gamma, _) in posteriors {
            let rows = gamma.dim().0;
            let mut per_component = vec![vec![0f64; rows]; k];
            for t in 0..rows {
                for (component, column) in
                    per_component.iter_mut().enumerate()
                {
                    let weight = gamma[[t, component]].exp();
                    column[t] = weight;
                    component_weights[component] += weight;
                }
            }
            responsibilities.push(per_component);
        }
        self.ln_weights = component_weights
            .iter()
            .map(|w| (w / total_rows as f64).max(f64::MIN_POSITIVE).ln())
            .collect();

        for component in 0..k {
            if self.schemes[component].is_frozen() {
                continue;
            }
            let observations = responsibilities
                .iter()
                .enumerate()
                .map(|(chrom, per_component)| SchemeObservations {
                    df: data[chrom],
                    observed: &self.dimension_label,
                    weights: &per_component[component],
                })
                .collect::<Vec<SchemeObservations>>();
            self.schemes[component].update(&observations)?;
        }
        Ok(())
    }

    pub fn sample<R: Rng>(
        &self,
        covariates: &DataFrame,
        rng: &mut R,
    ) -> SpanResult<Vec<i32>> {
        let weights = self.weights();
        let mut draws = Vec::with_capacity(covariates.rows());
        for row in 0..covariates.rows() {
            let mut u: f64 = rng.gen();
            let mut component = weights.len() - 1;
            for (i, w) in weights.iter().enumerate() {
                u -= w;
                if u <= 0f64 {
                    component = i;
                    break;
                }
            }
            draws.push(self.schemes[component].sample(
                covariates,
                row,
                rng,
            )?);
        }
        Ok(draws)
    }
}
