use log::{debug, warn};
use log_once::warn_once;
use ndarray::Array2;
use rayon::prelude::*;

use crate::dataframe::DataFrame;
use crate::emission::{SchemeObservations, NB_VAR_MEAN_MULTIPLIER};
use crate::errs::{SpanError, SpanResult};
use crate::hmm::HiddenMarkovModel;
use crate::model::states::StateSet;
use crate::util::CancellableState;

pub const DEFAULT_FIT_THRESHOLD: f64 = 1e-4;
pub const DEFAULT_MAX_ITERATIONS: usize = 10;
/// The canonical NB2Z model trains longer.
pub const NB2Z_MAX_ITERATIONS: usize = 20;
/// The anti-collapse guard fires when the fitted signal-to-noise ratio
/// drops below the initialization target divided by this factor; the
/// slack keeps the guard out of the way of well-specified fits.
pub const SNR_GUARD_RELAXATION: f64 = 4.0;

#[derive(Debug, Clone)]
pub struct FitOptions {
    /// Relative log-likelihood change below which EM stops.
    pub threshold: f64,
    pub max_iterations: usize,
    /// Multi-start attempts; the best-likelihood attempt is retained.
    pub attempts: usize,
    pub cancel: CancellableState,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FIT_THRESHOLD,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            attempts: 1,
            cancel: CancellableState::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitResult {
    pub log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
}

struct EStepStats {
    ll: f64,
    /// Posterior state probabilities per bin, exp space.
    gamma: Array2<f64>,
    /// Expected transition counts, exp space.
    xi: Vec<Vec<f64>>,
    gamma0: Vec<f64>,
}

/// Baum-Welch over per-chromosome sequences. The E-step runs one task per
/// chromosome on the rayon pool; the M-step aggregates posteriors across
/// every (state, dimension) pair mapped to each emission scheme.
pub fn fit_baum_welch(
    model: &mut HiddenMarkovModel,
    data: &[&DataFrame],
    options: &FitOptions,
) -> SpanResult<FitResult> {
    if data.is_empty() || data.iter().all(|df| df.is_empty()) {
        return Err(SpanError::empty_coverage(
            "no data to fit the model on".to_owned(),
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
        let stats = e_step(model, data, &options.cancel)?;
        let total_ll = stats.iter().map(|s| s.ll).sum::<f64>();
        if !total_ll.is_finite() {
            return Err(SpanError::NumericalFailure {
                iteration,
                best_log_likelihood: best_ll,
            });
        }
        debug!("iteration {iteration}: log-likelihood {total_ll:.4}");
        if total_ll < previous_ll {
            consecutive_drops += 1;
            warn!(
                "log-likelihood decreased from {previous_ll:.4} to \
                 {total_ll:.4}"
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
        best_ll = Some(best_ll.map_or(total_ll, |b: f64| b.max(total_ll)));
        last_ll = total_ll;
        iterations = iteration + 1;

        if iteration > 0 {
            let relative = (total_ll - previous_ll).abs()
                / previous_ll.abs().max(1.0);
            if relative < options.threshold {
                converged = true;
                previous_ll = total_ll;
                break;
            }
        }
        previous_ll = total_ll;

        m_step(model, data, &stats)?;
        apply_runtime_guards(model);
    }
    model.log_parameters();
    Ok(FitResult {
        log_likelihood: last_ll,
        iterations,
        converged,
    })
}

fn e_step(
    model: &HiddenMarkovModel,
    data: &[&DataFrame],
    cancel: &CancellableState,
) -> SpanResult<Vec<EStepStats>> {
    data.par_iter()
        .map(|df| {
            cancel.check()?;
            chromosome_e_step(model, df)
        })
        .collect()
}

fn chromosome_e_step(
    model: &HiddenMarkovModel,
    df: &DataFrame,
) -> SpanResult<EStepStats> {
    if df.is_empty() {
        return Err(SpanError::empty_coverage(
            "cannot run the E-step on an empty dataframe".to_owned(),
        ));
    }
    let n = model.n_states();
    let ln_e = model.ln_emission_matrix(df)?;
    let (alpha, ll) = model.forward(&ln_e);
    let beta = model.backward(&ln_e);
    let rows = df.rows();

    let mut gamma = Array2::<f64>::zeros((rows, n));
    for t in 0..rows {
        for s in 0..n {
            gamma[[t, s]] = (alpha[[t, s]] + beta[[t, s]] - ll).exp();
        }
    }
    let ln_transitions = model.ln_transitions();
    let mut xi = vec![vec![0f64; n]; n];
    for t in 0..rows.saturating_sub(1) {
        for s in 0..n {
            let base = alpha[[t, s]] - ll;
            for (u, xi_row) in xi[s].iter_mut().enumerate() {
                *xi_row += (base
                    + ln_transitions[s][u]
                    + ln_e[[t + 1, u]]
                    + beta[[t + 1, u]])
                    .exp();
            }
        }
    }
    let gamma0 = (0..n).map(|s| gamma[[0, s]]).collect();
    Ok(EStepStats { ll, gamma, xi, gamma0 })
}

fn m_step(
    model: &mut HiddenMarkovModel,
    data: &[&DataFrame],
    stats: &[EStepStats],
) -> SpanResult<()> {
    let n = model.n_states();
    let n_chromosomes = stats.len() as f64;

    let mut priors = vec![0f64; n];
    for chrom_stats in stats {
        for s in 0..n {
            priors[s] += chrom_stats.gamma0[s] / n_chromosomes;
        }
    }
    let prior_total: f64 = priors.iter().sum();
    model.set_ln_priors(
        priors
            .iter()
            .map(|p| (p / prior_total).max(f64::MIN_POSITIVE).ln())
            .collect(),
    );

    let old_transitions = model.ln_transitions().to_vec();
    let mut transitions = vec![vec![0f64; n]; n];
    for chrom_stats in stats {
        for s in 0..n {
            for u in 0..n {
                transitions[s][u] += chrom_stats.xi[s][u];
            }
        }
    }
    let ln_transitions = transitions
        .into_iter()
        .enumerate()
        .map(|(s, row)| {
            let row_sum: f64 = row.iter().sum();
            if row_sum <= 0f64 {
                // state never left in the data, keep the previous row
                old_transitions[s].clone()
            } else {
                row.into_iter()
                    .map(|x| {
                        (x / row_sum).max(f64::MIN_POSITIVE).ln()
                    })
                    .collect()
            }
        })
        .collect();
    model.set_ln_transitions(ln_transitions);

    update_emissions(model, data, stats)
}

fn update_emissions(
    model: &mut HiddenMarkovModel,
    data: &[&DataFrame],
    stats: &[EStepStats],
) -> SpanResult<()> {
    let n_schemes = model.emissions().len();
    let map = model.emission_map().to_vec();
    let labels = model.dimension_labels().to_vec();

    for scheme_idx in 0..n_schemes {
        if model.emissions()[scheme_idx].is_frozen() {
            continue;
        }
        // weights per (chromosome, dimension) pooling every state mapped
        // to this scheme
        let mut pooled: Vec<(usize, usize, Vec<f64>)> = Vec::new();
        for (chrom, chrom_stats) in stats.iter().enumerate() {
            for (dim, _) in labels.iter().enumerate() {
                let states = map
                    .iter()
                    .enumerate()
                    .filter(|(_, row)| row[dim] == scheme_idx)
                    .map(|(s, _)| s)
                    .collect::<Vec<usize>>();
                if states.is_empty() {
                    continue;
                }
                let rows = chrom_stats.gamma.dim().0;
                let mut weights = vec![0f64; rows];
                for t in 0..rows {
                    for &s in &states {
                        weights[t] += chrom_stats.gamma[[t, s]];
                    }
                }
                pooled.push((chrom, dim, weights));
            }
        }
        if pooled.is_empty() {
            continue;
        }
        let observations = pooled
            .iter()
            .map(|(chrom, dim, weights)| SchemeObservations {
                df: data[*chrom],
                observed: &labels[*dim],
                weights,
            })
            .collect::<Vec<SchemeObservations>>();
        model.emissions_mut()[scheme_idx].update(&observations)?;
    }
    Ok(())
}

/// Runtime guards for the canonical NB2Z model: prevent the LOW state from
/// collapsing onto the zero-inflated noise and keep the fitted
/// signal-to-noise ratio at or above the guess target.
fn apply_runtime_guards(model: &mut HiddenMarkovModel) {
    let Some(ctx) = model.guess.clone() else {
        return;
    };
    if model.states() != StateSet::Zlh || model.dimensions() != 1 {
        return;
    }
    let low_idx = model.emission_map()[1][0];
    let high_idx = model.emission_map()[2][0];

    let low_mean = match model.emissions()[low_idx].as_neg_bin() {
        Some(nb) => nb.mean(),
        None => return,
    };
    if low_mean < ctx.noise_mean {
        warn_once!(
            "LOW state mean drifted below the noise floor, resetting"
        );
        if let Some(nb) = model.emissions_mut()[low_idx].as_neg_bin_mut() {
            nb.set_moments(
                ctx.noise_mean,
                ctx.low_variance
                    .max(NB_VAR_MEAN_MULTIPLIER * ctx.noise_mean),
            );
        }
    }

    let low_mean = model.emissions()[low_idx]
        .as_neg_bin()
        .map(|nb| nb.mean())
        .unwrap_or(ctx.noise_mean);
    if let Some(high_mean) =
        model.emissions()[high_idx].as_neg_bin().map(|nb| nb.mean())
    {
        let snr = high_mean / low_mean;
        let floor = (ctx.snr_target / SNR_GUARD_RELAXATION)
            .max(crate::model::guess::MIN_SNR);
        if snr < floor {
            warn_once!(
                "signal-to-noise dropped below the initialization floor, \
                 boosting the HIGH state"
            );
            let target_mean = low_mean * floor;
            if let Some(nb) =
                model.emissions_mut()[high_idx].as_neg_bin_mut()
            {
                let fano =
                    (nb.variance() / nb.mean()).max(NB_VAR_MEAN_MULTIPLIER);
                nb.set_moments(target_mean, target_mean * fano);
            }
        }
    }
}
