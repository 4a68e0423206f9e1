use log::{debug, info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::dataframe::{DataFrame, TREATMENT_COLUMN};
use crate::emission::{
    EmissionScheme, NegBinEmission, NegBinRegressionEmission,
    PoissonRegressionEmission,
};
use crate::errs::{SpanError, SpanResult};
use crate::hmm::fit::{
    fit_baum_welch, FitOptions, FitResult, NB2Z_MAX_ITERATIONS,
};
use crate::hmm::HiddenMarkovModel;
use crate::mixture::MixtureModel;
use crate::util::ln_sum_exp;

pub mod guess;
pub mod states;

use guess::{guess_by_data, multi_start_snr, rescale_means_to_snr, Guess};
use states::StateSet;

/// Multiplier of the multi-start SNR perturbation sequence.
pub const MULTI_START_SNR_MULTIPLIER: f64 = 2.0;

pub const DIFF_TRACK1_COLUMN: &str = "y0";
pub const DIFF_TRACK2_COLUMN: &str = "y1";

/// The model family: free NB HMMs with and without a zero state, the
/// constrained differential HMM, and the NB / regression mixtures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelType {
    /// Canonical peak-calling model: ZLH with two NB states, runtime
    /// guards, and a longer training budget.
    Nb2z,
    /// `k` NB states, no zero inflation (`k` in 2..=3).
    FreeNb { k: usize },
    /// Zero state plus `k` NB states (`k` in 2..=3).
    FreeNbz { k: usize },
    /// Differential ZLHID over two replicate dimensions.
    ConstrainedNbz,
    /// Zero-inflated mixture of `k` NB components.
    NbMixture { k: usize },
    PoissonRegressionMixture { covariates: Vec<String> },
    NbRegressionMixture { covariates: Vec<String> },
}

impl ModelType {
    /// Stable tag recorded as `fit.information.fqn` in the descriptor.
    pub fn fqn(&self) -> String {
        match self {
            Self::Nb2z => "span.fit.nb2z".to_owned(),
            Self::FreeNb { k } => format!("span.fit.nb{k}"),
            Self::FreeNbz { k } => format!("span.fit.nb{k}z"),
            Self::ConstrainedNbz => "span.fit.nb2z.diff".to_owned(),
            Self::NbMixture { k } => format!("span.fit.nb{k}.mixture"),
            Self::PoissonRegressionMixture { .. } => {
                "span.fit.poisson.regression.mixture".to_owned()
            }
            Self::NbRegressionMixture { .. } => {
                "span.fit.nb.regression.mixture".to_owned()
            }
        }
    }

    pub fn max_iterations(&self) -> usize {
        match self {
            Self::Nb2z | Self::ConstrainedNbz => NB2Z_MAX_ITERATIONS,
            _ => crate::hmm::fit::DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Construct an initialized model from the training data, guessing
    /// NB parameters from the pooled coverage.
    pub fn build(&self, data: &[&DataFrame]) -> SpanResult<EnrichmentModel> {
        match self {
            Self::Nb2z => build_free_nbz(data, 2, true),
            Self::FreeNbz { k } => build_free_nbz(data, *k, false),
            Self::FreeNb { k } => build_free_nb(data, *k),
            Self::ConstrainedNbz => build_constrained_nbz(data),
            Self::NbMixture { k } => build_nb_mixture(data, *k),
            Self::PoissonRegressionMixture { covariates } => {
                build_regression_mixture(data, covariates, false)
            }
            Self::NbRegressionMixture { covariates } => {
                build_regression_mixture(data, covariates, true)
            }
        }
    }
}

/// A trained (or trainable) enrichment model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EnrichmentModel {
    Hmm(HiddenMarkovModel),
    Mixture(MixtureModel),
}

impl EnrichmentModel {
    pub fn fit(
        &mut self,
        data: &[&DataFrame],
        options: &FitOptions,
    ) -> SpanResult<FitResult> {
        match self {
            Self::Hmm(hmm) => fit_baum_welch(hmm, data, options),
            Self::Mixture(mixture) => mixture.fit(data, options),
        }
    }

    /// Posterior state/component log-probabilities per bin.
    pub fn posteriors(
        &self,
        df: &DataFrame,
    ) -> SpanResult<(Array2<f64>, f64)> {
        match self {
            Self::Hmm(hmm) => hmm.posteriors(df),
            Self::Mixture(mixture) => mixture.posteriors(df),
        }
    }

    fn null_indices(&self) -> Vec<usize> {
        match self {
            Self::Hmm(hmm) => hmm.states().null_states().to_vec(),
            Self::Mixture(mixture) => {
                // everything but the highest-mean NB component is
                // background
                let enriched = mixture
                    .schemes()
                    .iter()
                    .enumerate()
                    .filter_map(|(i, s)| {
                        s.as_neg_bin().map(|nb| (i, nb.mean()))
                    })
                    .max_by(|a, b| {
                        a.1.partial_cmp(&b.1).expect("finite means")
                    })
                    .map(|(i, _)| i);
                (0..mixture.n_components())
                    .filter(|i| Some(*i) != enriched)
                    .collect()
            }
        }
    }

    /// Per-bin log-probability of the null hypothesis, the quantity the
    /// peak engine thresholds.
    pub fn ln_null_posteriors(
        &self,
        df: &DataFrame,
    ) -> SpanResult<Vec<f64>> {
        let (ln_gamma, _) = self.posteriors(df)?;
        let null = self.null_indices();
        let rows = ln_gamma.dim().0;
        let mut scratch = vec![0f64; null.len()];
        Ok((0..rows)
            .map(|t| {
                for (slot, &s) in scratch.iter_mut().zip(null.iter()) {
                    *slot = ln_gamma[[t, s]];
                }
                ln_sum_exp(&scratch).min(0f64)
            })
            .collect())
    }

    /// Enriched assignment by most-likely state.
    pub fn enriched_bins(&self, df: &DataFrame) -> SpanResult<Vec<bool>> {
        let (ln_gamma, _) = self.posteriors(df)?;
        let null = self.null_indices();
        let (rows, n) = ln_gamma.dim();
        Ok((0..rows)
            .map(|t| {
                let best = (0..n)
                    .max_by(|&a, &b| {
                        ln_gamma[[t, a]]
                            .partial_cmp(&ln_gamma[[t, b]])
                            .expect("finite posteriors")
                    })
                    .unwrap_or(0);
                !null.contains(&best)
            })
            .collect())
    }

    /// NB means in state/component order, for the ordering invariant.
    pub fn nb_means(&self) -> Vec<f64> {
        match self {
            Self::Hmm(hmm) => (0..hmm.n_states())
                .filter_map(|s| {
                    hmm.scheme_for(s, 0).as_neg_bin().map(|nb| nb.mean())
                })
                .collect(),
            Self::Mixture(mixture) => mixture
                .schemes()
                .iter()
                .filter_map(|s| s.as_neg_bin().map(|nb| nb.mean()))
                .collect(),
        }
    }
}

fn pooled_counts(
    data: &[&DataFrame],
    column: &str,
) -> SpanResult<Vec<i32>> {
    let mut values = Vec::new();
    for df in data {
        values.extend_from_slice(df.int_column(column)?);
    }
    if values.is_empty() {
        return Err(SpanError::empty_coverage(
            "no observations across chromosomes".to_owned(),
        ));
    }
    Ok(values)
}

fn nb_schemes(guess: &Guess) -> SpanResult<Vec<EmissionScheme>> {
    guess
        .means
        .iter()
        .zip(guess.failures.iter())
        .map(|(&mu, &r)| {
            Ok(EmissionScheme::NegBin(NegBinEmission::new(mu, r)?))
        })
        .collect()
}

fn build_free_nbz(
    data: &[&DataFrame],
    k: usize,
    with_guards: bool,
) -> SpanResult<EnrichmentModel> {
    let states = match k {
        2 => StateSet::Zlh,
        3 => StateSet::Zlmh,
        _ => {
            return Err(SpanError::invalid_input(format!(
                "free NBZ supports 2 or 3 NB states, got {k}"
            )))
        }
    };
    let counts = pooled_counts(data, TREATMENT_COLUMN)?;
    let guess = guess_by_data(&counts, k, true)?;
    let mut emissions = vec![EmissionScheme::constant_zero()];
    emissions.extend(nb_schemes(&guess)?);
    let map = (0..states.n_states()).map(|s| vec![s]).collect();
    let mut hmm = HiddenMarkovModel::new(
        states,
        vec![TREATMENT_COLUMN.to_owned()],
        emissions,
        map,
    )?;
    if with_guards {
        hmm.set_guess_context(guess.context);
    }
    Ok(EnrichmentModel::Hmm(hmm))
}

fn build_free_nb(data: &[&DataFrame], k: usize) -> SpanResult<EnrichmentModel> {
    let states = match k {
        2 => StateSet::Lh,
        3 => StateSet::Lmh,
        _ => {
            return Err(SpanError::invalid_input(format!(
                "free NB supports 2 or 3 states, got {k}"
            )))
        }
    };
    let counts = pooled_counts(data, TREATMENT_COLUMN)?;
    let guess = guess_by_data(&counts, k, false)?;
    let map = (0..k).map(|s| vec![s]).collect();
    let hmm = HiddenMarkovModel::new(
        states,
        vec![TREATMENT_COLUMN.to_owned()],
        nb_schemes(&guess)?,
        map,
    )?;
    Ok(EnrichmentModel::Hmm(hmm))
}

/// Differential ZLHID: one low/high NB pair per replicate dimension;
/// states share schemes through the state-dimension map.
fn build_constrained_nbz(
    data: &[&DataFrame],
) -> SpanResult<EnrichmentModel> {
    let mut emissions = vec![EmissionScheme::constant_zero()];
    let mut contexts = Vec::new();
    for column in [DIFF_TRACK1_COLUMN, DIFF_TRACK2_COLUMN] {
        let counts = pooled_counts(data, column)?;
        let guess = guess_by_data(&counts, 2, true)?;
        emissions.extend(nb_schemes(&guess)?);
        contexts.push(guess.context);
    }
    debug!(
        "differential guesses: track1 snr {:.2}, track2 snr {:.2}",
        contexts[0].snr_target, contexts[1].snr_target
    );
    // schemes: 0 const, 1/2 low/high of track 1, 3/4 low/high of track 2
    let map = vec![
        vec![0, 0], // Z
        vec![1, 3], // L
        vec![2, 4], // H
        vec![2, 3], // I
        vec![1, 4], // D
    ];
    let hmm = HiddenMarkovModel::new(
        StateSet::Zlhid,
        vec![
            DIFF_TRACK1_COLUMN.to_owned(),
            DIFF_TRACK2_COLUMN.to_owned(),
        ],
        emissions,
        map,
    )?;
    Ok(EnrichmentModel::Hmm(hmm))
}

fn build_nb_mixture(
    data: &[&DataFrame],
    k: usize,
) -> SpanResult<EnrichmentModel> {
    if k < 2 {
        return Err(SpanError::invalid_input(format!(
            "NB mixture needs at least two components, got {k}"
        )));
    }
    let counts = pooled_counts(data, TREATMENT_COLUMN)?;
    let zero_fraction = counts.iter().filter(|&&y| y == 0).count() as f64
        / counts.len() as f64;
    let guess = guess_by_data(&counts, k, true)?;
    let mut schemes = vec![EmissionScheme::constant_zero()];
    schemes.extend(nb_schemes(&guess)?);
    let mut weights = vec![zero_fraction.max(0.05)];
    let rest = (1.0 - weights[0]) / k as f64;
    weights.extend(std::iter::repeat(rest).take(k));
    Ok(EnrichmentModel::Mixture(MixtureModel::new(
        TREATMENT_COLUMN,
        schemes,
        weights,
    )?))
}

fn build_regression_mixture(
    data: &[&DataFrame],
    covariates: &[String],
    nb_noise: bool,
) -> SpanResult<EnrichmentModel> {
    let counts = pooled_counts(data, TREATMENT_COLUMN)?;
    let guess = guess_by_data(&counts, 2, true)?;
    let zero_fraction = counts.iter().filter(|&&y| y == 0).count() as f64
        / counts.len() as f64;
    // flat GLMs at the guessed low/high intercepts
    let mut schemes = vec![EmissionScheme::constant_zero()];
    for &mean in &guess.means {
        let mut beta = vec![mean.max(1e-4).ln()];
        beta.extend(std::iter::repeat(0f64).take(covariates.len()));
        let scheme = if nb_noise {
            EmissionScheme::NegBinRegression(NegBinRegressionEmission::new(
                covariates.to_vec(),
                beta,
                guess.failures[0].max(1.0),
            )?)
        } else {
            EmissionScheme::PoissonRegression(
                PoissonRegressionEmission::new(covariates.to_vec(), beta)?,
            )
        };
        schemes.push(scheme);
    }
    let zero_weight = zero_fraction.max(0.05);
    let rest = (1.0 - zero_weight) / guess.means.len() as f64;
    let mut weights = vec![zero_weight];
    weights.extend(std::iter::repeat(rest).take(guess.means.len()));
    Ok(EnrichmentModel::Mixture(MixtureModel::new(
        TREATMENT_COLUMN,
        schemes,
        weights,
    )?))
}

/// Fit with multi-start: attempt 0 uses the data-driven guess, later
/// attempts rescale the NB mean ladder to perturbed signal-to-noise
/// ratios; the attempt with the highest training log-likelihood wins.
/// State-flip normalization runs on the winner.
pub fn fit_multi_start(
    model_type: &ModelType,
    data: &[&DataFrame],
    options: &FitOptions,
) -> SpanResult<(EnrichmentModel, FitResult)> {
    let attempts = options.attempts.max(1);
    // the canonical models carry their own iteration budget
    let options = FitOptions {
        max_iterations: options
            .max_iterations
            .max(model_type.max_iterations()),
        ..options.clone()
    };
    let mut best: Option<(EnrichmentModel, FitResult)> = None;
    for attempt in 0..attempts {
        options.cancel.check()?;
        let mut model = model_type.build(data)?;
        if attempt > 0 {
            perturb_model(&mut model, attempt);
        }
        let result = match model.fit(data, &options) {
            Ok(result) => result,
            Err(SpanError::Cancelled) => return Err(SpanError::Cancelled),
            Err(e) => {
                warn!("fit attempt {attempt} failed: {e}");
                continue;
            }
        };
        debug!(
            "attempt {attempt}: log-likelihood {:.4} after {} iterations",
            result.log_likelihood, result.iterations
        );
        let better = best
            .as_ref()
            .map(|(_, b)| result.log_likelihood > b.log_likelihood)
            .unwrap_or(true);
        if better {
            best = Some((model, result));
        }
    }
    let (mut model, result) = best.ok_or(SpanError::NumericalFailure {
        iteration: 0,
        best_log_likelihood: None,
    })?;
    normalize_states(&mut model);
    info!(
        "fitted {} with log-likelihood {:.4}",
        model_type.fqn(),
        result.log_likelihood
    );
    Ok((model, result))
}

fn perturb_model(model: &mut EnrichmentModel, attempt: usize) {
    if let EnrichmentModel::Hmm(hmm) = model {
        // the constrained models share schemes across states, the mean
        // ladder rescaling below only fits the one-dimensional family
        if hmm.dimensions() > 1 {
            return;
        }
    }
    let means = model.nb_means();
    if means.len() < 2 {
        return;
    }
    let base_snr = means[means.len() - 1] / means[0].max(1e-10);
    let snr =
        multi_start_snr(attempt, base_snr, MULTI_START_SNR_MULTIPLIER);
    let context = guess::GuessContext {
        noise_mean: means[0],
        low_variance: 0f64,
        snr_target: snr,
    };
    let rescaled = rescale_means_to_snr(
        &Guess {
            means: means.clone(),
            failures: vec![1.0; means.len()],
            context,
        },
        snr,
    );
    match model {
        EnrichmentModel::Hmm(hmm) => {
            let mut nb_state = 0usize;
            for state in 0..hmm.n_states() {
                let scheme_idx = hmm.emission_map()[state][0];
                if let Some(nb) =
                    hmm.emissions_mut()[scheme_idx].as_neg_bin_mut()
                {
                    let mu = rescaled.means[nb_state];
                    let variance = mu
                        + mu * mu / rescaled.failures[nb_state].max(1e-10);
                    nb.set_moments(mu, variance);
                    nb_state += 1;
                }
            }
        }
        EnrichmentModel::Mixture(_) => {}
    }
}

/// Post-fit state-flip normalization, restoring the increasing-mean state
/// ordering: swap a pair when both the means and the success
/// probabilities are inverted; log a data-quality warning when only one
/// of the two is.
pub fn normalize_states(model: &mut EnrichmentModel) {
    match model {
        EnrichmentModel::Hmm(hmm) => {
            if hmm.states() == StateSet::Zlhid && hmm.dimensions() == 2 {
                flip_constrained_zlhid(hmm);
            } else {
                flip_free_hmm(hmm);
            }
        }
        EnrichmentModel::Mixture(mixture) => flip_mixture(mixture),
    }
}

enum Inversion {
    Both,
    Partial,
    None,
}

fn inversion(a: &NegBinEmission, b: &NegBinEmission) -> Inversion {
    let mean_inverted = a.mean() > b.mean();
    let p_inverted = a.success_probability() > b.success_probability();
    match (mean_inverted, p_inverted) {
        (true, true) => Inversion::Both,
        (false, false) => Inversion::None,
        _ => Inversion::Partial,
    }
}

fn flip_free_hmm(hmm: &mut HiddenMarkovModel) {
    let nb_states = (0..hmm.n_states())
        .filter(|&s| hmm.scheme_for(s, 0).as_neg_bin().is_some())
        .collect::<Vec<usize>>();
    let mut swapped = true;
    while swapped {
        swapped = false;
        for w in 0..nb_states.len().saturating_sub(1) {
            let i = nb_states[w];
            let j = nb_states[w + 1];
            let (Some(a), Some(b)) = (
                hmm.scheme_for(i, 0).as_neg_bin().cloned(),
                hmm.scheme_for(j, 0).as_neg_bin().cloned(),
            ) else {
                continue;
            };
            match inversion(&a, &b) {
                Inversion::Both => {
                    hmm.swap_states(i, j);
                    swapped = true;
                }
                Inversion::Partial => {
                    warn!(
                        "states {i} and {j} have inconsistent mean/p \
                         ordering (means {:.4}/{:.4}), not swapping",
                        a.mean(),
                        b.mean()
                    );
                }
                Inversion::None => {}
            }
        }
    }
}

/// Per-track flip of the differential model: relabel (L,I) and (H,D) for
/// track one, (L,D) and (H,I) for track two. After the relabel the L/H
/// states reference the low/high schemes of both tracks again.
fn flip_constrained_zlhid(hmm: &mut HiddenMarkovModel) {
    for dim in 0..2 {
        let low_idx = hmm.emission_map()[1][dim];
        let high_idx = hmm.emission_map()[2][dim];
        let (Some(low), Some(high)) = (
            hmm.emissions()[low_idx].as_neg_bin().cloned(),
            hmm.emissions()[high_idx].as_neg_bin().cloned(),
        ) else {
            continue;
        };
        match inversion(&low, &high) {
            Inversion::Both => {
                if dim == 0 {
                    hmm.swap_states(1, 3);
                    hmm.swap_states(2, 4);
                } else {
                    hmm.swap_states(1, 4);
                    hmm.swap_states(2, 3);
                }
            }
            Inversion::Partial => {
                warn!(
                    "track {dim} low/high emissions have inconsistent \
                     mean/p ordering, not swapping"
                );
            }
            Inversion::None => {}
        }
    }
}

fn flip_mixture(mixture: &mut MixtureModel) {
    let nb_components = (0..mixture.n_components())
        .filter(|&i| mixture.schemes()[i].as_neg_bin().is_some())
        .collect::<Vec<usize>>();
    let mut swapped = true;
    while swapped {
        swapped = false;
        for w in 0..nb_components.len().saturating_sub(1) {
            let i = nb_components[w];
            let j = nb_components[w + 1];
            let (Some(a), Some(b)) = (
                mixture.schemes()[i].as_neg_bin().cloned(),
                mixture.schemes()[j].as_neg_bin().cloned(),
            ) else {
                continue;
            };
            match inversion(&a, &b) {
                Inversion::Both => {
                    mixture.swap_components(i, j);
                    swapped = true;
                }
                Inversion::Partial => {
                    warn!(
                        "mixture components {i} and {j} have \
                         inconsistent mean/p ordering, not swapping"
                    );
                }
                Inversion::None => {}
            }
        }
    }
}

#[cfg(test)]
mod model_tests {
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn frame(ys: Vec<i32>) -> DataFrame {
        let mut df = DataFrame::with_rows(ys.len());
        df.add_int_column(TREATMENT_COLUMN, ys).unwrap();
        df
    }

    fn mixed_counts(seed: u64, n: usize) -> Vec<i32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let low = NegBinEmission::new(2.0, 2.0).unwrap();
        let high = NegBinEmission::new(30.0, 4.0).unwrap();
        (0..n)
            .map(|i| {
                if i % 10 == 0 {
                    high.sample(&mut rng).unwrap()
                } else if i % 3 == 0 {
                    0
                } else {
                    low.sample(&mut rng).unwrap()
                }
            })
            .collect()
    }

    #[test]
    fn test_fqn_tags_are_stable() {
        assert_eq!(ModelType::Nb2z.fqn(), "span.fit.nb2z");
        assert_eq!(ModelType::FreeNbz { k: 3 }.fqn(), "span.fit.nb3z");
        assert_eq!(ModelType::ConstrainedNbz.fqn(), "span.fit.nb2z.diff");
        assert_eq!(
            ModelType::NbMixture { k: 2 }.fqn(),
            "span.fit.nb2.mixture"
        );
    }

    #[test]
    fn test_nb2z_build_shape() {
        let df = frame(mixed_counts(1, 2000));
        let model = ModelType::Nb2z.build(&[&df]).unwrap();
        let EnrichmentModel::Hmm(hmm) = &model else {
            panic!("nb2z builds an HMM")
        };
        assert_eq!(hmm.states(), StateSet::Zlh);
        assert!(hmm.guess.is_some());
        assert!(matches!(
            hmm.emissions()[0],
            EmissionScheme::Constant(_)
        ));
        let means = model.nb_means();
        assert_eq!(means.len(), 2);
        assert!(means[0] < means[1]);
    }

    #[test]
    fn test_constrained_build_shape() {
        let mut df = DataFrame::with_rows(2000);
        df.add_int_column(DIFF_TRACK1_COLUMN, mixed_counts(2, 2000))
            .unwrap();
        df.add_int_column(DIFF_TRACK2_COLUMN, mixed_counts(3, 2000))
            .unwrap();
        let model = ModelType::ConstrainedNbz.build(&[&df]).unwrap();
        let EnrichmentModel::Hmm(hmm) = &model else {
            panic!("constrained model is an HMM")
        };
        assert_eq!(hmm.states(), StateSet::Zlhid);
        assert_eq!(hmm.dimensions(), 2);
        assert_eq!(hmm.emissions().len(), 5);
        assert_eq!(hmm.emission_map()[3], vec![2, 3]);
    }

    #[test]
    fn test_flip_orders_free_hmm_means() {
        let mut hmm = HiddenMarkovModel::new(
            StateSet::Zlh,
            vec![TREATMENT_COLUMN.to_owned()],
            vec![
                EmissionScheme::constant_zero(),
                EmissionScheme::NegBin(
                    NegBinEmission::new(25.0, 2.0).unwrap(),
                ),
                EmissionScheme::NegBin(
                    NegBinEmission::new(2.0, 2.0).unwrap(),
                ),
            ],
            vec![vec![0], vec![1], vec![2]],
        )
        .unwrap();
        hmm.set_ln_priors(vec![
            0.2f64.ln(),
            0.7f64.ln(),
            0.1f64.ln(),
        ]);
        let mut model = EnrichmentModel::Hmm(hmm);
        normalize_states(&mut model);
        let means = model.nb_means();
        assert!(means[0] < means[1]);
        let EnrichmentModel::Hmm(hmm) = &model else { unreachable!() };
        // the prior followed the relabel
        assert_relative_eq!(hmm.ln_priors()[1].exp(), 0.1, epsilon = 1e-9);
        assert_relative_eq!(hmm.ln_priors()[2].exp(), 0.7, epsilon = 1e-9);
    }

    #[test]
    fn test_partial_inversion_is_not_swapped() {
        // means inverted but p ordering consistent: mean 25 with huge
        // failures has lower p than mean 2 with tiny failures
        let mut hmm = HiddenMarkovModel::new(
            StateSet::Zlh,
            vec![TREATMENT_COLUMN.to_owned()],
            vec![
                EmissionScheme::constant_zero(),
                EmissionScheme::NegBin(
                    NegBinEmission::new(25.0, 500.0).unwrap(),
                ),
                EmissionScheme::NegBin(
                    NegBinEmission::new(2.0, 0.01).unwrap(),
                ),
            ],
            vec![vec![0], vec![1], vec![2]],
        )
        .unwrap();
        hmm.set_ln_priors(vec![
            (1.0f64 / 3.0).ln(),
            (1.0f64 / 3.0).ln(),
            (1.0f64 / 3.0).ln(),
        ]);
        let mut model = EnrichmentModel::Hmm(hmm);
        normalize_states(&mut model);
        let means = model.nb_means();
        assert_relative_eq!(means[0], 25.0);
        assert_relative_eq!(means[1], 2.0);
    }

    #[test]
    fn test_flip_mixture_orders_components() {
        let mut mixture = MixtureModel::new(
            TREATMENT_COLUMN,
            vec![
                EmissionScheme::constant_zero(),
                EmissionScheme::NegBin(
                    NegBinEmission::new(40.0, 2.0).unwrap(),
                ),
                EmissionScheme::NegBin(
                    NegBinEmission::new(3.0, 2.0).unwrap(),
                ),
            ],
            vec![0.5, 0.2, 0.3],
        )
        .unwrap();
        let mut model = EnrichmentModel::Mixture(mixture.clone());
        normalize_states(&mut model);
        let means = model.nb_means();
        assert!(means[0] < means[1]);
        let EnrichmentModel::Mixture(flipped) = &model else {
            unreachable!()
        };
        assert_relative_eq!(flipped.weights()[1], 0.3, epsilon = 1e-9);
        mixture.swap_components(1, 2);
        assert_eq!(flipped.schemes(), mixture.schemes());
    }

    #[test]
    fn test_fit_multi_start_produces_ordered_model() {
        let df = frame(mixed_counts(7, 4000));
        let options = FitOptions {
            attempts: 2,
            max_iterations: 15,
            ..Default::default()
        };
        let (model, result) =
            fit_multi_start(&ModelType::Nb2z, &[&df], &options).unwrap();
        assert!(result.log_likelihood.is_finite());
        let means = model.nb_means();
        assert!(means[0] <= means[1]);
    }

    #[test]
    fn test_empty_data_fails_build() {
        let mut empty = DataFrame::with_rows(0);
        empty.add_int_column(TREATMENT_COLUMN, vec![]).unwrap();
        let err = ModelType::Nb2z.build(&[&empty]).unwrap_err();
        assert!(matches!(err, SpanError::EmptyCoverage(_)));
    }

    #[test]
    fn test_regression_mixture_build() {
        let mut df = frame(mixed_counts(9, 1000));
        df.add_float_column(
            crate::dataframe::GC_COLUMN,
            (0..1000).map(|i| (i % 10) as f64 / 10.0).collect(),
        )
        .unwrap();
        let model = ModelType::PoissonRegressionMixture {
            covariates: vec![crate::dataframe::GC_COLUMN.to_owned()],
        }
        .build(&[&df])
        .unwrap();
        let EnrichmentModel::Mixture(mixture) = &model else {
            panic!("regression mixture is a mixture")
        };
        assert_eq!(mixture.n_components(), 3);
    }
}
