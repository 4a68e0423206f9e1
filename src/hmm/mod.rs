use log::warn;
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::dataframe::DataFrame;
use crate::emission::EmissionScheme;
use crate::errs::{SpanError, SpanResult};
use crate::model::guess::GuessContext;
use crate::model::states::StateSet;
use crate::util::ln_sum_exp;

pub mod fit;

/// Hidden Markov model over per-bin observations. Emission schemes live in
/// an arena; `state_dimension_emissions[s][d]` maps each (state,
/// replicate-dimension) pair to a scheme index, so the free models (one
/// dimension, identity-like map) and the constrained differential models
/// share one engine. Probabilities are stored in natural-log space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiddenMarkovModel {
    states: StateSet,
    /// Observed column label per replicate dimension.
    dimension_labels: Vec<String>,
    ln_priors: Vec<f64>,
    ln_transitions: Vec<Vec<f64>>,
    emissions: Vec<EmissionScheme>,
    state_dimension_emissions: Vec<Vec<usize>>,
    /// Initialization context threaded into the EM runtime guards.
    pub(crate) guess: Option<GuessContext>,
}

impl HiddenMarkovModel {
    pub fn new(
        states: StateSet,
        dimension_labels: Vec<String>,
        emissions: Vec<EmissionScheme>,
        state_dimension_emissions: Vec<Vec<usize>>,
    ) -> SpanResult<Self> {
        let n = states.n_states();
        if state_dimension_emissions.len() != n {
            return Err(SpanError::DimensionMismatch(format!(
                "{} state rows in the emission map for {n} states",
                state_dimension_emissions.len()
            )));
        }
        for row in &state_dimension_emissions {
            if row.len() != dimension_labels.len() {
                return Err(SpanError::DimensionMismatch(format!(
                    "emission map row has {} dimensions, expected {}",
                    row.len(),
                    dimension_labels.len()
                )));
            }
            if let Some(&bad) =
                row.iter().find(|&&e| e >= emissions.len())
            {
                return Err(SpanError::invalid_input(format!(
                    "emission map references scheme {bad}, arena has {}",
                    emissions.len()
                )));
            }
        }
        if states.has_zero_state()
            && !matches!(
                emissions.first(),
                Some(EmissionScheme::Constant(c)) if c.value() == 0
            )
        {
            return Err(SpanError::invalid_input(
                "state sets with a zero state require Constant(0) at \
                 emission index 0"
                    .to_owned(),
            ));
        }
        let uniform = (1.0 / n as f64).ln();
        Ok(Self {
            states,
            dimension_labels,
            ln_priors: vec![uniform; n],
            ln_transitions: vec![vec![uniform; n]; n],
            emissions,
            state_dimension_emissions,
            guess: None,
        })
    }

    pub fn states(&self) -> StateSet {
        self.states
    }

    pub fn n_states(&self) -> usize {
        self.states.n_states()
    }

    pub fn dimensions(&self) -> usize {
        self.dimension_labels.len()
    }

    pub fn dimension_labels(&self) -> &[String] {
        &self.dimension_labels
    }

    pub fn emissions(&self) -> &[EmissionScheme] {
        &self.emissions
    }

    pub(crate) fn emissions_mut(&mut self) -> &mut [EmissionScheme] {
        &mut self.emissions
    }

    pub fn emission_map(&self) -> &[Vec<usize>] {
        &self.state_dimension_emissions
    }

    pub fn scheme_for(&self, state: usize, dimension: usize) -> &EmissionScheme {
        &self.emissions[self.state_dimension_emissions[state][dimension]]
    }

    pub fn ln_priors(&self) -> &[f64] {
        &self.ln_priors
    }

    pub fn ln_transitions(&self) -> &[Vec<f64>] {
        &self.ln_transitions
    }

    /// Replace the initial-state distribution (natural-log space).
    pub fn set_ln_priors(&mut self, ln_priors: Vec<f64>) {
        self.ln_priors = ln_priors;
    }

    /// Replace the transition matrix (natural-log space, row-stochastic).
    pub fn set_ln_transitions(&mut self, ln_transitions: Vec<Vec<f64>>) {
        self.ln_transitions = ln_transitions;
    }

    pub fn set_guess_context(&mut self, guess: GuessContext) {
        self.guess = Some(guess);
    }

    /// Relabel two states: prior entries, transition rows and columns, and
    /// the emission-map rows move together. The arena stays put, so the
    /// `Constant(0)`-at-index-0 invariant is preserved.
    pub(crate) fn swap_states(&mut self, i: usize, j: usize) {
        self.ln_priors.swap(i, j);
        self.ln_transitions.swap(i, j);
        for row in self.ln_transitions.iter_mut() {
            row.swap(i, j);
        }
        self.state_dimension_emissions.swap(i, j);
    }

    /// Per-row log emission probabilities of every state,
    /// `rows x n_states`. Scheme log-probabilities are computed once per
    /// (scheme, dimension) and summed over dimensions per state.
    pub fn ln_emission_matrix(
        &self,
        df: &DataFrame,
    ) -> SpanResult<Array2<f64>> {
        let rows = df.rows();
        let n = self.n_states();
        let mut per_scheme =
            vec![vec![None::<Vec<f64>>; self.dimension_labels.len()];
                self.emissions.len()];
        for map_row in self.state_dimension_emissions.iter() {
            for (dim, &scheme_idx) in map_row.iter().enumerate() {
                if per_scheme[scheme_idx][dim].is_none() {
                    let mut out = vec![0f64; rows];
                    self.emissions[scheme_idx].ln_probs(
                        df,
                        &self.dimension_labels[dim],
                        &mut out,
                    )?;
                    per_scheme[scheme_idx][dim] = Some(out);
                }
            }
        }
        let mut ln_e = Array2::<f64>::zeros((rows, n));
        for state in 0..n {
            for (dim, &scheme_idx) in
                self.state_dimension_emissions[state].iter().enumerate()
            {
                let lp = per_scheme[scheme_idx][dim]
                    .as_ref()
                    .expect("scheme log-probs computed above");
                for row in 0..rows {
                    ln_e[[row, state]] += lp[row];
                }
            }
        }
        Ok(ln_e)
    }

    /// Forward pass; returns the alpha table and the sequence
    /// log-likelihood.
    pub(crate) fn forward(&self, ln_e: &Array2<f64>) -> (Array2<f64>, f64) {
        let (rows, n) = ln_e.dim();
        let mut alpha = Array2::<f64>::zeros((rows, n));
        let mut scratch = vec![0f64; n];
        for s in 0..n {
            alpha[[0, s]] = self.ln_priors[s] + ln_e[[0, s]];
        }
        for t in 1..rows {
            for s in 0..n {
                for (u, slot) in scratch.iter_mut().enumerate() {
                    *slot = alpha[[t - 1, u]] + self.ln_transitions[u][s];
                }
                alpha[[t, s]] = ln_sum_exp(&scratch) + ln_e[[t, s]];
            }
        }
        let mut last = vec![0f64; n];
        for s in 0..n {
            last[s] = alpha[[rows - 1, s]];
        }
        let ll = ln_sum_exp(&last);
        (alpha, ll)
    }

    pub(crate) fn backward(&self, ln_e: &Array2<f64>) -> Array2<f64> {
        let (rows, n) = ln_e.dim();
        let mut beta = Array2::<f64>::zeros((rows, n));
        let mut scratch = vec![0f64; n];
        for t in (0..rows.saturating_sub(1)).rev() {
            for s in 0..n {
                for (u, slot) in scratch.iter_mut().enumerate() {
                    *slot = self.ln_transitions[s][u]
                        + ln_e[[t + 1, u]]
                        + beta[[t + 1, u]];
                }
                beta[[t, s]] = ln_sum_exp(&scratch);
            }
        }
        beta
    }

    /// Posterior state log-probabilities per bin and the sequence
    /// log-likelihood.
    pub fn posteriors(
        &self,
        df: &DataFrame,
    ) -> SpanResult<(Array2<f64>, f64)> {
        if df.is_empty() {
            return Err(SpanError::empty_coverage(
                "posterior decoding over an empty dataframe".to_owned(),
            ));
        }
        let ln_e = self.ln_emission_matrix(df)?;
        let (alpha, ll) = self.forward(&ln_e);
        let beta = self.backward(&ln_e);
        let (rows, n) = ln_e.dim();
        let mut ln_gamma = Array2::<f64>::zeros((rows, n));
        for t in 0..rows {
            for s in 0..n {
                ln_gamma[[t, s]] = alpha[[t, s]] + beta[[t, s]] - ll;
            }
        }
        Ok((ln_gamma, ll))
    }

    /// Most likely state sequence.
    pub fn viterbi(&self, df: &DataFrame) -> SpanResult<Vec<usize>> {
        if df.is_empty() {
            return Err(SpanError::empty_coverage(
                "viterbi decoding over an empty dataframe".to_owned(),
            ));
        }
        let ln_e = self.ln_emission_matrix(df)?;
        let (rows, n) = ln_e.dim();
        let mut score = Array2::<f64>::zeros((rows, n));
        let mut back = Array2::<usize>::zeros((rows, n));
        for s in 0..n {
            score[[0, s]] = self.ln_priors[s] + ln_e[[0, s]];
        }
        for t in 1..rows {
            for s in 0..n {
                let mut best = f64::NEG_INFINITY;
                let mut best_u = 0;
                for u in 0..n {
                    let candidate =
                        score[[t - 1, u]] + self.ln_transitions[u][s];
                    if candidate > best {
                        best = candidate;
                        best_u = u;
                    }
                }
                score[[t, s]] = best + ln_e[[t, s]];
                back[[t, s]] = best_u;
            }
        }
        let mut state = (0..n)
            .max_by(|&a, &b| {
                score[[rows - 1, a]]
                    .partial_cmp(&score[[rows - 1, b]])
                    .expect("viterbi scores are not NaN")
            })
            .unwrap_or(0);
        let mut path = vec![0usize; rows];
        path[rows - 1] = state;
        for t in (1..rows).rev() {
            state = back[[t, state]];
            path[t - 1] = state;
        }
        Ok(path)
    }

    /// Sample a state path and per-dimension observations. Regression
    /// schemes draw at the covariates of `covariates` (row-aligned); the
    /// count models ignore it.
    pub fn sample<R: Rng>(
        &self,
        covariates: &DataFrame,
        rng: &mut R,
    ) -> SpanResult<(Vec<usize>, Vec<Vec<i32>>)> {
        let rows = covariates.rows();
        let mut states = Vec::with_capacity(rows);
        let mut observations =
            vec![Vec::with_capacity(rows); self.dimensions()];
        let mut state = sample_categorical(&self.ln_priors, rng);
        for row in 0..rows {
            if row > 0 {
                state =
                    sample_categorical(&self.ln_transitions[state], rng);
            }
            states.push(state);
            for dim in 0..self.dimensions() {
                let draw = self
                    .scheme_for(state, dim)
                    .sample(covariates, row, rng)?;
                observations[dim].push(draw);
            }
        }
        Ok((states, observations))
    }

    /// Log a summary of the fitted parameters.
    pub fn log_parameters(&self) {
        for (state, name) in self.states.names().iter().enumerate() {
            let schemes = (0..self.dimensions())
                .map(|d| self.scheme_for(state, d).describe())
                .collect::<Vec<String>>()
                .join(", ");
            log::debug!(
                "state {name}: prior {:.4}, emissions [{schemes}]",
                self.ln_priors[state].exp()
            );
        }
    }

    /// Exp-space sanity check of priors and transition rows.
    pub(crate) fn validate_stochastic(&self) -> SpanResult<()> {
        let tol = 1e-6;
        let prior_sum =
            self.ln_priors.iter().map(|lp| lp.exp()).sum::<f64>();
        if (prior_sum - 1.0).abs() > tol {
            return Err(SpanError::NumericalFailure {
                iteration: 0,
                best_log_likelihood: None,
            });
        }
        for row in &self.ln_transitions {
            let sum = row.iter().map(|lp| lp.exp()).sum::<f64>();
            if (sum - 1.0).abs() > tol {
                return Err(SpanError::NumericalFailure {
                    iteration: 0,
                    best_log_likelihood: None,
                });
            }
        }
        Ok(())
    }
}

fn sample_categorical<R: Rng>(ln_probs: &[f64], rng: &mut R) -> usize {
    let mut u: f64 = rng.gen();
    for (i, lp) in ln_probs.iter().enumerate() {
        u -= lp.exp();
        if u <= 0f64 {
            return i;
        }
    }
    warn!("categorical sampling fell off the simplex, returning last state");
    ln_probs.len() - 1
}

#[cfg(test)]
mod hmm_tests {
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::dataframe::TREATMENT_COLUMN;
    use crate::emission::NegBinEmission;

    fn two_state_model() -> HiddenMarkovModel {
        let mut model = HiddenMarkovModel::new(
            StateSet::Lh,
            vec![TREATMENT_COLUMN.to_owned()],
            vec![
                EmissionScheme::NegBin(NegBinEmission::new(1.0, 5.0).unwrap()),
                EmissionScheme::NegBin(
                    NegBinEmission::new(20.0, 5.0).unwrap(),
                ),
            ],
            vec![vec![0], vec![1]],
        )
        .unwrap();
        model.set_ln_priors(vec![0.5f64.ln(), 0.5f64.ln()]);
        model.set_ln_transitions(vec![
            vec![0.9f64.ln(), 0.1f64.ln()],
            vec![0.1f64.ln(), 0.9f64.ln()],
        ]);
        model
    }

    fn frame(ys: Vec<i32>) -> DataFrame {
        let mut df = DataFrame::with_rows(ys.len());
        df.add_int_column(TREATMENT_COLUMN, ys).unwrap();
        df
    }

    #[test]
    fn test_zero_state_requires_constant_zero() {
        let err = HiddenMarkovModel::new(
            StateSet::Zlh,
            vec![TREATMENT_COLUMN.to_owned()],
            vec![
                EmissionScheme::NegBin(NegBinEmission::new(1.0, 1.0).unwrap()),
                EmissionScheme::NegBin(NegBinEmission::new(2.0, 1.0).unwrap()),
                EmissionScheme::NegBin(NegBinEmission::new(3.0, 1.0).unwrap()),
            ],
            vec![vec![0], vec![1], vec![2]],
        )
        .unwrap_err();
        assert!(matches!(err, SpanError::InvalidInput(_)));
    }

    #[test]
    fn test_posteriors_normalize_per_bin() {
        let model = two_state_model();
        let df = frame(vec![0, 1, 2, 30, 25, 1, 0]);
        let (ln_gamma, ll) = model.posteriors(&df).unwrap();
        assert!(ll.is_finite());
        for t in 0..df.rows() {
            let total = (0..2)
                .map(|s| ln_gamma[[t, s]].exp())
                .sum::<f64>();
            assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_viterbi_recovers_obvious_blocks() {
        let model = two_state_model();
        let mut ys = vec![1; 20];
        ys.extend(vec![22; 15]);
        ys.extend(vec![0; 20]);
        let path = model.viterbi(&frame(ys)).unwrap();
        assert!(path[..20].iter().all(|&s| s == 0));
        assert!(path[20..35].iter().all(|&s| s == 1));
        assert!(path[35..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_empty_dataframe_is_rejected() {
        let model = two_state_model();
        let df = frame(vec![]);
        assert!(matches!(
            model.posteriors(&df).unwrap_err(),
            SpanError::EmptyCoverage(_)
        ));
        assert!(matches!(
            model.viterbi(&df).unwrap_err(),
            SpanError::EmptyCoverage(_)
        ));
    }

    #[test]
    fn test_swap_states_relabels_consistently() {
        let mut model = two_state_model();
        model.set_ln_priors(vec![0.8f64.ln(), 0.2f64.ln()]);
        model.swap_states(0, 1);
        assert_relative_eq!(model.ln_priors()[0].exp(), 0.2, epsilon = 1e-12);
        assert_eq!(model.emission_map()[0], vec![1]);
        assert_relative_eq!(
            model.scheme_for(0, 0).as_neg_bin().unwrap().mean(),
            20.0
        );
        model.validate_stochastic().unwrap();
    }

    #[test]
    fn test_sampled_data_matches_state_means() {
        let model = two_state_model();
        let covariates = frame(vec![0; 5000]);
        let mut rng = StdRng::seed_from_u64(7);
        let (states, observations) =
            model.sample(&covariates, &mut rng).unwrap();
        let ys = &observations[0];
        let mut low = crate::util::WeightedMoments::default();
        let mut high = crate::util::WeightedMoments::default();
        for (state, y) in states.iter().zip(ys.iter()) {
            if *state == 0 {
                low.observe(*y as f64, 1.0);
            } else {
                high.observe(*y as f64, 1.0);
            }
        }
        assert_relative_eq!(low.mean(), 1.0, max_relative = 0.15);
        assert_relative_eq!(high.mean(), 20.0, max_relative = 0.1);
    }
}
