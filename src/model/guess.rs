use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::emission::failures_by_moments;
use crate::emission::NB_VAR_MEAN_MULTIPLIER;
use crate::errs::{SpanError, SpanResult};
use crate::util::WeightedMoments;

/// Fraction of the highest (and, mirrored, lowest) observations used to
/// estimate the signal-to-noise ratio.
pub const ESTIMATE_SNR_FRACTION: f64 = 0.05;
/// Cap on the high-block mean relative to its standard deviation; guards
/// the SNR estimate against noiseless synthetic data.
pub const MAX_MEAN_TO_STD: f64 = 5.0;
/// Lower bound on any signal-to-noise ratio used for initialization.
pub const MIN_SNR: f64 = 1.1;

const EPS: f64 = 1e-10;

/// Initialization summary threaded into the EM runtime guards of the
/// canonical NB2Z model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuessContext {
    /// Mean of the low-coverage block, the LOW-state noise floor.
    pub noise_mean: f64,
    pub low_variance: f64,
    pub snr_target: f64,
}

/// Data-driven initial parameters for `n` negative-binomial states.
#[derive(Debug, Clone, PartialEq)]
pub struct Guess {
    pub means: Vec<f64>,
    pub failures: Vec<f64>,
    pub context: GuessContext,
}

/// Empirically tuned moment-based initialization: estimate the
/// signal-to-noise ratio from the extreme coverage blocks and lay the
/// state means out as a geometric ladder between noise and signal.
pub fn guess_by_data(
    emissions: &[i32],
    n_states: usize,
    drop_zeros: bool,
) -> SpanResult<Guess> {
    if n_states == 0 {
        return Err(SpanError::invalid_input(
            "cannot guess parameters for zero states".to_owned(),
        ));
    }
    let mut values = emissions
        .iter()
        .filter(|&&y| !drop_zeros || y != 0)
        .map(|&y| y as f64)
        .collect::<Vec<f64>>();
    if values.is_empty() {
        return Err(SpanError::empty_coverage(
            "no observations to initialize the model from".to_owned(),
        ));
    }
    let mut all = WeightedMoments::default();
    for &value in &values {
        all.observe(value, 1.0);
    }
    let mean = all.mean();
    debug!(
        "guessing from {} observations, mean {mean:.4}, sd {:.4}",
        values.len(),
        all.variance().sqrt()
    );
    values.sort_unstable_by(|a, b| b.partial_cmp(a).expect("finite counts"));

    let top_n = ((values.len() as f64 * ESTIMATE_SNR_FRACTION) as usize)
        .max(1)
        .min(values.len());
    let mut high = WeightedMoments::default();
    for &value in &values[..top_n] {
        high.observe(value, 1.0);
    }
    let mut mean_high = high.mean();
    let sd_high = high.variance().sqrt();
    if mean_high > MAX_MEAN_TO_STD * (sd_high + EPS) {
        warn!(
            "high block mean {mean_high:.4} above {MAX_MEAN_TO_STD} x sd \
             {sd_high:.4}, clamping"
        );
        mean_high = MAX_MEAN_TO_STD * (sd_high + EPS);
    }

    let low_n = ((values.len() as f64 * (1.0 - ESTIMATE_SNR_FRACTION)
        / 2.0) as usize)
        .max(1)
        .min(values.len());
    let mut low = WeightedMoments::default();
    for &value in &values[values.len() - low_n..] {
        low.observe(value, 1.0);
    }
    let mean_low = low.mean();
    let low_variance = low.variance();

    let snr =
        ((mean_high + EPS) / (mean_low + EPS)).max(MIN_SNR);
    debug!(
        "meanLow {mean_low:.4}, meanHigh {mean_high:.4}, snr {snr:.4}"
    );

    let means = if n_states == 1 {
        vec![mean.max(EPS)]
    } else {
        let base = (mean_low * mean).sqrt().max(EPS);
        (0..n_states)
            .map(|k| base * snr.powf(k as f64 / (n_states - 1) as f64))
            .collect()
    };
    let failures = means
        .iter()
        .map(|&mu| {
            let extrapolated = if mean_low > 0f64 {
                low_variance * (mu / mean_low)
            } else {
                0f64
            };
            failures_by_moments(
                mu,
                extrapolated.max(NB_VAR_MEAN_MULTIPLIER * mu),
            )
        })
        .collect();
    Ok(Guess {
        means,
        failures,
        context: GuessContext {
            noise_mean: mean_low,
            low_variance,
            snr_target: snr,
        },
    })
}

/// Signal-to-noise ratio of multi-start attempt `attempt`: the base guess
/// first, then alternating multiplicative perturbations
/// `snr*m, snr/m, snr*m^2, snr/m^2, ...`, floored at [`MIN_SNR`].
pub fn multi_start_snr(
    attempt: usize,
    snr: f64,
    multiplier: f64,
) -> f64 {
    let power = ((attempt + 1) / 2) as i32;
    let signed = if (attempt + 1) % 2 == 0 { power } else { -power };
    (snr * multiplier.powi(signed)).max(MIN_SNR)
}

/// Rescale a guessed mean ladder to a perturbed signal-to-noise ratio,
/// keeping the lowest mean anchored.
pub fn rescale_means_to_snr(guess: &Guess, snr: f64) -> Guess {
    let n = guess.means.len();
    if n < 2 {
        return guess.clone();
    }
    let base = guess.means[0];
    let means = (0..n)
        .map(|k| base * snr.powf(k as f64 / (n - 1) as f64))
        .collect::<Vec<f64>>();
    let failures = means
        .iter()
        .map(|&mu| {
            let extrapolated = if guess.context.noise_mean > 0f64 {
                guess.context.low_variance
                    * (mu / guess.context.noise_mean)
            } else {
                0f64
            };
            failures_by_moments(
                mu,
                extrapolated.max(NB_VAR_MEAN_MULTIPLIER * mu),
            )
        })
        .collect();
    Guess {
        means,
        failures,
        context: GuessContext { snr_target: snr, ..guess.context },
    }
}
