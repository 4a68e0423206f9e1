use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::dataframe::{DataFrame, CONTROL_COLUMN};
use crate::errs::{SpanError, SpanResult};
use crate::util::pearson_correlation;

/// Treatment/control scaling derived from genome-wide coverage totals,
/// recorded in the fit state and reused by peak scoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoverageScales {
    /// Multiplier bringing the control total onto the treatment total.
    pub scale_control: f64,
    /// Mixing coefficient of the scaled control subtracted from
    /// treatment; the peak scorer uses `beta * scale_control * input` as
    /// its background.
    pub beta: f64,
}

/// Compute `scale_control` and `beta` over the kept chromosomes. Both are
/// deterministic functions of the two coverage profiles.
pub(crate) fn compute_scales(
    dataframes: &[&DataFrame],
) -> SpanResult<CoverageScales> {
    let mut treatment_total = 0f64;
    let mut control_total = 0f64;
    for df in dataframes {
        treatment_total +=
            df.treatment()?.iter().map(|&y| y as f64).sum::<f64>();
        control_total +=
            df.float_column(CONTROL_COLUMN)?.iter().sum::<f64>();
    }
    if control_total <= 0f64 {
        return Err(SpanError::empty_coverage(
            "control track has no coverage".to_owned(),
        ));
    }
    if treatment_total <= 0f64 {
        return Err(SpanError::empty_coverage(
            "treatment track has no coverage".to_owned(),
        ));
    }
    let scale_control = treatment_total / control_total;
    debug!(
        "treatment total {treatment_total}, control total {control_total}, \
         scale {scale_control}"
    );

    let mut y = Vec::new();
    let mut scaled_input = Vec::new();
    for df in dataframes {
        y.extend(df.treatment()?.iter().map(|&v| v as f64));
        scaled_input.extend(
            df.float_column(CONTROL_COLUMN)?
                .iter()
                .map(|&v| v * scale_control),
        );
    }
    let beta = estimate_beta(&y, &scaled_input);
    info!("control scale {:.4}, beta {:.2}", scale_control, beta);
    Ok(CoverageScales { scale_control, beta })
}

/// Linear mixing coefficient in `[0, 1]` minimizing the absolute
/// correlation between `y - beta * scaled_input` and `scaled_input`,
/// searched on the grid `{k * 0.01 : k = 0..=100}`. The first grid point
/// attaining the minimum wins.
fn estimate_beta(y: &[f64], scaled_input: &[f64]) -> f64 {
    let mut best_beta = 0f64;
    let mut best_corr = f64::INFINITY;
    let mut residual = vec![0f64; y.len()];
    for k in 0..=100u32 {
        let beta = k as f64 * 0.01;
        for i in 0..y.len() {
            residual[i] = y[i] - beta * scaled_input[i];
        }
        let corr = pearson_correlation(&residual, scaled_input).abs();
        if corr < best_corr {
            best_corr = corr;
            best_beta = beta;
        }
    }
    best_beta
}

#[cfg(test)]
mod normalization_tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::dataframe::TREATMENT_COLUMN;

    fn frame(y: Vec<i32>, input: Vec<f64>) -> DataFrame {
        let mut df = DataFrame::with_rows(y.len());
        df.add_int_column(TREATMENT_COLUMN, y).unwrap();
        df.add_float_column(CONTROL_COLUMN, input).unwrap();
        df
    }

    #[test]
    fn test_scale_equalizes_totals() {
        let df = frame(vec![2, 4, 6], vec![4.0, 8.0, 12.0]);
        let scales = compute_scales(&[&df]).unwrap();
        assert_relative_eq!(scales.scale_control, 0.5);
    }

    #[test]
    fn test_beta_recovers_mixed_background() {
        // y is exactly background * 0.6 plus an uncorrelated component, so
        // the residual decorrelates at beta = 0.6
        let background =
            (0..200).map(|i| ((i * 13) % 29) as f64).collect::<Vec<f64>>();
        let independent =
            (0..200).map(|i| ((i * 7) % 11) as f64).collect::<Vec<f64>>();
        let y = background
            .iter()
            .zip(independent.iter())
            .map(|(b, s)| (0.6 * b + s).round() as i32)
            .collect::<Vec<i32>>();
        let df = frame(y, background);
        let scales = compute_scales(&[&df]).unwrap();
        assert!(
            (scales.beta - 0.6).abs() <= 0.05,
            "beta {} not near 0.6",
            scales.beta
        );
        assert!(scales.beta >= 0.0 && scales.beta <= 1.0);
    }

    #[test]
    fn test_empty_control_is_rejected() {
        let df = frame(vec![1, 2], vec![0.0, 0.0]);
        assert!(matches!(
            compute_scales(&[&df]).unwrap_err(),
            SpanError::EmptyCoverage(_)
        ));
    }
}
