use derive_new::new;
use itertools::Itertools;
use log::{debug, info};
use rayon::prelude::*;

use crate::errs::{SpanError, SpanResult};
use crate::labels::{label_errors, LabelErrors, LocationLabel};
use crate::peaks::{call_peaks, ChromosomeBins, PeakCallingParameters};
use crate::util::CancellableState;

/// One grid point of the semi-supervised search.
#[derive(Debug, Clone, Copy, PartialEq, new)]
pub struct TuningPoint {
    pub fdr: f64,
    pub sensitivity_ln: f64,
    pub gap: usize,
}

/// Cartesian parameter grid, evaluated in declared order: FDRs outermost,
/// then sensitivities, then gaps.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningGrid {
    pub fdrs: Vec<f64>,
    pub sensitivities: Vec<f64>,
    pub gaps: Vec<usize>,
}

impl TuningGrid {
    pub fn points(&self) -> Vec<TuningPoint> {
        self.fdrs
            .iter()
            .cartesian_product(self.sensitivities.iter())
            .cartesian_product(self.gaps.iter())
            .map(|((&fdr, &sensitivity_ln), &gap)| {
                TuningPoint::new(fdr, sensitivity_ln, gap)
            })
            .collect()
    }
}

impl Default for TuningGrid {
    fn default() -> Self {
        Self {
            fdrs: vec![0.1, 0.05, 1e-2, 1e-4, 1e-6],
            sensitivities: vec![
                0.5f64.ln(),
                0.1f64.ln(),
                0.01f64.ln(),
                1e-4f64.ln(),
            ],
            gaps: vec![0, 1, 2, 5, 10],
        }
    }
}

#[derive(Debug, Clone)]
pub struct TuneResult {
    /// Label errors per grid point, in grid order.
    pub errors: Vec<(TuningPoint, LabelErrors)>,
    /// Index of the first grid point attaining the minimum total error.
    pub best: usize,
}

impl TuneResult {
    pub fn best_point(&self) -> TuningPoint {
        self.errors[self.best].0
    }
}

/// Evaluate the whole grid against the labels, one task per grid point on
/// the rayon pool. Peak calling is restricted to the chromosomes touching
/// labelled regions; result slots keep the declared grid order.
pub fn tune(
    chromosomes: &[ChromosomeBins],
    labels: &[LocationLabel],
    grid: &TuningGrid,
    cancel: &CancellableState,
) -> SpanResult<TuneResult> {
    if labels.is_empty() {
        return Err(SpanError::invalid_input(
            "no labels to tune against".to_owned(),
        ));
    }
    let labelled = chromosomes
        .iter()
        .filter(|c| {
            labels.iter().any(|l| l.chromosome == c.chromosome.name)
        })
        .cloned()
        .collect::<Vec<ChromosomeBins>>();
    if labelled.is_empty() {
        return Err(SpanError::invalid_input(
            "labels do not touch any analyzed chromosome".to_owned(),
        ));
    }
    debug!(
        "tuning over {} grid points on {} labelled chromosomes",
        grid.points().len(),
        labelled.len()
    );

    let points = grid.points();
    let errors = points
        .par_iter()
        .map(|point| {
            cancel.check()?;
            let params = PeakCallingParameters::new(
                point.fdr,
                point.sensitivity_ln,
                point.gap,
            );
            let peaks = call_peaks(&labelled, &params, cancel)?;
            Ok((*point, label_errors(&peaks, labels)))
        })
        .collect::<SpanResult<Vec<(TuningPoint, LabelErrors)>>>()?;

    let mut best = 0usize;
    let mut best_error = f64::INFINITY;
    for (i, (_, label_errors)) in errors.iter().enumerate() {
        let error = label_errors.total_error();
        if error < best_error {
            best_error = error;
            best = i;
        }
    }
    let point = errors[best].0;
    info!(
        "selected fdr {:.2e}, sensitivity {:.4}, gap {} with error {:.4}",
        point.fdr, point.sensitivity_ln, point.gap, best_error
    );
    Ok(TuneResult { errors, best })
}
