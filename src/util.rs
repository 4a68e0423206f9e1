use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errs::{SpanError, SpanResult};

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Default)]
pub enum Strand {
    #[default]
    Positive,
    Negative,
}

impl Strand {
    pub fn parse_char(x: char) -> SpanResult<Self> {
        match x {
            '+' => Ok(Self::Positive),
            '-' => Ok(Self::Negative),
            _ => Err(SpanError::invalid_input(format!(
                "failed to parse strand {}",
                x
            ))),
        }
    }

    pub fn to_char(&self) -> char {
        match self {
            Strand::Positive => '+',
            Strand::Negative => '-',
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Strand::Positive => Strand::Negative,
            Strand::Negative => Strand::Positive,
        }
    }
}

/// Cooperative cancellation flag shared between the driver and long-running
/// tasks. Tasks poll [`CancellableState::check`] at loop heads; a cancelled
/// flag surfaces as [`SpanError::Cancelled`] and partial results are
/// discarded by the caller.
#[derive(Debug, Clone, Default)]
pub struct CancellableState {
    flag: Arc<AtomicBool>,
}

impl CancellableState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> SpanResult<()> {
        if self.is_cancelled() {
            Err(SpanError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Streaming weighted first and second moments.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WeightedMoments {
    weight: f64,
    weighted_sum: f64,
    weighted_sq_sum: f64,
}

impl WeightedMoments {
    pub(crate) fn observe(&mut self, value: f64, weight: f64) {
        self.weight += weight;
        self.weighted_sum += weight * value;
        self.weighted_sq_sum += weight * value * value;
    }

    pub(crate) fn total_weight(&self) -> f64 {
        self.weight
    }

    pub(crate) fn mean(&self) -> f64 {
        if self.weight > 0f64 {
            self.weighted_sum / self.weight
        } else {
            0f64
        }
    }

    pub(crate) fn variance(&self) -> f64 {
        if self.weight > 0f64 {
            let mean = self.mean();
            (self.weighted_sq_sum / self.weight - mean * mean).max(0f64)
        } else {
            0f64
        }
    }

    pub(crate) fn combine(&mut self, other: &Self) {
        self.weight += other.weight;
        self.weighted_sum += other.weighted_sum;
        self.weighted_sq_sum += other.weighted_sq_sum;
    }
}

/// Max-shifted log-sum-exp over natural-log values, the log-space reduction
/// used by every probability computation in the crate.
pub(crate) fn ln_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max.is_infinite() && max < 0f64 {
        return f64::NEG_INFINITY;
    }
    let sum = values.iter().map(|&x| (x - max).exp()).sum::<f64>();
    max + sum.ln()
}

/// Pearson correlation of two equal-length slices, `0.0` when either side is
/// degenerate.
pub(crate) fn pearson_correlation(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n == 0 {
        return 0f64;
    }
    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;
    let mut cov = 0f64;
    let mut var_x = 0f64;
    let mut var_y = 0f64;
    for i in 0..n {
        let dx = xs[i] - mean_x;
        let dy = ys[i] - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= 0f64 || var_y <= 0f64 {
        0f64
    } else {
        cov / (var_x.sqrt() * var_y.sqrt())
    }
}
