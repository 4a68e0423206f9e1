use ndarray::{Array1, Array2};
use rand::Rng;
use rv::dist::Poisson;
use rv::traits::Rv;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

use crate::dataframe::DataFrame;
use crate::emission::negbin::failures_by_moments;
use crate::errs::{SpanError, SpanResult};
use crate::util::WeightedMoments;

const EPS: f64 = 1e-10;

/// Weighted least squares, `beta = (X^T W X)^-1 X^T W z`. The design
/// matrix gets an intercept column prepended; the normal equations are
/// solved densely (systems are covariates + 1 wide).
pub struct WlsRegression;

impl WlsRegression {
    /// Assemble `[1 | columns]`; all columns must share a length.
    pub fn design_matrix(columns: &[&[f64]]) -> SpanResult<Array2<f64>> {
        let rows = columns.first().map(|c| c.len()).unwrap_or(0);
        for (i, column) in columns.iter().enumerate() {
            if column.len() != rows {
                return Err(SpanError::DimensionMismatch(format!(
                    "design column {i} has {} rows, expected {rows}",
                    column.len()
                )));
            }
        }
        let mut x = Array2::<f64>::zeros((rows, columns.len() + 1));
        for row in 0..rows {
            x[[row, 0]] = 1.0;
            for (j, column) in columns.iter().enumerate() {
                x[[row, j + 1]] = column[row];
            }
        }
        Ok(x)
    }

    /// Solve the weighted normal equations for one IRLS step.
    pub fn fit(
        x: &Array2<f64>,
        weights: &[f64],
        z: &[f64],
    ) -> SpanResult<Array1<f64>> {
        let (rows, p) = x.dim();
        if weights.len() != rows || z.len() != rows {
            return Err(SpanError::DimensionMismatch(format!(
                "weights ({}) and response ({}) must match design rows ({rows})",
                weights.len(),
                z.len()
            )));
        }
        let mut gram = Array2::<f64>::zeros((p, p));
        let mut moment = Array1::<f64>::zeros(p);
        for row in 0..rows {
            let w = weights[row];
            if w <= 0f64 {
                continue;
            }
            for a in 0..p {
                let xa = x[[row, a]];
                moment[a] += w * xa * z[row];
                for b in a..p {
                    gram[[a, b]] += w * xa * x[[row, b]];
                }
            }
        }
        for a in 0..p {
            for b in 0..a {
                gram[[a, b]] = gram[[b, a]];
            }
        }
        solve_dense(gram, moment)
    }
}

/// Gauss-Jordan elimination with partial pivoting; the systems here are at
/// most (covariates + 1) squared.
fn solve_dense(
    mut a: Array2<f64>,
    mut b: Array1<f64>,
) -> SpanResult<Array1<f64>> {
    let n = b.len();
    for col in 0..n {
        let mut pivot = col;
        for row in (col + 1)..n {
            if a[[row, col]].abs() > a[[pivot, col]].abs() {
                pivot = row;
            }
        }
        if a[[pivot, col]].abs() < 1e-12 {
            return Err(SpanError::invalid_input(
                "singular design in weighted least squares".to_owned(),
            ));
        }
        if pivot != col {
            for k in 0..n {
                let tmp = a[[col, k]];
                a[[col, k]] = a[[pivot, k]];
                a[[pivot, k]] = tmp;
            }
            b.swap(col, pivot);
        }
        let diag = a[[col, col]];
        for k in 0..n {
            a[[col, k]] /= diag;
        }
        b[col] /= diag;
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[[row, col]];
            if factor == 0f64 {
                continue;
            }
            for k in 0..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }
    Ok(b)
}

/// GLM emission pieces shared by the Poisson and NB regression schemes:
/// log link over the configured covariate columns plus intercept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionModel {
    covariate_labels: Vec<String>,
    /// Intercept first, then one coefficient per covariate label.
    beta: Vec<f64>,
}

impl RegressionModel {
    pub fn new(covariate_labels: Vec<String>, beta: Vec<f64>) -> SpanResult<Self> {
        if beta.len() != covariate_labels.len() + 1 {
            return Err(SpanError::DimensionMismatch(format!(
                "{} coefficients for {} covariates (+ intercept)",
                beta.len(),
                covariate_labels.len()
            )));
        }
        Ok(Self { covariate_labels, beta })
    }

    pub fn covariate_labels(&self) -> &[String] {
        &self.covariate_labels
    }

    pub fn beta(&self) -> &[f64] {
        &self.beta
    }

    fn covariate_columns<'d>(
        &self,
        df: &'d DataFrame,
    ) -> SpanResult<Vec<&'d [f64]>> {
        self.covariate_labels
            .iter()
            .map(|label| df.float_column(label))
            .collect()
    }

    /// Linear predictors `eta = X beta` for every row of the dataframe.
    pub fn linear_predictors(&self, df: &DataFrame) -> SpanResult<Vec<f64>> {
        let columns = self.covariate_columns(df)?;
        let mut etas = vec![self.beta[0]; df.rows()];
        for (j, column) in columns.iter().enumerate() {
            let coefficient = self.beta[j + 1];
            for (eta, value) in etas.iter_mut().zip(column.iter()) {
                *eta += coefficient * value;
            }
        }
        Ok(etas)
    }

    fn irls_step(
        &mut self,
        observations: &[GlmObservations],
        dispersion: Option<f64>,
    ) -> SpanResult<()> {
        let n_covariates = self.covariate_labels.len();
        let mut columns = vec![Vec::<f64>::new(); n_covariates];
        let mut weights = Vec::new();
        let mut working_response = Vec::new();
        for obs in observations {
            let obs_columns = self.covariate_columns(obs.df)?;
            let etas = self.linear_predictors(obs.df)?;
            let ys = obs.df.int_column(obs.observed)?;
            if obs.weights.len() != ys.len() {
                return Err(SpanError::DimensionMismatch(format!(
                    "{} weights for {} observations",
                    obs.weights.len(),
                    ys.len()
                )));
            }
            for row in 0..ys.len() {
                let mu = etas[row].exp().max(EPS);
                // working weight: w * mu for Poisson, damped by the NB
                // dispersion when present
                let working = match dispersion {
                    None => obs.weights[row] * mu,
                    Some(r) => obs.weights[row] * mu / (1.0 + mu / r),
                };
                weights.push(working);
                working_response
                    .push(etas[row] + (ys[row] as f64 - mu) / mu);
                for (j, column) in obs_columns.iter().enumerate() {
                    columns[j].push(column[row]);
                }
            }
        }
        if weights.iter().sum::<f64>() <= 1e-8 {
            // a starved component keeps its coefficients
            return Ok(());
        }
        let x = if n_covariates == 0 {
            Array2::<f64>::ones((weights.len(), 1))
        } else {
            let column_refs = columns
                .iter()
                .map(|c| c.as_slice())
                .collect::<Vec<&[f64]>>();
            WlsRegression::design_matrix(&column_refs)?
        };
        let beta = WlsRegression::fit(&x, &weights, &working_response)?;
        self.beta = beta.to_vec();
        Ok(())
    }
}

pub struct GlmObservations<'a> {
    pub df: &'a DataFrame,
    pub observed: &'a str,
    pub weights: &'a [f64],
}

/// `y ~ Poisson(exp(x^T beta))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoissonRegressionEmission {
    model: RegressionModel,
}

impl PoissonRegressionEmission {
    pub fn new(
        covariate_labels: Vec<String>,
        beta: Vec<f64>,
    ) -> SpanResult<Self> {
        Ok(Self { model: RegressionModel::new(covariate_labels, beta)? })
    }

    pub fn model(&self) -> &RegressionModel {
        &self.model
    }

    pub fn ln_probs(
        &self,
        df: &DataFrame,
        observed: &str,
        out: &mut [f64],
    ) -> SpanResult<()> {
        let etas = self.model.linear_predictors(df)?;
        let ys = df.int_column(observed)?;
        for row in 0..ys.len() {
            let y = ys[row].max(0) as f64;
            out[row] = y * etas[row] - etas[row].exp() - ln_gamma(y + 1.0);
        }
        Ok(())
    }

    /// One weighted-least-squares IRLS step.
    pub fn update(
        &mut self,
        observations: &[GlmObservations],
    ) -> SpanResult<()> {
        self.model.irls_step(observations, None)
    }

    pub fn sample<R: Rng>(
        &self,
        df: &DataFrame,
        row: usize,
        rng: &mut R,
    ) -> SpanResult<i32> {
        let etas = self.model.linear_predictors(df)?;
        let poisson = Poisson::new(etas[row].exp().max(EPS)).map_err(|e| {
            SpanError::invalid_input(format!(
                "poisson regression sampling failed, {e}"
            ))
        })?;
        let draw: u32 = poisson.draw(rng);
        Ok(draw as i32)
    }
}

/// Same mean model as the Poisson regression with NB noise of the given
/// failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegBinRegressionEmission {
    model: RegressionModel,
    failures: f64,
}

impl NegBinRegressionEmission {
    pub fn new(
        covariate_labels: Vec<String>,
        beta: Vec<f64>,
        failures: f64,
    ) -> SpanResult<Self> {
        if !(failures > 0f64) {
            return Err(SpanError::invalid_input(format!(
                "negative binomial regression requires positive failures, \
                 got {failures}"
            )));
        }
        Ok(Self {
            model: RegressionModel::new(covariate_labels, beta)?,
            failures,
        })
    }

    pub fn model(&self) -> &RegressionModel {
        &self.model
    }

    pub fn failures(&self) -> f64 {
        self.failures
    }

    pub fn ln_probs(
        &self,
        df: &DataFrame,
        observed: &str,
        out: &mut [f64],
    ) -> SpanResult<()> {
        let etas = self.model.linear_predictors(df)?;
        let ys = df.int_column(observed)?;
        let r = self.failures;
        let ln_gamma_r = ln_gamma(r);
        for row in 0..ys.len() {
            let y = ys[row].max(0) as f64;
            let mu = etas[row].exp().max(EPS);
            out[row] = ln_gamma(y + r) - ln_gamma_r - ln_gamma(y + 1.0)
                + r * (r.ln() - (r + mu).ln())
                + y * (mu.ln() - (r + mu).ln());
        }
        Ok(())
    }

    /// One IRLS step for the mean model, then a moment update of the
    /// dispersion around the fitted means.
    pub fn update(
        &mut self,
        observations: &[GlmObservations],
    ) -> SpanResult<()> {
        self.model.irls_step(observations, Some(self.failures))?;
        let mut residuals = WeightedMoments::default();
        let mut fitted = WeightedMoments::default();
        for obs in observations {
            let etas = self.model.linear_predictors(obs.df)?;
            let ys = obs.df.int_column(obs.observed)?;
            for row in 0..ys.len() {
                let w = obs.weights[row];
                if w <= 0f64 {
                    continue;
                }
                let mu = etas[row].exp();
                residuals.observe(ys[row] as f64 - mu, w);
                fitted.observe(mu, w);
            }
        }
        if residuals.total_weight() > 0f64 {
            let mean = fitted.mean().max(EPS);
            // mean squared residual around the fitted means plays the role
            // of the sample variance in the moment match
            let spread = residuals.variance()
                + residuals.mean() * residuals.mean();
            self.failures = failures_by_moments(mean, spread);
        }
        Ok(())
    }
}

#[cfg(test)]
mod regression_tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::dataframe::{GC_COLUMN, TREATMENT_COLUMN};

    #[test]
    fn test_design_matrix_prepends_intercept() {
        let x = WlsRegression::design_matrix(&[
            &[1.0, 2.0, 3.0],
            &[4.0, 5.0, 6.0],
        ])
        .unwrap();
        assert_eq!(x.dim(), (3, 3));
        assert_eq!(x.row(1).to_vec(), vec![1.0, 2.0, 5.0]);
    }

    #[test]
    fn test_design_matrix_rejects_ragged_columns() {
        let err = WlsRegression::design_matrix(&[
            &[1.0, 2.0, 3.0],
            &[4.0, 5.0],
        ])
        .unwrap_err();
        assert!(matches!(err, SpanError::DimensionMismatch(_)));
    }

    #[test]
    fn test_wls_recovers_exact_line() {
        // z = 2 + 3 * x, uniform weights
        let xs = [0.0, 1.0, 2.0, 3.0];
        let zs = xs.iter().map(|x| 2.0 + 3.0 * x).collect::<Vec<f64>>();
        let design = WlsRegression::design_matrix(&[&xs]).unwrap();
        let beta =
            WlsRegression::fit(&design, &[1.0; 4], &zs).unwrap();
        assert_relative_eq!(beta[0], 2.0, epsilon = 1e-9);
        assert_relative_eq!(beta[1], 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_singular_design_is_rejected() {
        let design = WlsRegression::design_matrix(&[
            &[1.0, 1.0, 1.0],
        ])
        .unwrap();
        // duplicate of the intercept column -> singular Gram matrix
        let err =
            WlsRegression::fit(&design, &[1.0; 3], &[1.0, 2.0, 3.0])
                .unwrap_err();
        assert!(matches!(err, SpanError::InvalidInput(_)));
    }

    fn glm_frame() -> DataFrame {
        let gc = (0..400).map(|i| (i % 20) as f64 / 20.0).collect::<Vec<f64>>();
        let ys = gc
            .iter()
            .map(|g| (0.5 + 2.0 * g).exp().round() as i32)
            .collect::<Vec<i32>>();
        let mut df = DataFrame::with_rows(400);
        df.add_int_column(TREATMENT_COLUMN, ys).unwrap();
        df.add_float_column(GC_COLUMN, gc).unwrap();
        df
    }

    #[test]
    fn test_poisson_irls_moves_towards_truth() {
        let df = glm_frame();
        let weights = vec![1.0; df.rows()];
        let mut emission = PoissonRegressionEmission::new(
            vec![GC_COLUMN.to_owned()],
            vec![0.4, 1.5],
        )
        .unwrap();
        let obs = [GlmObservations {
            df: &df,
            observed: TREATMENT_COLUMN,
            weights: &weights,
        }];
        for _ in 0..8 {
            emission.update(&obs).unwrap();
        }
        let beta = emission.model().beta();
        assert_relative_eq!(beta[0], 0.5, epsilon = 0.1);
        assert_relative_eq!(beta[1], 2.0, epsilon = 0.15);
    }

    #[test]
    fn test_poisson_ln_probs_peak_at_mean() {
        let mut df = DataFrame::with_rows(3);
        df.add_int_column(TREATMENT_COLUMN, vec![1, 3, 9]).unwrap();
        df.add_float_column(GC_COLUMN, vec![0.0, 0.5, 1.0]).unwrap();
        let emission = PoissonRegressionEmission::new(
            vec![GC_COLUMN.to_owned()],
            vec![1.0986122886681098, 1.0986122886681098],
        )
        .unwrap();
        let mut out = [0f64; 3];
        emission.ln_probs(&df, TREATMENT_COLUMN, &mut out).unwrap();
        // means are 3, ~5.2, 9; the first and last rows observe their mean
        assert!(out[0] > out[1]);
        assert!(out[2] > out[1]);
    }

    #[test]
    fn test_negbin_regression_update_keeps_positive_dispersion() {
        let df = glm_frame();
        let weights = vec![1.0; df.rows()];
        let mut emission = NegBinRegressionEmission::new(
            vec![GC_COLUMN.to_owned()],
            vec![0.4, 1.5],
            5.0,
        )
        .unwrap();
        let obs = [GlmObservations {
            df: &df,
            observed: TREATMENT_COLUMN,
            weights: &weights,
        }];
        for _ in 0..4 {
            emission.update(&obs).unwrap();
        }
        assert!(emission.failures() > 0.0);
        let beta = emission.model().beta();
        assert!((beta[1] - 2.0).abs() < 0.5);
    }
}
