use thiserror::Error;

pub type SpanResult<T> = Result<T, SpanError>;

#[derive(Error, Debug, PartialEq)]
pub enum SpanError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("empty coverage: {0}")]
    EmptyCoverage(String),
    #[error(
        "numerical failure at iteration {iteration}, \
         best log-likelihood so far {best_log_likelihood:?}"
    )]
    NumericalFailure {
        iteration: usize,
        best_log_likelihood: Option<f64>,
    },
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("cancelled")]
    Cancelled,
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
}

impl SpanError {
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn empty_coverage<S: Into<String>>(msg: S) -> Self {
        Self::EmptyCoverage(msg.into())
    }
}
