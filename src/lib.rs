//! Peak caller core for ChIP-Seq coverage: binned coverage with control
//! normalization and covariates, negative-binomial HMM / mixture models
//! fitted by expectation-maximization, posterior-based peak calling with
//! multiple-testing control, and a semi-supervised parameter tuner.
//!
//! Read tracks come in through the abstract [`coverage::CoverageSource`],
//! [`coverage::BigWigSource`] and [`coverage::SequenceSource`] traits; the
//! crate itself does not read alignment files.

pub mod analysis;
pub mod binning;
pub mod coverage;
pub mod dataframe;
pub mod emission;
pub mod errs;
pub mod fit_info;
pub mod genome;
pub mod hmm;
pub mod labels;
pub mod logging;
pub mod mixture;
pub mod model;
pub mod normalization;
mod parsing_utils;
pub mod peaks;
pub mod tuner;
pub mod util;

pub use analysis::{SpanAnalysis, SpanConfig};
pub use binning::BinnedCoverageBuilder;
pub use errs::{SpanError, SpanResult};
pub use fit_info::{FitInformation, Fragment, TrackPaths};
pub use genome::{Chromosome, Genome, GenomeQuery};
pub use model::{EnrichmentModel, ModelType};
pub use peaks::{Peak, PeakCallingParameters};
pub use tuner::{TuneResult, TuningGrid};
pub use util::CancellableState;
