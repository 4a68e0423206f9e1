use std::ops::Range;
use std::sync::Mutex;

use derive_new::new;
use rustc_hash::FxHashMap;

use crate::binning::BinnedCoverageBuilder;
use crate::dataframe::DataFrame;
use crate::errs::SpanResult;
use crate::genome::GenomeQuery;
use crate::normalization::CoverageScales;
use crate::util::Strand;

/// Strand-resolved read-start coverage of a genomic range. The source is
/// expected to apply the fragment-size shift (`fragment / 2`) itself and to
/// be safe for concurrent reads.
pub trait CoverageSource: Sync {
    fn coverage(
        &self,
        chromosome: &str,
        range: Range<u64>,
        strand: Strand,
    ) -> u32;
}

/// Aggregate signal over a range, as reported by a BigWig-style track.
#[derive(Debug, Clone, Copy, Default, PartialEq, new)]
pub struct Summary {
    pub sum: f64,
    pub count: u64,
}

impl Summary {
    pub fn mean(&self) -> Option<f64> {
        if self.count > 0 {
            Some(self.sum / self.count as f64)
        } else {
            None
        }
    }
}

/// Binned summaries of a continuous signal track (mapability).
pub trait BigWigSource: Sync {
    fn summarize(
        &self,
        chromosome: &str,
        start: u64,
        end: u64,
        bins: usize,
    ) -> Vec<Summary>;

    fn total_summary(&self) -> Summary;

    fn has_chromosome(&self, name: &str) -> bool;
}

/// Per-bin mean CpG fraction of the reference sequence.
pub trait SequenceSource: Sync {
    fn binned_mean_cg(&self, chromosome: &str, bin_size: u32) -> Vec<f64>;
}

/// Lazily built, mutex-guarded cache of normalized per-chromosome
/// dataframes. `prepare_data` is idempotent: the first call builds every
/// dataframe and the coverage scales, later calls are no-ops.
pub struct NormalizedCoverageQuery<'a> {
    builder: BinnedCoverageBuilder<'a>,
    query: GenomeQuery,
    state: Mutex<Option<PreparedCoverage>>,
}

#[derive(Debug, Clone)]
pub struct PreparedCoverage {
    pub query: GenomeQuery,
    pub dataframes: FxHashMap<String, DataFrame>,
    pub scales: Option<CoverageScales>,
}

impl<'a> NormalizedCoverageQuery<'a> {
    pub fn new(
        builder: BinnedCoverageBuilder<'a>,
        query: GenomeQuery,
    ) -> Self {
        Self { builder, query, state: Mutex::new(None) }
    }

    pub fn prepare_data(&self) -> SpanResult<PreparedCoverage> {
        let mut guard = self.state.lock().expect("coverage cache poisoned");
        if let Some(prepared) = guard.as_ref() {
            return Ok(prepared.clone());
        }
        let prepared = self.builder.build(&self.query)?;
        *guard = Some(prepared.clone());
        Ok(prepared)
    }
}
