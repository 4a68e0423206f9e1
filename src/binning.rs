use crossbeam_channel::bounded;
use log::debug;
use rayon::prelude::*;

use crate::coverage::{
    BigWigSource, CoverageSource, PreparedCoverage, SequenceSource,
};
use crate::dataframe::{
    DataFrame, CONTROL_COLUMN, GC2_COLUMN, GC_COLUMN, MAPABILITY_COLUMN,
    TREATMENT_COLUMN,
};
use crate::errs::{SpanError, SpanResult};
use crate::genome::{without_empty_chromosomes, Chromosome, GenomeQuery};
use crate::normalization::compute_scales;
use crate::util::Strand;

/// Builds per-chromosome dataframes of `{y, GC, GC2, input?, mapability?}`
/// from the configured sources. Chromosomes are independent and built on
/// the rayon pool; chromosomes with no treatment coverage are excluded.
pub struct BinnedCoverageBuilder<'a> {
    treatment: &'a dyn CoverageSource,
    control: Option<&'a dyn CoverageSource>,
    sequence: Option<&'a dyn SequenceSource>,
    mapability: Option<&'a dyn BigWigSource>,
    bin_size: u32,
}

impl<'a> BinnedCoverageBuilder<'a> {
    pub fn new(treatment: &'a dyn CoverageSource, bin_size: u32) -> Self {
        Self {
            treatment,
            control: None,
            sequence: None,
            mapability: None,
            bin_size,
        }
    }

    pub fn with_control(mut self, control: &'a dyn CoverageSource) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_sequence(mut self, sequence: &'a dyn SequenceSource) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_mapability(mut self, mapability: &'a dyn BigWigSource) -> Self {
        self.mapability = Some(mapability);
        self
    }

    pub fn bin_size(&self) -> u32 {
        self.bin_size
    }

    pub(crate) fn build(
        &self,
        query: &GenomeQuery,
    ) -> SpanResult<PreparedCoverage> {
        let chromosomes = query.chromosomes();
        if chromosomes.is_empty() {
            return Err(SpanError::empty_coverage(
                "genome query lists no chromosomes".to_owned(),
            ));
        }
        let (snd, rcv) = bounded(chromosomes.len());
        chromosomes.par_iter().for_each_with(snd, |snd, chromosome| {
            let df = self.chromosome_dataframe(chromosome);
            snd.send((chromosome.name.clone(), df))
                .expect("dataframe channel closed");
        });

        let mut dataframes = rustc_hash::FxHashMap::default();
        let mut empty = Vec::new();
        for (name, df) in rcv.iter() {
            let df = df?;
            let has_signal =
                df.treatment()?.iter().any(|&count| count > 0);
            if has_signal {
                dataframes.insert(name, df);
            } else {
                empty.push(name);
            }
        }
        let query = without_empty_chromosomes(query, &empty)?;
        let scales = if self.control.is_some() {
            let frames = query
                .chromosomes()
                .iter()
                .map(|c| &dataframes[&c.name])
                .collect::<Vec<&DataFrame>>();
            Some(compute_scales(&frames)?)
        } else {
            None
        };
        Ok(PreparedCoverage { query, dataframes, scales })
    }

    fn chromosome_dataframe(
        &self,
        chromosome: &Chromosome,
    ) -> SpanResult<DataFrame> {
        let n_bins = chromosome.bin_count(self.bin_size);
        let mut df = DataFrame::with_rows(n_bins);

        df.add_int_column(
            TREATMENT_COLUMN,
            self.binned_counts(self.treatment, chromosome),
        )?;
        if let Some(control) = self.control {
            let counts = self.binned_counts(control, chromosome);
            df.add_float_column(
                CONTROL_COLUMN,
                counts.into_iter().map(|c| c as f64).collect(),
            )?;
        }
        if let Some(sequence) = self.sequence {
            let gc = sequence.binned_mean_cg(&chromosome.name, self.bin_size);
            if gc.len() != n_bins {
                return Err(SpanError::DimensionMismatch(format!(
                    "sequence source returned {} GC bins for {}, expected {}",
                    gc.len(),
                    chromosome.name,
                    n_bins
                )));
            }
            let gc2 = gc.iter().map(|&g| g * g).collect::<Vec<f64>>();
            df.add_float_column(GC_COLUMN, gc)?;
            df.add_float_column(GC2_COLUMN, gc2)?;
        }
        if let Some(mapability) = self.mapability {
            df.add_float_column(
                MAPABILITY_COLUMN,
                self.binned_mapability(mapability, chromosome, n_bins),
            )?;
        }
        debug!(
            "built {} bins for {} at bin size {}",
            n_bins, chromosome.name, self.bin_size
        );
        Ok(df)
    }

    /// Both-strand counts per bin; the source already applies the
    /// fragment shift to read starts.
    fn binned_counts(
        &self,
        source: &dyn CoverageSource,
        chromosome: &Chromosome,
    ) -> Vec<i32> {
        chromosome
            .bins(self.bin_size)
            .map(|bin| {
                let range = bin.start..bin.end;
                let fwd = source.coverage(
                    &chromosome.name,
                    range.clone(),
                    Strand::Positive,
                );
                let rev = source.coverage(
                    &chromosome.name,
                    range,
                    Strand::Negative,
                );
                (fwd + rev) as i32
            })
            .collect()
    }

    /// Mean mapability per bin clamped to `[0, 1]`. Chromosomes absent from
    /// the track fall back to the genome-wide mean signal.
    fn binned_mapability(
        &self,
        mapability: &dyn BigWigSource,
        chromosome: &Chromosome,
        n_bins: usize,
    ) -> Vec<f64> {
        let genome_mean = mapability
            .total_summary()
            .mean()
            .unwrap_or(1.0)
            .clamp(0.0, 1.0);
        if !mapability.has_chromosome(&chromosome.name) {
            debug!(
                "chromosome {} absent from mapability track, using mean {}",
                chromosome.name, genome_mean
            );
            return vec![genome_mean; n_bins];
        }
        mapability
            .summarize(&chromosome.name, 0, chromosome.length, n_bins)
            .into_iter()
            .map(|summary| {
                summary.mean().unwrap_or(genome_mean).clamp(0.0, 1.0)
            })
            .collect()
    }
}
