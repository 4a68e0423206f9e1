use std::ops::Range;

use bio::stats::{LogProb, PHREDProb};
use itertools::Itertools;
use log::debug;

use crate::errs::{SpanError, SpanResult};
use crate::genome::Chromosome;
use crate::util::CancellableState;

pub mod segments;

use segments::{compute_bins_cores_and_peaks, BinSegment};

/// Fraction of a peak's bins (ranked by signal) that contribute to its
/// score blocks.
pub const SCORE_BLOCKS_FRACTION: f64 = 0.5;
pub const DEFAULT_SCORE_BLOCKS_GAP: usize = 3;
/// Fraction of the original signal a clipped peak must retain.
pub const DEFAULT_CLIP_MAX_SIGNAL: f64 = 0.75;
/// Fraction of the original length a clipped peak must retain.
pub const DEFAULT_CLIP_MAX_LENGTH: f64 = 0.5;

const MIN_Q: f64 = 1e-300;

#[derive(Debug, Clone, PartialEq)]
pub struct PeakCallingParameters {
    /// Benjamini-Hochberg threshold for the strict bitset.
    pub fdr: f64,
    /// Natural-log threshold on the null posterior for the relaxed bitset.
    pub sensitivity_ln: f64,
    /// Bins of separation bridged when merging neighbouring spans.
    pub gap: usize,
    pub clip_max_signal: f64,
    pub clip_max_length: f64,
    pub score_blocks_gap: usize,
}

impl PeakCallingParameters {
    pub fn new(fdr: f64, sensitivity_ln: f64, gap: usize) -> Self {
        Self {
            fdr,
            sensitivity_ln,
            gap,
            clip_max_signal: DEFAULT_CLIP_MAX_SIGNAL,
            clip_max_length: DEFAULT_CLIP_MAX_LENGTH,
            score_blocks_gap: DEFAULT_SCORE_BLOCKS_GAP,
        }
    }
}

/// Per-chromosome peak-calling input: null posteriors and signal per bin.
#[derive(Debug, Clone)]
pub struct ChromosomeBins {
    pub chromosome: Chromosome,
    pub bin_size: u32,
    /// Log-probability of the null hypothesis per bin.
    pub ln_null: Vec<f64>,
    /// Treatment counts per bin.
    pub signal: Vec<i32>,
    /// Control coverage mixed onto the treatment
    /// (`beta * scale_control * input`), when a control is available;
    /// fold changes score against it.
    pub scaled_control: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Peak {
    pub chromosome: String,
    pub start: u64,
    pub end: u64,
    pub name: String,
    /// Display score in `[0, 1000]`.
    pub score: u32,
    pub fold_change: f64,
    pub mlog10_p: f64,
    pub mlog10_q: f64,
}

impl Peak {
    /// `chrom start end name score . foldChange -log10(p) -log10(q)`.
    pub fn to_bed_row(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t.\t{:.5}\t{:.5}\t{:.5}",
            self.chromosome,
            self.start,
            self.end,
            self.name,
            self.score,
            self.fold_change,
            self.mlog10_p,
            self.mlog10_q
        )
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }
}

/// Write a peak set as tab-separated BED rows.
pub fn write_bed<W: std::io::Write>(
    peaks: &[Peak],
    writer: &mut W,
) -> SpanResult<u64> {
    let mut rows = 0u64;
    for peak in peaks {
        writeln!(writer, "{}", peak.to_bed_row()).map_err(|e| {
            SpanError::invalid_input(format!(
                "failed to write peaks, {e}"
            ))
        })?;
        rows += 1;
    }
    Ok(rows)
}

/// Benjamini-Hochberg adjusted q-values.
pub fn bh_qvalues(p_values: &[f64]) -> Vec<f64> {
    let n = p_values.len();
    if n == 0 {
        return Vec::new();
    }
    let mut order = (0..n).collect::<Vec<usize>>();
    order.sort_by(|&a, &b| {
        p_values[a].partial_cmp(&p_values[b]).expect("finite p-values")
    });
    let mut q_values = vec![0f64; n];
    let mut running_min = 1f64;
    for rank in (0..n).rev() {
        let i = order[rank];
        let adjusted =
            (p_values[i] * n as f64 / (rank + 1) as f64).min(1.0);
        running_min = running_min.min(adjusted);
        q_values[i] = running_min;
    }
    q_values
}

/// Call peaks over the analyzed chromosomes. The strict bitset passes the
/// genome-wide Benjamini-Hochberg threshold at `fdr`; the relaxed bitset
/// passes the sensitivity threshold and always contains the strict set.
pub fn call_peaks(
    chromosomes: &[ChromosomeBins],
    params: &PeakCallingParameters,
    cancel: &CancellableState,
) -> SpanResult<Vec<Peak>> {
    let total_bins: usize =
        chromosomes.iter().map(|c| c.ln_null.len()).sum();
    if total_bins == 0 {
        return Err(SpanError::empty_coverage(
            "no bins to call peaks on".to_owned(),
        ));
    }
    for chromosome_bins in chromosomes {
        if chromosome_bins.ln_null.len() != chromosome_bins.signal.len() {
            return Err(SpanError::DimensionMismatch(format!(
                "{} null probabilities for {} signal bins on {}",
                chromosome_bins.ln_null.len(),
                chromosome_bins.signal.len(),
                chromosome_bins.chromosome.name
            )));
        }
    }

    // genome-wide multiple testing over the pooled null probabilities
    let pooled = chromosomes
        .iter()
        .flat_map(|c| c.ln_null.iter().map(|&lp| lp.exp()))
        .collect::<Vec<f64>>();
    let q_values = bh_qvalues(&pooled);

    let mut peaks = Vec::new();
    let mut offset = 0usize;
    for chromosome_bins in chromosomes {
        cancel.check()?;
        let n = chromosome_bins.ln_null.len();
        let chrom_q = &q_values[offset..offset + n];
        offset += n;
        peaks.extend(chromosome_peaks(
            chromosome_bins,
            chrom_q,
            params,
        )?);
    }
    debug!("called {} peaks at fdr {}", peaks.len(), params.fdr);
    Ok(peaks)
}

fn chromosome_peaks(
    bins: &ChromosomeBins,
    q_values: &[f64],
    params: &PeakCallingParameters,
) -> SpanResult<Vec<Peak>> {
    let n = bins.ln_null.len();
    let mut relaxed = vec![false; n];
    let mut strict = vec![false; n];
    for i in 0..n {
        strict[i] = q_values[i] <= params.fdr;
        // the strict set is a subset of the relaxed set by construction
        relaxed[i] = strict[i] || bins.ln_null[i] <= params.sensitivity_ln;
    }
    let segments =
        compute_bins_cores_and_peaks(&relaxed, &strict, params.gap)?;

    let chrom_mean = bins.signal.iter().map(|&y| y as f64).sum::<f64>()
        / n as f64;
    let mut peaks = segments
        .into_iter()
        .map(|segment| {
            score_segment(bins, q_values, params, segment, chrom_mean)
        })
        .collect::<Vec<Peak>>();
    peaks.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then(a.end.cmp(&b.end))
            .then(a.name.cmp(&b.name))
    });
    Ok(peaks)
}

fn score_segment(
    bins: &ChromosomeBins,
    q_values: &[f64],
    params: &PeakCallingParameters,
    segment: BinSegment,
    chrom_mean: f64,
) -> Peak {
    let clipped = clip_span(
        &segment.span,
        &bins.signal,
        params.clip_max_signal,
        params.clip_max_length,
    );
    let blocks = score_blocks(
        &clipped,
        &bins.signal,
        SCORE_BLOCKS_FRACTION,
        params.score_blocks_gap,
    );
    let block_bins = blocks.iter().flat_map(|b| b.clone()).collect_vec();

    let mut mlog10_p = 0f64;
    let mut mlog10_q = 0f64;
    let mut block_signal = 0f64;
    let mut block_control = 0f64;
    for &bin in &block_bins {
        // PHRED = -10 log10(p), computed in log space
        let phred = PHREDProb::from(LogProb(bins.ln_null[bin]));
        mlog10_p += *phred / 10.0;
        mlog10_q += -q_values[bin].max(MIN_Q).log10();
        block_signal += bins.signal[bin] as f64;
        if let Some(control) = &bins.scaled_control {
            block_control += control[bin];
        }
    }
    let n_blocks = block_bins.len().max(1) as f64;
    mlog10_p /= n_blocks;
    mlog10_q /= n_blocks;
    let background = if bins.scaled_control.is_some() {
        block_control / n_blocks
    } else {
        chrom_mean
    };
    let fold_change = (block_signal / n_blocks + 1.0) / (background + 1.0);
    let score = (10.0 * mlog10_q).round().min(1000.0) as u32;

    let bin_size = bins.bin_size as u64;
    let start = clipped.start as u64 * bin_size;
    let end = (clipped.end as u64 * bin_size).min(bins.chromosome.length);
    Peak {
        chromosome: bins.chromosome.name.clone(),
        start,
        end,
        name: format!("{}_{}", bins.chromosome.name, start),
        score,
        fold_change,
        mlog10_p,
        mlog10_q,
    }
}

/// Shrink the span from both ends, dropping the weaker flank first, while
/// the remaining signal stays at or above `clip_max_signal` of the
/// original and the length at or above `clip_max_length` of the original.
fn clip_span(
    span: &Range<usize>,
    signal: &[i32],
    clip_max_signal: f64,
    clip_max_length: f64,
) -> Range<usize> {
    let total = span
        .clone()
        .map(|i| signal[i] as f64)
        .sum::<f64>();
    let original_length = span.len() as f64;
    let mean_signal = total / original_length;
    let mut start = span.start;
    let mut end = span.end;
    let mut remaining = total;
    while end - start > 1 {
        let left = signal[start] as f64;
        let right = signal[end - 1] as f64;
        let trim = left.min(right);
        // only weak flanks are clipped
        if trim >= mean_signal {
            break;
        }
        if remaining - trim < clip_max_signal * total {
            break;
        }
        if ((end - start - 1) as f64) < clip_max_length * original_length {
            break;
        }
        if left <= right {
            start += 1;
        } else {
            end -= 1;
        }
        remaining -= trim;
    }
    start..end
}

/// The top `fraction` of the span's bins ranked by signal, grouped into
/// index blocks separated by at most `blocks_gap`. Selection walks the
/// kept bins in ascending order, so on overlap the earlier block wins.
fn score_blocks(
    span: &Range<usize>,
    signal: &[i32],
    fraction: f64,
    blocks_gap: usize,
) -> Vec<Range<usize>> {
    let n = span.len();
    if n == 0 {
        return Vec::new();
    }
    let keep = ((n as f64 * fraction).ceil() as usize).clamp(1, n);
    let mut ranked = span.clone().collect::<Vec<usize>>();
    ranked.sort_by(|&a, &b| {
        signal[b].cmp(&signal[a]).then(a.cmp(&b))
    });
    let mut kept = ranked[..keep].to_vec();
    kept.sort_unstable();

    let mut blocks: Vec<Range<usize>> = Vec::new();
    for bin in kept {
        match blocks.last_mut() {
            Some(block) if bin - block.end <= blocks_gap => {
                block.end = bin + 1;
            }
            _ => blocks.push(bin..bin + 1),
        }
    }
    blocks
}

#[cfg(test)]
mod peaks_tests {
    use approx::assert_relative_eq;

    use super::*;

    fn chromosome_bins(
        ln_null: Vec<f64>,
        signal: Vec<i32>,
    ) -> ChromosomeBins {
        let n = ln_null.len() as u64;
        ChromosomeBins {
            chromosome: Chromosome::new("chrT".to_owned(), n * 100),
            bin_size: 100,
            ln_null,
            signal,
            scaled_control: None,
        }
    }

    #[test]
    fn test_bh_qvalues_hand_example() {
        let ps = vec![0.01, 0.04, 0.03, 0.5];
        let qs = bh_qvalues(&ps);
        // sorted: 0.01, 0.03, 0.04, 0.5 -> adjusted 0.04, 0.053.., 0.053.., 0.5
        assert_relative_eq!(qs[0], 0.04, epsilon = 1e-12);
        assert_relative_eq!(qs[2], 0.04 * 4.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(qs[1], 0.04 * 4.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(qs[3], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_bh_qvalues_are_monotone_in_p() {
        let ps = vec![0.2, 0.001, 0.04, 0.9, 0.001];
        let qs = bh_qvalues(&ps);
        for (i, j) in (0..ps.len()).tuple_combinations() {
            if ps[i] <= ps[j] {
                assert!(qs[i] <= qs[j] + 1e-12);
            }
        }
    }

    #[test]
    fn test_single_enriched_block_becomes_one_peak() {
        let mut ln_null = vec![-0.01f64; 20];
        let mut signal = vec![1i32; 20];
        for i in 5..10 {
            ln_null[i] = -30.0;
            signal[i] = 40;
        }
        let bins = chromosome_bins(ln_null, signal);
        let params = PeakCallingParameters::new(0.05, -2.0, 0);
        let peaks =
            call_peaks(&[bins], &params, &CancellableState::new())
                .unwrap();
        assert_eq!(peaks.len(), 1);
        let peak = &peaks[0];
        assert_eq!(peak.start, 500);
        assert_eq!(peak.end, 1000);
        assert_eq!(peak.chromosome, "chrT");
        assert!(peak.score > 0);
        assert!(peak.fold_change > 1.0);
        assert!(peak.mlog10_q > 1.0);
    }

    #[test]
    fn test_gap_merges_neighbouring_blocks() {
        let mut ln_null = vec![-0.01f64; 30];
        let mut signal = vec![1i32; 30];
        for i in (5..9).chain(11..15) {
            ln_null[i] = -25.0;
            signal[i] = 30;
        }
        let bins = chromosome_bins(ln_null, signal);
        let merged = call_peaks(
            &[bins.clone()],
            &PeakCallingParameters::new(0.05, -2.0, 3),
            &CancellableState::new(),
        )
        .unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].start, 500);
        assert_eq!(merged[0].end, 1500);
        let split = call_peaks(
            &[bins],
            &PeakCallingParameters::new(0.05, -2.0, 0),
            &CancellableState::new(),
        )
        .unwrap();
        assert_eq!(split.len(), 2);
    }

    #[test]
    fn test_peaks_sorted_by_coordinates() {
        let mut ln_null = vec![-0.01f64; 40];
        let mut signal = vec![0i32; 40];
        for block in [25..28, 3..6, 14..16] {
            for i in block {
                ln_null[i] = -20.0;
                signal[i] = 25;
            }
        }
        let bins = chromosome_bins(ln_null, signal);
        let peaks = call_peaks(
            &[bins],
            &PeakCallingParameters::new(0.05, -2.0, 0),
            &CancellableState::new(),
        )
        .unwrap();
        assert_eq!(peaks.len(), 3);
        assert!(peaks.windows(2).all(|w| w[0].start < w[1].start));
    }

    #[test]
    fn test_clipping_trims_weak_flanks() {
        let span = 0..7;
        let signal = [1, 1, 10, 10, 10, 1, 1];
        let clipped = clip_span(&span, &signal, 0.9, 0.3);
        assert_eq!(clipped, 2..6);
        // fully permissive thresholds still stop at the strong center
        let kept = clip_span(&span, &signal, 0.0, 0.0);
        assert_eq!(kept, 2..5);
        // strict signal threshold forbids any clipping
        let untouched = clip_span(&span, &signal, 1.0, 0.3);
        assert_eq!(untouched, 0..7);
    }

    #[test]
    fn test_score_blocks_top_fraction() {
        let signal = [9, 1, 8, 1, 1, 7, 6, 1];
        let blocks = score_blocks(&(0..8), &signal, 0.5, 1);
        // top 4 bins are 0, 2, 5, 6; gap 1 bridges 0..3 but not 3..5
        assert_eq!(blocks, vec![0..3, 5..7]);
    }

    #[test]
    fn test_score_blocks_prefer_earlier_on_ties() {
        let signal = [5, 5, 0, 5, 5, 5];
        let blocks = score_blocks(&(0..6), &signal, 0.5, 0);
        // three of the tied bins are kept, earliest first
        assert_eq!(blocks, vec![0..2, 3..4]);
    }

    #[test]
    fn test_fold_change_scores_against_mixed_control() {
        let mut ln_null = vec![-0.01f64; 10];
        let mut signal = vec![1i32; 10];
        for i in 3..6 {
            ln_null[i] = -30.0;
            signal[i] = 20;
        }
        let mut bins = chromosome_bins(ln_null, signal);
        bins.scaled_control = Some(vec![4.0; 10]);
        let peaks = call_peaks(
            &[bins],
            &PeakCallingParameters::new(0.05, -2.0, 0),
            &CancellableState::new(),
        )
        .unwrap();
        assert_eq!(peaks.len(), 1);
        // blocks cover uniform enriched bins: (20 + 1) / (4 + 1)
        assert_relative_eq!(
            peaks[0].fold_change,
            21.0 / 5.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_empty_coverage_is_fatal() {
        let err = call_peaks(
            &[],
            &PeakCallingParameters::new(0.05, -2.0, 0),
            &CancellableState::new(),
        )
        .unwrap_err();
        assert!(matches!(err, SpanError::EmptyCoverage(_)));
    }

    #[test]
    fn test_cancellation_surfaces() {
        let bins = chromosome_bins(vec![-0.1; 5], vec![1; 5]);
        let cancel = CancellableState::new();
        cancel.cancel();
        let err = call_peaks(
            &[bins],
            &PeakCallingParameters::new(0.05, -2.0, 0),
            &cancel,
        )
        .unwrap_err();
        assert_eq!(err, SpanError::Cancelled);
    }

    #[test]
    fn test_bed_row_has_nine_fields() {
        let peak = Peak {
            chromosome: "chr1".to_owned(),
            start: 100,
            end: 500,
            name: "chr1_100".to_owned(),
            score: 250,
            fold_change: 4.2,
            mlog10_p: 12.5,
            mlog10_q: 10.1,
        };
        let row = peak.to_bed_row();
        let fields = row.split('\t').collect::<Vec<&str>>();
        assert_eq!(fields.len(), 9);
        assert_eq!(fields[0], "chr1");
        assert_eq!(fields[5], ".");
        assert_eq!(fields[4], "250");
    }

    #[test]
    fn test_write_bed() {
        let peaks = vec![
            Peak {
                chromosome: "chr1".to_owned(),
                start: 0,
                end: 200,
                name: "chr1_0".to_owned(),
                score: 10,
                fold_change: 1.5,
                mlog10_p: 3.0,
                mlog10_q: 2.0,
            },
            Peak {
                chromosome: "chr1".to_owned(),
                start: 400,
                end: 800,
                name: "chr1_400".to_owned(),
                score: 90,
                fold_change: 3.5,
                mlog10_p: 9.0,
                mlog10_q: 8.0,
            },
        ];
        let mut out = Vec::new();
        let rows = write_bed(&peaks, &mut out).unwrap();
        assert_eq!(rows, 2);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with("chr1\t0\t200\tchr1_0\t10\t.\t"));
    }

    #[test]
    fn test_last_bin_clamps_to_chromosome_end() {
        let mut bins = chromosome_bins(vec![-20.0; 5], vec![10; 5]);
        bins.chromosome = Chromosome::new("chrT".to_owned(), 450);
        let peaks = call_peaks(
            &[bins],
            &PeakCallingParameters::new(0.5, -2.0, 0),
            &CancellableState::new(),
        )
        .unwrap();
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].end, 450);
    }
}
