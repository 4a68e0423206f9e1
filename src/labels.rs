use derive_new::new;
use nom::IResult;
use rust_lapper::{Interval, Lapper};
use rustc_hash::FxHashMap;

use crate::errs::{SpanError, SpanResult};
use crate::parsing_utils::{consume_digit, consume_string};
use crate::peaks::Peak;

pub type Iv = Interval<u64, ()>;

/// Annotation categories of the semi-supervised tuner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelKind {
    Peaks,
    NoPeaks,
    PeakStart,
    PeakEnd,
}

pub const LABEL_KINDS: [LabelKind; 4] = [
    LabelKind::Peaks,
    LabelKind::NoPeaks,
    LabelKind::PeakStart,
    LabelKind::PeakEnd,
];

impl LabelKind {
    pub fn parse_str(raw: &str) -> SpanResult<Self> {
        match raw {
            "peaks" => Ok(Self::Peaks),
            "noPeaks" => Ok(Self::NoPeaks),
            "peakStart" => Ok(Self::PeakStart),
            "peakEnd" => Ok(Self::PeakEnd),
            _ => Err(SpanError::invalid_input(format!(
                "unknown label kind {raw}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Peaks => "peaks",
            Self::NoPeaks => "noPeaks",
            Self::PeakStart => "peakStart",
            Self::PeakEnd => "peakEnd",
        }
    }

    fn index(&self) -> usize {
        LABEL_KINDS
            .iter()
            .position(|k| k == self)
            .expect("kind listed")
    }
}

/// A labelled genomic interval, parsed from BED-like annotation rows
/// `chrom\tstart\tend\tkind`.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct LocationLabel {
    pub chromosome: String,
    pub start: u64,
    pub end: u64,
    pub kind: LabelKind,
}

impl LocationLabel {
    fn parse_bed_line(line: &str) -> IResult<&str, (String, u64, u64, String)> {
        let (rest, chrom) = consume_string(line)?;
        let (rest, start) = consume_digit(rest)?;
        let (rest, end) = consume_digit(rest)?;
        let (rest, kind) = consume_string(rest)?;
        Ok((rest, (chrom, start, end, kind)))
    }

    pub fn parse_str(line: &str) -> SpanResult<Self> {
        let (chrom, start, end, kind) = Self::parse_bed_line(line)
            .map(|(_, parsed)| parsed)
            .map_err(|e| {
                SpanError::invalid_input(format!(
                    "failed to parse label line {line}, {e}"
                ))
            })?;
        if end <= start {
            return Err(SpanError::invalid_input(format!(
                "label {line} has end <= start"
            )));
        }
        Ok(Self::new(chrom, start, end, LabelKind::parse_str(&kind)?))
    }

    pub fn parse_labels(contents: &str) -> SpanResult<Vec<LocationLabel>> {
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(Self::parse_str)
            .collect()
    }

    pub fn interval(&self) -> Iv {
        Iv { start: self.start, stop: self.end, val: () }
    }
}

/// Correct/total counts of one label category; `combine` is commutative
/// and associative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorRate {
    pub total: u32,
    pub correct: u32,
}

impl ErrorRate {
    pub fn observe(&mut self, correct: bool) {
        self.total += 1;
        if correct {
            self.correct += 1;
        }
    }

    pub fn combine(&self, other: &Self) -> Self {
        Self {
            total: self.total + other.total,
            correct: self.correct + other.correct,
        }
    }

    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0f64
        } else {
            1.0 - self.correct as f64 / self.total as f64
        }
    }
}

/// Error rates aggregated per label kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LabelErrors {
    by_kind: [ErrorRate; 4],
}

impl LabelErrors {
    pub fn observe(&mut self, kind: LabelKind, correct: bool) {
        self.by_kind[kind.index()].observe(correct);
    }

    pub fn rate(&self, kind: LabelKind) -> ErrorRate {
        self.by_kind[kind.index()]
    }

    pub fn combine(&self, other: &Self) -> Self {
        let mut by_kind = [ErrorRate::default(); 4];
        for (i, slot) in by_kind.iter_mut().enumerate() {
            *slot = self.by_kind[i].combine(&other.by_kind[i]);
        }
        Self { by_kind }
    }

    /// `1 - sum(correct) / sum(total)` over every kind.
    pub fn total_error(&self) -> f64 {
        let total: u32 = self.by_kind.iter().map(|r| r.total).sum();
        let correct: u32 = self.by_kind.iter().map(|r| r.correct).sum();
        if total == 0 {
            0f64
        } else {
            1.0 - correct as f64 / total as f64
        }
    }
}

/// Interval index over a called peak set, answering the per-kind label
/// checks.
pub struct PeakIndex {
    overlaps: FxHashMap<String, Lapper<u64, ()>>,
    starts: FxHashMap<String, Vec<u64>>,
    ends: FxHashMap<String, Vec<u64>>,
}

impl PeakIndex {
    pub fn new(peaks: &[Peak]) -> Self {
        let mut intervals: FxHashMap<String, Vec<Iv>> =
            FxHashMap::default();
        let mut starts: FxHashMap<String, Vec<u64>> = FxHashMap::default();
        let mut ends: FxHashMap<String, Vec<u64>> = FxHashMap::default();
        for peak in peaks {
            intervals
                .entry(peak.chromosome.clone())
                .or_default()
                .push(Iv { start: peak.start, stop: peak.end, val: () });
            starts
                .entry(peak.chromosome.clone())
                .or_default()
                .push(peak.start);
            ends.entry(peak.chromosome.clone()).or_default().push(peak.end);
        }
        for positions in starts.values_mut().chain(ends.values_mut()) {
            positions.sort_unstable();
        }
        let overlaps = intervals
            .into_iter()
            .map(|(chrom, ivs)| (chrom, Lapper::new(ivs)))
            .collect();
        Self { overlaps, starts, ends }
    }

    fn overlaps(&self, label: &LocationLabel) -> bool {
        self.overlaps
            .get(&label.chromosome)
            .map(|lapper| {
                lapper.find(label.start, label.end).next().is_some()
            })
            .unwrap_or(false)
    }

    fn boundary_count(
        positions: &FxHashMap<String, Vec<u64>>,
        label: &LocationLabel,
    ) -> usize {
        positions
            .get(&label.chromosome)
            .map(|sorted| {
                let lo = sorted.partition_point(|&p| p < label.start);
                let hi = sorted.partition_point(|&p| p < label.end);
                hi - lo
            })
            .unwrap_or(0)
    }

    /// Whether the peak set is consistent with the label.
    pub fn check(&self, label: &LocationLabel) -> bool {
        match label.kind {
            LabelKind::Peaks => self.overlaps(label),
            LabelKind::NoPeaks => !self.overlaps(label),
            LabelKind::PeakStart => {
                Self::boundary_count(&self.starts, label) == 1
            }
            LabelKind::PeakEnd => {
                Self::boundary_count(&self.ends, label) == 1
            }
        }
    }
}

/// Score a peak set against annotation labels.
pub fn label_errors(
    peaks: &[Peak],
    labels: &[LocationLabel],
) -> LabelErrors {
    let index = PeakIndex::new(peaks);
    let mut errors = LabelErrors::default();
    for label in labels {
        errors.observe(label.kind, index.check(label));
    }
    errors
}
