use std::ops::Range;

use crate::errs::{SpanError, SpanResult};

/// A candidate peak over bin indices: the covering span, the strict cores
/// inside it, and the non-relaxed gaps bridged during merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinSegment {
    pub span: Range<usize>,
    pub cores: Vec<Range<usize>>,
    pub gaps: Vec<Range<usize>>,
}

/// Build candidate peaks from the relaxed/strict bin assignments.
///
/// Contiguous runs of relaxed bins are candidate spans; maximal strict
/// runs inside a span are its cores and a span without a core is dropped;
/// surviving neighbours separated by at most `gap` non-relaxed bins merge,
/// recording the separation as a gap of the merged peak.
pub fn compute_bins_cores_and_peaks(
    relaxed: &[bool],
    strict: &[bool],
    gap: usize,
) -> SpanResult<Vec<BinSegment>> {
    if relaxed.len() != strict.len() {
        return Err(SpanError::DimensionMismatch(format!(
            "relaxed bitset has {} bins, strict has {}",
            relaxed.len(),
            strict.len()
        )));
    }
    if let Some(bin) =
        (0..strict.len()).find(|&i| strict[i] && !relaxed[i])
    {
        return Err(SpanError::invalid_input(format!(
            "strict bin {bin} outside the relaxed set"
        )));
    }

    let mut surviving: Vec<BinSegment> = Vec::new();
    for span in true_runs(relaxed) {
        let cores = true_runs(&strict[span.clone()])
            .into_iter()
            .map(|core| core.start + span.start..core.end + span.start)
            .collect::<Vec<Range<usize>>>();
        if cores.is_empty() {
            continue;
        }
        surviving.push(BinSegment { span, cores, gaps: Vec::new() });
    }

    let mut merged: Vec<BinSegment> = Vec::new();
    for segment in surviving {
        match merged.last_mut() {
            Some(previous)
                if segment.span.start - previous.span.end <= gap =>
            {
                previous
                    .gaps
                    .push(previous.span.end..segment.span.start);
                previous.span.end = segment.span.end;
                previous.cores.extend(segment.cores);
            }
            _ => merged.push(segment),
        }
    }
    Ok(merged)
}

/// Maximal runs of `true` values, in order.
fn true_runs(bits: &[bool]) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = None::<usize>;
    for (i, &bit) in bits.iter().enumerate() {
        match (bit, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push(s..i);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(s..bits.len());
    }
    runs
}
