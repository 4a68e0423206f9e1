use std::path::Path;
use std::sync::Arc;

use derive_new::new;
use indexmap::IndexMap;
use log::debug;
use rustc_hash::FxHashMap;

use crate::errs::{SpanError, SpanResult};
use crate::parsing_utils::{consume_digit, consume_string};

/// A named chromosome with a positive length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, new)]
pub struct Chromosome {
    pub name: String,
    pub length: u64,
}

/// Totally ordered list of chromosomes for a reference assembly. The order
/// is the manifest order and is preserved everywhere; lookups go through an
/// internal name index.
#[derive(Debug, Clone)]
pub struct Genome {
    build: String,
    chromosomes: Vec<Chromosome>,
    by_name: FxHashMap<String, usize>,
}

impl Genome {
    pub fn new(
        build: &str,
        chrom_sizes: IndexMap<String, u64>,
    ) -> SpanResult<Self> {
        if chrom_sizes.is_empty() {
            return Err(SpanError::invalid_input(format!(
                "no chromosomes provided for genome {build}"
            )));
        }
        let mut chromosomes = Vec::with_capacity(chrom_sizes.len());
        let mut by_name = FxHashMap::default();
        for (name, length) in chrom_sizes {
            if length == 0 {
                return Err(SpanError::invalid_input(format!(
                    "chromosome {name} has zero length"
                )));
            }
            by_name.insert(name.clone(), chromosomes.len());
            chromosomes.push(Chromosome::new(name, length));
        }
        Ok(Self {
            build: build.to_owned(),
            chromosomes,
            by_name,
        })
    }

    /// Parse a `name\tlength` chromosome-size manifest.
    pub fn from_chrom_sizes<P: AsRef<Path>>(
        build: &str,
        path: P,
    ) -> SpanResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SpanError::invalid_input(format!(
                "failed to read chrom sizes {:?}, {e}",
                path.as_ref()
            ))
        })?;
        let mut chrom_sizes = IndexMap::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let (name, length) = parse_chrom_sizes_line(line)?;
            chrom_sizes.insert(name, length);
        }
        Self::new(build, chrom_sizes)
    }

    pub fn build(&self) -> &str {
        &self.build
    }

    pub fn chromosomes(&self) -> &[Chromosome] {
        &self.chromosomes
    }

    pub fn chromosome(&self, name: &str) -> Option<&Chromosome> {
        self.by_name.get(name).map(|&i| &self.chromosomes[i])
    }

    pub fn chrom_sizes(&self) -> IndexMap<String, u64> {
        self.chromosomes
            .iter()
            .map(|c| (c.name.clone(), c.length))
            .collect()
    }
}

/// Restriction of a [`Genome`] to a subset of chromosomes; the unit of
/// coverage addressing.
#[derive(Debug, Clone)]
pub struct GenomeQuery {
    genome: Arc<Genome>,
    restriction: Option<Vec<String>>,
}

impl GenomeQuery {
    pub fn whole(genome: Arc<Genome>) -> Self {
        Self { genome, restriction: None }
    }

    pub fn restricted(
        genome: Arc<Genome>,
        chromosomes: &[String],
    ) -> SpanResult<Self> {
        for name in chromosomes {
            if genome.chromosome(name).is_none() {
                return Err(SpanError::invalid_input(format!(
                    "chromosome {name} not present in genome {}",
                    genome.build()
                )));
            }
        }
        Ok(Self {
            genome,
            restriction: Some(chromosomes.to_vec()),
        })
    }

    pub fn genome(&self) -> &Arc<Genome> {
        &self.genome
    }

    /// Chromosomes in genome order, honoring the restriction.
    pub fn chromosomes(&self) -> Vec<&Chromosome> {
        match &self.restriction {
            None => self.genome.chromosomes().iter().collect(),
            Some(names) => self
                .genome
                .chromosomes()
                .iter()
                .filter(|c| names.iter().any(|n| n == &c.name))
                .collect(),
        }
    }

    /// Further restrict to the named chromosomes, keeping genome order.
    pub fn restrict_to(&self, names: &[String]) -> GenomeQuery {
        let kept = self
            .chromosomes()
            .into_iter()
            .filter(|c| names.iter().any(|n| n == &c.name))
            .map(|c| c.name.clone())
            .collect::<Vec<String>>();
        GenomeQuery {
            genome: Arc::clone(&self.genome),
            restriction: Some(kept),
        }
    }
}

fn parse(l: &str) -> nom::IResult<&str, (String, u64)> {
    let (rest, name) = consume_string(l)?;
    let (rest, length) = consume_digit(rest)?;
    Ok((rest, (name, length)))
}

fn parse_chrom_sizes_line(line: &str) -> SpanResult<(String, u64)> {
    parse(line).map(|(_, parsed)| parsed).map_err(|e| {
        SpanError::invalid_input(format!(
            "failed to parse chrom sizes line {line}, {e}"
        ))
    })
}

/// A single bin of the grid, `[start, end)` on its chromosome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bin {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

/// Number of bins for a chromosome of length `length` at `bin_size`,
/// `ceil(length / bin_size)`.
pub fn bin_count(length: u64, bin_size: u32) -> usize {
    ((length + bin_size as u64 - 1) / bin_size as u64) as usize
}

/// Finite restartable iterator over the bin grid of a chromosome.
#[derive(Debug, Clone)]
pub struct BinIter {
    length: u64,
    bin_size: u32,
    next: usize,
}

impl BinIter {
    pub fn new(length: u64, bin_size: u32) -> Self {
        Self { length, bin_size, next: 0 }
    }
}

impl Iterator for BinIter {
    type Item = Bin;

    fn next(&mut self) -> Option<Bin> {
        if self.next >= bin_count(self.length, self.bin_size) {
            return None;
        }
        let index = self.next;
        self.next += 1;
        let start = index as u64 * self.bin_size as u64;
        let end = (start + self.bin_size as u64).min(self.length);
        Some(Bin { index, start, end })
    }
}

impl Chromosome {
    pub fn bins(&self, bin_size: u32) -> BinIter {
        BinIter::new(self.length, bin_size)
    }

    pub fn bin_count(&self, bin_size: u32) -> usize {
        bin_count(self.length, bin_size)
    }
}

/// Drop chromosomes the caller found empty, logging each; error when the
/// remaining genome is empty.
pub(crate) fn without_empty_chromosomes(
    query: &GenomeQuery,
    empty: &[String],
) -> SpanResult<GenomeQuery> {
    let kept = query
        .chromosomes()
        .into_iter()
        .filter(|c| !empty.iter().any(|n| n == &c.name))
        .map(|c| c.name.clone())
        .collect::<Vec<String>>();
    for name in empty {
        debug!("excluding chromosome {name} with no coverage");
    }
    if kept.is_empty() {
        return Err(SpanError::empty_coverage(
            "no chromosomes with non-zero coverage".to_owned(),
        ));
    }
    Ok(query.restrict_to(&kept))
}

#[cfg(test)]
mod genome_tests {
    use indexmap::indexmap;

    use super::*;

    fn test_genome() -> Arc<Genome> {
        Arc::new(
            Genome::new(
                "hg_test",
                indexmap! {
                    "chr1".to_owned() => 1000u64,
                    "chr2".to_owned() => 950u64,
                },
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_bin_count_is_ceil() {
        for (length, bin_size, expected) in
            [(1000u64, 100u32, 10usize), (1001, 100, 11), (99, 100, 1), (1, 1, 1)]
        {
            assert_eq!(bin_count(length, bin_size), expected);
        }
    }

    #[test]
    fn test_bin_spans_cover_chromosome() {
        let chrom = Chromosome::new("chr2".to_owned(), 950);
        let bins = chrom.bins(100).collect::<Vec<Bin>>();
        assert_eq!(bins.len(), 10);
        assert_eq!(bins[9], Bin { index: 9, start: 900, end: 950 });
        let covered: u64 = bins.iter().map(|b| b.end - b.start).sum();
        assert_eq!(covered, 950);
    }

    #[test]
    fn test_genome_rejects_zero_length() {
        let result = Genome::new(
            "bad",
            indexmap! { "chrBad".to_owned() => 0u64 },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_query_restriction_keeps_genome_order() {
        let genome = test_genome();
        let query = GenomeQuery::restricted(
            Arc::clone(&genome),
            &["chr2".to_owned(), "chr1".to_owned()],
        )
        .unwrap();
        let names = query
            .chromosomes()
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<&str>>();
        assert_eq!(names, vec!["chr1", "chr2"]);
    }

    #[test]
    fn test_unknown_restriction_is_rejected() {
        let genome = test_genome();
        assert!(
            GenomeQuery::restricted(genome, &["chrMissing".to_owned()]).is_err()
        );
    }

    #[test]
    fn test_parse_chrom_sizes_line() {
        let (name, length) = parse_chrom_sizes_line("chr1\t248956422").unwrap();
        assert_eq!(name, "chr1");
        assert_eq!(length, 248956422);
        assert!(parse_chrom_sizes_line("chr1\tnope").is_err());
    }
}
