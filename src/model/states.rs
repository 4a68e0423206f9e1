use serde::{Deserialize, Serialize};

/// Finite state spaces of the enrichment models. Each variant carries a
/// distinguished null subset; a bin is enriched iff its most likely state
/// is outside that subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateSet {
    /// {LOW, HIGH}
    Lh,
    /// {ZERO, LOW, HIGH}, the canonical peak-calling space
    Zlh,
    /// {LOW, MED, HIGH}
    Lmh,
    /// {ZERO, LOW, MED, HIGH}
    Zlmh,
    /// {ZERO, LOW, HIGH, INCREASED, DECREASED}, differential analysis
    Zlhid,
}

impl StateSet {
    pub fn n_states(&self) -> usize {
        self.names().len()
    }

    pub fn has_zero_state(&self) -> bool {
        matches!(self, Self::Zlh | Self::Zlmh | Self::Zlhid)
    }

    pub fn names(&self) -> &'static [&'static str] {
        match self {
            Self::Lh => &["L", "H"],
            Self::Zlh => &["Z", "L", "H"],
            Self::Lmh => &["L", "M", "H"],
            Self::Zlmh => &["Z", "L", "M", "H"],
            Self::Zlhid => &["Z", "L", "H", "I", "D"],
        }
    }

    /// Indices of the background states.
    pub fn null_states(&self) -> &'static [usize] {
        match self {
            Self::Lh => &[0],
            Self::Zlh => &[0, 1],
            Self::Lmh => &[0, 1],
            Self::Zlmh => &[0, 1, 2],
            Self::Zlhid => &[0, 1, 2],
        }
    }

    pub fn enriched_states(&self) -> Vec<usize> {
        (0..self.n_states())
            .filter(|s| !self.null_states().contains(s))
            .collect()
    }
}

#[cfg(test)]
mod states_tests {
    use super::*;

    #[test]
    fn test_null_and_enriched_partition() {
        for states in [
            StateSet::Lh,
            StateSet::Zlh,
            StateSet::Lmh,
            StateSet::Zlmh,
            StateSet::Zlhid,
        ] {
            let null = states.null_states();
            let enriched = states.enriched_states();
            assert_eq!(null.len() + enriched.len(), states.n_states());
            assert!(null.iter().all(|s| !enriched.contains(s)));
            assert!(!enriched.is_empty());
        }
    }

    #[test]
    fn test_canonical_null_subsets() {
        assert_eq!(StateSet::Zlh.null_states(), &[0, 1]);
        assert_eq!(StateSet::Zlmh.null_states(), &[0, 1, 2]);
        assert_eq!(StateSet::Zlhid.enriched_states(), vec![3, 4]);
    }

    #[test]
    fn test_zero_state_flags() {
        assert!(!StateSet::Lh.has_zero_state());
        assert!(StateSet::Zlh.has_zero_state());
        assert_eq!(StateSet::Zlhid.n_states(), 5);
    }
}
