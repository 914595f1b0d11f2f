// ==============================================================================
// frequency.rs - Variant Frequency Engine
// ==============================================================================
// Description: Observed and covered counts for a variant over a sample
//              selection
// Author: Matt Barham
// Created: 2025-12-09
// Modified: 2026-01-16
// Version: 1.1.0
// ==============================================================================

use crate::expressions::Expr;
use crate::normalize::NormalizedVariant;
use crate::store::{Store, StoreError, ZygosityCounts};

/// Frequency result for one variant under one selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frequency {
    /// Total observed support (number of individuals with the allele).
    pub observed: i64,
    /// Observed support split by zygosity.
    pub zygosity: ZygosityCounts,
    /// Coverage denominator: total pool size of selected samples covering
    /// the locus, or contributing unconditionally via an explicit clause.
    pub covered: i64,
}

impl Frequency {
    /// Observed over covered, undefined when nothing is covered. The
    /// ratio may exceed 1.0 for pooled samples without coverage profiles;
    /// it is reported as computed.
    pub fn frequency(&self) -> Option<f64> {
        if self.covered > 0 {
            Some(self.observed as f64 / self.covered as f64)
        } else {
            None
        }
    }
}

/// Frequency engine over the observation store. Each call issues one
/// bin-restricted observation query and one coverage query; the selection
/// predicate is folded into both, so selection and aggregation execute
/// server-side in a single round-trip each.
#[derive(Clone)]
pub struct FrequencyEngine {
    store: Store,
}

impl FrequencyEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Compute `(observed, covered)` for a normalized variant under a
    /// selection. `exclude_digest` ignores observations imported from a
    /// matching data source, so annotating an already-imported file does
    /// not count itself.
    pub async fn frequency(
        &self,
        variant: &NormalizedVariant,
        selection: &Expr,
        exclude_digest: Option<&str>,
    ) -> Result<Frequency, StoreError> {
        // A variant nobody has observed has no row; the query stays
        // read-only and the observed count is zero.
        let zygosity = match self.store.find_variant_id(variant).await? {
            Some(variant_id) => {
                self.store
                    .observation_counts(variant_id, selection, exclude_digest)
                    .await?
            }
            None => ZygosityCounts::default(),
        };

        let covered = self
            .store
            .covered_pool_size(&variant.chromosome, variant.begin, selection)
            .await?;

        Ok(Frequency {
            observed: zygosity.total(),
            zygosity,
            covered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frequency(observed: i64, covered: i64) -> Frequency {
        Frequency {
            observed,
            zygosity: ZygosityCounts {
                heterozygous: observed,
                homozygous: 0,
                unknown: 0,
            },
            covered,
        }
    }

    #[test]
    fn test_ratio() {
        assert_eq!(frequency(1, 1).frequency(), Some(1.0));
        let f = frequency(500, 1092).frequency().unwrap();
        assert!((f - 0.457875).abs() < 1e-6);
    }

    #[test]
    fn test_undefined_without_coverage() {
        assert_eq!(frequency(3, 0).frequency(), None);
    }

    #[test]
    fn test_pooled_overshoot_not_clamped() {
        // Pooled observations can exceed the covered denominator; the
        // ratio is reported as-is.
        assert_eq!(frequency(5, 2).frequency(), Some(2.5));
    }
}
