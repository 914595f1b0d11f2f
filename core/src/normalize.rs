// ==============================================================================
// normalize.rs - Variant Normalization
// ==============================================================================
// Description: Canonical variant identity: chromosome aliasing, common
//              prefix/suffix trimming, leftmost indel placement
// Author: Matt Barham
// Created: 2025-12-03
// Modified: 2026-01-08
// Version: 1.1.0
// ==============================================================================

use thiserror::Error;

use crate::genome::Genome;

/// Alias groups for chromosome names. The first entry of a group is the
/// preferred name when no reference genome is configured.
const CHROMOSOME_ALIASES: [&[&str]; 1] = [&[
    "M",
    "MT",
    "NC_012920.1",
    "NC_012920_1",
    "NC_012920",
    "chrM",
    "chrMT",
]];

/// Normalization errors
#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("Chromosome \"{0}\" not in reference genome")]
    UnknownChromosome(String),

    #[error("Position {position} does not exist on chromosome \"{chromosome}\" in reference genome")]
    PositionOutOfRange { chromosome: String, position: u64 },

    #[error("Sequence \"{claimed}\" does not match reference genome on \"{chromosome}\" at position {position}")]
    ReferenceMismatch {
        chromosome: String,
        position: u64,
        claimed: String,
    },

    #[error("Reference and observed alleles are identical")]
    NoVariant,

    #[error("Reference read failed: {0}")]
    Genome(#[from] crate::genome::GenomeError),
}

/// Classification of a normalized variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantClass {
    Snv,
    Insertion,
    Deletion,
    Mnv,
}

impl VariantClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariantClass::Snv => "snv",
            VariantClass::Insertion => "insertion",
            VariantClass::Deletion => "deletion",
            VariantClass::Mnv => "mnv",
        }
    }
}

/// A variant in canonical form. `begin` is the first affected reference
/// position; `end` is `begin + len(reference) - 1`, so a pure insertion
/// has `end == begin - 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedVariant {
    pub chromosome: String,
    pub begin: u64,
    pub end: u64,
    pub reference: String,
    pub observed: String,
}

impl NormalizedVariant {
    pub fn class(&self) -> VariantClass {
        match (self.reference.len(), self.observed.len()) {
            (0, _) => VariantClass::Insertion,
            (_, 0) => VariantClass::Deletion,
            (1, 1) => VariantClass::Snv,
            _ => VariantClass::Mnv,
        }
    }
}

/// Map a chromosome name onto the reference set, accepting `chr` prefix
/// variants and mitochondrial aliases.
pub fn normalize_chromosome(
    genome: Option<&Genome>,
    chromosome: &str,
) -> Result<String, NormalizeError> {
    let Some(genome) = genome else {
        for aliases in CHROMOSOME_ALIASES {
            if aliases.contains(&chromosome) {
                return Ok(aliases[0].to_string());
            }
        }
        if let Some(stripped) = chromosome.strip_prefix("chr") {
            return Ok(stripped.to_string());
        }
        return Ok(chromosome.to_string());
    };

    if genome.contains(chromosome) {
        return Ok(chromosome.to_string());
    }

    if let Some(stripped) = chromosome.strip_prefix("chr") {
        if genome.contains(stripped) {
            return Ok(stripped.to_string());
        }
    } else {
        let prefixed = format!("chr{}", chromosome);
        if genome.contains(&prefixed) {
            return Ok(prefixed);
        }
    }

    for aliases in CHROMOSOME_ALIASES {
        if aliases.contains(&chromosome) {
            for alias in aliases {
                if genome.contains(alias) {
                    return Ok(alias.to_string());
                }
            }
        }
    }

    Err(NormalizeError::UnknownChromosome(chromosome.to_string()))
}

/// Normalize a region: map the chromosome and validate the end coordinate
/// against the reference.
pub fn normalize_region(
    genome: Option<&Genome>,
    chromosome: &str,
    begin: u64,
    end: u64,
) -> Result<(String, u64, u64), NormalizeError> {
    let chromosome = normalize_chromosome(genome, chromosome)?;

    if let Some(genome) = genome {
        let length = genome.length(&chromosome)?;
        if end > length {
            return Err(NormalizeError::PositionOutOfRange {
                chromosome,
                position: end,
            });
        }
    }

    Ok((chromosome, begin, end))
}

/// Normalize a variant into its canonical representation.
///
/// The common suffix is trimmed before the common prefix: VCF convention
/// left-aligns indels but some tools pad context on the right, and the
/// padding must not survive into the identity. With a reference genome
/// configured, the claimed reference allele is verified and pure indels
/// are relocated to their leftmost cyclic permutation.
pub fn normalize_variant(
    genome: Option<&Genome>,
    chromosome: &str,
    position: u64,
    reference: &str,
    observed: &str,
) -> Result<NormalizedVariant, NormalizeError> {
    let mut reference = reference.to_uppercase();
    let mut observed = observed.to_uppercase();
    if reference == "." {
        reference = String::new();
    }
    if observed == "." {
        observed = String::new();
    }

    let chromosome = normalize_chromosome(genome, chromosome)?;

    if let Some(genome) = genome {
        let length = genome.length(&chromosome)?;
        if position > length {
            return Err(NormalizeError::PositionOutOfRange {
                chromosome,
                position,
            });
        }
        if !reference.is_empty() {
            let end = position + reference.len() as u64 - 1;
            if end > length {
                return Err(NormalizeError::PositionOutOfRange {
                    chromosome,
                    position: end,
                });
            }
            let actual = genome.bases(&chromosome, position, end)?;
            if actual != reference {
                return Err(NormalizeError::ReferenceMismatch {
                    chromosome,
                    position,
                    claimed: reference,
                });
            }
        }
    }

    let (prefix, trimmed_ref, trimmed_obs, _suffix) = trim_common(&reference, &observed);
    let mut position = position + prefix as u64;
    let mut reference = trimmed_ref.to_string();
    let mut observed = trimmed_obs.to_string();

    if reference.is_empty() && observed.is_empty() {
        return Err(NormalizeError::NoVariant);
    }

    // Pure indels can be moved left through cyclic permutations of the
    // inserted or deleted sequence.
    if let Some(genome) = genome {
        if reference.is_empty() {
            let (new_position, sequence) = move_left(genome, &chromosome, position, &observed)?;
            position = new_position;
            observed = sequence;
        } else if observed.is_empty() {
            let (new_position, sequence) = move_left(genome, &chromosome, position, &reference)?;
            position = new_position;
            reference = sequence;
        }
    }

    let end = if reference.is_empty() {
        position - 1
    } else {
        position + reference.len() as u64 - 1
    };

    Ok(NormalizedVariant {
        chromosome,
        begin: position,
        end,
        reference,
        observed,
    })
}

/// Trim the longest common suffix, then the longest common prefix, of two
/// sequences. Returns the prefix length, both trimmed sequences, and the
/// suffix length.
pub fn trim_common<'a>(s1: &'a str, s2: &'a str) -> (usize, &'a str, &'a str, usize) {
    let b1 = s1.as_bytes();
    let b2 = s2.as_bytes();

    let mut suffix = 0;
    while suffix < b1.len().min(b2.len()) && b1[b1.len() - 1 - suffix] == b2[b2.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let t1 = &b1[..b1.len() - suffix];
    let t2 = &b2[..b2.len() - suffix];

    let mut prefix = 0;
    while prefix < t1.len().min(t2.len()) && t1[prefix] == t2[prefix] {
        prefix += 1;
    }

    (
        prefix,
        &s1[prefix..b1.len() - suffix],
        &s2[prefix..b2.len() - suffix],
        suffix,
    )
}

/// Move `sequence`, positioned one-based at `position` on `chromosome`, as
/// far left as possible while staying within cyclic permutations of itself
/// against the reference context. Returns the new position and permuted
/// sequence.
fn move_left(
    genome: &Genome,
    chromosome: &str,
    position: u64,
    sequence: &str,
) -> Result<(u64, String), NormalizeError> {
    let seq = sequence.as_bytes();
    let len = seq.len() as u64;

    // Base at one-based reference position p, seen through the lens of the
    // sequence occupying positions position..position+len.
    let lookup = |p: u64| -> Result<u8, NormalizeError> {
        if p >= position && p < position + len {
            Ok(seq[(p - position) as usize])
        } else {
            let base = genome.bases(chromosome, p, p)?;
            Ok(base.as_bytes()[0])
        }
    };

    let mut shift: u64 = 0;
    while position - shift > 1 && lookup(position - shift - 1)? == lookup(position + len - shift - 1)?
    {
        shift += 1;
    }

    if shift == 0 {
        return Ok((position, sequence.to_string()));
    }

    // The shift can exceed the sequence length when the context repeats
    // with a shorter period than the sequence itself.
    let context_end = position.min(position - shift + len) - 1;
    let context = genome.bases(chromosome, position - shift, context_end)?;
    let keep = &sequence[..len.saturating_sub(shift) as usize];

    Ok((position - shift, format!("{}{}", context, keep)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn test_genome(content: &str) -> (TempDir, Genome) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ref.fa");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        let genome = Genome::open(&path).unwrap();
        (dir, genome)
    }

    #[test]
    fn test_trim_common() {
        assert_eq!(trim_common("TATATATA", "TATATA"), (0, "TA", "", 6));
        assert_eq!(trim_common("ACCCCC", "ACCCCCCCC"), (1, "", "CCC", 5));
        assert_eq!(trim_common("A", "G"), (0, "A", "G", 0));
        assert_eq!(trim_common("AT", "AG"), (1, "T", "G", 0));
        // Suffix first: the shared trailing A wins over the leading anchor.
        assert_eq!(trim_common("ACAAA", "A"), (0, "ACAA", "", 1));
    }

    #[test]
    fn test_chromosome_without_genome() {
        assert_eq!(normalize_chromosome(None, "chr20").unwrap(), "20");
        assert_eq!(normalize_chromosome(None, "20").unwrap(), "20");
        assert_eq!(normalize_chromosome(None, "chrMT").unwrap(), "M");
        assert_eq!(normalize_chromosome(None, "NC_012920.1").unwrap(), "M");
    }

    #[test]
    fn test_chromosome_with_genome() {
        let (_dir, genome) = test_genome(">chr20\nACGT\n");
        assert_eq!(
            normalize_chromosome(Some(&genome), "20").unwrap(),
            "chr20"
        );
        assert_eq!(
            normalize_chromosome(Some(&genome), "chr20").unwrap(),
            "chr20"
        );
        assert!(matches!(
            normalize_chromosome(Some(&genome), "chr21"),
            Err(NormalizeError::UnknownChromosome(_))
        ));
    }

    #[test]
    fn test_snv_passthrough() {
        let v = normalize_variant(None, "chr19", 100, "A", "G").unwrap();
        assert_eq!(
            v,
            NormalizedVariant {
                chromosome: "19".to_string(),
                begin: 100,
                end: 100,
                reference: "A".to_string(),
                observed: "G".to_string(),
            }
        );
        assert_eq!(v.class(), VariantClass::Snv);
    }

    #[test]
    fn test_deletion_of_repeat_unit() {
        // VCF-style deletion with a leading anchor base; the trailing A of
        // the run is trimmed as suffix, leaving a 4-base deletion.
        let v = normalize_variant(None, "19", 100, "ACAAA", "A").unwrap();
        assert_eq!(v.begin, 100);
        assert_eq!(v.end, 103);
        assert_eq!(v.reference, "ACAA");
        assert_eq!(v.observed, "");
        assert_eq!(v.class(), VariantClass::Deletion);
    }

    #[test]
    fn test_anchor_and_padded_forms_share_identity() {
        // The same 4-base deletion written left-anchored and with extra
        // right context must normalize to one identity.
        let (_dir, genome) = test_genome(">chr19\nGGGACAAAGT\n");
        let anchored = normalize_variant(Some(&genome), "chr19", 4, "ACAAA", "A").unwrap();
        let padded = normalize_variant(Some(&genome), "chr19", 4, "ACAAAG", "AG").unwrap();
        assert_eq!(anchored, padded);
        assert_eq!(anchored.class(), VariantClass::Deletion);
        assert_eq!(anchored.end, anchored.begin + 3);
    }

    #[test]
    fn test_insertion_end_before_begin() {
        let v = normalize_variant(None, "19", 100, "A", "AGG").unwrap();
        assert_eq!(v.begin, 101);
        assert_eq!(v.end, 100);
        assert_eq!(v.observed, "GG");
        assert_eq!(v.class(), VariantClass::Insertion);
    }

    #[test]
    fn test_reference_verification() {
        let (_dir, genome) = test_genome(">chr19\nAACCGGTT\n");
        assert!(normalize_variant(Some(&genome), "chr19", 3, "C", "T").is_ok());
        assert!(matches!(
            normalize_variant(Some(&genome), "chr19", 3, "G", "T"),
            Err(NormalizeError::ReferenceMismatch { .. })
        ));
        assert!(matches!(
            normalize_variant(Some(&genome), "chr19", 100, "A", "T"),
            Err(NormalizeError::PositionOutOfRange { .. })
        ));
    }

    #[test]
    fn test_left_and_right_aligned_deletions_converge() {
        // Deleting one CA from a CACACA run: every representation must
        // land on the leftmost placement.
        let (_dir, genome) = test_genome(">c\nTTCACACAGG\n");
        let left = normalize_variant(Some(&genome), "c", 2, "TCA", "T").unwrap();
        let right = normalize_variant(Some(&genome), "c", 6, "ACA", "A").unwrap();
        assert_eq!(left, right);
        assert_eq!(left.begin, 3);
        assert_eq!(left.reference, "CA");
    }

    #[test]
    fn test_insertion_moves_left() {
        let (_dir, genome) = test_genome(">c\nTTCACACAGG\n");
        // Inserting CA after position 8 inside the run.
        let v = normalize_variant(Some(&genome), "c", 8, "A", "ACA").unwrap();
        let w = normalize_variant(Some(&genome), "c", 2, "T", "TCA").unwrap();
        assert_eq!(v, w);
        assert_eq!(v.begin, 3);
        assert_eq!(v.end, 2);
    }

    #[test]
    fn test_idempotence() {
        let (_dir, genome) = test_genome(">c\nTTCACACAGG\n");
        let v = normalize_variant(Some(&genome), "c", 2, "TCA", "T").unwrap();
        let again = normalize_variant(
            Some(&genome),
            &v.chromosome,
            v.begin,
            &v.reference,
            &v.observed,
        )
        .unwrap();
        assert_eq!(v, again);
    }

    #[test]
    fn test_identical_alleles_rejected() {
        assert!(matches!(
            normalize_variant(None, "1", 10, "ACGT", "ACGT"),
            Err(NormalizeError::NoVariant)
        ));
    }
}
