// ==============================================================================
// parsers/vcf.rs - VCF Observation Parser
// ==============================================================================
// Description: Streaming parser for VCF 4.1 variant call files with exact
//              uncompressed byte accounting for checkpoint/resume
// Author: Matt Barham
// Created: 2025-12-06
// Modified: 2026-01-18
// Version: 1.2.0
// ==============================================================================
// References:
// - VCF 4.1 Spec: https://samtools.github.io/hts-specs/VCFv4.1.pdf
// ==============================================================================

use std::io::BufRead;

use thiserror::Error;

use crate::models::Zygosity;

/// VCF parsing errors
#[derive(Error, Debug)]
pub enum VcfParseError {
    #[error("Failed to read VCF header: {0}")]
    Header(String),

    #[error("Line {line}: {message}")]
    Record { line: u64, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VcfParseError {
    /// True for per-record errors the caller may count and skip past.
    pub fn is_record_error(&self) -> bool {
        matches!(self, VcfParseError::Record { .. })
    }
}

/// Parser options, set per variation import.
#[derive(Debug, Clone, Copy)]
pub struct VcfOptions {
    /// Skip records with a non-pass FILTER column.
    pub skip_filtered: bool,
    /// Derive genotypes from PL/GL likelihoods instead of GT.
    pub prefer_likelihoods: bool,
    /// In likelihood mode, drop calls whose GQ is below this value.
    pub min_genotype_quality: Option<u32>,
}

impl Default for VcfOptions {
    fn default() -> Self {
        Self {
            skip_filtered: true,
            prefer_likelihoods: false,
            min_genotype_quality: None,
        }
    }
}

/// One allele observation extracted from a record, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObservation {
    pub chromosome: String,
    pub position: u64,
    pub reference: String,
    pub observed: String,
    pub zygosity: Zygosity,
    /// Number of individuals contributing this observation.
    pub support: u32,
}

/// Observations from one VCF data line.
#[derive(Debug, Clone)]
pub struct VcfRecord {
    /// Uncompressed byte offset of the start of the line.
    pub offset: u64,
    pub observations: Vec<RawObservation>,
}

/// Per-allele support counters keyed by zygosity.
#[derive(Debug, Clone, Copy, Default)]
struct AlleleSupport {
    heterozygous: u32,
    homozygous: u32,
    unknown: u32,
}

impl AlleleSupport {
    fn add(&mut self, zygosity: Zygosity, count: u32) {
        match zygosity {
            Zygosity::Heterozygous => self.heterozygous += count,
            Zygosity::Homozygous => self.homozygous += count,
            Zygosity::Unknown => self.unknown += count,
        }
    }
}

/// Streaming VCF reader. All sample columns are flattened into the single
/// target sample (pooling). Byte positions refer to the uncompressed
/// stream and always land on line boundaries, which makes them usable as
/// resume offsets.
pub struct VcfReader<R: BufRead> {
    reader: R,
    options: VcfOptions,
    bytes_consumed: u64,
    line_number: u64,
    sample_count: usize,
    line: String,
}

impl<R: BufRead> VcfReader<R> {
    /// Create a reader and consume the header block.
    pub fn new(reader: R, options: VcfOptions) -> Result<Self, VcfParseError> {
        let mut parser = Self {
            reader,
            options,
            bytes_consumed: 0,
            line_number: 0,
            sample_count: 0,
            line: String::new(),
        };
        parser.read_header()?;
        Ok(parser)
    }

    /// Uncompressed bytes consumed so far. After a successful
    /// `next_record` this is the offset of the next unread line.
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    /// Number of sample columns declared in the header.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Fast-forward to a byte offset previously reported by
    /// `bytes_consumed`. Used to resume an interrupted import.
    pub fn skip_to(&mut self, offset: u64) -> Result<(), VcfParseError> {
        while self.bytes_consumed < offset {
            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                return Err(VcfParseError::Header(format!(
                    "Stream ended before resume offset {}",
                    offset
                )));
            }
            let take = available
                .len()
                .min((offset - self.bytes_consumed) as usize);
            // Line numbers are approximate after a skip; offsets stay exact.
            self.line_number += available[..take].iter().filter(|&&b| b == b'\n').count() as u64;
            self.reader.consume(take);
            self.bytes_consumed += take as u64;
        }
        Ok(())
    }

    fn read_header(&mut self) -> Result<(), VcfParseError> {
        loop {
            if self.read_line()? == 0 {
                return Err(VcfParseError::Header(
                    "Missing #CHROM header line".to_string(),
                ));
            }
            let line = self.line.trim_end();
            if line.starts_with("##") {
                continue;
            }
            if let Some(rest) = line.strip_prefix("#CHROM") {
                // #CHROM POS ID REF ALT QUAL FILTER INFO [FORMAT samples..]
                let columns: Vec<&str> = rest.split('\t').filter(|c| !c.is_empty()).collect();
                self.sample_count = columns.len().saturating_sub(8);
                return Ok(());
            }
            return Err(VcfParseError::Header(format!(
                "Unexpected line before #CHROM header: {}",
                line
            )));
        }
    }

    fn read_line(&mut self) -> Result<usize, VcfParseError> {
        self.line.clear();
        let n = self.reader.read_line(&mut self.line)?;
        self.bytes_consumed += n as u64;
        if n > 0 {
            self.line_number += 1;
        }
        Ok(n)
    }

    /// Next record with at least one observation. Records skipped by
    /// filter status, structural-variant markers, or missing alternates
    /// are consumed silently. A malformed line surfaces as a
    /// `Record` error after the line has been consumed, so the caller can
    /// count it and continue.
    pub fn next_record(&mut self) -> Result<Option<VcfRecord>, VcfParseError> {
        loop {
            let offset = self.bytes_consumed;
            if self.read_line()? == 0 {
                return Ok(None);
            }
            let line = self.line.trim_end().to_string();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let observations = self.parse_data_line(&line)?;
            if observations.is_empty() {
                continue;
            }
            return Ok(Some(VcfRecord {
                offset,
                observations,
            }));
        }
    }

    fn record_error(&self, message: impl Into<String>) -> VcfParseError {
        VcfParseError::Record {
            line: self.line_number,
            message: message.into(),
        }
    }

    fn parse_data_line(&self, line: &str) -> Result<Vec<RawObservation>, VcfParseError> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            return Err(self.record_error(format!(
                "Expected at least 8 tab-separated columns, got {}",
                fields.len()
            )));
        }

        let chromosome = fields[0];
        let position: u64 = fields[1]
            .parse()
            .map_err(|_| self.record_error(format!("Invalid position: {}", fields[1])))?;
        let reference = fields[3];
        let filter = fields[6];
        let info = fields[7];

        if self.options.skip_filtered && !matches!(filter, "." | "PASS" | "") {
            return Ok(Vec::new());
        }

        // Structural variants are ignored; their reference alleles do not
        // fit the variant model.
        if info
            .split(';')
            .any(|entry| entry == "SV" || entry.starts_with("SV="))
        {
            return Ok(Vec::new());
        }

        let alternates: Vec<&str> = fields[4]
            .split(',')
            .filter(|a| !a.is_empty() && *a != ".")
            .collect();
        if alternates.is_empty() {
            return Ok(Vec::new());
        }

        let mut support = vec![AlleleSupport::default(); alternates.len()];
        let samples = &fields[9.min(fields.len())..];
        let format_keys: Vec<&str> = if fields.len() > 8 {
            fields[8].split(':').collect()
        } else {
            Vec::new()
        };
        let has_genotype_keys = format_keys
            .iter()
            .any(|k| matches!(*k, "GT" | "GL" | "PL"));

        if !samples.is_empty() && has_genotype_keys {
            for call in samples {
                let genotype =
                    self.read_genotype(&format_keys, call, alternates.len())?;
                let Some(genotype) = genotype else {
                    continue;
                };
                let mut distinct = genotype.clone();
                distinct.sort_unstable();
                distinct.dedup();
                let zygosity = if distinct.len() > 1 {
                    Zygosity::Heterozygous
                } else {
                    Zygosity::Homozygous
                };
                for allele in distinct {
                    if allele > 0 {
                        support[allele as usize - 1].add(zygosity, 1);
                    }
                }
            }
        } else if let Some(counts) = info_genotype_counts(info) {
            // GTC holds one count per possible genotype, diploid, in
            // likelihood ordering.
            let genotypes = genotype_combinations(alternates.len() + 1, 2);
            for (genotype, count) in genotypes.iter().zip(counts) {
                if count < 1 {
                    continue;
                }
                let mut distinct = genotype.clone();
                distinct.sort_unstable();
                distinct.dedup();
                let zygosity = if distinct.len() > 1 {
                    Zygosity::Heterozygous
                } else {
                    Zygosity::Homozygous
                };
                for allele in distinct {
                    if allele > 0 {
                        support[allele as usize - 1].add(zygosity, count as u32);
                    }
                }
            }
        } else if alternates.len() == 1 {
            // No genotype information at all. Count individuals with an
            // unknown zygosity, but only when the allele is unambiguous.
            support[0].add(Zygosity::Unknown, self.sample_count.max(1) as u32);
        }

        let mut observations = Vec::new();
        for (index, alternate) in alternates.iter().enumerate() {
            let counters = [
                (Zygosity::Heterozygous, support[index].heterozygous),
                (Zygosity::Homozygous, support[index].homozygous),
                (Zygosity::Unknown, support[index].unknown),
            ];
            for (zygosity, count) in counters {
                if count > 0 {
                    observations.push(RawObservation {
                        chromosome: chromosome.to_string(),
                        position,
                        reference: reference.to_string(),
                        observed: alternate.to_string(),
                        zygosity,
                        support: count,
                    });
                }
            }
        }

        Ok(observations)
    }

    /// Genotype for one call as allele indices, or None when the call
    /// contributes nothing (uncalled, or dropped by the quality gate).
    fn read_genotype(
        &self,
        format_keys: &[&str],
        call: &str,
        alternate_count: usize,
    ) -> Result<Option<Vec<u8>>, VcfParseError> {
        let values: Vec<&str> = call.split(':').collect();
        let field = |key: &str| -> Option<&str> {
            format_keys
                .iter()
                .position(|k| *k == key)
                .and_then(|i| values.get(i).copied())
                .filter(|v| !v.is_empty() && *v != ".")
        };

        let gt = field("GT");

        if self.options.prefer_likelihoods || gt.is_none() {
            let likelihood = field("PL").map(|v| (v, true)).or_else(|| {
                field("GL").map(|v| (v, false))
            });
            if let Some((raw, is_pl)) = likelihood {
                if let Some(min_quality) = self.options.min_genotype_quality {
                    if let Some(gq) = field("GQ").and_then(|v| v.parse::<f64>().ok()) {
                        if (gq as u32) < min_quality {
                            return Ok(None);
                        }
                    }
                }

                let ploidy = gt
                    .map(|g| g.split(['/', '|']).count())
                    .filter(|&p| p > 0)
                    .unwrap_or(2);
                let genotypes = genotype_combinations(alternate_count + 1, ploidy);

                let scores: Vec<f64> = raw
                    .split(',')
                    .map(|v| v.parse::<f64>())
                    .collect::<Result<_, _>>()
                    .map_err(|_| {
                        self.record_error(format!("Invalid likelihood values: {}", raw))
                    })?;
                if scores.len() != genotypes.len() {
                    // Ploidy and likelihood count disagree; treat the
                    // call as uncalled rather than guessing.
                    return Ok(None);
                }

                // PL is phred-scaled (lower is better), GL is log-scaled
                // (higher is better). Ties resolve to the earlier genotype.
                let mut best = 0usize;
                for (i, score) in scores.iter().enumerate() {
                    let better = if is_pl {
                        *score < scores[best]
                    } else {
                        *score > scores[best]
                    };
                    if better {
                        best = i;
                    }
                }
                return Ok(Some(genotypes[best].clone()));
            }
        }

        let Some(gt) = gt else {
            return Ok(None);
        };

        let mut alleles = Vec::new();
        for part in gt.split(['/', '|']) {
            if part == "." {
                return Ok(None);
            }
            let allele: u8 = part
                .parse()
                .map_err(|_| self.record_error(format!("Invalid genotype: {}", gt)))?;
            if allele as usize > alternate_count {
                return Err(
                    self.record_error(format!("Genotype allele out of range: {}", gt))
                );
            }
            alleles.push(allele);
        }
        Ok(Some(alleles))
    }
}

/// GTC counts from an INFO column, if present.
fn info_genotype_counts(info: &str) -> Option<Vec<u64>> {
    for entry in info.split(';') {
        if let Some(raw) = entry.strip_prefix("GTC=") {
            let counts: Result<Vec<u64>, _> = raw.split(',').map(|v| v.parse()).collect();
            return counts.ok();
        }
    }
    None
}

/// All genotypes over `allele_count` alleles at the given ploidy, in VCF
/// likelihood ordering. Diploid with two alternates:
/// (0,0) (0,1) (1,1) (0,2) (1,2) (2,2).
fn genotype_combinations(allele_count: usize, ploidy: usize) -> Vec<Vec<u8>> {
    fn extend(current: &mut Vec<u8>, start: u8, remaining: usize, limit: u8, out: &mut Vec<Vec<u8>>) {
        if remaining == 0 {
            out.push(current.clone());
            return;
        }
        for allele in start..limit {
            current.push(allele);
            extend(current, allele, remaining - 1, limit, out);
            current.pop();
        }
    }

    let mut combinations = Vec::new();
    extend(
        &mut Vec::new(),
        0,
        ploidy,
        allele_count as u8,
        &mut combinations,
    );
    combinations.sort_by(|a, b| {
        a.iter().rev().cmp(b.iter().rev())
    });
    combinations
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const HEADER: &str = "##fileformat=VCFv4.1\n##source=test\n";

    fn reader(body: &str, options: VcfOptions) -> VcfReader<Cursor<String>> {
        let text = format!("{}{}", HEADER, body);
        VcfReader::new(Cursor::new(text), options).unwrap()
    }

    fn collect(reader: &mut VcfReader<Cursor<String>>) -> Vec<RawObservation> {
        let mut all = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            all.extend(record.observations);
        }
        all
    }

    #[test]
    fn test_genotype_combinations_order() {
        assert_eq!(
            genotype_combinations(3, 2),
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![1, 1],
                vec![0, 2],
                vec![1, 2],
                vec![2, 2],
            ]
        );
        assert_eq!(genotype_combinations(2, 1), vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_single_sample_het() {
        let mut r = reader(
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\n\
             chr19\t100\t.\tA\tG\t50\tPASS\tDP=20\tGT\t0/1\n",
            VcfOptions::default(),
        );
        assert_eq!(r.sample_count(), 1);
        let obs = collect(&mut r);
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].chromosome, "chr19");
        assert_eq!(obs[0].position, 100);
        assert_eq!(obs[0].reference, "A");
        assert_eq!(obs[0].observed, "G");
        assert_eq!(obs[0].zygosity, Zygosity::Heterozygous);
        assert_eq!(obs[0].support, 1);
    }

    #[test]
    fn test_multi_sample_pooling() {
        let mut r = reader(
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\tS3\n\
             1\t200\t.\tC\tT\t.\t.\t.\tGT\t0/1\t1/1\t0/0\n",
            VcfOptions::default(),
        );
        let obs = collect(&mut r);
        // One het and one hom observation; the 0/0 call contributes nothing.
        assert_eq!(obs.len(), 2);
        let het = obs
            .iter()
            .find(|o| o.zygosity == Zygosity::Heterozygous)
            .unwrap();
        let hom = obs
            .iter()
            .find(|o| o.zygosity == Zygosity::Homozygous)
            .unwrap();
        assert_eq!(het.support, 1);
        assert_eq!(hom.support, 1);
    }

    #[test]
    fn test_multi_allele_split() {
        let mut r = reader(
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\n\
             1\t300\t.\tA\tG,T\t.\t.\t.\tGT\t1/2\t0/2\n",
            VcfOptions::default(),
        );
        let obs = collect(&mut r);
        // 1/2 is heterozygous for both alternates; 0/2 for the second only.
        let g: Vec<_> = obs.iter().filter(|o| o.observed == "G").collect();
        let t: Vec<_> = obs.iter().filter(|o| o.observed == "T").collect();
        assert_eq!(g.len(), 1);
        assert_eq!(g[0].support, 1);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].support, 2);
        assert_eq!(t[0].zygosity, Zygosity::Heterozygous);
    }

    #[test]
    fn test_uncalled_genotype_skipped() {
        let mut r = reader(
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\n\
             1\t400\t.\tA\tG\t.\t.\t.\tGT\t./.\t1|1\n",
            VcfOptions::default(),
        );
        let obs = collect(&mut r);
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].zygosity, Zygosity::Homozygous);
        assert_eq!(obs[0].support, 1);
    }

    #[test]
    fn test_filtered_record_skipped() {
        let mut r = reader(
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\n\
             1\t100\t.\tA\tG\t.\tq10\t.\tGT\t0/1\n\
             1\t200\t.\tC\tT\t.\tPASS\t.\tGT\t0/1\n",
            VcfOptions::default(),
        );
        let obs = collect(&mut r);
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].position, 200);

        let mut keep = reader(
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\n\
             1\t100\t.\tA\tG\t.\tq10\t.\tGT\t0/1\n",
            VcfOptions {
                skip_filtered: false,
                ..VcfOptions::default()
            },
        );
        assert_eq!(collect(&mut keep).len(), 1);
    }

    #[test]
    fn test_structural_variant_skipped() {
        let mut r = reader(
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\n\
             1\t100\t.\tA\t<DEL>\t.\tPASS\tSV;END=5000\tGT\t0/1\n",
            VcfOptions::default(),
        );
        assert!(collect(&mut r).is_empty());
    }

    #[test]
    fn test_likelihood_mode_picks_best_genotype() {
        // PL favours 1/1 over the called 0/1.
        let mut r = reader(
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\n\
             1\t100\t.\tA\tG\t.\tPASS\t.\tGT:PL\t0/1:60,30,0\n",
            VcfOptions {
                prefer_likelihoods: true,
                ..VcfOptions::default()
            },
        );
        let obs = collect(&mut r);
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].zygosity, Zygosity::Homozygous);
    }

    #[test]
    fn test_likelihood_mode_quality_gate() {
        let body = "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\n\
                    1\t100\t.\tA\tG\t.\tPASS\t.\tGT:PL:GQ\t0/1:60,0,30:7\n";
        let mut gated = reader(
            body,
            VcfOptions {
                prefer_likelihoods: true,
                min_genotype_quality: Some(20),
                ..VcfOptions::default()
            },
        );
        assert!(collect(&mut gated).is_empty());

        let mut open = reader(
            body,
            VcfOptions {
                prefer_likelihoods: true,
                min_genotype_quality: Some(5),
                ..VcfOptions::default()
            },
        );
        assert_eq!(collect(&mut open).len(), 1);
    }

    #[test]
    fn test_gtc_counts() {
        let mut r = reader(
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n\
             1\t100\t.\tA\tG\t.\tPASS\tGTC=10,5,2\n",
            VcfOptions::default(),
        );
        let obs = collect(&mut r);
        // 5 heterozygous, 2 homozygous carriers of the alternate.
        assert_eq!(obs.len(), 2);
        let het = obs
            .iter()
            .find(|o| o.zygosity == Zygosity::Heterozygous)
            .unwrap();
        let hom = obs
            .iter()
            .find(|o| o.zygosity == Zygosity::Homozygous)
            .unwrap();
        assert_eq!(het.support, 5);
        assert_eq!(hom.support, 2);
    }

    #[test]
    fn test_no_genotypes_single_alt_counts_samples() {
        let mut r = reader(
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\tS3\n\
             1\t100\t.\tA\tG\t.\tPASS\tDP=9\tDP\t9\t9\t9\n",
            VcfOptions::default(),
        );
        let obs = collect(&mut r);
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].zygosity, Zygosity::Unknown);
        assert_eq!(obs[0].support, 3);
    }

    #[test]
    fn test_malformed_line_is_recoverable() {
        let text = format!(
            "{}#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\n\
             1\tnotanumber\t.\tA\tG\t.\tPASS\t.\tGT\t0/1\n\
             1\t200\t.\tC\tT\t.\tPASS\t.\tGT\t0/1\n",
            HEADER
        );
        let mut r = VcfReader::new(Cursor::new(text), VcfOptions::default()).unwrap();

        let err = r.next_record().unwrap_err();
        assert!(err.is_record_error());

        // The bad line was consumed; the next record parses.
        let record = r.next_record().unwrap().unwrap();
        assert_eq!(record.observations[0].position, 200);
        assert!(r.next_record().unwrap().is_none());
    }

    #[test]
    fn test_byte_accounting_and_resume() {
        let body = "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\n\
                    1\t100\t.\tA\tG\t.\tPASS\t.\tGT\t0/1\n\
                    1\t200\t.\tC\tT\t.\tPASS\t.\tGT\t1/1\n\
                    1\t300\t.\tG\tA\t.\tPASS\t.\tGT\t0/1\n";

        let mut full = reader(body, VcfOptions::default());
        let first = full.next_record().unwrap().unwrap();
        assert_eq!(first.observations[0].position, 100);
        let checkpoint = full.bytes_consumed();
        let rest: Vec<u64> = std::iter::from_fn(|| full.next_record().unwrap())
            .map(|r| r.observations[0].position)
            .collect();
        assert_eq!(rest, vec![200, 300]);

        // A fresh reader fast-forwarded to the checkpoint sees the same
        // remaining records.
        let mut resumed = reader(body, VcfOptions::default());
        resumed.skip_to(checkpoint).unwrap();
        let resumed_rest: Vec<u64> = std::iter::from_fn(|| resumed.next_record().unwrap())
            .map(|r| r.observations[0].position)
            .collect();
        assert_eq!(resumed_rest, rest);
    }

    #[test]
    fn test_missing_header_rejected() {
        let result = VcfReader::new(
            Cursor::new("1\t100\t.\tA\tG\t.\tPASS\t.\n".to_string()),
            VcfOptions::default(),
        );
        assert!(matches!(result, Err(VcfParseError::Header(_))));
    }
}
