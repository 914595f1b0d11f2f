// ==============================================================================
// genome.rs - Reference Genome Oracle
// ==============================================================================
// Description: Indexed FASTA access for chromosome tables and base lookups
// Author: Matt Barham
// Created: 2025-12-03
// Modified: 2025-12-09
// Version: 1.0.0
// ==============================================================================
// References:
// - samtools faidx format: name, length, offset, line_bases, line_width
// ==============================================================================

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Reference oracle errors
#[derive(Error, Debug)]
pub enum GenomeError {
    #[error("Unknown chromosome: {0}")]
    UnknownChromosome(String),

    #[error("Position {position} out of range on chromosome {chromosome} (length {length})")]
    OutOfRange {
        chromosome: String,
        position: u64,
        length: u64,
    },

    #[error("Invalid FASTA index: {0}")]
    Index(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One sequence entry in a FASTA index.
#[derive(Debug, Clone)]
struct IndexEntry {
    name: String,
    length: u64,
    offset: u64,
    line_bases: u64,
    line_width: u64,
}

/// Read-only reference genome backed by a FASTA file and a samtools-style
/// index. Reads are positioned, so a single instance is safe to share
/// between concurrent readers.
pub struct Genome {
    file: File,
    path: PathBuf,
    entries: Vec<IndexEntry>,
    by_name: HashMap<String, usize>,
}

impl Genome {
    /// Open a FASTA file, loading `<path>.fai` when present and scanning
    /// the file to build the index otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GenomeError> {
        let path = path.as_ref().to_path_buf();
        let fai_path = PathBuf::from(format!("{}.fai", path.display()));

        let entries = if fai_path.exists() {
            parse_index(&fai_path)?
        } else {
            build_index(&path)?
        };

        let by_name = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();

        let file = File::open(&path)?;

        Ok(Self {
            file,
            path,
            entries,
            by_name,
        })
    }

    /// Path of the underlying FASTA file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Chromosome names and lengths in file order.
    pub fn chromosomes(&self) -> Vec<(String, u64)> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.length))
            .collect()
    }

    pub fn contains(&self, chromosome: &str) -> bool {
        self.by_name.contains_key(chromosome)
    }

    pub fn length(&self, chromosome: &str) -> Result<u64, GenomeError> {
        self.entry(chromosome).map(|e| e.length)
    }

    /// Reference bases for the one-based inclusive interval `begin`-`end`,
    /// uppercased.
    pub fn bases(&self, chromosome: &str, begin: u64, end: u64) -> Result<String, GenomeError> {
        let entry = self.entry(chromosome)?;

        if begin < 1 || begin > end {
            return Err(GenomeError::OutOfRange {
                chromosome: chromosome.to_string(),
                position: begin,
                length: entry.length,
            });
        }
        if end > entry.length {
            return Err(GenomeError::OutOfRange {
                chromosome: chromosome.to_string(),
                position: end,
                length: entry.length,
            });
        }

        // Byte offsets of the first and last requested base.
        let first = entry.offset
            + ((begin - 1) / entry.line_bases) * entry.line_width
            + (begin - 1) % entry.line_bases;
        let last = entry.offset
            + ((end - 1) / entry.line_bases) * entry.line_width
            + (end - 1) % entry.line_bases;

        let mut buf = vec![0u8; (last - first + 1) as usize];
        self.file.read_exact_at(&mut buf, first)?;

        let bases: String = buf
            .iter()
            .filter(|b| !b.is_ascii_whitespace())
            .map(|b| (*b as char).to_ascii_uppercase())
            .collect();

        if bases.len() as u64 != end - begin + 1 {
            return Err(GenomeError::Index(format!(
                "Read {} bases for {}:{}-{}, expected {}",
                bases.len(),
                chromosome,
                begin,
                end,
                end - begin + 1
            )));
        }

        Ok(bases)
    }

    fn entry(&self, chromosome: &str) -> Result<&IndexEntry, GenomeError> {
        self.by_name
            .get(chromosome)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| GenomeError::UnknownChromosome(chromosome.to_string()))
    }
}

/// Parse a `.fai` file (tab-separated: name, length, offset, line_bases,
/// line_width).
fn parse_index(fai_path: &Path) -> Result<Vec<IndexEntry>, GenomeError> {
    let reader = BufReader::new(File::open(fai_path)?);
    let mut entries = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 5 {
            return Err(GenomeError::Index(format!(
                "line {}: expected 5 tab-separated fields, got {}",
                line_num + 1,
                fields.len()
            )));
        }
        let parse = |i: usize, what: &str| -> Result<u64, GenomeError> {
            fields[i].parse::<u64>().map_err(|e| {
                GenomeError::Index(format!("line {}: invalid {}: {}", line_num + 1, what, e))
            })
        };
        entries.push(IndexEntry {
            name: fields[0].to_string(),
            length: parse(1, "length")?,
            offset: parse(2, "offset")?,
            line_bases: parse(3, "line_bases")?,
            line_width: parse(4, "line_width")?,
        });
    }

    Ok(entries)
}

/// Build an index by scanning a FASTA file once.
fn build_index(fasta_path: &Path) -> Result<Vec<IndexEntry>, GenomeError> {
    let mut reader = BufReader::new(File::open(fasta_path)?);
    let mut entries: Vec<IndexEntry> = Vec::new();
    let mut byte_pos: u64 = 0;

    let mut current: Option<IndexEntry> = None;
    let mut first_seq_line = true;

    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }

        if line.starts_with('>') {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            let name = line[1..]
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_string();
            if name.is_empty() {
                return Err(GenomeError::Index(
                    "FASTA header without a sequence name".to_string(),
                ));
            }
            current = Some(IndexEntry {
                name,
                length: 0,
                offset: byte_pos + n as u64,
                line_bases: 0,
                line_width: 0,
            });
            first_seq_line = true;
        } else if let Some(entry) = current.as_mut() {
            let bases = line.trim_end().len() as u64;
            if first_seq_line && bases > 0 {
                entry.line_bases = bases;
                entry.line_width = n as u64;
                first_seq_line = false;
            }
            entry.length += bases;
        }

        byte_pos += n as u64;
    }

    if let Some(entry) = current {
        entries.push(entry);
    }

    if entries.is_empty() {
        return Err(GenomeError::Index("No sequences in FASTA file".to_string()));
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_fasta(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("ref.fa");
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_build_index_and_read() {
        let dir = TempDir::new().unwrap();
        let path = write_fasta(&dir, ">chr1 test\nACGTACGTAC\nGTACGT\n>chr2\nTTTTT\n");
        let genome = Genome::open(&path).unwrap();

        assert_eq!(
            genome.chromosomes(),
            vec![("chr1".to_string(), 16), ("chr2".to_string(), 5)]
        );
        assert_eq!(genome.bases("chr1", 1, 4).unwrap(), "ACGT");
        // Interval spanning a line break.
        assert_eq!(genome.bases("chr1", 9, 12).unwrap(), "ACGT");
        assert_eq!(genome.bases("chr2", 1, 5).unwrap(), "TTTTT");
    }

    #[test]
    fn test_lowercase_input_uppercased() {
        let dir = TempDir::new().unwrap();
        let path = write_fasta(&dir, ">c\nacgt\n");
        let genome = Genome::open(&path).unwrap();
        assert_eq!(genome.bases("c", 1, 4).unwrap(), "ACGT");
    }

    #[test]
    fn test_unknown_chromosome() {
        let dir = TempDir::new().unwrap();
        let path = write_fasta(&dir, ">chr1\nACGT\n");
        let genome = Genome::open(&path).unwrap();
        assert!(matches!(
            genome.bases("chrX", 1, 2),
            Err(GenomeError::UnknownChromosome(_))
        ));
    }

    #[test]
    fn test_out_of_range() {
        let dir = TempDir::new().unwrap();
        let path = write_fasta(&dir, ">chr1\nACGT\n");
        let genome = Genome::open(&path).unwrap();
        assert!(matches!(
            genome.bases("chr1", 2, 5),
            Err(GenomeError::OutOfRange { .. })
        ));
        assert!(matches!(
            genome.bases("chr1", 0, 2),
            Err(GenomeError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_fai_preferred_over_scan() {
        let dir = TempDir::new().unwrap();
        let path = write_fasta(&dir, ">chr1\nACGTACGT\n");
        let mut fai = File::create(format!("{}.fai", path.display())).unwrap();
        // Offset 6 for the sequence line ">chr1\n".
        fai.write_all(b"chr1\t8\t6\t8\t9\n").unwrap();
        let genome = Genome::open(&path).unwrap();
        assert_eq!(genome.length("chr1").unwrap(), 8);
        assert_eq!(genome.bases("chr1", 5, 8).unwrap(), "ACGT");
    }
}
