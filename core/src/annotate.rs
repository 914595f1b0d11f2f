// ==============================================================================
// annotate.rs - VCF Annotation Writer
// ==============================================================================
// Description: Streaming rewrite of a VCF with per-query frequency INFO
//              fields
// Author: Matt Barham
// Created: 2025-12-10
// Modified: 2026-01-19
// Version: 1.1.0
// ==============================================================================
// For each named query with slug S, three INFO fields are appended per
// record, one value per alternate allele:
//   S_OBS  (Integer) observed support
//   S_COV  (Integer) coverage denominator
//   S_FREQ (Float)   observed / covered, 6 digits
// ==============================================================================

use std::io::BufRead;

use thiserror::Error;

use crate::models::AnnotationQuery;

/// Annotation errors
#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("Line {line}: {message}")]
    Record { line: u64, message: String },

    #[error("Missing #CHROM header line")]
    MissingHeader,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A line read from the original file, classified for the rewrite loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcfLine {
    /// Meta line (`##...`), passed through unchanged.
    Meta(String),
    /// The `#CHROM` column header; new INFO declarations go right before
    /// this line.
    ColumnHeader(String),
    /// A data record.
    Record(String),
}

/// Byte-accounted line reader over the original file.
pub struct AnnotateReader<R: BufRead> {
    reader: R,
    bytes_consumed: u64,
    line_number: u64,
    line: String,
}

impl<R: BufRead> AnnotateReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            bytes_consumed: 0,
            line_number: 0,
            line: String::new(),
        }
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    pub fn next_line(&mut self) -> Result<Option<VcfLine>, AnnotateError> {
        loop {
            self.line.clear();
            let n = self.reader.read_line(&mut self.line)?;
            if n == 0 {
                return Ok(None);
            }
            self.bytes_consumed += n as u64;
            self.line_number += 1;

            let line = self.line.trim_end().to_string();
            if line.is_empty() {
                continue;
            }
            if line.starts_with("##") {
                return Ok(Some(VcfLine::Meta(line)));
            }
            if line.starts_with("#CHROM") {
                return Ok(Some(VcfLine::ColumnHeader(line)));
            }
            if line.starts_with('#') {
                return Ok(Some(VcfLine::Meta(line)));
            }
            return Ok(Some(VcfLine::Record(line)));
        }
    }
}

/// Alleles of one data record, as written in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordAlleles {
    pub chromosome: String,
    pub position: u64,
    pub reference: String,
    pub alternates: Vec<String>,
}

/// Parse the locus columns of a data record.
pub fn parse_record(line: &str, line_number: u64) -> Result<RecordAlleles, AnnotateError> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 8 {
        return Err(AnnotateError::Record {
            line: line_number,
            message: format!(
                "Expected at least 8 tab-separated columns, got {}",
                fields.len()
            ),
        });
    }

    let position: u64 = fields[1].parse().map_err(|_| AnnotateError::Record {
        line: line_number,
        message: format!("Invalid position: {}", fields[1]),
    })?;

    Ok(RecordAlleles {
        chromosome: fields[0].to_string(),
        position,
        reference: fields[3].to_string(),
        alternates: fields[4]
            .split(',')
            .filter(|a| !a.is_empty() && *a != ".")
            .map(|a| a.to_string())
            .collect(),
    })
}

/// INFO declarations for the annotation queries, one block of three
/// lines per query.
pub fn info_header_lines(queries: &[AnnotationQuery]) -> Vec<String> {
    let mut lines = Vec::new();
    for query in queries {
        lines.push(format!(
            "##INFO=<ID={}_OBS,Number=A,Type=Integer,\
             Description=\"Observed support over selection {}\">",
            query.slug, query.expression
        ));
        lines.push(format!(
            "##INFO=<ID={}_COV,Number=A,Type=Integer,\
             Description=\"Individuals covering this locus over selection {}\">",
            query.slug, query.expression
        ));
        lines.push(format!(
            "##INFO=<ID={}_FREQ,Number=A,Type=Float,\
             Description=\"Observed frequency over selection {}\">",
            query.slug, query.expression
        ));
    }
    lines
}

/// Append `key=value` entries to the INFO column of a record line.
pub fn append_info(
    line: &str,
    additions: &[(String, String)],
    line_number: u64,
) -> Result<String, AnnotateError> {
    let mut fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 8 {
        return Err(AnnotateError::Record {
            line: line_number,
            message: "Record has no INFO column".to_string(),
        });
    }

    let added: String = additions
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(";");

    let info = if fields[7] == "." || fields[7].is_empty() {
        added
    } else {
        format!("{};{}", fields[7], added)
    };

    fields[7] = &info;
    Ok(fields.join("\t"))
}

/// Format a frequency value with six digits. An undefined frequency
/// (nothing covered) renders as zero, matching the counts next to it.
pub fn format_frequency(value: Option<f64>) -> String {
    format!("{:.6}", value.unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_line_classification() {
        let text = "##fileformat=VCFv4.1\n\
                    ##source=test\n\
                    #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n\
                    1\t100\t.\tA\tG\t.\tPASS\t.\n";
        let mut reader = AnnotateReader::new(Cursor::new(text.to_string()));

        assert!(matches!(
            reader.next_line().unwrap().unwrap(),
            VcfLine::Meta(_)
        ));
        assert!(matches!(
            reader.next_line().unwrap().unwrap(),
            VcfLine::Meta(_)
        ));
        assert!(matches!(
            reader.next_line().unwrap().unwrap(),
            VcfLine::ColumnHeader(_)
        ));
        assert!(matches!(
            reader.next_line().unwrap().unwrap(),
            VcfLine::Record(_)
        ));
        assert!(reader.next_line().unwrap().is_none());
        assert_eq!(reader.bytes_consumed() as usize, text.len());
    }

    #[test]
    fn test_parse_record_alleles() {
        let record =
            parse_record("chr19\t200\trs1\tC\tT,G\t50\tPASS\tDP=10", 4).unwrap();
        assert_eq!(record.chromosome, "chr19");
        assert_eq!(record.position, 200);
        assert_eq!(record.reference, "C");
        assert_eq!(record.alternates, vec!["T", "G"]);

        assert!(parse_record("chr19\tnope\t.\tC\tT\t.\t.\t.", 4).is_err());
        assert!(parse_record("chr19\t200", 4).is_err());
    }

    #[test]
    fn test_info_header_lines() {
        let queries = vec![
            AnnotationQuery {
                slug: "global".to_string(),
                expression: "*".to_string(),
            },
            AnnotationQuery {
                slug: "b".to_string(),
                expression: "sample:12".to_string(),
            },
        ];
        let lines = info_header_lines(&queries);
        assert_eq!(lines.len(), 6);
        assert!(lines[0].starts_with("##INFO=<ID=global_OBS,Number=A,Type=Integer"));
        assert!(lines[2].contains("ID=global_FREQ"));
        assert!(lines[3].contains("ID=b_OBS"));
        assert!(lines[5].contains("Type=Float"));
    }

    #[test]
    fn test_append_info() {
        let line = "1\t100\t.\tA\tG\t.\tPASS\tDP=10";
        let out = append_info(
            line,
            &[
                ("global_OBS".to_string(), "1".to_string()),
                ("global_COV".to_string(), "1".to_string()),
                ("global_FREQ".to_string(), "1.000000".to_string()),
            ],
            1,
        )
        .unwrap();
        assert_eq!(
            out,
            "1\t100\t.\tA\tG\t.\tPASS\tDP=10;global_OBS=1;global_COV=1;global_FREQ=1.000000"
        );
    }

    #[test]
    fn test_append_info_replaces_empty() {
        let line = "1\t100\t.\tA\tG\t.\tPASS\t.\tGT\t0/1";
        let out = append_info(line, &[("x_OBS".to_string(), "0".to_string())], 1).unwrap();
        assert_eq!(out, "1\t100\t.\tA\tG\t.\tPASS\tx_OBS=0\tGT\t0/1");
    }

    #[test]
    fn test_format_frequency() {
        assert_eq!(format_frequency(Some(0.4578754578754579)), "0.457875");
        assert_eq!(format_frequency(Some(1.0)), "1.000000");
        assert_eq!(format_frequency(None), "0.000000");
    }
}
