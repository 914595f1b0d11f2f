// ==============================================================================
// parsers/bed.rs - BED Coverage Track Parser
// ==============================================================================
// Description: Streaming parser for BED tracks, converting to one-based
//              inclusive regions and merging adjacent rows
// Author: Matt Barham
// Created: 2025-12-06
// Modified: 2026-01-06
// Version: 1.1.0
// ==============================================================================

use std::io::BufRead;

use thiserror::Error;

/// BED parsing errors
#[derive(Error, Debug)]
pub enum BedParseError {
    #[error("Line {line}: invalid BED row: {content}")]
    InvalidLine { line: u64, content: String },

    #[error("Stream ended before resume offset {0}")]
    ShortStream(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A covered region, one-based inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRecord {
    /// Byte offset of the first line contributing to this region. Safe
    /// to use as a resume point: re-reading from here reproduces the
    /// region exactly.
    pub offset: u64,
    pub chromosome: String,
    pub begin: u64,
    pub end: u64,
}

/// Streaming BED reader. BED rows are zero-based half-open; emitted
/// regions are one-based inclusive. Consecutive rows on the same
/// chromosome that overlap or touch are merged into one region.
pub struct BedReader<R: BufRead> {
    reader: R,
    bytes_consumed: u64,
    line_number: u64,
    line: String,
    pending: Option<RegionRecord>,
    finished: bool,
}

impl<R: BufRead> BedReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            bytes_consumed: 0,
            line_number: 0,
            line: String::new(),
            pending: None,
            finished: false,
        }
    }

    /// Offset that is safe to record as a checkpoint: the start of the
    /// pending unmerged region if one is buffered, the read position
    /// otherwise.
    pub fn safe_offset(&self) -> u64 {
        self.pending
            .as_ref()
            .map(|r| r.offset)
            .unwrap_or(self.bytes_consumed)
    }

    /// Fast-forward to a byte offset previously reported by
    /// `safe_offset`.
    pub fn skip_to(&mut self, offset: u64) -> Result<(), BedParseError> {
        while self.bytes_consumed < offset {
            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                return Err(BedParseError::ShortStream(offset));
            }
            let take = available
                .len()
                .min((offset - self.bytes_consumed) as usize);
            self.line_number += available[..take].iter().filter(|&&b| b == b'\n').count() as u64;
            self.reader.consume(take);
            self.bytes_consumed += take as u64;
        }
        Ok(())
    }

    /// Next merged region, or None at end of stream.
    pub fn next_region(&mut self) -> Result<Option<RegionRecord>, BedParseError> {
        loop {
            if self.finished {
                return Ok(self.pending.take());
            }

            let offset = self.bytes_consumed;
            self.line.clear();
            let n = self.reader.read_line(&mut self.line)?;
            self.bytes_consumed += n as u64;
            if n == 0 {
                self.finished = true;
                continue;
            }
            self.line_number += 1;

            let line = self.line.trim_end();
            if line.is_empty()
                || line.starts_with('#')
                || line.starts_with("track")
                || line.starts_with("browser")
            {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return Err(self.invalid(line));
            }
            let begin: u64 = fields[1].parse().map_err(|_| self.invalid(line))?;
            let end: u64 = fields[2].parse().map_err(|_| self.invalid(line))?;
            if end < begin {
                return Err(self.invalid(line));
            }
            if end == begin {
                // Zero-length feature; nothing is covered.
                continue;
            }

            // Zero-based half-open to one-based inclusive.
            let record = RegionRecord {
                offset,
                chromosome: fields[0].to_string(),
                begin: begin + 1,
                end,
            };

            match self.pending.take() {
                None => {
                    self.pending = Some(record);
                }
                Some(mut pending)
                    if pending.chromosome == record.chromosome
                        && record.begin <= pending.end + 1 =>
                {
                    pending.end = pending.end.max(record.end);
                    self.pending = Some(pending);
                }
                Some(done) => {
                    self.pending = Some(record);
                    return Ok(Some(done));
                }
            }
        }
    }

    fn invalid(&self, line: &str) -> BedParseError {
        BedParseError::InvalidLine {
            line: self.line_number,
            content: line.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn regions(text: &str) -> Vec<RegionRecord> {
        let mut reader = BedReader::new(Cursor::new(text.to_string()));
        let mut out = Vec::new();
        while let Some(region) = reader.next_region().unwrap() {
            out.push(region);
        }
        out
    }

    #[test]
    fn test_coordinate_conversion() {
        let out = regions("chr1\t0\t100\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].begin, 1);
        assert_eq!(out[0].end, 100);
    }

    #[test]
    fn test_track_and_comment_lines_skipped() {
        let out = regions(
            "track name=coverage description=\"test\"\n\
             browser position chr1\n\
             # a comment\n\
             chr1\t10\t20\n",
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].begin, 11);
        assert_eq!(out[0].end, 20);
    }

    #[test]
    fn test_adjacent_rows_merge() {
        // 0-99 and 99-200 overlap; 200-300 touches; 400-500 is separate.
        let out = regions(
            "chr1\t0\t99\n\
             chr1\t99\t200\n\
             chr1\t200\t300\n\
             chr1\t400\t500\n",
        );
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].begin, out[0].end), (1, 300));
        assert_eq!((out[1].begin, out[1].end), (401, 500));
    }

    #[test]
    fn test_chromosome_change_flushes() {
        let out = regions("chr1\t0\t100\nchr2\t100\t200\n");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].chromosome, "chr1");
        assert_eq!(out[1].chromosome, "chr2");
    }

    #[test]
    fn test_invalid_row() {
        let mut reader = BedReader::new(Cursor::new("chr1\tten\t20\n".to_string()));
        assert!(matches!(
            reader.next_region(),
            Err(BedParseError::InvalidLine { .. })
        ));

        let mut reader = BedReader::new(Cursor::new("chr1\t30\t20\n".to_string()));
        assert!(matches!(
            reader.next_region(),
            Err(BedParseError::InvalidLine { .. })
        ));
    }

    #[test]
    fn test_zero_length_feature_skipped() {
        assert!(regions("chr1\t50\t50\n").is_empty());
    }

    #[test]
    fn test_resume_from_safe_offset() {
        let text = "chr1\t0\t100\n\
                    chr1\t200\t300\n\
                    chr1\t400\t500\n\
                    chr2\t0\t50\n";

        let mut full = BedReader::new(Cursor::new(text.to_string()));
        let first = full.next_region().unwrap().unwrap();
        assert_eq!((first.begin, first.end), (1, 100));
        let checkpoint = full.safe_offset();
        let mut rest = Vec::new();
        while let Some(region) = full.next_region().unwrap() {
            rest.push(region);
        }

        let mut resumed = BedReader::new(Cursor::new(text.to_string()));
        resumed.skip_to(checkpoint).unwrap();
        let mut resumed_rest = Vec::new();
        while let Some(region) = resumed.next_region().unwrap() {
            resumed_rest.push(region);
        }
        assert_eq!(resumed_rest, rest);
    }
}
