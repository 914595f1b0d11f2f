// ==============================================================================
// parsers/mod.rs - Streaming Input Parsers
// ==============================================================================
// Description: Byte-accounted streaming parsers for variant call and
//              coverage track files
// Author: Matt Barham
// Created: 2025-12-06
// Modified: 2025-12-06
// Version: 1.0.0
// ==============================================================================

pub mod bed;
pub mod vcf;

pub use bed::{BedReader, BedParseError, RegionRecord};
pub use vcf::{RawObservation, VcfOptions, VcfParseError, VcfReader, VcfRecord};
