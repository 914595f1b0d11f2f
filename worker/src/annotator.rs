// ==============================================================================
// annotator.rs - Annotation Task
// ==============================================================================
// Description: Rewrites a VCF or BED data source with per-query frequency
//              annotations and registers the generated blob
// Author: Matt Barham
// Created: 2025-12-13
// Modified: 2026-01-24
// Version: 1.3.0
// ==============================================================================
// VCF input produces a VCF with per-allele INFO fields. BED input
// produces a CSV listing every stored variant inside the covered
// regions, one OBS/COV/FREQ column triple per query.
// ==============================================================================

use std::io::Write;

use tracing::{info, warn};
use varda_core::annotate::{
    append_info, format_frequency, info_header_lines, parse_record, AnnotateReader, VcfLine,
};
use varda_core::blob::{BlobStore, BlobWriter};
use varda_core::config::Settings;
use varda_core::expressions::Expr;
use varda_core::frequency::FrequencyEngine;
use varda_core::genome::Genome;
use varda_core::models::{AnnotationQuery, DataSource, Filetype, Task, User};
use varda_core::normalize::{normalize_region, normalize_variant, NormalizeError, NormalizedVariant};
use varda_core::parsers::BedReader;
use varda_core::store::{Store, StoreError};

use crate::tasks::{check_cancelled, progress_percent, TaskError};

/// Records between progress checkpoints and cancellation polls.
const CHECKPOINT_RECORDS: u64 = 1_000;

/// Per-record failures tolerated before the task fails.
const MAX_RECORD_ERRORS: u64 = 1_000;

/// Execute an annotation task: stream the original data source, compute
/// frequencies for each query, and write the annotated copy through the
/// blob store.
///
/// The rewrite has no partially-applied state: the output blob only
/// becomes visible when it completes, so a resumed task restarts the
/// stream. The checkpoint column still tracks progress for observers.
pub async fn annotate(
    store: &Store,
    blobs: &BlobStore,
    genome: Option<&Genome>,
    settings: &Settings,
    task: &Task,
) -> Result<(), TaskError> {
    let annotation_id = task
        .annotation_id
        .ok_or_else(|| TaskError::failed("Task has no annotation target"))?;
    let annotation = store
        .annotation(annotation_id)
        .await?
        .ok_or_else(|| TaskError::failed("Annotation not found"))?;
    let original = store
        .data_source(annotation.original_data_source_id)
        .await?
        .ok_or_else(|| TaskError::failed("Original data source not found"))?;
    let owner = store
        .user(original.user_id)
        .await?
        .ok_or_else(|| TaskError::failed("Data source owner not found"))?;

    let queries: Vec<AnnotationQuery> = serde_json::from_str(&annotation.queries)
        .map_err(|e| TaskError::failed(format!("Invalid annotation queries: {}", e)))?;
    if queries.is_empty() {
        return Err(TaskError::failed("Annotation has no queries"));
    }

    // Selections are re-validated at execution time; sample sets may have
    // changed since the annotation was submitted.
    let mut selections: Vec<(AnnotationQuery, Expr)> = Vec::with_capacity(queries.len());
    for query in queries {
        let expr = Expr::parse(&query.expression)
            .map_err(|e| TaskError::failed(format!("Query {}: {}", query.slug, e)))?;
        selections.push((query, expr));
    }

    let writer = blobs
        .writer()
        .map_err(|e| TaskError::failed(e.to_string()))?;
    let engine = FrequencyEngine::new(store.clone());

    let (blob, output_filetype) = match original.filetype() {
        Some(Filetype::Vcf) => {
            let blob = annotate_vcf(
                store, blobs, genome, settings, task, &original, &owner, &selections, &engine,
                writer,
            )
            .await?;
            (blob, Filetype::Vcf)
        }
        Some(Filetype::Bed) => {
            let blob = annotate_bed(
                store, blobs, genome, settings, task, &original, &owner, &selections, &engine,
                writer,
            )
            .await?;
            (blob, Filetype::Csv)
        }
        _ => {
            return Err(TaskError::failed(
                "Only VCF and BED data sources can be annotated",
            ));
        }
    };

    let annotated_id = store
        .create_data_source(
            annotation.user_id,
            &format!("{} (annotated)", original.name),
            output_filetype,
            true,
            &blob.digest,
            blob.byte_size as i64,
            blob.record_count as i64,
        )
        .await?;
    store
        .set_annotation_result(annotation.id, annotated_id)
        .await?;

    info!(
        "Task {} annotated data source {}: output {}",
        task.id, original.id, blob.digest
    );
    Ok(())
}

/// VCF path: pass headers through, inject INFO declarations before the
/// column header, and append per-allele value lists to each record.
#[allow(clippy::too_many_arguments)]
async fn annotate_vcf(
    store: &Store,
    blobs: &BlobStore,
    genome: Option<&Genome>,
    settings: &Settings,
    task: &Task,
    original: &DataSource,
    owner: &User,
    selections: &[(AnnotationQuery, Expr)],
    engine: &FrequencyEngine,
    mut writer: BlobWriter,
) -> Result<varda_core::blob::StoredBlob, TaskError> {
    let reader = blobs
        .open(&original.digest, &owner.login)
        .map_err(|e| TaskError::failed(e.to_string()))?;
    let mut reader = AnnotateReader::new(reader);
    let exclude_digest = Some(original.digest.as_str());

    let mut records: u64 = 0;
    let mut rejected: u64 = 0;
    let mut seen_header = false;

    while let Some(line) = reader
        .next_line()
        .map_err(|e| TaskError::failed(e.to_string()))?
    {
        match line {
            VcfLine::Meta(text) => {
                writeln!(writer, "{}", text).map_err(|e| TaskError::failed(e.to_string()))?;
            }
            VcfLine::ColumnHeader(text) => {
                let queries: Vec<AnnotationQuery> =
                    selections.iter().map(|(q, _)| q.clone()).collect();
                for header in info_header_lines(&queries) {
                    writeln!(writer, "{}", header)
                        .map_err(|e| TaskError::failed(e.to_string()))?;
                }
                writeln!(writer, "{}", text).map_err(|e| TaskError::failed(e.to_string()))?;
                seen_header = true;
            }
            VcfLine::Record(text) => {
                if !seen_header {
                    return Err(TaskError::failed("Missing #CHROM header line"));
                }
                records += 1;

                let annotated = match annotate_vcf_record(
                    engine,
                    genome,
                    settings,
                    selections,
                    &text,
                    reader.line_number(),
                    exclude_digest,
                )
                .await
                {
                    Ok(annotated) => annotated,
                    Err(RecordFailure::Skip(reason)) => {
                        rejected += 1;
                        warn!("Task {}: record dropped: {}", task.id, reason);
                        if rejected > MAX_RECORD_ERRORS {
                            return Err(TaskError::failed(format!(
                                "Too many malformed records ({}), last: {}",
                                rejected, reason
                            )));
                        }
                        continue;
                    }
                    Err(RecordFailure::Abort(error)) => return Err(error),
                };
                writeln!(writer, "{}", annotated)
                    .map_err(|e| TaskError::failed(e.to_string()))?;

                if records % CHECKPOINT_RECORDS == 0 {
                    checkpoint(
                        store,
                        task,
                        reader.bytes_consumed(),
                        original.byte_size as u64,
                        records,
                        rejected,
                    )
                    .await?;
                }
            }
        }
    }

    writer.finish().map_err(|e| TaskError::failed(e.to_string()))
}

/// BED path: list every stored variant inside the covered regions and
/// write one CSV row per variant with the per-query frequency columns.
#[allow(clippy::too_many_arguments)]
async fn annotate_bed(
    store: &Store,
    blobs: &BlobStore,
    genome: Option<&Genome>,
    settings: &Settings,
    task: &Task,
    original: &DataSource,
    owner: &User,
    selections: &[(AnnotationQuery, Expr)],
    engine: &FrequencyEngine,
    mut writer: BlobWriter,
) -> Result<varda_core::blob::StoredBlob, TaskError> {
    let reader = blobs
        .open(&original.digest, &owner.login)
        .map_err(|e| TaskError::failed(e.to_string()))?;
    let mut reader = BedReader::new(reader);
    let exclude_digest = Some(original.digest.as_str());

    let mut header_fields = vec![
        "CHROMOSOME".to_string(),
        "POSITION".to_string(),
        "REFERENCE".to_string(),
        "OBSERVED".to_string(),
    ];
    for (query, _) in selections {
        writeln!(
            writer,
            "##{}_OBS: Observed support over selection {}",
            query.slug, query.expression
        )
        .map_err(|e| TaskError::failed(e.to_string()))?;
        writeln!(
            writer,
            "##{}_COV: Individuals covering the locus over selection {}",
            query.slug, query.expression
        )
        .map_err(|e| TaskError::failed(e.to_string()))?;
        writeln!(
            writer,
            "##{}_FREQ: Observed frequency over selection {}",
            query.slug, query.expression
        )
        .map_err(|e| TaskError::failed(e.to_string()))?;
        header_fields.push(format!("{}_OBS", query.slug));
        header_fields.push(format!("{}_COV", query.slug));
        header_fields.push(format!("{}_FREQ", query.slug));
    }
    writeln!(writer, "#{}", header_fields.join("\t"))
        .map_err(|e| TaskError::failed(e.to_string()))?;

    let expressions: Vec<Expr> = selections.iter().map(|(_, e)| e.clone()).collect();

    let mut regions: u64 = 0;
    let mut rejected: u64 = 0;

    loop {
        let region = match reader.next_region() {
            Ok(Some(region)) => region,
            Ok(None) => break,
            Err(e @ varda_core::parsers::BedParseError::InvalidLine { .. }) => {
                rejected += 1;
                warn!("Task {}: {}", task.id, e);
                if rejected > MAX_RECORD_ERRORS {
                    return Err(TaskError::failed(format!(
                        "Too many malformed rows ({}), last: {}",
                        rejected, e
                    )));
                }
                continue;
            }
            Err(e) => return Err(TaskError::failed(e.to_string())),
        };
        regions += 1;

        let (chromosome, begin, end) =
            match normalize_region(genome, &region.chromosome, region.begin, region.end) {
                Ok(normalized) => normalized,
                Err(e) => {
                    if settings.reference_mismatch_abort {
                        return Err(TaskError::failed(e.to_string()));
                    }
                    rejected += 1;
                    info!("Task {}: region dropped: {}", task.id, e);
                    continue;
                }
            };

        let variants = store
            .variants_in_region(&chromosome, begin, end, &expressions)
            .await?;

        for variant in variants {
            let normalized = NormalizedVariant {
                chromosome: variant.chromosome.clone(),
                begin: variant.begin_pos as u64,
                end: variant.end_pos as u64,
                reference: variant.reference.clone(),
                observed: variant.observed.clone(),
            };

            let mut row = vec![
                normalized.chromosome.clone(),
                normalized.begin.to_string(),
                normalized.reference.clone(),
                normalized.observed.clone(),
            ];
            for (_, selection) in selections {
                let frequency = engine
                    .frequency(&normalized, selection, exclude_digest)
                    .await?;
                row.push(frequency.observed.to_string());
                row.push(frequency.covered.to_string());
                row.push(format_frequency(frequency.frequency()));
            }
            writeln!(writer, "{}", row.join("\t"))
                .map_err(|e| TaskError::failed(e.to_string()))?;
        }

        if regions % CHECKPOINT_RECORDS == 0 {
            checkpoint(
                store,
                task,
                reader.safe_offset(),
                original.byte_size as u64,
                regions,
                rejected,
            )
            .await?;
        }
    }

    writer.finish().map_err(|e| TaskError::failed(e.to_string()))
}

/// Record progress on the task row and honour cancellation.
async fn checkpoint(
    store: &Store,
    task: &Task,
    bytes_consumed: u64,
    bytes_total: u64,
    accepted: u64,
    rejected: u64,
) -> Result<(), TaskError> {
    let mut conn = store.pool().acquire().await.map_err(StoreError::from)?;
    store
        .checkpoint_task(
            &mut *conn,
            task.id,
            bytes_consumed as i64,
            accepted as i64,
            rejected as i64,
            progress_percent(bytes_consumed, bytes_total),
        )
        .await?;
    drop(conn);
    check_cancelled(store, task.id).await
}

/// Why a single record could not be annotated.
enum RecordFailure {
    /// Drop the record and continue.
    Skip(String),
    /// Fail the whole task.
    Abort(TaskError),
}

/// Annotate one VCF data record: per query, per alternate allele, one
/// OBS/COV/FREQ triple joined as Number=A lists.
async fn annotate_vcf_record(
    engine: &FrequencyEngine,
    genome: Option<&Genome>,
    settings: &Settings,
    selections: &[(AnnotationQuery, Expr)],
    line: &str,
    line_number: u64,
    exclude_digest: Option<&str>,
) -> Result<String, RecordFailure> {
    let record = parse_record(line, line_number)
        .map_err(|e| RecordFailure::Skip(e.to_string()))?;

    if record.alternates.is_empty() {
        return Err(RecordFailure::Skip(format!(
            "Line {}: record has no alternate alleles",
            line_number
        )));
    }

    let mut additions: Vec<(String, String)> = Vec::with_capacity(selections.len() * 3);

    for (query, selection) in selections {
        let mut observed_values = Vec::with_capacity(record.alternates.len());
        let mut covered_values = Vec::with_capacity(record.alternates.len());
        let mut frequency_values = Vec::with_capacity(record.alternates.len());

        for alternate in &record.alternates {
            let variant = match normalize_variant(
                genome,
                &record.chromosome,
                record.position,
                &record.reference,
                alternate,
            ) {
                Ok(variant) => variant,
                Err(
                    e @ (NormalizeError::ReferenceMismatch { .. }
                    | NormalizeError::UnknownChromosome(_)
                    | NormalizeError::PositionOutOfRange { .. }
                    | NormalizeError::NoVariant),
                ) => {
                    if settings.reference_mismatch_abort
                        && !matches!(e, NormalizeError::NoVariant)
                    {
                        return Err(RecordFailure::Abort(TaskError::failed(e.to_string())));
                    }
                    return Err(RecordFailure::Skip(e.to_string()));
                }
                Err(e) => {
                    return Err(RecordFailure::Abort(TaskError::failed(e.to_string())));
                }
            };

            let frequency = engine
                .frequency(&variant, selection, exclude_digest)
                .await
                .map_err(|e| RecordFailure::Abort(TaskError::failed(e.to_string())))?;

            observed_values.push(frequency.observed.to_string());
            covered_values.push(frequency.covered.to_string());
            frequency_values.push(format_frequency(frequency.frequency()));
        }

        additions.push((format!("{}_OBS", query.slug), observed_values.join(",")));
        additions.push((format!("{}_COV", query.slug), covered_values.join(",")));
        additions.push((format!("{}_FREQ", query.slug), frequency_values.join(",")));
    }

    append_info(line, &additions, line_number).map_err(|e| RecordFailure::Skip(e.to_string()))
}
