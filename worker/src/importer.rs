// ==============================================================================
// importer.rs - Variation and Coverage Import Tasks
// ==============================================================================
// Description: Streaming import of VCF observations and BED coverage with
//              batched writes, checkpoints, and crash-safe resume
// Author: Matt Barham
// Created: 2025-12-12
// Modified: 2026-01-24
// Version: 1.3.0
// ==============================================================================

use std::collections::HashMap;

use tracing::{info, warn};
use uuid::Uuid;
use varda_core::binning::assign_bin;
use varda_core::blob::BlobStore;
use varda_core::config::Settings;
use varda_core::genome::Genome;
use varda_core::models::{Task, Zygosity};
use varda_core::normalize::{normalize_region, normalize_variant, NormalizeError, NormalizedVariant};
use varda_core::parsers::{BedParseError, BedReader, VcfOptions, VcfReader};
use varda_core::store::{ObservationRow, RegionRow, Store, StoreError};

use crate::tasks::{backoff, check_cancelled, is_transient, progress_percent, TaskError, FLUSH_RETRIES};

/// Rows buffered before a batch flush.
const BATCH_SIZE: usize = 5_000;

/// A checkpoint is written with every Nth flush, in the same transaction.
const CHECKPOINT_EVERY: u64 = 10;

/// Per-record failures tolerated before the task fails.
const MAX_RECORD_ERRORS: u64 = 1_000;

/// Variant-id cache entries kept between flushes.
const VARIANT_CACHE_LIMIT: usize = 100_000;

/// Key of a canonical variant in the import-local id cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct VariantKey {
    chromosome: String,
    begin: u64,
    end: u64,
    observed: String,
}

impl From<&NormalizedVariant> for VariantKey {
    fn from(variant: &NormalizedVariant) -> Self {
        Self {
            chromosome: variant.chromosome.clone(),
            begin: variant.begin,
            end: variant.end,
            observed: variant.observed.clone(),
        }
    }
}

/// A normalized observation waiting for its batch flush.
struct PendingObservation {
    variant: NormalizedVariant,
    zygosity: Zygosity,
    support: i32,
    source_offset: i64,
}

/// Checkpoint state written alongside a flush.
#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    offset: i64,
    accepted: i64,
    rejected: i64,
    progress: i32,
}

/// Import a variation: stream the VCF, normalize each allele, and write
/// observations in batches. Resumes from the task checkpoint when one
/// exists.
pub async fn import_variation(
    store: &Store,
    blobs: &BlobStore,
    genome: Option<&Genome>,
    settings: &Settings,
    task: &Task,
) -> Result<(), TaskError> {
    let variation_id = task
        .variation_id
        .ok_or_else(|| TaskError::failed("Task has no variation target"))?;
    let variation = store
        .variation(variation_id)
        .await?
        .ok_or_else(|| TaskError::failed("Variation not found"))?;
    let data_source = store
        .data_source(variation.data_source_id)
        .await?
        .ok_or_else(|| TaskError::failed("Data source not found"))?;
    let owner = store
        .user(data_source.user_id)
        .await?
        .ok_or_else(|| TaskError::failed("Data source owner not found"))?;

    match store
        .check_duplicate_variation(variation.sample_id, &data_source.digest, variation.id)
        .await
    {
        Err(StoreError::DuplicateImport) => {
            return Err(TaskError::failed(
                "Identical data source already imported into this sample",
            ));
        }
        other => other?,
    }

    let reader = blobs
        .open(&data_source.digest, &owner.login)
        .map_err(|e| TaskError::failed(e.to_string()))?;
    let options = VcfOptions {
        skip_filtered: variation.skip_filtered,
        prefer_likelihoods: variation.prefer_likelihoods,
        min_genotype_quality: variation.min_genotype_quality.map(|q| q as u32),
    };
    let mut parser =
        VcfReader::new(reader, options).map_err(|e| TaskError::failed(e.to_string()))?;

    let mut accepted: i64 = 0;
    let mut rejected: i64 = 0;

    // Resume: discard rows beyond the checkpoint, then fast-forward the
    // stream. Batches committed after the last checkpoint would otherwise
    // be duplicated.
    if task.checkpoint_offset > 0 {
        accepted = task.rows_accepted;
        rejected = task.rows_rejected;
        let mut tx = store.pool().begin().await.map_err(StoreError::from)?;
        let removed = store
            .delete_observations_from(&mut *tx, variation_id, task.checkpoint_offset)
            .await?;
        tx.commit().await.map_err(StoreError::from)?;
        parser
            .skip_to(task.checkpoint_offset as u64)
            .map_err(|e| TaskError::failed(e.to_string()))?;
        info!(
            "Task {} resuming variation {} at offset {} ({} stale rows removed)",
            task.id, variation_id, task.checkpoint_offset, removed
        );
    }

    let mut batch: Vec<PendingObservation> = Vec::with_capacity(BATCH_SIZE);
    let mut cache: HashMap<VariantKey, i64> = HashMap::new();
    let mut flushes: u64 = 0;

    loop {
        let record = match parser.next_record() {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(e) if e.is_record_error() => {
                rejected += 1;
                warn!("Task {}: {}", task.id, e);
                if rejected as u64 > MAX_RECORD_ERRORS {
                    return Err(TaskError::failed(format!(
                        "Too many malformed records ({}), last: {}",
                        rejected, e
                    )));
                }
                continue;
            }
            Err(e) => return Err(TaskError::failed(e.to_string())),
        };

        for observation in record.observations {
            match normalize_variant(
                genome,
                &observation.chromosome,
                observation.position,
                &observation.reference,
                &observation.observed,
            ) {
                Ok(variant) => {
                    accepted += 1;
                    batch.push(PendingObservation {
                        variant,
                        zygosity: observation.zygosity,
                        support: observation.support as i32,
                        source_offset: record.offset as i64,
                    });
                }
                Err(
                    e @ (NormalizeError::ReferenceMismatch { .. }
                    | NormalizeError::UnknownChromosome(_)
                    | NormalizeError::PositionOutOfRange { .. }),
                ) => {
                    if settings.reference_mismatch_abort {
                        return Err(TaskError::failed(e.to_string()));
                    }
                    rejected += 1;
                    info!("Task {}: reference mismatch dropped: {}", task.id, e);
                }
                Err(NormalizeError::NoVariant) => {
                    rejected += 1;
                }
                Err(e) => return Err(TaskError::failed(e.to_string())),
            }
        }

        if batch.len() >= BATCH_SIZE {
            flushes += 1;
            let checkpoint = (flushes % CHECKPOINT_EVERY == 0).then(|| Checkpoint {
                offset: parser.bytes_consumed() as i64,
                accepted,
                rejected,
                progress: progress_percent(parser.bytes_consumed(), data_source.byte_size as u64),
            });
            let at_checkpoint = checkpoint.is_some();
            flush_observations(store, task.id, variation_id, &batch, &mut cache, checkpoint)
                .await?;
            batch.clear();
            if at_checkpoint {
                check_cancelled(store, task.id).await?;
            }
        }
    }

    flush_observations(
        store,
        task.id,
        variation_id,
        &batch,
        &mut cache,
        Some(Checkpoint {
            offset: parser.bytes_consumed() as i64,
            accepted,
            rejected,
            progress: 99,
        }),
    )
    .await?;

    info!(
        "Task {} imported variation {}: {} observations accepted, {} records rejected",
        task.id, variation_id, accepted, rejected
    );
    Ok(())
}

/// Import a coverage: stream the BED track and write covered regions in
/// batches, with the same checkpoint discipline as variation imports.
pub async fn import_coverage(
    store: &Store,
    blobs: &BlobStore,
    genome: Option<&Genome>,
    settings: &Settings,
    task: &Task,
) -> Result<(), TaskError> {
    let coverage_id = task
        .coverage_id
        .ok_or_else(|| TaskError::failed("Task has no coverage target"))?;
    let coverage = store
        .coverage(coverage_id)
        .await?
        .ok_or_else(|| TaskError::failed("Coverage not found"))?;
    let data_source = store
        .data_source(coverage.data_source_id)
        .await?
        .ok_or_else(|| TaskError::failed("Data source not found"))?;
    let owner = store
        .user(data_source.user_id)
        .await?
        .ok_or_else(|| TaskError::failed("Data source owner not found"))?;

    match store
        .check_duplicate_coverage(coverage.sample_id, &data_source.digest, coverage.id)
        .await
    {
        Err(StoreError::DuplicateImport) => {
            return Err(TaskError::failed(
                "Identical data source already imported into this sample",
            ));
        }
        other => other?,
    }

    let reader = blobs
        .open(&data_source.digest, &owner.login)
        .map_err(|e| TaskError::failed(e.to_string()))?;
    let mut parser = BedReader::new(reader);

    let mut accepted: i64 = 0;
    let mut rejected: i64 = 0;

    if task.checkpoint_offset > 0 {
        accepted = task.rows_accepted;
        rejected = task.rows_rejected;
        let mut tx = store.pool().begin().await.map_err(StoreError::from)?;
        let removed = store
            .delete_regions_from(&mut *tx, coverage_id, task.checkpoint_offset)
            .await?;
        tx.commit().await.map_err(StoreError::from)?;
        parser
            .skip_to(task.checkpoint_offset as u64)
            .map_err(|e| TaskError::failed(e.to_string()))?;
        info!(
            "Task {} resuming coverage {} at offset {} ({} stale rows removed)",
            task.id, coverage_id, task.checkpoint_offset, removed
        );
    }

    let mut batch: Vec<RegionRow> = Vec::with_capacity(BATCH_SIZE);
    let mut flushes: u64 = 0;

    loop {
        let region = match parser.next_region() {
            Ok(Some(region)) => region,
            Ok(None) => break,
            Err(e @ BedParseError::InvalidLine { .. }) => {
                rejected += 1;
                warn!("Task {}: {}", task.id, e);
                if rejected as u64 > MAX_RECORD_ERRORS {
                    return Err(TaskError::failed(format!(
                        "Too many malformed rows ({}), last: {}",
                        rejected, e
                    )));
                }
                continue;
            }
            Err(e) => return Err(TaskError::failed(e.to_string())),
        };

        match normalize_region(genome, &region.chromosome, region.begin, region.end) {
            Ok((chromosome, begin, end)) => match assign_bin(begin, end) {
                Ok(bin) => {
                    accepted += 1;
                    batch.push(RegionRow {
                        chromosome,
                        begin: begin as i64,
                        end: end as i64,
                        bin,
                        source_offset: region.offset as i64,
                    });
                }
                Err(e) => {
                    if settings.reference_mismatch_abort {
                        return Err(TaskError::failed(e.to_string()));
                    }
                    rejected += 1;
                    info!("Task {}: region dropped: {}", task.id, e);
                }
            },
            Err(
                e @ (NormalizeError::ReferenceMismatch { .. }
                | NormalizeError::UnknownChromosome(_)
                | NormalizeError::PositionOutOfRange { .. }),
            ) => {
                if settings.reference_mismatch_abort {
                    return Err(TaskError::failed(e.to_string()));
                }
                rejected += 1;
                info!("Task {}: reference mismatch dropped: {}", task.id, e);
            }
            Err(e) => return Err(TaskError::failed(e.to_string())),
        }

        if batch.len() >= BATCH_SIZE {
            flushes += 1;
            let checkpoint = (flushes % CHECKPOINT_EVERY == 0).then(|| Checkpoint {
                offset: parser.safe_offset() as i64,
                accepted,
                rejected,
                progress: progress_percent(parser.safe_offset(), data_source.byte_size as u64),
            });
            let at_checkpoint = checkpoint.is_some();
            flush_regions(store, task.id, coverage_id, &batch, checkpoint).await?;
            batch.clear();
            if at_checkpoint {
                check_cancelled(store, task.id).await?;
            }
        }
    }

    flush_regions(
        store,
        task.id,
        coverage_id,
        &batch,
        Some(Checkpoint {
            offset: parser.safe_offset() as i64,
            accepted,
            rejected,
            progress: 99,
        }),
    )
    .await?;

    info!(
        "Task {} imported coverage {}: {} regions accepted, {} rows rejected",
        task.id, coverage_id, accepted, rejected
    );
    Ok(())
}

/// Flush one observation batch transactionally, retrying transient
/// database failures. Variant ids resolved inside a rolled-back attempt
/// are only merged into the cache after a successful commit.
async fn flush_observations(
    store: &Store,
    task_id: Uuid,
    variation_id: i64,
    batch: &[PendingObservation],
    cache: &mut HashMap<VariantKey, i64>,
    checkpoint: Option<Checkpoint>,
) -> Result<(), TaskError> {
    if batch.is_empty() && checkpoint.is_none() {
        return Ok(());
    }

    let mut attempt: u32 = 0;
    loop {
        match try_flush_observations(store, task_id, variation_id, batch, cache, checkpoint).await
        {
            Ok(()) => return Ok(()),
            Err(e) if is_transient(&e) && attempt + 1 < FLUSH_RETRIES => {
                attempt += 1;
                warn!(
                    "Task {}: transient database failure on flush (attempt {}): {}",
                    task_id, attempt, e
                );
                tokio::time::sleep(backoff(attempt)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn try_flush_observations(
    store: &Store,
    task_id: Uuid,
    variation_id: i64,
    batch: &[PendingObservation],
    cache: &mut HashMap<VariantKey, i64>,
    checkpoint: Option<Checkpoint>,
) -> Result<(), StoreError> {
    let mut tx = store.pool().begin().await?;
    let mut fresh: HashMap<VariantKey, i64> = HashMap::new();
    let mut rows = Vec::with_capacity(batch.len());

    for pending in batch {
        let key = VariantKey::from(&pending.variant);
        let variant_id = match cache.get(&key).or_else(|| fresh.get(&key)) {
            Some(&id) => id,
            None => {
                let id = store.upsert_variant(&mut *tx, &pending.variant).await?;
                fresh.insert(key, id);
                id
            }
        };
        rows.push(ObservationRow {
            variant_id,
            zygosity: pending.zygosity,
            support: pending.support,
            source_offset: pending.source_offset,
        });
    }

    store.add_observations(&mut *tx, variation_id, &rows).await?;
    if let Some(cp) = checkpoint {
        store
            .checkpoint_task(&mut *tx, task_id, cp.offset, cp.accepted, cp.rejected, cp.progress)
            .await?;
    }
    tx.commit().await?;

    cache.extend(fresh);
    if cache.len() > VARIANT_CACHE_LIMIT {
        cache.clear();
    }
    Ok(())
}

/// Flush one region batch transactionally, with the same retry policy as
/// observation flushes.
async fn flush_regions(
    store: &Store,
    task_id: Uuid,
    coverage_id: i64,
    batch: &[RegionRow],
    checkpoint: Option<Checkpoint>,
) -> Result<(), TaskError> {
    if batch.is_empty() && checkpoint.is_none() {
        return Ok(());
    }

    let mut attempt: u32 = 0;
    loop {
        let result: Result<(), StoreError> = async {
            let mut tx = store.pool().begin().await?;
            store.add_regions(&mut *tx, coverage_id, batch).await?;
            if let Some(cp) = checkpoint {
                store
                    .checkpoint_task(&mut *tx, task_id, cp.offset, cp.accepted, cp.rejected, cp.progress)
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => return Ok(()),
            Err(e) if is_transient(&e) && attempt + 1 < FLUSH_RETRIES => {
                attempt += 1;
                warn!(
                    "Task {}: transient database failure on flush (attempt {}): {}",
                    task_id, attempt, e
                );
                tokio::time::sleep(backoff(attempt)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
