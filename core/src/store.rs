// ==============================================================================
// store.rs - Observation and Coverage Store
// ==============================================================================
// Description: PostgreSQL-backed store for samples, variants, observations,
//              covered regions, and task rows
// Author: Matt Barham
// Created: 2025-12-08
// Modified: 2026-01-24
// Version: 1.3.0
// ==============================================================================
// All operations run at read-committed isolation. Conflicting inserts
// serialize through unique constraints; per-sample state transitions
// serialize through an advisory lock keyed by the sample id.
// ==============================================================================

use sqlx::{PgConnection, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::binning::{assign_bin, overlapping_bins, BinError};
use crate::expressions::Expr;
use crate::models::{
    Annotation, Coverage, DataSource, Sample, Task, TaskKind, Variation, Zygosity,
};
use crate::normalize::NormalizedVariant;

/// Store errors
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Sample has waiting or running tasks")]
    PendingTasks,

    #[error("Sample has no imported variation")]
    MissingVariation,

    #[error("Sample has a coverage profile but no imported coverage")]
    MissingCoverage,

    #[error("Identical data source already imported into this sample")]
    DuplicateImport,

    #[error("Variant position out of range: {0}")]
    Binning(#[from] BinError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// True when the error is a unique-constraint violation.
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// True for transient conditions worth retrying: serialization failures
/// and deadlocks.
pub fn is_transient(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db)
            if matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
    )
}

/// One observation row in a batch insert.
#[derive(Debug, Clone)]
pub struct ObservationRow {
    pub variant_id: i64,
    pub zygosity: Zygosity,
    pub support: i32,
    pub source_offset: i64,
}

/// One covered-region row in a batch insert.
#[derive(Debug, Clone)]
pub struct RegionRow {
    pub chromosome: String,
    pub begin: i64,
    pub end: i64,
    pub bin: i32,
    pub source_offset: i64,
}

/// Observed support at a variant, split by zygosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZygosityCounts {
    pub heterozygous: i64,
    pub homozygous: i64,
    pub unknown: i64,
}

impl ZygosityCounts {
    pub fn total(&self) -> i64 {
        self.heterozygous + self.homozygous + self.unknown
    }
}

/// PostgreSQL store handle.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ==========================================================================
    // VARIANTS AND OBSERVATIONS
    // ==========================================================================

    /// Insert or find the canonical variant row, returning its id. The
    /// unique constraint on the identity tuple guarantees at most one row
    /// under concurrent inserts.
    pub async fn upsert_variant(
        &self,
        conn: &mut PgConnection,
        variant: &NormalizedVariant,
    ) -> Result<i64, StoreError> {
        let bin = assign_bin(variant.begin, variant.end.max(variant.begin))?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO variants (chromosome, begin_pos, end_pos, reference, observed, bin)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (chromosome, begin_pos, end_pos, observed)
             DO UPDATE SET bin = EXCLUDED.bin
             RETURNING id",
        )
        .bind(&variant.chromosome)
        .bind(variant.begin as i64)
        .bind(variant.end as i64)
        .bind(&variant.reference)
        .bind(&variant.observed)
        .bind(bin)
        .fetch_one(conn)
        .await?;

        Ok(id)
    }

    /// Find the canonical variant row for a normalized variant, without
    /// creating one. Frequency queries stay read-only on the variants
    /// table.
    pub async fn find_variant_id(
        &self,
        variant: &NormalizedVariant,
    ) -> Result<Option<i64>, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT id FROM variants
             WHERE chromosome = $1 AND begin_pos = $2 AND end_pos = $3 AND observed = $4",
        )
        .bind(&variant.chromosome)
        .bind(variant.begin as i64)
        .bind(variant.end as i64)
        .bind(&variant.observed)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Append a batch of observations for a variation.
    pub async fn add_observations(
        &self,
        conn: &mut PgConnection,
        variation_id: i64,
        rows: &[ObservationRow],
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let variant_ids: Vec<i64> = rows.iter().map(|r| r.variant_id).collect();
        let zygosities: Vec<String> = rows.iter().map(|r| r.zygosity.as_str().to_string()).collect();
        let supports: Vec<i32> = rows.iter().map(|r| r.support).collect();
        let offsets: Vec<i64> = rows.iter().map(|r| r.source_offset).collect();

        sqlx::query(
            "INSERT INTO observations (variation_id, variant_id, zygosity, support, source_offset)
             SELECT $1, v, z, s, o
             FROM UNNEST($2::bigint[], $3::text[], $4::int4[], $5::bigint[]) AS t (v, z, s, o)",
        )
        .bind(variation_id)
        .bind(&variant_ids)
        .bind(&zygosities)
        .bind(&supports)
        .bind(&offsets)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Append a batch of covered regions for a coverage.
    pub async fn add_regions(
        &self,
        conn: &mut PgConnection,
        coverage_id: i64,
        rows: &[RegionRow],
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let chromosomes: Vec<String> = rows.iter().map(|r| r.chromosome.clone()).collect();
        let begins: Vec<i64> = rows.iter().map(|r| r.begin).collect();
        let ends: Vec<i64> = rows.iter().map(|r| r.end).collect();
        let bins: Vec<i32> = rows.iter().map(|r| r.bin).collect();
        let offsets: Vec<i64> = rows.iter().map(|r| r.source_offset).collect();

        sqlx::query(
            "INSERT INTO covered_regions (coverage_id, chromosome, begin_pos, end_pos, bin, source_offset)
             SELECT $1, c, b, e, n, o
             FROM UNNEST($2::text[], $3::bigint[], $4::bigint[], $5::int4[], $6::bigint[]) AS t (c, b, e, n, o)",
        )
        .bind(coverage_id)
        .bind(&chromosomes)
        .bind(&begins)
        .bind(&ends)
        .bind(&bins)
        .bind(&offsets)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Delete observation rows at or beyond a resume offset. Run before
    /// resuming an interrupted import so batches committed after the last
    /// checkpoint are not duplicated.
    pub async fn delete_observations_from(
        &self,
        conn: &mut PgConnection,
        variation_id: i64,
        offset: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM observations WHERE variation_id = $1 AND source_offset >= $2",
        )
        .bind(variation_id)
        .bind(offset)
        .execute(conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Covered-region analogue of `delete_observations_from`.
    pub async fn delete_regions_from(
        &self,
        conn: &mut PgConnection,
        coverage_id: i64,
        offset: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM covered_regions WHERE coverage_id = $1 AND source_offset >= $2",
        )
        .bind(coverage_id)
        .bind(offset)
        .execute(conn)
        .await?;
        Ok(result.rows_affected())
    }

    // ==========================================================================
    // FREQUENCY QUERIES
    // ==========================================================================

    /// Observed support for a variant over the selected samples, grouped
    /// by zygosity. Observations imported from a data source with
    /// `exclude_digest` are ignored (used while annotating that source).
    pub async fn observation_counts(
        &self,
        variant_id: i64,
        selection: &Expr,
        exclude_digest: Option<&str>,
    ) -> Result<ZygosityCounts, StoreError> {
        let rendered = selection.to_sql(3);
        let sql = format!(
            "SELECT o.zygosity, COALESCE(SUM(o.support), 0)::bigint AS support
             FROM observations o
             JOIN variations va ON va.id = o.variation_id
             JOIN samples sample ON sample.id = va.sample_id
             JOIN data_sources ds ON ds.id = va.data_source_id
             WHERE o.variant_id = $1
               AND ($2::text IS NULL OR ds.digest <> $2)
               AND {}
             GROUP BY o.zygosity",
            rendered.sql
        );

        let mut query = sqlx::query(&sql).bind(variant_id).bind(exclude_digest);
        for param in &rendered.params {
            query = query.bind(param);
        }

        let mut counts = ZygosityCounts::default();
        for row in query.fetch_all(&self.pool).await? {
            let zygosity: String = row.get("zygosity");
            let support: i64 = row.get("support");
            match Zygosity::from_str(&zygosity) {
                Some(Zygosity::Heterozygous) => counts.heterozygous = support,
                Some(Zygosity::Homozygous) => counts.homozygous = support,
                _ => counts.unknown = support,
            }
        }
        Ok(counts)
    }

    /// Total pool size of selected samples that cover `position`, plus
    /// explicitly named samples which contribute their pool size whether
    /// or not coverage exists (the population-study case).
    pub async fn covered_pool_size(
        &self,
        chromosome: &str,
        position: u64,
        selection: &Expr,
    ) -> Result<i64, StoreError> {
        let bins = overlapping_bins(position, position)?;
        let rendered = selection.to_sql(5);
        let sql = format!(
            "SELECT COALESCE(SUM(sample.pool_size), 0)::bigint
             FROM samples sample
             WHERE {}
               AND ((sample.coverage_profile AND EXISTS (
                       SELECT 1 FROM covered_regions r
                       JOIN coverages c ON c.id = r.coverage_id
                       WHERE c.sample_id = sample.id
                         AND r.chromosome = $1
                         AND r.bin = ANY($2)
                         AND r.begin_pos <= $3 AND r.end_pos >= $3))
                    OR sample.id = ANY($4))",
            rendered.sql
        );

        let mut query = sqlx::query_scalar::<_, i64>(&sql)
            .bind(chromosome)
            .bind(&bins)
            .bind(position as i64)
            .bind(&rendered.explicit_samples);
        for param in &rendered.params {
            query = query.bind(param);
        }

        Ok(query.fetch_one(&self.pool).await?)
    }

    /// Number of distinct selected samples with a covered region spanning
    /// `position`.
    pub async fn count_covering_samples(
        &self,
        chromosome: &str,
        position: u64,
        selection: &Expr,
    ) -> Result<i64, StoreError> {
        let bins = overlapping_bins(position, position)?;
        let rendered = selection.to_sql(4);
        let sql = format!(
            "SELECT COUNT(DISTINCT sample.id)
             FROM samples sample
             JOIN coverages c ON c.sample_id = sample.id
             JOIN covered_regions r ON r.coverage_id = c.id
             WHERE r.chromosome = $1
               AND r.bin = ANY($2)
               AND r.begin_pos <= $3 AND r.end_pos >= $3
               AND {}",
            rendered.sql
        );

        let mut query = sqlx::query_scalar::<_, i64>(&sql)
            .bind(chromosome)
            .bind(&bins)
            .bind(position as i64);
        for param in &rendered.params {
            query = query.bind(param);
        }

        Ok(query.fetch_one(&self.pool).await?)
    }

    /// Distinct variants inside a region that carry observations from
    /// samples matching any of the given selections. Drives BED
    /// annotation, where the output rows are variants rather than the
    /// input regions.
    pub async fn variants_in_region(
        &self,
        chromosome: &str,
        begin: u64,
        end: u64,
        selections: &[Expr],
    ) -> Result<Vec<crate::models::Variant>, StoreError> {
        if selections.is_empty() {
            return Ok(Vec::new());
        }

        let bins = overlapping_bins(begin, end)?;
        let mut params: Vec<i64> = Vec::new();
        let mut parts: Vec<String> = Vec::new();
        for selection in selections {
            let rendered = selection.to_sql(5 + params.len());
            parts.push(rendered.sql);
            params.extend(rendered.params);
        }

        let sql = format!(
            "SELECT DISTINCT v.id, v.chromosome, v.begin_pos, v.end_pos, v.reference, v.observed, v.bin
             FROM variants v
             JOIN observations o ON o.variant_id = v.id
             JOIN variations va ON va.id = o.variation_id
             JOIN samples sample ON sample.id = va.sample_id
             WHERE v.chromosome = $1
               AND v.bin = ANY($2)
               AND v.begin_pos >= $3 AND v.begin_pos <= $4
               AND ({})
             ORDER BY v.begin_pos, v.end_pos, v.observed",
            parts.join(" OR ")
        );

        let mut query = sqlx::query_as::<_, crate::models::Variant>(&sql)
            .bind(chromosome)
            .bind(&bins)
            .bind(begin as i64)
            .bind(end as i64);
        for param in &params {
            query = query.bind(param);
        }

        Ok(query.fetch_all(&self.pool).await?)
    }

    // ==========================================================================
    // SAMPLES
    // ==========================================================================

    pub async fn sample(&self, id: i64) -> Result<Option<Sample>, StoreError> {
        Ok(sqlx::query_as::<_, Sample>("SELECT * FROM samples WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Take the per-sample advisory lock for the current transaction.
    pub async fn lock_sample(
        &self,
        conn: &mut PgConnection,
        sample_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(sample_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Activate a sample. Succeeds only when no waiting or running task
    /// targets the sample and the required imports exist.
    pub async fn activate_sample(&self, sample_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        self.lock_sample(&mut *tx, sample_id).await?;

        let sample = sqlx::query_as::<_, Sample>("SELECT * FROM samples WHERE id = $1 FOR UPDATE")
            .bind(sample_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound("Sample"))?;

        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks
             WHERE sample_id = $1 AND state IN ('waiting', 'running')",
        )
        .bind(sample_id)
        .fetch_one(&mut *tx)
        .await?;
        if pending > 0 {
            return Err(StoreError::PendingTasks);
        }

        let variations: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM variations WHERE sample_id = $1")
                .bind(sample_id)
                .fetch_one(&mut *tx)
                .await?;
        if variations == 0 {
            return Err(StoreError::MissingVariation);
        }

        if sample.coverage_profile {
            let coverages: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM coverages WHERE sample_id = $1")
                    .bind(sample_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if coverages == 0 {
                return Err(StoreError::MissingCoverage);
            }
        }

        sqlx::query("UPDATE samples SET active = TRUE WHERE id = $1")
            .bind(sample_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("Sample {} activated", sample_id);
        Ok(())
    }

    /// Deactivate a sample (admin only at the boundary).
    pub async fn deactivate_sample(&self, sample_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        self.lock_sample(&mut *tx, sample_id).await?;
        let updated = sqlx::query("UPDATE samples SET active = FALSE WHERE id = $1")
            .bind(sample_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound("Sample"));
        }
        tx.commit().await?;
        Ok(())
    }

    // ==========================================================================
    // DATA SOURCES, VARIATIONS, COVERAGES, ANNOTATIONS
    // ==========================================================================

    pub async fn user(&self, id: i64) -> Result<Option<crate::models::User>, StoreError> {
        Ok(
            sqlx::query_as::<_, crate::models::User>("SELECT * FROM users WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Create a data source row for a stored blob. Re-registering the
    /// same content by the same owner observes the existing row, keeping
    /// blob creation idempotent for generated files.
    pub async fn create_data_source(
        &self,
        user_id: i64,
        name: &str,
        filetype: crate::models::Filetype,
        gzipped: bool,
        digest: &str,
        byte_size: i64,
        record_count: i64,
    ) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO data_sources (user_id, name, filetype, gzipped, digest, byte_size, record_count)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (user_id, digest) DO UPDATE SET name = EXCLUDED.name
             RETURNING id",
        )
        .bind(user_id)
        .bind(name)
        .bind(filetype.as_str())
        .bind(gzipped)
        .bind(digest)
        .bind(byte_size)
        .bind(record_count)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn data_source(&self, id: i64) -> Result<Option<DataSource>, StoreError> {
        Ok(
            sqlx::query_as::<_, DataSource>("SELECT * FROM data_sources WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn data_source_by_digest(
        &self,
        user_id: i64,
        digest: &str,
    ) -> Result<Option<DataSource>, StoreError> {
        Ok(sqlx::query_as::<_, DataSource>(
            "SELECT * FROM data_sources WHERE user_id = $1 AND digest = $2",
        )
        .bind(user_id)
        .bind(digest)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn variation(&self, id: i64) -> Result<Option<Variation>, StoreError> {
        Ok(
            sqlx::query_as::<_, Variation>("SELECT * FROM variations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn coverage(&self, id: i64) -> Result<Option<Coverage>, StoreError> {
        Ok(
            sqlx::query_as::<_, Coverage>("SELECT * FROM coverages WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn annotation(&self, id: i64) -> Result<Option<Annotation>, StoreError> {
        Ok(
            sqlx::query_as::<_, Annotation>("SELECT * FROM annotations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Fail when another import of the same content into the same sample
    /// exists. The variation being imported is excluded from the check.
    pub async fn check_duplicate_variation(
        &self,
        sample_id: i64,
        digest: &str,
        current_variation_id: i64,
    ) -> Result<(), StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT 1 FROM variations va
                 JOIN data_sources ds ON ds.id = va.data_source_id
                 WHERE va.sample_id = $1 AND ds.digest = $2 AND va.id <> $3)",
        )
        .bind(sample_id)
        .bind(digest)
        .bind(current_variation_id)
        .fetch_one(&self.pool)
        .await?;

        if exists {
            return Err(StoreError::DuplicateImport);
        }
        Ok(())
    }

    /// Coverage analogue of `check_duplicate_variation`.
    pub async fn check_duplicate_coverage(
        &self,
        sample_id: i64,
        digest: &str,
        current_coverage_id: i64,
    ) -> Result<(), StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT 1 FROM coverages c
                 JOIN data_sources ds ON ds.id = c.data_source_id
                 WHERE c.sample_id = $1 AND ds.digest = $2 AND c.id <> $3)",
        )
        .bind(sample_id)
        .bind(digest)
        .bind(current_coverage_id)
        .fetch_one(&self.pool)
        .await?;

        if exists {
            return Err(StoreError::DuplicateImport);
        }
        Ok(())
    }

    /// Record the annotated output of a completed annotation task.
    pub async fn set_annotation_result(
        &self,
        annotation_id: i64,
        annotated_data_source_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE annotations SET annotated_data_source_id = $1 WHERE id = $2")
            .bind(annotated_data_source_id)
            .bind(annotation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==========================================================================
    // TASKS
    // ==========================================================================

    pub async fn task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn create_task(
        &self,
        conn: &mut PgConnection,
        id: Uuid,
        kind: TaskKind,
        sample_id: Option<i64>,
        variation_id: Option<i64>,
        coverage_id: Option<i64>,
        annotation_id: Option<i64>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tasks (id, kind, sample_id, variation_id, coverage_id, annotation_id)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(sample_id)
        .bind(variation_id)
        .bind(coverage_id)
        .bind(annotation_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Claim a waiting task for execution. Returns None when the task is
    /// not in the waiting state, which makes redelivery idempotent: the
    /// row lock serializes concurrent claims and the state check rejects
    /// the loser.
    pub async fn claim_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(sqlx::query_as::<_, Task>(
            "UPDATE tasks
             SET state = 'running', started_at = now(), heartbeat_at = now(), error = NULL
             WHERE id = $1 AND state = 'waiting'
             RETURNING *",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Serialize imports per sample: when another task targeting the
    /// same sample is already running, flip this freshly claimed task
    /// back to waiting and report it deferred. The advisory lock makes
    /// the check-and-defer atomic against concurrent workers, so exactly
    /// one task per sample proceeds.
    pub async fn defer_task_if_sample_busy(
        &self,
        task_id: Uuid,
        sample_id: i64,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        self.lock_sample(&mut *tx, sample_id).await?;

        let busy: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT 1 FROM tasks
                 WHERE sample_id = $1 AND state = 'running' AND id <> $2)",
        )
        .bind(sample_id)
        .bind(task_id)
        .fetch_one(&mut *tx)
        .await?;

        if busy {
            sqlx::query(
                "UPDATE tasks SET state = 'waiting', started_at = NULL, heartbeat_at = NULL
                 WHERE id = $1",
            )
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(busy)
    }

    /// Record progress for a running task. Runs on the caller's
    /// connection so it can join a batch-flush transaction.
    pub async fn checkpoint_task(
        &self,
        conn: &mut PgConnection,
        id: Uuid,
        offset: i64,
        rows_accepted: i64,
        rows_rejected: i64,
        progress: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE tasks
             SET checkpoint_offset = $2, rows_accepted = $3, rows_rejected = $4,
                 progress = $5, heartbeat_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(offset)
        .bind(rows_accepted)
        .bind(rows_rejected)
        .bind(progress.clamp(0, 100))
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn finish_task(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE tasks
             SET state = 'success', progress = 100, finished_at = now()
             WHERE id = $1 AND state = 'running'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_task(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE tasks
             SET state = 'failure', error = $2, finished_at = now()
             WHERE id = $1 AND state = 'running'",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reset a terminal task to waiting (admin reschedule). The
    /// checkpoint survives so a failed import resumes instead of
    /// restarting.
    pub async fn reschedule_task(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks
             SET state = 'waiting', progress = 0, error = NULL,
                 cancel_requested = FALSE, started_at = NULL, finished_at = NULL
             WHERE id = $1 AND state IN ('success', 'failure')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Request cooperative cancellation; the worker honours it at the
    /// next checkpoint.
    pub async fn request_cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET cancel_requested = TRUE
             WHERE id = $1 AND state IN ('waiting', 'running')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn cancel_requested(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT cancel_requested FROM tasks WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .unwrap_or(false),
        )
    }

    /// Re-queue running tasks whose heartbeat went stale, typically after
    /// a worker crash. They resume from their checkpoint on next claim.
    pub async fn recover_stale_tasks(&self, stale_minutes: i64) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query_scalar::<_, Uuid>(
            "UPDATE tasks
             SET state = 'waiting', started_at = NULL
             WHERE state = 'running'
               AND heartbeat_at < now() - make_interval(mins => $1::int)
             RETURNING id",
        )
        .bind(stale_minutes as i32)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
