// ==============================================================================
// handlers.rs - API Request Handlers
// ==============================================================================
// Description: HTTP request handlers for the Varda API resources
// Author: Matt Barham
// Created: 2025-12-16
// Modified: 2026-01-24
// Version: 1.3.0
// ==============================================================================

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;
use varda_core::blob::peek_first_line;
use varda_core::expressions::Expr;
use varda_core::models::{
    bits_from_roles, Annotation, AnnotationQuery, Coverage, DataSource, Filetype, Role, Sample,
    TaskKind, User, Variant, Variation,
};
use varda_core::normalize::normalize_variant;

use crate::error::ApiError;
use crate::middleware::auth::AuthUser;
use crate::models::*;
use crate::pagination::{content_range, parse_order, parse_range};
use crate::queue::TaskQueue;
use crate::security::{generate_token, hash_password, token_digest};
use crate::state::AppState;

/// Supported API major version for Accept-Version negotiation.
const API_VERSION: &str = "1";

// ==============================================================================
// SERVICE ENDPOINTS
// ==============================================================================

/// Root endpoint - API information
pub async fn root(headers: HeaderMap) -> Result<Json<ApiInfoResponse>, ApiError> {
    if let Some(requested) = headers
        .get("Accept-Version")
        .and_then(|value| value.to_str().ok())
    {
        let acceptable = requested
            .split(',')
            .any(|v| v.trim().starts_with(API_VERSION));
        if !acceptable {
            return Err(ApiError::NoAcceptableVersion);
        }
    }

    Ok(Json(ApiInfoResponse {
        service: "Varda API Gateway",
        version: env!("CARGO_PKG_VERSION"),
        api_version: API_VERSION,
    }))
}

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ready = sqlx::query("SELECT 1")
        .fetch_one(state.store().pool())
        .await
        .is_ok();
    let redis_ready = state.redis_client().get_connection().is_ok();
    let data_dir_ready = state.settings().data_dir.exists();

    let ready = db_ready && redis_ready && data_dir_ready;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            database: db_ready,
            redis: redis_ready,
            data_dir: data_dir_ready,
        }),
    )
}

// ==============================================================================
// SAMPLES
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct ListSamplesParams {
    pub active: Option<bool>,
    pub public: Option<bool>,
    pub order: Option<String>,
}

pub async fn list_samples(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    Query(params): Query<ListSamplesParams>,
) -> Result<Response, ApiError> {
    let range = parse_range(&headers)?;
    let order = parse_order(
        params.order.as_deref(),
        &["name", "pool_size", "public", "active", "added"],
        "added DESC, id DESC",
    )?;
    let (limit, offset) = range.limit_offset();

    // Non-admins see their own samples plus public ones.
    let filter = "($1::bool IS NULL OR active = $1)
                  AND ($2::bool IS NULL OR public = $2)
                  AND ($3 OR user_id = $4 OR public)";

    let total: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM samples WHERE {}",
        filter
    ))
    .bind(params.active)
    .bind(params.public)
    .bind(user.is_admin())
    .bind(user.0.id)
    .fetch_one(state.store().pool())
    .await?;

    let samples = sqlx::query_as::<_, Sample>(&format!(
        "SELECT * FROM samples WHERE {} ORDER BY {} LIMIT $5 OFFSET $6",
        filter, order
    ))
    .bind(params.active)
    .bind(params.public)
    .bind(user.is_admin())
    .bind(user.0.id)
    .bind(limit)
    .bind(offset)
    .fetch_all(state.store().pool())
    .await?;

    let body: Vec<SampleResponse> = samples.into_iter().map(SampleResponse::new).collect();
    let range_header = content_range(range, body.len() as u64, total as u64);

    Ok((
        StatusCode::PARTIAL_CONTENT,
        [(header::CONTENT_RANGE, range_header)],
        Json(body),
    )
        .into_response())
}

pub async fn create_sample(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateSampleRequest>,
) -> Result<Response, ApiError> {
    user.require_role(Role::Importer)?;

    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Sample name must not be empty".to_string()));
    }
    if request.pool_size < 1 {
        return Err(ApiError::BadRequest("Pool size must be at least 1".to_string()));
    }

    let sample = sqlx::query_as::<_, Sample>(
        "INSERT INTO samples (user_id, name, pool_size, coverage_profile, public, notes)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING *",
    )
    .bind(user.0.id)
    .bind(request.name.trim())
    .bind(request.pool_size)
    .bind(request.coverage_profile)
    .bind(request.public)
    .bind(&request.notes)
    .fetch_one(state.store().pool())
    .await?;

    info!("User {} created sample {}", user.0.login, sample.id);
    Ok((StatusCode::CREATED, Json(SampleResponse::new(sample))).into_response())
}

pub async fn get_sample(
    State(state): State<AppState>,
    user: AuthUser,
    Path(sample_id): Path<i64>,
) -> Result<Json<SampleResponse>, ApiError> {
    let sample = state
        .store()
        .sample(sample_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if !sample.public {
        user.require_owner(sample.user_id)?;
    }
    Ok(Json(SampleResponse::new(sample)))
}

pub async fn patch_sample(
    State(state): State<AppState>,
    user: AuthUser,
    Path(sample_id): Path<i64>,
    Json(request): Json<EditSampleRequest>,
) -> Result<Json<SampleResponse>, ApiError> {
    let sample = state
        .store()
        .sample(sample_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    user.require_owner(sample.user_id)?;

    if let Some(name) = &request.name {
        if name.trim().is_empty() {
            return Err(ApiError::BadRequest("Sample name must not be empty".to_string()));
        }
        sqlx::query("UPDATE samples SET name = $1 WHERE id = $2")
            .bind(name.trim())
            .bind(sample_id)
            .execute(state.store().pool())
            .await?;
    }
    if let Some(notes) = &request.notes {
        sqlx::query("UPDATE samples SET notes = $1 WHERE id = $2")
            .bind(notes)
            .bind(sample_id)
            .execute(state.store().pool())
            .await?;
    }

    match request.active {
        Some(true) => {
            // The activation guard runs under the per-sample lock.
            state.store().activate_sample(sample_id).await?;
            info!("User {} activated sample {}", user.0.login, sample_id);
        }
        Some(false) => {
            if !user.is_admin() {
                return Err(ApiError::Forbidden(
                    "Only admins may deactivate samples".to_string(),
                ));
            }
            state.store().deactivate_sample(sample_id).await?;
            warn!("Admin {} deactivated sample {}", user.0.login, sample_id);
        }
        None => {}
    }

    let sample = state
        .store()
        .sample(sample_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(SampleResponse::new(sample)))
}

// ==============================================================================
// DATA SOURCES
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct ListDataSourcesParams {
    pub order: Option<String>,
}

pub async fn list_data_sources(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    Query(params): Query<ListDataSourcesParams>,
) -> Result<Response, ApiError> {
    let range = parse_range(&headers)?;
    let order = parse_order(
        params.order.as_deref(),
        &["name", "filetype", "added"],
        "added DESC, id DESC",
    )?;
    let (limit, offset) = range.limit_offset();

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM data_sources WHERE $1 OR user_id = $2",
    )
    .bind(user.is_admin())
    .bind(user.0.id)
    .fetch_one(state.store().pool())
    .await?;

    let sources = sqlx::query_as::<_, DataSource>(&format!(
        "SELECT * FROM data_sources WHERE $1 OR user_id = $2
         ORDER BY {} LIMIT $3 OFFSET $4",
        order
    ))
    .bind(user.is_admin())
    .bind(user.0.id)
    .bind(limit)
    .bind(offset)
    .fetch_all(state.store().pool())
    .await?;

    let body: Vec<DataSourceResponse> =
        sources.into_iter().map(DataSourceResponse::new).collect();
    let range_header = content_range(range, body.len() as u64, total as u64);

    Ok((
        StatusCode::PARTIAL_CONTENT,
        [(header::CONTENT_RANGE, range_header)],
        Json(body),
    )
        .into_response())
}

/// Upload a data source as multipart form data: a `name` field, a
/// `filetype` field (vcf, bed, csv), and a `data` file. Compression is
/// detected from the payload itself.
pub async fn create_data_source(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    user.require_any_role(&[Role::Importer, Role::Annotator, Role::Trader])?;

    let mut name: Option<String> = None;
    let mut filetype: Option<Filetype> = None;
    let mut data: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read multipart field: {}", e)))?
    {
        match field.name().unwrap_or("") {
            "name" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read name: {}", e)))?;
                name = Some(value.trim().to_string());
            }
            "filetype" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read filetype: {}", e)))?;
                filetype = Some(
                    Filetype::from_str(value.trim())
                        .ok_or_else(|| ApiError::BadRequest(format!("Unknown filetype: {}", value)))?,
                );
            }
            "data" => {
                let bytes = field.bytes().await.map_err(|e| {
                    ApiError::BadRequest(format!("Failed to read data field: {}", e))
                })?;
                data = Some(bytes.to_vec());
            }
            other => {
                warn!("Unknown multipart field: {}", other);
            }
        }
    }

    let name = name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing name field".to_string()))?;
    let filetype = filetype.ok_or_else(|| ApiError::BadRequest("Missing filetype field".to_string()))?;
    let data = data.ok_or_else(|| ApiError::BadRequest("Missing data field".to_string()))?;

    if data.len() > state.settings().max_content_length {
        return Err(ApiError::EntityTooLarge);
    }

    // Peek the payload before accepting it as the claimed type.
    if filetype == Filetype::Vcf {
        let first_line = peek_first_line(&data).unwrap_or_default();
        if !first_line.starts_with("##fileformat=VCF") {
            return Err(ApiError::BadRequest(
                "Data does not look like a VCF file".to_string(),
            ));
        }
    }

    let blobs = state.blobs().clone();
    let blob = tokio::task::spawn_blocking(move || blobs.store(&data))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    // The digest is unique per owner; a duplicate upload conflicts.
    let data_source = sqlx::query_as::<_, DataSource>(
        "INSERT INTO data_sources (user_id, name, filetype, gzipped, digest, byte_size, record_count)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         RETURNING *",
    )
    .bind(user.0.id)
    .bind(&name)
    .bind(filetype.as_str())
    .bind(blob.gzipped)
    .bind(&blob.digest)
    .bind(blob.byte_size as i64)
    .bind(blob.record_count as i64)
    .fetch_one(state.store().pool())
    .await
    .map_err(|e| {
        if varda_core::store::is_unique_violation(&e) {
            ApiError::Conflict("Identical data source already uploaded".to_string())
        } else {
            ApiError::Internal(e.to_string())
        }
    })?;

    info!(
        "User {} uploaded data source {} ({} bytes, digest {})",
        user.0.login, data_source.id, data_source.byte_size, data_source.digest
    );
    Ok((StatusCode::CREATED, Json(DataSourceResponse::new(data_source))).into_response())
}

pub async fn get_data_source(
    State(state): State<AppState>,
    user: AuthUser,
    Path(data_source_id): Path<i64>,
) -> Result<Json<DataSourceResponse>, ApiError> {
    let data_source = state
        .store()
        .data_source(data_source_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    user.require_owner(data_source.user_id)?;
    Ok(Json(DataSourceResponse::new(data_source)))
}

/// Download the decompressed content of a data source.
pub async fn get_data_source_data(
    State(state): State<AppState>,
    user: AuthUser,
    Path(data_source_id): Path<i64>,
) -> Result<Response, ApiError> {
    let data_source = state
        .store()
        .data_source(data_source_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    user.require_owner(data_source.user_id)?;

    let blobs = state.blobs().clone();
    let digest = data_source.digest.clone();
    let login = user.0.login.clone();
    let content = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, String> {
        use std::io::Read;
        let mut reader = blobs.open(&digest, &login).map_err(|e| e.to_string())?;
        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .map_err(|e| e.to_string())?;
        Ok(content)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?
    .map_err(ApiError::Internal)?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        content,
    )
        .into_response())
}

// ==============================================================================
// VARIATIONS AND COVERAGES
// ==============================================================================

async fn task_status(state: &AppState, task_id: Option<Uuid>) -> Result<Option<TaskStatus>, ApiError> {
    let Some(task_id) = task_id else {
        return Ok(None);
    };
    Ok(state.store().task(task_id).await?.map(|t| TaskStatus::new(&t)))
}

fn variation_response(variation: &Variation, task: Option<TaskStatus>) -> VariationResponse {
    VariationResponse {
        id: variation.id,
        uri: format!("/variations/{}", variation.id),
        sample: format!("/samples/{}", variation.sample_id),
        data_source: format!("/data_sources/{}", variation.data_source_id),
        task,
    }
}

fn coverage_response(coverage: &Coverage, task: Option<TaskStatus>) -> CoverageResponse {
    CoverageResponse {
        id: coverage.id,
        uri: format!("/coverages/{}", coverage.id),
        sample: format!("/samples/{}", coverage.sample_id),
        data_source: format!("/data_sources/{}", coverage.data_source_id),
        task,
    }
}

/// Shared admission checks for imports: the caller must own an inactive
/// sample and the data source, the filetype must match, and the content
/// digest must be new to the sample.
async fn check_import(
    state: &AppState,
    user: &AuthUser,
    sample_id: i64,
    data_source_id: i64,
    expected: Filetype,
) -> Result<(Sample, DataSource), ApiError> {
    let sample = state
        .store()
        .sample(sample_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    user.require_owner(sample.user_id)?;

    if sample.active {
        return Err(ApiError::Conflict(
            "Cannot import into an active sample".to_string(),
        ));
    }

    let data_source = state
        .store()
        .data_source(data_source_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    user.require_owner(data_source.user_id)?;

    if data_source.filetype() != Some(expected) {
        return Err(ApiError::BadRequest(format!(
            "Data source must have filetype {}",
            expected.as_str()
        )));
    }

    Ok((sample, data_source))
}

pub async fn create_variation(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateVariationRequest>,
) -> Result<Response, ApiError> {
    user.require_role(Role::Importer)?;
    let (sample, data_source) = check_import(
        &state,
        &user,
        request.sample,
        request.data_source,
        Filetype::Vcf,
    )
    .await?;

    // Same content, same sample: conflict, regardless of which data
    // source row carries it.
    let duplicate: bool = sqlx::query_scalar(
        "SELECT EXISTS (
             SELECT 1 FROM variations va
             JOIN data_sources ds ON ds.id = va.data_source_id
             WHERE va.sample_id = $1 AND ds.digest = $2)",
    )
    .bind(sample.id)
    .bind(&data_source.digest)
    .fetch_one(state.store().pool())
    .await?;
    if duplicate {
        return Err(ApiError::Conflict(
            "Identical data source already imported into this sample".to_string(),
        ));
    }

    let task_id = Uuid::new_v4();
    let mut tx = state.store().pool().begin().await?;
    state.store().lock_sample(&mut *tx, sample.id).await?;

    let variation = sqlx::query_as::<_, Variation>(
        "INSERT INTO variations
             (sample_id, data_source_id, skip_filtered, prefer_likelihoods, min_genotype_quality)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING *",
    )
    .bind(sample.id)
    .bind(data_source.id)
    .bind(request.skip_filtered)
    .bind(request.prefer_likelihoods)
    .bind(request.min_genotype_quality)
    .fetch_one(&mut *tx)
    .await?;

    state
        .store()
        .create_task(
            &mut *tx,
            task_id,
            TaskKind::ImportVariation,
            Some(sample.id),
            Some(variation.id),
            None,
            None,
        )
        .await?;
    sqlx::query("UPDATE variations SET task_id = $1 WHERE id = $2")
        .bind(task_id)
        .bind(variation.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    TaskQueue::new(state.redis_client().clone())
        .enqueue(task_id)
        .map_err(|e| ApiError::Internal(format!("Failed to enqueue task: {}", e)))?;

    info!(
        "User {} scheduled variation import {} (task {})",
        user.0.login, variation.id, task_id
    );

    let task = task_status(&state, Some(task_id)).await?;
    Ok((StatusCode::CREATED, Json(variation_response(&variation, task))).into_response())
}

pub async fn get_variation(
    State(state): State<AppState>,
    user: AuthUser,
    Path(variation_id): Path<i64>,
) -> Result<Json<VariationResponse>, ApiError> {
    let variation = state
        .store()
        .variation(variation_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let sample = state
        .store()
        .sample(variation.sample_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    user.require_owner(sample.user_id)?;

    let task = task_status(&state, variation.task_id).await?;
    Ok(Json(variation_response(&variation, task)))
}

pub async fn patch_variation(
    State(state): State<AppState>,
    user: AuthUser,
    Path(variation_id): Path<i64>,
    Json(request): Json<TaskPatchRequest>,
) -> Result<Json<VariationResponse>, ApiError> {
    let variation = state
        .store()
        .variation(variation_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let sample = state
        .store()
        .sample(variation.sample_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let task_id = variation.task_id.ok_or(ApiError::NotFound)?;

    apply_task_patch(&state, &user, sample.user_id, task_id, &request.task).await?;

    let task = task_status(&state, Some(task_id)).await?;
    Ok(Json(variation_response(&variation, task)))
}

pub async fn create_coverage(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateCoverageRequest>,
) -> Result<Response, ApiError> {
    user.require_role(Role::Importer)?;
    let (sample, data_source) = check_import(
        &state,
        &user,
        request.sample,
        request.data_source,
        Filetype::Bed,
    )
    .await?;

    let duplicate: bool = sqlx::query_scalar(
        "SELECT EXISTS (
             SELECT 1 FROM coverages c
             JOIN data_sources ds ON ds.id = c.data_source_id
             WHERE c.sample_id = $1 AND ds.digest = $2)",
    )
    .bind(sample.id)
    .bind(&data_source.digest)
    .fetch_one(state.store().pool())
    .await?;
    if duplicate {
        return Err(ApiError::Conflict(
            "Identical data source already imported into this sample".to_string(),
        ));
    }

    let task_id = Uuid::new_v4();
    let mut tx = state.store().pool().begin().await?;
    state.store().lock_sample(&mut *tx, sample.id).await?;

    let coverage = sqlx::query_as::<_, Coverage>(
        "INSERT INTO coverages (sample_id, data_source_id) VALUES ($1, $2) RETURNING *",
    )
    .bind(sample.id)
    .bind(data_source.id)
    .fetch_one(&mut *tx)
    .await?;

    state
        .store()
        .create_task(
            &mut *tx,
            task_id,
            TaskKind::ImportCoverage,
            Some(sample.id),
            None,
            Some(coverage.id),
            None,
        )
        .await?;
    sqlx::query("UPDATE coverages SET task_id = $1 WHERE id = $2")
        .bind(task_id)
        .bind(coverage.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    TaskQueue::new(state.redis_client().clone())
        .enqueue(task_id)
        .map_err(|e| ApiError::Internal(format!("Failed to enqueue task: {}", e)))?;

    info!(
        "User {} scheduled coverage import {} (task {})",
        user.0.login, coverage.id, task_id
    );

    let task = task_status(&state, Some(task_id)).await?;
    Ok((StatusCode::CREATED, Json(coverage_response(&coverage, task))).into_response())
}

pub async fn get_coverage(
    State(state): State<AppState>,
    user: AuthUser,
    Path(coverage_id): Path<i64>,
) -> Result<Json<CoverageResponse>, ApiError> {
    let coverage = state
        .store()
        .coverage(coverage_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let sample = state
        .store()
        .sample(coverage.sample_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    user.require_owner(sample.user_id)?;

    let task = task_status(&state, coverage.task_id).await?;
    Ok(Json(coverage_response(&coverage, task)))
}

pub async fn patch_coverage(
    State(state): State<AppState>,
    user: AuthUser,
    Path(coverage_id): Path<i64>,
    Json(request): Json<TaskPatchRequest>,
) -> Result<Json<CoverageResponse>, ApiError> {
    let coverage = state
        .store()
        .coverage(coverage_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let sample = state
        .store()
        .sample(coverage.sample_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let task_id = coverage.task_id.ok_or(ApiError::NotFound)?;

    apply_task_patch(&state, &user, sample.user_id, task_id, &request.task).await?;

    let task = task_status(&state, Some(task_id)).await?;
    Ok(Json(coverage_response(&coverage, task)))
}

/// Apply a task patch: rescheduling a terminal task is admin-only;
/// cancellation is open to the resource owner.
async fn apply_task_patch(
    state: &AppState,
    user: &AuthUser,
    owner_id: i64,
    task_id: Uuid,
    patch: &TaskPatch,
) -> Result<(), ApiError> {
    if patch.cancel == Some(true) {
        user.require_owner(owner_id)?;
        if !state.store().request_cancel(task_id).await? {
            return Err(ApiError::Conflict(
                "Task is not waiting or running".to_string(),
            ));
        }
        warn!("User {} requested cancellation of task {}", user.0.login, task_id);
        return Ok(());
    }

    match patch.state.as_deref() {
        Some("waiting") => {
            if !user.is_admin() {
                return Err(ApiError::Forbidden(
                    "Only admins may reschedule tasks".to_string(),
                ));
            }
            if !state.store().reschedule_task(task_id).await? {
                return Err(ApiError::Conflict(
                    "Only terminal tasks can be rescheduled".to_string(),
                ));
            }
            TaskQueue::new(state.redis_client().clone())
                .enqueue(task_id)
                .map_err(|e| ApiError::Internal(format!("Failed to enqueue task: {}", e)))?;
            info!("Admin {} rescheduled task {}", user.0.login, task_id);
            Ok(())
        }
        Some(other) => Err(ApiError::BadRequest(format!(
            "Tasks can only be patched to waiting, not {}",
            other
        ))),
        None => Err(ApiError::BadRequest("Empty task patch".to_string())),
    }
}

// ==============================================================================
// ANNOTATIONS
// ==============================================================================

/// Validate annotation queries: slug shape, uniqueness, parseable
/// expressions, and visibility of explicitly named samples.
async fn validate_queries(
    state: &AppState,
    user: &AuthUser,
    queries: &[AnnotationQueryRequest],
) -> Result<Vec<AnnotationQuery>, ApiError> {
    if queries.is_empty() {
        return Err(ApiError::BadRequest("At least one query is required".to_string()));
    }
    if queries.len() > 10 {
        return Err(ApiError::BadRequest("At most 10 queries are allowed".to_string()));
    }

    let mut validated = Vec::with_capacity(queries.len());
    let mut explicit_samples: Vec<i64> = Vec::new();

    for query in queries {
        let slug = query.name.trim();
        let valid_slug = !slug.is_empty()
            && slug.len() <= 32
            && slug.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_slug {
            return Err(ApiError::BadRequest(format!("Invalid query name: {}", query.name)));
        }
        if validated
            .iter()
            .any(|q: &AnnotationQuery| q.slug == slug)
        {
            return Err(ApiError::BadRequest(format!("Duplicate query name: {}", slug)));
        }

        let expr = Expr::parse(&query.expression)
            .map_err(|e| ApiError::BadRequest(format!("Query {}: {}", slug, e)))?;
        explicit_samples.extend(expr.explicit_samples());

        validated.push(AnnotationQuery {
            slug: slug.to_string(),
            expression: query.expression.trim().to_string(),
        });
    }

    // Explicitly named samples must be visible to the caller.
    if !explicit_samples.is_empty() && !user.is_admin() {
        let hidden: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM samples
             WHERE id = ANY($1) AND NOT (public OR user_id = $2)
             LIMIT 1",
        )
        .bind(&explicit_samples)
        .bind(user.0.id)
        .fetch_optional(state.store().pool())
        .await?;
        if let Some(sample_id) = hidden {
            return Err(ApiError::Forbidden(format!(
                "No access to sample {}",
                sample_id
            )));
        }
    }

    Ok(validated)
}

pub async fn create_annotation(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateAnnotationRequest>,
) -> Result<Response, ApiError> {
    user.require_any_role(&[Role::Annotator, Role::Trader])?;

    let data_source = state
        .store()
        .data_source(request.data_source)
        .await?
        .ok_or(ApiError::NotFound)?;
    user.require_owner(data_source.user_id)?;

    if !matches!(
        data_source.filetype(),
        Some(Filetype::Vcf) | Some(Filetype::Bed)
    ) {
        return Err(ApiError::BadRequest(
            "Only VCF and BED data sources can be annotated".to_string(),
        ));
    }

    // Traders may only annotate content they have contributed: the same
    // digest must be imported into an active sample.
    if !user.is_admin() && !user.0.has_role(Role::Annotator) {
        let traded: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT 1 FROM variations va
                 JOIN data_sources ds ON ds.id = va.data_source_id
                 JOIN samples s ON s.id = va.sample_id
                 JOIN tasks t ON t.id = va.task_id
                 WHERE ds.digest = $1 AND s.active AND t.state = 'success')",
        )
        .bind(&data_source.digest)
        .fetch_one(state.store().pool())
        .await?;
        if !traded {
            return Err(ApiError::Forbidden(
                "Traders can only annotate data sources that have been imported".to_string(),
            ));
        }
    }

    let queries = validate_queries(&state, &user, &request.queries).await?;
    let queries_json =
        serde_json::to_string(&queries).map_err(|e| ApiError::Internal(e.to_string()))?;

    let task_id = Uuid::new_v4();
    let mut tx = state.store().pool().begin().await?;

    let annotation = sqlx::query_as::<_, Annotation>(
        "INSERT INTO annotations (user_id, original_data_source_id, queries)
         VALUES ($1, $2, $3)
         RETURNING *",
    )
    .bind(user.0.id)
    .bind(data_source.id)
    .bind(&queries_json)
    .fetch_one(&mut *tx)
    .await?;

    state
        .store()
        .create_task(
            &mut *tx,
            task_id,
            TaskKind::Annotate,
            None,
            None,
            None,
            Some(annotation.id),
        )
        .await?;
    sqlx::query("UPDATE annotations SET task_id = $1 WHERE id = $2")
        .bind(task_id)
        .bind(annotation.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    TaskQueue::new(state.redis_client().clone())
        .enqueue(task_id)
        .map_err(|e| ApiError::Internal(format!("Failed to enqueue task: {}", e)))?;

    info!(
        "User {} scheduled annotation {} (task {})",
        user.0.login, annotation.id, task_id
    );

    let annotation = state
        .store()
        .annotation(annotation.id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let task = task_status(&state, Some(task_id)).await?;
    Ok((StatusCode::CREATED, Json(AnnotationResponse::new(&annotation, task))).into_response())
}

pub async fn get_annotation(
    State(state): State<AppState>,
    user: AuthUser,
    Path(annotation_id): Path<i64>,
) -> Result<Json<AnnotationResponse>, ApiError> {
    let annotation = state
        .store()
        .annotation(annotation_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    user.require_owner(annotation.user_id)?;

    let task = task_status(&state, annotation.task_id).await?;
    Ok(Json(AnnotationResponse::new(&annotation, task)))
}

pub async fn patch_annotation(
    State(state): State<AppState>,
    user: AuthUser,
    Path(annotation_id): Path<i64>,
    Json(request): Json<TaskPatchRequest>,
) -> Result<Json<AnnotationResponse>, ApiError> {
    let annotation = state
        .store()
        .annotation(annotation_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let task_id = annotation.task_id.ok_or(ApiError::NotFound)?;

    apply_task_patch(&state, &user, annotation.user_id, task_id, &request.task).await?;

    let task = task_status(&state, Some(task_id)).await?;
    Ok(Json(AnnotationResponse::new(&annotation, task)))
}

// ==============================================================================
// VARIANTS
// ==============================================================================

pub async fn create_variant(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateVariantRequest>,
) -> Result<Response, ApiError> {
    user.require_any_role(&[Role::Querier, Role::Annotator, Role::Importer, Role::Trader])?;

    let normalized = normalize_variant(
        state.genome(),
        &request.chromosome,
        request.position,
        &request.reference,
        &request.observed,
    )
    .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let mut conn = state.store().pool().acquire().await?;
    let variant_id = state
        .store()
        .upsert_variant(&mut *conn, &normalized)
        .await?;

    let variant = sqlx::query_as::<_, Variant>("SELECT * FROM variants WHERE id = $1")
        .bind(variant_id)
        .fetch_one(state.store().pool())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(VariantResponse {
            id: variant.id,
            uri: format!("/variants/{}", variant.id),
            chromosome: variant.chromosome,
            begin: variant.begin_pos,
            end: variant.end_pos,
            reference: variant.reference,
            observed: variant.observed,
        }),
    )
        .into_response())
}

/// Frequency of a variant under a selection expression (`q` parameter,
/// defaults to the tautology).
pub async fn get_variant_frequency(
    State(state): State<AppState>,
    user: AuthUser,
    Path(variant_id): Path<i64>,
    Query(params): Query<FrequencyParams>,
) -> Result<Json<FrequencyResponse>, ApiError> {
    user.require_any_role(&[Role::Querier, Role::Annotator])?;

    let variant = sqlx::query_as::<_, Variant>("SELECT * FROM variants WHERE id = $1")
        .bind(variant_id)
        .fetch_optional(state.store().pool())
        .await?
        .ok_or(ApiError::NotFound)?;

    let selection = Expr::parse(params.q.as_deref().unwrap_or("*"))
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    // Explicitly named samples bypass the active filter, so they get the
    // same visibility check as annotations.
    let explicit = selection.explicit_samples();
    if !explicit.is_empty() && !user.is_admin() {
        let hidden: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM samples
             WHERE id = ANY($1) AND NOT (public OR user_id = $2)
             LIMIT 1",
        )
        .bind(&explicit)
        .bind(user.0.id)
        .fetch_optional(state.store().pool())
        .await?;
        if let Some(sample_id) = hidden {
            return Err(ApiError::Forbidden(format!(
                "No access to sample {}",
                sample_id
            )));
        }
    }

    let normalized = varda_core::normalize::NormalizedVariant {
        chromosome: variant.chromosome,
        begin: variant.begin_pos as u64,
        end: variant.end_pos as u64,
        reference: variant.reference,
        observed: variant.observed,
    };

    let frequency = state
        .frequency_engine()
        .frequency(&normalized, &selection, None)
        .await?;

    // Head count of covering samples, next to the pool-size denominator.
    let covering_samples = state
        .store()
        .count_covering_samples(&normalized.chromosome, normalized.begin, &selection)
        .await?;

    Ok(Json(FrequencyResponse {
        observed: frequency.observed,
        heterozygous: frequency.zygosity.heterozygous,
        homozygous: frequency.zygosity.homozygous,
        covered: frequency.covered,
        covering_samples,
        frequency: frequency.frequency(),
    }))
}

// ==============================================================================
// USERS, TOKENS, GROUPS
// ==============================================================================

pub async fn create_user(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateUserRequest>,
) -> Result<Response, ApiError> {
    user.require_role(Role::Admin)?;

    let login = request.login.trim();
    let valid_login = !login.is_empty()
        && login.len() <= 40
        && login
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if !valid_login {
        return Err(ApiError::BadRequest(format!("Invalid login: {}", request.login)));
    }
    if request.password.len() < 8 {
        return Err(ApiError::BadRequest(
            "Password must be at least 8 characters".to_string(),
        ));
    }

    let mut roles = Vec::new();
    for name in &request.roles {
        let role = Role::from_str(name)
            .ok_or_else(|| ApiError::BadRequest(format!("Unknown role: {}", name)))?;
        roles.push(role);
    }

    let password_hash =
        hash_password(&request.password).map_err(|e| ApiError::Internal(e.to_string()))?;

    let created = sqlx::query_as::<_, User>(
        "INSERT INTO users (name, login, password_hash, roles)
         VALUES ($1, $2, $3, $4)
         RETURNING *",
    )
    .bind(request.name.trim())
    .bind(login)
    .bind(&password_hash)
    .bind(bits_from_roles(&roles))
    .fetch_one(state.store().pool())
    .await?;

    info!("Admin {} created user {}", user.0.login, created.login);
    Ok((StatusCode::CREATED, Json(UserResponse::new(created))).into_response())
}

pub async fn get_user(
    State(state): State<AppState>,
    user: AuthUser,
    Path(user_id): Path<i64>,
) -> Result<Json<UserResponse>, ApiError> {
    user.require_owner(user_id)?;
    let target = state.store().user(user_id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(UserResponse::new(target)))
}

pub async fn list_users(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    user.require_role(Role::Admin)?;
    let range = parse_range(&headers)?;
    let (limit, offset) = range.limit_offset();

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(state.store().pool())
        .await?;
    let users = sqlx::query_as::<_, User>(
        "SELECT * FROM users ORDER BY added DESC, id DESC LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(state.store().pool())
    .await?;

    let body: Vec<UserResponse> = users.into_iter().map(UserResponse::new).collect();
    let range_header = content_range(range, body.len() as u64, total as u64);

    Ok((
        StatusCode::PARTIAL_CONTENT,
        [(header::CONTENT_RANGE, range_header)],
        Json(body),
    )
        .into_response())
}

pub async fn create_token(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateTokenRequest>,
) -> Result<Response, ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Token name must not be empty".to_string()));
    }

    let token = generate_token().map_err(|e| ApiError::Internal(e.to_string()))?;
    let digest = token_digest(&token);

    let row: (i64, chrono::DateTime<Utc>) = sqlx::query_as(
        "INSERT INTO tokens (user_id, name, token_digest)
         VALUES ($1, $2, $3)
         RETURNING id, added",
    )
    .bind(user.0.id)
    .bind(request.name.trim())
    .bind(&digest)
    .fetch_one(state.store().pool())
    .await?;

    info!("User {} created token {}", user.0.login, row.0);
    Ok((
        StatusCode::CREATED,
        Json(TokenResponse {
            id: row.0,
            uri: format!("/tokens/{}", row.0),
            name: request.name.trim().to_string(),
            key: Some(token),
            added: row.1,
        }),
    )
        .into_response())
}

pub async fn list_tokens(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let range = parse_range(&headers)?;
    let (limit, offset) = range.limit_offset();

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tokens WHERE user_id = $1")
        .bind(user.0.id)
        .fetch_one(state.store().pool())
        .await?;

    let rows: Vec<(i64, String, chrono::DateTime<Utc>)> = sqlx::query_as(
        "SELECT id, name, added FROM tokens WHERE user_id = $1
         ORDER BY added DESC, id DESC LIMIT $2 OFFSET $3",
    )
    .bind(user.0.id)
    .bind(limit)
    .bind(offset)
    .fetch_all(state.store().pool())
    .await?;

    let body: Vec<TokenResponse> = rows
        .into_iter()
        .map(|(id, name, added)| TokenResponse {
            uri: format!("/tokens/{}", id),
            id,
            name,
            key: None,
            added,
        })
        .collect();
    let range_header = content_range(range, body.len() as u64, total as u64);

    Ok((
        StatusCode::PARTIAL_CONTENT,
        [(header::CONTENT_RANGE, range_header)],
        Json(body),
    )
        .into_response())
}

pub async fn delete_token(
    State(state): State<AppState>,
    user: AuthUser,
    Path(token_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let owner: Option<i64> = sqlx::query_scalar("SELECT user_id FROM tokens WHERE id = $1")
        .bind(token_id)
        .fetch_optional(state.store().pool())
        .await?;
    let owner = owner.ok_or(ApiError::NotFound)?;
    user.require_owner(owner)?;

    sqlx::query("DELETE FROM tokens WHERE id = $1")
        .bind(token_id)
        .execute(state.store().pool())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_group(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateGroupRequest>,
) -> Result<Response, ApiError> {
    user.require_role(Role::GroupAdmin)?;

    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Group name must not be empty".to_string()));
    }

    let row: (i64, chrono::DateTime<Utc>) = sqlx::query_as(
        "INSERT INTO groups (name) VALUES ($1) RETURNING id, added",
    )
    .bind(request.name.trim())
    .fetch_one(state.store().pool())
    .await?;

    info!("User {} created group {}", user.0.login, row.0);
    Ok((
        StatusCode::CREATED,
        Json(GroupResponse {
            id: row.0,
            uri: format!("/groups/{}", row.0),
            name: request.name.trim().to_string(),
            added: row.1,
        }),
    )
        .into_response())
}

pub async fn list_groups(
    State(state): State<AppState>,
    _user: AuthUser,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let range = parse_range(&headers)?;
    let (limit, offset) = range.limit_offset();

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM groups")
        .fetch_one(state.store().pool())
        .await?;

    let rows: Vec<(i64, String, chrono::DateTime<Utc>)> = sqlx::query_as(
        "SELECT id, name, added FROM groups ORDER BY name LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(state.store().pool())
    .await?;

    let body: Vec<GroupResponse> = rows
        .into_iter()
        .map(|(id, name, added)| GroupResponse {
            uri: format!("/groups/{}", id),
            id,
            name,
            added,
        })
        .collect();
    let range_header = content_range(range, body.len() as u64, total as u64);

    Ok((
        StatusCode::PARTIAL_CONTENT,
        [(header::CONTENT_RANGE, range_header)],
        Json(body),
    )
        .into_response())
}

pub async fn add_group_member(
    State(state): State<AppState>,
    user: AuthUser,
    Path(group_id): Path<i64>,
    Json(request): Json<AddGroupMemberRequest>,
) -> Result<StatusCode, ApiError> {
    user.require_role(Role::GroupAdmin)?;

    let sample = state
        .store()
        .sample(request.sample)
        .await?
        .ok_or(ApiError::NotFound)?;
    user.require_owner(sample.user_id)?;

    let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM groups WHERE id = $1)")
        .bind(group_id)
        .fetch_one(state.store().pool())
        .await?;
    if !exists {
        return Err(ApiError::NotFound);
    }

    sqlx::query(
        "INSERT INTO group_membership (sample_id, group_id) VALUES ($1, $2)
         ON CONFLICT DO NOTHING",
    )
    .bind(sample.id)
    .bind(group_id)
    .execute(state.store().pool())
    .await?;

    Ok(StatusCode::NO_CONTENT)
}
