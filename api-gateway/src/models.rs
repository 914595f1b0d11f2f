// ==============================================================================
// models.rs - API Data Models
// ==============================================================================
// Description: Request/response models for the Varda API
// Author: Matt Barham
// Created: 2025-12-16
// Modified: 2026-01-23
// Version: 1.2.0
// ==============================================================================
// Request bodies are explicit value types validated once at the boundary;
// nothing downstream inspects free-form maps.
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use varda_core::models::{Annotation, DataSource, Sample, Task, User};

fn default_pool_size() -> i32 {
    1
}

fn default_true() -> bool {
    true
}

// ==============================================================================
// SAMPLES
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateSampleRequest {
    pub name: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: i32,
    #[serde(default = "default_true")]
    pub coverage_profile: bool,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EditSampleRequest {
    pub active: Option<bool>,
    pub name: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SampleResponse {
    pub id: i64,
    pub uri: String,
    pub user: String,
    pub name: String,
    pub pool_size: i32,
    pub coverage_profile: bool,
    pub public: bool,
    pub active: bool,
    pub notes: Option<String>,
    pub added: DateTime<Utc>,
}

impl SampleResponse {
    pub fn new(sample: Sample) -> Self {
        Self {
            uri: format!("/samples/{}", sample.id),
            user: format!("/users/{}", sample.user_id),
            id: sample.id,
            name: sample.name,
            pool_size: sample.pool_size,
            coverage_profile: sample.coverage_profile,
            public: sample.public,
            active: sample.active,
            notes: sample.notes,
            added: sample.added,
        }
    }
}

// ==============================================================================
// DATA SOURCES
// ==============================================================================

#[derive(Debug, Serialize)]
pub struct DataSourceResponse {
    pub id: i64,
    pub uri: String,
    pub user: String,
    pub name: String,
    pub filetype: String,
    pub gzipped: bool,
    pub digest: String,
    pub byte_size: i64,
    pub record_count: i64,
    pub added: DateTime<Utc>,
}

impl DataSourceResponse {
    pub fn new(data_source: DataSource) -> Self {
        Self {
            uri: format!("/data_sources/{}", data_source.id),
            user: format!("/users/{}", data_source.user_id),
            id: data_source.id,
            name: data_source.name,
            filetype: data_source.filetype,
            gzipped: data_source.gzipped,
            digest: data_source.digest,
            byte_size: data_source.byte_size,
            record_count: data_source.record_count,
            added: data_source.added,
        }
    }
}

// ==============================================================================
// TASKED RESOURCES
// ==============================================================================

/// Task state embedded in a tasked resource.
#[derive(Debug, Serialize)]
pub struct TaskStatus {
    pub id: Uuid,
    pub state: String,
    pub progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStatus {
    pub fn new(task: &Task) -> Self {
        Self {
            id: task.id,
            state: task.state.clone(),
            progress: task.progress,
            error: task.error.clone(),
        }
    }
}

/// PATCH body for tasked resources: rescheduling (admin) or cooperative
/// cancellation.
#[derive(Debug, Deserialize)]
pub struct TaskPatchRequest {
    pub task: TaskPatch,
}

#[derive(Debug, Deserialize)]
pub struct TaskPatch {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub cancel: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateVariationRequest {
    pub sample: i64,
    pub data_source: i64,
    #[serde(default = "default_true")]
    pub skip_filtered: bool,
    #[serde(default)]
    pub prefer_likelihoods: bool,
    #[serde(default)]
    pub min_genotype_quality: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct VariationResponse {
    pub id: i64,
    pub uri: String,
    pub sample: String,
    pub data_source: String,
    pub task: Option<TaskStatus>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCoverageRequest {
    pub sample: i64,
    pub data_source: i64,
}

#[derive(Debug, Serialize)]
pub struct CoverageResponse {
    pub id: i64,
    pub uri: String,
    pub sample: String,
    pub data_source: String,
    pub task: Option<TaskStatus>,
}

// ==============================================================================
// ANNOTATIONS
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct AnnotationQueryRequest {
    pub name: String,
    pub expression: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateAnnotationRequest {
    pub data_source: i64,
    pub queries: Vec<AnnotationQueryRequest>,
}

#[derive(Debug, Serialize)]
pub struct AnnotationResponse {
    pub id: i64,
    pub uri: String,
    pub original_data_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated_data_source: Option<String>,
    pub queries: serde_json::Value,
    pub task: Option<TaskStatus>,
}

impl AnnotationResponse {
    pub fn new(annotation: &Annotation, task: Option<TaskStatus>) -> Self {
        Self {
            id: annotation.id,
            uri: format!("/annotations/{}", annotation.id),
            original_data_source: format!(
                "/data_sources/{}",
                annotation.original_data_source_id
            ),
            annotated_data_source: annotation
                .annotated_data_source_id
                .map(|id| format!("/data_sources/{}", id)),
            queries: serde_json::from_str(&annotation.queries)
                .unwrap_or(serde_json::Value::Null),
            task,
        }
    }
}

// ==============================================================================
// VARIANTS
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateVariantRequest {
    pub chromosome: String,
    pub position: u64,
    pub reference: String,
    pub observed: String,
}

#[derive(Debug, Serialize)]
pub struct VariantResponse {
    pub id: i64,
    pub uri: String,
    pub chromosome: String,
    pub begin: i64,
    pub end: i64,
    pub reference: String,
    pub observed: String,
}

#[derive(Debug, Deserialize)]
pub struct FrequencyParams {
    /// Selection expression; defaults to the tautology.
    #[serde(default)]
    pub q: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FrequencyResponse {
    pub observed: i64,
    pub heterozygous: i64,
    pub homozygous: i64,
    /// Frequency denominator: total pool size contributed by the
    /// selection at this locus.
    pub covered: i64,
    /// Distinct selected samples with a covered region spanning the
    /// locus. Differs from `covered` for pooled samples, whose pool size
    /// exceeds one.
    pub covering_samples: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
}

// ==============================================================================
// USERS, TOKENS, GROUPS
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub login: String,
    pub password: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: i64,
    pub uri: String,
    pub name: String,
    pub login: String,
    pub roles: Vec<String>,
    pub added: DateTime<Utc>,
}

impl UserResponse {
    pub fn new(user: User) -> Self {
        let roles = varda_core::models::roles_from_bits(user.roles)
            .iter()
            .map(|r| r.as_str().to_string())
            .collect();
        Self {
            uri: format!("/users/{}", user.id),
            id: user.id,
            name: user.name,
            login: user.login,
            roles,
            added: user.added,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTokenRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub id: i64,
    pub uri: String,
    pub name: String,
    /// Raw token, present only in the creation response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub added: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct GroupResponse {
    pub id: i64,
    pub uri: String,
    pub name: String,
    pub added: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct AddGroupMemberRequest {
    pub sample: i64,
}

// ==============================================================================
// SERVICE
// ==============================================================================

#[derive(Debug, Serialize)]
pub struct ApiInfoResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub api_version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub database: bool,
    pub redis: bool,
    pub data_dir: bool,
}
