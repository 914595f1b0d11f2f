// ==============================================================================
// models.rs - Domain Data Models
// ==============================================================================
// Description: Row types and enumerations shared by the store, worker, and
//              API gateway
// Author: Matt Barham
// Created: 2025-12-04
// Modified: 2026-01-22
// Version: 1.2.0
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User roles. The bitstring encoding assigns the first role the least
/// significant bit, so new roles must be appended at the end.
pub const USER_ROLES: [Role; 6] = [
    Role::Admin,
    Role::Importer,
    Role::Annotator,
    Role::Trader,
    Role::GroupAdmin,
    Role::Querier,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Can do anything.
    Admin,
    /// Can import samples.
    Importer,
    /// Can annotate data sources.
    Annotator,
    /// Can annotate data sources if they are also imported.
    Trader,
    /// Can manage group membership.
    GroupAdmin,
    /// Can run frequency queries.
    Querier,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Importer => "importer",
            Role::Annotator => "annotator",
            Role::Trader => "trader",
            Role::GroupAdmin => "group-admin",
            Role::Querier => "querier",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        USER_ROLES.iter().copied().find(|r| r.as_str() == s)
    }
}

/// Decode a roles bitstring into the role set.
pub fn roles_from_bits(bits: i32) -> Vec<Role> {
    USER_ROLES
        .iter()
        .enumerate()
        .filter(|(i, _)| bits & (1 << i) != 0)
        .map(|(_, r)| *r)
        .collect()
}

/// Encode a role set into a bitstring.
pub fn bits_from_roles(roles: &[Role]) -> i32 {
    USER_ROLES
        .iter()
        .enumerate()
        .filter(|(_, r)| roles.contains(r))
        .map(|(i, _)| 1 << i)
        .sum()
}

/// Zygosity of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zygosity {
    Heterozygous,
    Homozygous,
    Unknown,
}

impl Zygosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Zygosity::Heterozygous => "heterozygous",
            Zygosity::Homozygous => "homozygous",
            Zygosity::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "heterozygous" => Some(Zygosity::Heterozygous),
            "homozygous" => Some(Zygosity::Homozygous),
            "unknown" => Some(Zygosity::Unknown),
            _ => None,
        }
    }
}

/// Data source file types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filetype {
    Vcf,
    Bed,
    Csv,
}

impl Filetype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Filetype::Vcf => "vcf",
            Filetype::Bed => "bed",
            Filetype::Csv => "csv",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "vcf" => Some(Filetype::Vcf),
            "bed" => Some(Filetype::Bed),
            "csv" => Some(Filetype::Csv),
            _ => None,
        }
    }
}

/// Task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    ImportVariation,
    ImportCoverage,
    Annotate,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ImportVariation => "import-variation",
            TaskKind::ImportCoverage => "import-coverage",
            TaskKind::Annotate => "annotate",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "import-variation" => Some(TaskKind::ImportVariation),
            "import-coverage" => Some(TaskKind::ImportCoverage),
            "annotate" => Some(TaskKind::Annotate),
            _ => None,
        }
    }
}

/// Task states. waiting -> running -> success | failure; an admin may
/// reset a terminal task to waiting for re-execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Waiting,
    Running,
    Success,
    Failure,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Failure => "failure",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(TaskState::Waiting),
            "running" => Some(TaskState::Running),
            "success" => Some(TaskState::Success),
            "failure" => Some(TaskState::Failure),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }
}

/// User row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub login: String,
    pub password_hash: String,
    pub roles: i32,
    pub added: DateTime<Utc>,
}

impl User {
    pub fn has_role(&self, role: Role) -> bool {
        roles_from_bits(self.roles).contains(&role)
    }
}

/// Sample row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Sample {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub pool_size: i32,
    pub coverage_profile: bool,
    pub public: bool,
    pub active: bool,
    pub notes: Option<String>,
    pub added: DateTime<Utc>,
}

/// Data source row. The digest is the SHA-256 of the decompressed
/// payload, hex-encoded, and doubles as the blob name.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DataSource {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub filetype: String,
    pub gzipped: bool,
    pub digest: String,
    pub byte_size: i64,
    pub record_count: i64,
    pub added: DateTime<Utc>,
}

impl DataSource {
    pub fn filetype(&self) -> Option<Filetype> {
        Filetype::from_str(&self.filetype)
    }
}

/// Variation row: one ingestion of observations into a sample.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Variation {
    pub id: i64,
    pub sample_id: i64,
    pub data_source_id: i64,
    pub task_id: Option<Uuid>,
    pub skip_filtered: bool,
    pub prefer_likelihoods: bool,
    pub min_genotype_quality: Option<i32>,
}

/// Coverage row: one ingestion of covered regions into a sample.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Coverage {
    pub id: i64,
    pub sample_id: i64,
    pub data_source_id: i64,
    pub task_id: Option<Uuid>,
}

/// Canonical variant row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Variant {
    pub id: i64,
    pub chromosome: String,
    pub begin_pos: i64,
    pub end_pos: i64,
    pub reference: String,
    pub observed: String,
    pub bin: i32,
}

/// Task row. The row is authoritative for task state; broker deliveries
/// are only hints.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Task {
    pub id: Uuid,
    pub kind: String,
    pub state: String,
    pub progress: i32,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub checkpoint_offset: i64,
    pub rows_accepted: i64,
    pub rows_rejected: i64,
    pub sample_id: Option<i64>,
    pub variation_id: Option<i64>,
    pub coverage_id: Option<i64>,
    pub annotation_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn kind(&self) -> Option<TaskKind> {
        TaskKind::from_str(&self.kind)
    }

    pub fn state(&self) -> Option<TaskState> {
        TaskState::from_str(&self.state)
    }
}

/// Annotation row: a derived data source produced by rewriting an input
/// file with frequency fields.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Annotation {
    pub id: i64,
    pub user_id: i64,
    pub original_data_source_id: i64,
    pub annotated_data_source_id: Option<i64>,
    pub task_id: Option<Uuid>,
    /// JSON-encoded list of (slug, expression) pairs.
    pub queries: String,
    pub added: DateTime<Utc>,
}

/// One named frequency query attached to an annotation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnotationQuery {
    pub slug: String,
    pub expression: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_bitstring_round_trip() {
        let roles = vec![Role::Admin, Role::Trader, Role::Querier];
        let bits = bits_from_roles(&roles);
        assert_eq!(bits, 1 | 8 | 32);
        assert_eq!(roles_from_bits(bits), roles);
    }

    #[test]
    fn test_role_names() {
        assert_eq!(Role::GroupAdmin.as_str(), "group-admin");
        assert_eq!(Role::from_str("group-admin"), Some(Role::GroupAdmin));
        assert_eq!(Role::from_str("root"), None);
    }

    #[test]
    fn test_task_state_terminal() {
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Failure.is_terminal());
        assert!(!TaskState::Waiting.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn test_enum_string_round_trips() {
        for kind in [
            TaskKind::ImportVariation,
            TaskKind::ImportCoverage,
            TaskKind::Annotate,
        ] {
            assert_eq!(TaskKind::from_str(kind.as_str()), Some(kind));
        }
        for z in [
            Zygosity::Heterozygous,
            Zygosity::Homozygous,
            Zygosity::Unknown,
        ] {
            assert_eq!(Zygosity::from_str(z.as_str()), Some(z));
        }
        for f in [Filetype::Vcf, Filetype::Bed, Filetype::Csv] {
            assert_eq!(Filetype::from_str(f.as_str()), Some(f));
        }
    }
}
