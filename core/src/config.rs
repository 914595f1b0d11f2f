// ==============================================================================
// config.rs - Runtime Settings
// ==============================================================================
// Description: Environment-backed configuration shared by the worker and
//              API gateway
// Author: Matt Barham
// Created: 2025-12-04
// Modified: 2026-01-10
// Version: 1.1.0
// ==============================================================================

use std::env;
use std::path::PathBuf;

use thiserror::Error;

/// Default upload ceiling: 1 GiB.
const DEFAULT_MAX_CONTENT_LENGTH: usize = 1024 * 1024 * 1024;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime settings. Every key is read from the environment once at
/// startup; binaries call `dotenvy::dotenv()` before `Settings::from_env`.
#[derive(Debug, Clone)]
pub struct Settings {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Redis connection string.
    pub redis_url: String,
    /// Blob store root.
    pub data_dir: PathBuf,
    /// Optional read-only secondary blob root.
    pub secondary_data_dir: Option<PathBuf>,
    /// Whether the secondary root has one subdirectory per user login.
    pub secondary_data_by_user: bool,
    /// Upload size ceiling in bytes.
    pub max_content_length: usize,
    /// Reference genome FASTA path. Enables reference verification and
    /// leftmost indel placement during normalization.
    pub genome: Option<PathBuf>,
    /// On reference mismatch: abort the task (true) or drop the record
    /// with a warning count (false).
    pub reference_mismatch_abort: bool,
    /// Value for the CORS Access-Control-Allow-Origin header.
    pub cors_allow_origin: Option<String>,
    /// Mount path for the HTTP surface, e.g. "/api".
    pub api_url_prefix: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: require("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            data_dir: PathBuf::from(require("DATA_DIR")?),
            secondary_data_dir: optional("SECONDARY_DATA_DIR").map(PathBuf::from),
            secondary_data_by_user: parse_bool("SECONDARY_DATA_BY_USER", false)?,
            max_content_length: parse_usize("MAX_CONTENT_LENGTH", DEFAULT_MAX_CONTENT_LENGTH)?,
            genome: optional("GENOME").map(PathBuf::from),
            reference_mismatch_abort: parse_bool("REFERENCE_MISMATCH_ABORT", true)?,
            cors_allow_origin: optional("CORS_ALLOW_ORIGIN"),
            api_url_prefix: optional("API_URL_PREFIX"),
        })
    }
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(key) {
        None => Ok(default),
        Some(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value: v }),
        },
    }
}

fn parse_usize(key: &'static str, default: usize) -> Result<usize, ConfigError> {
    match optional(key) {
        None => Ok(default),
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| ConfigError::Invalid { key, value: v }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_parsing() {
        std::env::set_var("VARDA_TEST_BOOL", "false");
        assert!(!parse_bool("VARDA_TEST_BOOL", true).unwrap());
        std::env::set_var("VARDA_TEST_BOOL", "1");
        assert!(parse_bool("VARDA_TEST_BOOL", false).unwrap());
        std::env::set_var("VARDA_TEST_BOOL", "maybe");
        assert!(parse_bool("VARDA_TEST_BOOL", false).is_err());
        std::env::remove_var("VARDA_TEST_BOOL");
        assert!(parse_bool("VARDA_TEST_BOOL", true).unwrap());
    }
}
