// ==============================================================================
// state.rs - Application State Management
// ==============================================================================
// Description: Shared application state for the Varda API gateway
// Author: Matt Barham
// Created: 2025-12-15
// Modified: 2026-01-20
// Version: 1.1.0
// ==============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use redis::Client as RedisClient;
use sqlx::postgres::PgPoolOptions;
use varda_core::blob::BlobStore;
use varda_core::config::Settings;
use varda_core::frequency::FrequencyEngine;
use varda_core::genome::Genome;
use varda_core::store::Store;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Store,
    redis_client: RedisClient,
    blobs: BlobStore,
    genome: Option<Genome>,
    settings: Settings,
}

impl AppState {
    /// Create new application state from settings.
    pub async fn new(settings: Settings) -> Result<Self> {
        let db_pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&settings.database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let redis_client = RedisClient::open(settings.redis_url.clone())
            .context("Failed to create Redis client")?;

        // Test Redis connection
        let mut conn = redis_client
            .get_connection()
            .context("Failed to connect to Redis")?;
        redis::cmd("PING")
            .query::<String>(&mut conn)
            .context("Redis PING failed")?;

        let blobs = BlobStore::new(
            settings.data_dir.clone(),
            settings.secondary_data_dir.clone(),
            settings.secondary_data_by_user,
        );

        let genome = match settings.genome.clone() {
            Some(path) => {
                let loaded = tokio::task::spawn_blocking(move || Genome::open(&path))
                    .await
                    .context("Genome load task failed")?
                    .context("Failed to open reference genome")?;
                Some(loaded)
            }
            None => None,
        };

        Ok(Self {
            inner: Arc::new(AppStateInner {
                store: Store::new(db_pool),
                redis_client,
                blobs,
                genome,
                settings,
            }),
        })
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn frequency_engine(&self) -> FrequencyEngine {
        FrequencyEngine::new(self.inner.store.clone())
    }

    pub fn redis_client(&self) -> &RedisClient {
        &self.inner.redis_client
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.inner.blobs
    }

    pub fn genome(&self) -> Option<&Genome> {
        self.inner.genome.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }
}
