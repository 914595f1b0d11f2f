// ==============================================================================
// main.rs - Varda Worker Process
// ==============================================================================
// Description: Background worker draining the Varda task queue: variation
//              and coverage imports, annotation rewrites
// Author: Matt Barham
// Created: 2025-12-11
// Modified: 2026-01-24
// Version: 1.2.0
// ==============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::Client as RedisClient;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn, Level};
use varda_core::blob::BlobStore;
use varda_core::config::Settings;
use varda_core::genome::Genome;
use varda_core::models::{Task, TaskKind};
use varda_core::store::Store;

mod annotator;
mod importer;
mod queue;
mod tasks;

use queue::{TaskPayload, TaskQueue};
use tasks::TaskError;

/// Running tasks whose heartbeat is older than this are re-queued.
const STALE_TASK_MINUTES: i64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .compact()
        .init();

    info!("Starting Varda Worker v1.0.0");

    // Load environment variables
    dotenvy::dotenv().ok();
    let settings = Settings::from_env().context("Failed to load settings")?;

    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    info!("Connected to PostgreSQL");

    let redis_client =
        RedisClient::open(settings.redis_url.clone()).context("Failed to create Redis client")?;
    let redis_conn = ConnectionManager::new(redis_client)
        .await
        .context("Failed to create Redis connection manager")?;

    info!("Connected to Redis");

    // Load the reference genome once; it is shared read-only by every
    // task. Index construction can scan the whole FASTA, so it runs on a
    // blocking thread.
    let genome = match settings.genome.clone() {
        Some(path) => {
            let loaded = tokio::task::spawn_blocking(move || Genome::open(&path))
                .await
                .context("Genome load task failed")?
                .context("Failed to open reference genome")?;
            info!(
                "Reference genome loaded with {} chromosomes",
                loaded.chromosomes().len()
            );
            Some(loaded)
        }
        None => {
            warn!("No reference genome configured; normalization runs without verification");
            None
        }
    };

    let blobs = BlobStore::new(
        settings.data_dir.clone(),
        settings.secondary_data_dir.clone(),
        settings.secondary_data_by_user,
    );

    let worker = Worker {
        store: Store::new(db_pool),
        redis_conn,
        blobs: Arc::new(blobs),
        genome: Arc::new(genome),
        settings: Arc::new(settings),
    };

    // Re-queue tasks stranded by a previous worker instance; they resume
    // from their checkpoints.
    if let Err(e) = worker.recover_stale_tasks().await {
        error!("Failed to recover stale tasks: {}", e);
    }

    let recovery_worker = worker.clone();
    tokio::spawn(async move {
        recovery_worker.recovery_loop().await;
    });

    info!("Worker ready, waiting for tasks...");
    worker.run().await
}

/// Main worker struct
#[derive(Clone)]
struct Worker {
    store: Store,
    redis_conn: ConnectionManager,
    blobs: Arc<BlobStore>,
    genome: Arc<Option<Genome>>,
    settings: Arc<Settings>,
}

impl Worker {
    /// Main processing loop: poll the Redis queue and spawn a task
    /// execution per delivery.
    async fn run(&self) -> Result<()> {
        let mut task_queue = TaskQueue::new(self.redis_conn.clone());

        loop {
            match task_queue.dequeue().await {
                Ok(Some(payload)) => {
                    info!("Received task: {}", payload.task_id);
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.process_task(payload).await;
                    });
                }
                Ok(None) => {
                    // Queue empty; BRPOP already waited.
                }
                Err(e) => {
                    error!("Failed to dequeue task: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// Execute one delivered task. The broker may deliver a task twice;
    /// the claim only succeeds for a waiting row, so the loser of a
    /// duplicate delivery exits here without effects.
    async fn process_task(&self, payload: TaskPayload) {
        let task = match self.store.claim_task(payload.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                info!(
                    "Task {} is not waiting; ignoring redelivery",
                    payload.task_id
                );
                return;
            }
            Err(e) => {
                error!("Failed to claim task {}: {}", payload.task_id, e);
                return;
            }
        };

        // Imports into the same sample are serialized: a second task for
        // a busy sample goes back to waiting and is retried shortly.
        if let Some(sample_id) = task.sample_id {
            match self.store.defer_task_if_sample_busy(task.id, sample_id).await {
                Ok(true) => {
                    info!(
                        "Task {} deferred; sample {} already has a running import",
                        task.id, sample_id
                    );
                    let mut task_queue = TaskQueue::new(self.redis_conn.clone());
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    if let Err(e) = task_queue.enqueue(task.id).await {
                        error!("Failed to re-enqueue deferred task {}: {}", task.id, e);
                    }
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to check sample lock for task {}: {}", task.id, e);
                    return;
                }
            }
        }

        info!("Processing task {} ({})", task.id, task.kind);
        self.publish_progress(&task, "running").await;

        let result = match task.kind() {
            Some(TaskKind::ImportVariation) => {
                importer::import_variation(
                    &self.store,
                    &self.blobs,
                    self.genome.as_ref().as_ref(),
                    &self.settings,
                    &task,
                )
                .await
            }
            Some(TaskKind::ImportCoverage) => {
                importer::import_coverage(
                    &self.store,
                    &self.blobs,
                    self.genome.as_ref().as_ref(),
                    &self.settings,
                    &task,
                )
                .await
            }
            Some(TaskKind::Annotate) => {
                annotator::annotate(
                    &self.store,
                    &self.blobs,
                    self.genome.as_ref().as_ref(),
                    &self.settings,
                    &task,
                )
                .await
            }
            None => Err(TaskError::failed(format!("Unknown task kind: {}", task.kind))),
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.store.finish_task(task.id).await {
                    error!("Failed to record success for task {}: {}", task.id, e);
                    return;
                }
                info!("Task {} completed successfully", task.id);
                self.publish_progress(&task, "success").await;
            }
            Err(TaskError::Cancelled) => {
                if let Err(e) = self.store.fail_task(task.id, "Cancelled").await {
                    error!("Failed to record cancellation for task {}: {}", task.id, e);
                    return;
                }
                warn!("Task {} cancelled", task.id);
                self.publish_progress(&task, "failure").await;
            }
            Err(TaskError::Failed(message)) => {
                error!("Task {} failed: {}", task.id, message);
                if let Err(e) = self.store.fail_task(task.id, &message).await {
                    error!("Failed to record failure for task {}: {}", task.id, e);
                    return;
                }
                self.publish_progress(&task, "failure").await;
            }
        }
    }

    /// Publish a state change on the task's pub/sub channel.
    async fn publish_progress(&self, task: &Task, state: &str) {
        let mut task_queue = TaskQueue::new(self.redis_conn.clone());
        let message = serde_json::json!({
            "task_id": task.id,
            "kind": task.kind,
            "state": state,
        });
        if let Err(e) = task_queue
            .publish_progress(task.id, &message.to_string())
            .await
        {
            warn!("Failed to publish progress for task {}: {}", task.id, e);
        }
    }

    /// Periodic safety net: stale running tasks are re-queued so a
    /// crashed worker's claims do not strand work.
    async fn recovery_loop(&self) {
        loop {
            tokio::time::sleep(Duration::from_secs(600)).await;
            if let Err(e) = self.recover_stale_tasks().await {
                error!("Stale task recovery failed: {}", e);
            }
        }
    }

    async fn recover_stale_tasks(&self) -> Result<()> {
        let recovered = self
            .store
            .recover_stale_tasks(STALE_TASK_MINUTES)
            .await
            .context("Failed to reset stale tasks")?;

        if recovered.is_empty() {
            return Ok(());
        }

        info!("Re-queueing {} stale task(s)", recovered.len());
        let mut task_queue = TaskQueue::new(self.redis_conn.clone());
        for task_id in recovered {
            warn!("Re-queueing stale task {}", task_id);
            task_queue
                .enqueue(task_id)
                .await
                .context("Failed to re-enqueue stale task")?;
        }
        Ok(())
    }
}
