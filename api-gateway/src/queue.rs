// ==============================================================================
// queue.rs - Redis Task Queue (Gateway Side)
// ==============================================================================
// Description: Task enqueue operations for scheduling worker tasks
// Author: Matt Barham
// Created: 2025-12-15
// Modified: 2026-01-14
// Version: 1.1.0
// ==============================================================================

use anyhow::{Context, Result};
use redis::{Client, Commands};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const QUEUE_KEY: &str = "varda:task_queue";

/// Task payload for the Redis queue (must match the worker). The task
/// row in PostgreSQL is authoritative; the payload only names it.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: Uuid,
}

/// Task queue manager
pub struct TaskQueue {
    client: Client,
}

impl TaskQueue {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Enqueue a task for the worker pool.
    pub fn enqueue(&self, task_id: Uuid) -> Result<()> {
        let mut conn = self
            .client
            .get_connection()
            .context("Failed to get Redis connection")?;

        let payload = serde_json::to_string(&TaskPayload { task_id })
            .context("Failed to serialize task payload")?;

        // LPUSH pairs with the worker's BRPOP for FIFO delivery.
        conn.lpush::<_, _, ()>(QUEUE_KEY, payload)
            .context("Failed to push task to queue")?;

        Ok(())
    }
}
