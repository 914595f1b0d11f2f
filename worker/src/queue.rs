// ==============================================================================
// queue.rs - Redis Task Queue (Worker Side)
// ==============================================================================
// Description: Task queue operations for consuming tasks from Redis
// Author: Matt Barham
// Created: 2025-12-11
// Modified: 2026-01-14
// Version: 1.1.0
// ==============================================================================

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const QUEUE_KEY: &str = "varda:task_queue";

/// Task payload from the Redis queue (must match the API gateway). The
/// payload is only a delivery hint; the task row in PostgreSQL is
/// authoritative for state, options, and targets.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: Uuid,
}

/// Task queue manager
pub struct TaskQueue {
    conn: ConnectionManager,
}

impl TaskQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Dequeue a task (blocking pop with timeout).
    pub async fn dequeue(&mut self) -> Result<Option<TaskPayload>> {
        // BRPOP with 1 second timeout
        let result: Option<(String, String)> = self
            .conn
            .brpop(QUEUE_KEY, 1.0)
            .await
            .context("Failed to pop from queue")?;

        match result {
            Some((_, payload_json)) => {
                let payload: TaskPayload = serde_json::from_str(&payload_json)
                    .context("Failed to deserialize task payload")?;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    /// Re-enqueue a task id, used when stale tasks are recovered.
    pub async fn enqueue(&mut self, task_id: Uuid) -> Result<()> {
        let payload = serde_json::to_string(&TaskPayload { task_id })
            .context("Failed to serialize task payload")?;
        self.conn
            .lpush::<_, _, ()>(QUEUE_KEY, payload)
            .await
            .context("Failed to push task to queue")?;
        Ok(())
    }

    /// Publish a progress update to the task's pub/sub channel.
    pub async fn publish_progress(&mut self, task_id: Uuid, message: &str) -> Result<()> {
        let channel = format!("varda:task_progress:{}", task_id);
        self.conn
            .publish::<_, _, ()>(channel, message)
            .await
            .context("Failed to publish progress update")?;
        Ok(())
    }
}
