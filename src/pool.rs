//! Owns every worker in the process. The registry is explicit state behind
//! the pool, not a process-wide map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::job::Progress;
use crate::store::WorkerRecord;
use crate::worker::{Worker, WorkerContext};

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Delay before reattaching persisted workers, so the backend network can
    /// settle after a host restart.
    pub startup_grace: Duration,
    /// Delay between successive worker starts during resume, so reattached
    /// workers do not stampede the queue with simultaneous claims.
    pub start_stagger: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(10),
            start_stagger: Duration::from_secs(1),
        }
    }
}

/// Operator-facing snapshot of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub id: String,
    pub gpu: String,
    pub endpoint: String,
    pub is_active: bool,
    pub description: Option<String>,
    pub progress: Option<Progress>,
}

pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    config: PoolConfig,
    workers: Mutex<HashMap<String, Worker>>,
}

impl WorkerPool {
    pub fn new(ctx: WorkerContext, config: PoolConfig) -> Self {
        Self {
            ctx: Arc::new(ctx),
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<crate::store::Store> {
        &self.ctx.store
    }

    /// Recreate persisted workers after a process start, restarting the ones
    /// that were active when the previous process went down.
    pub async fn resume(&self) -> Result<()> {
        tokio::time::sleep(self.config.startup_grace).await;
        let records = self.ctx.store.workers().await;
        info!("resuming {} persisted workers", records.len());
        let mut workers = self.workers.lock().await;
        for record in records {
            if self.ctx.shutdown.is_cancelled() {
                break;
            }
            let mut worker = Worker::new(&record);
            if record.is_active {
                if let Err(err) = worker.start(&self.ctx).await {
                    warn!("failed to resume worker {}: {:#}", record.id, err);
                } else {
                    tokio::time::sleep(self.config.start_stagger).await;
                }
            }
            workers.insert(record.id.clone(), worker);
        }
        Ok(())
    }

    /// Register a new worker. It stays inactive until an operator starts it.
    pub async fn create_worker(&self, gpu: &str, endpoint: &str) -> Result<WorkerRecord> {
        let record = WorkerRecord {
            id: Uuid::new_v4().to_string(),
            gpu: gpu.to_string(),
            endpoint: endpoint.to_string(),
            is_active: false,
        };
        self.ctx.store.create_worker(record.clone()).await?;
        let mut workers = self.workers.lock().await;
        workers.insert(record.id.clone(), Worker::new(&record));
        info!("registered worker {} for {}", record.id, record.endpoint);
        Ok(record)
    }

    pub async fn start_worker(&self, id: &str) -> Result<()> {
        let mut workers = self.workers.lock().await;
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| anyhow!("worker not found: {}", id))?;
        worker.start(&self.ctx).await
    }

    pub async fn stop_worker(&self, id: &str) -> Result<()> {
        let mut workers = self.workers.lock().await;
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| anyhow!("worker not found: {}", id))?;
        worker.stop(&self.ctx).await
    }

    /// Stop, release, unregister and unpersist the worker.
    pub async fn delete_worker(&self, id: &str) -> Result<()> {
        let mut workers = self.workers.lock().await;
        let Some(mut worker) = workers.remove(id) else {
            return Err(anyhow!("worker not found: {}", id));
        };
        worker.stop(&self.ctx).await?;
        self.ctx.store.delete_worker(id).await?;
        info!("deleted worker {}", id);
        Ok(())
    }

    pub async fn list(&self) -> Vec<WorkerView> {
        let records = self.ctx.store.workers().await;
        let workers = self.workers.lock().await;
        records
            .into_iter()
            .map(|record| {
                let state = workers
                    .get(&record.id)
                    .map(Worker::snapshot)
                    .unwrap_or_default();
                WorkerView {
                    id: record.id,
                    gpu: record.gpu,
                    endpoint: record.endpoint,
                    is_active: record.is_active,
                    description: state.description,
                    progress: state.progress,
                }
            })
            .collect()
    }

    /// Cancel every run loop and wait for all of them to drain. Claims and
    /// active flags stay persisted so the next process start resumes them.
    pub async fn shutdown(&self) {
        self.ctx.shutdown.cancel();
        let mut workers = self.workers.lock().await;
        for worker in workers.values_mut() {
            worker.wait_for_exit().await;
        }
        info!("worker pool drained");
    }
}
