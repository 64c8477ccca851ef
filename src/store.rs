//! Durable queue and worker-registry state. Everything lives behind a single
//! async mutex, which makes the claim operation a compare-and-set: concurrent
//! workers polling simultaneously can never end up owning the same job.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::job::{JobOutcome, JobResult, TranslationJob};
use crate::task::TranslateTask;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub gpu: String,
    pub endpoint: String,
    pub is_active: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    jobs: Vec<TranslationJob>,
    results: Vec<JobResult>,
    workers: Vec<WorkerRecord>,
}

const JOBS_FILE: &str = "jobs.json";
const RESULTS_FILE: &str = "results.json";
const WORKERS_FILE: &str = "workers.json";

pub struct Store {
    state: Mutex<StoreState>,
    data_dir: Option<PathBuf>,
}

impl Store {
    /// State is lost on drop; used by tests and data-dir-less runs.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            data_dir: None,
        }
    }

    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
        let state = StoreState {
            jobs: read_file(&data_dir, JOBS_FILE)?,
            results: read_file(&data_dir, RESULTS_FILE)?,
            workers: read_file(&data_dir, WORKERS_FILE)?,
        };
        Ok(Self {
            state: Mutex::new(state),
            data_dir: Some(data_dir),
        })
    }

    /// Queue a new job. Resubmitting an identical task locator is rejected so
    /// the backlog stays idempotent.
    pub async fn submit(&self, job: TranslationJob) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.jobs.iter().any(|existing| existing.task == job.task) {
            return Err(anyhow!("job already queued: {}", job.task));
        }
        state.jobs.push(job);
        self.persist(JOBS_FILE, &state.jobs)
    }

    /// Idempotent claim: a worker re-entering after a restart gets the job it
    /// already owns back; otherwise the first unclaimed job is assigned
    /// atomically; an empty backlog yields `None`.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<TranslationJob>> {
        let mut state = self.state.lock().await;
        if let Some(job) = state
            .jobs
            .iter()
            .find(|job| job.worker_id.as_deref() == Some(worker_id))
        {
            return Ok(Some(job.clone()));
        }
        let Some(job) = state.jobs.iter_mut().find(|job| job.worker_id.is_none()) else {
            return Ok(None);
        };
        job.worker_id = Some(worker_id.to_string());
        let claimed = job.clone();
        self.persist(JOBS_FILE, &state.jobs)?;
        Ok(Some(claimed))
    }

    /// Return every job held by `worker_id` to the unclaimed pool.
    pub async fn release(&self, worker_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut changed = false;
        for job in state
            .jobs
            .iter_mut()
            .filter(|job| job.worker_id.as_deref() == Some(worker_id))
        {
            job.worker_id = None;
            changed = true;
        }
        if changed {
            self.persist(JOBS_FILE, &state.jobs)?;
        }
        Ok(())
    }

    /// Remove the job from the live queue and archive its result.
    pub async fn complete(&self, job: &TranslationJob, outcome: JobOutcome) -> Result<JobResult> {
        let mut state = self.state.lock().await;
        state.jobs.retain(|existing| existing.task != job.task);
        let result = JobResult {
            task: job.task.clone(),
            description: job.description.clone(),
            worker_id: job.worker_id.clone().unwrap_or_default(),
            submitter: job.submitter.clone(),
            total: outcome.total,
            finished: outcome.finished,
            create_at: job.create_at,
            finish_at: OffsetDateTime::now_utc(),
        };
        state.results.push(result.clone());
        self.persist(JOBS_FILE, &state.jobs)?;
        self.persist(RESULTS_FILE, &state.results)?;
        Ok(result)
    }

    /// Operator deletion; a job currently claimed by a worker is protected.
    pub async fn delete_job(&self, task: &TranslateTask) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.iter().find(|job| &job.task == task) else {
            return Err(anyhow!("job not found: {}", task));
        };
        if let Some(worker_id) = &job.worker_id {
            return Err(anyhow!("job {} is claimed by worker {}", task, worker_id));
        }
        state.jobs.retain(|job| &job.task != task);
        self.persist(JOBS_FILE, &state.jobs)
    }

    pub async fn jobs(&self) -> Vec<TranslationJob> {
        self.state.lock().await.jobs.clone()
    }

    pub async fn results(&self) -> Vec<JobResult> {
        self.state.lock().await.results.clone()
    }

    pub async fn create_worker(&self, record: WorkerRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.workers.iter().any(|worker| worker.id == record.id) {
            return Err(anyhow!("worker already registered: {}", record.id));
        }
        state.workers.push(record);
        self.persist(WORKERS_FILE, &state.workers)
    }

    pub async fn workers(&self) -> Vec<WorkerRecord> {
        self.state.lock().await.workers.clone()
    }

    pub async fn worker(&self, id: &str) -> Option<WorkerRecord> {
        self.state
            .lock()
            .await
            .workers
            .iter()
            .find(|worker| worker.id == id)
            .cloned()
    }

    pub async fn set_worker_active(&self, id: &str, active: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let worker = state
            .workers
            .iter_mut()
            .find(|worker| worker.id == id)
            .ok_or_else(|| anyhow!("worker not found: {}", id))?;
        worker.is_active = active;
        self.persist(WORKERS_FILE, &state.workers)
    }

    pub async fn delete_worker(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.workers.iter().any(|worker| worker.id == id) {
            return Err(anyhow!("worker not found: {}", id));
        }
        state.workers.retain(|worker| worker.id != id);
        self.persist(WORKERS_FILE, &state.workers)
    }

    fn persist<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let path = dir.join(name);
        let content = serde_json::to_string_pretty(value)?;
        fs::write(&path, content)
            .with_context(|| format!("failed to write store file: {}", path.display()))
    }
}

fn read_file<T: DeserializeOwned + Default>(dir: &Path, name: &str) -> Result<T> {
    let path = dir.join(name);
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read store file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse store file: {}", path.display()))
}
