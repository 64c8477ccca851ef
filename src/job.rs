use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::task::TranslateTask;

/// A queued translation task. `worker_id` is the mutual-exclusion field: at
/// most one active worker may hold it, and it is cleared whenever the owner
/// stops or crashes so the job returns to the unclaimed pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationJob {
    pub task: TranslateTask,
    pub description: String,
    pub submitter: String,
    #[serde(with = "time::serde::rfc3339")]
    pub create_at: OffsetDateTime,
    pub worker_id: Option<String>,
}

impl TranslationJob {
    pub fn new(
        task: TranslateTask,
        description: impl Into<String>,
        submitter: impl Into<String>,
    ) -> Self {
        Self {
            task,
            description: description.into(),
            submitter: submitter.into(),
            create_at: OffsetDateTime::now_utc(),
            worker_id: None,
        }
    }
}

/// Immutable archive record, written exactly once when a job leaves the live
/// queue (finished or abandoned with partial progress).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub task: TranslateTask,
    pub description: String,
    pub worker_id: String,
    pub submitter: String,
    pub total: u32,
    pub finished: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub create_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finish_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: u32,
    pub finished: u32,
}

/// Chapter counters a completed job run hands back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOutcome {
    pub total: u32,
    pub finished: u32,
}
