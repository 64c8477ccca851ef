use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;

use crate::job::{JobResult, TranslationJob};

#[derive(Debug, Deserialize)]
pub(crate) struct SubmitJobRequest {
    pub(crate) task: String,
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[serde(default)]
    pub(crate) submitter: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeleteJobQuery {
    pub(crate) task: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateWorkerRequest {
    pub(crate) gpu: String,
    pub(crate) endpoint: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct JobView {
    pub(crate) task: String,
    pub(crate) description: String,
    pub(crate) submitter: String,
    pub(crate) create_at: String,
    pub(crate) worker_id: Option<String>,
}

impl From<&TranslationJob> for JobView {
    fn from(job: &TranslationJob) -> Self {
        Self {
            task: job.task.to_string(),
            description: job.description.clone(),
            submitter: job.submitter.clone(),
            create_at: job.create_at.format(&Rfc3339).unwrap_or_default(),
            worker_id: job.worker_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct JobResultView {
    pub(crate) task: String,
    pub(crate) description: String,
    pub(crate) worker_id: String,
    pub(crate) submitter: String,
    pub(crate) total: u32,
    pub(crate) finished: u32,
    pub(crate) create_at: String,
    pub(crate) finish_at: String,
}

impl From<&JobResult> for JobResultView {
    fn from(result: &JobResult) -> Self {
        Self {
            task: result.task.to_string(),
            description: result.description.clone(),
            worker_id: result.worker_id.clone(),
            submitter: result.submitter.clone(),
            total: result.total,
            finished: result.finished,
            create_at: result.create_at.format(&Rfc3339).unwrap_or_default(),
            finish_at: result.finish_at.format(&Rfc3339).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    pub(crate) error: String,
}
