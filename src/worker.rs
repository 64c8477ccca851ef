//! One worker drives one GPU endpoint: claim a job, walk its chapter range,
//! translate, report progress, archive, repeat. Fatal errors stop the worker
//! loudly instead of letting it hammer a broken backend; an operator has to
//! start it again.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{RemoteTranslateClient, TranslateBackend};
use crate::cache::ResultCache;
use crate::chapters::{ChapterSink, ChapterSource, FailCaseLog};
use crate::glossary::Glossary;
use crate::job::{JobOutcome, Progress, TranslationJob};
use crate::store::{Store, WorkerRecord};
use crate::translate::{ChapterRef, SegmentTranslator, TranslateConfig};

/// Label stamped on translations this pipeline produces, so chapter outlines
/// can tell them apart from other translators feeding the same store.
pub const TRANSLATOR_ID: &str = "gpu";

/// Why a run loop ended. `ProcessShutdown` leaves the claim and the active
/// flag untouched so the next process start resumes the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    StoppedByOperator,
    Crashed(String),
    ProcessShutdown,
}

/// Builds the backend client for a worker's endpoint; swapped out in tests.
pub type BackendFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn TranslateBackend>> + Send + Sync>;

pub fn remote_backend_factory() -> BackendFactory {
    Arc::new(|endpoint| {
        Ok(Arc::new(RemoteTranslateClient::new(endpoint)?) as Arc<dyn TranslateBackend>)
    })
}

/// Collaborators shared by every worker in the pool.
pub struct WorkerContext {
    pub store: Arc<Store>,
    pub source: Arc<dyn ChapterSource>,
    pub sink: Arc<dyn ChapterSink>,
    pub fail_log: Arc<dyn FailCaseLog>,
    pub backends: BackendFactory,
    pub config: WorkerConfig,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub idle_backoff: Duration,
    pub translate: TranslateConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_backoff: Duration::from_secs(60),
            translate: TranslateConfig::default(),
        }
    }
}

/// Transient activity owned by the run loop, read-only to everyone else.
#[derive(Debug, Default, Clone)]
pub struct RunState {
    pub description: Option<String>,
    pub progress: Option<Progress>,
}

pub struct Worker {
    id: String,
    endpoint: String,
    state: Arc<StdMutex<RunState>>,
    running: Option<Running>,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<ExitReason>,
}

impl Worker {
    pub fn new(record: &WorkerRecord) -> Self {
        Self {
            id: record.id.clone(),
            endpoint: record.endpoint.clone(),
            state: Arc::new(StdMutex::new(RunState::default())),
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    pub fn snapshot(&self) -> RunState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    /// No-op when already running. Persists the active flag, then spawns the
    /// run loop on a child of the process-wide shutdown token.
    pub async fn start(&mut self, ctx: &Arc<WorkerContext>) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        ctx.store.set_worker_active(&self.id, true).await?;
        let token = ctx.shutdown.child_token();
        let run_loop = RunLoop {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            state: self.state.clone(),
            ctx: ctx.clone(),
            token: token.clone(),
        };
        let handle = tokio::spawn(run_loop.run());
        self.running = Some(Running { token, handle });
        info!("worker {} started", self.id);
        Ok(())
    }

    /// No-op when already stopped. Cancels the run loop and waits for it to
    /// unwind; once this returns, the claim has been released and no further
    /// progress will be reported.
    pub async fn stop(&mut self, ctx: &WorkerContext) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.token.cancel();
        match running.handle.await {
            Ok(reason) => info!("worker {} stopped ({:?})", self.id, reason),
            Err(join_error) => {
                // The loop died without unwinding; do its cleanup for it.
                error!("worker {} run loop panicked: {}", self.id, join_error);
                if let Err(err) = ctx.store.release(&self.id).await {
                    warn!("failed to release jobs of worker {}: {:#}", self.id, err);
                }
                if let Err(err) = ctx.store.set_worker_active(&self.id, false).await {
                    warn!("failed to deactivate worker {}: {:#}", self.id, err);
                }
                if let Ok(mut state) = self.state.lock() {
                    *state = RunState::default();
                }
            }
        }
        Ok(())
    }

    /// Process-shutdown path: the shared token is already cancelled, just
    /// wait for the loop to drain.
    pub async fn wait_for_exit(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.handle.await;
        }
    }
}

struct RunLoop {
    id: String,
    endpoint: String,
    state: Arc<StdMutex<RunState>>,
    ctx: Arc<WorkerContext>,
    token: CancellationToken,
}

impl RunLoop {
    async fn run(self) -> ExitReason {
        let reason = tokio::select! {
            _ = self.token.cancelled() => {
                if self.ctx.shutdown.is_cancelled() {
                    ExitReason::ProcessShutdown
                } else {
                    ExitReason::StoppedByOperator
                }
            }
            result = self.drive() => match result {
                Ok(never) => match never {},
                Err(err) => ExitReason::Crashed(format!("{:#}", err)),
            },
        };
        self.unwind(&reason).await;
        reason
    }

    /// Claim/translate/archive forever; only returns by failing.
    async fn drive(&self) -> Result<std::convert::Infallible> {
        let backend = (self.ctx.backends)(&self.endpoint)?;
        let translator = SegmentTranslator::new(
            backend,
            self.ctx.fail_log.clone(),
            Some(Arc::new(ResultCache::new())),
            self.ctx.config.translate,
        );
        loop {
            let Some(job) = self.ctx.store.claim(&self.id).await? else {
                info!("worker {} found no unclaimed job; backing off", self.id);
                tokio::time::sleep(self.ctx.config.idle_backoff).await;
                continue;
            };
            info!("worker {} claimed job {}", self.id, job.task);
            let outcome = self.run_job(&translator, &job).await?;
            self.ctx.store.complete(&job, outcome).await?;
            info!(
                "worker {} finished job {} ({}/{} chapters)",
                self.id, job.task, outcome.finished, outcome.total
            );
            self.set_state(None, None);
        }
    }

    async fn run_job(
        &self,
        translator: &SegmentTranslator,
        job: &TranslationJob,
    ) -> Result<JobOutcome> {
        let (provider_id, novel_id) = job.task.scope();
        self.set_state(Some(job.description.clone()), None);

        let glossary = self.ctx.source.glossary(provider_id, novel_id).await?;
        let outlines = self
            .ctx
            .source
            .translation_outlines(provider_id, novel_id, TRANSLATOR_ID)
            .await?;
        let pending = job
            .task
            .range()
            .slice(&outlines)
            .iter()
            .filter(|outline| outline.needs_translation(&glossary))
            .map(|outline| outline.chapter_id.clone())
            .collect::<Vec<_>>();

        let total = pending.len() as u32;
        let mut finished = 0u32;
        self.set_state(
            Some(job.description.clone()),
            Some(Progress { total, finished }),
        );

        for chapter_id in &pending {
            match self
                .translate_chapter(translator, job, &glossary, chapter_id)
                .await
            {
                Ok(()) => finished += 1,
                // Transient per-chapter failures are swallowed: the chapter
                // is not counted as finished and the loop moves on.
                Err(err) => warn!(
                    "worker {}: chapter {} of {} failed: {:#}",
                    self.id, chapter_id, job.task, err
                ),
            }
            self.set_state(
                Some(job.description.clone()),
                Some(Progress { total, finished }),
            );
        }
        Ok(JobOutcome { total, finished })
    }

    async fn translate_chapter(
        &self,
        translator: &SegmentTranslator,
        job: &TranslationJob,
        glossary: &Glossary,
        chapter_id: &str,
    ) -> Result<()> {
        let (provider_id, novel_id) = job.task.scope();
        let chapter = self
            .ctx
            .source
            .get_or_sync_remote(provider_id, novel_id, chapter_id, false)
            .await?;
        let translated = translator
            .translate(
                ChapterRef {
                    provider_id,
                    novel_id,
                    chapter_id,
                },
                &chapter.paragraphs,
                glossary,
            )
            .await?;
        self.ctx
            .sink
            .update_translation(
                provider_id,
                novel_id,
                chapter_id,
                TRANSLATOR_ID,
                glossary,
                &translated,
            )
            .await?;
        info!(
            "worker {} translated chapter {} ({} paragraphs)",
            self.id,
            chapter_id,
            translated.len()
        );
        Ok(())
    }

    async fn unwind(&self, reason: &ExitReason) {
        match reason {
            ExitReason::ProcessShutdown => {
                info!("worker {} suspended for process shutdown", self.id);
            }
            ExitReason::StoppedByOperator => self.cleanup(None).await,
            ExitReason::Crashed(message) => {
                error!("worker {} crashed: {}", self.id, message);
                self.cleanup(Some(message.clone())).await;
            }
        }
    }

    /// Release the claim, flip the persisted flag, clear transient state. A
    /// crash leaves its message in the description for the operator. Failures
    /// here are logged and swallowed: the loop is already unwinding.
    async fn cleanup(&self, crash_message: Option<String>) {
        if let Err(err) = self.ctx.store.release(&self.id).await {
            warn!("failed to release jobs of worker {}: {:#}", self.id, err);
        }
        if let Err(err) = self.ctx.store.set_worker_active(&self.id, false).await {
            warn!("failed to deactivate worker {}: {:#}", self.id, err);
        }
        self.set_state(crash_message, None);
    }

    fn set_state(&self, description: Option<String>, progress: Option<Progress>) {
        if let Ok(mut state) = self.state.lock() {
            state.description = description;
            state.progress = progress;
        }
    }
}
