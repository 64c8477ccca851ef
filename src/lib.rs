use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod backend;
pub mod cache;
pub mod chapters;
pub mod glossary;
pub mod job;
pub mod logging;
pub mod pool;
pub mod segment;
pub mod server;
pub mod settings;
pub mod store;
pub mod task;
pub mod translate;
pub mod worker;

pub use pool::{PoolConfig, WorkerPool};
pub use store::Store;
pub use task::TranslateTask;
pub use translate::{SegmentTranslator, TranslateConfig};
pub use worker::{Worker, WorkerConfig, WorkerContext};

use chapters::{ChapterSink, ChapterSource, FailCaseLog};

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub addr: Option<String>,
    pub data_dir: Option<String>,
    pub settings_path: Option<String>,
}

/// Wires the store, the worker pool and the operator API together and serves
/// until ctrl-c. Workers that were active when the previous process went down
/// are reattached in the background after the configured grace delay.
pub async fn run(config: Config) -> Result<()> {
    let settings_path = config.settings_path.as_deref().map(Path::new);
    let settings = settings::load_settings(settings_path)?;
    let data_dir = config
        .data_dir
        .map(PathBuf::from)
        .or_else(|| settings.data_dir.clone());
    let addr = config
        .addr
        .unwrap_or_else(|| settings.server_addr.clone());

    let store = Arc::new(match &data_dir {
        Some(dir) => Store::open(dir)?,
        None => Store::in_memory(),
    });
    let (source, sink, fail_log) = build_collaborators(data_dir.as_deref())?;

    let shutdown = CancellationToken::new();
    let ctx = WorkerContext {
        store,
        source,
        sink,
        fail_log,
        backends: worker::remote_backend_factory(),
        config: WorkerConfig {
            idle_backoff: Duration::from_secs(settings.idle_backoff_secs),
            translate: TranslateConfig {
                segment_budget: settings.segment_budget,
                max_new_tokens: settings.max_new_tokens,
            },
        },
        shutdown: shutdown.clone(),
    };
    let pool = Arc::new(WorkerPool::new(
        ctx,
        PoolConfig {
            startup_grace: Duration::from_secs(settings.startup_grace_secs),
            start_stagger: Duration::from_secs(settings.stagger_secs),
        },
    ));

    let resume_pool = pool.clone();
    tokio::spawn(async move {
        if let Err(err) = resume_pool.resume().await {
            warn!("failed to resume persisted workers: {:#}", err);
        }
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_shutdown.cancel();
        }
    });

    info!("operator API listening on {}", addr);
    server::run_server(pool.clone(), &addr, shutdown).await?;
    pool.shutdown().await;
    Ok(())
}

/// With a data dir the library and the fail-case log live on disk; without
/// one everything is memory-only and gone on exit.
fn build_collaborators(
    data_dir: Option<&Path>,
) -> Result<(
    Arc<dyn ChapterSource>,
    Arc<dyn ChapterSink>,
    Arc<dyn FailCaseLog>,
)> {
    match data_dir {
        Some(dir) => {
            let library = Arc::new(chapters::FileChapterStore::open(dir.join("library"))?);
            let fail_log = Arc::new(chapters::FileFailCaseLog::new(dir.join("fail_cases.jsonl")));
            Ok((
                library.clone() as Arc<dyn ChapterSource>,
                library as Arc<dyn ChapterSink>,
                fail_log as Arc<dyn FailCaseLog>,
            ))
        }
        None => {
            let library = Arc::new(chapters::MemChapterStore::new());
            Ok((
                library.clone() as Arc<dyn ChapterSource>,
                library as Arc<dyn ChapterSink>,
                Arc::new(chapters::MemFailCaseLog::new()) as Arc<dyn FailCaseLog>,
            ))
        }
    }
}
