//! Cross-module scenarios: a pool-managed worker driving the queue, the
//! chapter store and a stubbed generation backend end-to-end.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use novel_translator::backend::{GenerateRequest, GenerateResponse, TranslateBackend};
use novel_translator::chapters::{MemChapterStore, MemFailCaseLog};
use novel_translator::glossary::Glossary;
use novel_translator::job::TranslationJob;
use novel_translator::pool::{PoolConfig, WorkerPool};
use novel_translator::store::Store;
use novel_translator::worker::{BackendFactory, WorkerConfig, WorkerContext};
use novel_translator::TranslateConfig;

/// Translates each line by prefixing it, one line out per line in.
struct EchoBackend;

#[async_trait]
impl TranslateBackend for EchoBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let text = request
            .prompt
            .lines()
            .map(|line| format!("译:{}", line))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(GenerateResponse { text, tokens: 8 })
    }
}

/// Never answers within the test window; used to catch a worker mid-chapter.
struct SlowBackend;

#[async_trait]
impl TranslateBackend for SlowBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        tokio::time::sleep(Duration::from_secs(300)).await;
        Ok(GenerateResponse {
            text: request.prompt,
            tokens: 8,
        })
    }
}

fn echo_factory() -> BackendFactory {
    Arc::new(|_endpoint: &str| Ok(Arc::new(EchoBackend) as Arc<dyn TranslateBackend>))
}

fn slow_factory() -> BackendFactory {
    Arc::new(|_endpoint: &str| Ok(Arc::new(SlowBackend) as Arc<dyn TranslateBackend>))
}

fn context(
    store: Arc<Store>,
    library: Arc<MemChapterStore>,
    backends: BackendFactory,
    shutdown: CancellationToken,
) -> WorkerContext {
    WorkerContext {
        store,
        source: library.clone(),
        sink: library,
        fail_log: Arc::new(MemFailCaseLog::new()),
        backends,
        config: WorkerConfig {
            idle_backoff: Duration::from_millis(20),
            translate: TranslateConfig::default(),
        },
        shutdown,
    }
}

fn pool_config() -> PoolConfig {
    PoolConfig {
        startup_grace: Duration::ZERO,
        start_stagger: Duration::ZERO,
    }
}

fn seed_novel(library: &MemChapterStore) -> Glossary {
    let glossary = Glossary::new(BTreeMap::new());
    library.insert_novel(
        "providerX",
        "novel1",
        glossary.clone(),
        vec![
            ("c1".to_string(), vec!["第一章".to_string()]),
            ("c2".to_string(), vec!["第二章".to_string()]),
        ],
    );
    glossary
}

async fn submit(store: &Store, locator: &str) {
    store
        .submit(TranslationJob::new(
            locator.parse().unwrap(),
            "integration job",
            "tester",
        ))
        .await
        .unwrap();
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn worker_translates_a_job_end_to_end() {
    let store = Arc::new(Store::in_memory());
    let library = Arc::new(MemChapterStore::new());
    seed_novel(&library);
    submit(&store, "web/providerX/novel1?start=0&end=2").await;

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(
        context(store.clone(), library.clone(), echo_factory(), shutdown),
        pool_config(),
    );
    let record = pool.create_worker("3090", "http://stub").await.unwrap();
    pool.start_worker(&record.id).await.unwrap();

    tokio::time::timeout(WAIT, async {
        while store.results().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not complete in time");
    pool.stop_worker(&record.id).await.unwrap();

    assert!(store.jobs().await.is_empty());
    let results = store.results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].total, 2);
    assert_eq!(results[0].finished, 2);
    assert_eq!(results[0].worker_id, record.id);

    for (chapter_id, translated) in [("c1", "译:第一章"), ("c2", "译:第二章")] {
        let stored = library
            .translation("providerX", "novel1", chapter_id)
            .unwrap();
        assert_eq!(stored.paragraphs, vec![translated.to_string()]);
    }
}

#[tokio::test]
async fn crashed_worker_releases_its_job_for_others() {
    let store = Arc::new(Store::in_memory());
    // No novel seeded: the glossary fetch fails outside the per-chapter
    // loop, which is fatal for the worker.
    let library = Arc::new(MemChapterStore::new());
    submit(&store, "web/providerX/novel1?start=0&end=2").await;

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(
        context(store.clone(), library, echo_factory(), shutdown),
        pool_config(),
    );
    let record = pool.create_worker("3090", "http://stub").await.unwrap();
    pool.start_worker(&record.id).await.unwrap();

    // The crash message lands in the description after the claim has been
    // released and the active flag flipped, so it doubles as the signal that
    // the whole unwind is done.
    tokio::time::timeout(WAIT, async {
        loop {
            let crashed = pool.list().await.into_iter().any(|view| {
                view.id == record.id
                    && view
                        .description
                        .as_deref()
                        .is_some_and(|text| text.contains("unknown novel"))
            });
            if crashed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker did not crash in time");

    assert!(!store.worker(&record.id).await.unwrap().is_active);

    // The job is back in the unclaimed pool and another identity can take it.
    let jobs = store.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].worker_id.is_none());
    let reclaimed = store.claim("w2").await.unwrap().unwrap();
    assert_eq!(reclaimed.task, jobs[0].task);
}

#[tokio::test]
async fn stop_cancels_in_flight_work_and_releases_the_claim() {
    let store = Arc::new(Store::in_memory());
    let library = Arc::new(MemChapterStore::new());
    seed_novel(&library);
    submit(&store, "web/providerX/novel1?start=0&end=2").await;

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(
        context(store.clone(), library, slow_factory(), shutdown),
        pool_config(),
    );
    let record = pool.create_worker("3090", "http://stub").await.unwrap();
    pool.start_worker(&record.id).await.unwrap();

    tokio::time::timeout(WAIT, async {
        while store.jobs().await[0].worker_id.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker did not claim the job in time");

    // The backend call is still pending; stop must cancel it, and by the time
    // stop returns the claim has been released.
    pool.stop_worker(&record.id).await.unwrap();

    let jobs = store.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].worker_id.is_none());
    assert!(!store.worker(&record.id).await.unwrap().is_active);
    assert!(store.results().await.is_empty());
}

#[tokio::test]
async fn process_shutdown_keeps_the_claim_and_a_restart_resumes_it() {
    let store = Arc::new(Store::in_memory());
    let library = Arc::new(MemChapterStore::new());
    seed_novel(&library);
    submit(&store, "web/providerX/novel1?start=0&end=2").await;

    // First process: the worker claims the job but never finishes a chapter.
    let first_shutdown = CancellationToken::new();
    let first = WorkerPool::new(
        context(
            store.clone(),
            library.clone(),
            slow_factory(),
            first_shutdown,
        ),
        pool_config(),
    );
    let record = first.create_worker("3090", "http://stub").await.unwrap();
    first.start_worker(&record.id).await.unwrap();
    tokio::time::timeout(WAIT, async {
        while store.jobs().await[0].worker_id.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker did not claim the job in time");
    first.shutdown().await;

    // Suspended, not stopped: the claim and the active flag survive.
    assert_eq!(
        store.jobs().await[0].worker_id.as_deref(),
        Some(record.id.as_str())
    );
    assert!(store.worker(&record.id).await.unwrap().is_active);

    // Second process over the same store resumes the worker, which re-enters
    // its own job and finishes it.
    let second_shutdown = CancellationToken::new();
    let second = WorkerPool::new(
        context(
            store.clone(),
            library.clone(),
            echo_factory(),
            second_shutdown,
        ),
        pool_config(),
    );
    second.resume().await.unwrap();

    tokio::time::timeout(WAIT, async {
        while store.results().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("resumed worker did not complete the job in time");
    second.stop_worker(&record.id).await.unwrap();

    let results = store.results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].finished, 2);
    assert_eq!(results[0].worker_id, record.id);
    assert!(store.jobs().await.is_empty());
}

#[tokio::test]
async fn deleting_a_worker_stops_it_and_frees_its_job() {
    let store = Arc::new(Store::in_memory());
    let library = Arc::new(MemChapterStore::new());
    seed_novel(&library);
    submit(&store, "web/providerX/novel1?start=0&end=2").await;

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(
        context(store.clone(), library, slow_factory(), shutdown),
        pool_config(),
    );
    let record = pool.create_worker("3090", "http://stub").await.unwrap();
    pool.start_worker(&record.id).await.unwrap();
    tokio::time::timeout(WAIT, async {
        while store.jobs().await[0].worker_id.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker did not claim the job in time");

    pool.delete_worker(&record.id).await.unwrap();

    assert!(store.worker(&record.id).await.is_none());
    assert!(pool.list().await.is_empty());
    assert!(store.jobs().await[0].worker_id.is_none());
}
