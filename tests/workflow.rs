//! Integration tests for the durable workflow: stage records, re-runs,
//! failure bookkeeping, and the queue's retry/dead-letter handling.

mod common;

use async_trait::async_trait;
use common::{po_text, small_chunk_config, MemoryFileStore, Script, ScriptedFactory};
use po_extract::config::{AiSettings, ExtractionConfig};
use po_extract::error::{ErrorClass, StoreError};
use po_extract::workflow::store::{
    get_typed, put_typed, stage_result_key, upload_key, workflow_key,
};
use po_extract::workflow::{
    handle_job, JobPayload, JobQueue, MemoryJobQueue, MemoryStateStore, ProcessOutcome, RetryPolicy,
    StateStore, StaticSettings, UploadRecord, UploadStatus, Worker, WorkerConfig, WorkflowEvent,
    WorkflowExecution, WorkflowOrchestrator, WorkflowStage, WorkflowStatus,
};
use po_extract::{AggregatedResult, PipelineError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration};

const MERCHANT: &str = "merchant-1";

fn upload(id: &str) -> UploadRecord {
    UploadRecord {
        id: id.to_string(),
        file_name: format!("{id}.txt"),
        mime_type: "text/plain".to_string(),
        file_size: 0,
        file_url: format!("mem://{id}"),
        merchant_id: MERCHANT.to_string(),
        supplier_id: None,
        workflow_id: format!("wf-{id}"),
        status: UploadStatus::Pending,
        processed_at: None,
        error_message: None,
    }
}

fn job(upload_id: &str) -> JobPayload {
    JobPayload {
        upload_id: upload_id.to_string(),
        merchant_id: MERCHANT.to_string(),
    }
}

fn settings() -> StaticSettings {
    StaticSettings::new().with(AiSettings {
        merchant_id: MERCHANT.to_string(),
        confidence_threshold: Some(0.5),
        ..Default::default()
    })
}

struct Harness {
    store: Arc<MemoryStateStore>,
    orchestrator: Arc<WorkflowOrchestrator>,
    factory: Arc<ScriptedFactory>,
}

async fn harness(uploads: &[&str], settings: StaticSettings, script: Script) -> Harness {
    let store = Arc::new(MemoryStateStore::new());
    build_harness(uploads, settings, script, store.clone(), store, small_chunk_config()).await
}

/// `store` is seeded and inspected directly; the orchestrator writes through
/// `backend`.
async fn build_harness(
    uploads: &[&str],
    settings: StaticSettings,
    script: Script,
    store: Arc<MemoryStateStore>,
    backend: Arc<dyn StateStore>,
    config: ExtractionConfig,
) -> Harness {
    let mut files = MemoryFileStore::default();
    for id in uploads {
        let record = upload(id);
        put_typed(store.as_ref(), &upload_key(id), &record).await.unwrap();
        files = files.with(&record.file_url, po_text(&format!("PO-{id}"), 40));
    }
    let factory = Arc::new(ScriptedFactory::new(script));
    let orchestrator = Arc::new(WorkflowOrchestrator::new(
        backend,
        Arc::new(files),
        Arc::new(settings),
        factory.clone(),
        config,
    ));
    Harness {
        store,
        orchestrator,
        factory,
    }
}

type WriteFilter = Box<dyn Fn(&str, &Value) -> bool + Send + Sync>;

/// Forwards to a [`MemoryStateStore`] but rejects the writes `rejects`
/// matches while `armed` is set.
struct FaultyStore {
    inner: Arc<MemoryStateStore>,
    armed: AtomicBool,
    rejects: WriteFilter,
}

impl FaultyStore {
    fn new(inner: Arc<MemoryStateStore>, rejects: WriteFilter) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(true),
            rejects,
        }
    }

    fn check(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        if self.armed.load(Ordering::SeqCst) && (self.rejects)(key, value) {
            return Err(StoreError::Unavailable(format!("write to '{key}' refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FaultyStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.check(key, &value)?;
        self.inner.put(key, value).await
    }

    async fn patch(&self, key: &str, patch: Value) -> Result<Value, StoreError> {
        self.check(key, &patch)?;
        self.inner.patch(key, patch).await
    }
}

fn has_status(value: &Value, status: &str) -> bool {
    value.get("status").and_then(Value::as_str) == Some(status)
}

async fn workflow(store: &MemoryStateStore, upload_id: &str) -> WorkflowExecution {
    get_typed(store, &workflow_key(&format!("wf-{upload_id}")))
        .await
        .unwrap()
        .unwrap()
}

async fn upload_record(store: &MemoryStateStore, upload_id: &str) -> UploadRecord {
    get_typed(store, &upload_key(upload_id)).await.unwrap().unwrap()
}

#[tokio::test]
async fn successful_run_records_every_stage_outcome() {
    let h = harness(&["u1"], settings(), Script::Echo).await;
    let mut events = h.orchestrator.subscribe();

    let outcome = h.orchestrator.process_ai_parsing(&job("u1")).await.unwrap();
    let ProcessOutcome::Completed(result) = outcome else {
        panic!("expected a completed run");
    };
    assert_eq!(result.extracted_data.line_items.len(), 40);

    let wf = workflow(&h.store, "u1").await;
    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert_eq!(wf.current_stage, WorkflowStage::Completed);
    assert_eq!(wf.progress_percent, 100);
    assert_eq!(wf.attempt, 1);
    assert!(wf.end_time.is_some());

    let up = upload_record(&h.store, "u1").await;
    assert_eq!(up.status, UploadStatus::Processed);
    assert!(up.processed_at.is_some());

    let stored: AggregatedResult = get_typed(
        h.store.as_ref(),
        &stage_result_key("wf-u1", WorkflowStage::ParsingFile),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(stored, *result);

    match events.recv().await.unwrap() {
        WorkflowEvent::Completed {
            workflow_id,
            needs_review,
            ..
        } => {
            assert_eq!(workflow_id, "wf-u1");
            assert!(!needs_review);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_delivery_of_completed_workflow_is_ignored() {
    let h = harness(&["u1"], settings(), Script::Echo).await;
    h.orchestrator.process_ai_parsing(&job("u1")).await.unwrap();
    let calls = h.factory.model.calls();

    let again = h.orchestrator.process_ai_parsing(&job("u1")).await.unwrap();
    assert_eq!(again, ProcessOutcome::AlreadyCompleted);
    assert_eq!(h.factory.model.calls(), calls, "no new extraction calls");
    assert_eq!(workflow(&h.store, "u1").await.attempt, 1);
}

#[tokio::test]
async fn missing_settings_fail_the_workflow_without_retry() {
    let h = harness(&["u1"], StaticSettings::new(), Script::Echo).await;
    let mut events = h.orchestrator.subscribe();

    let err = h.orchestrator.process_ai_parsing(&job("u1")).await.unwrap_err();
    assert!(matches!(err, PipelineError::ConfigurationMissing { .. }));
    assert!(!err.is_retryable());

    let wf = workflow(&h.store, "u1").await;
    assert_eq!(wf.status, WorkflowStatus::Failed);
    assert_eq!(wf.progress_percent, 20, "progress reached before failing is kept");
    assert!(wf.error.as_deref().unwrap_or_default().contains(MERCHANT));

    let up = upload_record(&h.store, "u1").await;
    assert_eq!(up.status, UploadStatus::Failed);
    assert!(up.error_message.is_some());

    assert!(matches!(
        events.recv().await.unwrap(),
        WorkflowEvent::Failed {
            class: ErrorClass::ConfigurationMissing,
            ..
        }
    ));
}

#[tokio::test]
async fn missing_upload_is_reported() {
    let h = harness(&[], settings(), Script::Echo).await;
    let err = h.orchestrator.process_ai_parsing(&job("ghost")).await.unwrap_err();
    assert!(matches!(err, PipelineError::UploadNotFound { .. }));
}

#[tokio::test]
async fn rerun_after_crash_overwrites_the_stage_result() {
    let h = harness(&["u1"], settings(), Script::Echo).await;

    // State left behind by a worker that died while parsing.
    let mut crashed = WorkflowExecution::new("wf-u1", "u1", MERCHANT);
    let now = chrono::Utc::now();
    crashed.begin_run(now);
    for stage in [
        WorkflowStage::DownloadingFile,
        WorkflowStage::PreparingWorkflow,
        WorkflowStage::ParsingFile,
    ] {
        crashed.advance(stage, now).unwrap();
    }
    put_typed(h.store.as_ref(), &workflow_key("wf-u1"), &crashed).await.unwrap();
    let result_key = stage_result_key("wf-u1", WorkflowStage::ParsingFile);
    h.store.put(&result_key, json!({ "partial": true })).await.unwrap();

    let outcome = h.orchestrator.process_ai_parsing(&job("u1")).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Completed(_)));

    let wf = workflow(&h.store, "u1").await;
    assert_eq!(wf.attempt, 2);
    assert_eq!(wf.status, WorkflowStatus::Completed);

    let stage_keys = h.store.keys_with_prefix("workflow:wf-u1:stage:").await;
    assert_eq!(stage_keys, vec![result_key.clone()]);
    let stored = h.store.get(&result_key).await.unwrap().unwrap();
    assert!(stored.get("partial").is_none());
    assert_eq!(stored["extracted_data"]["po_number"], "PO-u1");
}

#[tokio::test]
async fn model_outage_is_retried_then_dead_lettered() {
    let h = harness(&["u1"], settings(), Script::Down).await;
    let queue = MemoryJobQueue::new();
    let policy = RetryPolicy {
        max_attempts: 2,
        base_delay_ms: 5,
        max_delay_ms: 5,
    };

    queue.push(job("u1"), 0).await;
    let first = queue.pop().await.unwrap();
    handle_job(&h.orchestrator, &queue, &policy, first).await;
    assert!(queue.dead_letters().await.is_empty());
    assert_eq!(queue.pending().await, 1);

    sleep(Duration::from_millis(20)).await;
    let second = queue.pop().await.unwrap();
    assert_eq!(second.attempt, 2);
    handle_job(&h.orchestrator, &queue, &policy, second).await;

    let dead = queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].class, ErrorClass::TransientIo);
    assert_eq!(queue.pending().await, 0);

    let wf = workflow(&h.store, "u1").await;
    assert_eq!(wf.attempt, 2);
    assert_eq!(wf.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn configuration_errors_go_straight_to_dead_letter() {
    let h = harness(&["u1"], StaticSettings::new(), Script::Echo).await;
    let queue = MemoryJobQueue::new();
    queue.push(job("u1"), 0).await;
    let first = queue.pop().await.unwrap();
    handle_job(&h.orchestrator, &queue, &RetryPolicy::default(), first).await;

    let dead = queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.attempt, 1);
    assert_eq!(dead[0].class, ErrorClass::ConfigurationMissing);
}

#[tokio::test]
async fn worker_drains_the_queue_concurrently() {
    let ids = ["a", "b", "c", "d"];
    let h = harness(&ids, settings(), Script::Echo).await;
    let mut events = h.orchestrator.subscribe();

    let queue = Arc::new(MemoryJobQueue::new());
    for id in ids {
        queue.push(job(id), 0).await;
    }

    let worker = Worker::new(
        h.orchestrator.clone(),
        queue.clone(),
        RetryPolicy::default(),
        WorkerConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(5),
        },
    );
    let (stop, shutdown) = watch::channel(false);
    let running = tokio::spawn(async move { worker.run(shutdown).await });

    let mut completed = Vec::new();
    while completed.len() < ids.len() {
        let event = timeout(Duration::from_secs(10), events.recv()).await;
        let event = tokio_test::assert_ok!(event).unwrap();
        if let WorkflowEvent::Completed { upload_id, .. } = event {
            completed.push(upload_id);
        }
    }
    stop.send(true).unwrap();
    running.await.unwrap();

    completed.sort();
    assert_eq!(completed, vec!["a", "b", "c", "d"]);
    for id in ids {
        let wf = workflow(&h.store, id).await;
        assert_eq!(wf.status, WorkflowStatus::Completed);
        let result: AggregatedResult = get_typed(
            h.store.as_ref(),
            &stage_result_key(&format!("wf-{id}"), WorkflowStage::ParsingFile),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result.extracted_data.po_number, format!("PO-{id}"));
    }
    assert_eq!(queue.pending().await, 0);
}

#[tokio::test]
async fn failed_processed_write_leaves_a_redeliverable_run() {
    let store = Arc::new(MemoryStateStore::new());
    let faulty = Arc::new(FaultyStore::new(
        store.clone(),
        Box::new(|key, value| key.starts_with("upload:") && has_status(value, "processed")),
    ));
    let h = build_harness(
        &["u1"],
        settings(),
        Script::Echo,
        store,
        faulty.clone(),
        small_chunk_config(),
    )
    .await;

    let err = h.orchestrator.process_ai_parsing(&job("u1")).await.unwrap_err();
    assert!(matches!(err, PipelineError::Store(_)));
    assert!(err.is_retryable());
    let wf = workflow(&h.store, "u1").await;
    assert_eq!(wf.status, WorkflowStatus::Failed);
    assert_eq!(wf.current_stage, WorkflowStage::Failed);
    assert_eq!(upload_record(&h.store, "u1").await.status, UploadStatus::Failed);

    faulty.armed.store(false, Ordering::SeqCst);
    let outcome = h.orchestrator.process_ai_parsing(&job("u1")).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Completed(_)));
    let wf = workflow(&h.store, "u1").await;
    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert_eq!(wf.attempt, 2);
    let up = upload_record(&h.store, "u1").await;
    assert_eq!(up.status, UploadStatus::Processed);
    assert!(up.error_message.is_none());
}

#[tokio::test]
async fn failed_completed_write_leaves_a_redeliverable_run() {
    let store = Arc::new(MemoryStateStore::new());
    let faulty = Arc::new(FaultyStore::new(
        store.clone(),
        Box::new(|key, value| key.starts_with("workflow:") && has_status(value, "completed")),
    ));
    let h = build_harness(
        &["u1"],
        settings(),
        Script::Echo,
        store,
        faulty.clone(),
        small_chunk_config(),
    )
    .await;

    h.orchestrator.process_ai_parsing(&job("u1")).await.unwrap_err();
    let wf = workflow(&h.store, "u1").await;
    assert_eq!(wf.status, WorkflowStatus::Failed);
    assert_eq!(upload_record(&h.store, "u1").await.status, UploadStatus::Failed);

    faulty.armed.store(false, Ordering::SeqCst);
    let outcome = h.orchestrator.process_ai_parsing(&job("u1")).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Completed(_)));
    assert_eq!(upload_record(&h.store, "u1").await.status, UploadStatus::Processed);
}

#[tokio::test]
async fn parse_over_budget_fails_with_timeout() {
    let store = Arc::new(MemoryStateStore::new());
    let config = ExtractionConfig::builder()
        .max_chunk_chars(1_000)
        .min_chunk_chars(200)
        .overlap_chars(100)
        .max_retries(0)
        .parse_timeout_secs(1)
        .build()
        .unwrap();
    let h = build_harness(&["u1"], settings(), Script::Stall, store.clone(), store, config).await;
    let mut events = h.orchestrator.subscribe();

    let run = timeout(Duration::from_secs(10), h.orchestrator.process_ai_parsing(&job("u1"))).await;
    let err = tokio_test::assert_ok!(run).unwrap_err();
    assert!(matches!(err, PipelineError::ParseTimeout { secs: 1 }));
    assert!(err.is_retryable());

    let wf = workflow(&h.store, "u1").await;
    assert_eq!(wf.status, WorkflowStatus::Failed);
    assert_eq!(wf.progress_percent, 30);
    assert!(wf.error.as_deref().unwrap_or_default().contains("timed out"));

    let up = upload_record(&h.store, "u1").await;
    assert_eq!(up.status, UploadStatus::Failed);
    assert!(up.error_message.unwrap_or_default().contains("timed out"));

    assert!(matches!(
        events.recv().await.unwrap(),
        WorkflowEvent::Failed {
            class: ErrorClass::Timeout,
            ..
        }
    ));
}

#[tokio::test]
async fn failure_bookkeeping_errors_do_not_mask_the_cause() {
    let store = Arc::new(MemoryStateStore::new());
    let faulty = Arc::new(FaultyStore::new(
        store.clone(),
        Box::new(|_, value| has_status(value, "failed")),
    ));
    let h = build_harness(
        &["u1"],
        StaticSettings::new(),
        Script::Echo,
        store,
        faulty,
        small_chunk_config(),
    )
    .await;

    let err = h.orchestrator.process_ai_parsing(&job("u1")).await.unwrap_err();
    assert!(matches!(err, PipelineError::ConfigurationMissing { .. }));

    // Neither failure write landed; the records show the last good state.
    let wf = workflow(&h.store, "u1").await;
    assert_eq!(wf.status, WorkflowStatus::Processing);
    assert_eq!(wf.current_stage, WorkflowStage::PreparingWorkflow);
    assert_eq!(upload_record(&h.store, "u1").await.status, UploadStatus::Processing);
}

#[tokio::test]
async fn parse_runs_as_a_spawned_task() {
    let h = harness(&["u1"], settings(), Script::Echo).await;
    let orchestrator = h.orchestrator.clone();
    let handle = tokio::spawn(async move { orchestrator.process_ai_parsing(&job("u1")).await });
    let outcome = handle.await.unwrap().unwrap();
    let ProcessOutcome::Completed(result) = outcome else {
        panic!("expected a completed run");
    };
    assert!(result.metadata.chunking.chunk_count > 1);
    assert_eq!(result.extracted_data.po_number, "PO-u1");
}
