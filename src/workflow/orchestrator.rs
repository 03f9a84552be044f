//! Drive one upload from `queued` to `completed` or `failed`.
//!
//! [`WorkflowOrchestrator::process_ai_parsing`] is the job handler. Each
//! stage is persisted before it begins, so a worker that crashes leaves a
//! record of how far it got; the queue's next delivery starts a fresh run
//! and overwrites the stage result. Errors are recorded on the workflow and
//! upload (best effort) and then returned unchanged, so the queue transport
//! can apply its retry policy.

use crate::config::{AiSettings, ExtractionConfig};
use crate::error::{ErrorClass, PipelineError};
use crate::output::AggregatedResult;
use crate::parse::parse_document;
use crate::pipeline::decode::{DocumentDecoder, DocumentKind, StandardDecoder};
use crate::pipeline::input::{FileStore, RawDocument};
use crate::pipeline::llm::{resolve_provider, ExtractionModel, LlmExtractionModel};
use crate::progress::{NoopProgressSink, ProgressSink};
use crate::workflow::records::{JobPayload, UploadRecord, UploadStatus, WorkflowExecution};
use crate::workflow::stage::WorkflowStage;
use crate::workflow::store::{
    get_typed, put_typed, stage_result_key, upload_key, workflow_key, StateStore,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tracing::{error, info, info_span, warn, Instrument};

// ── Collaborators ────────────────────────────────────────────────────────

/// Per-merchant AI settings lookup.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn ai_settings(&self, merchant_id: &str) -> Result<Option<AiSettings>, PipelineError>;
}

/// [`SettingsProvider`] over a fixed in-memory map.
#[derive(Debug, Default, Clone)]
pub struct StaticSettings {
    settings: HashMap<String, AiSettings>,
}

impl StaticSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, settings: AiSettings) -> Self {
        self.settings.insert(settings.merchant_id.clone(), settings);
        self
    }
}

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn ai_settings(&self, merchant_id: &str) -> Result<Option<AiSettings>, PipelineError> {
        Ok(self.settings.get(merchant_id).cloned())
    }
}

/// Builds the model and decoder for one merchant's configuration.
pub trait ModelFactory: Send + Sync {
    fn model(&self, config: &ExtractionConfig) -> Result<Arc<dyn ExtractionModel>, PipelineError>;

    /// Decoder for uploads. The default handles text and PDF only.
    fn decoder(
        &self,
        _config: &ExtractionConfig,
    ) -> Result<Arc<dyn DocumentDecoder>, PipelineError> {
        Ok(Arc::new(StandardDecoder::new()))
    }
}

/// [`ModelFactory`] backed by edgequake-llm providers.
#[derive(Debug, Default, Clone, Copy)]
pub struct LlmModelFactory;

impl ModelFactory for LlmModelFactory {
    fn model(&self, config: &ExtractionConfig) -> Result<Arc<dyn ExtractionModel>, PipelineError> {
        Ok(Arc::new(LlmExtractionModel::from_config(config)?))
    }

    fn decoder(
        &self,
        config: &ExtractionConfig,
    ) -> Result<Arc<dyn DocumentDecoder>, PipelineError> {
        let provider = resolve_provider(config)?;
        Ok(Arc::new(StandardDecoder::new().with_vision(provider, config.clone())))
    }
}

// ── Events and outcomes ──────────────────────────────────────────────────

/// Broadcast when a run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Completed {
        workflow_id: String,
        upload_id: String,
        confidence: f64,
        needs_review: bool,
    },
    Failed {
        workflow_id: String,
        upload_id: String,
        error: String,
        class: ErrorClass,
    },
}

/// What a job delivery did.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Completed(Box<AggregatedResult>),
    /// The workflow had already completed; the delivery was a duplicate.
    AlreadyCompleted,
}

// ── Orchestrator ─────────────────────────────────────────────────────────

pub struct WorkflowOrchestrator {
    store: Arc<dyn StateStore>,
    files: Arc<dyn FileStore>,
    settings: Arc<dyn SettingsProvider>,
    models: Arc<dyn ModelFactory>,
    progress: Arc<dyn ProgressSink>,
    base_config: ExtractionConfig,
    events: broadcast::Sender<WorkflowEvent>,
}

impl WorkflowOrchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        files: Arc<dyn FileStore>,
        settings: Arc<dyn SettingsProvider>,
        models: Arc<dyn ModelFactory>,
        base_config: ExtractionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            files,
            settings,
            models,
            progress: Arc::new(NoopProgressSink),
            base_config,
            events,
        }
    }

    /// Route parse progress events to `sink`.
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Process one AI-parsing job.
    ///
    /// # Errors
    /// Any [`PipelineError`] that ended the run. The failure has already been
    /// recorded on the workflow and upload when this returns.
    pub async fn process_ai_parsing(
        &self,
        job: &JobPayload,
    ) -> Result<ProcessOutcome, PipelineError> {
        let upload: UploadRecord = get_typed(self.store.as_ref(), &upload_key(&job.upload_id))
            .await?
            .ok_or_else(|| PipelineError::UploadNotFound {
                upload_id: job.upload_id.clone(),
            })?;

        let span = info_span!(
            "workflow",
            workflow_id = %upload.workflow_id,
            upload_id = %upload.id
        );
        self.process_upload(job, upload).instrument(span).await
    }

    async fn process_upload(
        &self,
        job: &JobPayload,
        upload: UploadRecord,
    ) -> Result<ProcessOutcome, PipelineError> {
        let wf_key = workflow_key(&upload.workflow_id);
        let mut workflow = get_typed::<WorkflowExecution>(self.store.as_ref(), &wf_key)
            .await?
            .unwrap_or_else(|| {
                WorkflowExecution::new(&upload.workflow_id, &upload.id, &job.merchant_id)
            });

        if workflow.is_completed() {
            info!("Workflow already completed; ignoring duplicate delivery");
            return Ok(ProcessOutcome::AlreadyCompleted);
        }

        workflow.begin_run(Utc::now());
        put_typed(self.store.as_ref(), &wf_key, &workflow).await?;
        info!("Run {} started", workflow.attempt);

        match self.run_stages(&mut workflow, &upload, &job.merchant_id).await {
            Ok(result) => {
                let _ = self.events.send(WorkflowEvent::Completed {
                    workflow_id: workflow.workflow_id.clone(),
                    upload_id: upload.id.clone(),
                    confidence: result.confidence,
                    needs_review: result.needs_review,
                });
                Ok(ProcessOutcome::Completed(Box::new(result)))
            }
            Err(e) => {
                warn!("Run {} failed at {}: {}", workflow.attempt, workflow.current_stage, e);
                self.record_failure(&mut workflow, &upload, &e).await;
                let _ = self.events.send(WorkflowEvent::Failed {
                    workflow_id: workflow.workflow_id.clone(),
                    upload_id: upload.id.clone(),
                    error: e.to_string(),
                    class: e.class(),
                });
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        workflow: &mut WorkflowExecution,
        upload: &UploadRecord,
        merchant_id: &str,
    ) -> Result<AggregatedResult, PipelineError> {
        // ── downloading_file ─────────────────────────────────────────────
        self.enter(workflow, WorkflowStage::DownloadingFile).await?;
        self.store
            .patch(&upload_key(&upload.id), json!({ "status": UploadStatus::Processing }))
            .await?;
        let bytes = self.files.download(&upload.file_url).await?;

        // ── preparing_workflow ───────────────────────────────────────────
        self.enter(workflow, WorkflowStage::PreparingWorkflow).await?;
        let settings = self
            .settings
            .ai_settings(merchant_id)
            .await?
            .ok_or_else(|| PipelineError::ConfigurationMissing {
                merchant_id: merchant_id.to_string(),
            })?;
        let config = self.base_config.with_settings(&settings);
        let model = self.models.model(&config)?;
        let decoder = self.models.decoder(&config)?;

        let document = RawDocument::new(&upload.file_name, &upload.mime_type, bytes);
        if DocumentKind::of(&document.mime_type) == DocumentKind::Image {
            self.enter(workflow, WorkflowStage::Analyzing).await?;
        }
        let text = decoder.decode(&document).await?;

        // ── parsing_file ─────────────────────────────────────────────────
        self.enter(workflow, WorkflowStage::ParsingFile).await?;
        let result = timeout(
            Duration::from_secs(config.parse_timeout_secs),
            parse_document(
                &text,
                &config,
                model,
                Arc::clone(&self.progress),
                Some(workflow.workflow_id.as_str()),
            ),
        )
        .await
        .map_err(|_| PipelineError::ParseTimeout {
            secs: config.parse_timeout_secs,
        })??;

        put_typed(
            self.store.as_ref(),
            &stage_result_key(&workflow.workflow_id, WorkflowStage::ParsingFile),
            &result,
        )
        .await?;

        // ── completed ────────────────────────────────────────────────────
        // The upload is marked processed before the workflow turns terminal,
        // so a failed write leaves a run the next delivery can redo.
        self.store
            .patch(
                &upload_key(&upload.id),
                json!({
                    "status": UploadStatus::Processed,
                    "processedAt": Utc::now(),
                    "errorMessage": null,
                }),
            )
            .await?;
        self.enter(workflow, WorkflowStage::Completed).await?;

        info!(
            "Workflow completed: {} line items, confidence {:.2}",
            result.extracted_data.line_items.len(),
            result.confidence
        );
        Ok(result)
    }

    /// Persist the start of `stage`. `workflow` only moves once the write
    /// succeeded.
    async fn enter(
        &self,
        workflow: &mut WorkflowExecution,
        stage: WorkflowStage,
    ) -> Result<(), PipelineError> {
        let mut next = workflow.clone();
        next.advance(stage, Utc::now())?;
        put_typed(self.store.as_ref(), &workflow_key(&next.workflow_id), &next).await?;
        *workflow = next;
        info!("Stage {} ({}%)", stage, workflow.progress_percent);
        Ok(())
    }

    /// Best-effort failure write; its own errors are logged, never raised.
    async fn record_failure(
        &self,
        workflow: &mut WorkflowExecution,
        upload: &UploadRecord,
        cause: &PipelineError,
    ) {
        let message = cause.to_string();

        match workflow.fail(&message, Utc::now()) {
            Ok(()) => {
                let key = workflow_key(&workflow.workflow_id);
                if let Err(e) = put_typed(self.store.as_ref(), &key, &*workflow).await {
                    error!("Could not record workflow failure: {}", e);
                }
            }
            Err(e) => error!("Could not mark workflow failed: {}", e),
        }

        if let Err(e) = self
            .store
            .patch(
                &upload_key(&upload.id),
                json!({ "status": UploadStatus::Failed, "errorMessage": message }),
            )
            .await
        {
            error!("Could not record upload failure: {}", e);
        }
    }
}
