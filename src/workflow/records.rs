//! Persisted records: uploads, workflow executions and job payloads.
//!
//! Records are stored as camelCase JSON so that other services reading the
//! same store (the web UI, the sync service) see the field names they
//! already use.

use crate::error::PipelineError;
use crate::workflow::stage::WorkflowStage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload of a queued AI-parsing job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub upload_id: String,
    pub merchant_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

/// An uploaded document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
    pub file_url: String,
    pub merchant_id: String,
    #[serde(default)]
    pub supplier_id: Option<String>,
    pub workflow_id: String,
    pub status: UploadStatus,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Durable state of one upload's workflow.
///
/// A workflow may run several times (queue retries); each run bumps
/// `attempt` and restarts from `queued`. Within a run, `current_stage`
/// only moves forward and `progress_percent` never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub upload_id: String,
    pub merchant_id: String,
    pub status: WorkflowStatus,
    pub current_stage: WorkflowStage,
    pub progress_percent: u8,
    pub attempt: u32,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(
        workflow_id: impl Into<String>,
        upload_id: impl Into<String>,
        merchant_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            upload_id: upload_id.into(),
            merchant_id: merchant_id.into(),
            status: WorkflowStatus::Queued,
            current_stage: WorkflowStage::Queued,
            progress_percent: 0,
            attempt: 0,
            start_time: now,
            end_time: None,
            error: None,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    /// Start a fresh run: next attempt, back to `queued` at 0%.
    pub fn begin_run(&mut self, now: DateTime<Utc>) {
        self.attempt += 1;
        self.status = WorkflowStatus::Queued;
        self.current_stage = WorkflowStage::Queued;
        self.progress_percent = 0;
        self.start_time = now;
        self.end_time = None;
        self.error = None;
        self.updated_at = now;
    }

    /// Record the start of `stage`.
    ///
    /// # Errors
    /// [`PipelineError::InvalidStageTransition`] when `stage` would move the
    /// run backwards or leave a terminal stage.
    pub fn advance(
        &mut self,
        stage: WorkflowStage,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        if !self.current_stage.can_transition_to(stage) {
            return Err(PipelineError::InvalidStageTransition {
                workflow_id: self.workflow_id.clone(),
                from: self.current_stage.to_string(),
                to: stage.to_string(),
            });
        }
        self.current_stage = stage;
        if let Some(pct) = stage.progress_percent() {
            self.progress_percent = self.progress_percent.max(pct);
        }
        self.status = match stage {
            WorkflowStage::Queued => WorkflowStatus::Queued,
            WorkflowStage::Completed => WorkflowStatus::Completed,
            WorkflowStage::Failed => WorkflowStatus::Failed,
            _ => WorkflowStatus::Processing,
        };
        if stage.is_terminal() {
            self.end_time = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Mark the run failed with `error`.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        self.advance(WorkflowStage::Failed, now)?;
        self.error = Some(error.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wf() -> WorkflowExecution {
        WorkflowExecution::new("wf-1", "up-1", "m-1")
    }

    #[test]
    fn run_progress_is_monotonic() {
        let mut w = wf();
        let now = Utc::now();
        w.begin_run(now);
        assert_eq!(w.attempt, 1);
        for stage in [
            WorkflowStage::DownloadingFile,
            WorkflowStage::PreparingWorkflow,
            WorkflowStage::Analyzing,
            WorkflowStage::ParsingFile,
        ] {
            let before = w.progress_percent;
            w.advance(stage, now).unwrap();
            assert!(w.progress_percent >= before);
            assert_eq!(w.status, WorkflowStatus::Processing);
        }
        w.advance(WorkflowStage::Completed, now).unwrap();
        assert_eq!(w.progress_percent, 100);
        assert!(w.is_completed());
        assert!(w.end_time.is_some());
    }

    #[test]
    fn backwards_move_is_rejected() {
        let mut w = wf();
        let now = Utc::now();
        w.begin_run(now);
        w.advance(WorkflowStage::ParsingFile, now).unwrap();
        let err = w.advance(WorkflowStage::DownloadingFile, now).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStageTransition { .. }));
        assert_eq!(w.current_stage, WorkflowStage::ParsingFile);
    }

    #[test]
    fn failure_keeps_progress_and_new_run_resets() {
        let mut w = wf();
        let now = Utc::now();
        w.begin_run(now);
        w.advance(WorkflowStage::ParsingFile, now).unwrap();
        w.fail("HTTP 503", now).unwrap();
        assert_eq!(w.status, WorkflowStatus::Failed);
        assert_eq!(w.progress_percent, 30);
        assert_eq!(w.error.as_deref(), Some("HTTP 503"));

        w.begin_run(now);
        assert_eq!(w.attempt, 2);
        assert_eq!(w.progress_percent, 0);
        assert_eq!(w.current_stage, WorkflowStage::Queued);
        assert!(w.error.is_none());
    }

    #[test]
    fn records_round_trip_as_camel_case() {
        let job: JobPayload =
            serde_json::from_str(r#"{"uploadId":"up-1","merchantId":"m-1"}"#).unwrap();
        assert_eq!(job.upload_id, "up-1");

        let v = serde_json::to_value(wf()).unwrap();
        assert_eq!(v["currentStage"], "queued");
        assert_eq!(v["progressPercent"], 0);
    }
}
