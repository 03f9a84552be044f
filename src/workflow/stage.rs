//! Workflow stage machine.
//!
//! ```text
//! queued ─▶ downloading_file ─▶ preparing_workflow ─▶ parsing_file ─▶ completed
//!                                      │  analyzing  │
//!            any non-terminal stage ──────────────────────────▶ failed
//! ```
//!
//! Stages are ranked; a transition may only move to an equal or higher
//! rank, so a stage is never re-entered once a later one was recorded.
//! `preparing_workflow` and `analyzing` share a rank: image uploads pass
//! through `analyzing` while the vision model transcribes them.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Queued,
    DownloadingFile,
    PreparingWorkflow,
    Analyzing,
    ParsingFile,
    Completed,
    Failed,
}

impl WorkflowStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStage::Queued => "queued",
            WorkflowStage::DownloadingFile => "downloading_file",
            WorkflowStage::PreparingWorkflow => "preparing_workflow",
            WorkflowStage::Analyzing => "analyzing",
            WorkflowStage::ParsingFile => "parsing_file",
            WorkflowStage::Completed => "completed",
            WorkflowStage::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            WorkflowStage::Queued => 0,
            WorkflowStage::DownloadingFile => 1,
            WorkflowStage::PreparingWorkflow | WorkflowStage::Analyzing => 2,
            WorkflowStage::ParsingFile => 3,
            WorkflowStage::Completed => 4,
            WorkflowStage::Failed => 5,
        }
    }

    /// Progress recorded when the stage begins. `None` for `failed`, which
    /// keeps whatever progress was reached.
    pub fn progress_percent(&self) -> Option<u8> {
        match self {
            WorkflowStage::Queued => Some(0),
            WorkflowStage::DownloadingFile => Some(10),
            WorkflowStage::PreparingWorkflow | WorkflowStage::Analyzing => Some(20),
            WorkflowStage::ParsingFile => Some(30),
            WorkflowStage::Completed => Some(100),
            WorkflowStage::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStage::Completed | WorkflowStage::Failed)
    }

    /// Whether a run at `self` may record `next`.
    pub fn can_transition_to(&self, next: WorkflowStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == WorkflowStage::Failed || next.rank() >= self.rank()
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
