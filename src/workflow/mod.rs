//! Durable per-upload workflow.
//!
//! ```text
//! JobQueue ──▶ Worker ──▶ WorkflowOrchestrator ──▶ parse_document
//!    ▲                          │
//!    └── retry / dead-letter ◀──┘  StateStore: upload, workflow, stage results
//! ```
//!
//! * [`stage`]: the stage machine and its progress percentages
//! * [`records`]: upload and workflow records as persisted
//! * [`store`]: the key/value seam and an in-memory implementation
//! * [`orchestrator`]: runs one job through every stage
//! * [`queue`]: priority queue, retry policy and worker loop

pub mod orchestrator;
pub mod queue;
pub mod records;
pub mod stage;
pub mod store;

pub use orchestrator::{
    LlmModelFactory, ModelFactory, ProcessOutcome, SettingsProvider, StaticSettings, WorkflowEvent,
    WorkflowOrchestrator,
};
pub use queue::{
    handle_job, DeadLetter, JobDisposition, JobQueue, MemoryJobQueue, QueuedJob, RetryPolicy,
    Worker, WorkerConfig,
};
pub use records::{JobPayload, UploadRecord, UploadStatus, WorkflowExecution, WorkflowStatus};
pub use stage::WorkflowStage;
pub use store::{MemoryStateStore, StateStore};
