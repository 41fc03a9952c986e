//! Error types for Stagehand.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("Cycle detected in stage triggers at stage {0}")]
    CycleDetected(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    // Instance errors
    #[error("Pipeline instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Job instance not found: {0}")]
    JobInstanceNotFound(String),

    #[error("Stage {stage} not found in pipeline instance {instance}")]
    StageNotFound { instance: String, stage: String },

    #[error("Pipeline instance {0} has already terminated")]
    InstanceTerminated(String),

    // Approval errors
    #[error("Stage {stage} is not ready for approval")]
    NotReady { stage: String },

    #[error("Stage {stage} does not require approval")]
    ApprovalNotRequired { stage: String },

    // Collaborator errors
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Source resolution failed: {0}")]
    SourceResolution(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error means the addressed record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::PipelineNotFound(_)
                | Error::InstanceNotFound(_)
                | Error::JobInstanceNotFound(_)
                | Error::StageNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
