use crate::pipeline::{PipelineError, StageFailure};
use crate::runner::RunError;
use crate::sandbox::SandboxError;
use crate::stager::StagingError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Request rejected before any sandbox is created or process launched.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unrecognized operation '{operation}'")]
    UnknownOperation { operation: String },
    #[error("{message}")]
    InvalidUpload { message: &'static str },
    #[error("{message}")]
    BadExtension { name: String, message: &'static str },
    #[error("unrecognized mode")]
    InvalidMode { mode: String },
    #[error("unusable {field}: {reason}")]
    UnsafeName { field: &'static str, reason: String },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::UnknownOperation { .. } => "SYNTH_UNKNOWN_OPERATION",
            ValidationError::InvalidUpload { .. } => "SYNTH_INVALID_UPLOAD",
            ValidationError::BadExtension { .. } => "SYNTH_BAD_EXTENSION",
            ValidationError::InvalidMode { .. } => "SYNTH_INVALID_MODE",
            ValidationError::UnsafeName { .. } => "SYNTH_UNSAFE_NAME",
        }
    }
}

/// Everything that can end a job unsuccessfully.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("could not prepare sandbox: {0}")]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("{message}: {source}")]
    Command {
        title: String,
        message: &'static str,
        #[source]
        source: RunError,
    },
    #[error("request exceeded the time limit of {}", format_budget(.budget))]
    Timeout { budget: Duration },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

pub(crate) fn format_budget(budget: &Duration) -> String {
    humantime::format_duration(*budget).to_string()
}

impl JobError {
    /// Stable machine-readable code, used in logs and the job record.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::Validation(err) => err.code(),
            JobError::Sandbox(SandboxError::UnsafePrefix { .. }) => "SYNTH_SANDBOX_SECURITY",
            JobError::Sandbox(SandboxError::ExhaustedAttempts { .. }) => "SYNTH_SANDBOX_EXHAUSTED",
            JobError::Sandbox(_) => "SYNTH_SANDBOX_IO",
            JobError::Staging(StagingError::Validation(err)) => err.code(),
            JobError::Staging(StagingError::ExtractionFailed { .. }) => "SYNTH_EXTRACTION_FAILED",
            JobError::Staging(StagingError::MissingProjectLayout { .. }) => {
                "SYNTH_MISSING_PROJECT_LAYOUT"
            }
            JobError::Pipeline(PipelineError::Stage { cause, .. }) => match cause {
                StageFailure::Run(err) => err.code(),
                StageFailure::MissingSummary { .. } => "SYNTH_MISSING_SUMMARY",
                StageFailure::MissingArtifact { .. } => "SYNTH_MISSING_ARTIFACT",
                StageFailure::ReportUnreadable { .. } => "SYNTH_REPORT_UNREADABLE",
            },
            JobError::Pipeline(PipelineError::Timeout { .. }) => "SYNTH_TIMEOUT",
            JobError::Pipeline(PipelineError::Packaging(_)) => "SYNTH_PACKAGING_FAILED",
            JobError::Command { source, .. } => source.code(),
            JobError::Timeout { .. } => "SYNTH_TIMEOUT",
            JobError::Io { .. } => "SYNTH_IO_ERROR",
        }
    }

    /// Reason shown to the client on the trailing `error:` line.
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// True when the request was refused without side effects.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            JobError::Validation(_) | JobError::Staging(StagingError::Validation(_))
        )
    }

    /// Title of the stage that failed, if the failure belongs to one.
    pub fn stage_title(&self) -> Option<&str> {
        match self {
            JobError::Pipeline(err) => err.stage_title(),
            JobError::Command { title, .. } => Some(title),
            _ => None,
        }
    }
}
