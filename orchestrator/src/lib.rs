//! Remote synthesis orchestrator.
//!
//! Accepts an uploaded Quartus project, unpacks it into a private sandbox,
//! runs the toolchain stages one after another while streaming their output,
//! and publishes the resulting bitstream archive. Device scanning and
//! programming reuse the same command runner without a pipeline.

pub mod error;
pub mod job;
pub mod operations;
pub mod packager;
pub mod pipeline;
pub mod protocol;
pub mod runner;
pub mod sandbox;
pub mod stager;
pub mod upload;

pub use config_loader::DeploymentConfig;
pub use error::{JobError, ValidationError};
pub use job::{Deadline, Job, JobStatus, Operation, StageOutcome, StageRecord};
pub use operations::{
    ListCablesRequest, Orchestrator, ProgramMode, ProgramRequest, Request, SynthesizeRequest,
};
pub use packager::{Artifact, Packager, PackagingError};
pub use pipeline::{Pipeline, PipelineError, StageFailure, StageSpec, SynthesisOptions};
pub use protocol::{Outcome, ResponseWriter};
pub use runner::{ProcessRunner, RunError, RunOutcome, Runner, ToolCommand};
pub use sandbox::{Sandbox, SandboxError};
pub use stager::{StagedProject, StagingError};
pub use upload::{Upload, UploadError, UploadSpool};
