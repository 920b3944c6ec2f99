use crate::error::{JobError, ValidationError};
use crate::job::{Deadline, Job, Operation, StageRecord};
use crate::packager::{Artifact, Packager};
use crate::pipeline::{synthesis_stages, Pipeline, SynthesisOptions};
use crate::protocol::ResponseWriter;
use crate::runner::{ProcessRunner, RunError, Runner, ToolCommand};
use crate::sandbox::Sandbox;
use crate::stager;
use crate::upload::Upload;
use config_loader::DeploymentConfig;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::Write;
use std::str::FromStr;
use std::time::Instant;
use tracing::{info, warn};

pub const SCAN_TITLE: &str = "Scanning for Attached Devices";
pub const PROGRAM_TITLE: &str = "Downloading Bitstream";
pub const PREPARE_TITLE: &str = "Preparing to invoke Quartus Synthesis toolchain";
const PROGRAMMER: &str = "quartus_pgm";
const BITSTREAM_EXTENSIONS: &[&str] = &["sof", "pof"];

/// Programming mode accepted by the device programmer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramMode {
    /// Active serial, writes the configuration flash.
    ActiveSerial,
    Jtag,
}

impl ProgramMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramMode::ActiveSerial => "as",
            ProgramMode::Jtag => "jtag",
        }
    }
}

impl fmt::Display for ProgramMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgramMode {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "as" => Ok(ProgramMode::ActiveSerial),
            "jtag" => Ok(ProgramMode::Jtag),
            other => Err(ValidationError::InvalidMode {
                mode: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListCablesRequest {
    pub use_64bit: bool,
}

/// Mode and cable arrive as raw client strings and are validated when the
/// request is handled.
#[derive(Debug)]
pub struct ProgramRequest {
    pub bitfile: Upload,
    pub cable: String,
    pub mode: String,
    pub use_64bit: bool,
}

#[derive(Debug)]
pub struct SynthesizeRequest {
    pub zipfile: Upload,
    pub flash_name: Option<String>,
    pub use_64bit: bool,
}

#[derive(Debug)]
pub enum Request {
    ListCables(ListCablesRequest),
    Program(ProgramRequest),
    Synthesize(SynthesizeRequest),
}

impl Request {
    pub fn operation(&self) -> Operation {
        match self {
            Request::ListCables(_) => Operation::ListCables,
            Request::Program(_) => Operation::Program,
            Request::Synthesize(_) => Operation::Synthesize,
        }
    }

    fn upload_name(&self) -> Option<&str> {
        match self {
            Request::ListCables(_) => None,
            Request::Program(request) => Some(request.bitfile.declared_name()),
            Request::Synthesize(request) => Some(request.zipfile.declared_name()),
        }
    }
}

/// Serves requests against one deployment. Holds no per-job state, so a
/// shared reference can serve concurrent jobs from several threads.
#[derive(Debug)]
pub struct Orchestrator<R: Runner = ProcessRunner> {
    config: DeploymentConfig,
    runner: R,
    packager: Packager,
}

impl Orchestrator<ProcessRunner> {
    pub fn new(config: DeploymentConfig) -> Self {
        let runner = ProcessRunner::new(config.toolchain_dir.clone());
        Self::with_runner(config, runner)
    }
}

impl<R: Runner> Orchestrator<R> {
    pub fn with_runner(config: DeploymentConfig, runner: R) -> Self {
        let packager = Packager::from_config(&config);
        Self {
            config,
            runner,
            packager,
        }
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Runs `request` to completion, streaming the response into `out`.
    ///
    /// The response always ends with exactly one `success`, `RESULT:` or
    /// `error:` line. The returned job carries the terminal status.
    pub fn handle(&self, request: Request, out: &mut dyn Write) -> Job {
        let mut job = Job::new(request.operation());
        job.start(request.upload_name());
        let deadline = Deadline::new(self.config.max_request_duration);
        let mut response = ResponseWriter::new(out);
        info!(job = %job.id(), operation = %job.operation(), "job.start");

        let result = match request {
            Request::ListCables(request) => self
                .list_cables(&mut job, &request, &mut response, &deadline)
                .map(|()| None),
            Request::Program(request) => self
                .program(&mut job, request, &mut response, &deadline)
                .map(|()| None),
            Request::Synthesize(request) => self
                .synthesize(&mut job, request, &mut response, &deadline)
                .map(Some),
        };

        match result {
            Ok(artifact) => {
                match &artifact {
                    Some(artifact) => response.result(artifact.url()),
                    None => response.success(),
                }
                job.succeed(artifact);
                info!(
                    job = %job.id(),
                    stages = job.stages().len(),
                    elapsed = ?deadline.elapsed(),
                    "job.finish"
                );
            }
            Err(err) => {
                let message = err.user_message();
                response.error(&message);
                if err.is_validation() {
                    info!(job = %job.id(), code = err.code(), error = %message, "job.rejected");
                } else {
                    warn!(
                        job = %job.id(),
                        code = err.code(),
                        stage = err.stage_title().unwrap_or("-"),
                        error = %message,
                        "job.failed"
                    );
                }
                job.fail(err.code(), message);
            }
        }

        job
    }

    pub fn list_cables(
        &self,
        job: &mut Job,
        request: &ListCablesRequest,
        response: &mut ResponseWriter<'_>,
        deadline: &Deadline,
    ) -> Result<(), JobError> {
        let command = ToolCommand::new(PROGRAMMER)
            .arg("--list")
            .use_64bit(request.use_64bit);
        self.run_single(job, SCAN_TITLE, &command, "device scan failed", response, deadline)
    }

    /// Validates every field before touching the filesystem or launching the
    /// programmer.
    pub fn program(
        &self,
        job: &mut Job,
        request: ProgramRequest,
        response: &mut ResponseWriter<'_>,
        deadline: &Deadline,
    ) -> Result<(), JobError> {
        let ProgramRequest {
            bitfile,
            cable,
            mode,
            use_64bit,
        } = request;

        if !bitfile.is_genuine() {
            return Err(ValidationError::InvalidUpload {
                message: "must upload bitstream file",
            }
            .into());
        }
        let extension = bitstream_extension(bitfile.declared_name())?;
        let mode: ProgramMode = mode.parse()?;
        check_cable(&cable)?;

        let staged = tempfile::Builder::new()
            .prefix("bitfile_")
            .suffix(&format!(".{}", extension))
            .tempfile_in(&self.config.sandbox_base)
            .map_err(|source| JobError::Io {
                context: "could not stage bitstream".to_string(),
                source,
            })?
            .into_temp_path();
        fs::copy(bitfile.path(), &staged).map_err(|source| JobError::Io {
            context: "could not stage bitstream".to_string(),
            source,
        })?;
        drop(bitfile);

        let mut operation = OsString::from("P;");
        operation.push(staged.as_os_str());
        let command = ToolCommand::new(PROGRAMMER)
            .args(["-c", cable.as_str(), "-m", mode.as_str(), "-o"])
            .arg(operation)
            .use_64bit(use_64bit);

        info!(job = %job.id(), cable = %cable, mode = %mode, "program.start");
        self.run_single(
            job,
            PROGRAM_TITLE,
            &command,
            "bitstream programming failed",
            response,
            deadline,
        )
    }

    /// Stages the uploaded project in a fresh sandbox and runs the synthesis
    /// pipeline on it. The sandbox is gone when this returns.
    pub fn synthesize(
        &self,
        job: &mut Job,
        request: SynthesizeRequest,
        response: &mut ResponseWriter<'_>,
        deadline: &Deadline,
    ) -> Result<Artifact, JobError> {
        let SynthesizeRequest {
            zipfile,
            flash_name,
            use_64bit,
        } = request;

        stager::validate_upload(&zipfile)?;

        response.banner(PREPARE_TITLE);
        let sandbox = Sandbox::create(
            &self.config.sandbox_base,
            &self.config.sandbox_prefix,
            self.config.max_sandbox_attempts,
        )?;
        job.attach_sandbox(sandbox.path());

        let project = stager::stage(&sandbox, &zipfile)?;
        drop(zipfile);
        if deadline.is_expired() {
            return Err(JobError::Timeout {
                budget: deadline.budget(),
            });
        }
        for line in project.listing() {
            response.line(&line);
        }
        response.line(&format!("sandbox: {}", project.project_dir().display()));

        let options = SynthesisOptions::new(flash_name, use_64bit);
        let stages = synthesis_stages(project.project_dir(), &options);
        let artifact = Pipeline::new(&self.runner, &self.packager).run(
            job,
            sandbox,
            &project,
            &stages,
            response,
            deadline,
        )?;

        response.line("Success!");
        Ok(artifact)
    }

    fn run_single(
        &self,
        job: &mut Job,
        title: &str,
        command: &ToolCommand,
        failure_message: &'static str,
        response: &mut ResponseWriter<'_>,
        deadline: &Deadline,
    ) -> Result<(), JobError> {
        response.banner(title);
        let started = Instant::now();
        match self.runner.run(command, response, deadline) {
            Ok(outcome) => {
                job.record_stage(StageRecord::succeeded(
                    title,
                    outcome.exit_code,
                    started.elapsed(),
                ));
                Ok(())
            }
            Err(RunError::Timeout { budget }) => {
                job.record_stage(StageRecord::failed(
                    title,
                    None,
                    started.elapsed(),
                    "time limit exceeded",
                ));
                Err(JobError::Timeout { budget })
            }
            Err(source) => {
                job.record_stage(StageRecord::failed(
                    title,
                    source.exit_code(),
                    started.elapsed(),
                    source.to_string(),
                ));
                Err(JobError::Command {
                    title: title.to_string(),
                    message: failure_message,
                    source,
                })
            }
        }
    }
}

fn bitstream_extension(name: &str) -> Result<&'static str, ValidationError> {
    BITSTREAM_EXTENSIONS
        .iter()
        .copied()
        .find(|known| stager::has_extension(name, known))
        .ok_or_else(|| ValidationError::BadExtension {
            name: name.to_string(),
            message: "unrecognized file name",
        })
}

fn check_cable(cable: &str) -> Result<(), ValidationError> {
    if cable.trim().is_empty() {
        return Err(ValidationError::UnsafeName {
            field: "cable",
            reason: "must not be empty".to_string(),
        });
    }
    if cable.chars().any(char::is_control) {
        return Err(ValidationError::UnsafeName {
            field: "cable",
            reason: "contains control characters".to_string(),
        });
    }
    Ok(())
}
