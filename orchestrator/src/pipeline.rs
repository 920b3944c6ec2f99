use crate::job::{Deadline, Job, StageRecord};
use crate::packager::{Artifact, Packager, PackagingError};
use crate::protocol::ResponseWriter;
use crate::runner::{RunError, Runner, ToolCommand};
use crate::sandbox::Sandbox;
use crate::stager::{StagedProject, SCRIPTS_DIR, SETUP_SCRIPT};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Top-level entity every uploaded project is built around.
pub const TOPLEVEL: &str = "LogisimToplevelShell";
pub const SUMMARY_BANNER: &str = "Summary of Fit Results";
pub const RESULTS_BANNER: &str = "Preparing Results";

static FLASH_NAME_UNSAFE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9]").expect("static pattern"));

#[derive(Debug, Error)]
pub enum StageFailure {
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("summary report {} was not produced", .path.display())]
    MissingSummary { path: PathBuf },
    #[error("expected output {} was not produced", .path.display())]
    MissingArtifact { path: PathBuf },
    #[error("could not read report {}: {source}", .path.display())]
    ReportUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{message}: {cause}")]
    Stage {
        title: String,
        message: String,
        #[source]
        cause: StageFailure,
    },
    #[error("time limit of {} exceeded during \"{stage}\"", crate::error::format_budget(.budget))]
    Timeout { stage: String, budget: Duration },
    #[error("could not package results: {0}")]
    Packaging(#[from] PackagingError),
}

impl PipelineError {
    pub fn stage_title(&self) -> Option<&str> {
        match self {
            PipelineError::Stage { title, .. } => Some(title),
            PipelineError::Timeout { stage, .. } => Some(stage),
            PipelineError::Packaging(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Report {
    title: String,
    path: PathBuf,
}

/// One step of a pipeline. Report and output paths are relative to the
/// command's working directory.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub title: String,
    pub command: ToolCommand,
    pub failure_message: String,
    report: Option<Report>,
    produces: Vec<PathBuf>,
}

impl StageSpec {
    pub fn new(
        title: impl Into<String>,
        command: ToolCommand,
        failure_message: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            command,
            failure_message: failure_message.into(),
            report: None,
            produces: Vec::new(),
        }
    }

    /// Relays `path` under its own banner once the stage succeeds.
    pub fn with_report(mut self, title: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.report = Some(Report {
            title: title.into(),
            path: path.into(),
        });
        self
    }

    /// Declares a file the stage must leave behind.
    pub fn producing(mut self, path: impl Into<PathBuf>) -> Self {
        self.produces.push(path.into());
        self
    }

    pub fn report_path(&self) -> Option<&Path> {
        self.report.as_ref().map(|report| report.path.as_path())
    }

    pub fn produced(&self) -> &[PathBuf] {
        &self.produces
    }

    fn resolve(&self, relative: &Path) -> PathBuf {
        match self.command.working_dir() {
            Some(dir) => dir.join(relative),
            None => relative.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynthesisOptions {
    pub flash_name: Option<String>,
    pub use_64bit: bool,
}

impl SynthesisOptions {
    /// An empty flash name means no conversion stage.
    pub fn new(flash_name: Option<String>, use_64bit: bool) -> Self {
        Self {
            flash_name: flash_name.filter(|name| !name.is_empty()),
            use_64bit,
        }
    }
}

/// Replaces every character outside `[A-Za-z0-9]` with `_`.
pub fn sanitize_flash_name(name: &str) -> String {
    FLASH_NAME_UNSAFE.replace_all(name, "_").into_owned()
}

/// Canonical Quartus stages for a project staged at `project_dir`.
pub fn synthesis_stages(project_dir: &Path, options: &SynthesisOptions) -> Vec<StageSpec> {
    let tool = |name: &str| {
        ToolCommand::new(name)
            .current_dir(project_dir)
            .use_64bit(options.use_64bit)
    };
    let setup_script = format!("../{}/{}", SCRIPTS_DIR, SETUP_SCRIPT);

    let mut stages = vec![
        StageSpec::new(
            "Creating Quartus Project",
            tool("quartus_sh").args(["-t", setup_script.as_str()]),
            "project setup script failed",
        ),
        StageSpec::new(
            "Optimizing for Minimal Area",
            tool("quartus_map").args([TOPLEVEL, "--optimize=area"]),
            "optimization failed",
        ),
        StageSpec::new(
            "Synthesizing (may take a while)",
            tool("quartus_sh").args(["--flow", "compile", TOPLEVEL]),
            "synthesis failed",
        )
        .with_report(SUMMARY_BANNER, format!("{}.fit.summary", TOPLEVEL)),
    ];

    if let Some(flash) = &options.flash_name {
        let sof = format!("{}.sof", TOPLEVEL);
        let pof = format!("{}.pof", TOPLEVEL);
        stages.push(
            StageSpec::new(
                "Converting JTAG (.sof) to Flash (.pof) bitstream format",
                tool("quartus_cpf").args([
                    "-c".to_string(),
                    "-d".to_string(),
                    sanitize_flash_name(flash),
                    sof,
                    pof.clone(),
                ]),
                "bitstream conversion failed",
            )
            .producing(pof),
        );
    }

    stages
}

/// Runs stages in order, stopping at the first failure, then packages the
/// project directory.
pub struct Pipeline<'a, R: Runner + ?Sized> {
    runner: &'a R,
    packager: &'a Packager,
}

impl<'a, R: Runner + ?Sized> Pipeline<'a, R> {
    pub fn new(runner: &'a R, packager: &'a Packager) -> Self {
        Self { runner, packager }
    }

    /// Takes ownership of `sandbox`; it is removed before this returns, on
    /// every path.
    pub fn run(
        &self,
        job: &mut Job,
        sandbox: Sandbox,
        project: &StagedProject,
        stages: &[StageSpec],
        response: &mut ResponseWriter<'_>,
        deadline: &Deadline,
    ) -> Result<Artifact, PipelineError> {
        for stage in stages {
            self.run_stage(job, stage, response, deadline)?;
        }

        if deadline.is_expired() {
            return Err(PipelineError::Timeout {
                stage: RESULTS_BANNER.to_string(),
                budget: deadline.budget(),
            });
        }
        response.banner(RESULTS_BANNER);
        let artifact = self
            .packager
            .package(project.root(), project.project_subdir())?;
        sandbox.destroy();
        Ok(artifact)
    }

    fn run_stage(
        &self,
        job: &mut Job,
        stage: &StageSpec,
        response: &mut ResponseWriter<'_>,
        deadline: &Deadline,
    ) -> Result<(), PipelineError> {
        if deadline.is_expired() {
            return Err(PipelineError::Timeout {
                stage: stage.title.clone(),
                budget: deadline.budget(),
            });
        }

        response.banner(&stage.title);
        info!(job = %job.id(), stage = %stage.title, "stage.start");
        let started = Instant::now();

        let cause = match self.runner.run(&stage.command, response, deadline) {
            Ok(outcome) => match check_outputs(stage, response) {
                Ok(()) => {
                    info!(job = %job.id(), stage = %stage.title, duration = ?outcome.duration, "stage.succeeded");
                    job.record_stage(StageRecord::succeeded(
                        &stage.title,
                        outcome.exit_code,
                        started.elapsed(),
                    ));
                    return Ok(());
                }
                Err(cause) => {
                    job.record_stage(StageRecord::failed(
                        &stage.title,
                        Some(outcome.exit_code),
                        started.elapsed(),
                        cause.to_string(),
                    ));
                    cause
                }
            },
            Err(RunError::Timeout { budget }) => {
                warn!(job = %job.id(), stage = %stage.title, "stage.timeout");
                job.record_stage(StageRecord::failed(
                    &stage.title,
                    None,
                    started.elapsed(),
                    "time limit exceeded",
                ));
                return Err(PipelineError::Timeout {
                    stage: stage.title.clone(),
                    budget,
                });
            }
            Err(err) => {
                job.record_stage(StageRecord::failed(
                    &stage.title,
                    err.exit_code(),
                    started.elapsed(),
                    err.to_string(),
                ));
                StageFailure::Run(err)
            }
        };

        warn!(job = %job.id(), stage = %stage.title, error = %cause, "stage.failed");
        Err(PipelineError::Stage {
            title: stage.title.clone(),
            message: stage.failure_message.clone(),
            cause,
        })
    }
}

fn check_outputs(stage: &StageSpec, response: &mut ResponseWriter<'_>) -> Result<(), StageFailure> {
    for produced in &stage.produces {
        let path = stage.resolve(produced);
        if !path.is_file() {
            return Err(StageFailure::MissingArtifact { path });
        }
    }

    if let Some(report) = &stage.report {
        let path = stage.resolve(&report.path);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StageFailure::MissingSummary { path });
            }
            Err(source) => return Err(StageFailure::ReportUnreadable { path, source }),
        };
        response.banner(&report.title);
        response.chunk(&body);
        response.line("");
    }

    Ok(())
}
