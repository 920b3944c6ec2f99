use crate::error::ValidationError;
use crate::packager::Artifact;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Request kind, selected by the string-tagged `operation` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    ListCables,
    Program,
    Synthesize,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ListCables => "list-cables",
            Operation::Program => "program",
            Operation::Synthesize => "synthesize",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "list-cables" => Ok(Operation::ListCables),
            "program" => Ok(Operation::Program),
            "synthesize" => Ok(Operation::Synthesize),
            other => Err(ValidationError::UnknownOperation {
                operation: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StageOutcome {
    Succeeded,
    Failed { reason: String },
}

/// Result of one executed stage. Records are append-only and never change
/// after they are pushed onto a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    title: String,
    exit_code: Option<i32>,
    duration: Duration,
    outcome: StageOutcome,
}

impl StageRecord {
    pub fn succeeded(title: impl Into<String>, exit_code: i32, duration: Duration) -> Self {
        Self {
            title: title.into(),
            exit_code: Some(exit_code),
            duration,
            outcome: StageOutcome::Succeeded,
        }
    }

    pub fn failed(
        title: impl Into<String>,
        exit_code: Option<i32>,
        duration: Duration,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            exit_code,
            duration,
            outcome: StageOutcome::Failed {
                reason: reason.into(),
            },
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn outcome(&self) -> &StageOutcome {
        &self.outcome
    }

    pub fn is_success(&self) -> bool {
        self.outcome == StageOutcome::Succeeded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub code: &'static str,
    pub message: String,
}

/// One accepted request and everything it produced.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    id: Uuid,
    operation: Operation,
    status: JobStatus,
    upload: Option<String>,
    sandbox: Option<PathBuf>,
    stages: Vec<StageRecord>,
    artifact: Option<Artifact>,
    failure: Option<Failure>,
}

impl Job {
    pub fn new(operation: Operation) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            status: JobStatus::Pending,
            upload: None,
            sandbox: None,
            stages: Vec::new(),
            artifact: None,
            failure: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Client-declared name of the uploaded file, if the request carried one.
    pub fn upload(&self) -> Option<&str> {
        self.upload.as_deref()
    }

    /// Sandbox the job ran in. The directory itself is gone once the job ends.
    pub fn sandbox(&self) -> Option<&Path> {
        self.sandbox.as_deref()
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn stage_titles(&self) -> Vec<&str> {
        self.stages.iter().map(StageRecord::title).collect()
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub(crate) fn start(&mut self, upload: Option<&str>) {
        self.status = JobStatus::Running;
        self.upload = upload.map(str::to_string);
    }

    pub(crate) fn attach_sandbox(&mut self, path: &Path) {
        self.sandbox = Some(path.to_path_buf());
    }

    pub(crate) fn record_stage(&mut self, record: StageRecord) {
        self.stages.push(record);
    }

    pub(crate) fn succeed(&mut self, artifact: Option<Artifact>) {
        self.status = JobStatus::Succeeded;
        self.artifact = artifact;
    }

    pub(crate) fn fail(&mut self, code: &'static str, message: String) {
        self.status = JobStatus::Failed;
        self.failure = Some(Failure { code, message });
    }
}

/// Wall-clock budget shared by every stage of one request.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left, or `None` once the budget is spent.
    pub fn remaining(&self) -> Option<Duration> {
        self.budget
            .checked_sub(self.started.elapsed())
            .filter(|left| !left.is_zero())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_tags_round_trip() {
        for op in [Operation::ListCables, Operation::Program, Operation::Synthesize] {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert!(matches!(
            "erase".parse::<Operation>(),
            Err(ValidationError::UnknownOperation { .. })
        ));
    }

    #[test]
    fn job_tracks_lifecycle() {
        let mut job = Job::new(Operation::Synthesize);
        assert_eq!(job.status(), JobStatus::Pending);

        job.start(Some("proj.zip"));
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(job.upload(), Some("proj.zip"));

        job.record_stage(StageRecord::succeeded("one", 0, Duration::from_millis(5)));
        job.record_stage(StageRecord::failed(
            "two",
            Some(2),
            Duration::from_millis(5),
            "optimization failed",
        ));
        job.fail("SYNTH_NON_ZERO_EXIT", "optimization failed".to_string());

        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.stage_titles(), vec!["one", "two"]);
        assert!(job.stages()[0].is_success());
        assert_eq!(job.stages()[1].exit_code(), Some(2));
        assert_eq!(job.failure().unwrap().code, "SYNTH_NON_ZERO_EXIT");
        assert!(job.artifact().is_none());
    }

    #[test]
    fn deadline_expires() {
        let deadline = Deadline::new(Duration::from_millis(20));
        assert!(!deadline.is_expired());
        std::thread::sleep(Duration::from_millis(30));
        assert!(deadline.is_expired());
        assert!(deadline.remaining().is_none());
        assert!(Deadline::new(Duration::ZERO).is_expired());
    }

    #[test]
    fn job_serializes_for_logs() {
        let job = Job::new(Operation::ListCables);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["operation"], "list-cables");
        assert_eq!(value["status"], "pending");
    }
}
