use crate::job::Deadline;
use crate::protocol::ResponseWriter;
use std::ffi::OsString;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Extra token selecting the 64-bit toolchain binaries.
pub const TOOLCHAIN_64BIT_FLAG: &str = "--64bit";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DRAIN_GRACE: Duration = Duration::from_millis(250);
const READ_BUFFER: usize = 8 * 1024;

/// A single toolchain invocation with structured arguments.
///
/// Arguments are handed to the process as separate argv entries, never through
/// a shell, so user-supplied values cannot change the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    tool: String,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    use_64bit: bool,
}

impl ToolCommand {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: Vec::new(),
            cwd: None,
            use_64bit: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn use_64bit(mut self, enabled: bool) -> Self {
        self.use_64bit = enabled;
        self
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Full argument vector; the 64-bit token always comes first.
    pub fn argv(&self) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        if self.use_64bit {
            argv.push(OsString::from(TOOLCHAIN_64BIT_FLAG));
        }
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Shell-quoted rendering, for echoing to the client and logs only.
    pub fn display(&self) -> String {
        let mut out = self.tool.clone();
        for arg in self.argv() {
            out.push(' ');
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || "'\";&|$`\\".contains(c)) {
                out.push_str(&shell_escape(&arg));
            } else {
                out.push_str(&arg);
            }
        }
        out
    }
}

fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let escaped = arg.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

/// Successful completion of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("could not launch {program}: {source}")]
    LaunchFailure {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{}", describe_exit(.code))]
    NonZeroExit { code: Option<i32> },
    #[error("command exceeded the time limit of {}", crate::error::format_budget(.budget))]
    Timeout { budget: Duration },
    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("command failed (errcode: {})", code),
        None => "command was terminated by a signal".to_string(),
    }
}

impl RunError {
    pub fn code(&self) -> &'static str {
        match self {
            RunError::LaunchFailure { .. } => "SYNTH_LAUNCH_FAILURE",
            RunError::NonZeroExit { .. } => "SYNTH_NON_ZERO_EXIT",
            RunError::Timeout { .. } => "SYNTH_TIMEOUT",
            RunError::Wait { .. } => "SYNTH_LAUNCH_FAILURE",
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunError::NonZeroExit { code } => *code,
            _ => None,
        }
    }
}

/// Executes one [`ToolCommand`], streaming its output into the response.
///
/// A single attempt is made; toolchain runs are expensive and not idempotent.
pub trait Runner: Send + Sync {
    fn run(
        &self,
        command: &ToolCommand,
        response: &mut ResponseWriter<'_>,
        deadline: &Deadline,
    ) -> Result<RunOutcome, RunError>;
}

/// Runs toolchain executables found in a fixed installation directory.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    toolchain_dir: PathBuf,
}

impl ProcessRunner {
    pub fn new(toolchain_dir: impl Into<PathBuf>) -> Self {
        Self {
            toolchain_dir: toolchain_dir.into(),
        }
    }

    pub fn toolchain_dir(&self) -> &Path {
        &self.toolchain_dir
    }

    fn build(&self, command: &ToolCommand) -> (PathBuf, Command) {
        let program = self.toolchain_dir.join(command.tool());
        let mut process = Command::new(&program);
        process.args(command.argv());
        if let Some(dir) = command.working_dir() {
            process.current_dir(dir);
        }
        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        // Own process group, so a timeout reaches quartus_map and friends too.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            process.process_group(0);
        }
        (program, process)
    }
}

impl Runner for ProcessRunner {
    fn run(
        &self,
        command: &ToolCommand,
        response: &mut ResponseWriter<'_>,
        deadline: &Deadline,
    ) -> Result<RunOutcome, RunError> {
        response.line(&command.display());

        if deadline.is_expired() {
            return Err(RunError::Timeout {
                budget: deadline.budget(),
            });
        }

        let (program, mut process) = self.build(command);
        let program_name = program.display().to_string();
        let started = Instant::now();
        let mut child = process.spawn().map_err(|source| RunError::LaunchFailure {
            program: program_name.clone(),
            source,
        })?;
        debug!(program = %program_name, pid = child.id(), "tool.spawned");

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, tx.clone()));
        }
        drop(tx);

        // Relay output until the tool exits, both pipes close, or the budget runs out.
        let mut exited = None;
        loop {
            let Some(left) = deadline.remaining() else {
                kill(&mut child, &program_name);
                return Err(RunError::Timeout {
                    budget: deadline.budget(),
                });
            };
            match rx.recv_timeout(left.min(POLL_INTERVAL)) {
                Ok(chunk) => response.chunk(&chunk),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    exited = Some(status);
                    break;
                }
                Ok(None) => {}
                Err(source) => {
                    kill(&mut child, &program_name);
                    return Err(RunError::Wait {
                        program: program_name,
                        source,
                    });
                }
            }
        }

        let status = match exited {
            // A background process (jtagd, for one) may keep the pipes open
            // long after the tool itself is gone; the readers stay detached.
            Some(status) => {
                drain(&rx, response, deadline);
                status
            }
            None => {
                for reader in readers {
                    let _ = reader.join();
                }
                let left = deadline.remaining().unwrap_or(Duration::ZERO);
                match child.wait_timeout(left) {
                    Ok(Some(status)) => status,
                    Ok(None) => {
                        kill(&mut child, &program_name);
                        return Err(RunError::Timeout {
                            budget: deadline.budget(),
                        });
                    }
                    Err(source) => {
                        kill(&mut child, &program_name);
                        return Err(RunError::Wait {
                            program: program_name,
                            source,
                        });
                    }
                }
            }
        };

        let duration = started.elapsed();
        match status.code() {
            Some(0) => {
                debug!(program = %program_name, ?duration, "tool.succeeded");
                Ok(RunOutcome {
                    exit_code: 0,
                    duration,
                })
            }
            code => {
                warn!(program = %program_name, ?code, ?duration, "tool.failed");
                Err(RunError::NonZeroExit { code })
            }
        }
    }
}

fn spawn_reader<R>(mut source: R, tx: Sender<Vec<u8>>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = [0u8; READ_BUFFER];
        loop {
            match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

/// Forwards output still queued after the tool exited, until the pipes go
/// quiet for [`DRAIN_GRACE`] or the budget runs out.
fn drain(rx: &Receiver<Vec<u8>>, response: &mut ResponseWriter<'_>, deadline: &Deadline) {
    while let Some(left) = deadline.remaining() {
        match rx.recv_timeout(left.min(DRAIN_GRACE)) {
            Ok(chunk) => response.chunk(&chunk),
            Err(_) => break,
        }
    }
}

// Reader threads are left detached: a grandchild may still hold the pipes.
fn kill(child: &mut Child, program: &str) {
    #[cfg(unix)]
    kill_group(child, program);
    if let Err(err) = child.kill() {
        if err.kind() != io::ErrorKind::InvalidInput {
            warn!(program = %program, error = %err, "failed to kill tool");
        }
    }
    let _ = child.wait();
    warn!(program = %program, "tool.killed");
}

#[cfg(unix)]
fn kill_group(child: &Child, program: &str) {
    let Ok(group) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; the group was created at spawn and
    // the child is not reaped yet, so the id cannot have been reused.
    if unsafe { libc::kill(-group, libc::SIGKILL) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(program = %program, error = %err, "failed to kill process group");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_puts_64bit_flag_first() {
        let command = ToolCommand::new("quartus_sh")
            .args(["--flow", "compile", "LogisimToplevelShell"])
            .use_64bit(true);
        let argv: Vec<String> = command
            .argv()
            .into_iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            argv,
            vec!["--64bit", "--flow", "compile", "LogisimToplevelShell"]
        );
        assert_eq!(
            ToolCommand::new("quartus_pgm").arg("--list").argv(),
            vec![OsString::from("--list")]
        );
    }

    #[test]
    fn display_quotes_only_when_needed() {
        let command = ToolCommand::new("quartus_pgm")
            .arg("-c")
            .arg("USB-Blaster [1-1]")
            .arg("-o")
            .arg("P;/tmp/bitfile_x.sof")
            .arg("it's");
        assert_eq!(
            command.display(),
            "quartus_pgm -c 'USB-Blaster [1-1]' -o 'P;/tmp/bitfile_x.sof' 'it'\\''s'"
        );
    }

    #[test]
    fn error_codes_and_messages() {
        let err = RunError::NonZeroExit { code: Some(2) };
        assert_eq!(err.code(), "SYNTH_NON_ZERO_EXIT");
        assert_eq!(err.exit_code(), Some(2));
        assert_eq!(err.to_string(), "command failed (errcode: 2)");
        assert_eq!(
            RunError::NonZeroExit { code: None }.to_string(),
            "command was terminated by a signal"
        );
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        fn install(dir: &Path, name: &str, body: &str) {
            let path = dir.join(name);
            fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }

        fn run(
            runner: &ProcessRunner,
            command: &ToolCommand,
            budget: Duration,
        ) -> (Result<RunOutcome, RunError>, String) {
            let mut out = Vec::new();
            let result = {
                let mut response = ResponseWriter::new(&mut out);
                runner.run(command, &mut response, &Deadline::new(budget))
            };
            (result, String::from_utf8(out).unwrap())
        }

        #[test]
        fn streams_stdout_and_stderr_and_honours_cwd() {
            let toolchain = tempfile::tempdir().unwrap();
            let work = tempfile::tempdir().unwrap();
            install(
                toolchain.path(),
                "quartus_sh",
                "echo \"args: $*\"\necho \"warn\" >&2\npwd",
            );

            let runner = ProcessRunner::new(toolchain.path());
            let command = ToolCommand::new("quartus_sh")
                .args(["-t", "../scripts/AlteraDownload.tcl"])
                .current_dir(work.path())
                .use_64bit(true);
            let (result, text) = run(&runner, &command, Duration::from_secs(10));

            assert_eq!(result.unwrap().exit_code, 0);
            assert!(text.starts_with("quartus_sh --64bit -t ../scripts/AlteraDownload.tcl\n"));
            assert!(text.contains("args: --64bit -t ../scripts/AlteraDownload.tcl"));
            assert!(text.contains("warn"));
            let cwd = fs::canonicalize(work.path()).unwrap();
            assert!(text.contains(&cwd.display().to_string()));
        }

        #[test]
        fn classifies_non_zero_exit() {
            let toolchain = tempfile::tempdir().unwrap();
            install(toolchain.path(), "quartus_map", "echo boom\nexit 3");

            let runner = ProcessRunner::new(toolchain.path());
            let (result, text) = run(
                &runner,
                &ToolCommand::new("quartus_map"),
                Duration::from_secs(10),
            );

            assert!(matches!(result, Err(RunError::NonZeroExit { code: Some(3) })));
            assert!(text.contains("boom"));
        }

        #[test]
        fn missing_executable_is_a_launch_failure() {
            let toolchain = tempfile::tempdir().unwrap();
            let runner = ProcessRunner::new(toolchain.path());
            let (result, _) = run(
                &runner,
                &ToolCommand::new("quartus_cpf"),
                Duration::from_secs(10),
            );
            assert!(matches!(result, Err(RunError::LaunchFailure { .. })));
        }

        #[test]
        fn hanging_tool_is_killed_at_the_deadline() {
            let toolchain = tempfile::tempdir().unwrap();
            install(toolchain.path(), "quartus_sh", "echo started\nexec sleep 30");

            let runner = ProcessRunner::new(toolchain.path());
            let started = Instant::now();
            let (result, text) = run(
                &runner,
                &ToolCommand::new("quartus_sh"),
                Duration::from_millis(500),
            );

            assert!(matches!(result, Err(RunError::Timeout { .. })));
            assert!(started.elapsed() < Duration::from_secs(10));
            assert!(text.contains("started"));
        }

        #[test]
        fn timeout_also_kills_background_children() {
            let toolchain = tempfile::tempdir().unwrap();
            let marker = toolchain.path().join("fit-finished");
            install(
                toolchain.path(),
                "quartus_sh",
                &format!(
                    "(sleep 2; touch '{}') &\necho started\nexec sleep 30",
                    marker.display()
                ),
            );

            let runner = ProcessRunner::new(toolchain.path());
            let (result, _) = run(
                &runner,
                &ToolCommand::new("quartus_sh"),
                Duration::from_millis(500),
            );

            assert!(matches!(result, Err(RunError::Timeout { .. })));
            thread::sleep(Duration::from_secs(3));
            assert!(!marker.exists());
        }

        #[test]
        fn background_child_does_not_hold_the_result() {
            let toolchain = tempfile::tempdir().unwrap();
            install(
                toolchain.path(),
                "quartus_pgm",
                "echo \"1) USB-Blaster [1-1]\"\nsleep 5 &\nexit 0",
            );

            let runner = ProcessRunner::new(toolchain.path());
            let started = Instant::now();
            let (result, text) = run(
                &runner,
                &ToolCommand::new("quartus_pgm").arg("--list"),
                Duration::from_secs(3),
            );

            assert_eq!(result.unwrap().exit_code, 0);
            assert!(started.elapsed() < Duration::from_secs(2));
            assert!(text.contains("1) USB-Blaster [1-1]"));
        }
    }
}
