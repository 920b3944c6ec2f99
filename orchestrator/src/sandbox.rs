use config_loader::deployment::UNSAFE_NAME_CHARS;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 1000;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox prefix '{prefix}' contains path or wildcard characters")]
    UnsafePrefix { prefix: String },
    #[error("sandbox base {} is not an existing directory", .base.display())]
    BaseUnavailable { base: PathBuf },
    #[error("no unused sandbox name under {} after {attempts} attempts", .base.display())]
    ExhaustedAttempts { base: PathBuf, attempts: u32 },
    #[error("failed to create sandbox {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Private working directory owned by exactly one job.
///
/// The directory tree is removed when the value is dropped, so every exit path
/// of a job releases its sandbox. Removal failures are logged, never returned.
#[derive(Debug)]
pub struct Sandbox {
    path: PathBuf,
    released: bool,
}

impl Sandbox {
    /// Creates `<base>/<prefix><random>` with owner-only permissions.
    pub fn create(base: &Path, prefix: &str, max_attempts: u32) -> Result<Self, SandboxError> {
        Self::create_with(base, prefix, max_attempts, || {
            Uuid::new_v4().simple().to_string()
        })
    }

    pub(crate) fn create_with<F>(
        base: &Path,
        prefix: &str,
        max_attempts: u32,
        mut suffix: F,
    ) -> Result<Self, SandboxError>
    where
        F: FnMut() -> String,
    {
        if prefix.contains(UNSAFE_NAME_CHARS) {
            return Err(SandboxError::UnsafePrefix {
                prefix: prefix.to_string(),
            });
        }

        if !base.is_dir() {
            return Err(SandboxError::BaseUnavailable {
                base: base.to_path_buf(),
            });
        }

        let attempts = max_attempts.max(1);
        for _ in 0..attempts {
            let candidate = base.join(format!("{}{}", prefix, suffix()));
            match create_private_dir(&candidate) {
                Ok(()) => {
                    debug!(path = %candidate.display(), "sandbox.created");
                    return Ok(Self {
                        path: candidate,
                        released: false,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => {
                    return Err(SandboxError::Io {
                        path: candidate,
                        source,
                    })
                }
            }
        }

        Err(SandboxError::ExhaustedAttempts {
            base: base.to_path_buf(),
            attempts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.path.join(relative)
    }

    /// Removes the sandbox now instead of at drop time.
    pub fn destroy(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "sandbox.removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %self.path.display(),
                error = %err,
                "failed to remove sandbox"
            ),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    fs::DirBuilder::new().create(path)
}
