use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to prepare upload spool {}: {source}", .path.display())]
    Spool {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not read uploaded file {}: {source}", .path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Directory owned by the orchestrator that received uploads are copied into.
///
/// An [`Upload`] can only be obtained from [`UploadSpool::receive`], which is
/// what makes it a genuine upload rather than an arbitrary path on disk.
#[derive(Debug, Clone)]
pub struct UploadSpool {
    dir: PathBuf,
}

impl UploadSpool {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, UploadError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| UploadError::Spool {
            path: dir.clone(),
            source,
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).map_err(|source| {
                UploadError::Spool {
                    path: dir.clone(),
                    source,
                }
            })?;
        }

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copies `source` into the spool under a fresh name. `declared_name` is the
    /// file name the client claims for it and is validated later, not here.
    pub fn receive(&self, source: &Path, declared_name: &str) -> Result<Upload, UploadError> {
        let mut reader = File::open(source).map_err(|err| UploadError::Source {
            path: source.to_path_buf(),
            source: err,
        })?;

        let mut spooled = tempfile::Builder::new()
            .prefix("upload_")
            .tempfile_in(&self.dir)
            .map_err(|err| UploadError::Spool {
                path: self.dir.clone(),
                source: err,
            })?;

        io::copy(&mut reader, spooled.as_file_mut()).map_err(|err| UploadError::Source {
            path: source.to_path_buf(),
            source: err,
        })?;

        let file = spooled.into_temp_path();
        debug!(
            declared = %declared_name,
            spooled = %file.display(),
            "upload.received"
        );

        Ok(Upload {
            file,
            declared_name: declared_name.to_string(),
            spool: self.dir.clone(),
        })
    }
}

/// A file received from a client. The spooled copy is deleted on drop.
#[derive(Debug)]
pub struct Upload {
    file: TempPath,
    declared_name: String,
    spool: PathBuf,
}

impl Upload {
    pub fn path(&self) -> &Path {
        &self.file
    }

    pub fn declared_name(&self) -> &str {
        &self.declared_name
    }

    /// The spooled file still exists as a regular file directly inside the spool.
    pub fn is_genuine(&self) -> bool {
        let Ok(meta) = fs::symlink_metadata(self.path()) else {
            return false;
        };
        meta.file_type().is_file() && self.path().parent() == Some(self.spool.as_path())
    }
}
