use chrono::Utc;
use config_loader::DeploymentConfig;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const ARTIFACT_PREFIX: &str = "bitstream-";
pub const ARTIFACT_EXTENSION: &str = "zip";
const MAX_NAME_ATTEMPTS: u32 = 100;

/// A published result archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    name: String,
    path: PathBuf,
    url: String,
}

impl Artifact {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// URL path a client can fetch the artifact from without further lookups.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("nothing to package: {} is not a directory", .path.display())]
    MissingSource { path: PathBuf },
    #[error("could not prepare results directory {}: {source}", .path.display())]
    ResultsDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no unused artifact name after {attempts} attempts")]
    NameExhausted { attempts: u32 },
    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("failed to walk project directory: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Writes result archives into the public results area.
#[derive(Debug, Clone)]
pub struct Packager {
    results_dir: PathBuf,
    url_prefix: String,
}

impl Packager {
    /// `url_prefix` is the URL path of `results_dir` and must end in `/`.
    pub fn new(results_dir: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            results_dir: results_dir.into(),
            url_prefix: url_prefix.into(),
        }
    }

    pub fn from_config(config: &DeploymentConfig) -> Self {
        Self::new(config.results_dir(), config.results_url_prefix())
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Archives `<root>/<subdir>` into a new, uniquely named artifact.
    ///
    /// Entries are stored as `<subdir>/...`. A partially written artifact is
    /// removed before the error is returned.
    pub fn package(&self, root: &Path, subdir: &str) -> Result<Artifact, PackagingError> {
        let source = root.join(subdir);
        if !source.is_dir() {
            return Err(PackagingError::MissingSource { path: source });
        }

        fs::create_dir_all(&self.results_dir).map_err(|source| PackagingError::ResultsDir {
            path: self.results_dir.clone(),
            source,
        })?;

        let (name, path, file) = self.reserve(&timestamp())?;
        if let Err(err) = write_archive(file, root, &source, &path) {
            if let Err(cleanup) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %cleanup, "failed to remove partial artifact");
            }
            return Err(err);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).map_err(|source| {
                PackagingError::Io {
                    path: path.clone(),
                    source,
                }
            })?;
        }

        let url = format!("{}{}", self.url_prefix, name);
        info!(artifact = %name, url = %url, "artifact.created");
        Ok(Artifact { name, path, url })
    }

    /// Claims a fresh artifact file. Creation is exclusive, so two jobs
    /// finishing in the same instant still get different names.
    fn reserve(&self, stamp: &str) -> Result<(String, PathBuf, File), PackagingError> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = artifact_name(stamp, attempt);
            let path = self.results_dir.join(&name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((name, path, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(PackagingError::Io { path, source }),
            }
        }
        Err(PackagingError::NameExhausted {
            attempts: MAX_NAME_ATTEMPTS,
        })
    }
}

fn timestamp() -> String {
    let now = Utc::now();
    format!("{}{:09}", now.timestamp(), now.timestamp_subsec_nanos())
}

fn artifact_name(stamp: &str, attempt: u32) -> String {
    if attempt == 0 {
        format!("{}{}.{}", ARTIFACT_PREFIX, stamp, ARTIFACT_EXTENSION)
    } else {
        format!("{}{}-{}.{}", ARTIFACT_PREFIX, stamp, attempt, ARTIFACT_EXTENSION)
    }
}

fn write_archive(
    file: File,
    root: &Path,
    source: &Path,
    target: &Path,
) -> Result<(), PackagingError> {
    let io_err = |source: io::Error| PackagingError::Io {
        path: target.to_path_buf(),
        source,
    };

    let mut writer = ZipWriter::new(BufWriter::new(file));
    let base = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        let Some(name) = entry_name(root, entry.path()) else {
            continue;
        };

        if entry.file_type().is_dir() {
            writer.add_directory(format!("{}/", name), base)?;
        } else if entry.file_type().is_file() {
            let options = file_options(base, &entry);
            writer.start_file(name, options)?;
            let mut input = File::open(entry.path()).map_err(io_err)?;
            io::copy(&mut input, &mut writer).map_err(io_err)?;
        }
    }

    let mut inner = writer.finish()?;
    inner.flush().map_err(io_err)?;
    Ok(())
}

#[cfg(unix)]
fn file_options(base: FileOptions, entry: &walkdir::DirEntry) -> FileOptions {
    use std::os::unix::fs::PermissionsExt;
    match entry.metadata() {
        Ok(meta) => base.unix_permissions(meta.permissions().mode() & 0o777),
        Err(_) => base,
    }
}

#[cfg(not(unix))]
fn file_options(base: FileOptions, _entry: &walkdir::DirEntry) -> FileOptions {
    base
}

/// Archive entry name: `path` relative to `root`, `/`-separated.
fn entry_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Read;
    use zip::ZipArchive;

    fn project(root: &Path) {
        fs::create_dir_all(root.join("sandbox/output_files")).unwrap();
        fs::write(root.join("sandbox/LogisimToplevelShell.sof"), b"sof-bits").unwrap();
        fs::write(root.join("sandbox/output_files/fit.rpt"), b"report").unwrap();
        fs::create_dir_all(root.join("scripts")).unwrap();
        fs::write(root.join("scripts/AlteraDownload.tcl"), b"tcl").unwrap();
    }

    #[test]
    fn packages_only_the_project_subdirectory() {
        let sandbox = tempfile::tempdir().unwrap();
        let public = tempfile::tempdir().unwrap();
        project(sandbox.path());

        let packager = Packager::new(public.path().join("results"), "/quartus/results/");
        let artifact = packager.package(sandbox.path(), "sandbox").unwrap();

        assert!(artifact.name().starts_with("bitstream-"));
        assert!(artifact.name().ends_with(".zip"));
        assert_eq!(artifact.url(), format!("/quartus/results/{}", artifact.name()));
        assert_eq!(artifact.path(), public.path().join("results").join(artifact.name()));

        let mut archive = ZipArchive::new(File::open(artifact.path()).unwrap()).unwrap();
        let names: HashSet<String> = archive.file_names().map(str::to_string).collect();
        assert!(names.contains("sandbox/"));
        assert!(names.contains("sandbox/LogisimToplevelShell.sof"));
        assert!(names.contains("sandbox/output_files/fit.rpt"));
        assert!(names.iter().all(|n| n.starts_with("sandbox/")));

        let mut body = String::new();
        archive
            .by_name("sandbox/output_files/fit.rpt")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "report");
    }

    #[test]
    fn names_stay_unique_for_identical_timestamps() {
        let sandbox = tempfile::tempdir().unwrap();
        let public = tempfile::tempdir().unwrap();
        project(sandbox.path());
        let packager = Packager::new(public.path(), "/r/");

        let (first, _, _) = packager.reserve("1700000000000000000").unwrap();
        let (second, _, _) = packager.reserve("1700000000000000000").unwrap();
        assert_eq!(first, "bitstream-1700000000000000000.zip");
        assert_eq!(second, "bitstream-1700000000000000000-1.zip");

        let a = packager.package(sandbox.path(), "sandbox").unwrap();
        let b = packager.package(sandbox.path(), "sandbox").unwrap();
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn missing_subdirectory_creates_nothing() {
        let sandbox = tempfile::tempdir().unwrap();
        let public = tempfile::tempdir().unwrap();
        let packager = Packager::new(public.path().join("results"), "/r/");

        let err = packager.package(sandbox.path(), "sandbox").unwrap_err();
        assert!(matches!(err, PackagingError::MissingSource { .. }));
        assert!(!public.path().join("results").exists());
    }

    #[test]
    fn from_config_uses_public_layout() {
        let config = DeploymentConfig::default();
        let packager = Packager::from_config(&config);
        assert_eq!(packager.results_dir(), Path::new("/var/www/html/quartus/results"));
        assert_eq!(packager.url_prefix, "/quartus/results/");
    }
}
