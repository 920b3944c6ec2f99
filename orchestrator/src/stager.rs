use crate::error::ValidationError;
use crate::sandbox::Sandbox;
use crate::upload::Upload;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;
use zip::ZipArchive;

/// Project directory every stage runs in and that gets packaged on success.
pub const PROJECT_DIR: &str = "sandbox";
pub const SCRIPTS_DIR: &str = "scripts";
pub const SETUP_SCRIPT: &str = "AlteraDownload.tcl";
pub const ARCHIVE_EXTENSION: &str = "zip";

#[derive(Debug, Error)]
pub enum StagingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{message}: {detail}")]
    ExtractionFailed {
        message: &'static str,
        detail: String,
    },
    #[error("can't change into project sandbox directory: {} is missing from the uploaded archive", .expected.display())]
    MissingProjectLayout { expected: PathBuf },
}

/// Layout of an extracted project inside its sandbox.
#[derive(Debug, Clone)]
pub struct StagedProject {
    root: PathBuf,
    project_dir: PathBuf,
    setup_script: PathBuf,
}

impl StagedProject {
    /// Layout rooted at `root`, without checking that it exists.
    pub(crate) fn at(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            project_dir: root.join(PROJECT_DIR),
            setup_script: root.join(SCRIPTS_DIR).join(SETUP_SCRIPT),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Name of the project directory relative to the sandbox root.
    pub fn project_subdir(&self) -> &str {
        PROJECT_DIR
    }

    pub fn setup_script(&self) -> &Path {
        &self.setup_script
    }

    /// Recursive listing of the staged files, relative to the sandbox root.
    pub fn listing(&self) -> Vec<String> {
        WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let relative = entry.path().strip_prefix(&self.root).ok()?;
                let mut line = relative.display().to_string();
                if entry.file_type().is_dir() {
                    line.push('/');
                }
                Some(line)
            })
            .collect()
    }
}

/// Checks an upload before any sandbox exists for it.
pub fn validate_upload(upload: &Upload) -> Result<(), ValidationError> {
    if !upload.is_genuine() {
        return Err(ValidationError::InvalidUpload {
            message: "must upload zip file",
        });
    }
    check_archive_name(upload.declared_name())
}

fn check_archive_name(name: &str) -> Result<(), ValidationError> {
    if !name.contains('.') {
        return Err(ValidationError::BadExtension {
            name: name.to_string(),
            message: "zipfile name is missing extension, should end in .zip",
        });
    }
    if !has_extension(name, ARCHIVE_EXTENSION) {
        return Err(ValidationError::BadExtension {
            name: name.to_string(),
            message: "zipfile name should end in .zip",
        });
    }
    Ok(())
}

/// Suffix match on the raw name, so a bare `.zip` still counts.
pub(crate) fn has_extension(name: &str, extension: &str) -> bool {
    name.strip_suffix(extension)
        .is_some_and(|stem| stem.ends_with('.'))
}

/// Validates `upload` and unpacks it into `sandbox`.
pub fn stage(sandbox: &Sandbox, upload: &Upload) -> Result<StagedProject, StagingError> {
    validate_upload(upload)?;

    let extracted = extract(upload.path(), sandbox.path())?;
    debug!(
        sandbox = %sandbox.path().display(),
        entries = extracted,
        "archive.extracted"
    );

    let project = StagedProject::at(sandbox.path());
    if !project.project_dir.is_dir() {
        return Err(StagingError::MissingProjectLayout {
            expected: PathBuf::from(PROJECT_DIR),
        });
    }

    if !project.setup_script.is_file() {
        return Err(StagingError::MissingProjectLayout {
            expected: Path::new(SCRIPTS_DIR).join(SETUP_SCRIPT),
        });
    }

    Ok(project)
}

fn open_failed(detail: impl ToString) -> StagingError {
    StagingError::ExtractionFailed {
        message: "could not unzip uploaded file",
        detail: detail.to_string(),
    }
}

fn entry_failed(detail: impl ToString) -> StagingError {
    StagingError::ExtractionFailed {
        message: "could not unzip files",
        detail: detail.to_string(),
    }
}

fn extract(archive_path: &Path, dest: &Path) -> Result<usize, StagingError> {
    let file = File::open(archive_path).map_err(open_failed)?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(open_failed)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(entry_failed)?;
        let relative = entry
            .enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| entry_failed(format!("entry '{}' escapes the sandbox", entry.name())))?;
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(entry_failed)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(entry_failed)?;
        }
        let mut out = File::create(&target).map_err(entry_failed)?;
        io::copy(&mut entry, &mut out).map_err(entry_failed)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777))
                .map_err(entry_failed)?;
        }
    }

    Ok(archive.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::UploadSpool;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn build_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        for (name, body) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, FileOptions::default()).unwrap();
            } else {
                writer
                    .start_file(*name, FileOptions::default().unix_permissions(0o755))
                    .unwrap();
                writer.write_all(body).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    struct Fixture {
        root: tempfile::TempDir,
        spool: UploadSpool,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let spool = UploadSpool::new(root.path().join("spool")).unwrap();
            Self { root, spool }
        }

        fn upload(&self, declared: &str, entries: &[(&str, &[u8])]) -> Upload {
            let client = self.root.path().join("client.bin");
            build_zip(&client, entries);
            self.spool.receive(&client, declared).unwrap()
        }

        fn sandbox(&self) -> Sandbox {
            let base = self.root.path().join("tmp");
            fs::create_dir_all(&base).unwrap();
            Sandbox::create(&base, "synth_", 10).unwrap()
        }
    }

    const LAYOUT: &[(&str, &[u8])] = &[
        ("sandbox/", b""),
        ("sandbox/LogisimToplevelShell.vhd", b"entity"),
        ("scripts/AlteraDownload.tcl", b"project_new"),
    ];

    #[test]
    fn stages_expected_layout() {
        let fixture = Fixture::new();
        let upload = fixture.upload("proj.zip", LAYOUT);
        let sandbox = fixture.sandbox();

        let project = stage(&sandbox, &upload).unwrap();

        assert_eq!(project.project_dir(), sandbox.join("sandbox"));
        assert_eq!(project.project_subdir(), "sandbox");
        assert!(project.setup_script().is_file());
        assert_eq!(
            fs::read(sandbox.join("sandbox/LogisimToplevelShell.vhd")).unwrap(),
            b"entity"
        );
        assert_eq!(
            project.listing(),
            vec![
                "sandbox/",
                "sandbox/LogisimToplevelShell.vhd",
                "scripts/",
                "scripts/AlteraDownload.tcl",
            ]
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(project.setup_script())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn extension_is_checked() {
        let fixture = Fixture::new();

        let err = validate_upload(&fixture.upload("proj", LAYOUT)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "zipfile name is missing extension, should end in .zip"
        );

        let err = validate_upload(&fixture.upload("proj.tar", LAYOUT)).unwrap_err();
        assert!(matches!(err, ValidationError::BadExtension { .. }));
        assert_eq!(err.to_string(), "zipfile name should end in .zip");

        validate_upload(&fixture.upload("my.project.zip", LAYOUT)).unwrap();
        validate_upload(&fixture.upload(".zip", LAYOUT)).unwrap();

        let err = validate_upload(&fixture.upload("proj.xzip", LAYOUT)).unwrap_err();
        assert_eq!(err.to_string(), "zipfile name should end in .zip");
    }

    #[test]
    fn vanished_upload_is_invalid() {
        let fixture = Fixture::new();
        let upload = fixture.upload("proj.zip", LAYOUT);
        fs::remove_file(upload.path()).unwrap();

        let err = validate_upload(&upload).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidUpload { .. }));
    }

    #[test]
    fn corrupt_archive_fails_extraction() {
        let fixture = Fixture::new();
        let client = fixture.root.path().join("junk.zip");
        fs::write(&client, b"definitely not a zip").unwrap();
        let upload = fixture.spool.receive(&client, "junk.zip").unwrap();
        let sandbox = fixture.sandbox();

        let err = stage(&sandbox, &upload).unwrap_err();
        assert!(matches!(
            err,
            StagingError::ExtractionFailed {
                message: "could not unzip uploaded file",
                ..
            }
        ));
    }

    #[test]
    fn entries_escaping_the_sandbox_are_rejected() {
        let fixture = Fixture::new();
        let upload = fixture.upload("proj.zip", &[("../escape.txt", b"x")]);
        let sandbox = fixture.sandbox();

        let err = stage(&sandbox, &upload).unwrap_err();
        assert!(matches!(err, StagingError::ExtractionFailed { .. }));
        assert!(!sandbox.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn missing_layout_is_reported() {
        let fixture = Fixture::new();
        let sandbox = fixture.sandbox();
        let upload = fixture.upload("proj.zip", &[("scripts/AlteraDownload.tcl", b"")]);
        let err = stage(&sandbox, &upload).unwrap_err();
        assert!(matches!(
            err,
            StagingError::MissingProjectLayout { ref expected } if expected == Path::new("sandbox")
        ));

        let sandbox = fixture.sandbox();
        let upload = fixture.upload("proj.zip", &[("sandbox/top.vhd", b"")]);
        let err = stage(&sandbox, &upload).unwrap_err();
        assert!(matches!(err, StagingError::MissingProjectLayout { .. }));
    }
}
