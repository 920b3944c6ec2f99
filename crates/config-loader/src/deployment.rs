use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_TOOLCHAIN_DIR: &str = "SYNTH_TOOLCHAIN_DIR";
pub const ENV_PUBLIC_ROOT: &str = "SYNTH_PUBLIC_ROOT";
pub const ENV_RESULTS_SUBDIR: &str = "SYNTH_RESULTS_SUBDIR";
pub const ENV_URI_BASE: &str = "SYNTH_URI_BASE";
pub const ENV_SANDBOX_BASE: &str = "SYNTH_SANDBOX_BASE";
pub const ENV_SANDBOX_PREFIX: &str = "SYNTH_SANDBOX_PREFIX";
pub const ENV_UPLOAD_DIR: &str = "SYNTH_UPLOAD_DIR";
pub const ENV_MAX_REQUEST_DURATION: &str = "SYNTH_MAX_REQUEST_DURATION";

/// Characters that may never appear in a sandbox name prefix.
pub const UNSAFE_NAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Deployment-time settings. Nothing here is configurable per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    /// Directory holding the toolchain executables (`quartus_sh`, `quartus_pgm`, ...).
    pub toolchain_dir: PathBuf,
    /// Filesystem root served publicly by the web server.
    pub public_root: PathBuf,
    /// Results directory name under both `public_root` and `uri_base`.
    pub results_subdir: String,
    /// URL path under which `public_root` is reachable; starts and ends with `/`.
    pub uri_base: String,
    pub sandbox_base: PathBuf,
    pub sandbox_prefix: String,
    pub upload_dir: PathBuf,
    #[serde(with = "duration_text")]
    pub max_request_duration: Duration,
    pub max_sandbox_attempts: u32,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        let temp = std::env::temp_dir();
        Self {
            toolchain_dir: PathBuf::from("/opt/altera/13.1/quartus/bin"),
            public_root: PathBuf::from("/var/www/html/quartus"),
            results_subdir: "results".to_string(),
            uri_base: "/quartus/".to_string(),
            upload_dir: temp.join("synth-uploads"),
            sandbox_base: temp,
            sandbox_prefix: "synth_".to_string(),
            max_request_duration: Duration::from_secs(240),
            max_sandbox_attempts: 1000,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigOverrides {
    toolchain_dir: Option<PathBuf>,
    public_root: Option<PathBuf>,
    results_subdir: Option<String>,
    uri_base: Option<String>,
    sandbox_base: Option<PathBuf>,
    sandbox_prefix: Option<String>,
    upload_dir: Option<PathBuf>,
    max_request_duration: Option<String>,
    max_sandbox_attempts: Option<u32>,
}

impl DeploymentConfig {
    /// Filesystem directory artifacts are written to.
    pub fn results_dir(&self) -> PathBuf {
        self.public_root.join(&self.results_subdir)
    }

    /// URL path prefix artifacts are served under, ending in `/`.
    pub fn results_url_prefix(&self) -> String {
        format!("{}{}/", self.uri_base, self.results_subdir)
    }

    /// Applies a JSON document of camelCase overrides; unknown keys are rejected.
    pub fn apply_json(&mut self, content: &str) -> Result<(), ConfigError> {
        let overrides: ConfigOverrides =
            serde_json::from_str(content).map_err(|e| ConfigError::JsonParsingFailed {
                message: e.to_string(),
            })?;

        let duration = overrides
            .max_request_duration
            .as_deref()
            .map(|raw| parse_duration("maxRequestDuration", raw))
            .transpose()?;

        set(&mut self.toolchain_dir, overrides.toolchain_dir);
        set(&mut self.public_root, overrides.public_root);
        set(&mut self.results_subdir, overrides.results_subdir);
        set(&mut self.uri_base, overrides.uri_base);
        set(&mut self.sandbox_base, overrides.sandbox_base);
        set(&mut self.sandbox_prefix, overrides.sandbox_prefix);
        set(&mut self.upload_dir, overrides.upload_dir);
        set(&mut self.max_request_duration, duration);
        set(&mut self.max_sandbox_attempts, overrides.max_sandbox_attempts);
        Ok(())
    }

    /// Applies `SYNTH_*` overrides; empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        set(&mut self.toolchain_dir, get(ENV_TOOLCHAIN_DIR).map(PathBuf::from));
        set(&mut self.public_root, get(ENV_PUBLIC_ROOT).map(PathBuf::from));
        set(&mut self.results_subdir, get(ENV_RESULTS_SUBDIR));
        set(&mut self.uri_base, get(ENV_URI_BASE));
        set(&mut self.sandbox_base, get(ENV_SANDBOX_BASE).map(PathBuf::from));
        set(&mut self.sandbox_prefix, get(ENV_SANDBOX_PREFIX));
        set(&mut self.upload_dir, get(ENV_UPLOAD_DIR).map(PathBuf::from));

        if let Some(raw) = get(ENV_MAX_REQUEST_DURATION) {
            self.max_request_duration = parse_duration(ENV_MAX_REQUEST_DURATION, &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_absolute("toolchainDir", &self.toolchain_dir)?;
        require_absolute("publicRoot", &self.public_root)?;
        require_absolute("sandboxBase", &self.sandbox_base)?;
        require_absolute("uploadDir", &self.upload_dir)?;

        let subdir = self.results_subdir.as_str();
        if subdir.is_empty()
            || subdir == "."
            || subdir == ".."
            || subdir.contains(['/', '\\'])
        {
            return Err(invalid(
                "resultsSubdir",
                format!("'{}' must be a single directory name", subdir),
            ));
        }

        if !self.uri_base.starts_with('/') || !self.uri_base.ends_with('/') {
            return Err(invalid(
                "uriBase",
                format!("'{}' must start and end with '/'", self.uri_base),
            ));
        }

        if self.sandbox_prefix.contains(UNSAFE_NAME_CHARS) {
            return Err(invalid(
                "sandboxPrefix",
                format!("'{}' contains path or wildcard characters", self.sandbox_prefix),
            ));
        }

        if self.max_request_duration.is_zero() {
            return Err(invalid("maxRequestDuration", "must be greater than zero"));
        }

        if self.max_sandbox_attempts == 0 {
            return Err(invalid("maxSandboxAttempts", "must be at least 1"));
        }

        Ok(())
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        message: message.into(),
    }
}

fn require_absolute(field: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(invalid(
            field,
            format!("'{}' must be an absolute path", path.display()),
        ))
    }
}

fn parse_duration(field: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw.trim()).map_err(|e| invalid(field, format!("'{}': {}", raw, e)))
}

mod duration_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = DeploymentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_request_duration, Duration::from_secs(240));
        assert_eq!(config.results_url_prefix(), "/quartus/results/");
        assert_eq!(
            config.results_dir(),
            PathBuf::from("/var/www/html/quartus/results")
        );
    }

    #[test]
    fn env_overrides_replace_defaults() {
        let mut config = DeploymentConfig::default();
        config
            .apply_env(lookup(&[
                (ENV_TOOLCHAIN_DIR, "/srv/quartus/bin"),
                (ENV_URI_BASE, "/fpga/"),
                (ENV_MAX_REQUEST_DURATION, "5m"),
                (ENV_SANDBOX_PREFIX, "   "),
            ]))
            .unwrap();

        assert_eq!(config.toolchain_dir, PathBuf::from("/srv/quartus/bin"));
        assert_eq!(config.uri_base, "/fpga/");
        assert_eq!(config.max_request_duration, Duration::from_secs(300));
        assert_eq!(config.sandbox_prefix, "synth_");
    }

    #[test]
    fn env_duration_must_parse() {
        let mut config = DeploymentConfig::default();
        let err = config
            .apply_env(lookup(&[(ENV_MAX_REQUEST_DURATION, "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: ENV_MAX_REQUEST_DURATION,
                ..
            }
        ));
    }

    #[test]
    fn json_rejects_unknown_keys() {
        let mut config = DeploymentConfig::default();
        let err = config.apply_json(r#"{"toolchain": "/x"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::JsonParsingFailed { .. }));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = DeploymentConfig::default();
        config.results_subdir = "../escape".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "resultsSubdir",
                ..
            })
        ));

        let mut config = DeploymentConfig::default();
        config.uri_base = "quartus".to_string();
        assert!(config.validate().is_err());

        let mut config = DeploymentConfig::default();
        config.sandbox_prefix = "tmp/*".to_string();
        assert!(config.validate().is_err());

        let mut config = DeploymentConfig::default();
        config.toolchain_dir = PathBuf::from("bin");
        assert!(config.validate().is_err());

        let mut config = DeploymentConfig::default();
        config.max_request_duration = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn serializes_duration_as_text() {
        let value = serde_json::to_value(DeploymentConfig::default()).unwrap();
        assert_eq!(value["maxRequestDuration"], "4m");
        assert_eq!(value["resultsSubdir"], "results");
    }
}
