//! Run configuration.
//!
//! Loaded from TOML (`--config <path>`, else `<config dir>/image-repro/config.toml`),
//! falling back to built-in defaults. Command-line flags override on top.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Schemes the HTTP client can actually fetch.
pub const SUPPORTED_SCHEMES: &[&str] = &["http", "https"];

const CONFIG_DIR_NAME: &str = "image-repro";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub source: SourceConfig,
    pub paths: PathsConfig,
    pub build: BuildConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    /// Git URL of the operating-system source tree.
    pub repository: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            repository: "https://git.freebsd.org/src.git".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Scratch space: working image copies, mount points, source checkouts.
    pub work_dir: PathBuf,
    /// Where the three result files of each run land.
    pub results_dir: PathBuf,
    /// Root for per-run object directories (`<work_dir>/obj` when unset).
    pub obj_root: Option<PathBuf>,
    /// Host-wide run lock (`<work_dir>/.lock` when unset).
    pub lock_file: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/var/tmp/image-repro"),
            results_dir: PathBuf::from("results"),
            obj_root: None,
            lock_file: None,
        }
    }
}

impl PathsConfig {
    pub fn obj_root(&self) -> PathBuf {
        self.obj_root
            .clone()
            .unwrap_or_else(|| self.work_dir.join("obj"))
    }

    pub fn lock_file(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| self.work_dir.join(".lock"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub make: String,
    /// Parallel make jobs; 0 means one per available core.
    pub jobs: usize,
    pub kernconf: String,
    /// Arguments passed to make in `<src>/release` for the disk image stage.
    pub image_make_args: Vec<String>,
    /// File name of the raw image the image stage leaves under the object directory.
    pub image_filename: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            make: "make".to_string(),
            jobs: 0,
            kernconf: "GENERIC".to_string(),
            image_make_args: [
                "vm-image",
                "WITH_VMIMAGES=yes",
                "VMFORMATS=raw",
                "NOPKG=yes",
                "NOPORTS=yes",
                "NOSRC=yes",
                "NODOC=yes",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            image_filename: "vm.raw".to_string(),
        }
    }
}

impl BuildConfig {
    pub fn effective_jobs(&self) -> usize {
        if self.jobs > 0 {
            return self.jobs;
        }
        match std::thread::available_parallelism() {
            Ok(n) => n.get(),
            Err(e) => {
                warn!("could not detect CPU count ({e}), using 4 jobs");
                4
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadConfig {
    pub allowed_schemes: Vec<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            allowed_schemes: SUPPORTED_SCHEMES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Config {
    /// Load from an explicit path, the per-user default path, or defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match default_config_path() {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => {
                debug!("no configuration file found; using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config = Self::parse(&text, path)?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    fn parse(text: &str, path: &Path) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let invalid = |reason: String| Error::Config {
            path: path.to_path_buf(),
            reason,
        };
        if self.source.repository.trim().is_empty() {
            return Err(invalid("source.repository must not be empty".into()));
        }
        if self.build.make.trim().is_empty() {
            return Err(invalid("build.make must not be empty".into()));
        }
        if self.build.image_filename.trim().is_empty() || self.build.image_filename.contains('/')
        {
            return Err(invalid(format!(
                "build.image_filename must be a plain file name, got '{}'",
                self.build.image_filename
            )));
        }
        for scheme in &self.download.allowed_schemes {
            if !SUPPORTED_SCHEMES.contains(&scheme.as_str()) {
                return Err(invalid(format!(
                    "download scheme '{}' is not supported; expected a subset of: {}",
                    scheme,
                    SUPPORTED_SCHEMES.join(", ")
                )));
            }
        }
        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}
