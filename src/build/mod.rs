//! Rebuild a recorded source revision.
//!
//! - [`source`] - clone at the branch, pin the exact commit
//! - [`stages`] - world, kernel and disk image make invocations
//!
//! Every stage must exit zero before the next begins. The build runs on the
//! host toolchain as-is: no jail or container is set up, so host drift can
//! surface as a reproducibility failure.

pub mod source;
pub mod stages;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, info_span};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::identity::BuildIdentity;
use crate::resource::{run_scoped_suffix, ResourceTracker};

/// One step of [`BuildOrchestrator::build`], named in build errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Clone,
    Checkout,
    World,
    Kernel,
    Image,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Clone => "clone",
            Self::Checkout => "checkout",
            Self::World => "world",
            Self::Kernel => "kernel",
            Self::Image => "image",
        })
    }
}

/// Output of a successful build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// Isolated `MAKEOBJDIRPREFIX` of this run.
    pub object_dir: PathBuf,
    /// Raw disk image produced by the image stage.
    pub image_path: PathBuf,
    pub source_dir: PathBuf,
}

pub struct BuildOrchestrator<'a> {
    config: &'a Config,
    tracker: &'a ResourceTracker,
    /// Leave the source tree and object directory in place after the run.
    keep: bool,
}

impl<'a> BuildOrchestrator<'a> {
    pub fn new(config: &'a Config, tracker: &'a ResourceTracker, keep: bool) -> Self {
        Self {
            config,
            tracker,
            keep,
        }
    }

    pub fn build(&self, identity: &BuildIdentity) -> Result<BuildResult> {
        let _span = info_span!("build", %identity).entered();
        let suffix = run_scoped_suffix();
        let source_dir = self.config.paths.work_dir.join(format!("src-{suffix}"));
        let object_dir = self.config.paths.obj_root().join(&suffix);

        self.scratch_dir(&source_dir, false)?;
        self.scratch_dir(&object_dir, true)?;

        source::clone_branch(&self.config.source.repository, &identity.branch, &source_dir)?;
        source::checkout_commit(&source_dir, &identity.commit)?;

        stages::run_all(&self.config.build, identity, &source_dir, &object_dir)?;

        let image_path = locate_image(&object_dir, &self.config.build.image_filename)?;
        info!(image = %image_path.display(), "build complete");
        Ok(BuildResult {
            object_dir,
            image_path,
            source_dir,
        })
    }

    /// Track `dir` for removal unless the build is kept. `git clone` wants
    /// to create its target itself, so only the parent is created for it.
    fn scratch_dir(&self, dir: &Path, create: bool) -> Result<()> {
        if create {
            if !self.keep {
                self.tracker.create_dir(dir)?;
                return Ok(());
            }
            return fs::create_dir_all(dir).map_err(|e| Error::io(dir, e));
        }
        if !self.keep {
            self.tracker.track_dir(dir);
        }
        match dir.parent() {
            Some(parent) => fs::create_dir_all(parent).map_err(|e| Error::io(parent, e)),
            None => Ok(()),
        }
    }
}

/// Find the image stage's output file under `object_dir`.
pub fn locate_image(object_dir: &Path, file_name: &str) -> Result<PathBuf> {
    for entry in WalkDir::new(object_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(object_dir).to_path_buf();
            Error::io(path, e.into())
        })?;
        if entry.file_type().is_file() && entry.file_name() == file_name {
            return Ok(entry.into_path());
        }
    }
    Err(Error::build(
        BuildStage::Image,
        format!(
            "image stage produced no '{file_name}' under '{}'",
            object_dir.display()
        ),
    ))
}
