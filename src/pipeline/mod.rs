//! The verification run, end to end.
//!
//! ```text
//! acquire ─▶ mount ─▶ extract identity ─▶ hash ─▶ unmount
//!        ─▶ build ─▶ mount rebuilt image ─▶ hash ─▶ unmount ─▶ compare
//! ```
//!
//! All run state lives in a [`RunContext`] owned by [`run`]; components get
//! what they need from it through their own constructors.

use std::path::Path;

use tracing::{info, info_span, warn};

use crate::build::{BuildOrchestrator, BuildResult};
use crate::compare::{compare, ResultFiles, VerificationReport};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::identity::{extract, BuildIdentity, PartialIdentity};
use crate::image::{ImageAcquirer, ImageHandle, ImageMounter, ImageSource};
use crate::manifest::{self, Manifest};
use crate::preflight;
use crate::resource::lock::RunLock;
use crate::resource::ResourceTracker;

/// What to verify and how.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub source: ImageSource,
    /// Identity fields supplied by the caller; never overwritten.
    pub identity: PartialIdentity,
    /// Leave the source tree and object directory after the run.
    pub keep_build: bool,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub identity: BuildIdentity,
    pub report: VerificationReport,
    pub files: ResultFiles,
    pub build: BuildResult,
}

/// Mutable state of one run.
pub struct RunContext {
    config: Config,
    tracker: ResourceTracker,
    identity: PartialIdentity,
    /// At most one image is mounted at a time.
    handle: Option<ImageHandle>,
}

impl RunContext {
    pub fn new(config: Config, tracker: ResourceTracker, identity: PartialIdentity) -> Self {
        Self {
            config,
            tracker,
            identity,
            handle: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    pub fn identity(&self) -> &PartialIdentity {
        &self.identity
    }

    /// Mount `image`, run `f` on it, and unmount again whatever `f` returned.
    ///
    /// An error from `f` wins over an unmount error; the latter is logged and
    /// left to the final teardown.
    pub fn with_mounted<T>(
        &mut self,
        image: &Path,
        f: impl FnOnce(&ImageHandle, &mut PartialIdentity) -> Result<T>,
    ) -> Result<T> {
        if let Some(live) = &self.handle {
            return Err(Error::resource(
                format!("mounting '{}'", image.display()),
                format!("'{}' is still mounted", live.backing_file().display()),
            ));
        }
        let mounter = ImageMounter::new(&self.tracker, &self.config.paths.work_dir);
        let handle = self.handle.insert(mounter.mount(image)?);
        let result = f(handle, &mut self.identity);

        let unmounted = match self.handle.take() {
            Some(handle) => mounter.unmount(handle),
            None => Ok(()),
        };
        match (result, unmounted) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unmount)) => {
                warn!("unmount after failure: {unmount}");
                Err(e)
            }
        }
    }
}

/// Run one verification. Resources still tracked on return are left for the
/// caller's teardown.
pub fn run(config: Config, tracker: ResourceTracker, options: RunOptions) -> Result<RunOutcome> {
    let mut identity = options.identity;
    identity.normalize()?;

    let acquirer = ImageAcquirer::new(
        &tracker,
        &config.paths.work_dir,
        &config.download.allowed_schemes,
    );
    acquirer.validate(&options.source)?;

    preflight::require_root()?;
    preflight::check_host_tools(&config.build.make)?;
    let _lock = RunLock::acquire(&config.paths.lock_file())?;

    let image = {
        let _span = info_span!("acquire").entered();
        acquirer.acquire(&options.source)?
    };

    let mut ctx = RunContext::new(config, tracker, identity);

    let original = {
        let _span = info_span!("inspect", image = %image.display()).entered();
        ctx.with_mounted(&image, |handle, identity| {
            resolve_identity(handle, identity)?;
            manifest::hash_tree(handle.root())
        })?
    };
    let mut known = ctx.identity.clone();
    known.normalize()?;
    let identity = known.complete()?;
    info!(%identity, "build identity resolved");

    let files = ResultFiles::for_run(&ctx.config.paths.results_dir, &identity);
    files.ensure_dir()?;
    original.write_to(&files.image_manifest)?;

    let build = BuildOrchestrator::new(&ctx.config, &ctx.tracker, options.keep_build)
        .build(&identity)?;

    let rebuilt: Manifest = {
        let _span = info_span!("inspect-rebuilt", image = %build.image_path.display()).entered();
        ctx.with_mounted(&build.image_path, |handle, _| manifest::hash_tree(handle.root()))?
    };
    rebuilt.write_to(&files.obj_manifest)?;

    let report = compare(
        &original,
        &rebuilt,
        &file_label(&files.image_manifest),
        &file_label(&files.obj_manifest),
    );
    files.write_report(&report)?;
    if report.is_reproducible() {
        info!("image reproduced bit-for-bit");
    } else {
        info!(changes = report.changes().len(), "image is not reproducible");
    }

    Ok(RunOutcome {
        identity,
        report,
        files,
        build,
    })
}

/// Fill identity fields the caller did not supply from the mounted kernel.
fn resolve_identity(handle: &ImageHandle, identity: &mut PartialIdentity) -> Result<()> {
    if identity.is_complete() {
        return Ok(());
    }
    let found = extract::extract(&handle.kernel_path(), identity)?;
    identity.merge_missing(found);
    Ok(())
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Arch, Platform};
    use tempfile::TempDir;

    fn config(tmp: &Path) -> Config {
        let mut config = Config::default();
        config.paths.work_dir = tmp.join("work");
        config.paths.results_dir = tmp.join("results");
        config
    }

    #[test]
    fn remote_container_image_rejected_before_anything_is_acquired() {
        let tmp = TempDir::new().unwrap();
        let tracker = ResourceTracker::new();
        let err = run(
            config(tmp.path()),
            tracker.clone(),
            RunOptions {
                source: ImageSource::Remote {
                    url: "https://mirror.example/FreeBSD-14.1-RELEASE-amd64.qcow2.xz".into(),
                },
                identity: PartialIdentity::default(),
                keep_build: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Format { .. }), "{err}");
        assert!(tracker.snapshot().is_empty());
        assert!(!tmp.path().join("work").exists());
    }

    #[test]
    fn contradictory_identity_is_usage_error() {
        let tmp = TempDir::new().unwrap();
        let err = run(
            config(tmp.path()),
            ResourceTracker::new(),
            RunOptions {
                source: ImageSource::Local {
                    path: tmp.path().join("vm.raw"),
                },
                identity: PartialIdentity {
                    platform: Some(Platform::Arm64),
                    arch: Some(Arch::Amd64),
                    ..PartialIdentity::default()
                },
                keep_build: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Usage(_)), "{err}");
    }

    #[test]
    fn cloud_source_is_refused() {
        let tmp = TempDir::new().unwrap();
        let err = run(
            config(tmp.path()),
            ResourceTracker::new(),
            RunOptions {
                source: ImageSource::CloudManaged {
                    image_id: "ami-0abc".into(),
                    region: "eu-west-1".into(),
                },
                identity: PartialIdentity::default(),
                keep_build: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn mount_failure_leaves_context_reusable() {
        let tmp = TempDir::new().unwrap();
        let image = tmp.path().join("disk.raw");
        std::fs::write(&image, b"not a disk").unwrap();
        let tracker = ResourceTracker::new();
        let mut ctx = RunContext::new(config(tmp.path()), tracker.clone(), PartialIdentity::default());

        let mut called = false;
        let result = ctx.with_mounted(&image, |_, _| {
            called = true;
            Ok(())
        });
        // Without mdconfig (or privileges) the mount fails before `f` runs.
        if result.is_err() {
            assert!(!called);
        }
        assert!(ctx.handle.is_none());
        assert_eq!(tracker.active_count(), 0);
    }
}
