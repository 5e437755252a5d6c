//! Guaranteed release of ephemeral run resources.
//!
//! Every temp file, scratch directory, attached memory device, filesystem
//! mount and imported pool is registered with a [`ResourceTracker`] the
//! moment it comes into existence. Components release their own resources
//! on the success path through [`ResourceTracker::release`]; anything still
//! active is released by [`ResourceTracker::release_all`], which runs once,
//! in reverse registration order, from whichever of these gets there first:
//!
//! - normal completion or a propagated error ([`TeardownGuard`] drop)
//! - a termination signal ([`signals::install_teardown_on_signal`])
//!
//! Release is best-effort: a failure is logged and the walk continues.
//!
//! Acquisitions that create something outside the process (a device, a
//! mount, a pool, a scratch directory) go through [`ResourceTracker::acquire_command`]
//! or [`ResourceTracker::create_dir`], which create and register under the
//! tracker lock. Teardown therefore waits for an acquisition in progress and
//! sees its result; once teardown has started, new acquisitions are refused.

pub mod lock;
pub mod signals;

use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::process::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    File,
    /// Scratch directory, removed with its contents.
    Directory,
    /// Directory something is mounted on. Only empty directories on the
    /// host filesystem are removed from it, never a mounted tree.
    MountPoint,
    /// Attached memory/loopback device.
    Device,
    /// Mounted filesystem.
    Mount,
    /// Imported storage pool.
    Pool,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::MountPoint => "mount point",
            Self::Device => "device",
            Self::Mount => "mount",
            Self::Pool => "pool",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Active,
    Released,
}

/// Handle returned on registration; identifies one tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(usize);

#[derive(Debug, Clone)]
pub struct TrackedResource {
    pub path: String,
    pub kind: ResourceKind,
    pub state: ResourceState,
    /// Host command that releases a device, mount or pool.
    release: Option<Cmd>,
}

#[derive(Debug, Default)]
struct TrackerState {
    resources: Vec<TrackedResource>,
    torn_down: bool,
}

/// Shared registry of run resources. Cloning shares the registry.
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    inner: Arc<Mutex<TrackerState>>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file to delete at teardown.
    pub fn track_file(&self, path: &Path) -> ResourceId {
        self.register(path.display().to_string(), ResourceKind::File, None)
    }

    /// Register a directory tree to delete at teardown.
    pub fn track_dir(&self, path: &Path) -> ResourceId {
        self.register(path.display().to_string(), ResourceKind::Directory, None)
    }

    /// Register a host-side resource released by running `release`.
    pub fn track_command(&self, kind: ResourceKind, label: &str, release: Cmd) -> ResourceId {
        self.register(label.to_string(), kind, Some(release))
    }

    /// Create a host-side resource and register it in one step.
    ///
    /// `acquire` runs under the tracker lock and returns the value, a label
    /// and the command that releases what it created. It must not call back
    /// into the tracker.
    pub fn acquire_command<T>(
        &self,
        kind: ResourceKind,
        acquire: impl FnOnce() -> Result<(T, String, Cmd)>,
    ) -> Result<(T, ResourceId)> {
        let mut state = self.lock();
        refuse_after_teardown(&state, kind)?;
        let (value, label, release) = acquire()?;
        let id = state.push(label, kind, Some(release));
        Ok((value, id))
    }

    /// Create `path` (and missing parents) and register it for recursive removal.
    pub fn create_dir(&self, path: &Path) -> Result<ResourceId> {
        self.create_path(path, ResourceKind::Directory)
    }

    /// Create an empty mount point. Teardown only removes it once empty, so a
    /// mount that failed to detach is never walked into.
    pub fn create_mount_point(&self, path: &Path) -> Result<ResourceId> {
        self.create_path(path, ResourceKind::MountPoint)
    }

    fn create_path(&self, path: &Path, kind: ResourceKind) -> Result<ResourceId> {
        let mut state = self.lock();
        refuse_after_teardown(&state, kind)?;
        fs::create_dir_all(path).map_err(|e| Error::io(path, e))?;
        Ok(state.push(path.display().to_string(), kind, None))
    }

    /// Release one resource now. Releasing an already released resource is a no-op.
    ///
    /// On failure the resource stays active so the final teardown retries it.
    pub fn release(&self, id: ResourceId) -> Result<()> {
        let mut state = self.lock();
        let Some(resource) = state.resources.get_mut(id.0) else {
            return Ok(());
        };
        if resource.state == ResourceState::Released {
            return Ok(());
        }
        release_resource(resource)?;
        resource.state = ResourceState::Released;
        Ok(())
    }

    /// Stop tracking a resource without releasing it (the caller keeps it).
    pub fn untrack(&self, id: ResourceId) {
        let mut state = self.lock();
        if let Some(resource) = state.resources.get_mut(id.0) {
            if resource.state == ResourceState::Active {
                info!(kind = %resource.kind, path = %resource.path, "leaving resource in place");
                resource.state = ResourceState::Released;
            }
        }
    }

    /// Release every active resource in reverse registration order.
    ///
    /// Runs at most once per tracker; later calls return 0. Returns the
    /// number of resources whose release failed.
    pub fn release_all(&self) -> usize {
        self.release_all_after(|| {})
    }

    /// [`Self::release_all`], running `stop` first once the lock is held and
    /// no acquisition is in progress.
    pub(crate) fn release_all_after(&self, stop: impl FnOnce()) -> usize {
        let mut state = self.lock();
        if state.torn_down {
            return 0;
        }
        state.torn_down = true;
        stop();

        let mut failures = 0;
        for resource in state.resources.iter_mut().rev() {
            if resource.state == ResourceState::Released {
                continue;
            }
            match release_resource(resource) {
                Ok(()) => resource.state = ResourceState::Released,
                Err(e) => {
                    failures += 1;
                    warn!(kind = %resource.kind, path = %resource.path, "release failed: {e}");
                }
            }
        }
        debug!(failures, "teardown complete");
        failures
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .resources
            .iter()
            .filter(|r| r.state == ResourceState::Active)
            .count()
    }

    pub fn snapshot(&self) -> Vec<TrackedResource> {
        self.lock().resources.clone()
    }

    /// Guard that runs [`Self::release_all`] when dropped.
    pub fn guard(&self) -> TeardownGuard {
        TeardownGuard {
            tracker: self.clone(),
        }
    }

    fn register(&self, path: String, kind: ResourceKind, release: Option<Cmd>) -> ResourceId {
        self.lock().push(path, kind, release)
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // A panic elsewhere must not prevent teardown.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TrackerState {
    fn push(&mut self, path: String, kind: ResourceKind, release: Option<Cmd>) -> ResourceId {
        let id = ResourceId(self.resources.len());
        let mut resource = TrackedResource {
            path,
            kind,
            state: ResourceState::Active,
            release,
        };
        debug!(kind = %resource.kind, path = %resource.path, "tracking resource");

        // Teardown already ran (signal raced with the main thread): nothing
        // will come back for this one, so release it immediately.
        if self.torn_down {
            warn!(kind = %resource.kind, path = %resource.path, "registered after teardown; releasing now");
            match release_resource(&resource) {
                Ok(()) => resource.state = ResourceState::Released,
                Err(e) => warn!("release failed: {e}"),
            }
        }
        self.resources.push(resource);
        id
    }
}

fn refuse_after_teardown(state: &TrackerState, kind: ResourceKind) -> Result<()> {
    if state.torn_down {
        return Err(Error::resource(
            format!("acquiring {kind}"),
            "teardown has already started",
        ));
    }
    Ok(())
}

/// Releases all tracked resources when dropped.
#[must_use = "teardown runs when the guard is dropped"]
pub struct TeardownGuard {
    tracker: ResourceTracker,
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.tracker.release_all();
    }
}

fn release_resource(resource: &TrackedResource) -> Result<()> {
    debug!(kind = %resource.kind, path = %resource.path, "releasing");
    match resource.kind {
        ResourceKind::File => match fs::remove_file(&resource.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&resource.path, e)),
        },
        ResourceKind::Directory => match fs::remove_dir_all(&resource.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&resource.path, e)),
        },
        ResourceKind::MountPoint => match remove_mount_point(Path::new(&resource.path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&resource.path, e)),
        },
        ResourceKind::Device | ResourceKind::Mount | ResourceKind::Pool => {
            let Some(cmd) = &resource.release else {
                return Ok(());
            };
            cmd.clone().for_teardown().run().map(|_| ()).map_err(|e| {
                Error::resource(format!("releasing {} '{}'", resource.kind, resource.path), e)
            })
        }
    }
}

/// `rmdir` a mount point and the empty directories an export left below it.
fn remove_mount_point(path: &Path) -> io::Result<()> {
    let own = fs::symlink_metadata(path)?;
    let host = match path.parent() {
        Some(parent) => Some(fs::symlink_metadata(parent)?.dev()),
        None => None,
    };
    if host != Some(own.dev()) {
        // Still mounted: rmdir fails and nothing inside is touched.
        return fs::remove_dir(path);
    }
    prune_empty_dirs(path, own.dev())
}

fn prune_empty_dirs(dir: &Path, dev: u64) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() && meta.dev() == dev {
            prune_empty_dirs(&entry.path(), dev)?;
        }
    }
    fs::remove_dir(dir)
}

/// Name component unique to this process and moment, for scratch paths and
/// per-run pool names.
pub fn run_scoped_suffix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{}-{:x}", std::process::id(), nanos & 0xffff_ffff_ffff)
}
