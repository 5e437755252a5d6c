//! Attach a raw image as a read-only memory device and mount its data filesystem.
//!
//! Each step that creates something on the host runs through
//! [`ResourceTracker::acquire_command`], so its release is registered before
//! teardown can look: an interrupted or failed mount leaves nothing behind.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::partitions::{parse_gpart_show, parse_md_unit, select_data_partition, FilesystemKind};
use super::zfs;
use crate::error::{Error, Result};
use crate::identity::extract::KERNEL_RELATIVE_PATH;
use crate::process::Cmd;
use crate::resource::{run_scoped_suffix, ResourceId, ResourceKind, ResourceTracker};

/// A mounted image. Release with [`ImageMounter::unmount`].
#[derive(Debug)]
pub struct ImageHandle {
    backing_file: PathBuf,
    device: Option<String>,
    mount_root: PathBuf,
    filesystem: Option<FilesystemKind>,
    pool: Option<String>,
    /// Tracker registrations in acquisition order.
    tokens: Vec<ResourceId>,
}

impl ImageHandle {
    fn new(backing_file: &Path, mount_root: PathBuf) -> Self {
        Self {
            backing_file: backing_file.to_path_buf(),
            device: None,
            mount_root,
            filesystem: None,
            pool: None,
            tokens: Vec::new(),
        }
    }

    pub fn backing_file(&self) -> &Path {
        &self.backing_file
    }

    /// Memory device unit, e.g. `md0`.
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Root of the mounted filesystem tree.
    pub fn root(&self) -> &Path {
        &self.mount_root
    }

    pub fn filesystem(&self) -> Option<FilesystemKind> {
        self.filesystem
    }

    /// Temporary name of the imported pool (ZFS images only).
    pub fn pool(&self) -> Option<&str> {
        self.pool.as_deref()
    }

    pub fn kernel_path(&self) -> PathBuf {
        self.mount_root.join(KERNEL_RELATIVE_PATH)
    }
}

pub struct ImageMounter<'a> {
    tracker: &'a ResourceTracker,
    work_dir: &'a Path,
}

impl<'a> ImageMounter<'a> {
    pub fn new(tracker: &'a ResourceTracker, work_dir: &'a Path) -> Self {
        Self { tracker, work_dir }
    }

    /// Mount `image` read-only. On failure everything acquired so far is released.
    pub fn mount(&self, image: &Path) -> Result<ImageHandle> {
        let mount_root = self.work_dir.join(format!("mnt-{}", run_scoped_suffix()));
        let mut handle = ImageHandle::new(image, mount_root);

        match self.attach(&mut handle) {
            Ok(()) => {
                info!(
                    image = %image.display(),
                    device = handle.device().unwrap_or("-"),
                    root = %handle.root().display(),
                    filesystem = ?handle.filesystem,
                    "image mounted"
                );
                Ok(handle)
            }
            Err(e) => {
                if let Err(cleanup) = self.unmount(handle) {
                    warn!("cleanup after failed mount: {cleanup}");
                }
                Err(e)
            }
        }
    }

    /// Release the mount or pool, then the device, then the mount point.
    ///
    /// Every step is attempted; the first failure is returned. Failed steps
    /// stay tracked so the final teardown retries them.
    pub fn unmount(&self, handle: ImageHandle) -> Result<()> {
        let mut first_err = None;
        for id in handle.tokens.iter().rev() {
            if let Err(e) = self.tracker.release(*id) {
                warn!("{e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => {
                debug!(root = %handle.mount_root.display(), "image unmounted");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    fn attach(&self, handle: &mut ImageHandle) -> Result<()> {
        let root = handle.mount_root.clone();
        handle.tokens.push(self.tracker.create_mount_point(&root)?);

        let backing = handle.backing_file.clone();
        let (unit, token) = self.tracker.acquire_command(ResourceKind::Device, || {
            let attached = Cmd::new("mdconfig")
                .args(["-a", "-t", "vnode", "-o", "readonly", "-f"])
                .arg_path(&backing)
                .error_msg("mdconfig attach failed")
                .run()
                .map_err(|e| Error::resource("attaching memory device", e))?;
            let unit = parse_md_unit(&attached.stdout)?;
            let release = Cmd::new("mdconfig").args(["-d", "-u", unit.as_str()]);
            Ok((unit.clone(), unit, release))
        })?;
        handle.tokens.push(token);
        handle.device = Some(unit.clone());

        let listing = Cmd::new("gpart")
            .args(["show", "-p", unit.as_str()])
            .allow_fail()
            .run()
            .map_err(|e| Error::resource(format!("reading partition table of '{unit}'"), e))?;
        let partitions = parse_gpart_show(&listing.stdout);
        let (partition, kind) = select_data_partition(&unit, &partitions)?;
        debug!(partition = %partition.name, %kind, "selected data partition");
        handle.filesystem = Some(kind);

        let provider = PathBuf::from("/dev").join(&partition.name);
        match kind {
            FilesystemKind::Ufs => self.mount_ufs(handle, &provider),
            FilesystemKind::Zfs => self.import_zfs(handle, &provider),
        }
    }

    fn mount_ufs(&self, handle: &mut ImageHandle, provider: &Path) -> Result<()> {
        let root = handle.mount_root.clone();
        let ((), token) = self.tracker.acquire_command(ResourceKind::Mount, || {
            Cmd::new("mount")
                .args(["-t", "ufs", "-o", "ro"])
                .arg_path(provider)
                .arg_path(&root)
                .error_msg("mount failed")
                .run()
                .map_err(|e| Error::resource(format!("mounting '{}'", provider.display()), e))?;
            let release = Cmd::new("umount").arg("-f").arg_path(&root);
            Ok(((), root.display().to_string(), release))
        })?;
        handle.tokens.push(token);
        Ok(())
    }

    fn import_zfs(&self, handle: &mut ImageHandle, provider: &Path) -> Result<()> {
        let device = provider.display().to_string();
        let root = handle.mount_root.clone();

        // Without a pool argument `zpool import` only lists; it exits non-zero
        // when nothing is importable.
        let listing = Cmd::new("zpool")
            .args(["import", "-d"])
            .arg_path(provider)
            .allow_fail()
            .run()
            .map_err(|e| Error::resource(format!("listing pools on '{device}'"), e))?;
        let candidate = zfs::select_pool(&device, zfs::parse_import_listing(&listing.stdout))?;

        let scoped = zfs::scoped_pool_name();
        info!(pool = %candidate.name, guid = %candidate.guid, temporary = %scoped, "importing pool");
        let ((), token) = self.tracker.acquire_command(ResourceKind::Pool, || {
            Cmd::new("zpool")
                .args(["import", "-f", "-N", "-t", "-o", "readonly=on", "-R"])
                .arg_path(&root)
                .arg("-d")
                .arg_path(provider)
                .args([candidate.guid.as_str(), scoped.as_str()])
                .error_msg("zpool import failed")
                .run()
                .map_err(|e| Error::resource(format!("importing pool '{}'", candidate.name), e))?;
            let release = Cmd::new("zpool").args(["export", "-f", scoped.as_str()]);
            Ok(((), scoped.clone(), release))
        })?;
        handle.tokens.push(token);
        handle.pool = Some(scoped.clone());

        let bootfs = Cmd::new("zpool")
            .args(["get", "-H", "-o", "value", "bootfs", scoped.as_str()])
            .run()
            .map_err(|e| Error::resource(format!("reading bootfs of '{scoped}'"), e))?;
        let boot = zfs::boot_dataset(&scoped, &bootfs.stdout);
        zfs_mount(&boot)?;

        let datasets = Cmd::new("zfs")
            .args(["list", "-H", "-o", "name,canmount,mountpoint", "-r", scoped.as_str()])
            .run()
            .map_err(|e| Error::resource(format!("listing datasets of '{scoped}'"), e))?;
        for dataset in zfs::mountable_datasets(&datasets.stdout, &boot) {
            zfs_mount(&dataset)?;
        }
        Ok(())
    }
}

fn zfs_mount(dataset: &str) -> Result<()> {
    debug!(dataset, "mounting dataset");
    Cmd::new("zfs")
        .args(["mount", dataset])
        .run()
        .map(|_| ())
        .map_err(|e| Error::resource(format!("mounting dataset '{dataset}'"), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn kernel_path_is_under_root() {
        let handle = ImageHandle::new(Path::new("/tmp/x.raw"), PathBuf::from("/w/mnt-1"));
        assert_eq!(handle.kernel_path(), PathBuf::from("/w/mnt-1/boot/kernel/kernel"));
        assert_eq!(handle.device(), None);
    }

    #[test]
    fn failed_attach_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let image = tmp.path().join("disk.raw");
        fs::write(&image, b"not a disk").unwrap();

        let tracker = ResourceTracker::new();
        let mounter = ImageMounter::new(&tracker, tmp.path());
        // On hosts without mdconfig this fails to spawn; where it exists the
        // file is not a valid disk, or the caller is not privileged.
        if let Ok(handle) = mounter.mount(&image) {
            mounter.unmount(handle).unwrap();
        }
        assert_eq!(tracker.active_count(), 0);
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("mnt-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn unmount_releases_in_reverse_and_reports_first_failure() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("order.log");
        let tracker = ResourceTracker::new();
        let mounter = ImageMounter::new(&tracker, tmp.path());

        let root = tmp.path().join("mnt-test");
        let mut handle = ImageHandle::new(Path::new("disk.raw"), root.clone());
        handle.tokens.push(tracker.create_mount_point(&root).unwrap());
        let step = |name: &str, fail: bool| {
            Cmd::new("sh").args([
                "-c".to_string(),
                format!(
                    "echo {name} >> '{}'; {}",
                    log.display(),
                    if fail { "exit 1" } else { "true" }
                ),
            ])
        };
        handle
            .tokens
            .push(tracker.track_command(ResourceKind::Device, "md9", step("device", false)));
        handle
            .tokens
            .push(tracker.track_command(ResourceKind::Mount, "mnt", step("mount", true)));

        let err = mounter.unmount(handle).unwrap_err();
        assert!(matches!(err, Error::Resource { .. }));
        assert_eq!(fs::read_to_string(&log).unwrap(), "mount\ndevice\n");
        // The mount point was empty, so rmdir succeeds despite the failed umount.
        assert!(!root.exists());
        // The failed umount is still owed to the final teardown.
        assert_eq!(tracker.active_count(), 1);
    }

    #[test]
    fn mount_point_over_a_live_mount_is_left_alone() {
        let tmp = TempDir::new().unwrap();
        let tracker = ResourceTracker::new();
        let mounter = ImageMounter::new(&tracker, tmp.path());

        let root = tmp.path().join("mnt-live");
        let mut handle = ImageHandle::new(Path::new("disk.raw"), root.clone());
        handle.tokens.push(tracker.create_mount_point(&root).unwrap());
        // A filesystem that `umount` failed to detach still shows its tree.
        fs::create_dir_all(root.join("boot/kernel")).unwrap();
        fs::write(root.join("boot/kernel/kernel"), b"\x7fELF").unwrap();
        handle
            .tokens
            .push(tracker.track_command(ResourceKind::Mount, "mnt-live", Cmd::new("false")));

        assert!(mounter.unmount(handle).is_err());
        assert!(root.join("boot/kernel/kernel").exists());
        assert_eq!(tracker.active_count(), 2);
    }
}
