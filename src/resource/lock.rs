//! Host-wide run lock.
//!
//! Memory devices and imported pools are host-global, so only one
//! verification run per host is supported. The lock is advisory (`flock`)
//! and released when the [`RunLock`] is dropped or the process dies.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct RunLock {
    _file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        // Never unlink the lock file: a second process could create a fresh
        // inode at the same path and lock that one instead.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::io(path, e))?;

        if file.try_lock_exclusive().is_err() {
            return Err(Error::resource(
                "acquiring run lock",
                format!(
                    "another verification run holds '{}'; only one run per host is supported",
                    path.display()
                ),
            ));
        }
        debug!(path = %path.display(), "acquired run lock");
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
