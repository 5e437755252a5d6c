//! Deterministic content manifests of directory trees.
//!
//! A manifest is one `<relative-path>|<sha256>` line per regular file,
//! sorted by path. Hashing the same tree twice yields identical bytes.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Separator between path and digest on a manifest line.
pub const FIELD_SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ManifestEntry {
    /// Path relative to the hashed root, `/`-separated.
    pub path: String,
    /// Lowercase hex SHA-256 of the file contents.
    pub digest: String,
}

impl ManifestEntry {
    pub fn line(&self) -> String {
        format!("{}{FIELD_SEPARATOR}{}", self.path, self.digest)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build a manifest from entries in any order.
    pub fn from_entries(mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort();
        Self { entries }
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lines(&self) -> Vec<String> {
        self.entries.iter().map(ManifestEntry::line).collect()
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for entry in &self.entries {
            let _ = writeln!(text, "{}", entry.line());
        }
        text
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_text()).map_err(|e| Error::io(path, e))?;
        debug!(path = %path.display(), entries = self.len(), "wrote manifest");
        Ok(())
    }
}

/// Hash every regular file under `root`.
///
/// Symlinks are not followed and are not listed; neither are directories or
/// special files. Any unreadable entry aborts the whole walk.
pub fn hash_tree(root: &Path) -> Result<Manifest> {
    info!(root = %root.display(), "hashing tree");
    let mut entries = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
            Error::io(path, source)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::io(entry.path(), std::io::Error::other(e)))?;
        let (digest, _size) = sha256_file(entry.path())?;
        entries.push(ManifestEntry {
            path: manifest_path(relative),
            digest,
        });
    }
    let manifest = Manifest::from_entries(entries);
    info!(root = %root.display(), files = manifest.len(), "tree hashed");
    Ok(manifest)
}

/// Relative path with `/` separators. Newlines are escaped so every entry
/// stays on one line; non-UTF-8 bytes are replaced.
fn manifest_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
}

fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf).map_err(|e| Error::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}
