//! Reproducibility verdict: a unified diff of two manifests.
//!
//! Both manifests are sorted by path, so the diff is a single merge walk
//! rather than a general LCS. A path in both with different digests shows
//! up as a `-` line followed by a `+` line; a path in only one of them as a
//! lone `-` or `+`. An empty diff means the images are reproducible.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identity::BuildIdentity;
use crate::manifest::{Manifest, ManifestEntry};

/// Unchanged lines shown around each change.
const CONTEXT_LINES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestChange {
    /// Only in the rebuilt image.
    Added { path: String, digest: String },
    /// Only in the original image.
    Removed { path: String, digest: String },
    /// In both, with different content.
    Changed {
        path: String,
        original: String,
        rebuilt: String,
    },
}

impl ManifestChange {
    pub fn path(&self) -> &str {
        match self {
            Self::Added { path, .. } | Self::Removed { path, .. } | Self::Changed { path, .. } => {
                path
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Delete,
    Insert,
}

#[derive(Debug, Clone)]
pub struct VerificationReport {
    diff: String,
    changes: Vec<ManifestChange>,
}

impl VerificationReport {
    pub fn is_reproducible(&self) -> bool {
        self.diff.is_empty()
    }

    /// Unified diff text; empty when the manifests match.
    pub fn diff(&self) -> &str {
        &self.diff
    }

    pub fn changes(&self) -> &[ManifestChange] {
        &self.changes
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, &self.diff).map_err(|e| Error::io(path, e))
    }
}

/// Diff `original` against `rebuilt`; labels head the `---`/`+++` lines.
pub fn compare(
    original: &Manifest,
    rebuilt: &Manifest,
    original_label: &str,
    rebuilt_label: &str,
) -> VerificationReport {
    let (ops, changes) = merge_walk(original.entries(), rebuilt.entries());
    let diff = if changes.is_empty() {
        String::new()
    } else {
        render_unified(&ops, original_label, rebuilt_label)
    };
    debug!(changes = changes.len(), "manifests compared");
    VerificationReport { diff, changes }
}

fn merge_walk(
    original: &[ManifestEntry],
    rebuilt: &[ManifestEntry],
) -> (Vec<(Op, String)>, Vec<ManifestChange>) {
    let mut ops = Vec::with_capacity(original.len().max(rebuilt.len()));
    let mut changes = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < original.len() || j < rebuilt.len() {
        match (original.get(i), rebuilt.get(j)) {
            (Some(a), Some(b)) if a.path == b.path => {
                if a.digest == b.digest {
                    ops.push((Op::Equal, a.line()));
                } else {
                    ops.push((Op::Delete, a.line()));
                    ops.push((Op::Insert, b.line()));
                    changes.push(ManifestChange::Changed {
                        path: a.path.clone(),
                        original: a.digest.clone(),
                        rebuilt: b.digest.clone(),
                    });
                }
                i += 1;
                j += 1;
            }
            (Some(a), Some(b)) if a.path < b.path => {
                ops.push((Op::Delete, a.line()));
                changes.push(removed(a));
                i += 1;
            }
            (Some(_), Some(b)) | (None, Some(b)) => {
                ops.push((Op::Insert, b.line()));
                changes.push(ManifestChange::Added {
                    path: b.path.clone(),
                    digest: b.digest.clone(),
                });
                j += 1;
            }
            (Some(a), None) => {
                ops.push((Op::Delete, a.line()));
                changes.push(removed(a));
                i += 1;
            }
            (None, None) => break,
        }
    }
    (ops, changes)
}

fn removed(entry: &ManifestEntry) -> ManifestChange {
    ManifestChange::Removed {
        path: entry.path.clone(),
        digest: entry.digest.clone(),
    }
}

fn render_unified(ops: &[(Op, String)], original_label: &str, rebuilt_label: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "--- {original_label}");
    let _ = writeln!(out, "+++ {rebuilt_label}");

    for (start, end) in hunk_bounds(ops) {
        let old_before = count(&ops[..start], Op::Insert);
        let new_before = count(&ops[..start], Op::Delete);
        let old_len = count(&ops[start..end], Op::Insert);
        let new_len = count(&ops[start..end], Op::Delete);
        let _ = writeln!(
            out,
            "@@ -{} +{} @@",
            range(old_before, old_len),
            range(new_before, new_len)
        );
        for (op, line) in &ops[start..end] {
            let marker = match op {
                Op::Equal => ' ',
                Op::Delete => '-',
                Op::Insert => '+',
            };
            let _ = writeln!(out, "{marker}{line}");
        }
    }
    out
}

/// Lines on one side of the diff: every op except those of `other_side`.
fn count(ops: &[(Op, String)], other_side: Op) -> usize {
    ops.iter().filter(|(op, _)| *op != other_side).count()
}

/// Hunk range in unified format: `start,len`, with `,len` omitted for 1.
fn range(before: usize, len: usize) -> String {
    match len {
        0 => format!("{before},0"),
        1 => format!("{}", before + 1),
        _ => format!("{},{len}", before + 1),
    }
}

/// `[start, end)` op ranges of each hunk, merging changes closer than
/// twice the context.
fn hunk_bounds(ops: &[(Op, String)]) -> Vec<(usize, usize)> {
    let mut hunks: Vec<(usize, usize)> = Vec::new();
    for (idx, _) in ops.iter().enumerate().filter(|(_, (op, _))| *op != Op::Equal) {
        let start = idx.saturating_sub(CONTEXT_LINES);
        let end = (idx + 1 + CONTEXT_LINES).min(ops.len());
        match hunks.last_mut() {
            Some(last) if start <= last.1 => last.1 = end,
            _ => hunks.push((start, end)),
        }
    }
    hunks
}

/// Paths of the three result files of one run.
#[derive(Debug, Clone)]
pub struct ResultFiles {
    pub image_manifest: PathBuf,
    pub obj_manifest: PathBuf,
    pub diff: PathBuf,
}

impl ResultFiles {
    /// `<date>-<platform>-<arch>-<commit>` under `results_dir`, dated today (UTC).
    pub fn for_run(results_dir: &Path, identity: &BuildIdentity) -> Self {
        Self::dated(results_dir, &today_utc(), identity)
    }

    pub fn dated(results_dir: &Path, date: &str, identity: &BuildIdentity) -> Self {
        let stem = format!(
            "{date}-{}-{}-{}",
            identity.platform, identity.arch, identity.commit
        );
        Self {
            image_manifest: results_dir.join(format!("{stem}-image.sha256")),
            obj_manifest: results_dir.join(format!("{stem}-obj.sha256")),
            diff: results_dir.join(format!("{stem}.diff")),
        }
    }

    pub fn ensure_dir(&self) -> Result<()> {
        if let Some(dir) = self.diff.parent() {
            fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        }
        Ok(())
    }

    pub fn write_report(&self, report: &VerificationReport) -> Result<()> {
        report.write_to(&self.diff)?;
        info!(
            path = %self.diff.display(),
            changes = report.changes().len(),
            "wrote diff"
        );
        Ok(())
    }
}

fn today_utc() -> String {
    let now = OffsetDateTime::now_utc();
    format!("{:04}{:02}{:02}", now.year(), now.month() as u8, now.day())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Arch, Branch, CommitHash, Platform};
    use tempfile::TempDir;

    fn manifest(items: &[(&str, &str)]) -> Manifest {
        Manifest::from_entries(
            items
                .iter()
                .map(|(path, digest)| ManifestEntry {
                    path: path.to_string(),
                    digest: digest.to_string(),
                })
                .collect(),
        )
    }

    #[test]
    fn identical_manifests_are_reproducible() {
        let m = manifest(&[("bin/sh", "aa"), ("boot/kernel/kernel", "bb")]);
        let report = compare(&m, &m.clone(), "image", "obj");
        assert!(report.is_reproducible());
        assert!(report.diff().is_empty());
        assert!(report.changes().is_empty());
    }

    #[test]
    fn single_changed_digest() {
        let original = manifest(&[("a", "01"), ("b", "02"), ("c", "03")]);
        let rebuilt = manifest(&[("a", "01"), ("b", "ff"), ("c", "03")]);
        let report = compare(&original, &rebuilt, "image.sha256", "obj.sha256");

        assert!(!report.is_reproducible());
        assert_eq!(
            report.diff(),
            "--- image.sha256\n+++ obj.sha256\n@@ -1,3 +1,3 @@\n a|01\n-b|02\n+b|ff\n c|03\n"
        );
        assert_eq!(
            report.changes(),
            &[ManifestChange::Changed {
                path: "b".into(),
                original: "02".into(),
                rebuilt: "ff".into()
            }]
        );
    }

    #[test]
    fn added_and_removed_paths() {
        let original = manifest(&[("a", "01"), ("gone", "02")]);
        let rebuilt = manifest(&[("a", "01"), ("new", "03")]);
        let report = compare(&original, &rebuilt, "o", "n");
        assert_eq!(
            report.diff(),
            "--- o\n+++ n\n@@ -1,2 +1,2 @@\n a|01\n-gone|02\n+new|03\n"
        );
        assert_eq!(
            report.changes(),
            &[
                ManifestChange::Removed {
                    path: "gone".into(),
                    digest: "02".into()
                },
                ManifestChange::Added {
                    path: "new".into(),
                    digest: "03".into()
                },
            ]
        );
    }

    #[test]
    fn distant_changes_get_separate_hunks() {
        let names: Vec<String> = (0..20).map(|i| format!("f{i:02}")).collect();
        let original = manifest(&names.iter().map(|n| (n.as_str(), "00")).collect::<Vec<_>>());
        let mut rebuilt_items: Vec<(&str, &str)> =
            names.iter().map(|n| (n.as_str(), "00")).collect();
        rebuilt_items[1].1 = "11";
        rebuilt_items[18].1 = "11";
        let rebuilt = manifest(&rebuilt_items);

        let diff = compare(&original, &rebuilt, "o", "n").diff().to_string();
        let headers: Vec<&str> = diff.lines().filter(|l| l.starts_with("@@")).collect();
        assert_eq!(headers, vec!["@@ -1,5 +1,5 @@", "@@ -16,5 +16,5 @@"]);
    }

    #[test]
    fn empty_original_range() {
        let report = compare(&manifest(&[]), &manifest(&[("a", "01")]), "o", "n");
        assert_eq!(report.diff(), "--- o\n+++ n\n@@ -0,0 +1 @@\n+a|01\n");
    }

    #[test]
    fn result_file_names() {
        let identity = BuildIdentity {
            platform: Platform::Amd64,
            arch: Arch::Amd64,
            branch: Branch::parse("releng/14.1").unwrap(),
            commit: CommitHash::parse("10e31f0946d8").unwrap(),
        };
        let files = ResultFiles::dated(Path::new("results"), "20241018", &identity);
        assert_eq!(
            files.image_manifest,
            Path::new("results/20241018-amd64-amd64-10e31f0946d8-image.sha256")
        );
        assert_eq!(
            files.obj_manifest,
            Path::new("results/20241018-amd64-amd64-10e31f0946d8-obj.sha256")
        );
        assert_eq!(files.diff, Path::new("results/20241018-amd64-amd64-10e31f0946d8.diff"));
    }

    #[test]
    fn empty_diff_file_is_written() {
        let tmp = TempDir::new().unwrap();
        let m = manifest(&[("a", "01")]);
        let path = tmp.path().join("r.diff");
        compare(&m, &m, "o", "n").write_to(&path).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "");
    }
}
