//! Recover build identity from the printable strings of a kernel binary.
//!
//! A release kernel embeds a descriptor such as
//! `FreeBSD 14.1-RELEASE-p1 releng/14.1-n267679-10e31f0946d8 GENERIC`
//! plus bare `MACHINE` / `MACHINE_ARCH` tokens (`amd64`, `aarch64`, ...).
//! Extraction is best-effort string scraping, but its outcome is explicit:
//! a field the caller did not supply is either recovered or the whole
//! extraction fails with [`Error::MetadataUnavailable`]. Nothing is guessed.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info};

use super::{Arch, Branch, CommitHash, PartialIdentity, Platform};
use crate::error::{Error, Result};

/// Shortest printable run kept. strings(1) defaults to 4, but a bare
/// `MACHINE` token such as `arm` is three bytes long.
const SCAN_MIN_LEN: usize = 3;

/// Kernel location inside a mounted image root.
pub const KERNEL_RELATIVE_PATH: &str = "boot/kernel/kernel";

fn descriptor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:RELEASE|STABLE|CURRENT|MAIN)\b.*\b(?:releng|stable|main)\b.*\bGENERIC\b")
            .expect("static regex")
    })
}

fn branch_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[\s(])(main|stable/[0-9]+|releng/[0-9]+(?:\.[0-9]+)?)(?:[-\s)]|$)")
            .expect("static regex")
    })
}

fn commit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|[^0-9a-f])([0-9a-f]{12})").expect("static regex"))
}

/// Printable ASCII runs of at least `min_len` bytes, in file order.
pub fn printable_strings(bytes: &[u8], min_len: usize) -> Vec<String> {
    let mut strings = Vec::new();
    let mut start = None;
    for (i, &b) in bytes.iter().enumerate() {
        let printable = b == b'\t' || (0x20..0x7f).contains(&b);
        match (printable, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                if i - s >= min_len {
                    strings.push(String::from_utf8_lossy(&bytes[s..i]).into_owned());
                }
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        if bytes.len() - s >= min_len {
            strings.push(String::from_utf8_lossy(&bytes[s..]).into_owned());
        }
    }
    strings
}

/// Extract the identity fields `known` lacks from the kernel at `kernel`.
pub fn extract(kernel: &Path, known: &PartialIdentity) -> Result<PartialIdentity> {
    let bytes = fs::read(kernel).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::MetadataUnavailable(format!(
            "kernel binary '{}' not found in image",
            kernel.display()
        )),
        _ => Error::io(kernel, e),
    })?;
    let strings = printable_strings(&bytes, SCAN_MIN_LEN);
    debug!(kernel = %kernel.display(), strings = strings.len(), "scanned kernel strings");
    let found = extract_from_strings(&strings, known)?;
    info!(
        platform = ?found.platform,
        arch = ?found.arch,
        branch = ?found.branch.as_ref().map(Branch::as_str),
        commit = ?found.commit.as_ref().map(CommitHash::as_str),
        "recovered identity from kernel"
    );
    Ok(found)
}

/// Extract from already split strings. Only fields absent from `known` are returned.
pub fn extract_from_strings<S: AsRef<str>>(
    strings: &[S],
    known: &PartialIdentity,
) -> Result<PartialIdentity> {
    let mut found = PartialIdentity::default();

    if known.branch.is_none() || known.commit.is_none() {
        let descriptor: &str = strings
            .iter()
            .map(|s| s.as_ref())
            .find(|line| descriptor_re().is_match(line))
            .ok_or_else(|| {
                Error::MetadataUnavailable("no release descriptor line in kernel strings".into())
            })?;
        debug!(descriptor, "found release descriptor");

        if known.branch.is_none() {
            let token = branch_re()
                .captures(descriptor)
                .and_then(|c| c.get(1))
                .ok_or_else(|| {
                    Error::MetadataUnavailable(format!("no branch token in '{descriptor}'"))
                })?;
            found.branch = Some(Branch::parse(token.as_str()).map_err(|_| {
                Error::MetadataUnavailable(format!("malformed branch '{}'", token.as_str()))
            })?);
        }

        if known.commit.is_none() {
            let token = commit_re()
                .captures(descriptor)
                .and_then(|c| c.get(1))
                .ok_or_else(|| {
                    Error::MetadataUnavailable(format!("no commit hash in '{descriptor}'"))
                })?;
            found.commit = Some(CommitHash::parse(token.as_str()).map_err(|_| {
                Error::MetadataUnavailable(format!("malformed commit '{}'", token.as_str()))
            })?);
        }
    }

    let platform = match known.platform {
        Some(platform) => platform,
        None => {
            let platform = find_platform(strings).ok_or_else(|| {
                Error::MetadataUnavailable("no machine platform line in kernel strings".into())
            })?;
            found.platform = Some(platform);
            platform
        }
    };

    if known.arch.is_none() {
        let arch = match platform.sole_arch() {
            Some(arch) => arch,
            None => find_arch(strings, platform).ok_or_else(|| {
                Error::MetadataUnavailable(format!(
                    "no {platform} architecture variant line in kernel strings"
                ))
            })?,
        };
        found.arch = Some(arch);
    }

    Ok(found)
}

fn find_platform<S: AsRef<str>>(strings: &[S]) -> Option<Platform> {
    strings.iter().find_map(|line| {
        let line = line.as_ref().trim();
        Platform::ALL.into_iter().find(|p| p.as_str() == line)
    })
}

/// Variants are tried most specific first so `powerpc64le` wins over `powerpc`.
fn find_arch<S: AsRef<str>>(strings: &[S], platform: Platform) -> Option<Arch> {
    platform.architectures().iter().copied().find(|arch| {
        strings
            .iter()
            .any(|line| line.as_ref().trim() == arch.as_str())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DESCRIPTOR: &str = "FreeBSD 14.1-RELEASE-p1 releng/14.1-n267679-10e31f0946d8 GENERIC";

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn printable_strings_splits_on_binary() {
        let blob = b"\x7fELF\x02\x01\x00amd64\x00ab\x00GENERIC kernel\n\xffend!";
        let strings = printable_strings(blob, 4);
        assert_eq!(strings, vec!["amd64", "GENERIC kernel", "end!"]);
        assert!(printable_strings(blob, 3).contains(&"ELF".to_string()));
    }

    #[test]
    fn releng_descriptor() {
        let strings = lines(&["@(#)", DESCRIPTOR, "amd64"]);
        let found = extract_from_strings(&strings, &PartialIdentity::default()).unwrap();
        assert_eq!(found.branch.unwrap().as_str(), "releng/14.1");
        assert_eq!(found.commit.unwrap().as_str(), "10e31f0946d8");
        assert_eq!(found.platform, Some(Platform::Amd64));
        assert_eq!(found.arch, Some(Arch::Amd64));
    }

    #[test]
    fn stable_descriptor_takes_first_twelve_hex() {
        let strings = lines(&[
            "FreeBSD 14.2-STABLE stable/14-n269000-0123456789abcdef GENERIC",
            "arm64",
        ]);
        let found = extract_from_strings(&strings, &PartialIdentity::default()).unwrap();
        assert_eq!(found.branch.unwrap().as_str(), "stable/14");
        assert_eq!(found.commit.unwrap().as_str(), "0123456789ab");
        assert_eq!(found.arch, Some(Arch::Aarch64));
    }

    #[test]
    fn main_descriptor() {
        let strings = lines(&[
            "FreeBSD 15.0-CURRENT main-n270000-aabbccddeeff GENERIC",
            "riscv",
            "riscv64",
        ]);
        let found = extract_from_strings(&strings, &PartialIdentity::default()).unwrap();
        assert_eq!(found.branch.unwrap().as_str(), "main");
        assert_eq!(found.platform, Some(Platform::Riscv));
        assert_eq!(found.arch, Some(Arch::Riscv64));
    }

    #[test]
    fn variant_prefers_most_specific_token() {
        let strings = lines(&[DESCRIPTOR, "powerpc", "powerpc64le"]);
        let found = extract_from_strings(&strings, &PartialIdentity::default()).unwrap();
        assert_eq!(found.platform, Some(Platform::Powerpc));
        assert_eq!(found.arch, Some(Arch::Powerpc64le));
    }

    #[test]
    fn missing_descriptor_is_unavailable() {
        let strings = lines(&["amd64", "some driver string", "GENERIC"]);
        let err = extract_from_strings(&strings, &PartialIdentity::default()).unwrap_err();
        assert!(matches!(err, Error::MetadataUnavailable(_)), "{err}");
    }

    #[test]
    fn missing_variant_is_unavailable() {
        let strings = lines(&[DESCRIPTOR, "arm"]);
        let err = extract_from_strings(&strings, &PartialIdentity::default()).unwrap_err();
        assert!(matches!(err, Error::MetadataUnavailable(_)));
    }

    #[test]
    fn supplied_fields_are_not_scanned() {
        let known = PartialIdentity {
            branch: Some(Branch::parse("releng/14.1").unwrap()),
            commit: Some(CommitHash::parse("10e31f0946d8").unwrap()),
            platform: Some(Platform::Arm),
            arch: None,
        };
        // No descriptor at all: fine, branch and commit were supplied.
        let found = extract_from_strings(&lines(&["armv7"]), &known).unwrap();
        assert_eq!(found.branch, None);
        assert_eq!(found.commit, None);
        assert_eq!(found.platform, None);
        assert_eq!(found.arch, Some(Arch::Armv7));
    }

    #[test]
    fn extract_reads_kernel_file() {
        let tmp = TempDir::new().unwrap();
        let kernel = tmp.path().join("kernel");
        let mut blob = b"\x7fELF\x02\x01\x01\x00\x00".to_vec();
        blob.extend_from_slice(DESCRIPTOR.as_bytes());
        blob.extend_from_slice(b"\n\x00\x00i386\x00\x01\x02");
        fs::write(&kernel, blob).unwrap();

        let found = extract(&kernel, &PartialIdentity::default()).unwrap();
        assert_eq!(found.platform, Some(Platform::I386));
        assert_eq!(found.commit.unwrap().as_str(), "10e31f0946d8");
    }

    #[test]
    fn absent_kernel_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let err = extract(&tmp.path().join("kernel"), &PartialIdentity::default()).unwrap_err();
        assert!(matches!(err, Error::MetadataUnavailable(_)));
    }
}
