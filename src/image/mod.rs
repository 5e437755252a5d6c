//! Disk image sources, acquisition and mounting.
//!
//! ```text
//! ImageSource ──acquire──▶ raw image file ──mount──▶ ImageHandle ──unmount──▶ (gone)
//!  Local | Remote            (tracked temp)          md device + mount/pool
//! ```

pub mod acquire;
pub mod mount;
pub mod partitions;
pub mod zfs;

pub use acquire::ImageAcquirer;
pub use mount::{ImageHandle, ImageMounter};
pub use partitions::FilesystemKind;

use std::path::PathBuf;

/// Where the image to verify comes from. Each variant carries only what it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Local { path: PathBuf },
    Remote { url: String },
    /// Cloud-provider image. Export is not supported; acquisition refuses it.
    CloudManaged { image_id: String, region: String },
}

/// Compression wrapped around a raw payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Xz,
    Zstd,
    Gzip,
}

const COMPRESSION_SUFFIXES: &[(&str, Compression)] = &[
    (".xz", Compression::Xz),
    (".zst", Compression::Zstd),
    (".gz", Compression::Gzip),
];

const RAW_SUFFIXES: &[&str] = &[".raw", ".img"];

/// Copy-on-write and container disk formats, never accepted.
const CONTAINER_SUFFIXES: &[&str] = &[".qcow2", ".qcow", ".vmdk", ".vhd", ".vhdx", ".vdi"];

/// Classify an image file name by suffix. Pure: performs no I/O.
///
/// Accepts `<name>.raw|.img` optionally followed by `.xz|.zst|.gz`.
pub fn classify_name(name: &str) -> Result<Compression, String> {
    let lower = name.to_ascii_lowercase();
    let (payload, compression) = COMPRESSION_SUFFIXES
        .iter()
        .find_map(|(suffix, c)| lower.strip_suffix(suffix).map(|rest| (rest, *c)))
        .unwrap_or((lower.as_str(), Compression::None));

    if let Some(container) = CONTAINER_SUFFIXES.iter().find(|s| payload.ends_with(*s)) {
        return Err(format!(
            "'{}' is a copy-on-write/container disk format; only raw images are supported",
            &container[1..]
        ));
    }
    if RAW_SUFFIXES.iter().any(|s| payload.ends_with(s)) {
        return Ok(compression);
    }
    Err(format!(
        "unrecognized image suffix; expected one of {} optionally compressed with {}",
        RAW_SUFFIXES.join(", "),
        COMPRESSION_SUFFIXES
            .iter()
            .map(|(s, _)| *s)
            .collect::<Vec<_>>()
            .join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_and_compressed_raw_are_accepted() {
        assert_eq!(classify_name("disk.raw"), Ok(Compression::None));
        assert_eq!(classify_name("disk.img"), Ok(Compression::None));
        assert_eq!(
            classify_name("FreeBSD-14.1-RELEASE-amd64.raw.xz"),
            Ok(Compression::Xz)
        );
        assert_eq!(classify_name("vm.RAW.ZST"), Ok(Compression::Zstd));
        assert_eq!(classify_name("vm.img.gz"), Ok(Compression::Gzip));
    }

    #[test]
    fn container_formats_are_rejected() {
        for name in [
            "FreeBSD-14.1-RELEASE-amd64.qcow2",
            "FreeBSD-14.1-RELEASE-amd64.qcow2.xz",
            "vm.vmdk",
            "vm.vhd.xz",
            "vm.vhdx",
        ] {
            let err = classify_name(name).unwrap_err();
            assert!(err.contains("copy-on-write"), "{name}: {err}");
        }
    }

    #[test]
    fn unknown_suffixes_are_rejected() {
        assert!(classify_name("vm.iso").is_err());
        assert!(classify_name("vm.xz").is_err());
        assert!(classify_name("raw").is_err());
    }
}
