//! Partition discovery on an attached memory device.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    Ufs,
    Zfs,
}

impl FilesystemKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "freebsd-ufs" => Some(Self::Ufs),
            "freebsd-zfs" => Some(Self::Zfs),
            _ => None,
        }
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ufs => "ufs",
            Self::Zfs => "zfs",
        })
    }
}

/// One provider line of `gpart show -p`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Provider name, e.g. `md0p4`.
    pub name: String,
    /// Partition type tag, e.g. `freebsd-ufs`.
    pub tag: String,
}

/// Parse the unit name printed by `mdconfig -a` (e.g. `md0`).
pub fn parse_md_unit(output: &str) -> Result<String> {
    let unit = output.trim();
    let valid = unit
        .strip_prefix("md")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
    if valid {
        Ok(unit.to_string())
    } else {
        Err(Error::resource(
            "attaching memory device",
            format!("unexpected mdconfig output '{unit}'"),
        ))
    }
}

/// Parse `gpart show -p <device>`:
///
/// ```text
/// =>      3  10485757    md0  GPT  (5.0G)
///         3       123  md0p1  freebsd-boot  (62K)
///   2163862   8321895  md0p4  freebsd-ufs  (4.0G)
/// ```
///
/// The geometry header (`=>`) and free-space lines (`- free -`) are skipped.
pub fn parse_gpart_show(output: &str) -> Vec<Partition> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                ["=>", ..] => None,
                [_start, _size, name, tag, ..] if *name != "-" => Some(Partition {
                    name: name.to_string(),
                    tag: tag.to_string(),
                }),
                _ => None,
            }
        })
        .collect()
}

/// First partition carrying a UFS or ZFS filesystem.
pub fn select_data_partition(
    device: &str,
    partitions: &[Partition],
) -> Result<(Partition, FilesystemKind)> {
    partitions
        .iter()
        .find_map(|p| FilesystemKind::from_tag(&p.tag).map(|kind| (p.clone(), kind)))
        .ok_or_else(|| {
            let tags: Vec<&str> = partitions.iter().map(|p| p.tag.as_str()).collect();
            Error::UnsupportedFilesystem {
                device: device.to_string(),
                detail: if tags.is_empty() {
                    "no partitions found".to_string()
                } else {
                    format!("no freebsd-ufs or freebsd-zfs partition among: {}", tags.join(", "))
                },
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const GPT_UFS: &str = "\
=>      3  10485757    md0  GPT  (5.0G)
        3       123  md0p1  freebsd-boot  (62K)
      126     66584  md0p2  efi  (33M)
    66710   2097152  md0p3  freebsd-swap  (1.0G)
  2163862   8321895  md0p4  freebsd-ufs  (4.0G)
 10485757         3         - free -  (1.5K)
";

    const GPT_ZFS: &str = "\
=>      40  12582832    md1  GPT  (6.0G)
        40      1024  md1p1  freebsd-boot  (512K)
      1064    532480  md1p2  efi  (260M)
    533544   2097152  md1p3  freebsd-swap  (1.0G)
   2630696   9952176  md1p4  freebsd-zfs  (4.7G)
";

    #[test]
    fn md_unit() {
        assert_eq!(parse_md_unit("md0\n").unwrap(), "md0");
        assert_eq!(parse_md_unit("md12").unwrap(), "md12");
        assert!(parse_md_unit("").is_err());
        assert!(parse_md_unit("mdconfig: ioctl(/dev/mdctl): Operation not permitted").is_err());
    }

    #[test]
    fn gpart_listing_skips_header_and_free_space() {
        let parts = parse_gpart_show(GPT_UFS);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].name, "md0p1");
        assert_eq!(parts[3].tag, "freebsd-ufs");
    }

    #[test]
    fn selects_first_ufs_or_zfs() {
        let (part, kind) = select_data_partition("md0", &parse_gpart_show(GPT_UFS)).unwrap();
        assert_eq!(part.name, "md0p4");
        assert_eq!(kind, FilesystemKind::Ufs);

        let (part, kind) = select_data_partition("md1", &parse_gpart_show(GPT_ZFS)).unwrap();
        assert_eq!(part.name, "md1p4");
        assert_eq!(kind, FilesystemKind::Zfs);
    }

    #[test]
    fn other_filesystems_are_unsupported() {
        let listing = "\
=>  63  2097089  md2  MBR  (1.0G)
    63  2097089  md2s1  ntfs  (1.0G)
";
        let err = select_data_partition("md2", &parse_gpart_show(listing)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFilesystem { .. }));
        assert!(err.to_string().contains("ntfs"));

        let err = select_data_partition("md3", &[]).unwrap_err();
        assert!(err.to_string().contains("no partitions"));
    }
}
