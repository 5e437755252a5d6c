//! Build identity: which platform, architecture, branch and commit produced an image.
//!
//! [`PartialIdentity`] collects fields from the caller and from kernel
//! introspection; a field, once set, is never overwritten. It only becomes
//! a [`BuildIdentity`] once every field is present.

pub mod extract;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

use crate::error::{Error, Result};

/// Machine platform (`TARGET`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Platform {
    Amd64,
    Arm,
    Arm64,
    I386,
    Powerpc,
    Riscv,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Self::Amd64,
        Self::Arm,
        Self::Arm64,
        Self::I386,
        Self::Powerpc,
        Self::Riscv,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
            Self::I386 => "i386",
            Self::Powerpc => "powerpc",
            Self::Riscv => "riscv",
        }
    }

    /// Architectures built for this platform, most specific token first.
    pub fn architectures(self) -> &'static [Arch] {
        match self {
            Self::Amd64 => &[Arch::Amd64],
            Self::Arm => &[Arch::Armv7, Arch::Armv6],
            Self::Arm64 => &[Arch::Aarch64],
            Self::I386 => &[Arch::I386],
            Self::Powerpc => &[
                Arch::Powerpc64le,
                Arch::Powerpc64,
                Arch::Powerpcspe,
                Arch::Powerpc,
            ],
            Self::Riscv => &[Arch::Riscv64],
        }
    }

    /// The architecture when the platform has exactly one.
    pub fn sole_arch(self) -> Option<Arch> {
        match self.architectures() {
            [only] => Some(*only),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::Usage(format!("unknown platform '{s}'")))
    }
}

/// Machine architecture (`TARGET_ARCH`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Arch {
    Amd64,
    Armv6,
    Armv7,
    Aarch64,
    I386,
    Powerpc,
    Powerpc64,
    Powerpc64le,
    Powerpcspe,
    Riscv64,
}

impl Arch {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Armv6 => "armv6",
            Self::Armv7 => "armv7",
            Self::Aarch64 => "aarch64",
            Self::I386 => "i386",
            Self::Powerpc => "powerpc",
            Self::Powerpc64 => "powerpc64",
            Self::Powerpc64le => "powerpc64le",
            Self::Powerpcspe => "powerpcspe",
            Self::Riscv64 => "riscv64",
        }
    }

    pub fn platform(self) -> Platform {
        match self {
            Self::Amd64 => Platform::Amd64,
            Self::Armv6 | Self::Armv7 => Platform::Arm,
            Self::Aarch64 => Platform::Arm64,
            Self::I386 => Platform::I386,
            Self::Powerpc | Self::Powerpc64 | Self::Powerpc64le | Self::Powerpcspe => {
                Platform::Powerpc
            }
            Self::Riscv64 => Platform::Riscv,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source branch: `main`, `stable/<N>` or `releng/<N>[.<N>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Branch(String);

impl Branch {
    pub fn parse(value: &str) -> Result<Self> {
        if is_valid_branch(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(Error::Usage(format!(
                "invalid branch '{value}'; expected main, stable/<N> or releng/<N>[.<N>]"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_valid_branch(value: &str) -> bool {
    fn number(s: &str) -> bool {
        !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
    }

    if value == "main" {
        return true;
    }
    if let Some(rest) = value.strip_prefix("stable/") {
        return number(rest);
    }
    if let Some(rest) = value.strip_prefix("releng/") {
        return match rest.split_once('.') {
            Some((major, minor)) => number(major) && number(minor),
            None => number(rest),
        };
    }
    false
}

/// Abbreviated or full commit hash: 7 to 40 lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitHash(String);

impl CommitHash {
    pub fn parse(value: &str) -> Result<Self> {
        let len_ok = (7..=40).contains(&value.len());
        if len_ok && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(Self(value.to_string()))
        } else {
            Err(Error::Usage(format!(
                "invalid commit hash '{value}'; expected 7-40 lowercase hex digits"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity fields known so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialIdentity {
    pub platform: Option<Platform>,
    pub arch: Option<Arch>,
    pub branch: Option<Branch>,
    pub commit: Option<CommitHash>,
}

impl PartialIdentity {
    pub fn is_complete(&self) -> bool {
        self.platform.is_some()
            && self.arch.is_some()
            && self.branch.is_some()
            && self.commit.is_some()
    }

    /// Fill only the fields that are still unset.
    pub fn merge_missing(&mut self, other: PartialIdentity) {
        if self.platform.is_none() {
            self.platform = other.platform;
        }
        if self.arch.is_none() {
            self.arch = other.arch;
        }
        if self.branch.is_none() {
            self.branch = other.branch;
        }
        if self.commit.is_none() {
            self.commit = other.commit;
        }
    }

    /// Derive what follows from the fields present: the platform of a given
    /// arch, or the only arch of a given platform. Rejects contradictions.
    pub fn normalize(&mut self) -> Result<()> {
        match (self.platform, self.arch) {
            (Some(platform), Some(arch)) if arch.platform() != platform => {
                return Err(Error::Usage(format!(
                    "architecture '{arch}' does not belong to platform '{platform}'"
                )));
            }
            (None, Some(arch)) => self.platform = Some(arch.platform()),
            (Some(platform), None) => self.arch = platform.sole_arch(),
            _ => {}
        }
        Ok(())
    }

    pub fn complete(self) -> Result<BuildIdentity> {
        let missing: Vec<&str> = [
            ("platform", self.platform.is_none()),
            ("arch", self.arch.is_none()),
            ("branch", self.branch.is_none()),
            ("commit", self.commit.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();

        match (self.platform, self.arch, self.branch, self.commit) {
            (Some(platform), Some(arch), Some(branch), Some(commit)) => Ok(BuildIdentity {
                platform,
                arch,
                branch,
                commit,
            }),
            _ => Err(Error::MetadataUnavailable(format!(
                "missing {}; supply them explicitly",
                missing.join(", ")
            ))),
        }
    }
}

/// Fully resolved identity of the source revision behind an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildIdentity {
    pub platform: Platform,
    pub arch: Arch,
    pub branch: Branch,
    pub commit: CommitHash,
}

impl fmt::Display for BuildIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {}@{}",
            self.platform, self.arch, self.branch, self.commit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_patterns() {
        for ok in ["main", "stable/14", "releng/14", "releng/14.1"] {
            assert!(Branch::parse(ok).is_ok(), "{ok}");
        }
        for bad in [
            "",
            "master",
            "stable/",
            "stable/14.1",
            "releng/14.",
            "releng/x.1",
            "releng/14.1.2",
            "main2",
        ] {
            assert!(Branch::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn commit_hash_patterns() {
        assert!(CommitHash::parse("10e31f0").is_ok());
        assert!(CommitHash::parse("10e31f0946d8").is_ok());
        assert!(CommitHash::parse(&"a".repeat(40)).is_ok());
        assert!(CommitHash::parse("10e31f").is_err());
        assert!(CommitHash::parse(&"a".repeat(41)).is_err());
        assert!(CommitHash::parse("10E31F0946D8").is_err());
        assert!(CommitHash::parse("10e31g0946d8").is_err());
    }

    #[test]
    fn platform_from_str() {
        assert_eq!("riscv".parse::<Platform>().unwrap(), Platform::Riscv);
        assert!("sparc64".parse::<Platform>().is_err());
    }

    #[test]
    fn every_arch_belongs_to_its_platform_list() {
        for platform in Platform::ALL {
            for arch in platform.architectures() {
                assert_eq!(arch.platform(), platform);
            }
        }
    }

    #[test]
    fn merge_never_overwrites() {
        let mut identity = PartialIdentity {
            branch: Some(Branch::parse("releng/14.1").unwrap()),
            ..Default::default()
        };
        identity.merge_missing(PartialIdentity {
            platform: Some(Platform::Amd64),
            branch: Some(Branch::parse("main").unwrap()),
            ..Default::default()
        });
        assert_eq!(identity.branch.unwrap().as_str(), "releng/14.1");
        assert_eq!(identity.platform, Some(Platform::Amd64));
    }

    #[test]
    fn normalize_infers_and_rejects() {
        let mut from_arch = PartialIdentity {
            arch: Some(Arch::Powerpc64le),
            ..Default::default()
        };
        from_arch.normalize().unwrap();
        assert_eq!(from_arch.platform, Some(Platform::Powerpc));

        let mut from_platform = PartialIdentity {
            platform: Some(Platform::Arm64),
            ..Default::default()
        };
        from_platform.normalize().unwrap();
        assert_eq!(from_platform.arch, Some(Arch::Aarch64));

        let mut ambiguous = PartialIdentity {
            platform: Some(Platform::Arm),
            ..Default::default()
        };
        ambiguous.normalize().unwrap();
        assert_eq!(ambiguous.arch, None);

        let mut contradictory = PartialIdentity {
            platform: Some(Platform::Amd64),
            arch: Some(Arch::Armv7),
            ..Default::default()
        };
        assert!(matches!(contradictory.normalize(), Err(Error::Usage(_))));
    }

    #[test]
    fn incomplete_identity_is_metadata_unavailable() {
        let partial = PartialIdentity {
            platform: Some(Platform::Amd64),
            arch: Some(Arch::Amd64),
            ..Default::default()
        };
        let err = partial.complete().unwrap_err();
        assert!(matches!(err, Error::MetadataUnavailable(_)));
        assert!(err.to_string().contains("branch, commit"));
    }
}
