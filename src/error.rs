//! Error taxonomy for the verification pipeline.
//!
//! Every fatal condition maps to one variant, and every variant maps to a
//! stable process exit code. Mismatching manifests are NOT an error: they
//! are reported through [`crate::compare::VerificationReport`].

use std::path::{Path, PathBuf};

use crate::build::BuildStage;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort a verification run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Bad or missing command-line input.
    #[error("usage error: {0}")]
    Usage(String),

    /// Configuration file could not be read or is invalid.
    #[error("invalid configuration '{}': {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    /// Image container format is not a (compressed) raw image.
    #[error("unsupported image format '{locator}': {reason}")]
    Format { locator: String, reason: String },

    /// Requested image source exists but is not implemented.
    #[error("unsupported image source: {0}")]
    Unsupported(String),

    // =========================================================================
    // Acquisition / Host Resource Errors
    // =========================================================================
    /// Download failed. Never retried.
    #[error("failed to download '{url}': {reason}")]
    Network { url: String, reason: String },

    /// Device attach, mount, pool import, unmount or host lock failure.
    #[error("{action} failed: {reason}")]
    Resource { action: String, reason: String },

    /// The image carries no partition with a supported filesystem.
    #[error("unsupported filesystem on '{device}': {detail}")]
    UnsupportedFilesystem { device: String, detail: String },

    // =========================================================================
    // Verification Errors
    // =========================================================================
    /// Build identity could not be recovered and was not supplied.
    #[error("build identity unavailable: {0}")]
    MetadataUnavailable(String),

    /// A build stage exited non-zero.
    #[error("build stage '{stage}' failed: {reason}")]
    Build { stage: BuildStage, reason: String },

    /// Filesystem I/O failure (hashing, staging, result files).
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn resource(action: impl Into<String>, reason: impl ToString) -> Self {
        Self::Resource {
            action: action.into(),
            reason: reason.to_string(),
        }
    }

    pub fn build(stage: BuildStage, reason: impl ToString) -> Self {
        Self::Build {
            stage,
            reason: reason.to_string(),
        }
    }

    /// Process exit status for this error (sysexits-style, never zero).
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) | Self::Unsupported(_) => 64,
            Self::Format { .. } | Self::MetadataUnavailable(_) => 65,
            Self::Network { .. } => 69,
            Self::Build { .. } => 70,
            Self::Resource { .. } | Self::UnsupportedFilesystem { .. } => 71,
            Self::Config { .. } => 78,
            Self::Io { .. } => 74,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_error_names_stage() {
        let err = Error::build(BuildStage::Kernel, "make exited with 2");
        let msg = err.to_string();
        assert!(msg.contains("kernel"), "should name the stage: {msg}");
        assert!(msg.contains("exited with 2"));
    }

    #[test]
    fn exit_codes_are_nonzero_and_distinguish_categories() {
        let errors = [
            Error::Usage("x".into()),
            Error::Format {
                locator: "a.qcow2".into(),
                reason: "cow".into(),
            },
            Error::Network {
                url: "https://x".into(),
                reason: "timeout".into(),
            },
            Error::resource("mount", "busy"),
            Error::MetadataUnavailable("no descriptor".into()),
            Error::build(BuildStage::World, "status 1"),
            Error::io("/nope", std::io::Error::other("denied")),
        ];
        for err in &errors {
            assert_ne!(err.exit_code(), 0, "{err}");
        }
        assert_ne!(errors[0].exit_code(), errors[5].exit_code());
        assert_ne!(errors[3].exit_code(), errors[6].exit_code());
    }

    #[test]
    fn io_error_display_includes_path() {
        let err = Error::io(
            "/mnt/boot/kernel/kernel",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(err.to_string().contains("/mnt/boot/kernel/kernel"));
    }
}
