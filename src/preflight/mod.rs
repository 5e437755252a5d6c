//! Preflight checks for verification runs.
//!
//! Validates that the host has the tools the pipeline shells out to, and
//! that the process may attach devices and mount filesystems, before any
//! resource is acquired. This prevents a half-run that fails at mount time.
//!
//! # Example
//!
//! ```rust
//! use image_repro::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("mdconfig") {
//!     println!("not a FreeBSD host");
//! }
//!
//! let tools = &[("git", "devel/git"), ("zpool", "base system")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::error::{Error, Result};

/// Check if a command exists on the host system.
///
/// Resolves `cmd` against `PATH` (or as a path, if it contains a separator).
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools every run needs.
///
/// Each tuple is (command_name, where it comes from).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("mdconfig", "base system"),
    ("gpart", "base system"),
    ("mount", "base system"),
    ("umount", "base system"),
    ("zpool", "base system"),
    ("zfs", "base system"),
    ("git", "devel/git"),
];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` listing every missing tool
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, origin)| format!("  {} (from: {})", tool, origin))
        .collect();

    if !missing.is_empty() {
        return Err(Error::resource(
            "host preflight",
            format!("missing required host tools:\n{}", missing.join("\n")),
        ));
    }
    Ok(())
}

/// Check [`REQUIRED_TOOLS`] plus the configured `make`.
pub fn check_host_tools(make: &str) -> Result<()> {
    let mut tools = REQUIRED_TOOLS.to_vec();
    tools.push((make, "base system (bmake)"));
    check_required_tools(&tools)
}

/// Device attach, mount and pool import need root.
pub fn require_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(Error::resource(
            "host preflight",
            format!("must run as root (effective uid is {euid})"),
        ));
    }
    Ok(())
}
