//! Source checkout.
//!
//! A full clone of the branch followed by a checkout of the commit: the
//! recorded commit is usually not the branch tip any more.

use std::path::Path;

use tracing::info;

use super::BuildStage;
use crate::error::{Error, Result};
use crate::identity::{Branch, CommitHash};
use crate::process::Cmd;

pub fn clone_branch(repository: &str, branch: &Branch, dest: &Path) -> Result<()> {
    info!(repository, %branch, dest = %dest.display(), "cloning source");
    Cmd::new("git")
        .args(["clone", "--quiet", "--branch", branch.as_str(), repository])
        .arg_path(dest)
        .env("GIT_TERMINAL_PROMPT", "0")
        .error_msg(format!("git clone of '{branch}' failed"))
        .run_interactive()
        .map_err(|e| Error::build(BuildStage::Clone, e))
}

/// Check out `commit` detached and confirm `HEAD` resolves to it.
pub fn checkout_commit(source_dir: &Path, commit: &CommitHash) -> Result<()> {
    info!(%commit, "pinning source tree");
    Cmd::new("git")
        .arg("-C")
        .arg_path(source_dir)
        .args(["-c", "advice.detachedHead=false", "checkout", "--quiet", commit.as_str()])
        .error_msg(format!("git checkout of '{commit}' failed"))
        .run()
        .map_err(|e| Error::build(BuildStage::Checkout, e))?;

    let head = Cmd::new("git")
        .arg("-C")
        .arg_path(source_dir)
        .args(["rev-parse", "HEAD"])
        .run()
        .map_err(|e| Error::build(BuildStage::Checkout, e))?;
    let head = head.stdout.trim();
    if !head.starts_with(commit.as_str()) {
        return Err(Error::build(
            BuildStage::Checkout,
            format!("HEAD is {head}, expected {commit}"),
        ));
    }
    Ok(())
}
