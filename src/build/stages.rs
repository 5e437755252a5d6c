//! The three make stages: world, kernel, disk image.

use std::path::{Path, PathBuf};

use tracing::{info, info_span};

use super::BuildStage;
use crate::config::BuildConfig;
use crate::error::{Error, Result};
use crate::identity::BuildIdentity;
use crate::process::Cmd;

/// One make invocation.
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub stage: BuildStage,
    pub cmd: Cmd,
}

/// Make invocations in execution order.
pub fn stage_plan(
    build: &BuildConfig,
    identity: &BuildIdentity,
    source_dir: &Path,
    object_dir: &Path,
) -> Vec<StageCommand> {
    let jobs = format!("-j{}", build.effective_jobs());
    let target = [
        format!("TARGET={}", identity.platform),
        format!("TARGET_ARCH={}", identity.arch),
        format!("KERNCONF={}", build.kernconf),
    ];
    let make = |dir: PathBuf| {
        Cmd::new(&build.make)
            .arg("-C")
            .arg_path(&dir)
            .env("MAKEOBJDIRPREFIX", object_dir)
            .dir(source_dir)
    };

    vec![
        StageCommand {
            stage: BuildStage::World,
            cmd: make(source_dir.to_path_buf())
                .args([jobs.as_str(), "buildworld"])
                .args(&target),
        },
        StageCommand {
            stage: BuildStage::Kernel,
            cmd: make(source_dir.to_path_buf())
                .args([jobs.as_str(), "buildkernel"])
                .args(&target),
        },
        StageCommand {
            stage: BuildStage::Image,
            cmd: make(source_dir.join("release"))
                .args(&build.image_make_args)
                .args(&target),
        },
    ]
}

/// Run every stage; the first non-zero exit stops the build.
pub fn run_all(
    build: &BuildConfig,
    identity: &BuildIdentity,
    source_dir: &Path,
    object_dir: &Path,
) -> Result<()> {
    for StageCommand { stage, cmd } in stage_plan(build, identity, source_dir, object_dir) {
        let _span = info_span!("stage", %stage).entered();
        info!(command = %cmd, "starting build stage");
        cmd.error_msg(format!("{stage} stage failed"))
            .run_interactive()
            .map_err(|e| Error::build(stage, e))?;
        info!("build stage complete");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Arch, Branch, CommitHash, Platform};
    use tempfile::TempDir;

    fn identity() -> BuildIdentity {
        BuildIdentity {
            platform: Platform::Arm64,
            arch: Arch::Aarch64,
            branch: Branch::parse("stable/14").unwrap(),
            commit: CommitHash::parse("0123456789ab").unwrap(),
        }
    }

    #[test]
    fn plan_orders_world_kernel_image() {
        let build = BuildConfig {
            jobs: 8,
            ..BuildConfig::default()
        };
        let plan = stage_plan(&build, &identity(), Path::new("/w/src"), Path::new("/w/obj"));
        let stages: Vec<BuildStage> = plan.iter().map(|s| s.stage).collect();
        assert_eq!(stages, vec![BuildStage::World, BuildStage::Kernel, BuildStage::Image]);

        let world = plan[0].cmd.to_string();
        assert_eq!(
            world,
            "make -C /w/src -j8 buildworld TARGET=arm64 TARGET_ARCH=aarch64 KERNCONF=GENERIC"
        );
        let image = plan[2].cmd.to_string();
        assert!(image.starts_with("make -C /w/src/release vm-image"), "{image}");
        assert!(image.contains("VMFORMATS=raw"));
    }

    #[test]
    fn failing_stage_is_named() {
        let tmp = TempDir::new().unwrap();
        let build = BuildConfig {
            make: "false".into(),
            jobs: 1,
            ..BuildConfig::default()
        };
        let err = run_all(&build, &identity(), tmp.path(), tmp.path()).unwrap_err();
        assert!(
            matches!(err, Error::Build { stage: BuildStage::World, .. }),
            "{err}"
        );
    }

    #[test]
    fn later_stage_failure_stops_the_build() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("stages.log");
        let script = tmp.path().join("make");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\n\
                 for a in \"$@\"; do case \"$a\" in build*|vm-image) echo \"$a\" >> '{}';; esac; done\n\
                 case \"$*\" in *buildkernel*) exit 2;; esac\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let build = BuildConfig {
            make: script.display().to_string(),
            jobs: 1,
            ..BuildConfig::default()
        };
        let err = run_all(&build, &identity(), tmp.path(), tmp.path()).unwrap_err();
        assert!(matches!(err, Error::Build { stage: BuildStage::Kernel, .. }), "{err}");
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "buildworld\nbuildkernel\n");
    }
}
