//! Teardown on termination signals.
//!
//! The handler only writes the signal number to a pipe. A watcher thread
//! reads it, ignores any further termination signals and tears down:
//!
//! 1. wait for an acquisition in progress to register its release
//! 2. stop running host commands (`make`, `git`, attaches) and let their
//!    threads reap them, so nothing recreates what is about to be released
//! 3. release every tracked resource in reverse order
//!
//! Then it re-raises the signal with its default disposition so the exit
//! status still reports the signal.

use std::io;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use tracing::warn;

use super::ResourceTracker;
use crate::error::{Error, Result};
use crate::process;

/// Time host commands get after SIGTERM before their groups are killed.
const CHILD_GRACE: Duration = Duration::from_secs(10);

/// Signals that trigger teardown.
pub const TERMINATION_SIGNALS: [c_int; 5] = [
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTERM,
    libc::SIGALRM,
    libc::SIGHUP,
];

static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(sig: c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let byte = sig as u8;
    // SAFETY: write(2) is async-signal-safe; the buffer is a live stack byte.
    unsafe {
        libc::write(fd, (&byte as *const u8).cast(), 1);
    }
}

/// Route termination signals to a teardown of `tracker`.
///
/// Call once, early, before any resource is acquired.
pub fn install_teardown_on_signal(tracker: ResourceTracker) -> Result<()> {
    let mut fds = [0 as c_int; 2];
    // SAFETY: `fds` is a valid two-element buffer for pipe(2).
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Error::resource(
            "creating signal pipe",
            io::Error::last_os_error(),
        ));
    }
    let [read_fd, write_fd] = fds;
    PIPE_WRITE_FD.store(write_fd, Ordering::Relaxed);

    std::thread::Builder::new()
        .name("signal-teardown".into())
        .spawn(move || watch(read_fd, tracker))
        .map_err(|e| Error::resource("spawning signal watcher", e))?;

    let handler: extern "C" fn(c_int) = forward_signal;
    for sig in TERMINATION_SIGNALS {
        // SAFETY: the handler only performs an async-signal-safe write.
        let previous = unsafe { libc::signal(sig, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(Error::resource(
                format!("installing handler for signal {sig}"),
                io::Error::last_os_error(),
            ));
        }
    }
    Ok(())
}

fn watch(read_fd: c_int, tracker: ResourceTracker) {
    let mut byte = 0u8;
    loop {
        // SAFETY: reading one byte into a live stack buffer.
        let n = unsafe { libc::read(read_fd, (&mut byte as *mut u8).cast(), 1) };
        if n == 1 {
            break;
        }
        if n < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return;
    }

    let sig = c_int::from(byte);
    teardown_for_signal(&tracker, sig);
    reraise(sig);
}

/// Mask further termination signals, stop running children and release
/// everything once.
fn teardown_for_signal(tracker: &ResourceTracker, sig: c_int) -> usize {
    for s in TERMINATION_SIGNALS {
        // SAFETY: setting SIG_IGN has no handler preconditions.
        unsafe {
            libc::signal(s, libc::SIG_IGN);
        }
    }
    warn!(signal = sig, "termination signal received; releasing tracked resources");
    tracker.release_all_after(|| process::terminate_children(CHILD_GRACE))
}

fn reraise(sig: c_int) -> ! {
    // SAFETY: restoring the default disposition and raising the same signal.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
    std::process::exit(128 + sig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Cmd;
    use std::fs;
    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;
    use std::thread::sleep;
    use std::time::Instant;
    use tempfile::TempDir;

    /// Set in the re-executed test binary; names the scratch directory.
    const CHILD_DIR_ENV: &str = "IMAGE_REPRO_SIGNAL_CHILD_DIR";

    /// Body of the re-executed child: track a file and an object tree, then
    /// block in a host command that would attach a device and repopulate the
    /// object tree if it were left running.
    fn run_signalled_child(dir: &Path) -> ! {
        let tracker = ResourceTracker::new();
        install_teardown_on_signal(tracker.clone()).unwrap();
        let _teardown = tracker.guard();

        let image = dir.join("image.raw");
        fs::write(&image, b"raw").unwrap();
        tracker.track_file(&image);
        tracker.create_dir(&dir.join("obj")).unwrap();

        let _ = Cmd::new("sh")
            .args([
                "-c",
                "touch ready; sleep 1; touch md-attached; mkdir -p obj/again",
            ])
            .dir(dir)
            .run_interactive();
        tracker.track_file(&dir.join("md-attached"));

        // The watcher re-raises the signal; reaching the end means it did not.
        sleep(Duration::from_secs(10));
        std::process::exit(3)
    }

    #[test]
    fn termination_signal_stops_children_and_releases_everything() {
        if let Some(dir) = std::env::var_os(CHILD_DIR_ENV) {
            run_signalled_child(Path::new(&dir));
        }

        let tmp = TempDir::new().unwrap();
        let mut child = std::process::Command::new(std::env::current_exe().unwrap())
            .args([
                "--exact",
                "resource::signals::tests::termination_signal_stops_children_and_releases_everything",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(CHILD_DIR_ENV, tmp.path())
            .spawn()
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(30);
        while !tmp.path().join("ready").exists() {
            assert!(Instant::now() < deadline, "child never started its host command");
            sleep(Duration::from_millis(20));
        }
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM), "{status:?}");

        // Past the point where a surviving `sh` would have finished.
        sleep(Duration::from_millis(1500));
        assert!(!tmp.path().join("image.raw").exists());
        assert!(!tmp.path().join("obj").exists());
        assert!(!tmp.path().join("md-attached").exists());
    }
}
