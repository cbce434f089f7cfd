//! Process-group spawning and whole-tree termination.
//!
//! The legacy engine launches its own sub-tools, so killing the direct child
//! is not enough. On unix the engine becomes the leader of a fresh process
//! group and the whole group is killed; on Windows `taskkill /T` walks the tree.

use std::process::{Child, Command, Stdio};

use tracing::{debug, warn};

/// Arrange for `cmd` to start a new process group rooted at the child.
pub fn spawn_as_group_leader(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }
}

/// Forcibly terminate `child` and every process in its group/tree.
///
/// Does not reap the child; callers still `wait()` on it when it has not been
/// reaped yet.
pub fn terminate_tree(child: &mut Child) {
    let pid = child.id();
    if kill_group(pid) {
        debug!(pid, "process tree terminated");
        return;
    }
    warn!(pid, "process tree kill failed, killing direct child only");
    if let Err(err) = child.kill() {
        // InvalidInput means the child was already reaped.
        debug!(pid, err = %err, "kill direct child");
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) -> bool {
    Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(windows)]
fn kill_group(pid: u32) -> bool {
    Command::new("taskkill")
        .args(["/F", "/T", "/PID"])
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
fn kill_group(_pid: u32) -> bool {
    false
}
