//! POSIX process control: process groups and signals

use super::Cleanup;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Interval for polling process exit after a signal (in milliseconds)
const EXIT_POLL_INTERVAL_MS: u64 = 100;

/// How long to wait for the tree to disappear after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

pub(crate) fn command(program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Run the server as leader of a new process group, outside the caller's
/// job control, so it outlives the caller and can be signalled as a tree.
pub(crate) fn detach(cmd: &mut Command) {
    cmd.process_group(0);
}

/// Give a build step its own process group so a timeout can kill its children too
pub(crate) fn isolate(cmd: &mut Command) {
    cmd.process_group(0);
}

pub(crate) fn process_exists(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only performs the existence and permission check
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send `signal` to the group led by `pid`, or to `pid` alone when it leads no group.
/// A target that is already gone counts as success.
fn signal_tree(pid: i32, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill has no memory-safety preconditions
    if unsafe { libc::kill(-pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        return Err(err);
    }

    // SAFETY: as above
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

async fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if !process_exists(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(EXIT_POLL_INTERVAL_MS)).await;
    }
}

/// SIGTERM the tree, wait `grace`, then SIGKILL whatever is left
pub(crate) async fn terminate_tree(pid: u32, grace: Duration) -> Cleanup {
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Cleanup::Warning(format!("invalid pid {}", pid)),
    };
    if raw == std::process::id() as i32 {
        return Cleanup::Warning(format!("refusing to signal own process {}", pid));
    }
    if !process_exists(pid) {
        return Cleanup::NothingToDo;
    }

    debug!(pid, "Sending SIGTERM to process group");
    if let Err(e) = signal_tree(raw, libc::SIGTERM) {
        return Cleanup::Warning(format!("SIGTERM to {} failed: {}", pid, e));
    }

    if wait_for_exit(pid, grace).await {
        return Cleanup::Done;
    }

    warn!(pid, grace_period_secs = grace.as_secs(), "Grace period exceeded, sending SIGKILL");
    if let Err(e) = signal_tree(raw, libc::SIGKILL) {
        return Cleanup::Warning(format!("SIGKILL to {} failed: {}", pid, e));
    }

    if wait_for_exit(pid, KILL_WAIT).await {
        Cleanup::Done
    } else {
        Cleanup::Warning(format!("process {} still running after SIGKILL", pid))
    }
}

/// Kill a build step's process group without a grace period
pub(crate) fn kill_tree_now(pid: u32) {
    if let Ok(raw) = i32::try_from(pid) {
        if raw > 0 {
            let _ = signal_tree(raw, libc::SIGKILL);
        }
    }
}

/// Working directory of `pid`, as a path that existed when the process entered it
#[cfg(target_os = "linux")]
pub(crate) fn process_cwd(pid: u32) -> io::Result<Option<PathBuf>> {
    let target = std::fs::read_link(format!("/proc/{}/cwd", pid))?;
    // A removed directory reads back with a " (deleted)" suffix
    let cwd = match target.to_str().and_then(|t| t.strip_suffix(" (deleted)")) {
        Some(path) => PathBuf::from(path),
        None => target,
    };
    Ok(Some(cwd))
}

/// Not observable without procfs
#[cfg(not(target_os = "linux"))]
pub(crate) fn process_cwd(_pid: u32) -> io::Result<Option<PathBuf>> {
    Ok(None)
}

/// Pids of processes with a TCP socket listening on `port`
#[cfg(target_os = "linux")]
pub(crate) async fn listening_pids(port: u16) -> io::Result<Vec<u32>> {
    tokio::task::spawn_blocking(move || procfs::listening_pids(port))
        .await
        .map_err(io::Error::other)?
}

/// Pids of processes with a TCP socket listening on `port`
#[cfg(not(target_os = "linux"))]
pub(crate) async fn listening_pids(port: u16) -> io::Result<Vec<u32>> {
    let output = Command::new("lsof")
        .args(["-nP", "-t"])
        .arg(format!("-iTCP:{}", port))
        .arg("-sTCP:LISTEN")
        .output()
        .await?;

    // lsof exits 1 with no output when nothing matches
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() && !stdout.trim().is_empty() {
        return Err(io::Error::other(format!(
            "lsof failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let mut pids: Vec<u32> = stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    Ok(pids)
}

#[cfg(target_os = "linux")]
mod procfs {
    use std::collections::HashSet;
    use std::fs;
    use std::io;

    /// TCP state code for LISTEN in /proc/net/tcp
    const TCP_LISTEN: &str = "0A";

    /// Socket inodes listening on `port`, from a /proc/net/tcp{,6} table
    pub(super) fn listening_inodes(table: &str, port: u16) -> HashSet<u64> {
        table
            .lines()
            .skip(1)
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 10 || fields[3] != TCP_LISTEN {
                    return None;
                }
                let local_port = fields[1].rsplit_once(':')?.1;
                if u16::from_str_radix(local_port, 16).ok()? != port {
                    return None;
                }
                fields[9].parse().ok()
            })
            .filter(|inode| *inode != 0)
            .collect()
    }

    pub(super) fn listening_pids(port: u16) -> io::Result<Vec<u32>> {
        let mut inodes = HashSet::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            match fs::read_to_string(table) {
                Ok(content) => inodes.extend(listening_inodes(&content, port)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        if inodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut pids = Vec::new();
        for entry in fs::read_dir("/proc")?.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            // Processes of other users are unreadable; skip them
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let owns_socket = fds.flatten().any(|fd| {
                fs::read_link(fd.path())
                    .ok()
                    .and_then(|target| {
                        let target = target.to_string_lossy().into_owned();
                        target
                            .strip_prefix("socket:[")
                            .and_then(|rest| rest.strip_suffix(']'))
                            .and_then(|inode| inode.parse::<u64>().ok())
                    })
                    .is_some_and(|inode| inodes.contains(&inode))
            });
            if owns_socket {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

}
