//! Windows process control: detached processes and `taskkill` trees

use super::Cleanup;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

const DETACHED_PROCESS: u32 = 0x0000_0008;
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Interval for polling process exit after taskkill (in milliseconds)
const EXIT_POLL_INTERVAL_MS: u64 = 200;

/// `npm`, `pnpm` and friends are `.cmd` shims that only `cmd` can launch
pub(crate) fn command(program: &str, args: &[String]) -> Command {
    if Path::new(program).extension().is_none() {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(program).args(args);
        cmd
    } else {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    }
}

/// Detach from the caller's console so the server outlives it
pub(crate) fn detach(cmd: &mut Command) {
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

pub(crate) fn isolate(cmd: &mut Command) {
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
}

pub(crate) fn process_exists(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let output = std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH", "/FO", "CSV"])
        .output();
    match output {
        Ok(output) => String::from_utf8_lossy(&output.stdout).contains(&format!("\"{}\"", pid)),
        Err(_) => false,
    }
}

async fn taskkill(pid: u32, force: bool) -> io::Result<()> {
    let mut cmd = Command::new("taskkill");
    cmd.args(["/PID", &pid.to_string(), "/T"]);
    if force {
        cmd.arg("/F");
    }
    let output = cmd.output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::other(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
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

/// Ask the tree to close, wait `grace`, then force-kill the tree
pub(crate) async fn terminate_tree(pid: u32, grace: Duration) -> Cleanup {
    if pid == std::process::id() {
        return Cleanup::Warning(format!("refusing to kill own process {}", pid));
    }
    if !process_exists(pid) {
        return Cleanup::NothingToDo;
    }

    debug!(pid, "Running taskkill /T");
    if let Err(e) = taskkill(pid, false).await {
        debug!(pid, error = %e, "Polite taskkill refused, forcing");
    } else if wait_for_exit(pid, grace).await {
        return Cleanup::Done;
    }

    warn!(pid, "Forcing process tree termination");
    if let Err(e) = taskkill(pid, true).await {
        if !process_exists(pid) {
            return Cleanup::Done;
        }
        return Cleanup::Warning(format!("taskkill /F {} failed: {}", pid, e));
    }
    if wait_for_exit(pid, grace.max(Duration::from_secs(2))).await {
        Cleanup::Done
    } else {
        Cleanup::Warning(format!("process {} still running after taskkill /F", pid))
    }
}

pub(crate) fn kill_tree_now(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();
}

/// Not exposed without extra Win32 bindings
pub(crate) fn process_cwd(_pid: u32) -> io::Result<Option<PathBuf>> {
    Ok(None)
}

/// Pids listening on `port` according to `netstat -ano`
pub(crate) async fn listening_pids(port: u16) -> io::Result<Vec<u32>> {
    let output = Command::new("netstat")
        .args(["-ano", "-p", "tcp"])
        .output()
        .await?;
    if !output.status.success() {
        return Err(io::Error::other("netstat failed"));
    }
    Ok(parse_netstat(&String::from_utf8_lossy(&output.stdout), port))
}

fn parse_netstat(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 5 || fields[3] != "LISTENING" || !fields[1].ends_with(&suffix) {
                return None;
            }
            fields[4].parse().ok()
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_netstat() {
        let output = "
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:55551          0.0.0.0:0              LISTENING       4242
  TCP    [::]:55551             [::]:0                 LISTENING       4242
  TCP    127.0.0.1:555510       0.0.0.0:0              LISTENING       1
  TCP    127.0.0.1:55551        127.0.0.1:50000        ESTABLISHED     77
";
        assert_eq!(parse_netstat(output, 55551), vec![4242]);
        assert!(parse_netstat(output, 3000).is_empty());
    }

    #[test]
    fn test_command_wraps_shims() {
        let cmd = command("npm", &["start".to_string()]);
        assert_eq!(cmd.as_std().get_program(), "cmd");
        let cmd = command("node.exe", &[]);
        assert_eq!(cmd.as_std().get_program(), "node.exe");
    }
}
