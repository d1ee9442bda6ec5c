//! Process supervision for deployed sites
//!
//! A deployed site is a detached OS process: it is started in its own
//! process group (POSIX) or as a detached process (Windows) so that it keeps
//! serving after the process that launched it exits. Stopping always targets
//! the whole process tree, since the start command typically forks the real
//! server runtime.
//!
//! Platform specifics live in `unix.rs` / `windows.rs`; both expose the same
//! set of functions and one of them is compiled in as `platform`.

mod probe;

#[cfg(unix)]
#[path = "unix.rs"]
pub(crate) mod platform;

#[cfg(windows)]
#[path = "windows.rs"]
pub(crate) mod platform;

pub use probe::{counts_as_alive, LivenessProbe};

use crate::config::DeployConfig;
use crate::error::DeployError;
use std::fs::OpenOptions;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Directory (inside a project) for supervisor-owned files
pub const STATE_DIR: &str = ".sitedeploy";

/// Server log file inside [`STATE_DIR`]
pub const SERVER_LOG: &str = "server.log";

/// A process exiting this quickly after spawn is reported as a failed start
const EARLY_EXIT_WINDOW: Duration = Duration::from_millis(250);

/// Result of a best-effort cleanup (stop / reclaim)
///
/// Cleanup never fails a deploy; problems are carried as warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleanup {
    /// Nothing was running
    NothingToDo,
    /// Something was running and has been terminated
    Done,
    /// Cleanup did not complete
    Warning(String),
}

impl Cleanup {
    pub fn warning(&self) -> Option<&str> {
        match self {
            Cleanup::Warning(w) => Some(w),
            _ => None,
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Cleanup::Warning(_))
    }
}

/// Starts, stops and probes deployed servers
pub trait Supervisor: Send + Sync + 'static {
    /// Launch the production server of `project_dir` on `port`, detached.
    /// Returns the OS process id.
    fn start(
        &self,
        project_dir: &Path,
        port: u16,
    ) -> impl Future<Output = Result<u32, DeployError>> + Send;

    /// Terminate the process tree rooted at `pid`. A vanished pid is not an error.
    fn stop(&self, pid: u32) -> impl Future<Output = Cleanup> + Send;

    /// Whether something answers HTTP on `port` with a status below 500
    fn is_alive(&self, port: u16) -> impl Future<Output = bool> + Send;

    /// Whether `pid` can be the server started in `project_dir`.
    ///
    /// A recorded pid may have been reused by an unrelated process since the
    /// record was written; callers must not stop a pid that fails this check.
    fn belongs_to(&self, _pid: u32, _project_dir: &Path) -> bool {
        true
    }
}

/// Path of the server log for a project directory
pub fn server_log_path(project_dir: &Path) -> PathBuf {
    project_dir.join(STATE_DIR).join(SERVER_LOG)
}

/// Supervisor backed by real OS processes
pub struct ProcessSupervisor {
    start_command: String,
    grace_period: Duration,
    probe: LivenessProbe,
}

impl ProcessSupervisor {
    pub fn new(config: &DeployConfig) -> Self {
        Self {
            start_command: config.start_command.clone(),
            grace_period: config.stop_grace_period(),
            probe: LivenessProbe::new(config.probe_timeout()),
        }
    }

    fn command_for(&self, port: u16) -> Result<Vec<String>, String> {
        let rendered = self.start_command.replace("{port}", &port.to_string());
        let words = shell_words::split(&rendered).map_err(|e| e.to_string())?;
        if words.is_empty() {
            return Err("start command is empty".to_string());
        }
        Ok(words)
    }
}

impl Supervisor for ProcessSupervisor {
    async fn start(&self, project_dir: &Path, port: u16) -> Result<u32, DeployError> {
        let start_failed = |reason: String| DeployError::StartFailed { port, reason };

        let words = self.command_for(port).map_err(start_failed)?;
        let (program, args) = words.split_first().ok_or_else(|| start_failed("start command is empty".into()))?;

        let log_path = server_log_path(project_dir);
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| start_failed(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| start_failed(format!("cannot open {}: {}", log_path.display(), e)))?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| start_failed(format!("cannot open {}: {}", log_path.display(), e)))?;

        let mut cmd = platform::command(program, args);
        cmd.current_dir(project_dir)
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(false);
        platform::detach(&mut cmd);

        info!(port, command = %words.join(" "), dir = %project_dir.display(), "Starting server");

        let mut child = cmd
            .spawn()
            .map_err(|e| start_failed(format!("failed to spawn `{}`: {}", program, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| start_failed("process exited before its pid was read".into()))?;

        match tokio::time::timeout(EARLY_EXIT_WINDOW, child.wait()).await {
            Ok(Ok(status)) => {
                return Err(start_failed(format!(
                    "process {} exited immediately ({}), see {}",
                    pid,
                    status,
                    log_path.display()
                )));
            }
            Ok(Err(e)) => {
                warn!(pid, error = %e, "Error checking freshly spawned server");
            }
            Err(_) => {}
        }

        // Reap the child when it exits so it never lingers as a zombie.
        // Dropping this task (e.g. on runtime shutdown) leaves the process running.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(pid, ?status, "Server process exited"),
                Err(e) => warn!(pid, error = %e, "Error waiting for server process"),
            }
        });

        info!(port, pid, "Server process spawned");
        Ok(pid)
    }

    async fn stop(&self, pid: u32) -> Cleanup {
        let outcome = platform::terminate_tree(pid, self.grace_period).await;
        match &outcome {
            Cleanup::NothingToDo => debug!(pid, "Server process already gone"),
            Cleanup::Done => info!(pid, "Server process stopped"),
            Cleanup::Warning(w) => warn!(pid, warning = %w, "Failed to stop server process"),
        }
        outcome
    }

    async fn is_alive(&self, port: u16) -> bool {
        self.probe.is_alive(port).await
    }

    fn belongs_to(&self, pid: u32, project_dir: &Path) -> bool {
        match platform::process_cwd(pid) {
            Ok(Some(cwd)) => {
                let expected = project_dir
                    .canonicalize()
                    .unwrap_or_else(|_| project_dir.to_path_buf());
                let owned = cwd.starts_with(&expected);
                if !owned {
                    warn!(
                        pid,
                        cwd = %cwd.display(),
                        project_dir = %expected.display(),
                        "Recorded pid runs outside the project directory"
                    );
                }
                owned
            }
            Ok(None) => true,
            // Already gone; stopping it is a no-op
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(pid, error = %e, "Cannot inspect recorded pid");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_command_port_substitution() {
        let config = DeployConfig {
            start_command: "npm run start -- -p {port}".to_string(),
            ..DeployConfig::default()
        };
        let supervisor = ProcessSupervisor::new(&config);
        assert_eq!(
            supervisor.command_for(55551).unwrap(),
            vec!["npm", "run", "start", "--", "-p", "55551"]
        );
    }

    #[test]
    fn test_start_command_rejects_unbalanced_quotes() {
        let config = DeployConfig {
            start_command: "node \"server.js".to_string(),
            ..DeployConfig::default()
        };
        let supervisor = ProcessSupervisor::new(&config);
        assert!(supervisor.command_for(1).is_err());
    }

    #[test]
    fn test_cleanup_warning_accessors() {
        assert_eq!(Cleanup::Done.warning(), None);
        assert!(!Cleanup::NothingToDo.is_warning());
        let warning = Cleanup::Warning("kill: EPERM".to_string());
        assert!(warning.is_warning());
        assert_eq!(warning.warning(), Some("kill: EPERM"));
    }

    #[tokio::test]
    async fn test_stop_unknown_pid_is_nothing_to_do() {
        let supervisor = ProcessSupervisor::new(&DeployConfig::default());
        // Far above any default pid_max
        assert_eq!(supervisor.stop(0x3fff_fff0).await, Cleanup::NothingToDo);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_belongs_to_checks_working_directory() {
        let project = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .current_dir(project.path())
            .spawn()
            .unwrap();
        let pid = child.id();

        let supervisor = ProcessSupervisor::new(&DeployConfig::default());
        assert!(supervisor.belongs_to(pid, project.path()));
        assert!(!supervisor.belongs_to(pid, elsewhere.path()));
        // A vanished pid has nothing left to protect
        assert!(supervisor.belongs_to(0x3fff_fff0, elsewhere.path()));

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_start_missing_program_is_start_failed() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeployConfig {
            start_command: "definitely-not-a-real-binary-7f3a {port}".to_string(),
            ..DeployConfig::default()
        };
        let supervisor = ProcessSupervisor::new(&config);

        let err = supervisor.start(dir.path(), 55999).await.unwrap_err();
        assert!(matches!(err, DeployError::StartFailed { port: 55999, .. }));
        // The log file is prepared before the spawn
        assert!(server_log_path(dir.path()).exists());
    }
}
