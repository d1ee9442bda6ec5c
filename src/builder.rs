//! Build runner for materialized projects
//!
//! Runs the dependency install and the production build inside the project
//! directory. Both steps share one deadline; a step still running when it
//! expires is killed together with everything it forked.

use crate::config::DeployConfig;
use crate::error::{BuildFailure, DeployError};
use crate::supervisor::{platform, STATE_DIR};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{ChildStderr, ChildStdout};
use tracing::{debug, error, info, warn};

/// Build log file inside the project's state directory
pub const BUILD_LOG: &str = "build.log";

/// Lines kept in memory per build
const MAX_LOG_LINES: usize = 2000;

/// Lines attached to a failed-step error
const ERROR_TAIL_LINES: usize = 20;

/// Result of a successful build
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    /// Build duration in seconds
    pub duration_secs: f64,

    /// Combined install and build output
    pub logs: Vec<String>,
}

/// Runs install + build commands for a project directory
#[derive(Debug, Clone)]
pub struct Builder {
    install_command: String,
    build_command: String,
    output_dir: String,
    timeout: Duration,
}

impl Builder {
    pub fn new(config: &DeployConfig) -> Self {
        Self {
            install_command: config.install_command.clone(),
            build_command: config.build_command.clone(),
            output_dir: config.build_output_dir.clone(),
            timeout: config.build_timeout(),
        }
    }

    /// Where the build leaves its output for `project_dir`
    pub fn output_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.output_dir)
    }

    /// Install dependencies and build `project_dir`
    pub async fn build(&self, project_dir: &Path) -> Result<BuildReport, DeployError> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut logs = VecDeque::new();

        info!(dir = %project_dir.display(), timeout_secs = self.timeout.as_secs(), "Starting build");

        let result = self.run_steps(project_dir, deadline, &mut logs).await;
        let logs: Vec<String> = logs.into();
        write_build_log(project_dir, &logs);

        let duration_secs = start.elapsed().as_secs_f64();
        match result {
            Ok(()) => {
                info!(dir = %project_dir.display(), duration_secs, "Build completed successfully");
                Ok(BuildReport {
                    duration_secs,
                    logs,
                })
            }
            Err(failure) => {
                error!(dir = %project_dir.display(), error = %failure, "Build failed");
                Err(DeployError::BuildFailed(failure))
            }
        }
    }

    async fn run_steps(
        &self,
        project_dir: &Path,
        deadline: Instant,
        logs: &mut VecDeque<String>,
    ) -> Result<(), BuildFailure> {
        for command in [&self.install_command, &self.build_command] {
            let words = shell_words::split(command).map_err(|e| BuildFailure::Spawn {
                command: command.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            })?;
            if words.is_empty() {
                continue;
            }
            self.run_step(&words, project_dir, deadline, logs).await?;
        }

        let output = self.output_path(project_dir);
        if !output.is_dir() {
            return Err(BuildFailure::MissingOutput(output));
        }
        Ok(())
    }

    async fn run_step(
        &self,
        words: &[String],
        project_dir: &Path,
        deadline: Instant,
        logs: &mut VecDeque<String>,
    ) -> Result<(), BuildFailure> {
        let step = words.join(" ");
        let Some((program, args)) = words.split_first() else {
            return Ok(());
        };

        let mut cmd = platform::command(program, args);
        cmd.current_dir(project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        platform::isolate(&mut cmd);

        debug!(step = %step, "Running build step");

        let mut child = cmd.spawn().map_err(|e| BuildFailure::Spawn {
            command: step.clone(),
            source: e,
        })?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let remaining = deadline.saturating_duration_since(Instant::now());
        let run = async {
            collect_output(stdout, stderr, logs).await;
            child.wait().await
        };

        let outcome = tokio::time::timeout(remaining, run).await;
        match outcome {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(BuildFailure::ExitStatus {
                step,
                code: status.code(),
                tail: tail(logs),
            }),
            Ok(Err(e)) => Err(BuildFailure::ExitStatus {
                step,
                code: None,
                tail: vec![format!("failed to wait for build step: {}", e)],
            }),
            Err(_) => {
                warn!(step = %step, "Build deadline exceeded, killing build");
                if let Some(pid) = pid {
                    platform::kill_tree_now(pid);
                }
                let _ = child.kill().await;
                Err(BuildFailure::Timeout(self.timeout.as_secs()))
            }
        }
    }
}

async fn next_line<R: AsyncBufRead + Unpin>(reader: &mut Option<Lines<R>>) -> Option<String> {
    match reader {
        Some(lines) => match lines.next_line().await {
            Ok(line) => line,
            Err(e) => {
                warn!("Error reading build output: {}", e);
                None
            }
        },
        None => None,
    }
}

fn push_line(logs: &mut VecDeque<String>, line: String) {
    info!(target: "build", "{}", line);
    if logs.len() == MAX_LOG_LINES {
        logs.pop_front();
    }
    logs.push_back(line);
}

/// Interleave stdout and stderr lines until both pipes close
async fn collect_output(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    logs: &mut VecDeque<String>,
) {
    let mut stdout = stdout.map(|s| BufReader::new(s).lines());
    let mut stderr = stderr.map(|s| BufReader::new(s).lines());

    loop {
        tokio::select! {
            line = next_line(&mut stdout), if stdout.is_some() => match line {
                Some(line) => push_line(logs, line),
                None => stdout = None,
            },
            line = next_line(&mut stderr), if stderr.is_some() => match line {
                Some(line) => push_line(logs, line),
                None => stderr = None,
            },
            else => break,
        }
    }
}

fn tail(logs: &VecDeque<String>) -> Vec<String> {
    logs.iter()
        .skip(logs.len().saturating_sub(ERROR_TAIL_LINES))
        .cloned()
        .collect()
}

/// Keep the build output next to the project for diagnostics
fn write_build_log(project_dir: &Path, logs: &[String]) {
    let dir = project_dir.join(STATE_DIR);
    let result = std::fs::create_dir_all(&dir)
        .and_then(|_| std::fs::write(dir.join(BUILD_LOG), logs.join("\n")));
    if let Err(e) = result {
        warn!(dir = %dir.display(), error = %e, "Failed to write build log");
    }
}
