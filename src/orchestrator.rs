//! Deployment orchestration
//!
//! One deploy is a strict sequence of phases:
//!
//! ```text
//! Idle → Stopping → Materializing → Building → PortAllocating → Starting → HealthPolling → Done
//! ```
//!
//! with `Failed` reachable from every non-terminal phase. Cleanup of the
//! previous process and port is best effort: problems are collected as
//! warnings on the outcome and never abort the deploy.

use crate::builder::Builder;
use crate::config::{Config, DeployConfig};
use crate::error::DeployError;
use crate::health::{wait_until_ready, Readiness};
use crate::locks::{ProjectGuard, ProjectLocks};
use crate::materialize::Materializer;
use crate::model::{validate_project_id, Route};
use crate::ports::{PortAllocator, PortClaims};
use crate::supervisor::{Cleanup, ProcessSupervisor, Supervisor};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Directory under the base dir holding per-project lock files
pub const LOCK_DIR: &str = ".locks";

/// Where a project's current (or last) deploy is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployPhase {
    Idle,
    Stopping,
    Materializing,
    Building,
    PortAllocating,
    Starting,
    HealthPolling,
    Done,
    Failed,
}

impl DeployPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployPhase::Idle => "idle",
            DeployPhase::Stopping => "stopping",
            DeployPhase::Materializing => "materializing",
            DeployPhase::Building => "building",
            DeployPhase::PortAllocating => "port_allocating",
            DeployPhase::Starting => "starting",
            DeployPhase::HealthPolling => "health_polling",
            DeployPhase::Done => "done",
            DeployPhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input of one deploy
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub project_id: String,
    pub routes: Vec<Route>,
    /// Port assigned by the previous deploy, reused when possible
    pub previous_port: Option<u16>,
    /// Process started by the previous deploy, stopped first
    pub previous_process_id: Option<u32>,
    /// Ports claimed by other projects
    pub other_used_ports: HashSet<u16>,
}

impl DeployRequest {
    pub fn new(project_id: impl Into<String>, routes: Vec<Route>) -> Self {
        Self {
            project_id: project_id.into(),
            routes,
            previous_port: None,
            previous_process_id: None,
            other_used_ports: HashSet::new(),
        }
    }

    pub fn with_previous(mut self, port: Option<u16>, process_id: Option<u32>) -> Self {
        self.previous_port = port;
        self.previous_process_id = process_id;
        self
    }

    pub fn with_used_ports(mut self, ports: HashSet<u16>) -> Self {
        self.other_used_ports = ports;
        self
    }
}

/// Result of a successful deploy
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployOutcome {
    pub port: u16,
    pub process_id: u32,
    /// `Unconfirmed` means "deployed, not yet confirmed healthy"
    pub readiness: Readiness,
    pub deployed_at: DateTime<Utc>,
    pub build_duration_secs: f64,
    /// Non-fatal cleanup problems
    pub warnings: Vec<String>,
}

/// Result of tearing a project down
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateReport {
    pub tree_removed: bool,
    pub warnings: Vec<String>,
}

/// Runs deploys, teardowns and recovery for all projects on this host
pub struct Deployer<S: Supervisor = ProcessSupervisor> {
    pub(crate) materializer: Materializer,
    pub(crate) builder: Builder,
    pub(crate) ports: PortAllocator,
    pub(crate) port_claims: PortClaims,
    pub(crate) supervisor: S,
    locks: ProjectLocks,
    phases: DashMap<String, DeployPhase>,
    pub(crate) health_interval: Duration,
    pub(crate) health_timeout: Duration,
}

impl Deployer<ProcessSupervisor> {
    /// Deployer with the real process supervisor and the on-disk registry
    pub fn from_config(config: &Config) -> Self {
        Deployer::new(
            &config.deploy,
            Materializer::from_config(config),
            ProcessSupervisor::new(&config.deploy),
        )
    }
}

impl<S: Supervisor> Deployer<S> {
    pub fn new(config: &DeployConfig, materializer: Materializer, supervisor: S) -> Self {
        Self {
            locks: ProjectLocks::with_lock_dir(materializer.base_dir().join(LOCK_DIR)),
            materializer,
            builder: Builder::new(config),
            ports: PortAllocator::new(config),
            port_claims: PortClaims::new(),
            supervisor,
            phases: DashMap::new(),
            health_interval: config.health_poll_interval(),
            health_timeout: config.health_timeout(),
        }
    }

    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }

    pub fn locks(&self) -> &ProjectLocks {
        &self.locks
    }

    /// Take the project lock, shared with other processes using the same base dir
    pub(crate) async fn lock_project(&self, project_id: &str) -> Result<ProjectGuard, DeployError> {
        if !validate_project_id(project_id) {
            return Err(DeployError::InvalidProjectId(project_id.to_string()));
        }
        self.locks
            .acquire(project_id)
            .await
            .map_err(|source| DeployError::Lock {
                project_id: project_id.to_string(),
                source,
            })
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.materializer.project_dir(project_id)
    }

    /// Current phase of `project_id`'s deploy; `Idle` if none ever ran
    pub fn phase(&self, project_id: &str) -> DeployPhase {
        self.phases
            .get(project_id)
            .map(|p| *p)
            .unwrap_or(DeployPhase::Idle)
    }

    fn set_phase(&self, project_id: &str, phase: DeployPhase) {
        debug!(project = project_id, phase = %phase, "Deploy phase");
        self.phases.insert(project_id.to_string(), phase);
    }

    /// Deploy a project, serialized with other operations on the same project
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeployOutcome, DeployError> {
        let _guard = self.lock_project(&request.project_id).await?;
        self.deploy_locked(request).await
    }

    /// Deploy without taking the project lock; the caller must hold it
    pub(crate) async fn deploy_locked(&self, request: DeployRequest) -> Result<DeployOutcome, DeployError> {
        if !validate_project_id(&request.project_id) {
            return Err(DeployError::InvalidProjectId(request.project_id));
        }

        let project_id = request.project_id.clone();
        let previous_port = request.previous_port;
        info!(
            project = %project_id,
            routes = request.routes.len(),
            previous_port = ?request.previous_port,
            previous_pid = ?request.previous_process_id,
            "Starting deploy"
        );

        let result = self.run_pipeline(request).await;
        match &result {
            Ok(outcome) => {
                self.set_phase(&project_id, DeployPhase::Done);
                info!(
                    project = %project_id,
                    port = outcome.port,
                    pid = outcome.process_id,
                    readiness = ?outcome.readiness,
                    warnings = outcome.warnings.len(),
                    "Deploy finished"
                );
            }
            Err(e) => {
                self.port_claims.restore(&project_id, previous_port);
                self.set_phase(&project_id, DeployPhase::Failed);
                error!(project = %project_id, error = %e, "Deploy failed");
            }
        }
        result
    }

    /// Undo a deploy whose outcome could not be recorded: stop its process
    /// and give up its port. Returns cleanup warnings.
    pub(crate) async fn abandon(
        &self,
        project_id: &str,
        outcome: &DeployOutcome,
        previous_port: Option<u16>,
    ) -> Vec<String> {
        warn!(project = project_id, pid = outcome.process_id, port = outcome.port, "Abandoning deploy");
        let mut warnings = Vec::new();
        collect_warning(&mut warnings, self.supervisor.stop(outcome.process_id).await);
        collect_warning(&mut warnings, self.ports.reclaim(outcome.port).await);
        self.port_claims.restore(project_id, previous_port);
        self.set_phase(project_id, DeployPhase::Failed);
        warnings
    }

    /// Stop a recorded process, unless the pid now belongs to something else
    async fn stop_recorded(&self, project_id: &str, pid: u32) -> Cleanup {
        if !self.supervisor.belongs_to(pid, &self.project_dir(project_id)) {
            return Cleanup::Warning(format!(
                "process {} does not belong to project {}, left running",
                pid, project_id
            ));
        }
        self.supervisor.stop(pid).await
    }

    async fn run_pipeline(&self, request: DeployRequest) -> Result<DeployOutcome, DeployError> {
        let DeployRequest {
            project_id,
            routes,
            previous_port,
            previous_process_id,
            other_used_ports,
        } = request;
        let mut warnings = Vec::new();

        // Stop whatever the previous deploy left behind
        self.set_phase(&project_id, DeployPhase::Stopping);
        if let Some(pid) = previous_process_id {
            collect_warning(&mut warnings, self.stop_recorded(&project_id, pid).await);
        }
        if let Some(port) = previous_port {
            let claimed_elsewhere = other_used_ports.contains(&port)
                || self.port_claims.owner(port).is_some_and(|owner| owner != project_id);
            if claimed_elsewhere {
                debug!(project = %project_id, port, "Previous port belongs to another project, not reclaiming");
            } else {
                collect_warning(&mut warnings, self.ports.reclaim(port).await);
            }
        }

        self.set_phase(&project_id, DeployPhase::Materializing);
        let materializer = self.materializer.clone();
        let id = project_id.clone();
        let project_dir = tokio::task::spawn_blocking(move || materializer.materialize(&id, &routes))
            .await
            .map_err(|e| {
                DeployError::materialization(
                    self.project_dir(&project_id),
                    std::io::Error::new(std::io::ErrorKind::Other, e),
                )
            })??;

        self.set_phase(&project_id, DeployPhase::Building);
        let build = self.builder.build(&project_dir).await?;

        // Stored ports may be stale while other projects deploy; the claims are not
        self.set_phase(&project_id, DeployPhase::PortAllocating);
        let port = self.port_claims.claim(&project_id, |claimed| {
            let taken: HashSet<u16> = other_used_ports.union(claimed).copied().collect();
            match previous_port {
                Some(port) if !taken.contains(&port) => Ok(port),
                Some(port) => {
                    let message = format!("previous port {} is now claimed by another project", port);
                    warn!(project = %project_id, port, "Previous port taken, allocating a new one");
                    warnings.push(message);
                    self.ports.allocate(&taken)
                }
                None => self.ports.allocate(&taken),
            }
        })?;
        collect_warning(&mut warnings, self.ports.reclaim(port).await);

        self.set_phase(&project_id, DeployPhase::Starting);
        let process_id = self.supervisor.start(&project_dir, port).await?;
        let deployed_at = Utc::now();

        self.set_phase(&project_id, DeployPhase::HealthPolling);
        let readiness =
            wait_until_ready(&self.supervisor, port, self.health_interval, self.health_timeout).await;

        Ok(DeployOutcome {
            port,
            process_id,
            readiness,
            deployed_at,
            build_duration_secs: build.duration_secs,
            warnings,
        })
    }

    /// Stop the project's process, free its port and delete its tree
    pub async fn terminate(
        &self,
        project_id: &str,
        port: Option<u16>,
        process_id: Option<u32>,
    ) -> Result<TerminateReport, DeployError> {
        let _guard = self.lock_project(project_id).await?;
        self.terminate_locked(project_id, port, process_id).await
    }

    pub(crate) async fn terminate_locked(
        &self,
        project_id: &str,
        port: Option<u16>,
        process_id: Option<u32>,
    ) -> Result<TerminateReport, DeployError> {
        if !validate_project_id(project_id) {
            return Err(DeployError::InvalidProjectId(project_id.to_string()));
        }

        info!(project = project_id, ?port, pid = ?process_id, "Terminating deployment");
        let mut report = TerminateReport::default();

        if let Some(pid) = process_id {
            collect_warning(&mut report.warnings, self.stop_recorded(project_id, pid).await);
        }
        if let Some(port) = port {
            collect_warning(&mut report.warnings, self.ports.reclaim(port).await);
        }
        self.port_claims.release(project_id);

        let materializer = self.materializer.clone();
        let id = project_id.to_string();
        match tokio::task::spawn_blocking(move || materializer.remove(&id)).await {
            Ok(Ok(removed)) => report.tree_removed = removed,
            Ok(Err(e)) => {
                warn!(project = project_id, error = %e, "Failed to remove project tree");
                report.warnings.push(e.to_string());
            }
            Err(e) => {
                warn!(project = project_id, error = %e, "Project tree removal task failed");
                report.warnings.push(format!("tree removal task failed: {}", e));
            }
        }

        self.phases.remove(project_id);
        Ok(report)
    }
}

fn collect_warning(warnings: &mut Vec<String>, cleanup: Cleanup) {
    if let Cleanup::Warning(w) = cleanup {
        warnings.push(w);
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::materialize::DirectoryRegistry;
    use crate::model::ComponentInstance;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Supervisor that records calls instead of spawning processes
    #[derive(Default)]
    pub(crate) struct FakeSupervisor {
        pub next_pid: AtomicU32,
        pub started: Mutex<Vec<(PathBuf, u16)>>,
        pub stopped: Mutex<Vec<u32>>,
        pub alive_ports: Mutex<HashSet<u16>>,
        pub fail_start: Mutex<bool>,
        pub never_alive: Mutex<bool>,
        /// Pids that now belong to unrelated processes
        pub foreign_pids: Mutex<HashSet<u32>>,
    }

    impl Supervisor for FakeSupervisor {
        async fn start(&self, project_dir: &Path, port: u16) -> Result<u32, DeployError> {
            if *self.fail_start.lock() {
                return Err(DeployError::StartFailed {
                    port,
                    reason: "refused".to_string(),
                });
            }
            self.started.lock().push((project_dir.to_path_buf(), port));
            self.alive_ports.lock().insert(port);
            Ok(self.next_pid.fetch_add(1, Ordering::SeqCst) + 1000)
        }

        async fn stop(&self, pid: u32) -> Cleanup {
            self.stopped.lock().push(pid);
            Cleanup::Done
        }

        async fn is_alive(&self, port: u16) -> bool {
            !*self.never_alive.lock() && self.alive_ports.lock().contains(&port)
        }

        fn belongs_to(&self, pid: u32, _project_dir: &Path) -> bool {
            !self.foreign_pids.lock().contains(&pid)
        }
    }

    pub(crate) struct Harness {
        pub registry: TempDir,
        pub base: TempDir,
        pub deployer: Deployer<FakeSupervisor>,
    }

    /// Deployer whose build just creates `.next`, with a one-component registry
    pub(crate) fn harness(build_command: &str) -> Harness {
        let registry = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(registry.path().join("navbar")).unwrap();
        std::fs::write(
            registry.path().join("navbar/SimpleNavbar.tsx"),
            "export default function SimpleNavbar() { return <nav />; }\n",
        )
        .unwrap();

        let base = tempfile::tempdir().unwrap();
        let config = DeployConfig {
            base_dir: base.path().to_path_buf(),
            port_range_start: 55550,
            install_command: String::new(),
            build_command: build_command.to_string(),
            build_timeout_secs: 10,
            health_timeout_secs: 1,
            health_poll_interval_ms: 10,
            stop_grace_period_secs: 1,
            ..DeployConfig::default()
        };
        let materializer = Materializer::new(
            base.path(),
            Arc::new(DirectoryRegistry::new(registry.path(), "tsx")),
            vec!["@/types".to_string()],
        );
        Harness {
            registry,
            base,
            deployer: Deployer::new(&config, materializer, FakeSupervisor::default()),
        }
    }

    pub(crate) fn routes() -> Vec<Route> {
        vec![Route::new("/").with_component(ComponentInstance::new("navbar/SimpleNavbar", 0))]
    }

    const BUILD_OK: &str = "mkdir -p .next";

    #[tokio::test]
    async fn test_first_deploy_skips_used_port() {
        let h = harness(BUILD_OK);
        let request = DeployRequest::new("p1", routes()).with_used_ports(HashSet::from([55550]));

        let outcome = h.deployer.deploy(request).await.unwrap();
        assert_eq!(outcome.port, 55551);
        assert!(outcome.process_id > 0);
        assert_eq!(outcome.readiness, Readiness::Confirmed);
        assert!(outcome.warnings.is_empty());
        assert_eq!(h.deployer.phase("p1"), DeployPhase::Done);

        let started = h.deployer.supervisor().started.lock().clone();
        assert_eq!(started, vec![(h.base.path().join("p1"), 55551)]);
    }

    #[tokio::test]
    async fn test_redeploy_stops_previous_and_reuses_port() {
        let h = harness(BUILD_OK);
        let first = h.deployer.deploy(DeployRequest::new("p1", routes())).await.unwrap();

        let second = h
            .deployer
            .deploy(
                DeployRequest::new("p1", routes())
                    .with_previous(Some(first.port), Some(first.process_id)),
            )
            .await
            .unwrap();

        assert_eq!(second.port, first.port);
        assert_ne!(second.process_id, first.process_id);
        assert_eq!(*h.deployer.supervisor().stopped.lock(), vec![first.process_id]);
    }

    #[tokio::test]
    async fn test_previous_port_claimed_elsewhere_gets_new_port() {
        let h = harness(BUILD_OK);
        let outcome = h
            .deployer
            .deploy(
                DeployRequest::new("p1", routes())
                    .with_previous(Some(55550), None)
                    .with_used_ports(HashSet::from([55550])),
            )
            .await
            .unwrap();
        assert_eq!(outcome.port, 55551);
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_unpersisted_ports_not_handed_out_twice() {
        let h = harness(BUILD_OK);
        // Neither request knows about the other's port
        let p1 = h.deployer.deploy(DeployRequest::new("p1", routes())).await.unwrap();
        let p2 = h.deployer.deploy(DeployRequest::new("p2", routes())).await.unwrap();
        assert_eq!((p1.port, p2.port), (55550, 55551));

        h.deployer.terminate("p1", Some(p1.port), Some(p1.process_id)).await.unwrap();
        let p3 = h.deployer.deploy(DeployRequest::new("p3", routes())).await.unwrap();
        assert_eq!(p3.port, 55550);
    }

    #[tokio::test]
    async fn test_previous_port_held_by_other_deploy_not_reused() {
        let h = harness(BUILD_OK);
        let p2 = h.deployer.deploy(DeployRequest::new("p2", routes())).await.unwrap();

        // p1's record still names the port p2 has just been given
        let p1 = h
            .deployer
            .deploy(DeployRequest::new("p1", routes()).with_previous(Some(p2.port), None))
            .await
            .unwrap();
        assert_ne!(p1.port, p2.port);
        assert_eq!(p1.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_reused_pid_is_not_stopped() {
        let h = harness(BUILD_OK);
        let first = h.deployer.deploy(DeployRequest::new("p1", routes())).await.unwrap();
        h.deployer.supervisor().foreign_pids.lock().insert(first.process_id);

        let second = h
            .deployer
            .deploy(DeployRequest::new("p1", routes()).with_previous(Some(first.port), Some(first.process_id)))
            .await
            .unwrap();
        assert!(h.deployer.supervisor().stopped.lock().is_empty());
        assert!(second.warnings.iter().any(|w| w.contains("does not belong")));

        let report = h.deployer.terminate("p1", None, Some(first.process_id)).await.unwrap();
        assert!(h.deployer.supervisor().stopped.lock().is_empty());
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_file_kept_beside_projects() {
        let h = harness(BUILD_OK);
        h.deployer.deploy(DeployRequest::new("p1", routes())).await.unwrap();
        assert!(h.base.path().join(LOCK_DIR).join("p1.lock").is_file());
    }

    #[tokio::test]
    async fn test_build_failure_aborts_before_start() {
        let h = harness("false");
        let err = h.deployer.deploy(DeployRequest::new("p1", routes())).await.unwrap_err();

        assert!(matches!(err, DeployError::BuildFailed(_)));
        assert_eq!(h.deployer.phase("p1"), DeployPhase::Failed);
        assert!(h.deployer.supervisor().started.lock().is_empty());
        // Tree kept for diagnostics
        assert!(h.base.path().join("p1/package.json").exists());
    }

    #[tokio::test]
    async fn test_start_failure_surfaces() {
        let h = harness(BUILD_OK);
        *h.deployer.supervisor().fail_start.lock() = true;
        let err = h.deployer.deploy(DeployRequest::new("p1", routes())).await.unwrap_err();
        assert!(matches!(err, DeployError::StartFailed { port: 55550, .. }));
    }

    #[tokio::test]
    async fn test_invalid_project_id_rejected() {
        let h = harness(BUILD_OK);
        let err = h
            .deployer
            .deploy(DeployRequest::new("../etc", routes()))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::InvalidProjectId(_)));
        assert_eq!(h.deployer.phase("../etc"), DeployPhase::Idle);
    }

    #[tokio::test]
    async fn test_unconfirmed_readiness_is_not_an_error() {
        let h = harness(BUILD_OK);
        *h.deployer.supervisor().never_alive.lock() = true;

        let outcome = h.deployer.deploy(DeployRequest::new("p1", routes())).await.unwrap();
        assert_eq!(outcome.readiness, Readiness::Unconfirmed);
        assert_eq!(h.deployer.phase("p1"), DeployPhase::Done);
    }

    #[tokio::test]
    async fn test_terminate_cleans_up() {
        let h = harness(BUILD_OK);
        let outcome = h.deployer.deploy(DeployRequest::new("p1", routes())).await.unwrap();

        let report = h
            .deployer
            .terminate("p1", Some(outcome.port), Some(outcome.process_id))
            .await
            .unwrap();
        assert!(report.tree_removed);
        assert!(!h.base.path().join("p1").exists());
        assert_eq!(*h.deployer.supervisor().stopped.lock(), vec![outcome.process_id]);
        assert_eq!(h.deployer.phase("p1"), DeployPhase::Idle);

        // Idempotent
        let again = h.deployer.terminate("p1", None, None).await.unwrap();
        assert!(!again.tree_removed);
    }
}
