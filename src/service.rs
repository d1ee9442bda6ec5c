//! Store-backed deployment service
//!
//! Each operation holds the project lock from reading the record until the
//! outcome is persisted, so two deploys of one project can never both read
//! the same "previous process" and leave an orphan behind.

use crate::config::Config;
use crate::error::DeployError;
use crate::model::{DeploymentRecord, Route};
use crate::orchestrator::{DeployOutcome, DeployPhase, DeployRequest, Deployer, TerminateReport};
use crate::recovery::{RecoveryReport, RecoveryStatus};
use crate::store::{DeploymentStore, SqliteStore};
use crate::supervisor::{ProcessSupervisor, Supervisor};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

/// Snapshot of one project for status output
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    pub project_id: String,
    pub port: Option<u16>,
    pub process_id: Option<u32>,
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub routes: usize,
    /// Whether the port answers right now
    pub alive: bool,
    pub phase: DeployPhase,
}

pub struct DeploymentService<St: DeploymentStore, S: Supervisor = ProcessSupervisor> {
    store: St,
    deployer: Deployer<S>,
}

impl DeploymentService<SqliteStore, ProcessSupervisor> {
    /// Service over the configured SQLite store and real processes
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = SqliteStore::open(&config.store.path)?;
        Ok(Self::new(store, Deployer::from_config(config)))
    }
}

impl<St: DeploymentStore, S: Supervisor> DeploymentService<St, S> {
    pub fn new(store: St, deployer: Deployer<S>) -> Self {
        Self { store, deployer }
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    pub fn deployer(&self) -> &Deployer<S> {
        &self.deployer
    }

    fn load(&self, project_id: &str) -> Result<DeploymentRecord, DeployError> {
        self.store
            .get(project_id)
            .map_err(DeployError::Store)?
            .ok_or_else(|| DeployError::ProjectNotFound(project_id.to_string()))
    }

    /// Create the project record if needed and replace its routes
    pub async fn set_routes(
        &self,
        project_id: &str,
        routes: Vec<Route>,
    ) -> Result<DeploymentRecord, DeployError> {
        let _guard = self.deployer.lock_project(project_id).await?;

        let mut record = self
            .store
            .get(project_id)
            .map_err(DeployError::Store)?
            .unwrap_or_else(|| DeploymentRecord::new(project_id));
        record.routes = routes;
        self.store.save(&record).map_err(DeployError::Store)?;

        info!(project = project_id, routes = record.routes.len(), "Routes updated");
        Ok(record)
    }

    /// Deploy the stored routes of `project_id`
    pub async fn deploy(&self, project_id: &str) -> Result<DeployOutcome, DeployError> {
        let _guard = self.deployer.lock_project(project_id).await?;

        let mut record = self.load(project_id)?;
        let used_ports = self
            .store
            .claimed_ports_excluding(project_id)
            .map_err(DeployError::Store)?;

        let previous_port = record.port;
        let request = DeployRequest::new(project_id, record.routes.clone())
            .with_previous(record.port, record.process_id)
            .with_used_ports(used_ports);

        match self.deployer.deploy_locked(request).await {
            Ok(outcome) => {
                record.mark_running(outcome.port, outcome.process_id, outcome.deployed_at);
                if let Err(e) = self.store.save(&record) {
                    error!(
                        project = project_id,
                        pid = outcome.process_id,
                        error = %e,
                        "Deployed but failed to persist the record"
                    );
                    // An unrecorded process could never be stopped or recovered
                    for warning in self.deployer.abandon(project_id, &outcome, previous_port).await {
                        warn!(project = project_id, warning = %warning, "Cleanup after failed persist incomplete");
                    }
                    return Err(DeployError::Store(e));
                }
                Ok(outcome)
            }
            Err(e) => {
                // The previous process was stopped before the failing step
                if record.process_id.is_some() {
                    record.mark_stopped();
                    if let Err(save_err) = self.store.save(&record) {
                        warn!(project = project_id, error = %save_err, "Failed to record stopped process");
                    }
                }
                Err(e)
            }
        }
    }

    /// Tear the deployment down and forget the project
    pub async fn delete(&self, project_id: &str) -> Result<TerminateReport, DeployError> {
        let guard = self.deployer.lock_project(project_id).await?;

        let record = self.load(project_id)?;
        let report = self
            .deployer
            .terminate_locked(project_id, record.port, record.process_id)
            .await?;
        self.store.delete(project_id).map_err(DeployError::Store)?;

        drop(guard);
        self.deployer.locks().remove(project_id);

        info!(project = project_id, warnings = report.warnings.len(), "Project deleted");
        Ok(report)
    }

    /// Recovery sweep over every stored record
    pub async fn recover(&self) -> Result<Vec<RecoveryReport>, DeployError> {
        let deployed: Vec<DeploymentRecord> = self
            .store
            .list()
            .map_err(DeployError::Store)?
            .into_iter()
            .filter(|r| r.is_deployed())
            .collect();

        let mut reports = Vec::new();
        for listed in deployed {
            let project_id = listed.project_id.clone();
            let _guard = match self.deployer.lock_project(&project_id).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(project = %project_id, error = %e, "Cannot lock project for recovery");
                    let port = listed.port.unwrap_or_default();
                    reports.push(RecoveryReport::new(&listed, port, RecoveryStatus::Failed(e.to_string())));
                    continue;
                }
            };

            // Re-read under the lock; a deploy may have finished meanwhile
            let mut record = match self.store.get(&project_id) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(project = %project_id, error = %e, "Failed to load record for recovery");
                    continue;
                }
            };

            let Some(report) = self.deployer.recover_record(&mut record).await else {
                continue;
            };
            if report.changed_record() {
                if let Err(e) = self.store.save(&record) {
                    warn!(project = %project_id, error = %e, "Failed to persist recovered record");
                }
            }
            reports.push(report);
        }

        Ok(reports)
    }

    /// Current state of one project, or of all projects
    pub async fn status(&self, project_id: Option<&str>) -> Result<Vec<ProjectStatus>, DeployError> {
        let records = match project_id {
            Some(id) => vec![self.load(id)?],
            None => self.store.list().map_err(DeployError::Store)?,
        };

        let mut statuses = Vec::with_capacity(records.len());
        for record in records {
            let alive = match record.port {
                Some(port) => self.deployer.supervisor().is_alive(port).await,
                None => false,
            };
            statuses.push(ProjectStatus {
                phase: self.deployer.phase(&record.project_id),
                project_id: record.project_id,
                port: record.port,
                process_id: record.process_id,
                last_deployed_at: record.last_deployed_at,
                routes: record.routes.len(),
                alive,
            });
        }
        Ok(statuses)
    }
}
