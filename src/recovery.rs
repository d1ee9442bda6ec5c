//! Recovery sweep after a host restart
//!
//! Records that still have a port and a build on disk but no answering
//! server are restarted from the existing build. Nothing is rebuilt.

use crate::health::{wait_until_ready, Readiness};
use crate::model::{validate_project_id, DeploymentRecord};
use crate::orchestrator::Deployer;
use crate::supervisor::Supervisor;
use serde::Serialize;
use tracing::{debug, info, warn};

/// What recovery did for one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// No build output on disk, record untouched
    SkippedNoBuild,
    /// The server already answers
    AlreadyRunning,
    /// A new process was started from the existing build
    Restarted,
    /// Restart failed, record untouched
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub project_id: String,
    pub port: u16,
    pub status: RecoveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Readiness>,
}

impl RecoveryReport {
    pub(crate) fn new(record: &DeploymentRecord, port: u16, status: RecoveryStatus) -> Self {
        Self {
            project_id: record.project_id.clone(),
            port,
            status,
            process_id: None,
            readiness: None,
        }
    }

    /// Whether the sweep changed the record
    pub fn changed_record(&self) -> bool {
        self.status == RecoveryStatus::Restarted
    }
}

impl<S: Supervisor> Deployer<S> {
    /// Bring every deployed-but-down project back up.
    ///
    /// Records without a port produce no report. Each record is handled
    /// independently under its project lock.
    pub async fn recover_all(&self, records: &mut [DeploymentRecord]) -> Vec<RecoveryReport> {
        let mut reports = Vec::new();
        for record in records.iter_mut() {
            let Some(port) = record.port else {
                continue;
            };
            let _guard = match self.lock_project(&record.project_id).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(project = %record.project_id, error = %e, "Cannot lock project for recovery");
                    reports.push(RecoveryReport::new(record, port, RecoveryStatus::Failed(e.to_string())));
                    continue;
                }
            };
            if let Some(report) = self.recover_record(record).await {
                reports.push(report);
            }
        }

        let restarted = reports.iter().filter(|r| r.changed_record()).count();
        info!(checked = reports.len(), restarted, "Recovery sweep finished");
        reports
    }

    /// Recover one record; the caller must hold its project lock
    pub(crate) async fn recover_record(&self, record: &mut DeploymentRecord) -> Option<RecoveryReport> {
        let port = record.port?;
        let project_id = record.project_id.clone();

        if !validate_project_id(&project_id) {
            warn!(project = %project_id, "Skipping record with invalid project id");
            return Some(RecoveryReport::new(
                record,
                port,
                RecoveryStatus::Failed(format!("invalid project id: {:?}", project_id)),
            ));
        }

        let project_dir = self.project_dir(&project_id);
        if !self.builder.output_path(&project_dir).is_dir() {
            debug!(project = %project_id, port, "No build output, skipping");
            return Some(RecoveryReport::new(record, port, RecoveryStatus::SkippedNoBuild));
        }

        if let Err(owner) = self.port_claims.assign(&project_id, port) {
            warn!(project = %project_id, port, owner = %owner, "Port handed to another project");
            return Some(RecoveryReport::new(
                record,
                port,
                RecoveryStatus::Failed(format!("port {} is claimed by project {}", port, owner)),
            ));
        }

        if self.supervisor.is_alive(port).await {
            debug!(project = %project_id, port, "Already running");
            return Some(RecoveryReport::new(record, port, RecoveryStatus::AlreadyRunning));
        }

        // Whatever holds the port is not answering; it is ours to replace
        if let Some(w) = self.ports.reclaim(port).await.warning() {
            warn!(project = %project_id, port, warning = %w, "Port reclaim before restart incomplete");
        }

        match self.supervisor.start(&project_dir, port).await {
            Ok(pid) => {
                record.mark_restarted(pid);
                let readiness =
                    wait_until_ready(&self.supervisor, port, self.health_interval, self.health_timeout)
                        .await;
                info!(project = %project_id, port, pid, ?readiness, "Restarted deployment");
                Some(RecoveryReport {
                    process_id: Some(pid),
                    readiness: Some(readiness),
                    ..RecoveryReport::new(record, port, RecoveryStatus::Restarted)
                })
            }
            Err(e) => {
                warn!(project = %project_id, port, error = %e, "Failed to restart deployment");
                Some(RecoveryReport::new(record, port, RecoveryStatus::Failed(e.to_string())))
            }
        }
    }
}
