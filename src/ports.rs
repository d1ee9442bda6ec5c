//! Port allocation and OS-level port reclamation
//!
//! The caller passes the ports claimed by other deployments, read from the
//! deployment store. That snapshot can be stale while several projects
//! deploy at once, so [`PortClaims`] also tracks every port this process has
//! handed out, persisted or not.

use crate::config::DeployConfig;
use crate::error::DeployError;
use crate::supervisor::{platform, Cleanup};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// First port at or after `range_start` that is not in `used`, scanning at
/// most `scan_limit` candidates and never wrapping past 65535.
pub fn allocate(used: &HashSet<u16>, range_start: u16, scan_limit: u16) -> Result<u16, DeployError> {
    let end = u32::from(range_start) + u32::from(scan_limit);
    let mut scanned = 0u32;

    for candidate in u32::from(range_start)..end.min(u32::from(u16::MAX) + 1) {
        scanned += 1;
        let port = candidate as u16;
        if port != 0 && !used.contains(&port) {
            return Ok(port);
        }
    }

    Err(DeployError::PortExhausted {
        start: range_start,
        scanned,
    })
}

/// Allocates ports from the configured range and frees ports held by stale processes
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range_start: u16,
    scan_limit: u16,
    grace_period: Duration,
}

impl PortAllocator {
    pub fn new(config: &DeployConfig) -> Self {
        Self {
            range_start: config.port_range_start,
            scan_limit: config.port_scan_limit,
            grace_period: config.stop_grace_period(),
        }
    }

    pub fn range_start(&self) -> u16 {
        self.range_start
    }

    pub fn allocate(&self, used: &HashSet<u16>) -> Result<u16, DeployError> {
        let port = allocate(used, self.range_start, self.scan_limit)?;
        debug!(port, excluded = used.len(), "Allocated port");
        Ok(port)
    }

    /// Terminate whatever is listening on `port`.
    ///
    /// Nothing listening is [`Cleanup::NothingToDo`]; failures are warnings.
    /// The calling process is never targeted.
    pub async fn reclaim(&self, port: u16) -> Cleanup {
        let pids = match platform::listening_pids(port).await {
            Ok(pids) => pids,
            Err(e) => {
                warn!(port, error = %e, "Could not discover listeners on port");
                return Cleanup::Warning(format!("listener discovery on port {} failed: {}", port, e));
            }
        };

        let own_pid = std::process::id();
        let targets: Vec<u32> = pids.into_iter().filter(|pid| *pid != own_pid).collect();
        if targets.is_empty() {
            debug!(port, "Port is free");
            return Cleanup::NothingToDo;
        }

        let mut warnings = Vec::new();
        for pid in &targets {
            info!(port, pid, "Reclaiming port from listening process");
            if let Cleanup::Warning(w) = platform::terminate_tree(*pid, self.grace_period).await {
                warnings.push(w);
            }
        }

        if warnings.is_empty() {
            Cleanup::Done
        } else {
            let message = format!("reclaiming port {}: {}", port, warnings.join("; "));
            warn!(port, warning = %message, "Port reclaim incomplete");
            Cleanup::Warning(message)
        }
    }
}

/// Port → owning project, for ports assigned by this process
#[derive(Debug, Clone, Default)]
pub struct PortClaims {
    owners: Arc<Mutex<HashMap<u16, String>>>,
}

impl PortClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose and claim a port for `project_id` in one step.
    ///
    /// `pick` receives the ports claimed by other projects. Whatever port
    /// the project held before is released.
    pub fn claim<F>(&self, project_id: &str, pick: F) -> Result<u16, DeployError>
    where
        F: FnOnce(&HashSet<u16>) -> Result<u16, DeployError>,
    {
        let mut owners = self.owners.lock();
        let taken: HashSet<u16> = owners
            .iter()
            .filter(|(_, owner)| owner.as_str() != project_id)
            .map(|(port, _)| *port)
            .collect();
        let port = pick(&taken)?;
        owners.retain(|_, owner| owner.as_str() != project_id);
        owners.insert(port, project_id.to_string());
        Ok(port)
    }

    /// Record `project_id` as the holder of `port`.
    ///
    /// Returns the other project holding it instead, if any.
    pub fn assign(&self, project_id: &str, port: u16) -> Result<(), String> {
        let mut owners = self.owners.lock();
        match owners.get(&port) {
            Some(owner) if owner != project_id => Err(owner.clone()),
            _ => {
                owners.retain(|_, owner| owner.as_str() != project_id);
                owners.insert(port, project_id.to_string());
                Ok(())
            }
        }
    }

    /// Put the project back on `port` (or on nothing) after a deploy that did not stick
    pub fn restore(&self, project_id: &str, port: Option<u16>) {
        match port {
            Some(port) => {
                if let Err(owner) = self.assign(project_id, port) {
                    debug!(project = project_id, port, owner = %owner, "Previous port now claimed elsewhere");
                    self.release(project_id);
                }
            }
            None => self.release(project_id),
        }
    }

    pub fn release(&self, project_id: &str) {
        self.owners.lock().retain(|_, owner| owner.as_str() != project_id);
    }

    pub fn owner(&self, port: u16) -> Option<String> {
        self.owners.lock().get(&port).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_first_free() {
        assert_eq!(allocate(&HashSet::new(), 55550, 10).unwrap(), 55550);
        assert_eq!(allocate(&HashSet::from([55550]), 55550, 10).unwrap(), 55551);
        assert_eq!(
            allocate(&HashSet::from([55550, 55551, 55553]), 55550, 10).unwrap(),
            55552
        );
    }

    #[test]
    fn test_allocate_ignores_ports_below_range() {
        assert_eq!(allocate(&HashSet::from([3000, 3001]), 3002, 5).unwrap(), 3002);
    }

    #[test]
    fn test_allocate_exhausted_within_window() {
        let used: HashSet<u16> = (40000..40005).collect();
        let err = allocate(&used, 40000, 5).unwrap_err();
        assert!(matches!(
            err,
            DeployError::PortExhausted {
                start: 40000,
                scanned: 5
            }
        ));
    }

    #[test]
    fn test_allocate_never_wraps_past_max_port() {
        let used = HashSet::from([65534]);
        assert_eq!(allocate(&used, 65534, 100).unwrap(), 65535);

        let used = HashSet::from([65534, 65535]);
        let err = allocate(&used, 65534, 100).unwrap_err();
        assert!(matches!(err, DeployError::PortExhausted { scanned: 2, .. }));
    }

    #[test]
    fn test_allocator_uses_configured_range() {
        let config = DeployConfig {
            port_range_start: 61000,
            port_scan_limit: 3,
            ..DeployConfig::default()
        };
        let allocator = PortAllocator::new(&config);
        assert_eq!(allocator.range_start(), 61000);
        assert_eq!(allocator.allocate(&HashSet::from([61000])).unwrap(), 61001);
        assert!(allocator
            .allocate(&HashSet::from([61000, 61001, 61002]))
            .is_err());
    }

    #[test]
    fn test_claims_exclude_other_projects() {
        let claims = PortClaims::new();
        let first = claims.claim("p1", |taken| allocate(taken, 55550, 10)).unwrap();
        let second = claims.claim("p2", |taken| allocate(taken, 55550, 10)).unwrap();
        assert_eq!((first, second), (55550, 55551));

        // A project never excludes its own port
        assert_eq!(claims.claim("p1", |taken| allocate(taken, 55550, 10)).unwrap(), 55550);
        assert_eq!(claims.owner(55551).as_deref(), Some("p2"));
    }

    #[test]
    fn test_claim_moves_project_to_new_port() {
        let claims = PortClaims::new();
        claims.claim("p1", |_| Ok(55550)).unwrap();
        claims.claim("p1", |_| Ok(55552)).unwrap();
        assert_eq!(claims.owner(55550), None);
        assert_eq!(claims.owner(55552).as_deref(), Some("p1"));
    }

    #[test]
    fn test_failed_pick_keeps_existing_claim() {
        let claims = PortClaims::new();
        claims.claim("p1", |_| Ok(55550)).unwrap();
        let err = claims
            .claim("p1", |_| Err(DeployError::PortExhausted { start: 1, scanned: 1 }))
            .unwrap_err();
        assert!(matches!(err, DeployError::PortExhausted { .. }));
        assert_eq!(claims.owner(55550).as_deref(), Some("p1"));
    }

    #[test]
    fn test_assign_refuses_port_of_other_project() {
        let claims = PortClaims::new();
        claims.assign("p1", 55550).unwrap();
        assert_eq!(claims.assign("p2", 55550), Err("p1".to_string()));
        assert!(claims.assign("p1", 55550).is_ok());

        claims.claim("p1", |_| Ok(55551)).unwrap();
        claims.restore("p1", Some(55550));
        assert_eq!(claims.owner(55550).as_deref(), Some("p1"));
        assert_eq!(claims.owner(55551), None);

        claims.release("p1");
        assert_eq!(claims.owner(55550), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_reclaim_free_port_is_nothing_to_do() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let allocator = PortAllocator::new(&DeployConfig::default());
        assert_eq!(allocator.reclaim(port).await, Cleanup::NothingToDo);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_reclaim_never_targets_own_process() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let allocator = PortAllocator::new(&DeployConfig::default());
        assert_eq!(allocator.reclaim(port).await, Cleanup::NothingToDo);
        // Still bound
        assert!(listener.local_addr().is_ok());
    }
}
