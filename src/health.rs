//! Readiness polling after a server start

use crate::supervisor::Supervisor;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of the readiness wait
///
/// `Unconfirmed` is not a failure: the deploy stands, but callers should tell
/// the user it is "deployed, not yet confirmed healthy".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    Confirmed,
    Unconfirmed,
}

impl Readiness {
    pub fn is_confirmed(&self) -> bool {
        *self == Readiness::Confirmed
    }
}

/// Poll `is_alive(port)` every `interval` until it answers or `deadline` elapses
pub async fn wait_until_ready<S: Supervisor>(
    supervisor: &S,
    port: u16,
    interval: Duration,
    deadline: Duration,
) -> Readiness {
    let start = Instant::now();
    debug!(port, interval_ms = interval.as_millis() as u64, "Waiting for server readiness");

    loop {
        if supervisor.is_alive(port).await {
            info!(port, waited_ms = start.elapsed().as_millis() as u64, "Server is ready");
            return Readiness::Confirmed;
        }

        let elapsed = start.elapsed();
        if elapsed >= deadline {
            warn!(port, deadline_secs = deadline.as_secs(), "Server not confirmed ready before deadline");
            return Readiness::Unconfirmed;
        }

        tokio::time::sleep(interval.min(deadline - elapsed)).await;
    }
}
