//! Sitedeploy - deployment lifecycle manager for low-code sites
//!
//! This library takes the pages a user assembled in a site builder and runs
//! them as an independent web server:
//! - Materializes routes and components into a standalone Next.js project
//! - Installs and builds the project under a hard timeout
//! - Allocates a dedicated port and starts the server as a detached process
//! - Stops, rebuilds and restarts deployments, one project at a time
//! - Recovers deployments whose process is gone after a host restart

pub mod builder;
pub mod config;
pub mod error;
pub mod health;
pub mod locks;
pub mod materialize;
pub mod model;
pub mod orchestrator;
pub mod ports;
pub mod recovery;
pub mod service;
pub mod store;
pub mod supervisor;

pub use error::{DeployError, ErrorCode, ErrorResponse};
pub use orchestrator::{DeployOutcome, DeployPhase, DeployRequest, Deployer, TerminateReport};
pub use recovery::{RecoveryReport, RecoveryStatus};
pub use service::DeploymentService;

/// Package name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
