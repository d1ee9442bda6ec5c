//! Deployment records and the route/component data they carry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum accepted length of a project id
const MAX_PROJECT_ID_LEN: usize = 128;

/// One placed, configured occurrence of a registry component on a route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentInstance {
    /// Registry id, `category/Name`
    #[serde(alias = "id")]
    pub component_id: String,
    /// Render position within the route
    #[serde(default)]
    pub order: i64,
    /// Property bag passed to the component
    #[serde(default)]
    pub props: serde_json::Map<String, serde_json::Value>,
}

impl ComponentInstance {
    pub fn new(component_id: impl Into<String>, order: i64) -> Self {
        Self {
            component_id: component_id.into(),
            order,
            props: serde_json::Map::new(),
        }
    }

    /// Set a property (builder pattern)
    pub fn with_prop(mut self, key: &str, value: serde_json::Value) -> Self {
        self.props.insert(key.to_string(), value);
        self
    }
}

/// A page of the user's site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// URL path, e.g. `/` or `/courses/intro`
    pub path: String,
    /// Protection tag assigned by the builder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protection: Option<String>,
    #[serde(default)]
    pub components: Vec<ComponentInstance>,
}

impl Route {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            protection: None,
            components: Vec::new(),
        }
    }

    /// Add a component instance (builder pattern)
    pub fn with_component(mut self, component: ComponentInstance) -> Self {
        self.components.push(component);
        self
    }

    /// Component instances in ascending render order
    pub fn ordered_components(&self) -> Vec<&ComponentInstance> {
        let mut components: Vec<&ComponentInstance> = self.components.iter().collect();
        components.sort_by_key(|c| c.order);
        components
    }
}

/// Deployment state of one project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub project_id: String,
    /// Assigned port, `None` if never deployed
    pub port: Option<u16>,
    /// OS process id, `None` if not running
    pub process_id: Option<u32>,
    pub last_deployed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl DeploymentRecord {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            port: None,
            process_id: None,
            last_deployed_at: None,
            routes: Vec::new(),
        }
    }

    pub fn with_routes(mut self, routes: Vec<Route>) -> Self {
        self.routes = routes;
        self
    }

    /// Record a successful deploy
    pub fn mark_running(&mut self, port: u16, process_id: u32, at: DateTime<Utc>) {
        self.port = Some(port);
        self.process_id = Some(process_id);
        self.last_deployed_at = Some(at);
    }

    /// Record a restart of the existing build on the existing port
    pub fn mark_restarted(&mut self, process_id: u32) {
        if self.port.is_some() {
            self.process_id = Some(process_id);
        }
    }

    /// The process is gone but the port stays assigned
    pub fn mark_stopped(&mut self) {
        self.process_id = None;
    }

    pub fn is_deployed(&self) -> bool {
        self.port.is_some()
    }

    /// A process id without a port is never valid
    pub fn is_consistent(&self) -> bool {
        !(self.process_id.is_some() && self.port.is_none())
    }
}

/// Project ids double as directory names
pub fn validate_project_id(project_id: &str) -> bool {
    !project_id.is_empty()
        && project_id.len() <= MAX_PROJECT_ID_LEN
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
