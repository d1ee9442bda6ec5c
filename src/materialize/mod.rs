//! Project materialization
//!
//! Turns a project's routes into a standalone Next.js source tree under
//! `<base_dir>/<project_id>`. The tree is regenerated from scratch on every
//! call; the same routes always produce byte-identical files.

pub mod registry;
pub mod scaffold;
pub mod strip;
pub mod template;

pub use registry::{ComponentRegistry, DirectoryRegistry, ResolutionTable, ResolvedComponent};
pub use strip::strip_builder_types;
pub use template::{emit_page, ImportBinding, PageTemplate, PropLiteral, RenderCall};

use crate::config::{Config, RegistryConfig};
use crate::error::DeployError;
use crate::model::{validate_project_id, Route};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Page entry file name inside a route directory
const PAGE_FILE: &str = "page.tsx";

/// Writes project source trees
#[derive(Clone)]
pub struct Materializer {
    base_dir: PathBuf,
    registry: Arc<dyn ComponentRegistry>,
    type_modules: Vec<String>,
}

impl std::fmt::Debug for Materializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer")
            .field("base_dir", &self.base_dir)
            .field("type_modules", &self.type_modules)
            .finish_non_exhaustive()
    }
}

impl Materializer {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        registry: Arc<dyn ComponentRegistry>,
        type_modules: Vec<String>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            registry,
            type_modules,
        }
    }

    /// Materializer over the configured on-disk component registry
    pub fn from_config(config: &Config) -> Self {
        let RegistryConfig {
            components_dir,
            extension,
            type_modules,
        } = &config.registry;
        Self::new(
            &config.deploy.base_dir,
            Arc::new(DirectoryRegistry::new(components_dir, extension)),
            type_modules.clone(),
        )
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.base_dir.join(project_id)
    }

    /// Regenerate the project tree for `routes`, returning its root
    pub fn materialize(&self, project_id: &str, routes: &[Route]) -> Result<PathBuf, DeployError> {
        if !validate_project_id(project_id) {
            return Err(DeployError::InvalidProjectId(project_id.to_string()));
        }

        // Validate every route path before touching the disk
        let mut pages: BTreeMap<PathBuf, &Route> = BTreeMap::new();
        for route in routes {
            let page = page_path(&route.path)
                .map_err(|e| DeployError::materialization(self.project_dir(project_id).join(&route.path), e))?;
            if let Some(previous) = pages.insert(page.clone(), route) {
                warn!(
                    project = project_id,
                    route = %route.path,
                    replaced = %previous.path,
                    "Duplicate route path, later route wins"
                );
            }
        }

        let root = self.project_dir(project_id);
        if root.exists() {
            debug!(project = project_id, dir = %root.display(), "Removing previous project tree");
            std::fs::remove_dir_all(&root).map_err(|e| DeployError::materialization(&root, e))?;
        }
        std::fs::create_dir_all(&root).map_err(|e| DeployError::materialization(&root, e))?;

        for (relative, content) in scaffold::files(project_id) {
            write_file(&root, Path::new(relative), &content)?;
        }

        // Only routes that survived deduplication contribute components
        let table = ResolutionTable::build(pages.values().copied(), self.registry.as_ref());

        for (page, route) in &pages {
            let template = PageTemplate::for_route(route, &table);
            if template.is_empty() {
                debug!(project = project_id, route = %route.path, "Route has no renderable components");
            }
            write_file(&root, page, &emit_page(&template))?;
        }

        for component in table.iter() {
            let source = std::fs::read_to_string(&component.source)
                .map_err(|e| DeployError::materialization(&component.source, e))?;
            let stripped = strip_builder_types(&source, &self.type_modules);
            write_file(&root, &component.destination(), &stripped)?;
        }

        info!(
            project = project_id,
            dir = %root.display(),
            routes = pages.len(),
            components = table.len(),
            "Materialized project"
        );
        Ok(root)
    }

    /// Delete the project tree. Returns whether anything was removed.
    pub fn remove(&self, project_id: &str) -> Result<bool, DeployError> {
        if !validate_project_id(project_id) {
            return Err(DeployError::InvalidProjectId(project_id.to_string()));
        }
        let root = self.project_dir(project_id);
        match std::fs::remove_dir_all(&root) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DeployError::materialization(root, e)),
        }
    }
}

/// `/` → `app/page.tsx`, `/courses/intro` → `app/courses/intro/page.tsx`
pub fn page_path(route_path: &str) -> io::Result<PathBuf> {
    let mut path = PathBuf::from("app");
    for segment in route_path.split('/').filter(|s| !s.is_empty()) {
        let invalid = segment == "."
            || segment == ".."
            || segment.contains('\\')
            || segment.contains(':')
            || segment.chars().any(|c| c.is_control() || c == '\u{2028}' || c == '\u{2029}');
        if invalid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid route path segment {:?} in {:?}", segment, route_path),
            ));
        }
        path.push(segment);
    }
    path.push(PAGE_FILE);
    Ok(path)
}

fn write_file(root: &Path, relative: &Path, content: &str) -> Result<(), DeployError> {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DeployError::materialization(parent, e))?;
    }
    std::fs::write(&path, content).map_err(|e| DeployError::materialization(&path, e))
}
