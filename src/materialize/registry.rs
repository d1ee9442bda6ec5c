//! Component resolution: registry id → source file, and the per-project
//! resolution table shared by page rendering and source copying

use crate::model::Route;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use tracing::warn;

/// Resolves a registry component id to its source file
pub trait ComponentRegistry: Send + Sync {
    fn resolve(&self, component_id: &str) -> Option<PathBuf>;
}

/// Registry laid out on disk as `<root>/<category>/<Name>.<extension>`
#[derive(Debug, Clone)]
pub struct DirectoryRegistry {
    root: PathBuf,
    extension: String,
}

impl DirectoryRegistry {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }
}

impl ComponentRegistry for DirectoryRegistry {
    fn resolve(&self, component_id: &str) -> Option<PathBuf> {
        let reference = ComponentRef::parse(component_id)?;
        let path = self
            .root
            .join(&reference.category)
            .join(format!("{}.{}", reference.name, self.extension));
        path.is_file().then_some(path)
    }
}

impl ComponentRegistry for HashMap<String, PathBuf> {
    fn resolve(&self, component_id: &str) -> Option<PathBuf> {
        self.get(component_id).cloned()
    }
}

impl ComponentRegistry for BTreeMap<String, PathBuf> {
    fn resolve(&self, component_id: &str) -> Option<PathBuf> {
        self.get(component_id).cloned()
    }
}

/// A well-formed `category/Name` component id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRef {
    pub category: String,
    pub name: String,
}

impl ComponentRef {
    /// Category: `[A-Za-z0-9_-]+`. Name: a JS identifier, since it becomes an import binding.
    pub fn parse(component_id: &str) -> Option<Self> {
        let (category, name) = component_id.split_once('/')?;
        let category_ok = !category.is_empty()
            && category
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !category_ok || !is_js_identifier(name) {
            return None;
        }
        Some(Self {
            category: category.to_string(),
            name: name.to_string(),
        })
    }
}

pub(crate) fn is_js_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// `course-cards` → `CourseCards`
fn pascal_case(s: &str) -> String {
    s.split(['-', '_'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// A component that will be both imported by pages and copied into the project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedComponent {
    pub id: String,
    pub category: String,
    pub name: String,
    /// Source file in the registry
    pub source: PathBuf,
    /// Local import binding used in generated pages
    pub binding: String,
}

impl ResolvedComponent {
    /// Module specifier pages import this component from
    pub fn module(&self) -> String {
        format!("@/components/{}/{}", self.category, self.name)
    }

    /// Destination of the copied source, relative to the project root
    pub fn destination(&self) -> PathBuf {
        let extension = self
            .source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("tsx");
        PathBuf::from("components")
            .join(&self.category)
            .join(format!("{}.{}", self.name, extension))
    }
}

/// Names generated pages define themselves
const RESERVED_BINDINGS: &[&str] = &["GeneratedPage", "React"];

/// Every distinct component referenced by a project, resolved once.
///
/// Page rendering and source copying both consult this table, so a component
/// is either rendered and copied, or skipped on both sides.
#[derive(Debug, Clone, Default)]
pub struct ResolutionTable {
    components: BTreeMap<String, ResolvedComponent>,
}

impl ResolutionTable {
    pub fn build<'a>(routes: impl IntoIterator<Item = &'a Route>, registry: &dyn ComponentRegistry) -> Self {
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();

        for route in routes {
            for instance in route.ordered_components() {
                let id = instance.component_id.as_str();
                if !seen.insert(id) {
                    continue;
                }
                let Some(reference) = ComponentRef::parse(id) else {
                    warn!(component = id, route = %route.path, "Skipping malformed component id");
                    continue;
                };
                let Some(source) = registry.resolve(id) else {
                    warn!(component = id, route = %route.path, "Skipping component missing from registry");
                    continue;
                };
                resolved.push((id.to_string(), reference, source));
            }
        }

        // Names shared by several categories get a category prefix
        let mut name_counts: HashMap<&str, usize> = HashMap::new();
        for (_, reference, _) in &resolved {
            *name_counts.entry(reference.name.as_str()).or_default() += 1;
        }

        let mut bindings: HashSet<String> = RESERVED_BINDINGS.iter().map(|s| s.to_string()).collect();
        let mut components = BTreeMap::new();
        for (id, reference, source) in &resolved {
            let base = if name_counts[reference.name.as_str()] > 1
                || RESERVED_BINDINGS.contains(&reference.name.as_str())
            {
                format!("{}{}", pascal_case(&reference.category), reference.name)
            } else {
                reference.name.clone()
            };
            let mut binding = base.clone();
            let mut suffix = 2;
            while !bindings.insert(binding.clone()) {
                binding = format!("{}{}", base, suffix);
                suffix += 1;
            }

            components.insert(
                id.clone(),
                ResolvedComponent {
                    id: id.clone(),
                    category: reference.category.clone(),
                    name: reference.name.clone(),
                    source: source.clone(),
                    binding,
                },
            );
        }

        Self { components }
    }

    pub fn get(&self, component_id: &str) -> Option<&ResolvedComponent> {
        self.components.get(component_id)
    }

    /// Resolved components, ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &ResolvedComponent> {
        self.components.values()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}
