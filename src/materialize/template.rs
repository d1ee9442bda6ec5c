//! Page template model and source emission
//!
//! Pages are built as data first (imports, render calls, prop literals) and
//! only then turned into TSX text, so that prop values never have to be
//! spliced into source by string concatenation.

use super::registry::{is_js_identifier, ResolutionTable};
use crate::model::Route;
use serde_json::Value;
use std::fmt::Write;

/// `import <local> from "<module>";`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportBinding {
    pub local: String,
    pub module: String,
}

/// One JSX attribute: `name={<literal>}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropLiteral {
    pub name: String,
    /// Serialized JSON value
    pub literal: String,
}

/// One rendered component instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderCall {
    /// Import binding of the component
    pub component: String,
    pub props: Vec<PropLiteral>,
    /// Props whose keys are not valid attribute names, as a JSON object literal
    pub spread: Option<String>,
}

/// Everything needed to emit one `page.tsx`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTemplate {
    pub route_path: String,
    pub protection: Option<String>,
    pub imports: Vec<ImportBinding>,
    pub renders: Vec<RenderCall>,
}

impl PageTemplate {
    /// Build the template for `route`; components missing from `table` are skipped
    pub fn for_route(route: &Route, table: &ResolutionTable) -> Self {
        let mut imports: Vec<ImportBinding> = Vec::new();
        let mut renders = Vec::new();

        for instance in route.ordered_components() {
            let Some(component) = table.get(&instance.component_id) else {
                continue;
            };

            if !imports.iter().any(|i| i.local == component.binding) {
                imports.push(ImportBinding {
                    local: component.binding.clone(),
                    module: component.module(),
                });
            }

            renders.push(render_call(&component.binding, &instance.props));
        }

        Self {
            route_path: route.path.clone(),
            protection: route.protection.clone(),
            imports,
            renders,
        }
    }

    /// No component made it onto the page
    pub fn is_empty(&self) -> bool {
        self.renders.is_empty()
    }
}

/// JSX attribute names: identifiers, optionally hyphenated (`data-testid`)
fn is_attribute_name(key: &str) -> bool {
    key.split('-').all(is_js_identifier)
}

fn render_call(binding: &str, props: &serde_json::Map<String, Value>) -> RenderCall {
    let mut keys: Vec<&String> = props.keys().collect();
    keys.sort();

    let mut literals = Vec::new();
    let mut spread = serde_json::Map::new();
    for key in keys {
        let value = &props[key.as_str()];
        if is_attribute_name(key) {
            literals.push(PropLiteral {
                name: key.clone(),
                literal: json_literal(value),
            });
        } else {
            spread.insert(key.clone(), value.clone());
        }
    }

    RenderCall {
        component: binding.to_string(),
        props: literals,
        spread: (!spread.is_empty()).then(|| json_literal(&Value::Object(spread))),
    }
}

/// Serialize with object keys sorted, independent of map ordering features
fn json_literal(value: &Value) -> String {
    let mut out = String::new();
    write_json(&mut out, value);
    out
}

fn write_json(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&js_string(key));
                out.push(':');
                write_json(out, &map[key.as_str()]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json(out, item);
            }
            out.push(']');
        }
        Value::String(s) => out.push_str(&js_string(s)),
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// JSON string literal that is also safe inside JavaScript source.
///
/// JSON allows raw U+2028 and U+2029, but JavaScript treats them as line
/// terminators in comments.
fn js_string(s: &str) -> String {
    Value::String(s.to_string())
        .to_string()
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

/// Render a page template to TSX source
pub fn emit_page(template: &PageTemplate) -> String {
    let mut out = String::new();

    // Route path and tag are quoted so they cannot break out of the comment line
    let _ = write!(out, "// Generated by sitedeploy for route {}", js_string(&template.route_path));
    if let Some(protection) = &template.protection {
        let _ = write!(out, " (protection: {})", js_string(protection));
    }
    out.push_str(". Do not edit.\n");

    if !template.imports.is_empty() {
        out.push('\n');
        for import in &template.imports {
            let _ = writeln!(out, "import {} from \"{}\";", import.local, import.module);
        }
    }

    out.push_str("\nexport default function GeneratedPage() {\n  return (\n");
    if template.is_empty() {
        out.push_str("    <main className=\"sitedeploy-empty\">\n");
        out.push_str("      <p>No components yet</p>\n");
        out.push_str("    </main>\n");
    } else {
        out.push_str("    <main>\n");
        for call in &template.renders {
            out.push_str("      <");
            out.push_str(&call.component);
            for prop in &call.props {
                let _ = write!(out, " {}={{{}}}", prop.name, prop.literal);
            }
            if let Some(spread) = &call.spread {
                let _ = write!(out, " {{...{}}}", spread);
            }
            out.push_str(" />\n");
        }
        out.push_str("    </main>\n");
    }
    out.push_str("  );\n}\n");

    out
}
