//! Removal of builder-only type imports from copied component sources
//!
//! Registry components are written against the builder's own type modules
//! (prop schemas, registry helpers) that do not exist in a deployed project.
//! This is a line-oriented rewrite, not a TypeScript parser: it understands
//! import statements and the handful of annotation shapes components use.

use super::registry::is_js_identifier;
use std::collections::BTreeSet;

/// Import statements spanning more lines than this are left alone
const MAX_IMPORT_LINES: usize = 50;

/// Strip type-only imports, imports from `type_modules`, and annotations
/// that name anything those imports bound.
pub fn strip_builder_types(source: &str, type_modules: &[String]) -> String {
    let mut removed = BTreeSet::new();
    let mut body = String::with_capacity(source.len());

    let lines: Vec<&str> = source.split_inclusive('\n').collect();
    let mut i = 0;
    while i < lines.len() {
        if !starts_import(lines[i]) {
            body.push_str(lines[i]);
            i += 1;
            continue;
        }

        // Gather the whole statement
        let mut end = i;
        let mut statement = lines[i].to_string();
        while !import_complete(&statement) && end + 1 < lines.len() && end - i < MAX_IMPORT_LINES {
            end += 1;
            statement.push_str(lines[end]);
        }

        if let Some(rewritten) = rewrite_import(&statement, type_modules, &mut removed) {
            body.push_str(&rewritten);
        }
        i = end + 1;
    }

    removed
        .iter()
        .fold(body, |text, ident| strip_annotations(&text, ident))
}

fn starts_import(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("import ") || trimmed.starts_with("import{")
}

fn import_complete(statement: &str) -> bool {
    let rest = statement.trim_start()["import".len()..].trim_start();
    if rest.starts_with('"') || rest.starts_with('\'') {
        return true;
    }
    module_specifier(statement).is_some()
}

/// Position of the `from` keyword and the quoted module that follows it
fn from_clause(statement: &str) -> Option<(usize, String)> {
    statement.rmatch_indices("from").find_map(|(idx, _)| {
        let rest = statement[idx + "from".len()..].trim_start();
        let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
        let inner = &rest[1..];
        let close = inner.find(quote)?;
        Some((idx, inner[..close].to_string()))
    })
}

fn module_specifier(statement: &str) -> Option<String> {
    from_clause(statement).map(|(_, module)| module)
}

#[derive(Debug, Default, PartialEq)]
struct ImportClause {
    default: Option<String>,
    namespace: Option<String>,
    named: Vec<Specifier>,
}

#[derive(Debug, PartialEq)]
struct Specifier {
    /// Text without a leading `type`, e.g. `Props as CardProps`
    text: String,
    local: String,
    type_only: bool,
}

fn parse_specifier(raw: &str) -> Option<Specifier> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (type_only, text) = match raw.strip_prefix("type ") {
        Some(rest) => (true, rest.trim()),
        None => (false, raw),
    };
    let local = match text.split_once(" as ") {
        Some((_, alias)) => alias.trim(),
        None => text,
    };
    Some(Specifier {
        text: text.to_string(),
        local: local.to_string(),
        type_only,
    })
}

fn parse_clause(clause: &str) -> ImportClause {
    let mut parsed = ImportClause::default();

    let (outside, inside) = match (clause.find('{'), clause.rfind('}')) {
        (Some(open), Some(close)) if open < close => (
            format!("{}{}", &clause[..open], &clause[close + 1..]),
            Some(&clause[open + 1..close]),
        ),
        _ => (clause.to_string(), None),
    };

    for part in outside.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some(ns) = part.strip_prefix('*') {
            let ns = ns.trim_start().strip_prefix("as").unwrap_or(ns).trim();
            parsed.namespace = Some(ns.to_string());
        } else {
            parsed.default = Some(part.to_string());
        }
    }

    if let Some(inside) = inside {
        parsed.named = inside.split(',').filter_map(parse_specifier).collect();
    }
    parsed
}

/// Rewrite one import statement. `None` drops it entirely; locals it bound
/// are added to `removed`.
fn rewrite_import(
    statement: &str,
    type_modules: &[String],
    removed: &mut BTreeSet<String>,
) -> Option<String> {
    let after_import = statement.trim_start()["import".len()..].trim_start();
    let (type_only, clause_text) = match after_import.strip_prefix("type ") {
        Some(rest) => (true, rest),
        None => (false, after_import),
    };
    let Some((from_idx, module)) = from_clause(clause_text) else {
        // Side-effect import or something unrecognized
        return Some(statement.to_string());
    };
    let clause = parse_clause(&clause_text[..from_idx]);

    let builder_module = type_modules
        .iter()
        .any(|m| module == *m || module.starts_with(&format!("{}/", m)));

    if type_only || builder_module {
        removed.extend(clause.default.iter().cloned());
        removed.extend(clause.namespace.iter().cloned());
        removed.extend(clause.named.iter().map(|s| s.local.clone()));
        return None;
    }

    if !clause.named.iter().any(|s| s.type_only) {
        return Some(statement.to_string());
    }

    let (dropped, kept): (Vec<Specifier>, Vec<Specifier>) =
        clause.named.into_iter().partition(|s| s.type_only);
    removed.extend(dropped.into_iter().map(|s| s.local));

    let mut bindings = Vec::new();
    if let Some(default) = clause.default {
        bindings.push(default);
    }
    if let Some(ns) = clause.namespace {
        bindings.push(format!("* as {}", ns));
    }
    if !kept.is_empty() {
        let names: Vec<String> = kept.into_iter().map(|s| s.text).collect();
        bindings.push(format!("{{ {} }}", names.join(", ")));
    }
    if bindings.is_empty() {
        return None;
    }

    let indent: String = statement.chars().take_while(|c| *c == ' ' || *c == '\t').collect();
    Some(format!(
        "{}import {} from \"{}\";\n",
        indent,
        bindings.join(", "),
        module
    ))
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// `ident` followed by any number of `[]`
fn extend_over_array_suffix(text: &str, mut end: usize) -> usize {
    while text[end..].starts_with("[]") {
        end += 2;
    }
    end
}

/// Remove `: T`, `?: T`, `: T[]`, `as T`, `satisfies T` and `<T>` for `ident`
fn strip_annotations(text: &str, ident: &str) -> String {
    if !is_js_identifier(ident) {
        return text.to_string();
    }

    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut search = 0;

    while let Some(rel) = text[search..].find(ident) {
        let start = search + rel;
        let end = start + ident.len();
        search = end;

        let bounded_left = start == 0 || !is_ident_byte(bytes[start - 1]);
        let bounded_right = end == bytes.len() || !is_ident_byte(bytes[end]);
        if !bounded_left || !bounded_right || start < copied {
            continue;
        }

        let before = text[..start].trim_end();
        let span = if let Some(stripped) = before.strip_suffix("?:") {
            Some((stripped.len(), extend_over_array_suffix(text, end)))
        } else if let Some(stripped) = before.strip_suffix(':') {
            Some((stripped.len(), extend_over_array_suffix(text, end)))
        } else if let Some(keyword) = ["as", "satisfies"]
            .into_iter()
            .find(|k| ends_with_word(before, k))
        {
            let cut = before[..before.len() - keyword.len()].trim_end().len();
            Some((cut, extend_over_array_suffix(text, end)))
        } else if start > 0 && bytes[start - 1] == b'<' && text[end..].starts_with('>') {
            let open = start - 1;
            let generic_position = open > 0 && (is_ident_byte(bytes[open - 1]) || bytes[open - 1] == b'.');
            generic_position.then_some((open, end + 1))
        } else {
            None
        };

        if let Some((cut_from, cut_to)) = span {
            if cut_from >= copied {
                out.push_str(&text[copied..cut_from]);
                copied = cut_to;
                search = cut_to;
            }
        }
    }

    out.push_str(&text[copied..]);
    out
}

fn ends_with_word(text: &str, word: &str) -> bool {
    match text.strip_suffix(word) {
        Some(rest) => rest
            .as_bytes()
            .last()
            .map_or(false, |b| !is_ident_byte(*b)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modules() -> Vec<String> {
        vec!["@/types".to_string(), "@/lib/registry".to_string()]
    }

    #[test]
    fn test_drops_type_only_and_builder_imports() {
        let source = "import React from \"react\";\n\
                      import type { CardProps } from \"./shared\";\n\
                      import { ComponentMeta } from \"@/types\";\n\
                      import { register } from \"@/lib/registry/helpers\";\n\
                      \n\
                      export default function Card(props: CardProps) {\n\
                      \x20 return <div>{props.title}</div>;\n\
                      }\n";
        let stripped = strip_builder_types(source, &modules());

        assert!(stripped.contains("import React from \"react\";"));
        assert!(!stripped.contains("import type"));
        assert!(!stripped.contains("@/types"));
        assert!(!stripped.contains("@/lib/registry"));
        assert!(stripped.contains("export default function Card(props) {"));
    }

    #[test]
    fn test_inline_type_specifiers_removed() {
        let source = "import { useState, type FC } from 'react';\n\
                      const Hero: FC = () => null;\n";
        let stripped = strip_builder_types(source, &modules());
        assert!(stripped.starts_with("import { useState } from \"react\";\n"));
        assert!(stripped.contains("const Hero = () => null;"));
    }

    #[test]
    fn test_import_with_only_type_specifiers_dropped() {
        let source = "import { type ReactNode } from \"react\";\nexport const x = 1;\n";
        assert_eq!(strip_builder_types(source, &modules()), "export const x = 1;\n");
    }

    #[test]
    fn test_multiline_import_removed() {
        let source = "import {\n  NavItem,\n  NavConfig as Config,\n} from \"@/types\";\n\
                      const items: NavItem[] = [];\n\
                      const config = {} as Config;\n\
                      const checked = { items } satisfies Config;\n";
        let stripped = strip_builder_types(source, &modules());
        assert_eq!(
            stripped,
            "const items = [];\nconst config = {};\nconst checked = { items };\n"
        );
    }

    #[test]
    fn test_generic_and_optional_annotations() {
        let source = "import type { Slide } from \"@/types\";\n\
                      function Carousel(props?: Slide) {\n\
                      \x20 const [index] = useState<Slide>(null);\n\
                      }\n";
        let stripped = strip_builder_types(source, &modules());
        assert!(stripped.contains("function Carousel(props) {"));
        assert!(stripped.contains("const [index] = useState(null);"));
    }

    #[test]
    fn test_unrelated_code_untouched() {
        let source = "import Link from \"next/link\";\n\
                      import \"./styles.css\";\n\
                      const SlideShow = { Slide: 1 };\n\
                      const label = cond ? a : b;\n";
        assert_eq!(strip_builder_types(source, &modules()), source);
    }

    #[test]
    fn test_identifier_boundaries_respected() {
        let source = "import type { Item } from \"@/types\";\nconst x: ItemList = y;\nconst z: Item = w;\n";
        let stripped = strip_builder_types(source, &modules());
        assert_eq!(stripped, "const x: ItemList = y;\nconst z = w;\n");
    }

    #[test]
    fn test_parse_clause_forms() {
        let clause = parse_clause("React, { useState, type FC, a as b } ");
        assert_eq!(clause.default.as_deref(), Some("React"));
        assert_eq!(clause.named.len(), 3);
        assert!(clause.named[1].type_only);
        assert_eq!(clause.named[2].local, "b");

        let clause = parse_clause("* as Types ");
        assert_eq!(clause.namespace.as_deref(), Some("Types"));
    }
}
