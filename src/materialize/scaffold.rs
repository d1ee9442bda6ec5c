//! Fixed project files every materialized site gets

use serde_json::json;

/// Pinned framework versions
const NEXT_VERSION: &str = "14.2.5";
const REACT_VERSION: &str = "18.3.1";
const TYPESCRIPT_VERSION: &str = "5.5.4";

/// A scaffold file: path relative to the project root, and its content
pub type ScaffoldFile = (&'static str, String);

/// Every static file of a project, in write order
pub fn files(project_id: &str) -> Vec<ScaffoldFile> {
    vec![
        ("package.json", package_json(project_id)),
        ("tsconfig.json", tsconfig_json()),
        ("next.config.js", NEXT_CONFIG.to_string()),
        (".eslintrc.json", ESLINTRC.to_string()),
        ("next-env.d.ts", NEXT_ENV.to_string()),
        ("app/globals.css", GLOBALS_CSS.to_string()),
        ("app/layout.tsx", layout(project_id)),
    ]
}

/// npm package names must be lowercase
fn package_name(project_id: &str) -> String {
    format!("site-{}", project_id.to_ascii_lowercase())
}

fn pretty(value: serde_json::Value) -> String {
    // Serializing a json! literal cannot fail
    let mut text = serde_json::to_string_pretty(&value).unwrap_or_default();
    text.push('\n');
    text
}

fn package_json(project_id: &str) -> String {
    pretty(json!({
        "name": package_name(project_id),
        "version": "0.1.0",
        "private": true,
        "scripts": {
            "dev": "next dev",
            "build": "next build",
            "start": "next start",
            "lint": "next lint"
        },
        "dependencies": {
            "next": NEXT_VERSION,
            "react": REACT_VERSION,
            "react-dom": REACT_VERSION
        },
        "devDependencies": {
            "@types/node": "20.14.10",
            "@types/react": "18.3.3",
            "@types/react-dom": "18.3.0",
            "eslint": "8.57.0",
            "eslint-config-next": NEXT_VERSION,
            "typescript": TYPESCRIPT_VERSION
        }
    }))
}

fn tsconfig_json() -> String {
    pretty(json!({
        "compilerOptions": {
            "target": "es2017",
            "lib": ["dom", "dom.iterable", "esnext"],
            "allowJs": true,
            "skipLibCheck": true,
            "strict": false,
            "noEmit": true,
            "esModuleInterop": true,
            "module": "esnext",
            "moduleResolution": "bundler",
            "resolveJsonModule": true,
            "isolatedModules": true,
            "jsx": "preserve",
            "incremental": true,
            "plugins": [{ "name": "next" }],
            "paths": { "@/*": ["./*"] }
        },
        "include": ["next-env.d.ts", "**/*.ts", "**/*.tsx", ".next/types/**/*.ts"],
        "exclude": ["node_modules"]
    }))
}

const NEXT_CONFIG: &str = r#"/** @type {import('next').NextConfig} */
const nextConfig = {
  reactStrictMode: true,
  poweredByHeader: false,
  eslint: {
    ignoreDuringBuilds: true,
  },
  typescript: {
    ignoreBuildErrors: true,
  },
};

module.exports = nextConfig;
"#;

const ESLINTRC: &str = r#"{
  "extends": "next/core-web-vitals"
}
"#;

const NEXT_ENV: &str = r#"/// <reference types="next" />
/// <reference types="next/image-types/global" />

// NOTE: This file should not be edited
// see https://nextjs.org/docs/basic-features/typescript for more information.
"#;

const GLOBALS_CSS: &str = r#"*,
*::before,
*::after {
  box-sizing: border-box;
}

html,
body {
  margin: 0;
  padding: 0;
  font-family: system-ui, -apple-system, "Segoe UI", Roboto, sans-serif;
}

main {
  min-height: 100vh;
}

.sitedeploy-empty {
  display: flex;
  align-items: center;
  justify-content: center;
  color: #6b7280;
}
"#;

fn layout(project_id: &str) -> String {
    let title = serde_json::Value::String(project_id.to_string());
    format!(
        r#"import "./globals.css";

export const metadata = {{
  title: {title},
}};

export default function RootLayout({{ children }}: {{ children: React.ReactNode }}) {{
  return (
    <html lang="en">
      <body>{{children}}</body>
    </html>
  );
}}
"#
    )
}
