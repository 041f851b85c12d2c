//! File dependency graph built from import statements.
//!
//! Only workspace-relative references become edges; bare package names
//! (`require('fs')`) are ignored.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::LazyLock;

use regex::Regex;

use super::types::WorkspaceSnapshot;

static JS_REQUIRE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap());

static JS_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(?:import|export)\s+(?:[^'";]*?\s+from\s+)?['"]([^'"]+)['"]"#).unwrap()
});

static JS_DYNAMIC_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"import\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap());

static CSS_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"@import\s+(?:url\()?\s*['"]([^'"]+)['"]"#).unwrap());

static HTML_SRC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<(?:script|link|img)[^>]*?\s(?:src|href)\s*=\s*['"]([^'"]+)['"]"#).unwrap());

static PY_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:from\s+(\.*[\w.]*)\s+import\s+([\w, ]+)|import\s+([\w.]+))").unwrap()
});

const JS_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "jsx", "ts", "tsx", "json"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyGraph {
    /// path -> workspace files it references
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn build(snapshot: &WorkspaceSnapshot) -> Self {
        let known: BTreeSet<&str> = snapshot.files.keys().map(String::as_str).collect();
        let mut edges = BTreeMap::new();

        for (path, file) in &snapshot.files {
            let deps: BTreeSet<String> = extract_specifiers(&file.language, &file.content)
                .into_iter()
                .filter_map(|spec| resolve(path, &spec, &file.language, &known))
                .filter(|dep| dep != path)
                .collect();
            edges.insert(path.clone(), deps);
        }

        Self { edges }
    }

    pub fn dependencies(&self, path: &str) -> Vec<&str> {
        self.edges
            .get(path)
            .map(|deps| deps.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn dependents(&self, path: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.contains(path))
            .map(|(p, _)| p.as_str())
            .collect()
    }

    /// Files reachable from `roots` by following dependencies, roots first.
    pub fn closure(&self, roots: &[String]) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<&str> = roots.iter().map(String::as_str).collect();
        while let Some(path) = queue.pop_front() {
            if !self.edges.contains_key(path) || !seen.insert(path.to_string()) {
                continue;
            }
            order.push(path.to_string());
            queue.extend(self.dependencies(path));
        }
        order
    }

    /// One line per file: `path -> dep, dep`. Used as planner context.
    pub fn render(&self) -> String {
        self.edges
            .iter()
            .map(|(path, deps)| {
                if deps.is_empty() {
                    path.clone()
                } else {
                    let list: Vec<&str> = deps.iter().map(String::as_str).collect();
                    format!("{} -> {}", path, list.join(", "))
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn extract_specifiers(language: &str, content: &str) -> Vec<String> {
    let mut specs = Vec::new();
    let mut collect = |re: &Regex| {
        for caps in re.captures_iter(content) {
            if let Some(m) = caps.get(1) {
                specs.push(m.as_str().to_string());
            }
        }
    };

    match language {
        "javascript" | "typescript" => {
            collect(&JS_REQUIRE);
            collect(&JS_IMPORT);
            collect(&JS_DYNAMIC_IMPORT);
        }
        "css" => collect(&CSS_IMPORT),
        "html" => collect(&HTML_SRC),
        "python" => {
            for caps in PY_IMPORT.captures_iter(content) {
                if let Some(from) = caps.get(1) {
                    let module = from.as_str();
                    if module.chars().all(|c| c == '.') {
                        // `from . import a, b`
                        if let Some(names) = caps.get(2) {
                            for name in names.as_str().split(',') {
                                specs.push(format!("{}{}", module, name.trim()));
                            }
                        }
                    } else {
                        specs.push(module.to_string());
                    }
                } else if let Some(module) = caps.get(3) {
                    specs.push(module.as_str().to_string());
                }
            }
        }
        _ => {}
    }
    specs
}

fn parent_dir(path: &str) -> &str {
    path.rfind('/').map_or("", |i| &path[..i])
}

/// Join `base` and a relative reference, collapsing `.` and `..`.
fn join(base: &str, rel: &str) -> Option<String> {
    let mut parts: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();
    for segment in rel.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            s => parts.push(s),
        }
    }
    Some(parts.join("/"))
}

fn resolve(from: &str, spec: &str, language: &str, known: &BTreeSet<&str>) -> Option<String> {
    let spec = spec.split(['?', '#']).next().unwrap_or(spec);
    if spec.contains("://") || spec.starts_with("data:") {
        return None;
    }

    if language == "python" {
        return resolve_python(from, spec, known);
    }

    let relative = spec.starts_with("./") || spec.starts_with("../");
    let candidate = if relative {
        join(parent_dir(from), spec)?
    } else if spec.starts_with('/') {
        join("", spec)?
    } else if matches!(language, "html" | "css") {
        join(parent_dir(from), spec)?
    } else {
        return None;
    };

    if known.contains(candidate.as_str()) {
        return Some(candidate);
    }
    for ext in JS_EXTENSIONS {
        let with_ext = format!("{}.{}", candidate, ext);
        if known.contains(with_ext.as_str()) {
            return Some(with_ext);
        }
    }
    for ext in JS_EXTENSIONS {
        let index = format!("{}/index.{}", candidate, ext);
        if known.contains(index.as_str()) {
            return Some(index);
        }
    }
    None
}

fn resolve_python(from: &str, module: &str, known: &BTreeSet<&str>) -> Option<String> {
    let dots = module.chars().take_while(|c| *c == '.').count();
    let rest = module[dots..].replace('.', "/");
    let base = if dots > 0 {
        let mut dir = parent_dir(from).to_string();
        for _ in 1..dots {
            dir = parent_dir(&dir).to_string();
        }
        dir
    } else {
        String::new()
    };

    let stem = join(&base, &rest)?;
    let candidates = [format!("{}.py", stem), format!("{}/__init__.py", stem)];
    // Absolute imports may also be siblings of the importing file.
    let sibling = join(parent_dir(from), &rest).map(|s| format!("{}.py", s));
    candidates
        .into_iter()
        .chain(sibling)
        .find(|c| known.contains(c.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::types::{WorkspaceFile, language_for_path};
    use chrono::Utc;

    fn snapshot(files: &[(&str, &str)]) -> WorkspaceSnapshot {
        let now = Utc::now();
        WorkspaceSnapshot {
            id: "g".into(),
            name: "graph".into(),
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), WorkspaceFile::new(*p, language_for_path(p), *c)))
                .collect(),
            created_at: now,
            updated_at: now,
            template_id: "blank".into(),
        }
    }

    #[test]
    fn test_js_require_and_import_edges() {
        let snap = snapshot(&[
            ("main.js", "const u = require('./util');\nimport x from './lib/x.js';\nconst fs = require('fs');"),
            ("util.js", "module.exports = {};"),
            ("lib/x.js", "import { y } from '../util';"),
        ]);
        let graph = DependencyGraph::build(&snap);
        assert_eq!(graph.dependencies("main.js"), vec!["lib/x.js", "util.js"]);
        assert_eq!(graph.dependencies("lib/x.js"), vec!["util.js"]);
        assert_eq!(graph.dependents("util.js"), vec!["lib/x.js", "main.js"]);
    }

    #[test]
    fn test_index_resolution() {
        let snap = snapshot(&[
            ("main.js", "require('./lib')"),
            ("lib/index.js", ""),
        ]);
        let graph = DependencyGraph::build(&snap);
        assert_eq!(graph.dependencies("main.js"), vec!["lib/index.js"]);
    }

    #[test]
    fn test_html_and_css_references() {
        let snap = snapshot(&[
            ("index.html", r#"<link rel="stylesheet" href="style.css"><script src="app.js"></script>"#),
            ("style.css", "@import 'base.css';"),
            ("base.css", ""),
            ("app.js", ""),
        ]);
        let graph = DependencyGraph::build(&snap);
        assert_eq!(graph.dependencies("index.html"), vec!["app.js", "style.css"]);
        assert_eq!(graph.dependencies("style.css"), vec!["base.css"]);
    }

    #[test]
    fn test_python_imports() {
        let snap = snapshot(&[
            ("main.py", "import helpers\nfrom pkg.mod import thing\nimport os"),
            ("helpers.py", ""),
            ("pkg/mod.py", "from . import sibling"),
            ("pkg/sibling.py", ""),
        ]);
        let graph = DependencyGraph::build(&snap);
        assert_eq!(graph.dependencies("main.py"), vec!["helpers.py", "pkg/mod.py"]);
        assert_eq!(graph.dependencies("pkg/mod.py"), vec!["pkg/sibling.py"]);
    }

    #[test]
    fn test_closure_follows_dependencies() {
        let snap = snapshot(&[
            ("a.js", "require('./b')"),
            ("b.js", "require('./c')"),
            ("c.js", ""),
            ("d.js", ""),
        ]);
        let graph = DependencyGraph::build(&snap);
        assert_eq!(graph.closure(&["a.js".to_string()]), vec!["a.js", "b.js", "c.js"]);
        assert!(graph.render().contains("a.js -> b.js"));
    }
}
