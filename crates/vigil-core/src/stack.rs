//! Application stack detection.
//!
//! Heuristics over a source tree that classify language, framework, HTTP
//! port, and entry command. The result decides whether the coordinator asks
//! the sandbox to deploy an ephemeral DAST target, and with which start
//! command.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Coarse application classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Web,
    #[default]
    Unknown,
}

impl AppType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Unknown => "unknown",
        }
    }
}

/// Detection result for a source tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackInfo {
    #[serde(rename = "type")]
    pub app_type: AppType,
    pub framework: Option<String>,
    pub language: Option<String>,
    pub port: Option<u16>,
    pub start_command: Option<String>,
    pub detected: bool,
}

/// Directories skipped during the recursive entry-point probe.
const SKIP_DIRS: &[&str] = &["node_modules", "venv", ".git", "__pycache__"];

const PYTHON_ENTRY_POINTS: &[&str] =
    &["main.py", "app.py", "wsgi.py", "server.py", "manage.py", "run.py"];
const NODE_ENTRY_POINTS: &[&str] = &["server.js", "app.js", "index.js", "main.js"];

/// Analyze a source directory and detect the application stack.
///
/// Rules, in order: Dockerfile `EXPOSE` for the port; language by dependency
/// manifest; framework by manifest contents; entry-point probe (root hits
/// beat deeper ones); default ports per framework; `type = web` iff a
/// framework or port was determined.
pub fn detect_stack(source_path: &Path) -> StackInfo {
    let mut result = StackInfo::default();

    // 1. Dockerfile is the highest-confidence source for the port.
    let dockerfile = source_path.join("Dockerfile");
    if dockerfile.exists() {
        if let Ok(content) = std::fs::read_to_string(&dockerfile) {
            result.port = parse_exposed_port(&content);
        }
    }

    // 2. Language and framework from dependency manifests.
    if source_path.join("requirements.txt").exists() {
        result.language = Some("python".to_string());
        analyze_python(source_path, &mut result);
    } else if source_path.join("package.json").exists() {
        result.language = Some("node".to_string());
        analyze_node(source_path, &mut result);
    } else if source_path.join("main.go").exists() || source_path.join("go.mod").exists() {
        result.language = Some("go".to_string());
    }

    // 3. Default ports when the Dockerfile didn't specify one.
    if result.port.is_none() {
        result.port = match result.framework.as_deref() {
            Some("flask") => Some(5000),
            Some("fastapi") | Some("django") => Some(8000),
            Some("express") => Some(3000),
            _ if result.language.as_deref() == Some("java") => Some(8080),
            _ => None,
        };
    }

    // 4. Web iff we found a framework or a port.
    if result.framework.is_some() || result.port.is_some() {
        result.app_type = AppType::Web;
        result.detected = true;
    }

    result
}

/// Extract the first `EXPOSE` directive from Dockerfile content.
fn parse_exposed_port(content: &str) -> Option<u16> {
    for line in content.lines() {
        let trimmed = line.trim();
        let Some(rest) = strip_prefix_ignore_case(trimmed, "EXPOSE") else {
            continue;
        };
        let port_token = rest.split_whitespace().next()?;
        // Tolerate protocol suffixes like `8080/tcp`.
        let digits = port_token.split('/').next().unwrap_or(port_token);
        if let Ok(port) = digits.parse() {
            return Some(port);
        }
    }
    None
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    match s.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => s.get(prefix.len()..),
        _ => None,
    }
}

fn analyze_python(path: &Path, result: &mut StackInfo) {
    if let Ok(reqs) = std::fs::read_to_string(path.join("requirements.txt")) {
        let reqs = reqs.to_lowercase();
        if reqs.contains("flask") {
            result.framework = Some("flask".to_string());
        } else if reqs.contains("fastapi") {
            result.framework = Some("fastapi".to_string());
        } else if reqs.contains("django") {
            result.framework = Some("django".to_string());
        }
    }

    if let Some(entry) = find_entry_point(path, "python") {
        result.start_command = Some(format!("python3 {entry}"));
    }
}

fn analyze_node(path: &Path, result: &mut StackInfo) {
    let Ok(content) = std::fs::read_to_string(path.join("package.json")) else {
        return;
    };
    let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&content) else {
        return;
    };

    if let Some(deps) = pkg.get("dependencies").and_then(|d| d.as_object()) {
        if deps.contains_key("express") {
            result.framework = Some("express".to_string());
        }
        if deps.contains_key("nestjs") {
            result.framework = Some("nest".to_string());
        }
    }

    let has_start_script = pkg
        .get("scripts")
        .and_then(|s| s.get("start"))
        .is_some();
    if has_start_script {
        result.start_command = Some("npm start".to_string());
    } else if let Some(entry) = find_entry_point(path, "node") {
        result.start_command = Some(format!("node {entry}"));
    }
}

/// Search for a well-known application entry point file.
///
/// Root-level hits take priority; otherwise the tree is walked recursively,
/// skipping dependency and VCS directories. Returns the path relative to
/// `source_path`.
pub fn find_entry_point(source_path: &Path, language: &str) -> Option<String> {
    let candidates: &[&str] = match language {
        "python" => PYTHON_ENTRY_POINTS,
        "node" => NODE_ENTRY_POINTS,
        _ => return None,
    };

    // Root first: a top-level app.py beats src/deep/app.py.
    for candidate in candidates {
        if source_path.join(candidate).exists() {
            return Some((*candidate).to_string());
        }
    }

    walk_for_entry(source_path, source_path, candidates)
}

fn walk_for_entry(root: &Path, dir: &Path, candidates: &[&str]) -> Option<String> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut subdirs = Vec::new();

    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if path.is_dir() {
            if !SKIP_DIRS.iter().any(|skip| name.contains(skip)) {
                subdirs.push(path);
            }
        } else if candidates.contains(&name.as_ref()) {
            return path
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().to_string());
        }
    }

    for subdir in subdirs {
        if let Some(found) = walk_for_entry(root, &subdir, candidates) {
            return Some(found);
        }
    }
    None
}
