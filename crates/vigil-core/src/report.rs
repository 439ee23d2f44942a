//! Report normalization.
//!
//! Unifies the output of heterogeneous analyzer tools into the
//! [`NormalizedFinding`] schema. Three formats are auto-detected from the
//! JSON shape: SARIF (`runs[].results[]`), the secrets-scanner array
//! (`Description`/`RuleID`/`File`/`StartLine`), and the DAST alert tree
//! (`site[].alerts[]`). Malformed input yields an empty list, never an
//! error — a dropped report must not abort the scan.

use crate::types::NormalizedFinding;
use serde_json::Value;

/// Path fragments that mark a finding as noise: CI plumbing, dependency
/// caches, generic configuration, and our own scan outputs.
pub const FORBIDDEN_PATHS: &[&str] = &[
    ".github",
    "venv",
    "node_modules",
    "k8s-specifications",
    "docker-compose",
    "Dockerfile",
    ".yml",
    ".yaml",
    "semgrep.sarif",
    "gitleaks.json",
    "checkov.sarif",
];

/// Placeholder file path for DAST findings, which have no source location.
pub const DAST_PLACEHOLDER_FILE: &str = "dast-report";

/// Parse a raw report and extract normalized findings.
///
/// `filename` is used only for diagnostics; format detection is structural.
pub fn extract_findings(content: &[u8], filename: &str) -> Vec<NormalizedFinding> {
    let data: Value = match serde_json::from_slice(content) {
        Ok(v) => v,
        Err(e) => {
            // Empty or truncated reports are routine (tool found nothing).
            tracing::warn!(report = filename, error = %e, "skipping malformed report");
            return Vec::new();
        }
    };

    if data.get("runs").is_some() {
        extract_sarif(&data)
    } else if is_secrets_array(&data) {
        extract_secrets(&data)
    } else if data.get("site").is_some() {
        extract_dast(&data)
    } else {
        Vec::new()
    }
}

fn is_secrets_array(data: &Value) -> bool {
    data.as_array()
        .and_then(|arr| arr.first())
        .is_some_and(|first| first.get("Description").is_some())
}

/// SARIF v2: `runs[*].results[*]` with nested physical locations.
fn extract_sarif(data: &Value) -> Vec<NormalizedFinding> {
    let mut extracted = Vec::new();
    for run in data["runs"].as_array().into_iter().flatten() {
        let tool = run["tool"]["driver"]["name"].as_str().unwrap_or("Unknown");
        for res in run["results"].as_array().into_iter().flatten() {
            let location = &res["locations"][0]["physicalLocation"];
            let file = clean_path(location["artifactLocation"]["uri"].as_str().unwrap_or(""));
            if is_forbidden(&file) {
                continue;
            }
            extracted.push(NormalizedFinding {
                tool: tool.to_string(),
                rule_id: res["ruleId"].as_str().map(String::from),
                message: res["message"]["text"].as_str().unwrap_or("").to_string(),
                line: location["region"]["startLine"].as_i64().unwrap_or(0),
                file,
                dast_endpoint: None,
                snippet: String::new(),
            });
        }
    }
    extracted
}

/// Secrets-scanner array: flat objects with PascalCase keys.
fn extract_secrets(data: &Value) -> Vec<NormalizedFinding> {
    let mut extracted = Vec::new();
    for issue in data.as_array().into_iter().flatten() {
        let file = clean_path(issue["File"].as_str().unwrap_or(""));
        if is_forbidden(&file) {
            continue;
        }
        extracted.push(NormalizedFinding {
            tool: "Gitleaks".to_string(),
            rule_id: issue["RuleID"].as_str().map(String::from),
            message: issue["Description"].as_str().unwrap_or("").to_string(),
            line: issue["StartLine"].as_i64().unwrap_or(0),
            file,
            dast_endpoint: None,
            snippet: String::new(),
        });
    }
    extracted
}

/// DAST alert tree: `site[*].alerts[*]`. No file/line; the endpoint URL is
/// retained and the message synthesizes name, risk, URL, and solution.
fn extract_dast(data: &Value) -> Vec<NormalizedFinding> {
    let mut extracted = Vec::new();
    for site in data["site"].as_array().into_iter().flatten() {
        for alert in site["alerts"].as_array().into_iter().flatten() {
            let name = alert["name"].as_str().unwrap_or("Unknown alert");
            let risk = alert["riskdesc"].as_str().unwrap_or("Unknown");
            let url = alert["url"].as_str().unwrap_or("N/A");
            let solution = alert["solution"].as_str().unwrap_or("N/A");
            extracted.push(NormalizedFinding {
                tool: "OWASP ZAP".to_string(),
                // pluginid may arrive as a string or a number
                rule_id: match &alert["pluginid"] {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                },
                message: format!("{name} (Risk: {risk})\nURL: {url}\nSolution: {solution}"),
                file: DAST_PLACEHOLDER_FILE.to_string(),
                line: 0,
                dast_endpoint: alert["url"].as_str().map(String::from),
                snippet: String::new(),
            });
        }
    }
    extracted
}

fn is_forbidden(file: &str) -> bool {
    FORBIDDEN_PATHS.iter().any(|forbidden| file.contains(forbidden))
}

/// Strip worker-environment prefixes so paths are relative to the repo root.
///
/// Removes a `file://` scheme, then any `/tmp/scans/<seg>/` or
/// `/tmp/uploads/<seg>/` prefix, then leading separators. Closed under
/// repetition: `clean_path(clean_path(p)) == clean_path(p)`.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }

    let mut cleaned = path.strip_prefix("file://").unwrap_or(path);

    for prefix in ["/tmp/scans/", "/tmp/uploads/"] {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            // The pattern requires one path segment after the prefix.
            if let Some(idx) = rest.find('/') {
                cleaned = &rest[idx + 1..];
            }
            break;
        }
    }

    cleaned.trim_start_matches('/').to_string()
}
