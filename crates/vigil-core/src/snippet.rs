//! Source snippet extraction for findings.
//!
//! Each finding gets a ±5-line window around its reported line so the triage
//! prompt has real code to look at. The reported line is 1-based and clamped
//! to the file; every failure mode produces a distinct placeholder so the
//! snippet column is never absent.

use crate::types::NormalizedFinding;
use std::path::Path;

/// Lines of context on each side of the reported line.
const CONTEXT_LINES: usize = 5;

pub const SNIPPET_FILE_MISSING: &str = "[source file not found in workspace]";
pub const SNIPPET_FILE_EMPTY: &str = "[file is empty]";
pub const SNIPPET_WINDOW_EMPTY: &str = "[snippet is empty]";
pub const SNIPPET_READ_ERROR: &str = "[could not read source file]";

/// Fill the `snippet` field of each finding from files under `source_root`.
pub fn populate_snippets(findings: &mut [NormalizedFinding], source_root: &Path) {
    for finding in findings {
        finding.snippet = extract_snippet(source_root, &finding.file, finding.line);
    }
}

/// Extract the context window for a single finding.
pub fn extract_snippet(source_root: &Path, file: &str, line: i64) -> String {
    let path = source_root.join(file);
    if !path.exists() {
        return SNIPPET_FILE_MISSING.to_string();
    }

    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => return SNIPPET_READ_ERROR.to_string(),
    };

    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return SNIPPET_FILE_EMPTY.to_string();
    }

    // Clamp the 1-based line into range, then convert to a 0-based index.
    let actual = (line.max(1) as usize).min(lines.len()) - 1;
    let start = actual.saturating_sub(CONTEXT_LINES);
    let end = (actual + CONTEXT_LINES).min(lines.len());

    let window = lines[start..end].join("\n");
    if window.trim().is_empty() {
        SNIPPET_WINDOW_EMPTY.to_string()
    } else {
        window
    }
}
