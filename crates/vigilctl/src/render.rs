//! Output rendering for the vigilctl CLI.
//!
//! Formats scan, finding, and progress information for terminal display.

use chrono::{DateTime, Utc};
use vigil_core::{Finding, Scan};
use vigild::progress::ProgressState;

/// Print confirmation after enqueuing a scan job.
pub fn print_scan_enqueued(project: &str, job_id: &str, reference_id: &str) {
    println!("Enqueued scan job: {job_id}");
    println!("  Project:   {project}");
    println!("  Reference: {reference_id}");
    println!();
    println!("Poll with: vigilctl status {reference_id}");
}

/// Print a scan row with its live progress, if any.
pub fn print_scan_status(scan: &Scan, progress: Option<&ProgressState>) {
    println!("Scan: {}", scan.id);
    println!();
    println!("  Project:    {}", scan.project_name);
    println!("  Commit:     {}", scan.commit_sha);
    println!("  Branch:     {}", scan.branch);
    println!("  CI:         {}", scan.ci_provider);
    println!("  Status:     {}", scan.status.as_str());
    if let Some(ref target) = scan.target_url {
        println!("  DAST URL:   {target}");
    }
    if let Some(ref reference) = scan.reference_id {
        println!("  Reference:  {reference}");
    }
    println!("  Created:    {}", format_time(&scan.created_at));

    if let Some(state) = progress {
        println!();
        println!("  Progress:");
        println!("    Stage:    {}", state.stage);
        if state.total_steps > 0 {
            println!("    Step:     {}/{}", state.step_number, state.total_steps);
        }
        println!("    Message:  {}", state.message);
        println!("    Status:   {}", state.status);
        if let Some(ref error) = state.error {
            println!("    Error:    {error}");
        }
    }
}

/// Print findings in tabular format.
pub fn print_findings(findings: &[Finding]) {
    if findings.is_empty() {
        println!("No findings.");
        return;
    }

    // Header
    println!(
        "{:<6}  {:<10}  {:<30}  {:>5}  {:<8}  {:<8}",
        "ID", "TOOL", "FILE", "LINE", "VERDICT", "PR"
    );
    println!("{}", "-".repeat(78));

    for finding in findings {
        println!(
            "{:<6}  {:<10}  {:<30}  {:>5}  {:<8}  {:<8}",
            finding.id,
            truncate(&finding.tool, 10),
            truncate(&finding.file, 30),
            finding.line,
            finding.ai_verdict.as_deref().unwrap_or("-"),
            if finding.pr_url.is_some() { "yes" } else { "-" },
        );
    }

    println!();
    println!("{} finding(s)", findings.len());
}

/// Print one finding in full.
pub fn print_finding_details(finding: &Finding) {
    println!("Finding: {}", finding.id);
    println!();
    println!("  Tool:      {}", finding.tool);
    println!("  Rule:      {}", finding.rule_id.as_deref().unwrap_or("-"));
    println!("  File:      {}:{}", finding.file, finding.line);
    if let Some(ref endpoint) = finding.dast_endpoint {
        println!("  Endpoint:  {endpoint}");
    }
    println!("  Verdict:   {}", finding.ai_verdict.as_deref().unwrap_or("-"));
    println!("  Severity:  {}", finding.severity.as_deref().unwrap_or("-"));
    if let Some(ref url) = finding.pr_url {
        println!("  PR:        {url}");
    }
    if let Some(ref error) = finding.pr_error {
        println!("  PR error:  {error}");
    }
    println!();
    println!("  Message:");
    for line in finding.message.lines() {
        println!("    {line}");
    }
    if !finding.snippet.is_empty() {
        println!();
        println!("  Snippet:");
        for line in finding.snippet.lines() {
            println!("    {line}");
        }
    }
    if let Some(ref logs) = finding.sandbox_logs {
        println!();
        println!("  Sandbox log:");
        for line in logs.lines() {
            println!("    {line}");
        }
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    }
}
