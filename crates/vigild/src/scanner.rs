//! Analyzer driver: parallel execution of security tools.
//!
//! Prepares a shared per-scan workspace (full tree or delta copy), then
//! launches the configured analyzers simultaneously inside their helper
//! containers. Each tool has an exit-code allow-list — several return
//! non-zero just to signal "findings present" — and a tool that exits
//! outside its list or fails to launch is dropped while the scan continues.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};
use vigil_core::types::short_uid;

#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to copy source tree: {0}")]
    CopyFailed(String),
}

pub type Result<T> = std::result::Result<T, ScannerError>;

/// One analyzer invocation: full argv plus its exit-code allow-list and the
/// report file it is expected to produce.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub command: Vec<String>,
    pub allowed_exit_codes: Vec<i32>,
    pub report: PathBuf,
}

/// Result of a driver run: the shared workspace (owned by the scan job and
/// removed by the coordinator) and the reports of the tools that succeeded.
#[derive(Debug)]
pub struct ScanOutcome {
    pub workspace_dir: PathBuf,
    pub reports: Vec<PathBuf>,
}

/// Driver over the fixed analyzer set.
#[derive(Debug, Clone)]
pub struct AnalyzerDriver {
    scan_dir: PathBuf,
    extra_rules: Vec<String>,
    tool_timeout: Duration,
}

impl AnalyzerDriver {
    pub fn new(scan_dir: &Path, extra_rules: Vec<String>, tool_timeout: Duration) -> Self {
        Self {
            scan_dir: scan_dir.to_path_buf(),
            extra_rules,
            tool_timeout,
        }
    }

    /// Run all configured analyzers against `target_path`.
    ///
    /// `changed_files` switches the workspace into delta mode; `target_url`
    /// adds the DAST baseline scan.
    pub async fn run_scan(
        &self,
        target_path: &Path,
        project: &str,
        target_url: Option<&str>,
        changed_files: &[String],
    ) -> Result<ScanOutcome> {
        let scan_id = short_uid();
        let workspace_dir = self.scan_dir.join(format!("{scan_id}_src"));

        self.prepare_workspace(target_path, &workspace_dir, project, changed_files)?;

        let tools = self.build_tools(&scan_id, &workspace_dir, target_url, changed_files);
        let tool_names: Vec<&str> = tools.iter().map(|t| t.name).collect();

        let started = Instant::now();
        let mut set = JoinSet::new();
        for tool in tools {
            let tool_timeout = self.tool_timeout;
            set.spawn(async move {
                let ok = exec_tool(&tool, tool_timeout).await;
                (tool, ok)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((tool, true)) => reports.push(tool.report),
                Ok((_, false)) => {}
                Err(e) => error!(error = %e, "analyzer task panicked"),
            }
        }

        info!(
            event = "parallel_scans_completed",
            project,
            tools_run = ?tool_names,
            successful_count = reports.len(),
            total_duration_ms = started.elapsed().as_millis() as u64,
            "parallel scans completed"
        );

        Ok(ScanOutcome {
            workspace_dir,
            reports,
        })
    }

    /// Copy source into the shared workspace and open permissions so the
    /// analyzer containers (foreign uids) can read and write it.
    fn prepare_workspace(
        &self,
        target_path: &Path,
        workspace_dir: &Path,
        project: &str,
        changed_files: &[String],
    ) -> Result<()> {
        std::fs::create_dir_all(&self.scan_dir)?;

        if !changed_files.is_empty() {
            info!(
                event = "source_copy_start",
                mode = "delta",
                file_count = changed_files.len(),
                project,
                "delta scan: copying changed files"
            );
            std::fs::create_dir_all(workspace_dir)?;
            for file in changed_files {
                let safe = sanitize_rel_path(file);
                let src = target_path.join(&safe);
                if !src.exists() {
                    continue;
                }
                let dst = workspace_dir.join(&safe);
                if let Some(parent) = dst.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&src, &dst)
                    .map_err(|e| ScannerError::CopyFailed(format!("{}: {e}", src.display())))?;
            }
        } else {
            info!(
                event = "source_copy_start",
                mode = "full",
                project,
                "full scan: copying source directory"
            );
            copy_dir_recursive(target_path, workspace_dir)
                .map_err(|e| ScannerError::CopyFailed(e.to_string()))?;
        }

        open_permissions(workspace_dir);
        Ok(())
    }

    /// Build the fixed tool set for this scan.
    fn build_tools(
        &self,
        scan_id: &str,
        workspace_dir: &Path,
        target_url: Option<&str>,
        changed_files: &[String],
    ) -> Vec<ToolSpec> {
        let workspace = workspace_dir.display().to_string();
        let mut tools = Vec::new();

        // Polyglot static analyzer: three baseline rule packs, suppression
        // comments disabled so scanned code cannot opt itself out.
        let semgrep_report = self.scan_dir.join(format!("semgrep_{scan_id}.sarif"));
        let mut semgrep = vec![
            "docker".to_string(),
            "exec".to_string(),
            "semgrep".to_string(),
            "semgrep".to_string(),
            "scan".to_string(),
            "--disable-nosem".to_string(),
            "--config=p/default".to_string(),
            "--config=p/owasp-top-ten".to_string(),
            "--config=p/secrets".to_string(),
        ];
        for rule in &self.extra_rules {
            semgrep.push(format!("--config={rule}"));
        }
        semgrep.extend([
            "--sarif".to_string(),
            "--quiet".to_string(),
            "-o".to_string(),
            semgrep_report.display().to_string(),
        ]);
        // Delta rule: scan only changed files that survived the copy; when
        // none exist fall back to the full workspace.
        let targets = semgrep_targets(workspace_dir, changed_files);
        if targets.is_empty() {
            if !changed_files.is_empty() {
                warn!("no valid changed files found in source, falling back to full scan");
            }
            semgrep.push(workspace.clone());
        } else {
            semgrep.extend(targets.iter().map(|p| p.display().to_string()));
        }
        tools.push(ToolSpec {
            name: "semgrep",
            command: semgrep,
            allowed_exit_codes: vec![0],
            report: semgrep_report,
        });

        // Secrets scanner.
        let gitleaks_report = self.scan_dir.join(format!("gitleaks_{scan_id}.json"));
        let mut gitleaks = vec![
            "docker".to_string(),
            "exec".to_string(),
            "gitleaks".to_string(),
            "gitleaks".to_string(),
            "detect".to_string(),
            format!("--source={workspace}"),
            format!("--report-path={}", gitleaks_report.display()),
            "--redact".to_string(),
            "--no-banner".to_string(),
            "--exit-code=0".to_string(),
        ];
        if !changed_files.is_empty() {
            // Delta workspaces have no .git directory.
            gitleaks.push("--no-git".to_string());
        }
        tools.push(ToolSpec {
            name: "gitleaks",
            command: gitleaks,
            allowed_exit_codes: vec![0],
            report: gitleaks_report,
        });

        // Filesystem vulnerability/secret/config scanner.
        let trivy_report = self.scan_dir.join(format!("trivy_{scan_id}.sarif"));
        tools.push(ToolSpec {
            name: "trivy",
            command: vec![
                "docker".to_string(),
                "exec".to_string(),
                "trivy".to_string(),
                "trivy".to_string(),
                "fs".to_string(),
                "--format".to_string(),
                "sarif".to_string(),
                "--output".to_string(),
                trivy_report.display().to_string(),
                "--scanners".to_string(),
                "vuln,secret,config".to_string(),
                workspace.clone(),
            ],
            allowed_exit_codes: vec![0],
            report: trivy_report,
        });

        // DAST baseline scan, only when a live target exists. Exit 1/2 mean
        // fail/warn-level alerts; 3 is a system error.
        if let Some(url) = target_url {
            let zap_report = self.scan_dir.join(format!("zap_{scan_id}.json"));
            let script = format!(
                "touch /home/zap/zap_report.json; \
                 zap-baseline.py -p 8080 -t {url} -J zap_report.json -m 5; \
                 if [ -s /home/zap/zap_report.json ]; then \
                 cp /home/zap/zap_report.json /zap/wrk/zap_{scan_id}.json; \
                 else echo 'Empty Report'; exit 1; fi"
            );
            tools.push(ToolSpec {
                name: "zap",
                command: vec![
                    "docker".to_string(),
                    "exec".to_string(),
                    "zap".to_string(),
                    "sh".to_string(),
                    "-c".to_string(),
                    script,
                ],
                allowed_exit_codes: vec![0, 1, 2],
                report: zap_report,
            });
        }

        tools
    }
}

/// Absolute paths of changed files that actually exist in the workspace.
pub fn semgrep_targets(workspace_dir: &Path, changed_files: &[String]) -> Vec<PathBuf> {
    changed_files
        .iter()
        .map(|f| workspace_dir.join(sanitize_rel_path(f)))
        .filter(|p| p.exists())
        .collect()
}

/// Strip leading separators so caller-supplied paths cannot escape the
/// source root.
pub fn sanitize_rel_path(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

/// Run one tool and decide success from its exit-code allow-list.
async fn exec_tool(tool: &ToolSpec, tool_timeout: Duration) -> bool {
    let started = Instant::now();
    let preview: String = tool.command.iter().take(5).cloned().collect::<Vec<_>>().join(" ");
    info!(
        event = "tool_exec_start",
        tool = tool.name,
        command_preview = %preview,
        "starting analyzer"
    );

    let mut cmd = Command::new(&tool.command[0]);
    cmd.args(&tool.command[1..]);

    let output = match timeout(tool_timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            error!(event = "tool_exec_error", tool = tool.name, error = %e, "failed to launch analyzer");
            return false;
        }
        Err(_) => {
            error!(
                event = "tool_exec_failed",
                tool = tool.name,
                timeout_sec = tool_timeout.as_secs(),
                "analyzer timed out"
            );
            return false;
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let duration_ms = started.elapsed().as_millis() as u64;

    if !tool.allowed_exit_codes.contains(&exit_code) {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr_preview: String = stderr.chars().take(200).collect();
        error!(
            event = "tool_exec_failed",
            tool = tool.name,
            exit_code,
            stderr_preview = %stderr_preview,
            duration_ms,
            "analyzer exited outside allow-list"
        );
        return false;
    }

    info!(
        event = "tool_exec_completed",
        tool = tool.name,
        exit_code,
        duration_ms,
        "analyzer completed"
    );
    true
}

/// Recursively copy a directory tree.
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Make the workspace world-readable/writable for the analyzer containers.
/// Best-effort: a failure here surfaces later as a tool failure.
fn open_permissions(dir: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut stack = vec![dir.to_path_buf()];
        while let Some(path) = stack.pop() {
            if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777))
            {
                warn!(path = %path.display(), error = %e, "failed to open permissions");
                continue;
            }
            if path.is_dir() {
                if let Ok(entries) = std::fs::read_dir(&path) {
                    stack.extend(entries.flatten().map(|e| e.path()));
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}
