//! Core types for the scan orchestration pipeline.
//!
//! The data model couples a Scan (one end-to-end run over a repository at a
//! given commit) to its Findings (individual analyzer-reported issues) and
//! auxiliary records (pipeline metrics, human feedback, exploit scores).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for queued jobs.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Short hex identifier for workspaces and branch names (first 8 chars of a
/// random UUID, matching the `/tmp/scans/<id>_src` layout).
pub fn short_uid() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

// --- Enumerations ---

/// Scan lifecycle status. `Completed` and `Failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Scanning,
    Analyzing,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scanning => "scanning",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "scanning" => Some(Self::Scanning),
            "analyzing" => Some(Self::Analyzing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether this status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// AI triage verdict for a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Tp,
    Fp,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tp => "TP",
            Self::Fp => "FP",
        }
    }

    pub fn is_true_positive(&self) -> bool {
        matches!(self, Self::Tp)
    }
}

/// Categorical severity assigned by AI analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "Critical",
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
        }
    }
}

/// Job queue task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ExecuteScanJob,
    ExecuteTriageJob,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecuteScanJob => "execute_scan_job",
            Self::ExecuteTriageJob => "execute_triage_job",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execute_scan_job" => Some(Self::ExecuteScanJob),
            "execute_triage_job" => Some(Self::ExecuteTriageJob),
            _ => None,
        }
    }
}

// --- Queue payloads ---

/// Caller-supplied scan configuration carried on `execute_scan_job`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanMetadata {
    pub ci_provider: Option<String>,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub repo_url: Option<String>,
    /// Link to the CI run that triggered the scan.
    pub run_url: Option<String>,
    /// Pre-deployed DAST target; when absent the coordinator may deploy one.
    pub target_url: Option<String>,
    /// Restrict the scan to these paths (delta scan).
    pub changed_files: Vec<String>,
    /// Opaque UUID handed back to async callers for status polling.
    pub reference_id: Option<String>,
}

/// Payload for a full scan-to-triage pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub project: String,
    pub path: String,
    #[serde(default)]
    pub metadata: ScanMetadata,
}

/// Payload for a triage-only run over already-normalized findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageJob {
    pub scan_id: i64,
    pub project: String,
    pub sha: String,
    pub findings: Vec<NormalizedFinding>,
    pub token: String,
    #[serde(default)]
    pub local_source_path: Option<String>,
}

/// A queue message: one of the two task kinds, tagged by task name so the
/// wire format stays `{"task": "execute_scan_job", ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum JobPayload {
    ExecuteScanJob(ScanJob),
    ExecuteTriageJob(TriageJob),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::ExecuteScanJob(_) => JobKind::ExecuteScanJob,
            Self::ExecuteTriageJob(_) => JobKind::ExecuteTriageJob,
        }
    }
}

// --- Normalized findings ---

/// A finding as emitted by the report normalizer, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedFinding {
    pub tool: String,
    pub rule_id: Option<String>,
    pub message: String,
    /// Path relative to the repository root (cleaned).
    pub file: String,
    /// 1-based line number; 0 for DAST findings.
    pub line: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dast_endpoint: Option<String>,
    /// Source context extracted by snippet population; empty until then.
    #[serde(default)]
    pub snippet: String,
}

// --- Persisted records ---

/// A single security scan execution on a project commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    pub id: i64,
    /// Opaque UUID used by async callers to poll status.
    pub reference_id: Option<String>,
    /// Full project name, e.g. `owner/repo`.
    pub project_name: String,
    pub commit_sha: String,
    pub source_platform: String,
    pub ci_provider: String,
    pub branch: String,
    pub repo_url: String,
    pub source_url: Option<String>,
    pub ci_job_url: Option<String>,
    /// Ephemeral test environment URL used for DAST.
    pub target_url: Option<String>,
    pub status: ScanStatus,
    pub created_at: DateTime<Utc>,
}

/// Metadata used to create a new scan row.
#[derive(Debug, Clone)]
pub struct NewScan {
    pub project_name: String,
    pub commit_sha: String,
    pub source_platform: String,
    pub ci_provider: String,
    pub branch: String,
    pub repo_url: String,
    pub source_url: Option<String>,
    pub ci_job_url: Option<String>,
    pub reference_id: Option<String>,
}

/// A persisted finding: analyzer facts plus AI verdict and workflow outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: i64,
    pub scan_id: i64,
    pub tool: String,
    pub rule_id: Option<String>,
    pub file: String,
    pub line: i64,
    pub dast_endpoint: Option<String>,
    pub message: String,
    pub snippet: String,
    pub ai_verdict: Option<String>,
    pub ai_confidence: f64,
    pub ai_reasoning: Option<String>,
    pub risk_score: Option<f64>,
    pub severity: Option<String>,
    pub triage_decision: Option<String>,
    pub remediation_patch: Option<String>,
    pub red_team_success: bool,
    pub red_team_output: Option<String>,
    /// Append-only execution log from the verification sandbox.
    pub sandbox_logs: Option<String>,
    pub pr_url: Option<String>,
    pub pr_error: Option<String>,
    pub regression_test_passed: Option<bool>,
    pub compliance_control: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Human review of an AI decision, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub id: i64,
    pub finding_id: i64,
    pub user_verdict: String,
    pub comments: String,
    pub created_at: DateTime<Utc>,
}

/// Scalar CI metrics attached to a scan (at most one record per scan).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineMetric {
    pub build_duration_seconds: f64,
    pub artifact_size_bytes: i64,
    pub num_changed_files: i64,
    pub test_coverage_percent: f64,
}

/// Exploit Prediction Scoring System record for a CVE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpssRecord {
    pub cve_id: String,
    pub probability: f64,
    pub percentile: f64,
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_generates_unique_values() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn short_uid_is_eight_hex_chars() {
        let uid = short_uid();
        assert_eq!(uid.len(), 8);
        assert!(uid.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn scan_status_round_trips() {
        for status in [
            ScanStatus::Pending,
            ScanStatus::Scanning,
            ScanStatus::Analyzing,
            ScanStatus::Completed,
            ScanStatus::Failed,
        ] {
            assert_eq!(ScanStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ScanStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(ScanStatus::Completed.is_terminal());
        assert!(ScanStatus::Failed.is_terminal());
        assert!(!ScanStatus::Scanning.is_terminal());
        assert!(!ScanStatus::Analyzing.is_terminal());
    }

    #[test]
    fn verdict_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Verdict::Tp).unwrap(), "\"TP\"");
        assert_eq!(serde_json::to_string(&Verdict::Fp).unwrap(), "\"FP\"");
    }

    #[test]
    fn severity_labels_are_capitalized() {
        assert_eq!(Severity::Critical.as_str(), "Critical");
        assert_eq!(Severity::Low.as_str(), "Low");
        assert_eq!(
            serde_json::to_string(&Severity::High).unwrap(),
            "\"High\""
        );
    }

    #[test]
    fn job_kind_round_trips() {
        for kind in [JobKind::ExecuteScanJob, JobKind::ExecuteTriageJob] {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("unknown_task"), None);
    }

    #[test]
    fn job_payload_wire_format_carries_task_tag() {
        let payload = JobPayload::ExecuteScanJob(ScanJob {
            project: "acme/webapp".to_string(),
            path: "/srv/src".to_string(),
            metadata: ScanMetadata::default(),
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["task"], "execute_scan_job");
        assert_eq!(json["project"], "acme/webapp");

        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), JobKind::ExecuteScanJob);
    }

    #[test]
    fn triage_job_deserializes_without_optional_fields() {
        let json = r#"{
            "task": "execute_triage_job",
            "scan_id": 7,
            "project": "acme/webapp",
            "sha": "abc123",
            "findings": [],
            "token": "no-token"
        }"#;
        let payload: JobPayload = serde_json::from_str(json).unwrap();
        match payload {
            JobPayload::ExecuteTriageJob(job) => {
                assert_eq!(job.scan_id, 7);
                assert!(job.local_source_path.is_none());
            }
            JobPayload::ExecuteScanJob(_) => panic!("wrong variant"),
        }
    }

    #[test]
    fn scan_metadata_defaults_are_empty() {
        let meta: ScanMetadata = serde_json::from_str("{}").unwrap();
        assert!(meta.changed_files.is_empty());
        assert!(meta.repo_url.is_none());
    }
}
