//! SQLite storage for the scan orchestration daemon.
//!
//! Owns the schema and all transactional updates for scans, findings,
//! pipeline metrics, human feedback, and exploit-prediction scores. Every
//! finding mutation in the pipeline goes through this module.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, QueryBuilder, Sqlite};
use std::path::Path;
use thiserror::Error;
use vigil_core::{EpssRecord, Feedback, Finding, NewScan, NormalizedFinding, PipelineMetric, Scan,
    ScanStatus};

/// Explicit column list for scans table queries.
/// Using explicit columns instead of SELECT * keeps row mapping correct
/// regardless of column order after ALTER TABLE migrations.
const SCANS_COLUMNS: &str = "id, reference_id, project_name, commit_sha, source_platform, \
    ci_provider, branch, repo_url, source_url, ci_job_url, target_url, status, created_at";

const FINDINGS_COLUMNS: &str = "id, scan_id, tool, rule_id, file, line, dast_endpoint, message, \
    snippet, ai_verdict, ai_confidence, ai_reasoning, risk_score, severity, triage_decision, \
    remediation_patch, red_team_success, red_team_output, sandbox_logs, pr_url, pr_error, \
    regression_test_passed, compliance_control, created_at, resolved_at";

/// Finding columns that `update_finding` may touch. `sandbox_logs` is
/// excluded: it is append-only via [`Storage::append_sandbox_log`]. Unknown
/// keys in an update map are silently dropped.
const FINDING_UPDATE_COLUMNS: &[&str] = &[
    "tool",
    "rule_id",
    "file",
    "line",
    "dast_endpoint",
    "message",
    "snippet",
    "ai_verdict",
    "ai_confidence",
    "ai_reasoning",
    "risk_score",
    "severity",
    "triage_decision",
    "remediation_patch",
    "red_team_success",
    "red_team_output",
    "pr_url",
    "pr_error",
    "regression_test_passed",
    "compliance_control",
    "resolved_at",
];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("scan not found: {0}")]
    ScanNotFound(i64),
    #[error("finding not found: {0}")]
    FindingNotFound(i64),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        // Enable WAL mode
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations (schema compiled into the binary).
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            // Remove comment lines before splitting into statements.
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    match sqlx::query(trimmed).execute(&self.pool).await {
                        Ok(_) => {}
                        Err(e) => {
                            let msg = e.to_string();
                            // Ignore expected idempotent errors.
                            if !msg.contains("duplicate column") && !msg.contains("already exists")
                            {
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Access the underlying pool (shared with the job queue).
    pub fn pool(&self) -> Pool<Sqlite> {
        self.pool.clone()
    }

    // --- Scan operations ---

    /// Create a scan row with status `scanning`; returns the assigned id.
    pub async fn create_scan(&self, scan: &NewScan) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO scans (reference_id, project_name, commit_sha, source_platform,
                               ci_provider, branch, repo_url, source_url, ci_job_url,
                               status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&scan.reference_id)
        .bind(&scan.project_name)
        .bind(&scan.commit_sha)
        .bind(&scan.source_platform)
        .bind(&scan.ci_provider)
        .bind(&scan.branch)
        .bind(&scan.repo_url)
        .bind(&scan.source_url)
        .bind(&scan.ci_job_url)
        .bind(ScanStatus::Scanning.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Get a scan by id.
    pub async fn get_scan(&self, id: i64) -> Result<Scan> {
        let query = format!("SELECT {SCANS_COLUMNS} FROM scans WHERE id = ?1");
        let row = sqlx::query_as::<_, ScanRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::ScanNotFound(id))?;
        Ok(row.into_scan())
    }

    /// Get a scan by its external reference id.
    pub async fn get_scan_by_reference(&self, reference_id: &str) -> Result<Option<Scan>> {
        let query = format!(
            "SELECT {SCANS_COLUMNS} FROM scans WHERE reference_id = ?1 ORDER BY id DESC"
        );
        let row = sqlx::query_as::<_, ScanRow>(&query)
            .bind(reference_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ScanRow::into_scan))
    }

    /// List scans for a project, newest first.
    pub async fn list_scans(&self, project_name: Option<&str>) -> Result<Vec<Scan>> {
        let rows = match project_name {
            Some(project) => {
                let query = format!(
                    "SELECT {SCANS_COLUMNS} FROM scans WHERE project_name = ?1 ORDER BY id DESC"
                );
                sqlx::query_as::<_, ScanRow>(&query)
                    .bind(project)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!("SELECT {SCANS_COLUMNS} FROM scans ORDER BY id DESC");
                sqlx::query_as::<_, ScanRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(ScanRow::into_scan).collect())
    }

    /// Update scan lifecycle status.
    ///
    /// Idempotent, and `completed`/`failed` are absorbing: once terminal,
    /// further transitions are ignored rather than rejected.
    pub async fn update_scan_status(&self, id: i64, status: ScanStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE scans SET status = ?1 \
             WHERE id = ?2 AND (status NOT IN ('completed', 'failed') OR status = ?1)",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either the scan is missing or it is already terminal.
            let current = self.get_scan(id).await?;
            tracing::warn!(
                scan_id = id,
                current = current.status.as_str(),
                requested = status.as_str(),
                "ignoring status transition out of terminal state"
            );
        }
        Ok(())
    }

    /// Record the ephemeral DAST target URL on the scan row.
    pub async fn update_scan_target_url(&self, id: i64, target_url: &str) -> Result<()> {
        let result = sqlx::query("UPDATE scans SET target_url = ?1 WHERE id = ?2")
            .bind(target_url)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ScanNotFound(id));
        }
        Ok(())
    }

    /// Delete all scans (with findings, feedback, and metrics) for a project.
    /// Cascades and commits atomically.
    pub async fn delete_project(&self, project_name: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM feedbacks WHERE finding_id IN \
             (SELECT f.id FROM findings f JOIN scans s ON f.scan_id = s.id \
              WHERE s.project_name = ?1)",
        )
        .bind(project_name)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM findings WHERE scan_id IN \
             (SELECT id FROM scans WHERE project_name = ?1)",
        )
        .bind(project_name)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM pipeline_metrics WHERE scan_id IN \
             (SELECT id FROM scans WHERE project_name = ?1)",
        )
        .bind(project_name)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM scans WHERE project_name = ?1")
            .bind(project_name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected())
    }

    // --- Finding operations ---

    /// Insert normalized findings for a scan, returning their assigned ids
    /// in input order. Used to pre-stamp ids before the workflow engine runs.
    pub async fn insert_findings(
        &self,
        scan_id: i64,
        findings: &[NormalizedFinding],
    ) -> Result<Vec<i64>> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(findings.len());

        for finding in findings {
            let result = sqlx::query(
                r#"
                INSERT INTO findings (scan_id, tool, rule_id, file, line, dast_endpoint,
                                      message, snippet, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(scan_id)
            .bind(&finding.tool)
            .bind(&finding.rule_id)
            .bind(&finding.file)
            .bind(finding.line)
            .bind(&finding.dast_endpoint)
            .bind(&finding.message)
            .bind(&finding.snippet)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid());
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Get a finding by id.
    pub async fn get_finding(&self, id: i64) -> Result<Finding> {
        let query = format!("SELECT {FINDINGS_COLUMNS} FROM findings WHERE id = ?1");
        let row = sqlx::query_as::<_, FindingRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::FindingNotFound(id))?;
        Ok(row.into_finding())
    }

    /// List findings for a scan in insertion order.
    pub async fn list_findings(&self, scan_id: i64) -> Result<Vec<Finding>> {
        let query =
            format!("SELECT {FINDINGS_COLUMNS} FROM findings WHERE scan_id = ?1 ORDER BY id ASC");
        let rows = sqlx::query_as::<_, FindingRow>(&query)
            .bind(scan_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(FindingRow::into_finding).collect())
    }

    /// Update finding columns from a JSON field map.
    ///
    /// Only columns in the finding schema are applied; unknown keys are
    /// silently dropped. This is the seam through which the workflow engine
    /// writes its per-stage results.
    pub async fn update_finding(
        &self,
        id: i64,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE findings SET ");
        let mut wrote_any = false;

        for (key, value) in fields {
            if !FINDING_UPDATE_COLUMNS.contains(&key.as_str()) {
                continue;
            }
            if wrote_any {
                builder.push(", ");
            }
            wrote_any = true;
            // `key` is allowlisted above, so pushing it raw is safe.
            builder.push(key.as_str());
            builder.push(" = ");
            match value {
                serde_json::Value::Null => {
                    builder.push_bind(Option::<String>::None);
                }
                serde_json::Value::Bool(b) => {
                    builder.push_bind(i64::from(*b));
                }
                serde_json::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        builder.push_bind(i);
                    } else {
                        builder.push_bind(n.as_f64().unwrap_or(0.0));
                    }
                }
                serde_json::Value::String(s) => {
                    builder.push_bind(s.clone());
                }
                other => {
                    builder.push_bind(other.to_string());
                }
            }
        }

        if !wrote_any {
            return Ok(());
        }

        builder.push(" WHERE id = ");
        builder.push_bind(id);

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::FindingNotFound(id));
        }
        Ok(())
    }

    /// Append a delimited entry to a finding's sandbox execution log.
    pub async fn append_sandbox_log(
        &self,
        id: i64,
        stage: &str,
        success: bool,
        text: &str,
    ) -> Result<()> {
        let entry = format!("\n--- {stage} (SUCCESS: {success}) ---\n{text}\n");
        let result = sqlx::query(
            "UPDATE findings SET sandbox_logs = COALESCE(sandbox_logs, '') || ?1 WHERE id = ?2",
        )
        .bind(entry)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::FindingNotFound(id));
        }
        Ok(())
    }

    // --- Feedback operations ---

    /// Record a human review of an AI decision. Append-only.
    pub async fn insert_feedback(
        &self,
        finding_id: i64,
        user_verdict: &str,
        comments: &str,
    ) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO feedbacks (finding_id, user_verdict, comments, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(finding_id)
        .bind(user_verdict)
        .bind(comments)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// List feedback for a finding, oldest first.
    pub async fn list_feedback(&self, finding_id: i64) -> Result<Vec<Feedback>> {
        let rows = sqlx::query_as::<_, FeedbackRow>(
            "SELECT id, finding_id, user_verdict, comments, created_at \
             FROM feedbacks WHERE finding_id = ?1 ORDER BY id ASC",
        )
        .bind(finding_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedbackRow::into_feedback).collect())
    }

    // --- Pipeline metric operations ---

    /// Insert or replace the single metrics record for a scan.
    pub async fn upsert_pipeline_metric(
        &self,
        scan_id: i64,
        metric: &PipelineMetric,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO pipeline_metrics (scan_id, build_duration_seconds, artifact_size_bytes,
                                          num_changed_files, test_coverage_percent, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(scan_id) DO UPDATE SET
                build_duration_seconds = excluded.build_duration_seconds,
                artifact_size_bytes = excluded.artifact_size_bytes,
                num_changed_files = excluded.num_changed_files,
                test_coverage_percent = excluded.test_coverage_percent
            "#,
        )
        .bind(scan_id)
        .bind(metric.build_duration_seconds)
        .bind(metric.artifact_size_bytes)
        .bind(metric.num_changed_files)
        .bind(metric.test_coverage_percent)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- EPSS operations ---

    /// Insert or refresh an exploit-prediction score for a CVE.
    pub async fn upsert_epss(&self, record: &EpssRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO epss_data (cve_id, probability, percentile, last_updated)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(cve_id) DO UPDATE SET
                probability = excluded.probability,
                percentile = excluded.percentile,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&record.cve_id)
        .bind(record.probability)
        .bind(record.percentile)
        .bind(record.last_updated.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get the exploit-prediction score for a CVE, if known.
    pub async fn get_epss(&self, cve_id: &str) -> Result<Option<EpssRecord>> {
        let row = sqlx::query_as::<_, EpssRow>(
            "SELECT cve_id, probability, percentile, last_updated FROM epss_data \
             WHERE cve_id = ?1",
        )
        .bind(cve_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(EpssRow::into_record))
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct ScanRow {
    id: i64,
    reference_id: Option<String>,
    project_name: String,
    commit_sha: String,
    source_platform: String,
    ci_provider: String,
    branch: String,
    repo_url: String,
    source_url: Option<String>,
    ci_job_url: Option<String>,
    target_url: Option<String>,
    status: String,
    created_at: i64,
}

impl ScanRow {
    fn into_scan(self) -> Scan {
        Scan {
            id: self.id,
            reference_id: self.reference_id,
            project_name: self.project_name,
            commit_sha: self.commit_sha,
            source_platform: self.source_platform,
            ci_provider: self.ci_provider,
            branch: self.branch,
            repo_url: self.repo_url,
            source_url: self.source_url,
            ci_job_url: self.ci_job_url,
            target_url: self.target_url,
            status: ScanStatus::parse(&self.status).unwrap_or(ScanStatus::Failed),
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct FindingRow {
    id: i64,
    scan_id: i64,
    tool: String,
    rule_id: Option<String>,
    file: String,
    line: i64,
    dast_endpoint: Option<String>,
    message: String,
    snippet: String,
    ai_verdict: Option<String>,
    ai_confidence: f64,
    ai_reasoning: Option<String>,
    risk_score: Option<f64>,
    severity: Option<String>,
    triage_decision: Option<String>,
    remediation_patch: Option<String>,
    red_team_success: i64,
    red_team_output: Option<String>,
    sandbox_logs: Option<String>,
    pr_url: Option<String>,
    pr_error: Option<String>,
    regression_test_passed: Option<i64>,
    compliance_control: Option<String>,
    created_at: i64,
    resolved_at: Option<i64>,
}

impl FindingRow {
    fn into_finding(self) -> Finding {
        Finding {
            id: self.id,
            scan_id: self.scan_id,
            tool: self.tool,
            rule_id: self.rule_id,
            file: self.file,
            line: self.line,
            dast_endpoint: self.dast_endpoint,
            message: self.message,
            snippet: self.snippet,
            ai_verdict: self.ai_verdict,
            ai_confidence: self.ai_confidence,
            ai_reasoning: self.ai_reasoning,
            risk_score: self.risk_score,
            severity: self.severity,
            triage_decision: self.triage_decision,
            remediation_patch: self.remediation_patch,
            red_team_success: self.red_team_success != 0,
            red_team_output: self.red_team_output,
            sandbox_logs: self.sandbox_logs,
            pr_url: self.pr_url,
            pr_error: self.pr_error,
            regression_test_passed: self.regression_test_passed.map(|v| v != 0),
            compliance_control: self.compliance_control,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            resolved_at: self.resolved_at.and_then(DateTime::from_timestamp_millis),
        }
    }
}

#[derive(sqlx::FromRow)]
struct FeedbackRow {
    id: i64,
    finding_id: i64,
    user_verdict: String,
    comments: String,
    created_at: i64,
}

impl FeedbackRow {
    fn into_feedback(self) -> Feedback {
        Feedback {
            id: self.id,
            finding_id: self.finding_id,
            user_verdict: self.user_verdict,
            comments: self.comments,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EpssRow {
    cve_id: String,
    probability: f64,
    percentile: f64,
    last_updated: i64,
}

impl EpssRow {
    fn into_record(self) -> EpssRecord {
        EpssRecord {
            cve_id: self.cve_id,
            probability: self.probability,
            percentile: self.percentile,
            last_updated: DateTime::from_timestamp_millis(self.last_updated).unwrap_or_default(),
        }
    }
}
