//! Per-finding triage workflow.
//!
//! A state machine over TRIAGE -> RED_TEAM -> REMEDIATE -> SANITY ->
//! PUBLISH. Transitions are pure functions over (stage, finding state);
//! the driver loop performs the side effects — model calls, sandbox
//! executions, store writes, PR publication — through trait seams so the
//! whole machine is testable with stubs. Findings are processed strictly
//! sequentially: the model endpoint is single-tenant in this deployment and
//! progress reporting stays deterministic.
//!
//! Database errors inside a step are logged and swallowed; a finding simply
//! carries whatever it had. A publish failure is recorded on the finding
//! and never aborts the remaining findings.

use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vigil_core::prompt::{
    red_team_prompt, remediation_prompt, strip_code_fences, triage_prompt,
};
use vigil_core::types::short_uid;
use vigil_core::{NormalizedFinding, Verdict};

use crate::llm::ModelClient;
use crate::progress::ProgressPublisher;
use crate::publisher::{PrRequest, PullRequestOpener};
use crate::sandbox::SandboxClient;
use crate::storage::Storage;

/// Tokens whose disappearance from a patch marks it as unsafe: a fix that
/// drops every reference to the security machinery it touches has probably
/// deleted it.
pub const CRITICAL_MODULES: &[&str] = &["auth", "jwt", "session", "encrypt"];

/// Snippets longer than this with patches shorter than
/// [`WIPE_PATCH_LINES`] trip the mass-deletion heuristic.
const WIPE_SNIPPET_LINES: usize = 10;
const WIPE_PATCH_LINES: usize = 2;

/// Workflow stages for one finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Triage,
    RedTeam,
    Remediate,
    Sanity,
    Publish,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triage => "triage",
            Self::RedTeam => "red_team",
            Self::Remediate => "remediate",
            Self::Sanity => "sanity",
            Self::Publish => "publish",
        }
    }
}

/// Mutable state accumulated for one finding as it moves through stages.
#[derive(Debug)]
pub struct FindingState {
    pub id: i64,
    pub finding: NormalizedFinding,
    pub verdict: Option<Verdict>,
    pub patch: Option<String>,
    pub pr_url: Option<String>,
}

impl FindingState {
    pub fn new(id: i64, finding: NormalizedFinding) -> Self {
        Self {
            id,
            finding,
            verdict: None,
            patch: None,
            pr_url: None,
        }
    }
}

/// Pure transition function. A false-positive verdict routes straight to
/// the next finding; true positives run the full chain.
pub fn next_stage(stage: Stage, state: &FindingState) -> Option<Stage> {
    match stage {
        Stage::Triage => match state.verdict {
            Some(Verdict::Tp) => Some(Stage::RedTeam),
            _ => None,
        },
        Stage::RedTeam => Some(Stage::Remediate),
        Stage::Remediate => Some(Stage::Sanity),
        Stage::Sanity => Some(Stage::Publish),
        Stage::Publish => None,
    }
}

/// Why a patch failed the sanity gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanityRejection {
    EmptyPatch,
    MassDeletion,
    CriticalModuleDeletion,
}

impl SanityRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyPatch => "empty_patch",
            Self::MassDeletion => "mass_deletion",
            Self::CriticalModuleDeletion => "critical_module_deletion",
        }
    }
}

/// Heuristic gate on a generated patch. Pure; the driver applies the
/// verdict.
pub fn sanity_check(snippet: &str, patch: &str) -> Result<(), SanityRejection> {
    if patch.trim().is_empty() {
        return Err(SanityRejection::EmptyPatch);
    }
    if snippet.lines().count() > WIPE_SNIPPET_LINES && patch.lines().count() < WIPE_PATCH_LINES {
        return Err(SanityRejection::MassDeletion);
    }
    // Unsafe only when the snippet referenced critical machinery and the
    // patch kept none of it.
    let referenced: Vec<&&str> = CRITICAL_MODULES
        .iter()
        .filter(|module| snippet.contains(**module))
        .collect();
    if !referenced.is_empty() && referenced.iter().all(|module| !patch.contains(**module)) {
        return Err(SanityRejection::CriticalModuleDeletion);
    }
    Ok(())
}

/// Engine options lifted from the daemon config.
#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    /// Cap on findings processed per scan.
    pub triage_limit: usize,
    /// Gate patch acceptance on sandbox verification (extension point,
    /// default off).
    pub sandbox_verify_patches: bool,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            triage_limit: 20,
            sandbox_verify_patches: false,
        }
    }
}

impl WorkflowOptions {
    pub fn from_config(config: &vigil_core::Config) -> Self {
        Self {
            triage_limit: config.triage_limit,
            sandbox_verify_patches: config.sandbox_verify_patches,
        }
    }
}

/// Aggregate result of one workflow run.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkflowSummary {
    pub processed: usize,
    pub true_positives: usize,
    pub patches_accepted: usize,
    pub prs_opened: usize,
}

/// The workflow engine. Generic over its collaborators so tests can stub
/// the model, the sandbox, and the publisher.
pub struct WorkflowEngine<M, S, P> {
    storage: Arc<Storage>,
    model: M,
    sandbox: S,
    publisher: P,
    options: WorkflowOptions,
}

impl<M, S, P> std::fmt::Debug for WorkflowEngine<M, S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<M, S, P> WorkflowEngine<M, S, P>
where
    M: ModelClient,
    S: SandboxClient,
    P: PullRequestOpener,
{
    pub fn new(
        storage: Arc<Storage>,
        model: M,
        sandbox: S,
        publisher: P,
        options: WorkflowOptions,
    ) -> Self {
        Self {
            storage,
            model,
            sandbox,
            publisher,
            options,
        }
    }

    /// Run the workflow over pre-stamped findings, sequentially, bounded by
    /// the triage cap.
    pub async fn run(
        &self,
        project: &str,
        source_path: &Path,
        findings: Vec<(i64, NormalizedFinding)>,
        cancel: &CancellationToken,
        progress: &ProgressPublisher,
    ) -> WorkflowSummary {
        let mut summary = WorkflowSummary::default();
        let capped: Vec<_> = findings.into_iter().take(self.options.triage_limit).collect();
        let total = capped.len();

        for (index, (id, finding)) in capped.into_iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(finding_id = id, "workflow cancelled, skipping remaining findings");
                break;
            }

            progress.update_step(
                (index + 1) as u32,
                total as u32,
                &format!("Analyzing finding {}/{}", index + 1, total),
                "running",
            );

            let mut state = FindingState::new(id, finding);
            let mut stage = Some(Stage::Triage);
            while let Some(current) = stage {
                info!(finding_id = id, stage = current.as_str(), file = %state.finding.file, "workflow stage");
                match current {
                    Stage::Triage => self.triage(&mut state).await,
                    Stage::RedTeam => self.red_team(&mut state, source_path).await,
                    Stage::Remediate => self.remediate(&mut state, source_path).await,
                    Stage::Sanity => self.sanity(&mut state).await,
                    Stage::Publish => self.publish(&mut state, project, source_path, cancel).await,
                }
                stage = next_stage(current, &state);
            }

            summary.processed += 1;
            if state.verdict == Some(Verdict::Tp) {
                summary.true_positives += 1;
            }
            if state.patch.is_some() {
                summary.patches_accepted += 1;
            }
            if state.pr_url.is_some() {
                summary.prs_opened += 1;
            }
        }

        summary
    }

    /// TRIAGE: classify the finding as TP or FP. Model errors default to FP.
    async fn triage(&self, state: &mut FindingState) {
        let verdict = match self.model.complete(&triage_prompt(&state.finding)).await {
            Ok(response) => vigil_core::prompt::parse_verdict(&response),
            Err(e) => {
                warn!(finding_id = state.id, error = %e, "triage model call failed, defaulting to FP");
                Verdict::Fp
            }
        };

        info!(finding_id = state.id, file = %state.finding.file, verdict = verdict.as_str(), "triage verdict");
        state.verdict = Some(verdict);

        let decision = if verdict.is_true_positive() { "RV" } else { "FP" };
        self.record(
            state.id,
            json!({
                "ai_verdict": verdict.as_str(),
                "triage_decision": decision,
            }),
        )
        .await;
    }

    /// RED_TEAM: best-effort exploit PoC. Failures are logged and the
    /// workflow proceeds.
    async fn red_team(&self, state: &mut FindingState, source_path: &Path) {
        let poc = match self.model.complete(&red_team_prompt(&state.finding)).await {
            Ok(response) => response,
            Err(e) => {
                warn!(finding_id = state.id, error = %e, "red team PoC generation failed");
                self.record(state.id, json!({"red_team_success": false})).await;
                return;
            }
        };

        let source = source_path.to_string_lossy();
        match self.sandbox.verify_poc(&source, &poc, "py").await {
            Ok(outcome) => {
                self.log_sandbox(state.id, "RED_TEAM_POC", outcome.success, &outcome.output)
                    .await;
                self.record(
                    state.id,
                    json!({
                        "red_team_success": outcome.success,
                        "red_team_output": outcome.output,
                    }),
                )
                .await;
            }
            Err(e) => {
                warn!(finding_id = state.id, error = %e, "sandbox PoC verification failed");
                self.record(state.id, json!({"red_team_success": false})).await;
            }
        }
    }

    /// REMEDIATE: generate a corrected code block. Sandbox verification is
    /// an extension point, gated by configuration.
    async fn remediate(&self, state: &mut FindingState, source_path: &Path) {
        let response = match self.model.complete(&remediation_prompt(&state.finding)).await {
            Ok(response) => response,
            Err(e) => {
                warn!(finding_id = state.id, error = %e, "remediation generation failed");
                return;
            }
        };

        let mut patch = Some(strip_code_fences(&response));

        if self.options.sandbox_verify_patches {
            let source = source_path.to_string_lossy();
            let candidate = patch.clone().unwrap_or_default();
            match self
                .sandbox
                .verify_patch(&source, &candidate, &state.finding.file)
                .await
            {
                Ok(outcome) => {
                    self.log_sandbox(state.id, "PATCH_VERIFICATION", outcome.success, &outcome.output)
                        .await;
                    if !outcome.success {
                        patch = None;
                    }
                }
                Err(e) => {
                    // Gating is on and the gate is unreachable: reject.
                    warn!(finding_id = state.id, error = %e, "patch verification unavailable");
                    self.log_sandbox(state.id, "PATCH_VERIFICATION", false, &e.to_string())
                        .await;
                    patch = None;
                }
            }
        }

        state.patch = patch;
        self.record(
            state.id,
            json!({"remediation_patch": state.patch.as_deref()}),
        )
        .await;
    }

    /// SANITY: heuristic gate on the patch. Runs whenever a patch exists.
    async fn sanity(&self, state: &mut FindingState) {
        let Some(patch) = state.patch.clone() else {
            return;
        };

        match sanity_check(&state.finding.snippet, &patch) {
            Ok(()) => {
                self.log_sandbox(state.id, "SANITY_CHECK", true, "Patch looks valid.")
                    .await;
            }
            Err(reason) => {
                warn!(finding_id = state.id, reason = reason.as_str(), "sanity check rejected patch");
                state.patch = None;
                self.record(state.id, json!({"remediation_patch": null})).await;
                self.log_sandbox(state.id, "SANITY_CHECK", false, "Blocked: Likely over-deletion.")
                    .await;
            }
        }
    }

    /// PUBLISH: open a PR if a patch survived sanity. Never runs after
    /// cancellation, and never aborts the workflow for remaining findings.
    async fn publish(
        &self,
        state: &mut FindingState,
        project: &str,
        source_path: &Path,
        cancel: &CancellationToken,
    ) {
        let Some(patch) = state.patch.clone() else {
            info!(finding_id = state.id, "skipping PR: no surviving patch");
            return;
        };
        if cancel.is_cancelled() {
            warn!(finding_id = state.id, "skipping PR: scan cancelled");
            return;
        }

        let request = PrRequest {
            repo_name: project.to_string(),
            branch_name: format!("ai-fix-{}", &short_uid()[..6]),
            patch_content: patch,
            file_path: state.finding.file.clone(),
            issue_message: state.finding.message.clone(),
            working_dir: source_path.to_path_buf(),
        };

        match self.publisher.create_security_pr(&request).await {
            Ok(url) => {
                info!(finding_id = state.id, pr_url = %url, "pull request created");
                state.pr_url = Some(url.clone());
                self.record(state.id, json!({"pr_url": url})).await;
            }
            Err(e) => {
                warn!(finding_id = state.id, error = %e, "pull request creation failed");
                self.record(state.id, json!({"pr_error": e.to_string()})).await;
            }
        }
    }

    /// Apply a field-map update; storage failures must not abort the scan.
    async fn record(&self, finding_id: i64, fields: Value) {
        let map: Map<String, Value> = match fields {
            Value::Object(map) => map,
            _ => return,
        };
        if let Err(e) = self.storage.update_finding(finding_id, &map).await {
            warn!(finding_id, error = %e, "finding update dropped");
        }
    }

    /// Append to the sandbox log; storage failures must not abort the scan.
    async fn log_sandbox(&self, finding_id: i64, stage: &str, success: bool, text: &str) {
        if let Err(e) = self
            .storage
            .append_sandbox_log(finding_id, stage, success, text)
            .await
        {
            warn!(finding_id, error = %e, "sandbox log append dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{self, LlmError};
    use crate::publisher::{self, PublishError};
    use crate::sandbox::{self, DeployOutcome, ExecOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use vigil_core::NewScan;

    // --- Stub collaborators ---

    struct StubModel {
        verdict: &'static str,
        patch: &'static str,
        fail: bool,
    }

    impl ModelClient for StubModel {
        async fn complete(&self, prompt: &str) -> llm::Result<String> {
            if self.fail {
                return Err(LlmError::RetriesExhausted);
            }
            if prompt.contains("Respond ONLY with 'TP' or 'FP'") {
                Ok(self.verdict.to_string())
            } else if prompt.contains("PoC") {
                Ok("```python\nprint('poc')\n```".to_string())
            } else {
                Ok(self.patch.to_string())
            }
        }
    }

    #[derive(Default)]
    struct StubSandbox {
        poc_calls: AtomicUsize,
        patch_calls: AtomicUsize,
        patch_success: bool,
    }

    impl SandboxClient for StubSandbox {
        async fn verify_poc(
            &self,
            _source_path: &str,
            _poc_code: &str,
            _file_extension: &str,
        ) -> sandbox::Result<ExecOutcome> {
            self.poc_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecOutcome {
                success: true,
                output: "exploit confirmed".to_string(),
            })
        }

        async fn verify_patch(
            &self,
            _source_path: &str,
            _patch_code: &str,
            _target_file: &str,
        ) -> sandbox::Result<ExecOutcome> {
            self.patch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecOutcome {
                success: self.patch_success,
                output: "verification run".to_string(),
            })
        }

        async fn deploy(
            &self,
            _source_path: &str,
            _port: u16,
            _start_cmd: Option<&str>,
        ) -> sandbox::Result<DeployOutcome> {
            Ok(DeployOutcome {
                success: false,
                url: String::new(),
                container_id: String::new(),
            })
        }

        async fn red_team(
            &self,
            _finding: &NormalizedFinding,
            _project: &str,
            _source_path: &str,
        ) -> sandbox::Result<ExecOutcome> {
            Ok(ExecOutcome {
                success: false,
                output: String::new(),
            })
        }
    }

    #[derive(Default)]
    struct StubPublisher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl PullRequestOpener for StubPublisher {
        async fn create_security_pr(&self, _request: &PrRequest) -> publisher::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(PublishError::MissingToken)
            } else {
                Ok("https://github.com/acme/webapp/pull/7".to_string())
            }
        }
    }

    // --- Fixtures ---

    struct TestEnv {
        storage: Arc<Storage>,
        scan_id: i64,
        dir: TempDir,
    }

    async fn create_env() -> TestEnv {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        let scan_id = storage
            .create_scan(&NewScan {
                project_name: "acme/webapp".to_string(),
                commit_sha: "abc123".to_string(),
                source_platform: "github".to_string(),
                ci_provider: "github-actions".to_string(),
                branch: "main".to_string(),
                repo_url: String::new(),
                source_url: None,
                ci_job_url: None,
                reference_id: None,
            })
            .await
            .unwrap();
        TestEnv {
            storage,
            scan_id,
            dir,
        }
    }

    fn sqli_finding(snippet: &str) -> NormalizedFinding {
        NormalizedFinding {
            tool: "Semgrep".to_string(),
            rule_id: Some("formatted-sql-query".to_string()),
            message: "SQL query built by string interpolation".to_string(),
            file: "app.py".to_string(),
            line: 12,
            dast_endpoint: None,
            snippet: snippet.to_string(),
        }
    }

    async fn stamp(env: &TestEnv, finding: &NormalizedFinding) -> i64 {
        env.storage
            .insert_findings(env.scan_id, std::slice::from_ref(finding))
            .await
            .unwrap()[0]
    }

    fn engine(
        env: &TestEnv,
        model: StubModel,
        sandbox: StubSandbox,
        publisher: StubPublisher,
        options: WorkflowOptions,
    ) -> WorkflowEngine<StubModel, StubSandbox, StubPublisher> {
        WorkflowEngine::new(
            Arc::clone(&env.storage),
            model,
            sandbox,
            publisher,
            options,
        )
    }

    fn progress_for(env: &TestEnv) -> ProgressPublisher {
        ProgressPublisher::new(&env.dir.path().join("progress"), env.scan_id)
    }

    // --- Pure transition tests ---

    #[test]
    fn fp_verdict_ends_the_chain() {
        let mut state = FindingState::new(1, sqli_finding("x"));
        state.verdict = Some(Verdict::Fp);
        assert_eq!(next_stage(Stage::Triage, &state), None);
    }

    #[test]
    fn tp_verdict_runs_full_chain() {
        let mut state = FindingState::new(1, sqli_finding("x"));
        state.verdict = Some(Verdict::Tp);
        assert_eq!(next_stage(Stage::Triage, &state), Some(Stage::RedTeam));
        assert_eq!(next_stage(Stage::RedTeam, &state), Some(Stage::Remediate));
        assert_eq!(next_stage(Stage::Remediate, &state), Some(Stage::Sanity));
        assert_eq!(next_stage(Stage::Sanity, &state), Some(Stage::Publish));
        assert_eq!(next_stage(Stage::Publish, &state), None);
    }

    // --- Sanity check tests ---

    #[test]
    fn sanity_rejects_empty_patch() {
        assert_eq!(
            sanity_check("code", "   \n"),
            Err(SanityRejection::EmptyPatch)
        );
    }

    #[test]
    fn sanity_rejects_mass_deletion() {
        let snippet = "line\n".repeat(11);
        assert_eq!(
            sanity_check(&snippet, "pass"),
            Err(SanityRejection::MassDeletion)
        );
    }

    #[test]
    fn sanity_rejects_critical_module_deletion() {
        let snippet = "import auth\ntoken = jwt.encode(payload)\n";
        assert_eq!(
            sanity_check(snippet, "return None"),
            Err(SanityRejection::CriticalModuleDeletion)
        );
    }

    #[test]
    fn sanity_accepts_patch_keeping_critical_tokens() {
        let snippet = "import auth\ntoken = jwt.encode(payload)\n";
        let patch = "import auth\ntoken = jwt.encode(payload, algorithm='HS256')\n";
        assert_eq!(sanity_check(snippet, patch), Ok(()));
    }

    #[test]
    fn sanity_accepts_normal_patch() {
        assert_eq!(
            sanity_check(
                "query = f\"SELECT * FROM users WHERE u = '{u}'\"",
                "query = \"SELECT * FROM users WHERE u = ?\"",
            ),
            Ok(())
        );
    }

    // --- Driver tests ---

    #[tokio::test]
    async fn happy_path_sqli_opens_pr() {
        let env = create_env().await;
        let finding = sqli_finding("query = f\"SELECT * FROM users WHERE u = '{u}'\"");
        let id = stamp(&env, &finding).await;

        let eng = engine(
            &env,
            StubModel {
                verdict: "TP",
                patch: "```python\nquery = \"SELECT * FROM users WHERE u = ?\"\n```",
                fail: false,
            },
            StubSandbox::default(),
            StubPublisher::default(),
            WorkflowOptions::default(),
        );

        let summary = eng
            .run(
                "acme/webapp",
                env.dir.path(),
                vec![(id, finding)],
                &CancellationToken::new(),
                &progress_for(&env),
            )
            .await;

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.true_positives, 1);
        assert_eq!(summary.prs_opened, 1);

        let stored = env.storage.get_finding(id).await.unwrap();
        assert_eq!(stored.ai_verdict.as_deref(), Some("TP"));
        assert_eq!(stored.triage_decision.as_deref(), Some("RV"));
        assert!(stored.remediation_patch.unwrap().contains('?'));
        assert_eq!(
            stored.pr_url.as_deref(),
            Some("https://github.com/acme/webapp/pull/7")
        );
        assert!(stored.red_team_success);
        let logs = stored.sandbox_logs.unwrap();
        assert!(logs.contains("RED_TEAM_POC"));
        assert!(logs.contains("SANITY_CHECK (SUCCESS: true)"));
        assert!(logs.contains("Patch looks valid."));
    }

    #[tokio::test]
    async fn false_positive_skips_red_team_and_remediation() {
        let env = create_env().await;
        let finding = sqli_finding("cur.execute(\"SELECT 1\")");
        let id = stamp(&env, &finding).await;

        let sandbox_stub = StubSandbox::default();
        let publisher_stub = StubPublisher::default();
        let eng = WorkflowEngine::new(
            Arc::clone(&env.storage),
            StubModel {
                verdict: "FP",
                patch: "unused",
                fail: false,
            },
            sandbox_stub,
            publisher_stub,
            WorkflowOptions::default(),
        );

        let summary = eng
            .run(
                "acme/webapp",
                env.dir.path(),
                vec![(id, finding)],
                &CancellationToken::new(),
                &progress_for(&env),
            )
            .await;

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.true_positives, 0);
        assert_eq!(summary.prs_opened, 0);
        assert_eq!(eng.sandbox.poc_calls.load(Ordering::SeqCst), 0);
        assert_eq!(eng.publisher.calls.load(Ordering::SeqCst), 0);

        let stored = env.storage.get_finding(id).await.unwrap();
        assert_eq!(stored.ai_verdict.as_deref(), Some("FP"));
        assert_eq!(stored.triage_decision.as_deref(), Some("FP"));
        assert!(stored.remediation_patch.is_none());
        assert!(stored.pr_url.is_none());
    }

    #[tokio::test]
    async fn critical_module_wipe_blocks_publication() {
        let env = create_env().await;
        let finding = sqli_finding("import auth\ntoken = jwt.encode(user)\n");
        let id = stamp(&env, &finding).await;

        let eng = engine(
            &env,
            StubModel {
                verdict: "TP",
                patch: "return True",
                fail: false,
            },
            StubSandbox::default(),
            StubPublisher::default(),
            WorkflowOptions::default(),
        );

        let summary = eng
            .run(
                "acme/webapp",
                env.dir.path(),
                vec![(id, finding)],
                &CancellationToken::new(),
                &progress_for(&env),
            )
            .await;

        assert_eq!(summary.prs_opened, 0);
        assert_eq!(summary.patches_accepted, 0);
        assert_eq!(eng.publisher.calls.load(Ordering::SeqCst), 0);

        let stored = env.storage.get_finding(id).await.unwrap();
        assert!(stored.remediation_patch.is_none());
        assert!(stored.pr_url.is_none());
        let logs = stored.sandbox_logs.unwrap();
        assert!(logs.contains("SANITY_CHECK (SUCCESS: false)"));
        assert!(logs.contains("Blocked: Likely over-deletion."));
    }

    #[tokio::test]
    async fn model_error_defaults_to_fp() {
        let env = create_env().await;
        let finding = sqli_finding("anything");
        let id = stamp(&env, &finding).await;

        let eng = engine(
            &env,
            StubModel {
                verdict: "unused",
                patch: "unused",
                fail: true,
            },
            StubSandbox::default(),
            StubPublisher::default(),
            WorkflowOptions::default(),
        );

        eng.run(
            "acme/webapp",
            env.dir.path(),
            vec![(id, finding)],
            &CancellationToken::new(),
            &progress_for(&env),
        )
        .await;

        let stored = env.storage.get_finding(id).await.unwrap();
        assert_eq!(stored.ai_verdict.as_deref(), Some("FP"));
        assert!(stored.pr_url.is_none());
    }

    #[tokio::test]
    async fn publisher_failure_recorded_without_aborting() {
        let env = create_env().await;
        let first = sqli_finding("query = f\"SELECT {u}\"");
        let second = sqli_finding("query = f\"DELETE {u}\"");
        let first_id = stamp(&env, &first).await;
        let second_id = stamp(&env, &second).await;

        let eng = engine(
            &env,
            StubModel {
                verdict: "TP",
                patch: "query = \"SELECT ?\"",
                fail: false,
            },
            StubSandbox::default(),
            StubPublisher {
                calls: AtomicUsize::new(0),
                fail: true,
            },
            WorkflowOptions::default(),
        );

        let summary = eng
            .run(
                "acme/webapp",
                env.dir.path(),
                vec![(first_id, first), (second_id, second)],
                &CancellationToken::new(),
                &progress_for(&env),
            )
            .await;

        // Both findings were attempted despite the first PR failing.
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.prs_opened, 0);
        assert_eq!(eng.publisher.calls.load(Ordering::SeqCst), 2);

        let stored = env.storage.get_finding(first_id).await.unwrap();
        assert!(stored.pr_url.is_none());
        assert!(stored.pr_error.is_some());
        // Invariant: no pr_url without a patch — and here patch exists
        // while pr_url is absent, which is allowed.
        assert!(stored.remediation_patch.is_some());
    }

    #[tokio::test]
    async fn cancellation_prevents_pr_push() {
        let env = create_env().await;
        let finding = sqli_finding("query = f\"SELECT {u}\"");
        let id = stamp(&env, &finding).await;

        let eng = engine(
            &env,
            StubModel {
                verdict: "TP",
                patch: "query = \"SELECT ?\"",
                fail: false,
            },
            StubSandbox::default(),
            StubPublisher::default(),
            WorkflowOptions::default(),
        );

        let cancel = CancellationToken::new();
        let storage = Arc::clone(&env.storage);
        let progress = progress_for(&env);

        // Cancel before the run; nothing may reach the publisher.
        cancel.cancel();
        eng.run(
            "acme/webapp",
            env.dir.path(),
            vec![(id, finding)],
            &cancel,
            &progress,
        )
        .await;

        assert_eq!(eng.publisher.calls.load(Ordering::SeqCst), 0);
        let stored = storage.get_finding(id).await.unwrap();
        assert!(stored.pr_url.is_none());
    }

    #[tokio::test]
    async fn triage_cap_bounds_processed_findings() {
        let env = create_env().await;
        let mut findings = Vec::new();
        for i in 0..3 {
            let finding = sqli_finding(&format!("query = f\"SELECT {i}\""));
            let id = stamp(&env, &finding).await;
            findings.push((id, finding));
        }

        let eng = engine(
            &env,
            StubModel {
                verdict: "FP",
                patch: "unused",
                fail: false,
            },
            StubSandbox::default(),
            StubPublisher::default(),
            WorkflowOptions {
                triage_limit: 2,
                sandbox_verify_patches: false,
            },
        );

        let summary = eng
            .run(
                "acme/webapp",
                env.dir.path(),
                findings,
                &CancellationToken::new(),
                &progress_for(&env),
            )
            .await;
        assert_eq!(summary.processed, 2);
    }

    #[tokio::test]
    async fn sandbox_gating_rejects_failed_patches() {
        let env = create_env().await;
        let finding = sqli_finding("query = f\"SELECT {u}\"");
        let id = stamp(&env, &finding).await;

        let eng = engine(
            &env,
            StubModel {
                verdict: "TP",
                patch: "query = \"SELECT ?\"",
                fail: false,
            },
            StubSandbox {
                poc_calls: AtomicUsize::new(0),
                patch_calls: AtomicUsize::new(0),
                patch_success: false,
            },
            StubPublisher::default(),
            WorkflowOptions {
                triage_limit: 20,
                sandbox_verify_patches: true,
            },
        );

        let summary = eng
            .run(
                "acme/webapp",
                env.dir.path(),
                vec![(id, finding)],
                &CancellationToken::new(),
                &progress_for(&env),
            )
            .await;

        assert_eq!(summary.prs_opened, 0);
        assert_eq!(eng.sandbox.patch_calls.load(Ordering::SeqCst), 1);
        let stored = env.storage.get_finding(id).await.unwrap();
        assert!(stored.remediation_patch.is_none());
        assert!(stored.sandbox_logs.unwrap().contains("PATCH_VERIFICATION"));
    }

    #[tokio::test]
    async fn pr_url_implies_patch_invariant() {
        let env = create_env().await;
        let finding = sqli_finding("query = f\"SELECT {u}\"");
        let id = stamp(&env, &finding).await;

        let eng = engine(
            &env,
            StubModel {
                verdict: "TP",
                patch: "query = \"SELECT ?\"",
                fail: false,
            },
            StubSandbox::default(),
            StubPublisher::default(),
            WorkflowOptions::default(),
        );

        eng.run(
            "acme/webapp",
            env.dir.path(),
            vec![(id, finding)],
            &CancellationToken::new(),
            &progress_for(&env),
        )
        .await;

        let stored = env.storage.get_finding(id).await.unwrap();
        if stored.pr_url.is_some() {
            assert!(stored.remediation_patch.is_some());
        }
    }
}
