//! Remediation publisher.
//!
//! Takes an accepted patch and turns it into an upstream pull request:
//! write the corrected file, commit it on a fresh branch under a bot
//! identity, push over an authenticated URL, and open the PR through the
//! hosting API. Every failure surfaces as an error for the workflow engine
//! to record in `pr_error` — publishing never aborts the run.

use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use crate::secrets;

const BOT_EMAIL: &str = "bot@vigil.dev";
const BOT_NAME: &str = "Vigil Security Bot";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git command failed: {0}")]
    GitFailed(String),
    #[error("hosting API error: {0}")]
    Api(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no hosting token available")]
    MissingToken,
}

pub type Result<T> = std::result::Result<T, PublishError>;

/// Everything needed to publish one fix.
#[derive(Debug, Clone)]
pub struct PrRequest {
    /// Full repository name (`owner/repo`).
    pub repo_name: String,
    pub branch_name: String,
    /// Full corrected file content.
    pub patch_content: String,
    /// Path of the patched file, relative to the repo root.
    pub file_path: String,
    /// Issue description used for the commit message and PR body.
    pub issue_message: String,
    /// Local checkout the patch is applied in.
    pub working_dir: PathBuf,
}

/// Seam between the workflow engine and the hosting platform. Tests stub
/// this.
pub trait PullRequestOpener: Send + Sync {
    /// Publish the patch and return the pull request URL.
    fn create_security_pr(&self, request: &PrRequest) -> impl Future<Output = Result<String>> + Send;
}

/// Publisher backed by local git plus the hosting REST API.
#[derive(Debug, Clone)]
pub struct GitHubPublisher {
    client: reqwest::Client,
    api_base: String,
    hosting_domain: String,
    base_branch: String,
}

#[derive(Deserialize)]
struct PrResponse {
    html_url: String,
}

impl GitHubPublisher {
    pub fn new(config: &vigil_core::Config) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
            api_base: config.hosting_api_base.trim_end_matches('/').to_string(),
            hosting_domain: config.hosting_domain.clone(),
            base_branch: config.pr_base_branch.clone(),
        })
    }
}

impl PullRequestOpener for GitHubPublisher {
    async fn create_security_pr(&self, request: &PrRequest) -> Result<String> {
        let token = secrets::hosting_token().ok_or(PublishError::MissingToken)?;
        let dir = &request.working_dir;

        // 1. Apply the patch (overwrite the target file).
        let full_path = dir.join(&request.file_path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full_path, &request.patch_content)?;
        info!(file = %request.file_path, "applied patch");

        // 2. Bot identity, so the commit does not fail on a bare clone.
        run_git(dir, &["config", "user.email", BOT_EMAIL]).await?;
        run_git(dir, &["config", "user.name", BOT_NAME]).await?;

        // 3. Branch, stage, commit.
        run_git(dir, &["checkout", "-b", &request.branch_name]).await?;
        run_git(dir, &["add", &request.file_path]).await?;
        let commit_message = format!("Security fix: {}", request.issue_message);
        run_git(dir, &["commit", "-m", &commit_message]).await?;

        // 4. Push straight to the authenticated URL, bypassing stored
        // credentials. The URL carries the token and must never be logged.
        let push_url =
            secrets::authenticated_repo_url(&request.repo_name, &self.hosting_domain, &token);
        info!(branch = %request.branch_name, repo = %request.repo_name, "pushing fix branch");
        run_git(dir, &["push", &push_url, &request.branch_name]).await?;

        // 5. Open the pull request via the hosting API.
        let response = self
            .client
            .post(format!("{}/repos/{}/pulls", self.api_base, request.repo_name))
            .bearer_auth(&token)
            .header("User-Agent", "vigild")
            .json(&json!({
                "title": format!("Security fix: {}", request.issue_message),
                "body": format!(
                    "## Automated Security Report\n**Vulnerability:** {}\n\nReview fix for `{}`.",
                    request.issue_message, request.file_path
                ),
                "head": request.branch_name,
                "base": self.base_branch,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let body_preview: String = body.chars().take(200).collect();
            return Err(PublishError::Api(format!("{status}: {body_preview}")));
        }

        let pr: PrResponse = response
            .json()
            .await
            .map_err(|e| PublishError::Api(e.to_string()))?;
        Ok(pr.html_url)
    }
}

/// Run a git subcommand in `dir`, failing on non-zero exit.
async fn run_git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PublishError::GitFailed(format!(
            "git {}: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pr_response_parses_html_url() {
        let json = r#"{"html_url": "https://github.com/acme/webapp/pull/7", "number": 7}"#;
        let pr: PrResponse = serde_json::from_str(json).unwrap();
        assert_eq!(pr.html_url, "https://github.com/acme/webapp/pull/7");
    }

    #[tokio::test]
    async fn run_git_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        // Not a repository: status must fail with a GitFailed error.
        let result = run_git(dir.path(), &["status", "--porcelain"]).await;
        assert!(matches!(result, Err(PublishError::GitFailed(_))));
    }

    #[tokio::test]
    async fn run_git_succeeds_in_real_repo() {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init", "-q"]).await.unwrap();
        run_git(dir.path(), &["status", "--porcelain"]).await.unwrap();
    }
}
