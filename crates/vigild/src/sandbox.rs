//! Sandbox service client.
//!
//! The sandbox is an external collaborator that executes untrusted code in
//! isolation: proof-of-concept exploits, patch verification, and ephemeral
//! application deploys for DAST. Only its HTTP contract lives here.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use vigil_core::NormalizedFinding;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Outcome of a sandbox execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub success: bool,
    #[serde(default)]
    pub output: String,
}

/// Outcome of an ephemeral application deploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub success: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub container_id: String,
}

/// Seam between the pipeline and the sandbox service. Tests stub this.
pub trait SandboxClient: Send + Sync {
    /// Execute a PoC script against a copy of the source tree.
    fn verify_poc(
        &self,
        source_path: &str,
        poc_code: &str,
        file_extension: &str,
    ) -> impl Future<Output = Result<ExecOutcome>> + Send;

    /// Apply a candidate patch to `target_file` and run it in isolation.
    fn verify_patch(
        &self,
        source_path: &str,
        patch_code: &str,
        target_file: &str,
    ) -> impl Future<Output = Result<ExecOutcome>> + Send;

    /// Deploy the application for DAST; returns the reachable URL.
    fn deploy(
        &self,
        source_path: &str,
        port: u16,
        start_cmd: Option<&str>,
    ) -> impl Future<Output = Result<DeployOutcome>> + Send;

    /// Hand a finding to the sandbox's own red-team harness.
    fn red_team(
        &self,
        finding: &NormalizedFinding,
        project: &str,
        source_path: &str,
    ) -> impl Future<Output = Result<ExecOutcome>> + Send;
}

/// HTTP implementation over reqwest.
#[derive(Debug, Clone)]
pub struct HttpSandboxClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSandboxClient {
    /// Deploys build a container image, so the client timeout is generous.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl SandboxClient for HttpSandboxClient {
    async fn verify_poc(
        &self,
        source_path: &str,
        poc_code: &str,
        file_extension: &str,
    ) -> Result<ExecOutcome> {
        let response = self
            .client
            .post(format!("{}/verify_poc", self.base_url))
            .json(&json!({
                "source_path": source_path,
                "poc_code": poc_code,
                "file_extension": file_extension,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn verify_patch(
        &self,
        source_path: &str,
        patch_code: &str,
        target_file: &str,
    ) -> Result<ExecOutcome> {
        let response = self
            .client
            .post(format!("{}/verify_patch", self.base_url))
            .json(&json!({
                "source_path": source_path,
                "patch_code": patch_code,
                "target_file": target_file,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn deploy(
        &self,
        source_path: &str,
        port: u16,
        start_cmd: Option<&str>,
    ) -> Result<DeployOutcome> {
        let response = self
            .client
            .post(format!("{}/deploy", self.base_url))
            .json(&json!({
                "source_path": source_path,
                "port": port,
                "start_cmd": start_cmd,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn red_team(
        &self,
        finding: &NormalizedFinding,
        project: &str,
        source_path: &str,
    ) -> Result<ExecOutcome> {
        let response = self
            .client
            .post(format!("{}/red_team", self.base_url))
            .json(&json!({
                "finding": finding,
                "project": project,
                "source_path": source_path,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}
