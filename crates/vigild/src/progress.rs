//! Progress side-channel for live scan status.
//!
//! One small JSON field map per scan, written under the daemon's progress
//! directory and polled by the dashboard collaborator. Deliberately
//! independent of the durable store: writes are fire-and-forget with
//! last-writer-wins semantics, and an unavailable channel must never block
//! scan progress, so every write error is logged and swallowed.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Field map exposed for one scan (`scan:<id>:state` equivalent).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressState {
    pub stage: String,
    pub step_number: u32,
    pub total_steps: u32,
    pub message: String,
    pub status: String,
    /// Epoch milliseconds of the last write.
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Writer handle for one scan's progress map.
#[derive(Debug, Clone)]
pub struct ProgressPublisher {
    dir: PathBuf,
    scan_id: i64,
}

impl ProgressPublisher {
    pub fn new(dir: &Path, scan_id: i64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            scan_id,
        }
    }

    fn state_path(dir: &Path, scan_id: i64) -> PathBuf {
        dir.join(format!("scan-{scan_id}.json"))
    }

    /// Update the current stage name (e.g. "Scanning", "Analyzing").
    pub fn update_stage(&self, stage: &str) {
        self.merge(|state| {
            state.stage = stage.to_string();
        });
    }

    /// Update progress position (e.g. step 3 of 8).
    pub fn update_step(&self, step: u32, total: u32, message: &str, status: &str) {
        self.merge(|state| {
            state.step_number = step;
            state.total_steps = total;
            state.message = message.to_string();
            state.status = status.to_string();
        });
    }

    /// Mark the scan as completed.
    pub fn complete(&self) {
        self.merge(|state| {
            state.status = "completed".to_string();
        });
    }

    /// Mark the scan as failed with an error message.
    pub fn fail(&self, error: &str) {
        self.merge(|state| {
            state.status = "failed".to_string();
            state.error = Some(error.to_string());
        });
    }

    /// Read the field map for a scan, if any was ever published.
    pub fn read(dir: &Path, scan_id: i64) -> Option<ProgressState> {
        let content = std::fs::read_to_string(Self::state_path(dir, scan_id)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Load-modify-store with last-writer-wins. Errors never propagate.
    fn merge(&self, apply: impl FnOnce(&mut ProgressState)) {
        let mut state = Self::read(&self.dir, self.scan_id).unwrap_or_default();
        apply(&mut state);
        state.updated_at = Utc::now().timestamp_millis();

        if let Err(e) = self.write(&state) {
            warn!(scan_id = self.scan_id, error = %e, "progress write dropped");
        }
    }

    fn write(&self, state: &ProgressState) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(Self::state_path(&self.dir, self.scan_id), json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn updates_merge_into_one_field_map() {
        let dir = TempDir::new().unwrap();
        let publisher = ProgressPublisher::new(dir.path(), 7);

        publisher.update_stage("Scanning");
        publisher.update_step(3, 8, "Running analyzers", "running");

        let state = ProgressPublisher::read(dir.path(), 7).unwrap();
        assert_eq!(state.stage, "Scanning");
        assert_eq!(state.step_number, 3);
        assert_eq!(state.total_steps, 8);
        assert_eq!(state.message, "Running analyzers");
        assert_eq!(state.status, "running");
        assert!(state.updated_at > 0);
    }

    #[test]
    fn complete_sets_status_only() {
        let dir = TempDir::new().unwrap();
        let publisher = ProgressPublisher::new(dir.path(), 7);

        publisher.update_step(8, 8, "Done", "running");
        publisher.complete();

        let state = ProgressPublisher::read(dir.path(), 7).unwrap();
        assert_eq!(state.status, "completed");
        assert_eq!(state.message, "Done");
        assert!(state.error.is_none());
    }

    #[test]
    fn fail_records_error() {
        let dir = TempDir::new().unwrap();
        let publisher = ProgressPublisher::new(dir.path(), 7);

        publisher.fail("AI services timed out");

        let state = ProgressPublisher::read(dir.path(), 7).unwrap();
        assert_eq!(state.status, "failed");
        assert_eq!(state.error.as_deref(), Some("AI services timed out"));
    }

    #[test]
    fn last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let publisher = ProgressPublisher::new(dir.path(), 7);

        publisher.update_stage("Cloning");
        publisher.update_stage("Scanning");

        let state = ProgressPublisher::read(dir.path(), 7).unwrap();
        assert_eq!(state.stage, "Scanning");
    }

    #[test]
    fn read_missing_scan_returns_none() {
        let dir = TempDir::new().unwrap();
        assert!(ProgressPublisher::read(dir.path(), 404).is_none());
    }

    #[test]
    fn writes_to_unwritable_dir_are_swallowed() {
        // Fire-and-forget: a bad directory must not panic or error.
        let publisher = ProgressPublisher::new(Path::new("/proc/no-such-dir"), 1);
        publisher.update_stage("Scanning");
        publisher.fail("boom");
    }

    #[test]
    fn scans_do_not_share_state() {
        let dir = TempDir::new().unwrap();
        ProgressPublisher::new(dir.path(), 1).update_stage("Cloning");
        ProgressPublisher::new(dir.path(), 2).update_stage("Scanning");

        assert_eq!(ProgressPublisher::read(dir.path(), 1).unwrap().stage, "Cloning");
        assert_eq!(ProgressPublisher::read(dir.path(), 2).unwrap().stage, "Scanning");
    }
}
