pub mod config;
pub mod prompt;
pub mod report;
pub mod snippet;
pub mod stack;
pub mod types;

pub use config::Config;
pub use report::{clean_path, extract_findings, DAST_PLACEHOLDER_FILE, FORBIDDEN_PATHS};
pub use snippet::{extract_snippet, populate_snippets};
pub use stack::{detect_stack, AppType, StackInfo};
pub use types::{
    EpssRecord, Feedback, Finding, JobId, JobKind, JobPayload, NewScan, NormalizedFinding,
    PipelineMetric, Scan, ScanJob, ScanMetadata, ScanStatus, Severity, TriageJob, Verdict,
};
