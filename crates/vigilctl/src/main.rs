//! vigilctl - CLI control plane for vigild
//!
//! Enqueues scan jobs onto the durable queue and inspects scan state: the
//! scan row, its findings, and the live progress side-channel. Talks to the
//! same state directory as the daemon.

mod render;

use clap::{Parser, Subcommand};
use eyre::{bail, WrapErr};
use std::path::PathBuf;
use std::sync::Arc;
use vigil_core::{Config, JobPayload, ScanJob, ScanMetadata};
use vigild::progress::ProgressPublisher;
use vigild::queue::JobQueue;
use vigild::storage::Storage;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// CLI client for the vigild scan orchestration daemon.
#[derive(Parser)]
#[command(name = "vigilctl")]
#[command(about = "Control plane for the vigild security scan pipeline")]
#[command(version)]
struct Cli {
    /// Config file (key=value format)
    #[arg(long, global = true, env = "VIGILD_CONFIG")]
    config: Option<PathBuf>,

    /// State directory override (database, progress channel)
    #[arg(long, global = true, env = "VIGILD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a scan job for a project
    Scan {
        /// Full project name (owner/repo)
        project: String,

        /// Local source directory to scan
        #[arg(long, default_value = "/app")]
        path: PathBuf,

        /// Repository URL to clone when the path is not usable
        #[arg(long)]
        repo_url: Option<String>,

        /// Branch being scanned
        #[arg(long)]
        branch: Option<String>,

        /// Commit hash ("latest" to take the branch head)
        #[arg(long)]
        commit: Option<String>,

        /// CI provider label
        #[arg(long)]
        ci_provider: Option<String>,

        /// Pre-deployed DAST target URL
        #[arg(long)]
        target_url: Option<String>,

        /// Restrict the scan to these files (repeatable, delta scan)
        #[arg(long = "changed-file")]
        changed_files: Vec<String>,
    },

    /// Show a scan's status and live progress
    Status {
        /// Scan id or reference UUID
        scan: String,
    },

    /// List findings for a scan
    Findings {
        /// Scan id
        scan_id: i64,

        /// Show one finding in full detail
        #[arg(long)]
        id: Option<i64>,
    },

    /// Record human feedback on a finding
    Feedback {
        /// Finding id
        finding_id: i64,

        /// Verdict (TP or FP)
        verdict: String,

        /// Optional review comments
        #[arg(long, default_value = "")]
        comments: String,
    },

    /// Delete all scans and findings for a project
    DeleteProject {
        /// Full project name (owner/repo)
        project: String,
    },
}

fn load_config(cli: &Cli) -> eyre::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    } else if config.data_dir == Config::default().data_dir {
        if let Some(dir) = dirs::data_local_dir() {
            config.data_dir = dir.join("vigild");
        }
    }
    Ok(config)
}

async fn open_storage(config: &Config) -> eyre::Result<Arc<Storage>> {
    let storage = Storage::new(&config.db_path()).await?;
    storage.migrate_embedded().await?;
    Ok(Arc::new(storage))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let storage = open_storage(&config).await?;

    match cli.command {
        Command::Scan {
            project,
            path,
            repo_url,
            branch,
            commit,
            ci_provider,
            target_url,
            changed_files,
        } => {
            let reference_id = uuid::Uuid::new_v4().to_string();
            let payload = JobPayload::ExecuteScanJob(ScanJob {
                project: project.clone(),
                path: path.display().to_string(),
                metadata: ScanMetadata {
                    ci_provider,
                    branch,
                    commit_sha: commit,
                    repo_url,
                    run_url: None,
                    target_url,
                    changed_files,
                    reference_id: Some(reference_id.clone()),
                },
            });

            let queue = JobQueue::with_defaults(storage.pool());
            let job_id = queue.enqueue(&payload).await?;
            render::print_scan_enqueued(&project, job_id.as_ref(), &reference_id);
        }

        Command::Status { scan } => {
            let record = match scan.parse::<i64>() {
                Ok(id) => storage.get_scan(id).await?,
                Err(_) => match storage.get_scan_by_reference(&scan).await? {
                    Some(record) => record,
                    None => bail!("no scan found for reference {scan}"),
                },
            };
            let progress = ProgressPublisher::read(&config.progress_dir(), record.id);
            render::print_scan_status(&record, progress.as_ref());
        }

        Command::Findings { scan_id, id } => {
            if let Some(finding_id) = id {
                let finding = storage.get_finding(finding_id).await?;
                render::print_finding_details(&finding);
            } else {
                let findings = storage.list_findings(scan_id).await?;
                render::print_findings(&findings);
            }
        }

        Command::Feedback {
            finding_id,
            verdict,
            comments,
        } => {
            let verdict = verdict.to_uppercase();
            if verdict != "TP" && verdict != "FP" {
                bail!("verdict must be TP or FP, got {verdict}");
            }
            // Validates the finding exists before recording.
            storage.get_finding(finding_id).await?;
            storage.insert_feedback(finding_id, &verdict, &comments).await?;
            println!("Recorded {verdict} feedback for finding {finding_id}");
        }

        Command::DeleteProject { project } => {
            let deleted = storage.delete_project(&project).await?;
            println!("Deleted {deleted} scan(s) for {project}");
        }
    }

    Ok(())
}
