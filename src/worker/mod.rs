pub mod endpoint;
pub mod fetch;
pub mod preflight;
pub mod queue;

use std::env;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::TcpListener;

use crate::job::{self, FileResult, JobEntry};
use crate::status::{Phase, StatusHandle};
use fetch::{CIVITAI_HOST, CredentialRegistry, HF_HOST};
use preflight::Classified;

pub const JOBS_ENV: &str = "VOLPREP_JOBS";
pub const ROOT_ENV: &str = "VOLPREP_ROOT";
pub const STATUS_TOKEN_ENV: &str = "VOLPREP_STATUS_TOKEN";
pub const HF_TOKEN_ENV: &str = "HF_TOKEN";
pub const CIVITAI_TOKEN_ENV: &str = "CIVITAI_TOKEN";

const DEFAULT_ROOT: &str = "/workspace";
const TICKER_INTERVAL: Duration = Duration::from_secs(5);

/// Run the worker: bind the status endpoint, kick off the download pipeline
/// and keep serving status until the orchestrator tears the host down.
pub async fn run(address: String, port: u16) -> Result<(), Box<dyn Error + Send + Sync>> {
    let status = StatusHandle::new();
    let token = env::var(STATUS_TOKEN_ENV).ok();
    let listener = TcpListener::bind(format!("{}:{}", address, port)).await?;
    println!("status endpoint on http://{}", listener.local_addr()?);

    let pipeline_status = status.clone();
    tokio::spawn(async move {
        let raw_jobs = env::var(JOBS_ENV).ok();
        let root = PathBuf::from(env::var(ROOT_ENV).unwrap_or_else(|_| DEFAULT_ROOT.to_string()));

        let mut creds = CredentialRegistry::new();
        if let Ok(token) = env::var(HF_TOKEN_ENV) {
            creds.insert(HF_HOST, token);
        }
        if let Ok(token) = env::var(CIVITAI_TOKEN_ENV) {
            creds.insert(CIVITAI_HOST, token);
        }

        run_pipeline(raw_jobs, root, creds, pipeline_status).await;
    });

    let app = endpoint::build_router(status, token);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Parse the job list and run it. A missing or malformed job list is the
/// one worker-fatal error: it flips the status to `failed` without touching
/// any entry, and the endpoint stays up so the poller can observe it.
pub async fn run_pipeline(
    raw_jobs: Option<String>,
    root: PathBuf,
    creds: CredentialRegistry,
    status: StatusHandle,
) {
    let raw = match raw_jobs {
        Some(raw) => raw,
        None => {
            status.fail(format!("{} is not set", JOBS_ENV));
            return;
        }
    };
    let jobs = match job::parse_job_list(&raw) {
        Ok(jobs) => jobs,
        Err(err) => {
            status.fail(format!("invalid job list: {}", err));
            return;
        }
    };
    if let Err(err) = run_jobs(jobs, &root, &creds, &status).await {
        status.fail(err.to_string());
    }
}

/// Preflight every entry, then download what is missing, one queue per
/// remote host. Ends in `completed` or `failed`; skipping everything goes
/// straight from `preflight` to `completed`.
pub async fn run_jobs(
    jobs: Vec<JobEntry>,
    root: &Path,
    creds: &CredentialRegistry,
    status: &StatusHandle,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let client = reqwest::Client::new();
    status.begin(jobs.len());

    let mut pending = Vec::new();
    let mut total_bytes: u64 = 0;
    for entry in jobs {
        let size = preflight::probe_size(&client, creds, &entry.url).await;
        match preflight::classify(entry, size, root).await {
            Classified::Skip { entry, reason } => {
                println!("skipping {}: {}", entry.entry.dest, reason);
                status.push_result(FileResult::skipped(entry.entry.dest, reason));
            }
            Classified::Download(sized) => {
                total_bytes += sized.size;
                pending.push(sized);
            }
        }
    }
    status.set_total_bytes(total_bytes);

    if !pending.is_empty() {
        status.set_phase(Phase::Downloading);
        let ticker = queue::spawn_progress_ticker(status.clone(), TICKER_INTERVAL);
        let outcome = queue::run_downloads(&client, creds, pending, root, status).await;
        ticker.abort();
        outcome?;
    }

    status.finish();
    print_summary(status);
    Ok(())
}

fn print_summary(status: &StatusHandle) {
    let snap = status.snapshot();
    for skipped in snap.skipped_results() {
        println!(
            "skipped {}: {}",
            skipped.file,
            skipped.reason.as_deref().unwrap_or("")
        );
    }
    for failed in snap.failed_results() {
        eprintln!(
            "failed {}: {}",
            failed.file,
            failed.reason.as_deref().unwrap_or("")
        );
    }
    println!(
        "done: {} file(s), {} skipped, {} failed",
        snap.total_files,
        snap.skipped_results().len(),
        snap.failed_results().len()
    );
}
