use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc::unbounded_channel;
use tokio::task::{JoinError, JoinHandle};

use crate::job::{FileResult, SizedEntry};
use crate::status::{StatusHandle, progress_line};
use crate::worker::fetch::{self, CredentialRegistry};

/// Group entries by the hostname of their URL. Each partition downloads
/// strictly sequentially so no remote origin ever sees more than one
/// concurrent request from us.
pub fn partition_by_host(entries: Vec<SizedEntry>) -> HashMap<String, Vec<SizedEntry>> {
    let mut partitions: HashMap<String, Vec<SizedEntry>> = HashMap::new();
    for entry in entries {
        let host = entry
            .entry
            .host()
            .unwrap_or_else(|| entry.entry.url.clone());
        partitions.entry(host).or_default().push(entry);
    }
    partitions
}

/// Run every host partition to completion, one task per host, and feed
/// chunk-level byte counts through an aggregator into the shared status.
pub async fn run_downloads(
    client: &reqwest::Client,
    creds: &CredentialRegistry,
    entries: Vec<SizedEntry>,
    root: &Path,
    status: &StatusHandle,
) -> Result<(), JoinError> {
    let (tx, mut rx) = unbounded_channel::<u64>();

    let aggregator_status = status.clone();
    let aggregator = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            aggregator_status.record_bytes(bytes);
        }
    });

    let mut handles = Vec::new();
    for (_host, queue) in partition_by_host(entries) {
        let client = client.clone();
        let creds = creds.clone();
        let root = PathBuf::from(root);
        let status = status.clone();
        let tx = tx.clone();

        handles.push(tokio::spawn(async move {
            for entry in queue {
                let dest = entry.entry.dest.clone();
                status.start_file(&dest);
                let result = fetch::fetch_entry(&client, &creds, &entry, &root, &tx).await;
                status.finish_file(&dest);
                match result {
                    Ok(()) => {
                        println!("downloaded {}", dest);
                        status.push_result(FileResult::success(dest));
                    }
                    Err(err) => {
                        eprintln!("download failed for {}: {}", dest, err);
                        status.push_result(FileResult::failed(dest, err.to_string()));
                    }
                }
            }
        }));
    }
    drop(tx);

    for handle in handles {
        handle.await?;
    }
    // All senders are gone, so the aggregator drains and exits
    aggregator.await?;
    Ok(())
}

/// Print a progress line on a fixed interval until aborted by the caller.
pub fn spawn_progress_ticker(status: StatusHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            println!("{}", progress_line(&status.snapshot()));
        }
    })
}
