use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};

use crate::job::{JobEntry, SizedEntry};
use crate::worker::fetch::{self, CredentialRegistry};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Classification of one entry against what is already on disk.
#[derive(Debug)]
pub enum Classified {
    Skip { entry: SizedEntry, reason: String },
    Download(SizedEntry),
}

/// Probe the remote size with a one-byte range request. Failures are
/// non-fatal; an unknown size is reported as 0 and the entry can still be
/// downloaded.
pub async fn probe_size(client: &reqwest::Client, creds: &CredentialRegistry, url: &str) -> u64 {
    match try_probe(client, creds, url).await {
        Ok(size) => size,
        Err(err) => {
            eprintln!("size probe failed for {}: {}", url, err);
            0
        }
    }
}

async fn try_probe(
    client: &reqwest::Client,
    creds: &CredentialRegistry,
    url: &str,
) -> Result<u64, reqwest::Error> {
    let resp = fetch::authenticated_get(client, creds, url)
        .header(RANGE, "bytes=0-0")
        .timeout(PROBE_TIMEOUT)
        .send()
        .await?;
    if resp.status() == StatusCode::RANGE_NOT_SATISFIABLE {
        return Ok(0);
    }
    let resp = resp.error_for_status()?;

    // Content-Range carries the total: "bytes 0-0/123456"
    if let Some(range) = resp.headers().get(CONTENT_RANGE) {
        let total = range
            .to_str()
            .ok()
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.trim().parse::<u64>().ok());
        return Ok(total.unwrap_or(0));
    }
    Ok(resp.content_length().unwrap_or(0))
}

/// Decide whether an entry needs a download, trusting hash over size over
/// mere existence:
///
/// 1. no local file: download
/// 2. expected hash configured: skip on match, download on mismatch
/// 3. no hash, remote size known and equal: skip
/// 4. no hash, remote size known and different: download
/// 5. no hash, remote size unknown: skip because the file exists
pub async fn classify(entry: JobEntry, size: u64, root: &Path) -> Classified {
    let local = root.join(&entry.dest);
    let sized = SizedEntry { entry, size };

    let meta = match tokio::fs::metadata(&local).await {
        Ok(meta) => meta,
        Err(_) => return Classified::Download(sized),
    };

    if let Some(expected) = sized.entry.sha256.clone() {
        return match fetch::file_sha256(&local).await {
            Ok(actual) if actual.eq_ignore_ascii_case(&expected) => Classified::Skip {
                entry: sized,
                reason: String::from("hash match"),
            },
            Ok(_) => Classified::Download(sized),
            Err(err) => {
                eprintln!("hashing {} failed: {}", local.display(), err);
                Classified::Download(sized)
            }
        };
    }

    if sized.size > 0 {
        if meta.len() == sized.size {
            Classified::Skip {
                entry: sized,
                reason: String::from("size match"),
            }
        } else {
            Classified::Download(sized)
        }
    } else {
        Classified::Skip {
            entry: sized,
            reason: String::from("file exists"),
        }
    }
}
