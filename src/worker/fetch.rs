use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::io;
use std::path::Path;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;

use crate::job::SizedEntry;

pub const HF_HOST: &str = "huggingface.co";
pub const CIVITAI_HOST: &str = "civitai.com";

/// Exact hostname to bearer token. Hosts without an entry download
/// anonymously; matching is by whole hostname, never by substring.
#[derive(Debug, Default, Clone)]
pub struct CredentialRegistry {
    tokens: HashMap<String, String>,
}

impl CredentialRegistry {
    pub fn new() -> Self {
        CredentialRegistry {
            tokens: HashMap::new(),
        }
    }

    pub fn insert(&mut self, host: impl Into<String>, token: impl Into<String>) {
        self.tokens.insert(host.into(), token.into());
    }

    pub fn token_for(&self, host: &str) -> Option<&str> {
        self.tokens.get(host).map(String::as_str)
    }
}

/// GET request for `url` with the bearer token registered for its host, if
/// any. Shared by the size probe and the download itself.
pub(crate) fn authenticated_get(
    client: &reqwest::Client,
    creds: &CredentialRegistry,
    url: &str,
) -> reqwest::RequestBuilder {
    let mut req = client.get(url);
    let token = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .and_then(|host| creds.token_for(&host).map(String::from));
    if let Some(token) = token {
        req = req.bearer_auth(token);
    }
    req
}

#[derive(Debug)]
pub enum FetchError {
    Http(reqwest::Error),
    Status(reqwest::StatusCode),
    EmptyBody,
    SizeMismatch { expected: u64, actual: u64 },
    HashMismatch { expected: String, actual: String },
    Io(io::Error),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Http(err) => write!(f, "{}", err),
            FetchError::Status(status) => write!(f, "{}", status),
            FetchError::EmptyBody => write!(f, "no response body"),
            FetchError::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch: expected {}, got {}", expected, actual)
            }
            FetchError::HashMismatch { expected, actual } => {
                write!(f, "hash mismatch: expected {}, got {}", expected, actual)
            }
            FetchError::Io(err) => write!(f, "{}", err),
        }
    }
}

impl Error for FetchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FetchError::Http(err) => Some(err),
            FetchError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Http(err)
    }
}

impl From<io::Error> for FetchError {
    fn from(err: io::Error) -> Self {
        FetchError::Io(err)
    }
}

/// Download one entry to `<root>/<dest>`, pushing per-chunk byte counts into
/// `progress`, then verify what was written. On failure the partial file is
/// left in place; the next run's skip decision re-evaluates it.
pub async fn fetch_entry(
    client: &reqwest::Client,
    creds: &CredentialRegistry,
    entry: &SizedEntry,
    root: &Path,
    progress: &UnboundedSender<u64>,
) -> Result<(), FetchError> {
    let dest = root.join(&entry.entry.dest);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let resp = authenticated_get(client, creds, &entry.entry.url)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(FetchError::Status(resp.status()));
    }

    let declared = resp.content_length();
    let mut file = tokio::fs::File::create(&dest).await?;
    let mut stream = resp.bytes_stream();
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        let _ = progress.send(chunk.len() as u64);
    }
    file.flush().await?;
    drop(file);

    if written == 0 && declared.is_none() {
        return Err(FetchError::EmptyBody);
    }
    if entry.size > 0 && written != entry.size {
        return Err(FetchError::SizeMismatch {
            expected: entry.size,
            actual: written,
        });
    }
    if let Some(expected) = entry.entry.sha256.as_deref() {
        let actual = file_sha256(&dest).await?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(FetchError::HashMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
    }
    Ok(())
}

/// Streaming sha256 of a file on disk, as a lowercase hex string.
pub async fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
