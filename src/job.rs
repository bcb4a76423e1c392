use serde::{Deserialize, Serialize};

/// One unit of work: a remote file and where it lands under the volume root.
///
/// `dest` is relative to the storage root and unique within one job list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub url: String,
    pub dest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl JobEntry {
    /// Hostname component of the entry's URL, if it parses.
    pub fn host(&self) -> Option<String> {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
    }
}

/// A job entry after the preflight size probe. A size of 0 means unknown.
#[derive(Debug, Clone)]
pub struct SizedEntry {
    pub entry: JobEntry,
    pub size: u64,
}

pub fn parse_job_list(raw: &str) -> Result<Vec<JobEntry>, serde_json::Error> {
    serde_json::from_str(raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOutcome {
    Success,
    Failed,
    Skipped,
}

/// Terminal per-entry outcome, appended once per entry in completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResult {
    pub file: String,
    pub status: FileOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FileResult {
    pub fn success(file: impl Into<String>) -> Self {
        FileResult {
            file: file.into(),
            status: FileOutcome::Success,
            reason: None,
        }
    }

    pub fn failed(file: impl Into<String>, reason: impl Into<String>) -> Self {
        FileResult {
            file: file.into(),
            status: FileOutcome::Failed,
            reason: Some(reason.into()),
        }
    }

    pub fn skipped(file: impl Into<String>, reason: impl Into<String>) -> Self {
        FileResult {
            file: file.into(),
            status: FileOutcome::Skipped,
            reason: Some(reason.into()),
        }
    }
}
