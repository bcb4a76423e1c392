use std::error::Error;
use std::fmt;
use std::time::{Duration, Instant};

use rand::{Rng, distributions::Alphanumeric};

use crate::job::FileResult;
use crate::status::{Phase, WorkerStatus, progress_line};

pub type BoxError = Box<dyn Error + Send + Sync>;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// A provisioned worker host as the control plane sees it. `status_url` is
/// the base URL of the worker's status endpoint and `status_token` the
/// bearer token baked into the host at creation time.
#[derive(Debug, Clone)]
pub struct WorkerHost {
    pub id: String,
    pub status_url: String,
    pub status_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Starting,
    Running,
    Stopped,
}

/// The slice of the cloud control plane the poller needs. Implementations
/// are thin typed HTTP clients owned by the caller; `create_worker` must
/// inject the given status token into the new host's environment and return
/// it in the resulting [`WorkerHost`].
#[allow(async_fn_in_trait)]
pub trait ComputeProvider {
    async fn find_worker(&self) -> Result<Option<WorkerHost>, BoxError>;
    async fn create_worker(&self, status_token: &str) -> Result<WorkerHost, BoxError>;
    async fn host_state(&self, host: &WorkerHost) -> Result<HostState, BoxError>;
    async fn delete_worker(&self, host: &WorkerHost) -> Result<(), BoxError>;
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub state_poll_interval: Duration,
    /// How long a continuous run of failed polls may last before the host
    /// is declared unresponsive and the attempt is abandoned.
    pub unresponsive_after: Duration,
    /// How long the host gets to reach the running state.
    pub start_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            max_attempts: 3,
            poll_interval: Duration::from_secs(5),
            state_poll_interval: Duration::from_secs(5),
            unresponsive_after: Duration::from_secs(120),
            start_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
pub enum PollError {
    /// The worker finished but reported `failed`; the listed entries carry
    /// the individual reasons.
    WorkerFailed {
        error: Option<String>,
        failed: Vec<FileResult>,
    },
    /// Every attempt was aborted (unresponsive host, start timeout, control
    /// plane errors) and the attempt cap is exhausted.
    AttemptsExhausted { attempts: u32, last: String },
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollError::WorkerFailed { error, failed } => {
                write!(f, "worker reported failure")?;
                if let Some(error) = error {
                    write!(f, ": {}", error)?;
                }
                for result in failed {
                    write!(
                        f,
                        "; {} ({})",
                        result.file,
                        result.reason.as_deref().unwrap_or("no reason")
                    )?;
                }
                Ok(())
            }
            PollError::AttemptsExhausted { attempts, last } => {
                write!(
                    f,
                    "worker did not finish after {} attempt(s), last error: {}",
                    attempts, last
                )
            }
        }
    }
}

impl Error for PollError {}

/// Drives the worker lifecycle: provision a host, poll its status endpoint
/// until a terminal phase, tear the host down, and retry the whole cycle
/// with a fresh host and token when it goes unresponsive.
pub struct Poller<P> {
    provider: P,
    config: PollerConfig,
    client: reqwest::Client,
}

impl<P: ComputeProvider> Poller<P> {
    pub fn new(provider: P, config: PollerConfig) -> Self {
        Poller {
            provider,
            config,
            client: reqwest::Client::new(),
        }
    }

    pub async fn run(&self) -> Result<WorkerStatus, PollError> {
        let mut last_error = String::from("no attempt was made");

        for attempt in 1..=self.config.max_attempts {
            let host = match self.acquire_host(attempt).await {
                Ok(host) => host,
                Err(err) => {
                    eprintln!("attempt {}: could not provision host: {}", attempt, err);
                    last_error = err.to_string();
                    continue;
                }
            };

            if let Err(err) = self.wait_running(&host).await {
                eprintln!("attempt {}: host {} never came up: {}", attempt, host.id, err);
                last_error = err.to_string();
                let _ = self.provider.delete_worker(&host).await;
                continue;
            }

            match self.poll_until_terminal(&host).await {
                Ok(status) => {
                    // Terminal phase observed: the host goes away no matter
                    // whether the worker succeeded
                    let _ = self.provider.delete_worker(&host).await;
                    return self.surface(status);
                }
                Err(err) => {
                    eprintln!("attempt {}: {}", attempt, err);
                    last_error = err.to_string();
                    let _ = self.provider.delete_worker(&host).await;
                }
            }
        }

        Err(PollError::AttemptsExhausted {
            attempts: self.config.max_attempts,
            last: last_error,
        })
    }

    /// Reuse an already-running host only on the first attempt; any host
    /// found on a retry is stale and gets discarded for a fresh one with a
    /// newly generated status token.
    async fn acquire_host(&self, attempt: u32) -> Result<WorkerHost, BoxError> {
        if let Some(existing) = self.provider.find_worker().await? {
            if attempt == 1 && self.provider.host_state(&existing).await? == HostState::Running {
                println!("reusing running worker host {}", existing.id);
                return Ok(existing);
            }
            self.provider.delete_worker(&existing).await?;
        }
        let token = new_status_token();
        let host = self.provider.create_worker(&token).await?;
        println!("created worker host {}", host.id);
        Ok(host)
    }

    async fn wait_running(&self, host: &WorkerHost) -> Result<(), BoxError> {
        let deadline = Instant::now() + self.config.start_timeout;
        loop {
            if self.provider.host_state(host).await? == HostState::Running {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err("timed out waiting for worker host to start".into());
            }
            tokio::time::sleep(self.config.state_poll_interval).await;
        }
    }

    /// Poll `/status` on a fixed interval. A single failed poll is routine;
    /// only an unbroken stretch of failures past the unresponsive threshold
    /// abandons the attempt.
    async fn poll_until_terminal(&self, host: &WorkerHost) -> Result<WorkerStatus, BoxError> {
        let mut last_success = Instant::now();
        loop {
            match self.poll_once(host).await {
                Ok(status) => {
                    last_success = Instant::now();
                    println!("{}", progress_line(&status));
                    if status.phase.is_terminal() {
                        return Ok(status);
                    }
                }
                Err(err) => {
                    eprintln!("status poll failed: {}", err);
                    if last_success.elapsed() > self.config.unresponsive_after {
                        return Err(format!(
                            "worker host {} unresponsive for over {}s",
                            host.id,
                            self.config.unresponsive_after.as_secs()
                        )
                        .into());
                    }
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn poll_once(&self, host: &WorkerHost) -> Result<WorkerStatus, BoxError> {
        let mut req = self
            .client
            .get(format!("{}/status", host.status_url))
            .timeout(POLL_TIMEOUT);
        if let Some(token) = &host.status_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?.error_for_status()?;
        Ok(resp.json::<WorkerStatus>().await?)
    }

    fn surface(&self, status: WorkerStatus) -> Result<WorkerStatus, PollError> {
        for skipped in status.skipped_results() {
            println!(
                "skipped {}: {}",
                skipped.file,
                skipped.reason.as_deref().unwrap_or("")
            );
        }
        if status.phase == Phase::Failed {
            return Err(PollError::WorkerFailed {
                error: status.error.clone(),
                failed: status.failed_results().into_iter().cloned().collect(),
            });
        }
        Ok(status)
    }
}

fn new_status_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FileResult;
    use crate::status::StatusHandle;
    use crate::worker::endpoint;
    use axum::Json;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn fast_config(max_attempts: u32) -> PollerConfig {
        PollerConfig {
            max_attempts,
            poll_interval: Duration::from_millis(20),
            state_poll_interval: Duration::from_millis(20),
            unresponsive_after: Duration::from_millis(150),
            start_timeout: Duration::from_millis(150),
        }
    }

    /// Control-plane stub backed by a real status endpoint (or a dead URL).
    struct MockProvider {
        status_url: String,
        existing: Option<WorkerHost>,
        state: HostState,
        /// Host id that never leaves `Starting`, overriding `state`.
        stalled_id: Option<String>,
        created: AtomicUsize,
        deleted: AtomicUsize,
        tokens: Mutex<Vec<String>>,
    }

    impl MockProvider {
        fn new(status_url: String) -> Self {
            MockProvider {
                status_url,
                existing: None,
                state: HostState::Running,
                stalled_id: None,
                created: AtomicUsize::new(0),
                deleted: AtomicUsize::new(0),
                tokens: Mutex::new(Vec::new()),
            }
        }
    }

    impl ComputeProvider for MockProvider {
        async fn find_worker(&self) -> Result<Option<WorkerHost>, BoxError> {
            Ok(self.existing.clone())
        }

        async fn create_worker(&self, status_token: &str) -> Result<WorkerHost, BoxError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            self.tokens.lock().unwrap().push(status_token.to_string());
            Ok(WorkerHost {
                id: format!("host-{}", n),
                status_url: self.status_url.clone(),
                status_token: Some(status_token.to_string()),
            })
        }

        async fn host_state(&self, host: &WorkerHost) -> Result<HostState, BoxError> {
            if self.stalled_id.as_deref() == Some(host.id.as_str()) {
                return Ok(HostState::Starting);
            }
            Ok(self.state)
        }

        async fn delete_worker(&self, _host: &WorkerHost) -> Result<(), BoxError> {
            self.deleted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Serve a real status endpoint whose token check accepts any of the
    /// tokens the provider hands out (the router is built without a token).
    async fn serve_status(status: StatusHandle) -> String {
        let app = endpoint::build_router(status, None);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[derive(Clone)]
    struct FlakyState {
        status: StatusHandle,
        failures_left: Arc<AtomicUsize>,
    }

    async fn flaky_status(State(state): State<FlakyState>) -> Response {
        if state.failures_left.load(Ordering::SeqCst) > 0 {
            state.failures_left.fetch_sub(1, Ordering::SeqCst);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        Json(state.status.snapshot()).into_response()
    }

    /// Status endpoint that answers the first `failures` polls with a 500
    /// before serving the real document.
    async fn serve_flaky_status(status: StatusHandle, failures: usize) -> String {
        let app = Router::new()
            .route("/status", get(flaky_status))
            .with_state(FlakyState {
                status,
                failures_left: Arc::new(AtomicUsize::new(failures)),
            });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_poller_success_path() {
        let status = StatusHandle::new();
        status.begin(1);
        status.push_result(FileResult::success("m1.bin"));
        status.finish();
        let base = serve_status(status).await;

        let provider = MockProvider::new(base);
        let poller = Poller::new(provider, fast_config(3));
        let final_status = poller.run().await.unwrap();

        assert_eq!(final_status.phase, Phase::Completed);
        assert_eq!(poller.provider.created.load(Ordering::SeqCst), 1);
        assert_eq!(poller.provider.deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_failure_is_surfaced() {
        let status = StatusHandle::new();
        status.begin(2);
        status.push_result(FileResult::success("good.bin"));
        status.push_result(FileResult::failed("bad.bin", "hash mismatch"));
        status.finish();
        let base = serve_status(status).await;

        let provider = MockProvider::new(base);
        let poller = Poller::new(provider, fast_config(3));
        let err = poller.run().await.unwrap_err();

        match &err {
            PollError::WorkerFailed { failed, .. } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].file, "bad.bin");
            }
            other => panic!("expected WorkerFailed, got {}", other),
        }
        assert!(err.to_string().contains("hash mismatch"));
        // The host is deleted even though the worker failed
        assert_eq!(poller.provider.deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_poll_failures_are_tolerated() {
        let status = StatusHandle::new();
        status.begin(1);
        status.push_result(FileResult::success("m1.bin"));
        status.finish();
        // Two failed polls back to back stay well under the threshold
        let base = serve_flaky_status(status, 2).await;

        let provider = MockProvider::new(base);
        let poller = Poller::new(provider, fast_config(3));
        let final_status = poller.run().await.unwrap();

        assert_eq!(final_status.phase, Phase::Completed);
        // The attempt survived the bad polls; no retry was needed
        assert_eq!(poller.provider.created.load(Ordering::SeqCst), 1);
        assert_eq!(poller.provider.deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_host_on_retry_is_discarded_and_recreated() {
        // Nothing answers /status, so every attempt goes unresponsive
        let dead = "http://127.0.0.1:1".to_string();
        let mut provider = MockProvider::new(dead.clone());
        provider.existing = Some(WorkerHost {
            id: "leftover".to_string(),
            status_url: dead,
            status_token: None,
        });
        let poller = Poller::new(provider, fast_config(2));
        let err = poller.run().await.unwrap_err();

        assert!(matches!(err, PollError::AttemptsExhausted { .. }));
        // Attempt 1 reused the running leftover host; attempt 2 found it
        // again, discarded it and created a fresh host with a new token
        assert_eq!(poller.provider.created.load(Ordering::SeqCst), 1);
        let tokens = poller.provider.tokens.lock().unwrap();
        assert_eq!(tokens.len(), 1);
        // Deleted: leftover after attempt 1, stale leftover at the start of
        // attempt 2, and the fresh host after attempt 2 fails
        assert_eq!(poller.provider.deleted.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_existing_host_not_running_is_recreated_on_first_attempt() {
        let status = StatusHandle::new();
        status.finish();
        let base = serve_status(status).await;

        let mut provider = MockProvider::new(base.clone());
        provider.existing = Some(WorkerHost {
            id: "wedged".to_string(),
            status_url: base,
            status_token: None,
        });
        provider.stalled_id = Some("wedged".to_string());
        let poller = Poller::new(provider, fast_config(3));
        let final_status = poller.run().await.unwrap();

        assert_eq!(final_status.phase, Phase::Completed);
        // The wedged host was not reusable even on the first attempt
        assert_eq!(poller.provider.created.load(Ordering::SeqCst), 1);
        assert_eq!(poller.provider.deleted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unresponsive_host_exhausts_attempts() {
        // Nothing listens on this port, so every poll fails
        let provider = MockProvider::new("http://127.0.0.1:1".to_string());
        let poller = Poller::new(provider, fast_config(2));
        let err = poller.run().await.unwrap_err();

        assert!(matches!(
            err,
            PollError::AttemptsExhausted { attempts: 2, .. }
        ));
        // Each attempt created one host and tore it down again
        assert_eq!(poller.provider.created.load(Ordering::SeqCst), 2);
        assert_eq!(poller.provider.deleted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_each_attempt_gets_a_fresh_token() {
        let provider = MockProvider::new("http://127.0.0.1:1".to_string());
        let poller = Poller::new(provider, fast_config(2));
        let _ = poller.run().await;

        let tokens = poller.provider.tokens.lock().unwrap();
        assert_eq!(tokens.len(), 2);
        assert_ne!(tokens[0], tokens[1]);
        assert_eq!(tokens[0].len(), 32);
    }

    #[tokio::test]
    async fn test_start_timeout_fails_the_attempt() {
        let mut provider = MockProvider::new("http://127.0.0.1:1".to_string());
        provider.state = HostState::Starting;
        let poller = Poller::new(provider, fast_config(1));
        let err = poller.run().await.unwrap_err();

        match err {
            PollError::AttemptsExhausted { last, .. } => {
                assert!(last.contains("timed out"), "last error was: {}", last);
            }
            other => panic!("expected AttemptsExhausted, got {}", other),
        }
        assert_eq!(poller.provider.deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_running_host_reused_on_first_attempt() {
        let status = StatusHandle::new();
        status.finish();
        let base = serve_status(status).await;

        let mut provider = MockProvider::new(base.clone());
        provider.existing = Some(WorkerHost {
            id: "pre-existing".to_string(),
            status_url: base,
            status_token: None,
        });
        let poller = Poller::new(provider, fast_config(3));
        let final_status = poller.run().await.unwrap();

        assert_eq!(final_status.phase, Phase::Completed);
        // The pre-existing host served the run; nothing was created
        assert_eq!(poller.provider.created.load(Ordering::SeqCst), 0);
        assert_eq!(poller.provider.deleted.load(Ordering::SeqCst), 1);
    }
}
