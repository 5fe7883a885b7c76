//! Bounded-concurrency session dispatch against the text-generation service
//! (the RUN stage).
//!
//! The service is untrusted: it can time out, rate-limit, or silently
//! degrade. Every trial's raw response (or a failure marker) is written to
//! disk before any parsing happens, so a later failure downstream never
//! re-incurs API cost. The caller injects a [`CompletionClient`]; tests run
//! against deterministic stubs.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::domain::{ExperimentConfig, Result};
use crate::layout::ReplicationPaths;
use crate::manifest::TrialManifest;

/// Replication halts when at least this fraction of trials fail.
pub const FAILURE_RATE_HALT: f64 = 0.5;

/// At or above this failure rate the signature points at a misconfiguration
/// (wrong model id, bad credentials) rather than service flakiness.
pub const MISCONFIGURATION_RATE: f64 = 0.95;

/// Transport-level failures for a single completion call.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SessionError {
    #[error("authorization rejected by the service")]
    Unauthorized,

    #[error("rate limited by the service")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("service returned server error {status}")]
    ServerError { status: u16 },

    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("malformed service response: {0}")]
    MalformedResponse(String),
}

impl SessionError {
    /// Transient failures are retried per call; the rest fail fast.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::RateLimited { .. }
                | SessionError::ServerError { .. }
                | SessionError::Timeout { .. }
                | SessionError::Transport(_)
        )
    }
}

/// Async seam to the external text-generation service.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> std::result::Result<String, SessionError>;
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f64,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageContent,
}

#[derive(Deserialize)]
struct ChatMessageContent {
    content: String,
}

/// Production client: HTTP chat-completions with model id, temperature and
/// max-token parameters.
pub struct HttpCompletionClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl HttpCompletionClient {
    pub const DEFAULT_ENDPOINT: &'static str = "https://openrouter.ai/api/v1/chat/completions";
    const REQUEST_TIMEOUT_SECS: u64 = 120;

    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, config: &ExperimentConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, prompt: &str) -> std::result::Result<String, SessionError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: false,
        };

        let response = tokio::time::timeout(
            Duration::from_secs(Self::REQUEST_TIMEOUT_SECS),
            self.http
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send(),
        )
        .await
        .map_err(|_| SessionError::Timeout {
            secs: Self::REQUEST_TIMEOUT_SECS,
        })?
        .map_err(|e| SessionError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        match status.as_u16() {
            200..=299 => {}
            401 | 403 => return Err(SessionError::Unauthorized),
            429 => return Err(SessionError::RateLimited { retry_after_secs: None }),
            s if s >= 500 => return Err(SessionError::ServerError { status: s }),
            s => return Err(SessionError::Transport(format!("unexpected status {s}: {text}"))),
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| SessionError::MalformedResponse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| SessionError::MalformedResponse("response has no choices".to_string()))
    }
}

/// Per-call retry policy: transient failures are retried with exponential
/// backoff before being recorded as a trial failure (not a pipeline failure).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Durable marker written when a trial exhausts its call retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialFailure {
    pub trial_index: usize,
    pub error: String,
    pub attempts: u32,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// Actionable diagnosis attached to a halted batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchHint {
    /// ~100% failure: check model identifier and credentials.
    LikelyMisconfiguration,
    /// Partial failure: the service is degraded; retry later.
    ServiceDegradation,
}

impl BatchHint {
    pub fn remediation(&self) -> &'static str {
        match self {
            BatchHint::LikelyMisconfiguration => {
                "nearly every call failed: verify the model identifier and API credentials before re-running"
            }
            BatchHint::ServiceDegradation => {
                "the service appears degraded: wait and re-run repair to re-issue only the failed trials"
            }
        }
    }
}

/// Classify a trial failure rate. `None` below the halt threshold.
pub fn classify_failure_rate(rate: f64) -> Option<BatchHint> {
    if rate < FAILURE_RATE_HALT {
        None
    } else if rate >= MISCONFIGURATION_RATE {
        Some(BatchHint::LikelyMisconfiguration)
    } else {
        Some(BatchHint::ServiceDegradation)
    }
}

/// Outcome of one session batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchVerdict {
    /// Failure fraction stayed below [`FAILURE_RATE_HALT`].
    Completed { n_trials: usize, n_failed: usize },
    /// Failure fraction crossed the threshold; the replication halts.
    Halted {
        n_trials: usize,
        n_failed: usize,
        failure_rate: f64,
        hint: BatchHint,
    },
}

/// Dispatches trial prompts with bounded parallelism and durable recording.
pub struct SessionManager {
    client: Arc<dyn CompletionClient>,
    max_parallel: usize,
    retry: RetryPolicy,
    cancel: Option<watch::Receiver<bool>>,
}

impl SessionManager {
    pub fn new(client: Arc<dyn CompletionClient>, max_parallel: usize) -> Self {
        Self {
            client,
            max_parallel: max_parallel.max(1),
            retry: RetryPolicy::default(),
            cancel: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Install a cancellation channel; setting it to `true` skips trials
    /// that have not yet issued their call and aborts calls already in
    /// flight. Already-written trial files are never touched.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run every manifest trial that lacks a stored response.
    ///
    /// Trials that already have a non-empty raw response file are skipped —
    /// this is what makes a RESPONSE_ISSUE repair minimal-cost. Each trial's
    /// outcome is synchronously written before the batch verdict is computed,
    /// so a crash mid-batch leaves a consistent, auditable partial state.
    pub async fn run_batch(
        &self,
        manifest: &TrialManifest,
        paths: &ReplicationPaths,
    ) -> Result<BatchVerdict> {
        paths.ensure_dirs()?;

        let pending: Vec<_> = manifest
            .trials
            .iter()
            .filter(|t| !paths.has_stored_response(t.index))
            .map(|t| (t.index, t.prompt.clone()))
            .collect();

        info!(
            total = manifest.trials.len(),
            pending = pending.len(),
            max_parallel = self.max_parallel,
            "dispatching session batch"
        );

        let sem = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = Vec::with_capacity(pending.len());

        for (trial_index, prompt) in pending {
            let client = Arc::clone(&self.client);
            let sem = Arc::clone(&sem);
            let retry = self.retry;
            let cancel = self.cancel.clone();
            let paths = paths.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();

                let mut cancel = cancel;
                if cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false) {
                    debug!(trial_index, "trial skipped: batch cancelled");
                    return;
                }

                let call = call_with_retry(client.as_ref(), &prompt, retry);
                let result = match cancel.as_mut() {
                    Some(rx) => {
                        tokio::select! {
                            r = call => r,
                            _ = cancelled(rx) => {
                                debug!(trial_index, "trial aborted: batch cancelled mid-call");
                                return;
                            }
                        }
                    }
                    None => call.await,
                };

                match result {
                    Ok(text) => {
                        if let Err(e) = record_response(&paths, trial_index, &text) {
                            warn!(trial_index, error = %e, "failed to record response");
                        }
                    }
                    Err((error, attempts)) => {
                        warn!(trial_index, attempts, error = %error, "trial failed");
                        let marker = TrialFailure {
                            trial_index,
                            error: error.to_string(),
                            attempts,
                            recorded_at: chrono::Utc::now(),
                        };
                        if let Err(e) = record_failure(&paths, &marker) {
                            warn!(trial_index, error = %e, "failed to record failure marker");
                        }
                    }
                }
            }));
        }

        for task in tasks {
            // A panicked worker counts as an unrecorded trial failure.
            let _ = task.await;
        }

        let n_trials = manifest.trials.len();
        let n_failed = manifest
            .trials
            .iter()
            .filter(|t| !paths.has_stored_response(t.index))
            .count();
        let failure_rate = n_failed as f64 / n_trials.max(1) as f64;

        match classify_failure_rate(failure_rate) {
            Some(hint) => {
                warn!(n_failed, n_trials, failure_rate, ?hint, "session batch halted");
                Ok(BatchVerdict::Halted {
                    n_trials,
                    n_failed,
                    failure_rate,
                    hint,
                })
            }
            None => {
                info!(n_failed, n_trials, "session batch completed");
                Ok(BatchVerdict::Completed { n_trials, n_failed })
            }
        }
    }
}

/// Resolves only once the cancellation flag flips to `true`. A dropped
/// sender never cancels anything.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|&c| c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn call_with_retry(
    client: &dyn CompletionClient,
    prompt: &str,
    retry: RetryPolicy,
) -> std::result::Result<String, (SessionError, u32)> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.complete(prompt).await {
            Ok(text) => return Ok(text),
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                let backoff = match &e {
                    SessionError::RateLimited {
                        retry_after_secs: Some(secs),
                    } => Duration::from_secs(*secs),
                    _ => retry.backoff(attempt),
                };
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "retrying call");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err((e, attempt)),
        }
    }
}

/// Write the raw response text and clear any stale failure marker.
fn record_response(paths: &ReplicationPaths, trial_index: usize, text: &str) -> Result<()> {
    fs::write(paths.response_file(trial_index), text)?;
    let marker = paths.failure_file(trial_index);
    if marker.exists() {
        fs::remove_file(marker)?;
    }
    Ok(())
}

fn record_failure(paths: &ReplicationPaths, marker: &TrialFailure) -> Result<()> {
    let body = serde_json::to_string_pretty(marker)?;
    fs::write(paths.failure_file(marker.trial_index), body)?;
    Ok(())
}

/// Load the failure marker for a trial, if present.
pub fn load_failure(paths: &ReplicationPaths, trial_index: usize) -> Option<TrialFailure> {
    let body = fs::read_to_string(paths.failure_file(trial_index)).ok()?;
    serde_json::from_str(&body).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::IdentityCorpus;
    use crate::manifest::build_manifest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manifest(num_trials: usize) -> TrialManifest {
        let body: String = (0..12)
            .map(|i| format!("P{i}\tDescription {i}.\n"))
            .collect();
        let corpus = IdentityCorpus::from_str(&body).expect("corpus");
        let config = ExperimentConfig {
            group_size: 3,
            num_trials,
            ..Default::default()
        };
        build_manifest(&config, 1, &corpus).expect("manifest")
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
        }
    }

    struct StubClient {
        calls: AtomicUsize,
        /// Calls whose (1-based) global sequence number is in this list fail.
        fail_on: fn(usize) -> bool,
    }

    impl StubClient {
        fn new(fail_on: fn(usize) -> bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on,
            }
        }
    }

    #[async_trait]
    impl CompletionClient for StubClient {
        async fn complete(&self, _prompt: &str) -> std::result::Result<String, SessionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if (self.fail_on)(n) {
                Err(SessionError::ServerError { status: 503 })
            } else {
                Ok("1 2 3\n4 5 6\n7 8 9\n".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_batch_completes_and_records_responses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = ReplicationPaths::for_dir(dir.path());
        let manifest = manifest(4);

        let client = Arc::new(StubClient::new(|_| false));
        let manager = SessionManager::new(client, 2).with_retry(fast_retry());
        let verdict = manager.run_batch(&manifest, &paths).await.expect("batch");

        assert_eq!(verdict, BatchVerdict::Completed { n_trials: 4, n_failed: 0 });
        for trial in &manifest.trials {
            assert!(paths.has_stored_response(trial.index));
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = ReplicationPaths::for_dir(dir.path());
        let manifest = manifest(1);

        // First call fails, retry succeeds.
        let client = Arc::new(StubClient::new(|n| n == 1));
        let manager = SessionManager::new(client.clone(), 1).with_retry(fast_retry());
        let verdict = manager.run_batch(&manifest, &paths).await.expect("batch");

        assert_eq!(verdict, BatchVerdict::Completed { n_trials: 1, n_failed: 0 });
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_total_failure_halts_with_misconfiguration_hint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = ReplicationPaths::for_dir(dir.path());
        let manifest = manifest(4);

        let client = Arc::new(StubClient::new(|_| true));
        let manager = SessionManager::new(client, 2).with_retry(fast_retry());
        let verdict = manager.run_batch(&manifest, &paths).await.expect("batch");

        match verdict {
            BatchVerdict::Halted { n_failed, hint, .. } => {
                assert_eq!(n_failed, 4);
                assert_eq!(hint, BatchHint::LikelyMisconfiguration);
            }
            other => panic!("expected Halted, got {other:?}"),
        }
        // Failure markers are durable.
        let failure = load_failure(&paths, manifest.trials[0].index).expect("marker");
        assert_eq!(failure.attempts, 3);
    }

    #[tokio::test]
    async fn test_stored_responses_are_never_reissued() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = ReplicationPaths::for_dir(dir.path());
        let manifest = manifest(3);
        paths.ensure_dirs().expect("dirs");

        // Two trials already paid for.
        std::fs::write(paths.response_file(manifest.trials[0].index), "stored A").unwrap();
        std::fs::write(paths.response_file(manifest.trials[1].index), "stored B").unwrap();

        let client = Arc::new(StubClient::new(|_| false));
        let manager = SessionManager::new(client.clone(), 2).with_retry(fast_retry());
        let verdict = manager.run_batch(&manifest, &paths).await.expect("batch");

        assert_eq!(verdict, BatchVerdict::Completed { n_trials: 3, n_failed: 0 });
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        // Stored content untouched.
        let body = std::fs::read_to_string(paths.response_file(manifest.trials[0].index)).unwrap();
        assert_eq!(body, "stored A");
    }

    #[tokio::test]
    async fn test_cancellation_leaves_consistent_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = ReplicationPaths::for_dir(dir.path());
        let manifest = manifest(4);

        let (tx, rx) = watch::channel(true); // cancelled before start
        let client = Arc::new(StubClient::new(|_| false));
        let manager = SessionManager::new(client.clone(), 2)
            .with_retry(fast_retry())
            .with_cancellation(rx);
        let verdict = manager.run_batch(&manifest, &paths).await.expect("batch");
        drop(tx);

        // Nothing issued, nothing written: the batch reads as fully failed
        // but every trial is safely resumable.
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(verdict, BatchVerdict::Halted { .. }));
        for trial in &manifest.trials {
            assert!(!trial.prompt.is_empty());
            assert!(!paths.is_recorded(trial.index));
        }
    }

    #[tokio::test]
    async fn test_cancellation_aborts_in_flight_calls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = ReplicationPaths::for_dir(dir.path());
        let manifest = manifest(2);

        // Never returns: the batch can only finish if in-flight calls are
        // actually aborted rather than awaited to completion.
        struct StalledClient;
        #[async_trait]
        impl CompletionClient for StalledClient {
            async fn complete(&self, _prompt: &str) -> std::result::Result<String, SessionError> {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }

        let (tx, rx) = watch::channel(false);
        let manager = SessionManager::new(Arc::new(StalledClient), 2)
            .with_retry(fast_retry())
            .with_cancellation(rx);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        let verdict = tokio::time::timeout(
            Duration::from_secs(5),
            manager.run_batch(&manifest, &paths),
        )
        .await
        .expect("batch must unblock on cancellation")
        .expect("batch");

        assert!(matches!(verdict, BatchVerdict::Halted { .. }));
        for trial in &manifest.trials {
            assert!(!paths.is_recorded(trial.index));
        }
    }

    #[test]
    fn test_classify_failure_rate() {
        assert_eq!(classify_failure_rate(0.0), None);
        assert_eq!(classify_failure_rate(0.4), None);
        assert_eq!(classify_failure_rate(0.5), Some(BatchHint::ServiceDegradation));
        assert_eq!(classify_failure_rate(0.6), Some(BatchHint::ServiceDegradation));
        assert_eq!(classify_failure_rate(0.95), Some(BatchHint::LikelyMisconfiguration));
        assert_eq!(classify_failure_rate(1.0), Some(BatchHint::LikelyMisconfiguration));
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn test_unauthorized_is_not_retryable() {
        assert!(!SessionError::Unauthorized.is_retryable());
        assert!(!SessionError::MalformedResponse("x".into()).is_retryable());
        assert!(SessionError::RateLimited { retry_after_secs: None }.is_retryable());
        assert!(SessionError::Timeout { secs: 120 }.is_retryable());
    }
}
