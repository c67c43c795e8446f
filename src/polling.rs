//! Polling session for providers backed by an asynchronous remote job.
//!
//! A provider submits a job, then polls its status at a fixed interval
//! until the job is ready, fails, or the attempt cap is reached:
//!
//! ```text
//! Submitted --submit ok--> InProgress --ready--> Ready
//!     |                     |  ^   |               ^
//!     |                     +--+   +--error / cap / deadline--> Failed
//!     +--ready (cached)----------------------------+
//!     +--error----------------------------------------------->  Failed
//! ```
//!
//! Polls are strictly sequential: attempt N+1 is only issued after the
//! response to attempt N has been observed.

use crate::error::{AnalysisError, TimeoutReason};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Fixed interval and attempt cap for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_attempts: 100,
        }
    }
}

impl From<&crate::config::PollingConfig> for PollingPolicy {
    fn from(config: &crate::config::PollingConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_seconds),
            max_attempts: config.max_attempts,
        }
    }
}

/// Status of a remote job as reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus<T> {
    /// Waiting on DNS resolution before the job actually starts.
    Dns,
    InProgress,
    Ready(T),
    /// Terminal failure with the provider's status message.
    Error(String),
}

impl<T> JobStatus<T> {
    fn label(&self) -> &'static str {
        match self {
            JobStatus::Dns => "DNS",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Ready(_) => "READY",
            JobStatus::Error(_) => "ERROR",
        }
    }
}

/// Remote side of a polling session.
#[async_trait]
pub trait JobPoller: Send + Sync {
    type Output: Send;

    /// Provider name used in error messages.
    fn service(&self) -> &str;

    /// Start the remote job.
    async fn submit(&self) -> Result<JobStatus<Self::Output>, AnalysisError>;

    /// Fetch the current job status.
    async fn poll(&self) -> Result<JobStatus<Self::Output>, AnalysisError>;
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Submitted,
    InProgress,
    Ready,
    Failed,
}

/// Payload of a session that reached `Ready`.
#[derive(Debug, Clone, PartialEq)]
pub struct Completed<T> {
    pub payload: T,
    /// Polls issued, the ready one included. Zero when the submission
    /// itself returned the result.
    pub attempts: u32,
}

/// Deadline and cancellation shared by everything one analysis awaits.
#[derive(Debug, Clone, Default)]
pub struct AnalysisContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels every session bound to the matching context.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl AnalysisContext {
    /// No deadline, not cancellable.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Attach an explicit cancellation handle.
    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (sender, receiver) = watch::channel(false);
        self.cancel = Some(receiver);
        (self, CancelHandle { sender })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check, used before issuing a poll.
    pub fn interruption(&self) -> Option<TimeoutReason> {
        if self
            .cancel
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
        {
            return Some(TimeoutReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(TimeoutReason::Deadline),
            _ => None,
        }
    }

    /// Resolves once the deadline passes or the analysis is cancelled.
    pub async fn interrupted(&self) -> TimeoutReason {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        let cancelled = async {
            match &self.cancel {
                Some(rx) => {
                    let mut rx = rx.clone();
                    while !*rx.borrow_and_update() {
                        if rx.changed().await.is_err() {
                            // handle dropped without cancelling
                            std::future::pending::<()>().await;
                        }
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => TimeoutReason::Cancelled,
            _ = deadline => TimeoutReason::Deadline,
        }
    }

    /// Run `fut` unless interrupted first. Interruption wins ties.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, TimeoutReason> {
        tokio::select! {
            biased;
            reason = self.interrupted() => Err(reason),
            output = fut => Ok(output),
        }
    }

    /// Run `fut`, polling it before the interruption so it can report
    /// its own, more precise, timeout.
    pub async fn backstop<F: Future>(&self, fut: F) -> Result<F::Output, TimeoutReason> {
        tokio::select! {
            biased;
            output = fut => Ok(output),
            reason = self.interrupted() => Err(reason),
        }
    }

    /// Sleep for `duration` unless interrupted first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TimeoutReason> {
        self.guard(tokio::time::sleep(duration)).await
    }
}

/// Bounded-retry state machine driving one remote job.
#[derive(Debug)]
pub struct PollingSession<'a> {
    policy: PollingPolicy,
    ctx: &'a AnalysisContext,
    state: SessionState,
    /// Number of the next poll, starting at 1.
    attempt: u32,
    last_status: Option<String>,
}

impl<'a> PollingSession<'a> {
    pub fn new(policy: PollingPolicy, ctx: &'a AnalysisContext) -> Self {
        Self {
            policy,
            ctx,
            state: SessionState::Submitted,
            attempt: 1,
            last_status: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Polls issued so far.
    pub fn attempts_made(&self) -> u32 {
        self.attempt - 1
    }

    /// Submit the job and poll it until a terminal state.
    pub async fn run<P>(&mut self, poller: &P) -> Result<Completed<P::Output>, AnalysisError>
    where
        P: JobPoller + ?Sized,
    {
        let submitted = match self.ctx.guard(poller.submit()).await {
            Ok(result) => result,
            Err(reason) => return Err(self.timeout(reason)),
        };

        match submitted {
            Err(e) => return Err(self.fail(e)),
            Ok(JobStatus::Error(message)) => {
                return Err(self.fail(AnalysisError::provider(poller.service(), message)))
            }
            Ok(JobStatus::Ready(payload)) => {
                info!("{} job ready on submission", poller.service());
                self.state = SessionState::Ready;
                return Ok(Completed {
                    payload,
                    attempts: 0,
                });
            }
            Ok(status) => {
                debug!("{} job submitted ({})", poller.service(), status.label());
                self.last_status = Some(status.label().to_string());
                self.state = SessionState::InProgress;
            }
        }

        loop {
            if self.attempt > self.policy.max_attempts {
                warn!(
                    "{} job still running after {} polls, giving up",
                    poller.service(),
                    self.attempts_made()
                );
                return Err(self.timeout(TimeoutReason::MaxAttempts(self.policy.max_attempts)));
            }
            if let Some(reason) = self.ctx.interruption() {
                return Err(self.timeout(reason));
            }

            let attempt = self.attempt;
            self.attempt += 1;
            debug!("{} poll {}/{}", poller.service(), attempt, self.policy.max_attempts);

            let polled = match self.ctx.guard(poller.poll()).await {
                Ok(result) => result,
                Err(reason) => return Err(self.timeout(reason)),
            };

            match polled {
                Ok(JobStatus::Ready(payload)) => {
                    info!("{} job ready after {} poll(s)", poller.service(), attempt);
                    self.state = SessionState::Ready;
                    return Ok(Completed {
                        payload,
                        attempts: attempt,
                    });
                }
                Ok(JobStatus::Error(message)) => {
                    return Err(self.fail(AnalysisError::provider(poller.service(), message)));
                }
                Ok(status) => {
                    self.last_status = Some(status.label().to_string());
                }
                Err(e) if e.is_transient() => {
                    warn!("{} poll {} failed, retrying: {}", poller.service(), attempt, e);
                    self.last_status = Some(e.to_string());
                }
                Err(e) => return Err(self.fail(e)),
            }

            if let Err(reason) = self.ctx.sleep(self.policy.interval).await {
                return Err(self.timeout(reason));
            }
        }
    }

    fn fail(&mut self, error: AnalysisError) -> AnalysisError {
        self.state = SessionState::Failed;
        error
    }

    fn timeout(&mut self, reason: TimeoutReason) -> AnalysisError {
        self.state = SessionState::Failed;
        AnalysisError::PollingTimeout {
            attempts: self.attempts_made(),
            reason,
            last_status: self.last_status.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    /// Replays scripted statuses; keeps returning in-progress once exhausted.
    struct ScriptedJob {
        submit: Mutex<Option<JobStatus<u32>>>,
        script: Mutex<VecDeque<JobStatus<u32>>>,
        polls: AtomicU32,
    }

    impl ScriptedJob {
        fn new(script: Vec<JobStatus<u32>>) -> Self {
            Self {
                submit: Mutex::new(Some(JobStatus::InProgress)),
                script: Mutex::new(script.into()),
                polls: AtomicU32::new(0),
            }
        }

        fn failing_submit(message: &str) -> Self {
            let job = Self::new(vec![]);
            *job.submit.lock().unwrap() = Some(JobStatus::Error(message.to_string()));
            job
        }

        fn ready_on_submit(payload: u32) -> Self {
            let job = Self::new(vec![JobStatus::Ready(1)]);
            *job.submit.lock().unwrap() = Some(JobStatus::Ready(payload));
            job
        }

        fn polls(&self) -> u32 {
            self.polls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobPoller for ScriptedJob {
        type Output = u32;

        fn service(&self) -> &str {
            "Scripted"
        }

        async fn submit(&self) -> Result<JobStatus<u32>, AnalysisError> {
            Ok(self
                .submit
                .lock()
                .unwrap()
                .take()
                .unwrap_or(JobStatus::InProgress))
        }

        async fn poll(&self) -> Result<JobStatus<u32>, AnalysisError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(JobStatus::InProgress))
        }
    }

    fn policy(max_attempts: u32) -> PollingPolicy {
        PollingPolicy {
            interval: Duration::from_secs(10),
            max_attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_in_progress() {
        let job = ScriptedJob::new(vec![
            JobStatus::Dns,
            JobStatus::InProgress,
            JobStatus::Ready(87),
        ]);
        let ctx = AnalysisContext::new();
        let mut session = PollingSession::new(policy(5), &ctx);

        let completed = assert_ok!(session.run(&job).await);
        assert_eq!(completed.payload, 87);
        assert_eq!(completed.attempts, 3);
        assert_eq!(job.polls(), 3);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_after_exactly_max_attempts() {
        let job = ScriptedJob::new(vec![]);
        let ctx = AnalysisContext::new();
        let mut session = PollingSession::new(policy(4), &ctx);

        let err = assert_err!(session.run(&job).await);
        assert!(err.is_timeout());
        assert_eq!(err.attempts(), Some(4));
        assert_eq!(job.polls(), 4);
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_error_is_terminal() {
        let job = ScriptedJob::new(vec![
            JobStatus::InProgress,
            JobStatus::Error("ERROR: Unable to connect to the server".to_string()),
            JobStatus::Ready(100),
        ]);
        let ctx = AnalysisContext::new();
        let mut session = PollingSession::new(policy(10), &ctx);

        let err = assert_err!(session.run(&job).await);
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("Unable to connect"));
        assert_eq!(job.polls(), 2);
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_error_never_polls() {
        let job = ScriptedJob::failing_submit("ERROR: invalid host");
        let ctx = AnalysisContext::new();
        let mut session = PollingSession::new(policy(10), &ctx);

        assert_err!(session.run(&job).await);
        assert_eq!(job.polls(), 0);
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_result_on_submit_skips_polling() {
        let job = ScriptedJob::ready_on_submit(92);
        let ctx = AnalysisContext::new();
        let mut session = PollingSession::new(policy(10), &ctx);

        let completed = assert_ok!(session.run(&job).await);
        assert_eq!(completed.payload, 92);
        assert_eq!(completed.attempts, 0);
        assert_eq!(job.polls(), 0);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_polling() {
        let job = ScriptedJob::new(vec![]);
        // polls at t=0, 10, 20; deadline hits while sleeping towards t=30
        let ctx = AnalysisContext::new().with_timeout(Duration::from_secs(25));
        let mut session = PollingSession::new(policy(100), &ctx);

        let err = assert_err!(session.run(&job).await);
        match err {
            AnalysisError::PollingTimeout {
                attempts, reason, ..
            } => {
                assert_eq!(reason, TimeoutReason::Deadline);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(job.polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let job = ScriptedJob::new(vec![]);
        let (ctx, handle) = AnalysisContext::new().cancellable();
        let mut session = PollingSession::new(policy(100), &ctx);

        let run = session.run(&job);
        let cancel = async {
            tokio::time::sleep(Duration::from_secs(15)).await;
            handle.cancel();
        };
        let (result, _) = tokio::join!(run, cancel);

        let err = assert_err!(result);
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(job.polls(), 2);
    }

    #[test]
    fn test_default_policy() {
        let policy = PollingPolicy::default();
        assert_eq!(policy.interval, Duration::from_secs(10));
        assert_eq!(policy.max_attempts, 100);
    }

    #[tokio::test]
    async fn test_interruption_without_deadline() {
        let ctx = AnalysisContext::new();
        assert_eq!(ctx.interruption(), None);
        assert_eq!(ctx.guard(async { 5 }).await, Ok(5));
    }
}
