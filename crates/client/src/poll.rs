//! Fixed-interval polling with deadline and health check.
//!
//! Every wait in the orchestrator goes through [`poll_until`] or
//! [`poll_until_healthy`]:
//!
//! 1. Invoke the probe.
//! 2. If the probe reports [`PollState::Ready`], return its value.
//! 3. If the deadline has passed, fail with [`ClientError::Timeout`] carrying the state the probe
//!    last reported.
//! 4. Otherwise run the health check (if any). Its failure aborts the wait immediately, so a node
//!    that crashed mid-wait fails fast instead of spinning until the deadline.
//! 5. Sleep for the poll interval and go to 1.
//!
//! The error type is generic so that callers can fail probes and health
//! checks with their own errors; deadlines are converted from
//! [`ClientError::Timeout`]. Probe errors abort the wait. Read-only probes are expected to map
//! transient failures (connection refused while a node boots, 5xx) to
//! [`PollState::Pending`] themselves.

use std::{future::Future, time::Duration};

use consortium_types::config::TimeoutConfig;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::error::{ClientError, Result, TimeoutSnafu};

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState<T> {
    /// Condition holds; polling stops with this value.
    Ready(T),
    /// Condition does not hold yet; carries the observed state for diagnostics.
    Pending(String),
}

impl<T> PollState<T> {
    /// Creates a pending state from anything printable.
    pub fn pending(state: impl std::fmt::Display) -> Self {
        PollState::Pending(state.to_string())
    }

    /// Maps the ready value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> PollState<U> {
        match self {
            PollState::Ready(value) => PollState::Ready(f(value)),
            PollState::Pending(state) => PollState::Pending(state),
        }
    }
}

/// Deadline and interval of one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Total time to wait before failing.
    pub timeout: Duration,
    /// Sleep between probe attempts.
    pub interval: Duration,
}

impl PollPolicy {
    /// Creates a policy.
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Creates a policy using the configured poll interval.
    pub const fn with_timeout(timeouts: &TimeoutConfig, timeout: Duration) -> Self {
        Self { timeout, interval: timeouts.poll_interval }
    }
}

/// Polls `probe` until it is ready or `policy.timeout` elapses.
///
/// # Errors
///
/// Returns [`ClientError::Timeout`] (converted into `E`) when the deadline
/// passes, or the probe's own error.
pub async fn poll_until<T, E, P, Fut>(what: &str, policy: PollPolicy, probe: P) -> Result<T, E>
where
    E: From<ClientError>,
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<PollState<T>, E>>,
{
    poll_until_healthy(what, policy, probe, || std::future::ready(Ok(()))).await
}

/// Polls `probe` until it is ready, running `health_check` before each retry.
///
/// # Errors
///
/// Returns [`ClientError::Timeout`] (converted into `E`) when the deadline
/// passes, the health check's error (typically
/// [`ClientError::NodeUnhealthy`]), or the probe's own error.
pub async fn poll_until_healthy<T, E, P, Fut, H, HFut>(
    what: &str,
    policy: PollPolicy,
    mut probe: P,
    mut health_check: H,
) -> Result<T, E>
where
    E: From<ClientError>,
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<PollState<T>, E>>,
    H: FnMut() -> HFut,
    HFut: Future<Output = Result<(), E>>,
{
    let start = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let last_state = match probe().await? {
            PollState::Ready(value) => return Ok(value),
            PollState::Pending(state) => state,
        };

        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            return Err(TimeoutSnafu { what, elapsed, last_state }.build().into());
        }

        debug!(what, attempt, state = %last_state, "Condition not met, retrying");
        health_check().await?;
        sleep(policy.interval).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    fn policy() -> PollPolicy {
        PollPolicy::new(Duration::from_secs(5), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_first_probe() {
        let value = poll_until::<_, ClientError, _, _>("first", policy(), || async { Ok(PollState::Ready(7)) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let value = poll_until::<_, ClientError, _, _>("third", policy(), move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n >= 2 { Ok(PollState::Ready(n)) } else { Ok(PollState::pending("booting")) }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_carries_last_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let err = poll_until::<(), ClientError, _, _>("never", policy(), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(PollState::Pending(format!("attempt {n}"))) }
        })
        .await
        .unwrap_err();

        match err {
            ClientError::Timeout { what, elapsed, last_state } => {
                assert_eq!(what, "never");
                assert!(elapsed >= Duration::from_secs(5));
                let attempts = calls.load(Ordering::SeqCst);
                assert_eq!(last_state, format!("attempt {}", attempts - 1));
            },
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_failure_aborts_before_deadline() {
        let started = Instant::now();
        let err = poll_until_healthy::<(), ClientError, _, _, _, _>(
            "crashing node",
            policy(),
            || async { Ok(PollState::pending("Pending")) },
            || async {
                Err(ClientError::NodeUnhealthy {
                    node: "net-1".to_owned(),
                    detail: "ContainerExited".to_owned(),
                })
            },
        )
        .await
        .unwrap_err();

        assert!(err.is_node_unhealthy(), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_not_run_when_ready() {
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&checks);
        poll_until_healthy::<_, ClientError, _, _, _, _>(
            "ready",
            policy(),
            || async { Ok(PollState::Ready(())) },
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await
        .unwrap();
        assert_eq!(checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_aborts() {
        let err = poll_until::<(), ClientError, _, _>("bad", policy(), || async {
            Err(ClientError::Signing { message: "no key".to_owned() })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ClientError::Signing { .. }));
    }
}
