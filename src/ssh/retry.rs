//! Bounded retry of transport calls that report "would block".

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::error::Error;
use super::transport::{TransportError, TransportResult};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(5);

/// How long a single operation may keep retrying, and the pause between
/// attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

/// Why a retried call stopped without a value.
#[derive(Debug)]
pub(crate) enum RetryError {
    Transport(TransportError),
    TimedOut,
    Cancelled,
}

impl RetryError {
    /// Map to the public error. `map` handles hard transport failures.
    pub(crate) fn into_error(
        self,
        operation: &'static str,
        policy: &RetryPolicy,
        map: impl FnOnce(TransportError) -> Error,
    ) -> Error {
        match self {
            RetryError::Transport(e) => map(e),
            RetryError::TimedOut => Error::Timeout {
                operation,
                timeout: policy.timeout,
            },
            RetryError::Cancelled => Error::Cancelled(operation),
        }
    }
}

impl std::fmt::Display for RetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Transport(e) => e.fmt(f),
            RetryError::TimedOut => f.write_str("timed out"),
            RetryError::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Race an attempt loop against the policy timeout and the cancel token.
pub(crate) async fn drive<T, F>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    attempts: F,
) -> Result<T, RetryError>
where
    F: Future<Output = TransportResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RetryError::Cancelled),
        outcome = tokio::time::timeout(policy.timeout, attempts) => match outcome {
            Ok(result) => result.map_err(RetryError::Transport),
            Err(_) => Err(RetryError::TimedOut),
        },
    }
}

/// Re-issue a transport call for as long as it reports
/// [`TransportError::WouldBlock`], bounded by [`drive`].
///
/// The call expression is evaluated anew on every attempt, so it may borrow
/// handles mutably.
macro_rules! retry_on_block {
    ($policy:expr, $cancel:expr, $call:expr) => {{
        let policy: &$crate::ssh::retry::RetryPolicy = $policy;
        $crate::ssh::retry::drive(policy, $cancel, async {
            loop {
                match $call.await {
                    Err($crate::ssh::transport::TransportError::WouldBlock) => {
                        log::trace!("transport call would block, retrying");
                        tokio::time::sleep(policy.backoff).await;
                    }
                    other => break other,
                }
            }
        })
        .await
    }};
}

pub(crate) use retry_on_block;
