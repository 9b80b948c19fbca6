//! Per-call execution context
//!
//! Every operation of the token authority receives a [`CallContext`] built by the
//! inbound layer. It carries the request id used in log lines, an optional
//! deadline and a cancellation token. Every remote call (keyed store, user
//! service) is executed through [`CallContext::run`] so that the inbound
//! request's budget bounds all of its outbound work.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Reasons a remote call was abandoned before completing
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupted {
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("call cancelled")]
    Cancelled,
}

/// Deadline, cancellation and correlation id for one inbound call
#[derive(Debug, Clone)]
pub struct CallContext {
    request_id: String,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl CallContext {
    /// Context without deadline, with a freshly generated request id
    pub fn background() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Context whose deadline is `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// Set the request id (e.g. from an `X-Request-ID` header)
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Set the deadline to `timeout` from now.
    ///
    /// A timeout too large to represent as an instant leaves the call unbounded.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    /// Attach an externally owned cancellation token
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Same request id, fresh deadline, no cancellation.
    ///
    /// Cleanup after a failed call must still run when the inbound budget is spent.
    pub fn detached(&self, timeout: Duration) -> Self {
        Self {
            request_id: self.request_id.clone(),
            deadline: Instant::now().checked_add(timeout),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.request_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Run `fut` bounded by this context's deadline and cancellation token.
    ///
    /// The future is dropped as soon as either fires; the call is never retried.
    pub async fn run<F, T, E>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<Interrupted>,
    {
        if self.cancellation.is_cancelled() {
            return Err(Interrupted::Cancelled.into());
        }

        let bounded = async {
            match self.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(Interrupted::DeadlineExceeded.into()),
                },
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(Interrupted::Cancelled.into()),
            result = bounded => result,
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}
