//! Per-call cancellation and deadlines
//!
//! Every decider, reporter and resolver call receives a [`CallContext`]. Clones
//! share the cancellation signal; derived contexts can only shorten the
//! deadline, never extend it.

use crate::error::WardenError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cancellation signal plus optional deadline
#[derive(Debug, Clone)]
pub struct CallContext {
    cancel: Arc<watch::Sender<bool>>,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Context that is never cancelled and has no deadline
    pub fn background() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            cancel: Arc::new(tx),
            deadline: None,
        }
    }

    /// Fresh context that expires after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            ..Self::background()
        }
    }

    /// Derived context sharing cancellation, expiring after `timeout` at the latest
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            cancel: Arc::clone(&self.cancel),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and every clone of it
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Whether `cancel` was called
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Error describing why the context is done, `None` while it is live
    pub fn err(&self) -> Option<WardenError> {
        if self.is_cancelled() {
            return Some(WardenError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(WardenError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn done(&self) -> WardenError {
        let mut rx = self.cancel.subscribe();
        let cancelled = async move {
            if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = cancelled => WardenError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => WardenError::DeadlineExceeded,
            },
            None => {
                cancelled.await;
                WardenError::Cancelled
            }
        }
    }

    /// Drive `fut` until it completes or the context is done
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, WardenError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}
