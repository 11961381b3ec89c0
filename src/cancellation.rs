// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Cooperative cancellation shared by every request of one dispatcher call.
//!
//! A [`CancellationSupport`] is cloned into each per-server request. The
//! client races every request against [`CancellationSupport::cancelled`] and
//! sends `$/cancelRequest` when it loses. Hosts that only offer a polling
//! "is cancelled" check drive a request with [`wait_until_done`] or
//! [`block_until_done`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{LspError, LspResult};
use crate::lsp::protocol::RequestId;

/// Interval at which a host cancellation check is polled.
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A request currently in flight under a [`CancellationSupport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Definition id of the server handling the request.
    pub server_id: String,
    /// LSP method name.
    pub method: String,
    /// JSON-RPC id on the wire.
    pub request_id: RequestId,
}

struct Inner {
    signal: watch::Sender<bool>,
    pending: Mutex<Vec<(u64, PendingRequest)>>,
    next_token: AtomicU64,
}

/// Shared cancellation signal plus the requests it governs.
#[derive(Clone)]
pub struct CancellationSupport {
    inner: Arc<Inner>,
}

impl Default for CancellationSupport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSupport")
            .field("cancelled", &self.is_cancelled())
            .field("pending", &self.pending_requests().len())
            .finish()
    }
}

impl CancellationSupport {
    /// Creates an uncancelled signal.
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                signal,
                pending: Mutex::new(Vec::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Signals cancellation. Idempotent.
    pub fn cancel(&self) {
        let was_cancelled = self.inner.signal.send_replace(true);
        if !was_cancelled {
            debug!(
                "Cancelling {} in-flight request(s)",
                self.pending_requests().len()
            );
        }
    }

    /// Whether cancellation was signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.inner.signal.borrow()
    }

    /// Resolves once cancellation is signalled.
    pub async fn cancelled(&self) {
        let mut receiver = self.inner.signal.subscribe();
        // The sender lives in `inner`, so this only returns on cancel.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Fails with [`LspError::Cancelled`] once cancellation was signalled.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::Cancelled`] after [`CancellationSupport::cancel`].
    pub fn check(&self) -> LspResult<()> {
        if self.is_cancelled() {
            Err(LspError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Records an in-flight request until the returned guard drops.
    #[must_use]
    pub fn track(&self, request: PendingRequest) -> PendingGuard {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((token, request));
        PendingGuard {
            inner: Arc::clone(&self.inner),
            token,
        }
    }

    /// Snapshot of the requests in flight.
    #[must_use]
    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }
}

/// Removes its request from the pending list on drop.
pub struct PendingGuard {
    inner: Arc<Inner>,
    token: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(token, _)| *token != self.token);
    }
}

/// Host-side cancellation check.
pub trait CancelChecker: Send + Sync {
    /// Returns true once the host wants the operation abandoned.
    fn is_cancelled(&self) -> bool;
}

impl CancelChecker for CancellationSupport {
    fn is_cancelled(&self) -> bool {
        Self::is_cancelled(self)
    }
}

impl<F> CancelChecker for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_cancelled(&self) -> bool {
        self()
    }
}

/// Drives `future` to completion, polling `checker` every [`POLL_INTERVAL`].
///
/// When the checker reports cancellation, `support` is cancelled and the
/// future is awaited once more so it can wind down (its requests send
/// `$/cancelRequest` and it resolves to [`LspError::Cancelled`]). `future`
/// must observe `support` for that to terminate.
///
/// # Errors
///
/// Returns whatever `future` returns, typically [`LspError::Cancelled`] after
/// a host cancellation.
pub async fn wait_until_done<F, T, C>(future: F, support: &CancellationSupport, checker: &C) -> LspResult<T>
where
    F: Future<Output = LspResult<T>>,
    C: CancelChecker + ?Sized,
{
    tokio::pin!(future);
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            result = &mut future => return result,
            _ = tick.tick() => {
                if checker.is_cancelled() {
                    support.cancel();
                    return future.await;
                }
            }
        }
    }
}

/// Blocking form of [`wait_until_done`] for host threads outside the runtime.
///
/// Must not be called from within an async context of `handle`'s runtime.
///
/// # Errors
///
/// Same as [`wait_until_done`].
pub fn block_until_done<F, T, C>(
    handle: &Handle,
    future: F,
    support: &CancellationSupport,
    checker: &C,
) -> LspResult<T>
where
    F: Future<Output = LspResult<T>>,
    C: CancelChecker + ?Sized,
{
    handle.block_on(wait_until_done(future, support, checker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[tokio::test]
    async fn test_cancel_wakes_waiters() -> anyhow::Result<()> {
        let support = CancellationSupport::new();
        let waiter = {
            let support = support.clone();
            tokio::spawn(async move { support.cancelled().await })
        };
        assert!(!support.is_cancelled());
        support.cancel();
        support.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter).await??;
        assert!(support.check().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() -> anyhow::Result<()> {
        let support = CancellationSupport::new();
        support.cancel();
        tokio::time::timeout(Duration::from_millis(100), support.cancelled()).await?;
        Ok(())
    }

    #[test]
    fn test_pending_tracking() {
        let support = CancellationSupport::new();
        let first = support.track(PendingRequest {
            server_id: "a".to_string(),
            method: "textDocument/hover".to_string(),
            request_id: RequestId::Number(1),
        });
        let _second = support.track(PendingRequest {
            server_id: "b".to_string(),
            method: "textDocument/hover".to_string(),
            request_id: RequestId::Number(1),
        });
        assert_eq!(support.pending_requests().len(), 2);
        drop(first);
        let pending = support.pending_requests();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].server_id, "b");
    }

    #[tokio::test]
    async fn test_wait_until_done_returns_result() -> anyhow::Result<()> {
        let support = CancellationSupport::new();
        let never = || false;
        let value = wait_until_done(async { Ok(7) }, &support, &never).await?;
        assert_eq!(value, 7);
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_until_done_cancels_on_host_signal() {
        let support = CancellationSupport::new();
        let polls = AtomicUsize::new(0);
        let checker = || polls.fetch_add(1, Ordering::SeqCst) >= 2;

        let inner = support.clone();
        let work = async move {
            inner.cancelled().await;
            Err::<(), _>(LspError::Cancelled)
        };
        let result = wait_until_done(work, &support, &checker).await;
        assert!(matches!(result, Err(LspError::Cancelled)));
        assert!(support.is_cancelled());
        assert!(polls.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_block_until_done_from_host_thread() -> anyhow::Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        let support = CancellationSupport::new();
        let host_cancelled = AtomicBool::new(true);
        let checker = || host_cancelled.load(Ordering::SeqCst);
        let inner = support.clone();
        let result = block_until_done(
            runtime.handle(),
            async move {
                inner.cancelled().await;
                Err::<(), _>(LspError::Cancelled)
            },
            &support,
            &checker,
        );
        assert!(matches!(result, Err(LspError::Cancelled)));
        Ok(())
    }
}
