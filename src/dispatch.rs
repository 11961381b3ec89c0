// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Fans one feature request out to every eligible session and merges the
//! answers.
//!
//! Each call gets its own [`CancellationSupport`]. A server that errors or
//! times out contributes nothing and is listed in
//! [`MergedResult::failures`]; the merge itself only fails when the whole
//! call is cancelled.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use lsp_types::ServerCapabilities;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::cancellation::{CancelChecker, CancellationSupport, block_until_done, wait_until_done};
use crate::document::DocumentRef;
use crate::error::{LspError, LspResult};
use crate::lifecycle::{EventBroadcaster, EventKind};
use crate::lsp::manager::SessionManager;
use crate::lsp::session::ServerSession;

/// How long a cancelled merge waits for its requests to send `$/cancelRequest`.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Items returned by one server.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution<T> {
    /// Definition id of the answering server.
    pub server_id: String,
    /// What it returned.
    pub items: Vec<T>,
}

/// A server whose request failed during a merge.
#[derive(Debug)]
pub struct ServerFailure {
    /// Definition id of the failing server.
    pub server_id: String,
    /// Why it failed.
    pub error: LspError,
}

/// Outcome of a merged request.
#[derive(Debug)]
pub struct MergedResult<T> {
    /// Successful answers, in the order the sessions were resolved.
    pub contributions: Vec<Contribution<T>>,
    /// Servers that contributed nothing because their request failed.
    pub failures: Vec<ServerFailure>,
}

impl<T> Default for MergedResult<T> {
    fn default() -> Self {
        Self {
            contributions: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> MergedResult<T> {
    /// All items, contribution by contribution.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.contributions.iter().flat_map(|c| c.items.iter())
    }

    /// Consumes the result into the concatenated items.
    #[must_use]
    pub fn into_items(self) -> Vec<T> {
        self.contributions.into_iter().flat_map(|c| c.items).collect()
    }

    /// True when no server returned anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contributions.iter().all(|c| c.items.is_empty())
    }
}

/// Handle to an in-flight merged request.
///
/// Await it for the merged result. [`MergedRequest::cancel`] (or dropping the
/// handle before completion) cancels every per-server request.
#[must_use = "a merged request is cancelled when dropped"]
pub struct MergedRequest<T> {
    support: CancellationSupport,
    future: BoxFuture<'static, LspResult<MergedResult<T>>>,
    done: bool,
}

impl<T: Send + 'static> MergedRequest<T> {
    /// An already completed request.
    pub fn ready(result: MergedResult<T>) -> Self {
        Self {
            support: CancellationSupport::new(),
            future: futures_util::future::ready(Ok(result)).boxed(),
            done: false,
        }
    }
}

impl<T> MergedRequest<T> {
    /// Cancels every pending per-server request.
    pub fn cancel(&self) {
        self.support.cancel();
    }

    /// Cancellation signal shared by the per-server requests.
    pub const fn cancellation(&self) -> &CancellationSupport {
        &self.support
    }

    /// Awaits the result while polling a host cancellation check.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::Cancelled`] if the host or [`MergedRequest::cancel`]
    /// cancelled the request.
    pub async fn wait_with<C: CancelChecker + ?Sized>(self, checker: &C) -> LspResult<MergedResult<T>> {
        let support = self.support.clone();
        wait_until_done(self, &support, checker).await
    }

    /// Blocking form of [`MergedRequest::wait_with`] for host threads.
    ///
    /// # Errors
    ///
    /// Same as [`MergedRequest::wait_with`].
    pub fn block_with<C: CancelChecker + ?Sized>(
        self,
        handle: &Handle,
        checker: &C,
    ) -> LspResult<MergedResult<T>> {
        let support = self.support.clone();
        block_until_done(handle, self, &support, checker)
    }
}

impl<T> Future for MergedRequest<T> {
    type Output = LspResult<MergedResult<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let poll = self.future.as_mut().poll(cx);
        if poll.is_ready() {
            self.done = true;
        }
        poll
    }
}

impl<T> Drop for MergedRequest<T> {
    fn drop(&mut self) {
        if !self.done {
            self.support.cancel();
        }
    }
}

/// Stateless fan-out over the sessions of a [`SessionManager`].
#[derive(Clone)]
pub struct Dispatcher {
    manager: Arc<SessionManager>,
}

impl Dispatcher {
    /// Creates a dispatcher over `manager`'s sessions.
    #[must_use]
    pub const fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// The manager whose sessions are queried.
    #[must_use]
    pub const fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Started sessions of `document` whose capabilities pass `predicate`.
    pub fn eligible_sessions<P>(&self, document: &DocumentRef, predicate: P) -> Vec<Arc<ServerSession>>
    where
        P: Fn(&ServerCapabilities) -> bool,
    {
        self.manager
            .started_sessions_for(document)
            .into_iter()
            .filter(|session| session.capabilities().is_some_and(|caps| predicate(&caps)))
            .collect()
    }

    /// Sends `method` to every started session of `document` passing
    /// `predicate`, building each request with `builder`.
    ///
    /// `method` only labels logs and failure events.
    pub fn dispatch<T, P, F, Fut>(
        &self,
        document: &DocumentRef,
        method: &'static str,
        predicate: P,
        builder: F,
    ) -> MergedRequest<T>
    where
        T: Send + 'static,
        P: Fn(&ServerCapabilities) -> bool,
        F: Fn(Arc<ServerSession>, CancellationSupport) -> Fut,
        Fut: Future<Output = LspResult<Vec<T>>> + Send + 'static,
    {
        let sessions = self.eligible_sessions(document, predicate);
        self.dispatch_to(sessions, method, builder)
    }

    /// Like [`Dispatcher::dispatch`] over an explicit session list.
    pub fn dispatch_to<T, F, Fut>(
        &self,
        sessions: Vec<Arc<ServerSession>>,
        method: &'static str,
        builder: F,
    ) -> MergedRequest<T>
    where
        T: Send + 'static,
        F: Fn(Arc<ServerSession>, CancellationSupport) -> Fut,
        Fut: Future<Output = LspResult<Vec<T>>> + Send + 'static,
    {
        if sessions.is_empty() {
            debug!("No eligible server for {}", method);
            return MergedRequest::ready(MergedResult::default());
        }

        let support = CancellationSupport::new();
        let requests: Vec<_> = sessions
            .into_iter()
            .map(|session| {
                let server_id = session.server_id().to_string();
                let request = builder(session, support.clone());
                async move { (server_id, request.await) }
            })
            .collect();

        let future = merge(requests, method, support.clone(), self.manager.events().clone()).boxed();
        MergedRequest {
            support,
            future,
            done: false,
        }
    }
}

async fn merge<T, Fut>(
    requests: Vec<Fut>,
    method: &'static str,
    support: CancellationSupport,
    events: EventBroadcaster,
) -> LspResult<MergedResult<T>>
where
    Fut: Future<Output = (String, LspResult<Vec<T>>)>,
{
    let all = join_all(requests);
    tokio::pin!(all);

    let results = tokio::select! {
        biased;
        () = support.cancelled() => {
            // Let the requests notice and send `$/cancelRequest`.
            let _ = tokio::time::timeout(CANCEL_DRAIN_TIMEOUT, &mut all).await;
            debug!("{} cancelled", method);
            return Err(LspError::Cancelled);
        }
        results = &mut all => results,
    };
    if support.is_cancelled() {
        debug!("{} cancelled", method);
        return Err(LspError::Cancelled);
    }

    let mut merged = MergedResult::default();
    for (server_id, result) in results {
        match result {
            Ok(items) => merged.contributions.push(Contribution { server_id, items }),
            Err(error) => {
                if error.is_cancelled() {
                    debug!("{} on '{}' was cancelled by the server", method, server_id);
                } else {
                    warn!("{} on '{}' failed: {}", method, server_id, error);
                    events.send(EventKind::RequestFailed {
                        server: server_id.clone(),
                        method: method.to_string(),
                        message: error.to_string(),
                    });
                }
                merged.failures.push(ServerFailure { server_id, error });
            }
        }
    }
    Ok(merged)
}
