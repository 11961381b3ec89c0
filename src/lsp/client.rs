// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! JSON-RPC client over one server connection.
//!
//! The client owns the writer half and a reader task that routes responses
//! to pending requests, answers server-initiated requests and caches
//! diagnostics. It knows nothing about sessions or documents.

use bytes::BytesMut;
use lsp_types::notification::{Cancel, Notification};
use lsp_types::request::Request;
use lsp_types::{
    CancelParams, ConfigurationParams, Diagnostic, PublishDiagnosticsParams, Uri, WorkspaceFolder,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::connection::{ConnectionStreams, ServerReader, ServerWriter};
use super::protocol::{
    self, IncomingMessage, JSONRPC_VERSION, METHOD_NOT_FOUND, NotificationMessage, RequestId,
    RequestMessage, ResponseMessage,
};
use crate::cancellation::{CancellationSupport, PendingRequest};
use crate::error::{LspError, LspResult};
use crate::registry::ServerDefinition;

/// Cached diagnostics per document.
pub type DiagnosticsCache = Arc<Mutex<HashMap<Uri, Vec<Diagnostic>>>>;

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ResponseMessage>>>>;

/// Default timeout for LSP requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the reader task needs to answer server requests.
#[derive(Clone)]
struct ServerContext {
    definition: Arc<ServerDefinition>,
    workspace_folders: Vec<WorkspaceFolder>,
}

/// Communication with one language server.
pub struct LspClient {
    server_id: String,
    next_id: AtomicI64,
    writer: Arc<Mutex<ServerWriter>>,
    pending: PendingMap,
    diagnostics: DiagnosticsCache,
    closed: watch::Receiver<bool>,
    request_timeout: Duration,
    reader_handle: JoinHandle<()>,
    stderr_handle: Option<JoinHandle<()>>,
}

impl Drop for LspClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        if let Some(handle) = &self.stderr_handle {
            handle.abort();
        }
    }
}

impl LspClient {
    /// Starts the reader (and stderr drain) tasks over `streams`.
    #[must_use]
    pub fn new(
        streams: ConnectionStreams,
        definition: Arc<ServerDefinition>,
        workspace_folders: Vec<WorkspaceFolder>,
        request_timeout: Duration,
    ) -> Self {
        let server_id = definition.id.clone();
        let writer = Arc::new(Mutex::new(streams.writer));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let diagnostics: DiagnosticsCache = Arc::new(Mutex::new(HashMap::new()));
        let (closed_tx, closed) = watch::channel(false);

        let context = ServerContext {
            definition,
            workspace_folders,
        };

        let reader_handle = tokio::spawn(Self::reader_task(
            streams.reader,
            writer.clone(),
            pending.clone(),
            diagnostics.clone(),
            closed_tx,
            context,
        ));

        let stderr_handle = streams
            .stderr
            .map(|stderr| tokio::spawn(Self::stderr_task(stderr, server_id.clone())));

        Self {
            server_id,
            next_id: AtomicI64::new(1),
            writer,
            pending,
            diagnostics,
            closed,
            request_timeout,
            reader_handle,
            stderr_handle,
        }
    }

    /// Definition id of the server on the other end.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Returns true while the server's output stream is open.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Resolves once the server's output stream closes.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Closed signal that does not keep the client alive.
    pub(crate) fn closed_receiver(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    /// Latest diagnostics published for `uri`.
    pub async fn diagnostics(&self, uri: &Uri) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .await
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }

    /// Background task that reads LSP messages and routes them.
    async fn reader_task(
        mut reader: ServerReader,
        writer: Arc<Mutex<ServerWriter>>,
        pending: PendingMap,
        diagnostics: DiagnosticsCache,
        closed: watch::Sender<bool>,
        context: ServerContext,
    ) {
        let server_id = context.definition.id.clone();
        let mut buffer = BytesMut::with_capacity(8192);
        let mut temp = [0u8; 4096];

        'read: loop {
            match reader.read(&mut temp).await {
                Ok(0) => {
                    debug!("Language server '{}' closed its output", server_id);
                    break;
                }
                Ok(n) => buffer.extend_from_slice(&temp[..n]),
                Err(e) => {
                    warn!("Error reading from language server '{}': {}", server_id, e);
                    break;
                }
            }

            loop {
                let message = match protocol::try_parse_message(&mut buffer) {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Dropping unreadable frame from '{}': {:#}", server_id, e);
                        buffer.clear();
                        continue 'read;
                    }
                };
                trace!("<- {}: {}", server_id, message);

                let value: serde_json::Value = match serde_json::from_str(&message) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("Failed to parse JSON from '{}': {}", server_id, e);
                        continue;
                    }
                };

                match protocol::classify(value) {
                    Some(IncomingMessage::Response(response)) => {
                        let Some(id) = &response.id else {
                            warn!("Response without id from '{}'", server_id);
                            continue;
                        };
                        if let Some(sender) = pending.lock().await.remove(id) {
                            let _ = sender.send(response);
                        } else {
                            // Late answer to a cancelled or timed-out request.
                            debug!("Dropping response for unknown request id {:?}", id);
                        }
                    }
                    Some(IncomingMessage::Request(request)) => {
                        let response = Self::answer_server_request(&request, &context);
                        if let Err(e) = Self::write_message(&writer, &server_id, &response).await {
                            warn!("Failed to answer '{}' from '{}': {}", request.method, server_id, e);
                        }
                    }
                    Some(IncomingMessage::Notification(notification)) => {
                        Self::handle_notification(&server_id, &notification, &diagnostics).await;
                    }
                    None => warn!("Unknown message format from '{}': {}", server_id, message),
                }
            }
        }

        let _ = closed.send(true);
        // Dropping the senders wakes every waiter with ConnectionClosed.
        pending.lock().await.clear();
    }

    /// Forwards server stderr to the log.
    async fn stderr_task(stderr: ServerReader, server_id: String) {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(server = %server_id, "stderr: {}", line),
                Ok(None) => break,
                Err(e) => {
                    debug!(server = %server_id, "stderr closed: {}", e);
                    break;
                }
            }
        }
    }

    /// Builds the reply to a server-initiated request.
    fn answer_server_request(request: &RequestMessage, context: &ServerContext) -> ResponseMessage {
        let id = request.id.clone();
        match request.method.as_str() {
            "workspace/configuration" => {
                let items = serde_json::from_value::<ConfigurationParams>(request.params.clone())
                    .map(|params| params.items)
                    .unwrap_or_default();
                let settings = context.definition.settings();
                let results: Vec<serde_json::Value> = items
                    .iter()
                    .map(|item| lookup_section(settings.as_ref(), item.section.as_deref()))
                    .collect();
                ResponseMessage::success(id, serde_json::Value::Array(results))
            }
            "workspace/workspaceFolders" => ResponseMessage::success(
                id,
                serde_json::to_value(&context.workspace_folders)
                    .unwrap_or(serde_json::Value::Null),
            ),
            "client/registerCapability"
            | "client/unregisterCapability"
            | "window/workDoneProgress/create" => {
                ResponseMessage::success(id, serde_json::Value::Null)
            }
            method => {
                debug!("Unsupported server request: {}", method);
                ResponseMessage::failure(
                    id,
                    METHOD_NOT_FOUND,
                    format!("Method '{method}' not supported by client"),
                )
            }
        }
    }

    /// Handles incoming LSP notifications.
    async fn handle_notification(
        server_id: &str,
        notification: &NotificationMessage,
        diagnostics: &DiagnosticsCache,
    ) {
        match notification.method.as_str() {
            "textDocument/publishDiagnostics" => {
                if let Ok(params) =
                    serde_json::from_value::<PublishDiagnosticsParams>(notification.params.clone())
                {
                    debug!(
                        "Received {} diagnostics for {}",
                        params.diagnostics.len(),
                        params.uri.as_str()
                    );
                    diagnostics
                        .lock()
                        .await
                        .insert(params.uri, params.diagnostics);
                } else {
                    warn!("Failed to parse publishDiagnostics params from '{}'", server_id);
                }
            }
            "window/logMessage" | "window/showMessage" => {
                if let Some(message) = notification.params.get("message").and_then(|m| m.as_str()) {
                    debug!(server = %server_id, "{}", message);
                }
            }
            _ => {
                trace!(
                    "Ignoring notification: {} params={}",
                    notification.method, notification.params
                );
            }
        }
    }

    /// Sends a typed request.
    ///
    /// With `cancellation`, the request races the signal; on cancel the
    /// pending entry is dropped, `$/cancelRequest` is sent and the call fails
    /// with [`LspError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns [`LspError::RequestTimeout`], [`LspError::Cancelled`],
    /// [`LspError::Server`] for error responses, [`LspError::ConnectionClosed`]
    /// or [`LspError::Json`] for an undecodable result.
    pub async fn request<R: Request>(
        &self,
        params: R::Params,
        cancellation: Option<&CancellationSupport>,
    ) -> LspResult<R::Result> {
        let params = serde_json::to_value(params)?;
        let result = self.request_value(R::METHOD, params, cancellation).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Sends a typed request with its own deadline instead of the client's.
    ///
    /// # Errors
    ///
    /// See [`LspClient::request`].
    pub async fn request_with_timeout<R: Request>(
        &self,
        params: R::Params,
        timeout: Duration,
    ) -> LspResult<R::Result> {
        let params = serde_json::to_value(params)?;
        let result = self.send_request(R::METHOD, params, None, timeout).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Untyped request with the client's default deadline.
    ///
    /// # Errors
    ///
    /// See [`LspClient::request`].
    pub async fn request_value(
        &self,
        method: &str,
        params: serde_json::Value,
        cancellation: Option<&CancellationSupport>,
    ) -> LspResult<serde_json::Value> {
        self.send_request(method, params, cancellation, self.request_timeout)
            .await
    }

    async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
        cancellation: Option<&CancellationSupport>,
        timeout: Duration,
    ) -> LspResult<serde_json::Value> {
        if !self.is_alive() {
            return Err(LspError::ConnectionClosed);
        }
        if let Some(cancellation) = cancellation {
            cancellation.check()?;
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let request = RequestMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.clone(),
            method: method.to_string(),
            params,
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            // The reader flags the close before it clears `pending`.
            if !self.is_alive() {
                return Err(LspError::ConnectionClosed);
            }
            pending.insert(id.clone(), tx);
        }
        let _tracked = cancellation.map(|c| {
            c.track(PendingRequest {
                server_id: self.server_id.clone(),
                method: method.to_string(),
                request_id: id.clone(),
            })
        });

        if let Err(e) = Self::write_message(&self.writer, &self.server_id, &request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let cancelled = async {
            match cancellation {
                Some(cancellation) => cancellation.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            () = cancelled => None,
            response = tokio::time::timeout(timeout, rx) => Some(response),
        };

        let response = match outcome {
            None => {
                self.pending.lock().await.remove(&id);
                debug!("Cancelling '{}' ({:?}) on '{}'", method, id, self.server_id);
                if let Err(e) = self.notify::<Cancel>(CancelParams { id: id.into() }).await {
                    debug!("Failed to send $/cancelRequest to '{}': {}", self.server_id, e);
                }
                return Err(LspError::Cancelled);
            }
            Some(Ok(Ok(response))) => response,
            Some(Ok(Err(_))) => return Err(LspError::ConnectionClosed),
            Some(Err(_)) => {
                self.pending.lock().await.remove(&id);
                return Err(LspError::RequestTimeout {
                    method: method.to_string(),
                    timeout,
                });
            }
        };

        if let Some(error) = response.error {
            return Err(LspError::Server {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    /// Sends a typed notification.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::ConnectionClosed`] once the server is gone, or an
    /// I/O error from the writer.
    pub async fn notify<N: Notification>(&self, params: N::Params) -> LspResult<()> {
        if !self.is_alive() {
            return Err(LspError::ConnectionClosed);
        }
        let notification = NotificationMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: N::METHOD.to_string(),
            params: serde_json::to_value(params)?,
        };
        Self::write_message(&self.writer, &self.server_id, &notification).await
    }

    /// Sends `shutdown` (bounded by `timeout`) followed by `exit`.
    ///
    /// # Errors
    ///
    /// Returns the first failure; `exit` is still attempted after a failed
    /// or timed-out `shutdown`.
    pub async fn shutdown(&self, timeout: Duration) -> LspResult<()> {
        let shutdown = self
            .send_request("shutdown", serde_json::Value::Null, None, timeout)
            .await;
        let exit = self
            .notify::<lsp_types::notification::Exit>(())
            .await;
        shutdown.map(|_| ()).and(exit)
    }

    /// Writes one framed message.
    async fn write_message<T: serde::Serialize>(
        writer: &Mutex<ServerWriter>,
        server_id: &str,
        message: &T,
    ) -> LspResult<()> {
        let framed = protocol::encode_message(message)?;
        if tracing::enabled!(tracing::Level::TRACE) {
            trace!("-> {}: {}", server_id, String::from_utf8_lossy(&framed));
        }

        let mut writer = writer.lock().await;
        writer.write_all(&framed).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Resolves a dotted `section` inside `settings`; no section means everything.
fn lookup_section(settings: Option<&serde_json::Value>, section: Option<&str>) -> serde_json::Value {
    let Some(settings) = settings else {
        return serde_json::Value::Null;
    };
    let Some(section) = section.filter(|s| !s.is_empty()) else {
        return settings.clone();
    };
    section
        .split('.')
        .try_fold(settings, |value, key| value.get(key))
        .cloned()
        .unwrap_or(serde_json::Value::Null)
}
