// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Connection providers: how the byte streams to a language server are obtained.
//!
//! A session asks its definition's [`ConnectionSpec`] for a fresh
//! [`ConnectionProvider`] on every start, so a restart never reuses a dead
//! process handle.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{LspError, LspResult};

/// How long a freshly spawned process must survive before it counts as started.
const ALIVE_CHECK_DELAY: Duration = Duration::from_millis(200);

/// Boxed reader half (server → client).
pub type ServerReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed writer half (client → server).
pub type ServerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The byte streams of a live connection.
pub struct ConnectionStreams {
    /// Messages written by the server.
    pub reader: ServerReader,
    /// Messages sent to the server.
    pub writer: ServerWriter,
    /// Diagnostic output of the server process, when it has one.
    pub stderr: Option<ServerReader>,
}

/// A started (or startable) connection to a language server.
pub trait ConnectionProvider: Send {
    /// Establishes the connection.
    ///
    /// Fails with [`LspError::ProcessStart`] if the command is empty or the
    /// connection cannot be created.
    fn start(&mut self) -> BoxFuture<'_, LspResult<()>>;

    /// Returns true while the underlying process or socket is usable.
    fn is_alive(&mut self) -> bool;

    /// Fails fast if the connection died right after [`ConnectionProvider::start`].
    fn ensure_is_alive(&mut self) -> BoxFuture<'_, LspResult<()>>;

    /// Hands out the byte streams. Returns `None` once they were taken.
    fn take_streams(&mut self) -> Option<ConnectionStreams>;

    /// Process id, for connections backed by a local process.
    fn pid(&self) -> Option<u32> {
        None
    }

    /// Tears the connection down, waiting at most `grace` for a voluntary exit.
    ///
    /// Calling it more than once is harmless.
    fn stop(&mut self, grace: Duration) -> BoxFuture<'_, ()>;
}

/// Closure that builds a provider for a workspace root.
pub type ConnectionFactory = Arc<dyn Fn(&Path) -> Box<dyn ConnectionProvider> + Send + Sync>;

/// How a definition's connection is created.
#[derive(Clone)]
pub enum ConnectionSpec {
    /// Spawn a local process and talk over its stdio.
    Process {
        /// Program followed by its arguments.
        command: Vec<String>,
        /// Working directory; defaults to the workspace root.
        working_dir: Option<PathBuf>,
        /// Extra environment variables.
        env: HashMap<String, String>,
    },
    /// Connect to a server listening on a TCP socket.
    Socket {
        /// `host:port` address.
        address: String,
    },
    /// Delegate to an embedder-provided factory (in-memory servers, custom launchers).
    Factory(ConnectionFactory),
}

impl fmt::Debug for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process {
                command,
                working_dir,
                ..
            } => f
                .debug_struct("Process")
                .field("command", command)
                .field("working_dir", working_dir)
                .finish_non_exhaustive(),
            Self::Socket { address } => f.debug_struct("Socket").field("address", address).finish(),
            Self::Factory(_) => f.write_str("Factory"),
        }
    }
}

impl ConnectionSpec {
    /// Builds a fresh provider for the given workspace root.
    #[must_use]
    pub fn create_provider(&self, server_id: &str, root: &Path) -> Box<dyn ConnectionProvider> {
        match self {
            Self::Process {
                command,
                working_dir,
                env,
            } => Box::new(ProcessConnectionProvider::new(
                server_id,
                command.clone(),
                working_dir.clone().or_else(|| Some(root.to_path_buf())),
                env.clone(),
            )),
            Self::Socket { address } => {
                Box::new(SocketConnectionProvider::new(server_id, address.clone()))
            }
            Self::Factory(factory) => factory(root),
        }
    }
}

/// Provider that runs the server as a child process.
pub struct ProcessConnectionProvider {
    server_id: String,
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
    child: Option<Child>,
    streams: Option<ConnectionStreams>,
}

impl ProcessConnectionProvider {
    /// Creates a provider; nothing is spawned until [`ConnectionProvider::start`].
    #[must_use]
    pub fn new(
        server_id: &str,
        command: Vec<String>,
        working_dir: Option<PathBuf>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            server_id: server_id.to_string(),
            command,
            working_dir,
            env,
            child: None,
            streams: None,
        }
    }

    fn start_error(&self, reason: impl Into<String>) -> LspError {
        LspError::ProcessStart {
            server: self.server_id.clone(),
            reason: reason.into(),
        }
    }
}

impl ConnectionProvider for ProcessConnectionProvider {
    fn start(&mut self) -> BoxFuture<'_, LspResult<()>> {
        Box::pin(async move {
            let Some((program, args)) = self.command.split_first() else {
                return Err(self.start_error("no command configured"));
            };
            if program.trim().is_empty() {
                return Err(self.start_error("empty command"));
            }

            let mut command = Command::new(program);
            command
                .args(args)
                .envs(&self.env)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(dir) = &self.working_dir {
                command.current_dir(dir);
            }

            let mut child = command
                .spawn()
                .map_err(|e| self.start_error(format!("failed to spawn {program}: {e}")))?;

            let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
                return Err(self.start_error("process stdio was not captured"));
            };
            let stderr = child
                .stderr
                .take()
                .map(|stderr| Box::new(stderr) as ServerReader);

            debug!(
                "Spawned language server '{}' (pid {:?}): {}",
                self.server_id,
                child.id(),
                self.command.join(" ")
            );

            self.streams = Some(ConnectionStreams {
                reader: Box::new(stdout),
                writer: Box::new(stdin),
                stderr,
            });
            self.child = Some(child);
            Ok(())
        })
    }

    fn is_alive(&mut self) -> bool {
        self.child
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    fn ensure_is_alive(&mut self) -> BoxFuture<'_, LspResult<()>> {
        Box::pin(async move {
            tokio::time::sleep(ALIVE_CHECK_DELAY).await;
            if self.is_alive() {
                return Ok(());
            }
            let status = self
                .child
                .as_mut()
                .and_then(|child| child.try_wait().ok().flatten());
            Err(self.start_error(match status {
                Some(status) => format!("process exited immediately ({status})"),
                None => "process is not running".to_string(),
            }))
        })
    }

    fn take_streams(&mut self) -> Option<ConnectionStreams> {
        self.streams.take()
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    fn stop(&mut self, grace: Duration) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.streams = None;
            let Some(mut child) = self.child.take() else {
                return;
            };
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!("Language server '{}' exited: {}", self.server_id, status),
                Ok(Err(e)) => warn!("Failed to wait for '{}': {}", self.server_id, e),
                Err(_) => {
                    debug!(
                        "Language server '{}' still alive after {:?}, killing",
                        self.server_id, grace
                    );
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill language server '{}': {}", self.server_id, e);
                    }
                }
            }
        })
    }
}

/// Provider that connects to a server over TCP.
pub struct SocketConnectionProvider {
    server_id: String,
    address: String,
    connected: bool,
    streams: Option<ConnectionStreams>,
}

impl SocketConnectionProvider {
    /// Creates a provider for `address` (`host:port`).
    #[must_use]
    pub fn new(server_id: &str, address: String) -> Self {
        Self {
            server_id: server_id.to_string(),
            address,
            connected: false,
            streams: None,
        }
    }
}

impl ConnectionProvider for SocketConnectionProvider {
    fn start(&mut self) -> BoxFuture<'_, LspResult<()>> {
        Box::pin(async move {
            let stream = TcpStream::connect(&self.address)
                .await
                .map_err(|e| LspError::ProcessStart {
                    server: self.server_id.clone(),
                    reason: format!("failed to connect to {}: {e}", self.address),
                })?;
            let (reader, writer) = stream.into_split();
            self.streams = Some(ConnectionStreams {
                reader: Box::new(reader),
                writer: Box::new(writer),
                stderr: None,
            });
            self.connected = true;
            Ok(())
        })
    }

    fn is_alive(&mut self) -> bool {
        self.connected
    }

    fn ensure_is_alive(&mut self) -> BoxFuture<'_, LspResult<()>> {
        Box::pin(async move {
            if self.connected {
                Ok(())
            } else {
                Err(LspError::ProcessStart {
                    server: self.server_id.clone(),
                    reason: format!("not connected to {}", self.address),
                })
            }
        })
    }

    fn take_streams(&mut self) -> Option<ConnectionStreams> {
        self.streams.take()
    }

    fn stop(&mut self, _grace: Duration) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.streams = None;
            self.connected = false;
        })
    }
}

/// Provider over caller-supplied streams, e.g. an in-process server on a
/// [`tokio::io::duplex`] pipe.
pub struct StreamConnectionProvider {
    streams: Option<ConnectionStreams>,
    started: bool,
    stopped: bool,
}

impl StreamConnectionProvider {
    /// Wraps an already connected pair of streams.
    #[must_use]
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            streams: Some(ConnectionStreams {
                reader: Box::new(reader),
                writer: Box::new(writer),
                stderr: None,
            }),
            started: false,
            stopped: false,
        }
    }
}

impl ConnectionProvider for StreamConnectionProvider {
    fn start(&mut self) -> BoxFuture<'_, LspResult<()>> {
        Box::pin(async move {
            if self.streams.is_none() {
                return Err(LspError::ProcessStart {
                    server: "in-memory".to_string(),
                    reason: "streams already consumed".to_string(),
                });
            }
            self.started = true;
            Ok(())
        })
    }

    fn is_alive(&mut self) -> bool {
        self.started && !self.stopped
    }

    fn ensure_is_alive(&mut self) -> BoxFuture<'_, LspResult<()>> {
        Box::pin(async move {
            if self.is_alive() {
                Ok(())
            } else {
                Err(LspError::ProcessStart {
                    server: "in-memory".to_string(),
                    reason: "connection is not open".to_string(),
                })
            }
        })
    }

    fn take_streams(&mut self) -> Option<ConnectionStreams> {
        self.streams.take()
    }

    fn stop(&mut self, _grace: Duration) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.streams = None;
            self.stopped = true;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    #[tokio::test]
    async fn test_empty_command_is_a_start_failure() {
        let mut provider =
            ProcessConnectionProvider::new("empty", Vec::new(), None, HashMap::new());
        let err = provider.start().await.err();
        assert!(matches!(err, Some(LspError::ProcessStart { .. })));
        assert!(!provider.is_alive());
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_start_failure() {
        let mut provider = ProcessConnectionProvider::new(
            "missing",
            vec!["switchyard-no-such-binary-xyz".to_string()],
            None,
            HashMap::new(),
        );
        let err = provider.start().await.err();
        assert!(matches!(err, Some(LspError::ProcessStart { server, .. }) if server == "missing"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_that_exits_immediately_fails_alive_check() -> Result<()> {
        let mut provider = ProcessConnectionProvider::new(
            "true",
            vec!["true".to_string()],
            None,
            HashMap::new(),
        );
        provider.start().await.context("spawning `true`")?;
        let err = provider.ensure_is_alive().await.err();
        assert!(matches!(err, Some(LspError::ProcessStart { .. })));
        // Idempotent teardown.
        provider.stop(Duration::from_millis(10)).await;
        provider.stop(Duration::from_millis(10)).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_provider_hands_out_streams_once() -> Result<()> {
        let (client_side, _server_side) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(client_side);
        let mut provider = StreamConnectionProvider::new(reader, writer);
        provider.start().await?;
        provider.ensure_is_alive().await?;
        assert!(provider.take_streams().is_some());
        assert!(provider.take_streams().is_none());
        provider.stop(Duration::ZERO).await;
        assert!(!provider.is_alive());
        Ok(())
    }

    #[tokio::test]
    async fn test_socket_connect_refused_is_a_start_failure() {
        // Port 1 on localhost is essentially never listening.
        let mut provider = SocketConnectionProvider::new("tcp", "127.0.0.1:1".to_string());
        let err = provider.start().await.err();
        assert!(matches!(err, Some(LspError::ProcessStart { .. })));
    }
}
