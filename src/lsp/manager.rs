// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Routes documents to sessions and owns every session's lifetime.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::session::{ServerSession, SessionOptions};
use super::state::{ScopeKey, ServerState, ServerStatus};
use crate::config::{Config, ServerScope};
use crate::document::{DocumentEdit, DocumentRef, TextBuffer};
use crate::error::{LspError, LspResult};
use crate::lifecycle::EventBroadcaster;
use crate::registry::{DefinitionRegistry, RegistryEvent, ServerDefinition};

/// Lazily creates, caches and tears down [`ServerSession`]s.
pub struct SessionManager {
    registry: Arc<DefinitionRegistry>,
    roots: Vec<PathBuf>,
    options: SessionOptions,
    events: EventBroadcaster,
    /// Creation order; at most one entry per (definition id, scope key).
    sessions: Mutex<Vec<Arc<ServerSession>>>,
}

impl SessionManager {
    /// Creates a manager over `registry` for the given workspace roots.
    #[must_use]
    pub fn new(
        registry: Arc<DefinitionRegistry>,
        roots: Vec<PathBuf>,
        options: SessionOptions,
        events: EventBroadcaster,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            roots,
            options,
            events,
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Builds the registry and session options from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::InvalidPattern`] for a bad association glob.
    pub fn from_config(config: &Config, roots: Vec<PathBuf>, events: EventBroadcaster) -> LspResult<Arc<Self>> {
        let registry = Arc::new(DefinitionRegistry::from_config(config)?);
        Ok(Self::new(registry, roots, SessionOptions::from(config), events))
    }

    /// The registry consulted for routing.
    #[must_use]
    pub const fn registry(&self) -> &Arc<DefinitionRegistry> {
        &self.registry
    }

    /// Lifecycle event sink shared with every session.
    #[must_use]
    pub const fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    fn sessions(&self) -> MutexGuard<'_, Vec<Arc<ServerSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every session, in creation order.
    #[must_use]
    pub fn all_sessions(&self) -> Vec<Arc<ServerSession>> {
        self.sessions().clone()
    }

    /// Workspace root owning `path`: the deepest configured root containing
    /// it, else the file's directory.
    fn root_for(&self, path: &Path) -> PathBuf {
        self.roots
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
            .cloned()
            .or_else(|| path.parent().map(Path::to_path_buf))
            .unwrap_or_default()
    }

    /// Scope key a document maps to for `definition`.
    ///
    /// Application-scoped and singleton definitions share one session;
    /// project-scoped ones get a session per workspace root.
    #[must_use]
    pub fn scope_for(&self, definition: &ServerDefinition, path: &Path) -> ScopeKey {
        if definition.singleton || definition.scope == ServerScope::Application {
            ScopeKey::Application
        } else {
            ScopeKey::Project(self.root_for(path))
        }
    }

    /// Returns the session for (definition, scope), creating it on first use.
    ///
    /// Lookup and insertion happen under one lock, so concurrent callers
    /// always share the same session.
    pub fn session_for(&self, definition: &Arc<ServerDefinition>, path: &Path) -> Arc<ServerSession> {
        let scope = self.scope_for(definition, path);
        let mut sessions = self.sessions();
        if let Some(existing) = sessions
            .iter()
            .find(|s| s.server_id() == definition.id && *s.scope() == scope)
        {
            return Arc::clone(existing);
        }

        let roots = match &scope {
            ScopeKey::Application if !self.roots.is_empty() => self.roots.clone(),
            ScopeKey::Application => path.parent().map(Path::to_path_buf).into_iter().collect(),
            ScopeKey::Project(root) => vec![root.clone()],
        };
        debug!("Creating session '{}' ({})", definition.id, scope);
        let session = ServerSession::new(
            Arc::clone(definition),
            scope,
            roots,
            self.registry.connection_for(definition),
            self.options,
            self.events.clone(),
        );
        sessions.push(Arc::clone(&session));
        session
    }

    /// Sessions the registry routes `document` to, created as needed, in
    /// registry order.
    #[must_use]
    pub fn sessions_for(&self, document: &DocumentRef) -> Vec<Arc<ServerSession>> {
        self.registry
            .find_definitions_for(&document.language, &document.path)
            .iter()
            .map(|definition| self.session_for(definition, &document.path))
            .collect()
    }

    /// Started sessions `document` is connected to, in registry order.
    ///
    /// This is a snapshot; sessions failing later are simply skipped by the
    /// dispatcher's request.
    #[must_use]
    pub fn started_sessions_for(&self, document: &DocumentRef) -> Vec<Arc<ServerSession>> {
        let definitions = self
            .registry
            .find_definitions_for(&document.language, &document.path);
        let sessions = self.sessions();
        definitions
            .iter()
            .filter_map(|definition| {
                let scope = self.scope_for(definition, &document.path);
                sessions
                    .iter()
                    .find(|s| s.server_id() == definition.id && *s.scope() == scope)
                    .cloned()
            })
            .filter(|s| s.state() == ServerState::Started && s.is_connected(&document.uri))
            .collect()
    }

    /// Sessions `document` is currently connected to.
    fn connected_sessions(&self, document: &DocumentRef) -> Vec<Arc<ServerSession>> {
        self.sessions()
            .iter()
            .filter(|s| s.is_connected(&document.uri))
            .cloned()
            .collect()
    }

    /// Connects `document` to every eligible server, starting them in
    /// parallel.
    ///
    /// Returns the sessions that accepted it. A server failing to start is
    /// left `Failed` and does not affect the others.
    pub async fn connect_document(&self, document: &DocumentRef, text: &TextBuffer) -> Vec<Arc<ServerSession>> {
        let candidates = self.sessions_for(document);
        if candidates.is_empty() {
            debug!("No language server for {}", document.path.display());
            return Vec::new();
        }

        let attempts = candidates.iter().map(|session| async move {
            match session.connect(document, text).await {
                Ok(_) => Some(Arc::clone(session)),
                Err(e) => {
                    debug!(
                        "Not connecting {} to '{}': {}",
                        document.path.display(),
                        session.server_id(),
                        e
                    );
                    None
                }
            }
        });
        join_all(attempts).await.into_iter().flatten().collect()
    }

    /// Disconnects `document` from every session holding it.
    pub async fn disconnect_document(&self, document: &DocumentRef) {
        let sessions = self.connected_sessions(document);
        join_all(sessions.iter().map(|s| s.disconnect(&document.uri))).await;
    }

    /// Pre-edit hook; forwards to each connected session.
    pub fn before_change(&self, document: &DocumentRef, buffer: &TextBuffer, edit: &DocumentEdit) {
        for session in self.connected_sessions(document) {
            session.before_change(&document.uri, buffer, edit);
        }
    }

    /// Post-edit hook; forwards to each connected session.
    pub fn after_change(&self, document: &DocumentRef, buffer: &TextBuffer) {
        for session in self.connected_sessions(document) {
            session.after_change(&document.uri, buffer);
        }
    }

    /// Sends the pending changes of `document` to every connected session.
    pub async fn commit(&self, document: &DocumentRef) {
        let sessions = self.connected_sessions(document);
        join_all(sessions.iter().map(|s| s.commit(&document.uri))).await;
    }

    /// Sends `didSave` where the server asked for it.
    pub async fn saved(&self, document: &DocumentRef, buffer: &TextBuffer) {
        let sessions = self.connected_sessions(document);
        join_all(sessions.iter().map(|s| s.saved(&document.uri, buffer))).await;
    }

    fn sessions_of(&self, id: &str) -> Vec<Arc<ServerSession>> {
        self.sessions()
            .iter()
            .filter(|s| s.server_id() == id)
            .cloned()
            .collect()
    }

    /// Restarts every session of a definition that was ever started.
    ///
    /// # Errors
    ///
    /// Returns the first restart failure; the remaining sessions are still
    /// restarted.
    pub async fn restart_server(&self, id: &str) -> LspResult<()> {
        let mut first_error = None;
        for session in self.sessions_of(id) {
            if session.state() == ServerState::NotStarted {
                continue;
            }
            if let Err(e) = session.restart().await {
                warn!("Restart of '{}' ({}) failed: {}", id, session.scope(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stops every session of a definition.
    pub async fn stop_server(&self, id: &str) {
        let sessions = self.sessions_of(id);
        join_all(sessions.iter().map(|s| s.stop())).await;
    }

    /// Follows registry mutations until the registry goes away.
    ///
    /// Removed or disabled definitions lose their sessions, new settings are
    /// pushed, new initialization options force a restart.
    pub fn watch_registry(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.registry.subscribe();
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Registry watcher missed {} event(s)", missed);
                        continue;
                    }
                    Err(RecvError::Closed) => return,
                };
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                manager.apply_registry_event(event).await;
            }
        })
    }

    async fn apply_registry_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Added(id) => debug!("Definition '{}' added", id),
            RegistryEvent::Removed(id) => {
                let removed = self.drop_sessions(&id);
                if !removed.is_empty() {
                    info!("Definition '{}' removed; stopping {} session(s)", id, removed.len());
                }
                join_all(removed.iter().map(|s| s.stop())).await;
            }
            RegistryEvent::Replaced(id) => {
                // The next document rebuilds its session from the new definition.
                let replaced = self.drop_sessions(&id);
                if !replaced.is_empty() {
                    info!("Definition '{}' replaced; stopping {} session(s)", id, replaced.len());
                }
                join_all(replaced.iter().map(|s| s.stop())).await;
            }
            RegistryEvent::Changed {
                id,
                settings_changed,
                initialization_options_changed,
                enabled_changed,
            } => {
                let enabled = self.registry.get_definition(&id).is_some_and(|d| d.is_enabled());
                if enabled_changed && !enabled {
                    info!("Definition '{}' disabled; stopping its sessions", id);
                    self.stop_server(&id).await;
                    return;
                }
                if initialization_options_changed {
                    if let Err(e) = self.restart_live(&id).await {
                        warn!("Failed to apply new initialization options to '{}': {}", id, e);
                    }
                } else if settings_changed {
                    for session in self.sessions_of(&id) {
                        if let Err(e) = session.push_settings().await
                            && !matches!(e, LspError::NotStarted { .. })
                        {
                            warn!("Failed to push settings to '{}': {}", id, e);
                        }
                    }
                }
            }
        }
    }

    /// Removes every session of `id` from the map and returns them.
    fn drop_sessions(&self, id: &str) -> Vec<Arc<ServerSession>> {
        let mut sessions = self.sessions();
        let (gone, kept): (Vec<_>, Vec<_>) = sessions.drain(..).partition(|s| s.server_id() == id);
        *sessions = kept;
        gone
    }

    async fn restart_live(&self, id: &str) -> LspResult<()> {
        for session in self.sessions_of(id) {
            if session.state().is_live() {
                session.restart().await?;
            }
        }
        Ok(())
    }

    /// Status of every session, in creation order.
    #[must_use]
    pub fn all_server_status(&self) -> Vec<ServerStatus> {
        self.sessions().iter().map(|s| s.status()).collect()
    }

    /// Stops every session.
    pub async fn shutdown_all(&self) {
        let sessions = self.all_sessions();
        info!("Shutting down {} language server session(s)", sessions.len());
        join_all(sessions.iter().map(|s| s.stop())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::connection::ConnectionSpec;
    use crate::registry::Language;
    use std::collections::HashMap;

    fn definition(id: &str) -> ServerDefinition {
        ServerDefinition::new(
            id,
            ConnectionSpec::Process {
                command: vec!["unused".to_string()],
                working_dir: None,
                env: HashMap::new(),
            },
        )
    }

    fn manager(definitions: Vec<ServerDefinition>) -> anyhow::Result<Arc<SessionManager>> {
        let registry = Arc::new(DefinitionRegistry::new());
        for def in definitions {
            let id = def.id.clone();
            registry.add_definition(def);
            registry.register_association(Language::new("python"), &id, None, None)?;
        }
        Ok(SessionManager::new(
            registry,
            vec![PathBuf::from("/ws/a"), PathBuf::from("/ws/b")],
            SessionOptions::default(),
            EventBroadcaster::noop(),
        ))
    }

    #[test]
    fn test_application_scope_shares_one_session() -> anyhow::Result<()> {
        let manager = manager(vec![definition("app")])?;
        let def = manager.registry().get_definition("app").ok_or_else(|| anyhow::anyhow!("missing"))?;
        let first = manager.session_for(&def, Path::new("/ws/a/x.py"));
        let second = manager.session_for(&def, Path::new("/ws/b/y.py"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first.scope(), ScopeKey::Application);
        assert_eq!(manager.all_sessions().len(), 1);
        Ok(())
    }

    #[test]
    fn test_project_scope_splits_by_root() -> anyhow::Result<()> {
        let manager = manager(vec![definition("proj").with_scope(ServerScope::Project)])?;
        let def = manager.registry().get_definition("proj").ok_or_else(|| anyhow::anyhow!("missing"))?;
        let a = manager.session_for(&def, Path::new("/ws/a/x.py"));
        let a_again = manager.session_for(&def, Path::new("/ws/a/sub/z.py"));
        let b = manager.session_for(&def, Path::new("/ws/b/y.py"));
        assert!(Arc::ptr_eq(&a, &a_again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(*b.scope(), ScopeKey::Project(PathBuf::from("/ws/b")));
        Ok(())
    }

    #[test]
    fn test_singleton_collapses_project_scope() -> anyhow::Result<()> {
        let manager = manager(vec![
            definition("single")
                .with_scope(ServerScope::Project)
                .with_singleton(true),
        ])?;
        let def = manager.registry().get_definition("single").ok_or_else(|| anyhow::anyhow!("missing"))?;
        let a = manager.session_for(&def, Path::new("/ws/a/x.py"));
        let b = manager.session_for(&def, Path::new("/ws/b/y.py"));
        assert!(Arc::ptr_eq(&a, &b));
        Ok(())
    }

    #[test]
    fn test_sessions_for_follows_registry_order() -> anyhow::Result<()> {
        let manager = manager(vec![definition("one"), definition("two")])?;
        let doc = DocumentRef::from_path("/ws/a/x.py", Language::new("python"))?;
        let ids: Vec<String> = manager
            .sessions_for(&doc)
            .iter()
            .map(|s| s.server_id().to_string())
            .collect();
        assert_eq!(ids, vec!["one", "two"]);
        // Nothing started, nothing connected.
        assert!(manager.started_sessions_for(&doc).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_removed_definition_drops_sessions() -> anyhow::Result<()> {
        let manager = manager(vec![definition("gone")])?;
        let doc = DocumentRef::from_path("/ws/a/x.py", Language::new("python"))?;
        assert_eq!(manager.sessions_for(&doc).len(), 1);

        manager
            .apply_registry_event(RegistryEvent::Removed("gone".to_string()))
            .await;
        assert!(manager.all_sessions().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_replaced_definition_rebuilds_session() -> anyhow::Result<()> {
        let manager = manager(vec![definition("swap").with_settings(serde_json::json!({ "v": 1 }))])?;
        let doc = DocumentRef::from_path("/ws/a/x.py", Language::new("python"))?;
        let old = manager.sessions_for(&doc).into_iter().next().ok_or_else(|| anyhow::anyhow!("no session"))?;

        let replacement = ServerDefinition::new(
            "swap",
            ConnectionSpec::Process {
                command: vec!["new-server".to_string()],
                working_dir: None,
                env: HashMap::new(),
            },
        )
        .with_settings(serde_json::json!({ "v": 2 }));
        let mut events = manager.registry().subscribe();
        manager.registry().add_definition(replacement);
        let event = events.try_recv()?;
        assert_eq!(event, RegistryEvent::Replaced("swap".to_string()));
        manager.apply_registry_event(event).await;

        let new = manager.sessions_for(&doc).into_iter().next().ok_or_else(|| anyhow::anyhow!("no session"))?;
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(manager.all_sessions().len(), 1);
        assert_eq!(new.definition().settings(), Some(serde_json::json!({ "v": 2 })));
        assert!(matches!(
            &new.definition().connection,
            ConnectionSpec::Process { command, .. } if command == &["new-server"]
        ));
        assert_eq!(old.definition().settings(), Some(serde_json::json!({ "v": 1 })));
        Ok(())
    }
}
