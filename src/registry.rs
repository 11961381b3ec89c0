// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Server definitions, language associations and document matching.
//!
//! The registry answers one question for the rest of the runtime: which
//! server definitions apply to a document of a given language at a given
//! path. Definitions are shared as `Arc<ServerDefinition>`; the few fields
//! that can change at runtime (enabled flag, settings, initialization
//! options) sit behind interior locks so live sessions observe updates.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::{Config, DEFAULT_DISCONNECT_TIMEOUT_SECS, ServerConfig, ServerScope};
use crate::error::{LspError, LspResult};
pub use crate::lsp::connection::{ConnectionFactory, ConnectionSpec};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// An editor language, optionally derived from a base language.
#[derive(Clone, PartialEq, Eq)]
pub struct Language {
    id: String,
    base: Option<Arc<Language>>,
}

impl Language {
    /// A root language without a base.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base: None,
        }
    }

    /// A language derived from `base`.
    #[must_use]
    pub fn with_base(id: impl Into<String>, base: Self) -> Self {
        Self {
            id: id.into(),
            base: Some(Arc::new(base)),
        }
    }

    /// Language identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Direct base language, if any.
    #[must_use]
    pub fn base(&self) -> Option<&Self> {
        self.base.as_deref()
    }

    /// True when `other` is this language or one of its ancestors.
    #[must_use]
    pub fn is_kind_of(&self, other: &Self) -> bool {
        self.ancestry().any(|language| language.id == other.id)
    }

    /// This language followed by its ancestors, nearest first.
    pub fn ancestry(&self) -> impl Iterator<Item = &Self> {
        std::iter::successors(Some(self), |language| language.base())
    }
}

impl fmt::Debug for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain: Vec<&str> = self.ancestry().map(Self::id).collect();
        write!(f, "Language({})", chain.join(" < "))
    }
}

/// A configured language server.
pub struct ServerDefinition {
    /// Stable unique id.
    pub id: String,
    /// Display name.
    pub label: String,
    /// Free-form description.
    pub description: Option<String>,
    /// At most one live session per scope key.
    pub singleton: bool,
    /// Sharing scope of the sessions.
    pub scope: ServerScope,
    /// Idle time after the last document detaches before the session stops.
    pub disconnect_timeout: Duration,
    /// How the byte streams are obtained.
    pub connection: ConnectionSpec,
    enabled: AtomicBool,
    language_ids: RwLock<HashMap<String, String>>,
    initialization_options: RwLock<Option<serde_json::Value>>,
    settings: RwLock<Option<serde_json::Value>>,
}

impl fmt::Debug for ServerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDefinition")
            .field("id", &self.id)
            .field("singleton", &self.singleton)
            .field("scope", &self.scope)
            .field("enabled", &self.is_enabled())
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl ServerDefinition {
    /// Creates an enabled, application-scoped, non-singleton definition.
    #[must_use]
    pub fn new(id: impl Into<String>, connection: ConnectionSpec) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            description: None,
            singleton: false,
            scope: ServerScope::Application,
            disconnect_timeout: Duration::from_secs(DEFAULT_DISCONNECT_TIMEOUT_SECS.unsigned_abs()),
            connection,
            enabled: AtomicBool::new(true),
            language_ids: RwLock::new(HashMap::new()),
            initialization_options: RwLock::new(None),
            settings: RwLock::new(None),
        }
    }

    /// Builds a definition from a `[[server]]` entry.
    #[must_use]
    pub fn from_config(server: &ServerConfig) -> Self {
        let connection = server.address.as_ref().map_or_else(
            || ConnectionSpec::Process {
                command: server
                    .command
                    .iter()
                    .chain(server.args.iter())
                    .cloned()
                    .collect(),
                working_dir: server.working_dir.clone(),
                env: server.env.clone(),
            },
            |address| ConnectionSpec::Socket {
                address: address.clone(),
            },
        );

        let mut definition = Self::new(server.id.clone(), connection)
            .with_singleton(server.singleton)
            .with_scope(server.scope)
            .with_disconnect_timeout(server.disconnect_timeout());
        if let Some(label) = &server.label {
            definition = definition.with_label(label.clone());
        }
        definition.description.clone_from(&server.description);
        definition.enabled = AtomicBool::new(server.enabled);
        definition.initialization_options = RwLock::new(server.initialization_options.clone());
        definition.settings = RwLock::new(server.settings.clone());
        definition
    }

    /// Sets the display label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Sets the singleton flag.
    #[must_use]
    pub const fn with_singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    /// Sets the sharing scope.
    #[must_use]
    pub const fn with_scope(mut self, scope: ServerScope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the idle disconnect timeout. Zero falls back to the default.
    #[must_use]
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = if timeout.is_zero() {
            Duration::from_secs(DEFAULT_DISCONNECT_TIMEOUT_SECS.unsigned_abs())
        } else {
            timeout
        };
        self
    }

    /// Sets the settings pushed after the handshake.
    #[must_use]
    pub fn with_settings(self, settings: serde_json::Value) -> Self {
        *write(&self.settings) = Some(settings);
        self
    }

    /// Sets the `initializationOptions`.
    #[must_use]
    pub fn with_initialization_options(self, options: serde_json::Value) -> Self {
        *write(&self.initialization_options) = Some(options);
        self
    }

    /// Whether the definition currently participates in matching.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Current settings.
    #[must_use]
    pub fn settings(&self) -> Option<serde_json::Value> {
        read(&self.settings).clone()
    }

    /// Current initialization options.
    #[must_use]
    pub fn initialization_options(&self) -> Option<serde_json::Value> {
        read(&self.initialization_options).clone()
    }

    /// LSP `languageId` for a document of `language`.
    ///
    /// Walks the language ancestry; falls back to the language's own id.
    #[must_use]
    pub fn language_id_for(&self, language: &Language) -> String {
        let ids = read(&self.language_ids);
        language
            .ancestry()
            .find_map(|l| ids.get(l.id()).cloned())
            .unwrap_or_else(|| language.id().to_string())
    }

    fn record_language_id(&self, language: &Language, language_id: &str) {
        write(&self.language_ids)
            .entry(language.id().to_string())
            .or_insert_with(|| language_id.to_string());
    }
}

/// Compiled file-glob predicate of an association.
#[derive(Clone)]
pub struct DocumentMatcher {
    patterns: Vec<String>,
    set: GlobSet,
}

impl fmt::Debug for DocumentMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DocumentMatcher").field(&self.patterns).finish()
    }
}

impl DocumentMatcher {
    /// Compiles the given globs.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::InvalidPattern`] for the first pattern that does
    /// not parse.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> LspResult<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = Glob::new(pattern).map_err(|e| LspError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| LspError::InvalidPattern {
            pattern: patterns
                .iter()
                .map(AsRef::as_ref)
                .collect::<Vec<_>>()
                .join(", "),
            reason: e.to_string(),
        })?;
        Ok(Self {
            patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
            set,
        })
    }

    /// True when the full path or the bare file name matches any glob.
    #[must_use]
    pub fn is_match(&self, path: &Path) -> bool {
        self.set.is_match(path) || path.file_name().is_some_and(|name| self.set.is_match(name))
    }
}

/// A rule binding a language to a server definition.
#[derive(Debug, Clone)]
pub struct LanguageAssociation {
    /// Language the rule applies to (and every language derived from it).
    pub language: Language,
    /// Id of the bound definition.
    pub definition_id: String,
    /// `languageId` sent to the server.
    pub language_id: String,
    /// Optional path predicate.
    pub matcher: Option<DocumentMatcher>,
}

impl LanguageAssociation {
    /// True when a document at `path` may use this association.
    #[must_use]
    pub fn is_eligible(&self, path: &Path) -> bool {
        self.matcher
            .as_ref()
            .is_none_or(|matcher| matcher.is_match(path))
    }
}

/// Partial update applied by [`DefinitionRegistry::update_definition`].
#[derive(Debug, Clone, Default)]
pub struct DefinitionUpdate {
    /// New settings; `Some(Value::Null)` clears them.
    pub settings: Option<serde_json::Value>,
    /// New initialization options; `Some(Value::Null)` clears them.
    pub initialization_options: Option<serde_json::Value>,
    /// New enabled flag.
    pub enabled: Option<bool>,
}

/// Registry mutation notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A definition was added.
    Added(String),
    /// A definition with an existing id took the old one's place.
    Replaced(String),
    /// A definition and its associations were removed.
    Removed(String),
    /// A definition changed in place.
    Changed {
        /// Definition id.
        id: String,
        /// Settings were replaced.
        settings_changed: bool,
        /// Initialization options were replaced.
        initialization_options_changed: bool,
        /// The enabled flag flipped.
        enabled_changed: bool,
    },
}

#[derive(Default)]
struct RegistryInner {
    definitions: Vec<Arc<ServerDefinition>>,
    associations: Vec<LanguageAssociation>,
    languages: HashMap<String, Language>,
    factories: HashMap<String, ConnectionFactory>,
}

/// The set of known server definitions and their language associations.
pub struct DefinitionRegistry {
    inner: RwLock<RegistryInner>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for DefinitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(RegistryInner::default()),
            events,
        }
    }

    /// Builds a registry from configuration.
    ///
    /// Languages are declared first so associations resolve their
    /// hierarchy; servers and their associations follow in file order.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::InvalidPattern`] if an association glob does not
    /// compile.
    pub fn from_config(config: &Config) -> LspResult<Self> {
        let registry = Self::new();
        for id in config.language.keys() {
            registry.declare_language(resolve_language(config, id, &mut Vec::new()));
        }

        for server in &config.server {
            registry.add_definition(ServerDefinition::from_config(server));
            for binding in &server.languages {
                let matcher = if binding.patterns.is_empty() {
                    None
                } else {
                    Some(DocumentMatcher::new(&binding.patterns)?)
                };
                let language = registry.language(&binding.language);
                registry.register_association(
                    language,
                    &server.id,
                    binding.language_id.as_deref(),
                    matcher,
                )?;
            }
        }
        Ok(registry)
    }

    /// Resolves a language id to a declared language; unknown ids become
    /// root languages.
    #[must_use]
    pub fn language(&self, id: &str) -> Language {
        read(&self.inner)
            .languages
            .get(id)
            .cloned()
            .unwrap_or_else(|| Language::new(id))
    }

    /// Declares (or redeclares) a language.
    pub fn declare_language(&self, language: Language) {
        write(&self.inner)
            .languages
            .insert(language.id().to_string(), language);
    }

    /// Subscribes to registry mutations.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Definitions applicable to a document of `language` at `path`.
    ///
    /// Order follows association registration, deduplicated by id; disabled
    /// definitions are skipped.
    #[must_use]
    pub fn find_definitions_for(&self, language: &Language, path: &Path) -> Vec<Arc<ServerDefinition>> {
        let inner = read(&self.inner);
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        for association in &inner.associations {
            if !language.is_kind_of(&association.language) || !association.is_eligible(path) {
                continue;
            }
            if seen.contains(association.definition_id.as_str()) {
                continue;
            }
            let Some(definition) = inner
                .definitions
                .iter()
                .find(|d| d.id == association.definition_id)
            else {
                continue;
            };
            if !definition.is_enabled() {
                continue;
            }
            seen.insert(association.definition_id.as_str());
            found.push(Arc::clone(definition));
        }
        found
    }

    /// Looks a definition up by id.
    #[must_use]
    pub fn get_definition(&self, id: &str) -> Option<Arc<ServerDefinition>> {
        read(&self.inner)
            .definitions
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }

    /// Every definition, in registration order.
    #[must_use]
    pub fn all_definitions(&self) -> Vec<Arc<ServerDefinition>> {
        read(&self.inner).definitions.clone()
    }

    /// Associations bound to the definition `id`.
    #[must_use]
    pub fn associations_for(&self, id: &str) -> Vec<LanguageAssociation> {
        read(&self.inner)
            .associations
            .iter()
            .filter(|a| a.definition_id == id)
            .cloned()
            .collect()
    }

    /// Adds a definition.
    ///
    /// An existing definition with the same id is replaced, keeps its
    /// associations and emits [`RegistryEvent::Replaced`] instead of
    /// [`RegistryEvent::Added`].
    pub fn add_definition(&self, definition: ServerDefinition) -> Arc<ServerDefinition> {
        let definition = Arc::new(definition);
        let id = definition.id.clone();
        let replaced = {
            let mut inner = write(&self.inner);
            let replaced = if let Some(slot) = inner.definitions.iter_mut().find(|d| d.id == id) {
                warn!("Replacing server definition '{}'", id);
                *slot = Arc::clone(&definition);
                true
            } else {
                inner.definitions.push(Arc::clone(&definition));
                false
            };
            for association in inner.associations.iter().filter(|a| a.definition_id == id) {
                definition.record_language_id(&association.language, &association.language_id);
            }
            replaced
        };
        debug!("Registered server definition '{}'", id);
        self.emit(if replaced {
            RegistryEvent::Replaced(id)
        } else {
            RegistryEvent::Added(id)
        });
        definition
    }

    /// Removes a definition and its associations.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::DefinitionNotFound`] for an unknown id.
    pub fn remove_definition(&self, id: &str) -> LspResult<Arc<ServerDefinition>> {
        let removed = {
            let mut inner = write(&self.inner);
            let index = inner
                .definitions
                .iter()
                .position(|d| d.id == id)
                .ok_or_else(|| LspError::DefinitionNotFound(id.to_string()))?;
            inner.associations.retain(|a| a.definition_id != id);
            inner.factories.remove(id);
            inner.definitions.remove(index)
        };
        debug!("Removed server definition '{}'", id);
        self.emit(RegistryEvent::Removed(id.to_string()));
        Ok(removed)
    }

    /// Binds `language` to the definition `id`.
    ///
    /// `language_id` defaults to the language's own id.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::DefinitionNotFound`] when no definition has that id.
    pub fn register_association(
        &self,
        language: Language,
        id: &str,
        language_id: Option<&str>,
        matcher: Option<DocumentMatcher>,
    ) -> LspResult<()> {
        let mut inner = write(&self.inner);
        let definition = inner
            .definitions
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| LspError::DefinitionNotFound(id.to_string()))?;
        let language_id = language_id.unwrap_or_else(|| language.id()).to_string();
        definition.record_language_id(&language, &language_id);
        inner.associations.push(LanguageAssociation {
            language,
            definition_id: id.to_string(),
            language_id,
            matcher,
        });
        Ok(())
    }

    /// Applies an in-place update and emits [`RegistryEvent::Changed`] when
    /// anything actually changed.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::DefinitionNotFound`] for an unknown id.
    pub fn update_definition(&self, id: &str, update: DefinitionUpdate) -> LspResult<()> {
        let definition = self
            .get_definition(id)
            .ok_or_else(|| LspError::DefinitionNotFound(id.to_string()))?;

        let settings_changed = update
            .settings
            .is_some_and(|value| replace_json(&definition.settings, value));
        let initialization_options_changed = update
            .initialization_options
            .is_some_and(|value| replace_json(&definition.initialization_options, value));
        let enabled_changed = update
            .enabled
            .is_some_and(|enabled| definition.enabled.swap(enabled, Ordering::SeqCst) != enabled);

        if settings_changed || initialization_options_changed || enabled_changed {
            self.emit(RegistryEvent::Changed {
                id: id.to_string(),
                settings_changed,
                initialization_options_changed,
                enabled_changed,
            });
        }
        Ok(())
    }

    /// Enables or disables a definition.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::DefinitionNotFound`] for an unknown id.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> LspResult<()> {
        self.update_definition(
            id,
            DefinitionUpdate {
                enabled: Some(enabled),
                ..DefinitionUpdate::default()
            },
        )
    }

    /// Registers a factory that overrides the definition's own connection.
    pub fn register_connection_factory(&self, id: &str, factory: ConnectionFactory) {
        write(&self.inner).factories.insert(id.to_string(), factory);
    }

    /// Connection to use for a definition: its registered factory, else its
    /// own [`ConnectionSpec`].
    #[must_use]
    pub fn connection_for(&self, definition: &ServerDefinition) -> ConnectionSpec {
        read(&self.inner)
            .factories
            .get(&definition.id)
            .map_or_else(
                || definition.connection.clone(),
                |factory| ConnectionSpec::Factory(Arc::clone(factory)),
            )
    }

    fn emit(&self, event: RegistryEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

fn resolve_language(config: &Config, id: &str, visiting: &mut Vec<String>) -> Language {
    if visiting.iter().any(|v| v == id) {
        warn!("Language hierarchy cycle at '{}'", id);
        return Language::new(id);
    }
    let base = config.language.get(id).and_then(|l| l.base.as_deref());
    match base {
        Some(base) => {
            visiting.push(id.to_string());
            let parent = resolve_language(config, base, visiting);
            visiting.pop();
            Language::with_base(id, parent)
        }
        None => Language::new(id),
    }
}

fn replace_json(slot: &RwLock<Option<serde_json::Value>>, value: serde_json::Value) -> bool {
    let value = (!value.is_null()).then_some(value);
    let mut guard = write(slot);
    if *guard == value {
        return false;
    }
    *guard = value;
    true
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    fn process(command: &str) -> ConnectionSpec {
        ConnectionSpec::Process {
            command: vec![command.to_string()],
            working_dir: None,
            env: HashMap::new(),
        }
    }

    fn ids(definitions: &[Arc<ServerDefinition>]) -> Vec<&str> {
        definitions.iter().map(|d| d.id.as_str()).collect()
    }

    #[test]
    fn test_language_hierarchy() {
        let python = Language::new("python");
        let django = Language::with_base("django-python", python.clone());
        assert!(django.is_kind_of(&python));
        assert!(django.is_kind_of(&django));
        assert!(!python.is_kind_of(&django));
        assert_eq!(format!("{django:?}"), "Language(django-python < python)");
    }

    #[test]
    fn test_matching_follows_registration_order_and_dedups() -> Result<()> {
        let registry = DefinitionRegistry::new();
        registry.add_definition(ServerDefinition::new("ruff", process("ruff")));
        registry.add_definition(ServerDefinition::new("pyright", process("pyright")));
        let python = Language::new("python");

        registry.register_association(python.clone(), "pyright", None, None)?;
        registry.register_association(python.clone(), "ruff", None, None)?;
        registry.register_association(python.clone(), "pyright", Some("python"), None)?;

        let found = registry.find_definitions_for(&python, Path::new("/w/a.py"));
        assert_eq!(ids(&found), vec!["pyright", "ruff"]);
        Ok(())
    }

    #[test]
    fn test_derived_language_matches_base_associations() -> Result<()> {
        let registry = DefinitionRegistry::new();
        registry.add_definition(ServerDefinition::new("pyright", process("pyright")));
        let python = Language::new("python");
        let django = Language::with_base("django-python", python.clone());
        registry.register_association(python, "pyright", None, None)?;

        let found = registry.find_definitions_for(&django, Path::new("/w/views.py"));
        assert_eq!(ids(&found), vec!["pyright"]);
        let definition = registry.get_definition("pyright").context("missing pyright")?;
        assert_eq!(definition.language_id_for(&django), "python");
        Ok(())
    }

    #[test]
    fn test_glob_matcher_filters_paths() -> Result<()> {
        let registry = DefinitionRegistry::new();
        registry.add_definition(ServerDefinition::new("stubs", process("stubs")));
        let python = Language::new("python");
        let matcher = DocumentMatcher::new(&["*.pyi"])?;
        registry.register_association(python.clone(), "stubs", None, Some(matcher))?;

        assert!(registry.find_definitions_for(&python, Path::new("/w/a.py")).is_empty());
        assert_eq!(
            ids(&registry.find_definitions_for(&python, Path::new("/w/a.pyi"))),
            vec!["stubs"]
        );
        Ok(())
    }

    #[test]
    fn test_disabled_and_unassociated_definitions_never_match() -> Result<()> {
        let registry = DefinitionRegistry::new();
        registry.add_definition(ServerDefinition::new("lonely", process("lonely")));
        registry.add_definition(ServerDefinition::new("off", process("off")));
        let python = Language::new("python");
        registry.register_association(python.clone(), "off", None, None)?;
        registry.set_enabled("off", false)?;

        assert!(registry.find_definitions_for(&python, Path::new("/w/a.py")).is_empty());
        Ok(())
    }

    #[test]
    fn test_unknown_definition_is_an_error() {
        let registry = DefinitionRegistry::new();
        let err = registry.register_association(Language::new("python"), "nope", None, None);
        assert!(matches!(err, Err(LspError::DefinitionNotFound(id)) if id == "nope"));
        assert!(registry.remove_definition("nope").is_err());
    }

    #[test]
    fn test_remove_drops_associations_and_emits() -> Result<()> {
        let registry = DefinitionRegistry::new();
        let mut events = registry.subscribe();
        registry.add_definition(ServerDefinition::new("pyright", process("pyright")));
        registry.register_association(Language::new("python"), "pyright", None, None)?;
        registry.remove_definition("pyright")?;

        assert!(registry.associations_for("pyright").is_empty());
        assert_eq!(events.try_recv()?, RegistryEvent::Added("pyright".to_string()));
        assert_eq!(events.try_recv()?, RegistryEvent::Removed("pyright".to_string()));
        Ok(())
    }

    #[test]
    fn test_same_id_replaces_and_keeps_associations() -> Result<()> {
        let registry = DefinitionRegistry::new();
        let mut events = registry.subscribe();
        registry.add_definition(ServerDefinition::new("pyright", process("old")));
        registry.register_association(Language::new("python"), "pyright", Some("py"), None)?;
        let replacement = registry.add_definition(ServerDefinition::new("pyright", process("new")));

        assert_eq!(events.try_recv()?, RegistryEvent::Added("pyright".to_string()));
        assert_eq!(events.try_recv()?, RegistryEvent::Replaced("pyright".to_string()));
        assert_eq!(registry.all_definitions().len(), 1);
        let current = registry.get_definition("pyright").context("missing pyright")?;
        assert!(Arc::ptr_eq(&current, &replacement));
        assert_eq!(current.language_id_for(&Language::new("python")), "py");
        assert_eq!(registry.associations_for("pyright").len(), 1);
        Ok(())
    }

    #[test]
    fn test_update_emits_only_real_changes() -> Result<()> {
        let registry = DefinitionRegistry::new();
        registry.add_definition(
            ServerDefinition::new("pyright", process("pyright"))
                .with_settings(serde_json::json!({"a": 1})),
        );
        let mut events = registry.subscribe();

        registry.update_definition(
            "pyright",
            DefinitionUpdate {
                settings: Some(serde_json::json!({"a": 1})),
                ..DefinitionUpdate::default()
            },
        )?;
        assert!(events.try_recv().is_err());

        registry.update_definition(
            "pyright",
            DefinitionUpdate {
                settings: Some(serde_json::json!({"a": 2})),
                ..DefinitionUpdate::default()
            },
        )?;
        assert_eq!(
            events.try_recv()?,
            RegistryEvent::Changed {
                id: "pyright".to_string(),
                settings_changed: true,
                initialization_options_changed: false,
                enabled_changed: false,
            }
        );
        let definition = registry.get_definition("pyright").context("missing pyright")?;
        assert_eq!(definition.settings(), Some(serde_json::json!({"a": 2})));
        Ok(())
    }

    #[test]
    fn test_from_config() -> Result<()> {
        let config = Config::from_toml(
            r#"
[language.python]
[language.django-python]
base = "python"

[[server]]
id = "pyright"
command = "pyright-langserver"
args = ["--stdio"]
scope = "project"

[[server.languages]]
language = "python"
patterns = ["*.py"]

[[server]]
id = "remote"
address = "127.0.0.1:9000"
singleton = true
disconnect_timeout = -3

[[server.languages]]
language = "django-python"
language_id = "python"
"#,
        )?;
        let registry = DefinitionRegistry::from_config(&config)?;

        let django = registry.language("django-python");
        assert!(django.is_kind_of(&registry.language("python")));
        let found = registry.find_definitions_for(&django, Path::new("/w/views.py"));
        assert_eq!(ids(&found), vec!["pyright", "remote"]);

        let pyright = registry.get_definition("pyright").context("missing pyright")?;
        assert_eq!(pyright.scope, ServerScope::Project);
        assert!(matches!(
            &pyright.connection,
            ConnectionSpec::Process { command, .. } if command == &["pyright-langserver", "--stdio"]
        ));

        let remote = registry.get_definition("remote").context("missing remote")?;
        assert!(remote.singleton);
        assert_eq!(remote.disconnect_timeout, Duration::from_secs(5));
        assert!(matches!(&remote.connection, ConnectionSpec::Socket { address } if address == "127.0.0.1:9000"));
        Ok(())
    }
}
