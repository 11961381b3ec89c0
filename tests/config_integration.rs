// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Integration tests for loading configuration files and turning them into a
//! working registry.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use switchyard::config::{ErrorReporting, ServerScope};
use switchyard::lsp::SessionManager;
use switchyard::{Config, DefinitionRegistry, DocumentRef, EventBroadcaster, LspError, TextBuffer};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Writes `document` as TOML and returns its path.
fn write_config(dir: &Path, document: &Value) -> Result<PathBuf> {
    let path = dir.join("switchyard.toml");
    let text = toml::to_string(document).context("Config is not representable as TOML")?;
    std::fs::write(&path, text)?;
    Ok(path)
}

fn sample(record: &Path) -> Value {
    json!({
        "request_timeout": 7,
        "error_reporting": "in_log",
        "language": {
            "python": {},
            "django-python": { "base": "python" }
        },
        "server": [
            {
                "id": "mock",
                "label": "Mock Server",
                "command": env!("CARGO_BIN_EXE_mockls"),
                "args": ["--name", "mock", "--record", record.display().to_string(), "--no-diagnostics"],
                "scope": "project",
                "disconnect_timeout": -3,
                "settings": { "mock": { "strict": true } },
                "languages": [
                    { "language": "python", "language_id": "py", "patterns": ["*.py"] }
                ]
            },
            {
                "id": "remote",
                "address": "127.0.0.1:1",
                "singleton": true,
                "enabled": false,
                "languages": [ { "language": "python" } ]
            }
        ]
    })
}

#[test]
fn test_file_layer_overrides_defaults() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(dir.path(), &sample(&dir.path().join("unused.jsonl")))?;

    let config = Config::load(Some(path))?;
    assert_eq!(config.request_timeout(), Duration::from_secs(7));
    assert_eq!(config.handshake_timeout(), Duration::from_secs(30));
    assert_eq!(config.shutdown_grace(), Duration::from_millis(1000));
    assert_eq!(config.error_reporting, ErrorReporting::InLog);

    assert_eq!(config.server.len(), 2);
    let mock = &config.server[0];
    assert_eq!(mock.scope, ServerScope::Project);
    assert_eq!(mock.label.as_deref(), Some("Mock Server"));
    assert_eq!(mock.disconnect_timeout(), Duration::from_secs(5));
    assert!(config.server[1].singleton);
    assert!(!config.server[1].enabled);
    Ok(())
}

#[test]
fn test_malformed_file_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(dir.path(), &json!({ "request_timeout": "soon" }))?;
    assert!(Config::load(Some(path)).is_err());

    let missing = dir.path().join("absent.toml");
    assert!(Config::load(Some(missing)).is_err());
    Ok(())
}

#[test]
fn test_registry_follows_language_hierarchy() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(dir.path(), &sample(&dir.path().join("unused.jsonl")))?;
    let registry = DefinitionRegistry::from_config(&Config::load(Some(path))?)?;

    let django = registry.language("django-python");
    assert!(django.is_kind_of(&registry.language("python")));

    let found = registry.find_definitions_for(&django, &dir.path().join("views.py"));
    let ids: Vec<&str> = found.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["mock"], "disabled servers never match");
    assert_eq!(found[0].language_id_for(&django), "py");
    assert_eq!(found[0].label, "Mock Server");

    assert!(
        registry
            .find_definitions_for(&django, &dir.path().join("views.html"))
            .is_empty()
    );

    let remote = registry.get_definition("remote").context("remote not registered")?;
    assert!(!remote.is_enabled());
    Ok(())
}

#[test]
fn test_bad_pattern_fails_registry() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(
        dir.path(),
        &json!({
            "server": [{
                "id": "broken",
                "command": "true",
                "languages": [{ "language": "rust", "patterns": ["src/[lib.rs"] }]
            }]
        }),
    )?;
    let config = Config::load(Some(path))?;
    match DefinitionRegistry::from_config(&config) {
        Err(LspError::InvalidPattern { pattern, .. }) => assert_eq!(pattern, "src/[lib.rs"),
        Err(other) => return Err(anyhow!("Unexpected error: {other}")),
        Ok(_) => return Err(anyhow!("Invalid glob accepted")),
    }
    Ok(())
}

#[tokio::test]
async fn test_configured_server_runs_end_to_end() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let record = dir.path().join("wire.jsonl");
    let path = write_config(dir.path(), &sample(&record))?;
    let config = Config::load(Some(path))?;

    let manager = SessionManager::from_config(
        &config,
        vec![dir.path().to_path_buf()],
        EventBroadcaster::noop(),
    )?;
    let django = manager.registry().language("django-python");
    let doc = DocumentRef::from_path(dir.path().join("views.py"), django)?;
    let connected = manager.connect_document(&doc, &TextBuffer::new("x = 1\n")).await;
    assert_eq!(connected.len(), 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    let messages = loop {
        let text = std::fs::read_to_string(&record).unwrap_or_default();
        let messages: Vec<Value> = text
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        if messages
            .iter()
            .any(|m| m["method"] == "workspace/didChangeConfiguration")
        {
            break messages;
        }
        if Instant::now() > deadline {
            return Err(anyhow!("Settings never pushed"));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    let open = messages
        .iter()
        .find(|m| m["method"] == "textDocument/didOpen")
        .context("No didOpen")?;
    assert_eq!(open["params"]["textDocument"]["languageId"], "py");
    let settings = messages
        .iter()
        .find(|m| m["method"] == "workspace/didChangeConfiguration")
        .context("No settings push")?;
    assert_eq!(settings["params"]["settings"], json!({ "mock": { "strict": true } }));

    manager.shutdown_all().await;
    Ok(())
}
