// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Integration tests for fanning feature requests out to several servers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use lsp_types::{FormattingOptions, HoverContents, MarkupContent, Position, Range};
use serde_json::Value;
use switchyard::config::ErrorReporting;
use switchyard::features::{UsageKind, apply_text_edits};
use switchyard::lsp::{ConnectionSpec, SessionManager, SessionOptions};
use switchyard::{
    DefinitionRegistry, Dispatcher, DocumentRef, EventBroadcaster, EventKind, Language, LspError,
    ServerDefinition, TextBuffer,
};
use tempfile::TempDir;

const SOURCE: &str = "def foo():\n    return 1\n\nfoo()\n";

fn mockls(id: &str, record: &Path, extra: &[&str]) -> ServerDefinition {
    let mut command = vec![
        env!("CARGO_BIN_EXE_mockls").to_string(),
        "--name".to_string(),
        id.to_string(),
        "--record".to_string(),
        record.display().to_string(),
    ];
    command.extend(extra.iter().map(ToString::to_string));
    ServerDefinition::new(
        id,
        ConnectionSpec::Process {
            command,
            working_dir: None,
            env: HashMap::new(),
        },
    )
}

struct Fixture {
    dir: TempDir,
    dispatcher: Dispatcher,
    events: EventBroadcaster,
    doc: DocumentRef,
}

impl Fixture {
    /// Two python servers, `alpha` registered before `beta`.
    async fn new(alpha: &[&str], beta: &[&str]) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let registry = DefinitionRegistry::new();
        registry.add_definition(mockls("alpha", &dir.path().join("alpha.jsonl"), alpha));
        registry.add_definition(mockls("beta", &dir.path().join("beta.jsonl"), beta));
        registry.register_association(Language::new("python"), "alpha", None, None)?;
        registry.register_association(Language::new("python"), "beta", None, None)?;

        let events = EventBroadcaster::noop();
        let manager = SessionManager::new(
            Arc::new(registry),
            vec![dir.path().to_path_buf()],
            SessionOptions {
                request_timeout: Duration::from_secs(5),
                handshake_timeout: Duration::from_secs(5),
                shutdown_grace: Duration::from_millis(500),
                error_reporting: ErrorReporting::Notification,
            },
            events.clone(),
        );
        let doc = DocumentRef::from_path(dir.path().join("a.py"), Language::new("python"))?;
        let connected = manager.connect_document(&doc, &TextBuffer::new(SOURCE)).await;
        if connected.len() != 2 {
            return Err(anyhow!("Expected both servers to start, got {}", connected.len()));
        }
        Ok(Self {
            dir,
            dispatcher: Dispatcher::new(manager),
            events,
            doc,
        })
    }

    fn recorded(&self, id: &str) -> Result<Vec<Value>> {
        let text = std::fs::read_to_string(self.dir.path().join(format!("{id}.jsonl")))?;
        text.lines()
            .map(|line| serde_json::from_str(line).context("Invalid JSON line in record"))
            .collect()
    }

    async fn shutdown(self) {
        self.dispatcher.manager().shutdown_all().await;
    }
}

fn hover_text(contents: &HoverContents) -> String {
    match contents {
        HoverContents::Markup(MarkupContent { value, .. }) => value.clone(),
        other => format!("{other:?}"),
    }
}

#[tokio::test]
async fn test_predicate_selects_capable_servers() -> Result<()> {
    let fixture = Fixture::new(&[], &["--without", "definitionProvider"]).await?;

    let merged = fixture.dispatcher.definition(&fixture.doc, Position::new(3, 0)).await?;
    let ids: Vec<&str> = merged
        .contributions
        .iter()
        .map(|c| c.server_id.as_str())
        .collect();
    assert_eq!(ids, vec!["alpha"]);
    let location = merged.items().next().context("No definition")?;
    assert_eq!(location.uri, fixture.doc.uri);
    assert_eq!(location.range.start, Position::new(0, 0));

    fixture.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_merge_keeps_registration_order() -> Result<()> {
    let fixture = Fixture::new(&[], &[]).await?;
    let merged = fixture.dispatcher.hover(&fixture.doc, Position::new(0, 4)).await?;
    let texts: Vec<String> = merged.items().map(|h| hover_text(&h.contents)).collect();
    assert_eq!(texts, vec!["alpha: `foo`", "beta: `foo`"]);
    assert!(merged.failures.is_empty());
    fixture.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_failing_server_contributes_nothing() -> Result<()> {
    let fixture = Fixture::new(&["--fail-on", "textDocument/definition"], &[]).await?;
    let mut events = fixture.events.subscribe();

    let merged = fixture.dispatcher.definition(&fixture.doc, Position::new(3, 0)).await?;
    let ids: Vec<&str> = merged
        .contributions
        .iter()
        .map(|c| c.server_id.as_str())
        .collect();
    assert_eq!(ids, vec!["beta"]);
    assert_eq!(merged.failures.len(), 1);
    assert_eq!(merged.failures[0].server_id, "alpha");
    assert!(matches!(merged.failures[0].error, LspError::Server { code: -32603, .. }));

    let mut reported = false;
    while let Ok(event) = events.try_recv() {
        reported |= matches!(
            event.kind,
            EventKind::RequestFailed { ref server, .. } if server == "alpha"
        );
    }
    assert!(reported, "RequestFailed not broadcast");
    fixture.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_cancel_sends_cancel_request_and_yields_cancelled() -> Result<()> {
    let fixture = Fixture::new(&["--hang-on", "textDocument/hover"], &[]).await?;

    let request = fixture.dispatcher.hover(&fixture.doc, Position::new(0, 4));
    let cancellation = request.cancellation().clone();
    let pending = tokio::spawn(request);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        cancellation
            .pending_requests()
            .iter()
            .any(|p| p.server_id == "alpha")
    );
    cancellation.cancel();

    let result = tokio::time::timeout(Duration::from_secs(3), pending).await??;
    assert!(matches!(result, Err(LspError::Cancelled)));
    assert!(cancellation.pending_requests().is_empty());

    let alpha = fixture.recorded("alpha")?;
    let hover_id = alpha
        .iter()
        .find(|m| m["method"] == "textDocument/hover")
        .map(|m| m["id"].clone())
        .context("hover not recorded")?;
    assert!(
        alpha
            .iter()
            .any(|m| m["method"] == "$/cancelRequest" && m["params"]["id"] == hover_id),
        "no $/cancelRequest for the hung hover"
    );
    fixture.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_host_cancellation_check_is_polled() -> Result<()> {
    let fixture = Fixture::new(&["--hang-on", "textDocument/hover"], &["--hang-on", "textDocument/hover"]).await?;
    let host_cancelled = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&host_cancelled);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        flag.store(true, Ordering::SeqCst);
    });

    let checker = || host_cancelled.load(Ordering::SeqCst);
    let result = fixture
        .dispatcher
        .hover(&fixture.doc, Position::new(0, 4))
        .wait_with(&checker)
        .await;
    assert!(matches!(result, Err(LspError::Cancelled)));
    fixture.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_no_eligible_server_is_empty_not_error() -> Result<()> {
    let fixture = Fixture::new(
        &["--without", "foldingRangeProvider"],
        &["--without", "foldingRangeProvider"],
    )
    .await?;
    let merged = fixture.dispatcher.folding_ranges(&fixture.doc).await?;
    assert!(merged.is_empty());
    assert!(merged.contributions.is_empty());

    let other = DocumentRef::from_path(fixture.dir.path().join("b.rs"), Language::new("rust"))?;
    let merged = fixture.dispatcher.hover(&other, Position::new(0, 0)).await?;
    assert!(merged.is_empty());
    fixture.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_usages_are_tagged_by_kind() -> Result<()> {
    let fixture = Fixture::new(
        &[
            "--without",
            "declarationProvider",
            "--without",
            "typeDefinitionProvider",
            "--without",
            "implementationProvider",
        ],
        &["--without", "referencesProvider", "--fail-on", "textDocument/typeDefinition"],
    )
    .await?;

    let merged = fixture.dispatcher.usages(&fixture.doc, Position::new(3, 0)).await?;
    let alpha: Vec<UsageKind> = merged.contributions[0].items.iter().map(|u| u.kind).collect();
    assert!(alpha.contains(&UsageKind::Definition));
    assert_eq!(
        alpha.iter().filter(|k| **k == UsageKind::Reference).count(),
        2,
        "both occurrences of foo"
    );

    let beta = &merged.contributions[1];
    assert_eq!(beta.server_id, "beta");
    let beta_kinds: Vec<UsageKind> = beta.items.iter().map(|u| u.kind).collect();
    assert!(beta_kinds.contains(&UsageKind::Declaration));
    assert!(beta_kinds.contains(&UsageKind::Implementation));
    assert!(!beta_kinds.contains(&UsageKind::TypeDefinition));
    assert!(!beta_kinds.contains(&UsageKind::Reference));
    assert!(merged.failures.is_empty());
    fixture.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_inlay_hint_resolves_on_its_own_server() -> Result<()> {
    let fixture = Fixture::new(&[], &[]).await?;
    let range = Range::new(Position::new(0, 0), Position::new(4, 0));
    let hints = fixture
        .dispatcher
        .inlay_hints(&fixture.doc, range)
        .await?
        .into_items();
    assert_eq!(hints.len(), 2);

    let beta_hint = hints
        .into_iter()
        .find(|h| h.server_id == "beta")
        .context("No hint from beta")?;
    let resolved = fixture
        .dispatcher
        .resolve_inlay_hint(&fixture.doc, beta_hint, None)
        .await?;
    assert_eq!(resolved.server_id, "beta");
    let tooltip = serde_json::to_value(&resolved.hint.tooltip)?;
    assert_eq!(tooltip, "resolved by beta");

    assert_eq!(
        fixture
            .recorded("alpha")?
            .iter()
            .filter(|m| m["method"] == "inlayHint/resolve")
            .count(),
        0
    );
    fixture.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_format_uses_first_server_only() -> Result<()> {
    let fixture = Fixture::new(&["--without", "documentRangeFormattingProvider"], &[]).await?;

    let edits = fixture
        .dispatcher
        .format(&fixture.doc, FormattingOptions::default(), None, None)
        .await?;
    let formatted = apply_text_edits(SOURCE, &edits)?;
    assert!(formatted.starts_with("// formatted by alpha\n"));
    assert!(formatted.ends_with(SOURCE));

    // Range formatting skips alpha, which cannot do it.
    let range = Range::new(Position::new(3, 0), Position::new(3, 5));
    let edits = fixture
        .dispatcher
        .format(&fixture.doc, FormattingOptions::default(), Some(range), None)
        .await?;
    let formatted = apply_text_edits(SOURCE, &edits)?;
    assert!(formatted.contains("\n// range formatted by beta\nfoo()"));

    assert_eq!(
        fixture
            .recorded("beta")?
            .iter()
            .filter(|m| m["method"] == "textDocument/formatting")
            .count(),
        0
    );
    fixture.shutdown().await;
    Ok(())
}

#[test]
fn test_blocking_wait_from_host_thread() -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    let fixture = runtime.block_on(Fixture::new(&[], &[]))?;

    let never = || false;
    let merged = fixture
        .dispatcher
        .completion(&fixture.doc, Position::new(0, 0))
        .block_with(runtime.handle(), &never)?;
    let labels: Vec<&str> = merged.items().map(|item| item.label.as_str()).collect();
    assert_eq!(labels, vec!["alpha-item", "beta-item"]);

    runtime.block_on(fixture.shutdown());
    Ok(())
}

#[tokio::test]
async fn test_published_diagnostics_are_cached_per_session() -> Result<()> {
    let fixture = Fixture::new(&[], &["--no-diagnostics"]).await?;
    let sessions = fixture.dispatcher.manager().started_sessions_for(&fixture.doc);
    let alpha = sessions
        .iter()
        .find(|s| s.server_id() == "alpha")
        .context("alpha not started")?;
    let beta = sessions
        .iter()
        .find(|s| s.server_id() == "beta")
        .context("beta not started")?;

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let diagnostics = loop {
        let diagnostics = alpha.diagnostics(&fixture.doc.uri).await;
        if !diagnostics.is_empty() {
            break diagnostics;
        }
        if std::time::Instant::now() > deadline {
            return Err(anyhow!("No diagnostics from alpha"));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(diagnostics[0].source.as_deref(), Some("mockls"));
    assert!(beta.diagnostics(&fixture.doc.uri).await.is_empty());

    alpha.stop().await;
    assert!(alpha.diagnostics(&fixture.doc.uri).await.is_empty());
    fixture.shutdown().await;
    Ok(())
}
