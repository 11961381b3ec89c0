// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Typed feature requests on top of the [`Dispatcher`].
//!
//! Every helper picks the matching capability predicate, builds the request
//! per session and flattens the server's answer into a list of items.

use futures_util::future::join_all;
use lsp_types::request::{
    CodeLensRequest, Completion, DocumentHighlightRequest, DocumentLinkRequest, FoldingRangeRequest,
    Formatting, GotoDeclaration, GotoDefinition, GotoImplementation, GotoTypeDefinition, HoverRequest,
    InlayHintRequest, InlayHintResolveRequest, RangeFormatting, References, SignatureHelpRequest,
};
use lsp_types::{
    CodeLens, CodeLensParams, CompletionItem, CompletionParams, CompletionResponse,
    DocumentFormattingParams, DocumentHighlight, DocumentHighlightParams, DocumentLink,
    DocumentLinkParams, DocumentRangeFormattingParams, FoldingRange, FoldingRangeParams,
    FormattingOptions, GotoDefinitionParams, GotoDefinitionResponse, Hover, HoverParams, InlayHint,
    InlayHintParams, Location, PartialResultParams, Position, Range, ReferenceContext,
    ReferenceParams, SignatureHelp, SignatureHelpParams, TextDocumentIdentifier,
    TextDocumentPositionParams, TextEdit, WorkDoneProgressParams,
};
use serde::Serialize;
use tracing::debug;

use crate::cancellation::CancellationSupport;
use crate::dispatch::{Dispatcher, MergedRequest};
use crate::document::{DocumentRef, TextBuffer};
use crate::error::{LspError, LspResult};
use crate::lsp::capabilities::{
    supports_any_usage, supports_code_lens, supports_completion, supports_declaration,
    supports_definition, supports_document_highlight, supports_document_link,
    supports_folding_range, supports_formatting, supports_hover, supports_implementation,
    supports_inlay_hint, supports_inlay_hint_resolve, supports_range_formatting,
    supports_references, supports_signature_help, supports_type_definition,
};
use crate::lsp::session::ServerSession;

/// The relation a usage location has to the symbol under the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    /// `textDocument/declaration`.
    Declaration,
    /// `textDocument/definition`.
    Definition,
    /// `textDocument/typeDefinition`.
    TypeDefinition,
    /// `textDocument/references`.
    Reference,
    /// `textDocument/implementation`.
    Implementation,
}

impl UsageKind {
    const ALL: [Self; 5] = [
        Self::Declaration,
        Self::Definition,
        Self::TypeDefinition,
        Self::Reference,
        Self::Implementation,
    ];

    fn is_supported(self, capabilities: &lsp_types::ServerCapabilities) -> bool {
        match self {
            Self::Declaration => supports_declaration(capabilities),
            Self::Definition => supports_definition(capabilities),
            Self::TypeDefinition => supports_type_definition(capabilities),
            Self::Reference => supports_references(capabilities),
            Self::Implementation => supports_implementation(capabilities),
        }
    }
}

/// One usage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usage {
    /// How the location relates to the symbol.
    pub kind: UsageKind,
    /// Where it is.
    pub location: Location,
}

/// An inlay hint remembering which server produced it.
#[derive(Debug, Clone)]
pub struct ServerInlayHint {
    /// Definition id of the producing server.
    pub server_id: String,
    /// The hint as the server sent it.
    pub hint: InlayHint,
}

fn identifier(document: &DocumentRef) -> TextDocumentIdentifier {
    TextDocumentIdentifier {
        uri: document.uri.clone(),
    }
}

fn position_params(document: &DocumentRef, position: Position) -> TextDocumentPositionParams {
    TextDocumentPositionParams {
        text_document: identifier(document),
        position,
    }
}

fn goto_params(position: TextDocumentPositionParams) -> GotoDefinitionParams {
    GotoDefinitionParams {
        text_document_position_params: position,
        work_done_progress_params: WorkDoneProgressParams::default(),
        partial_result_params: PartialResultParams::default(),
    }
}

/// Flattens any goto-style answer into plain locations.
fn locations(response: Option<GotoDefinitionResponse>) -> Vec<Location> {
    match response {
        None => Vec::new(),
        Some(GotoDefinitionResponse::Scalar(location)) => vec![location],
        Some(GotoDefinitionResponse::Array(locations)) => locations,
        Some(GotoDefinitionResponse::Link(links)) => links
            .into_iter()
            .map(|link| Location {
                uri: link.target_uri,
                range: link.target_selection_range,
            })
            .collect(),
    }
}

async fn usage_request(
    session: &ServerSession,
    kind: UsageKind,
    position: TextDocumentPositionParams,
    cancel: &CancellationSupport,
) -> LspResult<Vec<Location>> {
    let cancel = Some(cancel);
    match kind {
        UsageKind::Declaration => session
            .request::<GotoDeclaration>(goto_params(position), cancel)
            .await
            .map(locations),
        UsageKind::Definition => session
            .request::<GotoDefinition>(goto_params(position), cancel)
            .await
            .map(locations),
        UsageKind::TypeDefinition => session
            .request::<GotoTypeDefinition>(goto_params(position), cancel)
            .await
            .map(locations),
        UsageKind::Implementation => session
            .request::<GotoImplementation>(goto_params(position), cancel)
            .await
            .map(locations),
        UsageKind::Reference => session
            .request::<References>(
                ReferenceParams {
                    text_document_position: position,
                    context: ReferenceContext {
                        include_declaration: true,
                    },
                    work_done_progress_params: WorkDoneProgressParams::default(),
                    partial_result_params: PartialResultParams::default(),
                },
                cancel,
            )
            .await
            .map(Option::unwrap_or_default),
    }
}

impl Dispatcher {
    fn goto(
        &self,
        document: &DocumentRef,
        position: Position,
        kind: UsageKind,
        method: &'static str,
    ) -> MergedRequest<Location> {
        let position = position_params(document, position);
        self.dispatch(
            document,
            method,
            move |caps| kind.is_supported(caps),
            move |session, cancel| {
                let position = position.clone();
                async move { usage_request(&session, kind, position, &cancel).await }
            },
        )
    }

    /// `textDocument/declaration` across servers.
    pub fn declaration(&self, document: &DocumentRef, position: Position) -> MergedRequest<Location> {
        self.goto(document, position, UsageKind::Declaration, "textDocument/declaration")
    }

    /// `textDocument/definition` across servers.
    pub fn definition(&self, document: &DocumentRef, position: Position) -> MergedRequest<Location> {
        self.goto(document, position, UsageKind::Definition, "textDocument/definition")
    }

    /// `textDocument/typeDefinition` across servers.
    pub fn type_definition(&self, document: &DocumentRef, position: Position) -> MergedRequest<Location> {
        self.goto(document, position, UsageKind::TypeDefinition, "textDocument/typeDefinition")
    }

    /// `textDocument/implementation` across servers.
    pub fn implementation(&self, document: &DocumentRef, position: Position) -> MergedRequest<Location> {
        self.goto(document, position, UsageKind::Implementation, "textDocument/implementation")
    }

    /// `textDocument/references` (declaration included) across servers.
    pub fn references(&self, document: &DocumentRef, position: Position) -> MergedRequest<Location> {
        self.goto(document, position, UsageKind::Reference, "textDocument/references")
    }

    /// Every kind of usage each server supports, tagged by kind.
    ///
    /// A kind that fails on one server contributes nothing; the other kinds
    /// of that server still count.
    pub fn usages(&self, document: &DocumentRef, position: Position) -> MergedRequest<Usage> {
        let position = position_params(document, position);
        self.dispatch(document, "usages", supports_any_usage, move |session, cancel| {
            let position = position.clone();
            async move {
                let capabilities = session.capabilities().unwrap_or_default();
                let kinds: Vec<UsageKind> = UsageKind::ALL
                    .into_iter()
                    .filter(|kind| kind.is_supported(&capabilities))
                    .collect();
                let results = join_all(
                    kinds
                        .iter()
                        .map(|kind| usage_request(&session, *kind, position.clone(), &cancel)),
                )
                .await;

                let mut usages = Vec::new();
                for (kind, result) in kinds.into_iter().zip(results) {
                    match result {
                        Ok(found) => usages.extend(found.into_iter().map(|location| Usage { kind, location })),
                        Err(LspError::Cancelled) => return Err(LspError::Cancelled),
                        Err(e) => debug!("{:?} lookup on '{}' failed: {}", kind, session.server_id(), e),
                    }
                }
                Ok(usages)
            }
        })
    }

    /// `textDocument/hover` across servers.
    pub fn hover(&self, document: &DocumentRef, position: Position) -> MergedRequest<Hover> {
        let params = HoverParams {
            text_document_position_params: position_params(document, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.dispatch(document, "textDocument/hover", supports_hover, move |session, cancel| {
            let params = params.clone();
            async move {
                let hover = session.request::<HoverRequest>(params, Some(&cancel)).await?;
                Ok(hover.into_iter().collect())
            }
        })
    }

    /// `textDocument/completion` across servers, lists flattened.
    pub fn completion(&self, document: &DocumentRef, position: Position) -> MergedRequest<CompletionItem> {
        let params = CompletionParams {
            text_document_position: position_params(document, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: None,
        };
        self.dispatch(
            document,
            "textDocument/completion",
            supports_completion,
            move |session, cancel| {
                let params = params.clone();
                async move {
                    let response = session.request::<Completion>(params, Some(&cancel)).await?;
                    Ok(match response {
                        None => Vec::new(),
                        Some(CompletionResponse::Array(items)) => items,
                        Some(CompletionResponse::List(list)) => list.items,
                    })
                }
            },
        )
    }

    /// `textDocument/signatureHelp` across servers.
    pub fn signature_help(&self, document: &DocumentRef, position: Position) -> MergedRequest<SignatureHelp> {
        let params = SignatureHelpParams {
            context: None,
            text_document_position_params: position_params(document, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.dispatch(
            document,
            "textDocument/signatureHelp",
            supports_signature_help,
            move |session, cancel| {
                let params = params.clone();
                async move {
                    let help = session.request::<SignatureHelpRequest>(params, Some(&cancel)).await?;
                    Ok(help.into_iter().collect())
                }
            },
        )
    }

    /// `textDocument/documentHighlight` across servers.
    pub fn document_highlights(
        &self,
        document: &DocumentRef,
        position: Position,
    ) -> MergedRequest<DocumentHighlight> {
        let params = DocumentHighlightParams {
            text_document_position_params: position_params(document, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.dispatch(
            document,
            "textDocument/documentHighlight",
            supports_document_highlight,
            move |session, cancel| {
                let params = params.clone();
                async move {
                    let found = session
                        .request::<DocumentHighlightRequest>(params, Some(&cancel))
                        .await?;
                    Ok(found.unwrap_or_default())
                }
            },
        )
    }

    /// `textDocument/codeLens` across servers.
    pub fn code_lens(&self, document: &DocumentRef) -> MergedRequest<CodeLens> {
        let params = CodeLensParams {
            text_document: identifier(document),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.dispatch(document, "textDocument/codeLens", supports_code_lens, move |session, cancel| {
            let params = params.clone();
            async move {
                let lenses = session.request::<CodeLensRequest>(params, Some(&cancel)).await?;
                Ok(lenses.unwrap_or_default())
            }
        })
    }

    /// `textDocument/foldingRange` across servers.
    pub fn folding_ranges(&self, document: &DocumentRef) -> MergedRequest<FoldingRange> {
        let params = FoldingRangeParams {
            text_document: identifier(document),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.dispatch(
            document,
            "textDocument/foldingRange",
            supports_folding_range,
            move |session, cancel| {
                let params = params.clone();
                async move {
                    let ranges = session.request::<FoldingRangeRequest>(params, Some(&cancel)).await?;
                    Ok(ranges.unwrap_or_default())
                }
            },
        )
    }

    /// `textDocument/documentLink` across servers.
    pub fn document_links(&self, document: &DocumentRef) -> MergedRequest<DocumentLink> {
        let params = DocumentLinkParams {
            text_document: identifier(document),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.dispatch(
            document,
            "textDocument/documentLink",
            supports_document_link,
            move |session, cancel| {
                let params = params.clone();
                async move {
                    let links = session.request::<DocumentLinkRequest>(params, Some(&cancel)).await?;
                    Ok(links.unwrap_or_default())
                }
            },
        )
    }

    /// `textDocument/inlayHint` across servers; each hint keeps its server id.
    pub fn inlay_hints(&self, document: &DocumentRef, range: Range) -> MergedRequest<ServerInlayHint> {
        let params = InlayHintParams {
            work_done_progress_params: WorkDoneProgressParams::default(),
            text_document: identifier(document),
            range,
        };
        self.dispatch(
            document,
            "textDocument/inlayHint",
            supports_inlay_hint,
            move |session, cancel| {
                let params = params.clone();
                async move {
                    let hints = session.request::<InlayHintRequest>(params, Some(&cancel)).await?;
                    let server_id = session.server_id().to_string();
                    Ok(hints
                        .unwrap_or_default()
                        .into_iter()
                        .map(|hint| ServerInlayHint {
                            server_id: server_id.clone(),
                            hint,
                        })
                        .collect())
                }
            },
        )
    }

    /// Resolves a hint on the server that produced it.
    ///
    /// The hint comes back unchanged when that server is gone or does not
    /// resolve hints.
    ///
    /// # Errors
    ///
    /// Returns the resolve request's failure.
    pub async fn resolve_inlay_hint(
        &self,
        document: &DocumentRef,
        hint: ServerInlayHint,
        cancellation: Option<&CancellationSupport>,
    ) -> LspResult<ServerInlayHint> {
        let session = self
            .manager()
            .started_sessions_for(document)
            .into_iter()
            .find(|s| s.server_id() == hint.server_id);
        let Some(session) = session else {
            return Ok(hint);
        };
        if !session
            .capabilities()
            .is_some_and(|caps| supports_inlay_hint_resolve(&caps))
        {
            return Ok(hint);
        }
        let resolved = session
            .request::<InlayHintResolveRequest>(hint.hint, cancellation)
            .await?;
        Ok(ServerInlayHint {
            server_id: hint.server_id,
            hint: resolved,
        })
    }

    /// Formats with a single server; formatting results are never merged.
    ///
    /// With a `range`, the first server supporting range formatting wins;
    /// otherwise (or when none does) the first server supporting document
    /// formatting formats the whole document. No such server yields no edits.
    ///
    /// # Errors
    ///
    /// Returns the chosen server's request failure.
    pub async fn format(
        &self,
        document: &DocumentRef,
        options: FormattingOptions,
        range: Option<Range>,
        cancellation: Option<&CancellationSupport>,
    ) -> LspResult<Vec<TextEdit>> {
        if let Some(range) = range
            && let Some(session) = self
                .eligible_sessions(document, supports_range_formatting)
                .into_iter()
                .next()
        {
            let params = DocumentRangeFormattingParams {
                text_document: identifier(document),
                range,
                options,
                work_done_progress_params: WorkDoneProgressParams::default(),
            };
            let edits = session.request::<RangeFormatting>(params, cancellation).await?;
            return Ok(edits.unwrap_or_default());
        }

        let Some(session) = self
            .eligible_sessions(document, supports_formatting)
            .into_iter()
            .next()
        else {
            debug!("No formatter for {}", document.path.display());
            return Ok(Vec::new());
        };
        let params = DocumentFormattingParams {
            text_document: identifier(document),
            options,
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        let edits = session.request::<Formatting>(params, cancellation).await?;
        Ok(edits.unwrap_or_default())
    }
}

/// Applies LSP text edits to `text`.
///
/// Inserts at the same position keep their order in `edits`.
///
/// # Errors
///
/// Returns [`LspError::InvalidEdit`] for a range outside the text, an
/// inverted range, or overlapping edits.
pub fn apply_text_edits(text: &str, edits: &[TextEdit]) -> LspResult<String> {
    let buffer = TextBuffer::new(text);
    let mut spans = Vec::with_capacity(edits.len());
    for edit in edits {
        let start = buffer.offset_at(edit.range.start);
        let end = buffer.offset_at(edit.range.end);
        let (Some(start), Some(end)) = (start, end) else {
            return Err(LspError::InvalidEdit(format!(
                "range {:?} is outside the document",
                edit.range
            )));
        };
        if end < start {
            return Err(LspError::InvalidEdit(format!("range {:?} is inverted", edit.range)));
        }
        spans.push((start, end, edit.new_text.as_str()));
    }
    // Stable: inserts at one position keep their order and precede a
    // replacement starting there.
    spans.sort_by_key(|(start, end, _)| (*start, *end));

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end, new_text) in spans {
        if start < cursor {
            return Err(LspError::InvalidEdit("overlapping edits".to_string()));
        }
        out.push_str(text.get(cursor..start).unwrap_or_default());
        out.push_str(new_text);
        cursor = end;
    }
    out.push_str(text.get(cursor..).unwrap_or_default());
    Ok(out)
}
