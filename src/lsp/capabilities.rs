// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Client capabilities we declare, and predicates over what servers declare.

use lsp_types::{
    ClientCapabilities, CompletionClientCapabilities, DeclarationCapability,
    DocumentLinkClientCapabilities, DynamicRegistrationClientCapabilities,
    FoldingRangeProviderCapability, GeneralClientCapabilities, GotoCapability,
    HoverClientCapabilities, HoverProviderCapability, ImplementationProviderCapability,
    InlayHintClientCapabilities, InlayHintResolveClientCapabilities, InlayHintServerCapabilities,
    MarkupKind, OneOf, PositionEncodingKind, ServerCapabilities, SignatureHelpClientCapabilities,
    TextDocumentClientCapabilities, TextDocumentSyncCapability, TextDocumentSyncClientCapabilities,
    TextDocumentSyncKind, TextDocumentSyncSaveOptions, TypeDefinitionProviderCapability,
    WindowClientCapabilities, WorkspaceClientCapabilities,
};

/// Capabilities sent in `initialize`.
///
/// Only features the dispatcher can route are declared; positions are
/// always UTF-16.
#[must_use]
pub fn client_capabilities() -> ClientCapabilities {
    let goto = || {
        Some(GotoCapability {
            dynamic_registration: Some(false),
            link_support: Some(true),
        })
    };

    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            configuration: Some(true),
            workspace_folders: Some(true),
            did_change_configuration: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(false),
            }),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                dynamic_registration: Some(false),
                will_save: Some(false),
                will_save_wait_until: Some(false),
                did_save: Some(true),
            }),
            hover: Some(HoverClientCapabilities {
                dynamic_registration: Some(false),
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
            }),
            completion: Some(CompletionClientCapabilities::default()),
            signature_help: Some(SignatureHelpClientCapabilities::default()),
            declaration: goto(),
            definition: goto(),
            type_definition: goto(),
            implementation: goto(),
            references: Some(DynamicRegistrationClientCapabilities::default()),
            document_highlight: Some(DynamicRegistrationClientCapabilities::default()),
            document_link: Some(DocumentLinkClientCapabilities {
                dynamic_registration: Some(false),
                tooltip_support: Some(true),
            }),
            formatting: Some(DynamicRegistrationClientCapabilities::default()),
            range_formatting: Some(Default::default()),
            code_lens: Some(Default::default()),
            folding_range: Some(Default::default()),
            publish_diagnostics: Some(Default::default()),
            inlay_hint: Some(InlayHintClientCapabilities {
                dynamic_registration: Some(false),
                resolve_support: Some(InlayHintResolveClientCapabilities {
                    properties: ["tooltip", "textEdits", "label.tooltip", "label.location", "label.command"]
                        .iter()
                        .map(ToString::to_string)
                        .collect(),
                }),
            }),
            ..Default::default()
        }),
        window: Some(WindowClientCapabilities {
            work_done_progress: Some(true),
            ..Default::default()
        }),
        general: Some(GeneralClientCapabilities {
            position_encodings: Some(vec![PositionEncodingKind::UTF16]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// How a server wants `didSave`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveBehavior {
    /// Whether the notification carries the full text.
    pub include_text: bool,
}

/// Negotiated document synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// `None`, `Full` or `Incremental`.
    pub kind: TextDocumentSyncKind,
    /// `None` suppresses `didSave`.
    pub save: Option<SaveBehavior>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            kind: TextDocumentSyncKind::FULL,
            save: Some(SaveBehavior { include_text: true }),
        }
    }
}

/// Extracts synchronization settings from server capabilities.
///
/// The plain-kind form (and an absent field) means full sync with text-bearing
/// saves; the options form suppresses saves unless it has a `save` entry.
#[must_use]
pub fn sync_settings(capabilities: &ServerCapabilities) -> SyncSettings {
    match &capabilities.text_document_sync {
        None => SyncSettings::default(),
        Some(TextDocumentSyncCapability::Kind(kind)) => SyncSettings {
            kind: *kind,
            ..SyncSettings::default()
        },
        Some(TextDocumentSyncCapability::Options(options)) => SyncSettings {
            kind: options.change.unwrap_or(TextDocumentSyncKind::FULL),
            save: match &options.save {
                None | Some(TextDocumentSyncSaveOptions::Supported(false)) => None,
                Some(TextDocumentSyncSaveOptions::Supported(true)) => {
                    Some(SaveBehavior { include_text: true })
                }
                Some(TextDocumentSyncSaveOptions::SaveOptions(save)) => Some(SaveBehavior {
                    include_text: save.include_text.unwrap_or(true),
                }),
            },
        },
    }
}

fn one_of<T>(provider: Option<&OneOf<bool, T>>) -> bool {
    matches!(provider, Some(OneOf::Left(true) | OneOf::Right(_)))
}

/// `textDocument/hover`.
#[must_use]
pub fn supports_hover(capabilities: &ServerCapabilities) -> bool {
    capabilities
        .hover_provider
        .as_ref()
        .is_some_and(|p| !matches!(p, HoverProviderCapability::Simple(false)))
}

/// `textDocument/completion`.
#[must_use]
pub const fn supports_completion(capabilities: &ServerCapabilities) -> bool {
    capabilities.completion_provider.is_some()
}

/// `textDocument/signatureHelp`.
#[must_use]
pub const fn supports_signature_help(capabilities: &ServerCapabilities) -> bool {
    capabilities.signature_help_provider.is_some()
}

/// `textDocument/declaration`.
#[must_use]
pub fn supports_declaration(capabilities: &ServerCapabilities) -> bool {
    capabilities
        .declaration_provider
        .as_ref()
        .is_some_and(|p| !matches!(p, DeclarationCapability::Simple(false)))
}

/// `textDocument/definition`.
#[must_use]
pub fn supports_definition(capabilities: &ServerCapabilities) -> bool {
    one_of(capabilities.definition_provider.as_ref())
}

/// `textDocument/typeDefinition`.
#[must_use]
pub fn supports_type_definition(capabilities: &ServerCapabilities) -> bool {
    capabilities
        .type_definition_provider
        .as_ref()
        .is_some_and(|p| !matches!(p, TypeDefinitionProviderCapability::Simple(false)))
}

/// `textDocument/implementation`.
#[must_use]
pub fn supports_implementation(capabilities: &ServerCapabilities) -> bool {
    capabilities
        .implementation_provider
        .as_ref()
        .is_some_and(|p| !matches!(p, ImplementationProviderCapability::Simple(false)))
}

/// `textDocument/references`.
#[must_use]
pub fn supports_references(capabilities: &ServerCapabilities) -> bool {
    one_of(capabilities.references_provider.as_ref())
}

/// `textDocument/documentHighlight`.
#[must_use]
pub fn supports_document_highlight(capabilities: &ServerCapabilities) -> bool {
    one_of(capabilities.document_highlight_provider.as_ref())
}

/// `textDocument/documentLink`.
#[must_use]
pub const fn supports_document_link(capabilities: &ServerCapabilities) -> bool {
    capabilities.document_link_provider.is_some()
}

/// `textDocument/formatting`.
#[must_use]
pub fn supports_formatting(capabilities: &ServerCapabilities) -> bool {
    one_of(capabilities.document_formatting_provider.as_ref())
}

/// `textDocument/rangeFormatting`.
#[must_use]
pub fn supports_range_formatting(capabilities: &ServerCapabilities) -> bool {
    one_of(capabilities.document_range_formatting_provider.as_ref())
}

/// `textDocument/codeLens`.
#[must_use]
pub const fn supports_code_lens(capabilities: &ServerCapabilities) -> bool {
    capabilities.code_lens_provider.is_some()
}

/// `textDocument/foldingRange`.
#[must_use]
pub fn supports_folding_range(capabilities: &ServerCapabilities) -> bool {
    capabilities
        .folding_range_provider
        .as_ref()
        .is_some_and(|p| !matches!(p, FoldingRangeProviderCapability::Simple(false)))
}

/// `textDocument/inlayHint`.
#[must_use]
pub fn supports_inlay_hint(capabilities: &ServerCapabilities) -> bool {
    one_of(capabilities.inlay_hint_provider.as_ref())
}

/// `inlayHint/resolve`.
#[must_use]
pub fn supports_inlay_hint_resolve(capabilities: &ServerCapabilities) -> bool {
    let options = match &capabilities.inlay_hint_provider {
        Some(OneOf::Right(InlayHintServerCapabilities::Options(options))) => options,
        Some(OneOf::Right(InlayHintServerCapabilities::RegistrationOptions(registration))) => {
            &registration.inlay_hint_options
        }
        _ => return false,
    };
    options.resolve_provider.unwrap_or(false)
}

/// True when the server supports any of the usage-style requests.
#[must_use]
pub fn supports_any_usage(capabilities: &ServerCapabilities) -> bool {
    supports_declaration(capabilities)
        || supports_definition(capabilities)
        || supports_type_definition(capabilities)
        || supports_references(capabilities)
        || supports_implementation(capabilities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::{SaveOptions, TextDocumentSyncOptions};

    fn caps(value: serde_json::Value) -> anyhow::Result<ServerCapabilities> {
        Ok(serde_json::from_value(value)?)
    }

    #[test]
    fn test_sync_kind_defaults_to_full() {
        let settings = sync_settings(&ServerCapabilities::default());
        assert_eq!(settings.kind, TextDocumentSyncKind::FULL);
        assert_eq!(settings.save, Some(SaveBehavior { include_text: true }));
    }

    #[test]
    fn test_plain_kind_form_sends_saves() -> anyhow::Result<()> {
        let settings = sync_settings(&caps(serde_json::json!({ "textDocumentSync": 2 }))?);
        assert_eq!(settings.kind, TextDocumentSyncKind::INCREMENTAL);
        assert!(settings.save.is_some());
        Ok(())
    }

    #[test]
    fn test_options_form_without_save_suppresses_saves() {
        let capabilities = ServerCapabilities {
            text_document_sync: Some(TextDocumentSyncCapability::Options(
                TextDocumentSyncOptions {
                    open_close: Some(true),
                    change: Some(TextDocumentSyncKind::INCREMENTAL),
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        let settings = sync_settings(&capabilities);
        assert_eq!(settings.kind, TextDocumentSyncKind::INCREMENTAL);
        assert_eq!(settings.save, None);
    }

    #[test]
    fn test_save_options_include_text() {
        let capabilities = ServerCapabilities {
            text_document_sync: Some(TextDocumentSyncCapability::Options(
                TextDocumentSyncOptions {
                    save: Some(TextDocumentSyncSaveOptions::SaveOptions(SaveOptions {
                        include_text: Some(false),
                    })),
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        assert_eq!(
            sync_settings(&capabilities).save,
            Some(SaveBehavior {
                include_text: false
            })
        );
    }

    #[test]
    fn test_feature_predicates() -> anyhow::Result<()> {
        let capabilities = caps(serde_json::json!({
            "hoverProvider": true,
            "definitionProvider": false,
            "referencesProvider": {},
            "declarationProvider": true,
            "foldingRangeProvider": true,
            "completionProvider": { "triggerCharacters": ["."] }
        }))?;
        assert!(supports_hover(&capabilities));
        assert!(!supports_definition(&capabilities));
        assert!(supports_references(&capabilities));
        assert!(supports_declaration(&capabilities));
        assert!(supports_folding_range(&capabilities));
        assert!(supports_completion(&capabilities));
        assert!(!supports_formatting(&capabilities));
        assert!(supports_any_usage(&capabilities));
        Ok(())
    }

    #[test]
    fn test_inlay_resolve_requires_options() -> anyhow::Result<()> {
        let plain = ServerCapabilities {
            inlay_hint_provider: Some(OneOf::Left(true)),
            ..Default::default()
        };
        assert!(supports_inlay_hint(&plain));
        assert!(!supports_inlay_hint_resolve(&plain));

        let resolving = caps(serde_json::json!({
            "inlayHintProvider": { "resolveProvider": true }
        }))?;
        assert!(supports_inlay_hint(&resolving));
        assert!(supports_inlay_hint_resolve(&resolving));
        Ok(())
    }

    #[test]
    fn test_client_capabilities_declare_resolve_and_configuration() -> anyhow::Result<()> {
        let value = serde_json::to_value(client_capabilities())?;
        assert_eq!(value["workspace"]["configuration"], true);
        assert_eq!(value["textDocument"]["synchronization"]["didSave"], true);
        assert!(
            value["textDocument"]["inlayHint"]["resolveSupport"]["properties"]
                .as_array()
                .is_some_and(|p| p.iter().any(|v| v == "tooltip"))
        );
        assert_eq!(value["textDocument"]["documentLink"]["tooltipSupport"], true);
        Ok(())
    }
}
