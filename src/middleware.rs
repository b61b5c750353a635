//! Middleware pipeline for intercepting LSP traffic
//!
//! Completion responses get filterText stabilization and parameter-hint
//! command attachment; workspace/configuration requests pass resolved
//! settings through verbatim; document-sync notifications flow through a
//! forward-always policy seam.

use crate::config::HintSettings;
use lsp_types::{Command, CompletionItem, CompletionItemKind, CompletionList, CompletionResponse};
use serde_json::Value;
use std::sync::Arc;

// ============================================================================
// Completion Middleware
// ============================================================================

/// Command attached to function/method completion items to pop parameter
/// hints right after the completion is accepted
const TRIGGER_PARAMETER_HINTS_COMMAND: &str = "editor.action.triggerParameterHints";

/// Intercepts completion responses
#[derive(Debug, Clone, Default)]
pub struct CompletionMiddleware {
    hints: HintSettings,
}

impl CompletionMiddleware {
    pub fn new(hints: HintSettings) -> Self {
        Self { hints }
    }

    /// Apply both completion transformations to a raw server response
    pub fn apply(&self, language_id: &str, response: &mut CompletionResponse) {
        match response {
            CompletionResponse::List(list) => {
                stabilize_filter_text(list);
                if self.hints.resolve(language_id) {
                    attach_parameter_hints(&mut list.items);
                }
            }
            // The bare-array shape carries no isIncomplete flag, so
            // stabilization never applies to it
            CompletionResponse::Array(items) => {
                if self.hints.resolve(language_id) {
                    attach_parameter_hints(items);
                }
            }
        }
    }
}

/// Give every item of an incomplete list the same filterText
///
/// While the server is still narrowing an incomplete list, divergent
/// filterText values make the editor visibly reorder items between
/// keystrokes. Sharing the first item's filterText (falling back to its
/// label) keeps the list stable. Complete or single-item lists are left
/// untouched.
pub fn stabilize_filter_text(list: &mut CompletionList) {
    if !list.is_incomplete || list.items.len() <= 1 {
        return;
    }

    let shared = list.items[0]
        .filter_text
        .clone()
        .unwrap_or_else(|| list.items[0].label.clone());

    for item in &mut list.items {
        item.filter_text = Some(shared.clone());
    }
}

/// Attach the parameter-hints trigger command to callable completion items
pub fn attach_parameter_hints(items: &mut [CompletionItem]) {
    for item in items {
        if item.kind == Some(CompletionItemKind::FUNCTION)
            || item.kind == Some(CompletionItemKind::METHOD)
        {
            item.command = Some(Command {
                title: "triggerParameterHints".to_string(),
                command: TRIGGER_PARAMETER_HINTS_COMMAND.to_string(),
                arguments: None,
            });
        }
    }
}

// ============================================================================
// Configuration Middleware
// ============================================================================

/// Resolves one configuration scope/section to a settings value
pub type SettingsProvider = Arc<dyn Fn(Option<&str>, Option<&str>) -> Value + Send + Sync>;

/// Handles workspace/configuration requests from the server
///
/// Resolved values are copied verbatim, which transparently supports both
/// the flat settings-object shape and the per-scope list shape.
#[derive(Clone)]
pub struct ConfigurationMiddleware {
    provider: SettingsProvider,
}

impl ConfigurationMiddleware {
    pub fn new(provider: SettingsProvider) -> Self {
        Self { provider }
    }

    /// A middleware whose provider resolves every section to null
    pub fn empty() -> Self {
        Self {
            provider: Arc::new(|_scope, _section| Value::Null),
        }
    }

    /// Resolve a list of configuration items, one value per item in order
    pub fn resolve(&self, items: &[ConfigurationScope]) -> Vec<Value> {
        items
            .iter()
            .map(|item| (self.provider)(item.scope_uri.as_deref(), item.section.as_deref()))
            .collect()
    }
}

impl std::fmt::Debug for ConfigurationMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationMiddleware").finish()
    }
}

/// One requested configuration scope from workspace/configuration
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationScope {
    pub scope_uri: Option<String>,
    pub section: Option<String>,
}

// ============================================================================
// Document Sync Policy
// ============================================================================

/// Forwarding policy for document-sync notifications
///
/// tndr wants every sync event the host produces; this type is the seam
/// where suppression would go if that ever changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentSyncPolicy;

impl DocumentSyncPolicy {
    pub fn forward_open(&self) -> bool {
        true
    }

    pub fn forward_change(&self) -> bool {
        true
    }

    pub fn forward_save(&self) -> bool {
        true
    }

    pub fn forward_close(&self) -> bool {
        true
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// The full interception pipeline threaded through a session
#[derive(Debug, Clone)]
pub struct MiddlewarePipeline {
    pub completion: CompletionMiddleware,
    pub configuration: ConfigurationMiddleware,
    pub document_sync: DocumentSyncPolicy,
}

impl Default for MiddlewarePipeline {
    fn default() -> Self {
        Self {
            completion: CompletionMiddleware::default(),
            configuration: ConfigurationMiddleware::empty(),
            document_sync: DocumentSyncPolicy,
        }
    }
}

impl MiddlewarePipeline {
    pub fn new(hints: HintSettings, provider: SettingsProvider) -> Self {
        Self {
            completion: CompletionMiddleware::new(hints),
            configuration: ConfigurationMiddleware::new(provider),
            document_sync: DocumentSyncPolicy,
        }
    }

    /// Formatting has no transformation stage; edits pass through unchanged
    pub fn formatting_passthrough(&self, edits: Vec<lsp_types::TextEdit>) -> Vec<lsp_types::TextEdit> {
        edits
    }
}

// ============================================================================
// Tests
// ============================================================================
