//! Data models for lsp-relay
//!
//! Inert LSP data-transfer shapes: no behavior beyond (de)serialization.

pub mod lsp;

// Re-export commonly used types
pub use lsp::{
    CompletionItem, CompletionList, Diagnostic, Hover, InitializeParams, InitializeResult,
    Location, MarkedString, MessageActionItem, MessageType, Position, PublishDiagnosticsParams,
    Range, ShowMessageParams, ShowMessageRequestParams, SymbolInformation, TextEdit,
    WorkspaceEdit,
};
