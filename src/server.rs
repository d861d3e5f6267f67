//! The handler contract implemented by a concrete language server.
//!
//! The dispatch loop owns the handler and calls it one message at a time,
//! so methods take `&mut self` and implementations never need interior
//! locking. `initialize` is the only operation without a default: every
//! other request answers "not implemented" and every notification is a
//! no-op until overridden.

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::models::lsp::{
    CodeAction, CodeActionParams, CodeLens, CodeLensParams, CompletionItem, CompletionList,
    DidChangeConfigurationParams, DidChangeTextDocumentParams, DidChangeWatchedFilesParams,
    DidChangeWorkspaceFoldersParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams, DocumentFormattingParams, DocumentLink, DocumentLinkParams,
    DocumentSymbolParams, FoldingRange, FoldingRangeParams, Hover, InitializeParams,
    InitializeResult, Location, MessageActionItem, Range, ReferenceParams, RenameParams,
    SignatureHelp, SymbolInformation, TextDocumentPositionParams, TextEdit,
    WillSaveTextDocumentParams, WorkspaceEdit, WorkspaceSymbolParams,
};

#[async_trait]
pub trait LanguageServer: Send {
    async fn initialize(&mut self, params: InitializeParams) -> Result<InitializeResult>;

    async fn initialized(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when the peer asks to shut down, before the loop replies with
    /// a null result and starts waiting for `exit`.
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    async fn did_change_workspace_folders(
        &mut self,
        _params: DidChangeWorkspaceFoldersParams,
    ) -> Result<()> {
        Ok(())
    }

    async fn did_change_configuration(
        &mut self,
        _params: DidChangeConfigurationParams,
    ) -> Result<()> {
        Ok(())
    }

    async fn did_change_watched_files(
        &mut self,
        _params: DidChangeWatchedFilesParams,
    ) -> Result<()> {
        Ok(())
    }

    async fn workspace_symbols(
        &mut self,
        _params: WorkspaceSymbolParams,
    ) -> Result<Option<Vec<SymbolInformation>>> {
        bail!("workspace/symbol is not implemented")
    }

    async fn document_link(
        &mut self,
        _params: DocumentLinkParams,
    ) -> Result<Option<Vec<DocumentLink>>> {
        bail!("textDocument/documentLink is not implemented")
    }

    async fn did_open_text_document(&mut self, _params: DidOpenTextDocumentParams) -> Result<()> {
        Ok(())
    }

    async fn did_change_text_document(
        &mut self,
        _params: DidChangeTextDocumentParams,
    ) -> Result<()> {
        Ok(())
    }

    async fn will_save_text_document(
        &mut self,
        _params: WillSaveTextDocumentParams,
    ) -> Result<()> {
        Ok(())
    }

    async fn will_save_wait_until_text_document(
        &mut self,
        _params: WillSaveTextDocumentParams,
    ) -> Result<Option<Vec<TextEdit>>> {
        bail!("textDocument/willSaveWaitUntil is not implemented")
    }

    async fn did_save_text_document(&mut self, _params: DidSaveTextDocumentParams) -> Result<()> {
        Ok(())
    }

    async fn did_close_text_document(&mut self, _params: DidCloseTextDocumentParams) -> Result<()> {
        Ok(())
    }

    async fn completion(
        &mut self,
        _params: TextDocumentPositionParams,
    ) -> Result<Option<CompletionList>> {
        bail!("textDocument/completion is not implemented")
    }

    async fn resolve_completion_item(&mut self, _item: CompletionItem) -> Result<CompletionItem> {
        bail!("completionItem/resolve is not implemented")
    }

    async fn hover(&mut self, _params: TextDocumentPositionParams) -> Result<Option<Hover>> {
        bail!("textDocument/hover is not implemented")
    }

    async fn signature_help(
        &mut self,
        _params: TextDocumentPositionParams,
    ) -> Result<Option<SignatureHelp>> {
        bail!("textDocument/signatureHelp is not implemented")
    }

    async fn goto_definition(
        &mut self,
        _params: TextDocumentPositionParams,
    ) -> Result<Option<Vec<Location>>> {
        bail!("textDocument/definition is not implemented")
    }

    async fn find_references(&mut self, _params: ReferenceParams) -> Result<Option<Vec<Location>>> {
        bail!("textDocument/references is not implemented")
    }

    async fn document_symbol(
        &mut self,
        _params: DocumentSymbolParams,
    ) -> Result<Option<Vec<SymbolInformation>>> {
        bail!("textDocument/documentSymbol is not implemented")
    }

    async fn code_action(&mut self, _params: CodeActionParams) -> Result<Option<Vec<CodeAction>>> {
        bail!("textDocument/codeAction is not implemented")
    }

    async fn code_lens(&mut self, _params: CodeLensParams) -> Result<Option<Vec<CodeLens>>> {
        bail!("textDocument/codeLens is not implemented")
    }

    async fn resolve_code_lens(&mut self, _lens: CodeLens) -> Result<CodeLens> {
        bail!("codeLens/resolve is not implemented")
    }

    async fn prepare_rename(
        &mut self,
        _params: TextDocumentPositionParams,
    ) -> Result<Option<Range>> {
        bail!("textDocument/prepareRename is not implemented")
    }

    async fn rename(&mut self, _params: RenameParams) -> Result<Option<WorkspaceEdit>> {
        bail!("textDocument/rename is not implemented")
    }

    async fn formatting(
        &mut self,
        _params: DocumentFormattingParams,
    ) -> Result<Option<Vec<TextEdit>>> {
        bail!("textDocument/formatting is not implemented")
    }

    async fn folding_range(
        &mut self,
        _params: FoldingRangeParams,
    ) -> Result<Option<Vec<FoldingRange>>> {
        bail!("textDocument/foldingRange is not implemented")
    }

    /// Called with the answer to an earlier `window/showMessageRequest`,
    /// matched by the correlation id that request returned.
    async fn handle_show_message_response(
        &mut self,
        _id: u64,
        _item: MessageActionItem,
    ) -> Result<()> {
        Ok(())
    }

    /// Called on an idle poll tick, but only if at least one message was
    /// dispatched since the previous tick.
    async fn idle_work(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BareServer;

    #[async_trait]
    impl LanguageServer for BareServer {
        async fn initialize(&mut self, _params: InitializeParams) -> Result<InitializeResult> {
            Ok(InitializeResult::default())
        }
    }

    #[tokio::test]
    async fn test_notifications_default_to_noops() {
        let mut server = BareServer;
        assert!(server.initialized().await.is_ok());
        assert!(server.shutdown().await.is_ok());
        assert!(
            server
                .did_close_text_document(DidCloseTextDocumentParams::default())
                .await
                .is_ok()
        );
        assert!(server.idle_work().await.is_ok());
    }

    #[tokio::test]
    async fn test_unimplemented_request_names_the_method() {
        let mut server = BareServer;
        let err = server
            .hover(TextDocumentPositionParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "textDocument/hover is not implemented");
    }
}
