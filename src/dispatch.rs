//! Connection wiring: the ingress reader task, the method dispatch table,
//! and the single-threaded dispatch loop.
//!
//! [`connect`] ties the pieces together. A spawned reader task decodes
//! frames and feeds the bounded pending queue, intercepting
//! `$/cancelRequest` on the way so a cancellation can still pull a queued
//! request back out. The loop on the calling task pops one message at a
//! time, routes it through the dispatch table, and writes any reply through
//! the shared outbound channel. Handler failures answer the peer and keep
//! the loop alive; only `exit` or a closed input stream end it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::client::{LanguageClient, Outbound, RemoteClient};
use crate::error::ProtocolError;
use crate::models::lsp::MessageActionItem;
use crate::protocol::{CancelParams, Message, RequestId, Response, ResponseError};
use crate::queue::{Inbound, PendingQueue};
use crate::server::LanguageServer;
use crate::transport::Transport;

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Pending-queue capacity; the reader stalls once this many messages
    /// are waiting.
    pub queue_capacity: usize,
    /// How long the loop waits for a message before taking an idle tick.
    pub idle_poll: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            idle_poll: Duration::from_millis(200),
        }
    }
}

/// Serve a connection until the peer sends `exit` or closes its end.
///
/// The factory receives the client handle so the server under construction
/// can talk back to the editor from any of its handlers.
pub async fn connect<S, R, W, F>(factory: F, reader: R, writer: W) -> Result<(), ProtocolError>
where
    S: LanguageServer,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(Arc<dyn LanguageClient>) -> S,
{
    connect_with(factory, reader, writer, ConnectOptions::default()).await
}

pub async fn connect_with<S, R, W, F>(
    factory: F,
    reader: R,
    writer: W,
    options: ConnectOptions,
) -> Result<(), ProtocolError>
where
    S: LanguageServer,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(Arc<dyn LanguageClient>) -> S,
{
    let outbound = Arc::new(Outbound::new(writer));
    let client: Arc<dyn LanguageClient> = Arc::new(RemoteClient::new(Arc::clone(&outbound)));
    let mut server = factory(client);

    let queue = Arc::new(PendingQueue::new(options.queue_capacity));
    let reader_task = tokio::spawn(ingress(Transport::new(reader), Arc::clone(&queue)));

    let outcome = run_loop(&mut server, &outbound, &queue, options.idle_poll).await;
    reader_task.abort();
    outcome
}

/// Reader task: decode frames, peek for cancellations, enqueue.
///
/// Frame and decode faults are logged and skipped. A terminal error, end of
/// stream or a broken stream alike, stops the task after handing the loop
/// its close sentinel.
async fn ingress<R: AsyncRead + Unpin>(mut transport: Transport<R>, queue: Arc<PendingQueue>) {
    info!("placing incoming messages on the queue");
    loop {
        let token = match transport.read_token().await {
            Ok(token) => token,
            Err(err) if err.is_terminal() => {
                info!(error = %err, "input stream is done, enqueueing the close sentinel");
                queue.push(Inbound::Closed).await;
                return;
            }
            Err(err) => {
                error!(error = %err, "failed to read a frame");
                continue;
            }
        };

        match Message::parse(&token) {
            Ok(message) => {
                peek_cancellation(&message, &queue).await;
                queue.push(Inbound::Message(message)).await;
            }
            Err(err) => error!(error = %err, "dropping undecodable message"),
        }
    }
}

/// Handle `$/cancelRequest` while the target may still be queued. The
/// notification itself is enqueued afterwards either way, and the loop
/// ignores it there.
async fn peek_cancellation(message: &Message, queue: &PendingQueue) {
    if message.method() != Some("$/cancelRequest") {
        return;
    }
    let params = match message {
        Message::Request(request) => request.params.clone(),
        Message::Notification(notification) => notification.params.clone(),
        Message::Response(_) => return,
    };
    match serde_json::from_value::<CancelParams>(params.unwrap_or(Value::Null)) {
        Ok(cancel) => {
            if queue.cancel(&cancel.id).await {
                info!(id = %cancel.id, "cancelled request, which had not yet started");
            } else {
                info!(
                    id = %cancel.id,
                    "cannot cancel request, it already started or was never queued"
                );
            }
        }
        Err(err) => warn!(error = %err, "malformed $/cancelRequest params"),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LoopState {
    Running,
    ShuttingDown,
}

async fn run_loop<S, W>(
    server: &mut S,
    outbound: &Outbound<W>,
    queue: &PendingQueue,
    idle_poll: Duration,
) -> Result<(), ProtocolError>
where
    S: LanguageServer,
    W: AsyncWrite + Unpin + Send,
{
    let table = DispatchTable::<S>::new();
    let mut state = LoopState::Running;
    let mut worked_since_idle = false;

    info!("reading messages from the queue");
    loop {
        let Some(inbound) = queue.pop(idle_poll).await else {
            // Idle tick. The hook only fires when a message was dispatched
            // since the previous tick.
            if worked_since_idle {
                worked_since_idle = false;
                if let Err(err) = server.idle_work().await {
                    error!(error = %err, "idle work failed");
                }
            }
            continue;
        };

        let message = match inbound {
            Inbound::Closed => {
                warn!("stream from client has been closed, exiting");
                return Ok(());
            }
            Inbound::Message(message) => message,
        };
        worked_since_idle = true;

        let (method, id, params) = match message {
            Message::Response(response) => {
                route_response(server, response).await;
                continue;
            }
            Message::Request(request) => (request.method, Some(request.id), request.params),
            Message::Notification(notification) => (notification.method, None, notification.params),
        };

        match method.as_str() {
            "shutdown" => {
                if state == LoopState::ShuttingDown {
                    warn!("duplicate shutdown request");
                }
                if let Err(err) = server.shutdown().await {
                    error!(error = %err, "shutdown handler failed");
                }
                if let Some(id) = id {
                    outbound.respond(id, Value::Null).await?;
                }
                state = LoopState::ShuttingDown;
                info!("shutdown acknowledged, waiting for exit");
            }
            "exit" => {
                info!("exit received, leaving the dispatch loop");
                return Ok(());
            }
            // Already handled by the reader's peek.
            "$/cancelRequest" => {}
            method => {
                if state == LoopState::ShuttingDown {
                    debug!(method, "message received after shutdown");
                }
                dispatch(server, &table, outbound, method, id, params).await?;
            }
        }
    }
}

/// Route a bare response (no method) from the peer: the answer to an
/// earlier `window/showMessageRequest`, matched by id.
async fn route_response<S: LanguageServer>(server: &mut S, response: Response) {
    if let Some(error) = response.error {
        error!(id = ?response.id, %error, "peer answered our request with an error");
        return;
    }
    let id = match response.id {
        Some(RequestId::Number(id)) => id,
        other => {
            warn!(id = ?other, "response with a missing or non-numeric id, dropping");
            return;
        }
    };
    match serde_json::from_value::<MessageActionItem>(response.result.unwrap_or(Value::Null)) {
        Ok(item) => {
            if let Err(err) = server.handle_show_message_response(id, item).await {
                error!(id, error = %err, "show-message response handler failed");
            }
        }
        Err(err) => error!(id, error = %err, "could not decode response payload"),
    }
}

/// Invoke one table entry and deliver its outcome.
///
/// A handler failure on a message that carried an id becomes an
/// internal-error response; without an id there is no reply channel, so it
/// is only logged. The loop survives either way.
async fn dispatch<S, W>(
    server: &mut S,
    table: &DispatchTable<S>,
    outbound: &Outbound<W>,
    method: &str,
    id: Option<RequestId>,
    params: Option<Value>,
) -> Result<(), ProtocolError>
where
    S: LanguageServer,
    W: AsyncWrite + Unpin + Send,
{
    let Some(entry) = table.get(method) else {
        warn!(method, "don't know what to do with this method");
        return Ok(());
    };

    match (entry.invoke)(server, params).await {
        Ok(result) => {
            if entry.expects_response {
                match id {
                    Some(id) => outbound.respond(id, result).await?,
                    None => warn!(method, "request arrived without an id, dropping the result"),
                }
            }
        }
        Err(err) => {
            error!(method, error = %err, "handler failed");
            if let Some(id) = id {
                outbound
                    .respond_err(id, ResponseError::internal(err.to_string()))
                    .await?;
            }
        }
    }
    Ok(())
}

/// One dispatchable method: a decode-and-invoke thunk plus whether the
/// peer expects a response.
type InvokeFn<S> = for<'a> fn(&'a mut S, Option<Value>) -> BoxFuture<'a, anyhow::Result<Value>>;

struct MethodEntry<S> {
    invoke: InvokeFn<S>,
    expects_response: bool,
}

/// Method-name routing table, built once per connection.
///
/// Lifecycle methods (`shutdown`, `exit`, `$/cancelRequest`) are handled by
/// the loop itself and never appear here.
struct DispatchTable<S> {
    entries: HashMap<&'static str, MethodEntry<S>>,
}

impl<S: LanguageServer> DispatchTable<S> {
    fn new() -> Self {
        let methods: [(&'static str, bool, InvokeFn<S>); 27] = [
            ("initialize", true, invoke::initialize),
            ("initialized", false, invoke::initialized),
            ("workspace/didChangeWorkspaceFolders", false, invoke::did_change_workspace_folders),
            ("workspace/didChangeConfiguration", false, invoke::did_change_configuration),
            ("workspace/didChangeWatchedFiles", false, invoke::did_change_watched_files),
            ("workspace/symbol", true, invoke::workspace_symbols),
            ("textDocument/documentLink", true, invoke::document_link),
            ("textDocument/didOpen", false, invoke::did_open),
            ("textDocument/didChange", false, invoke::did_change),
            ("textDocument/willSave", false, invoke::will_save),
            ("textDocument/willSaveWaitUntil", true, invoke::will_save_wait_until),
            ("textDocument/didSave", false, invoke::did_save),
            ("textDocument/didClose", false, invoke::did_close),
            ("textDocument/completion", true, invoke::completion),
            ("completionItem/resolve", true, invoke::resolve_completion_item),
            ("textDocument/hover", true, invoke::hover),
            ("textDocument/signatureHelp", true, invoke::signature_help),
            ("textDocument/definition", true, invoke::goto_definition),
            ("textDocument/references", true, invoke::find_references),
            ("textDocument/documentSymbol", true, invoke::document_symbol),
            ("textDocument/codeAction", true, invoke::code_action),
            ("textDocument/codeLens", true, invoke::code_lens),
            ("codeLens/resolve", true, invoke::resolve_code_lens),
            ("textDocument/prepareRename", true, invoke::prepare_rename),
            ("textDocument/rename", true, invoke::rename),
            ("textDocument/formatting", true, invoke::formatting),
            ("textDocument/foldingRange", true, invoke::folding_range),
        ];
        let entries = methods
            .into_iter()
            .map(|(name, expects_response, invoke)| {
                (name, MethodEntry { invoke, expects_response })
            })
            .collect();
        Self { entries }
    }

    fn get(&self, method: &str) -> Option<&MethodEntry<S>> {
        self.entries.get(method)
    }
}

fn decode<T: DeserializeOwned>(params: Option<Value>) -> anyhow::Result<T> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|err| anyhow::anyhow!("invalid params: {}", err))
}

fn encode<T: Serialize>(value: T) -> anyhow::Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// The per-method thunks behind the dispatch table. Each decodes its params
/// shape, calls the matching handler operation, and re-encodes the result.
/// An empty optional result encodes as an explicit JSON `null`.
mod invoke {
    use super::{LanguageServer, decode, encode};
    use futures::future::BoxFuture;
    use serde_json::Value;

    type Invoked<'a> = BoxFuture<'a, anyhow::Result<Value>>;

    pub fn initialize<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move { encode(server.initialize(decode(params)?).await?) })
    }

    pub fn initialized<S: LanguageServer>(server: &mut S, _params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move {
            server.initialized().await?;
            Ok(Value::Null)
        })
    }

    pub fn did_change_workspace_folders<S: LanguageServer>(
        server: &mut S,
        params: Option<Value>,
    ) -> Invoked<'_> {
        Box::pin(async move {
            server.did_change_workspace_folders(decode(params)?).await?;
            Ok(Value::Null)
        })
    }

    pub fn did_change_configuration<S: LanguageServer>(
        server: &mut S,
        params: Option<Value>,
    ) -> Invoked<'_> {
        Box::pin(async move {
            server.did_change_configuration(decode(params)?).await?;
            Ok(Value::Null)
        })
    }

    pub fn did_change_watched_files<S: LanguageServer>(
        server: &mut S,
        params: Option<Value>,
    ) -> Invoked<'_> {
        Box::pin(async move {
            server.did_change_watched_files(decode(params)?).await?;
            Ok(Value::Null)
        })
    }

    pub fn workspace_symbols<S: LanguageServer>(
        server: &mut S,
        params: Option<Value>,
    ) -> Invoked<'_> {
        Box::pin(async move { encode(server.workspace_symbols(decode(params)?).await?) })
    }

    pub fn document_link<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move { encode(server.document_link(decode(params)?).await?) })
    }

    pub fn did_open<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move {
            server.did_open_text_document(decode(params)?).await?;
            Ok(Value::Null)
        })
    }

    pub fn did_change<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move {
            server.did_change_text_document(decode(params)?).await?;
            Ok(Value::Null)
        })
    }

    pub fn will_save<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move {
            server.will_save_text_document(decode(params)?).await?;
            Ok(Value::Null)
        })
    }

    pub fn will_save_wait_until<S: LanguageServer>(
        server: &mut S,
        params: Option<Value>,
    ) -> Invoked<'_> {
        Box::pin(async move {
            encode(server.will_save_wait_until_text_document(decode(params)?).await?)
        })
    }

    pub fn did_save<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move {
            server.did_save_text_document(decode(params)?).await?;
            Ok(Value::Null)
        })
    }

    pub fn did_close<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move {
            server.did_close_text_document(decode(params)?).await?;
            Ok(Value::Null)
        })
    }

    pub fn completion<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move { encode(server.completion(decode(params)?).await?) })
    }

    pub fn resolve_completion_item<S: LanguageServer>(
        server: &mut S,
        params: Option<Value>,
    ) -> Invoked<'_> {
        Box::pin(async move { encode(server.resolve_completion_item(decode(params)?).await?) })
    }

    pub fn hover<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move { encode(server.hover(decode(params)?).await?) })
    }

    pub fn signature_help<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move { encode(server.signature_help(decode(params)?).await?) })
    }

    pub fn goto_definition<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move { encode(server.goto_definition(decode(params)?).await?) })
    }

    pub fn find_references<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move { encode(server.find_references(decode(params)?).await?) })
    }

    pub fn document_symbol<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move { encode(server.document_symbol(decode(params)?).await?) })
    }

    pub fn code_action<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move { encode(server.code_action(decode(params)?).await?) })
    }

    pub fn code_lens<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move { encode(server.code_lens(decode(params)?).await?) })
    }

    pub fn resolve_code_lens<S: LanguageServer>(
        server: &mut S,
        params: Option<Value>,
    ) -> Invoked<'_> {
        Box::pin(async move { encode(server.resolve_code_lens(decode(params)?).await?) })
    }

    pub fn prepare_rename<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move { encode(server.prepare_rename(decode(params)?).await?) })
    }

    pub fn rename<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move { encode(server.rename(decode(params)?).await?) })
    }

    pub fn formatting<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move { encode(server.formatting(decode(params)?).await?) })
    }

    pub fn folding_range<S: LanguageServer>(server: &mut S, params: Option<Value>) -> Invoked<'_> {
        Box::pin(async move { encode(server.folding_range(decode(params)?).await?) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::lsp::{
        DidOpenTextDocumentParams, Hover, InitializeParams, InitializeResult, MarkedString,
        TextDocumentPositionParams,
    };
    use crate::transport::write_frame;
    use anyhow::bail;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{ReadHalf, WriteHalf};

    /// What a test server observed, shared with the test body.
    #[derive(Default)]
    struct Observed {
        opened: StdMutex<Vec<String>>,
        responses: StdMutex<Vec<(u64, String)>>,
        idle_ticks: AtomicUsize,
    }

    struct TestServer {
        observed: Arc<Observed>,
    }

    #[async_trait]
    impl LanguageServer for TestServer {
        async fn initialize(&mut self, _params: InitializeParams) -> anyhow::Result<InitializeResult> {
            Ok(InitializeResult {
                capabilities: json!({"hoverProvider": true}),
                server_info: None,
            })
        }

        async fn hover(
            &mut self,
            _params: TextDocumentPositionParams,
        ) -> anyhow::Result<Option<Hover>> {
            Ok(Some(Hover {
                contents: vec![MarkedString::String("a docstring".to_string())],
                range: None,
            }))
        }

        async fn goto_definition(
            &mut self,
            _params: TextDocumentPositionParams,
        ) -> anyhow::Result<Option<Vec<crate::models::lsp::Location>>> {
            bail!("index unavailable")
        }

        async fn did_open_text_document(
            &mut self,
            params: DidOpenTextDocumentParams,
        ) -> anyhow::Result<()> {
            self.observed
                .opened
                .lock()
                .unwrap()
                .push(params.text_document.uri);
            Ok(())
        }

        async fn handle_show_message_response(
            &mut self,
            id: u64,
            item: MessageActionItem,
        ) -> anyhow::Result<()> {
            self.observed
                .responses
                .lock()
                .unwrap()
                .push((id, item.title));
            Ok(())
        }

        async fn idle_work(&mut self) -> anyhow::Result<()> {
            self.observed.idle_ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Session {
        observed: Arc<Observed>,
        editor_read: Transport<ReadHalf<tokio::io::DuplexStream>>,
        editor_write: WriteHalf<tokio::io::DuplexStream>,
        connection: tokio::task::JoinHandle<Result<(), ProtocolError>>,
    }

    fn start(options: ConnectOptions) -> Session {
        let (editor_io, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (editor_read, editor_write) = tokio::io::split(editor_io);

        let observed = Arc::new(Observed::default());
        let server_observed = Arc::clone(&observed);
        let connection = tokio::spawn(connect_with(
            move |_client| TestServer {
                observed: server_observed,
            },
            server_read,
            server_write,
            options,
        ));

        Session {
            observed,
            editor_read: Transport::new(editor_read),
            editor_write,
            connection,
        }
    }

    impl Session {
        async fn send(&mut self, body: &Value) {
            write_frame(&mut self.editor_write, &body.to_string())
                .await
                .unwrap();
        }

        async fn receive(&mut self) -> Value {
            let token = self.editor_read.read_token().await.unwrap();
            serde_json::from_str(&token).unwrap()
        }

        async fn finish(mut self) {
            self.send(&json!({"jsonrpc": "2.0", "method": "exit"})).await;
            self.connection.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_initialize_round_trip() {
        let mut session = start(ConnectOptions::default());
        session
            .send(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
            .await;

        let response = session.receive().await;
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["capabilities"]["hoverProvider"], true);
        assert!(response.get("error").is_none());

        session.finish().await;
    }

    #[tokio::test]
    async fn test_shutdown_replies_null_then_exit_ends_the_loop() {
        let mut session = start(ConnectOptions::default());
        session
            .send(&json!({"jsonrpc": "2.0", "id": 9, "method": "shutdown"}))
            .await;

        let response = session.receive().await;
        assert_eq!(response["id"], 9);
        assert!(response["result"].is_null());
        assert!(response.as_object().unwrap().contains_key("result"));

        session.finish().await;
    }

    #[tokio::test]
    async fn test_closing_the_editor_side_ends_the_loop() {
        let Session {
            editor_read,
            editor_write,
            connection,
            ..
        } = start(ConnectOptions::default());

        // Both halves must go for the peer stream to drop.
        drop(editor_read);
        drop(editor_write);
        connection.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_method_is_ignored_and_the_loop_survives() {
        let mut session = start(ConnectOptions::default());
        session
            .send(&json!({"jsonrpc": "2.0", "method": "workspace/madeUpMethod", "params": {}}))
            .await;
        session
            .send(&json!({"jsonrpc": "2.0", "id": 2, "method": "initialize", "params": {}}))
            .await;

        let response = session.receive().await;
        assert_eq!(response["id"], 2);

        session.finish().await;
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_internal_error_response() {
        let mut session = start(ConnectOptions::default());
        session
            .send(&json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "textDocument/definition",
                "params": {
                    "textDocument": {"uri": "file:///main.rs"},
                    "position": {"line": 0, "character": 0}
                }
            }))
            .await;

        let response = session.receive().await;
        assert_eq!(response["id"], 3);
        assert_eq!(response["error"]["code"], -32603);
        assert_eq!(response["error"]["message"], "index unavailable");
        assert!(response.get("result").is_none());

        session.finish().await;
    }

    #[tokio::test]
    async fn test_unimplemented_default_answers_with_an_error() {
        let mut session = start(ConnectOptions::default());
        session
            .send(&json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "textDocument/rename",
                "params": {
                    "textDocument": {"uri": "file:///main.rs"},
                    "position": {"line": 0, "character": 0},
                    "newName": "renamed"
                }
            }))
            .await;

        let response = session.receive().await;
        assert_eq!(response["error"]["code"], -32603);
        assert_eq!(response["error"]["message"], "textDocument/rename is not implemented");

        session.finish().await;
    }

    #[tokio::test]
    async fn test_notification_dispatch_reaches_the_handler() {
        let mut session = start(ConnectOptions::default());
        session
            .send(&json!({
                "jsonrpc": "2.0",
                "method": "textDocument/didOpen",
                "params": {
                    "textDocument": {
                        "uri": "file:///main.rs",
                        "languageId": "rust",
                        "version": 1,
                        "text": "fn main() {}"
                    }
                }
            }))
            .await;

        // A request afterwards proves the notification was consumed first.
        session
            .send(&json!({"jsonrpc": "2.0", "id": 5, "method": "initialize", "params": {}}))
            .await;
        session.receive().await;

        let opened = session.observed.opened.lock().unwrap().clone();
        assert_eq!(opened, vec!["file:///main.rs".to_string()]);

        session.finish().await;
    }

    #[tokio::test]
    async fn test_peer_response_routes_by_id_and_the_loop_continues() {
        let mut session = start(ConnectOptions::default());
        session
            .send(&json!({"jsonrpc": "2.0", "id": 1, "result": {"title": "Retry"}}))
            .await;
        session
            .send(&json!({"jsonrpc": "2.0", "id": 6, "method": "initialize", "params": {}}))
            .await;

        let response = session.receive().await;
        assert_eq!(response["id"], 6);

        let responses = session.observed.responses.lock().unwrap().clone();
        assert_eq!(responses, vec![(1, "Retry".to_string())]);

        session.finish().await;
    }

    #[tokio::test]
    async fn test_peer_error_response_is_swallowed() {
        let mut session = start(ConnectOptions::default());
        session
            .send(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32603, "message": "editor exploded"}
            }))
            .await;
        session
            .send(&json!({"jsonrpc": "2.0", "id": 7, "method": "initialize", "params": {}}))
            .await;

        let response = session.receive().await;
        assert_eq!(response["id"], 7);
        assert!(session.observed.responses.lock().unwrap().is_empty());

        session.finish().await;
    }

    #[tokio::test]
    async fn test_idle_tick_fires_once_after_work() {
        let mut session = start(ConnectOptions {
            queue_capacity: 10,
            idle_poll: Duration::from_millis(10),
        });
        session
            .send(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
            .await;
        session.receive().await;

        // Several idle polls elapse, but only the first one after the
        // message may fire the hook.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.observed.idle_ticks.load(Ordering::SeqCst), 1);

        session.finish().await;
    }

    #[tokio::test]
    async fn test_cancellation_removes_a_queued_request() {
        let queue = Arc::new(PendingQueue::new(10));

        let mut frames = Vec::new();
        write_frame(
            &mut frames,
            &json!({"jsonrpc": "2.0", "id": 7, "method": "textDocument/hover", "params": {}})
                .to_string(),
        )
        .await
        .unwrap();
        write_frame(
            &mut frames,
            &json!({"jsonrpc": "2.0", "method": "$/cancelRequest", "params": {"id": 7}})
                .to_string(),
        )
        .await
        .unwrap();

        // No consumer is running, so the request is still queued when the
        // cancellation is peeked.
        ingress(Transport::new(frames.as_slice()), Arc::clone(&queue)).await;

        let first = queue.pop(Duration::from_millis(50)).await.unwrap();
        assert_eq!(
            match &first {
                Inbound::Message(message) => message.method(),
                Inbound::Closed => None,
            },
            Some("$/cancelRequest")
        );
        assert!(matches!(
            queue.pop(Duration::from_millis(50)).await.unwrap(),
            Inbound::Closed
        ));
    }

    #[tokio::test]
    async fn test_cancellation_miss_leaves_the_queue_alone() {
        let queue = Arc::new(PendingQueue::new(10));

        let mut frames = Vec::new();
        write_frame(
            &mut frames,
            &json!({"jsonrpc": "2.0", "id": 7, "method": "textDocument/hover", "params": {}})
                .to_string(),
        )
        .await
        .unwrap();
        write_frame(
            &mut frames,
            &json!({"jsonrpc": "2.0", "method": "$/cancelRequest", "params": {"id": 99}})
                .to_string(),
        )
        .await
        .unwrap();

        ingress(Transport::new(frames.as_slice()), Arc::clone(&queue)).await;

        let first = queue.pop(Duration::from_millis(50)).await.unwrap();
        assert_eq!(
            match &first {
                Inbound::Message(message) => message.method(),
                Inbound::Closed => None,
            },
            Some("textDocument/hover")
        );
    }

    /// Reader whose stream is broken mid-connection: every read fails with
    /// a connection reset instead of a clean EOF.
    struct BrokenReader;

    impl AsyncRead for BrokenReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )))
        }
    }

    #[tokio::test]
    async fn test_broken_stream_still_delivers_the_sentinel() {
        let queue = Arc::new(PendingQueue::new(10));

        // Must terminate rather than retry the failing read forever.
        ingress(Transport::new(BrokenReader), Arc::clone(&queue)).await;

        assert!(matches!(
            queue.pop(Duration::from_millis(50)).await.unwrap(),
            Inbound::Closed
        ));
        assert!(queue.pop(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let queue = Arc::new(PendingQueue::new(10));

        let mut frames = b"Content-Length: 12\r\n\r\nnot json!!!!".to_vec();
        write_frame(
            &mut frames,
            &json!({"jsonrpc": "2.0", "method": "initialized"}).to_string(),
        )
        .await
        .unwrap();

        ingress(Transport::new(frames.as_slice()), Arc::clone(&queue)).await;

        let first = queue.pop(Duration::from_millis(50)).await.unwrap();
        assert_eq!(
            match &first {
                Inbound::Message(message) => message.method(),
                Inbound::Closed => None,
            },
            Some("initialized")
        );
    }
}
