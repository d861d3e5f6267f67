//! The outbound half of a connection.
//!
//! All frames leave through one [`Outbound`] writer so header+body pairs are
//! written atomically, and the handler reaches the editor only through the
//! [`LanguageClient`] capability trait, which keeps the core substitutable
//! with an in-memory double in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::models::lsp::{
    PublishDiagnosticsParams, RegistrationParams, ShowMessageParams, ShowMessageRequestParams,
};
use crate::protocol::{Notification, Request, RequestId, Response, ResponseError};
use crate::transport::write_frame;

/// Operations a handler may invoke against the connected editor.
///
/// `show_message_request` returns immediately with the correlation id; the
/// peer's eventual answer comes back through
/// [`LanguageServer::handle_show_message_response`](crate::server::LanguageServer::handle_show_message_response)
/// keyed by that id.
#[async_trait]
pub trait LanguageClient: Send + Sync {
    async fn publish_diagnostics(
        &self,
        params: PublishDiagnosticsParams,
    ) -> Result<(), ProtocolError>;

    async fn show_message(&self, params: ShowMessageParams) -> Result<(), ProtocolError>;

    /// Register a capability dynamically under a fresh registration id.
    async fn register_capability(&self, method: &str, options: Value)
    -> Result<(), ProtocolError>;

    /// Send a notification with an arbitrary method name.
    async fn custom_notification(&self, method: &str, params: Value)
    -> Result<(), ProtocolError>;

    async fn show_message_request(
        &self,
        params: ShowMessageRequestParams,
    ) -> Result<u64, ProtocolError>;
}

/// The single logical writer for one connection.
///
/// Responses, notifications and server-initiated requests all funnel through
/// here; the mutex serializes whole frames even when handler-spawned tasks
/// write concurrently with the dispatch loop.
pub(crate) struct Outbound<W> {
    writer: Mutex<W>,
    next_id: AtomicU64,
}

impl<W: AsyncWrite + Unpin + Send> Outbound<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            next_id: AtomicU64::new(1),
        }
    }

    /// Reply to an inbound request. An empty handler result is written as an
    /// explicit `result: null`, never an omitted key.
    pub async fn respond(&self, id: RequestId, result: Value) -> Result<(), ProtocolError> {
        self.write(&Response::success(id, result)).await
    }

    pub async fn respond_err(
        &self,
        id: RequestId,
        error: ResponseError,
    ) -> Result<(), ProtocolError> {
        self.write(&Response::failure(id, error)).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProtocolError> {
        self.write(&Notification::new(method, params)).await
    }

    /// Send a request to the peer and return its correlation id.
    ///
    /// Ids come from a monotonic counter, so they stay unique for the life
    /// of the connection with no collision risk.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<u64, ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write(&Request::new(id, method, params)).await?;
        Ok(id)
    }

    async fn write<T: Serialize>(&self, message: &T) -> Result<(), ProtocolError> {
        let body = serde_json::to_string(message)?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &body).await
    }
}

/// [`LanguageClient`] adapter bound to the live connection.
pub(crate) struct RemoteClient<W> {
    outbound: Arc<Outbound<W>>,
}

impl<W> RemoteClient<W> {
    pub fn new(outbound: Arc<Outbound<W>>) -> Self {
        Self { outbound }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> LanguageClient for RemoteClient<W> {
    async fn publish_diagnostics(
        &self,
        params: PublishDiagnosticsParams,
    ) -> Result<(), ProtocolError> {
        let params = serde_json::to_value(params)?;
        self.outbound
            .notify("textDocument/publishDiagnostics", Some(params))
            .await
    }

    async fn show_message(&self, params: ShowMessageParams) -> Result<(), ProtocolError> {
        let params = serde_json::to_value(params)?;
        self.outbound.notify("window/showMessage", Some(params)).await
    }

    async fn register_capability(
        &self,
        method: &str,
        options: Value,
    ) -> Result<(), ProtocolError> {
        let params = RegistrationParams {
            id: Uuid::new_v4().to_string(),
            method: method.to_string(),
            register_options: Some(options),
        };
        let params = serde_json::to_value(params)?;
        self.outbound
            .notify("client/registerCapability", Some(params))
            .await
    }

    async fn custom_notification(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(), ProtocolError> {
        self.outbound.notify(method, Some(params)).await
    }

    async fn show_message_request(
        &self,
        params: ShowMessageRequestParams,
    ) -> Result<u64, ProtocolError> {
        let params = serde_json::to_value(params)?;
        self.outbound
            .request("window/showMessageRequest", Some(params))
            .await
    }
}
