//! lsp-relay - Language Server Protocol transport and dispatch core
//!
//! Speaks the LSP wire protocol over any async byte stream: frames and
//! decodes JSON-RPC messages, queues them with backpressure and cooperative
//! cancellation, and dispatches them one at a time to a [`LanguageServer`]
//! implementation, which talks back through a [`LanguageClient`] handle.
//!
//! A host binary owns the streams and calls [`connect`].

pub mod client;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod transport;

pub use client::LanguageClient;
pub use dispatch::{ConnectOptions, connect, connect_with};
pub use error::ProtocolError;
pub use server::LanguageServer;
