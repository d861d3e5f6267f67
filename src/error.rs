//! Error types for lsp-relay

use thiserror::Error;

/// Errors raised by the transport, codec and pipeline layers.
///
/// Handler failures are deliberately not part of this taxonomy: handler
/// operations return `anyhow::Result` and the dispatch loop converts a
/// failure into a JSON-RPC error response instead of propagating it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed its end of the stream. Terminal for the connection:
    /// the reader delivers the close sentinel and stops, it never retries.
    #[error("stream closed by peer")]
    StreamClosed,

    /// A frame violated the header contract (no Content-Length, an
    /// unparseable length value, an oversized body, or a non-UTF-8 body).
    /// The offending frame is dropped and the connection continues.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The frame body was not a recognizable JSON-RPC message. Carries the
    /// offending text so it is never silently lost from the logs.
    #[error("cannot decode message: {text}")]
    Decode {
        text: String,
        #[source]
        source: serde_json::Error,
    },

    /// A stream-level read or write fault other than a clean EOF. The byte
    /// stream is no longer trustworthy, so this is terminal like
    /// `StreamClosed`: skipping it and reading again would spin on the same
    /// fault forever.
    #[error(transparent)]
    Io(std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Whether this error ends the connection rather than a single frame.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StreamClosed | Self::Io(_))
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        // EOF at any read point means the peer went away.
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::StreamClosed
        } else {
            Self::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_eof_maps_to_stream_closed() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err = ProtocolError::from(io);
        assert!(matches!(err, ProtocolError::StreamClosed));
        assert!(err.is_terminal());
    }

    #[test]
    fn test_other_io_errors_stay_io_but_are_still_terminal() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = ProtocolError::from(io);
        assert!(matches!(err, ProtocolError::Io(_)));
        assert!(err.is_terminal());
    }

    #[test]
    fn test_decode_errors_are_recoverable() {
        let source = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err = ProtocolError::Decode {
            text: "not json".into(),
            source,
        };
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_malformed_frame_is_recoverable() {
        let err = ProtocolError::MalformedFrame("missing Content-Length header".into());
        assert!(!err.is_terminal());
        assert_eq!(
            err.to_string(),
            "malformed frame: missing Content-Length header"
        );
    }
}
