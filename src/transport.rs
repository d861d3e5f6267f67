//! LSP wire framing.
//!
//! Every message travels as `Content-Length: N\r\n\r\n{json}`. The reader
//! tolerates extra headers (terminated the same way) and stray line-ending
//! noise between frames, which some editors are known to emit.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::ProtocolError;

/// Frames larger than this are rejected to bound allocation.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Reads length-delimited JSON tokens from a byte stream.
pub struct Transport<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> Transport<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next frame and return its body as JSON text.
    ///
    /// `Content-Length` is a byte count: exactly that many raw bytes are
    /// consumed before the body is decoded as UTF-8, so multi-byte code
    /// points never shift the frame boundary.
    pub async fn read_token(&mut self) -> Result<String, ProtocolError> {
        let content_length = self.read_headers().await?;

        if content_length > MAX_FRAME_BYTES {
            return Err(ProtocolError::MalformedFrame(format!(
                "Content-Length {} exceeds the {} byte limit",
                content_length, MAX_FRAME_BYTES
            )));
        }

        self.skip_stray_whitespace().await?;

        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body).await?;

        let text = String::from_utf8(body)
            .map_err(|e| ProtocolError::MalformedFrame(format!("body is not valid UTF-8: {}", e)))?;

        tracing::trace!("<- {}", text);
        Ok(text)
    }

    /// Read header lines until the blank separator and return the
    /// Content-Length value. If the header repeats, the last one wins.
    async fn read_headers(&mut self) -> Result<usize, ProtocolError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = self.reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                return Err(ProtocolError::StreamClosed);
            }

            let line = line.trim();

            // Empty line marks end of headers
            if line.is_empty() {
                break;
            }

            if let Some(value) = line.strip_prefix("Content-Length:") {
                let parsed = value.trim().parse().map_err(|_| {
                    ProtocolError::MalformedFrame(format!(
                        "invalid Content-Length value: {}",
                        value.trim()
                    ))
                })?;
                content_length = Some(parsed);
            }
            // Other headers (Content-Type, etc.) are ignored.
        }

        content_length
            .ok_or_else(|| ProtocolError::MalformedFrame("missing Content-Length header".into()))
    }

    /// Eat whitespace bytes between the header block and the body. Some
    /// peers send extra `\r\n` sequences here; the declared length counts
    /// from the first non-whitespace byte.
    async fn skip_stray_whitespace(&mut self) -> Result<(), ProtocolError> {
        loop {
            let buffered = self.reader.fill_buf().await?;
            if buffered.is_empty() {
                return Err(ProtocolError::StreamClosed);
            }
            match buffered.iter().position(|b| !b.is_ascii_whitespace()) {
                Some(0) => return Ok(()),
                Some(n) => {
                    self.reader.consume(n);
                    return Ok(());
                }
                None => {
                    let n = buffered.len();
                    self.reader.consume(n);
                }
            }
        }
    }
}

/// Write one framed message and flush it.
///
/// Header and body go out back to back; callers must serialize access to
/// the writer so concurrent frames never interleave.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &str,
) -> Result<(), ProtocolError> {
    tracing::trace!("-> {}", body);

    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_one(input: &[u8]) -> Result<String, ProtocolError> {
        Transport::new(input).read_token().await
    }

    #[tokio::test]
    async fn test_round_trip() {
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#;
        let mut framed = Vec::new();
        write_frame(&mut framed, body).await.unwrap();

        assert!(framed.starts_with(b"Content-Length: 58\r\n\r\n"));
        assert_eq!(read_one(&framed).await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_content_length_counts_bytes_not_chars() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":"🔥"}"#;
        assert_eq!(body.len(), 40);
        assert_eq!(body.chars().count(), 37);

        let mut framed = Vec::new();
        write_frame(&mut framed, body).await.unwrap();
        assert!(framed.starts_with(b"Content-Length: 40\r\n\r\n"));

        assert_eq!(read_one(&framed).await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_reads_consecutive_frames() {
        let mut framed = Vec::new();
        write_frame(&mut framed, r#"{"id":1}"#).await.unwrap();
        write_frame(&mut framed, r#"{"id":2}"#).await.unwrap();

        let mut transport = Transport::new(framed.as_slice());
        assert_eq!(transport.read_token().await.unwrap(), r#"{"id":1}"#);
        assert_eq!(transport.read_token().await.unwrap(), r#"{"id":2}"#);
        assert!(matches!(
            transport.read_token().await,
            Err(ProtocolError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_skips_stray_line_endings_before_body() {
        // Extra \r\n sequences between header block and body.
        let input = b"Content-Length: 2\r\n\r\n\r\n\r\n{}";
        assert_eq!(read_one(input).await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_ignores_unknown_headers() {
        let input =
            b"Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: 2\r\n\r\n{}";
        assert_eq!(read_one(input).await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_repeated_content_length_last_wins() {
        let input = b"Content-Length: 999\r\nContent-Length: 2\r\n\r\n{}";
        assert_eq!(read_one(input).await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_missing_content_length_is_malformed() {
        let input = b"Content-Type: application/json\r\n\r\n{}";
        assert!(matches!(
            read_one(input).await,
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_content_length_is_malformed() {
        let input = b"Content-Length: twelve\r\n\r\n{}";
        assert!(matches!(
            read_one(input).await,
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_malformed() {
        let input = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        assert!(matches!(
            read_one(input.as_bytes()).await,
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_before_headers_is_stream_closed() {
        assert!(matches!(
            read_one(b"").await,
            Err(ProtocolError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_headers_is_stream_closed() {
        assert!(matches!(
            read_one(b"Content-Length: 10\r\n").await,
            Err(ProtocolError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_body_is_stream_closed() {
        assert!(matches!(
            read_one(b"Content-Length: 100\r\n\r\n{\"tru").await,
            Err(ProtocolError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_non_utf8_body_is_malformed() {
        let input = b"Content-Length: 2\r\n\r\n\xff\xfe";
        assert!(matches!(
            read_one(input).await,
            Err(ProtocolError::MalformedFrame(_))
        ));
    }
}
