//! IPC listener for the service side
//!
//! Helpers for creating and managing the Unix Domain Socket and for framing
//! messages on it.

use std::path::Path;

use eyre::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tracing::{debug, warn};

use super::messages::{Request, Response};

/// Maximum size of one request line
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Create and bind the service socket at `socket_path`
///
/// Handles cleanup of stale socket files from previous runs.
pub fn create_listener_at(socket_path: &Path) -> Result<UnixListener> {
    debug!(?socket_path, "create_listener_at: creating IPC socket");

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    if socket_path.exists() {
        debug!(?socket_path, "create_listener_at: removing stale socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(socket_path).context("Failed to bind IPC socket")?;
    debug!(?socket_path, "create_listener_at: socket bound");
    Ok(listener)
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(socket_path: &Path) {
    if socket_path.exists() {
        debug!(?socket_path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(?socket_path, error = %e, "Failed to remove socket file");
        }
    }
}

/// One newline-delimited frame read from a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    /// More than `MAX_MESSAGE_SIZE` bytes arrived without a newline
    TooLarge,
    Eof,
}

/// Read one frame, buffering at most `MAX_MESSAGE_SIZE + 1` bytes
///
/// After `TooLarge` the rest of the oversized line is still unread, so the
/// caller should drop the connection.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await
        .context("Failed to read IPC message")?;
    if read == 0 {
        return Ok(Frame::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > MAX_MESSAGE_SIZE {
        return Ok(Frame::TooLarge);
    }
    Ok(Frame::Line(String::from_utf8_lossy(&buf).into_owned()))
}

/// Parse one request line
pub fn parse_request(line: &str) -> std::result::Result<Request, Response> {
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(Response::protocol_error(format!("Message too large: {} bytes", line.len())));
    }
    serde_json::from_str(line.trim()).map_err(|e| Response::protocol_error(format!("Malformed request: {}", e)))
}

/// Write one response line
pub async fn send_response<W>(writer: &mut W, response: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response_json = serde_json::to_string(response).context("Failed to serialize response")?;
    writer
        .write_all(response_json.as_bytes())
        .await
        .context("Failed to write response")?;
    writer.write_all(b"\n").await.context("Failed to write newline")?;
    writer.flush().await.context("Failed to flush response")?;
    debug!(?response, "send_response: sent response");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_listener_creates_parent_dir() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("subdir").join("service.sock");

        create_listener_at(&socket_path).unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_create_listener_removes_stale_socket() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("service.sock");
        std::fs::write(&socket_path, "stale").unwrap();

        assert!(create_listener_at(&socket_path).is_ok());
    }

    #[test]
    fn test_cleanup_socket() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("service.sock");
        std::fs::write(&socket_path, "test").unwrap();

        cleanup_socket(&socket_path);
        assert!(!socket_path.exists());
        // Missing file is fine
        cleanup_socket(&socket_path);
    }

    #[test]
    fn test_parse_request_errors() {
        assert_eq!(parse_request(r#"{"type":"Ping"}"#).unwrap(), Request::Ping);
        match parse_request("not json") {
            Err(Response::Error { kind, .. }) => assert_eq!(kind, super::super::messages::ErrorKind::Protocol),
            other => panic!("Expected protocol error, got {:?}", other),
        }
        let huge = "x".repeat(MAX_MESSAGE_SIZE + 1);
        assert!(parse_request(&huge).is_err());
    }

    #[tokio::test]
    async fn test_read_frame_splits_lines() {
        let mut reader: &[u8] = b"{\"type\":\"Ping\"}\n\nlast";
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Frame::Line(r#"{"type":"Ping"}"#.to_string())
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Line(String::new()));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Line("last".to_string()));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Eof);
    }

    #[tokio::test]
    async fn test_read_frame_stops_at_size_limit() {
        let mut input = vec![b'x'; MAX_MESSAGE_SIZE];
        input.push(b'\n');
        input.extend(std::iter::repeat_n(b'y', MAX_MESSAGE_SIZE * 4));
        input.push(b'\n');
        let mut reader: &[u8] = &input;

        match read_frame(&mut reader).await.unwrap() {
            Frame::Line(line) => assert_eq!(line.len(), MAX_MESSAGE_SIZE),
            other => panic!("Expected a full-size line, got {:?}", other),
        }
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::TooLarge);
        // only the limit was consumed from the oversized line
        assert_eq!(reader.len(), MAX_MESSAGE_SIZE * 3);
    }

    #[tokio::test]
    async fn test_send_response_writes_one_line() {
        let mut buf: Vec<u8> = Vec::new();
        send_response(&mut buf, &Response::Ok).await.unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "{\"type\":\"Ok\"}\n");
    }
}
