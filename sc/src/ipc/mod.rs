//! Inter-Process Communication with the service
//!
//! Unix Domain Socket transport for the RPC surface. Clients send one JSON
//! request per line; the server identifies the caller by the socket's peer
//! credentials and answers with one JSON response per line. A subscription
//! keeps its connection open and receives updates as they happen; a source
//! can likewise watch for the refresh and issue-action requests meant for it.

use std::path::PathBuf;

pub mod client;
pub mod listener;
pub mod messages;
pub mod server;

pub use client::{ScClient, SourceRequests, Subscription};
pub use listener::{cleanup_socket, create_listener_at};
pub use messages::{ErrorKind, Request, Response};
pub use server::{SocketListener, dispatch, handle_connection, serve};

/// Default socket path for the service
pub fn get_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("safetycenter")
        .join("sc.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_ends_with_sc_sock() {
        let path = get_socket_path();
        assert!(path.ends_with("safetycenter/sc.sock"));
    }
}
