//! Transport Layer
//!
//! Socket setup and the WebSocket upgrade.

mod websocket;

pub use websocket::{accept_with_path, extract_token, WsUpgrade};

use tokio::net::TcpStream;

/// Configure an accepted TCP stream
pub fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    // Small JSON frames; don't wait to coalesce them
    stream.set_nodelay(true)
}
