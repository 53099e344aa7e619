//! WebSocket Transport
//!
//! Accepts the WebSocket upgrade on the configured path and picks up the
//! session token the client presented with it, if any.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;
use url::form_urlencoded;

/// Query parameters that may carry the session token
const TOKEN_PARAMS: [&str; 2] = ["token", "access_token"];

/// An accepted WebSocket and the token presented at upgrade
pub struct WsUpgrade<S> {
    pub socket: WebSocketStream<S>,
    pub token: Option<String>,
}

/// Accept a WebSocket connection with path validation
pub async fn accept_with_path<S>(
    stream: S,
    expected_path: &str,
    max_message_size: usize,
) -> Result<WsUpgrade<S>, io::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let expected_path = expected_path.to_string();
    let token = Arc::new(Mutex::new(None));
    let found = token.clone();

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);

    let socket = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request, response: Response| {
            let request_path = req.uri().path();
            if request_path != expected_path {
                let mut rejection = ErrorResponse::new(Some(format!(
                    "Invalid path: expected '{}', got '{}'",
                    expected_path, request_path
                )));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                return Err(rejection);
            }

            *found.lock() = extract_token(req);
            Ok(response)
        },
        Some(config),
    )
    .await
    .map_err(io::Error::other)?;

    let token = token.lock().take();
    Ok(WsUpgrade { socket, token })
}

/// Session token from `Authorization: Bearer|Token <t>` or the
/// percent-decoded query string
pub fn extract_token(req: &Request) -> Option<String> {
    let from_header = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            let scheme_ok =
                scheme.eq_ignore_ascii_case("bearer") || scheme.eq_ignore_ascii_case("token");
            let token = token.trim();
            (scheme_ok && !token.is_empty()).then(|| token.to_string())
        });
    if from_header.is_some() {
        return from_header;
    }

    let query = req.uri().query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, value)| TOKEN_PARAMS.iter().any(|param| key == param) && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}
