//! WebSocket upgrade handshake (RFC 6455)
//!
//! Only the handshake lives here: validating the upgrade headers,
//! computing the accept key and producing the 101 response. Once the
//! connection sees the websocket flag it leaves the HTTP loop; frame
//! traffic is the caller's concern.

use base64ct::{Base64, Encoding};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::request::{Request, RequestFlags};
use crate::response::{Response, ResponseBuilder, StatusCode};

const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Sec-WebSocket-Accept value for a client key.
pub fn accept_key(client_key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key);
    hasher.update(WEBSOCKET_GUID);
    Base64::encode_string(&hasher.finalize())
}

/// Perform the upgrade handshake for `request`.
///
/// Requires an unanswered request whose Connection header carried
/// `upgrade`, an `Upgrade: websocket` header and a syntactically valid
/// base64 `Sec-WebSocket-Key`. On success the request is flagged as a
/// websocket and the returned 101 response switches the connection
/// mode once written.
pub fn upgrade(request: &mut Request) -> Result<Response> {
    if request.flags.contains(RequestFlags::HEADERS_SENT) {
        return Err(Error::Internal("response headers already sent"));
    }
    if !request.wants_upgrade() {
        return Err(Error::BadRequest);
    }

    match request.header("Upgrade") {
        Some(value) if value == b"websocket" => {}
        _ => return Err(Error::BadRequest),
    }

    let key = match request.header("Sec-WebSocket-Key") {
        Some(value) => value.to_vec(),
        None => return Err(Error::BadRequest),
    };
    if std::str::from_utf8(&key)
        .ok()
        .and_then(|s| Base64::decode_vec(s).ok())
        .is_none()
    {
        return Err(Error::BadRequest);
    }

    let accept = accept_key(&key);
    request.flags.set(RequestFlags::IS_WEBSOCKET);

    Ok(ResponseBuilder::new(StatusCode::SWITCHING_PROTOCOLS)
        .header("Sec-WebSocket-Accept", accept)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .no_content_length()
        .build())
}
