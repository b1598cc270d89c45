//! WebSocket handshake control.

pub mod server;

use std::{cell::RefCell, rc::Rc};

use data_encoding::BASE64;
use http::{header::HeaderName, HeaderMap, HeaderValue};
use sha1::{Digest, Sha1};

use crate::error::{Error, ProtocolError, Result};

/// Limit the number of header lines.
const MAX_HEADERS: usize = 124;

/// Request headers shared between a connection and its request reader.
///
/// Only the request reader writes to the map, once, when the request has been
/// parsed completely. Everything runs on the dispatcher thread.
pub type SharedHeaders = Rc<RefCell<HeaderMap>>;

/// Trait to read HTTP parseable objects.
pub trait TryParse: Sized {
    /// Return Ok(None) if incomplete, Err on syntax error.
    fn try_parse(data: &[u8]) -> Result<Option<(usize, Self)>>;
}

/// Trait to convert raw objects into HTTP parseables.
pub(crate) trait FromHttparse<T>: Sized {
    /// Convert raw object into parsed HTTP headers.
    fn from_httparse(raw: T) -> Result<Self>;
}

impl<'b: 'h, 'h> FromHttparse<&'b [httparse::Header<'h>]> for HeaderMap {
    fn from_httparse(raw: &'b [httparse::Header<'h>]) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for h in raw {
            headers.append(
                HeaderName::from_bytes(h.name.as_bytes())?,
                HeaderValue::from_bytes(h.value)?,
            );
        }

        Ok(headers)
    }
}

/// Derive the `Sec-WebSocket-Accept` response header from a `Sec-WebSocket-Key` request header.
///
/// This function can be used to perform a handshake before passing a raw TCP stream along.
pub fn derive_accept_key(request_key: &[u8]) -> String {
    // ... field is constructed by concatenating /key/ ...
    // ... with the string "258EAFA5-E914-47DA-95CA-C5AB0DC85B11" (RFC 6455)
    const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut sha1 = Sha1::default();
    sha1.update(request_key);
    sha1.update(WS_GUID);
    BASE64.encode(&sha1.finalize())
}

/// Check whether the header `name` lists `token` (case-insensitive, comma separated).
pub(crate) fn header_contains_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Check if the given header has the given value, ignoring ASCII case.
pub(crate) fn header_is_ignore_case(headers: &HeaderMap, name: &str, value: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case(value))
        .unwrap_or(false)
}

/// Check the upgrade headers of a request.
///
/// Returns the `Sec-WebSocket-Key` if `Connection` lists `upgrade`, `Upgrade` is
/// `websocket` and `Sec-WebSocket-Version` is 13.
pub(crate) fn check_upgrade_headers(headers: &HeaderMap) -> Result<&[u8]> {
    if !header_contains_token(headers, "Connection", "upgrade") {
        return Err(Error::Protocol(ProtocolError::MissingConnectionUpgradeHeader));
    }

    if !header_is_ignore_case(headers, "Upgrade", "websocket") {
        return Err(Error::Protocol(ProtocolError::MissingUpgradeWebSocketHeader));
    }

    if !headers.get("Sec-WebSocket-Version").map(|h| h == "13").unwrap_or(false) {
        return Err(Error::Protocol(ProtocolError::MissingSecWebSocketVersionHeader));
    }

    headers
        .get("Sec-WebSocket-Key")
        .map(|key| key.as_bytes())
        .ok_or(Error::Protocol(ProtocolError::MissingSecWebSocketKey))
}

/// Tell whether the request headers ask for a WebSocket upgrade.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    check_upgrade_headers(headers).is_ok()
}
