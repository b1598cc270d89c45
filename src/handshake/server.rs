//! Server handshake: reading the upgrade request and producing the response.

use std::{
    io::{self, Read},
    mem,
};

use bytes::Buf;
use http::{HeaderMap, Method, Request as HttpRequest, Version};
use httparse::Status;
use log::*;

use super::{
    check_upgrade_headers, derive_accept_key, FromHttparse, SharedHeaders, TryParse, MAX_HEADERS,
};
use crate::{
    error::{CapacityError, Error, ProtocolError, Result},
    ReadBuffer,
};

/// Server request type.
pub type Request = HttpRequest<()>;

/// Check the request for every requirement of the opening handshake.
///
/// Returns the `Sec-WebSocket-Key` on success.
pub fn validate_request(request: &Request) -> Result<&[u8]> {
    if request.method() != Method::GET {
        return Err(Error::Protocol(ProtocolError::WrongHttpMethod));
    }

    if request.version() < Version::HTTP_11 {
        return Err(Error::Protocol(ProtocolError::WrongHttpVersion));
    }

    check_upgrade_headers(request.headers())
}

/// Build the `101 Switching Protocols` reply for the given `Sec-WebSocket-Key`.
pub fn response_bytes(request_key: &[u8]) -> Vec<u8> {
    format!(
        "\
        HTTP/1.1 101 Switching Protocols\r\n\
        Connection: Upgrade\r\n\
        Upgrade: websocket\r\n\
        Sec-WebSocket-Accept: {}\r\n\
        \r\n",
        derive_accept_key(request_key)
    )
    .into_bytes()
}

/// Validate the request and build the reply for it.
pub fn create_response(request: &Request) -> Result<Vec<u8>> {
    let key = validate_request(request)?;
    Ok(response_bytes(key))
}

impl TryParse for Request {
    fn try_parse(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut hbuffer);
        Ok(match req.parse(buf)? {
            Status::Partial => None,
            Status::Complete(size) => Some((size, Request::from_httparse(req)?)),
        })
    }
}

impl<'h, 'b: 'h> FromHttparse<httparse::Request<'h, 'b>> for Request {
    fn from_httparse(raw: httparse::Request<'h, 'b>) -> Result<Self> {
        if raw.method != Some("GET") {
            return Err(Error::Protocol(ProtocolError::WrongHttpMethod));
        }

        // httparse only knows HTTP/1.0 and HTTP/1.1.
        if raw.version != Some(1) {
            return Err(Error::Protocol(ProtocolError::WrongHttpVersion));
        }

        let headers = HeaderMap::from_httparse(raw.headers)?;

        let mut request = Request::new(());
        *request.method_mut() = Method::GET;
        *request.headers_mut() = headers;
        *request.uri_mut() = raw.path.unwrap_or("/").parse()?;
        *request.version_mut() = Version::HTTP_11;

        Ok(request)
    }
}

/// A complete upgrade request together with the bytes that followed it.
#[derive(Debug)]
pub struct ReceivedRequest {
    /// The parsed request.
    pub request: Request,
    /// Bytes received after the end of the request (pipelined frames).
    pub tail: Vec<u8>,
}

/// Accumulates an HTTP request from a non-blocking stream.
#[derive(Debug)]
pub struct RequestReader {
    buffer: ReadBuffer,
    headers: SharedHeaders,
    max_size: usize,
}

impl RequestReader {
    /// Create a reader publishing the parsed headers into `headers`.
    ///
    /// A request whose head grows past `max_size` bytes is refused.
    pub fn new(headers: SharedHeaders, max_size: usize) -> Self {
        RequestReader { buffer: ReadBuffer::new(), headers, max_size }
    }

    /// Number of bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Read from the stream until the request is complete or the stream would block.
    ///
    /// On completion the request headers are written to the shared header map.
    pub fn read_from<Stream: Read>(
        &mut self,
        stream: &mut Stream,
    ) -> Result<Option<ReceivedRequest>> {
        loop {
            if let Some((size, request)) = Request::try_parse(Buf::chunk(&self.buffer))? {
                if size > self.max_size {
                    return Err(Error::Capacity(CapacityError::HeaderTooLong));
                }
                self.buffer.advance(size);
                debug!("Received upgrade request for {}", request.uri());
                *self.headers.borrow_mut() = request.headers().clone();
                let tail = mem::take(&mut self.buffer).into_vec();
                return Ok(Some(ReceivedRequest { request, tail }));
            }

            if self.buffer.len() >= self.max_size {
                return Err(Error::Capacity(CapacityError::HeaderTooLong));
            }

            match self.buffer.read_from(stream) {
                Ok(0) if self.buffer.is_empty() => return Err(Error::ConnectionClosed),
                Ok(0) => return Err(Error::Protocol(ProtocolError::HandshakeIncomplete)),
                Ok(size) => trace!("read {size} request bytes"),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
                Err(err) => return Err(err.into()),
            }
        }
    }
}
