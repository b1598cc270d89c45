//! Per-connection WebSocket protocol state machine.

pub mod frame;

mod handler;

pub use self::handler::{Acknowledge, Echo, Handler};

use std::{
    cell::{Ref, RefCell},
    collections::VecDeque,
    fmt,
    io::{Cursor, Read, Write},
    rc::Rc,
};

use bytes::Buf;
use http::HeaderMap;
use log::*;

use self::frame::{coding::OpCode, Frame, FrameCodec};
use crate::{
    error::{Error, ProtocolError, Result},
    handshake::{
        server::{create_response, ReceivedRequest, RequestReader},
        SharedHeaders,
    },
};

/// The configuration for a WebSocket connection.
///
/// # Example
/// ```
/// # use wsreactor::protocol::WebSocketConfig;
/// let conf = WebSocketConfig::default()
///     .max_frame_size(Some(64 << 10))
///     .accept_unmasked_frames(false);
/// ```
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct WebSocketConfig {
    /// The maximum size of an incoming frame payload. `None` means no size limit.
    /// The default value is 16 MiB. A frame announcing a bigger payload fails the
    /// connection before the payload is read.
    pub max_frame_size: Option<usize>,
    /// The maximum size of the HTTP upgrade request head. The default value is 64 KiB.
    pub max_handshake_size: usize,
    /// When set to `true`, the server will accept and handle unmasked frames
    /// from the client. According to the RFC 6455, the server must close the
    /// connection to the client in such cases, however it seems like there are
    /// some popular libraries that are sending unmasked frames, ignoring the RFC.
    /// By default this option is set to `false`, i.e. according to RFC 6455.
    pub accept_unmasked_frames: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_frame_size: Some(16 << 20),
            max_handshake_size: 64 << 10,
            accept_unmasked_frames: false,
        }
    }
}

impl WebSocketConfig {
    /// Set [`Self::max_frame_size`].
    pub fn max_frame_size(mut self, max_frame_size: Option<usize>) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Set [`Self::max_handshake_size`].
    pub fn max_handshake_size(mut self, max_handshake_size: usize) -> Self {
        self.max_handshake_size = max_handshake_size;
        self
    }

    /// Set [`Self::accept_unmasked_frames`].
    pub fn accept_unmasked_frames(mut self, accept_unmasked_frames: bool) -> Self {
        self.accept_unmasked_frames = accept_unmasked_frames;
        self
    }
}

/// The kind of readiness a connection is waiting for.
///
/// A connection waits for exactly one of the two at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Waiting for incoming data.
    Readable,
    /// Waiting for room to send data.
    Writable,
}

/// Lifecycle of a connection. Each phase owns the data only it needs.
pub enum ConnectionState {
    /// Reading the HTTP upgrade request.
    AwaitingHandshake(RequestReader),
    /// Sending the `101 Switching Protocols` response.
    HandshakeResponse(Cursor<Vec<u8>>),
    /// Exchanging frames.
    Connected,
    /// The close acknowledgement has been written; the connection is done.
    Closed,
}

impl ConnectionState {
    fn name(&self) -> &'static str {
        match self {
            ConnectionState::AwaitingHandshake(_) => "AwaitingHandshake",
            ConnectionState::HandshakeResponse(_) => "HandshakeResponse",
            ConnectionState::Connected => "Connected",
            ConnectionState::Closed => "Closed",
        }
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Server side of a single WebSocket connection.
///
/// The connection never blocks: every call reads or writes as much as the stream
/// allows and returns. After each call [`Connection::interest`] tells which kind
/// of readiness to wait for next.
#[derive(Debug)]
pub struct Connection<Stream> {
    stream: Stream,
    state: ConnectionState,
    interest: Interest,
    config: WebSocketConfig,
    codec: FrameCodec,
    /// Frames waiting to be written, in enqueue order.
    out_queue: VecDeque<Frame>,
    /// Headers of the upgrade request, filled in by the request reader.
    headers: SharedHeaders,
    /// A close frame has been received; nothing else is read.
    close_received: bool,
    /// A close frame has been queued; nothing else is sent.
    close_queued: bool,
}

impl<Stream> Connection<Stream> {
    /// Wrap a freshly accepted stream. The connection starts by reading the
    /// upgrade request.
    pub fn new(stream: Stream, config: WebSocketConfig) -> Self {
        let headers: SharedHeaders = Rc::new(RefCell::new(HeaderMap::new()));
        let reader = RequestReader::new(headers.clone(), config.max_handshake_size);
        Connection {
            stream,
            state: ConnectionState::AwaitingHandshake(reader),
            interest: Interest::Readable,
            config,
            codec: FrameCodec::new(),
            out_queue: VecDeque::new(),
            headers,
            close_received: false,
            close_queued: false,
        }
    }

    /// Returns a shared reference to the inner stream.
    pub fn get_ref(&self) -> &Stream {
        &self.stream
    }

    /// Returns a mutable reference to the inner stream.
    pub fn get_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }

    /// Consume the connection, returning the stream.
    pub fn into_inner(self) -> Stream {
        self.stream
    }

    /// The current phase.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// The readiness this connection waits for.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// The configuration in use.
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Whether the close acknowledgement has been written.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnectionState::Closed)
    }

    /// Headers of the upgrade request. Empty until the request has been read.
    pub fn request_headers(&self) -> Ref<'_, HeaderMap> {
        self.headers.borrow()
    }

    /// Frames queued and not yet handed to the stream.
    pub fn queued_frames(&self) -> impl Iterator<Item = &Frame> {
        self.out_queue.iter()
    }

    /// Queue a frame for sending.
    ///
    /// The frame is written on the next writable notification. Once a close frame
    /// has been queued, nothing else can be sent.
    pub fn send(&mut self, frame: Frame) -> Result<()> {
        match self.state {
            ConnectionState::Closed => return Err(Error::AlreadyClosed),
            _ if self.close_queued => {
                return Err(Error::Protocol(ProtocolError::SendAfterClosing));
            }
            _ => (),
        }
        self.enqueue(frame);
        Ok(())
    }

    /// Dispatch a decoded frame by its opcode, queueing whatever replies it calls for.
    ///
    /// Text goes to the handler; a ping is answered with a pong carrying the same
    /// payload; a close is acknowledged and stops reading. Binary and pong frames
    /// are ignored.
    pub fn dispatch<H: Handler + ?Sized>(&mut self, frame: Frame, handler: &mut H) -> Result<()> {
        // Fragmented messages are not supported: refuse them instead of handling
        // the first fragment as a whole message.
        if !frame.is_final() {
            return Err(Error::Protocol(ProtocolError::FragmentedFrame));
        }

        let opcode = frame.opcode();

        // All control frames MUST have a payload length of 125 bytes or less
        // and MUST NOT be fragmented. (RFC 6455)
        if opcode.is_control() && frame.payload().len() > 125 {
            return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
        }

        if self.close_received {
            trace!("Ignoring {opcode} frame received after close");
            return Ok(());
        }

        match opcode {
            OpCode::Text => {
                let mut replies = Vec::new();
                handler.on_text(frame.to_text()?, &mut replies);
                for reply in replies {
                    self.enqueue(reply);
                }
            }
            OpCode::Ping => {
                // Upon receipt of a Ping frame, an endpoint MUST send a Pong frame in
                // response, unless it already received a Close frame. (RFC 6455)
                self.enqueue(Frame::pong_for(&frame));
            }
            OpCode::Close => {
                debug!("Received close frame");
                self.close_received = true;
                if !self.close_queued {
                    self.enqueue(Frame::close_reply(&frame));
                }
            }
            OpCode::Binary | OpCode::Pong => {
                trace!("Ignoring {opcode} frame");
            }
        }

        Ok(())
    }

    fn enqueue(&mut self, frame: Frame) {
        if self.close_queued {
            trace!("Dropping {} frame queued after close", frame.opcode());
            return;
        }
        if frame.opcode() == OpCode::Close {
            self.close_queued = true;
        }
        self.out_queue.push_back(frame);
        if matches!(self.state, ConnectionState::Connected) {
            self.interest = Interest::Writable;
        }
    }
}

impl<Stream: Read + Write> Connection<Stream> {
    /// Handle a readable notification.
    ///
    /// Any error returned is fatal for this connection only. Running out of data
    /// is not an error: the call returns and waits for the next notification.
    pub fn on_readable<H: Handler + ?Sized>(&mut self, handler: &mut H) -> Result<()> {
        match self.state {
            ConnectionState::AwaitingHandshake(ref mut reader) => {
                if let Some(received) = reader.read_from(&mut self.stream)? {
                    self.accept_request(received)?;
                }
                Ok(())
            }
            ConnectionState::Connected => self.read_frames(handler),
            ConnectionState::HandshakeResponse(_) => {
                trace!("Readable while sending the handshake response, ignoring");
                Ok(())
            }
            ConnectionState::Closed => Err(Error::AlreadyClosed),
        }
    }

    /// Handle a writable notification.
    pub fn on_writable<H: Handler + ?Sized>(&mut self, handler: &mut H) -> Result<()> {
        match self.state {
            ConnectionState::HandshakeResponse(ref mut response) => {
                while response.has_remaining() {
                    match self.stream.write(Buf::chunk(response)) {
                        Ok(0) => return Err(Error::Protocol(ProtocolError::HandshakeIncomplete)),
                        Ok(size) => response.advance(size),
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            return Ok(());
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => (),
                        Err(err) => return Err(err.into()),
                    }
                }
                debug!("Handshake complete, connection established");
                self.state = ConnectionState::Connected;
                self.interest =
                    if self.out_queue.is_empty() { Interest::Readable } else { Interest::Writable };

                // Frames may have arrived together with the request.
                if self.codec.buffered_input() > 0 {
                    self.read_frames(handler)?;
                }
                Ok(())
            }
            ConnectionState::Connected => self.flush(),
            ConnectionState::AwaitingHandshake(_) => {
                trace!("Writable while reading the handshake request, ignoring");
                Ok(())
            }
            ConnectionState::Closed => Err(Error::AlreadyClosed),
        }
    }

    fn accept_request(&mut self, received: ReceivedRequest) -> Result<()> {
        let ReceivedRequest { request, tail } = received;
        let response = create_response(&request)?;
        self.codec = FrameCodec::from_partially_read(tail);
        // Dropping the reader drops the request buffer with it.
        self.state = ConnectionState::HandshakeResponse(Cursor::new(response));
        self.interest = Interest::Writable;
        Ok(())
    }

    /// Decode and dispatch frames until the buffered data runs out.
    fn read_frames<H: Handler + ?Sized>(&mut self, handler: &mut H) -> Result<()> {
        while !self.close_received {
            let frame = match self.codec.read_frame(&mut self.stream, self.config.max_frame_size)? {
                Some(frame) => frame,
                None => break,
            };

            // The server MUST close the connection upon receiving a
            // frame that is not masked. (RFC 6455)
            if !frame.is_masked() && !self.config.accept_unmasked_frames {
                return Err(Error::Protocol(ProtocolError::UnmaskedFrameFromClient));
            }

            self.dispatch(frame, handler)?;
        }
        Ok(())
    }

    /// Write out the queued frames in order.
    ///
    /// A frame that fails to write is logged and dropped; the remaining frames are
    /// still attempted.
    fn flush(&mut self) -> Result<()> {
        loop {
            if !self.codec.has_pending_output() {
                match self.out_queue.pop_front() {
                    Some(frame) => self.codec.buffer_frame(frame)?,
                    None => break,
                }
            }

            match self.codec.write_out(&mut self.stream) {
                Ok(true) => (),
                Ok(false) => {
                    trace!("Stream would block, {} frames still queued", self.out_queue.len());
                    return Ok(());
                }
                Err(err) => {
                    warn!("Failed to write frame: {err}");
                    self.codec.discard_output();
                }
            }
        }

        if self.close_queued {
            debug!("Close acknowledgement sent, closing connection");
            self.state = ConnectionState::Closed;
        } else {
            self.interest = Interest::Readable;
        }
        Ok(())
    }
}

impl<Stream> Connection<Stream> {
    /// Replace the state, returning the previous one.
    #[cfg(test)]
    fn replace_state(&mut self, state: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut self.state, state)
    }
}
