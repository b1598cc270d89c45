//! Single-threaded readiness dispatcher.
//!
//! A [`Dispatcher`] owns a listening socket and every accepted connection, all
//! multiplexed over one [`EventSource`]. Client sockets are registered for a
//! single interest at a time and each delivered event consumes the
//! registration: the dispatcher re-arms it with the connection's current
//! interest once the event has been handled. A connection that is never
//! re-armed receives no further events.

mod tcp;

pub use self::tcp::TcpEventSource;

pub use mio::Token;

use std::{
    collections::HashMap,
    fmt,
    io::{self, Read, Write},
    mem,
    net::SocketAddr,
    time::Duration,
};

use log::*;

use crate::{
    error::{Error, Result},
    protocol::{frame::Frame, Connection, Handler, Interest, WebSocketConfig},
    util::retry_interrupted,
};

/// Token of the listening socket. Client tokens start after it.
pub const LISTENER: Token = Token(0);

/// A readiness notification for one registered socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// The socket the event is for.
    pub token: Token,
    /// The socket can be read from.
    pub readable: bool,
    /// The socket can be written to.
    pub writable: bool,
    /// The peer hung up or the socket failed.
    pub hang_up: bool,
}

impl Event {
    /// A readable event.
    pub fn readable(token: Token) -> Self {
        Event { token, readable: true, writable: false, hang_up: false }
    }

    /// A writable event.
    pub fn writable(token: Token) -> Self {
        Event { token, readable: false, writable: true, hang_up: false }
    }

    /// A hang-up event.
    pub fn hang_up(token: Token) -> Self {
        Event { token, readable: false, writable: false, hang_up: true }
    }
}

/// Source of readiness notifications and of new connections.
///
/// Client registrations are edge-triggered and one-shot: after an event has been
/// delivered for a stream, nothing more is delivered for it until it is
/// re-registered.
pub trait EventSource {
    /// Stream type of the accepted connections.
    type Stream: Read + Write;

    /// Accept one pending connection. `Ok(None)` means none is pending.
    fn accept(&mut self) -> io::Result<Option<(Self::Stream, SocketAddr)>>;

    /// Start watching a stream.
    fn register(
        &mut self,
        stream: &mut Self::Stream,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    /// Re-arm a stream, possibly with a different interest.
    fn reregister(
        &mut self,
        stream: &mut Self::Stream,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    /// Stop watching a stream.
    fn deregister(&mut self, stream: &mut Self::Stream) -> io::Result<()>;

    /// Wait for events and append them to `events`.
    ///
    /// Blocks until at least one event is available or `timeout` expires.
    fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()>;
}

/// The configuration for a [`Dispatcher`].
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct DispatcherConfig {
    /// How many events a single poll may return. The default value is 1024.
    pub events_capacity: usize,
    /// How long [`Dispatcher::run`] waits in a single poll. `None`, the default,
    /// waits until something happens.
    pub poll_timeout: Option<Duration>,
    /// The maximum number of open connections. Connections accepted beyond it are
    /// dropped right away. `None`, the default, means no limit.
    pub max_connections: Option<usize>,
    /// Configuration of every accepted connection.
    pub websocket: WebSocketConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            events_capacity: 1024,
            poll_timeout: None,
            max_connections: None,
            websocket: WebSocketConfig::default(),
        }
    }
}

impl DispatcherConfig {
    /// Set [`Self::events_capacity`].
    pub fn events_capacity(mut self, events_capacity: usize) -> Self {
        self.events_capacity = events_capacity;
        self
    }

    /// Set [`Self::poll_timeout`].
    pub fn poll_timeout(mut self, poll_timeout: Option<Duration>) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Set [`Self::max_connections`].
    pub fn max_connections(mut self, max_connections: Option<usize>) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set [`Self::websocket`].
    pub fn websocket(mut self, websocket: WebSocketConfig) -> Self {
        self.websocket = websocket;
        self
    }
}

/// One-shot registration of a client socket.
///
/// Delivering an event disarms it; only [`Registration::arm`] makes the socket
/// eligible for events again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    interest: Interest,
    armed: bool,
}

impl Registration {
    /// A registration armed for `interest`.
    pub fn armed(interest: Interest) -> Self {
        Registration { interest, armed: true }
    }

    /// The interest the socket was last armed with.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Whether the socket may receive an event.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Consume the registration. Returns `false` if it was already consumed.
    pub fn disarm(&mut self) -> bool {
        mem::replace(&mut self.armed, false)
    }

    /// Arm again for `interest`.
    pub fn arm(&mut self, interest: Interest) {
        self.interest = interest;
        self.armed = true;
    }
}

struct Slot<Stream> {
    connection: Connection<Stream>,
    registration: Registration,
    peer: SocketAddr,
}

/// Drives every connection of a server from a single thread.
pub struct Dispatcher<S: EventSource, H> {
    source: S,
    handler: H,
    config: DispatcherConfig,
    connections: HashMap<Token, Slot<S::Stream>>,
    next_token: usize,
    events: Vec<Event>,
    /// Connections handled in the current batch, re-armed once it is done.
    handled: Vec<Token>,
}

impl<S: EventSource, H> fmt::Debug for Dispatcher<S, H> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("connections", &self.connections.len())
            .field("next_token", &self.next_token)
            .finish()
    }
}

impl<S: EventSource, H: Handler> Dispatcher<S, H> {
    /// Create a dispatcher over an event source whose listener is registered
    /// with [`LISTENER`].
    pub fn new(source: S, handler: H, config: DispatcherConfig) -> Self {
        Dispatcher {
            source,
            handler,
            events: Vec::with_capacity(config.events_capacity),
            config,
            connections: HashMap::new(),
            next_token: LISTENER.0 + 1,
            handled: Vec::new(),
        }
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is open.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Whether `token` belongs to an open connection.
    pub fn contains(&self, token: Token) -> bool {
        self.connections.contains_key(&token)
    }

    /// Tokens of all open connections.
    pub fn tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.connections.keys().copied()
    }

    /// The connection registered under `token`.
    pub fn connection(&self, token: Token) -> Option<&Connection<S::Stream>> {
        self.connections.get(&token).map(|slot| &slot.connection)
    }

    /// Address of the peer behind `token`.
    pub fn peer_addr(&self, token: Token) -> Option<SocketAddr> {
        self.connections.get(&token).map(|slot| slot.peer)
    }

    /// Whether the connection behind `token` is armed for its next event.
    pub fn is_armed(&self, token: Token) -> Option<bool> {
        self.connections.get(&token).map(|slot| slot.registration.is_armed())
    }

    /// The event source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// The event source, mutably.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// The text handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Queue a frame on a connection from outside its event handling.
    ///
    /// If the connection was waiting to read it is re-armed for writing.
    pub fn send(&mut self, token: Token, frame: Frame) -> Result<()> {
        let slot = self.connections.get_mut(&token).ok_or(Error::AlreadyClosed)?;
        slot.connection.send(frame)?;

        let interest = slot.connection.interest();
        if slot.registration.is_armed() && slot.registration.interest() != interest {
            slot.registration.arm(interest);
            if let Err(err) =
                self.source.reregister(slot.connection.get_mut(), token, interest)
            {
                warn!("Failed to re-register {token:?}: {err}");
                self.remove(token);
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Poll and handle events forever.
    ///
    /// Returns only if polling itself fails; errors of single connections are
    /// logged and close those connections.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.turn(self.config.poll_timeout)?;
        }
    }

    /// Poll once and handle the delivered batch of events.
    ///
    /// Connections are re-armed only after the whole batch has been handled, so a
    /// second event for the same token in one batch is dropped.
    ///
    /// Returns the number of events handled.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut events = mem::take(&mut self.events);
        events.clear();

        if let Err(err) = retry_interrupted(|| self.source.poll(&mut events, timeout)) {
            self.events = events;
            return Err(err);
        }

        trace!("Polled {} events", events.len());
        for event in &events {
            self.handle_event(*event);
        }

        let mut pending = mem::take(&mut self.handled);
        for token in pending.drain(..) {
            self.rearm(token);
        }
        self.handled = pending;

        let handled = events.len();
        self.events = events;
        Ok(handled)
    }

    fn handle_event(&mut self, event: Event) {
        let token = event.token;
        if token == LISTENER {
            self.accept_connections();
            return;
        }

        let Dispatcher { handler, connections, .. } = self;

        let Some(slot) = connections.get_mut(&token) else {
            trace!("Event for unknown token {token:?}");
            return;
        };

        if !slot.registration.disarm() {
            trace!("Dropping event for disarmed {token:?}");
            return;
        }

        if event.hang_up {
            debug!("Peer {} hung up", slot.peer);
            self.remove(token);
            return;
        }

        let connection = &mut slot.connection;
        let result = match connection.interest() {
            Interest::Readable if event.readable => connection.on_readable(handler),
            Interest::Writable if event.writable => connection.on_writable(handler),
            interest => {
                trace!("Spurious event for {token:?} waiting for {interest:?}");
                Ok(())
            }
        };

        match result {
            Ok(()) if connection.is_closed() => {
                debug!("Connection to {} closed", slot.peer);
                self.remove(token);
            }
            Ok(()) => self.handled.push(token),
            Err(Error::ConnectionClosed) => {
                debug!("Peer {} closed the connection", slot.peer);
                self.remove(token);
            }
            Err(err) => {
                warn!("Closing connection to {}: {err}", slot.peer);
                self.remove(token);
            }
        }
    }

    fn rearm(&mut self, token: Token) {
        let Some(slot) = self.connections.get_mut(&token) else {
            return;
        };

        let interest = slot.connection.interest();
        slot.registration.arm(interest);
        if let Err(err) = self.source.reregister(slot.connection.get_mut(), token, interest) {
            warn!("Failed to re-register {token:?}: {err}");
            self.remove(token);
        }
    }

    fn accept_connections(&mut self) {
        loop {
            let (stream, peer) = match self.source.accept() {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(err) if is_transient_accept_error(&err) => {
                    debug!("Error accepting connection: {err}");
                    continue;
                }
                Err(err) => {
                    // Connections still queued are accepted on the next listener event.
                    warn!("Error accepting connection: {err}");
                    break;
                }
            };

            if let Some(max) = self.config.max_connections {
                if self.connections.len() >= max {
                    warn!("Connection limit of {max} reached, dropping {peer}");
                    continue;
                }
            }

            let token = Token(self.next_token);
            self.next_token += 1;

            let mut connection = Connection::new(stream, self.config.websocket);
            if let Err(err) = self.source.register(connection.get_mut(), token, Interest::Readable)
            {
                warn!("Failed to register {peer}: {err}");
                continue;
            }

            debug!("Accepted {peer} as {token:?}");
            let registration = Registration::armed(Interest::Readable);
            self.connections.insert(token, Slot { connection, registration, peer });
        }
    }

    fn remove(&mut self, token: Token) {
        if let Some(mut slot) = self.connections.remove(&token) {
            if let Err(err) = self.source.deregister(slot.connection.get_mut()) {
                trace!("Failed to deregister {token:?}: {err}");
            }
            trace!("Removed {token:?}, {} connections left", self.connections.len());
        }
    }
}

/// Errors of a single pending connection; the next one may still be accepted.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_one_shot() {
        let mut reg = Registration::armed(Interest::Readable);
        assert!(reg.disarm());
        assert!(!reg.is_armed());
        assert!(!reg.disarm());

        reg.arm(Interest::Writable);
        assert!(reg.is_armed());
        assert_eq!(reg.interest(), Interest::Writable);
    }

    #[test]
    fn config_builder() {
        let config = DispatcherConfig::default()
            .max_connections(Some(2))
            .poll_timeout(Some(Duration::from_millis(10)));
        assert_eq!(config.max_connections, Some(2));
        assert_eq!(config.events_capacity, 1024);
    }
}
