//! TCP event source backed by `mio`.

use std::{io, net::SocketAddr, time::Duration};

use log::*;
use mio::{
    net::{TcpListener, TcpStream},
    Events, Poll, Token,
};

use super::{Dispatcher, DispatcherConfig, Event, EventSource, LISTENER};
use crate::{
    protocol::{Handler, Interest},
    util::NonBlockingResult,
};

impl From<Interest> for mio::Interest {
    fn from(interest: Interest) -> Self {
        match interest {
            Interest::Readable => mio::Interest::READABLE,
            Interest::Writable => mio::Interest::WRITABLE,
        }
    }
}

/// A listening TCP socket and its accepted streams, multiplexed with `mio`.
///
/// `mio` registrations are edge-triggered. Since a connection only ever
/// registers for the readiness it waits for and every event is followed by a
/// re-registration, each registration yields at most one event that the
/// dispatcher acts on.
#[derive(Debug)]
pub struct TcpEventSource {
    poll: Poll,
    events: Events,
    listener: TcpListener,
}

impl TcpEventSource {
    /// Bind a listener to `addr` and register it under [`LISTENER`].
    pub fn bind(addr: SocketAddr, events_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry().register(&mut listener, LISTENER, mio::Interest::READABLE)?;
        debug!("Listening on {}", listener.local_addr()?);
        Ok(TcpEventSource { poll, events: Events::with_capacity(events_capacity), listener })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl EventSource for TcpEventSource {
    type Stream = TcpStream;

    fn accept(&mut self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        self.listener.accept().no_block()
    }

    fn register(
        &mut self,
        stream: &mut TcpStream,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(stream, token, interest.into())
    }

    fn reregister(
        &mut self,
        stream: &mut TcpStream,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(stream, token, interest.into())
    }

    fn deregister(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        self.poll.registry().deregister(stream)
    }

    fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)?;
        events.extend(self.events.iter().map(|event| Event {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            // A half-closed stream still delivers its remaining data; reading it
            // reports the end of stream. Only a full hang-up or an error is one.
            hang_up: event.is_error() || (event.is_read_closed() && event.is_write_closed()),
        }));
        Ok(())
    }
}

impl<H: Handler> Dispatcher<TcpEventSource, H> {
    /// Bind a TCP listener and create a dispatcher serving it.
    pub fn bind(addr: SocketAddr, handler: H, config: DispatcherConfig) -> io::Result<Self> {
        let source = TcpEventSource::bind(addr, config.events_capacity)?;
        Ok(Dispatcher::new(source, handler, config))
    }

    /// The address the dispatcher listens on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.source().local_addr()
    }
}
