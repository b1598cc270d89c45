//! Single-threaded, event-driven WebSocket server core.
//!
//! Every connection is a non-blocking state machine ([`Connection`]) driven by
//! readiness notifications from a [`Dispatcher`]. Text messages are handed to a
//! [`Handler`]; pings, closes and the opening handshake are answered by the
//! library.
//!
//! ```no_run
//! use wsreactor::{protocol::Acknowledge, reactor::DispatcherConfig, Dispatcher};
//!
//! let addr = "127.0.0.1:8080".parse().unwrap();
//! let config = DispatcherConfig::default();
//! let mut dispatcher = Dispatcher::bind(addr, Acknowledge::default(), config)?;
//! dispatcher.run()?;
//! # Ok::<(), std::io::Error>(())
//! ```
#![deny(
    missing_docs,
    missing_copy_implementations,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_must_use,
    unused_mut,
    unused_imports,
    unused_import_braces
)]

pub use http;

pub mod buffer;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod reactor;
pub mod util;

const READ_BUFFER_CHUNK_SIZE: usize = 4096;
type ReadBuffer = buffer::ReadBuffer<READ_BUFFER_CHUNK_SIZE>;

pub use crate::{
    error::{Error, Result},
    protocol::{
        frame::{coding::OpCode, Frame},
        Connection, Handler, Interest, WebSocketConfig,
    },
    reactor::{Dispatcher, DispatcherConfig, EventSource, TcpEventSource},
};
