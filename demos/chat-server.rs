//! Acknowledges every text message, like a chat backend that only confirms receipt.
//!
//! Listens on the address given as the first argument, `127.0.0.1:8080` by default.
use std::{env, net::SocketAddr};

use log::*;
use wsreactor::{protocol::Acknowledge, Dispatcher, DispatcherConfig};

fn main() {
    env_logger::init();

    let addr: SocketAddr = match env::args().nth(1).unwrap_or("127.0.0.1:8080".into()).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid listen address: {e}");
            return;
        }
    };

    let config = DispatcherConfig::default();
    let mut dispatcher = match Dispatcher::bind(addr, Acknowledge::default(), config) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!("Can't listen on {addr}: {e}");
            return;
        }
    };

    info!("Listening on {addr}");
    if let Err(e) = dispatcher.run() {
        error!("Polling failed: {e}");
    }
}
