use log::*;
use wsreactor::{protocol::Echo, Dispatcher, DispatcherConfig};

fn main() {
    env_logger::init();

    let addr = "127.0.0.1:9001".parse().unwrap();
    let config = DispatcherConfig::default().max_connections(Some(256));
    let mut dispatcher = Dispatcher::bind(addr, Echo, config).unwrap();

    if let Err(e) = dispatcher.run() {
        warn!("Error in dispatcher: {e}");
    }
}
