#![no_main]
#[macro_use] extern crate libfuzzer_sys;
extern crate wsreactor;

use std::{cell::RefCell, io::Cursor, rc::Rc};

use wsreactor::{handshake::server::RequestReader, http::HeaderMap};

fuzz_target!(|data: &[u8]| {
    let headers = Rc::new(RefCell::new(HeaderMap::new()));
    let mut reader = RequestReader::new(headers, 64 << 10);
    let _ = reader.read_from(&mut Cursor::new(data));
});
