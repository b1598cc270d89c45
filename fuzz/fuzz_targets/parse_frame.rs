#![no_main]
#[macro_use] extern crate libfuzzer_sys;
extern crate wsreactor;

use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut cursor = Cursor::new(data);

    // A failed parse must leave the cursor untouched.
    if wsreactor::protocol::frame::Frame::parse(&mut cursor).is_err() {
        assert_eq!(cursor.position(), 0);
    }
});
