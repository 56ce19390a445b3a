//! Fuzz target for protocol message decoding
//!
//! The decoder must never panic on arbitrary input, only return Ok or Err.
//! Anything it accepts must encode and decode back to the same message.

#![no_main]

use libfuzzer_sys::fuzz_target;
use lanshare_core::Message;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = Message::decode_bytes(data) {
        let wire = message.encode().expect("decoded message must encode");
        assert_eq!(Message::decode(&wire).ok(), Some(message));
    }

    if let Ok(text) = std::str::from_utf8(data) {
        let _ = Message::decode(text);
    }
});
