//! Fuzz target for envelope decoding.
//!
//! Arbitrary bytes from the wire must never panic the decoder.

#![no_main]

use hive_agent::protocol;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let from_bytes = protocol::decode_bytes(data);

    // Text frames take the same path.
    if let Ok(text) = std::str::from_utf8(data) {
        let from_text = protocol::decode(text);
        assert_eq!(from_bytes.is_ok(), from_text.is_ok());
    }

    // Whatever decodes must encode again.
    if let Ok(envelope) = from_bytes {
        let _ = envelope.encode().expect("decoded envelope failed to encode");
    }
});
