//! Fuzzer for the wire framing codec.
//!
//! Feeds arbitrary bytes to `WireMessage::decode` and checks:
//! - decoding never panics, whatever the input
//! - a successful decode consumes no more than the input
//! - re-encoding a decoded message reproduces the consumed bytes exactly

#![no_main]

use kiln_proto::WireMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok((message, consumed)) = WireMessage::decode(data) else {
        return;
    };

    assert!(consumed <= data.len());
    assert_eq!(consumed, WireMessage::HEADER_SIZE + message.body_len());

    let mut wire = Vec::new();
    message.encode(&mut wire).expect("decoded message must re-encode");
    assert_eq!(&wire, &data[..consumed]);
});
