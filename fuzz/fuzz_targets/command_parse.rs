//! Fuzzer for the command grammar.
//!
//! Checks that `Command::parse` never panics on arbitrary text and that
//! every accepted command round-trips through `encode`.

#![no_main]

use kiln_proto::Command;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };

    let Ok(command) = Command::parse(line) else {
        return;
    };

    let encoded = command.encode();
    let reparsed = Command::parse(&encoded).expect("encoded command must reparse");
    assert_eq!(command, reparsed);
});
