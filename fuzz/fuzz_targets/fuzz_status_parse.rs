//! Fuzz target for wire status parsing.
//!
//! Parsing arbitrary status text must never panic, and anything that parses
//! must map back to the same numeric code.

#![no_main]

use conformance_harness::{Command, Status};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u8, &str)| {
    let (selector, raw) = data;
    let command = Command::ALL[selector as usize % Command::ALL.len()];

    // Should never panic
    let Ok(status) = Status::parse(command, raw) else {
        return;
    };

    let code: u16 = raw.trim().parse().expect("parsed status is numeric");
    assert_eq!(status.code(command), Some(code));

    // Classification is total
    let _ = status.is_success();
    let _ = status.cursor_scope();
    let _ = status.is_transient();
});
