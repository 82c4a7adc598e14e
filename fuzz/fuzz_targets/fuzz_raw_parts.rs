//! Fuzz target for multipart segment lookup.
//!
//! Arbitrary (offset, length) spans must never panic or read past the body.

#![no_main]

use conformance_harness::protocol::{PartSpan, RawResponse};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (Vec<(usize, usize)>, Vec<u8>)| {
    let (spans, body) = data;
    let raw = RawResponse {
        http_status: 200,
        headers: Vec::new(),
        parts: spans.iter().map(|&(offset, len)| PartSpan { offset, len }).collect(),
        body,
    };

    for index in 0..=spans.len() {
        if let Some(part) = raw.part(index) {
            assert!(part.len() <= raw.body.len());
            assert_eq!(part.len(), spans[index].1);
        }
    }
});
