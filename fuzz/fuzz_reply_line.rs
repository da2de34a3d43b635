//! Fuzz target for daemon reply lines.
//!
//! Run with: cargo +nightly fuzz run fuzz_reply_line
//!
//! A reply line is untrusted input from the socket; parsing it must return
//! either a code or a protocol violation, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use whackctl_core::{ReplyCodes, ReplyLine};

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = ReplyLine::parse(data) {
        let _ = ReplyCodes::default().classify(line.code);
        let _ = line.text();
    }
});
