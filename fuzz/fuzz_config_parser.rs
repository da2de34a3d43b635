//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! Feeds arbitrary text to `WhackctlConfig::parse()`, covering TOML decoding
//! and the keyword validation of every `[[conn]]` table.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = whackctl_config::WhackctlConfig::parse(s);
    }
});
